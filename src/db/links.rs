//! Link CRUD operations.

use rusqlite::params;
use uuid::Uuid;

use super::*;

const LINK_COLS: &str = "id, url, tags, created_at, description, group_title";

impl LinkDB {
    pub fn insert(&self, user_id: &str, input: NewLink) -> Result<Link, LinkNestError> {
        validate_new_link(&input)?;
        let link = Link {
            id: Uuid::new_v4().to_string(),
            url: input.url.trim().to_string(),
            tags: input.tags.trim().to_string(),
            created_at: now_ms(),
            description: None,
            group_title: None,
        };
        let c = self.conn()?;
        c.execute(
            "INSERT INTO links (id, user_id, url, tags, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![link.id, user_id, link.url, link.tags, link.created_at],
        )?;
        tracing::debug!(id = %link.id, user = user_id, "link inserted");
        Ok(link)
    }

    /// All links for a user, newest first.
    pub fn list_by_user(&self, user_id: &str) -> Result<Vec<Link>, LinkNestError> {
        let c = self.conn()?;
        let mut stmt = c.prepare(&format!(
            "SELECT {LINK_COLS} FROM links WHERE user_id = ?1 \
             ORDER BY created_at DESC, rowid DESC"
        ))?;
        let rows = stmt
            .query_map([user_id], row_to_link)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get(&self, id: &str) -> Result<Option<Link>, LinkNestError> {
        let c = self.conn()?;
        let mut stmt = c.prepare(&format!("SELECT {LINK_COLS} FROM links WHERE id = ?1"))?;
        let mut rows = stmt.query_map([id], row_to_link)?;
        match rows.next() {
            Some(r) => Ok(Some(r?)),
            None => Ok(None),
        }
    }

    /// Returns false when no row has this id.
    pub fn update_fields(&self, id: &str, fields: &LinkFields) -> Result<bool, LinkNestError> {
        if fields.is_empty() {
            return Ok(self.get(id)?.is_some());
        }
        let c = self.conn()?;
        let n = c.execute(
            "UPDATE links SET tags = COALESCE(?2, tags), \
             description = COALESCE(?3, description), \
             group_title = COALESCE(?4, group_title) WHERE id = ?1",
            params![id, fields.tags, fields.description, fields.group_title],
        )?;
        Ok(n > 0)
    }

    /// URL-keyed update used by grouping write-back. Touches every row of the
    /// user that shares the URL.
    pub fn update_where_url(
        &self,
        user_id: &str,
        url: &str,
        fields: &LinkFields,
    ) -> Result<usize, LinkNestError> {
        if fields.is_empty() {
            return Ok(0);
        }
        let c = self.conn()?;
        let n = c.execute(
            "UPDATE links SET tags = COALESCE(?3, tags), \
             description = COALESCE(?4, description), \
             group_title = COALESCE(?5, group_title) WHERE user_id = ?1 AND url = ?2",
            params![user_id, url, fields.tags, fields.description, fields.group_title],
        )?;
        Ok(n)
    }

    pub fn delete(&self, user_id: &str, ids: &[String]) -> Result<usize, LinkNestError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut c = self.conn()?;
        let tx = c.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM links WHERE user_id = ?1 AND id = ?2")?;
            for id in ids {
                deleted += stmt.execute(params![user_id, id])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }
}
