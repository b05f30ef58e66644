//! Async persistence seam the engine talks to.
//!
//! The engine never touches SQLite directly: everything goes through
//! `LinkRepository`, so sessions can run against an in-memory database, a
//! scripted test double, or the real file.

use async_trait::async_trait;

use crate::db::{Link, LinkFields, NewLink, Plan};
use crate::error::LinkNestError;
use crate::{db_call, SharedDB};

#[async_trait]
pub trait LinkRepository: Send + Sync {
    /// All links of a user, newest first.
    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Link>, LinkNestError>;

    async fn insert(&self, user_id: &str, input: NewLink) -> Result<Link, LinkNestError>;

    async fn update_fields(&self, id: &str, fields: LinkFields) -> Result<(), LinkNestError>;

    /// Update every link of the user stored under `url`.
    async fn update_where_url(
        &self,
        user_id: &str,
        url: &str,
        fields: LinkFields,
    ) -> Result<(), LinkNestError>;

    async fn delete(&self, user_id: &str, ids: Vec<String>) -> Result<usize, LinkNestError>;

    async fn plan_for(&self, user_id: &str) -> Result<Plan, LinkNestError>;
}

/// `LinkRepository` over the pooled SQLite store.
#[derive(Clone)]
pub struct SqliteRepository {
    db: SharedDB,
}

impl SqliteRepository {
    pub fn new(db: SharedDB) -> Self {
        Self { db }
    }
}

#[async_trait]
impl LinkRepository for SqliteRepository {
    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Link>, LinkNestError> {
        let user = user_id.to_string();
        db_call(&self.db, move |db| db.list_by_user(&user)).await?
    }

    async fn insert(&self, user_id: &str, input: NewLink) -> Result<Link, LinkNestError> {
        let user = user_id.to_string();
        db_call(&self.db, move |db| db.insert(&user, input)).await?
    }

    async fn update_fields(&self, id: &str, fields: LinkFields) -> Result<(), LinkNestError> {
        let id = id.to_string();
        let found = db_call(&self.db, move |db| db.update_fields(&id, &fields)).await??;
        if found {
            Ok(())
        } else {
            Err(LinkNestError::NotFound)
        }
    }

    async fn update_where_url(
        &self,
        user_id: &str,
        url: &str,
        fields: LinkFields,
    ) -> Result<(), LinkNestError> {
        let (user, url) = (user_id.to_string(), url.to_string());
        db_call(&self.db, move |db| db.update_where_url(&user, &url, &fields)).await??;
        Ok(())
    }

    async fn delete(&self, user_id: &str, ids: Vec<String>) -> Result<usize, LinkNestError> {
        let user = user_id.to_string();
        db_call(&self.db, move |db| db.delete(&user, &ids)).await?
    }

    async fn plan_for(&self, user_id: &str) -> Result<Plan, LinkNestError> {
        let user = user_id.to_string();
        db_call(&self.db, move |db| db.plan_for(&user)).await?
    }
}
