//! SQLite-backed link storage, per-user plans, and LLM usage accounting.

mod links;
mod usage;

pub use usage::{ComponentUsage, LlmUsageSummary};

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};

use crate::error::LinkNestError;

/// Set busy_timeout on every connection handed out by the pool.
/// Enrichment write-back and API inserts hit the same file concurrently.
#[derive(Debug)]
struct BusyTimeoutCustomizer;
impl r2d2::CustomizeConnection<rusqlite::Connection, rusqlite::Error> for BusyTimeoutCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(())
    }
}

type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

const MAX_URL_LEN: usize = 2048;
const MAX_TAGS_LEN: usize = 512;

/// One saved URL with its tags and AI-derived metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub id: String,
    pub url: String,
    /// Free-form, comma or whitespace separated.
    #[serde(default)]
    pub tags: String,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_title: Option<String>,
}

impl Link {
    pub fn tag_list(&self) -> Vec<&str> {
        split_tags(&self.tags)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewLink {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub tags: String,
}

impl NewLink {
    pub fn new(url: impl Into<String>, tags: impl Into<String>) -> Self {
        Self { url: url.into(), tags: tags.into() }
    }
}

/// Partial update. `None` leaves the column untouched; there is no way to
/// clear a field through this type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkFields {
    pub tags: Option<String>,
    pub description: Option<String>,
    pub group_title: Option<String>,
}

impl LinkFields {
    pub fn description(text: impl Into<String>) -> Self {
        Self { description: Some(text.into()), ..Default::default() }
    }

    pub fn group_title(title: impl Into<String>) -> Self {
        Self { group_title: Some(title.into()), ..Default::default() }
    }

    pub fn tags(tags: impl Into<String>) -> Self {
        Self { tags: Some(tags.into()), ..Default::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_none() && self.description.is_none() && self.group_title.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Pro,
}

impl Plan {
    /// Item cap for this plan; `None` means unlimited.
    pub fn max_items(self, free_limit: usize) -> Option<usize> {
        match self {
            Plan::Free => Some(free_limit),
            Plan::Pro => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Pro => "pro",
        }
    }
}

impl std::str::FromStr for Plan {
    type Err = LinkNestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" | "" => Ok(Plan::Free),
            "pro" => Ok(Plan::Pro),
            other => Err(LinkNestError::Validation(format!("unknown plan: {other}"))),
        }
    }
}

/// Split a free-form tags string on commas and whitespace.
pub fn split_tags(tags: &str) -> Vec<&str> {
    tags.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .collect()
}

pub fn validate_new_link(input: &NewLink) -> Result<(), LinkNestError> {
    let url = input.url.trim();
    if url.is_empty() {
        return Err(LinkNestError::EmptyUrl);
    }
    if url.chars().count() > MAX_URL_LEN {
        return Err(LinkNestError::Validation(format!("url too long (max {MAX_URL_LEN})")));
    }
    if input.tags.chars().count() > MAX_TAGS_LEN {
        return Err(LinkNestError::Validation(format!("tags too long (max {MAX_TAGS_LEN})")));
    }
    Ok(())
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS links (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    url TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,
    description TEXT,
    group_title TEXT
);

CREATE INDEX IF NOT EXISTS idx_links_user ON links(user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_links_url ON links(user_id, url);

CREATE TABLE IF NOT EXISTS profiles (
    user_id TEXT PRIMARY KEY,
    plan TEXT NOT NULL DEFAULT 'free'
);

CREATE TABLE IF NOT EXISTS llm_usage (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts INTEGER NOT NULL,
    component TEXT NOT NULL,
    model TEXT NOT NULL,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    duration_ms INTEGER NOT NULL DEFAULT 0
);
"#;

/// SQLite-backed link store.
pub struct LinkDB {
    pool: Pool<SqliteConnectionManager>,
}

impl LinkDB {
    fn conn(&self) -> Result<PooledConn, LinkNestError> {
        self.pool.get().map_err(|e| LinkNestError::Internal(format!("pool: {e}")))
    }

    /// Open (or create) a database at the given path.
    pub fn open(path: &str) -> Result<Self, LinkNestError> {
        let pool_size = if path == ":memory:" { 2 } else { 8 };
        let manager = if path == ":memory:" {
            // Shared cache so all pool connections see the same in-memory DB.
            let name = uuid::Uuid::new_v4().to_string();
            SqliteConnectionManager::file(format!("file:{name}?mode=memory&cache=shared"))
        } else {
            SqliteConnectionManager::file(path)
        };
        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_customizer(Box::new(BusyTimeoutCustomizer))
            .build(manager)
            .map_err(|e| LinkNestError::Internal(format!("pool: {e}")))?;

        let conn = pool.get().map_err(|e| LinkNestError::Internal(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        drop(conn);
        Ok(Self { pool })
    }

    pub fn plan_for(&self, user_id: &str) -> Result<Plan, LinkNestError> {
        let c = self.conn()?;
        let plan: Option<String> = match c.query_row(
            "SELECT plan FROM profiles WHERE user_id = ?1",
            [user_id],
            |r| r.get(0),
        ) {
            Ok(p) => Some(p),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };
        // Unknown values in the table degrade to the free plan.
        Ok(plan.and_then(|p| p.parse().ok()).unwrap_or_default())
    }

    pub fn set_plan(&self, user_id: &str, plan: Plan) -> Result<(), LinkNestError> {
        let c = self.conn()?;
        c.execute(
            "INSERT INTO profiles (user_id, plan) VALUES (?1, ?2) \
             ON CONFLICT(user_id) DO UPDATE SET plan = excluded.plan",
            rusqlite::params![user_id, plan.as_str()],
        )?;
        Ok(())
    }
}

fn row_to_link(row: &rusqlite::Row) -> rusqlite::Result<Link> {
    Ok(Link {
        id: row.get("id")?,
        url: row.get("url")?,
        tags: row.get("tags")?,
        created_at: row.get("created_at")?,
        // Empty strings never count as a populated enrichment field.
        description: row
            .get::<_, Option<String>>("description")?
            .filter(|s| !s.trim().is_empty()),
        group_title: row
            .get::<_, Option<String>>("group_title")?
            .filter(|s| !s.trim().is_empty()),
    })
}
