pub mod ai;
pub mod api;
pub mod db;
pub mod engine;
pub mod error;
pub mod prompts;
pub mod repo;
pub mod sessions;

use std::sync::Arc;

pub type SharedDB = Arc<db::LinkDB>;

/// Run a blocking DB operation on tokio's blocking thread pool.
///
/// All synchronous LinkDB calls in async context MUST go through this
/// to avoid starving tokio worker threads.
pub async fn db_call<F, T>(db: &SharedDB, f: F) -> Result<T, error::LinkNestError>
where
    F: FnOnce(&db::LinkDB) -> T + Send + 'static,
    T: Send + 'static,
{
    let db = Arc::clone(db);
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| error::LinkNestError::Internal(e.to_string()))
}

#[derive(Clone)]
pub struct AppState {
    pub db: SharedDB,
    pub sessions: Arc<sessions::Sessions>,
    pub api_key: Option<String>,
    pub started_at: std::time::Instant,
}

impl AppState {
    /// Wire the SQLite repository, the optional AI backend and the session
    /// registry around one database.
    pub fn new(
        db: SharedDB,
        ai: Option<ai::AiConfig>,
        config: engine::EngineConfig,
        api_key: Option<String>,
    ) -> Self {
        let repo: Arc<dyn repo::LinkRepository> = Arc::new(repo::SqliteRepository::new(db.clone()));
        let ai = ai
            .filter(ai::AiConfig::has_llm)
            .map(|cfg| Arc::new(ai::OpenAiLinks::new(cfg, Some(db.clone()))) as Arc<dyn ai::LinkAi>);
        Self {
            db,
            sessions: Arc::new(sessions::Sessions::new(repo, ai, config)),
            api_key,
            started_at: std::time::Instant::now(),
        }
    }
}
