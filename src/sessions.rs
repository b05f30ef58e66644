//! Lazily spawned engine session per user.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::info;

use crate::ai::LinkAi;
use crate::engine::{EngineConfig, SessionContext, SessionHandle};
use crate::error::LinkNestError;
use crate::repo::LinkRepository;

/// Registry slot. The cell is filled once the initial load succeeds; callers
/// racing on a user's first request all wait on the same cell.
struct Slot {
    cell: Arc<OnceCell<SessionHandle>>,
    last_used: Instant,
}

impl Slot {
    fn new() -> Self {
        Self { cell: Arc::new(OnceCell::new()), last_used: Instant::now() }
    }
}

pub struct Sessions {
    repo: Arc<dyn LinkRepository>,
    ai: Option<Arc<dyn LinkAi>>,
    config: EngineConfig,
    live: Mutex<HashMap<String, Slot>>,
}

impl Sessions {
    pub fn new(
        repo: Arc<dyn LinkRepository>,
        ai: Option<Arc<dyn LinkAi>>,
        config: EngineConfig,
    ) -> Self {
        Self { repo, ai, config, live: Mutex::new(HashMap::new()) }
    }

    pub fn ai_enabled(&self) -> bool {
        self.ai.is_some()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Session for `user_id`, spawning and loading it on first use.
    ///
    /// The registry lock only covers the map lookup; the load itself runs
    /// outside it, so one user's first request never stalls another user.
    pub async fn get(&self, user_id: &str) -> Result<SessionHandle, LinkNestError> {
        let cell = {
            let mut live = self.live.lock();
            let slot = live.entry(user_id.to_string()).or_insert_with(Slot::new);
            if slot.cell.get().is_some_and(SessionHandle::is_closed) {
                *slot = Slot::new();
            }
            slot.last_used = Instant::now();
            slot.cell.clone()
        };

        let handle = cell
            .get_or_try_init(|| async {
                let handle = SessionHandle::spawn(SessionContext {
                    user_id: user_id.to_string(),
                    repo: self.repo.clone(),
                    ai: self.ai.clone(),
                    config: self.config.clone(),
                });
                let n = handle.load().await?;
                info!(user = user_id, links = n, "session started");
                Ok::<_, LinkNestError>(handle)
            })
            .await?;
        Ok(handle.clone())
    }

    /// Number of loaded sessions.
    pub fn live_count(&self) -> usize {
        self.live.lock().values().filter(|s| s.cell.initialized()).count()
    }

    /// Drop sessions unused for `max_idle` and sessions whose actor is gone.
    /// A session with an enrichment pass running is kept. Returns how many
    /// were dropped.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut live = self.live.lock();
        let before = live.len();
        live.retain(|_, slot| {
            let idle = now.duration_since(slot.last_used) >= max_idle;
            match slot.cell.get() {
                Some(h) if h.is_closed() => false,
                Some(h) => !idle || h.status().in_progress(),
                None => !idle,
            }
        });
        before - live.len()
    }
}
