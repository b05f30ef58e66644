//! Description pass: one AI call per link, run concurrently, each result
//! reported back to the session as its own message.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::Enrichment;
use crate::ai::{clean_description, LinkAi};
use crate::db::{Link, LinkFields};
use crate::repo::LinkRepository;

/// Describe every link in `batch`. A failed (or panicking) link never
/// cancels the others. `limit == 0` runs the whole batch at once.
pub(super) async fn run_pass(
    ai: Arc<dyn LinkAi>,
    repo: Arc<dyn LinkRepository>,
    batch: Vec<Link>,
    limit: usize,
    tx: mpsc::UnboundedSender<Enrichment>,
) {
    let total = batch.len();
    let limit = if limit == 0 { total.max(1) } else { limit };
    let start = std::time::Instant::now();

    let described = stream::iter(batch)
        .map(|link| {
            let (ai, repo, tx) = (ai.clone(), repo.clone(), tx.clone());
            async move {
                let text = match AssertUnwindSafe(describe_one(ai.as_ref(), repo.as_ref(), &link))
                    .catch_unwind()
                    .await
                {
                    Ok(text) => text,
                    Err(_) => {
                        warn!(id = %link.id, "describe panicked");
                        None
                    }
                };
                let ok = text.is_some();
                // receiver gone means the session shut down
                let _ = tx.send(Enrichment::Described { id: link.id, text });
                ok
            }
        })
        .buffer_unordered(limit)
        .fold(0usize, |n, ok| async move { n + usize::from(ok) })
        .await;

    info!(
        described,
        failed = total - described,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "description pass complete"
    );
}

async fn describe_one(ai: &dyn LinkAi, repo: &dyn LinkRepository, link: &Link) -> Option<String> {
    let raw = match ai.describe(&link.url).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!(id = %link.id, error = %e, "describe failed");
            return None;
        }
    };
    let Some(text) = clean_description(&raw) else {
        debug!(id = %link.id, "empty description, skipping");
        return None;
    };
    // local state may run ahead of persistence; the next resync is a no-op for it
    if let Err(e) = repo.update_fields(&link.id, LinkFields::description(&text)).await {
        warn!(id = %link.id, error = %e, "description write-back failed");
    }
    Some(text)
}
