//! Grouping pass: the whole collection goes out in one request, a
//! `url -> group_title` list comes back.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::Enrichment;
use crate::ai::{extract_json_array, LinkAi, LinkDigest};
use crate::db::{Link, LinkFields};
use crate::repo::LinkRepository;

const MAX_TITLE_CHARS: usize = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupAssignment {
    pub url: String,
    pub group_title: String,
}

pub fn digest(link: &Link) -> LinkDigest {
    LinkDigest {
        url: link.url.clone(),
        tags: link.tags.clone(),
        description: link.description.clone(),
    }
}

/// Pull the assignment list out of a raw AI response.
///
/// `None` when no JSON array can be found at all. Entries without a url or
/// with a blank title are dropped; titles are trimmed and capped.
pub fn parse_assignments(raw: &str) -> Option<Vec<GroupAssignment>> {
    let json = extract_json_array(raw)?;
    let entries: Vec<serde_json::Value> = serde_json::from_str(json).ok()?;
    let parsed = entries
        .iter()
        .filter_map(|e| {
            let url = e.get("url")?.as_str()?.trim();
            let title = e.get("group_title")?.as_str()?.trim();
            if url.is_empty() || title.is_empty() {
                return None;
            }
            let title: String = title.chars().take(MAX_TITLE_CHARS).collect();
            Some(GroupAssignment { url: url.to_string(), group_title: title.trim_end().to_string() })
        })
        .collect();
    Some(parsed)
}

pub(super) async fn run_pass(
    ai: Arc<dyn LinkAi>,
    repo: Arc<dyn LinkRepository>,
    user_id: String,
    snapshot: Vec<Link>,
    tx: mpsc::UnboundedSender<Enrichment>,
) {
    let start = std::time::Instant::now();
    let digests: Vec<LinkDigest> = snapshot.iter().map(digest).collect();

    let raw = match ai.group(&digests).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!(links = digests.len(), error = %e, "grouping request failed");
            return;
        }
    };
    let Some(assignments) = parse_assignments(&raw) else {
        warn!(links = digests.len(), "grouping response had no usable list, nothing applied");
        return;
    };

    // titles for URLs that were never sent are ignored
    let known: HashSet<&str> = snapshot.iter().map(|l| l.url.as_str()).collect();
    let (assignments, unknown): (Vec<_>, Vec<_>) =
        assignments.into_iter().partition(|a| known.contains(a.url.as_str()));
    if !unknown.is_empty() {
        debug!(count = unknown.len(), "grouping returned unknown urls");
    }

    for a in &assignments {
        if let Err(e) = repo
            .update_where_url(&user_id, &a.url, LinkFields::group_title(&a.group_title))
            .await
        {
            warn!(url = %a.url, error = %e, "group write-back failed");
        }
    }

    info!(
        assigned = assignments.len(),
        links = digests.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "grouping pass complete"
    );
    let _ = tx.send(Enrichment::Grouped(assignments));
}
