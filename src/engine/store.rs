//! Authoritative in-memory collection for one user.
//!
//! Every mutation that actually changes state bumps the revision and queues a
//! `StoreEvent`; the session drains the queue after each message and fans the
//! events out to the dispatcher, the view and the selection.

use std::collections::HashMap;

use serde::Serialize;

use crate::db::{split_tags, Link};
use crate::error::LinkNestError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Loaded,
    Inserted(String),
    Removed(Vec<String>),
    Described(String),
    /// Grouping write-back, keyed by URL; carries the ids it touched.
    Grouped { url: String, ids: Vec<String> },
    /// Manual group override from a bulk move.
    Moved(Vec<String>),
    Retagged(Vec<String>),
    /// Gaps filled from a persistence re-read.
    Resynced,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Stats {
    pub links: usize,
    pub groups: usize,
    pub tags: usize,
    pub undescribed: usize,
    pub ungrouped: usize,
}

#[derive(Debug, Default)]
pub struct ItemStore {
    items: Vec<Link>,
    revision: u64,
    events: Vec<StoreEvent>,
}

impl ItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Newest first.
    pub fn items(&self) -> &[Link] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn get(&self, id: &str) -> Option<&Link> {
        self.items.iter().find(|l| l.id == id)
    }

    fn changed(&mut self, event: StoreEvent) {
        self.revision += 1;
        self.events.push(event);
    }

    pub fn drain_events(&mut self) -> Vec<StoreEvent> {
        std::mem::take(&mut self.events)
    }

    /// Replace the collection wholesale, ordered by `created_at` descending.
    pub fn load(&mut self, mut links: Vec<Link>) {
        // stable: equal timestamps keep the persisted order
        links.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        self.items = links;
        self.changed(StoreEvent::Loaded);
    }

    /// Refuse when `len >= max_items`. The limit comes from the caller's plan.
    pub fn check_quota(&self, max_items: Option<usize>) -> Result<(), LinkNestError> {
        match max_items {
            Some(limit) if self.items.len() >= limit => Err(LinkNestError::QuotaExceeded { limit }),
            _ => Ok(()),
        }
    }

    /// Add an already-persisted link at its `created_at` position.
    pub fn insert(&mut self, link: Link) {
        let id = link.id.clone();
        let pos = self
            .items
            .iter()
            .position(|l| l.created_at <= link.created_at)
            .unwrap_or(self.items.len());
        self.items.insert(pos, link);
        self.changed(StoreEvent::Inserted(id));
    }

    /// Returns true if the description changed. Unknown ids and empty text
    /// are ignored; applying the same text twice is a no-op.
    pub fn apply_description(&mut self, id: &str, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        let Some(link) = self.items.iter_mut().find(|l| l.id == id) else {
            return false;
        };
        if link.description.as_deref() == Some(text) {
            return false;
        }
        link.description = Some(text.to_string());
        self.changed(StoreEvent::Described(id.to_string()));
        true
    }

    /// Set the group on every link stored under `url`. Returns how many
    /// links changed.
    pub fn apply_group_title(&mut self, url: &str, title: &str) -> usize {
        let title = title.trim();
        if title.is_empty() {
            return 0;
        }
        let mut ids = Vec::new();
        for link in self.items.iter_mut().filter(|l| l.url == url) {
            if link.group_title.as_deref() != Some(title) {
                link.group_title = Some(title.to_string());
                ids.push(link.id.clone());
            }
        }
        let n = ids.len();
        if n > 0 {
            self.changed(StoreEvent::Grouped { url: url.to_string(), ids });
        }
        n
    }

    /// Id-keyed group override used by bulk moves.
    pub fn move_to_group(&mut self, ids: &[String], title: &str) -> usize {
        let title = title.trim();
        if title.is_empty() {
            return 0;
        }
        let mut moved = Vec::new();
        for link in self.items.iter_mut().filter(|l| ids.contains(&l.id)) {
            if link.group_title.as_deref() != Some(title) {
                link.group_title = Some(title.to_string());
                moved.push(link.id.clone());
            }
        }
        let n = moved.len();
        if n > 0 {
            self.changed(StoreEvent::Moved(moved));
        }
        n
    }

    pub fn set_tags(&mut self, updates: &[(String, String)]) -> usize {
        let mut touched = Vec::new();
        for (id, tags) in updates {
            if let Some(link) = self.items.iter_mut().find(|l| &l.id == id) {
                if &link.tags != tags {
                    link.tags = tags.clone();
                    touched.push(id.clone());
                }
            }
        }
        let n = touched.len();
        if n > 0 {
            self.changed(StoreEvent::Retagged(touched));
        }
        n
    }

    pub fn remove(&mut self, ids: &[String]) -> usize {
        let before = self.items.len();
        self.items.retain(|l| !ids.contains(&l.id));
        let n = before - self.items.len();
        if n > 0 {
            self.changed(StoreEvent::Removed(ids.to_vec()));
        }
        n
    }

    /// Fill enrichment gaps from a persistence re-read. Only links known
    /// locally are touched, and a populated local field always wins: local
    /// state may be ahead of what was persisted, never behind it.
    pub fn resync(&mut self, persisted: Vec<Link>) -> bool {
        let by_id: HashMap<String, Link> =
            persisted.into_iter().map(|l| (l.id.clone(), l)).collect();
        let mut changed = false;
        for link in &mut self.items {
            let Some(p) = by_id.get(&link.id) else { continue };
            if link.description.is_none() && p.description.is_some() {
                link.description = p.description.clone();
                changed = true;
            }
            if link.group_title.is_none() && p.group_title.is_some() {
                link.group_title = p.group_title.clone();
                changed = true;
            }
        }
        if changed {
            self.changed(StoreEvent::Resynced);
        }
        changed
    }

    pub fn undescribed(&self) -> impl Iterator<Item = &Link> {
        self.items.iter().filter(|l| l.description.is_none())
    }

    pub fn ungrouped(&self) -> impl Iterator<Item = &Link> {
        self.items.iter().filter(|l| l.group_title.is_none())
    }

    pub fn stats(&self) -> Stats {
        let mut groups: Vec<&str> =
            self.items.iter().filter_map(|l| l.group_title.as_deref()).collect();
        groups.sort_unstable();
        groups.dedup();
        Stats {
            links: self.items.len(),
            groups: groups.len(),
            tags: self.items.iter().map(|l| l.tag_list().len()).sum(),
            undescribed: self.undescribed().count(),
            ungrouped: self.ungrouped().count(),
        }
    }
}

/// Append `extra` to a free-form tags string, skipping tags already present.
pub fn merge_tags(existing: &str, extra: &str) -> String {
    let mut out: Vec<&str> = split_tags(existing);
    for t in split_tags(extra) {
        if !out.contains(&t) {
            out.push(t);
        }
    }
    out.join(", ")
}
