//! Decides which enrichment work is due after a collection change.
//!
//! One state machine per pass kind, `Idle -> Running -> Idle`. At most one
//! batch per kind is outstanding; the two kinds are independent. Items that
//! fail (or that a grouping pass left ungrouped) are parked until some other
//! collection change happens, so a failing collaborator is never retried in a
//! tight loop.

use std::collections::HashSet;

use serde::Serialize;

use super::store::{ItemStore, StoreEvent};
use crate::db::Link;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PassState {
    #[default]
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    Describe,
    Group,
}

/// Work issued by one evaluation.
#[derive(Debug, Default)]
pub struct Work {
    /// Links to describe, if a description pass was started.
    pub describe: Option<Vec<Link>>,
    /// Full collection snapshot, if a grouping pass was started.
    pub group: Option<Vec<Link>>,
}

impl Work {
    pub fn is_empty(&self) -> bool {
        self.describe.is_none() && self.group.is_none()
    }
}

#[derive(Debug, Default)]
pub struct Dispatcher {
    describe: PassState,
    group: PassState,
    /// "description request outstanding" markers.
    in_flight: HashSet<String>,
    describe_parked: HashSet<String>,
    /// Ids sent with the running grouping pass.
    group_batch: HashSet<String>,
    /// A grouping-relevant change landed after the running pass took its
    /// snapshot.
    group_stale: bool,
    group_parked: HashSet<String>,
    describe_passes: u64,
    group_passes: u64,
}

impl Dispatcher {
    pub fn describe_state(&self) -> PassState {
        self.describe
    }

    pub fn group_state(&self) -> PassState {
        self.group
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn passes(&self) -> (u64, u64) {
        (self.describe_passes, self.group_passes)
    }

    /// React to a store event. A change that did not come from a pass's own
    /// write-back releases the items parked for that pass.
    pub fn observe(&mut self, event: &StoreEvent) {
        let (wakes_describe, wakes_group) = match event {
            StoreEvent::Loaded
            | StoreEvent::Inserted(_)
            | StoreEvent::Removed(_)
            | StoreEvent::Retagged(_) => (true, true),
            StoreEvent::Described(_) => (false, true),
            StoreEvent::Grouped { .. } | StoreEvent::Moved(_) => (true, false),
            StoreEvent::Resynced => (false, false),
        };
        if wakes_describe {
            self.describe_parked.clear();
        }
        if wakes_group {
            self.group_parked.clear();
            if self.group == PassState::Running {
                self.group_stale = true;
            }
        }
    }

    /// Start whatever is due and not already running.
    pub fn evaluate(&mut self, store: &ItemStore) -> Work {
        let mut work = Work::default();

        if self.describe == PassState::Idle {
            let batch: Vec<Link> = store
                .undescribed()
                .filter(|l| !self.describe_parked.contains(&l.id) && !self.in_flight.contains(&l.id))
                .cloned()
                .collect();
            if !batch.is_empty() {
                self.describe = PassState::Running;
                self.describe_passes += 1;
                self.in_flight.extend(batch.iter().map(|l| l.id.clone()));
                work.describe = Some(batch);
            }
        }

        if self.group == PassState::Idle {
            let due = store.ungrouped().any(|l| !self.group_parked.contains(&l.id));
            if due {
                self.group = PassState::Running;
                self.group_passes += 1;
                // The grouping request always carries the whole collection.
                let snapshot = store.items().to_vec();
                self.group_stale = false;
                self.group_batch = snapshot
                    .iter()
                    .filter(|l| l.group_title.is_none())
                    .map(|l| l.id.clone())
                    .collect();
                work.group = Some(snapshot);
            }
        }

        work
    }

    /// One description result landed.
    pub fn description_landed(&mut self, id: &str, ok: bool) {
        self.in_flight.remove(id);
        if !ok {
            self.describe_parked.insert(id.to_string());
        }
    }

    pub fn finish(&mut self, kind: PassKind, store: &ItemStore) {
        match kind {
            PassKind::Describe => {
                self.describe = PassState::Idle;
                // results that never arrived count as failures
                let lost: Vec<String> = self.in_flight.drain().collect();
                self.describe_parked.extend(lost);
            }
            PassKind::Group => {
                self.group = PassState::Idle;
                let batch = std::mem::take(&mut self.group_batch);
                // the pass worked from an outdated snapshot; nothing it left
                // ungrouped has been tried against the current collection
                if std::mem::take(&mut self.group_stale) {
                    self.group_parked.clear();
                    return;
                }
                self.group_parked = store
                    .ungrouped()
                    .filter(|l| batch.contains(&l.id))
                    .map(|l| l.id.clone())
                    .collect();
            }
        }
    }
}
