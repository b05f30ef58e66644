//! Bulk-action selection set.

use std::collections::{BTreeSet, HashSet};

#[derive(Debug, Default, Clone)]
pub struct Selection {
    ids: BTreeSet<String>,
}

impl Selection {
    /// Flip membership; returns whether `id` is selected afterwards.
    pub fn toggle(&mut self, id: &str) -> bool {
        if self.ids.remove(id) {
            false
        } else {
            self.ids.insert(id.to_string());
            true
        }
    }

    /// Replace the set with exactly `visible`.
    pub fn select_all<I, S>(&mut self, visible: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = visible.into_iter().map(Into::into).collect();
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    /// Drop ids that are no longer visible. Returns how many were dropped.
    pub fn prune(&mut self, visible: &HashSet<&str>) -> usize {
        let before = self.ids.len();
        self.ids.retain(|id| visible.contains(id.as_str()));
        before - self.ids.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Sorted ids.
    pub fn ids(&self) -> Vec<String> {
        self.ids.iter().cloned().collect()
    }
}
