//! Grouped, filtered, sorted projection of the collection.
//!
//! `build_view` is a pure function of the collection and the UI controls:
//! same inputs, same output, inputs untouched.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::db::Link;

/// Group filter value meaning "no group filter".
pub const ALL_GROUPS: &str = "all";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SortBy {
    Oldest,
    Alphabetical,
    MostLinks,
    /// Most recent activity first. Unknown sort keys land here too.
    #[default]
    #[serde(other)]
    Recent,
}

/// The UI controls the view depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewQuery {
    #[serde(default, rename = "q")]
    pub search: String,
    #[serde(default = "all_groups")]
    pub group: String,
    #[serde(default)]
    pub sort: SortBy,
}

fn all_groups() -> String {
    ALL_GROUPS.to_string()
}

impl Default for ViewQuery {
    fn default() -> Self {
        Self { search: String::new(), group: all_groups(), sort: SortBy::Recent }
    }
}

impl ViewQuery {
    pub fn search(mut self, q: impl Into<String>) -> Self {
        self.search = q.into();
        self
    }

    pub fn group(mut self, g: impl Into<String>) -> Self {
        self.group = g.into();
        self
    }

    pub fn sort(mut self, s: SortBy) -> Self {
        self.sort = s;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupView {
    pub title: String,
    /// Max `created_at` over the links shown in this group.
    pub latest_at: i64,
    pub links: Vec<Link>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct View {
    pub groups: Vec<GroupView>,
    /// Every group title in the collection, for the group picker.
    pub all_groups: Vec<String>,
    /// Links without a group; never part of a group view.
    pub ungrouped: usize,
}

impl View {
    pub fn visible_ids(&self) -> HashSet<&str> {
        self.groups
            .iter()
            .flat_map(|g| g.links.iter().map(|l| l.id.as_str()))
            .collect()
    }
}

fn matches(link: &Link, needle: &str) -> bool {
    link.url.to_lowercase().contains(needle)
        || link
            .description
            .as_deref()
            .is_some_and(|d| d.to_lowercase().contains(needle))
        || link.tags.to_lowercase().contains(needle)
}

pub fn build_view(links: &[Link], query: &ViewQuery) -> View {
    // BTreeMap keeps the pre-sort order independent of hashing.
    let mut by_title: BTreeMap<&str, Vec<&Link>> = BTreeMap::new();
    let mut ungrouped = 0;
    for link in links {
        match link.group_title.as_deref() {
            Some(title) => by_title.entry(title).or_default().push(link),
            None => ungrouped += 1,
        }
    }
    let all_groups: Vec<String> = by_title.keys().map(|t| t.to_string()).collect();

    let selected = query.group.trim();
    // Blank text means no filter; otherwise the query is matched as typed.
    let needle = query.search.to_lowercase();
    let match_all = needle.trim().is_empty();

    let mut groups: Vec<GroupView> = by_title
        .into_iter()
        .filter(|(title, _)| selected.is_empty() || selected == ALL_GROUPS || *title == selected)
        .filter_map(|(title, members)| {
            let links: Vec<Link> = members
                .into_iter()
                .filter(|l| match_all || matches(l, &needle))
                .cloned()
                .collect();
            if links.is_empty() {
                return None;
            }
            let latest_at = links.iter().map(|l| l.created_at).max().unwrap_or(0);
            Some(GroupView { title: title.to_string(), latest_at, links })
        })
        .collect();

    // sort_by is stable; ties keep title order from the BTreeMap
    match query.sort {
        SortBy::Recent => groups.sort_by(|a, b| b.latest_at.cmp(&a.latest_at)),
        SortBy::Oldest => groups.sort_by(|a, b| a.latest_at.cmp(&b.latest_at)),
        SortBy::Alphabetical => groups.sort_by(|a, b| {
            a.title
                .to_lowercase()
                .cmp(&b.title.to_lowercase())
                .then_with(|| a.title.cmp(&b.title))
        }),
        SortBy::MostLinks => groups.sort_by(|a, b| b.links.len().cmp(&a.links.len())),
    }

    View { groups, all_groups, ungrouped }
}
