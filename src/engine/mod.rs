//! Per-user enrichment and organisation engine.
//!
//! Each session is a tokio task that owns its `ItemStore`, `Dispatcher`,
//! `Selection` and current view. Callers talk to it through a cloneable
//! `SessionHandle` (bounded command channel, oneshot replies). Enrichment
//! passes run as separate tasks and report back over an unbounded result
//! channel; the session applies every result itself, one message at a time,
//! so all writes to the collection are serialized without locks.

pub mod describe;
pub mod dispatcher;
pub mod grouping;
pub mod selection;
pub mod store;
pub mod view;

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::ai::LinkAi;
use crate::db::{split_tags, validate_new_link, Link, LinkFields, NewLink};
use crate::error::LinkNestError;
use crate::repo::LinkRepository;

pub use dispatcher::{PassKind, PassState};
pub use grouping::GroupAssignment;
pub use selection::Selection;
pub use store::{merge_tags, ItemStore, Stats, StoreEvent};
pub use view::{build_view, GroupView, SortBy, View, ViewQuery, ALL_GROUPS};

use dispatcher::{Dispatcher, Work};

const COMMAND_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Item cap for the free plan.
    pub free_limit: usize,
    /// Max concurrent description requests per pass; 0 = unbounded.
    pub describe_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { free_limit: 50, describe_concurrency: 8 }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            free_limit: env_usize("LINKNEST_FREE_LIMIT").unwrap_or(d.free_limit),
            describe_concurrency: env_usize("LINKNEST_DESCRIBE_CONCURRENCY")
                .unwrap_or(d.describe_concurrency),
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}

/// Everything a session needs from the outside world.
#[derive(Clone)]
pub struct SessionContext {
    pub user_id: String,
    pub repo: Arc<dyn LinkRepository>,
    /// `None` disables enrichment; the collection still works.
    pub ai: Option<Arc<dyn LinkAi>>,
    pub config: EngineConfig,
}

/// "Pass in progress" indicator, republished after every message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentStatus {
    pub describing: PassState,
    pub grouping: PassState,
    /// Description requests still outstanding.
    pub in_flight: usize,
    pub undescribed: usize,
    pub ungrouped: usize,
    pub links: usize,
    pub revision: u64,
    pub describe_passes: u64,
    pub group_passes: u64,
}

impl EnrichmentStatus {
    pub fn in_progress(&self) -> bool {
        self.describing == PassState::Running || self.grouping == PassState::Running
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BulkAction {
    Delete,
    Move { group_title: String },
    Tag { tags: String },
}

impl BulkAction {
    fn name(&self) -> &'static str {
        match self {
            BulkAction::Delete => "delete",
            BulkAction::Move { .. } => "move",
            BulkAction::Tag { .. } => "tag",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkOutcome {
    pub action: &'static str,
    /// Ids the action was applied to, after pruning.
    pub ids: Vec<String>,
    pub affected: usize,
}

type Reply<T> = oneshot::Sender<Result<T, LinkNestError>>;

enum Command {
    Load(Reply<usize>),
    Insert { input: NewLink, reply: Reply<Link> },
    Links(Reply<Vec<Link>>),
    SetView { query: ViewQuery, reply: Reply<View> },
    View(Reply<View>),
    Toggle { id: String, reply: Reply<bool> },
    SelectAll(Reply<Vec<String>>),
    ClearSelection(Reply<()>),
    Selection(Reply<Vec<String>>),
    Bulk { action: BulkAction, reply: Reply<BulkOutcome> },
    Stats(Reply<Stats>),
}

/// Results coming back from enrichment tasks.
enum Enrichment {
    Described { id: String, text: Option<String> },
    Grouped(Vec<GroupAssignment>),
    /// Persisted state re-read after a pass.
    Resync(Vec<Link>),
    PassDone(PassKind),
}

struct Session {
    ctx: SessionContext,
    store: ItemStore,
    dispatcher: Dispatcher,
    selection: Selection,
    query: ViewQuery,
    view: View,
    view_dirty: bool,
    results_tx: mpsc::UnboundedSender<Enrichment>,
    status_tx: watch::Sender<EnrichmentStatus>,
}

impl Session {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut results: mpsc::UnboundedReceiver<Enrichment>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                Some(msg) = results.recv() => {
                    self.apply(msg);
                    self.settle();
                }
            }
        }
        debug!(user = %self.ctx.user_id, "session closed");
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Load(reply) => {
                let r = self.load().await;
                self.respond(reply, |_| r);
            }
            Command::Insert { input, reply } => {
                let r = self.insert(input).await;
                self.respond(reply, |_| r);
            }
            Command::Links(reply) => self.respond(reply, |s| Ok(s.store.items().to_vec())),
            Command::SetView { query, reply } => {
                if query != self.query {
                    self.query = query;
                    self.view_dirty = true;
                }
                self.respond(reply, |s| Ok(s.view.clone()));
            }
            Command::View(reply) => self.respond(reply, |s| Ok(s.view.clone())),
            Command::Toggle { id, reply } => {
                let r = self.toggle(&id);
                self.respond(reply, |_| r);
            }
            Command::SelectAll(reply) => {
                let visible: Vec<String> =
                    self.view.visible_ids().into_iter().map(String::from).collect();
                self.selection.select_all(visible);
                self.respond(reply, |s| Ok(s.selection.ids()));
            }
            Command::ClearSelection(reply) => {
                self.selection.clear();
                self.respond(reply, |_| Ok(()));
            }
            Command::Selection(reply) => self.respond(reply, |s| Ok(s.selection.ids())),
            Command::Bulk { action, reply } => {
                let r = self.bulk(action).await;
                self.respond(reply, |_| r);
            }
            Command::Stats(reply) => self.respond(reply, |s| Ok(s.store.stats())),
        }
    }

    /// Settle first so the caller observes the post-mutation state.
    fn respond<T>(
        &mut self,
        reply: Reply<T>,
        result: impl FnOnce(&Self) -> Result<T, LinkNestError>,
    ) {
        self.settle();
        if reply.send(result(self)).is_err() {
            debug!(user = %self.ctx.user_id, "caller went away before reply");
        }
    }

    fn apply(&mut self, msg: Enrichment) {
        match msg {
            Enrichment::Described { id, text } => {
                let ok = match text {
                    Some(text) => {
                        self.store.apply_description(&id, &text);
                        true
                    }
                    None => false,
                };
                self.dispatcher.description_landed(&id, ok);
            }
            Enrichment::Grouped(assignments) => {
                let touched: usize = assignments
                    .iter()
                    .map(|a| self.store.apply_group_title(&a.url, &a.group_title))
                    .sum();
                debug!(user = %self.ctx.user_id, assignments = assignments.len(), touched, "groups applied");
            }
            Enrichment::Resync(persisted) => {
                if self.store.resync(persisted) {
                    debug!(user = %self.ctx.user_id, "resync filled local gaps");
                }
            }
            Enrichment::PassDone(kind) => self.dispatcher.finish(kind, &self.store),
        }
    }

    /// Fan queued store events out to the dispatcher, the view and the
    /// selection, start due passes, then publish status.
    fn settle(&mut self) {
        let events = self.store.drain_events();
        for e in &events {
            self.dispatcher.observe(e);
        }
        if self.ctx.ai.is_some() {
            let work = self.dispatcher.evaluate(&self.store);
            self.start_passes(work);
        }
        if !events.is_empty() || self.view_dirty {
            self.view = build_view(self.store.items(), &self.query);
            self.view_dirty = false;
            let dropped = self.selection.prune(&self.view.visible_ids());
            if dropped > 0 {
                debug!(user = %self.ctx.user_id, dropped, "pruned selection");
            }
        }
        self.publish();
    }

    fn publish(&self) {
        let stats = self.store.stats();
        let (describe_passes, group_passes) = self.dispatcher.passes();
        self.status_tx.send_replace(EnrichmentStatus {
            describing: self.dispatcher.describe_state(),
            grouping: self.dispatcher.group_state(),
            in_flight: self.dispatcher.in_flight(),
            undescribed: stats.undescribed,
            ungrouped: stats.ungrouped,
            links: stats.links,
            revision: self.store.revision(),
            describe_passes,
            group_passes,
        });
    }

    fn start_passes(&self, work: Work) {
        if work.is_empty() {
            return;
        }
        let Some(ai) = self.ctx.ai.clone() else { return };
        let repo = self.ctx.repo.clone();

        if let Some(batch) = work.describe {
            debug!(user = %self.ctx.user_id, count = batch.len(), "starting description pass");
            let pass = describe::run_pass(
                ai.clone(),
                repo.clone(),
                batch,
                self.ctx.config.describe_concurrency,
                self.results_tx.clone(),
            );
            self.supervise(PassKind::Describe, pass);
        }
        if let Some(snapshot) = work.group {
            debug!(user = %self.ctx.user_id, count = snapshot.len(), "starting grouping pass");
            let pass = grouping::run_pass(
                ai,
                repo,
                self.ctx.user_id.clone(),
                snapshot,
                self.results_tx.clone(),
            );
            self.supervise(PassKind::Group, pass);
        }
    }

    /// Run a pass, then re-read persisted state and report completion. The
    /// done message is sent even if the pass panicked, so the dispatcher
    /// always returns to `Idle`.
    fn supervise<F>(&self, kind: PassKind, pass: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let repo = self.ctx.repo.clone();
        let user = self.ctx.user_id.clone();
        let tx = self.results_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::spawn(pass).await {
                warn!(user = %user, ?kind, error = %e, "enrichment pass aborted");
            }
            match repo.list_by_user(&user).await {
                Ok(links) => {
                    let _ = tx.send(Enrichment::Resync(links));
                }
                Err(e) => warn!(user = %user, ?kind, error = %e, "resync after pass failed"),
            }
            let _ = tx.send(Enrichment::PassDone(kind));
        });
    }

    async fn load(&mut self) -> Result<usize, LinkNestError> {
        let links = self.ctx.repo.list_by_user(&self.ctx.user_id).await?;
        let n = links.len();
        self.store.load(links);
        info!(user = %self.ctx.user_id, links = n, "session loaded");
        Ok(n)
    }

    /// Validation and quota run before anything is persisted; a refused
    /// insert leaves the collection untouched.
    async fn insert(&mut self, input: NewLink) -> Result<Link, LinkNestError> {
        validate_new_link(&input)?;
        let plan = self.ctx.repo.plan_for(&self.ctx.user_id).await?;
        self.store
            .check_quota(plan.max_items(self.ctx.config.free_limit))?;
        let link = self.ctx.repo.insert(&self.ctx.user_id, input).await?;
        self.store.insert(link.clone());
        info!(user = %self.ctx.user_id, id = %link.id, "link saved");
        Ok(link)
    }

    fn toggle(&mut self, id: &str) -> Result<bool, LinkNestError> {
        if !self.selection.contains(id) && !self.view.visible_ids().contains(id) {
            return Err(LinkNestError::NotFound);
        }
        Ok(self.selection.toggle(id))
    }

    async fn bulk(&mut self, action: BulkAction) -> Result<BulkOutcome, LinkNestError> {
        let dropped = self.selection.prune(&self.view.visible_ids());
        if dropped > 0 {
            debug!(user = %self.ctx.user_id, dropped, "pruned selection before bulk action");
        }
        let ids = self.selection.ids();
        let name = action.name();
        if ids.is_empty() {
            return Ok(BulkOutcome { action: name, ids, affected: 0 });
        }

        let affected = match action {
            BulkAction::Delete => {
                let n = self.ctx.repo.delete(&self.ctx.user_id, ids.clone()).await?;
                self.store.remove(&ids);
                n
            }
            BulkAction::Move { group_title } => {
                let title = group_title.trim();
                if title.is_empty() {
                    return Err(LinkNestError::Validation("group_title must not be empty".into()));
                }
                let mut done = Vec::with_capacity(ids.len());
                let mut failure = None;
                for id in &ids {
                    match self.ctx.repo.update_fields(id, LinkFields::group_title(title)).await {
                        Ok(()) => done.push(id.clone()),
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                // keep local state in line with what was persisted
                self.store.move_to_group(&done, title);
                if let Some(e) = failure {
                    return Err(e);
                }
                done.len()
            }
            BulkAction::Tag { tags } => {
                if split_tags(&tags).is_empty() {
                    return Err(LinkNestError::Validation("tags must not be empty".into()));
                }
                let updates: Vec<(String, String)> = ids
                    .iter()
                    .filter_map(|id| self.store.get(id).map(|l| (id.clone(), merge_tags(&l.tags, &tags))))
                    .collect();
                let mut done = Vec::with_capacity(updates.len());
                let mut failure = None;
                for (id, merged) in updates {
                    match self.ctx.repo.update_fields(&id, LinkFields::tags(merged.clone())).await {
                        Ok(()) => done.push((id, merged)),
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                self.store.set_tags(&done);
                if let Some(e) = failure {
                    return Err(e);
                }
                done.len()
            }
        };

        info!(user = %self.ctx.user_id, action = name, affected, "bulk action applied");
        self.selection.clear();
        Ok(BulkOutcome { action: name, ids, affected })
    }
}

/// Cloneable front door to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
    status: watch::Receiver<EnrichmentStatus>,
}

impl SessionHandle {
    /// Spawn the session task. The collection starts empty until `load`.
    pub fn spawn(ctx: SessionContext) -> Self {
        let (tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (results_tx, results) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(EnrichmentStatus::default());
        let session = Session {
            ctx,
            store: ItemStore::new(),
            dispatcher: Dispatcher::default(),
            selection: Selection::default(),
            query: ViewQuery::default(),
            view: View::default(),
            view_dirty: false,
            results_tx,
            status_tx,
        };
        tokio::spawn(session.run(commands, results));
        Self { tx, status }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, LinkNestError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| LinkNestError::SessionClosed)?;
        rx.await.map_err(|_| LinkNestError::SessionClosed)?
    }

    /// Replace the collection with the persisted one. Returns its size.
    pub async fn load(&self) -> Result<usize, LinkNestError> {
        self.request(Command::Load).await
    }

    pub async fn insert(
        &self,
        url: impl Into<String>,
        tags: impl Into<String>,
    ) -> Result<Link, LinkNestError> {
        let input = NewLink::new(url, tags);
        self.request(|reply| Command::Insert { input, reply }).await
    }

    /// Newest first.
    pub async fn links(&self) -> Result<Vec<Link>, LinkNestError> {
        self.request(Command::Links).await
    }

    /// Change the view controls and get the recomputed view back.
    pub async fn set_view(&self, query: ViewQuery) -> Result<View, LinkNestError> {
        self.request(|reply| Command::SetView { query, reply }).await
    }

    pub async fn view(&self) -> Result<View, LinkNestError> {
        self.request(Command::View).await
    }

    /// Only currently visible links can be selected.
    pub async fn toggle(&self, id: impl Into<String>) -> Result<bool, LinkNestError> {
        let id = id.into();
        self.request(|reply| Command::Toggle { id, reply }).await
    }

    pub async fn select_all(&self) -> Result<Vec<String>, LinkNestError> {
        self.request(Command::SelectAll).await
    }

    pub async fn clear_selection(&self) -> Result<(), LinkNestError> {
        self.request(Command::ClearSelection).await
    }

    pub async fn selection(&self) -> Result<Vec<String>, LinkNestError> {
        self.request(Command::Selection).await
    }

    pub async fn bulk(&self, action: BulkAction) -> Result<BulkOutcome, LinkNestError> {
        self.request(|reply| Command::Bulk { action, reply }).await
    }

    pub async fn stats(&self) -> Result<Stats, LinkNestError> {
        self.request(Command::Stats).await
    }

    pub fn status(&self) -> EnrichmentStatus {
        self.status.borrow().clone()
    }

    /// Wait until the published status satisfies `pred`.
    pub async fn wait_for(
        &self,
        pred: impl FnMut(&EnrichmentStatus) -> bool,
    ) -> Result<EnrichmentStatus, LinkNestError> {
        let mut rx = self.status.clone();
        let status = rx.wait_for(pred).await.map_err(|_| LinkNestError::SessionClosed)?;
        Ok(status.clone())
    }

    /// Wait until no pass is running.
    pub async fn settled(&self) -> Result<EnrichmentStatus, LinkNestError> {
        self.wait_for(|s| !s.in_progress()).await
    }
}
