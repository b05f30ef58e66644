use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use linknest::ai::{LinkAi, LinkDigest};
use linknest::db::{Link, LinkDB, LinkFields, NewLink, Plan};
use linknest::engine::{
    BulkAction, EngineConfig, EnrichmentStatus, PassState, SessionContext, SessionHandle,
    SortBy, ViewQuery,
};
use linknest::error::LinkNestError;
use linknest::repo::{LinkRepository, SqliteRepository};
use linknest::sessions::Sessions;
use linknest::SharedDB;
use tokio::sync::Semaphore;

const USER: &str = "u1";

// --- scripted collaborators ---

#[derive(Default)]
struct ScriptedAi {
    describe_calls: Mutex<HashMap<String, usize>>,
    group_calls: AtomicUsize,
    fail: HashSet<String>,
    panic_on: HashSet<String>,
    gate: Option<Arc<Semaphore>>,
    /// Describe calls currently waiting and the highest that ever got.
    active: AtomicUsize,
    peak: AtomicUsize,
    /// Raw grouping reply; `None` assigns every url to "Web".
    group_reply: Option<String>,
    group_gate: Option<Arc<Semaphore>>,
    /// Only title links that were sent with a description.
    group_only_described: bool,
}

impl ScriptedAi {
    fn calls_for(&self, url: &str) -> usize {
        self.describe_calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    fn total_describe_calls(&self) -> usize {
        self.describe_calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl LinkAi for ScriptedAi {
    async fn describe(&self, url: &str) -> Result<String, LinkNestError> {
        *self.describe_calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        if self.panic_on.contains(url) {
            panic!("scripted panic for {url}");
        }
        if self.fail.contains(url) {
            return Err(LinkNestError::AiBackend("scripted failure".into()));
        }
        Ok(format!("\"About {url}\""))
    }

    async fn group(&self, links: &[LinkDigest]) -> Result<String, LinkNestError> {
        self.group_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.group_gate {
            gate.acquire().await.unwrap().forget();
        }
        if let Some(reply) = &self.group_reply {
            return Ok(reply.clone());
        }
        let pairs: Vec<serde_json::Value> = links
            .iter()
            .filter(|l| !self.group_only_described || l.description.is_some())
            .map(|l| serde_json::json!({ "url": l.url, "group_title": "Web" }))
            .collect();
        Ok(format!(
            "Here you go:\n```json\n{}\n```",
            serde_json::to_string_pretty(&pairs).unwrap()
        ))
    }
}

/// Persistence that can be told to fail.
struct FlakyRepo {
    inner: SqliteRepository,
    fail_inserts: AtomicBool,
    fail_updates: AtomicBool,
    /// Hold `list_by_user` for one user until a permit arrives.
    list_gate: Option<(String, Arc<Semaphore>)>,
}

impl FlakyRepo {
    fn new(db: SharedDB) -> Self {
        Self {
            inner: SqliteRepository::new(db),
            fail_inserts: AtomicBool::new(false),
            fail_updates: AtomicBool::new(false),
            list_gate: None,
        }
    }
}

fn disk_full() -> LinkNestError {
    LinkNestError::Internal("disk full".into())
}

#[async_trait]
impl LinkRepository for FlakyRepo {
    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Link>, LinkNestError> {
        if let Some((user, gate)) = &self.list_gate {
            if user == user_id {
                gate.acquire().await.unwrap().forget();
            }
        }
        self.inner.list_by_user(user_id).await
    }

    async fn insert(&self, user_id: &str, input: NewLink) -> Result<Link, LinkNestError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(disk_full());
        }
        self.inner.insert(user_id, input).await
    }

    async fn update_fields(&self, id: &str, fields: LinkFields) -> Result<(), LinkNestError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(disk_full());
        }
        self.inner.update_fields(id, fields).await
    }

    async fn update_where_url(
        &self,
        user_id: &str,
        url: &str,
        fields: LinkFields,
    ) -> Result<(), LinkNestError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(disk_full());
        }
        self.inner.update_where_url(user_id, url, fields).await
    }

    async fn delete(&self, user_id: &str, ids: Vec<String>) -> Result<usize, LinkNestError> {
        self.inner.delete(user_id, ids).await
    }

    async fn plan_for(&self, user_id: &str) -> Result<Plan, LinkNestError> {
        self.inner.plan_for(user_id).await
    }
}

// --- helpers ---

fn test_db() -> SharedDB {
    Arc::new(LinkDB::open(":memory:").unwrap())
}

fn config(free_limit: usize) -> EngineConfig {
    EngineConfig { free_limit, describe_concurrency: 4 }
}

fn seed(db: &LinkDB, url: &str, tags: &str, desc: Option<&str>, group: Option<&str>) -> Link {
    let link = db.insert(USER, NewLink::new(url, tags)).unwrap();
    let fields = LinkFields {
        tags: None,
        description: desc.map(String::from),
        group_title: group.map(String::from),
    };
    if !fields.is_empty() {
        db.update_fields(&link.id, &fields).unwrap();
    }
    db.get(&link.id).unwrap().unwrap()
}

async fn start(
    repo: Arc<dyn LinkRepository>,
    ai: Option<Arc<ScriptedAi>>,
    config: EngineConfig,
) -> SessionHandle {
    let session = SessionHandle::spawn(SessionContext {
        user_id: USER.into(),
        repo,
        ai: ai.map(|a| a as Arc<dyn LinkAi>),
        config,
    });
    session.load().await.unwrap();
    session
}

async fn settle(session: &SessionHandle) -> EnrichmentStatus {
    tokio::time::timeout(Duration::from_secs(5), session.settled())
        .await
        .expect("engine did not settle")
        .unwrap()
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

fn find<'a>(links: &'a [Link], url: &str) -> &'a Link {
    links.iter().find(|l| l.url == url).unwrap()
}

// --- convergence ---

#[tokio::test]
async fn complete_collection_makes_no_ai_calls() {
    let db = test_db();
    seed(&db, "https://a.com", "", Some("docs"), Some("Docs"));
    seed(&db, "https://b.com", "", Some("video"), Some("Video"));
    let ai = Arc::new(ScriptedAi::default());
    let session = start(Arc::new(SqliteRepository::new(db)), Some(ai.clone()), config(50)).await;

    let status = settle(&session).await;
    assert_eq!(status.describe_passes, 0);
    assert_eq!(status.group_passes, 0);
    assert_eq!(ai.total_describe_calls(), 0);
    assert_eq!(ai.group_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn inserts_get_described_and_grouped() {
    let db = test_db();
    let ai = Arc::new(ScriptedAi::default());
    let session =
        start(Arc::new(SqliteRepository::new(db.clone())), Some(ai.clone()), config(50)).await;

    session.insert("https://a.com", "rust").await.unwrap();
    session.insert("  https://b.com  ", "").await.unwrap();
    let status = settle(&session).await;
    assert_eq!(status.undescribed, 0);
    assert_eq!(status.ungrouped, 0);
    assert_eq!(status.describing, PassState::Idle);

    let links = session.links().await.unwrap();
    assert_eq!(find(&links, "https://a.com").description.as_deref(), Some("About https://a.com"));
    assert_eq!(find(&links, "https://b.com").group_title.as_deref(), Some("Web"));

    // written back to persistence too
    let persisted = db.list_by_user(USER).unwrap();
    assert!(persisted.iter().all(|l| l.description.is_some() && l.group_title.is_some()));

    let view = session.view().await.unwrap();
    assert_eq!(view.groups.len(), 1);
    assert_eq!(view.groups[0].links.len(), 2);
}

#[tokio::test]
async fn no_second_batch_while_a_pass_is_running() {
    let db = test_db();
    let gate = Arc::new(Semaphore::new(0));
    let ai = Arc::new(ScriptedAi { gate: Some(gate.clone()), ..Default::default() });
    let session = start(Arc::new(SqliteRepository::new(db)), Some(ai.clone()), config(50)).await;

    session.insert("https://a.com", "").await.unwrap();
    session.insert("https://b.com", "").await.unwrap();
    session.insert("https://c.com", "").await.unwrap();

    let status = session.status();
    assert_eq!(status.describing, PassState::Running);
    assert_eq!(status.describe_passes, 1);
    assert_eq!(status.in_flight, 1);

    gate.add_permits(16);
    let status = settle(&session).await;
    assert_eq!(status.describe_passes, 2);
    assert_eq!(status.undescribed, 0);
    for url in ["https://a.com", "https://b.com", "https://c.com"] {
        assert_eq!(ai.calls_for(url), 1, "{url} described more than once");
    }
}

#[tokio::test]
async fn failed_description_is_isolated_and_not_self_retried() {
    let db = test_db();
    let ai = Arc::new(ScriptedAi {
        fail: ["https://bad.com".to_string()].into_iter().collect(),
        ..Default::default()
    });
    let session = start(Arc::new(SqliteRepository::new(db)), Some(ai.clone()), config(50)).await;

    session.insert("https://good.com", "").await.unwrap();
    session.insert("https://bad.com", "").await.unwrap();
    let status = settle(&session).await;
    assert_eq!(status.undescribed, 1);

    let links = session.links().await.unwrap();
    assert!(find(&links, "https://good.com").description.is_some());
    assert!(find(&links, "https://bad.com").description.is_none());

    // quiet collection: nothing retries on its own
    let attempts = ai.calls_for("https://bad.com");
    assert!(attempts >= 1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ai.calls_for("https://bad.com"), attempts);
    assert_eq!(session.status().describing, PassState::Idle);

    // an unrelated change makes it eligible again
    session.insert("https://other.com", "").await.unwrap();
    settle(&session).await;
    assert!(ai.calls_for("https://bad.com") > attempts);
}

#[tokio::test]
async fn panicking_describe_call_is_isolated() {
    let db = test_db();
    let ai = Arc::new(ScriptedAi {
        panic_on: ["https://boom.com".to_string()].into_iter().collect(),
        ..Default::default()
    });
    let session = start(Arc::new(SqliteRepository::new(db)), Some(ai.clone()), config(50)).await;

    session.insert("https://boom.com", "").await.unwrap();
    let status = settle(&session).await;
    assert_eq!(status.describing, PassState::Idle);
    assert_eq!(status.undescribed, 1);

    session.insert("https://fine.com", "").await.unwrap();
    settle(&session).await;
    let links = session.links().await.unwrap();
    assert!(find(&links, "https://fine.com").description.is_some());
}

#[tokio::test]
async fn description_calls_stay_under_the_concurrency_cap() {
    let db = test_db();
    for i in 0..6 {
        seed(&db, &format!("https://site{i}.com"), "", None, None);
    }
    let gate = Arc::new(Semaphore::new(0));
    let group_gate = Arc::new(Semaphore::new(0));
    let ai = Arc::new(ScriptedAi {
        gate: Some(gate.clone()),
        group_gate: Some(group_gate.clone()),
        ..Default::default()
    });
    let cfg = EngineConfig { free_limit: 50, describe_concurrency: 2 };
    let session = start(Arc::new(SqliteRepository::new(db)), Some(ai.clone()), cfg).await;

    eventually(|| ai.active.load(Ordering::SeqCst) == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ai.active.load(Ordering::SeqCst), 2);

    // both kinds run side by side
    let status = session.status();
    assert_eq!(status.describing, PassState::Running);
    assert_eq!(status.grouping, PassState::Running);
    assert_eq!(status.in_flight, 6);

    gate.add_permits(64);
    group_gate.add_permits(64);
    let status = settle(&session).await;
    assert_eq!(status.undescribed, 0);
    assert_eq!(status.ungrouped, 0);
    assert_eq!(ai.peak.load(Ordering::SeqCst), 2);
    assert_eq!(ai.total_describe_calls(), 6);
}

#[tokio::test]
async fn zero_concurrency_sends_the_whole_batch_at_once() {
    let db = test_db();
    for i in 0..5 {
        seed(&db, &format!("https://site{i}.com"), "", None, None);
    }
    let gate = Arc::new(Semaphore::new(0));
    let ai = Arc::new(ScriptedAi { gate: Some(gate.clone()), ..Default::default() });
    let cfg = EngineConfig { free_limit: 50, describe_concurrency: 0 };
    let session = start(Arc::new(SqliteRepository::new(db)), Some(ai.clone()), cfg).await;

    eventually(|| ai.active.load(Ordering::SeqCst) == 5).await;
    gate.add_permits(64);
    let status = settle(&session).await;
    assert_eq!(status.undescribed, 0);
    assert_eq!(ai.peak.load(Ordering::SeqCst), 5);
}

// --- grouping ---

#[tokio::test]
async fn grouping_reruns_when_a_description_lands_mid_pass() {
    let db = test_db();
    let group_gate = Arc::new(Semaphore::new(0));
    let ai = Arc::new(ScriptedAi {
        group_gate: Some(group_gate.clone()),
        group_only_described: true,
        ..Default::default()
    });
    let session = start(Arc::new(SqliteRepository::new(db)), Some(ai.clone()), config(50)).await;

    session.insert("https://a.com", "").await.unwrap();
    let status = tokio::time::timeout(
        Duration::from_secs(5),
        session.wait_for(|s| s.undescribed == 0),
    )
    .await
    .expect("description never landed")
    .unwrap();
    // the first grouping request went out before the description existed
    assert_eq!(status.grouping, PassState::Running);
    assert_eq!(status.group_passes, 1);

    group_gate.add_permits(8);
    let status = settle(&session).await;
    assert_eq!(status.ungrouped, 0);
    assert_eq!(status.group_passes, 2);
    assert_eq!(ai.group_calls.load(Ordering::SeqCst), 2);
    let links = session.links().await.unwrap();
    assert_eq!(links[0].group_title.as_deref(), Some("Web"));
}

#[tokio::test]
async fn group_title_lands_on_every_link_with_that_url() {
    let db = test_db();
    seed(&db, "https://same.com", "work", Some("one"), None);
    seed(&db, "https://same.com", "fun", Some("two"), None);
    seed(&db, "https://other.com", "", Some("three"), Some("Other"));
    let ai = Arc::new(ScriptedAi {
        group_reply: Some(
            r#"[{"url": "https://same.com", "group_title": "Tools"},
                {"url": "https://other.com", "group_title": "Other"}]"#
                .into(),
        ),
        ..Default::default()
    });
    let session =
        start(Arc::new(SqliteRepository::new(db.clone())), Some(ai.clone()), config(50)).await;

    let status = settle(&session).await;
    assert_eq!(status.ungrouped, 0);
    let links = session.links().await.unwrap();
    let same: Vec<&Link> = links.iter().filter(|l| l.url == "https://same.com").collect();
    assert_eq!(same.len(), 2);
    assert!(same.iter().all(|l| l.group_title.as_deref() == Some("Tools")));
    assert!(db
        .list_by_user(USER)
        .unwrap()
        .iter()
        .filter(|l| l.url == "https://same.com")
        .all(|l| l.group_title.as_deref() == Some("Tools")));
}

#[tokio::test]
async fn unparseable_grouping_reply_is_a_no_op() {
    let db = test_db();
    seed(&db, "https://a.com", "", Some("docs"), None);
    seed(&db, "https://b.com", "", Some("more docs"), None);
    let ai = Arc::new(ScriptedAi {
        group_reply: Some("Sorry, I can't help with grouping today.".into()),
        ..Default::default()
    });
    let session = start(Arc::new(SqliteRepository::new(db)), Some(ai.clone()), config(50)).await;

    let status = settle(&session).await;
    assert_eq!(status.ungrouped, 2);
    assert_eq!(status.grouping, PassState::Idle);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ai.group_calls.load(Ordering::SeqCst), 1);
}

// --- foreground errors ---

#[tokio::test]
async fn quota_refuses_insert_and_leaves_collection_alone() {
    let db = test_db();
    let session = start(Arc::new(SqliteRepository::new(db.clone())), None, config(2)).await;
    session.insert("https://a.com", "").await.unwrap();
    session.insert("https://b.com", "").await.unwrap();

    let err = session.insert("https://x.com", "").await.unwrap_err();
    assert!(matches!(err, LinkNestError::QuotaExceeded { limit: 2 }));
    assert_eq!(session.links().await.unwrap().len(), 2);
    assert_eq!(db.list_by_user(USER).unwrap().len(), 2);

    db.set_plan(USER, Plan::Pro).unwrap();
    session.insert("https://x.com", "").await.unwrap();
    assert_eq!(session.links().await.unwrap().len(), 3);
}

#[tokio::test]
async fn empty_url_is_rejected_before_persistence() {
    let db = test_db();
    let session = start(Arc::new(SqliteRepository::new(db.clone())), None, config(50)).await;
    let err = session.insert("   ", "tags").await.unwrap_err();
    assert!(matches!(err, LinkNestError::EmptyUrl));
    assert_eq!(db.list_by_user(USER).unwrap().len(), 0);
    assert!(session.links().await.unwrap().is_empty());
}

#[tokio::test]
async fn insert_persistence_failure_reaches_the_caller() {
    let db = test_db();
    let repo = Arc::new(FlakyRepo::new(db));
    let session = start(repo.clone(), None, config(50)).await;

    repo.fail_inserts.store(true, Ordering::SeqCst);
    let err = session.insert("https://a.com", "").await.unwrap_err();
    assert!(matches!(err, LinkNestError::Internal(_)));
    assert!(session.links().await.unwrap().is_empty());
}

#[tokio::test]
async fn write_back_failure_stays_silent_and_keeps_local_state() {
    let db = test_db();
    let repo = Arc::new(FlakyRepo::new(db.clone()));
    let ai = Arc::new(ScriptedAi::default());
    let session = start(repo.clone(), Some(ai), config(50)).await;

    repo.fail_updates.store(true, Ordering::SeqCst);
    session.insert("https://a.com", "").await.unwrap();
    let status = settle(&session).await;
    assert_eq!(status.undescribed, 0);
    assert_eq!(status.ungrouped, 0);

    // local state is ahead of persistence and the resync did not roll it back
    let local = session.links().await.unwrap();
    assert!(local[0].description.is_some());
    let persisted = db.list_by_user(USER).unwrap();
    assert!(persisted[0].description.is_none());
}

#[tokio::test]
async fn without_ai_the_engine_never_enriches() {
    let db = test_db();
    let session = start(Arc::new(SqliteRepository::new(db)), None, config(50)).await;
    session.insert("https://a.com", "").await.unwrap();
    let status = session.status();
    assert!(!status.in_progress());
    assert_eq!(status.undescribed, 1);
    assert_eq!(status.describe_passes, 0);
}

// --- selection and bulk actions ---

async fn enriched_session(db: &SharedDB) -> (SessionHandle, Link, Link) {
    let a = seed(db, "https://a.com", "work", Some("alpha docs"), Some("Docs"));
    let b = seed(db, "https://b.com", "", Some("beta video"), Some("Video"));
    let session = start(Arc::new(SqliteRepository::new(db.clone())), None, config(50)).await;
    (session, a, b)
}

#[tokio::test]
async fn filtered_out_selection_never_reaches_bulk_action() {
    let db = test_db();
    let (session, a, b) = enriched_session(&db).await;

    assert!(session.toggle(a.id.clone()).await.unwrap());
    assert!(session.toggle(b.id.clone()).await.unwrap());

    session.set_view(ViewQuery::default().search("beta")).await.unwrap();
    assert_eq!(session.selection().await.unwrap(), vec![b.id.clone()]);

    let outcome = session.bulk(BulkAction::Delete).await.unwrap();
    assert_eq!(outcome.ids, vec![b.id.clone()]);
    assert_eq!(outcome.affected, 1);

    let left = session.links().await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id, a.id);
    assert_eq!(db.list_by_user(USER).unwrap().len(), 1);
    assert!(session.selection().await.unwrap().is_empty());
}

#[tokio::test]
async fn bulk_move_and_tag_apply_to_selection() {
    let db = test_db();
    let (session, a, b) = enriched_session(&db).await;

    let selected = session.select_all().await.unwrap();
    assert_eq!(selected.len(), 2);
    let outcome = session
        .bulk(BulkAction::Move { group_title: "Favourites".into() })
        .await
        .unwrap();
    assert_eq!(outcome.affected, 2);
    let view = session.view().await.unwrap();
    assert_eq!(view.all_groups, vec!["Favourites"]);
    assert_eq!(
        db.get(&b.id).unwrap().unwrap().group_title.as_deref(),
        Some("Favourites")
    );

    session.toggle(a.id.clone()).await.unwrap();
    session.bulk(BulkAction::Tag { tags: "later, work".into() }).await.unwrap();
    assert_eq!(db.get(&a.id).unwrap().unwrap().tags, "work, later");
    let stats = session.stats().await.unwrap();
    assert_eq!(stats.tags, 2);
    assert_eq!(stats.groups, 1);
}

#[tokio::test]
async fn only_visible_links_can_be_toggled() {
    let db = test_db();
    let (session, a, _) = enriched_session(&db).await;
    let loose = seed(&db, "https://loose.com", "", None, None);
    session.load().await.unwrap();

    let err = session.toggle(loose.id).await.unwrap_err();
    assert!(matches!(err, LinkNestError::NotFound));
    let err = session.toggle("missing").await.unwrap_err();
    assert!(matches!(err, LinkNestError::NotFound));

    session.set_view(ViewQuery::default().group("Video")).await.unwrap();
    assert!(session.toggle(a.id).await.is_err());
}

#[tokio::test]
async fn empty_selection_bulk_is_a_no_op() {
    let db = test_db();
    let (session, _, _) = enriched_session(&db).await;
    let outcome = session.bulk(BulkAction::Delete).await.unwrap();
    assert_eq!(outcome.affected, 0);
    assert_eq!(session.links().await.unwrap().len(), 2);
}

#[tokio::test]
async fn view_controls_are_kept_between_calls() {
    let db = test_db();
    let (session, _, _) = enriched_session(&db).await;
    let v = session
        .set_view(ViewQuery::default().sort(SortBy::Alphabetical))
        .await
        .unwrap();
    let titles: Vec<&str> = v.groups.iter().map(|g| g.title.as_str()).collect();
    assert_eq!(titles, vec!["Docs", "Video"]);
    assert_eq!(session.view().await.unwrap(), v);
}

// --- registry ---

#[tokio::test]
async fn sessions_are_per_user_and_reused() {
    let db = test_db();
    seed(&db, "https://a.com", "", None, None);
    let repo: Arc<dyn LinkRepository> = Arc::new(SqliteRepository::new(db));
    let sessions = Sessions::new(repo, None, config(50));

    let u1 = sessions.get(USER).await.unwrap();
    let u2 = sessions.get("someone-else").await.unwrap();
    assert_eq!(u1.links().await.unwrap().len(), 1);
    assert!(u2.links().await.unwrap().is_empty());

    u2.insert("https://mine.com", "").await.unwrap();
    let again = sessions.get("someone-else").await.unwrap();
    assert_eq!(again.links().await.unwrap().len(), 1);
    assert_eq!(sessions.live_count(), 2);
}

#[tokio::test]
async fn slow_first_load_does_not_block_other_users() {
    let db = test_db();
    let gate = Arc::new(Semaphore::new(0));
    let mut repo = FlakyRepo::new(db);
    repo.list_gate = Some(("slow".into(), gate.clone()));
    let sessions = Arc::new(Sessions::new(Arc::new(repo), None, config(50)));

    let slow = tokio::spawn({
        let sessions = sessions.clone();
        async move { sessions.get("slow").await.map(|_| ()) }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let other = tokio::time::timeout(Duration::from_secs(1), sessions.get(USER))
        .await
        .expect("another user's load held the registry");
    assert!(other.is_ok());
    assert!(!slow.is_finished());

    gate.add_permits(1);
    slow.await.unwrap().unwrap();
    assert_eq!(sessions.live_count(), 2);
}

#[tokio::test]
async fn idle_sessions_are_evicted_and_reloaded_on_demand() {
    let db = test_db();
    seed(&db, "https://a.com", "", None, None);
    let sessions = Sessions::new(Arc::new(SqliteRepository::new(db.clone())), None, config(50));

    let first = sessions.get(USER).await.unwrap();
    assert_eq!(sessions.evict_idle(Duration::from_secs(3600)), 0);
    assert_eq!(sessions.evict_idle(Duration::ZERO), 1);
    assert_eq!(sessions.live_count(), 0);
    drop(first);

    seed(&db, "https://b.com", "", None, None);
    let again = sessions.get(USER).await.unwrap();
    assert_eq!(again.links().await.unwrap().len(), 2);
    assert_eq!(sessions.live_count(), 1);
}
