use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::time::{sleep, Instant};

use super::*;
use crate::errors::{Result, SyncError};

enum ScriptedResponse {
    Items(Vec<Value>),
    Fail(String),
    Gated(oneshot::Receiver<Result<Vec<Value>>>),
}

#[derive(Default)]
struct ScriptedFetcher {
    calls: Mutex<Vec<(ResourceKey, Instant)>>,
    responses: Mutex<HashMap<ResourceKey, VecDeque<ScriptedResponse>>>,
    mutations: Mutex<Vec<(String, Value)>>,
}

impl ScriptedFetcher {
    fn push(&self, key: &ResourceKey, response: ScriptedResponse) {
        self.responses
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .push_back(response);
    }

    fn gate(&self, key: &ResourceKey) -> oneshot::Sender<Result<Vec<Value>>> {
        let (tx, rx) = oneshot::channel();
        self.push(key, ScriptedResponse::Gated(rx));
        tx
    }

    fn calls_for(&self, key: &ResourceKey) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, at)| *at)
            .collect()
    }
}

#[async_trait]
impl ResourceFetcher for ScriptedFetcher {
    async fn load_resource(&self, key: &ResourceKey) -> Result<Vec<Value>> {
        let call_number = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((key.clone(), Instant::now()));
            calls.len()
        };
        let response = self
            .responses
            .lock()
            .unwrap()
            .get_mut(key)
            .and_then(|queue| queue.pop_front());
        match response {
            Some(ScriptedResponse::Items(items)) => Ok(items),
            Some(ScriptedResponse::Fail(message)) => Err(SyncError::fetch(message)),
            Some(ScriptedResponse::Gated(rx)) => rx
                .await
                .unwrap_or_else(|_| Err(SyncError::fetch("gate dropped"))),
            None => Ok(vec![json!({ "fetch": call_number })]),
        }
    }

    async fn mutate(&self, endpoint: &str, payload: Value) -> Result<Value> {
        self.mutations
            .lock()
            .unwrap()
            .push((endpoint.to_string(), payload));
        Ok(json!({ "ok": true }))
    }
}

#[derive(Default)]
struct RecordingStatus {
    lines: Mutex<Vec<String>>,
}

impl RecordingStatus {
    fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl StatusSink for RecordingStatus {
    fn report(&self, message: &str) {
        self.lines.lock().unwrap().push(message.to_string());
    }
}

#[derive(Default)]
struct RecordingObserver {
    views: Mutex<Vec<ResourceView>>,
}

impl SnapshotObserver for RecordingObserver {
    fn resource_changed(&self, view: &ResourceView) {
        self.views.lock().unwrap().push(view.clone());
    }
}

struct Harness {
    engine: SyncEngine,
    fetcher: Arc<ScriptedFetcher>,
    status: Arc<RecordingStatus>,
    observer: Arc<RecordingObserver>,
}

fn harness() -> Harness {
    harness_with(SyncConfig::default())
}

fn harness_with(config: SyncConfig) -> Harness {
    let fetcher = Arc::new(ScriptedFetcher::default());
    let status = Arc::new(RecordingStatus::default());
    let observer = Arc::new(RecordingObserver::default());
    let engine = SyncEngine::new(
        config,
        fetcher.clone(),
        status.clone(),
        observer.clone(),
    );
    Harness {
        engine,
        fetcher,
        status,
        observer,
    }
}

/// Lets spawned tasks run without moving the paused clock.
async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

fn items_of(engine: &SyncEngine, key: &ResourceKey) -> Option<Vec<Value>> {
    engine.snapshot(key).map(|s| s.items.clone())
}

// ─────────────────────────────────────────────────────────────────────────────
// ReloadScheduler behavior
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn two_requests_in_one_window_run_one_fetch_with_last_options() {
    let h = harness();
    let key = ResourceKey::stock("A");
    let t0 = Instant::now();

    assert!(matches!(
        h.engine.request_reload(&key, ReloadOptions::default()),
        ReloadDecision::ArmTimer { .. }
    ));
    sleep(Duration::from_millis(50)).await;
    h.engine.mark_dirty(&key, Some("unsaved local edit"));
    sleep(Duration::from_millis(50)).await;
    assert_eq!(
        h.engine.request_reload(&key, ReloadOptions::reconciling()),
        ReloadDecision::Coalesced
    );

    sleep(Duration::from_millis(1_000)).await;

    let calls = h.fetcher.calls_for(&key);
    assert_eq!(calls.len(), 1);
    let started = calls[0].duration_since(t0);
    assert!(started >= Duration::from_millis(600) && started < Duration::from_millis(610));
    // The t=100ms request was a reconciling read: applied, dirty kept.
    assert_eq!(items_of(&h.engine, &key), Some(vec![json!({"fetch": 1})]));
    assert!(h.engine.is_dirty(&key));
}

#[tokio::test(start_paused = true)]
async fn burst_of_invalidations_collapses_into_one_fetch() {
    let h = harness();
    for _ in 0..8 {
        h.engine.request_reload(&ResourceKey::Queue, ReloadOptions::default());
        sleep(Duration::from_millis(40)).await;
    }
    sleep(Duration::from_secs(2)).await;
    assert_eq!(h.fetcher.calls_for(&ResourceKey::Queue).len(), 1);
    assert_eq!(h.engine.reload_phase(&ResourceKey::Queue), ReloadPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn later_started_fetch_wins_regardless_of_completion_order() {
    let h = harness();
    let key = ResourceKey::Queue;
    let first = h.fetcher.gate(&key);
    let second = h.fetcher.gate(&key);

    h.engine.request_reload(&key, ReloadOptions::forced());
    settle().await;
    h.engine.request_reload(&key, ReloadOptions::forced());
    settle().await;
    assert_eq!(h.fetcher.calls_for(&key).len(), 2);

    second.send(Ok(vec![json!("fresh")])).unwrap();
    settle().await;
    first.send(Ok(vec![json!("stale")])).unwrap();
    settle().await;

    let snapshot = h.engine.snapshot(&key).expect("snapshot");
    assert_eq!(snapshot.items, vec![json!("fresh")]);
    assert_eq!(snapshot.sequence, SequenceToken(2));
    assert_eq!(h.engine.reload_phase(&key), ReloadPhase::Idle);
    assert_eq!(h.observer.views.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn dirty_resource_ignores_plain_reloads() {
    let h = harness();
    let key = ResourceKey::Rules;
    h.engine.apply_inline(&key, vec![json!({"rule": "no spam"})], false);
    h.engine.mark_dirty(&key, Some("unsaved local edit"));

    assert_eq!(
        h.engine.request_reload(&key, ReloadOptions::default()),
        ReloadDecision::DroppedDirty
    );
    sleep(Duration::from_secs(2)).await;

    assert!(h.fetcher.calls_for(&key).is_empty());
    assert_eq!(
        items_of(&h.engine, &key),
        Some(vec![json!({"rule": "no spam"})])
    );
    assert!(h.engine.is_dirty(&key));
}

#[tokio::test(start_paused = true)]
async fn edit_started_during_fetch_is_not_overwritten() {
    let h = harness();
    let key = ResourceKey::stock("main");
    let gate = h.fetcher.gate(&key);

    h.engine.request_reload(&key, ReloadOptions::default());
    sleep(Duration::from_millis(700)).await;
    assert!(h.engine.reload_phase(&key).is_executing());

    h.engine.mark_dirty(&key, Some("unsaved local edit"));
    gate.send(Ok(vec![json!("server")])).unwrap();
    settle().await;

    assert!(h.engine.snapshot(&key).is_none());
    assert_eq!(h.engine.reload_phase(&key), ReloadPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn forced_reload_overrides_dirty_guard_but_keeps_flag() {
    let h = harness();
    let key = ResourceKey::Queue;
    h.engine.mark_dirty(&key, None);

    assert_eq!(
        h.engine.request_reload(&key, ReloadOptions::forced()),
        ReloadDecision::ExecuteNow(ReloadOptions::forced())
    );
    settle().await;

    assert_eq!(items_of(&h.engine, &key), Some(vec![json!({"fetch": 1})]));
    assert!(h.engine.is_dirty(&key));
}

#[tokio::test(start_paused = true)]
async fn failed_fetch_keeps_snapshot_reports_and_does_not_wedge() {
    let h = harness();
    let key = ResourceKey::Comments;
    h.engine.apply_inline(&key, vec![json!("old comment")], false);
    h.fetcher
        .push(&key, ScriptedResponse::Fail("connection refused".to_string()));

    h.engine.request_reload(&key, ReloadOptions::default());
    sleep(Duration::from_secs(1)).await;

    assert_eq!(items_of(&h.engine, &key), Some(vec![json!("old comment")]));
    assert_eq!(
        h.status.lines(),
        vec!["comments: Fetch failed: connection refused".to_string()]
    );
    assert_eq!(h.engine.reload_phase(&key), ReloadPhase::Idle);

    h.fetcher.push(&key, ScriptedResponse::Items(vec![json!("new comment")]));
    h.engine.request_reload(&key, ReloadOptions::default());
    sleep(Duration::from_secs(1)).await;
    assert_eq!(items_of(&h.engine, &key), Some(vec![json!("new comment")]));
}

#[tokio::test(start_paused = true)]
async fn requests_during_fetch_drain_as_one_follow_up() {
    let h = harness();
    let key = ResourceKey::Logs;
    let gate = h.fetcher.gate(&key);

    h.engine.request_reload(&key, ReloadOptions::default());
    sleep(Duration::from_millis(700)).await;
    assert_eq!(
        h.engine.request_reload(&key, ReloadOptions::default()),
        ReloadDecision::Deferred
    );
    assert_eq!(
        h.engine.request_reload(&key, ReloadOptions::default()),
        ReloadDecision::Deferred
    );
    assert_eq!(
        h.engine.reload_phase(&key),
        ReloadPhase::ExecutingWithPending
    );

    gate.send(Ok(vec![json!("first")])).unwrap();
    settle().await;
    assert_eq!(h.engine.reload_phase(&key), ReloadPhase::Debouncing);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(h.fetcher.calls_for(&key).len(), 2);
    assert_eq!(h.engine.reload_phase(&key), ReloadPhase::Idle);
}

// ─────────────────────────────────────────────────────────────────────────────
// Push routing
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn push_for_dirty_stock_without_opt_in_changes_nothing() {
    let h = harness();
    let key = ResourceKey::stock("stockB");
    h.engine.apply_inline(&key, vec![json!("b1")], false);
    h.engine.mark_dirty(&key, Some("unsaved local edit"));

    h.engine.handle_push(&PushMessage::new(
        Some("stock"),
        r#"{"bucket":"stockB","items":["server"]}"#,
    ));
    h.engine
        .handle_push(&PushMessage::new(Some("stock"), r#"{"bucket":"stockB"}"#));
    sleep(Duration::from_secs(2)).await;

    assert_eq!(items_of(&h.engine, &key), Some(vec![json!("b1")]));
    assert!(h.fetcher.calls_for(&key).is_empty());
    assert!(h.status.lines().is_empty());
}

#[tokio::test(start_paused = true)]
async fn push_with_preserve_dirty_reconciles_without_clearing_flag() {
    let h = harness();
    let key = ResourceKey::stock("stockB");
    h.engine.mark_dirty(&key, None);

    h.engine.handle_push(&PushMessage::new(
        Some("stock"),
        r#"{"bucket":"stockB","items":[{"id":9,"status":"played"}],"preserveDirty":true}"#,
    ));

    assert_eq!(
        items_of(&h.engine, &key),
        Some(vec![json!({"id": 9, "status": "played"})])
    );
    assert!(h.engine.is_dirty(&key));
}

#[tokio::test(start_paused = true)]
async fn inline_push_supersedes_fetch_in_flight() {
    let h = harness();
    let key = ResourceKey::Queue;
    let gate = h.fetcher.gate(&key);
    h.engine.request_reload(&key, ReloadOptions::forced());
    settle().await;

    h.engine
        .handle_push(&PushMessage::new(None, r#"{"items":["pushed"]}"#));
    gate.send(Ok(vec![json!("fetched")])).unwrap();
    settle().await;

    assert_eq!(items_of(&h.engine, &key), Some(vec![json!("pushed")]));
    assert_eq!(h.engine.reload_phase(&key), ReloadPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn invalidation_push_schedules_debounced_reload() {
    let h = harness();
    h.engine
        .handle_push(&PushMessage::new(Some("system"), "{}"));
    assert_eq!(
        h.engine.reload_phase(&ResourceKey::SystemStatus),
        ReloadPhase::Debouncing
    );
    sleep(Duration::from_secs(1)).await;
    assert_eq!(h.fetcher.calls_for(&ResourceKey::SystemStatus).len(), 1);
}

struct ScriptedTransport {
    attempts: Mutex<Vec<Instant>>,
    outcomes: Mutex<VecDeque<Result<Vec<Result<PushMessage>>>>>,
}

#[async_trait]
impl PushTransport for ScriptedTransport {
    async fn connect(&self) -> Result<PushStream> {
        self.attempts.lock().unwrap().push(Instant::now());
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::push("connection refused")));
        outcome.map(|messages| futures::stream::iter(messages).boxed())
    }
}

#[tokio::test(start_paused = true)]
async fn push_reconnect_backs_off_and_resets_after_open() {
    let h = harness();
    h.engine.track(&ResourceKey::Queue);
    let transport = Arc::new(ScriptedTransport {
        attempts: Mutex::new(Vec::new()),
        outcomes: Mutex::new(VecDeque::from(vec![
            Err(SyncError::push("refused")),
            Err(SyncError::push("refused")),
            Err(SyncError::push("refused")),
            Ok(vec![Ok(PushMessage::new(Some("queue"), "{}"))]),
        ])),
    });
    let channel = PushChannel::new(h.engine.clone(), transport.clone());
    assert!(channel.start().await);
    assert!(!channel.start().await);

    sleep(Duration::from_secs(17)).await;
    channel.stop().await;

    let attempts = transport.attempts.lock().unwrap().clone();
    assert!(attempts.len() >= 5, "attempts: {}", attempts.len());
    let gaps: Vec<u64> = attempts
        .windows(2)
        .take(4)
        .map(|w| w[1].duration_since(w[0]).as_secs())
        .collect();
    assert_eq!(gaps, vec![2, 4, 8, 2]);

    // initial load plus one resync after the reconnect (the pushed
    // invalidation coalesces into the same window)
    assert_eq!(h.fetcher.calls_for(&ResourceKey::Queue).len(), 2);
    assert!(h
        .status
        .lines()
        .iter()
        .all(|line| line.starts_with("Push connection failed")));
}

#[tokio::test(start_paused = true)]
async fn missing_push_transport_degrades_to_polling() {
    let h = harness();
    h.engine.track(&ResourceKey::Queue);
    let channel = PushChannel::new(h.engine.clone(), Arc::new(UnavailablePushTransport));
    channel.start().await;
    assert!(channel.is_running().await);

    sleep(Duration::from_secs(25)).await;
    channel.stop().await;

    // first load, then polls at 10s and 20s
    assert_eq!(h.fetcher.calls_for(&ResourceKey::Queue).len(), 3);
    assert!(h.status.lines().is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Tracking, rename, latest-only
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn untracking_resets_transient_state() {
    let h = harness();
    let key = ResourceKey::stock("evening");
    h.engine.track(&key);
    h.engine.mark_dirty(&key, Some("unsaved local edit"));
    assert_eq!(h.engine.tracked_keys(), vec![key.clone()]);

    h.engine.untrack(&key);
    assert!(!h.engine.is_dirty(&key));
    assert_eq!(h.engine.reload_phase(&key), ReloadPhase::Idle);
    sleep(Duration::from_secs(1)).await;
    assert!(h.fetcher.calls_for(&key).is_empty());
    assert!(h.engine.tracked_keys().is_empty());
}

#[tokio::test(start_paused = true)]
async fn refresh_all_forces_every_tracked_resource() {
    let h = harness();
    h.engine.track(&ResourceKey::Queue);
    h.engine.track(&ResourceKey::Rules);
    h.engine.mark_dirty(&ResourceKey::Rules, None);

    h.engine.refresh_all();
    settle().await;

    assert_eq!(h.fetcher.calls_for(&ResourceKey::Queue).len(), 1);
    assert_eq!(h.fetcher.calls_for(&ResourceKey::Rules).len(), 1);
    // the debounced first loads were absorbed by the forced ones
    sleep(Duration::from_secs(1)).await;
    assert_eq!(h.fetcher.calls_for(&ResourceKey::Queue).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn discarding_edits_lets_server_state_back_in() {
    let h = harness();
    let key = ResourceKey::Rules;
    h.engine
        .apply_inline(&key, vec![json!({"id": "r1", "enabled": true})], false);
    h.engine.mark_dirty(&key, Some("toggled r1"));
    assert_eq!(
        h.engine.request_reload(&key, ReloadOptions::default()),
        ReloadDecision::DroppedDirty
    );

    h.engine.discard_edits(&key);
    assert!(!h.engine.is_dirty(&key));
    assert_eq!(h.engine.reload_phase(&key), ReloadPhase::Debouncing);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(h.fetcher.calls_for(&key).len(), 1);
    assert_eq!(items_of(&h.engine, &key), Some(vec![json!({"fetch": 1})]));
}

#[tokio::test(start_paused = true)]
async fn auto_refresh_reloads_tracked_resources_on_schedule() {
    let h = harness();
    h.engine.track(&ResourceKey::Logs);
    h.engine.track(&ResourceKey::Comments);
    h.engine.mark_dirty(&ResourceKey::Comments, None);
    let task = h.engine.spawn_periodic_reload(Duration::from_secs(30));

    sleep(Duration::from_secs(65)).await;
    task.abort();

    // first load, then ticks at 30s and 60s
    assert_eq!(h.fetcher.calls_for(&ResourceKey::Logs).len(), 3);
    // the first load lands after the edit began and is discarded; ticks are dropped
    assert_eq!(h.fetcher.calls_for(&ResourceKey::Comments).len(), 1);
    assert!(h.engine.snapshot(&ResourceKey::Comments).is_none());
}

#[tokio::test(start_paused = true)]
async fn renamed_stock_keeps_state_and_drops_old_results() {
    let h = harness();
    let old = ResourceKey::stock("old");
    let new = ResourceKey::stock("new");
    h.engine.track(&old);
    h.engine.apply_inline(&old, vec![json!("song")], false);
    let gate = h.fetcher.gate(&old);
    h.engine.request_reload(&old, ReloadOptions::forced());
    settle().await;

    h.engine.rename_stock("old", "new").unwrap();
    gate.send(Ok(vec![json!("late")])).unwrap();
    settle().await;

    assert!(h.engine.snapshot(&old).is_none());
    assert_eq!(items_of(&h.engine, &new), Some(vec![json!("song")]));
    assert_eq!(h.engine.tracked_keys(), vec![new.clone()]);
    assert!(matches!(
        h.engine.rename_stock("new", "  "),
        Err(SyncError::InvalidEdit(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn latest_only_drops_superseded_toggle_responses() {
    let h = harness();
    let (slow_tx, slow_rx) = oneshot::channel::<bool>();
    let (fast_tx, fast_rx) = oneshot::channel::<bool>();

    let slow = h.engine.latest_only("autoplay", async { slow_rx.await.unwrap() });
    let fast = async {
        settle().await;
        let result = h
            .engine
            .latest_only("autoplay", async { fast_rx.await.unwrap() })
            .await;
        slow_tx.send(true).unwrap();
        result
    };
    fast_tx.send(false).unwrap();

    let (slow_result, fast_result) = tokio::join!(slow, fast);
    assert_eq!(slow_result, None);
    assert_eq!(fast_result, Some(false));

    let shuffle = h.engine.latest_only("shuffle", async { 7 }).await;
    assert_eq!(shuffle, Some(7));
}

// ─────────────────────────────────────────────────────────────────────────────
// Optimistic edits
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn rejected_commit_restores_baseline_and_reports() {
    let h = harness();
    let coordinator: MutationCoordinator<String, i64> =
        MutationCoordinator::new(h.engine.clone(), ResourceKey::Queue);
    coordinator.set_baseline("song-1".to_string(), 3);

    let outcome = coordinator
        .apply_position_edit("song-1".to_string(), 5, |_| async {
            Err::<(), _>(SyncError::mutation("409 conflict"))
        })
        .await;

    assert!(matches!(outcome, EditOutcome::RolledBack { .. }));
    assert_eq!(coordinator.displayed(&"song-1".to_string()), Some(3));
    assert!(!coordinator.is_locked(&"song-1".to_string()));
    assert!(!h.engine.is_dirty(&ResourceKey::Queue));
    assert_eq!(h.status.lines().len(), 1);
    assert!(h.status.lines()[0].contains("409 conflict"));
}

#[tokio::test(start_paused = true)]
async fn committed_edit_becomes_baseline_and_triggers_reload() {
    let h = harness();
    let coordinator: MutationCoordinator<String, i64> =
        MutationCoordinator::new(h.engine.clone(), ResourceKey::Queue);
    coordinator.set_baseline("song-1".to_string(), 3);

    let engine = h.engine.clone();
    let outcome = coordinator
        .apply_position_edit("song-1".to_string(), 1, |position| async move {
            engine
                .mutate("queue/move", json!({ "id": "song-1", "position": position }))
                .await
                .map(|_| ())
        })
        .await;

    assert_eq!(outcome, EditOutcome::Committed);
    assert_eq!(coordinator.baseline(&"song-1".to_string()), Some(1));
    assert_eq!(
        h.fetcher.mutations.lock().unwrap()[0],
        (
            "queue/move".to_string(),
            json!({ "id": "song-1", "position": 1 })
        )
    );
    assert!(!h.engine.is_dirty(&ResourceKey::Queue));
    sleep(Duration::from_secs(1)).await;
    assert_eq!(h.fetcher.calls_for(&ResourceKey::Queue).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn position_below_one_is_rejected_without_network_call() {
    let h = harness();
    let coordinator: MutationCoordinator<String, i64> =
        MutationCoordinator::new(h.engine.clone(), ResourceKey::stock("main"));
    coordinator.set_baseline("song-2".to_string(), 4);

    let called = Arc::new(Mutex::new(false));
    let flag = called.clone();
    let outcome = coordinator
        .apply_position_edit("song-2".to_string(), 0, move |_| async move {
            *flag.lock().unwrap() = true;
            Ok::<(), SyncError>(())
        })
        .await;

    assert!(matches!(outcome, EditOutcome::Rejected { .. }));
    assert!(!*called.lock().unwrap());
    assert_eq!(coordinator.displayed(&"song-2".to_string()), Some(4));
    assert!(h.status.lines().is_empty());
}

#[tokio::test(start_paused = true)]
async fn second_edit_of_locked_item_is_refused() {
    let h = harness();
    let coordinator: MutationCoordinator<String, bool> =
        MutationCoordinator::new(h.engine.clone(), ResourceKey::Rules);
    coordinator.set_baseline("rule-1".to_string(), false);
    let (tx, rx) = oneshot::channel::<()>();

    let first = coordinator.apply_edit("rule-1".to_string(), true, |_| async move {
        rx.await.map_err(|_| SyncError::mutation("dropped"))
    });
    let second = async {
        settle().await;
        assert!(coordinator.is_locked(&"rule-1".to_string()));
        assert_eq!(coordinator.displayed(&"rule-1".to_string()), Some(true));
        let outcome = coordinator
            .apply_edit("rule-1".to_string(), false, |_| async {
                Ok::<(), SyncError>(())
            })
            .await;
        tx.send(()).unwrap();
        outcome
    };

    let (first, second) = tokio::join!(first, second);
    assert_eq!(first, EditOutcome::Committed);
    assert_eq!(second, EditOutcome::Busy);
    assert_eq!(coordinator.baseline(&"rule-1".to_string()), Some(true));
}

#[tokio::test(start_paused = true)]
async fn failed_batch_edit_rolls_back_every_selected_item() {
    let h = harness();
    let key = ResourceKey::stock("main");
    h.engine.mark_dirty(&key, Some("unsaved local edit"));
    let coordinator: MutationCoordinator<String, bool> =
        MutationCoordinator::new(h.engine.clone(), key.clone());
    coordinator.set_baseline("a".to_string(), false);
    coordinator.set_baseline("b".to_string(), true);

    let outcome = coordinator
        .apply_batch_edit(
            &["a".to_string(), "b".to_string(), "c".to_string()],
            true,
            |_| async { Err::<(), _>("server unavailable") },
        )
        .await;

    assert!(matches!(outcome, EditOutcome::RolledBack { .. }));
    assert_eq!(coordinator.displayed(&"a".to_string()), Some(false));
    assert_eq!(coordinator.displayed(&"b".to_string()), Some(true));
    assert_eq!(coordinator.displayed(&"c".to_string()), None);
    // a pre-existing unsaved edit is not the coordinator's to clear
    assert!(h.engine.is_dirty(&key));
}

#[tokio::test(start_paused = true)]
async fn overlapping_edits_keep_resource_dirty_until_last_settles() {
    let h = harness();
    let key = ResourceKey::Queue;
    h.engine.apply_inline(&key, vec![json!("local")], false);
    let coordinator = MutationCoordinator::<String, i64>::new(h.engine.clone(), key.clone());
    let (a_tx, a_rx) = oneshot::channel::<()>();
    let (b_tx, b_rx) = oneshot::channel::<()>();

    let edit_a = coordinator.apply_edit("a".to_string(), 2, |_| async move {
        a_rx.await.map_err(|_| SyncError::mutation("dropped"))
    });
    let edit_b = coordinator.apply_edit("b".to_string(), 3, |_| async move {
        b_rx.await.map_err(|_| SyncError::mutation("dropped"))
    });
    let driver = async {
        settle().await;
        assert!(h.engine.is_dirty(&key));
        a_tx.send(()).unwrap();
        settle().await;
        sleep(Duration::from_secs(1)).await;

        // "b" is still saving: the resource must stay protected
        assert!(coordinator.is_locked(&"b".to_string()));
        assert!(h.engine.is_dirty(&key));
        assert_eq!(items_of(&h.engine, &key), Some(vec![json!("local")]));
        assert!(h.fetcher.calls_for(&key).is_empty());
        b_tx.send(()).unwrap();
    };
    let (a, b, ()) = tokio::join!(edit_a, edit_b, driver);

    assert_eq!(a, EditOutcome::Committed);
    assert_eq!(b, EditOutcome::Committed);
    assert!(!h.engine.is_dirty(&key));
    sleep(Duration::from_secs(1)).await;
    assert_eq!(h.fetcher.calls_for(&key).len(), 1);
    assert_eq!(items_of(&h.engine, &key), Some(vec![json!({"fetch": 1})]));
}

#[tokio::test(start_paused = true)]
async fn edit_abandoned_by_timeout_is_rolled_back_and_unlocked() {
    let h = harness();
    let key = ResourceKey::Queue;
    let coordinator = MutationCoordinator::<String, i64>::new(h.engine.clone(), key.clone());
    coordinator.set_baseline("a".to_string(), 1);

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        coordinator.apply_edit("a".to_string(), 2, |_| {
            std::future::pending::<Result<()>>()
        }),
    )
    .await;

    assert!(result.is_err());
    assert!(!coordinator.is_locked(&"a".to_string()));
    assert_eq!(coordinator.displayed(&"a".to_string()), Some(1));
    assert_eq!(coordinator.baseline(&"a".to_string()), Some(1));
    assert!(!h.engine.is_dirty(&key));
    assert_eq!(
        h.status.lines(),
        vec!["queue: edit abandoned before the server answered".to_string()]
    );
    // the abandoned edit already asked for the server state
    assert_eq!(
        h.engine.request_reload(&key, ReloadOptions::default()),
        ReloadDecision::Coalesced
    );
    sleep(Duration::from_secs(1)).await;
    assert_eq!(h.fetcher.calls_for(&key).len(), 1);

    let outcome = coordinator
        .apply_edit("a".to_string(), 3, |_| async { Ok::<(), SyncError>(()) })
        .await;
    assert_eq!(outcome, EditOutcome::Committed);
}

#[tokio::test(start_paused = true)]
async fn reload_of_old_stock_name_after_rename_waits_full_quiet_period() {
    let h = harness();
    let old = ResourceKey::stock("old");
    h.engine.track(&old);
    sleep(Duration::from_millis(100)).await;
    h.engine.rename_stock("old", "new").unwrap();

    sleep(Duration::from_millis(100)).await;
    let start = Instant::now();
    assert!(matches!(
        h.engine.request_reload(&old, ReloadOptions::default()),
        ReloadDecision::ArmTimer { .. }
    ));

    // the timer armed before the rename is due now and must not fire this one
    sleep(Duration::from_millis(500)).await;
    assert!(h.fetcher.calls_for(&old).is_empty());

    sleep(Duration::from_millis(200)).await;
    let calls = h.fetcher.calls_for(&old);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].duration_since(start), Duration::from_millis(600));
}
