//! The synchronization engine: cache, scheduler and sequence guard behind one lock.
//!
//! All decisions happen while holding the state lock and never across an
//! await point, so each decision is atomic with respect to the others.
//! Collaborators (fetcher, observer, status sink) are always called with the
//! lock released.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::push_router::{route_push_message, PushMessage, PushRoute};
use super::reload_scheduler::{ReloadDecision, ReloadPhase, ReloadScheduler};
use super::resource_cache::ResourceCache;
use super::resource_model::{ReloadOptions, ResourceKey, ResourceSnapshot, ResourceView};
use super::sequence_guard::{SequenceGuard, SequenceToken};
use super::sync_config::SyncConfig;
use crate::errors::{Result, SyncError};

/// Loads resources from and sends mutations to the server.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn load_resource(&self, key: &ResourceKey) -> Result<Vec<serde_json::Value>>;

    async fn mutate(&self, endpoint: &str, payload: serde_json::Value)
        -> Result<serde_json::Value>;

    /// Names of the stock lists known to the server.
    async fn list_stocks(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Single-line sink for human-readable failure text.
pub trait StatusSink: Send + Sync {
    fn report(&self, message: &str);
}

/// Render collaborator, invoked after every accepted snapshot or dirty change.
pub trait SnapshotObserver: Send + Sync {
    fn resource_changed(&self, view: &ResourceView);
}

#[derive(Debug, Default)]
struct EngineState {
    cache: ResourceCache,
    scheduler: ReloadScheduler,
    guard: SequenceGuard,
    tracked: BTreeSet<ResourceKey>,
}

impl EngineState {
    fn begin_reload(&mut self, key: &ResourceKey) -> SequenceToken {
        let token = self.guard.start_operation(&key.reload_class());
        self.scheduler.begin_execution(key, token);
        token
    }

    /// Stores a fetched result if it is still the freshest and the dirty
    /// guard allows it.
    fn accept_fetched(
        &mut self,
        key: &ResourceKey,
        items: Vec<serde_json::Value>,
        options: ReloadOptions,
        token: SequenceToken,
    ) -> Option<ResourceView> {
        if !self.guard.finish(&key.reload_class(), token) {
            debug!("[Sync] Discarding stale reload {} of {}", token, key);
            return None;
        }
        if self.cache.is_dirty(key) && !options.may_overwrite_dirty() {
            debug!(
                "[Sync] Discarding reload {} of {}: resource became dirty while fetching",
                token, key
            );
            return None;
        }
        self.cache.set(key, ResourceSnapshot::new(items, token));
        Some(self.cache.view(key))
    }
}

struct EngineInner {
    config: SyncConfig,
    fetcher: Arc<dyn ResourceFetcher>,
    status: Arc<dyn StatusSink>,
    observer: Arc<dyn SnapshotObserver>,
    state: Mutex<EngineState>,
}

/// Cheaply cloneable handle to one engine instance.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        fetcher: Arc<dyn ResourceFetcher>,
        status: Arc<dyn StatusSink>,
        observer: Arc<dyn SnapshotObserver>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                fetcher,
                status,
                observer,
                state: Mutex::new(EngineState::default()),
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, view: &ResourceView) {
        self.inner.observer.resource_changed(view);
    }

    /// Writes a failure to the status sink as one line.
    pub fn report_error(&self, message: &str) {
        let line = message
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        warn!("[Sync] {}", line);
        self.inner.status.report(&line);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Cache access
    // ─────────────────────────────────────────────────────────────────────

    pub fn snapshot(&self, key: &ResourceKey) -> Option<Arc<ResourceSnapshot>> {
        self.state().cache.get(key)
    }

    pub fn view(&self, key: &ResourceKey) -> ResourceView {
        self.state().cache.view(key)
    }

    pub fn is_dirty(&self, key: &ResourceKey) -> bool {
        self.state().cache.is_dirty(key)
    }

    pub fn reload_phase(&self, key: &ResourceKey) -> ReloadPhase {
        self.state().scheduler.phase(key)
    }

    pub fn mark_dirty(&self, key: &ResourceKey, reason: Option<&str>) {
        let view = {
            let mut state = self.state();
            state.cache.mark_dirty(key, reason.map(str::to_string));
            state.cache.view(key)
        };
        self.notify(&view);
    }

    /// Marks `key` dirty only when it is clean; returns whether it did.
    pub fn mark_dirty_if_clean(&self, key: &ResourceKey, reason: &str) -> bool {
        let view = {
            let mut state = self.state();
            if state.cache.is_dirty(key) {
                return false;
            }
            state.cache.mark_dirty(key, Some(reason.to_string()));
            state.cache.view(key)
        };
        self.notify(&view);
        true
    }

    /// Clears the dirty flag after a successful save.
    pub fn clear_dirty(&self, key: &ResourceKey) -> bool {
        let view = {
            let mut state = self.state();
            if !state.cache.clear_dirty(key) {
                return false;
            }
            state.cache.view(key)
        };
        self.notify(&view);
        true
    }

    /// Abandons local edits and lets the server state back in.
    pub fn discard_edits(&self, key: &ResourceKey) {
        if self.clear_dirty(key) {
            debug!("[Sync] Discarded local edits of {}", key);
        }
        self.request_reload(key, ReloadOptions::default());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Tracked resources
    // ─────────────────────────────────────────────────────────────────────

    /// Marks the view of `key` active and requests its first load.
    pub fn track(&self, key: &ResourceKey) {
        let newly_tracked = self.state().tracked.insert(key.clone());
        if newly_tracked {
            self.request_reload(key, ReloadOptions::default());
        }
    }

    /// Marks the view of `key` inactive and drops its transient state.
    pub fn untrack(&self, key: &ResourceKey) {
        let view = {
            let mut state = self.state();
            state.tracked.remove(key);
            state.scheduler.reset(key);
            if state.cache.clear_dirty(key) {
                Some(state.cache.view(key))
            } else {
                None
            }
        };
        if let Some(view) = view {
            self.notify(&view);
        }
    }

    pub fn tracked_keys(&self) -> Vec<ResourceKey> {
        self.state().tracked.iter().cloned().collect()
    }

    /// Moves a stock list's cached state to its new display name.
    pub fn rename_stock(&self, old_name: &str, new_name: &str) -> Result<()> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(SyncError::invalid_edit("stock name must not be empty"));
        }
        if old_name == new_name {
            return Ok(());
        }
        let old_key = ResourceKey::stock(old_name);
        let new_key = ResourceKey::stock(new_name);
        let (view, tracked) = {
            let mut state = self.state();
            state.cache.rename(&old_key, &new_key);
            state.scheduler.retire(&old_key);
            // results still in flight for the old name must not resurrect it
            state.guard.start_operation(&old_key.reload_class());
            let tracked = state.tracked.remove(&old_key);
            if tracked {
                state.tracked.insert(new_key.clone());
            }
            (state.cache.view(&new_key), tracked)
        };
        info!("[Sync] Renamed stock '{}' to '{}'", old_name, new_name);
        self.notify(&view);
        if tracked {
            self.request_reload(&new_key, ReloadOptions::default());
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reloads
    // ─────────────────────────────────────────────────────────────────────

    /// Requests a reload of `key`; see [`ReloadScheduler::request`].
    pub fn request_reload(&self, key: &ResourceKey, options: ReloadOptions) -> ReloadDecision {
        let (decision, token) = {
            let mut state = self.state();
            let dirty = state.cache.is_dirty(key);
            let decision = state.scheduler.request(key, options, dirty);
            let token = match decision {
                ReloadDecision::ExecuteNow(_) => Some(state.begin_reload(key)),
                _ => None,
            };
            (decision, token)
        };

        match decision {
            ReloadDecision::Deferred => {
                debug!("[Sync] Reload of {} deferred behind the running fetch", key)
            }
            ReloadDecision::DroppedDirty => {
                debug!("[Sync] Reload of {} dropped: unsaved local edits", key)
            }
            ReloadDecision::Coalesced => debug!("[Sync] Reload of {} coalesced", key),
            ReloadDecision::ArmTimer { generation } => self.arm_debounce(key.clone(), generation),
            ReloadDecision::ExecuteNow(options) => {
                if let Some(token) = token {
                    self.spawn_fetch(key.clone(), options, token);
                }
            }
        }
        decision
    }

    /// Forced reload of every tracked resource.
    pub fn refresh_all(&self) {
        for key in self.tracked_keys() {
            self.request_reload(&key, ReloadOptions::forced());
        }
    }

    /// Reload request with `options` for every tracked resource.
    pub fn reload_tracked(&self, options: ReloadOptions) {
        for key in self.tracked_keys() {
            self.request_reload(&key, options);
        }
    }

    fn arm_debounce(&self, key: ResourceKey, generation: u64) {
        let engine = self.clone();
        let delay = self.inner.config.reload_debounce;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            engine.on_debounce_elapsed(&key, generation);
        });
    }

    fn on_debounce_elapsed(&self, key: &ResourceKey, generation: u64) {
        let started = {
            let mut state = self.state();
            state
                .scheduler
                .timer_fired(key, generation)
                .map(|options| (options, state.begin_reload(key)))
        };
        if let Some((options, token)) = started {
            self.spawn_fetch(key.clone(), options, token);
        }
    }

    fn spawn_fetch(&self, key: ResourceKey, options: ReloadOptions, token: SequenceToken) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_fetch(key, options, token).await;
        });
    }

    async fn run_fetch(&self, key: ResourceKey, options: ReloadOptions, token: SequenceToken) {
        debug!("[Sync] Fetching {} (token {})", key, token);
        let result = self.inner.fetcher.load_resource(&key).await;

        let (accepted, failure, pending) = {
            let mut state = self.state();
            let (accepted, failure) = match result {
                Ok(items) => (state.accept_fetched(&key, items, options, token), None),
                Err(err) => (None, Some(err)),
            };
            let pending = state.scheduler.fetch_settled(&key, token);
            (accepted, failure, pending)
        };

        if let Some(view) = accepted {
            self.notify(&view);
        }
        if let Some(err) = failure {
            self.report_error(&format!("{}: {}", key, err));
        }
        if let Some(pending) = pending {
            self.request_reload(&pending.key, pending.options);
        }
    }

    /// Applies server-provided items as if a reload had just succeeded.
    /// Returns false when the dirty guard refused the update.
    pub fn apply_inline(
        &self,
        key: &ResourceKey,
        items: Vec<serde_json::Value>,
        preserve_dirty: bool,
    ) -> bool {
        let view = {
            let mut state = self.state();
            if state.cache.is_dirty(key) && !preserve_dirty {
                debug!("[Sync] Inline update of {} dropped: unsaved local edits", key);
                return false;
            }
            let token = state.guard.start_operation(&key.reload_class());
            state.cache.set(key, ResourceSnapshot::new(items, token));
            state.cache.view(key)
        };
        self.notify(&view);
        true
    }

    /// Routes one push event to an inline apply or a reload request.
    pub fn handle_push(&self, message: &PushMessage) {
        match route_push_message(message) {
            PushRoute::Apply {
                key,
                items,
                preserve_dirty,
            } => {
                self.apply_inline(&key, items, preserve_dirty);
            }
            PushRoute::Invalidate { key, options } => {
                self.request_reload(&key, options);
            }
            PushRoute::Ignore => {}
        }
    }

    /// Requests a normal reload of every tracked resource on each tick.
    pub async fn run_periodic_reload(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.reload_tracked(ReloadOptions::default());
        }
    }

    pub fn spawn_periodic_reload(&self, interval: Duration) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move { engine.run_periodic_reload(interval).await })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Mutations and latest-only operations
    // ─────────────────────────────────────────────────────────────────────

    pub async fn mutate(
        &self,
        endpoint: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.inner.fetcher.mutate(endpoint, payload).await
    }

    pub async fn list_stocks(&self) -> Result<Vec<String>> {
        self.inner.fetcher.list_stocks().await
    }

    /// Runs `operation` under the sequence class `class` and returns its
    /// output only if no newer operation of that class started meanwhile.
    pub async fn latest_only<T, F>(&self, class: &str, operation: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        let token = self.state().guard.start_operation(class);
        let output = operation.await;
        let current = self.state().guard.finish(class, token);
        if current {
            Some(output)
        } else {
            debug!("[Sync] Dropping superseded '{}' result {}", class, token);
            None
        }
    }
}
