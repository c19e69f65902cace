//! Optimistic edits: show the candidate value at once, commit, roll back on failure.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, warn};

use super::engine::SyncEngine;
use super::resource_model::{ReloadOptions, ResourceKey};
use super::sync_config::EDIT_IN_FLIGHT_REASON;

/// Lowest valid queue/stock position.
pub const MIN_POSITION: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    /// The server accepted the edit; the candidate is the new baseline.
    Committed,
    /// The commit failed; displayed values were restored to their baselines.
    RolledBack { error: String },
    /// Rejected locally without a network call.
    Rejected { reason: String },
    /// An edit of one of the items is still in flight.
    Busy,
}

#[derive(Debug)]
struct EditState<K, V> {
    baselines: HashMap<K, V>,
    displayed: HashMap<K, V>,
    in_flight: HashSet<K>,
    /// Set when this coordinator marked the resource dirty for the edits now
    /// in flight; cleared with the flag once the last of them settles.
    owns_dirty: bool,
}

impl<K, V> Default for EditState<K, V> {
    fn default() -> Self {
        Self {
            baselines: HashMap::new(),
            displayed: HashMap::new(),
            in_flight: HashSet::new(),
            owns_dirty: false,
        }
    }
}

/// Serializes edits per item of one resource and rolls failed ones back.
///
/// While an edit of an item is in flight the item is locked; a second edit of
/// it returns [`EditOutcome::Busy`] instead of racing the first. The resource
/// stays dirty from the first edit that starts until the last one settles.
/// Dirty transitions happen under the edit lock, so observers must not call
/// back into the coordinator.
pub struct MutationCoordinator<K, V> {
    engine: SyncEngine,
    resource: ResourceKey,
    state: Mutex<EditState<K, V>>,
}

impl<K, V> MutationCoordinator<K, V>
where
    K: Eq + Hash + Clone + Display,
    V: Clone,
{
    pub fn new(engine: SyncEngine, resource: ResourceKey) -> Self {
        Self {
            engine,
            resource,
            state: Mutex::new(EditState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, EditState<K, V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn resource(&self) -> &ResourceKey {
        &self.resource
    }

    /// Seeds the committed value of `item`, typically from a fresh snapshot.
    /// Ignored while an edit of the item is in flight.
    pub fn set_baseline(&self, item: K, value: V) {
        let mut state = self.state();
        if state.in_flight.contains(&item) {
            return;
        }
        state.displayed.insert(item.clone(), value.clone());
        state.baselines.insert(item, value);
    }

    pub fn baseline(&self, item: &K) -> Option<V> {
        self.state().baselines.get(item).cloned()
    }

    /// Value the view should show for `item` right now.
    pub fn displayed(&self, item: &K) -> Option<V> {
        self.state().displayed.get(item).cloned()
    }

    pub fn is_locked(&self, item: &K) -> bool {
        self.state().in_flight.contains(item)
    }

    /// Edits one item.
    pub async fn apply_edit<F, Fut, E>(&self, item: K, candidate: V, commit: F) -> EditOutcome
    where
        F: FnOnce(V) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        self.apply_batch_edit(std::slice::from_ref(&item), candidate, commit)
            .await
    }

    /// Edits every item of a selection with the same candidate value. All
    /// items stay locked until the single commit settles. Dropping the
    /// returned future mid-commit rolls the items back and unlocks them.
    pub async fn apply_batch_edit<F, Fut, E>(
        &self,
        items: &[K],
        candidate: V,
        commit: F,
    ) -> EditOutcome
    where
        F: FnOnce(V) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let edit = {
            let mut state = self.state();
            if let Some(busy) = items.iter().find(|item| state.in_flight.contains(*item)) {
                debug!("[Edit] {} on {} is still being saved", busy, self.resource);
                return EditOutcome::Busy;
            }
            if state.in_flight.is_empty() {
                state.owns_dirty = self
                    .engine
                    .mark_dirty_if_clean(&self.resource, EDIT_IN_FLIGHT_REASON);
            }
            for item in items {
                state.in_flight.insert(item.clone());
                state.displayed.insert(item.clone(), candidate.clone());
            }
            InFlightEdit {
                coordinator: self,
                items,
                armed: true,
            }
        };

        let outcome = match commit(candidate.clone()).await {
            Ok(()) => {
                edit.settle(Some(&candidate));
                EditOutcome::Committed
            }
            Err(err) => {
                edit.settle(None);
                EditOutcome::RolledBack {
                    error: err.to_string(),
                }
            }
        };

        if let EditOutcome::RolledBack { error } = &outcome {
            warn!("[Edit] Edit on {} rolled back: {}", self.resource, error);
            self.engine
                .report_error(&format!("{}: edit failed: {}", self.resource, error));
        }
        self.engine
            .request_reload(&self.resource, ReloadOptions::default());
        outcome
    }

    /// Unlocks `items`, adopting `committed` as their baseline or restoring
    /// the previous one, and gives up the dirty flag after the last edit.
    fn release(&self, items: &[K], committed: Option<&V>) {
        let mut state = self.state();
        for item in items {
            match committed {
                Some(value) => {
                    state.baselines.insert(item.clone(), value.clone());
                }
                None => match state.baselines.get(item).cloned() {
                    Some(baseline) => {
                        state.displayed.insert(item.clone(), baseline);
                    }
                    None => {
                        state.displayed.remove(item);
                    }
                },
            }
            state.in_flight.remove(item);
        }
        if state.in_flight.is_empty() && state.owns_dirty {
            state.owns_dirty = false;
            self.engine.clear_dirty(&self.resource);
        }
    }
}

/// Items of one edit whose commit has not settled. Dropping it unsettled
/// (the edit future was cancelled) rolls the items back.
struct InFlightEdit<'a, K, V>
where
    K: Eq + Hash + Clone + Display,
    V: Clone,
{
    coordinator: &'a MutationCoordinator<K, V>,
    items: &'a [K],
    armed: bool,
}

impl<K, V> InFlightEdit<'_, K, V>
where
    K: Eq + Hash + Clone + Display,
    V: Clone,
{
    fn settle(mut self, committed: Option<&V>) {
        self.armed = false;
        self.coordinator.release(self.items, committed);
    }
}

impl<K, V> Drop for InFlightEdit<'_, K, V>
where
    K: Eq + Hash + Clone + Display,
    V: Clone,
{
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let coordinator = self.coordinator;
        coordinator.release(self.items, None);
        warn!(
            "[Edit] Edit on {} abandoned before its commit settled",
            coordinator.resource
        );
        coordinator.engine.report_error(&format!(
            "{}: edit abandoned before the server answered",
            coordinator.resource
        ));
        // debounce timers need a runtime
        if tokio::runtime::Handle::try_current().is_ok() {
            coordinator
                .engine
                .request_reload(&coordinator.resource, ReloadOptions::default());
        }
    }
}

impl<K> MutationCoordinator<K, i64>
where
    K: Eq + Hash + Clone + Display,
{
    /// Moves `item` to `position`. Positions below [`MIN_POSITION`] are
    /// rejected locally and the view reverts to the committed position.
    pub async fn apply_position_edit<F, Fut, E>(
        &self,
        item: K,
        position: i64,
        commit: F,
    ) -> EditOutcome
    where
        F: FnOnce(i64) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        if position < MIN_POSITION {
            let mut state = self.state();
            if state.in_flight.contains(&item) {
                return EditOutcome::Busy;
            }
            match state.baselines.get(&item).copied() {
                Some(baseline) => state.displayed.insert(item.clone(), baseline),
                None => state.displayed.remove(&item),
            };
            debug!("[Edit] Rejected position {} for {}", position, item);
            return EditOutcome::Rejected {
                reason: format!("position must be at least {}", MIN_POSITION),
            };
        }
        self.apply_edit(item, position, commit).await
    }
}
