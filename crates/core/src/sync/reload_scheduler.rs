//! Per-resource reload state machine: debounce, coalesce, single flight.
//!
//! Each resource key owns one slot moving through
//! `Idle -> Debouncing -> Executing (-> ExecutingWithPending) -> Idle`.
//! The machine is pure: it decides, the engine arms timers and runs fetches.

use std::collections::HashMap;

use serde::Serialize;

use super::resource_model::{PendingReload, ReloadOptions, ResourceKey};
use super::sequence_guard::SequenceToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadPhase {
    #[default]
    Idle,
    Debouncing,
    Executing,
    ExecutingWithPending,
}

impl ReloadPhase {
    pub fn is_executing(self) -> bool {
        matches!(self, Self::Executing | Self::ExecutingWithPending)
    }
}

/// Outcome of [`ReloadScheduler::request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadDecision {
    /// Stored as the pending reload of an executing slot.
    Deferred,
    /// Dropped: the resource holds unsaved edits.
    DroppedDirty,
    /// A quiet-period timer must be armed for this generation.
    ArmTimer { generation: u64 },
    /// Folded into the running quiet period; options replaced.
    Coalesced,
    /// Forced: execute right away with these options.
    ExecuteNow(ReloadOptions),
}

#[derive(Debug, Default)]
struct ReloadSlot {
    phase: ReloadPhase,
    options: ReloadOptions,
    timer_generation: u64,
    executing: Option<SequenceToken>,
    pending: Option<PendingReload>,
}

#[derive(Debug, Default)]
pub struct ReloadScheduler {
    slots: HashMap<ResourceKey, ReloadSlot>,
}

impl ReloadScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self, key: &ResourceKey) -> ReloadPhase {
        self.slots.get(key).map(|slot| slot.phase).unwrap_or_default()
    }

    pub fn pending(&self, key: &ResourceKey) -> Option<&PendingReload> {
        self.slots.get(key).and_then(|slot| slot.pending.as_ref())
    }

    /// Token of the fetch that currently owns the slot.
    pub fn executing_token(&self, key: &ResourceKey) -> Option<SequenceToken> {
        self.slots.get(key).and_then(|slot| slot.executing)
    }

    /// Applies a reload request to the slot of `key`.
    pub fn request(
        &mut self,
        key: &ResourceKey,
        options: ReloadOptions,
        dirty: bool,
    ) -> ReloadDecision {
        let slot = self.slots.entry(key.clone()).or_default();

        if slot.phase.is_executing() && !options.force {
            slot.pending = Some(PendingReload {
                key: key.clone(),
                options,
                requested_while_executing: true,
            });
            slot.phase = ReloadPhase::ExecutingWithPending;
            return ReloadDecision::Deferred;
        }

        if dirty && !options.may_overwrite_dirty() {
            return ReloadDecision::DroppedDirty;
        }

        if options.force {
            return ReloadDecision::ExecuteNow(options);
        }

        match slot.phase {
            ReloadPhase::Debouncing => {
                slot.options = options;
                ReloadDecision::Coalesced
            }
            _ => {
                slot.phase = ReloadPhase::Debouncing;
                slot.options = options;
                slot.timer_generation += 1;
                ReloadDecision::ArmTimer {
                    generation: slot.timer_generation,
                }
            }
        }
    }

    /// Returns the coalesced options when the timer of `generation` is still
    /// the live one. The caller must follow up with [`Self::begin_execution`].
    pub fn timer_fired(&mut self, key: &ResourceKey, generation: u64) -> Option<ReloadOptions> {
        let slot = self.slots.get(key)?;
        if slot.phase == ReloadPhase::Debouncing && slot.timer_generation == generation {
            Some(slot.options)
        } else {
            None
        }
    }

    /// Hands the slot to the fetch identified by `token`. Any armed timer is
    /// invalidated; a forced fetch takes the slot over from an older one.
    pub fn begin_execution(&mut self, key: &ResourceKey, token: SequenceToken) {
        let slot = self.slots.entry(key.clone()).or_default();
        slot.timer_generation += 1;
        slot.executing = Some(token);
        slot.phase = if slot.pending.is_some() {
            ReloadPhase::ExecutingWithPending
        } else {
            ReloadPhase::Executing
        };
    }

    /// Releases the slot when `token` still owns it and hands back the
    /// pending reload to re-request. Settlements of superseded fetches are
    /// ignored.
    pub fn fetch_settled(&mut self, key: &ResourceKey, token: SequenceToken) -> Option<PendingReload> {
        let slot = self.slots.get_mut(key)?;
        if slot.executing != Some(token) {
            return None;
        }
        slot.executing = None;
        slot.phase = ReloadPhase::Idle;
        slot.pending.take()
    }

    /// Drops the transient state of `key` (view went inactive). A fetch
    /// already executing keeps running. Returns whether anything was dropped.
    pub fn reset(&mut self, key: &ResourceKey) -> bool {
        let Some(slot) = self.slots.get_mut(key) else {
            return false;
        };
        let had_pending = slot.pending.take().is_some();
        match slot.phase {
            ReloadPhase::Debouncing => {
                slot.phase = ReloadPhase::Idle;
                slot.timer_generation += 1;
                true
            }
            ReloadPhase::ExecutingWithPending => {
                slot.phase = ReloadPhase::Executing;
                true
            }
            _ => had_pending,
        }
    }

    /// Returns the slot of a key that no longer names a live resource to
    /// idle. Armed timers and the running fetch lose their claim on it; the
    /// timer generation keeps counting so stale timers never match again.
    pub fn retire(&mut self, key: &ResourceKey) {
        if let Some(slot) = self.slots.get_mut(key) {
            slot.phase = ReloadPhase::Idle;
            slot.timer_generation += 1;
            slot.executing = None;
            slot.pending = None;
        }
    }
}
