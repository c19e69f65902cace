//! Last accepted snapshot and dirty flag per resource.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::time::Instant;

use super::resource_model::{DirtyState, ResourceKey, ResourceSnapshot, ResourceView};

#[derive(Debug, Default)]
struct CacheEntry {
    snapshot: Option<Arc<ResourceSnapshot>>,
    dirty: Option<DirtyState>,
}

/// Plain map of resource state. Performs no I/O and notifies nobody; the
/// engine reads the resulting [`ResourceView`] back after each change.
#[derive(Debug, Default)]
pub struct ResourceCache {
    entries: HashMap<ResourceKey, CacheEntry>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ResourceKey) -> Option<Arc<ResourceSnapshot>> {
        self.entries
            .get(key)
            .and_then(|entry| entry.snapshot.clone())
    }

    /// Unconditional replace. Callers are responsible for the token and dirty checks.
    pub fn set(&mut self, key: &ResourceKey, snapshot: ResourceSnapshot) {
        self.entries.entry(key.clone()).or_default().snapshot = Some(Arc::new(snapshot));
    }

    /// Marks `key` dirty. An existing mark keeps its original timestamp and
    /// takes the new reason when one is given.
    pub fn mark_dirty(&mut self, key: &ResourceKey, reason: Option<String>) {
        let entry = self.entries.entry(key.clone()).or_default();
        match entry.dirty.as_mut() {
            Some(dirty) => {
                if reason.is_some() {
                    dirty.reason = reason;
                }
            }
            None => {
                entry.dirty = Some(DirtyState {
                    reason,
                    since: Instant::now(),
                });
            }
        }
    }

    /// Clears the dirty mark; returns whether one was set.
    pub fn clear_dirty(&mut self, key: &ResourceKey) -> bool {
        self.entries
            .get_mut(key)
            .and_then(|entry| entry.dirty.take())
            .is_some()
    }

    pub fn is_dirty(&self, key: &ResourceKey) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.dirty.is_some())
    }

    pub fn dirty_state(&self, key: &ResourceKey) -> Option<DirtyState> {
        self.entries.get(key).and_then(|entry| entry.dirty.clone())
    }

    pub fn view(&self, key: &ResourceKey) -> ResourceView {
        let entry = self.entries.get(key);
        ResourceView {
            key: key.clone(),
            snapshot: entry.and_then(|e| e.snapshot.clone()),
            dirty: entry.and_then(|e| e.dirty.clone()),
        }
    }

    /// Moves everything cached under `from` to `to`, replacing whatever `to` held.
    pub fn rename(&mut self, from: &ResourceKey, to: &ResourceKey) -> bool {
        match self.entries.remove(from) {
            Some(entry) => {
                self.entries.insert(to.clone(), entry);
                true
            }
            None => false,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.entries.keys()
    }
}
