//! Resource keys, snapshots and per-resource state records.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::sequence_guard::SequenceToken;

/// Bucket name of the playback queue.
pub const QUEUE_BUCKET: &str = "queue";
/// Bucket name of the moderation rules.
pub const RULES_BUCKET: &str = "rules";
/// Bucket name of the comment feed.
pub const COMMENTS_BUCKET: &str = "comments";
/// Bucket name of the log feed.
pub const LOGS_BUCKET: &str = "logs";
/// Bucket name of the system status.
pub const SYSTEM_BUCKET: &str = "system";
/// Prefix used when a stock list is named in a generic bucket string.
pub const STOCK_BUCKET_PREFIX: &str = "stock:";

/// Identifier of one independently synchronized resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum ResourceKey {
    Queue,
    /// A named stock list. The name is user-visible and may change at runtime.
    Stock(String),
    Rules,
    Comments,
    Logs,
    SystemStatus,
}

impl ResourceKey {
    pub fn stock(name: impl Into<String>) -> Self {
        Self::Stock(name.into())
    }

    /// Parses a push bucket name.
    ///
    /// Fixed bucket names map to their resource; `stock:<name>` and any other
    /// non-empty string name a stock list. Blank input yields `None`.
    pub fn from_bucket(bucket: &str) -> Option<Self> {
        let bucket = bucket.trim();
        if bucket.is_empty() {
            return None;
        }
        let key = match bucket {
            QUEUE_BUCKET => Self::Queue,
            RULES_BUCKET => Self::Rules,
            COMMENTS_BUCKET => Self::Comments,
            LOGS_BUCKET => Self::Logs,
            SYSTEM_BUCKET => Self::SystemStatus,
            other => {
                let name = other.strip_prefix(STOCK_BUCKET_PREFIX).unwrap_or(other).trim();
                if name.is_empty() {
                    return None;
                }
                Self::Stock(name.to_string())
            }
        };
        Some(key)
    }

    /// Bucket name as used on the push channel.
    pub fn bucket(&self) -> String {
        match self {
            Self::Queue => QUEUE_BUCKET.to_string(),
            Self::Stock(name) => format!("{}{}", STOCK_BUCKET_PREFIX, name),
            Self::Rules => RULES_BUCKET.to_string(),
            Self::Comments => COMMENTS_BUCKET.to_string(),
            Self::Logs => LOGS_BUCKET.to_string(),
            Self::SystemStatus => SYSTEM_BUCKET.to_string(),
        }
    }

    pub fn stock_name(&self) -> Option<&str> {
        match self {
            Self::Stock(name) => Some(name),
            _ => None,
        }
    }

    /// Sequence class used for reloads of this resource.
    pub fn reload_class(&self) -> String {
        format!("reload:{}", self.bucket())
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.bucket())
    }
}

/// Immutable snapshot of one resource as last accepted from the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSnapshot {
    pub items: Vec<serde_json::Value>,
    pub fetched_at: Instant,
    pub sequence: SequenceToken,
}

impl ResourceSnapshot {
    pub fn new(items: Vec<serde_json::Value>, sequence: SequenceToken) -> Self {
        Self {
            items,
            fetched_at: Instant::now(),
            sequence,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Unsaved-edit marker for a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyState {
    pub reason: Option<String>,
    pub since: Instant,
}

/// Options accepted by a reload request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadOptions {
    /// Reconciling read: replace the snapshot even while dirty, keeping the flag.
    #[serde(default)]
    pub preserve_dirty: bool,
    /// Skip the debounce and the dirty guard.
    #[serde(default)]
    pub force: bool,
}

impl ReloadOptions {
    pub fn reconciling() -> Self {
        Self {
            preserve_dirty: true,
            force: false,
        }
    }

    pub fn forced() -> Self {
        Self {
            preserve_dirty: false,
            force: true,
        }
    }

    /// Whether a fetched result may replace the snapshot of a dirty resource.
    pub fn may_overwrite_dirty(&self) -> bool {
        self.force || self.preserve_dirty
    }
}

/// The single outstanding reload recorded while another reload executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReload {
    pub key: ResourceKey,
    pub options: ReloadOptions,
    pub requested_while_executing: bool,
}

/// What the consumer receives after an accepted change: the full current state.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceView {
    pub key: ResourceKey,
    pub snapshot: Option<Arc<ResourceSnapshot>>,
    pub dirty: Option<DirtyState>,
}

impl ResourceView {
    pub fn is_dirty(&self) -> bool {
        self.dirty.is_some()
    }
}
