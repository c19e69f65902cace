//! Push event envelope decoding, bucket routing and reconnect backoff.

use std::time::Duration;

use serde::Deserialize;

use super::resource_model::{ReloadOptions, ResourceKey, STOCK_BUCKET_PREFIX};

/// Stock list addressed by a stock event that names no bucket.
pub const DEFAULT_STOCK_NAME: &str = "default";

/// Channel name used by transports that do not name their events.
pub const GENERIC_CHANNEL: &str = "message";

/// Channel carrying stock list events.
pub const STOCK_CHANNEL: &str = "stock";

/// One raw event delivered by a push transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    pub channel: Option<String>,
    pub data: String,
}

impl PushMessage {
    pub fn new(channel: Option<&str>, data: impl Into<String>) -> Self {
        Self {
            channel: channel.map(str::to_string),
            data: data.into(),
        }
    }
}

/// The routing envelope. Everything else in the payload belongs to the
/// render collaborator and is left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushEnvelope {
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub summary: Option<serde_json::Value>,
    #[serde(default, alias = "inline")]
    pub items: Option<serde_json::Value>,
    #[serde(default)]
    pub preserve_dirty: Option<bool>,
}

impl PushEnvelope {
    /// Decodes the event data. Empty or non-object data is a bare
    /// invalidation of the channel's default bucket.
    pub fn parse(data: &str) -> Self {
        let trimmed = data.trim();
        if trimmed.is_empty() {
            return Self::default();
        }
        match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(value @ serde_json::Value::Object(_)) => {
                serde_json::from_value(value).unwrap_or_else(|err| {
                    log::debug!("[Push] Envelope fields malformed, treating as invalidation: {}", err);
                    Self::default()
                })
            }
            Ok(_) | Err(_) => {
                log::debug!("[Push] Non-object event data, treating as invalidation");
                Self::default()
            }
        }
    }

    /// Inline items normalized to a list; a lone object is one item.
    pub fn inline_items(&self) -> Option<Vec<serde_json::Value>> {
        match self.items.as_ref()? {
            serde_json::Value::Null => None,
            serde_json::Value::Array(items) => Some(items.clone()),
            other => Some(vec![other.clone()]),
        }
    }
}

/// What the engine should do with one push event.
#[derive(Debug, Clone, PartialEq)]
pub enum PushRoute {
    /// Inline payload: apply directly, subject to the dirty guard.
    Apply {
        key: ResourceKey,
        items: Vec<serde_json::Value>,
        preserve_dirty: bool,
    },
    /// No payload: schedule a reload of the bucket.
    Invalidate {
        key: ResourceKey,
        options: ReloadOptions,
    },
    /// Channel the engine does not follow (heartbeats and the like).
    Ignore,
}

fn default_key_for_channel(channel: &str) -> Option<ResourceKey> {
    match channel {
        GENERIC_CHANNEL => Some(ResourceKey::Queue),
        STOCK_CHANNEL => Some(ResourceKey::stock(DEFAULT_STOCK_NAME)),
        other => match ResourceKey::from_bucket(other) {
            Some(ResourceKey::Stock(_)) | None => None,
            fixed => fixed,
        },
    }
}

fn resolve_key(channel: &str, bucket: Option<&str>) -> Option<ResourceKey> {
    let default_key = default_key_for_channel(channel)?;
    let Some(bucket) = bucket.map(str::trim).filter(|b| !b.is_empty()) else {
        return Some(default_key);
    };
    if channel == STOCK_CHANNEL {
        let name = bucket.strip_prefix(STOCK_BUCKET_PREFIX).unwrap_or(bucket).trim();
        if name.is_empty() {
            return Some(default_key);
        }
        return Some(ResourceKey::stock(name));
    }
    Some(ResourceKey::from_bucket(bucket).unwrap_or(default_key))
}

/// Maps one raw event to its route.
pub fn route_push_message(message: &PushMessage) -> PushRoute {
    let channel = message
        .channel
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or(GENERIC_CHANNEL);
    let envelope = PushEnvelope::parse(&message.data);

    let Some(key) = resolve_key(channel, envelope.bucket.as_deref()) else {
        log::debug!("[Push] Ignoring event on unfollowed channel '{}'", channel);
        return PushRoute::Ignore;
    };
    if let Some(summary) = envelope.summary.as_ref() {
        log::debug!("[Push] {} summary: {}", key, summary);
    }
    let preserve_dirty = envelope.preserve_dirty.unwrap_or(false);

    match envelope.inline_items() {
        Some(items) => PushRoute::Apply {
            key,
            items,
            preserve_dirty,
        },
        None => PushRoute::Invalidate {
            key,
            options: ReloadOptions {
                preserve_dirty,
                force: false,
            },
        },
    }
}

/// Reconnect delay after `consecutive_failures` failures in a row: `initial`
/// after the first, doubling each time, never above `max`.
pub fn reconnect_delay(consecutive_failures: u32, initial: Duration, max: Duration) -> Duration {
    const MAX_EXPONENT: u32 = 16;

    let exponent = consecutive_failures.saturating_sub(1).min(MAX_EXPONENT);
    initial.saturating_mul(1_u32 << exponent).min(max)
}

/// Explicit backoff state of the push connection.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
    consecutive_failures: u32,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            consecutive_failures: 0,
        }
    }

    /// Records a failure and returns how long to wait before reconnecting.
    pub fn on_failure(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        reconnect_delay(self.consecutive_failures, self.initial, self.max)
    }

    pub fn on_open(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
