use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use requestdesk_core::sync::{ResourceView, SnapshotObserver, StatusSink};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Stores the most recent failure message for display; the engine logs it.
#[derive(Debug, Default)]
pub struct StatusLineSink {
    latest: RwLock<Option<StatusLine>>,
}

impl StatusLineSink {
    pub fn latest(&self) -> Option<StatusLine> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl StatusSink for StatusLineSink {
    fn report(&self, message: &str) {
        let line = StatusLine {
            message: message.to_string(),
            at: Utc::now(),
        };
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Some(line);
    }
}

/// Logs every snapshot the engine accepts.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl SnapshotObserver for LoggingObserver {
    fn resource_changed(&self, view: &ResourceView) {
        let count = view.snapshot.as_ref().map_or(0, |snapshot| snapshot.len());
        let sequence = view
            .snapshot
            .as_ref()
            .map(|snapshot| snapshot.sequence.to_string())
            .unwrap_or_else(|| "-".to_string());
        if view.is_dirty() {
            info!("{}: {} items ({}), unsaved edits", view.key, count, sequence);
        } else {
            info!("{}: {} items ({})", view.key, count, sequence);
        }
    }
}
