use std::sync::Arc;

use requestdesk_client::{RequestDeskClient, SsePushTransport};
use requestdesk_core::sync::{
    PushChannel, PushTransport, ResourceKey, SyncConfig, SyncEngine, UnavailablePushTransport,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::sinks::{LoggingObserver, StatusLineSink};

/// Resources every monitor session mirrors besides stock lists.
pub const FIXED_RESOURCES: [ResourceKey; 5] = [
    ResourceKey::Queue,
    ResourceKey::Rules,
    ResourceKey::Comments,
    ResourceKey::Logs,
    ResourceKey::SystemStatus,
];

#[derive(Debug)]
pub struct MonitorRuntimeState {
    pub auto_refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorRuntimeState {
    pub fn new() -> Self {
        Self {
            auto_refresh_task: Mutex::new(None),
        }
    }
}

impl Default for MonitorRuntimeState {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MonitorContext {
    pub engine: SyncEngine,
    pub status: Arc<StatusLineSink>,
    pub push_channel: Arc<PushChannel>,
    pub runtime: Arc<MonitorRuntimeState>,
}

impl MonitorContext {
    pub fn build(api_url: &str, config: SyncConfig, push_enabled: bool) -> Self {
        let client = Arc::new(RequestDeskClient::new(api_url));
        let status = Arc::new(StatusLineSink::default());
        let engine = SyncEngine::new(
            config,
            client,
            status.clone(),
            Arc::new(LoggingObserver),
        );
        let transport: Arc<dyn PushTransport> = if push_enabled {
            Arc::new(SsePushTransport::new(api_url))
        } else {
            Arc::new(UnavailablePushTransport)
        };
        let push_channel = Arc::new(PushChannel::new(engine.clone(), transport));

        Self {
            engine,
            status,
            push_channel,
            runtime: Arc::new(MonitorRuntimeState::new()),
        }
    }

    pub fn engine(&self) -> SyncEngine {
        self.engine.clone()
    }

    pub fn status(&self) -> Arc<StatusLineSink> {
        Arc::clone(&self.status)
    }

    /// Tracks the fixed resources and the given stock lists. With
    /// `discover_stocks`, every stock the backend lists is tracked as well.
    pub async fn track_resources(&self, stocks: &[String], discover_stocks: bool) {
        for key in FIXED_RESOURCES.iter() {
            self.engine.track(key);
        }
        let mut names: Vec<String> = stocks
            .iter()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();
        if discover_stocks {
            match self.engine.list_stocks().await {
                Ok(found) => names.extend(found),
                Err(err) => self.engine.report_error(&format!("stocks: {}", err)),
            }
        }
        names.sort();
        names.dedup();
        for name in names {
            self.engine.track(&ResourceKey::stock(name));
        }
        info!("Tracking {} resources", self.engine.tracked_keys().len());
    }

    /// Starts the push channel (or its polling fallback) and the optional
    /// auto-refresh task.
    pub async fn start(&self) {
        self.push_channel.start().await;

        let Some(interval) = self.engine.config().auto_refresh_interval else {
            return;
        };
        let mut guard = self.runtime.auto_refresh_task.lock().await;
        if guard.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        info!("Auto-refresh every {}s", interval.as_secs());
        *guard = Some(self.engine.spawn_periodic_reload(interval));
    }

    pub async fn shutdown(&self) {
        self.push_channel.stop().await;
        if let Some(handle) = self.runtime.auto_refresh_task.lock().await.take() {
            handle.abort();
        }
    }
}
