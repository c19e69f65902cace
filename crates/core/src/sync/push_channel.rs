//! Long-lived push connection feeding the engine, with reconnect backoff and
//! a polling fallback when the runtime has no push transport.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::engine::SyncEngine;
use super::push_router::{PushMessage, ReconnectBackoff};
use super::resource_model::ReloadOptions;
use crate::errors::Result;

/// Stream of events of one open connection; an `Err` item ends the connection.
pub type PushStream = BoxStream<'static, Result<PushMessage>>;

/// Server-to-client event transport.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Whether this runtime can hold a push connection at all.
    fn is_available(&self) -> bool {
        true
    }

    async fn connect(&self) -> Result<PushStream>;
}

/// Transport for runtimes without push support; forces the polling fallback.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailablePushTransport;

#[async_trait]
impl PushTransport for UnavailablePushTransport {
    fn is_available(&self) -> bool {
        false
    }

    async fn connect(&self) -> Result<PushStream> {
        Err(crate::SyncError::push("push transport unavailable"))
    }
}

/// Restartable background task owning the push connection.
pub struct PushChannel {
    engine: SyncEngine,
    transport: Arc<dyn PushTransport>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PushChannel {
    pub fn new(engine: SyncEngine, transport: Arc<dyn PushTransport>) -> Self {
        Self {
            engine,
            transport,
            task: Mutex::new(None),
        }
    }

    /// Spawns the connection task unless one is already running. Returns
    /// whether a new task was spawned.
    pub async fn start(&self) -> bool {
        let mut guard = self.task.lock().await;
        if let Some(handle) = guard.as_ref() {
            if !handle.is_finished() {
                return false;
            }
            guard.take();
        }

        let engine = self.engine.clone();
        let transport = Arc::clone(&self.transport);
        let handle = if transport.is_available() {
            tokio::spawn(async move { run_push_loop(engine, transport).await })
        } else {
            let interval = engine.config().poll_interval;
            info!(
                "[Push] No push transport available; polling every {}s",
                interval.as_secs()
            );
            tokio::spawn(async move { engine.run_periodic_reload(interval).await })
        };
        *guard = Some(handle);
        true
    }

    pub async fn stop(&self) {
        let mut guard = self.task.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

/// Connect, drain events into the engine, and reconnect with backoff forever.
pub async fn run_push_loop(engine: SyncEngine, transport: Arc<dyn PushTransport>) {
    let config = engine.config().clone();
    let mut backoff = ReconnectBackoff::new(config.push_backoff_initial, config.push_backoff_max);
    let mut reconnecting = false;

    loop {
        match transport.connect().await {
            Ok(mut stream) => {
                info!("[Push] Connection open");
                backoff.on_open();
                if reconnecting {
                    // events may have been missed while disconnected
                    engine.reload_tracked(ReloadOptions::default());
                }
                let mut failure = None;
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(message) => engine.handle_push(&message),
                        Err(err) => {
                            failure = Some(err);
                            break;
                        }
                    }
                }
                match failure {
                    Some(err) => engine.report_error(&format!("Push connection lost: {}", err)),
                    None => debug!("[Push] Server closed the connection"),
                }
            }
            Err(err) => {
                engine.report_error(&format!("Push connection failed: {}", err));
            }
        }

        reconnecting = true;
        let delay = backoff.on_failure();
        warn!(
            "[Push] Reconnecting in {}s (consecutive failures: {})",
            delay.as_secs(),
            backoff.consecutive_failures()
        );
        tokio::time::sleep(delay).await;
    }
}
