//! Server-sent events push transport.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info};
use reqwest::header::{HeaderValue, ACCEPT, CACHE_CONTROL};

use requestdesk_core::sync::{PushMessage, PushStream, PushTransport};

use crate::error::ClientError;
use crate::types::ApiErrorResponse;

/// Path of the backend's event stream.
pub const EVENTS_PATH: &str = "/api/events";

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Incremental `text/event-stream` decoder.
///
/// Bytes are buffered until a full line is available, so chunks may split
/// lines and multi-byte characters anywhere. `id` and `retry` fields are
/// ignored; reconnect timing belongs to the engine.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns every event it completed.
    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<PushMessage> {
        self.buffer.extend_from_slice(chunk);
        let mut messages = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(message) = self.process_line(&line) {
                messages.push(message);
            }
        }
        messages
    }

    fn process_line(&mut self, line: &str) -> Option<PushMessage> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<PushMessage> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(PushMessage {
            channel: event.filter(|name| !name.is_empty()),
            data,
        })
    }
}

/// Push transport over `GET /api/events`.
#[derive(Debug, Clone)]
pub struct SsePushTransport {
    client: reqwest::Client,
    url: String,
}

impl SsePushTransport {
    /// The stream stays open indefinitely, so only connecting is bounded by
    /// a timeout.
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), EVENTS_PATH),
        }
    }

    async fn open(&self) -> Result<reqwest::Response, ClientError> {
        debug!("[Push] Connecting to {}", self.url);
        let response = self
            .client
            .get(&self.url)
            .header(ACCEPT, HeaderValue::from_static("text/event-stream"))
            .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await?;
        match serde_json::from_str::<ApiErrorResponse>(&body) {
            Ok(error) => Err(ClientError::api(status.as_u16(), error.message)),
            Err(_) => Err(ClientError::api(
                status.as_u16(),
                format!("Request failed: {}", body),
            )),
        }
    }
}

#[async_trait]
impl PushTransport for SsePushTransport {
    async fn connect(&self) -> requestdesk_core::Result<PushStream> {
        let response = self.open().await.map_err(ClientError::into_push_error)?;
        info!("[Push] Event stream open at {}", self.url);

        let stream = response
            .bytes_stream()
            .scan(SseDecoder::new(), |decoder, chunk| {
                let items: Vec<requestdesk_core::Result<PushMessage>> = match chunk {
                    Ok(bytes) => decoder.push_bytes(&bytes).into_iter().map(Ok).collect(),
                    Err(err) => vec![Err(ClientError::from(err).into_push_error())],
                };
                futures::future::ready(Some(futures::stream::iter(items)))
            })
            .flatten()
            .boxed();
        Ok(stream)
    }
}
