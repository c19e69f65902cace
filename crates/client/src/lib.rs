//! HTTP and server-sent-events collaborators for the request desk sync engine.

mod client;
mod error;
mod sse;
mod types;

pub use client::RequestDeskClient;
pub use error::{ClientError, Result};
pub use sse::{SseDecoder, SsePushTransport, EVENTS_PATH};
pub use types::{ApiErrorResponse, ItemsResponse, StockListResponse};
