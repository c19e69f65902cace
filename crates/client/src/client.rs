//! REST client for the request desk backend.
//!
//! Implements the engine's fetch collaborator over the `/api/*` endpoints.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde_json::Value;

use requestdesk_core::sync::{ResourceFetcher, ResourceKey};

use crate::error::{ClientError, Result};
use crate::types::{ApiErrorResponse, ItemsResponse, StockListResponse};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_LOG_BODY_CHARS: usize = 512;

/// Client for the request desk REST API.
#[derive(Debug, Clone)]
pub struct RequestDeskClient {
    client: reqwest::Client,
    base_url: String,
}

impl RequestDeskClient {
    fn log_response(status: reqwest::StatusCode, body: &str) {
        if status.is_success() {
            debug!("[Client] API response status: {}", status);
            return;
        }

        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("[Client] API response error ({}): {}", status, preview);
    }

    /// Create a new client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Origin of the backend (e.g., "http://localhost:8080")
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Path of the listing endpoint for `key`. Stock names are URL-encoded.
    pub fn resource_path(key: &ResourceKey) -> String {
        match key {
            ResourceKey::Queue => "/api/queue".to_string(),
            ResourceKey::Stock(name) => format!("/api/stocks/{}", urlencoding::encode(name)),
            ResourceKey::Rules => "/api/rules".to_string(),
            ResourceKey::Comments => "/api/comments".to_string(),
            ResourceKey::Logs => "/api/logs".to_string(),
            ResourceKey::SystemStatus => "/api/system".to_string(),
        }
    }

    /// Parse a JSON response body.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;
        Self::log_response(status, &body);

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<ApiErrorResponse>(&body) {
                let message = if error.code.is_empty() {
                    error.message
                } else {
                    format!("{}: {}", error.code, error.message)
                };
                return Err(ClientError::api(status.as_u16(), message));
            }
            return Err(ClientError::api(
                status.as_u16(),
                format!("Request failed: {}", body),
            ));
        }

        // mutations may answer 204 or an empty 200
        let body = if body.trim().is_empty() { "null" } else { body.as_str() };
        serde_json::from_str(body).map_err(|e| {
            log::error!(
                "[Client] Failed to deserialize response. Body: {}, Error: {}",
                body,
                e
            );
            ClientError::api(status.as_u16(), format!("Failed to parse response: {}", e))
        })
    }

    /// Fetch the current item list of one resource.
    ///
    /// GET /api/{resource}
    pub async fn get_items(&self, key: &ResourceKey) -> Result<Vec<Value>> {
        let url = format!("{}{}", self.base_url, Self::resource_path(key));
        debug!("[Client] Loading {} from {}", key, url);

        let response = self.client.get(&url).send().await?;
        let items: ItemsResponse = Self::parse_response(response).await?;
        Ok(items.into_items())
    }

    /// List the names of every stock list.
    ///
    /// GET /api/stocks
    pub async fn get_stock_names(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/stocks", self.base_url);

        let response = self.client.get(&url).send().await?;
        let names: StockListResponse = Self::parse_response(response).await?;
        Ok(names.into_names())
    }

    /// Submit a mutation.
    ///
    /// POST /api/{endpoint}
    pub async fn post(&self, endpoint: &str, payload: &Value) -> Result<Value> {
        let endpoint = endpoint.trim().trim_start_matches('/');
        let endpoint = endpoint.strip_prefix("api/").unwrap_or(endpoint);
        if endpoint.is_empty() {
            return Err(ClientError::invalid_request("Mutation endpoint is empty"));
        }
        let url = format!("{}/api/{}", self.base_url, endpoint);
        debug!("[Client] POST {}", url);

        let response = self.client.post(&url).json(payload).send().await?;
        Self::parse_response(response).await
    }
}

#[async_trait]
impl ResourceFetcher for RequestDeskClient {
    async fn load_resource(&self, key: &ResourceKey) -> requestdesk_core::Result<Vec<Value>> {
        self.get_items(key)
            .await
            .map_err(ClientError::into_fetch_error)
    }

    async fn mutate(&self, endpoint: &str, payload: Value) -> requestdesk_core::Result<Value> {
        self.post(endpoint, &payload)
            .await
            .map_err(ClientError::into_mutation_error)
    }

    async fn list_stocks(&self) -> requestdesk_core::Result<Vec<String>> {
        self.get_stock_names()
            .await
            .map_err(ClientError::into_fetch_error)
    }
}
