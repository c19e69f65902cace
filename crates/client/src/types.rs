//! Wire types of the request desk API.

use serde::Deserialize;
use serde_json::Value;

/// Error body returned by the backend on non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    #[serde(default)]
    pub code: String,
    pub message: String,
}

/// A resource listing. Endpoints answer with a bare array, an `{items: [...]}`
/// wrapper, or a single object (system status).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ItemsResponse {
    List(Vec<Value>),
    Wrapped { items: Vec<Value> },
    Single(Value),
}

impl ItemsResponse {
    pub fn into_items(self) -> Vec<Value> {
        match self {
            Self::List(items) | Self::Wrapped { items } => items,
            Self::Single(Value::Null) => Vec::new(),
            Self::Single(value) => vec![value],
        }
    }
}

/// Stock list names, either bare or wrapped in `{stocks: [...]}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StockListResponse {
    Names(Vec<String>),
    Wrapped { stocks: Vec<String> },
}

impl StockListResponse {
    pub fn into_names(self) -> Vec<String> {
        match self {
            Self::Names(names) | Self::Wrapped { stocks: names } => names,
        }
    }
}
