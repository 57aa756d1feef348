//! Skiff REST collaborator.
//!
//! Defines the resource API surface the orchestration core depends on, the
//! response envelope every call returns, and two implementations: `HttpApi`
//! (talks to the console REST server) and `MockApi` (scriptable, for tests).

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use skiff_core::{ResourceKey, ResourceKind};

mod http;
mod mock;

pub use http::{HttpApi, HttpConfig};
pub use mock::{Call, MockApi, Verb};

/// One entry of the `errors` array in a response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiErrorItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Response envelope: `data` plus optional `errors` and a human-readable `title`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: u16,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<ApiErrorItem>>,
    pub title: String,
}

impl ApiResponse {
    pub fn ok(data: serde_json::Value, title: impl Into<String>) -> Self {
        Self { status: 200, data, errors: None, title: title.into() }
    }

    pub fn rejected(status: u16, message: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            status,
            data: serde_json::Value::Null,
            errors: Some(vec![ApiErrorItem { code: None, message: message.into(), stack: None }]),
            title: title.into(),
        }
    }

    pub fn has_errors(&self) -> bool {
        self.status >= 400 || self.errors.as_ref().map(|e| !e.is_empty()).unwrap_or(false)
    }

    /// Treat a non-empty `errors` field (or an error status) as a failed call.
    pub fn into_result(self) -> ApiResult<ApiResponse> {
        if self.has_errors() {
            Err(ApiError::Rejected(Box::new(self)))
        } else {
            Ok(self)
        }
    }
}

/// Errors surfaced by the API layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// The HTTP call itself failed (connect, timeout, undecodable body).
    #[error("transport: {0}")]
    Transport(String),
    /// The server answered with an error envelope.
    #[error("{}", .0.title)]
    Rejected(Box<ApiResponse>),
}

impl ApiError {
    pub fn title(&self) -> String {
        match self {
            ApiError::Transport(msg) => format!("Request failed: {}", msg),
            ApiError::Rejected(resp) => resp.title.clone(),
        }
    }

    pub fn data(&self) -> serde_json::Value {
        match self {
            ApiError::Transport(_) => serde_json::Value::Null,
            ApiError::Rejected(resp) => resp.data.clone(),
        }
    }

    pub fn meta(&self) -> Option<serde_json::Value> {
        match self {
            ApiError::Transport(_) => None,
            ApiError::Rejected(resp) => resp
                .errors
                .as_ref()
                .and_then(|e| serde_json::to_value(e).ok())
                .map(|errors| serde_json::json!({ "status": resp.status, "errors": errors })),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Build the conventional envelope title, e.g. `Start broker default/bk successful.`
pub fn title_for(verb: &str, kind: ResourceKind, key: Option<&ResourceKey>, ok: bool) -> String {
    let outcome = if ok { "successful." } else { "failed." };
    match key {
        Some(k) => format!("{} {} {} {}", verb, kind.label(), k, outcome),
        None => format!("{} {} list {}", verb, kind.label(), outcome),
    }
}

/// Per-kind resource API. Every call resolves to an envelope; transport
/// failures resolve to `Err(ApiError::Transport)`.
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create(&self, kind: ResourceKind, body: &serde_json::Value) -> ApiResult<ApiResponse>;
    async fn get(&self, kind: ResourceKind, key: &ResourceKey) -> ApiResult<ApiResponse>;
    async fn get_all(&self, kind: ResourceKind) -> ApiResult<ApiResponse>;
    async fn update(&self, kind: ResourceKind, key: &ResourceKey, body: &serde_json::Value) -> ApiResult<ApiResponse>;
    async fn remove(&self, kind: ResourceKind, key: &ResourceKey) -> ApiResult<ApiResponse>;
    async fn start(&self, kind: ResourceKind, key: &ResourceKey) -> ApiResult<ApiResponse>;
    async fn stop(&self, kind: ResourceKind, key: &ResourceKey) -> ApiResult<ApiResponse>;
}
