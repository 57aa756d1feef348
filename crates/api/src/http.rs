use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use metrics::{counter, histogram};
use reqwest::{Client, Method, Url};
use skiff_core::{ResourceKey, ResourceKind};
use tracing::{debug, info};

use crate::{title_for, ApiError, ApiErrorItem, ApiResponse, ApiResult, ClusterApi};

#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Base URL including the `/api` prefix, e.g. `http://localhost:5050/api`.
    pub base_url: String,
    pub timeout: Duration,
}

impl HttpConfig {
    /// Read `SKIFF_API_URL` and `SKIFF_HTTP_TIMEOUT_SECS`, falling back to defaults.
    pub fn from_env() -> Self {
        let base_url = std::env::var("SKIFF_API_URL").unwrap_or_else(|_| "http://localhost:5050/api".to_string());
        let secs = std::env::var("SKIFF_HTTP_TIMEOUT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(180);
        Self { base_url, timeout: Duration::from_secs(secs) }
    }
}

/// REST client for the console API server.
pub struct HttpApi {
    client: Client,
    base_url: Url,
}

impl HttpApi {
    pub fn new(cfg: &HttpConfig) -> Result<Self> {
        let client = Client::builder().timeout(cfg.timeout).build().context("building HTTP client")?;
        let base_url = Url::parse(&cfg.base_url).with_context(|| format!("parsing base URL {}", cfg.base_url))?;
        if base_url.cannot_be_a_base() {
            bail!("base URL {} cannot carry a path", cfg.base_url);
        }
        Ok(Self { client, base_url })
    }

    fn map_err(e: anyhow::Error) -> ApiError {
        ApiError::Transport(format!("{:#}", e))
    }

    /// `{base}/{segments..}`; every segment is percent-encoded on its own.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("base URL {} cannot carry a path", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn item_url(&self, kind: ResourceKind, key: &ResourceKey, action: Option<&str>) -> Result<Url> {
        let mut url = match action {
            Some(a) => self.url(&[kind.plural(), &key.name, a])?,
            None => self.url(&[kind.plural(), &key.name])?,
        };
        url.query_pairs_mut().append_pair("group", &key.group);
        Ok(url)
    }

    fn list_url(&self, kind: ResourceKind) -> Result<Url> {
        self.url(&[kind.plural()])
    }

    /// Send one request and wrap the reply into an envelope. Only transport
    /// problems are errors here; HTTP error statuses become envelopes with `errors`.
    async fn send(&self, method: Method, url: Url, body: Option<&serde_json::Value>) -> Result<(u16, serde_json::Value, Option<Vec<ApiErrorItem>>)> {
        let t0 = Instant::now();
        let mut req = self.client.request(method.clone(), url.clone());
        if let Some(b) = body {
            req = req.json(b);
        }
        let resp = req.send().await.with_context(|| format!("{} {}", method, url))?;
        let status = resp.status().as_u16();
        let text = resp.text().await.context("reading response body")?;
        histogram!("api_request_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(%method, %url, status, took_ms = %t0.elapsed().as_millis(), "api: response");
        let data: serde_json::Value = if text.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&text).with_context(|| format!("decoding response body of {}", url))?
        };
        if status >= 400 {
            counter!("api_rejected_total", 1);
            let item = serde_json::from_value::<ApiErrorItem>(data.clone()).unwrap_or_else(|_| ApiErrorItem {
                code: None,
                message: text.clone(),
                stack: None,
            });
            return Ok((status, data, Some(vec![item])));
        }
        Ok((status, data, None))
    }

    async fn call(
        &self,
        verb: &str,
        kind: ResourceKind,
        key: Option<&ResourceKey>,
        method: Method,
        url: Result<Url>,
        body: Option<&serde_json::Value>,
    ) -> ApiResult<ApiResponse> {
        let url = url.map_err(Self::map_err)?;
        let (status, data, errors) = self.send(method, url, body).await.map_err(Self::map_err)?;
        let ok = errors.is_none();
        Ok(ApiResponse { status, data, errors, title: title_for(verb, kind, key, ok) })
    }
}

#[async_trait::async_trait]
impl ClusterApi for HttpApi {
    async fn create(&self, kind: ResourceKind, body: &serde_json::Value) -> ApiResult<ApiResponse> {
        let key = ResourceKey::from_value(body).ok();
        info!(kind = %kind, key = ?key, "api: create");
        self.call("Create", kind, key.as_ref(), Method::POST, self.list_url(kind), Some(body)).await
    }

    async fn get(&self, kind: ResourceKind, key: &ResourceKey) -> ApiResult<ApiResponse> {
        self.call("Get", kind, Some(key), Method::GET, self.item_url(kind, key, None), None).await
    }

    async fn get_all(&self, kind: ResourceKind) -> ApiResult<ApiResponse> {
        self.call("Get", kind, None, Method::GET, self.list_url(kind), None).await
    }

    async fn update(&self, kind: ResourceKind, key: &ResourceKey, body: &serde_json::Value) -> ApiResult<ApiResponse> {
        info!(kind = %kind, key = %key, "api: update");
        self.call("Update", kind, Some(key), Method::PUT, self.item_url(kind, key, None), Some(body)).await
    }

    async fn remove(&self, kind: ResourceKind, key: &ResourceKey) -> ApiResult<ApiResponse> {
        info!(kind = %kind, key = %key, "api: remove");
        self.call("Remove", kind, Some(key), Method::DELETE, self.item_url(kind, key, None), None).await
    }

    async fn start(&self, kind: ResourceKind, key: &ResourceKey) -> ApiResult<ApiResponse> {
        info!(kind = %kind, key = %key, "api: start");
        self.call("Start", kind, Some(key), Method::PUT, self.item_url(kind, key, Some("start")), None).await
    }

    async fn stop(&self, kind: ResourceKind, key: &ResourceKey) -> ApiResult<ApiResponse> {
        info!(kind = %kind, key = %key, "api: stop");
        self.call("Stop", kind, Some(key), Method::PUT, self.item_url(kind, key, Some("stop")), None).await
    }
}
