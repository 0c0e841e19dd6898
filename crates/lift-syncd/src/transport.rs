use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use lift_proto::Method;
use serde_json::Value;
use std::time::Duration;

/// One call to the backend, before routing.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the base URL, without a leading slash
    pub path: String,
    pub since: Option<DateTime<Utc>>,
    pub body: Option<Value>,
    pub bearer: Option<String>,
    /// Overrides the transport's default timeout
    pub timeout: Option<Duration>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            since: None,
            body: None,
            bearer: None,
            timeout: None,
        }
    }

    pub fn since(mut self, since: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self
    }

    pub fn body(mut self, body: Option<Value>) -> Self {
        self.body = body;
        self
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Moves requests to the backend and back. A transport reports only
/// connection-level failures as errors; every HTTP status, including 4xx
/// and 5xx, comes back as a response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> SyncResult<ApiResponse>;
}

/// reqwest-backed transport
///
/// Routes: `GET /<collection>?since=..`, `GET|PUT|DELETE /<collection>/<id>`,
/// `POST /<collection>`, `GET /health`, `POST /auth/refresh`.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Protocol(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: ApiRequest) -> SyncResult<ApiResponse> {
        let url = format!("{}/{}", self.base_url, request.path.trim_start_matches('/'));
        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Create => self.client.post(&url),
            Method::Update => self.client.put(&url),
            Method::Delete => self.client.delete(&url),
        };
        if let Some(since) = request.since {
            builder = builder.query(&[("since", since.to_rfc3339_opts(SecondsFormat::Millis, true))]);
        }
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|e| {
            tracing::debug!("{} {url} failed: {e}", request.method.as_str());
            SyncError::NetworkUnavailable
        })?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| {
            tracing::debug!("reading response of {url} failed: {e}");
            SyncError::NetworkUnavailable
        })?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok(ApiResponse { status, body })
    }
}
