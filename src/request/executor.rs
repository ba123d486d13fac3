//! HTTP request executor.
//!
//! Issues a single API call with a hard timeout and classifies the outcome.
//! It never retries; see [`execute_with_retry`](super::execute_with_retry).

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use crate::config::ClientConfig;
use crate::error::{ApiErrorEntry, ExecError};

/// API version requested on every call.
pub const API_VERSION: &str = "3";

/// Header carrying the seconds until the rate-limit window resets.
pub const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

/// Header carrying the remaining requests in the current rate-limit window.
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// A single API call.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the API base URL, or an absolute URL.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub headers: Vec<(String, String)>,
    /// Overrides the executor's default timeout.
    pub timeout: Option<Duration>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            headers: Vec::new(),
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A successful (2xx) API response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ApiResponse {
    /// Decode the body into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ExecError> {
        serde_json::from_slice(&self.body).map_err(|e| ExecError::Decode(e.to_string()))
    }

    /// Decode the body as a JSON value; an empty body decodes to `null`.
    pub fn json_value(&self) -> Result<serde_json::Value, ExecError> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(serde_json::Value::Null);
        }
        self.json()
    }

    /// Remaining requests in the current rate-limit window, when reported.
    pub fn rate_limit_remaining(&self) -> Option<u64> {
        header_u64(&self.headers, RATE_LIMIT_REMAINING_HEADER)
    }
}

/// Executes a single request and classifies its outcome.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ExecError>;
}

/// [`RequestExecutor`] backed by `reqwest`.
#[derive(Clone)]
pub struct HttpExecutor {
    client: Client,
    base_url: String,
    api_token: String,
    environment: Option<String>,
    default_timeout: Duration,
}

impl HttpExecutor {
    /// Create a new HttpExecutor.
    ///
    /// # Arguments
    /// * `base_url` - Base URL of the API (e.g., "https://site-api.example.com")
    /// * `api_token` - Bearer token sent with every request
    /// * `default_timeout` - Timeout applied when a request does not set its own
    pub fn new(base_url: String, api_token: String, default_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("job-result-client/", env!("CARGO_PKG_VERSION")))
            .build()?;

        // Ensure base_url doesn't have trailing slash
        let base_url = base_url.trim_end_matches('/').to_string();

        Ok(Self {
            client,
            base_url,
            api_token,
            environment: None,
            default_timeout,
        })
    }

    /// Create an executor from resolved client configuration.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let executor = Self::new(
            config.base_url.clone(),
            config.api_token.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )?;
        Ok(executor.with_environment(config.environment.clone()))
    }

    /// Target a specific environment (sent as `X-Environment`).
    pub fn with_environment(mut self, environment: Option<String>) -> Self {
        self.environment = environment;
        self
    }

    /// Get the base URL of the API.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

#[async_trait]
impl RequestExecutor for HttpExecutor {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ExecError> {
        let url = self.url_for(&request.path);
        let timeout = request.timeout.unwrap_or(self.default_timeout);

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .bearer_auth(&self.api_token)
            .header(ACCEPT, "application/json")
            .header("X-Api-Version", API_VERSION);
        if let Some(environment) = &self.environment {
            builder = builder.header("X-Environment", environment);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        trace!("{} {}", request.method, url);

        let send = async {
            let response = builder.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, headers, body))
        };

        let (status, headers, body) = match tokio::time::timeout(timeout, send).await {
            Err(_) => {
                debug!("{} {} timed out after {:?}", request.method, url, timeout);
                return Err(ExecError::Timeout);
            }
            Ok(Err(e)) => return Err(classify_transport_error(e)),
            Ok(Ok(parts)) => parts,
        };

        debug!("{} {} -> {}", request.method, url, status);

        if status.is_success() {
            Ok(ApiResponse {
                status: status.as_u16(),
                headers,
                body: body.to_vec(),
            })
        } else {
            Err(ExecError::Api {
                status: status.as_u16(),
                entries: ApiErrorEntry::parse_document(&body),
                retry_after: retry_after(&headers),
            })
        }
    }
}

fn classify_transport_error(error: reqwest::Error) -> ExecError {
    if error.is_timeout() {
        ExecError::Timeout
    } else if error.is_decode() {
        ExecError::Decode(error.to_string())
    } else if error.is_builder() {
        ExecError::InvalidRequest(error.to_string())
    } else {
        ExecError::Transport(error.to_string())
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v.ceil() as u64)
}

/// Server-requested wait before retrying, from `Retry-After` or the
/// rate-limit reset header.
pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    header_u64(headers, RETRY_AFTER.as_str())
        .or_else(|| header_u64(headers, RATE_LIMIT_RESET_HEADER))
        .map(Duration::from_secs)
}
