//! Request/response executor with failure classification and bounded retries.

use std::error::Error as _;
use std::io;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{ClientDefaults, ConfigError};
use crate::credentials::SharedCredentials;
use crate::failure::FailureKind;
use crate::retry::{retry_async, RetryPolicy};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
/// Code assigned to failures raised while building a request. Never retried.
pub const INVALID_REQUEST_CODE: &str = "ERR_INVALID_REQUEST";

#[derive(Clone, Debug)]
pub struct RequestExecutorOptions {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for RequestExecutorOptions {
    fn default() -> Self {
        Self {
            base_url: ClientDefaults::API_BASE_URL.to_string(),
            connect_timeout: ClientDefaults::CONNECT_TIMEOUT,
            attempt_timeout: ClientDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy::request_default(),
        }
    }
}

/// Issues one logical request, retrying transient failures.
///
/// The executor holds no mutable state; clones share the underlying
/// connection pool and may be used from any number of tasks at once.
#[derive(Clone)]
pub struct RequestExecutor {
    http: Client,
    base_url: String,
    credentials: SharedCredentials,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl RequestExecutor {
    pub fn new(credentials: SharedCredentials) -> Result<Self, ConfigError> {
        Self::with_options(credentials, RequestExecutorOptions::default())
    }

    pub fn with_options(
        credentials: SharedCredentials,
        options: RequestExecutorOptions,
    ) -> Result<Self, ConfigError> {
        options.retry_policy.validate()?;
        url::Url::parse(&options.base_url)?;

        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(ConfigError::HttpClient)?;

        Ok(Self {
            http,
            base_url: options.base_url.trim_end_matches('/').to_string(),
            credentials,
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
        })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Executes `request` with the executor's default policy.
    pub async fn execute(&self, request: &RequestSpec) -> Result<ParsedBody, RequestError> {
        self.execute_with(request, &self.retry_policy).await
    }

    /// Executes `request` under an explicit policy.
    ///
    /// Returns the parsed body of the first successful attempt, or the last
    /// failure once the policy is exhausted or the failure is permanent.
    pub async fn execute_with(
        &self,
        request: &RequestSpec,
        policy: &RetryPolicy,
    ) -> Result<ParsedBody, RequestError> {
        let endpoint = self.endpoint(&request.path);

        let result = retry_async(
            policy,
            |attempt| {
                let endpoint = endpoint.as_str();
                async move {
                    let outcome = self.send_attempt(endpoint, request).await;
                    if let Err(error) = &outcome {
                        debug!(
                            event = "request_attempt_failed",
                            method = %request.method,
                            path = %request.path,
                            attempt,
                            kind = %error.kind(),
                            status = error.status().map(|status| status.as_u16()),
                        );
                    }
                    outcome
                }
            },
            |error| error.is_retryable(policy),
        )
        .await;

        if let Err(error) = &result {
            warn!(
                event = "request_failed",
                method = %request.method,
                path = %request.path,
                kind = %error.kind(),
                error = %error,
            );
        }
        result
    }

    /// Executes `request` and decodes the JSON body into `T`.
    pub async fn execute_json<T: DeserializeOwned>(
        &self,
        request: &RequestSpec,
    ) -> Result<T, RequestError> {
        self.execute(request).await?.into_json()
    }

    fn endpoint(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    async fn send_attempt(
        &self,
        endpoint: &str,
        request: &RequestSpec,
    ) -> Result<ParsedBody, RequestError> {
        let mut builder = self
            .http
            .request(request.method.clone(), endpoint)
            .timeout(self.attempt_timeout);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = self.credentials.bearer_token() {
            builder = builder.bearer_auth(token.expose_secret());
        }
        if let Some(body) = request.body.as_ref() {
            builder = builder.json(body);
        }
        builder = builder.headers(request.headers.clone());

        let response = builder.send().await.map_err(RequestError::network)?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        if !status.is_success() {
            // The status alone classifies the failure; an unreadable body
            // only loses the message.
            let body = response.text().await.unwrap_or_default();
            return Err(error_from_response(status, content_type.as_deref(), &body));
        }

        let body = response.text().await.map_err(RequestError::network)?;
        parse_success_body(content_type.as_deref(), body)
    }
}

/// Description of a single logical request.
#[derive(Clone, Debug)]
pub struct RequestSpec {
    pub method: Method,
    /// Path relative to the executor's base URL, or an absolute URL.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Option<Value>,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PUT, path).with_body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Adds a header. Caller headers override the defaults set by the
    /// executor.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// Decoded response body.
#[derive(Clone, Debug, PartialEq)]
pub enum ParsedBody {
    Json(Value),
    Text(String),
    Empty,
}

impl ParsedBody {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_json<T: DeserializeOwned>(self) -> Result<T, RequestError> {
        match self {
            Self::Json(value) => serde_json::from_value(value)
                .map_err(|err| RequestError::Parse(format!("unexpected response shape: {err}"))),
            Self::Text(_) => Err(RequestError::Parse(
                "expected a json response body, got text".to_string(),
            )),
            Self::Empty => Err(RequestError::Parse(
                "expected a json response body, got none".to_string(),
            )),
        }
    }

    /// Human-readable message carried by an error body: `message`, then
    /// `detail` for JSON bodies, the trimmed text otherwise.
    pub fn message(&self) -> Option<String> {
        match self {
            Self::Json(value) => ["message", "detail"].iter().find_map(|key| {
                match value.get(*key)? {
                    Value::Null => None,
                    Value::String(text) if text.is_empty() => None,
                    Value::String(text) => Some(text.clone()),
                    other => Some(other.to_string()),
                }
            }),
            Self::Text(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.chars().take(ERROR_BODY_SNIPPET_LEN).collect())
                }
            }
            Self::Empty => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RequestError {
    /// No response was received.
    #[error("request failed: {message}")]
    Network {
        /// Identifying error code such as `ECONNREFUSED`, when one is known.
        code: Option<String>,
        message: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("http status {status}: {message}")]
    HttpStatus {
        status: StatusCode,
        message: String,
        payload: Option<ParsedBody>,
    },

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl RequestError {
    fn network(source: reqwest::Error) -> Self {
        Self::Network {
            code: network_error_code(&source),
            message: source.to_string(),
            source,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Network { .. } => FailureKind::Network,
            Self::HttpStatus { .. } => FailureKind::HttpStatus,
            Self::Parse(_) => FailureKind::Parse,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Network { message, .. } | Self::HttpStatus { message, .. } => message,
            Self::Parse(message) => message,
        }
    }

    pub fn payload(&self) -> Option<&ParsedBody> {
        match self {
            Self::HttpStatus { payload, .. } => payload.as_ref(),
            _ => None,
        }
    }

    pub fn network_code(&self) -> Option<&str> {
        match self {
            Self::Network { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub fn is_retryable(&self, policy: &RetryPolicy) -> bool {
        match self {
            Self::Network { code, .. } => policy.is_network_code_retryable(code.as_deref()),
            Self::HttpStatus { status, .. } => policy.is_status_retryable(status.as_u16()),
            Self::Parse(_) => false,
        }
    }
}

fn is_json_content_type(content_type: Option<&str>) -> bool {
    content_type
        .map(|value| {
            let value = value.to_ascii_lowercase();
            value.contains("application/json") || value.contains("+json")
        })
        .unwrap_or(false)
}

fn parse_success_body(content_type: Option<&str>, body: String) -> Result<ParsedBody, RequestError> {
    if body.trim().is_empty() {
        return Ok(ParsedBody::Empty);
    }
    if is_json_content_type(content_type) {
        return serde_json::from_str(&body)
            .map(ParsedBody::Json)
            .map_err(|err| RequestError::Parse(err.to_string()));
    }
    Ok(ParsedBody::Text(body))
}

fn error_from_response(status: StatusCode, content_type: Option<&str>, body: &str) -> RequestError {
    let fallback = format!("request failed with status {}", status.as_u16());

    let payload = if body.trim().is_empty() {
        None
    } else if is_json_content_type(content_type) {
        serde_json::from_str::<Value>(body).ok().map(ParsedBody::Json)
    } else {
        Some(ParsedBody::Text(body.to_string()))
    };

    let message = payload
        .as_ref()
        .and_then(ParsedBody::message)
        .unwrap_or(fallback);

    RequestError::HttpStatus {
        status,
        message,
        payload,
    }
}

fn network_error_code(error: &reqwest::Error) -> Option<String> {
    if error.is_builder() {
        return Some(INVALID_REQUEST_CODE.to_string());
    }
    if error.is_timeout() {
        return Some("ETIMEDOUT".to_string());
    }

    let mut source = error.source();
    while let Some(inner) = source {
        if let Some(io_error) = inner.downcast_ref::<io::Error>() {
            if let Some(code) = io_error_code(io_error.kind()) {
                return Some(code.to_string());
            }
        }
        let text = inner.to_string().to_ascii_lowercase();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            let code = if text.contains("temporary failure") {
                "EAI_AGAIN"
            } else {
                "ENOTFOUND"
            };
            return Some(code.to_string());
        }
        source = inner.source();
    }
    None
}

fn io_error_code(kind: io::ErrorKind) -> Option<&'static str> {
    match kind {
        io::ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
        io::ErrorKind::ConnectionReset | io::ErrorKind::UnexpectedEof => Some("ECONNRESET"),
        io::ErrorKind::ConnectionAborted => Some("ECONNABORTED"),
        io::ErrorKind::TimedOut => Some("ETIMEDOUT"),
        io::ErrorKind::BrokenPipe => Some("EPIPE"),
        _ => None,
    }
}
