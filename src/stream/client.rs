//! Stream endpoint configuration and connection factory.

use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use url::Url;

use crate::config::{ClientDefaults, ConfigError};
use crate::credentials::SharedCredentials;
use crate::failure::FailureKind;
use crate::retry::RetryPolicy;
use crate::stream::connection::StreamConnection;

const SESSION_PATH: [&str; 2] = ["ws", "debates"];

/// Reconnect, heartbeat, and liveness settings for stream connections.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamOptions {
    pub reconnect_enabled: bool,
    /// `max_attempts` bounds consecutive failed reconnects.
    pub reconnect_policy: RetryPolicy,
    pub heartbeat_interval: Duration,
    /// Upper bound on a single connect attempt.
    pub connect_timeout: Option<Duration>,
    /// Closes the socket when nothing is received for this long.
    pub idle_timeout: Option<Duration>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            reconnect_enabled: true,
            reconnect_policy: RetryPolicy::reconnect_default(),
            heartbeat_interval: ClientDefaults::HEARTBEAT_INTERVAL,
            connect_timeout: Some(ClientDefaults::CONNECT_TIMEOUT),
            idle_timeout: None,
        }
    }
}

/// Entry point for creating stream connections.
#[derive(Clone)]
pub struct StreamClient {
    endpoint: String,
    credentials: SharedCredentials,
    options: Arc<StreamOptions>,
}

impl StreamClient {
    pub fn new(credentials: SharedCredentials) -> Self {
        Self {
            endpoint: ClientDefaults::STREAM_BASE_URL.to_string(),
            credentials,
            options: Arc::new(StreamOptions::default()),
        }
    }

    /// Sets the websocket base endpoint, e.g. `wss://agora.example`.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint = endpoint.trim_end().to_string();
        self
    }

    pub fn with_options(mut self, options: StreamOptions) -> Result<Self, ConfigError> {
        options.reconnect_policy.validate()?;
        let durations = [
            ("heartbeat_interval", Some(options.heartbeat_interval)),
            ("connect_timeout", options.connect_timeout),
            ("idle_timeout", options.idle_timeout),
        ];
        for (name, value) in durations {
            if value.is_some_and(|value| value.is_zero()) {
                return Err(ConfigError::Invalid(format!("{name} must be > 0")));
            }
        }
        self.options = Arc::new(options);
        Ok(self)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    pub(crate) fn credentials(&self) -> &SharedCredentials {
        &self.credentials
    }

    /// Creates an idle connection for `session_key` without connecting.
    pub fn open(&self, session_key: impl Into<String>) -> StreamConnection {
        StreamConnection::new(self.clone(), session_key.into())
    }

    /// Creates a connection for `session_key` and starts connecting.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(
        &self,
        session_key: impl Into<String>,
    ) -> Result<StreamConnection, StreamClientError> {
        let connection = self.open(session_key);
        connection.connect()?;
        Ok(connection)
    }

    /// Builds `{endpoint}/ws/debates/{session_key}?token={token}`.
    pub(crate) fn session_url(
        &self,
        session_key: &str,
        token: &SecretString,
    ) -> Result<Url, StreamClientError> {
        let mut url = Url::parse(&self.endpoint)?;
        url.path_segments_mut()
            .map_err(|_| {
                StreamClientError::Protocol(format!(
                    "stream endpoint cannot carry a path: {}",
                    self.endpoint
                ))
            })?
            .pop_if_empty()
            .extend(SESSION_PATH)
            .push(session_key);
        url.query_pairs_mut()
            .append_pair("token", token.expose_secret());
        Ok(url)
    }
}

/// Errors produced by stream transport and protocol handling.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// No bearer credential was available; no transport was opened.
    #[error("no credential available for stream connection")]
    MissingCredential,

    /// Automatic reconnects gave up.
    #[error("reconnect attempts exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: usize },

    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// A connect attempt did not complete in time.
    #[error("connect attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Stream endpoint is not a valid URL.
    #[error("invalid stream endpoint: {0}")]
    Endpoint(#[from] url::ParseError),

    /// Stream protocol contract error.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl StreamClientError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::MissingCredential => FailureKind::MissingCredential,
            Self::ReconnectExhausted { .. } => FailureKind::ReconnectExhausted,
            Self::WebSocket(_) | Self::ConnectTimeout(_) => FailureKind::Network,
            Self::Json(_) | Self::Protocol(_) => FailureKind::Parse,
            Self::Endpoint(_) => FailureKind::Config,
        }
    }
}
