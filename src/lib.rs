//! Resilient network client core for the Agora debate API.
//!
//! The crate is organized by transport surface:
//! - `request`: request/response executor with failure classification and
//!   bounded exponential backoff.
//! - `stream`: persistent websocket connections with reconnect, heartbeat,
//!   outbound buffering, and inbound dispatch.
//! - `retry`: shared retry policy and timeout utilities.
//! - `credentials`: bearer credential access shared by both surfaces.
//! - `config`: defaults and the deserialisable configuration surface.

/// Defaults and client configuration.
pub mod config;
/// Bearer credential provider.
pub mod credentials;
/// Failure vocabulary shared by request and stream errors.
pub mod failure;
/// Request executor and response types.
pub mod request;
/// Retry and timeout helpers used across the crate.
pub mod retry;
/// Realtime stream client, connection, and registry.
pub mod stream;

pub use config::{ClientConfig, ClientDefaults, ConfigError};
pub use credentials::{CredentialProvider, SharedCredentials, StaticCredentials};
pub use failure::FailureKind;
pub use request::{ParsedBody, RequestError, RequestExecutor, RequestExecutorOptions, RequestSpec};
pub use retry::RetryPolicy;
pub use stream::client::{StreamClient, StreamClientError, StreamOptions};
pub use stream::connection::{ConnectionState, ReconnectState, SendOutcome, StreamConnection};
pub use stream::dispatch::{ConnectionEvent, EventHandlers};
pub use stream::proto::{Channel, InboundMessage};
pub use stream::registry::ConnectionRegistry;
