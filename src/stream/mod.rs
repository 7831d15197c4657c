//! Realtime stream modules.
//!
//! - `client`: endpoint, credential, and option handling; connection factory.
//! - `connection`: per-session state machine with reconnect, heartbeat, and
//!   outbound queue.
//! - `dispatch`: channel → handler table and lifecycle notifications.
//! - `proto`: inbound frame envelope and client-originated messages.
//! - `registry`: at-most-one connection per session key.

/// Stream endpoint configuration and connection factory.
pub mod client;
/// Persistent connection state machine.
pub mod connection;
/// Handler registration and inbound dispatch.
pub mod dispatch;
/// Stream protocol messages.
pub mod proto;
/// Session key → connection registry.
pub mod registry;
