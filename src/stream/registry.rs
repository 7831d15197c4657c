//! Session key → connection registry.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::stream::client::{StreamClient, StreamClientError};
use crate::stream::connection::{ConnectionState, StreamConnection};
use crate::stream::dispatch::EventHandlers;

/// Keeps at most one live connection per session key.
///
/// Construct one per application context; registries do not share state.
/// Entries whose connection was disconnected directly are dropped the next
/// time the registry is consulted.
pub struct ConnectionRegistry {
    client: StreamClient,
    connections: Mutex<HashMap<String, StreamConnection>>,
}

impl ConnectionRegistry {
    pub fn new(client: StreamClient) -> Self {
        Self {
            client,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the connection for `session_key`, creating it on first use,
    /// and merges `handlers` into it. Later handlers replace earlier ones
    /// per channel.
    ///
    /// An existing open or connecting instance is reused as is; an idle or
    /// closed one is (re)connected right away. A connection that was
    /// disconnected directly is replaced by a fresh one. A missing
    /// credential is reported but the connection stays registered.
    pub fn subscribe(
        &self,
        session_key: impl Into<String>,
        handlers: EventHandlers,
    ) -> Result<StreamConnection, StreamClientError> {
        let session_key = session_key.into();
        let connection = {
            let mut connections = self.lock_connections();
            match connections.get(&session_key) {
                Some(existing) => existing.clone(),
                None => {
                    debug!(event = "stream_registry_created", session_key = %session_key);
                    let connection = self.client.open(session_key.clone());
                    connections.insert(session_key, connection.clone());
                    connection
                }
            }
        };

        connection.merge_handlers(handlers);
        if matches!(
            connection.state(),
            ConnectionState::Idle | ConnectionState::Closed
        ) {
            connection.connect()?;
        }
        Ok(connection)
    }

    pub fn get(&self, session_key: &str) -> Option<StreamConnection> {
        self.lock_connections().get(session_key).cloned()
    }

    /// Disconnects and forgets the connection for `session_key`.
    pub fn disconnect(&self, session_key: &str) -> bool {
        let removed = self.lock_connections().remove(session_key);
        match removed {
            Some(connection) => {
                connection.disconnect();
                true
            }
            None => false,
        }
    }

    /// Disconnects every registered connection.
    pub fn disconnect_all(&self) {
        let drained: Vec<StreamConnection> = self
            .lock_connections()
            .drain()
            .map(|(_, connection)| connection)
            .collect();
        for connection in drained {
            connection.disconnect();
        }
    }

    pub fn len(&self) -> usize {
        self.lock_connections().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_connections().is_empty()
    }

    fn lock_connections(&self) -> MutexGuard<'_, HashMap<String, StreamConnection>> {
        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        connections.retain(|session_key, connection| {
            let live = !connection.is_terminated();
            if !live {
                debug!(event = "stream_registry_pruned", session_key = %session_key);
            }
            live
        });
        connections
    }
}
