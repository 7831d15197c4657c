//! Channel → handler dispatch table and connection lifecycle notifications.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::stream::client::StreamClientError;
use crate::stream::proto::{Channel, InboundMessage};

pub type MessageHandler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;
pub type LifecycleHandler = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// Lifecycle notifications emitted by a [`StreamConnection`].
///
/// [`StreamConnection`]: crate::stream::connection::StreamConnection
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    /// Transport opened; the reconnect counter was reset.
    Opened,
    /// Transport closed or failed to open.
    Closed { reason: String },
    /// A reconnect attempt was scheduled.
    ReconnectScheduled { attempt: usize, delay: Duration },
    /// Automatic reconnects gave up. Emitted once per exhausted cycle.
    ReconnectFailed { attempts: usize },
    /// No bearer credential was available at connect time.
    MissingCredential,
}

impl ConnectionEvent {
    /// The failure this event surfaces to subscribers, if it carries one.
    pub fn error(&self) -> Option<StreamClientError> {
        match self {
            Self::MissingCredential => Some(StreamClientError::MissingCredential),
            Self::ReconnectFailed { attempts } => Some(StreamClientError::ReconnectExhausted {
                attempts: *attempts,
            }),
            _ => None,
        }
    }
}

/// Handler set with at most one handler per channel.
#[derive(Clone, Default)]
pub struct EventHandlers {
    channels: HashMap<Channel, MessageHandler>,
    lifecycle: Option<LifecycleHandler>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `channel`, replacing any previous one.
    pub fn on<F>(mut self, channel: Channel, handler: F) -> Self
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.set(channel, Arc::new(handler));
        self
    }

    /// Registers the lifecycle handler, replacing any previous one.
    pub fn on_lifecycle<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.lifecycle = Some(Arc::new(handler));
        self
    }

    pub fn set(&mut self, channel: Channel, handler: MessageHandler) {
        self.channels.insert(channel, handler);
    }

    pub fn set_lifecycle(&mut self, handler: LifecycleHandler) {
        self.lifecycle = Some(handler);
    }

    /// Removes the handler for `channel`, returning whether one existed.
    pub fn off(&mut self, channel: Channel) -> bool {
        self.channels.remove(&channel).is_some()
    }

    /// Folds `other` into this set. Handlers in `other` win.
    pub fn merge(&mut self, other: EventHandlers) {
        self.channels.extend(other.channels);
        if other.lifecycle.is_some() {
            self.lifecycle = other.lifecycle;
        }
    }

    /// Routes `message` to its channel handler, then to the catch-all.
    ///
    /// Returns `false` when the discriminator is not recognized.
    pub fn dispatch(&self, message: &InboundMessage) -> bool {
        let channel = message.channel();
        if let Some(handler) = channel.and_then(|channel| self.channels.get(&channel)) {
            handler(message);
        }
        if let Some(any) = self.channels.get(&Channel::Any) {
            any(message);
        }
        channel.is_some()
    }

    pub fn notify(&self, event: &ConnectionEvent) {
        if let Some(handler) = self.lifecycle.as_ref() {
            handler(event);
        }
    }
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut channels: Vec<&'static str> =
            self.channels.keys().map(|channel| channel.as_str()).collect();
        channels.sort_unstable();
        f.debug_struct("EventHandlers")
            .field("channels", &channels)
            .field("lifecycle", &self.lifecycle.is_some())
            .finish()
    }
}
