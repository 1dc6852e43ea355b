//! Connection lifecycle events.
//!
//! The reader, writer, negotiation and reconnection code publish into one
//! broadcast channel per connection. Applications and debuggers subscribe to
//! it; a slow subscriber only lags itself (it sees `RecvError::Lagged`).

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::connection::StreamState;
use crate::element::Element;

/// Events buffered per subscriber before it starts lagging.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConnectionEvent {
    /// The transport is connected and the stream is open.
    Connected { conn_id: u64 },

    /// The session is usable: authenticated and bound, or resumed.
    Authenticated { jid: String, resumed: bool },

    /// Explicit disconnect completed.
    Closed,

    /// The connection was lost or closed because of an error.
    ClosedOnError { error: String },

    StateChanged { state: StreamState },

    Reconnecting { attempt: u32, delay_ms: u64 },

    ReconnectionAttemptFailed { attempt: u32, error: String },

    ReconnectionGaveUp { attempts: u32 },

    StreamResumed { replayed: usize },

    /// The server confirmed these stanzas as handled.
    StanzasAcknowledged { stanzas: Vec<Element> },

    /// These stanzas can no longer be proven delivered.
    StanzasUndelivered { stanzas: Vec<Element>, reason: String },

    /// Raw wire traffic, published only when traffic debugging is enabled.
    Traffic {
        direction: TrafficDirection,
        xml: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ConnectionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: ConnectionEvent) {
        // No subscribers is not an error
        if self.tx.send(event).is_err() {
            trace!("Connection event dropped: no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
