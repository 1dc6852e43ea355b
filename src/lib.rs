//! XMPP client connection core.
//!
//! [`Connection`] owns one client-to-server session: transport setup,
//! STARTTLS, SASL, resource binding, XEP-0198 stream management with
//! resumption, and automatic reconnection. Inbound stanzas reach the
//! application through [`StanzaCollector`]s and stanza listeners; lifecycle
//! changes are published as [`ConnectionEvent`]s.

pub mod collector;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod element;
pub mod error;
pub mod events;
pub mod extensions;
pub mod filter;
pub mod jid;
pub mod ns;
pub mod reconnect;
pub mod sasl;
pub mod sm;
pub mod stanza;
pub mod stream;
pub mod transport;

#[cfg(test)]
mod testing;

pub use collector::StanzaCollector;
pub use config::{
    ConnectionConfig, ConnectionConfigBuilder, FlushStrategy, ReconnectionPolicy,
    StreamManagementConfig, TlsPolicy, UnackedOverflowPolicy,
};
pub use connection::{Connection, StreamState};
pub use dispatch::ListenerId;
pub use element::Element;
pub use error::{NegotiationError, StreamErrorCondition, XmppError};
pub use events::{ConnectionEvent, EventBus, TrafficDirection};
pub use jid::Jid;
pub use reconnect::ReconnectionState;
pub use stanza::{ErrorType, IqType, StanzaError, StanzaKind};
