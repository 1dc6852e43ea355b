//! Error types for the connection core.
//!
//! Synchronous calls (`connect`, `send_*`, collector waits) return these
//! directly. Failures detected on the reader/writer tasks are reported as
//! `ConnectionEvent::ClosedOnError` with the rendered error.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::element::Element;
use crate::jid::BadJid;
use crate::sasl::SaslError;
use crate::stanza::StanzaError;

/// Stream-level error sent by the server (`<stream:error/>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamErrorCondition {
    /// Defined condition, e.g. `conflict` or `system-shutdown`.
    pub condition: String,
    pub text: Option<String>,
}

impl fmt::Display for StreamErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.text {
            Some(text) => write!(f, "{} ({})", self.condition, text),
            None => f.write_str(&self.condition),
        }
    }
}

/// Failures of the negotiation sequence. All of them abort the connect attempt.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("server did not send a stream header")]
    MissingStreamHeader,

    #[error("TLS is required but the server does not offer STARTTLS")]
    TlsRequired,

    #[error("server requires STARTTLS but TLS is disabled by configuration")]
    TlsDisabled,

    #[error("server rejected STARTTLS: {0}")]
    TlsRejected(String),

    #[error("no mutually supported SASL mechanism (server offers: {offered:?})")]
    NoCommonMechanism { offered: Vec<String> },

    /// Every candidate mechanism was tried and refused, in preference order.
    #[error("authentication failed ({})", format_attempts(.attempts))]
    AuthenticationFailed { attempts: Vec<(String, String)> },

    #[error("resource binding failed: {0}")]
    BindFailed(String),

    #[error("session establishment failed: {0}")]
    SessionFailed(String),

    #[error("unexpected element during negotiation: {0}")]
    UnexpectedElement(String),
}

fn format_attempts(attempts: &[(String, String)]) -> String {
    attempts
        .iter()
        .map(|(mechanism, condition)| format!("{mechanism}: {condition}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Top-level error type of the crate.
#[derive(Debug, Error)]
pub enum XmppError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("failed to resolve XMPP server: {0}")]
    Resolve(String),

    #[error("TCP connect timed out after {}s to {host}:{port}", .timeout.as_secs())]
    ConnectTimeout {
        host: String,
        port: u16,
        timeout: Duration,
    },

    #[error("invalid XML: {0}")]
    Xml(String),

    #[error("incoming element exceeds {limit} bytes")]
    StanzaTooLarge { limit: usize },

    #[error("stream error: {0}")]
    Stream(StreamErrorCondition),

    #[error("stream closed by the server")]
    StreamClosed,

    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("SASL mechanism error: {0}")]
    Sasl(#[from] SaslError),

    #[error("no response within {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    #[error(transparent)]
    Stanza(#[from] StanzaError),

    #[error("invalid stanza: {0}")]
    InvalidStanza(String),

    /// The server acknowledged stanzas this session never sent.
    #[error(
        "stream management counter error: server acknowledged h={h} but last ack was {last_acked} with {outstanding} stanza(s) outstanding"
    )]
    CounterMismatch {
        h: u32,
        last_acked: u32,
        outstanding: usize,
    },

    /// The server sent a stream management element that cannot be applied.
    #[error("stream management protocol violation: {0}")]
    StreamManagement(String),

    #[error("unacknowledged stanza queue is full ({limit} stanzas)")]
    UnackedQueueFull {
        limit: usize,
        undelivered: Vec<Element>,
    },

    #[error("stream resumption failed: {}", .condition.as_deref().unwrap_or("unknown"))]
    ResumptionFailed {
        condition: Option<String>,
        undelivered: Vec<Element>,
    },

    #[error("no data received for {}s", .0.as_secs())]
    Inactive(Duration),

    #[error(transparent)]
    Jid(#[from] BadJid),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl XmppError {
    /// Whether losing the connection with this error should start the
    /// reconnection manager. Errors a retry cannot fix return false, and so
    /// do failures that void the delivery guarantees of the session.
    pub fn allows_reconnect(&self) -> bool {
        match self {
            XmppError::Stream(cond) => {
                !matches!(cond.condition.as_str(), "conflict" | "not-authorized")
            }
            XmppError::Negotiation(err) => matches!(
                err,
                NegotiationError::MissingStreamHeader
                    | NegotiationError::TlsRejected(_)
                    | NegotiationError::UnexpectedElement(_)
            ),
            XmppError::Sasl(_)
            | XmppError::NotConnected
            | XmppError::AlreadyConnected
            | XmppError::Stanza(_)
            | XmppError::InvalidStanza(_)
            | XmppError::CounterMismatch { .. }
            | XmppError::StreamManagement(_)
            | XmppError::UnackedQueueFull { .. }
            | XmppError::Jid(_)
            | XmppError::Config(_) => false,
            _ => true,
        }
    }

    /// Elements this error proves were not delivered, if any.
    pub fn undelivered(&self) -> &[Element] {
        match self {
            XmppError::UnackedQueueFull { undelivered, .. }
            | XmppError::ResumptionFailed { undelivered, .. } => undelivered,
            _ => &[],
        }
    }
}
