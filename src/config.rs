//! Connection configuration.
//!
//! Everything a connection needs is fixed at build time: the account, how to
//! reach and secure the server, timeouts, stream management and reconnection
//! policies. `ConnectionConfig::builder(jid, password)` starts from defaults
//! suited to an interactive client.

use std::fmt;
use std::time::Duration;

use rand::Rng;

use crate::error::XmppError;
use crate::jid::Jid;
use crate::sasl::{Credentials, SaslProviders};

/// TCP connection timeout for outbound XMPP server connections.
///
/// Without it the OS default applies, which on some platforms is 30 to 120
/// seconds for unreachable hosts. 15 seconds tolerates high-latency links and
/// still fails fast enough to move on to the next SRV endpoint.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout for each server reply during negotiation (stream header, features,
/// `<proceed/>`, SASL challenges, bind result, `<enabled/>`).
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Default wait for a correlated reply (`send_iq`, `send_and_await`).
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `send_stanza` may wait for space in a bounded outbound queue.
pub const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum size of one incoming top-level element.
///
/// 1 MB is generous for XMPP: typical stanzas are a few KB and the largest
/// legitimate ones (vCard avatars, MAM result pages) rarely exceed 100 KB.
/// Beyond it the server is considered broken and the connection is dropped.
pub const DEFAULT_MAX_STANZA_SIZE: usize = 1_024 * 1_024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsPolicy {
    /// Refuse to authenticate over a plaintext stream.
    Required,
    /// Use STARTTLS when the server offers it.
    IfAvailable,
    /// Never negotiate STARTTLS. Direct TLS endpoints are still encrypted.
    Disabled,
}

/// When the writer flushes the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStrategy {
    /// Flush after every element.
    PerElement,
    /// Flush once the outbound queue is drained.
    WhenIdle,
}

/// What happens when the unacknowledged queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnackedOverflowPolicy {
    /// Reject the overflowing stanza and keep the connection.
    FailStanza,
    /// Close the connection; outstanding stanzas are reported undelivered.
    CloseConnection,
}

#[derive(Debug, Clone)]
pub struct StreamManagementConfig {
    pub enabled: bool,
    /// Ask the server for a resumable session.
    pub resumption: bool,
    /// Preferred resumption window sent as `max`; the server may lower it.
    pub preferred_max: Option<Duration>,
    /// Request an ack after this many stanzas.
    pub ack_request_threshold: u32,
    /// Request an ack when the writer has been idle this long with stanzas
    /// outstanding.
    pub ack_idle_interval: Duration,
    pub max_unacked: usize,
    pub overflow_policy: UnackedOverflowPolicy,
}

impl Default for StreamManagementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            resumption: true,
            preferred_max: Some(Duration::from_secs(300)),
            ack_request_threshold: 5,
            ack_idle_interval: Duration::from_secs(1),
            max_unacked: 500,
            overflow_policy: UnackedOverflowPolicy::FailStanza,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectionPolicy {
    pub enabled: bool,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Relative jitter in `0.0..=1.0` applied to every delay.
    pub jitter: f64,
    /// Give up after this many failed attempts; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(120),
            jitter: 0.2,
            max_attempts: Some(10),
        }
    }
}

impl ReconnectionPolicy {
    /// Delay before the given attempt (1-based): exponential, capped, jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        base.mul_f64(factor).min(self.max_delay)
    }

    pub fn exhausted(&self, failed_attempts: u32) -> bool {
        self.max_attempts
            .map(|max| failed_attempts >= max)
            .unwrap_or(false)
    }
}

#[derive(Clone)]
pub struct ConnectionConfig {
    pub jid: Jid,
    pub(crate) password: String,
    pub resource: Option<String>,
    /// Server input (`tls://host:port`, `host:port`, ...). `None` resolves
    /// the JID domain through SRV.
    pub server: Option<String>,
    pub tls: TlsPolicy,
    /// Disable certificate verification. Only for test servers.
    pub dangerous_insecure_tls: bool,
    pub allow_plain_without_tls: bool,
    pub sasl: SaslProviders,
    pub connect_timeout: Duration,
    pub negotiation_timeout: Duration,
    pub reply_timeout: Duration,
    /// Bound of the outbound queue; `None` is unbounded.
    pub outbound_capacity: Option<usize>,
    pub enqueue_timeout: Duration,
    pub max_stanza_size: usize,
    /// Declare the transport dead after this long without inbound data.
    pub inactivity_timeout: Option<Duration>,
    /// Publish raw traffic as events and log it at debug level.
    pub debug_traffic: bool,
    pub flush: FlushStrategy,
    pub stream_management: StreamManagementConfig,
    pub reconnection: ReconnectionPolicy,
}

impl ConnectionConfig {
    pub fn builder(jid: &str, password: impl Into<String>) -> ConnectionConfigBuilder {
        ConnectionConfigBuilder {
            jid: jid.to_string(),
            password: password.into(),
            resource: None,
            server: None,
            tls: TlsPolicy::Required,
            dangerous_insecure_tls: false,
            allow_plain_without_tls: false,
            sasl: SaslProviders::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            outbound_capacity: None,
            enqueue_timeout: DEFAULT_ENQUEUE_TIMEOUT,
            max_stanza_size: DEFAULT_MAX_STANZA_SIZE,
            inactivity_timeout: None,
            debug_traffic: false,
            flush: FlushStrategy::WhenIdle,
            stream_management: StreamManagementConfig::default(),
            reconnection: ReconnectionPolicy::default(),
        }
    }

    pub fn domain(&self) -> &str {
        self.jid.domainpart()
    }

    pub(crate) fn credentials(&self) -> Credentials {
        Credentials {
            username: self.jid.localpart().unwrap_or_default().to_string(),
            password: self.password.clone(),
            authzid: None,
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("jid", &self.jid)
            .field("resource", &self.resource)
            .field("server", &self.server)
            .field("tls", &self.tls)
            .field("dangerous_insecure_tls", &self.dangerous_insecure_tls)
            .field("sasl", &self.sasl)
            .field("stream_management", &self.stream_management)
            .field("reconnection", &self.reconnection)
            .finish_non_exhaustive()
    }
}

pub struct ConnectionConfigBuilder {
    jid: String,
    password: String,
    resource: Option<String>,
    server: Option<String>,
    tls: TlsPolicy,
    dangerous_insecure_tls: bool,
    allow_plain_without_tls: bool,
    sasl: SaslProviders,
    connect_timeout: Duration,
    negotiation_timeout: Duration,
    reply_timeout: Duration,
    outbound_capacity: Option<usize>,
    enqueue_timeout: Duration,
    max_stanza_size: usize,
    inactivity_timeout: Option<Duration>,
    debug_traffic: bool,
    flush: FlushStrategy,
    stream_management: StreamManagementConfig,
    reconnection: ReconnectionPolicy,
}

impl ConnectionConfigBuilder {
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn tls(mut self, policy: TlsPolicy) -> Self {
        self.tls = policy;
        self
    }

    pub fn dangerous_insecure_tls(mut self, enabled: bool) -> Self {
        self.dangerous_insecure_tls = enabled;
        self
    }

    pub fn allow_plain_without_tls(mut self, allowed: bool) -> Self {
        self.allow_plain_without_tls = allowed;
        self
    }

    pub fn sasl(mut self, providers: SaslProviders) -> Self {
        self.sasl = providers;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = Some(capacity);
        self
    }

    pub fn enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.enqueue_timeout = timeout;
        self
    }

    pub fn max_stanza_size(mut self, bytes: usize) -> Self {
        self.max_stanza_size = bytes;
        self
    }

    pub fn inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = Some(timeout);
        self
    }

    pub fn debug_traffic(mut self, enabled: bool) -> Self {
        self.debug_traffic = enabled;
        self
    }

    pub fn flush(mut self, strategy: FlushStrategy) -> Self {
        self.flush = strategy;
        self
    }

    pub fn stream_management(mut self, config: StreamManagementConfig) -> Self {
        self.stream_management = config;
        self
    }

    pub fn reconnection(mut self, policy: ReconnectionPolicy) -> Self {
        self.reconnection = policy;
        self
    }

    pub fn build(self) -> Result<ConnectionConfig, XmppError> {
        let jid = Jid::new(&self.jid)?;
        if jid.localpart().is_none() {
            return Err(XmppError::Config(format!(
                "account JID '{jid}' has no localpart"
            )));
        }
        // A resource in the JID is the requested resource unless set explicitly
        let resource = self
            .resource
            .or_else(|| jid.resourcepart().map(str::to_string));
        if resource.as_deref() == Some("") {
            return Err(XmppError::Config("resource must not be empty".to_string()));
        }

        if self.max_stanza_size == 0 {
            return Err(XmppError::Config("max_stanza_size must be positive".to_string()));
        }
        if self.outbound_capacity == Some(0) {
            return Err(XmppError::Config(
                "outbound_capacity must be positive".to_string(),
            ));
        }
        let sm = &self.stream_management;
        if sm.ack_request_threshold == 0 {
            return Err(XmppError::Config(
                "ack_request_threshold must be positive".to_string(),
            ));
        }
        if sm.max_unacked == 0 {
            return Err(XmppError::Config("max_unacked must be positive".to_string()));
        }
        let rc = &self.reconnection;
        if rc.base_delay > rc.max_delay {
            return Err(XmppError::Config(
                "reconnection base_delay exceeds max_delay".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&rc.jitter) {
            return Err(XmppError::Config(
                "reconnection jitter must be within 0.0..=1.0".to_string(),
            ));
        }

        Ok(ConnectionConfig {
            jid: jid.to_bare(),
            password: self.password,
            resource,
            server: self.server.filter(|s| !s.trim().is_empty()),
            tls: self.tls,
            dangerous_insecure_tls: self.dangerous_insecure_tls,
            allow_plain_without_tls: self.allow_plain_without_tls,
            sasl: self.sasl,
            connect_timeout: self.connect_timeout,
            negotiation_timeout: self.negotiation_timeout,
            reply_timeout: self.reply_timeout,
            outbound_capacity: self.outbound_capacity,
            enqueue_timeout: self.enqueue_timeout,
            max_stanza_size: self.max_stanza_size,
            inactivity_timeout: self.inactivity_timeout,
            debug_traffic: self.debug_traffic,
            flush: self.flush,
            stream_management: self.stream_management,
            reconnection: self.reconnection,
        })
    }
}
