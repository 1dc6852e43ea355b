//! XML namespaces used by the connection core.

pub const CLIENT: &str = "jabber:client";

pub const STREAM: &str = "http://etherx.jabber.org/streams";

pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";

pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";

/// RFC 3921 session establishment, still advertised by some servers.
pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";

pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

/// XEP-0198 Stream Management, version 3.
pub const SM: &str = "urn:xmpp:sm:3";
