//! Stream negotiation, run on the connecting task before the session is
//! split into reader and writer.
//!
//! A fresh session goes through transport, STARTTLS, SASL, resource binding,
//! the optional legacy session and stream management enablement. A
//! resumption attempt replaces binding with `<resume/>`; it is sent before
//! SASL when the server already advertises stream management on the
//! unauthenticated stream, after SASL otherwise. When the server refuses to
//! resume, negotiation continues with a fresh session on the same stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{debug, info, trace, warn};

use super::{StateCell, StreamState};
use crate::config::{ConnectionConfig, TlsPolicy};
use crate::element::Element;
use crate::error::{NegotiationError, XmppError};
use crate::events::{ConnectionEvent, EventBus};
use crate::jid::Jid;
use crate::ns;
use crate::sasl::{SaslError, SaslMechanism};
use crate::sm::protocol::{self, SmNonza};
use crate::sm::{Resumed, SharedStreamManagement};
use crate::stanza::{self, IqType, StanzaError};
use crate::stream::{StreamFeatures, TrafficTap, XmlStream};
use crate::transport::dns::{endpoints_for, parse_server_input, ParsedServer};
use crate::transport::{self, Endpoint};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A negotiated stream, ready to be split.
pub(super) struct Negotiated {
    pub(super) stream: XmlStream,
    pub(super) conn_id: u64,
    pub(super) jid: Jid,
    pub(super) features: StreamFeatures,
    pub(super) resumed: Option<Resumed>,
    /// Stanzas the server sent before negotiation finished.
    pub(super) early: Vec<Element>,
}

enum SaslOutcome {
    Success,
    Failure(String),
}

pub(super) struct Negotiator<'a> {
    pub(super) config: &'a ConnectionConfig,
    pub(super) events: &'a EventBus,
    pub(super) sm: &'a SharedStreamManagement,
    pub(super) state: &'a StateCell,
}

fn unexpected(element: &Element) -> XmppError {
    NegotiationError::UnexpectedElement(element.name().to_string()).into()
}

fn stanza_condition(reply: &Element) -> String {
    StanzaError::from_stanza(reply)
        .map(|error| error.condition)
        .unwrap_or_else(|| "undefined-condition".to_string())
}

/// SASL payloads are base64; an empty one travels as `=`.
fn encode_payload(data: &[u8]) -> String {
    if data.is_empty() {
        "=".to_string()
    } else {
        BASE64.encode(data)
    }
}

fn decode_payload(text: &str) -> Result<Vec<u8>, SaslError> {
    let text = text.trim();
    if text.is_empty() || text == "=" {
        return Ok(Vec::new());
    }
    Ok(BASE64.decode(text)?)
}

fn sasl_failure_condition(failure: &Element) -> String {
    let condition = failure
        .children()
        .find(|el| el.namespace() == Some(ns::SASL) && el.local_name() != "text")
        .map(|el| el.local_name().to_string())
        .unwrap_or_else(|| "not-authorized".to_string());
    match failure.child("text", ns::SASL).map(|t| t.text()) {
        Some(text) if !text.is_empty() => format!("{condition} ({text})"),
        _ => condition,
    }
}

/// Endpoint from the `location` the server suggested for resumption.
fn location_endpoint(location: &str, domain: &str) -> Option<Endpoint> {
    match parse_server_input(location) {
        ParsedServer::Direct(mut endpoint) => {
            endpoint.domain.get_or_insert_with(|| domain.to_string());
            Some(endpoint)
        }
        ParsedServer::Domain(_) => None,
    }
}

impl Negotiator<'_> {
    fn timeout(&self) -> Duration {
        self.config.negotiation_timeout
    }

    /// Negotiate a usable session. `resume_as` is the previously bound JID
    /// when the stream management session should be resumed.
    pub(super) async fn run(&self, resume_as: Option<Jid>) -> Result<Negotiated, XmppError> {
        let config = self.config;
        let domain = config.domain();
        self.state.set(StreamState::Connecting);

        let mut endpoints = Vec::new();
        if resume_as.is_some() {
            let location = self
                .sm
                .lock()
                .token()
                .and_then(|token| token.location.clone());
            if let Some(endpoint) = location.and_then(|l| location_endpoint(&l, domain)) {
                debug!(host = %endpoint.host, port = endpoint.port, "Trying resumption location first");
                endpoints.push(endpoint);
            }
        }
        endpoints.extend(endpoints_for(config.server.as_deref(), domain).await?);

        let (transport, endpoint) = transport::connect(
            &endpoints,
            config.connect_timeout,
            config.dangerous_insecure_tls,
        )
        .await?;
        let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let tap = TrafficTap::new(self.events, config.debug_traffic);
        let mut stream = XmlStream::new(transport, config.max_stanza_size, tap);

        let features = self.open(&mut stream).await?;
        self.state.set(StreamState::StreamOpened);
        self.events.emit(ConnectionEvent::Connected { conn_id });
        info!(conn_id, host = %endpoint.host, port = endpoint.port,
            secure = stream.is_secure(), "Stream opened");

        // Subscribers saw `Connected`, so a failure from here on is a close
        match self
            .negotiate(stream, conn_id, &endpoint, features, resume_as)
            .await
        {
            Ok(negotiated) => Ok(negotiated),
            Err(e) => {
                self.events.emit(ConnectionEvent::ClosedOnError {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Everything after the first stream header: TLS, then resumption or
    /// a fresh session.
    async fn negotiate(
        &self,
        mut stream: XmlStream,
        conn_id: u64,
        endpoint: &Endpoint,
        mut features: StreamFeatures,
        mut resume_as: Option<Jid>,
    ) -> Result<Negotiated, XmppError> {
        let config = self.config;
        if !stream.is_secure() {
            match (features.starttls, config.tls) {
                (Some(_), TlsPolicy::Required | TlsPolicy::IfAvailable) => {
                    stream = self.starttls(stream, endpoint.tls_name()).await?;
                    features = self.open(&mut stream).await?;
                }
                (Some(true), TlsPolicy::Disabled) => {
                    return Err(NegotiationError::TlsDisabled.into())
                }
                (None, TlsPolicy::Required) => return Err(NegotiationError::TlsRequired.into()),
                _ => warn!(conn_id, "Continuing without TLS"),
            }
        }

        if features.stream_management {
            if let Some(jid) = resume_as.take() {
                if let Some(resumed) = self.resume(&mut stream).await? {
                    return Ok(self.resumed(stream, conn_id, jid, features, resumed));
                }
            }
        }

        self.authenticate(&mut stream, &features).await?;
        features = self.open(&mut stream).await?;

        if features.stream_management {
            if let Some(jid) = resume_as.take() {
                if let Some(resumed) = self.resume(&mut stream).await? {
                    return Ok(self.resumed(stream, conn_id, jid, features, resumed));
                }
            }
        }

        self.discard_previous_session();
        let mut early = Vec::new();
        let jid = self.bind(&mut stream, &features, &mut early).await?;
        if features.session_required() {
            self.establish_session(&mut stream, &mut early).await?;
        }
        if config.stream_management.enabled {
            if features.stream_management {
                self.enable_stream_management(&mut stream, &mut early).await?;
            } else {
                info!(conn_id, "Server does not support stream management");
            }
        }

        Ok(Negotiated {
            stream,
            conn_id,
            jid,
            features,
            resumed: None,
            early,
        })
    }

    fn resumed(
        &self,
        stream: XmlStream,
        conn_id: u64,
        jid: Jid,
        features: StreamFeatures,
        resumed: Resumed,
    ) -> Negotiated {
        Negotiated {
            stream,
            conn_id,
            jid,
            features,
            resumed: Some(resumed),
            early: Vec::new(),
        }
    }

    /// Open (or restart) the stream and read its features.
    async fn open(&self, stream: &mut XmlStream) -> Result<StreamFeatures, XmppError> {
        // `from` is only sent once the stream is encrypted (RFC 6120 §4.7.1)
        let from = stream.is_secure().then(|| self.config.jid.bare());
        let header = stream.open(self.config.domain(), from, self.timeout()).await?;
        trace!(id = ?header.id, from = ?header.from, version = ?header.version, "Stream header received");
        let features = StreamFeatures::parse(&stream.next_element(self.timeout()).await?)?;
        debug!(?features, "Stream features");
        Ok(features)
    }

    async fn starttls(&self, mut stream: XmlStream, tls_name: &str) -> Result<XmlStream, XmppError> {
        self.state.set(StreamState::TlsNegotiating);
        stream.send(&Element::new("starttls", ns::TLS)).await?;
        let reply = stream.next_element(self.timeout()).await?;
        if reply.is("failure", ns::TLS) {
            return Err(NegotiationError::TlsRejected("server answered <failure/>".to_string()).into());
        }
        if !reply.is("proceed", ns::TLS) {
            return Err(unexpected(&reply));
        }
        let stream = stream
            .starttls(tls_name, self.config.dangerous_insecure_tls)
            .await?;
        info!(tls_name, "STARTTLS completed");
        Ok(stream)
    }

    /// Try every usable mechanism in preference order until one succeeds.
    async fn authenticate(
        &self,
        stream: &mut XmlStream,
        features: &StreamFeatures,
    ) -> Result<(), XmppError> {
        self.state.set(StreamState::Authenticating);
        let candidates = self.config.sasl.select(
            &features.mechanisms,
            stream.is_secure(),
            self.config.allow_plain_without_tls,
        );
        if candidates.is_empty() {
            warn!(offered = ?features.mechanisms, "No usable SASL mechanism");
            return Err(NegotiationError::NoCommonMechanism {
                offered: features.mechanisms.clone(),
            }
            .into());
        }

        let credentials = self.config.credentials();
        let mut attempts = Vec::new();
        for provider in candidates {
            let mut mechanism = provider.create(&credentials);
            match self.run_mechanism(stream, mechanism.as_mut()).await? {
                SaslOutcome::Success => {
                    info!(mechanism = provider.name(), "Authenticated");
                    return Ok(());
                }
                SaslOutcome::Failure(condition) => {
                    warn!(mechanism = provider.name(), %condition, "SASL mechanism failed");
                    attempts.push((provider.name().to_string(), condition));
                }
            }
        }
        Err(NegotiationError::AuthenticationFailed { attempts }.into())
    }

    async fn run_mechanism(
        &self,
        stream: &mut XmlStream,
        mechanism: &mut dyn SaslMechanism,
    ) -> Result<SaslOutcome, XmppError> {
        let initial = match mechanism.initial_response() {
            Ok(initial) => initial,
            Err(e) => return Ok(SaslOutcome::Failure(e.to_string())),
        };
        let mut auth = Element::new("auth", ns::SASL).with_attr("mechanism", mechanism.name());
        if let Some(data) = initial {
            auth.append_text(encode_payload(&data));
        }
        stream.send(&auth).await?;

        loop {
            let reply = stream.next_element(self.timeout()).await?;
            if reply.is("challenge", ns::SASL) {
                let response =
                    decode_payload(&reply.text()).and_then(|data| mechanism.challenge(&data));
                match response {
                    Ok(data) => {
                        let mut response = Element::new("response", ns::SASL);
                        if !data.is_empty() {
                            response.append_text(BASE64.encode(&data));
                        }
                        stream.send(&response).await?;
                    }
                    Err(e) => {
                        warn!(mechanism = mechanism.name(), error = %e, "Aborting SASL exchange");
                        stream.send(&Element::new("abort", ns::SASL)).await?;
                        let reply = stream.next_element(self.timeout()).await?;
                        if !reply.is("failure", ns::SASL) {
                            return Err(unexpected(&reply));
                        }
                        return Ok(SaslOutcome::Failure(e.to_string()));
                    }
                }
            } else if reply.is("success", ns::SASL) {
                // The server already considers us authenticated, so a bad
                // server signature here is fatal rather than a fallback case
                let data = decode_payload(&reply.text())?;
                mechanism.success(&data)?;
                return Ok(SaslOutcome::Success);
            } else if reply.is("failure", ns::SASL) {
                return Ok(SaslOutcome::Failure(sasl_failure_condition(&reply)));
            } else {
                return Err(unexpected(&reply));
            }
        }
    }

    /// Send an IQ and wait for its reply. Other stanzas are kept for the reader.
    async fn iq_exchange(
        &self,
        stream: &mut XmlStream,
        request: Element,
        early: &mut Vec<Element>,
    ) -> Result<Element, XmppError> {
        let id = request.attr("id").unwrap_or_default().to_string();
        stream.send(&request).await?;
        loop {
            let reply = stream.next_element(self.timeout()).await?;
            match IqType::of(&reply) {
                Some(IqType::Result | IqType::Error) if reply.attr("id") == Some(id.as_str()) => {
                    return Ok(reply)
                }
                _ if stanza::is_stanza(&reply) => early.push(reply),
                _ => return Err(unexpected(&reply)),
            }
        }
    }

    async fn bind(
        &self,
        stream: &mut XmlStream,
        features: &StreamFeatures,
        early: &mut Vec<Element>,
    ) -> Result<Jid, XmppError> {
        self.state.set(StreamState::ResourceBinding);
        if !features.bind {
            return Err(
                NegotiationError::BindFailed("server does not offer resource binding".to_string())
                    .into(),
            );
        }

        let mut bind = Element::new("bind", ns::BIND);
        if let Some(resource) = &self.config.resource {
            bind.append_child(Element::new("resource", ns::BIND).with_text(resource));
        }
        let reply = self
            .iq_exchange(stream, stanza::iq(IqType::Set, None, bind), early)
            .await?;
        if IqType::of(&reply) != Some(IqType::Result) {
            return Err(NegotiationError::BindFailed(stanza_condition(&reply)).into());
        }

        let text = reply
            .child("bind", ns::BIND)
            .and_then(|bind| bind.child("jid", ns::BIND))
            .map(|jid| jid.text())
            .ok_or_else(|| NegotiationError::BindFailed("result carries no JID".to_string()))?;
        let jid = Jid::new(&text).map_err(|e| NegotiationError::BindFailed(e.to_string()))?;
        if jid.resourcepart().is_none() {
            return Err(NegotiationError::BindFailed(format!("bound JID {jid} has no resource")).into());
        }
        match self.config.resource.as_deref() {
            Some(requested) if Some(requested) != jid.resourcepart() => {
                info!(requested, bound = %jid, "Server assigned a different resource")
            }
            _ => debug!(bound = %jid, "Resource bound"),
        }
        Ok(jid)
    }

    async fn establish_session(
        &self,
        stream: &mut XmlStream,
        early: &mut Vec<Element>,
    ) -> Result<(), XmppError> {
        let request = stanza::iq(IqType::Set, None, Element::new("session", ns::SESSION));
        let reply = self.iq_exchange(stream, request, early).await?;
        if IqType::of(&reply) != Some(IqType::Result) {
            return Err(NegotiationError::SessionFailed(stanza_condition(&reply)).into());
        }
        debug!("Legacy session established");
        Ok(())
    }

    async fn enable_stream_management(
        &self,
        stream: &mut XmlStream,
        early: &mut Vec<Element>,
    ) -> Result<(), XmppError> {
        let sm_config = &self.config.stream_management;
        stream
            .send(&protocol::enable(sm_config.resumption, sm_config.preferred_max))
            .await?;
        loop {
            let element = stream.next_element(self.timeout()).await?;
            match SmNonza::parse(&element) {
                Some(SmNonza::Enabled {
                    id,
                    resume,
                    max,
                    location,
                }) => {
                    self.sm.lock().enable(id, resume, max, location);
                    return Ok(());
                }
                Some(SmNonza::Failed { condition, .. }) => {
                    warn!(condition = ?condition, "Server refused to enable stream management");
                    return Ok(());
                }
                Some(SmNonza::Malformed { name }) => {
                    return Err(XmppError::StreamManagement(format!(
                        "cannot apply <{name}/> while enabling"
                    )))
                }
                Some(other) => debug!(?other, "Ignoring stream management element before <enabled/>"),
                None if stanza::is_stanza(&element) => early.push(element),
                None => return Err(unexpected(&element)),
            }
        }
    }

    /// Returns `None` when the server refuses; the stream stays usable for a
    /// fresh session.
    async fn resume(&self, stream: &mut XmlStream) -> Result<Option<Resumed>, XmppError> {
        let (request, token_id) = {
            let sm = self.sm.lock();
            (sm.resume_request(), sm.token().map(|token| token.id.clone()))
        };
        let (Some(request), Some(token_id)) = (request, token_id) else {
            return Ok(None);
        };
        self.state.set(StreamState::Resuming);
        stream.send(&request).await?;

        let reply = stream.next_element(self.timeout()).await?;
        match SmNonza::parse(&reply) {
            Some(SmNonza::Resumed { previd, .. }) if previd != token_id => {
                warn!(%previd, expected = %token_id, "Server resumed a different session");
                Err(NegotiationError::UnexpectedElement(format!(
                    "resumed with previd '{previd}', expected '{token_id}'"
                ))
                .into())
            }
            Some(SmNonza::Resumed { h, .. }) => {
                let resumed = self.sm.lock().handle_resumed(h)?;
                Ok(Some(resumed))
            }
            Some(SmNonza::Failed { condition, h }) => {
                let failed = self.sm.lock().handle_failed(h);
                if !failed.acknowledged.is_empty() {
                    self.events.emit(ConnectionEvent::StanzasAcknowledged {
                        stanzas: failed.acknowledged,
                    });
                }
                let error = XmppError::ResumptionFailed {
                    condition,
                    undelivered: failed.undelivered,
                };
                warn!(error = %error, undelivered = error.undelivered().len(),
                    "Falling back to a new session");
                if !error.undelivered().is_empty() {
                    self.events.emit(ConnectionEvent::StanzasUndelivered {
                        stanzas: error.undelivered().to_vec(),
                        reason: error.to_string(),
                    });
                }
                Ok(None)
            }
            _ => Err(unexpected(&reply)),
        }
    }

    /// A new session starts: stanzas the previous one never got confirmed
    /// can no longer be proven delivered.
    fn discard_previous_session(&self) {
        let undelivered = self.sm.lock().reset();
        if !undelivered.is_empty() {
            warn!(count = undelivered.len(), "Previous session not resumed, stanzas undelivered");
            self.events.emit(ConnectionEvent::StanzasUndelivered {
                stanzas: undelivered,
                reason: "stream management session not resumed".to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sasl_payload_encoding() {
        assert_eq!(encode_payload(b""), "=");
        assert_eq!(encode_payload(b"\0user\0pencil"), "AHVzZXIAcGVuY2ls");
        assert_eq!(decode_payload("=").unwrap(), Vec::<u8>::new());
        assert_eq!(decode_payload(" AHVzZXIAcGVuY2ls\n").unwrap(), b"\0user\0pencil");
        assert!(decode_payload("!!").is_err());
    }

    #[test]
    fn test_sasl_failure_condition() {
        let failure: Element = "<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/><text>Wrong password</text></failure>"
            .parse()
            .unwrap();
        assert_eq!(sasl_failure_condition(&failure), "not-authorized (Wrong password)");
        let bare: Element = "<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>".parse().unwrap();
        assert_eq!(sasl_failure_condition(&bare), "not-authorized");
    }

    #[test]
    fn test_location_endpoint_keeps_domain_for_tls() {
        let endpoint = location_endpoint("node2.example.com:5222", "example.com").unwrap();
        assert_eq!(endpoint.host, "node2.example.com");
        assert_eq!(endpoint.port, 5222);
        assert_eq!(endpoint.tls_name(), "example.com");
        assert!(location_endpoint("example.com", "example.com").is_none());
    }
}
