//! Stanza classification and helpers for the three `jabber:client` stanzas.

use std::fmt;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use thiserror::Error;

use crate::element::Element;
use crate::ns;

/// Length of generated stanza ids.
const STANZA_ID_LENGTH: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
}

impl StanzaKind {
    /// Classify a top-level element; `None` for nonzas.
    pub fn of(element: &Element) -> Option<StanzaKind> {
        if element.namespace() != Some(ns::CLIENT) {
            return None;
        }
        match element.local_name() {
            "message" => Some(StanzaKind::Message),
            "presence" => Some(StanzaKind::Presence),
            "iq" => Some(StanzaKind::Iq),
            _ => None,
        }
    }
}

/// Only stanzas count towards stream management handled counters.
pub fn is_stanza(element: &Element) -> bool {
    StanzaKind::of(element).is_some()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn of(element: &Element) -> Option<IqType> {
        if StanzaKind::of(element) != Some(StanzaKind::Iq) {
            return None;
        }
        match element.attr("type")? {
            "get" => Some(IqType::Get),
            "set" => Some(IqType::Set),
            "result" => Some(IqType::Result),
            "error" => Some(IqType::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }

    /// Requests expect exactly one result or error reply.
    pub fn is_request(&self) -> bool {
        matches!(self, IqType::Get | IqType::Set)
    }
}

/// Generate a random stanza id.
pub fn generate_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(STANZA_ID_LENGTH)
        .map(char::from)
        .collect()
}

/// Build an IQ request carrying `payload`, with a fresh id.
pub fn iq(iq_type: IqType, to: Option<&str>, payload: Element) -> Element {
    let mut iq = Element::new("iq", ns::CLIENT)
        .with_attr("type", iq_type.as_str())
        .with_attr("id", generate_id());
    if let Some(to) = to {
        iq.set_attr("to", to);
    }
    iq.with_child(payload)
}

/// Build an empty result for an IQ request.
pub fn iq_result(request: &Element) -> Element {
    let mut reply = Element::new("iq", ns::CLIENT).with_attr("type", "result");
    copy_reply_addressing(request, &mut reply);
    reply
}

/// Build an error reply for any stanza, e.g. `service-unavailable` for an
/// IQ request nobody handles.
pub fn error_reply(request: &Element, error: &StanzaError) -> Element {
    let mut reply = Element::new(request.local_name(), ns::CLIENT).with_attr("type", "error");
    copy_reply_addressing(request, &mut reply);
    reply.with_child(error.to_element())
}

fn copy_reply_addressing(request: &Element, reply: &mut Element) {
    if let Some(id) = request.attr("id") {
        reply.set_attr("id", id);
    }
    if let Some(from) = request.attr("from") {
        reply.set_attr("to", from);
    }
}

/// Make sure a stanza carries an id, returning it.
pub fn ensure_id(stanza: &mut Element) -> String {
    match stanza.attr("id") {
        Some(id) => id.to_string(),
        None => {
            let id = generate_id();
            stanza.set_attr("id", id.clone());
            id
        }
    }
}

/// Error type attribute of a stanza error (RFC 6120 §8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    Auth,
    Cancel,
    Continue,
    Modify,
    Wait,
}

impl ErrorType {
    fn parse(s: &str) -> Option<ErrorType> {
        match s {
            "auth" => Some(ErrorType::Auth),
            "cancel" => Some(ErrorType::Cancel),
            "continue" => Some(ErrorType::Continue),
            "modify" => Some(ErrorType::Modify),
            "wait" => Some(ErrorType::Wait),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Auth => "auth",
            ErrorType::Cancel => "cancel",
            ErrorType::Continue => "continue",
            ErrorType::Modify => "modify",
            ErrorType::Wait => "wait",
        }
    }
}

/// Application-level error carried by a stanza of type `error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct StanzaError {
    pub error_type: ErrorType,
    /// Defined condition, e.g. `item-not-found`.
    pub condition: String,
    pub text: Option<String>,
}

impl StanzaError {
    pub fn new(error_type: ErrorType, condition: impl Into<String>) -> Self {
        Self {
            error_type,
            condition: condition.into(),
            text: None,
        }
    }

    /// Extract the error of a stanza of type `error`, if it has one.
    pub fn from_stanza(stanza: &Element) -> Option<StanzaError> {
        if stanza.attr("type") != Some("error") {
            return None;
        }
        let error = stanza.children().find(|el| el.local_name() == "error")?;
        let error_type = error
            .attr("type")
            .and_then(ErrorType::parse)
            .unwrap_or(ErrorType::Cancel);
        let condition = error
            .children()
            .find(|el| el.namespace() == Some(ns::STANZAS) && el.local_name() != "text")
            .map(|el| el.local_name().to_string())
            .unwrap_or_else(|| "undefined-condition".to_string());
        let text = error
            .child("text", ns::STANZAS)
            .map(|el| el.text())
            .filter(|t| !t.is_empty());
        Some(StanzaError {
            error_type,
            condition,
            text,
        })
    }

    pub fn to_element(&self) -> Element {
        let mut error = Element::new("error", ns::CLIENT)
            .with_attr("type", self.error_type.as_str())
            .with_child(Element::new(self.condition.clone(), ns::STANZAS));
        if let Some(text) = &self.text {
            error.append_child(Element::new("text", ns::STANZAS).with_text(text.clone()));
        }
        error
    }
}

impl fmt::Display for StanzaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stanza error: {} ({})", self.condition, self.error_type.as_str())?;
        if let Some(text) = &self.text {
            write!(f, ": {text}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stanza_kind_requires_client_namespace() {
        let msg: Element = "<message/>".parse().unwrap();
        assert_eq!(StanzaKind::of(&msg), Some(StanzaKind::Message));
        let ack: Element = "<a xmlns='urn:xmpp:sm:3' h='1'/>".parse().unwrap();
        assert_eq!(StanzaKind::of(&ack), None);
        let foreign: Element = "<iq xmlns='urn:example'/>".parse().unwrap();
        assert!(!is_stanza(&foreign));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = generate_id();
        let b = generate_id();
        assert_eq!(a.len(), STANZA_ID_LENGTH);
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_stanza_error() {
        let reply: Element = "<iq type='error' id='x'><error type='cancel'><item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/><text xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'>gone</text></error></iq>"
            .parse()
            .unwrap();
        let err = StanzaError::from_stanza(&reply).unwrap();
        assert_eq!(err.error_type, ErrorType::Cancel);
        assert_eq!(err.condition, "item-not-found");
        assert_eq!(err.text.as_deref(), Some("gone"));
        assert_eq!(err.to_string(), "stanza error: item-not-found (cancel): gone");
    }

    #[test]
    fn test_error_reply_swaps_addressing() {
        let request: Element = "<iq type='get' id='q1' from='peer@example.com/x'><query xmlns='urn:example'/></iq>"
            .parse()
            .unwrap();
        let reply = error_reply(
            &request,
            &StanzaError::new(ErrorType::Cancel, "service-unavailable"),
        );
        assert_eq!(reply.attr("type"), Some("error"));
        assert_eq!(reply.attr("id"), Some("q1"));
        assert_eq!(reply.attr("to"), Some("peer@example.com/x"));
        let parsed = StanzaError::from_stanza(&reply).unwrap();
        assert_eq!(parsed.condition, "service-unavailable");
    }

    #[test]
    fn test_ensure_id_keeps_existing() {
        let mut msg: Element = "<message id='m1'/>".parse().unwrap();
        assert_eq!(ensure_id(&mut msg), "m1");
        let mut presence: Element = "<presence/>".parse().unwrap();
        let id = ensure_id(&mut presence);
        assert_eq!(presence.attr("id"), Some(id.as_str()));
    }
}
