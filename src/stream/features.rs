//! `<stream:features/>` as advertised after every stream (re)start.

use crate::element::Element;
use crate::error::{NegotiationError, XmppError};
use crate::ns;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFeatures {
    /// STARTTLS offered; `Some(true)` when the server requires it.
    pub starttls: Option<bool>,
    /// SASL mechanisms in server order.
    pub mechanisms: Vec<String>,
    pub bind: bool,
    /// Legacy session establishment; `Some(true)` when it is mandatory.
    pub session: Option<bool>,
    pub stream_management: bool,
}

impl StreamFeatures {
    pub fn parse(element: &Element) -> Result<Self, XmppError> {
        if !element.is("features", ns::STREAM) {
            return Err(NegotiationError::UnexpectedElement(element.name().to_string()).into());
        }

        let starttls = element
            .child("starttls", ns::TLS)
            .map(|tls| tls.has_child("required", ns::TLS));
        let mechanisms = element
            .child("mechanisms", ns::SASL)
            .map(|mechs| {
                mechs
                    .children()
                    .filter(|m| m.is("mechanism", ns::SASL))
                    .map(|m| m.text().trim().to_string())
                    .filter(|m| !m.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let session = element
            .child("session", ns::SESSION)
            .map(|session| !session.has_child("optional", ns::SESSION));

        Ok(Self {
            starttls,
            mechanisms,
            bind: element.has_child("bind", ns::BIND),
            session,
            stream_management: element.has_child("sm", ns::SM),
        })
    }

    pub fn session_required(&self) -> bool {
        self.session == Some(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pre_tls_features() {
        let el: Element = "<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>SCRAM-SHA-1</mechanism><mechanism> PLAIN </mechanism></mechanisms></stream:features>"
            .parse()
            .unwrap();
        let features = StreamFeatures::parse(&el).unwrap();
        assert_eq!(features.starttls, Some(true));
        assert_eq!(features.mechanisms, vec!["SCRAM-SHA-1", "PLAIN"]);
        assert!(!features.bind);
        assert!(!features.stream_management);
    }

    #[test]
    fn test_parse_post_auth_features() {
        let el: Element = "<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/><session xmlns='urn:ietf:params:xml:ns:xmpp-session'><optional/></session><sm xmlns='urn:xmpp:sm:3'/></stream:features>"
            .parse()
            .unwrap();
        let features = StreamFeatures::parse(&el).unwrap();
        assert_eq!(features.starttls, None);
        assert!(features.bind);
        assert_eq!(features.session, Some(false));
        assert!(!features.session_required());
        assert!(features.stream_management);
    }

    #[test]
    fn test_rejects_other_elements() {
        let el: Element = "<message/>".parse().unwrap();
        assert!(StreamFeatures::parse(&el).is_err());
    }
}
