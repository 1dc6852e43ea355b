//! Predicates selecting incoming elements for collectors and listeners.

use crate::element::Element;
use crate::stanza::{IqType, StanzaKind};

pub trait StanzaFilter: Send + Sync {
    fn accept(&self, element: &Element) -> bool;
}

impl<F> StanzaFilter for F
where
    F: Fn(&Element) -> bool + Send + Sync,
{
    fn accept(&self, element: &Element) -> bool {
        self(element)
    }
}

/// Accepts every element.
pub struct AnyStanza;

impl StanzaFilter for AnyStanza {
    fn accept(&self, _element: &Element) -> bool {
        true
    }
}

/// Matches stanzas by `id` attribute.
pub struct StanzaIdFilter {
    id: String,
}

impl StanzaIdFilter {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl StanzaFilter for StanzaIdFilter {
    fn accept(&self, element: &Element) -> bool {
        StanzaKind::of(element).is_some() && element.attr("id") == Some(self.id.as_str())
    }
}

pub struct StanzaKindFilter(pub StanzaKind);

impl StanzaFilter for StanzaKindFilter {
    fn accept(&self, element: &Element) -> bool {
        StanzaKind::of(element) == Some(self.0)
    }
}

/// Matches the `result` or `error` reply to an IQ request.
///
/// The reply must come from the entity the request was addressed to. A
/// request without `to` is answered by the account itself, so replies from
/// the bare JID, the server domain or no `from` at all are accepted.
pub struct IqReplyFilter {
    id: String,
    expected_from: Vec<String>,
}

impl IqReplyFilter {
    pub fn new(request: &Element, own_jid: Option<&crate::jid::Jid>) -> Self {
        let id = request.attr("id").unwrap_or_default().to_string();
        let mut expected_from = Vec::new();
        match request.attr("to") {
            Some(to) => expected_from.push(to.to_string()),
            None => {
                expected_from.push(String::new());
                if let Some(jid) = own_jid {
                    expected_from.push(jid.full().to_string());
                    expected_from.push(jid.bare().to_string());
                    expected_from.push(jid.domainpart().to_string());
                }
            }
        }
        Self { id, expected_from }
    }
}

impl StanzaFilter for IqReplyFilter {
    fn accept(&self, element: &Element) -> bool {
        if !matches!(IqType::of(element), Some(IqType::Result | IqType::Error)) {
            return false;
        }
        if element.attr("id") != Some(self.id.as_str()) {
            return false;
        }
        let from = element.attr("from").unwrap_or_default();
        self.expected_from
            .iter()
            .any(|expected| expected.eq_ignore_ascii_case(from))
    }
}

pub struct And<A, B>(pub A, pub B);

impl<A: StanzaFilter, B: StanzaFilter> StanzaFilter for And<A, B> {
    fn accept(&self, element: &Element) -> bool {
        self.0.accept(element) && self.1.accept(element)
    }
}

pub struct Or<A, B>(pub A, pub B);

impl<A: StanzaFilter, B: StanzaFilter> StanzaFilter for Or<A, B> {
    fn accept(&self, element: &Element) -> bool {
        self.0.accept(element) || self.1.accept(element)
    }
}

pub struct Not<A>(pub A);

impl<A: StanzaFilter> StanzaFilter for Not<A> {
    fn accept(&self, element: &Element) -> bool {
        !self.0.accept(element)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jid::Jid;

    fn el(xml: &str) -> Element {
        xml.parse().unwrap()
    }

    #[test]
    fn test_closure_filter() {
        let filter = |e: &Element| e.attr("type") == Some("chat");
        assert!(filter.accept(&el("<message type='chat'/>")));
        assert!(!filter.accept(&el("<message type='groupchat'/>")));
    }

    #[test]
    fn test_iq_reply_filter_checks_sender() {
        let request = el("<iq type='get' id='q1' to='pubsub.example.com'/>");
        let filter = IqReplyFilter::new(&request, None);
        assert!(filter.accept(&el("<iq type='result' id='q1' from='pubsub.example.com'/>")));
        assert!(!filter.accept(&el("<iq type='result' id='q1' from='evil.example.com'/>")));
        assert!(!filter.accept(&el("<iq type='get' id='q1' from='pubsub.example.com'/>")));
        assert!(!filter.accept(&el("<iq type='result' id='q2' from='pubsub.example.com'/>")));
    }

    #[test]
    fn test_iq_reply_filter_for_own_account() {
        let jid = Jid::new("user@example.com/res").unwrap();
        let request = el("<iq type='get' id='r1'/>");
        let filter = IqReplyFilter::new(&request, Some(&jid));
        assert!(filter.accept(&el("<iq type='result' id='r1'/>")));
        assert!(filter.accept(&el("<iq type='result' id='r1' from='user@example.com'/>")));
        assert!(filter.accept(&el("<iq type='error' id='r1' from='example.com'/>")));
        assert!(!filter.accept(&el("<iq type='result' id='r1' from='other@example.com'/>")));
    }

    #[test]
    fn test_combinators() {
        let filter = And(
            StanzaKindFilter(StanzaKind::Message),
            Not(StanzaIdFilter::new("skip")),
        );
        assert!(filter.accept(&el("<message id='keep'/>")));
        assert!(!filter.accept(&el("<message id='skip'/>")));
        assert!(!filter.accept(&el("<presence id='keep'/>")));
        let either = Or(StanzaIdFilter::new("a"), StanzaIdFilter::new("b"));
        assert!(either.accept(&el("<iq id='b'/>")));
    }
}
