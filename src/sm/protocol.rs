//! XEP-0198 nonzas.

use std::time::Duration;

use crate::element::Element;
use crate::ns;

pub fn enable(resume: bool, max: Option<Duration>) -> Element {
    let mut enable = Element::new("enable", ns::SM);
    if resume {
        enable.set_attr("resume", "true");
        if let Some(max) = max {
            enable.set_attr("max", max.as_secs().to_string());
        }
    }
    enable
}

pub fn request() -> Element {
    Element::new("r", ns::SM)
}

pub fn answer(h: u32) -> Element {
    Element::new("a", ns::SM).with_attr("h", h.to_string())
}

pub fn resume(previd: &str, h: u32) -> Element {
    Element::new("resume", ns::SM)
        .with_attr("previd", previd)
        .with_attr("h", h.to_string())
}

/// Inbound stream management element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmNonza {
    Request,
    Answer {
        h: u32,
    },
    Enabled {
        id: Option<String>,
        resume: bool,
        max: Option<Duration>,
        location: Option<String>,
    },
    Resumed {
        previd: String,
        h: u32,
    },
    Failed {
        condition: Option<String>,
        h: Option<u32>,
    },
    /// In the stream management namespace but not understood: an unknown
    /// name, or a count that is missing or not a `u32`.
    Malformed {
        name: String,
    },
}

fn parse_h(element: &Element) -> Option<u32> {
    element.attr("h")?.trim().parse().ok()
}

impl SmNonza {
    /// `None` only for elements outside the stream management namespace.
    pub fn parse(element: &Element) -> Option<SmNonza> {
        if element.namespace() != Some(ns::SM) {
            return None;
        }
        let malformed = || SmNonza::Malformed {
            name: element.local_name().to_string(),
        };
        let parsed = match element.local_name() {
            "r" => SmNonza::Request,
            "a" => match parse_h(element) {
                Some(h) => SmNonza::Answer { h },
                None => malformed(),
            },
            "enabled" => SmNonza::Enabled {
                id: element.attr("id").map(str::to_string),
                resume: matches!(element.attr("resume"), Some("true") | Some("1")),
                max: element
                    .attr("max")
                    .and_then(|m| m.parse::<u64>().ok())
                    .map(Duration::from_secs),
                location: element.attr("location").map(str::to_string),
            },
            "resumed" => match parse_h(element) {
                Some(h) => SmNonza::Resumed {
                    previd: element.attr("previd").unwrap_or_default().to_string(),
                    h,
                },
                None => malformed(),
            },
            "failed" => SmNonza::Failed {
                condition: element
                    .children()
                    .find(|el| el.namespace() == Some(ns::STANZAS))
                    .map(|el| el.local_name().to_string()),
                h: parse_h(element),
            },
            _ => malformed(),
        };
        Some(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enable_xml() {
        assert_eq!(
            enable(true, Some(Duration::from_secs(300))).to_xml(),
            "<enable xmlns='urn:xmpp:sm:3' resume='true' max='300'/>"
        );
        assert_eq!(enable(false, None).to_xml(), "<enable xmlns='urn:xmpp:sm:3'/>");
        assert_eq!(
            resume("some-id", 7).to_xml(),
            "<resume xmlns='urn:xmpp:sm:3' previd='some-id' h='7'/>"
        );
    }

    #[test]
    fn test_parse_nonzas() {
        let el: Element = "<a xmlns='urn:xmpp:sm:3' h='4294967295'/>".parse().unwrap();
        assert_eq!(SmNonza::parse(&el), Some(SmNonza::Answer { h: u32::MAX }));

        let el: Element = "<enabled xmlns='urn:xmpp:sm:3' id='abc' resume='1' max='600'/>"
            .parse()
            .unwrap();
        assert_eq!(
            SmNonza::parse(&el),
            Some(SmNonza::Enabled {
                id: Some("abc".to_string()),
                resume: true,
                max: Some(Duration::from_secs(600)),
                location: None,
            })
        );

        let el: Element = "<failed xmlns='urn:xmpp:sm:3' h='3'><item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></failed>"
            .parse()
            .unwrap();
        assert_eq!(
            SmNonza::parse(&el),
            Some(SmNonza::Failed {
                condition: Some("item-not-found".to_string()),
                h: Some(3),
            })
        );
    }

    #[test]
    fn test_parse_rejects_foreign_and_malformed() {
        let el: Element = "<r/>".parse().unwrap();
        assert_eq!(SmNonza::parse(&el), None);
        for xml in [
            "<a xmlns='urn:xmpp:sm:3' h='-1'/>",
            "<a xmlns='urn:xmpp:sm:3' h='bogus'/>",
            "<a xmlns='urn:xmpp:sm:3'/>",
            "<resumed xmlns='urn:xmpp:sm:3' previd='x'/>",
            "<ack xmlns='urn:xmpp:sm:3'/>",
        ] {
            let el: Element = xml.parse().unwrap();
            let name = el.local_name().to_string();
            assert_eq!(SmNonza::parse(&el), Some(SmNonza::Malformed { name }), "{xml}");
        }
    }
}
