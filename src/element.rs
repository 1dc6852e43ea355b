//! Owned XML element tree for stanzas and nonzas.
//!
//! Elements are produced by the stream decoder one top-level element at a
//! time and handed to the writer for serialization. Once enqueued they are
//! treated as immutable, so they can be cloned freely between the writer and
//! the stream management queue.

use std::fmt;
use std::str::FromStr;

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Serialize, Serializer};

use crate::error::XmppError;
use crate::ns;

/// A child node: either a nested element or character data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// An XML element with its resolved namespace.
///
/// `name` is the qualified name as written on the wire (`stream:features`,
/// `message`). `namespace` is the namespace the name resolves to in the
/// context it was parsed in, or the one it was built with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    namespace: Option<String>,
    attributes: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    /// Create an element in the given namespace.
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Create an element that inherits the namespace of wherever it is written.
    pub fn unqualified(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.append_text(text);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name without its namespace prefix.
    pub fn local_name(&self) -> &str {
        match self.name.split_once(':') {
            Some((_, local)) => local,
            None => &self.name,
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// True when the element has this local name and namespace.
    pub fn is(&self, local_name: &str, namespace: &str) -> bool {
        self.local_name() == local_name && self.namespace() == Some(namespace)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(key, _)| *key == name) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((name, value)),
        }
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        let pos = self.attributes.iter().position(|(key, _)| key == name)?;
        Some(self.attributes.remove(pos).1)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.children
    }

    /// Child elements, skipping character data.
    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    /// First child element with this local name and namespace.
    pub fn child(&self, local_name: &str, namespace: &str) -> Option<&Element> {
        self.children().find(|el| el.is(local_name, namespace))
    }

    pub fn has_child(&self, local_name: &str, namespace: &str) -> bool {
        self.child(local_name, namespace).is_some()
    }

    pub fn append_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    pub fn append_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        if text.is_empty() {
            return;
        }
        match self.children.last_mut() {
            Some(Node::Text(existing)) => existing.push_str(&text),
            _ => self.children.push(Node::Text(text)),
        }
    }

    /// Concatenated character data of the direct children.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(text) => Some(text.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Serialize for a stream whose default namespace is `jabber:client`.
    pub fn to_xml(&self) -> String {
        let mut out = String::with_capacity(128);
        self.write_xml(&mut out, Some(ns::CLIENT));
        out
    }

    fn write_xml(&self, out: &mut String, parent_ns: Option<&str>) {
        out.push('<');
        out.push_str(&self.name);

        // Prefixed names carry their own xmlns:prefix declaration as an attribute
        let own_ns = self.namespace.as_deref();
        if !self.name.contains(':') {
            if let Some(namespace) = own_ns {
                if Some(namespace) != parent_ns {
                    out.push_str(" xmlns='");
                    out.push_str(&escape(namespace));
                    out.push('\'');
                }
            }
        }
        for (key, value) in &self.attributes {
            out.push(' ');
            out.push_str(key);
            out.push_str("='");
            out.push_str(&escape(value.as_str()));
            out.push('\'');
        }

        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        let child_parent_ns = own_ns.or(parent_ns);
        for node in &self.children {
            match node {
                Node::Element(el) => el.write_xml(out, child_parent_ns),
                Node::Text(text) => out.push_str(&escape(text.as_str())),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    /// Parse one complete element, resolving namespaces against `scope`.
    pub(crate) fn parse_in_scope(xml: &str, scope: &NamespaceScope) -> Result<Element, XmppError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(false);

        let mut stack: Vec<(Element, NamespaceScope)> = Vec::new();
        loop {
            match reader.read_event() {
                Ok(Event::Start(start)) => {
                    let parent_scope = stack.last().map(|(_, s)| s).unwrap_or(scope);
                    let (el, el_scope) = element_from_start(&start, parent_scope)?;
                    stack.push((el, el_scope));
                }
                Ok(Event::Empty(start)) => {
                    let parent_scope = stack.last().map(|(_, s)| s).unwrap_or(scope);
                    let (el, _) = element_from_start(&start, parent_scope)?;
                    match stack.last_mut() {
                        Some((parent, _)) => parent.append_child(el),
                        None => return Ok(el),
                    }
                }
                Ok(Event::End(_)) => {
                    let (el, _) = stack
                        .pop()
                        .ok_or_else(|| XmppError::Xml("unbalanced end tag".to_string()))?;
                    match stack.last_mut() {
                        Some((parent, _)) => parent.append_child(el),
                        None => return Ok(el),
                    }
                }
                Ok(Event::Text(text)) => {
                    if let Some((parent, _)) = stack.last_mut() {
                        let text = text.unescape().map_err(|e| XmppError::Xml(e.to_string()))?;
                        parent.append_text(text.into_owned());
                    }
                }
                Ok(Event::CData(cdata)) => {
                    if let Some((parent, _)) = stack.last_mut() {
                        parent.append_text(String::from_utf8_lossy(&cdata).into_owned());
                    }
                }
                Ok(Event::Eof) => {
                    return Err(XmppError::Xml("element is incomplete".to_string()));
                }
                Ok(_) => {}
                Err(e) => return Err(XmppError::Xml(e.to_string())),
            }
        }
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

impl FromStr for Element {
    type Err = XmppError;

    /// Parse a standalone element; unprefixed names default to `jabber:client`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Element::parse_in_scope(s, &NamespaceScope::client_stream())
    }
}

impl Serialize for Element {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Namespace declarations in effect at some point of the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct NamespaceScope {
    default: Option<String>,
    prefixes: Vec<(String, String)>,
}

impl NamespaceScope {
    /// Scope of a client stream before the server header has been seen.
    pub(crate) fn client_stream() -> Self {
        Self {
            default: Some(ns::CLIENT.to_string()),
            prefixes: vec![("stream".to_string(), ns::STREAM.to_string())],
        }
    }

    /// Apply `xmlns` and `xmlns:prefix` declarations found on an element.
    pub(crate) fn declare(&mut self, key: &str, value: &str) {
        if key == "xmlns" {
            self.default = Some(value.to_string());
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            self.prefixes.retain(|(p, _)| p != prefix);
            self.prefixes.push((prefix.to_string(), value.to_string()));
        }
    }

    fn resolve(&self, qualified_name: &str) -> Option<String> {
        match qualified_name.split_once(':') {
            Some((prefix, _)) => self
                .prefixes
                .iter()
                .find(|(p, _)| p == prefix)
                .map(|(_, uri)| uri.clone()),
            None => self.default.clone(),
        }
    }
}

fn element_from_start(
    start: &BytesStart<'_>,
    parent_scope: &NamespaceScope,
) -> Result<(Element, NamespaceScope), XmppError> {
    let name = std::str::from_utf8(start.name().as_ref())
        .map_err(|e| XmppError::Xml(e.to_string()))?
        .to_string();

    let mut scope = parent_scope.clone();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| XmppError::Xml(e.to_string()))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|e| XmppError::Xml(e.to_string()))?
            .to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| XmppError::Xml(e.to_string()))?
            .into_owned();
        if key == "xmlns" {
            scope.declare(&key, &value);
            continue;
        }
        if key.starts_with("xmlns:") {
            scope.declare(&key, &value);
        }
        attributes.push((key, value));
    }

    let namespace = scope.resolve(&name);
    let el = Element {
        name,
        namespace,
        attributes,
        children: Vec::new(),
    };
    Ok((el, scope))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inherits_client_namespace() {
        let el: Element = "<message to='a@b'><body>Hi &amp; bye</body></message>"
            .parse()
            .unwrap();
        assert_eq!(el.name(), "message");
        assert_eq!(el.namespace(), Some(ns::CLIENT));
        assert_eq!(el.attr("to"), Some("a@b"));
        let body = el.child("body", ns::CLIENT).unwrap();
        assert_eq!(body.text(), "Hi & bye");
    }

    #[test]
    fn test_parse_resolves_declared_and_prefixed_namespaces() {
        let el: Element = "<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><required/></bind></stream:features>"
            .parse()
            .unwrap();
        assert_eq!(el.local_name(), "features");
        assert_eq!(el.namespace(), Some(ns::STREAM));
        let bind = el.child("bind", ns::BIND).unwrap();
        assert!(bind.has_child("required", ns::BIND));
    }

    #[test]
    fn test_serialize_omits_inherited_namespace() {
        let el = Element::new("iq", ns::CLIENT)
            .with_attr("type", "set")
            .with_attr("id", "b1")
            .with_child(
                Element::new("bind", ns::BIND)
                    .with_child(Element::new("resource", ns::BIND).with_text("phone")),
            );
        assert_eq!(
            el.to_xml(),
            "<iq type='set' id='b1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><resource>phone</resource></bind></iq>"
        );
    }

    #[test]
    fn test_serialize_escapes_text_and_attributes() {
        let el = Element::new("message", ns::CLIENT)
            .with_attr("id", "a'b")
            .with_child(Element::new("body", ns::CLIENT).with_text("1 < 2 & 3"));
        let xml = el.to_xml();
        assert!(xml.contains("id='a&apos;b'"));
        assert!(xml.contains("<body>1 &lt; 2 &amp; 3</body>"));
        // And it survives a parse
        let back: Element = xml.parse().unwrap();
        assert_eq!(back, el);
    }

    #[test]
    fn test_cdata_becomes_text() {
        let el: Element = "<message><body><![CDATA[<b>bold</b>]]></body></message>"
            .parse()
            .unwrap();
        assert_eq!(el.child("body", ns::CLIENT).unwrap().text(), "<b>bold</b>");
    }

    #[test]
    fn test_incomplete_element_is_an_error() {
        assert!("<message><body>".parse::<Element>().is_err());
    }

    #[test]
    fn test_set_and_remove_attr() {
        let mut el = Element::unqualified("presence");
        el.set_attr("id", "1");
        el.set_attr("id", "2");
        assert_eq!(el.attr("id"), Some("2"));
        assert_eq!(el.attrs().count(), 1);
        assert_eq!(el.remove_attr("id"), Some("2".to_string()));
        assert_eq!(el.attr("id"), None);
    }
}
