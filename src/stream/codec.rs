//! Incremental decoder for the inbound XML stream, and stream header encoding.

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;

use super::framing::{extract_frame, leading_whitespace, Frame};
use crate::element::{Element, NamespaceScope};
use crate::error::XmppError;
use crate::ns;

pub const STREAM_CLOSE: &str = "</stream:stream>";

/// Attributes of the server's stream header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    pub id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub version: Option<String>,
    pub lang: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Header(StreamHeader),
    Element(Element),
    Close,
}

/// Buffers inbound bytes and yields stream items as they complete.
///
/// Namespaces declared on the stream header apply to every element that
/// follows, until [`reset`](Self::reset) starts a new stream (after STARTTLS
/// or SASL success).
#[derive(Debug)]
pub struct XmlStreamCodec {
    buffer: Vec<u8>,
    max_size: usize,
    scope: NamespaceScope,
}

impl XmlStreamCodec {
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(8192),
            max_size,
            scope: NamespaceScope::client_stream(),
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.scope = NamespaceScope::client_stream();
    }

    /// Next complete item, or `None` until more bytes are fed.
    pub fn decode(&mut self) -> Result<Option<StreamItem>, XmppError> {
        let whitespace = leading_whitespace(&self.buffer);
        if whitespace > 0 {
            self.buffer.drain(..whitespace);
        }

        let (frame, consumed) = match extract_frame(&self.buffer)? {
            Some(found) => found,
            None => {
                if self.buffer.len() > self.max_size {
                    return Err(XmppError::StanzaTooLarge {
                        limit: self.max_size,
                    });
                }
                return Ok(None);
            }
        };
        self.buffer.drain(..consumed);

        let item = match frame {
            Frame::StreamOpen(xml) => {
                let (header, scope) = parse_stream_header(&xml)?;
                self.scope = scope;
                StreamItem::Header(header)
            }
            Frame::Element(xml) => StreamItem::Element(Element::parse_in_scope(&xml, &self.scope)?),
            Frame::StreamClose => StreamItem::Close,
        };
        Ok(Some(item))
    }
}

fn parse_stream_header(xml: &str) -> Result<(StreamHeader, NamespaceScope), XmppError> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) | Ok(Event::Empty(start)) => {
                let mut header = StreamHeader::default();
                let mut scope = NamespaceScope::client_stream();
                for attr in start.attributes() {
                    let attr = attr.map_err(|e| XmppError::Xml(e.to_string()))?;
                    let key = std::str::from_utf8(attr.key.as_ref())
                        .map_err(|e| XmppError::Xml(e.to_string()))?;
                    let value = attr
                        .unescape_value()
                        .map_err(|e| XmppError::Xml(e.to_string()))?
                        .into_owned();
                    match key {
                        "id" => header.id = Some(value),
                        "from" => header.from = Some(value),
                        "to" => header.to = Some(value),
                        "version" => header.version = Some(value),
                        "xml:lang" => header.lang = Some(value),
                        _ => scope.declare(key, &value),
                    }
                }
                return Ok((header, scope));
            }
            Ok(Event::Eof) => return Err(XmppError::Xml("empty stream header".to_string())),
            Ok(_) => {}
            Err(e) => return Err(XmppError::Xml(e.to_string())),
        }
    }
}

/// Initial stream header sent by the client.
pub fn encode_stream_header(to: &str, from: Option<&str>) -> String {
    let mut header = format!("<?xml version='1.0'?><stream:stream to='{}'", escape(to));
    if let Some(from) = from {
        header.push_str(&format!(" from='{}'", escape(from)));
    }
    header.push_str(&format!(
        " version='1.0' xml:lang='en' xmlns='{}' xmlns:stream='{}'>",
        ns::CLIENT,
        ns::STREAM
    ));
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_header_features_and_close_across_reads() {
        let mut codec = XmlStreamCodec::new(1024);
        codec.feed(b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' id='s1' from='example.com' version='1.0'><stream:feat");
        match codec.decode().unwrap() {
            Some(StreamItem::Header(header)) => {
                assert_eq!(header.id.as_deref(), Some("s1"));
                assert_eq!(header.from.as_deref(), Some("example.com"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(codec.decode().unwrap(), None);

        codec.feed(b"ures><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features> <message/></stream:stream>");
        match codec.decode().unwrap() {
            Some(StreamItem::Element(features)) => {
                assert!(features.is("features", ns::STREAM));
                assert!(features.has_child("bind", ns::BIND));
            }
            other => panic!("unexpected {other:?}"),
        }
        match codec.decode().unwrap() {
            Some(StreamItem::Element(message)) => assert!(message.is("message", ns::CLIENT)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(codec.decode().unwrap(), Some(StreamItem::Close));
        assert_eq!(codec.buffered(), 0);
    }

    #[test]
    fn test_buffer_limit() {
        let mut codec = XmlStreamCodec::new(32);
        codec.feed(b"<message><body>this body never ends and keeps growing");
        assert!(matches!(
            codec.decode(),
            Err(XmppError::StanzaTooLarge { limit: 32 })
        ));
    }

    #[test]
    fn test_whitespace_keepalives_are_dropped() {
        let mut codec = XmlStreamCodec::new(32);
        for _ in 0..100 {
            codec.feed(b" ");
            assert_eq!(codec.decode().unwrap(), None);
        }
        assert_eq!(codec.buffered(), 0);
    }

    #[test]
    fn test_encode_stream_header() {
        assert_eq!(
            encode_stream_header("example.com", Some("user@example.com")),
            "<?xml version='1.0'?><stream:stream to='example.com' from='user@example.com' version='1.0' xml:lang='en' xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>"
        );
    }
}
