//! Scripted XMPP server for connection tests.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use crate::config::{ConnectionConfig, ReconnectionPolicy, StreamManagementConfig, TlsPolicy};
use crate::element::Element;
use crate::events::ConnectionEvent;
use crate::ns;
use crate::stream::{StreamHeader, StreamItem, XmlStreamCodec};

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) const PLAIN_MECHANISM: &str =
    "<mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms>";
pub(crate) const BIND: &str = "<bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>";
pub(crate) const SM: &str = "<sm xmlns='urn:xmpp:sm:3'/>";

/// Plaintext PLAIN login against a [`MockServer`], reconnection disabled.
pub(crate) fn test_config(server: &MockServer) -> ConnectionConfig {
    test_config_builder(server).build().unwrap()
}

pub(crate) fn test_config_builder(server: &MockServer) -> crate::config::ConnectionConfigBuilder {
    ConnectionConfig::builder("user@example.com", "pencil")
        .resource("laptop")
        .server(server.address())
        .tls(TlsPolicy::Disabled)
        .allow_plain_without_tls(true)
        .stream_management(StreamManagementConfig {
            ack_idle_interval: Duration::from_secs(60),
            ..Default::default()
        })
        .reconnection(ReconnectionPolicy {
            enabled: false,
            ..Default::default()
        })
}

pub(crate) async fn wait_for_event(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    matches: impl Fn(&ConnectionEvent) -> bool,
) -> ConnectionEvent {
    tokio::time::timeout(STEP_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .expect("expected event was not published")
}

pub(crate) struct MockServer {
    listener: TcpListener,
}

impl MockServer {
    pub(crate) async fn bind() -> Self {
        Self {
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    pub(crate) fn address(&self) -> String {
        format!("127.0.0.1:{}", self.listener.local_addr().unwrap().port())
    }

    pub(crate) async fn accept(&self) -> MockPeer {
        let (stream, _) = tokio::time::timeout(STEP_TIMEOUT, self.listener.accept())
            .await
            .expect("client did not connect")
            .unwrap();
        MockPeer {
            stream,
            codec: XmlStreamCodec::new(1024 * 1024),
            buf: vec![0; 4096],
            streams_opened: 0,
        }
    }
}

/// Server side of one client connection.
pub(crate) struct MockPeer {
    stream: TcpStream,
    codec: XmlStreamCodec,
    buf: Vec<u8>,
    streams_opened: u32,
}

impl MockPeer {
    /// Next item from the client; `None` once it closed the connection.
    pub(crate) async fn next_item(&mut self) -> Option<StreamItem> {
        loop {
            if let Some(item) = self.codec.decode().expect("client sent invalid XML") {
                return Some(item);
            }
            let n = tokio::time::timeout(STEP_TIMEOUT, self.stream.read(&mut self.buf))
                .await
                .expect("timed out waiting for the client")
                .unwrap_or(0);
            if n == 0 {
                return None;
            }
            self.codec.feed(&self.buf[..n]);
        }
    }

    pub(crate) async fn expect_header(&mut self) -> StreamHeader {
        match self.next_item().await {
            Some(StreamItem::Header(header)) => header,
            other => panic!("expected stream header, got {other:?}"),
        }
    }

    pub(crate) async fn expect_element(&mut self) -> Element {
        match self.next_item().await {
            Some(StreamItem::Element(element)) => element,
            other => panic!("expected element, got {other:?}"),
        }
    }

    /// Next element that is not an ack request.
    pub(crate) async fn expect_stanza(&mut self) -> Element {
        loop {
            let element = self.expect_element().await;
            if !element.is("r", ns::SM) {
                return element;
            }
        }
    }

    /// Read until the client closes the stream or the connection.
    pub(crate) async fn expect_closed(&mut self) {
        loop {
            match self.next_item().await {
                None | Some(StreamItem::Close) => return,
                Some(_) => continue,
            }
        }
    }

    pub(crate) async fn send(&mut self, xml: &str) {
        self.stream.write_all(xml.as_bytes()).await.unwrap();
    }

    /// Answer the client's stream header with ours and `features`.
    pub(crate) async fn open_stream(&mut self, features: &str) -> StreamHeader {
        let header = self.expect_header().await;
        self.streams_opened += 1;
        let reply = format!(
            "<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' id='s{}' from='example.com' version='1.0'><stream:features>{features}</stream:features>",
            self.streams_opened
        );
        self.send(&reply).await;
        header
    }

    /// Accept a PLAIN login with the test credentials.
    pub(crate) async fn accept_plain_auth(&mut self) {
        self.open_stream(PLAIN_MECHANISM).await;
        let auth = self.expect_element().await;
        assert!(auth.is("auth", ns::SASL), "expected auth, got {auth}");
        assert_eq!(auth.attr("mechanism"), Some("PLAIN"));
        assert_eq!(auth.text(), "AHVzZXIAcGVuY2ls");
        self.send("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>")
            .await;
    }

    /// Answer the bind request, assigning `resource`.
    pub(crate) async fn accept_bind(&mut self, resource: &str) -> Element {
        let iq = self.expect_element().await;
        assert!(iq.has_child("bind", ns::BIND), "expected bind, got {iq}");
        let id = iq.attr("id").unwrap().to_string();
        self.send(&format!(
            "<iq type='result' id='{id}'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>user@example.com/{resource}</jid></bind></iq>"
        ))
        .await;
        iq
    }

    /// Full login. With `sm_id`, stream management is advertised and
    /// enabled as resumable under that id.
    pub(crate) async fn handshake(&mut self, sm_id: Option<&str>) {
        self.accept_plain_auth().await;
        match sm_id {
            Some(id) => {
                self.open_stream(&format!("{BIND}{SM}")).await;
                self.accept_bind("rewritten").await;
                let enable = self.expect_element().await;
                assert!(enable.is("enable", ns::SM), "expected enable, got {enable}");
                assert_eq!(enable.attr("resume"), Some("true"));
                self.send(&format!(
                    "<enabled xmlns='urn:xmpp:sm:3' id='{id}' resume='true' max='300'/>"
                ))
                .await;
            }
            None => {
                self.open_stream(BIND).await;
                self.accept_bind("rewritten").await;
            }
        }
    }
}
