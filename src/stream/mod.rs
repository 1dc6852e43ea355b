//! XML stream over a [`Transport`].
//!
//! During negotiation one task owns the whole [`XmlStream`]. Once the session
//! is established it is split into a [`StreamReader`] for the reader task and
//! a [`StreamWriter`] for the writer task.

pub mod codec;
pub mod features;
pub mod framing;

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};
use tracing::debug;

use crate::element::Element;
use crate::error::{NegotiationError, StreamErrorCondition, XmppError};
use crate::events::{ConnectionEvent, EventBus, TrafficDirection};
use crate::ns;
use crate::transport::Transport;
pub use codec::{encode_stream_header, StreamHeader, StreamItem, XmlStreamCodec, STREAM_CLOSE};
pub use features::StreamFeatures;

const READ_BUFFER_SIZE: usize = 8192;

/// Publishes raw traffic when traffic debugging is enabled.
#[derive(Debug, Clone, Default)]
pub(crate) struct TrafficTap {
    events: Option<EventBus>,
}

impl TrafficTap {
    pub(crate) fn new(events: &EventBus, enabled: bool) -> Self {
        Self {
            events: enabled.then(|| events.clone()),
        }
    }

    fn record(&self, direction: TrafficDirection, xml: impl FnOnce() -> String) {
        if let Some(events) = &self.events {
            let xml = xml();
            debug!(target: "fluux_xmpp::traffic", ?direction, "{}", xml);
            events.emit(ConnectionEvent::Traffic { direction, xml });
        }
    }

    fn inbound(&self, bytes: &[u8]) {
        self.record(TrafficDirection::Inbound, || {
            String::from_utf8_lossy(bytes).into_owned()
        });
    }

    fn outbound(&self, xml: &str) {
        self.record(TrafficDirection::Outbound, || xml.to_string());
    }
}

/// Parse `<stream:error/>` into its defined condition.
pub fn stream_error(element: &Element) -> StreamErrorCondition {
    let condition = element
        .children()
        .find(|el| el.namespace() == Some(ns::STREAMS) && el.local_name() != "text")
        .map(|el| el.local_name().to_string())
        .unwrap_or_else(|| "undefined-condition".to_string());
    let text = element
        .child("text", ns::STREAMS)
        .map(|el| el.text())
        .filter(|t| !t.is_empty());
    StreamErrorCondition { condition, text }
}

async fn read_item<R: AsyncRead + Unpin>(
    reader: &mut R,
    codec: &mut XmlStreamCodec,
    buf: &mut [u8],
    tap: &TrafficTap,
) -> Result<StreamItem, XmppError> {
    loop {
        if let Some(item) = codec.decode()? {
            return Ok(item);
        }
        let n = reader.read(buf).await?;
        if n == 0 {
            return Err(XmppError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            )));
        }
        tap.inbound(&buf[..n]);
        codec.feed(&buf[..n]);
    }
}

/// Turn stream-level items into errors for callers that only expect elements.
fn expect_element(item: StreamItem) -> Result<Element, XmppError> {
    match item {
        StreamItem::Element(el) if el.is("error", ns::STREAM) => {
            Err(XmppError::Stream(stream_error(&el)))
        }
        StreamItem::Element(el) => Ok(el),
        StreamItem::Close => Err(XmppError::StreamClosed),
        StreamItem::Header(_) => Err(NegotiationError::UnexpectedElement("stream:stream".to_string()).into()),
    }
}

pub struct XmlStream {
    transport: Transport,
    codec: XmlStreamCodec,
    buf: Vec<u8>,
    tap: TrafficTap,
}

impl XmlStream {
    pub(crate) fn new(transport: Transport, max_stanza_size: usize, tap: TrafficTap) -> Self {
        Self {
            transport,
            codec: XmlStreamCodec::new(max_stanza_size),
            buf: vec![0; READ_BUFFER_SIZE],
            tap,
        }
    }

    pub fn is_secure(&self) -> bool {
        self.transport.is_secure()
    }

    pub async fn send_raw(&mut self, xml: &str) -> Result<(), XmppError> {
        self.tap.outbound(xml);
        self.transport.write_all(xml.as_bytes()).await?;
        self.transport.flush().await?;
        Ok(())
    }

    pub async fn send(&mut self, element: &Element) -> Result<(), XmppError> {
        self.send_raw(&element.to_xml()).await
    }

    /// Open a new stream and wait for the server's header.
    pub async fn open(
        &mut self,
        to: &str,
        from: Option<&str>,
        timeout: Duration,
    ) -> Result<StreamHeader, XmppError> {
        self.codec.reset();
        self.send_raw(&encode_stream_header(to, from)).await?;
        match self.next_item(timeout).await? {
            StreamItem::Header(header) => Ok(header),
            StreamItem::Element(el) if el.is("error", ns::STREAM) => {
                Err(XmppError::Stream(stream_error(&el)))
            }
            _ => Err(NegotiationError::MissingStreamHeader.into()),
        }
    }

    pub async fn next_item(&mut self, timeout: Duration) -> Result<StreamItem, XmppError> {
        tokio::time::timeout(
            timeout,
            read_item(&mut self.transport, &mut self.codec, &mut self.buf, &self.tap),
        )
        .await
        .map_err(|_| XmppError::Timeout(timeout))?
    }

    pub async fn next_element(&mut self, timeout: Duration) -> Result<Element, XmppError> {
        expect_element(self.next_item(timeout).await?)
    }

    /// Upgrade the transport after `<proceed/>`. The caller must reopen the stream.
    pub async fn starttls(self, tls_name: &str, insecure: bool) -> Result<XmlStream, XmppError> {
        let XmlStream {
            transport,
            mut codec,
            buf,
            tap,
        } = self;
        codec.reset();
        let transport = transport.upgrade_to_tls(tls_name, insecure).await?;
        Ok(XmlStream {
            transport,
            codec,
            buf,
            tap,
        })
    }

    /// Split into halves for the reader and writer tasks. Bytes already
    /// buffered by the codec stay with the reader.
    pub(crate) fn into_split(self) -> (StreamReader, StreamWriter) {
        let (read, write) = tokio::io::split(self.transport);
        (
            StreamReader {
                read,
                codec: self.codec,
                buf: self.buf,
                tap: self.tap.clone(),
            },
            StreamWriter {
                write: BufWriter::new(write),
                tap: self.tap,
            },
        )
    }
}

pub(crate) struct StreamReader {
    read: ReadHalf<Transport>,
    codec: XmlStreamCodec,
    buf: Vec<u8>,
    tap: TrafficTap,
}

impl StreamReader {
    pub(crate) async fn next_item(&mut self) -> Result<StreamItem, XmppError> {
        read_item(&mut self.read, &mut self.codec, &mut self.buf, &self.tap).await
    }
}

pub(crate) struct StreamWriter {
    write: BufWriter<WriteHalf<Transport>>,
    tap: TrafficTap,
}

impl StreamWriter {
    /// Write one element completely; it reaches the socket on the next flush.
    pub(crate) async fn write_element(&mut self, element: &Element) -> Result<(), XmppError> {
        self.write_raw(&element.to_xml()).await
    }

    pub(crate) async fn write_raw(&mut self, xml: &str) -> Result<(), XmppError> {
        self.tap.outbound(xml);
        self.write.write_all(xml.as_bytes()).await?;
        Ok(())
    }

    pub(crate) async fn flush(&mut self) -> Result<(), XmppError> {
        self.write.flush().await?;
        Ok(())
    }

    /// Send the closing tag and shut the write side down.
    pub(crate) async fn close(&mut self) -> Result<(), XmppError> {
        self.write_raw(STREAM_CLOSE).await?;
        self.write.flush().await?;
        self.write.shutdown().await?;
        Ok(())
    }
}
