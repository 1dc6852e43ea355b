//! Outbound queue between the connection handle and the writer task.
//!
//! Stanzas and control items travel on separate channels. The stanza channel
//! may be bounded; control items (ack answers, ack requests, the close
//! request) are never blocked behind stanzas. The receiving side outlives
//! any single writer task, so stanzas queued while the connection is down
//! are written by the next writer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

use crate::element::Element;
use crate::error::XmppError;

#[derive(Debug)]
pub(crate) enum OutboundItem {
    Stanza(Element),
    Nonza(Element),
    /// Write the closing tag, then acknowledge on the channel.
    Close(oneshot::Sender<()>),
}

#[derive(Clone)]
enum StanzaSender {
    Bounded(mpsc::Sender<Element>),
    Unbounded(mpsc::UnboundedSender<Element>),
}

enum StanzaReceiver {
    Bounded(mpsc::Receiver<Element>),
    Unbounded(mpsc::UnboundedReceiver<Element>),
}

impl StanzaReceiver {
    async fn recv(&mut self) -> Option<Element> {
        match self {
            StanzaReceiver::Bounded(rx) => rx.recv().await,
            StanzaReceiver::Unbounded(rx) => rx.recv().await,
        }
    }

    fn try_recv(&mut self) -> Option<Element> {
        match self {
            StanzaReceiver::Bounded(rx) => rx.try_recv().ok(),
            StanzaReceiver::Unbounded(rx) => rx.try_recv().ok(),
        }
    }
}

/// Receiving side, locked by the writer task for its whole lifetime.
pub(crate) struct QueueReceiver {
    control: mpsc::UnboundedReceiver<OutboundItem>,
    stanzas: StanzaReceiver,
}

impl QueueReceiver {
    /// Next item, control items first.
    pub(crate) async fn recv(&mut self) -> Option<OutboundItem> {
        tokio::select! {
            biased;
            Some(item) = self.control.recv() => Some(item),
            Some(stanza) = self.stanzas.recv() => Some(OutboundItem::Stanza(stanza)),
            else => None,
        }
    }

    pub(crate) fn try_recv(&mut self) -> Option<OutboundItem> {
        if let Ok(item) = self.control.try_recv() {
            return Some(item);
        }
        self.stanzas.try_recv().map(OutboundItem::Stanza)
    }

    pub(crate) fn try_recv_stanza(&mut self) -> Option<Element> {
        self.stanzas.try_recv()
    }

    fn discard_control(&mut self) -> usize {
        let mut discarded = 0;
        while self.control.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }

    /// Drop queued control items and return queued stanzas.
    fn drain(&mut self) -> Vec<Element> {
        self.discard_control();
        let mut stanzas = Vec::new();
        while let Some(stanza) = self.stanzas.try_recv() {
            stanzas.push(stanza);
        }
        stanzas
    }
}

#[derive(Clone)]
pub(crate) struct OutboundQueue {
    control: mpsc::UnboundedSender<OutboundItem>,
    stanzas: StanzaSender,
    receiver: Arc<Mutex<QueueReceiver>>,
}

impl OutboundQueue {
    /// `capacity` bounds the stanza channel; `None` is unbounded.
    pub(crate) fn new(capacity: Option<usize>) -> Self {
        let (control, control_rx) = mpsc::unbounded_channel();
        let (stanzas, stanzas_rx) = match capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (StanzaSender::Bounded(tx), StanzaReceiver::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (StanzaSender::Unbounded(tx), StanzaReceiver::Unbounded(rx))
            }
        };
        Self {
            control,
            stanzas,
            receiver: Arc::new(Mutex::new(QueueReceiver {
                control: control_rx,
                stanzas: stanzas_rx,
            })),
        }
    }

    pub(crate) fn receiver(&self) -> Arc<Mutex<QueueReceiver>> {
        self.receiver.clone()
    }

    /// Queue a stanza, waiting up to `timeout` for space in a bounded queue.
    pub(crate) async fn enqueue(&self, stanza: Element, timeout: Duration) -> Result<(), XmppError> {
        match &self.stanzas {
            StanzaSender::Unbounded(tx) => tx.send(stanza).map_err(|_| XmppError::NotConnected),
            StanzaSender::Bounded(tx) => match tokio::time::timeout(timeout, tx.send(stanza)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(XmppError::NotConnected),
                Err(_) => {
                    debug!(timeout_ms = timeout.as_millis() as u64, "Outbound queue full");
                    Err(XmppError::Timeout(timeout))
                }
            },
        }
    }

    pub(crate) fn send_control(&self, item: OutboundItem) -> Result<(), XmppError> {
        self.control.send(item).map_err(|_| XmppError::NotConnected)
    }

    /// Forget control items addressed to a previous stream (ack answers,
    /// a close request). Queued stanzas are kept.
    pub(crate) fn discard_control(&self) {
        if let Ok(mut receiver) = self.receiver.try_lock() {
            let discarded = receiver.discard_control();
            if discarded > 0 {
                debug!(discarded, "Dropped control items from a previous stream");
            }
        }
    }

    /// Take every stanza not yet picked up by a writer. Returns nothing while
    /// a writer still holds the receiver.
    pub(crate) fn drain_pending(&self) -> Vec<Element> {
        match self.receiver.try_lock() {
            Ok(mut receiver) => receiver.drain(),
            Err(_) => Vec::new(),
        }
    }
}
