//! Writer task: the only code that writes to the socket once a session is up.
//!
//! Items leave the outbound queue in FIFO order. Stanzas are recorded with
//! the stream management engine before they are written, so a stanza cut
//! off by a failing write is still replayed on resumption.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use super::queue::{OutboundItem, QueueReceiver};
use crate::config::{FlushStrategy, UnackedOverflowPolicy};
use crate::element::Element;
use crate::error::XmppError;
use crate::events::{ConnectionEvent, EventBus};
use crate::sm::{protocol, SharedStreamManagement};
use crate::stanza::is_stanza;
use crate::stream::StreamWriter;

pub(super) struct WriterContext {
    pub(super) sm: SharedStreamManagement,
    pub(super) events: EventBus,
    pub(super) flush: FlushStrategy,
    pub(super) overflow: UnackedOverflowPolicy,
    pub(super) ack_idle_interval: Duration,
}

/// Run until the stream is closed on request (`Ok`) or a write fails.
///
/// `replay` holds stanzas confirmed lost by a resumption; they are already
/// in the unacknowledged queue and are written before anything else.
pub(super) async fn run(
    mut writer: StreamWriter,
    receiver: Arc<Mutex<QueueReceiver>>,
    replay: Vec<Element>,
    ctx: WriterContext,
) -> Result<(), XmppError> {
    let mut queue = receiver.lock().await;

    if !replay.is_empty() {
        for stanza in &replay {
            writer.write_element(stanza).await?;
        }
        writer.write_element(&protocol::request()).await?;
        writer.flush().await?;
        ctx.sm.lock().note_ack_requested();
        debug!(count = replay.len(), "Replayed unacknowledged stanzas");
    }

    let mut pending: Option<OutboundItem> = None;
    loop {
        let item = match pending.take() {
            Some(item) => item,
            None => {
                let wants_ack = ctx.sm.lock().wants_ack_request();
                let next = if wants_ack {
                    match tokio::time::timeout(ctx.ack_idle_interval, queue.recv()).await {
                        Ok(next) => next,
                        Err(_) => {
                            trace!("Writer idle with stanzas unacknowledged, requesting ack");
                            writer.write_element(&protocol::request()).await?;
                            writer.flush().await?;
                            ctx.sm.lock().note_ack_requested();
                            continue;
                        }
                    }
                } else {
                    queue.recv().await
                };
                match next {
                    Some(item) => item,
                    // Every sender is gone: the connection handle was dropped
                    None => return Ok(()),
                }
            }
        };

        match item {
            OutboundItem::Stanza(stanza) => write_stanza(&mut writer, &ctx, stanza).await?,
            OutboundItem::Nonza(nonza) => writer.write_element(&nonza).await?,
            OutboundItem::Close(done) => {
                // Stanzas queued before the close request still go out
                while let Some(stanza) = queue.try_recv_stanza() {
                    write_stanza(&mut writer, &ctx, stanza).await?;
                }
                writer.close().await?;
                let _ = done.send(());
                return Ok(());
            }
        }

        match ctx.flush {
            FlushStrategy::PerElement => writer.flush().await?,
            FlushStrategy::WhenIdle => {
                pending = queue.try_recv();
                if pending.is_none() {
                    writer.flush().await?;
                }
            }
        }
    }
}

async fn write_stanza(
    writer: &mut StreamWriter,
    ctx: &WriterContext,
    stanza: Element,
) -> Result<(), XmppError> {
    let mut request_ack = false;
    if is_stanza(&stanza) {
        let recorded = ctx.sm.lock().record_outbound(&stanza);
        match recorded {
            Ok(request) => request_ack = request,
            Err(full) => match ctx.overflow {
                UnackedOverflowPolicy::FailStanza => {
                    warn!(limit = full.limit, "Unacknowledged queue full, stanza not sent");
                    ctx.events.emit(ConnectionEvent::StanzasUndelivered {
                        stanzas: vec![stanza],
                        reason: XmppError::from(full).to_string(),
                    });
                    return Ok(());
                }
                UnackedOverflowPolicy::CloseConnection => {
                    return Err(XmppError::UnackedQueueFull {
                        limit: full.limit,
                        undelivered: vec![stanza],
                    });
                }
            },
        }
    }

    writer.write_element(&stanza).await?;
    if request_ack {
        trace!("Ack threshold reached, requesting ack");
        writer.write_element(&protocol::request()).await?;
    }
    Ok(())
}
