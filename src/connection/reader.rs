//! Reader task: parses inbound elements and routes them.
//!
//! Stream management nonzas are consumed here. Stanzas are counted, then
//! handed to the dispatcher on this task, so listeners see them in arrival
//! order.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use super::queue::{OutboundItem, OutboundQueue};
use crate::dispatch::Dispatcher;
use crate::element::Element;
use crate::error::{NegotiationError, XmppError};
use crate::events::{ConnectionEvent, EventBus};
use crate::ns;
use crate::sm::protocol::{self, SmNonza};
use crate::sm::SharedStreamManagement;
use crate::stanza::{error_reply, is_stanza, ErrorType, IqType, StanzaError};
use crate::stream::{stream_error, StreamItem, StreamReader};

pub(super) struct ReaderContext {
    pub(super) sm: SharedStreamManagement,
    pub(super) events: EventBus,
    pub(super) dispatcher: Arc<Dispatcher>,
    pub(super) queue: OutboundQueue,
    pub(super) inactivity_timeout: Option<Duration>,
    pub(super) enqueue_timeout: Duration,
}

/// Run until the stream ends. Always returns the reason it ended.
///
/// `early` holds stanzas received during negotiation, before stream
/// management counting started.
pub(super) async fn run(
    mut reader: StreamReader,
    early: Vec<Element>,
    ctx: ReaderContext,
) -> Result<(), XmppError> {
    for element in early {
        route(&ctx, element).await;
    }

    loop {
        let item = match ctx.inactivity_timeout {
            Some(limit) => tokio::time::timeout(limit, reader.next_item())
                .await
                .map_err(|_| XmppError::Inactive(limit))??,
            None => reader.next_item().await?,
        };
        match item {
            StreamItem::Element(element) => handle_element(&ctx, element).await?,
            StreamItem::Close => {
                info!("Server closed the stream");
                return Err(XmppError::StreamClosed);
            }
            StreamItem::Header(_) => {
                return Err(NegotiationError::UnexpectedElement("stream:stream".to_string()).into())
            }
        }
    }
}

async fn handle_element(ctx: &ReaderContext, element: Element) -> Result<(), XmppError> {
    if element.is("error", ns::STREAM) {
        let condition = stream_error(&element);
        warn!(%condition, "Stream error from server");
        return Err(XmppError::Stream(condition));
    }
    if let Some(nonza) = SmNonza::parse(&element) {
        return handle_sm(ctx, nonza);
    }
    if is_stanza(&element) {
        ctx.sm.lock().on_inbound_stanza();
    }
    route(ctx, element).await;
    Ok(())
}

fn handle_sm(ctx: &ReaderContext, nonza: SmNonza) -> Result<(), XmppError> {
    match nonza {
        SmNonza::Request => {
            let (enabled, h) = {
                let sm = ctx.sm.lock();
                (sm.is_enabled(), sm.inbound_handled())
            };
            if !enabled {
                debug!("Ignoring ack request while stream management is disabled");
                return Ok(());
            }
            trace!(h, "Answering ack request");
            ctx.queue
                .send_control(OutboundItem::Nonza(protocol::answer(h)))
        }
        SmNonza::Answer { h } => {
            let acknowledged = ctx.sm.lock().handle_ack(h)?;
            if !acknowledged.is_empty() {
                ctx.events.emit(ConnectionEvent::StanzasAcknowledged {
                    stanzas: acknowledged,
                });
            }
            Ok(())
        }
        SmNonza::Malformed { name } => {
            warn!(%name, "Malformed stream management element");
            Err(XmppError::StreamManagement(format!(
                "cannot apply <{name}/> from the server"
            )))
        }
        other => {
            warn!(?other, "Unexpected stream management element after negotiation");
            Ok(())
        }
    }
}

/// Hand an element to collectors and listeners. IQ requests nobody handles
/// get a `service-unavailable` error.
async fn route(ctx: &ReaderContext, element: Element) {
    let request = IqType::of(&element)
        .filter(IqType::is_request)
        .map(|_| element.clone());
    let handled = ctx.dispatcher.dispatch(element);
    let Some(request) = request.filter(|_| !handled) else {
        return;
    };
    debug!(id = request.attr("id"), from = request.attr("from"),
        "No handler for IQ request, replying service-unavailable");
    let reply = error_reply(
        &request,
        &StanzaError::new(ErrorType::Cancel, "service-unavailable"),
    );
    if let Err(e) = ctx.queue.enqueue(reply, ctx.enqueue_timeout).await {
        warn!(error = %e, "Failed to queue error reply");
    }
}
