//! Connection handle: lifecycle, sending and stanza routing registration.
//!
//! `connect` negotiates a session on the caller's task, then splits the
//! stream between a reader task and a writer task. Errors on either task
//! end the session through one connection-lost path, which either starts the
//! reconnection manager or reports what could not be delivered.
//!
//! Lifecycle changes (connect, disconnect, connection loss, reconnection
//! attempts) are serialized by one async mutex; each established session
//! gets a generation number so late errors from a replaced session are
//! ignored.

mod negotiation;
mod queue;
mod reader;
mod writer;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::collector::StanzaCollector;
use crate::config::{ConnectionConfig, UnackedOverflowPolicy};
use crate::dispatch::{Dispatcher, ListenerId};
use crate::element::Element;
use crate::error::XmppError;
use crate::events::{ConnectionEvent, EventBus};
use crate::extensions::ExtensionRegistry;
use crate::filter::{IqReplyFilter, StanzaFilter};
use crate::jid::Jid;
use crate::reconnect::{ReconnectionManager, ReconnectionState};
use crate::sm::{SharedStreamManagement, StreamManagement};
use crate::stanza::{ensure_id, ErrorType, IqType, StanzaError};
use crate::stream::StreamFeatures;
use negotiation::{Negotiated, Negotiator};
use queue::{OutboundItem, OutboundQueue};

/// How long `disconnect` waits for the writer to flush the closing tag.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Initial,
    Connecting,
    StreamOpened,
    TlsNegotiating,
    Authenticating,
    ResourceBinding,
    Resuming,
    Connected,
    Disconnected,
}

/// Current state, observable through a watch channel and published as
/// `StateChanged` events.
pub(crate) struct StateCell {
    tx: watch::Sender<StreamState>,
    events: EventBus,
}

impl StateCell {
    fn new(events: EventBus) -> Self {
        let (tx, _) = watch::channel(StreamState::Initial);
        Self { tx, events }
    }

    pub(crate) fn get(&self) -> StreamState {
        *self.tx.borrow()
    }

    pub(crate) fn set(&self, state: StreamState) {
        let previous = self.tx.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Connection state changed");
            self.events.emit(ConnectionEvent::StateChanged { state });
        }
    }
}

/// Tasks of one established session.
struct Session {
    generation: u64,
    conn_id: u64,
    secure: bool,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Session {
    async fn shutdown(self) {
        self.reader.abort();
        self.writer.abort();
        // Wait until both are gone so the queue receiver is released
        let _ = self.reader.await;
        let _ = self.writer.await;
    }
}

struct Inner {
    config: ConnectionConfig,
    events: EventBus,
    state: StateCell,
    sm: SharedStreamManagement,
    dispatcher: Arc<Dispatcher>,
    extensions: ExtensionRegistry,
    queue: OutboundQueue,
    session: Mutex<Option<Session>>,
    bound_jid: RwLock<Option<Jid>>,
    features: RwLock<Option<StreamFeatures>>,
    generation: AtomicU64,
    disconnect_requested: AtomicBool,
    reconnection: ReconnectionManager,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let session = self
            .session
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            session.reader.abort();
            session.writer.abort();
        }
    }
}

/// Handle to one XMPP client connection. Cheap to clone; all clones share
/// the same session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("jid", &self.inner.config.jid)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(config: ConnectionConfig) -> Self {
        let events = EventBus::new();
        let sm_config = &config.stream_management;
        let sm = SharedStreamManagement::new(StreamManagement::new(
            sm_config.max_unacked,
            sm_config.ack_request_threshold,
        ));
        let queue = OutboundQueue::new(config.outbound_capacity);
        Self {
            inner: Arc::new(Inner {
                state: StateCell::new(events.clone()),
                events,
                sm,
                dispatcher: Arc::new(Dispatcher::new()),
                extensions: ExtensionRegistry::new(),
                queue,
                session: Mutex::new(None),
                bound_jid: RwLock::new(None),
                features: RwLock::new(None),
                generation: AtomicU64::new(0),
                disconnect_requested: AtomicBool::new(false),
                reconnection: ReconnectionManager::new(),
                lifecycle: tokio::sync::Mutex::new(()),
                config,
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> StreamState {
        self.inner.state.get()
    }

    pub fn watch_state(&self) -> watch::Receiver<StreamState> {
        self.inner.state.tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == StreamState::Connected
    }

    /// Whether the current session runs over TLS.
    pub fn is_secure(&self) -> bool {
        self.session_slot()
            .as_ref()
            .map(|session| session.secure)
            .unwrap_or(false)
    }

    /// Full JID assigned by the server at bind time.
    pub fn bound_jid(&self) -> Option<Jid> {
        self.inner
            .bound_jid
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Features of the last negotiated stream.
    pub fn features(&self) -> Option<StreamFeatures> {
        self.inner
            .features
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Per-connection storage for protocol extensions.
    pub fn extensions(&self) -> &ExtensionRegistry {
        &self.inner.extensions
    }

    pub fn reconnection_state(&self) -> ReconnectionState {
        self.inner.reconnection.state()
    }

    pub(crate) fn reconnection(&self) -> &ReconnectionManager {
        &self.inner.reconnection
    }

    pub fn stream_management_enabled(&self) -> bool {
        self.inner.sm.lock().is_enabled()
    }

    /// Stanzas sent but not yet acknowledged by the server.
    pub fn unacknowledged_count(&self) -> usize {
        self.inner.sm.lock().outstanding_len()
    }

    fn session_slot(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn has_session(&self) -> bool {
        self.session_slot().is_some()
    }

    /// Connect, negotiate and start the session.
    pub async fn connect(&self) -> Result<(), XmppError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.has_session() || self.inner.reconnection.is_active() {
            return Err(XmppError::AlreadyConnected);
        }
        self.inner.disconnect_requested.store(false, Ordering::SeqCst);
        // A send racing the last disconnect can leave stanzas behind; they
        // belong to no session and must not leak into this one
        let stale = self.inner.queue.drain_pending();
        if !stale.is_empty() {
            warn!(count = stale.len(), "Dropping stanzas queued after disconnect");
            self.inner.events.emit(ConnectionEvent::StanzasUndelivered {
                stanzas: stale,
                reason: "queued after disconnect".to_string(),
            });
        }
        info!(jid = %self.inner.config.jid, "Connecting");
        self.establish(false).await
    }

    /// Negotiate a session and spawn its tasks. Callers hold the lifecycle lock.
    async fn establish(&self, resume: bool) -> Result<(), XmppError> {
        let inner = &self.inner;
        let can_resume = resume && inner.sm.lock().can_resume();
        let resume_as = if can_resume { self.bound_jid() } else { None };

        let negotiator = Negotiator {
            config: &inner.config,
            events: &inner.events,
            sm: &inner.sm,
            state: &inner.state,
        };
        let Negotiated {
            stream,
            conn_id,
            jid,
            features,
            resumed,
            early,
        } = match negotiator.run(resume_as).await {
            Ok(negotiated) => negotiated,
            Err(e) => {
                warn!(error = %e, "Negotiation failed");
                inner.state.set(StreamState::Disconnected);
                return Err(e);
            }
        };

        let secure = stream.is_secure();
        *inner.bound_jid.write().unwrap_or_else(PoisonError::into_inner) = Some(jid.clone());
        *inner.features.write().unwrap_or_else(PoisonError::into_inner) = Some(features);

        let was_resumed = resumed.is_some();
        let (acknowledged, replay) = match resumed {
            Some(resumed) => (resumed.acknowledged, resumed.replay),
            None => (Vec::new(), Vec::new()),
        };
        let replayed = replay.len();

        inner.queue.discard_control();
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (stream_reader, stream_writer) = stream.into_split();
        let sm_config = &inner.config.stream_management;

        let writer_ctx = writer::WriterContext {
            sm: inner.sm.clone(),
            events: inner.events.clone(),
            flush: inner.config.flush,
            overflow: sm_config.overflow_policy,
            ack_idle_interval: sm_config.ack_idle_interval,
        };
        let receiver = inner.queue.receiver();
        let weak = Arc::downgrade(&self.inner);
        let writer = tokio::spawn(async move {
            if let Err(e) = writer::run(stream_writer, receiver, replay, writer_ctx).await {
                report_lost(&weak, generation, e);
            }
        });

        let reader_ctx = reader::ReaderContext {
            sm: inner.sm.clone(),
            events: inner.events.clone(),
            dispatcher: inner.dispatcher.clone(),
            queue: inner.queue.clone(),
            inactivity_timeout: inner.config.inactivity_timeout,
            enqueue_timeout: inner.config.enqueue_timeout,
        };
        let weak = Arc::downgrade(&self.inner);
        let reader = tokio::spawn(async move {
            if let Err(e) = reader::run(stream_reader, early, reader_ctx).await {
                report_lost(&weak, generation, e);
            }
        });

        *self.session_slot() = Some(Session {
            generation,
            conn_id,
            secure,
            reader,
            writer,
        });
        inner.state.set(StreamState::Connected);

        if !acknowledged.is_empty() {
            inner.events.emit(ConnectionEvent::StanzasAcknowledged {
                stanzas: acknowledged,
            });
        }
        if was_resumed {
            inner.events.emit(ConnectionEvent::StreamResumed { replayed });
        }
        inner.events.emit(ConnectionEvent::Authenticated {
            jid: jid.to_string(),
            resumed: was_resumed,
        });
        info!(conn_id, generation, jid = %jid, resumed = was_resumed, secure, "Session established");
        Ok(())
    }

    /// Close the session: flush queued stanzas, send the closing tag and
    /// stop the tasks. Also stops a running reconnection. Calling it again
    /// is a no-op.
    pub async fn disconnect(&self) -> Result<(), XmppError> {
        let inner = &self.inner;
        inner.disconnect_requested.store(true, Ordering::SeqCst);
        let was_reconnecting = inner.reconnection.cancel();

        let _lifecycle = inner.lifecycle.lock().await;
        let session = self.session_slot().take();
        match session {
            Some(session) => {
                let (done_tx, done_rx) = oneshot::channel();
                if inner.queue.send_control(OutboundItem::Close(done_tx)).is_ok() {
                    match tokio::time::timeout(CLOSE_TIMEOUT, done_rx).await {
                        Ok(Ok(())) => debug!(conn_id = session.conn_id, "Stream closed"),
                        _ => warn!(conn_id = session.conn_id, "Writer did not confirm stream close"),
                    }
                }
                session.shutdown().await;
            }
            None if !was_reconnecting => {
                debug!("Disconnect requested while not connected");
                return Ok(());
            }
            None => {}
        }

        inner.dispatcher.cancel_collectors();
        self.report_undelivered(Vec::new(), "disconnected");
        inner.state.set(StreamState::Disconnected);
        inner.events.emit(ConnectionEvent::Closed);
        info!("Disconnected");
        Ok(())
    }

    /// Entry point for the reader and writer tasks. Handled on its own task
    /// so it can stop both of them.
    fn connection_lost(&self, generation: u64, error: XmppError) {
        let conn = self.clone();
        tokio::spawn(async move { conn.handle_connection_lost(generation, error).await });
    }

    async fn handle_connection_lost(&self, generation: u64, error: XmppError) {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;
        let session = {
            let mut slot = self.session_slot();
            let current = slot.as_ref().map(|session| session.generation) == Some(generation);
            if current {
                slot.take()
            } else {
                None
            }
        };
        let Some(session) = session else {
            debug!(generation, error = %error, "Ignoring error from a closed session");
            return;
        };

        warn!(conn_id = session.conn_id, error = %error, "Connection lost");
        session.shutdown().await;
        inner.sm.lock().mark_connection_lost();
        inner.dispatcher.cancel_collectors();
        inner.state.set(StreamState::Disconnected);
        inner.events.emit(ConnectionEvent::ClosedOnError {
            error: error.to_string(),
        });

        let reconnect = inner.config.reconnection.enabled
            && error.allows_reconnect()
            && !inner.disconnect_requested.load(Ordering::SeqCst);
        if reconnect {
            inner.reconnection.start(self);
        } else {
            self.report_undelivered(error.undelivered().to_vec(), &error.to_string());
        }
    }

    /// One reconnection attempt, run by the reconnection manager.
    pub(crate) async fn reconnect_attempt(&self) -> Result<(), XmppError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.disconnect_requested.load(Ordering::SeqCst) {
            return Err(XmppError::NotConnected);
        }
        if self.has_session() {
            return Ok(());
        }
        self.establish(true).await
    }

    /// The reconnection manager stopped trying.
    pub(crate) async fn give_up(&self, error: &XmppError) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.has_session() {
            return;
        }
        self.inner.dispatcher.cancel_collectors();
        self.report_undelivered(Vec::new(), &format!("reconnection failed: {error}"));
        self.inner.state.set(StreamState::Disconnected);
    }

    /// Discard the stream management session and the outbound queue,
    /// publishing everything that was never confirmed.
    fn report_undelivered(&self, extra: Vec<Element>, reason: &str) {
        let mut stanzas = self.inner.sm.lock().reset();
        stanzas.extend(extra);
        stanzas.extend(self.inner.queue.drain_pending());
        if stanzas.is_empty() {
            return;
        }
        warn!(count = stanzas.len(), reason, "Stanzas undelivered");
        self.inner.events.emit(ConnectionEvent::StanzasUndelivered {
            stanzas,
            reason: reason.to_string(),
        });
    }

    fn ensure_can_send(&self) -> Result<(), XmppError> {
        // While reconnecting, stanzas wait in the queue for the next session
        if self.is_connected() || self.inner.reconnection.is_active() {
            Ok(())
        } else {
            Err(XmppError::NotConnected)
        }
    }

    /// Queue a stanza for sending. Stanzas queued from one task are written
    /// in call order.
    pub async fn send_stanza(&self, stanza: Element) -> Result<(), XmppError> {
        self.ensure_can_send()?;
        if self.inner.config.stream_management.overflow_policy == UnackedOverflowPolicy::FailStanza {
            let capacity = self.inner.sm.lock().check_capacity();
            if let Err(full) = capacity {
                return Err(XmppError::UnackedQueueFull {
                    limit: full.limit,
                    undelivered: vec![stanza],
                });
            }
        }
        self.inner
            .queue
            .enqueue(stanza, self.inner.config.enqueue_timeout)
            .await
    }

    /// Register a collector. Create it before sending the request it waits for.
    pub fn create_stanza_collector(&self, filter: impl StanzaFilter + 'static) -> StanzaCollector {
        let (id, rx) = self.inner.dispatcher.register_collector(Box::new(filter));
        StanzaCollector::new(id, rx, self.inner.dispatcher.clone())
    }

    /// Send a stanza and wait for the first inbound element matching `filter`.
    pub async fn send_and_await(
        &self,
        stanza: Element,
        filter: impl StanzaFilter + 'static,
        timeout: Duration,
    ) -> Result<Element, XmppError> {
        let collector = self.create_stanza_collector(filter);
        self.send_stanza(stanza).await?;
        collector.next_result(timeout).await
    }

    /// Send an IQ request and wait for its result. An error reply is
    /// returned as `XmppError::Stanza`.
    pub async fn send_iq(&self, mut iq: Element) -> Result<Element, XmppError> {
        if !IqType::of(&iq).map(|t| t.is_request()).unwrap_or(false) {
            return Err(XmppError::InvalidStanza(
                "send_iq expects an iq of type get or set".to_string(),
            ));
        }
        ensure_id(&mut iq);
        let filter = IqReplyFilter::new(&iq, self.bound_jid().as_ref());
        let reply = self
            .send_and_await(iq, filter, self.inner.config.reply_timeout)
            .await?;
        if IqType::of(&reply) == Some(IqType::Error) {
            let error = StanzaError::from_stanza(&reply)
                .unwrap_or_else(|| StanzaError::new(ErrorType::Cancel, "undefined-condition"));
            return Err(XmppError::Stanza(error));
        }
        Ok(reply)
    }

    /// Call `callback` on the reader task for every inbound element matching
    /// `filter` that no collector claimed.
    pub fn add_stanza_listener(
        &self,
        filter: impl StanzaFilter + 'static,
        callback: impl Fn(&Element) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner
            .dispatcher
            .add_listener(Box::new(filter), Arc::new(callback))
    }

    pub fn remove_stanza_listener(&self, id: ListenerId) -> bool {
        self.inner.dispatcher.remove_listener(id)
    }
}

fn report_lost(inner: &Weak<Inner>, generation: u64, error: XmppError) {
    match inner.upgrade() {
        Some(inner) => Connection { inner }.connection_lost(generation, error),
        None => debug!(error = %error, "Session ended after the connection was dropped"),
    }
}
