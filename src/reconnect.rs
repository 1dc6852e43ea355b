//! Automatic reconnection after an unexpected connection loss.
//!
//! One loop per loss: back off, attempt, repeat until an attempt succeeds,
//! the attempt budget is spent, an attempt fails with an error a retry
//! cannot fix, or `disconnect` cancels it. Each attempt resumes the stream
//! management session when it is still resumable and falls back to a fresh
//! session otherwise.

use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::events::ConnectionEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectionState {
    Idle,
    /// Waiting out the delay before the next attempt.
    BackingOff,
    Attempting,
}

struct ManagerState {
    state: ReconnectionState,
    /// Identifies the running loop; a cancelled loop must not touch the
    /// state of its successor.
    run_id: u64,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

pub(crate) struct ReconnectionManager {
    inner: Mutex<ManagerState>,
}

impl ReconnectionManager {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(ManagerState {
                state: ReconnectionState::Idle,
                run_id: 0,
                shutdown_tx: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> ReconnectionState {
        self.lock().state
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state() != ReconnectionState::Idle
    }

    /// Start the loop unless one is already running.
    pub(crate) fn start(&self, conn: &Connection) {
        let (run_id, shutdown) = {
            let mut inner = self.lock();
            if inner.state != ReconnectionState::Idle {
                debug!("Reconnection already in progress");
                return;
            }
            let (shutdown_tx, shutdown) = broadcast::channel(1);
            inner.run_id += 1;
            inner.state = ReconnectionState::BackingOff;
            inner.shutdown_tx = Some(shutdown_tx);
            (inner.run_id, shutdown)
        };
        tokio::spawn(run(conn.clone(), run_id, shutdown));
    }

    /// Stop the running loop. Returns whether one was running.
    pub(crate) fn cancel(&self) -> bool {
        let mut inner = self.lock();
        let was_active = inner.state != ReconnectionState::Idle;
        if let Some(shutdown_tx) = inner.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        inner.state = ReconnectionState::Idle;
        if was_active {
            info!("Reconnection cancelled");
        }
        was_active
    }

    /// Move the loop `run_id` to `state`. Returns false when that loop was
    /// cancelled or replaced.
    fn transition(&self, run_id: u64, state: ReconnectionState) -> bool {
        let mut inner = self.lock();
        if inner.run_id != run_id || inner.shutdown_tx.is_none() {
            return false;
        }
        inner.state = state;
        if state == ReconnectionState::Idle {
            inner.shutdown_tx = None;
        }
        true
    }
}

async fn run(conn: Connection, run_id: u64, mut shutdown: broadcast::Receiver<()>) {
    let policy = conn.config().reconnection.clone();
    let manager = conn.reconnection();
    let mut attempt: u32 = 0;

    loop {
        attempt = attempt.saturating_add(1);
        let delay = policy.delay_for(attempt);
        if !manager.transition(run_id, ReconnectionState::BackingOff) {
            return;
        }
        let delay_ms = delay.as_millis() as u64;
        info!(attempt, delay_ms, "Reconnecting after backoff");
        conn.events()
            .emit(ConnectionEvent::Reconnecting { attempt, delay_ms });

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.recv() => {
                debug!(attempt, "Reconnection stopped during backoff");
                return;
            }
        }

        if !manager.transition(run_id, ReconnectionState::Attempting) {
            return;
        }
        let result = tokio::select! {
            result = conn.reconnect_attempt() => result,
            _ = shutdown.recv() => {
                debug!(attempt, "Reconnection stopped during an attempt");
                return;
            }
        };

        match result {
            Ok(()) => {
                info!(attempt, "Reconnected");
                manager.transition(run_id, ReconnectionState::Idle);
                return;
            }
            Err(e) => {
                warn!(attempt, error = %e, "Reconnection attempt failed");
                conn.events()
                    .emit(ConnectionEvent::ReconnectionAttemptFailed {
                        attempt,
                        error: e.to_string(),
                    });
                if !e.allows_reconnect() || policy.exhausted(attempt) {
                    warn!(attempts = attempt, "Giving up reconnection");
                    if manager.transition(run_id, ReconnectionState::Idle) {
                        conn.events()
                            .emit(ConnectionEvent::ReconnectionGaveUp { attempts: attempt });
                        conn.give_up(&e).await;
                    }
                    return;
                }
            }
        }
    }
}
