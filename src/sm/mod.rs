//! XEP-0198 Stream Management engine.
//!
//! The engine owns the handled counters, the queue of stanzas the server has
//! not acknowledged yet and the resumption token. The writer records every
//! stanza it sends, the reader applies acks and counts inbound stanzas, and
//! both do so through one [`SharedStreamManagement`] mutex whose critical
//! sections never await.
//!
//! Counters are `u32` and wrap modulo 2^32 as the protocol requires, so all
//! arithmetic on them uses `wrapping_*` operations.

pub mod protocol;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::element::Element;
use crate::error::XmppError;

/// A sent stanza waiting for the server's acknowledgement.
#[derive(Debug, Clone)]
pub struct StanzaRecord {
    pub element: Element,
    /// Value of the outbound counter before this stanza was sent.
    pub sequence: u32,
}

/// Server-issued handle for resuming the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumptionToken {
    pub id: String,
    /// Resumption window granted by the server.
    pub max: Option<Duration>,
    /// Preferred reconnection address (`host:port`), if the server sent one.
    pub location: Option<String>,
    lost_at: Option<Instant>,
}

impl ResumptionToken {
    fn expired(&self) -> bool {
        match (self.lost_at, self.max) {
            (Some(lost_at), Some(max)) => lost_at.elapsed() > max,
            _ => false,
        }
    }
}

/// The unacknowledged queue is at its configured bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull {
    pub limit: usize,
}

impl From<QueueFull> for XmppError {
    fn from(full: QueueFull) -> Self {
        XmppError::UnackedQueueFull {
            limit: full.limit,
            undelivered: Vec::new(),
        }
    }
}

/// Result of a successful `<resumed/>`.
#[derive(Debug, Default)]
pub struct Resumed {
    /// Stanzas the server's `h` confirmed.
    pub acknowledged: Vec<Element>,
    /// Stanzas to send again, in original order.
    pub replay: Vec<Element>,
}

/// Result of `<failed/>` answering a resume request.
#[derive(Debug, Default)]
pub struct ResumeFailed {
    /// Stanzas the `h` on `<failed/>` still confirmed.
    pub acknowledged: Vec<Element>,
    /// Stanzas that can no longer be proven delivered.
    pub undelivered: Vec<Element>,
}

#[derive(Debug)]
pub struct StreamManagement {
    enabled: bool,
    resumable: bool,
    /// Stanzas received and handled in this session (our `h`).
    inbound_handled: u32,
    /// Stanzas sent in this session.
    outbound_sent: u32,
    /// Last `h` reported by the server.
    last_acked: u32,
    outstanding: VecDeque<StanzaRecord>,
    token: Option<ResumptionToken>,
    max_outstanding: usize,
    ack_threshold: u32,
    since_ack_request: u32,
}

impl StreamManagement {
    pub fn new(max_outstanding: usize, ack_threshold: u32) -> Self {
        Self {
            enabled: false,
            resumable: false,
            inbound_handled: 0,
            outbound_sent: 0,
            last_acked: 0,
            outstanding: VecDeque::new(),
            token: None,
            max_outstanding,
            ack_threshold: ack_threshold.max(1),
            since_ack_request: 0,
        }
    }

    pub fn set_limits(&mut self, max_outstanding: usize, ack_threshold: u32) {
        self.max_outstanding = max_outstanding;
        self.ack_threshold = ack_threshold.max(1);
    }

    /// Start a new stream management session after `<enabled/>`.
    pub fn enable(
        &mut self,
        id: Option<String>,
        resume: bool,
        max: Option<Duration>,
        location: Option<String>,
    ) {
        if !self.outstanding.is_empty() {
            warn!(
                outstanding = self.outstanding.len(),
                "Enabling stream management with stanzas from a previous session queued"
            );
        }
        self.enabled = true;
        self.inbound_handled = 0;
        self.outbound_sent = 0;
        self.last_acked = 0;
        self.since_ack_request = 0;
        self.outstanding.clear();
        self.resumable = resume && id.is_some();
        self.token = match id {
            Some(id) if resume => Some(ResumptionToken {
                id,
                max,
                location,
                lost_at: None,
            }),
            _ => None,
        };
        info!(
            resumable = self.resumable,
            max_secs = max.map(|m| m.as_secs()),
            "Stream management enabled"
        );
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_resumable(&self) -> bool {
        self.resumable
    }

    pub fn token(&self) -> Option<&ResumptionToken> {
        self.token.as_ref()
    }

    pub fn inbound_handled(&self) -> u32 {
        self.inbound_handled
    }

    pub fn last_acked(&self) -> u32 {
        self.last_acked
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn outstanding(&self) -> impl Iterator<Item = &StanzaRecord> {
        self.outstanding.iter()
    }

    /// Count one inbound stanza. Nonzas are never counted.
    pub fn on_inbound_stanza(&mut self) {
        if self.enabled {
            self.inbound_handled = self.inbound_handled.wrapping_add(1);
        }
    }

    /// Whether one more stanza would fit in the unacknowledged queue.
    pub fn check_capacity(&self) -> Result<(), QueueFull> {
        if self.enabled && self.outstanding.len() >= self.max_outstanding {
            return Err(QueueFull {
                limit: self.max_outstanding,
            });
        }
        Ok(())
    }

    /// Record a stanza about to be written. Returns whether an ack request
    /// should follow it.
    pub fn record_outbound(&mut self, element: &Element) -> Result<bool, QueueFull> {
        if !self.enabled {
            return Ok(false);
        }
        self.check_capacity()?;
        let sequence = self.outbound_sent;
        self.outbound_sent = self.outbound_sent.wrapping_add(1);
        self.outstanding.push_back(StanzaRecord {
            element: element.clone(),
            sequence,
        });
        self.since_ack_request += 1;
        if self.since_ack_request >= self.ack_threshold {
            self.since_ack_request = 0;
            return Ok(true);
        }
        Ok(false)
    }

    /// Stanzas were sent since the last ack request.
    pub fn wants_ack_request(&self) -> bool {
        self.enabled && self.since_ack_request > 0
    }

    /// An ack request was sent for everything recorded so far.
    pub fn note_ack_requested(&mut self) {
        self.since_ack_request = 0;
    }

    /// Apply the server's handled count, returning the confirmed stanzas.
    ///
    /// A count covering more stanzas than are outstanding means the server
    /// claims stanzas this session never sent: the queue is left untouched
    /// and a [`XmppError::CounterMismatch`] is returned.
    pub fn handle_ack(&mut self, h: u32) -> Result<Vec<Element>, XmppError> {
        if !self.enabled {
            debug!(h, "Ignoring ack while stream management is disabled");
            return Ok(Vec::new());
        }
        let confirmed = h.wrapping_sub(self.last_acked) as usize;
        if confirmed > self.outstanding.len() {
            warn!(
                h,
                last_acked = self.last_acked,
                outstanding = self.outstanding.len(),
                "Server acknowledged more stanzas than were sent"
            );
            return Err(XmppError::CounterMismatch {
                h,
                last_acked: self.last_acked,
                outstanding: self.outstanding.len(),
            });
        }
        self.last_acked = h;
        let acknowledged: Vec<Element> = self
            .outstanding
            .drain(..confirmed)
            .map(|record| record.element)
            .collect();
        debug!(
            h,
            confirmed,
            outstanding = self.outstanding.len(),
            "Ack applied"
        );
        Ok(acknowledged)
    }

    pub fn mark_connection_lost(&mut self) {
        if let Some(token) = &mut self.token {
            if token.lost_at.is_none() {
                token.lost_at = Some(Instant::now());
            }
        }
    }

    pub fn can_resume(&self) -> bool {
        self.enabled
            && self.resumable
            && self
                .token
                .as_ref()
                .map(|token| !token.expired())
                .unwrap_or(false)
    }

    /// `<resume/>` carrying the token and our handled count.
    pub fn resume_request(&self) -> Option<Element> {
        if !self.can_resume() {
            return None;
        }
        self.token
            .as_ref()
            .map(|token| protocol::resume(&token.id, self.inbound_handled))
    }

    /// Apply `<resumed h='...'/>`: drop what the server confirmed and return
    /// the rest for replay. Replayed stanzas stay queued until acknowledged.
    pub fn handle_resumed(&mut self, h: u32) -> Result<Resumed, XmppError> {
        let acknowledged = self.handle_ack(h)?;
        if let Some(token) = &mut self.token {
            token.lost_at = None;
        }
        self.since_ack_request = 0;
        let replay: Vec<Element> = self
            .outstanding
            .iter()
            .map(|record| record.element.clone())
            .collect();
        info!(
            h,
            acknowledged = acknowledged.len(),
            replay = replay.len(),
            "Stream resumed"
        );
        Ok(Resumed {
            acknowledged,
            replay,
        })
    }

    /// Apply `<failed/>` after a resume attempt. All session state is
    /// discarded.
    pub fn handle_failed(&mut self, h: Option<u32>) -> ResumeFailed {
        let acknowledged = match h.map(|h| self.handle_ack(h)) {
            Some(Ok(acknowledged)) => acknowledged,
            Some(Err(e)) => {
                warn!(error = %e, "Ignoring inconsistent h on failed resumption");
                Vec::new()
            }
            None => Vec::new(),
        };
        ResumeFailed {
            acknowledged,
            undelivered: self.reset(),
        }
    }

    /// Discard the session. Returns stanzas that were never acknowledged.
    pub fn reset(&mut self) -> Vec<Element> {
        self.enabled = false;
        self.resumable = false;
        self.token = None;
        self.inbound_handled = 0;
        self.outbound_sent = 0;
        self.last_acked = 0;
        self.since_ack_request = 0;
        self.outstanding
            .drain(..)
            .map(|record| record.element)
            .collect()
    }

    #[cfg(test)]
    fn with_counters(last_acked: u32, inbound_handled: u32) -> Self {
        let mut sm = Self::new(100, 5);
        sm.enable(Some("test".to_string()), true, None, None);
        sm.last_acked = last_acked;
        sm.outbound_sent = last_acked;
        sm.inbound_handled = inbound_handled;
        sm
    }
}

/// Engine shared by the reader, the writer and the connection handle.
#[derive(Debug, Clone)]
pub struct SharedStreamManagement(Arc<Mutex<StreamManagement>>);

impl SharedStreamManagement {
    pub fn new(engine: StreamManagement) -> Self {
        Self(Arc::new(Mutex::new(engine)))
    }

    /// Lock the engine. Never hold the guard across an await point.
    pub fn lock(&self) -> MutexGuard<'_, StreamManagement> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str) -> Element {
        format!("<message id='{id}'/>").parse().unwrap()
    }

    fn ids(elements: &[Element]) -> Vec<&str> {
        elements.iter().filter_map(|e| e.attr("id")).collect()
    }

    fn enabled() -> StreamManagement {
        let mut sm = StreamManagement::new(100, 5);
        sm.enable(Some("sm-1".to_string()), true, Some(Duration::from_secs(300)), None);
        sm
    }

    #[test]
    fn test_ack_of_everything_empties_queue() {
        for n in [0u32, 1, 7, 64] {
            let mut sm = enabled();
            for i in 0..n {
                sm.record_outbound(&msg(&i.to_string())).unwrap();
            }
            let acked = sm.handle_ack(n).unwrap();
            assert_eq!(acked.len(), n as usize);
            assert_eq!(sm.outstanding_len(), 0);
            assert_eq!(sm.last_acked(), n);
        }
    }

    #[test]
    fn test_partial_acks_trim_from_head() {
        let mut sm = enabled();
        for id in ["a", "b", "c", "d"] {
            sm.record_outbound(&msg(id)).unwrap();
        }
        assert_eq!(ids(&sm.handle_ack(1).unwrap()), vec!["a"]);
        assert_eq!(ids(&sm.handle_ack(3).unwrap()), vec!["b", "c"]);
        // Repeated ack for the same count confirms nothing new
        assert!(sm.handle_ack(3).unwrap().is_empty());
        let remaining: Vec<_> = sm.outstanding().map(|r| r.sequence).collect();
        assert_eq!(remaining, vec![3]);
    }

    #[test]
    fn test_counters_wrap_around() {
        let mut sm = StreamManagement::with_counters(u32::MAX - 2, u32::MAX);
        for id in ["a", "b", "c", "d", "e"] {
            sm.record_outbound(&msg(id)).unwrap();
        }
        let sequences: Vec<_> = sm.outstanding().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![u32::MAX - 2, u32::MAX - 1, u32::MAX, 0, 1]);

        // h=1 is four stanzas past MAX-2 once wrapped
        assert_eq!(ids(&sm.handle_ack(1).unwrap()), vec!["a", "b", "c", "d"]);
        assert_eq!(ids(&sm.handle_ack(2).unwrap()), vec!["e"]);

        sm.on_inbound_stanza();
        assert_eq!(sm.inbound_handled(), 0);
    }

    #[test]
    fn test_ack_beyond_sent_is_counter_error() {
        let mut sm = enabled();
        sm.record_outbound(&msg("a")).unwrap();
        sm.record_outbound(&msg("b")).unwrap();
        match sm.handle_ack(3) {
            Err(XmppError::CounterMismatch {
                h,
                last_acked,
                outstanding,
            }) => {
                assert_eq!((h, last_acked, outstanding), (3, 0, 2));
            }
            other => panic!("unexpected {other:?}"),
        }
        // Nothing was trimmed
        assert_eq!(sm.outstanding_len(), 2);
        assert_eq!(sm.last_acked(), 0);
    }

    #[test]
    fn test_resume_replays_only_unacknowledged_in_order() {
        let mut sm = enabled();
        for id in ["a", "b", "c"] {
            sm.record_outbound(&msg(id)).unwrap();
        }
        sm.handle_ack(1).unwrap();
        sm.mark_connection_lost();
        assert!(sm.can_resume());
        let request = sm.resume_request().unwrap();
        assert_eq!(request.attr("previd"), Some("sm-1"));

        let resumed = sm.handle_resumed(1).unwrap();
        assert!(resumed.acknowledged.is_empty());
        assert_eq!(ids(&resumed.replay), vec!["b", "c"]);
        // Replayed stanzas stay queued until acknowledged
        assert_eq!(sm.outstanding_len(), 2);
    }

    #[test]
    fn test_repeated_resumptions_never_replay_confirmed_stanzas() {
        let mut sm = enabled();
        for id in ["a", "b", "c"] {
            sm.record_outbound(&msg(id)).unwrap();
        }
        sm.mark_connection_lost();
        let first = sm.handle_resumed(1).unwrap();
        assert_eq!(ids(&first.acknowledged), vec!["a"]);
        assert_eq!(ids(&first.replay), vec!["b", "c"]);

        // The replayed "b" reached the server before the next loss
        sm.mark_connection_lost();
        let second = sm.handle_resumed(2).unwrap();
        assert_eq!(ids(&second.acknowledged), vec!["b"]);
        assert_eq!(ids(&second.replay), vec!["c"]);

        sm.mark_connection_lost();
        let third = sm.handle_resumed(3).unwrap();
        assert!(third.replay.is_empty());
    }

    #[test]
    fn test_failed_resumption_reports_undelivered() {
        let mut sm = enabled();
        for id in ["a", "b", "c"] {
            sm.record_outbound(&msg(id)).unwrap();
        }
        sm.mark_connection_lost();
        let failed = sm.handle_failed(Some(1));
        assert_eq!(ids(&failed.acknowledged), vec!["a"]);
        assert_eq!(ids(&failed.undelivered), vec!["b", "c"]);
        assert!(!sm.is_enabled());
        assert!(!sm.can_resume());
        assert_eq!(sm.outstanding_len(), 0);
    }

    #[test]
    fn test_failed_resumption_with_inconsistent_h() {
        let mut sm = enabled();
        sm.record_outbound(&msg("a")).unwrap();
        sm.mark_connection_lost();
        let failed = sm.handle_failed(Some(7));
        assert!(failed.acknowledged.is_empty());
        assert_eq!(ids(&failed.undelivered), vec!["a"]);
    }

    #[test]
    fn test_queue_bound_and_ack_threshold() {
        let mut sm = StreamManagement::new(3, 2);
        sm.enable(None, false, None, None);
        assert!(!sm.record_outbound(&msg("a")).unwrap());
        assert!(sm.record_outbound(&msg("b")).unwrap());
        assert!(!sm.record_outbound(&msg("c")).unwrap());
        assert_eq!(sm.record_outbound(&msg("d")), Err(QueueFull { limit: 3 }));
        assert_eq!(sm.outstanding_len(), 3);
        // Without a token the session is not resumable
        assert!(!sm.can_resume());
    }

    #[test]
    fn test_disabled_engine_keeps_no_records() {
        let mut sm = StreamManagement::new(1, 1);
        for id in ["a", "b", "c"] {
            assert_eq!(sm.record_outbound(&msg(id)), Ok(false));
        }
        sm.on_inbound_stanza();
        assert_eq!(sm.outstanding_len(), 0);
        assert_eq!(sm.inbound_handled(), 0);
        assert!(sm.resume_request().is_none());
    }

    #[test]
    fn test_token_expires_after_window() {
        let mut sm = StreamManagement::new(10, 5);
        sm.enable(Some("x".to_string()), true, Some(Duration::ZERO), None);
        assert!(sm.can_resume());
        sm.mark_connection_lost();
        std::thread::sleep(Duration::from_millis(5));
        assert!(!sm.can_resume());
    }
}
