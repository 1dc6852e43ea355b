//! Routing of inbound elements to collectors and listeners.
//!
//! A collector whose filter matches consumes the element exclusively: it is
//! removed under the registry lock before being fulfilled, so two collectors
//! can never claim the same element and no collector is fulfilled twice.
//! Elements no collector takes go to every matching listener, in
//! registration order, on the reader task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::oneshot;
use tracing::trace;

use crate::element::Element;
use crate::filter::StanzaFilter;

/// Handle returned by `add_stanza_listener`, used to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type ListenerCallback = Arc<dyn Fn(&Element) + Send + Sync>;

struct CollectorSlot {
    id: u64,
    filter: Box<dyn StanzaFilter>,
    tx: oneshot::Sender<Element>,
}

struct ListenerSlot {
    id: u64,
    filter: Box<dyn StanzaFilter>,
    callback: ListenerCallback,
}

#[derive(Default)]
pub struct Dispatcher {
    next_id: AtomicU64,
    collectors: Mutex<Vec<CollectorSlot>>,
    listeners: RwLock<Vec<Arc<ListenerSlot>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_collector(
        &self,
        filter: Box<dyn StanzaFilter>,
    ) -> (u64, oneshot::Receiver<Element>) {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CollectorSlot { id, filter, tx });
        (id, rx)
    }

    pub(crate) fn remove_collector(&self, id: u64) {
        self.collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|slot| slot.id != id);
    }

    pub fn collector_count(&self) -> usize {
        self.collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Fail every pending collector; their waiters see the connection as closed.
    pub(crate) fn cancel_collectors(&self) {
        let cancelled = std::mem::take(
            &mut *self
                .collectors
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if !cancelled.is_empty() {
            trace!(count = cancelled.len(), "Cancelled pending collectors");
        }
    }

    pub fn add_listener(
        &self,
        filter: Box<dyn StanzaFilter>,
        callback: ListenerCallback,
    ) -> ListenerId {
        let id = self.next_id();
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(ListenerSlot {
                id,
                filter,
                callback,
            }));
        ListenerId(id)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|slot| slot.id != id.0);
        listeners.len() != before
    }

    /// Deliver one element. Returns whether a collector or listener took it.
    pub fn dispatch(&self, element: Element) -> bool {
        let mut element = element;
        loop {
            let claimed = {
                let mut collectors = self
                    .collectors
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                collectors
                    .iter()
                    .position(|slot| slot.filter.accept(&element))
                    .map(|pos| collectors.remove(pos))
            };
            let Some(slot) = claimed else {
                break;
            };
            match slot.tx.send(element) {
                Ok(()) => return true,
                // The waiter gave up concurrently; offer the element to the next one
                Err(returned) => element = returned,
            }
        }

        // Snapshot so callbacks run without the registry lock held
        let matching: Vec<Arc<ListenerSlot>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|slot| slot.filter.accept(&element))
            .cloned()
            .collect();
        for listener in &matching {
            (listener.callback)(&element);
        }
        !matching.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{AnyStanza, StanzaIdFilter};
    use std::sync::Mutex as StdMutex;

    fn msg(id: &str) -> Element {
        format!("<message id='{id}'/>").parse().unwrap()
    }

    #[test]
    fn test_collector_wins_over_listeners() {
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_cb = seen.clone();
        dispatcher.add_listener(
            Box::new(AnyStanza),
            Arc::new(move |el: &Element| {
                seen_cb
                    .lock()
                    .unwrap()
                    .push(el.attr("id").unwrap_or_default().to_string())
            }),
        );
        let (_, mut rx) = dispatcher.register_collector(Box::new(StanzaIdFilter::new("x")));

        assert!(dispatcher.dispatch(msg("x")));
        assert!(dispatcher.dispatch(msg("y")));
        assert_eq!(rx.try_recv().unwrap().attr("id"), Some("x"));
        assert_eq!(*seen.lock().unwrap(), vec!["y".to_string()]);
        assert_eq!(dispatcher.collector_count(), 0);
    }

    #[test]
    fn test_overlapping_collectors_each_take_one() {
        let dispatcher = Dispatcher::new();
        let (_, mut first) = dispatcher.register_collector(Box::new(AnyStanza));
        let (_, mut second) = dispatcher.register_collector(Box::new(AnyStanza));
        dispatcher.dispatch(msg("1"));
        dispatcher.dispatch(msg("2"));
        assert_eq!(first.try_recv().unwrap().attr("id"), Some("1"));
        assert_eq!(second.try_recv().unwrap().attr("id"), Some("2"));
        // Nobody is left to take a third one
        assert!(!dispatcher.dispatch(msg("3")));
    }

    #[test]
    fn test_abandoned_collector_passes_element_on() {
        let dispatcher = Dispatcher::new();
        let (_, abandoned) = dispatcher.register_collector(Box::new(AnyStanza));
        drop(abandoned);
        let (_, mut live) = dispatcher.register_collector(Box::new(AnyStanza));
        assert!(dispatcher.dispatch(msg("a")));
        assert_eq!(live.try_recv().unwrap().attr("id"), Some("a"));
    }

    #[test]
    fn test_listeners_run_in_registration_order_and_can_be_removed() {
        let dispatcher = Dispatcher::new();
        let order = Arc::new(StdMutex::new(Vec::new()));
        let mut ids = Vec::new();
        for n in 0..3 {
            let order = order.clone();
            ids.push(dispatcher.add_listener(
                Box::new(AnyStanza),
                Arc::new(move |_: &Element| order.lock().unwrap().push(n)),
            ));
        }
        dispatcher.dispatch(msg("a"));
        assert!(dispatcher.remove_listener(ids[1]));
        assert!(!dispatcher.remove_listener(ids[1]));
        dispatcher.dispatch(msg("b"));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 0, 2]);
    }

    #[test]
    fn test_cancel_collectors_closes_waiters() {
        let dispatcher = Dispatcher::new();
        let (_, mut rx) = dispatcher.register_collector(Box::new(AnyStanza));
        dispatcher.cancel_collectors();
        assert!(matches!(
            rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }
}
