use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::dispatch::Dispatcher;
use crate::element::Element;
use crate::error::XmppError;

/// One-shot wait for the first inbound element matching a filter.
///
/// Created by `Connection::create_stanza_collector` before the request is
/// sent, so the reply cannot slip past it. It is deregistered when fulfilled,
/// on timeout and on drop; a match arriving later goes to listeners (or the
/// next collector) instead.
pub struct StanzaCollector {
    id: u64,
    rx: oneshot::Receiver<Element>,
    dispatcher: Arc<Dispatcher>,
}

impl StanzaCollector {
    pub(crate) fn new(id: u64, rx: oneshot::Receiver<Element>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { id, rx, dispatcher }
    }

    /// Wait for the match. Fails with `Timeout` when none arrives in time and
    /// with `NotConnected` when the connection closes in the meantime.
    pub async fn next_result(mut self, timeout: Duration) -> Result<Element, XmppError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(element)) => Ok(element),
            Ok(Err(_)) => Err(XmppError::NotConnected),
            Err(_) => {
                self.dispatcher.remove_collector(self.id);
                // A match may have been delivered between the deadline and the removal
                match self.rx.try_recv() {
                    Ok(element) => Ok(element),
                    Err(_) => Err(XmppError::Timeout(timeout)),
                }
            }
        }
    }

    /// Poll without waiting.
    pub fn poll_result(&mut self) -> Option<Element> {
        self.rx.try_recv().ok()
    }
}

impl Drop for StanzaCollector {
    fn drop(&mut self) {
        self.dispatcher.remove_collector(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::StanzaIdFilter;

    fn collector(dispatcher: &Arc<Dispatcher>, id: &str) -> StanzaCollector {
        let (slot, rx) = dispatcher.register_collector(Box::new(StanzaIdFilter::new(id)));
        StanzaCollector::new(slot, rx, dispatcher.clone())
    }

    fn msg(id: &str) -> Element {
        format!("<message id='{id}'/>").parse().unwrap()
    }

    #[tokio::test]
    async fn test_returns_first_match() {
        let dispatcher = Arc::new(Dispatcher::new());
        let c = collector(&dispatcher, "q1");
        let d = dispatcher.clone();
        tokio::spawn(async move {
            d.dispatch(msg("other"));
            d.dispatch(msg("q1"));
        });
        let element = c.next_result(Duration::from_secs(5)).await.unwrap();
        assert_eq!(element.attr("id"), Some("q1"));
    }

    #[tokio::test]
    async fn test_timeout_deregisters() {
        let dispatcher = Arc::new(Dispatcher::new());
        let c = collector(&dispatcher, "late");
        assert!(matches!(
            c.next_result(Duration::from_millis(20)).await,
            Err(XmppError::Timeout(_))
        ));
        assert_eq!(dispatcher.collector_count(), 0);

        // The late reply must not satisfy a new collector for another id
        let fresh = collector(&dispatcher, "fresh");
        assert!(!dispatcher.dispatch(msg("late")));
        drop(fresh);
        assert_eq!(dispatcher.collector_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_reports_not_connected() {
        let dispatcher = Arc::new(Dispatcher::new());
        let c = collector(&dispatcher, "q");
        dispatcher.cancel_collectors();
        assert!(matches!(
            c.next_result(Duration::from_secs(5)).await,
            Err(XmppError::NotConnected)
        ));
    }
}
