use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::types::{RelayEvent, RelayOutcome};

/// Receives the outcome of every relay attempt.
///
/// Called from inside a relay tick, so implementations must return quickly
/// and must not block.
pub trait RelayObserver: Send + Sync {
    fn on_event(&self, event: &RelayEvent);
}

/// Logs every outcome
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl RelayObserver for TracingObserver {
    fn on_event(&self, event: &RelayEvent) {
        match &event.outcome {
            RelayOutcome::Sent { hash } => info!(
                "[wallet {}] {} item {} sent: {:#x}",
                event.wallet, event.item.kind, event.item.id, hash
            ),
            RelayOutcome::Failed { error, requeued } => warn!(
                "[wallet {}] {} item {} failed (requeued: {}): {}",
                event.wallet, event.item.kind, event.item.id, requeued, error
            ),
        }
    }
}

/// Forwards events into a channel; dropped receivers are ignored.
impl RelayObserver for mpsc::UnboundedSender<RelayEvent> {
    fn on_event(&self, event: &RelayEvent) {
        let _ = self.send(event.clone());
    }
}

/// Fans one event out to several observers
#[derive(Default)]
pub struct ObserverSet {
    observers: Vec<Box<dyn RelayObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: impl RelayObserver + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }
}

impl RelayObserver for ObserverSet {
    fn on_event(&self, event: &RelayEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;
    use crate::types::{NewItem, QueueItem, UnixTimeMs};

    fn failed_event() -> RelayEvent {
        RelayEvent {
            wallet: 2,
            item: QueueItem::from_new(7, NewItem::explosion("atom-7"), UnixTimeMs(1)),
            outcome: RelayOutcome::Failed {
                error: LedgerError::Submission("rate limited".into()),
                requeued: false,
            },
        }
    }

    #[test]
    fn test_observer_set_fans_out() {
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let set = ObserverSet::new().with(a_tx).with(b_tx).with(TracingObserver);

        set.on_event(&failed_event());

        let a = a_rx.try_recv().unwrap();
        assert_eq!(a.wallet, 2);
        assert!(!a.is_sent());
        assert_eq!(b_rx.try_recv().unwrap().item.id, 7);
    }

    #[test]
    fn test_closed_channel_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel::<RelayEvent>();
        drop(rx);
        tx.on_event(&failed_event());
    }
}
