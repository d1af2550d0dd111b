use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};
use uuid::Uuid;

use crate::config::DEFAULT_LEASE;
use crate::error::{LedgerError, StoreError};
use crate::ledger::{LedgerCall, LedgerClient};
use crate::observer::RelayObserver;
use crate::policy::RequeuePolicy;
use crate::queue::QueueStore;
use crate::types::{MarkOutcome, QueueItem, RelayEvent, RelayOutcome, TxHash};

/// One claim, simulate, submit, mark cycle for a single wallet.
///
/// Both the single-wallet service and every pool actor drive one of these.
pub struct Relay {
    store: Arc<dyn QueueStore>,
    ledger: Arc<dyn LedgerClient>,
    observer: Arc<dyn RelayObserver>,
    wallet: usize,
    worker_id: String,
    lease: Duration,
    requeue: RequeuePolicy,
}

impl Relay {
    pub fn new(
        store: Arc<dyn QueueStore>,
        ledger: Arc<dyn LedgerClient>,
        observer: Arc<dyn RelayObserver>,
    ) -> Self {
        Self {
            store,
            ledger,
            observer,
            wallet: 0,
            worker_id: format!("relayer-{}-w0", Uuid::new_v4()),
            lease: DEFAULT_LEASE,
            requeue: RequeuePolicy::default(),
        }
    }

    /// Tag events with `index` and lease under a matching worker id.
    pub fn with_wallet(mut self, index: usize, instance: &Uuid) -> Self {
        self.wallet = index;
        self.worker_id = format!("relayer-{instance}-w{index}");
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_requeue(mut self, requeue: RequeuePolicy) -> Self {
        self.requeue = requeue;
        self
    }

    pub fn wallet(&self) -> usize {
        self.wallet
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Time an attempt may take. A fifth of the lease is kept back so the
    /// mark lands before the sweep can release the item.
    pub fn attempt_deadline(&self) -> Duration {
        self.lease.saturating_sub(self.lease / 5)
    }

    /// Relay the oldest pending item, if any.
    ///
    /// Ledger failures never surface as `Err`: they are marked on the item and
    /// reported through the observer. A failed claim returns an error, and so
    /// does an attempt whose lease was lost before it could be marked; that
    /// outcome belongs to the new holder and is not reported.
    pub async fn relay_next(&self) -> Result<Option<RelayEvent>, StoreError> {
        let Some(item) = self.store.claim_next_pending(&self.worker_id, self.lease).await? else {
            return Ok(None);
        };
        debug!("[wallet {}] Claimed {} item {}", self.wallet, item.kind, item.id);

        let deadline = self.attempt_deadline();
        let attempt = match tokio::time::timeout(deadline, self.attempt(&item)).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Timeout {
                operation: "relay attempt".into(),
                seconds: deadline.as_secs(),
            }),
        };
        let outcome = match attempt {
            Ok(hash) => RelayOutcome::Sent { hash },
            Err(error) => {
                let requeued = self.requeue.should_requeue(&item, &error);
                RelayOutcome::Failed { error, requeued }
            }
        };

        let mark = match &outcome {
            RelayOutcome::Sent { hash } => MarkOutcome::Sent(*hash),
            RelayOutcome::Failed { requeued: true, .. } => MarkOutcome::Requeue,
            RelayOutcome::Failed { .. } => MarkOutcome::Failed,
        };
        match self.store.mark_leased(item.id, &self.worker_id, mark).await {
            Ok(true) => {}
            Ok(false) => {
                error!(
                    "[wallet {}] Lease on item {} lapsed mid-attempt, {:?} discarded",
                    self.wallet, item.id, mark
                );
                return Err(StoreError::LeaseLost {
                    id: item.id,
                    worker: self.worker_id.clone(),
                });
            }
            // The lease lapses and the item is picked up again.
            Err(e) => error!("[wallet {}] Failed to mark item {}: {}", self.wallet, item.id, e),
        }

        let event = RelayEvent {
            wallet: self.wallet,
            item,
            outcome,
        };
        self.observer.on_event(&event);
        Ok(Some(event))
    }

    async fn attempt(&self, item: &QueueItem) -> Result<TxHash, LedgerError> {
        let call = LedgerCall::from_item(item)?;
        let request = self.ledger.simulate(&call).await?;
        self.ledger.submit(request).await
    }
}
