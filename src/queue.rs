use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::types::{ItemStatus, MarkOutcome, NewItem, QueueItem, UnixTimeMs};

/// Persisted work queue shared by every relay worker.
///
/// `claim_next_pending` is the only way the relay takes work: it moves the
/// oldest pending item to `leased` in one step, so two workers polling at
/// the same instant can never both receive it.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a pending item stamped with `enqueued_at`.
    async fn enqueue_at(&self, item: NewItem, enqueued_at: UnixTimeMs) -> Result<u64, StoreError>;

    /// Insert a pending item stamped with the current time.
    async fn enqueue(&self, item: NewItem) -> Result<u64, StoreError> {
        self.enqueue_at(item, UnixTimeMs::now()).await
    }

    /// Oldest pending item, without claiming it.
    async fn dequeue_next_pending(&self) -> Result<Option<QueueItem>, StoreError>;

    /// Atomically lease the oldest pending item to `worker` until `now + lease`.
    async fn claim_next_pending(
        &self,
        worker: &str,
        lease: Duration,
    ) -> Result<Option<QueueItem>, StoreError>;

    /// Record the end of an attempt and bump `attempts`.
    ///
    /// Returns `Ok(false)` and changes nothing if the item is already terminal.
    async fn mark(&self, id: u64, outcome: MarkOutcome) -> Result<bool, StoreError>;

    /// Record the end of `worker`'s attempt on a leased item.
    ///
    /// Applies only while the item is still leased to `worker`. Returns
    /// `Ok(false)` and changes nothing once the lease has been released,
    /// reclaimed or the item finished by another worker.
    async fn mark_leased(&self, id: u64, worker: &str, outcome: MarkOutcome) -> Result<bool, StoreError>;

    /// Mark a set of items. Returns how many actually transitioned.
    async fn mark_batch(&self, updates: &[(u64, MarkOutcome)]) -> Result<usize, StoreError> {
        let mut changed = 0;
        for (id, outcome) in updates {
            if self.mark(*id, *outcome).await? {
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn get(&self, id: u64) -> Result<Option<QueueItem>, StoreError>;

    async fn count(&self, status: ItemStatus) -> Result<u64, StoreError>;

    async fn count_pending(&self) -> Result<u64, StoreError> {
        self.count(ItemStatus::Pending).await
    }

    /// Return items whose lease lapsed to `pending`.
    async fn release_expired_leases(&self, now: UnixTimeMs) -> Result<u64, StoreError>;

    /// Delete terminal items queued before `older_than`. Pending and leased
    /// items are never touched.
    async fn purge(&self, older_than: UnixTimeMs) -> Result<u64, StoreError>;
}

/// Apply `outcome` to an in-memory item, enforcing the status lifecycle.
/// With a `holder`, only that worker's live lease may be marked.
pub(crate) fn apply_outcome(item: &mut QueueItem, outcome: MarkOutcome, holder: Option<&str>) -> bool {
    if item.status.is_terminal() {
        return false;
    }
    if let Some(worker) = holder {
        if item.status != ItemStatus::Leased || item.leased_by.as_deref() != Some(worker) {
            return false;
        }
    }
    item.status = outcome.status();
    item.hash = outcome.hash();
    item.attempts += 1;
    item.leased_by = None;
    item.lease_expires_at = None;
    true
}

/// In-process queue store
pub struct MemoryQueue {
    /// All items by id; ids grow monotonically
    items: RwLock<BTreeMap<u64, QueueItem>>,
    next_id: AtomicU64,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            items: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Snapshot of every stored item, ordered by id
    pub async fn items(&self) -> Vec<QueueItem> {
        self.items.read().await.values().cloned().collect()
    }

    fn oldest_pending(items: &BTreeMap<u64, QueueItem>) -> Option<u64> {
        items
            .values()
            .filter(|item| item.status == ItemStatus::Pending)
            .min_by_key(|item| item.fifo_key())
            .map(|item| item.id)
    }
}

#[async_trait]
impl QueueStore for MemoryQueue {
    async fn enqueue_at(&self, item: NewItem, enqueued_at: UnixTimeMs) -> Result<u64, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut items = self.items.write().await;
        items.insert(id, QueueItem::from_new(id, item, enqueued_at));
        Ok(id)
    }

    async fn dequeue_next_pending(&self) -> Result<Option<QueueItem>, StoreError> {
        let items = self.items.read().await;
        Ok(Self::oldest_pending(&items).and_then(|id| items.get(&id).cloned()))
    }

    async fn claim_next_pending(
        &self,
        worker: &str,
        lease: Duration,
    ) -> Result<Option<QueueItem>, StoreError> {
        // Selection and status flip happen under one write guard.
        let mut items = self.items.write().await;
        let Some(id) = Self::oldest_pending(&items) else {
            return Ok(None);
        };
        let Some(item) = items.get_mut(&id) else {
            return Ok(None);
        };
        item.status = ItemStatus::Leased;
        item.leased_by = Some(worker.to_string());
        item.lease_expires_at = Some(UnixTimeMs::now().saturating_add(lease));
        Ok(Some(item.clone()))
    }

    async fn mark(&self, id: u64, outcome: MarkOutcome) -> Result<bool, StoreError> {
        let mut items = self.items.write().await;
        let item = items.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        Ok(apply_outcome(item, outcome, None))
    }

    async fn mark_leased(&self, id: u64, worker: &str, outcome: MarkOutcome) -> Result<bool, StoreError> {
        let mut items = self.items.write().await;
        let item = items.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        Ok(apply_outcome(item, outcome, Some(worker)))
    }

    async fn mark_batch(&self, updates: &[(u64, MarkOutcome)]) -> Result<usize, StoreError> {
        let mut items = self.items.write().await;
        if let Some((missing, _)) = updates.iter().find(|(id, _)| !items.contains_key(id)) {
            return Err(StoreError::NotFound(*missing));
        }
        let mut changed = 0;
        for (id, outcome) in updates {
            if let Some(item) = items.get_mut(id) {
                if apply_outcome(item, *outcome, None) {
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn get(&self, id: u64) -> Result<Option<QueueItem>, StoreError> {
        Ok(self.items.read().await.get(&id).cloned())
    }

    async fn count(&self, status: ItemStatus) -> Result<u64, StoreError> {
        let items = self.items.read().await;
        Ok(items.values().filter(|item| item.status == status).count() as u64)
    }

    async fn release_expired_leases(&self, now: UnixTimeMs) -> Result<u64, StoreError> {
        let mut items = self.items.write().await;
        let mut released = 0;
        for item in items.values_mut() {
            let expired = item.status == ItemStatus::Leased
                && item.lease_expires_at.is_some_and(|until| until <= now);
            if expired {
                item.status = ItemStatus::Pending;
                item.leased_by = None;
                item.lease_expires_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn purge(&self, older_than: UnixTimeMs) -> Result<u64, StoreError> {
        let mut items = self.items.write().await;
        let before = items.len();
        items.retain(|_, item| !(item.status.is_terminal() && item.enqueued_at < older_than));
        Ok((before - items.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::H256;
    use std::collections::HashSet;
    use std::sync::Arc;

    const LEASE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_dequeue_is_fifo_and_side_effect_free() {
        let queue = MemoryQueue::new();
        let late = queue.enqueue_at(NewItem::reaction(1, 1, 1), UnixTimeMs(2_000)).await.unwrap();
        let early = queue.enqueue_at(NewItem::reaction(2, 2, 2), UnixTimeMs(1_000)).await.unwrap();

        let peeked = queue.dequeue_next_pending().await.unwrap().unwrap();
        assert_eq!(peeked.id, early);
        assert_eq!(queue.count_pending().await.unwrap(), 2);

        let first = queue.claim_next_pending("w0", LEASE).await.unwrap().unwrap();
        let second = queue.claim_next_pending("w0", LEASE).await.unwrap().unwrap();
        assert_eq!((first.id, second.id), (early, late));
        assert_eq!(first.status, ItemStatus::Leased);
        assert_eq!(first.leased_by.as_deref(), Some("w0"));
        assert!(queue.claim_next_pending("w0", LEASE).await.unwrap().is_none());
        assert!(queue.dequeue_next_pending().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_claims_hand_out_each_item_once() {
        let queue = Arc::new(MemoryQueue::new());
        for i in 0..50 {
            queue.enqueue(NewItem::reaction(i, i, 1)).await.unwrap();
        }

        let mut handles = Vec::new();
        for worker in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let name = format!("w{worker}");
                let mut claimed = Vec::new();
                while let Some(item) = queue.claim_next_pending(&name, LEASE).await.unwrap() {
                    claimed.push(item.id);
                    tokio::task::yield_now().await;
                }
                claimed
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "item {id} claimed twice");
            }
        }
        assert_eq!(seen.len(), 50);
    }

    #[tokio::test]
    async fn test_terminal_status_is_final() {
        let queue = MemoryQueue::new();
        let id = queue.enqueue(NewItem::explosion("atom-1")).await.unwrap();
        queue.claim_next_pending("w0", LEASE).await.unwrap();

        let hash = H256::repeat_byte(0xab);
        assert!(queue.mark(id, MarkOutcome::Sent(hash)).await.unwrap());
        assert!(!queue.mark(id, MarkOutcome::Failed).await.unwrap());
        assert!(!queue.mark(id, MarkOutcome::Requeue).await.unwrap());

        let item = queue.get(id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Sent);
        assert_eq!(item.hash, Some(hash));
        assert_eq!(item.attempts, 1);
        assert!(item.leased_by.is_none());

        assert_eq!(queue.mark(999, MarkOutcome::Failed).await, Err(StoreError::NotFound(999)));
    }

    #[tokio::test]
    async fn test_requeue_returns_item_to_pending() {
        let queue = MemoryQueue::new();
        let id = queue.enqueue(NewItem::reaction(3, 4, 5)).await.unwrap();
        queue.claim_next_pending("w0", LEASE).await.unwrap();
        assert!(queue.mark(id, MarkOutcome::Requeue).await.unwrap());

        let item = queue.get(id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.attempts, 1);
        assert!(item.hash.is_none());
        assert_eq!(queue.claim_next_pending("w1", LEASE).await.unwrap().map(|i| i.id), Some(id));
    }

    #[tokio::test]
    async fn test_mark_batch_rejects_unknown_ids_atomically() {
        let queue = MemoryQueue::new();
        let a = queue.enqueue(NewItem::reaction(1, 1, 1)).await.unwrap();
        let b = queue.enqueue(NewItem::reaction(2, 2, 2)).await.unwrap();

        let result = queue.mark_batch(&[(a, MarkOutcome::Failed), (42, MarkOutcome::Failed)]).await;
        assert_eq!(result, Err(StoreError::NotFound(42)));
        assert_eq!(queue.count_pending().await.unwrap(), 2);

        let hash = H256::repeat_byte(1);
        let changed = queue
            .mark_batch(&[(a, MarkOutcome::Sent(hash)), (b, MarkOutcome::Failed)])
            .await
            .unwrap();
        assert_eq!(changed, 2);
        assert_eq!(queue.count(ItemStatus::Sent).await.unwrap(), 1);
        assert_eq!(queue.count(ItemStatus::Failed).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_leases_are_released() {
        let queue = MemoryQueue::new();
        let id = queue.enqueue(NewItem::reaction(1, 2, 3)).await.unwrap();
        queue.claim_next_pending("w0", Duration::ZERO).await.unwrap();
        assert_eq!(queue.count(ItemStatus::Leased).await.unwrap(), 1);

        let released = queue
            .release_expired_leases(UnixTimeMs::now().saturating_add(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(released, 1);
        let item = queue.get(id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert!(item.lease_expires_at.is_none());
    }

    #[tokio::test]
    async fn test_mark_leased_only_accepts_current_holder() {
        let queue = MemoryQueue::new();
        let id = queue.enqueue(NewItem::reaction(1, 2, 3)).await.unwrap();
        let hash = H256::repeat_byte(5);

        // Not leased yet.
        assert!(!queue.mark_leased(id, "w0", MarkOutcome::Sent(hash)).await.unwrap());

        queue.claim_next_pending("w0", Duration::ZERO).await.unwrap();
        queue
            .release_expired_leases(UnixTimeMs::now().saturating_add(Duration::from_secs(1)))
            .await
            .unwrap();
        queue.claim_next_pending("w1", LEASE).await.unwrap();

        // w0's lease lapsed and w1 holds the item now.
        assert!(!queue.mark_leased(id, "w0", MarkOutcome::Sent(hash)).await.unwrap());
        let item = queue.get(id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Leased);
        assert_eq!(item.leased_by.as_deref(), Some("w1"));
        assert_eq!(item.attempts, 0);

        let other = H256::repeat_byte(6);
        assert!(queue.mark_leased(id, "w1", MarkOutcome::Sent(other)).await.unwrap());
        assert!(!queue.mark_leased(id, "w1", MarkOutcome::Failed).await.unwrap());
        let item = queue.get(id).await.unwrap().unwrap();
        assert_eq!((item.status, item.hash, item.attempts), (ItemStatus::Sent, Some(other), 1));

        assert_eq!(
            queue.mark_leased(99, "w1", MarkOutcome::Failed).await,
            Err(StoreError::NotFound(99))
        );
    }

    #[tokio::test]
    async fn test_purge_keeps_pending_and_recent_items() {
        let queue = MemoryQueue::new();
        let now = UnixTimeMs(10_000_000);
        let two_hours_ago = now.saturating_sub(Duration::from_secs(7200));
        let old_sent = queue.enqueue_at(NewItem::reaction(1, 1, 1), two_hours_ago).await.unwrap();
        let old_pending = queue.enqueue_at(NewItem::reaction(2, 2, 2), two_hours_ago).await.unwrap();
        queue.mark(old_sent, MarkOutcome::Sent(H256::repeat_byte(2))).await.unwrap();
        let fresh_failed = queue.enqueue_at(NewItem::reaction(3, 3, 3), now).await.unwrap();
        queue.mark(fresh_failed, MarkOutcome::Failed).await.unwrap();

        let purged = queue.purge(now.saturating_sub(Duration::from_secs(3600))).await.unwrap();
        assert_eq!(purged, 1);
        assert!(queue.get(old_sent).await.unwrap().is_none());
        assert!(queue.get(old_pending).await.unwrap().is_some());
        assert!(queue.get(fresh_failed).await.unwrap().is_some());
    }
}
