use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ethers::types::H256;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// Ledger transaction identifier.
pub type TxHash = H256;

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    pub fn saturating_sub(self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration.as_millis() as u64))
    }

    pub fn saturating_add(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_millis() as u64))
    }
}

/// Kind of domain event carried by a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Two particles reacted at a position with some energy
    Reaction,
    /// An entity exploded
    Explosion,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Reaction => "reaction",
            EventKind::Explosion => "explosion",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reaction" => Ok(EventKind::Reaction),
            "explosion" => Ok(EventKind::Explosion),
            other => Err(format!("unknown event kind `{other}`")),
        }
    }
}

/// Status of a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// Waiting to be claimed by a relay worker
    Pending,
    /// Claimed by exactly one worker, attempt in flight
    Leased,
    /// Accepted by the ledger
    Sent,
    /// Attempt failed, no further relay activity
    Failed,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Leased => "leased",
            ItemStatus::Sent => "sent",
            ItemStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Sent | ItemStatus::Failed)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "leased" => Ok(ItemStatus::Leased),
            "sent" => Ok(ItemStatus::Sent),
            "failed" => Ok(ItemStatus::Failed),
            other => Err(format!("unknown item status `{other}`")),
        }
    }
}

/// Positional/intensity tuple marshalled into the ledger call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub x: u32,
    pub y: u32,
    pub energy: u32,
}

/// An item as handed to the store by a producer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewItem {
    pub kind: EventKind,
    pub entity_id: Option<String>,
    pub payload: Payload,
}

impl NewItem {
    pub fn reaction(x: u32, y: u32, energy: u32) -> Self {
        Self {
            kind: EventKind::Reaction,
            entity_id: None,
            payload: Payload { x, y, energy },
        }
    }

    pub fn explosion(entity_id: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Explosion,
            entity_id: Some(entity_id.into()),
            payload: Payload::default(),
        }
    }

    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }
}

/// A unit of work in the relay queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Store-assigned identifier
    pub id: u64,
    /// Domain object the write concerns
    pub entity_id: Option<String>,
    pub payload: Payload,
    pub kind: EventKind,
    pub status: ItemStatus,
    /// Ledger transaction hash, only set once sent
    pub hash: Option<TxHash>,
    /// When the item was queued, drives FIFO order and retention
    pub enqueued_at: UnixTimeMs,
    /// Number of completed relay attempts
    pub attempts: u32,
    /// Worker currently holding the lease
    pub leased_by: Option<String>,
    /// When the current lease lapses
    pub lease_expires_at: Option<UnixTimeMs>,
}

impl QueueItem {
    pub fn from_new(id: u64, item: NewItem, enqueued_at: UnixTimeMs) -> Self {
        Self {
            id,
            entity_id: item.entity_id,
            payload: item.payload,
            kind: item.kind,
            status: ItemStatus::Pending,
            hash: None,
            enqueued_at,
            attempts: 0,
            leased_by: None,
            lease_expires_at: None,
        }
    }

    /// FIFO key: oldest first, ties broken by insertion order.
    pub fn fifo_key(&self) -> (UnixTimeMs, u64) {
        (self.enqueued_at, self.id)
    }
}

/// Final state recorded for an attempt. A hash only exists on `Sent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Sent(TxHash),
    Failed,
    /// Hand the item back to `pending` for another attempt
    Requeue,
}

impl MarkOutcome {
    pub fn status(&self) -> ItemStatus {
        match self {
            MarkOutcome::Sent(_) => ItemStatus::Sent,
            MarkOutcome::Failed => ItemStatus::Failed,
            MarkOutcome::Requeue => ItemStatus::Pending,
        }
    }

    pub fn hash(&self) -> Option<TxHash> {
        match self {
            MarkOutcome::Sent(hash) => Some(*hash),
            _ => None,
        }
    }
}

/// Result of relaying one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Sent { hash: TxHash },
    Failed { error: LedgerError, requeued: bool },
}

/// Notification emitted after every completed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEvent {
    /// Index of the wallet that made the attempt
    pub wallet: usize,
    /// The item as it was claimed
    pub item: QueueItem,
    pub outcome: RelayOutcome,
}

impl RelayEvent {
    pub fn is_sent(&self) -> bool {
        matches!(self.outcome, RelayOutcome::Sent { .. })
    }
}

/// Runtime state of one signing wallet in the pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WalletState {
    /// Position in the configured wallet list
    pub index: usize,
    /// A claim/submit cycle is in flight
    pub is_processing: bool,
    /// Successful submissions
    pub total_processed: u64,
    /// Failed attempts over the wallet's lifetime
    pub total_failed: u64,
    /// Failures since the last success or reset
    pub consecutive_errors: u32,
    /// Hash of the most recent successful submission
    pub last_hash: Option<TxHash>,
}

impl WalletState {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            ..Self::default()
        }
    }
}

/// Summary returned by one scheduled job run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    /// Items attempted in this run (sent or failed)
    pub processed_count: usize,
    /// Rows deleted by the retention sweep
    pub purged_count: u64,
    pub timestamp: UnixTimeMs,
}
