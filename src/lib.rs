pub mod config;
pub mod error;
pub mod ledger;
pub mod observer;
pub mod policy;
pub mod pool;
pub mod queue;
pub mod relay;
pub mod service;
pub mod sqlite;
pub mod types;

pub use config::{RelayerConfig, SecretKey};
pub use error::*;
pub use ledger::{EvmLedger, LedgerCall, LedgerClient, LedgerStats, PreparedRequest, RecorderContract};
pub use observer::{ObserverSet, RelayObserver, TracingObserver};
pub use pool::{PoolControl, RelayPool};
pub use queue::{MemoryQueue, QueueStore};
pub use relay::Relay;
pub use service::RelayerService;
pub use sqlite::SqliteQueue;
pub use types::*;
