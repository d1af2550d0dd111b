use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::config::RelayerConfig;
use crate::error::{RelayerError, StoreError};
use crate::ledger::LedgerClient;
use crate::observer::RelayObserver;
use crate::policy::RequeuePolicy;
use crate::queue::QueueStore;
use crate::relay::Relay;
use crate::types::{JobSummary, RelayEvent, UnixTimeMs};

/// Single-wallet relayer: drains the queue serially, one item per tick
pub struct RelayerService {
    /// Claim/submit/mark cycle for the one wallet
    relay: Arc<Relay>,

    /// Shared work queue
    store: Arc<dyn QueueStore>,

    /// Configuration
    config: RelayerConfig,

    /// Whether the service is running
    running: Arc<RwLock<bool>>,

    /// Set to `true` on stop; the value outlives the wake-up
    shutdown: watch::Sender<bool>,

    /// Background loops spawned by `start`
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayerService {
    /// Create a new relayer service
    pub fn new(
        config: RelayerConfig,
        store: Arc<dyn QueueStore>,
        ledger: Arc<dyn LedgerClient>,
        observer: Arc<dyn RelayObserver>,
    ) -> Self {
        let relay = Relay::new(store.clone(), ledger, observer)
            .with_lease(config.lease_duration)
            .with_requeue(RequeuePolicy::new(config.max_retry_attempts));
        Self {
            relay: Arc::new(relay),
            store,
            config,
            running: Arc::new(RwLock::new(false)),
            shutdown: watch::channel(false).0,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start the relay loop and, if enabled, the retention sweep
    pub async fn start(&self) -> Result<(), RelayerError> {
        info!("Starting relayer service ({})", self.relay.worker_id());

        let mut running = self.running.write().await;
        if *running {
            return Err(RelayerError::Configuration("Service already running".into()));
        }
        *running = true;
        drop(running);
        self.shutdown.send_replace(false);

        let mut tasks = Vec::new();

        // Spawn relay loop
        let relay = self.relay.clone();
        let mut shutdown = self.shutdown.subscribe();
        let poll_interval = self.config.poll_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            // A slow submission delays the loop instead of stacking ticks.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            while !*shutdown.borrow_and_update() {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                Self::tick(&relay).await;
            }
            debug!("Relay loop exited");
        }));

        // Spawn retention sweep
        if self.config.enable_auto_pruning {
            let store = self.store.clone();
            let mut shutdown = self.shutdown.subscribe();
            let sweep_interval = self.config.sweep_interval;
            let retention = self.config.retention;
            tasks.push(tokio::spawn(async move {
                let mut ticker = interval(sweep_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                while !*shutdown.borrow_and_update() {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                            continue;
                        }
                    }
                    sweep(store.as_ref(), retention).await;
                }
            }));
        }

        if let Ok(mut handles) = self.tasks.lock() {
            handles.extend(tasks);
        }
        Ok(())
    }

    /// Stop the relayer service. An in-flight item is finished and marked.
    pub async fn stop(&self) {
        info!("Stopping relayer service");
        let mut running = self.running.write().await;
        *running = false;
        drop(running);
        self.shutdown.send_replace(true);

        let handles = match self.tasks.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Relayer task ended abnormally: {}", e);
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// One relay tick. Store failures are logged and swallowed.
    pub async fn tick(relay: &Relay) -> Option<RelayEvent> {
        match relay.relay_next().await {
            Ok(event) => event,
            Err(e) => {
                error!("Error processing queue: {}", e);
                None
            }
        }
    }

    /// Periodic job entry point: drain up to `batch_ceiling` items, then sweep.
    pub async fn run_scheduled_job(&self) -> JobSummary {
        let mut processed_count = 0;
        while processed_count < self.config.batch_ceiling {
            match self.relay.relay_next().await {
                Ok(Some(_)) => processed_count += 1,
                Ok(None) => break,
                Err(e @ StoreError::LeaseLost { .. }) => {
                    warn!("Scheduled job skipped an item: {}", e);
                    processed_count += 1;
                }
                Err(e) => {
                    error!("Scheduled job stopped draining: {}", e);
                    break;
                }
            }
        }

        let purged_count = sweep(self.store.as_ref(), self.config.retention).await;
        let summary = JobSummary {
            processed_count,
            purged_count,
            timestamp: UnixTimeMs::now(),
        };
        info!(
            "Scheduled job processed {} items, purged {}",
            summary.processed_count, summary.purged_count
        );
        summary
    }
}

/// Return lapsed leases to the queue and delete terminal items older than
/// `retention`. Returns the number of deleted rows.
pub async fn sweep(store: &dyn QueueStore, retention: Duration) -> u64 {
    let now = UnixTimeMs::now();
    match store.release_expired_leases(now).await {
        Ok(0) => {}
        Ok(released) => info!("Released {} expired leases", released),
        Err(e) => error!("Error releasing expired leases: {}", e),
    }
    match store.purge(now.saturating_sub(retention)).await {
        Ok(purged) => {
            if purged > 0 {
                debug!("Purged {} old queue items", purged);
            }
            purged
        }
        Err(e) => {
            error!("Error purging old queue items: {}", e);
            0
        }
    }
}
