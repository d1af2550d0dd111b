//! Multi-wallet relay pool.
//!
//! Every wallet runs as its own actor task: it owns its `WalletState`, ticks
//! on its own staggered interval and answers commands from its mailbox. The
//! pool handle never touches wallet state directly. Observers get a
//! `Vec<WalletState>` snapshot through a watch channel that each actor
//! updates when a processing cycle starts and ends.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RelayerConfig;
use crate::error::RelayerError;
use crate::ledger::LedgerClient;
use crate::observer::RelayObserver;
use crate::policy::{CircuitBreaker, RequeuePolicy, stagger_interval};
use crate::queue::QueueStore;
use crate::relay::Relay;
use crate::service::sweep;
use crate::types::{RelayOutcome, WalletState};

const MAILBOX_CAPACITY: usize = 16;

/// Pool-wide run state, broadcast to every wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolControl {
    Running,
    Paused,
    Stopped,
}

enum WalletCommand {
    Reset(oneshot::Sender<()>),
    Snapshot(oneshot::Sender<WalletState>),
}

struct WalletActor {
    relay: Relay,
    state: WalletState,
    breaker: CircuitBreaker,
    period: Duration,
    commands: mpsc::Receiver<WalletCommand>,
    control: watch::Receiver<PoolControl>,
    status: Arc<watch::Sender<Vec<WalletState>>>,
}

impl WalletActor {
    async fn run(mut self) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!("[wallet {}] Ticking every {:?}", self.state.index, self.period);

        loop {
            tokio::select! {
                biased;
                changed = self.control.changed() => {
                    if changed.is_err() || *self.control.borrow() == PoolControl::Stopped {
                        break;
                    }
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = ticker.tick() => self.tick().await,
            }
        }

        self.state.is_processing = false;
        self.publish();
        debug!("[wallet {}] Stopped", self.state.index);
    }

    fn handle(&mut self, command: WalletCommand) {
        match command {
            WalletCommand::Reset(reply) => {
                if self.breaker.is_open(&self.state) {
                    info!("[wallet {}] Circuit reset", self.state.index);
                }
                self.breaker.reset(&mut self.state);
                self.publish();
                let _ = reply.send(());
            }
            WalletCommand::Snapshot(reply) => {
                let _ = reply.send(self.state.clone());
            }
        }
    }

    async fn tick(&mut self) {
        if *self.control.borrow() != PoolControl::Running {
            return;
        }
        // No overlap check: the actor awaits each cycle before the next tick.
        if self.breaker.is_open(&self.state) {
            return;
        }

        self.state.is_processing = true;
        self.publish();

        let result = self.relay.relay_next().await;
        self.state.is_processing = false;

        match result {
            Ok(Some(event)) => match &event.outcome {
                RelayOutcome::Sent { hash } => {
                    self.breaker.record_success(&mut self.state);
                    self.state.last_hash = Some(*hash);
                }
                RelayOutcome::Failed { .. } => {
                    if self.breaker.record_failure(&mut self.state) {
                        warn!(
                            "[wallet {}] {} consecutive failures, wallet paused until reset",
                            self.state.index, self.state.consecutive_errors
                        );
                    }
                }
            },
            Ok(None) => {}
            // Store trouble is not the wallet's fault and does not count.
            Err(e) => error!("[wallet {}] Error processing queue: {}", self.state.index, e),
        }

        self.publish();
    }

    fn publish(&self) {
        let state = &self.state;
        self.status.send_modify(|all| {
            if let Some(slot) = all.get_mut(state.index) {
                *slot = state.clone();
            }
        });
    }
}

/// Retention sweep for the pool's queue. Keeps running while paused.
async fn run_sweeper(
    store: Arc<dyn QueueStore>,
    period: Duration,
    retention: Duration,
    mut control: watch::Receiver<PoolControl>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            changed = control.changed() => {
                if changed.is_err() || *control.borrow() == PoolControl::Stopped {
                    break;
                }
            }
            _ = ticker.tick() => {
                sweep(store.as_ref(), retention).await;
            }
        }
    }
}

/// Handle to a running set of wallet actors sharing one queue
pub struct RelayPool {
    /// Mailbox of each wallet, by index
    wallets: Vec<mpsc::Sender<WalletCommand>>,
    control: watch::Sender<PoolControl>,
    status: watch::Receiver<Vec<WalletState>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    instance: Uuid,
}

impl RelayPool {
    /// Spawn one actor per ledger client. Wallet `i` ticks every
    /// `poll_interval + i * wallet_skew`.
    pub fn spawn(
        config: &RelayerConfig,
        store: Arc<dyn QueueStore>,
        ledgers: Vec<Arc<dyn LedgerClient>>,
        observer: Arc<dyn RelayObserver>,
    ) -> Result<Self, RelayerError> {
        if ledgers.is_empty() {
            return Err(RelayerError::Configuration("relay pool needs at least one wallet".into()));
        }

        let instance = Uuid::new_v4();
        let initial: Vec<WalletState> = (0..ledgers.len()).map(WalletState::new).collect();
        let (status_tx, status_rx) = watch::channel(initial);
        let status_tx = Arc::new(status_tx);
        let (control_tx, control_rx) = watch::channel(PoolControl::Running);
        let breaker = CircuitBreaker::new(config.error_ceiling);
        let requeue = RequeuePolicy::new(config.max_retry_attempts);

        let mut wallets = Vec::with_capacity(ledgers.len());
        let mut tasks = Vec::with_capacity(ledgers.len());
        for (index, ledger) in ledgers.into_iter().enumerate() {
            let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
            info!("[wallet {}] Relaying as {:?}", index, ledger.signer());
            let relay = Relay::new(store.clone(), ledger, observer.clone())
                .with_wallet(index, &instance)
                .with_lease(config.lease_duration)
                .with_requeue(requeue);

            let actor = WalletActor {
                relay,
                state: WalletState::new(index),
                breaker,
                period: stagger_interval(config.poll_interval, config.wallet_skew, index),
                commands: rx,
                control: control_rx.clone(),
                status: status_tx.clone(),
            };
            wallets.push(tx);
            tasks.push(tokio::spawn(actor.run()));
        }

        if config.enable_auto_pruning {
            tasks.push(tokio::spawn(run_sweeper(
                store,
                config.sweep_interval,
                config.retention,
                control_rx,
            )));
        }

        info!("Relay pool {} started with {} wallets", instance, wallets.len());
        Ok(Self {
            wallets,
            control: control_tx,
            status: status_rx,
            tasks: Mutex::new(tasks),
            instance,
        })
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }

    pub fn control(&self) -> PoolControl {
        *self.control.borrow()
    }

    /// Suspend ticking on every wallet. In-flight cycles finish normally.
    pub fn pause(&self) {
        let paused = self.control.send_if_modified(|control| {
            if *control == PoolControl::Running {
                *control = PoolControl::Paused;
                true
            } else {
                false
            }
        });
        if paused {
            info!("Relay pool paused");
        }
    }

    pub fn resume(&self) {
        let resumed = self.control.send_if_modified(|control| {
            if *control == PoolControl::Paused {
                *control = PoolControl::Running;
                true
            } else {
                false
            }
        });
        if resumed {
            info!("Relay pool resumed");
        }
    }

    /// Cancel all future ticks and wait for the actors to exit. Safe to call
    /// more than once.
    pub async fn stop(&self) {
        self.control.send_replace(PoolControl::Stopped);
        let handles = match self.tasks.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(_) => Vec::new(),
        };
        if handles.is_empty() {
            return;
        }
        info!("Stopping relay pool {}", self.instance);
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Wallet task ended abnormally: {}", e);
            }
        }
    }

    /// Close a wallet's circuit so it is scheduled again.
    pub async fn reset_wallet(&self, index: usize) -> Result<(), RelayerError> {
        let (reply, done) = oneshot::channel();
        self.mailbox(index)?
            .send(WalletCommand::Reset(reply))
            .await
            .map_err(|_| RelayerError::Stopped)?;
        done.await.map_err(|_| RelayerError::Stopped)
    }

    /// Ask a wallet actor for its current state.
    pub async fn wallet_state(&self, index: usize) -> Result<WalletState, RelayerError> {
        let (reply, state) = oneshot::channel();
        self.mailbox(index)?
            .send(WalletCommand::Snapshot(reply))
            .await
            .map_err(|_| RelayerError::Stopped)?;
        state.await.map_err(|_| RelayerError::Stopped)
    }

    /// Latest published snapshot of every wallet.
    pub fn status(&self) -> Vec<WalletState> {
        self.status.borrow().clone()
    }

    /// Receiver notified on every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Vec<WalletState>> {
        self.status.clone()
    }

    fn mailbox(&self, index: usize) -> Result<&mpsc::Sender<WalletCommand>, RelayerError> {
        self.wallets.get(index).ok_or(RelayerError::UnknownWallet(index))
    }
}
