#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, H256, TransactionRequest};
use reaction_relayer::{
    LedgerCall, LedgerClient, LedgerError, LedgerStats, PreparedRequest, RelayEvent, RelayObserver,
    RelayerConfig, TxHash,
};
use tokio::sync::mpsc;

/// Every successful submission across all mock wallets, in order.
pub type SubmissionLog = Arc<Mutex<Vec<(usize, LedgerCall)>>>;

/// Scripted ledger for one wallet
pub struct MockLedger {
    wallet: usize,
    log: SubmissionLog,
    fixed_hash: Option<TxHash>,
    fail_simulate: AtomicBool,
    fail_submit: AtomicBool,
    submit_delay: Duration,
    next_hash: AtomicU64,
    pub simulate_calls: AtomicUsize,
    pub submit_calls: AtomicUsize,
}

impl MockLedger {
    pub fn new(wallet: usize, log: SubmissionLog) -> Self {
        Self {
            wallet,
            log,
            fixed_hash: None,
            fail_simulate: AtomicBool::new(false),
            fail_submit: AtomicBool::new(false),
            submit_delay: Duration::ZERO,
            next_hash: AtomicU64::new(1),
            simulate_calls: AtomicUsize::new(0),
            submit_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_hash(mut self, hash: TxHash) -> Self {
        self.fixed_hash = Some(hash);
        self
    }

    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    pub fn failing_submit(self) -> Self {
        self.fail_submit.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_simulate(self) -> Self {
        self.fail_simulate.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_fail_submit(&self, fail: bool) {
        self.fail_submit.store(fail, Ordering::SeqCst);
    }

    pub fn submits(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    fn signer(&self) -> Address {
        Address::from_low_u64_be(self.wallet as u64 + 1)
    }

    async fn simulate(&self, call: &LedgerCall) -> Result<PreparedRequest, LedgerError> {
        self.simulate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_simulate.load(Ordering::SeqCst) {
            return Err(LedgerError::Simulation("execution reverted".into()));
        }
        let tx: TypedTransaction = TransactionRequest::new().from(self.signer()).into();
        Ok(PreparedRequest {
            call: call.clone(),
            tx,
        })
    }

    async fn submit(&self, request: PreparedRequest) -> Result<TxHash, LedgerError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        if !self.submit_delay.is_zero() {
            tokio::time::sleep(self.submit_delay).await;
        }
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(LedgerError::Submission("nonce too low".into()));
        }
        self.log.lock().unwrap().push((self.wallet, request.call));
        Ok(self.fixed_hash.unwrap_or_else(|| {
            let n = self.next_hash.fetch_add(1, Ordering::SeqCst);
            H256::from_low_u64_be(((self.wallet as u64) << 32) | n)
        }))
    }

    async fn stats(&self) -> Result<LedgerStats, LedgerError> {
        Ok(LedgerStats::default())
    }
}

pub fn new_log() -> SubmissionLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Observer that forwards events into a channel the test can drain.
pub fn channel_observer() -> (Arc<dyn RelayObserver>, mpsc::UnboundedReceiver<RelayEvent>) {
    let (tx, rx) = mpsc::unbounded_channel::<RelayEvent>();
    let observer: Arc<dyn RelayObserver> = Arc::new(tx);
    (observer, rx)
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<RelayEvent>) -> Vec<RelayEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn test_config() -> RelayerConfig {
    RelayerConfig {
        poll_interval: Duration::from_secs(1),
        wallet_skew: Duration::from_millis(100),
        error_ceiling: 5,
        enable_auto_pruning: false,
        ..RelayerConfig::default()
    }
}

/// The `x` coordinate of a logged reaction, used as the item's tag.
pub fn reaction_x(call: &LedgerCall) -> Option<u32> {
    match call {
        LedgerCall::RecordReaction { x, .. } => Some(*x),
        LedgerCall::RecordExplosion { .. } => None,
    }
}
