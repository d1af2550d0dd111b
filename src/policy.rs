//! Retry and backoff rules shared by the single-wallet loop and the pool.

use std::time::Duration;

use crate::error::LedgerError;
use crate::types::{QueueItem, WalletState};

/// Whether a failed item goes back to `pending`.
///
/// With `max_attempts == 1` (the default) every failure is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequeuePolicy {
    pub max_attempts: u32,
}

impl Default for RequeuePolicy {
    fn default() -> Self {
        Self { max_attempts: 1 }
    }
}

impl RequeuePolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// `item.attempts` counts attempts completed before the current one.
    pub fn should_requeue(&self, item: &QueueItem, error: &LedgerError) -> bool {
        error.is_retryable() && item.attempts + 1 < self.max_attempts
    }
}

/// Stops scheduling a wallet after `ceiling` consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreaker {
    pub ceiling: u32,
}

impl CircuitBreaker {
    pub fn new(ceiling: u32) -> Self {
        Self {
            ceiling: ceiling.max(1),
        }
    }

    pub fn is_open(&self, state: &WalletState) -> bool {
        state.consecutive_errors >= self.ceiling
    }

    pub fn record_success(&self, state: &mut WalletState) {
        state.total_processed += 1;
        state.consecutive_errors = 0;
    }

    /// Returns true when this failure opened the circuit.
    pub fn record_failure(&self, state: &mut WalletState) -> bool {
        state.total_failed += 1;
        state.consecutive_errors = state.consecutive_errors.saturating_add(1);
        state.consecutive_errors == self.ceiling
    }

    pub fn reset(&self, state: &mut WalletState) {
        state.consecutive_errors = 0;
    }
}

/// Tick period of wallet `index`: `base + index * skew`.
pub fn stagger_interval(base: Duration, skew: Duration, index: usize) -> Duration {
    base + skew * u32::try_from(index).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NewItem, UnixTimeMs};

    #[test]
    fn test_requeue_only_retryable_and_below_ceiling() {
        let policy = RequeuePolicy::new(3);
        let mut item = QueueItem::from_new(1, NewItem::reaction(1, 1, 1), UnixTimeMs(0));
        let submission = LedgerError::Submission("nonce too low".into());
        let revert = LedgerError::Simulation("execution reverted".into());

        assert!(policy.should_requeue(&item, &submission));
        assert!(!policy.should_requeue(&item, &revert));
        item.attempts = 2;
        assert!(!policy.should_requeue(&item, &submission));

        assert!(!RequeuePolicy::default().should_requeue(&QueueItem { attempts: 0, ..item }, &submission));
    }

    #[test]
    fn test_circuit_opens_at_ceiling_and_resets() {
        let breaker = CircuitBreaker::new(3);
        let mut state = WalletState::new(1);

        assert!(!breaker.record_failure(&mut state));
        breaker.record_success(&mut state);
        assert_eq!(state.consecutive_errors, 0);

        assert!(!breaker.record_failure(&mut state));
        assert!(!breaker.record_failure(&mut state));
        assert!(breaker.record_failure(&mut state));
        assert!(breaker.is_open(&state));
        assert_eq!(state.total_failed, 4);
        assert_eq!(state.total_processed, 1);

        breaker.reset(&mut state);
        assert!(!breaker.is_open(&state));
    }

    #[test]
    fn test_stagger() {
        let base = Duration::from_millis(1000);
        let skew = Duration::from_millis(250);
        assert_eq!(stagger_interval(base, skew, 0), base);
        assert_eq!(stagger_interval(base, skew, 2), Duration::from_millis(1500));
    }
}
