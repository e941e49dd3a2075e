//! Confirmation Tracker (C3): advances Observed Transaction rows through
//! PENDING → FAST_CONFIRMED → STANDARD_CONFIRMED (or REORGED/FAILED via
//! [`crate::verifier`]), firing a vote handler exactly once per transition.
//!
//! Grounded in `state/postgres.rs`'s ON-CONFLICT-idempotent insert pattern
//! and `includer.rs`'s single-owner-loop assumption: the tracker holds no
//! cache across ticks, trusting a single watcher task per chain to avoid
//! split-brain (§5 of the Shared state notes).

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::store::{NewObservedTransaction, Store, StoreError, TransactionStatus};
use crate::verifier::RowFilter;

/// Default FAST / STANDARD confirmation thresholds when not overridden.
pub const DEFAULT_FAST_THRESHOLD: u64 = 5;
pub const DEFAULT_STANDARD_THRESHOLD: u64 = 12;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no tracked row for chain {chain_id} tx {tx_hash}")]
    NotFound { chain_id: String, tx_hash: String },
}

/// `required(mode)` lookup mode; unrecognized strings behave like
/// `"STANDARD"` per scenario 3 of the spec's testable properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationMode {
    Fast,
    Standard,
}

impl ConfirmationMode {
    /// Parses a mode string the way the spec's `required(mode)` scenarios
    /// expect: only an exact, case-sensitive `"FAST"` selects FAST;
    /// everything else (`"STANDARD"`, `"UNKNOWN"`, `""`) selects STANDARD.
    #[must_use]
    pub fn parse(mode: &str) -> Self {
        if mode == "FAST" {
            ConfirmationMode::Fast
        } else {
            ConfirmationMode::Standard
        }
    }
}

/// Notified exactly once per PENDING→FAST_CONFIRMED or
/// FAST_CONFIRMED→STANDARD_CONFIRMED transition. Implemented by an external
/// collaborator (vote submission is out of core scope per §1).
#[async_trait]
pub trait VoteHandler: Send + Sync {
    async fn on_confirmed(&self, chain_id: &str, tx_hash: &str, fast: bool);
}

/// A `VoteHandler` that only logs; useful where no vote submission
/// collaborator is wired in (tests, standalone tooling).
pub struct LoggingVoteHandler;

#[async_trait]
impl VoteHandler for LoggingVoteHandler {
    async fn on_confirmed(&self, chain_id: &str, tx_hash: &str, fast: bool) {
        info!(chain_id, tx_hash, fast, "transaction confirmed");
    }
}

pub struct Tracker {
    store: Arc<dyn Store>,
    vote_handler: Arc<dyn VoteHandler>,
    fast_threshold: u64,
    standard_threshold: u64,
}

impl Tracker {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, vote_handler: Arc<dyn VoteHandler>) -> Self {
        Self::with_thresholds(
            store,
            vote_handler,
            DEFAULT_FAST_THRESHOLD,
            DEFAULT_STANDARD_THRESHOLD,
        )
    }

    #[must_use]
    pub fn with_thresholds(
        store: Arc<dyn Store>,
        vote_handler: Arc<dyn VoteHandler>,
        fast_threshold: u64,
        standard_threshold: u64,
    ) -> Self {
        // A zero threshold is treated as "not configured" and falls back to
        // the default, per scenario 3 ("with fast=0, required(FAST) = 5").
        Self {
            store,
            vote_handler,
            fast_threshold: if fast_threshold == 0 {
                DEFAULT_FAST_THRESHOLD
            } else {
                fast_threshold
            },
            standard_threshold: if standard_threshold == 0 {
                DEFAULT_STANDARD_THRESHOLD
            } else {
                standard_threshold
            },
        }
    }

    #[must_use]
    pub fn required(&self, mode: ConfirmationMode) -> u64 {
        match mode {
            ConfirmationMode::Fast => self.fast_threshold,
            ConfirmationMode::Standard => self.standard_threshold,
        }
    }

    /// Idempotent insert; a conflicting row (same chain_id + tx_hash) is a
    /// no-op, and the earlier row wins.
    pub async fn track_transaction(&self, tx: NewObservedTransaction) -> Result<(), TrackerError> {
        let inserted = self.store.track_transaction(tx).await?;
        if !inserted {
            tracing::debug!("transaction already tracked, ignoring duplicate observation");
        }
        Ok(())
    }

    /// Advances confirmations for every non-terminal row on `chain_id`
    /// matching `filter`, applying state transitions and firing the vote
    /// handler exactly once per transition. Rows past `expiry_block_height`
    /// are dropped instead.
    pub async fn update_confirmations(
        &self,
        chain_id: &str,
        latest_slot: u64,
        filter: RowFilter<'_>,
    ) -> Result<(), TrackerError> {
        let rows = self
            .store
            .non_terminal_rows(chain_id, filter.confirmation_type)
            .await?;

        for row in rows {
            if !filter.admits(&row.event_id) {
                continue;
            }
            if row.expiry_block_height > 0 && latest_slot > row.expiry_block_height {
                self.store.delete_row(chain_id, &row.tx_hash).await?;
                continue;
            }

            let confirmations = latest_slot.saturating_sub(row.block_number);
            let previous_status = row.status;
            let new_status = match previous_status {
                TransactionStatus::Pending if confirmations >= self.fast_threshold => {
                    TransactionStatus::FastConfirmed
                }
                TransactionStatus::FastConfirmed if confirmations >= self.standard_threshold => {
                    TransactionStatus::StandardConfirmed
                }
                other => other,
            };

            self.store
                .set_confirmations(chain_id, &row.tx_hash, confirmations, new_status)
                .await?;

            if new_status != previous_status {
                match new_status {
                    TransactionStatus::FastConfirmed => {
                        self.vote_handler
                            .on_confirmed(chain_id, &row.tx_hash, true)
                            .await;
                    }
                    TransactionStatus::StandardConfirmed => {
                        self.vote_handler
                            .on_confirmed(chain_id, &row.tx_hash, false)
                            .await;
                    }
                    _ => warn!(
                        chain_id,
                        tx_hash = %row.tx_hash,
                        "unexpected tracker transition, not firing vote handler"
                    ),
                }
            }
        }

        Ok(())
    }

    /// Returns whether the row meets `mode`'s confirmation threshold, or
    /// `NotFound` if no row exists for the signature.
    pub async fn is_confirmed(
        &self,
        chain_id: &str,
        tx_hash: &str,
        mode: ConfirmationMode,
    ) -> Result<bool, TrackerError> {
        let row = self
            .store
            .get_row(chain_id, tx_hash)
            .await?
            .ok_or_else(|| TrackerError::NotFound {
                chain_id: chain_id.to_string(),
                tx_hash: tx_hash.to_string(),
            })?;
        Ok(row.confirmations >= self.required(mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ConfirmationType;
    use crate::store::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingVoteHandler {
        fast_calls: AtomicUsize,
        standard_calls: AtomicUsize,
    }

    impl CountingVoteHandler {
        fn new() -> Self {
            Self {
                fast_calls: AtomicUsize::new(0),
                standard_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl VoteHandler for CountingVoteHandler {
        async fn on_confirmed(&self, _chain_id: &str, _tx_hash: &str, fast: bool) {
            if fast {
                self.fast_calls.fetch_add(1, Ordering::SeqCst);
            } else {
                self.standard_calls.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn sample(tx_hash: &str, block_number: u64) -> NewObservedTransaction {
        NewObservedTransaction {
            tx_hash: tx_hash.to_string(),
            chain_id: "solana:test".to_string(),
            block_number,
            event_id: "deadbeefcafebabe".to_string(),
            confirmation_type: ConfirmationType::Fast,
            payload: b"{}".to_vec(),
            expiry_block_height: 0,
        }
    }

    #[tokio::test]
    async fn fires_vote_handler_exactly_once_per_transition() {
        let store = Arc::new(InMemoryStore::new());
        let votes = Arc::new(CountingVoteHandler::new());
        let tracker = Tracker::new(store.clone(), votes.clone());

        tracker.track_transaction(sample("sig1", 100)).await.unwrap();

        tracker.update_confirmations("solana:test", 104, RowFilter::all()).await.unwrap();
        assert_eq!(votes.fast_calls.load(Ordering::SeqCst), 0);

        tracker.update_confirmations("solana:test", 105, RowFilter::all()).await.unwrap();
        assert_eq!(votes.fast_calls.load(Ordering::SeqCst), 1);

        // Repeating the same tick must not re-fire.
        tracker.update_confirmations("solana:test", 105, RowFilter::all()).await.unwrap();
        assert_eq!(votes.fast_calls.load(Ordering::SeqCst), 1);

        tracker.update_confirmations("solana:test", 112, RowFilter::all()).await.unwrap();
        assert_eq!(votes.standard_calls.load(Ordering::SeqCst), 1);

        // A STANDARD_CONFIRMED row is terminal: further ticks leave it alone.
        tracker.update_confirmations("solana:test", 999, RowFilter::all()).await.unwrap();
        assert_eq!(votes.standard_calls.load(Ordering::SeqCst), 1);
        let row = store.get_row("solana:test", "sig1").await.unwrap().unwrap();
        assert_eq!(row.confirmations, 7);
    }

    #[tokio::test]
    async fn confirmations_monotonic_across_ticks() {
        let store = Arc::new(InMemoryStore::new());
        let votes = Arc::new(CountingVoteHandler::new());
        let tracker = Tracker::new(store.clone(), votes);
        tracker.track_transaction(sample("sig1", 100)).await.unwrap();

        tracker.update_confirmations("solana:test", 102, RowFilter::all()).await.unwrap();
        let after_first = store.get_row("solana:test", "sig1").await.unwrap().unwrap().confirmations;
        tracker.update_confirmations("solana:test", 103, RowFilter::all()).await.unwrap();
        let after_second = store.get_row("solana:test", "sig1").await.unwrap().unwrap().confirmations;

        assert!(after_second >= after_first);
    }

    #[tokio::test]
    async fn expired_row_is_dropped() {
        let store = Arc::new(InMemoryStore::new());
        let votes = Arc::new(CountingVoteHandler::new());
        let tracker = Tracker::new(store.clone(), votes);
        let mut tx = sample("sig1", 100);
        tx.expiry_block_height = 150;
        tracker.track_transaction(tx).await.unwrap();

        tracker.update_confirmations("solana:test", 151, RowFilter::all()).await.unwrap();
        assert!(store.get_row("solana:test", "sig1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn is_confirmed_reports_not_found() {
        let store = Arc::new(InMemoryStore::new());
        let votes = Arc::new(CountingVoteHandler::new());
        let tracker = Tracker::new(store, votes);
        let result = tracker
            .is_confirmed("solana:test", "missing", ConfirmationMode::Fast)
            .await;
        assert!(matches!(result, Err(TrackerError::NotFound { .. })));
    }

    #[test]
    fn required_threshold_substitutes_defaults_and_matches_scenarios() {
        let store = Arc::new(InMemoryStore::new());
        let votes = Arc::new(CountingVoteHandler::new());
        let tracker = Tracker::with_thresholds(store, votes, 5, 12);
        assert_eq!(tracker.required(ConfirmationMode::parse("FAST")), 5);
        assert_eq!(tracker.required(ConfirmationMode::parse("STANDARD")), 12);
        assert_eq!(tracker.required(ConfirmationMode::parse("UNKNOWN")), 12);
        assert_eq!(tracker.required(ConfirmationMode::parse("")), 12);

        let zero_fast = Arc::new(InMemoryStore::new());
        let votes2 = Arc::new(CountingVoteHandler::new());
        let tracker_zero = Tracker::with_thresholds(zero_fast, votes2, 0, 12);
        assert_eq!(tracker_zero.required(ConfirmationMode::parse("FAST")), 5);
    }
}
