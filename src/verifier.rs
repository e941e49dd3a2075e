//! Transaction Verifier (C4): re-fetches every non-terminal row each tick
//! and reconciles it against chain reality before confirmations are
//! recomputed, per the outcome table in the spec's §4.4.
//!
//! Runs ahead of [`crate::tracker::Tracker::update_confirmations`] so
//! confirmations are never computed against a phantom slot — Solana
//! finality below `finalized` is probabilistic and re-fetching is the only
//! source of truth (§9 "Reorg semantics").

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::events::ConfirmationType;
use crate::rpc::{RpcPool, RpcPoolError};
use crate::store::{Store, StoreError, TransactionStatus};

/// Narrows which non-terminal rows a tick acts on: C5 scans everything, C6
/// scans only outbound-classified rows and skips deny-listed event ids.
#[derive(Debug, Clone, Copy)]
pub struct RowFilter<'a> {
    pub confirmation_type: Option<ConfirmationType>,
    pub deny_list: Option<&'a HashSet<String>>,
}

impl RowFilter<'_> {
    #[must_use]
    pub fn all() -> Self {
        Self {
            confirmation_type: None,
            deny_list: None,
        }
    }

    pub fn admits(&self, event_id: &str) -> bool {
        !self.deny_list.is_some_and(|deny| deny.contains(event_id))
    }
}

#[derive(Debug, Error)]
pub enum VerifierError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cancelled")]
    Cancelled,
    #[error("malformed signature '{signature}': {source}")]
    MalformedSignature {
        signature: String,
        #[source]
        source: anyhow::Error,
    },
}

/// What the re-fetch found for a single tracked transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReVerifyOutcome {
    /// RPC error, or the signature is no longer found on chain.
    Reorged,
    /// Still present at the same slot with no execution error.
    Unchanged,
    /// Present, but at a different slot than recorded.
    SlotMigrated { new_slot: u64 },
    /// Present, but the transaction's `meta.err` is populated.
    Failed,
}

/// Abstraction over "fetch this signature's current slot and execution
/// result" so the verifier can be driven by a fake client in tests.
#[async_trait::async_trait]
pub trait TransactionLookup: Send + Sync {
    async fn lookup(
        &self,
        cancellation: &CancellationToken,
        signature: &str,
    ) -> Result<Option<TransactionFacts>, VerifierError>;
}

#[derive(Debug, Clone, Copy)]
pub struct TransactionFacts {
    pub slot: u64,
    pub execution_failed: bool,
}

/// `TransactionLookup` backed by the live RPC pool's `getTransaction`.
pub struct RpcTransactionLookup {
    pool: Arc<RpcPool>,
}

impl RpcTransactionLookup {
    #[must_use]
    pub fn new(pool: Arc<RpcPool>) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TransactionLookup for RpcTransactionLookup {
    async fn lookup(
        &self,
        cancellation: &CancellationToken,
        signature: &str,
    ) -> Result<Option<TransactionFacts>, VerifierError> {
        use solana_sdk::signature::Signature;
        use solana_transaction_status::UiTransactionEncoding;
        use std::str::FromStr;

        let parsed = Signature::from_str(signature).map_err(|error| {
            VerifierError::MalformedSignature {
                signature: signature.to_string(),
                source: anyhow::Error::from(error),
            }
        })?;

        let result = self
            .pool
            .execute_with_failover(cancellation, "getTransaction", |client| {
                let parsed = parsed;
                Box::pin(async move {
                    client
                        .get_transaction(&parsed, UiTransactionEncoding::Base64)
                        .await
                        .map_err(anyhow::Error::from)
                })
            })
            .await;

        match result {
            Ok(confirmed) => {
                let execution_failed = confirmed
                    .transaction
                    .meta
                    .as_ref()
                    .is_some_and(|meta| meta.err.is_some());
                Ok(Some(TransactionFacts {
                    slot: confirmed.slot,
                    execution_failed,
                }))
            }
            Err(RpcPoolError::Cancelled) => Err(VerifierError::Cancelled),
            Err(_not_found_or_exhausted) => Ok(None),
        }
    }
}

pub struct Verifier<L> {
    store: Arc<dyn Store>,
    lookup: L,
}

impl<L: TransactionLookup> Verifier<L> {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, lookup: L) -> Self {
        Self { store, lookup }
    }

    /// Re-verifies every non-terminal row on `chain_id` matching `filter`,
    /// applying the outcome table from §4.4.
    pub async fn verify_pending(
        &self,
        cancellation: &CancellationToken,
        chain_id: &str,
        filter: RowFilter<'_>,
    ) -> Result<(), VerifierError> {
        let rows = self
            .store
            .non_terminal_rows(chain_id, filter.confirmation_type)
            .await?;

        for row in rows {
            if cancellation.is_cancelled() {
                return Err(VerifierError::Cancelled);
            }
            if !filter.admits(&row.event_id) {
                continue;
            }
            if !matches!(
                row.status,
                TransactionStatus::Pending | TransactionStatus::FastConfirmed
            ) {
                continue;
            }

            let facts = self.lookup.lookup(cancellation, &row.tx_hash).await?;
            match facts {
                None => {
                    warn!(
                        chain_id,
                        tx_hash = %row.tx_hash,
                        "transaction no longer found on re-fetch, marking reorged"
                    );
                    self.store
                        .set_slot_and_status(
                            chain_id,
                            &row.tx_hash,
                            row.block_number,
                            TransactionStatus::Reorged,
                            0,
                        )
                        .await?;
                }
                Some(facts) if facts.execution_failed => {
                    self.store
                        .set_slot_and_status(
                            chain_id,
                            &row.tx_hash,
                            facts.slot,
                            TransactionStatus::Failed,
                            row.confirmations,
                        )
                        .await?;
                }
                Some(facts) if facts.slot != row.block_number => {
                    self.store
                        .set_slot_and_status(
                            chain_id,
                            &row.tx_hash,
                            facts.slot,
                            TransactionStatus::Pending,
                            0,
                        )
                        .await?;
                }
                Some(_unchanged) => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ConfirmationType;
    use crate::store::{InMemoryStore, NewObservedTransaction};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeLookup {
        facts: Mutex<HashMap<String, Option<TransactionFacts>>>,
    }

    #[async_trait::async_trait]
    impl TransactionLookup for FakeLookup {
        async fn lookup(
            &self,
            _cancellation: &CancellationToken,
            signature: &str,
        ) -> Result<Option<TransactionFacts>, VerifierError> {
            Ok(self.facts.lock().unwrap().get(signature).copied().flatten())
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
    async fn disappeared_transaction_is_reorged() {
        let store = Arc::new(InMemoryStore::new());
        store.track_transaction(sample("sig1", 100)).await.unwrap();
        let lookup = FakeLookup {
            facts: Mutex::new(HashMap::from([("sig1".to_string(), None)])),
        };
        let verifier = Verifier::new(store.clone(), lookup);
        verifier
            .verify_pending(&CancellationToken::new(), "solana:test", RowFilter::all())
            .await
            .unwrap();
        let row = store.get_row("solana:test", "sig1").await.unwrap().unwrap();
        assert_eq!(row.status, TransactionStatus::Reorged);
        assert_eq!(row.confirmations, 0);
    }

    #[tokio::test]
    async fn slot_migration_resets_to_pending() {
        let store = Arc::new(InMemoryStore::new());
        store.track_transaction(sample("sig1", 100)).await.unwrap();
        let lookup = FakeLookup {
            facts: Mutex::new(HashMap::from([(
                "sig1".to_string(),
                Some(TransactionFacts {
                    slot: 150,
                    execution_failed: false,
                }),
            )])),
        };
        let verifier = Verifier::new(store.clone(), lookup);
        verifier
            .verify_pending(&CancellationToken::new(), "solana:test", RowFilter::all())
            .await
            .unwrap();
        let row = store.get_row("solana:test", "sig1").await.unwrap().unwrap();
        assert_eq!(row.status, TransactionStatus::Pending);
        assert_eq!(row.block_number, 150);
        assert_eq!(row.confirmations, 0);
    }

    #[tokio::test]
    async fn execution_error_marks_failed() {
        let store = Arc::new(InMemoryStore::new());
        store.track_transaction(sample("sig1", 100)).await.unwrap();
        let lookup = FakeLookup {
            facts: Mutex::new(HashMap::from([(
                "sig1".to_string(),
                Some(TransactionFacts {
                    slot: 100,
                    execution_failed: true,
                }),
            )])),
        };
        let verifier = Verifier::new(store.clone(), lookup);
        verifier
            .verify_pending(&CancellationToken::new(), "solana:test", RowFilter::all())
            .await
            .unwrap();
        let row = store.get_row("solana:test", "sig1").await.unwrap().unwrap();
        assert_eq!(row.status, TransactionStatus::Failed);
    }

    #[tokio::test]
    async fn same_slot_no_error_leaves_row_unchanged() {
        let store = Arc::new(InMemoryStore::new());
        store.track_transaction(sample("sig1", 100)).await.unwrap();
        let lookup = FakeLookup {
            facts: Mutex::new(HashMap::from([(
                "sig1".to_string(),
                Some(TransactionFacts {
                    slot: 100,
                    execution_failed: false,
                }),
            )])),
        };
        let verifier = Verifier::new(store.clone(), lookup);
        verifier
            .verify_pending(&CancellationToken::new(), "solana:test", RowFilter::all())
            .await
            .unwrap();
        let row = store.get_row("solana:test", "sig1").await.unwrap().unwrap();
        assert_eq!(row.status, TransactionStatus::Pending);
        assert_eq!(row.block_number, 100);
    }
}
