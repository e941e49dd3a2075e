//! Event Watcher (C5): the ticker-driven polling loop that turns gateway
//! program activity into tracked, decoded events.
//!
//! Loop shape grounded in `sentinel.rs`'s `work()` (drive a scanner, fan
//! events out, advance persisted state) and `transaction_scanner.rs`'s
//! `get_signatures_for_address_with_config` usage, generalized from the
//! teacher's channel-of-join-handles plumbing down to the single-tick
//! shape the spec describes in §4.5.

use std::sync::Arc;
use std::time::Duration;

use solana_client::rpc_client::GetConfirmedSignaturesForAddress2Config;
use solana_sdk::commitment_config::{CommitmentConfig, CommitmentLevel};
use solana_sdk::pubkey::Pubkey;
use solana_transaction_status::UiTransactionEncoding;
use thiserror::Error;
use tokio::sync::mpsc::{self, Sender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{decode_transaction_events_scoped, DecodedEvent, DiscriminatorTable};
use crate::rpc::{RpcPool, RpcPoolError};
use crate::store::{NewDecodedEvent, NewObservedTransaction, Store, StoreError};
use crate::tracker::Tracker;
use crate::verifier::{RowFilter, TransactionLookup, Verifier};

/// Default poll interval when neither a per-chain nor a global override is
/// configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Bounded channel capacity for decoded events; a slow consumer throttles
/// the whole watcher tick by design (§5 "Backpressure").
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Default window size requested from `getSignaturesForAddress`.
const SIGNATURE_PAGE_LIMIT: usize = 1000;

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("rpc pool exhausted: {0}")]
    Rpc(#[from] RpcPoolError),
}

/// A decoded event, carrying enough context for the consumer to act on it
/// without re-fetching.
#[derive(Debug, Clone)]
pub struct WatcherEvent {
    pub signature: String,
    pub slot: u64,
    pub method_name: String,
    pub event: DecodedEvent,
}

pub struct EventWatcher<L> {
    chain_id: String,
    gateway_program: Pubkey,
    rpc: Arc<RpcPool>,
    store: Arc<dyn Store>,
    tracker: Arc<Tracker>,
    verifier: Arc<Verifier<L>>,
    discriminators: DiscriminatorTable,
    poll_interval: Duration,
}

impl<L: TransactionLookup + Send + Sync + 'static> EventWatcher<L> {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain_id: String,
        gateway_program: Pubkey,
        rpc: Arc<RpcPool>,
        store: Arc<dyn Store>,
        tracker: Arc<Tracker>,
        verifier: Arc<Verifier<L>>,
        discriminators: DiscriminatorTable,
        poll_interval: Option<Duration>,
    ) -> Self {
        Self {
            chain_id,
            gateway_program,
            rpc,
            store,
            tracker,
            verifier,
            discriminators,
            poll_interval: poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL),
        }
    }

    /// Runs the watcher loop until `cancellation` fires, sending decoded
    /// events on `sender`. Returns once cancelled; never restarts itself —
    /// supervision/restart-on-panic is the caller's concern (see the
    /// `relayer` binary's `JoinSet`-based supervisor).
    #[tracing::instrument(skip_all, fields(chain_id = %self.chain_id))]
    pub async fn run(&self, cancellation: CancellationToken, sender: Sender<WatcherEvent>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                () = cancellation.cancelled() => {
                    debug!("watcher cancelled, stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(error) = self.tick(&cancellation, &sender).await {
                        warn!(%error, "watcher tick failed, continuing to next tick");
                    }
                }
            }
        }
    }

    async fn tick(
        &self,
        cancellation: &CancellationToken,
        sender: &Sender<WatcherEvent>,
    ) -> Result<(), WatcherError> {
        let cursor = self.store.get_cursor(&self.chain_id).await?;

        let latest_slot = match self.fetch_latest_slot(cancellation).await {
            Ok(slot) => slot,
            Err(error) => {
                warn!(%error, "failed to fetch latest slot, skipping tick");
                return Ok(());
            }
        };

        if latest_slot <= cursor {
            return Ok(());
        }

        let signatures = self.fetch_signatures(cancellation).await?;

        for info in signatures {
            if cancellation.is_cancelled() {
                return Ok(());
            }
            let Ok(slot) = u64::try_from(info.slot) else {
                continue;
            };
            if slot < cursor {
                continue;
            }

            let Ok(logs) = self.fetch_logs(cancellation, &info.signature).await else {
                continue;
            };

            let Some((descriptor, event)) = decode_transaction_events_scoped(
                &logs,
                &self.discriminators,
                &self.gateway_program.to_string(),
            ) else {
                continue;
            };

            let confirmation_type = event.default_confirmation_type();
            let payload = serde_json::to_vec(&format!("{event:?}")).unwrap_or_default();
            let event_id = format!("{}:0", info.signature);

            self.tracker
                .track_transaction(NewObservedTransaction {
                    tx_hash: info.signature.clone(),
                    chain_id: self.chain_id.clone(),
                    block_number: slot,
                    event_id: event_id.clone(),
                    confirmation_type,
                    payload: payload.clone(),
                    expiry_block_height: 0,
                })
                .await
                .map_err(|error| WatcherError::Store(StoreError::Database(
                    sqlx::Error::Protocol(error.to_string()),
                )))?;

            self.store
                .record_event(NewDecodedEvent {
                    chain_id: self.chain_id.clone(),
                    tx_hash: info.signature.clone(),
                    event_id,
                    method_name: descriptor.method_name.clone(),
                    decoded_payload: payload,
                })
                .await?;

            if sender
                .send(WatcherEvent {
                    signature: info.signature.clone(),
                    slot,
                    method_name: descriptor.method_name.clone(),
                    event,
                })
                .await
                .is_err()
            {
                debug!("watcher event receiver dropped, stopping tick early");
                return Ok(());
            }
        }

        self.verifier
            .verify_pending(cancellation, &self.chain_id, RowFilter::all())
            .await
            .map_err(|error| {
                WatcherError::Store(StoreError::Database(sqlx::Error::Protocol(
                    error.to_string(),
                )))
            })?;

        self.tracker
            .update_confirmations(&self.chain_id, latest_slot, RowFilter::all())
            .await
            .map_err(|error| {
                WatcherError::Store(StoreError::Database(sqlx::Error::Protocol(
                    error.to_string(),
                )))
            })?;

        self.store.set_cursor(&self.chain_id, latest_slot).await?;

        Ok(())
    }

    async fn fetch_latest_slot(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<u64, RpcPoolError> {
        self.rpc
            .execute_with_failover(cancellation, "getSlot", |client| {
                Box::pin(async move {
                    client
                        .get_slot_with_commitment(CommitmentConfig {
                            commitment: CommitmentLevel::Finalized,
                        })
                        .await
                        .map_err(anyhow::Error::from)
                })
            })
            .await
    }

    async fn fetch_signatures(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<Vec<solana_client::rpc_response::RpcConfirmedTransactionStatusWithSignature>, WatcherError>
    {
        let gateway_program = self.gateway_program;
        let signatures = self
            .rpc
            .execute_with_failover(cancellation, "getSignaturesForAddress", |client| {
                Box::pin(async move {
                    client
                        .get_signatures_for_address_with_config(
                            &gateway_program,
                            GetConfirmedSignaturesForAddress2Config {
                                before: None,
                                until: None,
                                limit: Some(SIGNATURE_PAGE_LIMIT),
                                commitment: Some(CommitmentConfig::finalized()),
                            },
                        )
                        .await
                        .map_err(anyhow::Error::from)
                })
            })
            .await?;
        Ok(signatures)
    }

    async fn fetch_logs(
        &self,
        cancellation: &CancellationToken,
        signature: &str,
    ) -> anyhow::Result<Vec<String>> {
        use solana_client::rpc_config::RpcTransactionConfig;
        use solana_sdk::signature::Signature;
        use std::str::FromStr;

        let parsed = Signature::from_str(signature)?;
        let confirmed = self
            .rpc
            .execute_with_failover(cancellation, "getTransaction", |client| {
                let parsed = parsed;
                Box::pin(async move {
                    client
                        .get_transaction_with_config(
                            &parsed,
                            RpcTransactionConfig {
                                encoding: Some(UiTransactionEncoding::Base64),
                                commitment: Some(CommitmentConfig::confirmed()),
                                max_supported_transaction_version: Some(0),
                            },
                        )
                        .await
                        .map_err(anyhow::Error::from)
                })
            })
            .await?;

        confirmed
            .transaction
            .meta
            .and_then(|meta| Option::<Vec<String>>::from(meta.log_messages))
            .ok_or_else(|| anyhow::anyhow!("transaction without log messages"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_poll_interval_is_five_seconds() {
        assert_eq!(DEFAULT_POLL_INTERVAL, Duration::from_secs(5));
    }

    #[test]
    fn event_channel_capacity_is_bounded_per_spec() {
        assert_eq!(EVENT_CHANNEL_CAPACITY, 100);
        let (tx, _rx) = mpsc::channel::<WatcherEvent>(EVENT_CHANNEL_CAPACITY);
        assert_eq!(tx.capacity(), EVENT_CHANNEL_CAPACITY);
    }
}
