//! Outbound Event Confirmer (C6): the same loop shape as [`crate::watcher`]
//! but over outbound-classified rows, with its own FAST/STANDARD
//! thresholds and an optional deny-list of discriminators to skip.
//!
//! Grounded in `sentinel.rs`'s ticker-driven worker loop, reused rather
//! than duplicated in spirit for C5 vs C6 — the two differ only in which
//! rows they scan and which confirmation-type filter they apply.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::ConfirmationType;
use crate::store::{Store, StoreError};
use crate::tracker::Tracker;
use crate::verifier::{RowFilter, TransactionLookup, Verifier};

pub use crate::watcher::DEFAULT_POLL_INTERVAL;

#[derive(Debug, Error)]
pub enum ConfirmerError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Polls outbound-classified rows for a chain and drives their
/// FAST/STANDARD lifecycle, independent of the inbound watcher's
/// thresholds.
pub struct OutboundConfirmer<L> {
    chain_id: String,
    store: Arc<dyn Store>,
    tracker: Arc<Tracker>,
    verifier: Arc<Verifier<L>>,
    /// Event discriminators (hex) to silently ignore — deployment-specific,
    /// per the spec's open question about the `add_funds` skip-list.
    deny_list: HashSet<String>,
    poll_interval: Duration,
}

/// Default deny-list entry observed in the source deployment: the
/// `add_funds` event discriminator. Kept as a convenience default, fully
/// overridable via configuration.
pub const DEFAULT_DENY_LIST_DISCRIMINATOR: &str = "7f1f6cffbb134644";

impl<L: TransactionLookup + Send + Sync + 'static> OutboundConfirmer<L> {
    #[must_use]
    pub fn new(
        chain_id: String,
        store: Arc<dyn Store>,
        tracker: Arc<Tracker>,
        verifier: Arc<Verifier<L>>,
        deny_list: HashSet<String>,
        poll_interval: Option<Duration>,
    ) -> Self {
        Self {
            chain_id,
            store,
            tracker,
            verifier,
            deny_list,
            poll_interval: poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL),
        }
    }

    /// Runs until `cancellation` fires. Like [`crate::watcher::EventWatcher::run`],
    /// does not restart itself on tick failure — only stops on cancellation.
    #[tracing::instrument(skip_all, fields(chain_id = %self.chain_id))]
    pub async fn run(&self, cancellation: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                () = cancellation.cancelled() => {
                    debug!("confirmer cancelled, stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(error) = self.tick(&cancellation).await {
                        warn!(%error, "confirmer tick failed, continuing to next tick");
                    }
                }
            }
        }
    }

    async fn tick(&self, cancellation: &CancellationToken) -> Result<(), ConfirmerError> {
        let filter = RowFilter {
            confirmation_type: Some(ConfirmationType::Standard),
            deny_list: Some(&self.deny_list),
        };

        self.verifier
            .verify_pending(cancellation, &self.chain_id, filter)
            .await
            .map_err(|error| {
                ConfirmerError::Store(StoreError::Database(sqlx::Error::Protocol(
                    error.to_string(),
                )))
            })?;

        // The current slot used for UpdateConfirmations is whatever the
        // inbound watcher last persisted as the chain cursor: outbound
        // confirmations are measured against the same notion of "now" as
        // inbound ones, just gated to a different row subset.
        let latest_slot = self.store.get_cursor(&self.chain_id).await?;
        self.tracker
            .update_confirmations(&self.chain_id, latest_slot, filter)
            .await
            .map_err(|error| {
                ConfirmerError::Store(StoreError::Database(sqlx::Error::Protocol(
                    error.to_string(),
                )))
            })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_deny_list_entry_matches_known_add_funds_discriminator() {
        assert_eq!(DEFAULT_DENY_LIST_DISCRIMINATOR, "7f1f6cffbb134644");
    }

    #[test]
    fn deny_list_is_a_plain_configurable_set() {
        let mut deny_list = HashSet::new();
        deny_list.insert(DEFAULT_DENY_LIST_DISCRIMINATOR.to_string());
        assert!(deny_list.contains(DEFAULT_DENY_LIST_DISCRIMINATOR));
        deny_list.clear();
        assert!(deny_list.is_empty(), "fully overridable, including to empty");
    }
}
