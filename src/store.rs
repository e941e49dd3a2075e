//! Persistence (A2): the `Store` trait plus a Postgres-backed implementation
//! and an in-memory fake for tests.
//!
//! Schema mirrors §6 of the spec: `chain_transactions` (Observed
//! Transactions), `chain_states` (cursor), `events` (decoded event audit
//! trail). Grounded in `state/postgres.rs`'s `sqlx::query!` + `ON CONFLICT`
//! style, generalized from its two tables to three.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;

use crate::events::ConfirmationType;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    FastConfirmed,
    StandardConfirmed,
    Reorged,
    Failed,
}

impl TransactionStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionStatus::StandardConfirmed)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::FastConfirmed => "FAST_CONFIRMED",
            TransactionStatus::StandardConfirmed => "STANDARD_CONFIRMED",
            TransactionStatus::Reorged => "REORGED",
            TransactionStatus::Failed => "FAILED",
        }
    }

    #[must_use]
    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(TransactionStatus::Pending),
            "FAST_CONFIRMED" => Some(TransactionStatus::FastConfirmed),
            "STANDARD_CONFIRMED" => Some(TransactionStatus::StandardConfirmed),
            "REORGED" => Some(TransactionStatus::Reorged),
            "FAILED" => Some(TransactionStatus::Failed),
            _ => None,
        }
    }
}

/// A row as first observed by the event watcher, prior to any confirmation
/// bookkeeping.
#[derive(Debug, Clone)]
pub struct NewObservedTransaction {
    pub tx_hash: String,
    pub chain_id: String,
    pub block_number: u64,
    pub event_id: String,
    pub confirmation_type: ConfirmationType,
    pub payload: Vec<u8>,
    pub expiry_block_height: u64,
}

#[derive(Debug, Clone)]
pub struct ObservedTransaction {
    pub tx_hash: String,
    pub chain_id: String,
    pub block_number: u64,
    pub event_id: String,
    pub confirmation_type: ConfirmationType,
    pub status: TransactionStatus,
    pub confirmations: u64,
    pub payload: Vec<u8>,
    pub expiry_block_height: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persistence boundary for observed transactions and per-chain cursors.
///
/// Implementations MUST make `track_transaction` idempotent (earlier row
/// wins on conflict) and MUST NOT cache rows across calls — callers own all
/// read-modify-write coordination.
#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts a newly observed row. Returns `false` without error if a row
    /// for `(chain_id, tx_hash)` already exists.
    async fn track_transaction(&self, tx: NewObservedTransaction) -> Result<bool, StoreError>;

    /// All non-terminal rows (`status != STANDARD_CONFIRMED`) for a chain,
    /// optionally filtered to a single confirmation type (used by C6 to
    /// operate only on outbound-classified rows).
    async fn non_terminal_rows(
        &self,
        chain_id: &str,
        confirmation_type: Option<ConfirmationType>,
    ) -> Result<Vec<ObservedTransaction>, StoreError>;

    async fn get_row(
        &self,
        chain_id: &str,
        tx_hash: &str,
    ) -> Result<Option<ObservedTransaction>, StoreError>;

    /// Overwrites confirmations/status for a row (used by the tracker after
    /// it computes the new state from a freshly-read snapshot).
    async fn set_confirmations(
        &self,
        chain_id: &str,
        tx_hash: &str,
        confirmations: u64,
        status: TransactionStatus,
    ) -> Result<(), StoreError>;

    /// Overwrites slot + status + confirmations in one write (used by the
    /// verifier on slot migration/reorg/failure).
    async fn set_slot_and_status(
        &self,
        chain_id: &str,
        tx_hash: &str,
        block_number: u64,
        status: TransactionStatus,
        confirmations: u64,
    ) -> Result<(), StoreError>;

    async fn delete_row(&self, chain_id: &str, tx_hash: &str) -> Result<(), StoreError>;

    /// Highest slot whose signatures have already been enumerated for this
    /// chain. Defaults to 0 for a chain with no persisted cursor.
    async fn get_cursor(&self, chain_id: &str) -> Result<u64, StoreError>;

    async fn set_cursor(&self, chain_id: &str, last_block: u64) -> Result<(), StoreError>;

    /// Appends a decoded-event audit row (§6 `events` schema). Purely
    /// additive bookkeeping — unlike `track_transaction`, callers are not
    /// expected to deduplicate against it.
    async fn record_event(&self, event: NewDecodedEvent) -> Result<(), StoreError>;
}

/// A decoded event destined for the `events` audit trail, independent of
/// the `chain_transactions` row its observation also produces.
#[derive(Debug, Clone)]
pub struct NewDecodedEvent {
    pub chain_id: String,
    pub tx_hash: String,
    pub event_id: String,
    pub method_name: String,
    pub decoded_payload: Vec<u8>,
}

/// `sqlx`-backed implementation against Postgres.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connects with a bounded pool and runs embedded migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn track_transaction(&self, tx: NewObservedTransaction) -> Result<bool, StoreError> {
        let block_number = tx.block_number as i64;
        let expiry = tx.expiry_block_height as i64;
        let result = sqlx::query!(
            r#"
            INSERT INTO chain_transactions
                (tx_hash, chain_id, block_number, event_id, confirmation_type,
                 status, confirmations, payload, expiry_block_height)
            VALUES ($1, $2, $3, $4, $5, 'PENDING', 0, $6, $7)
            ON CONFLICT (chain_id, tx_hash) DO NOTHING
            "#,
            tx.tx_hash,
            tx.chain_id,
            block_number,
            tx.event_id,
            confirmation_type_str(tx.confirmation_type),
            tx.payload,
            expiry,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn non_terminal_rows(
        &self,
        chain_id: &str,
        confirmation_type: Option<ConfirmationType>,
    ) -> Result<Vec<ObservedTransaction>, StoreError> {
        let filter = confirmation_type.map(confirmation_type_str);
        let records = sqlx::query!(
            r#"
            SELECT tx_hash, chain_id, block_number, event_id, confirmation_type,
                   status, confirmations, payload, expiry_block_height,
                   created_at, updated_at
            FROM chain_transactions
            WHERE chain_id = $1
              AND status <> 'STANDARD_CONFIRMED'
              AND ($2::text IS NULL OR confirmation_type = $2)
            "#,
            chain_id,
            filter,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records
            .into_iter()
            .filter_map(|record| {
                Some(ObservedTransaction {
                    tx_hash: record.tx_hash,
                    chain_id: record.chain_id,
                    block_number: record.block_number as u64,
                    event_id: record.event_id,
                    confirmation_type: parse_confirmation_type(&record.confirmation_type)?,
                    status: TransactionStatus::from_str_opt(&record.status)?,
                    confirmations: record.confirmations as u64,
                    payload: record.payload,
                    expiry_block_height: record.expiry_block_height as u64,
                    created_at: record.created_at,
                    updated_at: record.updated_at,
                })
            })
            .collect())
    }

    async fn get_row(
        &self,
        chain_id: &str,
        tx_hash: &str,
    ) -> Result<Option<ObservedTransaction>, StoreError> {
        let record = sqlx::query!(
            r#"
            SELECT tx_hash, chain_id, block_number, event_id, confirmation_type,
                   status, confirmations, payload, expiry_block_height,
                   created_at, updated_at
            FROM chain_transactions
            WHERE chain_id = $1 AND tx_hash = $2
            "#,
            chain_id,
            tx_hash,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(record.and_then(|record| {
            Some(ObservedTransaction {
                tx_hash: record.tx_hash,
                chain_id: record.chain_id,
                block_number: record.block_number as u64,
                event_id: record.event_id,
                confirmation_type: parse_confirmation_type(&record.confirmation_type)?,
                status: TransactionStatus::from_str_opt(&record.status)?,
                confirmations: record.confirmations as u64,
                payload: record.payload,
                expiry_block_height: record.expiry_block_height as u64,
                created_at: record.created_at,
                updated_at: record.updated_at,
            })
        }))
    }

    async fn set_confirmations(
        &self,
        chain_id: &str,
        tx_hash: &str,
        confirmations: u64,
        status: TransactionStatus,
    ) -> Result<(), StoreError> {
        let confirmations = confirmations as i64;
        sqlx::query!(
            r#"
            UPDATE chain_transactions
            SET confirmations = $3, status = $4, updated_at = now()
            WHERE chain_id = $1 AND tx_hash = $2
            "#,
            chain_id,
            tx_hash,
            confirmations,
            status.as_str(),
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_slot_and_status(
        &self,
        chain_id: &str,
        tx_hash: &str,
        block_number: u64,
        status: TransactionStatus,
        confirmations: u64,
    ) -> Result<(), StoreError> {
        let block_number = block_number as i64;
        let confirmations = confirmations as i64;
        sqlx::query!(
            r#"
            UPDATE chain_transactions
            SET block_number = $3, status = $4, confirmations = $5, updated_at = now()
            WHERE chain_id = $1 AND tx_hash = $2
            "#,
            chain_id,
            tx_hash,
            block_number,
            status.as_str(),
            confirmations,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_row(&self, chain_id: &str, tx_hash: &str) -> Result<(), StoreError> {
        sqlx::query!(
            "DELETE FROM chain_transactions WHERE chain_id = $1 AND tx_hash = $2",
            chain_id,
            tx_hash,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_cursor(&self, chain_id: &str) -> Result<u64, StoreError> {
        let record = sqlx::query!(
            "SELECT last_block FROM chain_states WHERE chain_id = $1",
            chain_id,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(record.map_or(0, |record| record.last_block as u64))
    }

    async fn set_cursor(&self, chain_id: &str, last_block: u64) -> Result<(), StoreError> {
        let last_block = last_block as i64;
        sqlx::query!(
            r#"
            INSERT INTO chain_states (chain_id, last_block)
            VALUES ($1, $2)
            ON CONFLICT (chain_id) DO UPDATE SET last_block = excluded.last_block
            "#,
            chain_id,
            last_block,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_event(&self, event: NewDecodedEvent) -> Result<(), StoreError> {
        sqlx::query!(
            r#"
            INSERT INTO events (chain_id, tx_hash, event_id, method_name, decoded_payload)
            VALUES ($1, $2, $3, $4, $5)
            "#,
            event.chain_id,
            event.tx_hash,
            event.event_id,
            event.method_name,
            event.decoded_payload,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn confirmation_type_str(value: ConfirmationType) -> &'static str {
    match value {
        ConfirmationType::Fast => "FAST",
        ConfirmationType::Standard => "STANDARD",
    }
}

fn parse_confirmation_type(value: &str) -> Option<ConfirmationType> {
    match value {
        "FAST" => Some(ConfirmationType::Fast),
        "STANDARD" => Some(ConfirmationType::Standard),
        _ => None,
    }
}

/// In-memory fake used by tests for C3/C4/C5/C6 without a live Postgres
/// instance. Keyed by `(chain_id, tx_hash)`.
#[derive(Default)]
pub struct InMemoryStore {
    rows: Mutex<HashMap<(String, String), ObservedTransaction>>,
    cursors: Mutex<HashMap<String, u64>>,
    events: Mutex<Vec<NewDecodedEvent>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoded events recorded via [`Store::record_event`] so far, in
    /// insertion order. Test-only introspection; no Postgres counterpart.
    #[must_use]
    pub fn recorded_events(&self) -> Vec<NewDecodedEvent> {
        self.events.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn track_transaction(&self, tx: NewObservedTransaction) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().expect("lock poisoned");
        let key = (tx.chain_id.clone(), tx.tx_hash.clone());
        if rows.contains_key(&key) {
            return Ok(false);
        }
        let now = Utc::now();
        rows.insert(
            key,
            ObservedTransaction {
                tx_hash: tx.tx_hash,
                chain_id: tx.chain_id,
                block_number: tx.block_number,
                event_id: tx.event_id,
                confirmation_type: tx.confirmation_type,
                status: TransactionStatus::Pending,
                confirmations: 0,
                payload: tx.payload,
                expiry_block_height: tx.expiry_block_height,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(true)
    }

    async fn non_terminal_rows(
        &self,
        chain_id: &str,
        confirmation_type: Option<ConfirmationType>,
    ) -> Result<Vec<ObservedTransaction>, StoreError> {
        let rows = self.rows.lock().expect("lock poisoned");
        Ok(rows
            .values()
            .filter(|row| row.chain_id == chain_id)
            .filter(|row| !row.status.is_terminal())
            .filter(|row| confirmation_type.map_or(true, |ct| row.confirmation_type == ct))
            .cloned()
            .collect())
    }

    async fn get_row(
        &self,
        chain_id: &str,
        tx_hash: &str,
    ) -> Result<Option<ObservedTransaction>, StoreError> {
        let rows = self.rows.lock().expect("lock poisoned");
        Ok(rows
            .get(&(chain_id.to_string(), tx_hash.to_string()))
            .cloned())
    }

    async fn set_confirmations(
        &self,
        chain_id: &str,
        tx_hash: &str,
        confirmations: u64,
        status: TransactionStatus,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().expect("lock poisoned");
        if let Some(row) = rows.get_mut(&(chain_id.to_string(), tx_hash.to_string())) {
            row.confirmations = confirmations;
            row.status = status;
            row.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_slot_and_status(
        &self,
        chain_id: &str,
        tx_hash: &str,
        block_number: u64,
        status: TransactionStatus,
        confirmations: u64,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().expect("lock poisoned");
        if let Some(row) = rows.get_mut(&(chain_id.to_string(), tx_hash.to_string())) {
            row.block_number = block_number;
            row.status = status;
            row.confirmations = confirmations;
            row.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn delete_row(&self, chain_id: &str, tx_hash: &str) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().expect("lock poisoned");
        rows.remove(&(chain_id.to_string(), tx_hash.to_string()));
        Ok(())
    }

    async fn get_cursor(&self, chain_id: &str) -> Result<u64, StoreError> {
        let cursors = self.cursors.lock().expect("lock poisoned");
        Ok(cursors.get(chain_id).copied().unwrap_or(0))
    }

    async fn set_cursor(&self, chain_id: &str, last_block: u64) -> Result<(), StoreError> {
        let mut cursors = self.cursors.lock().expect("lock poisoned");
        cursors.insert(chain_id.to_string(), last_block);
        Ok(())
    }

    async fn record_event(&self, event: NewDecodedEvent) -> Result<(), StoreError> {
        self.events.lock().expect("lock poisoned").push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    async fn track_transaction_is_idempotent() {
        let store = InMemoryStore::new();
        assert!(store.track_transaction(sample("sig1", 10)).await.unwrap());
        assert!(!store.track_transaction(sample("sig1", 99)).await.unwrap());
        let row = store.get_row("solana:test", "sig1").await.unwrap().unwrap();
        assert_eq!(row.block_number, 10, "earlier row wins on conflict");
    }

    #[tokio::test]
    async fn non_terminal_rows_excludes_standard_confirmed() {
        let store = InMemoryStore::new();
        store.track_transaction(sample("sig1", 10)).await.unwrap();
        store
            .set_confirmations("solana:test", "sig1", 20, TransactionStatus::StandardConfirmed)
            .await
            .unwrap();
        let rows = store.non_terminal_rows("solana:test", None).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn cursor_defaults_to_zero_then_persists() {
        let store = InMemoryStore::new();
        assert_eq!(store.get_cursor("solana:test").await.unwrap(), 0);
        store.set_cursor("solana:test", 555).await.unwrap();
        assert_eq!(store.get_cursor("solana:test").await.unwrap(), 555);
    }

    #[tokio::test]
    async fn record_event_appends_to_the_audit_trail() {
        let store = InMemoryStore::new();
        store
            .record_event(NewDecodedEvent {
                chain_id: "solana:test".to_string(),
                tx_hash: "sig1".to_string(),
                event_id: "sig1:0".to_string(),
                method_name: "tx_with_funds".to_string(),
                decoded_payload: b"{}".to_vec(),
            })
            .await
            .unwrap();
        let events = store.recorded_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].method_name, "tx_with_funds");
    }
}
