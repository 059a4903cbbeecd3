//! Durable storage for transfer records and watcher checkpoints.
//!
//! The pipeline talks to storage through the `RecordStore` and
//! `CheckpointStore` traits; `PgStore` is the PostgreSQL implementation.

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::types::{Chain, Direction, RecordStatus};

pub mod models;

pub use models::*;

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

/// Transfer-record persistence used by watchers, the confirmation tracker,
/// and the builders.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a newly detected transfer. Returns false when the record id
    /// already exists (replayed block).
    async fn insert_record(&self, record: &NewTransferRecord) -> Result<bool>;

    /// Fetch one record by id.
    async fn record_by_id(&self, id: &str) -> Result<Option<TransferRecord>>;

    /// Confirmed records in a given processing status, oldest first.
    /// Freshly detected records sit in `Todo` but are invisible here until
    /// the confirmation tracker promotes them.
    async fn records_by_status(
        &self,
        direction: Direction,
        status: RecordStatus,
        limit: i64,
    ) -> Result<Vec<TransferRecord>>;

    /// Records still awaiting confirmation depth.
    async fn unconfirmed_records(&self, direction: Direction) -> Result<Vec<TransferRecord>>;

    /// Refresh the confirmation count of a still-unconfirmed record.
    async fn update_confirm_count(&self, id: &str, confirm_count: i32) -> Result<()>;

    /// Promote a record to confirmed: store its priced fee and open the
    /// counter-action (`Todo`) or hold it (`ManualReview`).
    async fn promote_confirmed(
        &self,
        id: &str,
        confirm_count: i32,
        bridge_fee: &str,
        status: RecordStatus,
        message: Option<&str>,
    ) -> Result<()>;

    /// Exclude a batch from further selection before building its
    /// transaction.
    async fn mark_pending(&self, ids: &[String]) -> Result<()>;

    /// Record the broadcast target transaction. The write is guarded so a
    /// target hash is only ever set once; returns false if one was already
    /// present.
    async fn set_target_tx(&self, id: &str, tx_hash: &str) -> Result<bool>;

    /// Return a pending record to `Todo` for rebuilding, clearing a target
    /// transaction that provably never landed on chain. This is the only
    /// path that unsets a target hash.
    async fn requeue(&self, id: &str, message: &str) -> Result<()>;

    /// Close out a record with a terminal status and optional message.
    async fn finalize(&self, id: &str, status: RecordStatus, message: Option<&str>)
        -> Result<()>;

    /// Completed transfers involving `account` for the given asset, newest
    /// first.
    async fn transfer_history(&self, account: &str, asset: &str) -> Result<Vec<TransferRecord>>;
}

/// Per-chain watcher progress persistence.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn checkpoint(&self, chain: Chain) -> Result<Option<Checkpoint>>;

    /// Overwrite the chain's checkpoint after a fully-processed batch.
    async fn set_checkpoint(&self, chain: Chain, block_height: i64, block_hash: &str)
        -> Result<()>;
}

/// Combined storage seam for components that need records and checkpoints.
pub trait Store: RecordStore + CheckpointStore {}

impl<T: RecordStore + CheckpointStore> Store for T {}

/// SQL SELECT columns for transfer_records (casting NUMERIC to TEXT)
const RECORD_SELECT: &str = r#"id, direction, source_chain, target_chain, asset,
    amount::TEXT as amount, bridge_fee::TEXT as bridge_fee, sender, recipient,
    source_tx_hash, source_block_height, confirm_count, confirm_status,
    target_tx_hash, target_tx_at, status, message, created_at, updated_at"#;

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn insert_record(&self, record: &NewTransferRecord) -> Result<bool> {
        // Duplicate ids come from block replays after a crash before the
        // checkpoint write; they are dropped silently.
        let result = sqlx::query(
            r#"
            INSERT INTO transfer_records (id, direction, source_chain, target_chain, asset,
                amount, sender, recipient, source_tx_hash, source_block_height)
            VALUES ($1, $2, $3, $4, $5, $6::NUMERIC, $7, $8, $9, $10)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&record.id)
        .bind(record.direction)
        .bind(record.source_chain())
        .bind(record.target_chain())
        .bind(&record.asset)
        .bind(&record.amount)
        .bind(&record.sender)
        .bind(&record.recipient)
        .bind(&record.source_tx_hash)
        .bind(record.source_block_height)
        .execute(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to insert transfer record {}", record.id))?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_by_id(&self, id: &str) -> Result<Option<TransferRecord>> {
        let query = format!("SELECT {RECORD_SELECT} FROM transfer_records WHERE id = $1");
        sqlx::query_as::<_, TransferRecord>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .wrap_err_with(|| format!("Failed to get transfer record {id}"))
    }

    async fn records_by_status(
        &self,
        direction: Direction,
        status: RecordStatus,
        limit: i64,
    ) -> Result<Vec<TransferRecord>> {
        let query = format!(
            "SELECT {RECORD_SELECT} FROM transfer_records
             WHERE direction = $1 AND status = $2 AND confirm_status = 'confirmed'
             ORDER BY created_at ASC
             LIMIT $3"
        );
        sqlx::query_as::<_, TransferRecord>(&query)
            .bind(direction)
            .bind(status)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .wrap_err_with(|| format!("Failed to get {status} records"))
    }

    async fn unconfirmed_records(&self, direction: Direction) -> Result<Vec<TransferRecord>> {
        let query = format!(
            "SELECT {RECORD_SELECT} FROM transfer_records
             WHERE direction = $1 AND confirm_status = 'unconfirmed'
             ORDER BY source_block_height ASC"
        );
        sqlx::query_as::<_, TransferRecord>(&query)
            .bind(direction)
            .fetch_all(&self.pool)
            .await
            .wrap_err("Failed to get unconfirmed records")
    }

    async fn update_confirm_count(&self, id: &str, confirm_count: i32) -> Result<()> {
        sqlx::query(
            r#"UPDATE transfer_records SET confirm_count = $1, updated_at = NOW() WHERE id = $2"#,
        )
        .bind(confirm_count)
        .bind(id)
        .execute(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to update confirm count for {id}"))?;

        Ok(())
    }

    async fn promote_confirmed(
        &self,
        id: &str,
        confirm_count: i32,
        bridge_fee: &str,
        status: RecordStatus,
        message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE transfer_records
            SET confirm_status = 'confirmed', confirm_count = $1, bridge_fee = $2::NUMERIC,
                status = $3, message = $4, updated_at = NOW()
            WHERE id = $5 AND confirm_status = 'unconfirmed'
            "#,
        )
        .bind(confirm_count)
        .bind(bridge_fee)
        .bind(status)
        .bind(message)
        .bind(id)
        .execute(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to promote record {id} to confirmed"))?;

        Ok(())
    }

    async fn mark_pending(&self, ids: &[String]) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE transfer_records SET status = 'pending', updated_at = NOW()
            WHERE id = ANY($1) AND status = 'todo'
            "#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await
        .wrap_err("Failed to mark records pending")?;

        Ok(())
    }

    async fn set_target_tx(&self, id: &str, tx_hash: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE transfer_records
            SET target_tx_hash = $1, target_tx_at = NOW(), updated_at = NOW()
            WHERE id = $2 AND target_tx_hash IS NULL
            "#,
        )
        .bind(tx_hash)
        .bind(id)
        .execute(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to set target tx for {id}"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn requeue(&self, id: &str, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE transfer_records
            SET status = 'todo', target_tx_hash = NULL, target_tx_at = NULL,
                message = $1, updated_at = NOW()
            WHERE id = $2 AND status = 'pending'
            "#,
        )
        .bind(message)
        .bind(id)
        .execute(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to requeue record {id}"))?;

        Ok(())
    }

    async fn finalize(
        &self,
        id: &str,
        status: RecordStatus,
        message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE transfer_records SET status = $1, message = $2, updated_at = NOW() WHERE id = $3"#,
        )
        .bind(status)
        .bind(message)
        .bind(id)
        .execute(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to finalize record {id} as {status}"))?;

        Ok(())
    }

    async fn transfer_history(&self, account: &str, asset: &str) -> Result<Vec<TransferRecord>> {
        let query = format!(
            "SELECT {RECORD_SELECT} FROM transfer_records
             WHERE (sender = $1 OR recipient = $1) AND asset = $2
             ORDER BY created_at DESC"
        );
        sqlx::query_as::<_, TransferRecord>(&query)
            .bind(account)
            .bind(asset)
            .fetch_all(&self.pool)
            .await
            .wrap_err("Failed to get transfer history")
    }
}

#[async_trait]
impl CheckpointStore for PgStore {
    async fn checkpoint(&self, chain: Chain) -> Result<Option<Checkpoint>> {
        sqlx::query_as::<_, Checkpoint>(
            r#"SELECT chain, block_height, block_hash FROM checkpoints WHERE chain = $1"#,
        )
        .bind(chain)
        .fetch_optional(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to get {chain} checkpoint"))
    }

    async fn set_checkpoint(
        &self,
        chain: Chain,
        block_height: i64,
        block_hash: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO checkpoints (chain, block_height, block_hash)
            VALUES ($1, $2, $3)
            ON CONFLICT (chain) DO UPDATE SET block_height = $2, block_hash = $3, updated_at = NOW()
            "#,
        )
        .bind(chain)
        .bind(block_height)
        .bind(block_hash)
        .execute(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to update {chain} checkpoint"))?;

        Ok(())
    }
}
