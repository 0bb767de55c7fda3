//! PostgreSQL storage adapter.
//!
//! This module implements the [`BlockWriter`] port defined in
//! `tributary-core` using PostgreSQL as the backing store.
//!
//! # Architecture
//!
//! - [`Database`] - Connection pool, migrations and purge
//! - [`PgBlockWriter`] - Writer committing each block in one transaction
//! - Per-table query functions grouped by concern (blocks, traces, tokens,
//!   balances, import progress)
//!
//! # Usage
//!
//! ```ignore
//! let config = DatabaseConfig::for_indexer(&database_url);
//! let db = Database::connect(&config).await?;
//! db.migrate().await?;
//!
//! let writer = PgBlockWriter::new(Arc::new(db));
//! ```

mod balance_repo;
mod block_repo;
mod database;
mod helpers;
mod import_repo;
mod token_repo;
mod trace_repo;

pub use database::{Database, DatabaseConfig, PurgeStats};

use std::collections::BTreeMap;
use std::sync::Arc;

use alloy_primitives::{Address, B256, I256};
use async_trait::async_trait;
use sqlx::{PgConnection, Postgres, Transaction};
use tracing::{debug, instrument};

use tributary_core::codec::TraceArchive;
use tributary_core::error::{StorageError, StorageResult};
use tributary_core::models::{
    BlockId, ContractCapabilities, ImportQueueEntry, IndexerCursor, NormalizedBlock, TxHash,
};
use tributary_core::ports::BlockWriter;

// =============================================================================
// PgBlockWriter
// =============================================================================

/// PostgreSQL implementation of [`BlockWriter`].
///
/// Every block commit and every reorg runs in a single repeatable-read
/// transaction; a concurrent writer surfaces as
/// [`StorageError::WriteConflict`] and the whole commit is retried.
pub struct PgBlockWriter {
    db: Arc<Database>,
}

impl PgBlockWriter {
    /// Create a writer over a database connection.
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Trace products archived for a block.
    pub async fn trace_archive(&self, block_hash: &B256) -> StorageResult<Option<TraceArchive>> {
        trace_repo::get_archive(self.db.pool(), block_hash).await
    }

    async fn begin(&self) -> StorageResult<Transaction<'static, Postgres>> {
        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))?;

        Ok(tx)
    }

    async fn write_block(conn: &mut PgConnection, block: &NormalizedBlock) -> StorageResult<()> {
        let number = block.block.number;
        let tx_hashes: Vec<TxHash> = block.block.transactions.iter().map(|tx| tx.hash).collect();

        block_repo::upsert_block(conn, &block.block).await?;
        block_repo::upsert_accounts(conn, &block.accounts).await?;
        block_repo::upsert_transactions(conn, number, &block.block.transactions).await?;
        trace_repo::clear_derived(conn, &tx_hashes).await?;
        block_repo::upsert_receipts(conn, &block.receipts).await?;

        trace_repo::insert_internal_transactions(conn, &block.internal_transactions).await?;
        trace_repo::upsert_created_contracts(conn, number, &block.contracts_created).await?;
        trace_repo::insert_classified_contracts(conn, &block.classified_contracts).await?;
        trace_repo::insert_destructions(conn, &block.contracts_destroyed).await?;
        trace_repo::upsert_archive(conn, block).await?;

        token_repo::insert_token_transfers(conn, &block.token_transfers).await?;
        token_repo::insert_contract_events(conn, &block.contract_events).await?;

        balance_repo::insert_rewards(conn, &block.rewards).await?;
        balance_repo::insert_deltas(conn, &block.balance_deltas).await?;

        import_repo::demote_siblings(conn, &block.import.id()).await?;
        import_repo::upsert_entry(conn, &block.import).await?;
        import_repo::upsert_cursor(conn, &block.cursor).await?;
        Ok(())
    }
}

#[async_trait]
impl BlockWriter for PgBlockWriter {
    #[instrument(skip(self, block), fields(block = block.block.number))]
    async fn commit_block(&self, block: &NormalizedBlock) -> StorageResult<()> {
        let mut tx = self.begin().await?;

        Self::write_block(&mut tx, block).await?;

        tx.commit().await.map_err(|e| match helpers::map_write_error(e) {
            StorageError::QueryError(msg) => StorageError::TransactionError(msg),
            other => other,
        })?;

        debug!(
            deltas = block.balance_deltas.len(),
            events = block.contract_events.len(),
            "Block rows written"
        );
        Ok(())
    }

    async fn get_import_status(&self, number: u64) -> StorageResult<Option<ImportQueueEntry>> {
        import_repo::get_entry(self.db.pool(), number).await
    }

    async fn record_import_status(&self, entry: &ImportQueueEntry) -> StorageResult<()> {
        let mut conn = self
            .db
            .pool()
            .acquire()
            .await
            .map_err(|e| StorageError::ConnectionError(e.to_string()))?;
        import_repo::upsert_entry(&mut conn, entry).await
    }

    #[instrument(skip(self))]
    async fn mark_reorg(&self, ancestor: &BlockId, chain_id: u64) -> StorageResult<u64> {
        let mut tx = self.begin().await?;

        let orphaned = block_repo::demote_above(&mut tx, ancestor.number).await?;
        let entries = import_repo::demote_entries_above(&mut tx, ancestor.number).await?;
        import_repo::upsert_cursor(
            &mut tx,
            &IndexerCursor {
                chain_id,
                last_block: ancestor.number,
                last_hash: ancestor.hash,
                updated_at: chrono::Utc::now(),
            },
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))?;

        debug!(orphaned, entries, "Branch flagged as ommers");
        Ok(orphaned)
    }

    async fn canonical_block(&self, number: u64) -> StorageResult<Option<BlockId>> {
        block_repo::canonical_block(self.db.pool(), number).await
    }

    async fn get_cursor(&self, chain_id: u64) -> StorageResult<Option<IndexerCursor>> {
        import_repo::get_cursor(self.db.pool(), chain_id).await
    }

    async fn get_any_cursor(&self) -> StorageResult<Option<IndexerCursor>> {
        import_repo::get_any_cursor(self.db.pool()).await
    }

    async fn capabilities(&self, address: &Address) -> StorageResult<Option<ContractCapabilities>> {
        trace_repo::capabilities(self.db.pool(), address).await
    }

    async fn canonical_balances(&self) -> StorageResult<BTreeMap<Address, I256>> {
        balance_repo::canonical_balances(self.db.pool()).await
    }
}
