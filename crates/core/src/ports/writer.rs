//! Port trait for the persistence writer.
//!
//! These traits define the storage interface used by the domain layer.
//! Implementations live in the infrastructure layer (e.g., `tributary-storage`).

use std::collections::BTreeMap;

use alloy_primitives::{Address, I256};
use async_trait::async_trait;

use crate::error::StorageResult;
use crate::models::{
    BlockId, ContractCapabilities, ImportQueueEntry, IndexerCursor, NormalizedBlock,
};

/// Persistence collaborator.
///
/// All writes are upserts keyed by natural keys (block hash, transaction
/// hash, transaction hash + log index), so reapplying a block is harmless.
#[async_trait]
pub trait BlockWriter: Send + Sync {
    /// Atomically persist every row derived from one block, mark it canonical,
    /// record its import entry as committed and advance the cursor.
    ///
    /// Either all of it lands or none of it does.
    async fn commit_block(&self, block: &NormalizedBlock) -> StorageResult<()>;

    /// Canonical (or most recent) import entry for a height.
    async fn get_import_status(&self, number: u64) -> StorageResult<Option<ImportQueueEntry>>;

    /// Upsert an import entry outside of a block commit.
    async fn record_import_status(&self, entry: &ImportQueueEntry) -> StorageResult<()>;

    /// Flag every canonical block above `ancestor` as an ommer and rewind the
    /// cursor to `ancestor`. Nothing is deleted.
    ///
    /// Returns the number of blocks flagged.
    async fn mark_reorg(&self, ancestor: &BlockId, chain_id: u64) -> StorageResult<u64>;

    /// Canonical block stored at a height.
    async fn canonical_block(&self, number: u64) -> StorageResult<Option<BlockId>>;

    /// Cursor of a chain.
    async fn get_cursor(&self, chain_id: u64) -> StorageResult<Option<IndexerCursor>>;

    /// Any cursor, used to detect a store filled from another chain.
    async fn get_any_cursor(&self) -> StorageResult<Option<IndexerCursor>>;

    /// Capabilities already known for a contract.
    async fn capabilities(&self, address: &Address) -> StorageResult<Option<ContractCapabilities>>;

    /// Net balance of every account over canonical blocks only.
    async fn canonical_balances(&self) -> StorageResult<BTreeMap<Address, I256>>;
}
