//! In-memory [`BlockWriter`].
//!
//! Mirrors the PostgreSQL schema with ordered maps keyed like the tables'
//! primary keys, and applies the same upsert and canonical-flag rules. A
//! commit holds the write lock from first to last row, so readers see a
//! block either entirely or not at all.

use std::collections::{BTreeMap, HashMap};

use alloy_primitives::{Address, B256, I256};
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, instrument};

use tributary_core::codec::{self, TraceArchive};
use tributary_core::error::{StorageError, StorageResult};
use tributary_core::models::{
    Account, BalanceDelta, Block, BlockHash, BlockId, ContractCapabilities, ContractCreated,
    ContractDestroyed, ContractEvent, ContractType, ImportQueueEntry, IndexerCursor,
    InternalTransaction, NormalizedBlock, Reward, TokenTransfer, TransactionReceipt, TxHash,
};
use tributary_core::ports::BlockWriter;

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredBlock {
    block: Block,
    canonical: bool,
}

/// Contract row: a creation, or a classification of an older contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredContract {
    pub capabilities: ContractCapabilities,
    pub contract_type: ContractType,
    pub created: Option<ContractCreated>,
}

type Key = (TxHash, u32);

/// Full state of a [`MemoryWriter`], comparable across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    blocks: HashMap<BlockHash, StoredBlock>,
    transactions: HashMap<TxHash, BlockHash>,
    receipts: HashMap<TxHash, TransactionReceipt>,
    accounts: BTreeMap<Address, Account>,
    internal_transactions: BTreeMap<Key, InternalTransaction>,
    contracts: BTreeMap<Address, StoredContract>,
    destructions: BTreeMap<Key, ContractDestroyed>,
    archives: HashMap<BlockHash, Vec<u8>>,
    token_transfers: BTreeMap<Key, TokenTransfer>,
    contract_events: BTreeMap<Key, ContractEvent>,
    rewards: BTreeMap<(BlockHash, BlockHash), Reward>,
    deltas: BTreeMap<(BlockHash, u32), BalanceDelta>,
    import_queue: BTreeMap<(u64, BlockHash), ImportQueueEntry>,
    cursors: BTreeMap<u64, IndexerCursor>,
}

impl Snapshot {
    fn demote_height(&mut self, number: u64, keep: &BlockHash) {
        for stored in self.blocks.values_mut() {
            if stored.block.number == number && stored.block.hash != *keep {
                stored.canonical = false;
            }
        }
        for ((n, hash), entry) in self.import_queue.iter_mut() {
            if *n == number && hash != keep {
                entry.canonical = false;
            }
        }
    }

    fn clear_derived(&mut self, tx_hashes: &[TxHash]) {
        let touched = |key: &Key| tx_hashes.contains(&key.0);
        self.internal_transactions.retain(|key, _| !touched(key));
        self.destructions.retain(|key, _| !touched(key));
        self.token_transfers.retain(|key, _| !touched(key));
        self.contract_events.retain(|key, _| !touched(key));
    }

    fn apply(&mut self, block: &NormalizedBlock, archive: Vec<u8>) {
        let hash = block.block.hash;
        let number = block.block.number;

        self.demote_height(number, &hash);
        self.blocks.insert(
            hash,
            StoredBlock {
                block: block.block.clone(),
                canonical: true,
            },
        );

        for account in &block.accounts {
            self.accounts
                .entry(account.address)
                .and_modify(|stored| {
                    stored.first_seen_block = stored.first_seen_block.min(account.first_seen_block);
                    if account.destroyed_block.is_some() {
                        stored.destroyed_block = account.destroyed_block;
                    }
                })
                .or_insert_with(|| account.clone());
        }

        let tx_hashes: Vec<TxHash> = block.block.transactions.iter().map(|tx| tx.hash).collect();
        for tx_hash in &tx_hashes {
            self.transactions.insert(*tx_hash, hash);
        }
        self.clear_derived(&tx_hashes);
        for receipt in &block.receipts {
            self.receipts.insert(receipt.transaction_hash, receipt.clone());
        }

        for internal in &block.internal_transactions {
            self.internal_transactions
                .insert((internal.transaction_hash, internal.pc), internal.clone());
        }
        for created in &block.contracts_created {
            self.contracts.insert(
                created.address,
                StoredContract {
                    capabilities: created.capabilities,
                    contract_type: created.contract_type,
                    created: Some(created.clone()),
                },
            );
        }
        for classified in &block.classified_contracts {
            self.contracts
                .entry(classified.address)
                .or_insert_with(|| StoredContract {
                    capabilities: classified.capabilities,
                    contract_type: classified.contract_type,
                    created: None,
                });
        }
        for destroyed in &block.contracts_destroyed {
            self.destructions
                .insert((destroyed.transaction_hash, destroyed.pc), destroyed.clone());
        }
        self.archives.insert(hash, archive);

        for transfer in &block.token_transfers {
            self.token_transfers
                .insert((transfer.transaction_hash, transfer.log_index), transfer.clone());
        }
        for event in &block.contract_events {
            self.contract_events
                .insert((event.transaction_hash, event.log_index), event.clone());
        }

        for reward in &block.rewards {
            self.rewards
                .entry((reward.block_hash, reward.hash))
                .or_insert_with(|| reward.clone());
        }
        for delta in &block.balance_deltas {
            self.deltas
                .entry((delta.block_hash, delta.index))
                .or_insert_with(|| delta.clone());
        }

        self.import_queue
            .insert((block.import.number, block.import.hash), block.import.clone());
        self.cursors.insert(block.cursor.chain_id, block.cursor.clone());
    }
}

// =============================================================================
// MemoryWriter
// =============================================================================

/// [`BlockWriter`] keeping everything in process memory.
#[derive(Default)]
pub struct MemoryWriter {
    state: RwLock<Snapshot>,
    failing_commits: RwLock<u32>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `count` commits with [`StorageError::WriteConflict`].
    pub fn fail_commits(&self, count: u32) {
        *self.failing_commits.write() = count;
    }

    pub fn snapshot(&self) -> Snapshot {
        self.state.read().clone()
    }

    /// Whether a stored block is canonical; `None` if it was never stored.
    pub fn is_canonical(&self, hash: &BlockHash) -> Option<bool> {
        self.state.read().blocks.get(hash).map(|b| b.canonical)
    }

    /// Stored blocks, ommers included.
    pub fn block_count(&self) -> usize {
        self.state.read().blocks.len()
    }

    /// Canonical blocks in height order.
    pub fn canonical_chain(&self) -> Vec<BlockId> {
        let state = self.state.read();
        let mut chain: Vec<BlockId> = state
            .blocks
            .values()
            .filter(|b| b.canonical)
            .map(|b| b.block.id())
            .collect();
        chain.sort_by_key(|id| id.number);
        chain
    }

    /// Block a transaction currently belongs to.
    pub fn transaction_block(&self, tx_hash: &TxHash) -> Option<BlockHash> {
        self.state.read().transactions.get(tx_hash).copied()
    }

    pub fn receipt(&self, tx_hash: &TxHash) -> Option<TransactionReceipt> {
        self.state.read().receipts.get(tx_hash).cloned()
    }

    pub fn account(&self, address: &Address) -> Option<Account> {
        self.state.read().accounts.get(address).cloned()
    }

    pub fn contract(&self, address: &Address) -> Option<StoredContract> {
        self.state.read().contracts.get(address).cloned()
    }

    pub fn internal_transactions(&self) -> Vec<InternalTransaction> {
        self.state.read().internal_transactions.values().cloned().collect()
    }

    pub fn token_transfers(&self) -> Vec<TokenTransfer> {
        self.state.read().token_transfers.values().cloned().collect()
    }

    pub fn contract_events(&self) -> Vec<ContractEvent> {
        self.state.read().contract_events.values().cloned().collect()
    }

    /// Deltas of every stored block, ommers included.
    pub fn delta_count(&self) -> usize {
        self.state.read().deltas.len()
    }

    /// Decode the trace archive stored for a block.
    pub fn trace_archive(&self, block_hash: &BlockHash) -> StorageResult<Option<TraceArchive>> {
        self.state
            .read()
            .archives
            .get(block_hash)
            .map(|bytes| {
                codec::decode(bytes).map_err(|e| StorageError::SerializationError(e.to_string()))
            })
            .transpose()
    }
}

#[async_trait]
impl BlockWriter for MemoryWriter {
    #[instrument(skip(self, block), fields(block = block.block.number))]
    async fn commit_block(&self, block: &NormalizedBlock) -> StorageResult<()> {
        {
            let mut failing = self.failing_commits.write();
            if *failing > 0 {
                *failing -= 1;
                return Err(StorageError::WriteConflict(format!(
                    "injected conflict on block {}",
                    block.block.number
                )));
            }
        }

        let archive = codec::encode(&TraceArchive::of(block))
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        self.state.write().apply(block, archive);
        debug!(deltas = block.balance_deltas.len(), "Block rows written");
        Ok(())
    }

    async fn get_import_status(&self, number: u64) -> StorageResult<Option<ImportQueueEntry>> {
        let state = self.state.read();
        Ok(state
            .import_queue
            .range((number, B256::ZERO)..=(number, B256::repeat_byte(0xff)))
            .map(|(_, entry)| entry)
            .max_by_key(|entry| (entry.canonical, entry.updated_at))
            .cloned())
    }

    async fn record_import_status(&self, entry: &ImportQueueEntry) -> StorageResult<()> {
        self.state
            .write()
            .import_queue
            .insert((entry.number, entry.hash), entry.clone());
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_reorg(&self, ancestor: &BlockId, chain_id: u64) -> StorageResult<u64> {
        let mut state = self.state.write();

        let mut orphaned = 0;
        for stored in state.blocks.values_mut() {
            if stored.block.number > ancestor.number && stored.canonical {
                stored.canonical = false;
                orphaned += 1;
            }
        }
        for ((number, _), entry) in state.import_queue.iter_mut() {
            if *number > ancestor.number {
                entry.canonical = false;
            }
        }
        state.cursors.insert(
            chain_id,
            IndexerCursor {
                chain_id,
                last_block: ancestor.number,
                last_hash: ancestor.hash,
                updated_at: chrono::Utc::now(),
            },
        );

        debug!(orphaned, "Branch flagged as ommers");
        Ok(orphaned)
    }

    async fn canonical_block(&self, number: u64) -> StorageResult<Option<BlockId>> {
        Ok(self
            .state
            .read()
            .blocks
            .values()
            .find(|b| b.canonical && b.block.number == number)
            .map(|b| b.block.id()))
    }

    async fn get_cursor(&self, chain_id: u64) -> StorageResult<Option<IndexerCursor>> {
        Ok(self.state.read().cursors.get(&chain_id).cloned())
    }

    async fn get_any_cursor(&self) -> StorageResult<Option<IndexerCursor>> {
        Ok(self
            .state
            .read()
            .cursors
            .values()
            .max_by_key(|cursor| cursor.updated_at)
            .cloned())
    }

    async fn capabilities(&self, address: &Address) -> StorageResult<Option<ContractCapabilities>> {
        Ok(self
            .state
            .read()
            .contracts
            .get(address)
            .map(|c| c.capabilities))
    }

    async fn canonical_balances(&self) -> StorageResult<BTreeMap<Address, I256>> {
        let state = self.state.read();
        let mut balances: BTreeMap<Address, I256> = BTreeMap::new();
        for delta in state.deltas.values() {
            let canonical = state
                .blocks
                .get(&delta.block_hash)
                .is_some_and(|b| b.canonical);
            if canonical {
                let balance = balances.entry(delta.account).or_insert(I256::ZERO);
                *balance += delta.amount;
            }
        }
        balances.retain(|_, balance| !balance.is_zero());
        Ok(balances)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;
    use chrono::Utc;
    use tributary_core::models::{DeltaReason, ImportStatus, TransferValue};
    use tributary_core::testing::TestBlock;

    fn normalized(test: &TestBlock, chain_id: u64, deltas: &[(Address, i64)]) -> NormalizedBlock {
        let block = &test.block;
        let mut import = ImportQueueEntry::pending(block.id());
        import.status = ImportStatus::Committed;
        import.attempts = 1;
        NormalizedBlock {
            block: block.clone(),
            receipts: test.receipts.clone(),
            internal_transactions: Vec::new(),
            contracts_created: Vec::new(),
            contracts_destroyed: Vec::new(),
            classified_contracts: Vec::new(),
            token_transfers: Vec::new(),
            contract_events: Vec::new(),
            rewards: Vec::new(),
            balance_deltas: deltas
                .iter()
                .enumerate()
                .map(|(index, (account, amount))| BalanceDelta {
                    block_hash: block.hash,
                    block_number: block.number,
                    index: index as u32,
                    account: *account,
                    amount: I256::try_from(*amount).unwrap(),
                    reason: DeltaReason::Transfer,
                    transaction_hash: None,
                })
                .collect(),
            accounts: Vec::new(),
            import,
            cursor: IndexerCursor {
                chain_id,
                last_block: block.number,
                last_hash: block.hash,
                updated_at: Utc::now(),
            },
        }
    }

    fn alice() -> Address {
        Address::repeat_byte(0xa1)
    }

    fn bob() -> Address {
        Address::repeat_byte(0xb0)
    }

    // Test critique: seuls les blocs canoniques comptent dans les soldes
    #[tokio::test]
    async fn test_reorg_excludes_orphaned_deltas() {
        let writer = MemoryWriter::new();
        let b1 = TestBlock::new(1, B256::ZERO, 1);
        let b2 = TestBlock::new(2, b1.block.hash, 1);
        writer.commit_block(&normalized(&b1, 1, &[(alice(), 10)])).await.unwrap();
        writer
            .commit_block(&normalized(&b2, 1, &[(alice(), -4), (bob(), 4)]))
            .await
            .unwrap();

        let balances = writer.canonical_balances().await.unwrap();
        assert_eq!(balances[&alice()], I256::try_from(6).unwrap());

        let orphaned = writer.mark_reorg(&b1.id(), 1).await.unwrap();
        assert_eq!(orphaned, 1);
        assert_eq!(writer.is_canonical(&b2.block.hash), Some(false));
        // Rien n'est supprimé
        assert_eq!(writer.block_count(), 2);
        assert_eq!(writer.delta_count(), 3);

        let balances = writer.canonical_balances().await.unwrap();
        assert_eq!(balances[&alice()], I256::try_from(10).unwrap());
        assert!(!balances.contains_key(&bob()));
        assert_eq!(writer.get_cursor(1).await.unwrap().unwrap().head(), b1.id());
    }

    #[tokio::test]
    async fn test_commit_replaces_sibling_at_same_height() {
        let writer = MemoryWriter::new();
        let a = TestBlock::new(1, B256::ZERO, 1);
        let b = TestBlock::new(1, B256::ZERO, 2);
        writer.commit_block(&normalized(&a, 1, &[])).await.unwrap();
        writer.commit_block(&normalized(&b, 1, &[])).await.unwrap();

        assert_eq!(writer.is_canonical(&a.block.hash), Some(false));
        assert_eq!(writer.canonical_block(1).await.unwrap(), Some(b.id()));

        let status = writer.get_import_status(1).await.unwrap().unwrap();
        assert_eq!(status.hash, b.block.hash);
        assert!(status.canonical);
    }

    // Test critique: appliquer deux fois le même bloc ne change rien
    #[tokio::test]
    async fn test_commit_is_idempotent() {
        let writer = MemoryWriter::new();
        let block = TestBlock::new(3, B256::ZERO, 1).with_transfer(alice(), bob(), 7);
        let mut normalized = normalized(&block, 1, &[(alice(), -7), (bob(), 7)]);
        normalized.token_transfers.push(TokenTransfer {
            transaction_hash: block.block.transactions[0].hash,
            log_index: 0,
            contract: Address::repeat_byte(0xcc),
            from: alice(),
            to: bob(),
            value: TransferValue::Fungible {
                amount: U256::from(1),
            },
        });

        writer.commit_block(&normalized).await.unwrap();
        let first = writer.snapshot();
        writer.commit_block(&normalized).await.unwrap();
        assert_eq!(writer.snapshot(), first);
        assert_eq!(writer.token_transfers().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_conflicts_write_nothing() {
        let writer = MemoryWriter::new();
        let block = TestBlock::new(1, B256::ZERO, 1);
        writer.fail_commits(1);

        let err = writer
            .commit_block(&normalized(&block, 1, &[]))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(writer.block_count(), 0);
        assert!(writer.get_cursor(1).await.unwrap().is_none());

        writer.commit_block(&normalized(&block, 1, &[])).await.unwrap();
        assert_eq!(writer.block_count(), 1);
    }

    #[tokio::test]
    async fn test_trace_archive_roundtrip() {
        let writer = MemoryWriter::new();
        let block = TestBlock::new(1, B256::ZERO, 1).with_transfer(alice(), bob(), 1);
        let mut normalized = normalized(&block, 1, &[]);
        normalized.internal_transactions.push(InternalTransaction {
            transaction_hash: block.block.transactions[0].hash,
            pc: 1,
            from: bob(),
            to: alice(),
            amount: U256::from(1),
        });
        writer.commit_block(&normalized).await.unwrap();

        let archive = writer.trace_archive(&block.block.hash).unwrap().unwrap();
        assert_eq!(archive.internal_transactions, normalized.internal_transactions);
        assert!(writer.trace_archive(&B256::repeat_byte(1)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_any_cursor_reports_foreign_chain() {
        let writer = MemoryWriter::new();
        let block = TestBlock::new(1, B256::ZERO, 1);
        writer.commit_block(&normalized(&block, 5, &[])).await.unwrap();

        assert!(writer.get_cursor(1).await.unwrap().is_none());
        assert_eq!(writer.get_any_cursor().await.unwrap().unwrap().chain_id, 5);
    }
}
