//! In-memory node and block builders for pipeline tests.
//!
//! Compiled for this crate's tests and, through the `test-utils` feature,
//! for the adapter crates' integration tests.

use std::collections::{BTreeMap, HashMap};

use alloy_primitives::{Address, B256, Bytes, U256, keccak256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::{NodeError, NodeResult};
use crate::models::{
    Block, BlockHash, BlockRef, CallFrame, CallKind, CallTrace, Log, Signature, Transaction,
    TransactionReceipt, TxHash,
};
use crate::ports::NodeClient;

/// Gas charged by [`TestBlock::with_transfer`].
pub const TRANSFER_GAS: u64 = 21_000;

// =============================================================================
// Block Builders
// =============================================================================

/// A block together with everything the node serves about it.
#[derive(Debug, Clone)]
pub struct TestBlock {
    pub block: Block,
    pub receipts: Vec<TransactionReceipt>,
    pub traces: Vec<CallTrace>,
}

impl TestBlock {
    /// Empty block on branch `fork`; hashes differ between forks.
    pub fn new(number: u64, parent_hash: BlockHash, fork: u8) -> Self {
        Self {
            block: Block {
                number,
                hash: keccak256(format!("block-{fork}-{number}")),
                parent_hash,
                timestamp: DateTime::<Utc>::from_timestamp(1_600_000_000 + number as i64 * 12, 0)
                    .unwrap_or_default(),
                miner: Address::with_last_byte(fork),
                gas_used: 0,
                gas_limit: 30_000_000,
                base_fee_per_gas: None,
                ommers: Vec::new(),
                transactions: Vec::new(),
            },
            receipts: Vec::new(),
            traces: Vec::new(),
        }
    }

    /// Append a transaction with its receipt and trace.
    pub fn with_transaction(
        mut self,
        mut tx: Transaction,
        mut receipt: TransactionReceipt,
        trace: CallTrace,
    ) -> Self {
        let index = self.block.transactions.len() as u32;
        tx.index = index;
        tx.block_hash = self.block.hash;
        receipt.transaction_hash = tx.hash;
        self.block.gas_used += receipt.gas_used;
        receipt.cumulative_gas_used = self.block.gas_used;
        self.block.transactions.push(tx);
        self.receipts.push(receipt);
        self.traces.push(trace);
        self
    }

    /// Append a successful plain value transfer paying one wei per gas.
    pub fn with_transfer(self, from: Address, to: Address, value: u64) -> Self {
        let tx = self.transaction(from, Some(to), value);
        let receipt = receipt(tx.hash, true, TRANSFER_GAS);
        let trace = CallTrace::new(CallFrame::new(CallKind::Call, from, Some(to), tx.value));
        self.with_transaction(tx, receipt, trace)
    }

    /// Unsigned transaction whose hash is unique to this block and position.
    pub fn transaction(&self, from: Address, to: Option<Address>, value: u64) -> Transaction {
        let index = self.block.transactions.len();
        Transaction {
            hash: keccak256(format!("tx-{}-{index}", self.block.hash)),
            block_hash: self.block.hash,
            index: index as u32,
            from,
            to,
            value: U256::from(value),
            nonce: index as u64,
            gas_price: U256::from(1),
            gas_limit: 100_000,
            input: Bytes::new(),
            signature: Signature::default(),
        }
    }

    pub fn id(&self) -> crate::models::BlockId {
        self.block.id()
    }
}

/// Receipt with no logs.
pub fn receipt(tx_hash: TxHash, success: bool, gas_used: u64) -> TransactionReceipt {
    TransactionReceipt {
        transaction_hash: tx_hash,
        success,
        gas_used,
        cumulative_gas_used: gas_used,
        effective_gas_price: None,
        contract_address: None,
        revert_reason: None,
        logs: Vec::new(),
    }
}

/// Log emitted by `address`.
pub fn log(address: Address, topics: Vec<B256>, data: impl Into<Bytes>, log_index: u32) -> Log {
    Log {
        address,
        topics,
        data: data.into(),
        log_index,
    }
}

/// `count` linked blocks on branch `fork` starting at `from`, each shaped by `fill`.
pub fn chain(
    fork: u8,
    parent: Option<&Block>,
    from: u64,
    count: usize,
    fill: impl Fn(TestBlock) -> TestBlock,
) -> Vec<TestBlock> {
    let mut parent_hash = parent.map(|p| p.hash).unwrap_or_default();
    let mut blocks = Vec::with_capacity(count);
    for number in from..from + count as u64 {
        let block = fill(TestBlock::new(number, parent_hash, fork));
        parent_hash = block.block.hash;
        blocks.push(block);
    }
    blocks
}

// =============================================================================
// Scripted Node
// =============================================================================

#[derive(Default)]
struct Script {
    canonical: BTreeMap<u64, BlockHash>,
    blocks: HashMap<BlockHash, Block>,
    receipts: HashMap<BlockHash, Vec<TransactionReceipt>>,
    traces: HashMap<TxHash, CallTrace>,
    code: HashMap<Address, Bytes>,
    failures: HashMap<&'static str, u32>,
    calls: HashMap<&'static str, u32>,
}

/// Node serving a swappable canonical chain from memory.
///
/// Blocks stay reachable by hash after their branch is replaced, as on a
/// real node that still knows recent ommers.
pub struct ScriptedNode {
    chain_id: u64,
    script: Mutex<Script>,
}

impl ScriptedNode {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            script: Mutex::new(Script::default()),
        }
    }

    /// Make `blocks` the canonical chain, dropping any higher canonical block.
    pub fn set_chain(&self, blocks: &[TestBlock]) {
        let mut script = self.script.lock();
        script.canonical.clear();
        for block in blocks {
            Self::register(&mut script, block);
        }
    }

    /// Extend the canonical chain.
    pub fn push(&self, block: &TestBlock) {
        Self::register(&mut self.script.lock(), block);
    }

    pub fn set_code(&self, address: Address, code: impl Into<Bytes>) {
        self.script.lock().code.insert(address, code.into());
    }

    /// Fail the next `times` calls of `operation` with `NodeError::Unavailable`.
    pub fn fail_next(&self, operation: &'static str, times: u32) {
        self.script.lock().failures.insert(operation, times);
    }

    /// Calls received for `operation`, failed ones included.
    pub fn calls(&self, operation: &'static str) -> u32 {
        self.script.lock().calls.get(operation).copied().unwrap_or(0)
    }

    fn register(script: &mut Script, block: &TestBlock) {
        let hash = block.block.hash;
        script.canonical.insert(block.block.number, hash);
        script.blocks.insert(hash, block.block.clone());
        script.receipts.insert(hash, block.receipts.clone());
        for (tx, trace) in block.block.transactions.iter().zip(&block.traces) {
            script.traces.insert(tx.hash, trace.clone());
        }
    }

    fn enter(&self, operation: &'static str) -> NodeResult<parking_lot::MutexGuard<'_, Script>> {
        let mut script = self.script.lock();
        *script.calls.entry(operation).or_default() += 1;
        if let Some(remaining) = script.failures.get_mut(operation)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(NodeError::Unavailable(format!("scripted {operation} failure")));
        }
        Ok(script)
    }
}

#[async_trait]
impl NodeClient for ScriptedNode {
    async fn chain_id(&self) -> NodeResult<u64> {
        let _script = self.enter("chain_id")?;
        Ok(self.chain_id)
    }

    async fn latest_block_number(&self) -> NodeResult<u64> {
        let script = self.enter("latest_block_number")?;
        script
            .canonical
            .last_key_value()
            .map(|(number, _)| *number)
            .ok_or_else(|| NodeError::NotFound("empty chain".into()))
    }

    async fn get_block(&self, block: BlockRef) -> NodeResult<Block> {
        let script = self.enter("get_block")?;
        let hash = match block {
            BlockRef::Number(number) => script.canonical.get(&number).copied(),
            BlockRef::Hash(hash) => Some(hash),
        };
        hash.and_then(|h| script.blocks.get(&h).cloned())
            .ok_or_else(|| NodeError::NotFound(format!("block {block}")))
    }

    async fn get_trace(&self, tx_hash: TxHash) -> NodeResult<CallTrace> {
        let script = self.enter("get_trace")?;
        script
            .traces
            .get(&tx_hash)
            .cloned()
            .ok_or_else(|| NodeError::NotFound(format!("trace {tx_hash}")))
    }

    async fn get_receipts(&self, block_hash: BlockHash) -> NodeResult<Vec<TransactionReceipt>> {
        let script = self.enter("get_receipts")?;
        script
            .receipts
            .get(&block_hash)
            .cloned()
            .ok_or_else(|| NodeError::NotFound(format!("receipts {block_hash}")))
    }

    async fn get_code(&self, address: Address, _block_number: u64) -> NodeResult<Bytes> {
        let script = self.enter("get_code")?;
        Ok(script.code.get(&address).cloned().unwrap_or_default())
    }
}
