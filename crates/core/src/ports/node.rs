//! Port trait for the blockchain node.
//!
//! This trait defines the interface for fetching blocks, receipts, call
//! traces and historical bytecode. Implementations live in the
//! infrastructure layer (e.g., `tributary-rpc`).

use alloy_primitives::{Address, Bytes};
use async_trait::async_trait;

use crate::error::NodeResult;
use crate::models::{Block, BlockHash, BlockRef, CallTrace, TransactionReceipt, TxHash};

/// Port trait for the node collaborator.
///
/// The node is trusted: blocks it returns are assumed valid.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// EIP-155 chain id of the connected network.
    async fn chain_id(&self) -> NodeResult<u64>;

    /// Height of the node's current head.
    async fn latest_block_number(&self) -> NodeResult<u64>;

    /// Block with full transactions and ommer headers.
    ///
    /// Unknown blocks are reported as [`NodeError::NotFound`](crate::error::NodeError::NotFound).
    async fn get_block(&self, block: BlockRef) -> NodeResult<Block>;

    /// Call tree of one transaction.
    async fn get_trace(&self, tx_hash: TxHash) -> NodeResult<CallTrace>;

    /// Receipts of every transaction in the block, in transaction order.
    async fn get_receipts(&self, block_hash: BlockHash) -> NodeResult<Vec<TransactionReceipt>>;

    /// Bytecode at `address` as of `block_number`.
    async fn get_code(&self, address: Address, block_number: u64) -> NodeResult<Bytes>;
}
