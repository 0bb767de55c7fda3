//! Domain models representing normalized chain data.
//!
//! These models are storage-agnostic and represent the canonical
//! form of indexed data within the domain layer.

mod capability;
mod trace;

pub use capability::{Capability, ContractCapabilities, ContractType};
pub use trace::{CallFrame, CallKind, CallTrace, FrameId};

use std::fmt;

use alloy_primitives::{Address, B256, Bytes, I256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 32-byte block hash (Keccak-256).
pub type BlockHash = B256;

/// 32-byte transaction hash (Keccak-256).
pub type TxHash = B256;

// =============================================================================
// Block Identification
// =============================================================================

/// Unique identifier for a block, combining number and hash for fork safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId {
    pub number: u64,
    pub hash: BlockHash,
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.number, self.hash)
    }
}

/// How a block is requested from the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRef {
    Number(u64),
    Hash(BlockHash),
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "#{n}"),
            Self::Hash(h) => write!(f, "{h}"),
        }
    }
}

// =============================================================================
// Block & Chain Data
// =============================================================================

/// Header fields of an ommer referenced by a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmmerHeader {
    pub hash: BlockHash,
    pub number: u64,
    pub miner: Address,
}

/// Block as delivered by the node, with full transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block number (height). Not unique across forks.
    pub number: u64,
    pub hash: BlockHash,
    pub parent_hash: BlockHash,
    pub timestamp: DateTime<Utc>,
    /// Beneficiary of rewards and priority fees.
    pub miner: Address,
    pub gas_used: u64,
    pub gas_limit: u64,
    /// EIP-1559 base fee; burned per unit of gas when present.
    pub base_fee_per_gas: Option<U256>,
    pub ommers: Vec<OmmerHeader>,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn id(&self) -> BlockId {
        BlockId {
            number: self.number,
            hash: self.hash,
        }
    }
}

// =============================================================================
// Transactions & Receipts
// =============================================================================

/// ECDSA signature components.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub v: u64,
    pub r: U256,
    pub s: U256,
}

/// Top-level transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: TxHash,
    pub block_hash: BlockHash,
    /// Position within the block (0-based).
    pub index: u32,
    pub from: Address,
    /// `None` for contract creation.
    pub to: Option<Address>,
    pub value: U256,
    pub nonce: u64,
    pub gas_price: U256,
    pub gas_limit: u64,
    pub input: Bytes,
    pub signature: Signature,
}

impl Transaction {
    pub fn is_contract_creation(&self) -> bool {
        self.to.is_none()
    }
}

/// Event log emitted during execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    /// Position within the block.
    pub log_index: u32,
}

/// Execution outcome of one transaction, keyed 1:1 by transaction hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub transaction_hash: TxHash,
    pub success: bool,
    pub gas_used: u64,
    pub cumulative_gas_used: u64,
    /// Price actually paid per gas; falls back to the transaction's gas price.
    pub effective_gas_price: Option<U256>,
    pub contract_address: Option<Address>,
    pub revert_reason: Option<String>,
    pub logs: Vec<Log>,
}

// =============================================================================
// Trace Products
// =============================================================================

/// Value transfer inside a transaction's execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalTransaction {
    pub transaction_hash: TxHash,
    /// Pre-order index of the originating frame; the root frame is 0.
    pub pc: u32,
    pub from: Address,
    pub to: Address,
    pub amount: U256,
}

/// Contract deployed by CREATE/CREATE2.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractCreated {
    pub transaction_hash: TxHash,
    pub pc: u32,
    pub creator: Address,
    pub address: Address,
    /// Deployed bytecode; empty when the trace did not carry it.
    pub code: Bytes,
    /// Endowment moved from creator to contract.
    pub amount: U256,
    pub capabilities: ContractCapabilities,
    pub contract_type: ContractType,
}

impl ContractCreated {
    /// Created by the transaction itself rather than by a nested frame.
    ///
    /// Its endowment is the transaction value, accounted as a direct transfer.
    pub fn is_top_level(&self) -> bool {
        self.pc == 0
    }
}

/// Contract removed by SELFDESTRUCT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractDestroyed {
    pub transaction_hash: TxHash,
    pub pc: u32,
    pub address: Address,
    pub refund_address: Address,
    pub refund_amount: U256,
}

/// Contract classified lazily because its creation predates indexing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedContract {
    pub address: Address,
    pub code_hash: B256,
    pub capabilities: ContractCapabilities,
    pub contract_type: ContractType,
    /// Block whose state the bytecode was read at.
    pub block_number: u64,
}

// =============================================================================
// Rewards & Balances
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardKind {
    Block,
    Ommer,
}

impl RewardKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Ommer => "ommer",
        }
    }
}

/// Newly issued value credited by consensus rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reward {
    /// Including block.
    pub block_hash: BlockHash,
    /// Rewarded block: the including block itself or one of its ommers.
    pub hash: BlockHash,
    pub beneficiary: Address,
    pub amount: U256,
    pub kind: RewardKind,
}

/// Why an account balance moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaReason {
    BlockReward,
    OmmerReward,
    Transfer,
    ContractCreation,
    ContractDestruction,
    InternalTransfer,
    FeePayment,
    FeeReceipt,
}

impl DeltaReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BlockReward => "block_reward",
            Self::OmmerReward => "ommer_reward",
            Self::Transfer => "transfer",
            Self::ContractCreation => "contract_creation",
            Self::ContractDestruction => "contract_destruction",
            Self::InternalTransfer => "internal_transfer",
            Self::FeePayment => "fee_payment",
            Self::FeeReceipt => "fee_receipt",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "block_reward" => Some(Self::BlockReward),
            "ommer_reward" => Some(Self::OmmerReward),
            "transfer" => Some(Self::Transfer),
            "contract_creation" => Some(Self::ContractCreation),
            "contract_destruction" => Some(Self::ContractDestruction),
            "internal_transfer" => Some(Self::InternalTransfer),
            "fee_payment" => Some(Self::FeePayment),
            "fee_receipt" => Some(Self::FeeReceipt),
            _ => None,
        }
    }
}

/// Signed balance change of one account within one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceDelta {
    pub block_hash: BlockHash,
    pub block_number: u64,
    /// Position within the block's delta list; part of the storage key.
    pub index: u32,
    pub account: Address,
    pub amount: I256,
    pub reason: DeltaReason,
    pub transaction_hash: Option<TxHash>,
}

/// Address observed by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: Address,
    /// Lowest block number the address was seen in, on any branch. A reorg
    /// neither removes the row nor raises this number, so an account first
    /// seen in a replaced block keeps that block's number.
    pub first_seen_block: u64,
    /// Set once the contract self-destructed; the row is never removed.
    pub destroyed_block: Option<u64>,
}

// =============================================================================
// Tokens
// =============================================================================

/// Fungible amount or non-fungible token id carried by a Transfer log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransferValue {
    Fungible { amount: U256 },
    NonFungible { token_id: U256 },
}

/// Token movement decoded from a `Transfer(address,address,uint256)` log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTransfer {
    pub transaction_hash: TxHash,
    pub log_index: u32,
    pub contract: Address,
    pub from: Address,
    pub to: Address,
    pub value: TransferValue,
}

/// Standard token events besides Transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TokenEvent {
    FungibleApproval {
        owner: Address,
        spender: Address,
        value: U256,
    },
    NonFungibleApproval {
        owner: Address,
        approved: Address,
        token_id: U256,
    },
    ApprovalForAll {
        owner: Address,
        operator: Address,
        approved: bool,
    },
    Sent {
        operator: Address,
        from: Address,
        to: Address,
        amount: U256,
        data: Bytes,
        operator_data: Bytes,
    },
    Minted {
        operator: Address,
        to: Address,
        amount: U256,
        data: Bytes,
        operator_data: Bytes,
    },
    Burned {
        operator: Address,
        from: Address,
        amount: U256,
        data: Bytes,
        operator_data: Bytes,
    },
    AuthorizedOperator {
        operator: Address,
        holder: Address,
    },
    RevokedOperator {
        operator: Address,
        holder: Address,
    },
    TransferSingle {
        operator: Address,
        from: Address,
        to: Address,
        id: U256,
        value: U256,
    },
    TransferBatch {
        operator: Address,
        from: Address,
        to: Address,
        ids: Vec<U256>,
        values: Vec<U256>,
    },
    Uri {
        id: U256,
        value: String,
    },
}

/// Log kept as a row, decoded when it is a known token event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractEvent {
    pub transaction_hash: TxHash,
    pub log_index: u32,
    pub contract: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub decoded: Option<TokenEvent>,
}

// =============================================================================
// Import State
// =============================================================================

/// Progress of one block through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    Pending,
    InProgress,
    Committed,
    Failed,
}

impl ImportStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Committed => "committed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "committed" => Some(Self::Committed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Allowed edges: `Pending → InProgress → Committed` and `InProgress → Failed → Pending`.
    pub fn can_transition_to(self, next: ImportStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::InProgress, Self::Committed)
                | (Self::InProgress, Self::Failed)
                | (Self::Failed, Self::Pending)
        )
    }
}

/// Import queue row for one (number, hash) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportQueueEntry {
    pub number: u64,
    pub hash: BlockHash,
    pub status: ImportStatus,
    pub attempts: u32,
    /// Cleared when a reorg turns the block into an ommer.
    pub canonical: bool,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ImportQueueEntry {
    pub fn pending(id: BlockId) -> Self {
        Self {
            number: id.number,
            hash: id.hash,
            status: ImportStatus::Pending,
            attempts: 0,
            canonical: true,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn id(&self) -> BlockId {
        BlockId {
            number: self.number,
            hash: self.hash,
        }
    }
}

/// Indexer cursor tracking progress.
///
/// The cursor tracks the canonical head for each chain,
/// enabling the indexer to resume from where it left off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerCursor {
    /// EIP-155 chain id.
    pub chain_id: u64,
    /// Last committed canonical block number.
    pub last_block: u64,
    /// Last committed canonical block hash (for reorg detection).
    pub last_hash: BlockHash,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl IndexerCursor {
    pub fn head(&self) -> BlockId {
        BlockId {
            number: self.last_block,
            hash: self.last_hash,
        }
    }
}

// =============================================================================
// Normalized Output
// =============================================================================

/// Everything derived from one block, committed atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedBlock {
    pub block: Block,
    pub receipts: Vec<TransactionReceipt>,
    pub internal_transactions: Vec<InternalTransaction>,
    pub contracts_created: Vec<ContractCreated>,
    pub contracts_destroyed: Vec<ContractDestroyed>,
    pub classified_contracts: Vec<ClassifiedContract>,
    pub token_transfers: Vec<TokenTransfer>,
    pub contract_events: Vec<ContractEvent>,
    pub rewards: Vec<Reward>,
    pub balance_deltas: Vec<BalanceDelta>,
    pub accounts: Vec<Account>,
    /// Queue row as it stands once the commit lands.
    pub import: ImportQueueEntry,
    pub cursor: IndexerCursor,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // Test critique: la machine à états n'autorise que les transitions prévues
    #[test]
    fn test_import_status_transitions() {
        use ImportStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Committed));
        assert!(InProgress.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));

        // Pas de saut direct ni de retour depuis Committed
        assert!(!Pending.can_transition_to(Committed));
        assert!(!Failed.can_transition_to(InProgress));
        assert!(!Committed.can_transition_to(Pending));
    }

    #[test]
    fn test_status_and_reason_strings_roundtrip() {
        for status in [
            ImportStatus::Pending,
            ImportStatus::InProgress,
            ImportStatus::Committed,
            ImportStatus::Failed,
        ] {
            assert_eq!(ImportStatus::parse(status.as_str()), Some(status));
        }
        for reason in [
            DeltaReason::BlockReward,
            DeltaReason::OmmerReward,
            DeltaReason::Transfer,
            DeltaReason::ContractCreation,
            DeltaReason::ContractDestruction,
            DeltaReason::InternalTransfer,
            DeltaReason::FeePayment,
            DeltaReason::FeeReceipt,
        ] {
            assert_eq!(DeltaReason::parse(reason.as_str()), Some(reason));
        }
    }
}
