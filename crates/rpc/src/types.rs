//! JSON-RPC wire types and their conversion into domain models.
//!
//! Only the fields the pipeline reads are declared; serde ignores the rest.

use std::collections::HashMap;

use alloy_primitives::{Address, B256, Bytes, U64, U256};
use chrono::DateTime;
use serde::Deserialize;

use tributary_core::error::{NodeError, NodeResult};
use tributary_core::models::{
    Block, CallFrame, CallKind, CallTrace, FrameId, Log, OmmerHeader, Signature, Transaction,
    TransactionReceipt,
};

// =============================================================================
// Blocks & Transactions
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlock {
    pub number: U64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: U64,
    pub miner: Address,
    pub gas_used: U64,
    pub gas_limit: U64,
    pub base_fee_per_gas: Option<U256>,
    #[serde(default)]
    pub uncles: Vec<B256>,
    #[serde(default)]
    pub transactions: Vec<RpcTransaction>,
}

impl RpcBlock {
    /// Build the domain block once the ommer headers have been fetched.
    pub fn into_block(self, ommers: Vec<OmmerHeader>) -> NodeResult<Block> {
        let number = self.number.to::<u64>();
        let timestamp = DateTime::from_timestamp(self.timestamp.to::<u64>() as i64, 0)
            .ok_or_else(|| {
                NodeError::InvalidResponse(format!(
                    "block {number} has an out-of-range timestamp {}",
                    self.timestamp
                ))
            })?;

        let transactions = self
            .transactions
            .into_iter()
            .enumerate()
            .map(|(position, tx)| tx.into_transaction(self.hash, position))
            .collect();

        Ok(Block {
            number,
            hash: self.hash,
            parent_hash: self.parent_hash,
            timestamp,
            miner: self.miner,
            gas_used: self.gas_used.to::<u64>(),
            gas_limit: self.gas_limit.to::<u64>(),
            base_fee_per_gas: self.base_fee_per_gas,
            ommers,
            transactions,
        })
    }
}

/// Ommer header as returned by `eth_getUncleByBlockHashAndIndex`.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcHeader {
    pub number: U64,
    pub hash: B256,
    pub miner: Address,
}

impl From<RpcHeader> for OmmerHeader {
    fn from(header: RpcHeader) -> Self {
        Self {
            hash: header.hash,
            number: header.number.to::<u64>(),
            miner: header.miner,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    pub hash: B256,
    pub transaction_index: Option<U64>,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub nonce: U64,
    /// Effective price for mined dynamic-fee transactions.
    pub gas_price: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub gas: U64,
    pub input: Bytes,
    pub v: Option<U64>,
    pub y_parity: Option<U64>,
    #[serde(default)]
    pub r: U256,
    #[serde(default)]
    pub s: U256,
}

impl RpcTransaction {
    fn into_transaction(self, block_hash: B256, position: usize) -> Transaction {
        Transaction {
            hash: self.hash,
            block_hash,
            index: self
                .transaction_index
                .map_or(position as u32, |index| index.saturating_to::<u32>()),
            from: self.from,
            to: self.to,
            value: self.value,
            nonce: self.nonce.to::<u64>(),
            gas_price: self.gas_price.or(self.max_fee_per_gas).unwrap_or_default(),
            gas_limit: self.gas.to::<u64>(),
            input: self.input,
            signature: Signature {
                v: self.v.or(self.y_parity).map_or(0, |v| v.to::<u64>()),
                r: self.r,
                s: self.s,
            },
        }
    }
}

// =============================================================================
// Receipts
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReceipt {
    pub transaction_hash: B256,
    /// Absent before Byzantium, where receipts carried a state root instead.
    pub status: Option<U64>,
    pub gas_used: U64,
    pub cumulative_gas_used: U64,
    pub effective_gas_price: Option<U256>,
    pub contract_address: Option<Address>,
    #[serde(default)]
    pub logs: Vec<RpcLog>,
}

impl From<RpcReceipt> for TransactionReceipt {
    fn from(receipt: RpcReceipt) -> Self {
        Self {
            transaction_hash: receipt.transaction_hash,
            // Pre-Byzantium receipts cannot tell; treat them as successful
            success: receipt.status.is_none_or(|status| !status.is_zero()),
            gas_used: receipt.gas_used.to::<u64>(),
            cumulative_gas_used: receipt.cumulative_gas_used.to::<u64>(),
            effective_gas_price: receipt.effective_gas_price,
            contract_address: receipt.contract_address,
            revert_reason: None,
            logs: receipt.logs.into_iter().map(Log::from).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub log_index: U64,
}

impl From<RpcLog> for Log {
    fn from(log: RpcLog) -> Self {
        Self {
            address: log.address,
            topics: log.topics,
            data: log.data,
            log_index: log.log_index.saturating_to::<u32>(),
        }
    }
}

// =============================================================================
// Flat Call Traces
// =============================================================================

/// One frame of a flat trace (`flatCallTracer` / `trace_transaction`).
///
/// The call tree is given as a pre-order list where each frame names its
/// path from the root, so the JSON nesting depth stays constant however
/// deep the calls go.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTraceFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub action: RpcTraceAction,
    pub result: Option<RpcTraceResult>,
    pub error: Option<String>,
    pub trace_address: Vec<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTraceAction {
    pub call_type: Option<String>,
    pub creation_method: Option<String>,
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub value: Option<U256>,
    pub gas: Option<U64>,
    pub input: Option<Bytes>,
    pub init: Option<Bytes>,
    /// Self-destructed contract.
    pub address: Option<Address>,
    pub refund_address: Option<Address>,
    pub balance: Option<U256>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTraceResult {
    pub gas_used: Option<U64>,
    pub output: Option<Bytes>,
    /// Created contract.
    pub address: Option<Address>,
    pub code: Option<Bytes>,
}

impl RpcTraceFrame {
    fn into_frame(self) -> NodeResult<CallFrame> {
        let invalid = |what: &str| {
            NodeError::InvalidResponse(format!(
                "{} frame at {:?} {what}",
                self.kind, self.trace_address
            ))
        };
        let action = &self.action;
        let result = self.result.clone().unwrap_or_default();

        let mut frame = match self.kind.as_str() {
            "call" => {
                let call_type = action.call_type.as_deref().unwrap_or("call");
                let kind =
                    CallKind::parse(call_type).ok_or_else(|| invalid("has an unknown call type"))?;
                let from = action.from.ok_or_else(|| invalid("has no sender"))?;
                CallFrame::new(kind, from, action.to, action.value.unwrap_or_default())
                    .with_output(result.output.unwrap_or_default())
            }
            "create" => {
                let kind = match action.creation_method.as_deref() {
                    Some("create2") => CallKind::Create2,
                    _ => CallKind::Create,
                };
                let from = action.from.ok_or_else(|| invalid("has no creator"))?;
                let mut frame =
                    CallFrame::new(kind, from, result.address, action.value.unwrap_or_default())
                        .with_output(result.code.unwrap_or_default());
                frame.input = action.init.clone().unwrap_or_default();
                frame
            }
            "suicide" | "selfdestruct" => {
                let address = action.address.ok_or_else(|| invalid("has no contract"))?;
                CallFrame::new(
                    CallKind::SelfDestruct,
                    address,
                    action.refund_address,
                    action.balance.unwrap_or_default(),
                )
            }
            _ => return Err(invalid("has an unknown type")),
        };

        if let Some(input) = &action.input {
            frame.input = input.clone();
        }
        frame.gas = action.gas.map_or(0, |gas| gas.to::<u64>());
        frame.gas_used = result.gas_used.map_or(0, |gas| gas.to::<u64>());
        frame.error = self.error;
        Ok(frame)
    }
}

/// Rebuild the call tree from a flat trace.
///
/// An empty list yields an empty trace, which trace extraction rejects.
pub fn build_trace(frames: Vec<RpcTraceFrame>) -> NodeResult<CallTrace> {
    let mut frames = frames.into_iter();
    let Some(root) = frames.next() else {
        return Ok(CallTrace::default());
    };
    if !root.trace_address.is_empty() {
        return Err(NodeError::InvalidResponse(format!(
            "first trace frame is not the root: {:?}",
            root.trace_address
        )));
    }

    let mut trace = CallTrace::new(root.into_frame()?);
    let mut ids: HashMap<Vec<usize>, FrameId> = HashMap::from([(Vec::new(), 0)]);

    for entry in frames {
        let Some((_, parent_path)) = entry.trace_address.split_last() else {
            return Err(NodeError::InvalidResponse("trace has two root frames".into()));
        };
        let parent = ids.get(parent_path).copied().ok_or_else(|| {
            NodeError::InvalidResponse(format!(
                "trace frame {:?} precedes its parent",
                entry.trace_address
            ))
        })?;
        let path = entry.trace_address.clone();
        let frame = entry.into_frame()?;
        let id = trace.push_child(parent, frame).ok_or_else(|| {
            NodeError::InvalidResponse(format!("trace frame {path:?} has no parent"))
        })?;
        ids.insert(path, id);
    }

    Ok(trace)
}
