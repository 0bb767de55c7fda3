//! Ethereum JSON-RPC client implementing the node port.

use std::fmt;
use std::str::FromStr;

use alloy_primitives::{Address, Bytes, U64};
use alloy_rpc_client::ReqwestClient;
use alloy_transport::{RpcError, TransportErrorKind};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, instrument, trace};
use url::Url;

use tributary_core::error::{NodeError, NodeResult};
use tributary_core::models::{
    Block, BlockHash, BlockRef, CallTrace, OmmerHeader, TransactionReceipt, TxHash,
};
use tributary_core::ports::NodeClient;

use crate::types::{RpcBlock, RpcHeader, RpcReceipt, RpcTraceFrame, build_trace};

/// Tracing namespace used to fetch call trees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TraceApi {
    /// `debug_traceTransaction` with the flat call tracer (Geth and forks).
    #[default]
    Debug,
    /// `trace_transaction` (Erigon, Nethermind, Reth).
    Parity,
}

impl FromStr for TraceApi {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "parity" | "trace" => Ok(Self::Parity),
            other => Err(format!("unknown trace API '{other}', expected 'debug' or 'parity'")),
        }
    }
}

impl fmt::Display for TraceApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => f.write_str("debug"),
            Self::Parity => f.write_str("parity"),
        }
    }
}

/// Configuration for the JSON-RPC client.
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    /// HTTP URL (e.g., "http://localhost:8545").
    pub url: String,
    pub trace_api: TraceApi,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8545".to_string(),
            trace_api: TraceApi::Debug,
        }
    }
}

/// JSON-RPC adapter implementing the [`NodeClient`] port.
#[derive(Debug, Clone)]
pub struct JsonRpcNode {
    rpc: ReqwestClient,
    trace_api: TraceApi,
}

impl JsonRpcNode {
    /// Create a client over HTTP. No request is sent until first use.
    #[instrument(skip_all, fields(url = %config.url))]
    pub fn connect(config: RpcClientConfig) -> NodeResult<Self> {
        let url = Url::parse(&config.url)
            .map_err(|e| NodeError::Unavailable(format!("invalid node URL: {e}")))?;
        debug!(trace_api = %config.trace_api, "Node client ready");

        Ok(Self {
            rpc: ReqwestClient::new_http(url),
            trace_api: config.trace_api,
        })
    }

    async fn fetch_ommers(&self, block: &RpcBlock) -> NodeResult<Vec<OmmerHeader>> {
        let mut ommers = Vec::with_capacity(block.uncles.len());
        for index in 0..block.uncles.len() {
            let header: Option<RpcHeader> = self
                .rpc
                .request(
                    "eth_getUncleByBlockHashAndIndex",
                    (block.hash, U64::from(index)),
                )
                .await
                .map_err(map_rpc_error)?;
            let header = header.ok_or_else(|| {
                NodeError::NotFound(format!("ommer {index} of block {}", block.hash))
            })?;
            ommers.push(header.into());
        }
        Ok(ommers)
    }
}

#[async_trait]
impl NodeClient for JsonRpcNode {
    async fn chain_id(&self) -> NodeResult<u64> {
        let id: U64 = self
            .rpc
            .request_noparams("eth_chainId")
            .await
            .map_err(map_rpc_error)?;
        Ok(id.to::<u64>())
    }

    async fn latest_block_number(&self) -> NodeResult<u64> {
        let number: U64 = self
            .rpc
            .request_noparams("eth_blockNumber")
            .await
            .map_err(map_rpc_error)?;
        Ok(number.to::<u64>())
    }

    #[instrument(skip(self))]
    async fn get_block(&self, block: BlockRef) -> NodeResult<Block> {
        let response: Option<RpcBlock> = match block {
            BlockRef::Number(number) => {
                self.rpc
                    .request("eth_getBlockByNumber", (U64::from(number), true))
                    .await
            }
            BlockRef::Hash(hash) => self.rpc.request("eth_getBlockByHash", (hash, true)).await,
        }
        .map_err(map_rpc_error)?;

        let raw = response.ok_or_else(|| NodeError::NotFound(format!("block {block}")))?;
        let ommers = self.fetch_ommers(&raw).await?;
        trace!(txs = raw.transactions.len(), ommers = ommers.len(), "Block fetched");
        raw.into_block(ommers)
    }

    async fn get_trace(&self, tx_hash: TxHash) -> NodeResult<CallTrace> {
        let frames: Vec<RpcTraceFrame> = match self.trace_api {
            TraceApi::Debug => {
                self.rpc
                    .request(
                        "debug_traceTransaction",
                        (tx_hash, json!({ "tracer": "flatCallTracer" })),
                    )
                    .await
            }
            TraceApi::Parity => self.rpc.request("trace_transaction", (tx_hash,)).await,
        }
        .map_err(map_rpc_error)?;

        build_trace(frames)
    }

    async fn get_receipts(&self, block_hash: BlockHash) -> NodeResult<Vec<TransactionReceipt>> {
        let receipts: Option<Vec<RpcReceipt>> = self
            .rpc
            .request("eth_getBlockReceipts", (block_hash,))
            .await
            .map_err(map_rpc_error)?;

        let receipts =
            receipts.ok_or_else(|| NodeError::NotFound(format!("receipts of {block_hash}")))?;
        Ok(receipts.into_iter().map(TransactionReceipt::from).collect())
    }

    async fn get_code(&self, address: Address, block_number: u64) -> NodeResult<Bytes> {
        self.rpc
            .request("eth_getCode", (address, U64::from(block_number)))
            .await
            .map_err(map_rpc_error)
    }
}

/// Classify a JSON-RPC failure for the retry policy.
///
/// Transport failures and node-side errors (rate limits, missing state that
/// has not been synced yet) may clear up; a body we cannot decode will not.
fn map_rpc_error(error: RpcError<TransportErrorKind>) -> NodeError {
    match error {
        RpcError::NullResp => NodeError::NotFound("null response".into()),
        RpcError::DeserError { err, text } => {
            let preview: String = text.chars().take(200).collect();
            NodeError::InvalidResponse(format!("{err}: {preview}"))
        }
        RpcError::SerError(e) => NodeError::InvalidResponse(e.to_string()),
        RpcError::ErrorResp(payload) => {
            NodeError::Unavailable(format!("node error {}: {}", payload.code, payload.message))
        }
        other => NodeError::Unavailable(other.to_string()),
    }
}
