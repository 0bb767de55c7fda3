//! Ethereum JSON-RPC adapter for the Tributary indexer.
//!
//! [`JsonRpcNode`] implements the `NodeClient` port over HTTP with
//! `alloy-rpc-client`. Wire responses are decoded into the private shapes
//! of [`types`] and converted into domain models at the boundary, so the
//! core never sees JSON.
//!
//! Call traces are requested in flat form (one entry per frame, addressed
//! by its path from the root) and rebuilt into the core's frame arena.

mod client;
pub mod types;

pub use client::{JsonRpcNode, RpcClientConfig, TraceApi};
