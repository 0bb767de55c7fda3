//! Core domain layer for the Tributary EVM indexer.
//!
//! This crate contains the domain models, port traits (interfaces), and
//! the pipeline services that turn raw blocks, receipts and call traces into
//! normalized rows. It follows hexagonal architecture principles - this is
//! the innermost layer with no dependencies on infrastructure.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    tributary (binary)                       │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │       tributary-rpc          │     tributary-storage        │
//! │     (JSON-RPC node)          │  (PostgreSQL, in-memory)     │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │                  tributary-core  ← YOU ARE HERE             │
//! │            (models, ports, services, codec)                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`models`] - Domain models (Block, Transaction, InternalTransaction, etc.)
//! - [`ports`] - Interface traits for adapters to implement
//! - [`services`] - Pipeline components and the import coordinator
//! - [`codec`] - Binary encoding of compact records
//! - [`error`] - Domain error types
//! - [`metrics`] - Prometheus metrics definitions
//!
//! # Key Concepts
//!
//! ## Ports
//!
//! - [`ports::NodeClient`] - Fetch blocks, receipts, traces and bytecode
//! - [`ports::BlockWriter`] - Commit one block's rows atomically
//!
//! ## Block Lifecycle
//!
//! 1. Fetch the next block and check it extends the canonical head
//! 2. Extract internal transactions and contract lifecycle from traces
//! 3. Detect capabilities of new contracts, then interpret logs
//! 4. Compute balance deltas and check conservation
//! 5. Commit everything and advance the cursor in one transaction

pub mod codec;
pub mod error;
pub mod metrics;
pub mod models;
pub mod ports;
pub mod services;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
