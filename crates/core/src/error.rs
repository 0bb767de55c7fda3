//! Error types for the ingestion pipeline.
//!
//! This module defines a hierarchy of error types:
//!
//! - [`ExtractionError`] - Call trace could not be turned into records
//! - [`StorageError`] - Database/repository errors
//! - [`NodeError`] - Node JSON-RPC errors
//! - [`CodecError`] - Binary record encoding errors
//! - [`IndexerError`] - Top-level orchestration errors
//!
//! Error conversion is automatic via `From` implementations,
//! allowing `?` to work across error boundaries. Each layer answers
//! [`is_transient`](IndexerError::is_transient) so the coordinator decides
//! between retry and escalation in one place.

use std::time::Duration;

use alloy_primitives::{B256, I256};
use thiserror::Error;

// =============================================================================
// Extraction Errors
// =============================================================================

/// Trace data the extractor refuses to interpret.
///
/// Always block-fatal: retrying the same node answer cannot help.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// The call tree is structurally invalid.
    #[error("Malformed trace for transaction {tx_hash}: {reason}")]
    MalformedTrace {
        /// Transaction owning the trace.
        tx_hash: B256,
        /// What was wrong with it.
        reason: String,
    },
}

// =============================================================================
// Storage Errors
// =============================================================================

/// Database and repository errors.
///
/// These errors originate from storage operations like queries,
/// transactions, and data serialization.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Failed to establish database connection.
    #[error("Database connection error: {0}")]
    ConnectionError(String),

    /// SQL query execution failed.
    #[error("Query execution error: {0}")]
    QueryError(String),

    /// Requested record was not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Database migration failed.
    #[error("Migration error: {0}")]
    MigrationError(String),

    /// Transaction commit/rollback failed.
    #[error("Transaction error: {0}")]
    TransactionError(String),

    /// Data serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A concurrent writer touched the same rows; retry on a fresh snapshot.
    #[error("Write conflict: {0}")]
    WriteConflict(String),
}

impl StorageError {
    /// Whether a fresh attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionError(_) | Self::TransactionError(_) | Self::WriteConflict(_)
        )
    }
}

// =============================================================================
// Node Errors
// =============================================================================

/// Node connectivity and response errors.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Transport failed or the node refused the request.
    #[error("Node unavailable: {0}")]
    Unavailable(String),

    /// The node does not (yet) know the requested object.
    #[error("Not found on node: {0}")]
    NotFound(String),

    /// The node answered with something we cannot use.
    #[error("Invalid node response: {0}")]
    InvalidResponse(String),

    /// The call did not complete within the configured bound.
    #[error("Node call {operation} timed out after {after:?}")]
    Timeout {
        /// Port operation that timed out.
        operation: &'static str,
        /// Configured bound.
        after: Duration,
    },
}

impl NodeError {
    /// Whether a fresh attempt may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::InvalidResponse(_))
    }
}

// =============================================================================
// Codec Errors
// =============================================================================

/// Binary record encoding errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Buffer holds no type tag.
    #[error("Empty record buffer")]
    Empty,

    /// Buffer holds a different record type.
    #[error("Unexpected record tag {found:#04x}, expected {expected:#04x} ({name})")]
    UnexpectedTag {
        /// Tag of the requested record type.
        expected: u8,
        /// Tag found in the buffer.
        found: u8,
        /// Name of the requested record type.
        name: &'static str,
    },

    /// Field layout could not be read or written.
    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),
}

// =============================================================================
// Indexer Errors
// =============================================================================

/// Top-level indexer orchestration errors.
///
/// This is the main error type returned by [`crate::services::ImportCoordinator`].
/// It wraps all lower-level errors and adds indexer-specific variants.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// Trace extraction error.
    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    /// Storage/database error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Node connectivity error.
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    /// Binary record error.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Block deltas do not sum to issuance minus burn.
    #[error(
        "Balance conservation violated in block {number} ({hash}): expected {expected}, got {actual}"
    )]
    ConservationViolated {
        number: u64,
        hash: B256,
        expected: I256,
        actual: I256,
    },

    /// Common ancestor lies deeper than the configured bound.
    #[error("Reorg at block {number} ({hash}) exceeds {depth} blocks (max {max})")]
    ReorgTooDeep {
        number: u64,
        hash: B256,
        depth: u64,
        max: u64,
    },

    /// Block could not be imported; ingestion halts.
    #[error("Block {number} ({hash}) failed after {attempts} attempt(s): {source}")]
    Fatal {
        number: u64,
        hash: B256,
        attempts: u32,
        #[source]
        source: Box<IndexerError>,
    },

    /// Connected chain doesn't match stored data.
    ///
    /// This is a fatal error that requires manual intervention.
    #[error("Chain mismatch: connected to {connected} but database contains data for {expected}")]
    ChainMismatch {
        /// Chain id reported by the node.
        connected: u64,
        /// Chain id found in the store.
        expected: u64,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Graceful shutdown was requested.
    ///
    /// This is not really an error but uses the error type for control flow.
    #[error("Indexer shutdown requested")]
    ShutdownRequested,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IndexerError {
    /// Whether retrying the failed step may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_transient(),
            Self::Node(e) => e.is_transient(),
            _ => false,
        }
    }
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for indexer operations.
pub type IndexerResult<T> = Result<T, IndexerError>;

/// Result type for trace extraction.
pub type ExtractionResult<T> = Result<T, ExtractionError>;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type for node operations.
pub type NodeResult<T> = Result<T, NodeError>;

/// Result type for binary record operations.
pub type CodecResult<T> = Result<T, CodecError>;
