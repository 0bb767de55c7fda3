//! Storage layer for the Tributary indexer.
//!
//! This crate provides implementations of the [`BlockWriter`] port defined
//! in `tributary-core`:
//!
//! - [`postgres::PgBlockWriter`] - PostgreSQL, one transaction per block
//! - [`memory::MemoryWriter`] - In-process store with the same semantics, used
//!   for dry runs and pipeline tests
//!
//! Both keep replaced branches as non-canonical rows instead of deleting
//! them, and answer balance queries from canonical blocks only.
//!
//! # Usage
//!
//! ```ignore
//! use tributary_storage::{Database, DatabaseConfig, PgBlockWriter};
//!
//! // Connect to the database
//! let config = DatabaseConfig::for_indexer(&database_url);
//! let db = Database::connect(&config).await?;
//!
//! // Run migrations
//! db.migrate().await?;
//!
//! // Create the writer
//! let writer = Arc::new(PgBlockWriter::new(Arc::new(db)));
//! ```
//!
//! [`BlockWriter`]: tributary_core::ports::BlockWriter

pub mod memory;
pub mod postgres;

pub use memory::MemoryWriter;
pub use postgres::{Database, DatabaseConfig, PgBlockWriter, PurgeStats};
