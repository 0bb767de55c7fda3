//! Shared helper functions for PostgreSQL row conversion.

use alloy_primitives::{Address, B256, I256};
use tributary_core::error::{StorageError, StorageResult};

/// SQLSTATE codes raised when a concurrent transaction won the race.
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

/// Map a failed write, singling out conflicts a fresh attempt can resolve.
pub fn map_write_error(error: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db) = &error
        && matches!(
            db.code().as_deref(),
            Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED)
        )
    {
        return StorageError::WriteConflict(db.message().to_string());
    }
    StorageError::QueryError(error.to_string())
}

/// Convert a `Vec<u8>` to a 32-byte hash.
///
/// Returns an error if the length doesn't match.
pub fn bytes_to_b256(bytes: Vec<u8>, field_name: &str) -> StorageResult<B256> {
    B256::try_from(bytes.as_slice()).map_err(|_| {
        StorageError::SerializationError(format!(
            "{} has invalid length: expected 32, got {}",
            field_name,
            bytes.len()
        ))
    })
}

/// Convert a `Vec<u8>` to a block hash, rejecting all-zero values as corrupt.
pub fn bytes_to_b256_strict(bytes: Vec<u8>, field_name: &str) -> StorageResult<B256> {
    let hash = bytes_to_b256(bytes, field_name)?;

    if hash.is_zero() {
        return Err(StorageError::SerializationError(format!(
            "{} is all zeros, which indicates data corruption",
            field_name
        )));
    }

    Ok(hash)
}

/// Convert a `Vec<u8>` to a 20-byte address.
pub fn bytes_to_address(bytes: Vec<u8>, field_name: &str) -> StorageResult<Address> {
    Address::try_from(bytes.as_slice()).map_err(|_| {
        StorageError::SerializationError(format!(
            "{} has invalid length: expected 20, got {}",
            field_name,
            bytes.len()
        ))
    })
}

/// Parse a NUMERIC rendered as text into a signed word.
pub fn numeric_to_i256(text: &str, field_name: &str) -> StorageResult<I256> {
    I256::from_dec_str(text).map_err(|e| {
        StorageError::SerializationError(format!("{field_name} is not a 256-bit integer: {e}"))
    })
}
