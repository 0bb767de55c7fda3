//! Import queue and indexer cursor.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};

use tributary_core::error::{StorageError, StorageResult};
use tributary_core::models::{BlockId, ImportQueueEntry, ImportStatus, IndexerCursor};

use super::helpers::{bytes_to_b256_strict, map_write_error};

// =============================================================================
// Import Queue
// =============================================================================

pub async fn upsert_entry(conn: &mut PgConnection, entry: &ImportQueueEntry) -> StorageResult<()> {
    sqlx::query(
        r#"
        INSERT INTO import_queue (number, hash, status, attempts, canonical, last_error, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (number, hash) DO UPDATE SET
            status = EXCLUDED.status,
            attempts = EXCLUDED.attempts,
            canonical = EXCLUDED.canonical,
            last_error = EXCLUDED.last_error,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(entry.number as i64)
    .bind(entry.hash.as_slice())
    .bind(entry.status.as_str())
    .bind(entry.attempts as i32)
    .bind(entry.canonical)
    .bind(&entry.last_error)
    .bind(entry.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(map_write_error)?;
    Ok(())
}

/// Canonical entry of a height, else the most recently touched one.
pub async fn get_entry(pool: &PgPool, number: u64) -> StorageResult<Option<ImportQueueEntry>> {
    let row = sqlx::query_as::<_, ImportRow>(
        r#"
        SELECT number, hash, status, attempts, canonical, last_error, updated_at
        FROM import_queue
        WHERE number = $1
        ORDER BY canonical DESC, updated_at DESC
        LIMIT 1
        "#,
    )
    .bind(number as i64)
    .fetch_optional(pool)
    .await
    .map_err(|e| StorageError::QueryError(e.to_string()))?;

    row.map(ImportRow::into_entry).transpose()
}

/// Detach entries above `number` from the canonical chain.
pub async fn demote_entries_above(conn: &mut PgConnection, number: u64) -> StorageResult<u64> {
    let result = sqlx::query(
        "UPDATE import_queue SET canonical = FALSE, updated_at = NOW() WHERE number > $1 AND canonical",
    )
    .bind(number as i64)
    .execute(&mut *conn)
    .await
    .map_err(map_write_error)?;
    Ok(result.rows_affected())
}

/// Detach other entries at the height of a block about to become canonical.
pub async fn demote_siblings(conn: &mut PgConnection, id: &BlockId) -> StorageResult<()> {
    sqlx::query(
        r#"
        UPDATE import_queue SET canonical = FALSE, updated_at = NOW()
        WHERE number = $1 AND hash <> $2 AND canonical
        "#,
    )
    .bind(id.number as i64)
    .bind(id.hash.as_slice())
    .execute(&mut *conn)
    .await
    .map_err(map_write_error)?;
    Ok(())
}

#[derive(sqlx::FromRow)]
struct ImportRow {
    number: i64,
    hash: Vec<u8>,
    status: String,
    attempts: i32,
    canonical: bool,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl ImportRow {
    fn into_entry(self) -> StorageResult<ImportQueueEntry> {
        let status = ImportStatus::parse(&self.status).ok_or_else(|| {
            StorageError::SerializationError(format!(
                "import_queue.status has unknown value {}",
                self.status
            ))
        })?;

        Ok(ImportQueueEntry {
            number: self.number as u64,
            hash: bytes_to_b256_strict(self.hash, "import_queue.hash")?,
            status,
            attempts: self.attempts as u32,
            canonical: self.canonical,
            last_error: self.last_error,
            updated_at: self.updated_at,
        })
    }
}

// =============================================================================
// Cursor
// =============================================================================

pub async fn upsert_cursor(conn: &mut PgConnection, cursor: &IndexerCursor) -> StorageResult<()> {
    sqlx::query(
        r#"
        INSERT INTO indexer_cursor (chain_id, last_block, last_hash, updated_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (chain_id) DO UPDATE SET
            last_block = EXCLUDED.last_block,
            last_hash = EXCLUDED.last_hash,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(cursor.chain_id as i64)
    .bind(cursor.last_block as i64)
    .bind(cursor.last_hash.as_slice())
    .bind(cursor.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(map_write_error)?;
    Ok(())
}

pub async fn get_cursor(pool: &PgPool, chain_id: u64) -> StorageResult<Option<IndexerCursor>> {
    let row = sqlx::query_as::<_, CursorRow>(
        r#"
        SELECT chain_id, last_block, last_hash, updated_at
        FROM indexer_cursor
        WHERE chain_id = $1
        "#,
    )
    .bind(chain_id as i64)
    .fetch_optional(pool)
    .await
    .map_err(|e| StorageError::QueryError(e.to_string()))?;

    row.map(CursorRow::into_cursor).transpose()
}

pub async fn get_any_cursor(pool: &PgPool) -> StorageResult<Option<IndexerCursor>> {
    let row = sqlx::query_as::<_, CursorRow>(
        r#"
        SELECT chain_id, last_block, last_hash, updated_at
        FROM indexer_cursor
        ORDER BY updated_at DESC
        LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await
    .map_err(|e| StorageError::QueryError(e.to_string()))?;

    row.map(CursorRow::into_cursor).transpose()
}

#[derive(sqlx::FromRow)]
struct CursorRow {
    chain_id: i64,
    last_block: i64,
    last_hash: Vec<u8>,
    updated_at: DateTime<Utc>,
}

impl CursorRow {
    fn into_cursor(self) -> StorageResult<IndexerCursor> {
        Ok(IndexerCursor {
            chain_id: self.chain_id as u64,
            last_block: self.last_block as u64,
            last_hash: bytes_to_b256_strict(self.last_hash, "indexer_cursor.last_hash")?,
            updated_at: self.updated_at,
        })
    }
}
