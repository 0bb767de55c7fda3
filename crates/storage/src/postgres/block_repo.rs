//! Blocks, ommers, accounts, transactions and receipts.

use sqlx::{PgConnection, PgPool};

use tributary_core::error::{StorageError, StorageResult};
use tributary_core::models::{Account, Block, BlockId, Transaction, TransactionReceipt};

use super::helpers::{bytes_to_b256_strict, map_write_error};

/// Insert a block as the canonical block of its height.
///
/// Any other block still flagged canonical at that height is demoted first.
pub async fn upsert_block(conn: &mut PgConnection, block: &Block) -> StorageResult<()> {
    sqlx::query("UPDATE blocks SET canonical = FALSE WHERE number = $1 AND hash <> $2 AND canonical")
        .bind(block.number as i64)
        .bind(block.hash.as_slice())
        .execute(&mut *conn)
        .await
        .map_err(map_write_error)?;

    sqlx::query(
        r#"
        INSERT INTO blocks (
            hash, number, parent_hash, timestamp, miner,
            gas_used, gas_limit, base_fee_per_gas, canonical, indexed_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8::NUMERIC, TRUE, NOW())
        ON CONFLICT (hash) DO UPDATE SET
            canonical = TRUE,
            indexed_at = EXCLUDED.indexed_at
        "#,
    )
    .bind(block.hash.as_slice())
    .bind(block.number as i64)
    .bind(block.parent_hash.as_slice())
    .bind(block.timestamp)
    .bind(block.miner.as_slice())
    .bind(block.gas_used as i64)
    .bind(block.gas_limit as i64)
    .bind(block.base_fee_per_gas.map(|fee| fee.to_string()))
    .execute(&mut *conn)
    .await
    .map_err(map_write_error)?;

    for (position, ommer) in block.ommers.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO ommers (block_hash, position, hash, number, miner)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (block_hash, position) DO NOTHING
            "#,
        )
        .bind(block.hash.as_slice())
        .bind(position as i32)
        .bind(ommer.hash.as_slice())
        .bind(ommer.number as i64)
        .bind(ommer.miner.as_slice())
        .execute(&mut *conn)
        .await
        .map_err(map_write_error)?;
    }

    Ok(())
}

/// Record observed accounts, keeping the earliest sighting and any destruction.
pub async fn upsert_accounts(conn: &mut PgConnection, accounts: &[Account]) -> StorageResult<()> {
    for account in accounts {
        sqlx::query(
            r#"
            INSERT INTO accounts (address, first_seen_block, destroyed_block)
            VALUES ($1, $2, $3)
            ON CONFLICT (address) DO UPDATE SET
                first_seen_block = LEAST(accounts.first_seen_block, EXCLUDED.first_seen_block),
                destroyed_block = COALESCE(EXCLUDED.destroyed_block, accounts.destroyed_block)
            "#,
        )
        .bind(account.address.as_slice())
        .bind(account.first_seen_block as i64)
        .bind(account.destroyed_block.map(|n| n as i64))
        .execute(&mut *conn)
        .await
        .map_err(map_write_error)?;
    }
    Ok(())
}

/// Upsert transactions; a transaction re-included by a new branch moves to
/// its new block.
pub async fn upsert_transactions(
    conn: &mut PgConnection,
    block_number: u64,
    transactions: &[Transaction],
) -> StorageResult<()> {
    for tx in transactions {
        sqlx::query(
            r#"
            INSERT INTO transactions (
                hash, block_hash, block_number, index, sender, recipient, value,
                nonce, gas_price, gas_limit, input, v, r, s
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7::NUMERIC, $8, $9::NUMERIC, $10, $11, $12,
                    $13::NUMERIC, $14::NUMERIC)
            ON CONFLICT (hash) DO UPDATE SET
                block_hash = EXCLUDED.block_hash,
                block_number = EXCLUDED.block_number,
                index = EXCLUDED.index
            "#,
        )
        .bind(tx.hash.as_slice())
        .bind(tx.block_hash.as_slice())
        .bind(block_number as i64)
        .bind(tx.index as i32)
        .bind(tx.from.as_slice())
        .bind(tx.to.as_ref().map(|to| to.as_slice()))
        .bind(tx.value.to_string())
        .bind(tx.nonce as i64)
        .bind(tx.gas_price.to_string())
        .bind(tx.gas_limit as i64)
        .bind(&tx.input[..])
        .bind(tx.signature.v as i64)
        .bind(tx.signature.r.to_string())
        .bind(tx.signature.s.to_string())
        .execute(&mut *conn)
        .await
        .map_err(map_write_error)?;
    }
    Ok(())
}

pub async fn upsert_receipts(
    conn: &mut PgConnection,
    receipts: &[TransactionReceipt],
) -> StorageResult<()> {
    for receipt in receipts {
        sqlx::query(
            r#"
            INSERT INTO transaction_receipts (
                transaction_hash, success, gas_used, cumulative_gas_used,
                effective_gas_price, contract_address, revert_reason
            )
            VALUES ($1, $2, $3, $4, $5::NUMERIC, $6, $7)
            ON CONFLICT (transaction_hash) DO UPDATE SET
                success = EXCLUDED.success,
                gas_used = EXCLUDED.gas_used,
                cumulative_gas_used = EXCLUDED.cumulative_gas_used,
                effective_gas_price = EXCLUDED.effective_gas_price,
                contract_address = EXCLUDED.contract_address,
                revert_reason = EXCLUDED.revert_reason
            "#,
        )
        .bind(receipt.transaction_hash.as_slice())
        .bind(receipt.success)
        .bind(receipt.gas_used as i64)
        .bind(receipt.cumulative_gas_used as i64)
        .bind(receipt.effective_gas_price.map(|price| price.to_string()))
        .bind(receipt.contract_address.as_ref().map(|a| a.as_slice()))
        .bind(&receipt.revert_reason)
        .execute(&mut *conn)
        .await
        .map_err(map_write_error)?;
    }
    Ok(())
}

/// Flag every canonical block above `number` as an ommer.
pub async fn demote_above(conn: &mut PgConnection, number: u64) -> StorageResult<u64> {
    let result = sqlx::query("UPDATE blocks SET canonical = FALSE WHERE number > $1 AND canonical")
        .bind(number as i64)
        .execute(&mut *conn)
        .await
        .map_err(map_write_error)?;
    Ok(result.rows_affected())
}

pub async fn canonical_block(pool: &PgPool, number: u64) -> StorageResult<Option<BlockId>> {
    let row = sqlx::query_as::<_, BlockIdRow>(
        r#"
        SELECT number, hash
        FROM blocks
        WHERE number = $1 AND canonical
        "#,
    )
    .bind(number as i64)
    .fetch_optional(pool)
    .await
    .map_err(|e| StorageError::QueryError(e.to_string()))?;

    row.map(BlockIdRow::into_block_id).transpose()
}

/// Database row representation for a block identifier.
#[derive(sqlx::FromRow)]
struct BlockIdRow {
    number: i64,
    hash: Vec<u8>,
}

impl BlockIdRow {
    fn into_block_id(self) -> StorageResult<BlockId> {
        Ok(BlockId {
            number: self.number as u64,
            hash: bytes_to_b256_strict(self.hash, "blocks.hash")?,
        })
    }
}
