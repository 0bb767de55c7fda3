//! Internal transactions, contracts and the per-block trace archive.

use alloy_primitives::{Address, B256, keccak256};
use sqlx::{PgConnection, PgPool};

use tributary_core::codec::{self, TraceArchive};
use tributary_core::error::{StorageError, StorageResult};
use tributary_core::models::{
    ClassifiedContract, ContractCapabilities, ContractCreated, ContractDestroyed,
    InternalTransaction, NormalizedBlock, TxHash,
};

use super::helpers::map_write_error;

/// Drop rows derived from a transaction before rewriting them.
///
/// A transaction re-included by a new branch may execute differently, so
/// its previous internal transactions, destructions, transfers and events
/// are replaced as a whole rather than merged.
pub async fn clear_derived(conn: &mut PgConnection, tx_hashes: &[TxHash]) -> StorageResult<()> {
    if tx_hashes.is_empty() {
        return Ok(());
    }
    let hashes: Vec<Vec<u8>> = tx_hashes.iter().map(|h| h.to_vec()).collect();

    for table in [
        "internal_transactions",
        "contract_destructions",
        "token_transfers",
        "contract_events",
    ] {
        // Table names come from the fixed list above.
        sqlx::query(&format!(
            "DELETE FROM {table} WHERE transaction_hash = ANY($1)"
        ))
        .bind(&hashes)
        .execute(&mut *conn)
        .await
        .map_err(map_write_error)?;
    }
    Ok(())
}

pub async fn insert_internal_transactions(
    conn: &mut PgConnection,
    internal: &[InternalTransaction],
) -> StorageResult<()> {
    for tx in internal {
        sqlx::query(
            r#"
            INSERT INTO internal_transactions (transaction_hash, pc, sender, recipient, amount)
            VALUES ($1, $2, $3, $4, $5::NUMERIC)
            ON CONFLICT (transaction_hash, pc) DO UPDATE SET
                sender = EXCLUDED.sender,
                recipient = EXCLUDED.recipient,
                amount = EXCLUDED.amount
            "#,
        )
        .bind(tx.transaction_hash.as_slice())
        .bind(tx.pc as i32)
        .bind(tx.from.as_slice())
        .bind(tx.to.as_slice())
        .bind(tx.amount.to_string())
        .execute(&mut *conn)
        .await
        .map_err(map_write_error)?;
    }
    Ok(())
}

pub async fn upsert_created_contracts(
    conn: &mut PgConnection,
    block_number: u64,
    contracts: &[ContractCreated],
) -> StorageResult<()> {
    for contract in contracts {
        sqlx::query(
            r#"
            INSERT INTO contracts (
                address, block_number, transaction_hash, pc, creator, endowment,
                code, code_hash, capabilities, contract_type
            )
            VALUES ($1, $2, $3, $4, $5, $6::NUMERIC, $7, $8, $9, $10)
            ON CONFLICT (address) DO UPDATE SET
                block_number = EXCLUDED.block_number,
                transaction_hash = EXCLUDED.transaction_hash,
                pc = EXCLUDED.pc,
                creator = EXCLUDED.creator,
                endowment = EXCLUDED.endowment,
                code = EXCLUDED.code,
                code_hash = EXCLUDED.code_hash,
                capabilities = EXCLUDED.capabilities,
                contract_type = EXCLUDED.contract_type
            "#,
        )
        .bind(contract.address.as_slice())
        .bind(block_number as i64)
        .bind(contract.transaction_hash.as_slice())
        .bind(contract.pc as i32)
        .bind(contract.creator.as_slice())
        .bind(contract.amount.to_string())
        .bind(&contract.code[..])
        .bind(keccak256(&contract.code).as_slice())
        .bind(contract.capabilities.bits() as i32)
        .bind(contract.contract_type.as_str())
        .execute(&mut *conn)
        .await
        .map_err(map_write_error)?;
    }
    Ok(())
}

/// Store capabilities of contracts deployed before indexing reached them.
///
/// A creation row, when one exists, is authoritative and left untouched.
pub async fn insert_classified_contracts(
    conn: &mut PgConnection,
    contracts: &[ClassifiedContract],
) -> StorageResult<()> {
    for contract in contracts {
        sqlx::query(
            r#"
            INSERT INTO contracts (address, block_number, code_hash, capabilities, contract_type)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (address) DO NOTHING
            "#,
        )
        .bind(contract.address.as_slice())
        .bind(contract.block_number as i64)
        .bind(contract.code_hash.as_slice())
        .bind(contract.capabilities.bits() as i32)
        .bind(contract.contract_type.as_str())
        .execute(&mut *conn)
        .await
        .map_err(map_write_error)?;
    }
    Ok(())
}

pub async fn insert_destructions(
    conn: &mut PgConnection,
    destroyed: &[ContractDestroyed],
) -> StorageResult<()> {
    for contract in destroyed {
        sqlx::query(
            r#"
            INSERT INTO contract_destructions (
                transaction_hash, pc, address, refund_address, refund_amount
            )
            VALUES ($1, $2, $3, $4, $5::NUMERIC)
            ON CONFLICT (transaction_hash, pc) DO UPDATE SET
                address = EXCLUDED.address,
                refund_address = EXCLUDED.refund_address,
                refund_amount = EXCLUDED.refund_amount
            "#,
        )
        .bind(contract.transaction_hash.as_slice())
        .bind(contract.pc as i32)
        .bind(contract.address.as_slice())
        .bind(contract.refund_address.as_slice())
        .bind(contract.refund_amount.to_string())
        .execute(&mut *conn)
        .await
        .map_err(map_write_error)?;
    }
    Ok(())
}

/// Store the block's trace products as one binary record.
pub async fn upsert_archive(conn: &mut PgConnection, block: &NormalizedBlock) -> StorageResult<()> {
    let archive = codec::encode(&TraceArchive::of(block))
        .map_err(|e| StorageError::SerializationError(e.to_string()))?;

    sqlx::query(
        r#"
        INSERT INTO block_traces (block_hash, archive)
        VALUES ($1, $2)
        ON CONFLICT (block_hash) DO UPDATE SET archive = EXCLUDED.archive
        "#,
    )
    .bind(block.block.hash.as_slice())
    .bind(archive)
    .execute(&mut *conn)
    .await
    .map_err(map_write_error)?;
    Ok(())
}

pub async fn get_archive(pool: &PgPool, block_hash: &B256) -> StorageResult<Option<TraceArchive>> {
    let row: Option<(Vec<u8>,)> =
        sqlx::query_as("SELECT archive FROM block_traces WHERE block_hash = $1")
            .bind(block_hash.as_slice())
            .fetch_optional(pool)
            .await
            .map_err(|e| StorageError::QueryError(e.to_string()))?;

    row.map(|(bytes,)| {
        codec::decode(&bytes).map_err(|e| StorageError::SerializationError(e.to_string()))
    })
    .transpose()
}

pub async fn capabilities(
    pool: &PgPool,
    address: &Address,
) -> StorageResult<Option<ContractCapabilities>> {
    let row: Option<(i32,)> = sqlx::query_as("SELECT capabilities FROM contracts WHERE address = $1")
        .bind(address.as_slice())
        .fetch_optional(pool)
        .await
        .map_err(|e| StorageError::QueryError(e.to_string()))?;

    Ok(row.map(|(bits,)| ContractCapabilities::from_bits(bits as u16)))
}
