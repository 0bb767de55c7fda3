//! Rewards, balance deltas and the canonical balance view.

use std::collections::BTreeMap;

use alloy_primitives::{Address, I256};
use sqlx::{PgConnection, PgPool};

use tributary_core::error::{StorageError, StorageResult};
use tributary_core::models::{BalanceDelta, Reward};

use super::helpers::{bytes_to_address, map_write_error, numeric_to_i256};

pub async fn insert_rewards(conn: &mut PgConnection, rewards: &[Reward]) -> StorageResult<()> {
    for reward in rewards {
        sqlx::query(
            r#"
            INSERT INTO rewards (block_hash, hash, beneficiary, amount, kind)
            VALUES ($1, $2, $3, $4::NUMERIC, $5)
            ON CONFLICT (block_hash, hash) DO NOTHING
            "#,
        )
        .bind(reward.block_hash.as_slice())
        .bind(reward.hash.as_slice())
        .bind(reward.beneficiary.as_slice())
        .bind(reward.amount.to_string())
        .bind(reward.kind.as_str())
        .execute(&mut *conn)
        .await
        .map_err(map_write_error)?;
    }
    Ok(())
}

/// Deltas of a block are a pure function of the block, so a replayed commit
/// writes identical rows.
pub async fn insert_deltas(conn: &mut PgConnection, deltas: &[BalanceDelta]) -> StorageResult<()> {
    for delta in deltas {
        sqlx::query(
            r#"
            INSERT INTO balance_deltas (
                block_hash, index, block_number, account, amount, reason, transaction_hash
            )
            VALUES ($1, $2, $3, $4, $5::NUMERIC, $6, $7)
            ON CONFLICT (block_hash, index) DO NOTHING
            "#,
        )
        .bind(delta.block_hash.as_slice())
        .bind(delta.index as i32)
        .bind(delta.block_number as i64)
        .bind(delta.account.as_slice())
        .bind(delta.amount.to_string())
        .bind(delta.reason.as_str())
        .bind(delta.transaction_hash.as_ref().map(|h| h.as_slice()))
        .execute(&mut *conn)
        .await
        .map_err(map_write_error)?;
    }
    Ok(())
}

pub async fn canonical_balances(pool: &PgPool) -> StorageResult<BTreeMap<Address, I256>> {
    let rows: Vec<(Vec<u8>, String)> =
        sqlx::query_as("SELECT account, balance::TEXT FROM canonical_balances")
            .fetch_all(pool)
            .await
            .map_err(|e| StorageError::QueryError(e.to_string()))?;

    rows.into_iter()
        .map(|(account, balance)| {
            Ok((
                bytes_to_address(account, "canonical_balances.account")?,
                numeric_to_i256(&balance, "canonical_balances.balance")?,
            ))
        })
        .filter(|entry| !matches!(entry, Ok((_, balance)) if balance.is_zero()))
        .collect()
}
