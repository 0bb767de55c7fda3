//! Token transfers and contract events.

use sqlx::PgConnection;

use tributary_core::error::{StorageError, StorageResult};
use tributary_core::models::{ContractEvent, TokenTransfer, TransferValue};

use super::helpers::map_write_error;

pub async fn insert_token_transfers(
    conn: &mut PgConnection,
    transfers: &[TokenTransfer],
) -> StorageResult<()> {
    for transfer in transfers {
        let (amount, token_id) = match transfer.value {
            TransferValue::Fungible { amount } => (Some(amount.to_string()), None),
            TransferValue::NonFungible { token_id } => (None, Some(token_id.to_string())),
        };

        sqlx::query(
            r#"
            INSERT INTO token_transfers (
                transaction_hash, log_index, contract, sender, recipient, amount, token_id
            )
            VALUES ($1, $2, $3, $4, $5, $6::NUMERIC, $7::NUMERIC)
            ON CONFLICT (transaction_hash, log_index) DO UPDATE SET
                contract = EXCLUDED.contract,
                sender = EXCLUDED.sender,
                recipient = EXCLUDED.recipient,
                amount = EXCLUDED.amount,
                token_id = EXCLUDED.token_id
            "#,
        )
        .bind(transfer.transaction_hash.as_slice())
        .bind(transfer.log_index as i32)
        .bind(transfer.contract.as_slice())
        .bind(transfer.from.as_slice())
        .bind(transfer.to.as_slice())
        .bind(amount)
        .bind(token_id)
        .execute(&mut *conn)
        .await
        .map_err(map_write_error)?;
    }
    Ok(())
}

pub async fn insert_contract_events(
    conn: &mut PgConnection,
    events: &[ContractEvent],
) -> StorageResult<()> {
    for event in events {
        let topics: Vec<Vec<u8>> = event.topics.iter().map(|t| t.to_vec()).collect();
        let decoded = event
            .decoded
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO contract_events (transaction_hash, log_index, contract, topics, data, decoded)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (transaction_hash, log_index) DO UPDATE SET
                contract = EXCLUDED.contract,
                topics = EXCLUDED.topics,
                data = EXCLUDED.data,
                decoded = EXCLUDED.decoded
            "#,
        )
        .bind(event.transaction_hash.as_slice())
        .bind(event.log_index as i32)
        .bind(event.contract.as_slice())
        .bind(topics)
        .bind(&event.data[..])
        .bind(decoded)
        .execute(&mut *conn)
        .await
        .map_err(map_write_error)?;
    }
    Ok(())
}
