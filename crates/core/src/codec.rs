//! Compact binary records.
//!
//! Records are written as a one-byte type tag followed by the `bincode`
//! layout of the value (fixed-width little-endian integers, a presence byte
//! for optional fields). Decoding a buffer into the wrong record type fails
//! on the tag instead of producing garbage.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, CodecResult};
use crate::models::{
    BlockHash, ContractCapabilities, ContractCreated, ContractDestroyed, InternalTransaction,
    NormalizedBlock, Reward,
};

/// A value with a stable binary encoding.
pub trait Record: Serialize + DeserializeOwned {
    /// Type tag written before the body.
    const TAG: u8;
    /// Human-readable type name for errors.
    const NAME: &'static str;
}

/// Encode `record` with its type tag.
pub fn encode<R: Record>(record: &R) -> CodecResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    buf.push(R::TAG);
    bincode::serialize_into(&mut buf, record)?;
    Ok(buf)
}

/// Decode a buffer produced by [`encode`] for the same record type.
pub fn decode<R: Record>(bytes: &[u8]) -> CodecResult<R> {
    let (tag, body) = bytes.split_first().ok_or(CodecError::Empty)?;
    if *tag != R::TAG {
        return Err(CodecError::UnexpectedTag {
            expected: R::TAG,
            found: *tag,
            name: R::NAME,
        });
    }
    Ok(bincode::deserialize(body)?)
}

impl Record for InternalTransaction {
    const TAG: u8 = 0x01;
    const NAME: &'static str = "InternalTransaction";
}

impl Record for Reward {
    const TAG: u8 = 0x02;
    const NAME: &'static str = "Reward";
}

impl Record for ContractCapabilities {
    const TAG: u8 = 0x03;
    const NAME: &'static str = "ContractCapabilities";
}

impl Record for ContractCreated {
    const TAG: u8 = 0x04;
    const NAME: &'static str = "ContractCreated";
}

impl Record for ContractDestroyed {
    const TAG: u8 = 0x05;
    const NAME: &'static str = "ContractDestroyed";
}

/// Trace-derived rows of one block, archived as a single blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceArchive {
    pub block_hash: BlockHash,
    pub internal_transactions: Vec<InternalTransaction>,
    pub contracts_created: Vec<ContractCreated>,
    pub contracts_destroyed: Vec<ContractDestroyed>,
    pub rewards: Vec<Reward>,
}

impl Record for TraceArchive {
    const TAG: u8 = 0x10;
    const NAME: &'static str = "TraceArchive";
}

impl TraceArchive {
    /// Collect the archived parts of a normalized block.
    pub fn of(block: &NormalizedBlock) -> Self {
        Self {
            block_hash: block.block.hash,
            internal_transactions: block.internal_transactions.clone(),
            contracts_created: block.contracts_created.clone(),
            contracts_destroyed: block.contracts_destroyed.clone(),
            rewards: block.rewards.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Capability, ContractType, RewardKind};
    use alloy_primitives::{Address, B256, Bytes, U256};

    fn internal_tx() -> InternalTransaction {
        InternalTransaction {
            transaction_hash: B256::repeat_byte(0x11),
            pc: 3,
            from: Address::repeat_byte(0xaa),
            to: Address::repeat_byte(0xbb),
            amount: U256::from(10u64),
        }
    }

    #[test]
    fn test_internal_transaction_roundtrip() {
        let tx = internal_tx();
        let bytes = encode(&tx).unwrap();
        assert_eq!(bytes[0], InternalTransaction::TAG);
        assert_eq!(decode::<InternalTransaction>(&bytes).unwrap(), tx);
    }

    // Test critique: un buffer d'un autre type est rejeté par le tag
    #[test]
    fn test_wrong_record_type_rejected() {
        let bytes = encode(&internal_tx()).unwrap();
        let err = decode::<Reward>(&bytes).unwrap_err();
        assert!(matches!(
            err,
            CodecError::UnexpectedTag {
                expected: 0x02,
                found: 0x01,
                ..
            }
        ));
        assert!(matches!(decode::<Reward>(&[]), Err(CodecError::Empty)));
    }

    #[test]
    fn test_truncated_body_fails() {
        let bytes = encode(&internal_tx()).unwrap();
        assert!(decode::<InternalTransaction>(&bytes[..bytes.len() - 4]).is_err());
    }

    // Test critique: les records imbriqués survivent à l'archivage
    #[test]
    fn test_archive_with_nested_records() {
        let created = ContractCreated {
            transaction_hash: B256::repeat_byte(1),
            pc: 1,
            creator: Address::repeat_byte(2),
            address: Address::repeat_byte(3),
            code: Bytes::from_static(&[0x60, 0x80]),
            amount: U256::ZERO,
            capabilities: [Capability::Erc20].into_iter().collect(),
            contract_type: ContractType::Erc20,
        };
        let archive = TraceArchive {
            block_hash: B256::repeat_byte(9),
            internal_transactions: vec![internal_tx()],
            contracts_created: vec![created],
            contracts_destroyed: vec![],
            rewards: vec![Reward {
                block_hash: B256::repeat_byte(9),
                hash: B256::repeat_byte(9),
                beneficiary: Address::repeat_byte(4),
                amount: U256::from(2_000_000_000_000_000_000u128),
                kind: RewardKind::Block,
            }],
        };
        let decoded: TraceArchive = decode(&encode(&archive).unwrap()).unwrap();
        assert_eq!(decoded, archive);
    }
}
