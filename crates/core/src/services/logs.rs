//! Log interpreter.
//!
//! Turns receipt logs into token transfers and contract event rows.
//!
//! `Transfer(address,address,uint256)` is shared by ERC20 and ERC721, so the
//! shape alone is ambiguous when the token id is not indexed. The emitting
//! contract's capabilities settle it: a three-topic Transfer from an ERC721
//! or ERC1155 contract carries a token id in its data word. A four-topic
//! Transfer is always non-fungible.

use std::collections::HashMap;
use std::hash::BuildHasher;

use alloy_primitives::{Address, U256};
use alloy_sol_types::SolEvent;

use crate::models::{
    ContractCapabilities, ContractEvent, Log, TokenEvent, TokenTransfer, TransferValue, TxHash,
};

mod abi {
    use alloy_sol_types::sol;

    sol! {
        event ApprovalForAll(address indexed owner, address indexed operator, bool approved);

        event Sent(
            address indexed operator,
            address indexed from,
            address indexed to,
            uint256 amount,
            bytes data,
            bytes operatorData
        );
        event Minted(
            address indexed operator,
            address indexed to,
            uint256 amount,
            bytes data,
            bytes operatorData
        );
        event Burned(
            address indexed operator,
            address indexed from,
            uint256 amount,
            bytes data,
            bytes operatorData
        );
        event AuthorizedOperator(address indexed operator, address indexed holder);
        event RevokedOperator(address indexed operator, address indexed holder);

        event TransferSingle(
            address indexed operator,
            address indexed from,
            address indexed to,
            uint256 id,
            uint256 value
        );
        event TransferBatch(
            address indexed operator,
            address indexed from,
            address indexed to,
            uint256[] ids,
            uint256[] values
        );
        event URI(string value, uint256 indexed id);
    }

    pub mod fungible {
        use alloy_sol_types::sol;

        sol! {
            event Transfer(address indexed from, address indexed to, uint256 value);
            event Approval(address indexed owner, address indexed spender, uint256 value);
        }
    }

    pub mod non_fungible {
        use alloy_sol_types::sol;

        sol! {
            event Approval(address indexed owner, address indexed approved, uint256 indexed tokenId);
        }
    }
}

pub use abi::fungible::Transfer as TransferEvent;

/// Capabilities known for contracts while a block is interpreted.
pub trait CapabilityLookup {
    fn capabilities(&self, contract: &Address) -> Option<ContractCapabilities>;
}

impl<S: BuildHasher> CapabilityLookup for HashMap<Address, ContractCapabilities, S> {
    fn capabilities(&self, contract: &Address) -> Option<ContractCapabilities> {
        self.get(contract).copied()
    }
}

/// Rows derived from one transaction's logs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogOutput {
    pub token_transfers: Vec<TokenTransfer>,
    pub contract_events: Vec<ContractEvent>,
}

/// Whether the log carries the `Transfer(address,address,uint256)` signature.
pub fn is_transfer(log: &Log) -> bool {
    log.topics.first() == Some(&TransferEvent::SIGNATURE_HASH)
}

/// Interpret a transaction's logs in order.
///
/// Every log yields exactly one row: a token transfer when it has a valid
/// Transfer shape, a contract event otherwise.
pub fn interpret(
    tx_hash: TxHash,
    logs: &[Log],
    capabilities: &dyn CapabilityLookup,
) -> LogOutput {
    let mut output = LogOutput::default();
    for log in logs {
        if let Some(transfer) = classify_transfer(tx_hash, log, capabilities) {
            output.token_transfers.push(transfer);
            continue;
        }
        output.contract_events.push(ContractEvent {
            transaction_hash: tx_hash,
            log_index: log.log_index,
            contract: log.address,
            topics: log.topics.clone(),
            data: log.data.clone(),
            decoded: decode_token_event(log),
        });
    }
    output
}

fn classify_transfer(
    tx_hash: TxHash,
    log: &Log,
    capabilities: &dyn CapabilityLookup,
) -> Option<TokenTransfer> {
    if !is_transfer(log) {
        return None;
    }

    let value = match (log.topics.len(), log.data.len()) {
        (3, 32) => {
            let word = U256::from_be_slice(&log.data);
            let non_fungible = capabilities
                .capabilities(&log.address)
                .is_some_and(ContractCapabilities::is_non_fungible);
            if non_fungible {
                TransferValue::NonFungible { token_id: word }
            } else {
                TransferValue::Fungible { amount: word }
            }
        }
        (4, 0) => TransferValue::NonFungible {
            token_id: U256::from_be_bytes(log.topics[3].0),
        },
        _ => return None,
    };

    Some(TokenTransfer {
        transaction_hash: tx_hash,
        log_index: log.log_index,
        contract: log.address,
        from: Address::from_word(log.topics[1]),
        to: Address::from_word(log.topics[2]),
        value,
    })
}

fn decode<E: SolEvent>(log: &Log) -> Option<E> {
    E::decode_raw_log(log.topics.iter().copied(), &log.data).ok()
}

/// Decode a standard token event other than Transfer.
fn decode_token_event(log: &Log) -> Option<TokenEvent> {
    use abi::*;

    let topic0 = *log.topics.first()?;

    if topic0 == fungible::Approval::SIGNATURE_HASH {
        return match log.topics.len() {
            3 => decode::<fungible::Approval>(log).map(|e| TokenEvent::FungibleApproval {
                owner: e.owner,
                spender: e.spender,
                value: e.value,
            }),
            4 => decode::<non_fungible::Approval>(log).map(|e| TokenEvent::NonFungibleApproval {
                owner: e.owner,
                approved: e.approved,
                token_id: e.tokenId,
            }),
            _ => None,
        };
    }

    if topic0 == ApprovalForAll::SIGNATURE_HASH {
        decode::<ApprovalForAll>(log).map(|e| TokenEvent::ApprovalForAll {
            owner: e.owner,
            operator: e.operator,
            approved: e.approved,
        })
    } else if topic0 == Sent::SIGNATURE_HASH {
        decode::<Sent>(log).map(|e| TokenEvent::Sent {
            operator: e.operator,
            from: e.from,
            to: e.to,
            amount: e.amount,
            data: e.data,
            operator_data: e.operatorData,
        })
    } else if topic0 == Minted::SIGNATURE_HASH {
        decode::<Minted>(log).map(|e| TokenEvent::Minted {
            operator: e.operator,
            to: e.to,
            amount: e.amount,
            data: e.data,
            operator_data: e.operatorData,
        })
    } else if topic0 == Burned::SIGNATURE_HASH {
        decode::<Burned>(log).map(|e| TokenEvent::Burned {
            operator: e.operator,
            from: e.from,
            amount: e.amount,
            data: e.data,
            operator_data: e.operatorData,
        })
    } else if topic0 == AuthorizedOperator::SIGNATURE_HASH {
        decode::<AuthorizedOperator>(log).map(|e| TokenEvent::AuthorizedOperator {
            operator: e.operator,
            holder: e.holder,
        })
    } else if topic0 == RevokedOperator::SIGNATURE_HASH {
        decode::<RevokedOperator>(log).map(|e| TokenEvent::RevokedOperator {
            operator: e.operator,
            holder: e.holder,
        })
    } else if topic0 == TransferSingle::SIGNATURE_HASH {
        decode::<TransferSingle>(log).map(|e| TokenEvent::TransferSingle {
            operator: e.operator,
            from: e.from,
            to: e.to,
            id: e.id,
            value: e.value,
        })
    } else if topic0 == TransferBatch::SIGNATURE_HASH {
        decode::<TransferBatch>(log).map(|e| TokenEvent::TransferBatch {
            operator: e.operator,
            from: e.from,
            to: e.to,
            ids: e.ids,
            values: e.values,
        })
    } else if topic0 == URI::SIGNATURE_HASH {
        decode::<URI>(log).map(|e| TokenEvent::Uri {
            id: e.id,
            value: e.value,
        })
    } else {
        None
    }
}
