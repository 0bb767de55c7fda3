//! Trace extractor.
//!
//! Flattens a transaction's call tree into internal transactions and
//! contract lifecycle records, in pre-order (call order). The walk uses an
//! explicit stack over the [`CallTrace`] arena, so adversarially deep call
//! chains cannot exhaust the native stack.
//!
//! Frames that failed are pruned together with their whole subtree: a
//! reverted call moved no value and created nothing, whatever its children
//! reported.

use alloy_primitives::Address;

use crate::error::{ExtractionError, ExtractionResult};
use crate::models::{
    CallKind, CallTrace, ContractCapabilities, ContractCreated, ContractDestroyed, ContractType,
    FrameId, InternalTransaction, TxHash,
};

/// Records extracted from one transaction's trace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceOutput {
    pub internal_transactions: Vec<InternalTransaction>,
    pub contracts_created: Vec<ContractCreated>,
    pub contracts_destroyed: Vec<ContractDestroyed>,
}

impl TraceOutput {
    /// Every address the extracted records mention.
    pub fn touched(&self) -> impl Iterator<Item = Address> + '_ {
        let internal = self
            .internal_transactions
            .iter()
            .flat_map(|tx| [tx.from, tx.to]);
        let created = self
            .contracts_created
            .iter()
            .flat_map(|c| [c.creator, c.address]);
        let destroyed = self
            .contracts_destroyed
            .iter()
            .flat_map(|d| [d.address, d.refund_address]);
        internal.chain(created).chain(destroyed)
    }
}

/// Extract internal transactions and contract events from `trace`.
///
/// The program counter of each record is the pre-order index of its frame,
/// the root being 0. Capabilities of created contracts are left empty for
/// the capability detector to fill in.
pub fn extract(tx_hash: TxHash, trace: &CallTrace) -> ExtractionResult<TraceOutput> {
    let malformed = |reason: String| ExtractionError::MalformedTrace { tx_hash, reason };

    if trace.is_empty() {
        return Err(malformed("trace has no root frame".into()));
    }

    let mut output = TraceOutput::default();
    let mut visited = vec![false; trace.len()];
    let mut stack: Vec<FrameId> = vec![0];
    let mut next_pc: u32 = 0;

    while let Some(id) = stack.pop() {
        let frame = trace
            .frame(id)
            .ok_or_else(|| malformed(format!("frame {id} is referenced but missing")))?;
        if std::mem::replace(&mut visited[id], true) {
            return Err(malformed(format!("frame {id} is reachable twice")));
        }

        let pc = next_pc;
        next_pc += 1;

        if frame.failed() {
            continue;
        }

        match frame.kind {
            CallKind::Create | CallKind::Create2 => {
                let address = frame.to.ok_or_else(|| {
                    malformed(format!("{:?} frame {pc} has no created address", frame.kind))
                })?;
                output.contracts_created.push(ContractCreated {
                    transaction_hash: tx_hash,
                    pc,
                    creator: frame.from,
                    address,
                    code: frame.output.clone(),
                    amount: frame.value,
                    capabilities: ContractCapabilities::empty(),
                    contract_type: ContractType::Generic,
                });
            }
            CallKind::SelfDestruct => {
                let refund_address = frame.to.ok_or_else(|| {
                    malformed(format!("selfdestruct frame {pc} has no refund address"))
                })?;
                output.contracts_destroyed.push(ContractDestroyed {
                    transaction_hash: tx_hash,
                    pc,
                    address: frame.from,
                    refund_address,
                    refund_amount: frame.value,
                });
            }
            kind => match frame.to {
                // The root's value is the transaction's own transfer.
                _ if id == 0 => {}
                None => {
                    return Err(malformed(format!("{kind:?} frame {pc} has no target")));
                }
                Some(to) => {
                    if kind.moves_value() && !frame.value.is_zero() {
                        output.internal_transactions.push(InternalTransaction {
                            transaction_hash: tx_hash,
                            pc,
                            from: frame.from,
                            to,
                            amount: frame.value,
                        });
                    }
                }
            },
        }

        stack.extend(frame.children.iter().rev().copied());
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CallFrame;
    use alloy_primitives::{B256, U256};
    use proptest::prelude::*;

    const TX: B256 = B256::repeat_byte(0x77);

    fn addr(b: u8) -> Address {
        Address::repeat_byte(b)
    }

    fn call(from: u8, to: u8, value: u64) -> CallFrame {
        CallFrame::new(CallKind::Call, addr(from), Some(addr(to)), U256::from(value))
    }

    fn amounts(output: &TraceOutput) -> Vec<(Address, Address, U256)> {
        output
            .internal_transactions
            .iter()
            .map(|tx| (tx.from, tx.to, tx.amount))
            .collect()
    }

    // Test critique: A→B (10) puis B→C (3) sortent dans l'ordre d'appel
    #[test]
    fn test_nested_calls_in_call_order() {
        let mut trace = CallTrace::new(call(0xee, 0xaa, 0));
        let b = trace.push_child(0, call(0xaa, 0xbb, 10)).unwrap();
        trace.push_child(b, call(0xbb, 0xcc, 3)).unwrap();

        let output = extract(TX, &trace).unwrap();
        assert_eq!(
            amounts(&output),
            vec![
                (addr(0xaa), addr(0xbb), U256::from(10)),
                (addr(0xbb), addr(0xcc), U256::from(3)),
            ]
        );
        assert_eq!(
            output
                .internal_transactions
                .iter()
                .map(|t| t.pc)
                .collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    // Test critique: pré-ordre strict, le sous-arbre du premier enfant passe avant son frère
    #[test]
    fn test_preorder_across_siblings() {
        let mut trace = CallTrace::new(call(0xee, 0xaa, 0));
        let x = trace.push_child(0, call(0xaa, 0x01, 1)).unwrap();
        trace.push_child(0, call(0xaa, 0x03, 3)).unwrap();
        trace.push_child(x, call(0x01, 0x02, 2)).unwrap();

        let output = extract(TX, &trace).unwrap();
        let targets: Vec<_> = output.internal_transactions.iter().map(|t| t.to).collect();
        assert_eq!(targets, vec![addr(0x01), addr(0x02), addr(0x03)]);
    }

    // Test critique: un appel revert élimine tout son sous-arbre
    #[test]
    fn test_reverted_subtree_pruned() {
        let mut trace = CallTrace::new(call(0xee, 0xaa, 0));
        let failed = trace
            .push_child(0, call(0xaa, 0xbb, 5).with_error("execution reverted"))
            .unwrap();
        trace.push_child(failed, call(0xbb, 0xcc, 4)).unwrap();
        trace.push_child(0, call(0xaa, 0xdd, 1)).unwrap();

        let output = extract(TX, &trace).unwrap();
        assert_eq!(amounts(&output), vec![(addr(0xaa), addr(0xdd), U256::from(1))]);
    }

    #[test]
    fn test_failed_root_yields_nothing() {
        let mut trace = CallTrace::new(call(0xee, 0xaa, 7).with_error("out of gas"));
        trace.push_child(0, call(0xaa, 0xbb, 5)).unwrap();
        assert_eq!(extract(TX, &trace).unwrap(), TraceOutput::default());
    }

    #[test]
    fn test_root_value_and_zero_value_calls_skipped() {
        let mut trace = CallTrace::new(call(0xee, 0xaa, 100));
        trace.push_child(0, call(0xaa, 0xbb, 0)).unwrap();
        let mut delegate = call(0xaa, 0xcc, 9);
        delegate.kind = CallKind::DelegateCall;
        trace.push_child(0, delegate).unwrap();

        let output = extract(TX, &trace).unwrap();
        assert!(output.internal_transactions.is_empty());
    }

    #[test]
    fn test_create_and_selfdestruct_records() {
        let mut trace = CallTrace::new(call(0xee, 0xaa, 0));
        let create = CallFrame::new(CallKind::Create2, addr(0xaa), Some(addr(0xc1)), U256::from(8))
            .with_output(vec![0x60, 0x80]);
        let created = trace.push_child(0, create).unwrap();
        let kill = CallFrame::new(
            CallKind::SelfDestruct,
            addr(0xc1),
            Some(addr(0xee)),
            U256::from(8),
        );
        trace.push_child(created, kill).unwrap();

        let output = extract(TX, &trace).unwrap();
        assert!(output.internal_transactions.is_empty());

        let c = &output.contracts_created[0];
        assert_eq!((c.pc, c.creator, c.address), (1, addr(0xaa), addr(0xc1)));
        assert_eq!(c.amount, U256::from(8));
        assert_eq!(&c.code[..], &[0x60u8, 0x80][..]);
        assert!(!c.is_top_level());

        let d = &output.contracts_destroyed[0];
        assert_eq!((d.pc, d.address, d.refund_address), (2, addr(0xc1), addr(0xee)));

        let touched: Vec<_> = output.touched().collect();
        assert!(touched.contains(&addr(0xc1)) && touched.contains(&addr(0xee)));
    }

    #[test]
    fn test_top_level_create_has_pc_zero() {
        let root = CallFrame::new(CallKind::Create, addr(0xee), Some(addr(0xc1)), U256::from(1));
        let output = extract(TX, &CallTrace::new(root)).unwrap();
        assert!(output.contracts_created[0].is_top_level());
    }

    // Test critique: cible nulle hors racine = trace malformée, jamais ignorée
    #[test]
    fn test_null_target_below_root_is_malformed() {
        let mut trace = CallTrace::new(call(0xee, 0xaa, 0));
        trace
            .push_child(0, CallFrame::new(CallKind::Call, addr(0xaa), None, U256::from(1)))
            .unwrap();

        let err = extract(TX, &trace).unwrap_err();
        let ExtractionError::MalformedTrace { tx_hash, reason } = err;
        assert_eq!(tx_hash, TX);
        assert!(reason.contains("no target"));
    }

    #[test]
    fn test_empty_trace_is_malformed() {
        assert!(extract(TX, &CallTrace::default()).is_err());
    }

    // Test critique: pas de débordement de pile sur une chaîne d'appels très profonde
    #[test]
    fn test_deep_chain_is_iterative() {
        const DEPTH: usize = 200_000;
        let mut trace = CallTrace::new(call(0xee, 0x01, 0));
        let mut parent = 0;
        for _ in 0..DEPTH {
            parent = trace.push_child(parent, call(0x01, 0x02, 1)).unwrap();
        }

        let output = extract(TX, &trace).unwrap();
        assert_eq!(output.internal_transactions.len(), DEPTH);
        assert_eq!(output.internal_transactions.last().map(|t| t.pc), Some(DEPTH as u32));
    }

    proptest! {
        // Test critique: extraction déterministe, pc strictement croissants
        #[test]
        fn prop_extraction_is_deterministic_and_ordered(
            shape in prop::collection::vec((any::<prop::sample::Index>(), 0u64..4, any::<bool>()), 0..64)
        ) {
            let mut trace = CallTrace::new(call(0xee, 0xaa, 0));
            for (i, (parent, value, failed)) in shape.iter().enumerate() {
                let parent = parent.index(i + 1);
                let mut frame = call(0xaa, (i % 250) as u8, *value);
                if *failed {
                    frame = frame.with_error("reverted");
                }
                trace.push_child(parent, frame).unwrap();
            }

            let first = extract(TX, &trace).unwrap();
            let second = extract(TX, &trace).unwrap();
            prop_assert_eq!(&first, &second);
            prop_assert!(first.internal_transactions.windows(2).all(|w| w[0].pc < w[1].pc));
            prop_assert!(first.internal_transactions.iter().all(|t| !t.amount.is_zero()));
        }
    }
}
