//! Balance delta calculator.
//!
//! Every value movement in a block becomes a pair of deltas (debit and
//! credit), except issuance (credited from nowhere) and the burned share of
//! fees (debited to nowhere). Summing a block's deltas therefore yields
//! `issuance - fees_burned`, which [`BlockBalances::verify_conservation`]
//! checks before anything is committed.

use std::collections::BTreeMap;

use alloy_primitives::{Address, I256, U256};

use crate::error::{IndexerError, IndexerResult};
use crate::models::{
    BalanceDelta, Block, BlockId, ContractCreated, ContractDestroyed, DeltaReason,
    InternalTransaction, NormalizedBlock, Reward, RewardKind, TransactionReceipt, TxHash,
};

// =============================================================================
// Reward Schedule
// =============================================================================

const ETHER: u64 = 1_000_000_000_000_000_000;

/// Block reward per era, keyed by the first block of each era.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardSchedule {
    eras: Vec<(u64, U256)>,
}

impl RewardSchedule {
    /// Build a schedule from `(from_block, reward)` eras in any order.
    pub fn new(eras: impl IntoIterator<Item = (u64, U256)>) -> Self {
        let mut eras: Vec<_> = eras.into_iter().collect();
        eras.sort_by_key(|(from, _)| *from);
        Self { eras }
    }

    /// Ethereum mainnet: Frontier, Byzantium, Constantinople, then the Merge.
    pub fn mainnet() -> Self {
        Self::new([
            (0, U256::from(5 * ETHER)),
            (4_370_000, U256::from(3 * ETHER)),
            (7_280_000, U256::from(2 * ETHER)),
            (15_537_394, U256::ZERO),
        ])
    }

    pub fn constant(reward: U256) -> Self {
        Self::new([(0, reward)])
    }

    /// No issuance at all, as on proof-of-stake or private chains.
    pub fn none() -> Self {
        Self::new([])
    }

    /// Base reward of the block at `number`.
    pub fn block_reward(&self, number: u64) -> U256 {
        self.eras
            .iter()
            .rev()
            .find(|(from, _)| *from <= number)
            .map(|(_, reward)| *reward)
            .unwrap_or(U256::ZERO)
    }
}

impl Default for RewardSchedule {
    fn default() -> Self {
        Self::mainnet()
    }
}

// =============================================================================
// Computation
// =============================================================================

/// One block's execution results, as seen by the calculator.
///
/// `receipts` are aligned with `block.transactions` by position.
#[derive(Debug, Clone, Copy)]
pub struct BlockInput<'a> {
    pub block: &'a Block,
    pub receipts: &'a [TransactionReceipt],
    pub internal_transactions: &'a [InternalTransaction],
    pub contracts_created: &'a [ContractCreated],
    pub contracts_destroyed: &'a [ContractDestroyed],
}

impl<'a> BlockInput<'a> {
    /// Recompute from an already normalized block.
    pub fn of(normalized: &'a NormalizedBlock) -> Self {
        Self {
            block: &normalized.block,
            receipts: &normalized.receipts,
            internal_transactions: &normalized.internal_transactions,
            contracts_created: &normalized.contracts_created,
            contracts_destroyed: &normalized.contracts_destroyed,
        }
    }
}

/// Rewards and deltas of one block, with the totals needed to check them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBalances {
    pub block: BlockId,
    pub rewards: Vec<Reward>,
    pub deltas: Vec<BalanceDelta>,
    pub issuance: U256,
    pub fees_burned: U256,
}

impl BlockBalances {
    /// Net change per account.
    pub fn net(&self) -> BTreeMap<Address, I256> {
        let mut net = BTreeMap::new();
        for delta in &self.deltas {
            *net.entry(delta.account).or_insert(I256::ZERO) += delta.amount;
        }
        net
    }

    /// Sum of every delta in the block.
    pub fn total(&self) -> I256 {
        self.deltas
            .iter()
            .fold(I256::ZERO, |acc, delta| acc + delta.amount)
    }

    /// Expected sum of all deltas: issuance minus burned fees.
    pub fn expected_total(&self) -> I256 {
        signed(self.issuance) - signed(self.fees_burned)
    }

    pub fn verify_conservation(&self) -> IndexerResult<()> {
        let expected = self.expected_total();
        let actual = self.total();
        if expected != actual {
            return Err(IndexerError::ConservationViolated {
                number: self.block.number,
                hash: self.block.hash,
                expected,
                actual,
            });
        }
        Ok(())
    }
}

/// Compute the rewards and balance deltas of a block.
pub fn compute(input: &BlockInput<'_>, schedule: &RewardSchedule) -> BlockBalances {
    let block = input.block;
    let mut ledger = Ledger::new(block.id());

    let rewards = rewards(block, schedule);
    for reward in &rewards {
        let reason = match reward.kind {
            RewardKind::Block => DeltaReason::BlockReward,
            RewardKind::Ommer => DeltaReason::OmmerReward,
        };
        ledger.credit(reward.beneficiary, reward.amount, reason, None);
    }
    let issuance = rewards
        .iter()
        .fold(U256::ZERO, |acc, reward| acc.saturating_add(reward.amount));

    let mut fees_burned = U256::ZERO;
    for (tx, receipt) in block.transactions.iter().zip(input.receipts) {
        let price = receipt.effective_gas_price.unwrap_or(tx.gas_price);
        let gas_used = U256::from(receipt.gas_used);
        let fee = gas_used.saturating_mul(price);
        let tip = match block.base_fee_per_gas {
            Some(base_fee) => gas_used.saturating_mul(price.saturating_sub(base_fee)),
            None => fee,
        };
        ledger.debit(tx.from, fee, DeltaReason::FeePayment, Some(tx.hash));
        ledger.credit(block.miner, tip, DeltaReason::FeeReceipt, Some(tx.hash));
        fees_burned = fees_burned.saturating_add(fee.saturating_sub(tip));

        if !receipt.success {
            continue;
        }
        let (recipient, reason) = match tx.to {
            Some(to) => (Some(to), DeltaReason::Transfer),
            None => (receipt.contract_address, DeltaReason::ContractCreation),
        };
        if let Some(recipient) = recipient {
            ledger.transfer(tx.from, recipient, tx.value, reason, Some(tx.hash));
        }
    }

    for internal in input.internal_transactions {
        ledger.transfer(
            internal.from,
            internal.to,
            internal.amount,
            DeltaReason::InternalTransfer,
            Some(internal.transaction_hash),
        );
    }
    // Top-level creations were moved with their transaction's value.
    for created in input.contracts_created.iter().filter(|c| !c.is_top_level()) {
        ledger.transfer(
            created.creator,
            created.address,
            created.amount,
            DeltaReason::ContractCreation,
            Some(created.transaction_hash),
        );
    }
    for destroyed in input.contracts_destroyed {
        ledger.transfer(
            destroyed.address,
            destroyed.refund_address,
            destroyed.refund_amount,
            DeltaReason::ContractDestruction,
            Some(destroyed.transaction_hash),
        );
    }

    BlockBalances {
        block: block.id(),
        rewards,
        deltas: ledger.deltas,
        issuance,
        fees_burned,
    }
}

/// Block and ommer rewards for `block`.
///
/// The miner earns `R + R * ommers / 32`; each ommer miner earns
/// `R - R * (number - ommer_number) / 8`. Genesis earns nothing.
pub fn rewards(block: &Block, schedule: &RewardSchedule) -> Vec<Reward> {
    let base = schedule.block_reward(block.number);
    if block.number == 0 || base.is_zero() {
        return Vec::new();
    }

    let ommer_count = U256::from(block.ommers.len());
    let mut rewards = vec![Reward {
        block_hash: block.hash,
        hash: block.hash,
        beneficiary: block.miner,
        amount: base + base * ommer_count / U256::from(32),
        kind: RewardKind::Block,
    }];

    for ommer in &block.ommers {
        let Some(distance) = block.number.checked_sub(ommer.number) else {
            continue;
        };
        let penalty = base * U256::from(distance) / U256::from(8);
        let amount = base.saturating_sub(penalty);
        if amount.is_zero() {
            continue;
        }
        rewards.push(Reward {
            block_hash: block.hash,
            hash: ommer.hash,
            beneficiary: ommer.miner,
            amount,
            kind: RewardKind::Ommer,
        });
    }
    rewards
}

fn signed(amount: U256) -> I256 {
    I256::from_raw(amount)
}

struct Ledger {
    block: BlockId,
    deltas: Vec<BalanceDelta>,
}

impl Ledger {
    fn new(block: BlockId) -> Self {
        Self {
            block,
            deltas: Vec::new(),
        }
    }

    fn push(&mut self, account: Address, amount: I256, reason: DeltaReason, tx: Option<TxHash>) {
        if amount.is_zero() {
            return;
        }
        self.deltas.push(BalanceDelta {
            block_hash: self.block.hash,
            block_number: self.block.number,
            index: self.deltas.len() as u32,
            account,
            amount,
            reason,
            transaction_hash: tx,
        });
    }

    fn credit(&mut self, account: Address, amount: U256, reason: DeltaReason, tx: Option<TxHash>) {
        self.push(account, signed(amount), reason, tx);
    }

    fn debit(&mut self, account: Address, amount: U256, reason: DeltaReason, tx: Option<TxHash>) {
        self.push(account, -signed(amount), reason, tx);
    }

    fn transfer(
        &mut self,
        from: Address,
        to: Address,
        amount: U256,
        reason: DeltaReason,
        tx: Option<TxHash>,
    ) {
        if amount.is_zero() {
            return;
        }
        self.debit(from, amount, reason, tx);
        self.credit(to, amount, reason, tx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OmmerHeader, Signature, Transaction};
    use alloy_primitives::{B256, Bytes};
    use chrono::Utc;
    use proptest::prelude::*;
    use rstest::rstest;

    const MINER: Address = Address::repeat_byte(0xfe);

    fn addr(b: u8) -> Address {
        Address::repeat_byte(b)
    }

    fn block(number: u64, base_fee: Option<u64>) -> Block {
        Block {
            number,
            hash: B256::with_last_byte(number as u8),
            parent_hash: B256::ZERO,
            timestamp: Utc::now(),
            miner: MINER,
            gas_used: 0,
            gas_limit: 30_000_000,
            base_fee_per_gas: base_fee.map(U256::from),
            ommers: Vec::new(),
            transactions: Vec::new(),
        }
    }

    fn tx(index: u8, from: u8, to: Option<u8>, value: u64, gas_price: u64) -> Transaction {
        Transaction {
            hash: B256::repeat_byte(index),
            block_hash: B256::ZERO,
            index: index as u32,
            from: addr(from),
            to: to.map(addr),
            value: U256::from(value),
            nonce: 0,
            gas_price: U256::from(gas_price),
            gas_limit: 100_000,
            input: Bytes::new(),
            signature: Signature::default(),
        }
    }

    fn receipt(tx: &Transaction, success: bool, gas_used: u64) -> TransactionReceipt {
        TransactionReceipt {
            transaction_hash: tx.hash,
            success,
            gas_used,
            cumulative_gas_used: gas_used,
            effective_gas_price: None,
            contract_address: None,
            revert_reason: None,
            logs: Vec::new(),
        }
    }

    fn input<'a>(block: &'a Block, receipts: &'a [TransactionReceipt]) -> BlockInput<'a> {
        BlockInput {
            block,
            receipts,
            internal_transactions: &[],
            contracts_created: &[],
            contracts_destroyed: &[],
        }
    }

    fn wei(n: i64) -> I256 {
        I256::try_from(n).unwrap()
    }

    #[rstest]
    #[case(1, 5)]
    #[case(4_369_999, 5)]
    #[case(4_370_000, 3)]
    #[case(7_280_000, 2)]
    #[case(15_537_393, 2)]
    #[case(15_537_394, 0)]
    fn test_mainnet_schedule(#[case] number: u64, #[case] ether: u64) {
        assert_eq!(
            RewardSchedule::mainnet().block_reward(number),
            U256::from(ether * ETHER)
        );
    }

    #[test]
    fn test_simple_transfer_without_base_fee() {
        let block = Block {
            transactions: vec![tx(1, 0xa1, Some(0xb1), 1_000, 10)],
            ..block(1, None)
        };
        let receipts = vec![receipt(&block.transactions[0], true, 21_000)];
        let balances = compute(&input(&block, &receipts), &RewardSchedule::none());

        let net = balances.net();
        assert_eq!(net[&addr(0xa1)], wei(-(1_000 + 210_000)));
        assert_eq!(net[&addr(0xb1)], wei(1_000));
        assert_eq!(net[&MINER], wei(210_000));
        assert_eq!(balances.fees_burned, U256::ZERO);
        balances.verify_conservation().unwrap();
    }

    // Test critique: la part base fee est brûlée, la somme vaut -burn
    #[test]
    fn test_base_fee_is_burned() {
        let block = Block {
            transactions: vec![tx(1, 0xa1, Some(0xb1), 0, 15)],
            ..block(20_000_000, Some(10))
        };
        let receipts = vec![receipt(&block.transactions[0], true, 100)];
        let balances = compute(&input(&block, &receipts), &RewardSchedule::mainnet());

        assert!(balances.rewards.is_empty());
        assert_eq!(balances.fees_burned, U256::from(1_000));
        assert_eq!(balances.net()[&MINER], wei(500));
        assert_eq!(balances.total(), wei(-1_000));
        balances.verify_conservation().unwrap();
    }

    #[test]
    fn test_failed_transaction_pays_fee_only() {
        let block = Block {
            transactions: vec![tx(1, 0xa1, Some(0xb1), 5_000, 1)],
            ..block(1, None)
        };
        let receipts = vec![receipt(&block.transactions[0], false, 50_000)];
        let balances = compute(&input(&block, &receipts), &RewardSchedule::none());

        assert!(!balances.net().contains_key(&addr(0xb1)));
        assert_eq!(balances.net()[&addr(0xa1)], wei(-50_000));
    }

    #[test]
    fn test_block_and_ommer_rewards() {
        let reward = U256::from(800);
        let block = Block {
            ommers: vec![
                OmmerHeader {
                    hash: B256::repeat_byte(0x0a),
                    number: 99,
                    miner: addr(0x01),
                },
                OmmerHeader {
                    hash: B256::repeat_byte(0x0b),
                    number: 94,
                    miner: addr(0x02),
                },
            ],
            ..block(100, None)
        };
        let balances = compute(&input(&block, &[]), &RewardSchedule::constant(reward));

        assert_eq!(balances.net()[&MINER], wei(800 + 800 * 2 / 32));
        assert_eq!(balances.net()[&addr(0x01)], wei(800 - 100));
        assert_eq!(balances.net()[&addr(0x02)], wei(800 - 600));
        assert_eq!(balances.issuance, U256::from(850 + 700 + 200));
        balances.verify_conservation().unwrap();
    }

    #[test]
    fn test_genesis_has_no_reward() {
        let balances = compute(&input(&block(0, None), &[]), &RewardSchedule::mainnet());
        assert!(balances.rewards.is_empty() && balances.deltas.is_empty());
    }

    #[test]
    fn test_creation_destruction_and_internal_movements() {
        let block = Block {
            transactions: vec![tx(1, 0xa1, None, 40, 0)],
            ..block(1, None)
        };
        let mut r = receipt(&block.transactions[0], true, 0);
        r.contract_address = Some(addr(0xc0));
        let receipts = vec![r];
        let hash = block.transactions[0].hash;

        let internal = vec![InternalTransaction {
            transaction_hash: hash,
            pc: 1,
            from: addr(0xc0),
            to: addr(0xd0),
            amount: U256::from(7),
        }];
        let created = vec![
            ContractCreated {
                transaction_hash: hash,
                pc: 0,
                creator: addr(0xa1),
                address: addr(0xc0),
                code: Bytes::new(),
                amount: U256::from(40),
                capabilities: Default::default(),
                contract_type: Default::default(),
            },
            ContractCreated {
                transaction_hash: hash,
                pc: 2,
                creator: addr(0xc0),
                address: addr(0xc1),
                code: Bytes::new(),
                amount: U256::from(3),
                capabilities: Default::default(),
                contract_type: Default::default(),
            },
        ];
        let destroyed = vec![ContractDestroyed {
            transaction_hash: hash,
            pc: 3,
            address: addr(0xc1),
            refund_address: addr(0xa1),
            refund_amount: U256::from(3),
        }];
        let balances = compute(
            &BlockInput {
                block: &block,
                receipts: &receipts,
                internal_transactions: &internal,
                contracts_created: &created,
                contracts_destroyed: &destroyed,
            },
            &RewardSchedule::none(),
        );

        let net = balances.net();
        assert_eq!(net[&addr(0xa1)], wei(-40 + 3));
        assert_eq!(net[&addr(0xc0)], wei(40 - 7 - 3));
        assert_eq!(net[&addr(0xd0)], wei(7));
        assert_eq!(net.get(&addr(0xc1)).copied().unwrap_or_default(), I256::ZERO);
        assert_eq!(balances.total(), I256::ZERO);

        let indexes: Vec<_> = balances.deltas.iter().map(|d| d.index).collect();
        assert_eq!(indexes, (0..balances.deltas.len() as u32).collect::<Vec<_>>());
    }

    #[test]
    fn test_conservation_violation_detected() {
        let block = Block {
            transactions: vec![tx(1, 0xa1, Some(0xb1), 10, 1)],
            ..block(1, None)
        };
        let receipts = vec![receipt(&block.transactions[0], true, 21_000)];
        let mut balances = compute(&input(&block, &receipts), &RewardSchedule::none());
        balances.deltas.pop();

        assert!(matches!(
            balances.verify_conservation(),
            Err(IndexerError::ConservationViolated { number: 1, .. })
        ));
    }

    proptest! {
        // Test critique: loi de conservation sur des blocs arbitraires
        #[test]
        fn prop_conservation_holds(
            txs in prop::collection::vec(
                (any::<u8>(), any::<u8>(), any::<bool>(), 0u64..1_000_000, 0u64..100, 0u64..50_000, any::<bool>()),
                0..24,
            ),
            base_fee in prop::option::of(0u64..80),
            ommers in 0usize..3,
            internals in prop::collection::vec((any::<u8>(), any::<u8>(), 0u64..1_000), 0..8),
        ) {
            let mut block = block(1_000, base_fee);
            for i in 0..ommers {
                block.ommers.push(OmmerHeader {
                    hash: B256::repeat_byte(i as u8 + 1),
                    number: 1_000 - 1 - i as u64,
                    miner: addr(i as u8),
                });
            }
            let mut receipts = Vec::new();
            for (i, (from, to, create, value, price, gas, success)) in txs.iter().enumerate() {
                let mut t = tx(i as u8, *from, (!create).then_some(*to), *value, *price);
                t.hash = B256::with_last_byte(i as u8);
                let mut r = receipt(&t, *success, *gas);
                r.contract_address = create.then_some(addr(*to));
                block.transactions.push(t);
                receipts.push(r);
            }
            let internal: Vec<_> = internals
                .iter()
                .map(|(from, to, amount)| InternalTransaction {
                    transaction_hash: B256::ZERO,
                    pc: 1,
                    from: addr(*from),
                    to: addr(*to),
                    amount: U256::from(*amount),
                })
                .collect();

            let balances = compute(
                &BlockInput {
                    block: &block,
                    receipts: &receipts,
                    internal_transactions: &internal,
                    contracts_created: &[],
                    contracts_destroyed: &[],
                },
                &RewardSchedule::mainnet(),
            );
            prop_assert!(balances.verify_conservation().is_ok());
            let net_sum = balances.net().values().fold(I256::ZERO, |acc, v| acc + *v);
            prop_assert_eq!(net_sum, balances.expected_total());
        }
    }
}
