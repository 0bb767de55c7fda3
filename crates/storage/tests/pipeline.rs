//! End-to-end import scenarios: scripted node, coordinator, in-memory store.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256, I256, U256, keccak256};
use tributary_core::error::{ExtractionError, IndexerError};
use tributary_core::models::{
    CallFrame, CallKind, CallTrace, ContractType, ImportStatus, TransferValue,
};
use tributary_core::ports::BlockWriter;
use tributary_core::services::capability::fixtures::{ERC721_BASE, dispatcher};
use tributary_core::services::{ImportCoordinator, ImportOutcome, IndexerConfig, RewardSchedule};
use tributary_core::testing::{ScriptedNode, TRANSFER_GAS, TestBlock, chain, log, receipt};
use tributary_storage::MemoryWriter;

const CHAIN_ID: u64 = 1;

fn alice() -> Address {
    Address::repeat_byte(0xa1)
}

fn bob() -> Address {
    Address::repeat_byte(0xb0)
}

fn config() -> IndexerConfig {
    IndexerConfig {
        chain_id: CHAIN_ID,
        start_block: 1,
        retry_delay: Duration::from_millis(10),
        max_retry_delay: Duration::from_millis(100),
        reward_schedule: RewardSchedule::constant(U256::from(1_000_000u64)),
        ..Default::default()
    }
}

fn setup(
    config: IndexerConfig,
) -> (
    Arc<ScriptedNode>,
    Arc<MemoryWriter>,
    ImportCoordinator<ScriptedNode, MemoryWriter>,
) {
    let node = Arc::new(ScriptedNode::new(config.chain_id));
    let writer = Arc::new(MemoryWriter::new());
    let coordinator = ImportCoordinator::new(config, node.clone(), writer.clone());
    (node, writer, coordinator)
}

/// Import until the coordinator reports it is caught up.
async fn drain(coordinator: &ImportCoordinator<ScriptedNode, MemoryWriter>) -> Vec<ImportOutcome> {
    let mut outcomes = Vec::new();
    for _ in 0..64 {
        let outcome = coordinator.import_next().await.unwrap();
        if outcome == ImportOutcome::Idle {
            return outcomes;
        }
        outcomes.push(outcome);
    }
    panic!("import never went idle: {outcomes:?}");
}

fn transfers(block: TestBlock) -> TestBlock {
    block
        .with_transfer(alice(), bob(), 10)
        .with_transfer(bob(), alice(), 3)
}

// =============================================================================
// Reorgs
// =============================================================================

// Test critique: après un reorg, l'état est celui d'un import direct de la nouvelle branche
#[tokio::test]
async fn test_same_length_reorg_matches_fresh_import() {
    let (node, writer, coordinator) = setup(config());

    let a = chain(1, None, 1, 5, transfers);
    node.set_chain(&a);
    assert_eq!(drain(&coordinator).await.len(), 5);

    // B partage 1..3 puis diverge en 4' et 5'
    let mut b = a[..3].to_vec();
    b.extend(chain(2, Some(&a[2].block), 4, 2, transfers));
    node.set_chain(&b);

    let outcomes = drain(&coordinator).await;
    assert_eq!(
        outcomes[0],
        ImportOutcome::Reorged {
            ancestor: a[2].id(),
            depth: 2
        }
    );
    assert_eq!(coordinator.head(), Some(b[4].id()));

    let expected: Vec<_> = b.iter().map(TestBlock::id).collect();
    assert_eq!(writer.canonical_chain(), expected);

    // Les blocs remplacés restent stockés comme ommers
    assert_eq!(writer.block_count(), 7);
    assert_eq!(writer.is_canonical(&a[3].block.hash), Some(false));
    assert_eq!(writer.is_canonical(&a[4].block.hash), Some(false));

    let (fresh_node, fresh_writer, fresh) = setup(config());
    fresh_node.set_chain(&b);
    drain(&fresh).await;
    assert_eq!(
        writer.canonical_balances().await.unwrap(),
        fresh_writer.canonical_balances().await.unwrap()
    );
}

#[tokio::test]
async fn test_longer_branch_detected_by_parent_mismatch() {
    let (node, writer, coordinator) = setup(config());

    let a = chain(1, None, 1, 4, transfers);
    node.set_chain(&a);
    drain(&coordinator).await;

    let mut b = a[..2].to_vec();
    b.extend(chain(2, Some(&a[1].block), 3, 4, transfers));
    node.set_chain(&b);

    let outcomes = drain(&coordinator).await;
    assert!(matches!(
        outcomes[0],
        ImportOutcome::Reorged { depth: 2, .. }
    ));
    assert_eq!(outcomes.len(), 1 + 4);
    assert_eq!(writer.canonical_chain().len(), 6);
    assert_eq!(
        writer.get_cursor(CHAIN_ID).await.unwrap().unwrap().head(),
        b[5].id()
    );
}

// Test critique: une transaction ré-incluse par la nouvelle branche change de bloc
#[tokio::test]
async fn test_reincluded_transaction_moves_to_new_block() {
    let (node, writer, coordinator) = setup(config());

    let a = chain(1, None, 1, 2, transfers);
    node.set_chain(&a);
    drain(&coordinator).await;

    let moved = a[1].block.transactions[0].clone();
    let forked = TestBlock::new(2, a[0].block.hash, 2).with_transaction(
        moved.clone(),
        receipt(moved.hash, true, TRANSFER_GAS),
        CallTrace::new(CallFrame::new(
            CallKind::Call,
            moved.from,
            moved.to,
            moved.value,
        )),
    );
    node.set_chain(&[a[0].clone(), forked.clone()]);
    drain(&coordinator).await;

    assert_eq!(writer.transaction_block(&moved.hash), Some(forked.block.hash));
    assert_eq!(writer.canonical_block(2).await.unwrap(), Some(forked.id()));
}

// Test critique: un nœud en retard sur la même chaîne n'est pas un reorg
#[tokio::test]
async fn test_lagging_node_on_same_chain_is_idle() {
    let (node, writer, coordinator) = setup(IndexerConfig {
        max_reorg_depth: 2,
        ..config()
    });

    let a = chain(1, None, 1, 5, transfers);
    node.set_chain(&a);
    drain(&coordinator).await;
    let before = writer.snapshot();

    // Le nœud ne sert plus qu'un préfixe de la chaîne stockée
    node.set_chain(&a[..2]);
    assert_eq!(coordinator.import_next().await.unwrap(), ImportOutcome::Idle);
    assert_eq!(coordinator.head(), Some(a[4].id()));
    assert_eq!(writer.snapshot(), before);

    // Rattrapé, il n'y a toujours rien à faire
    node.set_chain(&a);
    assert_eq!(coordinator.import_next().await.unwrap(), ImportOutcome::Idle);
    let expected: Vec<_> = a.iter().map(TestBlock::id).collect();
    assert_eq!(writer.canonical_chain(), expected);
}

#[tokio::test]
async fn test_lagging_node_on_other_branch_reorgs() {
    let (node, writer, coordinator) = setup(config());

    let a = chain(1, None, 1, 5, transfers);
    node.set_chain(&a);
    drain(&coordinator).await;

    // Plus court que la tête stockée, mais divergent dès le bloc 2
    let mut b = a[..1].to_vec();
    b.extend(chain(2, Some(&a[0].block), 2, 1, transfers));
    node.set_chain(&b);

    let outcomes = drain(&coordinator).await;
    assert_eq!(
        outcomes[0],
        ImportOutcome::Reorged {
            ancestor: a[0].id(),
            depth: 4
        }
    );
    assert_eq!(coordinator.head(), Some(b[1].id()));
    assert_eq!(writer.is_canonical(&a[1].block.hash), Some(false));
}

// Test critique: un compte vu seulement sur une branche remplacée garde son historique
#[tokio::test]
async fn test_account_from_replaced_branch_keeps_history() {
    let (node, writer, coordinator) = setup(config());
    let carol = Address::repeat_byte(0xc0);

    let mut a = chain(1, None, 1, 2, |b| b);
    a.push(TestBlock::new(3, a[1].block.hash, 1).with_transfer(alice(), carol, 5));
    node.set_chain(&a);
    drain(&coordinator).await;

    let mut b = a[..2].to_vec();
    b.extend(chain(2, Some(&a[1].block), 3, 2, |b| b));
    node.set_chain(&b);
    drain(&coordinator).await;

    let account = writer.account(&carol).unwrap();
    assert_eq!(account.first_seen_block, 3);
    assert_eq!(account.destroyed_block, None);
    // Le solde canonique ne compte plus le transfert orphelin
    assert!(!writer.canonical_balances().await.unwrap().contains_key(&carol));
}

#[tokio::test]
async fn test_reorg_deeper_than_limit_halts() {
    let (node, _writer, coordinator) = setup(IndexerConfig {
        max_reorg_depth: 2,
        ..config()
    });

    let a = chain(1, None, 1, 5, |b| b);
    node.set_chain(&a);
    drain(&coordinator).await;

    let mut b = a[..1].to_vec();
    b.extend(chain(2, Some(&a[0].block), 2, 5, |b| b));
    node.set_chain(&b);

    let err = coordinator.import_next().await.unwrap_err();
    assert!(matches!(
        err,
        IndexerError::ReorgTooDeep { depth: 3, max: 2, .. }
    ));
    assert!(!err.is_transient());
    // La tête n'a pas bougé
    assert_eq!(coordinator.head(), Some(a[4].id()));
}

// =============================================================================
// Idempotence
// =============================================================================

// Test critique: un bloc déjà committé n'est jamais réécrit
#[tokio::test]
async fn test_committed_block_is_skipped_after_restart() {
    let (node, writer, coordinator) = setup(config());
    let blocks = chain(1, None, 1, 2, transfers);
    node.set_chain(&blocks);
    drain(&coordinator).await;
    let before = writer.snapshot();

    // Un coordinateur qui a perdu sa tête repart du bloc de départ
    let restarted = ImportCoordinator::new(config(), node.clone(), writer.clone());
    assert_eq!(
        restarted.import_next().await.unwrap(),
        ImportOutcome::Skipped(blocks[0].id())
    );
    assert_eq!(
        restarted.import_next().await.unwrap(),
        ImportOutcome::Skipped(blocks[1].id())
    );
    assert_eq!(restarted.import_next().await.unwrap(), ImportOutcome::Idle);
    assert_eq!(writer.snapshot(), before);
}

// =============================================================================
// Failure Handling
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_write_conflict_is_retried() {
    let (node, writer, coordinator) = setup(config());
    let blocks = chain(1, None, 1, 1, transfers);
    node.set_chain(&blocks);
    writer.fail_commits(1);

    assert_eq!(
        coordinator.import_next().await.unwrap(),
        ImportOutcome::Committed(blocks[0].id())
    );
    let entry = writer.get_import_status(1).await.unwrap().unwrap();
    assert_eq!(entry.status, ImportStatus::Committed);
    assert_eq!(entry.attempts, 2);
}

// Test critique: un bloc n'est jamais sauté, l'ingestion s'arrête
#[tokio::test(start_paused = true)]
async fn test_persistent_node_failure_becomes_fatal() {
    let (node, writer, coordinator) = setup(IndexerConfig {
        max_attempts: 3,
        node_retries: 0,
        ..config()
    });
    let blocks = chain(1, None, 1, 2, transfers);
    node.set_chain(&blocks);
    node.fail_next("get_receipts", 100);

    let err = coordinator.import_next().await.unwrap_err();
    let IndexerError::Fatal {
        number, attempts, ..
    } = err
    else {
        panic!("expected fatal error, got {err}");
    };
    assert_eq!(number, 1);
    assert_eq!(attempts, 3);
    assert_eq!(node.calls("get_receipts"), 3);

    let entry = writer.get_import_status(1).await.unwrap().unwrap();
    assert_eq!(entry.status, ImportStatus::Failed);
    assert!(entry.last_error.is_some());
    assert_eq!(writer.block_count(), 0);
    assert_eq!(coordinator.head(), None);
}

#[tokio::test]
async fn test_malformed_trace_halts_without_retry() {
    let (node, writer, coordinator) = setup(config());
    let base = TestBlock::new(1, B256::ZERO, 1);
    let tx = base.transaction(alice(), Some(bob()), 1);
    let block = base.with_transaction(
        tx.clone(),
        receipt(tx.hash, true, TRANSFER_GAS),
        CallTrace::default(),
    );
    node.set_chain(&[block]);

    let err = coordinator.import_next().await.unwrap_err();
    let IndexerError::Fatal {
        attempts, source, ..
    } = err
    else {
        panic!("expected fatal error, got {err}");
    };
    assert_eq!(attempts, 1);
    assert!(matches!(
        *source,
        IndexerError::Extraction(ExtractionError::MalformedTrace { .. })
    ));
    assert_eq!(writer.block_count(), 0);
}

#[tokio::test]
async fn test_store_from_another_chain_is_refused() {
    let (node, writer, coordinator) = setup(IndexerConfig {
        chain_id: 5,
        ..config()
    });
    node.set_chain(&chain(1, None, 1, 1, |b| b));
    drain(&coordinator).await;

    let other = Arc::new(ScriptedNode::new(CHAIN_ID));
    let mismatched = ImportCoordinator::new(config(), other, writer.clone());
    let (_tx, rx) = tokio::sync::watch::channel(false);
    assert!(matches!(
        mismatched.run(rx).await,
        Err(IndexerError::ChainMismatch {
            connected: 1,
            expected: 5
        })
    ));
}

// =============================================================================
// Token Interpretation
// =============================================================================

// Test critique: un Transfer à 3 topics d'un contrat ERC721 est un transfert de NFT
#[tokio::test]
async fn test_three_topic_transfer_from_erc721_contract() {
    let (node, writer, coordinator) = setup(config());
    let nft = Address::repeat_byte(0x72);
    let token = Address::repeat_byte(0x20);
    node.set_code(nft, dispatcher(&ERC721_BASE));

    let signature = keccak256("Transfer(address,address,uint256)");
    let topics = vec![signature, alice().into_word(), bob().into_word()];
    let word = U256::from(42).to_be_bytes::<32>().to_vec();

    let base = TestBlock::new(1, B256::ZERO, 1);
    let tx = base.transaction(alice(), Some(nft), 0);
    let mut nft_receipt = receipt(tx.hash, true, 60_000);
    nft_receipt.logs = vec![
        log(nft, topics.clone(), word.clone(), 0),
        log(token, topics, word, 1),
    ];
    let block = base.with_transaction(
        tx.clone(),
        nft_receipt,
        CallTrace::new(CallFrame::new(CallKind::Call, alice(), Some(nft), U256::ZERO)),
    );
    node.set_chain(&[block]);
    drain(&coordinator).await;

    let transfers = writer.token_transfers();
    assert_eq!(transfers.len(), 2);
    assert_eq!(
        transfers[0].value,
        TransferValue::NonFungible {
            token_id: U256::from(42)
        }
    );
    assert_eq!(
        transfers[1].value,
        TransferValue::Fungible {
            amount: U256::from(42)
        }
    );

    // Le contrat préexistant est classé paresseusement, sans ligne de création
    let contract = writer.contract(&nft).unwrap();
    assert_eq!(contract.contract_type, ContractType::Erc721);
    assert!(contract.created.is_none());
    assert_eq!(node.calls("get_code"), 2);
}

// Test critique: un contrat créé et émetteur dans le même bloc est classé depuis sa création
#[tokio::test]
async fn test_contract_created_and_transferring_in_same_block() {
    let (node, writer, coordinator) = setup(config());
    let nft = Address::repeat_byte(0x73);

    let signature = keccak256("Transfer(address,address,uint256)");
    let topics = vec![signature, Address::ZERO.into_word(), alice().into_word()];
    let word = U256::from(42).to_be_bytes::<32>().to_vec();

    let base = TestBlock::new(1, B256::ZERO, 1);
    let tx = base.transaction(alice(), None, 0);
    let mut deploy = receipt(tx.hash, true, 500_000);
    deploy.contract_address = Some(nft);
    deploy.logs = vec![log(nft, topics, word, 0)];
    let block = base.with_transaction(
        tx.clone(),
        deploy,
        CallTrace::new(
            CallFrame::new(CallKind::Create, alice(), Some(nft), U256::ZERO)
                .with_output(dispatcher(&ERC721_BASE)),
        ),
    );
    node.set_chain(&[block]);
    drain(&coordinator).await;

    let transfers = writer.token_transfers();
    assert_eq!(transfers.len(), 1);
    assert_eq!(
        transfers[0].value,
        TransferValue::NonFungible {
            token_id: U256::from(42)
        }
    );

    // Ni le nœud ni le store n'ont été consultés pour le code
    assert_eq!(node.calls("get_code"), 0);
    let contract = writer.contract(&nft).unwrap();
    assert_eq!(contract.contract_type, ContractType::Erc721);
    assert!(contract.created.is_some());
}

// =============================================================================
// Balances
// =============================================================================

#[tokio::test]
async fn test_balances_sum_to_issuance() {
    let (node, writer, coordinator) = setup(config());
    let blocks = chain(1, None, 1, 3, transfers);
    node.set_chain(&blocks);
    drain(&coordinator).await;

    let balances = writer.canonical_balances().await.unwrap();
    let total = balances
        .values()
        .fold(I256::ZERO, |acc, b| acc + *b);
    // Sans base fee rien n'est brûlé: le total est la seule émission
    assert_eq!(
        total,
        I256::try_from(3_000_000u64).unwrap()
    );

    let archive = writer.trace_archive(&blocks[0].block.hash).unwrap().unwrap();
    assert_eq!(archive.rewards.len(), 1);
}
