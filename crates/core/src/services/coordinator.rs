//! Import coordinator: drives blocks through the pipeline in canonical order.
//!
//! # Design
//!
//! The coordinator owns the only cross-block state, the canonical head. All
//! head mutations (advance after a commit, rewind after a reorg) happen inside
//! [`ImportCoordinator::import_next`] under one lock, so a single import step
//! is the unit of serialization.
//!
//! # Flow
//!
//! 1. Fetch the block after the head (or notice the head was replaced)
//! 2. On a parent mismatch, walk back to the common ancestor and mark the old
//!    branch as ommers
//! 3. Otherwise fetch receipts and traces, extract, classify, interpret and
//!    compute balance deltas
//! 4. Check conservation and commit everything in one writer call
//! 5. Advance the head
//!
//! Nothing is written before the final commit apart from import queue status,
//! so abandoning a block at any step leaves no partial rows behind.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256, keccak256};
use chrono::Utc;
use futures::{StreamExt, TryStreamExt, stream};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::error::{IndexerError, IndexerResult, NodeError, NodeResult};
use crate::metrics::{
    ProcessingTimer, record_block_committed, record_block_retry, record_ingestion_halted,
    record_node_retry, record_reorg_detected,
};
use crate::models::{
    Account, Block, BlockId, BlockRef, CallTrace, ClassifiedContract, ContractCapabilities,
    ImportQueueEntry, ImportStatus, IndexerCursor, NormalizedBlock, TransactionReceipt,
};
use crate::ports::{BlockWriter, NodeClient};
use crate::services::balances::{self, BlockInput, RewardSchedule};
use crate::services::capability::CapabilityDetector;
use crate::services::{logs, trace as trace_extractor};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the import coordinator.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// EIP-155 chain id the store belongs to.
    pub chain_id: u64,
    /// First block imported when the store is empty.
    pub start_block: u64,
    /// Deepest reorg resolved automatically.
    pub max_reorg_depth: u64,
    /// Attempts per block before escalating to a fatal halt.
    pub max_attempts: u32,
    /// Retries of a single transient node call within one attempt.
    pub node_retries: u32,
    /// Initial backoff between retries.
    pub retry_delay: Duration,
    /// Backoff ceiling.
    pub max_retry_delay: Duration,
    /// Bound on each node call.
    pub node_timeout: Duration,
    /// Trace requests in flight per block.
    pub fetch_concurrency: usize,
    /// Wait before polling the node again once caught up.
    pub poll_interval: Duration,
    /// Bytecode hashes kept by the capability cache.
    pub capability_cache_size: usize,
    pub reward_schedule: RewardSchedule,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            start_block: 0,
            max_reorg_depth: 64,
            max_attempts: 5,
            node_retries: 3,
            retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(30),
            node_timeout: Duration::from_secs(30),
            fetch_concurrency: 8,
            poll_interval: Duration::from_secs(2),
            capability_cache_size: CapabilityDetector::DEFAULT_CAPACITY,
            reward_schedule: RewardSchedule::mainnet(),
        }
    }
}

impl IndexerConfig {
    /// Delay before retry number `attempt` (1-based), doubling up to the ceiling.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_delay
            .saturating_mul(factor)
            .min(self.max_retry_delay)
    }
}

// =============================================================================
// ImportCoordinator
// =============================================================================

/// Result of one import step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    /// Caught up with the node.
    Idle,
    /// Block committed and made the new head.
    Committed(BlockId),
    /// Block was already committed on the canonical chain.
    Skipped(BlockId),
    /// Stored branch replaced; the head moved back to `ancestor`.
    Reorged { ancestor: BlockId, depth: u64 },
}

struct ChainState {
    head: Option<BlockId>,
}

/// Orchestrates extraction, classification, interpretation and balance
/// computation for one block at a time, and keeps the store on the
/// canonical chain.
pub struct ImportCoordinator<N: NodeClient, W: BlockWriter> {
    config: IndexerConfig,
    node: Arc<N>,
    writer: Arc<W>,
    detector: CapabilityDetector,
    state: Mutex<ChainState>,
    head_tx: watch::Sender<Option<BlockId>>,
}

impl<N: NodeClient, W: BlockWriter> ImportCoordinator<N, W> {
    pub fn new(config: IndexerConfig, node: Arc<N>, writer: Arc<W>) -> Self {
        let detector = CapabilityDetector::new(config.capability_cache_size);
        let (head_tx, _) = watch::channel(None);
        Self {
            config,
            node,
            writer,
            detector,
            state: Mutex::new(ChainState { head: None }),
            head_tx,
        }
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    /// Current canonical head.
    pub fn head(&self) -> Option<BlockId> {
        *self.head_tx.borrow()
    }

    /// Follow head changes.
    pub fn subscribe_head(&self) -> watch::Receiver<Option<BlockId>> {
        self.head_tx.subscribe()
    }

    /// Run until shutdown or a fatal condition.
    ///
    /// Transient failures are retried with exponential backoff; anything
    /// else halts ingestion and is returned to the operator.
    #[instrument(skip_all, fields(chain_id = self.config.chain_id))]
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> IndexerResult<()> {
        info!("⛓️  Starting import coordinator");

        self.verify_chain_id().await?;
        self.restore_head().await?;

        let mut failures = 0u32;
        loop {
            if *shutdown_rx.borrow() {
                debug!("Shutdown requested");
                return Err(IndexerError::ShutdownRequested);
            }

            let result = tokio::select! {
                result = self.import_next() => result,
                _ = shutdown_rx.changed() => {
                    debug!("Shutdown requested during import step");
                    return Err(IndexerError::ShutdownRequested);
                }
            };

            let wait = match result {
                Ok(ImportOutcome::Idle) => {
                    failures = 0;
                    self.config.poll_interval
                }
                Ok(outcome) => {
                    failures = 0;
                    trace!(?outcome, "Import step done");
                    continue;
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    let delay = self.config.backoff(failures);
                    warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis(),
                        "⚠️  Import step failed, retrying..."
                    );
                    delay
                }
                Err(e) => {
                    error!(error = %e, "❌ Ingestion halted");
                    error!("   Manual action required: inspect the block above, then restart");
                    record_ingestion_halted();
                    return Err(e);
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return Err(IndexerError::ShutdownRequested);
                    }
                }
            }
        }
    }

    /// Refuse to run against a node or a store of another chain.
    async fn verify_chain_id(&self) -> IndexerResult<()> {
        let connected = self
            .call_node("chain_id", || self.node.chain_id())
            .await?;
        if connected != self.config.chain_id {
            error!(
                connected,
                expected = self.config.chain_id,
                "❌ Chain mismatch! Node serves a different chain"
            );
            return Err(IndexerError::ChainMismatch {
                connected,
                expected: self.config.chain_id,
            });
        }

        if let Some(cursor) = self.writer.get_any_cursor().await?
            && cursor.chain_id != self.config.chain_id
        {
            error!(
                connected = self.config.chain_id,
                expected = cursor.chain_id,
                "❌ Chain mismatch! Database contains data from a different chain"
            );
            error!(
                "   Manual action required: either connect to the correct chain or clear the database"
            );
            return Err(IndexerError::ChainMismatch {
                connected: self.config.chain_id,
                expected: cursor.chain_id,
            });
        }

        debug!("Chain ID verified");
        Ok(())
    }

    /// Resume from the stored cursor, if any.
    async fn restore_head(&self) -> IndexerResult<()> {
        let mut state = self.state.lock().await;
        let Some(cursor) = self.writer.get_cursor(self.config.chain_id).await? else {
            info!(start = self.config.start_block, "🆕 Empty store, starting fresh");
            return Ok(());
        };

        let head = cursor.head();
        if let Some(stored) = self.writer.canonical_block(head.number).await?
            && stored.hash != head.hash
        {
            warn!(
                block = head.number,
                cursor_hash = %head.hash,
                stored_hash = %stored.hash,
                "⚠️  Cursor disagrees with the canonical block, trusting the cursor"
            );
        }

        info!(block = head.number, hash = %head.hash, "▶️  Resuming after stored head");
        self.set_head(&mut state, Some(head));
        Ok(())
    }

    fn set_head(&self, state: &mut ChainState, head: Option<BlockId>) {
        state.head = head;
        self.head_tx.send_replace(head);
    }

    /// Perform one import step: commit the next block, resolve a reorg, or
    /// report that the node has nothing new.
    #[instrument(skip(self))]
    pub async fn import_next(&self) -> IndexerResult<ImportOutcome> {
        let mut state = self.state.lock().await;
        let head = state.head;
        let next = head.map_or(self.config.start_block, |h| h.number + 1);

        let latest = self
            .call_node("latest_block_number", || self.node.latest_block_number())
            .await?;

        if next > latest {
            // Nothing new, but the stored head may have been replaced.
            let Some(head) = head else {
                return Ok(ImportOutcome::Idle);
            };
            let tip_number = head.number.min(latest);
            let tip = self
                .call_node("get_block", || self.node.get_block(BlockRef::Number(tip_number)))
                .await?;
            if tip_number < head.number {
                // A lagging node on the same chain is not a reorg; wait for it.
                let stored = self.writer.canonical_block(tip_number).await?;
                if stored.is_none_or(|stored| stored.hash == tip.hash) {
                    debug!(latest, head = head.number, "Node behind stored head, waiting");
                    return Ok(ImportOutcome::Idle);
                }
            } else if tip.hash == head.hash {
                return Ok(ImportOutcome::Idle);
            }
            return self.handle_reorg(&mut state, head, tip.id()).await;
        }

        let block = self
            .call_node("get_block", || self.node.get_block(BlockRef::Number(next)))
            .await?;

        if let Some(head) = head
            && block.parent_hash != head.hash
        {
            warn!(
                block = block.number,
                expected = %head.hash,
                parent = %block.parent_hash,
                "🔄 Reorg detected! Parent hash mismatch"
            );
            let candidate = BlockId {
                number: head.number,
                hash: block.parent_hash,
            };
            return self.handle_reorg(&mut state, head, candidate).await;
        }

        let outcome = self.process_block(&block).await?;
        self.set_head(&mut state, Some(block.id()));
        Ok(outcome)
    }

    /// Rewind to the common ancestor of the stored branch and the node's.
    ///
    /// `candidate` is a block of the node's branch at or below the head.
    #[instrument(skip(self, state))]
    async fn handle_reorg(
        &self,
        state: &mut ChainState,
        head: BlockId,
        candidate: BlockId,
    ) -> IndexerResult<ImportOutcome> {
        let ancestor = self.find_common_ancestor(head, candidate).await?;
        let depth = head.number - ancestor.number;

        let orphaned = self
            .writer
            .mark_reorg(&ancestor, self.config.chain_id)
            .await?;
        self.set_head(state, Some(ancestor));
        record_reorg_detected(depth);

        info!(
            ancestor = ancestor.number,
            hash = %ancestor.hash,
            depth,
            orphaned,
            "🔄 Reorg handled, resuming from common ancestor"
        );
        Ok(ImportOutcome::Reorged { ancestor, depth })
    }

    async fn find_common_ancestor(&self, head: BlockId, mut candidate: BlockId) -> IndexerResult<BlockId> {
        let too_deep = |depth: u64| IndexerError::ReorgTooDeep {
            number: head.number,
            hash: head.hash,
            depth,
            max: self.config.max_reorg_depth,
        };

        loop {
            match self.writer.canonical_block(candidate.number).await? {
                // Below the first indexed block: nothing older to compare with.
                None => break,
                Some(stored) if stored.hash == candidate.hash => break,
                Some(_) => {}
            }

            let depth = head.number - candidate.number + 1;
            if depth > self.config.max_reorg_depth || candidate.number == 0 {
                error!(
                    block = head.number,
                    hash = %head.hash,
                    depth,
                    max = self.config.max_reorg_depth,
                    "❌ Reorg deeper than allowed"
                );
                return Err(too_deep(depth));
            }

            let block = self
                .call_node("get_block", || {
                    self.node.get_block(BlockRef::Hash(candidate.hash))
                })
                .await?;
            trace!(block = block.number, "Walking back the new branch");
            candidate = BlockId {
                number: candidate.number - 1,
                hash: block.parent_hash,
            };
        }

        let depth = head.number - candidate.number;
        if depth > self.config.max_reorg_depth {
            return Err(too_deep(depth));
        }
        Ok(candidate)
    }

    // =========================================================================
    // Block Processing
    // =========================================================================

    /// Take one block through `Pending → InProgress → Committed`.
    ///
    /// Failed attempts go through `Failed → Pending` with backoff. A
    /// non-transient error, or `max_attempts` failures, escalates to
    /// [`IndexerError::Fatal`]; the block is never skipped.
    #[instrument(skip(self, block), fields(block = block.number, hash = %block.hash))]
    async fn process_block(&self, block: &Block) -> IndexerResult<ImportOutcome> {
        let id = block.id();

        let existing = self.writer.get_import_status(id.number).await?;
        if let Some(entry) = &existing
            && entry.hash == id.hash
            && entry.canonical
            && entry.status == ImportStatus::Committed
        {
            trace!("Block already committed, skipping");
            return Ok(ImportOutcome::Skipped(id));
        }
        if let Some(entry) = existing.filter(|e| e.hash == id.hash) {
            debug!(status = entry.status.as_str(), "Resuming interrupted import");
        }

        let _timer = ProcessingTimer::new();
        let mut entry = ImportQueueEntry::pending(id);
        self.writer.record_import_status(&entry).await?;

        loop {
            entry = self.transition(&entry, ImportStatus::InProgress, None).await?;

            let attempt = async {
                let normalized = self.normalize(block, &entry).await?;
                self.writer.commit_block(&normalized).await?;
                Ok::<_, IndexerError>(normalized)
            };

            let e = match attempt.await {
                Ok(normalized) => {
                    record_block_committed();
                    info!(
                        txs = normalized.block.transactions.len(),
                        internal = normalized.internal_transactions.len(),
                        transfers = normalized.token_transfers.len(),
                        attempts = entry.attempts,
                        "⛓️  Block committed"
                    );
                    return Ok(ImportOutcome::Committed(id));
                }
                Err(e) => e,
            };

            entry = self
                .transition(&entry, ImportStatus::Failed, Some(e.to_string()))
                .await?;

            if !e.is_transient() || entry.attempts >= self.config.max_attempts {
                error!(
                    block = id.number,
                    hash = %id.hash,
                    attempts = entry.attempts,
                    error = %e,
                    "❌ Block import failed permanently"
                );
                return Err(IndexerError::Fatal {
                    number: id.number,
                    hash: id.hash,
                    attempts: entry.attempts,
                    source: Box::new(e),
                });
            }

            record_block_retry();
            let delay = self.config.backoff(entry.attempts);
            warn!(
                attempts = entry.attempts,
                retry_in_ms = delay.as_millis(),
                error = %e,
                "⚠️  Block import failed, retrying..."
            );
            tokio::time::sleep(delay).await;

            entry = self.transition(&entry, ImportStatus::Pending, None).await?;
        }
    }

    /// Move an import entry along the state machine and persist it.
    async fn transition(
        &self,
        entry: &ImportQueueEntry,
        next: ImportStatus,
        error: Option<String>,
    ) -> IndexerResult<ImportQueueEntry> {
        let entry = advance(entry, next, error)?;
        self.writer.record_import_status(&entry).await?;
        Ok(entry)
    }

    /// Derive every row of one block. Reads only; writes nothing.
    async fn normalize(&self, block: &Block, entry: &ImportQueueEntry) -> IndexerResult<NormalizedBlock> {
        let receipts = self
            .call_node("get_receipts", || self.node.get_receipts(block.hash))
            .await?;
        let mut receipts = align_receipts(block, receipts)?;

        let tx_hashes: Vec<B256> = block.transactions.iter().map(|tx| tx.hash).collect();
        let traces: Vec<CallTrace> = stream::iter(tx_hashes)
            .map(|hash| self.call_node("get_trace", move || self.node.get_trace(hash)))
            .buffered(self.config.fetch_concurrency.max(1))
            .try_collect()
            .await?;

        // Trace extraction
        let mut internal_transactions = Vec::new();
        let mut contracts_created = Vec::new();
        let mut contracts_destroyed = Vec::new();
        for ((tx, trace), receipt) in block.transactions.iter().zip(&traces).zip(&mut receipts) {
            let output = trace_extractor::extract(tx.hash, trace)?;
            internal_transactions.extend(output.internal_transactions);
            contracts_created.extend(output.contracts_created);
            contracts_destroyed.extend(output.contracts_destroyed);

            if !receipt.success && receipt.revert_reason.is_none() {
                receipt.revert_reason = trace.revert_reason();
            }
        }

        // Capabilities must be known before any log is interpreted.
        let mut known: HashMap<Address, ContractCapabilities> = HashMap::new();
        for created in &mut contracts_created {
            if created.code.is_empty() {
                let address = created.address;
                created.code = self
                    .call_node("get_code", || self.node.get_code(address, block.number))
                    .await?;
            }
            let capabilities = self.detector.detect_cached(&created.code);
            created.capabilities = capabilities;
            created.contract_type = capabilities.contract_type();
            known.insert(created.address, capabilities);
        }

        let emitters: BTreeSet<Address> = receipts
            .iter()
            .flat_map(|r| &r.logs)
            .filter(|log| logs::is_transfer(log))
            .map(|log| log.address)
            .collect();
        let mut classified_contracts = Vec::new();
        for address in emitters {
            if known.contains_key(&address) {
                continue;
            }
            if let Some(capabilities) = self.writer.capabilities(&address).await? {
                known.insert(address, capabilities);
                continue;
            }
            let code = self
                .call_node("get_code", || self.node.get_code(address, block.number))
                .await?;
            let capabilities = self.detector.detect_cached(&code);
            debug!(%address, %capabilities, "Classified pre-existing contract");
            classified_contracts.push(ClassifiedContract {
                address,
                code_hash: keccak256(&code),
                capabilities,
                contract_type: capabilities.contract_type(),
                block_number: block.number,
            });
            known.insert(address, capabilities);
        }

        // Log interpretation
        let mut token_transfers = Vec::new();
        let mut contract_events = Vec::new();
        for receipt in &receipts {
            let output = logs::interpret(receipt.transaction_hash, &receipt.logs, &known);
            token_transfers.extend(output.token_transfers);
            contract_events.extend(output.contract_events);
        }

        // Balance deltas
        let balances = balances::compute(
            &BlockInput {
                block,
                receipts: &receipts,
                internal_transactions: &internal_transactions,
                contracts_created: &contracts_created,
                contracts_destroyed: &contracts_destroyed,
            },
            &self.config.reward_schedule,
        );
        balances.verify_conservation()?;

        let mut accounts: BTreeMap<Address, Account> = BTreeMap::new();
        let mut touch = |address: Address| {
            accounts.entry(address).or_insert(Account {
                address,
                first_seen_block: block.number,
                destroyed_block: None,
            });
        };
        for (tx, receipt) in block.transactions.iter().zip(&receipts) {
            touch(tx.from);
            tx.to.into_iter().chain(receipt.contract_address).for_each(&mut touch);
        }
        for internal in &internal_transactions {
            touch(internal.from);
            touch(internal.to);
        }
        for created in &contracts_created {
            touch(created.creator);
            touch(created.address);
        }
        for destroyed in &contracts_destroyed {
            touch(destroyed.refund_address);
        }
        for delta in &balances.deltas {
            touch(delta.account);
        }
        for destroyed in &contracts_destroyed {
            accounts
                .entry(destroyed.address)
                .or_insert(Account {
                    address: destroyed.address,
                    first_seen_block: block.number,
                    destroyed_block: None,
                })
                .destroyed_block = Some(block.number);
        }

        let now = Utc::now();
        let import = ImportQueueEntry {
            updated_at: now,
            ..advance(entry, ImportStatus::Committed, None)?
        };

        Ok(NormalizedBlock {
            block: block.clone(),
            receipts,
            internal_transactions,
            contracts_created,
            contracts_destroyed,
            classified_contracts,
            token_transfers,
            contract_events,
            rewards: balances.rewards,
            balance_deltas: balances.deltas,
            accounts: accounts.into_values().collect(),
            import,
            cursor: IndexerCursor {
                chain_id: self.config.chain_id,
                last_block: block.number,
                last_hash: block.hash,
                updated_at: now,
            },
        })
    }

    /// Call the node with a timeout, retrying transient failures.
    async fn call_node<T, F, Fut>(&self, operation: &'static str, mut call: F) -> NodeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = NodeResult<T>>,
    {
        let mut retries = 0;
        loop {
            let result = match tokio::time::timeout(self.config.node_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(NodeError::Timeout {
                    operation,
                    after: self.config.node_timeout,
                }),
            };

            match result {
                Err(e) if e.is_transient() && retries < self.config.node_retries => {
                    retries += 1;
                    record_node_retry(operation);
                    let delay = self.config.backoff(retries);
                    debug!(operation, retries, error = %e, "Node call failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }
}

/// Next import entry, or an error when the state machine forbids the edge.
fn advance(
    entry: &ImportQueueEntry,
    next: ImportStatus,
    error: Option<String>,
) -> IndexerResult<ImportQueueEntry> {
    if !entry.status.can_transition_to(next) {
        return Err(IndexerError::Internal(format!(
            "illegal import transition {} -> {} for block {}",
            entry.status.as_str(),
            next.as_str(),
            entry.number
        )));
    }
    let attempts = match next {
        ImportStatus::InProgress => entry.attempts + 1,
        _ => entry.attempts,
    };
    Ok(ImportQueueEntry {
        status: next,
        attempts,
        last_error: error.or_else(|| entry.last_error.clone()),
        updated_at: Utc::now(),
        ..entry.clone()
    })
}

/// Order receipts like the block's transactions, one per transaction.
fn align_receipts(
    block: &Block,
    receipts: Vec<TransactionReceipt>,
) -> IndexerResult<Vec<TransactionReceipt>> {
    if receipts.len() != block.transactions.len() {
        return Err(NodeError::InvalidResponse(format!(
            "block {} has {} transactions but {} receipts",
            block.number,
            block.transactions.len(),
            receipts.len()
        ))
        .into());
    }

    let mut by_hash: HashMap<B256, TransactionReceipt> = receipts
        .into_iter()
        .map(|r| (r.transaction_hash, r))
        .collect();
    block
        .transactions
        .iter()
        .map(|tx| {
            by_hash.remove(&tx.hash).ok_or_else(|| {
                NodeError::InvalidResponse(format!("missing receipt for {}", tx.hash)).into()
            })
        })
        .collect()
}
