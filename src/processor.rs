//! Block processor
//!
//! Owns the chain state (block tree plus the uncommitted UTXO layer) behind a
//! single lock and moves a submitted block through the gates:
//!
//! Received → HeaderValidated → Classified → BodyValidated → Committed, or
//! Rejected at any gate.
//!
//! A candidate is always validated against a speculative child layer that
//! carries the UTXO state from the current head to the candidate's parent.
//! Only when the candidate becomes the new head is that child folded into the
//! chain state; on every other path it is dropped, which is how rejected
//! blocks and transient failures leave the head and its view untouched.

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::borrow::Cow;
use std::sync::Arc;

use crate::block::{
    check_block_body, check_block_header, check_block_time, check_merkle_root, validate_block_transactions,
};
use crate::chain::{ChainSegments, SegmentId, SegmentRelationship};
use crate::config::{ChainParams, EngineConfig};
use crate::context::{ChainContext, MedianTimeLookup, NetworkTime, OutputLookup};
use crate::difficulty::DifficultyCalculator;
use crate::error::{ConsensusError, Result};
use crate::mempool::{ChainUpdate, MempoolListener};
use crate::pow::ChainWork;
use crate::reorganization::{plan_reorganization, ReorganizationPlan};
use crate::storage::{ChainStore, StoredBlockNode};
use crate::types::*;
use crate::utxo::UtxoLayer;

/// Why a block was not accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: String,
    /// The block is remembered as invalid and will not be processed again
    pub permanent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessBlockResult {
    pub accepted: bool,
    pub block_height: Option<Natural>,
    /// Offending transactions of a block rejected for its transactions
    pub invalid_transactions: Vec<Hash>,
    pub became_head: bool,
    pub rejection: Option<Rejection>,
}

impl ProcessBlockResult {
    fn accepted(height: Natural, became_head: bool) -> Self {
        Self {
            accepted: true,
            block_height: Some(height),
            became_head,
            ..Self::default()
        }
    }

    fn rejected(reason: impl Into<String>, permanent: bool) -> Self {
        Self {
            rejection: Some(Rejection {
                reason: reason.into(),
                permanent,
            }),
            ..Self::default()
        }
    }
}

/// Durable outputs, with an optional set the caller already loaded from them
///
/// The hint is trusted and answers before the store, but it only ever sits
/// beneath the uncommitted layer: an output spent since the last commit stays
/// spent whatever the hint says. Callers must refresh the hint after a commit.
struct CommittedView<'a, S: ChainStore> {
    hint: Option<&'a UtxoSet>,
    store: &'a S,
}

impl<S: ChainStore> OutputLookup for CommittedView<'_, S> {
    fn lookup(&self, outpoint: &OutPoint) -> Result<Option<UTXO>> {
        if let Some(utxo) = self.hint.and_then(|hint| hint.get(outpoint)) {
            return Ok(Some(utxo.clone()));
        }
        self.store.lookup(outpoint)
    }
}

struct ChainState {
    chain: ChainSegments,
    /// UTXO changes from the store's committed tip to the head
    utxos: UtxoLayer,
}

/// UTXO state at a candidate's parent, built on top of the head's
struct Speculation {
    layer: UtxoLayer,
    plan: ReorganizationPlan,
    /// Blocks of `plan.redo`, in the same order
    redone: Vec<Block>,
}

pub struct BlockProcessor<S: ChainStore> {
    params: ChainParams,
    config: EngineConfig,
    store: Arc<S>,
    network_time: Arc<dyn NetworkTime>,
    pool: rayon::ThreadPool,
    state: Mutex<ChainState>,
    listeners: RwLock<Vec<Arc<dyn MempoolListener>>>,
}

impl<S: ChainStore> BlockProcessor<S> {
    /// Restore the engine from `store`
    ///
    /// 1. Rebuild the block tree from the stored nodes, parents first
    /// 2. Restore the invalid set and the head
    /// 3. Replay the blocks between the committed UTXO tip and the head into
    ///    the UTXO layer
    pub fn open(
        store: Arc<S>,
        params: ChainParams,
        config: EngineConfig,
        network_time: Arc<dyn NetworkTime>,
    ) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.resolved_worker_threads())
            .thread_name(|index| format!("tx-validator-{}", index))
            .build()?;

        let mut chain = ChainSegments::new();
        let mut pending = store.load_block_nodes()?;
        while !pending.is_empty() {
            let before = pending.len();
            let mut deferred = Vec::new();
            for node in pending {
                if node.header.has_null_parent() || chain.contains(&node.header.prev_block_hash) {
                    chain.insert(node.header, node.has_transactions)?;
                } else {
                    deferred.push(node);
                }
            }
            if deferred.len() == before {
                return Err(ConsensusError::MissingData(format!(
                    "{} stored blocks have no known parent",
                    deferred.len()
                )));
            }
            pending = deferred;
        }

        for hash in store.load_invalid()? {
            chain.mark_invalid(hash);
        }

        let mut utxos = UtxoLayer::new();
        if let Some(head) = store.load_head()? {
            chain.set_head(head)?;
            let plan = plan_reorganization(&chain, store.utxo_tip()?.as_ref(), &head)?;
            let committed = CommittedView {
                hint: None,
                store: store.as_ref(),
            };
            for hash in &plan.undo {
                let entry = store
                    .load_undo(hash)?
                    .ok_or_else(|| missing("undo entry", hash))?;
                utxos.undo_block(&entry)?;
            }
            for hash in &plan.redo {
                let block = store.load_block(hash)?.ok_or_else(|| missing("block", hash))?;
                let height = chain.get(hash).map(|node| node.height).ok_or_else(|| missing("block", hash))?;
                utxos.apply_block(&committed, &utxo_effect(&block, height), height)?;
            }
            info!(
                "Opened {} chain of {} blocks at {} (height {}), replayed {} blocks",
                params.name,
                chain.len(),
                hash_to_hex(&head),
                chain.head().map(|node| node.height).unwrap_or(0),
                plan.redo.len()
            );
        }

        Ok(Self {
            params,
            config,
            store,
            network_time,
            pool,
            state: Mutex::new(ChainState { chain, utxos }),
            listeners: RwLock::new(Vec::new()),
        })
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn add_listener(&self, listener: Arc<dyn MempoolListener>) {
        self.listeners.write().push(listener);
    }

    /// Track a header whose body has not arrived yet
    ///
    /// Header-only blocks take part in difficulty and ancestry lookups but
    /// never become head.
    pub fn process_header(&self, header: &BlockHeader) -> Result<ProcessBlockResult> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let hash = header.hash();

        if let Some(node) = state.chain.get(&hash) {
            return Ok(ProcessBlockResult::accepted(node.height, false));
        }
        if let Some(rejection) = self.check_ancestry(state, header, false)? {
            return Ok(rejection);
        }
        let (height, _) = prospective(&state.chain, header)?;
        if let Some(rejection) = self.check_header(state, header, height)? {
            return Ok(rejection);
        }

        self.store.store_block_node(&StoredBlockNode {
            header: header.clone(),
            has_transactions: false,
        })?;
        state.chain.insert(header.clone(), false)?;
        debug!("Stored header {} at height {}", hash_to_hex(&hash), height);
        Ok(ProcessBlockResult::accepted(height, false))
    }

    /// ProcessBlock
    ///
    /// 1. Known-invalid blocks and children of invalid blocks are rejected
    ///    permanently; blocks already validated are accepted again unchanged
    /// 2. The parent must be known with a validated body
    /// 3. Header gate, merkle commitment and body structure
    /// 4. Carry the head's UTXO state to the parent in a child layer
    /// 5. Validate every transaction against that layer
    /// 6. Persist the block, then update the tree; a candidate that out-works
    ///    the head becomes head and its layer is folded into the chain state
    ///
    /// `hint` holds outputs the caller already loaded from the committed UTXO
    /// set. `Err` reports a transient failure: nothing was persisted or
    /// changed, and the block may be submitted again.
    pub fn process_block(&self, block: &Block, hint: Option<&UtxoSet>) -> Result<ProcessBlockResult> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let hash = block.hash();

        if let Some(node) = state.chain.get(&hash) {
            if node.has_transactions {
                return Ok(ProcessBlockResult::accepted(node.height, false));
            }
        }
        if let Some(rejection) = self.check_ancestry(state, &block.header, true)? {
            return Ok(rejection);
        }

        let (height, chain_work) = prospective(&state.chain, &block.header)?;
        let header_known = state.chain.contains(&hash);
        if !header_known {
            if let Some(rejection) = self.check_header(state, &block.header, height)? {
                return Ok(rejection);
            }
        }

        if !check_merkle_root(block) {
            warn!("Block {} does not match its merkle root", hash_to_hex(&hash));
            return Ok(ProcessBlockResult::rejected("Merkle root mismatch", false));
        }
        if let ValidationResult::Invalid(reason) = check_block_body(&self.params, block, height)? {
            return self.reject_invalid(state, &hash, reason, Vec::new());
        }

        let parent = (!block.header.has_null_parent()).then_some(block.header.prev_block_hash);
        let becomes_head = state.chain.outworks_head(&chain_work);
        let head_before = state.chain.head().map(|node| node.hash);
        if let Some(parent) = &parent {
            if head_before.as_ref() != Some(parent) {
                let relationship = state
                    .chain
                    .segment_of(parent)
                    .zip(state.chain.head_segment())
                    .map(|(parent_segment, head_segment)| state.chain.relationship(parent_segment, head_segment));
                debug!(
                    "Block {} at height {} forks off the head (parent segment {:?} to head), {}",
                    hash_to_hex(&hash),
                    height,
                    relationship,
                    if becomes_head { "reorganizing" } else { "validating speculatively" }
                );
            }
        }

        let outcome = {
            let committed = CommittedView {
                hint,
                store: self.store.as_ref(),
            };
            let base = state.utxos.view(&committed);
            let mut speculation = self.speculate(state, &base, parent.as_ref())?;
            let context = ChainContext::new(&state.chain, parent.as_ref());
            let median_time_past = match height {
                0 => 0,
                _ => context
                    .median_time_past_at(height - 1)?
                    .ok_or_else(|| missing("median time past of parent", &block.header.prev_block_hash))?,
            };

            let validation = validate_block_transactions(
                &self.params,
                block,
                height,
                &speculation.layer.view(&base),
                &context,
                &self.pool,
                median_time_past,
            )?;
            match validation.result {
                ValidationResult::Invalid(reason) => Err((reason, validation.invalid_transactions)),
                ValidationResult::Valid => {
                    speculation
                        .layer
                        .apply_block(&base, &utxo_effect(block, height), height)?;
                    let disconnected = if becomes_head && !self.listeners.read().is_empty() {
                        self.load_blocks(&speculation.plan.undo)?
                    } else {
                        Vec::new()
                    };
                    Ok((speculation, disconnected))
                }
            }
        };
        let (mut speculation, disconnected) = match outcome {
            Ok(accepted) => accepted,
            Err((reason, invalid_transactions)) => {
                return self.reject_invalid(state, &hash, reason, invalid_transactions);
            }
        };

        self.store.store_block(block)?;
        self.store.store_block_node(&StoredBlockNode {
            header: block.header.clone(),
            has_transactions: true,
        })?;
        if becomes_head {
            self.store.store_head(&hash)?;
        }

        if header_known {
            state.chain.set_has_transactions(&hash)?;
        } else {
            state.chain.insert(block.header.clone(), true)?;
        }
        if !becomes_head {
            debug!(
                "Block {} at height {} validated on a side chain",
                hash_to_hex(&hash),
                height
            );
            return Ok(ProcessBlockResult::accepted(height, false));
        }

        let plan = std::mem::take(&mut speculation.plan);
        state.utxos.absorb(speculation.layer)?;
        state.chain.set_head(hash)?;
        if plan.depth() > 0 {
            info!(
                "Reorganized from {} to {}: {} blocks disconnected, {} connected",
                head_before.as_ref().map(hash_to_hex).unwrap_or_default(),
                hash_to_hex(&hash),
                plan.depth(),
                plan.redo.len() + 1
            );
        }
        info!("New head {} at height {}", hash_to_hex(&hash), height);

        if state.utxos.pending_blocks() as u64 >= self.config.utxo_commit_interval {
            if let Err(error) = self.commit_locked(state) {
                warn!("Deferred UTXO commit after {}: {}", hash_to_hex(&hash), error);
            }
        }
        drop(guard);

        let mut connected = speculation.redone;
        connected.push(block.clone());
        self.notify(&ChainUpdate {
            disconnected,
            connected,
            head: hash,
            head_height: height,
        });

        Ok(ProcessBlockResult::accepted(height, true))
    }

    /// Compact target a block at `height` on the head's branch must carry
    pub fn calculate_required_difficulty(&self, height: Natural) -> Result<u32> {
        let state = self.state.lock();
        let head = state.chain.head().map(|node| node.hash);
        let context = ChainContext::new(&state.chain, head.as_ref());
        DifficultyCalculator::new(&self.params, &context).required_bits(height)
    }

    pub fn head_block_hash(&self) -> Option<Hash> {
        self.state.lock().chain.head().map(|node| node.hash)
    }

    pub fn head_block_height(&self) -> Option<Natural> {
        self.state.lock().chain.head().map(|node| node.height)
    }

    pub fn block_height(&self, hash: &Hash) -> Option<Natural> {
        self.state.lock().chain.get(hash).map(|node| node.height)
    }

    pub fn is_known_invalid(&self, hash: &Hash) -> bool {
        self.state.lock().chain.is_invalid(hash)
    }

    pub fn segment_of(&self, hash: &Hash) -> Option<SegmentId> {
        self.state.lock().chain.segment_of(hash)
    }

    pub fn segment_relationship(&self, a: SegmentId, b: SegmentId) -> SegmentRelationship {
        self.state.lock().chain.relationship(a, b)
    }

    pub fn head_segment(&self) -> Option<SegmentId> {
        self.state.lock().chain.head_segment()
    }

    /// Unspent output as of the head
    pub fn utxo(&self, outpoint: &OutPoint) -> Result<Option<UTXO>> {
        let state = self.state.lock();
        let committed = CommittedView {
            hint: None,
            store: self.store.as_ref(),
        };
        state.utxos.view(&committed).lookup(outpoint)
    }

    /// Flush the UTXO layer to storage now
    pub fn commit_utxos(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.commit_locked(&mut state)
    }

    fn commit_locked(&self, state: &mut ChainState) -> Result<()> {
        if state.utxos.is_empty() {
            return Ok(());
        }
        let tip = state.chain.head().map(|node| node.hash);
        let batch = state.utxos.to_batch(tip);
        self.store.commit_utxos(&batch)?;
        debug!(
            "Committed {} UTXO changes over {} blocks",
            batch.changes.len(),
            batch.applied.len()
        );
        state.utxos.clear();
        Ok(())
    }

    /// Permanent rejections that need no validation: the block itself or its
    /// parent is known invalid, or there is already a genesis block.
    /// Transient ones: the parent is unknown, or (for full blocks) its body has
    /// not been validated yet.
    fn check_ancestry(
        &self,
        state: &mut ChainState,
        header: &BlockHeader,
        needs_parent_body: bool,
    ) -> Result<Option<ProcessBlockResult>> {
        let hash = header.hash();
        if state.chain.is_invalid(&hash) {
            return Ok(Some(ProcessBlockResult::rejected("Block previously rejected", true)));
        }
        if header.has_null_parent() {
            if !state.chain.is_empty() && !state.chain.contains(&hash) {
                return self
                    .reject_invalid(state, &hash, "Block tree already has a genesis block".to_string(), Vec::new())
                    .map(Some);
            }
            return Ok(None);
        }

        let parent = &header.prev_block_hash;
        if state.chain.is_invalid(parent) {
            return self
                .reject_invalid(state, &hash, "Descends from an invalid block".to_string(), Vec::new())
                .map(Some);
        }
        match state.chain.get(parent) {
            None => Ok(Some(ProcessBlockResult::rejected("Unknown parent block", false))),
            Some(node) if needs_parent_body && !node.has_transactions => Ok(Some(ProcessBlockResult::rejected(
                "Parent block body not yet validated",
                false,
            ))),
            Some(_) => Ok(None),
        }
    }

    /// Header gate
    ///
    /// A chain rule failure is remembered as invalid. A timestamp ahead of the
    /// local clock is only deferred: the same header may pass once time
    /// catches up.
    fn check_header(
        &self,
        state: &mut ChainState,
        header: &BlockHeader,
        height: Natural,
    ) -> Result<Option<ProcessBlockResult>> {
        let hash = header.hash();
        let verdict = {
            let parent = (!header.has_null_parent()).then_some(header.prev_block_hash);
            let context = ChainContext::new(&state.chain, parent.as_ref());
            check_block_header(&self.params, header, height, &context)?
        };
        if let ValidationResult::Invalid(reason) = verdict {
            return self.reject_invalid(state, &hash, reason, Vec::new()).map(Some);
        }

        let now = self.network_time.now();
        if let ValidationResult::Invalid(reason) = check_block_time(header, now, self.config.max_future_block_time) {
            warn!("Deferred block {}: {}", hash_to_hex(&hash), reason);
            return Ok(Some(ProcessBlockResult::rejected(reason, false)));
        }
        Ok(None)
    }

    /// Remember `hash` as invalid, durably first
    fn reject_invalid(
        &self,
        state: &mut ChainState,
        hash: &Hash,
        reason: String,
        invalid_transactions: Vec<Hash>,
    ) -> Result<ProcessBlockResult> {
        self.store.store_invalid(hash)?;
        state.chain.mark_invalid(*hash);
        warn!("Rejected block {}: {}", hash_to_hex(hash), reason);
        let mut result = ProcessBlockResult::rejected(reason, true);
        result.invalid_transactions = invalid_transactions;
        Ok(result)
    }

    /// Child layer holding the UTXO state at `parent`
    ///
    /// 1. Plan the move from the head to `parent`
    /// 2. Undo head-side blocks with entries from the chain-state layer, or
    ///    from storage for blocks already committed
    /// 3. Redo the other branch with bodies loaded from storage
    fn speculate<B: OutputLookup + ?Sized>(
        &self,
        state: &ChainState,
        base: &B,
        parent: Option<&Hash>,
    ) -> Result<Speculation> {
        let mut layer = UtxoLayer::new();
        let head = state.chain.head().map(|node| node.hash);
        let Some(parent) = parent else {
            return Ok(Speculation {
                layer,
                plan: ReorganizationPlan::default(),
                redone: Vec::new(),
            });
        };

        let plan = plan_reorganization(&state.chain, head.as_ref(), parent)?;
        for hash in &plan.undo {
            let entry = match state.utxos.undo_entry(hash) {
                Some(entry) => entry.clone(),
                None => self
                    .store
                    .load_undo(hash)?
                    .ok_or_else(|| missing("undo entry", hash))?,
            };
            layer.undo_block(&entry)?;
            debug!("Speculatively undid block {}", hash_to_hex(hash));
        }

        let redone = self.load_blocks(&plan.redo)?;
        for (hash, block) in plan.redo.iter().zip(&redone) {
            let height = state
                .chain
                .get(hash)
                .map(|node| node.height)
                .ok_or_else(|| missing("block", hash))?;
            layer.apply_block(base, &utxo_effect(block, height), height)?;
            debug!("Speculatively redid block {} at height {}", hash_to_hex(hash), height);
        }

        Ok(Speculation { layer, plan, redone })
    }

    fn load_blocks(&self, hashes: &[Hash]) -> Result<Vec<Block>> {
        hashes
            .iter()
            .map(|hash| self.store.load_block(hash)?.ok_or_else(|| missing("block", hash)))
            .collect()
    }

    fn notify(&self, update: &ChainUpdate) {
        for listener in self.listeners.read().iter() {
            listener.on_chain_update(update);
        }
    }
}

/// What a block changes in the UTXO set: the genesis coinbase is never spendable
fn utxo_effect(block: &Block, height: Natural) -> Cow<'_, Block> {
    if height == 0 {
        Cow::Owned(Block {
            header: block.header.clone(),
            transactions: Vec::new(),
        })
    } else {
        Cow::Borrowed(block)
    }
}

fn prospective(chain: &ChainSegments, header: &BlockHeader) -> Result<(Natural, ChainWork)> {
    chain
        .prospective(header)
        .ok_or_else(|| missing("parent", &header.prev_block_hash))
}

fn missing(what: &str, hash: &Hash) -> ConsensusError {
    ConsensusError::MissingData(format!("{} {}", what, hash_to_hex(hash)))
}
