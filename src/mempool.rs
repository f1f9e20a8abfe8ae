//! Unconfirmed transactions and chain-update notifications
//!
//! The processor reports every head change to its [`MempoolListener`]s with
//! the blocks that were disconnected and connected. [`Mempool`] uses that to
//! drop transactions that can no longer be mined on the new chain.

use log::debug;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::Result;
use crate::transaction::check_transaction;
use crate::types::*;

/// A change of the validated head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainUpdate {
    /// Blocks removed from the main chain, newest first
    pub disconnected: Vec<Block>,
    /// Blocks added to the main chain, oldest first
    pub connected: Vec<Block>,
    pub head: Hash,
    pub head_height: Natural,
}

/// Receives head changes once they are durable
pub trait MempoolListener: Send + Sync {
    fn on_chain_update(&self, update: &ChainUpdate);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MempoolResult {
    Accepted,
    Rejected(String),
}

#[derive(Debug, Default)]
struct MempoolState {
    transactions: HashMap<Hash, Transaction>,
    /// Which pool transaction spends each outpoint
    spends: HashMap<OutPoint, Hash>,
}

impl MempoolState {
    fn remove(&mut self, hash: &Hash) -> Option<Transaction> {
        let tx = self.transactions.remove(hash)?;
        for input in &tx.inputs {
            if self.spends.get(&input.prevout) == Some(hash) {
                self.spends.remove(&input.prevout);
            }
        }
        Some(tx)
    }

    /// Remove `roots` and every pool transaction that spends their outputs
    fn remove_with_descendants(&mut self, roots: Vec<Hash>, evicted: &mut Vec<Hash>) {
        let mut queue: VecDeque<Hash> = roots.into();
        while let Some(hash) = queue.pop_front() {
            let Some(tx) = self.remove(&hash) else {
                continue;
            };
            for index in 0..tx.outputs.len() {
                if let Some(child) = self.spends.get(&OutPoint::new(hash, index as u32)) {
                    queue.push_back(*child);
                }
            }
            evicted.push(hash);
        }
    }
}

/// In-memory pool of unconfirmed transactions
#[derive(Debug, Default)]
pub struct Mempool {
    state: RwLock<MempoolState>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a transaction
    ///
    /// 1. Coinbase transactions and transactions already in the pool are refused
    /// 2. The transaction must be structurally valid
    /// 3. No input may be spent by another pool transaction
    ///
    /// Inputs are not resolved against the UTXO set here.
    pub fn add(&self, tx: Transaction) -> Result<MempoolResult> {
        if tx.is_coinbase() {
            return Ok(MempoolResult::Rejected("Coinbase transaction".to_string()));
        }
        let hash = tx.hash();
        let mut state = self.state.write();
        if state.transactions.contains_key(&hash) {
            return Ok(MempoolResult::Rejected("Transaction already in mempool".to_string()));
        }
        if let ValidationResult::Invalid(reason) = check_transaction(&tx)? {
            return Ok(MempoolResult::Rejected(reason));
        }
        if let Some(input) = tx.inputs.iter().find(|input| state.spends.contains_key(&input.prevout)) {
            return Ok(MempoolResult::Rejected(format!(
                "Input {} already spent in mempool",
                input.prevout
            )));
        }

        for input in &tx.inputs {
            state.spends.insert(input.prevout, hash);
        }
        state.transactions.insert(hash, tx);
        Ok(MempoolResult::Accepted)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.state.read().transactions.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<Transaction> {
        self.state.read().transactions.get(hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bring the pool in line with a new head; returns the evicted hashes
    ///
    /// 1. Transactions mined by a connected block leave the pool
    /// 2. Transactions spending an outpoint a connected block spent conflict
    ///    with the chain and are evicted
    /// 3. Transactions spending outputs that only disconnected blocks created
    ///    are evicted
    /// 4. Descendants of evicted transactions follow them; descendants of
    ///    mined transactions stay
    pub fn apply_chain_update(&self, update: &ChainUpdate) -> Vec<Hash> {
        let mut orphaned: HashSet<OutPoint> = HashSet::new();
        for block in &update.disconnected {
            for tx in &block.transactions {
                let hash = tx.hash();
                orphaned.extend((0..tx.outputs.len()).map(|index| OutPoint::new(hash, index as u32)));
            }
        }

        let mut mined = Vec::new();
        let mut chain_spends = HashSet::new();
        for block in &update.connected {
            for tx in &block.transactions {
                let hash = tx.hash();
                for index in 0..tx.outputs.len() {
                    orphaned.remove(&OutPoint::new(hash, index as u32));
                }
                if !tx.is_coinbase() {
                    chain_spends.extend(tx.inputs.iter().map(|input| input.prevout));
                }
                mined.push(hash);
            }
        }

        let mut state = self.state.write();
        let mut confirmed = 0usize;
        for hash in &mined {
            if state.remove(hash).is_some() {
                confirmed += 1;
            }
        }

        let invalidated: Vec<Hash> = state
            .transactions
            .iter()
            .filter(|(_, tx)| {
                tx.inputs
                    .iter()
                    .any(|input| chain_spends.contains(&input.prevout) || orphaned.contains(&input.prevout))
            })
            .map(|(hash, _)| *hash)
            .collect();

        let mut evicted = Vec::new();
        state.remove_with_descendants(invalidated, &mut evicted);
        debug!(
            "Mempool update to {}: {} confirmed, {} evicted, {} remaining",
            hash_to_hex(&update.head),
            confirmed,
            evicted.len(),
            state.transactions.len()
        );
        evicted
    }
}

impl MempoolListener for Mempool {
    fn on_chain_update(&self, update: &ChainUpdate) {
        self.apply_chain_update(update);
    }
}
