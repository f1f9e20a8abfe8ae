//! UTXO view and undo log
//!
//! A [`UtxoLayer`] records changes on top of some underlying [`OutputLookup`]
//! (durable storage, or another layer). Applying a block records an
//! [`UndoEntry`] so the block can be undone until the layer is committed.
//! Speculative work (side-chain validation, reorganization) happens in a child
//! layer that is either absorbed into its parent or dropped.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::context::OutputLookup;
use crate::error::{ConsensusError, Result};
use crate::types::*;

/// Effect of one applied block: the outputs it spent, with their data, and the
/// outputs it created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoEntry {
    pub block_hash: Hash,
    pub height: Natural,
    pub spent: Vec<(OutPoint, UTXO)>,
    pub created: Vec<OutPoint>,
}

/// Everything a commit writes to durable storage
#[derive(Debug, Clone, Default)]
pub struct UtxoBatch {
    /// `None` deletes the output
    pub changes: HashMap<OutPoint, Option<UTXO>>,
    /// Undo entries of newly applied blocks, oldest first
    pub applied: Vec<UndoEntry>,
    /// Previously committed blocks that have since been undone, newest first
    pub undone: Vec<Hash>,
    /// Block whose UTXO state the batch completes
    pub tip: Option<Hash>,
}

#[derive(Debug, Clone, Default)]
pub struct UtxoLayer {
    changes: HashMap<OutPoint, Option<UTXO>>,
    undo: Vec<UndoEntry>,
    undone: Vec<Hash>,
}

/// A layer seen through to its base
pub struct LayeredView<'a, B: OutputLookup + ?Sized> {
    layer: &'a UtxoLayer,
    base: &'a B,
}

impl<B: OutputLookup + ?Sized> OutputLookup for LayeredView<'_, B> {
    fn lookup(&self, outpoint: &OutPoint) -> Result<Option<UTXO>> {
        match self.layer.changes.get(outpoint) {
            Some(change) => Ok(change.clone()),
            None => self.base.lookup(outpoint),
        }
    }
}

impl UtxoLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.undo.is_empty() && self.undone.is_empty()
    }

    /// Blocks applied in this layer and not yet committed
    pub fn pending_blocks(&self) -> usize {
        self.undo.len()
    }

    pub fn view<'a, B: OutputLookup + ?Sized>(&'a self, base: &'a B) -> LayeredView<'a, B> {
        LayeredView { layer: self, base }
    }

    /// Undo entry of a block applied in this layer
    pub fn undo_entry(&self, block_hash: &Hash) -> Option<&UndoEntry> {
        self.undo.iter().rev().find(|entry| entry.block_hash == *block_hash)
    }

    /// ApplyBlock
    ///
    /// 1. Add every output the block creates
    /// 2. Remove every output its non-coinbase inputs spend, keeping its data
    ///    in the undo entry
    ///
    /// Outputs are added first so spends of outputs created later in the same
    /// block resolve. The block must already be valid against this view.
    pub fn apply_block<B: OutputLookup + ?Sized>(&mut self, base: &B, block: &Block, height: Natural) -> Result<()> {
        let block_hash = block.hash();
        let mut entry = UndoEntry {
            block_hash,
            height,
            spent: Vec::new(),
            created: Vec::new(),
        };

        for (index, tx) in block.transactions.iter().enumerate() {
            let tx_hash = tx.hash();
            let is_coinbase = index == 0 && tx.is_coinbase();
            for (output_index, output) in tx.outputs.iter().enumerate() {
                let outpoint = OutPoint::new(tx_hash, output_index as u32);
                self.changes.insert(
                    outpoint,
                    Some(UTXO {
                        value: output.value,
                        script_pubkey: output.script_pubkey.clone(),
                        height,
                        is_coinbase,
                    }),
                );
                entry.created.push(outpoint);
            }
        }

        for (index, tx) in block.transactions.iter().enumerate() {
            if index == 0 && tx.is_coinbase() {
                continue;
            }
            for input in &tx.inputs {
                let utxo = self.view(base).lookup(&input.prevout)?.ok_or_else(|| {
                    ConsensusError::InvariantViolation(format!(
                        "block {} spends unavailable output {}",
                        hash_to_hex(&block_hash),
                        input.prevout
                    ))
                })?;
                self.changes.insert(input.prevout, None);
                entry.spent.push((input.prevout, utxo));
            }
        }

        debug!(
            "Applied block {} at height {}: {} spent, {} created",
            hash_to_hex(&block_hash),
            height,
            entry.spent.len(),
            entry.created.len()
        );
        self.undo.push(entry);
        Ok(())
    }

    /// UndoBlock
    ///
    /// Restores spent outputs, then removes created ones, so outputs created
    /// and spent within the block stay absent. Blocks applied in this layer
    /// must be undone newest first; once they are exhausted, blocks of the
    /// underlying state may be undone with entries supplied by the caller.
    pub fn undo_block(&mut self, entry: &UndoEntry) -> Result<()> {
        self.forget(&entry.block_hash)?;
        for (outpoint, utxo) in &entry.spent {
            self.changes.insert(*outpoint, Some(utxo.clone()));
        }
        for outpoint in &entry.created {
            self.changes.insert(*outpoint, None);
        }
        debug!(
            "Undid block {} at height {}",
            hash_to_hex(&entry.block_hash),
            entry.height
        );
        Ok(())
    }

    fn forget(&mut self, block_hash: &Hash) -> Result<()> {
        match self.undo.last() {
            Some(top) if top.block_hash == *block_hash => {
                self.undo.pop();
                Ok(())
            }
            Some(top) => Err(ConsensusError::InvariantViolation(format!(
                "undo of {} while {} is the most recently applied block",
                hash_to_hex(block_hash),
                hash_to_hex(&top.block_hash)
            ))),
            None => {
                self.undone.push(*block_hash);
                Ok(())
            }
        }
    }

    /// Fold a child layer built on top of this one into it
    pub fn absorb(&mut self, child: UtxoLayer) -> Result<()> {
        for block_hash in &child.undone {
            self.forget(block_hash)?;
        }
        self.changes.extend(child.changes);
        self.undo.extend(child.undo);
        Ok(())
    }

    /// Contents of the layer as a commit batch
    pub fn to_batch(&self, tip: Option<Hash>) -> UtxoBatch {
        UtxoBatch {
            changes: self.changes.clone(),
            applied: self.undo.clone(),
            undone: self.undone.clone(),
            tip,
        }
    }

    /// Drop everything, once a batch made from the layer is durable
    pub fn clear(&mut self) {
        self.changes.clear();
        self.undo.clear();
        self.undone.clear();
    }
}
