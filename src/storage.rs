//! Durable storage contract
//!
//! The engine persists the block tree (headers plus whether the body is
//! present), the validated head, the known-invalid set, block bodies and the
//! committed UTXO set with its undo entries. [`MemoryStore`] keeps all of it
//! in memory.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

use crate::context::OutputLookup;
use crate::error::Result;
use crate::types::*;
use crate::utxo::{UndoEntry, UtxoBatch};

/// A block-tree entry as persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlockNode {
    pub header: BlockHeader,
    pub has_transactions: bool,
}

pub trait ChainStore: OutputLookup + Send + Sync {
    /// Insert or update a block-tree entry
    fn store_block_node(&self, node: &StoredBlockNode) -> Result<()>;
    fn load_block_nodes(&self) -> Result<Vec<StoredBlockNode>>;

    fn store_block(&self, block: &Block) -> Result<()>;
    fn load_block(&self, hash: &Hash) -> Result<Option<Block>>;

    fn store_head(&self, hash: &Hash) -> Result<()>;
    fn load_head(&self) -> Result<Option<Hash>>;

    fn store_invalid(&self, hash: &Hash) -> Result<()>;
    fn load_invalid(&self) -> Result<Vec<Hash>>;

    /// Undo entry of a committed block
    fn load_undo(&self, hash: &Hash) -> Result<Option<UndoEntry>>;

    /// Apply a UTXO batch atomically: either all of it is visible afterwards or none
    fn commit_utxos(&self, batch: &UtxoBatch) -> Result<()>;

    /// Block whose state the committed UTXO set reflects
    fn utxo_tip(&self) -> Result<Option<Hash>>;
}

#[derive(Debug, Default)]
struct MemoryState {
    nodes: HashMap<Hash, StoredBlockNode>,
    node_order: Vec<Hash>,
    blocks: HashMap<Hash, Block>,
    head: Option<Hash>,
    invalid: HashSet<Hash>,
    utxos: HashMap<OutPoint, UTXO>,
    undo: HashMap<Hash, UndoEntry>,
    utxo_tip: Option<Hash>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed unspent outputs
    pub fn utxo_count(&self) -> usize {
        self.state.read().utxos.len()
    }
}

impl OutputLookup for MemoryStore {
    fn lookup(&self, outpoint: &OutPoint) -> Result<Option<UTXO>> {
        Ok(self.state.read().utxos.get(outpoint).cloned())
    }
}

impl ChainStore for MemoryStore {
    fn store_block_node(&self, node: &StoredBlockNode) -> Result<()> {
        let hash = node.header.hash();
        let mut state = self.state.write();
        if state.nodes.insert(hash, node.clone()).is_none() {
            state.node_order.push(hash);
        }
        Ok(())
    }

    fn load_block_nodes(&self) -> Result<Vec<StoredBlockNode>> {
        let state = self.state.read();
        Ok(state
            .node_order
            .iter()
            .filter_map(|hash| state.nodes.get(hash).cloned())
            .collect())
    }

    fn store_block(&self, block: &Block) -> Result<()> {
        self.state.write().blocks.insert(block.hash(), block.clone());
        Ok(())
    }

    fn load_block(&self, hash: &Hash) -> Result<Option<Block>> {
        Ok(self.state.read().blocks.get(hash).cloned())
    }

    fn store_head(&self, hash: &Hash) -> Result<()> {
        self.state.write().head = Some(*hash);
        Ok(())
    }

    fn load_head(&self) -> Result<Option<Hash>> {
        Ok(self.state.read().head)
    }

    fn store_invalid(&self, hash: &Hash) -> Result<()> {
        self.state.write().invalid.insert(*hash);
        Ok(())
    }

    fn load_invalid(&self) -> Result<Vec<Hash>> {
        Ok(self.state.read().invalid.iter().copied().collect())
    }

    fn load_undo(&self, hash: &Hash) -> Result<Option<UndoEntry>> {
        Ok(self.state.read().undo.get(hash).cloned())
    }

    fn commit_utxos(&self, batch: &UtxoBatch) -> Result<()> {
        let mut state = self.state.write();
        for (outpoint, change) in &batch.changes {
            match change {
                Some(utxo) => {
                    state.utxos.insert(*outpoint, utxo.clone());
                }
                None => {
                    state.utxos.remove(outpoint);
                }
            }
        }
        for hash in &batch.undone {
            state.undo.remove(hash);
        }
        for entry in &batch.applied {
            state.undo.insert(entry.block_hash, entry.clone());
        }
        state.utxo_tip = batch.tip;
        Ok(())
    }

    fn utxo_tip(&self) -> Result<Option<Hash>> {
        Ok(self.state.read().utxo_tip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block_hash: [0; 32],
            merkle_root: [0; 32],
            timestamp: 0,
            bits: 0x207fffff,
            nonce,
        }
    }

    #[test]
    fn test_block_nodes_keep_insertion_order_and_update_in_place() {
        let store = MemoryStore::new();
        for nonce in [3, 1, 2] {
            store
                .store_block_node(&StoredBlockNode {
                    header: header(nonce),
                    has_transactions: false,
                })
                .unwrap();
        }
        store
            .store_block_node(&StoredBlockNode {
                header: header(1),
                has_transactions: true,
            })
            .unwrap();

        let nodes = store.load_block_nodes().unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes.iter().map(|node| node.header.nonce).collect::<Vec<_>>(), vec![3, 1, 2]);
        assert!(nodes[1].has_transactions);
    }

    #[test]
    fn test_commit_applies_changes_and_undo_entries() {
        let store = MemoryStore::new();
        let kept = OutPoint::new([1; 32], 0);
        let removed = OutPoint::new([2; 32], 0);
        let utxo = UTXO {
            value: 5,
            script_pubkey: vec![0x51],
            height: 1,
            is_coinbase: false,
        };

        let mut batch = UtxoBatch::default();
        batch.changes.insert(kept, Some(utxo.clone()));
        batch.changes.insert(removed, Some(utxo.clone()));
        batch.applied.push(UndoEntry {
            block_hash: [7; 32],
            height: 1,
            spent: Vec::new(),
            created: vec![kept, removed],
        });
        batch.tip = Some([7; 32]);
        store.commit_utxos(&batch).unwrap();
        assert_eq!(store.utxo_count(), 2);

        let mut second = UtxoBatch::default();
        second.changes.insert(removed, None);
        second.undone.push([7; 32]);
        second.tip = None;
        store.commit_utxos(&second).unwrap();

        assert_eq!(store.lookup(&kept).unwrap(), Some(utxo));
        assert_eq!(store.lookup(&removed).unwrap(), None);
        assert!(store.load_undo(&[7; 32]).unwrap().is_none());
        assert_eq!(store.utxo_tip().unwrap(), None);
    }
}
