//! Block tree modelled as chain segments
//!
//! A segment is a maximal run of blocks without an internal fork. Segments form
//! a tree rooted at the genesis segment; a child segment always branches off the
//! last block of its parent segment, so every block of a parent segment is an
//! ancestor of every block in its children.

use std::collections::{HashMap, HashSet};

use crate::error::{ConsensusError, Result};
use crate::pow::{block_work, ChainWork};
use crate::types::*;

pub type SegmentId = u64;

/// A known block (header, and possibly a validated body)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockNode {
    pub hash: Hash,
    pub header: BlockHeader,
    pub height: Natural,
    pub segment: SegmentId,
    pub chain_work: ChainWork,
    /// The full transaction set has been received and validated
    pub has_transactions: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSegment {
    pub id: SegmentId,
    pub parent: Option<SegmentId>,
    /// Height of `blocks[0]`
    pub base_height: Natural,
    pub blocks: Vec<Hash>,
}

impl ChainSegment {
    fn tip_height(&self) -> Natural {
        self.base_height + self.blocks.len() as Natural - 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentRelationship {
    Same,
    /// The first segment is an ancestor of the second
    Ancestor,
    /// The first segment descends from the second
    Descendant,
    Unrelated,
}

#[derive(Debug, Default)]
pub struct ChainSegments {
    nodes: HashMap<Hash, BlockNode>,
    children: HashMap<Hash, Vec<Hash>>,
    segments: HashMap<SegmentId, ChainSegment>,
    next_segment_id: SegmentId,
    head: Option<Hash>,
    invalid: HashSet<Hash>,
}

impl ChainSegments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, hash: &Hash) -> Option<&BlockNode> {
        self.nodes.get(hash)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.nodes.contains_key(hash)
    }

    pub fn segment_of(&self, hash: &Hash) -> Option<SegmentId> {
        self.nodes.get(hash).map(|node| node.segment)
    }

    pub fn children_of(&self, hash: &Hash) -> &[Hash] {
        self.children.get(hash).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn head(&self) -> Option<&BlockNode> {
        self.head.as_ref().and_then(|hash| self.nodes.get(hash))
    }

    pub fn head_segment(&self) -> Option<SegmentId> {
        self.head().map(|node| node.segment)
    }

    /// Move the validated head. Only blocks with a validated body qualify.
    pub fn set_head(&mut self, hash: Hash) -> Result<()> {
        match self.nodes.get(&hash) {
            Some(node) if node.has_transactions => {
                self.head = Some(hash);
                Ok(())
            }
            Some(_) => Err(ConsensusError::InvariantViolation(format!(
                "header-only block {} cannot become head",
                hash_to_hex(&hash)
            ))),
            None => Err(ConsensusError::InvariantViolation(format!(
                "unknown block {} cannot become head",
                hash_to_hex(&hash)
            ))),
        }
    }

    /// Whether a block with `chain_work` should replace the current head.
    /// Equal work keeps the block seen first.
    pub fn outworks_head(&self, chain_work: &ChainWork) -> bool {
        match self.head() {
            Some(head) => *chain_work > head.chain_work,
            None => true,
        }
    }

    pub fn mark_invalid(&mut self, hash: Hash) {
        self.invalid.insert(hash);
    }

    pub fn is_invalid(&self, hash: &Hash) -> bool {
        self.invalid.contains(hash)
    }

    pub fn set_has_transactions(&mut self, hash: &Hash) -> Result<()> {
        let node = self.nodes.get_mut(hash).ok_or_else(|| {
            ConsensusError::InvariantViolation(format!("unknown block {}", hash_to_hex(hash)))
        })?;
        node.has_transactions = true;
        Ok(())
    }

    /// Height and chain work a header would have if inserted, without inserting it
    pub fn prospective(&self, header: &BlockHeader) -> Option<(Natural, ChainWork)> {
        if header.has_null_parent() {
            return Some((0, block_work(header.bits)));
        }
        let parent = self.nodes.get(&header.prev_block_hash)?;
        Some((parent.height + 1, parent.chain_work + block_work(header.bits)))
    }

    /// Insert a header into the tree, extending or splitting segments.
    ///
    /// 1. A parentless header starts a root segment
    /// 2. A parent at the tip of its segment with no children is extended in place
    /// 3. A parent at a segment tip that already has children gets a new child segment
    /// 4. A parent inside a segment splits it: the tail moves to a new segment and
    ///    the header starts another new segment beside it
    pub fn insert(&mut self, header: BlockHeader, has_transactions: bool) -> Result<&BlockNode> {
        let hash = header.hash();
        if self.nodes.contains_key(&hash) {
            return Err(ConsensusError::InvariantViolation(format!(
                "block {} already in the tree",
                hash_to_hex(&hash)
            )));
        }

        let (height, chain_work, segment) = if header.has_null_parent() {
            let segment = self.new_segment(None, 0);
            (0, block_work(header.bits), segment)
        } else {
            let parent = self.nodes.get(&header.prev_block_hash).ok_or_else(|| {
                ConsensusError::InvariantViolation(format!(
                    "parent {} of {} is unknown",
                    hash_to_hex(&header.prev_block_hash),
                    hash_to_hex(&hash)
                ))
            })?;
            let parent_hash = parent.hash;
            let parent_height = parent.height;
            let parent_segment = parent.segment;
            let chain_work = parent.chain_work + block_work(header.bits);

            let segment_tip_height = self
                .segments
                .get(&parent_segment)
                .map(ChainSegment::tip_height)
                .ok_or_else(|| missing_segment(parent_segment))?;

            let segment = if parent_height == segment_tip_height {
                if self.children_of(&parent_hash).is_empty() {
                    parent_segment
                } else {
                    self.new_segment(Some(parent_segment), parent_height + 1)
                }
            } else {
                self.split(parent_segment, parent_height)?;
                self.new_segment(Some(parent_segment), parent_height + 1)
            };

            self.children.entry(parent_hash).or_default().push(hash);
            (parent_height + 1, chain_work, segment)
        };

        self.segments
            .get_mut(&segment)
            .ok_or_else(|| missing_segment(segment))?
            .blocks
            .push(hash);

        let node = BlockNode {
            hash,
            header,
            height,
            segment,
            chain_work,
            has_transactions,
        };
        Ok(self.nodes.entry(hash).or_insert(node))
    }

    fn new_segment(&mut self, parent: Option<SegmentId>, base_height: Natural) -> SegmentId {
        let id = self.next_segment_id;
        self.next_segment_id += 1;
        self.segments.insert(
            id,
            ChainSegment {
                id,
                parent,
                base_height,
                blocks: Vec::new(),
            },
        );
        id
    }

    /// Cut `segment_id` after `height`, moving the tail into a new child segment
    fn split(&mut self, segment_id: SegmentId, height: Natural) -> Result<()> {
        let tail = {
            let segment = self
                .segments
                .get_mut(&segment_id)
                .ok_or_else(|| missing_segment(segment_id))?;
            let keep = (height - segment.base_height + 1) as usize;
            segment.blocks.split_off(keep)
        };

        let tail_id = self.new_segment(Some(segment_id), height + 1);
        for segment in self.segments.values_mut() {
            if segment.parent == Some(segment_id) && segment.id != tail_id {
                segment.parent = Some(tail_id);
            }
        }
        for hash in &tail {
            if let Some(node) = self.nodes.get_mut(hash) {
                node.segment = tail_id;
            }
        }
        if let Some(segment) = self.segments.get_mut(&tail_id) {
            segment.blocks = tail;
        }
        Ok(())
    }

    /// The ancestor of `tip` (inclusive) at `height`
    pub fn ancestor_at(&self, tip: &Hash, height: Natural) -> Option<&BlockNode> {
        let node = self.nodes.get(tip)?;
        if height > node.height {
            return None;
        }
        let mut segment = self.segments.get(&node.segment)?;
        loop {
            if height >= segment.base_height {
                let offset = (height - segment.base_height) as usize;
                return segment.blocks.get(offset).and_then(|hash| self.nodes.get(hash));
            }
            segment = self.segments.get(&segment.parent?)?;
        }
    }

    pub fn is_ancestor_segment(&self, ancestor: SegmentId, descendant: SegmentId) -> bool {
        let mut current = self.segments.get(&descendant).and_then(|segment| segment.parent);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.segments.get(&id).and_then(|segment| segment.parent);
        }
        false
    }

    pub fn relationship(&self, a: SegmentId, b: SegmentId) -> SegmentRelationship {
        if a == b {
            SegmentRelationship::Same
        } else if self.is_ancestor_segment(a, b) {
            SegmentRelationship::Ancestor
        } else if self.is_ancestor_segment(b, a) {
            SegmentRelationship::Descendant
        } else {
            SegmentRelationship::Unrelated
        }
    }

    /// Whether block `ancestor` lies on the path from genesis to `descendant`
    pub fn is_ancestor_block(&self, ancestor: &Hash, descendant: &Hash) -> bool {
        match self.nodes.get(ancestor) {
            Some(node) => self
                .ancestor_at(descendant, node.height)
                .map(|found| found.hash == *ancestor)
                .unwrap_or(false),
            None => false,
        }
    }
}

fn missing_segment(id: SegmentId) -> ConsensusError {
    ConsensusError::InvariantViolation(format!("segment {} is missing", id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(prev: Hash, nonce: u32, bits: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block_hash: prev,
            merkle_root: [0; 32],
            timestamp: 1_600_000_000 + nonce,
            bits,
            nonce,
        }
    }

    fn extend(chain: &mut ChainSegments, prev: Hash, nonce: u32, bits: u32) -> Hash {
        chain.insert(header(prev, nonce, bits), true).unwrap().hash
    }

    #[test]
    fn test_linear_chain_stays_in_one_segment() {
        let mut chain = ChainSegments::new();
        let genesis = extend(&mut chain, [0; 32], 0, 0x207fffff);
        let a = extend(&mut chain, genesis, 1, 0x207fffff);
        let b = extend(&mut chain, a, 2, 0x207fffff);
        assert_eq!(chain.segment_of(&genesis), chain.segment_of(&b));
        assert_eq!(chain.get(&b).unwrap().height, 2);
        assert_eq!(chain.ancestor_at(&b, 1).unwrap().hash, a);
    }

    #[test]
    fn test_fork_in_middle_splits_segment() {
        let mut chain = ChainSegments::new();
        let genesis = extend(&mut chain, [0; 32], 0, 0x207fffff);
        let a1 = extend(&mut chain, genesis, 1, 0x207fffff);
        let a2 = extend(&mut chain, a1, 2, 0x207fffff);
        let a3 = extend(&mut chain, a2, 3, 0x207fffff);
        let b2 = extend(&mut chain, a1, 20, 0x207fffff);

        let root = chain.segment_of(&a1).unwrap();
        let tail = chain.segment_of(&a2).unwrap();
        let fork = chain.segment_of(&b2).unwrap();
        assert_eq!(chain.segment_of(&genesis), Some(root));
        assert_eq!(chain.segment_of(&a3), Some(tail));
        assert_ne!(tail, fork);
        assert_eq!(chain.relationship(root, tail), SegmentRelationship::Ancestor);
        assert_eq!(chain.relationship(fork, root), SegmentRelationship::Descendant);
        assert_eq!(chain.relationship(tail, fork), SegmentRelationship::Unrelated);
        assert_eq!(chain.relationship(fork, fork), SegmentRelationship::Same);

        assert_eq!(chain.ancestor_at(&b2, 1).unwrap().hash, a1);
        assert_eq!(chain.ancestor_at(&a3, 2).unwrap().hash, a2);
        assert!(chain.is_ancestor_block(&a1, &b2));
        assert!(!chain.is_ancestor_block(&a2, &b2));
    }

    #[test]
    fn test_split_reparents_existing_children() {
        let mut chain = ChainSegments::new();
        let genesis = extend(&mut chain, [0; 32], 0, 0x207fffff);
        let a1 = extend(&mut chain, genesis, 1, 0x207fffff);
        let a2 = extend(&mut chain, a1, 2, 0x207fffff);
        // b3 extends the root segment, c3 then splits it at a2
        let b3 = extend(&mut chain, a2, 30, 0x207fffff);
        let c3 = extend(&mut chain, a2, 31, 0x207fffff);
        // Now split the root segment below a2
        let d2 = extend(&mut chain, a1, 40, 0x207fffff);

        assert_eq!(chain.ancestor_at(&c3, 2).unwrap().hash, a2);
        assert_eq!(chain.ancestor_at(&c3, 0).unwrap().hash, genesis);
        assert_eq!(chain.ancestor_at(&b3, 1).unwrap().hash, a1);
        let a2_segment = chain.segment_of(&a2).unwrap();
        assert_eq!(
            chain.relationship(a2_segment, chain.segment_of(&c3).unwrap()),
            SegmentRelationship::Ancestor
        );
        assert_eq!(
            chain.relationship(chain.segment_of(&d2).unwrap(), chain.segment_of(&b3).unwrap()),
            SegmentRelationship::Unrelated
        );
    }

    #[test]
    fn test_head_selection_prefers_more_work_over_length() {
        let mut chain = ChainSegments::new();
        let genesis = extend(&mut chain, [0; 32], 0, 0x207fffff);
        chain.set_head(genesis).unwrap();

        // Two equal-length branches; the second carries a harder target
        let easy = extend(&mut chain, genesis, 1, 0x207fffff);
        let hard = extend(&mut chain, genesis, 2, 0x1f7fffff);
        for candidate in [hard, easy] {
            let work = chain.get(&candidate).unwrap().chain_work;
            if chain.outworks_head(&work) {
                chain.set_head(candidate).unwrap();
            }
        }
        assert_eq!(chain.head().unwrap().hash, hard);
    }

    #[test]
    fn test_equal_work_keeps_first_seen_head() {
        let mut chain = ChainSegments::new();
        let genesis = extend(&mut chain, [0; 32], 0, 0x207fffff);
        chain.set_head(genesis).unwrap();
        let first = extend(&mut chain, genesis, 1, 0x207fffff);
        chain.set_head(first).unwrap();
        let second = extend(&mut chain, genesis, 2, 0x207fffff);
        let work = chain.get(&second).unwrap().chain_work;
        assert!(!chain.outworks_head(&work));
    }

    #[test]
    fn test_header_only_block_cannot_be_head() {
        let mut chain = ChainSegments::new();
        let genesis = chain.insert(header([0; 32], 0, 0x207fffff), false).unwrap().hash;
        assert!(matches!(chain.set_head(genesis), Err(ConsensusError::InvariantViolation(_))));
    }
}
