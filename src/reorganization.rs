//! Chain reorganization planning
//!
//! Moving the UTXO state from one tip of the block tree to another means
//! undoing blocks down to the common ancestor and applying the other branch
//! from there.

use crate::chain::{BlockNode, ChainSegments};
use crate::error::{ConsensusError, Result};
use crate::types::*;

/// Steps that take the UTXO state from one tip to another
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReorganizationPlan {
    /// Last block shared by both branches; `None` when they share nothing
    pub fork_point: Option<Hash>,
    /// Blocks to undo, newest first
    pub undo: Vec<Hash>,
    /// Blocks to apply, oldest first
    pub redo: Vec<Hash>,
}

impl ReorganizationPlan {
    pub fn is_empty(&self) -> bool {
        self.undo.is_empty() && self.redo.is_empty()
    }

    /// Number of blocks disconnected
    pub fn depth(&self) -> usize {
        self.undo.len()
    }
}

/// Plan the move from `from` (the current UTXO tip, `None` before genesis is
/// applied) to `to`
///
/// 1. Step the higher tip back until both are at the same height
/// 2. Step both back together until they meet
/// 3. Everything passed on `from`'s side is undone, everything passed on
///    `to`'s side is redone in reverse order
pub fn plan_reorganization(chain: &ChainSegments, from: Option<&Hash>, to: &Hash) -> Result<ReorganizationPlan> {
    let mut plan = ReorganizationPlan::default();
    let mut target = Some(node(chain, to)?);
    let mut current = match from {
        Some(hash) => Some(node(chain, hash)?),
        None => None,
    };

    loop {
        match (current, target) {
            (Some(a), Some(b)) if a.hash == b.hash => {
                plan.fork_point = Some(a.hash);
                break;
            }
            (Some(a), Some(b)) if a.height >= b.height => {
                plan.undo.push(a.hash);
                current = parent(chain, a)?;
                if a.height > b.height {
                    continue;
                }
                plan.redo.push(b.hash);
                target = parent(chain, b)?;
            }
            (Some(a), None) => {
                plan.undo.push(a.hash);
                current = parent(chain, a)?;
            }
            (_, Some(b)) => {
                plan.redo.push(b.hash);
                target = parent(chain, b)?;
            }
            (None, None) => break,
        }
    }

    plan.redo.reverse();
    Ok(plan)
}

fn node<'a>(chain: &'a ChainSegments, hash: &Hash) -> Result<&'a BlockNode> {
    chain
        .get(hash)
        .ok_or_else(|| ConsensusError::MissingData(format!("block {} not in the tree", hash_to_hex(hash))))
}

fn parent<'a>(chain: &'a ChainSegments, child: &BlockNode) -> Result<Option<&'a BlockNode>> {
    if child.header.has_null_parent() {
        return Ok(None);
    }
    node(chain, &child.header.prev_block_hash).map(Some)
}
