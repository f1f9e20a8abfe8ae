//! # Consensus Engine
//!
//! Consensus validation and chain-state engine for a UTXO ledger following
//! Bitcoin Cash rules.
//!
//! The crate validates blocks and transactions, keeps the block tree as chain
//! segments, selects the head by cumulative work, reorganizes the UTXO view
//! between competing branches and persists everything through a pluggable
//! [`ChainStore`].
//!
//! ## Architecture
//!
//! - Script interpreter ([`script`]) and transaction validator ([`transaction`])
//! - Block gates ([`block`]) with parallel transaction validation
//! - UTXO layer with undo log ([`utxo`]) and reorganization planning
//!   ([`reorganization`])
//! - Block tree as chain segments ([`chain`]) and difficulty calculation
//!   ([`difficulty`])
//! - Block processor ([`processor`]), the single entry point that owns the
//!   chain state, plus a submission queue ([`pipeline`])
//!
//! ## Design Principles
//!
//! 1. **Rule violations are values**: they come back as [`ValidationResult`]
//!    or a [`ProcessBlockResult`]; [`ConsensusError`] is reserved for
//!    infrastructure failures and broken invariants
//! 2. **Configurable activation**: every fork activation point lives in
//!    [`ChainParams`]
//! 3. **Exact Version Pinning**: all consensus-critical dependencies are pinned
//!    to exact versions
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use consensus_engine::{BlockProcessor, ChainParams, EngineConfig, MemoryStore};
//! use consensus_engine::context::SystemNetworkTime;
//!
//! let processor = BlockProcessor::open(
//!     Arc::new(MemoryStore::new()),
//!     ChainParams::regtest(),
//!     EngineConfig::default(),
//!     Arc::new(SystemNetworkTime),
//! )
//! .unwrap();
//! assert_eq!(processor.head_block_hash(), None);
//! ```

pub mod types;
pub mod constants;
pub mod error;
pub mod config;
pub mod serialization;
pub mod pow;
pub mod difficulty;
pub mod context;
pub mod chain;
pub mod script;
pub mod transaction;
pub mod utxo;
pub mod block;
pub mod economic;
pub mod reorganization;
pub mod storage;
pub mod mempool;
pub mod processor;
pub mod pipeline;

// Re-export commonly used types
pub use types::*;
pub use constants::*;
pub use error::{ConsensusError, Result};
pub use config::{ChainParams, EngineConfig};
pub use mempool::{ChainUpdate, Mempool, MempoolListener};
pub use processor::{BlockProcessor, ProcessBlockResult, Rejection};
pub use storage::{ChainStore, MemoryStore};
