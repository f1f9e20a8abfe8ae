//! Core ledger types for consensus validation

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::serialization::{double_sha256, serialize_header, serialize_transaction};

/// Hash type: 256-bit hash, in the internal (little-endian) byte order
pub type Hash = [u8; 32];

/// Byte string type
pub type ByteString = Vec<u8>;

/// Natural number type (block heights, counts)
pub type Natural = u64;

/// Integer type (amounts in the smallest unit)
pub type Integer = i64;

/// Render a hash the way block explorers do (byte-reversed hex).
pub fn hash_to_hex(hash: &Hash) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}

/// Parse a byte-reversed hex hash.
pub fn hash_from_hex(value: &str) -> Option<Hash> {
    let bytes = hex::decode(value).ok()?;
    let mut hash: Hash = bytes.try_into().ok()?;
    hash.reverse();
    Some(hash)
}

/// OutPoint: the (transaction hash, output index) key of a UTXO
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: Hash,
    pub index: u32,
}

impl OutPoint {
    /// Sentinel carried by the single input of a coinbase transaction.
    pub const COINBASE: OutPoint = OutPoint { hash: [0u8; 32], index: 0xffff_ffff };

    pub fn new(hash: Hash, index: u32) -> Self {
        Self { hash, index }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::COINBASE
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hash_to_hex(&self.hash), self.index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInput {
    pub prevout: OutPoint,
    pub script_sig: ByteString,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub value: Integer,
    pub script_pubkey: ByteString,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub lock_time: u32,
}

impl Transaction {
    /// SHA-256d of the wire serialization.
    pub fn hash(&self) -> Hash {
        double_sha256(&serialize_transaction(self))
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    pub fn total_output_value(&self) -> Option<Integer> {
        self.outputs
            .iter()
            .try_fold(0i64, |total, output| total.checked_add(output.value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block_hash: Hash,
    pub merkle_root: Hash,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// SHA-256d of the 80-byte header; the block's identity.
    pub fn hash(&self) -> Hash {
        double_sha256(&serialize_header(self))
    }

    pub fn has_null_parent(&self) -> bool {
        self.prev_block_hash == [0u8; 32]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }
}

/// UTXO: a spendable output plus the metadata consensus needs about it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UTXO {
    pub value: Integer,
    pub script_pubkey: ByteString,
    pub height: Natural,
    pub is_coinbase: bool,
}

/// A plain outpoint-keyed UTXO map, used for hints and tests
pub type UtxoSet = HashMap<OutPoint, UTXO>;

/// Validation result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    Invalid(String),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }
}
