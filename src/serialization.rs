//! Wire format encoding, hashing and merkle roots
//!
//! Byte layouts follow the network protocol exactly: every hash that identifies
//! a header or transaction is computed over these encodings.

use sha2::{Digest, Sha256};

use crate::constants::BLOCK_HEADER_SIZE;
use crate::error::{ConsensusError, Result};
use crate::types::*;

/// SHA-256 applied twice
pub fn double_sha256(data: &[u8]) -> Hash {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&second);
    hash
}

/// Encode a CompactSize integer
///
/// - value < 0xfd: single byte
/// - value <= 0xffff: 0xfd + u16
/// - value <= 0xffffffff: 0xfe + u32
/// - otherwise: 0xff + u64
pub fn encode_varint(value: u64, out: &mut Vec<u8>) {
    if value < 0xfd {
        out.push(value as u8);
    } else if value <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(value as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&value.to_le_bytes());
    }
}

pub fn serialize_header(header: &BlockHeader) -> Vec<u8> {
    let mut out = Vec::with_capacity(BLOCK_HEADER_SIZE);
    out.extend_from_slice(&header.version.to_le_bytes());
    out.extend_from_slice(&header.prev_block_hash);
    out.extend_from_slice(&header.merkle_root);
    out.extend_from_slice(&header.timestamp.to_le_bytes());
    out.extend_from_slice(&header.bits.to_le_bytes());
    out.extend_from_slice(&header.nonce.to_le_bytes());
    out
}

pub fn serialize_transaction(tx: &Transaction) -> Vec<u8> {
    let mut out = Vec::new();
    write_transaction(tx, &mut out);
    out
}

fn write_transaction(tx: &Transaction, out: &mut Vec<u8>) {
    out.extend_from_slice(&tx.version.to_le_bytes());

    encode_varint(tx.inputs.len() as u64, out);
    for input in &tx.inputs {
        out.extend_from_slice(&input.prevout.hash);
        out.extend_from_slice(&input.prevout.index.to_le_bytes());
        encode_varint(input.script_sig.len() as u64, out);
        out.extend_from_slice(&input.script_sig);
        out.extend_from_slice(&input.sequence.to_le_bytes());
    }

    encode_varint(tx.outputs.len() as u64, out);
    for output in &tx.outputs {
        write_output(output, out);
    }

    out.extend_from_slice(&tx.lock_time.to_le_bytes());
}

/// Output encoding: value (8 bytes) followed by the length-prefixed script
pub fn write_output(output: &TransactionOutput, out: &mut Vec<u8>) {
    out.extend_from_slice(&output.value.to_le_bytes());
    encode_varint(output.script_pubkey.len() as u64, out);
    out.extend_from_slice(&output.script_pubkey);
}

pub fn serialize_block(block: &Block) -> Vec<u8> {
    let mut out = serialize_header(&block.header);
    encode_varint(block.transactions.len() as u64, &mut out);
    for tx in &block.transactions {
        write_transaction(tx, &mut out);
    }
    out
}

pub fn transaction_size(tx: &Transaction) -> usize {
    serialize_transaction(tx).len()
}

/// Cursor over a byte slice; every read fails cleanly on truncated input
struct Reader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        let end = self
            .position
            .checked_add(count)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                ConsensusError::Serialization(format!(
                    "unexpected end of data at offset {} (wanted {} bytes)",
                    self.position, count
                ))
            })?;
        let bytes = &self.data[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(self.take(N)?);
        Ok(bytes)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn varint(&mut self) -> Result<u64> {
        let prefix = self.array::<1>()?[0];
        let value = match prefix {
            0xfd => u16::from_le_bytes(self.array()?) as u64,
            0xfe => u32::from_le_bytes(self.array()?) as u64,
            0xff => u64::from_le_bytes(self.array()?),
            small => return Ok(small as u64),
        };
        let minimal = match prefix {
            0xfd => value >= 0xfd,
            0xfe => value > 0xffff,
            _ => value > 0xffff_ffff,
        };
        if !minimal {
            return Err(ConsensusError::Serialization(
                "non-canonical CompactSize encoding".to_string(),
            ));
        }
        Ok(value)
    }

    /// Length prefix bounded by the bytes actually remaining
    fn length(&mut self, unit: usize) -> Result<usize> {
        let count = self.varint()?;
        let remaining = (self.data.len() - self.position) as u64;
        if count.saturating_mul(unit as u64) > remaining {
            return Err(ConsensusError::Serialization(format!(
                "declared length {} exceeds remaining {} bytes",
                count, remaining
            )));
        }
        Ok(count as usize)
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let length = self.length(1)?;
        Ok(self.take(length)?.to_vec())
    }

    fn finish(&self) -> Result<()> {
        if self.position != self.data.len() {
            return Err(ConsensusError::Serialization(format!(
                "{} trailing bytes",
                self.data.len() - self.position
            )));
        }
        Ok(())
    }
}

fn read_header(reader: &mut Reader<'_>) -> Result<BlockHeader> {
    Ok(BlockHeader {
        version: i32::from_le_bytes(reader.array()?),
        prev_block_hash: reader.array()?,
        merkle_root: reader.array()?,
        timestamp: reader.u32()?,
        bits: reader.u32()?,
        nonce: reader.u32()?,
    })
}

fn read_transaction(reader: &mut Reader<'_>) -> Result<Transaction> {
    let version = reader.u32()?;

    // An input is at least 41 bytes, an output at least 9
    let input_count = reader.length(41)?;
    let mut inputs = Vec::with_capacity(input_count);
    for _ in 0..input_count {
        let hash = reader.array()?;
        let index = reader.u32()?;
        let script_sig = reader.bytes()?;
        let sequence = reader.u32()?;
        inputs.push(TransactionInput {
            prevout: OutPoint { hash, index },
            script_sig,
            sequence,
        });
    }

    let output_count = reader.length(9)?;
    let mut outputs = Vec::with_capacity(output_count);
    for _ in 0..output_count {
        let value = i64::from_le_bytes(reader.array()?);
        let script_pubkey = reader.bytes()?;
        outputs.push(TransactionOutput { value, script_pubkey });
    }

    let lock_time = reader.u32()?;
    Ok(Transaction {
        version,
        inputs,
        outputs,
        lock_time,
    })
}

pub fn deserialize_header(data: &[u8]) -> Result<BlockHeader> {
    let mut reader = Reader::new(data);
    let header = read_header(&mut reader)?;
    reader.finish()?;
    Ok(header)
}

pub fn deserialize_transaction(data: &[u8]) -> Result<Transaction> {
    let mut reader = Reader::new(data);
    let tx = read_transaction(&mut reader)?;
    reader.finish()?;
    Ok(tx)
}

pub fn deserialize_block(data: &[u8]) -> Result<Block> {
    let mut reader = Reader::new(data);
    let header = read_header(&mut reader)?;
    let count = reader.length(60)?;
    let mut transactions = Vec::with_capacity(count);
    for _ in 0..count {
        transactions.push(read_transaction(&mut reader)?);
    }
    reader.finish()?;
    Ok(Block { header, transactions })
}

/// Merkle root of the given leaves plus a mutation flag
///
/// Odd levels duplicate their last node. The flag is set when two adjacent
/// nodes at any level are identical, which lets a second transaction list
/// produce the same root; such bodies must be rejected without blaming the
/// header.
pub fn merkle_root(leaves: &[Hash]) -> (Hash, bool) {
    if leaves.is_empty() {
        return ([0u8; 32], false);
    }

    let mut mutated = false;
    let mut level: Vec<Hash> = leaves.to_vec();
    while level.len() > 1 {
        for pair in level.chunks(2) {
            if pair.len() == 2 && pair[0] == pair[1] {
                mutated = true;
            }
        }
        level = level
            .chunks(2)
            .map(|pair| {
                let right = pair.get(1).unwrap_or(&pair[0]);
                let mut concatenated = [0u8; 64];
                concatenated[..32].copy_from_slice(&pair[0]);
                concatenated[32..].copy_from_slice(right);
                double_sha256(&concatenated)
            })
            .collect();
    }
    (level[0], mutated)
}

/// Merkle root over a block's transaction hashes
pub fn block_merkle_root(block: &Block) -> (Hash, bool) {
    let leaves: Vec<Hash> = block.transactions.iter().map(|tx| tx.hash()).collect();
    merkle_root(&leaves)
}
