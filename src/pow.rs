//! Proof-of-work targets and chain work
//!
//! Targets travel in the 32-bit "compact" form carried by headers; all
//! arithmetic on them uses 256-bit integers.

use primitive_types::{U256, U512};

use crate::types::*;

/// Cumulative proof-of-work from genesis
pub type ChainWork = U256;

/// ExpandTarget: compact bits → 256-bit target
///
/// Mirrors the reference `SetCompact`:
/// 1. size = bits >> 24, mantissa = bits & 0x007fffff
/// 2. size ≤ 3 shifts the mantissa right, larger sizes shift it left
/// 3. A set sign bit (0x00800000) with a non-zero mantissa is negative
/// 4. Mantissas that cannot fit in 256 bits overflow
///
/// Negative or overflowing encodings return `None`.
pub fn expand_target(bits: u32) -> Option<U256> {
    let size = bits >> 24;
    let mut mantissa = bits & 0x007f_ffff;

    let negative = mantissa != 0 && (bits & 0x0080_0000) != 0;
    let overflow = mantissa != 0
        && (size > 34 || (mantissa > 0xff && size > 33) || (mantissa > 0xffff && size > 32));
    if negative || overflow {
        return None;
    }

    if size <= 3 {
        mantissa >>= 8 * (3 - size);
        Some(U256::from(mantissa))
    } else {
        Some(U256::from(mantissa) << (8 * (size - 3)) as usize)
    }
}

/// CompressTarget: 256-bit target → compact bits (reference `GetCompact`)
pub fn compress_target(target: U256) -> u32 {
    let mut size = (target.bits() as u32 + 7) / 8;
    let mut compact = (if size <= 3 {
        target.low_u64() << (8 * (3 - size))
    } else {
        (target >> (8 * (size - 3)) as usize).low_u64()
    }) as u32;

    // The sign bit may not be set in a positive number
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | (size << 24)
}

/// Interpret a block hash as the little-endian number compared against targets
pub fn hash_to_u256(hash: &Hash) -> U256 {
    U256::from_little_endian(hash)
}

/// CheckProofOfWork: the header's own target must be valid and within the
/// network limit, and its hash must not exceed that target.
pub fn check_proof_of_work(header: &BlockHeader, pow_limit_bits: u32) -> bool {
    let target = match expand_target(header.bits) {
        Some(target) if !target.is_zero() => target,
        _ => return false,
    };
    let limit = match expand_target(pow_limit_bits) {
        Some(limit) => limit,
        None => return false,
    };
    if target > limit {
        return false;
    }
    hash_to_u256(&header.hash()) <= target
}

/// BlockWork: expected number of hashes needed to meet `bits`
///
/// work = 2^256 / (target + 1), computed as (~target / (target + 1)) + 1 so it
/// fits in 256 bits.
pub fn block_work(bits: u32) -> ChainWork {
    match expand_target(bits) {
        Some(target) if !target.is_zero() => (!target / (target + U256::one())) + U256::one(),
        _ => U256::zero(),
    }
}

/// Multiply then divide without losing the high bits of the product.
/// Returns `None` if the quotient does not fit in 256 bits or `divisor` is zero.
pub fn mul_div(value: U256, multiplier: u64, divisor: u64) -> Option<U256> {
    if divisor == 0 {
        return None;
    }
    let product: U512 = value.full_mul(U256::from(multiplier));
    let quotient = product / U512::from(divisor);
    u512_to_u256(quotient)
}

fn u512_to_u256(value: U512) -> Option<U256> {
    let mut bytes = [0u8; 64];
    value.to_little_endian(&mut bytes);
    if bytes[32..].iter().any(|byte| *byte != 0) {
        return None;
    }
    Some(U256::from_little_endian(&bytes[..32]))
}
