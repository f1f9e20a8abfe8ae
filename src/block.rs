//! Block validation
//!
//! Three gates, in the order the processor applies them:
//! 1. [`check_block_header`]: proof of work, required difficulty, timestamps,
//!    version; [`check_block_time`] separately bounds the timestamp against
//!    the local clock
//! 2. [`check_block_body`]: context-free structure of the transaction list
//! 3. [`validate_block_transactions`]: every transaction against the UTXO view,
//!    fanned out over a worker pool, plus the coinbase value bound

use log::debug;
use rayon::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::ChainParams;
use crate::context::{ChainWorkLookup, HeaderLookup, MedianTimeLookup, OutputLookup};
use crate::difficulty::DifficultyCalculator;
use crate::economic::max_coinbase_value;
use crate::error::{ConsensusError, Result};
use crate::pow::check_proof_of_work;
use crate::script::parser::push_number;
use crate::serialization::{block_merkle_root, serialize_block};
use crate::transaction::{BlockOutputs, TransactionValidator};
use crate::types::*;

/// Blocks that overwrote an unspent coinbase before BIP30 was enforced
const BIP30_EXCEPTIONS: [(Natural, &str); 2] = [
    (91_842, "00000000000a4d0a398161ffc163c503763b1f4360639393e0e4c8e300e0caec"),
    (91_880, "00000000000743f190a18c5577a3c2d2a1f610ae9601ac046a38084ccb7cd721"),
];

/// Outcome of validating a block's transactions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockValidation {
    pub result: ValidationResult,
    /// Hashes of the offending transactions, in block order
    pub invalid_transactions: Vec<Hash>,
    /// Sum of the fees of all non-coinbase transactions
    pub fees: Integer,
}

impl BlockValidation {
    fn invalid(reason: String, invalid_transactions: Vec<Hash>) -> Self {
        Self {
            result: ValidationResult::Invalid(reason),
            invalid_transactions,
            fees: 0,
        }
    }
}

/// CheckBlockHeader
///
/// `context` covers the branch ending at the header's parent; `height` is the
/// height the header would occupy.
///
/// 1. A genesis candidate must match the network's genesis hash, if one is set
/// 2. The hash must satisfy the header's own target, within the network limit
/// 3. `bits` must equal the difficulty calculator's result
/// 4. The timestamp must exceed the parent's median time past
/// 5. Versions below 2, 3 and 4 are obsolete after BIP34, BIP66 and BIP65
///
/// Every check here depends only on the chain, so a failure is final.
pub fn check_block_header<C>(
    params: &ChainParams,
    header: &BlockHeader,
    height: Natural,
    context: &C,
) -> Result<ValidationResult>
where
    C: HeaderLookup + ChainWorkLookup + MedianTimeLookup,
{
    if height == 0 {
        if let Some(genesis) = params.genesis_hash {
            if header.hash() != genesis {
                return Ok(ValidationResult::Invalid("Unexpected genesis block".to_string()));
            }
        }
    }

    if !check_proof_of_work(header, params.pow_limit_bits) {
        return Ok(ValidationResult::Invalid("Proof of work does not meet target".to_string()));
    }

    let required = DifficultyCalculator::new(params, context).required_bits(height)?;
    if header.bits != required {
        return Ok(ValidationResult::Invalid(format!(
            "Incorrect difficulty {:#010x}, expected {:#010x}",
            header.bits, required
        )));
    }

    if height > 0 {
        let Some(median_time_past) = context.median_time_past_at(height - 1)? else {
            return Err(ConsensusError::MissingData(format!(
                "median time past at height {}",
                height - 1
            )));
        };
        if header.timestamp <= median_time_past {
            return Ok(ValidationResult::Invalid(format!(
                "Timestamp {} not after median time past {}",
                header.timestamp, median_time_past
            )));
        }
    }

    let minimum_version = if params.is_bip65_active(height) {
        4
    } else if params.is_bip66_active(height) {
        3
    } else if params.is_bip34_active(height) {
        2
    } else {
        1
    };
    if header.version < minimum_version {
        return Ok(ValidationResult::Invalid(format!(
            "Obsolete block version {}",
            header.version
        )));
    }

    Ok(ValidationResult::Valid)
}

/// The timestamp must not run more than `max_future_time` ahead of network time
///
/// Depends on the local clock: a header failing it may pass later.
pub fn check_block_time(header: &BlockHeader, network_time: u64, max_future_time: u64) -> ValidationResult {
    if header.timestamp as u64 > network_time.saturating_add(max_future_time) {
        return ValidationResult::Invalid(format!("Timestamp {} too far in the future", header.timestamp));
    }
    ValidationResult::Valid
}

/// The header commits to this transaction list, and the list is not a
/// duplicate-subtree malleation of another one
pub fn check_merkle_root(block: &Block) -> bool {
    let (root, mutated) = block_merkle_root(block);
    !mutated && root == block.header.merkle_root
}

/// CheckBlockBody
///
/// 1. At least one transaction, within the size limit
/// 2. A coinbase first and nowhere else
/// 3. After BIP34 the coinbase script starts with the block height
/// 4. No transaction appears twice
/// 5. After canonical ordering activates, non-coinbase transactions are
///    sorted by strictly ascending hash
pub fn check_block_body(params: &ChainParams, block: &Block, height: Natural) -> Result<ValidationResult> {
    let Some(coinbase) = block.coinbase() else {
        return Ok(ValidationResult::Invalid("Block has no transactions".to_string()));
    };

    let size = serialize_block(block).len();
    if size > params.max_block_size(height) {
        return Ok(ValidationResult::Invalid(format!("Block too large: {} bytes", size)));
    }

    if !coinbase.is_coinbase() {
        return Ok(ValidationResult::Invalid("First transaction is not a coinbase".to_string()));
    }
    if block.transactions[1..].iter().any(Transaction::is_coinbase) {
        return Ok(ValidationResult::Invalid("More than one coinbase".to_string()));
    }

    if params.is_bip34_active(height) {
        let prefix = push_number(height as i64);
        if !coinbase.inputs[0].script_sig.starts_with(&prefix) {
            return Ok(ValidationResult::Invalid("Coinbase does not commit to block height".to_string()));
        }
    }

    let hashes: Vec<Hash> = block.transactions.iter().map(Transaction::hash).collect();
    let mut seen = HashSet::with_capacity(hashes.len());
    if !hashes.iter().all(|hash| seen.insert(*hash)) {
        return Ok(ValidationResult::Invalid("Duplicate transaction".to_string()));
    }

    if params.is_magnetic_anomaly_active(height) && hashes.len() > 2 {
        if let Some(position) = hashes[1..].windows(2).position(|pair| pair[0] >= pair[1]) {
            return Ok(ValidationResult::Invalid(format!(
                "Transaction {} breaks canonical ordering",
                hash_to_hex(&hashes[position + 2])
            )));
        }
    }

    Ok(ValidationResult::Valid)
}

/// Validate every transaction of `block` against `view`, the UTXO state of its
/// parent
///
/// 1. No created output overwrites an unspent one (BIP30)
/// 2. No outpoint is spent by two transactions of the block
/// 3. Transactions are validated in parallel on `pool`; the first failure
///    raises a shared flag so workers skip what they have not started
/// 4. If anything failed, the block is re-validated sequentially so every
///    failing transaction is reported, independent of scheduling
/// 5. The coinbase may claim at most subsidy plus fees
pub fn validate_block_transactions<L, M>(
    params: &ChainParams,
    block: &Block,
    height: Natural,
    view: &L,
    median_times: &M,
    pool: &rayon::ThreadPool,
    median_time_past: u32,
) -> Result<BlockValidation>
where
    L: OutputLookup + ?Sized,
    M: MedianTimeLookup + Sync + ?Sized,
{
    let block_hash = block.hash();
    if !is_bip30_exception(height, &block_hash) {
        for tx in &block.transactions {
            let tx_hash = tx.hash();
            for index in 0..tx.outputs.len() {
                if view.lookup(&OutPoint::new(tx_hash, index as u32))?.is_some() {
                    return Ok(BlockValidation::invalid(
                        format!("Transaction {} overwrites an unspent output", hash_to_hex(&tx_hash)),
                        vec![tx_hash],
                    ));
                }
            }
        }
    }

    let mut spent = HashSet::new();
    for tx in block.transactions.iter().skip(1) {
        if let Some(input) = tx.inputs.iter().find(|input| !spent.insert(input.prevout)) {
            let tx_hash = tx.hash();
            return Ok(BlockValidation::invalid(
                format!("Output {} spent twice in block", input.prevout),
                vec![tx_hash],
            ));
        }
    }

    let outputs = BlockOutputs::new(view, block, height, params.is_magnetic_anomaly_active(height));
    let validator = TransactionValidator::new(
        params,
        &outputs,
        median_times,
        height,
        block.header.timestamp,
        median_time_past,
    );

    let failed = AtomicBool::new(false);
    let verdicts: Vec<Option<(ValidationResult, Integer)>> = pool.install(|| {
        block
            .transactions
            .par_iter()
            .enumerate()
            .map(|(index, tx)| {
                if failed.load(Ordering::Relaxed) {
                    return Ok(None);
                }
                let verdict = validator.validate(index, tx)?;
                if !verdict.0.is_valid() {
                    failed.store(true, Ordering::Relaxed);
                }
                Ok(Some(verdict))
            })
            .collect::<Result<Vec<_>>>()
    })?;

    if failed.load(Ordering::Relaxed) {
        let mut invalid_transactions = Vec::new();
        let mut first_reason = None;
        for (index, tx) in block.transactions.iter().enumerate() {
            if let (ValidationResult::Invalid(reason), _) = validator.validate(index, tx)? {
                let tx_hash = tx.hash();
                first_reason.get_or_insert_with(|| format!("Transaction {}: {}", hash_to_hex(&tx_hash), reason));
                invalid_transactions.push(tx_hash);
            }
        }
        debug!(
            "Block {} has {} invalid transactions",
            hash_to_hex(&block_hash),
            invalid_transactions.len()
        );
        let reason = first_reason.unwrap_or_else(|| "Invalid transaction".to_string());
        return Ok(BlockValidation::invalid(reason, invalid_transactions));
    }

    let mut fees: Integer = 0;
    for (_, fee) in verdicts.into_iter().flatten() {
        fees = fees.saturating_add(fee);
    }

    let claimed = block
        .coinbase()
        .and_then(Transaction::total_output_value)
        .unwrap_or(Integer::MAX);
    let allowed = max_coinbase_value(height, params.subsidy_halving_interval, fees);
    if claimed > allowed {
        let coinbase_hash = block.transactions[0].hash();
        return Ok(BlockValidation {
            result: ValidationResult::Invalid(format!(
                "Coinbase claims {} but at most {} is allowed",
                claimed, allowed
            )),
            invalid_transactions: vec![coinbase_hash],
            fees,
        });
    }

    Ok(BlockValidation {
        result: ValidationResult::Valid,
        invalid_transactions: Vec::new(),
        fees,
    })
}

fn is_bip30_exception(height: Natural, hash: &Hash) -> bool {
    BIP30_EXCEPTIONS
        .iter()
        .any(|(exception_height, exception_hash)| *exception_height == height && hash_to_hex(hash) == *exception_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainSegments;
    use crate::constants::*;
    use crate::context::ChainContext;
    use crate::serialization::merkle_root;

    const OP_TRUE: u8 = 0x51;

    fn pool() -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap()
    }

    fn coinbase(height: Natural, value: Integer) -> Transaction {
        let mut script_sig = push_number(height as i64);
        script_sig.extend_from_slice(&[0x00, 0x00]);
        Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                prevout: OutPoint::COINBASE,
                script_sig,
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![TransactionOutput {
                value,
                script_pubkey: vec![OP_TRUE],
            }],
            lock_time: 0,
        }
    }

    fn spend(prevout: OutPoint, value: Integer) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                prevout,
                script_sig: Vec::new(),
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![TransactionOutput {
                value,
                script_pubkey: vec![OP_TRUE],
            }],
            lock_time: 0,
        }
    }

    fn block(transactions: Vec<Transaction>) -> Block {
        let leaves: Vec<Hash> = transactions.iter().map(Transaction::hash).collect();
        Block {
            header: BlockHeader {
                version: 4,
                prev_block_hash: [1; 32],
                merkle_root: merkle_root(&leaves).0,
                timestamp: 1_600_000_000,
                bits: 0x207fffff,
                nonce: 0,
            },
            transactions,
        }
    }

    fn funded(count: u32) -> UtxoSet {
        (0..count)
            .map(|i| {
                (
                    OutPoint::new([9; 32], i),
                    UTXO {
                        value: 1_000,
                        script_pubkey: vec![OP_TRUE],
                        height: 1,
                        is_coinbase: false,
                    },
                )
            })
            .collect()
    }

    fn sorted(mut transactions: Vec<Transaction>) -> Vec<Transaction> {
        transactions.sort_by_key(Transaction::hash);
        transactions
    }

    fn mine(mut header: BlockHeader) -> BlockHeader {
        while !check_proof_of_work(&header, header.bits) {
            header.nonce += 1;
        }
        header
    }

    #[test]
    fn test_body_requires_coinbase_first() {
        let params = ChainParams::regtest();
        let empty = block(Vec::new());
        assert!(!check_block_body(&params, &empty, 5).unwrap().is_valid());

        let misplaced = block(vec![spend(OutPoint::new([9; 32], 0), 1), coinbase(5, 1)]);
        assert_eq!(
            check_block_body(&params, &misplaced, 5).unwrap(),
            ValidationResult::Invalid("First transaction is not a coinbase".to_string())
        );

        let doubled = block(vec![coinbase(5, 1), coinbase(5, 2)]);
        assert!(!check_block_body(&params, &doubled, 5).unwrap().is_valid());
    }

    #[test]
    fn test_body_requires_height_in_coinbase() {
        let params = ChainParams::regtest();
        let candidate = block(vec![coinbase(6, 1)]);
        assert!(check_block_body(&params, &candidate, 6).unwrap().is_valid());
        assert_eq!(
            check_block_body(&params, &candidate, 7).unwrap(),
            ValidationResult::Invalid("Coinbase does not commit to block height".to_string())
        );
    }

    #[test]
    fn test_body_rejects_duplicates_and_bad_order() {
        let params = ChainParams::regtest();
        let a = spend(OutPoint::new([9; 32], 0), 1);
        let b = spend(OutPoint::new([9; 32], 1), 1);

        let duplicate = block(vec![coinbase(3, 1), a.clone(), a.clone()]);
        assert_eq!(
            check_block_body(&params, &duplicate, 3).unwrap(),
            ValidationResult::Invalid("Duplicate transaction".to_string())
        );

        let mut order = sorted(vec![a, b]);
        let mut transactions = vec![coinbase(3, 1)];
        transactions.extend(order.clone());
        assert!(check_block_body(&params, &block(transactions), 3).unwrap().is_valid());

        order.reverse();
        let mut transactions = vec![coinbase(3, 1)];
        transactions.extend(order);
        assert!(!check_block_body(&params, &block(transactions.clone()), 3).unwrap().is_valid());

        let mut legacy = ChainParams::regtest();
        legacy.magnetic_anomaly_height = 1_000;
        assert!(check_block_body(&legacy, &block(transactions), 3).unwrap().is_valid());
    }

    #[test]
    fn test_merkle_root_check() {
        let mut candidate = block(vec![coinbase(1, 1), spend(OutPoint::new([9; 32], 0), 1)]);
        assert!(check_merkle_root(&candidate));
        candidate.header.merkle_root = [0; 32];
        assert!(!check_merkle_root(&candidate));

        let a = spend(OutPoint::new([9; 32], 0), 1);
        let b = spend(OutPoint::new([9; 32], 1), 1);
        let mut mutated = block(vec![coinbase(1, 1), a, b.clone(), b]);
        let leaves: Vec<Hash> = mutated.transactions.iter().map(Transaction::hash).collect();
        mutated.header.merkle_root = merkle_root(&leaves).0;
        assert!(!check_merkle_root(&mutated));
    }

    #[test]
    fn test_transactions_valid_with_fees() {
        let params = ChainParams::regtest();
        let view = funded(2);
        let chain = ChainSegments::new();
        let context = ChainContext::new(&chain, None);
        let spends = sorted(vec![
            spend(OutPoint::new([9; 32], 0), 900),
            spend(OutPoint::new([9; 32], 1), 800),
        ]);
        let mut transactions = vec![coinbase(10, INITIAL_SUBSIDY + 300)];
        transactions.extend(spends);

        let result =
            validate_block_transactions(&params, &block(transactions), 10, &view, &context, &pool(), 0).unwrap();
        assert!(result.result.is_valid());
        assert_eq!(result.fees, 300);
        assert!(result.invalid_transactions.is_empty());
    }

    #[test]
    fn test_coinbase_overclaim_rejected() {
        let params = ChainParams::regtest();
        let view = funded(1);
        let chain = ChainSegments::new();
        let context = ChainContext::new(&chain, None);
        let transactions = vec![coinbase(10, INITIAL_SUBSIDY + 101), spend(OutPoint::new([9; 32], 0), 900)];

        let result =
            validate_block_transactions(&params, &block(transactions.clone()), 10, &view, &context, &pool(), 0)
                .unwrap();
        assert!(!result.result.is_valid());
        assert_eq!(result.invalid_transactions, vec![transactions[0].hash()]);
    }

    #[test]
    fn test_every_invalid_transaction_reported() {
        let params = ChainParams::regtest();
        let view = funded(3);
        let chain = ChainSegments::new();
        let context = ChainContext::new(&chain, None);
        let good = spend(OutPoint::new([9; 32], 0), 900);
        let missing = spend(OutPoint::new([8; 32], 0), 900);
        let overspend = spend(OutPoint::new([9; 32], 2), 5_000);
        let mut transactions = vec![coinbase(10, 1)];
        transactions.extend(sorted(vec![good, missing.clone(), overspend.clone()]));
        let candidate = block(transactions);

        let mut expected: Vec<Hash> = vec![missing.hash(), overspend.hash()];
        expected.sort();

        for _ in 0..3 {
            let result =
                validate_block_transactions(&params, &candidate, 10, &view, &context, &pool(), 0).unwrap();
            assert!(!result.result.is_valid());
            assert_eq!(result.invalid_transactions, expected);
        }
    }

    #[test]
    fn test_double_spend_within_block_rejected() {
        let params = ChainParams::regtest();
        let view = funded(1);
        let chain = ChainSegments::new();
        let context = ChainContext::new(&chain, None);
        let first = spend(OutPoint::new([9; 32], 0), 900);
        let second = spend(OutPoint::new([9; 32], 0), 800);
        let ordered = sorted(vec![first, second]);
        let mut transactions = vec![coinbase(10, 1)];
        transactions.extend(ordered.clone());

        let result =
            validate_block_transactions(&params, &block(transactions), 10, &view, &context, &pool(), 0).unwrap();
        assert!(!result.result.is_valid());
        assert_eq!(result.invalid_transactions, vec![ordered[1].hash()]);
    }

    #[test]
    fn test_bip30_overwrite_rejected() {
        let params = ChainParams::regtest();
        let cb = coinbase(10, 1);
        let mut view = UtxoSet::new();
        view.insert(
            OutPoint::new(cb.hash(), 0),
            UTXO {
                value: 1,
                script_pubkey: vec![OP_TRUE],
                height: 2,
                is_coinbase: true,
            },
        );
        let chain = ChainSegments::new();
        let context = ChainContext::new(&chain, None);
        let result =
            validate_block_transactions(&params, &block(vec![cb.clone()]), 10, &view, &context, &pool(), 0).unwrap();
        assert!(!result.result.is_valid());
        assert_eq!(result.invalid_transactions, vec![cb.hash()]);
    }

    #[test]
    fn test_header_checks() {
        let params = ChainParams::regtest();
        let mut chain = ChainSegments::new();
        let genesis = mine(BlockHeader {
            version: 1,
            prev_block_hash: [0; 32],
            merkle_root: [0; 32],
            timestamp: 1_600_000_000,
            bits: params.pow_limit_bits,
            nonce: 0,
        });
        let genesis_hash = chain.insert(genesis, true).unwrap().hash;
        let context = ChainContext::new(&chain, Some(&genesis_hash));
        let now = 1_600_000_600;

        let child = mine(BlockHeader {
            version: 4,
            prev_block_hash: genesis_hash,
            merkle_root: [0; 32],
            timestamp: 1_600_000_001,
            bits: params.pow_limit_bits,
            nonce: 0,
        });
        assert!(check_block_header(&params, &child, 1, &context).unwrap().is_valid());

        let stale = mine(BlockHeader { timestamp: 1_600_000_000, ..child.clone() });
        assert!(!check_block_header(&params, &stale, 1, &context).unwrap().is_valid());

        let future = mine(BlockHeader { timestamp: 1_600_010_000, ..child.clone() });
        assert!(check_block_header(&params, &future, 1, &context).unwrap().is_valid());
        assert!(!check_block_time(&future, now, MAX_FUTURE_BLOCK_TIME).is_valid());
        assert!(check_block_time(&future, 1_600_010_000, MAX_FUTURE_BLOCK_TIME).is_valid());
        assert!(check_block_time(&child, now, MAX_FUTURE_BLOCK_TIME).is_valid());

        let obsolete = mine(BlockHeader { version: 3, ..child.clone() });
        assert!(!check_block_header(&params, &obsolete, 1, &context).unwrap().is_valid());

        let wrong_bits = mine(BlockHeader { bits: 0x200fffff, ..child });
        assert!(!check_block_header(&params, &wrong_bits, 1, &context).unwrap().is_valid());
    }
}
