//! Transaction validation
//!
//! [`check_transaction`] covers the context-free rules. [`TransactionValidator`]
//! checks one transaction of a block against the outputs it spends, as resolved
//! by a [`BlockOutputs`] view.

use std::collections::{HashMap, HashSet};

use crate::config::ChainParams;
use crate::constants::*;
use crate::context::{MedianTimeLookup, OutputLookup};
use crate::error::{ConsensusError, Result};
use crate::script::{ScriptContext, ScriptRunner};
use crate::serialization::transaction_size;
use crate::types::*;

/// CheckTransaction
///
/// A transaction is structurally valid if and only if:
/// 1. It has at least one input and one output
/// 2. Every output value and the running output total lie in [0, MAX_MONEY]
/// 3. Its serialized size does not exceed MAX_TX_SIZE
/// 4. No outpoint is spent twice
/// 5. A coinbase carries a 2..=100 byte unlocking script; other transactions
///    never reference the null outpoint
pub fn check_transaction(tx: &Transaction) -> Result<ValidationResult> {
    if tx.inputs.is_empty() || tx.outputs.is_empty() {
        return Ok(ValidationResult::Invalid("Empty inputs or outputs".to_string()));
    }

    let mut total: Integer = 0;
    for (i, output) in tx.outputs.iter().enumerate() {
        if output.value < 0 || output.value > MAX_MONEY {
            return Ok(ValidationResult::Invalid(format!(
                "Invalid output value {} at index {}",
                output.value, i
            )));
        }
        total += output.value;
        if total > MAX_MONEY {
            return Ok(ValidationResult::Invalid("Total output value out of range".to_string()));
        }
    }

    let size = transaction_size(tx);
    if size > MAX_TX_SIZE {
        return Ok(ValidationResult::Invalid(format!("Transaction too large: {} bytes", size)));
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    if !tx.inputs.iter().all(|input| seen.insert(input.prevout)) {
        return Ok(ValidationResult::Invalid("Duplicate inputs".to_string()));
    }

    if tx.is_coinbase() {
        let length = tx.inputs[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT_SIZE..=MAX_COINBASE_SCRIPT_SIZE).contains(&length) {
            return Ok(ValidationResult::Invalid(format!(
                "Coinbase script length {} out of range",
                length
            )));
        }
    } else if tx.inputs.iter().any(|input| input.prevout.is_null()) {
        return Ok(ValidationResult::Invalid("Null prevout in non-coinbase transaction".to_string()));
    }

    Ok(ValidationResult::Valid)
}

/// IsFinalTx: lock times below the threshold are heights, others are times
pub fn is_final(tx: &Transaction, height: Natural, cutoff_time: u32) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let limit = if tx.lock_time < LOCKTIME_THRESHOLD {
        height
    } else {
        cutoff_time as Natural
    };
    if (tx.lock_time as Natural) < limit {
        return true;
    }
    tx.inputs.iter().all(|input| input.sequence == SEQUENCE_FINAL)
}

/// Outputs visible to the transactions of one block: those created earlier in
/// the block (or anywhere in it once canonical ordering is active) ahead of the
/// underlying view.
pub struct BlockOutputs<'a, L: OutputLookup + ?Sized> {
    base: &'a L,
    created: HashMap<OutPoint, (usize, UTXO)>,
    any_order: bool,
}

impl<'a, L: OutputLookup + ?Sized> BlockOutputs<'a, L> {
    pub fn new(base: &'a L, block: &Block, height: Natural, any_order: bool) -> Self {
        let mut created = HashMap::new();
        for (index, tx) in block.transactions.iter().enumerate() {
            let hash = tx.hash();
            let is_coinbase = index == 0 && tx.is_coinbase();
            for (output_index, output) in tx.outputs.iter().enumerate() {
                created.insert(
                    OutPoint::new(hash, output_index as u32),
                    (
                        index,
                        UTXO {
                            value: output.value,
                            script_pubkey: output.script_pubkey.clone(),
                            height,
                            is_coinbase,
                        },
                    ),
                );
            }
        }
        Self {
            base,
            created,
            any_order,
        }
    }

    /// Resolve `outpoint` as seen by the transaction at `spender` in the block
    pub fn resolve(&self, outpoint: &OutPoint, spender: usize) -> Result<Option<UTXO>> {
        if let Some((creator, utxo)) = self.created.get(outpoint) {
            if *creator < spender || (self.any_order && *creator != spender) {
                return Ok(Some(utxo.clone()));
            }
            return Ok(None);
        }
        self.base.lookup(outpoint)
    }
}

/// Validates the transactions of one candidate block
pub struct TransactionValidator<'a, L: OutputLookup + ?Sized, M: MedianTimeLookup + ?Sized> {
    params: &'a ChainParams,
    outputs: &'a BlockOutputs<'a, L>,
    median_times: &'a M,
    block_height: Natural,
    block_timestamp: u32,
    /// Median time past of the block's parent
    median_time_past: u32,
}

impl<'a, L, M> TransactionValidator<'a, L, M>
where
    L: OutputLookup + ?Sized,
    M: MedianTimeLookup + ?Sized,
{
    pub fn new(
        params: &'a ChainParams,
        outputs: &'a BlockOutputs<'a, L>,
        median_times: &'a M,
        block_height: Natural,
        block_timestamp: u32,
        median_time_past: u32,
    ) -> Self {
        Self {
            params,
            outputs,
            median_times,
            block_height,
            block_timestamp,
            median_time_past,
        }
    }

    /// Validate the transaction at position `index` of the block
    ///
    /// 1. Structural checks and lock-time finality
    /// 2. Coinbase transactions stop here; their value is checked per block
    /// 3. Every input resolves to an unspent, mature output
    /// 4. Outputs do not exceed inputs
    /// 5. Relative lock times (BIP68) hold
    /// 6. Every input's scripts verify
    ///
    /// Returns the verdict with the fee paid (zero for coinbase and invalid
    /// transactions). `Err` is reserved for lookup failures.
    pub fn validate(&self, index: usize, tx: &Transaction) -> Result<(ValidationResult, Integer)> {
        let verdict = self.check(index, tx)?;
        Ok(match verdict {
            Ok(fee) => (ValidationResult::Valid, fee),
            Err(reason) => (ValidationResult::Invalid(reason), 0),
        })
    }

    fn check(&self, index: usize, tx: &Transaction) -> Result<std::result::Result<Integer, String>> {
        if let ValidationResult::Invalid(reason) = check_transaction(tx)? {
            return Ok(Err(reason));
        }

        let is_coinbase = tx.is_coinbase();
        if is_coinbase != (index == 0) {
            return Ok(Err(if is_coinbase {
                "Coinbase transaction outside the first position".to_string()
            } else {
                "First transaction is not a coinbase".to_string()
            }));
        }

        let cutoff = if self.params.is_csv_active(self.block_height) {
            self.median_time_past
        } else {
            self.block_timestamp
        };
        if !is_final(tx, self.block_height, cutoff) {
            return Ok(Err("Transaction is not final".to_string()));
        }

        if is_coinbase {
            return Ok(Ok(0));
        }

        let mut spent = Vec::with_capacity(tx.inputs.len());
        let mut total_in: Integer = 0;
        for (i, input) in tx.inputs.iter().enumerate() {
            let Some(utxo) = self.outputs.resolve(&input.prevout, index)? else {
                return Ok(Err(format!(
                    "Input {} spends missing or spent output {}",
                    i, input.prevout
                )));
            };
            if utxo.is_coinbase && self.block_height.saturating_sub(utxo.height) < self.params.coinbase_maturity {
                return Ok(Err(format!(
                    "Input {} spends immature coinbase output from height {}",
                    i, utxo.height
                )));
            }
            if utxo.value < 0 || utxo.value > MAX_MONEY {
                return Ok(Err(format!("Input {} value out of range", i)));
            }
            total_in += utxo.value;
            if total_in > MAX_MONEY {
                return Ok(Err("Total input value out of range".to_string()));
            }
            spent.push(utxo);
        }

        let total_out = tx.total_output_value().unwrap_or(Integer::MAX);
        if total_out > total_in {
            return Ok(Err(format!(
                "Outputs {} exceed inputs {}",
                total_out, total_in
            )));
        }

        if !self.check_sequence_locks(tx, &spent)? {
            return Ok(Err("Sequence locks not satisfied".to_string()));
        }

        let runner = ScriptRunner::new(self.params);
        for (i, (input, utxo)) in tx.inputs.iter().zip(&spent).enumerate() {
            let context = ScriptContext {
                transaction: tx,
                input_index: i,
                amount: utxo.value,
                block_height: self.block_height,
                median_time_past: self.median_time_past,
            };
            if let Err(error) = runner.verify(&utxo.script_pubkey, &input.script_sig, &context) {
                return Ok(Err(format!("Input {} script failed: {}", i, error)));
            }
        }

        Ok(Ok(total_in - total_out))
    }

    /// BIP68: each enabled input waits a number of blocks or 512-second units
    /// after the block that created the output it spends.
    fn check_sequence_locks(&self, tx: &Transaction, spent: &[UTXO]) -> Result<bool> {
        if !self.params.is_csv_active(self.block_height) || tx.version < 2 {
            return Ok(true);
        }

        let mut min_height: i64 = -1;
        let mut min_time: i64 = -1;
        for (input, utxo) in tx.inputs.iter().zip(spent) {
            if input.sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG != 0 {
                continue;
            }
            let value = (input.sequence & SEQUENCE_LOCKTIME_MASK) as i64;
            if input.sequence & SEQUENCE_LOCKTIME_TYPE_FLAG != 0 {
                let coin_time = self.median_time_at(utxo.height.saturating_sub(1))?;
                min_time = min_time.max(coin_time as i64 + (value << SEQUENCE_LOCKTIME_GRANULARITY) - 1);
            } else {
                min_height = min_height.max(utxo.height as i64 + value - 1);
            }
        }

        Ok(min_height < self.block_height as i64 && min_time < self.median_time_past as i64)
    }

    fn median_time_at(&self, height: Natural) -> Result<u32> {
        // Outputs created in this block belong to a height the context does not cover yet
        if height + 1 >= self.block_height {
            return Ok(self.median_time_past);
        }
        self.median_times
            .median_time_past_at(height)?
            .ok_or_else(|| ConsensusError::MissingData(format!("median time past at height {}", height)))
    }
}
