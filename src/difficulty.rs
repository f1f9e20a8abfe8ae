//! Required proof-of-work for a candidate block
//!
//! Three algorithms coexist, selected by height:
//! - classic retarget every 2016 blocks, clamped to a factor of four
//! - emergency adjustment (UAHF until DAA): loosen the target by a quarter when
//!   the last six blocks took more than twelve hours
//! - per-block adjustment (DAA) over a 144-block window of chain work

use primitive_types::U256;

use crate::config::ChainParams;
use crate::constants::*;
use crate::context::{ChainWorkLookup, HeaderLookup, MedianTimeLookup};
use crate::error::{ConsensusError, Result};
use crate::pow::{compress_target, expand_target, mul_div, ChainWork};
use crate::types::*;

pub struct DifficultyCalculator<'a, C> {
    params: &'a ChainParams,
    context: &'a C,
}

impl<'a, C> DifficultyCalculator<'a, C>
where
    C: HeaderLookup + ChainWorkLookup + MedianTimeLookup,
{
    pub fn new(params: &'a ChainParams, context: &'a C) -> Self {
        Self { params, context }
    }

    /// Compact target a block at `height` must carry
    pub fn required_bits(&self, height: Natural) -> Result<u32> {
        if height == 0 {
            return Ok(self.params.pow_limit_bits);
        }

        let previous = self.header(height - 1)?;
        if self.params.no_retargeting {
            return Ok(previous.bits);
        }

        if self.params.is_daa_active(height) {
            return self.daa_bits(height);
        }

        if height % DIFFICULTY_ADJUSTMENT_INTERVAL == 0 {
            return self.classic_retarget_bits(height, &previous);
        }

        if self.params.is_uahf_active(height) {
            return self.emergency_bits(height, &previous);
        }

        Ok(previous.bits)
    }

    /// Classic retarget
    ///
    /// 1. timespan = time(h-1) - time(h-2016), clamped to [T/4, 4T]
    /// 2. target = target(h-1) × timespan / T, capped at the network limit
    fn classic_retarget_bits(&self, height: Natural, previous: &BlockHeader) -> Result<u32> {
        let first = self.header(height - DIFFICULTY_ADJUSTMENT_INTERVAL)?;

        let actual = previous.timestamp as i64 - first.timestamp as i64;
        let minimum = TARGET_TIMESPAN as i64 / 4;
        let maximum = TARGET_TIMESPAN as i64 * 4;
        let timespan = actual.clamp(minimum, maximum) as u64;

        let target = self.target(previous.bits)?;
        let retargeted = mul_div(target, timespan, TARGET_TIMESPAN)
            .ok_or_else(|| ConsensusError::InvariantViolation("retarget overflow".to_string()))?;
        Ok(compress_target(retargeted.min(self.pow_limit()?)))
    }

    /// Emergency adjustment
    ///
    /// Keeps the parent's target unless MTP(h-1) - MTP(h-7) ≥ 12 hours, in which
    /// case the target grows by a quarter (capped at the limit).
    fn emergency_bits(&self, height: Natural, previous: &BlockHeader) -> Result<u32> {
        if previous.bits == self.params.pow_limit_bits || height < 7 {
            return Ok(previous.bits);
        }

        let tip_median = self.median_time_past(height - 1)?;
        let earlier_median = self.median_time_past(height - 7)?;
        if tip_median.saturating_sub(earlier_median) < EDA_TRIGGER_SECONDS {
            return Ok(previous.bits);
        }

        let target = self.target(previous.bits)?;
        let loosened = target.saturating_add(target >> 2);
        Ok(compress_target(loosened.min(self.pow_limit()?)))
    }

    /// Per-block adjustment
    ///
    /// 1. last = suitable block at h-1, first = suitable block at h-145
    /// 2. work = (chainwork(last) - chainwork(first)) × spacing / timespan,
    ///    timespan clamped to [72, 288] × spacing
    /// 3. target = (2^256 - work) / work, capped at the limit
    fn daa_bits(&self, height: Natural) -> Result<u32> {
        if height < DAA_WINDOW + 3 {
            return Ok(self.params.pow_limit_bits);
        }

        let last_height = self.suitable_block(height - 1)?;
        let first_height = self.suitable_block(height - 1 - DAA_WINDOW)?;

        let last_work = self.chain_work(last_height)?;
        let first_work = self.chain_work(first_height)?;
        let work_done = last_work.checked_sub(first_work).ok_or_else(|| {
            ConsensusError::InvariantViolation("chain work decreased along a branch".to_string())
        })?;

        let last_time = self.header(last_height)?.timestamp as i64;
        let first_time = self.header(first_height)?.timestamp as i64;
        let minimum = (DAA_WINDOW / 2 * TARGET_SPACING) as i64;
        let maximum = (DAA_WINDOW * 2 * TARGET_SPACING) as i64;
        let timespan = (last_time - first_time).clamp(minimum, maximum) as u64;

        let projected_work = mul_div(work_done, TARGET_SPACING, timespan)
            .ok_or_else(|| ConsensusError::InvariantViolation("work projection overflow".to_string()))?;
        if projected_work.is_zero() {
            return Ok(self.params.pow_limit_bits);
        }

        // (2^256 - w) / w == (~w + 1) / w in 256-bit arithmetic
        let target = (!projected_work).overflowing_add(U256::one()).0 / projected_work;
        Ok(compress_target(target.min(self.pow_limit()?)))
    }

    /// Height of the median-timestamp block among `height`, `height - 1`, `height - 2`
    fn suitable_block(&self, height: Natural) -> Result<Natural> {
        let mut candidates = [
            (self.header(height - 2)?.timestamp, height - 2),
            (self.header(height - 1)?.timestamp, height - 1),
            (self.header(height)?.timestamp, height),
        ];
        candidates.sort_by_key(|(timestamp, _)| *timestamp);
        Ok(candidates[1].1)
    }

    fn header(&self, height: Natural) -> Result<BlockHeader> {
        self.context
            .header_at(height)?
            .ok_or_else(|| ConsensusError::MissingData(format!("header at height {}", height)))
    }

    fn chain_work(&self, height: Natural) -> Result<ChainWork> {
        self.context
            .chain_work_at(height)?
            .ok_or_else(|| ConsensusError::MissingData(format!("chain work at height {}", height)))
    }

    fn median_time_past(&self, height: Natural) -> Result<u32> {
        self.context.median_time_past_at(height)?.ok_or_else(|| {
            ConsensusError::MissingData(format!("median time past at height {}", height))
        })
    }

    fn target(&self, bits: u32) -> Result<U256> {
        expand_target(bits)
            .ok_or_else(|| ConsensusError::InvariantViolation(format!("invalid stored bits {:#010x}", bits)))
    }

    fn pow_limit(&self) -> Result<U256> {
        self.target(self.params.pow_limit_bits)
    }
}
