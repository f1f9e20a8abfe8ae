//! Network consensus parameters and engine tuning
//!
//! Every fork activation predicate is a field of [`ChainParams`] so alternate
//! networks (and tests) can move activation points without touching rule code.

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::{ConsensusError, Result};
use crate::types::{hash_from_hex, hash_to_hex, Hash};

/// Consensus parameters of one network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainParams {
    pub name: String,
    /// Expected genesis hash; `None` accepts any parentless block at height 0
    #[serde(default, with = "optional_hash")]
    pub genesis_hash: Option<Hash>,
    pub pow_limit_bits: u32,
    /// Every block keeps its parent's target (regtest)
    #[serde(default)]
    pub no_retargeting: bool,
    pub coinbase_maturity: u64,
    pub subsidy_halving_interval: u64,

    pub bip16_height: u64,
    pub bip34_height: u64,
    pub bip66_height: u64,
    pub bip65_height: u64,
    /// BIP68, BIP112 and BIP113
    pub csv_height: u64,
    /// Replay-protected signatures, 32MB blocks, emergency difficulty adjustment
    pub uahf_height: u64,
    /// Per-block difficulty adjustment, LOW_S, NULLFAIL
    pub daa_height: u64,
    /// Re-enabled splice, bitwise and arithmetic opcodes
    pub monolith_activation_mtp: u32,
    /// Push-only unlocking scripts, clean stack, CHECKDATASIG, canonical ordering
    pub magnetic_anomaly_height: u64,
    /// Height at which the clean-stack rule stops applying, if ever
    #[serde(default)]
    pub clean_stack_retirement_height: Option<u64>,
    /// Median-time-past at which segwit-recovery spends are exempt from clean stack
    pub segwit_recovery_activation_mtp: u32,
}

impl ChainParams {
    pub fn mainnet() -> Self {
        Self {
            name: "mainnet".to_string(),
            genesis_hash: hash_from_hex(
                "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
            ),
            pow_limit_bits: MAX_TARGET,
            no_retargeting: false,
            coinbase_maturity: COINBASE_MATURITY,
            subsidy_halving_interval: HALVING_INTERVAL,
            bip16_height: 173_805,
            bip34_height: 227_931,
            bip66_height: 363_725,
            bip65_height: 388_381,
            csv_height: 419_328,
            uahf_height: 478_559,
            daa_height: 504_032,
            monolith_activation_mtp: 1_526_400_000,
            magnetic_anomaly_height: 556_767,
            clean_stack_retirement_height: None,
            segwit_recovery_activation_mtp: 1_557_921_600,
        }
    }

    /// Local test network: every fork active, trivial proof-of-work, fixed target.
    pub fn regtest() -> Self {
        Self {
            name: "regtest".to_string(),
            genesis_hash: None,
            pow_limit_bits: 0x207fffff,
            no_retargeting: true,
            coinbase_maturity: COINBASE_MATURITY,
            subsidy_halving_interval: 150,
            bip16_height: 0,
            bip34_height: 1,
            bip66_height: 0,
            bip65_height: 0,
            csv_height: 0,
            uahf_height: 0,
            daa_height: 0,
            monolith_activation_mtp: 0,
            magnetic_anomaly_height: 0,
            clean_stack_retirement_height: None,
            segwit_recovery_activation_mtp: 0,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let params: ChainParams = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn validate(&self) -> Result<()> {
        if self.subsidy_halving_interval == 0 {
            return Err(ConsensusError::Config(
                "subsidy_halving_interval must be positive".to_string(),
            ));
        }
        if crate::pow::expand_target(self.pow_limit_bits).is_none() {
            return Err(ConsensusError::Config(format!(
                "pow_limit_bits {:#010x} is not a valid target",
                self.pow_limit_bits
            )));
        }
        Ok(())
    }

    pub fn is_bip16_active(&self, height: u64) -> bool {
        height >= self.bip16_height
    }

    pub fn is_bip34_active(&self, height: u64) -> bool {
        height >= self.bip34_height
    }

    pub fn is_bip66_active(&self, height: u64) -> bool {
        height >= self.bip66_height
    }

    pub fn is_bip65_active(&self, height: u64) -> bool {
        height >= self.bip65_height
    }

    pub fn is_csv_active(&self, height: u64) -> bool {
        height >= self.csv_height
    }

    pub fn is_uahf_active(&self, height: u64) -> bool {
        height >= self.uahf_height
    }

    pub fn is_daa_active(&self, height: u64) -> bool {
        height >= self.daa_height
    }

    pub fn is_monolith_active(&self, median_time_past: u32) -> bool {
        median_time_past >= self.monolith_activation_mtp
    }

    pub fn is_magnetic_anomaly_active(&self, height: u64) -> bool {
        height >= self.magnetic_anomaly_height
    }

    pub fn is_clean_stack_retired(&self, height: u64) -> bool {
        self.clean_stack_retirement_height
            .map(|retirement| height >= retirement)
            .unwrap_or(false)
    }

    pub fn is_segwit_recovery_active(&self, median_time_past: u32) -> bool {
        median_time_past >= self.segwit_recovery_activation_mtp
    }

    pub fn max_block_size(&self, height: u64) -> usize {
        if self.is_uahf_active(height) {
            MAX_BLOCK_SIZE
        } else {
            LEGACY_MAX_BLOCK_SIZE
        }
    }
}

/// Engine tuning knobs; none of these affect consensus outcomes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Transaction validation workers; 0 means available hardware parallelism
    pub worker_threads: usize,
    /// Flush the UTXO overlay to storage every N connected blocks
    pub utxo_commit_interval: u64,
    /// Maximum seconds a block timestamp may run ahead of network time
    pub max_future_block_time: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            utxo_commit_interval: 100,
            max_future_block_time: MAX_FUTURE_BLOCK_TIME,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1)
    }
}

mod optional_hash {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Hash>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match value {
            Some(hash) => serializer.serialize_some(&hash_to_hex(hash)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<Hash>, D::Error> {
        let text: Option<String> = Option::deserialize(deserializer)?;
        match text {
            None => Ok(None),
            Some(text) => hash_from_hex(&text)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid block hash: {}", text))),
        }
    }
}
