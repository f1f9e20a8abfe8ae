//! Consensus constants shared by every network
//!
//! Fork activation points and other values that differ between networks live in
//! [`crate::config::ChainParams`].

/// Satoshis per coin
pub const SATOSHIS_PER_COIN: i64 = 100_000_000;

/// Maximum money supply: 21,000,000 coins in satoshis
pub const MAX_MONEY: i64 = 21_000_000 * SATOSHIS_PER_COIN;

/// Initial block subsidy: 50 coins
pub const INITIAL_SUBSIDY: i64 = 50 * SATOSHIS_PER_COIN;

/// Halving interval: 210,000 blocks
pub const HALVING_INTERVAL: u64 = 210_000;

/// Confirmations required before a coinbase output may be spent
pub const COINBASE_MATURITY: u64 = 100;

/// Serialized header size in bytes
pub const BLOCK_HEADER_SIZE: usize = 80;

/// Maximum block size before the UAHF: 1MB
pub const LEGACY_MAX_BLOCK_SIZE: usize = 1_000_000;

/// Maximum block size after the UAHF: 32MB
pub const MAX_BLOCK_SIZE: usize = 32_000_000;

/// Maximum transaction size: 1MB
pub const MAX_TX_SIZE: usize = 1_000_000;

/// Coinbase unlocking script length bounds
pub const MIN_COINBASE_SCRIPT_SIZE: usize = 2;
pub const MAX_COINBASE_SCRIPT_SIZE: usize = 100;

/// Maximum script length
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Maximum size of a single stack element
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

/// Maximum combined main and alt stack depth during script execution
pub const MAX_STACK_SIZE: usize = 1000;

/// Maximum number of non-push operations in a script
pub const MAX_SCRIPT_OPS: usize = 201;

/// Maximum public keys in a multisig operation
pub const MAX_PUBKEYS_PER_MULTISIG: usize = 20;

/// Number of ancestors used for median-time-past
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Target time per block: 10 minutes
pub const TARGET_SPACING: u64 = 600;

/// Classic retarget interval: 2016 blocks
pub const DIFFICULTY_ADJUSTMENT_INTERVAL: u64 = 2016;

/// Classic retarget timespan: two weeks
pub const TARGET_TIMESPAN: u64 = DIFFICULTY_ADJUSTMENT_INTERVAL * TARGET_SPACING;

/// Sliding-window size of the per-block adjustment
pub const DAA_WINDOW: u64 = 144;

/// Gap between MTPs six blocks apart that triggers the emergency adjustment
pub const EDA_TRIGGER_SECONDS: u32 = 12 * 60 * 60;

/// Maximum allowed drift of a block timestamp beyond network time: 2 hours
pub const MAX_FUTURE_BLOCK_TIME: u64 = 2 * 60 * 60;

/// Proof-of-work limit in compact form
pub const MAX_TARGET: u32 = 0x1d00ffff;

/// Lock time threshold: lock times below this are block heights
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Sequence number for final inputs
pub const SEQUENCE_FINAL: u32 = 0xffffffff;

/// BIP68: relative lock-time disabled for this input
pub const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;

/// BIP68: relative lock-time is time-based (512 second granularity)
pub const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;

/// BIP68: mask selecting the relative lock-time value
pub const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000ffff;

/// BIP68: time-based lock granularity as a shift
pub const SEQUENCE_LOCKTIME_GRANULARITY: u32 = 9;
