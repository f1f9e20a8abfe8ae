//! Block reward schedule

use crate::constants::*;
use crate::types::*;

/// GetBlockSubsidy: ℕ → ℤ
///
/// Subsidy halves every `halving_interval` blocks:
/// subsidy = 50 * C * 2^(-⌊h/H⌋), and is zero after 64 halvings.
pub fn get_block_subsidy(height: Natural, halving_interval: Natural) -> Integer {
    let halvings = height / halving_interval.max(1);
    if halvings >= 64 {
        return 0;
    }
    INITIAL_SUBSIDY >> halvings
}

/// Most a coinbase may claim: subsidy plus the fees of the block
pub fn max_coinbase_value(height: Natural, halving_interval: Natural, fees: Integer) -> Integer {
    get_block_subsidy(height, halving_interval).saturating_add(fees)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_block_subsidy_genesis() {
        assert_eq!(get_block_subsidy(0, HALVING_INTERVAL), INITIAL_SUBSIDY);
    }

    #[test]
    fn test_get_block_subsidy_halvings() {
        assert_eq!(get_block_subsidy(HALVING_INTERVAL - 1, HALVING_INTERVAL), INITIAL_SUBSIDY);
        assert_eq!(get_block_subsidy(HALVING_INTERVAL, HALVING_INTERVAL), INITIAL_SUBSIDY / 2);
        assert_eq!(get_block_subsidy(2 * HALVING_INTERVAL, HALVING_INTERVAL), INITIAL_SUBSIDY / 4);
        assert_eq!(get_block_subsidy(64 * HALVING_INTERVAL, HALVING_INTERVAL), 0);
    }

    #[test]
    fn test_regtest_schedule() {
        assert_eq!(get_block_subsidy(149, 150), INITIAL_SUBSIDY);
        assert_eq!(get_block_subsidy(150, 150), INITIAL_SUBSIDY / 2);
    }

    #[test]
    fn test_max_coinbase_value() {
        assert_eq!(max_coinbase_value(0, 150, 1_000), INITIAL_SUBSIDY + 1_000);
    }
}
