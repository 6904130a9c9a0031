//! Monetary policy: supply cap, per-block emission, fees, deposits and reward split

use crate::crypto::Address;

pub const PALS_PER_TMPL: u64 = 100_000_000;
pub const MAX_SUPPLY_PALS: u64 = 250_000_000 * PALS_PER_TMPL;
/// 0.6345 TMPL minted per block until the cap is reached.
pub const EMISSION_PER_BLOCK_PALS: u64 = 63_450_000;
/// Fixed fee carried by every transfer (0.0005 TMPL).
pub const TRANSFER_FEE_PALS: u64 = 50_000;
pub const VALIDATOR_DEPOSIT_PALS: u64 = 100 * PALS_PER_TMPL;
pub const WITHDRAWAL_DELAY_BLOCKS: u64 = 100;

/// Competing proposers must hold this much to force a deep reorg (51% of max supply).
pub const COIN_ATTACK_THRESHOLD_PALS: u64 = MAX_SUPPLY_PALS / 100 * 51;

/// Result of splitting one block's reward pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct RewardOutcome {
    /// Newly minted pals offered this block, after clipping to the cap.
    pub block_reward: u64,
    pub collected_fees: u64,
    pub per_validator: u64,
    pub total_distributed: u64,
    /// `pool mod n`, or the whole pool when nobody is eligible. Never paid out.
    pub undistributed: u64,
}

impl RewardOutcome {
    /// Pals that enter circulation for the first time this block.
    pub fn minted(&self) -> u64 {
        self.total_distributed.saturating_sub(self.collected_fees)
    }

    /// Pals that leave circulation this block (fees nobody received).
    pub fn burned(&self) -> u64 {
        self.collected_fees.saturating_sub(self.total_distributed)
    }
}

/// Block reward still available under the cap.
pub fn block_reward(total_emitted: u64) -> u64 {
    let remaining = MAX_SUPPLY_PALS.saturating_sub(total_emitted);
    EMISSION_PER_BLOCK_PALS.min(remaining)
}

pub struct RewardCalculator;

impl RewardCalculator {
    /// Split `block_reward + collected_fees` equally across `active_validators`.
    ///
    /// Floor division; the remainder is dropped, not carried forward, and there is no
    /// proposer premium. With no eligible validators the whole pool is dropped.
    pub fn compute(active_validators: &[Address], collected_fees: u64, total_emitted: u64) -> RewardOutcome {
        let block_reward = block_reward(total_emitted);
        let pool = block_reward.saturating_add(collected_fees);
        let count = active_validators.len() as u64;

        if count == 0 {
            return RewardOutcome {
                block_reward,
                collected_fees,
                per_validator: 0,
                total_distributed: 0,
                undistributed: pool,
            };
        }

        let per_validator = pool / count;
        let total_distributed = per_validator * count;
        RewardOutcome {
            block_reward,
            collected_fees,
            per_validator,
            total_distributed,
            undistributed: pool - total_distributed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256;

    fn validators(n: u8) -> Vec<Address> {
        (0..n).map(|i| sha256(&[i])).collect()
    }

    #[test]
    fn test_ten_validators_two_fees() {
        let outcome = RewardCalculator::compute(&validators(10), 2 * TRANSFER_FEE_PALS, 0);
        assert_eq!(outcome.block_reward, 63_450_000);
        assert_eq!(outcome.per_validator, 6_355_000);
        assert_eq!(outcome.total_distributed, 63_550_000);
        assert_eq!(outcome.undistributed, 0);
        assert_eq!(outcome.minted(), 63_450_000);
    }

    #[test]
    fn test_final_partial_reward_then_zero() {
        let emitted = MAX_SUPPLY_PALS - 1_960;
        let outcome = RewardCalculator::compute(&validators(1), 0, emitted);
        assert_eq!(outcome.block_reward, 1_960);
        assert_eq!(outcome.per_validator, 1_960);

        let next = RewardCalculator::compute(&validators(1), 0, emitted + outcome.minted());
        assert_eq!(next.block_reward, 0);
        assert_eq!(next.total_distributed, 0);
    }

    #[test]
    fn test_remainder_is_not_distributed() {
        let outcome = RewardCalculator::compute(&validators(7), 0, 0);
        assert_eq!(outcome.per_validator, 63_450_000 / 7);
        assert_eq!(outcome.undistributed, 63_450_000 % 7);
        assert_eq!(outcome.minted() + outcome.undistributed, outcome.block_reward);
    }

    #[test]
    fn test_no_validators_drops_pool() {
        let outcome = RewardCalculator::compute(&[], TRANSFER_FEE_PALS, 0);
        assert_eq!(outcome.total_distributed, 0);
        assert_eq!(outcome.minted(), 0);
        assert_eq!(outcome.burned(), TRANSFER_FEE_PALS);
    }

    #[test]
    fn test_attack_threshold_is_51_percent() {
        assert_eq!(COIN_ATTACK_THRESHOLD_PALS, 127_500_000 * PALS_PER_TMPL);
    }
}
