//! Proof-of-block-stake leader election and difficulty arithmetic.
//!
//! A stake output wins the right to create a block when
//! `hash(stake modifier ‖ stake output id ‖ timestamp) / stake value` meets
//! the current target. Bigger stakes divide the hash further down, so the win
//! probability is proportional to stake held.

use primitive_types::U256;

use crate::constants::ChainConstants;
use crate::crypto::{blake2b, Hash};
use crate::encoding::Encoder;
use crate::error::{ConsensusError, Result};
use crate::types::{BlockId, BlockStakeOutputId, Currency, Target, Timestamp};

/// The election value a stake output produces for a given second.
pub fn stake_election_value(
    stake_modifier: &Hash,
    stake_output_id: &BlockStakeOutputId,
    timestamp: Timestamp,
) -> U256 {
    let mut enc = Encoder::new();
    enc.write_raw(stake_modifier);
    enc.write_raw(&stake_output_id.0);
    enc.write_u64(timestamp);
    U256::from_big_endian(&blake2b(&enc.finish()))
}

/// Check one candidate election against the target.
pub fn check_stake_solution(
    stake_modifier: &Hash,
    stake_output_id: &BlockStakeOutputId,
    timestamp: Timestamp,
    stake_value: &Currency,
    target: &Target,
) -> Result<()> {
    if stake_value.is_zero() {
        return Err(ConsensusError::InvalidStakeSolution(
            "stake output has zero value".into(),
        ));
    }
    let value = stake_election_value(stake_modifier, stake_output_id, timestamp);
    let quotient = value / stake_value.as_u256();
    if !target.meets(quotient) {
        return Err(ConsensusError::UnsatisfiedTarget);
    }
    Ok(())
}

/// Derive the stake modifier from the id of the block `stake_modifier_depth`
/// blocks below the candidate's parent. Evolving it slowly keeps a creator
/// from grinding modifiers while still binding it to the branch being
/// extended.
pub fn stake_modifier(anchor: &BlockId) -> Hash {
    let mut enc = Encoder::new();
    enc.write_raw(b"stake modifier\0\0");
    enc.write_raw(&anchor.0);
    blake2b(&enc.finish())
}

/// Recompute the target for the next block from the recent-timestamp window.
///
/// `block_count` is the number of blocks spanning `oldest..=newest`; with
/// fewer than two the parent target is kept. The adjustment ratio is clamped
/// by the chain's maximum up/down fractions, and the result never exceeds the
/// root depth.
pub fn next_target(
    parent_target: &Target,
    oldest: Timestamp,
    newest: Timestamp,
    block_count: u64,
    constants: &ChainConstants,
) -> Target {
    if block_count < 2 {
        return *parent_target;
    }
    let expected = constants.block_frequency * (block_count - 1);
    let actual = newest.saturating_sub(oldest).max(1);

    let parent = parent_target.as_u256();
    let scaled = match parent.checked_mul(U256::from(actual)) {
        Some(product) => product / U256::from(expected.max(1)),
        None => U256::MAX,
    };

    // A shrinking target means rising difficulty; both movements are clamped.
    let floor = constants.max_adjustment_up.scale(parent);
    let ceiling = constants.max_adjustment_down.scale(parent);
    let clamped = scaled.max(floor).min(ceiling);

    let root = constants.root_depth.as_u256();
    Target::from_u256(clamped.min(root).max(U256::from(1u64)))
}
