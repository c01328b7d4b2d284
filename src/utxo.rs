//! Unspent-output set and the diff engine that mutates it.
//!
//! Blocks never touch the set directly: applying a transaction yields a list
//! of invertible diffs, and the chain store replays or unwinds those diffs to
//! move between states. Reverting a block's diffs in reverse order restores
//! the prior set byte for byte.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::condition::FulfillContext;
use crate::constants::ChainConstants;
use crate::error::{ConsensusError, Result};
use crate::transaction::{check_transaction, Transaction};
use crate::types::{
    BlockHeight, BlockStakeOutputId, CoinOutputId, ConsensusChangeId, Currency, Timestamp,
};
use crate::condition::UnlockCondition;

/// An output currently present in the set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutput {
    pub value: Currency,
    pub condition: UnlockCondition,
    /// Height of the block that created this output.
    #[serde(rename = "createdat")]
    pub created_at: BlockHeight,
    /// Height before which this output cannot be spent; set for miner payouts.
    #[serde(rename = "maturityheight")]
    pub maturity_height: Option<BlockHeight>,
}

/// The current unspent outputs of both assets. The two maps are disjoint by
/// construction: identifiers embed the asset kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoSet {
    coins: HashMap<CoinOutputId, UnspentOutput>,
    block_stakes: HashMap<BlockStakeOutputId, UnspentOutput>,
}

impl UtxoSet {
    pub fn new() -> Self {
        UtxoSet::default()
    }

    pub fn coin(&self, id: &CoinOutputId) -> Option<&UnspentOutput> {
        self.coins.get(id)
    }

    pub fn block_stake(&self, id: &BlockStakeOutputId) -> Option<&UnspentOutput> {
        self.block_stakes.get(id)
    }

    pub fn coin_count(&self) -> usize {
        self.coins.len()
    }

    pub fn block_stake_count(&self) -> usize {
        self.block_stakes.len()
    }

    pub fn coins(&self) -> impl Iterator<Item = (&CoinOutputId, &UnspentOutput)> {
        self.coins.iter()
    }

    pub fn block_stakes(&self) -> impl Iterator<Item = (&BlockStakeOutputId, &UnspentOutput)> {
        self.block_stakes.iter()
    }

    /// Sum of all unspent coin values.
    pub fn total_coins(&self) -> Result<Currency> {
        Currency::sum(self.coins.values().map(|o| &o.value))
    }

    /// Sum of all unspent block-stake values.
    pub fn total_block_stakes(&self) -> Result<Currency> {
        Currency::sum(self.block_stakes.values().map(|o| &o.value))
    }
}

/// What a diff did to the set when applied forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffDirection {
    /// The output was added to the set.
    Created,
    /// The output was removed from the set (spent).
    Spent,
}

impl DiffDirection {
    pub fn inverse(self) -> Self {
        match self {
            DiffDirection::Created => DiffDirection::Spent,
            DiffDirection::Spent => DiffDirection::Created,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinOutputDiff {
    pub direction: DiffDirection,
    pub id: CoinOutputId,
    pub output: UnspentOutput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStakeOutputDiff {
    pub direction: DiffDirection,
    pub id: BlockStakeOutputId,
    pub output: UnspentOutput,
}

/// All diffs produced by applying one block (or one trial transaction set).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDiffs {
    pub coin_diffs: Vec<CoinOutputDiff>,
    pub block_stake_diffs: Vec<BlockStakeOutputDiff>,
}

impl BlockDiffs {
    pub fn extend(&mut self, other: BlockDiffs) {
        self.coin_diffs.extend(other.coin_diffs);
        self.block_stake_diffs.extend(other.block_stake_diffs);
    }
}

/// One atomic record of chain movement as observed by a subscriber: a
/// contiguous run of reverted blocks followed by the blocks applied in their
/// place, with the resulting output diffs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusChange {
    pub id: ConsensusChangeId,
    #[serde(rename = "revertedblocks")]
    pub reverted_blocks: Vec<Block>,
    #[serde(rename = "appliedblocks")]
    pub applied_blocks: Vec<Block>,
    #[serde(rename = "coinoutputdiffs")]
    pub coin_diffs: Vec<CoinOutputDiff>,
    #[serde(rename = "blockstakeoutputdiffs")]
    pub block_stake_diffs: Vec<BlockStakeOutputDiff>,
}

impl ConsensusChange {
    pub fn new(id: ConsensusChangeId) -> Self {
        ConsensusChange {
            id,
            reverted_blocks: Vec::new(),
            applied_blocks: Vec::new(),
            coin_diffs: Vec::new(),
            block_stake_diffs: Vec::new(),
        }
    }
}

/// Ledger context a transaction is applied in.
#[derive(Debug, Clone)]
pub struct TransactionContext<'a> {
    pub block_height: BlockHeight,
    pub block_timestamp: Timestamp,
    pub constants: &'a ChainConstants,
}

/// Validate `tx` against `utxo` and apply it, returning the diffs. On any
/// rule violation the set is left untouched.
pub fn apply_transaction(
    tx: &Transaction,
    utxo: &mut UtxoSet,
    ctx: &TransactionContext<'_>,
) -> Result<BlockDiffs> {
    check_transaction(tx, ctx.constants)?;

    // Stage the spends first; nothing is mutated until every rule passed.
    let mut spent_coins = Vec::with_capacity(tx.coin_inputs.len());
    let mut coin_in = Currency::zero();
    for (index, input) in tx.coin_inputs.iter().enumerate() {
        let output = utxo
            .coins
            .get(&input.parent_id)
            .ok_or_else(|| ConsensusError::MissingOutput(input.parent_id.to_string()))?;
        if let Some(maturity) = output.maturity_height {
            if ctx.block_height < maturity {
                return Err(ConsensusError::ImmatureOutput);
            }
        }
        let fulfill_ctx = FulfillContext {
            input_index: index as u64,
            block_height: ctx.block_height,
            block_time: ctx.block_timestamp,
            transaction: tx,
        };
        output.condition.fulfill(&input.fulfillment, &fulfill_ctx)?;
        coin_in = coin_in.checked_add(&output.value)?;
        spent_coins.push((input.parent_id, output.clone()));
    }

    let mut spent_stakes = Vec::with_capacity(tx.block_stake_inputs.len());
    let mut stake_in = Currency::zero();
    for (index, input) in tx.block_stake_inputs.iter().enumerate() {
        let output = utxo
            .block_stakes
            .get(&input.parent_id)
            .ok_or_else(|| ConsensusError::MissingOutput(input.parent_id.to_string()))?;
        let fulfill_ctx = FulfillContext {
            input_index: index as u64,
            block_height: ctx.block_height,
            block_time: ctx.block_timestamp,
            transaction: tx,
        };
        output.condition.fulfill(&input.fulfillment, &fulfill_ctx)?;
        stake_in = stake_in.checked_add(&output.value)?;
        spent_stakes.push((input.parent_id, output.clone()));
    }

    // Coins must balance outputs plus fees exactly; stakes balance outputs.
    let coin_out = Currency::sum(tx.coin_outputs.iter().map(|o| &o.value))?
        .checked_add(&tx.total_fee()?)?;
    if coin_in != coin_out {
        return Err(ConsensusError::InputOutputMismatch { asset: "coins" });
    }
    let stake_out = Currency::sum(tx.block_stake_outputs.iter().map(|o| &o.value))?;
    if stake_in != stake_out {
        return Err(ConsensusError::InputOutputMismatch { asset: "block stakes" });
    }

    // Commit: remove spends, add creations, record diffs in order.
    let mut diffs = BlockDiffs::default();
    for (id, output) in spent_coins {
        utxo.coins.remove(&id);
        diffs.coin_diffs.push(CoinOutputDiff {
            direction: DiffDirection::Spent,
            id,
            output,
        });
    }
    for (id, output) in spent_stakes {
        utxo.block_stakes.remove(&id);
        diffs.block_stake_diffs.push(BlockStakeOutputDiff {
            direction: DiffDirection::Spent,
            id,
            output,
        });
    }
    for (index, output) in tx.coin_outputs.iter().enumerate() {
        let id = tx.coin_output_id(index as u64);
        let unspent = UnspentOutput {
            value: output.value,
            condition: output.condition.clone(),
            created_at: ctx.block_height,
            maturity_height: None,
        };
        utxo.coins.insert(id, unspent.clone());
        diffs.coin_diffs.push(CoinOutputDiff {
            direction: DiffDirection::Created,
            id,
            output: unspent,
        });
    }
    for (index, output) in tx.block_stake_outputs.iter().enumerate() {
        let id = tx.block_stake_output_id(index as u64);
        let unspent = UnspentOutput {
            value: output.value,
            condition: output.condition.clone(),
            created_at: ctx.block_height,
            maturity_height: None,
        };
        utxo.block_stakes.insert(id, unspent.clone());
        diffs.block_stake_diffs.push(BlockStakeOutputDiff {
            direction: DiffDirection::Created,
            id,
            output: unspent,
        });
    }
    Ok(diffs)
}

/// Apply the genesis transaction, which is exempt from validation.
pub fn apply_genesis_transaction(tx: &Transaction, utxo: &mut UtxoSet) -> BlockDiffs {
    let mut diffs = BlockDiffs::default();
    for (index, output) in tx.coin_outputs.iter().enumerate() {
        let id = tx.coin_output_id(index as u64);
        let unspent = UnspentOutput {
            value: output.value,
            condition: output.condition.clone(),
            created_at: 0,
            maturity_height: None,
        };
        utxo.coins.insert(id, unspent.clone());
        diffs.coin_diffs.push(CoinOutputDiff {
            direction: DiffDirection::Created,
            id,
            output: unspent,
        });
    }
    for (index, output) in tx.block_stake_outputs.iter().enumerate() {
        let id = tx.block_stake_output_id(index as u64);
        let unspent = UnspentOutput {
            value: output.value,
            condition: output.condition.clone(),
            created_at: 0,
            maturity_height: None,
        };
        utxo.block_stakes.insert(id, unspent.clone());
        diffs.block_stake_diffs.push(BlockStakeOutputDiff {
            direction: DiffDirection::Created,
            id,
            output: unspent,
        });
    }
    diffs
}

/// Record a miner payout output directly (payouts have no transaction).
pub fn insert_coin_output(
    utxo: &mut UtxoSet,
    id: CoinOutputId,
    output: UnspentOutput,
) -> CoinOutputDiff {
    utxo.coins.insert(id, output.clone());
    CoinOutputDiff {
        direction: DiffDirection::Created,
        id,
        output,
    }
}

fn apply_coin_diff(utxo: &mut UtxoSet, diff: &CoinOutputDiff, direction: DiffDirection) -> Result<()> {
    match direction {
        DiffDirection::Created => {
            if utxo.coins.insert(diff.id, diff.output.clone()).is_some() {
                return Err(ConsensusError::Corruption(format!(
                    "coin output {} created twice",
                    diff.id
                )));
            }
        }
        DiffDirection::Spent => {
            if utxo.coins.remove(&diff.id).is_none() {
                return Err(ConsensusError::Corruption(format!(
                    "coin output {} spent but absent",
                    diff.id
                )));
            }
        }
    }
    Ok(())
}

fn apply_stake_diff(
    utxo: &mut UtxoSet,
    diff: &BlockStakeOutputDiff,
    direction: DiffDirection,
) -> Result<()> {
    match direction {
        DiffDirection::Created => {
            if utxo.block_stakes.insert(diff.id, diff.output.clone()).is_some() {
                return Err(ConsensusError::Corruption(format!(
                    "block stake output {} created twice",
                    diff.id
                )));
            }
        }
        DiffDirection::Spent => {
            if utxo.block_stakes.remove(&diff.id).is_none() {
                return Err(ConsensusError::Corruption(format!(
                    "block stake output {} spent but absent",
                    diff.id
                )));
            }
        }
    }
    Ok(())
}

/// Replay previously computed diffs forward.
pub fn apply_diffs(utxo: &mut UtxoSet, diffs: &BlockDiffs) -> Result<()> {
    for diff in &diffs.coin_diffs {
        apply_coin_diff(utxo, diff, diff.direction)?;
    }
    for diff in &diffs.block_stake_diffs {
        apply_stake_diff(utxo, diff, diff.direction)?;
    }
    Ok(())
}

/// The diffs describing the inverse transition: reverse order, directions
/// flipped. Used to report reverted blocks inside a consensus change.
pub fn inverted_diffs(diffs: &BlockDiffs) -> BlockDiffs {
    BlockDiffs {
        coin_diffs: diffs
            .coin_diffs
            .iter()
            .rev()
            .map(|d| CoinOutputDiff {
                direction: d.direction.inverse(),
                id: d.id,
                output: d.output.clone(),
            })
            .collect(),
        block_stake_diffs: diffs
            .block_stake_diffs
            .iter()
            .rev()
            .map(|d| BlockStakeOutputDiff {
                direction: d.direction.inverse(),
                id: d.id,
                output: d.output.clone(),
            })
            .collect(),
    }
}

/// Unwind diffs: strict reverse order, each direction inverted.
pub fn revert_diffs(utxo: &mut UtxoSet, diffs: &BlockDiffs) -> Result<()> {
    for diff in diffs.coin_diffs.iter().rev() {
        apply_coin_diff(utxo, diff, diff.direction.inverse())?;
    }
    for diff in diffs.block_stake_diffs.iter().rev() {
        apply_stake_diff(utxo, diff, diff.direction.inverse())?;
    }
    Ok(())
}
