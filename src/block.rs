//! Block model, header hashing and per-block validation.
//!
//! A block binds its parent, a timestamp, the proof-of-block-stake solution
//! and a digest of its payouts and transactions into one header hash; the
//! block id is that hash, so two blocks with equal ids are equal.

use serde::{Deserialize, Serialize};

use crate::condition::UnlockCondition;
use crate::constants::ChainConstants;
use crate::crypto::{blake2b, Hash};
use crate::encoding::{self, BinDecode, BinEncode, DecodeError, Decoder, Encoder};
use crate::error::{ConsensusError, Result};
use crate::pobs;
use crate::transaction::Transaction;
use crate::types::{
    BlockHeight, BlockId, BlockStakeOutputId, CoinOutputId, Currency, Target, Timestamp,
    UnlockHash, SPECIFIER_MINER_PAYOUT,
};
use crate::utxo::{self, BlockDiffs, TransactionContext, UnspentOutput, UtxoSet};

/// Reward line of a block: coins paid out to an address. Payout outputs are
/// time-locked by the maturity delay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerPayout {
    pub value: Currency,
    #[serde(rename = "unlockhash")]
    pub unlock_hash: UnlockHash,
}

/// The stake election a block was created with: which unspent block-stake
/// output won the right to extend the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PobsSolution {
    #[serde(rename = "stakeoutputid")]
    pub stake_output_id: BlockStakeOutputId,
}

impl PobsSolution {
    /// Genesis carries no election; its solution is the zero output id.
    pub fn genesis() -> Self {
        PobsSolution {
            stake_output_id: BlockStakeOutputId::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    #[serde(rename = "parentid")]
    pub parent_id: BlockId,
    pub nonce: [u8; 8],
    pub timestamp: Timestamp,
    pub pobs: PobsSolution,
    #[serde(rename = "minerpayouts")]
    pub miner_payouts: Vec<MinerPayout>,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Digest over payouts and transactions, bound into the header.
    fn content_root(&self) -> Hash {
        let mut enc = Encoder::new();
        self.miner_payouts.bin_encode(&mut enc);
        self.transactions.bin_encode(&mut enc);
        blake2b(&enc.finish())
    }

    /// The block id: a digest of every header field.
    pub fn id(&self) -> BlockId {
        let mut enc = Encoder::new();
        enc.write_raw(&self.parent_id.0);
        enc.write_raw(&self.nonce);
        enc.write_u64(self.timestamp);
        self.pobs.bin_encode(&mut enc);
        enc.write_raw(&self.content_root());
        BlockId(blake2b(&enc.finish()))
    }

    /// Identifier of the coin output created by the payout at `index`.
    pub fn miner_payout_id(&self, index: u64) -> CoinOutputId {
        let mut enc = Encoder::new();
        enc.write_raw(&self.id().0);
        enc.write_raw(&SPECIFIER_MINER_PAYOUT.0);
        enc.write_u64(index);
        CoinOutputId(blake2b(&enc.finish()))
    }

    pub fn encoded_len(&self) -> usize {
        encoding::encoded_len(self)
    }

    /// Total miner fees carried by this block's transactions.
    pub fn total_fees(&self) -> Result<Currency> {
        let mut total = Currency::zero();
        for tx in &self.transactions {
            total = total.checked_add(&tx.total_fee()?)?;
        }
        Ok(total)
    }
}

impl BinEncode for PobsSolution {
    fn bin_encode(&self, enc: &mut Encoder) {
        self.stake_output_id.bin_encode(enc);
    }
}

impl BinDecode for PobsSolution {
    fn bin_decode(dec: &mut Decoder<'_>) -> std::result::Result<Self, DecodeError> {
        Ok(PobsSolution {
            stake_output_id: BlockStakeOutputId::bin_decode(dec)?,
        })
    }
}

impl BinEncode for MinerPayout {
    fn bin_encode(&self, enc: &mut Encoder) {
        self.value.bin_encode(enc);
        self.unlock_hash.bin_encode(enc);
    }
}

impl BinDecode for MinerPayout {
    fn bin_decode(dec: &mut Decoder<'_>) -> std::result::Result<Self, DecodeError> {
        Ok(MinerPayout {
            value: Currency::bin_decode(dec)?,
            unlock_hash: UnlockHash::bin_decode(dec)?,
        })
    }
}

impl BinEncode for Block {
    fn bin_encode(&self, enc: &mut Encoder) {
        enc.write_raw(&self.parent_id.0);
        enc.write_raw(&self.nonce);
        enc.write_u64(self.timestamp);
        self.pobs.bin_encode(enc);
        self.miner_payouts.bin_encode(enc);
        self.transactions.bin_encode(enc);
    }
}

impl BinDecode for Block {
    fn bin_decode(dec: &mut Decoder<'_>) -> std::result::Result<Self, DecodeError> {
        Ok(Block {
            parent_id: BlockId::bin_decode(dec)?,
            nonce: dec.read_array::<8>()?,
            timestamp: dec.read_u64()?,
            pobs: PobsSolution::bin_decode(dec)?,
            miner_payouts: Vec::bin_decode(dec)?,
            transactions: Vec::bin_decode(dec)?,
        })
    }
}

/// Branch context a candidate block is validated in, assembled by the chain
/// store from the candidate's parent.
#[derive(Debug, Clone)]
pub struct BlockContext<'a> {
    /// Height the candidate would be committed at.
    pub height: BlockHeight,
    /// Median of the previous timestamps on the branch.
    pub median_timestamp: Timestamp,
    /// Target the branch's difficulty rules demand for this block.
    pub expected_target: Target,
    /// Stake modifier of the branch at this height.
    pub stake_modifier: Hash,
    /// Wall-clock time of validation.
    pub now: Timestamp,
    pub constants: &'a ChainConstants,
}

/// Header-level checks: size, timestamp window, stake election. `utxo` is the
/// set at the candidate's parent.
pub fn validate_block_header(block: &Block, ctx: &BlockContext<'_>, utxo: &UtxoSet) -> Result<()> {
    let size = block.encoded_len();
    if size > ctx.constants.block_size_limit {
        return Err(ConsensusError::LargeBlock {
            size,
            limit: ctx.constants.block_size_limit,
        });
    }

    if block.timestamp <= ctx.median_timestamp {
        return Err(ConsensusError::EarlyTimestamp);
    }
    if block.timestamp > ctx.now + ctx.constants.extreme_future_threshold {
        return Err(ConsensusError::ExtremeFutureTimestamp);
    }
    if block.timestamp > ctx.now + ctx.constants.future_threshold {
        return Err(ConsensusError::FutureTimestamp);
    }

    let stake = utxo.block_stake(&block.pobs.stake_output_id).ok_or_else(|| {
        ConsensusError::InvalidStakeSolution(format!(
            "stake output {} is not unspent",
            block.pobs.stake_output_id
        ))
    })?;
    // Genesis allocations (created at height 0) are always aged.
    if stake.created_at > 0 {
        let age = ctx.height.saturating_sub(stake.created_at);
        if age < ctx.constants.block_stake_aging_blocks() {
            return Err(ConsensusError::UnagedStake);
        }
    }
    pobs::check_stake_solution(
        &ctx.stake_modifier,
        &block.pobs.stake_output_id,
        block.timestamp,
        &stake.value,
        &ctx.expected_target,
    )
}

/// Apply a block's transactions and payouts to `utxo`, returning the diffs.
///
/// The caller stages `utxo` (a clone of the parent state) and discards it on
/// error; this function does not roll back on its own.
pub fn apply_block(block: &Block, utxo: &mut UtxoSet, ctx: &BlockContext<'_>) -> Result<BlockDiffs> {
    let mut diffs = BlockDiffs::default();
    let mut fee_total = Currency::zero();
    let tx_ctx = TransactionContext {
        block_height: ctx.height,
        block_timestamp: block.timestamp,
        constants: ctx.constants,
    };
    for tx in &block.transactions {
        let tx_diffs = utxo::apply_transaction(tx, utxo, &tx_ctx)?;
        diffs.extend(tx_diffs);
        fee_total = fee_total.checked_add(&tx.total_fee()?)?;
    }

    // Payouts must account for exactly the minted reward plus the fees.
    let reward = ctx.constants.block_creator_fee.checked_add(&fee_total)?;
    let payout_total = Currency::sum(block.miner_payouts.iter().map(|p| &p.value))?;
    if payout_total != reward {
        return Err(ConsensusError::WrongMinerPayouts);
    }
    for payout in &block.miner_payouts {
        if payout.value.is_zero() {
            return Err(ConsensusError::WrongMinerPayouts);
        }
    }

    for (index, payout) in block.miner_payouts.iter().enumerate() {
        let id = block.miner_payout_id(index as u64);
        let output = UnspentOutput {
            value: payout.value,
            condition: UnlockCondition::UnlockHash(payout.unlock_hash),
            created_at: ctx.height,
            maturity_height: Some(ctx.height + ctx.constants.maturity_delay),
        };
        diffs.coin_diffs.push(utxo::insert_coin_output(utxo, id, output));
    }

    Ok(diffs)
}

/// Median of the window of previous timestamps; `timestamps` is ordered from
/// oldest to newest and never empty for a non-genesis candidate.
pub fn median_timestamp(timestamps: &mut Vec<Timestamp>) -> Timestamp {
    timestamps.sort_unstable();
    timestamps[timestamps.len() / 2]
}
