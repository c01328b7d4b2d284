//! Block creation: assemble a candidate from the pool and solve the stake
//! election for it.
//!
//! The creator owns a list of block-stake output ids it may elect with. Once
//! per tick it re-reads the chain tip, scans each owned stake over the
//! admissible timestamp range and, on a winning election, assembles a block
//! from the pool's transactions and submits it to the chain store. The stop
//! channel is only honoured between submissions, never in the middle of one.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{select, tick, Receiver};
use log::{debug, info};

use crate::block::{Block, MinerPayout, PobsSolution};
use crate::chain::{BlockAcceptance, ChainStore, CreationContext};
use crate::constants::ChainConstants;
use crate::error::Result;
use crate::mempool::TransactionPool;
use crate::pobs;
use crate::transaction::Transaction;
use crate::types::{BlockStakeOutputId, Currency, Timestamp, UnlockHash};

/// Seconds of history scanned per stake output on one solving pass.
const TIMESTAMP_SCAN_DEPTH: u64 = 32;

pub struct BlockCreator {
    chain: Arc<ChainStore>,
    pool: Arc<TransactionPool>,
    /// Stake outputs this creator controls.
    stake_outputs: Vec<BlockStakeOutputId>,
    /// Where the block reward goes.
    payout_address: UnlockHash,
}

fn unix_now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl BlockCreator {
    pub fn new(
        chain: Arc<ChainStore>,
        pool: Arc<TransactionPool>,
        stake_outputs: Vec<BlockStakeOutputId>,
        payout_address: UnlockHash,
    ) -> Self {
        BlockCreator {
            chain,
            pool,
            stake_outputs,
            payout_address,
        }
    }

    /// Try every owned stake output against the current tip at clock `now`.
    /// Returns a fully assembled candidate on a winning election.
    pub fn solve_at(&self, now: Timestamp) -> Option<Block> {
        let ctx = self.chain.creation_context();
        let constants = self.chain.constants();
        let earliest = ctx.median_timestamp + 1;
        if now < earliest {
            return None;
        }
        let scan = (now - earliest).min(TIMESTAMP_SCAN_DEPTH);
        for stake_id in &self.stake_outputs {
            let Some(stake) = self.chain.unspent_block_stake(stake_id) else {
                continue;
            };
            // Prefer the newest admissible timestamp.
            for offset in 0..=scan {
                let timestamp = now - offset;
                if pobs::check_stake_solution(
                    &ctx.stake_modifier,
                    stake_id,
                    timestamp,
                    &stake.value,
                    &ctx.target,
                )
                .is_ok()
                {
                    debug!(
                        "stake {stake_id} wins the election for height {} at {timestamp}",
                        ctx.height
                    );
                    return self.assemble(&ctx, *stake_id, timestamp, &constants);
                }
            }
        }
        None
    }

    /// One full pass: solve and, if a candidate came out, submit it.
    pub fn solve_once(&self) -> Result<Option<BlockAcceptance>> {
        let Some(block) = self.solve_at(unix_now()) else {
            return Ok(None);
        };
        let id = block.id();
        let acceptance = self.chain.accept_block(block)?;
        info!("created and submitted block {id}");
        Ok(Some(acceptance))
    }

    /// Solving loop: one pass per tick until `stop` fires. An in-flight
    /// submission always completes before the loop exits.
    pub fn run(&self, stop: Receiver<()>) {
        let ticker = tick(Duration::from_secs(1));
        loop {
            select! {
                recv(stop) -> _ => {
                    debug!("block creator stopping");
                    return;
                }
                recv(ticker) -> _ => {
                    if let Err(err) = self.solve_once() {
                        debug!("candidate block rejected: {err}");
                    }
                }
            }
        }
    }

    fn assemble(
        &self,
        ctx: &CreationContext,
        stake_output_id: BlockStakeOutputId,
        timestamp: Timestamp,
        constants: &ChainConstants,
    ) -> Option<Block> {
        let mut transactions = self.pool.transaction_list();
        let mut block = self.build(ctx, stake_output_id, timestamp, &transactions, constants)?;
        // Shed transactions from the back until the block fits.
        while block.encoded_len() > constants.block_size_limit && !transactions.is_empty() {
            transactions.pop();
            block = self.build(ctx, stake_output_id, timestamp, &transactions, constants)?;
        }
        Some(block)
    }

    fn build(
        &self,
        ctx: &CreationContext,
        stake_output_id: BlockStakeOutputId,
        timestamp: Timestamp,
        transactions: &[Transaction],
        constants: &ChainConstants,
    ) -> Option<Block> {
        let mut fees = Currency::zero();
        for tx in transactions {
            fees = fees.checked_add(&tx.total_fee().ok()?).ok()?;
        }

        // Fees may be redirected by the chain; the minted reward never is.
        let mut miner_payouts = Vec::new();
        match &constants.transaction_fee_condition {
            Some(condition) if !fees.is_zero() => {
                miner_payouts.push(MinerPayout {
                    value: fees,
                    unlock_hash: condition.unlock_hash(),
                });
                if !constants.block_creator_fee.is_zero() {
                    miner_payouts.push(MinerPayout {
                        value: constants.block_creator_fee,
                        unlock_hash: self.payout_address,
                    });
                }
            }
            _ => {
                let reward = constants.block_creator_fee.checked_add(&fees).ok()?;
                if !reward.is_zero() {
                    miner_payouts.push(MinerPayout {
                        value: reward,
                        unlock_hash: self.payout_address,
                    });
                }
            }
        }

        Some(Block {
            parent_id: ctx.parent_id,
            nonce: [0u8; 8],
            timestamp,
            pobs: PobsSolution { stake_output_id },
            miner_payouts,
            transactions: transactions.to_vec(),
        })
    }
}
