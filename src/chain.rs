//! Chain store and fork manager.
//!
//! Owns the block DAG, the current unspent-output set and the consensus
//! change log. Every accepted block is validated against the state at its
//! parent; the best chain is the one with the greatest cumulative difficulty
//! (lexicographically least block id on ties). Fork switches revert to the
//! common ancestor and apply the winning branch, emitting one atomic
//! consensus change. A failed candidate never leaves a trace: staging happens
//! on a copy of the set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use parking_lot::RwLock;
use primitive_types::U256;

use crate::block::{self, Block, BlockContext};
use crate::constants::ChainConstants;
use crate::crypto::Hash;
use crate::error::{ConsensusError, Result};
use crate::pobs;
use crate::subscribe::{ChangeLog, ConsensusSubscriber, SubscriptionBus};
use crate::transaction::Transaction;
use crate::types::{
    consensus_change_id, BlockHeight, BlockId, BlockStakeOutputId, ConsensusChangeId, Target,
    Timestamp,
};
use crate::utxo::{
    self, apply_genesis_transaction, BlockDiffs, ConsensusChange, TransactionContext,
    UnspentOutput, UtxoSet,
};

/// Buffered orphans and deferred future blocks are capped; beyond the cap the
/// oldest entry is dropped.
const ORPHAN_LIMIT: usize = 1_024;

/// How a successfully accepted block changed the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockAcceptance {
    /// The block extended the current best tip.
    ExtendedBestChain,
    /// The block was stored on a side branch; the best chain is unchanged.
    SideChain,
    /// The block made its branch the heaviest; the store switched to it.
    Reorganized { reverted: usize, applied: usize },
}

/// Everything the block creator needs to try elections for the next block.
#[derive(Debug, Clone)]
pub struct CreationContext {
    pub parent_id: BlockId,
    pub height: BlockHeight,
    pub median_timestamp: Timestamp,
    pub target: Target,
    pub stake_modifier: Hash,
}

struct BlockNode {
    block: Block,
    height: BlockHeight,
    target: Target,
    cumulative_difficulty: U256,
    diffs: BlockDiffs,
}

struct ChainInner {
    constants: ChainConstants,
    blocks: HashMap<BlockId, BlockNode>,
    /// Best-chain block ids indexed by height.
    best_path: Vec<BlockId>,
    utxo: Arc<UtxoSet>,
    /// Blocks whose parent is unknown, keyed by that parent.
    orphans: HashMap<BlockId, Vec<Block>>,
    orphan_count: usize,
    /// Blocks with a timestamp ahead of the clock, replayed later.
    deferred: Vec<Block>,
    change_seq: u64,
}

/// State of a staged parent: the unspent set at that block, plus the path
/// walked to get there from the current best chain.
struct StagedParent {
    utxo: UtxoSet,
    /// Best-chain ids reverted to reach the fork point, tip first.
    reverted: Vec<BlockId>,
    /// Side-branch ids applied on top of the fork point, ascending.
    applied: Vec<BlockId>,
    fork_height: BlockHeight,
}

pub struct ChainStore {
    inner: RwLock<ChainInner>,
    log: Arc<ChangeLog>,
    bus: SubscriptionBus,
}

fn unix_now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl ChainStore {
    /// Open a store on the given constants, committing the genesis block as
    /// consensus change number one.
    pub fn new(constants: ChainConstants) -> Arc<Self> {
        let genesis = constants.genesis_block();
        let genesis_id = genesis.id();
        let mut utxo = UtxoSet::new();
        let mut diffs = BlockDiffs::default();
        for tx in &genesis.transactions {
            diffs.extend(apply_genesis_transaction(tx, &mut utxo));
        }

        let mut change = ConsensusChange::new(consensus_change_id(1));
        change.applied_blocks.push(genesis.clone());
        change.coin_diffs = diffs.coin_diffs.clone();
        change.block_stake_diffs = diffs.block_stake_diffs.clone();

        let node = BlockNode {
            block: genesis,
            height: 0,
            target: constants.genesis_target,
            cumulative_difficulty: constants.genesis_target.difficulty(),
            diffs,
        };

        let mut blocks = HashMap::new();
        blocks.insert(genesis_id, node);

        let log = Arc::new(ChangeLog::new());
        log.push(change);

        info!("chain store opened at genesis block {genesis_id}");
        Arc::new(ChainStore {
            inner: RwLock::new(ChainInner {
                constants,
                blocks,
                best_path: vec![genesis_id],
                utxo: Arc::new(utxo),
                orphans: HashMap::new(),
                orphan_count: 0,
                deferred: Vec::new(),
                change_seq: 1,
            }),
            bus: SubscriptionBus::new(Arc::clone(&log)),
            log,
        })
    }

    pub fn constants(&self) -> ChainConstants {
        self.inner.read().constants.clone()
    }

    /// Height of the best chain's tip.
    pub fn height(&self) -> BlockHeight {
        (self.inner.read().best_path.len() - 1) as BlockHeight
    }

    pub fn current_block(&self) -> Block {
        let inner = self.inner.read();
        let tip = inner.best_path[inner.best_path.len() - 1];
        inner.blocks[&tip].block.clone()
    }

    pub fn block_at_height(&self, height: BlockHeight) -> Result<Block> {
        let inner = self.inner.read();
        let id = inner
            .best_path
            .get(height as usize)
            .ok_or(ConsensusError::UnknownBlock)?;
        Ok(inner.blocks[id].block.clone())
    }

    /// A known block and its height, on any branch.
    pub fn block(&self, id: &BlockId) -> Result<(Block, BlockHeight)> {
        let inner = self.inner.read();
        let node = inner.blocks.get(id).ok_or(ConsensusError::UnknownBlock)?;
        Ok((node.block.clone(), node.height))
    }

    /// Reference-counted snapshot of the current unspent-output set.
    pub fn current_utxo(&self) -> Arc<UtxoSet> {
        Arc::clone(&self.inner.read().utxo)
    }

    /// The difficulty target a known block was validated against.
    pub fn block_target(&self, id: &BlockId) -> Result<Target> {
        let inner = self.inner.read();
        let node = inner.blocks.get(id).ok_or(ConsensusError::UnknownBlock)?;
        Ok(node.target)
    }

    /// Look up one unspent block-stake output.
    pub fn unspent_block_stake(&self, id: &BlockStakeOutputId) -> Option<UnspentOutput> {
        self.inner.read().utxo.block_stake(id).cloned()
    }

    /// Accept a candidate block using the system clock.
    pub fn accept_block(&self, block: Block) -> Result<BlockAcceptance> {
        self.accept_block_at(block, unix_now())
    }

    /// Accept a candidate block, with an explicit clock for determinism.
    pub fn accept_block_at(&self, block: Block, now: Timestamp) -> Result<BlockAcceptance> {
        let mut inner = self.inner.write();

        self.retry_deferred(&mut inner, now);
        let accepted_id = block.id();
        let acceptance = self.accept_one(&mut inner, block, now)?;
        self.adopt_descendants(&mut inner, accepted_id, now);
        Ok(acceptance)
    }

    /// Trial-apply a transaction set against the current state without
    /// touching it. Returns the change that committing the set would cause.
    pub fn try_transaction_set(&self, txs: &[Transaction]) -> Result<ConsensusChange> {
        let (snapshot, height, timestamp, constants) = {
            let inner = self.inner.read();
            let tip = inner.best_path[inner.best_path.len() - 1];
            (
                Arc::clone(&inner.utxo),
                (inner.best_path.len() - 1) as BlockHeight,
                inner.blocks[&tip].block.timestamp,
                inner.constants.clone(),
            )
        };
        let mut working = (*snapshot).clone();
        let ctx = TransactionContext {
            block_height: height + 1,
            block_timestamp: timestamp,
            constants: &constants,
        };
        let mut change = ConsensusChange::new(ConsensusChangeId::BEGINNING);
        for tx in txs {
            let diffs = utxo::apply_transaction(tx, &mut working, &ctx)?;
            change.coin_diffs.extend(diffs.coin_diffs);
            change.block_stake_diffs.extend(diffs.block_stake_diffs);
        }
        Ok(change)
    }

    /// Register a subscriber; all changes after `cursor` are replayed before
    /// this returns, then live changes follow on the subscriber's worker.
    pub fn subscribe(
        &self,
        subscriber: Arc<dyn ConsensusSubscriber>,
        cursor: ConsensusChangeId,
    ) -> Result<()> {
        self.bus.subscribe(subscriber, cursor)
    }

    /// Changes recorded after `cursor`, for pull-style consumers.
    pub fn changes_since(&self, cursor: ConsensusChangeId) -> Result<Vec<ConsensusChange>> {
        self.log.entries_since(cursor)
    }

    /// Wait for every subscriber to observe all committed changes.
    pub fn flush_subscribers(&self) {
        self.bus.flush();
    }

    /// Stop delivering changes and join subscriber workers.
    pub fn close(&self) {
        self.bus.close();
    }

    /// Context for producing the next block on top of the current tip.
    pub fn creation_context(&self) -> CreationContext {
        let inner = self.inner.read();
        let tip = inner.best_path[inner.best_path.len() - 1];
        let height = inner.best_path.len() as BlockHeight;
        CreationContext {
            parent_id: tip,
            height,
            median_timestamp: inner.median_timestamp_at(tip),
            target: inner.expected_target_at(tip),
            stake_modifier: inner.stake_modifier_at(tip, height),
        }
    }

    // --- internals ---------------------------------------------------------

    fn accept_one(
        &self,
        inner: &mut ChainInner,
        block: Block,
        now: Timestamp,
    ) -> Result<BlockAcceptance> {
        let id = block.id();
        if inner.blocks.contains_key(&id) {
            return Err(ConsensusError::KnownBlock);
        }

        let Some(parent) = inner.blocks.get(&block.parent_id) else {
            // Cheap standalone sanity before buffering an orphan.
            if block.timestamp > now + inner.constants.extreme_future_threshold {
                return Err(ConsensusError::ExtremeFutureTimestamp);
            }
            debug!("buffering orphan block {id}");
            inner.buffer_orphan(block);
            return Err(ConsensusError::OrphanBlock);
        };

        let parent_id = block.parent_id;
        let height = parent.height + 1;
        let expected_target = inner.expected_target_at(parent_id);
        let ctx = BlockContext {
            height,
            median_timestamp: inner.median_timestamp_at(parent_id),
            expected_target,
            stake_modifier: inner.stake_modifier_at(parent_id, height),
            now,
            constants: &inner.constants,
        };

        let mut staged = inner.state_at(parent_id)?;
        match block::validate_block_header(&block, &ctx, &staged.utxo) {
            Err(ConsensusError::FutureTimestamp) => {
                debug!("deferring future block {id}");
                inner.buffer_deferred(block);
                return Err(ConsensusError::FutureTimestamp);
            }
            other => other?,
        }
        let diffs = block::apply_block(&block, &mut staged.utxo, &ctx)?;

        let cumulative_difficulty = inner.blocks[&parent_id]
            .cumulative_difficulty
            .checked_add(expected_target.difficulty())
            .unwrap_or(U256::MAX);
        inner.blocks.insert(
            id,
            BlockNode {
                block,
                height,
                target: expected_target,
                cumulative_difficulty,
                diffs,
            },
        );

        let tip = inner.best_path[inner.best_path.len() - 1];
        let tip_weight = (
            inner.blocks[&tip].cumulative_difficulty,
            std::cmp::Reverse(tip.0),
        );
        let candidate_weight = (cumulative_difficulty, std::cmp::Reverse(id.0));
        if candidate_weight <= tip_weight {
            debug!("block {id} stored on a side chain at height {height}");
            return Ok(BlockAcceptance::SideChain);
        }

        // The candidate's branch wins: commit the staged state atomically.
        staged.applied.push(id);
        let reverted_count = staged.reverted.len();
        let applied_count = staged.applied.len();
        inner.commit(staged, &self.log);

        if reverted_count > 0 {
            info!(
                "reorganized to block {id}: reverted {reverted_count} blocks, applied {applied_count}"
            );
            Ok(BlockAcceptance::Reorganized {
                reverted: reverted_count,
                applied: applied_count,
            })
        } else {
            debug!("block {id} extends the best chain at height {height}");
            Ok(BlockAcceptance::ExtendedBestChain)
        }
    }

    /// Re-attempt orphans unlocked by a newly known block, recursively.
    fn adopt_descendants(&self, inner: &mut ChainInner, root: BlockId, now: Timestamp) {
        let mut queue = vec![root];
        while let Some(parent_id) = queue.pop() {
            let Some(children) = inner.orphans.remove(&parent_id) else {
                continue;
            };
            inner.orphan_count -= children.len();
            for child in children {
                let child_id = child.id();
                match self.accept_one(inner, child, now) {
                    Ok(_) => queue.push(child_id),
                    Err(err) => debug!("orphan {child_id} still not acceptable: {err}"),
                }
            }
        }
    }

    fn retry_deferred(&self, inner: &mut ChainInner, now: Timestamp) {
        if inner.deferred.is_empty() {
            return;
        }
        let threshold = now + inner.constants.future_threshold;
        let ready: Vec<Block> = {
            let (ready, still): (Vec<Block>, Vec<Block>) = inner
                .deferred
                .drain(..)
                .partition(|b| b.timestamp <= threshold);
            inner.deferred = still;
            ready
        };
        for block in ready {
            let id = block.id();
            if let Err(err) = self.accept_one(inner, block, now) {
                debug!("deferred block {id} rejected on replay: {err}");
            } else {
                self.adopt_descendants(inner, id, now);
            }
        }
    }
}

impl Drop for ChainStore {
    fn drop(&mut self) {
        self.close();
    }
}

impl ChainInner {
    fn buffer_orphan(&mut self, block: Block) {
        if self.orphan_count >= ORPHAN_LIMIT {
            if let Some(key) = self.orphans.keys().next().copied() {
                if let Some(dropped) = self.orphans.remove(&key) {
                    self.orphan_count -= dropped.len();
                    warn!("orphan buffer full, dropped {} blocks", dropped.len());
                }
            }
        }
        let children = self.orphans.entry(block.parent_id).or_default();
        if children.iter().any(|b| b.id() == block.id()) {
            return;
        }
        children.push(block);
        self.orphan_count += 1;
    }

    fn buffer_deferred(&mut self, block: Block) {
        if self.deferred.len() >= ORPHAN_LIMIT {
            self.deferred.remove(0);
        }
        if self.deferred.iter().any(|b| b.id() == block.id()) {
            return;
        }
        self.deferred.push(block);
    }

    /// Walk ancestors from `start` (inclusive), yielding up to `limit` ids.
    fn ancestors(&self, start: BlockId, limit: usize) -> Vec<BlockId> {
        let mut out = Vec::new();
        let mut cursor = start;
        while out.len() < limit {
            out.push(cursor);
            let node = &self.blocks[&cursor];
            if node.height == 0 {
                break;
            }
            cursor = node.block.parent_id;
        }
        out
    }

    fn median_timestamp_at(&self, parent_id: BlockId) -> Timestamp {
        let window = self.constants.median_timestamp_window;
        let mut timestamps: Vec<Timestamp> = self
            .ancestors(parent_id, window)
            .iter()
            .map(|id| self.blocks[id].block.timestamp)
            .collect();
        block::median_timestamp(&mut timestamps)
    }

    fn expected_target_at(&self, parent_id: BlockId) -> Target {
        let window = self.constants.target_window as usize;
        let ids = self.ancestors(parent_id, window);
        let newest = self.blocks[&ids[0]].block.timestamp;
        let oldest_id = ids.last().copied().unwrap_or(parent_id);
        let oldest = self.blocks[&oldest_id].block.timestamp;
        let parent_target = self.blocks[&parent_id].target;
        pobs::next_target(
            &parent_target,
            oldest,
            newest,
            ids.len() as u64,
            &self.constants,
        )
    }

    fn stake_modifier_at(&self, parent_id: BlockId, height: BlockHeight) -> Hash {
        let depth = self.constants.stake_modifier_depth();
        let anchor_height = height.saturating_sub(depth);
        let steps = self.blocks[&parent_id].height - anchor_height;
        let ids = self.ancestors(parent_id, steps as usize + 1);
        let anchor = ids.last().copied().unwrap_or(parent_id);
        pobs::stake_modifier(&anchor)
    }

    fn on_best_path(&self, id: &BlockId) -> bool {
        let node = &self.blocks[id];
        self.best_path.get(node.height as usize) == Some(id)
    }

    /// Stage the unspent set as it was at `parent_id`, reverting and applying
    /// cached diffs as needed. The current set is never touched.
    fn state_at(&self, parent_id: BlockId) -> Result<StagedParent> {
        let mut staging = (*self.utxo).clone();

        if self.on_best_path(&parent_id) {
            // Parent sits on the best chain: unwind everything above it.
            let parent_height = self.blocks[&parent_id].height as usize;
            let mut reverted = Vec::new();
            for id in self.best_path[parent_height + 1..].iter().rev() {
                utxo::revert_diffs(&mut staging, &self.blocks[id].diffs)?;
                reverted.push(*id);
            }
            return Ok(StagedParent {
                utxo: staging,
                reverted,
                applied: Vec::new(),
                fork_height: parent_height as BlockHeight,
            });
        }

        // Side-chain parent: walk down to the fork point, then revert the
        // best chain above it and replay the side branch.
        let mut side_branch = Vec::new();
        let mut cursor = parent_id;
        while !self.on_best_path(&cursor) {
            side_branch.push(cursor);
            cursor = self.blocks[&cursor].block.parent_id;
        }
        side_branch.reverse();
        let fork_height = self.blocks[&cursor].height;

        let mut reverted = Vec::new();
        for id in self.best_path[fork_height as usize + 1..].iter().rev() {
            utxo::revert_diffs(&mut staging, &self.blocks[id].diffs)?;
            reverted.push(*id);
        }
        for id in &side_branch {
            utxo::apply_diffs(&mut staging, &self.blocks[id].diffs)?;
        }
        Ok(StagedParent {
            utxo: staging,
            reverted,
            applied: side_branch,
            fork_height,
        })
    }

    /// Swap in the staged state and publish one consensus change.
    fn commit(&mut self, staged: StagedParent, log: &ChangeLog) {
        self.change_seq += 1;
        let mut change = ConsensusChange::new(consensus_change_id(self.change_seq));

        for id in &staged.reverted {
            let node = &self.blocks[id];
            change.reverted_blocks.push(node.block.clone());
            let inverted = utxo::inverted_diffs(&node.diffs);
            change.coin_diffs.extend(inverted.coin_diffs);
            change.block_stake_diffs.extend(inverted.block_stake_diffs);
        }
        for id in &staged.applied {
            let node = &self.blocks[id];
            change.applied_blocks.push(node.block.clone());
            change.coin_diffs.extend(node.diffs.coin_diffs.clone());
            change
                .block_stake_diffs
                .extend(node.diffs.block_stake_diffs.clone());
        }

        self.best_path.truncate(staged.fork_height as usize + 1);
        self.best_path.extend(staged.applied.iter().copied());
        self.utxo = Arc::new(staged.utxo);
        log.push(change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{MinerPayout, PobsSolution};
    use crate::condition::{SingleSignatureFulfillment, UnlockCondition, UnlockFulfillment};
    use crate::constants::devnet_signing_key;
    use crate::crypto::PublicKey;
    use crate::transaction::{CoinInput, CoinOutput};
    use crate::types::{Currency, UnlockHash};

    fn constants() -> ChainConstants {
        ChainConstants::devnet()
    }

    fn devnet_address() -> UnlockHash {
        UnlockHash::from_public_key(&PublicKey::from_signing_key(&devnet_signing_key()))
    }

    /// A block extending `parent`, at `seconds` past genesis, with the given
    /// transactions. Devnet's root-depth target makes any stake output a
    /// winning election.
    fn make_block(
        chain: &ChainStore,
        parent: &Block,
        seconds: u64,
        txs: Vec<Transaction>,
        nonce: u8,
    ) -> Block {
        let constants = chain.constants();
        let genesis_tx = constants.genesis_transaction();
        let mut fees = Currency::zero();
        for tx in &txs {
            fees = fees.checked_add(&tx.total_fee().unwrap()).unwrap();
        }
        let reward = constants.block_creator_fee.checked_add(&fees).unwrap();
        let miner_payouts = if reward.is_zero() {
            Vec::new()
        } else {
            vec![MinerPayout {
                value: reward,
                unlock_hash: devnet_address(),
            }]
        };
        Block {
            parent_id: parent.id(),
            nonce: [nonce; 8],
            timestamp: constants.genesis_timestamp + seconds,
            pobs: PobsSolution {
                stake_output_id: genesis_tx.block_stake_output_id(0),
            },
            miner_payouts,
            transactions: txs,
        }
    }

    fn now_for(constants: &ChainConstants, seconds: u64) -> Timestamp {
        constants.genesis_timestamp + seconds
    }

    /// A signed transfer of the devnet genesis coins.
    fn genesis_spend(constants: &ChainConstants, to: UnlockHash, fee: u64) -> Transaction {
        let genesis_tx = constants.genesis_transaction();
        let total = constants.genesis_coin_distribution[0].value;
        let mut tx = Transaction::new_v1();
        tx.coin_inputs.push(CoinInput {
            parent_id: genesis_tx.coin_output_id(0),
            fulfillment: UnlockFulfillment::SingleSignature(SingleSignatureFulfillment {
                public_key: PublicKey::from_signing_key(&devnet_signing_key()),
                signature: Vec::new(),
            }),
        });
        tx.coin_outputs.push(CoinOutput {
            value: total.checked_sub(&Currency::new(fee)).unwrap(),
            condition: UnlockCondition::UnlockHash(to),
        });
        tx.miner_fees.push(Currency::new(fee));
        let mut fulfillment = tx.coin_inputs[0].fulfillment.clone();
        fulfillment.sign(&tx, 0, &devnet_signing_key()).unwrap();
        tx.coin_inputs[0].fulfillment = fulfillment;
        tx
    }

    #[test]
    fn genesis_is_committed_on_open() {
        let chain = ChainStore::new(constants());
        assert_eq!(chain.height(), 0);
        let changes = chain.changes_since(ConsensusChangeId::BEGINNING).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].applied_blocks.len(), 1);
        assert!(!changes[0].coin_diffs.is_empty());
    }

    #[test]
    fn extends_the_best_chain() {
        let chain = ChainStore::new(constants());
        let genesis = chain.current_block();
        let b1 = make_block(&chain, &genesis, 30, vec![], 1);
        let acceptance = chain
            .accept_block_at(b1.clone(), now_for(&chain.constants(), 40))
            .unwrap();
        assert_eq!(acceptance, BlockAcceptance::ExtendedBestChain);
        assert_eq!(chain.height(), 1);
        assert_eq!(chain.current_block().id(), b1.id());
    }

    #[test]
    fn duplicate_blocks_are_rejected() {
        let chain = ChainStore::new(constants());
        let genesis = chain.current_block();
        let b1 = make_block(&chain, &genesis, 30, vec![], 1);
        let now = now_for(&chain.constants(), 40);
        chain.accept_block_at(b1.clone(), now).unwrap();
        assert_eq!(
            chain.accept_block_at(b1, now),
            Err(ConsensusError::KnownBlock)
        );
    }

    #[test]
    fn orphans_are_adopted_when_the_parent_arrives() {
        let chain = ChainStore::new(constants());
        let genesis = chain.current_block();
        let b1 = make_block(&chain, &genesis, 30, vec![], 1);
        let b2 = make_block(&chain, &b1, 60, vec![], 2);
        let now = now_for(&chain.constants(), 90);
        assert_eq!(
            chain.accept_block_at(b2.clone(), now),
            Err(ConsensusError::OrphanBlock)
        );
        assert_eq!(chain.height(), 0);
        chain.accept_block_at(b1, now).unwrap();
        assert_eq!(chain.height(), 2);
        assert_eq!(chain.current_block().id(), b2.id());
    }

    #[test]
    fn transactions_move_the_utxo_set() {
        let chain = ChainStore::new(constants());
        let constants = chain.constants();
        let genesis = chain.current_block();
        let to = UnlockHash::new(crate::types::UnlockType::PUB_KEY, [9; 32]);
        let tx = genesis_spend(&constants, to, 100_000_000);
        let new_output = tx.coin_output_id(0);
        let b1 = make_block(&chain, &genesis, 30, vec![tx], 1);
        chain
            .accept_block_at(b1, now_for(&constants, 40))
            .unwrap();
        let utxo = chain.current_utxo();
        assert!(utxo.coin(&new_output).is_some());
        assert!(utxo
            .coin(&constants.genesis_transaction().coin_output_id(0))
            .is_none());
    }

    #[test]
    fn invalid_transaction_rejects_the_whole_block() {
        let chain = ChainStore::new(constants());
        let constants = chain.constants();
        let genesis = chain.current_block();
        let mut tx = genesis_spend(&constants, devnet_address(), 100_000_000);
        // Break the signature after signing.
        if let UnlockFulfillment::SingleSignature(f) = &mut tx.coin_inputs[0].fulfillment {
            f.signature[0] ^= 0xFF;
        }
        let b1 = make_block(&chain, &genesis, 30, vec![tx], 1);
        assert!(chain.accept_block_at(b1, now_for(&constants, 40)).is_err());
        assert_eq!(chain.height(), 0);
        // The failed candidate left no trace.
        assert_eq!(
            chain.current_utxo().coin_count(),
            constants.genesis_coin_distribution.len()
        );
    }

    #[test]
    fn heavier_side_chain_triggers_a_reorg() {
        let chain = ChainStore::new(constants());
        let constants = chain.constants();
        let genesis = chain.current_block();
        let now = now_for(&constants, 300);

        let b1 = make_block(&chain, &genesis, 30, vec![], 1);
        let b2 = make_block(&chain, &b1, 60, vec![], 2);
        chain.accept_block_at(b1.clone(), now).unwrap();
        chain.accept_block_at(b2.clone(), now).unwrap();
        assert_eq!(chain.height(), 2);

        // A competing branch of three blocks from genesis. The middle block
        // ties with b2 in cumulative difficulty; pick a nonce that loses the
        // lexicographic tie-break so the branch only wins at length three.
        let c1 = make_block(&chain, &genesis, 40, vec![], 11);
        let c2 = (12..=255u8)
            .map(|nonce| make_block(&chain, &c1, 70, vec![], nonce))
            .find(|candidate| candidate.id().0 > b2.id().0)
            .unwrap();
        let c3 = make_block(&chain, &c2, 100, vec![], 13);
        assert_eq!(
            chain.accept_block_at(c1.clone(), now).unwrap(),
            BlockAcceptance::SideChain
        );
        assert_eq!(
            chain.accept_block_at(c2.clone(), now).unwrap(),
            BlockAcceptance::SideChain
        );
        let acceptance = chain.accept_block_at(c3.clone(), now).unwrap();
        assert_eq!(
            acceptance,
            BlockAcceptance::Reorganized {
                reverted: 2,
                applied: 3
            }
        );
        assert_eq!(chain.height(), 3);
        assert_eq!(chain.current_block().id(), c3.id());

        // One atomic change describes the whole switch.
        let changes = chain.changes_since(ConsensusChangeId::BEGINNING).unwrap();
        let reorg = changes.last().unwrap();
        assert_eq!(
            reorg.reverted_blocks.iter().map(|b| b.id()).collect::<Vec<_>>(),
            vec![b2.id(), b1.id()]
        );
        assert_eq!(
            reorg.applied_blocks.iter().map(|b| b.id()).collect::<Vec<_>>(),
            vec![c1.id(), c2.id(), c3.id()]
        );
    }

    #[test]
    fn fork_switch_and_back_restores_state() {
        let chain = ChainStore::new(constants());
        let constants = chain.constants();
        let genesis = chain.current_block();
        let now = now_for(&constants, 1_000);

        let b1 = make_block(&chain, &genesis, 30, vec![], 1);
        chain.accept_block_at(b1.clone(), now).unwrap();
        let state_a = (*chain.current_utxo()).clone();

        // Switch to a heavier branch, then extend the original branch past it.
        let c1 = make_block(&chain, &genesis, 40, vec![], 11);
        let c2 = make_block(&chain, &c1, 70, vec![], 12);
        chain.accept_block_at(c1, now).unwrap();
        chain.accept_block_at(c2, now).unwrap();
        assert_ne!(chain.current_block().id(), b1.id());

        let b2 = make_block(&chain, &b1, 60, vec![], 2);
        let b3 = make_block(&chain, &b2, 90, vec![], 3);
        chain.accept_block_at(b2.clone(), now).unwrap();
        chain.accept_block_at(b3.clone(), now).unwrap();
        assert_eq!(chain.current_block().id(), b3.id());

        // Reverting b3 and b2 in memory must land exactly on state_a.
        let staged = chain.inner.read().state_at(b1.id()).unwrap();
        assert_eq!(staged.utxo, state_a);
    }

    #[test]
    fn future_blocks_are_deferred_and_replayed() {
        let chain = ChainStore::new(constants());
        let constants = chain.constants();
        let genesis = chain.current_block();
        // Timestamp farther ahead than the clock allows right now.
        let b1 = make_block(&chain, &genesis, constants.future_threshold + 60, vec![], 1);
        assert_eq!(
            chain.accept_block_at(b1.clone(), now_for(&constants, 30)),
            Err(ConsensusError::FutureTimestamp)
        );
        assert_eq!(chain.height(), 0);

        // Later the clock catches up; the next accept replays it first, so a
        // child of the deferred block lands right on top of it.
        let b2 = make_block(&chain, &b1, constants.future_threshold + 90, vec![], 2);
        let late_now = now_for(&constants, constants.future_threshold + 120);
        chain.accept_block_at(b2.clone(), late_now).unwrap();
        assert_eq!(chain.height(), 2);
        assert_eq!(chain.block_at_height(1).unwrap().id(), b1.id());
        assert_eq!(chain.current_block().id(), b2.id());
    }

    #[test]
    fn try_transaction_set_leaves_state_untouched() {
        let chain = ChainStore::new(constants());
        let constants = chain.constants();
        let tx = genesis_spend(&constants, devnet_address(), 100_000_000);
        let before = (*chain.current_utxo()).clone();
        let change = chain.try_transaction_set(std::slice::from_ref(&tx)).unwrap();
        assert!(!change.coin_diffs.is_empty());
        assert_eq!((*chain.current_utxo()).clone(), before);

        // A conflicting second spend of the same output fails the trial.
        let double = vec![tx.clone(), tx];
        assert!(chain.try_transaction_set(&double).is_err());
    }

    #[test]
    fn conservation_of_both_assets() {
        let chain = ChainStore::new(constants());
        let constants = chain.constants();
        let genesis = chain.current_block();
        let initial_coins = chain.current_utxo().total_coins().unwrap();
        let stake_supply = constants.genesis_block_stake_count().unwrap();

        let tx = genesis_spend(&constants, devnet_address(), 100_000_000);
        let b1 = make_block(&chain, &genesis, 30, vec![tx], 1);
        chain.accept_block_at(b1, now_for(&constants, 40)).unwrap();

        // Devnet mints nothing per block, so fees return as payouts and the
        // coin supply is unchanged; the stake supply never moves.
        let utxo = chain.current_utxo();
        assert_eq!(
            utxo.total_coins().unwrap(),
            initial_coins
                .checked_add(&constants.block_creator_fee)
                .unwrap()
        );
        assert_eq!(utxo.total_block_stakes().unwrap(), stake_supply);
    }
}
