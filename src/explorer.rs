//! Explorer indexer: reverse lookups derived from the consensus stream.
//!
//! The explorer subscribes to the chain store and folds every consensus
//! change into a secondary store: blocks by id, height and timestamp,
//! transactions, outputs with their spenditure, per-address wallets, atomic
//! swap contracts and chain-wide aggregated facts. Every apply has an exact
//! inverse, including the internal data-id counter, so a revert leaves the
//! store as if the block had never been seen.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::warn;
use parking_lot::RwLock;
use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::chain::ChainStore;
use crate::condition::{AtomicSwapCondition, UnlockCondition, UnlockFulfillment};
use crate::constants::ChainConstants;
use crate::error::{ConsensusError, Result};
use crate::subscribe::ConsensusSubscriber;
use crate::types::{
    AssetKind, BlockHeight, BlockId, CoinOutputId, ConsensusChangeId, Currency, OutputId,
    Timestamp, TransactionId, UnlockHash, LOCK_TIME_THRESHOLD,
};
use crate::utxo::ConsensusChange;

/// A block position named either by height or by timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferencePoint {
    Height(BlockHeight),
    Timestamp(Timestamp),
}

/// Chain-wide aggregated facts, maintained incrementally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainFacts {
    pub height: BlockHeight,
    #[serde(rename = "blockid")]
    pub block_id: BlockId,
    #[serde(rename = "totalcoins")]
    pub total_coins: Currency,
    #[serde(rename = "totallockedcoins")]
    pub total_locked_coins: Currency,
    #[serde(rename = "totalblockstakes")]
    pub total_block_stakes: Currency,
    #[serde(rename = "totallockedblockstakes")]
    pub total_locked_block_stakes: Currency,
    #[serde(rename = "estimatedactiveblockstakes")]
    pub estimated_active_block_stakes: Currency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletKind {
    FreeForAll,
    SingleSignature,
    MultiSignature,
}

/// Everything indexed about one address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletFacts {
    pub kind: WalletKind,
    pub unlocked_coins: Currency,
    pub locked_coins: Currency,
    pub unlocked_block_stakes: Currency,
    pub locked_block_stakes: Currency,
    /// Transactions touching this address, oldest first.
    pub transaction_ids: Vec<TransactionId>,
    /// Multisig wallets this address co-owns.
    pub multisig_addresses: Vec<UnlockHash>,
    /// Owner addresses, for multisig wallets.
    pub owners: Vec<UnlockHash>,
    pub data_id: u64,
}

impl WalletFacts {
    fn new(kind: WalletKind, data_id: u64) -> Self {
        WalletFacts {
            kind,
            unlocked_coins: Currency::zero(),
            locked_coins: Currency::zero(),
            unlocked_block_stakes: Currency::zero(),
            locked_block_stakes: Currency::zero(),
            transaction_ids: Vec::new(),
            multisig_addresses: Vec::new(),
            owners: Vec::new(),
            data_id,
        }
    }

    fn is_empty(&self) -> bool {
        self.unlocked_coins.is_zero()
            && self.locked_coins.is_zero()
            && self.unlocked_block_stakes.is_zero()
            && self.locked_block_stakes.is_zero()
            && self.transaction_ids.is_empty()
    }
}

/// Who spent an output, and with what proof. The fulfillment is kept so
/// secrets revealed by atomic-swap claims can be extracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spenditure {
    pub transaction_id: TransactionId,
    pub height: BlockHeight,
    pub fulfillment: UnlockFulfillment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplorerOutput {
    pub kind: AssetKind,
    pub value: Currency,
    pub condition: UnlockCondition,
    /// The transaction that created this output; miner payouts have none.
    pub creation_transaction: Option<TransactionId>,
    pub creation_block: BlockId,
    pub creation_height: BlockHeight,
    /// Filled while the output is locked by a time lock or maturity delay.
    pub locked: bool,
    pub spenditure: Option<Spenditure>,
    pub data_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplorerTransaction {
    pub block_id: BlockId,
    pub height: BlockHeight,
    pub data_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplorerBlock {
    pub height: BlockHeight,
    pub timestamp: Timestamp,
    pub parent_id: BlockId,
    pub transaction_ids: Vec<TransactionId>,
    pub miner_payout_ids: Vec<CoinOutputId>,
    /// Outputs whose lock expired at this block, for re-locking on revert.
    pub unlocked_outputs: Vec<OutputId>,
    /// Data-id watermark before this block; revert rewinds the counter here.
    pub first_data_id: u64,
    pub data_id: u64,
}

/// An atomic-swap contract observed on chain, keyed by its address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomicSwapContract {
    pub condition: AtomicSwapCondition,
    pub coin_output_id: CoinOutputId,
    /// The secret revealed by the claim, if the contract was claimed.
    pub secret: Option<[u8; 32]>,
    pub spent_by: Option<TransactionId>,
    pub data_id: u64,
}

struct ExplorerInner {
    constants: ChainConstants,
    facts: ChainFacts,
    blocks: HashMap<BlockId, ExplorerBlock>,
    blocks_by_height: BTreeMap<BlockHeight, BlockId>,
    /// Blocks per timestamp, in application order. Two consecutive blocks may
    /// legally share a timestamp, so this is a multimap: applying never
    /// displaces an earlier entry and reverting removes only its own.
    blocks_by_timestamp: BTreeMap<Timestamp, Vec<BlockId>>,
    transactions: HashMap<TransactionId, ExplorerTransaction>,
    outputs: HashMap<OutputId, ExplorerOutput>,
    wallets: HashMap<UnlockHash, WalletFacts>,
    contracts: HashMap<UnlockHash, AtomicSwapContract>,
    /// Pending unlocks, scheduled by height or timestamp.
    locked_by_height: BTreeMap<BlockHeight, Vec<OutputId>>,
    locked_by_time: BTreeMap<Timestamp, Vec<OutputId>>,
    /// Per-height (timestamp, difficulty) history backing the active-stake
    /// estimate; truncated on revert.
    difficulty_history: Vec<(Timestamp, U256)>,
    last_data_id: u64,
    last_change: ConsensusChangeId,
    /// Set when a change could not be folded in; the index stops advancing.
    broken: bool,
}

/// The explorer module: a consensus subscriber plus a query surface.
pub struct Explorer {
    chain: Arc<ChainStore>,
    inner: RwLock<ExplorerInner>,
}

impl Explorer {
    /// Open an explorer on `chain`; the whole chain history is folded in
    /// before this returns.
    pub fn new(chain: Arc<ChainStore>) -> Result<Arc<Self>> {
        let constants = chain.constants();
        let explorer = Arc::new(Explorer {
            chain: Arc::clone(&chain),
            inner: RwLock::new(ExplorerInner {
                constants,
                facts: ChainFacts::default(),
                blocks: HashMap::new(),
                blocks_by_height: BTreeMap::new(),
                blocks_by_timestamp: BTreeMap::new(),
                transactions: HashMap::new(),
                outputs: HashMap::new(),
                wallets: HashMap::new(),
                contracts: HashMap::new(),
                locked_by_height: BTreeMap::new(),
                locked_by_time: BTreeMap::new(),
                difficulty_history: Vec::new(),
                last_data_id: 0,
                last_change: ConsensusChangeId::BEGINNING,
                broken: false,
            }),
        });
        chain.subscribe(explorer.clone(), ConsensusChangeId::BEGINNING)?;
        Ok(explorer)
    }

    pub fn facts(&self) -> ChainFacts {
        self.inner.read().facts.clone()
    }

    pub fn block(&self, id: &BlockId) -> Option<ExplorerBlock> {
        self.inner.read().blocks.get(id).cloned()
    }

    /// Resolve a reference point to a block id: exact for heights, the
    /// newest block at or before the instant for timestamps.
    pub fn block_at(&self, point: ReferencePoint) -> Option<BlockId> {
        let inner = self.inner.read();
        match point {
            ReferencePoint::Height(height) => inner.blocks_by_height.get(&height).copied(),
            ReferencePoint::Timestamp(ts) => inner
                .blocks_by_timestamp
                .range(..=ts)
                .next_back()
                .and_then(|(_, ids)| ids.last().copied()),
        }
    }

    pub fn transaction(&self, id: &TransactionId) -> Option<ExplorerTransaction> {
        self.inner.read().transactions.get(id).cloned()
    }

    pub fn output(&self, id: &OutputId) -> Option<ExplorerOutput> {
        self.inner.read().outputs.get(id).cloned()
    }

    pub fn wallet(&self, address: &UnlockHash) -> Option<WalletFacts> {
        self.inner.read().wallets.get(address).cloned()
    }

    pub fn contract(&self, address: &UnlockHash) -> Option<AtomicSwapContract> {
        self.inner.read().contracts.get(address).cloned()
    }

    /// Cursor of the last folded change, the resume point after a restart.
    pub fn last_consensus_change(&self) -> ConsensusChangeId {
        self.inner.read().last_change
    }

    /// True when a change failed to fold and the index stopped advancing.
    pub fn is_broken(&self) -> bool {
        self.inner.read().broken
    }

    #[cfg(test)]
    fn last_data_id(&self) -> u64 {
        self.inner.read().last_data_id
    }
}

impl ConsensusSubscriber for Explorer {
    fn process_consensus_change(&self, change: &ConsensusChange) {
        let mut inner = self.inner.write();
        if inner.broken {
            return;
        }
        for block in &change.reverted_blocks {
            if let Err(err) = inner.revert_block(block) {
                warn!("explorer failed to revert block {}: {err}", block.id());
                inner.broken = true;
                return;
            }
        }
        for block in &change.applied_blocks {
            let target = self
                .chain
                .block_target(&block.id())
                .unwrap_or(inner.constants.genesis_target);
            if let Err(err) = inner.apply_block(block, target.difficulty()) {
                warn!("explorer failed to apply block {}: {err}", block.id());
                inner.broken = true;
                return;
            }
        }
        inner.last_change = change.id;
    }
}

/// Strip time-lock wrappers: addressing and ownership are transparent to
/// them.
fn inner_condition(condition: &UnlockCondition) -> &UnlockCondition {
    match condition {
        UnlockCondition::TimeLock(tl) => inner_condition(&tl.condition),
        other => other,
    }
}

fn wallet_kind(condition: &UnlockCondition) -> WalletKind {
    match inner_condition(condition) {
        UnlockCondition::Nil => WalletKind::FreeForAll,
        UnlockCondition::MultiSignature(_) => WalletKind::MultiSignature,
        _ => WalletKind::SingleSignature,
    }
}

/// When an output's lock expires, if it is locked at all: height, timestamp,
/// or a maturity height for miner payouts.
enum LockState {
    Unlocked,
    UntilHeight(BlockHeight),
    UntilTime(Timestamp),
}

fn lock_state(
    condition: &UnlockCondition,
    maturity: Option<BlockHeight>,
    height: BlockHeight,
    timestamp: Timestamp,
) -> LockState {
    if let Some(maturity_height) = maturity {
        if maturity_height > height {
            return LockState::UntilHeight(maturity_height);
        }
    }
    if let UnlockCondition::TimeLock(tl) = condition {
        if tl.lock_time < LOCK_TIME_THRESHOLD {
            if tl.lock_time > height {
                return LockState::UntilHeight(tl.lock_time);
            }
        } else if tl.lock_time > timestamp {
            return LockState::UntilTime(tl.lock_time);
        }
    }
    LockState::Unlocked
}

/// The secret a fulfillment revealed, when there is one.
fn revealed_secret(fulfillment: &UnlockFulfillment) -> Option<[u8; 32]> {
    match fulfillment {
        UnlockFulfillment::AtomicSwap(f) if f.secret != [0u8; 32] => Some(f.secret),
        UnlockFulfillment::LegacyAtomicSwap(f) if f.secret != [0u8; 32] => Some(f.secret),
        UnlockFulfillment::TimeLock(inner) => revealed_secret(inner),
        _ => None,
    }
}

impl ExplorerInner {
    fn next_data_id(&mut self) -> u64 {
        self.last_data_id += 1;
        self.last_data_id
    }

    fn wallet_mut(&mut self, address: UnlockHash, kind: WalletKind) -> &mut WalletFacts {
        let candidate_id = self.last_data_id + 1;
        let wallet = self
            .wallets
            .entry(address)
            .or_insert_with(|| WalletFacts::new(kind, candidate_id));
        if wallet.data_id == candidate_id {
            self.last_data_id = candidate_id;
        }
        wallet
    }

    fn note_wallet_transaction(&mut self, address: UnlockHash, kind: WalletKind, tx: TransactionId) {
        let wallet = self.wallet_mut(address, kind);
        if wallet.transaction_ids.last() != Some(&tx) {
            wallet.transaction_ids.push(tx);
        }
    }

    fn credit(
        &mut self,
        address: UnlockHash,
        kind: WalletKind,
        asset: AssetKind,
        value: &Currency,
        locked: bool,
    ) -> Result<()> {
        let wallet = self.wallet_mut(address, kind);
        let slot = match (asset, locked) {
            (AssetKind::Coin, false) => &mut wallet.unlocked_coins,
            (AssetKind::Coin, true) => &mut wallet.locked_coins,
            (AssetKind::BlockStake, false) => &mut wallet.unlocked_block_stakes,
            (AssetKind::BlockStake, true) => &mut wallet.locked_block_stakes,
        };
        *slot = slot.checked_add(value)?;
        Ok(())
    }

    fn debit(
        &mut self,
        address: UnlockHash,
        kind: WalletKind,
        asset: AssetKind,
        value: &Currency,
        locked: bool,
    ) -> Result<()> {
        let wallet = self.wallet_mut(address, kind);
        let slot = match (asset, locked) {
            (AssetKind::Coin, false) => &mut wallet.unlocked_coins,
            (AssetKind::Coin, true) => &mut wallet.locked_coins,
            (AssetKind::BlockStake, false) => &mut wallet.unlocked_block_stakes,
            (AssetKind::BlockStake, true) => &mut wallet.locked_block_stakes,
        };
        *slot = slot.checked_sub(value)?;
        Ok(())
    }

    fn adjust_facts_created(&mut self, asset: AssetKind, value: &Currency, locked: bool) -> Result<()> {
        match asset {
            AssetKind::Coin => {
                self.facts.total_coins = self.facts.total_coins.checked_add(value)?;
                if locked {
                    self.facts.total_locked_coins =
                        self.facts.total_locked_coins.checked_add(value)?;
                }
            }
            AssetKind::BlockStake => {
                self.facts.total_block_stakes = self.facts.total_block_stakes.checked_add(value)?;
                if locked {
                    self.facts.total_locked_block_stakes =
                        self.facts.total_locked_block_stakes.checked_add(value)?;
                }
            }
        }
        Ok(())
    }

    fn adjust_facts_spent(&mut self, asset: AssetKind, value: &Currency, locked: bool) -> Result<()> {
        match asset {
            AssetKind::Coin => {
                self.facts.total_coins = self.facts.total_coins.checked_sub(value)?;
                if locked {
                    self.facts.total_locked_coins =
                        self.facts.total_locked_coins.checked_sub(value)?;
                }
            }
            AssetKind::BlockStake => {
                self.facts.total_block_stakes = self.facts.total_block_stakes.checked_sub(value)?;
                if locked {
                    self.facts.total_locked_block_stakes =
                        self.facts.total_locked_block_stakes.checked_sub(value)?;
                }
            }
        }
        Ok(())
    }

    /// Register one created output and all its side effects.
    #[allow(clippy::too_many_arguments)]
    fn index_created_output(
        &mut self,
        id: OutputId,
        kind: AssetKind,
        value: Currency,
        condition: UnlockCondition,
        creation_transaction: Option<TransactionId>,
        block_id: BlockId,
        height: BlockHeight,
        timestamp: Timestamp,
        maturity: Option<BlockHeight>,
    ) -> Result<()> {
        let state = lock_state(&condition, maturity, height, timestamp);
        let locked = !matches!(state, LockState::Unlocked);
        match state {
            LockState::UntilHeight(h) => {
                self.locked_by_height.entry(h).or_default().push(id);
            }
            LockState::UntilTime(t) => {
                self.locked_by_time.entry(t).or_default().push(id);
            }
            LockState::Unlocked => {}
        }

        let address = condition.unlock_hash();
        let kind_of_wallet = wallet_kind(&condition);
        self.credit(address, kind_of_wallet, kind, &value, locked)?;
        self.adjust_facts_created(kind, &value, locked)?;

        // Multisig outputs link the wallet to its owners both ways.
        if let UnlockCondition::MultiSignature(ms) = inner_condition(&condition) {
            let owners = ms.unlock_hashes.clone();
            for owner in &owners {
                let owner_wallet = self.wallet_mut(*owner, WalletKind::SingleSignature);
                if !owner_wallet.multisig_addresses.contains(&address) {
                    owner_wallet.multisig_addresses.push(address);
                }
            }
            let wallet = self.wallet_mut(address, WalletKind::MultiSignature);
            wallet.owners = owners;
        }

        // Atomic swap outputs double as contract objects.
        if let UnlockCondition::AtomicSwap(swap) = inner_condition(&condition) {
            let swap = swap.clone();
            let data_id = self.next_data_id();
            self.contracts.insert(
                condition.unlock_hash(),
                AtomicSwapContract {
                    condition: swap,
                    coin_output_id: CoinOutputId(id.0),
                    secret: None,
                    spent_by: None,
                    data_id,
                },
            );
        }

        let data_id = self.next_data_id();
        self.outputs.insert(
            id,
            ExplorerOutput {
                kind,
                value,
                condition,
                creation_transaction,
                creation_block: block_id,
                creation_height: height,
                locked,
                spenditure: None,
                data_id,
            },
        );
        Ok(())
    }

    /// Mark one output as spent and undo its balance contribution.
    fn index_spent_output(
        &mut self,
        id: OutputId,
        spender: TransactionId,
        fulfillment: UnlockFulfillment,
        height: BlockHeight,
    ) -> Result<()> {
        let (kind, value, condition, locked) = {
            let output = self
                .outputs
                .get(&id)
                .ok_or_else(|| ConsensusError::Corruption(format!("spent unknown output {id}")))?;
            (
                output.kind,
                output.value,
                output.condition.clone(),
                output.locked,
            )
        };
        let address = condition.unlock_hash();
        self.debit(address, wallet_kind(&condition), kind, &value, locked)?;
        self.adjust_facts_spent(kind, &value, locked)?;

        if let Some(contract) = self.contracts.get_mut(&address) {
            contract.secret = revealed_secret(&fulfillment);
            contract.spent_by = Some(spender);
        }

        if let Some(entry) = self.outputs.get_mut(&id) {
            entry.spenditure = Some(Spenditure {
                transaction_id: spender,
                height,
                fulfillment,
            });
        }
        Ok(())
    }

    /// Move every output whose lock expires at this block into the unlocked
    /// buckets. Returns the ids for the block record.
    fn process_unlocks(&mut self, height: BlockHeight, timestamp: Timestamp) -> Result<Vec<OutputId>> {
        let mut expired: Vec<OutputId> = Vec::new();
        let still_locked_heights = self.locked_by_height.split_off(&(height + 1));
        for (_, ids) in std::mem::replace(&mut self.locked_by_height, still_locked_heights) {
            expired.extend(ids);
        }
        let still_locked_times = self.locked_by_time.split_off(&(timestamp + 1));
        for (_, ids) in std::mem::replace(&mut self.locked_by_time, still_locked_times) {
            expired.extend(ids);
        }

        for id in &expired {
            let Some(output) = self.outputs.get_mut(id) else {
                continue;
            };
            if !output.locked {
                continue;
            }
            output.locked = false;
            let (kind, value, condition) =
                (output.kind, output.value, output.condition.clone());
            let address = condition.unlock_hash();
            let wkind = wallet_kind(&condition);
            self.debit(address, wkind, kind, &value, true)?;
            self.credit(address, wkind, kind, &value, false)?;
            match kind {
                AssetKind::Coin => {
                    self.facts.total_locked_coins =
                        self.facts.total_locked_coins.checked_sub(&value)?;
                }
                AssetKind::BlockStake => {
                    self.facts.total_locked_block_stakes =
                        self.facts.total_locked_block_stakes.checked_sub(&value)?;
                }
            }
        }
        Ok(expired)
    }

    /// Inverse of [`process_unlocks`]: re-lock the given outputs and put
    /// their unlock schedule entries back.
    fn undo_unlocks(&mut self, ids: &[OutputId], height: BlockHeight, timestamp: Timestamp) -> Result<()> {
        for id in ids.iter().rev() {
            let Some(output) = self.outputs.get_mut(id) else {
                continue;
            };
            output.locked = true;
            let (kind, value, condition) =
                (output.kind, output.value, output.condition.clone());
            let address = condition.unlock_hash();
            let wkind = wallet_kind(&condition);
            self.debit(address, wkind, kind, &value, false)?;
            self.credit(address, wkind, kind, &value, true)?;
            match kind {
                AssetKind::Coin => {
                    self.facts.total_locked_coins =
                        self.facts.total_locked_coins.checked_add(&value)?;
                }
                AssetKind::BlockStake => {
                    self.facts.total_locked_block_stakes =
                        self.facts.total_locked_block_stakes.checked_add(&value)?;
                }
            }
            // Reconstruct the schedule slot the unlock came from.
            match lock_state(&condition, None, height - 1, timestamp.saturating_sub(1)) {
                LockState::UntilHeight(h) => {
                    self.locked_by_height.entry(h).or_default().push(*id)
                }
                LockState::UntilTime(t) => self.locked_by_time.entry(t).or_default().push(*id),
                LockState::Unlocked => {
                    // Maturity-locked payout: its expiry is exactly this
                    // block's height.
                    self.locked_by_height.entry(height).or_default().push(*id)
                }
            }
        }
        Ok(())
    }

    fn recompute_active_stake_estimate(&mut self) {
        let window = self.constants.target_window as usize;
        let len = self.difficulty_history.len();
        if len < 2 {
            self.facts.estimated_active_block_stakes = self.facts.total_block_stakes;
            return;
        }
        let start = len.saturating_sub(window);
        let slice = &self.difficulty_history[start..];
        let mut sum = U256::zero();
        for (_, difficulty) in slice {
            sum = sum.checked_add(*difficulty).unwrap_or(U256::MAX);
        }
        let elapsed = slice[slice.len() - 1].0.saturating_sub(slice[0].0).max(1);
        let weighted = sum
            .checked_mul(U256::from(self.constants.block_frequency))
            .unwrap_or(U256::MAX)
            / U256::from(elapsed);
        self.facts.estimated_active_block_stakes = Currency::from_u256(weighted);
    }

    fn apply_block(&mut self, block: &Block, difficulty: U256) -> Result<()> {
        let block_id = block.id();
        let height = if self.blocks.is_empty() {
            0
        } else {
            self.facts.height + 1
        };
        let first_data_id = self.last_data_id;

        let unlocked_outputs = if height == 0 {
            Vec::new()
        } else {
            self.process_unlocks(height, block.timestamp)?
        };

        let mut transaction_ids = Vec::with_capacity(block.transactions.len());
        for tx in &block.transactions {
            let tx_id = tx.id();
            let data_id = self.next_data_id();
            self.transactions.insert(
                tx_id,
                ExplorerTransaction {
                    block_id,
                    height,
                    data_id,
                },
            );
            transaction_ids.push(tx_id);

            for input in &tx.coin_inputs {
                let id = OutputId::from(input.parent_id);
                self.index_spent_output(id, tx_id, input.fulfillment.clone(), height)?;
                if let Some(output) = self.outputs.get(&id) {
                    let condition = output.condition.clone();
                    self.note_wallet_transaction(
                        condition.unlock_hash(),
                        wallet_kind(&condition),
                        tx_id,
                    );
                }
            }
            for input in &tx.block_stake_inputs {
                let id = OutputId::from(input.parent_id);
                self.index_spent_output(id, tx_id, input.fulfillment.clone(), height)?;
                if let Some(output) = self.outputs.get(&id) {
                    let condition = output.condition.clone();
                    self.note_wallet_transaction(
                        condition.unlock_hash(),
                        wallet_kind(&condition),
                        tx_id,
                    );
                }
            }
            for (index, output) in tx.coin_outputs.iter().enumerate() {
                let id = OutputId::from(tx.coin_output_id(index as u64));
                self.index_created_output(
                    id,
                    AssetKind::Coin,
                    output.value,
                    output.condition.clone(),
                    Some(tx_id),
                    block_id,
                    height,
                    block.timestamp,
                    None,
                )?;
                self.note_wallet_transaction(
                    output.condition.unlock_hash(),
                    wallet_kind(&output.condition),
                    tx_id,
                );
            }
            for (index, output) in tx.block_stake_outputs.iter().enumerate() {
                let id = OutputId::from(tx.block_stake_output_id(index as u64));
                self.index_created_output(
                    id,
                    AssetKind::BlockStake,
                    output.value,
                    output.condition.clone(),
                    Some(tx_id),
                    block_id,
                    height,
                    block.timestamp,
                    None,
                )?;
                self.note_wallet_transaction(
                    output.condition.unlock_hash(),
                    wallet_kind(&output.condition),
                    tx_id,
                );
            }
        }

        let mut miner_payout_ids = Vec::with_capacity(block.miner_payouts.len());
        for (index, payout) in block.miner_payouts.iter().enumerate() {
            let payout_id = block.miner_payout_id(index as u64);
            miner_payout_ids.push(payout_id);
            self.index_created_output(
                OutputId::from(payout_id),
                AssetKind::Coin,
                payout.value,
                UnlockCondition::UnlockHash(payout.unlock_hash),
                None,
                block_id,
                height,
                block.timestamp,
                Some(height + self.constants.maturity_delay),
            )?;
        }

        let data_id = self.next_data_id();
        self.blocks.insert(
            block_id,
            ExplorerBlock {
                height,
                timestamp: block.timestamp,
                parent_id: block.parent_id,
                transaction_ids,
                miner_payout_ids,
                unlocked_outputs,
                first_data_id,
                data_id,
            },
        );
        self.blocks_by_height.insert(height, block_id);
        self.blocks_by_timestamp
            .entry(block.timestamp)
            .or_default()
            .push(block_id);

        self.facts.height = height;
        self.facts.block_id = block_id;
        self.difficulty_history.push((block.timestamp, difficulty));
        self.recompute_active_stake_estimate();
        Ok(())
    }

    fn revert_block(&mut self, block: &Block) -> Result<()> {
        let block_id = block.id();
        let record = self
            .blocks
            .remove(&block_id)
            .ok_or_else(|| ConsensusError::Corruption(format!("reverting unknown block {block_id}")))?;

        // Remove payout outputs, then undo transactions newest-first.
        for (index, _) in block.miner_payouts.iter().enumerate() {
            let id = OutputId::from(block.miner_payout_id(index as u64));
            self.remove_created_output(&id)?;
        }
        for tx in block.transactions.iter().rev() {
            let tx_id = tx.id();
            for (index, _) in tx.block_stake_outputs.iter().enumerate().rev() {
                let id = OutputId::from(tx.block_stake_output_id(index as u64));
                self.remove_created_output(&id)?;
            }
            for (index, _) in tx.coin_outputs.iter().enumerate().rev() {
                let id = OutputId::from(tx.coin_output_id(index as u64));
                self.remove_created_output(&id)?;
            }
            for input in tx.block_stake_inputs.iter().rev() {
                self.unspend_output(&OutputId::from(input.parent_id))?;
            }
            for input in tx.coin_inputs.iter().rev() {
                self.unspend_output(&OutputId::from(input.parent_id))?;
            }
            for wallet in self.wallets.values_mut() {
                if wallet.transaction_ids.last() == Some(&tx_id) {
                    wallet.transaction_ids.pop();
                }
            }
            self.transactions.remove(&tx_id);
        }

        self.undo_unlocks(&record.unlocked_outputs, record.height, record.timestamp)?;

        self.blocks_by_height.remove(&record.height);
        if let Some(ids) = self.blocks_by_timestamp.get_mut(&record.timestamp) {
            ids.retain(|id| *id != block_id);
            if ids.is_empty() {
                self.blocks_by_timestamp.remove(&record.timestamp);
            }
        }
        self.wallets.retain(|_, wallet| !wallet.is_empty());

        self.facts.height = record.height.saturating_sub(1);
        self.facts.block_id = record.parent_id;
        self.difficulty_history.pop();
        self.recompute_active_stake_estimate();
        // Everything assigned while applying this block is rewound.
        self.last_data_id = record.first_data_id;
        Ok(())
    }

    fn remove_created_output(&mut self, id: &OutputId) -> Result<()> {
        let output = self
            .outputs
            .remove(id)
            .ok_or_else(|| ConsensusError::Corruption(format!("reverting unknown output {id}")))?;
        let address = output.condition.unlock_hash();
        self.debit(
            address,
            wallet_kind(&output.condition),
            output.kind,
            &output.value,
            output.locked,
        )?;
        self.adjust_facts_spent(output.kind, &output.value, output.locked)?;
        if output.locked {
            for ids in self.locked_by_height.values_mut() {
                ids.retain(|scheduled| scheduled != id);
            }
            for ids in self.locked_by_time.values_mut() {
                ids.retain(|scheduled| scheduled != id);
            }
            self.locked_by_height.retain(|_, ids| !ids.is_empty());
            self.locked_by_time.retain(|_, ids| !ids.is_empty());
        }
        if let UnlockCondition::AtomicSwap(_) = inner_condition(&output.condition) {
            self.contracts.remove(&address);
        }
        Ok(())
    }

    fn unspend_output(&mut self, id: &OutputId) -> Result<()> {
        let output = self
            .outputs
            .get_mut(id)
            .ok_or_else(|| ConsensusError::Corruption(format!("unspending unknown output {id}")))?;
        output.spenditure = None;
        let (kind, value, condition, locked) = (
            output.kind,
            output.value,
            output.condition.clone(),
            output.locked,
        );
        let address = condition.unlock_hash();
        self.credit(address, wallet_kind(&condition), kind, &value, locked)?;
        self.adjust_facts_created(kind, &value, locked)?;
        if let Some(contract) = self.contracts.get_mut(&address) {
            contract.secret = None;
            contract.spent_by = None;
        }
        Ok(())
    }
}
