//! Chain constants, frozen per network.
//!
//! Every rule parameter of the consensus engine lives here. The three bundled
//! networks (standard, testnet, devnet) share the rule code and differ only in
//! these tables; a host can also build its own table from scratch.

use primitive_types::U256;

use crate::block::{Block, PobsSolution};
use crate::crypto::PublicKey;
use crate::transaction::{BlockStakeOutput, CoinOutput, Transaction, TRANSACTION_VERSION_ONE};
use crate::types::{
    BlockHeight, Currency, Fraction, Target, Timestamp, UnlockHash,
};
use crate::condition::UnlockCondition;
use crate::error::Result;
use crate::types::BlockId;

/// Smallest-unit denomination of one whole coin.
pub const ONE_COIN: u64 = 1_000_000_000;

#[derive(Debug, Clone)]
pub struct ChainConstants {
    /// Maximum binary-encoded size of a block.
    pub block_size_limit: usize,
    /// Maximum size of a transaction's arbitrary data field.
    pub arbitrary_data_size_limit: usize,
    /// Coins minted per block, paid to the block creator.
    pub block_creator_fee: Currency,
    /// Fee floor for every miner fee on a transaction.
    pub minimum_transaction_fee: Currency,
    /// Target seconds between blocks.
    pub block_frequency: u64,
    /// Blocks before a miner payout can be spent.
    pub maturity_delay: BlockHeight,
    /// Number of recent timestamps whose median a new block must exceed.
    pub median_timestamp_window: usize,
    /// Number of recent blocks consulted for difficulty adjustment.
    pub target_window: BlockHeight,
    /// Per-adjustment clamp on target shrinkage (difficulty rising).
    pub max_adjustment_up: Fraction,
    /// Per-adjustment clamp on target growth (difficulty falling).
    pub max_adjustment_down: Fraction,
    /// Seconds a block timestamp may run ahead of the clock and still be
    /// accepted once the clock catches up.
    pub future_threshold: u64,
    /// Seconds beyond which a block timestamp is permanently invalid.
    pub extreme_future_threshold: u64,
    /// Seconds of depth at which the stake modifier block is picked.
    pub stake_modifier_delay: u64,
    /// Seconds a block-stake output must age before it can create a block.
    pub block_stake_aging: u64,
    /// Timestamp of the genesis block.
    pub genesis_timestamp: Timestamp,
    /// Difficulty target of the genesis block.
    pub genesis_target: Target,
    /// The easiest representable target; difficulty is measured against it.
    pub root_depth: Target,
    /// Maximum binary-encoded size of a single transaction.
    pub transaction_size_limit: usize,
    /// Maximum binary-encoded size of a transaction set.
    pub transaction_set_size_limit: usize,
    /// Maximum total bytes the transaction pool will hold.
    pub pool_size_limit: usize,
    /// Version given to newly built transactions.
    pub default_transaction_version: u8,
    /// When set, block creators pay collected fees to this condition instead
    /// of their own address.
    pub transaction_fee_condition: Option<UnlockCondition>,
    /// Coin outputs created by the genesis transaction.
    pub genesis_coin_distribution: Vec<CoinOutput>,
    /// Block-stake outputs created by the genesis transaction. Their total is
    /// the fixed stake supply: stakes are never minted again.
    pub genesis_block_stake_allocation: Vec<BlockStakeOutput>,
}

impl ChainConstants {
    /// Production network parameters.
    pub fn standard() -> Self {
        let beneficiary = UnlockHash::from_public_key(&PublicKey::from_signing_key(
            &standard_foundation_key(),
        ));
        ChainConstants {
            block_size_limit: 2_000_000,
            arbitrary_data_size_limit: 83,
            block_creator_fee: Currency::new(ONE_COIN),
            minimum_transaction_fee: Currency::new(ONE_COIN / 10),
            block_frequency: 120,
            maturity_delay: 144,
            median_timestamp_window: 11,
            target_window: 1_000,
            max_adjustment_up: Fraction::new(10, 25),
            max_adjustment_down: Fraction::new(25, 10),
            future_threshold: 3_600,
            extreme_future_threshold: 7_200,
            stake_modifier_delay: 2_000,
            block_stake_aging: 86_400,
            genesis_timestamp: 1_524_168_391,
            genesis_target: Target::from_u256(Target::ROOT_DEPTH.as_u256() >> 24),
            root_depth: Target::ROOT_DEPTH,
            transaction_size_limit: 16_000,
            transaction_set_size_limit: 250_000,
            pool_size_limit: 20_000_000 - 250_000,
            default_transaction_version: TRANSACTION_VERSION_ONE,
            transaction_fee_condition: None,
            genesis_coin_distribution: vec![CoinOutput {
                value: Currency::from_u256(U256::from(100_000_000u64) * U256::from(ONE_COIN)),
                condition: UnlockCondition::UnlockHash(beneficiary),
            }],
            genesis_block_stake_allocation: vec![BlockStakeOutput {
                value: Currency::new(3_000),
                condition: UnlockCondition::UnlockHash(beneficiary),
            }],
        }
    }

    /// Public test network: same shape as standard, faster reorg recovery and
    /// a short timestamp horizon.
    pub fn testnet() -> Self {
        let mut constants = ChainConstants::standard();
        constants.block_creator_fee = Currency::zero();
        constants.maturity_delay = 720;
        constants.future_threshold = 3;
        constants.extreme_future_threshold = 6;
        constants.stake_modifier_delay = 20;
        constants.block_stake_aging = 1_024;
        constants.genesis_target = Target::from_u256(Target::ROOT_DEPTH.as_u256() >> 16);
        constants
    }

    /// Local development network: short blocks, tiny windows, and a genesis
    /// funded to the well-known devnet key so a single node can produce
    /// blocks immediately.
    pub fn devnet() -> Self {
        let beneficiary =
            UnlockHash::from_public_key(&PublicKey::from_signing_key(&devnet_signing_key()));
        ChainConstants {
            block_size_limit: 2_000_000,
            arbitrary_data_size_limit: 83,
            block_creator_fee: Currency::zero(),
            minimum_transaction_fee: Currency::new(ONE_COIN / 10),
            block_frequency: 12,
            maturity_delay: 10,
            median_timestamp_window: 11,
            target_window: 20,
            max_adjustment_up: Fraction::new(100, 120),
            max_adjustment_down: Fraction::new(120, 100),
            future_threshold: 120,
            extreme_future_threshold: 180,
            stake_modifier_delay: 2_000,
            block_stake_aging: 1_024,
            genesis_timestamp: 1_519_200_000,
            genesis_target: Target::ROOT_DEPTH,
            root_depth: Target::ROOT_DEPTH,
            transaction_size_limit: 16_000,
            transaction_set_size_limit: 250_000,
            pool_size_limit: 20_000_000 - 250_000,
            default_transaction_version: TRANSACTION_VERSION_ONE,
            transaction_fee_condition: None,
            genesis_coin_distribution: vec![CoinOutput {
                value: Currency::from_u256(U256::from(100_000u64) * U256::from(ONE_COIN)),
                condition: UnlockCondition::UnlockHash(beneficiary),
            }],
            genesis_block_stake_allocation: vec![BlockStakeOutput {
                value: Currency::new(3_000),
                condition: UnlockCondition::UnlockHash(beneficiary),
            }],
        }
    }

    /// Total block-stake supply, fixed at genesis.
    pub fn genesis_block_stake_count(&self) -> Result<Currency> {
        Currency::sum(self.genesis_block_stake_allocation.iter().map(|o| &o.value))
    }

    /// The transaction carrying the genesis distribution. It is exempt from
    /// fee and input rules: it is never validated, only applied.
    pub fn genesis_transaction(&self) -> Transaction {
        let mut tx = Transaction::new_v1();
        tx.coin_outputs = self.genesis_coin_distribution.clone();
        tx.block_stake_outputs = self.genesis_block_stake_allocation.clone();
        tx
    }

    /// The deterministic genesis block of this network.
    pub fn genesis_block(&self) -> Block {
        Block {
            parent_id: BlockId::default(),
            nonce: [0u8; 8],
            timestamp: self.genesis_timestamp,
            pobs: PobsSolution::genesis(),
            miner_payouts: Vec::new(),
            transactions: vec![self.genesis_transaction()],
        }
    }

    /// Depth, in blocks, of the block whose id seeds the stake modifier.
    pub fn stake_modifier_depth(&self) -> BlockHeight {
        (self.stake_modifier_delay / self.block_frequency.max(1)).max(1)
    }

    /// Age, in blocks, a block-stake output needs before creating a block.
    pub fn block_stake_aging_blocks(&self) -> BlockHeight {
        self.block_stake_aging / self.block_frequency.max(1)
    }
}

/// Well-known devnet key; its address receives the whole devnet genesis.
pub fn devnet_signing_key() -> ed25519_dalek::SigningKey {
    ed25519_dalek::SigningKey::from_bytes(&[0x42; 32])
}

fn standard_foundation_key() -> ed25519_dalek::SigningKey {
    // Placeholder foundation address seed; a deployment overrides the genesis
    // distribution with its own.
    ed25519_dalek::SigningKey::from_bytes(&[0x01; 32])
}
