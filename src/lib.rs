//! # stakechain
//!
//! Consensus core of a proof-of-block-stake (PoBS) blockchain node: a UTXO
//! ledger moving two fungible assets (coins and block stakes), a chain store
//! with fork management, a transaction pool and an explorer indexer, all fed
//! by one ordered stream of consensus changes.
//!
//! ## Architecture
//!
//! The crate is organized bottom-up:
//! - primitives (`types`, `crypto`, `encoding`) define currencies, targets,
//!   tagged identifiers and the canonical binary form everything is hashed in;
//! - the condition/fulfillment engine (`condition`) decides who may spend an
//!   output: single signature, m-of-n multisig, hash-time-locked atomic swaps,
//!   time-locked wrappers, and an opaque unknown form kept for forward
//!   compatibility;
//! - the diff engine (`utxo`, `block`, `pobs`) validates transactions and
//!   blocks against an unspent-output set and produces invertible diffs;
//! - the chain store (`chain`) owns the block DAG and the best chain, handles
//!   orphans and reorganizations, and publishes [`utxo::ConsensusChange`]
//!   records through the subscription bus (`subscribe`);
//! - the transaction pool (`mempool`), explorer (`explorer`) and block
//!   creator (`creator`) consume that stream and the store's snapshots.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use stakechain::chain::ChainStore;
//! use stakechain::constants::ChainConstants;
//! use stakechain::explorer::Explorer;
//! use stakechain::mempool::TransactionPool;
//!
//! let chain = ChainStore::new(ChainConstants::devnet());
//! let pool = TransactionPool::new(Arc::clone(&chain), None).unwrap();
//! let explorer = Explorer::new(Arc::clone(&chain)).unwrap();
//!
//! assert_eq!(chain.height(), 0);
//! assert_eq!(explorer.facts().height, 0);
//! assert_eq!(pool.set_count(), 0);
//! ```

pub mod block;
pub mod chain;
pub mod condition;
pub mod constants;
pub mod creator;
pub mod crypto;
pub mod encoding;
pub mod error;
pub mod explorer;
pub mod mempool;
pub mod pobs;
pub mod relay;
pub mod subscribe;
pub mod transaction;
pub mod types;
pub mod utxo;

pub use block::{Block, MinerPayout, PobsSolution};
pub use chain::{BlockAcceptance, ChainStore};
pub use condition::{UnlockCondition, UnlockFulfillment};
pub use constants::ChainConstants;
pub use error::{ConsensusError, PoolError, Result};
pub use transaction::Transaction;
pub use types::{
    BlockHeight, BlockId, BlockStakeOutputId, CoinOutputId, ConsensusChangeId, Currency, Target,
    Timestamp, TransactionId, UnlockHash,
};
pub use utxo::{ConsensusChange, UtxoSet};
