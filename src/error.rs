//! Error types for consensus and pool validation

use thiserror::Error;

/// Errors produced while validating transactions and blocks against the
/// consensus rules. These are rejections: the offending object is reported to
/// the caller and never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("transaction has a version unknown to this chain: {0}")]
    UnknownTransactionVersion(u8),

    #[error("transaction exceeds the chain size limit: {size} > {limit} bytes")]
    LargeTransaction { size: usize, limit: usize },

    #[error("transaction set exceeds the chain size limit: {size} > {limit} bytes")]
    LargeTransactionSet { size: usize, limit: usize },

    #[error("block exceeds the chain size limit: {size} > {limit} bytes")]
    LargeBlock { size: usize, limit: usize },

    #[error("arbitrary data exceeds the chain size limit: {size} > {limit} bytes")]
    LargeArbitraryData { size: usize, limit: usize },

    #[error("transaction carries no miner fee")]
    MissingMinerFee,

    #[error("transaction set needs more miner fees to be accepted")]
    LowMinerFees,

    #[error("input refers to an output that is not in the unspent output set: {0}")]
    MissingOutput(String),

    #[error("input spends a miner payout that has not matured yet")]
    ImmatureOutput,

    #[error("output id consumed more than once within a transaction set")]
    DoubleSpend,

    #[error("fulfillment does not satisfy the spend condition: {0}")]
    InvalidFulfillment(String),

    #[error("condition is time-locked and cannot be fulfilled yet")]
    Locked,

    #[error("condition or fulfillment is not standard: {0}")]
    NonStandard(String),

    #[error("input and output values are out of balance for {asset}")]
    InputOutputMismatch { asset: &'static str },

    #[error("currency arithmetic overflowed")]
    CurrencyOverflow,

    #[error("currency subtraction underflowed")]
    InsufficientValue,

    #[error("block timestamp does not exceed the median of recent timestamps")]
    EarlyTimestamp,

    #[error("block timestamp is too far in the future, try again later")]
    FutureTimestamp,

    #[error("block timestamp is too far in the future to ever be valid")]
    ExtremeFutureTimestamp,

    #[error("block stake solution does not meet the target")]
    UnsatisfiedTarget,

    #[error("block stake output has not aged enough to create a block")]
    UnagedStake,

    #[error("block stake solution is invalid: {0}")]
    InvalidStakeSolution(String),

    #[error("miner payouts do not match the block reward plus collected fees")]
    WrongMinerPayouts,

    #[error("block parent is not known")]
    OrphanBlock,

    #[error("block is already known")]
    KnownBlock,

    #[error("block not found")]
    UnknownBlock,

    #[error("transaction not found")]
    UnknownTransaction,

    #[error("consensus change cursor does not match any recorded change")]
    InvalidChangeCursor,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal state corruption: {0}")]
    Corruption(String),
}

/// Errors produced by the transaction pool. Pool rejections are local policy:
/// the object may still be perfectly valid on another node.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("transaction set is empty")]
    EmptySet,

    #[error("transaction set duplicates one already in the pool")]
    DuplicateSet,

    #[error("transaction pool cannot accept more transactions")]
    FullPool,

    #[error(transparent)]
    Consensus(#[from] ConsensusError),
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
