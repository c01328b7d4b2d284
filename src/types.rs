//! Core ledger types: currency, difficulty targets, tagged identifiers.

use primitive_types::U256;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crypto::{blake2b, Hash, ZERO_HASH};
use crate::encoding::{BinDecode, BinEncode, DecodeError, Decoder, Encoder};
use crate::error::{ConsensusError, Result};

/// Height of a block on the best chain; genesis is height 0.
pub type BlockHeight = u64;

/// Seconds since the Unix epoch.
pub type Timestamp = u64;

/// Lock times below this value are block heights, above it timestamps.
pub const LOCK_TIME_THRESHOLD: u64 = 500_000_000;

/// Non-negative currency value with checked arithmetic. Backed by a 256-bit
/// integer; overflow and underflow are consensus errors, never wrap-around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Currency(U256);

impl Currency {
    pub fn zero() -> Self {
        Currency(U256::zero())
    }

    pub fn new(value: u64) -> Self {
        Currency(U256::from(value))
    }

    pub fn from_u256(value: U256) -> Self {
        Currency(value)
    }

    pub fn as_u256(&self) -> U256 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn checked_add(&self, other: &Currency) -> Result<Currency> {
        self.0
            .checked_add(other.0)
            .map(Currency)
            .ok_or(ConsensusError::CurrencyOverflow)
    }

    pub fn checked_sub(&self, other: &Currency) -> Result<Currency> {
        self.0
            .checked_sub(other.0)
            .map(Currency)
            .ok_or(ConsensusError::InsufficientValue)
    }

    pub fn checked_mul_u64(&self, factor: u64) -> Result<Currency> {
        self.0
            .checked_mul(U256::from(factor))
            .map(Currency)
            .ok_or(ConsensusError::CurrencyOverflow)
    }

    /// Sum of an iterator of values, failing on overflow.
    pub fn sum<'a, I: IntoIterator<Item = &'a Currency>>(values: I) -> Result<Currency> {
        let mut total = Currency::zero();
        for value in values {
            total = total.checked_add(value)?;
        }
        Ok(total)
    }

    /// Minimal big-endian byte representation; empty for zero.
    pub fn to_be_bytes_minimal(&self) -> Vec<u8> {
        let mut raw = [0u8; 32];
        self.0.to_big_endian(&mut raw);
        let first = raw.iter().position(|&b| b != 0).unwrap_or(32);
        raw[first..].to_vec()
    }

    pub fn from_be_bytes(bytes: &[u8]) -> std::result::Result<Currency, DecodeError> {
        if bytes.len() > 32 {
            return Err(DecodeError::InvalidValue("currency wider than 256 bits".into()));
        }
        Ok(Currency(U256::from_big_endian(bytes)))
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Currency {
    type Err = ConsensusError;

    fn from_str(s: &str) -> Result<Self> {
        U256::from_dec_str(s)
            .map(Currency)
            .map_err(|e| ConsensusError::Serialization(format!("bad currency literal: {e:?}")))
    }
}

impl Serialize for Currency {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Currency {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

impl BinEncode for Currency {
    fn bin_encode(&self, enc: &mut Encoder) {
        enc.write_slice(&self.to_be_bytes_minimal());
    }
}

impl BinDecode for Currency {
    fn bin_decode(dec: &mut Decoder<'_>) -> std::result::Result<Self, DecodeError> {
        let raw = dec.read_slice()?;
        Currency::from_be_bytes(raw)
    }
}

/// 256-bit difficulty target, big-endian. A smaller target is harder to meet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Target(pub [u8; 32]);

impl Target {
    /// The easiest possible target; every digest meets it.
    pub const ROOT_DEPTH: Target = Target([0xFF; 32]);

    pub fn as_u256(&self) -> U256 {
        U256::from_big_endian(&self.0)
    }

    pub fn from_u256(value: U256) -> Self {
        let mut raw = [0u8; 32];
        value.to_big_endian(&mut raw);
        Target(raw)
    }

    /// True when `value` satisfies this target.
    pub fn meets(&self, value: U256) -> bool {
        value <= self.as_u256()
    }

    /// Expected number of attempts to meet this target, relative to the root
    /// depth. Cumulative sums of this drive fork choice.
    pub fn difficulty(&self) -> U256 {
        // +1 keeps the zero target finite.
        Target::ROOT_DEPTH.as_u256() / (self.as_u256() / U256::from(2) + U256::from(1))
    }
}

impl BinEncode for Target {
    fn bin_encode(&self, enc: &mut Encoder) {
        enc.write_raw(&self.0);
    }
}

impl BinDecode for Target {
    fn bin_decode(dec: &mut Decoder<'_>) -> std::result::Result<Self, DecodeError> {
        Ok(Target(dec.read_array::<32>()?))
    }
}

/// Ratio used to clamp per-block difficulty adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fraction {
    pub numerator: u64,
    pub denominator: u64,
}

impl Fraction {
    pub fn new(numerator: u64, denominator: u64) -> Self {
        Fraction { numerator, denominator }
    }

    /// `value * numerator / denominator` in 256-bit arithmetic, saturating on
    /// overflow (targets cannot exceed the root depth anyway).
    pub fn scale(&self, value: U256) -> U256 {
        match value.checked_mul(U256::from(self.numerator)) {
            Some(scaled) => scaled / U256::from(self.denominator.max(1)),
            None => U256::MAX,
        }
    }
}

macro_rules! hash_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub Hash);

        impl $name {
            pub fn as_bytes(&self) -> &Hash {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl From<Hash> for $name {
            fn from(hash: Hash) -> Self {
                $name(hash)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&hex::encode(self.0))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                let raw = hex::decode(&s).map_err(D::Error::custom)?;
                let hash: Hash = raw
                    .as_slice()
                    .try_into()
                    .map_err(|_| D::Error::custom("hash must be 32 bytes"))?;
                Ok($name(hash))
            }
        }

        impl BinEncode for $name {
            fn bin_encode(&self, enc: &mut Encoder) {
                enc.write_raw(&self.0);
            }
        }

        impl BinDecode for $name {
            fn bin_decode(dec: &mut Decoder<'_>) -> std::result::Result<Self, DecodeError> {
                Ok($name(dec.read_array::<32>()?))
            }
        }
    };
}

hash_newtype!(
    /// Identifier of a block: the digest of its header.
    BlockId
);
hash_newtype!(
    /// Identifier of a transaction: the digest of its canonical encoding.
    TransactionId
);
hash_newtype!(
    /// Identifier of a coin output.
    CoinOutputId
);
hash_newtype!(
    /// Identifier of a block-stake output.
    BlockStakeOutputId
);
hash_newtype!(
    /// Untyped output identifier, used where both asset kinds mix (pool
    /// conflict graph, explorer object store).
    OutputId
);
hash_newtype!(
    /// Opaque cursor into the consensus change sequence.
    ConsensusChangeId
);
hash_newtype!(
    /// Identifier of a transaction set held by the pool: the digest of the
    /// set's canonical encoding.
    TransactionSetId
);

impl From<CoinOutputId> for OutputId {
    fn from(id: CoinOutputId) -> Self {
        OutputId(id.0)
    }
}

impl From<BlockStakeOutputId> for OutputId {
    fn from(id: BlockStakeOutputId) -> Self {
        OutputId(id.0)
    }
}

impl From<BlockId> for OutputId {
    fn from(id: BlockId) -> Self {
        OutputId(id.0)
    }
}

impl ConsensusChangeId {
    /// Cursor sentinel meaning "before any change".
    pub const BEGINNING: ConsensusChangeId = ConsensusChangeId(ZERO_HASH);
}

/// 16-byte ASCII tag distinguishing derived identifiers per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Specifier(pub [u8; 16]);

pub const SPECIFIER_COIN_OUTPUT: Specifier = Specifier(*b"coin output\0\0\0\0\0");
pub const SPECIFIER_BLOCK_STAKE_OUTPUT: Specifier = Specifier(*b"blstake output\0\0");
pub const SPECIFIER_MINER_PAYOUT: Specifier = Specifier(*b"miner payout\0\0\0\0");

/// The two fungible assets tracked by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetKind {
    Coin,
    BlockStake,
}

/// One-byte class of an unlock hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnlockType(pub u8);

impl UnlockType {
    pub const NIL: UnlockType = UnlockType(0);
    pub const PUB_KEY: UnlockType = UnlockType(1);
    pub const ATOMIC_SWAP: UnlockType = UnlockType(2);
    pub const MULTI_SIG: UnlockType = UnlockType(3);
}

/// Address form of a spend condition: a type byte plus a digest of the
/// condition's canonical encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct UnlockHash {
    pub unlock_type: UnlockType,
    pub hash: Hash,
}

impl Default for UnlockType {
    fn default() -> Self {
        UnlockType::NIL
    }
}

impl UnlockHash {
    pub fn new(unlock_type: UnlockType, hash: Hash) -> Self {
        UnlockHash { unlock_type, hash }
    }

    /// The free-for-all address: zero hash under the nil type.
    pub fn nil() -> Self {
        UnlockHash::new(UnlockType::NIL, ZERO_HASH)
    }

    /// Single-owner address derived from a public key.
    pub fn from_public_key(key: &crate::crypto::PublicKey) -> Self {
        let mut enc = Encoder::new();
        enc.write_raw(&key.algorithm.specifier());
        enc.write_slice(&key.key);
        UnlockHash::new(UnlockType::PUB_KEY, blake2b(&enc.finish()))
    }
}

impl std::fmt::Display for UnlockHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02x}{}", self.unlock_type.0, hex::encode(self.hash))
    }
}

impl Serialize for UnlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for UnlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let raw = hex::decode(&s).map_err(D::Error::custom)?;
        if raw.len() != 33 {
            return Err(D::Error::custom("unlock hash must be 33 bytes"));
        }
        let mut hash = ZERO_HASH;
        hash.copy_from_slice(&raw[1..]);
        Ok(UnlockHash::new(UnlockType(raw[0]), hash))
    }
}

impl BinEncode for UnlockHash {
    fn bin_encode(&self, enc: &mut Encoder) {
        enc.write_u8(self.unlock_type.0);
        enc.write_raw(&self.hash);
    }
}

impl BinDecode for UnlockHash {
    fn bin_decode(dec: &mut Decoder<'_>) -> std::result::Result<Self, DecodeError> {
        let unlock_type = UnlockType(dec.read_u8()?);
        let hash = dec.read_array::<32>()?;
        Ok(UnlockHash { unlock_type, hash })
    }
}

/// Consensus change id derived from its position in the change sequence.
pub fn consensus_change_id(sequence: u64) -> ConsensusChangeId {
    let mut enc = Encoder::new();
    enc.write_raw(b"consensus change");
    enc.write_u64(sequence);
    ConsensusChangeId(blake2b(&enc.finish()))
}
