//! Spend-authorization layer: unlock conditions and their fulfillments.
//!
//! Conditions are a closed tagged sum with one escape hatch: a condition (or
//! fulfillment) of unknown type keeps its raw bytes so it can flow through
//! storage and re-encode byte-identically, but it is never standard and can
//! never be fulfilled.

use serde::de::Error as _;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crypto::{blake2b, sha256, Hash, PublicKey};
use crate::encoding::{self, BinDecode, BinEncode, DecodeError, Decoder, Encoder};
use crate::error::{ConsensusError, Result};
use crate::transaction::Transaction;
use crate::types::{BlockHeight, Timestamp, UnlockHash, UnlockType, LOCK_TIME_THRESHOLD};

/// One-byte tag of an unlock condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConditionType(pub u8);

impl ConditionType {
    pub const NIL: ConditionType = ConditionType(0);
    pub const UNLOCK_HASH: ConditionType = ConditionType(1);
    pub const ATOMIC_SWAP: ConditionType = ConditionType(2);
    pub const TIME_LOCK: ConditionType = ConditionType(3);
    pub const MULTI_SIGNATURE: ConditionType = ConditionType(4);
}

/// One-byte tag of an unlock fulfillment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FulfillmentType(pub u8);

impl FulfillmentType {
    pub const NIL: FulfillmentType = FulfillmentType(0);
    pub const SINGLE_SIGNATURE: FulfillmentType = FulfillmentType(1);
    pub const ATOMIC_SWAP: FulfillmentType = FulfillmentType(2);
    pub const MULTI_SIGNATURE: FulfillmentType = FulfillmentType(3);
    pub const TIME_LOCK: FulfillmentType = FulfillmentType(4);
}

/// Hash-time-locked contract condition: the receiver claims with the secret
/// preimage, the sender reclaims after the timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomicSwapCondition {
    pub sender: UnlockHash,
    pub receiver: UnlockHash,
    #[serde(rename = "hashedsecret", with = "hex_array")]
    pub hashed_secret: Hash,
    #[serde(rename = "timelock")]
    pub time_lock: Timestamp,
}

/// "Not before" wrapper around any other condition. Lock times below
/// [`LOCK_TIME_THRESHOLD`] are block heights, above it timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeLockCondition {
    #[serde(rename = "locktime")]
    pub lock_time: u64,
    pub condition: Box<UnlockCondition>,
}

/// m-of-n owner condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiSignatureCondition {
    #[serde(rename = "unlockhashes")]
    pub unlock_hashes: Vec<UnlockHash>,
    #[serde(rename = "minimumsignaturecount")]
    pub min_signature_count: u64,
}

/// Condition of a type this node does not understand; bytes kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCondition {
    pub condition_type: ConditionType,
    pub raw: Vec<u8>,
}

/// Who may spend an output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockCondition {
    /// Free-for-all: anyone can spend by signing with any key.
    Nil,
    /// Single owner identified by an address.
    UnlockHash(UnlockHash),
    AtomicSwap(AtomicSwapCondition),
    TimeLock(TimeLockCondition),
    MultiSignature(MultiSignatureCondition),
    Unknown(UnknownCondition),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleSignatureFulfillment {
    #[serde(rename = "publickey")]
    pub public_key: PublicKey,
    #[serde(with = "hex_vec")]
    pub signature: Vec<u8>,
}

/// All-zero secret selects the refund path; anything else is a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomicSwapFulfillment {
    #[serde(rename = "publickey")]
    pub public_key: PublicKey,
    #[serde(with = "hex_vec")]
    pub signature: Vec<u8>,
    #[serde(with = "hex_array")]
    pub secret: [u8; 32],
}

/// Fulfillment for outputs whose condition is an address that happens to
/// encode an atomic-swap contract; kept to accept old transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyAtomicSwapFulfillment {
    pub sender: UnlockHash,
    pub receiver: UnlockHash,
    #[serde(rename = "hashedsecret", with = "hex_array")]
    pub hashed_secret: Hash,
    #[serde(rename = "timelock")]
    pub time_lock: Timestamp,
    #[serde(rename = "publickey")]
    pub public_key: PublicKey,
    #[serde(with = "hex_vec")]
    pub signature: Vec<u8>,
    #[serde(with = "hex_array")]
    pub secret: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeySignaturePair {
    #[serde(rename = "publickey")]
    pub public_key: PublicKey,
    #[serde(with = "hex_vec")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiSignatureFulfillment {
    pub pairs: Vec<PublicKeySignaturePair>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFulfillment {
    pub fulfillment_type: FulfillmentType,
    pub raw: Vec<u8>,
}

/// Proof of authorization for spending an output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockFulfillment {
    /// Representable (a time-locked nil condition needs a carrier) but never
    /// standard and never valid on its own.
    Nil,
    SingleSignature(SingleSignatureFulfillment),
    AtomicSwap(AtomicSwapFulfillment),
    LegacyAtomicSwap(LegacyAtomicSwapFulfillment),
    MultiSignature(MultiSignatureFulfillment),
    TimeLock(Box<UnlockFulfillment>),
    Unknown(UnknownFulfillment),
}

/// Everything a fulfillment check may consult.
pub struct FulfillContext<'a> {
    pub input_index: u64,
    pub block_height: BlockHeight,
    pub block_time: Timestamp,
    pub transaction: &'a Transaction,
}

impl<'a> FulfillContext<'a> {
    fn sig_hash(&self, extra: &[&[u8]]) -> Hash {
        self.transaction.signature_hash(self.input_index, extra)
    }
}

fn whole_body(cond: &AtomicSwapCondition) -> Vec<u8> {
    let mut enc = Encoder::new();
    cond.sender.bin_encode(&mut enc);
    cond.receiver.bin_encode(&mut enc);
    enc.write_raw(&cond.hashed_secret);
    enc.write_u64(cond.time_lock);
    enc.finish()
}

fn multisig_body(cond: &MultiSignatureCondition) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.write_u64(cond.min_signature_count);
    cond.unlock_hashes.bin_encode(&mut enc);
    enc.finish()
}

impl UnlockCondition {
    pub fn condition_type(&self) -> ConditionType {
        match self {
            UnlockCondition::Nil => ConditionType::NIL,
            UnlockCondition::UnlockHash(_) => ConditionType::UNLOCK_HASH,
            UnlockCondition::AtomicSwap(_) => ConditionType::ATOMIC_SWAP,
            UnlockCondition::TimeLock(_) => ConditionType::TIME_LOCK,
            UnlockCondition::MultiSignature(_) => ConditionType::MULTI_SIGNATURE,
            UnlockCondition::Unknown(u) => u.condition_type,
        }
    }

    /// Deterministic address of this condition. Time locks are transparent:
    /// wrapping a condition does not change where it is "at".
    pub fn unlock_hash(&self) -> UnlockHash {
        match self {
            UnlockCondition::Nil => UnlockHash::nil(),
            UnlockCondition::UnlockHash(uh) => *uh,
            UnlockCondition::AtomicSwap(cond) => {
                UnlockHash::new(UnlockType::ATOMIC_SWAP, blake2b(&whole_body(cond)))
            }
            UnlockCondition::TimeLock(tl) => tl.condition.unlock_hash(),
            UnlockCondition::MultiSignature(cond) => {
                UnlockHash::new(UnlockType::MULTI_SIG, blake2b(&multisig_body(cond)))
            }
            UnlockCondition::Unknown(u) => {
                UnlockHash::new(UnlockType(u.condition_type.0), blake2b(&u.raw))
            }
        }
    }

    /// Whether this condition may appear on a newly created output.
    pub fn is_standard(&self) -> Result<()> {
        match self {
            UnlockCondition::Nil => Ok(()),
            UnlockCondition::UnlockHash(uh) => match uh.unlock_type {
                UnlockType::PUB_KEY | UnlockType::ATOMIC_SWAP | UnlockType::MULTI_SIG => Ok(()),
                other => Err(ConsensusError::NonStandard(format!(
                    "unlock hash of unsupported type {}",
                    other.0
                ))),
            },
            UnlockCondition::AtomicSwap(cond) => {
                if cond.hashed_secret == [0u8; 32] {
                    return Err(ConsensusError::NonStandard("atomic swap with nil hashed secret".into()));
                }
                for uh in [&cond.sender, &cond.receiver] {
                    if uh.unlock_type != UnlockType::PUB_KEY {
                        return Err(ConsensusError::NonStandard(
                            "atomic swap participant is not a public-key address".into(),
                        ));
                    }
                }
                Ok(())
            }
            UnlockCondition::TimeLock(tl) => {
                if tl.lock_time == 0 {
                    return Err(ConsensusError::NonStandard("time lock of zero".into()));
                }
                match tl.condition.as_ref() {
                    UnlockCondition::Nil
                    | UnlockCondition::UnlockHash(_)
                    | UnlockCondition::MultiSignature(_) => tl.condition.is_standard(),
                    _ => Err(ConsensusError::NonStandard(
                        "time lock may only wrap nil, address or multisig conditions".into(),
                    )),
                }
            }
            UnlockCondition::MultiSignature(cond) => {
                if cond.min_signature_count == 0 {
                    return Err(ConsensusError::NonStandard("multisig threshold of zero".into()));
                }
                if cond.min_signature_count > cond.unlock_hashes.len() as u64 {
                    return Err(ConsensusError::NonStandard(
                        "multisig threshold exceeds owner count".into(),
                    ));
                }
                for uh in &cond.unlock_hashes {
                    if uh.unlock_type != UnlockType::PUB_KEY {
                        return Err(ConsensusError::NonStandard(
                            "multisig owner is not a public-key address".into(),
                        ));
                    }
                }
                Ok(())
            }
            UnlockCondition::Unknown(u) => Err(ConsensusError::NonStandard(format!(
                "unknown condition type {}",
                u.condition_type.0
            ))),
        }
    }

    /// Verify that `fulfillment` authorizes spending an output guarded by this
    /// condition, in the given context.
    pub fn fulfill(&self, fulfillment: &UnlockFulfillment, ctx: &FulfillContext<'_>) -> Result<()> {
        match self {
            UnlockCondition::Nil => match fulfillment {
                UnlockFulfillment::SingleSignature(ssf) => {
                    ssf.public_key.verify(&ctx.sig_hash(&[]), &ssf.signature)
                }
                _ => Err(ConsensusError::InvalidFulfillment(
                    "nil condition wants a single-signature fulfillment".into(),
                )),
            },
            UnlockCondition::UnlockHash(uh) => match fulfillment {
                UnlockFulfillment::SingleSignature(ssf) => {
                    if UnlockHash::from_public_key(&ssf.public_key) != *uh {
                        return Err(ConsensusError::InvalidFulfillment(
                            "public key does not hash to the required address".into(),
                        ));
                    }
                    ssf.public_key.verify(&ctx.sig_hash(&[]), &ssf.signature)
                }
                UnlockFulfillment::LegacyAtomicSwap(lf) => {
                    let derived = AtomicSwapCondition {
                        sender: lf.sender,
                        receiver: lf.receiver,
                        hashed_secret: lf.hashed_secret,
                        time_lock: lf.time_lock,
                    };
                    let derived_hash =
                        UnlockHash::new(UnlockType::ATOMIC_SWAP, blake2b(&whole_body(&derived)));
                    if derived_hash != *uh {
                        return Err(ConsensusError::InvalidFulfillment(
                            "contract does not hash to the required address".into(),
                        ));
                    }
                    fulfill_atomic_swap(
                        &derived,
                        &lf.public_key,
                        &lf.signature,
                        &lf.secret,
                        ctx,
                    )
                }
                _ => Err(ConsensusError::InvalidFulfillment(
                    "address condition wants a signature fulfillment".into(),
                )),
            },
            UnlockCondition::AtomicSwap(cond) => match fulfillment {
                UnlockFulfillment::AtomicSwap(f) => {
                    fulfill_atomic_swap(cond, &f.public_key, &f.signature, &f.secret, ctx)
                }
                _ => Err(ConsensusError::InvalidFulfillment(
                    "atomic swap condition wants an atomic swap fulfillment".into(),
                )),
            },
            UnlockCondition::TimeLock(tl) => {
                let reached = if tl.lock_time < LOCK_TIME_THRESHOLD {
                    ctx.block_height >= tl.lock_time
                } else {
                    ctx.block_time >= tl.lock_time
                };
                if !reached {
                    return Err(ConsensusError::Locked);
                }
                let inner = match fulfillment {
                    UnlockFulfillment::TimeLock(inner) => inner.as_ref(),
                    other => other,
                };
                tl.condition.fulfill(inner, ctx)
            }
            UnlockCondition::MultiSignature(cond) => match fulfillment {
                UnlockFulfillment::MultiSignature(f) => {
                    if (f.pairs.len() as u64) < cond.min_signature_count {
                        return Err(ConsensusError::InvalidFulfillment(
                            "not enough signatures for the multisig threshold".into(),
                        ));
                    }
                    let message = ctx.sig_hash(&[]);
                    let mut unused = cond.unlock_hashes.clone();
                    for pair in &f.pairs {
                        let address = UnlockHash::from_public_key(&pair.public_key);
                        let slot = unused.iter().position(|uh| *uh == address).ok_or_else(|| {
                            ConsensusError::InvalidFulfillment(
                                "signer is not an owner of the multisig condition".into(),
                            )
                        })?;
                        unused.swap_remove(slot);
                        pair.public_key.verify(&message, &pair.signature)?;
                    }
                    Ok(())
                }
                _ => Err(ConsensusError::InvalidFulfillment(
                    "multisig condition wants a multisig fulfillment".into(),
                )),
            },
            UnlockCondition::Unknown(u) => Err(ConsensusError::InvalidFulfillment(format!(
                "condition type {} cannot be fulfilled by this node",
                u.condition_type.0
            ))),
        }
    }
}

fn fulfill_atomic_swap(
    cond: &AtomicSwapCondition,
    public_key: &PublicKey,
    signature: &[u8],
    secret: &[u8; 32],
    ctx: &FulfillContext<'_>,
) -> Result<()> {
    let signer = UnlockHash::from_public_key(public_key);
    let pk_bytes = encoding::to_bytes(public_key);
    let message = ctx.sig_hash(&[&pk_bytes[..], &secret[..]]);
    if secret != &[0u8; 32] {
        // Claim path: the receiver proves knowledge of the secret.
        if signer != cond.receiver {
            return Err(ConsensusError::InvalidFulfillment(
                "claim must be signed by the receiver".into(),
            ));
        }
        if sha256(secret) != cond.hashed_secret {
            return Err(ConsensusError::InvalidFulfillment("secret does not match".into()));
        }
        public_key.verify(&message, signature)
    } else {
        // Refund path: only open to the sender once the contract timed out.
        if ctx.block_time < cond.time_lock {
            return Err(ConsensusError::Locked);
        }
        if signer != cond.sender {
            return Err(ConsensusError::InvalidFulfillment(
                "refund must be signed by the sender".into(),
            ));
        }
        public_key.verify(&message, signature)
    }
}

impl UnlockFulfillment {
    pub fn fulfillment_type(&self) -> FulfillmentType {
        match self {
            UnlockFulfillment::Nil => FulfillmentType::NIL,
            UnlockFulfillment::SingleSignature(_) => FulfillmentType::SINGLE_SIGNATURE,
            UnlockFulfillment::AtomicSwap(_) | UnlockFulfillment::LegacyAtomicSwap(_) => {
                FulfillmentType::ATOMIC_SWAP
            }
            UnlockFulfillment::MultiSignature(_) => FulfillmentType::MULTI_SIGNATURE,
            UnlockFulfillment::TimeLock(_) => FulfillmentType::TIME_LOCK,
            UnlockFulfillment::Unknown(u) => u.fulfillment_type,
        }
    }

    /// Whether this fulfillment may appear on a newly relayed transaction.
    pub fn is_standard(&self) -> Result<()> {
        match self {
            UnlockFulfillment::Nil => {
                Err(ConsensusError::NonStandard("nil fulfillment".into()))
            }
            UnlockFulfillment::SingleSignature(f) => check_signature_length(&f.signature),
            UnlockFulfillment::AtomicSwap(f) => check_signature_length(&f.signature),
            UnlockFulfillment::LegacyAtomicSwap(f) => check_signature_length(&f.signature),
            UnlockFulfillment::MultiSignature(f) => {
                if f.pairs.is_empty() {
                    return Err(ConsensusError::NonStandard("multisig fulfillment without pairs".into()));
                }
                for pair in &f.pairs {
                    check_signature_length(&pair.signature)?;
                }
                Ok(())
            }
            UnlockFulfillment::TimeLock(inner) => inner.is_standard(),
            UnlockFulfillment::Unknown(u) => Err(ConsensusError::NonStandard(format!(
                "unknown fulfillment type {}",
                u.fulfillment_type.0
            ))),
        }
    }

    /// Produce the signature(s) for spending `transaction`'s input at
    /// `input_index` with `key`, writing them into this fulfillment.
    pub fn sign(
        &mut self,
        transaction: &Transaction,
        input_index: u64,
        key: &ed25519_dalek::SigningKey,
    ) -> Result<()> {
        match self {
            UnlockFulfillment::SingleSignature(f) => {
                let message = transaction.signature_hash(input_index, &[]);
                f.public_key = PublicKey::from_signing_key(key);
                f.signature = crate::crypto::sign_ed25519(key, &message);
                Ok(())
            }
            UnlockFulfillment::AtomicSwap(f) => {
                f.public_key = PublicKey::from_signing_key(key);
                let pk_bytes = encoding::to_bytes(&f.public_key);
                let message =
                    transaction.signature_hash(input_index, &[&pk_bytes[..], &f.secret[..]]);
                f.signature = crate::crypto::sign_ed25519(key, &message);
                Ok(())
            }
            UnlockFulfillment::LegacyAtomicSwap(f) => {
                f.public_key = PublicKey::from_signing_key(key);
                let pk_bytes = encoding::to_bytes(&f.public_key);
                let message =
                    transaction.signature_hash(input_index, &[&pk_bytes[..], &f.secret[..]]);
                f.signature = crate::crypto::sign_ed25519(key, &message);
                Ok(())
            }
            UnlockFulfillment::MultiSignature(f) => {
                let message = transaction.signature_hash(input_index, &[]);
                f.pairs.push(PublicKeySignaturePair {
                    public_key: PublicKey::from_signing_key(key),
                    signature: crate::crypto::sign_ed25519(key, &message),
                });
                Ok(())
            }
            UnlockFulfillment::TimeLock(inner) => inner.sign(transaction, input_index, key),
            UnlockFulfillment::Nil | UnlockFulfillment::Unknown(_) => Err(
                ConsensusError::InvalidFulfillment("fulfillment cannot carry a signature".into()),
            ),
        }
    }
}

// --- binary encoding -------------------------------------------------------

impl BinEncode for PublicKey {
    fn bin_encode(&self, enc: &mut Encoder) {
        enc.write_raw(&self.algorithm.specifier());
        enc.write_slice(&self.key);
    }
}

impl BinDecode for PublicKey {
    fn bin_decode(dec: &mut Decoder<'_>) -> std::result::Result<Self, DecodeError> {
        let spec = dec.read_array::<16>()?;
        let algorithm = crate::crypto::SignatureAlgorithm::from_specifier(&spec)
            .ok_or_else(|| DecodeError::InvalidValue("unknown signature algorithm".into()))?;
        let raw = dec.read_slice()?;
        let key: [u8; 32] = raw
            .try_into()
            .map_err(|_| DecodeError::InvalidValue("public key must be 32 bytes".into()))?;
        Ok(PublicKey { algorithm, key })
    }
}

impl UnlockCondition {
    fn body_bytes(&self) -> Vec<u8> {
        match self {
            UnlockCondition::Nil => Vec::new(),
            UnlockCondition::UnlockHash(uh) => encoding::to_bytes(uh),
            UnlockCondition::AtomicSwap(cond) => whole_body(cond),
            UnlockCondition::TimeLock(tl) => {
                let mut enc = Encoder::new();
                enc.write_u64(tl.lock_time);
                tl.condition.bin_encode(&mut enc);
                enc.finish()
            }
            UnlockCondition::MultiSignature(cond) => multisig_body(cond),
            UnlockCondition::Unknown(u) => u.raw.clone(),
        }
    }
}

impl BinEncode for UnlockCondition {
    fn bin_encode(&self, enc: &mut Encoder) {
        enc.write_u8(self.condition_type().0);
        enc.write_slice(&self.body_bytes());
    }
}

impl BinDecode for UnlockCondition {
    fn bin_decode(dec: &mut Decoder<'_>) -> std::result::Result<Self, DecodeError> {
        let tag = ConditionType(dec.read_u8()?);
        let body = dec.read_slice()?;
        let mut body_dec = Decoder::new(body);
        let cond = match tag {
            ConditionType::NIL => UnlockCondition::Nil,
            ConditionType::UNLOCK_HASH => {
                UnlockCondition::UnlockHash(UnlockHash::bin_decode(&mut body_dec)?)
            }
            ConditionType::ATOMIC_SWAP => UnlockCondition::AtomicSwap(AtomicSwapCondition {
                sender: UnlockHash::bin_decode(&mut body_dec)?,
                receiver: UnlockHash::bin_decode(&mut body_dec)?,
                hashed_secret: body_dec.read_array::<32>()?,
                time_lock: body_dec.read_u64()?,
            }),
            ConditionType::TIME_LOCK => UnlockCondition::TimeLock(TimeLockCondition {
                lock_time: body_dec.read_u64()?,
                condition: Box::new(UnlockCondition::bin_decode(&mut body_dec)?),
            }),
            ConditionType::MULTI_SIGNATURE => {
                UnlockCondition::MultiSignature(MultiSignatureCondition {
                    min_signature_count: body_dec.read_u64()?,
                    unlock_hashes: Vec::<UnlockHash>::bin_decode(&mut body_dec)?,
                })
            }
            other => {
                return Ok(UnlockCondition::Unknown(UnknownCondition {
                    condition_type: other,
                    raw: body.to_vec(),
                }))
            }
        };
        if !body_dec.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(cond)
    }
}

impl BinEncode for UnlockFulfillment {
    fn bin_encode(&self, enc: &mut Encoder) {
        let body = match self {
            UnlockFulfillment::Nil => Vec::new(),
            UnlockFulfillment::SingleSignature(f) => {
                let mut e = Encoder::new();
                f.public_key.bin_encode(&mut e);
                e.write_slice(&f.signature);
                e.finish()
            }
            UnlockFulfillment::AtomicSwap(f) => {
                let mut e = Encoder::new();
                f.public_key.bin_encode(&mut e);
                e.write_slice(&f.signature);
                e.write_raw(&f.secret);
                e.finish()
            }
            UnlockFulfillment::LegacyAtomicSwap(f) => {
                let mut e = Encoder::new();
                f.sender.bin_encode(&mut e);
                f.receiver.bin_encode(&mut e);
                e.write_raw(&f.hashed_secret);
                e.write_u64(f.time_lock);
                f.public_key.bin_encode(&mut e);
                e.write_slice(&f.signature);
                e.write_raw(&f.secret);
                e.finish()
            }
            UnlockFulfillment::MultiSignature(f) => {
                let mut e = Encoder::new();
                e.write_u64(f.pairs.len() as u64);
                for pair in &f.pairs {
                    pair.public_key.bin_encode(&mut e);
                    e.write_slice(&pair.signature);
                }
                e.finish()
            }
            UnlockFulfillment::TimeLock(inner) => encoding::to_bytes(inner.as_ref()),
            UnlockFulfillment::Unknown(u) => u.raw.clone(),
        };
        enc.write_u8(self.fulfillment_type().0);
        enc.write_slice(&body);
    }
}

/// Body length of a non-legacy atomic-swap fulfillment with a 64-byte
/// signature: 56 (public key) + 72 (signature slice) + 32 (secret).
const ATOMIC_SWAP_BODY_LEN: usize = 160;

impl BinDecode for UnlockFulfillment {
    fn bin_decode(dec: &mut Decoder<'_>) -> std::result::Result<Self, DecodeError> {
        let tag = FulfillmentType(dec.read_u8()?);
        let body = dec.read_slice()?;
        let mut body_dec = Decoder::new(body);
        let fulfillment = match tag {
            FulfillmentType::NIL => UnlockFulfillment::Nil,
            FulfillmentType::SINGLE_SIGNATURE => {
                UnlockFulfillment::SingleSignature(SingleSignatureFulfillment {
                    public_key: PublicKey::bin_decode(&mut body_dec)?,
                    signature: body_dec.read_slice()?.to_vec(),
                })
            }
            FulfillmentType::ATOMIC_SWAP => {
                // The legacy form carries the whole contract in front of the
                // usual fields and is therefore strictly longer.
                if body.len() > ATOMIC_SWAP_BODY_LEN {
                    UnlockFulfillment::LegacyAtomicSwap(LegacyAtomicSwapFulfillment {
                        sender: UnlockHash::bin_decode(&mut body_dec)?,
                        receiver: UnlockHash::bin_decode(&mut body_dec)?,
                        hashed_secret: body_dec.read_array::<32>()?,
                        time_lock: body_dec.read_u64()?,
                        public_key: PublicKey::bin_decode(&mut body_dec)?,
                        signature: body_dec.read_slice()?.to_vec(),
                        secret: body_dec.read_array::<32>()?,
                    })
                } else {
                    UnlockFulfillment::AtomicSwap(AtomicSwapFulfillment {
                        public_key: PublicKey::bin_decode(&mut body_dec)?,
                        signature: body_dec.read_slice()?.to_vec(),
                        secret: body_dec.read_array::<32>()?,
                    })
                }
            }
            FulfillmentType::MULTI_SIGNATURE => {
                let count = body_dec.read_count()?;
                let mut pairs = Vec::with_capacity(count);
                for _ in 0..count {
                    pairs.push(PublicKeySignaturePair {
                        public_key: PublicKey::bin_decode(&mut body_dec)?,
                        signature: body_dec.read_slice()?.to_vec(),
                    });
                }
                UnlockFulfillment::MultiSignature(MultiSignatureFulfillment { pairs })
            }
            FulfillmentType::TIME_LOCK => UnlockFulfillment::TimeLock(Box::new(
                UnlockFulfillment::bin_decode(&mut body_dec)?,
            )),
            other => {
                return Ok(UnlockFulfillment::Unknown(UnknownFulfillment {
                    fulfillment_type: other,
                    raw: body.to_vec(),
                }))
            }
        };
        if !body_dec.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(fulfillment)
    }
}

// --- JSON encoding ---------------------------------------------------------

#[derive(Deserialize)]
struct TaggedValue {
    #[serde(rename = "type", default)]
    tag: u8,
    #[serde(default)]
    data: serde_json::Value,
}

impl Serialize for UnlockCondition {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut out = serializer.serialize_struct("UnlockCondition", 2)?;
        out.serialize_field("type", &self.condition_type().0)?;
        match self {
            UnlockCondition::Nil => out.serialize_field("data", &serde_json::json!({}))?,
            UnlockCondition::UnlockHash(uh) => {
                out.serialize_field("data", &serde_json::json!({ "unlockhash": uh }))?
            }
            UnlockCondition::AtomicSwap(cond) => out.serialize_field("data", cond)?,
            UnlockCondition::TimeLock(cond) => out.serialize_field("data", cond)?,
            UnlockCondition::MultiSignature(cond) => out.serialize_field("data", cond)?,
            UnlockCondition::Unknown(u) => {
                out.serialize_field("data", &hex::encode(&u.raw))?
            }
        }
        out.end()
    }
}

impl<'de> Deserialize<'de> for UnlockCondition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = TaggedValue::deserialize(deserializer)?;
        let cond = match ConditionType(raw.tag) {
            ConditionType::NIL => UnlockCondition::Nil,
            ConditionType::UNLOCK_HASH => {
                #[derive(Deserialize)]
                struct Data {
                    unlockhash: UnlockHash,
                }
                let data: Data = serde_json::from_value(raw.data).map_err(D::Error::custom)?;
                UnlockCondition::UnlockHash(data.unlockhash)
            }
            ConditionType::ATOMIC_SWAP => UnlockCondition::AtomicSwap(
                serde_json::from_value(raw.data).map_err(D::Error::custom)?,
            ),
            ConditionType::TIME_LOCK => UnlockCondition::TimeLock(
                serde_json::from_value(raw.data).map_err(D::Error::custom)?,
            ),
            ConditionType::MULTI_SIGNATURE => UnlockCondition::MultiSignature(
                serde_json::from_value(raw.data).map_err(D::Error::custom)?,
            ),
            other => {
                let hex_data: String =
                    serde_json::from_value(raw.data).map_err(D::Error::custom)?;
                UnlockCondition::Unknown(UnknownCondition {
                    condition_type: other,
                    raw: hex::decode(hex_data).map_err(D::Error::custom)?,
                })
            }
        };
        Ok(cond)
    }
}

impl Serialize for UnlockFulfillment {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut out = serializer.serialize_struct("UnlockFulfillment", 2)?;
        out.serialize_field("type", &self.fulfillment_type().0)?;
        match self {
            UnlockFulfillment::Nil => out.serialize_field("data", &serde_json::json!({}))?,
            UnlockFulfillment::SingleSignature(f) => out.serialize_field("data", f)?,
            UnlockFulfillment::AtomicSwap(f) => out.serialize_field("data", f)?,
            UnlockFulfillment::LegacyAtomicSwap(f) => out.serialize_field("data", f)?,
            UnlockFulfillment::MultiSignature(f) => out.serialize_field("data", f)?,
            UnlockFulfillment::TimeLock(inner) => out.serialize_field("data", inner.as_ref())?,
            UnlockFulfillment::Unknown(u) => {
                out.serialize_field("data", &hex::encode(&u.raw))?
            }
        }
        out.end()
    }
}

impl<'de> Deserialize<'de> for UnlockFulfillment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = TaggedValue::deserialize(deserializer)?;
        let fulfillment = match FulfillmentType(raw.tag) {
            FulfillmentType::NIL => UnlockFulfillment::Nil,
            FulfillmentType::SINGLE_SIGNATURE => UnlockFulfillment::SingleSignature(
                serde_json::from_value(raw.data).map_err(D::Error::custom)?,
            ),
            FulfillmentType::ATOMIC_SWAP => {
                // The legacy form is recognized by its extra contract fields.
                if raw.data.get("sender").is_some() {
                    UnlockFulfillment::LegacyAtomicSwap(
                        serde_json::from_value(raw.data).map_err(D::Error::custom)?,
                    )
                } else {
                    UnlockFulfillment::AtomicSwap(
                        serde_json::from_value(raw.data).map_err(D::Error::custom)?,
                    )
                }
            }
            FulfillmentType::MULTI_SIGNATURE => UnlockFulfillment::MultiSignature(
                serde_json::from_value(raw.data).map_err(D::Error::custom)?,
            ),
            FulfillmentType::TIME_LOCK => UnlockFulfillment::TimeLock(Box::new(
                serde_json::from_value(raw.data).map_err(D::Error::custom)?,
            )),
            other => {
                let hex_data: String =
                    serde_json::from_value(raw.data).map_err(D::Error::custom)?;
                UnlockFulfillment::Unknown(UnknownFulfillment {
                    fulfillment_type: other,
                    raw: hex::decode(hex_data).map_err(D::Error::custom)?,
                })
            }
        };
        Ok(fulfillment)
    }
}

fn check_signature_length(signature: &[u8]) -> Result<()> {
    if signature.len() != 64 {
        return Err(ConsensusError::NonStandard(format!(
            "signature of {} bytes, want 64",
            signature.len()
        )));
    }
    Ok(())
}

/// Hex serde for fixed 32-byte arrays.
pub(crate) mod hex_array {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &[u8; 32],
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let raw = hex::decode(&s).map_err(D::Error::custom)?;
        raw.as_slice()
            .try_into()
            .map_err(|_| D::Error::custom("expected 32 bytes of hex"))
    }
}

/// Hex serde for variable byte strings.
pub(crate) mod hex_vec {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &[u8],
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(D::Error::custom)
    }
}
