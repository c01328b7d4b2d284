//! Digest and signature primitives used by the consensus core.
//!
//! All identifiers on this chain are Blake2b-256 digests; atomic-swap hashed
//! secrets use SHA-256. Signing is Ed25519, carried behind an algorithm-tagged
//! public key so that future schemes can be added without a wire change.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;

use crate::error::{ConsensusError, Result};

/// 256-bit digest.
pub type Hash = [u8; 32];

/// All-zero digest, used as a sentinel (genesis parent, beginning cursor).
pub const ZERO_HASH: Hash = [0u8; 32];

type Blake2b256 = Blake2b<U32>;

/// Blake2b-256 digest of a byte string.
pub fn blake2b(data: &[u8]) -> Hash {
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = ZERO_HASH;
    out.copy_from_slice(&digest);
    out
}

/// Blake2b-256 digest of the concatenation of several byte strings.
pub fn blake2b_all(parts: &[&[u8]]) -> Hash {
    let mut hasher = Blake2b256::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut out = ZERO_HASH;
    out.copy_from_slice(&digest);
    out
}

/// SHA-256 digest, used for atomic-swap hashed secrets.
pub fn sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = ZERO_HASH;
    out.copy_from_slice(&digest);
    out
}

/// Signature algorithm identifier carried next to every public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    #[serde(rename = "ed25519")]
    Ed25519,
}

impl SignatureAlgorithm {
    /// 16-byte specifier used in the binary encoding of a public key.
    pub fn specifier(&self) -> [u8; 16] {
        match self {
            SignatureAlgorithm::Ed25519 => *b"ed25519\0\0\0\0\0\0\0\0\0",
        }
    }

    pub fn from_specifier(spec: &[u8; 16]) -> Option<Self> {
        if spec == &SignatureAlgorithm::Ed25519.specifier() {
            Some(SignatureAlgorithm::Ed25519)
        } else {
            None
        }
    }
}

/// Algorithm-tagged public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey {
    pub algorithm: SignatureAlgorithm,
    pub key: [u8; 32],
}

impl PublicKey {
    pub fn new_ed25519(key: [u8; 32]) -> Self {
        PublicKey {
            algorithm: SignatureAlgorithm::Ed25519,
            key,
        }
    }

    /// The verifying half of an Ed25519 signing key.
    pub fn from_signing_key(key: &ed25519_dalek::SigningKey) -> Self {
        PublicKey::new_ed25519(key.verifying_key().to_bytes())
    }

    /// Verify `signature` over `message` with this key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        match self.algorithm {
            SignatureAlgorithm::Ed25519 => {
                let key = ed25519_dalek::VerifyingKey::from_bytes(&self.key)
                    .map_err(|e| ConsensusError::InvalidFulfillment(e.to_string()))?;
                let bytes: [u8; 64] = signature
                    .try_into()
                    .map_err(|_| ConsensusError::InvalidFulfillment("bad signature length".into()))?;
                let signature = ed25519_dalek::Signature::from_bytes(&bytes);
                ed25519_dalek::Verifier::verify(&key, message, &signature)
                    .map_err(|e| ConsensusError::InvalidFulfillment(e.to_string()))
            }
        }
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.algorithm {
            SignatureAlgorithm::Ed25519 => write!(f, "ed25519:{}", hex::encode(self.key)),
        }
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let (algo, hexkey) = s
            .split_once(':')
            .ok_or_else(|| D::Error::custom("public key must be <algorithm>:<hex>"))?;
        if algo != "ed25519" {
            return Err(D::Error::custom(format!("unknown signature algorithm {algo}")));
        }
        let raw = hex::decode(hexkey).map_err(D::Error::custom)?;
        let key: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| D::Error::custom("public key must be 32 bytes"))?;
        Ok(PublicKey::new_ed25519(key))
    }
}

/// Sign `message` with an Ed25519 key, returning the 64-byte signature.
pub fn sign_ed25519(key: &ed25519_dalek::SigningKey, message: &[u8]) -> Vec<u8> {
    ed25519_dalek::Signer::sign(key, message).to_bytes().to_vec()
}
