//! Transaction model and structural validation.
//!
//! A transaction moves two assets through the ledger: coins (which also pay
//! miner fees) and block stakes (which only ever change hands). Its identifier
//! is the digest of the canonical binary encoding, and every output identifier
//! is derived from it, so IDs are fixed by the transaction alone.

use serde::{Deserialize, Serialize};

use crate::condition::{hex_vec, UnlockCondition, UnlockFulfillment};
use crate::constants::ChainConstants;
use crate::crypto::{blake2b, Hash};
use crate::encoding::{self, BinDecode, BinEncode, DecodeError, Decoder, Encoder};
use crate::error::{ConsensusError, Result};
use crate::types::{
    BlockStakeOutputId, CoinOutputId, Currency, TransactionId, SPECIFIER_BLOCK_STAKE_OUTPUT,
    SPECIFIER_COIN_OUTPUT,
};

/// The canonical transaction version.
pub const TRANSACTION_VERSION_ONE: u8 = 1;

/// Versions this node knows how to validate.
pub const KNOWN_TRANSACTION_VERSIONS: &[u8] = &[TRANSACTION_VERSION_ONE];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinInput {
    #[serde(rename = "parentid")]
    pub parent_id: CoinOutputId,
    pub fulfillment: UnlockFulfillment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinOutput {
    pub value: Currency,
    pub condition: UnlockCondition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStakeInput {
    #[serde(rename = "parentid")]
    pub parent_id: BlockStakeOutputId,
    pub fulfillment: UnlockFulfillment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStakeOutput {
    pub value: Currency,
    pub condition: UnlockCondition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u8,
    #[serde(rename = "coininputs")]
    pub coin_inputs: Vec<CoinInput>,
    #[serde(rename = "coinoutputs")]
    pub coin_outputs: Vec<CoinOutput>,
    #[serde(rename = "blockstakeinputs")]
    pub block_stake_inputs: Vec<BlockStakeInput>,
    #[serde(rename = "blockstakeoutputs")]
    pub block_stake_outputs: Vec<BlockStakeOutput>,
    #[serde(rename = "minerfees")]
    pub miner_fees: Vec<Currency>,
    #[serde(rename = "arbitrarydata", with = "hex_vec")]
    pub arbitrary_data: Vec<u8>,
    /// Version-dependent extension payload, carried opaquely.
    #[serde(rename = "extensiondata", with = "hex_vec")]
    pub extension: Vec<u8>,
}

impl Transaction {
    /// An empty version-1 transaction.
    pub fn new_v1() -> Self {
        Transaction {
            version: TRANSACTION_VERSION_ONE,
            coin_inputs: Vec::new(),
            coin_outputs: Vec::new(),
            block_stake_inputs: Vec::new(),
            block_stake_outputs: Vec::new(),
            miner_fees: Vec::new(),
            arbitrary_data: Vec::new(),
            extension: Vec::new(),
        }
    }

    pub fn id(&self) -> TransactionId {
        TransactionId(blake2b(&encoding::to_bytes(self)))
    }

    /// Identifier of the coin output at `index`, fixed by this transaction
    /// alone and independent of chain position.
    pub fn coin_output_id(&self, index: u64) -> CoinOutputId {
        let mut enc = Encoder::new();
        enc.write_raw(&self.id().0);
        enc.write_raw(&SPECIFIER_COIN_OUTPUT.0);
        enc.write_u64(index);
        CoinOutputId(blake2b(&enc.finish()))
    }

    /// Identifier of the block-stake output at `index`.
    pub fn block_stake_output_id(&self, index: u64) -> BlockStakeOutputId {
        let mut enc = Encoder::new();
        enc.write_raw(&self.id().0);
        enc.write_raw(&SPECIFIER_BLOCK_STAKE_OUTPUT.0);
        enc.write_u64(index);
        BlockStakeOutputId(blake2b(&enc.finish()))
    }

    /// Serialized size of the canonical encoding.
    pub fn encoded_len(&self) -> usize {
        encoding::encoded_len(self)
    }

    /// Digest signed by input fulfillments: covers every field except the
    /// signatures themselves, bound to one input index. `extra` carries
    /// fulfillment-specific objects (an atomic swap signs its public key and
    /// secret into the message).
    pub fn signature_hash(&self, input_index: u64, extra: &[&[u8]]) -> Hash {
        let mut enc = Encoder::new();
        enc.write_u8(self.version);
        enc.write_u64(input_index);
        for obj in extra {
            enc.write_slice(obj);
        }
        enc.write_u64(self.coin_inputs.len() as u64);
        for input in &self.coin_inputs {
            input.parent_id.bin_encode(&mut enc);
        }
        self.coin_outputs.bin_encode(&mut enc);
        enc.write_u64(self.block_stake_inputs.len() as u64);
        for input in &self.block_stake_inputs {
            input.parent_id.bin_encode(&mut enc);
        }
        self.block_stake_outputs.bin_encode(&mut enc);
        self.miner_fees.bin_encode(&mut enc);
        enc.write_slice(&self.arbitrary_data);
        enc.write_slice(&self.extension);
        blake2b(&enc.finish())
    }

    /// Sum of all miner fees.
    pub fn total_fee(&self) -> Result<Currency> {
        Currency::sum(self.miner_fees.iter())
    }
}

/// Structural validation of a standalone transaction: version, size limits,
/// fee floor, standardness of every condition and fulfillment, and
/// intra-transaction double spends. Ledger context (does the parent output
/// exist, does the fulfillment verify) is the diff engine's job.
pub fn check_transaction(tx: &Transaction, constants: &ChainConstants) -> Result<()> {
    if !KNOWN_TRANSACTION_VERSIONS.contains(&tx.version) {
        return Err(ConsensusError::UnknownTransactionVersion(tx.version));
    }

    let size = tx.encoded_len();
    if size > constants.transaction_size_limit {
        return Err(ConsensusError::LargeTransaction {
            size,
            limit: constants.transaction_size_limit,
        });
    }

    if tx.arbitrary_data.len() > constants.arbitrary_data_size_limit {
        return Err(ConsensusError::LargeArbitraryData {
            size: tx.arbitrary_data.len(),
            limit: constants.arbitrary_data_size_limit,
        });
    }

    if tx.miner_fees.is_empty() {
        return Err(ConsensusError::MissingMinerFee);
    }
    for fee in &tx.miner_fees {
        if *fee < constants.minimum_transaction_fee {
            return Err(ConsensusError::LowMinerFees);
        }
    }

    for output in &tx.coin_outputs {
        if output.value.is_zero() {
            return Err(ConsensusError::NonStandard("coin output of zero value".into()));
        }
        output.condition.is_standard()?;
    }
    for output in &tx.block_stake_outputs {
        if output.value.is_zero() {
            return Err(ConsensusError::NonStandard(
                "block stake output of zero value".into(),
            ));
        }
        output.condition.is_standard()?;
    }
    for input in &tx.coin_inputs {
        input.fulfillment.is_standard()?;
    }
    for input in &tx.block_stake_inputs {
        input.fulfillment.is_standard()?;
    }

    let mut seen_coins = std::collections::HashSet::new();
    for input in &tx.coin_inputs {
        if !seen_coins.insert(input.parent_id) {
            return Err(ConsensusError::DoubleSpend);
        }
    }
    let mut seen_stakes = std::collections::HashSet::new();
    for input in &tx.block_stake_inputs {
        if !seen_stakes.insert(input.parent_id) {
            return Err(ConsensusError::DoubleSpend);
        }
    }

    Ok(())
}

/// Size check for a whole set about to enter a block or the pool.
pub fn check_transaction_set_size(txs: &[Transaction], constants: &ChainConstants) -> Result<()> {
    let size = encoding::encoded_len(txs);
    if size > constants.transaction_set_size_limit {
        return Err(ConsensusError::LargeTransactionSet {
            size,
            limit: constants.transaction_set_size_limit,
        });
    }
    Ok(())
}

impl BinEncode for CoinInput {
    fn bin_encode(&self, enc: &mut Encoder) {
        self.parent_id.bin_encode(enc);
        self.fulfillment.bin_encode(enc);
    }
}

impl BinDecode for CoinInput {
    fn bin_decode(dec: &mut Decoder<'_>) -> std::result::Result<Self, DecodeError> {
        Ok(CoinInput {
            parent_id: CoinOutputId::bin_decode(dec)?,
            fulfillment: UnlockFulfillment::bin_decode(dec)?,
        })
    }
}

impl BinEncode for CoinOutput {
    fn bin_encode(&self, enc: &mut Encoder) {
        self.value.bin_encode(enc);
        self.condition.bin_encode(enc);
    }
}

impl BinDecode for CoinOutput {
    fn bin_decode(dec: &mut Decoder<'_>) -> std::result::Result<Self, DecodeError> {
        Ok(CoinOutput {
            value: Currency::bin_decode(dec)?,
            condition: UnlockCondition::bin_decode(dec)?,
        })
    }
}

impl BinEncode for BlockStakeInput {
    fn bin_encode(&self, enc: &mut Encoder) {
        self.parent_id.bin_encode(enc);
        self.fulfillment.bin_encode(enc);
    }
}

impl BinDecode for BlockStakeInput {
    fn bin_decode(dec: &mut Decoder<'_>) -> std::result::Result<Self, DecodeError> {
        Ok(BlockStakeInput {
            parent_id: BlockStakeOutputId::bin_decode(dec)?,
            fulfillment: UnlockFulfillment::bin_decode(dec)?,
        })
    }
}

impl BinEncode for BlockStakeOutput {
    fn bin_encode(&self, enc: &mut Encoder) {
        self.value.bin_encode(enc);
        self.condition.bin_encode(enc);
    }
}

impl BinDecode for BlockStakeOutput {
    fn bin_decode(dec: &mut Decoder<'_>) -> std::result::Result<Self, DecodeError> {
        Ok(BlockStakeOutput {
            value: Currency::bin_decode(dec)?,
            condition: UnlockCondition::bin_decode(dec)?,
        })
    }
}

impl BinEncode for Transaction {
    fn bin_encode(&self, enc: &mut Encoder) {
        enc.write_u8(self.version);
        self.coin_inputs.bin_encode(enc);
        self.coin_outputs.bin_encode(enc);
        self.block_stake_inputs.bin_encode(enc);
        self.block_stake_outputs.bin_encode(enc);
        self.miner_fees.bin_encode(enc);
        enc.write_slice(&self.arbitrary_data);
        enc.write_slice(&self.extension);
    }
}

impl BinDecode for Transaction {
    fn bin_decode(dec: &mut Decoder<'_>) -> std::result::Result<Self, DecodeError> {
        Ok(Transaction {
            version: dec.read_u8()?,
            coin_inputs: Vec::bin_decode(dec)?,
            coin_outputs: Vec::bin_decode(dec)?,
            block_stake_inputs: Vec::bin_decode(dec)?,
            block_stake_outputs: Vec::bin_decode(dec)?,
            miner_fees: Vec::bin_decode(dec)?,
            arbitrary_data: dec.read_slice()?.to_vec(),
            extension: dec.read_slice()?.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{SingleSignatureFulfillment, UnlockFulfillment};
    use crate::crypto::PublicKey;
    use crate::types::{UnlockHash, UnlockType};

    fn constants() -> ChainConstants {
        ChainConstants::devnet()
    }

    fn address(byte: u8) -> UnlockCondition {
        UnlockCondition::UnlockHash(UnlockHash::new(UnlockType::PUB_KEY, [byte; 32]))
    }

    fn signed_input(parent: [u8; 32]) -> CoinInput {
        CoinInput {
            parent_id: CoinOutputId(parent),
            fulfillment: UnlockFulfillment::SingleSignature(SingleSignatureFulfillment {
                public_key: PublicKey::new_ed25519([1; 32]),
                signature: vec![0; 64],
            }),
        }
    }

    fn valid_transaction() -> Transaction {
        let mut tx = Transaction::new_v1();
        tx.coin_inputs.push(signed_input([7; 32]));
        tx.coin_outputs.push(CoinOutput {
            value: Currency::new(90),
            condition: address(2),
        });
        tx.miner_fees.push(constants().minimum_transaction_fee);
        tx
    }

    #[test]
    fn check_transaction_accepts_valid() {
        assert!(check_transaction(&valid_transaction(), &constants()).is_ok());
    }

    #[test]
    fn check_transaction_rejects_unknown_version() {
        let mut tx = valid_transaction();
        tx.version = 9;
        assert_eq!(
            check_transaction(&tx, &constants()),
            Err(ConsensusError::UnknownTransactionVersion(9))
        );
    }

    #[test]
    fn check_transaction_rejects_missing_fee() {
        let mut tx = valid_transaction();
        tx.miner_fees.clear();
        assert_eq!(
            check_transaction(&tx, &constants()),
            Err(ConsensusError::MissingMinerFee)
        );
    }

    #[test]
    fn check_transaction_rejects_low_fee() {
        let mut tx = valid_transaction();
        tx.miner_fees = vec![Currency::new(0)];
        assert_eq!(
            check_transaction(&tx, &constants()),
            Err(ConsensusError::LowMinerFees)
        );
    }

    #[test]
    fn check_transaction_rejects_internal_double_spend() {
        let mut tx = valid_transaction();
        tx.coin_inputs.push(signed_input([7; 32]));
        assert_eq!(
            check_transaction(&tx, &constants()),
            Err(ConsensusError::DoubleSpend)
        );
    }

    #[test]
    fn check_transaction_rejects_oversized_arbitrary_data() {
        let mut tx = valid_transaction();
        tx.arbitrary_data = vec![0; constants().arbitrary_data_size_limit + 1];
        assert!(matches!(
            check_transaction(&tx, &constants()),
            Err(ConsensusError::LargeArbitraryData { .. })
        ));
    }

    #[test]
    fn size_limit_is_exact() {
        let mut constants = constants();
        let tx = valid_transaction();
        constants.transaction_size_limit = tx.encoded_len();
        assert!(check_transaction(&tx, &constants).is_ok());
        constants.transaction_size_limit = tx.encoded_len() - 1;
        assert!(matches!(
            check_transaction(&tx, &constants),
            Err(ConsensusError::LargeTransaction { .. })
        ));
    }

    #[test]
    fn set_size_limit_is_exact() {
        let mut constants = constants();
        let set = vec![valid_transaction(), valid_transaction()];
        let size = encoding::encoded_len(&set[..]);
        constants.transaction_set_size_limit = size;
        assert!(check_transaction_set_size(&set, &constants).is_ok());
        constants.transaction_set_size_limit = size - 1;
        assert!(matches!(
            check_transaction_set_size(&set, &constants),
            Err(ConsensusError::LargeTransactionSet { .. })
        ));
    }

    #[test]
    fn transaction_id_is_deterministic() {
        let a = valid_transaction();
        let b = valid_transaction();
        assert_eq!(a.id(), b.id());
        let mut c = valid_transaction();
        c.arbitrary_data = b"x".to_vec();
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn output_ids_depend_only_on_transaction_and_index() {
        let tx = valid_transaction();
        assert_eq!(tx.coin_output_id(0), tx.coin_output_id(0));
        assert_ne!(tx.coin_output_id(0), tx.coin_output_id(1));
        // Different asset kinds never collide, even at the same index.
        assert_ne!(tx.coin_output_id(0).0, tx.block_stake_output_id(0).0);
    }

    #[test]
    fn signature_hash_ignores_signatures() {
        let mut a = valid_transaction();
        let mut b = valid_transaction();
        if let UnlockFulfillment::SingleSignature(f) = &mut a.coin_inputs[0].fulfillment {
            f.signature = vec![1; 64];
        }
        if let UnlockFulfillment::SingleSignature(f) = &mut b.coin_inputs[0].fulfillment {
            f.signature = vec![2; 64];
        }
        assert_eq!(a.signature_hash(0, &[]), b.signature_hash(0, &[]));
        assert_ne!(a.signature_hash(0, &[]), a.signature_hash(1, &[]));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn binary_roundtrip() {
        let tx = valid_transaction();
        let bytes = encoding::to_bytes(&tx);
        let decoded: Transaction = encoding::from_bytes(&bytes).unwrap();
        assert_eq!(tx, decoded);
    }

    #[test]
    fn json_roundtrip() {
        let tx = valid_transaction();
        let json = serde_json::to_string(&tx).unwrap();
        let decoded: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(tx, decoded);
    }
}
