//! Relay messages and the gateway interface.
//!
//! The peer-to-peer gateway itself lives outside this crate; the core only
//! defines the two RPC payloads it exchanges with peers and the trait through
//! which it hands them to whatever gateway the host wires in.

use crate::block::Block;
use crate::encoding::{self, BinDecode, BinEncode, DecodeError, Decoder, Encoder};
use crate::error::{ConsensusError, Result};
use crate::transaction::Transaction;

const MESSAGE_TAG_BLOCK: u8 = 1;
const MESSAGE_TAG_TRANSACTION_SET: u8 = 2;

/// A payload relayed between peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// `RelayBlock`: a candidate block for the consensus set.
    Block(Block),
    /// `RelayTransactionSet`: an ordered set of unconfirmed transactions.
    TransactionSet(Vec<Transaction>),
}

impl BinEncode for RelayMessage {
    fn bin_encode(&self, enc: &mut Encoder) {
        match self {
            RelayMessage::Block(block) => {
                enc.write_u8(MESSAGE_TAG_BLOCK);
                enc.write_slice(&encoding::to_bytes(block));
            }
            RelayMessage::TransactionSet(txs) => {
                enc.write_u8(MESSAGE_TAG_TRANSACTION_SET);
                enc.write_slice(&encoding::to_bytes(&txs[..]));
            }
        }
    }
}

impl BinDecode for RelayMessage {
    fn bin_decode(dec: &mut Decoder<'_>) -> std::result::Result<Self, DecodeError> {
        let tag = dec.read_u8()?;
        let body = dec.read_slice()?;
        match tag {
            MESSAGE_TAG_BLOCK => Ok(RelayMessage::Block(encoding::from_bytes(body)?)),
            MESSAGE_TAG_TRANSACTION_SET => {
                Ok(RelayMessage::TransactionSet(encoding::from_bytes(body)?))
            }
            other => Err(DecodeError::InvalidValue(format!("relay message tag {other}"))),
        }
    }
}

/// Decode a relay message received from a peer, bounded by `size_limit`
/// (the chain's block size limit in practice).
pub fn read_relay_message(bytes: &[u8], size_limit: usize) -> Result<RelayMessage> {
    if bytes.len() > size_limit {
        return Err(ConsensusError::LargeBlock {
            size: bytes.len(),
            limit: size_limit,
        });
    }
    encoding::from_bytes(bytes).map_err(ConsensusError::from)
}

/// The operations the core demands of the peer-to-peer gateway. Broadcast is
/// fire-and-forget; delivery guarantees are the gateway's concern.
pub trait Gateway: Send + Sync {
    fn broadcast(&self, message: &RelayMessage);
}
