//! Atomic swap lifecycles: claim with the secret before the timeout, refund
//! after it, and the losing race for the refunded output.

use std::sync::Arc;

use ed25519_dalek::SigningKey;
use stakechain::block::{Block, MinerPayout, PobsSolution};
use stakechain::chain::ChainStore;
use stakechain::condition::{
    AtomicSwapCondition, AtomicSwapFulfillment, SingleSignatureFulfillment, UnlockCondition,
    UnlockFulfillment,
};
use stakechain::constants::{devnet_signing_key, ChainConstants};
use stakechain::crypto::{sha256, PublicKey};
use stakechain::explorer::Explorer;
use stakechain::transaction::{CoinInput, CoinOutput, Transaction};
use stakechain::types::{CoinOutputId, Currency, Timestamp, UnlockHash};
use stakechain::ConsensusError;

fn address_of(key: &SigningKey) -> UnlockHash {
    UnlockHash::from_public_key(&PublicKey::from_signing_key(key))
}

fn make_block(
    constants: &ChainConstants,
    parent: &Block,
    timestamp: Timestamp,
    txs: Vec<Transaction>,
) -> Block {
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
            unlock_hash: address_of(&devnet_signing_key()),
        }]
    };
    Block {
        parent_id: parent.id(),
        nonce: [1; 8],
        timestamp,
        pobs: PobsSolution {
            stake_output_id: constants.genesis_transaction().block_stake_output_id(0),
        },
        miner_payouts,
        transactions: txs,
    }
}

/// Locks the whole genesis coin allocation (minus fee) into a swap contract.
fn fund_contract(constants: &ChainConstants, contract: &AtomicSwapCondition) -> Transaction {
    let fee = constants.minimum_transaction_fee;
    let mut tx = Transaction::new_v1();
    tx.coin_inputs.push(CoinInput {
        parent_id: constants.genesis_transaction().coin_output_id(0),
        fulfillment: UnlockFulfillment::SingleSignature(SingleSignatureFulfillment {
            public_key: PublicKey::from_signing_key(&devnet_signing_key()),
            signature: Vec::new(),
        }),
    });
    tx.coin_outputs.push(CoinOutput {
        value: constants.genesis_coin_distribution[0]
            .value
            .checked_sub(&fee)
            .unwrap(),
        condition: UnlockCondition::AtomicSwap(contract.clone()),
    });
    tx.miner_fees.push(fee);
    let mut fulfillment = tx.coin_inputs[0].fulfillment.clone();
    fulfillment.sign(&tx, 0, &devnet_signing_key()).unwrap();
    tx.coin_inputs[0].fulfillment = fulfillment;
    tx
}

/// Spends a swap output with the given key and secret.
fn spend_contract(
    constants: &ChainConstants,
    parent: CoinOutputId,
    value: Currency,
    key: &SigningKey,
    secret: [u8; 32],
) -> Transaction {
    let fee = constants.minimum_transaction_fee;
    let mut tx = Transaction::new_v1();
    tx.coin_inputs.push(CoinInput {
        parent_id: parent,
        fulfillment: UnlockFulfillment::AtomicSwap(AtomicSwapFulfillment {
            public_key: PublicKey::from_signing_key(key),
            signature: Vec::new(),
            secret,
        }),
    });
    tx.coin_outputs.push(CoinOutput {
        value: value.checked_sub(&fee).unwrap(),
        condition: UnlockCondition::UnlockHash(address_of(key)),
    });
    tx.miner_fees.push(fee);
    let mut fulfillment = tx.coin_inputs[0].fulfillment.clone();
    fulfillment.sign(&tx, 0, key).unwrap();
    tx.coin_inputs[0].fulfillment = fulfillment;
    tx
}

#[test]
fn receiver_claims_with_the_secret_before_the_timeout() {
    let chain = ChainStore::new(ChainConstants::devnet());
    let constants = chain.constants();
    let explorer = Explorer::new(Arc::clone(&chain)).unwrap();

    let sender = devnet_signing_key();
    let receiver = SigningKey::from_bytes(&[11; 32]);
    let secret: [u8; 32] = rand::random();
    let contract = AtomicSwapCondition {
        sender: address_of(&sender),
        receiver: address_of(&receiver),
        hashed_secret: sha256(&secret),
        time_lock: constants.genesis_timestamp + 48 * 3600,
    };

    let fund = fund_contract(&constants, &contract);
    let funded_value = fund.coin_outputs[0].value;
    let genesis = chain.current_block();
    let b1 = make_block(&constants, &genesis, constants.genesis_timestamp + 30, vec![fund.clone()]);
    let now = constants.genesis_timestamp + 60;
    chain.accept_block_at(b1.clone(), now).unwrap();

    // Before the timeout the receiver claims with the matching secret.
    let claim = spend_contract(&constants, fund.coin_output_id(0), funded_value, &receiver, secret);
    let b2 = make_block(&constants, &b1, constants.genesis_timestamp + 60, vec![claim.clone()]);
    chain.accept_block_at(b2, now).unwrap();
    chain.flush_subscribers();

    // The revealed secret is recoverable from the indexed spenditure.
    let address = UnlockCondition::AtomicSwap(contract).unlock_hash();
    let indexed = explorer.contract(&address).unwrap();
    assert_eq!(indexed.secret, Some(secret));
    assert_eq!(indexed.spent_by, Some(claim.id()));
}

#[test]
fn sender_refunds_after_the_timeout_and_the_claim_races_lose() {
    let chain = ChainStore::new(ChainConstants::devnet());
    let constants = chain.constants();

    let sender = devnet_signing_key();
    let receiver = SigningKey::from_bytes(&[11; 32]);
    let secret = [42u8; 32];
    let time_lock = constants.genesis_timestamp + 300;
    let contract = AtomicSwapCondition {
        sender: address_of(&sender),
        receiver: address_of(&receiver),
        hashed_secret: sha256(&secret),
        time_lock,
    };

    let fund = fund_contract(&constants, &contract);
    let funded_value = fund.coin_outputs[0].value;
    let genesis = chain.current_block();
    let b1 = make_block(&constants, &genesis, constants.genesis_timestamp + 30, vec![fund.clone()]);
    chain
        .accept_block_at(b1.clone(), constants.genesis_timestamp + 60)
        .unwrap();

    // Refund attempt before the timeout is locked out.
    let early = spend_contract(&constants, fund.coin_output_id(0), funded_value, &sender, [0u8; 32]);
    let early_block = make_block(
        &constants,
        &b1,
        constants.genesis_timestamp + 60,
        vec![early],
    );
    assert_eq!(
        chain.accept_block_at(early_block, constants.genesis_timestamp + 90),
        Err(ConsensusError::Locked)
    );

    // After the timeout the sender's empty-secret refund goes through.
    let refund = spend_contract(&constants, fund.coin_output_id(0), funded_value, &sender, [0u8; 32]);
    let b2 = make_block(&constants, &b1, time_lock + 10, vec![refund]);
    chain.accept_block_at(b2.clone(), time_lock + 20).unwrap();

    // The receiver's late claim now points at a spent output.
    let claim = spend_contract(&constants, fund.coin_output_id(0), funded_value, &receiver, secret);
    let b3 = make_block(&constants, &b2, time_lock + 30, vec![claim]);
    assert!(matches!(
        chain.accept_block_at(b3, time_lock + 40),
        Err(ConsensusError::MissingOutput(_))
    ));
}
