//! Aggregated-facts accounting across a deep revert: after switching away
//! from fifty blocks of history, the explorer's totals match the fork point
//! and nothing from the abandoned blocks stays addressable.

use std::sync::Arc;

use ed25519_dalek::SigningKey;
use stakechain::block::{Block, MinerPayout, PobsSolution};
use stakechain::chain::ChainStore;
use stakechain::condition::{SingleSignatureFulfillment, UnlockCondition, UnlockFulfillment};
use stakechain::constants::{devnet_signing_key, ChainConstants};
use stakechain::crypto::PublicKey;
use stakechain::explorer::{Explorer, ReferencePoint};
use stakechain::transaction::{CoinInput, CoinOutput, Transaction};
use stakechain::types::{CoinOutputId, Currency, OutputId, UnlockHash};

fn address() -> UnlockHash {
    UnlockHash::from_public_key(&PublicKey::from_signing_key(&devnet_signing_key()))
}

fn make_block(
    constants: &ChainConstants,
    parent: &Block,
    seconds: u64,
    txs: Vec<Transaction>,
    nonce: u8,
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
            unlock_hash: address(),
        }]
    };
    Block {
        parent_id: parent.id(),
        nonce: [nonce; 8],
        timestamp: constants.genesis_timestamp + seconds,
        pobs: PobsSolution {
            stake_output_id: constants.genesis_transaction().block_stake_output_id(0),
        },
        miner_payouts,
        transactions: txs,
    }
}

/// A self-spend of `parent`, creating a fresh output each block.
fn churn(
    constants: &ChainConstants,
    owner: &SigningKey,
    parent: CoinOutputId,
    parent_value: Currency,
) -> Transaction {
    let fee = constants.minimum_transaction_fee;
    let mut tx = Transaction::new_v1();
    tx.coin_inputs.push(CoinInput {
        parent_id: parent,
        fulfillment: UnlockFulfillment::SingleSignature(SingleSignatureFulfillment {
            public_key: PublicKey::from_signing_key(owner),
            signature: Vec::new(),
        }),
    });
    tx.coin_outputs.push(CoinOutput {
        value: parent_value.checked_sub(&fee).unwrap(),
        condition: UnlockCondition::UnlockHash(address()),
    });
    tx.miner_fees.push(fee);
    let mut fulfillment = tx.coin_inputs[0].fulfillment.clone();
    fulfillment.sign(&tx, 0, owner).unwrap();
    tx.coin_inputs[0].fulfillment = fulfillment;
    tx
}

#[test]
fn totals_return_to_the_fork_point_after_a_deep_revert() {
    let chain = ChainStore::new(ChainConstants::devnet());
    let constants = chain.constants();
    let explorer = Explorer::new(Arc::clone(&chain)).unwrap();
    let owner = devnet_signing_key();
    let now = constants.genesis_timestamp + 100_000;

    // Fifty quiet blocks to height 50.
    let mut parent = chain.current_block();
    for height in 1..=50u64 {
        let block = make_block(&constants, &parent, height * 30, vec![], 1);
        chain.accept_block_at(block.clone(), now).unwrap();
        parent = block;
    }
    chain.flush_subscribers();
    let facts_at_50 = explorer.facts();
    assert_eq!(facts_at_50.height, 50);
    let fork_parent = parent.clone();

    // Fifty busy blocks to height 100, each churning the coin supply so that
    // every block creates outputs (a transfer plus a fee payout).
    let mut spent_output = constants.genesis_transaction().coin_output_id(0);
    let mut spent_value = constants.genesis_coin_distribution[0].value;
    let mut churn_ids = Vec::new();
    let mut churn_txids = Vec::new();
    for height in 51..=100u64 {
        let tx = churn(&constants, &owner, spent_output, spent_value);
        spent_output = tx.coin_output_id(0);
        spent_value = tx.coin_outputs[0].value;
        churn_ids.push(OutputId::from(spent_output));
        churn_txids.push(tx.id());
        let block = make_block(&constants, &parent, height * 30, vec![tx], 1);
        chain.accept_block_at(block.clone(), now).unwrap();
        parent = block;
    }
    chain.flush_subscribers();
    let facts_at_100 = explorer.facts();
    assert_eq!(facts_at_100.height, 100);
    // Every block mints a fee payout locked for the maturity delay; at the
    // tip only the youngest `maturity_delay` of them are still locked.
    assert_eq!(
        facts_at_100.total_locked_coins,
        constants
            .minimum_transaction_fee
            .checked_mul_u64(constants.maturity_delay)
            .unwrap()
    );

    // A heavier branch forks off the quiet prefix and reverts all fifty busy
    // blocks in one atomic switch.
    let mut side_parent = fork_parent;
    for step in 0..51u64 {
        let block = make_block(&constants, &side_parent, (51 + step) * 30 + 7, vec![], 9);
        let _ = chain.accept_block_at(block.clone(), now);
        side_parent = block;
    }
    chain.flush_subscribers();
    assert_eq!(chain.height(), 101);

    // Totals are exactly the fork-point totals again.
    let facts_after = explorer.facts();
    assert_eq!(facts_after.height, 101);
    assert_eq!(facts_after.total_coins, facts_at_50.total_coins);
    assert_eq!(facts_after.total_locked_coins, facts_at_50.total_locked_coins);
    assert_eq!(
        facts_after.total_block_stakes,
        facts_at_50.total_block_stakes
    );

    // Nothing created in the reverted blocks is addressable any more.
    for id in &churn_ids {
        assert!(explorer.output(id).is_none());
    }
    for txid in &churn_txids {
        assert!(explorer.transaction(txid).is_none());
    }

    // Reference points resolve to the new branch past the fork.
    let at_60 = explorer.block_at(ReferencePoint::Height(60)).unwrap();
    assert_eq!(explorer.block(&at_60).unwrap().height, 60);
    assert!(explorer.block(&at_60).unwrap().transaction_ids.is_empty());

    // The chain's own books agree with the explorer's.
    let utxo = chain.current_utxo();
    assert_eq!(utxo.total_coins().unwrap(), facts_after.total_coins);
    assert_eq!(
        utxo.total_block_stakes().unwrap(),
        facts_after.total_block_stakes
    );
}
