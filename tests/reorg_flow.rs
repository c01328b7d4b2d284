//! Fork switching end to end: a heavier side chain takes over atomically and
//! the transactions it orphaned re-enter the pool.

use std::sync::Arc;

use ed25519_dalek::SigningKey;
use stakechain::block::{Block, MinerPayout, PobsSolution};
use stakechain::chain::ChainStore;
use stakechain::condition::{SingleSignatureFulfillment, UnlockCondition, UnlockFulfillment};
use stakechain::constants::{devnet_signing_key, ChainConstants};
use stakechain::crypto::PublicKey;
use stakechain::mempool::TransactionPool;
use stakechain::transaction::{CoinInput, CoinOutput, Transaction};
use stakechain::types::{ConsensusChangeId, Currency, UnlockHash};

fn address_of(key: &SigningKey) -> UnlockHash {
    UnlockHash::from_public_key(&PublicKey::from_signing_key(key))
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
            unlock_hash: address_of(&devnet_signing_key()),
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

#[test]
fn reorg_reverts_and_requeues_transactions() {
    let chain = ChainStore::new(ChainConstants::devnet());
    let constants = chain.constants();
    let pool = TransactionPool::new(Arc::clone(&chain), None).unwrap();
    let now = constants.genesis_timestamp + 600;

    // T1 spends the genesis coins; it is committed in B2 on the first branch.
    let fee = constants.minimum_transaction_fee;
    let recipient = SigningKey::from_bytes(&[21; 32]);
    let mut t1 = Transaction::new_v1();
    t1.coin_inputs.push(CoinInput {
        parent_id: constants.genesis_transaction().coin_output_id(0),
        fulfillment: UnlockFulfillment::SingleSignature(SingleSignatureFulfillment {
            public_key: PublicKey::from_signing_key(&devnet_signing_key()),
            signature: Vec::new(),
        }),
    });
    t1.coin_outputs.push(CoinOutput {
        value: constants.genesis_coin_distribution[0]
            .value
            .checked_sub(&fee)
            .unwrap(),
        condition: UnlockCondition::UnlockHash(address_of(&recipient)),
    });
    t1.miner_fees.push(fee);
    let mut fulfillment = t1.coin_inputs[0].fulfillment.clone();
    fulfillment.sign(&t1, 0, &devnet_signing_key()).unwrap();
    t1.coin_inputs[0].fulfillment = fulfillment;

    let genesis = chain.current_block();
    let b1 = make_block(&constants, &genesis, 30, vec![], 1);
    let b2 = make_block(&constants, &b1, 60, vec![t1.clone()], 2);
    chain.accept_block_at(b1.clone(), now).unwrap();
    chain.accept_block_at(b2.clone(), now).unwrap();
    chain.flush_subscribers();
    assert_eq!(chain.height(), 2);
    // Confirmed: T1 is not in the pool.
    assert!(pool.transaction(&t1.id()).is_err());

    // A heavier empty branch arrives.
    let c1 = make_block(&constants, &genesis, 40, vec![], 11);
    let c2 = make_block(&constants, &c1, 70, vec![], 12);
    let c3 = make_block(&constants, &c2, 100, vec![], 13);
    let _ = chain.accept_block_at(c1.clone(), now);
    let _ = chain.accept_block_at(c2.clone(), now);
    chain.accept_block_at(c3.clone(), now).unwrap();
    chain.flush_subscribers();

    // The switch is complete and atomic.
    assert_eq!(chain.height(), 3);
    assert_eq!(chain.current_block().id(), c3.id());
    let changes = chain.changes_since(ConsensusChangeId::BEGINNING).unwrap();
    let reverted_ids: Vec<_> = changes
        .iter()
        .flat_map(|c| c.reverted_blocks.iter().map(|b| b.id()))
        .collect();
    assert!(reverted_ids.contains(&b2.id()));
    assert!(reverted_ids.contains(&b1.id()));

    // T1 is unconfirmed again, still valid on the new branch, so the pool
    // picked it back up.
    assert!(pool.transaction(&t1.id()).is_ok());
    let utxo = chain.current_utxo();
    assert!(utxo
        .coin(&constants.genesis_transaction().coin_output_id(0))
        .is_some());
    assert!(utxo.coin(&t1.coin_output_id(0)).is_none());

    // Fork safety: switching forward again to an even heavier version of the
    // original branch restores its exact state.
    let b3 = make_block(&constants, &b2, 90, vec![], 3);
    let b4 = make_block(&constants, &b3, 120, vec![], 4);
    let _ = chain.accept_block_at(b3.clone(), now);
    chain.accept_block_at(b4.clone(), now).unwrap();
    chain.flush_subscribers();
    assert_eq!(chain.height(), 4);
    assert_eq!(chain.current_block().id(), b4.id());
    let utxo = chain.current_utxo();
    // T1 is confirmed again on this branch.
    assert!(utxo.coin(&t1.coin_output_id(0)).is_some());
    assert!(pool.transaction(&t1.id()).is_err());
}
