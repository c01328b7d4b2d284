//! Transaction pool: admission, conflict handling and fork reconciliation.
//!
//! The pool tracks unconfirmed transactions as sets. Every output id a set
//! consumes or creates is indexed, so any overlap with a new set is detected
//! as a conflict; legal children of a pooled set trigger the same detector
//! and are merged into a superset that is re-validated end to end. On each
//! consensus change the whole pool is re-derived: confirmed transactions are
//! dropped, transactions from reverted blocks re-enter, and sets that no
//! longer validate are removed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::RwLock;

use crate::chain::ChainStore;
use crate::constants::ChainConstants;
use crate::crypto::blake2b;
use crate::encoding;
use crate::error::{ConsensusError, PoolError};
use crate::relay::{Gateway, RelayMessage};
use crate::subscribe::ConsensusSubscriber;
use crate::transaction::{check_transaction, check_transaction_set_size, Transaction};
use crate::types::{
    BlockHeight, ConsensusChangeId, Currency, OutputId, TransactionId, TransactionSetId,
};
use crate::utxo::ConsensusChange;

/// Relay de-duplication window: recently accepted set ids and the height at
/// which they entered the pool.
const BROADCAST_CACHE_SIZE: usize = 1_000;

struct BroadcastCache {
    order: VecDeque<TransactionSetId>,
    heights: HashMap<TransactionSetId, BlockHeight>,
}

impl BroadcastCache {
    fn new() -> Self {
        BroadcastCache {
            order: VecDeque::new(),
            heights: HashMap::new(),
        }
    }

    fn add(&mut self, id: TransactionSetId, height: BlockHeight) {
        if self.heights.insert(id, height).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > BROADCAST_CACHE_SIZE {
            if let Some(evicted) = self.order.pop_front() {
                self.heights.remove(&evicted);
            }
        }
    }

    fn contains(&self, id: &TransactionSetId) -> bool {
        self.heights.contains_key(id)
    }
}

struct PoolInner {
    known_objects: HashMap<OutputId, TransactionSetId>,
    transaction_sets: HashMap<TransactionSetId, Vec<Transaction>>,
    transaction_set_diffs: HashMap<TransactionSetId, ConsensusChange>,
    pool_bytes: usize,
    confirmed_transactions: HashSet<TransactionId>,
    broadcast_cache: BroadcastCache,
    last_change: ConsensusChangeId,
}

/// The per-node mempool. Subscribes to the chain store on construction and
/// keeps itself consistent with the best chain from then on.
pub struct TransactionPool {
    chain: Arc<ChainStore>,
    gateway: Option<Arc<dyn Gateway>>,
    constants: ChainConstants,
    inner: RwLock<PoolInner>,
}

/// Digest identifying a transaction set.
pub fn transaction_set_id(txs: &[Transaction]) -> TransactionSetId {
    TransactionSetId(blake2b(&encoding::to_bytes(txs)))
}

/// Every object id a set touches: parents consumed and outputs created, for
/// both assets.
fn related_object_ids(txs: &[Transaction]) -> Vec<OutputId> {
    let mut ids = HashSet::new();
    for tx in txs {
        for input in &tx.coin_inputs {
            ids.insert(OutputId::from(input.parent_id));
        }
        for index in 0..tx.coin_outputs.len() {
            ids.insert(OutputId::from(tx.coin_output_id(index as u64)));
        }
        for input in &tx.block_stake_inputs {
            ids.insert(OutputId::from(input.parent_id));
        }
        for index in 0..tx.block_stake_outputs.len() {
            ids.insert(OutputId::from(tx.block_stake_output_id(index as u64)));
        }
    }
    ids.into_iter().collect()
}

impl TransactionPool {
    /// Open a pool on `chain`, replaying the whole change log so the
    /// confirmed-transaction index is complete before the first accept.
    pub fn new(
        chain: Arc<ChainStore>,
        gateway: Option<Arc<dyn Gateway>>,
    ) -> Result<Arc<Self>, ConsensusError> {
        let constants = chain.constants();
        let pool = Arc::new(TransactionPool {
            chain: Arc::clone(&chain),
            gateway,
            constants,
            inner: RwLock::new(PoolInner {
                known_objects: HashMap::new(),
                transaction_sets: HashMap::new(),
                transaction_set_diffs: HashMap::new(),
                pool_bytes: 0,
                confirmed_transactions: HashSet::new(),
                broadcast_cache: BroadcastCache::new(),
                last_change: ConsensusChangeId::BEGINNING,
            }),
        });
        chain.subscribe(pool.clone(), ConsensusChangeId::BEGINNING)?;
        Ok(pool)
    }

    /// Admit a transaction set into the pool and relay it to peers.
    pub fn accept_transaction_set(&self, txs: Vec<Transaction>) -> Result<(), PoolError> {
        let set_id = {
            let mut inner = self.inner.write();
            self.accept_set_locked(&mut inner, txs.clone())?
        };
        info!("accepted transaction set {set_id} in pool");
        if let Some(gateway) = &self.gateway {
            debug!("relaying transaction set {set_id} to peers");
            gateway.broadcast(&RelayMessage::TransactionSet(txs));
        }
        Ok(())
    }

    /// All pooled transactions, in an order acceptable for a block.
    pub fn transaction_list(&self) -> Vec<Transaction> {
        let inner = self.inner.read();
        let mut set_ids: Vec<&TransactionSetId> = inner.transaction_sets.keys().collect();
        set_ids.sort();
        let mut txs = Vec::new();
        for id in set_ids {
            txs.extend(inner.transaction_sets[id].iter().cloned());
        }
        txs
    }

    /// Look up one pooled transaction.
    pub fn transaction(&self, id: &TransactionId) -> Result<Transaction, ConsensusError> {
        let inner = self.inner.read();
        for set in inner.transaction_sets.values() {
            if let Some(tx) = set.iter().find(|tx| tx.id() == *id) {
                return Ok(tx.clone());
            }
        }
        Err(ConsensusError::UnknownTransaction)
    }

    /// Fee guidance for transaction builders: (minimum, recommended).
    pub fn fee_estimation(&self) -> (Currency, Currency) {
        (
            self.constants.minimum_transaction_fee,
            self.constants.minimum_transaction_fee,
        )
    }

    /// Bytes of encoded transactions currently pooled.
    pub fn pool_bytes(&self) -> usize {
        self.inner.read().pool_bytes
    }

    pub fn set_count(&self) -> usize {
        self.inner.read().transaction_sets.len()
    }

    /// Whether a set was recently accepted (relay de-duplication).
    pub fn recently_broadcast(&self, id: &TransactionSetId) -> bool {
        self.inner.read().broadcast_cache.contains(id)
    }

    /// Cursor of the last consensus change the pool has processed.
    pub fn last_consensus_change(&self) -> ConsensusChangeId {
        self.inner.read().last_change
    }

    // --- internals ---------------------------------------------------------

    fn accept_set_locked(
        &self,
        inner: &mut PoolInner,
        mut txs: Vec<Transaction>,
    ) -> Result<TransactionSetId, PoolError> {
        if txs.is_empty() {
            return Err(PoolError::EmptySet);
        }

        // Transactions already confirmed on the chain are stripped; a set
        // reduced to nothing is a duplicate, not an error in the set.
        txs.retain(|tx| !inner.confirmed_transactions.contains(&tx.id()));
        if txs.is_empty() {
            return Err(PoolError::DuplicateSet);
        }

        let set_id = transaction_set_id(&txs);
        if inner.transaction_sets.contains_key(&set_id) {
            return Err(PoolError::DuplicateSet);
        }

        self.validate_set_composition(inner, &txs)?;

        let object_ids = related_object_ids(&txs);
        let mut conflicts: Vec<TransactionSetId> = Vec::new();
        for oid in &object_ids {
            if let Some(conflict) = inner.known_objects.get(oid) {
                if !conflicts.contains(conflict) {
                    conflicts.push(*conflict);
                }
            }
        }
        if !conflicts.is_empty() {
            debug!("transaction set {set_id} conflicts with {} sets", conflicts.len());
            return self.handle_conflicts(inner, txs, conflicts);
        }

        let change = self.chain.try_transaction_set(&txs)?;
        self.install_set(inner, set_id, txs, change);
        Ok(set_id)
    }

    /// Pool-local composition rules for a candidate set: set size, per
    /// transaction structure, and the pool byte bound.
    fn validate_set_composition(
        &self,
        inner: &PoolInner,
        txs: &[Transaction],
    ) -> Result<(), PoolError> {
        check_transaction_set_size(txs, &self.constants)?;
        for tx in txs {
            check_transaction(tx, &self.constants)?;
        }
        let size = encoding::encoded_len(txs);
        if inner.pool_bytes + size > self.constants.pool_size_limit {
            return Err(PoolError::FullPool);
        }
        Ok(())
    }

    /// Merge a conflicting set with the sets it overlaps. Duplicates of
    /// already-pooled transactions are discarded first; if that prunes the
    /// set, the remaining conflicts are recomputed once (the first
    /// deduplication is complete, so the recursion terminates after one extra
    /// pass). The merged superset is validated end to end and replaces the
    /// old sets only if it stands on its own.
    fn handle_conflicts(
        &self,
        inner: &mut PoolInner,
        txs: Vec<Transaction>,
        conflicts: Vec<TransactionSetId>,
    ) -> Result<TransactionSetId, PoolError> {
        let mut conflict_txids: HashMap<TransactionId, TransactionSetId> = HashMap::new();
        for conflict in &conflicts {
            if let Some(set) = inner.transaction_sets.get(conflict) {
                for tx in set {
                    conflict_txids.insert(tx.id(), *conflict);
                }
            }
        }

        let dedup: Vec<Transaction> = txs
            .iter()
            .filter(|tx| !conflict_txids.contains_key(&tx.id()))
            .cloned()
            .collect();
        if dedup.is_empty() {
            return Err(PoolError::DuplicateSet);
        }
        if dedup.len() < txs.len() {
            let object_ids = related_object_ids(&dedup);
            let mut reduced: Vec<TransactionSetId> = Vec::new();
            for oid in &object_ids {
                if let Some(conflict) = inner.known_objects.get(oid) {
                    if !reduced.contains(conflict) {
                        reduced.push(*conflict);
                    }
                }
            }
            if reduced.is_empty() {
                let set_id = transaction_set_id(&dedup);
                self.validate_set_composition(inner, &dedup)?;
                let change = self.chain.try_transaction_set(&dedup)?;
                self.install_set(inner, set_id, dedup, change);
                return Ok(set_id);
            }
            return self.handle_conflicts(inner, dedup, reduced);
        }

        // Merge in a stable order: each conflict set keeps its own order, the
        // new transactions go last to preserve dependency ordering.
        let mut merged_ids: Vec<TransactionSetId> = conflicts.clone();
        merged_ids.sort();
        merged_ids.dedup();
        let mut superset: Vec<Transaction> = Vec::new();
        for conflict in &merged_ids {
            if let Some(set) = inner.transaction_sets.get(conflict) {
                superset.extend(set.iter().cloned());
            }
        }
        superset.extend(dedup);

        // Account for the bytes the old sets will free before bounding.
        let mut freed = 0usize;
        for conflict in &merged_ids {
            if let Some(set) = inner.transaction_sets.get(conflict) {
                freed += encoding::encoded_len(&set[..]);
            }
        }
        check_transaction_set_size(&superset, &self.constants)?;
        for tx in &superset {
            check_transaction(tx, &self.constants)?;
        }
        let superset_size = encoding::encoded_len(&superset[..]);
        if inner.pool_bytes.saturating_sub(freed) + superset_size > self.constants.pool_size_limit {
            return Err(PoolError::FullPool);
        }

        let change = self.chain.try_transaction_set(&superset)?;

        for conflict in &merged_ids {
            if let Some(set) = inner.transaction_sets.remove(conflict) {
                inner.pool_bytes -= encoding::encoded_len(&set[..]);
            }
            inner.transaction_set_diffs.remove(conflict);
        }
        let set_id = transaction_set_id(&superset);
        self.install_set(inner, set_id, superset, change);
        Ok(set_id)
    }

    fn install_set(
        &self,
        inner: &mut PoolInner,
        set_id: TransactionSetId,
        txs: Vec<Transaction>,
        change: ConsensusChange,
    ) {
        for oid in related_object_ids(&txs) {
            inner.known_objects.insert(oid, set_id);
        }
        inner.pool_bytes += encoding::encoded_len(&txs[..]);
        inner.transaction_sets.insert(set_id, txs);
        inner.transaction_set_diffs.insert(set_id, change);
        inner
            .broadcast_cache
            .add(set_id, self.chain.height());
    }
}

impl ConsensusSubscriber for TransactionPool {
    /// Reconcile the pool with a chain movement: applied transactions become
    /// confirmed, reverted ones become candidates again, and every surviving
    /// set is re-validated against the new state.
    fn process_consensus_change(&self, change: &ConsensusChange) {
        let mut inner = self.inner.write();

        for block in &change.reverted_blocks {
            for tx in &block.transactions {
                inner.confirmed_transactions.remove(&tx.id());
            }
        }
        for block in &change.applied_blocks {
            for tx in &block.transactions {
                inner.confirmed_transactions.insert(tx.id());
            }
        }
        inner.last_change = change.id;

        // Rebuild from scratch: old sets first (stable order), then the
        // transactions freed by reverted blocks, one singleton set each.
        let mut old_sets: Vec<(TransactionSetId, Vec<Transaction>)> =
            inner.transaction_sets.drain().collect();
        old_sets.sort_by_key(|(id, _)| *id);
        inner.known_objects.clear();
        inner.transaction_set_diffs.clear();
        inner.pool_bytes = 0;

        let mut candidates: Vec<Vec<Transaction>> =
            old_sets.into_iter().map(|(_, txs)| txs).collect();
        for block in &change.reverted_blocks {
            for tx in &block.transactions {
                candidates.push(vec![tx.clone()]);
            }
        }

        for candidate in candidates {
            if let Err(err) = self.accept_set_locked(&mut inner, candidate) {
                debug!("dropping transaction set during reconciliation: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainStore;
    use crate::condition::{SingleSignatureFulfillment, UnlockCondition, UnlockFulfillment};
    use crate::constants::devnet_signing_key;
    use crate::crypto::PublicKey;
    use crate::transaction::{CoinInput, CoinOutput};
    use crate::types::{UnlockHash, UnlockType};
    use ed25519_dalek::SigningKey;

    fn setup() -> (Arc<ChainStore>, Arc<TransactionPool>) {
        let chain = ChainStore::new(ChainConstants::devnet());
        let pool = TransactionPool::new(Arc::clone(&chain), None).unwrap();
        (chain, pool)
    }

    fn fee() -> u64 {
        100_000_000
    }

    /// Spend the devnet genesis coin output to `key`'s address.
    fn spend_genesis(constants: &ChainConstants, to: &SigningKey, arbitrary: &[u8]) -> Transaction {
        let genesis_tx = constants.genesis_transaction();
        let total = constants.genesis_coin_distribution[0].value;
        let mut tx = Transaction::new_v1();
        tx.coin_inputs.push(CoinInput {
            parent_id: genesis_tx.coin_output_id(0),
            fulfillment: UnlockFulfillment::SingleSignature(SingleSignatureFulfillment {
                public_key: PublicKey::from_signing_key(&devnet_signing_key()),
                signature: Vec::new(),
            }),
        });
        tx.coin_outputs.push(CoinOutput {
            value: total.checked_sub(&Currency::new(fee())).unwrap(),
            condition: UnlockCondition::UnlockHash(UnlockHash::from_public_key(
                &PublicKey::from_signing_key(to),
            )),
        });
        tx.miner_fees.push(Currency::new(fee()));
        tx.arbitrary_data = arbitrary.to_vec();
        let mut fulfillment = tx.coin_inputs[0].fulfillment.clone();
        fulfillment.sign(&tx, 0, &devnet_signing_key()).unwrap();
        tx.coin_inputs[0].fulfillment = fulfillment;
        tx
    }

    /// A follow-up transaction spending `parent`'s first output with `key`.
    fn spend_child(parent: &Transaction, key: &SigningKey) -> Transaction {
        let mut tx = Transaction::new_v1();
        tx.coin_inputs.push(CoinInput {
            parent_id: parent.coin_output_id(0),
            fulfillment: UnlockFulfillment::SingleSignature(SingleSignatureFulfillment {
                public_key: PublicKey::from_signing_key(key),
                signature: Vec::new(),
            }),
        });
        tx.coin_outputs.push(CoinOutput {
            value: parent.coin_outputs[0]
                .value
                .checked_sub(&Currency::new(fee()))
                .unwrap(),
            condition: UnlockCondition::UnlockHash(UnlockHash::from_public_key(
                &PublicKey::from_signing_key(key),
            )),
        });
        tx.miner_fees.push(Currency::new(fee()));
        let mut fulfillment = tx.coin_inputs[0].fulfillment.clone();
        fulfillment.sign(&tx, 0, key).unwrap();
        tx.coin_inputs[0].fulfillment = fulfillment;
        tx
    }

    #[test]
    fn accepts_a_valid_set() {
        let (chain, pool) = setup();
        let recipient = SigningKey::from_bytes(&[9; 32]);
        let tx = spend_genesis(&chain.constants(), &recipient, b"");
        pool.accept_transaction_set(vec![tx.clone()]).unwrap();
        assert_eq!(pool.set_count(), 1);
        assert_eq!(pool.transaction(&tx.id()).unwrap(), tx);
        assert!(pool.pool_bytes() > 0);
    }

    #[test]
    fn empty_set_is_rejected() {
        let (_, pool) = setup();
        assert_eq!(
            pool.accept_transaction_set(vec![]),
            Err(PoolError::EmptySet)
        );
    }

    #[test]
    fn duplicate_set_is_rejected() {
        let (chain, pool) = setup();
        let recipient = SigningKey::from_bytes(&[9; 32]);
        let tx = spend_genesis(&chain.constants(), &recipient, b"");
        pool.accept_transaction_set(vec![tx.clone()]).unwrap();
        assert_eq!(
            pool.accept_transaction_set(vec![tx]),
            Err(PoolError::DuplicateSet)
        );
    }

    #[test]
    fn invalid_spend_is_rejected() {
        let (chain, pool) = setup();
        let recipient = SigningKey::from_bytes(&[9; 32]);
        let mut tx = spend_genesis(&chain.constants(), &recipient, b"");
        if let UnlockFulfillment::SingleSignature(f) = &mut tx.coin_inputs[0].fulfillment {
            f.signature[0] ^= 0xFF;
        }
        assert!(matches!(
            pool.accept_transaction_set(vec![tx]),
            Err(PoolError::Consensus(_))
        ));
        assert_eq!(pool.set_count(), 0);
    }

    #[test]
    fn double_spend_conflict_is_not_retained() {
        let (chain, pool) = setup();
        let constants = chain.constants();
        let tx_x = spend_genesis(&constants, &SigningKey::from_bytes(&[9; 32]), b"x");
        let tx_y = spend_genesis(&constants, &SigningKey::from_bytes(&[10; 32]), b"y");
        pool.accept_transaction_set(vec![tx_x.clone()]).unwrap();

        // Y spends the same genesis output: the merged superset double-spends
        // and fails validation, so Y is dropped and X stays.
        assert!(pool.accept_transaction_set(vec![tx_y.clone()]).is_err());
        assert_eq!(pool.set_count(), 1);
        assert!(pool.transaction(&tx_x.id()).is_ok());
        assert!(pool.transaction(&tx_y.id()).is_err());
    }

    #[test]
    fn dependent_child_merges_into_a_superset() {
        let (chain, pool) = setup();
        let recipient = SigningKey::from_bytes(&[9; 32]);
        let tx = spend_genesis(&chain.constants(), &recipient, b"");
        pool.accept_transaction_set(vec![tx.clone()]).unwrap();

        let child = spend_child(&tx, &recipient);
        pool.accept_transaction_set(vec![child.clone()]).unwrap();

        // One merged set holding parent then child, parent order preserved.
        assert_eq!(pool.set_count(), 1);
        let listed = pool.transaction_list();
        assert_eq!(listed, vec![tx, child]);
    }

    #[test]
    fn resubmitted_transaction_inside_a_bigger_set_is_deduplicated() {
        let (chain, pool) = setup();
        let recipient = SigningKey::from_bytes(&[9; 32]);
        let tx = spend_genesis(&chain.constants(), &recipient, b"");
        pool.accept_transaction_set(vec![tx.clone()]).unwrap();

        let child = spend_child(&tx, &recipient);
        pool.accept_transaction_set(vec![tx.clone(), child.clone()])
            .unwrap();
        assert_eq!(pool.set_count(), 1);
        assert_eq!(pool.transaction_list().len(), 2);
    }

    #[test]
    fn confirmed_transactions_leave_the_pool() {
        let (chain, pool) = setup();
        let constants = chain.constants();
        let recipient = SigningKey::from_bytes(&[9; 32]);
        let tx = spend_genesis(&constants, &recipient, b"");
        pool.accept_transaction_set(vec![tx.clone()]).unwrap();

        // Commit the pooled transaction into a block.
        let genesis = chain.current_block();
        let block = crate::block::Block {
            parent_id: genesis.id(),
            nonce: [1; 8],
            timestamp: constants.genesis_timestamp + 30,
            pobs: crate::block::PobsSolution {
                stake_output_id: constants.genesis_transaction().block_stake_output_id(0),
            },
            miner_payouts: vec![crate::block::MinerPayout {
                value: Currency::new(fee()),
                unlock_hash: UnlockHash::new(UnlockType::PUB_KEY, [7; 32]),
            }],
            transactions: vec![tx.clone()],
        };
        chain
            .accept_block_at(block, constants.genesis_timestamp + 60)
            .unwrap();
        chain.flush_subscribers();

        assert_eq!(pool.set_count(), 0);
        assert!(pool.transaction(&tx.id()).is_err());
        // Resubmitting the confirmed transaction is reported as a duplicate.
        assert_eq!(
            pool.accept_transaction_set(vec![tx]),
            Err(PoolError::DuplicateSet)
        );
    }

    #[test]
    fn pool_size_bound_is_enforced() {
        let chain = ChainStore::new(ChainConstants::devnet());
        let pool = TransactionPool::new(Arc::clone(&chain), None).unwrap();
        {
            let mut inner = pool.inner.write();
            inner.pool_bytes = pool.constants.pool_size_limit;
        }
        let tx = spend_genesis(&chain.constants(), &SigningKey::from_bytes(&[9; 32]), b"");
        assert_eq!(
            pool.accept_transaction_set(vec![tx]),
            Err(PoolError::FullPool)
        );
    }

    #[test]
    fn fee_estimation_returns_the_chain_minimum() {
        let (chain, pool) = setup();
        let minimum = chain.constants().minimum_transaction_fee;
        assert_eq!(pool.fee_estimation(), (minimum, minimum));
    }
}
