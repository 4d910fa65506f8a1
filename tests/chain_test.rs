//! Chain-level scenarios: startup replay, height cap, reorg to a heavier
//! branch, mempool lifecycle, and the chain worker surface.

use std::sync::Arc;

use num_bigint::BigUint;
use pasl::block::{self, Block, BlockHeader};
use pasl::blockchain::{self, AddBlockResult, Blockchain};
use pasl::crypto::Keypair;
use pasl::defaults::{
    BLOCK_VERSION, MATURATION_HEIGHT, MIN_COMPACT_TARGET, PROTOCOL_AVAILABLE, PROTOCOL_VERSION,
    TARGET_TIMESPAN_SECONDS, TIMESTAMP_WINDOW,
};
use pasl::safebox::tx::Operation;
use pasl::safebox::{self, Safebox};
use pasl::storage::SledStorage;

/// Test miner: tracks a mirror of the chain state and produces fully
/// valid blocks (schedule, retarget, merkle, proof of work).
#[derive(Clone)]
struct Miner {
    key: Keypair,
    safebox: Safebox,
    prev_target: u32,
    next_timestamp: u32,
}

impl Miner {
    fn new() -> Self {
        Miner {
            key: Keypair::generate(),
            safebox: Safebox::new(),
            prev_target: MIN_COMPACT_TARGET,
            next_timestamp: 1,
        }
    }

    /// A competitor starting from the same chain state.
    fn fork(&self) -> Self {
        Miner {
            key: Keypair::generate(),
            safebox: self.safebox.clone(),
            prev_target: self.prev_target,
            next_timestamp: self.next_timestamp,
        }
    }

    fn mine(&mut self, operations: Vec<Operation>) -> Block {
        let height = self.safebox.get_height();
        let window = self.safebox.get_last_timestamps(TIMESTAMP_WINDOW as u32);
        let compact_target = block::next_compact_target(&window, self.prev_target);
        let timestamp = self.next_timestamp;
        self.next_timestamp += TARGET_TIMESPAN_SECONDS;

        let fee_total = operations.iter().map(Operation::fee).sum();
        let delta = block::difficulty(&block::decode_compact_target(compact_target));
        let mut staged = self.safebox.clone();
        staged
            .process_operations(&self.key.public, timestamp, &operations, &delta)
            .expect("test operations are valid");

        let mut header = BlockHeader {
            index: height,
            version: BLOCK_VERSION,
            protocol_version: PROTOCOL_VERSION,
            protocol_available: PROTOCOL_AVAILABLE,
            prev_safebox_hash: self.safebox.get_fingerprint(),
            reward_public_key: self.key.public,
            reward: safebox::get_reward(height),
            fee_total,
            timestamp,
            compact_target,
            nonce: 0,
            payload: Vec::new(),
            operations_merkle_root: block::operations_merkle_root(&operations),
            safebox_hash_after: staged.get_fingerprint(),
        };

        let target = block::decode_compact_target(compact_target);
        while BigUint::from_bytes_be(&header.pow_digest()) > target {
            header.nonce += 1;
        }

        staged.merge();
        self.safebox = staged;
        self.prev_target = compact_target;
        Block { header, operations }
    }

    fn transfer(&self, source: u32, op_id: u32, destination: u32, amount: u64, fee: u64) -> Operation {
        let mut op = Operation::Transfer {
            source,
            op_id,
            destination,
            amount,
            fee,
            payload: Vec::new(),
            signature: Vec::new(),
        };
        op.sign(&self.key);
        op
    }
}

fn open_chain() -> (tempfile::TempDir, Arc<SledStorage>, Blockchain) {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(SledStorage::open(dir.path().join("storage.db")).unwrap());
    let blockchain = Blockchain::new(storage.clone(), None).unwrap();
    (dir, storage, blockchain)
}

fn accept(blockchain: &mut Blockchain, block: Block) {
    match blockchain.add_block(block).unwrap() {
        AddBlockResult::Accepted => {}
        other => panic!("block not accepted: {other:?}"),
    }
}

#[test]
fn blocks_replay_to_the_same_state() {
    let (_dir, storage, mut blockchain) = open_chain();
    let mut miner = Miner::new();
    for _ in 0..8 {
        accept(&mut blockchain, miner.mine(Vec::new()));
    }
    let state = blockchain.get_state();
    assert_eq!(state.height, 8);
    drop(blockchain);

    let reloaded = Blockchain::new(storage.clone(), None).unwrap();
    let replayed = reloaded.get_state();
    assert_eq!(replayed.height, state.height);
    assert_eq!(replayed.safebox_hash, state.safebox_hash);
    assert_eq!(replayed.cumulative_difficulty, state.cumulative_difficulty);

    // operator-requested height cap stops the replay early
    let capped = Blockchain::new(storage, Some(3)).unwrap();
    assert_eq!(capped.get_state().height, 3);
}

#[test]
fn duplicate_orphan_and_tampered_blocks() {
    let (_dir, _storage, mut blockchain) = open_chain();
    let mut miner = Miner::new();
    let first = miner.mine(Vec::new());
    accept(&mut blockchain, first.clone());

    assert!(matches!(
        blockchain.add_block(first).unwrap(),
        AddBlockResult::Duplicate
    ));

    let second = miner.mine(Vec::new());
    let third = miner.mine(Vec::new());
    assert!(matches!(
        blockchain.add_block(third).unwrap(),
        AddBlockResult::Orphan
    ));

    let mut tampered = second.clone();
    tampered.header.fee_total += 1;
    assert!(matches!(
        blockchain.add_block(tampered).unwrap(),
        AddBlockResult::Invalid(_)
    ));
    assert_eq!(blockchain.get_state().height, 1);

    accept(&mut blockchain, second);
    assert_eq!(blockchain.get_state().height, 2);
}

#[test]
fn transfers_settle_on_chain() {
    let (_dir, _storage, mut blockchain) = open_chain();
    let mut miner = Miner::new();
    for _ in 0..MATURATION_HEIGHT {
        accept(&mut blockchain, miner.mine(Vec::new()));
    }
    let op = miner.transfer(0, 1, 2, 300, 5);
    accept(&mut blockchain, miner.mine(vec![op]));

    let source = blockchain.get_account(0).unwrap();
    let destination = blockchain.get_account(2).unwrap();
    assert_eq!(source.balance, 500_000 - 300 - 5);
    assert_eq!(source.n_operations, 1);
    assert_eq!(destination.balance, 300);

    // the fee lands in the winning block's first account
    let coinbase = blockchain
        .get_account(MATURATION_HEIGHT * pasl::defaults::ACCOUNTS_PER_BLOCK)
        .unwrap();
    assert_eq!(coinbase.balance, 500_000 + 5);
}

#[test]
fn heavier_branch_wins_and_replays_clean() {
    let (_dir, storage, mut blockchain) = open_chain();
    let mut miner = Miner::new();
    accept(&mut blockchain, miner.mine(Vec::new()));
    accept(&mut blockchain, miner.mine(Vec::new()));

    let mut rival = miner.fork();
    accept(&mut blockchain, miner.mine(Vec::new()));

    // equal work does not displace the tip
    let even = rival.clone().mine(Vec::new());
    assert!(matches!(
        blockchain.add_alt_chain(2, vec![even]).unwrap(),
        AddBlockResult::Invalid(_)
    ));

    // one block more does
    let branch = vec![rival.mine(Vec::new()), rival.mine(Vec::new())];
    assert!(matches!(
        blockchain.add_alt_chain(2, branch).unwrap(),
        AddBlockResult::Accepted
    ));

    let state = blockchain.get_state();
    assert_eq!(state.height, 4);
    assert_eq!(state.safebox_hash, rival.safebox.get_fingerprint());
    assert_eq!(
        state.cumulative_difficulty,
        rival.safebox.get_cumulative_difficulty()
    );

    // the reorganized chain replays from storage to the same state
    drop(blockchain);
    let reloaded = Blockchain::new(storage, None).unwrap();
    assert_eq!(reloaded.get_state().safebox_hash, state.safebox_hash);
}

#[test]
fn mempool_admits_and_evicts() {
    let (_dir, _storage, mut blockchain) = open_chain();
    let mut miner = Miner::new();
    for _ in 0..MATURATION_HEIGHT {
        accept(&mut blockchain, miner.mine(Vec::new()));
    }

    let op = miner.transfer(0, 1, 2, 300, 5);
    let digest = blockchain.add_operation(op.clone()).unwrap();
    assert_eq!(digest, op.digest());
    assert!(blockchain.add_operation(op.clone()).is_err());

    // unknown destination and immature source are refused
    let bad = miner.transfer(0, 1, 9_999_999, 1, 0);
    assert!(blockchain.add_operation(bad).is_err());
    let immature = miner.transfer(pasl::defaults::ACCOUNTS_PER_BLOCK * 99, 1, 2, 1, 0);
    assert!(blockchain.add_operation(immature).is_err());

    assert_eq!(blockchain.mempool_snapshot().len(), 1);

    // the operation is included in a block and leaves the pool
    accept(&mut blockchain, miner.mine(vec![op]));
    assert!(blockchain.mempool_snapshot().is_empty());
}

#[tokio::test]
async fn chain_worker_serves_handles() {
    let (_dir, _storage, blockchain) = open_chain();
    let (chain, worker) = blockchain::spawn(blockchain);
    let mut updates = chain.subscribe_blocks();

    let mut miner = Miner::new();
    let block = miner.mine(Vec::new());
    let result = chain
        .add_block_serialized(block.serialize())
        .await
        .unwrap();
    assert!(matches!(result, AddBlockResult::Accepted));

    let event = updates.recv().await.unwrap();
    assert_eq!(event.index, 0);

    let state = chain.get_state().await.unwrap();
    assert_eq!(state.height, 1);
    assert_eq!(state.safebox_hash, miner.safebox.get_fingerprint());

    let account = chain.get_account(0).await.unwrap().unwrap();
    assert_eq!(account.balance, 500_000);

    let found = chain
        .find_accounts(miner.key.public, 0, 10)
        .await
        .unwrap();
    assert_eq!(found.len(), 5);

    let exported = chain.export_safebox().await.unwrap();
    let mut buf = exported.as_slice();
    let snapshot = Safebox::deserialize(&mut buf).unwrap();
    assert_eq!(snapshot.get_fingerprint(), state.safebox_hash);

    drop(chain);
    drop(updates);
    worker.await.unwrap();
}
