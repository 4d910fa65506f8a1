//! Reference scenarios for the safebox: reward curve, maturation lock,
//! signature binding, dirty-pack tracking and snapshot stability.

use num_bigint::BigUint;
use pasl::crypto::Keypair;
use pasl::defaults::{ACCOUNTS_PER_BLOCK, MATURATION_HEIGHT};
use pasl::safebox::tx::{OpError, Operation};
use pasl::safebox::{self, ProcessError, Safebox};

fn transfer(
    source: u32,
    op_id: u32,
    destination: u32,
    amount: u64,
    fee: u64,
    key: &Keypair,
) -> Operation {
    let mut op = Operation::Transfer {
        source,
        op_id,
        destination,
        amount,
        fee,
        payload: Vec::new(),
        signature: Vec::new(),
    };
    op.sign(key);
    op
}

fn grow(safebox: &mut Safebox, miner: &Keypair, blocks: u32) {
    for block in 0..blocks {
        safebox
            .process_operations(&miner.public, block, &[], &BigUint::default())
            .unwrap();
    }
}

#[test]
fn reward_curve() {
    assert_eq!(safebox::get_reward(0), 500_000);
    assert_eq!(safebox::get_reward(420_479), 500_000);
    assert_eq!(safebox::get_reward(420_480), 250_000);
    assert_eq!(safebox::get_reward(1_000_000_000), 10_000);
}

#[test]
fn maturation_and_transfer_flow() {
    let miner = Keypair::generate();
    let mut safebox = Safebox::new();

    let mut timestamps = Vec::new();
    for _ in 0..MATURATION_HEIGHT {
        let timestamp: u32 = rand::random();
        safebox
            .process_operations(&miner.public, timestamp, &[], &BigUint::default())
            .unwrap();
        timestamps.insert(0, timestamp);
    }

    let updated = safebox.get_updated_packs();
    assert_eq!(updated, (0..MATURATION_HEIGHT).collect::<Vec<u32>>());
    assert_eq!(safebox.get_last_timestamps(10), timestamps[..10]);
    assert_eq!(
        safebox.get_last_timestamps(MATURATION_HEIGHT + 5),
        timestamps
    );
    assert_eq!(safebox.get_height(), MATURATION_HEIGHT);

    safebox.merge();
    assert!(safebox.get_updated_packs().is_empty());

    safebox.rollback();
    assert_eq!(safebox.get_height(), MATURATION_HEIGHT);

    // an account funded by block 1 has not matured at height 100
    {
        let op = transfer(ACCOUNTS_PER_BLOCK, 1, 2, 3, 4, &miner);
        let height = safebox.get_height();
        let err = safebox
            .process_operations(&miner.public, 0, &[op], &BigUint::default())
            .unwrap_err();
        assert!(matches!(
            err,
            ProcessError::Operation {
                source: OpError::Immature { .. },
                ..
            }
        ));
        assert_eq!(safebox.get_height(), height);
    }

    // the same transfer from the genesis pack settles
    {
        let before = safebox.get_account(0).unwrap().balance;
        let stranger = Keypair::generate();
        let op = transfer(0, 1, 2, 3, 4, &stranger);
        let height = safebox.get_height();
        let err = safebox
            .process_operations(&miner.public, 0, &[op], &BigUint::default())
            .unwrap_err();
        assert!(matches!(
            err,
            ProcessError::Operation {
                source: OpError::WrongSignature,
                ..
            }
        ));
        assert_eq!(safebox.get_height(), height);

        let op = transfer(0, 1, 2, 3, 4, &miner);
        safebox
            .process_operations(&miner.public, 0, &[op], &BigUint::default())
            .unwrap();
        assert_eq!(safebox.get_height(), height + 1);
        assert_eq!(safebox.get_account(0).unwrap().balance, before - 3 - 4);
        assert_eq!(safebox.get_account(2).unwrap().balance, 3);
    }
}

#[test]
fn self_transfer_is_rejected() {
    let miner = Keypair::generate();
    let mut safebox = Safebox::new();
    grow(&mut safebox, &miner, MATURATION_HEIGHT);
    safebox.merge();

    let op = transfer(0, 1, 0, 3, 4, &miner);
    let err = safebox
        .process_operations(&miner.public, 0, &[op], &BigUint::default())
        .unwrap_err();
    assert!(matches!(
        err,
        ProcessError::Operation {
            source: OpError::SelfTransfer(0),
            ..
        }
    ));
    assert_eq!(safebox.get_height(), MATURATION_HEIGHT);
}

#[test]
fn operation_id_must_increase() {
    let miner = Keypair::generate();
    let mut safebox = Safebox::new();
    grow(&mut safebox, &miner, MATURATION_HEIGHT);
    safebox.merge();

    let op = transfer(0, 1, 2, 3, 0, &miner);
    safebox
        .process_operations(&miner.public, 0, &[op.clone()], &BigUint::default())
        .unwrap();

    // replaying the same operation id is rejected before maturation kicks in
    let err = safebox
        .process_operations(&miner.public, 0, &[op], &BigUint::default())
        .unwrap_err();
    assert!(matches!(
        err,
        ProcessError::Operation {
            source: OpError::BadOperationId {
                account: 0,
                expected: 2,
                got: 1
            },
            ..
        }
    ));
}

#[test]
fn insufficient_balance_is_rejected() {
    let miner = Keypair::generate();
    let mut safebox = Safebox::new();
    grow(&mut safebox, &miner, MATURATION_HEIGHT);
    safebox.merge();

    let balance = safebox.get_account(0).unwrap().balance;
    let op = transfer(0, 1, 2, balance, 1, &miner);
    let err = safebox
        .process_operations(&miner.public, 0, &[op], &BigUint::default())
        .unwrap_err();
    assert!(matches!(
        err,
        ProcessError::Operation {
            source: OpError::InsufficientBalance(0),
            ..
        }
    ));
}

#[test]
fn change_key_is_validated_like_transfer() {
    let miner = Keypair::generate();
    let next_owner = Keypair::generate();
    let mut safebox = Safebox::new();
    grow(&mut safebox, &miner, MATURATION_HEIGHT);
    safebox.merge();

    // immature source
    {
        let mut op = Operation::ChangeKey {
            source: ACCOUNTS_PER_BLOCK,
            op_id: 1,
            fee: 2,
            payload: Vec::new(),
            new_public_key: next_owner.public,
            signature: Vec::new(),
        };
        op.sign(&miner);
        let err = safebox
            .process_operations(&miner.public, 0, &[op], &BigUint::default())
            .unwrap_err();
        assert!(matches!(
            err,
            ProcessError::Operation {
                source: OpError::Immature { .. },
                ..
            }
        ));
    }

    // owner rotates the key of account 0
    let before = safebox.get_account(0).unwrap().balance;
    let mut op = Operation::ChangeKey {
        source: 0,
        op_id: 1,
        fee: 2,
        payload: Vec::new(),
        new_public_key: next_owner.public,
        signature: Vec::new(),
    };
    op.sign(&miner);
    safebox
        .process_operations(&miner.public, 0, &[op], &BigUint::default())
        .unwrap();

    let account = safebox.get_account(0).unwrap();
    assert_eq!(account.balance, before - 2);
    assert_eq!(account.n_operations, 1);
    assert_eq!(account.public_key, next_owner.public);

    // the old owner can no longer sign for the account
    let op = transfer(0, 2, 2, 1, 0, &miner);
    let err = safebox
        .process_operations(&miner.public, 0, &[op], &BigUint::default())
        .unwrap_err();
    assert!(matches!(
        err,
        ProcessError::Operation {
            source: OpError::WrongSignature,
            ..
        }
    ));
}

#[test]
fn snapshot_round_trip_matches_fingerprint() {
    let miner = Keypair::generate();
    let mut safebox = Safebox::new();
    grow(&mut safebox, &miner, MATURATION_HEIGHT);
    let op = transfer(0, 1, 7, 123, 1, &miner);
    safebox
        .process_operations(&miner.public, 42, &[op], &BigUint::from(9u32))
        .unwrap();
    safebox.merge();

    let mut bytes = Vec::new();
    safebox.serialize(&mut bytes);
    let mut buf = bytes.as_slice();
    let restored = Safebox::deserialize(&mut buf).unwrap();
    assert!(buf.is_empty());

    assert_eq!(restored.get_fingerprint(), safebox.get_fingerprint());
    assert_eq!(restored.get_height(), safebox.get_height());
    assert_eq!(
        restored.get_cumulative_difficulty(),
        safebox.get_cumulative_difficulty()
    );
    assert_eq!(
        restored.get_account(7).unwrap().balance,
        safebox.get_account(7).unwrap().balance
    );
}
