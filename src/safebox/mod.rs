#![forbid(unsafe_code)]

//! Consensus account state. A safebox wraps the accounter with the reward
//! schedule, maturation and transaction semantics, and stages every block
//! in a copy-on-write overlay: reads consult the overlay first, `merge`
//! splices it into the committed array, `rollback` drops it.

pub mod tx;

use std::collections::{BTreeSet, HashMap, VecDeque};

use num_bigint::BigUint;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::accounter::{pack_hash, Account, Accounter, AccounterError};
use crate::core::Hash32;
use crate::crypto::{self, PublicKey};
use crate::defaults::{
    ACCOUNTS_PER_BLOCK, INITIAL_REWARD, MATURATION_HEIGHT, MIN_REWARD, REWARD_HALVING_INTERVAL,
    TIMESTAMP_WINDOW,
};
use crate::wire::{self, WireError};

use self::tx::{OpError, Operation};

pub const PACK_LEN: usize = ACCOUNTS_PER_BLOCK as usize;

/// Block reward at a given height: halves every interval, floored.
pub fn get_reward(height: u32) -> u64 {
    let halvings = height / REWARD_HALVING_INTERVAL;
    let reward = if halvings >= 64 {
        0
    } else {
        INITIAL_REWARD >> halvings
    };
    reward.max(MIN_REWARD)
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("operation {index}: {source}")]
    Operation {
        index: usize,
        #[source]
        source: OpError,
    },
    #[error("fee sum overflows")]
    FeeOverflow,
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("block {got} does not extend height {expected}")]
    IndexMismatch { expected: u32, got: u32 },
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("block {index}: safebox fingerprint mismatch after apply")]
    FingerprintMismatch { index: u32 },
}

#[derive(Clone, Debug)]
pub struct OperationReceipt {
    pub index: u32,
    pub account: u32,
    pub n_operation: u32,
    pub digest: Hash32,
}

/// Copy-on-write staging layer: staged versions of committed packs plus
/// packs appended by staged blocks, with the dirty set and the chain
/// metadata the staged blocks contributed.
#[derive(Clone, Default)]
struct Pending {
    overrides: HashMap<u32, Vec<Account>>,
    appended: Vec<Vec<Account>>,
    dirty: BTreeSet<u32>,
    /// Staged block timestamps, most recent first.
    timestamps: Vec<u32>,
    difficulty_added: BigUint,
}

#[derive(Clone, Default)]
pub struct Safebox {
    accounter: Accounter,
    cumulative_difficulty: BigUint,
    /// Committed block timestamps, most recent first, bounded by the window.
    last_timestamps: VecDeque<u32>,
    pending: Option<Pending>,
}

impl Safebox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Height including staged blocks.
    pub fn get_height(&self) -> u32 {
        self.accounter.height() + self.pending.as_ref().map_or(0, |p| p.appended.len() as u32)
    }

    fn staged_accounts_count(&self) -> u32 {
        self.get_height() * ACCOUNTS_PER_BLOCK
    }

    pub fn get_account(&self, number: u32) -> Result<Account, AccounterError> {
        self.staged_account(number)
            .ok_or(AccounterError::OutOfRange(number))
    }

    /// Committed accounts in pack order; staged blocks are not visible.
    pub fn committed_accounts(&self) -> &[Account] {
        self.accounter.accounts()
    }

    pub fn get_cumulative_difficulty(&self) -> BigUint {
        match &self.pending {
            Some(p) => &self.cumulative_difficulty + &p.difficulty_added,
            None => self.cumulative_difficulty.clone(),
        }
    }

    /// Most recent timestamps first, clipped to the recorded window.
    pub fn get_last_timestamps(&self, count: u32) -> Vec<u32> {
        let limit = (count as usize).min(TIMESTAMP_WINDOW);
        let mut out = Vec::with_capacity(limit);
        if let Some(p) = &self.pending {
            out.extend(p.timestamps.iter().copied().take(limit));
        }
        let rest = limit - out.len().min(limit);
        out.extend(self.last_timestamps.iter().copied().take(rest));
        out
    }

    pub fn get_updated_packs(&self) -> Vec<u32> {
        let mut set: BTreeSet<u32> = self.accounter.updated_packs().into_iter().collect();
        if let Some(p) = &self.pending {
            set.extend(p.dirty.iter().copied());
        }
        set.into_iter().collect()
    }

    /// Fingerprint of the current state, overlay included.
    pub fn get_fingerprint(&self) -> Hash32 {
        let pending = match &self.pending {
            None => return self.accounter.hash(),
            Some(p) => p,
        };
        let mut hasher = Sha256::new();
        for index in 0..self.accounter.height() {
            match pending.overrides.get(&index) {
                Some(accounts) => hasher.update(pack_hash(accounts)),
                None => hasher.update(self.accounter.pack_hash_at(index).expect("pack exists")),
            }
        }
        for accounts in &pending.appended {
            hasher.update(pack_hash(accounts));
        }
        hasher.finalize().into()
    }

    fn staged_account(&self, number: u32) -> Option<Account> {
        let pack = number / ACCOUNTS_PER_BLOCK;
        let pos = (number % ACCOUNTS_PER_BLOCK) as usize;
        let committed_height = self.accounter.height();
        if let Some(p) = &self.pending {
            if pack >= committed_height {
                return p
                    .appended
                    .get((pack - committed_height) as usize)
                    .map(|accounts| accounts[pos]);
            }
            if let Some(accounts) = p.overrides.get(&pack) {
                return Some(accounts[pos]);
            }
        }
        self.accounter.get_account(number).ok().copied()
    }

    fn stage_account(&mut self, account: Account) {
        let pack = account.number / ACCOUNTS_PER_BLOCK;
        let pos = (account.number % ACCOUNTS_PER_BLOCK) as usize;
        let committed_height = self.accounter.height();
        let accounter = &self.accounter;
        let pending = self.pending.get_or_insert_with(Pending::default);
        if pack >= committed_height {
            pending.appended[(pack - committed_height) as usize][pos] = account;
        } else {
            let staged = pending
                .overrides
                .entry(pack)
                .or_insert_with(|| accounter.pack(pack).expect("pack exists").to_vec());
            staged[pos] = account;
        }
        pending.dirty.insert(pack);
    }

    /// Stages one block on top of the committed state and any blocks
    /// already staged. On any operation failure the overlay is restored
    /// to its state at entry and nothing is observable.
    pub fn process_operations(
        &mut self,
        miner: &PublicKey,
        timestamp: u32,
        operations: &[Operation],
        difficulty_delta: &BigUint,
    ) -> Result<Vec<OperationReceipt>, ProcessError> {
        let snapshot = self.pending.clone();
        match self.stage_block(miner, timestamp, operations, difficulty_delta) {
            Ok(receipts) => Ok(receipts),
            Err(err) => {
                self.pending = snapshot;
                Err(err)
            }
        }
    }

    fn stage_block(
        &mut self,
        miner: &PublicKey,
        timestamp: u32,
        operations: &[Operation],
        difficulty_delta: &BigUint,
    ) -> Result<Vec<OperationReceipt>, ProcessError> {
        let block_index = self.get_height();
        let fee_total = operations
            .iter()
            .try_fold(0u64, |acc, op| acc.checked_add(op.fee()))
            .ok_or(ProcessError::FeeOverflow)?;
        let reward = get_reward(block_index)
            .checked_add(fee_total)
            .ok_or(ProcessError::FeeOverflow)?;

        let base = self.staged_accounts_count();
        let mut pack = Vec::with_capacity(PACK_LEN);
        for position in 0..ACCOUNTS_PER_BLOCK {
            pack.push(Account {
                number: base + position,
                public_key: *miner,
                balance: if position == 0 { reward } else { 0 },
                updated_block: block_index,
                n_operations: 0,
            });
        }
        let pending = self.pending.get_or_insert_with(Pending::default);
        pending.appended.push(pack);
        pending.dirty.insert(block_index);

        let mut receipts = Vec::with_capacity(operations.len());
        for (index, op) in operations.iter().enumerate() {
            self.validate_operation(op, block_index)
                .map_err(|source| ProcessError::Operation { index, source })?;
            let mut receipt = self.apply_operation(op, block_index);
            receipt.index = index as u32;
            receipts.push(receipt);
        }

        let pending = self.pending.as_mut().expect("staged above");
        pending.timestamps.insert(0, timestamp);
        pending.difficulty_added += difficulty_delta;
        Ok(receipts)
    }

    /// Semantic validation of one operation against the staged state,
    /// as of a block at `height`. Shared with mempool admission.
    pub fn validate_operation(&self, op: &Operation, height: u32) -> Result<(), OpError> {
        let source = self
            .staged_account(op.source())
            .ok_or(OpError::UnknownSource(op.source()))?;
        crypto::verify(&source.public_key, &op.signing_digest(), op.signature())
            .map_err(|_| OpError::WrongSignature)?;
        let expected = source.n_operations + 1;
        if op.op_id() != expected {
            return Err(OpError::BadOperationId {
                account: source.number,
                expected,
                got: op.op_id(),
            });
        }
        if source.updated_block.saturating_add(MATURATION_HEIGHT) > height {
            return Err(OpError::Immature {
                account: source.number,
                updated_block: source.updated_block,
                height,
            });
        }
        match op {
            Operation::Transfer {
                destination,
                amount,
                fee,
                ..
            } => {
                if *destination == source.number {
                    return Err(OpError::SelfTransfer(source.number));
                }
                let destination = self
                    .staged_account(*destination)
                    .ok_or(OpError::UnknownDestination(*destination))?;
                let total = amount.checked_add(*fee).ok_or(OpError::AmountOverflow)?;
                if total > source.balance {
                    return Err(OpError::InsufficientBalance(source.number));
                }
                destination
                    .balance
                    .checked_add(*amount)
                    .ok_or(OpError::AmountOverflow)?;
            }
            Operation::ChangeKey { fee, .. } => {
                if *fee > source.balance {
                    return Err(OpError::InsufficientBalance(source.number));
                }
            }
        }
        Ok(())
    }

    fn apply_operation(&mut self, op: &Operation, height: u32) -> OperationReceipt {
        let mut source = self.staged_account(op.source()).expect("validated");
        source.n_operations += 1;
        source.updated_block = height;
        let n_operation = source.n_operations;
        match op {
            Operation::Transfer {
                destination,
                amount,
                fee,
                ..
            } => {
                source.balance -= amount + fee;
                self.stage_account(source);
                let mut destination = self.staged_account(*destination).expect("validated");
                destination.balance += amount;
                destination.updated_block = height;
                self.stage_account(destination);
            }
            Operation::ChangeKey {
                fee,
                new_public_key,
                ..
            } => {
                source.balance -= fee;
                source.public_key = *new_public_key;
                self.stage_account(source);
            }
        }
        OperationReceipt {
            index: 0,
            account: op.source(),
            n_operation,
            digest: op.digest(),
        }
    }

    /// Promotes the overlay into the committed state and clears dirty.
    pub fn merge(&mut self) {
        if let Some(pending) = self.pending.take() {
            for (_, accounts) in pending.overrides {
                for account in accounts {
                    self.accounter
                        .update_account(account)
                        .expect("override targets existing account");
                }
            }
            for accounts in pending.appended {
                self.accounter.append_pack(accounts);
            }
            for ts in pending.timestamps.into_iter().rev() {
                self.last_timestamps.push_front(ts);
            }
            self.last_timestamps.truncate(TIMESTAMP_WINDOW);
            self.cumulative_difficulty += pending.difficulty_added;
        }
        self.accounter.clear_dirty();
    }

    /// Discards the overlay; the committed state keeps the last merge.
    pub fn rollback(&mut self) {
        self.pending = None;
        self.accounter.clear_dirty();
    }

    /// Complete snapshot of the committed state.
    pub fn serialize(&self, out: &mut Vec<u8>) {
        wire::write_u32(out, self.accounter.height());
        wire::write_bytes(out, &self.cumulative_difficulty.to_bytes_be());
        wire::write_u32(out, self.last_timestamps.len() as u32);
        for ts in &self.last_timestamps {
            wire::write_u32(out, *ts);
        }
        for account in self.accounter.accounts() {
            account.serialize_into(out);
        }
    }

    pub fn deserialize(buf: &mut &[u8]) -> Result<Safebox, WireError> {
        let height = wire::read_u32(buf)?;
        let cumulative_difficulty = BigUint::from_bytes_be(&wire::read_bytes(buf)?);
        let ts_count = wire::read_u32(buf)? as usize;
        if ts_count > TIMESTAMP_WINDOW {
            return Err(WireError::Oversized(ts_count, TIMESTAMP_WINDOW));
        }
        let mut last_timestamps = VecDeque::with_capacity(ts_count);
        for _ in 0..ts_count {
            last_timestamps.push_back(wire::read_u32(buf)?);
        }
        let count = height as usize * PACK_LEN;
        if buf.len() < count * crate::accounter::ACCOUNT_RECORD_LEN {
            return Err(WireError::Truncated);
        }
        let mut accounts = Vec::with_capacity(count);
        for _ in 0..count {
            accounts.push(Account::deserialize(buf)?);
        }
        Ok(Safebox {
            accounter: Accounter::from_accounts(accounts)?,
            cumulative_difficulty,
            last_timestamps,
            pending: None,
        })
    }

    /// Applies one fully-decoded block: stage, check the declared
    /// resulting fingerprint, merge. Used by startup replay and reorg.
    pub fn apply_block(&mut self, block: &crate::block::Block) -> Result<(), ReplayError> {
        let header = &block.header;
        let expected = self.get_height();
        if header.index != expected {
            return Err(ReplayError::IndexMismatch {
                expected,
                got: header.index,
            });
        }
        let target = crate::block::decode_compact_target(header.compact_target);
        let delta = crate::block::difficulty(&target);
        self.process_operations(
            &header.reward_public_key,
            header.timestamp,
            &block.operations,
            &delta,
        )?;
        if self.get_fingerprint() != header.safebox_hash_after {
            self.rollback();
            return Err(ReplayError::FingerprintMismatch {
                index: header.index,
            });
        }
        self.merge();
        Ok(())
    }

    /// Fresh safebox replayed from a block iterator, optionally capped.
    pub fn rebuild<I>(blocks: I, height_cap: Option<u32>) -> Result<Safebox, ReplayError>
    where
        I: IntoIterator<Item = crate::block::Block>,
    {
        let mut safebox = Safebox::new();
        for block in blocks {
            if let Some(cap) = height_cap {
                if safebox.get_height() >= cap {
                    break;
                }
            }
            safebox.apply_block(&block)?;
        }
        Ok(safebox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    #[test]
    fn reward_schedule() {
        assert_eq!(get_reward(0), 500_000);
        assert_eq!(get_reward(420_479), 500_000);
        assert_eq!(get_reward(420_480), 250_000);
        assert_eq!(get_reward(1_000_000_000), 10_000);
    }

    #[test]
    fn empty_blocks_accumulate_in_overlay() {
        let miner = Keypair::generate();
        let mut safebox = Safebox::new();
        for block in 0..3u32 {
            safebox
                .process_operations(&miner.public, block, &[], &BigUint::from(1u32))
                .unwrap();
        }
        assert_eq!(safebox.get_height(), 3);
        assert_eq!(safebox.get_updated_packs(), vec![0, 1, 2]);
        assert_eq!(safebox.get_cumulative_difficulty(), BigUint::from(3u32));

        safebox.merge();
        assert_eq!(safebox.get_height(), 3);
        assert!(safebox.get_updated_packs().is_empty());

        safebox.rollback();
        assert_eq!(safebox.get_height(), 3);
    }

    #[test]
    fn failed_block_restores_overlay() {
        let miner = Keypair::generate();
        let mut safebox = Safebox::new();
        safebox
            .process_operations(&miner.public, 0, &[], &BigUint::default())
            .unwrap();
        let fingerprint = safebox.get_fingerprint();
        let height = safebox.get_height();

        // op id 2 cannot be the first operation of account 0
        let mut op = Operation::Transfer {
            source: 0,
            op_id: 2,
            destination: 1,
            amount: 1,
            fee: 0,
            payload: Vec::new(),
            signature: Vec::new(),
        };
        op.sign(&miner);
        let err = safebox
            .process_operations(&miner.public, 1, &[op], &BigUint::default())
            .unwrap_err();
        assert!(matches!(err, ProcessError::Operation { index: 0, .. }));
        assert_eq!(safebox.get_height(), height);
        assert_eq!(safebox.get_fingerprint(), fingerprint);
    }

    #[test]
    fn merge_then_rollback_keeps_merged_state() {
        let miner = Keypair::generate();
        let mut safebox = Safebox::new();
        safebox
            .process_operations(&miner.public, 0, &[], &BigUint::default())
            .unwrap();
        safebox.merge();
        let merged = safebox.get_fingerprint();

        safebox
            .process_operations(&miner.public, 1, &[], &BigUint::default())
            .unwrap();
        safebox.rollback();
        assert_eq!(safebox.get_height(), 1);
        assert_eq!(safebox.get_fingerprint(), merged);
    }

    #[test]
    fn snapshot_round_trip_preserves_fingerprint() {
        let miner = Keypair::generate();
        let mut safebox = Safebox::new();
        for block in 0..4u32 {
            safebox
                .process_operations(&miner.public, block * 300, &[], &BigUint::from(7u32))
                .unwrap();
        }
        safebox.merge();

        let mut bytes = Vec::new();
        safebox.serialize(&mut bytes);
        let mut buf = bytes.as_slice();
        let restored = Safebox::deserialize(&mut buf).unwrap();
        assert!(buf.is_empty());
        assert_eq!(restored.get_height(), safebox.get_height());
        assert_eq!(restored.get_fingerprint(), safebox.get_fingerprint());
        assert_eq!(
            restored.get_cumulative_difficulty(),
            safebox.get_cumulative_difficulty()
        );
        assert_eq!(restored.get_last_timestamps(100), safebox.get_last_timestamps(100));
    }
}
