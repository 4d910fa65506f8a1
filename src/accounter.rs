#![forbid(unsafe_code)]

//! Dense account array partitioned into fixed-size packs. Packs are the
//! unit of fingerprinting: every mutation rehashes the containing pack,
//! and the safebox hash is a single digest over the ordered pack hashes.

use std::collections::BTreeSet;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::Hash32;
use crate::crypto::{self, PublicKey};
use crate::defaults::ACCOUNTS_PER_BLOCK;
use crate::wire::{self, WireError};

/// Serialized size of one account record inside a pack.
pub const ACCOUNT_RECORD_LEN: usize = 64;
const RECORD_RESERVED: usize = 11;

#[derive(Debug, Error)]
pub enum AccounterError {
    #[error("account {0} out of range")]
    OutOfRange(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Account {
    pub number: u32,
    pub public_key: PublicKey,
    pub balance: u64,
    pub updated_block: u32,
    pub n_operations: u32,
}

impl Account {
    /// Fixed 64-byte record: number, n_operations, balance, updated_block
    /// (all LE), compressed SEC point, zero padding.
    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        wire::write_u32(out, self.number);
        wire::write_u32(out, self.n_operations);
        wire::write_u64(out, self.balance);
        wire::write_u32(out, self.updated_block);
        out.extend_from_slice(&crypto::serialize_public(&self.public_key));
        out.extend_from_slice(&[0u8; RECORD_RESERVED]);
    }

    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, WireError> {
        let number = wire::read_u32(buf)?;
        let n_operations = wire::read_u32(buf)?;
        let balance = wire::read_u64(buf)?;
        let updated_block = wire::read_u32(buf)?;
        if buf.len() < crypto::PUBLIC_KEY_LEN + RECORD_RESERVED {
            return Err(WireError::Truncated);
        }
        let public_key = crypto::parse_public(&buf[..crypto::PUBLIC_KEY_LEN])?;
        *buf = &buf[crypto::PUBLIC_KEY_LEN + RECORD_RESERVED..];
        Ok(Account {
            number,
            public_key,
            balance,
            updated_block,
            n_operations,
        })
    }
}

/// Content hash of a run of [`ACCOUNTS_PER_BLOCK`] accounts.
pub fn pack_hash(accounts: &[Account]) -> Hash32 {
    debug_assert_eq!(accounts.len(), ACCOUNTS_PER_BLOCK as usize);
    let mut bytes = Vec::with_capacity(ACCOUNT_RECORD_LEN * accounts.len());
    for account in accounts {
        account.serialize_into(&mut bytes);
    }
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hasher.finalize().into()
}

#[derive(Clone, Default)]
pub struct Accounter {
    accounts: Vec<Account>,
    pack_hashes: Vec<Hash32>,
    dirty: BTreeSet<u32>,
}

impl Accounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of packs, which equals the chain height.
    pub fn height(&self) -> u32 {
        self.pack_hashes.len() as u32
    }

    pub fn accounts_count(&self) -> u32 {
        self.accounts.len() as u32
    }

    pub fn get_account(&self, number: u32) -> Result<&Account, AccounterError> {
        self.accounts
            .get(number as usize)
            .ok_or(AccounterError::OutOfRange(number))
    }

    pub fn pack(&self, index: u32) -> Option<&[Account]> {
        let start = index as usize * ACCOUNTS_PER_BLOCK as usize;
        let end = start + ACCOUNTS_PER_BLOCK as usize;
        self.accounts.get(start..end)
    }

    pub fn pack_hash_at(&self, index: u32) -> Option<&Hash32> {
        self.pack_hashes.get(index as usize)
    }

    /// Appends five fresh accounts owned by the miner key. The first
    /// account of the pack receives the whole reward plus collected fees.
    pub fn new_pack(&mut self, miner: &PublicKey, reward: u64, fee_total: u64) -> u32 {
        let pack_index = self.height();
        let base = self.accounts_count();
        let mut accounts = Vec::with_capacity(ACCOUNTS_PER_BLOCK as usize);
        for position in 0..ACCOUNTS_PER_BLOCK {
            let balance = if position == 0 {
                reward.saturating_add(fee_total)
            } else {
                0
            };
            accounts.push(Account {
                number: base + position,
                public_key: *miner,
                balance,
                updated_block: pack_index,
                n_operations: 0,
            });
        }
        self.append_pack(accounts)
    }

    /// Appends an already-constructed pack, e.g. when a staged overlay is
    /// merged into the committed array.
    pub fn append_pack(&mut self, accounts: Vec<Account>) -> u32 {
        debug_assert_eq!(accounts.len(), ACCOUNTS_PER_BLOCK as usize);
        let pack_index = self.height();
        let hash = pack_hash(&accounts);
        self.accounts.extend(accounts);
        self.pack_hashes.push(hash);
        self.dirty.insert(pack_index);
        pack_index
    }

    /// Replaces an account record and rehashes its pack.
    pub fn update_account(&mut self, account: Account) -> Result<(), AccounterError> {
        let number = account.number;
        let slot = self
            .accounts
            .get_mut(number as usize)
            .ok_or(AccounterError::OutOfRange(number))?;
        *slot = account;
        let pack_index = number / ACCOUNTS_PER_BLOCK;
        let hash = pack_hash(self.pack(pack_index).expect("account exists"));
        self.pack_hashes[pack_index as usize] = hash;
        self.dirty.insert(pack_index);
        Ok(())
    }

    pub fn updated_packs(&self) -> Vec<u32> {
        self.dirty.iter().copied().collect()
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    /// Fingerprint across all packs: one digest over the ordered
    /// concatenation of pack hashes.
    pub fn hash(&self) -> Hash32 {
        let mut hasher = Sha256::new();
        for pack in &self.pack_hashes {
            hasher.update(pack);
        }
        hasher.finalize().into()
    }

    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    /// Rebuilds the pack index from a flat account list, e.g. after
    /// deserializing a snapshot. The length must be a whole number of packs.
    pub fn from_accounts(accounts: Vec<Account>) -> Result<Self, WireError> {
        if accounts.len() % ACCOUNTS_PER_BLOCK as usize != 0 {
            return Err(WireError::Truncated);
        }
        let mut accounter = Accounter {
            accounts,
            pack_hashes: Vec::new(),
            dirty: BTreeSet::new(),
        };
        let packs = accounter.accounts.len() / ACCOUNTS_PER_BLOCK as usize;
        for index in 0..packs {
            let hash = pack_hash(accounter.pack(index as u32).expect("within bounds"));
            accounter.pack_hashes.push(hash);
        }
        Ok(accounter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    #[test]
    fn new_pack_funds_first_account() {
        let miner = Keypair::generate();
        let mut accounter = Accounter::new();
        let pack = accounter.new_pack(&miner.public, 500_000, 7);
        assert_eq!(pack, 0);
        assert_eq!(accounter.height(), 1);
        assert_eq!(accounter.accounts_count(), ACCOUNTS_PER_BLOCK);
        assert_eq!(accounter.get_account(0).unwrap().balance, 500_007);
        for number in 1..ACCOUNTS_PER_BLOCK {
            assert_eq!(accounter.get_account(number).unwrap().balance, 0);
        }
        assert!(accounter.get_account(ACCOUNTS_PER_BLOCK).is_err());
    }

    #[test]
    fn update_rehashes_pack_and_marks_dirty() {
        let miner = Keypair::generate();
        let mut accounter = Accounter::new();
        accounter.new_pack(&miner.public, 500_000, 0);
        accounter.new_pack(&miner.public, 500_000, 0);
        accounter.clear_dirty();
        let before = accounter.hash();

        let mut account = *accounter.get_account(6).unwrap();
        account.balance = 42;
        accounter.update_account(account).unwrap();

        assert_eq!(accounter.updated_packs(), vec![1]);
        assert_ne!(accounter.hash(), before);
    }

    #[test]
    fn record_serialization_is_fixed_size() {
        let miner = Keypair::generate();
        let account = Account {
            number: 3,
            public_key: miner.public,
            balance: 77,
            updated_block: 9,
            n_operations: 2,
        };
        let mut bytes = Vec::new();
        account.serialize_into(&mut bytes);
        assert_eq!(bytes.len(), ACCOUNT_RECORD_LEN);

        let mut buf = bytes.as_slice();
        let decoded = Account::deserialize(&mut buf).unwrap();
        assert!(buf.is_empty());
        assert_eq!(decoded, account);
    }

    #[test]
    fn fingerprint_tracks_pack_order() {
        let a = Keypair::generate();
        let b = Keypair::generate();

        let mut first = Accounter::new();
        first.new_pack(&a.public, 500_000, 0);
        first.new_pack(&b.public, 500_000, 0);

        let mut second = Accounter::new();
        second.new_pack(&b.public, 500_000, 0);
        second.new_pack(&a.public, 500_000, 0);

        assert_ne!(first.hash(), second.hash());
    }
}
