#![forbid(unsafe_code)]

//! The canonical chain: block ingestion, reorg handling, the mempool and
//! the update fan-out. A single chain worker task owns the `Blockchain`;
//! everyone else talks to it through a cloneable [`ChainHandle`], so
//! readers only ever observe merged state.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use num_bigint::BigUint;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info};

use crate::accounter::Account;
use crate::block::{self, Block, BlockHeader};
use crate::core::{now_ts, Hash32};
use crate::crypto::{self, PublicKey};
use crate::defaults::{MIN_COMPACT_TARGET, TIMESTAMP_WINDOW};
use crate::safebox::tx::Operation;
use crate::safebox::Safebox;
use crate::storage::Storage;
use crate::validator::{self, ValidationContext};

const UPDATES_CAPACITY: usize = 64;
const COMMANDS_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub enum AddBlockResult {
    Accepted,
    Duplicate,
    Orphan,
    Invalid(String),
}

#[derive(Clone, Debug)]
pub struct ChainState {
    pub height: u32,
    pub safebox_hash: Hash32,
    pub cumulative_difficulty: BigUint,
}

#[derive(Clone, Debug, Serialize)]
pub struct AccountView {
    pub account: u32,
    pub public_key: String,
    pub balance: u64,
    pub updated_block: u32,
    pub n_operations: u32,
}

impl AccountView {
    fn from_account(account: &Account) -> Self {
        AccountView {
            account: account.number,
            public_key: hex::encode(crypto::serialize_public(&account.public_key)),
            balance: account.balance,
            updated_block: account.updated_block,
            n_operations: account.n_operations,
        }
    }
}

/// Published on every commit, in commit order.
#[derive(Clone, Debug)]
pub struct BlockAdded {
    pub index: u32,
    pub block: Arc<Block>,
}

/// Published on every mempool admission.
#[derive(Clone, Debug)]
pub struct TxPoolUpdate {
    pub digest: Hash32,
    pub operation: Arc<Operation>,
}

pub struct Blockchain {
    storage: Arc<dyn Storage>,
    safebox: Safebox,
    top: Option<BlockHeader>,
    mempool: HashMap<Hash32, Operation>,
    blocks_updates: broadcast::Sender<BlockAdded>,
    txpool_updates: broadcast::Sender<TxPoolUpdate>,
}

impl Blockchain {
    /// Loads the chain by replaying persisted blocks, optionally stopping
    /// at an operator-supplied height cap. A fingerprint mismatch during
    /// replay means corrupt storage and is fatal.
    pub fn new(storage: Arc<dyn Storage>, height_cap: Option<u32>) -> Result<Self> {
        let mut safebox = Safebox::new();
        let mut top: Option<BlockHeader> = None;
        storage.iterate_blocks(0, &mut |index, data| {
            if let Some(cap) = height_cap {
                if index >= cap {
                    return Ok(false);
                }
            }
            let mut buf = data;
            let block = Block::deserialize(&mut buf)
                .map_err(|err| anyhow!("stored block {index} is malformed: {err}"))?;
            safebox
                .apply_block(&block)
                .map_err(|err| anyhow!("replay failed at block {index}: {err}"))?;
            top = Some(block.header);
            Ok(true)
        })?;
        info!(height = safebox.get_height(), "blockchain loaded");

        let (blocks_updates, _) = broadcast::channel(UPDATES_CAPACITY);
        let (txpool_updates, _) = broadcast::channel(UPDATES_CAPACITY);
        Ok(Blockchain {
            storage,
            safebox,
            top,
            mempool: HashMap::new(),
            blocks_updates,
            txpool_updates,
        })
    }

    pub fn get_state(&self) -> ChainState {
        ChainState {
            height: self.safebox.get_height(),
            safebox_hash: self.safebox.get_fingerprint(),
            cumulative_difficulty: self.safebox.get_cumulative_difficulty(),
        }
    }

    pub fn get_account(&self, number: u32) -> Option<AccountView> {
        self.safebox
            .get_account(number)
            .ok()
            .map(|account| AccountView::from_account(&account))
    }

    pub fn find_accounts(&self, public_key: &PublicKey, start: u32, max: u32) -> Vec<AccountView> {
        self.safebox
            .committed_accounts()
            .iter()
            .filter(|account| account.number >= start && account.public_key == *public_key)
            .take(max as usize)
            .map(AccountView::from_account)
            .collect()
    }

    pub fn get_block_serialized(&self, index: u32) -> Result<Option<Vec<u8>>> {
        self.storage.get_block(index)
    }

    pub fn export_safebox(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.safebox.serialize(&mut out);
        out
    }

    pub fn mempool_snapshot(&self) -> Vec<Operation> {
        self.mempool.values().cloned().collect()
    }

    pub fn add_block_serialized(&mut self, data: &[u8]) -> Result<AddBlockResult> {
        let mut buf = data;
        let block = match Block::deserialize(&mut buf) {
            Ok(block) => block,
            Err(err) => return Ok(AddBlockResult::Invalid(format!("encoding: {err}"))),
        };
        self.add_block(block)
    }

    /// Appends one block to the canonical tip. Storage failures bubble up;
    /// everything consensus-related is reported in the result.
    pub fn add_block(&mut self, block: Block) -> Result<AddBlockResult> {
        let height = self.safebox.get_height();
        let index = block.header.index;
        if index < height {
            return Ok(AddBlockResult::Duplicate);
        }
        if index > height {
            return Ok(AddBlockResult::Orphan);
        }

        let timestamps = self.safebox.get_last_timestamps(TIMESTAMP_WINDOW as u32);
        let ctx = ValidationContext {
            height,
            safebox_fingerprint: self.safebox.get_fingerprint(),
            last_timestamps: &timestamps,
            prev_compact_target: self
                .top
                .as_ref()
                .map_or(MIN_COMPACT_TARGET, |top| top.compact_target),
            now: now_ts(),
        };
        if let Err(err) = validator::validate(&ctx, &block) {
            return Ok(AddBlockResult::Invalid(err.to_string()));
        }

        let target = block::decode_compact_target(block.header.compact_target);
        let delta = block::difficulty(&target);
        if let Err(err) = self.safebox.process_operations(
            &block.header.reward_public_key,
            block.header.timestamp,
            &block.operations,
            &delta,
        ) {
            return Ok(AddBlockResult::Invalid(err.to_string()));
        }
        if self.safebox.get_fingerprint() != block.header.safebox_hash_after {
            self.safebox.rollback();
            return Ok(AddBlockResult::Invalid(
                "safebox hash after apply differs from header".into(),
            ));
        }
        self.safebox.merge();

        let data = block.serialize();
        self.storage
            .with_writable(&mut |batch| {
                batch.store_block(index, &data);
                Ok(())
            })
            .context("failed to persist block")?;

        self.top = Some(block.header.clone());
        self.evict_stale_operations();
        let _ = self.blocks_updates.send(BlockAdded {
            index,
            block: Arc::new(block),
        });
        debug!(index, "block accepted");
        Ok(AddBlockResult::Accepted)
    }

    /// Switches to a sibling branch rooted at `start` when its cumulative
    /// difficulty strictly exceeds the current tip. The candidate safebox
    /// is rebuilt on the side; on any failure the original tip stays.
    pub fn add_alt_chain(&mut self, start: u32, branch: Vec<Block>) -> Result<AddBlockResult> {
        if branch.is_empty() {
            return Ok(AddBlockResult::Invalid("empty branch".into()));
        }
        let old_height = self.safebox.get_height();
        if start > old_height {
            return Ok(AddBlockResult::Orphan);
        }
        if branch[0].header.index != start {
            return Ok(AddBlockResult::Invalid(
                "branch does not start at its declared ancestor".into(),
            ));
        }

        let mut ancestors = Vec::new();
        let mut fork_parent: Option<BlockHeader> = None;
        self.storage.iterate_blocks(0, &mut |index, data| {
            if index >= start {
                return Ok(false);
            }
            let mut buf = data;
            let block = Block::deserialize(&mut buf)
                .map_err(|err| anyhow!("stored block {index} is malformed: {err}"))?;
            fork_parent = Some(block.header.clone());
            ancestors.push(block);
            Ok(true)
        })?;

        let mut candidate = Safebox::rebuild(ancestors, None)
            .map_err(|err| anyhow!("replay below fork point failed: {err}"))?;
        let mut prev_target =
            fork_parent.map_or(MIN_COMPACT_TARGET, |header| header.compact_target);
        let now = now_ts();
        for block in &branch {
            let timestamps = candidate.get_last_timestamps(TIMESTAMP_WINDOW as u32);
            let ctx = ValidationContext {
                height: candidate.get_height(),
                safebox_fingerprint: candidate.get_fingerprint(),
                last_timestamps: &timestamps,
                prev_compact_target: prev_target,
                now,
            };
            if let Err(err) = validator::validate(&ctx, block) {
                return Ok(AddBlockResult::Invalid(format!(
                    "branch block {}: {err}",
                    block.header.index
                )));
            }
            if let Err(err) = candidate.apply_block(block) {
                return Ok(AddBlockResult::Invalid(format!(
                    "branch block {}: {err}",
                    block.header.index
                )));
            }
            prev_target = block.header.compact_target;
        }

        if candidate.get_cumulative_difficulty() <= self.safebox.get_cumulative_difficulty() {
            return Ok(AddBlockResult::Invalid(
                "branch does not exceed current cumulative difficulty".into(),
            ));
        }

        let new_height = candidate.get_height();
        self.storage
            .with_writable(&mut |batch| {
                for block in &branch {
                    batch.store_block(block.header.index, &block.serialize());
                }
                for index in new_height..old_height {
                    batch.remove_block(index);
                }
                Ok(())
            })
            .context("failed to persist reorganized branch")?;

        self.safebox = candidate;
        self.top = branch.last().map(|block| block.header.clone());
        self.evict_stale_operations();
        if let Some(tip) = branch.last() {
            let _ = self.blocks_updates.send(BlockAdded {
                index: tip.header.index,
                block: Arc::new(tip.clone()),
            });
        }
        info!(fork = start, height = new_height, "chain reorganized");
        Ok(AddBlockResult::Accepted)
    }

    /// Admits one operation into the mempool, validated against the tip.
    pub fn add_operation(&mut self, operation: Operation) -> std::result::Result<Hash32, String> {
        let digest = operation.digest();
        if self.mempool.contains_key(&digest) {
            return Err("duplicate operation".into());
        }
        let height = self.safebox.get_height();
        self.safebox
            .validate_operation(&operation, height)
            .map_err(|err| err.to_string())?;
        let update = TxPoolUpdate {
            digest,
            operation: Arc::new(operation.clone()),
        };
        self.mempool.insert(digest, operation);
        let _ = self.txpool_updates.send(update);
        Ok(digest)
    }

    /// Re-validates the pool against the new tip and drops what no
    /// longer applies (spent, included, or immature again).
    fn evict_stale_operations(&mut self) {
        let height = self.safebox.get_height();
        let safebox = &self.safebox;
        self.mempool.retain(|digest, operation| {
            let keep = safebox.validate_operation(operation, height).is_ok();
            if !keep {
                debug!(digest = %hex::encode(digest), "evicting stale operation");
            }
            keep
        });
    }
}

pub enum ChainCommand {
    AddBlock {
        data: Vec<u8>,
        reply: oneshot::Sender<AddBlockResult>,
    },
    AddAltChain {
        start: u32,
        branch: Vec<Block>,
        reply: oneshot::Sender<AddBlockResult>,
    },
    AddOperations {
        operations: Vec<Operation>,
        reply: oneshot::Sender<Vec<std::result::Result<Hash32, String>>>,
    },
    GetState {
        reply: oneshot::Sender<ChainState>,
    },
    GetAccount {
        number: u32,
        reply: oneshot::Sender<Option<AccountView>>,
    },
    FindAccounts {
        public_key: Box<PublicKey>,
        start: u32,
        max: u32,
        reply: oneshot::Sender<Vec<AccountView>>,
    },
    GetBlock {
        index: u32,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    MempoolSnapshot {
        reply: oneshot::Sender<Vec<Operation>>,
    },
    ExportSafebox {
        reply: oneshot::Sender<Vec<u8>>,
    },
}

/// Capability handle to the chain worker. Cloned freely by peers, the
/// RPC surface and the CLI; all mutations funnel through one task.
#[derive(Clone)]
pub struct ChainHandle {
    commands: mpsc::Sender<ChainCommand>,
    blocks_updates: broadcast::Sender<BlockAdded>,
    txpool_updates: broadcast::Sender<TxPoolUpdate>,
}

impl ChainHandle {
    pub fn subscribe_blocks(&self) -> broadcast::Receiver<BlockAdded> {
        self.blocks_updates.subscribe()
    }

    pub fn subscribe_txpool(&self) -> broadcast::Receiver<TxPoolUpdate> {
        self.txpool_updates.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ChainCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| anyhow!("chain worker stopped"))?;
        rx.await.map_err(|_| anyhow!("chain worker dropped the request"))
    }

    pub async fn add_block_serialized(&self, data: Vec<u8>) -> Result<AddBlockResult> {
        self.request(|reply| ChainCommand::AddBlock { data, reply }).await
    }

    pub async fn add_alt_chain(&self, start: u32, branch: Vec<Block>) -> Result<AddBlockResult> {
        self.request(|reply| ChainCommand::AddAltChain { start, branch, reply })
            .await
    }

    pub async fn add_operations(
        &self,
        operations: Vec<Operation>,
    ) -> Result<Vec<std::result::Result<Hash32, String>>> {
        self.request(|reply| ChainCommand::AddOperations { operations, reply })
            .await
    }

    pub async fn get_state(&self) -> Result<ChainState> {
        self.request(|reply| ChainCommand::GetState { reply }).await
    }

    pub async fn get_account(&self, number: u32) -> Result<Option<AccountView>> {
        self.request(|reply| ChainCommand::GetAccount { number, reply })
            .await
    }

    pub async fn find_accounts(
        &self,
        public_key: PublicKey,
        start: u32,
        max: u32,
    ) -> Result<Vec<AccountView>> {
        self.request(|reply| ChainCommand::FindAccounts {
            public_key: Box::new(public_key),
            start,
            max,
            reply,
        })
        .await
    }

    pub async fn get_block(&self, index: u32) -> Result<Option<Vec<u8>>> {
        self.request(|reply| ChainCommand::GetBlock { index, reply })
            .await
    }

    pub async fn mempool_snapshot(&self) -> Result<Vec<Operation>> {
        self.request(|reply| ChainCommand::MempoolSnapshot { reply })
            .await
    }

    pub async fn export_safebox(&self) -> Result<Vec<u8>> {
        self.request(|reply| ChainCommand::ExportSafebox { reply })
            .await
    }
}

/// Spawns the chain worker owning the blockchain. The worker exits when
/// every handle is dropped or a storage write fails.
pub fn spawn(mut blockchain: Blockchain) -> (ChainHandle, tokio::task::JoinHandle<()>) {
    let (commands, mut rx) = mpsc::channel(COMMANDS_CAPACITY);
    let handle = ChainHandle {
        commands,
        blocks_updates: blockchain.blocks_updates.clone(),
        txpool_updates: blockchain.txpool_updates.clone(),
    };
    let join = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                ChainCommand::AddBlock { data, reply } => {
                    match blockchain.add_block_serialized(&data) {
                        Ok(result) => {
                            let _ = reply.send(result);
                        }
                        Err(err) => {
                            error!("chain worker: {err:#}");
                            let _ = reply.send(AddBlockResult::Invalid(format!("storage: {err}")));
                            return;
                        }
                    }
                }
                ChainCommand::AddAltChain { start, branch, reply } => {
                    match blockchain.add_alt_chain(start, branch) {
                        Ok(result) => {
                            let _ = reply.send(result);
                        }
                        Err(err) => {
                            error!("chain worker: {err:#}");
                            let _ = reply.send(AddBlockResult::Invalid(format!("storage: {err}")));
                            return;
                        }
                    }
                }
                ChainCommand::AddOperations { operations, reply } => {
                    let results = operations
                        .into_iter()
                        .map(|op| blockchain.add_operation(op))
                        .collect();
                    let _ = reply.send(results);
                }
                ChainCommand::GetState { reply } => {
                    let _ = reply.send(blockchain.get_state());
                }
                ChainCommand::GetAccount { number, reply } => {
                    let _ = reply.send(blockchain.get_account(number));
                }
                ChainCommand::FindAccounts {
                    public_key,
                    start,
                    max,
                    reply,
                } => {
                    let _ = reply.send(blockchain.find_accounts(&public_key, start, max));
                }
                ChainCommand::GetBlock { index, reply } => {
                    match blockchain.get_block_serialized(index) {
                        Ok(data) => {
                            let _ = reply.send(data);
                        }
                        Err(err) => {
                            error!("chain worker: {err:#}");
                            let _ = reply.send(None);
                        }
                    }
                }
                ChainCommand::MempoolSnapshot { reply } => {
                    let _ = reply.send(blockchain.mempool_snapshot());
                }
                ChainCommand::ExportSafebox { reply } => {
                    let _ = reply.send(blockchain.export_safebox());
                }
            }
        }
    });
    (handle, join)
}
