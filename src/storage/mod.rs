#![forbid(unsafe_code)]

//! Block and peer persistence behind a narrow byte-store trait. Blocks
//! are addressed by height, peers by `ip:port`; writes are grouped into
//! atomic transactions. The sled implementation keeps the two key spaces
//! in separate trees.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sled::transaction::TransactionError;
use sled::{Db, Transactional, Tree};
use std::path::Path;

/// Serialized address-book entry stored per peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerRecord {
    pub host: String,
    pub port: u16,
    pub last_connect: u32,
    pub last_seen: u32,
}

/// Buffered writes applied atomically when the enclosing
/// [`Storage::with_writable`] scope returns success.
#[derive(Default)]
pub struct WriteBatch {
    blocks: Vec<(u32, Vec<u8>)>,
    removed_blocks: Vec<u32>,
    peers: Vec<(String, Vec<u8>)>,
}

impl WriteBatch {
    pub fn store_block(&mut self, index: u32, data: &[u8]) {
        self.blocks.push((index, data.to_vec()));
    }

    /// Drops a stored block, used when a reorg shortens the chain.
    pub fn remove_block(&mut self, index: u32) {
        self.removed_blocks.push(index);
    }

    pub fn store_peer(&mut self, address: &str, data: &[u8]) {
        self.peers.push((address.to_string(), data.to_vec()));
    }
}

pub trait Storage: Send + Sync {
    fn get_block(&self, index: u32) -> Result<Option<Vec<u8>>>;

    /// Height implied by the persisted blocks: highest index + 1.
    fn block_count(&self) -> Result<u32>;

    fn load_peers(&self, visit: &mut dyn FnMut(&str, &[u8])) -> Result<()>;

    /// Scoped write transaction; any error rolls the whole batch back.
    fn with_writable(&self, write: &mut dyn FnMut(&mut WriteBatch) -> Result<()>) -> Result<()>;

    /// Visits persisted blocks in index order starting at `from`;
    /// the callback returns false to stop early.
    fn iterate_blocks(
        &self,
        from: u32,
        visit: &mut dyn FnMut(u32, &[u8]) -> Result<bool>,
    ) -> Result<()>;
}

pub struct SledStorage {
    _db: Db,
    blocks: Tree,
    peers: Tree,
}

impl SledStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path).context("failed to open database")?;
        let blocks = db.open_tree("block").context("failed to open block tree")?;
        let peers = db.open_tree("peer").context("failed to open peer tree")?;
        Ok(SledStorage {
            _db: db,
            blocks,
            peers,
        })
    }
}

impl Storage for SledStorage {
    fn get_block(&self, index: u32) -> Result<Option<Vec<u8>>> {
        let value = self.blocks.get(index.to_be_bytes())?;
        Ok(value.map(|v| v.to_vec()))
    }

    fn block_count(&self) -> Result<u32> {
        match self.blocks.last()? {
            Some((key, _)) => {
                let bytes: [u8; 4] = key
                    .as_ref()
                    .try_into()
                    .context("malformed block key")?;
                Ok(u32::from_be_bytes(bytes) + 1)
            }
            None => Ok(0),
        }
    }

    fn load_peers(&self, visit: &mut dyn FnMut(&str, &[u8])) -> Result<()> {
        for entry in self.peers.iter() {
            let (key, value) = entry?;
            if let Ok(address) = std::str::from_utf8(&key) {
                visit(address, &value);
            }
        }
        Ok(())
    }

    fn with_writable(&self, write: &mut dyn FnMut(&mut WriteBatch) -> Result<()>) -> Result<()> {
        let mut batch = WriteBatch::default();
        write(&mut batch)?;
        if batch.blocks.is_empty() && batch.removed_blocks.is_empty() && batch.peers.is_empty() {
            return Ok(());
        }
        (&self.blocks, &self.peers)
            .transaction(|(blocks, peers)| {
                for (index, data) in &batch.blocks {
                    blocks.insert(&index.to_be_bytes(), data.as_slice())?;
                }
                for index in &batch.removed_blocks {
                    blocks.remove(&index.to_be_bytes())?;
                }
                for (address, data) in &batch.peers {
                    peers.insert(address.as_bytes(), data.as_slice())?;
                }
                Ok(())
            })
            .map_err(|err: TransactionError| anyhow::anyhow!("storage transaction: {err}"))?;
        self.blocks.flush().context("failed to flush blocks")?;
        Ok(())
    }

    fn iterate_blocks(
        &self,
        from: u32,
        visit: &mut dyn FnMut(u32, &[u8]) -> Result<bool>,
    ) -> Result<()> {
        for entry in self.blocks.range(from.to_be_bytes()..) {
            let (key, value) = entry?;
            let bytes: [u8; 4] = key.as_ref().try_into().context("malformed block key")?;
            if !visit(u32::from_be_bytes(bytes), &value)? {
                break;
            }
        }
        Ok(())
    }
}
