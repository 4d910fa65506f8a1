#![forbid(unsafe_code)]

//! TCP node: listen/accept and dial loops around a shared address book.
//! Connections are handed to the [`peer::PeerManager`]; the node only
//! decides who to talk to and enforces the connection budgets.

pub mod peer;
pub mod protocol;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use self::peer::{Direction, PeerManager};
use self::protocol::PeerAddress;
use crate::core::now_ts;
use crate::defaults::{DIAL_INTERVAL, MAX_INCOMING, MAX_OUTGOING, TIMEOUT_CONNECT};
use crate::storage::{PeerRecord, Storage};

#[derive(Clone, Debug)]
pub struct Config {
    pub listen_addr: String,
    pub max_incoming: usize,
    pub max_outgoing: usize,
    /// Dial only operator-supplied peers, ignore everything learned.
    pub exclusive: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: format!(
                "{}:{}",
                crate::defaults::P2P_BIND_ADDRESS,
                crate::defaults::P2P_PORT
            ),
            max_incoming: MAX_INCOMING,
            max_outgoing: MAX_OUTGOING,
            exclusive: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerSource {
    Bootstrap,
    Stored,
    Exchange,
    Operator,
}

#[derive(Clone, Debug)]
pub struct PeerEntry {
    pub host: String,
    pub port: u16,
    pub last_connect: u32,
    pub last_seen: u32,
    pub failures: u32,
    pub source: PeerSource,
}

impl PeerEntry {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Known peers keyed by `host:port`; read-mostly, guarded by a mutex.
#[derive(Default)]
pub struct AddressBook {
    entries: HashMap<String, PeerEntry>,
}

impl AddressBook {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add(&mut self, host: &str, port: u16, source: PeerSource) {
        let address = format!("{host}:{port}");
        self.entries.entry(address).or_insert_with(|| PeerEntry {
            host: host.to_string(),
            port,
            last_connect: 0,
            last_seen: 0,
            failures: 0,
            source,
        });
    }

    /// Parses `host:port`, as supplied by operators and bootstrap lists.
    pub fn add_host_port(&mut self, host_port: &str, source: PeerSource) -> Result<()> {
        let (host, port) = host_port
            .rsplit_once(':')
            .context("peer address must be host:port")?;
        let port: u16 = port.parse().context("invalid peer port")?;
        self.add(host, port, source);
        Ok(())
    }

    /// Merges addresses advertised in a hello payload.
    pub fn merge_advertised(&mut self, peers: &[PeerAddress]) {
        for peer in peers {
            self.add(&peer.host, peer.port, PeerSource::Exchange);
            if let Some(entry) = self.entries.get_mut(&format!("{}:{}", peer.host, peer.port)) {
                entry.last_seen = entry.last_seen.max(peer.last_seen);
            }
        }
    }

    /// Records a live connection from `ip`, listening on `port`.
    pub fn note_seen(&mut self, ip: IpAddr, port: u16) {
        let host = ip.to_string();
        self.add(&host, port, PeerSource::Exchange);
        if let Some(entry) = self.entries.get_mut(&format!("{host}:{port}")) {
            entry.last_seen = now_ts();
            entry.failures = 0;
        }
    }

    pub fn mark_attempt(&mut self, address: &str) {
        if let Some(entry) = self.entries.get_mut(address) {
            entry.failures = entry.failures.saturating_add(1);
        }
    }

    pub fn mark_connected(&mut self, address: &str) {
        if let Some(entry) = self.entries.get_mut(address) {
            entry.last_connect = now_ts();
            entry.failures = 0;
        }
    }

    /// Random subset for hello payloads.
    pub fn sample(&self, limit: usize) -> Vec<PeerAddress> {
        let mut peers: Vec<PeerAddress> = self
            .entries
            .values()
            .map(|entry| PeerAddress {
                host: entry.host.clone(),
                port: entry.port,
                last_seen: entry.last_seen,
            })
            .collect();
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(limit);
        peers
    }

    /// Dial candidates: lowest failure count first, ties randomized.
    /// In exclusive mode only operator-supplied entries qualify.
    pub fn candidates(&self, limit: usize, exclusive: bool) -> Vec<String> {
        let mut entries: Vec<&PeerEntry> = self
            .entries
            .values()
            .filter(|entry| !exclusive || entry.source == PeerSource::Operator)
            .collect();
        entries.shuffle(&mut rand::thread_rng());
        entries.sort_by_key(|entry| entry.failures);
        entries
            .into_iter()
            .take(limit)
            .map(|entry| entry.address())
            .collect()
    }

    pub fn load(&mut self, storage: &dyn Storage) -> Result<()> {
        storage.load_peers(&mut |address, data| {
            match bincode::deserialize::<PeerRecord>(data) {
                Ok(record) => {
                    self.entries
                        .entry(address.to_string())
                        .or_insert_with(|| PeerEntry {
                            host: record.host,
                            port: record.port,
                            last_connect: record.last_connect,
                            last_seen: record.last_seen,
                            failures: 0,
                            source: PeerSource::Stored,
                        });
                }
                Err(err) => warn!(address, "skipping malformed stored peer: {err}"),
            }
        })
    }

    pub fn persist(&self, storage: &dyn Storage) -> Result<()> {
        storage.with_writable(&mut |batch| {
            for entry in self.entries.values() {
                let record = PeerRecord {
                    host: entry.host.clone(),
                    port: entry.port,
                    last_connect: entry.last_connect,
                    last_seen: entry.last_seen,
                };
                let data = bincode::serialize(&record)?;
                batch.store_peer(&entry.address(), &data);
            }
            Ok(())
        })
    }
}

/// Accept and dial loops; lives until the shutdown signal flips.
pub struct Node {
    config: Config,
    manager: Arc<PeerManager>,
    address_book: Arc<Mutex<AddressBook>>,
    shutdown: watch::Receiver<bool>,
}

impl Node {
    pub fn new(
        config: Config,
        manager: Arc<PeerManager>,
        address_book: Arc<Mutex<AddressBook>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Node {
            config,
            manager,
            address_book,
            shutdown,
        }
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.config.listen_addr))?;
        info!(addr = %self.config.listen_addr, "p2p listening");

        let accept = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.manager),
            self.config.clone(),
            self.shutdown.clone(),
        ));
        let dial = tokio::spawn(dial_loop(
            Arc::clone(&self.manager),
            Arc::clone(&self.address_book),
            self.config.clone(),
            self.shutdown.clone(),
        ));

        let mut shutdown = self.shutdown.clone();
        let _ = shutdown.changed().await;
        self.manager.close_all();
        let _ = tokio::join!(accept, dial);
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    manager: Arc<PeerManager>,
    config: Config,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    if manager.peer_count(Direction::Inbound) >= config.max_incoming {
                        warn!(peer = %addr, "incoming budget exhausted, rejecting");
                        continue;
                    }
                    manager.on_new_connection(stream, addr, Direction::Inbound);
                }
                Err(err) => warn!("accept failed: {err}"),
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn dial_loop(
    manager: Arc<PeerManager>,
    address_book: Arc<Mutex<AddressBook>>,
    config: Config,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(DIAL_INTERVAL) => {}
            _ = shutdown.changed() => break,
        }
        let want = config
            .max_outgoing
            .saturating_sub(manager.peer_count(Direction::Outbound));
        if want == 0 {
            continue;
        }
        let candidates = {
            address_book
                .lock()
                .expect("address book lock")
                .candidates(want, config.exclusive)
        };
        for address in candidates {
            {
                address_book
                    .lock()
                    .expect("address book lock")
                    .mark_attempt(&address);
            }
            let manager = Arc::clone(&manager);
            let address_book = Arc::clone(&address_book);
            tokio::spawn(async move {
                match tokio::time::timeout(TIMEOUT_CONNECT, TcpStream::connect(&address)).await {
                    Ok(Ok(stream)) => match stream.peer_addr() {
                        Ok(addr) => {
                            if manager.is_connected(&addr) {
                                return;
                            }
                            address_book
                                .lock()
                                .expect("address book lock")
                                .mark_connected(&address);
                            manager.on_new_connection(stream, addr, Direction::Outbound);
                        }
                        Err(err) => debug!(%address, "peer address unavailable: {err}"),
                    },
                    Ok(Err(err)) => debug!(%address, "dial failed: {err}"),
                    Err(_) => debug!(%address, "dial timed out"),
                }
            });
        }
    }
}
