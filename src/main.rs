#![forbid(unsafe_code)]

//! PASL command line interface: runs the node, exports the safebox and
//! reads chain data straight from storage.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pasl::api;
use pasl::blockchain::{self, Blockchain};
use pasl::crypto::{self, Keypair};
use pasl::defaults;
use pasl::network::{peer::PeerManager, AddressBook, Config, Node, PeerSource};
use pasl::storage::SledStorage;

#[derive(Parser, Debug)]
#[command(name = "pasl", version, about = "PASL command line interface")]
struct Cli {
    /// Directory to store blockchain files
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Rescan the blockchain and recover the safebox at a specific height
    #[arg(long, global = true)]
    height: Option<u32>,

    /// P2P bind port
    #[arg(long, default_value_t = defaults::P2P_PORT)]
    p2p_bind_port: u16,

    /// Comma-separated ip:port list of exclusive nodes to connect to
    #[arg(long)]
    exclusive_nodes: Option<String>,

    /// RPC bind ip
    #[arg(long, default_value_t = defaults::RPC_BIND_HOST.to_string())]
    rpc_bind_ip: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Export blockchain data
    Export {
        #[command(subcommand)]
        what: ExportCommand,
    },
    /// Get blockchain info
    Get {
        #[command(subcommand)]
        what: GetCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ExportCommand {
    /// Export safebox contents
    Safebox,
}

#[derive(Subcommand, Debug)]
enum GetCommand {
    /// Get current height
    Height,
    /// Get raw block data
    Block { index: u32 },
}

fn data_dir(cli: &Cli) -> Result<PathBuf> {
    let dir = cli
        .data_dir
        .clone()
        .or_else(|| dirs::data_dir().map(|base| base.join("pasl")))
        .context("cannot determine a data directory, use --data-dir")?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create data directory {}", dir.display()))?;
    Ok(dir)
}

fn open_blockchain(cli: &Cli) -> Result<(Arc<SledStorage>, Blockchain)> {
    let dir = data_dir(cli)?;
    let storage = Arc::new(SledStorage::open(dir.join("storage.db"))?);
    let blockchain = Blockchain::new(storage.clone(), cli.height)?;
    Ok((storage, blockchain))
}

async fn run_node(cli: Cli) -> Result<()> {
    let (storage, chain_state) = open_blockchain(&cli)?;
    let state = chain_state.get_state();
    info!(
        height = state.height,
        safebox = %hex::encode(state.safebox_hash),
        difficulty = %state.cumulative_difficulty,
        "blockchain loaded"
    );
    let (chain, chain_worker) = blockchain::spawn(chain_state);

    // per-process nonce backing the self-connection guard
    let node_key = Keypair::generate();
    let nonce = crypto::serialize_public(&node_key.public).to_vec();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let address_book = Arc::new(Mutex::new(AddressBook::default()));
    let mut config = Config {
        listen_addr: format!("{}:{}", defaults::P2P_BIND_ADDRESS, cli.p2p_bind_port),
        ..Config::default()
    };
    {
        let mut book = address_book.lock().expect("address book lock");
        if let Some(nodes) = &cli.exclusive_nodes {
            config.exclusive = true;
            for host_port in nodes.split(',') {
                book.add_host_port(host_port.trim(), PeerSource::Operator)
                    .with_context(|| format!("bad exclusive node '{host_port}'"))?;
            }
        } else {
            book.load(storage.as_ref())?;
            for host_port in defaults::BOOTSTRAP_NODES.split(',') {
                if let Err(err) = book.add_host_port(host_port.trim(), PeerSource::Bootstrap) {
                    warn!("skipping bootstrap node '{host_port}': {err}");
                }
            }
        }
        info!(peers = book.len(), "address book ready");
    }

    let manager = PeerManager::new(
        nonce,
        cli.p2p_bind_port,
        chain.clone(),
        Arc::clone(&address_book),
    );
    let gossip = manager.spawn_gossip();

    let node = Node::new(
        config,
        Arc::clone(&manager),
        Arc::clone(&address_book),
        shutdown_rx.clone(),
    );
    let node_task = tokio::spawn(node.run());

    let rpc_addr = format!("{}:{}", cli.rpc_bind_ip, defaults::RPC_PORT);
    let rpc_task = tokio::spawn(api::serve(
        api::Api::new(chain.clone()),
        rpc_addr,
        shutdown_rx.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for the shutdown signal")?;
    info!("exit signal received, terminating");
    let _ = shutdown_tx.send(true);

    // teardown mirrors acquisition in reverse; the address book flushes last
    if let Err(err) = rpc_task.await? {
        warn!("rpc shutdown: {err:#}");
    }
    if let Err(err) = node_task.await? {
        warn!("node shutdown: {err:#}");
    }
    gossip.abort();
    drop(chain);
    if tokio::time::timeout(Duration::from_secs(5), chain_worker)
        .await
        .is_err()
    {
        warn!("chain worker did not stop in time");
    }
    address_book
        .lock()
        .expect("address book lock")
        .persist(storage.as_ref())
        .context("failed to persist the address book")?;
    Ok(())
}

async fn run(mut cli: Cli) -> Result<()> {
    match cli.command.take() {
        None => run_node(cli).await,
        Some(Command::Export {
            what: ExportCommand::Safebox,
        }) => {
            let (_storage, blockchain) = open_blockchain(&cli)?;
            print!("{}", hex::encode(blockchain.export_safebox()));
            Ok(())
        }
        Some(Command::Get { what }) => {
            let (storage, blockchain) = open_blockchain(&cli)?;
            match what {
                GetCommand::Height => {
                    println!("{}", blockchain.get_state().height);
                }
                GetCommand::Block { index } => {
                    use pasl::storage::Storage;
                    match storage.get_block(index)? {
                        Some(data) => println!("{}", hex::encode(data)),
                        None => bail!("block {index} not found"),
                    }
                }
            }
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            use clap::error::ErrorKind;
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = err.print();
            return ExitCode::from(code);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: failed to start runtime: {err}");
            return ExitCode::from(2);
        }
    };
    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(2)
        }
    }
}
