//! Network-wide constants shared by consensus, networking and the CLI.

use std::time::Duration;

pub const USER_AGENT: &str = concat!("pasl/", env!("CARGO_PKG_VERSION"));

/// Accounts created by every block; also the size of a fingerprint pack.
pub const ACCOUNTS_PER_BLOCK: u32 = 5;

/// Blocks that must pass before an updated account may spend again.
pub const MATURATION_HEIGHT: u32 = 100;

pub const INITIAL_REWARD: u64 = 500_000;
pub const MIN_REWARD: u64 = 10_000;
pub const REWARD_HALVING_INTERVAL: u32 = 420_480;

pub const NET_MAGIC: u32 = 0x4D4F_4C41;
pub const PROTOCOL_VERSION: u16 = 4;
pub const PROTOCOL_AVAILABLE: u16 = 5;
pub const BLOCK_VERSION: u16 = 5;

pub const P2P_BIND_ADDRESS: &str = "0.0.0.0";
pub const P2P_PORT: u16 = 4004;
pub const RPC_BIND_HOST: &str = "127.0.0.1";
pub const RPC_PORT: u16 = 4003;

pub const MAX_INCOMING: usize = 32;
pub const MAX_OUTGOING: usize = 8;

pub const TIMEOUT_CONNECT: Duration = Duration::from_secs(5);
pub const TIMEOUT_REQUEST: Duration = Duration::from_secs(30);
pub const TIMEOUT_IDLE: Duration = Duration::from_secs(300);
pub const DIAL_INTERVAL: Duration = Duration::from_secs(10);

/// Retarget window: number of recent block timestamps the safebox records.
pub const TIMESTAMP_WINDOW: usize = 100;
/// Timestamps consulted by the median-time-past rule.
pub const MEDIAN_TIMESTAMP_BLOCKS: usize = 11;
/// Seconds a block timestamp may run ahead of local time.
pub const NETWORK_TIME_TOLERANCE: u32 = 900;
/// Expected seconds between blocks.
pub const TARGET_TIMESPAN_SECONDS: u32 = 300;
/// Per-block target adjustment clamp, in percent.
pub const TARGET_MAX_ADJUST_PERCENT: u64 = 50;

/// Blocks requested per get-blocks window during sync.
pub const SYNC_WINDOW: u32 = 100;

/// Easiest accepted compact target; also the genesis target.
/// High byte is the required count of leading zero bits.
pub const MIN_COMPACT_TARGET: u32 = 0x08FF_FFFF;

/// Upper bound on a P2P frame payload.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;
/// Upper bound on any length-prefixed byte array inside consensus data.
pub const MAX_WIRE_BYTES: usize = 64 * 1024;
/// Upper bound on operations carried by a single block.
pub const MAX_BLOCK_OPERATIONS: u64 = 10_000;

pub const BOOTSTRAP_NODES: &str = "pasl.ddns.net:4004,45.32.175.14:4004";
