#![forbid(unsafe_code)]

//! PASL - Personalized Accounts & Secure Ledger
//!
//! Node core for a PascalCoin-compatible cryptocurrency. Consensus state
//! is a dense array of accounts (the safebox) mutated in place by each
//! block; the modules below layer validation, the canonical chain, and
//! the P2P protocol on top of it:
//! - accounter: account array, packs, dirty tracking, fingerprint
//! - safebox: consensus transitions, maturation, staging overlay
//! - block / validator: wire model, PoW target, header checks
//! - blockchain: canonical chain, mempool, reorg, chain worker
//! - network: TCP node, per-peer protocol, sync
//! - storage: block/peer byte store
//! - api: JSON-RPC handler table

pub mod accounter;
pub mod api;
pub mod block;
pub mod blockchain;
pub mod core;
pub mod crypto;
pub mod defaults;
pub mod network;
pub mod safebox;
pub mod storage;
pub mod validator;
pub mod wire;

pub use crate::blockchain::{AddBlockResult, Blockchain, ChainHandle, ChainState};
pub use crate::safebox::Safebox;
