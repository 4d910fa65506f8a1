#![forbid(unsafe_code)]

//! Pure block validation against a chain head: proof of work, retarget,
//! timestamp window, safebox linkage and body consistency. No state is
//! touched here; the blockchain stages the block only after these pass.

use num_bigint::BigUint;
use thiserror::Error;

use crate::block::{self, Block};
use crate::core::Hash32;
use crate::defaults::{BLOCK_VERSION, MEDIAN_TIMESTAMP_BLOCKS, NETWORK_TIME_TOLERANCE};
use crate::safebox;

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("block index {got} does not extend height {expected}")]
    BadIndex { expected: u32, got: u32 },
    #[error("unsupported block version {0}")]
    BadVersion(u16),
    #[error("previous safebox hash does not match the chain head")]
    SafeboxHashMismatch,
    #[error("compact target {got:#010x} differs from required {expected:#010x}")]
    BadTarget { expected: u32, got: u32 },
    #[error("timestamp {got} below median time past {median}")]
    TimestampTooOld { got: u32, median: u32 },
    #[error("timestamp {got} too far ahead of local time {now}")]
    TimestampTooNew { got: u32, now: u32 },
    #[error("declared reward {got} does not match schedule {expected}")]
    BadReward { expected: u64, got: u64 },
    #[error("declared fee total {got} does not match operations")]
    BadFeeTotal { got: u64 },
    #[error("operations merkle root mismatch")]
    MerkleMismatch,
    #[error("insufficient proof of work")]
    InsufficientPow,
}

/// Everything the checks need from the chain head.
pub struct ValidationContext<'a> {
    pub height: u32,
    pub safebox_fingerprint: Hash32,
    /// Recorded window, most recent first.
    pub last_timestamps: &'a [u32],
    pub prev_compact_target: u32,
    pub now: u32,
}

/// Median of the most recent timestamps, the lower bound for new blocks.
pub fn median_time_past(last_timestamps: &[u32]) -> Option<u32> {
    if last_timestamps.is_empty() {
        return None;
    }
    let mut recent: Vec<u32> = last_timestamps
        .iter()
        .copied()
        .take(MEDIAN_TIMESTAMP_BLOCKS)
        .collect();
    recent.sort_unstable();
    Some(recent[recent.len() / 2])
}

pub fn validate(ctx: &ValidationContext, block: &Block) -> Result<(), BlockError> {
    let header = &block.header;

    if header.index != ctx.height {
        return Err(BlockError::BadIndex {
            expected: ctx.height,
            got: header.index,
        });
    }
    if header.version != BLOCK_VERSION {
        return Err(BlockError::BadVersion(header.version));
    }
    if header.prev_safebox_hash != ctx.safebox_fingerprint {
        return Err(BlockError::SafeboxHashMismatch);
    }

    let expected_target =
        block::next_compact_target(ctx.last_timestamps, ctx.prev_compact_target);
    if header.compact_target != expected_target {
        return Err(BlockError::BadTarget {
            expected: expected_target,
            got: header.compact_target,
        });
    }

    if let Some(median) = median_time_past(ctx.last_timestamps) {
        if header.timestamp < median {
            return Err(BlockError::TimestampTooOld {
                got: header.timestamp,
                median,
            });
        }
    }
    if header.timestamp > ctx.now.saturating_add(NETWORK_TIME_TOLERANCE) {
        return Err(BlockError::TimestampTooNew {
            got: header.timestamp,
            now: ctx.now,
        });
    }

    let expected_reward = safebox::get_reward(ctx.height);
    if header.reward != expected_reward {
        return Err(BlockError::BadReward {
            expected: expected_reward,
            got: header.reward,
        });
    }
    let fee_total = block
        .operations
        .iter()
        .try_fold(0u64, |acc, op| acc.checked_add(op.fee()));
    if fee_total != Some(header.fee_total) {
        return Err(BlockError::BadFeeTotal {
            got: header.fee_total,
        });
    }

    if block::operations_merkle_root(&block.operations) != header.operations_merkle_root {
        return Err(BlockError::MerkleMismatch);
    }

    let target = block::decode_compact_target(header.compact_target);
    if BigUint::from_bytes_be(&header.pow_digest()) > target {
        return Err(BlockError::InsufficientPow);
    }

    Ok(())
}
