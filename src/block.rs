#![forbid(unsafe_code)]

//! Block model and proof-of-work arithmetic: header wire layout, compact
//! target encoding, per-block difficulty and the operations merkle root.

use num_bigint::BigUint;

use crate::core::{sha256, sha256_pair, Hash32};
use crate::crypto::{self, PublicKey};
use crate::defaults::{
    MAX_BLOCK_OPERATIONS, MIN_COMPACT_TARGET, TARGET_MAX_ADJUST_PERCENT, TARGET_TIMESPAN_SECONDS,
};
use crate::safebox::tx::Operation;
use crate::wire::{self, WireError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub index: u32,
    pub version: u16,
    pub protocol_version: u16,
    pub protocol_available: u16,
    pub prev_safebox_hash: Hash32,
    pub reward_public_key: PublicKey,
    pub reward: u64,
    pub fee_total: u64,
    pub timestamp: u32,
    pub compact_target: u32,
    pub nonce: u32,
    pub payload: Vec<u8>,
    pub operations_merkle_root: Hash32,
    pub safebox_hash_after: Hash32,
}

impl BlockHeader {
    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        wire::write_u32(out, self.index);
        wire::write_u16(out, self.version);
        wire::write_u16(out, self.protocol_version);
        wire::write_u16(out, self.protocol_available);
        wire::write_hash(out, &self.prev_safebox_hash);
        wire::write_bytes(out, &crypto::serialize_public(&self.reward_public_key));
        wire::write_u64(out, self.reward);
        wire::write_u64(out, self.fee_total);
        wire::write_u32(out, self.timestamp);
        wire::write_u32(out, self.compact_target);
        wire::write_u32(out, self.nonce);
        wire::write_bytes(out, &self.payload);
        wire::write_hash(out, &self.operations_merkle_root);
        wire::write_hash(out, &self.safebox_hash_after);
    }

    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(BlockHeader {
            index: wire::read_u32(buf)?,
            version: wire::read_u16(buf)?,
            protocol_version: wire::read_u16(buf)?,
            protocol_available: wire::read_u16(buf)?,
            prev_safebox_hash: wire::read_hash(buf)?,
            reward_public_key: crypto::parse_public(&wire::read_bytes(buf)?)?,
            reward: wire::read_u64(buf)?,
            fee_total: wire::read_u64(buf)?,
            timestamp: wire::read_u32(buf)?,
            compact_target: wire::read_u32(buf)?,
            nonce: wire::read_u32(buf)?,
            payload: wire::read_bytes(buf)?,
            operations_merkle_root: wire::read_hash(buf)?,
            safebox_hash_after: wire::read_hash(buf)?,
        })
    }

    /// Digest the proof-of-work is computed over.
    pub fn pow_digest(&self) -> Hash32 {
        let mut bytes = Vec::new();
        self.serialize_into(&mut bytes);
        sha256(&bytes)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub operations: Vec<Operation>,
}

impl Block {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.header.serialize_into(&mut out);
        wire::write_uvarint(&mut out, self.operations.len() as u64);
        for op in &self.operations {
            op.serialize_into(&mut out);
        }
        out
    }

    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, WireError> {
        let header = BlockHeader::deserialize(buf)?;
        let count = wire::read_uvarint(buf)?;
        if count > MAX_BLOCK_OPERATIONS {
            return Err(WireError::Oversized(
                count as usize,
                MAX_BLOCK_OPERATIONS as usize,
            ));
        }
        let mut operations = Vec::with_capacity(count as usize);
        for _ in 0..count {
            operations.push(Operation::deserialize(buf)?);
        }
        Ok(Block { header, operations })
    }
}

/// Merkle root over operation digests; zero for an empty block.
pub fn operations_merkle_root(operations: &[Operation]) -> Hash32 {
    if operations.is_empty() {
        return [0u8; 32];
    }
    let mut level: Vec<Hash32> = operations.iter().map(|op| op.digest()).collect();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let right = pair.get(1).unwrap_or(&pair[0]);
            next.push(sha256_pair(&pair[0], right));
        }
        level = next;
    }
    level[0]
}

/// Compact target: leading-zero-bit count in the high byte, normalized
/// 24-bit mantissa below. A larger decoded value is an easier target.
pub fn decode_compact_target(compact: u32) -> BigUint {
    let zero_bits = (compact >> 24).min(232);
    let mantissa = compact & 0x00ff_ffff;
    BigUint::from(mantissa) << (256 - 24 - zero_bits)
}

pub fn encode_compact_target(target: &BigUint) -> u32 {
    let bits = target.bits();
    if bits == 0 {
        return 232 << 24;
    }
    let (zero_bits, mantissa) = if bits >= 256 {
        (0u32, (target >> (bits - 24)) & BigUint::from(0x00ff_ffffu32))
    } else if bits >= 24 {
        (
            (256 - bits) as u32,
            (target >> (bits - 24)) & BigUint::from(0x00ff_ffffu32),
        )
    } else {
        ((256 - bits) as u32, target << (24 - bits))
    };
    let mantissa: u32 = mantissa.try_into().expect("masked to 24 bits");
    (zero_bits.min(232) << 24) | mantissa
}

/// Work contributed by a block mined at `target`.
pub fn difficulty(target: &BigUint) -> BigUint {
    (BigUint::from(1u8) << 256u32) / (target + 1u8)
}

/// Retarget from the recorded timestamp window (most recent first).
/// The adjustment ratio is clamped and the result is never easier than
/// the floor target.
pub fn next_compact_target(last_timestamps: &[u32], prev_compact: u32) -> u32 {
    if last_timestamps.len() < 2 {
        return MIN_COMPACT_TARGET;
    }
    let newest = last_timestamps[0] as u64;
    let oldest = *last_timestamps.last().expect("non-empty") as u64;
    let spans = (last_timestamps.len() - 1) as u64;
    let expected = u64::from(TARGET_TIMESPAN_SECONDS) * spans;
    let actual = newest
        .saturating_sub(oldest)
        .clamp(
            expected * (100 - TARGET_MAX_ADJUST_PERCENT) / 100,
            expected * (100 + TARGET_MAX_ADJUST_PERCENT) / 100,
        )
        .max(1);

    let next = decode_compact_target(prev_compact) * actual / expected;
    let floor = decode_compact_target(MIN_COMPACT_TARGET);
    encode_compact_target(&next.min(floor).max(BigUint::from(1u8)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::defaults::{BLOCK_VERSION, PROTOCOL_AVAILABLE, PROTOCOL_VERSION};

    fn sample_header(key: &Keypair) -> BlockHeader {
        BlockHeader {
            index: 9,
            version: BLOCK_VERSION,
            protocol_version: PROTOCOL_VERSION,
            protocol_available: PROTOCOL_AVAILABLE,
            prev_safebox_hash: [1u8; 32],
            reward_public_key: key.public,
            reward: 500_000,
            fee_total: 4,
            timestamp: 12_345,
            compact_target: MIN_COMPACT_TARGET,
            nonce: 77,
            payload: b"mined by tests".to_vec(),
            operations_merkle_root: [2u8; 32],
            safebox_hash_after: [3u8; 32],
        }
    }

    #[test]
    fn block_round_trip() {
        let key = Keypair::generate();
        let mut op = Operation::Transfer {
            source: 0,
            op_id: 1,
            destination: 2,
            amount: 3,
            fee: 4,
            payload: Vec::new(),
            signature: Vec::new(),
        };
        op.sign(&key);
        let block = Block {
            header: sample_header(&key),
            operations: vec![op],
        };
        let bytes = block.serialize();
        let mut buf = bytes.as_slice();
        let decoded = Block::deserialize(&mut buf).unwrap();
        assert!(buf.is_empty());
        assert_eq!(decoded, block);
    }

    #[test]
    fn compact_target_round_trip() {
        for compact in [MIN_COMPACT_TARGET, 0x10ab_cdef, 0x20ff_ffff, 0x8080_0000] {
            let target = decode_compact_target(compact);
            assert_eq!(encode_compact_target(&target), compact);
        }
    }

    #[test]
    fn smaller_target_means_more_work() {
        let easy = decode_compact_target(MIN_COMPACT_TARGET);
        let hard = decode_compact_target(0x20ff_ffff);
        assert!(hard < easy);
        assert!(difficulty(&hard) > difficulty(&easy));
    }

    #[test]
    fn retarget_is_stable_on_schedule() {
        // blocks exactly on the expected cadence keep the target
        let window: Vec<u32> = (0..50u32).rev().map(|i| i * TARGET_TIMESPAN_SECONDS).collect();
        assert_eq!(
            next_compact_target(&window, MIN_COMPACT_TARGET),
            MIN_COMPACT_TARGET
        );
    }

    #[test]
    fn retarget_clamps_fast_blocks() {
        // all timestamps equal: maximum hardening, clamped to half
        let window = vec![1000u32; 30];
        let next = next_compact_target(&window, MIN_COMPACT_TARGET);
        let prev = decode_compact_target(MIN_COMPACT_TARGET);
        let decoded = decode_compact_target(next);
        assert!(decoded < prev);
        assert!(decoded >= &prev / 2u8 - BigUint::from(1u32 << 24));
    }

    #[test]
    fn retarget_never_exceeds_floor() {
        // slow blocks cannot push the target above the floor
        let window: Vec<u32> = (0..30u32).rev().map(|i| i * 10_000).collect();
        assert_eq!(
            next_compact_target(&window, MIN_COMPACT_TARGET),
            MIN_COMPACT_TARGET
        );
    }

    #[test]
    fn merkle_root_depends_on_order() {
        let key = Keypair::generate();
        let mut a = Operation::Transfer {
            source: 0,
            op_id: 1,
            destination: 1,
            amount: 1,
            fee: 0,
            payload: Vec::new(),
            signature: Vec::new(),
        };
        a.sign(&key);
        let mut b = a.clone();
        if let Operation::Transfer { amount, .. } = &mut b {
            *amount = 2;
        }
        b.sign(&key);

        assert_eq!(operations_merkle_root(&[]), [0u8; 32]);
        assert_ne!(
            operations_merkle_root(&[a.clone(), b.clone()]),
            operations_merkle_root(&[b, a])
        );
    }
}
