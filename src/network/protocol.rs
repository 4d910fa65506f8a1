#![forbid(unsafe_code)]

//! Framed P2P records and payload codecs. Every message on the wire is
//! `magic | type | op | req_id | err_code | reserved | payload_len |
//! payload`, little-endian throughout; payloads are encoded with the
//! consensus wire helpers so they stay bit-exact across versions.

use bytes::{Buf, BufMut, BytesMut};
use num_bigint::BigUint;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::core::Hash32;
use crate::defaults::{MAX_FRAME_PAYLOAD, NET_MAGIC};
use crate::safebox::tx::Operation;
use crate::wire::{self, WireError};

pub const OP_HELLO: u16 = 0x0001;
pub const OP_ERROR: u16 = 0x0002;
pub const OP_GET_BLOCKS: u16 = 0x0010;
pub const OP_NEW_BLOCK: u16 = 0x0011;
pub const OP_NEW_OPERATIONS: u16 = 0x0020;

pub const ERR_NONE: u16 = 0;
pub const ERR_BAD_REQUEST: u16 = 1;
pub const ERR_INTERNAL: u16 = 2;

const HEADER_LEN: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Response,
    Auto,
}

impl FrameKind {
    fn to_wire(self) -> u16 {
        match self {
            FrameKind::Request => 1,
            FrameKind::Response => 2,
            FrameKind::Auto => 3,
        }
    }

    fn from_wire(value: u16) -> Option<Self> {
        match value {
            1 => Some(FrameKind::Request),
            2 => Some(FrameKind::Response),
            3 => Some(FrameKind::Auto),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Frame {
    pub kind: FrameKind,
    pub op: u16,
    pub req_id: u32,
    pub err_code: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn request(op: u16, req_id: u32, payload: Vec<u8>) -> Self {
        Frame {
            kind: FrameKind::Request,
            op,
            req_id,
            err_code: ERR_NONE,
            payload,
        }
    }

    pub fn response(op: u16, req_id: u32, payload: Vec<u8>) -> Self {
        Frame {
            kind: FrameKind::Response,
            op,
            req_id,
            err_code: ERR_NONE,
            payload,
        }
    }

    pub fn error_response(op: u16, req_id: u32, err_code: u16) -> Self {
        Frame {
            kind: FrameKind::Response,
            op,
            req_id,
            err_code,
            payload: Vec::new(),
        }
    }

    pub fn auto(op: u16, payload: Vec<u8>) -> Self {
        Frame {
            kind: FrameKind::Auto,
            op,
            req_id: 0,
            err_code: ERR_NONE,
            payload,
        }
    }
}

#[derive(Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = &src[..HEADER_LEN];
        let magic = header.get_u32_le();
        if magic != NET_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad frame magic"));
        }
        let kind = FrameKind::from_wire(header.get_u16_le())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad frame type"))?;
        let op = header.get_u16_le();
        let req_id = header.get_u32_le();
        let err_code = header.get_u16_le();
        let _reserved = header.get_u16_le();
        let payload_len = header.get_u32_le() as usize;
        if payload_len > MAX_FRAME_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame payload too large",
            ));
        }
        if src.len() < HEADER_LEN + payload_len {
            src.reserve(HEADER_LEN + payload_len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let payload = src.split_to(payload_len).to_vec();
        Ok(Some(Frame {
            kind,
            op,
            req_id,
            err_code,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), io::Error> {
        if item.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame payload too large",
            ));
        }
        dst.reserve(HEADER_LEN + item.payload.len());
        dst.put_u32_le(NET_MAGIC);
        dst.put_u16_le(item.kind.to_wire());
        dst.put_u16_le(item.op);
        dst.put_u32_le(item.req_id);
        dst.put_u16_le(item.err_code);
        dst.put_u16_le(0);
        dst.put_u32_le(item.payload.len() as u32);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

/// A peer address as exchanged in hello payloads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
    pub last_seen: u32,
}

impl PeerAddress {
    fn serialize_into(&self, out: &mut Vec<u8>) {
        wire::write_bytes8(out, self.host.as_bytes());
        wire::write_u16(out, self.port);
        wire::write_u32(out, self.last_seen);
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, WireError> {
        let host =
            String::from_utf8(wire::read_bytes8(buf)?).map_err(|_| WireError::InvalidString)?;
        Ok(PeerAddress {
            host,
            port: wire::read_u16(buf)?,
            last_seen: wire::read_u32(buf)?,
        })
    }
}

/// Hello payload: who the peer is and where its chain stands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hello {
    pub listen_port: u16,
    pub nonce: Vec<u8>,
    pub height: u32,
    pub safebox_hash: Hash32,
    pub cumulative_difficulty: BigUint,
    pub timestamp: u32,
    pub user_agent: String,
    pub peers: Vec<PeerAddress>,
}

impl Hello {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        wire::write_u16(&mut out, self.listen_port);
        wire::write_bytes(&mut out, &self.nonce);
        wire::write_u32(&mut out, self.height);
        wire::write_hash(&mut out, &self.safebox_hash);
        wire::write_bytes(&mut out, &self.cumulative_difficulty.to_bytes_be());
        wire::write_u32(&mut out, self.timestamp);
        wire::write_string(&mut out, &self.user_agent);
        wire::write_u32(&mut out, self.peers.len() as u32);
        for peer in &self.peers {
            peer.serialize_into(&mut out);
        }
        out
    }

    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, WireError> {
        let listen_port = wire::read_u16(buf)?;
        let nonce = wire::read_bytes(buf)?;
        let height = wire::read_u32(buf)?;
        let safebox_hash = wire::read_hash(buf)?;
        let cumulative_difficulty = BigUint::from_bytes_be(&wire::read_bytes(buf)?);
        let timestamp = wire::read_u32(buf)?;
        let user_agent = wire::read_string(buf)?;
        let count = wire::read_u32(buf)? as usize;
        if count > 1000 {
            return Err(WireError::Oversized(count, 1000));
        }
        let mut peers = Vec::with_capacity(count);
        for _ in 0..count {
            peers.push(PeerAddress::deserialize(buf)?);
        }
        Ok(Hello {
            listen_port,
            nonce,
            height,
            safebox_hash,
            cumulative_difficulty,
            timestamp,
            user_agent,
            peers,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GetBlocksRequest {
    pub from: u32,
    pub to: u32,
}

impl GetBlocksRequest {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        wire::write_u32(&mut out, self.from);
        wire::write_u32(&mut out, self.to);
        out
    }

    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(GetBlocksRequest {
            from: wire::read_u32(buf)?,
            to: wire::read_u32(buf)?,
        })
    }
}

/// Serialized blocks, count-prefixed, each length-prefixed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlocksPayload {
    pub blocks: Vec<Vec<u8>>,
}

impl BlocksPayload {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        wire::write_u32(&mut out, self.blocks.len() as u32);
        for block in &self.blocks {
            wire::write_u32(&mut out, block.len() as u32);
            out.extend_from_slice(block);
        }
        out
    }

    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, WireError> {
        let count = wire::read_u32(buf)? as usize;
        let mut blocks = Vec::new();
        for _ in 0..count {
            let len = wire::read_u32(buf)? as usize;
            if len > MAX_FRAME_PAYLOAD {
                return Err(WireError::Oversized(len, MAX_FRAME_PAYLOAD));
            }
            if buf.len() < len {
                return Err(WireError::Truncated);
            }
            blocks.push(buf[..len].to_vec());
            *buf = &buf[len..];
        }
        Ok(BlocksPayload { blocks })
    }
}

/// Gossiped operations, uvarint-count-prefixed.
pub fn serialize_operations(operations: &[Operation]) -> Vec<u8> {
    let mut out = Vec::new();
    wire::write_uvarint(&mut out, operations.len() as u64);
    for op in operations {
        op.serialize_into(&mut out);
    }
    out
}

pub fn deserialize_operations(buf: &mut &[u8]) -> Result<Vec<Operation>, WireError> {
    let count = wire::read_uvarint(buf)?;
    if count > crate::defaults::MAX_BLOCK_OPERATIONS {
        return Err(WireError::Oversized(
            count as usize,
            crate::defaults::MAX_BLOCK_OPERATIONS as usize,
        ));
    }
    let mut operations = Vec::with_capacity(count as usize);
    for _ in 0..count {
        operations.push(Operation::deserialize(buf)?);
    }
    Ok(operations)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hello() -> Hello {
        Hello {
            listen_port: 4004,
            nonce: vec![7; 33],
            height: 42,
            safebox_hash: [5u8; 32],
            cumulative_difficulty: BigUint::from(123_456_789u64),
            timestamp: 1_700_000_000,
            user_agent: "pasl/0.1.0".to_string(),
            peers: vec![PeerAddress {
                host: "10.0.0.1".to_string(),
                port: 4004,
                last_seen: 99,
            }],
        }
    }

    #[test]
    fn frame_codec_round_trip() {
        let mut codec = FrameCodec;
        let frame = Frame::request(OP_HELLO, 7, sample_hello().serialize());
        let mut bytes = BytesMut::new();
        codec.encode(frame.clone(), &mut bytes).unwrap();

        // a partial header decodes to nothing
        let mut partial = BytesMut::from(&bytes[..10]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        let decoded = codec.decode(&mut bytes).unwrap().unwrap();
        assert_eq!(decoded.kind, FrameKind::Request);
        assert_eq!(decoded.op, OP_HELLO);
        assert_eq!(decoded.req_id, 7);
        assert_eq!(decoded.payload, frame.payload);
        assert!(bytes.is_empty());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut codec = FrameCodec;
        let mut bytes = BytesMut::new();
        codec
            .encode(Frame::auto(OP_NEW_BLOCK, vec![1, 2, 3]), &mut bytes)
            .unwrap();
        bytes[0] ^= 0xff;
        assert!(codec.decode(&mut bytes).is_err());
    }

    #[test]
    fn hello_round_trip() {
        let hello = sample_hello();
        let bytes = hello.serialize();
        let mut buf = bytes.as_slice();
        assert_eq!(Hello::deserialize(&mut buf).unwrap(), hello);
        assert!(buf.is_empty());
    }

    #[test]
    fn get_blocks_round_trip() {
        let request = GetBlocksRequest { from: 10, to: 109 };
        let bytes = request.serialize();
        let mut buf = bytes.as_slice();
        assert_eq!(GetBlocksRequest::deserialize(&mut buf).unwrap(), request);

        let payload = BlocksPayload {
            blocks: vec![vec![1, 2, 3], vec![], vec![9; 100]],
        };
        let bytes = payload.serialize();
        let mut buf = bytes.as_slice();
        assert_eq!(BlocksPayload::deserialize(&mut buf).unwrap(), payload);
    }
}
