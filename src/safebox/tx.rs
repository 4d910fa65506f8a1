#![forbid(unsafe_code)]

//! Ledger operations: tagged variants, signing digests and wire codec.
//! The signing digest covers every field except the signature itself,
//! bound to the source account's current public key at validation time.

use thiserror::Error;

use crate::core::{sha256, Hash32};
use crate::crypto::{self, Keypair, PublicKey};
use crate::wire::{self, WireError};

pub const TAG_TRANSFER: u8 = 1;
pub const TAG_CHANGE_KEY: u8 = 2;

/// Semantic rejection reasons for a single operation.
#[derive(Debug, Error)]
pub enum OpError {
    #[error("source account {0} does not exist")]
    UnknownSource(u32),
    #[error("destination account {0} does not exist")]
    UnknownDestination(u32),
    #[error("signature does not match source account key")]
    WrongSignature,
    #[error("account {account}: expected operation id {expected}, got {got}")]
    BadOperationId { account: u32, expected: u32, got: u32 },
    #[error("account {account} is immature: updated at block {updated_block}, height {height}")]
    Immature {
        account: u32,
        updated_block: u32,
        height: u32,
    },
    #[error("account {0} balance is insufficient")]
    InsufficientBalance(u32),
    #[error("account {0} cannot transfer to itself")]
    SelfTransfer(u32),
    #[error("amount arithmetic overflow")]
    AmountOverflow,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Transfer {
        source: u32,
        op_id: u32,
        destination: u32,
        amount: u64,
        fee: u64,
        payload: Vec<u8>,
        signature: Vec<u8>,
    },
    ChangeKey {
        source: u32,
        op_id: u32,
        fee: u64,
        payload: Vec<u8>,
        new_public_key: PublicKey,
        signature: Vec<u8>,
    },
}

impl Operation {
    pub fn source(&self) -> u32 {
        match self {
            Operation::Transfer { source, .. } | Operation::ChangeKey { source, .. } => *source,
        }
    }

    pub fn op_id(&self) -> u32 {
        match self {
            Operation::Transfer { op_id, .. } | Operation::ChangeKey { op_id, .. } => *op_id,
        }
    }

    pub fn fee(&self) -> u64 {
        match self {
            Operation::Transfer { fee, .. } | Operation::ChangeKey { fee, .. } => *fee,
        }
    }

    pub fn signature(&self) -> &[u8] {
        match self {
            Operation::Transfer { signature, .. } | Operation::ChangeKey { signature, .. } => {
                signature
            }
        }
    }

    fn serialize_body(&self, out: &mut Vec<u8>) {
        match self {
            Operation::Transfer {
                source,
                op_id,
                destination,
                amount,
                fee,
                payload,
                ..
            } => {
                wire::write_u8(out, TAG_TRANSFER);
                wire::write_u32(out, *source);
                wire::write_u32(out, *op_id);
                wire::write_u32(out, *destination);
                wire::write_u64(out, *amount);
                wire::write_u64(out, *fee);
                wire::write_bytes(out, payload);
            }
            Operation::ChangeKey {
                source,
                op_id,
                fee,
                payload,
                new_public_key,
                ..
            } => {
                wire::write_u8(out, TAG_CHANGE_KEY);
                wire::write_u32(out, *source);
                wire::write_u32(out, *op_id);
                wire::write_u64(out, *fee);
                wire::write_bytes(out, payload);
                wire::write_bytes(out, &crypto::serialize_public(new_public_key));
            }
        }
    }

    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        self.serialize_body(out);
        wire::write_bytes(out, self.signature());
    }

    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, WireError> {
        let tag = wire::read_u8(buf)?;
        match tag {
            TAG_TRANSFER => {
                let source = wire::read_u32(buf)?;
                let op_id = wire::read_u32(buf)?;
                let destination = wire::read_u32(buf)?;
                let amount = wire::read_u64(buf)?;
                let fee = wire::read_u64(buf)?;
                let payload = wire::read_bytes(buf)?;
                let signature = wire::read_bytes(buf)?;
                Ok(Operation::Transfer {
                    source,
                    op_id,
                    destination,
                    amount,
                    fee,
                    payload,
                    signature,
                })
            }
            TAG_CHANGE_KEY => {
                let source = wire::read_u32(buf)?;
                let op_id = wire::read_u32(buf)?;
                let fee = wire::read_u64(buf)?;
                let payload = wire::read_bytes(buf)?;
                let new_public_key = crypto::parse_public(&wire::read_bytes(buf)?)?;
                let signature = wire::read_bytes(buf)?;
                Ok(Operation::ChangeKey {
                    source,
                    op_id,
                    fee,
                    payload,
                    new_public_key,
                    signature,
                })
            }
            other => Err(WireError::UnknownTag(other)),
        }
    }

    /// Digest signed by the source account; excludes the signature field.
    pub fn signing_digest(&self) -> Hash32 {
        let mut bytes = Vec::new();
        self.serialize_body(&mut bytes);
        sha256(&bytes)
    }

    /// Digest over the complete wire form; the mempool key.
    pub fn digest(&self) -> Hash32 {
        let mut bytes = Vec::new();
        self.serialize_into(&mut bytes);
        sha256(&bytes)
    }

    pub fn sign(&mut self, key: &Keypair) {
        let digest = self.signing_digest();
        let sig = key.sign(&digest).to_vec();
        match self {
            Operation::Transfer { signature, .. } | Operation::ChangeKey { signature, .. } => {
                *signature = sig
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_transfer(key: &Keypair) -> Operation {
        let mut op = Operation::Transfer {
            source: 0,
            op_id: 1,
            destination: 2,
            amount: 3,
            fee: 4,
            payload: b"hello".to_vec(),
            signature: Vec::new(),
        };
        op.sign(key);
        op
    }

    #[test]
    fn transfer_round_trip() {
        let key = Keypair::generate();
        let op = sample_transfer(&key);
        let mut bytes = Vec::new();
        op.serialize_into(&mut bytes);
        let mut buf = bytes.as_slice();
        let decoded = Operation::deserialize(&mut buf).unwrap();
        assert!(buf.is_empty());
        assert_eq!(decoded, op);
    }

    #[test]
    fn change_key_round_trip() {
        let key = Keypair::generate();
        let next = Keypair::generate();
        let mut op = Operation::ChangeKey {
            source: 7,
            op_id: 3,
            fee: 2,
            payload: Vec::new(),
            new_public_key: next.public,
            signature: Vec::new(),
        };
        op.sign(&key);
        let mut bytes = Vec::new();
        op.serialize_into(&mut bytes);
        let mut buf = bytes.as_slice();
        assert_eq!(Operation::deserialize(&mut buf).unwrap(), op);
    }

    #[test]
    fn signing_digest_excludes_signature() {
        let key = Keypair::generate();
        let mut op = sample_transfer(&key);
        let before = op.signing_digest();
        op.sign(&Keypair::generate());
        assert_eq!(op.signing_digest(), before);
        assert!(crypto::verify(&key.public, &before, op.signature()).is_err());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut buf: &[u8] = &[9, 0, 0, 0, 0];
        assert!(matches!(
            Operation::deserialize(&mut buf),
            Err(WireError::UnknownTag(9))
        ));
    }
}
