#![forbid(unsafe_code)]

//! Elliptic-curve seam for the ledger: keypairs, signing and verification
//! over secp256k1. Consensus code treats keys as opaque points; the only
//! encoding that leaves this module is the 33-byte compressed SEC form.

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, Secp256k1, SecretKey};
use thiserror::Error;

use crate::core::Hash32;
use crate::wire::WireError;

pub use secp256k1::PublicKey;

pub const PUBLIC_KEY_LEN: usize = 33;
pub const SIGNATURE_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("malformed signature encoding")]
    MalformedSignature,
    #[error("malformed digest")]
    MalformedDigest,
}

#[derive(Clone)]
pub struct Keypair {
    secret: SecretKey,
    pub public: PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret, public) = secp.generate_keypair(&mut rand::thread_rng());
        Keypair { secret, public }
    }

    /// Compact 64-byte r||s signature over a 32-byte digest.
    pub fn sign(&self, digest: &Hash32) -> [u8; SIGNATURE_LEN] {
        let secp = Secp256k1::new();
        let msg = Message::from_digest_slice(digest).expect("digest is 32 bytes");
        secp.sign_ecdsa(&msg, &self.secret).serialize_compact()
    }
}

pub fn verify(public: &PublicKey, digest: &Hash32, signature: &[u8]) -> Result<(), CryptoError> {
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest_slice(digest).map_err(|_| CryptoError::MalformedDigest)?;
    let sig = Signature::from_compact(signature).map_err(|_| CryptoError::MalformedSignature)?;
    secp.verify_ecdsa(&msg, &sig, public)
        .map_err(|_| CryptoError::InvalidSignature)
}

pub fn serialize_public(public: &PublicKey) -> [u8; PUBLIC_KEY_LEN] {
    public.serialize()
}

pub fn parse_public(bytes: &[u8]) -> Result<PublicKey, WireError> {
    PublicKey::from_slice(bytes).map_err(|_| WireError::InvalidPoint)
}
