// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Traffic-key envelope crypto.
//!
//! Controller payloads are sealed to the host's traffic public key. An
//! envelope is a random 24-byte nonce followed by an XChaCha20-Poly1305
//! ciphertext; the cipher key is derived from an X25519 agreement between
//! the host's traffic private key and the server's traffic public key.

use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

/// Smallest valid envelope: the nonce plus at least one payload byte.
pub const MIN_ENVELOPE_LEN: usize = 25;

const NONCE_LEN: usize = 24;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("envelope too short: {0} bytes")]
    TooShort(usize),

    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("payload failed to decrypt")]
    Decrypt,

    #[error("payload failed to encrypt")]
    Encrypt,
}

/// Generate a WireGuard keypair as base64 strings.
pub fn generate_wg_keypair() -> (String, String) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    let engine = base64::engine::general_purpose::STANDARD;
    (
        engine.encode(secret.to_bytes()),
        engine.encode(public.to_bytes()),
    )
}

/// Generate a traffic keypair as raw 32-byte halves.
pub fn generate_traffic_keypair() -> (Vec<u8>, Vec<u8>) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret.to_bytes().to_vec(), public.to_bytes().to_vec())
}

fn cipher(our_private: &[u8], their_public: &[u8]) -> Result<XChaCha20Poly1305, CryptoError> {
    let private: [u8; 32] = our_private
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength(our_private.len()))?;
    let public: [u8; 32] = their_public
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength(their_public.len()))?;

    let shared = StaticSecret::from(private).diffie_hellman(&PublicKey::from(public));
    let key = Sha256::digest(shared.as_bytes());
    Ok(XChaCha20Poly1305::new(&key))
}

/// Seal `plaintext` for the holder of `their_public`.
pub fn seal(
    plaintext: &[u8],
    our_private: &[u8],
    their_public: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = cipher(our_private, their_public)?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&ciphertext);
    Ok(envelope)
}

/// Open an envelope sealed to us. Chunked payloads must be concatenated in
/// arrival order before calling.
pub fn open(
    envelope: &[u8],
    our_private: &[u8],
    their_public: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if envelope.len() < MIN_ENVELOPE_LEN {
        return Err(CryptoError::TooShort(envelope.len()));
    }
    let cipher = cipher(our_private, their_public)?;
    let (nonce, ciphertext) = envelope.split_at(NONCE_LEN);
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

/// Decode a base64 WireGuard key into its raw 32 bytes.
pub fn decode_key(b64: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map_err(|_| CryptoError::InvalidKeyLength(0))?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength(len))
}

/// Derive the base64 public key for a base64 private key.
pub fn derive_public_key(private_b64: &str) -> Result<String, CryptoError> {
    let private = decode_key(private_b64)?;
    let public = PublicKey::from(&StaticSecret::from(private));
    Ok(base64::engine::general_purpose::STANDARD.encode(public.to_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_both_directions() {
        let (host_priv, host_pub) = generate_traffic_keypair();
        let (server_priv, server_pub) = generate_traffic_keypair();

        let sealed = seal(b"peer update", &server_priv, &host_pub).unwrap();
        let opened = open(&sealed, &host_priv, &server_pub).unwrap();
        assert_eq!(opened, b"peer update");
    }

    #[test]
    fn short_envelope_is_rejected() {
        let (host_priv, _) = generate_traffic_keypair();
        let (_, server_pub) = generate_traffic_keypair();
        let err = open(&[0u8; 24], &host_priv, &server_pub).unwrap_err();
        assert!(matches!(err, CryptoError::TooShort(24)));
    }

    #[test]
    fn tampered_envelope_fails_to_open() {
        let (host_priv, host_pub) = generate_traffic_keypair();
        let (server_priv, server_pub) = generate_traffic_keypair();

        let mut sealed = seal(b"payload", &server_priv, &host_pub).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(matches!(
            open(&sealed, &host_priv, &server_pub),
            Err(CryptoError::Decrypt)
        ));
    }

    #[test]
    fn wg_keypair_is_base64_32_bytes() {
        let (private_b64, public_b64) = generate_wg_keypair();
        assert_eq!(decode_key(&private_b64).unwrap().len(), 32);
        assert_eq!(decode_key(&public_b64).unwrap().len(), 32);
        assert_eq!(derive_public_key(&private_b64).unwrap(), public_b64);
    }
}
