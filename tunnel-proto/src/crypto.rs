// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Session crypto: the secretbox envelope and sealed-box key delivery.
//!
//! The envelope provides authenticated encryption only. Nonces are random
//! per message; the layer offers no replay protection, and none of the
//! tunnel semantics rely on it.

use crypto_secretbox::aead::{Aead, KeyInit, OsRng};
use crypto_secretbox::{Nonce, XSalsa20Poly1305};
use rand::RngCore as _;

use crate::wire::{decode_message, encode_message, Frame, Message, WireError};
use sodiumbox::{open_sealed_box, seal, PublicKey, StaticSecret};

/// Secretbox key length.
pub const SYMMETRIC_KEY_LEN: usize = 32;
/// Secretbox nonce length.
pub const NONCE_LEN: usize = 24;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("sealed box open failed")]
    SealedBox,
    #[error("envelope authentication failed")]
    Aead,
    #[error("bad nonce length: {0}")]
    BadNonce(usize),
    #[error("bad key length: {0}")]
    BadKeyLength(usize),
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Per-session symmetric envelope crypto.
pub struct SessionCrypto {
    cipher: XSalsa20Poly1305,
}

impl SessionCrypto {
    pub fn new(key: &[u8; SYMMETRIC_KEY_LEN]) -> Self {
        Self {
            cipher: XSalsa20Poly1305::new(key.into()),
        }
    }

    /// Generate a fresh random session key.
    pub fn generate_key() -> [u8; SYMMETRIC_KEY_LEN] {
        let mut key = [0u8; SYMMETRIC_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        key
    }

    /// Encrypt an inner message into an `enc` frame with a fresh nonce.
    pub fn seal(&self, message: &Message) -> Result<Frame, CryptoError> {
        let plaintext = encode_message(message)?;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| CryptoError::Aead)?;
        Ok(Frame::Enc {
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    /// Decrypt an `enc` frame back into an inner message.
    pub fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Message, CryptoError> {
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::BadNonce(nonce.len()));
        }
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Aead)?;
        Ok(decode_message(&plaintext)?)
    }
}

/// Seal the session key to the relay's X25519 public key.
pub fn seal_symmetric_key(
    key: &[u8; SYMMETRIC_KEY_LEN],
    server_public_key: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let server_public_key: [u8; 32] = server_public_key
        .try_into()
        .map_err(|_| CryptoError::BadKeyLength(server_public_key.len()))?;
    Ok(seal(key, &PublicKey::from(server_public_key)))
}

/// Open a sealed session key with the relay's X25519 key pair.
pub fn open_symmetric_key(
    sealed: &[u8],
    public_key: &PublicKey,
    secret_key: &StaticSecret,
) -> Result<[u8; SYMMETRIC_KEY_LEN], CryptoError> {
    let key = open_sealed_box(sealed, public_key, secret_key)
        .map_err(|_| CryptoError::SealedBox)?;
    key.try_into()
        .map_err(|_| CryptoError::SealedBox)
}
