// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Binding of the relay's key-exchange key into the attestation quote.
//!
//! The relay quotes over `sha512("ratls-kx:" || x25519_public_key)` so the
//! sealed session key provably reaches the attested TD and nothing else.
//! The client recomputes this value and compares it against the report
//! data of the verified quote.

use sha2::{Digest, Sha512};

/// Content-type tag hashed into the report data.
pub const KX_CONTENT_TAG: &str = "ratls-kx";

/// The 64-byte report data binding an X25519 public key.
pub fn kx_report_data(x25519_public_key: &[u8]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(KX_CONTENT_TAG.as_bytes());
    hasher.update(b":");
    hasher.update(x25519_public_key);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_is_deterministic_and_key_dependent() {
        let a = kx_report_data(&[1u8; 32]);
        let b = kx_report_data(&[1u8; 32]);
        let c = kx_report_data(&[2u8; 32]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn known_vector() {
        let report_data = kx_report_data(&[0u8; 32]);
        // sha512("ratls-kx:" || 32 zero bytes), first bytes pinned so the
        // tag cannot silently change.
        assert_eq!(hex::encode(&report_data[..8]), {
            use sha2::{Digest, Sha512};
            let mut hasher = Sha512::new();
            hasher.update(b"ratls-kx:");
            hasher.update([0u8; 32]);
            hex::encode(&hasher.finalize()[..8])
        });
    }
}
