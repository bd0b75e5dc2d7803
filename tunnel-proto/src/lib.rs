// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Wire protocol for the attested tunnel.
//!
//! The tunnel runs over a single WebSocket. Control frames ([`Frame`]) are
//! CBOR-encoded on both legs. After the key exchange every inner message
//! ([`Message`]) travels inside an XSalsa20-Poly1305 envelope with a fresh
//! random 24-byte nonce. The symmetric key is delivered from the client to
//! the relay in an X25519 sealed box, and the relay's X25519 public key is
//! bound into the attestation quote's report data so the client knows the
//! key exchange terminates inside the attested TEE.

mod crypto;
mod kx;
mod wire;

pub use crypto::{
    open_symmetric_key, seal_symmetric_key, CryptoError, SessionCrypto, NONCE_LEN,
    SYMMETRIC_KEY_LEN,
};
pub use kx::kx_report_data;
pub use wire::{
    decode_frame, encode_frame, Frame, HttpRequest, HttpResponse, Message, WireError, WsData,
    WsEventType, RELAY_PATH,
};

pub use sodiumbox::{generate_keypair, PublicKey, StaticSecret, PUBLICKEYBYTES};
