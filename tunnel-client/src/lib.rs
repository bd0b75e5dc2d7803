// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Peer side of the attested tunnel.
//!
//! [`Tunnel::connect`] dials the relay's `/__ra__` endpoint, verifies the
//! attestation quote presented in `server_kx` against the caller's
//! [`TunnelPolicy`], seals a fresh session key to the attested X25519 key
//! and then multiplexes [`Tunnel::fetch`] requests and
//! [`Tunnel::open_websocket`] sub-connections over the encrypted channel.
//!
//! A lost control socket fails every pending waiter with
//! [`TunnelError::Disconnected`], then reconnects after about a second
//! with a fresh handshake and a fresh key.

mod error;
mod policy;
mod tunnel;
mod ws;

pub use error::TunnelError;
pub use policy::TunnelPolicy;
pub use tunnel::{FetchRequest, FetchResponse, Tunnel, REQUEST_TIMEOUT};
pub use ws::{VirtualWebSocket, WsIncoming, WsState};

pub use tunnel_proto::WsData;
