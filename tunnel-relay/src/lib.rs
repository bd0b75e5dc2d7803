// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Relay side of the attested tunnel.
//!
//! The relay accepts WebSocket upgrades at `/__ra__` only. Each control
//! socket gets its own session task: it sends `server_kx` with the relay's
//! X25519 key and attestation quote, waits for the client to seal a session
//! key back, then decrypts one envelope at a time and routes inner messages
//! to the host application: HTTP requests onto [`HostApp::handle_http`],
//! virtual WebSocket sub-connections onto [`HostApp::accept_ws`].
//!
//! State for one socket is isolated from every other socket.

mod http;
mod identity;
mod relay;
mod session;
mod ws;

pub use http::{HostApp, Request, Response};
pub use identity::{QuoteSource, RelayIdentity, StaticQuoteSource, TdxQuoteSource};
pub use relay::{Relay, RelayConfig};
pub use ws::{VirtualSocket, WsConnect, WsIncoming};
