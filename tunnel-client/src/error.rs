// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use tunnel_proto::{CryptoError, WireError};

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("quote verification failed: {0}")]
    QuoteVerification(#[from] qvl::VerifyError),
    #[error("attestation policy rejected the server: {0}")]
    PolicyRejected(String),
    #[error("request timed out")]
    RequestTimeout,
    #[error("tunnel disconnected")]
    Disconnected,
    #[error("application error: {0}")]
    Application(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Wire(#[from] WireError),
}
