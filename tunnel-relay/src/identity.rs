// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Relay key-exchange identity: an X25519 key pair plus the attestation
//! quote binding the public key to the enclave.

use anyhow::{Context, Result};
use tunnel_proto::{
    generate_keypair, kx_report_data, open_symmetric_key, CryptoError, PublicKey, StaticSecret,
    SYMMETRIC_KEY_LEN,
};

/// Source of attestation quotes over a 64-byte report data.
pub trait QuoteSource: Send + Sync + 'static {
    fn quote(&self, report_data: &[u8; 64]) -> Result<Vec<u8>>;
}

/// Quotes produced by the TDX guest kernel interface.
pub struct TdxQuoteSource;

impl QuoteSource for TdxQuoteSource {
    fn quote(&self, report_data: &[u8; 64]) -> Result<Vec<u8>> {
        tdx_guest::get_quote(report_data).context("failed to get TDX quote")
    }
}

/// A fixed quote, for development relays outside a TD.
pub struct StaticQuoteSource(pub Vec<u8>);

impl QuoteSource for StaticQuoteSource {
    fn quote(&self, _report_data: &[u8; 64]) -> Result<Vec<u8>> {
        Ok(self.0.clone())
    }
}

pub struct RelayIdentity {
    public_key: PublicKey,
    secret_key: StaticSecret,
    pub quote: Vec<u8>,
}

impl RelayIdentity {
    /// Generate a fresh X25519 key pair and quote over its binding.
    pub fn generate(source: &dyn QuoteSource) -> Result<Self> {
        let (public_key, secret_key) = generate_keypair();
        let report_data = kx_report_data(public_key.as_bytes());
        let quote = source
            .quote(&report_data)
            .context("failed to quote key-exchange identity")?;
        Ok(Self {
            public_key,
            secret_key,
            quote,
        })
    }

    pub fn public_key_bytes(&self) -> &[u8; 32] {
        self.public_key.as_bytes()
    }

    pub(crate) fn open_sealed_key(
        &self,
        sealed: &[u8],
    ) -> Result<[u8; SYMMETRIC_KEY_LEN], CryptoError> {
        open_symmetric_key(sealed, &self.public_key, &self.secret_key)
    }
}
