// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Attestation policy applied during the handshake.
//!
//! The measurement predicate (`match_quote`) and the TCB predicate
//! (`verify_tcb`) are user-supplied; the library supplies the
//! cryptographic verification around them.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use qvl::Quote;

pub type MatchQuoteFn = Arc<dyn Fn(&Quote) -> bool + Send + Sync>;
pub type VerifyTcbFn = Arc<dyn Fn(&str, &Quote) -> bool + Send + Sync>;

/// Policy for accepting a relay's attestation evidence.
#[derive(Clone)]
pub struct TunnelPolicy {
    /// Measurement predicate over the parsed quote (mr_td, rtmrs,
    /// mr_enclave, ...). Required for verifying policies.
    pub match_quote: Option<MatchQuoteFn>,
    /// TCB predicate over the FMSPC and quote. Absent accepts every TCB.
    pub verify_tcb: Option<VerifyTcbFn>,
    /// SHA-256 pins of trusted root certificates. Empty pins fall back to
    /// root subject identity.
    pub pinned_roots: Vec<[u8; 32]>,
    /// DER CRLs consulted during chain verification.
    pub crls: Vec<Vec<u8>>,
    /// Fixed evaluation time (UNIX seconds); `None` uses the wall clock.
    pub now: Option<u64>,
    /// Development mode: skip quote verification entirely.
    pub dev: bool,
}

impl TunnelPolicy {
    /// A verifying policy with the given measurement predicate.
    pub fn new(match_quote: impl Fn(&Quote) -> bool + Send + Sync + 'static) -> Self {
        Self {
            match_quote: Some(Arc::new(match_quote)),
            verify_tcb: None,
            pinned_roots: vec![],
            crls: vec![],
            now: None,
            dev: false,
        }
    }

    /// Development policy: accepts any server without verifying the quote.
    /// Never use this against a production relay.
    pub fn dev() -> Self {
        Self {
            match_quote: None,
            verify_tcb: None,
            pinned_roots: vec![],
            crls: vec![],
            now: None,
            dev: true,
        }
    }

    pub fn with_verify_tcb(
        mut self,
        verify_tcb: impl Fn(&str, &Quote) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.verify_tcb = Some(Arc::new(verify_tcb));
        self
    }

    pub fn with_pinned_roots(mut self, pinned_roots: Vec<[u8; 32]>) -> Self {
        self.pinned_roots = pinned_roots;
        self
    }

    pub fn with_crls(mut self, crls: Vec<Vec<u8>>) -> Self {
        self.crls = crls;
        self
    }

    pub fn with_time(mut self, now: u64) -> Self {
        self.now = Some(now);
        self
    }

    pub(crate) fn evaluation_time(&self) -> u64 {
        self.now.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        })
    }
}
