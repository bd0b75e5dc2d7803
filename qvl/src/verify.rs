// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Cryptographic verification of parsed quotes.
//!
//! Verification runs the following checks, failing on the first error:
//!
//! 1. quote parsing
//! 2. PCK chain verification at the caller-supplied time
//! 3. QE report binding: SHA-256(attestation key || QE auth data) equals the
//!    first half of the QE report's report data, the second half is zero
//! 4. QE report signature under the PCK leaf key
//! 5. quote body signature under the attestation key
//! 6. the caller's TCB policy over the FMSPC from the PCK leaf

use p256::ecdsa::signature::Verifier as _;
use p256::ecdsa::{Signature, VerifyingKey};
use sha2::{Digest, Sha256};
use tracing::debug;
use x509_parser::prelude::{FromDer as _, X509Certificate};

use crate::oids::{parse_sgx_extension, SgxExtension, SgxExtensionError};
use crate::pck::{self, ChainOptions, ChainStatus, ChainVerdict, PckError};
use crate::quote::{Quote, QuoteError, Report};

/// Predicate deciding whether the TCB identified by an FMSPC is acceptable.
pub type TcbPolicyFn<'a> = &'a (dyn Fn(&str, &Quote) -> bool + Sync);

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("quote parse error: {0}")]
    Parse(#[from] QuoteError),
    #[error("quote carries no PCK chain and none was supplied")]
    MissingCertChain,
    #[error("PCK chain error: {0}")]
    Pck(#[from] PckError),
    #[error("PCK chain rejected: {0:?}")]
    ChainRejected(ChainStatus),
    #[error("PCK leaf SGX extension error: {0}")]
    SgxExtension(#[from] SgxExtensionError),
    #[error("QE report binding mismatch")]
    QeReportBindingMismatch,
    #[error("QE report signature verification failed")]
    BadQeReportSignature,
    #[error("quote body signature verification failed")]
    BadQuoteSignature,
    #[error("malformed key or signature: {0}")]
    BadKeyMaterial(&'static str),
    #[error("TCB policy rejected quote for FMSPC {0}")]
    TcbRejected(String),
}

/// Inputs to quote verification.
#[derive(Default)]
pub struct VerifyOptions<'a> {
    /// Evaluation time, seconds since the UNIX epoch.
    pub now: u64,
    /// SHA-256 fingerprints of trusted root certificates. Empty means the
    /// root is matched by subject identity.
    pub pinned_roots: &'a [[u8; 32]],
    /// DER-encoded CRLs covering the PCK leaf and intermediate.
    pub crls: &'a [Vec<u8>],
    /// Out-of-band PCK chain (PEM bundle) for quotes whose certification
    /// data does not embed one (cert data types 1 through 4).
    pub cert_chain: Option<&'a [u8]>,
    /// TCB policy hook. `None` accepts every TCB; the library never fetches
    /// TCB info itself.
    pub verify_tcb: Option<TcbPolicyFn<'a>>,
}

impl<'a> VerifyOptions<'a> {
    pub fn new(now: u64) -> Self {
        Self {
            now,
            ..Default::default()
        }
    }

    pub fn pinned_roots(mut self, pinned_roots: &'a [[u8; 32]]) -> Self {
        self.pinned_roots = pinned_roots;
        self
    }

    pub fn crls(mut self, crls: &'a [Vec<u8>]) -> Self {
        self.crls = crls;
        self
    }

    pub fn cert_chain(mut self, chain_pem: &'a [u8]) -> Self {
        self.cert_chain = Some(chain_pem);
        self
    }

    pub fn verify_tcb(mut self, hook: TcbPolicyFn<'a>) -> Self {
        self.verify_tcb = Some(hook);
        self
    }
}

/// A quote that passed all verification steps.
#[derive(Debug, Clone)]
pub struct VerifiedReport {
    /// The report body of the verified quote.
    pub report: Report,
    /// Hex-encoded FMSPC from the PCK leaf.
    pub fmspc: String,
    /// The SGX extension of the PCK leaf.
    pub sgx_extension: SgxExtension,
    /// The verified chain, leaf first (DER).
    pub chain: Vec<Vec<u8>>,
}

/// Parse and verify a binary quote.
pub fn verify_quote(
    raw_quote: &[u8],
    options: &VerifyOptions<'_>,
) -> Result<VerifiedReport, VerifyError> {
    let quote = Quote::parse(raw_quote)?;
    verify_parsed_quote(&quote, options)
}

/// Verify an already-parsed quote.
pub fn verify_parsed_quote(
    quote: &Quote,
    options: &VerifyOptions<'_>,
) -> Result<VerifiedReport, VerifyError> {
    let embedded_chain = quote.cert_chain_pem();
    let chain_pem = options
        .cert_chain
        .or(embedded_chain.as_deref())
        .ok_or(VerifyError::MissingCertChain)?;
    let certs = pck::split_pem_bundle(chain_pem)?;
    let verdict = pck::verify_chain(
        &certs,
        &ChainOptions {
            now: options.now,
            pinned_roots: options.pinned_roots,
            crls: options.crls,
        },
    )?;
    if verdict.status != ChainStatus::Valid {
        return Err(VerifyError::ChainRejected(verdict.status));
    }

    verify_qe_report_binding(quote)?;
    verify_qe_report_signature(quote, &verdict)?;
    verify_body_signature(quote)?;

    let sgx_extension = leaf_sgx_extension(&verdict)?;
    let fmspc = sgx_extension.fmspc_hex();
    debug!(%fmspc, "quote signature checks passed");

    if let Some(verify_tcb) = options.verify_tcb {
        if !verify_tcb(&fmspc, quote) {
            return Err(VerifyError::TcbRejected(fmspc));
        }
    }

    Ok(VerifiedReport {
        report: quote.report.clone(),
        fmspc,
        sgx_extension,
        chain: verdict.chain,
    })
}

/// Check that the attestation key is bound to the QE report:
/// SHA-256(attestation_pub || qe_auth_data) must equal the first 32 bytes of
/// the QE report's report data, and the remaining 32 bytes must be zero.
fn verify_qe_report_binding(quote: &Quote) -> Result<(), VerifyError> {
    let qe_report = quote.qe_report()?;
    let mut hasher = Sha256::new();
    hasher.update(quote.auth_data.ecdsa_attestation_key());
    hasher.update(quote.auth_data.qe_auth_data());
    let expected: [u8; 32] = hasher.finalize().into();
    if qe_report.report_data[..32] != expected || qe_report.report_data[32..] != [0u8; 32] {
        return Err(VerifyError::QeReportBindingMismatch);
    }
    Ok(())
}

/// Verify the QE report bytes against the PCK leaf public key. The
/// signature arrives in IEEE P1363 (r || s) form in the quote.
fn verify_qe_report_signature(quote: &Quote, verdict: &ChainVerdict) -> Result<(), VerifyError> {
    let (_, leaf) = X509Certificate::from_der(&verdict.chain[0])
        .map_err(|e| PckError::BadCertificate(e.to_string()))?;
    let leaf_key = VerifyingKey::from_sec1_bytes(&leaf.public_key().subject_public_key.data)
        .map_err(|_| VerifyError::BadKeyMaterial("PCK leaf public key"))?;
    let signature = Signature::from_slice(quote.auth_data.qe_report_signature())
        .map_err(|_| VerifyError::BadKeyMaterial("QE report signature"))?;
    leaf_key
        .verify(quote.auth_data.qe_report(), &signature)
        .map_err(|_| VerifyError::BadQeReportSignature)
}

/// Verify the quote body signature under the attestation public key.
fn verify_body_signature(quote: &Quote) -> Result<(), VerifyError> {
    let mut sec1 = [0u8; 65];
    sec1[0] = 0x04;
    sec1[1..].copy_from_slice(quote.auth_data.ecdsa_attestation_key());
    let attestation_key = VerifyingKey::from_sec1_bytes(&sec1)
        .map_err(|_| VerifyError::BadKeyMaterial("attestation public key"))?;
    let signature = Signature::from_slice(quote.auth_data.ecdsa_signature())
        .map_err(|_| VerifyError::BadKeyMaterial("quote signature"))?;
    attestation_key
        .verify(&quote.signed_message(), &signature)
        .map_err(|_| VerifyError::BadQuoteSignature)
}

fn leaf_sgx_extension(verdict: &ChainVerdict) -> Result<SgxExtension, VerifyError> {
    let (_, leaf) = X509Certificate::from_der(&verdict.chain[0])
        .map_err(|e| PckError::BadCertificate(e.to_string()))?;
    Ok(parse_sgx_extension(&leaf)?)
}
