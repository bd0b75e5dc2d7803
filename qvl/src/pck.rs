// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! PCK certificate chain verification.
//!
//! A quote's certification data carries a three-certificate chain: the PCK
//! leaf, the Intel SGX PCK Platform/Processor CA and the Intel SGX Root CA.
//! The chain is normalized by issuer DN matching, checked for validity at a
//! caller-supplied time, signature-verified link by link, pinned against a
//! trusted root and checked against caller-supplied CRLs.

use sha2::{Digest, Sha256};
use x509_parser::prelude::*;

/// Subject CN of the Intel SGX root certificate.
pub const INTEL_SGX_ROOT_CA_CN: &str = "Intel SGX Root CA";

const PCK_LEAF_CN: &str = "SGX PCK Certificate";
const PCK_PLATFORM_CA_CN: &str = "SGX PCK Platform CA";
const PCK_PROCESSOR_CA_CN: &str = "SGX PCK Processor CA";
const SGX_ROOT_CA_CN: &str = "SGX Root CA";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PckError {
    #[error("failed to parse PEM bundle: {0}")]
    Pem(String),
    #[error("failed to parse certificate: {0}")]
    BadCertificate(String),
    #[error("expected a 3-certificate chain, got {0}")]
    WrongCertCount(usize),
    #[error("certificate chain does not link")]
    BrokenChain,
    #[error("failed to parse CRL: {0}")]
    BadCrl(String),
}

/// Outcome of chain verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Valid,
    Expired,
    UntrustedRoot,
    Revoked,
    BadSignature,
}

/// Verification result: the status plus the chain in leaf, intermediate,
/// root order (DER).
#[derive(Debug, Clone)]
pub struct ChainVerdict {
    pub status: ChainStatus,
    pub chain: Vec<Vec<u8>>,
}

/// Inputs to chain verification.
#[derive(Debug, Clone, Default)]
pub struct ChainOptions<'a> {
    /// Evaluation time, seconds since the UNIX epoch.
    pub now: u64,
    /// SHA-256 fingerprints of trusted root certificates (DER). When empty,
    /// the root is matched by subject identity plus self-signature instead.
    pub pinned_roots: &'a [[u8; 32]],
    /// DER-encoded CRLs to consult for the leaf and intermediate serials.
    pub crls: &'a [Vec<u8>],
}

/// Split a concatenated PEM bundle into DER certificates.
pub fn split_pem_bundle(bundle: &[u8]) -> Result<Vec<Vec<u8>>, PckError> {
    let pems = ::pem::parse_many(bundle).map_err(|e| PckError::Pem(e.to_string()))?;
    Ok(pems
        .into_iter()
        .filter(|p| p.tag() == "CERTIFICATE")
        .map(|p| p.into_contents())
        .collect())
}

/// Verify a PCK chain at time `options.now`.
///
/// The input certificates may arrive in any order; they are normalized into
/// leaf, intermediate and root before checking.
pub fn verify_chain(
    certs_der: &[Vec<u8>],
    options: &ChainOptions<'_>,
) -> Result<ChainVerdict, PckError> {
    if certs_der.len() != 3 {
        return Err(PckError::WrongCertCount(certs_der.len()));
    }
    let parsed: Vec<X509Certificate<'_>> = certs_der
        .iter()
        .map(|der| {
            X509Certificate::from_der(der)
                .map(|(_, cert)| cert)
                .map_err(|e| PckError::BadCertificate(e.to_string()))
        })
        .collect::<Result<_, _>>()?;

    let [leaf_idx, intermediate_idx, root_idx] = normalize(&parsed)?;
    let leaf = &parsed[leaf_idx];
    let intermediate = &parsed[intermediate_idx];
    let root = &parsed[root_idx];
    let chain = vec![
        certs_der[leaf_idx].clone(),
        certs_der[intermediate_idx].clone(),
        certs_der[root_idx].clone(),
    ];

    let verdict = |status| {
        Ok(ChainVerdict {
            status,
            chain: chain.clone(),
        })
    };

    let now = options.now as i64;
    for cert in [leaf, intermediate, root] {
        let validity = cert.validity();
        if now < validity.not_before.timestamp() || now > validity.not_after.timestamp() {
            return verdict(ChainStatus::Expired);
        }
    }

    let signatures_ok = leaf
        .verify_signature(Some(intermediate.public_key()))
        .and_then(|_| intermediate.verify_signature(Some(root.public_key())))
        .and_then(|_| root.verify_signature(None))
        .is_ok();
    if !signatures_ok {
        return verdict(ChainStatus::BadSignature);
    }

    if !root_is_trusted(root, &certs_der[root_idx], options.pinned_roots) {
        return verdict(ChainStatus::UntrustedRoot);
    }

    for crl_der in options.crls {
        let (_, crl) = CertificateRevocationList::from_der(crl_der)
            .map_err(|e| PckError::BadCrl(e.to_string()))?;
        for revoked in crl.iter_revoked_certificates() {
            let serial = &revoked.user_certificate;
            if serial == &leaf.tbs_certificate.serial
                || serial == &intermediate.tbs_certificate.serial
            {
                return verdict(ChainStatus::Revoked);
            }
        }
    }

    verdict(ChainStatus::Valid)
}

/// Order the chain as [leaf, intermediate, root].
///
/// Subject CNs decide first: the leaf CN contains "SGX PCK Certificate",
/// the intermediate "SGX PCK Platform/Processor CA", the root "SGX Root
/// CA". Only when the CNs do not yield a clean one-to-one assignment does
/// issuer-DN matching order the chain instead. Either way, the signature
/// checks afterwards are what establish the links cryptographically.
fn normalize(certs: &[X509Certificate<'_>]) -> Result<[usize; 3], PckError> {
    if let Some(order) = normalize_by_cn(certs) {
        return Ok(order);
    }
    normalize_by_issuer(certs)
}

fn common_name<'a>(cert: &'a X509Certificate<'_>) -> Option<&'a str> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
}

/// Assign roles by subject CN. `None` unless every certificate maps to
/// exactly one distinct role.
fn normalize_by_cn(certs: &[X509Certificate<'_>]) -> Option<[usize; 3]> {
    let mut leaf = None;
    let mut intermediate = None;
    let mut root = None;
    for (index, cert) in certs.iter().enumerate() {
        let cn = common_name(cert)?;
        let slot = if cn.contains(PCK_LEAF_CN) {
            &mut leaf
        } else if cn.contains(PCK_PLATFORM_CA_CN) || cn.contains(PCK_PROCESSOR_CA_CN) {
            &mut intermediate
        } else if cn.contains(SGX_ROOT_CA_CN) {
            &mut root
        } else {
            return None;
        };
        if slot.replace(index).is_some() {
            // Two certificates claim the same role.
            return None;
        }
    }
    Some([leaf?, intermediate?, root?])
}

/// Fallback ordering for chains with non-Intel subject names: the root is
/// the self-issued certificate, the leaf is the one whose subject issues
/// nothing else.
fn normalize_by_issuer(certs: &[X509Certificate<'_>]) -> Result<[usize; 3], PckError> {
    let root_idx = certs
        .iter()
        .position(|c| c.subject().as_raw() == c.issuer().as_raw())
        .ok_or(PckError::BrokenChain)?;
    let leaf_idx = certs
        .iter()
        .enumerate()
        .position(|(i, candidate)| {
            certs
                .iter()
                .enumerate()
                .all(|(j, other)| i == j || other.issuer().as_raw() != candidate.subject().as_raw())
        })
        .ok_or(PckError::BrokenChain)?;
    if leaf_idx == root_idx {
        return Err(PckError::BrokenChain);
    }
    let intermediate_idx = (0..3)
        .find(|&i| i != leaf_idx && i != root_idx)
        .ok_or(PckError::BrokenChain)?;

    let leaf = &certs[leaf_idx];
    let intermediate = &certs[intermediate_idx];
    let root = &certs[root_idx];
    if leaf.issuer().as_raw() != intermediate.subject().as_raw()
        || intermediate.issuer().as_raw() != root.subject().as_raw()
    {
        return Err(PckError::BrokenChain);
    }
    Ok([leaf_idx, intermediate_idx, root_idx])
}

fn root_is_trusted(
    root: &X509Certificate<'_>,
    root_der: &[u8],
    pinned_roots: &[[u8; 32]],
) -> bool {
    if !pinned_roots.is_empty() {
        let fingerprint: [u8; 32] = Sha256::digest(root_der).into();
        return pinned_roots.contains(&fingerprint);
    }
    // No explicit pins: fall back to subject identity. The self-signature
    // was already checked above.
    root.subject()
        .iter_common_name()
        .filter_map(|cn| cn.as_str().ok())
        .any(|cn| cn == INTEL_SGX_ROOT_CA_CN)
}
