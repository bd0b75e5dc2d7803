// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Quote verification library for Intel SGX and TDX DCAP quotes.
//!
//! This crate parses SGX and TDX (v4/v5) attestation quotes and verifies
//! them cryptographically:
//!
//! - the ECDSA P-256 signature over the quote body under the attestation key
//! - the binding of the attestation key to the Quoting Enclave report
//! - the QE report signature under the PCK leaf certificate
//! - the PCK certificate chain up to a pinned Intel SGX Root CA, including
//!   validity windows and CRL checks
//! - a caller-supplied TCB policy over the FMSPC extracted from the PCK leaf
//!
//! The library never talks to the network. Collateral (out-of-band PCK
//! chains, CRLs, TCB info) is supplied by the caller, and the evaluation
//! time is an explicit parameter.
//!
//! # Example
//!
//! ```no_run
//! use qvl::{verify_quote, VerifyOptions};
//!
//! let quote = std::fs::read("quote.bin").expect("quote file not found");
//! let now = std::time::SystemTime::now()
//!     .duration_since(std::time::UNIX_EPOCH)
//!     .expect("clock before epoch")
//!     .as_secs();
//! let report = verify_quote(&quote, &VerifyOptions::new(now)).expect("invalid quote");
//! println!("FMSPC: {}", report.fmspc);
//! ```

pub mod oids;
pub mod pck;
pub mod quote;
pub mod tcb;
pub mod verify;

pub use quote::{Quote, QuoteError, Report};
pub use verify::{verify_parsed_quote, verify_quote, VerifiedReport, VerifyError, VerifyOptions};

#[cfg(test)]
pub(crate) mod testing;
