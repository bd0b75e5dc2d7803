// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! The Intel SGX PCK certificate extension (OID `1.2.840.113741.1.13.1`).
//!
//! The extension is an ASN.1 sequence of `(oid, value)` pairs. The members
//! relevant to verification are the TCB sub-sequence (component SVNs,
//! PCESVN, CPUSVN), the PCEID and the FMSPC.

use x509_parser::oid_registry::asn1_rs::{oid, FromDer, Integer, OctetString, Oid, Sequence};
use x509_parser::prelude::X509Certificate;

/// Child OID suffixes under `1.2.840.113741.1.13.1`.
const SGX_EXT_TCB: &str = "1.2.840.113741.1.13.1.2";
const SGX_EXT_PCEID: &str = "1.2.840.113741.1.13.1.3";
const SGX_EXT_FMSPC: &str = "1.2.840.113741.1.13.1.4";

const TCB_COMPONENT_PREFIX: &str = "1.2.840.113741.1.13.1.2.";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SgxExtensionError {
    #[error("certificate carries no SGX extension")]
    Missing,
    #[error("malformed SGX extension: {0}")]
    Malformed(&'static str),
}

/// The SGX extension OID, `1.2.840.113741.1.13.1`.
pub fn sgx_extension_oid() -> Oid<'static> {
    oid!(1.2.840 .113741 .1 .13 .1)
}

/// Fields extracted from a PCK leaf certificate's SGX extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SgxExtension {
    /// Family-Model-Stepping-Platform-CustomSKU, 6 bytes.
    pub fmspc: [u8; 6],
    /// Platform CE identifier, 2 bytes.
    pub pceid: [u8; 2],
    /// TCB component SVNs 1 through 16.
    pub tcb_components: [u8; 16],
    /// PCESVN from the TCB sequence.
    pub pcesvn: u16,
    /// CPUSVN from the TCB sequence.
    pub cpusvn: [u8; 16],
}

impl SgxExtension {
    pub fn fmspc_hex(&self) -> String {
        hex::encode(self.fmspc)
    }
}

/// Extract and parse the SGX extension from a PCK certificate.
pub fn parse_sgx_extension(
    cert: &X509Certificate<'_>,
) -> Result<SgxExtension, SgxExtensionError> {
    let extension = cert
        .get_extension_unique(&sgx_extension_oid())
        .map_err(|_| SgxExtensionError::Malformed("duplicate extension"))?
        .ok_or(SgxExtensionError::Missing)?;

    let (_, outer) = Sequence::from_der(extension.value)
        .map_err(|_| SgxExtensionError::Malformed("outer sequence"))?;

    let mut fmspc = None;
    let mut pceid = None;
    let mut tcb_components = [0u8; 16];
    let mut pcesvn = 0u16;
    let mut cpusvn = [0u8; 16];
    let mut have_tcb = false;

    let mut rest = outer.content.as_ref();
    while !rest.is_empty() {
        let (next, member) = Sequence::from_der(rest)
            .map_err(|_| SgxExtensionError::Malformed("member sequence"))?;
        rest = next;
        let (value, member_oid) = Oid::from_der(member.content.as_ref())
            .map_err(|_| SgxExtensionError::Malformed("member oid"))?;
        match member_oid.to_id_string().as_str() {
            SGX_EXT_FMSPC => {
                let (_, octets) = OctetString::from_der(value)
                    .map_err(|_| SgxExtensionError::Malformed("fmspc"))?;
                fmspc = Some(
                    <[u8; 6]>::try_from(octets.as_ref())
                        .map_err(|_| SgxExtensionError::Malformed("fmspc length"))?,
                );
            }
            SGX_EXT_PCEID => {
                let (_, octets) = OctetString::from_der(value)
                    .map_err(|_| SgxExtensionError::Malformed("pceid"))?;
                pceid = Some(
                    <[u8; 2]>::try_from(octets.as_ref())
                        .map_err(|_| SgxExtensionError::Malformed("pceid length"))?,
                );
            }
            SGX_EXT_TCB => {
                parse_tcb_sequence(value, &mut tcb_components, &mut pcesvn, &mut cpusvn)?;
                have_tcb = true;
            }
            _ => continue,
        }
    }

    if !have_tcb {
        return Err(SgxExtensionError::Malformed("missing tcb sequence"));
    }
    Ok(SgxExtension {
        fmspc: fmspc.ok_or(SgxExtensionError::Malformed("missing fmspc"))?,
        pceid: pceid.ok_or(SgxExtensionError::Malformed("missing pceid"))?,
        tcb_components,
        pcesvn,
        cpusvn,
    })
}

fn parse_tcb_sequence(
    value: &[u8],
    tcb_components: &mut [u8; 16],
    pcesvn: &mut u16,
    cpusvn: &mut [u8; 16],
) -> Result<(), SgxExtensionError> {
    let (_, tcb_seq) =
        Sequence::from_der(value).map_err(|_| SgxExtensionError::Malformed("tcb sequence"))?;
    let mut rest = tcb_seq.content.as_ref();
    while !rest.is_empty() {
        let (next, component) = Sequence::from_der(rest)
            .map_err(|_| SgxExtensionError::Malformed("tcb component"))?;
        rest = next;
        let (value, component_oid) = Oid::from_der(component.content.as_ref())
            .map_err(|_| SgxExtensionError::Malformed("tcb component oid"))?;
        let oid_str = component_oid.to_id_string();
        let Some(index_str) = oid_str.strip_prefix(TCB_COMPONENT_PREFIX) else {
            continue;
        };
        let Ok(index) = index_str.parse::<usize>() else {
            continue;
        };
        match index {
            1..=16 => {
                // Component SVNs are INTEGERs; some issuers emit them as
                // single-byte OCTET STRINGs.
                if let Ok((_, svn)) = Integer::from_der(value) {
                    tcb_components[index - 1] = svn.as_u32().unwrap_or(0) as u8;
                } else if let Ok((_, octets)) = OctetString::from_der(value) {
                    if let Some(first) = octets.as_ref().first() {
                        tcb_components[index - 1] = *first;
                    }
                }
            }
            17 => {
                let (_, svn) = Integer::from_der(value)
                    .map_err(|_| SgxExtensionError::Malformed("pcesvn"))?;
                *pcesvn = svn.as_u32().unwrap_or(0) as u16;
            }
            18 => {
                let (_, octets) = OctetString::from_der(value)
                    .map_err(|_| SgxExtensionError::Malformed("cpusvn"))?;
                *cpusvn = <[u8; 16]>::try_from(octets.as_ref())
                    .map_err(|_| SgxExtensionError::Malformed("cpusvn length"))?;
            }
            _ => continue,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::FromDer as _;

    #[test]
    fn extracts_fmspc_pceid_and_tcb() {
        let chain = crate::testing::TestChain::generate();
        let (_, cert) =
            x509_parser::certificate::X509Certificate::from_der(&chain.leaf_der).unwrap();
        let ext = parse_sgx_extension(&cert).expect("sgx extension");
        assert_eq!(ext.fmspc_hex(), "30606a000000");
        assert_eq!(ext.pceid, [0x00, 0x00]);
        assert_eq!(ext.pcesvn, 11);
        assert_eq!(ext.tcb_components[0], 3);
        assert_eq!(ext.cpusvn.len(), 16);
    }

    #[test]
    fn missing_extension_is_reported() {
        let chain = crate::testing::TestChain::generate();
        // The root carries no SGX extension.
        let (_, cert) =
            x509_parser::certificate::X509Certificate::from_der(&chain.root_der).unwrap();
        assert_eq!(
            parse_sgx_extension(&cert),
            Err(SgxExtensionError::Missing)
        );
    }
}
