// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Synthetic quotes and PCK chains for tests.
//!
//! The sample corpus of real Intel quotes is not shipped with the crate, so
//! tests mint their own: a three-certificate chain shaped like Intel's PCK
//! chain (with the SGX extension on the leaf) and quotes signed end to end
//! with freshly generated P-256 keys.

use p256::ecdsa::signature::Signer as _;
use p256::ecdsa::{Signature, SigningKey};
use p256::pkcs8::DecodePrivateKey as _;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateRevocationListParams, CustomExtension,
    DistinguishedName, DnType, IsCa, KeyIdMethod, KeyPair, RevokedCertParams, SerialNumber,
    PKCS_ECDSA_P256_SHA256,
};
use scale::Encode;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use yasna::models::ObjectIdentifier;

use crate::quote::{
    AuthDataV3, Body, CertificationData, Data, EnclaveReport, Header, QEReportCertificationData,
    TDReport10, TDReport15, BODY_TD_REPORT15_TYPE, CERT_TYPE_QE_REPORT, TD_REPORT15_BYTE_LEN,
    TEE_TYPE_SGX, TEE_TYPE_TDX,
};

const SGX_EXTENSION_OID: &[u64] = &[1, 2, 840, 113741, 1, 13, 1];
const TEST_FMSPC: [u8; 6] = [0x30, 0x60, 0x6a, 0x00, 0x00, 0x00];
const TEST_PCEID: [u8; 2] = [0x00, 0x00];

/// A PCK-shaped certificate chain with controllable validity.
pub struct TestChain {
    pub root_der: Vec<u8>,
    pub intermediate_der: Vec<u8>,
    pub leaf_der: Vec<u8>,
    pub pem_bundle: Vec<u8>,
    pub leaf_key: SigningKey,
    intermediate_cert: rcgen::Certificate,
    intermediate_key: KeyPair,
    leaf_serial: Vec<u8>,
}

impl TestChain {
    pub const NOT_BEFORE: u64 = 1_700_000_000;
    pub const VALID_AT: u64 = 1_750_000_000;
    pub const NOT_AFTER: u64 = 1_800_000_000;
    pub const AFTER_EXPIRY: u64 = 1_850_000_000;

    pub fn generate() -> Self {
        Self::generate_with_cns(
            "Intel SGX Root CA",
            "Intel SGX PCK Platform CA",
            "Intel SGX PCK Certificate",
        )
    }

    /// A chain with arbitrary subject CNs, for exercising the issuer-DN
    /// ordering fallback.
    pub fn generate_with_cns(root_cn: &str, intermediate_cn: &str, leaf_cn: &str) -> Self {
        let root_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let mut root_params = ca_params(root_cn);
        root_params.serial_number = Some(SerialNumber::from(vec![0x01]));
        let root_cert = root_params.self_signed(&root_key).unwrap();
        Self::assemble(root_cert, &root_key, intermediate_cn, leaf_cn)
    }

    /// A chain whose Intel-named root is cross-signed by an outside CA, so
    /// no certificate in the chain is self-issued.
    pub fn generate_cross_signed_root() -> Self {
        let outside_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let outside_cert = ca_params("Example Systems Root CA")
            .self_signed(&outside_key)
            .unwrap();

        let root_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let mut root_params = ca_params("Intel SGX Root CA");
        root_params.serial_number = Some(SerialNumber::from(vec![0x01]));
        let root_cert = root_params
            .signed_by(&root_key, &outside_cert, &outside_key)
            .unwrap();
        Self::assemble(
            root_cert,
            &root_key,
            "Intel SGX PCK Platform CA",
            "Intel SGX PCK Certificate",
        )
    }

    fn assemble(
        root_cert: rcgen::Certificate,
        root_key: &KeyPair,
        intermediate_cn: &str,
        leaf_cn: &str,
    ) -> Self {
        let intermediate_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let mut intermediate_params = ca_params(intermediate_cn);
        intermediate_params.serial_number = Some(SerialNumber::from(vec![0x02]));
        let intermediate_cert = intermediate_params
            .signed_by(&intermediate_key, &root_cert, root_key)
            .unwrap();

        let leaf_key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let leaf_serial = vec![0x05, 0x11, 0x22, 0x33];
        let mut leaf_params = CertificateParams::new(vec![]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, leaf_cn);
        leaf_params.distinguished_name = dn;
        leaf_params.serial_number = Some(SerialNumber::from(leaf_serial.clone()));
        leaf_params.not_before = timestamp(Self::NOT_BEFORE);
        leaf_params.not_after = timestamp(Self::NOT_AFTER);
        leaf_params
            .custom_extensions
            .push(CustomExtension::from_oid_content(
                SGX_EXTENSION_OID,
                sgx_extension_content(TEST_FMSPC, TEST_PCEID),
            ));
        let leaf_cert = leaf_params
            .signed_by(&leaf_key_pair, &intermediate_cert, &intermediate_key)
            .unwrap();

        let pem_bundle = format!(
            "{}{}{}",
            leaf_cert.pem(),
            intermediate_cert.pem(),
            root_cert.pem()
        )
        .into_bytes();

        Self {
            root_der: root_cert.der().to_vec(),
            intermediate_der: intermediate_cert.der().to_vec(),
            leaf_der: leaf_cert.der().to_vec(),
            pem_bundle,
            leaf_key: SigningKey::from_pkcs8_der(&leaf_key_pair.serialize_der()).unwrap(),
            intermediate_cert,
            intermediate_key,
            leaf_serial,
        }
    }

    pub fn root_fingerprint(&self) -> [u8; 32] {
        Sha256::digest(&self.root_der).into()
    }

    /// A CRL issued by the intermediate that revokes the leaf.
    pub fn revoke_leaf(&self) -> Vec<u8> {
        let crl = CertificateRevocationListParams {
            this_update: timestamp(Self::NOT_BEFORE),
            next_update: timestamp(Self::NOT_AFTER),
            crl_number: SerialNumber::from(vec![0x01]),
            issuing_distribution_point: None,
            revoked_certs: vec![RevokedCertParams {
                serial_number: SerialNumber::from(self.leaf_serial.clone()),
                revocation_time: timestamp(Self::NOT_BEFORE + 1),
                reason_code: None,
                invalidity_date: None,
            }],
            key_identifier_method: KeyIdMethod::Sha256,
        }
        .signed_by(&self.intermediate_cert, &self.intermediate_key)
        .unwrap();
        crl.der().to_vec()
    }
}

fn ca_params(common_name: &str) -> CertificateParams {
    let mut params = CertificateParams::new(vec![]).unwrap();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.not_before = timestamp(TestChain::NOT_BEFORE);
    params.not_after = timestamp(TestChain::NOT_AFTER);
    params
}

fn timestamp(secs: u64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(secs as i64).unwrap()
}

fn oid(components: &[u64]) -> ObjectIdentifier {
    ObjectIdentifier::from_slice(components)
}

/// DER content of the SGX extension: a sequence of (oid, value) members
/// with the TCB sub-sequence, PCEID and FMSPC.
fn sgx_extension_content(fmspc: [u8; 6], pceid: [u8; 2]) -> Vec<u8> {
    yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_sequence(|writer| {
                writer
                    .next()
                    .write_oid(&oid(&[1, 2, 840, 113741, 1, 13, 1, 2]));
                writer.next().write_sequence(|writer| {
                    for component in 1u64..=16 {
                        writer.next().write_sequence(|writer| {
                            writer
                                .next()
                                .write_oid(&oid(&[1, 2, 840, 113741, 1, 13, 1, 2, component]));
                            let svn = if component <= 2 { 3 } else { 0 };
                            writer.next().write_u32(svn);
                        });
                    }
                    writer.next().write_sequence(|writer| {
                        writer
                            .next()
                            .write_oid(&oid(&[1, 2, 840, 113741, 1, 13, 1, 2, 17]));
                        writer.next().write_u32(11);
                    });
                    writer.next().write_sequence(|writer| {
                        writer
                            .next()
                            .write_oid(&oid(&[1, 2, 840, 113741, 1, 13, 1, 2, 18]));
                        let mut cpusvn = [0u8; 16];
                        cpusvn[0] = 3;
                        cpusvn[1] = 3;
                        writer.next().write_bytes(&cpusvn);
                    });
                });
            });
            writer.next().write_sequence(|writer| {
                writer
                    .next()
                    .write_oid(&oid(&[1, 2, 840, 113741, 1, 13, 1, 3]));
                writer.next().write_bytes(&pceid);
            });
            writer.next().write_sequence(|writer| {
                writer
                    .next()
                    .write_oid(&oid(&[1, 2, 840, 113741, 1, 13, 1, 4]));
                writer.next().write_bytes(&fmspc);
            });
        });
    })
}

pub fn sample_enclave_report() -> EnclaveReport {
    EnclaveReport {
        cpu_svn: [1u8; 16],
        misc_select: 0,
        reserved1: [0u8; 28],
        attributes: [0u8; 16],
        mr_enclave: [0x0au8; 32],
        reserved2: [0u8; 32],
        mr_signer: [0x0bu8; 32],
        reserved3: [0u8; 96],
        isv_prod_id: 0,
        isv_svn: 0,
        reserved4: [0u8; 60],
        report_data: [0u8; 64],
    }
}

pub fn sample_td_report() -> TDReport10 {
    TDReport10 {
        tee_tcb_svn: [2u8; 16],
        mr_seam: [0x01; 48],
        mr_signer_seam: [0u8; 48],
        seam_attributes: [0u8; 8],
        td_attributes: [0u8; 8],
        xfam: [0u8; 8],
        mr_td: [0xc6; 48],
        mr_config_id: [0u8; 48],
        mr_owner: [0u8; 48],
        mr_owner_config: [0u8; 48],
        rt_mr0: [0x07; 48],
        rt_mr1: [0x08; 48],
        rt_mr2: [0x09; 48],
        rt_mr3: [0x0a; 48],
        report_data: [0x76; 64],
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TeeKind {
    SgxV3,
    Td10V4,
    Td15V5,
}

/// Builds a fully signed synthetic quote over a fresh [`TestChain`].
pub struct QuoteBuilder {
    kind: TeeKind,
    cert_type: u16,
    nest_chain_in_auth_data: bool,
    corrupt_qe_binding: bool,
    random_qe_signer: bool,
    report_data: [u8; 64],
}

pub struct BuiltQuote {
    pub quote: Vec<u8>,
    pub chain: TestChain,
    pub chain_pem: Vec<u8>,
    pub mr_td: [u8; 48],
}

impl QuoteBuilder {
    pub fn new() -> Self {
        Self {
            kind: TeeKind::Td10V4,
            cert_type: crate::quote::CERT_TYPE_PCK_CHAIN,
            nest_chain_in_auth_data: false,
            corrupt_qe_binding: false,
            random_qe_signer: false,
            report_data: [0x76; 64],
        }
    }

    /// Build an SGX quote with the v3 (flat) signature block layout.
    pub fn sgx(mut self) -> Self {
        self.kind = TeeKind::SgxV3;
        self
    }

    /// Build a v5 quote with a TD 1.5 report body.
    pub fn v5_td15(mut self) -> Self {
        self.kind = TeeKind::Td15V5;
        self
    }

    /// Certification data type 3: the chain is not embedded in the quote.
    pub fn cert_type_3(mut self) -> Self {
        self.cert_type = 3;
        self
    }

    /// Azure vTPM shape: certification data type 7 with an empty body and
    /// the PEM bundle nested in the QE auth data.
    pub fn nest_chain_in_auth_data(mut self) -> Self {
        self.cert_type = 7;
        self.nest_chain_in_auth_data = true;
        self
    }

    pub fn corrupt_qe_binding(mut self) -> Self {
        self.corrupt_qe_binding = true;
        self
    }

    pub fn sign_qe_report_with_random_key(mut self) -> Self {
        self.random_qe_signer = true;
        self
    }

    pub fn report_data(mut self, report_data: [u8; 64]) -> Self {
        self.report_data = report_data;
        self
    }

    pub fn build(self) -> BuiltQuote {
        let chain = TestChain::generate();
        let chain_pem = chain.pem_bundle.clone();

        let attestation_key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let attestation_key =
            SigningKey::from_pkcs8_der(&attestation_key_pair.serialize_der()).unwrap();
        let attestation_point = attestation_key
            .verifying_key()
            .to_encoded_point(false);
        let attestation_pub: [u8; 64] = attestation_point.as_bytes()[1..65].try_into().unwrap();

        let qe_auth_data = if self.nest_chain_in_auth_data {
            // Some binary prefix ahead of the nested bundle, as on Azure.
            let mut data = vec![0x01, 0x00, 0x00, 0x42];
            data.extend_from_slice(&chain_pem);
            data
        } else {
            vec![0u8; 32]
        };

        let mut binding = Sha256::new();
        binding.update(attestation_pub);
        binding.update(&qe_auth_data);
        let mut binding: [u8; 32] = binding.finalize().into();
        if self.corrupt_qe_binding {
            binding[0] ^= 0xff;
        }

        let mut qe_report_body = sample_enclave_report();
        qe_report_body.report_data = [0u8; 64];
        qe_report_body.report_data[..32].copy_from_slice(&binding);
        let qe_report: [u8; 384] = qe_report_body.encode().try_into().unwrap();

        let qe_signer = if self.random_qe_signer {
            let random = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
            SigningKey::from_pkcs8_der(&random.serialize_der()).unwrap()
        } else {
            chain.leaf_key.clone()
        };
        let qe_report_signature: Signature = qe_signer.sign(&qe_report);
        let qe_report_signature: [u8; 64] =
            qe_report_signature.to_bytes().as_slice().try_into().unwrap();

        let cert_body = match self.cert_type {
            crate::quote::CERT_TYPE_PCK_CHAIN => chain_pem.clone(),
            7 => vec![],
            // Encrypted PPID style blob.
            _ => vec![0u8; 384],
        };
        let certification_data = CertificationData {
            cert_type: self.cert_type,
            body: Data::new(cert_body),
        };

        let (header, report_bytes, mr_td, body_descriptor) = match self.kind {
            TeeKind::SgxV3 => {
                let mut report = sample_enclave_report();
                report.report_data = self.report_data;
                (header_for(3, TEE_TYPE_SGX), report.encode(), [0u8; 48], None)
            }
            TeeKind::Td10V4 => {
                let mut report = sample_td_report();
                report.report_data = self.report_data;
                let mr_td = report.mr_td;
                (header_for(4, TEE_TYPE_TDX), report.encode(), mr_td, None)
            }
            TeeKind::Td15V5 => {
                let mut base = sample_td_report();
                base.report_data = self.report_data;
                let mr_td = base.mr_td;
                let report = TDReport15 {
                    base,
                    tee_tcb_svn_2: [2u8; 16],
                    mr_service_td: [0u8; 48],
                };
                let body = Body {
                    body_type: BODY_TD_REPORT15_TYPE,
                    size: TD_REPORT15_BYTE_LEN as u32,
                };
                (
                    header_for(5, TEE_TYPE_TDX),
                    report.encode(),
                    mr_td,
                    Some(body),
                )
            }
        };

        let mut signed_message = header.encode();
        if let Some(body) = &body_descriptor {
            signed_message.extend_from_slice(&body.encode());
        }
        signed_message.extend_from_slice(&report_bytes);
        let ecdsa_signature: Signature = attestation_key.sign(&signed_message);
        let ecdsa_signature: [u8; 64] = ecdsa_signature.to_bytes().as_slice().try_into().unwrap();

        let auth_data = match self.kind {
            TeeKind::SgxV3 => AuthDataV3 {
                ecdsa_signature,
                ecdsa_attestation_key: attestation_pub,
                qe_report,
                qe_report_signature,
                qe_auth_data: Data::new(qe_auth_data),
                certification_data,
            }
            .encode(),
            _ => {
                let qe_report_data = QEReportCertificationData {
                    qe_report,
                    qe_report_signature,
                    qe_auth_data: Data::new(qe_auth_data),
                    certification_data,
                };
                let mut auth = ecdsa_signature.encode();
                auth.extend_from_slice(&attestation_pub.encode());
                auth.extend_from_slice(
                    &CertificationData {
                        cert_type: CERT_TYPE_QE_REPORT,
                        body: Data::new(qe_report_data.encode()),
                    }
                    .encode(),
                );
                auth
            }
        };

        let mut quote = signed_message;
        quote.extend_from_slice(&(auth_data.len() as u32).to_le_bytes());
        quote.extend_from_slice(&auth_data);

        BuiltQuote {
            quote,
            chain,
            chain_pem,
            mr_td,
        }
    }
}

impl Default for QuoteBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn header_for(version: u16, tee_type: u32) -> Header {
    Header {
        version,
        attestation_key_type: 2,
        tee_type,
        qe_svn: 1,
        pce_svn: 1,
        qe_vendor_id: [0u8; 16],
        user_data: [0u8; 20],
    }
}
