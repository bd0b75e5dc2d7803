// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Parsing of SGX and TDX DCAP quote structures.
//!
//! All multibyte integers in a quote are little-endian, and all structure
//! fields are packed, so the SCALE codec layout of the fixed-size structs
//! below is byte-identical to the DCAP wire layout. Length-prefixed blobs
//! use [`Data`], which bounds-checks the prefix against the remaining input.

use core::marker::PhantomData;

use scale::{Decode, Encode, Input};

/// TEE type of an SGX enclave quote.
pub const TEE_TYPE_SGX: u32 = 0x0000_0000;
/// TEE type of a TDX TD quote.
pub const TEE_TYPE_TDX: u32 = 0x0000_0081;

/// Report body type tag in a v5 quote body descriptor.
pub const BODY_SGX_ENCLAVE_REPORT_TYPE: u16 = 1;
pub const BODY_TD_REPORT10_TYPE: u16 = 2;
pub const BODY_TD_REPORT15_TYPE: u16 = 3;

pub const HEADER_BYTE_LEN: usize = 48;
pub const ENCLAVE_REPORT_BYTE_LEN: usize = 384;
pub const TD_REPORT10_BYTE_LEN: usize = 584;
pub const TD_REPORT15_BYTE_LEN: usize = 648;

/// Certification data carrying a PCK chain PEM bundle.
pub const CERT_TYPE_PCK_CHAIN: u16 = 5;
/// Certification data nesting a QE report certification data structure.
pub const CERT_TYPE_QE_REPORT: u16 = 6;
/// QE report certification data with platform manifest (Azure vTPM quotes).
pub const CERT_TYPE_QE_REPORT_WITH_MANIFEST: u16 = 7;

/// Errors produced while decoding a quote.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuoteError {
    #[error("truncated field: {0}")]
    TruncatedField(&'static str),
    #[error("length prefix overflows buffer: {0}")]
    LengthOverflow(&'static str),
    #[error("unsupported quote version: {0}")]
    UnsupportedVersion(u16),
    #[error("unsupported tee type: {0:#x}")]
    UnsupportedTeeType(u32),
    #[error("unsupported report body type: {0}")]
    UnsupportedBodyType(u16),
    #[error("unsupported certification data type: {0}")]
    UnsupportedCertDataType(u16),
    #[error("invalid {0} envelope")]
    InvalidEncoding(&'static str),
}

pub type Result<T, E = QuoteError> = core::result::Result<T, E>;

const OVERFLOW_MSG: &str = "length prefix overflows input";

fn truncated(field: &'static str) -> impl Fn(scale::Error) -> QuoteError {
    move |_| QuoteError::TruncatedField(field)
}

fn map_scale(field: &'static str) -> impl Fn(scale::Error) -> QuoteError {
    move |e| {
        if e.to_string().contains(OVERFLOW_MSG) {
            QuoteError::LengthOverflow(field)
        } else {
            QuoteError::TruncatedField(field)
        }
    }
}

/// A byte blob preceded by a little-endian length prefix of integer type `T`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Data<T> {
    pub data: Vec<u8>,
    _marker: PhantomData<T>,
}

impl<T> Data<T> {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            _marker: PhantomData,
        }
    }
}

impl<T: Decode + Into<u64>> Decode for Data<T> {
    fn decode<I: Input>(input: &mut I) -> Result<Self, scale::Error> {
        let len: u64 = T::decode(input)?.into();
        let len = usize::try_from(len).map_err(|_| scale::Error::from(OVERFLOW_MSG))?;
        if let Some(remaining) = input.remaining_len()? {
            if len > remaining {
                return Err(OVERFLOW_MSG.into());
            }
        }
        let mut data = vec![0u8; len];
        input.read(&mut data)?;
        Ok(Self::new(data))
    }
}

impl<T: Encode + TryFrom<usize>> Encode for Data<T> {
    fn encode_to<W: scale::Output + ?Sized>(&self, dest: &mut W) {
        if let Ok(len) = T::try_from(self.data.len()) {
            len.encode_to(dest);
        }
        dest.write(&self.data);
    }
}

/// Common quote header (48 bytes).
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
    pub attestation_key_type: u16,
    pub tee_type: u32,
    pub qe_svn: u16,
    pub pce_svn: u16,
    pub qe_vendor_id: [u8; 16],
    pub user_data: [u8; 20],
}

impl Header {
    pub fn is_sgx(&self) -> bool {
        self.tee_type == TEE_TYPE_SGX
    }

    pub fn is_tdx(&self) -> bool {
        self.tee_type == TEE_TYPE_TDX
    }
}

/// Report body descriptor preceding the body in a v5 quote.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct Body {
    pub body_type: u16,
    pub size: u32,
}

/// SGX enclave report body (384 bytes). Also the shape of the QE report.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct EnclaveReport {
    pub cpu_svn: [u8; 16],
    pub misc_select: u32,
    pub reserved1: [u8; 28],
    pub attributes: [u8; 16],
    pub mr_enclave: [u8; 32],
    pub reserved2: [u8; 32],
    pub mr_signer: [u8; 32],
    pub reserved3: [u8; 96],
    pub isv_prod_id: u16,
    pub isv_svn: u16,
    pub reserved4: [u8; 60],
    pub report_data: [u8; 64],
}

/// TDX 1.0 TD report body (584 bytes).
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct TDReport10 {
    pub tee_tcb_svn: [u8; 16],
    pub mr_seam: [u8; 48],
    pub mr_signer_seam: [u8; 48],
    pub seam_attributes: [u8; 8],
    pub td_attributes: [u8; 8],
    pub xfam: [u8; 8],
    pub mr_td: [u8; 48],
    pub mr_config_id: [u8; 48],
    pub mr_owner: [u8; 48],
    pub mr_owner_config: [u8; 48],
    pub rt_mr0: [u8; 48],
    pub rt_mr1: [u8; 48],
    pub rt_mr2: [u8; 48],
    pub rt_mr3: [u8; 48],
    pub report_data: [u8; 64],
}

/// TDX 1.5 TD report body: the 1.0 body with the module-1.5 fields appended.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct TDReport15 {
    pub base: TDReport10,
    pub tee_tcb_svn_2: [u8; 16],
    pub mr_service_td: [u8; 48],
}

/// Certification data: a type tag and a u32-length-prefixed body.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct CertificationData {
    pub cert_type: u16,
    pub body: Data<u32>,
}

/// QE report certification data nested inside v4/v5 auth data.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct QEReportCertificationData {
    pub qe_report: [u8; ENCLAVE_REPORT_BYTE_LEN],
    pub qe_report_signature: [u8; 64],
    pub qe_auth_data: Data<u16>,
    pub certification_data: CertificationData,
}

/// Signature block of a v3 quote.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct AuthDataV3 {
    pub ecdsa_signature: [u8; 64],
    pub ecdsa_attestation_key: [u8; 64],
    pub qe_report: [u8; ENCLAVE_REPORT_BYTE_LEN],
    pub qe_report_signature: [u8; 64],
    pub qe_auth_data: Data<u16>,
    pub certification_data: CertificationData,
}

/// Signature block of a v4/v5 quote. On the wire an outer certification
/// data of type 6 or 7 nests a [`QEReportCertificationData`] in its body;
/// only the outer type tag is kept here, the body being the nested
/// structure itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthDataV4 {
    pub ecdsa_signature: [u8; 64],
    pub ecdsa_attestation_key: [u8; 64],
    /// Type tag of the outer certification data (6 or 7).
    pub cert_type: u16,
    pub qe_report_data: QEReportCertificationData,
}

impl Encode for AuthDataV4 {
    fn encode_to<W: scale::Output + ?Sized>(&self, dest: &mut W) {
        self.ecdsa_signature.encode_to(dest);
        self.ecdsa_attestation_key.encode_to(dest);
        CertificationData {
            cert_type: self.cert_type,
            body: Data::new(self.qe_report_data.encode()),
        }
        .encode_to(dest);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthData {
    V3(AuthDataV3),
    V4(AuthDataV4),
}

impl AuthData {
    pub fn ecdsa_signature(&self) -> &[u8; 64] {
        match self {
            AuthData::V3(d) => &d.ecdsa_signature,
            AuthData::V4(d) => &d.ecdsa_signature,
        }
    }

    pub fn ecdsa_attestation_key(&self) -> &[u8; 64] {
        match self {
            AuthData::V3(d) => &d.ecdsa_attestation_key,
            AuthData::V4(d) => &d.ecdsa_attestation_key,
        }
    }

    pub fn qe_report(&self) -> &[u8; ENCLAVE_REPORT_BYTE_LEN] {
        match self {
            AuthData::V3(d) => &d.qe_report,
            AuthData::V4(d) => &d.qe_report_data.qe_report,
        }
    }

    pub fn qe_report_signature(&self) -> &[u8; 64] {
        match self {
            AuthData::V3(d) => &d.qe_report_signature,
            AuthData::V4(d) => &d.qe_report_data.qe_report_signature,
        }
    }

    pub fn qe_auth_data(&self) -> &[u8] {
        match self {
            AuthData::V3(d) => &d.qe_auth_data.data,
            AuthData::V4(d) => &d.qe_report_data.qe_auth_data.data,
        }
    }

    /// The certification data that carries (or points at) the PCK chain.
    pub fn certification_data(&self) -> &CertificationData {
        match self {
            AuthData::V3(d) => &d.certification_data,
            AuthData::V4(d) => &d.qe_report_data.certification_data,
        }
    }

    fn encode(&self) -> Vec<u8> {
        match self {
            AuthData::V3(d) => d.encode(),
            AuthData::V4(d) => d.encode(),
        }
    }
}

/// The report body of a quote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    SgxEnclave(EnclaveReport),
    TD10(TDReport10),
    TD15(TDReport15),
}

impl Report {
    pub fn as_sgx(&self) -> Option<&EnclaveReport> {
        match self {
            Report::SgxEnclave(r) => Some(r),
            _ => None,
        }
    }

    /// The TD 1.0 view of the report. TD 1.5 reports answer with their base.
    pub fn as_td10(&self) -> Option<&TDReport10> {
        match self {
            Report::TD10(r) => Some(r),
            Report::TD15(r) => Some(&r.base),
            Report::SgxEnclave(_) => None,
        }
    }

    pub fn as_td15(&self) -> Option<&TDReport15> {
        match self {
            Report::TD15(r) => Some(r),
            _ => None,
        }
    }

    pub fn report_data(&self) -> &[u8; 64] {
        match self {
            Report::SgxEnclave(r) => &r.report_data,
            Report::TD10(r) => &r.report_data,
            Report::TD15(r) => &r.base.report_data,
        }
    }

    fn encode(&self) -> Vec<u8> {
        match self {
            Report::SgxEnclave(r) => r.encode(),
            Report::TD10(r) => r.encode(),
            Report::TD15(r) => r.encode(),
        }
    }
}

/// A parsed DCAP quote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub header: Header,
    pub report: Report,
    pub auth_data: AuthData,
}

impl Quote {
    /// Parse a binary quote.
    pub fn parse(encoded: &[u8]) -> Result<Self> {
        let mut input = encoded;
        let header = Header::decode(&mut input).map_err(truncated("header"))?;
        let report = match header.version {
            3 => {
                if !header.is_sgx() {
                    return Err(QuoteError::UnsupportedTeeType(header.tee_type));
                }
                Report::SgxEnclave(
                    EnclaveReport::decode(&mut input).map_err(truncated("enclave report"))?,
                )
            }
            4 => match header.tee_type {
                TEE_TYPE_SGX => Report::SgxEnclave(
                    EnclaveReport::decode(&mut input).map_err(truncated("enclave report"))?,
                ),
                TEE_TYPE_TDX => {
                    Report::TD10(TDReport10::decode(&mut input).map_err(truncated("TD report"))?)
                }
                other => return Err(QuoteError::UnsupportedTeeType(other)),
            },
            5 => {
                let body = Body::decode(&mut input).map_err(truncated("body descriptor"))?;
                match body.body_type {
                    BODY_SGX_ENCLAVE_REPORT_TYPE => Report::SgxEnclave(
                        EnclaveReport::decode(&mut input).map_err(truncated("enclave report"))?,
                    ),
                    BODY_TD_REPORT10_TYPE => Report::TD10(
                        TDReport10::decode(&mut input).map_err(truncated("TD report"))?,
                    ),
                    BODY_TD_REPORT15_TYPE => Report::TD15(
                        TDReport15::decode(&mut input).map_err(truncated("TD 1.5 report"))?,
                    ),
                    other => return Err(QuoteError::UnsupportedBodyType(other)),
                }
            }
            other => return Err(QuoteError::UnsupportedVersion(other)),
        };
        let auth_len = u32::decode(&mut input).map_err(truncated("auth data length"))? as usize;
        if auth_len > input.len() {
            return Err(QuoteError::LengthOverflow("auth data"));
        }
        let auth_data = Self::decode_auth_data(header.version, &input[..auth_len])?;
        let cert_type = auth_data.certification_data().cert_type;
        if !(1..=7).contains(&cert_type) {
            return Err(QuoteError::UnsupportedCertDataType(cert_type));
        }
        Ok(Quote {
            header,
            report,
            auth_data,
        })
    }

    fn decode_auth_data(version: u16, data: &[u8]) -> Result<AuthData> {
        let mut input = data;
        match version {
            3 => {
                let auth = AuthDataV3::decode(&mut input).map_err(map_scale("auth data"))?;
                Ok(AuthData::V3(auth))
            }
            _ => {
                let ecdsa_signature =
                    <[u8; 64]>::decode(&mut input).map_err(truncated("quote signature"))?;
                let ecdsa_attestation_key =
                    <[u8; 64]>::decode(&mut input).map_err(truncated("attestation key"))?;
                let certification_data = CertificationData::decode(&mut input)
                    .map_err(map_scale("certification data"))?;
                if !matches!(
                    certification_data.cert_type,
                    CERT_TYPE_QE_REPORT | CERT_TYPE_QE_REPORT_WITH_MANIFEST
                ) {
                    return Err(QuoteError::UnsupportedCertDataType(
                        certification_data.cert_type,
                    ));
                }
                let qe_report_data =
                    QEReportCertificationData::decode(&mut &certification_data.body.data[..])
                        .map_err(map_scale("QE report certification data"))?;
                Ok(AuthData::V4(AuthDataV4 {
                    ecdsa_signature,
                    ecdsa_attestation_key,
                    cert_type: certification_data.cert_type,
                    qe_report_data,
                }))
            }
        }
    }

    /// Parse a quote from a hex envelope, with or without a `0x` prefix.
    pub fn parse_hex(encoded: &str) -> Result<Self> {
        let trimmed = encoded.trim();
        let hex_str = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = hex::decode(hex_str).map_err(|_| QuoteError::InvalidEncoding("hex"))?;
        Self::parse(&bytes)
    }

    /// Parse a quote from a base64 envelope (standard or URL-safe alphabet).
    pub fn parse_base64(encoded: &str) -> Result<Self> {
        use base64::Engine;
        let trimmed = encoded.trim();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(trimmed)
            .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(trimmed))
            .map_err(|_| QuoteError::InvalidEncoding("base64"))?;
        Self::parse(&bytes)
    }

    /// The region covered by the quote body signature: header and report
    /// body, with the body descriptor in between for v5 quotes.
    pub fn signed_message(&self) -> Vec<u8> {
        let mut message = self.header.encode();
        if self.header.version == 5 {
            let body = Body {
                body_type: match &self.report {
                    Report::SgxEnclave(_) => BODY_SGX_ENCLAVE_REPORT_TYPE,
                    Report::TD10(_) => BODY_TD_REPORT10_TYPE,
                    Report::TD15(_) => BODY_TD_REPORT15_TYPE,
                },
                size: match &self.report {
                    Report::SgxEnclave(_) => ENCLAVE_REPORT_BYTE_LEN as u32,
                    Report::TD10(_) => TD_REPORT10_BYTE_LEN as u32,
                    Report::TD15(_) => TD_REPORT15_BYTE_LEN as u32,
                },
            };
            message.extend_from_slice(&body.encode());
        }
        message.extend_from_slice(&self.report.encode());
        message
    }

    /// Re-encode the quote to its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut encoded = self.signed_message();
        let auth_data = self.auth_data.encode();
        encoded.extend_from_slice(&(auth_data.len() as u32).to_le_bytes());
        encoded.extend_from_slice(&auth_data);
        encoded
    }

    /// The PEM bundle carrying the PCK chain, if the quote embeds one.
    ///
    /// Certification data type 5 carries the bundle directly. Azure vTPM
    /// quotes (type 6/7 with no usable body) nest the bundle inside the QE
    /// auth data instead. Types 1 through 4 carry no chain; the caller must
    /// obtain it out of band.
    pub fn cert_chain_pem(&self) -> Option<Vec<u8>> {
        let cert_data = self.auth_data.certification_data();
        match cert_data.cert_type {
            CERT_TYPE_PCK_CHAIN => Some(cert_data.body.data.clone()),
            CERT_TYPE_QE_REPORT | CERT_TYPE_QE_REPORT_WITH_MANIFEST => {
                let bundle = find_pem_bundle(&cert_data.body.data)
                    .or_else(|| find_pem_bundle(self.auth_data.qe_auth_data()))?;
                Some(bundle)
            }
            _ => None,
        }
    }

    /// The QE report parsed into its SGX-report shape.
    pub fn qe_report(&self) -> Result<EnclaveReport> {
        EnclaveReport::decode(&mut &self.auth_data.qe_report()[..])
            .map_err(truncated("QE report"))
    }
}

/// Locate a PEM certificate bundle nested somewhere inside `data`.
fn find_pem_bundle(data: &[u8]) -> Option<Vec<u8>> {
    const MARKER: &[u8] = b"-----BEGIN CERTIFICATE-----";
    let start = data
        .windows(MARKER.len())
        .position(|window| window == MARKER)?;
    Some(data[start..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_48_bytes() {
        let header = Header {
            version: 4,
            attestation_key_type: 2,
            tee_type: TEE_TYPE_TDX,
            qe_svn: 1,
            pce_svn: 1,
            qe_vendor_id: [0u8; 16],
            user_data: [0u8; 20],
        };
        assert_eq!(header.encode().len(), HEADER_BYTE_LEN);
    }

    #[test]
    fn report_layouts_match_dcap_sizes() {
        let sgx = crate::testing::sample_enclave_report();
        assert_eq!(sgx.encode().len(), ENCLAVE_REPORT_BYTE_LEN);
        let td10 = crate::testing::sample_td_report();
        assert_eq!(td10.encode().len(), TD_REPORT10_BYTE_LEN);
        let td15 = TDReport15 {
            base: td10,
            tee_tcb_svn_2: [0u8; 16],
            mr_service_td: [0u8; 48],
        };
        assert_eq!(td15.encode().len(), TD_REPORT15_BYTE_LEN);
    }

    #[test]
    fn parse_rejects_truncated_input() {
        assert_eq!(
            Quote::parse(&[0x04, 0x00, 0x02, 0x00]),
            Err(QuoteError::TruncatedField("header"))
        );
    }

    #[test]
    fn parse_rejects_unknown_version() {
        let mut header = Header {
            version: 9,
            attestation_key_type: 2,
            tee_type: TEE_TYPE_SGX,
            qe_svn: 0,
            pce_svn: 0,
            qe_vendor_id: [0u8; 16],
            user_data: [0u8; 20],
        }
        .encode();
        header.resize(2048, 0);
        assert_eq!(Quote::parse(&header), Err(QuoteError::UnsupportedVersion(9)));
    }

    #[test]
    fn parse_rejects_unknown_tee_type() {
        let mut quote = Header {
            version: 4,
            attestation_key_type: 2,
            tee_type: 0x42,
            qe_svn: 0,
            pce_svn: 0,
            qe_vendor_id: [0u8; 16],
            user_data: [0u8; 20],
        }
        .encode();
        quote.resize(2048, 0);
        assert_eq!(
            Quote::parse(&quote),
            Err(QuoteError::UnsupportedTeeType(0x42))
        );
    }

    #[test]
    fn parse_rejects_overflowing_auth_data_length() {
        let mut quote = Header {
            version: 4,
            attestation_key_type: 2,
            tee_type: TEE_TYPE_TDX,
            qe_svn: 0,
            pce_svn: 0,
            qe_vendor_id: [0u8; 16],
            user_data: [0u8; 20],
        }
        .encode();
        quote.extend_from_slice(&crate::testing::sample_td_report().encode());
        quote.extend_from_slice(&u32::MAX.to_le_bytes());
        quote.extend_from_slice(&[0u8; 8]);
        assert_eq!(
            Quote::parse(&quote),
            Err(QuoteError::LengthOverflow("auth data"))
        );
    }

    #[test]
    fn round_trips_fixed_regions() {
        let quote_bytes = crate::testing::QuoteBuilder::new().build().quote;
        let quote = Quote::parse(&quote_bytes).expect("parse");
        // Re-encoding the header and body reproduces the signed prefix.
        assert_eq!(
            quote.signed_message(),
            &quote_bytes[..HEADER_BYTE_LEN + TD_REPORT10_BYTE_LEN]
        );
    }

    #[test]
    fn round_trips_whole_quotes() {
        let builders: [fn() -> crate::testing::QuoteBuilder; 4] = [
            crate::testing::QuoteBuilder::new,
            || crate::testing::QuoteBuilder::new().sgx(),
            || crate::testing::QuoteBuilder::new().v5_td15(),
            || crate::testing::QuoteBuilder::new().nest_chain_in_auth_data(),
        ];
        for builder in builders {
            let quote_bytes = builder().build().quote;
            let quote = Quote::parse(&quote_bytes).expect("parse");
            assert_eq!(quote.encode(), quote_bytes);
        }
    }

    #[test]
    fn parses_hex_and_base64_envelopes() {
        use base64::Engine;
        let quote_bytes = crate::testing::QuoteBuilder::new().build().quote;
        let from_hex = Quote::parse_hex(&format!("0x{}", hex::encode(&quote_bytes))).unwrap();
        let from_b64 = Quote::parse_base64(
            &base64::engine::general_purpose::STANDARD.encode(&quote_bytes),
        )
        .unwrap();
        assert_eq!(from_hex, from_b64);
        assert_eq!(from_hex.header.version, 4);
        assert_eq!(from_hex.header.tee_type, TEE_TYPE_TDX);
    }

    #[test]
    fn exposes_pem_chain_for_cert_type_5() {
        let built = crate::testing::QuoteBuilder::new().build();
        let quote = Quote::parse(&built.quote).unwrap();
        let bundle = quote.cert_chain_pem().expect("chain embedded");
        let certs = pem::parse_many(&bundle).unwrap();
        assert_eq!(certs.len(), 3);
    }

    #[test]
    fn recovers_pem_chain_from_qe_auth_data() {
        let built = crate::testing::QuoteBuilder::new()
            .nest_chain_in_auth_data()
            .build();
        let quote = Quote::parse(&built.quote).unwrap();
        let bundle = quote.cert_chain_pem().expect("chain in auth data");
        assert_eq!(pem::parse_many(&bundle).unwrap().len(), 3);
    }
}
