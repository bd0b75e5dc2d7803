// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Model of Intel's TCB info and TCB level evaluation.
//!
//! The library never fetches TCB info itself; callers obtain the JSON from
//! their provisioning service and use [`evaluate`] inside their
//! `verify_tcb` hook. Evaluation follows Intel's published algorithm: walk
//! the sorted TCB levels and pick the first whose component SVNs are all
//! covered by the platform's SVNs.

use serde::{Deserialize, Serialize};

use crate::oids::SgxExtension;
use crate::quote::Quote;

/// TCB status strings as published in Intel TCB info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TcbStatus {
    UpToDate,
    SWHardeningNeeded,
    ConfigurationNeeded,
    ConfigurationAndSWHardeningNeeded,
    OutOfDate,
    OutOfDateConfigurationNeeded,
    Revoked,
}

impl TcbStatus {
    /// Whether the status is acceptable without further qualification.
    pub fn is_up_to_date(&self) -> bool {
        matches!(self, TcbStatus::UpToDate)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcbComponent {
    pub svn: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub component_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tcb {
    #[serde(default)]
    pub sgxtcbcomponents: Vec<TcbComponent>,
    #[serde(default)]
    pub tdxtcbcomponents: Vec<TcbComponent>,
    #[serde(default)]
    pub pcesvn: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcbLevel {
    pub tcb: Tcb,
    pub tcb_date: String,
    pub tcb_status: TcbStatus,
    #[serde(default, rename = "advisoryIDs", skip_serializing_if = "Vec::is_empty")]
    pub advisory_ids: Vec<String>,
}

/// The `tcbInfo` object of Intel's TCB info response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcbInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub version: u32,
    pub issue_date: String,
    pub next_update: String,
    pub fmspc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pce_id: Option<String>,
    #[serde(default)]
    pub tcb_type: u32,
    #[serde(default)]
    pub tcb_evaluation_data_number: u32,
    pub tcb_levels: Vec<TcbLevel>,
}

/// Platform SVNs extracted from a quote and its PCK leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformTcb {
    /// SGX TCB component SVNs from the PCK leaf SGX extension.
    pub cpusvn: [u8; 16],
    /// PCESVN from the PCK leaf SGX extension.
    pub pcesvn: u16,
    /// TEE TCB SVNs from the TD report, absent for SGX quotes.
    pub tee_tcb_svn: Option<[u8; 16]>,
}

impl PlatformTcb {
    /// Collect the platform SVNs relevant for TCB evaluation.
    pub fn from_quote(quote: &Quote, sgx_extension: &SgxExtension) -> Self {
        Self {
            cpusvn: sgx_extension.tcb_components,
            pcesvn: sgx_extension.pcesvn,
            tee_tcb_svn: quote.report.as_td10().map(|td| td.tee_tcb_svn),
        }
    }
}

/// Walk the TCB levels and return the first one the platform satisfies.
///
/// Returns `None` when no level matches (unsupported TCB) or when the
/// FMSPC of the TCB info does not match `fmspc_hex`.
pub fn evaluate<'a>(
    tcb_info: &'a TcbInfo,
    platform: &PlatformTcb,
    fmspc_hex: &str,
) -> Option<&'a TcbLevel> {
    if !tcb_info.fmspc.eq_ignore_ascii_case(fmspc_hex) {
        return None;
    }
    tcb_info.tcb_levels.iter().find(|level| {
        let sgx_ok = level
            .tcb
            .sgxtcbcomponents
            .iter()
            .zip(platform.cpusvn.iter())
            .all(|(required, platform_svn)| *platform_svn >= required.svn);
        let pce_ok = platform.pcesvn >= level.tcb.pcesvn;
        let tdx_ok = match (&platform.tee_tcb_svn, level.tcb.tdxtcbcomponents.is_empty()) {
            (Some(tee_tcb_svn), false) => level
                .tcb
                .tdxtcbcomponents
                .iter()
                .zip(tee_tcb_svn.iter())
                .all(|(required, platform_svn)| *platform_svn >= required.svn),
            // SGX platforms ignore TDX components and vice versa.
            _ => true,
        };
        sgx_ok && pce_ok && tdx_ok
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn components(svns: &[u8]) -> Vec<TcbComponent> {
        svns.iter()
            .map(|&svn| TcbComponent {
                svn,
                category: None,
                component_type: None,
            })
            .collect()
    }

    fn tcb_info(fmspc: &str, levels: Vec<TcbLevel>) -> TcbInfo {
        TcbInfo {
            id: Some("SGX".to_string()),
            version: 3,
            issue_date: "2025-09-01T00:00:00Z".to_string(),
            next_update: "2025-10-01T00:00:00Z".to_string(),
            fmspc: fmspc.to_string(),
            pce_id: Some("0000".to_string()),
            tcb_type: 0,
            tcb_evaluation_data_number: 17,
            tcb_levels: levels,
        }
    }

    fn level(status: TcbStatus, svns: &[u8], pcesvn: u16) -> TcbLevel {
        TcbLevel {
            tcb: Tcb {
                sgxtcbcomponents: components(svns),
                tdxtcbcomponents: vec![],
                pcesvn,
            },
            tcb_date: "2024-03-13T00:00:00Z".to_string(),
            tcb_status: status,
            advisory_ids: vec![],
        }
    }

    #[test]
    fn parses_intel_shaped_json() {
        let json = r#"{
            "id": "SGX",
            "version": 3,
            "issueDate": "2025-09-01T00:00:00Z",
            "nextUpdate": "2025-10-01T00:00:00Z",
            "fmspc": "30606a000000",
            "pceId": "0000",
            "tcbType": 0,
            "tcbEvaluationDataNumber": 17,
            "tcbLevels": [
                {
                    "tcb": {
                        "sgxtcbcomponents": [
                            {"svn": 3, "category": "BIOS"},
                            {"svn": 3}
                        ],
                        "pcesvn": 11
                    },
                    "tcbDate": "2024-03-13T00:00:00Z",
                    "tcbStatus": "SWHardeningNeeded",
                    "advisoryIDs": ["INTEL-SA-00615"]
                }
            ]
        }"#;
        let info: TcbInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.fmspc, "30606a000000");
        assert_eq!(info.tcb_levels[0].tcb_status, TcbStatus::SWHardeningNeeded);
        assert_eq!(info.tcb_levels[0].advisory_ids, ["INTEL-SA-00615"]);
    }

    #[test]
    fn sw_hardening_level_matches_occlum_platform() {
        // An SGX platform whose SVNs only reach the SWHardeningNeeded level.
        let info = tcb_info(
            "30606a000000",
            vec![
                level(TcbStatus::UpToDate, &[9, 9, 2, 2], 13),
                level(TcbStatus::SWHardeningNeeded, &[3, 3, 2, 2], 11),
                level(TcbStatus::OutOfDate, &[1, 1, 0, 0], 5),
            ],
        );
        let mut cpusvn = [0u8; 16];
        cpusvn[..4].copy_from_slice(&[3, 3, 2, 2]);
        let platform = PlatformTcb {
            cpusvn,
            pcesvn: 11,
            tee_tcb_svn: None,
        };
        let matched = evaluate(&info, &platform, "30606a000000").expect("level");
        assert_eq!(matched.tcb_status, TcbStatus::SWHardeningNeeded);
        // A strict policy hook would reject this platform.
        assert!(!matched.tcb_status.is_up_to_date());
    }

    #[test]
    fn outdated_tdx_platform_matches_out_of_date_level() {
        let mut up_to_date = level(TcbStatus::UpToDate, &[5, 5], 13);
        up_to_date.tcb.tdxtcbcomponents = components(&[5, 5]);
        let mut out_of_date = level(TcbStatus::OutOfDate, &[2, 2], 5);
        out_of_date.tcb.tdxtcbcomponents = components(&[2, 2]);
        let info = tcb_info("00806f050000", vec![up_to_date, out_of_date]);

        let mut cpusvn = [0u8; 16];
        cpusvn[..2].copy_from_slice(&[2, 2]);
        let mut tee_tcb_svn = [0u8; 16];
        tee_tcb_svn[..2].copy_from_slice(&[2, 2]);
        let platform = PlatformTcb {
            cpusvn,
            pcesvn: 5,
            tee_tcb_svn: Some(tee_tcb_svn),
        };
        let matched = evaluate(&info, &platform, "00806f050000").expect("level");
        assert_eq!(matched.tcb_status, TcbStatus::OutOfDate);
    }

    #[test]
    fn unsupported_platform_matches_no_level() {
        let info = tcb_info("00806f050000", vec![level(TcbStatus::UpToDate, &[9], 13)]);
        let platform = PlatformTcb {
            cpusvn: [0u8; 16],
            pcesvn: 0,
            tee_tcb_svn: None,
        };
        assert!(evaluate(&info, &platform, "00806f050000").is_none());
    }

    #[test]
    fn fmspc_mismatch_matches_no_level() {
        let info = tcb_info("00806f050000", vec![level(TcbStatus::UpToDate, &[0], 0)]);
        let platform = PlatformTcb {
            cpusvn: [9u8; 16],
            pcesvn: 99,
            tee_tcb_svn: None,
        };
        assert!(evaluate(&info, &platform, "30606a000000").is_none());
    }
}
