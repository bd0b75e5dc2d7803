// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Stub backend for non-TDX build targets.

use crate::{Result, SysField, SysRdStep, TdxGuestError, TdxReportData, VpInfo};

fn unsupported<T>() -> Result<T> {
    Err(TdxGuestError::NotSupported(
        "TDX guest services require linux on x86_64".to_string(),
    ))
}

pub fn get_quote(_report_data: &TdxReportData) -> Result<Vec<u8>> {
    unsupported()
}

pub fn is_supported() -> bool {
    false
}

pub fn vp_info() -> Result<VpInfo> {
    unsupported()
}

pub fn sys_rd(_field_id: i64) -> Result<SysRdStep> {
    unsupported()
}

pub fn sys_rd_all() -> Result<Vec<SysField>> {
    unsupported()
}
