// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Narrow blocking interface to the TDX guest kernel collaborators.
//!
//! Two services are consumed as opaque collaborators; their ABI is the
//! kernel's concern:
//!
//! - quote generation via the ConfigFS TSM interface
//! - the auxiliary TDCALL device: `TDG.VP.INFO` (attributes, XFAM, GPA
//!   width) and iterative `TDG.SYS.RD` metadata reads

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use linux::*;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod linux;

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
pub use dummy::*;

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
mod dummy;

pub type Result<T> = std::result::Result<T, TdxGuestError>;

pub type TdxReportData = [u8; 64];

#[derive(Debug, thiserror::Error)]
pub enum TdxGuestError {
    #[error("unexpected error: {0}")]
    Unexpected(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("device busy")]
    Busy,
    #[error("device failure: {0}")]
    DeviceFailure(String),
    #[error("quote failure: {0}")]
    QuoteFailure(String),
    #[error("tdcall failed with status {0}")]
    TdcallFailed(i32),
}

/// `TDG.VP.INFO` result subset exposed by the kernel module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VpInfo {
    /// TD ATTRIBUTES bitfield.
    pub attributes: u64,
    pub xfam: u64,
    pub gpa_width: u64,
}

impl VpInfo {
    /// ATTRIBUTES bit 29, MIGRATABLE.
    pub fn migratable(&self) -> bool {
        self.attributes & (1 << 29) != 0
    }
}

/// One `TDG.SYS.RD` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SysRdStep {
    /// The field that was actually read.
    pub field_id: i64,
    pub value: u64,
    /// The next field id to query; -1 terminates the iteration.
    pub next_id: i64,
}

/// A global metadata field read via `TDG.SYS.RD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SysField {
    pub field_id: i64,
    pub value: u64,
}
