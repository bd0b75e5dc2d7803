// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Linux backend: ConfigFS TSM quote generation and the auxiliary TDCALL
//! device.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use crate::{Result, SysField, SysRdStep, TdxGuestError, TdxReportData, VpInfo};

const TSM_REPORT_ROOT: &str = "/sys/kernel/config/tsm/report";
const TSM_REPORT_NAME: &str = "com.intel.dcap";
const TSM_PROVIDER: &str = "tdx_guest";

const TDX_GUEST_AUX_DEVICE: &str = "/dev/tdx_guest_aux";

const QUOTE_MIN_LEN: usize = 1020;
const QUOTE_MAX_LEN: usize = 8 * 1024;

/// How long to wait for the kernel to produce an outblob.
const REPORT_WAIT_LIMIT: Duration = Duration::from_secs(30);

/// Report generation is serialized per process; the kernel additionally
/// arbitrates between processes via the generation counter.
static REPORT_LOCK: Mutex<()> = Mutex::new(());

/// Get a TDX quote for the given report data via the ConfigFS TSM
/// interface (Linux 6.7+).
pub fn get_quote(report_data: &TdxReportData) -> Result<Vec<u8>> {
    let _guard = REPORT_LOCK.lock().map_err(|_| TdxGuestError::Busy)?;
    let report = TsmReport::open()?;
    let quote = report.request(report_data)?;
    if !(QUOTE_MIN_LEN..=QUOTE_MAX_LEN).contains(&quote.len()) {
        return Err(TdxGuestError::QuoteFailure(format!(
            "implausible quote length {}",
            quote.len()
        )));
    }
    Ok(quote)
}

/// Whether quote generation is available on this machine.
pub fn is_supported() -> bool {
    Path::new(TSM_REPORT_ROOT).is_dir()
}

/// One report directory under the ConfigFS TSM root.
struct TsmReport {
    dir: PathBuf,
}

impl TsmReport {
    /// Locate the report directory, materializing it on first use.
    fn open() -> Result<Self> {
        let dir = Path::new(TSM_REPORT_ROOT).join(TSM_REPORT_NAME);
        if !dir.is_dir() {
            if !Path::new(TSM_REPORT_ROOT).is_dir() {
                return Err(TdxGuestError::NotSupported(
                    "no tsm report support under /sys/kernel/config".to_string(),
                ));
            }
            // mkdir makes the kernel materialize the report attributes;
            // losing the race to another process is fine.
            if let Err(e) = fs::create_dir(&dir) {
                if !dir.is_dir() {
                    return Err(TdxGuestError::NotSupported(format!(
                        "tsm report directory could not be created: {e}"
                    )));
                }
            }
        }
        let report = Self { dir };
        report.check_provider()?;
        Ok(report)
    }

    fn attr(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// The provider attribute may appear shortly after mkdir.
    fn check_provider(&self) -> Result<()> {
        let path = self.attr("provider");
        for _ in 0..50 {
            match fs::read_to_string(&path) {
                Ok(provider) => {
                    let provider = provider.trim();
                    if provider.starts_with(TSM_PROVIDER) {
                        return Ok(());
                    }
                    return Err(TdxGuestError::NotSupported(format!(
                        "tsm reports are backed by {provider}, not {TSM_PROVIDER}"
                    )));
                }
                Err(_) => thread::sleep(Duration::from_millis(1)),
            }
        }
        Err(TdxGuestError::NotSupported(
            "tsm provider attribute never appeared".to_string(),
        ))
    }

    fn generation(&self) -> Result<u64> {
        let path = self.attr("generation");
        let raw = fs::read_to_string(&path).map_err(|e| {
            TdxGuestError::Unexpected(format!("generation counter unreadable: {e}"))
        })?;
        raw.trim().parse().map_err(|e| {
            TdxGuestError::Unexpected(format!("generation counter malformed: {e}"))
        })
    }

    /// Submit the report data and collect the resulting quote. The
    /// generation counter must move by exactly one across the exchange,
    /// otherwise another requester interleaved and the blob is not ours.
    fn request(&self, report_data: &TdxReportData) -> Result<Vec<u8>> {
        let inblob_path = self.attr("inblob");
        let mut inblob = OpenOptions::new()
            .write(true)
            .open(&inblob_path)
            .map_err(|e| TdxGuestError::Unexpected(format!("tsm inblob unavailable: {e}")))?;
        if unsafe { libc::flock(inblob.as_raw_fd(), libc::LOCK_EX) } != 0 {
            let err = std::io::Error::last_os_error();
            return Err(TdxGuestError::Unexpected(format!(
                "could not lock tsm inblob: {err}"
            )));
        }

        let before = self.generation()?;
        inblob.write_all(report_data).map_err(|e| {
            if e.raw_os_error() == Some(libc::EBUSY) {
                TdxGuestError::Busy
            } else {
                TdxGuestError::Unexpected(format!("report data rejected: {e}"))
            }
        })?;

        let after = self.wait_for_bump(before)?;
        if after != before + 1 {
            return Err(TdxGuestError::Busy);
        }

        let quote = fs::read(self.attr("outblob"))
            .map_err(|e| TdxGuestError::QuoteFailure(format!("tsm outblob unreadable: {e}")))?;
        if quote.is_empty() {
            return Err(TdxGuestError::QuoteFailure("tsm outblob is empty".to_string()));
        }
        if self.generation()? != after {
            // Someone else raced us between write and read.
            return Err(TdxGuestError::Busy);
        }
        Ok(quote)
    }

    fn wait_for_bump(&self, before: u64) -> Result<u64> {
        let started = Instant::now();
        loop {
            let current = self.generation()?;
            if current != before {
                return Ok(current);
            }
            if started.elapsed() > REPORT_WAIT_LIMIT {
                return Err(TdxGuestError::QuoteFailure(
                    "quote generation stalled".to_string(),
                ));
            }
            thread::sleep(Duration::from_micros(1));
        }
    }
}

// ioctl request type varies between glibc and musl
#[cfg(target_env = "musl")]
type IoctlRequest = libc::c_int;
#[cfg(not(target_env = "musl"))]
type IoctlRequest = libc::c_ulong;

// ioctl command encoding
const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> IoctlRequest {
    (((dir as IoctlRequest) << 30)
        | ((ty as IoctlRequest) << 8)
        | (nr as IoctlRequest)
        | ((size as IoctlRequest) << 16)) as IoctlRequest
}

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

fn ior<T>(ty: u8, nr: u8) -> IoctlRequest {
    ioc(IOC_READ, ty, nr, std::mem::size_of::<T>())
}

fn iowr<T>(ty: u8, nr: u8) -> IoctlRequest {
    ioc(IOC_READ | IOC_WRITE, ty, nr, std::mem::size_of::<T>())
}

const TDXGA_IOC_BASE: u8 = 0xF5;

fn tdxga_cmd_vp_info() -> IoctlRequest {
    ior::<TdxVpInfoOut>(TDXGA_IOC_BASE, 0x01)
}

fn tdxga_cmd_sys_rd() -> IoctlRequest {
    iowr::<TdxSysRdArg>(TDXGA_IOC_BASE, 0x02)
}

// Layouts match the kernel UAPI header.

#[repr(C)]
struct TdxVpInfoOut {
    attributes: u64,
    xfam: u64,
    gpa_width: u64,
    tdcall_status: i32,
}

#[repr(C)]
struct TdxSysRdArg {
    field_id_in: i64,
    field_id_out: i64,
    next_id: i64,
    value: u64,
    tdcall_status: i32,
}

fn open_aux_device() -> Result<std::fs::File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(TDX_GUEST_AUX_DEVICE)
        .map_err(|e| {
            TdxGuestError::DeviceFailure(format!(
                "auxiliary device {TDX_GUEST_AUX_DEVICE} unavailable: {e}"
            ))
        })
}

/// Query `TDG.VP.INFO` through the auxiliary device.
pub fn vp_info() -> Result<VpInfo> {
    let device = open_aux_device()?;
    let mut out = TdxVpInfoOut {
        attributes: 0,
        xfam: 0,
        gpa_width: 0,
        tdcall_status: 0,
    };
    if unsafe { libc::ioctl(device.as_raw_fd(), tdxga_cmd_vp_info(), &mut out) } != 0 {
        let err = std::io::Error::last_os_error();
        return Err(TdxGuestError::DeviceFailure(format!(
            "VP.INFO ioctl failed: {err}"
        )));
    }
    if out.tdcall_status != 0 {
        return Err(TdxGuestError::TdcallFailed(out.tdcall_status));
    }
    Ok(VpInfo {
        attributes: out.attributes,
        xfam: out.xfam,
        gpa_width: out.gpa_width,
    })
}

/// One `TDG.SYS.RD` step. Pass -1 to read the first field.
pub fn sys_rd(field_id: i64) -> Result<SysRdStep> {
    let device = open_aux_device()?;
    sys_rd_with(&device, field_id)
}

fn sys_rd_with(device: &std::fs::File, field_id: i64) -> Result<SysRdStep> {
    let mut arg = TdxSysRdArg {
        field_id_in: field_id,
        field_id_out: 0,
        next_id: 0,
        value: 0,
        tdcall_status: 0,
    };
    if unsafe { libc::ioctl(device.as_raw_fd(), tdxga_cmd_sys_rd(), &mut arg) } != 0 {
        let err = std::io::Error::last_os_error();
        return Err(TdxGuestError::DeviceFailure(format!(
            "SYS.RD ioctl failed: {err}"
        )));
    }
    if arg.tdcall_status != 0 {
        return Err(TdxGuestError::TdcallFailed(arg.tdcall_status));
    }
    Ok(SysRdStep {
        field_id: arg.field_id_out,
        value: arg.value,
        next_id: arg.next_id,
    })
}

/// Iterate `TDG.SYS.RD` over all global metadata fields, terminating when
/// the kernel reports -1 as the next id.
pub fn sys_rd_all() -> Result<Vec<SysField>> {
    let device = open_aux_device()?;
    let mut fields = Vec::new();
    let mut field_id = -1i64;
    loop {
        let step = sys_rd_with(&device, field_id)?;
        fields.push(SysField {
            field_id: step.field_id,
            value: step.value,
        });
        if step.next_id == -1 {
            return Ok(fields);
        }
        field_id = step.next_id;
    }
}
