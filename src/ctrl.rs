//! Controller lifecycle: mapping the register window, validating page-size
//! compatibility, and running the reset sequence (`src/ctrl.c` in the
//! original driver: `initialize_handle`, `nvm_raw_ctrl_reset`).
//!
//! A [`Controller`] is immutable after construction except through
//! [`Controller::reset`]; its register window is never shared, matching
//! the "owned exclusively by the controller handle" resource policy.

use std::path::Path;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::{NvmeError, Result};
use crate::regs::{AdminQueueAttributes, Configuration, RegisterWindow};

/// How a controller's register window was obtained; determines how it is
/// torn down.
#[derive(Debug)]
pub enum ControllerSource {
    /// Caller supplied an already-mapped pointer; this handle does not
    /// own the mapping and will not unmap it.
    Manual,
    /// Mapped by this crate via `open`+`mmap` on a device file; unmapped
    /// and closed on drop.
    FileDescriptor { fd: libc::c_int, map_len: usize },
    /// Obtained from a remote transport's BAR0 segment; ownership of the
    /// underlying mapping belongs to that transport.
    Remote,
}

/// A mapped, reset-ready NVMe controller register window.
pub struct Controller {
    regs: RegisterWindow,
    page_size: usize,
    doorbell_stride: u32,
    timeout_ms: u64,
    max_entries: u32,
    version: u32,
    mpsmin: u32,
    cqr: bool,
    source: ControllerSource,
}

impl Controller {
    fn from_window(regs: RegisterWindow, host_page_size: usize, source: ControllerSource) -> Result<Controller> {
        let cap = regs.read_cap()?;
        let exponent = log2_exact(host_page_size / 4096)
            .ok_or(NvmeError::Range("host page size is not a power of two multiple of 4096"))?;
        if exponent < cap.mpsmin() || exponent > cap.mpsmax() {
            return Err(NvmeError::Range(
                "host page size falls outside CAP.MPSMIN..=CAP.MPSMAX",
            ));
        }
        let version = regs.read_version()?;
        let ctrl = Controller {
            page_size: host_page_size,
            doorbell_stride: 4 << cap.dstrd(),
            timeout_ms: cap.timeout_ms(),
            max_entries: cap.mqes(),
            version,
            mpsmin: cap.mpsmin(),
            cqr: cap.flags().contains(crate::regs::CapFlags::CQR),
            regs,
            source,
        };
        debug!(
            "mapped controller: page_size={} dstrd={} timeout_ms={} max_entries={} version=0x{:08x}",
            ctrl.page_size, ctrl.doorbell_stride, ctrl.timeout_ms, ctrl.max_entries, ctrl.version
        );
        Ok(ctrl)
    }

    /// Wrap an already-mapped register window. The caller retains
    /// ownership of the mapping.
    ///
    /// # Safety
    /// `ptr` must point to at least [`crate::regs::REGISTER_WINDOW_MIN_SIZE`]
    /// bytes of valid, exclusively-owned device memory.
    pub unsafe fn from_mapped(ptr: *mut u8, len: usize, host_page_size: usize) -> Result<Controller> {
        let regs = RegisterWindow::new(ptr, len)?;
        Self::from_window(regs, host_page_size, ControllerSource::Manual)
    }

    /// Open and `mmap` a device file exposing the controller's BAR0
    /// register window (e.g. a VFIO or UIO resource file).
    pub fn from_device_file(path: &Path, host_page_size: usize) -> Result<Controller> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| NvmeError::InvalidArgument("device path contains a NUL byte"))?;
        let map_len = crate::regs::REGISTER_WINDOW_MIN_SIZE;
        // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_NONBLOCK) };
        if fd < 0 {
            return Err(NvmeError::Io(std::io::Error::last_os_error()));
        }
        // SAFETY: fd is open and valid; the mapping is released on drop.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(NvmeError::Io(err));
        }
        let regs = unsafe { RegisterWindow::new(ptr as *mut u8, map_len)? };
        Self::from_window(
            regs,
            host_page_size,
            ControllerSource::FileDescriptor { fd, map_len },
        )
    }

    /// Wrap a register window obtained from a remote transport (the
    /// cluster-interconnect BAR0 segment). The transport retains ownership
    /// of the mapping.
    ///
    /// # Safety
    /// Same obligations as [`Controller::from_mapped`].
    pub unsafe fn from_remote_mapping(ptr: *mut u8, len: usize, host_page_size: usize) -> Result<Controller> {
        let regs = RegisterWindow::new(ptr, len)?;
        Self::from_window(regs, host_page_size, ControllerSource::Remote)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn doorbell_stride(&self) -> u32 {
        self.doorbell_stride
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn max_entries(&self) -> u32 {
        self.max_entries
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn mpsmin(&self) -> u32 {
        self.mpsmin
    }

    /// CAP.CQR: whether the controller requires physically contiguous
    /// queue memory.
    pub fn contiguous_queues_required(&self) -> bool {
        self.cqr
    }

    pub fn registers(&self) -> &RegisterWindow {
        &self.regs
    }

    pub fn doorbell_offset(&self, index: u32) -> usize {
        crate::regs::DOORBELL_BASE + index as usize * self.doorbell_stride as usize
    }

    /// Run the controller reset sequence: disable, wait for not-ready,
    /// program the admin queue registers, enable, wait for ready.
    ///
    /// Both admin queues must already be zero-filled by the caller so the
    /// initial CQ phase tag reads as 0 before the controller's first write.
    pub fn reset(&self, asq_addr: u64, acq_addr: u64, asq_entries: u32, acq_entries: u32) -> Result<()> {
        info!("resetting controller (asq_entries={asq_entries} acq_entries={acq_entries})");
        self.regs.write_cc(Configuration::disabled())?;
        self.wait_for_ready(false)?;

        self.regs
            .write_aqa(AdminQueueAttributes::new(asq_entries, acq_entries))?;
        self.regs.write_asq(asq_addr)?;
        self.regs.write_acq(acq_addr)?;

        let mps = log2_exact(self.page_size / 4096)
            .expect("page_size validated as a power-of-two multiple of 4096 at construction");
        // IOSQES=log2(64)=6, IOCQES=log2(16)=4, CSS=0 (NVM command set).
        self.regs.write_cc(Configuration::enable(mps, 6, 4))?;
        self.wait_for_ready(true)?;

        info!("controller reset complete");
        Ok(())
    }

    fn wait_for_ready(&self, want: bool) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(self.timeout_ms);
        loop {
            let csts = self.regs.read_csts()?;
            if csts.fatal() {
                warn!("CSTS.CFS set during reset");
            }
            if csts.ready() == want {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(NvmeError::Timeout(self.timeout_ms));
            }
            std::thread::yield_now();
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let ControllerSource::FileDescriptor { fd, map_len } = &self.source {
            unsafe {
                libc::munmap(self.regs.raw_ptr() as *mut libc::c_void, *map_len);
                libc::close(*fd);
            }
        }
    }
}

fn log2_exact(value: usize) -> Option<u32> {
    if value == 0 || !value.is_power_of_two() {
        return None;
    }
    Some(value.trailing_zeros())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log2_exact_accepts_only_powers_of_two() {
        assert_eq!(log2_exact(1), Some(0));
        assert_eq!(log2_exact(4), Some(2));
        assert_eq!(log2_exact(3), None);
        assert_eq!(log2_exact(0), None);
    }

    fn cap_bits(mqes: u16, to: u8, dstrd: u8, mpsmin: u8, mpsmax: u8) -> u64 {
        mqes as u64
            | ((to as u64) << 24)
            | ((dstrd as u64) << 32)
            | ((mpsmin as u64) << 48)
            | ((mpsmax as u64) << 52)
    }

    #[test]
    fn page_size_outside_cap_range_is_rejected() {
        let mut buf = vec![0u8; crate::regs::REGISTER_WINDOW_MIN_SIZE];
        // MPSMIN=1, MPSMAX=2 -> host page sizes of 8192 or 16384 only.
        let cap = cap_bits(63, 1, 0, 1, 2);
        buf[0..8].copy_from_slice(&cap.to_le_bytes());
        let ptr = buf.as_mut_ptr();
        let result = unsafe { Controller::from_mapped(ptr, buf.len(), 4096) };
        assert!(matches!(result, Err(NvmeError::Range(_))));
    }

    #[test]
    fn compatible_page_size_constructs_and_caches_fields() {
        let mut buf = vec![0u8; crate::regs::REGISTER_WINDOW_MIN_SIZE];
        let cap = cap_bits(63, 2, 0, 0, 4);
        buf[0..8].copy_from_slice(&cap.to_le_bytes());
        let ptr = buf.as_mut_ptr();
        let ctrl = unsafe { Controller::from_mapped(ptr, buf.len(), 4096).unwrap() };
        assert_eq!(ctrl.page_size(), 4096);
        assert_eq!(ctrl.doorbell_stride(), 4);
        assert_eq!(ctrl.timeout_ms(), 1000);
        assert_eq!(ctrl.max_entries(), 64);
    }

    /// A raw pointer wrapper so the stub-hardware thread in the reset
    /// tests below can share the backing buffer with the `Controller`
    /// under test; both sides only ever touch CC/CSTS through ordinary
    /// (non-volatile) byte writes, which is fine for a single-threaded
    /// producer racing a polling consumer in a test.
    struct RawBuf(*mut u8);
    unsafe impl Send for RawBuf {}

    /// S2: a register stub where clearing CC.EN flips CSTS.RDY to 0 after
    /// a few milliseconds, and setting CC.EN flips it to 1 after a few
    /// more; reset must succeed and must have programmed AQA/ASQ/ACQ.
    #[test]
    fn reset_succeeds_against_a_stub_that_eventually_becomes_ready() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let mut buf = vec![0u8; crate::regs::REGISTER_WINDOW_MIN_SIZE];
        // CAP.TO=1 -> 500ms timeout, MPSMIN=0, MPSMAX=4.
        let cap = cap_bits(63, 1, 0, 0, 4);
        buf[0..8].copy_from_slice(&cap.to_le_bytes());
        // Controller starts "ready" so the initial CSTS.RDY->0 wait has
        // something to transition away from.
        buf[0x1C] = 0x01;
        let ptr = buf.as_mut_ptr();
        let raw = RawBuf(ptr);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_bg = stop.clone();

        let bg = std::thread::spawn(move || {
            let raw = raw;
            loop {
                if stop_bg.load(Ordering::SeqCst) {
                    return;
                }
                let cc_en = unsafe { *raw.0.add(0x14) } & 0x1;
                let csts_rdy = unsafe { *raw.0.add(0x1C) } & 0x1;
                if cc_en == 0 && csts_rdy == 1 {
                    std::thread::sleep(Duration::from_millis(2));
                    unsafe { *raw.0.add(0x1C) &= !0x1 };
                } else if cc_en == 1 && csts_rdy == 0 {
                    std::thread::sleep(Duration::from_millis(2));
                    unsafe { *raw.0.add(0x1C) |= 0x1 };
                }
                std::thread::yield_now();
            }
        });

        let ctrl = unsafe { Controller::from_mapped(ptr, buf.len(), 4096).unwrap() };
        let result = ctrl.reset(0x1234_0000, 0x5678_0000, 64, 64);
        stop.store(true, Ordering::SeqCst);
        bg.join().unwrap();

        result.unwrap();
        assert!(ctrl.registers().read_csts().unwrap().ready());
        let asq = u64::from_le_bytes(buf[0x28..0x30].try_into().unwrap());
        let acq = u64::from_le_bytes(buf[0x30..0x38].try_into().unwrap());
        assert_eq!(asq, 0x1234_0000);
        assert_eq!(acq, 0x5678_0000);
    }

    /// I11: a register stub whose CSTS.RDY never transitions causes
    /// `reset` to fail with `ErrTimeout` within `timeout_ms` (plus slack
    /// for the poll interval), not hang forever.
    #[test]
    fn reset_times_out_when_csts_never_becomes_ready() {
        let mut buf = vec![0u8; crate::regs::REGISTER_WINDOW_MIN_SIZE];
        // CAP.TO=1 -> 500ms timeout.
        let cap = cap_bits(63, 1, 0, 0, 4);
        buf[0..8].copy_from_slice(&cap.to_le_bytes());
        let ptr = buf.as_mut_ptr();
        let ctrl = unsafe { Controller::from_mapped(ptr, buf.len(), 4096).unwrap() };

        let start = Instant::now();
        let result = ctrl.reset(0x1000, 0x2000, 64, 64);
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(NvmeError::Timeout(500))));
        // Generous slack above the 500ms timeout for scheduling jitter,
        // but well short of "hung forever".
        assert!(elapsed < Duration::from_secs(5));
    }
}
