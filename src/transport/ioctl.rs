//! The kernel-module ioctl transport: pins host or device memory and
//! returns its controller-visible bus addresses. Treated as an external
//! collaborator — this module reproduces the wire contract (`include/
//! nvm_ioctl.h`-style request structs, referenced from `src/dma.c`'s
//! `map_memory`) without shipping the kernel module itself.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::error::{NvmeError, Result};

/// `MAP_HOST_MEMORY` ioctl request number (arbitrary but stable within
/// this driver's wire contract; a real deployment negotiates this with
/// the kernel module via `_IOWR`).
const IOCTL_MAP_HOST_MEMORY: libc::c_ulong = 0x4e00;
/// `MAP_DEVICE_MEMORY` ioctl request number.
const IOCTL_MAP_DEVICE_MEMORY: libc::c_ulong = 0x4e01;
/// `UNMAP_MEMORY` ioctl request number.
const IOCTL_UNMAP_MEMORY: libc::c_ulong = 0x4e02;

/// Request/response struct for `MAP_HOST_MEMORY` / `MAP_DEVICE_MEMORY`:
/// `{vaddr_start, n_pages, out_ioaddrs[]}`.
#[repr(C)]
struct MapMemoryRequest {
    vaddr_start: u64,
    n_pages: u64,
    out_ioaddrs: *mut u64,
}

/// A handle to the kernel module's character device.
pub struct IoctlTransport {
    fd: libc::c_int,
}

impl IoctlTransport {
    pub fn open(device: &Path) -> Result<IoctlTransport> {
        let c_path = CString::new(device.as_os_str().as_bytes())
            .map_err(|_| NvmeError::InvalidArgument("device path contains a NUL byte"))?;
        // SAFETY: c_path is NUL-terminated and valid for the call's duration.
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR) };
        if fd < 0 {
            return Err(NvmeError::Io(std::io::Error::last_os_error()));
        }
        Ok(IoctlTransport { fd })
    }

    fn map(&self, request_code: libc::c_ulong, vaddr: usize, n_pages: usize) -> Result<Vec<u64>> {
        let mut out_ioaddrs = vec![0u64; n_pages];
        let mut req = MapMemoryRequest {
            vaddr_start: vaddr as u64,
            n_pages: n_pages as u64,
            out_ioaddrs: out_ioaddrs.as_mut_ptr(),
        };
        // SAFETY: fd is open; req lives for the duration of the call and
        // out_ioaddrs has room for n_pages entries as req declares.
        let rc = unsafe { libc::ioctl(self.fd, request_code, &mut req as *mut MapMemoryRequest) };
        if rc != 0 {
            return Err(NvmeError::Io(std::io::Error::last_os_error()));
        }
        Ok(out_ioaddrs)
    }

    /// Pin `n_pages` host pages starting at `vaddr` and return one bus
    /// address per page.
    pub fn map_host_memory(&self, vaddr: usize, n_pages: usize) -> Result<Vec<u64>> {
        self.map(IOCTL_MAP_HOST_MEMORY, vaddr, n_pages)
    }

    /// Pin `n_pages` device pages starting at `vaddr` (CUDA build only)
    /// and return one bus address per page.
    pub fn map_device_memory(&self, vaddr: usize, n_pages: usize) -> Result<Vec<u64>> {
        self.map(IOCTL_MAP_DEVICE_MEMORY, vaddr, n_pages)
    }

    pub fn unmap_memory(&self, vaddr: usize) -> Result<()> {
        let vaddr = vaddr as u64;
        // SAFETY: fd is open; vaddr is passed by value through the pointer.
        let rc = unsafe { libc::ioctl(self.fd, IOCTL_UNMAP_MEMORY, &vaddr as *const u64) };
        if rc != 0 {
            return Err(NvmeError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for IoctlTransport {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
