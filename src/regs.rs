//! Typed access to the NVMe controller register window (NVMe 1.x,
//! `include/nvm_util.h` / `src/regs.h` in the original C driver).
//!
//! The register block is at least [`REGISTER_WINDOW_MIN_SIZE`] bytes and is
//! mapped as device memory (manual pointer, `/dev/...` mmap, or a remote
//! PCI BAR0 segment — see [`crate::ctrl`]). All access goes through
//! [`volatile::Volatile`] so reads and writes are never reordered or
//! elided by the compiler, matching the "explicit memory-mapped read/write"
//! requirement for doorbells and controller registers.

use bitflags::bitflags;
use volatile::Volatile;

use crate::error::{NvmeError, Result};

/// Minimum size of the mapped controller register window.
pub const REGISTER_WINDOW_MIN_SIZE: usize = 0x2000;

/// Offset of the doorbell array within the register window.
pub const DOORBELL_BASE: usize = 0x1000;

const CAP: usize = 0x00;
const VS: usize = 0x08;
const CC: usize = 0x14;
const CSTS: usize = 0x1C;
const AQA: usize = 0x24;
const ASQ: usize = 0x28;
const ACQ: usize = 0x30;

bitflags! {
    /// Single-bit flags of the Controller Capabilities register (CAP).
    /// Multi-bit fields (MQES, TO, DSTRD, MPSMIN, MPSMAX) are pulled out
    /// with plain shift/mask accessors on [`Capabilities`] instead, since
    /// `bitflags` models flag sets rather than numeric subfields.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CapFlags: u64 {
        /// Contiguous Queues Required.
        const CQR   = 1 << 16;
        /// NVM Subsystem Reset Supported.
        const NSSRS = 1 << 36;
    }
}

bitflags! {
    /// Single-bit flags of the Controller Configuration register (CC).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CcFlags: u32 {
        /// Enable.
        const EN = 1 << 0;
    }
}

bitflags! {
    /// Single-bit flags of the Controller Status register (CSTS).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CstsFlags: u32 {
        /// Ready.
        const RDY = 1 << 0;
        /// Controller Fatal Status.
        const CFS = 1 << 1;
    }
}

/// Decoded Controller Capabilities register (CAP, offset 0x00).
#[derive(Clone, Copy, Debug)]
pub struct Capabilities(pub u64);

impl Capabilities {
    /// Maximum Queue Entries Supported, converted from its 0's-based
    /// encoding: the controller supports `mqes()` entries per queue.
    pub fn mqes(self) -> u32 {
        (self.0 & 0xffff) as u32 + 1
    }

    pub fn flags(self) -> CapFlags {
        CapFlags::from_bits_truncate(self.0)
    }

    /// Worst-case command timeout, already converted from 500ms units.
    pub fn timeout_ms(self) -> u64 {
        ((self.0 >> 24) & 0xff) * 500
    }

    /// Doorbell stride exponent (DSTRD); the doorbell stride in bytes is
    /// `4 << dstrd()`.
    pub fn dstrd(self) -> u32 {
        ((self.0 >> 32) & 0xf) as u32
    }

    /// Minimum supported memory page size exponent above 12.
    pub fn mpsmin(self) -> u32 {
        ((self.0 >> 48) & 0xf) as u32
    }

    /// Maximum supported memory page size exponent above 12.
    pub fn mpsmax(self) -> u32 {
        ((self.0 >> 52) & 0xf) as u32
    }
}

/// Decoded Controller Configuration register (CC, offset 0x14).
#[derive(Clone, Copy, Debug, Default)]
pub struct Configuration(pub u32);

impl Configuration {
    pub fn flags(self) -> CcFlags {
        CcFlags::from_bits_truncate(self.0)
    }

    /// Build a CC value that enables the controller with the given
    /// memory page size exponent, admin/IO queue entry size log2 values,
    /// and the NVM command set selected (CSS = 0).
    pub fn enable(mps: u32, iosqes_log2: u32, iocqes_log2: u32) -> Configuration {
        let mut bits = CcFlags::EN.bits();
        bits |= (mps & 0xf) << 7;
        bits |= (iosqes_log2 & 0xf) << 16;
        bits |= (iocqes_log2 & 0xf) << 20;
        Configuration(bits)
    }

    pub fn disabled() -> Configuration {
        Configuration(0)
    }
}

/// Decoded Controller Status register (CSTS, offset 0x1C).
#[derive(Clone, Copy, Debug)]
pub struct Status(pub u32);

impl Status {
    pub fn flags(self) -> CstsFlags {
        CstsFlags::from_bits_truncate(self.0)
    }

    pub fn ready(self) -> bool {
        self.flags().contains(CstsFlags::RDY)
    }

    pub fn fatal(self) -> bool {
        self.flags().contains(CstsFlags::CFS)
    }
}

/// Admin Queue Attributes register (AQA, offset 0x24): admin completion
/// and submission queue sizes, each encoded 0's-based.
#[derive(Clone, Copy, Debug)]
pub struct AdminQueueAttributes(pub u32);

impl AdminQueueAttributes {
    pub fn new(sq_entries: u32, cq_entries: u32) -> AdminQueueAttributes {
        AdminQueueAttributes(((cq_entries - 1) << 16) | (sq_entries - 1))
    }
}

/// Owning handle to a mapped NVMe register window.
///
/// The window is owned exclusively by the [`crate::ctrl::Controller`] that
/// created it; no locking is required for register access beyond the
/// ordering the volatile primitives already provide.
pub struct RegisterWindow {
    ptr: *mut u8,
    len: usize,
}

// The register window is plain device memory; nothing here refers to
// thread-local state, and the controller handle above it arbitrates access.
unsafe impl Send for RegisterWindow {}
unsafe impl Sync for RegisterWindow {}

impl RegisterWindow {
    /// Wrap an already-mapped pointer. `len` must be at least
    /// [`REGISTER_WINDOW_MIN_SIZE`].
    ///
    /// # Safety
    /// `ptr` must point to `len` bytes of valid, exclusively-owned device
    /// memory for the lifetime of the returned `RegisterWindow`.
    pub unsafe fn new(ptr: *mut u8, len: usize) -> Result<RegisterWindow> {
        if len < REGISTER_WINDOW_MIN_SIZE {
            return Err(NvmeError::InvalidArgument(
                "register window smaller than NVM_CTRL_MEM_MINSIZE",
            ));
        }
        Ok(RegisterWindow { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Raw base pointer, for transports that must `munmap` the window
    /// themselves on teardown.
    pub fn raw_ptr(&self) -> *mut u8 {
        self.ptr
    }

    fn check(&self, offset: usize, width: usize) -> Result<()> {
        if offset.checked_add(width).map_or(true, |end| end > self.len) {
            return Err(NvmeError::InvalidArgument("register access out of bounds"));
        }
        Ok(())
    }

    unsafe fn vol32(&self, offset: usize) -> Volatile<&mut u32> {
        Volatile::new(&mut *(self.ptr.add(offset) as *mut u32))
    }

    unsafe fn vol64(&self, offset: usize) -> Volatile<&mut u64> {
        Volatile::new(&mut *(self.ptr.add(offset) as *mut u64))
    }

    fn read32(&self, offset: usize) -> Result<u32> {
        self.check(offset, 4)?;
        Ok(unsafe { self.vol32(offset) }.read())
    }

    fn write32(&self, offset: usize, value: u32) -> Result<()> {
        self.check(offset, 4)?;
        unsafe { self.vol32(offset) }.write(value);
        Ok(())
    }

    fn read64(&self, offset: usize) -> Result<u64> {
        self.check(offset, 8)?;
        Ok(unsafe { self.vol64(offset) }.read())
    }

    fn write64(&self, offset: usize, value: u64) -> Result<()> {
        self.check(offset, 8)?;
        unsafe { self.vol64(offset) }.write(value);
        Ok(())
    }

    pub fn read_cap(&self) -> Result<Capabilities> {
        self.read64(CAP).map(Capabilities)
    }

    pub fn read_version(&self) -> Result<u32> {
        self.read32(VS)
    }

    pub fn read_cc(&self) -> Result<Configuration> {
        self.read32(CC).map(Configuration)
    }

    pub fn write_cc(&self, cc: Configuration) -> Result<()> {
        self.write32(CC, cc.0)
    }

    pub fn read_csts(&self) -> Result<Status> {
        self.read32(CSTS).map(Status)
    }

    pub fn write_aqa(&self, aqa: AdminQueueAttributes) -> Result<()> {
        self.write32(AQA, aqa.0)
    }

    pub fn write_asq(&self, bus_addr: u64) -> Result<()> {
        self.write64(ASQ, bus_addr)
    }

    pub fn write_acq(&self, bus_addr: u64) -> Result<()> {
        self.write64(ACQ, bus_addr)
    }

    /// Doorbell register offset for a queue's tail (SQ) or head (CQ).
    /// `index` is `2*qid` for an SQ tail doorbell and `2*qid + 1` for a CQ
    /// head doorbell, matching the interleaved layout at 0x1000.
    pub fn doorbell_offset(index: u32, stride: u32) -> usize {
        DOORBELL_BASE + (index as usize) * ((4usize << stride))
    }

    pub fn write_doorbell(&self, offset: usize, value: u32) -> Result<()> {
        self.write32(offset, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backing_window(len: usize) -> (Vec<u8>, RegisterWindow) {
        let mut buf = vec![0u8; len];
        let ptr = buf.as_mut_ptr();
        let win = unsafe { RegisterWindow::new(ptr, len).unwrap() };
        (buf, win)
    }

    #[test]
    fn rejects_undersized_window() {
        let mut buf = vec![0u8; 0x1000];
        let err = unsafe { RegisterWindow::new(buf.as_mut_ptr(), buf.len()) };
        assert!(err.is_err());
    }

    #[test]
    fn cap_decodes_mqes_and_page_size_range() {
        // MQES=63 (0's based -> 64), MPSMIN=0, MPSMAX=4, TO=1, DSTRD=0
        let raw: u64 = 63 | (1u64 << 24) | (0u64 << 48) | (4u64 << 52);
        let cap = Capabilities(raw);
        assert_eq!(cap.mqes(), 64);
        assert_eq!(cap.timeout_ms(), 500);
        assert_eq!(cap.mpsmin(), 0);
        assert_eq!(cap.mpsmax(), 4);
        assert_eq!(cap.dstrd(), 0);
    }

    #[test]
    fn write_and_read_round_trip() {
        let (_buf, win) = backing_window(REGISTER_WINDOW_MIN_SIZE);
        win.write_cc(Configuration::enable(0, 6, 4)).unwrap();
        let cc = win.read_cc().unwrap();
        assert!(cc.flags().contains(CcFlags::EN));
    }

    #[test]
    fn doorbell_offset_matches_interleaved_layout() {
        // qid=2 SQ tail is index 4, CQ head is index 5, stride 0 -> 4 bytes
        assert_eq!(RegisterWindow::doorbell_offset(4, 0), 0x1000 + 16);
        assert_eq!(RegisterWindow::doorbell_offset(5, 0), 0x1000 + 20);
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let (_buf, win) = backing_window(REGISTER_WINDOW_MIN_SIZE);
        assert!(win.write_doorbell(REGISTER_WINDOW_MIN_SIZE, 0).is_err());
    }
}
