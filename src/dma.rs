//! DMA descriptor: re-expresses a host mapping, described at some source
//! page size, as an ordered list of controller-visible bus addresses at
//! the controller's own page size (`include/nvm_dma.h` / `src/dma.c` in
//! the original driver).
//!
//! A [`DmaMapping`] never owns the underlying memory; it is a view over
//! bus addresses supplied by one of three sources — a caller-supplied
//! address list, the ioctl host/device-pinning transport, or a remote
//! segment transport — matching `enum dma_type` in `src/dma.c`
//! (`_DMA_TYPE_MANUAL` / `_IOCTL_HOST` / `_IOCTL_DEVICE` / `_SMARTIO`).

use crate::error::{NvmeError, Result};

/// Where a [`DmaMapping`]'s bus addresses came from. Kept on the handle so
/// the matching unmap can be dispatched without offset arithmetic into an
/// outer struct, unlike the C driver's container-embedding trick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaSource {
    /// Addresses supplied directly by the caller; nothing to unmap.
    Manual,
    /// Host memory pinned and translated through the ioctl transport.
    IoctlHost,
    /// Device memory pinned and translated through the ioctl transport.
    IoctlDevice,
    /// A single contiguous segment obtained from a remote transport.
    Remote,
}

/// A DMA mapping expressed at the controller's page size.
///
/// Invariant: `page_size * ioaddrs.len()` equals the mapped range in
/// controller pages; `ioaddrs` are consecutive covers of that range, not
/// necessarily contiguous in bus space.
#[derive(Debug, Clone)]
pub struct DmaMapping {
    vaddr: usize,
    page_size: usize,
    ioaddrs: Vec<u64>,
    source: DmaSource,
}

impl DmaMapping {
    /// Re-express a host mapping of `n_src_pages` pages of `src_page_size`
    /// bytes, backed by `src_addrs` (one bus address per source page), at
    /// the controller's page size. `src_page_size * n_src_pages` must be
    /// an exact multiple of `ctrl_page_size`.
    pub fn from_addr_list(
        vaddr: usize,
        ctrl_page_size: usize,
        src_page_size: usize,
        src_addrs: &[u64],
    ) -> Result<DmaMapping> {
        Self::build(
            vaddr,
            ctrl_page_size,
            src_page_size,
            src_addrs,
            DmaSource::Manual,
        )
    }

    /// Construct from the ioctl transport's pinned host pages: it returns
    /// one bus address per `src_page_size`-sized host page it pinned.
    pub fn from_ioctl_host(
        vaddr: usize,
        ctrl_page_size: usize,
        src_page_size: usize,
        src_addrs: &[u64],
    ) -> Result<DmaMapping> {
        Self::build(
            vaddr,
            ctrl_page_size,
            src_page_size,
            src_addrs,
            DmaSource::IoctlHost,
        )
    }

    /// Construct from the ioctl transport's pinned device pages (CUDA
    /// build), symmetric to [`DmaMapping::from_ioctl_host`].
    pub fn from_ioctl_device(
        vaddr: usize,
        ctrl_page_size: usize,
        src_page_size: usize,
        src_addrs: &[u64],
    ) -> Result<DmaMapping> {
        Self::build(
            vaddr,
            ctrl_page_size,
            src_page_size,
            src_addrs,
            DmaSource::IoctlDevice,
        )
    }

    /// Construct from a remote transport's single bus address for a
    /// contiguous segment of `n_pages` controller pages.
    pub fn from_remote_segment(
        vaddr: usize,
        ctrl_page_size: usize,
        base_addr: u64,
        n_pages: usize,
    ) -> Result<DmaMapping> {
        if n_pages == 0 {
            return Err(NvmeError::InvalidArgument("remote segment has zero pages"));
        }
        let ioaddrs = (0..n_pages)
            .map(|i| base_addr + (i * ctrl_page_size) as u64)
            .collect();
        Ok(DmaMapping {
            vaddr,
            page_size: ctrl_page_size,
            ioaddrs,
            source: DmaSource::Remote,
        })
    }

    fn build(
        vaddr: usize,
        ctrl_page_size: usize,
        src_page_size: usize,
        src_addrs: &[u64],
        source: DmaSource,
    ) -> Result<DmaMapping> {
        if ctrl_page_size == 0 || src_page_size == 0 {
            return Err(NvmeError::InvalidArgument("zero page size"));
        }
        let total_bytes = src_page_size
            .checked_mul(src_addrs.len())
            .ok_or(NvmeError::Range("source mapping size overflowed"))?;
        if total_bytes % ctrl_page_size != 0 {
            return Err(NvmeError::Range(
                "source mapping size is not a multiple of the controller page size",
            ));
        }
        let n_ioaddrs = total_bytes / ctrl_page_size;
        let mut ioaddrs = Vec::with_capacity(n_ioaddrs);
        if ctrl_page_size >= src_page_size {
            // R = ctrl_page_size / src_page_size whole source pages per
            // controller page.
            let r = ctrl_page_size / src_page_size;
            for i in 0..n_ioaddrs {
                ioaddrs.push(src_addrs[i * r]);
            }
        } else {
            // Controller pages are smaller than source pages: walk the
            // byte offset directly per I8, `src_addrs[i*P/S] + (i*P) mod S`.
            for i in 0..n_ioaddrs {
                let byte_off = i * ctrl_page_size;
                let src_idx = byte_off / src_page_size;
                let within = (byte_off % src_page_size) as u64;
                ioaddrs.push(src_addrs[src_idx] + within);
            }
        }
        Ok(DmaMapping {
            vaddr,
            page_size: ctrl_page_size,
            ioaddrs,
            source,
        })
    }

    pub fn vaddr(&self) -> usize {
        self.vaddr
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn source(&self) -> DmaSource {
        self.source
    }

    /// Bus addresses, one per controller page, in ascending-offset order.
    pub fn ioaddrs(&self) -> &[u64] {
        &self.ioaddrs
    }

    /// Bus address of the controller page covering byte offset
    /// `page_index * page_size` into the mapping.
    pub fn ioaddr(&self, page_index: usize) -> Option<u64> {
        self.ioaddrs.get(page_index).copied()
    }

    pub fn n_pages(&self) -> usize {
        self.ioaddrs.len()
    }

    /// Host-visible bytes backing controller page `index`.
    ///
    /// # Safety
    /// The caller must ensure `vaddr` truly points to `n_pages() *
    /// page_size()` valid, exclusively-borrowed bytes for the lifetime of
    /// the returned slice, and must not alias this call with another
    /// concurrent borrow of the same page.
    pub unsafe fn page_mut(&self, index: usize) -> &mut [u8] {
        let ptr = (self.vaddr as *mut u8).add(index * self.page_size);
        std::slice::from_raw_parts_mut(ptr, self.page_size)
    }

    /// Read-only counterpart of [`DmaMapping::page_mut`].
    ///
    /// # Safety
    /// Same obligations as [`DmaMapping::page_mut`].
    pub unsafe fn page(&self, index: usize) -> &[u8] {
        let ptr = (self.vaddr as *const u8).add(index * self.page_size);
        std::slice::from_raw_parts(ptr, self.page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_page_sizes_copy_addresses_through() {
        let src = vec![0x1000, 0x3000, 0x9000];
        let dma = DmaMapping::from_addr_list(0xdead_beef, 4096, 4096, &src).unwrap();
        assert_eq!(dma.ioaddrs(), &src[..]);
        assert_eq!(dma.n_pages(), 3);
    }

    #[test]
    fn larger_controller_pages_stride_over_source_pages() {
        // ctrl page = 2x src page, so every controller page covers 2 src pages.
        let src = vec![0x1000, 0x2000, 0x3000, 0x4000];
        let dma = DmaMapping::from_addr_list(0, 8192, 4096, &src).unwrap();
        assert_eq!(dma.ioaddrs(), &[0x1000, 0x3000]);
    }

    #[test]
    fn smaller_controller_pages_compute_within_page_offset() {
        // ctrl page = src page / 2: each source page yields two controller pages.
        let src = vec![0x1000, 0x2000];
        let dma = DmaMapping::from_addr_list(0, 2048, 4096, &src).unwrap();
        assert_eq!(dma.ioaddrs(), &[0x1000, 0x1000 + 2048, 0x2000, 0x2000 + 2048]);
    }

    #[test]
    fn misaligned_mapping_fails_with_range_error() {
        let src = vec![0x1000, 0x2000, 0x3000];
        let err = DmaMapping::from_addr_list(0, 4096, 4096, &src[..2]);
        // 2 * 4096 is a multiple of 4096, so use a genuinely misaligned case:
        assert!(err.is_ok());
        let err = DmaMapping::from_addr_list(0, 8192, 4096, &src);
        assert!(matches!(err, Err(NvmeError::Range(_))));
    }

    #[test]
    fn remote_segment_is_contiguous() {
        let dma = DmaMapping::from_remote_segment(0, 4096, 0x1_0000, 4).unwrap();
        assert_eq!(dma.ioaddrs(), &[0x1_0000, 0x1_1000, 0x1_2000, 0x1_3000]);
        assert_eq!(dma.source(), DmaSource::Remote);
    }
}
