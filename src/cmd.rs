//! Command slot builders: the 64-byte NVMe submission queue entry layout,
//! PRP data-pointer construction, and the admin command set this driver
//! issues (`include/nvm_cmd.h` / `include/nvm_admin.h` in the original
//! driver; opcode numbering cross-checked against
//! `examples/other_examples/b8c4b52b_valopok-vroom__src-cmd.rs.rs`).
//!
//! Every builder here writes into a caller-supplied zero-initialized
//! 64-byte slot rather than returning an owned struct, so the same buffer
//! backing a [`crate::queue::SubmissionQueue`] can be filled in place.

use crate::error::{NvmeError, Result};

/// Size in bytes of one command slot.
pub const COMMAND_SIZE: usize = 64;

/// Size in bytes of one PRP entry.
pub const PRP_ENTRY_SIZE: usize = 8;

/// Admin command set opcodes (NVMe 1.x Figure 21).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AdminOpcode {
    DeleteIoSq = 0x00,
    CreateIoSq = 0x01,
    DeleteIoCq = 0x04,
    CreateIoCq = 0x05,
    Identify = 0x06,
    SetFeatures = 0x09,
    GetFeatures = 0x0A,
}

/// NVM command set opcodes (NVMe 1.x Figure 84).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NvmOpcode {
    Write = 0x01,
    Read = 0x02,
}

/// Identify CNS values used by this driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IdentifyCns {
    Namespace = 0,
    Controller = 1,
}

/// Feature identifier for the admin Set/Get-Features procedures this
/// driver issues.
pub const FEATURE_NUMBER_OF_QUEUES: u32 = 0x07;

fn zero_header(slot: &mut [u8], opcode: u8, cid: u16, nsid: u32) -> Result<()> {
    if slot.len() != COMMAND_SIZE {
        return Err(NvmeError::InvalidArgument("command slot must be 64 bytes"));
    }
    slot.fill(0);
    slot[0] = opcode & 0x7f;
    slot[1] = 0;
    slot[2..4].copy_from_slice(&cid.to_le_bytes());
    slot[4..8].copy_from_slice(&nsid.to_le_bytes());
    Ok(())
}

fn set_prp(slot: &mut [u8], prp1: u64, prp2: u64) {
    slot[24..32].copy_from_slice(&prp1.to_le_bytes());
    slot[32..40].copy_from_slice(&prp2.to_le_bytes());
}

fn set_dword(slot: &mut [u8], dword: usize, value: u32) {
    let start = 4 * dword;
    slot[start..start + 4].copy_from_slice(&value.to_le_bytes());
}

/// Populate `slot`'s data pointer and LBA/block-count fields for an I/O
/// read or write.
fn set_rw_fields(slot: &mut [u8], start_lba: u64, n_blocks: u16) -> Result<()> {
    if n_blocks == 0 {
        return Err(NvmeError::InvalidArgument("n_blocks must be nonzero"));
    }
    set_dword(slot, 10, start_lba as u32);
    set_dword(slot, 11, (start_lba >> 32) as u32);
    set_dword(slot, 12, (n_blocks - 1) as u32);
    Ok(())
}

/// Read the 16-bit command identifier back out of a filled slot.
pub fn read_cid(slot: &[u8]) -> u16 {
    u16::from_le_bytes([slot[2], slot[3]])
}

/// Build a PRP list page: pack `addrs` (bus addresses of pages 2..n of a
/// transfer) as little-endian 8-byte entries into `dest`. `residual_bytes`
/// is the transfer size remaining after the first page; the number of
/// entries written is `min(ceil(residual_bytes / page_size), page_size / 8)`,
/// matching the controller's single-page PRP list capacity.
pub fn build_prp_list(
    dest: &mut [u8],
    page_size: usize,
    residual_bytes: usize,
    addrs: &[u64],
) -> Result<usize> {
    if page_size == 0 || dest.len() < page_size {
        return Err(NvmeError::InvalidArgument("PRP list buffer smaller than one page"));
    }
    let by_residual = (residual_bytes + page_size - 1) / page_size;
    let capacity = page_size / PRP_ENTRY_SIZE;
    let entries = by_residual.min(capacity);
    if addrs.len() < entries {
        return Err(NvmeError::InvalidArgument(
            "not enough bus addresses to fill the PRP list",
        ));
    }
    for (i, addr) in addrs.iter().take(entries).enumerate() {
        let start = i * PRP_ENTRY_SIZE;
        dest[start..start + PRP_ENTRY_SIZE].copy_from_slice(&addr.to_le_bytes());
    }
    Ok(entries)
}

/// Resolve PRP1/PRP2 for a transfer spanning the controller pages in
/// `addrs`, building a PRP list into `prp_list` when the transfer exceeds
/// two pages. `prp_list` carries the list page's own backing buffer and
/// its bus address.
pub fn plan_data_pointer(
    page_size: usize,
    addrs: &[u64],
    prp_list: Option<(&mut [u8], u64)>,
) -> Result<(u64, u64)> {
    match addrs.len() {
        0 => Err(NvmeError::InvalidArgument("transfer covers zero pages")),
        1 => Ok((addrs[0], 0)),
        2 => Ok((addrs[0], addrs[1])),
        n => {
            let (buf, list_bus_addr) =
                prp_list.ok_or(NvmeError::InvalidArgument("PRP list page required but not supplied"))?;
            let residual = (n - 1) * page_size;
            build_prp_list(buf, page_size, residual, &addrs[1..])?;
            Ok((addrs[0], list_bus_addr))
        }
    }
}

/// Build an Identify Controller command.
pub fn identify_controller(cid: u16, prp1: u64) -> [u8; COMMAND_SIZE] {
    let mut slot = [0u8; COMMAND_SIZE];
    zero_header(&mut slot, AdminOpcode::Identify as u8, cid, 0).unwrap();
    set_prp(&mut slot, prp1, 0);
    set_dword(&mut slot, 10, IdentifyCns::Controller as u32);
    slot
}

/// Build an Identify Namespace command for namespace `nsid`.
pub fn identify_namespace(cid: u16, nsid: u32, prp1: u64) -> [u8; COMMAND_SIZE] {
    let mut slot = [0u8; COMMAND_SIZE];
    zero_header(&mut slot, AdminOpcode::Identify as u8, cid, nsid).unwrap();
    set_prp(&mut slot, prp1, 0);
    set_dword(&mut slot, 10, IdentifyCns::Namespace as u32);
    slot
}

/// Build a Get Features (Number of Queues) command.
pub fn get_features_num_queues(cid: u16) -> [u8; COMMAND_SIZE] {
    let mut slot = [0u8; COMMAND_SIZE];
    zero_header(&mut slot, AdminOpcode::GetFeatures as u8, cid, 0).unwrap();
    set_dword(&mut slot, 10, FEATURE_NUMBER_OF_QUEUES);
    slot
}

/// Build a Set Features (Number of Queues) command requesting `nsqr`
/// I/O submission queues and `ncqr` I/O completion queues (both 0's
/// based, as the field itself is encoded).
pub fn set_features_num_queues(cid: u16, nsqr: u16, ncqr: u16) -> [u8; COMMAND_SIZE] {
    let mut slot = [0u8; COMMAND_SIZE];
    zero_header(&mut slot, AdminOpcode::SetFeatures as u8, cid, 0).unwrap();
    set_dword(&mut slot, 10, FEATURE_NUMBER_OF_QUEUES);
    set_dword(&mut slot, 11, ((ncqr as u32) << 16) | nsqr as u32);
    slot
}

/// Build a Create I/O Completion Queue command. Interrupts are never
/// requested; this driver polls exclusively.
pub fn create_io_cq(cid: u16, qid: u16, prp1: u64, qsize: u16) -> [u8; COMMAND_SIZE] {
    let mut slot = [0u8; COMMAND_SIZE];
    zero_header(&mut slot, AdminOpcode::CreateIoCq as u8, cid, 0).unwrap();
    set_prp(&mut slot, prp1, 0);
    set_dword(&mut slot, 10, ((qsize as u32) << 16) | qid as u32);
    set_dword(&mut slot, 11, 1); // physically contiguous, interrupts disabled
    slot
}

/// Build a Create I/O Submission Queue command bound to completion queue
/// `cqid`.
pub fn create_io_sq(cid: u16, qid: u16, prp1: u64, qsize: u16, cqid: u16) -> [u8; COMMAND_SIZE] {
    let mut slot = [0u8; COMMAND_SIZE];
    zero_header(&mut slot, AdminOpcode::CreateIoSq as u8, cid, 0).unwrap();
    set_prp(&mut slot, prp1, 0);
    set_dword(&mut slot, 10, ((qsize as u32) << 16) | qid as u32);
    set_dword(&mut slot, 11, ((cqid as u32) << 16) | 1); // physically contiguous
    slot
}

/// Build a Delete I/O Submission Queue command.
pub fn delete_io_sq(cid: u16, qid: u16) -> [u8; COMMAND_SIZE] {
    let mut slot = [0u8; COMMAND_SIZE];
    zero_header(&mut slot, AdminOpcode::DeleteIoSq as u8, cid, 0).unwrap();
    set_dword(&mut slot, 10, qid as u32);
    slot
}

/// Build a Delete I/O Completion Queue command.
pub fn delete_io_cq(cid: u16, qid: u16) -> [u8; COMMAND_SIZE] {
    let mut slot = [0u8; COMMAND_SIZE];
    zero_header(&mut slot, AdminOpcode::DeleteIoCq as u8, cid, 0).unwrap();
    set_dword(&mut slot, 10, qid as u32);
    slot
}

/// Build an I/O read command.
pub fn io_read(
    cid: u16,
    nsid: u32,
    start_lba: u64,
    n_blocks: u16,
    prp1: u64,
    prp2: u64,
) -> Result<[u8; COMMAND_SIZE]> {
    let mut slot = [0u8; COMMAND_SIZE];
    zero_header(&mut slot, NvmOpcode::Read as u8, cid, nsid)?;
    set_prp(&mut slot, prp1, prp2);
    set_rw_fields(&mut slot, start_lba, n_blocks)?;
    Ok(slot)
}

/// Build an I/O write command.
pub fn io_write(
    cid: u16,
    nsid: u32,
    start_lba: u64,
    n_blocks: u16,
    prp1: u64,
    prp2: u64,
) -> Result<[u8; COMMAND_SIZE]> {
    let mut slot = [0u8; COMMAND_SIZE];
    zero_header(&mut slot, NvmOpcode::Write as u8, cid, nsid)?;
    set_prp(&mut slot, prp1, prp2);
    set_rw_fields(&mut slot, start_lba, n_blocks)?;
    Ok(slot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_masks_opcode_and_preserves_cid() {
        let cmd = identify_controller(0x1234, 0xdead_0000);
        assert_eq!(cmd[0], AdminOpcode::Identify as u8);
        assert_eq!(read_cid(&cmd), 0x1234);
        assert_eq!(u32::from_le_bytes([cmd[24], cmd[25], cmd[26], cmd[27]]) as u64
            | ((u32::from_le_bytes([cmd[28], cmd[29], cmd[30], cmd[31]]) as u64) << 32), 0xdead_0000);
    }

    #[test]
    fn io_read_rejects_zero_blocks() {
        assert!(io_read(1, 1, 0, 0, 0x1000, 0).is_err());
    }

    #[test]
    fn io_write_encodes_lba_and_block_count() {
        let cmd = io_write(1, 1, 0x1_0000_0002, 7, 0x1000, 0x2000).unwrap();
        let lba_lo = u32::from_le_bytes([cmd[40], cmd[41], cmd[42], cmd[43]]);
        let lba_hi = u32::from_le_bytes([cmd[44], cmd[45], cmd[46], cmd[47]]);
        let nb = u32::from_le_bytes([cmd[48], cmd[49], cmd[50], cmd[51]]) & 0xffff;
        assert_eq!(lba_lo, 2);
        assert_eq!(lba_hi, 1);
        assert_eq!(nb, 6);
    }

    #[test]
    fn prp_plan_picks_single_double_and_list_forms() {
        assert_eq!(plan_data_pointer(4096, &[0x1000], None).unwrap(), (0x1000, 0));
        assert_eq!(
            plan_data_pointer(4096, &[0x1000, 0x2000], None).unwrap(),
            (0x1000, 0x2000)
        );

        let mut list_buf = vec![0u8; 4096];
        let (prp1, prp2) =
            plan_data_pointer(4096, &[0x1000, 0x2000, 0x3000], Some((&mut list_buf, 0x9000))).unwrap();
        assert_eq!(prp1, 0x1000);
        assert_eq!(prp2, 0x9000);
        let entry0 = u64::from_le_bytes(list_buf[0..8].try_into().unwrap());
        let entry1 = u64::from_le_bytes(list_buf[8..16].try_into().unwrap());
        assert_eq!(entry0, 0x2000);
        assert_eq!(entry1, 0x3000);
    }

    #[test]
    fn prp_list_entry_count_is_bounded_by_page_capacity() {
        let mut dest = vec![0u8; 4096];
        let addrs: Vec<u64> = (0..600).map(|i| 0x1000 * i).collect();
        // 600 pages residual but a 4096-byte page only holds 512 entries.
        let entries = build_prp_list(&mut dest, 4096, 600 * 4096, &addrs).unwrap();
        assert_eq!(entries, 512);
    }

    #[test]
    fn create_io_sq_encodes_queue_ids_and_contiguous_flag() {
        let cmd = create_io_sq(9, 3, 0x4000, 64, 1);
        let cdw10 = u32::from_le_bytes([cmd[40], cmd[41], cmd[42], cmd[43]]);
        let cdw11 = u32::from_le_bytes([cmd[44], cmd[45], cmd[46], cmd[47]]);
        assert_eq!(cdw10 & 0xffff, 3);
        assert_eq!((cdw10 >> 16) & 0xffff, 64);
        assert_eq!(cdw11 & 0x1, 1);
        assert_eq!((cdw11 >> 16) & 0xffff, 1);
    }
}
