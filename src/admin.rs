//! The admin reference: a mutex-serialized handle to the admin command
//! channel, and the Identify/Set-Features/Create-Queue/Delete-Queue
//! procedures issued through it (`src/rpc.c`'s `struct local_admin` /
//! `_nvm_ref_get` and `src/admin.c`'s `nvm_admin_*` builders in the
//! original driver).
//!
//! Only one admin command is ever in flight at a time — the mutex around
//! the transport *is* the serialization, not a performance shortcut, so
//! callers on different threads pay for correctness rather than racing
//! CIDs or completions.

use std::sync::Mutex;

use crate::cmd::{self, COMMAND_SIZE};
use crate::error::{NvmeError, Result};
use crate::transport::AdminTransport;

/// Snapshot of an Identify Controller result plus the fields this driver
/// already cached at reset time (spec §4.7; `struct nvm_ctrl_info` in the
/// original driver's `src/admin.c`).
#[derive(Debug, Clone)]
pub struct ControllerInfo {
    pub serial: String,
    pub model: String,
    pub firmware: String,
    pub version: u32,
    pub page_size: usize,
    pub doorbell_stride: u32,
    pub timeout_ms: u64,
    pub max_entries: u32,
    pub max_data_size: usize,
    pub sq_entry_size: usize,
    pub cq_entry_size: usize,
    pub max_out_cmds: u16,
    pub max_n_namespaces: u32,
    /// CAP.CQR — whether the controller requires physically contiguous
    /// queue memory.
    pub contiguous: bool,
}

/// Snapshot of an Identify Namespace result.
#[derive(Debug, Clone)]
pub struct NamespaceInfo {
    pub nsid: u32,
    pub size_blocks: u64,
    pub capacity_blocks: u64,
    pub block_size: u64,
}

fn ascii_field(buf: &[u8], range: std::ops::Range<usize>) -> String {
    String::from_utf8_lossy(&buf[range]).trim_end().to_string()
}

/// Registry of server-binding entries keyed by remote adapter number,
/// mirroring the intrusive `struct rpc_handle` list the original driver
/// threads through `_nvm_ref_get`/`_nvm_ref_put`. Populated by remote
/// transports that bind multiple adapters to a single reference; the
/// local transport never adds to it.
#[derive(Debug, Default)]
struct ServerBindings {
    entries: Vec<(u32, String)>,
}

impl ServerBindings {
    fn register(&mut self, adapter: u32, label: String) {
        self.entries.push((adapter, label));
    }

    fn unregister(&mut self, adapter: u32) {
        self.entries.retain(|(a, _)| *a != adapter);
    }
}

/// A concurrency-safe handle to the admin command channel.
pub struct AdminRef {
    transport: Mutex<Box<dyn AdminTransport>>,
    bindings: Mutex<ServerBindings>,
}

impl AdminRef {
    pub fn new(transport: Box<dyn AdminTransport>) -> AdminRef {
        AdminRef {
            transport: Mutex::new(transport),
            bindings: Mutex::new(ServerBindings::default()),
        }
    }

    /// Record that this reference now also serves `adapter` under
    /// `label` (remote transports spanning multiple server bindings).
    pub fn register_binding(&self, adapter: u32, label: impl Into<String>) {
        self.bindings.lock().unwrap().register(adapter, label.into());
    }

    pub fn unregister_binding(&self, adapter: u32) {
        self.bindings.lock().unwrap().unregister(adapter);
    }

    pub fn bound_adapters(&self) -> Vec<u32> {
        self.bindings.lock().unwrap().entries.iter().map(|(a, _)| *a).collect()
    }

    /// Submit a prebuilt command slot and return its completion's
    /// command-specific DWORD0 on success.
    fn submit(&self, command: [u8; COMMAND_SIZE]) -> Result<u32> {
        let mut transport = self.transport.lock().unwrap();
        let mut dw0 = 0u32;
        let raw = transport.send(&command, &mut dw0);
        match NvmeError::from_raw(raw) {
            Some(err) => Err(err),
            None => Ok(dw0),
        }
    }

    /// Identify Controller (CNS=1). `buf`/`buf_bus_addr` must describe a
    /// 4 KiB DMA-mapped buffer the controller can write into; obtaining
    /// that mapping is the caller's responsibility (see [`crate::dma`]).
    pub fn identify_controller(
        &self,
        buf: &mut [u8],
        buf_bus_addr: u64,
        ctrl_page_size: usize,
        ctrl_mpsmin: u32,
        ctrl_version: u32,
        ctrl_doorbell_stride: u32,
        ctrl_timeout_ms: u64,
        ctrl_max_entries: u32,
        ctrl_cqr: bool,
    ) -> Result<ControllerInfo> {
        if buf.len() < 4096 {
            return Err(NvmeError::InvalidArgument("identify buffer must be at least 4 KiB"));
        }
        self.submit(cmd::identify_controller(0, buf_bus_addr))?;

        let max_data_size = (1usize << buf[77]) * (1usize << (12 + ctrl_mpsmin));
        let sq_entry_size = 1usize << (buf[512] & 0x0f);
        let cq_entry_size = 1usize << (buf[513] & 0x0f);
        let max_out_cmds = u16::from_le_bytes([buf[514], buf[515]]);
        let max_n_namespaces = u32::from_le_bytes([buf[516], buf[517], buf[518], buf[519]]);

        Ok(ControllerInfo {
            serial: ascii_field(buf, 4..24),
            model: ascii_field(buf, 24..64),
            firmware: ascii_field(buf, 64..72),
            version: ctrl_version,
            page_size: ctrl_page_size,
            doorbell_stride: ctrl_doorbell_stride,
            timeout_ms: ctrl_timeout_ms,
            max_entries: ctrl_max_entries,
            max_data_size,
            sq_entry_size,
            cq_entry_size,
            max_out_cmds,
            max_n_namespaces,
            contiguous: ctrl_cqr,
        })
    }

    /// Identify Namespace (CNS=0) for `nsid`.
    pub fn identify_namespace(&self, nsid: u32, buf: &mut [u8], buf_bus_addr: u64) -> Result<NamespaceInfo> {
        if buf.len() < 4096 {
            return Err(NvmeError::InvalidArgument("identify buffer must be at least 4 KiB"));
        }
        self.submit(cmd::identify_namespace(0, nsid, buf_bus_addr))?;

        let nsze = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let ncap = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let flbas = buf[26] & 0x0f;
        let lbaf_offset = 128 + 4 * flbas as usize;
        let lbaf = u32::from_le_bytes(buf[lbaf_offset..lbaf_offset + 4].try_into().unwrap());
        let lbads = ((lbaf >> 16) & 0xff) as u32;
        Ok(NamespaceInfo {
            nsid,
            size_blocks: nsze,
            capacity_blocks: ncap,
            block_size: 1u64 << lbads,
        })
    }

    /// Get Features (Number of Queues): returns (n_sqs, n_cqs), both
    /// 1's-based.
    pub fn get_num_queues(&self) -> Result<(u16, u16)> {
        let dw0 = self.submit(cmd::get_features_num_queues(0))?;
        Ok((((dw0 & 0xffff) + 1) as u16, (((dw0 >> 16) & 0xffff) + 1) as u16))
    }

    /// Set Features (Number of Queues): request `nsqr` submission queues
    /// and `ncqr` completion queues; returns the controller's granted
    /// counts (which may be lower).
    pub fn request_num_queues(&self, nsqr: u16, ncqr: u16) -> Result<(u16, u16)> {
        let dw0 = self.submit(cmd::set_features_num_queues(0, nsqr - 1, ncqr - 1))?;
        Ok((((dw0 & 0xffff) + 1) as u16, (((dw0 >> 16) & 0xffff) + 1) as u16))
    }

    /// Create an I/O completion queue of `qsize` entries backed by the
    /// DMA-mapped page at `prp1`.
    pub fn create_io_cq(&self, qid: u16, prp1: u64, qsize: u16) -> Result<()> {
        self.submit(cmd::create_io_cq(0, qid, prp1, qsize - 1))?;
        Ok(())
    }

    /// Create an I/O submission queue of `qsize` entries bound to
    /// completion queue `cqid`.
    pub fn create_io_sq(&self, qid: u16, prp1: u64, qsize: u16, cqid: u16) -> Result<()> {
        self.submit(cmd::create_io_sq(0, qid, prp1, qsize - 1, cqid))?;
        Ok(())
    }

    pub fn delete_io_sq(&self, qid: u16) -> Result<()> {
        self.submit(cmd::delete_io_sq(0, qid))?;
        Ok(())
    }

    pub fn delete_io_cq(&self, qid: u16) -> Result<()> {
        self.submit(cmd::delete_io_cq(0, qid))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// A fake transport that hands back a scripted completion without a
    /// real controller, so the admin procedures can be exercised without
    /// mapped registers.
    struct FakeTransport {
        next_dw0: u32,
        fail_with: Option<NvmeError>,
        calls: AtomicU32,
    }

    impl AdminTransport for FakeTransport {
        fn send(&mut self, _command: &[u8; COMMAND_SIZE], completion_dw0: &mut u32) -> i32 {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = &self.fail_with {
                return err.to_raw();
            }
            *completion_dw0 = self.next_dw0;
            0
        }
    }

    #[test]
    fn get_num_queues_decodes_one_based_counts() {
        let transport = FakeTransport {
            next_dw0: (7u32 << 16) | 3, // ncqr-1=7, nsqr-1=3
            fail_with: None,
            calls: AtomicU32::new(0),
        };
        let admin = AdminRef::new(Box::new(transport));
        let (nsqr, ncqr) = admin.get_num_queues().unwrap();
        assert_eq!(nsqr, 4);
        assert_eq!(ncqr, 8);
    }

    #[test]
    fn completion_failure_surfaces_as_nvme_error() {
        let transport = FakeTransport {
            next_dw0: 0,
            fail_with: Some(NvmeError::Completion(0x02)),
            calls: AtomicU32::new(0),
        };
        let admin = AdminRef::new(Box::new(transport));
        let err = admin.delete_io_sq(3).unwrap_err();
        assert!(matches!(err, NvmeError::Completion(0x02)));
    }

    #[test]
    fn identify_controller_parses_known_offsets() {
        let mut buf = vec![0u8; 4096];
        buf[4..24].copy_from_slice(b"SERIALNUMBER0000000 ");
        buf[24..64].copy_from_slice(&[b'M'; 40]);
        buf[64..72].copy_from_slice(b"FW00001 ");
        buf[77] = 5; // MDTS
        buf[512] = 6; // sq entry size log2 = 6 -> 64
        buf[513] = 4; // cq entry size log2 = 4 -> 16
        buf[514..516].copy_from_slice(&100u16.to_le_bytes());
        buf[516..520].copy_from_slice(&1u32.to_le_bytes());

        let transport = FakeTransport {
            next_dw0: 0,
            fail_with: None,
            calls: AtomicU32::new(0),
        };
        let admin = AdminRef::new(Box::new(transport));
        let info = admin
            .identify_controller(&mut buf, 0x1000, 4096, 0, 0x00010300, 4, 2000, 64, true)
            .unwrap();
        assert_eq!(info.max_data_size, (1 << 5) * 4096);
        assert_eq!(info.sq_entry_size, 64);
        assert_eq!(info.cq_entry_size, 16);
        assert_eq!(info.max_out_cmds, 100);
        assert_eq!(info.max_n_namespaces, 1);
        assert!(info.contiguous);
        assert_eq!(info.serial.trim(), "SERIALNUMBER0000000");
    }

    #[test]
    fn bindings_registry_tracks_remote_adapters() {
        let transport = FakeTransport {
            next_dw0: 0,
            fail_with: None,
            calls: AtomicU32::new(0),
        };
        let admin = AdminRef::new(Box::new(transport));
        admin.register_binding(1, "adapter-1");
        admin.register_binding(2, "adapter-2");
        assert_eq!(admin.bound_adapters(), vec![1, 2]);
        admin.unregister_binding(1);
        assert_eq!(admin.bound_adapters(), vec![2]);
    }
}
