//! The admin reference's transport seam: a single function that submits a
//! command and blocks for its completion, returning the three-kind
//! composite result described for the admin RPC stub
//! (`src/rpc.c`'s `_nvm_local_admin`/`nvm_raw_rpc` in the original driver).
//!
//! [`LocalTransport`] is the concrete in-process implementation backed by
//! a real admin queue pair against a mapped [`crate::ctrl::Controller`].
//! [`crate::transport::ioctl`] and [`crate::transport::remote`] sketch the
//! two external-collaborator transports named in the driver's scope
//! without providing a working kernel-module or network counterpart.

pub mod ioctl;
pub mod remote;

use std::time::{Duration, Instant};

use crate::cmd::COMMAND_SIZE;
use crate::ctrl::Controller;
use crate::error::{NvmeError, Result};
use crate::queue::{CompletionQueue, SubmissionQueue};

/// A transport the admin reference can submit commands through.
///
/// `send` overwrites the command's CID, submits it, and blocks until the
/// matching completion arrives or the transport's own timeout expires.
/// The return value is the raw composite result from spec §7: `0` for
/// success, a positive POSIX errno for a host-side failure, or a negative
/// packed NVMe status. On success, `completion_dw0` is filled with the
/// completion entry's command-specific DWORD0 (e.g. the Number of Queues
/// response).
pub trait AdminTransport: Send {
    fn send(&mut self, command: &[u8; COMMAND_SIZE], completion_dw0: &mut u32) -> i32;
}

/// The default transport: a real admin queue pair against a locally
/// mapped controller.
pub struct LocalTransport {
    ctrl: Controller,
    sq: SubmissionQueue,
    cq: CompletionQueue,
    sq_doorbell: usize,
    cq_doorbell: usize,
}

impl LocalTransport {
    /// `asq`/`acq` are the admin queue ring buffers, already sized to
    /// `entries` slots of 64 and 16 bytes respectively; `asq_addr`/
    /// `acq_addr` are their controller-visible bus addresses. Runs the
    /// controller reset sequence before returning.
    pub fn new(ctrl: Controller, asq_addr: u64, acq_addr: u64, entries: u16) -> Result<LocalTransport> {
        if entries < 2 {
            return Err(NvmeError::InvalidArgument("admin queue needs at least 2 entries"));
        }
        ctrl.reset(asq_addr, acq_addr, entries as u32, entries as u32)?;
        let sq_doorbell = ctrl.doorbell_offset(0);
        let cq_doorbell = ctrl.doorbell_offset(1);
        Ok(LocalTransport {
            sq: SubmissionQueue::new(0, entries, COMMAND_SIZE),
            cq: CompletionQueue::new(0, entries, 16),
            ctrl,
            sq_doorbell,
            cq_doorbell,
        })
    }

    pub fn controller(&self) -> &Controller {
        &self.ctrl
    }
}

impl AdminTransport for LocalTransport {
    fn send(&mut self, command: &[u8; COMMAND_SIZE], completion_dw0: &mut u32) -> i32 {
        let cid = match self.sq.enqueue(command, None) {
            Ok(cid) => cid,
            Err(e) => return e.to_raw(),
        };
        if let Some(tail) = self.sq.submit() {
            if let Err(e) = self.ctrl.registers().write_doorbell(self.sq_doorbell, tail as u32) {
                return e.to_raw();
            }
        }

        let deadline = Instant::now() + Duration::from_millis(self.ctrl.timeout_ms());
        let completion = match self.cq.dequeue_block(deadline) {
            Ok(c) => c,
            Err(e) => return e.to_raw(),
        };
        debug_assert_eq!(completion.cid, cid, "admin reference never pipelines more than one in-flight command");

        self.sq.update(completion.sq_head);
        if let Some(head) = self.cq.update() {
            if let Err(e) = self.ctrl.registers().write_doorbell(self.cq_doorbell, head as u32) {
                return e.to_raw();
            }
        }

        *completion_dw0 = completion.command_specific;
        if completion.status.is_ok() {
            0
        } else {
            NvmeError::Completion(completion.status.0).to_raw()
        }
    }
}
