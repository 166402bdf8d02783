//! User-space NVMe controller driver core.
//!
//! Resets a PCIe NVMe controller, configures its admin queue pair, issues
//! admin commands to enumerate the controller and its namespaces,
//! allocates and operates I/O submission/completion queue pairs, and
//! submits block read/write commands through those queues using PRP-based
//! DMA. Interrupt-driven completion, SGL, namespace management beyond
//! identification, and retry/timeout-recovery policy are out of scope;
//! everything here polls.
//!
//! Module map:
//! - [`regs`]: the CAP/VS/CC/CSTS/AQA register window and doorbells.
//! - [`dma`]: bus-address translation between host and controller page
//!   sizes.
//! - [`queue`]: submission/completion ring primitives.
//! - [`cmd`]: 64-byte command slot builders and PRP data-pointer
//!   construction.
//! - [`ctrl`]: controller mapping and the reset sequence.
//! - [`admin`]: the mutex-serialized admin reference and its procedures.
//! - [`transport`]: the admin transport seam, its local implementation,
//!   and the ioctl/remote external collaborators.
//! - [`bench`]: the multi-queue latency benchmark engine.
//! - [`error`]: the composite error type shared by every module above.

pub mod admin;
pub mod bench;
pub mod cmd;
pub mod ctrl;
pub mod dma;
pub mod error;
pub mod queue;
pub mod regs;
pub mod transport;

pub use error::{NvmeError, Result};
