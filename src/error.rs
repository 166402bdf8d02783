//! Composite error type for the driver core.
//!
//! The NVMe specification and this driver's host environment produce three
//! distinct kinds of failure that must travel through the same `Result`:
//! POSIX-style host errors (out of memory, bad range, timeout, ...), NVMe
//! completion statuses reported by the controller itself, and plain I/O
//! failures from the underlying file descriptor or mapping. `NvmeError`
//! keeps them distinguishable instead of flattening everything to a string,
//! mirroring the three-kind packing described for the admin transport.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, NvmeError>;

/// Composite driver error.
#[derive(Debug, Error)]
pub enum NvmeError {
    /// Host allocation failed.
    #[error("out of memory")]
    NoMemory,

    /// An argument was structurally invalid (wrong size, null pointer, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A size or address did not align to the required page granularity,
    /// or a page-size negotiation between host and controller failed.
    #[error("range error: {0}")]
    Range(&'static str),

    /// The controller did not reach the expected state within `CAP.TO`.
    #[error("controller timed out after {0} ms")]
    Timeout(u64),

    /// The admin submission queue had no free slot (single-writer admin
    /// reference only sees this under a caller protocol that pipelines
    /// multiple in-flight admin commands, which this crate does not do).
    #[error("admin submission queue is full")]
    WouldBlock,

    /// The admin reference has no transport bound yet.
    #[error("admin reference has no transport bound")]
    NotBound,

    /// A remote admin server rejected the request.
    #[error("remote admin server rejected the command")]
    PermissionDenied,

    /// The requested path is not implemented by this transport.
    #[error("operation not supported by this transport")]
    NotSupported,

    /// The requested device does not exist.
    #[error("device not found")]
    NoDevice,

    /// Low-level I/O failure (open/mmap/ioctl/...).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The controller completed the command with a non-zero status.
    #[error("command failed with NVMe status 0x{0:04x}")]
    Completion(u16),
}

impl NvmeError {
    /// Collapse the error to the signed composite result the admin
    /// transport stub returns: zero for success, a positive value for a
    /// host-side errno, or a negative value carrying a packed completion
    /// status. Callers that only care about success/failure can just check
    /// for zero; callers that want the errno or the status back can use
    /// [`NvmeError::from_raw`] on a negative/positive `i32`.
    pub fn to_raw(&self) -> i32 {
        match self {
            NvmeError::NoMemory => libc::ENOMEM,
            NvmeError::InvalidArgument(_) => libc::EINVAL,
            NvmeError::Range(_) => libc::ERANGE,
            NvmeError::Timeout(_) => libc::ETIMEDOUT,
            NvmeError::WouldBlock => libc::EAGAIN,
            NvmeError::NotBound => libc::EBADF,
            NvmeError::PermissionDenied => libc::EPERM,
            NvmeError::NotSupported => libc::ENOTSUP,
            NvmeError::NoDevice => libc::ENODEV,
            NvmeError::Io(_) => libc::EIO,
            NvmeError::Completion(status) => -(i32::from(*status)),
        }
    }

    /// Inverse of [`NvmeError::to_raw`] for a code returned by the admin
    /// transport; `0` has no error to represent and is not handled here.
    pub fn from_raw(code: i32) -> Option<NvmeError> {
        if code == 0 {
            return None;
        }
        if code < 0 {
            return Some(NvmeError::Completion((-code) as u16));
        }
        Some(match code {
            libc::ENOMEM => NvmeError::NoMemory,
            libc::ERANGE => NvmeError::Range("range error reported by transport"),
            libc::ETIMEDOUT | libc::ETIME => NvmeError::Timeout(0),
            libc::EAGAIN => NvmeError::WouldBlock,
            libc::EBADF => NvmeError::NotBound,
            libc::EPERM => NvmeError::PermissionDenied,
            libc::ENOTSUP => NvmeError::NotSupported,
            libc::ENODEV => NvmeError::NoDevice,
            _ => NvmeError::InvalidArgument("unrecognized transport errno"),
        })
    }
}

/// A completion's 16-bit status half-word: bit 0 is the phase tag, bits
/// 1..=15 are the NVMe status code (SC, SCT, CRD, M, DNR packed together).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionStatus(pub u16);

impl CompletionStatus {
    /// Phase tag carried by this completion.
    pub fn phase(self) -> bool {
        self.0 & 0x1 != 0
    }

    /// NVMe status code, with the phase tag masked out.
    pub fn code(self) -> u16 {
        self.0 >> 1
    }

    /// `true` when the status code is zero, independent of the phase tag
    /// (phase is validated separately by the completion queue's poll).
    pub fn is_ok(self) -> bool {
        (self.0 & !0x1u16) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_status_is_ok_ignores_phase() {
        assert!(CompletionStatus(0b0).is_ok());
        assert!(CompletionStatus(0b1).is_ok());
        assert!(!CompletionStatus(0b10).is_ok());
        assert!(!CompletionStatus(0b11).is_ok());
    }

    #[test]
    fn completion_status_code_masks_phase_bit() {
        assert_eq!(CompletionStatus(0b101).code(), 0b10);
        assert_eq!(CompletionStatus(0b100).code(), 0b10);
    }

    #[test]
    fn raw_round_trips_through_errno() {
        let err = NvmeError::WouldBlock;
        let raw = err.to_raw();
        assert_eq!(raw, libc::EAGAIN);
        assert!(matches!(NvmeError::from_raw(raw), Some(NvmeError::WouldBlock)));
    }

    #[test]
    fn raw_round_trips_through_completion_status() {
        let err = NvmeError::Completion(0x0b);
        let raw = err.to_raw();
        assert!(raw < 0);
        assert!(matches!(NvmeError::from_raw(raw), Some(NvmeError::Completion(0x0b))));
    }
}
