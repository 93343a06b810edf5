//! NT Status Codes
//!
//! Every fallible operation in the runtime returns an explicit status,
//! never an exception or a panic. The numeric values are the NT ones so
//! that they can cross the wire protocol unchanged.

use thiserror::Error;

/// Result alias used throughout the runtime.
pub type NtResult<T> = Result<T, NtStatus>;

/// Status codes surfaced by the runtime.
///
/// Informational codes (`Pending`, `UserApc`, `Alerted`) travel on the wire
/// but are consumed internally; public APIs resolve them before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u32)]
pub enum NtStatus {
    #[error("operation is pending")]
    Pending = 0x0000_0103,
    #[error("a user APC was delivered")]
    UserApc = 0x0000_00C0,
    #[error("the wait was alerted")]
    Alerted = 0x0000_0101,
    #[error("the wait timed out")]
    Timeout = 0x0000_0102,

    #[error("unsuccessful")]
    Unsuccessful = 0xC000_0001,
    #[error("invalid handle")]
    InvalidHandle = 0xC000_0008,
    #[error("invalid parameter")]
    InvalidParameter = 0xC000_000D,
    #[error("not enough memory")]
    NoMemory = 0xC000_0017,
    #[error("access denied")]
    AccessDenied = 0xC000_0022,
    #[error("object type mismatch")]
    ObjectTypeMismatch = 0xC000_0024,
    #[error("object name not found")]
    ObjectNameNotFound = 0xC000_0034,
    #[error("semaphore limit exceeded")]
    SemaphoreLimitExceeded = 0xC000_0047,
    #[error("insufficient resources")]
    InsufficientResources = 0xC000_009A,
    #[error("too many opened files")]
    TooManyOpenedFiles = 0xC000_011F,
    #[error("thread is terminating")]
    ThreadIsTerminating = 0xC000_004B,
    #[error("process is terminating")]
    ProcessIsTerminating = 0xC000_010A,
}

impl NtStatus {
    /// Numeric NT status code.
    #[inline]
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Severity test: informational codes are not errors.
    #[inline]
    pub fn is_error(self) -> bool {
        self.code() & 0xC000_0000 == 0xC000_0000
    }

    /// Rebuild a status from its wire representation.
    ///
    /// Unknown codes collapse to `Unsuccessful`; the supervisor is the
    /// authority on object state, but a malformed peer must not be able to
    /// fabricate a status the client cannot represent.
    pub fn from_code(code: u32) -> NtStatus {
        match code {
            0x0000_0103 => NtStatus::Pending,
            0x0000_00C0 => NtStatus::UserApc,
            0x0000_0101 => NtStatus::Alerted,
            0x0000_0102 => NtStatus::Timeout,
            0xC000_0001 => NtStatus::Unsuccessful,
            0xC000_0008 => NtStatus::InvalidHandle,
            0xC000_000D => NtStatus::InvalidParameter,
            0xC000_0017 => NtStatus::NoMemory,
            0xC000_0022 => NtStatus::AccessDenied,
            0xC000_0024 => NtStatus::ObjectTypeMismatch,
            0xC000_0034 => NtStatus::ObjectNameNotFound,
            0xC000_0047 => NtStatus::SemaphoreLimitExceeded,
            0xC000_009A => NtStatus::InsufficientResources,
            0xC000_011F => NtStatus::TooManyOpenedFiles,
            0xC000_004B => NtStatus::ThreadIsTerminating,
            0xC000_010A => NtStatus::ProcessIsTerminating,
            _ => NtStatus::Unsuccessful,
        }
    }

    /// Map an OS error from a channel/descriptor creation to a status,
    /// distinguishing descriptor exhaustion from memory exhaustion.
    pub fn from_os_error(errno: i32) -> NtStatus {
        match errno {
            libc::EMFILE | libc::ENFILE => NtStatus::TooManyOpenedFiles,
            libc::ENOMEM => NtStatus::NoMemory,
            libc::EACCES | libc::EPERM => NtStatus::AccessDenied,
            libc::EINVAL => NtStatus::InvalidParameter,
            _ => NtStatus::Unsuccessful,
        }
    }
}

/// Outcome of a satisfied wait.
///
/// Mirrors the NT convention: `Object(n)` is `STATUS_WAIT_0 + n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The wait was satisfied by the object at this index
    /// (index 0 for wait-all).
    Object(u32),
    /// The deadline elapsed before the wait was satisfied.
    Timeout,
}

impl WaitStatus {
    /// Wire encoding: `Object(n)` is `n`, timeout is the NT timeout code.
    pub fn code(self) -> u32 {
        match self {
            WaitStatus::Object(n) => n,
            WaitStatus::Timeout => NtStatus::Timeout.code(),
        }
    }

    /// Decode the wire representation.
    pub fn from_code(code: u32) -> WaitStatus {
        if code == NtStatus::Timeout.code() {
            WaitStatus::Timeout
        } else {
            WaitStatus::Object(code)
        }
    }
}

/// Maximum number of objects in a multi-object wait.
pub const MAXIMUM_WAIT_OBJECTS: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for st in [
            NtStatus::Timeout,
            NtStatus::NoMemory,
            NtStatus::ObjectTypeMismatch,
            NtStatus::TooManyOpenedFiles,
        ] {
            assert_eq!(NtStatus::from_code(st.code()), st);
        }
        assert_eq!(NtStatus::from_code(0xDEAD_BEEF), NtStatus::Unsuccessful);
    }

    #[test]
    fn test_severity() {
        assert!(!NtStatus::Timeout.is_error());
        assert!(!NtStatus::Pending.is_error());
        assert!(NtStatus::AccessDenied.is_error());
    }

    #[test]
    fn test_fd_exhaustion_is_distinct_from_oom() {
        assert_eq!(
            NtStatus::from_os_error(libc::EMFILE),
            NtStatus::TooManyOpenedFiles
        );
        assert_eq!(NtStatus::from_os_error(libc::ENOMEM), NtStatus::NoMemory);
    }

    #[test]
    fn test_wait_status_codes() {
        assert_eq!(WaitStatus::Object(3).code(), 3);
        assert_eq!(WaitStatus::from_code(0x102), WaitStatus::Timeout);
        assert_eq!(WaitStatus::from_code(5), WaitStatus::Object(5));
    }
}
