//! Bounded Retry
//!
//! Some supervisor requests (thread-context reads against a running
//! target) legitimately answer `Pending` and must be reissued. Rather
//! than ad hoc loop-and-sleep sites, the retry policy lives here with an
//! explicit exhaustion outcome.

use std::thread;
use std::time::Duration;

use crate::status::{NtResult, NtStatus};

/// Default attempt budget for pending supervisor operations.
pub const PENDING_RETRY_ATTEMPTS: u32 = 100;

/// Default pause between attempts.
pub const PENDING_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Reissue `op` while it answers `Pending`, up to `attempts` times with
/// `delay` between attempts.
///
/// Exhaustion maps to `AccessDenied`: a target that never becomes
/// observable is indistinguishable from one the caller may not inspect.
/// Any other status, success or failure, is returned as-is on first sight.
pub fn retry_while_pending<T>(
    attempts: u32,
    delay: Duration,
    mut op: impl FnMut() -> NtResult<T>,
) -> NtResult<T> {
    for attempt in 0..attempts {
        match op() {
            Err(NtStatus::Pending) => {
                if attempt + 1 < attempts {
                    thread::sleep(delay);
                }
            }
            other => return other,
        }
    }
    Err(NtStatus::AccessDenied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediate_success() {
        let r = retry_while_pending(5, Duration::ZERO, || Ok(42u32));
        assert_eq!(r, Ok(42));
    }

    #[test]
    fn test_resolves_after_pending() {
        let mut calls = 0;
        let r = retry_while_pending(10, Duration::ZERO, || {
            calls += 1;
            if calls < 4 {
                Err(NtStatus::Pending)
            } else {
                Ok(calls)
            }
        });
        assert_eq!(r, Ok(4));
    }

    #[test]
    fn test_exhaustion_is_access_denied() {
        let mut calls = 0;
        let r: NtResult<()> = retry_while_pending(7, Duration::ZERO, || {
            calls += 1;
            Err(NtStatus::Pending)
        });
        assert_eq!(r, Err(NtStatus::AccessDenied));
        assert_eq!(calls, 7);
    }

    #[test]
    fn test_hard_error_passes_through() {
        let r: NtResult<()> =
            retry_while_pending(5, Duration::ZERO, || Err(NtStatus::InvalidHandle));
        assert_eq!(r, Err(NtStatus::InvalidHandle));
    }
}
