//! Fast Synchronization Backend
//!
//! Per-object state for the eventfd-backed fast path. Each fast object is
//! an eventfd shared by every process holding the object, plus one shared
//! counter slot. The eventfd is both the wakeup primitive (poll for
//! readability) and the arbiter of consumption races: whoever wins the
//! read owns the unit. The slot words carry the bookkeeping poll cannot
//! express (semaphore count and maximum, event signaled flag).
//!
//! Slot layout: semaphores keep `{count, max}` in words 0 and 1; events
//! keep `{signaled, manual}`; thread objects keep `{exited}`. Word 0 is
//! always "signaled when non-zero", so a generic check needs no kind
//! dispatch.
//!
//! Both sides of the protocol use these operations: the supervisor for its
//! own blocking waits, clients for the no-round-trip path.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::Ordering;

use crate::csr::message::ObjectKind;
use crate::ke::shm::SlotRef;
use crate::status::{NtResult, NtStatus};

pub fn make_eventfd(initval: u32, flags: libc::c_int) -> NtResult<OwnedFd> {
    let fd = unsafe { libc::eventfd(initval, flags | libc::EFD_CLOEXEC) };
    if fd < 0 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        return Err(NtStatus::from_os_error(errno));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn eventfd_write(fd: &OwnedFd, n: u64) {
    let rc = unsafe {
        libc::write(
            fd.as_raw_fd(),
            &n as *const u64 as *const libc::c_void,
            8,
        )
    };
    if rc != 8 {
        log::warn!("eventfd write failed: {}", std::io::Error::last_os_error());
    }
}

/// Non-blocking read of one unit; false when the counter is already zero.
pub fn eventfd_read_one(fd: &OwnedFd) -> bool {
    let mut value = 0u64;
    let rc = unsafe {
        libc::read(
            fd.as_raw_fd(),
            &mut value as *mut u64 as *mut libc::c_void,
            8,
        )
    };
    rc == 8
}

/// Drain the counter to zero.
pub fn eventfd_drain(fd: &OwnedFd) {
    while eventfd_read_one(fd) {}
}

/// One fast object as seen by a single process.
pub struct FastObject {
    pub fd: OwnedFd,
    pub slot: SlotRef,
    pub kind: ObjectKind,
}

impl FastObject {
    /// Would a wait be satisfied right now?
    pub fn signaled(&self) -> bool {
        self.slot.word(0).load(Ordering::SeqCst) > 0
    }

    /// Consume one unit. Returns false when a racing consumer won the
    /// eventfd read.
    pub fn try_consume(&self) -> bool {
        match self.kind {
            ObjectKind::EventManual | ObjectKind::Thread => true,
            ObjectKind::EventAuto => {
                if !eventfd_read_one(&self.fd) {
                    return false;
                }
                self.slot.word(0).store(0, Ordering::SeqCst);
                true
            }
            ObjectKind::Semaphore => {
                if !eventfd_read_one(&self.fd) {
                    return false;
                }
                self.slot.word(0).fetch_sub(1, Ordering::SeqCst);
                true
            }
        }
    }

    /// Undo one `try_consume`, for all-wait rollback.
    pub fn give_back(&self) {
        match self.kind {
            ObjectKind::EventManual | ObjectKind::Thread => {}
            ObjectKind::EventAuto => {
                self.slot.word(0).store(1, Ordering::SeqCst);
                eventfd_write(&self.fd, 1);
            }
            ObjectKind::Semaphore => {
                self.slot.word(0).fetch_add(1, Ordering::SeqCst);
                eventfd_write(&self.fd, 1);
            }
        }
    }

    pub fn set_event(&self) {
        if self.slot.word(0).swap(1, Ordering::SeqCst) == 0 {
            eventfd_write(&self.fd, 1);
        }
    }

    pub fn reset_event(&self) {
        if self.slot.word(0).swap(0, Ordering::SeqCst) == 1 {
            eventfd_drain(&self.fd);
        }
    }

    /// Add `n` units, refusing past the maximum. Returns the previous
    /// count.
    pub fn release_semaphore(&self, n: u32) -> NtResult<u32> {
        let max = self.slot.word(1).load(Ordering::SeqCst);
        let word = self.slot.word(0);
        loop {
            let current = word.load(Ordering::SeqCst);
            if current.saturating_add(n) > max {
                return Err(NtStatus::SemaphoreLimitExceeded);
            }
            if word
                .compare_exchange(current, current + n, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                eventfd_write(&self.fd, n as u64);
                return Ok(current);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ke::shm::SharedCounters;

    fn fast_object(kind: ObjectKind, initial: u32, max: u32, tag: &str) -> FastObject {
        let dir = std::env::temp_dir().join(format!("rewind-fast-{}-{}", tag, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let counters = Box::leak(Box::new(SharedCounters::create(&dir).unwrap()));
        counters.grow_for_slot(0).unwrap();
        let slot = counters.slot(0).unwrap();
        slot.word(0).store(initial, Ordering::SeqCst);
        slot.word(1).store(max, Ordering::SeqCst);
        let flags = if kind == ObjectKind::Semaphore {
            libc::EFD_SEMAPHORE | libc::EFD_NONBLOCK
        } else {
            libc::EFD_NONBLOCK
        };
        FastObject {
            fd: make_eventfd(initial, flags).unwrap(),
            slot,
            kind,
        }
    }

    #[test]
    fn test_auto_event_single_consumer() {
        let event = fast_object(ObjectKind::EventAuto, 0, 0, "auto");
        assert!(!event.signaled());
        event.set_event();
        assert!(event.signaled());
        assert!(event.try_consume());
        assert!(!event.signaled());
        // Second consume finds nothing.
        assert!(!event.try_consume());
    }

    #[test]
    fn test_manual_event_survives_consumers() {
        let event = fast_object(ObjectKind::EventManual, 0, 0, "manual");
        event.set_event();
        assert!(event.try_consume());
        assert!(event.try_consume());
        assert!(event.signaled());
        event.reset_event();
        assert!(!event.signaled());
        assert!(!eventfd_read_one(&event.fd));
    }

    #[test]
    fn test_semaphore_counting_and_limit() {
        let sem = fast_object(ObjectKind::Semaphore, 1, 2, "sem");
        assert_eq!(sem.release_semaphore(1).unwrap(), 1);
        assert_eq!(
            sem.release_semaphore(1).err(),
            Some(NtStatus::SemaphoreLimitExceeded)
        );
        assert!(sem.try_consume());
        assert!(sem.try_consume());
        assert!(!sem.try_consume());
        assert!(!sem.signaled());
    }

    #[test]
    fn test_give_back_restores_unit() {
        let sem = fast_object(ObjectKind::Semaphore, 1, 4, "rollback");
        assert!(sem.try_consume());
        sem.give_back();
        assert!(sem.signaled());
        assert!(sem.try_consume());
    }
}
