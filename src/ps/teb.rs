//! Thread Control Block (TEB)
//!
//! One per live thread, at a stable address for the thread's whole life.
//! The ABI-visible header keeps its explicit layout in a distinct
//! `#[repr(C)]` structure; the runtime's private fields follow it, so only
//! the header needs manual layout control.
//!
//! Ownership: the block is allocated by the creating thread, handed to the
//! new thread at bootstrap, and freed only after the underlying OS thread
//! has terminated and been joined by some other thread, never by itself.

use std::cell::Cell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};

use crate::status::{NtResult, NtStatus};

/// Number of thread-local-storage slots in the TEB.
pub const TLS_SLOTS: usize = 64;

/// Reserved opaque slots for host-CPU-specific data.
pub const TEB_RESERVED_SLOTS: usize = 8;

/// Process/thread identifier pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientId {
    pub process: u32,
    pub thread: u32,
}

/// ABI-visible TEB header with a fixed field order.
///
/// Fields are atomics so that registry walkers may observe a thread
/// mid-setup or mid-teardown without tearing.
#[repr(C)]
pub struct TebHeader {
    /// Stack base (high address).
    pub stack_base: AtomicUsize,
    /// Stack limit (lowest usable address, above the guard page).
    pub stack_limit: AtomicUsize,
    /// Stack deallocation pointer (start of the reserved region).
    pub stack_dealloc: AtomicUsize,
    /// Opaque host-CPU-specific slots.
    pub reserved: [AtomicUsize; TEB_RESERVED_SLOTS],
    /// Owning process identifier (supervisor-assigned).
    pub process_id: AtomicU32,
    /// Thread identifier (supervisor-assigned at registration).
    pub thread_id: AtomicU32,
    /// Thread-local storage slot array.
    pub tls_slots: [AtomicUsize; TLS_SLOTS],
}

impl TebHeader {
    fn new() -> Self {
        const ZERO: AtomicUsize = AtomicUsize::new(0);
        Self {
            stack_base: AtomicUsize::new(0),
            stack_limit: AtomicUsize::new(0),
            stack_dealloc: AtomicUsize::new(0),
            reserved: [ZERO; TEB_RESERVED_SLOTS],
            process_id: AtomicU32::new(0),
            thread_id: AtomicU32::new(0),
            tls_slots: [ZERO; TLS_SLOTS],
        }
    }
}

/// Runtime-private portion of the TEB.
pub struct TebPrivate {
    /// Alert eventfd; poked when an APC is queued. -1 until registered.
    pub alert_fd: AtomicI32,
    /// Suspend eventfd; the thread parks on it while suspended.
    pub suspend_fd: AtomicI32,
    /// Ack eventfd; the thread reports parking on it.
    pub ack_fd: AtomicI32,
    /// Host thread handle, set by the creator once the OS thread exists.
    pub host_thread: spin::Mutex<Option<libc::pthread_t>>,
    /// Owned stack region for threads created by this runtime.
    pub stack: spin::Mutex<Option<StackRegion>>,
    /// The thread has finished running; its record awaits reaping.
    pub exited: AtomicBool,
}

/// Thread Control Block: ABI header followed by private fields.
pub struct Teb {
    pub header: TebHeader,
    pub private: TebPrivate,
}

// Safety: every mutable field is an atomic or behind a lock; the raw
// pointers cached per-thread only ever reference live registry entries.
unsafe impl Send for Teb {}
unsafe impl Sync for Teb {}

impl Teb {
    /// Allocate a TEB at a stable address.
    ///
    /// Non-fatal for ordinary thread creation; the process bootstrap path
    /// treats a failure here as fatal since nothing can run without the
    /// first TCB.
    pub fn allocate() -> NtResult<Box<Teb>> {
        Ok(Box::new(Teb {
            header: TebHeader::new(),
            private: TebPrivate {
                alert_fd: AtomicI32::new(-1),
                suspend_fd: AtomicI32::new(-1),
                ack_fd: AtomicI32::new(-1),
                host_thread: spin::Mutex::new(None),
                stack: spin::Mutex::new(None),
                exited: AtomicBool::new(false),
            },
        }))
    }

    /// Record the stack bounds of an owned stack region.
    pub fn set_stack(&self, stack: &StackRegion) {
        self.header
            .stack_base
            .store(stack.base_high() as usize, Ordering::Release);
        self.header
            .stack_limit
            .store(stack.limit() as usize, Ordering::Release);
        self.header
            .stack_dealloc
            .store(stack.dealloc() as usize, Ordering::Release);
    }

    pub fn client_id(&self) -> ClientId {
        ClientId {
            process: self.header.process_id.load(Ordering::Acquire),
            thread: self.header.thread_id.load(Ordering::Acquire),
        }
    }

    #[inline]
    pub fn tls_get(&self, index: u32) -> usize {
        self.header.tls_slots[index as usize].load(Ordering::Acquire)
    }

    #[inline]
    pub fn tls_set(&self, index: u32, value: usize) {
        self.header.tls_slots[index as usize].store(value, Ordering::Release);
    }
}

// ============================================================================
// Current-thread lookup
// ============================================================================

thread_local! {
    static CURRENT_TEB: Cell<*const Teb> = const { Cell::new(ptr::null()) };
}

/// Publish `teb` as the calling thread's control block.
///
/// # Safety
/// `teb` must stay valid until `detach_current` runs on this thread.
pub unsafe fn attach_current(teb: *const Teb) {
    CURRENT_TEB.with(|c| c.set(teb));
}

/// Clear the calling thread's control block pointer.
pub fn detach_current() {
    CURRENT_TEB.with(|c| c.set(ptr::null()));
}

/// Run `f` against the calling thread's TEB, if it has one.
pub fn with_current<R>(f: impl FnOnce(&Teb) -> R) -> Option<R> {
    CURRENT_TEB.with(|c| {
        let p = c.get();
        if p.is_null() {
            None
        } else {
            // Safety: attach_current's contract keeps the block alive
            // while this thread runs.
            Some(f(unsafe { &*p }))
        }
    })
}

/// The calling thread's runtime identifier, or 0 before registration.
pub fn current_thread_id() -> u32 {
    with_current(|teb| teb.header.thread_id.load(Ordering::Acquire)).unwrap_or(0)
}

// ============================================================================
// Stack region
// ============================================================================

/// A reserved stack with a guard page at its low end, unmapped on drop.
pub struct StackRegion {
    base: NonNull<u8>,
    total: usize,
    guard: usize,
}

// Safety: the region is owned; the pointer never aliases another mapping.
unsafe impl Send for StackRegion {}
unsafe impl Sync for StackRegion {}

impl StackRegion {
    /// Smallest stack reservation honored.
    pub const MIN_RESERVE: usize = 0x10000;

    /// Default reservation when the caller passes zero.
    pub const DEFAULT_RESERVE: usize = 0x100000;

    /// Reserve a stack of `reserve` bytes (`commit` is validated but the
    /// host commits lazily). Sizes are rounded up to whole pages and the
    /// minimum reservation is enforced.
    pub fn reserve(reserve: usize, commit: usize) -> NtResult<StackRegion> {
        let page = crate::ke::shm::page_size();
        let mut reserve = if reserve == 0 {
            Self::DEFAULT_RESERVE
        } else {
            reserve
        };
        reserve = reserve.max(Self::MIN_RESERVE);
        reserve = (reserve + page - 1) & !(page - 1);
        if commit > reserve {
            return Err(NtStatus::InvalidParameter);
        }

        let total = reserve + page;
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(NtStatus::from_os_error(errno));
        }
        // Guard page at the low end catches overflow.
        let rc = unsafe { libc::mprotect(addr, page, libc::PROT_NONE) };
        if rc != 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            unsafe {
                libc::munmap(addr, total);
            }
            return Err(NtStatus::from_os_error(errno));
        }
        Ok(StackRegion {
            base: NonNull::new(addr as *mut u8).ok_or(NtStatus::NoMemory)?,
            total,
            guard: page,
        })
    }

    /// Start of the reserved region (the deallocation pointer).
    pub fn dealloc(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Lowest usable address, just above the guard page.
    pub fn limit(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.guard) }
    }

    /// Highest stack address.
    pub fn base_high(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.total) }
    }

    /// Usable bytes between limit and base.
    pub fn usable_size(&self) -> usize {
        self.total - self.guard
    }
}

impl Drop for StackRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_minimum_enforced() {
        let stack = StackRegion::reserve(1, 0).unwrap();
        assert!(stack.usable_size() >= StackRegion::MIN_RESERVE);
        assert!(stack.limit() > stack.dealloc());
        assert!(stack.base_high() > stack.limit());
    }

    #[test]
    fn test_commit_larger_than_reserve_rejected() {
        assert_eq!(
            StackRegion::reserve(0x20000, 0x40000).err(),
            Some(NtStatus::InvalidParameter)
        );
    }

    #[test]
    fn test_teb_stack_bounds_recorded() {
        let teb = Teb::allocate().unwrap();
        let stack = StackRegion::reserve(0x20000, 0x1000).unwrap();
        teb.set_stack(&stack);
        assert_eq!(
            teb.header.stack_dealloc.load(Ordering::Relaxed),
            stack.dealloc() as usize
        );
        assert_eq!(
            teb.header.stack_base.load(Ordering::Relaxed)
                - teb.header.stack_limit.load(Ordering::Relaxed),
            stack.usable_size()
        );
    }

    #[test]
    fn test_current_thread_attach() {
        assert_eq!(current_thread_id(), 0);
        let teb = Teb::allocate().unwrap();
        teb.header.thread_id.store(42, Ordering::Release);
        unsafe { attach_current(&*teb) };
        assert_eq!(current_thread_id(), 42);
        assert_eq!(with_current(|t| t.client_id().thread), Some(42));
        detach_current();
        assert_eq!(current_thread_id(), 0);
    }

    #[test]
    fn test_tls_slots() {
        let teb = Teb::allocate().unwrap();
        teb.tls_set(5, 0xBEEF);
        assert_eq!(teb.tls_get(5), 0xBEEF);
        assert_eq!(teb.tls_get(6), 0);
    }
}
