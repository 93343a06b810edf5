//! Process Structure
//!
//! A [`Process`] ties one supervisor connection to the in-process thread
//! state: the registry of TEBs, the PEB, and thread creation. The host
//! process may carry several `Process` contexts at once (each with its
//! own engine and supervisor-assigned pid), which is how one test binary
//! exercises cross-process paths.
//!
//! Remote thread creation arrives as a system APC on any registered
//! thread of the target context; the engine's pump delegates it to
//! [`create::spawn`] through the callback installed at attach.

pub mod create;
pub mod peb;
pub mod registry;
pub mod teb;

use std::mem;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::csr::client::{RemoteSpawn, SyncEngine};
use crate::csr::message::{ObjectKind, ThreadContext};
use crate::csr::{Handle, ObjectAccess};
use crate::ke::apc::ApcEntry;
use crate::rtl::retry::{retry_while_pending, PENDING_RETRY_ATTEMPTS, PENDING_RETRY_DELAY};
use crate::status::{NtResult, NtStatus, WaitStatus};

use self::create::ThreadRoutine;
use self::peb::Peb;
use self::registry::ThreadRegistry;
use self::teb::Teb;

/// One process context: engine, thread registry, PEB.
pub struct Process {
    engine: Arc<SyncEngine>,
    registry: ThreadRegistry,
    peb: Peb,
}

impl Process {
    /// Adopt the calling thread as the first thread of a new process
    /// context. The thread registers with the supervisor, receives the
    /// context's pid, and gets a TEB like any created thread.
    ///
    /// The adopted thread must outlive every thread it creates through
    /// this context, or at least not exit before [`Process::exit_process`].
    pub fn attach(engine: Arc<SyncEngine>) -> NtResult<Arc<Process>> {
        create::install_park_handler();

        let process = Arc::new(Process {
            peb: Peb::new(Arc::clone(&engine)),
            registry: ThreadRegistry::new(),
            engine,
        });

        let identity = process.engine.current_thread_identity()?;
        let teb = Teb::allocate()?;
        teb.header.process_id.store(identity.pid, Ordering::Release);
        teb.header.thread_id.store(identity.tid, Ordering::Release);
        teb.private.alert_fd.store(identity.alert_fd, Ordering::Release);
        teb.private
            .suspend_fd
            .store(identity.suspend_fd, Ordering::Release);
        teb.private.ack_fd.store(identity.ack_fd, Ordering::Release);

        let (slot, teb) = process.registry.insert(teb);
        process.registry.bind_tid(slot, identity.tid);
        // The registry holds the block for the context's lifetime.
        unsafe { teb::attach_current(&*teb) };

        process.peb.process_id.store(identity.pid, Ordering::Release);

        let weak = Arc::downgrade(&process);
        process
            .engine
            .set_remote_spawn(Arc::new(move |spawn| remote_spawn(&weak, spawn)));

        log::info!("process context attached as pid {}", identity.pid);
        Ok(process)
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    pub fn peb(&self) -> &Peb {
        &self.peb
    }

    /// Supervisor-assigned process identifier.
    pub fn pid(&self) -> u32 {
        self.engine.pid()
    }

    // ------------------------------------------------------------------
    // Threads
    // ------------------------------------------------------------------

    /// Create a thread running `routine(arg)` on a fresh guarded stack.
    /// Returns a handle to the thread object and the new tid. A
    /// start-suspended thread parks before `routine` until resumed.
    pub fn create_thread(
        self: &Arc<Self>,
        routine: ThreadRoutine,
        arg: usize,
        stack_reserve: usize,
        stack_commit: usize,
        suspended: bool,
    ) -> NtResult<(Handle, u32)> {
        let tid = create::spawn(self, routine, arg, stack_reserve, stack_commit, suspended)?;
        let handle = self.engine.open_thread(tid)?;
        Ok((handle, tid))
    }

    /// Open a waitable handle to a thread in this context by tid.
    pub fn open_thread(&self, tid: u32) -> NtResult<Handle> {
        self.engine.open_thread(tid)
    }

    /// Increment a thread's suspend count. Self-suspension parks here,
    /// after the supervisor has recorded the count.
    pub fn suspend_thread(&self, tid: u32) -> NtResult<u32> {
        let previous = self.engine.suspend_thread(tid)?;
        if tid == teb::current_thread_id() {
            create::park_current();
        }
        Ok(previous)
    }

    /// Decrement a thread's suspend count.
    pub fn resume_thread(&self, tid: u32) -> NtResult<u32> {
        self.engine.resume_thread(tid)
    }

    /// Snapshot a thread's stored context. The target is held suspended
    /// around the read and released afterwards regardless of outcome.
    pub fn get_thread_context(&self, tid: u32) -> NtResult<ThreadContext> {
        self.engine.suspend_thread(tid)?;
        let result = retry_while_pending(PENDING_RETRY_ATTEMPTS, PENDING_RETRY_DELAY, || {
            self.engine.get_thread_context(tid)
        });
        let _ = self.engine.resume_thread(tid);
        result
    }

    /// Replace a thread's stored context, with the same suspend bracket
    /// as [`Process::get_thread_context`].
    pub fn set_thread_context(&self, tid: u32, context: &ThreadContext) -> NtResult<()> {
        self.engine.suspend_thread(tid)?;
        let result = retry_while_pending(PENDING_RETRY_ATTEMPTS, PENDING_RETRY_DELAY, || {
            self.engine.set_thread_context(tid, context)
        });
        let _ = self.engine.resume_thread(tid);
        result
    }

    /// Queue a user APC to a thread of this context.
    pub fn queue_apc(&self, tid: u32, entry: ApcEntry) -> NtResult<()> {
        self.engine.queue_user_apc(tid, entry)
    }

    /// Run any pending APCs for the calling thread. Returns how many ran.
    pub fn pump_pending_apcs(&self) -> NtResult<usize> {
        self.engine.pump_pending_apcs()
    }

    /// Ask another process context to create a thread at `entry`.
    pub fn create_remote_thread(
        &self,
        pid: u32,
        entry: u64,
        arg: u64,
        stack_reserve: u64,
        stack_commit: u64,
        suspended: bool,
    ) -> NtResult<(Handle, u32)> {
        self.engine
            .create_remote_thread(pid, entry, arg, stack_reserve, stack_commit, suspended)
    }

    /// Report the calling thread finished. Created threads do this on
    /// return from their routine; an adopted thread may call it directly.
    pub fn exit_thread(&self, code: u32) -> NtResult<()> {
        let result = self.engine.exit_thread(code);
        teb::with_current(|teb| teb.private.exited.store(true, Ordering::Release));
        teb::detach_current();
        result
    }

    /// Mark the whole context finished: every thread object signals and
    /// pending APCs are dropped. Finished host threads are reaped first.
    pub fn exit_process(&self, code: u32) -> NtResult<()> {
        create::reap_finished(self);
        let result = self.engine.exit_process(code);
        teb::with_current(|teb| teb.private.exited.store(true, Ordering::Release));
        teb::detach_current();
        result
    }

    /// Join finished threads and release their stacks. Creation does this
    /// implicitly; long-lived contexts may sweep explicitly.
    pub fn reap_finished_threads(&self) {
        create::reap_finished(self);
    }

    // ------------------------------------------------------------------
    // Thread-local storage
    // ------------------------------------------------------------------

    /// Allocate a TLS index; the slot is zero on every live thread.
    pub fn tls_alloc(&self) -> NtResult<u32> {
        self.peb.tls_alloc()
    }

    /// Free a TLS index and clear its slot on every live thread, so a
    /// later allocation of the same index starts zeroed everywhere.
    pub fn tls_free(&self, index: u32) -> NtResult<()> {
        self.peb.tls_free(index)?;
        self.registry.for_each(|teb| teb.tls_set(index, 0));
        Ok(())
    }

    /// Read the calling thread's slot.
    pub fn tls_get(&self, index: u32) -> NtResult<usize> {
        if index >= teb::TLS_SLOTS as u32 {
            return Err(NtStatus::InvalidParameter);
        }
        teb::with_current(|teb| teb.tls_get(index)).ok_or(NtStatus::InvalidParameter)
    }

    /// Write the calling thread's slot.
    pub fn tls_set(&self, index: u32, value: usize) -> NtResult<()> {
        if index >= teb::TLS_SLOTS as u32 {
            return Err(NtStatus::InvalidParameter);
        }
        teb::with_current(|teb| teb.tls_set(index, value)).ok_or(NtStatus::InvalidParameter)
    }

    // ------------------------------------------------------------------
    // Synchronization objects
    // ------------------------------------------------------------------

    /// Create (or open, when `name` already exists) an event.
    pub fn create_event(
        &self,
        manual_reset: bool,
        initially_signaled: bool,
        name: Option<&str>,
    ) -> NtResult<(Handle, bool)> {
        let kind = if manual_reset {
            ObjectKind::EventManual
        } else {
            ObjectKind::EventAuto
        };
        self.engine.create_object(
            kind,
            ObjectAccess::full(),
            initially_signaled as u32,
            0,
            name,
            None,
        )
    }

    /// Create (or open, when `name` already exists) a semaphore.
    pub fn create_semaphore(
        &self,
        initial: u32,
        maximum: u32,
        name: Option<&str>,
    ) -> NtResult<(Handle, bool)> {
        self.engine.create_object(
            ObjectKind::Semaphore,
            ObjectAccess::full(),
            initial,
            maximum,
            name,
            None,
        )
    }

    pub fn set_event(&self, handle: Handle) -> NtResult<()> {
        self.engine.set_event(handle)
    }

    pub fn reset_event(&self, handle: Handle) -> NtResult<()> {
        self.engine.reset_event(handle)
    }

    /// Release `count` units. Returns the count before the release.
    pub fn release_semaphore(&self, handle: Handle, count: u32) -> NtResult<u32> {
        self.engine.release_semaphore(handle, count)
    }

    pub fn close_handle(&self, handle: Handle) -> NtResult<()> {
        self.engine.close_handle(handle)
    }

    /// Wait for one object.
    pub fn wait_one(&self, handle: Handle, timeout: Option<Duration>) -> NtResult<WaitStatus> {
        self.engine.wait(&[handle], false, timeout, false)
    }

    /// Wait for any or all of up to 64 objects, optionally alertable.
    pub fn wait_multiple(
        &self,
        handles: &[Handle],
        wait_all: bool,
        timeout: Option<Duration>,
        alertable: bool,
    ) -> NtResult<WaitStatus> {
        self.engine.wait(handles, wait_all, timeout, alertable)
    }
}

/// Service a delegated thread creation from another process context.
fn remote_spawn(process: &Weak<Process>, spawn: RemoteSpawn) -> NtResult<u32> {
    let process = process.upgrade().ok_or(NtStatus::ProcessIsTerminating)?;
    if spawn.entry == 0 {
        return Err(NtStatus::InvalidParameter);
    }
    // The entry address came from this same process image via the wire;
    // only 0 can be rejected here.
    let routine: ThreadRoutine = unsafe { mem::transmute(spawn.entry as usize) };
    create::spawn(
        &process,
        routine,
        spawn.arg as usize,
        spawn.stack_reserve as usize,
        spawn.stack_commit as usize,
        spawn.suspended,
    )
}
