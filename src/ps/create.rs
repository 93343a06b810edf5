//! Thread Creation and Parking
//!
//! New threads run on a runtime-owned stack: a reserved region with a
//! guard page, handed to `pthread_create` via `pthread_attr_setstack`.
//! Bootstrap publishes the TEB, registers with the supervisor, reports
//! the assigned tid back to the creator, and only then runs the entry
//! routine. Start-suspended threads park before the routine runs.
//!
//! Parking is signal driven. The supervisor interrupts a running target
//! with SIGUSR1; the handler reports on the ack descriptor and sleeps in
//! a blocking read of the suspend descriptor until the final resume
//! writes it. Self-suspension skips the signal and parks directly after
//! the supervisor's reply.
//!
//! A thread cannot free its own stack, so finished threads are reaped
//! lazily: exit marks the registry entry, and the next creation (or an
//! explicit sweep) joins the host thread before the TEB and stack drop.

use std::mem;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::{Arc, Once};

use crate::status::{NtResult, NtStatus};

use super::registry::ThreadSlotId;
use super::teb::{self, StackRegion, Teb};
use super::Process;

/// Entry routine of a runtime thread.
pub type ThreadRoutine = fn(usize) -> u32;

static PARK_HANDLER: Once = Once::new();

/// Install the SIGUSR1 park handler. Idempotent; shared by every process
/// context in this host process.
pub(super) fn install_park_handler() {
    PARK_HANDLER.call_once(|| unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = park_signal_handler as usize;
        // No SA_RESTART: an interrupted wait must return so the thread
        // reaches the handler and actually parks.
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut()) != 0 {
            log::error!(
                "park handler installation failed: {}",
                std::io::Error::last_os_error()
            );
        }
    });
}

extern "C" fn park_signal_handler(
    _signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    // Async-signal-safe: atomic loads and raw fd i/o only.
    let fds = teb::with_current(|teb| {
        (
            teb.private.ack_fd.load(Ordering::Acquire),
            teb.private.suspend_fd.load(Ordering::Acquire),
        )
    });
    if let Some((ack, suspend)) = fds {
        park_on(ack, suspend);
    }
}

/// Report parked on `ack`, then sleep until the resume write lands on
/// `suspend`.
fn park_on(ack: libc::c_int, suspend: libc::c_int) {
    if ack < 0 || suspend < 0 {
        return;
    }
    let one: u64 = 1;
    unsafe {
        libc::write(ack, &one as *const u64 as *const libc::c_void, 8);
    }
    let mut value = 0u64;
    loop {
        let rc = unsafe {
            libc::read(
                suspend,
                &mut value as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if rc == 8 {
            return;
        }
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno != libc::EINTR {
            return;
        }
    }
}

/// Park the calling thread until resumed. Self-suspension and
/// start-suspended bootstrap land here without a signal.
pub(super) fn park_current() {
    let fds = teb::with_current(|teb| {
        (
            teb.private.ack_fd.load(Ordering::Acquire),
            teb.private.suspend_fd.load(Ordering::Acquire),
        )
    });
    if let Some((ack, suspend)) = fds {
        park_on(ack, suspend);
    }
}

struct BootstrapData {
    process: Arc<Process>,
    slot: ThreadSlotId,
    teb: Arc<Teb>,
    routine: ThreadRoutine,
    arg: usize,
    suspended: bool,
    tid_tx: mpsc::SyncSender<NtResult<u32>>,
}

extern "C" fn thread_trampoline(raw: *mut libc::c_void) -> *mut libc::c_void {
    let data = unsafe { Box::from_raw(raw as *mut BootstrapData) };
    run_thread(*data);
    std::ptr::null_mut()
}

fn run_thread(data: BootstrapData) {
    let BootstrapData {
        process,
        slot,
        teb,
        routine,
        arg,
        suspended,
        tid_tx,
    } = data;

    // The registry keeps the block alive past this thread's death, so the
    // attach contract holds until detach below.
    unsafe { teb::attach_current(&*teb) };

    let engine = process.engine();
    let identity = engine.register_current_thread(
        routine as usize as u64,
        teb.header.stack_base.load(Ordering::Acquire) as u64,
        teb.header.stack_limit.load(Ordering::Acquire) as u64,
        suspended,
    );
    let identity = match identity {
        Ok(identity) => identity,
        Err(status) => {
            teb::detach_current();
            teb.private.exited.store(true, Ordering::Release);
            let _ = tid_tx.send(Err(status));
            return;
        }
    };

    teb.header.process_id.store(identity.pid, Ordering::Release);
    teb.header.thread_id.store(identity.tid, Ordering::Release);
    teb.private.alert_fd.store(identity.alert_fd, Ordering::Release);
    teb.private
        .suspend_fd
        .store(identity.suspend_fd, Ordering::Release);
    teb.private.ack_fd.store(identity.ack_fd, Ordering::Release);
    process.registry().bind_tid(slot, identity.tid);

    // The creator unblocks here; the handle it opens stays valid because
    // the supervisor already owns the thread object.
    let _ = tid_tx.send(Ok(identity.tid));

    if suspended {
        park_current();
    }

    let code = routine(arg);
    log::debug!("thread {} returned {:#x}", identity.tid, code);

    // Also drops this thread's channel.
    if let Err(status) = engine.exit_thread(code) {
        log::warn!("thread {} exit report failed: {}", identity.tid, status);
    }
    teb::detach_current();
    teb.private.exited.store(true, Ordering::Release);
}

/// Create a thread in `process`, returning its supervisor-assigned tid
/// once bootstrap has registered it.
pub(super) fn spawn(
    process: &Arc<Process>,
    routine: ThreadRoutine,
    arg: usize,
    stack_reserve: usize,
    stack_commit: usize,
    suspended: bool,
) -> NtResult<u32> {
    install_park_handler();
    reap_finished(process);

    let stack = StackRegion::reserve(stack_reserve, stack_commit)?;
    let stack_low = stack.limit();
    let stack_size = stack.usable_size();

    let teb = Teb::allocate()?;
    teb.set_stack(&stack);
    let (slot, teb) = process.registry().insert(teb);
    *teb.private.stack.lock() = Some(stack);

    let (tid_tx, tid_rx) = mpsc::sync_channel(1);
    let raw = Box::into_raw(Box::new(BootstrapData {
        process: Arc::clone(process),
        slot,
        teb: Arc::clone(&teb),
        routine,
        arg,
        suspended,
        tid_tx,
    }));

    let mut attr: libc::pthread_attr_t = unsafe { mem::zeroed() };
    let mut handle: libc::pthread_t = unsafe { mem::zeroed() };
    let rc = unsafe {
        let mut rc = libc::pthread_attr_init(&mut attr);
        if rc == 0 {
            rc = libc::pthread_attr_setstack(
                &mut attr,
                stack_low as *mut libc::c_void,
                stack_size,
            );
        }
        if rc == 0 {
            rc = libc::pthread_create(
                &mut handle,
                &attr,
                thread_trampoline,
                raw as *mut libc::c_void,
            );
        }
        libc::pthread_attr_destroy(&mut attr);
        rc
    };
    if rc != 0 {
        // The thread never existed; the bootstrap box is still ours.
        drop(unsafe { Box::from_raw(raw) });
        process.registry().remove(slot);
        return Err(spawn_error(rc));
    }
    *teb.private.host_thread.lock() = Some(handle);

    match tid_rx.recv() {
        Ok(Ok(tid)) => Ok(tid),
        Ok(Err(status)) => {
            // Registration failed and the thread has already returned.
            join_and_release(process, slot);
            Err(status)
        }
        Err(_) => {
            join_and_release(process, slot);
            Err(NtStatus::Unsuccessful)
        }
    }
}

/// Join every finished thread and release its TEB and stack.
pub(super) fn reap_finished(process: &Process) {
    for teb in process.registry().take_exited() {
        join_host(&teb);
    }
}

fn join_and_release(process: &Process, slot: ThreadSlotId) {
    if let Some(teb) = process.registry().remove(slot) {
        join_host(&teb);
    }
}

/// `pthread_create` reports both thread-limit and memory pressure as
/// EAGAIN; surface that as resource exhaustion rather than a generic
/// failure.
fn spawn_error(rc: i32) -> NtStatus {
    if rc == libc::EAGAIN {
        NtStatus::InsufficientResources
    } else {
        NtStatus::from_os_error(rc)
    }
}

fn join_host(teb: &Teb) {
    // Taking the handle is the join token; a concurrent reaper that loses
    // the take must not join again.
    let handle = teb.private.host_thread.lock().take();
    if let Some(handle) = handle {
        let rc = unsafe { libc::pthread_join(handle, std::ptr::null_mut()) };
        if rc != 0 {
            log::warn!("host thread join failed: {}", rc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_error_distinguishes_exhaustion() {
        assert_eq!(spawn_error(libc::EAGAIN), NtStatus::InsufficientResources);
        assert_eq!(spawn_error(libc::ENOMEM), NtStatus::NoMemory);
        assert_eq!(spawn_error(libc::EINVAL), NtStatus::InvalidParameter);
    }
}
