//! Client Engine
//!
//! Process-side endpoint of the supervisor protocol. Every thread that
//! touches a synchronization object holds its own channel: a connected
//! stream for request/reply plus the alert, suspend and ack eventfds
//! received at registration. Channels are cached per thread, keyed by
//! engine, so two engines in one process never share a stream.
//!
//! Waits are alert-aware: a queued asynchronous call interrupts an
//! alertable wait, runs on this thread, and the wait resumes with its
//! remaining timeout. With the fast backend active the whole wait happens
//! locally with `poll` on the objects' eventfds and never leaves the
//! process.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::ke::apc::ApcEntry;
use crate::ke::fast::{eventfd_drain, FastObject};
use crate::ke::shm::{SharedCounters, NO_SLOT};
use crate::status::{NtResult, NtStatus, WaitStatus, MAXIMUM_WAIT_OBJECTS};

use super::fdpass::{recv_frame, send_frame};
use super::message::{
    ApcPayload, CreateObjectRequest, CreateObjectReply, HelloReply, HelloRequest, MessageReader,
    MessageWriter, ObjectKind, Opcode, ThreadContext, WaitRequest,
};
use super::server::STATUS_SUCCESS;
use super::{Handle, ObjectAccess};

/// Thread creation work delegated by a remote process.
#[derive(Debug, Clone, Copy)]
pub struct RemoteSpawn {
    pub entry: u64,
    pub arg: u64,
    pub stack_reserve: u64,
    pub stack_commit: u64,
    pub suspended: bool,
}

type RemoteSpawnFn = dyn Fn(RemoteSpawn) -> NtResult<u32> + Send + Sync;

/// This thread's registration with the supervisor, as raw material for the
/// thread control block.
#[derive(Debug, Clone, Copy)]
pub struct ThreadIdentity {
    pub pid: u32,
    pub tid: u32,
    pub alert_fd: RawFd,
    pub suspend_fd: RawFd,
    pub ack_fd: RawFd,
}

struct ThreadChannel {
    stream: UnixStream,
    alert: OwnedFd,
    suspend: OwnedFd,
    ack: OwnedFd,
    pid: u32,
    tid: u32,
}

thread_local! {
    static CHANNELS: RefCell<HashMap<u64, Rc<ThreadChannel>>> =
        RefCell::new(HashMap::new());
}

static NEXT_ENGINE: AtomicU64 = AtomicU64::new(1);

/// Connection to one supervisor installation.
pub struct SyncEngine {
    id: u64,
    socket_path: PathBuf,
    config_dir: PathBuf,
    /// Process cookie; 0 until the first thread registers.
    cookie: AtomicU64,
    pid: AtomicU32,
    fastsync: AtomicBool,
    counters: spin::Mutex<Option<Arc<SharedCounters>>>,
    fast_objects: spin::Mutex<HashMap<u32, Arc<FastObject>>>,
    remote_spawn: spin::Mutex<Option<Arc<RemoteSpawnFn>>>,
}

impl SyncEngine {
    /// Connect and register the calling thread.
    pub fn connect(socket_path: &Path, config_dir: &Path) -> NtResult<Arc<SyncEngine>> {
        let engine = Arc::new(SyncEngine {
            id: NEXT_ENGINE.fetch_add(1, Ordering::Relaxed),
            socket_path: socket_path.to_path_buf(),
            config_dir: config_dir.to_path_buf(),
            cookie: AtomicU64::new(0),
            pid: AtomicU32::new(0),
            fastsync: AtomicBool::new(false),
            counters: spin::Mutex::new(None),
            fast_objects: spin::Mutex::new(HashMap::new()),
            remote_spawn: spin::Mutex::new(None),
        });
        engine.ensure_channel()?;
        Ok(engine)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Supervisor-assigned process identifier.
    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Acquire)
    }

    pub fn is_fastsync(&self) -> bool {
        self.fastsync.load(Ordering::Acquire)
    }

    /// Install the callback that services remote thread-creation requests.
    pub fn set_remote_spawn(&self, f: Arc<RemoteSpawnFn>) {
        *self.remote_spawn.lock() = Some(f);
    }

    // ------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------

    /// Register the calling thread with explicit context, for thread
    /// bootstrap. Fails if the thread already holds a channel.
    pub fn register_current_thread(
        &self,
        entry: u64,
        stack_base: u64,
        stack_limit: u64,
        suspended: bool,
    ) -> NtResult<ThreadIdentity> {
        let exists = CHANNELS.with(|c| c.borrow().contains_key(&self.id));
        if exists {
            return Err(NtStatus::InvalidParameter);
        }
        let channel = self.open_channel(entry, stack_base, stack_limit, suspended)?;
        Ok(ThreadIdentity {
            pid: channel.pid,
            tid: channel.tid,
            alert_fd: channel.alert.as_raw_fd(),
            suspend_fd: channel.suspend.as_raw_fd(),
            ack_fd: channel.ack.as_raw_fd(),
        })
    }

    /// Identity of the calling thread, registering it implicitly.
    pub fn current_thread_identity(&self) -> NtResult<ThreadIdentity> {
        let channel = self.ensure_channel()?;
        Ok(ThreadIdentity {
            pid: channel.pid,
            tid: channel.tid,
            alert_fd: channel.alert.as_raw_fd(),
            suspend_fd: channel.suspend.as_raw_fd(),
            ack_fd: channel.ack.as_raw_fd(),
        })
    }

    /// Drop the calling thread's channel. The stream closing tells the
    /// supervisor the thread is gone even without an explicit exit.
    pub fn detach_current_thread(&self) {
        CHANNELS.with(|c| c.borrow_mut().remove(&self.id));
    }

    fn ensure_channel(&self) -> NtResult<Rc<ThreadChannel>> {
        if let Some(channel) = CHANNELS.with(|c| c.borrow().get(&self.id).cloned()) {
            return Ok(channel);
        }
        self.open_channel(0, 0, 0, false)
    }

    fn open_channel(
        &self,
        entry: u64,
        stack_base: u64,
        stack_limit: u64,
        suspended: bool,
    ) -> NtResult<Rc<ThreadChannel>> {
        let stream = UnixStream::connect(&self.socket_path)
            .map_err(|e| NtStatus::from_os_error(e.raw_os_error().unwrap_or(0)))?;
        let req = HelloRequest {
            cookie: self.cookie.load(Ordering::Acquire),
            unix_pid: std::process::id(),
            unix_tid: unsafe { libc::syscall(libc::SYS_gettid) as u32 },
            entry,
            stack_base,
            stack_limit,
            suspended,
        };
        send_frame(&stream, Opcode::Hello as u32, &req.encode(), &[])?;
        let (code, payload, mut fds) = recv_frame(&stream)?;
        if code != STATUS_SUCCESS {
            return Err(NtStatus::from_code(code));
        }
        let reply = HelloReply::decode(&payload)?;
        if fds.len() != 3 {
            return Err(NtStatus::Unsuccessful);
        }
        let ack = fds.pop().ok_or(NtStatus::Unsuccessful)?;
        let suspend = fds.pop().ok_or(NtStatus::Unsuccessful)?;
        let alert = fds.pop().ok_or(NtStatus::Unsuccessful)?;

        self.cookie.store(reply.cookie, Ordering::Release);
        self.pid.store(reply.pid, Ordering::Release);
        self.fastsync.store(reply.fastsync, Ordering::Release);

        let channel = Rc::new(ThreadChannel {
            stream,
            alert,
            suspend,
            ack,
            pid: reply.pid,
            tid: reply.tid,
        });
        CHANNELS.with(|c| {
            c.borrow_mut().insert(self.id, Rc::clone(&channel));
        });
        log::debug!("thread registered as {}.{}", reply.pid, reply.tid);
        Ok(channel)
    }

    fn request(&self, op: Opcode, payload: &[u8]) -> NtResult<(u32, Vec<u8>, Vec<OwnedFd>)> {
        let channel = self.ensure_channel()?;
        request_on(&channel, op, payload)
    }

    fn request_ok(&self, op: Opcode, payload: &[u8]) -> NtResult<Vec<u8>> {
        let (code, payload, _fds) = self.request(op, payload)?;
        if code != STATUS_SUCCESS {
            return Err(NtStatus::from_code(code));
        }
        Ok(payload)
    }

    // ------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------

    /// Create or open a synchronization object. Returns the handle and
    /// whether the object was newly created.
    pub fn create_object(
        &self,
        kind: ObjectKind,
        access: ObjectAccess,
        initial: u32,
        max: u32,
        name: Option<&str>,
        security: Option<&[u8]>,
    ) -> NtResult<(Handle, bool)> {
        let req = CreateObjectRequest {
            kind,
            access: access.bits(),
            initial,
            max,
            name: name.map(String::from),
            security: security.map(Vec::from),
        };
        let (code, payload, fds) = self.request(Opcode::CreateObject, &req.encode())?;
        if code != STATUS_SUCCESS {
            return Err(NtStatus::from_code(code));
        }
        let reply = CreateObjectReply::decode(&payload)?;
        self.adopt_fast(&reply, fds)?;
        Ok((Handle(reply.handle), reply.created))
    }

    /// Open a handle to another thread's waitable object.
    pub fn open_thread(&self, tid: u32) -> NtResult<Handle> {
        let mut w = MessageWriter::new();
        w.put_u32(tid);
        let (code, payload, fds) = self.request(Opcode::OpenThread, &w.finish())?;
        if code != STATUS_SUCCESS {
            return Err(NtStatus::from_code(code));
        }
        let reply = CreateObjectReply::decode(&payload)?;
        self.adopt_fast(&reply, fds)?;
        Ok(Handle(reply.handle))
    }

    fn adopt_fast(&self, reply: &CreateObjectReply, fds: Vec<OwnedFd>) -> NtResult<()> {
        if reply.shm_idx == NO_SLOT {
            return Ok(());
        }
        let fd = match fds.into_iter().next() {
            Some(fd) => fd,
            None => return Err(NtStatus::Unsuccessful),
        };
        let counters = self.counters()?;
        let slot = counters.slot(reply.shm_idx)?;
        self.fast_objects.lock().insert(
            reply.handle,
            Arc::new(FastObject {
                fd,
                slot,
                kind: reply.kind,
            }),
        );
        Ok(())
    }

    fn counters(&self) -> NtResult<Arc<SharedCounters>> {
        let mut guard = self.counters.lock();
        if guard.is_none() {
            *guard = Some(Arc::new(SharedCounters::open(&self.config_dir)?));
        }
        Ok(Arc::clone(guard.as_ref().ok_or(NtStatus::Unsuccessful)?))
    }

    fn fast_object(&self, handle: Handle) -> Option<Arc<FastObject>> {
        self.fast_objects.lock().get(&handle.0).cloned()
    }

    pub fn close_handle(&self, handle: Handle) -> NtResult<()> {
        self.fast_objects.lock().remove(&handle.0);
        let mut w = MessageWriter::new();
        w.put_u32(handle.0);
        self.request_ok(Opcode::CloseHandle, &w.finish())?;
        Ok(())
    }

    pub fn set_event(&self, handle: Handle) -> NtResult<()> {
        if let Some(fast) = self.fast_object(handle) {
            if fast.kind.is_event() {
                fast.set_event();
                return Ok(());
            }
            return Err(NtStatus::ObjectTypeMismatch);
        }
        let mut w = MessageWriter::new();
        w.put_u32(handle.0);
        self.request_ok(Opcode::SetEvent, &w.finish())?;
        Ok(())
    }

    pub fn reset_event(&self, handle: Handle) -> NtResult<()> {
        if let Some(fast) = self.fast_object(handle) {
            if fast.kind.is_event() {
                fast.reset_event();
                return Ok(());
            }
            return Err(NtStatus::ObjectTypeMismatch);
        }
        let mut w = MessageWriter::new();
        w.put_u32(handle.0);
        self.request_ok(Opcode::ResetEvent, &w.finish())?;
        Ok(())
    }

    /// Release `count` units. Returns the previous count; over-release
    /// fails and leaves the count untouched.
    pub fn release_semaphore(&self, handle: Handle, count: u32) -> NtResult<u32> {
        if count == 0 {
            return Err(NtStatus::InvalidParameter);
        }
        if let Some(fast) = self.fast_object(handle) {
            if fast.kind == ObjectKind::Semaphore {
                return fast.release_semaphore(count);
            }
            return Err(NtStatus::ObjectTypeMismatch);
        }
        let mut w = MessageWriter::new();
        w.put_u32(handle.0);
        w.put_u32(count);
        let payload = self.request_ok(Opcode::ReleaseSemaphore, &w.finish())?;
        MessageReader::new(&payload).get_u32()
    }

    // ------------------------------------------------------------------
    // Waiting
    // ------------------------------------------------------------------

    /// Wait for one or all of `handles`. `None` waits forever; a zero
    /// timeout polls once. Alertable waits run queued asynchronous calls
    /// on this thread and then resume with the remaining timeout.
    pub fn wait(
        &self,
        handles: &[Handle],
        wait_all: bool,
        timeout: Option<Duration>,
        alertable: bool,
    ) -> NtResult<WaitStatus> {
        if handles.is_empty() || handles.len() > MAXIMUM_WAIT_OBJECTS {
            return Err(NtStatus::InvalidParameter);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let channel = self.ensure_channel()?;

        if self.is_fastsync() {
            let fasts: Vec<Arc<FastObject>> = handles
                .iter()
                .filter_map(|&h| self.fast_object(h))
                .collect();
            if fasts.len() == handles.len() {
                return self.fast_wait(&channel, &fasts, wait_all, deadline, alertable);
            }
            // Handles without a local mirror fall back to the supervisor.
        }

        loop {
            let req = WaitRequest {
                handles: handles.iter().map(|h| h.0).collect(),
                wait_all,
                timeout_ms: remaining_ms(deadline),
                alertable,
            };
            send_frame(&channel.stream, Opcode::Wait as u32, &req.encode(), &[])?;
            let (code, _payload, _fds) = recv_frame(&channel.stream)?;
            match code {
                c if (c as usize) < MAXIMUM_WAIT_OBJECTS => {
                    return Ok(WaitStatus::Object(c));
                }
                c if c == NtStatus::Timeout.code() => return Ok(WaitStatus::Timeout),
                c if c == NtStatus::UserApc.code() => {
                    self.pump_apcs(&channel)?;
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            return Ok(WaitStatus::Timeout);
                        }
                    }
                }
                c => return Err(NtStatus::from_code(c)),
            }
        }
    }

    /// Local wait on eventfds: no supervisor round trip.
    fn fast_wait(
        &self,
        channel: &ThreadChannel,
        fasts: &[Arc<FastObject>],
        wait_all: bool,
        deadline: Option<Instant>,
        alertable: bool,
    ) -> NtResult<WaitStatus> {
        loop {
            if let Some(status) = try_consume_set(fasts, wait_all) {
                return Ok(status);
            }

            let timeout = match deadline {
                None => -1,
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Ok(WaitStatus::Timeout);
                    }
                    left.as_millis().min(i32::MAX as u128) as libc::c_int
                }
            };

            let mut pollfds: Vec<libc::pollfd> = fasts
                .iter()
                .map(|f| libc::pollfd {
                    fd: f.fd.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                })
                .collect();
            if alertable {
                pollfds.push(libc::pollfd {
                    fd: channel.alert.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                });
            }

            let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as _, timeout) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(NtStatus::from_os_error(err.raw_os_error().unwrap_or(0)));
            }
            if rc == 0 {
                return Ok(WaitStatus::Timeout);
            }
            if alertable && pollfds.last().map(|p| p.revents & libc::POLLIN != 0) == Some(true) {
                self.pump_apcs(channel)?;
            }
            // Readiness is only a hint; the consume attempt at the top of
            // the loop arbitrates.
        }
    }

    // ------------------------------------------------------------------
    // Asynchronous calls
    // ------------------------------------------------------------------

    /// Queue a user call to a thread of this process.
    pub fn queue_user_apc(&self, tid: u32, entry: ApcEntry) -> NtResult<()> {
        let (routine, args) = entry.to_wire();
        let mut w = MessageWriter::new();
        w.put_u32(tid);
        let mut payload = w.finish();
        payload.extend_from_slice(&ApcPayload::User { routine, args }.encode());
        self.request_ok(Opcode::QueueApc, &payload)?;
        Ok(())
    }

    /// Drain the alert descriptor and run every pending call. Returns how
    /// many were delivered.
    pub fn pump_pending_apcs(&self) -> NtResult<usize> {
        let channel = self.ensure_channel()?;
        self.pump_apcs(&channel)
    }

    fn pump_apcs(&self, channel: &ThreadChannel) -> NtResult<usize> {
        eventfd_drain(&channel.alert);
        let mut delivered = 0;
        loop {
            let (code, payload, _fds) = request_on(channel, Opcode::GetPendingApc, &[])?;
            if code != STATUS_SUCCESS {
                return Err(NtStatus::from_code(code));
            }
            match ApcPayload::decode(&payload)? {
                ApcPayload::None => break,
                ApcPayload::User { routine, args } => {
                    // The supervisor echoes back what this process queued,
                    // so the address is valid here.
                    if let Some(entry) = unsafe { ApcEntry::from_wire(routine, args) } {
                        entry.deliver();
                        delivered += 1;
                    }
                }
                ApcPayload::CreateThread {
                    cookie,
                    entry,
                    arg,
                    stack_reserve,
                    stack_commit,
                    suspended,
                } => {
                    let spawn = self.remote_spawn.lock().clone();
                    let result = match spawn {
                        Some(spawn) => spawn(RemoteSpawn {
                            entry,
                            arg,
                            stack_reserve,
                            stack_commit,
                            suspended,
                        }),
                        None => {
                            log::warn!("remote spawn requested but no handler installed");
                            Err(NtStatus::Unsuccessful)
                        }
                    };
                    let (status, tid) = match result {
                        Ok(tid) => (STATUS_SUCCESS, tid),
                        Err(e) => (e.code(), 0),
                    };
                    let mut w = MessageWriter::new();
                    w.put_u64(cookie);
                    w.put_u32(status);
                    w.put_u32(tid);
                    let (code, _, _) = request_on(channel, Opcode::ApcComplete, &w.finish())?;
                    if code != STATUS_SUCCESS {
                        return Err(NtStatus::from_code(code));
                    }
                    delivered += 1;
                }
            }
        }
        Ok(delivered)
    }

    // ------------------------------------------------------------------
    // Thread control
    // ------------------------------------------------------------------

    /// Increment a thread's suspend count. Returns the previous count.
    pub fn suspend_thread(&self, tid: u32) -> NtResult<u32> {
        let mut w = MessageWriter::new();
        w.put_u32(tid);
        let payload = self.request_ok(Opcode::SuspendThread, &w.finish())?;
        MessageReader::new(&payload).get_u32()
    }

    /// Decrement a thread's suspend count. Returns the previous count.
    pub fn resume_thread(&self, tid: u32) -> NtResult<u32> {
        let mut w = MessageWriter::new();
        w.put_u32(tid);
        let payload = self.request_ok(Opcode::ResumeThread, &w.finish())?;
        MessageReader::new(&payload).get_u32()
    }

    /// Read a suspended thread's stored context. `Pending` until the
    /// target has parked.
    pub fn get_thread_context(&self, tid: u32) -> NtResult<ThreadContext> {
        let mut w = MessageWriter::new();
        w.put_u32(tid);
        let payload = self.request_ok(Opcode::GetThreadContext, &w.finish())?;
        ThreadContext::decode(&payload)
    }

    /// Replace a suspended thread's stored context.
    pub fn set_thread_context(&self, tid: u32, context: &ThreadContext) -> NtResult<()> {
        let mut w = MessageWriter::new();
        w.put_u32(tid);
        let mut payload = w.finish();
        payload.extend_from_slice(&context.encode());
        self.request_ok(Opcode::SetThreadContext, &payload)?;
        Ok(())
    }

    /// Ask another process to create a thread. Blocks until the target has
    /// run the creation call. Returns a handle to the new thread and its
    /// identifier.
    pub fn create_remote_thread(
        &self,
        pid: u32,
        entry: u64,
        arg: u64,
        stack_reserve: u64,
        stack_commit: u64,
        suspended: bool,
    ) -> NtResult<(Handle, u32)> {
        let mut w = MessageWriter::new();
        w.put_u32(pid);
        w.put_u64(entry);
        w.put_u64(arg);
        w.put_u64(stack_reserve);
        w.put_u64(stack_commit);
        w.put_u8(suspended as u8);
        let payload = self.request_ok(Opcode::CreateRemoteThread, &w.finish())?;
        let mut r = MessageReader::new(&payload);
        let handle = Handle(r.get_u32()?);
        let tid = r.get_u32()?;
        Ok((handle, tid))
    }

    /// Tell the supervisor this thread is done and drop its channel.
    pub fn exit_thread(&self, code: u32) -> NtResult<()> {
        let mut w = MessageWriter::new();
        w.put_u32(code);
        let result = self.request_ok(Opcode::ExitThread, &w.finish());
        self.detach_current_thread();
        result.map(|_| ())
    }

    /// Mark every thread of this process finished.
    pub fn exit_process(&self, code: u32) -> NtResult<()> {
        let mut w = MessageWriter::new();
        w.put_u32(code);
        let result = self.request_ok(Opcode::ExitProcess, &w.finish());
        self.detach_current_thread();
        result.map(|_| ())
    }
}

fn request_on(
    channel: &ThreadChannel,
    op: Opcode,
    payload: &[u8],
) -> NtResult<(u32, Vec<u8>, Vec<OwnedFd>)> {
    send_frame(&channel.stream, op as u32, payload, &[])?;
    recv_frame(&channel.stream)
}

fn remaining_ms(deadline: Option<Instant>) -> u64 {
    match deadline {
        None => u64::MAX,
        Some(deadline) => deadline
            .saturating_duration_since(Instant::now())
            .as_millis()
            .min(u64::MAX as u128 - 1) as u64,
    }
}

/// One consume attempt over a handle set; `None` means nothing taken.
fn try_consume_set(fasts: &[Arc<FastObject>], wait_all: bool) -> Option<WaitStatus> {
    if wait_all {
        if !fasts.iter().all(|f| f.signaled()) {
            return None;
        }
        let mut taken = 0;
        for fast in fasts {
            if fast.try_consume() {
                taken += 1;
            } else {
                for done in fasts[..taken].iter().rev() {
                    done.give_back();
                }
                return None;
            }
        }
        Some(WaitStatus::Object(0))
    } else {
        for (index, fast) in fasts.iter().enumerate() {
            if fast.signaled() && fast.try_consume() {
                return Some(WaitStatus::Object(index as u32));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csr::server::Server;
    use std::sync::atomic::AtomicUsize;

    static APC_HITS: AtomicUsize = AtomicUsize::new(0);

    fn apc_bump(a: usize, _b: usize, _c: usize) {
        APC_HITS.fetch_add(a, Ordering::SeqCst);
    }

    #[test]
    fn test_event_cycle_over_engine() {
        let server = Server::spawn_ephemeral().unwrap();
        let engine = server.connect_engine().unwrap();

        let (event, created) = engine
            .create_object(
                ObjectKind::EventAuto,
                ObjectAccess::all(),
                0,
                0,
                None,
                None,
            )
            .unwrap();
        assert!(created);

        assert_eq!(
            engine.wait(&[event], false, Some(Duration::ZERO), false),
            Ok(WaitStatus::Timeout)
        );
        engine.set_event(event).unwrap();
        assert_eq!(
            engine.wait(&[event], false, Some(Duration::ZERO), false),
            Ok(WaitStatus::Object(0))
        );
        assert_eq!(
            engine.wait(&[event], false, Some(Duration::ZERO), false),
            Ok(WaitStatus::Timeout)
        );
        engine.close_handle(event).unwrap();
        assert_eq!(engine.close_handle(event), Err(NtStatus::InvalidHandle));
    }

    #[test]
    fn test_semaphore_over_release_keeps_count() {
        let server = Server::spawn_ephemeral().unwrap();
        let engine = server.connect_engine().unwrap();
        let (sem, _) = engine
            .create_object(
                ObjectKind::Semaphore,
                ObjectAccess::all(),
                1,
                1,
                None,
                None,
            )
            .unwrap();

        assert_eq!(
            engine.release_semaphore(sem, 1),
            Err(NtStatus::SemaphoreLimitExceeded)
        );
        assert_eq!(
            engine.wait(&[sem], false, Some(Duration::ZERO), false),
            Ok(WaitStatus::Object(0))
        );
        assert_eq!(engine.release_semaphore(sem, 1), Ok(0));
    }

    #[test]
    fn test_apc_interrupts_alertable_wait() {
        let server = Server::spawn_ephemeral().unwrap();
        let engine = server.connect_engine().unwrap();
        let (event, _) = engine
            .create_object(
                ObjectKind::EventAuto,
                ObjectAccess::all(),
                0,
                0,
                None,
                None,
            )
            .unwrap();
        let me = engine.current_thread_identity().unwrap();

        engine
            .queue_user_apc(me.tid, ApcEntry::new(apc_bump, [5, 0, 0]))
            .unwrap();

        let before = APC_HITS.load(Ordering::SeqCst);
        let started = Instant::now();
        // The call runs, then the wait resumes and times out.
        assert_eq!(
            engine.wait(&[event], false, Some(Duration::from_millis(100)), true),
            Ok(WaitStatus::Timeout)
        );
        assert!(started.elapsed() >= Duration::from_millis(90));
        assert_eq!(APC_HITS.load(Ordering::SeqCst) - before, 5);
    }

    #[test]
    fn test_non_alertable_wait_ignores_apc() {
        let server = Server::spawn_ephemeral().unwrap();
        let engine = server.connect_engine().unwrap();
        let (event, _) = engine
            .create_object(
                ObjectKind::EventAuto,
                ObjectAccess::all(),
                0,
                0,
                None,
                None,
            )
            .unwrap();
        let me = engine.current_thread_identity().unwrap();
        engine
            .queue_user_apc(me.tid, ApcEntry::new(apc_bump, [0, 0, 0]))
            .unwrap();

        assert_eq!(
            engine.wait(&[event], false, Some(Duration::from_millis(20)), false),
            Ok(WaitStatus::Timeout)
        );
        // Still pending; an alertable poll picks it up.
        assert!(engine.pump_pending_apcs().unwrap() >= 1);
    }

    #[test]
    fn test_two_engines_are_distinct_processes() {
        let server = Server::spawn_ephemeral().unwrap();
        let a = server.connect_engine().unwrap();
        let b = server.connect_engine().unwrap();
        assert_ne!(a.pid(), b.pid());

        let (_h, created_a) = a
            .create_object(
                ObjectKind::EventManual,
                ObjectAccess::all(),
                0,
                0,
                Some("shared-gate"),
                None,
            )
            .unwrap();
        let (_h, created_b) = b
            .create_object(
                ObjectKind::EventManual,
                ObjectAccess::all(),
                0,
                0,
                Some("shared-gate"),
                None,
            )
            .unwrap();
        assert!(created_a);
        assert!(!created_b);
    }

    #[test]
    fn test_fast_backend_local_paths() {
        let server = Server::spawn_ephemeral_with(true).unwrap();
        let engine = server.connect_engine().unwrap();
        assert!(engine.is_fastsync());

        let (sem, _) = engine
            .create_object(
                ObjectKind::Semaphore,
                ObjectAccess::all(),
                1,
                2,
                None,
                None,
            )
            .unwrap();
        assert_eq!(
            engine.wait(&[sem], false, Some(Duration::ZERO), false),
            Ok(WaitStatus::Object(0))
        );
        assert_eq!(
            engine.wait(&[sem], false, Some(Duration::ZERO), false),
            Ok(WaitStatus::Timeout)
        );
        assert_eq!(engine.release_semaphore(sem, 2), Ok(0));
        assert_eq!(
            engine.release_semaphore(sem, 1),
            Err(NtStatus::SemaphoreLimitExceeded)
        );

        // Cross-engine visibility through the shared region.
        let peer = server.connect_engine().unwrap();
        let (gate, created) = engine
            .create_object(
                ObjectKind::EventManual,
                ObjectAccess::all(),
                0,
                0,
                Some("fast-gate"),
                None,
            )
            .unwrap();
        assert!(created);
        let (gate_peer, created) = peer
            .create_object(
                ObjectKind::EventAuto,
                ObjectAccess::all(),
                0,
                0,
                Some("fast-gate"),
                None,
            )
            .unwrap();
        assert!(!created);
        engine.set_event(gate).unwrap();
        assert_eq!(
            peer.wait(&[gate_peer], false, Some(Duration::from_secs(2)), false),
            Ok(WaitStatus::Object(0))
        );
    }

    #[test]
    fn test_fast_wait_all_consumes_atomically() {
        let server = Server::spawn_ephemeral_with(true).unwrap();
        let engine = server.connect_engine().unwrap();
        let (a, _) = engine
            .create_object(ObjectKind::Semaphore, ObjectAccess::all(), 1, 4, None, None)
            .unwrap();
        let (b, _) = engine
            .create_object(ObjectKind::Semaphore, ObjectAccess::all(), 0, 4, None, None)
            .unwrap();

        assert_eq!(
            engine.wait(&[a, b], true, Some(Duration::ZERO), false),
            Ok(WaitStatus::Timeout)
        );
        // The unready all-wait must not have eaten a's unit.
        assert_eq!(engine.release_semaphore(b, 1), Ok(0));
        assert_eq!(
            engine.wait(&[a, b], true, Some(Duration::ZERO), false),
            Ok(WaitStatus::Object(0))
        );
        assert_eq!(
            engine.wait(&[a], false, Some(Duration::ZERO), false),
            Ok(WaitStatus::Timeout)
        );
    }
}
