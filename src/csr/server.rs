//! Supervisor Process
//!
//! Holds the canonical state of every synchronization object, process and
//! thread in an installation. Each client thread keeps one dedicated
//! channel; the supervisor runs one handler thread per channel, so a
//! blocking operation (a wait, a remote-thread request) occupies only its
//! own handler.
//!
//! All object state lives under a single dispatcher lock with one condition
//! variable. A wait checks its handle set and blocks atomically under that
//! lock, so a signal arriving between the check and the block cannot be
//! lost. Signalers notify the condition variable after every state change
//! and blocked waits recheck.
//!
//! With the fast backend enabled, event and semaphore state is mirrored
//! into an eventfd plus a shared counter slot per object, and clients
//! acquire and release without a round trip. The eventfd is the arbiter
//! for consumption races; the supervisor's own waits go through it too.

use std::collections::{HashMap, VecDeque};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::ke::fast::{eventfd_read_one, eventfd_write, make_eventfd, FastObject};
use crate::ke::shm::{SharedCounters, NO_SLOT};
use crate::status::{NtResult, NtStatus, WaitStatus};

use super::fdpass::{recv_frame, send_frame};
use super::message::{
    ApcPayload, CreateObjectReply, CreateObjectRequest, HelloReply, HelloRequest, MessageReader,
    MessageWriter, ObjectKind, Opcode, ThreadContext, WaitRequest,
};

/// Reply code for a successful operation.
pub const STATUS_SUCCESS: u32 = 0;

/// How long a remote-thread request waits for the target process to run
/// the creation call before giving up.
const REMOTE_CREATE_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Configuration
// ============================================================================

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listening socket path.
    pub socket_path: PathBuf,
    /// Installation configuration directory; also names the shared
    /// counter region.
    pub config_dir: PathBuf,
    /// Fast backend on/off. Decided once at startup; clients adopt the
    /// answer from their hello reply.
    pub fastsync: bool,
}

impl ServerConfig {
    /// Build from the environment: `REWIND_CONFIG_DIR` overrides the
    /// directory. The fast backend is on unless `REWIND_FASTSYNC` is
    /// `"0"` or `"off"`.
    pub fn from_env() -> ServerConfig {
        let config_dir = std::env::var_os("REWIND_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_config_dir);
        let fastsync = match std::env::var("REWIND_FASTSYNC") {
            Ok(v) => !(v == "0" || v.eq_ignore_ascii_case("off")),
            Err(_) => true,
        };
        ServerConfig {
            socket_path: config_dir.join("server.sock"),
            config_dir,
            fastsync,
        }
    }
}

fn default_config_dir() -> PathBuf {
    if let Some(runtime) = std::env::var_os("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime).join("rewind");
    }
    let uid = unsafe { libc::getuid() };
    std::env::temp_dir().join(format!(".rewind-{}", uid))
}

// ============================================================================
// Object model
// ============================================================================

/// Fast-backend mirror of one object.
struct FastState {
    obj: FastObject,
    idx: u32,
}

enum Body {
    Event { manual: bool, signaled: bool },
    Semaphore { count: u32, max: u32 },
    Thread { exited: bool },
}

struct ObjectState {
    body: Body,
    /// Stored verbatim; the supervisor does not interpret descriptors.
    #[allow(dead_code)]
    security: Option<Vec<u8>>,
    fast: Option<FastState>,
    /// Outstanding references: one per handle in any process, plus one
    /// held by the thread record for thread objects. The record and its
    /// directory name are dropped when this reaches zero.
    refs: u32,
}

impl ObjectState {
    fn kind(&self) -> ObjectKind {
        match self.body {
            Body::Event { manual: false, .. } => ObjectKind::EventAuto,
            Body::Event { manual: true, .. } => ObjectKind::EventManual,
            Body::Semaphore { .. } => ObjectKind::Semaphore,
            Body::Thread { .. } => ObjectKind::Thread,
        }
    }

    /// Would a wait on this object be satisfied right now?
    fn signaled(&self) -> bool {
        if let Some(fast) = &self.fast {
            return fast.obj.signaled();
        }
        match self.body {
            Body::Event { signaled, .. } => signaled,
            Body::Semaphore { count, .. } => count > 0,
            Body::Thread { exited, .. } => exited,
        }
    }

    /// Consume one unit of signal. Returns false when a racing fast-path
    /// consumer got there first.
    fn try_consume(&mut self) -> bool {
        if let Some(fast) = &self.fast {
            return fast.obj.try_consume();
        }
        match &mut self.body {
            Body::Event { manual: true, .. } | Body::Thread { .. } => true,
            Body::Event {
                manual: false,
                signaled,
            } => {
                *signaled = false;
                true
            }
            Body::Semaphore { count, .. } => {
                *count -= 1;
                true
            }
        }
    }

    /// Undo one `try_consume`, for wait-all rollback.
    fn give_back(&mut self) {
        if let Some(fast) = &self.fast {
            return fast.obj.give_back();
        }
        match &mut self.body {
            Body::Event { manual: true, .. } | Body::Thread { .. } => {}
            Body::Event {
                manual: false,
                signaled,
            } => *signaled = true,
            Body::Semaphore { count, .. } => *count += 1,
        }
    }
}

/// Per-thread control state held by the supervisor.
struct ThreadControl {
    pid: u32,
    unix_pid: u32,
    unix_tid: u32,
    /// This thread's waitable object.
    object: u64,
    alert: OwnedFd,
    suspend: OwnedFd,
    ack: OwnedFd,
    suspend_count: u32,
    /// The thread has been seen parked since its last suspension.
    parked: bool,
    context: ThreadContext,
    apcs: VecDeque<ApcPayload>,
    exited: bool,
}

struct ProcessRecord {
    cookie: u64,
    threads: Vec<u32>,
    handles: HashMap<u32, u64>,
    next_handle: u32,
    /// Creation requests from remote callers, served by any thread of this
    /// process that asks for pending work.
    system_apcs: VecDeque<ApcPayload>,
}

impl ProcessRecord {
    fn insert_handle(&mut self, object: u64) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 4;
        self.handles.insert(handle, object);
        handle
    }
}

#[derive(Clone, Copy)]
struct RemoteOutcome {
    status: u32,
    tid: u32,
}

struct DispatcherState {
    objects: HashMap<u64, ObjectState>,
    names: HashMap<String, u64>,
    processes: HashMap<u32, ProcessRecord>,
    cookies: HashMap<u64, u32>,
    threads: HashMap<u32, ThreadControl>,
    remote_results: HashMap<u64, RemoteOutcome>,
    next_object: u64,
    /// Client ids (pids and tids) come from one space, multiples of 4.
    next_cid: u32,
    next_cookie: u64,
    next_slot: u32,
}

impl DispatcherState {
    /// Issue a handle to `object` in `pid`, taking a reference.
    fn grant_handle(&mut self, pid: u32, object: u64) -> NtResult<u32> {
        let process = self
            .processes
            .get_mut(&pid)
            .ok_or(NtStatus::ProcessIsTerminating)?;
        let handle = process.insert_handle(object);
        if let Some(state) = self.objects.get_mut(&object) {
            state.refs += 1;
        }
        Ok(handle)
    }

    /// Drop one reference; the last one destroys the record and unlinks
    /// its name. Slot indices are never reused, only the eventfd closes.
    fn release_ref(&mut self, object: u64) {
        let gone = match self.objects.get_mut(&object) {
            Some(state) => {
                state.refs = state.refs.saturating_sub(1);
                state.refs == 0
            }
            None => false,
        };
        if gone {
            self.objects.remove(&object);
            self.names.retain(|_, &mut id| id != object);
            log::debug!("object {} destroyed", object);
        }
    }
}

struct Dispatcher {
    state: Mutex<DispatcherState>,
    cvar: Condvar,
    counters: Option<SharedCounters>,
    fastsync: bool,
}

impl Dispatcher {
    fn new(config: &ServerConfig) -> NtResult<Dispatcher> {
        let counters = if config.fastsync {
            Some(SharedCounters::create(&config.config_dir)?)
        } else {
            None
        };
        Ok(Dispatcher {
            state: Mutex::new(DispatcherState {
                objects: HashMap::new(),
                names: HashMap::new(),
                processes: HashMap::new(),
                cookies: HashMap::new(),
                threads: HashMap::new(),
                remote_results: HashMap::new(),
                next_object: 1,
                next_cid: 4,
                next_cookie: 1,
                next_slot: 0,
            }),
            cvar: Condvar::new(),
            counters,
            fastsync: config.fastsync,
        })
    }

    fn lock(&self) -> MutexGuard<'_, DispatcherState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ============================================================================
// Server front end
// ============================================================================

/// A running supervisor: listener plus dispatcher.
pub struct Server {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<std::thread::JoinHandle<()>>,
}

impl Server {
    /// Bind the socket and start accepting in a background thread.
    pub fn spawn(config: ServerConfig) -> NtResult<Server> {
        std::fs::create_dir_all(&config.config_dir)
            .map_err(|e| NtStatus::from_os_error(e.raw_os_error().unwrap_or(0)))?;
        let _ = std::fs::remove_file(&config.socket_path);
        let listener = UnixListener::bind(&config.socket_path)
            .map_err(|e| NtStatus::from_os_error(e.raw_os_error().unwrap_or(0)))?;
        let dispatcher = Arc::new(Dispatcher::new(&config)?);
        let shutdown = Arc::new(AtomicBool::new(false));
        log::info!(
            "supervisor listening on {:?} (fast backend {})",
            config.socket_path,
            if config.fastsync { "on" } else { "off" }
        );

        let accept_dispatcher = Arc::clone(&dispatcher);
        let accept_shutdown = Arc::clone(&shutdown);
        let accept_thread = std::thread::Builder::new()
            .name("rewind-accept".into())
            .spawn(move || {
                for stream in listener.incoming() {
                    if accept_shutdown.load(AtomicOrdering::Acquire) {
                        break;
                    }
                    match stream {
                        Ok(stream) => {
                            let dispatcher = Arc::clone(&accept_dispatcher);
                            let _ = std::thread::Builder::new()
                                .name("rewind-client".into())
                                .spawn(move || handle_connection(dispatcher, stream));
                        }
                        Err(e) => {
                            log::warn!("accept failed: {}", e);
                            break;
                        }
                    }
                }
            })
            .map_err(|e| NtStatus::from_os_error(e.raw_os_error().unwrap_or(0)))?;

        Ok(Server {
            config,
            dispatcher,
            shutdown,
            accept_thread: Some(accept_thread),
        })
    }

    /// Spawn on a fresh per-test socket and counter region, fast backend
    /// decided by the caller.
    pub fn spawn_ephemeral_with(fastsync: bool) -> NtResult<Server> {
        use std::sync::atomic::AtomicU64;
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let dir = std::env::temp_dir().join(format!(
            "rewind-srv-{}-{}",
            std::process::id(),
            SEQ.fetch_add(1, AtomicOrdering::Relaxed)
        ));
        std::fs::create_dir_all(&dir)
            .map_err(|e| NtStatus::from_os_error(e.raw_os_error().unwrap_or(0)))?;
        Server::spawn(ServerConfig {
            socket_path: dir.join("server.sock"),
            config_dir: dir,
            fastsync,
        })
    }

    /// Ephemeral supervisor on the portable slow path.
    pub fn spawn_ephemeral() -> NtResult<Server> {
        Server::spawn_ephemeral_with(false)
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    pub fn config_dir(&self) -> &Path {
        &self.config.config_dir
    }

    /// Connect a client engine to this supervisor.
    pub fn connect_engine(&self) -> NtResult<Arc<super::client::SyncEngine>> {
        super::client::SyncEngine::connect(&self.config.socket_path, &self.config.config_dir)
    }

    /// Serve until the process is torn down. Used by the standalone binary.
    pub fn run(mut self) -> NtResult<()> {
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.store(true, AtomicOrdering::Release);
        // Wake the accept loop so it observes the flag.
        let _ = UnixStream::connect(&self.config.socket_path);
        let _ = std::fs::remove_file(&self.config.socket_path);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// Connection handling
// ============================================================================

struct ClientSession {
    dispatcher: Arc<Dispatcher>,
    stream: UnixStream,
    pid: u32,
    tid: u32,
}

fn handle_connection(dispatcher: Arc<Dispatcher>, stream: UnixStream) {
    let mut session = match register_thread(&dispatcher, &stream) {
        Ok(Some((pid, tid))) => ClientSession {
            dispatcher,
            stream,
            pid,
            tid,
        },
        Ok(None) => return,
        Err(status) => {
            let _ = send_frame(&stream, status as u32, &[], &[]);
            return;
        }
    };
    log::debug!("thread {}.{} registered", session.pid, session.tid);

    loop {
        let (code, payload, _fds) = match recv_frame(&session.stream) {
            Ok(frame) => frame,
            Err(_) => break,
        };
        let opcode = match Opcode::from_u32(code) {
            Some(op) => op,
            None => {
                let _ = session.reply_status(NtStatus::InvalidParameter);
                continue;
            }
        };
        let disconnect = matches!(opcode, Opcode::ExitThread | Opcode::ExitProcess);
        if session.dispatch(opcode, &payload).is_err() {
            break;
        }
        if disconnect {
            break;
        }
    }

    // A vanished client counts as thread exit.
    finish_thread(&session.dispatcher, session.pid, session.tid, 0);
    log::debug!("thread {}.{} disconnected", session.pid, session.tid);
}

/// First exchange on a channel: register the thread, mint ids, hand the
/// alert/suspend/ack descriptors over.
fn register_thread(
    dispatcher: &Dispatcher,
    stream: &UnixStream,
) -> NtResult<Option<(u32, u32)>> {
    let (code, payload, _fds) = match recv_frame(stream) {
        Ok(frame) => frame,
        // Wakeup connection from shutdown, or a probe; nothing to do.
        Err(_) => return Ok(None),
    };
    if Opcode::from_u32(code) != Some(Opcode::Hello) {
        return Err(NtStatus::InvalidParameter);
    }
    let hello = HelloRequest::decode(&payload)?;

    let alert = make_eventfd(0, libc::EFD_NONBLOCK)?;
    let suspend = make_eventfd(0, 0)?;
    let ack = make_eventfd(0, libc::EFD_NONBLOCK)?;

    let (pid, tid, cookie, fastsync) = {
        let mut state = dispatcher.lock();
        let pid = match state.cookies.get(&hello.cookie) {
            Some(&pid) if hello.cookie != 0 => pid,
            _ => {
                let pid = state.next_cid;
                state.next_cid += 4;
                let cookie = state.next_cookie;
                state.next_cookie += 1;
                state.cookies.insert(cookie, pid);
                state.processes.insert(
                    pid,
                    ProcessRecord {
                        cookie,
                        threads: Vec::new(),
                        handles: HashMap::new(),
                        next_handle: 4,
                        system_apcs: VecDeque::new(),
                    },
                );
                log::info!("process {} registered (host pid {})", pid, hello.unix_pid);
                pid
            }
        };
        let cookie = state.processes[&pid].cookie;

        let tid = state.next_cid;
        state.next_cid += 4;
        let object = state.next_object;
        state.next_object += 1;
        // With the fast backend every waitable object carries an eventfd,
        // thread objects included, so clients never need a server wait.
        let fast = match &dispatcher.counters {
            Some(counters) => {
                let idx = state.next_slot;
                counters.grow_for_slot(idx)?;
                let slot = counters.slot(idx)?;
                slot.word(0).store(0, AtomicOrdering::SeqCst);
                state.next_slot += 1;
                Some(FastState {
                    obj: FastObject {
                        fd: make_eventfd(0, libc::EFD_NONBLOCK)?,
                        slot,
                        kind: ObjectKind::Thread,
                    },
                    idx,
                })
            }
            None => None,
        };
        state.objects.insert(
            object,
            ObjectState {
                body: Body::Thread { exited: false },
                security: None,
                fast,
                // The thread record itself keeps the object alive until
                // `finish_thread`.
                refs: 1,
            },
        );
        state.threads.insert(
            tid,
            ThreadControl {
                pid,
                unix_pid: hello.unix_pid,
                unix_tid: hello.unix_tid,
                object,
                alert: alert.try_clone().map_err(|_| NtStatus::Unsuccessful)?,
                suspend: suspend.try_clone().map_err(|_| NtStatus::Unsuccessful)?,
                ack: ack.try_clone().map_err(|_| NtStatus::Unsuccessful)?,
                suspend_count: hello.suspended as u32,
                parked: false,
                context: ThreadContext {
                    entry: hello.entry,
                    stack_base: hello.stack_base,
                    stack_limit: hello.stack_limit,
                    suspend_count: hello.suspended as u32,
                },
                apcs: VecDeque::new(),
                exited: false,
            },
        );
        state.processes.get_mut(&pid).map(|p| p.threads.push(tid));
        (pid, tid, cookie, dispatcher.fastsync)
    };

    let reply = HelloReply {
        cookie,
        pid,
        tid,
        fastsync,
    };
    send_frame(
        stream,
        STATUS_SUCCESS,
        &reply.encode(),
        &[alert.as_raw_fd(), suspend.as_raw_fd(), ack.as_raw_fd()],
    )?;
    Ok(Some((pid, tid)))
}

/// Mark a thread finished: signal its object, run down its queue, tear the
/// process down when its last thread goes.
fn finish_thread(dispatcher: &Dispatcher, pid: u32, tid: u32, exit_code: u32) {
    let mut state = dispatcher.lock();
    let object = match state.threads.get_mut(&tid) {
        Some(control) if !control.exited => {
            control.exited = true;
            let dropped = control.apcs.len();
            control.apcs.clear();
            log::debug!(
                "thread {} exited (code {}, {} undelivered calls)",
                tid,
                exit_code,
                dropped
            );
            control.object
        }
        _ => return,
    };
    if let Some(thread_object) = state.objects.get_mut(&object) {
        if let Body::Thread { exited } = &mut thread_object.body {
            *exited = true;
        }
        if let Some(fast) = &thread_object.fast {
            fast.obj.set_event();
        }
    }
    // The thread record's own reference; waiters keep the object alive
    // through their handles.
    state.release_ref(object);
    let last = if let Some(process) = state.processes.get_mut(&pid) {
        process.threads.retain(|&t| t != tid);
        process.threads.is_empty()
    } else {
        false
    };
    if last {
        if let Some(process) = state.processes.remove(&pid) {
            state.cookies.remove(&process.cookie);
            for object in process.handles.into_values() {
                state.release_ref(object);
            }
        }
        log::info!("process {} finished", pid);
    }
    dispatcher.cvar.notify_all();
}

// ============================================================================
// Request dispatch
// ============================================================================

impl ClientSession {
    fn reply_status(&mut self, status: NtStatus) -> NtResult<()> {
        send_frame(&self.stream, status as u32, &[], &[])
    }

    fn reply_ok(&mut self, payload: &[u8], fds: &[RawFd]) -> NtResult<()> {
        send_frame(&self.stream, STATUS_SUCCESS, payload, fds)
    }

    fn dispatch(&mut self, opcode: Opcode, payload: &[u8]) -> NtResult<()> {
        let result = match opcode {
            Opcode::Hello => Err(NtStatus::InvalidParameter),
            Opcode::CreateObject => return self.op_create_object(payload),
            Opcode::OpenThread => return self.op_open_thread(payload),
            Opcode::CloseHandle => self.op_close_handle(payload),
            Opcode::SetEvent => self.op_set_event(payload, true),
            Opcode::ResetEvent => self.op_set_event(payload, false),
            Opcode::ReleaseSemaphore => return self.op_release_semaphore(payload),
            Opcode::Wait => return self.op_wait(payload),
            Opcode::QueueApc => self.op_queue_apc(payload),
            Opcode::GetPendingApc => return self.op_get_pending_apc(),
            Opcode::ApcComplete => self.op_apc_complete(payload),
            Opcode::SuspendThread => return self.op_suspend_resume(payload, true),
            Opcode::ResumeThread => return self.op_suspend_resume(payload, false),
            Opcode::GetThreadContext => return self.op_get_context(payload),
            Opcode::SetThreadContext => self.op_set_context(payload),
            Opcode::CreateRemoteThread => return self.op_create_remote_thread(payload),
            Opcode::ExitThread => self.op_exit_thread(payload),
            Opcode::ExitProcess => self.op_exit_process(payload),
        };
        match result {
            Ok(()) => self.reply_ok(&[], &[]),
            Err(status) => self.reply_status(status),
        }
    }

    fn resolve_handle(state: &DispatcherState, pid: u32, handle: u32) -> NtResult<u64> {
        state
            .processes
            .get(&pid)
            .and_then(|p| p.handles.get(&handle).copied())
            .ok_or(NtStatus::InvalidHandle)
    }

    // ------------------------------------------------------------------
    // Object lifecycle
    // ------------------------------------------------------------------

    fn op_create_object(&mut self, payload: &[u8]) -> NtResult<()> {
        let req = match CreateObjectRequest::decode(payload) {
            Ok(req) => req,
            Err(status) => return self.reply_status(status),
        };
        if req.kind == ObjectKind::Thread {
            return self.reply_status(NtStatus::InvalidParameter);
        }
        if req.kind == ObjectKind::Semaphore && (req.max == 0 || req.initial > req.max) {
            return self.reply_status(NtStatus::InvalidParameter);
        }

        enum Outcome {
            Opened(CreateObjectReply, Option<RawFd>),
            Created(CreateObjectReply, Option<RawFd>),
            Failed(NtStatus),
        }

        let outcome = {
            let dispatcher = Arc::clone(&self.dispatcher);
            let mut state = dispatcher.lock();

            if let Some(&existing) = req.name.as_deref().and_then(|n| state.names.get(n)) {
                let object = &state.objects[&existing];
                if !object.kind().compatible_with(req.kind) {
                    log::debug!(
                        "name {:?} holds a {:?}, {:?} requested",
                        req.name,
                        object.kind(),
                        req.kind
                    );
                    Outcome::Failed(NtStatus::ObjectTypeMismatch)
                } else {
                    let kind = object.kind();
                    let (shm_idx, fd) = match &object.fast {
                        Some(fast) => (fast.idx, Some(fast.obj.fd.as_raw_fd())),
                        None => (NO_SLOT, None),
                    };
                    let handle = state.grant_handle(self.pid, existing)?;
                    Outcome::Opened(
                        CreateObjectReply {
                            handle,
                            kind,
                            shm_idx,
                            created: false,
                        },
                        fd,
                    )
                }
            } else {
                match create_object_locked(&dispatcher, &mut state, &req) {
                    Ok(object_id) => {
                        let (shm_idx, fd) = match &state.objects[&object_id].fast {
                            Some(fast) => (fast.idx, Some(fast.obj.fd.as_raw_fd())),
                            None => (NO_SLOT, None),
                        };
                        let handle = match state.grant_handle(self.pid, object_id) {
                            Ok(handle) => handle,
                            Err(status) => {
                                // Zero references: drop the orphan record.
                                state.release_ref(object_id);
                                return Err(status);
                            }
                        };
                        Outcome::Created(
                            CreateObjectReply {
                                handle,
                                kind: req.kind,
                                shm_idx,
                                created: true,
                            },
                            fd,
                        )
                    }
                    Err(status) => Outcome::Failed(status),
                }
            }
        };

        match outcome {
            Outcome::Opened(reply, fd) | Outcome::Created(reply, fd) => {
                let fds: Vec<RawFd> = fd.into_iter().collect();
                self.reply_ok(&reply.encode(), &fds)
            }
            Outcome::Failed(status) => self.reply_status(status),
        }
    }

    fn op_open_thread(&mut self, payload: &[u8]) -> NtResult<()> {
        let mut r = MessageReader::new(payload);
        let target = match r.get_u32() {
            Ok(t) => t,
            Err(status) => return self.reply_status(status),
        };
        let reply = {
            let mut state = self.dispatcher.lock();
            match state.threads.get(&target).map(|c| c.object) {
                // A long-exited thread may have lost its object already.
                Some(object) if state.objects.contains_key(&object) => {
                    let (shm_idx, fd) = match &state.objects[&object].fast {
                        Some(fast) => (fast.idx, Some(fast.obj.fd.as_raw_fd())),
                        None => (NO_SLOT, None),
                    };
                    let handle = state.grant_handle(self.pid, object)?;
                    Ok((
                        CreateObjectReply {
                            handle,
                            kind: ObjectKind::Thread,
                            shm_idx,
                            created: false,
                        },
                        fd,
                    ))
                }
                _ => Err(NtStatus::InvalidParameter),
            }
        };
        match reply {
            Ok((reply, fd)) => {
                let fds: Vec<RawFd> = fd.into_iter().collect();
                self.reply_ok(&reply.encode(), &fds)
            }
            Err(status) => self.reply_status(status),
        }
    }

    fn op_close_handle(&mut self, payload: &[u8]) -> NtResult<()> {
        let mut r = MessageReader::new(payload);
        let handle = r.get_u32()?;
        let mut state = self.dispatcher.lock();
        let object = state
            .processes
            .get_mut(&self.pid)
            .ok_or(NtStatus::ProcessIsTerminating)?
            .handles
            .remove(&handle)
            .ok_or(NtStatus::InvalidHandle)?;
        state.release_ref(object);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Events and semaphores
    // ------------------------------------------------------------------

    fn op_set_event(&mut self, payload: &[u8], set: bool) -> NtResult<()> {
        let mut r = MessageReader::new(payload);
        let handle = r.get_u32()?;
        let mut state = self.dispatcher.lock();
        let object_id = Self::resolve_handle(&state, self.pid, handle)?;
        let object = state
            .objects
            .get_mut(&object_id)
            .ok_or(NtStatus::InvalidHandle)?;
        match &mut object.body {
            Body::Event { signaled, .. } => {
                if let Some(fast) = &object.fast {
                    if set {
                        fast.obj.set_event();
                    } else {
                        fast.obj.reset_event();
                    }
                } else {
                    *signaled = set;
                }
                self.dispatcher.cvar.notify_all();
                Ok(())
            }
            _ => Err(NtStatus::ObjectTypeMismatch),
        }
    }

    fn op_release_semaphore(&mut self, payload: &[u8]) -> NtResult<()> {
        let parsed = (|| {
            let mut r = MessageReader::new(payload);
            Ok::<_, NtStatus>((r.get_u32()?, r.get_u32()?))
        })();
        let (handle, release) = match parsed {
            Ok(p) => p,
            Err(status) => return self.reply_status(status),
        };
        if release == 0 {
            return self.reply_status(NtStatus::InvalidParameter);
        }

        let result = {
            let dispatcher = Arc::clone(&self.dispatcher);
            let mut state = dispatcher.lock();
            Self::resolve_handle(&state, self.pid, handle).and_then(|object_id| {
                let object = state
                    .objects
                    .get_mut(&object_id)
                    .ok_or(NtStatus::InvalidHandle)?;
                match &mut object.body {
                    Body::Semaphore { count, max } => {
                        if let Some(fast) = &object.fast {
                            fast.obj.release_semaphore(release)
                        } else if count.saturating_add(release) > *max {
                            Err(NtStatus::SemaphoreLimitExceeded)
                        } else {
                            let previous = *count;
                            *count += release;
                            Ok(previous)
                        }
                    }
                    _ => Err(NtStatus::ObjectTypeMismatch),
                }
            })
        };
        match result {
            Ok(previous) => {
                self.dispatcher.cvar.notify_all();
                let mut w = MessageWriter::new();
                w.put_u32(previous);
                self.reply_ok(&w.finish(), &[])
            }
            Err(status) => self.reply_status(status),
        }
    }

    // ------------------------------------------------------------------
    // Waiting
    // ------------------------------------------------------------------

    fn op_wait(&mut self, payload: &[u8]) -> NtResult<()> {
        let req = match WaitRequest::decode(payload) {
            Ok(req) => req,
            Err(status) => return self.reply_status(status),
        };
        if req.wait_all {
            // Duplicate handles make an all-wait unsatisfiable in one shot.
            let mut sorted = req.handles.clone();
            sorted.sort_unstable();
            sorted.dedup();
            if sorted.len() != req.handles.len() {
                return self.reply_status(NtStatus::InvalidParameter);
            }
        }

        let deadline = if req.timeout_ms == u64::MAX {
            None
        } else {
            Some(Instant::now() + Duration::from_millis(req.timeout_ms))
        };

        let status = {
            let mut state = self.dispatcher.lock();
            loop {
                // Another thread may have torn the process down meanwhile.
                let gone = state
                    .threads
                    .get(&self.tid)
                    .map(|c| c.exited)
                    .unwrap_or(true);
                if gone {
                    break NtStatus::ThreadIsTerminating as u32;
                }

                // Alert first: a queued call beats object acquisition.
                if req.alertable {
                    let has_apc = state
                        .threads
                        .get(&self.tid)
                        .map(|c| !c.apcs.is_empty())
                        .unwrap_or(false)
                        || state
                            .processes
                            .get(&self.pid)
                            .map(|p| !p.system_apcs.is_empty())
                            .unwrap_or(false);
                    if has_apc {
                        break NtStatus::UserApc as u32;
                    }
                }

                match try_satisfy_wait(&mut state, self.pid, &req) {
                    Ok(Some(wait_status)) => break wait_status.code(),
                    Ok(None) => {}
                    Err(status) => break status as u32,
                }

                match deadline {
                    None => {
                        state = match self.dispatcher.cvar.wait(state) {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                    }
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            break WaitStatus::Timeout.code();
                        }
                        let (guard, _) = match self
                            .dispatcher
                            .cvar
                            .wait_timeout(state, deadline - now)
                        {
                            Ok(r) => r,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        state = guard;
                    }
                }
            }
        };
        send_frame(&self.stream, status, &[], &[])
    }

    // ------------------------------------------------------------------
    // Asynchronous calls
    // ------------------------------------------------------------------

    fn op_queue_apc(&mut self, payload: &[u8]) -> NtResult<()> {
        let mut r = MessageReader::new(payload);
        let target = r.get_u32()?;
        let apc = ApcPayload::decode(&payload[4..])?;
        if matches!(apc, ApcPayload::None) {
            return Err(NtStatus::InvalidParameter);
        }
        let mut state = self.dispatcher.lock();
        let control = state
            .threads
            .get_mut(&target)
            .ok_or(NtStatus::InvalidParameter)?;
        if control.exited {
            return Err(NtStatus::ThreadIsTerminating);
        }
        // Routine addresses only make sense inside the queuing process.
        if control.pid != self.pid {
            return Err(NtStatus::AccessDenied);
        }
        control.apcs.push_back(apc);
        eventfd_write(&control.alert, 1);
        self.dispatcher.cvar.notify_all();
        Ok(())
    }

    fn op_get_pending_apc(&mut self) -> NtResult<()> {
        let apc = {
            let mut state = self.dispatcher.lock();
            let thread_apc = state
                .threads
                .get_mut(&self.tid)
                .and_then(|c| c.apcs.pop_front());
            match thread_apc {
                Some(apc) => apc,
                None => state
                    .processes
                    .get_mut(&self.pid)
                    .and_then(|p| p.system_apcs.pop_front())
                    .unwrap_or(ApcPayload::None),
            }
        };
        self.reply_ok(&apc.encode(), &[])
    }

    fn op_apc_complete(&mut self, payload: &[u8]) -> NtResult<()> {
        let mut r = MessageReader::new(payload);
        let cookie = r.get_u64()?;
        let status = r.get_u32()?;
        let tid = r.get_u32()?;
        let mut state = self.dispatcher.lock();
        state
            .remote_results
            .insert(cookie, RemoteOutcome { status, tid });
        self.dispatcher.cvar.notify_all();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Suspension and context
    // ------------------------------------------------------------------

    fn op_suspend_resume(&mut self, payload: &[u8], suspend: bool) -> NtResult<()> {
        let mut r = MessageReader::new(payload);
        let target = match r.get_u32() {
            Ok(t) => t,
            Err(status) => return self.reply_status(status),
        };
        let result = {
            let mut state = self.dispatcher.lock();
            match state.threads.get_mut(&target) {
                None => Err(NtStatus::InvalidParameter),
                Some(control) if control.exited => Err(NtStatus::ThreadIsTerminating),
                Some(control) => {
                    let previous = control.suspend_count;
                    if suspend {
                        control.suspend_count += 1;
                        if previous == 0 {
                            control.parked = false;
                            // Self-suspension parks after the reply; others
                            // are interrupted.
                            if target != self.tid {
                                signal_thread(control);
                            }
                        }
                        Ok(previous)
                    } else if previous == 0 {
                        Ok(0)
                    } else {
                        control.suspend_count -= 1;
                        if control.suspend_count == 0 {
                            control.parked = false;
                            eventfd_write(&control.suspend, 1);
                        }
                        Ok(previous)
                    }
                }
            }
        };
        match result {
            Ok(previous) => {
                self.dispatcher.cvar.notify_all();
                let mut w = MessageWriter::new();
                w.put_u32(previous);
                self.reply_ok(&w.finish(), &[])
            }
            Err(status) => self.reply_status(status),
        }
    }

    fn op_get_context(&mut self, payload: &[u8]) -> NtResult<()> {
        let mut r = MessageReader::new(payload);
        let target = match r.get_u32() {
            Ok(t) => t,
            Err(status) => return self.reply_status(status),
        };
        let result = {
            let mut state = self.dispatcher.lock();
            context_target(&mut state, target, self.tid).map(|control| {
                let mut context = control.context;
                context.suspend_count = control.suspend_count;
                context
            })
        };
        match result {
            Ok(context) => self.reply_ok(&context.encode(), &[]),
            Err(status) => self.reply_status(status),
        }
    }

    fn op_set_context(&mut self, payload: &[u8]) -> NtResult<()> {
        let mut r = MessageReader::new(payload);
        let target = r.get_u32()?;
        let context = ThreadContext::decode(&payload[4..])?;
        let mut state = self.dispatcher.lock();
        let control = context_target(&mut state, target, self.tid)?;
        control.context.entry = context.entry;
        control.context.stack_base = context.stack_base;
        control.context.stack_limit = context.stack_limit;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Thread and process lifecycle
    // ------------------------------------------------------------------

    fn op_create_remote_thread(&mut self, payload: &[u8]) -> NtResult<()> {
        let parsed = (|| {
            let mut r = MessageReader::new(payload);
            Ok::<_, NtStatus>((
                r.get_u32()?,
                r.get_u64()?,
                r.get_u64()?,
                r.get_u64()?,
                r.get_u64()?,
                r.get_u8()? != 0,
            ))
        })();
        let (target_pid, entry, arg, stack_reserve, stack_commit, suspended) = match parsed {
            Ok(p) => p,
            Err(status) => return self.reply_status(status),
        };

        let result = {
            let dispatcher = Arc::clone(&self.dispatcher);
            let mut state = dispatcher.lock();
            let cookie = state.next_cookie;
            state.next_cookie += 1;

            match state.processes.get_mut(&target_pid) {
                None => Err(NtStatus::ProcessIsTerminating),
                Some(process) => {
                    process.system_apcs.push_back(ApcPayload::CreateThread {
                        cookie,
                        entry,
                        arg,
                        stack_reserve,
                        stack_commit,
                        suspended,
                    });
                    // Any thread of the target may pick the work up.
                    let tids = process.threads.clone();
                    for tid in tids {
                        if let Some(control) = state.threads.get(&tid) {
                            eventfd_write(&control.alert, 1);
                        }
                    }
                    dispatcher.cvar.notify_all();

                    let deadline = Instant::now() + REMOTE_CREATE_TIMEOUT;
                    loop {
                        if let Some(outcome) = state.remote_results.remove(&cookie) {
                            break if outcome.status == STATUS_SUCCESS {
                                Ok(outcome.tid)
                            } else {
                                Err(NtStatus::from_code(outcome.status))
                            };
                        }
                        let now = Instant::now();
                        if now >= deadline {
                            log::warn!(
                                "remote thread creation in process {} timed out",
                                target_pid
                            );
                            break Err(NtStatus::Unsuccessful);
                        }
                        let (guard, _) =
                            match dispatcher.cvar.wait_timeout(state, deadline - now) {
                                Ok(r) => r,
                                Err(poisoned) => poisoned.into_inner(),
                            };
                        state = guard;
                    }
                    .and_then(|tid| {
                        let object = state
                            .threads
                            .get(&tid)
                            .map(|c| c.object)
                            .ok_or(NtStatus::Unsuccessful)?;
                        let handle = state.grant_handle(self.pid, object)?;
                        Ok((handle, tid))
                    })
                }
            }
        };
        match result {
            Ok((handle, tid)) => {
                let mut w = MessageWriter::new();
                w.put_u32(handle);
                w.put_u32(tid);
                self.reply_ok(&w.finish(), &[])
            }
            Err(status) => self.reply_status(status),
        }
    }

    fn op_exit_thread(&mut self, payload: &[u8]) -> NtResult<()> {
        let mut r = MessageReader::new(payload);
        let code = r.get_u32().unwrap_or(0);
        finish_thread(&self.dispatcher, self.pid, self.tid, code);
        Ok(())
    }

    fn op_exit_process(&mut self, payload: &[u8]) -> NtResult<()> {
        let mut r = MessageReader::new(payload);
        let code = r.get_u32().unwrap_or(0);
        let tids: Vec<u32> = {
            let state = self.dispatcher.lock();
            state
                .processes
                .get(&self.pid)
                .map(|p| p.threads.clone())
                .unwrap_or_default()
        };
        for tid in tids {
            finish_thread(&self.dispatcher, self.pid, tid, code);
        }
        Ok(())
    }
}

/// Interrupt a running thread so its park handler runs.
fn signal_thread(control: &ThreadControl) {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_tgkill,
            control.unix_pid as libc::c_int,
            control.unix_tid as libc::c_int,
            libc::SIGUSR1,
        )
    };
    if rc != 0 {
        log::warn!(
            "could not interrupt host thread {}/{}: {}",
            control.unix_pid,
            control.unix_tid,
            std::io::Error::last_os_error()
        );
    }
}

/// Context access requires the target suspended and seen parked.
fn context_target<'a>(
    state: &'a mut DispatcherState,
    target: u32,
    caller: u32,
) -> NtResult<&'a mut ThreadControl> {
    let control = state
        .threads
        .get_mut(&target)
        .ok_or(NtStatus::InvalidParameter)?;
    if control.exited {
        return Err(NtStatus::ThreadIsTerminating);
    }
    if target == caller {
        return Err(NtStatus::InvalidParameter);
    }
    if control.suspend_count == 0 {
        return Err(NtStatus::Unsuccessful);
    }
    if !control.parked {
        // The park handler reports on the ack descriptor.
        if eventfd_read_one(&control.ack) {
            control.parked = true;
        } else {
            return Err(NtStatus::Pending);
        }
    }
    Ok(control)
}

fn create_object_locked(
    dispatcher: &Dispatcher,
    state: &mut DispatcherState,
    req: &CreateObjectRequest,
) -> NtResult<u64> {
    let fast = match &dispatcher.counters {
        Some(counters) => {
            let idx = state.next_slot;
            counters.grow_for_slot(idx)?;
            let slot = counters.slot(idx)?;
            let (initval, flags, w0, w1) = match req.kind {
                ObjectKind::Semaphore => (
                    req.initial,
                    libc::EFD_SEMAPHORE | libc::EFD_NONBLOCK,
                    req.initial,
                    req.max,
                ),
                ObjectKind::EventAuto => {
                    (req.initial.min(1), libc::EFD_NONBLOCK, req.initial.min(1), 0)
                }
                ObjectKind::EventManual => {
                    (req.initial.min(1), libc::EFD_NONBLOCK, req.initial.min(1), 1)
                }
                ObjectKind::Thread => unreachable!(),
            };
            let fd = make_eventfd(initval, flags)?;
            slot.word(0).store(w0, AtomicOrdering::SeqCst);
            slot.word(1).store(w1, AtomicOrdering::SeqCst);
            state.next_slot += 1;
            Some(FastState {
                obj: FastObject {
                    fd,
                    slot,
                    kind: req.kind,
                },
                idx,
            })
        }
        None => None,
    };

    let body = match req.kind {
        ObjectKind::EventAuto => Body::Event {
            manual: false,
            signaled: req.initial != 0,
        },
        ObjectKind::EventManual => Body::Event {
            manual: true,
            signaled: req.initial != 0,
        },
        ObjectKind::Semaphore => Body::Semaphore {
            count: req.initial,
            max: req.max,
        },
        ObjectKind::Thread => unreachable!(),
    };

    let id = state.next_object;
    state.next_object += 1;
    state.objects.insert(
        id,
        ObjectState {
            body,
            security: req.security.clone(),
            fast,
            refs: 0,
        },
    );
    if let Some(name) = &req.name {
        state.names.insert(name.clone(), id);
    }
    log::debug!("object {} created: {:?} name={:?}", id, req.kind, req.name);
    Ok(id)
}

/// One satisfaction attempt under the dispatcher lock.
///
/// `Ok(Some(..))` resolves the wait, `Ok(None)` means keep blocking.
fn try_satisfy_wait(
    state: &mut DispatcherState,
    pid: u32,
    req: &WaitRequest,
) -> NtResult<Option<WaitStatus>> {
    let mut object_ids = Vec::with_capacity(req.handles.len());
    for &handle in &req.handles {
        let id = state
            .processes
            .get(&pid)
            .and_then(|p| p.handles.get(&handle).copied())
            .ok_or(NtStatus::InvalidHandle)?;
        if !state.objects.contains_key(&id) {
            return Err(NtStatus::InvalidHandle);
        }
        object_ids.push(id);
    }

    if req.wait_all {
        if !object_ids
            .iter()
            .all(|id| state.objects[id].signaled())
        {
            return Ok(None);
        }
        // Consume one by one; a racing fast-path consumer forces rollback.
        let mut taken = Vec::new();
        for &id in &object_ids {
            let object = state.objects.get_mut(&id).ok_or(NtStatus::InvalidHandle)?;
            if object.try_consume() {
                taken.push(id);
            } else {
                for &done in taken.iter().rev() {
                    if let Some(object) = state.objects.get_mut(&done) {
                        object.give_back();
                    }
                }
                return Ok(None);
            }
        }
        return Ok(Some(WaitStatus::Object(0)));
    }

    for (index, &id) in object_ids.iter().enumerate() {
        let object = state.objects.get_mut(&id).ok_or(NtStatus::InvalidHandle)?;
        if object.signaled() && object.try_consume() {
            return Ok(Some(WaitStatus::Object(index as u32)));
        }
    }
    Ok(None)
}

// ============================================================================
// Tests (raw wire level; the client engine has its own end-to-end tests)
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn hello(stream: &UnixStream) -> (HelloReply, Vec<OwnedFd>) {
        let req = HelloRequest {
            cookie: 0,
            unix_pid: std::process::id(),
            unix_tid: 0,
            entry: 0,
            stack_base: 0,
            stack_limit: 0,
            suspended: false,
        };
        send_frame(stream, Opcode::Hello as u32, &req.encode(), &[]).unwrap();
        let (code, payload, fds) = recv_frame(stream).unwrap();
        assert_eq!(code, STATUS_SUCCESS);
        assert_eq!(fds.len(), 3);
        (HelloReply::decode(&payload).unwrap(), fds)
    }

    fn connect(server: &Server) -> (UnixStream, HelloReply) {
        let stream = UnixStream::connect(server.socket_path()).unwrap();
        let (reply, _fds) = hello(&stream);
        (stream, reply)
    }

    fn create(
        stream: &UnixStream,
        kind: ObjectKind,
        initial: u32,
        max: u32,
        name: Option<&str>,
    ) -> Result<CreateObjectReply, u32> {
        let req = CreateObjectRequest {
            kind,
            access: 0x1F0003,
            initial,
            max,
            name: name.map(String::from),
            security: None,
        };
        send_frame(stream, Opcode::CreateObject as u32, &req.encode(), &[]).unwrap();
        let (code, payload, _fds) = recv_frame(stream).unwrap();
        if code == STATUS_SUCCESS {
            Ok(CreateObjectReply::decode(&payload).unwrap())
        } else {
            Err(code)
        }
    }

    fn close(stream: &UnixStream, handle: u32) {
        let mut w = MessageWriter::new();
        w.put_u32(handle);
        send_frame(stream, Opcode::CloseHandle as u32, &w.finish(), &[]).unwrap();
        let (code, _, _) = recv_frame(stream).unwrap();
        assert_eq!(code, STATUS_SUCCESS);
    }

    fn wait_one(stream: &UnixStream, handle: u32, timeout_ms: u64) -> u32 {
        let req = WaitRequest {
            handles: vec![handle],
            wait_all: false,
            timeout_ms,
            alertable: false,
        };
        send_frame(stream, Opcode::Wait as u32, &req.encode(), &[]).unwrap();
        let (code, _, _) = recv_frame(stream).unwrap();
        code
    }

    #[test]
    fn test_hello_assigns_ids() {
        let server = Server::spawn_ephemeral().unwrap();
        let (_s1, r1) = connect(&server);
        assert_ne!(r1.pid, 0);
        assert_ne!(r1.tid, 0);
        assert_ne!(r1.cookie, 0);
        assert!(!r1.fastsync);

        // A second fresh connection is a distinct process.
        let (_s2, r2) = connect(&server);
        assert_ne!(r2.pid, r1.pid);
    }

    #[test]
    fn test_same_cookie_joins_process() {
        let server = Server::spawn_ephemeral().unwrap();
        let (_s1, r1) = connect(&server);

        let stream = UnixStream::connect(server.socket_path()).unwrap();
        let req = HelloRequest {
            cookie: r1.cookie,
            unix_pid: std::process::id(),
            unix_tid: 0,
            entry: 0,
            stack_base: 0,
            stack_limit: 0,
            suspended: false,
        };
        send_frame(&stream, Opcode::Hello as u32, &req.encode(), &[]).unwrap();
        let (code, payload, _) = recv_frame(&stream).unwrap();
        assert_eq!(code, STATUS_SUCCESS);
        let r2 = HelloReply::decode(&payload).unwrap();
        assert_eq!(r2.pid, r1.pid);
        assert_ne!(r2.tid, r1.tid);
    }

    #[test]
    fn test_event_set_wait_reset_cycle() {
        let server = Server::spawn_ephemeral().unwrap();
        let (stream, _) = connect(&server);
        let event = create(&stream, ObjectKind::EventAuto, 0, 0, None).unwrap();
        assert!(event.created);
        assert_eq!(event.shm_idx, NO_SLOT);

        // Unsignaled: zero timeout reports timeout without blocking.
        assert_eq!(wait_one(&stream, event.handle, 0), WaitStatus::Timeout.code());

        let mut w = MessageWriter::new();
        w.put_u32(event.handle);
        send_frame(&stream, Opcode::SetEvent as u32, &w.finish(), &[]).unwrap();
        let (code, _, _) = recv_frame(&stream).unwrap();
        assert_eq!(code, STATUS_SUCCESS);

        // Auto event: one successful wait consumes the signal.
        assert_eq!(wait_one(&stream, event.handle, 0), WaitStatus::Object(0).code());
        assert_eq!(wait_one(&stream, event.handle, 0), WaitStatus::Timeout.code());
    }

    #[test]
    fn test_semaphore_over_release_refused() {
        let server = Server::spawn_ephemeral().unwrap();
        let (stream, _) = connect(&server);
        let sem = create(&stream, ObjectKind::Semaphore, 1, 1, None).unwrap();

        let mut w = MessageWriter::new();
        w.put_u32(sem.handle);
        w.put_u32(1);
        send_frame(&stream, Opcode::ReleaseSemaphore as u32, &w.finish(), &[]).unwrap();
        let (code, _, _) = recv_frame(&stream).unwrap();
        assert_eq!(code, NtStatus::SemaphoreLimitExceeded as u32);

        // Count unchanged: the single unit is still takeable.
        assert_eq!(wait_one(&stream, sem.handle, 0), WaitStatus::Object(0).code());
        assert_eq!(wait_one(&stream, sem.handle, 0), WaitStatus::Timeout.code());
    }

    #[test]
    fn test_named_reopen_and_type_mismatch() {
        let server = Server::spawn_ephemeral().unwrap();
        let (stream, _) = connect(&server);
        let first = create(&stream, ObjectKind::EventManual, 0, 0, Some("gate")).unwrap();
        assert!(first.created);

        // Auto request opens the existing manual event.
        let second = create(&stream, ObjectKind::EventAuto, 0, 0, Some("gate")).unwrap();
        assert!(!second.created);
        assert_eq!(second.kind, ObjectKind::EventManual);
        assert_ne!(second.handle, first.handle);

        let clash = create(&stream, ObjectKind::Semaphore, 0, 5, Some("gate"));
        assert_eq!(clash, Err(NtStatus::ObjectTypeMismatch as u32));
    }

    #[test]
    fn test_wait_blocks_until_signal_from_other_thread() {
        let server = Server::spawn_ephemeral().unwrap();
        let (stream, r1) = connect(&server);
        let event = create(&stream, ObjectKind::EventAuto, 0, 0, Some("wake")).unwrap();

        // Second thread of the same process signals after a delay.
        let path = server.socket_path().to_path_buf();
        let cookie = r1.cookie;
        let signaler = std::thread::spawn(move || {
            let stream = UnixStream::connect(&path).unwrap();
            let req = HelloRequest {
                cookie,
                unix_pid: std::process::id(),
                unix_tid: 0,
                entry: 0,
                stack_base: 0,
                stack_limit: 0,
                suspended: false,
            };
            send_frame(&stream, Opcode::Hello as u32, &req.encode(), &[]).unwrap();
            recv_frame(&stream).unwrap();
            let gate = create(&stream, ObjectKind::EventAuto, 0, 0, Some("wake")).unwrap();
            std::thread::sleep(Duration::from_millis(50));
            let mut w = MessageWriter::new();
            w.put_u32(gate.handle);
            send_frame(&stream, Opcode::SetEvent as u32, &w.finish(), &[]).unwrap();
            recv_frame(&stream).unwrap();
        });

        let started = Instant::now();
        assert_eq!(
            wait_one(&stream, event.handle, 5000),
            WaitStatus::Object(0).code()
        );
        assert!(started.elapsed() >= Duration::from_millis(40));
        signaler.join().unwrap();
    }

    #[test]
    fn test_wait_all_needs_every_object() {
        let server = Server::spawn_ephemeral().unwrap();
        let (stream, _) = connect(&server);
        let a = create(&stream, ObjectKind::EventManual, 1, 0, None).unwrap();
        let b = create(&stream, ObjectKind::Semaphore, 0, 4, None).unwrap();

        let req = WaitRequest {
            handles: vec![a.handle, b.handle],
            wait_all: true,
            timeout_ms: 0,
            alertable: false,
        };
        send_frame(&stream, Opcode::Wait as u32, &req.encode(), &[]).unwrap();
        let (code, _, _) = recv_frame(&stream).unwrap();
        assert_eq!(code, WaitStatus::Timeout.code());

        let mut w = MessageWriter::new();
        w.put_u32(b.handle);
        w.put_u32(1);
        send_frame(&stream, Opcode::ReleaseSemaphore as u32, &w.finish(), &[]).unwrap();
        recv_frame(&stream).unwrap();

        send_frame(&stream, Opcode::Wait as u32, &req.encode(), &[]).unwrap();
        let (code, _, _) = recv_frame(&stream).unwrap();
        assert_eq!(code, WaitStatus::Object(0).code());

        // The semaphore unit was consumed by the all-wait.
        assert_eq!(wait_one(&stream, b.handle, 0), WaitStatus::Timeout.code());
    }

    #[test]
    fn test_alertable_wait_interrupted_by_apc() {
        let server = Server::spawn_ephemeral().unwrap();
        let (stream, r1) = connect(&server);
        let event = create(&stream, ObjectKind::EventAuto, 0, 0, None).unwrap();

        let mut w = MessageWriter::new();
        w.put_u32(r1.tid);
        let mut payload = w.finish();
        payload.extend_from_slice(
            &ApcPayload::User {
                routine: 0x1000,
                args: [1, 2, 3],
            }
            .encode(),
        );
        send_frame(&stream, Opcode::QueueApc as u32, &payload, &[]).unwrap();
        let (code, _, _) = recv_frame(&stream).unwrap();
        assert_eq!(code, STATUS_SUCCESS);

        let req = WaitRequest {
            handles: vec![event.handle],
            wait_all: false,
            timeout_ms: 5000,
            alertable: true,
        };
        send_frame(&stream, Opcode::Wait as u32, &req.encode(), &[]).unwrap();
        let (code, _, _) = recv_frame(&stream).unwrap();
        assert_eq!(code, NtStatus::UserApc as u32);

        // The queued call is retrievable.
        send_frame(&stream, Opcode::GetPendingApc as u32, &[], &[]).unwrap();
        let (code, payload, _) = recv_frame(&stream).unwrap();
        assert_eq!(code, STATUS_SUCCESS);
        assert_eq!(
            ApcPayload::decode(&payload).unwrap(),
            ApcPayload::User {
                routine: 0x1000,
                args: [1, 2, 3],
            }
        );
    }

    #[test]
    fn test_thread_object_signals_on_exit() {
        let server = Server::spawn_ephemeral().unwrap();
        let (stream, r1) = connect(&server);

        let path = server.socket_path().to_path_buf();
        let cookie = r1.cookie;
        let worker = std::thread::spawn(move || {
            let stream = UnixStream::connect(&path).unwrap();
            let req = HelloRequest {
                cookie,
                unix_pid: std::process::id(),
                unix_tid: 0,
                entry: 0,
                stack_base: 0,
                stack_limit: 0,
                suspended: false,
            };
            send_frame(&stream, Opcode::Hello as u32, &req.encode(), &[]).unwrap();
            let (_, payload, _) = recv_frame(&stream).unwrap();
            let reply = HelloReply::decode(&payload).unwrap();
            std::thread::sleep(Duration::from_millis(50));
            let mut w = MessageWriter::new();
            w.put_u32(0);
            send_frame(&stream, Opcode::ExitThread as u32, &w.finish(), &[]).unwrap();
            let _ = recv_frame(&stream);
            reply.tid
        });

        // Learn the worker's tid by polling open_thread until it exists.
        std::thread::sleep(Duration::from_millis(10));
        let worker_tid = {
            let state = server.dispatcher.lock();
            *state
                .threads
                .keys()
                .find(|&&t| t != r1.tid)
                .expect("worker registered")
        };

        let mut w = MessageWriter::new();
        w.put_u32(worker_tid);
        send_frame(&stream, Opcode::OpenThread as u32, &w.finish(), &[]).unwrap();
        let (code, payload, _) = recv_frame(&stream).unwrap();
        assert_eq!(code, STATUS_SUCCESS);
        let opened = CreateObjectReply::decode(&payload).unwrap();
        assert_eq!(opened.kind, ObjectKind::Thread);

        assert_eq!(
            wait_one(&stream, opened.handle, 5000),
            WaitStatus::Object(0).code()
        );
        assert_eq!(worker.join().unwrap(), worker_tid);

        // Signaled state is permanent.
        assert_eq!(
            wait_one(&stream, opened.handle, 0),
            WaitStatus::Object(0).code()
        );
    }

    #[test]
    fn test_fast_backend_hands_out_slots_and_descriptors() {
        let server = Server::spawn_ephemeral_with(true).unwrap();
        let stream = UnixStream::connect(server.socket_path()).unwrap();
        let (reply, _fds) = hello(&stream);
        assert!(reply.fastsync);

        let req = CreateObjectRequest {
            kind: ObjectKind::Semaphore,
            access: 0x1F0003,
            initial: 2,
            max: 5,
            name: None,
            security: None,
        };
        send_frame(&stream, Opcode::CreateObject as u32, &req.encode(), &[]).unwrap();
        let (code, payload, fds) = recv_frame(&stream).unwrap();
        assert_eq!(code, STATUS_SUCCESS);
        let created = CreateObjectReply::decode(&payload).unwrap();
        assert_ne!(created.shm_idx, NO_SLOT);
        assert_eq!(fds.len(), 1);

        // The descriptor is a semaphore-mode eventfd holding the initial
        // count.
        let fd = fds.into_iter().next().unwrap();
        assert!(eventfd_read_one(&fd));
        assert!(eventfd_read_one(&fd));
        assert!(!eventfd_read_one(&fd));
    }

    #[test]
    fn test_invalid_handle_and_type_errors() {
        let server = Server::spawn_ephemeral().unwrap();
        let (stream, _) = connect(&server);
        let sem = create(&stream, ObjectKind::Semaphore, 0, 3, None).unwrap();

        // SetEvent on a semaphore.
        let mut w = MessageWriter::new();
        w.put_u32(sem.handle);
        send_frame(&stream, Opcode::SetEvent as u32, &w.finish(), &[]).unwrap();
        let (code, _, _) = recv_frame(&stream).unwrap();
        assert_eq!(code, NtStatus::ObjectTypeMismatch as u32);

        // Wait on a never-issued handle.
        assert_eq!(wait_one(&stream, 0xBEEF, 0), NtStatus::InvalidHandle as u32);

        // Close twice.
        let mut w = MessageWriter::new();
        w.put_u32(sem.handle);
        let payload = w.finish();
        send_frame(&stream, Opcode::CloseHandle as u32, &payload, &[]).unwrap();
        let (code, _, _) = recv_frame(&stream).unwrap();
        assert_eq!(code, STATUS_SUCCESS);
        send_frame(&stream, Opcode::CloseHandle as u32, &payload, &[]).unwrap();
        let (code, _, _) = recv_frame(&stream).unwrap();
        assert_eq!(code, NtStatus::InvalidHandle as u32);
    }

    #[test]
    fn test_handles_are_multiples_of_four() {
        let server = Server::spawn_ephemeral().unwrap();
        let (stream, _) = connect(&server);
        let a = create(&stream, ObjectKind::EventAuto, 0, 0, None).unwrap();
        let b = create(&stream, ObjectKind::EventAuto, 0, 0, None).unwrap();
        assert_eq!(a.handle % 4, 0);
        assert_eq!(b.handle % 4, 0);
        assert_ne!(a.handle, b.handle);
    }

    #[test]
    fn test_fastsync_defaults_on_and_honors_off_values() {
        std::env::remove_var("REWIND_FASTSYNC");
        assert!(ServerConfig::from_env().fastsync);
        std::env::set_var("REWIND_FASTSYNC", "0");
        assert!(!ServerConfig::from_env().fastsync);
        std::env::set_var("REWIND_FASTSYNC", "off");
        assert!(!ServerConfig::from_env().fastsync);
        std::env::set_var("REWIND_FASTSYNC", "yes");
        assert!(ServerConfig::from_env().fastsync);
        std::env::remove_var("REWIND_FASTSYNC");
    }

    #[test]
    fn test_release_semaphore_bad_handle_keeps_channel() {
        let server = Server::spawn_ephemeral().unwrap();
        let (stream, _) = connect(&server);

        let mut w = MessageWriter::new();
        w.put_u32(0xBEEF);
        w.put_u32(1);
        send_frame(&stream, Opcode::ReleaseSemaphore as u32, &w.finish(), &[]).unwrap();
        let (code, _, _) = recv_frame(&stream).unwrap();
        assert_eq!(code, NtStatus::InvalidHandle as u32);

        // The channel survives the refused call.
        let sem = create(&stream, ObjectKind::Semaphore, 0, 2, None).unwrap();
        let mut w = MessageWriter::new();
        w.put_u32(sem.handle);
        w.put_u32(1);
        send_frame(&stream, Opcode::ReleaseSemaphore as u32, &w.finish(), &[]).unwrap();
        let (code, _, _) = recv_frame(&stream).unwrap();
        assert_eq!(code, STATUS_SUCCESS);
    }

    #[test]
    fn test_last_close_destroys_object_and_name() {
        let server = Server::spawn_ephemeral().unwrap();
        let (stream, _) = connect(&server);
        let first = create(&stream, ObjectKind::EventAuto, 0, 0, Some("short-lived")).unwrap();
        assert!(first.created);
        let second = create(&stream, ObjectKind::EventAuto, 0, 0, Some("short-lived")).unwrap();
        assert!(!second.created);

        // One handle still open: the name keeps resolving.
        close(&stream, first.handle);
        let third = create(&stream, ObjectKind::EventAuto, 0, 0, Some("short-lived")).unwrap();
        assert!(!third.created);

        close(&stream, second.handle);
        close(&stream, third.handle);
        {
            let state = server.dispatcher.lock();
            assert!(state.names.get("short-lived").is_none());
            assert_eq!(state.objects.len(), 1); // only this thread's object
        }

        // The next create by that name starts fresh.
        let fresh = create(&stream, ObjectKind::EventAuto, 0, 0, Some("short-lived")).unwrap();
        assert!(fresh.created);
    }

    #[test]
    fn test_refused_reopen_allocates_no_slot() {
        let server = Server::spawn_ephemeral_with(true).unwrap();
        let stream = UnixStream::connect(server.socket_path()).unwrap();
        let (_reply, _fds) = hello(&stream);

        let first = create(&stream, ObjectKind::Semaphore, 0, 4, Some("typed")).unwrap();
        assert_ne!(first.shm_idx, NO_SLOT);
        let clash = create(&stream, ObjectKind::EventAuto, 0, 0, Some("typed"));
        assert_eq!(clash, Err(NtStatus::ObjectTypeMismatch as u32));

        // The refused reopen consumed nothing from the index space.
        let next = create(&stream, ObjectKind::EventManual, 0, 0, None).unwrap();
        assert_eq!(next.shm_idx, first.shm_idx + 1);
    }
}
