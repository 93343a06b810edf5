//! Client/Server Wire Messages
//!
//! The request/reply contract between a client thread and the supervisor.
//! Every exchange is one request frame followed by one reply frame on the
//! thread's dedicated channel:
//!
//! ```text
//! request:  [payload len: u32][opcode: u32][payload]
//! reply:    [payload len: u32][status: u32][payload]
//! ```
//!
//! All integers are little-endian. Descriptors (eventfds) never travel in
//! the payload; they ride as ancillary data next to the reply frame.

use crate::status::{NtResult, NtStatus, MAXIMUM_WAIT_OBJECTS};

/// Largest payload the protocol accepts (handle sets, names).
pub const MAX_PAYLOAD_SIZE: usize = 4096;

/// Request opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    Hello = 1,
    CreateObject = 2,
    OpenThread = 3,
    CloseHandle = 4,
    SetEvent = 5,
    ResetEvent = 6,
    ReleaseSemaphore = 7,
    Wait = 8,
    QueueApc = 9,
    GetPendingApc = 10,
    ApcComplete = 11,
    SuspendThread = 12,
    ResumeThread = 13,
    GetThreadContext = 14,
    SetThreadContext = 15,
    CreateRemoteThread = 16,
    ExitThread = 17,
    ExitProcess = 18,
}

impl Opcode {
    pub fn from_u32(v: u32) -> Option<Opcode> {
        use Opcode::*;
        Some(match v {
            1 => Hello,
            2 => CreateObject,
            3 => OpenThread,
            4 => CloseHandle,
            5 => SetEvent,
            6 => ResetEvent,
            7 => ReleaseSemaphore,
            8 => Wait,
            9 => QueueApc,
            10 => GetPendingApc,
            11 => ApcComplete,
            12 => SuspendThread,
            13 => ResumeThread,
            14 => GetThreadContext,
            15 => SetThreadContext,
            16 => CreateRemoteThread,
            17 => ExitThread,
            18 => ExitProcess,
            _ => return None,
        })
    }
}

/// Synchronization object categories.
///
/// The category is checked when a named object is re-opened: the two event
/// variants substitute for each other, everything else must match exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectKind {
    /// Auto-reset (synchronization) event.
    EventAuto = 0,
    /// Manual-reset (notification) event.
    EventManual = 1,
    /// Counting semaphore.
    Semaphore = 2,
    /// Thread object; signaled when the thread terminates.
    Thread = 3,
}

impl ObjectKind {
    pub fn from_u8(v: u8) -> Option<ObjectKind> {
        Some(match v {
            0 => ObjectKind::EventAuto,
            1 => ObjectKind::EventManual,
            2 => ObjectKind::Semaphore,
            3 => ObjectKind::Thread,
            _ => return None,
        })
    }

    /// Re-open compatibility: event variants are interchangeable.
    pub fn compatible_with(self, other: ObjectKind) -> bool {
        self == other || (self.is_event() && other.is_event())
    }

    #[inline]
    pub fn is_event(self) -> bool {
        matches!(self, ObjectKind::EventAuto | ObjectKind::EventManual)
    }
}

// ============================================================================
// Payload encoding
// ============================================================================

/// Little-endian payload writer.
#[derive(Default)]
pub struct MessageWriter {
    buf: Vec<u8>,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Length-prefixed UTF-8 string; `None` encodes as length 0xFFFF_FFFF.
    pub fn put_opt_str(&mut self, v: Option<&str>) {
        match v {
            None => self.put_u32(u32::MAX),
            Some(s) => {
                self.put_u32(s.len() as u32);
                self.buf.extend_from_slice(s.as_bytes());
            }
        }
    }

    /// Length-prefixed opaque bytes; `None` encodes as length 0xFFFF_FFFF.
    pub fn put_opt_bytes(&mut self, v: Option<&[u8]>) {
        match v {
            None => self.put_u32(u32::MAX),
            Some(b) => {
                self.put_u32(b.len() as u32);
                self.buf.extend_from_slice(b);
            }
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Little-endian payload reader. Truncated input is `InvalidParameter`.
pub struct MessageReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> MessageReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> NtResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(NtStatus::InvalidParameter);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn get_u8(&mut self) -> NtResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> NtResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> NtResult<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn get_opt_str(&mut self) -> NtResult<Option<String>> {
        let len = self.get_u32()?;
        if len == u32::MAX {
            return Ok(None);
        }
        if len as usize > MAX_PAYLOAD_SIZE {
            return Err(NtStatus::InvalidParameter);
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|_| NtStatus::InvalidParameter)
    }

    pub fn get_opt_bytes(&mut self) -> NtResult<Option<Vec<u8>>> {
        let len = self.get_u32()?;
        if len == u32::MAX {
            return Ok(None);
        }
        if len as usize > MAX_PAYLOAD_SIZE {
            return Err(NtStatus::InvalidParameter);
        }
        Ok(Some(self.take(len as usize)?.to_vec()))
    }
}

// ============================================================================
// Typed messages
// ============================================================================

/// First exchange on every per-thread channel. Registers the thread with
/// the supervisor and yields its final identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloRequest {
    /// Process cookie; 0 asks the supervisor to mint a new process record.
    pub cookie: u64,
    /// Host process id (for signal delivery).
    pub unix_pid: u32,
    /// Host thread id (for signal delivery).
    pub unix_tid: u32,
    /// Entry point for the stored thread context.
    pub entry: u64,
    pub stack_base: u64,
    pub stack_limit: u64,
    /// Thread starts suspended; counted before the reply is sent.
    pub suspended: bool,
}

impl HelloRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = MessageWriter::new();
        w.put_u64(self.cookie);
        w.put_u32(self.unix_pid);
        w.put_u32(self.unix_tid);
        w.put_u64(self.entry);
        w.put_u64(self.stack_base);
        w.put_u64(self.stack_limit);
        w.put_u8(self.suspended as u8);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> NtResult<Self> {
        let mut r = MessageReader::new(buf);
        Ok(Self {
            cookie: r.get_u64()?,
            unix_pid: r.get_u32()?,
            unix_tid: r.get_u32()?,
            entry: r.get_u64()?,
            stack_base: r.get_u64()?,
            stack_limit: r.get_u64()?,
            suspended: r.get_u8()? != 0,
        })
    }
}

/// Reply to `Hello`. The alert, suspend and ack eventfds arrive as
/// ancillary descriptors in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloReply {
    pub cookie: u64,
    pub pid: u32,
    pub tid: u32,
    pub fastsync: bool,
}

impl HelloReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = MessageWriter::new();
        w.put_u64(self.cookie);
        w.put_u32(self.pid);
        w.put_u32(self.tid);
        w.put_u8(self.fastsync as u8);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> NtResult<Self> {
        let mut r = MessageReader::new(buf);
        Ok(Self {
            cookie: r.get_u64()?,
            pid: r.get_u32()?,
            tid: r.get_u32()?,
            fastsync: r.get_u8()? != 0,
        })
    }
}

/// Named-object creation/open exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateObjectRequest {
    pub kind: ObjectKind,
    pub access: u32,
    pub initial: u32,
    pub max: u32,
    pub name: Option<String>,
    /// Opaque security descriptor blob; stored, not interpreted.
    pub security: Option<Vec<u8>>,
}

impl CreateObjectRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = MessageWriter::new();
        w.put_u8(self.kind as u8);
        w.put_u32(self.access);
        w.put_u32(self.initial);
        w.put_u32(self.max);
        w.put_opt_str(self.name.as_deref());
        w.put_opt_bytes(self.security.as_deref());
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> NtResult<Self> {
        let mut r = MessageReader::new(buf);
        Ok(Self {
            kind: ObjectKind::from_u8(r.get_u8()?).ok_or(NtStatus::InvalidParameter)?,
            access: r.get_u32()?,
            initial: r.get_u32()?,
            max: r.get_u32()?,
            name: r.get_opt_str()?,
            security: r.get_opt_bytes()?,
        })
    }
}

/// Reply to `CreateObject`/`OpenThread`. When the fast backend is active
/// the object's eventfd arrives as an ancillary descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateObjectReply {
    pub handle: u32,
    /// Resolved category; may differ from the request if the name existed.
    pub kind: ObjectKind,
    /// Shared counter slot, or `u32::MAX` when the fast backend is off.
    pub shm_idx: u32,
    /// False when an existing named object was opened.
    pub created: bool,
}

impl CreateObjectReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = MessageWriter::new();
        w.put_u32(self.handle);
        w.put_u8(self.kind as u8);
        w.put_u32(self.shm_idx);
        w.put_u8(self.created as u8);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> NtResult<Self> {
        let mut r = MessageReader::new(buf);
        Ok(Self {
            handle: r.get_u32()?,
            kind: ObjectKind::from_u8(r.get_u8()?).ok_or(NtStatus::InvalidParameter)?,
            shm_idx: r.get_u32()?,
            created: r.get_u8()? != 0,
        })
    }
}

/// Wait descriptor: handle set, mode, deadline, alertability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitRequest {
    pub handles: Vec<u32>,
    pub wait_all: bool,
    /// Relative timeout in milliseconds; `u64::MAX` waits forever.
    pub timeout_ms: u64,
    pub alertable: bool,
}

impl WaitRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = MessageWriter::new();
        w.put_u32(self.handles.len() as u32);
        for h in &self.handles {
            w.put_u32(*h);
        }
        w.put_u8(self.wait_all as u8);
        w.put_u64(self.timeout_ms);
        w.put_u8(self.alertable as u8);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> NtResult<Self> {
        let mut r = MessageReader::new(buf);
        let count = r.get_u32()? as usize;
        if count == 0 || count > MAXIMUM_WAIT_OBJECTS {
            return Err(NtStatus::InvalidParameter);
        }
        let mut handles = Vec::with_capacity(count);
        for _ in 0..count {
            handles.push(r.get_u32()?);
        }
        Ok(Self {
            handles,
            wait_all: r.get_u8()? != 0,
            timeout_ms: r.get_u64()?,
            alertable: r.get_u8()? != 0,
        })
    }
}

/// An asynchronous call delivered to a thread inside an alertable wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApcPayload {
    /// Nothing queued.
    None,
    /// User APC: routine plus up to three scalar arguments. The routine
    /// address is only meaningful inside the queuing process.
    User { routine: u64, args: [u64; 3] },
    /// System APC: create a thread in the receiving process on behalf of a
    /// remote caller identified by `cookie`.
    CreateThread {
        cookie: u64,
        entry: u64,
        arg: u64,
        stack_reserve: u64,
        stack_commit: u64,
        suspended: bool,
    },
}

impl ApcPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = MessageWriter::new();
        match *self {
            ApcPayload::None => w.put_u8(0),
            ApcPayload::User { routine, args } => {
                w.put_u8(1);
                w.put_u64(routine);
                for a in args {
                    w.put_u64(a);
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
                w.put_u8(2);
                w.put_u64(cookie);
                w.put_u64(entry);
                w.put_u64(arg);
                w.put_u64(stack_reserve);
                w.put_u64(stack_commit);
                w.put_u8(suspended as u8);
            }
        }
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> NtResult<Self> {
        let mut r = MessageReader::new(buf);
        Ok(match r.get_u8()? {
            0 => ApcPayload::None,
            1 => ApcPayload::User {
                routine: r.get_u64()?,
                args: [r.get_u64()?, r.get_u64()?, r.get_u64()?],
            },
            2 => ApcPayload::CreateThread {
                cookie: r.get_u64()?,
                entry: r.get_u64()?,
                arg: r.get_u64()?,
                stack_reserve: r.get_u64()?,
                stack_commit: r.get_u64()?,
                suspended: r.get_u8()? != 0,
            },
            _ => return Err(NtStatus::InvalidParameter),
        })
    }
}

/// The runtime-visible execution context of a thread, readable only while
/// the target is suspended and parked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadContext {
    pub entry: u64,
    pub stack_base: u64,
    pub stack_limit: u64,
    pub suspend_count: u32,
}

impl ThreadContext {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = MessageWriter::new();
        w.put_u64(self.entry);
        w.put_u64(self.stack_base);
        w.put_u64(self.stack_limit);
        w.put_u32(self.suspend_count);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> NtResult<Self> {
        let mut r = MessageReader::new(buf);
        Ok(Self {
            entry: r.get_u64()?,
            stack_base: r.get_u64()?,
            stack_limit: r.get_u64()?,
            suspend_count: r.get_u32()?,
        })
    }
}
