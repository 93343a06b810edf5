//! Rewind
//!
//! A user-space recreation of the NT thread, process and synchronization
//! model on POSIX hosts. Processes connect to a supervisor over a Unix
//! socket; the supervisor owns every synchronization object and arbitrates
//! waits, while an optional eventfd-backed fast path lets clients signal
//! and consume without a round trip.
//!
//! The major subsystems follow the NT layering:
//!
//! - **csr** - Client/Server Runtime: wire protocol, descriptor passing,
//!   the supervisor, and the per-process engine
//! - **ke** - Executive primitives: APCs, shared counters, fast objects
//! - **ps** - Process structure: TEBs, the PEB, thread creation and parking
//! - **rtl** - Runtime library: bitmaps, critical sections, retry policy
//!
//! A typical client attaches a [`Process`] to an engine connected to a
//! running [`Server`], then creates threads and objects through it.

pub mod csr;
pub mod ke;
pub mod logger;
pub mod ps;
pub mod rtl;
pub mod status;

pub use csr::client::SyncEngine;
pub use csr::server::{Server, ServerConfig};
pub use csr::{Handle, ObjectAccess};
pub use ps::Process;
pub use rtl::critical_section::CriticalSection;
pub use status::{NtResult, NtStatus, WaitStatus};
