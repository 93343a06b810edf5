//! Client/Server Runtime
//!
//! The cross-process half of the runtime: wire messages, descriptor
//! passing, the supervisor, and the per-process client engine.

pub mod client;
pub mod fdpass;
pub mod message;
pub mod server;

use bitflags::bitflags;

/// Opaque per-process reference to a supervisor object.
///
/// Values are minted by the supervisor as multiples of 4 and mean nothing
/// outside the process that received them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub u32);

impl Handle {
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

bitflags! {
    /// Requested access to a synchronization object. Recorded with the
    /// handle; enforcement is not part of this runtime.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjectAccess: u32 {
        /// May be passed to a wait.
        const SYNCHRONIZE = 0x0010_0000;
        /// May change object state (set/reset/release).
        const MODIFY_STATE = 0x0000_0002;
        /// Standard-rights bits granted with full access.
        const STANDARD = 0x000F_0000;
        /// Object-specific query right.
        const QUERY = 0x0000_0001;
    }
}

impl ObjectAccess {
    /// Everything a creator gets by default.
    pub fn full() -> ObjectAccess {
        ObjectAccess::all()
    }
}
