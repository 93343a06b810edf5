//! Kernel Executive Primitives
//!
//! The mechanisms under the synchronization surface: asynchronous
//! procedure calls, the shared counter region, and the eventfd-backed
//! fast object state used by both supervisor and clients.

pub mod apc;
pub mod fast;
pub mod shm;
