//! Runtime Library
//!
//! Process-local support code: bitmaps, critical sections, retry policy.

pub mod bitmap;
pub mod critical_section;
pub mod retry;
