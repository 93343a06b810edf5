//! Process Environment Block (PEB)
//!
//! One per process context: identity, the default heap handle, the
//! captured environment block, the module list, TLS/FLS allocation
//! bitmaps, session identifier, and a pointer to the process-wide
//! read-only shared system data. Created once at attach; lives for the
//! context's lifetime and is never individually destroyed.
//!
//! The process-wide lock is a critical section so a holder may reenter
//! it, and it is only handed out as an RAII guard.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::csr::client::SyncEngine;
use crate::rtl::bitmap::RtlBitmap;
use crate::rtl::critical_section::CriticalSection;
use crate::status::{NtResult, NtStatus};

use super::teb::TLS_SLOTS;

/// Number of fiber-local-storage indices.
pub const FLS_SLOTS: usize = 128;

/// Read-only process-wide system data, shared by reference.
#[derive(Debug)]
pub struct UserSharedData {
    /// Seconds since the Unix epoch at first access.
    pub boot_time: u64,
    pub page_size: usize,
    pub unix_pid: u32,
}

static USER_SHARED: OnceLock<UserSharedData> = OnceLock::new();

/// The process-wide shared data, built on first use.
pub fn user_shared() -> &'static UserSharedData {
    USER_SHARED.get_or_init(|| UserSharedData {
        boot_time: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
        page_size: crate::ke::shm::page_size(),
        unix_pid: std::process::id(),
    })
}

/// One entry in the module list.
#[derive(Debug, Clone)]
pub struct ModuleRecord {
    pub name: String,
    pub base: usize,
    pub size: usize,
}

/// Process Environment Block.
pub struct Peb {
    /// Supervisor-assigned process identifier.
    pub process_id: AtomicU32,
    /// Image base address of the main module, if any.
    pub image_base: AtomicUsize,
    /// Default process heap handle; 0 until a heap is installed.
    pub process_heap: AtomicUsize,
    /// Session this context belongs to.
    pub session_id: AtomicU32,
    /// Read-only shared system data.
    pub user_shared: &'static UserSharedData,
    /// Environment block, captured from the host at creation.
    environment: spin::Mutex<BTreeMap<String, String>>,
    /// Registered modules, load order.
    modules: spin::Mutex<Vec<ModuleRecord>>,
    /// Process-wide structure lock.
    lock: CriticalSection,
    /// Allocation state of the TEB TLS slot array.
    tls_bitmap: spin::Mutex<RtlBitmap>,
    /// Allocation state of the FLS index space.
    fls_bitmap: spin::Mutex<RtlBitmap>,
}

impl Peb {
    pub fn new(engine: Arc<SyncEngine>) -> Peb {
        let environment = std::env::vars().collect();
        Peb {
            process_id: AtomicU32::new(0),
            image_base: AtomicUsize::new(0),
            process_heap: AtomicUsize::new(0),
            session_id: AtomicU32::new(0),
            user_shared: user_shared(),
            environment: spin::Mutex::new(environment),
            modules: spin::Mutex::new(Vec::new()),
            lock: CriticalSection::named(engine, "peb"),
            tls_bitmap: spin::Mutex::new(RtlBitmap::new(TLS_SLOTS as u32)),
            fls_bitmap: spin::Mutex::new(RtlBitmap::new(FLS_SLOTS as u32)),
        }
    }

    /// Acquire the process-wide lock. Reentrant; released when the guard
    /// drops.
    pub fn lock(&self) -> NtResult<PebLockGuard<'_>> {
        self.lock.enter()?;
        Ok(PebLockGuard { peb: self })
    }

    // ------------------------------------------------------------------
    // Environment block
    // ------------------------------------------------------------------

    pub fn env_get(&self, name: &str) -> Option<String> {
        self.environment.lock().get(name).cloned()
    }

    pub fn env_set(&self, name: &str, value: Option<&str>) {
        let mut environment = self.environment.lock();
        match value {
            Some(value) => {
                environment.insert(name.to_string(), value.to_string());
            }
            None => {
                environment.remove(name);
            }
        }
    }

    // ------------------------------------------------------------------
    // Module list
    // ------------------------------------------------------------------

    /// Append a module record; the first one also becomes the image base.
    pub fn register_module(&self, name: &str, base: usize, size: usize) {
        let mut modules = self.modules.lock();
        if modules.is_empty() {
            self.image_base.store(base, Ordering::Release);
        }
        modules.push(ModuleRecord {
            name: name.to_string(),
            base,
            size,
        });
    }

    /// Snapshot of the module list in load order.
    pub fn modules(&self) -> Vec<ModuleRecord> {
        self.modules.lock().clone()
    }

    // ------------------------------------------------------------------
    // TLS / FLS index allocation
    // ------------------------------------------------------------------

    /// Allocate a free TLS index, zeroed on every thread by construction.
    pub fn tls_alloc(&self) -> NtResult<u32> {
        let mut bitmap = self.tls_bitmap.lock();
        match bitmap.find_clear_bit_and_set() {
            Some(index) => Ok(index),
            None => {
                log::warn!("tls slot table exhausted ({} slots)", TLS_SLOTS);
                Err(NtStatus::NoMemory)
            }
        }
    }

    /// Release a TLS index for reuse. The caller clears the slot on live
    /// threads; see `Process::tls_free`.
    pub fn tls_free(&self, index: u32) -> NtResult<()> {
        let mut bitmap = self.tls_bitmap.lock();
        if index >= TLS_SLOTS as u32 || !bitmap.test_bit(index) {
            return Err(NtStatus::InvalidParameter);
        }
        bitmap.clear_bit(index);
        Ok(())
    }

    /// Allocate a free FLS index.
    pub fn fls_alloc(&self) -> NtResult<u32> {
        let mut bitmap = self.fls_bitmap.lock();
        match bitmap.find_clear_bit_and_set() {
            Some(index) => Ok(index),
            None => {
                log::warn!("fls index space exhausted ({} slots)", FLS_SLOTS);
                Err(NtStatus::NoMemory)
            }
        }
    }

    /// Release an FLS index for reuse.
    pub fn fls_free(&self, index: u32) -> NtResult<()> {
        let mut bitmap = self.fls_bitmap.lock();
        if index >= FLS_SLOTS as u32 || !bitmap.test_bit(index) {
            return Err(NtStatus::InvalidParameter);
        }
        bitmap.clear_bit(index);
        Ok(())
    }
}

/// Holds the PEB lock until dropped.
pub struct PebLockGuard<'a> {
    peb: &'a Peb,
}

impl Drop for PebLockGuard<'_> {
    fn drop(&mut self) {
        self.peb.lock.leave();
    }
}
