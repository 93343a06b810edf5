//! Shared Counter Region
//!
//! Backing store for the fast synchronization backend: a POSIX shared
//! memory object divided into fixed 16-byte slots of atomic counters, one
//! slot per fast object. Every process touching a fast object maps the
//! same region; steady-state acquire/release mutates the slot with atomics
//! only, never under a process-local lock.
//!
//! # Addressing
//!
//! Slot *i* lives on page `i * SLOT_SIZE / page_size` at offset
//! `i * SLOT_SIZE % page_size`. Pages are mapped lazily on first touch and
//! cached for the process lifetime; the supervisor grows the backing
//! object by whole pages when it allocates a slot past the current end.
//! Slot indices are allocated monotonically and never reused.
//!
//! # Naming
//!
//! The region name is derived from the device/inode pair of the
//! installation's configuration directory, so every cooperating process
//! computes the same name without coordination.

use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::atomic::AtomicU32;

use memmap2::MmapMut;

use crate::status::{NtResult, NtStatus};

/// Bytes per shared counter slot.
pub const SLOT_SIZE: usize = 16;

/// 32-bit words per slot.
pub const WORDS_PER_SLOT: usize = SLOT_SIZE / 4;

/// Slot index marking "no fast backend" in replies.
pub const NO_SLOT: u32 = u32::MAX;

/// Host page size, queried once.
pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Where slot `idx` lives: `(page number, byte offset within page)`.
pub fn slot_location(idx: u32, page_size: usize) -> (usize, usize) {
    let byte = idx as usize * SLOT_SIZE;
    (byte / page_size, byte % page_size)
}

/// A mapped view of one slot's words.
#[derive(Clone, Copy)]
pub struct SlotRef {
    words: &'static [AtomicU32],
}

impl SlotRef {
    /// Word `i` of the slot payload (0 ≤ i < `WORDS_PER_SLOT`).
    #[inline]
    pub fn word(&self, i: usize) -> &AtomicU32 {
        &self.words[i]
    }
}

/// The shared counter region, creator or consumer side.
pub struct SharedCounters {
    file: File,
    name: String,
    page_size: usize,
    /// Lazily mapped pages; mappings live for the process lifetime.
    pages: spin::Mutex<Vec<Option<&'static [AtomicU32]>>>,
    owner: bool,
}

impl SharedCounters {
    /// Deterministic region name for an installation.
    pub fn region_name(config_dir: &Path) -> NtResult<String> {
        let meta = std::fs::metadata(config_dir).map_err(|e| {
            log::debug!("config dir {:?} not stat-able: {}", config_dir, e);
            NtStatus::from_os_error(e.raw_os_error().unwrap_or(0))
        })?;
        Ok(format!("/rewind-{:x}-{:x}", meta.dev(), meta.ino()))
    }

    /// Create (supervisor side) the region for `config_dir`, truncating any
    /// stale leftover from a previous instance.
    pub fn create(config_dir: &Path) -> NtResult<Self> {
        Self::open_inner(config_dir, true)
    }

    /// Open (client side) the region for `config_dir`.
    pub fn open(config_dir: &Path) -> NtResult<Self> {
        Self::open_inner(config_dir, false)
    }

    fn open_inner(config_dir: &Path, owner: bool) -> NtResult<Self> {
        if owner {
            std::fs::create_dir_all(config_dir)
                .map_err(|e| NtStatus::from_os_error(e.raw_os_error().unwrap_or(0)))?;
        }
        let name = Self::region_name(config_dir)?;
        let cname = CString::new(name.clone()).map_err(|_| NtStatus::InvalidParameter)?;
        let oflag = if owner {
            libc::O_CREAT | libc::O_TRUNC | libc::O_RDWR
        } else {
            libc::O_RDWR
        };
        let fd = unsafe { libc::shm_open(cname.as_ptr(), oflag, 0o600) };
        if fd < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(NtStatus::from_os_error(errno));
        }
        Ok(Self {
            file: unsafe { File::from_raw_fd(fd) },
            name,
            page_size: page_size(),
            pages: spin::Mutex::new(Vec::new()),
            owner,
        })
    }

    /// Region name (for diagnostics).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Grow the backing object so `idx` is addressable. Supervisor only;
    /// growth is by whole host pages.
    pub fn grow_for_slot(&self, idx: u32) -> NtResult<()> {
        let (page, _) = slot_location(idx, self.page_size);
        let needed = ((page + 1) * self.page_size) as libc::off_t;
        let current = self
            .file
            .metadata()
            .map_err(|e| NtStatus::from_os_error(e.raw_os_error().unwrap_or(0)))?
            .len() as libc::off_t;
        if current >= needed {
            return Ok(());
        }
        let rc = unsafe { libc::ftruncate(self.file.as_raw_fd(), needed) };
        if rc != 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(NtStatus::from_os_error(errno));
        }
        log::debug!("shared counter region {} grown to {} bytes", self.name, needed);
        Ok(())
    }

    /// View of slot `idx`, mapping its page on first touch.
    pub fn slot(&self, idx: u32) -> NtResult<SlotRef> {
        if idx == NO_SLOT {
            return Err(NtStatus::InvalidParameter);
        }
        let (page, offset) = slot_location(idx, self.page_size);
        let mut pages = self.pages.lock();
        if page >= pages.len() {
            pages.resize(page + 1, None);
        }
        if pages[page].is_none() {
            let mmap = unsafe {
                memmap2::MmapOptions::new()
                    .offset((page * self.page_size) as u64)
                    .len(self.page_size)
                    .map_mut(&self.file)
            }
            .map_err(|e| NtStatus::from_os_error(e.raw_os_error().unwrap_or(0)))?;
            // The mapping is cached for the process lifetime; leaking the
            // MmapMut pins the page so the word slices below stay valid.
            let mmap: &'static mut MmapMut = Box::leak(Box::new(mmap));
            let words = unsafe {
                std::slice::from_raw_parts(
                    mmap.as_ptr() as *const AtomicU32,
                    self.page_size / 4,
                )
            };
            pages[page] = Some(words);
        }
        let words = pages[page].unwrap();
        let word0 = offset / 4;
        Ok(SlotRef {
            words: &words[word0..word0 + WORDS_PER_SLOT],
        })
    }
}

impl Drop for SharedCounters {
    fn drop(&mut self) {
        if self.owner {
            if let Ok(cname) = CString::new(self.name.clone()) {
                unsafe {
                    libc::shm_unlink(cname.as_ptr());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn temp_config_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "rewind-shm-{}-{}",
            tag,
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_slot_location_math() {
        let psz = 4096;
        assert_eq!(slot_location(0, psz), (0, 0));
        assert_eq!(slot_location(1, psz), (0, 16));
        assert_eq!(slot_location(255, psz), (0, 4080));
        assert_eq!(slot_location(256, psz), (1, 0));
        assert_eq!(slot_location(257, psz), (1, 16));
    }

    #[test]
    fn test_region_name_is_deterministic() {
        let dir = temp_config_dir("name");
        let a = SharedCounters::region_name(&dir).unwrap();
        let b = SharedCounters::region_name(&dir).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("/rewind-"));
    }

    #[test]
    fn test_counters_visible_across_opens() {
        let dir = temp_config_dir("share");
        let server = SharedCounters::create(&dir).unwrap();
        server.grow_for_slot(300).unwrap();

        let slot = server.slot(300).unwrap();
        slot.word(0).store(7, Ordering::SeqCst);
        slot.word(1).store(11, Ordering::SeqCst);

        let client = SharedCounters::open(&dir).unwrap();
        let view = client.slot(300).unwrap();
        assert_eq!(view.word(0).load(Ordering::SeqCst), 7);
        assert_eq!(view.word(1).load(Ordering::SeqCst), 11);

        view.word(0).fetch_add(1, Ordering::SeqCst);
        assert_eq!(slot.word(0).load(Ordering::SeqCst), 8);
    }
}
