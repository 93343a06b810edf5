//! Thread Registry
//!
//! Process-wide table of live TEBs. Storage is a slot arena: each entry
//! holds a shared TEB plus a generation counter, and a [`ThreadSlotId`]
//! names an entry only while its generation matches. A stale id after the
//! slot has been reaped and reused misses cleanly instead of touching the
//! wrong thread.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::teb::Teb;

/// Generation-checked reference to a registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadSlotId {
    index: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    teb: Option<Arc<Teb>>,
}

struct RegistryInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Runtime tid to slot index, populated once the supervisor assigns ids.
    by_tid: BTreeMap<u32, u32>,
}

/// Registry of every thread the runtime knows about in this process.
pub struct ThreadRegistry {
    inner: spin::Mutex<RegistryInner>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            inner: spin::Mutex::new(RegistryInner {
                slots: Vec::new(),
                free: Vec::new(),
                by_tid: BTreeMap::new(),
            }),
        }
    }

    /// Insert a TEB, reusing a reaped slot when one is free.
    pub fn insert(&self, teb: Box<Teb>) -> (ThreadSlotId, Arc<Teb>) {
        let teb: Arc<Teb> = Arc::from(teb);
        let mut inner = self.inner.lock();
        let index = match inner.free.pop() {
            Some(index) => {
                inner.slots[index as usize].teb = Some(Arc::clone(&teb));
                index
            }
            None => {
                let index = inner.slots.len() as u32;
                inner.slots.push(Slot {
                    generation: 0,
                    teb: Some(Arc::clone(&teb)),
                });
                index
            }
        };
        let generation = inner.slots[index as usize].generation;
        (ThreadSlotId { index, generation }, teb)
    }

    /// Resolve a slot id; stale generations miss.
    pub fn get(&self, id: ThreadSlotId) -> Option<Arc<Teb>> {
        let inner = self.inner.lock();
        let slot = inner.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.teb.clone()
    }

    /// Record the supervisor-assigned tid for a slot.
    pub fn bind_tid(&self, id: ThreadSlotId, tid: u32) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.get(id.index as usize) {
            if slot.generation == id.generation && slot.teb.is_some() {
                inner.by_tid.insert(tid, id.index);
            }
        }
    }

    /// Look a thread up by its runtime tid.
    pub fn by_tid(&self, tid: u32) -> Option<Arc<Teb>> {
        let inner = self.inner.lock();
        let index = *inner.by_tid.get(&tid)?;
        inner.slots[index as usize].teb.clone()
    }

    /// Reap a slot: bump its generation so outstanding ids go stale, drop
    /// the tid mapping, and return the TEB for the reaper to release.
    pub fn remove(&self, id: ThreadSlotId) -> Option<Arc<Teb>> {
        let mut inner = self.inner.lock();
        let slot = inner.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let teb = slot.teb.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        let tid = teb.client_id().thread;
        inner.free.push(id.index);
        if tid != 0 {
            inner.by_tid.remove(&tid);
        }
        Some(teb)
    }

    /// Pull every exited thread out of the registry so the caller can
    /// join its host thread and release the TEB. Entries without a host
    /// thread handle yet are left alone; the creator is still setting
    /// them up.
    pub fn take_exited(&self) -> Vec<Arc<Teb>> {
        let mut inner = self.inner.lock();
        let mut reaped = Vec::new();
        for index in 0..inner.slots.len() {
            let ready = match &inner.slots[index].teb {
                Some(teb) => {
                    teb.private.exited.load(std::sync::atomic::Ordering::Acquire)
                        && teb.private.host_thread.lock().is_some()
                }
                None => false,
            };
            if !ready {
                continue;
            }
            let slot = &mut inner.slots[index];
            let teb = slot.teb.take().unwrap();
            slot.generation = slot.generation.wrapping_add(1);
            let tid = teb.client_id().thread;
            inner.free.push(index as u32);
            if tid != 0 {
                inner.by_tid.remove(&tid);
            }
            reaped.push(teb);
        }
        reaped
    }

    /// Visit every live thread. TEBs are snapshotted first so `f` runs
    /// without the registry lock held.
    pub fn for_each(&self, mut f: impl FnMut(&Teb)) {
        let snapshot: Vec<Arc<Teb>> = {
            let inner = self.inner.lock();
            inner
                .slots
                .iter()
                .filter_map(|s| s.teb.clone())
                .collect()
        };
        for teb in &snapshot {
            f(teb);
        }
    }

    /// Number of live threads.
    pub fn len(&self) -> usize {
        self.inner.lock().slots.iter().filter(|s| s.teb.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_insert_and_get() {
        let registry = ThreadRegistry::new();
        let (id, teb) = registry.insert(Teb::allocate().unwrap());
        teb.header.thread_id.store(8, Ordering::Release);
        let found = registry.get(id).unwrap();
        assert_eq!(found.client_id().thread, 8);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stale_id_misses_after_reuse() {
        let registry = ThreadRegistry::new();
        let (old_id, _) = registry.insert(Teb::allocate().unwrap());
        assert!(registry.remove(old_id).is_some());
        assert!(registry.get(old_id).is_none());
        assert!(registry.remove(old_id).is_none());

        // The freed slot is reused under a new generation.
        let (new_id, _) = registry.insert(Teb::allocate().unwrap());
        assert!(registry.get(old_id).is_none());
        assert!(registry.get(new_id).is_some());
    }

    #[test]
    fn test_tid_lookup() {
        let registry = ThreadRegistry::new();
        let (id, teb) = registry.insert(Teb::allocate().unwrap());
        teb.header.thread_id.store(77, Ordering::Release);
        registry.bind_tid(id, 77);

        assert_eq!(registry.by_tid(77).unwrap().client_id().thread, 77);
        registry.remove(id).unwrap();
        assert!(registry.by_tid(77).is_none());
    }

    #[test]
    fn test_take_exited_skips_unfinished_threads() {
        let registry = ThreadRegistry::new();
        let (_a, done) = registry.insert(Teb::allocate().unwrap());
        let (_b, _live) = registry.insert(Teb::allocate().unwrap());

        done.private.exited.store(true, Ordering::Release);
        // No host thread recorded yet: the creator still owns the entry.
        assert!(registry.take_exited().is_empty());

        *done.private.host_thread.lock() = Some(unsafe { libc::pthread_self() });
        let reaped = registry.take_exited();
        assert_eq!(reaped.len(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_for_each_visits_live_threads() {
        let registry = ThreadRegistry::new();
        let (a, _) = registry.insert(Teb::allocate().unwrap());
        let (_b, _) = registry.insert(Teb::allocate().unwrap());
        registry.remove(a).unwrap();

        let mut seen = 0;
        registry.for_each(|_| seen += 1);
        assert_eq!(seen, 1);
    }
}
