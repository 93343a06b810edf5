//! Asynchronous Procedure Calls
//!
//! An APC targets one thread and carries a routine plus up to three scalar
//! arguments. It is queued by any thread and executed by the target the
//! next time it enters, or already sits in, an alertable wait. Delivery
//! interrupts the wait; the wait then resumes with its remaining timeout.
//!
//! The pending queue itself lives in the supervisor, which owns rundown
//! and ordering; this module is the in-process representation and the
//! wire conversion.

/// Routine executed on the target thread.
pub type ApcRoutine = fn(usize, usize, usize);

/// One queued asynchronous call.
#[derive(Clone, Copy)]
pub struct ApcEntry {
    pub routine: ApcRoutine,
    pub args: [usize; 3],
}

impl ApcEntry {
    pub fn new(routine: ApcRoutine, args: [usize; 3]) -> Self {
        Self { routine, args }
    }

    /// Execute the call on the current thread.
    pub fn deliver(self) {
        (self.routine)(self.args[0], self.args[1], self.args[2]);
    }

    /// Wire form: the routine address is only meaningful inside the
    /// process that queued it.
    pub fn to_wire(&self) -> (u64, [u64; 3]) {
        (
            self.routine as usize as u64,
            [
                self.args[0] as u64,
                self.args[1] as u64,
                self.args[2] as u64,
            ],
        )
    }

    /// Rebuild from the wire form.
    ///
    /// # Safety
    /// `routine` must be an address produced by [`ApcEntry::to_wire`] in
    /// this same process image.
    pub unsafe fn from_wire(routine: u64, args: [u64; 3]) -> Option<ApcEntry> {
        if routine == 0 {
            return None;
        }
        let routine: ApcRoutine = std::mem::transmute(routine as usize);
        Some(ApcEntry {
            routine,
            args: [args[0] as usize, args[1] as usize, args[2] as usize],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DELIVERED: AtomicUsize = AtomicUsize::new(0);

    fn bump(a: usize, _b: usize, _c: usize) {
        DELIVERED.fetch_add(a, Ordering::SeqCst);
    }

    #[test]
    fn test_delivery_passes_arguments() {
        let before = DELIVERED.load(Ordering::SeqCst);
        ApcEntry::new(bump, [3, 0, 0]).deliver();
        assert_eq!(DELIVERED.load(Ordering::SeqCst) - before, 3);
    }

    #[test]
    fn test_wire_roundtrip() {
        let entry = ApcEntry::new(bump, [9, 8, 7]);
        let (routine, args) = entry.to_wire();
        let back = unsafe { ApcEntry::from_wire(routine, args) }.unwrap();
        assert_eq!(back.args, [9, 8, 7]);
        assert!(unsafe { ApcEntry::from_wire(0, [0; 3]) }.is_none());
    }
}
