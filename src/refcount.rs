//! Logical reference counter shared by devices, contexts, buffers and
//! physical resources.
//!
//! Memory is owned by `Arc`; this counter decides when teardown runs.
//! Only the caller that observes the transition to zero tears down.

use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug)]
pub(crate) struct RefCount(AtomicU32);

impl RefCount {
    pub(crate) fn new(initial: u32) -> Self {
        Self(AtomicU32::new(initial))
    }

    pub(crate) fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// Take a reference on an object the caller already holds one on.
    pub(crate) fn acquire(&self) -> u32 {
        let prev = self.0.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "reference taken on an object with no owners");
        prev + 1
    }

    /// Take a reference only if the object is still live.
    ///
    /// Used when the object was found through a list rather than through a
    /// reference the caller already owns.
    pub(crate) fn try_acquire(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                if count == 0 {
                    None
                } else {
                    Some(count + 1)
                }
            })
            .is_ok()
    }

    /// Drop a reference. Returns `true` for the 1 -> 0 transition.
    pub(crate) fn release(&self) -> bool {
        match self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
        {
            Ok(prev) => prev == 1,
            Err(_) => {
                debug_assert!(false, "reference released on an object with no owners");
                log::error!("Reference count underflow ignored");
                false
            }
        }
    }
}
