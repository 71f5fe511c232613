//! Fences gating and reporting display configurations.
//!
//! An acquire fence keeps a queued configuration from running until the
//! producer of its buffers is done. A release fence, created on the
//! caller's [`Timeline`], is signalled once the configuration retires.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

struct FenceInner {
    timeline: Arc<str>,
    seqno: u64,
    signalled: Mutex<bool>,
    cond: Condvar,
    notify: Notify,
}

/// A one-shot synchronization point. Clones share state.
#[derive(Clone)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

impl Fence {
    fn with_seqno(timeline: Arc<str>, seqno: u64, signalled: bool) -> Self {
        Self {
            inner: Arc::new(FenceInner {
                timeline,
                seqno,
                signalled: Mutex::new(signalled),
                cond: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// A standalone unsignalled fence
    pub fn new(name: &str) -> Self {
        Self::with_seqno(Arc::from(name), 0, false)
    }

    /// A fence that is already signalled
    pub fn signalled(name: &str) -> Self {
        Self::with_seqno(Arc::from(name), 0, true)
    }

    pub fn timeline_name(&self) -> &str {
        &self.inner.timeline
    }

    pub fn seqno(&self) -> u64 {
        self.inner.seqno
    }

    pub fn is_signalled(&self) -> bool {
        *self.inner.signalled.lock()
    }

    /// Signal the fence and wake every waiter. Signalling twice is a no-op.
    pub fn signal(&self) {
        let mut signalled = self.inner.signalled.lock();
        if *signalled {
            return;
        }
        *signalled = true;
        drop(signalled);

        self.inner.cond.notify_all();
        self.inner.notify.notify_waiters();
    }

    /// Block until signalled or `timeout` elapses. Returns whether the
    /// fence is signalled.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signalled = self.inner.signalled.lock();
        while !*signalled {
            if self.inner.cond.wait_until(&mut signalled, deadline).timed_out() {
                return *signalled;
            }
        }
        true
    }

    pub async fn wait_async(&self) {
        loop {
            // Registered before the check so a concurrent signal is not lost.
            let notified = self.inner.notify.notified();
            if self.is_signalled() {
                return;
            }
            notified.await;
        }
    }

    pub fn ptr_eq(&self, other: &Fence) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("timeline", &self.inner.timeline)
            .field("seqno", &self.inner.seqno)
            .field("signalled", &self.is_signalled())
            .finish()
    }
}

/// Source of monotonically numbered release fences
#[derive(Debug)]
pub struct Timeline {
    name: Arc<str>,
    next_seqno: AtomicU64,
}

impl Timeline {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            next_seqno: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn create_fence(&self) -> Fence {
        let seqno = self.next_seqno.fetch_add(1, Ordering::Relaxed);
        Fence::with_seqno(self.name.clone(), seqno, false)
    }
}
