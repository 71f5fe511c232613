//! Background queue runner
//!
//! One thread per server re-runs the command queue of every registered
//! context whenever something may have unblocked it: a retirement, a
//! backend completion notification, or a client told to retry. A periodic
//! tick catches acquire fences signalled behind the server's back.

use crate::context::DisplayContext;
use crate::error::{DcError, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

type Handlers = RwLock<BTreeMap<u64, Weak<DisplayContext>>>;

/// Registration of one context with the runner
#[derive(Debug)]
pub(crate) struct RunnerHandle(u64);

pub(crate) struct QueueRunner {
    wake: Sender<()>,
    handlers: Arc<Handlers>,
    next_handle: AtomicU64,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl QueueRunner {
    pub(crate) fn start(period: Duration) -> Result<Self> {
        // One pending wake is enough; extra nudges coalesce.
        let (wake, rx) = channel::bounded(1);
        let handlers: Arc<Handlers> = Arc::new(RwLock::new(BTreeMap::new()));
        let running = Arc::new(AtomicBool::new(true));

        log::info!("Starting display queue runner ({:?} tick)", period);
        let thread = {
            let handlers = handlers.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("dc-queue-runner".into())
                .spawn(move || runner_loop(rx, handlers, running, period))
                .map_err(|e| {
                    log::error!("Failed to spawn display queue runner: {}", e);
                    DcError::OutOfMemory
                })?
        };

        Ok(Self {
            wake,
            handlers,
            next_handle: AtomicU64::new(1),
            running,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn register(&self, ctx: &Arc<DisplayContext>) -> RunnerHandle {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handlers.write().insert(id, Arc::downgrade(ctx));
        log::debug!("Context {} registered with queue runner", ctx.id().0);
        RunnerHandle(id)
    }

    pub(crate) fn unregister(&self, handle: RunnerHandle) {
        self.handlers.write().remove(&handle.0);
    }

    /// Wake the runner for an immediate pass.
    pub(crate) fn nudge(&self) {
        // Full means a wake is already pending.
        let _ = self.wake.try_send(());
    }

    pub(crate) fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        log::info!("Stopping display queue runner");
        self.nudge();

        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                log::error!("Display queue runner panicked");
            }
        }
    }
}

impl Drop for QueueRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn runner_loop(rx: Receiver<()>, handlers: Arc<Handlers>, running: Arc<AtomicBool>, period: Duration) {
    while running.load(Ordering::Acquire) {
        match rx.recv_timeout(period) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if !running.load(Ordering::Acquire) {
            break;
        }

        // Snapshot so no runner lock is held while queues run.
        let contexts: Vec<Arc<DisplayContext>> = handlers.read().values().filter_map(Weak::upgrade).collect();

        for ctx in contexts {
            if ctx.is_paused() || !ctx.try_acquire_ref() {
                continue;
            }
            let outcome = ctx.run_queue();
            log::trace!("Queue runner pass on context {}: {:?}", ctx.id().0, outcome);
            ctx.release_ref();
        }
    }
    log::debug!("Display queue runner exited");
}
