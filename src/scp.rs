//! Software command processor
//!
//! A single-consumer, multi-producer FIFO of opaque commands. A command at
//! the head is handed to its consumer once its acquire fence is signalled
//! and its readiness predicate agrees. Executed commands stay owned by the
//! processor until [`CommandProcessor::complete`] retires them, oldest
//! first, which also signals their release fences.

use crate::error::{DcError, Result};
use crate::fence::Fence;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A unit of work queued on a [`CommandProcessor`]
pub trait ScpCommand: Send {
    /// Whether the command may run now. Called with the queue locked, so it
    /// must not call back into the processor.
    fn is_ready(&self) -> bool;

    /// Hand the command to its consumer. Called without the queue locked.
    fn execute(self: Box<Self>);
}

/// Why the head of the queue could not run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocked {
    /// The acquire fence is not yet signalled
    FenceDependency,
    /// The readiness predicate refused
    NotReady,
}

/// Result of one [`CommandProcessor::run`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// This many commands were executed before the queue emptied or blocked
    Executed(usize),
    /// Nothing was queued
    Idle,
    /// The head command could not run and nothing was executed
    Blocked(Blocked),
}

impl RunOutcome {
    /// Executed something or found nothing to do
    pub fn is_good(&self) -> bool {
        !matches!(self, RunOutcome::Blocked(_))
    }
}

struct QueuedCommand {
    command: Box<dyn ScpCommand>,
    acquire: Option<Fence>,
    release: Option<Fence>,
}

#[derive(Default)]
struct ScpState {
    queued: VecDeque<QueuedCommand>,
    /// Release fences of executed commands, in execution order
    awaiting: VecDeque<Option<Fence>>,
}

impl ScpState {
    fn is_drained(&self) -> bool {
        self.queued.is_empty() && self.awaiting.is_empty()
    }
}

pub struct CommandProcessor {
    capacity: usize,
    state: Mutex<ScpState>,
    /// Serializes consumers so commands execute in submission order
    run_lock: Mutex<()>,
    drained: Condvar,
}

impl CommandProcessor {
    /// Create a processor holding at most `capacity` commands, counting
    /// both queued and executed-but-unretired ones.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(DcError::InvalidParameter("command queue capacity is zero"));
        }

        Ok(Self {
            capacity,
            state: Mutex::new(ScpState::default()),
            run_lock: Mutex::new(()),
            drained: Condvar::new(),
        })
    }

    /// Queue a command. Fails with [`DcError::Retry`] when full.
    pub fn submit(
        &self,
        command: Box<dyn ScpCommand>,
        acquire: Option<Fence>,
        release: Option<Fence>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.queued.len() + state.awaiting.len() >= self.capacity {
            return Err(DcError::Retry);
        }

        state.queued.push_back(QueuedCommand {
            command,
            acquire,
            release,
        });
        Ok(())
    }

    /// Execute queued commands in order until the queue empties or the
    /// head blocks.
    pub fn run(&self) -> RunOutcome {
        let _running = self.run_lock.lock();
        let mut executed = 0;

        loop {
            let mut state = self.state.lock();
            let blocked = match state.queued.front() {
                None => break,
                Some(head) => {
                    if head.acquire.as_ref().is_some_and(|f| !f.is_signalled()) {
                        Some(Blocked::FenceDependency)
                    } else if !head.command.is_ready() {
                        Some(Blocked::NotReady)
                    } else {
                        None
                    }
                }
            };

            if let Some(reason) = blocked {
                return if executed > 0 {
                    RunOutcome::Executed(executed)
                } else {
                    RunOutcome::Blocked(reason)
                };
            }

            let Some(QueuedCommand { command, release, .. }) = state.queued.pop_front() else {
                break;
            };
            state.awaiting.push_back(release);
            drop(state);

            command.execute();
            executed += 1;
        }

        if executed > 0 {
            RunOutcome::Executed(executed)
        } else {
            RunOutcome::Idle
        }
    }

    /// Retire the oldest executed command and signal its release fence.
    pub fn complete(&self) {
        let mut state = self.state.lock();
        let Some(release) = state.awaiting.pop_front() else {
            debug_assert!(false, "command completed with nothing in flight");
            log::error!("Command completion with no executed command ignored");
            return;
        };
        let drained = state.is_drained();
        drop(state);

        if let Some(fence) = release {
            fence.signal();
        }
        if drained {
            self.drained.notify_all();
        }
    }

    /// Whether any command is queued or awaiting retirement
    pub fn has_pending(&self) -> bool {
        !self.state.lock().is_drained()
    }

    /// Queued plus executed-but-unretired commands
    pub fn outstanding(&self) -> usize {
        let state = self.state.lock();
        state.queued.len() + state.awaiting.len()
    }

    pub fn queued_len(&self) -> usize {
        self.state.lock().queued.len()
    }

    /// Wait until every command has retired. Fails with
    /// [`DcError::Retry`] if `timeout` elapses first.
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.is_drained() {
            if self.drained.wait_until(&mut state, deadline).timed_out() && !state.is_drained() {
                log::debug!(
                    "Command queue not drained: {} queued, {} awaiting retirement",
                    state.queued.len(),
                    state.awaiting.len()
                );
                return Err(DcError::Retry);
            }
        }
        Ok(())
    }
}
