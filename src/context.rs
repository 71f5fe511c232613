//! Display contexts and the configuration pipeline.
//!
//! A context owns one command processor. `configure` maps the buffers and
//! queues a command; the processor hands it to the backend once its acquire
//! fence is signalled and the device has an in-flight slot free; the backend
//! hands the [`CompletionToken`] back through
//! [`display_configuration_retired`] once the configuration leaves the
//! screen. Retirement must follow submission order.

use crate::buffer::{self, Buffer};
use crate::device::Device;
use crate::error::{DcError, Result};
use crate::fence::{Fence, Timeline};
use crate::hal::physmem::PhysResource;
use crate::refcount::RefCount;
use crate::runner::RunnerHandle;
use crate::scp::{Blocked, CommandProcessor, RunOutcome, ScpCommand};
use crate::types::{
    BufferCreateInfo, ContextId, DcConfig, NativeBuffer, NativeContext, SurfaceAttributes,
    SurfaceConfig,
};
use crate::ServerCore;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

/// One configuration request
#[derive(Debug, Clone, Default)]
pub struct ConfigureRequest<'a> {
    /// One entry per plane; must match `buffers` in length
    pub surfaces: &'a [SurfaceConfig],
    pub buffers: &'a [Arc<Buffer>],
    /// Held back until this fence is signalled
    pub acquire_fence: Option<Fence>,
    /// Timeline the release fence is created on
    pub release_timeline: Option<&'a Timeline>,
    pub display_period: u32,
    /// Most unretired configurations allowed; 0 is unbounded, 1 is invalid
    pub max_depth: u32,
}

/// A queued configuration
#[derive(Debug, Clone)]
pub struct Submission {
    /// Position in the context's retirement order
    pub token: u32,
    /// Signalled once the configuration retires
    pub release_fence: Option<Fence>,
}

struct ReadyData {
    surfaces: Vec<SurfaceConfig>,
    buffers: Vec<NativeBuffer>,
    display_period: u32,
}

struct CompleteData {
    context: Arc<DisplayContext>,
    /// Mapped for the lifetime of the configuration
    buffers: Vec<Arc<Buffer>>,
    token: u32,
    /// Issued by a flush outside the command queue
    direct_null_flip: bool,
}

/// Handed to the backend with every configuration and returned through
/// [`display_configuration_retired`].
pub struct CompletionToken {
    data: CompleteData,
}

impl CompletionToken {
    /// Retirement position, `None` for flushes issued outside the queue
    pub fn sequence(&self) -> Option<u32> {
        (!self.data.direct_null_flip).then_some(self.data.token)
    }

    pub fn context_id(&self) -> ContextId {
        self.data.context.id
    }

    /// Whether the configuration shows nothing
    pub fn is_null_flip(&self) -> bool {
        self.data.buffers.is_empty()
    }
}

impl fmt::Debug for CompletionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionToken")
            .field("context", &self.data.context.id)
            .field("sequence", &self.sequence())
            .field("buffers", &self.data.buffers.len())
            .finish()
    }
}

struct ConfigureCommand {
    ready: ReadyData,
    complete: CompleteData,
}

impl ScpCommand for ConfigureCommand {
    fn is_ready(&self) -> bool {
        self.complete.context.has_flight_slot()
    }

    fn execute(self: Box<Self>) {
        let ConfigureCommand { ready, complete } = *self;
        let context = complete.context.clone();
        context.dispatch(ready, complete);
    }
}

/// A client's display context on one device
pub struct DisplayContext {
    id: ContextId,
    device: Arc<Device>,
    native: NativeContext,
    scp: CommandProcessor,
    config: DcConfig,
    refs: RefCount,
    /// Token of the next configuration
    submitted: AtomicU32,
    /// Token of the next configuration expected to retire
    retired: AtomicU32,
    submit_lock: Mutex<()>,
    in_flight: Mutex<u32>,
    /// Serializes backend configure calls
    configure_lock: Mutex<()>,
    null_flip_issued: AtomicBool,
    paused: AtomicBool,
    destroyed: AtomicBool,
    runner: Mutex<Option<RunnerHandle>>,
    core: Weak<ServerCore>,
}

impl DisplayContext {
    pub(crate) fn create(core: &Arc<ServerCore>, device: &Arc<Device>) -> Result<Arc<Self>> {
        let config = core.config().clone();
        let scp = CommandProcessor::new(config.command_queue_depth)?;
        let native = device.backend().context_create()?;

        if !device.try_acquire_ref() {
            if let Err(e) = device.backend().context_destroy(native) {
                log::warn!("Failed to destroy native context {:?} during unwind: {}", native, e);
            }
            return Err(DcError::InvalidParameter("display device has been released"));
        }

        let ctx = Arc::new(Self {
            id: core.registry().next_context_id(),
            device: device.clone(),
            native,
            scp,
            config,
            refs: RefCount::new(1),
            submitted: AtomicU32::new(0),
            retired: AtomicU32::new(0),
            submit_lock: Mutex::new(()),
            in_flight: Mutex::new(0),
            configure_lock: Mutex::new(()),
            null_flip_issued: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            runner: Mutex::new(None),
            core: Arc::downgrade(core),
        });

        *ctx.runner.lock() = Some(core.runner().register(&ctx));
        core.registry().publish_context(&ctx);

        log::info!("Created display context {} on device {}", ctx.id.0, device.index());
        Ok(ctx)
    }

    /// Blank the screen, drain every queued configuration and drop the
    /// creation reference. Fails with [`DcError::Retry`] if the backend has
    /// not retired everything in time; the call may then be repeated.
    pub(crate) fn destroy(self: &Arc<Self>) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(DcError::InvalidParameter("display context already destroyed"));
        }

        if !self.null_flip_issued.load(Ordering::Acquire) {
            self.configure(&ConfigureRequest::default())?;
            self.null_flip_issued.store(true, Ordering::Release);
        }

        self.flush();
        self.scp.flush(self.config.drain_timeout())?;

        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Err(DcError::InvalidParameter("display context already destroyed"));
        }
        log::info!("Display context {} destroyed by client", self.id.0);
        self.release_ref();
        Ok(())
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn native(&self) -> NativeContext {
        self.native
    }

    pub fn ref_count(&self) -> u32 {
        self.refs.get()
    }

    /// Configurations submitted but not yet retired
    pub fn outstanding(&self) -> u32 {
        self.submitted
            .load(Ordering::Acquire)
            .wrapping_sub(self.retired.load(Ordering::Acquire))
    }

    /// Start numbering at `token`. Only valid with nothing outstanding.
    #[cfg(test)]
    pub(crate) fn seed_tokens(&self, token: u32) {
        assert_eq!(self.outstanding(), 0, "tokens reseeded with configurations outstanding");
        let _submitting = self.submit_lock.lock();
        self.submitted.store(token, Ordering::Release);
        self.retired.store(token, Ordering::Release);
    }

    /// Configurations currently owned by the backend
    pub fn in_flight(&self) -> u32 {
        *self.in_flight.lock()
    }

    /// Whether any command is queued or awaiting retirement
    pub fn has_pending(&self) -> bool {
        self.scp.has_pending()
    }

    /// Take a reference on behalf of a client call. Fails once the client
    /// has destroyed the context, even while buffers still hold it.
    pub(crate) fn enter(&self) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) || !self.refs.try_acquire() {
            return Err(DcError::InvalidParameter("display context already destroyed"));
        }
        log::debug!("Context {} ref count {}", self.id.0, self.refs.get());
        Ok(())
    }

    pub(crate) fn try_acquire_ref(&self) -> bool {
        self.refs.try_acquire()
    }

    pub(crate) fn release_ref(&self) {
        if self.refs.release() {
            self.teardown();
        }
    }

    fn teardown(&self) {
        log::info!("Tearing down display context {}", self.id.0);
        if let Some(core) = self.core.upgrade() {
            if let Some(handle) = self.runner.lock().take() {
                core.runner().unregister(handle);
            }
            core.registry().remove_context(self.id);
        }

        if let Err(e) = self.device.backend().context_destroy(self.native) {
            log::error!("Backend failed to destroy context {}: {}", self.id.0, e);
        }
        self.device.release_ref();
    }

    pub fn buffer_alloc(self: &Arc<Self>, info: &BufferCreateInfo) -> Result<(Arc<Buffer>, Arc<PhysResource>)> {
        Buffer::alloc(self, info)
    }

    pub fn buffer_import(
        self: &Arc<Self>,
        resources: &[Arc<PhysResource>],
        surface: &SurfaceAttributes,
    ) -> Result<Arc<Buffer>> {
        Buffer::import(self, resources, surface)
    }

    /// Ask the backend whether a configuration would be accepted.
    pub fn configure_check(&self, surfaces: &[SurfaceConfig], buffers: &[Arc<Buffer>]) -> Result<()> {
        let handles = self.native_handles(surfaces, buffers)?;

        self.enter()?;
        let result = match self.device.backend().configure_check() {
            Some(checker) => checker.check(self.native, surfaces, &handles),
            None => Ok(()),
        };
        self.release_ref();
        result
    }

    /// Queue a configuration.
    ///
    /// Returns [`DcError::Retry`] without side effects when `max_depth`
    /// configurations are already outstanding.
    pub fn configure(self: &Arc<Self>, request: &ConfigureRequest<'_>) -> Result<Submission> {
        if request.max_depth == 1 {
            return Err(DcError::InvalidMaxDepth);
        }
        if self.destroyed.load(Ordering::Acquire) {
            return Err(DcError::InvalidParameter("display context already destroyed"));
        }
        let handles = self.native_handles(request.surfaces, request.buffers)?;

        if request.max_depth != 0 && self.outstanding() >= request.max_depth {
            log::debug!(
                "Context {} has {} configurations outstanding (max {}), retry",
                self.id.0,
                self.outstanding(),
                request.max_depth
            );
            self.nudge_runner();
            return Err(DcError::Retry);
        }

        // Held by the command until it retires.
        self.enter()?;
        match self.submit(request, handles) {
            Ok(submission) => {
                self.run_queue();
                Ok(submission)
            }
            Err(e) => {
                self.release_ref();
                Err(e)
            }
        }
    }

    fn submit(self: &Arc<Self>, request: &ConfigureRequest<'_>, handles: Vec<NativeBuffer>) -> Result<Submission> {
        if let Some(checker) = self.device.backend().configure_check() {
            checker.check(self.native, request.surfaces, &handles)?;
        }

        buffer::map_all(request.buffers)?;
        let release_fence = request.release_timeline.map(Timeline::create_fence);

        let _submitting = self.submit_lock.lock();
        let token = self.submitted.load(Ordering::Acquire);
        // Concurrent submitters may have filled the depth since the caller
        // looked.
        let outstanding = token.wrapping_sub(self.retired.load(Ordering::Acquire));
        if request.max_depth != 0 && outstanding >= request.max_depth {
            buffer::unmap_all(request.buffers);
            self.nudge_runner();
            return Err(DcError::Retry);
        }
        let command = ConfigureCommand {
            ready: ReadyData {
                surfaces: request.surfaces.to_vec(),
                buffers: handles,
                display_period: request.display_period,
            },
            complete: CompleteData {
                context: self.clone(),
                buffers: request.buffers.to_vec(),
                token,
                direct_null_flip: false,
            },
        };

        if let Err(e) = self
            .scp
            .submit(Box::new(command), request.acquire_fence.clone(), release_fence.clone())
        {
            buffer::unmap_all(request.buffers);
            return Err(e);
        }
        self.submitted.store(token.wrapping_add(1), Ordering::Release);

        log::debug!(
            "Context {} queued configuration {} with {} planes",
            self.id.0,
            token,
            request.buffers.len()
        );
        Ok(Submission { token, release_fence })
    }

    fn native_handles(&self, surfaces: &[SurfaceConfig], buffers: &[Arc<Buffer>]) -> Result<Vec<NativeBuffer>> {
        if surfaces.len() != buffers.len() {
            return Err(DcError::InvalidParameter("surface and buffer counts differ"));
        }
        buffers
            .iter()
            .map(|buffer| {
                if Arc::ptr_eq(buffer.device(), &self.device) {
                    Ok(buffer.handle())
                } else {
                    Err(DcError::InvalidParameter("buffer belongs to another device"))
                }
            })
            .collect()
    }

    fn has_flight_slot(&self) -> bool {
        *self.in_flight.lock() < self.device.max_in_flight()
    }

    fn dispatch(&self, ready: ReadyData, complete: CompleteData) {
        *self.in_flight.lock() += 1;

        let _configuring = self.configure_lock.lock();
        self.device.backend().context_configure(
            self.native,
            &ready.surfaces,
            &ready.buffers,
            ready.display_period,
            CompletionToken { data: complete },
        );
    }

    /// Show nothing, bypassing the queue. Used by flush to push the last
    /// real configuration off the screen.
    fn direct_null_flip(self: &Arc<Self>) {
        log::debug!("Context {} issuing direct null flip", self.id.0);
        self.dispatch(
            ReadyData {
                surfaces: Vec::new(),
                buffers: Vec::new(),
                display_period: 0,
            },
            CompleteData {
                context: self.clone(),
                buffers: Vec::new(),
                token: 0,
                direct_null_flip: true,
            },
        );
    }

    fn retire(&self, buffers: Vec<Arc<Buffer>>, token: u32, direct_null_flip: bool) {
        if !direct_null_flip {
            let expected = self.retired.load(Ordering::Acquire);
            debug_assert_eq!(token, expected, "display configuration retired out of order");
            if token != expected {
                log::error!(
                    "Context {} retired configuration {} while expecting {}",
                    self.id.0,
                    token,
                    expected
                );
            }
        }

        {
            let mut in_flight = self.in_flight.lock();
            debug_assert!(*in_flight > 0, "retirement with nothing in flight");
            *in_flight = in_flight.saturating_sub(1);
        }

        buffer::unmap_all(&buffers);
        drop(buffers);

        if !direct_null_flip {
            self.retired.fetch_add(1, Ordering::AcqRel);
            self.scp.complete();
        }
        self.nudge_runner();
        if !direct_null_flip {
            self.release_ref();
        }
    }

    pub(crate) fn run_queue(&self) -> RunOutcome {
        self.scp.run()
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn nudge_runner(&self) {
        if let Some(core) = self.core.upgrade() {
            core.runner().nudge();
        }
    }

    /// Push every queued configuration to the backend, then replace
    /// whatever is on screen with an empty configuration.
    ///
    /// The background runner leaves this context alone while a flush runs.
    pub fn flush(self: &Arc<Self>) {
        self.paused.store(true, Ordering::Release);

        // Each configuration needs one run to reach the backend and one
        // more once its retirement frees the queue.
        let mut pending = self.outstanding().saturating_mul(2);
        log::debug!("Flushing context {} ({} runs expected)", self.id.0, pending);

        let mut runs = 0;
        while pending > 0 && self.scp.has_pending() && runs < self.config.flush_iterations {
            match self.run_queue() {
                RunOutcome::Blocked(Blocked::FenceDependency) if self.in_flight() == 1 => {
                    // The head waits on a producer while the one config on
                    // screen will not retire until something replaces it.
                    self.direct_null_flip();
                }
                outcome if outcome.is_good() => pending -= 1,
                _ => {}
            }

            runs += 1;
            thread::sleep(self.config.flush_interval());
        }

        if pending > 0 && self.scp.has_pending() {
            log::error!(
                "Context {} flush gave up after {} runs with {} configurations outstanding",
                self.id.0,
                runs,
                self.outstanding()
            );
        }

        self.direct_null_flip();
        self.paused.store(false, Ordering::Release);
    }
}

impl fmt::Debug for DisplayContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayContext")
            .field("id", &self.id)
            .field("device", &self.device.index())
            .field("refs", &self.refs.get())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// Return a configuration to the server once the backend is done with it.
///
/// Must be called in the order the configurations were handed over,
/// except for direct null flips.
pub fn display_configuration_retired(token: CompletionToken) {
    let CompleteData {
        context,
        buffers,
        token,
        direct_null_flip,
    } = token.data;
    context.retire(buffers, token, direct_null_flip);
}

/// Whether the token's context still has configurations the backend has
/// not retired.
pub fn display_has_pending_command(token: &CompletionToken) -> bool {
    token.data.context.has_pending()
}
