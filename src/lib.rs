/// RayOS Display-Class Server
///
/// Sits between the GPU memory manager and pluggable display-controller
/// backends: registers backends as devices, tracks devices, contexts and
/// buffers by reference count, and feeds display configurations through a
/// fence-gated command queue whose completions retire in submission order.

pub mod buffer;
pub mod context;
pub mod device;
pub mod error;
pub mod fence;
pub mod hal;
mod refcount;
pub mod registry;
mod runner;
pub mod scp;
pub mod types;

pub use buffer::{Buffer, BufferKind, MAX_IMPORT_RESOURCES};
pub use context::{
    display_configuration_retired, display_has_pending_command, CompletionToken,
    ConfigureRequest, DisplayContext, Submission,
};
pub use device::Device;
pub use error::{DcError, Result};
pub use fence::{Fence, Timeline};
pub use hal::{import_buffer_acquire, import_buffer_release, DisplayBackend};
pub use registry::DeviceNode;
pub use types::DcConfig;

use hal::physmem::PhysResource;
use registry::DeviceRegistry;
use runner::QueueRunner;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use types::{
    BufferCreateInfo, Dimensions, DisplayInfo, NodeId, PanelInfo, PixelFormat, SurfaceAttributes,
    SurfaceConfig,
};

/// State shared by the server, its entities and the queue runner
pub(crate) struct ServerCore {
    config: DcConfig,
    registry: DeviceRegistry,
    runner: QueueRunner,
    failed: AtomicBool,
}

impl ServerCore {
    pub(crate) fn config(&self) -> &DcConfig {
        &self.config
    }

    pub(crate) fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub(crate) fn runner(&self) -> &QueueRunner {
        &self.runner
    }
}

/// The Display-Class Server - "The Compositor's Gatekeeper"
pub struct DcServer {
    core: Arc<ServerCore>,
}

impl DcServer {
    pub fn new(config: DcConfig) -> Result<Self> {
        log::info!("=== Initializing Display-Class Server ===");
        if let Err(e) = config.validate() {
            log::error!("Rejected display-class configuration: {}", e);
            return Err(DcError::InvalidParameter("invalid display-class configuration"));
        }

        let runner = QueueRunner::start(config.runner_period())?;
        log::info!("✓ Queue runner started");

        let core = Arc::new(ServerCore {
            config,
            registry: DeviceRegistry::new(),
            runner,
            failed: AtomicBool::new(false),
        });

        log::info!("=== Display-Class Server Ready ===");
        Ok(Self { core })
    }

    pub fn config(&self) -> &DcConfig {
        &self.core.config
    }

    /// Put the server into the failed state. Unregistration stops waiting
    /// for outstanding users and leaks the device instead.
    pub fn mark_failed(&self) {
        log::error!("Display-class server marked as failed");
        self.core.failed.store(true, Ordering::Release);
    }

    pub fn is_failed(&self) -> bool {
        self.core.failed.load(Ordering::Acquire)
    }

    // Backend-facing registration surface

    /// Register a display-controller backend. Fails with
    /// [`DcError::Retry`] until `node` is ready.
    pub fn register_device(
        &self,
        node: &DeviceNode,
        backend: Arc<dyn DisplayBackend>,
        max_in_flight: u32,
    ) -> Result<Arc<Device>> {
        Device::register(&self.core, node, backend, max_in_flight)
    }

    /// Drop the registration and block until the last user is gone.
    pub fn unregister_device(&self, device: &Arc<Device>) -> Result<()> {
        device.unregister(self.is_failed())
    }

    /// A backend finished something; re-run the command queues.
    pub fn notify_command_complete(&self) {
        self.core.runner.nudge();
    }

    // Client-facing surface

    pub fn device_count(&self, node: NodeId) -> usize {
        self.core.registry.device_count(node)
    }

    pub fn enumerate_devices(&self, node: NodeId) -> Vec<u32> {
        self.core.registry.enumerate(node)
    }

    pub fn device_acquire(&self, node: NodeId, index: u32) -> Result<Arc<Device>> {
        self.core.registry.acquire(index, node)
    }

    pub fn device_release(&self, device: &Arc<Device>) {
        device.release_ref();
    }

    pub fn device_info(&self, device: &Device) -> DisplayInfo {
        device.get_info()
    }

    pub fn panel_query_count(&self, device: &Device) -> Result<u32> {
        device.panel_query_count()
    }

    pub fn panel_query(&self, device: &Device, max: usize) -> Result<Vec<PanelInfo>> {
        device.panel_query(max)
    }

    pub fn format_query(&self, device: &Device, formats: &[PixelFormat]) -> Result<Vec<bool>> {
        device.format_query(formats)
    }

    pub fn dim_query(&self, device: &Device, dims: &[Dimensions]) -> Result<Vec<bool>> {
        device.dim_query(dims)
    }

    pub fn set_blank(&self, device: &Device, blank: bool) -> Result<()> {
        device.set_blank(blank)
    }

    pub fn set_vsync_reporting(&self, device: &Device, enabled: bool) -> Result<()> {
        device.set_vsync_reporting(enabled)
    }

    pub fn last_vsync(&self, device: &Device) -> Result<i64> {
        device.last_vsync()
    }

    pub fn system_buffer_acquire(&self, device: &Arc<Device>) -> Result<Arc<PhysResource>> {
        device.system_buffer_acquire()
    }

    pub fn system_buffer_release(&self, device: &Device, export: &Arc<PhysResource>) {
        device.system_buffer_release(export);
    }

    pub fn context_create(&self, device: &Arc<Device>) -> Result<Arc<DisplayContext>> {
        DisplayContext::create(&self.core, device)
    }

    pub fn context_destroy(&self, ctx: &Arc<DisplayContext>) -> Result<()> {
        ctx.destroy()
    }

    pub fn configure_check(
        &self,
        ctx: &DisplayContext,
        surfaces: &[SurfaceConfig],
        buffers: &[Arc<Buffer>],
    ) -> Result<()> {
        ctx.configure_check(surfaces, buffers)
    }

    pub fn configure(&self, ctx: &Arc<DisplayContext>, request: &ConfigureRequest<'_>) -> Result<Submission> {
        ctx.configure(request)
    }

    pub fn buffer_alloc(
        &self,
        ctx: &Arc<DisplayContext>,
        info: &BufferCreateInfo,
    ) -> Result<(Arc<Buffer>, Arc<PhysResource>)> {
        ctx.buffer_alloc(info)
    }

    pub fn buffer_import(
        &self,
        ctx: &Arc<DisplayContext>,
        resources: &[Arc<PhysResource>],
        surface: &SurfaceAttributes,
    ) -> Result<Arc<Buffer>> {
        ctx.buffer_import(resources, surface)
    }

    pub fn buffer_free(&self, buffer: &Buffer) -> Result<()> {
        buffer.free()
    }

    pub fn buffer_unimport(&self, buffer: &Buffer) -> Result<()> {
        buffer.unimport()
    }

    pub fn buffer_pin(&self, buffer: &Buffer) -> Result<()> {
        buffer.pin()
    }

    pub fn buffer_unpin(&self, buffer: &Buffer) {
        buffer.unpin();
    }

    pub fn buffer_acquire_export(&self, buffer: &Buffer) -> Result<Arc<PhysResource>> {
        buffer.acquire_export()
    }

    pub fn buffer_release_export(&self, buffer: &Buffer, export: &Arc<PhysResource>) {
        buffer.release_export(export);
    }

    /// Flush every display context. Fails with [`DcError::InvalidContext`]
    /// when there are none.
    pub fn flush_all(&self) -> Result<()> {
        let contexts = self.core.registry.acquire_contexts();
        if contexts.is_empty() {
            return Err(DcError::InvalidContext);
        }

        log::info!("Flushing {} display contexts", contexts.len());
        for ctx in &contexts {
            ctx.flush();
        }
        for ctx in contexts {
            ctx.release_ref();
        }
        Ok(())
    }
}

impl Drop for DcServer {
    fn drop(&mut self) {
        log::info!("Shutting down Display-Class Server...");
        self.core.runner.stop();
    }
}

/// Builder for DcServer with custom configuration
pub struct DcServerBuilder {
    config: DcConfig,
}

impl DcServerBuilder {
    pub fn new() -> Self {
        Self {
            config: DcConfig::default(),
        }
    }

    pub fn with_config(mut self, config: DcConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_command_queue_depth(mut self, depth: usize) -> Self {
        self.config.command_queue_depth = depth;
        self
    }

    pub fn with_flush_iterations(mut self, iterations: u32) -> Self {
        self.config.flush_iterations = iterations;
        self
    }

    pub fn with_flush_interval_ms(mut self, ms: u64) -> Self {
        self.config.flush_interval_ms = ms;
        self
    }

    pub fn with_drain_timeout_ms(mut self, ms: u64) -> Self {
        self.config.drain_timeout_ms = ms;
        self
    }

    pub fn with_runner_period_ms(mut self, ms: u64) -> Self {
        self.config.runner_period_ms = ms;
        self
    }

    pub fn build(self) -> Result<DcServer> {
        DcServer::new(self.config)
    }
}

impl Default for DcServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
