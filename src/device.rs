//! Display devices: one per registered backend.

use crate::buffer::Buffer;
use crate::error::{DcError, Result};
use crate::hal::export::BufferExport;
use crate::hal::physmem::{PhysHeap, PhysResource};
use crate::hal::DisplayBackend;
use crate::refcount::RefCount;
use crate::registry::DeviceNode;
use crate::types::{Dimensions, DisplayInfo, NativeBuffer, NodeId, PanelInfo, PixelFormat};
use crate::ServerCore;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

#[derive(Default)]
struct SystemBufferCache {
    /// Backend handle seen on the last acquire
    handle: Option<NativeBuffer>,
    /// Export of that buffer; the device holds one reference on it
    export: Option<Arc<PhysResource>>,
}

/// A registered display-controller backend
pub struct Device {
    index: u32,
    node: NodeId,
    backend: Arc<dyn DisplayBackend>,
    max_in_flight: u32,
    heap: PhysHeap,
    refs: RefCount,
    system: Mutex<SystemBufferCache>,
    unregistered: AtomicBool,
    destroyed: Mutex<bool>,
    destroyed_cond: Condvar,
    core: Weak<ServerCore>,
}

impl Device {
    /// Register a backend on `node`. The returned device carries the
    /// registration reference, dropped by [`Device::unregister`].
    pub(crate) fn register(
        core: &Arc<ServerCore>,
        node: &DeviceNode,
        backend: Arc<dyn DisplayBackend>,
        max_in_flight: u32,
    ) -> Result<Arc<Self>> {
        if !node.is_ready() {
            log::debug!("Node {:?} not initialised yet; display registration deferred", node.id());
            return Err(DcError::Retry);
        }
        if max_in_flight == 0 {
            return Err(DcError::InvalidParameter("max configs in flight must be at least 1"));
        }

        let heap = node.display_heap()?;
        let index = core.registry().allocate_index();
        let info = backend.get_info();

        let device = Arc::new(Self {
            index,
            node: node.id(),
            backend,
            max_in_flight,
            heap,
            refs: RefCount::new(1),
            system: Mutex::new(SystemBufferCache::default()),
            unregistered: AtomicBool::new(false),
            destroyed: Mutex::new(false),
            destroyed_cond: Condvar::new(),
            core: Arc::downgrade(core),
        });
        core.registry().publish_device(&device);

        log::info!(
            "Registered display device {} \"{}\" on node {} (heap {}, {} configs in flight)",
            index,
            info.name,
            device.node.0,
            device.heap.name(),
            max_in_flight
        );
        Ok(device)
    }

    /// Drop the registration reference and wait for every other holder.
    ///
    /// When the server has failed, stragglers are logged and the device is
    /// left for them to release instead of waiting.
    pub(crate) fn unregister(&self, server_failed: bool) -> Result<()> {
        if self.unregistered.swap(true, Ordering::AcqRel) {
            return Err(DcError::InvalidParameter("display device already unregistered"));
        }
        log::info!("Unregistering display device {}", self.index);

        self.drop_system_buffer_cache();
        self.release_ref();

        if server_failed {
            if !self.is_destroyed() {
                log::error!(
                    "Display device {} still has {} users while the server is failed; leaking it",
                    self.index,
                    self.refs.get()
                );
            }
            return Ok(());
        }

        let mut destroyed = self.destroyed.lock();
        while !*destroyed {
            self.destroyed_cond.wait(&mut destroyed);
        }
        log::info!("Display device {} unregistered", self.index);
        Ok(())
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn max_in_flight(&self) -> u32 {
        self.max_in_flight
    }

    pub fn heap(&self) -> &PhysHeap {
        &self.heap
    }

    pub fn backend(&self) -> &dyn DisplayBackend {
        self.backend.as_ref()
    }

    pub fn ref_count(&self) -> u32 {
        self.refs.get()
    }

    pub fn is_destroyed(&self) -> bool {
        *self.destroyed.lock()
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
        log::info!("Display device {} has no remaining users", self.index);
        if let Some(core) = self.core.upgrade() {
            core.registry().remove_device(self.index);
        }

        *self.destroyed.lock() = true;
        self.destroyed_cond.notify_all();
    }

    pub fn get_info(&self) -> DisplayInfo {
        self.backend.get_info()
    }

    pub fn panel_query_count(&self) -> Result<u32> {
        self.backend.panel_query_count()
    }

    pub fn panel_query(&self, max: usize) -> Result<Vec<PanelInfo>> {
        if max == 0 {
            return Err(DcError::InvalidParameter("panel query for zero panels"));
        }
        self.backend.panel_query(max)
    }

    pub fn format_query(&self, formats: &[PixelFormat]) -> Result<Vec<bool>> {
        if formats.is_empty() {
            return Err(DcError::InvalidParameter("empty format list"));
        }
        self.backend.format_query(formats)
    }

    pub fn dim_query(&self, dims: &[Dimensions]) -> Result<Vec<bool>> {
        if dims.is_empty() {
            return Err(DcError::InvalidParameter("empty dimension list"));
        }
        self.backend.dim_query(dims)
    }

    pub fn set_blank(&self, blank: bool) -> Result<()> {
        self.backend.blank().ok_or(DcError::NotSupported)?.set_blank(blank)
    }

    pub fn set_vsync_reporting(&self, enabled: bool) -> Result<()> {
        self.backend
            .vsync()
            .ok_or(DcError::NotSupported)?
            .set_vsync_reporting(enabled)
    }

    pub fn last_vsync(&self) -> Result<i64> {
        self.backend.vsync().ok_or(DcError::NotSupported)?.last_vsync()
    }

    pub fn reset(&self, force: bool) -> Result<()> {
        log::warn!("Resetting display device {} (force: {})", self.index, force);
        self.backend.reset().ok_or(DcError::NotSupported)?.reset(force)
    }

    /// Export the backend's current system buffer.
    ///
    /// The backend may swap its system buffer on a mode change without
    /// telling anyone, so a changed handle is the only signal: the stale
    /// export is dropped and a new one built. The caller owns one reference
    /// on the returned resource.
    pub fn system_buffer_acquire(self: &Arc<Self>) -> Result<Arc<PhysResource>> {
        let system = self.backend.system_buffer().ok_or(DcError::NotSupported)?;
        let handle = system.get_system_buffer()?;

        if let Some(export) = self.cached_system_export(handle) {
            return Ok(export);
        }

        // Built without the cache locked; the backend may take its time.
        let geometry = system.system_buffer_acquire(handle)?;
        let buffer = match Buffer::new_system(self, handle, geometry) {
            Ok(buffer) => buffer,
            Err(e) => {
                system.system_buffer_release(handle);
                return Err(e);
            }
        };
        let export = BufferExport::create(&buffer, geometry);
        // The export now carries the buffer.
        buffer.release_ref();

        let mut cache = self.system.lock();
        if cache.handle == Some(handle) {
            if let Some(winner) = cache.export.clone() {
                // Another caller installed this handle first.
                winner.add_ref();
                drop(cache);
                export.unref();
                return Ok(winner);
            }
        }
        let stale = cache.export.replace(export.clone());
        cache.handle = Some(handle);
        drop(cache);

        if let Some(stale) = stale {
            log::info!("Display device {} system buffer changed; dropping stale export", self.index);
            stale.unref();
        }

        export.add_ref();
        Ok(export)
    }

    /// The cached export for `handle`, with a reference for the caller
    fn cached_system_export(&self, handle: NativeBuffer) -> Option<Arc<PhysResource>> {
        let cache = self.system.lock();
        if cache.handle != Some(handle) {
            return None;
        }
        let export = cache.export.clone()?;
        export.add_ref();
        Some(export)
    }

    /// Drop a reference returned by [`Device::system_buffer_acquire`].
    pub fn system_buffer_release(&self, export: &Arc<PhysResource>) {
        export.unref();
    }

    fn drop_system_buffer_cache(&self) {
        let mut cache = self.system.lock();
        let export = cache.export.take();
        cache.handle = None;
        drop(cache);

        if let Some(export) = export {
            export.unref();
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("index", &self.index)
            .field("node", &self.node)
            .field("max_in_flight", &self.max_in_flight)
            .field("refs", &self.refs.get())
            .finish()
    }
}
