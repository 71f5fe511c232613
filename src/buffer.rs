/// Display buffers - "The Canvas"
///
/// Three kinds of buffer reach the screen: ones the backend allocated for a
/// context, ones wrapped around externally owned physical resources, and the
/// device's system framebuffer. All share one reference count; the last
/// release hands the buffer back to wherever it came from.
///
/// Allocated buffers start with two references: the client's, dropped by
/// [`Buffer::free`], and the one held by their exported physical resource.
/// A buffer stays mapped into the display MMU while any configuration that
/// uses it is queued or on screen.

use crate::context::DisplayContext;
use crate::device::Device;
use crate::error::{DcError, Result};
use crate::hal::export::BufferExport;
use crate::hal::physmem::PhysResource;
use crate::refcount::RefCount;
use crate::types::{BufferCreateInfo, BufferGeometry, NativeBuffer, SurfaceAttributes};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Most planes an imported buffer may span
pub const MAX_IMPORT_RESOURCES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Allocated by the backend for a context
    Allocated,
    /// Wrapped around externally owned physical resources
    Imported,
    /// The device's system framebuffer
    System,
}

enum Owner {
    Context(Arc<DisplayContext>),
    Device(Arc<Device>),
}

enum Payload {
    /// Export kept until teardown
    Exported(Option<Arc<PhysResource>>),
    /// One reference held on each
    Imported(Vec<Arc<PhysResource>>),
    TornDown,
}

pub struct Buffer {
    kind: BufferKind,
    handle: NativeBuffer,
    geometry: Option<BufferGeometry>,
    owner: Owner,
    refs: RefCount,
    /// Held across the backend map/unmap calls
    map_count: Mutex<u32>,
    payload: Mutex<Payload>,
    /// Set once the client's creation reference is gone
    released: AtomicBool,
}

impl Buffer {
    /// Allocate a backend buffer. The returned export shares the buffer's
    /// own reference; take another with [`Buffer::acquire_export`] to keep
    /// it past [`Buffer::free`].
    pub(crate) fn alloc(
        ctx: &Arc<DisplayContext>,
        info: &BufferCreateInfo,
    ) -> Result<(Arc<Self>, Arc<PhysResource>)> {
        if info.bytes_per_pixel == 0 || info.surface.dims.width == 0 || info.surface.dims.height == 0 {
            return Err(DcError::InvalidParameter("empty buffer description"));
        }

        ctx.enter()?;
        let allocated = match ctx.device().backend().buffer_alloc(ctx.native(), info) {
            Ok(allocated) => allocated,
            Err(e) => {
                ctx.release_ref();
                return Err(e);
            }
        };

        let buffer = Arc::new(Self {
            kind: BufferKind::Allocated,
            handle: allocated.handle,
            geometry: Some(allocated.geometry),
            owner: Owner::Context(ctx.clone()),
            refs: RefCount::new(1),
            map_count: Mutex::new(0),
            payload: Mutex::new(Payload::Exported(None)),
            released: AtomicBool::new(false),
        });

        let export = BufferExport::create(&buffer, allocated.geometry);
        *buffer.payload.lock() = Payload::Exported(Some(export.clone()));

        log::debug!(
            "Allocated buffer {:?} on context {} ({} pages)",
            buffer.handle,
            ctx.id().0,
            allocated.geometry.page_count
        );
        Ok((buffer, export))
    }

    pub(crate) fn import(
        ctx: &Arc<DisplayContext>,
        resources: &[Arc<PhysResource>],
        surface: &SurfaceAttributes,
    ) -> Result<Arc<Self>> {
        if resources.is_empty() || resources.len() > MAX_IMPORT_RESOURCES {
            return Err(DcError::InvalidParameter("import takes one to three physical resources"));
        }

        let importer = ctx.device().backend().importer().ok_or(DcError::NotSupported)?;
        ctx.enter()?;
        let handle = match importer.buffer_import(ctx.native(), resources, surface) {
            Ok(handle) => handle,
            Err(e) => {
                ctx.release_ref();
                return Err(e);
            }
        };

        for resource in resources {
            resource.add_ref();
            // The display now addresses these pages directly.
            resource.set_layout_fixed();
        }

        log::debug!(
            "Imported buffer {:?} on context {} from {} resources",
            handle,
            ctx.id().0,
            resources.len()
        );
        Ok(Arc::new(Self {
            kind: BufferKind::Imported,
            handle,
            geometry: None,
            owner: Owner::Context(ctx.clone()),
            refs: RefCount::new(1),
            map_count: Mutex::new(0),
            payload: Mutex::new(Payload::Imported(resources.to_vec())),
            released: AtomicBool::new(false),
        }))
    }

    /// Wrap the device's system buffer. The caller owns the single
    /// reference and is expected to hand it to an export.
    pub(crate) fn new_system(
        device: &Arc<Device>,
        handle: NativeBuffer,
        geometry: BufferGeometry,
    ) -> Result<Arc<Self>> {
        if !device.try_acquire_ref() {
            return Err(DcError::InvalidParameter("display device has been released"));
        }

        log::debug!("Wrapped system buffer {:?} of device {}", handle, device.index());
        Ok(Arc::new(Self {
            kind: BufferKind::System,
            handle,
            geometry: Some(geometry),
            owner: Owner::Device(device.clone()),
            refs: RefCount::new(1),
            map_count: Mutex::new(0),
            payload: Mutex::new(Payload::Exported(None)),
            released: AtomicBool::new(false),
        }))
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn handle(&self) -> NativeBuffer {
        self.handle
    }

    /// Page layout, for allocated and system buffers
    pub fn geometry(&self) -> Option<BufferGeometry> {
        self.geometry
    }

    pub fn device(&self) -> &Arc<Device> {
        match &self.owner {
            Owner::Context(ctx) => ctx.device(),
            Owner::Device(device) => device,
        }
    }

    pub fn ref_count(&self) -> u32 {
        self.refs.get()
    }

    pub fn map_count(&self) -> u32 {
        *self.map_count.lock()
    }

    pub(crate) fn acquire_ref(&self) {
        let count = self.refs.acquire();
        log::debug!("Buffer {:?} ref count {}", self.handle, count);
    }

    pub(crate) fn release_ref(&self) {
        if self.refs.release() {
            self.teardown();
        }
    }

    fn teardown(&self) {
        debug_assert_eq!(self.map_count(), 0, "buffer torn down while mapped");
        let payload = std::mem::replace(&mut *self.payload.lock(), Payload::TornDown);
        let backend = self.device().backend();

        match self.kind {
            BufferKind::Allocated | BufferKind::Imported => backend.buffer_free(self.handle),
            BufferKind::System => match backend.system_buffer() {
                Some(system) => system.system_buffer_release(self.handle),
                None => log::warn!("System buffer {:?} torn down without system buffer support", self.handle),
            },
        }

        if let Payload::Imported(resources) = payload {
            for resource in &resources {
                resource.unref();
            }
        }

        match &self.owner {
            Owner::Context(ctx) => ctx.release_ref(),
            Owner::Device(device) => device.release_ref(),
        }
        log::debug!("Buffer {:?} destroyed", self.handle);
    }

    /// Drop the client's reference on an allocated buffer, along with the
    /// allocation's reference on its export.
    pub fn free(&self) -> Result<()> {
        if self.kind != BufferKind::Allocated {
            return Err(DcError::InvalidParameter("only allocated buffers can be freed"));
        }
        if self.released.swap(true, Ordering::AcqRel) {
            return Err(DcError::InvalidParameter("buffer already freed"));
        }

        if let Some(export) = self.export() {
            export.unref();
        }
        self.release_ref();
        Ok(())
    }

    /// Drop the client's reference on an imported buffer.
    pub fn unimport(&self) -> Result<()> {
        if self.kind != BufferKind::Imported {
            return Err(DcError::InvalidParameter("only imported buffers can be unimported"));
        }
        if self.released.swap(true, Ordering::AcqRel) {
            return Err(DcError::InvalidParameter("buffer already unimported"));
        }

        self.release_ref();
        Ok(())
    }

    /// Keep the buffer mapped into the display until [`Buffer::unpin`].
    pub fn pin(&self) -> Result<()> {
        self.map()
    }

    pub fn unpin(&self) {
        self.unmap();
    }

    /// Take a reference on the buffer's exported physical resource.
    pub fn acquire_export(&self) -> Result<Arc<PhysResource>> {
        if self.kind != BufferKind::Allocated {
            return Err(DcError::InvalidParameter("only allocated buffers are exported"));
        }
        let export = self
            .export()
            .ok_or(DcError::InvalidParameter("buffer has been destroyed"))?;
        export.add_ref();
        Ok(export)
    }

    pub fn release_export(&self, export: &Arc<PhysResource>) {
        export.unref();
    }

    fn export(&self) -> Option<Arc<PhysResource>> {
        match &*self.payload.lock() {
            Payload::Exported(export) => export.clone(),
            _ => None,
        }
    }

    /// First map takes a reference and calls the backend; later ones only count.
    pub(crate) fn map(&self) -> Result<()> {
        let mut count = self.map_count.lock();
        if *count == 0 {
            if let Some(mapper) = self.device().backend().mapper() {
                mapper.buffer_map(self.handle)?;
            }
            self.acquire_ref();
        }
        *count += 1;
        Ok(())
    }

    pub(crate) fn unmap(&self) {
        let mut count = self.map_count.lock();
        if *count == 0 {
            debug_assert!(false, "buffer unmapped more often than mapped");
            log::error!("Unbalanced unmap of buffer {:?} ignored", self.handle);
            return;
        }

        *count -= 1;
        let last = *count == 0;
        if last {
            if let Some(mapper) = self.device().backend().mapper() {
                mapper.buffer_unmap(self.handle);
            }
        }
        drop(count);

        if last {
            self.release_ref();
        }
    }
}

/// Map every buffer, unwinding the ones already mapped on failure.
pub(crate) fn map_all(buffers: &[Arc<Buffer>]) -> Result<()> {
    for (mapped, buffer) in buffers.iter().enumerate() {
        if let Err(e) = buffer.map() {
            log::warn!("Failed to map buffer {:?}: {}", buffer.handle(), e);
            unmap_all(&buffers[..mapped]);
            return Err(e);
        }
    }
    Ok(())
}

pub(crate) fn unmap_all(buffers: &[Arc<Buffer>]) {
    for buffer in buffers {
        buffer.unmap();
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("kind", &self.kind)
            .field("handle", &self.handle)
            .field("refs", &self.refs.get())
            .field("map_count", &self.map_count())
            .finish()
    }
}
