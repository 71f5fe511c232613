/// Hardware Abstraction Layer - "The Spine"
///
/// The contract a display-controller backend implements, and the helpers
/// the server offers back to backends.
///
/// Mandatory entry points live on [`DisplayBackend`]. Optional ones are
/// capability traits; a backend advertises one by returning `Some(self)`
/// from the matching accessor.

pub mod export;
pub mod physmem;

use crate::context::CompletionToken;
use crate::error::{DcError, Result};
use crate::types::{
    BufferCreateInfo, BufferGeometry, Dimensions, DisplayInfo, NativeBuffer, NativeContext,
    PanelInfo, PixelFormat, SurfaceAttributes, SurfaceConfig,
};
use physmem::{DevPhysAddr, PhysResource};
use std::sync::Arc;

/// A CPU-visible view of a whole buffer
pub trait CpuMapping: Send + Sync {
    fn bytes(&self) -> &[u8];
}

/// Pages of a buffer locked for physical access
pub struct BufferPages {
    /// One device physical address per page
    pub addrs: Vec<DevPhysAddr>,
    /// Kernel-visible mapping, if the backend keeps one
    pub cpu_mapping: Option<Arc<dyn CpuMapping>>,
}

/// A freshly allocated backend buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatedBuffer {
    pub handle: NativeBuffer,
    pub geometry: BufferGeometry,
}

/// A display-controller backend
pub trait DisplayBackend: Send + Sync {
    fn get_info(&self) -> DisplayInfo;

    fn panel_query_count(&self) -> Result<u32>;

    fn panel_query(&self, max: usize) -> Result<Vec<PanelInfo>>;

    /// One entry per requested format, `true` if supported
    fn format_query(&self, formats: &[PixelFormat]) -> Result<Vec<bool>>;

    /// One entry per requested size, `true` if supported
    fn dim_query(&self, dims: &[Dimensions]) -> Result<Vec<bool>>;

    fn context_create(&self) -> Result<NativeContext>;

    fn context_destroy(&self, context: NativeContext) -> Result<()>;

    /// Apply a configuration asynchronously.
    ///
    /// The backend must eventually pass `token` to
    /// [`crate::display_configuration_retired`], normally once a later
    /// configuration has replaced this one on screen. Calls for one context
    /// are never concurrent.
    fn context_configure(
        &self,
        context: NativeContext,
        surfaces: &[SurfaceConfig],
        buffers: &[NativeBuffer],
        display_period: u32,
        token: CompletionToken,
    );

    fn buffer_alloc(&self, context: NativeContext, info: &BufferCreateInfo) -> Result<AllocatedBuffer>;

    /// Lock the buffer's pages and report their addresses.
    fn buffer_acquire(&self, buffer: NativeBuffer) -> Result<BufferPages>;

    fn buffer_release(&self, buffer: NativeBuffer);

    fn buffer_free(&self, buffer: NativeBuffer);

    fn configure_check(&self) -> Option<&dyn ConfigureCheck> {
        None
    }

    fn blank(&self) -> Option<&dyn SupportsBlank> {
        None
    }

    fn vsync(&self) -> Option<&dyn SupportsVsync> {
        None
    }

    fn importer(&self) -> Option<&dyn SupportsImport> {
        None
    }

    /// Only for backends with an MMU that do not map at allocation time
    fn mapper(&self) -> Option<&dyn SupportsMapping> {
        None
    }

    fn system_buffer(&self) -> Option<&dyn SupportsSystemBuffer> {
        None
    }

    fn reset(&self) -> Option<&dyn SupportsReset> {
        None
    }
}

/// Validates a configuration before it is queued
pub trait ConfigureCheck: Send + Sync {
    fn check(
        &self,
        context: NativeContext,
        surfaces: &[SurfaceConfig],
        buffers: &[NativeBuffer],
    ) -> Result<()>;
}

pub trait SupportsBlank: Send + Sync {
    fn set_blank(&self, blank: bool) -> Result<()>;
}

pub trait SupportsVsync: Send + Sync {
    fn set_vsync_reporting(&self, enabled: bool) -> Result<()>;

    /// Timestamp of the last vsync, in nanoseconds
    fn last_vsync(&self) -> Result<i64>;
}

pub trait SupportsImport: Send + Sync {
    /// Wrap externally owned physical resources as a scan-out buffer.
    ///
    /// The backend may pass each resource to [`import_buffer_acquire`] to
    /// obtain page addresses.
    fn buffer_import(
        &self,
        context: NativeContext,
        resources: &[Arc<PhysResource>],
        surface: &SurfaceAttributes,
    ) -> Result<NativeBuffer>;
}

pub trait SupportsMapping: Send + Sync {
    fn buffer_map(&self, buffer: NativeBuffer) -> Result<()>;

    fn buffer_unmap(&self, buffer: NativeBuffer);
}

/// The device's boot/default framebuffer
pub trait SupportsSystemBuffer: Send + Sync {
    /// Handle of the current system buffer. May change on a mode switch.
    fn get_system_buffer(&self) -> Result<NativeBuffer>;

    fn system_buffer_acquire(&self, buffer: NativeBuffer) -> Result<BufferGeometry>;

    fn system_buffer_release(&self, buffer: NativeBuffer);
}

pub trait SupportsReset: Send + Sync {
    fn reset(&self, force: bool) -> Result<()>;
}

/// Lock an imported resource and return the device physical address of
/// each of its `2^log2_page_size` pages.
pub fn import_buffer_acquire(resource: &PhysResource, log2_page_size: u32) -> Result<Vec<DevPhysAddr>> {
    if log2_page_size >= u64::BITS {
        return Err(DcError::InvalidParameter("page size does not fit in 64 bits"));
    }
    let page_size = 1u64 << log2_page_size;
    let page_count = resource.size().div_ceil(page_size);
    let offsets: Vec<u64> = (0..page_count).map(|page| page << log2_page_size).collect();

    resource.lock_phys_addresses()?;
    match resource.dev_phys_addrs(log2_page_size, &offsets) {
        Ok(addrs) => Ok(addrs),
        Err(e) => {
            if let Err(unlock_err) = resource.unlock_phys_addresses() {
                log::warn!("Failed to unlock resource {} after error: {}", resource.id(), unlock_err);
            }
            Err(e)
        }
    }
}

/// Undo [`import_buffer_acquire`].
pub fn import_buffer_release(resource: &PhysResource) -> Result<()> {
    resource.unlock_phys_addresses()
}
