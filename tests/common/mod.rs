//! Shared fixtures for the integration tests: a scriptable display backend,
//! device nodes with a recognisable page mapper, and a test-only physical
//! resource.

#![allow(dead_code)]

use parking_lot::Mutex;
use rayos_dc::error::{DcError, Result};
use rayos_dc::hal::physmem::{DevPhysAddr, HeapKind, PageMapper, PhysHeap, PhysResource, PhysicalMemory};
use rayos_dc::hal::{
    AllocatedBuffer, BufferPages, ConfigureCheck, CpuMapping, DisplayBackend, SupportsBlank, SupportsImport,
    SupportsMapping, SupportsSystemBuffer, SupportsVsync,
};
use rayos_dc::types::{
    BufferCreateInfo, BufferGeometry, Dimensions, DisplayInfo, NativeBuffer, NativeContext, NodeId, PanelInfo,
    PixelFormat, SurfaceAttributes, SurfaceConfig,
};
use rayos_dc::{display_configuration_retired, display_has_pending_command, CompletionToken, DcServer, DcServerBuilder, Device, DeviceNode};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const DEVICE_BASE: u64 = 0x1000_0000;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Poll `check` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    check()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireMode {
    /// Tokens are held until the test retires them
    Manual,
    /// A new configuration retires every held one, like a real flip
    OnNextFlip,
}

#[derive(Debug, Clone, Copy)]
pub struct MockOptions {
    pub import: bool,
    pub mapping: bool,
    pub system_buffer: bool,
    pub blank: bool,
    pub vsync: bool,
    /// Keep a CPU mapping of each acquired buffer
    pub cpu_mapping: bool,
    /// Install a configure check that refuses everything
    pub reject_configs: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            import: true,
            mapping: true,
            system_buffer: true,
            blank: true,
            vsync: true,
            cpu_mapping: false,
            reject_configs: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedConfig {
    pub context: NativeContext,
    pub buffers: Vec<NativeBuffer>,
    pub display_period: u32,
    /// `None` for direct null flips
    pub sequence: Option<u32>,
}

impl RecordedConfig {
    pub fn is_null_flip(&self) -> bool {
        self.buffers.is_empty()
    }
}

#[derive(Default)]
pub struct MockState {
    pub configs: Vec<RecordedConfig>,
    held: Vec<(NativeContext, CompletionToken)>,
    pub contexts_created: Vec<NativeContext>,
    pub contexts_destroyed: Vec<NativeContext>,
    pub frees: Vec<NativeBuffer>,
    pub maps: Vec<NativeBuffer>,
    pub unmaps: Vec<NativeBuffer>,
    pub page_acquires: u32,
    pub page_releases: u32,
    pub imports: u32,
    pub system_handle: u64,
    pub system_acquires: Vec<NativeBuffer>,
    pub system_releases: Vec<NativeBuffer>,
    pub blank: Option<bool>,
    pub vsync_reporting: Option<bool>,
}

pub struct MockBackend {
    options: MockOptions,
    mode: Mutex<RetireMode>,
    state: Mutex<MockState>,
    next_handle: AtomicU64,
}

impl MockBackend {
    pub fn new(mode: RetireMode) -> Arc<Self> {
        Self::with_options(mode, MockOptions::default())
    }

    pub fn with_options(mode: RetireMode, options: MockOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            mode: Mutex::new(mode),
            state: Mutex::new(MockState {
                system_handle: 0xFB00,
                ..MockState::default()
            }),
            next_handle: AtomicU64::new(1),
        })
    }

    pub fn set_mode(&self, mode: RetireMode) {
        *self.mode.lock() = mode;
    }

    pub fn state(&self) -> parking_lot::MutexGuard<'_, MockState> {
        self.state.lock()
    }

    pub fn configs(&self) -> Vec<RecordedConfig> {
        self.state.lock().configs.clone()
    }

    pub fn config_count(&self) -> usize {
        self.state.lock().configs.len()
    }

    pub fn held_count(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Sequence numbers of the tokens the backend still holds
    pub fn held_sequences(&self) -> Vec<Option<u32>> {
        self.state.lock().held.iter().map(|(_, token)| token.sequence()).collect()
    }

    pub fn first_held_has_pending(&self) -> Option<bool> {
        self.state
            .lock()
            .held
            .first()
            .map(|(_, token)| display_has_pending_command(token))
    }

    /// Retire the oldest held configuration.
    pub fn retire_next(&self) -> bool {
        self.retire_at(0)
    }

    /// Retire the held configuration at `index`, in or out of order.
    pub fn retire_at(&self, index: usize) -> bool {
        let token = {
            let mut state = self.state.lock();
            if index >= state.held.len() {
                return false;
            }
            state.held.remove(index).1
        };
        display_configuration_retired(token);
        true
    }

    pub fn retire_all(&self) {
        while self.retire_next() {}
    }

    pub fn system_handle(&self) -> NativeBuffer {
        NativeBuffer(self.state.lock().system_handle)
    }

    /// Swap the system buffer, as a mode change would.
    pub fn change_system_buffer(&self) -> NativeBuffer {
        let mut state = self.state.lock();
        state.system_handle += 1;
        NativeBuffer(state.system_handle)
    }

    fn handle(&self) -> NativeBuffer {
        NativeBuffer(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }
}

impl DisplayBackend for MockBackend {
    fn get_info(&self) -> DisplayInfo {
        DisplayInfo {
            name: "mock-dc".into(),
            min_display_period: 0,
            max_display_period: 4,
            max_pipes: 2,
            unlatched_support: false,
        }
    }

    fn panel_query_count(&self) -> Result<u32> {
        Ok(1)
    }

    fn panel_query(&self, _max: usize) -> Result<Vec<PanelInfo>> {
        Ok(vec![PanelInfo {
            surface: SurfaceAttributes {
                format: PixelFormat::Xrgb8888,
                dims: Dimensions {
                    width: 1920,
                    height: 1080,
                },
            },
            refresh_rate_hz: 60,
            x_dpi: 96,
            y_dpi: 96,
        }])
    }

    fn format_query(&self, formats: &[PixelFormat]) -> Result<Vec<bool>> {
        Ok(formats
            .iter()
            .map(|format| matches!(format, PixelFormat::Argb8888 | PixelFormat::Xrgb8888))
            .collect())
    }

    fn dim_query(&self, dims: &[Dimensions]) -> Result<Vec<bool>> {
        Ok(dims.iter().map(|d| d.width <= 1920 && d.height <= 1080).collect())
    }

    fn context_create(&self) -> Result<NativeContext> {
        let context = NativeContext(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.state.lock().contexts_created.push(context);
        Ok(context)
    }

    fn context_destroy(&self, context: NativeContext) -> Result<()> {
        let dropped: Vec<CompletionToken> = {
            let mut state = self.state.lock();
            state.contexts_destroyed.push(context);
            let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.held)
                .into_iter()
                .partition(|(owner, _)| *owner == context);
            state.held = kept;
            gone.into_iter().map(|(_, token)| token).collect()
        };
        drop(dropped);
        Ok(())
    }

    fn context_configure(
        &self,
        context: NativeContext,
        _surfaces: &[SurfaceConfig],
        buffers: &[NativeBuffer],
        display_period: u32,
        token: CompletionToken,
    ) {
        let mode = *self.mode.lock();
        let replaced = {
            let mut state = self.state.lock();
            state.configs.push(RecordedConfig {
                context,
                buffers: buffers.to_vec(),
                display_period,
                sequence: token.sequence(),
            });

            let replaced = match mode {
                RetireMode::Manual => Vec::new(),
                RetireMode::OnNextFlip => {
                    let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.held)
                        .into_iter()
                        .partition(|(owner, _)| *owner == context);
                    state.held = kept;
                    gone
                }
            };
            state.held.push((context, token));
            replaced
        };

        for (_, token) in replaced {
            display_configuration_retired(token);
        }
    }

    fn buffer_alloc(&self, _context: NativeContext, info: &BufferCreateInfo) -> Result<AllocatedBuffer> {
        let dims = info.surface.dims;
        let stride = dims.width * info.bytes_per_pixel;
        let bytes = stride as u64 * dims.height as u64;
        Ok(AllocatedBuffer {
            handle: self.handle(),
            geometry: BufferGeometry {
                log2_page_size: PAGE_SHIFT,
                page_count: bytes.div_ceil(PAGE_SIZE) as u32,
                byte_stride: stride,
            },
        })
    }

    fn buffer_acquire(&self, buffer: NativeBuffer) -> Result<BufferPages> {
        self.state.lock().page_acquires += 1;
        let addrs = (0..64)
            .map(|page| DevPhysAddr(DEVICE_BASE + buffer.0 * 0x10_0000 + page * PAGE_SIZE))
            .collect();
        let cpu_mapping: Option<Arc<dyn CpuMapping>> = if self.options.cpu_mapping {
            Some(Arc::new(ByteMapping((0..=255u8).cycle().take(64 * PAGE_SIZE as usize).collect())))
        } else {
            None
        };
        Ok(BufferPages { addrs, cpu_mapping })
    }

    fn buffer_release(&self, _buffer: NativeBuffer) {
        self.state.lock().page_releases += 1;
    }

    fn buffer_free(&self, buffer: NativeBuffer) {
        self.state.lock().frees.push(buffer);
    }

    fn configure_check(&self) -> Option<&dyn ConfigureCheck> {
        if self.options.reject_configs {
            Some(self)
        } else {
            None
        }
    }

    fn blank(&self) -> Option<&dyn SupportsBlank> {
        if self.options.blank {
            Some(self)
        } else {
            None
        }
    }

    fn vsync(&self) -> Option<&dyn SupportsVsync> {
        if self.options.vsync {
            Some(self)
        } else {
            None
        }
    }

    fn importer(&self) -> Option<&dyn SupportsImport> {
        if self.options.import {
            Some(self)
        } else {
            None
        }
    }

    fn mapper(&self) -> Option<&dyn SupportsMapping> {
        if self.options.mapping {
            Some(self)
        } else {
            None
        }
    }

    fn system_buffer(&self) -> Option<&dyn SupportsSystemBuffer> {
        if self.options.system_buffer {
            Some(self)
        } else {
            None
        }
    }
}

impl ConfigureCheck for MockBackend {
    fn check(&self, _context: NativeContext, _surfaces: &[SurfaceConfig], _buffers: &[NativeBuffer]) -> Result<()> {
        Err(DcError::Backend("configuration rejected".into()))
    }
}

impl SupportsBlank for MockBackend {
    fn set_blank(&self, blank: bool) -> Result<()> {
        self.state.lock().blank = Some(blank);
        Ok(())
    }
}

impl SupportsVsync for MockBackend {
    fn set_vsync_reporting(&self, enabled: bool) -> Result<()> {
        self.state.lock().vsync_reporting = Some(enabled);
        Ok(())
    }

    fn last_vsync(&self) -> Result<i64> {
        Ok(16_666_667)
    }
}

impl SupportsImport for MockBackend {
    fn buffer_import(
        &self,
        _context: NativeContext,
        resources: &[Arc<PhysResource>],
        _surface: &SurfaceAttributes,
    ) -> Result<NativeBuffer> {
        for resource in resources {
            rayos_dc::import_buffer_acquire(resource, PAGE_SHIFT)?;
            rayos_dc::import_buffer_release(resource)?;
        }
        self.state.lock().imports += 1;
        Ok(self.handle())
    }
}

impl SupportsMapping for MockBackend {
    fn buffer_map(&self, buffer: NativeBuffer) -> Result<()> {
        self.state.lock().maps.push(buffer);
        Ok(())
    }

    fn buffer_unmap(&self, buffer: NativeBuffer) {
        self.state.lock().unmaps.push(buffer);
    }
}

impl SupportsSystemBuffer for MockBackend {
    fn get_system_buffer(&self) -> Result<NativeBuffer> {
        Ok(NativeBuffer(self.state.lock().system_handle))
    }

    fn system_buffer_acquire(&self, buffer: NativeBuffer) -> Result<BufferGeometry> {
        self.state.lock().system_acquires.push(buffer);
        Ok(BufferGeometry {
            log2_page_size: PAGE_SHIFT,
            page_count: 16,
            byte_stride: 4096,
        })
    }

    fn system_buffer_release(&self, buffer: NativeBuffer) {
        self.state.lock().system_releases.push(buffer);
    }
}

struct ByteMapping(Vec<u8>);

impl CpuMapping for ByteMapping {
    fn bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Fills every byte with the low bits of the page number
pub struct PageNumberMapper;

impl PageMapper for PageNumberMapper {
    fn read_page(&self, page: DevPhysAddr, _offset: usize, out: &mut [u8]) -> Result<()> {
        out.fill((page.0 >> PAGE_SHIFT) as u8);
        Ok(())
    }
}

pub fn heap(kind: HeapKind) -> PhysHeap {
    let name = match kind {
        HeapKind::Display => "display",
        HeapKind::GpuLocal => "gpu-local",
        HeapKind::CpuLocal => "cpu-local",
    };
    PhysHeap::new(kind, name, Arc::new(PageNumberMapper))
}

pub fn ready_node(id: u32) -> Arc<DeviceNode> {
    let node = DeviceNode::new(NodeId(id), vec![heap(HeapKind::GpuLocal), heap(HeapKind::Display)]);
    node.mark_ready();
    node
}

/// Server tuned so that timeouts in tests stay short
pub fn server() -> DcServer {
    init_logging();
    DcServerBuilder::new()
        .with_flush_iterations(20)
        .with_drain_timeout_ms(200)
        .with_runner_period_ms(5)
        .build()
        .expect("server starts")
}

pub struct Fixture {
    pub server: DcServer,
    pub node: Arc<DeviceNode>,
    pub backend: Arc<MockBackend>,
    pub device: Arc<Device>,
}

pub fn fixture(mode: RetireMode, max_in_flight: u32) -> Fixture {
    fixture_with(mode, MockOptions::default(), max_in_flight)
}

pub fn fixture_with(mode: RetireMode, options: MockOptions, max_in_flight: u32) -> Fixture {
    let server = server();
    let node = ready_node(0);
    let backend = MockBackend::with_options(mode, options);
    let device = server
        .register_device(&node, backend.clone(), max_in_flight)
        .expect("device registers");
    Fixture {
        server,
        node,
        backend,
        device,
    }
}

pub fn create_info(width: u32, height: u32) -> BufferCreateInfo {
    BufferCreateInfo {
        surface: SurfaceAttributes {
            format: PixelFormat::Argb8888,
            dims: Dimensions { width, height },
        },
        bytes_per_pixel: 4,
    }
}

pub fn surfaces(count: usize) -> Vec<SurfaceConfig> {
    vec![SurfaceConfig::default(); count]
}

#[derive(Default)]
pub struct ResourceCounters {
    pub locks: AtomicU32,
    pub unlocks: AtomicU32,
    pub finalized: AtomicU32,
}

/// Contiguous memory owned by some other driver
pub struct ExternalMemory {
    base: u64,
    counters: Arc<ResourceCounters>,
}

impl PhysicalMemory for ExternalMemory {
    fn lock_phys_addresses(&self) -> Result<()> {
        self.counters.locks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unlock_phys_addresses(&self) -> Result<()> {
        self.counters.unlocks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn dev_phys_addrs(&self, _log2_page_size: u32, offsets: &[u64]) -> Result<Vec<DevPhysAddr>> {
        Ok(offsets.iter().map(|offset| DevPhysAddr(self.base + offset)).collect())
    }

    fn read_bytes(&self, _offset: u64, out: &mut [u8]) -> Result<usize> {
        out.fill(0);
        Ok(out.len())
    }

    fn finalize(&self) {
        self.counters.finalized.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn external_resource(base: u64, pages: u64) -> (Arc<PhysResource>, Arc<ResourceCounters>) {
    let counters = Arc::new(ResourceCounters::default());
    let resource = PhysResource::new(
        heap(HeapKind::CpuLocal),
        pages * PAGE_SIZE,
        PAGE_SHIFT,
        Box::new(ExternalMemory {
            base,
            counters: counters.clone(),
        }),
    );
    (resource, counters)
}
