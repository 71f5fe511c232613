/// Physical memory contract - "The Shared Memory"
///
/// The narrow slice of the host driver's physical memory manager the
/// display-class server depends on: heaps, reference-counted physical
/// resources, and page address lookup.

use crate::error::{DcError, Result};
use crate::refcount::RefCount;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Device physical address of a page (plus in-page offset)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevPhysAddr(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKind {
    /// Memory reserved for scan-out
    Display,
    /// Memory local to the GPU
    GpuLocal,
    CpuLocal,
}

/// Temporarily maps single physical pages for CPU access
pub trait PageMapper: Send + Sync {
    /// Copy `out.len()` bytes starting `offset` bytes into `page`.
    fn read_page(&self, page: DevPhysAddr, offset: usize, out: &mut [u8]) -> Result<()>;
}

/// A physical heap exposed by a host driver node
#[derive(Clone)]
pub struct PhysHeap {
    kind: HeapKind,
    name: Arc<str>,
    mapper: Arc<dyn PageMapper>,
}

impl PhysHeap {
    pub fn new(kind: HeapKind, name: &str, mapper: Arc<dyn PageMapper>) -> Self {
        Self {
            kind,
            name: Arc::from(name),
            mapper,
        }
    }

    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mapper(&self) -> &dyn PageMapper {
        self.mapper.as_ref()
    }
}

impl fmt::Debug for PhysHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysHeap")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .finish()
    }
}

/// Operations backing a [`PhysResource`]
pub trait PhysicalMemory: Send + Sync {
    /// Pin the backing pages and make their addresses available.
    fn lock_phys_addresses(&self) -> Result<()>;

    fn unlock_phys_addresses(&self) -> Result<()>;

    /// Translate byte offsets into device physical addresses. Only valid
    /// while locked.
    fn dev_phys_addrs(&self, log2_page_size: u32, offsets: &[u64]) -> Result<Vec<DevPhysAddr>>;

    /// Copy bytes out of the resource, returning how many were read.
    fn read_bytes(&self, offset: u64, out: &mut [u8]) -> Result<usize>;

    fn write_bytes(&self, _offset: u64, _data: &[u8]) -> Result<usize> {
        Err(DcError::NotSupported)
    }

    /// Remap sparse backing pages.
    fn change_sparse(&self, _alloc_pages: &[u32], _free_pages: &[u32]) -> Result<()> {
        Err(DcError::NotSupported)
    }

    /// Called exactly once, when the last reference to the resource drops.
    fn finalize(&self);
}

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// A reference-counted physical memory resource
pub struct PhysResource {
    id: u64,
    heap: PhysHeap,
    size: u64,
    log2_contiguity: u32,
    refs: RefCount,
    lock_count: Mutex<u32>,
    layout_fixed: AtomicBool,
    backing: Box<dyn PhysicalMemory>,
}

impl PhysResource {
    /// Create a resource holding one reference for the caller.
    pub fn new(
        heap: PhysHeap,
        size: u64,
        log2_contiguity: u32,
        backing: Box<dyn PhysicalMemory>,
    ) -> Arc<Self> {
        let id = NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "Created physical resource {} ({} bytes, heap {})",
            id,
            size,
            heap.name()
        );

        Arc::new(Self {
            id,
            heap,
            size,
            log2_contiguity,
            refs: RefCount::new(1),
            lock_count: Mutex::new(0),
            layout_fixed: AtomicBool::new(false),
            backing,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn heap(&self) -> &PhysHeap {
        &self.heap
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn log2_contiguity(&self) -> u32 {
        self.log2_contiguity
    }

    pub fn ref_count(&self) -> u32 {
        self.refs.get()
    }

    /// Increment reference count
    pub fn add_ref(&self) {
        let count = self.refs.acquire();
        log::debug!("Incremented ref count for resource {} to {}", self.id, count);
    }

    /// Drop a reference; the last one finalizes the backing.
    pub fn unref(&self) {
        if self.refs.release() {
            log::debug!("Finalizing physical resource {}", self.id);
            self.backing.finalize();
        } else {
            log::debug!("Decremented ref count for resource {} to {}", self.id, self.refs.get());
        }
    }

    /// Forbid any further change to the page layout.
    pub fn set_layout_fixed(&self) {
        self.layout_fixed.store(true, Ordering::Release);
    }

    pub fn is_layout_fixed(&self) -> bool {
        self.layout_fixed.load(Ordering::Acquire)
    }

    /// Lock physical addresses; nested locks are counted.
    pub fn lock_phys_addresses(&self) -> Result<()> {
        let mut count = self.lock_count.lock();
        if *count == 0 {
            self.backing.lock_phys_addresses()?;
        }
        *count += 1;
        Ok(())
    }

    pub fn unlock_phys_addresses(&self) -> Result<()> {
        let mut count = self.lock_count.lock();
        match *count {
            0 => Err(DcError::InvalidParameter("physical addresses are not locked")),
            1 => {
                self.backing.unlock_phys_addresses()?;
                *count = 0;
                Ok(())
            }
            _ => {
                *count -= 1;
                Ok(())
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        *self.lock_count.lock() > 0
    }

    pub fn dev_phys_addrs(&self, log2_page_size: u32, offsets: &[u64]) -> Result<Vec<DevPhysAddr>> {
        if !self.is_locked() {
            return Err(DcError::InvalidParameter("physical addresses are not locked"));
        }
        self.backing.dev_phys_addrs(log2_page_size, offsets)
    }

    pub fn read_bytes(&self, offset: u64, out: &mut [u8]) -> Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        let len = out.len().min((self.size - offset) as usize);
        self.backing.read_bytes(offset, &mut out[..len])
    }

    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<usize> {
        if self.is_layout_fixed() {
            return Err(DcError::NotSupported);
        }
        self.backing.write_bytes(offset, data)
    }

    pub fn change_sparse(&self, alloc_pages: &[u32], free_pages: &[u32]) -> Result<()> {
        if self.is_layout_fixed() {
            return Err(DcError::NotSupported);
        }
        self.backing.change_sparse(alloc_pages, free_pages)
    }
}

impl fmt::Debug for PhysResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysResource")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("refs", &self.refs.get())
            .finish()
    }
}
