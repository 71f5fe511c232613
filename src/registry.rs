/// Device Registry - "The Switchboard"
///
/// Process-wide bookkeeping for display devices and contexts. Device
/// indices are handed out monotonically and never reused, so a stale index
/// can only ever miss.
///
/// Lookups only hand out entries whose reference count is still live;
/// no lock in here is held across a backend call.

use crate::context::DisplayContext;
use crate::device::Device;
use crate::error::{DcError, Result};
use crate::hal::physmem::{HeapKind, PhysHeap};
use crate::types::{ContextId, NodeId};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// A host-driver node that display devices register against
#[derive(Debug)]
pub struct DeviceNode {
    id: NodeId,
    heaps: Vec<PhysHeap>,
    ready: AtomicBool,
}

impl DeviceNode {
    pub fn new(id: NodeId, heaps: Vec<PhysHeap>) -> Arc<Self> {
        Arc::new(Self {
            id,
            heaps,
            ready: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The host driver has finished initialising this node
    pub fn mark_ready(&self) {
        log::info!("Node {} ready for display devices", self.id.0);
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn heap(&self, kind: HeapKind) -> Option<&PhysHeap> {
        self.heaps.iter().find(|heap| heap.kind() == kind)
    }

    /// Heap display buffers are exported from: the display heap if the
    /// node has one, GPU-local memory otherwise.
    pub fn display_heap(&self) -> Result<PhysHeap> {
        self.heap(HeapKind::Display)
            .or_else(|| self.heap(HeapKind::GpuLocal))
            .cloned()
            .ok_or(DcError::InvalidHeap)
    }
}

pub(crate) struct DeviceRegistry {
    devices: RwLock<BTreeMap<u32, Arc<Device>>>,
    next_index: AtomicU32,
    contexts: Mutex<BTreeMap<ContextId, Arc<DisplayContext>>>,
    next_context: AtomicU64,
}

impl DeviceRegistry {
    pub(crate) fn new() -> Self {
        Self {
            devices: RwLock::new(BTreeMap::new()),
            next_index: AtomicU32::new(0),
            contexts: Mutex::new(BTreeMap::new()),
            next_context: AtomicU64::new(1),
        }
    }

    pub(crate) fn allocate_index(&self) -> u32 {
        self.next_index.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn publish_device(&self, device: &Arc<Device>) {
        self.devices.write().insert(device.index(), device.clone());
    }

    pub(crate) fn remove_device(&self, index: u32) {
        if self.devices.write().remove(&index).is_none() {
            log::warn!("Display device {} was not in the registry", index);
        }
    }

    /// Indices of the live devices registered on `node`
    pub(crate) fn enumerate(&self, node: NodeId) -> Vec<u32> {
        self.devices
            .read()
            .values()
            .filter(|device| device.node() == node && device.ref_count() > 0)
            .map(|device| device.index())
            .collect()
    }

    pub(crate) fn device_count(&self, node: NodeId) -> usize {
        self.enumerate(node).len()
    }

    /// Take a reference on the device at `index`, if it belongs to `node`
    /// and is still live.
    pub(crate) fn acquire(&self, index: u32, node: NodeId) -> Result<Arc<Device>> {
        let devices = self.devices.read();
        let device = devices
            .get(&index)
            .filter(|device| device.node() == node)
            .ok_or(DcError::NotFound)?;

        if !device.try_acquire_ref() {
            return Err(DcError::NotFound);
        }
        log::debug!("Acquired display device {} (refs {})", index, device.ref_count());
        Ok(device.clone())
    }

    pub(crate) fn next_context_id(&self) -> ContextId {
        ContextId(self.next_context.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn publish_context(&self, ctx: &Arc<DisplayContext>) {
        self.contexts.lock().insert(ctx.id(), ctx.clone());
    }

    pub(crate) fn remove_context(&self, id: ContextId) {
        self.contexts.lock().remove(&id);
    }

    /// Every live context, each with a reference the caller must release
    pub(crate) fn acquire_contexts(&self) -> Vec<Arc<DisplayContext>> {
        self.contexts
            .lock()
            .values()
            .filter(|ctx| ctx.try_acquire_ref())
            .cloned()
            .collect()
    }
}
