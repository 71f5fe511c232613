//! Exposes a display buffer to the physical memory manager.
//!
//! Page locking goes through the backend's buffer acquire/release, address
//! lookups index the locked page list, and the resource keeps one
//! reference on the buffer until it is finalized.

use super::physmem::{DevPhysAddr, PhysResource, PhysicalMemory};
use super::BufferPages;
use crate::buffer::Buffer;
use crate::error::{DcError, Result};
use crate::types::BufferGeometry;
use parking_lot::Mutex;
use std::sync::Arc;

pub(crate) struct BufferExport {
    buffer: Arc<Buffer>,
    geometry: BufferGeometry,
    pages: Mutex<Option<BufferPages>>,
}

impl BufferExport {
    /// Wrap `buffer` in a physical resource. The resource takes a buffer
    /// reference and starts with one reference of its own.
    pub(crate) fn create(buffer: &Arc<Buffer>, geometry: BufferGeometry) -> Arc<PhysResource> {
        buffer.acquire_ref();
        let heap = buffer.device().heap().clone();

        PhysResource::new(
            heap,
            geometry.size(),
            geometry.log2_page_size,
            Box::new(Self {
                buffer: buffer.clone(),
                geometry,
                pages: Mutex::new(None),
            }),
        )
    }

    fn page_mask(&self) -> u64 {
        self.geometry.page_size() - 1
    }
}

impl PhysicalMemory for BufferExport {
    fn lock_phys_addresses(&self) -> Result<()> {
        let backend = self.buffer.device().backend();
        let pages = backend.buffer_acquire(self.buffer.handle())?;

        if pages.addrs.len() < self.geometry.page_count as usize {
            backend.buffer_release(self.buffer.handle());
            return Err(DcError::Backend(format!(
                "buffer acquire reported {} pages, expected {}",
                pages.addrs.len(),
                self.geometry.page_count
            )));
        }

        *self.pages.lock() = Some(pages);
        Ok(())
    }

    fn unlock_phys_addresses(&self) -> Result<()> {
        if self.pages.lock().take().is_none() {
            return Err(DcError::InvalidParameter("buffer pages are not acquired"));
        }
        self.buffer.device().backend().buffer_release(self.buffer.handle());
        Ok(())
    }

    fn dev_phys_addrs(&self, log2_page_size: u32, offsets: &[u64]) -> Result<Vec<DevPhysAddr>> {
        debug_assert_eq!(
            log2_page_size, self.geometry.log2_page_size,
            "page size differs from the buffer's"
        );
        if log2_page_size != self.geometry.log2_page_size {
            return Err(DcError::InvalidParameter("page size differs from the buffer's"));
        }

        let pages = self.pages.lock();
        let pages = pages
            .as_ref()
            .ok_or(DcError::InvalidParameter("buffer pages are not acquired"))?;

        offsets
            .iter()
            .map(|&offset| {
                let index = (offset >> log2_page_size) as usize;
                let page = pages
                    .addrs
                    .get(index)
                    .ok_or(DcError::InvalidParameter("offset beyond the end of the buffer"))?;
                Ok(DevPhysAddr(page.0 + (offset & self.page_mask())))
            })
            .collect()
    }

    fn read_bytes(&self, offset: u64, out: &mut [u8]) -> Result<usize> {
        let pages = self.pages.lock();
        let pages = pages
            .as_ref()
            .ok_or(DcError::InvalidParameter("buffer pages are not acquired"))?;

        if let Some(mapping) = &pages.cpu_mapping {
            let bytes = mapping.bytes();
            let start = (offset as usize).min(bytes.len());
            let len = out.len().min(bytes.len() - start);
            out[..len].copy_from_slice(&bytes[start..start + len]);
            return Ok(len);
        }

        // No kernel mapping: go through the heap one page at a time.
        let mapper = self.buffer.device().heap().mapper();
        let page_size = self.geometry.page_size();
        let mut done = 0usize;
        while done < out.len() {
            let at = offset + done as u64;
            let index = (at >> self.geometry.log2_page_size) as usize;
            let Some(&page) = pages.addrs.get(index) else {
                break;
            };
            let in_page = at & self.page_mask();
            let chunk = ((page_size - in_page) as usize).min(out.len() - done);

            mapper.read_page(page, in_page as usize, &mut out[done..done + chunk])?;
            done += chunk;
        }
        Ok(done)
    }

    fn finalize(&self) {
        log::debug!("Export of buffer {:?} finalized", self.buffer.handle());
        if self.pages.lock().take().is_some() {
            log::warn!("Buffer {:?} export finalized while locked", self.buffer.handle());
            self.buffer.device().backend().buffer_release(self.buffer.handle());
        }
        self.buffer.release_ref();
    }
}
