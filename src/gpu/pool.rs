//! GPU buffer pool with one-frame deferred reuse
//!
//! Buffers returned with [`GpuBufferPool::free_buffer`] go to a pending list
//! and only become reusable after the next [`GpuBufferPool::process_freed`],
//! which the owner calls once per frame boundary. A draw command recorded
//! in the previous frame may still reference a freed buffer until then.
//!
//! All operations are render-thread only and assert it.

use serde::Serialize;

use super::backend::GpuBackend;
use super::buffer::{BufferId, BufferKind, BufferResource, GpuBuffer, VertexFormat, INDEX_STRIDE};
use crate::core::Result;
use crate::jobs::RenderThread;

/// Initial size of a freshly created vertex buffer, grown on upload
pub const INITIAL_VERTEX_BUFFER_BYTES: u64 = 16 * 1024;

/// Initial index capacity when the caller has no size preference
pub const INITIAL_INDEX_CAPACITY: usize = 1024;

/// A rented buffer is accepted when its capacity is at most this many
/// times the requested capacity
pub const INDEX_WASTE_FACTOR: usize = 2;

/// Counters describing the pool's current contents
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Buffers ever created through the backend
    pub created: u64,
    /// Allocations served from the free lists
    pub reused: u64,
    /// Reusable buffers
    pub free: usize,
    /// Freed this frame, waiting for `process_freed`
    pub pending: usize,
    /// Buffers currently handed out
    pub outstanding: usize,
}

/// Free-list allocator for chunk vertex and index buffers
pub struct GpuBufferPool {
    backend: Box<dyn GpuBackend>,
    render_thread: RenderThread,
    free_vertex: Vec<GpuBuffer>,
    free_index: Vec<GpuBuffer>,
    pending: Vec<GpuBuffer>,
    /// Storage replaced by a growing upload, destroyed at the next frame boundary
    pending_destroy: Vec<BufferResource>,
    next_id: u64,
    created: u64,
    reused: u64,
    outstanding: usize,
}

impl GpuBufferPool {
    /// Create a pool bound to the calling thread as the render thread
    pub fn new(backend: Box<dyn GpuBackend>) -> Self {
        log::info!("GpuBufferPool: created on {} backend", backend.name());
        Self {
            backend,
            render_thread: RenderThread::current(),
            free_vertex: Vec::new(),
            free_index: Vec::new(),
            pending: Vec::new(),
            pending_destroy: Vec::new(),
            next_id: 1,
            created: 0,
            reused: 0,
            outstanding: 0,
        }
    }

    pub fn render_thread(&self) -> RenderThread {
        self.render_thread
    }

    fn create(&mut self, kind: BufferKind, size_bytes: u64) -> Result<GpuBuffer> {
        let resource = self.backend.create_buffer(kind, size_bytes)?;
        let id = BufferId(self.next_id);
        self.next_id += 1;
        self.created += 1;
        log::trace!("GpuBufferPool: created {:?} buffer {:?} ({} bytes)", kind, id, size_bytes);
        Ok(GpuBuffer {
            id,
            kind,
            resource,
            used_bytes: 0,
        })
    }

    /// Hand out a vertex buffer of `format`, reusing the most recently
    /// freed matching buffer when there is one.
    ///
    /// Fails with [`Error::GpuExhausted`](crate::core::Error::GpuExhausted)
    /// when the backend has no memory left.
    pub fn allocate_buffer(&mut self, format: VertexFormat) -> Result<GpuBuffer> {
        self.render_thread.assert_current("GpuBufferPool::allocate_buffer");

        let kind = BufferKind::Vertex(format);
        let buffer = match self.free_vertex.iter().rposition(|b| b.kind == kind) {
            Some(index) => {
                self.reused += 1;
                self.free_vertex.remove(index)
            }
            None => self.create(kind, INITIAL_VERTEX_BUFFER_BYTES)?,
        };

        self.outstanding += 1;
        Ok(buffer)
    }

    /// Hand out an index buffer.
    ///
    /// With `None` any free index buffer is returned (LIFO). With
    /// `Some(desired)` the smallest free buffer holding at least `desired`
    /// indices is chosen, but only if it holds no more than twice that;
    /// otherwise a new buffer of exactly `desired` indices is created.
    pub fn rent_index_buffer(&mut self, desired: Option<usize>) -> Result<GpuBuffer> {
        self.render_thread.assert_current("GpuBufferPool::rent_index_buffer");

        let found = match desired {
            None => self.free_index.len().checked_sub(1),
            Some(desired) => {
                let mut best: Option<(usize, usize)> = None;
                for (index, buffer) in self.free_index.iter().enumerate() {
                    let capacity = buffer.capacity();
                    if capacity < desired {
                        continue;
                    }
                    if best.is_none_or(|(_, best_capacity)| capacity < best_capacity) {
                        best = Some((index, capacity));
                    }
                }
                best.filter(|&(_, capacity)| capacity <= desired.saturating_mul(INDEX_WASTE_FACTOR))
                    .map(|(index, _)| index)
            }
        };

        let buffer = match found {
            Some(index) => {
                self.reused += 1;
                self.free_index.remove(index)
            }
            None => {
                let capacity = desired.unwrap_or(INITIAL_INDEX_CAPACITY).max(1);
                self.create(BufferKind::Index, (capacity * INDEX_STRIDE) as u64)?
            }
        };

        self.outstanding += 1;
        Ok(buffer)
    }

    /// Return a buffer. It becomes reusable after the next `process_freed`.
    pub fn free_buffer(&mut self, buffer: GpuBuffer) {
        self.render_thread.assert_current("GpuBufferPool::free_buffer");

        log::trace!("GpuBufferPool: buffer {:?} pending free", buffer.id);
        self.outstanding = self.outstanding.saturating_sub(1);
        self.pending.push(buffer);
    }

    /// Frame boundary: make last frame's freed buffers reusable and destroy
    /// storage that was replaced by growing uploads.
    pub fn process_freed(&mut self) {
        self.render_thread.assert_current("GpuBufferPool::process_freed");

        for mut buffer in self.pending.drain(..) {
            buffer.used_bytes = 0;
            match buffer.kind {
                BufferKind::Vertex(_) => self.free_vertex.push(buffer),
                BufferKind::Index => self.free_index.push(buffer),
            }
        }
        for resource in self.pending_destroy.drain(..) {
            self.backend.destroy_buffer(resource);
        }
    }

    /// Upload `bytes` into `buffer`, growing its storage when too small.
    ///
    /// Replaced storage is kept alive until the next frame boundary.
    pub fn upload(&mut self, buffer: &mut GpuBuffer, bytes: &[u8]) -> Result<()> {
        self.render_thread.assert_current("GpuBufferPool::upload");

        if bytes.len() as u64 > buffer.resource.size_bytes() {
            let grown = (bytes.len() as u64).next_power_of_two();
            let resource = self.backend.create_buffer(buffer.kind, grown)?;
            let old = std::mem::replace(&mut buffer.resource, resource);
            self.pending_destroy.push(old);
            log::trace!("GpuBufferPool: grew buffer {:?} to {} bytes", buffer.id, grown);
        }

        self.backend.write_buffer(&mut buffer.resource, bytes)?;
        buffer.used_bytes = bytes.len() as u64;
        Ok(())
    }

    /// Whether a buffer with this id is sitting in the pending list
    pub fn is_pending(&self, id: BufferId) -> bool {
        self.pending.iter().any(|b| b.id == id)
    }

    /// Ids of buffers freed since the last frame boundary
    pub fn pending_ids(&self) -> Vec<BufferId> {
        self.pending.iter().map(|b| b.id).collect()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.created,
            reused: self.reused,
            free: self.free_vertex.len() + self.free_index.len(),
            pending: self.pending.len(),
            outstanding: self.outstanding,
        }
    }

    /// Bytes allocated through the backend
    pub fn allocated_bytes(&self) -> u64 {
        self.backend.allocated_bytes()
    }

    /// Shutdown: destroy every buffer the pool holds.
    ///
    /// Buffers still owned by chunks are not reachable from here and must be
    /// freed first.
    pub fn destroy_all(&mut self) {
        self.render_thread.assert_current("GpuBufferPool::destroy_all");

        if self.outstanding > 0 {
            log::warn!(
                "GpuBufferPool: destroying pool with {} buffers still handed out",
                self.outstanding
            );
        }
        let buffers = self
            .free_vertex
            .drain(..)
            .chain(self.free_index.drain(..))
            .chain(self.pending.drain(..));
        for buffer in buffers {
            self.backend.destroy_buffer(buffer.resource);
        }
        for resource in self.pending_destroy.drain(..) {
            self.backend.destroy_buffer(resource);
        }
    }
}

impl Drop for GpuBufferPool {
    fn drop(&mut self) {
        if self.render_thread.is_current() {
            self.destroy_all();
        }
    }
}
