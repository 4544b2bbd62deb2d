//! Graphics backends the buffer pool allocates from

use super::buffer::{BufferKind, BufferResource};
use crate::core::{Error, Result};

/// Raw buffer operations of a graphics device.
///
/// Every call is made from the render thread; the pool enforces this.
pub trait GpuBackend: Send {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Create a buffer of at least `size_bytes`
    fn create_buffer(&mut self, kind: BufferKind, size_bytes: u64) -> Result<BufferResource>;

    /// Write `bytes` at offset zero. The resource is large enough.
    fn write_buffer(&mut self, resource: &mut BufferResource, bytes: &[u8]) -> Result<()>;

    /// Release a buffer for good
    fn destroy_buffer(&mut self, resource: BufferResource);

    /// Bytes currently allocated through this backend
    fn allocated_bytes(&self) -> u64;
}

/// Round up to wgpu's copy alignment
fn align_copy(size: u64) -> u64 {
    let align = wgpu::COPY_BUFFER_ALIGNMENT;
    size.div_ceil(align).max(1) * align
}

/// Backend over a wgpu device and queue
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    /// Upper bound on bytes allocated through this backend
    budget_bytes: u64,
    allocated_bytes: u64,
}

impl WgpuBackend {
    /// Default GPU memory budget for chunk buffers
    pub const DEFAULT_BUDGET_BYTES: u64 = 512 * 1024 * 1024;

    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self::with_budget(device, queue, Self::DEFAULT_BUDGET_BYTES)
    }

    pub fn with_budget(device: wgpu::Device, queue: wgpu::Queue, budget_bytes: u64) -> Self {
        log::info!(
            "WgpuBackend: chunk buffer budget {}MB",
            budget_bytes / 1024 / 1024
        );
        Self {
            device,
            queue,
            budget_bytes,
            allocated_bytes: 0,
        }
    }
}

impl GpuBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn create_buffer(&mut self, kind: BufferKind, size_bytes: u64) -> Result<BufferResource> {
        let size = align_copy(size_bytes);

        let max_buffer_size = self.device.limits().max_buffer_size;
        if size > max_buffer_size {
            return Err(Error::Gpu(format!(
                "buffer of {size} bytes exceeds device limit {max_buffer_size}"
            )));
        }
        if self.allocated_bytes + size > self.budget_bytes {
            return Err(Error::GpuExhausted(format!(
                "{} of {} bytes in use, {} requested",
                self.allocated_bytes, self.budget_bytes, size
            )));
        }

        let (label, usage) = match kind {
            BufferKind::Vertex(_) => ("chunk_vertices", wgpu::BufferUsages::VERTEX),
            BufferKind::Index => ("chunk_indices", wgpu::BufferUsages::INDEX),
        };
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: usage | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        self.allocated_bytes += size;
        Ok(BufferResource::Wgpu(buffer))
    }

    fn write_buffer(&mut self, resource: &mut BufferResource, bytes: &[u8]) -> Result<()> {
        let BufferResource::Wgpu(buffer) = resource else {
            return Err(Error::Gpu("host buffer passed to the wgpu backend".into()));
        };
        if bytes.is_empty() {
            return Ok(());
        }

        let aligned = align_copy(bytes.len() as u64) as usize;
        if aligned == bytes.len() {
            self.queue.write_buffer(buffer, 0, bytes);
        } else {
            let mut padded = Vec::with_capacity(aligned);
            padded.extend_from_slice(bytes);
            padded.resize(aligned, 0);
            self.queue.write_buffer(buffer, 0, &padded);
        }
        Ok(())
    }

    fn destroy_buffer(&mut self, resource: BufferResource) {
        if let BufferResource::Wgpu(buffer) = resource {
            self.allocated_bytes = self.allocated_bytes.saturating_sub(buffer.size());
            buffer.destroy();
        }
    }

    fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }
}

/// Backend that keeps buffers in host memory.
///
/// Used for headless runs (servers, tools, tests). It honours the same
/// budget semantics as a device so exhaustion paths can be exercised.
#[derive(Debug, Default)]
pub struct HostBackend {
    budget_bytes: Option<u64>,
    max_buffers: Option<usize>,
    allocated_bytes: u64,
    live_buffers: usize,
    writes: u64,
}

impl HostBackend {
    /// Unlimited host backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail allocations once `budget_bytes` are in use
    pub fn with_budget(budget_bytes: u64) -> Self {
        Self {
            budget_bytes: Some(budget_bytes),
            ..Self::default()
        }
    }

    /// Fail allocations once `max_buffers` buffers are alive
    pub fn with_max_buffers(max_buffers: usize) -> Self {
        Self {
            max_buffers: Some(max_buffers),
            ..Self::default()
        }
    }

    pub fn live_buffers(&self) -> usize {
        self.live_buffers
    }

    /// Number of uploads performed
    pub fn writes(&self) -> u64 {
        self.writes
    }
}

impl GpuBackend for HostBackend {
    fn name(&self) -> &'static str {
        "host"
    }

    fn create_buffer(&mut self, _kind: BufferKind, size_bytes: u64) -> Result<BufferResource> {
        if let Some(max) = self.max_buffers {
            if self.live_buffers >= max {
                return Err(Error::GpuExhausted(format!("{max} buffers alive")));
            }
        }
        if let Some(budget) = self.budget_bytes {
            if self.allocated_bytes + size_bytes > budget {
                return Err(Error::GpuExhausted(format!(
                    "{} of {} bytes in use, {} requested",
                    self.allocated_bytes, budget, size_bytes
                )));
            }
        }

        self.allocated_bytes += size_bytes;
        self.live_buffers += 1;
        Ok(BufferResource::Host(vec![0; size_bytes as usize]))
    }

    fn write_buffer(&mut self, resource: &mut BufferResource, bytes: &[u8]) -> Result<()> {
        let BufferResource::Host(storage) = resource else {
            return Err(Error::Gpu("device buffer passed to the host backend".into()));
        };
        let Some(target) = storage.get_mut(..bytes.len()) else {
            return Err(Error::Gpu(format!(
                "write of {} bytes into a {} byte buffer",
                bytes.len(),
                storage.len()
            )));
        };
        target.copy_from_slice(bytes);
        self.writes += 1;
        Ok(())
    }

    fn destroy_buffer(&mut self, resource: BufferResource) {
        self.allocated_bytes = self.allocated_bytes.saturating_sub(resource.size_bytes());
        self.live_buffers = self.live_buffers.saturating_sub(1);
    }

    fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::buffer::VertexFormat;

    #[test]
    fn test_align_copy() {
        assert_eq!(align_copy(0), 4);
        assert_eq!(align_copy(5), 8);
        assert_eq!(align_copy(8), 8);
    }

    #[test]
    fn test_host_backend_write() {
        let mut backend = HostBackend::new();
        let mut resource = backend
            .create_buffer(BufferKind::Vertex(VertexFormat::PosUvColor), 16)
            .unwrap();
        backend.write_buffer(&mut resource, &[1, 2, 3, 4]).unwrap();

        match &resource {
            BufferResource::Host(bytes) => assert_eq!(&bytes[..4], &[1, 2, 3, 4]),
            BufferResource::Wgpu(_) => panic!("expected host storage"),
        }
        assert_eq!(backend.writes(), 1);
    }

    #[test]
    fn test_host_backend_rejects_oversized_write() {
        let mut backend = HostBackend::new();
        let mut resource = backend.create_buffer(BufferKind::Index, 4).unwrap();
        assert!(backend.write_buffer(&mut resource, &[0; 8]).is_err());
    }

    #[test]
    fn test_host_backend_budget() {
        let mut backend = HostBackend::with_budget(100);
        let first = backend.create_buffer(BufferKind::Index, 60).unwrap();
        let second = backend.create_buffer(BufferKind::Index, 60);
        assert!(matches!(second, Err(Error::GpuExhausted(_))));

        backend.destroy_buffer(first);
        assert_eq!(backend.allocated_bytes(), 0);
        assert!(backend.create_buffer(BufferKind::Index, 60).is_ok());
    }

    #[test]
    fn test_host_backend_max_buffers() {
        let mut backend = HostBackend::with_max_buffers(1);
        let _first = backend.create_buffer(BufferKind::Index, 4).unwrap();
        assert!(backend.create_buffer(BufferKind::Index, 4).is_err());
        assert_eq!(backend.live_buffers(), 1);
    }
}
