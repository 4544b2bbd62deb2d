//! GPU buffer handles and vertex layouts

use serde::{Deserialize, Serialize};

/// Vertex layouts a chunk mesh can be uploaded with
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VertexFormat {
    /// position (3) + uv (2) + normal (3) + rgba8 color
    PosUvNormalColor,
    /// position (3) + uv (2) + rgba8 color
    PosUvColor,
}

impl VertexFormat {
    /// Bytes per vertex
    pub const fn stride(self) -> usize {
        match self {
            Self::PosUvNormalColor => (3 + 2 + 3) * 4 + 4,
            Self::PosUvColor => (3 + 2) * 4 + 4,
        }
    }
}

/// Index element type used for every chunk mesh
pub type Index = u32;

/// Bytes per index element
pub const INDEX_STRIDE: usize = std::mem::size_of::<Index>();

/// What a buffer is bound as
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferKind {
    Vertex(VertexFormat),
    Index,
}

impl BufferKind {
    /// Bytes per element of this kind
    pub const fn stride(self) -> usize {
        match self {
            Self::Vertex(format) => format.stride(),
            Self::Index => INDEX_STRIDE,
        }
    }
}

/// Stable identity of a pooled buffer, kept across reuse
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferId(pub u64);

/// Backend storage behind a [`GpuBuffer`]
#[derive(Debug)]
pub enum BufferResource {
    Wgpu(wgpu::Buffer),
    /// Host memory stand-in used by the headless backend
    Host(Vec<u8>),
}

impl BufferResource {
    /// Allocated size in bytes
    pub fn size_bytes(&self) -> u64 {
        match self {
            Self::Wgpu(buffer) => buffer.size(),
            Self::Host(bytes) => bytes.len() as u64,
        }
    }
}

/// A vertex or index buffer handed out by the pool.
///
/// Not `Clone`: a buffer is owned by at most one chunk at a time and goes
/// back through [`GpuBufferPool::free_buffer`](super::GpuBufferPool::free_buffer).
#[derive(Debug)]
pub struct GpuBuffer {
    pub(crate) id: BufferId,
    pub(crate) kind: BufferKind,
    pub(crate) resource: BufferResource,
    /// Bytes written by the last upload
    pub(crate) used_bytes: u64,
}

impl GpuBuffer {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Vertex layout, `None` for index buffers
    pub fn vertex_format(&self) -> Option<VertexFormat> {
        match self.kind {
            BufferKind::Vertex(format) => Some(format),
            BufferKind::Index => None,
        }
    }

    /// Capacity in elements of this buffer's kind
    pub fn capacity(&self) -> usize {
        self.resource.size_bytes() as usize / self.kind.stride()
    }

    /// Elements written by the last upload
    pub fn len(&self) -> usize {
        self.used_bytes as usize / self.kind.stride()
    }

    pub fn is_empty(&self) -> bool {
        self.used_bytes == 0
    }

    pub fn resource(&self) -> &BufferResource {
        &self.resource
    }

    /// The wgpu buffer to bind for drawing, if this buffer lives on a device
    pub fn wgpu_buffer(&self) -> Option<&wgpu::Buffer> {
        match &self.resource {
            BufferResource::Wgpu(buffer) => Some(buffer),
            BufferResource::Host(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strides() {
        assert_eq!(VertexFormat::PosUvNormalColor.stride(), 36);
        assert_eq!(VertexFormat::PosUvColor.stride(), 24);
        assert_eq!(BufferKind::Index.stride(), 4);
    }

    #[test]
    fn test_capacity_in_elements() {
        let buffer = GpuBuffer {
            id: BufferId(1),
            kind: BufferKind::Index,
            resource: BufferResource::Host(vec![0; 400]),
            used_bytes: 40,
        };
        assert_eq!(buffer.capacity(), 100);
        assert_eq!(buffer.len(), 10);
        assert!(buffer.vertex_format().is_none());
    }
}
