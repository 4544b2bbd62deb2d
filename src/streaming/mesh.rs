//! CPU-side chunk meshes and the mesher interface

use std::sync::Arc;

use super::chunk::ChunkCoord;
use crate::core::types::{UVec2, Vec2};
use crate::core::{Error, Result};
use crate::gpu::{Index, VertexFormat};

/// A vertex type that can be packed into a chunk mesh
pub trait Vertex: bytemuck::Pod {
    const FORMAT: VertexFormat;
}

/// Vertex and index data ready for upload
#[derive(Clone, Debug, PartialEq)]
pub struct MeshData {
    format: VertexFormat,
    vertex_bytes: Vec<u8>,
    indices: Vec<Index>,
}

impl MeshData {
    /// Pack typed vertices. Every index must reference one of `vertices`.
    pub fn from_vertices<V: Vertex>(vertices: &[V], indices: Vec<Index>) -> Result<Self> {
        if let Some(&bad) = indices.iter().find(|&&i| i as usize >= vertices.len()) {
            return Err(Error::Gpu(format!(
                "index {bad} out of range for {} vertices",
                vertices.len()
            )));
        }
        Ok(Self {
            format: V::FORMAT,
            vertex_bytes: bytemuck::cast_slice(vertices).to_vec(),
            indices,
        })
    }

    /// A mesh with no geometry; still a valid `HasMesh` resource
    pub fn empty(format: VertexFormat) -> Self {
        Self {
            format,
            vertex_bytes: Vec::new(),
            indices: Vec::new(),
        }
    }

    pub fn format(&self) -> VertexFormat {
        self.format
    }

    pub fn vertex_bytes(&self) -> &[u8] {
        &self.vertex_bytes
    }

    pub fn vertex_count(&self) -> usize {
        self.vertex_bytes.len() / self.format.stride()
    }

    pub fn indices(&self) -> &[Index] {
        &self.indices
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Heap bytes held by this mesh
    pub fn memory_bytes(&self) -> usize {
        self.vertex_bytes.len() + self.indices.len() * std::mem::size_of::<Index>()
    }
}

/// Snapshot of a chunk's raw data handed to a mesher on a worker thread
#[derive(Clone, Debug)]
pub struct MeshInput<T> {
    pub coord: ChunkCoord,
    /// Data version the mesh is built from
    pub version: u32,
    /// Tiles per chunk along each axis
    pub chunk_size: UVec2,
    /// World size of one tile
    pub tile_size: Vec2,
    /// World position of the chunk's minimum corner
    pub origin: Vec2,
    /// Row-major tiles, `chunk_size.x * chunk_size.y` of them
    pub tiles: Arc<[T]>,
}

impl<T> MeshInput<T> {
    /// Tile at local position, row-major
    pub fn tile(&self, x: u32, y: u32) -> Option<&T> {
        if x >= self.chunk_size.x || y >= self.chunk_size.y {
            return None;
        }
        self.tiles.get((y * self.chunk_size.x + x) as usize)
    }
}

/// Builds the CPU mesh of a chunk from its raw tiles.
///
/// Called on job worker threads; implementations must not touch GPU state.
pub trait ChunkMesher<T>: Send + Sync {
    fn build_mesh(&self, input: &MeshInput<T>) -> Result<MeshData>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::{Pod, Zeroable};

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    struct TestVertex {
        position: [f32; 3],
        uv: [f32; 2],
        color: [u8; 4],
    }

    impl Vertex for TestVertex {
        const FORMAT: VertexFormat = VertexFormat::PosUvColor;
    }

    fn vertex(x: f32) -> TestVertex {
        TestVertex {
            position: [x, 0.0, 0.0],
            uv: [0.0; 2],
            color: [255; 4],
        }
    }

    #[test]
    fn test_from_vertices_packs_bytes() {
        let mesh = MeshData::from_vertices(&[vertex(0.0), vertex(1.0), vertex(2.0)], vec![0, 1, 2])
            .unwrap();
        assert_eq!(mesh.format(), VertexFormat::PosUvColor);
        assert_eq!(mesh.vertex_bytes().len(), 3 * 24);
        assert_eq!(mesh.vertex_count(), 3);
        assert_eq!(mesh.triangle_count(), 1);
    }

    #[test]
    fn test_from_vertices_rejects_bad_index() {
        let result = MeshData::from_vertices(&[vertex(0.0)], vec![0, 1, 0]);
        assert!(result.is_err());
    }

    #[test]
    fn test_mesh_input_tile_lookup() {
        let input = MeshInput {
            coord: ChunkCoord::new(0, 0),
            version: 0,
            chunk_size: UVec2::new(2, 2),
            tile_size: Vec2::ONE,
            origin: Vec2::ZERO,
            tiles: Arc::from(vec![1u8, 2, 3, 4]),
        };
        assert_eq!(input.tile(1, 0), Some(&2));
        assert_eq!(input.tile(0, 1), Some(&3));
        assert_eq!(input.tile(2, 0), None);
    }
}
