//! Tiled navigation mesh
//!
//! The navigation mesh is a grid of tiles addressed by `(x, y, layer)`. Each tile holds
//! convex polygons plus off-mesh connection polygons. Polygons are addressed by salted
//! [`PolyRef`]s, so references to removed tiles are detected instead of silently
//! resolving to whatever tile reused the slot.
//!
//! # Features
//!
//! - Variable tile/polygon bit split sized from the mesh parameters
//! - Links inside tiles, across tile borders and through off-mesh connections
//! - Nearest polygon queries, A* paths pulled straight along the corridor
//! - Raycasts, surface movement, random points and wall distance
//! - Tile binary layout for saving and loading single tiles
//!
//! # Example
//!
//! ```rust,ignore
//! use navmesh_detour::{NavMesh, NavMeshParams};
//!
//! let params = NavMeshParams {
//!     origin: [0.0, 0.0, 0.0],
//!     tile_width: 38.4,
//!     tile_height: 38.4,
//!     max_tiles: 256,
//!     max_polys_per_tile: 1024,
//! };
//! let mut nav_mesh = NavMesh::new(params)?;
//! let tile = create_nav_mesh_tile(&create_params)?;
//! let tile_ref = nav_mesh.add_tile(tile)?;
//! ```

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use navmesh_common::Result;

pub mod binary_format;
mod nav_mesh;
mod nav_mesh_builder;
mod nav_mesh_query;
mod status;

pub use binary_format::{load_tile_from_binary, save_tile_to_binary};
pub use nav_mesh::*;
pub use nav_mesh_builder::*;
pub use nav_mesh_query::*;
pub use status::Status;

/// Maximum number of vertices per navigation polygon
pub const MAX_VERTS_PER_POLY: usize = 6;

/// Vertex index marking an unused polygon slot
pub const MESH_NULL_IDX: u16 = 0xffff;

/// Neighbour flag marking a polygon edge on the tile border
pub const EXT_LINK: u16 = 0x8000;

/// Reference to a polygon or tile in the navigation mesh.
///
/// Encodes salt, tile index and polygon index. `PolyRef(0)` is never a valid reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct PolyRef(u32);

impl PolyRef {
    /// Creates a new polygon reference
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Gets the raw id of the reference
    pub fn id(&self) -> u32 {
        self.0
    }

    /// Whether the reference is non-null
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl From<u32> for PolyRef {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for PolyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

bitflags::bitflags! {
    /// Polygon flags used to filter traversal
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(
        feature = "serialization",
        derive(serde::Serialize, serde::Deserialize)
    )]
    pub struct PolyFlags: u16 {
        /// Ability to walk (ground, grass, road)
        const WALK = 0x01;
        /// Ability to swim (water)
        const SWIM = 0x02;
        /// Ability to move through doors
        const DOOR = 0x04;
        /// Ability to jump
        const JUMP = 0x08;
        /// Disabled polygon
        const DISABLED = 0x10;
        /// All abilities
        const ALL = 0xffff;
    }
}

/// Type of a navigation polygon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum PolyType {
    /// Regular convex ground polygon
    #[default]
    Ground,
    /// Two-vertex polygon standing in for an off-mesh connection
    OffMeshConnection,
}

/// Parameters that define the tiling of a navigation mesh
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct NavMeshParams {
    /// World-space origin of the tile grid
    pub origin: [f32; 3],
    /// Width of each tile along the x-axis
    pub tile_width: f32,
    /// Depth of each tile along the z-axis
    pub tile_height: f32,
    /// Maximum number of tiles the mesh can hold
    pub max_tiles: i32,
    /// Maximum number of polygons per tile
    pub max_polys_per_tile: i32,
}

impl Default for NavMeshParams {
    fn default() -> Self {
        Self {
            origin: [0.0; 3],
            tile_width: 0.0,
            tile_height: 0.0,
            max_tiles: 0,
            max_polys_per_tile: 0,
        }
    }
}

impl NavMeshParams {
    /// Size of the binary representation
    pub const SERIALIZED_SIZE: usize = 28;

    /// Writes the parameters field by field, little-endian
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        for v in self.origin {
            writer.write_f32::<LittleEndian>(v)?;
        }
        writer.write_f32::<LittleEndian>(self.tile_width)?;
        writer.write_f32::<LittleEndian>(self.tile_height)?;
        writer.write_i32::<LittleEndian>(self.max_tiles)?;
        writer.write_i32::<LittleEndian>(self.max_polys_per_tile)?;
        Ok(())
    }

    /// Reads parameters written by [`NavMeshParams::write_to`]
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut origin = [0.0; 3];
        for v in &mut origin {
            *v = reader.read_f32::<LittleEndian>()?;
        }
        Ok(Self {
            origin,
            tile_width: reader.read_f32::<LittleEndian>()?,
            tile_height: reader.read_f32::<LittleEndian>()?,
            max_tiles: reader.read_i32::<LittleEndian>()?,
            max_polys_per_tile: reader.read_i32::<LittleEndian>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_nav_mesh_params_binary_layout() {
        let params = NavMeshParams {
            origin: [1.0, 2.0, 3.0],
            tile_width: 38.4,
            tile_height: 38.4,
            max_tiles: 4096,
            max_polys_per_tile: 1024,
        };
        let mut buffer = Vec::new();
        params.write_to(&mut buffer).unwrap();
        assert_eq!(buffer.len(), NavMeshParams::SERIALIZED_SIZE);
        assert_eq!(&buffer[0..4], &1.0f32.to_le_bytes());
        assert_eq!(&buffer[20..24], &4096i32.to_le_bytes());

        let read = NavMeshParams::read_from(&mut Cursor::new(&buffer)).unwrap();
        assert_eq!(read, params);
    }

    #[test]
    fn test_truncated_params_fail() {
        let mut cursor = Cursor::new(vec![0u8; 10]);
        assert!(NavMeshParams::read_from(&mut cursor).is_err());
    }

    #[test]
    fn test_poly_ref() {
        assert!(!PolyRef::default().is_valid());
        assert_eq!(PolyRef::new(0x42).id(), 0x42);
        assert_eq!(PolyRef::from(7).to_string(), "0x00000007");
    }
}
