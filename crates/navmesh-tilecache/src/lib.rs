//! Compressed tile cache with dynamic obstacles
//!
//! This crate stores navigation mesh tiles as compressed heightfield layers and
//! rebuilds the affected navigation mesh tiles when obstacles are added or removed,
//! so a dynamic world never needs a full navmesh regeneration.
//!
//! # Features
//!
//! - **Tile Caching**: LZ4 compressed storage of heightfield layers
//! - **Dynamic Obstacles**: Add/remove cylinder and box obstacles
//! - **Incremental Updates**: Rebuild only the tiles an obstacle touches
//! - **Mesh Post-Processing**: Patch polygon flags and off-mesh connections per tile
//!
//! # Example
//!
//! ```rust,ignore
//! use navmesh_tilecache::{
//!     LinearAllocator, Lz4Compressor, TileCache, TileCacheConfig, TileCacheParams,
//! };
//! use glam::Vec3;
//!
//! let mut tile_cache = TileCache::new(
//!     TileCacheParams::default(),
//!     TileCacheConfig::default(),
//!     LinearAllocator::default(),
//!     Box::new(Lz4Compressor::new()),
//!     None,
//! )?;
//!
//! let tile_ref = tile_cache.add_tile(tile_data, COMPRESSED_TILE_FREE_DATA)?;
//! tile_cache.build_nav_mesh_tile(tile_ref, &mut nav_mesh)?;
//!
//! // Obstacles are carved in by update()
//! let obstacle = tile_cache.add_obstacle(Vec3::new(10.0, 0.0, 10.0), 2.0, 4.0)?;
//! while !tile_cache.update(0.0, &mut nav_mesh)? {}
//!
//! tile_cache.remove_obstacle(obstacle)?;
//! while !tile_cache.update(0.0, &mut nav_mesh)? {}
//! ```
//!
//! # Architecture
//!
//! - [`TileCache`]: Owns the compressed tiles and the obstacle queue
//! - [`TileCacheBuilder`]: Meshes a carved layer into polygons
//! - [`TileCacheLayerHeader`]: Binary header in front of every compressed layer
//! - [`LinearAllocator`]: Scratch memory for decompression and compression
//! - [`TileCacheCompressor`] and [`MeshProcess`]: Extension points

mod allocator;
mod compressor;
mod mesh_process;
mod tile_cache;
mod tile_cache_builder;
mod tile_cache_data;

pub use allocator::{Allocation, LinearAllocator, LinearAllocatorConfig};
pub use compressor::{Lz4Compressor, TileCacheCompressor};
pub use mesh_process::MeshProcess;
pub use tile_cache::*;
pub use tile_cache_builder::{mark_box_area, mark_cylinder_area, TileCacheBuilder};
pub use tile_cache_data::*;
