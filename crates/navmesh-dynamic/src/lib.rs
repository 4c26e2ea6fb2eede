//! Tiled navigation meshes built from scene geometry
//!
//! This crate turns the geometry of a scene into a tiled navigation mesh and keeps
//! it up to date while the scene changes. Tiles can be rebuilt one by one, saved
//! and loaded, and patched by cylinder obstacles without touching the geometry.
//!
//! # Features
//!
//! - **Tiled Builds**: Rebuild the whole mesh, a region or a single tile
//! - **Dynamic Obstacles**: Obstacles are carved into cached layers, never re-voxelized
//! - **Persistence**: Versioned binary blob for the whole mesh or one tile
//! - **Off-Mesh Connections**: Spliced into every baked tile from a scene source
//! - **Events**: Tile and obstacle changes are broadcast over channels
//! - **Queries**: Paths, raycasts, wall distances and random points with area costs
//!
//! # Example
//!
//! ```rust,ignore
//! use glam::Vec3;
//! use navmesh_dynamic::{DynamicNavigationMesh, Obstacle, StaticScene};
//!
//! let mut scene = StaticScene::new();
//! scene.add_quad(Vec3::new(-10.0, 0.0, -10.0), Vec3::new(10.0, 0.0, 10.0), 0.0);
//!
//! let mut mesh = DynamicNavigationMesh::new(DynamicNavigationMesh::default_config())?;
//! mesh.rebuild_mesh(&scene, &mut [])?;
//!
//! let mut crate_box = Obstacle::new(1, Vec3::new(2.0, 0.0, 2.0), 1.0, 2.0);
//! mesh.add_obstacle(&mut crate_box, false)?;
//!
//! let saved = mesh.navigation_data();
//! mesh.set_navigation_data(&saved)?;
//! ```
//!
//! # Architecture
//!
//! - [`NavigationMesh`]: Tiling, voxelization and queries; bakes layers directly
//! - [`DynamicNavigationMesh`]: Routes layers through a tile cache and owns obstacles
//! - [`scene`]: The narrow interfaces geometry, connections and obstacles come through
//! - [`SceneMeshProcess`]: Per-tile polygon flags and off-mesh connections
//! - [`NavigationEvent`]: Notifications sent to subscribers

pub mod build_data;
pub mod config;
pub mod dynamic_navigation_mesh;
pub mod events;
pub mod mesh_process;
pub mod navigation_mesh;
pub mod scene;

#[cfg(test)]
mod dynamic_navigation_tests;

pub use build_data::NavBuildData;
pub use config::{NavigationMeshConfig, MAX_LAYERS, MIN_LAYERS};
pub use dynamic_navigation_mesh::DynamicNavigationMesh;
pub use events::{EventBus, NavigationEvent};
pub use mesh_process::SceneMeshProcess;
pub use navigation_mesh::{
    calculate_bounding_box, calculate_max_tiles, NavigationMesh, NavigationPathPoint,
    NavigationRaycast, DEFAULT_MAX_VISITED, NAVIGATION_DATA_VERSION,
};
pub use scene::{
    GeometryKind, GeometryProvider, NavigationGeometryInfo, Obstacle, OffMeshConnection,
    OffMeshConnectionSource, StaticScene,
};
