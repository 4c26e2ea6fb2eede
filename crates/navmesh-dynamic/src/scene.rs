//! Narrow interfaces to the world the navigation mesh is built from
//!
//! The navigation mesh never walks a scene graph itself. Callers hand it geometry
//! through [`GeometryProvider`], off-mesh links through [`OffMeshConnectionSource`]
//! and obstacle records they own. All positions are in the mesh's local space.

use glam::{Mat4, Vec3};
use navmesh_common::BoundingBox;
use navmesh_detour::PolyFlags;
use navmesh_tilecache::ObstacleRef;

/// What a [`NavigationGeometryInfo`] contributes to a tile build
#[derive(Debug, Clone, PartialEq)]
pub enum GeometryKind {
    /// Triangle soup in the geometry's own space, mapped by `transform`
    Mesh { vertices: Vec<Vec3>, indices: Vec<u32> },
    /// Box volume stamping `area_id` onto the walkable surface it contains
    Area,
}

/// One piece of input geometry
#[derive(Debug, Clone, PartialEq)]
pub struct NavigationGeometryInfo {
    /// Geometry space to mesh space
    pub transform: Mat4,
    /// Bounds in mesh space
    pub bounding_box: BoundingBox,
    pub area_id: u8,
    pub kind: GeometryKind,
}

impl NavigationGeometryInfo {
    /// A triangle mesh; the bounds are computed from the transformed vertices
    pub fn mesh(transform: Mat4, vertices: Vec<Vec3>, indices: Vec<u32>) -> Self {
        let mut bounding_box = BoundingBox::empty();
        for v in &vertices {
            bounding_box.merge_point(transform.transform_point3(*v));
        }
        Self {
            transform,
            bounding_box,
            area_id: navmesh_voxel::WALKABLE_AREA,
            kind: GeometryKind::Mesh { vertices, indices },
        }
    }

    /// An area volume covering `bounds`
    pub fn area(bounds: BoundingBox, area_id: u8) -> Self {
        Self {
            transform: Mat4::IDENTITY,
            bounding_box: bounds,
            area_id,
            kind: GeometryKind::Area,
        }
    }
}

/// Supplies the geometry navigation is built from
pub trait GeometryProvider {
    fn collect_geometries(&self) -> Vec<NavigationGeometryInfo>;
}

/// Link between two points that is not part of the walkable surface
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct OffMeshConnection {
    pub start: Vec3,
    pub end: Vec3,
    pub radius: f32,
    pub flags: PolyFlags,
    pub area: u8,
    pub bidirectional: bool,
    pub user_id: u32,
}

impl OffMeshConnection {
    /// A bidirectional walkable connection
    pub fn new(start: Vec3, end: Vec3, radius: f32) -> Self {
        Self {
            start,
            end,
            radius,
            flags: PolyFlags::WALK,
            area: navmesh_voxel::WALKABLE_AREA,
            bidirectional: true,
            user_id: 0,
        }
    }
}

/// Supplies the off-mesh connections of the scene.
///
/// Queried on every tile build, so the answer must reflect the current scene.
pub trait OffMeshConnectionSource: Send + Sync {
    /// Connections that may start inside `bounds`
    fn collect_off_mesh_connections(&self, bounds: &BoundingBox) -> Vec<OffMeshConnection>;
}

/// Cylindrical obstacle owned by the caller.
///
/// `obstacle_id` is issued by the navigation mesh when the obstacle is added and is
/// `0` while the obstacle is not tracked.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Obstacle {
    /// Id of the scene node the obstacle belongs to
    pub node_id: u32,
    /// Center of the cylinder base
    pub position: Vec3,
    pub radius: f32,
    pub height: f32,
    pub enabled: bool,
    #[cfg_attr(feature = "serialization", serde(skip))]
    pub obstacle_id: ObstacleRef,
}

impl Obstacle {
    pub fn new(node_id: u32, position: Vec3, radius: f32, height: f32) -> Self {
        Self {
            node_id,
            position,
            radius,
            height,
            enabled: true,
            obstacle_id: 0,
        }
    }

    /// Whether the navigation mesh currently tracks this obstacle
    pub fn is_tracked(&self) -> bool {
        self.obstacle_id != 0
    }
}

/// In-memory scene: a fixed geometry list plus off-mesh connections
#[derive(Debug, Clone, Default)]
pub struct StaticScene {
    pub geometries: Vec<NavigationGeometryInfo>,
    pub connections: Vec<OffMeshConnection>,
}

impl StaticScene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an axis-aligned quad at height `y` spanning `min..max` on the XZ plane
    pub fn add_quad(&mut self, min: Vec3, max: Vec3, y: f32) -> &mut Self {
        let vertices = vec![
            Vec3::new(min.x, y, min.z),
            Vec3::new(max.x, y, min.z),
            Vec3::new(max.x, y, max.z),
            Vec3::new(min.x, y, max.z),
        ];
        self.add_mesh(Mat4::IDENTITY, vertices, vec![0, 2, 1, 0, 3, 2])
    }

    pub fn add_mesh(&mut self, transform: Mat4, vertices: Vec<Vec3>, indices: Vec<u32>) -> &mut Self {
        self.geometries
            .push(NavigationGeometryInfo::mesh(transform, vertices, indices));
        self
    }

    pub fn add_area(&mut self, bounds: BoundingBox, area_id: u8) -> &mut Self {
        self.geometries
            .push(NavigationGeometryInfo::area(bounds, area_id));
        self
    }

    pub fn add_connection(&mut self, connection: OffMeshConnection) -> &mut Self {
        self.connections.push(connection);
        self
    }
}

impl GeometryProvider for StaticScene {
    fn collect_geometries(&self) -> Vec<NavigationGeometryInfo> {
        self.geometries.clone()
    }
}

impl OffMeshConnectionSource for StaticScene {
    fn collect_off_mesh_connections(&self, bounds: &BoundingBox) -> Vec<OffMeshConnection> {
        self.connections
            .iter()
            .filter(|c| {
                c.start.x >= bounds.min.x
                    && c.start.x <= bounds.max.x
                    && c.start.z >= bounds.min.z
                    && c.start.z <= bounds.max.z
            })
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_bounds_follow_transform() {
        let info = NavigationGeometryInfo::mesh(
            Mat4::from_translation(Vec3::new(10.0, 1.0, 0.0)),
            vec![Vec3::ZERO, Vec3::new(2.0, 0.0, 3.0)],
            vec![],
        );
        assert_eq!(info.bounding_box.min, Vec3::new(10.0, 1.0, 0.0));
        assert_eq!(info.bounding_box.max, Vec3::new(12.0, 1.0, 3.0));
    }

    #[test]
    fn test_static_scene_filters_connections_by_start() {
        let mut scene = StaticScene::new();
        scene
            .add_connection(OffMeshConnection::new(Vec3::new(1.0, 0.0, 1.0), Vec3::new(30.0, 0.0, 1.0), 0.5))
            .add_connection(OffMeshConnection::new(Vec3::new(30.0, 0.0, 1.0), Vec3::new(1.0, 0.0, 1.0), 0.5));
        let bounds = BoundingBox::new(Vec3::ZERO, Vec3::new(10.0, 5.0, 10.0));
        let found = scene.collect_off_mesh_connections(&bounds);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].start.x, 1.0);
    }

    #[test]
    fn test_obstacle_starts_untracked() {
        let obstacle = Obstacle::new(7, Vec3::ZERO, 1.0, 2.0);
        assert!(!obstacle.is_tracked());
        assert!(obstacle.enabled);
    }
}
