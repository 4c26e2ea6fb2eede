//! Per-tile working set of a build

use glam::Vec3;
use navmesh_common::BoundingBox;
use navmesh_voxel::AreaBox;

use crate::scene::{GeometryKind, NavigationGeometryInfo};

/// Geometry gathered for one tile, in mesh space
#[derive(Debug, Default)]
pub struct NavBuildData {
    pub vertices: Vec<Vec3>,
    pub indices: Vec<u32>,
    /// Area volumes stamped after erosion
    pub nav_areas: Vec<AreaBox>,
}

impl NavBuildData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gathers every geometry whose bounds overlap `bounds`
    pub fn collect(geometries: &[NavigationGeometryInfo], bounds: &BoundingBox) -> Self {
        let mut build = Self::new();
        for info in geometries.iter().filter(|g| g.bounding_box.intersects(bounds)) {
            build.add_geometry(info);
        }
        build
    }

    pub fn add_geometry(&mut self, info: &NavigationGeometryInfo) {
        match &info.kind {
            GeometryKind::Mesh { vertices, indices } => {
                let base = self.vertices.len() as u32;
                self.vertices
                    .extend(vertices.iter().map(|&v| info.transform.transform_point3(v)));
                let triangles = indices.len() / 3;
                self.indices
                    .extend(indices[..triangles * 3].iter().map(|&i| i + base));
            }
            GeometryKind::Area => self.nav_areas.push(AreaBox {
                bmin: info.bounding_box.min,
                bmax: info.bounding_box.max,
                area_id: info.area_id,
            }),
        }
    }

    /// Whether there is no triangle to rasterize
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.indices.is_empty()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}
