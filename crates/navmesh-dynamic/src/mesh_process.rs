//! Scene-backed post-processing of tile polygons

use std::sync::Arc;

use glam::Vec3;
use navmesh_common::BoundingBox;
use navmesh_detour::{NavMeshCreateParams, PolyFlags};
use navmesh_tilecache::MeshProcess;
use navmesh_voxel::NULL_AREA;

use crate::scene::{OffMeshConnection, OffMeshConnectionSource};

/// Marks walkable polygons and splices the scene's off-mesh connections into
/// every tile built by the tile cache.
///
/// The connection arrays are cached and only rebuilt when the queried set differs
/// from the previous one.
#[derive(Default)]
pub struct SceneMeshProcess {
    source: Option<Arc<dyn OffMeshConnectionSource>>,
    connections: Vec<OffMeshConnection>,
    verts: Vec<[f32; 6]>,
    radii: Vec<f32>,
    flags: Vec<PolyFlags>,
    areas: Vec<u8>,
    dirs: Vec<u8>,
    user_ids: Vec<u32>,
}

impl SceneMeshProcess {
    pub fn new(source: Option<Arc<dyn OffMeshConnectionSource>>) -> Self {
        Self {
            source,
            ..Default::default()
        }
    }

    fn rebuild_arrays(&mut self, connections: Vec<OffMeshConnection>) {
        self.verts.clear();
        self.radii.clear();
        self.flags.clear();
        self.areas.clear();
        self.dirs.clear();
        self.user_ids.clear();
        for c in &connections {
            self.verts
                .push([c.start.x, c.start.y, c.start.z, c.end.x, c.end.y, c.end.z]);
            self.radii.push(c.radius);
            self.flags.push(c.flags);
            self.areas.push(c.area);
            self.dirs.push(u8::from(c.bidirectional));
            self.user_ids.push(c.user_id);
        }
        self.connections = connections;
    }
}

impl MeshProcess for SceneMeshProcess {
    fn process(&mut self, params: &mut NavMeshCreateParams) {
        for (flags, &area) in params.poly_flags.iter_mut().zip(&params.poly_areas) {
            if area != NULL_AREA {
                *flags = PolyFlags::WALK;
            }
        }

        let Some(source) = self.source.as_ref() else {
            return;
        };
        let bounds = BoundingBox::new(Vec3::from(params.bmin), Vec3::from(params.bmax));
        let connections = source.collect_off_mesh_connections(&bounds);
        if connections.is_empty() {
            return;
        }
        if connections != self.connections {
            self.rebuild_arrays(connections);
        }

        params.off_mesh_con_verts = self.verts.clone();
        params.off_mesh_con_rad = self.radii.clone();
        params.off_mesh_con_flags = self.flags.clone();
        params.off_mesh_con_areas = self.areas.clone();
        params.off_mesh_con_dir = self.dirs.clone();
        params.off_mesh_con_user_id = self.user_ids.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::StaticScene;
    use navmesh_detour::MESH_NULL_IDX;

    fn params() -> NavMeshCreateParams {
        let n = MESH_NULL_IDX;
        NavMeshCreateParams {
            verts: vec![[0, 0, 0], [10, 0, 0], [10, 0, 10], [0, 0, 10]],
            polys: vec![[0, 3, 2, 1, n, n], [0, 3, 2, n, n, n]],
            poly_neighbors: vec![[n; 6]; 2],
            poly_flags: vec![PolyFlags::empty(); 2],
            poly_areas: vec![63, NULL_AREA],
            bmin: [0.0, 0.0, 0.0],
            bmax: [10.0, 2.0, 10.0],
            cs: 1.0,
            ch: 0.2,
            ..Default::default()
        }
    }

    #[test]
    fn test_flags_follow_areas() {
        let mut process = SceneMeshProcess::new(None);
        let mut params = params();
        process.process(&mut params);
        assert_eq!(params.poly_flags, vec![PolyFlags::WALK, PolyFlags::empty()]);
        assert_eq!(params.off_mesh_con_count(), 0);
    }

    #[test]
    fn test_connections_are_spliced_and_refreshed() {
        let mut scene = StaticScene::new();
        scene.add_connection(OffMeshConnection::new(
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(20.0, 0.0, 1.0),
            0.5,
        ));
        let mut process = SceneMeshProcess::new(Some(Arc::new(scene.clone())));

        let mut first = params();
        process.process(&mut first);
        assert_eq!(first.off_mesh_con_count(), 1);
        assert_eq!(first.off_mesh_con_verts[0][3], 20.0);
        assert_eq!(first.off_mesh_con_dir, vec![1]);

        // Same count, moved endpoint: the cached arrays must not be reused
        scene.connections[0].end = Vec3::new(25.0, 0.0, 1.0);
        process.source = Some(Arc::new(scene));
        let mut second = params();
        process.process(&mut second);
        assert_eq!(second.off_mesh_con_count(), 1);
        assert_eq!(second.off_mesh_con_verts[0][3], 25.0);
    }
}
