//! Scenario tests for the dynamic navigation mesh
//!
//! A flat 10x10 quad is split into 2x2 tiles of 64 cells; obstacles are carved
//! into it and the mesh is saved, loaded and patched tile by tile.

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use glam::{IVec2, Vec3};

    use crate::{
        DynamicNavigationMesh, NavigationEvent, NavigationMeshConfig, Obstacle,
        OffMeshConnection, StaticScene, NAVIGATION_DATA_VERSION,
    };

    type Snapshot = BTreeMap<(i32, i32), (usize, Vec<f32>)>;

    fn config() -> NavigationMeshConfig {
        DynamicNavigationMesh::default_config()
            .with_tile_size(64)
            .with_cell_size(0.3)
    }

    fn quad_scene() -> StaticScene {
        let mut scene = StaticScene::new();
        scene.add_quad(Vec3::new(-5.0, 0.0, -5.0), Vec3::new(5.0, 0.0, 5.0), 0.0);
        scene
    }

    fn built_mesh() -> DynamicNavigationMesh {
        let mut mesh = DynamicNavigationMesh::new(config()).unwrap();
        mesh.rebuild_mesh(&quad_scene(), &mut []).unwrap();
        mesh
    }

    /// Polygon count and vertices of every baked tile, keyed by cell
    fn snapshot(mesh: &DynamicNavigationMesh) -> Snapshot {
        let nav_mesh = mesh.nav_mesh().unwrap();
        mesh.get_all_tile_indices()
            .into_iter()
            .map(|index| {
                let tiles = nav_mesh.get_tiles_at(index.x, index.y);
                let polys = tiles.iter().map(|t| t.polys.len()).sum();
                let verts = tiles.iter().flat_map(|t| t.verts.iter().copied()).collect();
                ((index.x, index.y), (polys, verts))
            })
            .collect()
    }

    fn changed_cells(before: &Snapshot, after: &Snapshot) -> Vec<(i32, i32)> {
        before
            .iter()
            .filter(|(cell, tile)| after.get(cell) != Some(tile))
            .map(|(cell, _)| *cell)
            .collect()
    }

    #[test]
    fn test_rebuild_covers_quad() {
        let mesh = built_mesh();
        assert_eq!(mesh.max_tiles(), 4);
        assert_eq!(mesh.get_all_tile_indices().len(), 4);
        assert_eq!(mesh.tile_cache().unwrap().tile_count(), 4);
        assert!(mesh.is_up_to_date());

        let nearest = mesh.find_nearest_point(Vec3::new(1.0, 0.5, 1.0), Vec3::splat(1.0));
        assert!(nearest.y.abs() < 0.5);
    }

    #[test]
    fn test_obstacle_only_changes_overlapped_tiles() {
        let mut mesh = built_mesh();
        let before = snapshot(&mesh);

        let mut corner = Obstacle::new(1, Vec3::new(2.5, 0.0, 2.5), 1.0, 2.0);
        assert!(mesh.is_obstacle_in_tile(&corner, IVec2::new(0, 0)));
        assert!(!mesh.is_obstacle_in_tile(&corner, IVec2::new(-1, 0)));
        mesh.add_obstacle(&mut corner, true).unwrap();
        assert!(mesh.is_up_to_date());
        assert_eq!(changed_cells(&before, &snapshot(&mesh)), vec![(0, 0)]);
        mesh.remove_obstacle(&mut corner, true).unwrap();

        let mut center = Obstacle::new(2, Vec3::ZERO, 1.0, 2.0);
        mesh.add_obstacle(&mut center, true).unwrap();
        let changed = changed_cells(&before, &snapshot(&mesh));
        assert_eq!(changed, vec![(-1, -1), (-1, 0), (0, -1), (0, 0)]);
        for (x, z) in changed {
            assert!(mesh.is_obstacle_in_tile(&center, IVec2::new(x, z)));
        }
    }

    #[test]
    fn test_obstacle_carving_is_reversible() {
        let mut mesh = built_mesh();
        let before = snapshot(&mesh);
        let events = mesh.subscribe();

        let mut obstacle = Obstacle::new(9, Vec3::new(2.5, 0.0, 2.5), 1.0, 2.0);
        mesh.add_obstacle(&mut obstacle, false).unwrap();
        assert!(obstacle.is_tracked());
        let reference = obstacle.obstacle_id;
        assert_ne!(snapshot(&mesh), before);

        mesh.remove_obstacle(&mut obstacle, false).unwrap();
        assert!(!obstacle.is_tracked());
        assert_eq!(snapshot(&mesh), before);

        let received: Vec<NavigationEvent> = events.try_iter().collect();
        assert_eq!(
            received,
            vec![
                NavigationEvent::ObstacleAdded {
                    node_id: 9,
                    obstacle: reference,
                    position: obstacle.position,
                    radius: 1.0,
                    height: 2.0,
                },
                NavigationEvent::ObstacleRemoved {
                    node_id: 9,
                    obstacle: reference,
                    position: obstacle.position,
                    radius: 1.0,
                    height: 2.0,
                },
            ]
        );
    }

    #[test]
    fn test_obstacle_changed_follows_moves() {
        let mut mesh = built_mesh();
        let mut obstacle = Obstacle::new(3, Vec3::new(2.5, 0.0, 2.5), 1.0, 2.0);
        mesh.add_obstacle(&mut obstacle, true).unwrap();
        let at_start = snapshot(&mesh);

        obstacle.position = Vec3::new(-2.5, 0.0, -2.5);
        mesh.obstacle_changed(&mut obstacle).unwrap();
        assert!(obstacle.is_tracked());
        assert_eq!(
            changed_cells(&at_start, &snapshot(&mesh)),
            vec![(-1, -1), (0, 0)]
        );

        obstacle.position = Vec3::new(2.5, 0.0, 2.5);
        mesh.obstacle_changed(&mut obstacle).unwrap();
        assert_eq!(snapshot(&mesh), at_start);

        obstacle.enabled = false;
        mesh.obstacle_changed(&mut obstacle).unwrap();
        assert!(!obstacle.is_tracked());
        assert_eq!(mesh.tile_cache().unwrap().obstacle_count(), 0);
    }

    #[test]
    fn test_rebuild_readds_enabled_obstacles() {
        let mut mesh = DynamicNavigationMesh::new(config()).unwrap();
        let mut obstacles = vec![
            Obstacle::new(1, Vec3::new(2.5, 0.0, 2.5), 1.0, 2.0),
            Obstacle::new(2, Vec3::new(-2.5, 0.0, -2.5), 1.0, 2.0),
        ];
        obstacles[1].enabled = false;
        obstacles[1].obstacle_id = 77;

        mesh.rebuild_mesh(&quad_scene(), &mut obstacles).unwrap();
        assert!(obstacles[0].is_tracked());
        assert!(!obstacles[1].is_tracked());
        assert_eq!(mesh.tile_cache().unwrap().obstacle_count(), 1);
    }

    #[test]
    fn test_batched_obstacles_need_several_updates() {
        let mut mesh = built_mesh();
        let tile_cache = mesh.tile_cache_mut().unwrap();
        for i in 0..3 {
            let offset = i as f32 * 0.5;
            tile_cache
                .add_obstacle(Vec3::new(offset, 0.0, offset), 1.0, 2.0)
                .unwrap();
        }
        assert!(!mesh.is_up_to_date());

        // One tile is rebuilt per update and the obstacles touch all four
        assert!(!mesh.update_step().unwrap());
        assert!(!mesh.is_up_to_date());

        let mut steps = 1;
        while !mesh.update_step().unwrap() {
            steps += 1;
            assert!(steps < 16);
        }
        assert!(mesh.is_up_to_date());
        assert_eq!(mesh.tile_cache().unwrap().obstacle_count(), 3);
    }

    #[test]
    fn test_update_drains_queued_obstacles() {
        let mut mesh = built_mesh();
        mesh.tile_cache_mut()
            .unwrap()
            .add_obstacle(Vec3::ZERO, 1.0, 2.0)
            .unwrap();
        mesh.update().unwrap();
        assert!(mesh.is_up_to_date());
    }

    #[test]
    fn test_build_tile_is_idempotent() {
        let mut mesh = built_mesh();
        let scene = quad_scene();
        let first = mesh.build_tile(&scene.geometries, 0, 0);
        let second = mesh.build_tile(&scene.geometries, 0, 0);
        assert!(!first.is_empty());
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a[..54], b[..54]);
        }
    }

    #[test]
    fn test_build_tile_clears_baked_layers() {
        let mut mesh = built_mesh();
        let scene = quad_scene();
        let layers = mesh.build_tile(&scene.geometries, 0, 0);
        assert_eq!(layers.len(), 1);

        // Baked and cached layers are gone together
        assert!(!mesh.has_tile(IVec2::ZERO));
        assert!(mesh.get_tile_data(IVec2::ZERO).is_empty());
        assert!(mesh.tile_cache().unwrap().get_tiles_at(0, 0).is_empty());

        mesh.build_tiles(&scene, IVec2::ZERO, IVec2::ZERO).unwrap();
        let before = snapshot(&mesh);
        let mut obstacle = Obstacle::new(1, Vec3::new(2.5, 0.0, 2.5), 1.0, 2.0);
        mesh.add_obstacle(&mut obstacle, true).unwrap();
        assert_eq!(changed_cells(&before, &snapshot(&mesh)), vec![(0, 0)]);
        assert!(!mesh.get_tile_data(IVec2::ZERO).is_empty());
    }

    #[test]
    fn test_full_cache_leaves_no_unbaked_layers() {
        // Two stacked floors give every cell two layers
        let mut scene = StaticScene::new();
        scene.add_quad(Vec3::new(1.0, 0.0, 1.0), Vec3::new(37.0, 0.0, 10.0), 0.0);
        scene.add_quad(Vec3::new(1.0, 0.0, 1.0), Vec3::new(37.0, 0.0, 10.0), 5.0);

        let mut mesh = DynamicNavigationMesh::new(config()).unwrap();
        mesh.set_max_layers(3);
        mesh.allocate_mesh(1).unwrap();
        let built = mesh
            .build_tiles(&scene, IVec2::new(0, 0), IVec2::new(1, 0))
            .unwrap();

        // The second cell only finds one free slot for its two layers
        assert_eq!(built, 1);
        let tile_cache = mesh.tile_cache().unwrap();
        assert_eq!(tile_cache.get_tiles_at(0, 0).len(), 2);
        assert!(tile_cache.get_tiles_at(1, 0).is_empty());
        assert!(!mesh.has_tile(IVec2::new(1, 0)));

        let nav_mesh = mesh.nav_mesh().unwrap();
        assert_eq!(nav_mesh.tile_count(), tile_cache.tile_count());
        for (_, tile) in tile_cache.tiles() {
            let h = tile.header;
            assert!(nav_mesh.get_tile_at(h.tx, h.ty, h.tlayer).is_some());
        }
    }

    #[test]
    fn test_tile_data_round_trip() {
        let source = built_mesh();
        let data = source.get_tile_data(IVec2::ZERO);
        assert!(!data.is_empty());

        let mut target = DynamicNavigationMesh::new(config()).unwrap();
        target.allocate_mesh(source.max_tiles()).unwrap();
        let events = target.subscribe();
        target.add_tile(&data).unwrap();

        assert_eq!(target.get_all_tile_indices(), vec![IVec2::ZERO]);
        assert_eq!(
            snapshot(&target).get(&(0, 0)),
            snapshot(&source).get(&(0, 0))
        );
        assert_eq!(target.get_tile_data(IVec2::ZERO), data);
        assert_eq!(
            events.try_recv().unwrap(),
            NavigationEvent::TileAdded { tile: IVec2::ZERO }
        );

        // The cell is taken now
        assert!(target.add_tile(&data).is_err());
        assert_eq!(target.tile_cache().unwrap().get_tiles_at(0, 0).len(), 1);
    }

    #[test]
    fn test_malformed_tile_data_is_rejected() {
        let source = built_mesh();
        let data = source.get_tile_data(IVec2::ZERO);
        let mut target = DynamicNavigationMesh::new(config()).unwrap();
        target.allocate_mesh(source.max_tiles()).unwrap();

        let truncated = &data[..data.len() - 10];
        assert!(target.add_tile(truncated).is_err());

        let mut oversized = data.clone();
        oversized[54..58].copy_from_slice(&i32::MAX.to_le_bytes());
        assert!(target.add_tile(&oversized).is_err());

        // Magic of the tile data behind the record header
        let mut corrupted = data.clone();
        corrupted[58] ^= 0xff;
        assert!(target.add_tile(&corrupted).is_err());

        // A valid record followed by a broken one inserts nothing
        let mut mixed = data.clone();
        mixed.extend_from_slice(&truncated[..40]);
        assert!(target.add_tile(&mixed).is_err());

        assert!(target.tile_cache().unwrap().get_tiles_at(0, 0).is_empty());
        assert!(!target.has_tile(IVec2::ZERO));
    }

    #[test]
    fn test_remove_tiles_clears_cache() {
        let mut mesh = built_mesh();
        mesh.remove_tile(IVec2::ZERO).unwrap();
        assert!(!mesh.has_tile(IVec2::ZERO));
        assert!(mesh.tile_cache().unwrap().get_tiles_at(0, 0).is_empty());
        assert!(mesh.get_tile_data(IVec2::ZERO).is_empty());

        mesh.remove_all_tiles().unwrap();
        assert!(mesh.get_all_tile_indices().is_empty());
        assert_eq!(mesh.tile_cache().unwrap().tile_count(), 0);
    }

    #[test]
    fn test_navigation_data_round_trip() {
        let mut source = built_mesh();
        let mut obstacle = Obstacle::new(1, Vec3::new(2.5, 0.0, 2.5), 1.0, 2.0);
        source.add_obstacle(&mut obstacle, true).unwrap();
        source.remove_obstacle(&mut obstacle, true).unwrap();
        let blob = source.navigation_data();

        let mut target = DynamicNavigationMesh::new(
            DynamicNavigationMesh::default_config().with_tile_size(32),
        )
        .unwrap();
        target.set_navigation_data(&blob).unwrap();

        assert_eq!(target.config().tile_size, 64);
        assert_eq!(target.config().cell_size, 0.3);
        assert_eq!(snapshot(&target), snapshot(&source));
        assert_eq!(target.navigation_data(), blob);
    }

    #[test]
    fn test_navigation_data_version_gate() {
        let source = built_mesh();
        let blob = source.navigation_data();
        // bounding box, then two unused fields, then the version
        assert_eq!(blob[32..36], NAVIGATION_DATA_VERSION.to_le_bytes());

        let mut wrong_version = blob.clone();
        wrong_version[32..36].copy_from_slice(&(NAVIGATION_DATA_VERSION + 1).to_le_bytes());
        let mut target = built_mesh();
        assert!(target.set_navigation_data(&wrong_version).is_err());
        assert!(target.nav_mesh().is_none());
        assert!(target.tile_cache().is_none());
        assert!(target.get_all_tile_indices().is_empty());

        let mut unused_set = blob.clone();
        unused_set[24] = 1;
        assert!(target.set_navigation_data(&unused_set).is_err());
        assert!(target.nav_mesh().is_none());
    }

    #[test]
    fn test_malformed_navigation_data_discards_everything() {
        let source = built_mesh();
        let blob = source.navigation_data();
        let mut target = DynamicNavigationMesh::new(config()).unwrap();

        assert!(target.set_navigation_data(&blob[..blob.len() - 5]).is_err());
        assert!(target.nav_mesh().is_none());
        assert!(target.tile_cache().is_none());

        // Empty data only releases
        target.set_navigation_data(&blob).unwrap();
        target.set_navigation_data(&[]).unwrap();
        assert!(target.nav_mesh().is_none());
    }

    #[test]
    fn test_off_mesh_connections_reach_cached_tiles() {
        let mut scene = quad_scene();
        scene.add_connection(OffMeshConnection::new(
            Vec3::new(2.0, 0.0, 2.0),
            Vec3::new(-2.0, 0.0, 2.0),
            0.5,
        ));

        let mut mesh = DynamicNavigationMesh::new(config()).unwrap();
        mesh.set_off_mesh_connection_source(Some(Arc::new(scene.clone())));
        mesh.rebuild_mesh(&scene, &mut []).unwrap();

        let nav_mesh = mesh.nav_mesh().unwrap();
        assert_eq!(
            nav_mesh.get_tile_at(0, 0, 0).unwrap().off_mesh_connections.len(),
            1
        );

        // Carving rebuilds the tile through the tile cache; the link survives
        let mut obstacle = Obstacle::new(1, Vec3::new(4.0, 0.0, 4.0), 0.5, 2.0);
        mesh.add_obstacle(&mut obstacle, true).unwrap();
        let nav_mesh = mesh.nav_mesh().unwrap();
        assert_eq!(
            nav_mesh.get_tile_at(0, 0, 0).unwrap().off_mesh_connections.len(),
            1
        );
    }

    #[test]
    fn test_partial_rebuild_sends_events() {
        let mut mesh = DynamicNavigationMesh::new(config()).unwrap();
        assert!(mesh
            .build_tiles(&quad_scene(), IVec2::ZERO, IVec2::ZERO)
            .is_err());

        mesh.allocate_mesh(4).unwrap();
        let events = mesh.subscribe();
        let built = mesh
            .build_tiles(&quad_scene(), IVec2::new(-1, 0), IVec2::ZERO)
            .unwrap();
        assert_eq!(built, 2);

        let received: Vec<NavigationEvent> = events.try_iter().collect();
        assert!(received.contains(&NavigationEvent::TileAdded {
            tile: IVec2::new(-1, 0)
        }));
        assert!(received.contains(&NavigationEvent::TileAdded { tile: IVec2::ZERO }));
        assert_eq!(
            received
                .iter()
                .filter(|e| matches!(e, NavigationEvent::AreaRebuilt { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn test_paths_route_around_obstacles() {
        let mut mesh = built_mesh();
        // Off the tile seams so the straight path has no corners
        let start = Vec3::new(-3.0, 0.0, 1.0);
        let end = Vec3::new(3.0, 0.0, 1.0);
        let extents = Vec3::new(1.0, 2.0, 1.0);
        assert_eq!(mesh.find_path(start, end, extents).len(), 2);
        assert!(!mesh.raycast(start, end, extents).hit);

        let mut pillar = Obstacle::new(4, Vec3::new(0.0, 0.0, 1.0), 1.0, 2.0);
        mesh.add_obstacle(&mut pillar, true).unwrap();
        assert!(mesh.is_up_to_date());

        let path = mesh.find_path(start, end, extents);
        assert!(path.len() >= 3, "{path:?}");
        for corner in &path[1..path.len() - 1] {
            assert!(corner.x.hypot(corner.z - 1.0) > 0.7, "{corner}");
        }
        let ray = mesh.raycast(start, end, extents);
        assert!(ray.hit);
        assert!(ray.position.x < -0.5, "{}", ray.position);

        mesh.remove_obstacle(&mut pillar, true).unwrap();
        assert_eq!(mesh.find_path(start, end, extents).len(), 2);
    }

    #[test]
    fn test_query_settings_reach_base_mesh() {
        let mut mesh = built_mesh();
        mesh.set_area_cost(7, 3.0);
        assert_eq!(mesh.area_cost(7), 3.0);
        assert_eq!(mesh.base().area_cost(7), 3.0);

        mesh.set_random_seed(11);
        let first = mesh.get_random_point();
        mesh.set_random_seed(11);
        assert_eq!(mesh.get_random_point(), first);
        assert!(first.x.abs() <= 5.0 && first.z.abs() <= 5.0, "{first}");
    }
}
