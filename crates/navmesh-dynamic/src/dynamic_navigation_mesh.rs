//! Navigation mesh with runtime obstacles
//!
//! Every tile is stored twice: as compressed heightfield layers in a [`TileCache`]
//! and as baked polygons in the [`NavMesh`]. Obstacles are carved into the cached
//! layers and only the touched tiles are baked again, so adding or removing an
//! obstacle never re-voxelizes geometry.
//!
//! # Persisted format
//!
//! [`DynamicNavigationMesh::navigation_data`] writes, little-endian:
//!
//! ```text
//! BoundingBox      6 x f32, always empty
//! i32              0
//! i32              0
//! i32              NAVIGATION_DATA_VERSION
//! NavMeshParams    28 bytes
//! TileCacheParams  52 bytes
//! { TileCacheLayerHeader (54 bytes), i32 size, u8[size] tile data } until the end
//! ```
//!
//! [`DynamicNavigationMesh::get_tile_data`] and [`DynamicNavigationMesh::add_tile`]
//! use the same record layout for the layers of one cell.

use std::collections::BTreeSet;
use std::io::Cursor;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use glam::{IVec2, Vec3};
use navmesh_common::{BoundingBox, Deserializer, Error, Result, Serializer};
use navmesh_detour::{NavMesh, NavMeshParams, PolyRef, QueryFilter, Status, WallHit};
use navmesh_tilecache::{
    CompressedTile, CompressedTileRef, LinearAllocator, Lz4Compressor, MeshProcess, TileCache,
    TileCacheLayerHeader, TileCacheParams, COMPRESSED_TILE_FREE_DATA,
};
use navmesh_voxel::PartitionType;

use crate::config::{NavigationMeshConfig, MAX_LAYERS, MIN_LAYERS};
use crate::events::NavigationEvent;
use crate::mesh_process::SceneMeshProcess;
use crate::navigation_mesh::{
    calculate_bounding_box, layer_header, read_preamble, write_preamble, NavigationMesh,
    NavigationPathPoint, NavigationRaycast,
};
use crate::scene::{GeometryProvider, NavigationGeometryInfo, Obstacle, OffMeshConnectionSource};

/// One persisted tile layer
struct TileRecord {
    header: TileCacheLayerHeader,
    data: Vec<u8>,
}

fn write_tile_record<S: Serializer>(dest: &mut S, tile: &CompressedTile) -> Result<()> {
    tile.header.write_to(dest)?;
    dest.write_i32::<LittleEndian>(tile.data.len() as i32)?;
    dest.write_all(&tile.data)?;
    Ok(())
}

fn read_tile_record<D: Deserializer>(source: &mut D) -> Result<TileRecord> {
    let header = TileCacheLayerHeader::read_from(source)?;
    let size = source.read_i32::<LittleEndian>()?;
    if size <= TileCacheLayerHeader::SERIALIZED_SIZE as i32 || size as usize > source.remaining() {
        return Err(Error::Detour(Status::DataCorrupted.to_string()));
    }

    let mut data = vec![0u8; size as usize];
    source.read_exact(&mut data)?;
    // The record header must describe the tile it precedes
    if TileCacheLayerHeader::from_bytes(&data)? != header {
        return Err(Error::Detour(Status::DataCorrupted.to_string()));
    }
    Ok(TileRecord { header, data })
}

fn read_tile_records<D: Deserializer>(source: &mut D) -> Result<Vec<TileRecord>> {
    let mut records = Vec::new();
    while !source.is_eof() {
        records.push(read_tile_record(source)?);
    }
    Ok(records)
}

fn not_allocated() -> Error {
    Error::TileCache("navigation mesh is not allocated".to_string())
}

/// Tiled navigation mesh whose tiles can be patched by obstacles at runtime
pub struct DynamicNavigationMesh {
    base: NavigationMesh,
    tile_cache: Option<TileCache>,
}

impl DynamicNavigationMesh {
    /// Defaults of a dynamic mesh: monotone partitioning, the rest as the base mesh
    pub fn default_config() -> NavigationMeshConfig {
        NavigationMeshConfig::default().with_partition_type(PartitionType::Monotone)
    }

    pub fn new(config: NavigationMeshConfig) -> Result<Self> {
        Ok(Self {
            base: NavigationMesh::new(config)?,
            tile_cache: None,
        })
    }

    /// The static part of the mesh: configuration, tiling and queries
    pub fn base(&self) -> &NavigationMesh {
        &self.base
    }

    pub fn config(&self) -> &NavigationMeshConfig {
        self.base.config()
    }

    pub fn nav_mesh(&self) -> Option<&NavMesh> {
        self.base.nav_mesh()
    }

    pub fn tile_cache(&self) -> Option<&TileCache> {
        self.tile_cache.as_ref()
    }

    /// Direct access for batching obstacle requests.
    ///
    /// Requests queued here are applied by [`DynamicNavigationMesh::update_step`]
    /// or [`DynamicNavigationMesh::update`].
    pub fn tile_cache_mut(&mut self) -> Option<&mut TileCache> {
        self.tile_cache.as_mut()
    }

    pub fn subscribe(&mut self) -> Receiver<NavigationEvent> {
        self.base.subscribe()
    }

    pub fn set_partition_type(&mut self, partition_type: PartitionType) {
        self.base.set_partition_type(partition_type);
    }

    /// Sets where off-mesh connections come from. Tiles baked from now on use it.
    pub fn set_off_mesh_connection_source(&mut self, source: Option<Arc<dyn OffMeshConnectionSource>>) {
        self.base.set_off_mesh_connection_source(source.clone());
        if let Some(tile_cache) = self.tile_cache.as_mut() {
            tile_cache.set_mesh_process(Some(Box::new(SceneMeshProcess::new(source))));
        }
    }

    /// Maximum number of layers per tile, used by the next allocation
    pub fn set_max_layers(&mut self, max_layers: u32) {
        self.base.config_mut().max_layers = max_layers.clamp(MIN_LAYERS, MAX_LAYERS);
    }

    /// Maximum number of obstacles, used by the next allocation
    pub fn set_max_obstacles(&mut self, max_obstacles: u32) {
        self.base.config_mut().max_obstacles = max_obstacles;
    }

    /// Tile capacity per cell of the last allocation
    pub fn max_tiles(&self) -> u32 {
        self.base.max_tiles()
    }

    pub fn release(&mut self) {
        self.base.release();
        self.tile_cache = None;
    }

    /// Creates an empty mesh and tile cache for `max_tiles` cells of
    /// `max_layers` layers each.
    pub fn allocate_mesh(&mut self, max_tiles: u32) -> Result<()> {
        self.release();

        let config = self.base.config();
        let capacity = max_tiles
            .checked_mul(config.max_layers)
            .ok_or_else(|| Error::Detour(Status::InvalidParam.to_string()))?;
        let params = self.base.tile_cache_params(capacity, config.max_obstacles);
        let cache_config = config.tile_cache;
        let allocator = LinearAllocator::new(config.allocator);
        self.base.allocate_mesh(capacity)?;

        let mesh_process: Box<dyn MeshProcess> =
            Box::new(SceneMeshProcess::new(self.base.off_mesh_connection_source()));
        match TileCache::new(
            params,
            cache_config,
            allocator,
            Box::new(Lz4Compressor::new()),
            Some(mesh_process),
        ) {
            Ok(tile_cache) => {
                self.tile_cache = Some(tile_cache);
                self.base.set_max_tiles(max_tiles);
                Ok(())
            }
            Err(e) => {
                log::error!("Could not initialize tile cache: {}", e);
                self.release();
                Err(e)
            }
        }
    }

    /// Allocates an empty mesh with the current tile capacity
    pub fn allocate(&mut self) -> Result<()> {
        self.allocate_mesh(self.base.max_tiles())?;
        log::debug!(
            "Allocated empty dynamic navigation mesh with max {} tiles",
            self.base.max_tiles()
        );
        self.base.send_event(NavigationEvent::NavigationMeshRebuilt);
        Ok(())
    }

    /// Reallocates the mesh to fit the geometry, builds every tile and adds the
    /// enabled obstacles again.
    ///
    /// Every obstacle's id is reset first; enabled obstacles receive a new one.
    pub fn rebuild_mesh(
        &mut self,
        geometry: &dyn GeometryProvider,
        obstacles: &mut [Obstacle],
    ) -> Result<()> {
        let geometries = geometry.collect_geometries();
        let bounds = calculate_bounding_box(&geometries, self.config().padding);
        let max_tiles = self.base.plan_max_tiles(&bounds);
        self.allocate_mesh(max_tiles)?;

        if !bounds.is_empty() {
            let from = self.get_tile_index(bounds.min);
            let to = self.get_tile_index(bounds.max);
            self.build_tiles_from_geometry(&geometries, from, to);
        }

        for obstacle in obstacles.iter_mut() {
            obstacle.obstacle_id = 0;
        }
        for obstacle in obstacles.iter_mut().filter(|o| o.enabled) {
            // Failures are logged; the remaining obstacles are still added
            let _ = self.add_obstacle(obstacle, true);
        }

        log::debug!(
            "Built dynamic navigation mesh with max {} tiles",
            self.base.max_tiles()
        );
        self.base.send_event(NavigationEvent::NavigationMeshRebuilt);
        Ok(())
    }

    /// Rebuilds the tiles overlapping `bounds`. Returns the number of tiles built.
    pub fn build_tiles_in_region(
        &mut self,
        geometry: &dyn GeometryProvider,
        bounds: &BoundingBox,
    ) -> Result<usize> {
        let from = self.get_tile_index(bounds.min);
        let to = self.get_tile_index(bounds.max);
        self.build_tiles(geometry, from, to)
    }

    /// Rebuilds the tiles `from..=to`. The mesh must be allocated.
    pub fn build_tiles(
        &mut self,
        geometry: &dyn GeometryProvider,
        from: IVec2,
        to: IVec2,
    ) -> Result<usize> {
        if self.tile_cache.is_none() || self.base.nav_mesh().is_none() {
            log::error!(
                "Navigation mesh must first be built or allocated before it can be partially rebuilt"
            );
            return Err(not_allocated());
        }

        let geometries = geometry.collect_geometries();
        let built = self.build_tiles_from_geometry(&geometries, from, to);
        log::debug!("Rebuilt {} tiles of the dynamic navigation mesh", built);
        self.base.send_tile_added_events(from, to);
        Ok(built)
    }

    fn build_tiles_from_geometry(
        &mut self,
        geometries: &[NavigationGeometryInfo],
        from: IVec2,
        to: IVec2,
    ) -> usize {
        let mut built = 0;
        for z in from.y..=to.y {
            for x in from.x..=to.x {
                let layers = self.build_tile(geometries, x, z);
                if layers.is_empty() {
                    continue;
                }
                match self.insert_layers(layers) {
                    Ok(_) => built += 1,
                    Err(e) => log::error!("Could not add tile ({}, {}): {}", x, z, e),
                }
            }
        }
        built
    }

    /// Adds compressed layers to the cache and bakes each one as it is added.
    /// Returns the cells touched.
    ///
    /// When a layer fails, the layers added before it are taken out of the cache
    /// and the mesh again.
    fn insert_layers(&mut self, layers: Vec<Vec<u8>>) -> Result<BTreeSet<(i32, i32)>> {
        let tile_cache = self.tile_cache.as_mut().ok_or_else(not_allocated)?;
        let nav_mesh = self.base.nav_mesh_mut().ok_or_else(not_allocated)?;

        let mut added: Vec<CompressedTileRef> = Vec::with_capacity(layers.len());
        let mut cells = BTreeSet::new();
        for data in layers {
            let result = match tile_cache.add_tile(data, COMPRESSED_TILE_FREE_DATA) {
                Ok(reference) => {
                    added.push(reference);
                    tile_cache.build_nav_mesh_tile(reference, nav_mesh)
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                roll_back_layers(tile_cache, nav_mesh, &added);
                return Err(e);
            }
            if let Some(tile) = added.last().and_then(|&r| tile_cache.get_tile_by_ref(r)) {
                cells.insert((tile.header.tx, tile.header.ty));
            }
        }
        Ok(cells)
    }

    /// Voxelizes tile `(x, z)` and compresses its layers.
    ///
    /// Every existing layer of the tile is removed first, baked and cached alike.
    /// Returns one tile data buffer per layer, ready for [`TileCache::add_tile`],
    /// or nothing when the tile has no geometry or any stage fails.
    pub fn build_tile(&mut self, geometries: &[NavigationGeometryInfo], x: i32, z: i32) -> Vec<Vec<u8>> {
        if self.tile_cache.is_none() {
            log::error!("Could not build tile ({}, {}): tile cache is not allocated", x, z);
            return Vec::new();
        }
        if let Err(e) = self.base.remove_mesh_tiles_at(IVec2::new(x, z)) {
            log::error!("Could not remove tile ({}, {}): {}", x, z, e);
            return Vec::new();
        }
        let Some(tile_cache) = self.tile_cache.as_mut() else {
            return Vec::new();
        };

        for reference in tile_cache.get_tiles_at(x, z) {
            if let Err(e) = tile_cache.remove_tile(reference) {
                log::error!("Could not remove tile cache layer: {}", e);
                return Vec::new();
            }
        }

        let (tile_bounds, layers) = match self.base.build_tile_layers(geometries, x, z) {
            Ok(Some(built)) => built,
            Ok(None) | Err(_) => return Vec::new(),
        };

        let max_layers = self.base.config().max_layers as usize;
        if layers.len() > max_layers {
            log::warn!(
                "Tile ({}, {}) has {} layers, only {} are kept",
                x,
                z,
                layers.len(),
                max_layers
            );
        }

        let mut tiles = Vec::with_capacity(layers.len().min(max_layers));
        for (index, layer) in layers.layers.iter().take(max_layers).enumerate() {
            let header = layer_header(x, z, index, layer);
            match tile_cache.build_layer_data(&header, &layer.heights, &layer.areas, &layer.cons) {
                Ok(data) => tiles.push(data),
                Err(e) => {
                    log::error!("Failed to build tile cache layers: {}", e);
                    return Vec::new();
                }
            }
        }

        self.base
            .send_event(NavigationEvent::AreaRebuilt { bounds: tile_bounds });
        tiles
    }

    /// Records of every cached layer at `index`
    pub fn get_tile_data(&self, index: IVec2) -> Vec<u8> {
        let mut data = Vec::new();
        let Some(tile_cache) = self.tile_cache.as_ref() else {
            return data;
        };
        for reference in tile_cache.get_tiles_at(index.x, index.y) {
            if let Some(tile) = tile_cache.get_tile_by_ref(reference) {
                // Writing into a Vec cannot fail
                let _ = write_tile_record(&mut data, tile);
            }
        }
        data
    }

    /// Adds the layers serialized by [`DynamicNavigationMesh::get_tile_data`].
    ///
    /// Every record is checked before the first one is inserted, so a rejected
    /// buffer leaves the mesh unchanged.
    pub fn add_tile(&mut self, data: &[u8]) -> Result<()> {
        let result = read_tile_records(&mut Cursor::new(data))
            .and_then(|records| self.add_tile_records(records));
        match result {
            Ok(cells) => {
                for (x, z) in cells {
                    self.base.send_event(NavigationEvent::TileAdded {
                        tile: IVec2::new(x, z),
                    });
                }
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to add tile data: {}", e);
                Err(e)
            }
        }
    }

    fn add_tile_records(&mut self, records: Vec<TileRecord>) -> Result<BTreeSet<(i32, i32)>> {
        let tile_cache = self.tile_cache.as_mut().ok_or_else(not_allocated)?;

        let mut keys = BTreeSet::new();
        for record in &records {
            let header = tile_cache.validate_tile_data(&record.data)?;
            let key = (header.tx, header.ty, header.tlayer);
            if tile_cache.get_tile_ref_at(key.0, key.1, key.2).is_some() || !keys.insert(key) {
                return Err(Error::Detour(Status::AlreadyExists.to_string()));
            }
        }
        if tile_cache.tile_count() + records.len() > tile_cache.max_tiles() {
            return Err(Error::Detour(Status::OutOfMemory.to_string()));
        }

        self.insert_layers(records.into_iter().map(|r| r.data).collect())
    }

    /// Removes every layer of tile `index` from the cache and the mesh
    pub fn remove_tile(&mut self, index: IVec2) -> Result<()> {
        if let Some(tile_cache) = self.tile_cache.as_mut() {
            for reference in tile_cache.get_tiles_at(index.x, index.y) {
                tile_cache.remove_tile(reference)?;
            }
        }
        self.base.remove_tile(index)
    }

    pub fn remove_all_tiles(&mut self) -> Result<()> {
        if let Some(tile_cache) = self.tile_cache.as_mut() {
            let references: Vec<CompressedTileRef> = tile_cache.tiles().map(|(r, _)| r).collect();
            for reference in references {
                tile_cache.remove_tile(reference)?;
            }
        }
        self.base.remove_all_tiles()
    }

    /// Serializes the whole mesh. Empty when nothing is allocated.
    pub fn navigation_data(&self) -> Vec<u8> {
        let mut data = Vec::new();
        let (Some(nav_mesh), Some(tile_cache)) = (self.base.nav_mesh(), self.tile_cache.as_ref())
        else {
            return data;
        };
        // Writing into a Vec cannot fail
        let _ = write_navigation_data(&mut data, nav_mesh.params(), tile_cache);
        data
    }

    /// Replaces the mesh with serialized navigation data.
    ///
    /// The tiling settings stored in the data overwrite the configuration. Data of
    /// another format version, or with any malformed tile record, is rejected as a
    /// whole and leaves the mesh released. Empty data only releases the mesh.
    pub fn set_navigation_data(&mut self, data: &[u8]) -> Result<()> {
        self.release();
        if data.is_empty() {
            return Ok(());
        }

        let mut source = Cursor::new(data);
        let (nav_params, cache_params) = match read_dynamic_preamble(&mut source) {
            Ok(params) => params,
            Err(e) => {
                log::warn!("Incompatible navigation data format, please rebuild navigation data");
                return Err(e);
            }
        };

        let result = self.load_tiles(&mut source, &nav_params, &cache_params);
        if let Err(e) = &result {
            log::error!("Could not load navigation data: {}", e);
            self.release();
        }
        result
    }

    fn load_tiles(
        &mut self,
        source: &mut Cursor<&[u8]>,
        nav_params: &NavMeshParams,
        cache_params: &TileCacheParams,
    ) -> Result<()> {
        cache_params.validate()?;
        let config = self.base.config_mut();
        config.tile_size = cache_params.width;
        config.cell_size = cache_params.cs;
        config.cell_height = cache_params.ch;
        config.agent_height = cache_params.walkable_height;
        config.agent_radius = cache_params.walkable_radius;
        config.agent_max_climb = cache_params.walkable_climb;
        config.edge_max_error = cache_params.max_simplification_error;
        config.max_obstacles = cache_params.max_obstacles as u32;
        config.validate().map_err(Error::NavMeshGeneration)?;

        let max_layers = config.max_layers;
        let max_tiles = (nav_params.max_tiles.max(1) as u32).div_ceil(max_layers);
        self.allocate_mesh(max_tiles)?;

        let records = read_tile_records(source)?;
        let count = records.len();
        self.add_tile_records(records)?;
        log::debug!("Loaded navigation data with {} tile layers", count);
        Ok(())
    }

    /// Adds a cylinder obstacle and applies it before returning.
    ///
    /// Does nothing while the mesh is not allocated. On success the obstacle
    /// receives its id; `silent` suppresses the [`NavigationEvent::ObstacleAdded`]
    /// event.
    pub fn add_obstacle(&mut self, obstacle: &mut Obstacle, silent: bool) -> Result<()> {
        if self.tile_cache.is_none() {
            return Ok(());
        }

        let reference = match self.enqueue_obstacle(obstacle) {
            Ok(reference) => reference,
            Err(e) => {
                log::error!("Failed to add obstacle: {}", e);
                return Err(e);
            }
        };
        obstacle.obstacle_id = reference;

        if !silent {
            self.base.send_event(NavigationEvent::ObstacleAdded {
                node_id: obstacle.node_id,
                obstacle: reference,
                position: obstacle.position,
                radius: obstacle.radius,
                height: obstacle.height,
            });
        }
        Ok(())
    }

    fn enqueue_obstacle(&mut self, obstacle: &Obstacle) -> Result<u32> {
        // Make room in the request queue, then apply the new request
        self.drain_tile_cache()?;
        let tile_cache = self.tile_cache.as_mut().ok_or_else(not_allocated)?;
        let reference = tile_cache.add_obstacle(obstacle.position, obstacle.radius, obstacle.height)?;
        self.drain_tile_cache()?;
        Ok(reference)
    }

    /// Removes a tracked obstacle and applies the removal before returning.
    ///
    /// Untracked obstacles are ignored. The obstacle's id is reset on success.
    pub fn remove_obstacle(&mut self, obstacle: &mut Obstacle, silent: bool) -> Result<()> {
        if self.tile_cache.is_none() || !obstacle.is_tracked() {
            return Ok(());
        }

        let reference = obstacle.obstacle_id;
        if let Err(e) = self.dequeue_obstacle(reference) {
            log::error!("Failed to remove obstacle: {}", e);
            return Err(e);
        }
        obstacle.obstacle_id = 0;

        if !silent {
            self.base.send_event(NavigationEvent::ObstacleRemoved {
                node_id: obstacle.node_id,
                obstacle: reference,
                position: obstacle.position,
                radius: obstacle.radius,
                height: obstacle.height,
            });
        }
        Ok(())
    }

    fn dequeue_obstacle(&mut self, reference: u32) -> Result<()> {
        self.drain_tile_cache()?;
        let tile_cache = self.tile_cache.as_mut().ok_or_else(not_allocated)?;
        tile_cache.remove_obstacle(reference)?;
        self.drain_tile_cache()
    }

    /// Re-applies an obstacle after it moved, resized or was toggled
    pub fn obstacle_changed(&mut self, obstacle: &mut Obstacle) -> Result<()> {
        if self.tile_cache.is_none() {
            return Ok(());
        }
        self.remove_obstacle(obstacle, true)?;
        if obstacle.enabled {
            self.add_obstacle(obstacle, true)?;
        }
        Ok(())
    }

    /// Whether the obstacle's circle reaches into tile `index`
    pub fn is_obstacle_in_tile(&self, obstacle: &Obstacle, index: IVec2) -> bool {
        self.base
            .get_tile_bounding_box_column(index)
            .distance_to_point(obstacle.position)
            < obstacle.radius
    }

    /// Runs one tile cache update. Returns whether the cache is up to date.
    pub fn update_step(&mut self) -> Result<bool> {
        let (Some(tile_cache), Some(nav_mesh)) = (self.tile_cache.as_mut(), self.base.nav_mesh_mut())
        else {
            return Ok(true);
        };
        tile_cache.update(0.0, nav_mesh)
    }

    /// Applies every queued obstacle request
    pub fn update(&mut self) -> Result<()> {
        self.drain_tile_cache()
    }

    /// Updates the tile cache until it reports being up to date.
    ///
    /// Fails when the cache is still busy after more updates than it has tiles.
    pub fn drain_tile_cache(&mut self) -> Result<()> {
        let (Some(tile_cache), Some(nav_mesh)) = (self.tile_cache.as_mut(), self.base.nav_mesh_mut())
        else {
            return Ok(());
        };

        let limit = tile_cache.max_tiles() + 2;
        for _ in 0..limit {
            if tile_cache.update(0.0, nav_mesh)? {
                return Ok(());
            }
        }
        Err(Error::TileCache(format!(
            "tile cache still busy after {} updates",
            limit
        )))
    }

    pub fn is_up_to_date(&self) -> bool {
        self.tile_cache
            .as_ref()
            .map_or(true, |tile_cache| tile_cache.is_up_to_date())
    }

    pub fn has_tile(&self, index: IVec2) -> bool {
        self.base.has_tile(index)
    }

    pub fn get_all_tile_indices(&self) -> Vec<IVec2> {
        self.base.get_all_tile_indices()
    }

    pub fn get_tile_index(&self, position: Vec3) -> IVec2 {
        self.base.get_tile_index(position)
    }

    pub fn get_tile_bounding_box_column(&self, index: IVec2) -> BoundingBox {
        self.base.get_tile_bounding_box_column(index)
    }

    pub fn find_nearest_point(&self, point: Vec3, extents: Vec3) -> Vec3 {
        self.base.find_nearest_point(point, extents)
    }

    pub fn find_nearest_poly(&self, point: Vec3, extents: Vec3) -> Option<(PolyRef, Vec3)> {
        self.base.find_nearest_poly(point, extents)
    }

    pub fn query_filter(&self) -> &QueryFilter {
        self.base.query_filter()
    }

    pub fn area_cost(&self, area_id: u8) -> f32 {
        self.base.area_cost(area_id)
    }

    pub fn set_area_cost(&mut self, area_id: u8, cost: f32) {
        self.base.set_area_cost(area_id, cost);
    }

    pub fn set_random_seed(&mut self, seed: u32) {
        self.base.set_random_seed(seed);
    }

    /// Paths see obstacles once the tile cache has caught up, see [`Self::update`]
    pub fn find_path(&self, start: Vec3, end: Vec3, extents: Vec3) -> Vec<Vec3> {
        self.base.find_path(start, end, extents)
    }

    pub fn find_path_points(&self, start: Vec3, end: Vec3, extents: Vec3) -> Vec<NavigationPathPoint> {
        self.base.find_path_points(start, end, extents)
    }

    pub fn move_along_surface(&self, start: Vec3, end: Vec3, extents: Vec3, max_visited: usize) -> Vec3 {
        self.base.move_along_surface(start, end, extents, max_visited)
    }

    pub fn raycast(&self, start: Vec3, end: Vec3, extents: Vec3) -> NavigationRaycast {
        self.base.raycast(start, end, extents)
    }

    pub fn get_distance_to_wall(&self, point: Vec3, radius: f32, extents: Vec3) -> WallHit {
        self.base.get_distance_to_wall(point, radius, extents)
    }

    pub fn get_random_point(&mut self) -> Vec3 {
        self.base.get_random_point()
    }

    pub fn get_random_point_in_circle(&mut self, center: Vec3, radius: f32, extents: Vec3) -> Vec3 {
        self.base.get_random_point_in_circle(center, radius, extents)
    }
}

/// Takes freshly added layers out of the cache and their tiles out of the mesh
fn roll_back_layers(tile_cache: &mut TileCache, nav_mesh: &mut NavMesh, added: &[CompressedTileRef]) {
    for &reference in added {
        let Some(header) = tile_cache.get_tile_by_ref(reference).map(|t| t.header) else {
            continue;
        };
        if let Some(tile_ref) = nav_mesh.get_tile_ref_at(header.tx, header.ty, header.tlayer) {
            if let Err(e) = nav_mesh.remove_tile(tile_ref) {
                log::warn!("Could not remove baked layer: {}", e);
            }
        }
        if let Err(e) = tile_cache.remove_tile(reference) {
            log::warn!("Could not remove cached layer: {}", e);
        }
    }
}

fn write_navigation_data<S: Serializer>(
    dest: &mut S,
    nav_params: &NavMeshParams,
    tile_cache: &TileCache,
) -> Result<()> {
    write_preamble(dest, nav_params)?;
    tile_cache.params().write_to(dest)?;

    for (_, tile) in tile_cache.tiles() {
        if tile.data.len() > TileCacheLayerHeader::SERIALIZED_SIZE {
            write_tile_record(dest, tile)?;
        }
    }
    Ok(())
}

fn read_dynamic_preamble<D: Deserializer>(source: &mut D) -> Result<(NavMeshParams, TileCacheParams)> {
    let nav_params = read_preamble(source)?;
    let cache_params = TileCacheParams::read_from(source)?;
    Ok((nav_params, cache_params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::StaticScene;

    fn config() -> NavigationMeshConfig {
        DynamicNavigationMesh::default_config()
            .with_tile_size(32)
            .with_cell_size(0.5)
    }

    fn built_mesh() -> (DynamicNavigationMesh, StaticScene) {
        let mut scene = StaticScene::new();
        scene.add_quad(Vec3::new(-10.0, 0.0, -10.0), Vec3::new(10.0, 0.0, 10.0), 0.0);
        let mut mesh = DynamicNavigationMesh::new(config()).unwrap();
        mesh.rebuild_mesh(&scene, &mut []).unwrap();
        (mesh, scene)
    }

    #[test]
    fn test_default_config_is_monotone() {
        assert_eq!(
            DynamicNavigationMesh::default_config().partition_type,
            PartitionType::Monotone
        );
        assert_eq!(NavigationMeshConfig::default().partition_type, PartitionType::Watershed);
    }

    #[test]
    fn test_allocate_sizes_cache_by_layers() {
        let mut mesh = DynamicNavigationMesh::new(config().with_max_layers(4)).unwrap();
        mesh.allocate_mesh(8).unwrap();
        let tile_cache = mesh.tile_cache().unwrap();
        assert_eq!(tile_cache.max_tiles(), 32);
        let params = mesh.nav_mesh().unwrap().params();
        assert_eq!(params.max_tiles, 32);
        assert_eq!(params.max_polys_per_tile, 1 << 17);
        assert_eq!(mesh.max_tiles(), 8);
    }

    #[test]
    fn test_set_max_layers_clamps() {
        let mut mesh = DynamicNavigationMesh::new(config()).unwrap();
        mesh.set_max_layers(1);
        assert_eq!(mesh.config().max_layers, MIN_LAYERS);
        mesh.set_max_layers(1000);
        assert_eq!(mesh.config().max_layers, MAX_LAYERS);
        mesh.set_max_obstacles(12);
        assert_eq!(mesh.config().max_obstacles, 12);
    }

    #[test]
    fn test_build_tile_without_cache_is_empty() {
        let mut mesh = DynamicNavigationMesh::new(config()).unwrap();
        let scene = StaticScene::new();
        assert!(mesh.build_tile(&scene.geometries, 0, 0).is_empty());
    }

    #[test]
    fn test_build_tile_emits_area_rebuilt() {
        let (mut mesh, scene) = built_mesh();
        let events = mesh.subscribe();
        let layers = mesh.build_tile(&scene.geometries, 0, 0);
        assert_eq!(layers.len(), 1);
        match events.try_recv().unwrap() {
            NavigationEvent::AreaRebuilt { bounds } => {
                assert_eq!(bounds.min.x, 0.0);
                assert_eq!(bounds.max.x, 16.0);
            }
            other => panic!("unexpected event {:?}", other),
        }
        // The cache layers of the tile were dropped for the rebuild
        assert!(mesh.tile_cache().unwrap().get_tiles_at(0, 0).is_empty());
    }

    #[test]
    fn test_tile_record_rejects_mismatched_header() {
        let (mesh, _) = built_mesh();
        let mut data = mesh.get_tile_data(IVec2::ZERO);
        assert!(read_tile_records(&mut Cursor::new(&data[..])).is_ok());

        // tx of the record header
        data[8] ^= 1;
        assert!(read_tile_records(&mut Cursor::new(&data[..])).is_err());
    }

    #[test]
    fn test_obstacle_in_tile() {
        let mesh = DynamicNavigationMesh::new(config()).unwrap();
        let obstacle = Obstacle::new(1, Vec3::new(15.5, 0.0, 8.0), 1.0, 2.0);
        assert!(mesh.is_obstacle_in_tile(&obstacle, IVec2::new(0, 0)));
        assert!(mesh.is_obstacle_in_tile(&obstacle, IVec2::new(1, 0)));
        assert!(!mesh.is_obstacle_in_tile(&obstacle, IVec2::new(0, 1)));
    }

    #[test]
    fn test_obstacle_requests_without_cache_are_ignored() {
        let mut mesh = DynamicNavigationMesh::new(config()).unwrap();
        let mut obstacle = Obstacle::new(1, Vec3::ZERO, 1.0, 2.0);
        mesh.add_obstacle(&mut obstacle, false).unwrap();
        assert!(!obstacle.is_tracked());
        mesh.remove_obstacle(&mut obstacle, false).unwrap();
        assert!(mesh.is_up_to_date());
    }
}
