//! Tiled navigation mesh built straight from scene geometry
//!
//! [`NavigationMesh`] owns the queryable [`NavMesh`] and knows how to turn the
//! geometry of one tile column into heightfield layers. It bakes those layers into
//! polygons directly; [`crate::DynamicNavigationMesh`] reuses the same pipeline but
//! routes the layers through a tile cache.
//!
//! # Persisted format
//!
//! [`NavigationMesh::navigation_data`] writes, little-endian:
//!
//! ```text
//! BoundingBox      6 x f32, always empty
//! i32              0
//! i32              0
//! i32              NAVIGATION_DATA_VERSION
//! NavMeshParams    28 bytes
//! { i32 x, i32 z, i32 size, u8[size] tile } until the end
//! ```
//!
//! Each tile uses the layout of [`navmesh_detour::binary_format`].
//! [`NavigationMesh::get_tile_data`] and [`NavigationMesh::add_tile`] use the same
//! records for the layers of one cell.

use std::collections::BTreeSet;
use std::io::Cursor;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use glam::{IVec2, Vec3};
use navmesh_common::{
    ilog2_ceil, next_power_of_two, BoundingBox, Deserializer, Error, Result, Serializer,
};
use navmesh_detour::{
    load_tile_from_binary, save_tile_to_binary, MeshTile, NavMesh, NavMeshBuilder, NavMeshParams,
    NavMeshQuery, PolyRef, QueryFilter, Status, StraightPathFlags, WallHit,
};
use navmesh_tilecache::{
    MeshProcess, TileCacheBuilder, TileCacheLayer, TileCacheLayerHeader, TileCacheParams,
};
use navmesh_voxel::{HeightfieldLayer, HeightfieldLayerSet, LayerBuildConfig, LayerBuilder, PartitionType};

use crate::build_data::NavBuildData;
use crate::config::NavigationMeshConfig;
use crate::events::{EventBus, NavigationEvent};
use crate::mesh_process::SceneMeshProcess;
use crate::scene::{GeometryProvider, NavigationGeometryInfo, OffMeshConnectionSource};

/// Vertical extent of a tile column when no height range is configured
const LARGE_VALUE: f32 = 100_000_000.0;

/// Bits shared by the tile and polygon index of a polygon reference
const POLY_REF_BITS: u32 = 22;

/// Version written into persisted navigation data
pub const NAVIGATION_DATA_VERSION: i32 = 1;

/// Polygons kept by [`NavigationMesh::move_along_surface`] unless told otherwise
pub const DEFAULT_MAX_VISITED: usize = 3;

/// Corner of a path found by [`NavigationMesh::find_path_points`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NavigationPathPoint {
    pub position: Vec3,
    pub flags: StraightPathFlags,
    /// Area id of the polygon the path continues on
    pub area_id: u8,
}

/// Outcome of [`NavigationMesh::raycast`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NavigationRaycast {
    /// Where the ray stopped, the segment end when nothing was hit
    pub position: Vec3,
    /// Normal of the wall that was hit, pointing down without a hit
    pub normal: Vec3,
    pub hit: bool,
}

/// Writes the header shared by every persisted mesh
pub(crate) fn write_preamble<S: Serializer>(dest: &mut S, nav_params: &NavMeshParams) -> Result<()> {
    BoundingBox::empty().write_to(dest)?;
    dest.write_i32::<LittleEndian>(0)?;
    dest.write_i32::<LittleEndian>(0)?;
    dest.write_i32::<LittleEndian>(NAVIGATION_DATA_VERSION)?;
    nav_params.write_to(dest)?;
    Ok(())
}

/// Reads the header written by [`write_preamble`], rejecting other versions
pub(crate) fn read_preamble<D: Deserializer>(source: &mut D) -> Result<NavMeshParams> {
    let _bounds = BoundingBox::read_from(source)?;
    let unused = (
        source.read_i32::<LittleEndian>()?,
        source.read_i32::<LittleEndian>()?,
    );
    let version = source.read_i32::<LittleEndian>()?;
    if unused != (0, 0) || version != NAVIGATION_DATA_VERSION {
        return Err(Error::Detour(Status::WrongVersion.to_string()));
    }
    NavMeshParams::read_from(source)
}

fn write_mesh_tile_record<S: Serializer>(dest: &mut S, tile: &MeshTile) -> Result<()> {
    let header = tile
        .header
        .as_ref()
        .ok_or_else(|| Error::Detour(Status::InvalidParam.to_string()))?;
    let bytes = save_tile_to_binary(tile)?;
    dest.write_i32::<LittleEndian>(header.x)?;
    dest.write_i32::<LittleEndian>(header.y)?;
    dest.write_i32::<LittleEndian>(bytes.len() as i32)?;
    dest.write_all(&bytes)?;
    Ok(())
}

fn read_mesh_tile_record<D: Deserializer>(source: &mut D) -> Result<MeshTile> {
    let x = source.read_i32::<LittleEndian>()?;
    let z = source.read_i32::<LittleEndian>()?;
    let size = source.read_i32::<LittleEndian>()?;
    if size <= 0 || size as usize > source.remaining() {
        return Err(Error::Detour(Status::DataCorrupted.to_string()));
    }
    let mut bytes = vec![0u8; size as usize];
    source.read_exact(&mut bytes)?;
    let tile = load_tile_from_binary(&bytes)?;
    // The record must name the cell of the tile it holds
    if tile.header.as_ref().map(|h| (h.x, h.y)) != Some((x, z)) {
        return Err(Error::Detour(Status::DataCorrupted.to_string()));
    }
    Ok(tile)
}

fn read_mesh_tile_records<D: Deserializer>(source: &mut D) -> Result<Vec<MeshTile>> {
    let mut tiles = Vec::new();
    while !source.is_eof() {
        tiles.push(read_mesh_tile_record(source)?);
    }
    Ok(tiles)
}

/// Smallest power of two that covers every tile overlapping `bounds`.
///
/// Returns 0 for an empty box.
pub fn calculate_max_tiles(bounds: &BoundingBox, tile_size: i32, cell_size: f32) -> u32 {
    if bounds.is_empty() {
        return 0;
    }
    let edge = tile_size as f32 * cell_size;
    let tiles_along = |min: f32, max: f32| -> u32 {
        let first = (min / edge).floor() as i64;
        let last = (max / edge).floor() as i64;
        (last - first + 1).clamp(1, u32::MAX as i64) as u32
    };
    let tiles_x = tiles_along(bounds.min.x, bounds.max.x);
    let tiles_z = tiles_along(bounds.min.z, bounds.max.z);
    next_power_of_two(tiles_x.saturating_mul(tiles_z))
}

/// Bounds of every geometry, grown by `padding`. Empty when there is no geometry.
pub fn calculate_bounding_box(geometries: &[NavigationGeometryInfo], padding: Vec3) -> BoundingBox {
    let mut bounds = BoundingBox::empty();
    for info in geometries {
        bounds.merge(&info.bounding_box);
    }
    if bounds.is_empty() {
        return bounds;
    }
    bounds.expanded(padding)
}

/// Narrows a tile column to the vertical extent of the geometry inside it.
///
/// A column without geometry collapses to a zero-height box at `y = 0`.
pub(crate) fn calculate_tile_bounding_box(
    geometries: &[NavigationGeometryInfo],
    column: &BoundingBox,
) -> BoundingBox {
    let mut bounds = *column;
    bounds.min.y = f32::INFINITY;
    bounds.max.y = f32::NEG_INFINITY;
    for info in geometries.iter().filter(|g| g.bounding_box.intersects(column)) {
        bounds.min.y = bounds.min.y.min(info.bounding_box.min.y);
        bounds.max.y = bounds.max.y.max(info.bounding_box.max.y);
    }
    if bounds.min.y > bounds.max.y {
        bounds.min.y = 0.0;
        bounds.max.y = 0.0;
    }
    bounds
}

/// Header of the tile cache layer built from `layer`
pub(crate) fn layer_header(x: i32, z: i32, index: usize, layer: &HeightfieldLayer) -> TileCacheLayerHeader {
    TileCacheLayerHeader {
        tx: x,
        ty: z,
        tlayer: index as i32,
        bmin: layer.bmin.to_array(),
        bmax: layer.bmax.to_array(),
        width: layer.width as u8,
        height: layer.height as u8,
        minx: layer.minx as u8,
        maxx: layer.maxx as u8,
        miny: layer.miny as u8,
        maxy: layer.maxy as u8,
        hmin: layer.hmin.clamp(0, u16::MAX as i32) as u16,
        hmax: layer.hmax.clamp(0, u16::MAX as i32) as u16,
        ..TileCacheLayerHeader::new()
    }
}

/// A navigation mesh split into square tiles
pub struct NavigationMesh {
    config: NavigationMeshConfig,
    nav_mesh: Option<NavMesh>,
    max_tiles: u32,
    off_mesh_source: Option<Arc<dyn OffMeshConnectionSource>>,
    events: EventBus,
    query_filter: QueryFilter,
    random_seed: u32,
}

impl NavigationMesh {
    pub fn new(config: NavigationMeshConfig) -> Result<Self> {
        config.validate().map_err(Error::NavMeshGeneration)?;
        Ok(Self {
            max_tiles: config.default_max_tiles,
            config,
            nav_mesh: None,
            off_mesh_source: None,
            events: EventBus::new(),
            query_filter: QueryFilter::default(),
            random_seed: 1,
        })
    }

    pub fn config(&self) -> &NavigationMeshConfig {
        &self.config
    }

    pub(crate) fn config_mut(&mut self) -> &mut NavigationMeshConfig {
        &mut self.config
    }

    pub fn set_partition_type(&mut self, partition_type: PartitionType) {
        self.config.partition_type = partition_type;
    }

    /// The queryable mesh, `None` until allocated or built
    pub fn nav_mesh(&self) -> Option<&NavMesh> {
        self.nav_mesh.as_ref()
    }

    pub(crate) fn nav_mesh_mut(&mut self) -> Option<&mut NavMesh> {
        self.nav_mesh.as_mut()
    }

    pub(crate) fn set_nav_mesh(&mut self, nav_mesh: NavMesh) {
        self.nav_mesh = Some(nav_mesh);
    }

    /// Tile capacity of the last allocation
    pub fn max_tiles(&self) -> u32 {
        self.max_tiles
    }

    pub(crate) fn set_max_tiles(&mut self, max_tiles: u32) {
        self.max_tiles = max_tiles;
    }

    /// Sets where off-mesh connections come from
    pub fn set_off_mesh_connection_source(&mut self, source: Option<Arc<dyn OffMeshConnectionSource>>) {
        self.off_mesh_source = source;
    }

    pub fn off_mesh_connection_source(&self) -> Option<Arc<dyn OffMeshConnectionSource>> {
        self.off_mesh_source.clone()
    }

    /// Returns a receiver for every event sent from now on
    pub fn subscribe(&mut self) -> Receiver<NavigationEvent> {
        self.events.subscribe()
    }

    pub(crate) fn send_event(&mut self, event: NavigationEvent) {
        self.events.send(event);
    }

    /// Drops the queryable mesh
    pub fn release(&mut self) {
        self.nav_mesh = None;
    }

    /// Creates an empty queryable mesh able to hold `max_tiles` tiles.
    ///
    /// Tile and polygon indices share 22 bits of a polygon reference, so the
    /// polygon budget per tile shrinks as the tile count grows.
    pub fn allocate_mesh(&mut self, max_tiles: u32) -> Result<()> {
        self.release();

        let tile_bits = ilog2_ceil(max_tiles);
        if max_tiles == 0 || tile_bits > POLY_REF_BITS {
            log::error!("Could not allocate navigation mesh with {} tiles", max_tiles);
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }
        let max_polys = 1u32 << (POLY_REF_BITS - tile_bits);
        let tile_edge_length = self.config.tile_edge_length();

        let params = NavMeshParams {
            origin: [0.0; 3],
            tile_width: tile_edge_length,
            tile_height: tile_edge_length,
            max_tiles: max_tiles as i32,
            max_polys_per_tile: max_polys as i32,
        };
        match NavMesh::new(params) {
            Ok(nav_mesh) => {
                self.nav_mesh = Some(nav_mesh);
                Ok(())
            }
            Err(e) => {
                log::error!("Could not initialize navigation mesh: {}", e);
                Err(e)
            }
        }
    }

    /// Allocates an empty mesh with the current tile capacity
    pub fn allocate(&mut self) -> Result<()> {
        self.allocate_mesh(self.max_tiles)?;
        log::debug!(
            "Allocated empty navigation mesh with max {} tiles",
            self.max_tiles
        );
        self.send_event(NavigationEvent::NavigationMeshRebuilt);
        Ok(())
    }

    /// Tile capacity for the given geometry, falling back to the configured default
    pub(crate) fn plan_max_tiles(&self, bounds: &BoundingBox) -> u32 {
        match calculate_max_tiles(bounds, self.config.tile_size, self.config.cell_size) {
            0 => self.config.default_max_tiles,
            n => n,
        }
    }

    /// Reallocates the mesh to fit the geometry and builds every tile
    pub fn rebuild(&mut self, geometry: &dyn GeometryProvider) -> Result<()> {
        let geometries = geometry.collect_geometries();
        let bounds = calculate_bounding_box(&geometries, self.config.padding);
        self.max_tiles = self.plan_max_tiles(&bounds);
        self.allocate_mesh(self.max_tiles)?;

        if !bounds.is_empty() {
            let from = self.get_tile_index(bounds.min);
            let to = self.get_tile_index(bounds.max);
            self.build_tiles_from_geometry(&geometries, from, to);
        }

        log::debug!("Built navigation mesh with max {} tiles", self.max_tiles);
        self.send_event(NavigationEvent::NavigationMeshRebuilt);
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
        if self.nav_mesh.is_none() {
            log::error!(
                "Navigation mesh must first be built or allocated before it can be partially rebuilt"
            );
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        let geometries = geometry.collect_geometries();
        let built = self.build_tiles_from_geometry(&geometries, from, to);
        log::debug!("Rebuilt {} tiles of the navigation mesh", built);
        self.send_tile_added_events(from, to);
        Ok(built)
    }

    pub(crate) fn send_tile_added_events(&mut self, from: IVec2, to: IVec2) {
        for z in from.y..=to.y {
            for x in from.x..=to.x {
                self.send_event(NavigationEvent::TileAdded {
                    tile: IVec2::new(x, z),
                });
            }
        }
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
                match self.build_tile(geometries, x, z) {
                    Ok(true) => built += 1,
                    Ok(false) => {}
                    Err(e) => log::error!("Could not build tile ({}, {}): {}", x, z, e),
                }
            }
        }
        built
    }

    /// Bakes every layer of tile `(x, z)` into the mesh
    fn build_tile(&mut self, geometries: &[NavigationGeometryInfo], x: i32, z: i32) -> Result<bool> {
        self.remove_mesh_tiles_at(IVec2::new(x, z))?;

        let Some((_, layers)) = self.build_tile_layers(geometries, x, z)? else {
            return Ok(false);
        };

        let builder = TileCacheBuilder::new(self.tile_cache_params(1, 0));
        let mut mesh_process = SceneMeshProcess::new(self.off_mesh_source.clone());
        let Some(nav_mesh) = self.nav_mesh.as_mut() else {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        };

        let mut added = false;
        for (index, layer) in layers.layers.iter().enumerate() {
            let layer = TileCacheLayer {
                header: layer_header(x, z, index, layer),
                heights: layer.heights.clone(),
                areas: layer.areas.clone(),
                cons: layer.cons.clone(),
            };
            let Some(mut params) = builder.build(&layer)? else {
                continue;
            };
            mesh_process.process(&mut params);
            nav_mesh.add_tile(NavMeshBuilder::build_tile(&params)?)?;
            added = true;
        }
        Ok(added)
    }

    /// Voxelizes the geometry of tile `(x, z)` into heightfield layers.
    ///
    /// Returns the tile bounds used for the build with the layers, or `None` when
    /// no triangle overlaps the tile.
    pub(crate) fn build_tile_layers(
        &self,
        geometries: &[NavigationGeometryInfo],
        x: i32,
        z: i32,
    ) -> Result<Option<(BoundingBox, HeightfieldLayerSet)>> {
        let column = self.get_tile_bounding_box_column(IVec2::new(x, z));
        let tile_bounds = if self.config.is_height_range_valid() {
            column
        } else {
            calculate_tile_bounding_box(geometries, &column)
        };

        let config = self.layer_build_config(&tile_bounds);
        let expanded = BoundingBox::new(config.bmin, config.bmax);
        let build = NavBuildData::collect(geometries, &expanded);
        if build.is_empty() {
            return Ok(None);
        }

        log::trace!(
            "Building tile ({}, {}) from {} triangles",
            x,
            z,
            build.triangle_count()
        );
        let layers = LayerBuilder::new(config)
            .build_layers(&build.vertices, &build.indices, &build.nav_areas)
            .map_err(|e| {
                log::error!("Could not build height field layers: {}", e);
                e
            })?;
        Ok(Some((tile_bounds, layers)))
    }

    /// Voxel settings for one tile, with the border cells around `tile_bounds`
    pub(crate) fn layer_build_config(&self, tile_bounds: &BoundingBox) -> LayerBuildConfig {
        let c = &self.config;
        let walkable_radius = (c.agent_radius / c.cell_size).ceil() as i32;
        let border_size = walkable_radius + 3;
        let border = border_size as f32 * c.cell_size;

        LayerBuildConfig {
            width: c.tile_size + border_size * 2,
            height: c.tile_size + border_size * 2,
            cs: c.cell_size,
            ch: c.cell_height,
            bmin: tile_bounds.min - Vec3::new(border, c.padding.y, border),
            bmax: tile_bounds.max + Vec3::new(border, c.padding.y, border),
            walkable_slope_angle: c.agent_max_slope,
            walkable_height: (c.agent_height / c.cell_height).ceil() as i32,
            walkable_climb: (c.agent_max_climb / c.cell_height).floor() as i32,
            walkable_radius,
            min_region_area: c.region_min_size.sqrt() as i32,
            merge_region_area: c.region_merge_size.sqrt() as i32,
            border_size,
            partition_type: c.partition_type,
        }
    }

    /// Tile cache parameters matching this mesh's settings
    pub(crate) fn tile_cache_params(&self, max_tiles: u32, max_obstacles: u32) -> TileCacheParams {
        let c = &self.config;
        TileCacheParams {
            orig: [0.0; 3],
            cs: c.cell_size,
            ch: c.cell_height,
            width: c.tile_size,
            height: c.tile_size,
            walkable_height: c.agent_height,
            walkable_radius: c.agent_radius,
            walkable_climb: c.agent_max_climb,
            max_simplification_error: c.edge_max_error,
            max_tiles: max_tiles as i32,
            max_obstacles: max_obstacles as i32,
        }
    }

    /// Removes every layer at `index` from the queryable mesh. Returns how many
    /// tiles were removed.
    pub(crate) fn remove_mesh_tiles_at(&mut self, index: IVec2) -> Result<usize> {
        let Some(nav_mesh) = self.nav_mesh.as_mut() else {
            return Ok(0);
        };
        let layers: Vec<i32> = nav_mesh
            .get_tiles_at(index.x, index.y)
            .iter()
            .filter_map(|t| t.header.as_ref().map(|h| h.layer))
            .collect();
        for &layer in &layers {
            if let Some(tile_ref) = nav_mesh.get_tile_ref_at(index.x, index.y, layer) {
                nav_mesh.remove_tile(tile_ref)?;
            }
        }
        Ok(layers.len())
    }

    /// Removes every layer of tile `index`
    pub fn remove_tile(&mut self, index: IVec2) -> Result<()> {
        if self.remove_mesh_tiles_at(index)? > 0 {
            self.send_event(NavigationEvent::TileRemoved { tile: index });
        }
        Ok(())
    }

    pub fn remove_all_tiles(&mut self) -> Result<()> {
        if let Some(nav_mesh) = self.nav_mesh.as_mut() {
            let keys: Vec<(i32, i32, i32)> = nav_mesh
                .tiles()
                .filter_map(|t| t.header.as_ref().map(|h| (h.x, h.y, h.layer)))
                .collect();
            for (x, y, layer) in keys {
                if let Some(tile_ref) = nav_mesh.get_tile_ref_at(x, y, layer) {
                    nav_mesh.remove_tile(tile_ref)?;
                }
            }
        }
        self.send_event(NavigationEvent::AllTilesRemoved);
        Ok(())
    }

    pub fn has_tile(&self, index: IVec2) -> bool {
        self.nav_mesh
            .as_ref()
            .is_some_and(|m| !m.get_tiles_at(index.x, index.y).is_empty())
    }

    /// Indices of every tile with at least one layer, sorted by z then x
    pub fn get_all_tile_indices(&self) -> Vec<IVec2> {
        let Some(nav_mesh) = self.nav_mesh.as_ref() else {
            return Vec::new();
        };
        let mut indices: Vec<IVec2> = nav_mesh
            .tiles()
            .filter_map(|t| t.header.as_ref().map(|h| IVec2::new(h.x, h.y)))
            .collect();
        indices.sort_by_key(|i| (i.y, i.x));
        indices.dedup();
        indices
    }

    /// Index of the tile containing `position`
    pub fn get_tile_index(&self, position: Vec3) -> IVec2 {
        let edge = self.config.tile_edge_length();
        IVec2::new(
            (position.x / edge).floor() as i32,
            (position.z / edge).floor() as i32,
        )
    }

    /// Bounds of tile `index`, vertically limited by the height range if any
    pub fn get_tile_bounding_box_column(&self, index: IVec2) -> BoundingBox {
        let (min_y, max_y) = if self.config.is_height_range_valid() {
            (self.config.height_range.x, self.config.height_range.y)
        } else {
            (-LARGE_VALUE, LARGE_VALUE)
        };
        let edge = self.config.tile_edge_length();
        BoundingBox::new(
            Vec3::new(index.x as f32 * edge, min_y, index.y as f32 * edge),
            Vec3::new((index.x + 1) as f32 * edge, max_y, (index.y + 1) as f32 * edge),
        )
    }

    /// Serialized layers of tile `index`. Empty when the tile has none.
    pub fn get_tile_data(&self, index: IVec2) -> Vec<u8> {
        let mut data = Vec::new();
        let Some(nav_mesh) = self.nav_mesh.as_ref() else {
            return data;
        };
        for tile in nav_mesh.get_tiles_at(index.x, index.y) {
            if let Err(e) = write_mesh_tile_record(&mut data, tile) {
                log::warn!("Could not write tile ({}, {}): {}", index.x, index.y, e);
            }
        }
        data
    }

    /// Adds the layers serialized by [`NavigationMesh::get_tile_data`].
    ///
    /// Every record is checked before the first one is added, so a rejected buffer
    /// leaves the mesh unchanged.
    pub fn add_tile(&mut self, data: &[u8]) -> Result<()> {
        let result = read_mesh_tile_records(&mut Cursor::new(data))
            .and_then(|tiles| self.add_mesh_tiles(tiles));
        match result {
            Ok(cells) => {
                for (x, z) in cells {
                    self.send_event(NavigationEvent::TileAdded {
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

    /// Adds all `tiles` or none of them. Returns the cells that received layers.
    fn add_mesh_tiles(&mut self, tiles: Vec<MeshTile>) -> Result<BTreeSet<(i32, i32)>> {
        let nav_mesh = self.nav_mesh.as_mut().ok_or_else(|| {
            Error::Detour(Status::InvalidParam.to_string())
        })?;

        let mut keys = BTreeSet::new();
        for tile in &tiles {
            let Some(h) = tile.header.as_ref() else {
                return Err(Error::Detour(Status::InvalidParam.to_string()));
            };
            let key = (h.x, h.y, h.layer);
            if nav_mesh.get_tile_at(key.0, key.1, key.2).is_some() || !keys.insert(key) {
                return Err(Error::Detour(Status::AlreadyExists.to_string()));
            }
        }
        if nav_mesh.tile_count() + tiles.len() > nav_mesh.max_tiles() {
            return Err(Error::Detour(Status::OutOfMemory.to_string()));
        }

        let mut added = Vec::with_capacity(tiles.len());
        for tile in tiles {
            match nav_mesh.add_tile(tile) {
                Ok(tile_ref) => added.push(tile_ref),
                Err(e) => {
                    for tile_ref in added {
                        if let Err(e) = nav_mesh.remove_tile(tile_ref) {
                            log::warn!("Could not remove added tile: {}", e);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(keys.into_iter().map(|(x, z, _)| (x, z)).collect())
    }

    /// Serializes the whole mesh. Empty when nothing is allocated.
    pub fn navigation_data(&self) -> Vec<u8> {
        let mut data = Vec::new();
        let Some(nav_mesh) = self.nav_mesh.as_ref() else {
            return data;
        };
        let written = write_preamble(&mut data, nav_mesh.params()).and_then(|()| {
            nav_mesh
                .tiles()
                .try_for_each(|tile| write_mesh_tile_record(&mut data, tile))
        });
        if let Err(e) = written {
            log::error!("Could not write navigation data: {}", e);
            data.clear();
        }
        data
    }

    /// Replaces the mesh with data written by [`NavigationMesh::navigation_data`].
    ///
    /// The tile grid must match the configured tile edge. Data of another format
    /// version, or with any malformed tile, is rejected as a whole and leaves the
    /// mesh released. Empty data only releases the mesh.
    pub fn set_navigation_data(&mut self, data: &[u8]) -> Result<()> {
        self.release();
        if data.is_empty() {
            return Ok(());
        }

        let mut source = Cursor::new(data);
        let params = match read_preamble(&mut source) {
            Ok(params) => params,
            Err(e) => {
                log::warn!("Incompatible navigation data format, please rebuild navigation data");
                return Err(e);
            }
        };

        let result = self.load_mesh_tiles(&mut source, params);
        if let Err(e) = &result {
            log::error!("Could not load navigation data: {}", e);
            self.release();
        }
        result
    }

    fn load_mesh_tiles(&mut self, source: &mut Cursor<&[u8]>, params: NavMeshParams) -> Result<()> {
        let edge = self.config.tile_edge_length();
        if (params.tile_width - edge).abs() > 1e-4 || (params.tile_height - edge).abs() > 1e-4 {
            log::warn!(
                "Navigation data tile size {} does not match the configured {}",
                params.tile_width,
                edge
            );
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        self.nav_mesh = Some(NavMesh::new(params)?);
        self.max_tiles = params.max_tiles.max(1) as u32;
        let tiles = read_mesh_tile_records(source)?;
        let count = tiles.len();
        self.add_mesh_tiles(tiles)?;
        log::debug!("Loaded navigation data with {} tiles", count);
        Ok(())
    }

    pub fn query_filter(&self) -> &QueryFilter {
        &self.query_filter
    }

    /// Cost multiplier of area `area_id` in path searches, 1 by default
    pub fn area_cost(&self, area_id: u8) -> f32 {
        self.query_filter.area_cost(area_id)
    }

    /// Sets the cost multiplier of area `area_id` in path searches
    pub fn set_area_cost(&mut self, area_id: u8, cost: f32) {
        self.query_filter.set_area_cost(area_id, cost);
    }

    /// Restarts the sequence behind the random point queries
    pub fn set_random_seed(&mut self, seed: u32) {
        self.random_seed = seed;
    }

    /// Nearest point on the mesh within `extents` of `point`, or `point` itself
    pub fn find_nearest_point(&self, point: Vec3, extents: Vec3) -> Vec3 {
        self.find_nearest_poly(point, extents)
            .map_or(point, |(_, nearest)| nearest)
    }

    /// Nearest polygon passing the query filter within `extents` of `point`
    pub fn find_nearest_poly(&self, point: Vec3, extents: Vec3) -> Option<(PolyRef, Vec3)> {
        NavMeshQuery::new(self.nav_mesh.as_ref()?).find_nearest_poly(point, extents, &self.query_filter)
    }

    /// Moves from `start` towards `end` along the surface and returns where the
    /// movement stopped. Returns `end` when `start` is not on the mesh.
    pub fn move_along_surface(&self, start: Vec3, end: Vec3, extents: Vec3, max_visited: usize) -> Vec3 {
        let Some(nav_mesh) = self.nav_mesh.as_ref() else {
            return end;
        };
        let query = NavMeshQuery::new(nav_mesh);
        let Some((start_ref, start_pos)) = query.find_nearest_poly(start, extents, &self.query_filter)
        else {
            return end;
        };
        match query.move_along_surface(start_ref, start_pos, end, &self.query_filter, max_visited) {
            Ok((position, _)) => position,
            Err(e) => {
                log::warn!("Could not move along surface: {}", e);
                end
            }
        }
    }

    /// Corners of the path from `start` to `end`. Empty when either end is not on
    /// the mesh.
    pub fn find_path(&self, start: Vec3, end: Vec3, extents: Vec3) -> Vec<Vec3> {
        self.find_path_points(start, end, extents)
            .into_iter()
            .map(|p| p.position)
            .collect()
    }

    /// Like [`NavigationMesh::find_path`], with the flags and area of every corner.
    ///
    /// When `end` cannot be reached the path stops at the reachable point closest
    /// to it.
    pub fn find_path_points(&self, start: Vec3, end: Vec3, extents: Vec3) -> Vec<NavigationPathPoint> {
        let Some(nav_mesh) = self.nav_mesh.as_ref() else {
            return Vec::new();
        };
        let query = NavMeshQuery::new(nav_mesh);
        let filter = &self.query_filter;
        let (Some((start_ref, start_pos)), Some((end_ref, end_pos))) = (
            query.find_nearest_poly(start, extents, filter),
            query.find_nearest_poly(end, extents, filter),
        ) else {
            return Vec::new();
        };

        let corners = query
            .find_path(start_ref, end_ref, start_pos, end_pos, filter)
            .and_then(|path| {
                let Some(&last) = path.last() else {
                    return Ok(Vec::new());
                };
                let target = if last == end_ref {
                    end_pos
                } else {
                    nav_mesh.closest_point_on_poly(last, end_pos)?
                };
                query.find_straight_path(start_pos, target, &path)
            });

        match corners {
            Ok(corners) => corners
                .into_iter()
                .map(|corner| NavigationPathPoint {
                    position: corner.position,
                    flags: corner.flags,
                    area_id: nav_mesh
                        .get_tile_and_poly_by_ref(corner.poly)
                        .map_or(0, |(_, poly)| poly.area),
                })
                .collect(),
            Err(e) => {
                log::warn!("Could not find path: {}", e);
                Vec::new()
            }
        }
    }

    /// Random point on the mesh, `Vec3::ZERO` when the mesh is empty
    pub fn get_random_point(&mut self) -> Vec3 {
        let Some(nav_mesh) = self.nav_mesh.as_ref() else {
            return Vec3::ZERO;
        };
        let mut query = NavMeshQuery::new(nav_mesh).with_random_seed(self.random_seed);
        let point = query.find_random_point(&self.query_filter);
        self.random_seed = query.random_seed();
        point.map_or(Vec3::ZERO, |(_, point)| point)
    }

    /// Random point reachable from `center` within `radius`. Returns `center` when
    /// it is not on the mesh.
    pub fn get_random_point_in_circle(&mut self, center: Vec3, radius: f32, extents: Vec3) -> Vec3 {
        let Some(nav_mesh) = self.nav_mesh.as_ref() else {
            return center;
        };
        let mut query = NavMeshQuery::new(nav_mesh).with_random_seed(self.random_seed);
        let Some((start_ref, start_pos)) = query.find_nearest_poly(center, extents, &self.query_filter)
        else {
            return center;
        };
        let point = query.find_random_point_around_circle(start_ref, start_pos, radius, &self.query_filter);
        self.random_seed = query.random_seed();
        match point {
            Ok(Some((_, point))) => point,
            Ok(None) => center,
            Err(e) => {
                log::warn!("Could not pick a random point: {}", e);
                center
            }
        }
    }

    /// Nearest wall within `radius` of `point`.
    ///
    /// Without a wall in range, or when `point` is not on the mesh, the distance is
    /// `radius`, the position `point` and the normal points down.
    pub fn get_distance_to_wall(&self, point: Vec3, radius: f32, extents: Vec3) -> WallHit {
        let no_wall = WallHit {
            distance: radius,
            position: point,
            normal: Vec3::NEG_Y,
        };
        let Some(nav_mesh) = self.nav_mesh.as_ref() else {
            return no_wall;
        };
        let query = NavMeshQuery::new(nav_mesh);
        let Some((start_ref, start_pos)) = query.find_nearest_poly(point, extents, &self.query_filter)
        else {
            return no_wall;
        };
        match query.find_distance_to_wall(start_ref, start_pos, radius, &self.query_filter) {
            Ok(hit) => hit.unwrap_or(no_wall),
            Err(e) => {
                log::warn!("Could not find distance to wall: {}", e);
                no_wall
            }
        }
    }

    /// Casts a ray along the surface from `start` to `end`
    pub fn raycast(&self, start: Vec3, end: Vec3, extents: Vec3) -> NavigationRaycast {
        let miss = NavigationRaycast {
            position: end,
            normal: Vec3::NEG_Y,
            hit: false,
        };
        let Some(nav_mesh) = self.nav_mesh.as_ref() else {
            return miss;
        };
        let query = NavMeshQuery::new(nav_mesh);
        let Some((start_ref, _)) = query.find_nearest_poly(start, extents, &self.query_filter) else {
            return miss;
        };
        match query.raycast(start_ref, start, end, &self.query_filter) {
            Ok(hit) if hit.is_hit() => NavigationRaycast {
                position: start.lerp(end, hit.t),
                normal: hit.normal,
                hit: true,
            },
            Ok(_) => miss,
            Err(e) => {
                log::warn!("Could not cast ray: {}", e);
                miss
            }
        }
    }
}
