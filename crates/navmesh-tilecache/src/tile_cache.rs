//! Tile cache implementation
//!
//! This module contains the [`TileCache`], which stores compressed tile layers and
//! rebuilds navigation mesh tiles from them whenever obstacles change.

use std::collections::{BTreeMap, VecDeque};

use glam::Vec3;
use navmesh_common::{ilog2_ceil, BoundingBox, Error, Result};
use navmesh_detour::{NavMesh, NavMeshBuilder, Status};

use super::allocator::LinearAllocator;
use super::compressor::TileCacheCompressor;
use super::mesh_process::MeshProcess;
use super::tile_cache_builder::{mark_box_area, mark_cylinder_area, TileCacheBuilder};
use super::tile_cache_data::{
    build_tile_cache_layer, decompress_tile_cache_layer, TileCacheLayerHeader, TileCacheParams,
};

/// Reference to a compressed tile. `0` is never a valid reference.
pub type CompressedTileRef = u32;

/// Reference to an obstacle, `(salt << 16) | index`. `0` means untracked.
pub type ObstacleRef = u32;

/// Cache-level tuning knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct TileCacheConfig {
    /// Maximum number of queued obstacle requests
    pub max_requests: usize,
    /// Maximum number of tiles rebuilt by one [`TileCache::update`] call
    pub max_tile_updates_per_call: usize,
}

impl Default for TileCacheConfig {
    fn default() -> Self {
        Self {
            max_requests: 64,
            max_tile_updates_per_call: 1,
        }
    }
}

/// Compressed tile owned by the cache
#[derive(Debug, Clone)]
pub struct CompressedTile {
    /// Header of the layer, also stored at the start of `data`
    pub header: TileCacheLayerHeader,
    /// Header followed by the compressed payload
    pub data: Vec<u8>,
    /// Flags the tile was added with
    pub flags: u32,
}

impl CompressedTile {
    /// The compressed payload without the header
    pub fn compressed(&self) -> &[u8] {
        &self.data[TileCacheLayerHeader::SERIALIZED_SIZE..]
    }
}

#[derive(Debug, Clone)]
struct TileSlot {
    salt: u32,
    tile: Option<CompressedTile>,
}

/// Obstacle shape
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum ObstacleData {
    /// Vertical cylinder standing on `pos`
    Cylinder { pos: Vec3, radius: f32, height: f32 },
    /// Axis-aligned box
    Box { bmin: Vec3, bmax: Vec3 },
}

impl ObstacleData {
    /// World-space bounds of the shape
    pub fn bounds(&self) -> BoundingBox {
        match *self {
            ObstacleData::Cylinder {
                pos,
                radius,
                height,
            } => BoundingBox::new(
                Vec3::new(pos.x - radius, pos.y, pos.z - radius),
                Vec3::new(pos.x + radius, pos.y + height, pos.z + radius),
            ),
            ObstacleData::Box { bmin, bmax } => BoundingBox::new(bmin, bmax),
        }
    }
}

/// Obstacle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum ObstacleState {
    /// Slot is free
    Empty,
    /// Added, tiles not yet rebuilt
    Processing,
    /// Carved into every touched tile
    Processed,
    /// Removal requested, tiles not yet rebuilt
    Removing,
}

/// Obstacle in the tile cache
#[derive(Debug, Clone)]
pub struct Obstacle {
    /// Obstacle shape
    pub data: ObstacleData,
    /// Obstacle state
    pub state: ObstacleState,
    /// Salt value for reference generation
    pub salt: u16,
    /// Tiles affected by this obstacle
    pub touched: Vec<CompressedTileRef>,
    /// Touched tiles not yet rebuilt
    pub pending: Vec<CompressedTileRef>,
}

impl Obstacle {
    fn empty() -> Self {
        Self {
            data: ObstacleData::Box {
                bmin: Vec3::ZERO,
                bmax: Vec3::ZERO,
            },
            state: ObstacleState::Empty,
            salt: 1,
            touched: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Whether the obstacle is currently carved into the tiles it touches
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            ObstacleState::Processing | ObstacleState::Processed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, Copy)]
struct ObstacleRequest {
    action: RequestAction,
    reference: ObstacleRef,
}

/// Stores compressed tile layers and keeps the navigation mesh in sync with the
/// obstacles carved into them
pub struct TileCache {
    params: TileCacheParams,
    config: TileCacheConfig,
    tile_bits: u32,
    salt_bits: u32,
    /// Tile slots
    tiles: Vec<TileSlot>,
    /// Free tile slots, next free slot last
    free_tiles: Vec<usize>,
    /// Tile lookup by location
    pos_lookup: BTreeMap<(i32, i32, i32), usize>,
    obstacles: Vec<Obstacle>,
    free_obstacles: Vec<usize>,
    requests: VecDeque<ObstacleRequest>,
    /// Tiles waiting for a rebuild
    update: VecDeque<CompressedTileRef>,
    allocator: LinearAllocator,
    compressor: Box<dyn TileCacheCompressor>,
    mesh_process: Option<Box<dyn MeshProcess>>,
    builder: TileCacheBuilder,
}

impl TileCache {
    /// Creates a new tile cache
    pub fn new(
        params: TileCacheParams,
        config: TileCacheConfig,
        allocator: LinearAllocator,
        compressor: Box<dyn TileCacheCompressor>,
        mesh_process: Option<Box<dyn MeshProcess>>,
    ) -> Result<Self> {
        if params.orig.iter().any(|v| !v.is_finite()) {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }
        params.validate()?;
        if params.max_obstacles > 0xffff {
            return Err(Error::TileCache(format!(
                "max obstacles {} exceeds {}",
                params.max_obstacles, 0xffff
            )));
        }
        if config.max_requests == 0 || config.max_tile_updates_per_call == 0 {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        let max_tiles = params.max_tiles as usize;
        let tile_bits = ilog2_ceil(params.max_tiles as u32);
        let salt_bits = 31u32.min(32 - tile_bits);
        if salt_bits == 0 {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        let max_obstacles = params.max_obstacles as usize;

        log::debug!(
            "Tile cache created: {} tiles, {} obstacles, {}x{} cells per tile",
            max_tiles,
            max_obstacles,
            params.width,
            params.height
        );

        Ok(Self {
            builder: TileCacheBuilder::new(params),
            params,
            config,
            tile_bits,
            salt_bits,
            tiles: vec![TileSlot { salt: 1, tile: None }; max_tiles],
            free_tiles: (0..max_tiles).rev().collect(),
            pos_lookup: BTreeMap::new(),
            obstacles: vec![Obstacle::empty(); max_obstacles],
            free_obstacles: (0..max_obstacles).rev().collect(),
            requests: VecDeque::new(),
            update: VecDeque::new(),
            allocator,
            compressor,
            mesh_process,
        })
    }

    pub fn params(&self) -> &TileCacheParams {
        &self.params
    }

    pub fn config(&self) -> &TileCacheConfig {
        &self.config
    }

    pub fn allocator(&self) -> &LinearAllocator {
        &self.allocator
    }

    pub fn compressor(&self) -> &dyn TileCacheCompressor {
        self.compressor.as_ref()
    }

    /// Replaces the hook applied to every mesh built from now on
    pub fn set_mesh_process(&mut self, mesh_process: Option<Box<dyn MeshProcess>>) {
        self.mesh_process = mesh_process;
    }

    /// Compresses one layer into tile data using the cache's compressor and
    /// allocator. The result can be passed to [`TileCache::add_tile`].
    pub fn build_layer_data(
        &mut self,
        header: &TileCacheLayerHeader,
        heights: &[u8],
        areas: &[u8],
        cons: &[u8],
    ) -> Result<Vec<u8>> {
        self.allocator.reset();
        build_tile_cache_layer(
            self.compressor.as_ref(),
            &mut self.allocator,
            header,
            heights,
            areas,
            cons,
        )
    }

    /// Checks that tile data decompresses to the grid its header announces
    /// and that the layer fits the cache's tile dimensions.
    pub fn validate_tile_data(&mut self, data: &[u8]) -> Result<TileCacheLayerHeader> {
        self.allocator.reset();
        let layer = decompress_tile_cache_layer(self.compressor.as_ref(), &mut self.allocator, data)?;
        if layer.header.width as i32 > self.params.width
            || layer.header.height as i32 > self.params.height
        {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }
        Ok(layer.header)
    }

    fn encode_tile_ref(&self, salt: u32, index: usize) -> CompressedTileRef {
        (salt << self.tile_bits) | index as u32
    }

    fn decode_tile_ref(&self, reference: CompressedTileRef) -> Option<usize> {
        if reference == 0 {
            return None;
        }
        let tile_mask = (1u32 << self.tile_bits) - 1;
        let salt_mask = (1u32 << self.salt_bits) - 1;
        let index = (reference & tile_mask) as usize;
        let salt = (reference >> self.tile_bits) & salt_mask;
        let slot = self.tiles.get(index)?;
        (slot.salt == salt && slot.tile.is_some()).then_some(index)
    }

    /// Adds a compressed tile to the cache.
    ///
    /// The header is validated and the tile takes ownership of `data`. Fails with
    /// `AlreadyExists` when a tile occupies the same `(x, y, layer)` and with
    /// `OutOfMemory` when every slot is in use.
    pub fn add_tile(&mut self, data: Vec<u8>, flags: u32) -> Result<CompressedTileRef> {
        let header = TileCacheLayerHeader::from_bytes(&data)?;
        if data.len() <= TileCacheLayerHeader::SERIALIZED_SIZE {
            return Err(Error::Detour(Status::DataCorrupted.to_string()));
        }

        let key = (header.tx, header.ty, header.tlayer);
        if self.pos_lookup.contains_key(&key) {
            return Err(Error::Detour(Status::AlreadyExists.to_string()));
        }

        let Some(index) = self.free_tiles.pop() else {
            return Err(Error::Detour(Status::OutOfMemory.to_string()));
        };

        self.tiles[index].tile = Some(CompressedTile {
            header,
            data,
            flags,
        });
        self.pos_lookup.insert(key, index);

        Ok(self.encode_tile_ref(self.tiles[index].salt, index))
    }

    /// Removes a tile from the cache and returns its data.
    ///
    /// The navigation mesh tile built from it is left in place; callers remove it
    /// from the [`NavMesh`] themselves.
    pub fn remove_tile(&mut self, reference: CompressedTileRef) -> Result<Vec<u8>> {
        let Some(index) = self.decode_tile_ref(reference) else {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        };

        let salt_mask = (1u32 << self.salt_bits) - 1;
        let slot = &mut self.tiles[index];
        let Some(tile) = slot.tile.take() else {
            return Err(Error::Detour(Status::NotFound.to_string()));
        };
        slot.salt = (slot.salt + 1) & salt_mask;
        if slot.salt == 0 {
            slot.salt = 1;
        }

        let header = &tile.header;
        self.pos_lookup.remove(&(header.tx, header.ty, header.tlayer));
        self.free_tiles.push(index);
        self.update.retain(|&r| r != reference);

        // A removed tile can no longer hold back the obstacles waiting on it
        for obstacle in &mut self.obstacles {
            obstacle.pending.retain(|&r| r != reference);
            obstacle.touched.retain(|&r| r != reference);
        }
        self.settle_obstacles();

        Ok(tile.data)
    }

    /// Number of tiles in the cache
    pub fn tile_count(&self) -> usize {
        self.pos_lookup.len()
    }

    /// Maximum number of tiles
    pub fn max_tiles(&self) -> usize {
        self.tiles.len()
    }

    /// References of every layer at grid cell `(x, y)`, sorted by layer
    pub fn get_tiles_at(&self, x: i32, y: i32) -> Vec<CompressedTileRef> {
        self.pos_lookup
            .range((x, y, i32::MIN)..=(x, y, i32::MAX))
            .map(|(_, &i)| self.encode_tile_ref(self.tiles[i].salt, i))
            .collect()
    }

    pub fn get_tile_at(&self, x: i32, y: i32, layer: i32) -> Option<&CompressedTile> {
        self.pos_lookup
            .get(&(x, y, layer))
            .and_then(|&i| self.tiles[i].tile.as_ref())
    }

    pub fn get_tile_ref_at(&self, x: i32, y: i32, layer: i32) -> Option<CompressedTileRef> {
        self.pos_lookup
            .get(&(x, y, layer))
            .map(|&i| self.encode_tile_ref(self.tiles[i].salt, i))
    }

    pub fn get_tile_by_ref(&self, reference: CompressedTileRef) -> Option<&CompressedTile> {
        self.decode_tile_ref(reference)
            .and_then(|i| self.tiles[i].tile.as_ref())
    }

    /// Iterates over every tile in the cache with its reference
    pub fn tiles(&self) -> impl Iterator<Item = (CompressedTileRef, &CompressedTile)> + '_ {
        self.pos_lookup.values().filter_map(move |&i| {
            let slot = &self.tiles[i];
            slot.tile
                .as_ref()
                .map(|tile| (self.encode_tile_ref(slot.salt, i), tile))
        })
    }

    /// Tight world bounds of the used area of a tile
    pub fn get_tile_bounds(&self, header: &TileCacheLayerHeader) -> BoundingBox {
        let cs = self.params.cs;
        BoundingBox::new(
            Vec3::new(
                header.bmin[0] + header.minx as f32 * cs,
                header.bmin[1],
                header.bmin[2] + header.miny as f32 * cs,
            ),
            Vec3::new(
                header.bmin[0] + (header.maxx as f32 + 1.0) * cs,
                header.bmax[1],
                header.bmin[2] + (header.maxy as f32 + 1.0) * cs,
            ),
        )
    }

    pub fn get_obstacle_bounds(&self, obstacle: &Obstacle) -> BoundingBox {
        obstacle.data.bounds()
    }

    /// References of the tiles whose tight bounds overlap `bounds`
    pub fn query_tiles(&self, bounds: &BoundingBox) -> Vec<CompressedTileRef> {
        let tw = self.params.width as f32 * self.params.cs;
        let th = self.params.height as f32 * self.params.cs;
        let orig = self.params.orig;
        let tx0 = ((bounds.min.x - orig[0]) / tw).floor() as i32;
        let tx1 = ((bounds.max.x - orig[0]) / tw).floor() as i32;
        let ty0 = ((bounds.min.z - orig[2]) / th).floor() as i32;
        let ty1 = ((bounds.max.z - orig[2]) / th).floor() as i32;

        let mut result = Vec::new();
        for ty in ty0..=ty1 {
            for tx in tx0..=tx1 {
                for reference in self.get_tiles_at(tx, ty) {
                    let Some(tile) = self.get_tile_by_ref(reference) else {
                        continue;
                    };
                    if self.get_tile_bounds(&tile.header).intersects(bounds) {
                        result.push(reference);
                    }
                }
            }
        }
        result
    }

    /// Adds a cylinder obstacle standing on `pos`.
    ///
    /// The obstacle is carved in by later [`TileCache::update`] calls.
    pub fn add_obstacle(&mut self, pos: Vec3, radius: f32, height: f32) -> Result<ObstacleRef> {
        self.add_obstacle_data(ObstacleData::Cylinder {
            pos,
            radius,
            height,
        })
    }

    /// Adds an axis-aligned box obstacle
    pub fn add_box_obstacle(&mut self, bmin: Vec3, bmax: Vec3) -> Result<ObstacleRef> {
        self.add_obstacle_data(ObstacleData::Box { bmin, bmax })
    }

    fn add_obstacle_data(&mut self, data: ObstacleData) -> Result<ObstacleRef> {
        if self.requests.len() >= self.config.max_requests {
            return Err(Error::Detour(Status::BufferTooSmall.to_string()));
        }
        let Some(index) = self.free_obstacles.pop() else {
            return Err(Error::Detour(Status::OutOfMemory.to_string()));
        };

        let obstacle = &mut self.obstacles[index];
        obstacle.data = data;
        obstacle.state = ObstacleState::Processing;
        obstacle.touched.clear();
        obstacle.pending.clear();

        let reference = Self::encode_obstacle_ref(obstacle.salt, index);
        self.requests.push_back(ObstacleRequest {
            action: RequestAction::Add,
            reference,
        });
        Ok(reference)
    }

    /// Queues the removal of an obstacle. Removing `0` does nothing.
    pub fn remove_obstacle(&mut self, reference: ObstacleRef) -> Result<()> {
        if reference == 0 {
            return Ok(());
        }
        if self.get_obstacle_by_ref(reference).is_none() {
            return Err(Error::Detour(Status::NotFound.to_string()));
        }
        if self.requests.len() >= self.config.max_requests {
            return Err(Error::Detour(Status::BufferTooSmall.to_string()));
        }
        self.requests.push_back(ObstacleRequest {
            action: RequestAction::Remove,
            reference,
        });
        Ok(())
    }

    fn encode_obstacle_ref(salt: u16, index: usize) -> ObstacleRef {
        ((salt as u32) << 16) | index as u32
    }

    fn decode_obstacle_ref(&self, reference: ObstacleRef) -> Option<usize> {
        let index = (reference & 0xffff) as usize;
        let salt = (reference >> 16) as u16;
        let obstacle = self.obstacles.get(index)?;
        (obstacle.salt == salt && obstacle.state != ObstacleState::Empty).then_some(index)
    }

    pub fn get_obstacle_by_ref(&self, reference: ObstacleRef) -> Option<&Obstacle> {
        self.decode_obstacle_ref(reference)
            .map(|i| &self.obstacles[i])
    }

    /// Number of obstacles not yet fully removed
    pub fn obstacle_count(&self) -> usize {
        self.obstacles.len() - self.free_obstacles.len()
    }

    /// Maximum number of obstacles
    pub fn max_obstacles(&self) -> usize {
        self.obstacles.len()
    }

    /// Whether no obstacle request or tile rebuild is outstanding
    pub fn is_up_to_date(&self) -> bool {
        self.requests.is_empty() && self.update.is_empty()
    }

    /// Advances obstacle processing.
    ///
    /// Queued requests are turned into tile rebuilds once the previous batch has
    /// been rebuilt, then at most `max_tile_updates_per_call` tiles are rebuilt. A
    /// tile that fails to rebuild is logged and skipped. Returns whether the cache
    /// is up to date afterwards.
    pub fn update(&mut self, _dt: f32, nav_mesh: &mut NavMesh) -> Result<bool> {
        if self.update.is_empty() {
            while let Some(request) = self.requests.pop_front() {
                self.process_request(request);
            }
            self.settle_obstacles();
        }

        for _ in 0..self.config.max_tile_updates_per_call {
            let Some(reference) = self.update.pop_front() else {
                break;
            };

            if let Err(e) = self.build_nav_mesh_tile(reference, nav_mesh) {
                log::warn!("Failed to rebuild tile {:#x}: {}", reference, e);
            }

            for obstacle in &mut self.obstacles {
                if matches!(
                    obstacle.state,
                    ObstacleState::Processing | ObstacleState::Removing
                ) {
                    obstacle.pending.retain(|&r| r != reference);
                }
            }
            self.settle_obstacles();
        }

        Ok(self.is_up_to_date())
    }

    fn process_request(&mut self, request: ObstacleRequest) {
        let Some(index) = self.decode_obstacle_ref(request.reference) else {
            return;
        };

        let bounds = self.obstacles[index].data.bounds();
        let touched = self.query_tiles(&bounds);
        for &reference in &touched {
            if !self.update.contains(&reference) {
                self.update.push_back(reference);
            }
        }

        let obstacle = &mut self.obstacles[index];
        if request.action == RequestAction::Remove {
            obstacle.state = ObstacleState::Removing;
        }
        obstacle.pending = touched.clone();
        obstacle.touched = touched;
    }

    /// Finishes obstacles whose touched tiles have all been rebuilt
    fn settle_obstacles(&mut self) {
        let queued: Vec<usize> = self
            .requests
            .iter()
            .filter_map(|r| self.decode_obstacle_ref(r.reference))
            .collect();
        for (index, obstacle) in self.obstacles.iter_mut().enumerate() {
            if !obstacle.pending.is_empty() || queued.contains(&index) {
                continue;
            }
            match obstacle.state {
                ObstacleState::Processing => obstacle.state = ObstacleState::Processed,
                ObstacleState::Removing => {
                    obstacle.state = ObstacleState::Empty;
                    obstacle.salt = obstacle.salt.wrapping_add(1).max(1);
                    obstacle.touched.clear();
                    self.free_obstacles.push(index);
                }
                _ => {}
            }
        }
    }

    /// Rebuilds the navigation mesh tiles of every layer at `(x, y)`
    pub fn build_nav_mesh_tiles_at(&mut self, x: i32, y: i32, nav_mesh: &mut NavMesh) -> Result<()> {
        for reference in self.get_tiles_at(x, y) {
            self.build_nav_mesh_tile(reference, nav_mesh)?;
        }
        Ok(())
    }

    /// Rebuilds the navigation mesh tile of one compressed tile.
    ///
    /// The layer is decompressed, active obstacles are carved into it and the result
    /// replaces the tile at the same location in `nav_mesh`. A layer without
    /// walkable cells only removes the existing tile.
    pub fn build_nav_mesh_tile(
        &mut self,
        reference: CompressedTileRef,
        nav_mesh: &mut NavMesh,
    ) -> Result<()> {
        let Some(index) = self.decode_tile_ref(reference) else {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        };
        let Some(tile) = self.tiles[index].tile.as_ref() else {
            return Err(Error::Detour(Status::NotFound.to_string()));
        };

        self.allocator.reset();
        let mut layer =
            decompress_tile_cache_layer(self.compressor.as_ref(), &mut self.allocator, &tile.data)?;

        let bounds = self.get_tile_bounds(&layer.header);
        let (cs, ch) = (self.params.cs, self.params.ch);
        for obstacle in self.obstacles.iter().filter(|o| o.is_active()) {
            if !obstacle.data.bounds().intersects(&bounds) {
                continue;
            }
            match obstacle.data {
                ObstacleData::Cylinder {
                    pos,
                    radius,
                    height,
                } => mark_cylinder_area(&mut layer, cs, ch, pos, radius, height, 0),
                ObstacleData::Box { bmin, bmax } => {
                    mark_box_area(&mut layer, cs, ch, bmin, bmax, 0)
                }
            }
        }

        let built = self.builder.build(&layer)?;

        let header = &layer.header;
        if let Some(existing) = nav_mesh.get_tile_ref_at(header.tx, header.ty, header.tlayer) {
            nav_mesh.remove_tile(existing)?;
        }

        let Some(mut params) = built else {
            return Ok(());
        };

        if let Some(mesh_process) = self.mesh_process.as_mut() {
            mesh_process.process(&mut params);
        }

        let mesh_tile = NavMeshBuilder::build_tile(&params)?;
        nav_mesh.add_tile(mesh_tile)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::Lz4Compressor;
    use crate::tile_cache_data::{build_tile_cache_layer, COMPRESSED_TILE_FREE_DATA};
    use crate::tile_cache_data::tests::flat_layer;
    use navmesh_detour::{NavMeshCreateParams, NavMeshParams, PolyFlags};

    fn params() -> TileCacheParams {
        TileCacheParams {
            cs: 1.0,
            ch: 0.5,
            width: 16,
            height: 16,
            max_tiles: 16,
            max_obstacles: 32,
            ..Default::default()
        }
    }

    fn cache_with(params: TileCacheParams, config: TileCacheConfig) -> TileCache {
        let walkable = |p: &mut NavMeshCreateParams| {
            for (flags, &area) in p.poly_flags.iter_mut().zip(&p.poly_areas) {
                if area != 0 {
                    *flags = PolyFlags::WALK;
                }
            }
        };
        TileCache::new(
            params,
            config,
            LinearAllocator::default(),
            Box::new(Lz4Compressor::new()),
            Some(Box::new(walkable)),
        )
        .unwrap()
    }

    fn cache() -> TileCache {
        cache_with(params(), TileCacheConfig::default())
    }

    fn nav_mesh() -> NavMesh {
        NavMesh::new(NavMeshParams {
            origin: [0.0; 3],
            tile_width: 16.0,
            tile_height: 16.0,
            max_tiles: 16,
            max_polys_per_tile: 256,
        })
        .unwrap()
    }

    fn tile_data(tx: i32, ty: i32) -> Vec<u8> {
        let (header, heights, areas, cons) = flat_layer(tx, ty);
        build_tile_cache_layer(
            &Lz4Compressor::new(),
            &mut LinearAllocator::default(),
            &header,
            &heights,
            &areas,
            &cons,
        )
        .unwrap()
    }

    fn poly_count(nav_mesh: &NavMesh, x: i32, y: i32) -> usize {
        nav_mesh.get_tile_at(x, y, 0).map_or(0, |t| t.polys.len())
    }

    fn drain(cache: &mut TileCache, nav_mesh: &mut NavMesh) -> usize {
        let mut calls = 1;
        while !cache.update(0.0, nav_mesh).unwrap() {
            calls += 1;
            assert!(calls < 100);
        }
        calls
    }

    #[test]
    fn test_invalid_params() {
        let config = TileCacheConfig::default();
        let make = |p: TileCacheParams| {
            TileCache::new(
                p,
                config,
                LinearAllocator::default(),
                Box::new(Lz4Compressor::new()),
                None,
            )
        };
        assert!(make(TileCacheParams {
            orig: [f32::INFINITY, 0.0, 0.0],
            ..params()
        })
        .is_err());
        assert!(make(TileCacheParams { cs: -0.3, ..params() }).is_err());
        assert!(make(TileCacheParams { width: 0, ..params() }).is_err());
        assert!(make(TileCacheParams {
            max_obstacles: 0x10000,
            ..params()
        })
        .is_err());
    }

    #[test]
    fn test_tile_management() {
        let mut cache = cache();
        let a = cache.add_tile(tile_data(0, 0), COMPRESSED_TILE_FREE_DATA).unwrap();
        let b = cache.add_tile(tile_data(1, 0), COMPRESSED_TILE_FREE_DATA).unwrap();
        assert_ne!(a, 0);
        assert_eq!(cache.tile_count(), 2);
        assert_eq!(cache.get_tiles_at(0, 0), vec![a]);
        assert_eq!(cache.get_tile_ref_at(1, 0, 0), Some(b));
        assert_eq!(cache.get_tile_at(1, 0, 0).unwrap().header.tx, 1);
        assert_eq!(cache.tiles().count(), 2);

        let err = cache.add_tile(tile_data(0, 0), 0).unwrap_err();
        assert!(err.to_string().contains("already exists"));

        let data = cache.remove_tile(a).unwrap();
        assert_eq!(data, tile_data(0, 0));
        assert_eq!(cache.tile_count(), 1);
        assert!(cache.get_tile_by_ref(a).is_none());
        assert!(cache.remove_tile(a).is_err());

        // The slot is reused with a new salt
        let c = cache.add_tile(tile_data(0, 0), 0).unwrap();
        assert_ne!(c, a);
        assert!(cache.get_tile_by_ref(c).is_some());
    }

    #[test]
    fn test_add_tile_rejects_bad_data() {
        let mut cache = cache();
        let mut data = tile_data(0, 0);
        data[0] ^= 0xff;
        assert!(cache.add_tile(data, 0).is_err());

        let data = tile_data(0, 0);
        assert!(cache
            .add_tile(data[..TileCacheLayerHeader::SERIALIZED_SIZE].to_vec(), 0)
            .is_err());
        assert_eq!(cache.tile_count(), 0);
    }

    #[test]
    fn test_add_tile_out_of_slots() {
        let mut cache = cache_with(
            TileCacheParams {
                max_tiles: 1,
                ..params()
            },
            TileCacheConfig::default(),
        );
        cache.add_tile(tile_data(0, 0), 0).unwrap();
        let err = cache.add_tile(tile_data(1, 0), 0).unwrap_err();
        assert!(err.to_string().contains("Out of memory"));
    }

    #[test]
    fn test_build_nav_mesh_tiles() {
        let mut cache = cache();
        let mut nav_mesh = nav_mesh();
        for (x, y) in [(0, 0), (1, 0)] {
            cache.add_tile(tile_data(x, y), 0).unwrap();
            cache.build_nav_mesh_tiles_at(x, y, &mut nav_mesh).unwrap();
        }

        assert_eq!(nav_mesh.tile_count(), 2);
        let tile = nav_mesh.get_tile_at(0, 0, 0).unwrap();
        assert_eq!(tile.polys.len(), 1);
        assert_eq!(tile.polys[0].flags, PolyFlags::WALK);

        // Rebuilding replaces the tile instead of failing
        cache.build_nav_mesh_tiles_at(0, 0, &mut nav_mesh).unwrap();
        assert_eq!(nav_mesh.tile_count(), 2);
    }

    #[test]
    fn test_obstacle_carving_is_reversible() {
        let mut cache = cache();
        let mut nav_mesh = nav_mesh();
        cache.add_tile(tile_data(0, 0), 0).unwrap();
        cache.build_nav_mesh_tiles_at(0, 0, &mut nav_mesh).unwrap();
        assert_eq!(poly_count(&nav_mesh, 0, 0), 1);

        let ob = cache.add_obstacle(Vec3::new(8.0, 0.0, 8.0), 1.0, 2.0).unwrap();
        assert_ne!(ob, 0);
        assert_eq!(
            cache.get_obstacle_by_ref(ob).unwrap().state,
            ObstacleState::Processing
        );
        drain(&mut cache, &mut nav_mesh);
        assert_eq!(
            cache.get_obstacle_by_ref(ob).unwrap().state,
            ObstacleState::Processed
        );
        assert!(poly_count(&nav_mesh, 0, 0) > 1);

        cache.remove_obstacle(ob).unwrap();
        drain(&mut cache, &mut nav_mesh);
        assert!(cache.get_obstacle_by_ref(ob).is_none());
        assert_eq!(cache.obstacle_count(), 0);
        assert_eq!(poly_count(&nav_mesh, 0, 0), 1);
    }

    #[test]
    fn test_obstacle_batching() {
        let mut cache = cache();
        let mut nav_mesh = nav_mesh();
        for (x, y) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
            cache.add_tile(tile_data(x, y), 0).unwrap();
            cache.build_nav_mesh_tiles_at(x, y, &mut nav_mesh).unwrap();
        }

        for pos in [
            Vec3::new(8.0, 0.0, 8.0),
            Vec3::new(24.0, 0.0, 8.0),
            Vec3::new(8.0, 0.0, 24.0),
        ] {
            cache.add_obstacle(pos, 1.0, 2.0).unwrap();
        }
        assert!(!cache.is_up_to_date());

        assert!(!cache.update(0.0, &mut nav_mesh).unwrap());
        assert!(!cache.update(0.0, &mut nav_mesh).unwrap());
        assert!(cache.update(0.0, &mut nav_mesh).unwrap());

        assert!(poly_count(&nav_mesh, 0, 0) > 1);
        assert!(poly_count(&nav_mesh, 1, 0) > 1);
        assert!(poly_count(&nav_mesh, 0, 1) > 1);
        assert_eq!(poly_count(&nav_mesh, 1, 1), 1);
    }

    #[test]
    fn test_removing_pending_tile_settles_obstacle() {
        let mut cache = cache_with(
            params(),
            TileCacheConfig {
                max_requests: 8,
                max_tile_updates_per_call: 1,
            },
        );
        let mut nav_mesh = nav_mesh();
        let a = cache.add_tile(tile_data(0, 0), 0).unwrap();
        let b = cache.add_tile(tile_data(1, 0), 0).unwrap();
        cache.build_nav_mesh_tiles_at(0, 0, &mut nav_mesh).unwrap();
        cache.build_nav_mesh_tiles_at(1, 0, &mut nav_mesh).unwrap();

        // On the seam, so both tiles are touched
        let ob = cache.add_obstacle(Vec3::new(16.0, 0.0, 8.0), 1.0, 2.0).unwrap();
        drain(&mut cache, &mut nav_mesh);
        assert_eq!(cache.get_obstacle_by_ref(ob).unwrap().touched, vec![a, b]);

        cache.remove_obstacle(ob).unwrap();
        assert!(!cache.update(0.0, &mut nav_mesh).unwrap());
        assert_eq!(
            cache.get_obstacle_by_ref(ob).unwrap().state,
            ObstacleState::Removing
        );

        cache.remove_tile(b).unwrap();
        assert!(cache.is_up_to_date());
        assert!(cache.get_obstacle_by_ref(ob).is_none());
        assert_eq!(cache.obstacle_count(), 0);

        // The slot is free for a new obstacle
        let next = cache.add_obstacle(Vec3::new(8.0, 0.0, 8.0), 1.0, 2.0).unwrap();
        drain(&mut cache, &mut nav_mesh);
        assert_eq!(
            cache.get_obstacle_by_ref(next).unwrap().state,
            ObstacleState::Processed
        );
    }

    #[test]
    fn test_request_queue_is_bounded() {
        let mut cache = cache_with(
            params(),
            TileCacheConfig {
                max_requests: 2,
                max_tile_updates_per_call: 1,
            },
        );
        cache.add_obstacle(Vec3::ZERO, 1.0, 1.0).unwrap();
        cache.add_obstacle(Vec3::ZERO, 1.0, 1.0).unwrap();
        let err = cache.add_obstacle(Vec3::ZERO, 1.0, 1.0).unwrap_err();
        assert!(err.to_string().contains("Buffer too small"));
    }

    #[test]
    fn test_obstacle_without_tiles_settles() {
        let mut cache = cache();
        let mut nav_mesh = nav_mesh();
        let ob = cache
            .add_box_obstacle(Vec3::new(100.0, 0.0, 100.0), Vec3::new(101.0, 1.0, 101.0))
            .unwrap();
        assert!(cache.update(0.0, &mut nav_mesh).unwrap());
        assert_eq!(
            cache.get_obstacle_by_ref(ob).unwrap().state,
            ObstacleState::Processed
        );

        cache.remove_obstacle(0).unwrap();
        cache.remove_obstacle(ob).unwrap();
        assert!(cache.update(0.0, &mut nav_mesh).unwrap());
        assert!(cache.remove_obstacle(ob).is_err());
    }

    #[test]
    fn test_query_tiles_and_bounds() {
        let mut cache = cache();
        let a = cache.add_tile(tile_data(0, 0), 0).unwrap();
        let b = cache.add_tile(tile_data(1, 0), 0).unwrap();

        let header = cache.get_tile_by_ref(a).unwrap().header;
        let bounds = cache.get_tile_bounds(&header);
        assert_eq!(bounds.min, Vec3::new(0.0, 0.0, 0.0));
        assert_eq!(bounds.max, Vec3::new(16.0, 1.0, 16.0));

        let query = BoundingBox::new(Vec3::new(15.0, 0.0, 1.0), Vec3::new(17.0, 1.0, 2.0));
        assert_eq!(cache.query_tiles(&query), vec![a, b]);
        let query = BoundingBox::new(Vec3::new(20.0, 0.0, 1.0), Vec3::new(21.0, 1.0, 2.0));
        assert_eq!(cache.query_tiles(&query), vec![b]);
    }

    #[test]
    fn test_build_and_validate_layer_data() {
        let mut cache = cache();
        let (header, heights, areas, cons) = flat_layer(2, 3);
        let data = cache.build_layer_data(&header, &heights, &areas, &cons).unwrap();
        assert_eq!(data, tile_data(2, 3));
        assert_eq!(cache.validate_tile_data(&data).unwrap(), header);

        let truncated = &data[..data.len() - 4];
        assert!(cache.validate_tile_data(truncated).is_err());

        let mut too_wide = cache_with(
            TileCacheParams {
                width: 8,
                height: 8,
                ..params()
            },
            TileCacheConfig::default(),
        );
        assert!(too_wide.validate_tile_data(&data).is_err());
    }
}
