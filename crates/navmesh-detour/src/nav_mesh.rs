//! Navigation mesh implementation
//!
//! The navigation mesh is a fixed pool of tile slots. A tile occupies one slot and is
//! located through a `(x, y, layer)` lookup. Every slot carries a salt that changes
//! whenever its tile is removed, which invalidates all references into the old tile.

use std::collections::{HashMap, HashSet};

use glam::Vec3;

use super::{NavMeshParams, PolyFlags, PolyRef, PolyType, Status, EXT_LINK, MAX_VERTS_PER_POLY};
use navmesh_common::{ilog2_ceil, Error, Result};

/// Side value of links that stay inside a tile
const LINK_SIDE_INTERNAL: u8 = 0xff;

/// Minimum salt bits for references to stay unique long enough
const MIN_SALT_BITS: u32 = 10;

/// Link between two polygons
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Link {
    /// Reference to the connected polygon
    pub reference: PolyRef,
    /// Edge index of the connection, 0xff for off-mesh landings
    pub edge_index: u8,
    /// Tile side crossed by the link, 0xff for links inside the tile
    pub side: u8,
    /// Index of the next link of the same polygon
    pub next: Option<usize>,
}

impl Link {
    /// Whether the link leads into a neighbouring tile
    pub fn crosses_tile_border(&self) -> bool {
        self.side != LINK_SIDE_INTERNAL
    }
}

/// Polygon in the navigation mesh
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Poly {
    /// First link index
    pub first_link: Option<usize>,
    /// Vertices of the polygon (indices into the tile vertex array)
    pub verts: [u16; MAX_VERTS_PER_POLY],
    /// Neighbour per edge: 0 = solid, `idx + 1` = polygon in this tile,
    /// `EXT_LINK | side` = tile border
    pub neighbors: [u16; MAX_VERTS_PER_POLY],
    /// Flags for the polygon
    pub flags: PolyFlags,
    /// Number of vertices in the polygon
    pub vert_count: u8,
    /// Area ID of the polygon
    pub area: u8,
    /// Polygon type
    pub poly_type: PolyType,
}

impl Poly {
    /// Creates a new polygon
    pub fn new(area: u8, poly_type: PolyType, flags: PolyFlags) -> Self {
        Self {
            first_link: None,
            verts: [0; MAX_VERTS_PER_POLY],
            neighbors: [0; MAX_VERTS_PER_POLY],
            flags,
            vert_count: 0,
            area,
            poly_type,
        }
    }
}

/// Off-mesh connection stored in the tile containing its start point
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct OffMeshConnection {
    /// Connection end points \[sx,sy,sz,ex,ey,ez\]
    pub pos: [f32; 6],
    /// Connection radius
    pub radius: f32,
    /// Index of the polygon representing the connection
    pub poly: u16,
    /// Flags
    pub flags: PolyFlags,
    /// Area ID
    pub area: u8,
    /// Whether the connection can be traversed from end to start
    pub bidirectional: bool,
    /// User ID
    pub user_id: u32,
}

impl OffMeshConnection {
    /// Creates a new off-mesh connection with specified parameters
    pub fn new_with_params(
        start_pos: [f32; 3],
        end_pos: [f32; 3],
        radius: f32,
        flags: PolyFlags,
        area: u8,
        bidirectional: bool,
        user_id: u32,
    ) -> Self {
        Self {
            pos: [
                start_pos[0],
                start_pos[1],
                start_pos[2],
                end_pos[0],
                end_pos[1],
                end_pos[2],
            ],
            radius,
            poly: 0,
            flags,
            area,
            bidirectional,
            user_id,
        }
    }

    /// Gets the start position of the connection
    pub fn start_pos(&self) -> Vec3 {
        Vec3::new(self.pos[0], self.pos[1], self.pos[2])
    }

    /// Gets the end position of the connection
    pub fn end_pos(&self) -> Vec3 {
        Vec3::new(self.pos[3], self.pos[4], self.pos[5])
    }
}

/// Tile header information
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct TileHeader {
    /// Tile position (x, y, layer)
    pub x: i32,
    pub y: i32,
    pub layer: i32,
    /// User defined data
    pub user_id: u32,
    /// Bounding box of the tile
    pub bmin: [f32; 3],
    pub bmax: [f32; 3],
    /// Number of polys in the tile
    pub poly_count: i32,
    /// Number of vertices in the tile
    pub vert_count: i32,
    /// Index of the first off-mesh connection polygon
    pub off_mesh_base: i32,
    /// Number of off-mesh connections in the tile
    pub off_mesh_connection_count: i32,
    /// Agent dimensions the tile was built for
    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
}

impl TileHeader {
    /// Creates a new tile header
    pub fn new(x: i32, y: i32, layer: i32) -> Self {
        Self {
            x,
            y,
            layer,
            user_id: 0,
            bmin: [0.0; 3],
            bmax: [0.0; 3],
            poly_count: 0,
            vert_count: 0,
            off_mesh_base: 0,
            off_mesh_connection_count: 0,
            walkable_height: 0.0,
            walkable_radius: 0.0,
            walkable_climb: 0.0,
        }
    }
}

/// Mesh tile in the navigation mesh
#[derive(Debug, Clone, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct MeshTile {
    /// Salt value of the slot holding the tile
    pub salt: u32,
    /// Tile header, `None` for free slots
    pub header: Option<TileHeader>,
    /// Polygons in the tile
    pub polys: Vec<Poly>,
    /// Vertices in the tile [x,y,z,...]
    pub verts: Vec<f32>,
    /// Links between polygons
    pub links: Vec<Link>,
    /// Off-mesh connections
    pub off_mesh_connections: Vec<OffMeshConnection>,
    /// Next free slot (used for memory management)
    pub next: Option<usize>,
}

impl MeshTile {
    /// Creates a new empty mesh tile
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns vertex `i` of the tile
    pub fn vert(&self, i: u16) -> Vec3 {
        let i = i as usize * 3;
        Vec3::new(self.verts[i], self.verts[i + 1], self.verts[i + 2])
    }

    /// Returns the vertices of `poly`
    pub fn poly_verts(&self, poly: &Poly) -> Vec<Vec3> {
        poly.verts[..poly.vert_count as usize]
            .iter()
            .map(|&v| self.vert(v))
            .collect()
    }

    /// Iterates over the links of polygon `poly_index`
    pub fn poly_links(&self, poly_index: usize) -> impl Iterator<Item = &Link> + '_ {
        let mut next = self.polys.get(poly_index).and_then(|p| p.first_link);
        std::iter::from_fn(move || {
            let link = self.links.get(next?)?;
            next = link.next;
            Some(link)
        })
    }

    fn location(&self) -> Option<(i32, i32, i32)> {
        self.header.as_ref().map(|h| (h.x, h.y, h.layer))
    }
}

/// Navigation mesh structure
#[derive(Debug)]
pub struct NavMesh {
    /// Navigation mesh parameters
    params: NavMeshParams,
    tile_bits: u32,
    poly_bits: u32,
    salt_bits: u32,
    /// Tile slots
    tiles: Vec<MeshTile>,
    /// First free tile slot
    next_free: Option<usize>,
    /// Tile lookup by location
    pos_lookup: HashMap<(i32, i32, i32), usize>,
}

impl NavMesh {
    /// Creates a new navigation mesh
    pub fn new(params: NavMeshParams) -> Result<Self> {
        if params.origin.iter().any(|v| !v.is_finite()) {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        if params.tile_width <= 0.0 || params.tile_height <= 0.0 {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        if params.max_tiles <= 0 || params.max_polys_per_tile <= 0 {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        let tile_bits = ilog2_ceil(params.max_tiles as u32);
        let poly_bits = ilog2_ceil(params.max_polys_per_tile as u32);
        let salt_bits = 31u32.min(32u32.saturating_sub(tile_bits + poly_bits));
        if salt_bits < MIN_SALT_BITS {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        let max_tiles = params.max_tiles as usize;
        let tiles = (0..max_tiles)
            .map(|i| MeshTile {
                salt: 1,
                next: (i + 1 < max_tiles).then_some(i + 1),
                ..Default::default()
            })
            .collect();

        Ok(Self {
            params,
            tile_bits,
            poly_bits,
            salt_bits,
            tiles,
            next_free: Some(0),
            pos_lookup: HashMap::new(),
        })
    }

    /// Gets the parameters the mesh was created with
    pub fn params(&self) -> &NavMeshParams {
        &self.params
    }

    /// Maximum number of tiles
    pub fn max_tiles(&self) -> usize {
        self.tiles.len()
    }

    /// Number of bits used for the tile index in references
    pub fn tile_bits(&self) -> u32 {
        self.tile_bits
    }

    /// Number of bits used for the polygon index in references
    pub fn poly_bits(&self) -> u32 {
        self.poly_bits
    }

    /// Number of tiles currently in the mesh
    pub fn tile_count(&self) -> usize {
        self.pos_lookup.len()
    }

    /// Creates a reference from salt, tile index and polygon index
    pub fn encode_poly_ref(&self, salt: u32, tile_index: u32, poly_index: u32) -> PolyRef {
        let salt_mask = (1u32 << self.salt_bits) - 1;
        let tile_mask = (1u32 << self.tile_bits) - 1;
        let poly_mask = (1u32 << self.poly_bits) - 1;
        PolyRef::new(
            ((salt & salt_mask) << (self.poly_bits + self.tile_bits))
                | ((tile_index & tile_mask) << self.poly_bits)
                | (poly_index & poly_mask),
        )
    }

    /// Decodes a reference into `(salt, tile_index, poly_index)`
    pub fn decode_poly_ref(&self, reference: PolyRef) -> (u32, u32, u32) {
        let salt_mask = (1u32 << self.salt_bits) - 1;
        let tile_mask = (1u32 << self.tile_bits) - 1;
        let poly_mask = (1u32 << self.poly_bits) - 1;
        let id = reference.id();
        (
            (id >> (self.poly_bits + self.tile_bits)) & salt_mask,
            (id >> self.poly_bits) & tile_mask,
            id & poly_mask,
        )
    }

    /// Calculates the tile grid location of a world position
    pub fn calc_tile_loc(&self, pos: Vec3) -> (i32, i32) {
        let tx = ((pos.x - self.params.origin[0]) / self.params.tile_width).floor() as i32;
        let ty = ((pos.z - self.params.origin[2]) / self.params.tile_height).floor() as i32;
        (tx, ty)
    }

    /// Adds a tile built by [`NavMeshBuilder`](super::NavMeshBuilder).
    ///
    /// Fails with `AlreadyExists` when a tile occupies the same location and with
    /// `OutOfMemory` when all slots are used. Returns the tile reference.
    pub fn add_tile(&mut self, mut tile: MeshTile) -> Result<PolyRef> {
        let Some((x, y, layer)) = tile.location() else {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        };

        if self.pos_lookup.contains_key(&(x, y, layer)) {
            return Err(Error::Detour(Status::AlreadyExists.to_string()));
        }

        if tile.polys.len() > 1 << self.poly_bits
            || tile.polys.len() > self.params.max_polys_per_tile as usize
        {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        let Some(index) = self.next_free else {
            return Err(Error::Detour(Status::OutOfMemory.to_string()));
        };

        let slot = &mut self.tiles[index];
        self.next_free = slot.next;
        tile.salt = slot.salt;
        tile.next = None;
        tile.links.clear();
        for poly in &mut tile.polys {
            poly.first_link = None;
        }
        *slot = tile;

        self.pos_lookup.insert((x, y, layer), index);
        self.relink_around(x, y, Some(index));

        log::trace!(
            "Added navmesh tile ({}, {}, {}) in slot {}",
            x,
            y,
            layer,
            index
        );

        Ok(self.encode_poly_ref(self.tiles[index].salt, index as u32, 0))
    }

    /// Removes the tile referenced by `tile_ref` and returns it
    pub fn remove_tile(&mut self, tile_ref: PolyRef) -> Result<MeshTile> {
        let index = self.tile_index_by_ref(tile_ref)?;
        let Some((x, y, layer)) = self.tiles[index].location() else {
            return Err(Error::Detour(Status::NotFound.to_string()));
        };

        self.pos_lookup.remove(&(x, y, layer));

        let salt_mask = (1u32 << self.salt_bits) - 1;
        let slot = &mut self.tiles[index];
        let mut salt = (slot.salt + 1) & salt_mask;
        if salt == 0 {
            salt = 1;
        }

        let mut removed = std::mem::take(slot);
        slot.salt = salt;
        slot.next = self.next_free;
        self.next_free = Some(index);

        removed.links.clear();
        for poly in &mut removed.polys {
            poly.first_link = None;
        }

        self.relink_around(x, y, None);

        log::trace!("Removed navmesh tile ({}, {}, {})", x, y, layer);

        Ok(removed)
    }

    /// Gets the tile at the specified location
    pub fn get_tile_at(&self, x: i32, y: i32, layer: i32) -> Option<&MeshTile> {
        self.pos_lookup.get(&(x, y, layer)).map(|&i| &self.tiles[i])
    }

    /// Gets all tiles at the specified grid cell, sorted by layer
    pub fn get_tiles_at(&self, x: i32, y: i32) -> Vec<&MeshTile> {
        let mut tiles: Vec<(i32, &MeshTile)> = self
            .pos_lookup
            .iter()
            .filter(|((tx, ty, _), _)| *tx == x && *ty == y)
            .map(|(&(_, _, layer), &i)| (layer, &self.tiles[i]))
            .collect();
        tiles.sort_by_key(|(layer, _)| *layer);
        tiles.into_iter().map(|(_, tile)| tile).collect()
    }

    /// Gets the reference of the tile at the specified location
    pub fn get_tile_ref_at(&self, x: i32, y: i32, layer: i32) -> Option<PolyRef> {
        self.pos_lookup
            .get(&(x, y, layer))
            .map(|&i| self.encode_poly_ref(self.tiles[i].salt, i as u32, 0))
    }

    /// Gets a tile by its reference
    pub fn get_tile_by_ref(&self, tile_ref: PolyRef) -> Option<&MeshTile> {
        self.tile_index_by_ref(tile_ref)
            .ok()
            .map(|i| &self.tiles[i])
    }

    /// Iterates over all tiles currently in the mesh
    pub fn tiles(&self) -> impl Iterator<Item = &MeshTile> + '_ {
        self.tiles.iter().filter(|t| t.header.is_some())
    }

    /// Base polygon reference of the tile at the specified location
    pub fn get_poly_ref_base(&self, x: i32, y: i32, layer: i32) -> Option<PolyRef> {
        self.get_tile_ref_at(x, y, layer)
    }

    /// Gets the tile and polygon for a polygon reference
    pub fn get_tile_and_poly_by_ref(&self, reference: PolyRef) -> Result<(&MeshTile, &Poly)> {
        let (_, _, poly_index) = self.decode_poly_ref(reference);
        let index = self.tile_index_by_ref(reference)?;
        let tile = &self.tiles[index];
        let poly = tile
            .polys
            .get(poly_index as usize)
            .ok_or_else(|| Error::Detour(Status::InvalidParam.to_string()))?;
        Ok((tile, poly))
    }

    /// Checks whether a polygon reference points at a live polygon
    pub fn is_valid_poly_ref(&self, reference: PolyRef) -> bool {
        self.get_tile_and_poly_by_ref(reference).is_ok()
    }

    /// References of the polygons linked to `reference`
    pub fn get_poly_neighbors(&self, reference: PolyRef) -> Result<Vec<PolyRef>> {
        let (_, _, poly_index) = self.decode_poly_ref(reference);
        let (tile, _) = self.get_tile_and_poly_by_ref(reference)?;
        Ok(tile
            .poly_links(poly_index as usize)
            .map(|l| l.reference)
            .collect())
    }

    /// Returns the references of ground polygons whose bounds overlap the box
    pub fn query_polygons(&self, center: Vec3, half_extents: Vec3) -> Vec<PolyRef> {
        let bmin = center - half_extents;
        let bmax = center + half_extents;
        let mut result = Vec::new();
        for index in self.tile_indices_in_bounds(bmin, bmax) {
            let tile = &self.tiles[index];
            for (pi, poly) in tile.polys.iter().enumerate() {
                if poly.poly_type != PolyType::Ground {
                    continue;
                }
                let (pmin, pmax) = poly_bounds(tile, poly);
                if overlap_bounds(bmin, bmax, pmin, pmax) {
                    result.push(self.encode_poly_ref(tile.salt, index as u32, pi as u32));
                }
            }
        }
        result
    }

    /// Finds the polygon nearest to `center` within the query box.
    ///
    /// Returns the polygon reference and the closest point on it.
    pub fn find_nearest_poly(&self, center: Vec3, half_extents: Vec3) -> Option<(PolyRef, Vec3)> {
        let bmin = center - half_extents;
        let bmax = center + half_extents;
        let mut best: Option<(PolyRef, Vec3, f32)> = None;
        for index in self.tile_indices_in_bounds(bmin, bmax) {
            if let Some((pi, point, d)) = nearest_poly_in_tile(&self.tiles[index], center, bmin, bmax)
            {
                if best.map_or(true, |(_, _, bd)| d < bd) {
                    let reference =
                        self.encode_poly_ref(self.tiles[index].salt, index as u32, pi as u32);
                    best = Some((reference, point, d));
                }
            }
        }
        best.map(|(reference, point, _)| (reference, point))
    }

    /// Finds the closest point on the polygon to `pos`
    pub fn closest_point_on_poly(&self, reference: PolyRef, pos: Vec3) -> Result<Vec3> {
        let (tile, poly) = self.get_tile_and_poly_by_ref(reference)?;
        if poly.poly_type == PolyType::OffMeshConnection {
            let a = tile.vert(poly.verts[0]);
            let b = tile.vert(poly.verts[1]);
            return Ok(closest_point_on_segment(pos, a, b));
        }
        Ok(closest_point_on_polygon(&tile.poly_verts(poly), pos))
    }

    /// Replaces the flags of a polygon
    pub fn set_poly_flags(&mut self, reference: PolyRef, flags: PolyFlags) -> Result<()> {
        let (_, _, poly_index) = self.decode_poly_ref(reference);
        let index = self.tile_index_by_ref(reference)?;
        let poly = self.tiles[index]
            .polys
            .get_mut(poly_index as usize)
            .ok_or_else(|| Error::Detour(Status::InvalidParam.to_string()))?;
        poly.flags = flags;
        Ok(())
    }

    fn tile_index_by_ref(&self, reference: PolyRef) -> Result<usize> {
        if !reference.is_valid() {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }
        let (salt, tile_index, _) = self.decode_poly_ref(reference);
        let tile = self
            .tiles
            .get(tile_index as usize)
            .ok_or_else(|| Error::Detour(Status::InvalidParam.to_string()))?;
        if tile.salt != salt || tile.header.is_none() {
            return Err(Error::Detour(Status::NotFound.to_string()));
        }
        Ok(tile_index as usize)
    }

    fn tile_indices_in_bounds(&self, bmin: Vec3, bmax: Vec3) -> Vec<usize> {
        let (minx, miny) = self.calc_tile_loc(bmin);
        let (maxx, maxy) = self.calc_tile_loc(bmax);
        let mut indices: Vec<usize> = self
            .pos_lookup
            .iter()
            .filter(|((x, y, _), _)| *x >= minx && *x <= maxx && *y >= miny && *y <= maxy)
            .map(|(_, &i)| i)
            .collect();
        indices.sort_unstable();
        indices
    }

    fn tile_indices_at(&self, x: i32, y: i32) -> Vec<usize> {
        let mut indices: Vec<usize> = self
            .pos_lookup
            .iter()
            .filter(|((tx, ty, _), _)| *tx == x && *ty == y)
            .map(|(_, &i)| i)
            .collect();
        indices.sort_unstable();
        indices
    }

    /// Rebuilds the links of every tile that can connect to cell `(x, y)`
    fn relink_around(&mut self, x: i32, y: i32, added: Option<usize>) {
        let mut dirty: HashSet<usize> = added.into_iter().collect();
        for dy in -1..=1 {
            for dx in -1..=1 {
                dirty.extend(self.tile_indices_at(x + dx, y + dy));
            }
        }

        // Tiles with off-mesh connections landing in the cell
        for &i in self.pos_lookup.values() {
            let lands_here = self.tiles[i]
                .off_mesh_connections
                .iter()
                .any(|con| self.calc_tile_loc(con.end_pos()) == (x, y));
            if lands_here {
                dirty.insert(i);
            }
        }

        let mut dirty: Vec<usize> = dirty.into_iter().collect();
        dirty.sort_unstable();
        for index in dirty {
            self.connect_tile(index);
        }
    }

    /// Recomputes all links of the tile in slot `index`
    fn connect_tile(&mut self, index: usize) {
        let links = self.collect_links(index);

        let tile = &mut self.tiles[index];
        tile.links.clear();
        for poly in &mut tile.polys {
            poly.first_link = None;
        }
        for (poly_index, mut link) in links {
            let link_index = tile.links.len();
            let poly = &mut tile.polys[poly_index];
            link.next = poly.first_link;
            poly.first_link = Some(link_index);
            tile.links.push(link);
        }
    }

    fn collect_links(&self, index: usize) -> Vec<(usize, Link)> {
        let tile = &self.tiles[index];
        let Some(header) = tile.header.as_ref() else {
            return Vec::new();
        };
        let mut links = Vec::new();
        let climb = header.walkable_climb.max(0.01);

        // Internal edges and tile border portals
        for (pi, poly) in tile.polys.iter().enumerate() {
            if poly.poly_type != PolyType::Ground {
                continue;
            }
            for j in 0..poly.vert_count as usize {
                let nei = poly.neighbors[j];
                if nei == 0 {
                    continue;
                }
                if nei & EXT_LINK == 0 {
                    let reference = self.encode_poly_ref(tile.salt, index as u32, nei as u32 - 1);
                    links.push((pi, internal_link(reference, j as u8)));
                    continue;
                }

                let side = (nei & 0xf) as u8;
                let (dx, dy) = side_offset(side);
                let va = tile.vert(poly.verts[j]);
                let vb = tile.vert(poly.verts[(j + 1) % poly.vert_count as usize]);
                for ni in self.tile_indices_at(header.x + dx, header.y + dy) {
                    let neighbor = &self.tiles[ni];
                    for (npi, npoly) in neighbor.polys.iter().enumerate() {
                        if npoly.poly_type != PolyType::Ground {
                            continue;
                        }
                        let opposite = EXT_LINK | ((side as u16 + 2) & 3);
                        for k in 0..npoly.vert_count as usize {
                            if npoly.neighbors[k] != opposite {
                                continue;
                            }
                            let na = neighbor.vert(npoly.verts[k]);
                            let nb = neighbor.vert(npoly.verts[(k + 1) % npoly.vert_count as usize]);
                            if portal_edges_overlap(side, va, vb, na, nb, climb) {
                                let reference =
                                    self.encode_poly_ref(neighbor.salt, ni as u32, npi as u32);
                                links.push((
                                    pi,
                                    Link {
                                        reference,
                                        edge_index: j as u8,
                                        side,
                                        next: None,
                                    },
                                ));
                            }
                        }
                    }
                }
            }
        }

        // Off-mesh connections starting in this tile
        for con in &tile.off_mesh_connections {
            let con_ref = self.encode_poly_ref(tile.salt, index as u32, con.poly as u32);
            let extents = Vec3::new(con.radius, climb, con.radius);

            let start = con.start_pos();
            if let Some((ground, _, _)) =
                nearest_poly_in_tile(tile, start, start - extents, start + extents)
            {
                let ground_ref = self.encode_poly_ref(tile.salt, index as u32, ground as u32);
                links.push((con.poly as usize, internal_link(ground_ref, 0)));
                links.push((ground, internal_link(con_ref, 0xff)));
            }

            let end = con.end_pos();
            let (ex, ey) = self.calc_tile_loc(end);
            for ti in self.tile_indices_at(ex, ey) {
                let landing_tile = &self.tiles[ti];
                if let Some((ground, _, _)) =
                    nearest_poly_in_tile(landing_tile, end, end - extents, end + extents)
                {
                    let ground_ref =
                        self.encode_poly_ref(landing_tile.salt, ti as u32, ground as u32);
                    links.push((con.poly as usize, internal_link(ground_ref, 1)));
                    if con.bidirectional && ti == index {
                        links.push((ground, internal_link(con_ref, 0xff)));
                    }
                    break;
                }
            }
        }

        // Bidirectional off-mesh connections from other tiles landing here
        for &oi in self.pos_lookup.values() {
            if oi == index {
                continue;
            }
            let other = &self.tiles[oi];
            for con in &other.off_mesh_connections {
                if !con.bidirectional {
                    continue;
                }
                let end = con.end_pos();
                if self.calc_tile_loc(end) != (header.x, header.y) {
                    continue;
                }
                // Only the first layer with a landing polygon takes the connection
                let first_landing = self
                    .tile_indices_at(header.x, header.y)
                    .into_iter()
                    .find(|&ti| {
                        let extents = Vec3::new(con.radius, climb, con.radius);
                        nearest_poly_in_tile(&self.tiles[ti], end, end - extents, end + extents)
                            .is_some()
                    });
                if first_landing != Some(index) {
                    continue;
                }
                let extents = Vec3::new(con.radius, climb, con.radius);
                if let Some((ground, _, _)) =
                    nearest_poly_in_tile(tile, end, end - extents, end + extents)
                {
                    let con_ref = self.encode_poly_ref(other.salt, oi as u32, con.poly as u32);
                    links.push((ground, internal_link(con_ref, 0xff)));
                }
            }
        }

        links
    }
}

fn internal_link(reference: PolyRef, edge: u8) -> Link {
    Link {
        reference,
        edge_index: edge,
        side: LINK_SIDE_INTERNAL,
        next: None,
    }
}

/// Tile grid offset of the neighbour across `side`
fn side_offset(side: u8) -> (i32, i32) {
    match side & 3 {
        0 => (-1, 0),
        1 => (0, 1),
        2 => (1, 0),
        _ => (0, -1),
    }
}

/// Whether two border edges on opposite tile sides touch each other
fn portal_edges_overlap(side: u8, va: Vec3, vb: Vec3, na: Vec3, nb: Vec3, climb: f32) -> bool {
    const EPS: f32 = 1e-3;
    let along_x = side & 1 == 1;
    let (fixed_a, fixed_n) = if along_x { (va.z, na.z) } else { (va.x, na.x) };
    if (fixed_a - fixed_n).abs() > EPS {
        return false;
    }

    let range = |a: Vec3, b: Vec3| {
        if along_x {
            (a.x.min(b.x), a.x.max(b.x))
        } else {
            (a.z.min(b.z), a.z.max(b.z))
        }
    };
    let (amin, amax) = range(va, vb);
    let (nmin, nmax) = range(na, nb);
    let lo = amin.max(nmin);
    let hi = amax.min(nmax);
    if hi - lo <= EPS {
        return false;
    }

    let height_at = |a: Vec3, b: Vec3, t: f32| {
        let (sa, sb) = if along_x { (a.x, b.x) } else { (a.z, b.z) };
        if (sb - sa).abs() < EPS {
            a.y
        } else {
            a.y + (b.y - a.y) * ((t - sa) / (sb - sa))
        }
    };
    let mid = (lo + hi) * 0.5;
    (height_at(va, vb, mid) - height_at(na, nb, mid)).abs() <= climb
}

fn poly_bounds(tile: &MeshTile, poly: &Poly) -> (Vec3, Vec3) {
    let mut bmin = Vec3::splat(f32::MAX);
    let mut bmax = Vec3::splat(f32::MIN);
    for v in tile.poly_verts(poly) {
        bmin = bmin.min(v);
        bmax = bmax.max(v);
    }
    (bmin, bmax)
}

fn overlap_bounds(amin: Vec3, amax: Vec3, bmin: Vec3, bmax: Vec3) -> bool {
    amin.x <= bmax.x
        && amax.x >= bmin.x
        && amin.y <= bmax.y
        && amax.y >= bmin.y
        && amin.z <= bmax.z
        && amax.z >= bmin.z
}

/// Nearest ground polygon of a tile within the box, as `(poly_index, point, dist_sqr)`
fn nearest_poly_in_tile(
    tile: &MeshTile,
    center: Vec3,
    bmin: Vec3,
    bmax: Vec3,
) -> Option<(usize, Vec3, f32)> {
    let mut best: Option<(usize, Vec3, f32)> = None;
    for (pi, poly) in tile.polys.iter().enumerate() {
        if poly.poly_type != PolyType::Ground {
            continue;
        }
        let (pmin, pmax) = poly_bounds(tile, poly);
        if !overlap_bounds(bmin, bmax, pmin, pmax) {
            continue;
        }
        let point = closest_point_on_polygon(&tile.poly_verts(poly), center);
        let d = point.distance_squared(center);
        if best.map_or(true, |(_, _, bd)| d < bd) {
            best = Some((pi, point, d));
        }
    }
    best
}

pub(crate) fn point_in_polygon_xz(pos: Vec3, verts: &[Vec3]) -> bool {
    let mut inside = false;
    let mut j = verts.len() - 1;
    for i in 0..verts.len() {
        let vi = verts[i];
        let vj = verts[j];
        if ((vi.z > pos.z) != (vj.z > pos.z))
            && (pos.x < (vj.x - vi.x) * (pos.z - vi.z) / (vj.z - vi.z) + vi.x)
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Height of the polygon surface below `pos`, interpolated over a triangle fan
pub(crate) fn polygon_height(verts: &[Vec3], pos: Vec3) -> Option<f32> {
    for i in 1..verts.len() - 1 {
        let (a, b, c) = (verts[0], verts[i], verts[i + 1]);
        let v0 = c - a;
        let v1 = b - a;
        let v2 = pos - a;
        let denom = v0.x * v1.z - v0.z * v1.x;
        if denom.abs() < 1e-6 {
            continue;
        }
        let u = (v1.z * v2.x - v1.x * v2.z) / denom;
        let v = (v0.x * v2.z - v0.z * v2.x) / denom;
        const EPS: f32 = 1e-4;
        if u >= -EPS && v >= -EPS && u + v <= 1.0 + EPS {
            return Some(a.y + v0.y * u + v1.y * v);
        }
    }
    None
}

pub(crate) fn closest_point_on_segment(pos: Vec3, a: Vec3, b: Vec3) -> Vec3 {
    let ab = b - a;
    let len_sqr = ab.x * ab.x + ab.z * ab.z;
    let t = if len_sqr > 0.0 {
        (((pos.x - a.x) * ab.x + (pos.z - a.z) * ab.z) / len_sqr).clamp(0.0, 1.0)
    } else {
        0.0
    };
    a + ab * t
}

pub(crate) fn closest_point_on_polygon(verts: &[Vec3], pos: Vec3) -> Vec3 {
    if verts.len() >= 3 && point_in_polygon_xz(pos, verts) {
        if let Some(y) = polygon_height(verts, pos) {
            return Vec3::new(pos.x, y, pos.z);
        }
    }

    let mut best = verts[0];
    let mut best_d = f32::MAX;
    for i in 0..verts.len() {
        let a = verts[i];
        let b = verts[(i + 1) % verts.len()];
        let p = closest_point_on_segment(pos, a, b);
        let d = (p.x - pos.x).powi(2) + (p.z - pos.z).powi(2);
        if d < best_d {
            best_d = d;
            best = p;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nav_mesh_builder::tests::two_quads;
    use crate::NavMeshBuilder;

    fn nav_mesh(max_tiles: i32) -> NavMesh {
        NavMesh::new(NavMeshParams {
            origin: [0.0; 3],
            tile_width: 8.0,
            tile_height: 8.0,
            max_tiles,
            max_polys_per_tile: 64,
        })
        .unwrap()
    }

    fn add(mesh: &mut NavMesh, x: i32, y: i32) -> PolyRef {
        let tile = NavMeshBuilder::build_tile(&two_quads(x, y)).unwrap();
        mesh.add_tile(tile).unwrap()
    }

    #[test]
    fn test_invalid_params() {
        let params = NavMeshParams {
            origin: [0.0; 3],
            tile_width: 8.0,
            tile_height: 8.0,
            max_tiles: 1 << 16,
            max_polys_per_tile: 1 << 16,
        };
        assert!(NavMesh::new(params).is_err());

        let params = NavMeshParams {
            tile_width: 0.0,
            ..params
        };
        assert!(NavMesh::new(params).is_err());
    }

    #[test]
    fn test_bit_split() {
        let mesh = NavMesh::new(NavMeshParams {
            origin: [0.0; 3],
            tile_width: 8.0,
            tile_height: 8.0,
            max_tiles: 4096,
            max_polys_per_tile: 1024,
        })
        .unwrap();
        assert_eq!(mesh.tile_bits(), 12);
        assert_eq!(mesh.poly_bits(), 10);

        let reference = mesh.encode_poly_ref(5, 17, 3);
        assert_eq!(mesh.decode_poly_ref(reference), (5, 17, 3));
    }

    #[test]
    fn test_add_and_lookup_tiles() {
        let mut mesh = nav_mesh(4);
        let tile_ref = add(&mut mesh, 0, 0);

        assert_eq!(mesh.tile_count(), 1);
        assert!(mesh.get_tile_at(0, 0, 0).is_some());
        assert!(mesh.get_tile_at(1, 0, 0).is_none());
        assert_eq!(mesh.get_tile_ref_at(0, 0, 0), Some(tile_ref));
        assert_eq!(mesh.get_tiles_at(0, 0).len(), 1);
        assert!(mesh.get_tile_by_ref(tile_ref).is_some());
    }

    #[test]
    fn test_duplicate_and_capacity() {
        let mut mesh = nav_mesh(2);
        add(&mut mesh, 0, 0);

        let duplicate = NavMeshBuilder::build_tile(&two_quads(0, 0)).unwrap();
        let err = mesh.add_tile(duplicate).unwrap_err();
        assert!(err.to_string().contains("already exists"));

        add(&mut mesh, 1, 0);
        let third = NavMeshBuilder::build_tile(&two_quads(2, 0)).unwrap();
        let err = mesh.add_tile(third).unwrap_err();
        assert!(err.to_string().contains("Out of memory"));
    }

    #[test]
    fn test_remove_invalidates_references() {
        let mut mesh = nav_mesh(4);
        let tile_ref = add(&mut mesh, 0, 0);
        let poly_ref = mesh.encode_poly_ref(mesh.decode_poly_ref(tile_ref).0, 0, 1);
        assert!(mesh.is_valid_poly_ref(poly_ref));

        let removed = mesh.remove_tile(tile_ref).unwrap();
        assert_eq!(removed.polys.len(), 2);
        assert_eq!(mesh.tile_count(), 0);
        assert!(!mesh.is_valid_poly_ref(poly_ref));
        assert!(mesh.remove_tile(tile_ref).is_err());

        // The slot is reused with a new salt
        let new_ref = add(&mut mesh, 0, 0);
        assert_ne!(new_ref, tile_ref);
    }

    #[test]
    fn test_internal_and_external_links() {
        let mut mesh = nav_mesh(4);
        let left = add(&mut mesh, 0, 0);
        let right = add(&mut mesh, 1, 0);

        let (salt_l, tile_l, _) = mesh.decode_poly_ref(left);
        let (salt_r, tile_r, _) = mesh.decode_poly_ref(right);
        let left_east = mesh.encode_poly_ref(salt_l, tile_l, 1);
        let right_west = mesh.encode_poly_ref(salt_r, tile_r, 0);

        let neighbors = mesh.get_poly_neighbors(left_east).unwrap();
        assert!(neighbors.contains(&mesh.encode_poly_ref(salt_l, tile_l, 0)));
        assert!(neighbors.contains(&right_west));
        assert!(mesh.get_poly_neighbors(right_west).unwrap().contains(&left_east));

        // Removing the right tile drops the external link
        mesh.remove_tile(right).unwrap();
        let neighbors = mesh.get_poly_neighbors(left_east).unwrap();
        assert_eq!(neighbors.len(), 1);
    }

    #[test]
    fn test_find_nearest_poly() {
        let mut mesh = nav_mesh(4);
        let tile_ref = add(&mut mesh, 0, 0);
        let (salt, tile, _) = mesh.decode_poly_ref(tile_ref);

        let (reference, point) = mesh
            .find_nearest_poly(Vec3::new(6.0, 1.0, 3.0), Vec3::new(2.0, 4.0, 2.0))
            .unwrap();
        assert_eq!(reference, mesh.encode_poly_ref(salt, tile, 1));
        assert!((point - Vec3::new(6.0, 0.0, 3.0)).length() < 1e-4);

        // Outside of every tile, clamped to the border
        let (_, point) = mesh
            .find_nearest_poly(Vec3::new(-1.0, 0.0, 3.0), Vec3::new(2.0, 4.0, 2.0))
            .unwrap();
        assert!((point - Vec3::new(0.0, 0.0, 3.0)).length() < 1e-4);

        assert!(mesh
            .find_nearest_poly(Vec3::new(50.0, 0.0, 50.0), Vec3::ONE)
            .is_none());
    }

    #[test]
    fn test_off_mesh_connection_links() {
        let mut mesh = nav_mesh(4);
        add(&mut mesh, 1, 0);

        let mut params = two_quads(0, 0);
        params.off_mesh_con_verts = vec![[2.0, 0.0, 2.0, 12.0, 0.0, 2.0]];
        params.off_mesh_con_rad = vec![0.5];
        params.off_mesh_con_flags = vec![PolyFlags::JUMP];
        params.off_mesh_con_areas = vec![5];
        params.off_mesh_con_dir = vec![1];
        params.off_mesh_con_user_id = vec![1];
        let tile = NavMeshBuilder::build_tile(&params).unwrap();
        let tile_ref = mesh.add_tile(tile).unwrap();

        let (salt, index, _) = mesh.decode_poly_ref(tile_ref);
        let con_ref = mesh.encode_poly_ref(salt, index, 2);
        let links = mesh.get_poly_neighbors(con_ref).unwrap();
        assert_eq!(links.len(), 2);

        // The landing polygon in the other tile links back
        let landing = mesh
            .find_nearest_poly(Vec3::new(12.0, 0.0, 2.0), Vec3::splat(0.5))
            .unwrap()
            .0;
        assert!(links.contains(&landing));
        assert!(mesh.get_poly_neighbors(landing).unwrap().contains(&con_ref));
    }
}
