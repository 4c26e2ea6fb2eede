//! Tile cache builder for real-time mesh rebuilding
//!
//! Turns a decompressed layer, after obstacles have been carved into it, into the
//! polygon arrays of a navigation mesh tile.
//!
//! Layers are grids with one walkable cell per column, so the mesher works directly
//! on cells: connected cells of equal area are grouped into regions, regions are
//! covered greedily with rectangles and every rectangle becomes one convex polygon.
//! Rectangle sides are split wherever the neighbour across them changes, which keeps
//! every shared edge exact. Rectangles that end up with too many vertices are halved
//! until all polygons fit.

use std::collections::{HashMap, VecDeque};

use glam::Vec3;
use navmesh_common::{Error, Result};
use navmesh_detour::{NavMeshCreateParams, PolyFlags, Status, MAX_VERTS_PER_POLY, MESH_NULL_IDX};

use super::tile_cache_data::{TileCacheLayer, TileCacheParams};

const DIR_OFFSET_X: [i32; 4] = [-1, 0, 1, 0];
const DIR_OFFSET_Z: [i32; 4] = [0, 1, 0, -1];

const EMPTY_HEIGHT: u8 = 0xff;
const NULL_AREA: u8 = 0;
const NO_REGION: u16 = 0xffff;
const NO_RECT: u32 = u32::MAX;

/// Neighbour code of an edge on the tile border facing `dir`
const fn border_code(dir: usize) -> u16 {
    0x8000 | dir as u16
}

/// Marks the cells of `layer` inside a vertical cylinder with `area_id`.
///
/// `pos` is the center of the cylinder base. Cells whose floor lies outside the
/// cylinder's height range are left untouched.
pub fn mark_cylinder_area(
    layer: &mut TileCacheLayer,
    cs: f32,
    ch: f32,
    pos: Vec3,
    radius: f32,
    height: f32,
    area_id: u8,
) {
    let orig = Vec3::from(layer.header.bmin);
    let bmin = pos - Vec3::new(radius, 0.0, radius);
    let bmax = pos + Vec3::new(radius, height, radius);
    let r2 = (radius / cs + 0.5).powi(2);

    let px = (pos.x - orig.x) / cs;
    let pz = (pos.z - orig.z) / cs;

    mark_cells(layer, cs, ch, bmin, bmax, area_id, |x, z| {
        let dx = x as f32 + 0.5 - px;
        let dz = z as f32 + 0.5 - pz;
        dx * dx + dz * dz <= r2
    });
}

/// Marks the cells of `layer` inside an axis-aligned box with `area_id`
pub fn mark_box_area(
    layer: &mut TileCacheLayer,
    cs: f32,
    ch: f32,
    bmin: Vec3,
    bmax: Vec3,
    area_id: u8,
) {
    mark_cells(layer, cs, ch, bmin, bmax, area_id, |_, _| true);
}

fn mark_cells(
    layer: &mut TileCacheLayer,
    cs: f32,
    ch: f32,
    bmin: Vec3,
    bmax: Vec3,
    area_id: u8,
    inside: impl Fn(i32, i32) -> bool,
) {
    let w = layer.header.width as i32;
    let h = layer.header.height as i32;
    let orig = Vec3::from(layer.header.bmin);

    let minx = ((bmin.x - orig.x) / cs).floor() as i32;
    let miny = ((bmin.y - orig.y) / ch).floor() as i32;
    let minz = ((bmin.z - orig.z) / cs).floor() as i32;
    let maxx = ((bmax.x - orig.x) / cs).floor() as i32;
    let maxy = ((bmax.y - orig.y) / ch).floor() as i32;
    let maxz = ((bmax.z - orig.z) / cs).floor() as i32;

    if maxx < 0 || minx >= w || maxz < 0 || minz >= h {
        return;
    }

    for z in minz.max(0)..=maxz.min(h - 1) {
        for x in minx.max(0)..=maxx.min(w - 1) {
            if !inside(x, z) {
                continue;
            }
            let idx = layer.index(x, z);
            let y = layer.heights[idx];
            if y == EMPTY_HEIGHT || (y as i32) < miny || (y as i32) > maxy {
                continue;
            }
            layer.areas[idx] = area_id;
        }
    }
}

/// Grid-aligned rectangle of cells, `x1` and `z1` exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rect {
    x0: i32,
    z0: i32,
    x1: i32,
    z1: i32,
}

impl Rect {
    fn split(self) -> (Rect, Rect) {
        if self.x1 - self.x0 >= self.z1 - self.z0 {
            let mid = self.x0 + (self.x1 - self.x0) / 2;
            (Rect { x1: mid, ..self }, Rect { x0: mid, ..self })
        } else {
            let mid = self.z0 + (self.z1 - self.z0) / 2;
            (Rect { z1: mid, ..self }, Rect { z0: mid, ..self })
        }
    }
}

/// Polygon outline of a rectangle: corners in grid coordinates and the
/// neighbour code of the edge starting at each corner
#[derive(Debug, Default)]
struct Outline {
    corners: Vec<(i32, i32)>,
    codes: Vec<u16>,
}

/// Read-only view of a carved layer
struct LayerGrid<'a> {
    layer: &'a TileCacheLayer,
    width: i32,
    height: i32,
}

impl<'a> LayerGrid<'a> {
    fn new(layer: &'a TileCacheLayer) -> Self {
        Self {
            layer,
            width: layer.header.width as i32,
            height: layer.header.height as i32,
        }
    }

    fn inside(&self, x: i32, z: i32) -> bool {
        x >= 0 && z >= 0 && x < self.width && z < self.height
    }

    fn walkable(&self, idx: usize) -> bool {
        self.layer.heights[idx] != EMPTY_HEIGHT && self.layer.areas[idx] != NULL_AREA
    }

    /// Neighbour of cell `(x, z)` in `dir` if the layer connects them
    fn connected(&self, x: i32, z: i32, dir: usize) -> Option<(i32, i32)> {
        let idx = self.layer.index(x, z);
        if self.layer.cons[idx] & (1 << dir) == 0 {
            return None;
        }
        let nx = x + DIR_OFFSET_X[dir];
        let nz = z + DIR_OFFSET_Z[dir];
        if !self.inside(nx, nz) || !self.walkable(self.layer.index(nx, nz)) {
            return None;
        }
        Some((nx, nz))
    }

    /// Flood fills connected cells of equal area
    fn build_regions(&self) -> Vec<u16> {
        let mut regions = vec![NO_REGION; self.layer.heights.len()];
        let mut next_region = 0u16;
        let mut queue = VecDeque::new();

        for z in 0..self.height {
            for x in 0..self.width {
                let idx = self.layer.index(x, z);
                if !self.walkable(idx) || regions[idx] != NO_REGION {
                    continue;
                }
                let area = self.layer.areas[idx];
                regions[idx] = next_region;
                queue.push_back((x, z));

                while let Some((cx, cz)) = queue.pop_front() {
                    for dir in 0..4 {
                        let Some((nx, nz)) = self.connected(cx, cz, dir) else {
                            continue;
                        };
                        let nidx = self.layer.index(nx, nz);
                        if regions[nidx] == NO_REGION && self.layer.areas[nidx] == area {
                            regions[nidx] = next_region;
                            queue.push_back((nx, nz));
                        }
                    }
                }
                next_region += 1;
            }
        }

        regions
    }

    /// Covers the walkable cells greedily with rectangles, row by row
    fn build_rects(&self) -> Vec<Rect> {
        let mut taken = vec![false; self.layer.heights.len()];
        let mut rects = Vec::new();

        let joins = |taken: &[bool], from: (i32, i32), dir: usize, area: u8| -> bool {
            match self.connected(from.0, from.1, dir) {
                Some((nx, nz)) => {
                    let nidx = self.layer.index(nx, nz);
                    !taken[nidx] && self.layer.areas[nidx] == area
                }
                None => false,
            }
        };

        for z in 0..self.height {
            for x in 0..self.width {
                let idx = self.layer.index(x, z);
                if taken[idx] || !self.walkable(idx) {
                    continue;
                }
                let area = self.layer.areas[idx];

                let mut x1 = x + 1;
                while x1 < self.width && joins(&taken, (x1 - 1, z), 2, area) {
                    x1 += 1;
                }

                let mut z1 = z + 1;
                'grow: while z1 < self.height {
                    for cx in x..x1 {
                        if !joins(&taken, (cx, z1 - 1), 1, area) {
                            break 'grow;
                        }
                        if cx > x && self.connected(cx - 1, z1, 2).is_none() {
                            break 'grow;
                        }
                    }
                    z1 += 1;
                }

                for cz in z..z1 {
                    for cx in x..x1 {
                        taken[self.layer.index(cx, cz)] = true;
                    }
                }
                rects.push(Rect { x0: x, z0: z, x1, z1 });
            }
        }

        rects
    }

    fn rect_owners(&self, rects: &[Rect]) -> Vec<u32> {
        let mut owners = vec![NO_RECT; self.layer.heights.len()];
        for (i, rect) in rects.iter().enumerate() {
            for z in rect.z0..rect.z1 {
                for x in rect.x0..rect.x1 {
                    owners[self.layer.index(x, z)] = i as u32;
                }
            }
        }
        owners
    }

    fn neighbor_code(&self, owners: &[u32], x: i32, z: i32, dir: usize) -> u16 {
        let nx = x + DIR_OFFSET_X[dir];
        let nz = z + DIR_OFFSET_Z[dir];
        if !self.inside(nx, nz) {
            return border_code(dir);
        }
        match self.connected(x, z, dir) {
            Some((nx, nz)) => match owners[self.layer.index(nx, nz)] {
                NO_RECT => MESH_NULL_IDX,
                owner => owner as u16,
            },
            None => MESH_NULL_IDX,
        }
    }

    /// Walks the rectangle boundary: -x side towards +z, +z side towards +x,
    /// +x side towards -z and -z side towards -x
    fn outline(&self, rect: &Rect, owners: &[u32]) -> Outline {
        let Rect { x0, z0, x1, z1 } = *rect;
        // (cell, corner at the start of the cell's edge)
        let sides: [Vec<((i32, i32), (i32, i32))>; 4] = [
            (z0..z1).map(|z| ((x0, z), (x0, z))).collect(),
            (x0..x1).map(|x| ((x, z1 - 1), (x, z1))).collect(),
            (z0..z1).rev().map(|z| ((x1 - 1, z), (x1, z + 1))).collect(),
            (x0..x1).rev().map(|x| ((x, z0), (x + 1, z0))).collect(),
        ];

        let mut outline = Outline::default();
        for (dir, side) in sides.iter().enumerate() {
            let mut last = None;
            for &((cx, cz), corner) in side {
                let code = self.neighbor_code(owners, cx, cz, dir);
                if last != Some(code) {
                    outline.corners.push(corner);
                    outline.codes.push(code);
                    last = Some(code);
                }
            }
        }
        outline
    }

    /// Highest floor among the cells of `region` touching corner `(vx, vz)`
    fn corner_height(&self, regions: &[u16], vx: i32, vz: i32, region: u16) -> u16 {
        let mut height = 0;
        for (cx, cz) in [(vx - 1, vz - 1), (vx, vz - 1), (vx - 1, vz), (vx, vz)] {
            if !self.inside(cx, cz) {
                continue;
            }
            let idx = self.layer.index(cx, cz);
            if regions[idx] == region {
                height = height.max(self.layer.heights[idx] as u16);
            }
        }
        height
    }
}

/// Tile cache builder converting carved layers into navigation mesh polygons
#[derive(Debug, Clone)]
pub struct TileCacheBuilder {
    params: TileCacheParams,
}

impl TileCacheBuilder {
    /// Creates a new tile cache builder
    pub fn new(params: TileCacheParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &TileCacheParams {
        &self.params
    }

    /// Builds the polygon data of one layer.
    ///
    /// Returns `None` when the layer holds no walkable cells. Polygon flags are left
    /// empty for the [`MeshProcess`](crate::MeshProcess) to fill in.
    pub fn build(&self, layer: &TileCacheLayer) -> Result<Option<NavMeshCreateParams>> {
        let header = &layer.header;
        header.validate()?;
        let grid_size = header.grid_size();
        if layer.heights.len() != grid_size
            || layer.areas.len() != grid_size
            || layer.cons.len() != grid_size
        {
            return Err(Error::Detour(Status::DataCorrupted.to_string()));
        }

        let grid = LayerGrid::new(layer);
        let regions = grid.build_regions();
        let mut rects = grid.build_rects();
        if rects.is_empty() {
            return Ok(None);
        }

        let outlines = loop {
            if rects.len() >= 0x8000 {
                return Err(Error::TileCache(format!(
                    "layer ({}, {}, {}) needs too many polygons",
                    header.tx, header.ty, header.tlayer
                )));
            }
            let owners = grid.rect_owners(&rects);
            let outlines: Vec<Outline> = rects.iter().map(|r| grid.outline(r, &owners)).collect();
            match outlines
                .iter()
                .position(|o| o.corners.len() > MAX_VERTS_PER_POLY)
            {
                Some(i) => {
                    let (a, b) = rects[i].split();
                    rects[i] = a;
                    rects.push(b);
                }
                None => break outlines,
            }
        };

        let mut params = NavMeshCreateParams {
            tile_x: header.tx,
            tile_y: header.ty,
            tile_layer: header.tlayer,
            bmin: header.bmin,
            bmax: header.bmax,
            walkable_height: self.params.walkable_height,
            walkable_radius: self.params.walkable_radius,
            walkable_climb: self.params.walkable_climb,
            cs: self.params.cs,
            ch: self.params.ch,
            ..Default::default()
        };

        let mut vert_lookup: HashMap<[u16; 3], u16> = HashMap::new();
        for (rect, outline) in rects.iter().zip(&outlines) {
            let seed = layer.index(rect.x0, rect.z0);
            let region = regions[seed];

            let mut row = [MESH_NULL_IDX; MAX_VERTS_PER_POLY];
            let mut neighbors = [MESH_NULL_IDX; MAX_VERTS_PER_POLY];
            for (j, (&(vx, vz), &code)) in outline.corners.iter().zip(&outline.codes).enumerate() {
                let y = grid.corner_height(&regions, vx, vz, region);
                let key = [vx as u16, y, vz as u16];
                let index = match vert_lookup.get(&key) {
                    Some(&index) => index,
                    None => {
                        if params.verts.len() >= MESH_NULL_IDX as usize - 1 {
                            return Err(Error::Detour(Status::OutOfMemory.to_string()));
                        }
                        let index = params.verts.len() as u16;
                        params.verts.push(key);
                        vert_lookup.insert(key, index);
                        index
                    }
                };
                row[j] = index;
                neighbors[j] = code;
            }

            params.polys.push(row);
            params.poly_neighbors.push(neighbors);
            params.poly_areas.push(layer.areas[seed]);
            params.poly_flags.push(PolyFlags::empty());
        }

        log::trace!(
            "Layer ({}, {}, {}) meshed into {} polygons, {} vertices",
            header.tx,
            header.ty,
            header.tlayer,
            params.polys.len(),
            params.verts.len()
        );

        Ok(Some(params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile_cache_data::tests::flat_layer;

    fn layer() -> TileCacheLayer {
        let (header, heights, areas, cons) = flat_layer(0, 0);
        TileCacheLayer {
            header,
            heights,
            areas,
            cons,
        }
    }

    fn builder() -> TileCacheBuilder {
        TileCacheBuilder::new(TileCacheParams {
            cs: 1.0,
            ch: 0.5,
            width: 16,
            height: 16,
            ..Default::default()
        })
    }

    fn assert_symmetric(params: &NavMeshCreateParams) {
        for (i, neighbors) in params.poly_neighbors.iter().enumerate() {
            for &nei in neighbors {
                if nei == MESH_NULL_IDX || nei & 0x8000 != 0 {
                    continue;
                }
                assert!(
                    params.poly_neighbors[nei as usize].contains(&(i as u16)),
                    "polygon {} links to {} but not back",
                    i,
                    nei
                );
            }
        }
    }

    #[test]
    fn test_flat_layer_single_quad() {
        let params = builder().build(&layer()).unwrap().unwrap();
        assert_eq!(params.polys.len(), 1);
        assert_eq!(params.verts.len(), 4);
        assert_eq!(params.verts[0], [0, 0, 0]);
        assert_eq!(params.verts[2], [16, 0, 16]);
        assert_eq!(
            params.poly_neighbors[0][..4],
            [0x8000, 0x8001, 0x8002, 0x8003]
        );
        assert_eq!(params.poly_areas[0], 63);
        assert!(params.poly_flags[0].is_empty());
    }

    #[test]
    fn test_cylinder_carves_hole() {
        let mut layer = layer();
        mark_cylinder_area(&mut layer, 1.0, 0.5, Vec3::new(8.0, 0.0, 8.0), 2.0, 2.0, 0);
        assert_eq!(layer.areas[layer.index(8, 8)], 0);
        assert_eq!(layer.areas[layer.index(0, 0)], 63);
        assert_eq!(layer.areas[layer.index(8, 12)], 63);

        let params = builder().build(&layer).unwrap().unwrap();
        assert!(params.polys.len() > 1);
        assert!(params
            .polys
            .iter()
            .all(|row| row.iter().filter(|&&v| v != MESH_NULL_IDX).count() <= MAX_VERTS_PER_POLY));
        assert_symmetric(&params);
    }

    #[test]
    fn test_cylinder_above_floor_is_ignored() {
        let mut layer = layer();
        mark_cylinder_area(&mut layer, 1.0, 0.5, Vec3::new(8.0, 5.0, 8.0), 2.0, 2.0, 0);
        assert!(layer.areas.iter().all(|&a| a == 63));
    }

    #[test]
    fn test_box_carves_cells() {
        let mut layer = layer();
        mark_box_area(
            &mut layer,
            1.0,
            0.5,
            Vec3::new(-4.0, -1.0, -4.0),
            Vec3::new(3.5, 1.0, 3.5),
            0,
        );
        assert_eq!(layer.areas[layer.index(3, 3)], 0);
        assert_eq!(layer.areas[layer.index(4, 3)], 63);

        let params = builder().build(&layer).unwrap().unwrap();
        assert_eq!(params.polys.len(), 2);
        assert_symmetric(&params);
    }

    #[test]
    fn test_fully_carved_layer_is_empty() {
        let mut layer = layer();
        mark_box_area(
            &mut layer,
            1.0,
            0.5,
            Vec3::new(-1.0, -1.0, -1.0),
            Vec3::new(20.0, 1.0, 20.0),
            0,
        );
        assert!(builder().build(&layer).unwrap().is_none());
    }

    #[test]
    fn test_many_neighbours_split_polygons() {
        let mut layer = layer();
        for z in 0..16 {
            for x in 8..16 {
                let idx = layer.index(x, z);
                layer.areas[idx] = if z % 2 == 0 { 1 } else { 2 };
            }
        }

        let params = builder().build(&layer).unwrap().unwrap();
        for row in &params.polys {
            let count = row.iter().filter(|&&v| v != MESH_NULL_IDX).count();
            assert!((3..=MAX_VERTS_PER_POLY).contains(&count));
        }
        assert_symmetric(&params);
        // Every striped row stays a single polygon
        assert_eq!(params.poly_areas.iter().filter(|&&a| a == 1).count(), 8);
    }

    #[test]
    fn test_corrupted_layer_is_rejected() {
        let mut layer = layer();
        layer.cons.pop();
        assert!(builder().build(&layer).is_err());
    }
}
