//! Compact heightfield representation
//!
//! The compact heightfield stores only the open space above walkable spans, with
//! precomputed connections between neighbouring spans. Region partitioning and
//! layer building both operate on it.

use glam::Vec3;

use super::heightfield::{Heightfield, NULL_AREA, SPAN_MAX_HEIGHT};
use super::{dir_offset_x, dir_offset_z};
use navmesh_common::{Error, Result};

/// Connection value for "no neighbour in this direction"
pub const NOT_CONNECTED: u8 = 0x3f;

/// Highest neighbour layer index a connection can address
const MAX_LAYERS: usize = NOT_CONNECTED as usize - 1;

/// A compact cell in the heightfield
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactCell {
    /// Index of the first span in the cell
    pub index: u32,
    /// Number of spans in the cell
    pub count: u32,
}

/// A compact span, the open space above a walkable surface
#[derive(Debug, Clone, Copy)]
pub struct CompactSpan {
    /// Height of the floor
    pub y: u16,
    /// Region ID (0 = not in region)
    pub reg: u16,
    /// Packed neighbour connections, 6 bits per direction
    pub con: u32,
    /// Height of the open space above the floor
    pub h: u8,
}

/// Compact heightfield structure
#[derive(Debug, Clone)]
pub struct CompactHeightfield {
    /// Width of the heightfield along the x-axis
    pub width: i32,
    /// Height (depth) of the heightfield along the z-axis
    pub height: i32,
    /// Agent height in voxels used when the field was built
    pub walkable_height: i32,
    /// Agent climb in voxels used when the field was built
    pub walkable_climb: i32,
    /// Width of the border that is not part of the tile
    pub border_size: i32,
    /// Maximum distance value in the distance field
    pub max_distance: u16,
    /// One past the highest region id in use
    pub max_regions: u16,

    /// The minimum bounds of the heightfield's AABB
    pub bmin: Vec3,
    /// The maximum bounds of the heightfield's AABB
    pub bmax: Vec3,
    /// Cell size (horizontal resolution)
    pub cs: f32,
    /// Cell height (vertical resolution)
    pub ch: f32,

    /// Grid of compact cells
    pub cells: Vec<CompactCell>,
    /// Array of compact spans
    pub spans: Vec<CompactSpan>,
    /// Distance to the closest boundary per span, filled by the distance field
    pub dist: Vec<u16>,
    /// Array of area IDs for each span
    pub areas: Vec<u8>,
}

impl CompactHeightfield {
    /// Builds a compact heightfield from the walkable spans of `hf`
    pub fn build(walkable_height: i32, walkable_climb: i32, hf: &Heightfield) -> Result<Self> {
        let w = hf.width;
        let h = hf.height;
        let span_count = hf.walkable_span_count();

        let mut bmax = hf.bmax;
        bmax.y += walkable_height as f32 * hf.ch;

        let mut chf = Self {
            width: w,
            height: h,
            walkable_height,
            walkable_climb,
            border_size: 0,
            max_distance: 0,
            max_regions: 0,
            bmin: hf.bmin,
            bmax,
            cs: hf.cs,
            ch: hf.ch,
            cells: vec![CompactCell::default(); (w * h) as usize],
            spans: Vec::with_capacity(span_count),
            dist: Vec::new(),
            areas: Vec::with_capacity(span_count),
        };

        // Fill in cells and spans
        let max_height = SPAN_MAX_HEIGHT as i32;
        for z in 0..h {
            for x in 0..w {
                let column = hf.column(x, z);
                let cell = &mut chf.cells[(x + z * w) as usize];
                cell.index = chf.spans.len() as u32;

                for (i, span) in column.iter().enumerate() {
                    if span.area == NULL_AREA {
                        continue;
                    }
                    let bot = span.smax as i32;
                    let top = column.get(i + 1).map_or(max_height, |n| n.smin as i32);
                    chf.spans.push(CompactSpan {
                        y: bot.clamp(0, 0xffff) as u16,
                        reg: 0,
                        con: 0,
                        h: (top - bot).clamp(0, 0xff) as u8,
                    });
                    chf.areas.push(span.area);
                    cell.count += 1;
                }
            }
        }

        // Find neighbour connections
        let mut too_high_neighbour = 0usize;
        for z in 0..h {
            for x in 0..w {
                let cell = chf.cells[(x + z * w) as usize];
                for i in cell.index as usize..(cell.index + cell.count) as usize {
                    for dir in 0..4 {
                        chf.set_con(i, dir, NOT_CONNECTED);
                        let nx = x + dir_offset_x(dir);
                        let nz = z + dir_offset_z(dir);
                        if nx < 0 || nz < 0 || nx >= w || nz >= h {
                            continue;
                        }

                        let s = chf.spans[i];
                        let ncell = chf.cells[(nx + nz * w) as usize];
                        for k in ncell.index as usize..(ncell.index + ncell.count) as usize {
                            let ns = chf.spans[k];
                            let bot = s.y.max(ns.y) as i32;
                            let top = (s.y as i32 + s.h as i32).min(ns.y as i32 + ns.h as i32);

                            // The gap between the spans must fit the agent
                            if top - bot >= walkable_height
                                && (ns.y as i32 - s.y as i32).abs() <= walkable_climb
                            {
                                let layer_index = k - ncell.index as usize;
                                if layer_index > MAX_LAYERS {
                                    too_high_neighbour = too_high_neighbour.max(layer_index);
                                    continue;
                                }
                                chf.set_con(i, dir, layer_index as u8);
                                break;
                            }
                        }
                    }
                }
            }
        }

        if too_high_neighbour > 0 {
            log::warn!(
                "Heightfield has too many layers {} (max: {})",
                too_high_neighbour,
                MAX_LAYERS
            );
        }

        Ok(chf)
    }

    /// Number of spans
    pub fn span_count(&self) -> usize {
        self.spans.len()
    }

    /// Returns the connection of span `i` in `dir`, or [`NOT_CONNECTED`]
    #[inline]
    pub fn get_con(&self, i: usize, dir: usize) -> u8 {
        ((self.spans[i].con >> (dir * 6)) & 0x3f) as u8
    }

    #[inline]
    fn set_con(&mut self, i: usize, dir: usize, value: u8) {
        let shift = dir * 6;
        let span = &mut self.spans[i];
        span.con = (span.con & !(0x3f << shift)) | (((value as u32) & 0x3f) << shift);
    }

    /// Index of the neighbour span of span `i` (located at `x`, `z`) in `dir`
    #[inline]
    pub fn neighbor(&self, x: i32, z: i32, i: usize, dir: usize) -> Option<usize> {
        let con = self.get_con(i, dir);
        if con == NOT_CONNECTED {
            return None;
        }
        let nx = x + dir_offset_x(dir);
        let nz = z + dir_offset_z(dir);
        let cell = self.cells[(nx + nz * self.width) as usize];
        Some(cell.index as usize + con as usize)
    }

    /// Iterates over `(x, z, span_index)` for every span
    pub fn iter_spans(&self) -> impl Iterator<Item = (i32, i32, usize)> + '_ {
        (0..self.height).flat_map(move |z| {
            (0..self.width).flat_map(move |x| {
                let cell = self.cells[(x + z * self.width) as usize];
                (cell.index as usize..(cell.index + cell.count) as usize).map(move |i| (x, z, i))
            })
        })
    }

    /// Erodes the walkable area by `radius` voxels
    pub fn erode_walkable_area(&mut self, radius: i32) -> Result<()> {
        let span_count = self.spans.len();
        let mut dist = vec![0xffu8; span_count];

        // Mark boundary cells
        for (x, z, i) in self.iter_spans() {
            if self.areas[i] == NULL_AREA {
                dist[i] = 0;
                continue;
            }
            let mut neighbor_count = 0;
            for dir in 0..4 {
                match self.neighbor(x, z, i, dir) {
                    Some(n) if self.areas[n] != NULL_AREA => neighbor_count += 1,
                    _ => break,
                }
            }
            if neighbor_count != 4 {
                dist[i] = 0;
            }
        }

        let relax = |dist: &mut [u8], i: usize, n: usize, cost: u8| {
            let nd = dist[n].saturating_add(cost);
            if nd < dist[i] {
                dist[i] = nd;
            }
        };

        // Pass 1
        for z in 0..self.height {
            for x in 0..self.width {
                let cell = self.cells[(x + z * self.width) as usize];
                for i in cell.index as usize..(cell.index + cell.count) as usize {
                    if let Some(a) = self.neighbor(x, z, i, 0) {
                        relax(&mut dist, i, a, 2);
                        if let Some(b) = self.neighbor(x - 1, z, a, 3) {
                            relax(&mut dist, i, b, 3);
                        }
                    }
                    if let Some(a) = self.neighbor(x, z, i, 3) {
                        relax(&mut dist, i, a, 2);
                        if let Some(b) = self.neighbor(x, z - 1, a, 2) {
                            relax(&mut dist, i, b, 3);
                        }
                    }
                }
            }
        }

        // Pass 2
        for z in (0..self.height).rev() {
            for x in (0..self.width).rev() {
                let cell = self.cells[(x + z * self.width) as usize];
                for i in cell.index as usize..(cell.index + cell.count) as usize {
                    if let Some(a) = self.neighbor(x, z, i, 2) {
                        relax(&mut dist, i, a, 2);
                        if let Some(b) = self.neighbor(x + 1, z, a, 1) {
                            relax(&mut dist, i, b, 3);
                        }
                    }
                    if let Some(a) = self.neighbor(x, z, i, 1) {
                        relax(&mut dist, i, a, 2);
                        if let Some(b) = self.neighbor(x, z + 1, a, 0) {
                            relax(&mut dist, i, b, 3);
                        }
                    }
                }
            }
        }

        let threshold = (radius * 2).clamp(0, 255) as u8;
        for (area, &d) in self.areas.iter_mut().zip(&dist) {
            if d < threshold {
                *area = NULL_AREA;
            }
        }

        Ok(())
    }

    /// Stamps `area_id` onto every walkable span inside the box
    pub fn mark_box_area(&mut self, bmin: Vec3, bmax: Vec3, area_id: u8) -> Result<()> {
        if bmin.cmpgt(bmax).any() {
            return Err(Error::Recast(format!(
                "invalid area box {:?} - {:?}",
                bmin, bmax
            )));
        }

        let min_x = ((bmin.x - self.bmin.x) / self.cs) as i32;
        let min_y = ((bmin.y - self.bmin.y) / self.ch) as i32;
        let min_z = ((bmin.z - self.bmin.z) / self.cs) as i32;
        let max_x = ((bmax.x - self.bmin.x) / self.cs) as i32;
        let max_y = ((bmax.y - self.bmin.y) / self.ch) as i32;
        let max_z = ((bmax.z - self.bmin.z) / self.cs) as i32;

        if max_x < 0 || min_x >= self.width || max_z < 0 || min_z >= self.height {
            return Ok(());
        }

        let min_x = min_x.max(0);
        let max_x = max_x.min(self.width - 1);
        let min_z = min_z.max(0);
        let max_z = max_z.min(self.height - 1);

        for z in min_z..=max_z {
            for x in min_x..=max_x {
                let cell = self.cells[(x + z * self.width) as usize];
                for i in cell.index as usize..(cell.index + cell.count) as usize {
                    let y = self.spans[i].y as i32;
                    if y >= min_y && y <= max_y && self.areas[i] != NULL_AREA {
                        self.areas[i] = area_id;
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WALKABLE_AREA;

    fn flat_compact(size: i32) -> CompactHeightfield {
        let mut hf = Heightfield::new(
            size,
            size,
            Vec3::ZERO,
            Vec3::new(size as f32, 10.0, size as f32),
            1.0,
            0.5,
        )
        .unwrap();
        for z in 0..size {
            for x in 0..size {
                hf.add_span(x, z, 0, 2, WALKABLE_AREA, 1).unwrap();
            }
        }
        CompactHeightfield::build(4, 1, &hf).unwrap()
    }

    #[test]
    fn test_build_connections() {
        let chf = flat_compact(3);
        assert_eq!(chf.span_count(), 9);

        // Center span connects in every direction
        let center = chf.cells[4].index as usize;
        for dir in 0..4 {
            assert_eq!(chf.get_con(center, dir), 0);
        }

        // Corner span only connects inward
        let corner = chf.cells[0].index as usize;
        assert_eq!(chf.get_con(corner, 0), NOT_CONNECTED);
        assert_eq!(chf.get_con(corner, 3), NOT_CONNECTED);
        assert_eq!(chf.get_con(corner, 1), 0);
        assert_eq!(chf.get_con(corner, 2), 0);
    }

    #[test]
    fn test_steps_beyond_climb_are_not_connected() {
        let mut hf =
            Heightfield::new(2, 1, Vec3::ZERO, Vec3::new(2.0, 10.0, 1.0), 1.0, 0.5).unwrap();
        hf.add_span(0, 0, 0, 2, WALKABLE_AREA, 1).unwrap();
        hf.add_span(1, 0, 0, 6, WALKABLE_AREA, 1).unwrap();
        let chf = CompactHeightfield::build(4, 1, &hf).unwrap();
        assert_eq!(chf.get_con(0, 2), NOT_CONNECTED);
        assert_eq!(chf.get_con(1, 0), NOT_CONNECTED);
    }

    #[test]
    fn test_erode_walkable_area() {
        let mut chf = flat_compact(7);
        chf.erode_walkable_area(1).unwrap();

        let area_at = |chf: &CompactHeightfield, x: i32, z: i32| {
            chf.areas[chf.cells[(x + z * 7) as usize].index as usize]
        };
        assert_eq!(area_at(&chf, 0, 3), NULL_AREA);
        assert_eq!(area_at(&chf, 3, 0), NULL_AREA);
        assert_eq!(area_at(&chf, 3, 3), WALKABLE_AREA);
        assert_eq!(area_at(&chf, 1, 1), WALKABLE_AREA);
    }

    #[test]
    fn test_mark_box_area() {
        let mut chf = flat_compact(4);
        chf.mark_box_area(Vec3::new(0.0, 0.0, 0.0), Vec3::new(1.5, 5.0, 1.5), 7)
            .unwrap();
        assert_eq!(chf.areas[chf.cells[0].index as usize], 7);
        assert_eq!(chf.areas[chf.cells[5].index as usize], 7);
        assert_eq!(chf.areas[chf.cells[15].index as usize], WALKABLE_AREA);

        assert!(chf
            .mark_box_area(Vec3::ONE, Vec3::ZERO, 7)
            .is_err());
    }
}
