//! Region partitioning
//!
//! Two strategies split the walkable spans of a compact heightfield into regions:
//!
//! - **Watershed**: builds a distance field first and floods regions from the
//!   centers of open areas outwards. Nicest tessellation, slowest.
//! - **Monotone**: a single sweep that merges row segments with the segment above
//!   them. Fast, but regions can become long and thin.
//!
//! Both finish by removing tiny isolated regions and merging small regions into
//! their neighbours.

use std::collections::BTreeSet;

use super::compact_heightfield::CompactHeightfield;
use super::heightfield::NULL_AREA;
use super::{dir_offset_x, dir_offset_z};
use navmesh_common::{Error, Result};

/// Flag for regions painted along the tile border
pub const BORDER_REG: u16 = 0x8000;

/// Sweep neighbour value meaning "more than one neighbour above"
const NULL_NEI: u16 = 0xffff;

#[derive(Debug, Clone, Default)]
struct Region {
    span_count: usize,
    /// Index of the region this one was merged into (itself when alive)
    id: u16,
    area: u8,
    overlap: bool,
    touches_null: bool,
    touches_border: bool,
    visited: bool,
    connections: BTreeSet<u16>,
    floors: BTreeSet<u16>,
}

#[derive(Debug, Clone, Copy, Default)]
struct SweepSpan {
    /// Final region id
    id: u16,
    /// Number of spans connected to the neighbour region
    ns: u16,
    /// Neighbour region id above
    nei: u16,
}

impl CompactHeightfield {
    /// Prepares for watershed partitioning by calculating the distance of every
    /// span to the closest boundary.
    pub fn build_distance_field(&mut self) -> Result<()> {
        let (src, max_distance) = self.calculate_distance_field();
        self.max_distance = max_distance;
        self.dist = self.box_blur(1, &src);
        Ok(())
    }

    fn calculate_distance_field(&self) -> (Vec<u16>, u16) {
        let mut dist = vec![0xffffu16; self.spans.len()];

        // Mark boundary cells
        for (x, z, i) in self.iter_spans() {
            let area = self.areas[i];
            let neighbors = (0..4)
                .filter_map(|dir| self.neighbor(x, z, i, dir))
                .filter(|&n| self.areas[n] == area)
                .count();
            if neighbors != 4 {
                dist[i] = 0;
            }
        }

        let relax = |dist: &mut [u16], i: usize, n: usize, cost: u16| {
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

        let max_distance = dist.iter().copied().max().unwrap_or(0);
        (dist, max_distance)
    }

    fn box_blur(&self, threshold: u16, src: &[u16]) -> Vec<u16> {
        let threshold = threshold * 2;
        let mut dst = vec![0u16; src.len()];

        for (x, z, i) in self.iter_spans() {
            let cd = src[i];
            if cd <= threshold {
                dst[i] = cd;
                continue;
            }

            let mut d = cd as u32;
            for dir in 0..4 {
                match self.neighbor(x, z, i, dir) {
                    Some(a) => {
                        d += src[a] as u32;
                        let ax = x + dir_offset_x(dir);
                        let az = z + dir_offset_z(dir);
                        let dir2 = (dir + 1) & 3;
                        match self.neighbor(ax, az, a, dir2) {
                            Some(b) => d += src[b] as u32,
                            None => d += cd as u32,
                        }
                    }
                    None => d += cd as u32 * 2,
                }
            }
            dst[i] = ((d + 5) / 9).min(0xffff) as u16;
        }

        dst
    }

    /// Partitions the walkable spans with the watershed algorithm.
    ///
    /// Requires [`CompactHeightfield::build_distance_field`] to have been called.
    pub fn build_regions(
        &mut self,
        border_size: i32,
        min_region_area: i32,
        merge_region_area: i32,
    ) -> Result<()> {
        if self.dist.len() != self.spans.len() {
            return Err(Error::Recast(
                "distance field must be built before watershed regions".to_string(),
            ));
        }

        let span_count = self.spans.len();
        let mut src_reg = vec![0u16; span_count];
        let mut src_dist = vec![0u16; span_count];

        let mut region_id: u16 = 1;
        if border_size > 0 {
            region_id = self.paint_border_regions(border_size, region_id, &mut src_reg);
        }
        self.border_size = border_size;

        const EXPAND_ITERS: usize = 8;
        let mut level = (self.max_distance + 1) & !1;

        while level > 0 {
            level = level.saturating_sub(2);

            // Expand current regions until no empty connected cells found
            self.expand_regions(EXPAND_ITERS, level, &mut src_reg, &mut src_dist);

            // Mark new regions with ids
            let seeds: Vec<(i32, i32, usize)> = self
                .iter_spans()
                .filter(|&(_, _, i)| {
                    self.dist[i] >= level && src_reg[i] == 0 && self.areas[i] != NULL_AREA
                })
                .collect();
            for (x, z, i) in seeds {
                if src_reg[i] != 0 {
                    continue;
                }
                if self.flood_region(x, z, i, level, region_id, &mut src_reg, &mut src_dist) {
                    if region_id >= BORDER_REG - 1 {
                        return Err(Error::Recast("region id overflow".to_string()));
                    }
                    region_id += 1;
                }
            }
        }

        self.expand_regions(EXPAND_ITERS * 8, 0, &mut src_reg, &mut src_dist);

        self.max_regions =
            self.merge_and_filter_regions(min_region_area, merge_region_area, region_id, &mut src_reg);

        for (span, reg) in self.spans.iter_mut().zip(src_reg) {
            span.reg = reg;
        }
        Ok(())
    }

    /// Partitions the walkable spans with a monotone sweep
    pub fn build_regions_monotone(
        &mut self,
        border_size: i32,
        min_region_area: i32,
        merge_region_area: i32,
    ) -> Result<()> {
        let w = self.width;
        let h = self.height;
        let mut src_reg = vec![0u16; self.spans.len()];

        let mut id: u16 = 1;
        if border_size > 0 {
            id = self.paint_border_regions(border_size, id, &mut src_reg);
        }
        self.border_size = border_size;

        let mut sweeps = vec![SweepSpan::default(); (w + 1) as usize * 4];
        let mut prev: Vec<u16> = Vec::new();

        for z in border_size..h - border_size {
            // Collect spans from this row
            prev.clear();
            prev.resize(id as usize + 1, 0);
            let mut rid: u16 = 1;

            for x in border_size..w - border_size {
                let cell = self.cells[(x + z * w) as usize];
                for i in cell.index as usize..(cell.index + cell.count) as usize {
                    if self.areas[i] == NULL_AREA {
                        continue;
                    }

                    // -x
                    let mut previd = 0u16;
                    if let Some(a) = self.neighbor(x, z, i, 0) {
                        if src_reg[a] & BORDER_REG == 0 && self.areas[i] == self.areas[a] {
                            previd = src_reg[a];
                        }
                    }

                    if previd == 0 {
                        previd = rid;
                        rid += 1;
                        if previd as usize >= sweeps.len() {
                            sweeps.resize(previd as usize * 2, SweepSpan::default());
                        }
                        sweeps[previd as usize] = SweepSpan::default();
                    }

                    // -z
                    if let Some(a) = self.neighbor(x, z, i, 3) {
                        let nr = src_reg[a];
                        if nr != 0 && nr & BORDER_REG == 0 && self.areas[i] == self.areas[a] {
                            let sweep = &mut sweeps[previd as usize];
                            if sweep.nei == 0 || sweep.nei == nr {
                                sweep.nei = nr;
                                sweep.ns += 1;
                                prev[nr as usize] += 1;
                            } else {
                                sweep.nei = NULL_NEI;
                            }
                        }
                    }

                    src_reg[i] = previd;
                }
            }

            // Create unique ids
            for sweep in sweeps.iter_mut().take(rid as usize).skip(1) {
                if sweep.nei != NULL_NEI && sweep.nei != 0 && prev[sweep.nei as usize] == sweep.ns
                {
                    sweep.id = sweep.nei;
                } else {
                    if id >= BORDER_REG - 1 {
                        return Err(Error::Recast("region id overflow".to_string()));
                    }
                    sweep.id = id;
                    id += 1;
                }
            }

            // Remap ids
            for x in border_size..w - border_size {
                let cell = self.cells[(x + z * w) as usize];
                for i in cell.index as usize..(cell.index + cell.count) as usize {
                    if src_reg[i] > 0 && src_reg[i] < rid {
                        src_reg[i] = sweeps[src_reg[i] as usize].id;
                    }
                }
            }
        }

        self.max_regions =
            self.merge_and_filter_regions(min_region_area, merge_region_area, id, &mut src_reg);

        for (span, reg) in self.spans.iter_mut().zip(src_reg) {
            span.reg = reg;
        }
        Ok(())
    }

    /// Paints the four border strips with their own flagged regions
    fn paint_border_regions(&self, border_size: i32, mut id: u16, src_reg: &mut [u16]) -> u16 {
        let w = self.width;
        let h = self.height;
        let bw = border_size.min(w);
        let bh = border_size.min(h);

        for (min_x, max_x, min_z, max_z) in [
            (0, bw, 0, h),
            (w - bw, w, 0, h),
            (0, w, 0, bh),
            (0, w, h - bh, h),
        ] {
            let reg = id | BORDER_REG;
            for z in min_z..max_z {
                for x in min_x..max_x {
                    let cell = self.cells[(x + z * w) as usize];
                    for i in cell.index as usize..(cell.index + cell.count) as usize {
                        if self.areas[i] != NULL_AREA {
                            src_reg[i] = reg;
                        }
                    }
                }
            }
            id += 1;
        }
        id
    }

    #[allow(clippy::too_many_arguments)]
    fn flood_region(
        &self,
        x: i32,
        z: i32,
        i: usize,
        level: u16,
        r: u16,
        src_reg: &mut [u16],
        src_dist: &mut [u16],
    ) -> bool {
        let area = self.areas[i];
        let mut stack = vec![(x, z, i)];
        src_reg[i] = r;
        src_dist[i] = 0;

        let lev = level.saturating_sub(2);
        let mut count = 0;

        while let Some((cx, cz, ci)) = stack.pop() {
            // Check if any of the neighbours already have a valid region set
            let mut ar = 0u16;
            for dir in 0..4 {
                let Some(a) = self.neighbor(cx, cz, ci, dir) else {
                    continue;
                };
                if self.areas[a] != area {
                    continue;
                }
                let nr = src_reg[a];
                if nr & BORDER_REG != 0 {
                    continue;
                }
                if nr != 0 && nr != r {
                    ar = nr;
                    break;
                }

                let ax = cx + dir_offset_x(dir);
                let az = cz + dir_offset_z(dir);
                let dir2 = (dir + 1) & 3;
                if let Some(a2) = self.neighbor(ax, az, a, dir2) {
                    if self.areas[a2] != area {
                        continue;
                    }
                    let nr2 = src_reg[a2];
                    if nr2 != 0 && nr2 != r {
                        ar = nr2;
                        break;
                    }
                }
            }
            if ar != 0 {
                src_reg[ci] = 0;
                continue;
            }

            count += 1;

            // Expand neighbours
            for dir in 0..4 {
                let Some(a) = self.neighbor(cx, cz, ci, dir) else {
                    continue;
                };
                if self.areas[a] != area {
                    continue;
                }
                if self.dist[a] >= lev && src_reg[a] == 0 {
                    src_reg[a] = r;
                    src_dist[a] = 0;
                    stack.push((cx + dir_offset_x(dir), cz + dir_offset_z(dir), a));
                }
            }
        }

        count > 0
    }

    fn expand_regions(
        &self,
        max_iter: usize,
        level: u16,
        src_reg: &mut [u16],
        src_dist: &mut [u16],
    ) {
        let mut pending: Vec<(i32, i32, usize)> = self
            .iter_spans()
            .filter(|&(_, _, i)| {
                self.dist[i] >= level && src_reg[i] == 0 && self.areas[i] != NULL_AREA
            })
            .collect();

        let mut iter = 0;
        while !pending.is_empty() {
            let mut dirty = Vec::new();

            for &(x, z, i) in &pending {
                let mut r = 0u16;
                let mut d2 = u16::MAX;
                for dir in 0..4 {
                    let Some(a) = self.neighbor(x, z, i, dir) else {
                        continue;
                    };
                    if self.areas[a] != self.areas[i] {
                        continue;
                    }
                    if src_reg[a] > 0 && src_reg[a] & BORDER_REG == 0 {
                        let nd = src_dist[a].saturating_add(2);
                        if nd < d2 {
                            r = src_reg[a];
                            d2 = nd;
                        }
                    }
                }
                if r != 0 {
                    dirty.push((i, r, d2));
                }
            }

            if dirty.is_empty() {
                break;
            }
            for (i, r, d) in dirty {
                src_reg[i] = r;
                src_dist[i] = d;
            }
            pending.retain(|&(_, _, i)| src_reg[i] == 0);

            iter += 1;
            if iter >= max_iter {
                break;
            }
        }
    }

    /// Removes small isolated regions, merges small regions into neighbours and
    /// compacts the remaining ids. Returns the new region count.
    fn merge_and_filter_regions(
        &self,
        min_region_area: i32,
        merge_region_area: i32,
        max_region_id: u16,
        src_reg: &mut [u16],
    ) -> u16 {
        let nreg = max_region_id as usize + 1;
        let mut regions: Vec<Region> = (0..nreg)
            .map(|i| Region {
                id: i as u16,
                ..Default::default()
            })
            .collect();

        // Find edge of a region and find connections around the contour
        for z in 0..self.height {
            for x in 0..self.width {
                let cell = self.cells[(x + z * self.width) as usize];
                let range = cell.index as usize..(cell.index + cell.count) as usize;
                for i in range.clone() {
                    let r = src_reg[i];
                    if r == 0 || r & BORDER_REG != 0 || r as usize >= nreg {
                        continue;
                    }

                    // Regions sharing this column
                    let mut floors = Vec::new();
                    let mut overlap = false;
                    for j in range.clone() {
                        if i == j {
                            continue;
                        }
                        let floor = src_reg[j];
                        if floor == 0 || floor & BORDER_REG != 0 {
                            continue;
                        }
                        if floor == r {
                            overlap = true;
                        }
                        floors.push(floor);
                    }

                    let mut connections = Vec::new();
                    let mut touches_null = false;
                    let mut touches_border = false;
                    for dir in 0..4 {
                        match self.neighbor(x, z, i, dir) {
                            None => touches_null = true,
                            Some(a) => {
                                let ra = src_reg[a];
                                if ra == 0 {
                                    touches_null = true;
                                } else if ra & BORDER_REG != 0 {
                                    touches_border = true;
                                } else if ra != r {
                                    connections.push(ra);
                                }
                            }
                        }
                    }

                    let reg = &mut regions[r as usize];
                    reg.span_count += 1;
                    reg.area = self.areas[i];
                    reg.overlap |= overlap;
                    reg.touches_null |= touches_null;
                    reg.touches_border |= touches_border;
                    reg.floors.extend(floors);
                    reg.connections.extend(connections);
                }
            }
        }

        // Remove too small regions
        for start in 1..nreg {
            if regions[start].span_count == 0 || regions[start].visited {
                continue;
            }

            let mut connects_to_border = false;
            let mut span_count = 0usize;
            let mut trace = Vec::new();
            let mut stack = vec![start];
            regions[start].visited = true;

            while let Some(ri) = stack.pop() {
                span_count += regions[ri].span_count;
                connects_to_border |= regions[ri].touches_border;
                trace.push(ri);

                let neighbors: Vec<u16> = regions[ri].connections.iter().copied().collect();
                for nei in neighbors {
                    let nei = nei as usize;
                    if nei >= nreg || regions[nei].visited || regions[nei].span_count == 0 {
                        continue;
                    }
                    regions[nei].visited = true;
                    stack.push(nei);
                }
            }

            if (span_count as i32) < min_region_area && !connects_to_border {
                for ri in trace {
                    regions[ri].span_count = 0;
                    regions[ri].id = 0;
                }
            }
        }

        // Merge too small regions into neighbour regions
        loop {
            let mut merge_count = 0;
            for ri in 1..nreg {
                let reg = &regions[ri];
                if reg.id as usize != ri || reg.overlap || reg.span_count == 0 {
                    continue;
                }
                if reg.span_count as i32 > merge_region_area && reg.touches_null {
                    continue;
                }

                // Find smallest neighbour region that connects to this one
                let mut smallest = usize::MAX;
                let mut merge_id = ri;
                for &nei in &reg.connections {
                    let mi = nei as usize;
                    if mi >= nreg {
                        continue;
                    }
                    let mreg = &regions[mi];
                    if mreg.id as usize != mi || mreg.overlap || mreg.span_count == 0 {
                        continue;
                    }
                    if mreg.area != reg.area || reg.floors.contains(&nei) {
                        continue;
                    }
                    if mreg.span_count < smallest {
                        smallest = mreg.span_count;
                        merge_id = mi;
                    }
                }

                if merge_id == ri {
                    continue;
                }

                // Merge ri into merge_id
                let merged = std::mem::take(&mut regions[ri]);
                let target = &mut regions[merge_id];
                target.span_count += merged.span_count;
                target.touches_null |= merged.touches_null;
                target.touches_border |= merged.touches_border;
                target.connections.extend(merged.connections.iter().copied());
                target.floors.extend(merged.floors.iter().copied());
                target.connections.remove(&(ri as u16));
                target.connections.remove(&(merge_id as u16));
                target.floors.remove(&(ri as u16));

                regions[ri].id = merge_id as u16;

                // Fixup regions pointing to the merged region
                for reg in regions.iter_mut() {
                    if reg.id as usize == ri {
                        reg.id = merge_id as u16;
                    }
                    if reg.connections.remove(&(ri as u16)) {
                        reg.connections.insert(merge_id as u16);
                    }
                    if reg.floors.remove(&(ri as u16)) {
                        reg.floors.insert(merge_id as u16);
                    }
                }
                regions[merge_id].connections.remove(&(merge_id as u16));

                merge_count += 1;
            }
            if merge_count == 0 {
                break;
            }
        }

        // Compress region ids
        let mut remap = vec![0u16; nreg];
        let mut next_id: u16 = 1;
        for ri in 1..nreg {
            if regions[ri].id as usize == ri && regions[ri].span_count > 0 {
                remap[ri] = next_id;
                next_id += 1;
            }
        }
        for ri in 1..nreg {
            let target = regions[ri].id as usize;
            if target != ri {
                remap[ri] = if target == 0 { 0 } else { remap[target] };
            }
        }

        for reg in src_reg.iter_mut() {
            if *reg != 0 && *reg & BORDER_REG == 0 && (*reg as usize) < nreg {
                *reg = remap[*reg as usize];
            }
        }

        next_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Heightfield, WALKABLE_AREA};
    use glam::Vec3;

    fn flat_compact(width: i32, height: i32) -> CompactHeightfield {
        let mut hf = Heightfield::new(
            width,
            height,
            Vec3::ZERO,
            Vec3::new(width as f32, 10.0, height as f32),
            1.0,
            0.5,
        )
        .unwrap();
        for z in 0..height {
            for x in 0..width {
                hf.add_span(x, z, 0, 2, WALKABLE_AREA, 1).unwrap();
            }
        }
        CompactHeightfield::build(4, 1, &hf).unwrap()
    }

    fn regions(chf: &CompactHeightfield) -> BTreeSet<u16> {
        chf.spans
            .iter()
            .map(|s| s.reg)
            .filter(|&r| r != 0 && r & BORDER_REG == 0)
            .collect()
    }

    #[test]
    fn test_distance_field() {
        let mut chf = flat_compact(9, 9);
        chf.build_distance_field().unwrap();

        let center = chf.cells[4 + 4 * 9].index as usize;
        let corner = chf.cells[0].index as usize;
        assert_eq!(chf.dist[corner], 0);
        assert!(chf.dist[center] > chf.dist[chf.cells[1 + 4 * 9].index as usize]);
        assert_eq!(chf.max_distance, 8);
    }

    #[test]
    fn test_watershed_requires_distance_field() {
        let mut chf = flat_compact(4, 4);
        assert!(chf.build_regions(0, 0, 0).is_err());
    }

    #[test]
    fn test_watershed_single_open_area() {
        let mut chf = flat_compact(12, 12);
        chf.build_distance_field().unwrap();
        chf.build_regions(0, 2, 400).unwrap();

        // Every walkable span belongs to a region and everything merges into one
        assert!(chf.spans.iter().all(|s| s.reg != 0));
        assert_eq!(regions(&chf).len(), 1);
        assert_eq!(chf.max_regions, 2);
    }

    #[test]
    fn test_monotone_single_open_area() {
        let mut chf = flat_compact(10, 6);
        chf.build_regions_monotone(0, 2, 20).unwrap();
        assert!(chf.spans.iter().all(|s| s.reg != 0));
        assert_eq!(regions(&chf).len(), 1);
    }

    #[test]
    fn test_border_regions_are_flagged() {
        let mut chf = flat_compact(10, 10);
        chf.build_regions_monotone(2, 0, 0).unwrap();

        let border_span = chf.cells[0].index as usize;
        let inner_span = chf.cells[5 + 5 * 10].index as usize;
        assert_ne!(chf.spans[border_span].reg & BORDER_REG, 0);
        assert_eq!(chf.spans[inner_span].reg & BORDER_REG, 0);
        assert_ne!(chf.spans[inner_span].reg, 0);
        assert_eq!(chf.border_size, 2);
    }

    #[test]
    fn test_small_islands_are_removed() {
        let mut chf = flat_compact(10, 10);
        // Cut out everything except a 1x1 island and a large block
        for (x, z, i) in chf.iter_spans().collect::<Vec<_>>() {
            let island = x == 1 && z == 1;
            let block = x >= 4 && z >= 4;
            if !island && !block {
                chf.areas[i] = NULL_AREA;
            }
        }

        chf.build_regions_monotone(0, 4, 20).unwrap();
        let island = chf.cells[1 + 10].index as usize;
        let block = chf.cells[6 + 6 * 10].index as usize;
        assert_eq!(chf.spans[island].reg, 0);
        assert_ne!(chf.spans[block].reg, 0);
    }
}
