//! Heightfield layers
//!
//! Splits a partitioned compact heightfield into 2.5D layers. Within a layer every
//! grid cell holds at most one span, so a layer can be stored as plain per-cell
//! arrays and meshed independently. Layers are what the tile cache stores.

use std::collections::BTreeSet;

use glam::Vec3;

use super::compact_heightfield::CompactHeightfield;
use super::heightfield::NULL_AREA;
use super::regions::BORDER_REG;
use super::{dir_offset_x, dir_offset_z};
use navmesh_common::{Error, Result};

/// Height value of a layer cell that holds no span
pub const LAYER_EMPTY_HEIGHT: u8 = 0xff;

/// Maximum number of layers a single tile can be split into
pub const MAX_HEIGHTFIELD_LAYERS: usize = 255;

/// Largest height range a layer can represent
const MAX_LAYER_HEIGHT: i32 = 254;

const NO_LAYER: u8 = 0xff;

/// A single layer of a tile
#[derive(Debug, Clone)]
pub struct HeightfieldLayer {
    /// Minimum bounds in world space
    pub bmin: Vec3,
    /// Maximum bounds in world space
    pub bmax: Vec3,
    /// Cell size
    pub cs: f32,
    /// Cell height
    pub ch: f32,
    /// Width of the layer grid
    pub width: i32,
    /// Depth of the layer grid
    pub height: i32,
    /// Bounds of the used cells, in grid coordinates
    pub minx: i32,
    pub maxx: i32,
    pub miny: i32,
    pub maxy: i32,
    /// Height range of the layer, in voxels relative to the heightfield origin
    pub hmin: i32,
    pub hmax: i32,
    /// Per-cell floor height relative to `hmin`, [`LAYER_EMPTY_HEIGHT`] when empty
    pub heights: Vec<u8>,
    /// Per-cell area id
    pub areas: Vec<u8>,
    /// Per-cell connections: low nibble links inside the layer, high nibble
    /// marks portals to other layers
    pub cons: Vec<u8>,
}

impl HeightfieldLayer {
    /// Number of non-empty cells
    pub fn walkable_cell_count(&self) -> usize {
        self.heights
            .iter()
            .filter(|&&h| h != LAYER_EMPTY_HEIGHT)
            .count()
    }
}

/// The layers built from one compact heightfield
#[derive(Debug, Clone, Default)]
pub struct HeightfieldLayerSet {
    pub layers: Vec<HeightfieldLayer>,
}

impl HeightfieldLayerSet {
    /// Number of layers
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether no layers were produced
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

#[derive(Debug, Clone)]
struct LayerRegion {
    ymin: i32,
    ymax: i32,
    layer_id: u8,
    /// Regions sharing a column with this one
    overlaps: BTreeSet<u16>,
    neighbors: BTreeSet<u16>,
    used: bool,
}

/// Groups the regions of a partitioned compact heightfield into layers.
///
/// Regions are gathered into a layer by flooding across neighbour regions as long as
/// no two regions of the layer share a column. Layers that do not overlap and sit
/// within `walkable_height` of each other are merged afterwards.
pub fn build_heightfield_layers(
    chf: &CompactHeightfield,
    border_size: i32,
    walkable_height: i32,
) -> Result<HeightfieldLayerSet> {
    let nregs = chf.max_regions as usize;
    if chf.spans.iter().any(|s| {
        s.reg != 0 && s.reg & BORDER_REG == 0 && s.reg as usize >= nregs
    }) {
        return Err(Error::Recast(
            "compact heightfield has not been partitioned into regions".to_string(),
        ));
    }

    let region_of = |i: usize| -> Option<usize> {
        let reg = chf.spans[i].reg;
        if reg == 0 || reg & BORDER_REG != 0 || chf.areas[i] == NULL_AREA {
            None
        } else {
            Some(reg as usize)
        }
    };

    let mut regions: Vec<LayerRegion> = (0..nregs)
        .map(|_| LayerRegion {
            ymin: i32::MAX,
            ymax: i32::MIN,
            layer_id: NO_LAYER,
            overlaps: BTreeSet::new(),
            neighbors: BTreeSet::new(),
            used: false,
        })
        .collect();

    // Gather region heights, neighbours and overlaps
    for z in 0..chf.height {
        for x in 0..chf.width {
            let cell = chf.cells[(x + z * chf.width) as usize];
            let range = cell.index as usize..(cell.index + cell.count) as usize;

            let column: Vec<usize> = range.clone().filter_map(region_of).collect();
            for &a in &column {
                for &b in &column {
                    if a != b {
                        regions[a].overlaps.insert(b as u16);
                    }
                }
            }

            for i in range {
                let Some(ri) = region_of(i) else {
                    continue;
                };
                let y = chf.spans[i].y as i32;
                let region = &mut regions[ri];
                region.used = true;
                region.ymin = region.ymin.min(y);
                region.ymax = region.ymax.max(y);

                for dir in 0..4 {
                    if let Some(a) = chf.neighbor(x, z, i, dir) {
                        if let Some(rai) = region_of(a) {
                            if rai != ri {
                                regions[ri].neighbors.insert(rai as u16);
                            }
                        }
                    }
                }
            }
        }
    }

    // Flood layers across neighbouring regions
    let mut layers: Vec<LayerGroup> = Vec::new();
    for start in 1..nregs {
        if !regions[start].used || regions[start].layer_id != NO_LAYER {
            continue;
        }
        if layers.len() >= MAX_HEIGHTFIELD_LAYERS {
            return Err(Error::Recast(format!(
                "too many heightfield layers (max: {})",
                MAX_HEIGHTFIELD_LAYERS
            )));
        }

        let layer_id = layers.len() as u8;
        let mut group = LayerGroup {
            ymin: regions[start].ymin,
            ymax: regions[start].ymax,
            regions: vec![start as u16],
        };
        regions[start].layer_id = layer_id;

        let mut stack = vec![start];
        while let Some(ri) = stack.pop() {
            let neighbors: Vec<u16> = regions[ri].neighbors.iter().copied().collect();
            for nei in neighbors {
                let ni = nei as usize;
                let candidate = &regions[ni];
                if candidate.layer_id != NO_LAYER {
                    continue;
                }
                if group.regions.iter().any(|r| candidate.overlaps.contains(r)) {
                    continue;
                }
                let ymin = group.ymin.min(candidate.ymin);
                let ymax = group.ymax.max(candidate.ymax);
                if ymax - ymin > MAX_LAYER_HEIGHT {
                    continue;
                }

                group.ymin = ymin;
                group.ymax = ymax;
                group.regions.push(nei);
                regions[ni].layer_id = layer_id;
                stack.push(ni);
            }
        }

        layers.push(group);
    }

    // Merge non-overlapping layers that are close in height
    let merge_height = walkable_height * 4;
    let mut merged = true;
    while merged {
        merged = false;
        'outer: for i in 0..layers.len() {
            for j in (i + 1)..layers.len() {
                let (a, b) = (&layers[i], &layers[j]);
                if a.ymin > b.ymax + merge_height || b.ymin > a.ymax + merge_height {
                    continue;
                }
                let ymin = a.ymin.min(b.ymin);
                let ymax = a.ymax.max(b.ymax);
                if ymax - ymin > MAX_LAYER_HEIGHT {
                    continue;
                }
                let overlapping = a.regions.iter().any(|&ra| {
                    b.regions
                        .iter()
                        .any(|rb| regions[ra as usize].overlaps.contains(rb))
                });
                if overlapping {
                    continue;
                }

                let absorbed = layers.remove(j);
                let target = &mut layers[i];
                target.ymin = ymin;
                target.ymax = ymax;
                target.regions.extend(absorbed.regions);
                merged = true;
                break 'outer;
            }
        }
    }

    // Reassign compact layer ids
    for (layer_id, group) in layers.iter().enumerate() {
        for &r in &group.regions {
            regions[r as usize].layer_id = layer_id as u8;
        }
    }

    let lw = chf.width - border_size * 2;
    let lh = chf.height - border_size * 2;
    if lw <= 0 || lh <= 0 {
        return Err(Error::Recast(format!(
            "border {} leaves no room in a {}x{} heightfield",
            border_size, chf.width, chf.height
        )));
    }

    let border_offset = Vec3::new(border_size as f32 * chf.cs, 0.0, border_size as f32 * chf.cs);
    let layer_of = |i: usize| region_of(i).map_or(NO_LAYER, |r| regions[r].layer_id);

    let mut set = HeightfieldLayerSet::default();
    for (layer_id, group) in layers.iter().enumerate() {
        let layer_id = layer_id as u8;
        let cell_count = (lw * lh) as usize;
        let hmin = group.ymin;
        let hmax = group.ymax;

        let mut bmin = chf.bmin + border_offset;
        let mut bmax = chf.bmax - border_offset;
        bmin.y = chf.bmin.y + hmin as f32 * chf.ch;
        bmax.y = chf.bmin.y + hmax as f32 * chf.ch;

        let mut layer = HeightfieldLayer {
            bmin,
            bmax,
            cs: chf.cs,
            ch: chf.ch,
            width: lw,
            height: lh,
            minx: lw,
            maxx: 0,
            miny: lh,
            maxy: 0,
            hmin,
            hmax,
            heights: vec![LAYER_EMPTY_HEIGHT; cell_count],
            areas: vec![NULL_AREA; cell_count],
            cons: vec![0; cell_count],
        };

        for z in 0..lh {
            for x in 0..lw {
                let cx = x + border_size;
                let cz = z + border_size;
                let cell = chf.cells[(cx + cz * chf.width) as usize];
                for i in cell.index as usize..(cell.index + cell.count) as usize {
                    if layer_of(i) != layer_id {
                        continue;
                    }

                    let idx = (x + z * lw) as usize;
                    let span = chf.spans[i];
                    layer.minx = layer.minx.min(x);
                    layer.maxx = layer.maxx.max(x);
                    layer.miny = layer.miny.min(z);
                    layer.maxy = layer.maxy.max(z);

                    layer.heights[idx] = (span.y as i32 - hmin).clamp(0, MAX_LAYER_HEIGHT) as u8;
                    layer.areas[idx] = chf.areas[i];

                    let mut portal = 0u8;
                    let mut con = 0u8;
                    for dir in 0..4 {
                        let Some(a) = chf.neighbor(cx, cz, i, dir) else {
                            continue;
                        };
                        if chf.areas[a] == NULL_AREA {
                            continue;
                        }
                        let alid = layer_of(a);
                        if alid != layer_id {
                            portal |= 1 << dir;
                            // Match heights on both sides of the portal
                            let ay = chf.spans[a].y as i32 - hmin;
                            if ay > 0 {
                                let ay = ay.min(MAX_LAYER_HEIGHT) as u8;
                                layer.heights[idx] = layer.heights[idx].max(ay);
                            }
                        } else {
                            let nx = x + dir_offset_x(dir);
                            let nz = z + dir_offset_z(dir);
                            if nx >= 0 && nz >= 0 && nx < lw && nz < lh {
                                con |= 1 << dir;
                            }
                        }
                    }
                    layer.cons[idx] = (portal << 4) | con;
                }
            }
        }

        if layer.minx > layer.maxx {
            layer.minx = 0;
            layer.maxx = 0;
        }
        if layer.miny > layer.maxy {
            layer.miny = 0;
            layer.maxy = 0;
        }

        set.layers.push(layer);
    }

    Ok(set)
}

#[derive(Debug, Clone)]
struct LayerGroup {
    ymin: i32,
    ymax: i32,
    regions: Vec<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Heightfield, WALKABLE_AREA};

    fn partitioned(hf: &Heightfield, border: i32) -> CompactHeightfield {
        let mut chf = CompactHeightfield::build(4, 1, hf).unwrap();
        chf.build_regions_monotone(border, 0, 0).unwrap();
        chf
    }

    #[test]
    fn test_single_floor_single_layer() {
        let mut hf =
            Heightfield::new(8, 8, Vec3::ZERO, Vec3::new(8.0, 20.0, 8.0), 1.0, 0.5).unwrap();
        for z in 0..8 {
            for x in 0..8 {
                hf.add_span(x, z, 0, 2, WALKABLE_AREA, 1).unwrap();
            }
        }
        let chf = partitioned(&hf, 2);
        let set = build_heightfield_layers(&chf, 2, 4).unwrap();

        assert_eq!(set.len(), 1);
        let layer = &set.layers[0];
        assert_eq!(layer.width, 4);
        assert_eq!(layer.height, 4);
        assert_eq!(layer.walkable_cell_count(), 16);
        assert_eq!(layer.hmin, 2);
        assert_eq!(layer.heights[0], 0);
        assert!((layer.bmin.x - 2.0).abs() < 1e-6);
        assert!((layer.bmax.x - 6.0).abs() < 1e-6);

        // Interior cell connects in all four directions
        assert_eq!(layer.cons[1 + 4] & 0xf, 0xf);
        // Corner cell connects only inward
        assert_eq!(layer.cons[0] & 0xf, 0b0110);
    }

    #[test]
    fn test_stacked_floors_split_into_layers() {
        let mut hf =
            Heightfield::new(6, 6, Vec3::ZERO, Vec3::new(6.0, 40.0, 6.0), 1.0, 0.5).unwrap();
        for z in 0..6 {
            for x in 0..6 {
                hf.add_span(x, z, 0, 2, WALKABLE_AREA, 1).unwrap();
                hf.add_span(x, z, 30, 32, WALKABLE_AREA, 1).unwrap();
            }
        }
        let chf = partitioned(&hf, 0);
        let set = build_heightfield_layers(&chf, 0, 4).unwrap();

        assert_eq!(set.len(), 2);
        let mut hmins: Vec<i32> = set.layers.iter().map(|l| l.hmin).collect();
        hmins.sort_unstable();
        assert_eq!(hmins, vec![2, 32]);
        for layer in &set.layers {
            assert_eq!(layer.walkable_cell_count(), 36);
        }
    }

    #[test]
    fn test_unpartitioned_heightfield_yields_no_layers() {
        let mut hf =
            Heightfield::new(4, 4, Vec3::ZERO, Vec3::new(4.0, 10.0, 4.0), 1.0, 0.5).unwrap();
        hf.add_span(1, 1, 0, 2, WALKABLE_AREA, 1).unwrap();
        let chf = CompactHeightfield::build(4, 1, &hf).unwrap();
        let set = build_heightfield_layers(&chf, 0, 4).unwrap();
        assert!(set.is_empty());
    }
}
