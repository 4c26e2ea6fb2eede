//! Walkability marking and heightfield span filters

use glam::Vec3;

use super::heightfield::{Heightfield, NULL_AREA, SPAN_MAX_HEIGHT, WALKABLE_AREA};
use super::{dir_offset_x, dir_offset_z};

/// Marks triangles whose slope is below `walkable_slope_angle` (degrees) as walkable.
///
/// Triangles must be wound so that their normal points up. Areas of steep triangles
/// are left untouched.
pub fn mark_walkable_triangles(
    walkable_slope_angle: f32,
    verts: &[Vec3],
    indices: &[u32],
    areas: &mut [u8],
) {
    let walkable_thr = walkable_slope_angle.to_radians().cos();

    for (tri, area) in indices.chunks_exact(3).zip(areas.iter_mut()) {
        let (Some(v0), Some(v1), Some(v2)) = (
            verts.get(tri[0] as usize),
            verts.get(tri[1] as usize),
            verts.get(tri[2] as usize),
        ) else {
            continue;
        };

        let normal = (*v1 - *v0).cross(*v2 - *v0).normalize_or_zero();
        if normal.y > walkable_thr {
            *area = WALKABLE_AREA;
        }
    }
}

/// Lets small obstacles (curbs, stair steps) inherit the area of the walkable span
/// directly below them when the step is within `walkable_climb`.
pub fn filter_low_hanging_walkable_obstacles(walkable_climb: i32, hf: &mut Heightfield) {
    for z in 0..hf.height {
        for x in 0..hf.width {
            let column = hf.column_mut(x, z);
            let mut previous_walkable = false;
            let mut previous_area = NULL_AREA;
            let mut previous_smax = 0i32;

            for span in column.iter_mut() {
                let walkable = span.area != NULL_AREA;
                if !walkable
                    && previous_walkable
                    && span.smax as i32 - previous_smax <= walkable_climb
                {
                    span.area = previous_area;
                }

                previous_walkable = walkable;
                previous_area = span.area;
                previous_smax = span.smax as i32;
            }
        }
    }
}

/// Removes walkable spans next to a drop larger than `walkable_climb`, and spans on
/// steep slopes where neighbours differ too much in height.
pub fn filter_ledge_spans(walkable_height: i32, walkable_climb: i32, hf: &mut Heightfield) {
    let max_height = SPAN_MAX_HEIGHT as i32;
    let mut ledges = Vec::new();

    for z in 0..hf.height {
        for x in 0..hf.width {
            let column = hf.column(x, z);
            for (i, span) in column.iter().enumerate() {
                if span.area == NULL_AREA {
                    continue;
                }

                let bot = span.smax as i32;
                let top = column.get(i + 1).map_or(max_height, |n| n.smin as i32);

                let mut min_neighbor_height = max_height;
                let mut accessible_min = span.smax as i32;
                let mut accessible_max = span.smax as i32;

                for dir in 0..4 {
                    let dx = x + dir_offset_x(dir);
                    let dz = z + dir_offset_z(dir);

                    // Out of bounds counts as a drop
                    if dx < 0 || dz < 0 || dx >= hf.width || dz >= hf.height {
                        min_neighbor_height = min_neighbor_height.min(-walkable_climb - bot);
                        continue;
                    }

                    let neighbor = hf.column(dx, dz);

                    // Space below the first neighbour span
                    let nbot = -walkable_climb;
                    let ntop = neighbor.first().map_or(max_height, |n| n.smin as i32);
                    if top.min(ntop) - bot.max(nbot) > walkable_height {
                        min_neighbor_height = min_neighbor_height.min(nbot - bot);
                    }

                    for (j, ns) in neighbor.iter().enumerate() {
                        let nbot = ns.smax as i32;
                        let ntop = neighbor.get(j + 1).map_or(max_height, |n| n.smin as i32);
                        if top.min(ntop) - bot.max(nbot) > walkable_height {
                            min_neighbor_height = min_neighbor_height.min(nbot - bot);
                            if (nbot - bot).abs() <= walkable_climb {
                                accessible_min = accessible_min.min(nbot);
                                accessible_max = accessible_max.max(nbot);
                            }
                        }
                    }
                }

                if min_neighbor_height < -walkable_climb
                    || accessible_max - accessible_min > walkable_climb
                {
                    ledges.push((x, z, i));
                }
            }
        }
    }

    for (x, z, i) in ledges {
        hf.column_mut(x, z)[i].area = NULL_AREA;
    }
}

/// Removes walkable spans without enough clearance above them
pub fn filter_walkable_low_height_spans(walkable_height: i32, hf: &mut Heightfield) {
    let max_height = SPAN_MAX_HEIGHT as i32;
    for z in 0..hf.height {
        for x in 0..hf.width {
            let column = hf.column_mut(x, z);
            for i in 0..column.len() {
                let bot = column[i].smax as i32;
                let top = column.get(i + 1).map_or(max_height, |n| n.smin as i32);
                if top - bot <= walkable_height {
                    column[i].area = NULL_AREA;
                }
            }
        }
    }
}
