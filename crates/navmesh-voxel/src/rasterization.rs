//! Triangle rasterization into a heightfield
//!
//! Triangles are clipped against the cell grid one row and one column at a time.
//! The vertical extent of each clipped piece becomes a span in that cell.

use glam::Vec3;

use super::heightfield::{Heightfield, SPAN_MAX_HEIGHT};
use navmesh_common::{Error, Result};

/// Splits a convex polygon by the line `coordinate[axis] == x`.
///
/// Returns `(below, above)`: the part with coordinates at most `x` and the rest.
fn divide_poly(input: &[Vec3], x: f32, axis: usize) -> (Vec<Vec3>, Vec<Vec3>) {
    let mut below = Vec::with_capacity(input.len() + 2);
    let mut above = Vec::with_capacity(input.len() + 2);
    if input.is_empty() {
        return (below, above);
    }

    let d: Vec<f32> = input.iter().map(|v| x - v[axis]).collect();

    let mut j = input.len() - 1;
    for i in 0..input.len() {
        let in_a = d[j] >= 0.0;
        let in_b = d[i] >= 0.0;
        if in_a != in_b {
            let s = d[j] / (d[j] - d[i]);
            let point = input[j] + (input[i] - input[j]) * s;
            below.push(point);
            above.push(point);
            if d[i] > 0.0 {
                below.push(input[i]);
            } else if d[i] < 0.0 {
                above.push(input[i]);
            }
        } else {
            if d[i] >= 0.0 {
                below.push(input[i]);
                if d[i] != 0.0 {
                    j = i;
                    continue;
                }
            }
            above.push(input[i]);
        }
        j = i;
    }

    (below, above)
}

/// Rasterizes a single triangle into the heightfield
pub fn rasterize_triangle(
    v0: Vec3,
    v1: Vec3,
    v2: Vec3,
    area: u8,
    hf: &mut Heightfield,
    flag_merge_threshold: i32,
) -> Result<()> {
    let by = hf.bmax.y - hf.bmin.y;
    let ics = 1.0 / hf.cs;
    let ich = 1.0 / hf.ch;

    let tmin = v0.min(v1).min(v2);
    let tmax = v0.max(v1).max(v2);

    // Skip triangles that are entirely outside the heightfield
    if tmax.x < hf.bmin.x
        || tmin.x > hf.bmax.x
        || tmax.z < hf.bmin.z
        || tmin.z > hf.bmax.z
        || tmax.y < hf.bmin.y
        || tmin.y > hf.bmax.y
    {
        return Ok(());
    }

    let w = hf.width;
    let h = hf.height;

    let z0 = (((tmin.z - hf.bmin.z) * ics) as i32).clamp(-1, h - 1);
    let z1 = (((tmax.z - hf.bmin.z) * ics) as i32).clamp(0, h - 1);

    let mut remaining = vec![v0, v1, v2];

    for z in z0..=z1 {
        // Clip the triangle into the current row
        let cell_z = hf.bmin.z + z as f32 * hf.cs;
        let (row, rest) = divide_poly(&remaining, cell_z + hf.cs, 2);
        remaining = rest;

        if row.len() < 3 || z < 0 {
            continue;
        }

        let min_x = row.iter().fold(f32::INFINITY, |m, v| m.min(v.x));
        let max_x = row.iter().fold(f32::NEG_INFINITY, |m, v| m.max(v.x));
        if max_x < hf.bmin.x || min_x > hf.bmax.x {
            continue;
        }

        let x0 = (((min_x - hf.bmin.x) * ics) as i32).clamp(-1, w - 1);
        let x1 = (((max_x - hf.bmin.x) * ics) as i32).clamp(0, w - 1);

        let mut row_remaining = row;
        for x in x0..=x1 {
            let cell_x = hf.bmin.x + x as f32 * hf.cs;
            let (cell, rest) = divide_poly(&row_remaining, cell_x + hf.cs, 0);
            row_remaining = rest;

            if cell.len() < 3 || x < 0 {
                continue;
            }

            let mut span_min = cell.iter().fold(f32::INFINITY, |m, v| m.min(v.y));
            let mut span_max = cell.iter().fold(f32::NEG_INFINITY, |m, v| m.max(v.y));
            span_min -= hf.bmin.y;
            span_max -= hf.bmin.y;

            // Skip the span if it is completely outside the heightfield bounding box
            if span_max < 0.0 || span_min > by {
                continue;
            }
            span_min = span_min.max(0.0);
            span_max = span_max.min(by);

            let max_height = SPAN_MAX_HEIGHT as i32;
            let smin = ((span_min * ich).floor() as i32).clamp(0, max_height);
            let smax = ((span_max * ich).ceil() as i32).clamp(smin + 1, max_height);

            hf.add_span(x, z, smin as u16, smax as u16, area, flag_merge_threshold)?;
        }
    }

    Ok(())
}

/// Rasterizes an indexed triangle list.
///
/// `areas` holds one area id per triangle.
pub fn rasterize_triangles(
    verts: &[Vec3],
    indices: &[u32],
    areas: &[u8],
    hf: &mut Heightfield,
    flag_merge_threshold: i32,
) -> Result<()> {
    if indices.len() % 3 != 0 || areas.len() != indices.len() / 3 {
        return Err(Error::InvalidMesh(format!(
            "{} indices do not match {} triangle areas",
            indices.len(),
            areas.len()
        )));
    }

    for (tri, &area) in indices.chunks_exact(3).zip(areas) {
        let fetch = |i: u32| {
            verts.get(i as usize).copied().ok_or_else(|| {
                Error::InvalidMesh(format!("vertex index {} out of range", i))
            })
        };
        let v0 = fetch(tri[0])?;
        let v1 = fetch(tri[1])?;
        let v2 = fetch(tri[2])?;
        rasterize_triangle(v0, v1, v2, area, hf, flag_merge_threshold)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WALKABLE_AREA;

    #[test]
    fn test_divide_poly() {
        let square = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(2.0, 0.0, 0.0),
            Vec3::new(2.0, 0.0, 2.0),
            Vec3::new(0.0, 0.0, 2.0),
        ];
        let (below, above) = divide_poly(&square, 1.0, 0);
        assert_eq!(below.len(), 4);
        assert_eq!(above.len(), 4);
        assert!(below.iter().all(|v| v.x <= 1.0));
        assert!(above.iter().all(|v| v.x >= 1.0));
    }

    #[test]
    fn test_rasterize_flat_quad() {
        let mut hf =
            Heightfield::new(4, 4, Vec3::ZERO, Vec3::new(4.0, 4.0, 4.0), 1.0, 0.5).unwrap();
        let verts = [
            Vec3::new(0.0, 1.0, 0.0),
            Vec3::new(4.0, 1.0, 0.0),
            Vec3::new(4.0, 1.0, 4.0),
            Vec3::new(0.0, 1.0, 4.0),
        ];
        let indices = [0, 2, 1, 0, 3, 2];
        let areas = [WALKABLE_AREA; 2];

        rasterize_triangles(&verts, &indices, &areas, &mut hf, 1).unwrap();

        for z in 0..4 {
            for x in 0..4 {
                let column = hf.column(x, z);
                assert_eq!(column.len(), 1, "cell ({}, {})", x, z);
                assert_eq!(column[0].smin, 2);
                assert_eq!(column[0].smax, 3);
                assert_eq!(column[0].area, WALKABLE_AREA);
            }
        }
    }

    #[test]
    fn test_triangle_outside_is_ignored() {
        let mut hf =
            Heightfield::new(4, 4, Vec3::ZERO, Vec3::new(4.0, 4.0, 4.0), 1.0, 0.5).unwrap();
        rasterize_triangle(
            Vec3::new(10.0, 0.0, 10.0),
            Vec3::new(12.0, 0.0, 10.0),
            Vec3::new(12.0, 0.0, 12.0),
            WALKABLE_AREA,
            &mut hf,
            1,
        )
        .unwrap();
        assert_eq!(hf.span_count(), 0);
    }

    #[test]
    fn test_bad_indices() {
        let mut hf =
            Heightfield::new(4, 4, Vec3::ZERO, Vec3::new(4.0, 4.0, 4.0), 1.0, 0.5).unwrap();
        let verts = [Vec3::ZERO, Vec3::X, Vec3::Z];
        assert!(rasterize_triangles(&verts, &[0, 1, 7], &[WALKABLE_AREA], &mut hf, 1).is_err());
        assert!(rasterize_triangles(&verts, &[0, 1], &[], &mut hf, 1).is_err());
    }
}
