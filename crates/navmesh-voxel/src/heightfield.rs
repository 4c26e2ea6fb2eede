//! Heightfield representation
//!
//! The heightfield is the first data structure in the tile build pipeline.
//! It's a 2D grid of span columns that represents a voxelized 3D environment.
//! Each column keeps its spans sorted bottom to top and never overlapping.

use glam::Vec3;

use navmesh_common::{Error, Result};

/// Largest height value a span can store
pub const SPAN_MAX_HEIGHT: u16 = 0x1fff;

/// Area id of spans that cannot be walked on
pub const NULL_AREA: u8 = 0;

/// Default area id of walkable spans
pub const WALKABLE_AREA: u8 = 63;

/// A span in the heightfield, representing a vertical segment of solid space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// The minimum height of the span
    pub smin: u16,
    /// The maximum height of the span
    pub smax: u16,
    /// Area ID (0 = not walkable)
    pub area: u8,
}

impl Span {
    /// Creates a new span
    pub fn new(smin: u16, smax: u16, area: u8) -> Self {
        Self { smin, smax, area }
    }
}

/// Heightfield structure holding a grid of span columns
#[derive(Debug, Clone)]
pub struct Heightfield {
    /// Width of the heightfield along the x-axis
    pub width: i32,
    /// Height (depth) of the heightfield along the z-axis
    pub height: i32,

    /// The minimum bounds of the heightfield's AABB
    pub bmin: Vec3,
    /// The maximum bounds of the heightfield's AABB
    pub bmax: Vec3,

    /// Cell size (horizontal resolution)
    pub cs: f32,
    /// Cell height (vertical resolution)
    pub ch: f32,

    /// Span columns, indexed by `x + z * width`
    columns: Vec<Vec<Span>>,
}

impl Heightfield {
    /// Creates a new empty heightfield
    pub fn new(width: i32, height: i32, bmin: Vec3, bmax: Vec3, cs: f32, ch: f32) -> Result<Self> {
        if width <= 0 || height <= 0 {
            return Err(Error::Recast(format!(
                "invalid heightfield dimensions {}x{}",
                width, height
            )));
        }
        if cs <= 0.0 || ch <= 0.0 {
            return Err(Error::Recast(format!(
                "invalid heightfield cell size {} / {}",
                cs, ch
            )));
        }

        Ok(Self {
            width,
            height,
            bmin,
            bmax,
            cs,
            ch,
            columns: vec![Vec::new(); (width * height) as usize],
        })
    }

    /// Returns the spans of a column, bottom to top
    pub fn column(&self, x: i32, z: i32) -> &[Span] {
        &self.columns[(x + z * self.width) as usize]
    }

    /// Mutable access to the spans of a column
    pub fn column_mut(&mut self, x: i32, z: i32) -> &mut [Span] {
        &mut self.columns[(x + z * self.width) as usize]
    }

    /// Total number of spans in the heightfield
    pub fn span_count(&self) -> usize {
        self.columns.iter().map(Vec::len).sum()
    }

    /// Number of spans that are walkable
    pub fn walkable_span_count(&self) -> usize {
        self.columns
            .iter()
            .flatten()
            .filter(|s| s.area != NULL_AREA)
            .count()
    }

    /// Adds a span to a column, merging it with any span it overlaps.
    ///
    /// When the top of the merged span is within `flag_merge_threshold` of the top of
    /// an existing span, the higher area id wins.
    pub fn add_span(
        &mut self,
        x: i32,
        z: i32,
        smin: u16,
        smax: u16,
        area: u8,
        flag_merge_threshold: i32,
    ) -> Result<()> {
        if x < 0 || z < 0 || x >= self.width || z >= self.height {
            return Err(Error::Recast(format!(
                "span position ({}, {}) outside heightfield",
                x, z
            )));
        }
        if smin > smax {
            return Err(Error::Recast(format!(
                "span minimum {} above maximum {}",
                smin, smax
            )));
        }

        let column = &mut self.columns[(x + z * self.width) as usize];
        let mut new_span = Span::new(smin, smax, area);

        let mut i = 0;
        while i < column.len() {
            let current = column[i];
            if current.smin > new_span.smax {
                // Current span is completely above the new span
                break;
            }
            if current.smax < new_span.smin {
                i += 1;
                continue;
            }

            new_span.smin = new_span.smin.min(current.smin);
            new_span.smax = new_span.smax.max(current.smax);

            if (new_span.smax as i32 - current.smax as i32).abs() <= flag_merge_threshold {
                new_span.area = new_span.area.max(current.area);
            }

            column.remove(i);
        }

        column.insert(i, new_span);
        Ok(())
    }
}
