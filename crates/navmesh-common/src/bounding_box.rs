//! Axis-aligned bounding boxes

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use glam::Vec3;
use std::io::{Read, Write};

use crate::Result;

/// Axis-aligned bounding box.
///
/// An empty box has `min = +inf` and `max = -inf`, so merging any point into it
/// yields a degenerate box around that point.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct BoundingBox {
    /// Minimum corner
    pub min: Vec3,
    /// Maximum corner
    pub max: Vec3,
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::empty()
    }
}

impl BoundingBox {
    /// Size of the box in bytes when written with [`BoundingBox::write_to`]
    pub const SERIALIZED_SIZE: usize = 24;

    /// Creates a box from two corners
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Creates an empty box
    pub fn empty() -> Self {
        Self {
            min: Vec3::splat(f32::INFINITY),
            max: Vec3::splat(f32::NEG_INFINITY),
        }
    }

    /// Returns true if the box contains no volume and no point
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Grows the box to include a point
    pub fn merge_point(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    /// Grows the box to include another box
    pub fn merge(&mut self, other: &BoundingBox) {
        if other.is_empty() {
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Returns a box grown by `amount` on every side
    pub fn expanded(&self, amount: Vec3) -> BoundingBox {
        BoundingBox::new(self.min - amount, self.max + amount)
    }

    /// Returns true if the two boxes overlap (touching counts as overlap)
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        !(other.max.x < self.min.x
            || other.min.x > self.max.x
            || other.max.y < self.min.y
            || other.min.y > self.max.y
            || other.max.z < self.min.z
            || other.min.z > self.max.z)
    }

    /// Returns true if the point lies inside or on the box
    pub fn contains_point(&self, point: Vec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }

    /// Euclidean distance from the box surface to a point, zero when inside
    pub fn distance_to_point(&self, point: Vec3) -> f32 {
        let offset = (self.min - point).max(Vec3::ZERO).max(point - self.max);
        offset.length()
    }

    /// Writes the box as six little-endian floats
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        for v in [self.min, self.max] {
            writer.write_f32::<LittleEndian>(v.x)?;
            writer.write_f32::<LittleEndian>(v.y)?;
            writer.write_f32::<LittleEndian>(v.z)?;
        }
        Ok(())
    }

    /// Reads a box written by [`BoundingBox::write_to`]
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let read_vec = |r: &mut R| -> Result<Vec3> {
            Ok(Vec3::new(
                r.read_f32::<LittleEndian>()?,
                r.read_f32::<LittleEndian>()?,
                r.read_f32::<LittleEndian>()?,
            ))
        };
        let min = read_vec(reader)?;
        let max = read_vec(reader)?;
        Ok(Self { min, max })
    }
}
