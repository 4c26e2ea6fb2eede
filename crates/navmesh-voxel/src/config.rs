//! Configuration for building the layers of a single tile

use glam::Vec3;

use navmesh_common::{Error, Result};

/// Algorithm used to split walkable spans into regions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum PartitionType {
    /// Distance-field watershed partitioning
    Watershed,
    /// Single sweep monotone partitioning
    #[default]
    Monotone,
}

/// A box that stamps an area id onto the walkable spans it contains
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AreaBox {
    pub bmin: Vec3,
    pub bmax: Vec3,
    pub area_id: u8,
}

/// Configuration parameters for voxelizing one tile, in voxel units unless noted
#[derive(Debug, Clone)]
pub struct LayerBuildConfig {
    /// The width of the field along the x-axis, border included
    pub width: i32,
    /// The height of the field along the z-axis, border included
    pub height: i32,

    /// The width/depth resolution of the field (cell size)
    pub cs: f32,
    /// The height resolution of the field (cell height)
    pub ch: f32,

    /// The minimum bounds of the field's AABB, border included
    pub bmin: Vec3,
    /// The maximum bounds of the field's AABB, border included
    pub bmax: Vec3,

    /// The maximum slope in degrees that is considered walkable
    pub walkable_slope_angle: f32,
    /// Minimum floor to ceiling height that still allows walking
    pub walkable_height: i32,
    /// The maximum ledge height that can be climbed
    pub walkable_climb: i32,
    /// The distance to erode the walkable area away from obstacles
    pub walkable_radius: i32,

    /// The minimum number of cells allowed to form isolated island areas
    pub min_region_area: i32,
    /// Regions smaller than this are merged with larger regions if possible
    pub merge_region_area: i32,

    /// The size of the non-navigable border around the tile
    pub border_size: i32,

    /// Region partitioning algorithm
    pub partition_type: PartitionType,
}

impl Default for LayerBuildConfig {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            cs: 0.3,
            ch: 0.2,
            bmin: Vec3::ZERO,
            bmax: Vec3::ZERO,
            walkable_slope_angle: 45.0,
            walkable_height: 10,
            walkable_climb: 4,
            walkable_radius: 2,
            min_region_area: 8,
            merge_region_area: 20,
            border_size: 0,
            partition_type: PartitionType::default(),
        }
    }
}

impl LayerBuildConfig {
    /// Validates the configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.width <= 0 || self.height <= 0 {
            return Err(Error::InvalidMesh("Invalid grid size".to_string()));
        }

        if self.cs <= 0.0 || self.ch <= 0.0 {
            return Err(Error::InvalidMesh(
                "Invalid cell size or height".to_string(),
            ));
        }

        if !(0.0..=90.0).contains(&self.walkable_slope_angle) {
            return Err(Error::InvalidMesh(
                "Invalid walkable slope angle".to_string(),
            ));
        }

        if self.walkable_height < 3 || self.walkable_climb < 0 || self.walkable_radius < 0 {
            return Err(Error::InvalidMesh(
                "Invalid walkable agent dimensions".to_string(),
            ));
        }

        if self.border_size < 0 || self.border_size * 2 >= self.width.min(self.height) {
            return Err(Error::InvalidMesh("Invalid border size".to_string()));
        }

        if self.bmin.cmpgt(self.bmax).any() {
            return Err(Error::InvalidMesh("Invalid bounds".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> LayerBuildConfig {
        LayerBuildConfig {
            width: 32,
            height: 32,
            bmax: Vec3::new(9.6, 5.0, 9.6),
            border_size: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_validate() {
        assert!(valid().validate().is_ok());

        let mut config = valid();
        config.width = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.border_size = 16;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.walkable_slope_angle = 120.0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.bmax = Vec3::new(-1.0, 0.0, 0.0);
        assert!(config.validate().is_err());
    }
}
