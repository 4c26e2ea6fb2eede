//! Build settings shared by the static and the dynamic navigation mesh

use glam::{Vec2, Vec3};
use navmesh_tilecache::{LinearAllocatorConfig, TileCacheConfig};
use navmesh_voxel::PartitionType;

/// Smallest number of layers a tile may hold
pub const MIN_LAYERS: u32 = 3;
/// Largest number of layers a tile may hold
pub const MAX_LAYERS: u32 = 255;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct NavigationMeshConfig {
    /// Tile edge length in cells
    pub tile_size: i32,
    pub cell_size: f32,
    pub cell_height: f32,
    pub agent_height: f32,
    pub agent_radius: f32,
    pub agent_max_climb: f32,
    /// Maximum walkable slope in degrees
    pub agent_max_slope: f32,
    pub region_min_size: f32,
    pub region_merge_size: f32,
    pub edge_max_length: f32,
    pub edge_max_error: f32,
    pub detail_sample_distance: f32,
    pub detail_sample_max_error: f32,
    /// Padding added around the geometry bounds on a full rebuild
    pub padding: Vec3,
    /// Vertical extent of every tile. Ignored unless `x < y`.
    pub height_range: Vec2,
    pub partition_type: PartitionType,
    /// Layers per tile, see [`NavigationMeshConfig::with_max_layers`]
    pub max_layers: u32,
    pub max_obstacles: u32,
    /// Tile capacity used when the geometry bounds give no hint
    pub default_max_tiles: u32,
    pub allocator: LinearAllocatorConfig,
    pub tile_cache: TileCacheConfig,
}

impl Default for NavigationMeshConfig {
    fn default() -> Self {
        Self {
            tile_size: 128,
            cell_size: 0.3,
            cell_height: 0.2,
            agent_height: 2.0,
            agent_radius: 0.6,
            agent_max_climb: 0.9,
            agent_max_slope: 45.0,
            region_min_size: 8.0,
            region_merge_size: 20.0,
            edge_max_length: 12.0,
            edge_max_error: 1.3,
            detail_sample_distance: 6.0,
            detail_sample_max_error: 1.0,
            padding: Vec3::ONE,
            height_range: Vec2::ZERO,
            partition_type: PartitionType::Watershed,
            max_layers: 16,
            max_obstacles: 1024,
            default_max_tiles: 256,
            allocator: LinearAllocatorConfig::default(),
            tile_cache: TileCacheConfig::default(),
        }
    }
}

impl NavigationMeshConfig {
    pub fn with_tile_size(mut self, tile_size: i32) -> Self {
        self.tile_size = tile_size;
        self
    }

    pub fn with_cell_size(mut self, cell_size: f32) -> Self {
        self.cell_size = cell_size;
        self
    }

    pub fn with_cell_height(mut self, cell_height: f32) -> Self {
        self.cell_height = cell_height;
        self
    }

    pub fn with_agent_height(mut self, agent_height: f32) -> Self {
        self.agent_height = agent_height;
        self
    }

    pub fn with_agent_radius(mut self, agent_radius: f32) -> Self {
        self.agent_radius = agent_radius;
        self
    }

    pub fn with_agent_max_climb(mut self, agent_max_climb: f32) -> Self {
        self.agent_max_climb = agent_max_climb;
        self
    }

    pub fn with_agent_max_slope(mut self, agent_max_slope: f32) -> Self {
        self.agent_max_slope = agent_max_slope;
        self
    }

    pub fn with_region_min_size(mut self, region_min_size: f32) -> Self {
        self.region_min_size = region_min_size;
        self
    }

    pub fn with_region_merge_size(mut self, region_merge_size: f32) -> Self {
        self.region_merge_size = region_merge_size;
        self
    }

    pub fn with_edge_max_error(mut self, edge_max_error: f32) -> Self {
        self.edge_max_error = edge_max_error;
        self
    }

    pub fn with_padding(mut self, padding: Vec3) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_height_range(mut self, min: f32, max: f32) -> Self {
        self.height_range = Vec2::new(min, max);
        self
    }

    pub fn with_partition_type(mut self, partition_type: PartitionType) -> Self {
        self.partition_type = partition_type;
        self
    }

    /// Sets the layer count, clamped to `[3, 255]`.
    ///
    /// Stacked geometry tends to produce layers inside hollow space, so fewer
    /// than three layers is never useful.
    pub fn with_max_layers(mut self, max_layers: u32) -> Self {
        self.max_layers = max_layers.clamp(MIN_LAYERS, MAX_LAYERS);
        self
    }

    pub fn with_max_obstacles(mut self, max_obstacles: u32) -> Self {
        self.max_obstacles = max_obstacles;
        self
    }

    pub fn with_allocator(mut self, allocator: LinearAllocatorConfig) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn with_tile_cache(mut self, tile_cache: TileCacheConfig) -> Self {
        self.tile_cache = tile_cache;
        self
    }

    /// Whether `height_range` restricts the vertical extent of tiles
    pub fn is_height_range_valid(&self) -> bool {
        self.height_range.x < self.height_range.y
    }

    /// World-space edge length of one tile
    pub fn tile_edge_length(&self) -> f32 {
        self.tile_size as f32 * self.cell_size
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(16..=255).contains(&self.tile_size) {
            return Err("Tile size must be between 16 and 255 cells".to_string());
        }
        if self.cell_size <= 0.0 {
            return Err("Cell size must be positive".to_string());
        }
        if self.cell_height <= 0.0 {
            return Err("Cell height must be positive".to_string());
        }
        if self.agent_height <= 0.0 {
            return Err("Agent height must be positive".to_string());
        }
        if self.agent_radius < 0.0 {
            return Err("Agent radius cannot be negative".to_string());
        }
        if self.agent_max_climb < 0.0 {
            return Err("Agent max climb cannot be negative".to_string());
        }
        if !(0.0..=90.0).contains(&self.agent_max_slope) {
            return Err("Agent max slope must be between 0 and 90 degrees".to_string());
        }
        if self.padding.min_element() < 0.0 {
            return Err("Padding cannot be negative".to_string());
        }
        if !(MIN_LAYERS..=MAX_LAYERS).contains(&self.max_layers) {
            return Err(format!(
                "Max layers must be between {} and {}",
                MIN_LAYERS, MAX_LAYERS
            ));
        }
        if self.max_obstacles > 0xffff {
            return Err("Max obstacles cannot exceed 65535".to_string());
        }
        if self.default_max_tiles == 0 {
            return Err("Default max tiles must be positive".to_string());
        }
        self.allocator.validate()?;
        if self.tile_cache.max_requests == 0 || self.tile_cache.max_tile_updates_per_call == 0 {
            return Err("Tile cache request and update budgets must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = NavigationMeshConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tile_size, 128);
        assert_eq!(config.max_layers, 16);
        assert_eq!(config.partition_type, PartitionType::Watershed);
        assert!(!config.is_height_range_valid());
    }

    #[test]
    fn test_max_layers_is_clamped() {
        let config = NavigationMeshConfig::default();
        assert_eq!(config.clone().with_max_layers(0).max_layers, 3);
        assert_eq!(config.clone().with_max_layers(1000).max_layers, 255);
        assert_eq!(config.with_max_layers(8).max_layers, 8);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = NavigationMeshConfig::default();
        assert!(config.clone().with_tile_size(8).validate().is_err());
        assert!(config.clone().with_tile_size(256).validate().is_err());
        assert!(config.clone().with_cell_size(0.0).validate().is_err());
        assert!(config.clone().with_agent_max_slope(120.0).validate().is_err());
        assert!(config.clone().with_max_obstacles(70_000).validate().is_err());
        assert!(config
            .with_allocator(LinearAllocatorConfig {
                initial_capacity: 1024,
                growth_factor: 0.5,
            })
            .validate()
            .is_err());
    }

    #[test]
    fn test_height_range() {
        let config = NavigationMeshConfig::default().with_height_range(-2.0, 8.0);
        assert!(config.is_height_range_valid());
        let config = config.with_height_range(3.0, 3.0);
        assert!(!config.is_height_range_valid());
    }
}
