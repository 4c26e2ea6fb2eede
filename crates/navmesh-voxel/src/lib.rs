//! Voxel stage of the tile build
//!
//! Takes input triangle meshes of one tile and turns them into heightfield layers,
//! the 2.5D grids a tile cache stores and meshes.
//!
//! The pipeline is the classic one: rasterize into a heightfield, filter spans the
//! agent cannot use, compact the open space, erode it by the agent radius, split it
//! into regions and finally group the regions into non-overlapping layers.

mod compact_heightfield;
mod config;
mod filter;
mod heightfield;
mod heightfield_layers;
mod rasterization;
mod regions;

pub use compact_heightfield::{CompactCell, CompactHeightfield, CompactSpan, NOT_CONNECTED};
pub use config::{AreaBox, LayerBuildConfig, PartitionType};
pub use filter::{
    filter_ledge_spans, filter_low_hanging_walkable_obstacles, filter_walkable_low_height_spans,
    mark_walkable_triangles,
};
pub use heightfield::{Heightfield, Span, NULL_AREA, SPAN_MAX_HEIGHT, WALKABLE_AREA};
pub use heightfield_layers::{
    build_heightfield_layers, HeightfieldLayer, HeightfieldLayerSet, LAYER_EMPTY_HEIGHT,
    MAX_HEIGHTFIELD_LAYERS,
};
pub use rasterization::{rasterize_triangle, rasterize_triangles};
pub use regions::BORDER_REG;

use glam::Vec3;
use navmesh_common::Result;

const DIR_OFFSET_X: [i32; 4] = [-1, 0, 1, 0];
const DIR_OFFSET_Z: [i32; 4] = [0, 1, 0, -1];

/// X offset of the neighbour cell in direction `dir` (0: -x, 1: +z, 2: +x, 3: -z)
#[inline]
pub fn dir_offset_x(dir: usize) -> i32 {
    DIR_OFFSET_X[dir & 0x3]
}

/// Z offset of the neighbour cell in direction `dir`
#[inline]
pub fn dir_offset_z(dir: usize) -> i32 {
    DIR_OFFSET_Z[dir & 0x3]
}

/// Builder running the voxel pipeline of one tile
#[derive(Debug)]
pub struct LayerBuilder {
    config: LayerBuildConfig,
}

impl LayerBuilder {
    /// Creates a new LayerBuilder with the specified configuration
    pub fn new(config: LayerBuildConfig) -> Self {
        Self { config }
    }

    /// Gets a reference to the configuration
    pub fn config(&self) -> &LayerBuildConfig {
        &self.config
    }

    /// Builds the heightfield layers of the tile.
    ///
    /// `verts` and `indices` form the world-space triangle soup overlapping the tile.
    /// Walkability is derived from the slope of each triangle; `area_boxes` then
    /// stamp their area ids onto the eroded walkable surface.
    pub fn build_layers(
        &self,
        verts: &[Vec3],
        indices: &[u32],
        area_boxes: &[AreaBox],
    ) -> Result<HeightfieldLayerSet> {
        let config = &self.config;
        config.validate()?;

        let mut hf = Heightfield::new(
            config.width,
            config.height,
            config.bmin,
            config.bmax,
            config.cs,
            config.ch,
        )?;

        let mut areas = vec![NULL_AREA; indices.len() / 3];
        mark_walkable_triangles(config.walkable_slope_angle, verts, indices, &mut areas);
        rasterize_triangles(verts, indices, &areas, &mut hf, config.walkable_climb)?;

        filter_low_hanging_walkable_obstacles(config.walkable_climb, &mut hf);
        filter_ledge_spans(config.walkable_height, config.walkable_climb, &mut hf);
        filter_walkable_low_height_spans(config.walkable_height, &mut hf);

        let mut chf =
            CompactHeightfield::build(config.walkable_height, config.walkable_climb, &hf)?;
        chf.erode_walkable_area(config.walkable_radius)?;

        for area in area_boxes {
            chf.mark_box_area(area.bmin, area.bmax, area.area_id)?;
        }

        match config.partition_type {
            PartitionType::Watershed => {
                chf.build_distance_field()?;
                chf.build_regions(
                    config.border_size,
                    config.min_region_area,
                    config.merge_region_area,
                )?;
            }
            PartitionType::Monotone => {
                chf.build_regions_monotone(
                    config.border_size,
                    config.min_region_area,
                    config.merge_region_area,
                )?;
            }
        }

        log::trace!(
            "Tile voxelized: {} spans, {} regions",
            chf.span_count(),
            chf.max_regions
        );

        build_heightfield_layers(&chf, config.border_size, config.walkable_height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad(size: f32, y: f32) -> (Vec<Vec3>, Vec<u32>) {
        let verts = vec![
            Vec3::new(0.0, y, 0.0),
            Vec3::new(size, y, 0.0),
            Vec3::new(size, y, size),
            Vec3::new(0.0, y, size),
        ];
        (verts, vec![0, 2, 1, 0, 3, 2])
    }

    fn config(partition_type: PartitionType) -> LayerBuildConfig {
        LayerBuildConfig {
            width: 40,
            height: 40,
            cs: 0.5,
            ch: 0.2,
            bmin: Vec3::new(-5.0, -1.0, -5.0),
            bmax: Vec3::new(15.0, 4.0, 15.0),
            walkable_height: 10,
            walkable_climb: 4,
            walkable_radius: 1,
            border_size: 4,
            partition_type,
            ..Default::default()
        }
    }

    #[test]
    fn test_dir_offsets_are_opposite_pairs() {
        for dir in 0..4 {
            assert_eq!(dir_offset_x(dir), -dir_offset_x((dir + 2) & 3));
            assert_eq!(dir_offset_z(dir), -dir_offset_z((dir + 2) & 3));
        }
    }

    #[test]
    fn test_build_layers_flat_quad() {
        let (verts, indices) = quad(10.0, 0.0);
        for partition in [PartitionType::Monotone, PartitionType::Watershed] {
            let builder = LayerBuilder::new(config(partition));
            let set = builder.build_layers(&verts, &indices, &[]).unwrap();
            assert_eq!(set.len(), 1, "{:?}", partition);
            let layer = &set.layers[0];
            assert_eq!(layer.width, 32);
            assert!(layer.walkable_cell_count() > 200);
        }
    }

    #[test]
    fn test_area_box_stamps_area() {
        let (verts, indices) = quad(10.0, 0.0);
        let builder = LayerBuilder::new(config(PartitionType::Monotone));
        let area = AreaBox {
            bmin: Vec3::new(2.0, -1.0, 2.0),
            bmax: Vec3::new(4.0, 1.0, 4.0),
            area_id: 5,
        };
        let set = builder.build_layers(&verts, &indices, &[area]).unwrap();
        assert!(set.layers.iter().any(|l| l.areas.contains(&5)));
    }

    #[test]
    fn test_empty_geometry_produces_no_layers() {
        let builder = LayerBuilder::new(config(PartitionType::Monotone));
        let set = builder.build_layers(&[], &[], &[]).unwrap();
        assert!(set.is_empty());
    }
}
