//! Navigation mesh tile builder
//!
//! Turns the polygon arrays produced by the tile cache mesher into a [`MeshTile`]
//! ready to be added to a [`NavMesh`](super::NavMesh).

use super::nav_mesh::{MeshTile, OffMeshConnection, Poly, TileHeader};
use super::{PolyFlags, PolyType, Status, EXT_LINK, MAX_VERTS_PER_POLY, MESH_NULL_IDX};
use navmesh_common::{Error, Result};

/// Input of [`NavMeshBuilder::build_tile`].
///
/// Vertices are stored in voxel units relative to `bmin`. Polygons are fixed-size
/// rows of `MAX_VERTS_PER_POLY` vertex indices padded with [`MESH_NULL_IDX`].
/// Neighbour rows use the polygon mesh convention: [`MESH_NULL_IDX`] for a solid
/// edge, `0x8000 | dir` for an edge on the tile border and the neighbour polygon
/// index otherwise.
#[derive(Debug, Clone, Default)]
pub struct NavMeshCreateParams {
    /// Polygon vertices in voxel coordinates
    pub verts: Vec<[u16; 3]>,
    /// Vertex indices per polygon
    pub polys: Vec<[u16; MAX_VERTS_PER_POLY]>,
    /// Neighbour information per polygon edge
    pub poly_neighbors: Vec<[u16; MAX_VERTS_PER_POLY]>,
    /// Flags per polygon
    pub poly_flags: Vec<PolyFlags>,
    /// Area id per polygon
    pub poly_areas: Vec<u8>,

    /// Off-mesh connection end points `[sx, sy, sz, ex, ey, ez]` in world space
    pub off_mesh_con_verts: Vec<[f32; 6]>,
    /// Off-mesh connection radii
    pub off_mesh_con_rad: Vec<f32>,
    /// Off-mesh connection flags
    pub off_mesh_con_flags: Vec<PolyFlags>,
    /// Off-mesh connection area ids
    pub off_mesh_con_areas: Vec<u8>,
    /// Off-mesh connection direction, 1 = bidirectional
    pub off_mesh_con_dir: Vec<u8>,
    /// Off-mesh connection user ids
    pub off_mesh_con_user_id: Vec<u32>,

    /// User defined tile id
    pub user_id: u32,
    /// Tile location
    pub tile_x: i32,
    pub tile_y: i32,
    pub tile_layer: i32,

    /// Tile bounds in world space
    pub bmin: [f32; 3],
    pub bmax: [f32; 3],

    /// Agent dimensions in world units
    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,

    /// Cell size
    pub cs: f32,
    /// Cell height
    pub ch: f32,
}

impl NavMeshCreateParams {
    /// Number of off-mesh connections
    pub fn off_mesh_con_count(&self) -> usize {
        self.off_mesh_con_verts.len()
    }

    /// Whether the parameters describe no polygons at all
    pub fn is_empty(&self) -> bool {
        self.polys.is_empty() && self.off_mesh_con_verts.is_empty()
    }
}

/// Builder for creating navigation mesh tiles from polygon data
pub struct NavMeshBuilder;

impl NavMeshBuilder {
    /// Creates a navigation mesh tile from [`NavMeshCreateParams`]
    pub fn build_tile(params: &NavMeshCreateParams) -> Result<MeshTile> {
        Self::validate_params(params)?;

        let mut tile = MeshTile::new();

        // Ground vertices
        tile.verts.reserve((params.verts.len() + params.off_mesh_con_count() * 2) * 3);
        for v in &params.verts {
            tile.verts.push(params.bmin[0] + v[0] as f32 * params.cs);
            tile.verts.push(params.bmin[1] + v[1] as f32 * params.ch);
            tile.verts.push(params.bmin[2] + v[2] as f32 * params.cs);
        }

        // Ground polygons
        for (i, row) in params.polys.iter().enumerate() {
            let mut poly = Poly::new(
                params.poly_areas[i],
                PolyType::Ground,
                params.poly_flags[i],
            );
            for (j, &v) in row.iter().enumerate() {
                if v == MESH_NULL_IDX {
                    break;
                }
                poly.verts[j] = v;
                let nei = params.poly_neighbors[i][j];
                poly.neighbors[j] = if nei == MESH_NULL_IDX {
                    0
                } else if nei & 0x8000 != 0 {
                    EXT_LINK | (nei & 0xf)
                } else {
                    nei + 1
                };
                poly.vert_count += 1;
            }
            tile.polys.push(poly);
        }

        // Off-mesh connections are stored in the tile that contains their start point
        let off_mesh_base = tile.polys.len();
        for i in 0..params.off_mesh_con_count() {
            let pos = params.off_mesh_con_verts[i];
            if !Self::contains_xz(params, pos[0], pos[2]) {
                continue;
            }

            let vert_base = (tile.verts.len() / 3) as u16;
            tile.verts.extend_from_slice(&pos);

            let mut poly = Poly::new(
                params.off_mesh_con_areas[i],
                PolyType::OffMeshConnection,
                params.off_mesh_con_flags[i],
            );
            poly.verts[0] = vert_base;
            poly.verts[1] = vert_base + 1;
            poly.vert_count = 2;

            let mut connection = OffMeshConnection::new_with_params(
                [pos[0], pos[1], pos[2]],
                [pos[3], pos[4], pos[5]],
                params.off_mesh_con_rad[i],
                params.off_mesh_con_flags[i],
                params.off_mesh_con_areas[i],
                params.off_mesh_con_dir[i] != 0,
                params.off_mesh_con_user_id[i],
            );
            connection.poly = tile.polys.len() as u16;

            tile.polys.push(poly);
            tile.off_mesh_connections.push(connection);
        }

        if tile.polys.is_empty() {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        let mut header = TileHeader::new(params.tile_x, params.tile_y, params.tile_layer);
        header.user_id = params.user_id;
        header.bmin = params.bmin;
        header.bmax = params.bmax;
        header.poly_count = tile.polys.len() as i32;
        header.vert_count = (tile.verts.len() / 3) as i32;
        header.off_mesh_base = off_mesh_base as i32;
        header.off_mesh_connection_count = tile.off_mesh_connections.len() as i32;
        header.walkable_height = params.walkable_height;
        header.walkable_radius = params.walkable_radius;
        header.walkable_climb = params.walkable_climb;
        tile.header = Some(header);

        Ok(tile)
    }

    fn contains_xz(params: &NavMeshCreateParams, x: f32, z: f32) -> bool {
        x >= params.bmin[0] && x <= params.bmax[0] && z >= params.bmin[2] && z <= params.bmax[2]
    }

    /// Validates input parameters
    fn validate_params(params: &NavMeshCreateParams) -> Result<()> {
        if params.is_empty() {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        if params.cs <= 0.0 || params.ch <= 0.0 {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        let poly_count = params.polys.len();
        if params.poly_neighbors.len() != poly_count
            || params.poly_flags.len() != poly_count
            || params.poly_areas.len() != poly_count
        {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        let con_count = params.off_mesh_con_count();
        if params.off_mesh_con_rad.len() != con_count
            || params.off_mesh_con_flags.len() != con_count
            || params.off_mesh_con_areas.len() != con_count
            || params.off_mesh_con_dir.len() != con_count
            || params.off_mesh_con_user_id.len() != con_count
        {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        if params.verts.len() + con_count * 2 >= MESH_NULL_IDX as usize {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        for (row, neighbors) in params.polys.iter().zip(&params.poly_neighbors) {
            let vert_count = row.iter().take_while(|&&v| v != MESH_NULL_IDX).count();
            if vert_count < 3 {
                return Err(Error::Detour(Status::InvalidParam.to_string()));
            }
            for j in 0..vert_count {
                if row[j] as usize >= params.verts.len() {
                    return Err(Error::Detour(Status::InvalidParam.to_string()));
                }
                let nei = neighbors[j];
                if nei != MESH_NULL_IDX && nei & 0x8000 == 0 && nei as usize >= poly_count {
                    return Err(Error::Detour(Status::InvalidParam.to_string()));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Two unit squares side by side, 4x2 voxels each, in tile (0, 0, 0)
    pub(crate) fn two_quads(tile_x: i32, tile_y: i32) -> NavMeshCreateParams {
        let origin = [tile_x as f32 * 8.0, 0.0, tile_y as f32 * 8.0];
        let n = MESH_NULL_IDX;
        NavMeshCreateParams {
            verts: vec![
                [0, 0, 0],
                [4, 0, 0],
                [8, 0, 0],
                [0, 0, 8],
                [4, 0, 8],
                [8, 0, 8],
            ],
            polys: vec![[0, 3, 4, 1, n, n], [1, 4, 5, 2, n, n]],
            // Edges: v0-v3 on -x border, v3-v4 on +z border, v4-v1 shared, v1-v0 on -z border
            poly_neighbors: vec![
                [0x8000, 0x8001, 1, 0x8003, n, n],
                [0, 0x8001, 0x8002, 0x8003, n, n],
            ],
            poly_flags: vec![PolyFlags::WALK; 2],
            poly_areas: vec![63; 2],
            tile_x,
            tile_y,
            bmin: origin,
            bmax: [origin[0] + 8.0, 1.0, origin[2] + 8.0],
            walkable_height: 2.0,
            walkable_radius: 0.6,
            walkable_climb: 0.9,
            cs: 1.0,
            ch: 0.5,
            ..Default::default()
        }
    }

    #[test]
    fn test_build_tile() {
        let tile = NavMeshBuilder::build_tile(&two_quads(0, 0)).unwrap();
        let header = tile.header.as_ref().unwrap();
        assert_eq!(header.poly_count, 2);
        assert_eq!(header.vert_count, 6);
        assert_eq!(tile.polys[0].vert_count, 4);
        assert_eq!(tile.polys[0].neighbors[2], 2);
        assert_eq!(tile.polys[0].neighbors[0], EXT_LINK);
        assert_eq!(tile.polys[1].neighbors[2], EXT_LINK | 2);
        assert_eq!(&tile.verts[3..6], &[4.0, 0.0, 0.0]);
    }

    #[test]
    fn test_off_mesh_connection_kept_when_start_inside() {
        let mut params = two_quads(0, 0);
        params.off_mesh_con_verts = vec![
            [1.0, 0.0, 1.0, 20.0, 0.0, 1.0],
            [20.0, 0.0, 1.0, 1.0, 0.0, 1.0],
        ];
        params.off_mesh_con_rad = vec![0.5; 2];
        params.off_mesh_con_flags = vec![PolyFlags::JUMP; 2];
        params.off_mesh_con_areas = vec![5; 2];
        params.off_mesh_con_dir = vec![1, 0];
        params.off_mesh_con_user_id = vec![10, 11];

        let tile = NavMeshBuilder::build_tile(&params).unwrap();
        assert_eq!(tile.polys.len(), 3);
        assert_eq!(tile.off_mesh_connections.len(), 1);
        let con = &tile.off_mesh_connections[0];
        assert_eq!(con.user_id, 10);
        assert!(con.bidirectional);
        assert_eq!(tile.polys[2].poly_type, PolyType::OffMeshConnection);
        assert_eq!(tile.polys[2].vert_count, 2);
    }

    #[test]
    fn test_invalid_params() {
        assert!(NavMeshBuilder::build_tile(&NavMeshCreateParams::default()).is_err());

        let mut params = two_quads(0, 0);
        params.poly_areas.pop();
        assert!(NavMeshBuilder::build_tile(&params).is_err());

        let mut params = two_quads(0, 0);
        params.polys[0][1] = 40;
        assert!(NavMeshBuilder::build_tile(&params).is_err());
    }
}
