//! Binary layout of a single navigation mesh tile
//!
//! A tile is written as a fixed header followed by its vertices, polygons and
//! off-mesh connections, all little-endian. Links are not stored; they are rebuilt
//! when the tile is added to a mesh.
//!
//! ```text
//! u32 magic, u32 version
//! i32 x, y, layer, u32 user_id
//! i32 poly_count, vert_count, off_mesh_base, off_mesh_connection_count
//! f32 walkable_height, walkable_radius, walkable_climb
//! f32 bmin[3], bmax[3]
//! f32 verts[vert_count * 3]
//! { u16 verts[6], u16 neighbors[6], u16 flags, u8 vert_count, u8 area, u8 type } per polygon
//! { f32 pos[6], f32 radius, u16 poly, u16 flags, u8 area, u8 bidirectional, u32 user_id } per connection
//! ```

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use navmesh_common::{Error, Result};

use super::nav_mesh::{MeshTile, OffMeshConnection, Poly, TileHeader};
use super::{PolyFlags, PolyType, Status, EXT_LINK, MAX_VERTS_PER_POLY};

/// Magic number of a serialized tile ('DNAV')
pub const NAVMESH_MAGIC: u32 = 0x444E_4156;

/// Current tile format version
pub const NAVMESH_VERSION: u32 = 1;

const HEADER_SIZE: usize = 8 + 16 + 16 + 12 + 24;
const POLY_SIZE: usize = MAX_VERTS_PER_POLY * 4 + 2 + 3;
const CONNECTION_SIZE: usize = 28 + 2 + 2 + 2 + 4;

fn corrupted() -> Error {
    Error::Detour(Status::DataCorrupted.to_string())
}

/// Writes `tile` in the tile layout. Fails for a free slot without header.
pub fn write_tile<W: Write>(writer: &mut W, tile: &MeshTile) -> Result<()> {
    let header = tile
        .header
        .as_ref()
        .ok_or_else(|| Error::Detour(Status::InvalidParam.to_string()))?;

    writer.write_u32::<LittleEndian>(NAVMESH_MAGIC)?;
    writer.write_u32::<LittleEndian>(NAVMESH_VERSION)?;
    writer.write_i32::<LittleEndian>(header.x)?;
    writer.write_i32::<LittleEndian>(header.y)?;
    writer.write_i32::<LittleEndian>(header.layer)?;
    writer.write_u32::<LittleEndian>(header.user_id)?;
    writer.write_i32::<LittleEndian>(tile.polys.len() as i32)?;
    writer.write_i32::<LittleEndian>((tile.verts.len() / 3) as i32)?;
    writer.write_i32::<LittleEndian>(header.off_mesh_base)?;
    writer.write_i32::<LittleEndian>(tile.off_mesh_connections.len() as i32)?;
    writer.write_f32::<LittleEndian>(header.walkable_height)?;
    writer.write_f32::<LittleEndian>(header.walkable_radius)?;
    writer.write_f32::<LittleEndian>(header.walkable_climb)?;
    for v in header.bmin.iter().chain(&header.bmax) {
        writer.write_f32::<LittleEndian>(*v)?;
    }

    for v in &tile.verts[..tile.verts.len() / 3 * 3] {
        writer.write_f32::<LittleEndian>(*v)?;
    }

    for poly in &tile.polys {
        for v in poly.verts {
            writer.write_u16::<LittleEndian>(v)?;
        }
        for n in poly.neighbors {
            writer.write_u16::<LittleEndian>(n)?;
        }
        writer.write_u16::<LittleEndian>(poly.flags.bits())?;
        writer.write_u8(poly.vert_count)?;
        writer.write_u8(poly.area)?;
        writer.write_u8(match poly.poly_type {
            PolyType::Ground => 0,
            PolyType::OffMeshConnection => 1,
        })?;
    }

    for con in &tile.off_mesh_connections {
        for v in con.pos {
            writer.write_f32::<LittleEndian>(v)?;
        }
        writer.write_f32::<LittleEndian>(con.radius)?;
        writer.write_u16::<LittleEndian>(con.poly)?;
        writer.write_u16::<LittleEndian>(con.flags.bits())?;
        writer.write_u8(con.area)?;
        writer.write_u8(con.bidirectional as u8)?;
        writer.write_u32::<LittleEndian>(con.user_id)?;
    }
    Ok(())
}

/// Serializes `tile` into a new buffer
pub fn save_tile_to_binary(tile: &MeshTile) -> Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(
        HEADER_SIZE
            + tile.verts.len() * 4
            + tile.polys.len() * POLY_SIZE
            + tile.off_mesh_connections.len() * CONNECTION_SIZE,
    );
    write_tile(&mut buffer, tile)?;
    Ok(buffer)
}

/// Reads a tile written by [`save_tile_to_binary`].
///
/// The whole buffer must be one tile. Counts, vertex indices, neighbours and
/// connection polygons are checked, so a tile that loads can be added to a mesh
/// without indexing out of bounds.
pub fn load_tile_from_binary(data: &[u8]) -> Result<MeshTile> {
    if data.len() < HEADER_SIZE {
        return Err(corrupted());
    }
    let mut cursor = Cursor::new(data);

    if cursor.read_u32::<LittleEndian>()? != NAVMESH_MAGIC {
        return Err(Error::Detour(Status::WrongMagic.to_string()));
    }
    if cursor.read_u32::<LittleEndian>()? != NAVMESH_VERSION {
        return Err(Error::Detour(Status::WrongVersion.to_string()));
    }

    let mut header = TileHeader::new(
        cursor.read_i32::<LittleEndian>()?,
        cursor.read_i32::<LittleEndian>()?,
        cursor.read_i32::<LittleEndian>()?,
    );
    header.user_id = cursor.read_u32::<LittleEndian>()?;
    header.poly_count = cursor.read_i32::<LittleEndian>()?;
    header.vert_count = cursor.read_i32::<LittleEndian>()?;
    header.off_mesh_base = cursor.read_i32::<LittleEndian>()?;
    header.off_mesh_connection_count = cursor.read_i32::<LittleEndian>()?;
    header.walkable_height = cursor.read_f32::<LittleEndian>()?;
    header.walkable_radius = cursor.read_f32::<LittleEndian>()?;
    header.walkable_climb = cursor.read_f32::<LittleEndian>()?;
    for v in header.bmin.iter_mut().chain(header.bmax.iter_mut()) {
        *v = cursor.read_f32::<LittleEndian>()?;
    }

    let counts = [
        header.poly_count,
        header.vert_count,
        header.off_mesh_base,
        header.off_mesh_connection_count,
    ];
    if counts.iter().any(|&c| c < 0) || header.off_mesh_base > header.poly_count {
        return Err(corrupted());
    }
    let poly_count = header.poly_count as usize;
    let vert_count = header.vert_count as usize;
    let con_count = header.off_mesh_connection_count as usize;
    let expected =
        HEADER_SIZE + vert_count * 12 + poly_count * POLY_SIZE + con_count * CONNECTION_SIZE;
    if data.len() != expected {
        return Err(corrupted());
    }

    let mut tile = MeshTile::new();
    tile.verts = (0..vert_count * 3)
        .map(|_| cursor.read_f32::<LittleEndian>())
        .collect::<std::io::Result<_>>()?;

    for _ in 0..poly_count {
        let poly = read_poly(&mut cursor)?;
        let n = poly.vert_count as usize;
        let min_verts = match poly.poly_type {
            PolyType::Ground => 3,
            PolyType::OffMeshConnection => 2,
        };
        if n < min_verts || n > MAX_VERTS_PER_POLY {
            return Err(corrupted());
        }
        if poly.verts[..n].iter().any(|&v| v as usize >= vert_count) {
            return Err(corrupted());
        }
        let bad_neighbor = poly.neighbors[..n]
            .iter()
            .any(|&nei| nei != 0 && nei & EXT_LINK == 0 && nei as usize > poly_count);
        if bad_neighbor {
            return Err(corrupted());
        }
        tile.polys.push(poly);
    }

    for _ in 0..con_count {
        let con = read_connection(&mut cursor)?;
        let is_connection_poly = tile
            .polys
            .get(con.poly as usize)
            .is_some_and(|p| p.poly_type == PolyType::OffMeshConnection);
        if !is_connection_poly {
            return Err(corrupted());
        }
        tile.off_mesh_connections.push(con);
    }

    tile.header = Some(header);
    Ok(tile)
}

fn read_poly<R: Read>(reader: &mut R) -> Result<Poly> {
    let mut verts = [0u16; MAX_VERTS_PER_POLY];
    for v in &mut verts {
        *v = reader.read_u16::<LittleEndian>()?;
    }
    let mut neighbors = [0u16; MAX_VERTS_PER_POLY];
    for n in &mut neighbors {
        *n = reader.read_u16::<LittleEndian>()?;
    }
    let flags = PolyFlags::from_bits_retain(reader.read_u16::<LittleEndian>()?);
    let vert_count = reader.read_u8()?;
    let area = reader.read_u8()?;
    let poly_type = match reader.read_u8()? {
        0 => PolyType::Ground,
        1 => PolyType::OffMeshConnection,
        _ => return Err(corrupted()),
    };

    let mut poly = Poly::new(area, poly_type, flags);
    poly.verts = verts;
    poly.neighbors = neighbors;
    poly.vert_count = vert_count;
    Ok(poly)
}

fn read_connection<R: Read>(reader: &mut R) -> Result<OffMeshConnection> {
    let mut pos = [0.0f32; 6];
    for v in &mut pos {
        *v = reader.read_f32::<LittleEndian>()?;
    }
    let radius = reader.read_f32::<LittleEndian>()?;
    let poly = reader.read_u16::<LittleEndian>()?;
    let flags = PolyFlags::from_bits_retain(reader.read_u16::<LittleEndian>()?);
    let area = reader.read_u8()?;
    let bidirectional = reader.read_u8()? != 0;
    let user_id = reader.read_u32::<LittleEndian>()?;

    let mut con = OffMeshConnection::new_with_params(
        [pos[0], pos[1], pos[2]],
        [pos[3], pos[4], pos[5]],
        radius,
        flags,
        area,
        bidirectional,
        user_id,
    );
    con.poly = poly;
    Ok(con)
}
