//! Tile cache data structures and serialization
//!
//! A compressed tile is a [`TileCacheLayerHeader`] followed by the compressed layer
//! payload. The payload holds three `width * height` grids back to back: heights,
//! areas and connections.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use navmesh_common::{Error, Result};
use navmesh_detour::Status;

use super::allocator::LinearAllocator;
use super::compressor::TileCacheCompressor;

/// Magic number for tile cache data
pub const TILECACHE_MAGIC: u32 = 0x4C494554; // 'TILE' in ASCII

/// Version number for tile cache data format
pub const TILECACHE_VERSION: u32 = 1;

/// Flag passed to [`TileCache::add_tile`](crate::TileCache::add_tile) when the cache
/// owns the tile buffer
pub const COMPRESSED_TILE_FREE_DATA: u32 = 0x01;

/// Tile cache layer header
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct TileCacheLayerHeader {
    /// Magic number for validation
    pub magic: u32,
    /// Version of the tile cache format
    pub version: u32,
    /// Tile position X
    pub tx: i32,
    /// Tile position Y
    pub ty: i32,
    /// Tile layer
    pub tlayer: i32,
    /// Bounding box minimum
    pub bmin: [f32; 3],
    /// Bounding box maximum
    pub bmax: [f32; 3],
    /// Height range of the layer (in cells)
    pub hmin: u16,
    pub hmax: u16,
    /// Dimensions of the layer grid (in cells)
    pub width: u8,
    pub height: u8,
    /// Used area of the layer grid
    pub minx: u8,
    pub maxx: u8,
    pub miny: u8,
    pub maxy: u8,
}

impl Default for TileCacheLayerHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl TileCacheLayerHeader {
    /// Size of the binary representation
    pub const SERIALIZED_SIZE: usize = 54;

    /// Creates a new tile cache layer header
    pub fn new() -> Self {
        Self {
            magic: TILECACHE_MAGIC,
            version: TILECACHE_VERSION,
            tx: 0,
            ty: 0,
            tlayer: 0,
            bmin: [0.0; 3],
            bmax: [0.0; 3],
            hmin: 0,
            hmax: 0,
            width: 0,
            height: 0,
            minx: 0,
            maxx: 0,
            miny: 0,
            maxy: 0,
        }
    }

    /// Validates the header
    pub fn validate(&self) -> Result<()> {
        if self.magic != TILECACHE_MAGIC {
            return Err(Error::Detour(Status::WrongMagic.to_string()));
        }
        if self.version != TILECACHE_VERSION {
            return Err(Error::Detour(Status::WrongVersion.to_string()));
        }
        if self.width == 0 || self.height == 0 {
            return Err(Error::Detour(Status::DataCorrupted.to_string()));
        }
        Ok(())
    }

    /// Number of cells in the layer grid
    pub fn grid_size(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Writes the header field by field, little-endian
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(self.magic)?;
        writer.write_u32::<LittleEndian>(self.version)?;
        writer.write_i32::<LittleEndian>(self.tx)?;
        writer.write_i32::<LittleEndian>(self.ty)?;
        writer.write_i32::<LittleEndian>(self.tlayer)?;
        for v in self.bmin.iter().chain(self.bmax.iter()) {
            writer.write_f32::<LittleEndian>(*v)?;
        }
        writer.write_u16::<LittleEndian>(self.hmin)?;
        writer.write_u16::<LittleEndian>(self.hmax)?;
        writer.write_all(&[
            self.width,
            self.height,
            self.minx,
            self.maxx,
            self.miny,
            self.maxy,
        ])?;
        Ok(())
    }

    /// Reads a header written by [`TileCacheLayerHeader::write_to`] without validating it
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;
        let version = reader.read_u32::<LittleEndian>()?;
        let tx = reader.read_i32::<LittleEndian>()?;
        let ty = reader.read_i32::<LittleEndian>()?;
        let tlayer = reader.read_i32::<LittleEndian>()?;
        let mut bmin = [0.0f32; 3];
        for v in &mut bmin {
            *v = reader.read_f32::<LittleEndian>()?;
        }
        let mut bmax = [0.0f32; 3];
        for v in &mut bmax {
            *v = reader.read_f32::<LittleEndian>()?;
        }
        let hmin = reader.read_u16::<LittleEndian>()?;
        let hmax = reader.read_u16::<LittleEndian>()?;
        let mut dims = [0u8; 6];
        reader.read_exact(&mut dims)?;

        Ok(Self {
            magic,
            version,
            tx,
            ty,
            tlayer,
            bmin,
            bmax,
            hmin,
            hmax,
            width: dims[0],
            height: dims[1],
            minx: dims[2],
            maxx: dims[3],
            miny: dims[4],
            maxy: dims[5],
        })
    }

    /// Serializes the header to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::SERIALIZED_SIZE);
        // Writing into a Vec cannot fail
        let _ = self.write_to(&mut bytes);
        bytes
    }

    /// Parses and validates the header at the start of `data`
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SERIALIZED_SIZE {
            return Err(Error::Detour(Status::DataCorrupted.to_string()));
        }
        let header = Self::read_from(&mut Cursor::new(data))?;
        header.validate()?;
        Ok(header)
    }
}

/// Fixed parameters of a tile cache
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct TileCacheParams {
    /// World-space origin of the tile grid
    pub orig: [f32; 3],
    /// Cell size
    pub cs: f32,
    /// Cell height
    pub ch: f32,
    /// Tile width in cells
    pub width: i32,
    /// Tile depth in cells
    pub height: i32,
    /// Agent height in world units
    pub walkable_height: f32,
    /// Agent radius in world units
    pub walkable_radius: f32,
    /// Agent max climb in world units
    pub walkable_climb: f32,
    /// Maximum contour simplification error
    pub max_simplification_error: f32,
    /// Maximum number of compressed tiles
    pub max_tiles: i32,
    /// Maximum number of obstacles
    pub max_obstacles: i32,
}

impl Default for TileCacheParams {
    fn default() -> Self {
        Self {
            orig: [0.0; 3],
            cs: 0.3,
            ch: 0.2,
            width: 128,
            height: 128,
            walkable_height: 2.0,
            walkable_radius: 0.6,
            walkable_climb: 0.9,
            max_simplification_error: 1.3,
            max_tiles: 256,
            max_obstacles: 1024,
        }
    }
}

impl TileCacheParams {
    /// Size of the binary representation
    pub const SERIALIZED_SIZE: usize = 52;

    /// Validates the parameters
    pub fn validate(&self) -> Result<()> {
        if self.cs <= 0.0 || self.ch <= 0.0 {
            return Err(Error::TileCache(
                "cell size and cell height must be positive".to_string(),
            ));
        }
        if self.width <= 0 || self.height <= 0 || self.width > 255 || self.height > 255 {
            return Err(Error::TileCache(format!(
                "tile dimensions {}x{} out of range 1..=255",
                self.width, self.height
            )));
        }
        if self.max_tiles <= 0 || self.max_obstacles <= 0 {
            return Err(Error::TileCache(
                "max tiles and max obstacles must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Writes the parameters field by field, little-endian
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        for v in self.orig {
            writer.write_f32::<LittleEndian>(v)?;
        }
        writer.write_f32::<LittleEndian>(self.cs)?;
        writer.write_f32::<LittleEndian>(self.ch)?;
        writer.write_i32::<LittleEndian>(self.width)?;
        writer.write_i32::<LittleEndian>(self.height)?;
        writer.write_f32::<LittleEndian>(self.walkable_height)?;
        writer.write_f32::<LittleEndian>(self.walkable_radius)?;
        writer.write_f32::<LittleEndian>(self.walkable_climb)?;
        writer.write_f32::<LittleEndian>(self.max_simplification_error)?;
        writer.write_i32::<LittleEndian>(self.max_tiles)?;
        writer.write_i32::<LittleEndian>(self.max_obstacles)?;
        Ok(())
    }

    /// Reads parameters written by [`TileCacheParams::write_to`]
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut orig = [0.0; 3];
        for v in &mut orig {
            *v = reader.read_f32::<LittleEndian>()?;
        }
        Ok(Self {
            orig,
            cs: reader.read_f32::<LittleEndian>()?,
            ch: reader.read_f32::<LittleEndian>()?,
            width: reader.read_i32::<LittleEndian>()?,
            height: reader.read_i32::<LittleEndian>()?,
            walkable_height: reader.read_f32::<LittleEndian>()?,
            walkable_radius: reader.read_f32::<LittleEndian>()?,
            walkable_climb: reader.read_f32::<LittleEndian>()?,
            max_simplification_error: reader.read_f32::<LittleEndian>()?,
            max_tiles: reader.read_i32::<LittleEndian>()?,
            max_obstacles: reader.read_i32::<LittleEndian>()?,
        })
    }
}

/// Decompressed tile cache layer
#[derive(Debug, Clone)]
pub struct TileCacheLayer {
    /// Header information
    pub header: TileCacheLayerHeader,
    /// Per-cell floor height relative to `header.hmin`, 0xff for empty cells
    pub heights: Vec<u8>,
    /// Per-cell area id
    pub areas: Vec<u8>,
    /// Per-cell connections, low nibble inside the layer, high nibble portals
    pub cons: Vec<u8>,
}

impl TileCacheLayer {
    /// Index of cell `(x, z)` in the layer grids
    #[inline]
    pub fn index(&self, x: i32, z: i32) -> usize {
        (x + z * self.header.width as i32) as usize
    }
}

/// Compresses one layer into tile data: the header followed by the compressed grids.
///
/// The uncompressed grids are staged in `allocator` memory.
pub fn build_tile_cache_layer(
    compressor: &dyn TileCacheCompressor,
    allocator: &mut LinearAllocator,
    header: &TileCacheLayerHeader,
    heights: &[u8],
    areas: &[u8],
    cons: &[u8],
) -> Result<Vec<u8>> {
    header.validate()?;
    let grid_size = header.grid_size();
    if heights.len() != grid_size || areas.len() != grid_size || cons.len() != grid_size {
        return Err(Error::Detour(Status::InvalidParam.to_string()));
    }

    let staging = allocator.alloc(grid_size * 3);
    {
        let buffer = allocator.slice_mut(&staging)?;
        buffer[..grid_size].copy_from_slice(heights);
        buffer[grid_size..grid_size * 2].copy_from_slice(areas);
        buffer[grid_size * 2..].copy_from_slice(cons);
    }

    let header_size = TileCacheLayerHeader::SERIALIZED_SIZE;
    let max_size = compressor.max_compressed_size(grid_size * 3);
    let mut data = vec![0u8; header_size + max_size];
    header.write_to(&mut &mut data[..header_size])?;

    let compressed_size =
        compressor.compress(allocator.slice(&staging)?, &mut data[header_size..])?;
    allocator.free(staging);

    data.truncate(header_size + compressed_size);
    Ok(data)
}

/// Decompresses tile data produced by [`build_tile_cache_layer`].
///
/// Fails when the header is invalid or when the payload does not decompress to
/// exactly the size the header announces.
pub fn decompress_tile_cache_layer(
    compressor: &dyn TileCacheCompressor,
    allocator: &mut LinearAllocator,
    data: &[u8],
) -> Result<TileCacheLayer> {
    let header = TileCacheLayerHeader::from_bytes(data)?;
    let grid_size = header.grid_size();
    let compressed = &data[TileCacheLayerHeader::SERIALIZED_SIZE..];
    if compressed.is_empty() {
        return Err(Error::Detour(Status::DataCorrupted.to_string()));
    }

    let staging = allocator.alloc(grid_size * 3);
    let buffer = allocator.slice_mut(&staging)?;
    let size = compressor.decompress(compressed, buffer)?;
    if size != grid_size * 3 {
        return Err(Error::Detour(Status::DataCorrupted.to_string()));
    }

    let layer = TileCacheLayer {
        header,
        heights: buffer[..grid_size].to_vec(),
        areas: buffer[grid_size..grid_size * 2].to_vec(),
        cons: buffer[grid_size * 2..].to_vec(),
    };
    allocator.free(staging);
    Ok(layer)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::compressor::Lz4Compressor;

    /// A flat fully walkable 16x16 layer at tile `(tx, ty)` with 1-unit cells
    pub(crate) fn flat_layer(tx: i32, ty: i32) -> (TileCacheLayerHeader, Vec<u8>, Vec<u8>, Vec<u8>) {
        let size = 16;
        let header = TileCacheLayerHeader {
            tx,
            ty,
            bmin: [tx as f32 * 16.0, 0.0, ty as f32 * 16.0],
            bmax: [tx as f32 * 16.0 + 16.0, 1.0, ty as f32 * 16.0 + 16.0],
            width: size as u8,
            height: size as u8,
            maxx: size as u8 - 1,
            maxy: size as u8 - 1,
            ..Default::default()
        };

        let mut cons = vec![0u8; size * size];
        for z in 0..size {
            for x in 0..size {
                let mut con = 0;
                if x > 0 {
                    con |= 1;
                }
                if z < size - 1 {
                    con |= 2;
                }
                if x < size - 1 {
                    con |= 4;
                }
                if z > 0 {
                    con |= 8;
                }
                cons[x + z * size] = con;
            }
        }
        (header, vec![0; size * size], vec![63; size * size], cons)
    }

    #[test]
    fn test_header_binary_layout() {
        let (header, ..) = flat_layer(3, -2);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), TileCacheLayerHeader::SERIALIZED_SIZE);
        assert_eq!(&bytes[0..4], &TILECACHE_MAGIC.to_le_bytes());
        assert_eq!(&bytes[8..12], &3i32.to_le_bytes());
        assert_eq!(&bytes[12..16], &(-2i32).to_le_bytes());
        assert_eq!(bytes[48], 16);

        let parsed = TileCacheLayerHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_header_rejects_bad_magic_and_version() {
        let (mut header, ..) = flat_layer(0, 0);
        header.magic = 0x12345678;
        let err = TileCacheLayerHeader::from_bytes(&header.to_bytes()).unwrap_err();
        assert!(err.to_string().contains("Wrong magic"));

        let (mut header, ..) = flat_layer(0, 0);
        header.version = 2;
        let err = TileCacheLayerHeader::from_bytes(&header.to_bytes()).unwrap_err();
        assert!(err.to_string().contains("Wrong version"));

        assert!(TileCacheLayerHeader::from_bytes(&[0u8; 20]).is_err());
    }

    #[test]
    fn test_params_binary_layout() {
        let params = TileCacheParams {
            orig: [1.0, 2.0, 3.0],
            max_tiles: 4096,
            ..Default::default()
        };
        let mut buffer = Vec::new();
        params.write_to(&mut buffer).unwrap();
        assert_eq!(buffer.len(), TileCacheParams::SERIALIZED_SIZE);
        assert_eq!(&buffer[20..24], &128i32.to_le_bytes());
        let read = TileCacheParams::read_from(&mut Cursor::new(&buffer)).unwrap();
        assert_eq!(read, params);
    }

    #[test]
    fn test_params_validation() {
        assert!(TileCacheParams::default().validate().is_ok());
        let params = TileCacheParams {
            width: 300,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_compress_decompress_layer() {
        let compressor = Lz4Compressor::new();
        let mut allocator = LinearAllocator::default();
        let (header, heights, areas, cons) = flat_layer(1, 2);

        let data =
            build_tile_cache_layer(&compressor, &mut allocator, &header, &heights, &areas, &cons)
                .unwrap();
        assert!(data.len() > TileCacheLayerHeader::SERIALIZED_SIZE);

        let layer = decompress_tile_cache_layer(&compressor, &mut allocator, &data).unwrap();
        assert_eq!(layer.header, header);
        assert_eq!(layer.heights, heights);
        assert_eq!(layer.areas, areas);
        assert_eq!(layer.cons, cons);
        assert_eq!(layer.index(2, 1), 18);
    }

    #[test]
    fn test_corrupted_payload_is_rejected() {
        let compressor = Lz4Compressor::new();
        let mut allocator = LinearAllocator::default();
        let (header, heights, areas, cons) = flat_layer(0, 0);
        let data =
            build_tile_cache_layer(&compressor, &mut allocator, &header, &heights, &areas, &cons)
                .unwrap();

        let truncated = &data[..data.len() - 4];
        assert!(decompress_tile_cache_layer(&compressor, &mut allocator, truncated).is_err());

        let header_only = &data[..TileCacheLayerHeader::SERIALIZED_SIZE];
        assert!(decompress_tile_cache_layer(&compressor, &mut allocator, header_only).is_err());
    }

    #[test]
    fn test_mismatched_grid_is_rejected() {
        let compressor = Lz4Compressor::new();
        let mut allocator = LinearAllocator::default();
        let (header, heights, areas, _) = flat_layer(0, 0);
        assert!(build_tile_cache_layer(
            &compressor,
            &mut allocator,
            &header,
            &heights,
            &areas,
            &[0u8; 3]
        )
        .is_err());
    }
}
