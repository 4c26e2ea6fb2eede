//! Compression of tile cache layers

use navmesh_common::{Error, Result};

/// Compresses and decompresses layer payloads.
///
/// Output buffers are sized by the caller: `compress` writes into a buffer of at
/// least [`TileCacheCompressor::max_compressed_size`] bytes and `decompress` into a
/// buffer whose length is the largest accepted decompressed size.
pub trait TileCacheCompressor: Send {
    /// Upper bound of the compressed size of `buffer_size` input bytes
    fn max_compressed_size(&self, buffer_size: usize) -> usize;

    /// Compresses `buffer` into `out` and returns the number of bytes written
    fn compress(&self, buffer: &[u8], out: &mut [u8]) -> Result<usize>;

    /// Decompresses `compressed` into `out` and returns the number of bytes written
    fn decompress(&self, compressed: &[u8], out: &mut [u8]) -> Result<usize>;
}

/// Raw LZ4 block compressor
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Compressor;

impl Lz4Compressor {
    pub fn new() -> Self {
        Self
    }
}

impl TileCacheCompressor for Lz4Compressor {
    fn max_compressed_size(&self, buffer_size: usize) -> usize {
        (buffer_size as f64 * 1.05).ceil() as usize
    }

    fn compress(&self, buffer: &[u8], out: &mut [u8]) -> Result<usize> {
        let bound = self.max_compressed_size(buffer.len()).min(out.len());
        // lz4_flex refuses to write unless the output can hold its own worst case
        let mut scratch = vec![0u8; lz4_flex::block::get_maximum_output_size(buffer.len())];
        let size = lz4_flex::block::compress_into(buffer, &mut scratch)
            .map_err(|e| Error::Compression(e.to_string()))?;
        if size > bound {
            return Err(Error::Compression(format!(
                "compressed size {} exceeds bound {}",
                size, bound
            )));
        }
        out[..size].copy_from_slice(&scratch[..size]);
        Ok(size)
    }

    fn decompress(&self, compressed: &[u8], out: &mut [u8]) -> Result<usize> {
        lz4_flex::block::decompress_into(compressed, out)
            .map_err(|e| Error::Compression(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer_like_payload() -> Vec<u8> {
        // Mostly flat heights with a few distinct areas, like a real layer
        let mut data = vec![0u8; 3 * 64 * 64];
        for (i, v) in data.iter_mut().enumerate().take(64 * 64) {
            *v = (i / 512) as u8;
        }
        for v in data.iter_mut().skip(64 * 64).take(64 * 64) {
            *v = 63;
        }
        data
    }

    #[test]
    fn test_max_compressed_size() {
        let c = Lz4Compressor::new();
        assert_eq!(c.max_compressed_size(100), 105);
        assert_eq!(c.max_compressed_size(1), 2);
        assert_eq!(c.max_compressed_size(0), 0);
    }

    #[test]
    fn test_compress_decompress() {
        let c = Lz4Compressor::new();
        let data = layer_like_payload();
        let mut compressed = vec![0u8; c.max_compressed_size(data.len())];
        let size = c.compress(&data, &mut compressed).unwrap();
        assert!(size < data.len());

        let mut out = vec![0u8; data.len()];
        let n = c.decompress(&compressed[..size], &mut out).unwrap();
        assert_eq!(n, data.len());
        assert_eq!(out, data);
    }

    #[test]
    fn test_decompress_exceeding_buffer_fails() {
        let c = Lz4Compressor::new();
        let data = layer_like_payload();
        let mut compressed = vec![0u8; c.max_compressed_size(data.len())];
        let size = c.compress(&data, &mut compressed).unwrap();

        let mut out = vec![0u8; data.len() / 2];
        assert!(c.decompress(&compressed[..size], &mut out).is_err());
    }

    #[test]
    fn test_decompress_garbage_fails() {
        let c = Lz4Compressor::new();
        let mut out = vec![0u8; 1024];
        assert!(c.decompress(&[0xff, 0xff, 0xff, 0xff, 0x01], &mut out).is_err());
    }
}
