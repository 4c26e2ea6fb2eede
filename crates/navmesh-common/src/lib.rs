//! Common utilities and data structures shared by the navmesh crates
//!
//! This crate holds the pieces every other crate in the workspace depends on:
//! the error type, bounding boxes, a handful of math helpers and the little-endian
//! byte stream traits used by the persisted navigation data format.

mod bounding_box;
mod math;
mod stream;

pub use bounding_box::*;
pub use math::*;
pub use stream::*;

/// Represents a 3D position
pub type Vec3 = glam::Vec3;

/// Error types for the library
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input mesh: {0}")]
    InvalidMesh(String),

    #[error("navigation mesh generation failed: {0}")]
    NavMeshGeneration(String),

    #[error("recast error: {0}")]
    Recast(String),

    #[error("detour error: {0}")]
    Detour(String),

    #[error("tile cache error: {0}")]
    TileCache(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for navmesh operations
pub type Result<T> = std::result::Result<T, Error>;
