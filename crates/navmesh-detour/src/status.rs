//! Status codes for navigation mesh and tile cache operations

/// Detailed status of a failed operation.
///
/// Errors carry a status as `Error::Detour(Status::X.to_string())` so callers
/// can report the precise reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Operation was successful
    Success,
    /// Operation failed due to an unknown reason
    Failure,
    /// Provided parameter was invalid
    InvalidParam,
    /// Operation ran out of slots or memory
    OutOfMemory,
    /// Request queue or output buffer is full
    BufferTooSmall,
    /// Value already exists
    AlreadyExists,
    /// Value does not exist or is not found
    NotFound,
    /// Input data is corrupted or invalid
    DataCorrupted,
    /// Tile cache operation failed
    TileCacheError,
    /// Data has wrong magic number
    WrongMagic,
    /// Data has wrong version
    WrongVersion,
}

impl Status {
    /// Checks if the status is a failure
    pub fn is_failure(&self) -> bool {
        *self != Status::Success
    }

    /// Checks if the status is a success
    pub fn is_success(&self) -> bool {
        *self == Status::Success
    }
}

impl std::error::Error for Status {}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Success => write!(f, "Success"),
            Status::Failure => write!(f, "Failure"),
            Status::InvalidParam => write!(f, "Invalid parameter"),
            Status::OutOfMemory => write!(f, "Out of memory"),
            Status::BufferTooSmall => write!(f, "Buffer too small"),
            Status::AlreadyExists => write!(f, "Value already exists"),
            Status::NotFound => write!(f, "Value not found"),
            Status::DataCorrupted => write!(f, "Data corrupted"),
            Status::TileCacheError => write!(f, "Tile cache error"),
            Status::WrongMagic => write!(f, "Wrong magic number"),
            Status::WrongVersion => write!(f, "Wrong version"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_predicates() {
        assert!(Status::Success.is_success());
        assert!(Status::NotFound.is_failure());
        assert_eq!(Status::AlreadyExists.to_string(), "Value already exists");
    }
}
