//! Byte stream abstraction for persisted navigation data
//!
//! Writers are plain [`std::io::Write`] sinks. Readers additionally expose
//! [`Deserializer::is_eof`] so record streams can be consumed until exhausted.

use std::io::{Cursor, Read, Write};

/// A sink for navigation data. Every `Write` implementation qualifies.
pub trait Serializer: Write {}

impl<W: Write + ?Sized> Serializer for W {}

/// A source for navigation data that knows when it has been fully consumed
pub trait Deserializer: Read {
    /// Returns true when no bytes remain
    fn is_eof(&self) -> bool;

    /// Number of bytes not yet consumed
    fn remaining(&self) -> usize;
}

impl<T: AsRef<[u8]>> Deserializer for Cursor<T> {
    fn is_eof(&self) -> bool {
        self.remaining() == 0
    }

    fn remaining(&self) -> usize {
        let len = self.get_ref().as_ref().len() as u64;
        len.saturating_sub(self.position()) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

    #[test]
    fn test_cursor_eof() {
        let mut buffer = Vec::new();
        buffer.write_i32::<LittleEndian>(7).unwrap();
        buffer.write_i32::<LittleEndian>(-1).unwrap();

        let mut reader = Cursor::new(&buffer[..]);
        assert!(!reader.is_eof());
        assert_eq!(reader.remaining(), 8);
        assert_eq!(reader.read_i32::<LittleEndian>().unwrap(), 7);
        assert_eq!(reader.read_i32::<LittleEndian>().unwrap(), -1);
        assert!(reader.is_eof());
    }
}
