//! Cursor-based byte stream parser.
//!
//! This module provides the [`crate::file::parser::Parser`] type, a bounds-checked cursor over a
//! byte slice. It is used wherever a structure is read sequentially rather than at fixed offsets:
//! PE base-relocation blocks, Mach-O load commands, and the Mach-O export trie with its ULEB128
//! integers and NUL-terminated edge labels.
//!
//! # Examples
//!
//! ```rust,ignore
//! use memload::file::parser::Parser;
//!
//! let data = [0xE5, 0x8E, 0x26, b'_', b'f', 0x00];
//! let mut parser = Parser::new(&data);
//!
//! assert_eq!(parser.read_uleb128()?, 624_485);
//! assert_eq!(parser.read_string_utf8()?, "_f");
//! assert!(!parser.has_more_data());
//! # Ok::<(), memload::Error>(())
//! ```

use crate::{
    file::io::{read_le_at, ByteIO},
    Result,
};

/// A bounds-checked cursor over a byte slice.
pub struct Parser<'a> {
    /// The binary data being parsed
    data: &'a [u8],
    /// Current position within the data buffer
    position: usize,
}

impl<'a> Parser<'a> {
    /// Create a new [`crate::file::parser::Parser`] from a byte slice.
    ///
    /// # Arguments
    /// * `data` - The byte slice to read from
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Parser { data, position: 0 }
    }

    /// Returns the length of the underlying data buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the parser has no data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns `true` if there is more data available to parse.
    #[must_use]
    pub fn has_more_data(&self) -> bool {
        self.position < self.data.len()
    }

    /// Returns the current position.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// Returns the number of bytes left after the current position.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    /// Move the current position to the specified index.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if position is beyond the data length.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos >= self.data.len() {
            return Err(out_of_bounds_error!());
        }

        self.position = pos;
        Ok(())
    }

    /// Read a little-endian value and advance past it.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if fewer than `size_of::<T>()` bytes remain.
    pub fn read_le<T: ByteIO>(&mut self) -> Result<T> {
        read_le_at(self.data, &mut self.position)
    }

    /// Read an unsigned LEB128 integer.
    ///
    /// Seven payload bits per byte, least significant group first, high bit set on every byte
    /// except the last.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the data ends inside the integer, or
    /// [`crate::Error::Malformed`] if the encoding does not fit into 64 bits.
    pub fn read_uleb128(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0;

        loop {
            if self.position >= self.data.len() {
                return Err(out_of_bounds_error!());
            }

            let byte = self.data[self.position];
            self.position += 1;

            if shift >= 64 || (shift == 63 && (byte & 0x7F) > 1) {
                return Err(malformed_error!(
                    "ULEB128 integer overflow at offset {}",
                    self.position - 1
                ));
            }

            value |= u64::from(byte & 0x7F) << shift;
            shift += 7;

            if (byte & 0x80) == 0 {
                break;
            }
        }

        Ok(value)
    }

    /// Read a UTF-8 encoded null-terminated string.
    ///
    /// The position is advanced past the null terminator.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if no terminator is found, or
    /// [`crate::Error::Malformed`] for invalid UTF-8 encoding.
    pub fn read_string_utf8(&mut self) -> Result<String> {
        let start = self.position;
        let Some(length) = self.data[start.min(self.data.len())..]
            .iter()
            .position(|&byte| byte == 0)
        else {
            return Err(out_of_bounds_error!());
        };

        let end = start + length;
        let string_data = &self.data[start..end];
        self.position = end + 1;

        String::from_utf8(string_data.to_vec()).map_err(|e| {
            malformed_error!(
                "Invalid UTF-8 string at offset {}-{}: {}",
                start,
                end,
                e.utf8_error()
            )
        })
    }
}
