//! Image sources and low-level byte access.
//!
//! This module abstracts over where image bytes come from and provides the bounds-checked
//! primitives every parser in the crate reads through.
//!
//! # Key Components
//!
//! - [`crate::file::Backend`] - Trait for bounds-checked access to a byte source
//! - [`crate::file::File`] - An owned image source (disk file or memory buffer)
//! - [`crate::file::parser::Parser`] - Cursor-based reader for sequential structures
//! - [`crate::file::io`] - Little-endian read/write helpers
//!
//! ## Backend Implementations
//! - [`crate::file::Physical`] - Memory-mapped file on disk (`memmap2`)
//! - [`crate::file::Memory`] - Owned in-memory buffer
//! - [`crate::file::Process`] - A window onto the running process's own address space, used to
//!   read images the Darwin host loader mapped. Checked views verify each page before reading.
//!
//! # Examples
//!
//! ```rust,no_run
//! use memload::File;
//!
//! let file = File::from_file("libtest.so".as_ref())?;
//! let image = memload::image::parse(file.data())?;
//! println!("{} exports", image.exports.len());
//! # Ok::<(), memload::Error>(())
//! ```

pub mod io;
pub mod parser;

mod memory;
mod physical;
mod process;

use std::path::Path;

use crate::{Error::Empty, Result};

pub use memory::Memory;
pub use physical::Physical;
pub use process::Process;
#[cfg(unix)]
pub use process::is_mapped;

/// Backend trait for image data sources.
///
/// The trait provides a common interface for reading image bytes regardless of whether they
/// live in a file on disk, an owned buffer, or somewhere in the running process.
pub trait Backend: Send + Sync {
    /// Returns a slice of the data at the given offset and length.
    ///
    /// # Arguments
    ///
    /// * `offset` - The starting offset within the data.
    /// * `len` - The length of the slice in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the requested range is out of bounds.
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]>;

    /// Returns the total length of the data source.
    fn len(&self) -> usize;

    /// Returns `true` if the data source holds no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Backend for [u8] {
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        offset
            .checked_add(len)
            .and_then(|end| self.get(offset..end))
            .ok_or_else(|| out_of_bounds_error!())
    }

    fn len(&self) -> usize {
        <[u8]>::len(self)
    }
}

/// An owned image source.
///
/// `File` keeps the raw bytes of an image available for the duration of a load. It is not
/// retained by the resulting [`crate::Library`].
pub struct File {
    data: Box<dyn Backend>,
}

impl File {
    /// Memory-maps an image file from disk.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::FileError`] if the file cannot be read, or [`crate::Error::Empty`]
    /// if it has no content.
    pub fn from_file(file: &Path) -> Result<File> {
        Self::load(Physical::new(file)?)
    }

    /// Wraps an in-memory image buffer.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Empty`] if the buffer is empty.
    pub fn from_mem(data: Vec<u8>) -> Result<File> {
        Self::load(Memory::new(data))
    }

    fn load<T: Backend + 'static>(data: T) -> Result<File> {
        if data.is_empty() {
            return Err(Empty);
        }

        Ok(File {
            data: Box::new(data),
        })
    }

    /// Returns the complete image bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        // The full range of a backend is always in bounds.
        self.data.data_slice(0, self.data.len()).unwrap_or_default()
    }

    /// Returns a slice of the image bytes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the range exceeds the image.
    pub fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.data.data_slice(offset, len)
    }

    /// Returns the size of the image in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the image holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn from_mem() {
        let file = File::from_mem(vec![0x7F, b'E', b'L', b'F']).unwrap();
        assert_eq!(file.len(), 4);
        assert!(!file.is_empty());
        assert_eq!(file.data(), b"\x7fELF");
        assert_eq!(file.data_slice(1, 3).unwrap(), b"ELF");
        assert!(file.data_slice(2, 3).is_err());
    }

    #[test]
    fn empty_sources_are_rejected() {
        assert!(matches!(File::from_mem(Vec::new()), Err(Error::Empty)));

        let empty = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(File::from_file(empty.path()), Err(Error::Empty)));
    }
}
