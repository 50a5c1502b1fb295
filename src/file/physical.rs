use super::Backend;
use crate::{Error::FileError, Result};

use memmap2::Mmap;
use std::{fs, path::Path};

/// A backend that memory-maps an image file from disk.
///
/// The mapping is read-only and private to the loader; it only lives for the duration of a
/// single [`crate::Loader::load_library_file`] call. The loaded library never references the
/// file mapping once its own arena has been populated.
///
/// # Examples
///
/// ```rust,ignore
/// use memload::file::{Backend, Physical};
///
/// let physical = Physical::new("libtest.so")?;
/// assert_eq!(physical.data_slice(0, 4)?, b"\x7fELF");
/// # Ok::<(), memload::Error>(())
/// ```
#[derive(Debug)]
pub struct Physical {
    /// Memory-mapped file data
    data: Option<Mmap>,
}

impl Physical {
    /// Create a new physical file backend by memory-mapping the specified file.
    ///
    /// Zero-length files cannot be mapped on every platform, so they are represented by an
    /// empty backend instead.
    ///
    /// # Arguments
    /// * `path` - Path to the image on disk.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be opened or mapped.
    pub fn new(path: impl AsRef<Path>) -> Result<Physical> {
        let file = fs::File::open(path).map_err(FileError)?;
        let length = file.metadata().map_err(FileError)?.len();
        if length == 0 {
            return Ok(Physical { data: None });
        }

        // The file is opened read-only and the map is dropped before the load returns.
        let mmap = unsafe { Mmap::map(&file) }.map_err(FileError)?;

        Ok(Physical { data: Some(mmap) })
    }

    fn bytes(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }
}

impl Backend for Physical {
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.bytes().data_slice(offset, len)
    }

    fn len(&self) -> usize {
        self.bytes().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn image_file(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn maps_image_file() {
        let mut contents = vec![0u8; 0x1000];
        contents[..4].copy_from_slice(b"MZ\x90\x00");
        contents[0x3C..0x40].copy_from_slice(&0x80u32.to_le_bytes());
        let file = image_file(&contents);

        let physical = Physical::new(file.path()).unwrap();

        assert_eq!(physical.len(), 0x1000);
        assert_eq!(physical.data_slice(0, 2).unwrap(), b"MZ");
        assert_eq!(physical.data_slice(0x3C, 4).unwrap(), &[0x80, 0, 0, 0]);
        assert!(physical.data_slice(0xFFF, 2).is_err());
        assert!(physical.data_slice(usize::MAX, 1).is_err());
    }

    #[test]
    fn missing_file() {
        match Physical::new("/nonexistent/libmissing.so") {
            Err(FileError(error)) => assert_eq!(error.kind(), std::io::ErrorKind::NotFound),
            other => panic!("Expected FileError, got {other:?}"),
        }
    }

    #[test]
    fn empty_file_is_not_mapped() {
        let file = image_file(&[]);

        let physical = Physical::new(file.path()).unwrap();
        assert!(physical.is_empty());
        assert!(physical.data_slice(0, 1).is_err());
        assert_eq!(physical.data_slice(0, 0).unwrap(), &[] as &[u8]);
    }
}
