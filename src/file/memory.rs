use super::Backend;
use crate::Result;

/// An image that is already in memory, owned by the backend.
///
/// Used for images handed to [`crate::File::from_mem`], for example bytes received over the
/// network or decrypted on the fly, which never touch the disk.
#[derive(Debug)]
pub struct Memory {
    image: Vec<u8>,
}

impl Memory {
    /// Takes ownership of `image`.
    pub fn new(image: Vec<u8>) -> Memory {
        Memory { image }
    }
}

impl Backend for Memory {
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.image.as_slice().data_slice(offset, len)
    }

    fn len(&self) -> usize {
        self.image.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn slices_within_image() {
        let mut image = vec![0u8; 0x200];
        image[..4].copy_from_slice(b"\x7FELF");
        image[0x100..0x104].copy_from_slice(&0xDEAD_BEEF_u32.to_le_bytes());

        let backend = Memory::new(image);

        assert_eq!(backend.len(), 0x200);
        assert_eq!(backend.data_slice(0, 4).unwrap(), b"\x7FELF");
        assert_eq!(
            backend.data_slice(0x100, 4).unwrap(),
            &[0xEF, 0xBE, 0xAD, 0xDE]
        );
        assert_eq!(backend.data_slice(0x200, 0).unwrap(), &[] as &[u8]);
    }

    #[test]
    fn reads_past_the_end_fail() {
        let backend = Memory::new(vec![0x90; 0x40]);

        for (offset, len) in [(0x40, 1), (0x3F, 2), (0, 0x41), (usize::MAX, 1), (1, usize::MAX)] {
            assert!(
                matches!(backend.data_slice(offset, len), Err(Error::OutOfBounds { .. })),
                "{offset:#x}+{len:#x}"
            );
        }
    }

    #[test]
    fn empty_image() {
        let backend = Memory::new(Vec::new());

        assert!(backend.is_empty());
        assert!(backend.data_slice(0, 1).is_err());
    }
}
