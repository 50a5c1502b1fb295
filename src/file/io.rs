//! Low-level reading and writing helpers.
//!
//! Almost every binary structure this crate touches (PE relocation blocks, ELF dynamic entries,
//! Mach-O load commands, the words patched into a mapped image) is little-endian on the
//! architectures the loader supports. Mach-O code signatures are the exception and are stored
//! big-endian. This module provides the bounds-checked primitives the rest of the crate builds
//! on, so that no component ever indexes a byte buffer by hand.
//!
//! # Key Components
//!
//! - [`crate::file::io::ByteIO`] - Trait implemented for the unsigned integer types
//! - [`crate::file::io::read_le`] / [`crate::file::io::read_le_at`] - Bounds-checked reads
//! - [`crate::file::io::write_le`] / [`crate::file::io::write_le_at`] - Bounds-checked writes
//! - [`crate::file::io::read_be_at`] / [`crate::file::io::write_be_at`] - Big-endian variants
//!
//! # Error Handling
//!
//! All functions return [`crate::Error::OutOfBounds`] if the buffer is too short to complete
//! the operation.
//!
//! # Examples
//!
//! ```rust,ignore
//! use memload::file::io::{read_le_at, write_le};
//!
//! let mut data = [0u8; 8];
//! write_le(&mut data[4..], 0xDEAD_BEEF_u32)?;
//!
//! let mut offset = 4;
//! let value: u32 = read_le_at(&data, &mut offset)?;
//! assert_eq!(value, 0xDEAD_BEEF);
//! assert_eq!(offset, 8);
//! # Ok::<(), memload::Error>(())
//! ```

use crate::Result;

/// Trait for types that can be converted from and to little- and big-endian byte arrays.
///
/// Each implementation defines a `Bytes` associated type that represents the fixed-size
/// byte array required for that particular type (e.g., `[u8; 4]` for `u32`).
pub trait ByteIO: Sized {
    /// Associated type representing the byte array type for this numeric type.
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Read T from a byte buffer in little-endian
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Write T to a byte buffer in little-endian
    fn to_le_bytes(self) -> Self::Bytes;

    /// Read T from a byte buffer in big-endian
    fn from_be_bytes(bytes: Self::Bytes) -> Self;

    /// Write T to a byte buffer in big-endian
    fn to_be_bytes(self) -> Self::Bytes;
}

macro_rules! impl_byte_io {
    ($($ty:ty => $len:literal),* $(,)?) => {
        $(
            impl ByteIO for $ty {
                type Bytes = [u8; $len];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }

                fn from_be_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_be_bytes(bytes)
                }

                fn to_be_bytes(self) -> Self::Bytes {
                    <$ty>::to_be_bytes(self)
                }
            }
        )*
    };
}

impl_byte_io!(u8 => 1, u16 => 2, u32 => 4, u64 => 8);

/// Safely reads a value of type `T` in little-endian byte order from the start of a buffer.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if the buffer holds fewer than `size_of::<T>()` bytes.
pub fn read_le<T: ByteIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Safely reads a value of type `T` in little-endian byte order at a specific offset.
///
/// The offset is advanced by the number of bytes read.
///
/// # Arguments
///
/// * `data` - The byte buffer to read from
/// * `offset` - Mutable reference to the offset position (will be advanced after reading)
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_le_at<T: ByteIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(out_of_bounds_error!());
    };
    if end > data.len() {
        return Err(out_of_bounds_error!());
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(out_of_bounds_error!());
    };

    *offset = end;

    Ok(T::from_le_bytes(read))
}

/// Safely writes a value of type `T` in little-endian byte order to the start of a buffer.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if the buffer holds fewer than `size_of::<T>()` bytes.
pub fn write_le<T: ByteIO>(data: &mut [u8], value: T) -> Result<()> {
    let mut offset = 0_usize;
    write_le_at(data, &mut offset, value)
}

/// Safely writes a value of type `T` in little-endian byte order at a specific offset.
///
/// The offset is advanced by the number of bytes written.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn write_le_at<T: ByteIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(out_of_bounds_error!());
    };
    if end > data.len() {
        return Err(out_of_bounds_error!());
    }

    data[*offset..end].copy_from_slice(value.to_le_bytes().as_ref());
    *offset = end;

    Ok(())
}

/// Safely reads a value of type `T` in big-endian byte order at a specific offset.
///
/// The offset is advanced by the number of bytes read.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_be_at<T: ByteIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(out_of_bounds_error!());
    };
    if end > data.len() {
        return Err(out_of_bounds_error!());
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(out_of_bounds_error!());
    };

    *offset = end;

    Ok(T::from_be_bytes(read))
}

/// Safely writes a value of type `T` in big-endian byte order at a specific offset.
///
/// The offset is advanced by the number of bytes written.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn write_be_at<T: ByteIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(out_of_bounds_error!());
    };
    let Some(target) = data.get_mut(*offset..end) else {
        return Err(out_of_bounds_error!());
    };

    target.copy_from_slice(value.to_be_bytes().as_ref());
    *offset = end;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    const TEST_BUFFER: [u8; 8] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];

    #[test]
    fn read_le_u16() {
        let result = read_le::<u16>(&TEST_BUFFER).unwrap();
        assert_eq!(result, 0x0201);
    }

    #[test]
    fn read_le_u32() {
        let result = read_le::<u32>(&TEST_BUFFER).unwrap();
        assert_eq!(result, 0x0403_0201);
    }

    #[test]
    fn read_le_u64() {
        let result = read_le::<u64>(&TEST_BUFFER).unwrap();
        assert_eq!(result, 0x0807_0605_0403_0201);
    }

    #[test]
    fn read_le_at_advances() {
        let mut offset = 2;
        let value: u16 = read_le_at(&TEST_BUFFER, &mut offset).unwrap();
        assert_eq!(value, 0x0403);
        assert_eq!(offset, 4);

        let value: u32 = read_le_at(&TEST_BUFFER, &mut offset).unwrap();
        assert_eq!(value, 0x0807_0605);
        assert_eq!(offset, 8);
    }

    #[test]
    fn read_errors() {
        let mut offset = 6;
        let result = read_le_at::<u32>(&TEST_BUFFER, &mut offset);
        assert!(matches!(result, Err(Error::OutOfBounds { .. })));
        assert_eq!(offset, 6);

        let mut offset = usize::MAX;
        assert!(read_le_at::<u8>(&TEST_BUFFER, &mut offset).is_err());
    }

    #[test]
    fn write_le_at_advances() {
        let mut data = [0u8; 8];
        let mut offset = 0;

        write_le_at(&mut data, &mut offset, 0x0201_u16).unwrap();
        write_le_at(&mut data, &mut offset, 0x0605_0403_u32).unwrap();
        assert_eq!(offset, 6);
        assert_eq!(data, [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x00, 0x00]);
    }

    #[test]
    fn write_errors() {
        let mut data = [0u8; 4];
        assert!(write_le(&mut data, 1_u64).is_err());
        assert_eq!(data, [0u8; 4]);

        let mut offset = 3;
        assert!(write_le_at(&mut data, &mut offset, 1_u16).is_err());
    }

    #[test]
    fn big_endian() {
        let mut offset = 2;
        let value: u32 = read_be_at(&TEST_BUFFER, &mut offset).unwrap();
        assert_eq!(value, 0x0304_0506);
        assert_eq!(offset, 6);
        assert!(read_be_at::<u32>(&TEST_BUFFER, &mut offset).is_err());

        let mut data = [0u8; 6];
        let mut offset = 1;
        write_be_at(&mut data, &mut offset, 0xFADE_0C02_u32).unwrap();
        assert_eq!(offset, 5);
        assert_eq!(data, [0x00, 0xFA, 0xDE, 0x0C, 0x02, 0x00]);
        assert!(write_be_at(&mut data, &mut offset, 1_u16).is_err());
    }
}
