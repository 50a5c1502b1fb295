//! Hand-assembled image fixtures.
//!
//! Each builder emits the smallest image of its format that the parsers accept: the headers the
//! loader reads, an export table, and a code area holding the bytes given for each export. Code
//! for successive exports starts on 16-byte boundaries from the builder's `CODE_OFFSET`.


pub use elf::ElfBuilder;
pub use macho::{export_trie, MachOBuilder};
pub use pe::PeBuilder;

use crate::file::io::{write_le_at, ByteIO};

/// Distance between the code of successive exports
pub const CODE_ALIGN: usize = 0x10;

/// Zero-filled output buffer with little-endian field writes.
pub struct ImageWriter {
    data: Vec<u8>,
}

impl ImageWriter {
    /// Creates a buffer of `len` zero bytes.
    pub fn new(len: usize) -> Self {
        Self {
            data: vec![0; len],
        }
    }

    /// Writes `value` at `offset`.
    pub fn put<T: ByteIO>(&mut self, offset: usize, value: T) -> &mut Self {
        let mut offset = offset;
        write_le_at(&mut self.data, &mut offset, value).unwrap();
        self
    }

    /// Writes consecutive values starting at `offset`, returning the offset after the last one.
    pub fn fields<T: ByteIO + Copy>(&mut self, offset: usize, values: &[T]) -> usize {
        let mut offset = offset;
        for &value in values {
            write_le_at(&mut self.data, &mut offset, value).unwrap();
        }
        offset
    }

    /// Copies `bytes` to `offset`.
    pub fn bytes(&mut self, offset: usize, bytes: &[u8]) -> &mut Self {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        self
    }

    /// The finished image.
    pub fn finish(self) -> Vec<u8> {
        self.data
    }
}

/// Lays out export code from `base`, returning `(name, offset)` per export.
pub fn place_code<'a>(
    writer: &mut ImageWriter,
    base: usize,
    exports: &'a [(String, Vec<u8>)],
) -> Vec<(&'a str, usize)> {
    let mut offset = base;
    exports
        .iter()
        .map(|(name, code)| {
            let placed = offset;
            writer.bytes(placed, code);
            offset = (placed + code.len()).next_multiple_of(CODE_ALIGN).max(placed + CODE_ALIGN);
            (name.as_str(), placed)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer() {
        let mut writer = ImageWriter::new(16);
        writer.put(0, 0x1234u16).bytes(4, b"ab");
        let end = writer.fields(8, &[1u32, 2u32]);

        assert_eq!(end, 16);
        assert_eq!(
            writer.finish(),
            vec![0x34, 0x12, 0, 0, b'a', b'b', 0, 0, 1, 0, 0, 0, 2, 0, 0, 0]
        );
    }

    #[test]
    fn code_placement() {
        let exports = vec![
            ("a".to_string(), vec![0xC3]),
            ("b".to_string(), vec![0x90; 0x11]),
            ("c".to_string(), vec![]),
            ("d".to_string(), vec![0xC3]),
        ];
        let mut writer = ImageWriter::new(0x100);

        let placed = place_code(&mut writer, 0x40, &exports);
        assert_eq!(placed, vec![("a", 0x40), ("b", 0x50), ("c", 0x70), ("d", 0x80)]);
    }
}
