//! Mach-O (`.bundle`, `.dylib`) front end.
//!
//! Besides parsing files, this module can read the exports of a Mach-O image that is already
//! mapped into the process (see [`loaded_exports`]). The Darwin host-loader discovery uses that
//! to find the loader entry points, so the export trie is decoded here rather than through
//! `goblin`, which only understands file layouts.
//!
//! # Export Trie
//!
//! Exports are stored as a prefix tree in the `__LINKEDIT` segment. Every node starts with the
//! ULEB128 size of its terminal information (zero for inner nodes), followed by that
//! information, a child count and the children as `(NUL-terminated edge label, ULEB128 node
//! offset)` pairs. A symbol name is the concatenation of the edge labels on the way from the root.

use std::{collections::HashSet, ops::Range};

use goblin::mach::{
    cputype::{CPU_TYPE_ARM, CPU_TYPE_ARM64, CPU_TYPE_X86, CPU_TYPE_X86_64},
    fat::FAT_MAGIC,
    header::{filetype_to_str, MH_BUNDLE, MH_CIGAM, MH_CIGAM_64, MH_DYLIB, MH_MAGIC, MH_MAGIC_64},
    load_command::{LC_DYLD_INFO, LC_DYLD_INFO_ONLY, LC_SEGMENT, LC_SEGMENT_64},
    MachO,
};

use crate::{
    file::{
        io::{read_le, read_le_at, write_le_at},
        parser::Parser,
        Backend,
    },
    image::{codesign, Architecture, Bitness, Export, ImageFormat, ParsedImage, Section, Target},
    Error, Result,
};

const LC_DYLD_EXPORTS_TRIE: u32 = 0x33 | 0x8000_0000;
const CPU_ARCH_ABI64: u32 = 0x0100_0000;
const FILETYPE_OFFSET: usize = 12;
const HEADER_SIZE_32: usize = 28;
const HEADER_SIZE_64: usize = 32;
const FAT_ARCH_SIZE: usize = 20;

const EXPORT_SYMBOL_FLAGS_REEXPORT: u64 = 0x08;

fn cpu_target(cputype: u32) -> Target {
    let architecture = match cputype {
        CPU_TYPE_X86 => Architecture::X86,
        CPU_TYPE_X86_64 => Architecture::X86_64,
        CPU_TYPE_ARM => Architecture::Arm,
        CPU_TYPE_ARM64 => Architecture::Aarch64,
        _ => Architecture::Unknown,
    };
    let bitness = if cputype & CPU_ARCH_ABI64 != 0 {
        Bitness::Bits64
    } else {
        Bitness::Bits32
    };

    Target::new(architecture, bitness)
}

/// Reads magic and CPU type of a thin image.
fn header_target(data: &[u8]) -> Result<Target> {
    let mut offset = 0;
    let magic = read_le_at::<u32>(data, &mut offset)?;
    let cputype = read_le_at::<u32>(data, &mut offset)?;

    match magic {
        MH_MAGIC | MH_MAGIC_64 => Ok(cpu_target(cputype)),
        // Big-endian images never match a supported host
        MH_CIGAM => Ok(Target::new(Architecture::Unknown, Bitness::Bits32)),
        MH_CIGAM_64 => Ok(Target::new(Architecture::Unknown, Bitness::Bits64)),
        _ => Err(Error::InvalidFormat),
    }
}

fn read_be_u32(data: &[u8], offset: usize) -> Result<u32> {
    let Some(bytes) = data.get(offset..offset + 4) else {
        return Err(out_of_bounds_error!());
    };

    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Picks the slice of a universal container that matches `target`.
///
/// Thin images are returned whole.
fn select_slice(data: &[u8], target: Target) -> Result<Range<usize>> {
    if read_be_u32(data, 0)? != FAT_MAGIC {
        return Ok(0..data.len());
    }

    let count = read_be_u32(data, 4)? as usize;
    let mut found = None;
    for index in 0..count {
        let entry = 8 + index * FAT_ARCH_SIZE;
        let slice_target = cpu_target(read_be_u32(data, entry)?);
        let offset = read_be_u32(data, entry + 8)? as usize;
        let size = read_be_u32(data, entry + 12)? as usize;

        log::trace!(
            "Universal slice {} for {} at 0x{:x}+0x{:x}",
            index,
            slice_target,
            offset,
            size
        );

        if slice_target == target {
            return match offset.checked_add(size) {
                Some(end) if end <= data.len() => Ok(offset..end),
                _ => Err(out_of_bounds_error!()),
            };
        }

        found.get_or_insert(slice_target);
    }

    Err(Error::ArchitectureMismatch {
        expected: target,
        found: found.unwrap_or(Target::new(Architecture::Unknown, target.bitness)),
    })
}

/// Parses a Mach-O dylib or bundle, thin or universal.
///
/// Section offsets in the result are relative to the selected slice, which is recorded in
/// [`ParsedImage::image_range`].
///
/// # Errors
///
/// Returns [`crate::Error::ArchitectureMismatch`] if no slice is built for `target`,
/// [`crate::Error::UnsupportedBinaryType`] for anything but `MH_DYLIB` and `MH_BUNDLE`, and
/// [`crate::Error::GoblinErr`] for header errors.
pub fn parse(data: &[u8], target: Target) -> Result<ParsedImage> {
    let image_range = select_slice(data, target)?;
    let image = &data[image_range.clone()];
    target.accept(header_target(image)?)?;

    let macho = MachO::parse(image, 0)?;
    let filetype = macho.header.filetype;
    if filetype != MH_DYLIB && filetype != MH_BUNDLE {
        return Err(Error::UnsupportedBinaryType(format!(
            "Mach-O image of type {}, only dylibs and bundles can be loaded",
            filetype_to_str(filetype)
        )));
    }

    let segments: Vec<_> = macho
        .segments
        .iter()
        .filter(|segment| segment.name().map_or(true, |name| name != "__PAGEZERO"))
        .collect();

    let Some(base) = segments.iter().map(|segment| segment.vmaddr).min() else {
        return Err(Error::UnsupportedBinaryType(
            "Mach-O image without segments".to_string(),
        ));
    };

    let mut sections = Vec::with_capacity(segments.len());
    let mut end = 0u64;
    for segment in &segments {
        end = end.max(segment.vmaddr.saturating_add(segment.vmsize));
        sections.push(Section {
            name: segment.name().unwrap_or_default().to_string(),
            file_offset: segment.fileoff as usize,
            file_size: segment.filesize.min(segment.vmsize) as usize,
            virtual_address: (segment.vmaddr - base) as usize,
            virtual_size: segment.vmsize as usize,
        });
    }

    let header_size = if macho.is_64 {
        HEADER_SIZE_64
    } else {
        HEADER_SIZE_32
    } + macho.header.sizeofcmds as usize;

    Ok(ParsedImage {
        format: ImageFormat::MachO,
        target,
        total_size: (end - base) as usize,
        header_size,
        preferred_base: base,
        relocations_stripped: false,
        sections,
        exports: file_exports(image)?,
        relocations: Vec::new(),
        image_range,
    })
}

/// Rewrites a thin image so the host loader accepts it as a bundle.
///
/// The `filetype` header field becomes `MH_BUNDLE`. If the image is code-signed, the page hashes
/// of its code directories are recomputed (see [`crate::image::codesign::rehash`]) so the kernel
/// still accepts the changed header page. Every other byte is copied unchanged.
///
/// # Errors
///
/// Returns [`crate::Error::InvalidFormat`] if `image` is not a little-endian thin Mach-O image,
/// and [`crate::Error::Malformed`] if its code signature cannot be updated.
pub fn force_bundle(image: &[u8]) -> Result<Vec<u8>> {
    let magic = read_le::<u32>(image)?;
    if magic != MH_MAGIC && magic != MH_MAGIC_64 {
        return Err(Error::InvalidFormat);
    }

    let mut bundle = image.to_vec();
    let mut offset = FILETYPE_OFFSET;
    write_le_at(&mut bundle, &mut offset, MH_BUNDLE)?;

    if codesign::rehash(&mut bundle)? {
        log::debug!("Re-signed bundle header page ad hoc");
    }

    Ok(bundle)
}

/// Returns `true` if `data` starts with a little-endian 64-bit Mach-O header.
#[must_use]
pub fn is_macho_64(data: &[u8]) -> bool {
    matches!(read_le::<u32>(data), Ok(MH_MAGIC_64))
}

#[derive(Debug, Clone, Copy)]
struct SegmentRange {
    vmaddr: u64,
    fileoff: u64,
}

/// The load commands needed to locate the export trie.
#[derive(Debug, Default)]
struct TrieLocation {
    text: Option<SegmentRange>,
    linkedit: Option<SegmentRange>,
    /// File offset and size of the trie
    trie: Option<(u64, u64)>,
}

impl TrieLocation {
    fn read<B: Backend + ?Sized>(image: &B) -> Result<TrieLocation> {
        let header = image.data_slice(0, HEADER_SIZE_64)?;
        let is_64 = match read_le::<u32>(header)? {
            MH_MAGIC_64 => true,
            MH_MAGIC => false,
            _ => return Err(Error::InvalidFormat),
        };

        let mut offset = 16;
        let ncmds = read_le_at::<u32>(header, &mut offset)?;
        let sizeofcmds = read_le_at::<u32>(header, &mut offset)? as usize;
        let header_size = if is_64 { HEADER_SIZE_64 } else { HEADER_SIZE_32 };
        let commands = image.data_slice(header_size, sizeofcmds)?;

        let mut location = TrieLocation::default();
        let mut parser = Parser::new(commands);
        for _ in 0..ncmds {
            let start = parser.pos();
            let cmd = parser.read_le::<u32>()?;
            let cmdsize = parser.read_le::<u32>()? as usize;
            let min_size = match cmd {
                LC_SEGMENT_64 => 72,
                LC_SEGMENT => 56,
                LC_DYLD_INFO | LC_DYLD_INFO_ONLY => 48,
                LC_DYLD_EXPORTS_TRIE => 16,
                _ => 8,
            };
            let Some(body) = commands
                .get(start..start + cmdsize)
                .filter(|_| cmdsize >= min_size)
            else {
                return Err(malformed_error!(
                    "Load command 0x{:x} at 0x{:x} has invalid size 0x{:x}",
                    cmd,
                    start,
                    cmdsize
                ));
            };

            match cmd {
                LC_SEGMENT_64 | LC_SEGMENT => {
                    let name = Parser::new(&body[8..24]).read_string_utf8().unwrap_or_default();
                    let range = if cmd == LC_SEGMENT_64 {
                        SegmentRange {
                            vmaddr: read_le::<u64>(&body[24..])?,
                            fileoff: read_le::<u64>(&body[40..])?,
                        }
                    } else {
                        SegmentRange {
                            vmaddr: u64::from(read_le::<u32>(&body[24..])?),
                            fileoff: u64::from(read_le::<u32>(&body[32..])?),
                        }
                    };

                    match name.as_str() {
                        "__TEXT" => location.text = Some(range),
                        "__LINKEDIT" => location.linkedit = Some(range),
                        _ => {}
                    }
                }
                LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                    let mut field = 40;
                    let off = read_le_at::<u32>(body, &mut field)?;
                    let size = read_le_at::<u32>(body, &mut field)?;
                    location.trie = Some((u64::from(off), u64::from(size)));
                }
                LC_DYLD_EXPORTS_TRIE => {
                    let mut field = 8;
                    let off = read_le_at::<u32>(body, &mut field)?;
                    let size = read_le_at::<u32>(body, &mut field)?;
                    location.trie = Some((u64::from(off), u64::from(size)));
                }
                _ => {}
            }

            if start + cmdsize >= commands.len() {
                break;
            }
            parser.seek(start + cmdsize)?;
        }

        Ok(location)
    }
}

/// Reads the exports of a Mach-O file.
fn file_exports(image: &[u8]) -> Result<Vec<Export>> {
    let location = TrieLocation::read(image)?;
    let Some((offset, size)) = location.trie.filter(|&(_, size)| size > 0) else {
        return Ok(Vec::new());
    };

    walk_trie(image.data_slice(offset as usize, size as usize)?)
}

/// Reads the exports of a Mach-O image that is mapped into memory.
///
/// In memory, the export trie is found through the `__LINKEDIT` segment: its address relative to
/// the header is `(linkedit.vmaddr - text.vmaddr) + (trie_offset - linkedit.fileoff)`. This also
/// holds for images from the shared cache, whose segments are not laid out as in any file.
///
/// # Errors
///
/// Returns [`crate::Error::Malformed`] if the segment layout is inconsistent, or
/// [`crate::Error::OutOfBounds`] if the trie lies outside `image`.
pub fn loaded_exports<B: Backend + ?Sized>(image: &B) -> Result<Vec<Export>> {
    let location = TrieLocation::read(image)?;
    let (Some(text), Some(linkedit), Some((offset, size))) =
        (location.text, location.linkedit, location.trie)
    else {
        return Ok(Vec::new());
    };

    let Some(address) = linkedit
        .vmaddr
        .checked_sub(text.vmaddr)
        .zip(offset.checked_sub(linkedit.fileoff))
        .and_then(|(segment, trie)| segment.checked_add(trie))
    else {
        return Err(malformed_error!(
            "Export trie at 0x{:x} cannot be located through __LINKEDIT",
            offset
        ));
    };

    walk_trie(image.data_slice(address as usize, size as usize)?)
}

/// Decodes every non re-exported symbol of an export trie.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] or [`crate::Error::Malformed`] for damaged tries.
pub fn walk_trie(trie: &[u8]) -> Result<Vec<Export>> {
    let mut exports = Vec::new();
    if trie.is_empty() {
        return Ok(exports);
    }

    let mut visited = HashSet::new();
    let mut pending = vec![(0usize, String::new())];
    let mut parser = Parser::new(trie);

    while let Some((node, prefix)) = pending.pop() {
        if !visited.insert(node) {
            return Err(malformed_error!("Export trie loops back to node 0x{:x}", node));
        }

        parser.seek(node)?;
        let terminal_size = parser.read_uleb128()? as usize;
        let children = parser.pos().saturating_add(terminal_size);

        if terminal_size > 0 {
            let flags = parser.read_uleb128()?;
            if flags & EXPORT_SYMBOL_FLAGS_REEXPORT == 0 {
                let address = parser.read_uleb128()?;
                exports.push(Export {
                    name: prefix.clone(),
                    offset: address as usize,
                });
            }
        }

        parser.seek(children)?;
        let count = parser.read_le::<u8>()?;
        for _ in 0..count {
            let label = parser.read_string_utf8()?;
            let child = parser.read_uleb128()? as usize;
            pending.push((child, format!("{prefix}{label}")));
        }
    }

    Ok(exports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        file::Memory,
        image::parse_for,
        test::{export_trie, MachOBuilder},
    };

    const X64: Target = Target::new(Architecture::X86_64, Bitness::Bits64);
    const ARM64: Target = Target::new(Architecture::Aarch64, Bitness::Bits64);

    fn sorted(mut exports: Vec<Export>) -> Vec<Export> {
        exports.sort_by(|a, b| a.name.cmp(&b.name));
        exports
    }

    #[test]
    fn parse_dylib() {
        let bytes = MachOBuilder::new(X64)
            .export("_answer", &[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3])
            .export("_add", &[0x48, 0x8D, 0x04, 0x37, 0xC3])
            .build();

        let parsed = parse_for(&bytes, X64).unwrap();
        assert_eq!(parsed.format, ImageFormat::MachO);
        assert_eq!(parsed.total_size, 0x2000);
        assert_eq!(parsed.image_range, 0..bytes.len());
        assert_eq!(parsed.sections.len(), 2);
        assert_eq!(parsed.sections[0].name, "__TEXT");
        assert_eq!(parsed.sections[1].name, "__LINKEDIT");

        assert_eq!(
            sorted(parsed.exports),
            vec![
                Export {
                    name: "_add".to_string(),
                    offset: MachOBuilder::CODE_OFFSET + 0x10,
                },
                Export {
                    name: "_answer".to_string(),
                    offset: MachOBuilder::CODE_OFFSET,
                },
            ]
        );
    }

    #[test]
    fn executables_are_unsupported() {
        let bytes = MachOBuilder::new(X64)
            .executable()
            .export("_main", &[0xC3])
            .build();

        assert!(matches!(
            parse_for(&bytes, X64),
            Err(Error::UnsupportedBinaryType(_))
        ));
    }

    #[test]
    fn wrong_cpu() {
        let bytes = MachOBuilder::new(ARM64).export("_answer", &[0xC3]).build();

        match parse_for(&bytes, X64) {
            Err(Error::ArchitectureMismatch { expected, found }) => {
                assert_eq!(expected, X64);
                assert_eq!(found, ARM64);
            }
            other => panic!("Expected ArchitectureMismatch, got {other:?}"),
        }
    }

    #[test]
    fn universal_slice_selection() {
        let x64 = MachOBuilder::new(X64).export("_intel", &[0xC3]).build();
        let arm = MachOBuilder::new(ARM64)
            .export("_arm", &[0xC0, 0x03, 0x5F, 0xD6])
            .build();
        let fat = MachOBuilder::universal(&[(X64, x64.as_slice()), (ARM64, arm.as_slice())]);

        let parsed = parse_for(&fat, ARM64).unwrap();
        assert_eq!(parsed.image_range.len(), arm.len());
        assert_eq!(&fat[parsed.image_range.clone()], arm.as_slice());
        assert_eq!(parsed.exports.len(), 1);
        assert_eq!(parsed.exports[0].name, "_arm");

        let parsed = parse_for(&fat, X64).unwrap();
        assert_eq!(parsed.exports[0].name, "_intel");

        let x86 = Target::new(Architecture::X86, Bitness::Bits32);
        assert!(matches!(
            parse_for(&fat, x86),
            Err(Error::ArchitectureMismatch { .. })
        ));
    }

    #[test]
    fn bundle_rewrite() {
        let bytes = MachOBuilder::new(X64).export("_answer", &[0xC3]).build();
        let bundle = force_bundle(&bytes).unwrap();

        assert_eq!(bundle.len(), bytes.len());
        assert_eq!(read_le::<u32>(&bundle[FILETYPE_OFFSET..]).unwrap(), MH_BUNDLE);
        assert_eq!(bundle[..FILETYPE_OFFSET], bytes[..FILETYPE_OFFSET]);
        assert_eq!(bundle[FILETYPE_OFFSET + 4..], bytes[FILETYPE_OFFSET + 4..]);

        assert!(matches!(
            force_bundle(b"\x7fELF\x02\x01\x01\x00"),
            Err(Error::InvalidFormat)
        ));
    }

    #[test]
    fn trie_entries() {
        let trie = export_trie(&[
            ("_NSLinkModule", 0x1234),
            ("_NSCreateObjectFileImageFromMemory", 0x5678),
        ]);

        let exports = sorted(walk_trie(&trie).unwrap());
        assert_eq!(exports.len(), 2);
        assert_eq!(exports[0].name, "_NSCreateObjectFileImageFromMemory");
        assert_eq!(exports[0].offset, 0x5678);
        assert_eq!(exports[1].name, "_NSLinkModule");
        assert_eq!(exports[1].offset, 0x1234);
    }

    #[test]
    fn trie_cycle_is_malformed() {
        // Root with one child edge "a" pointing back at the root
        let trie = [0x00, 0x01, b'a', 0x00, 0x00];
        assert!(matches!(walk_trie(&trie), Err(Error::Malformed { .. })));
    }

    #[test]
    fn trie_truncated() {
        let trie = [0x00, 0x02, b'a', 0x00];
        assert!(walk_trie(&trie).is_err());
    }

    #[test]
    fn exports_of_mapped_image() {
        let bytes = MachOBuilder::new(X64)
            .export("_NSCreateObjectFileImageFromMemory", &[0xC3])
            .export("_NSLinkModule", &[0xC3])
            .build();

        let from_file = sorted(parse_for(&bytes, X64).unwrap().exports);
        let mapped = Memory::new(bytes);
        let from_memory = sorted(loaded_exports(&mapped).unwrap());

        assert_eq!(from_file, from_memory);
        assert!(is_macho_64(mapped.data_slice(0, 4).unwrap()));
    }
}
