//! PE (`.dll`) front end.
//!
//! Header fields are taken from `goblin`. The base-relocation table is decoded here, directly
//! from the file bytes, so the mapper receives a flat list of fixups that it can apply through
//! the bounds-checked arena.

use goblin::pe::{characteristic::IMAGE_FILE_RELOCS_STRIPPED, PE};

use crate::{
    file::{io::read_le_at, parser::Parser},
    image::{
        Architecture, Bitness, Export, ImageFormat, ParsedImage, Relocation, RelocationKind,
        Section, Target,
    },
    Error, Result,
};

const DOS_LFANEW_OFFSET: usize = 0x3C;
const PE_SIGNATURE: u32 = 0x0000_4550;
const OPTIONAL_HDR32_MAGIC: u16 = 0x10B;
const OPTIONAL_HDR64_MAGIC: u16 = 0x20B;

/// Base relocation types from the PE format specification.
mod reloc_type {
    /// No-op relocation, used for padding to maintain alignment.
    pub const IMAGE_REL_BASED_ABSOLUTE: u16 = 0;
    /// 32-bit address fixup (add delta to DWORD at offset).
    pub const IMAGE_REL_BASED_HIGHLOW: u16 = 3;
    /// 64-bit address fixup (add delta to QWORD at offset).
    pub const IMAGE_REL_BASED_DIR64: u16 = 10;
}

/// Reads machine and optional-header magic straight from the headers.
fn header_target(data: &[u8]) -> Result<Target> {
    let mut offset = DOS_LFANEW_OFFSET;
    let nt_offset = read_le_at::<u32>(data, &mut offset)? as usize;

    let mut offset = nt_offset;
    if read_le_at::<u32>(data, &mut offset)? != PE_SIGNATURE {
        return Err(Error::InvalidFormat);
    }

    let machine = read_le_at::<u16>(data, &mut offset)?;
    let mut offset = nt_offset + 24;
    let bitness = match read_le_at::<u16>(data, &mut offset)? {
        OPTIONAL_HDR32_MAGIC => Bitness::Bits32,
        OPTIONAL_HDR64_MAGIC => Bitness::Bits64,
        magic => {
            return Err(malformed_error!("Unknown optional header magic 0x{:x}", magic));
        }
    };

    let architecture = match machine {
        goblin::pe::header::COFF_MACHINE_X86 => Architecture::X86,
        goblin::pe::header::COFF_MACHINE_X86_64 => Architecture::X86_64,
        goblin::pe::header::COFF_MACHINE_ARMNT => Architecture::Arm,
        goblin::pe::header::COFF_MACHINE_ARM64 => Architecture::Aarch64,
        _ => Architecture::Unknown,
    };

    Ok(Target::new(architecture, bitness))
}

/// Parses a PE image.
///
/// # Errors
///
/// Returns [`crate::Error::ArchitectureMismatch`] if the image is not built for `target`,
/// [`crate::Error::Malformed`] if the relocation table is damaged, and
/// [`crate::Error::GoblinErr`] for header errors.
pub fn parse(data: &[u8], target: Target) -> Result<ParsedImage> {
    target.accept(header_target(data)?)?;

    let pe = PE::parse(data)?;
    let Some(optional_header) = pe.header.optional_header.as_ref() else {
        return Err(Error::UnsupportedBinaryType(
            "PE object file without optional header".to_string(),
        ));
    };

    let size_of_image = optional_header.windows_fields.size_of_image as usize;
    let header_size = optional_header.windows_fields.size_of_headers as usize;

    let mut sections = Vec::with_capacity(pe.sections.len());
    let mut total_size = size_of_image;
    for section in &pe.sections {
        let name = String::from_utf8_lossy(&section.name)
            .trim_end_matches('\0')
            .to_string();

        let raw_size = section.size_of_raw_data as usize;
        let virtual_size = match section.virtual_size as usize {
            0 => raw_size,
            size => size,
        };
        // Uninitialized data has no file backing
        let file_size = if section.pointer_to_raw_data == 0 {
            0
        } else {
            raw_size.min(virtual_size)
        };

        let virtual_address = section.virtual_address as usize;
        total_size = total_size.max(virtual_address.saturating_add(virtual_size));

        sections.push(Section {
            name,
            file_offset: section.pointer_to_raw_data as usize,
            file_size,
            virtual_address,
            virtual_size,
        });
    }

    let mut exports = Vec::with_capacity(pe.exports.len());
    for export in &pe.exports {
        let Some(name) = export.name else {
            continue;
        };

        if export.reexport.is_some() {
            log::debug!("Skipping forwarded export '{}'", name);
            continue;
        }

        if export.rva >= total_size {
            log::warn!(
                "Export '{}' at RVA 0x{:x} lies outside the image, skipping",
                name,
                export.rva
            );
            continue;
        }

        exports.push(Export {
            name: name.to_string(),
            offset: export.rva,
        });
    }

    let relocations = match optional_header
        .data_directories
        .get_base_relocation_table()
    {
        Some(dir) if dir.size > 0 => parse_relocations(
            data,
            &sections,
            dir.virtual_address as usize,
            dir.size as usize,
        )?,
        _ => Vec::new(),
    };

    Ok(ParsedImage {
        format: ImageFormat::Pe,
        target,
        total_size,
        header_size,
        preferred_base: pe.image_base as u64,
        relocations_stripped: pe.header.coff_header.characteristics
            & IMAGE_FILE_RELOCS_STRIPPED
            != 0,
        sections,
        exports,
        relocations,
        image_range: 0..data.len(),
    })
}

/// Translates an RVA into a file offset through the section table.
fn rva_to_offset(sections: &[Section], rva: usize) -> Option<usize> {
    sections
        .iter()
        .find(|s| {
            rva >= s.virtual_address
                && s.virtual_address
                    .checked_add(s.file_size)
                    .is_some_and(|end| rva < end)
        })
        .and_then(|s| s.file_offset.checked_add(rva - s.virtual_address))
}

/// Decodes the base relocation directory.
///
/// The table is a sequence of blocks, each covering one 4 KiB page:
///
/// ```text
/// u32 page_rva
/// u32 block_size      (including this 8 byte header)
/// u16 entries[]       (type << 12 | page_offset)
/// ```
fn parse_relocations(
    data: &[u8],
    sections: &[Section],
    rva: usize,
    size: usize,
) -> Result<Vec<Relocation>> {
    let Some(offset) = rva_to_offset(sections, rva) else {
        return Err(malformed_error!(
            "Relocation directory RVA 0x{:x} is not backed by any section",
            rva
        ));
    };

    let Some(table) = offset.checked_add(size).and_then(|end| data.get(offset..end)) else {
        return Err(out_of_bounds_error!());
    };

    let mut parser = Parser::new(table);
    let mut relocations = Vec::new();
    while parser.remaining() >= 8 {
        let page_rva = parser.read_le::<u32>()? as usize;
        let block_size = parser.read_le::<u32>()? as usize;
        if block_size < 8 || block_size - 8 > parser.remaining() {
            return Err(malformed_error!(
                "Relocation block for page 0x{:x} has invalid size 0x{:x}",
                page_rva,
                block_size
            ));
        }

        for _ in 0..(block_size - 8) / 2 {
            let entry = parser.read_le::<u16>()?;
            let Some(offset) = page_rva.checked_add(usize::from(entry & 0x0FFF)) else {
                return Err(malformed_error!(
                    "Relocation entry 0x{:x} overflows page 0x{:x}",
                    entry,
                    page_rva
                ));
            };

            let kind = match entry >> 12 {
                reloc_type::IMAGE_REL_BASED_ABSOLUTE => continue,
                reloc_type::IMAGE_REL_BASED_HIGHLOW => RelocationKind::HighLow,
                reloc_type::IMAGE_REL_BASED_DIR64 => RelocationKind::Dir64,
                other => {
                    log::warn!(
                        "Unsupported relocation type {} at RVA 0x{:x}, skipping",
                        other,
                        offset
                    );
                    continue;
                }
            };

            relocations.push(Relocation { offset, kind });
        }
    }

    Ok(relocations)
}
