//! ELF (`.so`) front end.
//!
//! Only position independent shared objects (`ET_DYN`) are accepted. Their loadable segments
//! are copied as they are; no dynamic relocations are processed, so exported functions must not
//! depend on fixups the system linker would normally apply.

use goblin::elf::{
    header::{et_to_str, EM_386, EM_AARCH64, EM_ARM, EM_X86_64, ET_DYN},
    program_header::PT_LOAD,
    section_header::SHN_UNDEF,
    Elf,
};

use crate::{
    file::io::read_le,
    image::{align_up, Architecture, Bitness, Export, ImageFormat, ParsedImage, Section, Target},
    memory::page_size,
    Error, Result,
};

const EI_CLASS: usize = 4;
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const E_MACHINE_OFFSET: usize = 18;

/// Reads class and machine straight from the identification bytes.
fn header_target(data: &[u8]) -> Result<Target> {
    let bitness = match data.get(EI_CLASS) {
        Some(&ELFCLASS32) => Bitness::Bits32,
        Some(&ELFCLASS64) => Bitness::Bits64,
        Some(class) => return Err(malformed_error!("Unknown ELF class {}", class)),
        None => return Err(out_of_bounds_error!()),
    };

    let Some(machine) = data.get(E_MACHINE_OFFSET..) else {
        return Err(out_of_bounds_error!());
    };

    let architecture = match read_le::<u16>(machine)? {
        EM_386 => Architecture::X86,
        EM_X86_64 => Architecture::X86_64,
        EM_ARM => Architecture::Arm,
        EM_AARCH64 => Architecture::Aarch64,
        _ => Architecture::Unknown,
    };

    Ok(Target::new(architecture, bitness))
}

/// Parses an ELF shared object.
///
/// Every dynamic symbol that is defined in the object (section index other than `SHN_UNDEF`)
/// and has a name is reported as an export.
///
/// # Errors
///
/// Returns [`crate::Error::ArchitectureMismatch`] if the image is not built for `target`,
/// [`crate::Error::UnsupportedBinaryType`] for anything but `ET_DYN`, and
/// [`crate::Error::GoblinErr`] for header errors.
pub fn parse(data: &[u8], target: Target) -> Result<ParsedImage> {
    target.accept(header_target(data)?)?;

    let elf = Elf::parse(data)?;
    if elf.header.e_type != ET_DYN {
        return Err(Error::UnsupportedBinaryType(format!(
            "ELF image of type {}, only shared objects (ET_DYN) can be loaded",
            et_to_str(elf.header.e_type)
        )));
    }

    let mut sections = Vec::new();
    let mut end = 0usize;
    for header in elf.program_headers.iter().filter(|ph| ph.p_type == PT_LOAD) {
        let virtual_address = header.p_vaddr as usize;
        let virtual_size = header.p_memsz as usize;
        let Some(segment_end) = virtual_address.checked_add(virtual_size) else {
            return Err(malformed_error!(
                "Segment at 0x{:x} overflows the address space",
                virtual_address
            ));
        };
        end = end.max(segment_end);

        sections.push(Section {
            name: String::new(),
            file_offset: header.p_offset as usize,
            file_size: (header.p_filesz as usize).min(virtual_size),
            virtual_address,
            virtual_size,
        });
    }

    if sections.is_empty() {
        return Err(Error::UnsupportedBinaryType(
            "ELF image without loadable segments".to_string(),
        ));
    }

    let Some(total_size) = align_up(end, page_size()) else {
        return Err(malformed_error!("Image size 0x{:x} cannot be page aligned", end));
    };

    let mut exports = Vec::new();
    for sym in elf.dynsyms.iter() {
        if sym.st_shndx == SHN_UNDEF as usize {
            continue;
        }

        let Some(name) = elf.dynstrtab.get_at(sym.st_name).filter(|n| !n.is_empty()) else {
            continue;
        };

        let offset = sym.st_value as usize;
        if offset >= total_size {
            log::warn!(
                "Symbol '{}' at 0x{:x} lies outside the image, skipping",
                name,
                offset
            );
            continue;
        }

        exports.push(Export {
            name: name.to_string(),
            offset,
        });
    }

    Ok(ParsedImage {
        format: ImageFormat::Elf,
        target,
        total_size,
        // The headers are part of the first loadable segment
        header_size: 0,
        preferred_base: 0,
        relocations_stripped: false,
        sections,
        exports,
        relocations: Vec::new(),
        image_range: 0..data.len(),
    })
}
