//! Placing parsed images into executable memory.
//!
//! [`map`] allocates an [`Arena`] of the parsed image's total size, copies the headers and every
//! section to their image-relative addresses, applies PE base relocations and finally makes the
//! block executable. Only the relocation pass changes content; everything else is a byte-exact
//! copy.
//!
//! Mach-O images are not mapped here on Darwin. The host loader links them instead, see
//! [`crate::resolver`].

pub mod relocation;

use crate::{
    image::{ImageFormat, ParsedImage},
    loader::{AllocationStrategy, LoaderConfig},
    memory::{Arena, MemoryProtection},
    Error, Result,
};

/// Maps `parsed` into a fresh arena.
///
/// `image` is the full input buffer that `parsed` was produced from.
///
/// # Errors
///
/// Returns [`crate::Error::AllocationFailed`] if the operating system refuses the memory, and
/// [`crate::Error::UnsupportedBinaryType`] for a PE image with stripped relocations that could
/// not be placed at its preferred base.
///
/// # Panics
///
/// Panics if a section lies outside the arena. [`crate::image::parse`] rules this out, so it
/// indicates a broken invariant.
pub fn map(parsed: &ParsedImage, image: &[u8], config: &LoaderConfig) -> Result<Arena> {
    let image = &image[parsed.image_range.clone()];
    let mut arena = allocate(parsed, config)?;

    copy(&mut arena, parsed, image);

    if parsed.format == ImageFormat::Pe {
        if config.apply_relocations {
            relocation::apply(&mut arena, parsed);
        } else if arena.base() as u64 != parsed.preferred_base {
            log::warn!(
                "Relocations disabled, image linked for 0x{:x} stays at 0x{:x} unrelocated",
                parsed.preferred_base,
                arena.base()
            );
        }
    }

    arena.protect(MemoryProtection::READ_WRITE_EXECUTE)?;
    log::debug!(
        "Mapped {} image at 0x{:x} (0x{:x} bytes)",
        parsed.format,
        arena.base(),
        arena.size()
    );

    Ok(arena)
}

fn allocate(parsed: &ParsedImage, config: &LoaderConfig) -> Result<Arena> {
    let size = parsed.total_size;
    let arena = match config.allocation_for(parsed.format) {
        AllocationStrategy::Staged => {
            let preferred = parsed.format == ImageFormat::Pe
                && config.prefer_image_base
                && parsed.preferred_base != 0;

            let placed = if preferred {
                match usize::try_from(parsed.preferred_base) {
                    Ok(address) => Arena::reserve_at(address, size)
                        .inspect_err(|e| {
                            log::debug!("Preferred base 0x{:x} unavailable: {}", address, e);
                        })
                        .ok(),
                    Err(_) => None,
                }
            } else {
                None
            };

            match placed {
                Some(arena) => arena,
                None => Arena::reserve(size)?,
            }
        }
        AllocationStrategy::Direct => {
            Arena::allocate(size, MemoryProtection::READ_WRITE_EXECUTE)?
        }
    };

    if parsed.relocations_stripped && arena.base() as u64 != parsed.preferred_base {
        return Err(Error::UnsupportedBinaryType(format!(
            "relocations are stripped and the preferred base 0x{:x} is unavailable",
            parsed.preferred_base
        )));
    }

    Ok(arena)
}

/// Copies the headers and every section with file content into the arena.
fn copy(arena: &mut Arena, parsed: &ParsedImage, image: &[u8]) {
    if parsed.header_size > 0 {
        arena.write(0, &image[..parsed.header_size]);
    }

    for section in &parsed.sections {
        if section.file_size == 0 {
            log::trace!("Section '{}' has no file content", section.name);
            continue;
        }

        log::trace!(
            "Copying section '{}': file 0x{:x}+0x{:x} -> +0x{:x}",
            section.name,
            section.file_offset,
            section.file_size,
            section.virtual_address
        );

        let content = &image[section.file_offset..section.file_offset + section.file_size];
        arena.write(section.virtual_address, content);
    }
}

// Apple silicon refuses writable and executable mappings without MAP_JIT
#[cfg(all(test, not(all(target_os = "macos", target_arch = "aarch64"))))]
mod tests {
    use super::*;
    use crate::{
        image::{parse, Architecture, Bitness, Target},
        test::{ElfBuilder, PeBuilder},
    };

    #[test]
    fn elf_segments_are_copied() {
        let code = [0xDE, 0xAD, 0xBE, 0xEF];
        let bytes = ElfBuilder::new(Target::host()).export("f", &code).build();
        let parsed = parse(&bytes).unwrap();

        let arena = map(&parsed, &bytes, &LoaderConfig::default()).unwrap();

        assert!(arena.size() >= parsed.total_size);
        assert_eq!(arena.protection(), MemoryProtection::READ_WRITE_EXECUTE);
        assert_eq!(&arena.as_slice()[..bytes.len()], bytes.as_slice());
        assert_eq!(
            &arena.as_slice()[ElfBuilder::CODE_OFFSET..ElfBuilder::CODE_OFFSET + 4],
            &code
        );
    }

    #[test]
    fn pe_sections_are_copied() {
        let code = [0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3];
        let bytes = PeBuilder::new(Target::host()).export("answer", &code).build();
        let parsed = parse(&bytes).unwrap();

        let arena = map(&parsed, &bytes, &LoaderConfig::direct()).unwrap();
        let memory = arena.as_slice();

        // Headers at offset zero, .text at its RVA, uninitialized tail stays zero
        assert_eq!(&memory[..0x200], &bytes[..0x200]);
        assert_eq!(&memory[0x1000..0x1006], &code);
        assert!(memory[0x1200..0x2000].iter().all(|&b| b == 0));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn pe_relocated_when_not_at_preferred_base() {
        let preferred = 0x1_8000_0000u64;
        let bytes = PeBuilder::new(Target::host())
            .image_base(preferred)
            .export("answer", &[0xC3])
            .data(0x1100, &(preferred + 0x1000).to_le_bytes())
            .relocation(0x1100, crate::image::RelocationKind::Dir64)
            .build();
        let parsed = parse(&bytes).unwrap();

        for config in [
            LoaderConfig::default(),
            LoaderConfig::direct(),
            LoaderConfig::staged().without_image_base(),
        ] {
            let arena = map(&parsed, &bytes, &config).unwrap();
            assert_eq!(
                arena.read_value::<u64>(0x1100),
                arena.base() as u64 + 0x1000,
                "{config:?}"
            );
        }
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn relocations_can_be_disabled() {
        let preferred = 0x1_8000_0000u64;
        let bytes = PeBuilder::new(Target::host())
            .image_base(preferred)
            .export("answer", &[0xC3])
            .data(0x1100, &(preferred + 0x1000).to_le_bytes())
            .relocation(0x1100, crate::image::RelocationKind::Dir64)
            .build();
        let parsed = parse(&bytes).unwrap();

        let arena = map(&parsed, &bytes, &LoaderConfig::direct().without_relocations()).unwrap();
        assert_eq!(arena.read_value::<u64>(0x1100), preferred + 0x1000);
    }

    #[test]
    fn stripped_image_needs_preferred_base() {
        let occupied = Arena::reserve(0x4000).unwrap();
        let bytes = PeBuilder::new(Target::host())
            .image_base(occupied.base() as u64)
            .strip_relocations()
            .export("answer", &[0xC3])
            .build();
        let parsed = parse(&bytes).unwrap();

        assert!(matches!(
            map(&parsed, &bytes, &LoaderConfig::default()),
            Err(Error::UnsupportedBinaryType(_))
        ));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn universal_slice_is_mapped() {
        use crate::test::MachOBuilder;

        let other = if Target::host().architecture == Architecture::Aarch64 {
            Target::new(Architecture::X86_64, Bitness::Bits64)
        } else {
            Target::new(Architecture::Aarch64, Bitness::Bits64)
        };
        let host = MachOBuilder::new(Target::host())
            .export("_f", &[0x11, 0x22])
            .build();
        let foreign = MachOBuilder::new(other).export("_f", &[0x33, 0x44]).build();
        let fat = MachOBuilder::universal(&[
            (other, foreign.as_slice()),
            (Target::host(), host.as_slice()),
        ]);

        let parsed = parse(&fat).unwrap();
        let arena = map(&parsed, &fat, &LoaderConfig::staged()).unwrap();

        let code = MachOBuilder::CODE_OFFSET;
        assert_eq!(&arena.as_slice()[code..code + 2], &[0x11, 0x22]);
    }
}
