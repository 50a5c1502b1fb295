//! PE base relocation.

use crate::{
    image::{ParsedImage, RelocationKind},
    memory::Arena,
};

/// Rewrites every absolute address in a mapped PE image for the arena's actual base.
///
/// Each fixup adds `base - preferred_base` to the value at its offset, with wrap-around, so the
/// same pass handles images placed above or below their preferred base. Returns the number of
/// fixups applied; zero if the image sits at its preferred base.
///
/// # Panics
///
/// Panics if a fixup lies outside the arena, which parsing rules out.
pub fn apply(arena: &mut Arena, parsed: &ParsedImage) -> usize {
    let delta = (arena.base() as u64).wrapping_sub(parsed.preferred_base);
    if delta == 0 {
        return 0;
    }

    for relocation in &parsed.relocations {
        match relocation.kind {
            RelocationKind::HighLow => {
                let value = arena.read_value::<u32>(relocation.offset);
                arena.write_value(relocation.offset, value.wrapping_add(delta as u32));
            }
            RelocationKind::Dir64 => {
                let value = arena.read_value::<u64>(relocation.offset);
                arena.write_value(relocation.offset, value.wrapping_add(delta));
            }
        }
    }

    log::debug!(
        "Applied {} relocations, delta 0x{:x}",
        parsed.relocations.len(),
        delta
    );
    parsed.relocations.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        image::{ImageFormat, Relocation, Target},
        memory::page_size,
    };

    fn parsed(preferred_base: u64, relocations: Vec<Relocation>) -> ParsedImage {
        ParsedImage {
            format: ImageFormat::Pe,
            target: Target::host(),
            total_size: page_size(),
            header_size: 0,
            preferred_base,
            relocations_stripped: false,
            sections: Vec::new(),
            exports: Vec::new(),
            relocations,
            image_range: 0..0,
        }
    }

    #[test]
    fn highlow_and_dir64() {
        let mut arena = Arena::reserve(page_size()).unwrap();
        let base = arena.base() as u64;
        let preferred = base.wrapping_add(0x10_0000);

        arena.write_value::<u32>(0x10, (preferred as u32).wrapping_add(0x2000));
        arena.write_value::<u64>(0x20, preferred + 0x3000);
        arena.write_value::<u32>(0x30, 0xAAAA_AAAA);

        let image = parsed(
            preferred,
            vec![
                Relocation {
                    offset: 0x10,
                    kind: RelocationKind::HighLow,
                },
                Relocation {
                    offset: 0x20,
                    kind: RelocationKind::Dir64,
                },
            ],
        );

        assert_eq!(apply(&mut arena, &image), 2);
        assert_eq!(arena.read_value::<u32>(0x10), (base as u32).wrapping_add(0x2000));
        assert_eq!(arena.read_value::<u64>(0x20), base + 0x3000);
        // Untouched
        assert_eq!(arena.read_value::<u32>(0x30), 0xAAAA_AAAA);
    }

    #[test]
    fn preferred_base_needs_no_fixups() {
        let mut arena = Arena::reserve(page_size()).unwrap();
        arena.write_value::<u64>(0x8, 0x1234);

        let image = parsed(
            arena.base() as u64,
            vec![Relocation {
                offset: 0x8,
                kind: RelocationKind::Dir64,
            }],
        );

        assert_eq!(apply(&mut arena, &image), 0);
        assert_eq!(arena.read_value::<u64>(0x8), 0x1234);
    }

    #[test]
    #[should_panic(expected = "outside arena")]
    fn fixup_outside_arena_panics() {
        let mut arena = Arena::reserve(page_size()).unwrap();
        let image = parsed(
            0x1000,
            vec![Relocation {
                offset: page_size() - 4,
                kind: RelocationKind::Dir64,
            }],
        );

        apply(&mut arena, &image);
    }
}
