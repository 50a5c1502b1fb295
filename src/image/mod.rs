//! Image parsing for PE, ELF and Mach-O shared libraries.
//!
//! This module turns the raw bytes of a shared-library image into a [`ParsedImage`]: the
//! container format, the target the image was built for, the virtual size it occupies once
//! mapped, the file-to-memory layout of its sections or segments, its exported symbols and, for
//! PE, its base-relocation table.
//!
//! Parsing is a pure function over the input buffer. Nothing is mapped, allocated executable or
//! linked here; that is left to [`crate::mapper`] and [`crate::resolver`].
//!
//! # Validation Order
//!
//! 1. The magic is sniffed. Unknown buffers fail with [`crate::Error::InvalidFormat`].
//! 2. Architecture and bitness are compared with the requested target. A mismatch fails with
//!    [`crate::Error::ArchitectureMismatch`].
//! 3. The container subtype is checked. Executables and other non-library subtypes fail with
//!    [`crate::Error::UnsupportedBinaryType`].
//! 4. Section ranges are checked against the input buffer and the computed image size. Anything
//!    pointing outside fails with [`crate::Error::Malformed`].
//!
//! Because of step 4 the mapper can treat a bounds violation while copying as a broken
//! invariant rather than an input error.
//!
//! # Examples
//!
//! ```rust,no_run
//! use memload::image::{self, ImageFormat};
//!
//! let data = std::fs::read("libtest.so")?;
//! let parsed = image::parse(&data)?;
//!
//! assert_eq!(parsed.format, ImageFormat::Elf);
//! for export in &parsed.exports {
//!     println!("{} at +0x{:x}", export.name, export.offset);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod codesign;
pub mod elf;
pub mod macho;
pub mod pe;

use std::{fmt, ops::Range};

use strum::Display;

use crate::{Error, Result};

/// The container formats the loader understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ImageFormat {
    /// Portable Executable (`.dll`)
    #[strum(serialize = "PE")]
    Pe,
    /// Executable and Linkable Format (`.so`)
    #[strum(serialize = "ELF")]
    Elf,
    /// Mach-O, thin or universal (`.bundle`, `.dylib`)
    #[strum(serialize = "Mach-O")]
    MachO,
}

impl ImageFormat {
    /// Identifies the container format from the leading magic bytes.
    ///
    /// Returns `None` if the buffer does not start with a known signature.
    #[must_use]
    pub fn sniff(data: &[u8]) -> Option<ImageFormat> {
        match data {
            [b'M', b'Z', ..] => Some(ImageFormat::Pe),
            [0x7F, b'E', b'L', b'F', ..] => Some(ImageFormat::Elf),
            // 32/64-bit thin images in either byte order, and the universal (fat) container
            [0xCE | 0xCF, 0xFA, 0xED, 0xFE, ..]
            | [0xFE, 0xED, 0xFA, 0xCE | 0xCF, ..]
            | [0xCA, 0xFE, 0xBA, 0xBE, ..] => Some(ImageFormat::MachO),
            _ => None,
        }
    }

    /// The format used by the operating system this crate was compiled for.
    #[must_use]
    pub const fn native() -> ImageFormat {
        if cfg!(windows) {
            ImageFormat::Pe
        } else if cfg!(any(target_os = "macos", target_os = "ios")) {
            ImageFormat::MachO
        } else {
            ImageFormat::Elf
        }
    }
}

/// Instruction set architectures an image can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Architecture {
    /// 32-bit Intel
    #[strum(serialize = "x86")]
    X86,
    /// 64-bit Intel/AMD
    #[strum(serialize = "x86_64")]
    X86_64,
    /// 32-bit ARM
    #[strum(serialize = "arm")]
    Arm,
    /// 64-bit ARM
    #[strum(serialize = "aarch64")]
    Aarch64,
    /// Anything else; never loadable
    #[strum(serialize = "unknown")]
    Unknown,
}

impl Architecture {
    /// The architecture of the running process.
    #[must_use]
    pub const fn host() -> Architecture {
        if cfg!(target_arch = "x86_64") {
            Architecture::X86_64
        } else if cfg!(target_arch = "x86") {
            Architecture::X86
        } else if cfg!(target_arch = "aarch64") {
            Architecture::Aarch64
        } else if cfg!(target_arch = "arm") {
            Architecture::Arm
        } else {
            Architecture::Unknown
        }
    }
}

/// Pointer width of an image or process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Bitness {
    /// 32-bit pointers
    #[strum(serialize = "32-bit")]
    Bits32,
    /// 64-bit pointers
    #[strum(serialize = "64-bit")]
    Bits64,
}

impl Bitness {
    /// Bitness of the running process.
    #[must_use]
    pub const fn host() -> Bitness {
        if cfg!(target_pointer_width = "64") {
            Bitness::Bits64
        } else {
            Bitness::Bits32
        }
    }
}

/// An architecture and bitness pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Target {
    /// Instruction set
    pub architecture: Architecture,
    /// Pointer width
    pub bitness: Bitness,
}

impl Target {
    /// Creates a new target.
    #[must_use]
    pub const fn new(architecture: Architecture, bitness: Bitness) -> Target {
        Target {
            architecture,
            bitness,
        }
    }

    /// The target of the running process.
    #[must_use]
    pub const fn host() -> Target {
        Target::new(Architecture::host(), Bitness::host())
    }

    /// Fails with [`crate::Error::ArchitectureMismatch`] unless `found` can run as `self`.
    pub(crate) fn accept(self, found: Target) -> Result<()> {
        if found != self || found.architecture == Architecture::Unknown {
            return Err(Error::ArchitectureMismatch {
                expected: self,
                found,
            });
        }

        Ok(())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.architecture, self.bitness)
    }
}

/// A contiguous piece of the image that is copied from the file into memory.
///
/// PE sections and ELF/Mach-O loadable segments are both described this way. `file_size` bytes
/// are copied from `file_offset` to `virtual_address`; the remainder up to `virtual_size` stays
/// zero-filled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Section or segment name, empty for ELF segments
    pub name: String,
    /// Offset of the raw bytes in the file
    pub file_offset: usize,
    /// Number of bytes to copy from the file
    pub file_size: usize,
    /// Image-relative destination address
    pub virtual_address: usize,
    /// Size of the section in memory
    pub virtual_size: usize,
}

/// An exported symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    /// Symbol name as stored in the image
    pub name: String,
    /// Image-relative address
    pub offset: usize,
}

/// Width of a PE base-relocation fixup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationKind {
    /// 32-bit absolute address (`IMAGE_REL_BASED_HIGHLOW`)
    HighLow,
    /// 64-bit absolute address (`IMAGE_REL_BASED_DIR64`)
    Dir64,
}

impl RelocationKind {
    /// Number of bytes rewritten by the fixup.
    #[must_use]
    pub const fn width(self) -> usize {
        match self {
            RelocationKind::HighLow => 4,
            RelocationKind::Dir64 => 8,
        }
    }
}

/// A single base-relocation fixup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Image-relative address of the absolute value to rewrite
    pub offset: usize,
    /// Width of the value
    pub kind: RelocationKind,
}

/// The result of parsing an image.
///
/// Derived once from the input bytes and then only read. Neither this structure nor the input
/// buffer is retained by a loaded [`crate::Library`].
#[derive(Debug, Clone)]
pub struct ParsedImage {
    /// Container format
    pub format: ImageFormat,
    /// Architecture and bitness the image was built for
    pub target: Target,
    /// Bytes of address space the mapped image occupies
    pub total_size: usize,
    /// Leading bytes of the file that are copied to offset zero before any section
    pub header_size: usize,
    /// The base address the image was linked for
    pub preferred_base: u64,
    /// `true` if the image cannot be placed anywhere but its preferred base
    pub relocations_stripped: bool,
    /// Loadable sections or segments, in file order
    pub sections: Vec<Section>,
    /// Exported symbols, in the order the image lists them
    pub exports: Vec<Export>,
    /// Base-relocation fixups (PE only)
    pub relocations: Vec<Relocation>,
    /// Byte range of the selected image within the input; only narrower than the input for
    /// universal Mach-O containers
    pub image_range: Range<usize>,
}

impl ParsedImage {
    /// Checks every section against the length of the selected image and the computed size.
    fn validate(&self, data_len: usize) -> Result<()> {
        if self.header_size > self.total_size || self.header_size > data_len {
            return Err(malformed_error!(
                "Header size 0x{:x} exceeds image (0x{:x}) or input (0x{:x})",
                self.header_size,
                self.total_size,
                data_len
            ));
        }

        for section in &self.sections {
            let file_end = section.file_offset.checked_add(section.file_size);
            let copy_end = section.virtual_address.checked_add(section.file_size);
            let virtual_end = section.virtual_address.checked_add(section.virtual_size);

            match (file_end, copy_end, virtual_end) {
                (Some(file_end), Some(copy_end), Some(virtual_end))
                    if file_end <= data_len
                        && copy_end <= self.total_size
                        && virtual_end <= self.total_size => {}
                _ => {
                    return Err(malformed_error!(
                        "Section '{}' [file 0x{:x}+0x{:x}, virtual 0x{:x}+0x{:x}] lies outside the image",
                        section.name,
                        section.file_offset,
                        section.file_size,
                        section.virtual_address,
                        section.virtual_size
                    ));
                }
            }
        }

        for relocation in &self.relocations {
            match relocation.offset.checked_add(relocation.kind.width()) {
                Some(end) if end <= self.total_size => {}
                _ => {
                    return Err(malformed_error!(
                        "Relocation at 0x{:x} lies outside the image",
                        relocation.offset
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Parses an image for the running process.
///
/// # Errors
///
/// See the module documentation for the validation order and the error each step produces.
pub fn parse(data: &[u8]) -> Result<ParsedImage> {
    parse_for(data, Target::host())
}

/// Parses an image, accepting only images built for `target`.
///
/// # Errors
///
/// See the module documentation for the validation order and the error each step produces.
pub fn parse_for(data: &[u8], target: Target) -> Result<ParsedImage> {
    let Some(format) = ImageFormat::sniff(data) else {
        return Err(Error::InvalidFormat);
    };

    let parsed = match format {
        ImageFormat::Pe => pe::parse(data, target)?,
        ImageFormat::Elf => elf::parse(data, target)?,
        ImageFormat::MachO => macho::parse(data, target)?,
    };

    parsed.validate(parsed.image_range.len())?;

    log::debug!(
        "Parsed {} image for {}: 0x{:x} bytes, {} sections, {} exports",
        parsed.format,
        parsed.target,
        parsed.total_size,
        parsed.sections.len(),
        parsed.exports.len()
    );

    Ok(parsed)
}

/// Rounds `value` up to the next multiple of `align`, which must be a power of two.
pub(crate) fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}
