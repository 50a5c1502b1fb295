//! Per-format load strategies.
//!
//! A load runs the same three stages for every format: parse, map, resolve. What "map" means
//! differs: PE and ELF images are copied into an [`Arena`] by hand, while Mach-O images on Darwin
//! are handed to the host loader. Only the strategy for the host's own container format is
//! compiled in; [`select`] picks it once at the top of a load.

use crate::{
    image::{self, ImageFormat, ParsedImage},
    loader::LoaderConfig,
    resolver::Exports,
    Error, Result,
};

#[cfg(not(target_os = "macos"))]
use crate::{mapper, memory::Arena};

#[cfg(target_os = "macos")]
use crate::resolver::dyld;

/// The memory a loaded library occupies.
pub(crate) enum Region {
    /// Copied and relocated by this crate, released on drop
    #[cfg(not(target_os = "macos"))]
    Mapped(Arena),
    /// Linked by the host loader, which keeps it for the rest of the process
    #[cfg(target_os = "macos")]
    Linked {
        /// Address of the image header
        base: usize,
        /// Virtual size of the image
        size: usize,
        /// Exports as seen by the host loader
        exports: Exports,
    },
}

impl Region {
    pub(crate) fn base(&self) -> usize {
        match self {
            #[cfg(not(target_os = "macos"))]
            Region::Mapped(arena) => arena.base(),
            #[cfg(target_os = "macos")]
            Region::Linked { base, .. } => *base,
        }
    }

    pub(crate) fn size(&self) -> usize {
        match self {
            #[cfg(not(target_os = "macos"))]
            Region::Mapped(arena) => arena.size(),
            #[cfg(target_os = "macos")]
            Region::Linked { size, .. } => *size,
        }
    }
}

/// One way of turning image bytes into a callable library.
pub(crate) trait Format: Sync {
    /// The container format this strategy loads.
    fn kind(&self) -> ImageFormat;

    /// Parses and validates `image` for the host.
    fn parse(&self, image: &[u8]) -> Result<ParsedImage> {
        image::parse(image)
    }

    /// Places the parsed image in memory.
    fn map(
        &self,
        name: &str,
        parsed: &ParsedImage,
        image: &[u8],
        config: &LoaderConfig,
    ) -> Result<Region>;

    /// Builds the export table of the placed image.
    fn resolve(&self, parsed: &ParsedImage, region: &Region) -> Exports;
}

/// PE and ELF images, copied section by section.
#[cfg(not(target_os = "macos"))]
struct Manual;

#[cfg(not(target_os = "macos"))]
impl Format for Manual {
    fn kind(&self) -> ImageFormat {
        ImageFormat::native()
    }

    fn map(
        &self,
        _name: &str,
        parsed: &ParsedImage,
        image: &[u8],
        config: &LoaderConfig,
    ) -> Result<Region> {
        mapper::map(parsed, image, config).map(Region::Mapped)
    }

    fn resolve(&self, parsed: &ParsedImage, region: &Region) -> Exports {
        Exports::resolve(&parsed.exports, region.base())
    }
}

/// Mach-O images, linked by the Darwin host loader.
#[cfg(target_os = "macos")]
struct HostLinked;

#[cfg(target_os = "macos")]
impl Format for HostLinked {
    fn kind(&self) -> ImageFormat {
        ImageFormat::MachO
    }

    fn map(
        &self,
        name: &str,
        parsed: &ParsedImage,
        image: &[u8],
        config: &LoaderConfig,
    ) -> Result<Region> {
        let linked = dyld::link(name, parsed, image, config)?;
        Ok(Region::Linked {
            base: linked.base,
            size: parsed.total_size,
            exports: linked.exports,
        })
    }

    fn resolve(&self, _parsed: &ParsedImage, region: &Region) -> Exports {
        let Region::Linked { exports, .. } = region;
        exports.clone()
    }
}

/// The strategy for images of `kind`.
///
/// # Errors
///
/// Returns [`crate::Error::UnsupportedBinaryType`] for container formats that are foreign to the
/// host, since their calling conventions and loader contracts do not apply here.
pub(crate) fn select(kind: ImageFormat) -> Result<&'static dyn Format> {
    #[cfg(not(target_os = "macos"))]
    let native: &'static dyn Format = &Manual;
    #[cfg(target_os = "macos")]
    let native: &'static dyn Format = &HostLinked;

    if kind != native.kind() {
        return Err(Error::UnsupportedBinaryType(format!(
            "{} images cannot be loaded on {}",
            kind,
            std::env::consts::OS
        )));
    }

    Ok(native)
}
