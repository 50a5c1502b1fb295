//! Loader configuration
//!
//! This module collects the knobs that change how images are placed in memory and how the
//! Darwin host loader is found and used. Nothing is read from the environment or from files;
//! a [`LoaderConfig`] is built in code and handed to [`crate::Loader::with_config`].

use crate::image::ImageFormat;

/// How the memory for a mapped image is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Reserve, commit read/write, copy and relocate, then switch to read/write/execute
    Staged,
    /// A single read/write/execute request
    Direct,
}

impl AllocationStrategy {
    /// The strategy used for `format` when none is configured.
    ///
    /// PE images are staged so they can first try their preferred base; ELF images are
    /// allocated directly.
    #[must_use]
    pub fn default_for(format: ImageFormat) -> AllocationStrategy {
        match format {
            ImageFormat::Pe => AllocationStrategy::Staged,
            ImageFormat::Elf | ImageFormat::MachO => AllocationStrategy::Direct,
        }
    }
}

/// Bounds of the scan for the Darwin host dynamic loader.
///
/// The scan starts at `start` and checks one candidate address every `stride` bytes. It gives up
/// after `max_images` Mach-O images were inspected without finding the loader entry points, or
/// after `max_candidates` addresses, whichever comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostLoaderScan {
    /// First candidate address
    pub start: usize,
    /// Distance between candidate addresses
    pub stride: usize,
    /// Maximum number of Mach-O images inspected
    pub max_images: usize,
    /// Maximum number of candidate addresses
    pub max_candidates: usize,
}

impl Default for HostLoaderScan {
    fn default() -> Self {
        Self {
            start: 0x0100_0000,
            stride: 0x1000,
            max_images: 10,
            max_candidates: 1 << 24,
        }
    }
}

/// How a Mach-O image is handed to the Darwin host loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DarwinLink {
    /// `Dlopen` from macOS 10.12 (Darwin 16) onwards, `ObjectFileImage` before
    #[default]
    Auto,
    /// `NSCreateObjectFileImageFromMemory` followed by `NSLinkModule`
    ObjectFileImage,
    /// A private temporary file opened with `dlopen`
    Dlopen,
}

/// Configuration for [`crate::Loader`].
///
/// # Default Configuration
///
/// - Allocation strategy chosen per format ([`AllocationStrategy::default_for`])
/// - PE images first try their preferred base address
/// - PE base relocations are applied
/// - Default [`HostLoaderScan`] bounds
/// - [`DarwinLink::Auto`]
///
/// # Examples
///
/// ```rust
/// use memload::{AllocationStrategy, Loader, LoaderConfig};
///
/// let config = LoaderConfig::new()
///     .with_allocation(AllocationStrategy::Direct)
///     .without_image_base();
/// let loader = Loader::with_config(config);
/// assert!(loader.is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Allocation strategy for every format, or `None` for the per-format default
    pub allocation: Option<AllocationStrategy>,

    /// Whether staged PE allocations first try the image's preferred base.
    ///
    /// Images whose relocations are stripped can only be loaded there.
    pub prefer_image_base: bool,

    /// Whether PE base relocations are applied when an image is not at its preferred base.
    ///
    /// Disabling this leaves absolute addresses pointing at the preferred base; only useful for
    /// images that are known to contain none.
    pub apply_relocations: bool,

    /// Bounds of the Darwin host-loader scan
    pub host_loader_scan: HostLoaderScan,

    /// Darwin link mechanism
    pub darwin_link: DarwinLink,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            allocation: None,
            prefer_image_base: true,
            apply_relocations: true,
            host_loader_scan: HostLoaderScan::default(),
            darwin_link: DarwinLink::Auto,
        }
    }
}

impl LoaderConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A configuration that maps every image with a single read/write/execute request.
    ///
    /// PE images are always relocated to wherever the operating system puts them.
    #[must_use]
    pub fn direct() -> Self {
        Self {
            allocation: Some(AllocationStrategy::Direct),
            prefer_image_base: false,
            ..Self::default()
        }
    }

    /// A configuration that stages every image: reserved and committed read/write first, made
    /// executable only after copying and relocation.
    #[must_use]
    pub fn staged() -> Self {
        Self {
            allocation: Some(AllocationStrategy::Staged),
            ..Self::default()
        }
    }

    /// Uses `strategy` for every format.
    #[must_use]
    pub fn with_allocation(mut self, strategy: AllocationStrategy) -> Self {
        self.allocation = Some(strategy);
        self
    }

    /// Never tries the preferred base of PE images.
    #[must_use]
    pub fn without_image_base(mut self) -> Self {
        self.prefer_image_base = false;
        self
    }

    /// Disables PE base relocation processing.
    ///
    /// # Warning
    ///
    /// Code with absolute addresses will crash when loaded anywhere but its preferred base.
    #[must_use]
    pub fn without_relocations(mut self) -> Self {
        self.apply_relocations = false;
        self
    }

    /// Sets the bounds of the Darwin host-loader scan.
    #[must_use]
    pub fn with_host_loader_scan(mut self, scan: HostLoaderScan) -> Self {
        self.host_loader_scan = scan;
        self
    }

    /// Sets the Darwin link mechanism.
    #[must_use]
    pub fn with_darwin_link(mut self, link: DarwinLink) -> Self {
        self.darwin_link = link;
        self
    }

    /// The allocation strategy for images of `format`.
    #[must_use]
    pub fn allocation_for(&self, format: ImageFormat) -> AllocationStrategy {
        self.allocation
            .unwrap_or_else(|| AllocationStrategy::default_for(format))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = LoaderConfig::default();
        assert_eq!(config, LoaderConfig::new());
        assert!(config.prefer_image_base);
        assert!(config.apply_relocations);
        assert_eq!(config.darwin_link, DarwinLink::Auto);
        assert_eq!(
            config.allocation_for(ImageFormat::Pe),
            AllocationStrategy::Staged
        );
        assert_eq!(
            config.allocation_for(ImageFormat::Elf),
            AllocationStrategy::Direct
        );
    }

    #[test]
    fn scan_defaults() {
        let scan = HostLoaderScan::default();
        assert_eq!(scan.start, 0x0100_0000);
        assert_eq!(scan.stride, 0x1000);
        assert_eq!(scan.max_images, 10);
        assert_eq!(scan.max_candidates, 1 << 24);
    }

    #[test]
    fn presets() {
        let direct = LoaderConfig::direct();
        assert!(!direct.prefer_image_base);
        assert_eq!(
            direct.allocation_for(ImageFormat::Pe),
            AllocationStrategy::Direct
        );

        let staged = LoaderConfig::staged();
        assert_eq!(
            staged.allocation_for(ImageFormat::Elf),
            AllocationStrategy::Staged
        );
    }

    #[test]
    fn builder() {
        let scan = HostLoaderScan {
            max_images: 3,
            ..HostLoaderScan::default()
        };
        let config = LoaderConfig::new()
            .without_relocations()
            .without_image_base()
            .with_host_loader_scan(scan)
            .with_darwin_link(DarwinLink::Dlopen);

        assert!(!config.apply_relocations);
        assert!(!config.prefer_image_base);
        assert_eq!(config.host_loader_scan.max_images, 3);
        assert_eq!(config.darwin_link, DarwinLink::Dlopen);
        assert_eq!(config.allocation, None);
    }
}
