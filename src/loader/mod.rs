//! The loader registry.
//!
//! A [`Loader`] owns every library it loaded, keyed by the name the caller chose. Loading runs
//! the three pipeline stages for the host's container format:
//!
//! ```text
//! +-------------+     +--------------+     +---------------+     +-----------+
//! | image bytes | --> | image::parse | --> | mapper::map   | --> | resolver  |
//! +-------------+     +--------------+     | (or dyld link)|     | Exports   |
//!                                          +---------------+     +-----------+
//! ```
//!
//! Libraries are appended to a lock-free [`boxcar::Vec`], so concurrent loads from several
//! threads need no external locking, and lookups never block a load in progress. A library lives
//! as long as its loader; [`Loader::global`] lives for the whole process.
//!
//! # Examples
//!
//! ```rust,no_run
//! use memload::Loader;
//!
//! let image = std::fs::read("libtest.so")?;
//! let loader = Loader::new();
//! loader.load_library("libtest.so", &image)?;
//!
//! if let Some(add) = loader.find_proc("libtest.so", "add") {
//!     println!("add is at 0x{add:x}");
//! }
//!
//! // The export takes two integers and returns one
//! let sum = unsafe { loader.call("libtest.so", "add", &[2, 3]) }?;
//! assert_eq!(sum.value, 5);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod config;
mod format;

use std::{
    borrow::Cow,
    fmt,
    ops::Deref,
    path::Path,
    sync::{Arc, OnceLock},
};

pub use config::{AllocationStrategy, DarwinLink, HostLoaderScan, LoaderConfig};

use crate::{
    dispatch::{self, Outcome},
    file::File,
    image::ImageFormat,
    resolver::Exports,
    Error, Result,
};
use format::Region;

/// A reference-counted pointer to a loaded library.
pub type LibraryRc = Arc<Library>;

/// One loaded image.
///
/// Immutable after loading: the export table never changes, and the memory the image occupies
/// belongs to this value alone.
pub struct Library {
    name: String,
    format: ImageFormat,
    region: Region,
    exports: Exports,
}

impl Library {
    /// The name the library was loaded under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The container format of the image.
    #[must_use]
    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// The address the image was placed at.
    #[must_use]
    pub fn base_address(&self) -> usize {
        self.region.base()
    }

    /// The number of bytes the image occupies.
    #[must_use]
    pub fn size(&self) -> usize {
        self.region.size()
    }

    /// The export table.
    #[must_use]
    pub fn exports(&self) -> &Exports {
        &self.exports
    }

    /// Absolute address of the export `function`.
    ///
    /// Mach-O symbol names carry a leading underscore; it is added here if `function` lacks one,
    /// so the same name works on every platform.
    #[must_use]
    pub fn find_proc(&self, function: &str) -> Option<usize> {
        self.exports.get(&symbol_name(self.format, function))
    }
}

impl fmt::Debug for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Library")
            .field("name", &self.name)
            .field("format", &self.format)
            .field("base_address", &format_args!("0x{:x}", self.base_address()))
            .field("size", &format_args!("0x{:x}", self.size()))
            .field("exports", &self.exports.len())
            .finish()
    }
}

fn symbol_name(format: ImageFormat, function: &str) -> Cow<'_, str> {
    if format == ImageFormat::MachO && !function.starts_with('_') {
        Cow::Owned(format!("_{function}"))
    } else {
        Cow::Borrowed(function)
    }
}

/// A loaded library together with its position in the loader.
#[derive(Debug, Clone)]
pub struct LibraryHandle {
    index: usize,
    library: LibraryRc,
}

impl LibraryHandle {
    /// Position of the library in its loader, for [`Loader::library`].
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// The shared library value.
    #[must_use]
    pub fn library(&self) -> &LibraryRc {
        &self.library
    }
}

impl Deref for LibraryHandle {
    type Target = Library;

    fn deref(&self) -> &Library {
        &self.library
    }
}

/// The registry of loaded libraries.
pub struct Loader {
    config: LoaderConfig,
    libraries: boxcar::Vec<LibraryRc>,
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

impl Loader {
    /// Creates an empty loader with the default configuration.
    #[must_use]
    pub fn new() -> Loader {
        Self::with_config(LoaderConfig::default())
    }

    /// Creates an empty loader with `config`.
    #[must_use]
    pub fn with_config(config: LoaderConfig) -> Loader {
        Loader {
            config,
            libraries: boxcar::Vec::new(),
        }
    }

    /// The process-wide loader, created with the default configuration on first use.
    pub fn global() -> &'static Loader {
        static GLOBAL: OnceLock<Loader> = OnceLock::new();
        GLOBAL.get_or_init(Loader::new)
    }

    /// The configuration used for every load.
    #[must_use]
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Loads a shared library image from memory and registers it as `name`.
    ///
    /// The bytes are not retained; everything the library needs is copied.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing stage:
    /// [`crate::Error::InvalidFormat`], [`crate::Error::ArchitectureMismatch`] or
    /// [`crate::Error::UnsupportedBinaryType`] while parsing, [`crate::Error::AllocationFailed`]
    /// while mapping, and [`crate::Error::HostLoaderNotFound`] or [`crate::Error::LinkFailed`]
    /// while linking on Darwin. Memory from a failed load is released.
    pub fn load_library(&self, name: &str, image: &[u8]) -> Result<LibraryHandle> {
        let kind = ImageFormat::sniff(image).ok_or(Error::InvalidFormat)?;
        let format = format::select(kind)?;

        let parsed = format.parse(image)?;
        let region = format.map(name, &parsed, image, &self.config)?;
        let exports = format.resolve(&parsed, &region);

        let library = Arc::new(Library {
            name: name.to_string(),
            format: kind,
            region,
            exports,
        });
        let index = self.libraries.push(library.clone());

        log::debug!(
            "Registered '{}' at 0x{:x} with {} exports",
            name,
            library.base_address(),
            library.exports.len()
        );

        Ok(LibraryHandle { index, library })
    }

    /// Loads a shared library image from a file on disk and registers it as `name`.
    ///
    /// The file is memory-mapped for the duration of the load only.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::FileError`] if the file cannot be opened, [`crate::Error::Empty`]
    /// if it is empty, and otherwise the errors of [`Loader::load_library`].
    pub fn load_library_file(&self, name: &str, path: impl AsRef<Path>) -> Result<LibraryHandle> {
        let file = File::from_file(path.as_ref())?;
        self.load_library(name, file.data())
    }

    /// The first library registered as `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<LibraryHandle> {
        self.libraries
            .iter()
            .find(|(_, library)| library.name == name)
            .map(|(index, library)| LibraryHandle {
                index,
                library: library.clone(),
            })
    }

    /// The library at `index`, as reported by [`LibraryHandle::index`].
    #[must_use]
    pub fn library(&self, index: usize) -> Option<LibraryHandle> {
        self.libraries.get(index).map(|library| LibraryHandle {
            index,
            library: library.clone(),
        })
    }

    /// Absolute address of `function` in the library registered as `library`.
    ///
    /// A missing library or symbol is a lookup miss, not an error.
    #[must_use]
    pub fn find_proc(&self, library: &str, function: &str) -> Option<usize> {
        self.libraries
            .iter()
            .find(|(_, candidate)| candidate.name == library)
            .and_then(|(_, candidate)| candidate.find_proc(function))
    }

    /// Calls `function` of the library registered as `library` with `args`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ExportNotFound`] if the library or the symbol does not exist, and
    /// [`crate::Error::TooManyArguments`] for more than [`crate::dispatch::MAX_ARGUMENTS`]
    /// arguments. A platform error left behind by the call is reported in the [`Outcome`], not
    /// as an error.
    ///
    /// # Safety
    ///
    /// The export must be a function taking pointer-sized integer arguments in the platform's C
    /// calling convention, and `args` must be valid for it. See [`crate::dispatch::call`].
    pub unsafe fn call(&self, library: &str, function: &str, args: &[usize]) -> Result<Outcome> {
        let address = self
            .find_proc(library, function)
            .ok_or_else(|| Error::ExportNotFound(format!("{library}!{function}")))?;

        unsafe { dispatch::call(address, args) }
    }

    /// Iterates over the loaded libraries in load order.
    pub fn libraries(&self) -> impl Iterator<Item = &LibraryRc> {
        self.libraries.iter().map(|(_, library)| library)
    }

    /// Number of loaded libraries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.libraries.count()
    }

    /// Returns `true` if nothing was loaded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("config", &self.config)
            .field("libraries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_prefix() {
        assert_eq!(symbol_name(ImageFormat::MachO, "add"), "_add");
        assert_eq!(symbol_name(ImageFormat::MachO, "_add"), "_add");
        assert_eq!(symbol_name(ImageFormat::Elf, "add"), "add");
        assert_eq!(symbol_name(ImageFormat::Pe, "_add"), "_add");
    }

    #[test]
    fn empty_loader() {
        let loader = Loader::new();
        assert!(loader.is_empty());
        assert_eq!(loader.len(), 0);
        assert!(loader.get("missing").is_none());
        assert!(loader.library(0).is_none());
        assert!(loader.find_proc("missing", "f").is_none());
        assert_eq!(loader.libraries().count(), 0);
    }

    #[test]
    fn call_into_missing_library() {
        let loader = Loader::new();
        assert!(matches!(
            unsafe { loader.call("missing", "f", &[]) },
            Err(Error::ExportNotFound(_))
        ));
    }

    #[test]
    fn garbage_is_invalid_format() {
        let loader = Loader::new();
        assert!(matches!(
            loader.load_library("garbage", b"not a library at all"),
            Err(Error::InvalidFormat)
        ));
        assert!(matches!(
            loader.load_library("empty", &[]),
            Err(Error::InvalidFormat)
        ));
        assert!(loader.is_empty());
    }

    #[test]
    fn global_is_shared() {
        assert!(std::ptr::eq(Loader::global(), Loader::global()));
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    mod elf {
        use super::*;
        use crate::{image::Target, test::ElfBuilder};

        fn library() -> Vec<u8> {
            ElfBuilder::new(Target::host())
                .export("answer", &[0xC3])
                .export("add", &[0xC3])
                .build()
        }

        #[test]
        fn load_and_lookup() {
            let loader = Loader::new();
            let handle = loader.load_library("libtest.so", &library()).unwrap();

            assert_eq!(handle.name(), "libtest.so");
            assert_eq!(handle.format(), ImageFormat::Elf);
            assert_eq!(handle.exports().len(), 2);
            assert_eq!(
                handle.find_proc("answer"),
                Some(handle.base_address() + ElfBuilder::CODE_OFFSET)
            );
            assert_eq!(
                loader.find_proc("libtest.so", "add"),
                Some(handle.base_address() + ElfBuilder::CODE_OFFSET + 0x10)
            );

            assert_eq!(loader.len(), 1);
            assert_eq!(loader.get("libtest.so").unwrap().index(), handle.index());
            assert_eq!(
                loader.library(handle.index()).unwrap().base_address(),
                handle.base_address()
            );
        }

        #[test]
        fn first_registration_wins() {
            let loader = Loader::new();
            let first = loader.load_library("dup", &library()).unwrap();
            let second = loader.load_library("dup", &library()).unwrap();

            assert_ne!(first.base_address(), second.base_address());
            assert_eq!(loader.len(), 2);
            assert_eq!(loader.get("dup").unwrap().base_address(), first.base_address());
            assert_eq!(
                loader.find_proc("dup", "answer"),
                first.find_proc("answer")
            );
        }

        #[test]
        fn lookup_miss_is_repeatable() {
            let loader = Loader::new();
            loader.load_library("libtest.so", &library()).unwrap();

            for _ in 0..100 {
                assert_eq!(loader.find_proc("libtest.so", "missing"), None);
            }
            assert!(matches!(
                unsafe { loader.call("libtest.so", "missing", &[]) },
                Err(Error::ExportNotFound(_))
            ));
        }

        #[test]
        fn load_from_file() {
            use std::io::Write;

            let mut file = tempfile::NamedTempFile::new().unwrap();
            file.write_all(&library()).unwrap();

            let loader = Loader::new();
            let handle = loader.load_library_file("from-disk", file.path()).unwrap();
            assert_eq!(handle.exports().len(), 2);
        }

        #[test]
        fn concurrent_loads() {
            let loader = Loader::new();
            let image = library();

            std::thread::scope(|scope| {
                for thread in 0..8 {
                    let loader = &loader;
                    let image = &image;
                    scope.spawn(move || {
                        loader
                            .load_library(&format!("lib{thread}.so"), image)
                            .unwrap();
                    });
                }
            });

            assert_eq!(loader.len(), 8);
            for thread in 0..8 {
                assert!(loader.find_proc(&format!("lib{thread}.so"), "answer").is_some());
            }
        }
    }

    /// `mov eax, 42; ret`
    #[cfg(all(target_arch = "x86_64", any(windows, target_os = "macos")))]
    const ANSWER: [u8; 6] = [0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3];

    #[cfg(all(windows, target_arch = "x86_64"))]
    mod pe {
        use super::*;
        use crate::{image::Target, test::PeBuilder};

        fn library() -> Vec<u8> {
            PeBuilder::new(Target::host())
                .image_base(0x1_8000_0000)
                .export("answer", &ANSWER)
                .build()
        }

        #[test]
        fn load_and_call() {
            let loader = Loader::new();
            let handle = loader.load_library("test.dll", &library()).unwrap();

            assert_eq!(handle.format(), ImageFormat::Pe);
            assert_eq!(
                handle.find_proc("answer"),
                Some(handle.base_address() + PeBuilder::CODE_OFFSET)
            );

            let outcome = unsafe { loader.call("test.dll", "answer", &[]) }.unwrap();
            assert_eq!(outcome.value, 42);
        }

        #[test]
        fn load_and_call_direct() {
            let loader = Loader::with_config(LoaderConfig::direct());
            loader.load_library("test.dll", &library()).unwrap();

            let outcome = unsafe { loader.call("test.dll", "answer", &[]) }.unwrap();
            assert_eq!(outcome.value, 42);
        }
    }

    #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
    mod macho {
        use super::*;
        use crate::{image::Target, test::MachOBuilder};

        #[test]
        fn dlopen_round_trip() {
            let image = MachOBuilder::new(Target::host())
                .export("_answer", &ANSWER)
                .build();
            let loader =
                Loader::with_config(LoaderConfig::new().with_darwin_link(DarwinLink::Dlopen));
            let handle = loader.load_library("libtest.bundle", &image).unwrap();

            assert_eq!(handle.format(), ImageFormat::MachO);
            assert_eq!(
                handle.find_proc("answer"),
                Some(handle.base_address() + MachOBuilder::CODE_OFFSET)
            );

            let outcome = unsafe { loader.call("libtest.bundle", "answer", &[]) }.unwrap();
            assert_eq!(outcome.value, 42);
        }
    }
}
