use thiserror::Error;

use crate::image::Target;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! out_of_bounds_error {
    () => {
        crate::Error::OutOfBounds {
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Parsing and mapping errors abort a whole [`crate::Loader::load_library`] call; there is no
/// partially loaded state visible to the caller. Symbol lookup misses are not errors at all, they
/// are reported as `None` by [`crate::Loader::find_proc`]. [`Error::ExportNotFound`] only appears
/// when a call is requested for a symbol that does not exist.
///
/// # Error Categories
///
/// ## Image Errors
/// - [`Error::InvalidFormat`] - The buffer is not a PE, ELF or Mach-O image
/// - [`Error::ArchitectureMismatch`] - The image was built for another architecture or bitness
/// - [`Error::UnsupportedBinaryType`] - The container is known, but the subtype cannot be loaded
/// - [`Error::Malformed`] - Corrupted or inconsistent header structures
/// - [`Error::OutOfBounds`] - A structure points outside the provided buffer
/// - [`Error::Empty`] - Empty input provided
/// - [`Error::GoblinErr`] - Errors reported by the `goblin` header parsers
///
/// ## Mapping and Linking Errors
/// - [`Error::AllocationFailed`] - The OS refused to reserve, commit or protect memory
/// - [`Error::HostLoaderNotFound`] - The bounded Darwin host-loader scan came up empty
/// - [`Error::LinkFailed`] - The Darwin host loader rejected the image
///
/// ## Call Errors
/// - [`Error::ExportNotFound`] - The requested symbol is not exported by the library
/// - [`Error::TooManyArguments`] - More arguments than the dispatcher can marshal
/// - [`Error::Platform`] - The native call mechanism reported an OS error code
///
/// # Examples
///
/// ```rust,no_run
/// use memload::{Error, Loader};
///
/// let image = std::fs::read("libtest.so")?;
/// match Loader::global().load_library("libtest.so", &image) {
///     Ok(_) => println!("loaded"),
///     Err(Error::ArchitectureMismatch { expected, found }) => {
///         eprintln!("built for {found}, this process is {expected}");
///     }
///     Err(Error::UnsupportedBinaryType(reason)) => eprintln!("cannot load: {reason}"),
///     Err(e) => eprintln!("other error: {e}"),
/// }
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The byte buffer's magic did not match any supported container format.
    #[error("Image is not a PE, ELF or Mach-O file")]
    InvalidFormat,

    /// The image was built for a different architecture or bitness than the host process.
    ///
    /// # Fields
    ///
    /// * `expected` - The target of the running process
    /// * `found` - The target the image declares
    #[error("Image targets {found}, but this process is {expected}")]
    ArchitectureMismatch {
        /// Target of the running process
        expected: Target,
        /// Target declared by the image
        found: Target,
    },

    /// The container was recognized, but this specific subtype cannot be loaded.
    ///
    /// Examples are non-PIE ELF executables (`ET_EXEC`), Mach-O main executables, and PE
    /// images with stripped relocations that could not be placed at their preferred base.
    #[error("Unsupported binary type - {0}")]
    UnsupportedBinaryType(String),

    /// The operating system refused to reserve, commit or protect memory.
    ///
    /// The associated value is the raw OS error code (`errno` or `GetLastError`).
    #[error("Memory allocation failed - os error {0}")]
    AllocationFailed(i32),

    /// The bounded scan for the host dynamic loader did not find an image exporting both
    /// required entry points.
    #[error("Host dynamic loader not found after scanning {images_scanned} images")]
    HostLoaderNotFound {
        /// Number of Mach-O images inspected before giving up
        images_scanned: usize,
    },

    /// The host dynamic loader rejected the image during the link step.
    #[error("Host loader failed to link image - {0}")]
    LinkFailed(String),

    /// The requested export does not exist in the library.
    #[error("Export not found - {0}")]
    ExportNotFound(String),

    /// The call requested more arguments than the dispatcher can place.
    #[error("Too many arguments - {count} given, at most {max} supported")]
    TooManyArguments {
        /// Number of arguments supplied
        count: usize,
        /// Largest supported arity
        max: usize,
    },

    /// The native call mechanism reported an OS-level error code.
    ///
    /// This is only produced by [`crate::dispatch::Outcome::into_result`]; a raw call never
    /// fails because `errno` or the thread's last error happened to be set.
    #[error("Platform error {0}")]
    Platform(i32),

    /// The file is damaged and could not be parsed.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing the image.
    #[error("Out of Bound read would have occurred! - {file}:{line}")]
    OutOfBounds {
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Error from the goblin crate during PE/ELF/Mach-O parsing.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),
}
