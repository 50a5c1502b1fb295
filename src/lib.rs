// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
// Unsafe code is confined to:
// - 'memory/{unix,windows}.rs' allocating, protecting and releasing arenas
// - 'memory/mod.rs' viewing an arena as a slice
// - 'file/physical.rs' memory-mapping a file, 'file/process.rs' reading process memory
// - 'dispatch' turning export addresses into function pointers
// - 'resolver/dyld.rs' calling into the Darwin host loader

//! # memload
//!
//! [![License](https://img.shields.io/badge/license-Apache--2.0-blue.svg)](https://www.apache.org/licenses/LICENSE-2.0)
//!
//! A cross-platform, in-memory loader for shared libraries. Given the raw bytes of a PE `.dll`,
//! ELF `.so` or Mach-O dylib built for the host, `memload` places the image in executable memory
//! without involving the operating system's loader, builds a table of its exports, and calls them
//! with any number of pointer-sized arguments up to [`dispatch::MAX_ARGUMENTS`].
//!
//! ## Features
//!
//! - **PE, ELF and Mach-O** - Header, section and export parsing built on `goblin`
//! - **Bounds-checked mapping** - Images are written into an [`memory::Arena`] through checked
//!   offsets only; PE base relocations are applied for any load address
//! - **Darwin host loader** - Mach-O images are linked through the loader's own entry points,
//!   found by a bounded scan of the address space
//! - **Uniform calls** - One call path for 0 to 18 arguments in the platform's C calling
//!   convention
//! - **Thread-safe registry** - Concurrent loads without external locking
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use memload::prelude::*;
//!
//! let image = std::fs::read("libtest.so")?;
//! let library = Loader::global().load_library("libtest.so", &image)?;
//! println!("{} exports at 0x{:x}", library.exports().len(), library.base_address());
//!
//! let outcome = unsafe { Loader::global().call("libtest.so", "add", &[2, 3]) }?;
//! assert_eq!(outcome.value, 5);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! Loading is a pipeline of four stages, each in its own module:
//!
//! 1. [`image`] - Recognizes the container, checks the target, and lists sections, exports and
//!    relocations
//! 2. [`mapper`] - Allocates memory, copies headers and sections, applies relocations
//! 3. [`resolver`] - Turns image-relative exports into absolute addresses; links Mach-O images
//!    on Darwin
//! 4. [`dispatch`] - Calls an export with a given argument list
//!
//! [`Loader`] composes them and keeps the loaded [`Library`] values.
//!
//! ## Error Handling
//!
//! Every fallible operation returns [`Result`]. Lookup misses are `None`, not errors. A write
//! outside a mapped image's memory is a broken invariant and panics instead of corrupting
//! neighbouring memory.
//!
//! ## Logging
//!
//! `memload` logs through the [`log`] facade and never installs a logger. Stages report at
//! `debug` level, per-section and per-candidate details at `trace`.

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types.
///
/// # Example
///
/// ```rust,no_run
/// use memload::prelude::*;
///
/// let loader = Loader::with_config(LoaderConfig::direct());
/// let library = loader.load_library_file("libtest.so", "libtest.so")?;
/// println!("{:?}", library.find_proc("add"));
/// # Ok::<(), memload::Error>(())
/// ```
pub mod prelude;

/// Image sources and bounds-checked byte access.
///
/// # Key Components
///
/// - [`File`] - An image read from disk (memory-mapped) or owned in memory
/// - [`file::Backend`] - Bounds-checked access to any byte source
/// - [`Parser`] - Cursor for sequential little-endian structures and ULEB128 values
pub mod file;

/// Image parsing for PE, ELF and Mach-O.
///
/// [`image::parse`] recognizes the container by its magic, verifies that the image targets the
/// running process, and returns an [`image::ParsedImage`]: total size, sections, exports and
/// base relocations, all relative to the image start.
///
/// # Examples
///
/// ```rust,no_run
/// let bytes = std::fs::read("libtest.so")?;
/// let image = memload::image::parse(&bytes)?;
///
/// for export in &image.exports {
///     println!("{} at +0x{:x}", export.name, export.offset);
/// }
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub mod image;

/// Executable memory: protection flags, page size and [`memory::Arena`].
pub mod memory;

/// Copying parsed images into an [`memory::Arena`] and applying base relocations.
pub mod mapper;

/// Export tables and, on Darwin, linking through the host loader.
pub mod resolver;

/// Calling exports with 0 to [`dispatch::MAX_ARGUMENTS`] pointer-sized arguments.
///
/// # Examples
///
/// ```rust
/// extern "system" fn add(a: usize, b: usize) -> usize {
///     a + b
/// }
///
/// let outcome = unsafe { memload::dispatch::call(add as usize, &[2, 3]) }?;
/// assert_eq!(outcome.value, 5);
/// # Ok::<(), memload::Error>(())
/// ```
pub mod dispatch;

mod loader;

/// `memload` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `memload` Error type
///
/// The main error type for all operations in this crate.
///
/// # Examples
///
/// ```rust,no_run
/// use memload::{Error, Loader};
///
/// match Loader::new().load_library_file("module", "module.bin") {
///     Ok(library) => println!("Loaded at 0x{:x}", library.base_address()),
///     Err(Error::InvalidFormat) => println!("Not a shared library"),
///     Err(Error::Malformed { message, .. }) => println!("Malformed: {}", message),
///     Err(e) => println!("Error: {}", e),
/// }
/// ```
pub use error::Error;

/// The loader registry and its configuration.
///
/// See [`Loader`] for loading, lookup and calls, and [`LoaderConfig`] for the allocation and
/// Darwin link knobs.
pub use loader::{
    AllocationStrategy, DarwinLink, HostLoaderScan, Library, LibraryHandle, LibraryRc, Loader,
    LoaderConfig,
};

/// The result of calling an export.
pub use dispatch::Outcome;

/// Export table of a loaded library.
pub use resolver::Exports;

/// Low-level file and memory parsing utilities.
pub use file::{parser::Parser, File};
