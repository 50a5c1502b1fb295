//! # memload Prelude
//!
//! This module provides a convenient prelude for the most commonly used types from the memload
//! library. Import it to get quick access to loading, lookups and calls.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all memload operations
pub use crate::Error;

/// The result type used throughout memload
pub use crate::Result;

// ================================================================================================
// Loading
// ================================================================================================

/// The registry of loaded libraries and the values it hands out
pub use crate::{Library, LibraryHandle, Loader};

/// Loader configuration
pub use crate::{AllocationStrategy, DarwinLink, HostLoaderScan, LoaderConfig};

// ================================================================================================
// Images
// ================================================================================================

/// Container format, target and parser output
pub use crate::image::{Architecture, Bitness, Export, ImageFormat, ParsedImage, Target};

// ================================================================================================
// Exports and Calls
// ================================================================================================

/// Name to address table of a loaded library
pub use crate::Exports;

/// Raw call result and the arity ceiling
pub use crate::dispatch::{Outcome, MAX_ARGUMENTS};
