//! Export resolution.
//!
//! Turns the image-relative export list of a [`ParsedImage`] into absolute addresses once the
//! image has a base. On Darwin the [`dyld`] submodule additionally finds the host dynamic loader
//! in memory and uses it to link Mach-O images.

#[cfg(target_os = "macos")]
pub(crate) mod dyld;

use std::collections::{hash_map, HashMap};

use crate::image::Export;

/// Name to absolute address table of one loaded library.
///
/// The table holds exactly the symbols the image reports as exported. If the same name is
/// reported more than once, the last record wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exports {
    symbols: HashMap<String, usize>,
}

impl Exports {
    /// Builds the table for an image loaded at `base`.
    #[must_use]
    pub fn resolve(exports: &[Export], base: usize) -> Exports {
        let symbols = exports
            .iter()
            .map(|export| (export.name.clone(), base.wrapping_add(export.offset)))
            .collect::<HashMap<_, _>>();

        log::debug!(
            "Resolved {} exports against base 0x{:x}",
            symbols.len(),
            base
        );
        Exports { symbols }
    }

    /// Absolute address of `name`, if exported.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<usize> {
        self.symbols.get(name).copied()
    }

    /// Returns `true` if `name` is exported.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.symbols.contains_key(name)
    }

    /// Number of exported symbols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Returns `true` if the library exports nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Iterates over `(name, address)` pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.symbols.iter().map(|(name, &address)| (name.as_str(), address))
    }
}

impl FromIterator<(String, usize)> for Exports {
    fn from_iter<I: IntoIterator<Item = (String, usize)>>(iter: I) -> Self {
        Exports {
            symbols: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Exports {
    type Item = (&'a String, &'a usize);
    type IntoIter = hash_map::Iter<'a, String, usize>;

    fn into_iter(self) -> Self::IntoIter {
        self.symbols.iter()
    }
}
