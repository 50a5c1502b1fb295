//! Executable memory for mapped images.
//!
//! An [`Arena`] is a page-aligned block of process memory that holds exactly one mapped image.
//! It is only written through offset and length pairs that are checked against its size, so a
//! section or relocation pointing outside the image stops the load at the boundary instead of
//! corrupting neighbouring memory. Such a violation can only happen if image validation missed
//! something; it is a broken invariant and panics.
//!
//! # Allocation Strategies
//!
//! - **Staged** ([`Arena::reserve`], [`Arena::reserve_at`]): address space is reserved first, then
//!   committed read/write. The image is copied and relocated, and only then is the block switched
//!   to read/write/execute with [`Arena::protect`].
//! - **Direct** ([`Arena::allocate`]): a single request for memory with the final protection.
//!
//! On Windows these map to `VirtualAlloc` with `MEM_RESERVE` followed by `MEM_COMMIT`, or both at
//! once. On Unix, reserving is an inaccessible anonymous `mmap` that committing opens up with
//! `mprotect`.
//!
//! The block is returned to the operating system when the arena is dropped.

use std::{fmt, slice, sync::OnceLock};

use bitflags::bitflags;

use crate::{
    file::io::{read_le, write_le, ByteIO},
    image::align_up,
    Result,
};

#[cfg(unix)]
#[path = "unix.rs"]
mod sys;

#[cfg(windows)]
#[path = "windows.rs"]
mod sys;

bitflags! {
    /// Memory protection flags for an arena.
    ///
    /// Modeled after the Windows `PAGE_*` constants, which only know a fixed set of
    /// combinations. [`MemoryProtection::to_windows`] picks the closest one.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MemoryProtection: u32 {
        /// Region is readable.
        const READ = 0x01;
        /// Region is writable.
        const WRITE = 0x02;
        /// Region is executable.
        const EXECUTE = 0x04;
        /// Read and write access, used while an image is being copied.
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// Read and execute access.
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
        /// Read, write, and execute access, the final state of a mapped image.
        const READ_WRITE_EXECUTE = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

impl Default for MemoryProtection {
    fn default() -> Self {
        Self::READ_WRITE
    }
}

impl MemoryProtection {
    const PAGE_NOACCESS: u32 = 0x01;
    const PAGE_READONLY: u32 = 0x02;
    const PAGE_READWRITE: u32 = 0x04;
    const PAGE_EXECUTE: u32 = 0x10;
    const PAGE_EXECUTE_READ: u32 = 0x20;
    const PAGE_EXECUTE_READWRITE: u32 = 0x40;

    /// Converts `MemoryProtection` flags to a Windows PAGE_* constant.
    #[must_use]
    pub fn to_windows(self) -> u32 {
        let r = self.contains(Self::READ);
        let w = self.contains(Self::WRITE);
        let x = self.contains(Self::EXECUTE);

        match (r, w, x) {
            (false, false, false) => Self::PAGE_NOACCESS,
            (true, false, false) => Self::PAGE_READONLY,
            // READWRITE for both (r,w,!x) and unusual (!r,w,!x)
            (_, true, false) => Self::PAGE_READWRITE,
            (false, false, true) => Self::PAGE_EXECUTE,
            (true, false, true) => Self::PAGE_EXECUTE_READ,
            // EXECUTE_READWRITE for both (r,w,x) and unusual (!r,w,x)
            (_, true, true) => Self::PAGE_EXECUTE_READWRITE,
        }
    }

    /// Converts `MemoryProtection` flags to `PROT_*` bits for `mmap`/`mprotect`.
    #[cfg(unix)]
    #[must_use]
    pub fn to_unix(self) -> i32 {
        let mut prot = libc::PROT_NONE;
        if self.contains(Self::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Self::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Self::EXECUTE) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// The operating system's page size, queried once.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(sys::page_size)
}

/// A page-aligned block of memory holding one mapped image.
pub struct Arena {
    base: usize,
    size: usize,
    protection: MemoryProtection,
}

// The arena exclusively owns its block; shared access only ever reads.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    fn rounded(size: usize) -> Result<usize> {
        align_up(size.max(1), page_size()).ok_or(crate::Error::AllocationFailed(0))
    }

    /// Reserves and commits a read/write block anywhere in the address space.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::AllocationFailed`] with the OS error code.
    pub fn reserve(size: usize) -> Result<Arena> {
        Self::staged(None, size)
    }

    /// Reserves and commits a read/write block at exactly `address`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::AllocationFailed`] if the range is not available.
    pub fn reserve_at(address: usize, size: usize) -> Result<Arena> {
        Self::staged(Some(address), size)
    }

    fn staged(address: Option<usize>, size: usize) -> Result<Arena> {
        let size = Self::rounded(size)?;
        let base = sys::reserve(address, size)?;
        let mut arena = Arena {
            base,
            size,
            protection: MemoryProtection::empty(),
        };

        // Dropping the arena on failure releases the reservation
        sys::commit(base, size, MemoryProtection::READ_WRITE)?;
        arena.protection = MemoryProtection::READ_WRITE;

        log::debug!("Reserved 0x{:x} bytes at 0x{:x}", size, base);
        Ok(arena)
    }

    /// Allocates a block with its final protection in a single request.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::AllocationFailed`] with the OS error code.
    pub fn allocate(size: usize, protection: MemoryProtection) -> Result<Arena> {
        let size = Self::rounded(size)?;
        let base = sys::allocate(size, protection)?;

        log::debug!(
            "Allocated 0x{:x} bytes at 0x{:x} ({:?})",
            size,
            base,
            protection
        );
        Ok(Arena {
            base,
            size,
            protection,
        })
    }

    /// Changes the protection of the whole block.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::AllocationFailed`] with the OS error code.
    pub fn protect(&mut self, protection: MemoryProtection) -> Result<()> {
        if protection != self.protection {
            sys::protect(self.base, self.size, protection)?;
            self.protection = protection;
        }
        Ok(())
    }

    /// Address of the first byte.
    #[must_use]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Size of the block in bytes, a multiple of the page size.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current protection.
    #[must_use]
    pub fn protection(&self) -> MemoryProtection {
        self.protection
    }

    /// The contents of the block.
    ///
    /// # Panics
    ///
    /// Panics if the block is not readable.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        assert!(
            self.protection.contains(MemoryProtection::READ),
            "Arena at 0x{:x} is not readable",
            self.base
        );
        // The block is mapped and readable for the lifetime of `self`
        unsafe { slice::from_raw_parts(self.base as *const u8, self.size) }
    }

    fn range_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        assert!(
            self.protection.contains(MemoryProtection::WRITE),
            "Arena at 0x{:x} is not writable",
            self.base
        );

        let end = match offset.checked_add(len) {
            Some(end) if end <= self.size => end,
            _ => panic!(
                "Write of 0x{:x} bytes at offset 0x{:x} outside arena of 0x{:x} bytes",
                len, offset, self.size
            ),
        };

        // The block is mapped and writable, and `&mut self` makes this the only view
        let block = unsafe { slice::from_raw_parts_mut(self.base as *mut u8, self.size) };
        &mut block[offset..end]
    }

    /// Copies `bytes` to `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the destination range is not entirely inside the block, or the block is not
    /// writable.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) {
        self.range_mut(offset, bytes.len()).copy_from_slice(bytes);
    }

    /// Reads a little-endian value at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the value is not entirely inside the block.
    #[must_use]
    pub fn read_value<T: ByteIO>(&self, offset: usize) -> T {
        let data = self.as_slice();
        match data.get(offset..).map(read_le::<T>) {
            Some(Ok(value)) => value,
            _ => panic!(
                "Read of {} bytes at offset 0x{:x} outside arena of 0x{:x} bytes",
                std::mem::size_of::<T>(),
                offset,
                self.size
            ),
        }
    }

    /// Writes a little-endian value at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the value is not entirely inside the block, or the block is not writable.
    pub fn write_value<T: ByteIO>(&mut self, offset: usize, value: T) {
        let target = self.range_mut(offset, std::mem::size_of::<T>());
        if write_le(target, value).is_err() {
            unreachable!("Destination has exactly the size of the value");
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        log::trace!("Releasing 0x{:x} bytes at 0x{:x}", self.size, self.base);
        sys::release(self.base, self.size);
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("base", &format_args!("0x{:x}", self.base))
            .field("size", &format_args!("0x{:x}", self.size))
            .field("protection", &self.protection)
            .finish()
    }
}
