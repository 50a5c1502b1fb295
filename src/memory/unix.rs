use std::{io, ptr};

use super::MemoryProtection;
use crate::{Error, Result};

fn last_error() -> Error {
    Error::AllocationFailed(io::Error::last_os_error().raw_os_error().unwrap_or(0))
}

pub(super) fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 0x1000,
    }
}

fn map(address: Option<usize>, size: usize, protection: MemoryProtection) -> Result<usize> {
    let hint = address.map_or(ptr::null_mut(), |address| address as *mut libc::c_void);
    let base = unsafe {
        libc::mmap(
            hint,
            size,
            protection.to_unix(),
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if base == libc::MAP_FAILED {
        return Err(last_error());
    }

    let base = base as usize;
    match address {
        // Without MAP_FIXED the address is only a hint; anything else means it was taken
        Some(address) if address != base => {
            release(base, size);
            Err(Error::AllocationFailed(libc::EEXIST))
        }
        _ => Ok(base),
    }
}

pub(super) fn reserve(address: Option<usize>, size: usize) -> Result<usize> {
    map(address, size, MemoryProtection::empty())
}

pub(super) fn commit(base: usize, size: usize, protection: MemoryProtection) -> Result<()> {
    protect(base, size, protection)
}

pub(super) fn allocate(size: usize, protection: MemoryProtection) -> Result<usize> {
    map(None, size, protection)
}

pub(super) fn protect(base: usize, size: usize, protection: MemoryProtection) -> Result<()> {
    if unsafe { libc::mprotect(base as *mut libc::c_void, size, protection.to_unix()) } != 0 {
        return Err(last_error());
    }
    Ok(())
}

pub(super) fn release(base: usize, size: usize) {
    if unsafe { libc::munmap(base as *mut libc::c_void, size) } != 0 {
        log::warn!(
            "munmap of 0x{:x} bytes at 0x{:x} failed: {}",
            size,
            base,
            io::Error::last_os_error()
        );
    }
}
