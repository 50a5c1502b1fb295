use std::{ffi::c_void, ptr};

use windows_sys::Win32::{
    Foundation::GetLastError,
    System::{
        Memory::{VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE},
        SystemInformation::{GetSystemInfo, SYSTEM_INFO},
    },
};

use super::MemoryProtection;
use crate::{Error, Result};

fn last_error() -> Error {
    Error::AllocationFailed(unsafe { GetLastError() } as i32)
}

pub(super) fn page_size() -> usize {
    let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
    unsafe { GetSystemInfo(&mut info) };
    match info.dwPageSize {
        0 => 0x1000,
        size => size as usize,
    }
}

fn virtual_alloc(
    address: Option<usize>,
    size: usize,
    allocation_type: u32,
    protection: MemoryProtection,
) -> Result<usize> {
    let address = address.map_or(ptr::null(), |address| address as *const c_void);
    let base = unsafe { VirtualAlloc(address, size, allocation_type, protection.to_windows()) };
    if base.is_null() {
        return Err(last_error());
    }
    Ok(base as usize)
}

pub(super) fn reserve(address: Option<usize>, size: usize) -> Result<usize> {
    virtual_alloc(address, size, MEM_RESERVE, MemoryProtection::READ_WRITE)
}

pub(super) fn commit(base: usize, size: usize, protection: MemoryProtection) -> Result<()> {
    virtual_alloc(Some(base), size, MEM_COMMIT, protection).map(|_| ())
}

pub(super) fn allocate(size: usize, protection: MemoryProtection) -> Result<usize> {
    virtual_alloc(None, size, MEM_RESERVE | MEM_COMMIT, protection)
}

pub(super) fn protect(base: usize, size: usize, protection: MemoryProtection) -> Result<()> {
    let mut old = 0;
    if unsafe { VirtualProtect(base as *const c_void, size, protection.to_windows(), &mut old) } == 0
    {
        return Err(last_error());
    }
    Ok(())
}

pub(super) fn release(base: usize, _size: usize) {
    // MEM_RELEASE requires a size of zero and frees the whole reservation
    if unsafe { VirtualFree(base as *mut c_void, 0, MEM_RELEASE) } == 0 {
        log::warn!(
            "VirtualFree at 0x{:x} failed with error {}",
            base,
            unsafe { GetLastError() }
        );
    }
}
