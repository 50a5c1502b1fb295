use super::Backend;
use crate::Result;

/// A backend that reads the memory of the running process, starting at a fixed address.
///
/// Used to inspect images that some other loader already placed in memory (the Darwin host
/// loader and the libraries it manages). The window has no natural end, so the caller
/// supplies an upper bound that every access is checked against.
///
/// Views created with [`Process::checked`] additionally confirm that every page a read touches
/// is mapped before handing out a slice, which makes them usable on addresses that were only
/// guessed.
#[derive(Debug, Clone, Copy)]
pub struct Process {
    base: usize,
    len: usize,
    #[cfg(unix)]
    checked: bool,
}

impl Process {
    /// Creates a view of `len` bytes of process memory starting at `base`.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that every byte the view is asked for (through
    /// [`Backend::data_slice`]) is mapped and readable for as long as the returned slices are
    /// alive. The constructor itself does not touch memory.
    #[must_use]
    pub unsafe fn new(base: usize, len: usize) -> Process {
        let len = len.min(usize::MAX - base);
        Process {
            base,
            len,
            #[cfg(unix)]
            checked: false,
        }
    }

    /// Creates a view of at most `len` bytes at `base` whose reads fail with
    /// [`crate::Error::OutOfBounds`] when they touch an unmapped page.
    ///
    /// # Safety
    ///
    /// Pages found mapped by a read must stay mapped for as long as the slices it returned are
    /// alive.
    #[cfg(unix)]
    #[must_use]
    pub unsafe fn checked(base: usize, len: usize) -> Process {
        Process {
            checked: true,
            ..Process::new(base, len)
        }
    }

    /// The address the view starts at.
    #[must_use]
    pub fn base(&self) -> usize {
        self.base
    }

    #[cfg(unix)]
    fn pages_mapped(&self, start: usize, end: usize) -> bool {
        if !self.checked || start == end {
            return true;
        }

        let page = crate::memory::page_size();
        let mut address = start & !(page - 1);
        while address < end {
            if !is_mapped(address) {
                return false;
            }
            let Some(next) = address.checked_add(page) else {
                break;
            };
            address = next;
        }
        true
    }

    #[cfg(not(unix))]
    fn pages_mapped(&self, _start: usize, _end: usize) -> bool {
        true
    }
}

/// Returns `true` if the page holding `address` is mapped and readable.
///
/// `access` fails with `EFAULT` only when the path pointer itself is unreadable, so the check
/// cannot crash the process.
#[cfg(unix)]
#[must_use]
pub fn is_mapped(address: usize) -> bool {
    let result = unsafe { libc::access(address as *const std::ffi::c_char, libc::F_OK) };
    result == 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::EFAULT)
}

impl Backend for Process {
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let Some(offset_end) = offset.checked_add(len) else {
            return Err(out_of_bounds_error!());
        };

        if offset_end > self.len {
            return Err(out_of_bounds_error!());
        }

        if !self.pages_mapped(self.base + offset, self.base + offset_end) {
            return Err(out_of_bounds_error!());
        }

        // Unchecked views rely on the constructor's contract, checked ones on the page test
        Ok(unsafe { std::slice::from_raw_parts((self.base + offset) as *const u8, len) })
    }

    fn len(&self) -> usize {
        self.len
    }
}
