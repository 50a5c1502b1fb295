//! The calling thread's platform error slot.

#[cfg(unix)]
fn location() -> *mut libc::c_int {
    #[cfg(any(target_os = "linux", target_os = "emscripten", target_os = "redox"))]
    let location = unsafe { libc::__errno_location() };

    #[cfg(any(target_os = "android", target_os = "netbsd", target_os = "openbsd"))]
    let location = unsafe { libc::__errno() };

    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly"
    ))]
    let location = unsafe { libc::__error() };

    location
}

/// Resets `errno` to zero.
#[cfg(unix)]
pub(super) fn clear() {
    unsafe { *location() = 0 };
}

/// The current `errno`, if non-zero.
#[cfg(unix)]
pub(super) fn get() -> Option<i32> {
    match unsafe { *location() } {
        0 => None,
        code => Some(code),
    }
}

/// Resets the thread's last-error value to zero.
#[cfg(windows)]
pub(super) fn clear() {
    unsafe { windows_sys::Win32::Foundation::SetLastError(0) };
}

/// The thread's last-error value, if non-zero.
#[cfg(windows)]
pub(super) fn get() -> Option<i32> {
    match unsafe { windows_sys::Win32::Foundation::GetLastError() } {
        0 => None,
        code => Some(code as i32),
    }
}
