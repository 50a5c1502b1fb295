//! Calling exported functions.
//!
//! Every loaded export is called the same way: as a function taking some number of pointer-sized
//! integers and returning one, in the platform's C calling convention (`stdcall` on 32-bit
//! Windows). The arguments the caller supplies are placed in registers and on the stack by a
//! native call through a function pointer of the matching arity, so no per-ABI marshalling code
//! exists here. [`call`] only picks the invoker for the argument count.
//!
//! # Platform Errors
//!
//! Before the call, the thread's `errno` (or `GetLastError` value on Windows) is cleared; a
//! non-zero value afterwards is reported in [`Outcome::platform_error`]. This does not make the
//! call fail, since arbitrary native code may leave such a value behind on success.

mod errno;

use crate::{Error, Result};

/// Largest number of arguments a call can take.
pub const MAX_ARGUMENTS: usize = 18;

/// Invokes the function at an address with exactly as many arguments as the entry's arity.
type Invoker = unsafe fn(usize, &[usize]) -> usize;

macro_rules! usize_for {
    ($_index:tt) => {
        usize
    };
}

/// Generates one [`Invoker`] per argument list.
///
/// Each entry reinterprets the address as an `extern "system"` function taking the listed
/// argument indices and forwards `args` element by element.
///
/// # Example
/// ```rust,ignore
/// static TABLE: [Invoker; 3] = arity_table![[], [0], [0 1]];
/// ```
macro_rules! arity_table {
    ($([$($index:tt)*]),* $(,)?) => {
        [$(
            {
                unsafe fn invoke(address: usize, args: &[usize]) -> usize {
                    let function = unsafe {
                        std::mem::transmute::<usize, extern "system" fn($(usize_for!($index)),*) -> usize>(
                            address,
                        )
                    };
                    function($(args[$index]),*)
                }
                invoke as Invoker
            }
        ),*]
    };
}

/// Invokers indexed by argument count.
static ARITY: [Invoker; MAX_ARGUMENTS + 1] = arity_table![
    [],
    [0],
    [0 1],
    [0 1 2],
    [0 1 2 3],
    [0 1 2 3 4],
    [0 1 2 3 4 5],
    [0 1 2 3 4 5 6],
    [0 1 2 3 4 5 6 7],
    [0 1 2 3 4 5 6 7 8],
    [0 1 2 3 4 5 6 7 8 9],
    [0 1 2 3 4 5 6 7 8 9 10],
    [0 1 2 3 4 5 6 7 8 9 10 11],
    [0 1 2 3 4 5 6 7 8 9 10 11 12],
    [0 1 2 3 4 5 6 7 8 9 10 11 12 13],
    [0 1 2 3 4 5 6 7 8 9 10 11 12 13 14],
    [0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15],
    [0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16],
    [0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17],
];

/// Result of a native call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// The raw pointer-sized return value
    pub value: usize,
    /// The thread's `errno` or last-error value after the call, if non-zero
    pub platform_error: Option<i32>,
}

impl Outcome {
    /// Treats a reported platform error as a failed call.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Platform`] if the call left a platform error behind.
    pub fn into_result(self) -> Result<usize> {
        match self.platform_error {
            Some(code) => Err(Error::Platform(code)),
            None => Ok(self.value),
        }
    }
}

/// Calls the function at `address` with `args`.
///
/// # Errors
///
/// Returns [`crate::Error::TooManyArguments`] for more than [`MAX_ARGUMENTS`] arguments; nothing
/// is called in that case.
///
/// # Safety
///
/// `address` must be the entry point of a function that takes `args.len()` pointer-sized integer
/// arguments (or fewer) in the platform's C calling convention and returns a pointer-sized
/// integer or nothing. Whatever the function does with its arguments is the caller's
/// responsibility.
pub unsafe fn call(address: usize, args: &[usize]) -> Result<Outcome> {
    let Some(invoke) = ARITY.get(args.len()) else {
        return Err(Error::TooManyArguments {
            count: args.len(),
            max: MAX_ARGUMENTS,
        });
    };

    log::trace!("Calling 0x{:x} with {} arguments", address, args.len());

    errno::clear();
    let value = unsafe { invoke(address, args) };
    let platform_error = errno::get();

    Ok(Outcome {
        value,
        platform_error,
    })
}
