//! Linking Mach-O images through the Darwin host loader.
//!
//! Mach-O images are not mapped by hand. Two link mechanisms exist:
//!
//! - **ObjectFileImage**: `NSCreateObjectFileImageFromMemory` and `NSLinkModule`, taken from the
//!   host dynamic loader's own export trie. The loader image is found by scanning the address space
//!   for a 64-bit Mach-O header, bounded by [`HostLoaderScan`]. Every read from a candidate goes
//!   through a page-checked [`Process`] view, so a bogus header cannot fault the scan.
//! - **Dlopen**: from Darwin 16 onwards the object-file API is a thin wrapper around `dlopen`
//!   anyway, so the image is written to a private temporary file and opened directly.
//!
//! Either way the image is first rewritten to `MH_BUNDLE`, the only type both mechanisms accept,
//! and its code signature, if any, is re-hashed to match the rewritten header.

use std::{
    ffi::{c_char, c_void, CStr, CString},
    io::Write,
    os::unix::ffi::OsStrExt,
    ptr,
    sync::OnceLock,
};

use crate::{
    file::{is_mapped, Backend, Process},
    image::{macho, ParsedImage},
    loader::{DarwinLink, HostLoaderScan, LoaderConfig},
    memory::{Arena, MemoryProtection},
    resolver::Exports,
    Error, Result,
};

const CREATE_OBJECT_FILE_IMAGE: &str = "_NSCreateObjectFileImageFromMemory";
const LINK_MODULE: &str = "_NSLinkModule";

const NS_OBJECT_FILE_IMAGE_SUCCESS: i32 = 1;
const NS_LINK_MODULE_OPTION_BINDNOW: u32 = 0x1;
const NS_LINK_MODULE_OPTION_PRIVATE: u32 = 0x2;
const NS_LINK_MODULE_OPTION_RETURN_ON_ERROR: u32 = 0x4;

/// Number of pointer-sized fields of a linked module searched for its image header
const MODULE_SCAN_WORDS: usize = 64;
/// Upper bound for header and load command reads from a candidate loader image
const LOADER_VIEW_SIZE: usize = 0x0400_0000;
/// First Darwin release whose object-file API is built on `dlopen` (macOS 10.12)
const DLOPEN_DARWIN_RELEASE: u32 = 16;

type CreateObjectFileImageFromMemory =
    unsafe extern "C" fn(*const c_void, usize, *mut *mut c_void) -> i32;
type LinkModule = unsafe extern "C" fn(*mut c_void, *const c_char, u32) -> *mut c_void;

/// The host loader entry points needed for the object-file link.
#[derive(Clone, Copy)]
struct HostLoader {
    create: CreateObjectFileImageFromMemory,
    link: LinkModule,
}

static HOST_LOADER: OnceLock<HostLoader> = OnceLock::new();

/// An image linked by the host loader.
#[derive(Debug)]
pub(crate) struct Linked {
    /// Address of the image's Mach-O header
    pub base: usize,
    /// Absolute addresses of its exports
    pub exports: Exports,
}

/// Scans the address space for the image exporting both loader entry points.
fn find_host_loader(scan: &HostLoaderScan) -> Result<HostLoader> {
    let mut images_scanned = 0;
    let mut address = scan.start;

    for _ in 0..scan.max_candidates {
        if images_scanned >= scan.max_images {
            break;
        }

        if is_mapped(address) {
            // Loader images are never unmapped, and every read below checks its pages first
            let view = unsafe { Process::checked(address, LOADER_VIEW_SIZE) };
            if view.data_slice(0, 4).is_ok_and(macho::is_macho_64) {
                images_scanned += 1;
                log::trace!("Inspecting Mach-O image at 0x{:x}", address);

                if let Some(loader) = entry_points(&view) {
                    log::debug!(
                        "Host loader found at 0x{:x} after {} images",
                        address,
                        images_scanned
                    );
                    return Ok(loader);
                }
            }
        }

        let Some(next) = address.checked_add(scan.stride) else {
            break;
        };
        address = next;
    }

    Err(Error::HostLoaderNotFound { images_scanned })
}

fn entry_points(image: &Process) -> Option<HostLoader> {
    let exports = macho::loaded_exports(image).ok()?;
    let exports = Exports::resolve(&exports, image.base());

    let create = exports.get(CREATE_OBJECT_FILE_IMAGE)?;
    let link = exports.get(LINK_MODULE)?;

    // Both addresses come from the loader's own export trie
    unsafe {
        Some(HostLoader {
            create: std::mem::transmute::<usize, CreateObjectFileImageFromMemory>(create),
            link: std::mem::transmute::<usize, LinkModule>(link),
        })
    }
}

fn host_loader(scan: &HostLoaderScan) -> Result<HostLoader> {
    if let Some(loader) = HOST_LOADER.get() {
        return Ok(*loader);
    }

    let loader = find_host_loader(scan)?;
    Ok(*HOST_LOADER.get_or_init(|| loader))
}

/// Major Darwin kernel release, from `uname`.
fn darwin_release() -> Option<u32> {
    let mut name: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut name) } != 0 {
        return None;
    }

    let release = unsafe { CStr::from_ptr(name.release.as_ptr()) };
    release.to_str().ok()?.split('.').next()?.parse().ok()
}

fn mechanism(config: &LoaderConfig) -> DarwinLink {
    match config.darwin_link {
        DarwinLink::Auto => match darwin_release() {
            Some(release) if release >= DLOPEN_DARWIN_RELEASE => DarwinLink::Dlopen,
            _ => DarwinLink::ObjectFileImage,
        },
        link => link,
    }
}

/// Links `image` as a private bundle named `name`.
///
/// # Errors
///
/// Returns [`crate::Error::HostLoaderNotFound`] if the object-file entry points cannot be found,
/// and [`crate::Error::LinkFailed`] if the host loader rejects the image.
pub(crate) fn link(
    name: &str,
    parsed: &ParsedImage,
    image: &[u8],
    config: &LoaderConfig,
) -> Result<Linked> {
    let bundle = macho::force_bundle(&image[parsed.image_range.clone()])?;

    match mechanism(config) {
        DarwinLink::Dlopen => link_dlopen(parsed, &bundle),
        _ => link_object_file_image(name, parsed, &bundle, &config.host_loader_scan),
    }
}

fn link_object_file_image(
    name: &str,
    parsed: &ParsedImage,
    bundle: &[u8],
    scan: &HostLoaderScan,
) -> Result<Linked> {
    let loader = host_loader(scan)?;

    // The object file image takes ownership of page-aligned memory and frees it itself
    let mut buffer = Arena::allocate(bundle.len(), MemoryProtection::READ_WRITE)?;
    buffer.write(0, bundle);

    let mut object_file_image = ptr::null_mut();
    let status = unsafe {
        (loader.create)(
            buffer.base() as *const c_void,
            bundle.len(),
            &mut object_file_image,
        )
    };
    if status != NS_OBJECT_FILE_IMAGE_SUCCESS {
        return Err(Error::LinkFailed(format!(
            "NSCreateObjectFileImageFromMemory returned {status}"
        )));
    }
    std::mem::forget(buffer);

    let module_name = CString::new(name)
        .map_err(|_| Error::LinkFailed(format!("library name '{name}' contains a NUL byte")))?;
    let module = unsafe {
        (loader.link)(
            object_file_image,
            module_name.as_ptr(),
            NS_LINK_MODULE_OPTION_BINDNOW
                | NS_LINK_MODULE_OPTION_PRIVATE
                | NS_LINK_MODULE_OPTION_RETURN_ON_ERROR,
        )
    };
    if module.is_null() {
        return Err(Error::LinkFailed("NSLinkModule returned no module".to_string()));
    }

    let base = module_base(module as usize)
        .ok_or_else(|| Error::LinkFailed("linked image header not found".to_string()))?;

    let view = unsafe { Process::checked(base, parsed.total_size) };
    let exports = Exports::resolve(&macho::loaded_exports(&view)?, base);

    Ok(Linked { base, exports })
}

/// Finds the header of a freshly linked bundle among the fields of its module object.
fn module_base(module: usize) -> Option<usize> {
    const WORD: usize = std::mem::size_of::<usize>();
    let fields = unsafe { Process::checked(module, MODULE_SCAN_WORDS * WORD) };

    (0..MODULE_SCAN_WORDS).find_map(|index| {
        let field = fields.data_slice(index * WORD, WORD).ok()?;
        let candidate = usize::from_ne_bytes(field.try_into().ok()?);
        if candidate == 0 || candidate % 0x1000 != 0 || !is_mapped(candidate) {
            return None;
        }

        let header = unsafe { Process::checked(candidate, 16) };
        let header = header.data_slice(0, 16).ok()?;
        let filetype = u32::from_le_bytes(header[12..16].try_into().ok()?);
        let is_bundle = macho::is_macho_64(header) && filetype == goblin::mach::header::MH_BUNDLE;

        is_bundle.then_some(candidate)
    })
}

fn link_dlopen(parsed: &ParsedImage, bundle: &[u8]) -> Result<Linked> {
    let mut file = tempfile::Builder::new()
        .prefix(".")
        .suffix(".bundle")
        .tempfile()?;
    file.write_all(bundle)?;
    file.flush()?;

    let path = CString::new(file.path().as_os_str().as_bytes())
        .map_err(|_| Error::LinkFailed("temporary path contains a NUL byte".to_string()))?;
    let handle = unsafe {
        libc::dlopen(
            path.as_ptr(),
            libc::RTLD_NOW | libc::RTLD_LOCAL | libc::RTLD_NODELETE,
        )
    };
    // The host loader keeps its own mapping; the file is not needed past this point
    drop(file);

    if handle.is_null() {
        return Err(Error::LinkFailed(dlerror()));
    }

    let mut exports = Vec::with_capacity(parsed.exports.len());
    for export in &parsed.exports {
        let Ok(symbol) = CString::new(export.name.strip_prefix('_').unwrap_or(&export.name)) else {
            continue;
        };

        let address = unsafe { libc::dlsym(handle, symbol.as_ptr()) };
        if address.is_null() {
            log::warn!("dlsym could not find exported symbol '{}'", export.name);
            continue;
        }
        exports.push((export.name.clone(), address as usize));
    }

    let Some(&(_, first)) = exports.first() else {
        return Err(Error::LinkFailed(
            "image exports no symbol to locate it by".to_string(),
        ));
    };

    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    if unsafe { libc::dladdr(first as *const c_void, &mut info) } == 0 || info.dli_fbase.is_null() {
        return Err(Error::LinkFailed(dlerror()));
    }

    let base = info.dli_fbase as usize;
    log::debug!("dlopen placed bundle at 0x{:x}", base);

    Ok(Linked {
        base,
        exports: exports.into_iter().collect(),
    })
}

fn dlerror() -> String {
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        return "unknown dlopen error".to_string();
    }
    unsafe { CStr::from_ptr(message) }
        .to_string_lossy()
        .into_owned()
}
