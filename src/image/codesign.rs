//! Ad-hoc code signatures of Mach-O images.
//!
//! The linker signs every arm64 image ad hoc, and the kernel refuses to map a signed page whose
//! hash does not match the code directory. Rewriting the header for the host loader (see
//! [`crate::image::macho::force_bundle`]) changes the first page, so the code directories are
//! re-hashed afterwards. A CMS signature cannot be reproduced once the code directory changed;
//! its blob is emptied and the code directories are marked ad hoc instead.
//!
//! The signature lives at the end of `__LINKEDIT`, located by `LC_CODE_SIGNATURE`. Unlike the
//! rest of the image it is big-endian:
//!
//! ```text
//! SuperBlob      u32 magic (0xfade0cc0), u32 length, u32 count, {u32 slot, u32 offset}[count]
//! CodeDirectory  u32 magic (0xfade0c02), u32 length, u32 version, u32 flags, u32 hashOffset,
//!                u32 identOffset, u32 nSpecialSlots, u32 nCodeSlots, u32 codeLimit,
//!                u8 hashSize, u8 hashType, u8 platform, u8 pageSize (log2), ...
//!                u64 codeLimit64 at 0x38 from version 0x20300 on
//! ```
//!
//! Code slot `i` holds the digest of `image[i << pageSize..min((i + 1) << pageSize, codeLimit)]`,
//! truncated to `hashSize` bytes.

use std::ops::Range;

use goblin::mach::{
    header::{MH_MAGIC, MH_MAGIC_64},
    load_command::LC_CODE_SIGNATURE,
};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384};

use crate::{
    file::io::{read_be_at, read_le_at, write_be_at},
    Error, Result,
};

const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xFADE_0CC0;
const CSMAGIC_CODEDIRECTORY: u32 = 0xFADE_0C02;
const CSMAGIC_BLOBWRAPPER: u32 = 0xFADE_0B01;
const CSSLOT_SIGNATURESLOT: u32 = 0x10000;
const CS_ADHOC: u32 = 0x2;
const CS_SUPPORTSCODELIMIT64: u32 = 0x20300;
const CODE_LIMIT_64_OFFSET: usize = 0x38;
const BLOB_HEADER_SIZE: u32 = 8;

/// Digest algorithm of a code directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashType {
    /// SHA-1, 20 bytes
    Sha1,
    /// SHA-256, 32 bytes
    Sha256,
    /// SHA-256 truncated to 20 bytes
    Sha256Truncated,
    /// SHA-384, 48 bytes
    Sha384,
}

impl HashType {
    /// Decodes the `hashType` field of a code directory.
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<HashType> {
        match raw {
            1 => Some(HashType::Sha1),
            2 => Some(HashType::Sha256),
            3 => Some(HashType::Sha256Truncated),
            4 => Some(HashType::Sha384),
            _ => None,
        }
    }

    /// The `hashType` field value.
    #[must_use]
    pub fn raw(self) -> u8 {
        match self {
            HashType::Sha1 => 1,
            HashType::Sha256 => 2,
            HashType::Sha256Truncated => 3,
            HashType::Sha384 => 4,
        }
    }

    /// Number of digest bytes stored per slot.
    #[must_use]
    pub fn size(self) -> usize {
        match self {
            HashType::Sha1 | HashType::Sha256Truncated => 20,
            HashType::Sha256 => 32,
            HashType::Sha384 => 48,
        }
    }

    /// Digest of `data`, truncated to [`HashType::size`] bytes.
    #[must_use]
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        let mut digest = match self {
            HashType::Sha1 => Sha1::digest(data).to_vec(),
            HashType::Sha256 | HashType::Sha256Truncated => Sha256::digest(data).to_vec(),
            HashType::Sha384 => Sha384::digest(data).to_vec(),
        };
        digest.truncate(self.size());
        digest
    }
}

/// File range of the code signature of a thin Mach-O image, if it has one.
fn signature_range(image: &[u8]) -> Result<Option<Range<usize>>> {
    let mut offset = 0;
    let header_size: usize = match read_le_at::<u32>(image, &mut offset)? {
        MH_MAGIC_64 => 32,
        MH_MAGIC => 28,
        _ => return Err(Error::InvalidFormat),
    };

    let mut offset = 16;
    let ncmds = read_le_at::<u32>(image, &mut offset)?;
    let sizeofcmds = read_le_at::<u32>(image, &mut offset)? as usize;
    let Some(commands) = header_size
        .checked_add(sizeofcmds)
        .and_then(|end| image.get(header_size..end))
    else {
        return Err(out_of_bounds_error!());
    };

    let mut start = 0;
    for _ in 0..ncmds {
        let mut field = start;
        let cmd = read_le_at::<u32>(commands, &mut field)?;
        let cmdsize = read_le_at::<u32>(commands, &mut field)? as usize;
        if cmdsize < 8 {
            return Err(malformed_error!(
                "Load command 0x{:x} at 0x{:x} has invalid size 0x{:x}",
                cmd,
                start,
                cmdsize
            ));
        }

        if cmd == LC_CODE_SIGNATURE {
            let dataoff = read_le_at::<u32>(commands, &mut field)? as usize;
            let datasize = read_le_at::<u32>(commands, &mut field)? as usize;
            return match dataoff.checked_add(datasize) {
                Some(end) if end <= image.len() => Ok(Some(dataoff..end)),
                _ => Err(malformed_error!(
                    "Code signature at 0x{:x} with size 0x{:x} lies outside the image",
                    dataoff,
                    datasize
                )),
            };
        }

        start += cmdsize;
        if start >= commands.len() {
            break;
        }
    }

    Ok(None)
}

/// Recomputes the code-page hashes of every code directory in `image`.
///
/// Returns `false`, leaving `image` untouched, if it carries no code signature. A CMS signature
/// is emptied and every code directory gains the ad-hoc flag.
///
/// # Errors
///
/// Returns [`crate::Error::InvalidFormat`] if `image` is not a thin little-endian Mach-O image,
/// and [`crate::Error::Malformed`] or [`crate::Error::OutOfBounds`] if the signature is damaged
/// or uses an unknown hash type.
pub fn rehash(image: &mut [u8]) -> Result<bool> {
    let Some(range) = signature_range(image)? else {
        return Ok(false);
    };

    let (code, rest) = image.split_at_mut(range.start);
    let code = &*code;
    let signature = &mut rest[..range.len()];

    let mut offset = 0;
    let magic = read_be_at::<u32>(signature, &mut offset)?;
    if magic != CSMAGIC_EMBEDDED_SIGNATURE {
        return Err(malformed_error!(
            "Code signature has magic 0x{:x}, expected an embedded signature",
            magic
        ));
    }
    offset += 4;
    let count = read_be_at::<u32>(signature, &mut offset)?;

    let mut directories = Vec::new();
    let mut cms = None;
    for _ in 0..count {
        let slot = read_be_at::<u32>(signature, &mut offset)?;
        let blob = read_be_at::<u32>(signature, &mut offset)? as usize;

        let mut field = blob;
        let blob_magic = read_be_at::<u32>(signature, &mut field)?;
        let length = read_be_at::<u32>(signature, &mut field)? as usize;
        let Some(blob_range) = blob
            .checked_add(length)
            .filter(|&end| end <= signature.len())
            .map(|end| blob..end)
        else {
            return Err(malformed_error!(
                "Signature blob in slot 0x{:x} overruns the signature",
                slot
            ));
        };

        match blob_magic {
            CSMAGIC_CODEDIRECTORY => directories.push(blob_range),
            CSMAGIC_BLOBWRAPPER if slot == CSSLOT_SIGNATURESLOT => cms = Some(blob_range),
            _ => {}
        }
    }

    if directories.is_empty() {
        return Err(malformed_error!("Code signature holds no code directory"));
    }

    let drop_cms = cms
        .as_ref()
        .is_some_and(|blob| blob.len() > BLOB_HEADER_SIZE as usize);
    if let Some(blob) = cms.filter(|_| drop_cms) {
        log::debug!("Replacing the CMS signature with an ad-hoc one");
        let mut field = blob.start + 4;
        write_be_at(signature, &mut field, BLOB_HEADER_SIZE)?;
    }

    for directory in directories {
        rehash_directory(&mut signature[directory], code, drop_cms)?;
    }

    Ok(true)
}

fn rehash_directory(directory: &mut [u8], code: &[u8], ad_hoc: bool) -> Result<()> {
    let mut offset = 8;
    let version = read_be_at::<u32>(directory, &mut offset)?;
    let flags_offset = offset;
    let flags = read_be_at::<u32>(directory, &mut offset)?;
    let hash_offset = read_be_at::<u32>(directory, &mut offset)? as usize;
    offset += 8;
    let code_slots = read_be_at::<u32>(directory, &mut offset)? as usize;
    let code_limit_32 = read_be_at::<u32>(directory, &mut offset)?;
    let hash_size = read_be_at::<u8>(directory, &mut offset)? as usize;
    let raw_type = read_be_at::<u8>(directory, &mut offset)?;
    offset += 1;
    let page_shift = read_be_at::<u8>(directory, &mut offset)?;

    let mut code_limit = u64::from(code_limit_32);
    if version >= CS_SUPPORTSCODELIMIT64 {
        let mut field = CODE_LIMIT_64_OFFSET;
        code_limit = match read_be_at::<u64>(directory, &mut field)? {
            0 => code_limit,
            limit => limit,
        };
    }

    let Some(kind) = HashType::from_raw(raw_type).filter(|kind| kind.size() == hash_size) else {
        return Err(malformed_error!(
            "Code directory uses hash type {} with size {}",
            raw_type,
            hash_size
        ));
    };

    let Some(code_limit) = usize::try_from(code_limit)
        .ok()
        .filter(|&limit| limit <= code.len())
    else {
        return Err(malformed_error!(
            "Code limit 0x{:x} reaches into the signature at 0x{:x}",
            code_limit,
            code.len()
        ));
    };

    // A page shift of zero means the whole code range is a single page
    let page_size = match page_shift {
        0 => code_limit.max(1),
        shift => match 1usize.checked_shl(u32::from(shift)) {
            Some(size) => size,
            None => return Err(malformed_error!("Code page shift {} is too large", shift)),
        },
    };

    if code_slots != code_limit.div_ceil(page_size) {
        return Err(malformed_error!(
            "Code directory has {} code slots for 0x{:x} bytes in 0x{:x} byte pages",
            code_slots,
            code_limit,
            page_size
        ));
    }

    for (index, page) in code[..code_limit].chunks(page_size).enumerate() {
        let Some(slot) = index
            .checked_mul(hash_size)
            .and_then(|slot| slot.checked_add(hash_offset))
            .and_then(|start| Some(start..start.checked_add(hash_size)?))
            .and_then(|slot| directory.get_mut(slot))
        else {
            return Err(out_of_bounds_error!());
        };
        slot.copy_from_slice(&kind.digest(page));
    }

    if ad_hoc {
        let mut field = flags_offset;
        write_be_at(directory, &mut field, flags | CS_ADHOC)?;
    }

    log::trace!(
        "Rehashed {} code pages with {:?}, version 0x{:x}",
        code_slots,
        kind,
        version
    );

    Ok(())
}
