//! A small writer for ELF64 shared objects holding a handful of functions.
//!
//! The object is a single RWX `PT_LOAD` at virtual address zero with a `PT_DYNAMIC` segment
//! that points at `.dynsym`, `.dynstr` and a `DT_HASH` table. No section headers are written.

#![allow(dead_code)]

const EHSIZE: usize = 64;
const PHENTSIZE: usize = 56;
const SYMENT: usize = 24;
const DYNENT: usize = 16;

const TABLES: usize = 0x100;
const CODE: usize = 0x1000;
const FILE_SIZE: usize = 0x3000;

const ET_DYN: u16 = 3;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;
const EM_AARCH64: u16 = 183;

/// `mov eax, 42; ret` or `mov w0, #42; ret`
pub fn answer() -> Vec<u8> {
    if cfg!(target_arch = "aarch64") {
        words(&[0x5280_0540, 0xD65F_03C0])
    } else {
        vec![0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3]
    }
}

/// `lea rax, [rdi + rsi]; ret` or `add x0, x0, x1; ret`
pub fn add() -> Vec<u8> {
    if cfg!(target_arch = "aarch64") {
        words(&[0x8B01_0000, 0xD65F_03C0])
    } else {
        vec![0x48, 0x8D, 0x04, 0x37, 0xC3]
    }
}

/// Returns its 18th argument, the last one on the stack.
///
/// `mov rax, [rsp + 0x60]; ret` or `ldr x0, [sp, #72]; ret`
pub fn eighteenth() -> Vec<u8> {
    if cfg!(target_arch = "aarch64") {
        words(&[0xF940_27E0, 0xD65F_03C0])
    } else {
        vec![0x48, 0x8B, 0x44, 0x24, 0x60, 0xC3]
    }
}

fn words(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|word| word.to_le_bytes()).collect()
}

fn put(out: &mut [u8], offset: usize, bytes: &[u8]) {
    out[offset..offset + bytes.len()].copy_from_slice(bytes);
}

/// ELF64 shared object exporting `functions`.
pub struct SharedObject {
    e_type: u16,
    functions: Vec<(String, Vec<u8>)>,
}

impl SharedObject {
    pub fn new() -> Self {
        Self {
            e_type: ET_DYN,
            functions: Vec::new(),
        }
    }

    pub fn function(mut self, name: &str, code: Vec<u8>) -> Self {
        self.functions.push((name.to_string(), code));
        self
    }

    pub fn executable(mut self) -> Self {
        self.e_type = ET_EXEC;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = vec![0u8; FILE_SIZE];
        let machine = if cfg!(target_arch = "aarch64") {
            EM_AARCH64
        } else {
            EM_X86_64
        };

        let mut strtab = vec![0u8];
        let mut symbols = vec![(0u32, 0u64, 0u16)];
        let mut code = CODE;
        for (name, body) in &self.functions {
            put(&mut out, code, body);
            symbols.push((strtab.len() as u32, code as u64, 1));
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
            code = (code + body.len()).next_multiple_of(16);
        }
        assert!(code <= FILE_SIZE);

        let strtab_at = TABLES + symbols.len() * SYMENT;
        let hash_at = (strtab_at + strtab.len()).next_multiple_of(8);
        let dynamic_at = (hash_at + 12 + 4 * symbols.len()).next_multiple_of(8);
        let dynamic: [(u64, u64); 6] = [
            (4, hash_at as u64),
            (5, strtab_at as u64),
            (6, TABLES as u64),
            (10, strtab.len() as u64),
            (11, SYMENT as u64),
            (0, 0),
        ];
        assert!(dynamic_at + dynamic.len() * DYNENT <= CODE);

        // ELF header
        put(&mut out, 0, &[0x7F, b'E', b'L', b'F', 2, 1, 1]);
        put(&mut out, 16, &self.e_type.to_le_bytes());
        put(&mut out, 18, &machine.to_le_bytes());
        put(&mut out, 20, &1u32.to_le_bytes());
        put(&mut out, 32, &(EHSIZE as u64).to_le_bytes());
        put(&mut out, 52, &(EHSIZE as u16).to_le_bytes());
        put(&mut out, 54, &(PHENTSIZE as u16).to_le_bytes());
        put(&mut out, 56, &2u16.to_le_bytes());
        put(&mut out, 58, &64u16.to_le_bytes());

        // PT_LOAD covering the file, PT_DYNAMIC
        let segments = [
            (1u32, 7u32, 0usize, FILE_SIZE, 0x1000u64),
            (2, 6, dynamic_at, dynamic.len() * DYNENT, 8),
        ];
        for (index, (p_type, flags, start, size, align)) in segments.into_iter().enumerate() {
            let at = EHSIZE + index * PHENTSIZE;
            put(&mut out, at, &p_type.to_le_bytes());
            put(&mut out, at + 4, &flags.to_le_bytes());
            for (field, value) in [start, start, start, size, size].into_iter().enumerate() {
                put(&mut out, at + 8 + field * 8, &(value as u64).to_le_bytes());
            }
            put(&mut out, at + 48, &align.to_le_bytes());
        }

        for (index, (name, value, shndx)) in symbols.iter().enumerate() {
            let at = TABLES + index * SYMENT;
            put(&mut out, at, &name.to_le_bytes());
            out[at + 4] = if index == 0 { 0 } else { 0x12 };
            put(&mut out, at + 6, &shndx.to_le_bytes());
            put(&mut out, at + 8, &value.to_le_bytes());
        }
        put(&mut out, strtab_at, &strtab);

        put(&mut out, hash_at, &1u32.to_le_bytes());
        put(&mut out, hash_at + 4, &(symbols.len() as u32).to_le_bytes());

        for (index, (tag, value)) in dynamic.iter().enumerate() {
            let at = dynamic_at + index * DYNENT;
            put(&mut out, at, &tag.to_le_bytes());
            put(&mut out, at + 8, &value.to_le_bytes());
        }

        out
    }
}
