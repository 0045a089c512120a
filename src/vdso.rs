//! Symbol lookup in the vDSO the kernel maps into every process.
//!
//! The image is located through the auxiliary vector (`AT_SYSINFO_EHDR`)
//! and its extent through `/proc/self/maps`. Lookups walk the dynamic
//! symbol table the same way the dynamic linker would, without relying on
//! the C library having bound anything for us.

use std::{fmt, sync::LazyLock};

use nix::libc::{getauxval, AT_SYSINFO_EHDR};
use procfs::process::{MMapPath, Process};

pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
pub const ELFCLASS64: u8 = 2;
#[cfg(target_endian = "little")]
pub const ELFDATA_NATIVE: u8 = 1;
#[cfg(target_endian = "big")]
pub const ELFDATA_NATIVE: u8 = 2;
pub const ET_DYN: u16 = 3;

pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;

pub const DT_NULL: i64 = 0;
pub const DT_HASH: i64 = 4;
pub const DT_STRTAB: i64 = 5;
pub const DT_SYMTAB: i64 = 6;
pub const DT_STRSZ: i64 = 10;
pub const DT_GNU_HASH: i64 = 0x6fff_fef5;

pub const SHN_UNDEF: u16 = 0;
pub const STT_NOTYPE: u8 = 0;
pub const STT_FUNC: u8 = 2;
pub const STB_GLOBAL: u8 = 1;
pub const STB_WEAK: u8 = 2;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const DYN_SIZE: usize = 16;
const SYM_SIZE: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// The kernel did not map a vDSO into this process
    NotMapped,
    /// The vDSO is mapped but /proc/self/maps did not describe it
    MappingNotFound,
    /// A read fell outside the image
    OutOfBounds,
    InvalidMagic,
    Not64Bit,
    WrongByteOrder,
    NotSharedObject,
    NoLoadSegment,
    NoDynamicSegment,
    /// The dynamic segment lacks DT_SYMTAB, DT_STRTAB or a hash table
    IncompleteDynamic,
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotMapped => write!(f, "no vDSO in the auxiliary vector"),
            Self::MappingNotFound => write!(f, "vDSO mapping not found in /proc/self/maps"),
            Self::OutOfBounds => write!(f, "read past the end of the vDSO image"),
            Self::InvalidMagic => write!(f, "invalid ELF magic bytes"),
            Self::Not64Bit => write!(f, "not a 64-bit ELF"),
            Self::WrongByteOrder => write!(f, "ELF byte order differs from the host"),
            Self::NotSharedObject => write!(f, "not a shared object"),
            Self::NoLoadSegment => write!(f, "no PT_LOAD segment"),
            Self::NoDynamicSegment => write!(f, "no PT_DYNAMIC segment"),
            Self::IncompleteDynamic => write!(f, "dynamic segment lacks symbol or hash tables"),
        }
    }
}

pub type ElfResult<T> = Result<T, ElfError>;

/// A parsed view over an in-memory vDSO image mapped at `base`.
#[derive(Debug, Clone, Copy)]
pub struct VdsoImage<'a> {
    data: &'a [u8],
    base: usize,
    // p_offset - p_vaddr of the first PT_LOAD, applied to every link-time address
    load_bias: u64,
    symtab: usize,
    strtab: usize,
    strsz: usize,
    nsyms: usize,
}

fn read_bytes<const N: usize>(data: &[u8], offset: usize) -> ElfResult<[u8; N]> {
    let end = offset.checked_add(N).ok_or(ElfError::OutOfBounds)?;
    let slice = data.get(offset..end).ok_or(ElfError::OutOfBounds)?;
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(slice);
    Ok(bytes)
}

fn read_u16(data: &[u8], offset: usize) -> ElfResult<u16> {
    read_bytes::<2>(data, offset).map(u16::from_ne_bytes)
}

fn read_u32(data: &[u8], offset: usize) -> ElfResult<u32> {
    read_bytes::<4>(data, offset).map(u32::from_ne_bytes)
}

fn read_u64(data: &[u8], offset: usize) -> ElfResult<u64> {
    read_bytes::<8>(data, offset).map(u64::from_ne_bytes)
}

impl<'a> VdsoImage<'a> {
    pub fn parse(data: &'a [u8], base: usize) -> ElfResult<Self> {
        if data.len() < EHDR_SIZE {
            return Err(ElfError::OutOfBounds);
        }
        if data[0..4] != ELF_MAGIC {
            return Err(ElfError::InvalidMagic);
        }
        if data[4] != ELFCLASS64 {
            return Err(ElfError::Not64Bit);
        }
        if data[5] != ELFDATA_NATIVE {
            return Err(ElfError::WrongByteOrder);
        }
        if read_u16(data, 16)? != ET_DYN {
            return Err(ElfError::NotSharedObject);
        }

        let phoff = read_u64(data, 32)? as usize;
        let phentsize = (read_u16(data, 54)? as usize).max(PHDR_SIZE);
        let phnum = read_u16(data, 56)? as usize;

        let mut load_bias = None;
        let mut dynamic = None;
        for index in 0..phnum {
            let phdr = phoff
                .checked_add(index * phentsize)
                .ok_or(ElfError::OutOfBounds)?;
            match read_u32(data, phdr)? {
                PT_LOAD if load_bias.is_none() => {
                    let p_offset = read_u64(data, phdr.saturating_add(8))?;
                    let p_vaddr = read_u64(data, phdr.saturating_add(16))?;
                    load_bias = Some(p_offset.wrapping_sub(p_vaddr));
                }
                PT_DYNAMIC => {
                    let p_offset = read_u64(data, phdr.saturating_add(8))? as usize;
                    let p_filesz = read_u64(data, phdr.saturating_add(32))? as usize;
                    dynamic = Some((p_offset, p_filesz));
                }
                _ => {}
            }
        }
        let load_bias = load_bias.ok_or(ElfError::NoLoadSegment)?;
        let (dyn_offset, dyn_size) = dynamic.ok_or(ElfError::NoDynamicSegment)?;

        let to_offset = |vaddr: u64| vaddr.wrapping_add(load_bias) as usize;
        let (mut symtab, mut strtab, mut strsz, mut hash, mut gnu_hash) =
            (None, None, None, None, None);
        for index in 0..dyn_size / DYN_SIZE {
            let entry = dyn_offset.saturating_add(index * DYN_SIZE);
            let tag = read_u64(data, entry)? as i64;
            let value = read_u64(data, entry.saturating_add(8))?;
            match tag {
                DT_NULL => break,
                DT_SYMTAB => symtab = Some(to_offset(value)),
                DT_STRTAB => strtab = Some(to_offset(value)),
                DT_STRSZ => strsz = Some(value as usize),
                DT_HASH => hash = Some(to_offset(value)),
                DT_GNU_HASH => gnu_hash = Some(to_offset(value)),
                _ => {}
            }
        }
        let (Some(symtab), Some(strtab)) = (symtab, strtab) else {
            return Err(ElfError::IncompleteDynamic);
        };
        let strsz = strsz.unwrap_or(data.len().saturating_sub(strtab));
        let nsyms = match (hash, gnu_hash) {
            // nchain of the SysV hash table equals the symbol count
            (Some(hash), _) => read_u32(data, hash.saturating_add(4))? as usize,
            (None, Some(gnu_hash)) => gnu_hash_symbol_count(data, gnu_hash)?,
            (None, None) => return Err(ElfError::IncompleteDynamic),
        };

        Ok(VdsoImage {
            data,
            base,
            load_bias,
            symtab,
            strtab,
            strsz,
            nsyms,
        })
    }

    pub fn symbol_count(&self) -> usize {
        self.nsyms
    }

    pub fn base(&self) -> usize {
        self.base
    }

    fn symbol_name(&self, st_name: usize) -> Option<&'a [u8]> {
        if st_name >= self.strsz {
            return None;
        }
        let start = self.strtab.checked_add(st_name)?;
        let end = self.strtab.checked_add(self.strsz)?.min(self.data.len());
        let table = self.data.get(start..end)?;
        let len = table.iter().position(|&byte| byte == 0)?;
        Some(&table[..len])
    }

    /// Address of the exported function `name`, if the image defines one.
    pub fn lookup(&self, name: &str) -> Option<usize> {
        (1..self.nsyms).find_map(|index| {
            let sym = self.symtab.checked_add(index * SYM_SIZE)?;
            let st_name = read_u32(self.data, sym).ok()? as usize;
            let st_info = *self.data.get(sym.saturating_add(4))?;
            let st_shndx = read_u16(self.data, sym.saturating_add(6)).ok()?;
            let st_value = read_u64(self.data, sym.saturating_add(8)).ok()?;

            let kind = st_info & 0xf;
            let binding = st_info >> 4;
            if st_shndx == SHN_UNDEF
                || !matches!(kind, STT_FUNC | STT_NOTYPE)
                || !matches!(binding, STB_GLOBAL | STB_WEAK)
            {
                return None;
            }
            if self.symbol_name(st_name)? != name.as_bytes() {
                return None;
            }
            Some(self.base.wrapping_add(st_value.wrapping_add(self.load_bias) as usize))
        })
    }

    /// First of `names` the image exports, in the order given.
    pub fn resolve(&self, names: &[&str]) -> Option<usize> {
        names.iter().find_map(|name| self.lookup(name))
    }
}

fn gnu_hash_symbol_count(data: &[u8], table: usize) -> ElfResult<usize> {
    let nbuckets = read_u32(data, table)? as usize;
    let symoffset = read_u32(data, table.saturating_add(4))? as usize;
    let bloom_size = read_u32(data, table.saturating_add(8))? as usize;
    let buckets = table.saturating_add(16 + bloom_size * 8);
    let chains = buckets.saturating_add(nbuckets * 4);

    let mut last = 0;
    for bucket in 0..nbuckets {
        last = last.max(read_u32(data, buckets.saturating_add(bucket * 4))? as usize);
    }
    if last < symoffset {
        return Ok(symoffset);
    }
    loop {
        let hash = read_u32(data, chains.saturating_add((last - symoffset) * 4))?;
        last += 1;
        if hash & 1 == 1 {
            return Ok(last);
        }
    }
}

static VDSO: LazyLock<ElfResult<VdsoImage<'static>>> = LazyLock::new(locate);

fn locate() -> ElfResult<VdsoImage<'static>> {
    let base = unsafe { getauxval(AT_SYSINFO_EHDR) } as usize;
    if base == 0 {
        return Err(ElfError::NotMapped);
    }
    let maps = Process::myself()
        .and_then(|me| me.maps())
        .map_err(|_| ElfError::MappingNotFound)?;
    let map = maps
        .0
        .into_iter()
        .find(|map| map.pathname == MMapPath::Vdso && map.address.0 == base as u64)
        .ok_or(ElfError::MappingNotFound)?;
    let len = (map.address.1 - map.address.0) as usize;
    // the kernel keeps the vDSO mapped and readable for the life of the process
    let data = unsafe { std::slice::from_raw_parts(base as *const u8, len) };
    VdsoImage::parse(data, base)
}

pub fn vdso_image() -> ElfResult<&'static VdsoImage<'static>> {
    VDSO.as_ref().map_err(|error| *error)
}

/// Resolve the first of `names` exported by this process's vDSO.
/// A missing vDSO or missing symbol is an ordinary outcome, not an error.
pub fn resolve(names: &[&str]) -> Option<usize> {
    vdso_image().ok()?.resolve(names)
}
