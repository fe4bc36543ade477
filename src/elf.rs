//! ELF introspection for packaging.
//!
//! Reads ELF headers directly (no `readelf`, no host loader), which is what
//! makes cross-architecture packaging possible. Only the parts packaging
//! cares about are extracted: identification, the program interpreter, and
//! the dynamic section's string-valued entries together with their file
//! offsets (the layout rewriter patches those in place).

use goblin::container::Ctx;
use goblin::elf::dynamic::{
    Dynamic, DT_NEEDED, DT_RPATH, DT_RUNPATH, DT_SONAME, DT_STRSZ, DT_STRTAB,
};
use goblin::elf::header::{
    self, header32, header64, EI_CLASS, EI_DATA, ELFCLASS32, ELFCLASS64, ELFDATA2LSB,
    ELFDATA2MSB, ELFMAG, EM_386, EM_AARCH64, EM_ARM, EM_X86_64, SELFMAG, SIZEOF_IDENT,
};
use goblin::elf::program_header::{
    program_header32, program_header64, ProgramHeader, PT_INTERP, PT_LOAD,
};
use goblin::elf::{Elf, Header};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Offset of `e_machine`, identical for both classes.
const E_MACHINE_OFFSET: usize = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElfClass {
    Elf32,
    Elf64,
}

impl ElfClass {
    /// Library directory name the Android loader uses for this class.
    pub fn lib_dir(self) -> &'static str {
        match self {
            ElfClass::Elf32 => "lib",
            ElfClass::Elf64 => "lib64",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endian {
    Little,
    Big,
}

/// The class, byte order and machine every packaged object must match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfTarget {
    pub class: ElfClass,
    pub endian: Endian,
    pub machine: u16,
}

impl ElfTarget {
    pub const ARM64: ElfTarget = ElfTarget::new(ElfClass::Elf64, Endian::Little, EM_AARCH64);
    pub const ARM: ElfTarget = ElfTarget::new(ElfClass::Elf32, Endian::Little, EM_ARM);
    pub const X86_64: ElfTarget = ElfTarget::new(ElfClass::Elf64, Endian::Little, EM_X86_64);
    pub const X86: ElfTarget = ElfTarget::new(ElfClass::Elf32, Endian::Little, EM_386);

    pub const fn new(class: ElfClass, endian: Endian, machine: u16) -> Self {
        Self {
            class,
            endian,
            machine,
        }
    }

    /// Map an Android ABI name (as used by the SDK) to its ELF target.
    pub fn from_abi(abi: &str) -> Option<Self> {
        match abi {
            "arm64-v8a" => Some(Self::ARM64),
            "armeabi-v7a" => Some(Self::ARM),
            "x86_64" => Some(Self::X86_64),
            "x86" => Some(Self::X86),
            _ => None,
        }
    }

    fn matches(&self, class: ElfClass, endian: Endian, machine: u16) -> bool {
        self.class == class && self.endian == endian && self.machine == machine
    }
}

impl fmt::Display for ElfTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&describe(self.class, self.endian, self.machine))
    }
}

fn describe(class: ElfClass, endian: Endian, machine: u16) -> String {
    let class = match class {
        ElfClass::Elf32 => "ELF32",
        ElfClass::Elf64 => "ELF64",
    };
    let endian = match endian {
        Endian::Little => "LSB",
        Endian::Big => "MSB",
    };
    format!("{} {} {}", class, endian, header::machine_to_str(machine))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchPathKind {
    /// `DT_RPATH`
    RPath,
    /// `DT_RUNPATH`
    RunPath,
}

/// A `DT_RPATH`/`DT_RUNPATH` string, verbatim, and where it lives in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchPath {
    pub kind: SearchPathKind,
    pub value: String,
    /// File offset of the first byte of the string.
    pub offset: u64,
}

/// Location of the dynamic string table in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StringTable {
    pub offset: u64,
    pub size: u64,
}

impl StringTable {
    /// Read the NUL-terminated string at `index` within the table.
    fn read(&self, path: &str, bytes: &[u8], index: u64) -> Result<String> {
        if index >= self.size {
            return Err(Error::malformed(
                path,
                format!("string index {:#x} outside table of {} bytes", index, self.size),
            ));
        }
        let start = (self.offset + index) as usize;
        let end = (self.offset + self.size) as usize;
        read_c_str(path, &bytes[start..end])
    }

    /// Length (without the NUL) of the string at `index`; need not be UTF-8.
    fn len_at(&self, path: &str, bytes: &[u8], index: u64) -> Result<u64> {
        if index >= self.size {
            return Err(Error::malformed(
                path,
                format!("string index {:#x} outside table of {} bytes", index, self.size),
            ));
        }
        let start = (self.offset + index) as usize;
        let end = (self.offset + self.size) as usize;
        bytes[start..end]
            .iter()
            .position(|&b| b == 0)
            .map(|nul| nul as u64)
            .ok_or_else(|| Error::malformed(path, "unterminated string"))
    }
}

/// A string the dynamic section points at, as a byte range of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StringRef {
    pub offset: u64,
    /// Length without the terminating NUL.
    pub len: u64,
}

impl StringRef {
    /// Whether the two strings share any byte (terminators excluded).
    pub fn overlaps(&self, offset: u64, len: u64) -> bool {
        self.offset < offset + len && offset < self.offset + self.len
    }
}

/// Everything packaging needs to know about one ELF object.
#[derive(Debug, Clone, Serialize)]
pub struct ElfObject {
    pub class: ElfClass,
    pub endian: Endian,
    pub machine: u16,
    pub soname: Option<String>,
    /// `DT_NEEDED` entries in file order (the loader's search precedence).
    pub needed: Vec<String>,
    pub search_paths: Vec<SearchPath>,
    /// `PT_INTERP`, only present on executables.
    pub interpreter: Option<String>,
    pub string_table: Option<StringTable>,
    /// Every string the dynamic section points at.
    pub string_refs: Vec<StringRef>,
}

impl ElfObject {
    /// `DT_RUNPATH` directories in order, placeholders left unexpanded.
    ///
    /// Bionic ignores `DT_RPATH`, so only `DT_RUNPATH` feeds resolution.
    pub fn runpath_dirs(&self) -> Vec<&str> {
        self.search_paths
            .iter()
            .filter(|sp| sp.kind == SearchPathKind::RunPath)
            .flat_map(|sp| sp.value.split(':'))
            .filter(|dir| !dir.is_empty())
            .collect()
    }

    pub fn target_description(&self) -> String {
        describe(self.class, self.endian, self.machine)
    }
}

/// Parse `bytes` (the contents of `path`) against `target`.
///
/// Fails with `MalformedElf` for anything that is not a well-formed ELF
/// file, and with `UnsupportedArchitecture` for a well-formed file built for
/// another class, byte order or machine.
pub fn parse(path: &str, bytes: &[u8], target: &ElfTarget) -> Result<ElfObject> {
    let (class, endian, machine) = identify(path, bytes)?;
    if !target.matches(class, endian, machine) {
        return Err(Error::UnsupportedArchitecture {
            path: path.to_string(),
            found: describe(class, endian, machine),
            expected: target.to_string(),
        });
    }

    let header = Elf::parse_header(bytes).map_err(|e| Error::malformed(path, e.to_string()))?;
    let ctx = Ctx::new(
        header
            .container()
            .map_err(|e| Error::malformed(path, e.to_string()))?,
        header
            .endianness()
            .map_err(|e| Error::malformed(path, e.to_string()))?,
    );
    let phdrs = program_headers(path, bytes, &header, class, ctx)?;

    let interpreter = phdrs
        .iter()
        .find(|p| p.p_type == PT_INTERP)
        .map(|p| read_interpreter(path, bytes, p))
        .transpose()?;

    let mut object = ElfObject {
        class,
        endian,
        machine,
        soname: None,
        needed: Vec::new(),
        search_paths: Vec::new(),
        interpreter,
        string_table: None,
        string_refs: Vec::new(),
    };

    // No PT_DYNAMIC: a static object, which is a valid leaf.
    let dynamic =
        Dynamic::parse(bytes, &phdrs, ctx).map_err(|e| Error::malformed(path, e.to_string()))?;
    if let Some(dynamic) = dynamic {
        read_dynamic(path, bytes, &phdrs, &dynamic, &mut object)?;
    }
    // Only objects with a search path get patched, so only they need the
    // full picture of who shares the string table.
    if !object.search_paths.is_empty() {
        read_symbol_refs(path, bytes, &mut object)?;
    }

    Ok(object)
}

/// Validate `e_ident` and the header size; return class, byte order, machine.
fn identify(path: &str, bytes: &[u8]) -> Result<(ElfClass, Endian, u16)> {
    if bytes.len() < SIZEOF_IDENT {
        return Err(Error::malformed(
            path,
            format!("truncated identification ({} bytes)", bytes.len()),
        ));
    }
    if bytes[..SELFMAG] != ELFMAG[..] {
        return Err(Error::malformed(path, "bad magic"));
    }

    let class = match bytes[EI_CLASS] {
        ELFCLASS32 => ElfClass::Elf32,
        ELFCLASS64 => ElfClass::Elf64,
        other => return Err(Error::malformed(path, format!("unknown class {}", other))),
    };
    let endian = match bytes[EI_DATA] {
        ELFDATA2LSB => Endian::Little,
        ELFDATA2MSB => Endian::Big,
        other => {
            return Err(Error::malformed(
                path,
                format!("unknown data encoding {}", other),
            ))
        }
    };

    let ehdr_size = match class {
        ElfClass::Elf32 => header32::SIZEOF_EHDR,
        ElfClass::Elf64 => header64::SIZEOF_EHDR,
    };
    if bytes.len() < ehdr_size {
        return Err(Error::malformed(
            path,
            format!("truncated header ({} of {} bytes)", bytes.len(), ehdr_size),
        ));
    }

    let raw = [bytes[E_MACHINE_OFFSET], bytes[E_MACHINE_OFFSET + 1]];
    let machine = match endian {
        Endian::Little => u16::from_le_bytes(raw),
        Endian::Big => u16::from_be_bytes(raw),
    };

    Ok((class, endian, machine))
}

fn program_headers(
    path: &str,
    bytes: &[u8],
    header: &Header,
    class: ElfClass,
    ctx: Ctx,
) -> Result<Vec<ProgramHeader>> {
    let count = header.e_phnum as usize;
    if count == 0 {
        return Ok(Vec::new());
    }

    let entry_size = match class {
        ElfClass::Elf32 => program_header32::SIZEOF_PHDR,
        ElfClass::Elf64 => program_header64::SIZEOF_PHDR,
    };
    if header.e_phentsize as usize != entry_size {
        return Err(Error::malformed(
            path,
            format!(
                "program header entry size {} (expected {})",
                header.e_phentsize, entry_size
            ),
        ));
    }

    let start = header.e_phoff as usize;
    let end = count
        .checked_mul(entry_size)
        .and_then(|len| len.checked_add(start));
    if end.map_or(true, |end| end > bytes.len()) {
        return Err(Error::malformed(path, "truncated program headers"));
    }

    ProgramHeader::parse(bytes, start, count, ctx).map_err(|e| Error::malformed(path, e.to_string()))
}

fn read_interpreter(path: &str, bytes: &[u8], phdr: &ProgramHeader) -> Result<String> {
    let start = phdr.p_offset as usize;
    let end = start.checked_add(phdr.p_filesz as usize);
    match end {
        Some(end) if end <= bytes.len() => read_c_str(path, &bytes[start..end]),
        _ => Err(Error::malformed(path, "truncated PT_INTERP")),
    }
}

fn read_dynamic(
    path: &str,
    bytes: &[u8],
    phdrs: &[ProgramHeader],
    dynamic: &Dynamic,
    object: &mut ElfObject,
) -> Result<()> {
    let is_string_tag = |tag: u64| matches!(tag, DT_NEEDED | DT_SONAME | DT_RPATH | DT_RUNPATH);
    if !dynamic.dyns.iter().any(|d| is_string_tag(d.d_tag)) {
        return Ok(());
    }

    let find = |tag: u64| dynamic.dyns.iter().find(|d| d.d_tag == tag).map(|d| d.d_val);
    let (Some(addr), Some(size)) = (find(DT_STRTAB), find(DT_STRSZ)) else {
        return Err(Error::malformed(
            path,
            "dynamic section references strings but has no DT_STRTAB/DT_STRSZ",
        ));
    };

    let offset = vm_to_offset(phdrs, addr, size).ok_or_else(|| {
        Error::malformed(
            path,
            format!("string table at {:#x} is not backed by a loadable segment", addr),
        )
    })?;
    if offset
        .checked_add(size)
        .map_or(true, |end| end > bytes.len() as u64)
    {
        return Err(Error::malformed(path, "truncated dynamic string table"));
    }
    let table = StringTable { offset, size };
    object.string_table = Some(table);

    for entry in dynamic.dyns.iter().filter(|d| is_string_tag(d.d_tag)) {
        let value = table.read(path, bytes, entry.d_val)?;
        let file_offset = table.offset + entry.d_val;
        object.string_refs.push(StringRef {
            offset: file_offset,
            len: value.len() as u64,
        });

        match entry.d_tag {
            DT_NEEDED => object.needed.push(value),
            DT_SONAME => object.soname = Some(value),
            DT_RPATH => object.search_paths.push(SearchPath {
                kind: SearchPathKind::RPath,
                value,
                offset: file_offset,
            }),
            DT_RUNPATH => object.search_paths.push(SearchPath {
                kind: SearchPathKind::RunPath,
                value,
                offset: file_offset,
            }),
            _ => {}
        }
    }

    Ok(())
}

/// Record the dynamic symbol names and symbol version names, which index
/// the same string table and may be tail-merged into a search path.
fn read_symbol_refs(path: &str, bytes: &[u8], object: &mut ElfObject) -> Result<()> {
    let Some(table) = object.string_table else {
        return Ok(());
    };
    let elf = Elf::parse(bytes)
        .map_err(|e| Error::malformed(path, format!("symbol tables: {}", e)))?;

    let mut indices: Vec<usize> = elf.dynsyms.iter().map(|sym| sym.st_name).collect();
    if let Some(verneed) = &elf.verneed {
        for need in verneed.iter() {
            indices.push(need.vn_file);
            indices.extend((&need).into_iter().map(|aux| aux.vna_name));
        }
    }
    if let Some(verdef) = &elf.verdef {
        for def in verdef.iter() {
            indices.extend((&def).into_iter().map(|aux| aux.vda_name));
        }
    }

    for index in indices.into_iter().filter(|&i| i != 0) {
        let len = table.len_at(path, bytes, index as u64)?;
        object.string_refs.push(StringRef {
            offset: table.offset + index as u64,
            len,
        });
    }
    Ok(())
}

/// Map a virtual address range to a file offset through the PT_LOAD segments.
fn vm_to_offset(phdrs: &[ProgramHeader], addr: u64, size: u64) -> Option<u64> {
    let end = addr.checked_add(size)?;
    phdrs
        .iter()
        .filter(|p| p.p_type == PT_LOAD)
        .find(|p| p.p_vaddr <= addr && end <= p.p_vaddr.saturating_add(p.p_filesz))
        .and_then(|p| p.p_offset.checked_add(addr - p.p_vaddr))
}

fn read_c_str(path: &str, bytes: &[u8]) -> Result<String> {
    let nul = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::malformed(path, "unterminated string"))?;
    String::from_utf8(bytes[..nul].to_vec())
        .map_err(|_| Error::malformed(path, "string is not valid UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(class: u8, data: u8, machine: u16, len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        bytes[..4].copy_from_slice(b"\x7fELF");
        bytes[EI_CLASS] = class;
        bytes[EI_DATA] = data;
        bytes[6] = 1;
        bytes[E_MACHINE_OFFSET..E_MACHINE_OFFSET + 2].copy_from_slice(&machine.to_le_bytes());
        bytes
    }

    fn reason(err: Error) -> String {
        match err {
            Error::MalformedElf { reason, .. } => reason,
            other => panic!("expected MalformedElf, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_empty_input() {
        let err = parse("x", &[], &ElfTarget::ARM64).unwrap_err();
        assert!(reason(err).contains("truncated identification"));
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = ident(ELFCLASS64, ELFDATA2LSB, EM_AARCH64, 64);
        bytes[1] = b'X';
        let err = parse("x", &bytes, &ElfTarget::ARM64).unwrap_err();
        assert_eq!(reason(err), "bad magic");
    }

    #[test]
    fn test_rejects_unknown_class() {
        let bytes = ident(7, ELFDATA2LSB, EM_AARCH64, 64);
        let err = parse("x", &bytes, &ElfTarget::ARM64).unwrap_err();
        assert!(reason(err).contains("unknown class"));
    }

    #[test]
    fn test_rejects_truncated_header() {
        let bytes = ident(ELFCLASS64, ELFDATA2LSB, EM_AARCH64, 40);
        let err = parse("x", &bytes, &ElfTarget::ARM64).unwrap_err();
        assert!(reason(err).contains("truncated header"));
    }

    #[test]
    fn test_wrong_machine_is_unsupported() {
        let bytes = ident(ELFCLASS32, ELFDATA2LSB, EM_ARM, 52);
        let err = parse("/system/lib/libc.so", &bytes, &ElfTarget::ARM64).unwrap_err();
        match err {
            Error::UnsupportedArchitecture { found, expected, .. } => {
                assert!(found.starts_with("ELF32"));
                assert!(expected.starts_with("ELF64"));
            }
            other => panic!("expected UnsupportedArchitecture, got {:?}", other),
        }
    }

    #[test]
    fn test_abi_names() {
        assert_eq!(ElfTarget::from_abi("arm64-v8a"), Some(ElfTarget::ARM64));
        assert_eq!(ElfTarget::from_abi("x86"), Some(ElfTarget::X86));
        assert_eq!(ElfTarget::from_abi("mips"), None);
        assert_eq!(ElfTarget::ARM.class.lib_dir(), "lib");
    }

    #[test]
    fn test_vm_to_offset_requires_file_backing() {
        let load = ProgramHeader {
            p_type: PT_LOAD,
            p_offset: 0x1000,
            p_vaddr: 0x4000,
            p_filesz: 0x100,
            p_memsz: 0x200,
            ..Default::default()
        };
        assert_eq!(vm_to_offset(&[load.clone()], 0x4010, 0x10), Some(0x1010));
        assert_eq!(vm_to_offset(&[load], 0x40f0, 0x20), None);
    }

    #[test]
    fn test_vm_to_offset_rejects_overflowing_segment() {
        let load = ProgramHeader {
            p_type: PT_LOAD,
            p_offset: u64::MAX - 4,
            p_vaddr: 0,
            p_filesz: 0x100,
            p_memsz: 0x100,
            ..Default::default()
        };
        assert_eq!(vm_to_offset(&[load], 0x10, 0x10), None);
    }
}
