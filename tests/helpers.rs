//! Shared test utilities for android-exe-launcher tests.

#![allow(dead_code)]

use goblin::elf::dynamic::{
    DT_HASH, DT_NEEDED, DT_NULL, DT_RPATH, DT_RUNPATH, DT_SONAME, DT_STRSZ, DT_STRTAB, DT_SYMENT,
    DT_SYMTAB,
};
use goblin::elf::header::{EM_AARCH64, EM_ARM, ET_DYN};
use goblin::elf::program_header::{PT_DYNAMIC, PT_INTERP, PT_LOAD};
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use android_exe_launcher::image::DirImage;

// =============================================================================
// Synthetic ELF objects
// =============================================================================

/// Builds minimal little-endian ELF files: one PT_LOAD mapping the whole
/// file at address 0, a PT_DYNAMIC, and an optional PT_INTERP. Dynamic
/// symbols come with a DT_HASH table so their count is known.
#[derive(Debug, Clone)]
pub struct ElfBuilder {
    is64: bool,
    machine: u16,
    dynamic: bool,
    soname: Option<String>,
    needed: Vec<String>,
    runpath: Option<String>,
    rpath: Option<String>,
    interp: Option<String>,
    symbols: Vec<String>,
}

impl ElfBuilder {
    /// ELF64 AArch64 shared object.
    pub fn arm64() -> Self {
        Self {
            is64: true,
            machine: EM_AARCH64,
            dynamic: true,
            soname: None,
            needed: Vec::new(),
            runpath: None,
            rpath: None,
            interp: None,
            symbols: Vec::new(),
        }
    }

    /// ELF32 ARM shared object.
    pub fn arm32() -> Self {
        Self {
            is64: false,
            machine: EM_ARM,
            ..Self::arm64()
        }
    }

    /// An arm64 library declaring `soname` and needing `needed`.
    pub fn lib(soname: &str, needed: &[&str]) -> Self {
        let mut builder = Self::arm64().soname(soname);
        for dep in needed {
            builder = builder.needed(dep);
        }
        builder
    }

    pub fn soname(mut self, soname: &str) -> Self {
        self.soname = Some(soname.to_string());
        self
    }

    pub fn needed(mut self, soname: &str) -> Self {
        self.needed.push(soname.to_string());
        self
    }

    pub fn runpath(mut self, value: &str) -> Self {
        self.runpath = Some(value.to_string());
        self
    }

    pub fn rpath(mut self, value: &str) -> Self {
        self.rpath = Some(value.to_string());
        self
    }

    pub fn interp(mut self, path: &str) -> Self {
        self.interp = Some(path.to_string());
        self
    }

    /// Add a dynamic symbol. Its name is tail-merged into an existing
    /// string when one ends with it, as GNU ld does.
    pub fn symbol(mut self, name: &str) -> Self {
        self.symbols.push(name.to_string());
        self
    }

    /// Drop the dynamic section entirely (a static object).
    pub fn without_dynamic(mut self) -> Self {
        self.dynamic = false;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let (ehdr_size, phent, dynent, syment) = if self.is64 {
            (64, 56, 16, 24)
        } else {
            (52, 32, 8, 16)
        };
        let phnum = 1 + usize::from(self.dynamic) + usize::from(self.interp.is_some());

        let mut strtab = vec![0u8];
        let mut dyns: Vec<(u64, u64)> = Vec::new();
        if self.dynamic {
            let mut add = |s: &str| {
                let index = strtab.len() as u64;
                strtab.extend_from_slice(s.as_bytes());
                strtab.push(0);
                index
            };
            for dep in &self.needed {
                dyns.push((DT_NEEDED, add(dep)));
            }
            if let Some(soname) = &self.soname {
                dyns.push((DT_SONAME, add(soname)));
            }
            if let Some(runpath) = &self.runpath {
                dyns.push((DT_RUNPATH, add(runpath)));
            }
            if let Some(rpath) = &self.rpath {
                dyns.push((DT_RPATH, add(rpath)));
            }
        }

        let mut sym_names = Vec::new();
        for name in &self.symbols {
            let mut needle = name.as_bytes().to_vec();
            needle.push(0);
            let index = match strtab.windows(needle.len()).position(|w| w == needle.as_slice()) {
                Some(index) => index,
                None => {
                    strtab.extend_from_slice(&needle);
                    strtab.len() - needle.len()
                }
            };
            sym_names.push(index as u32);
        }
        // Index 0 is the null symbol.
        let sym_count = if sym_names.is_empty() { 0 } else { sym_names.len() + 1 };

        let interp_off = ehdr_size + phent * phnum;
        let interp_bytes: Vec<u8> = self
            .interp
            .as_ref()
            .map(|p| {
                let mut bytes = p.as_bytes().to_vec();
                bytes.push(0);
                bytes
            })
            .unwrap_or_default();
        let strtab_off = interp_off + interp_bytes.len();
        let sym_off = (strtab_off + strtab.len() + 7) & !7;
        let hash_off = sym_off + sym_count * syment;
        let hash_len = if sym_count > 0 { 4 * (3 + sym_count) } else { 0 };
        let dyn_off = (hash_off + hash_len + 7) & !7;
        if self.dynamic && sym_count > 0 {
            dyns.push((DT_SYMTAB, sym_off as u64));
            dyns.push((DT_SYMENT, syment as u64));
            dyns.push((DT_HASH, hash_off as u64));
        }
        if self.dynamic {
            dyns.push((DT_STRTAB, strtab_off as u64));
            dyns.push((DT_STRSZ, strtab.len() as u64));
            dyns.push((DT_NULL, 0));
        }
        let total = dyn_off + dyns.len() * dynent;

        let mut out = vec![0u8; total.max(strtab_off + strtab.len())];
        let mut w = Writer {
            out: &mut out,
            is64: self.is64,
        };

        // Identification and header
        w.bytes(0, b"\x7fELF");
        w.bytes(4, &[if self.is64 { 2 } else { 1 }, 1, 1]);
        w.u16(16, ET_DYN);
        w.u16(18, self.machine);
        w.u32(20, 1);
        if self.is64 {
            w.u64(32, ehdr_size as u64);
            w.u16(52, ehdr_size as u16);
            w.u16(54, phent as u16);
            w.u16(56, phnum as u16);
        } else {
            w.u32(28, ehdr_size as u32);
            w.u16(40, ehdr_size as u16);
            w.u16(42, phent as u16);
            w.u16(44, phnum as u16);
        }

        let mut phdrs = vec![(PT_LOAD, 0, total as u64)];
        if self.dynamic {
            phdrs.push((PT_DYNAMIC, dyn_off as u64, (dyns.len() * dynent) as u64));
        }
        if self.interp.is_some() {
            phdrs.push((PT_INTERP, interp_off as u64, interp_bytes.len() as u64));
        }
        for (i, (p_type, offset, size)) in phdrs.into_iter().enumerate() {
            w.phdr(ehdr_size + i * phent, p_type, offset, size);
        }

        w.bytes(interp_off, &interp_bytes);
        w.bytes(strtab_off, &strtab);
        if self.dynamic && sym_count > 0 {
            for (i, name) in sym_names.iter().enumerate() {
                w.u32(sym_off + (i + 1) * syment, *name);
            }
            // nbucket = 1, nchain = symbol count; buckets and chains stay 0.
            w.u32(hash_off, 1);
            w.u32(hash_off + 4, sym_count as u32);
        }
        for (i, (tag, val)) in dyns.into_iter().enumerate() {
            let at = dyn_off + i * dynent;
            w.word(at, tag);
            w.word(at + dynent / 2, val);
        }

        out
    }

    /// Write the object to a host path, creating parents.
    pub fn write(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent dir for ELF");
        }
        fs::write(path, self.build()).expect("Failed to write ELF");
    }
}

struct Writer<'a> {
    out: &'a mut Vec<u8>,
    is64: bool,
}

impl Writer<'_> {
    fn bytes(&mut self, at: usize, bytes: &[u8]) {
        self.out[at..at + bytes.len()].copy_from_slice(bytes);
    }

    fn u16(&mut self, at: usize, v: u16) {
        self.bytes(at, &v.to_le_bytes());
    }

    fn u32(&mut self, at: usize, v: u32) {
        self.bytes(at, &v.to_le_bytes());
    }

    fn u64(&mut self, at: usize, v: u64) {
        self.bytes(at, &v.to_le_bytes());
    }

    /// Address-sized value.
    fn word(&mut self, at: usize, v: u64) {
        if self.is64 {
            self.u64(at, v);
        } else {
            self.u32(at, v as u32);
        }
    }

    /// Segment mapped at vaddr == file offset.
    fn phdr(&mut self, at: usize, p_type: u32, offset: u64, size: u64) {
        self.u32(at, p_type);
        if self.is64 {
            self.u64(at + 8, offset);
            self.u64(at + 16, offset);
            self.u64(at + 24, offset);
            self.u64(at + 32, size);
            self.u64(at + 40, size);
        } else {
            self.u32(at + 4, offset as u32);
            self.u32(at + 8, offset as u32);
            self.u32(at + 12, offset as u32);
            self.u32(at + 16, size as u32);
            self.u32(at + 20, size as u32);
        }
    }
}

// =============================================================================
// Test environment
// =============================================================================

/// Test environment with a temporary image tree and output location.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    /// Extracted system image root
    pub image: PathBuf,
    /// Package output directory (not created)
    pub output: PathBuf,
    /// Work directory for mounts and APEX extraction
    pub work_dir: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base = temp_dir.path();

        let image = base.join("image");
        let work_dir = base.join("work");
        fs::create_dir_all(&image).expect("Failed to create image dir");
        fs::create_dir_all(&work_dir).expect("Failed to create work dir");

        Self {
            output: base.join("out"),
            _temp_dir: temp_dir,
            image,
            work_dir,
        }
    }

    /// Host location of an image path.
    pub fn host(&self, image_path: &str) -> PathBuf {
        self.image.join(image_path.trim_start_matches('/'))
    }

    pub fn add_elf(&self, image_path: &str, builder: &ElfBuilder) {
        builder.write(&self.host(image_path));
    }

    /// Add an arm64 library at `<dir>/<soname>`.
    pub fn add_lib(&self, dir: &str, soname: &str, needed: &[&str]) {
        self.add_elf(&format!("{}/{}", dir, soname), &ElfBuilder::lib(soname, needed));
    }

    pub fn add_symlink(&self, image_path: &str, target: &str) {
        let host = self.host(image_path);
        if let Some(parent) = host.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent dir for symlink");
        }
        symlink(target, &host).expect("Failed to create symlink");
    }

    /// A minimal bionic: linker64, libc, libm and libdl, with libc.so a
    /// symlink into the runtime APEX as on real devices.
    pub fn add_bionic(&self) {
        self.add_elf("/system/bin/linker64", &ElfBuilder::arm64());
        self.add_elf(
            "/system/apex/com.android.runtime/lib64/bionic/libc.so",
            &ElfBuilder::lib("libc.so", &["ld-android.so", "libdl.so"]),
        );
        self.add_symlink(
            "/system/lib64/libc.so",
            "/apex/com.android.runtime/lib64/bionic/libc.so",
        );
        self.add_lib("/system/lib64", "libdl.so", &["ld-android.so"]);
        self.add_lib("/system/lib64", "libm.so", &["libc.so", "ld-android.so"]);
    }

    pub fn reader(&self) -> DirImage {
        DirImage::new(&self.image).expect("Failed to open test image")
    }
}

// =============================================================================
// Assertions
// =============================================================================

/// Assert that a file exists.
pub fn assert_file_exists(path: &Path) {
    assert!(path.is_file(), "Expected file to exist: {}", path.display());
}

/// Assert a file's permission bits.
pub fn assert_mode(path: &Path, expected: u32) {
    use std::os::unix::fs::PermissionsExt;
    let mode = fs::metadata(path)
        .unwrap_or_else(|_| panic!("Failed to stat {}", path.display()))
        .permissions()
        .mode();
    assert_eq!(
        mode & 0o777,
        expected,
        "{} has mode {:o}, expected {:o}",
        path.display(),
        mode & 0o777,
        expected
    );
}
