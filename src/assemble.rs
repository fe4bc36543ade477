//! Package assembly.
//!
//! Writes the resolved package into `<out>.partial`, writes the manifest
//! last, checks the staged tree against the manifest, and only then renames
//! it to `<out>`. A failed run leaves no `<out>` that looks complete.
//!
//! Layout of a finished package (64-bit target):
//!
//! ```text
//! <out>/
//!   lib64/<soname>...            flat, mode 0644
//!   system/bin/linker64          at its image path, mode 0755
//!   linkerconfig/ld.config.txt   empty; the linker reads it at startup
//!   manifest.json
//! ```

use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::cache;
use crate::common::{
    cleanup_work_dir, parallel_map, prepare_work_dir, write_file_mode, write_file_with_dirs,
};
use crate::image::ImageReader;
use crate::layout::{PackageEntry, PatchPlan, ResolvedPackage};
use crate::manifest::{Manifest, ManifestEntry, FORMAT_VERSION, MANIFEST_FILE};

/// Empty linker configuration; bionic's linker refuses to start without one.
pub const LINKER_CONFIG: &str = "linkerconfig/ld.config.txt";

const LIBRARY_MODE: u32 = 0o644;
const INTERPRETER_MODE: u32 = 0o755;

/// Where and how to write a package.
#[derive(Debug, Clone)]
pub struct AssembleOptions {
    pub output: PathBuf,
    pub abi: String,
    /// Human-readable description of the image, recorded in the manifest.
    pub image: String,
    pub jobs: usize,
}

/// Write `package` to `options.output`.
pub fn assemble(
    image: &dyn ImageReader,
    package: &ResolvedPackage,
    plans: &BTreeMap<String, PatchPlan>,
    options: &AssembleOptions,
) -> Result<Manifest> {
    let output = &options.output;
    check_replaceable(output)?;

    let staging = staging_dir(output)?;
    let staging_parent = staging.parent().unwrap_or(Path::new("."));
    let staging_name = staging
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("Invalid output path {}", output.display()))?;
    let staging = prepare_work_dir(staging_parent, &staging_name)?;

    let result = stage(image, package, plans, options, &staging).and_then(|manifest| {
        verify(&staging, &manifest)?;
        publish(&staging, output)?;
        Ok(manifest)
    });

    if result.is_err() {
        cleanup_work_dir(&staging);
    }
    result
}

/// `<out>` with `.partial` appended to its last component.
pub fn staging_dir(output: &Path) -> Result<PathBuf> {
    let name = output
        .file_name()
        .with_context(|| format!("Output path has no name: {}", output.display()))?;
    let mut staging = name.to_os_string();
    staging.push(".partial");
    Ok(output.with_file_name(staging))
}

/// An existing `<out>` may only be replaced if it is a previous package.
fn check_replaceable(output: &Path) -> Result<()> {
    if !output.exists() {
        return Ok(());
    }
    if !output.join(MANIFEST_FILE).is_file() {
        bail!(
            "{} exists and is not a launcher package; refusing to replace it",
            output.display()
        );
    }
    Ok(())
}

fn stage(
    image: &dyn ImageReader,
    package: &ResolvedPackage,
    plans: &BTreeMap<String, PatchPlan>,
    options: &AssembleOptions,
    staging: &Path,
) -> Result<Manifest> {
    let objects: Vec<&PackageEntry> = package.objects().collect();
    let written = parallel_map(&objects, options.jobs, |entry| {
        let is_interpreter = package
            .interpreter
            .as_ref()
            .is_some_and(|interp| interp.soname == entry.soname);
        let mode = if is_interpreter {
            INTERPRETER_MODE
        } else {
            LIBRARY_MODE
        };
        write_object(image, entry, plans.get(&entry.soname), staging, mode)
    });

    let mut libraries = BTreeMap::new();
    let mut interpreter = None;
    for (entry, result) in objects.iter().zip(written) {
        let manifest_entry = result?;
        match &package.interpreter {
            Some(interp) if interp.soname == entry.soname => interpreter = Some(manifest_entry),
            _ => {
                libraries.insert(entry.soname.clone(), manifest_entry);
            }
        }
    }

    write_file_with_dirs(staging.join(LINKER_CONFIG), b"")?;

    let manifest = Manifest {
        format_version: FORMAT_VERSION,
        abi: options.abi.clone(),
        image: options.image.clone(),
        root: package.root.clone(),
        lib_dir: package.lib_dir.clone(),
        interpreter,
        libraries,
        excluded: package.excluded.clone(),
    };
    manifest.save(staging.join(MANIFEST_FILE))?;
    Ok(manifest)
}

fn write_object(
    image: &dyn ImageReader,
    entry: &PackageEntry,
    plan: Option<&PatchPlan>,
    staging: &Path,
    mode: u32,
) -> Result<ManifestEntry> {
    let mut bytes = image
        .read(&entry.source)
        .with_context(|| format!("Failed to read {} from image", entry.source))?;
    let length = bytes.len();

    let patched = match plan {
        Some(plan) if !plan.is_empty() => {
            plan.apply(&mut bytes)
                .with_context(|| format!("Failed to patch {}", entry.soname))?;
            true
        }
        _ => false,
    };
    if bytes.len() != length {
        bail!("Patching {} changed its length", entry.soname);
    }

    write_file_mode(staging.join(&entry.output_path), &bytes, mode)?;

    Ok(ManifestEntry {
        origin: entry.source.clone(),
        file: entry.output_path.clone(),
        sha256: cache::hash_bytes(&bytes),
        size: bytes.len() as u64,
        needed: entry.needed.clone(),
        requested_by: entry.requested_by.clone(),
        patched,
    })
}

/// The staged tree holds exactly what the manifest lists, byte for byte.
pub fn verify(root: &Path, manifest: &Manifest) -> Result<()> {
    let mut expected: BTreeMap<&str, &ManifestEntry> = BTreeMap::new();
    for entry in manifest.files() {
        expected.insert(entry.file.as_str(), entry);
    }

    let mut found = BTreeSet::new();
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if entry.file_type().is_dir() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("{} escaped {}", entry.path().display(), root.display()))?
            .to_string_lossy()
            .into_owned();

        let listed = expected.contains_key(relative.as_str());
        if !listed && relative != MANIFEST_FILE && relative != LINKER_CONFIG {
            bail!("Unexpected file in package: {}", relative);
        }
        found.insert(relative);
    }

    for required in [MANIFEST_FILE, LINKER_CONFIG] {
        if !found.contains(required) {
            bail!("Package is missing {}", required);
        }
    }

    for (file, entry) in expected {
        if !found.contains(file) {
            bail!("Package is missing {}", file);
        }
        let bytes = fs::read(root.join(file)).with_context(|| format!("Failed to read {}", file))?;
        if cache::hash_bytes(&bytes) != entry.sha256 {
            bail!("{} does not match its manifest digest", file);
        }
    }

    Ok(())
}

/// Replace `<out>` with the staged tree.
fn publish(staging: &Path, output: &Path) -> Result<()> {
    if output.exists() {
        fs::remove_dir_all(output)
            .with_context(|| format!("Failed to remove previous package {}", output.display()))?;
    }
    fs::rename(staging, output).with_context(|| {
        format!(
            "Failed to move {} to {}",
            staging.display(),
            output.display()
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_dir_name() {
        assert_eq!(
            staging_dir(Path::new("/tmp/pkg")).unwrap(),
            PathBuf::from("/tmp/pkg.partial")
        );
        assert_eq!(
            staging_dir(Path::new("out")).unwrap(),
            PathBuf::from("out.partial")
        );
        assert!(staging_dir(Path::new("/")).is_err());
    }

    #[test]
    fn test_refuses_to_replace_foreign_directory() {
        let temp = tempfile::TempDir::new().unwrap();
        let out = temp.path().join("out");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("notes.txt"), b"keep me").unwrap();

        assert!(check_replaceable(&out).is_err());
        fs::write(out.join(MANIFEST_FILE), b"{}").unwrap();
        assert!(check_replaceable(&out).is_ok());
    }
}
