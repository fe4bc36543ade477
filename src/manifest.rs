//! Package manifest.
//!
//! Written last into a package, so its presence marks the package as
//! complete. Records where every packaged object came from in the image,
//! what it needs, who asked for it and the digest of the bytes written.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

pub const MANIFEST_FILE: &str = "manifest.json";

/// Bumped when the layout of the package changes.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    /// Android ABI the package targets.
    pub abi: String,
    /// Image the objects were taken from.
    pub image: String,
    /// Name of the executable (or seed list) the package was built for.
    pub root: String,
    /// Directory holding the libraries, relative to the package root.
    pub lib_dir: String,
    pub interpreter: Option<ManifestEntry>,
    /// Libraries keyed by soname.
    pub libraries: BTreeMap<String, ManifestEntry>,
    /// Names requested but deliberately not packaged.
    pub excluded: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Canonical image path of the source object.
    pub origin: String,
    /// Path relative to the package root.
    pub file: String,
    /// SHA256 of the bytes as written (after patching).
    pub sha256: String,
    pub size: u64,
    pub needed: Vec<String>,
    pub requested_by: Vec<String>,
    /// Whether embedded search paths were rewritten.
    pub patched: bool,
}

impl Manifest {
    /// Every file the package must contain besides the manifest itself.
    pub fn files(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.libraries.values().chain(self.interpreter.as_ref())
    }

    /// Save manifest to JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write manifest {}", path.display()))?;
        Ok(())
    }

    /// Load manifest from JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        let manifest: Self = serde_json::from_str(&json)
            .with_context(|| format!("Invalid manifest {}", path.display()))?;
        Ok(manifest)
    }
}
