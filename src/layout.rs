//! Output layout and in-place search path rewriting.
//!
//! Every library lands flat in one directory under the name it was
//! requested by, so the loader finds it through `LD_LIBRARY_PATH` alone.
//! Embedded `DT_RPATH`/`DT_RUNPATH` strings pointing at image directories
//! would send the loader to host paths; they are rewritten to `$ORIGIN`
//! inside the existing string table bytes. Nothing is ever inserted, so a
//! patched object has exactly the length of the original.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::common::parallel_map;
use crate::elf::{ElfObject, SearchPath};
use crate::error::{Error, Result};
use crate::image;
use crate::resolve::{DependencyGraph, LibraryNode};

/// The only directory a rewritten search path may point at.
pub const ORIGIN: &str = "$ORIGIN";

/// One object placed in the package.
#[derive(Debug, Clone)]
pub struct PackageEntry {
    pub soname: String,
    /// Canonical image path the bytes come from.
    pub source: String,
    /// File name in the output directory.
    pub output_name: String,
    /// Path relative to the package root.
    pub output_path: String,
    pub needed: Vec<String>,
    pub requested_by: Vec<String>,
    pub elf: ElfObject,
}

/// The final set of objects and where each one goes.
#[derive(Debug, Clone)]
pub struct ResolvedPackage {
    pub root: String,
    /// `lib64` or `lib`, per the target class.
    pub lib_dir: String,
    /// Libraries keyed by soname.
    pub entries: BTreeMap<String, PackageEntry>,
    /// Placed at its own image path so `-L <out>` finds it.
    pub interpreter: Option<PackageEntry>,
    pub excluded: BTreeSet<String>,
}

/// File name of the packaged object (the last component of path-like
/// names).
pub fn output_name(soname: &str) -> &str {
    image::file_name(soname)
}

/// Where the loader will look for a requested name, relative to the
/// package root.
///
/// Bionic opens a name containing `/` by that literal path and never
/// searches `LD_LIBRARY_PATH` for it, so such objects keep their path
/// (the emulator's `-L` prefix is the package root). Plain sonames land
/// flat in `lib_dir`.
pub fn output_path(soname: &str, lib_dir: &str) -> String {
    if soname.contains('/') {
        soname.trim_start_matches('/').to_string()
    } else {
        format!("{}/{}", lib_dir, soname)
    }
}

impl ResolvedPackage {
    pub fn from_graph(graph: &DependencyGraph, exclude: &BTreeSet<String>) -> Result<Self> {
        let lib_dir = graph
            .nodes()
            .chain(graph.interpreter())
            .next()
            .map(|node| node.elf.class.lib_dir())
            .unwrap_or("lib64")
            .to_string();

        let mut entries = BTreeMap::new();
        // Output path -> soname placed there.
        let mut claimed: BTreeMap<String, String> = BTreeMap::new();

        let interpreter = graph.interpreter().map(|node| {
            let name = output_name(&node.soname).to_string();
            let path = node.soname.trim_start_matches('/').to_string();
            claimed.insert(path.clone(), node.soname.clone());
            entry(graph, node, name, path)
        });

        for node in graph.nodes() {
            let name = output_name(&node.soname).to_string();
            let path = output_path(&node.soname, &lib_dir);
            if let Some(first) = claimed.get(&path) {
                return Err(Error::NameCollision {
                    path,
                    first: first.clone(),
                    second: node.soname.clone(),
                });
            }
            claimed.insert(path.clone(), node.soname.clone());
            entries.insert(node.soname.clone(), entry(graph, node, name, path));
        }

        let package = Self {
            root: graph.root().to_string(),
            lib_dir,
            entries,
            interpreter,
            excluded: exclude.clone(),
        };
        package.check_complete()?;
        Ok(package)
    }

    /// Every `DT_NEEDED` target is either packaged or excluded.
    fn check_complete(&self) -> Result<()> {
        for entry in self.objects() {
            for dep in &entry.needed {
                if !self.entries.contains_key(dep) && !self.excluded.contains(dep) {
                    return Err(Error::IncompletePackage {
                        soname: entry.soname.clone(),
                        missing: dep.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Libraries in soname order, then the interpreter.
    pub fn objects(&self) -> impl Iterator<Item = &PackageEntry> {
        self.entries.values().chain(self.interpreter.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entries.len() + usize::from(self.interpreter.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn entry(
    graph: &DependencyGraph,
    node: &LibraryNode,
    output_name: String,
    output_path: String,
) -> PackageEntry {
    PackageEntry {
        soname: node.soname.clone(),
        source: node.path.clone(),
        output_name,
        output_path,
        needed: node.elf.needed.clone(),
        requested_by: graph.requesters(&node.soname).to_vec(),
        elf: node.elf.clone(),
    }
}

/// Rewrite one search path string entry by entry.
///
/// Absolute entries become `$ORIGIN`, relative and `$ORIGIN` entries stay,
/// empty entries go and duplicates collapse to their first occurrence.
/// Returns None when nothing changes.
pub fn rewrite_search_path(value: &str) -> Option<String> {
    let mut seen = HashSet::new();
    let rewritten: Vec<&str> = value
        .split(':')
        .filter(|entry| !entry.is_empty())
        .map(|entry| if entry.starts_with('/') { ORIGIN } else { entry })
        .filter(|entry| seen.insert(*entry))
        .collect();

    let rewritten = rewritten.join(":");
    if rewritten == value {
        None
    } else {
        Some(rewritten)
    }
}

/// One same-length byte replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchEdit {
    pub offset: u64,
    pub original: Vec<u8>,
    pub replacement: Vec<u8>,
}

/// All edits for one object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchPlan {
    pub object: String,
    pub edits: Vec<PatchEdit>,
}

impl PatchPlan {
    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Apply every edit after checking the bytes still match.
    pub fn apply(&self, bytes: &mut [u8]) -> Result<()> {
        for edit in &self.edits {
            let start = edit.offset as usize;
            let end = start + edit.original.len();
            if end > bytes.len() || bytes[start..end] != edit.original[..] {
                return Err(Error::PatchMismatch {
                    object: self.object.clone(),
                    offset: edit.offset,
                });
            }
        }
        for edit in &self.edits {
            let start = edit.offset as usize;
            bytes[start..start + edit.replacement.len()].copy_from_slice(&edit.replacement);
        }
        Ok(())
    }
}

/// Compute the patch plan for one object.
pub fn plan_object(name: &str, elf: &ElfObject) -> Result<PatchPlan> {
    let mut plan = PatchPlan {
        object: name.to_string(),
        edits: Vec::new(),
    };
    let mut planned = HashSet::new();

    for search_path in &elf.search_paths {
        // DT_RPATH and DT_RUNPATH may share one string.
        if !planned.insert(search_path.offset) {
            continue;
        }
        if let Some(edit) = plan_search_path(name, elf, search_path)? {
            plan.edits.push(edit);
        }
    }

    Ok(plan)
}

fn plan_search_path(name: &str, elf: &ElfObject, sp: &SearchPath) -> Result<Option<PatchEdit>> {
    let Some(rewritten) = rewrite_search_path(&sp.value) else {
        return Ok(None);
    };

    let capacity = sp.value.len();
    if rewritten.len() > capacity {
        return Err(Error::PatchTooLarge {
            object: name.to_string(),
            original: sp.value.clone(),
            needed: rewritten.len(),
            replacement: rewritten,
            capacity,
        });
    }

    let shared = elf
        .string_refs
        .iter()
        .filter(|r| r.offset != sp.offset)
        .any(|r| r.overlaps(sp.offset, capacity as u64));
    if shared {
        return Err(Error::SharedString {
            object: name.to_string(),
            offset: sp.offset,
        });
    }

    let mut replacement = rewritten.into_bytes();
    replacement.resize(capacity, 0);

    Ok(Some(PatchEdit {
        offset: sp.offset,
        original: sp.value.as_bytes().to_vec(),
        replacement,
    }))
}

/// Plan every object of the package.
///
/// All objects are planned; every failure is logged with the chain that
/// pulled the object in and the first one is returned.
pub fn plan_package(
    package: &ResolvedPackage,
    graph: &DependencyGraph,
    jobs: usize,
) -> Result<BTreeMap<String, PatchPlan>> {
    let objects: Vec<&PackageEntry> = package.objects().collect();
    let planned = parallel_map(&objects, jobs, |entry| plan_object(&entry.soname, &entry.elf));

    let mut plans = BTreeMap::new();
    let mut failures = Vec::new();
    for (entry, result) in objects.iter().zip(planned) {
        match result {
            Ok(plan) => {
                plans.insert(entry.soname.clone(), plan);
            }
            Err(e) => {
                let mut chain = graph.requester_chain(&entry.soname);
                if chain.is_empty() {
                    chain.push(graph.root().to_string());
                }
                failures.push(e.required_by(chain));
            }
        }
    }

    if failures.is_empty() {
        return Ok(plans);
    }
    for extra in failures.iter().skip(1) {
        eprintln!("  [ERROR] {}", extra);
    }
    Err(failures.remove(0))
}
