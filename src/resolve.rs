//! Library dependency closure.
//!
//! Mirrors what bionic's loader does at run time, but ahead of time and
//! against an image instead of a live root: starting from the target's
//! `DT_NEEDED` list (and its interpreter), every requested soname is located
//! through the object's own `DT_RUNPATH` and then the configured search
//! tiers, parsed, and its own `DT_NEEDED` entries queued.
//!
//! The closure is breadth-first and level-synchronous. Each frontier is
//! located and parsed in parallel (read-only work); a single owner then
//! merges the results in frontier order, so the visited set and the graph
//! have exactly one writer and the output is deterministic. Mutual
//! dependencies between libraries are legal and terminate on the visited
//! check.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::common::parallel_map;
use crate::elf::{self, ElfClass, ElfObject, ElfTarget};
use crate::error::{Error, Result};
use crate::image::{self, ImageReader};

/// Directories searched with equal priority.
pub type Tier = Vec<String>;

/// Where to look for a soname, and which sonames never to look for.
#[derive(Debug, Clone, Default)]
pub struct SearchPolicy {
    /// Searched in order; the first tier with a match wins.
    pub tiers: Vec<Tier>,
    /// Names provided by the loader or emulator itself.
    pub exclude: BTreeSet<String>,
}

impl SearchPolicy {
    pub fn new(tiers: Vec<Tier>, exclude: impl IntoIterator<Item = String>) -> Self {
        Self {
            tiers,
            exclude: exclude.into_iter().collect(),
        }
    }

    /// Parse a search path: `:` separates tiers, `|` joins directories of
    /// equal priority within a tier. `$LIB`/`${LIB}` expand per class.
    ///
    /// `"/system/${LIB}|/system_ext/${LIB}:/vendor/${LIB}"` is two tiers.
    pub fn parse_tiers(spec: &str, class: ElfClass) -> Vec<Tier> {
        spec.split(':')
            .map(|tier| {
                tier.split('|')
                    .map(str::trim)
                    .filter(|dir| !dir.is_empty())
                    .filter_map(|dir| expand_placeholders(dir, None, class))
                    .collect::<Tier>()
            })
            .filter(|tier| !tier.is_empty())
            .collect()
    }

    pub fn is_excluded(&self, soname: &str) -> bool {
        self.exclude.contains(soname)
    }
}

/// Expand loader placeholders in one search path entry.
///
/// Returns None when the entry needs `$ORIGIN` but no origin is known.
pub fn expand_placeholders(entry: &str, origin: Option<&str>, class: ElfClass) -> Option<String> {
    let mut expanded = entry
        .replace("${LIB}", class.lib_dir())
        .replace("$LIB", class.lib_dir());

    if expanded.contains("$ORIGIN") || expanded.contains("${ORIGIN}") {
        let origin = origin?;
        expanded = expanded
            .replace("${ORIGIN}", origin)
            .replace("$ORIGIN", origin);
    }

    Some(expanded)
}

/// One resolved shared object. Immutable once parsed.
#[derive(Debug, Clone, Serialize)]
pub struct LibraryNode {
    /// The name other objects request it by (the image path for the
    /// interpreter).
    pub soname: String,
    /// Canonical (symlink-free) path inside the image.
    pub path: String,
    pub elf: ElfObject,
}

impl LibraryNode {
    pub fn needed(&self) -> &[String] {
        &self.elf.needed
    }

    /// `DT_RUNPATH` directories with placeholders expanded against this
    /// object's own location. Relative leftovers are dropped.
    pub fn runpath(&self) -> Vec<String> {
        let origin = image::parent(&self.path);
        self.elf
            .runpath_dirs()
            .into_iter()
            .filter_map(|dir| expand_placeholders(dir, Some(&origin), self.elf.class))
            .filter(|dir| dir.starts_with('/'))
            .collect()
    }
}

/// What the closure starts from.
#[derive(Debug, Clone)]
pub struct Seeds {
    /// Name of the requesting executable, the head of every requester chain.
    pub root: String,
    pub needed: Vec<String>,
    /// The root's own runtime search directories (already expanded).
    pub runpath: Vec<String>,
    /// Image path of the program interpreter.
    pub interpreter: Option<String>,
}

impl Seeds {
    /// Seeds from a parsed executable.
    ///
    /// `origin` is the executable's image directory when it lives inside
    /// the image; `$ORIGIN` entries of a host-side executable are ignored.
    pub fn from_executable(
        root: &str,
        exe: &ElfObject,
        origin: Option<&str>,
        interpreter: Option<String>,
    ) -> Self {
        let runpath = exe
            .runpath_dirs()
            .into_iter()
            .filter_map(|dir| expand_placeholders(dir, origin, exe.class))
            .filter(|dir| dir.starts_with('/'))
            .collect();

        Self {
            root: root.to_string(),
            needed: exe.needed.clone(),
            runpath,
            interpreter: interpreter.or_else(|| exe.interpreter.clone()),
        }
    }

    /// Seeds from an explicit soname list.
    pub fn from_sonames(root: &str, sonames: Vec<String>, interpreter: Option<String>) -> Self {
        Self {
            root: root.to_string(),
            needed: sonames,
            runpath: Vec::new(),
            interpreter,
        }
    }
}

/// Soname-keyed dependency graph; edges follow `DT_NEEDED` and may cycle.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    root: String,
    nodes: HashMap<String, LibraryNode>,
    /// Breadth-first discovery order.
    order: Vec<String>,
    /// Every object that requested a name, first requester first.
    requesters: HashMap<String, Vec<String>>,
    /// Declared `DT_SONAME` -> (requested name, canonical path).
    declared: HashMap<String, (String, String)>,
    /// Excluded names that something requested.
    excluded: BTreeSet<String>,
    interpreter: Option<LibraryNode>,
}

impl DependencyGraph {
    fn new(root: &str) -> Self {
        Self {
            root: root.to_string(),
            ..Default::default()
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, soname: &str) -> Option<&LibraryNode> {
        self.nodes.get(soname)
    }

    pub fn contains(&self, soname: &str) -> bool {
        self.nodes.contains_key(soname)
    }

    /// Nodes in breadth-first discovery order.
    pub fn nodes(&self) -> impl Iterator<Item = &LibraryNode> {
        self.order.iter().filter_map(|soname| self.nodes.get(soname))
    }

    pub fn interpreter(&self) -> Option<&LibraryNode> {
        self.interpreter.as_ref()
    }

    pub fn excluded(&self) -> &BTreeSet<String> {
        &self.excluded
    }

    /// Everything that requested `soname`.
    pub fn requesters(&self, soname: &str) -> &[String] {
        self.requesters
            .get(soname)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// `(from, to)` for every `DT_NEEDED` edge between resolved nodes.
    pub fn edges(&self) -> impl Iterator<Item = (&str, &str)> {
        self.nodes().flat_map(|node| {
            node.needed()
                .iter()
                .map(move |dep| (node.soname.as_str(), dep.as_str()))
        })
    }

    /// Chain from the root to `soname` following first requesters,
    /// excluding `soname` itself. Empty for the root.
    pub fn requester_chain(&self, soname: &str) -> Vec<String> {
        match self.requesters(soname).first() {
            Some(first) => self.chain_to(first),
            None => Vec::new(),
        }
    }

    /// Chain from the root to `requester`, inclusive.
    fn chain_to(&self, requester: &str) -> Vec<String> {
        let mut chain = vec![requester.to_string()];
        let mut seen: HashSet<&str> = HashSet::from([requester]);
        let mut current = requester;

        while let Some(first) = self.requesters(current).first() {
            if !seen.insert(first.as_str()) {
                break;
            }
            chain.push(first.clone());
            current = first.as_str();
        }

        chain.reverse();
        chain
    }

    fn add_requester(&mut self, soname: &str, requester: &str) {
        let list = self.requesters.entry(soname.to_string()).or_default();
        if !list.iter().any(|r| r == requester) {
            list.push(requester.to_string());
        }
    }

    /// Insert a freshly parsed node, rejecting a second file that declares
    /// the same `DT_SONAME`.
    fn insert(&mut self, node: LibraryNode) -> Result<()> {
        if let Some(declared) = &node.elf.soname {
            match self.declared.get(declared) {
                Some((_, other_path)) if *other_path != node.path => {
                    return Err(Error::AmbiguousSoname {
                        soname: declared.clone(),
                        candidates: vec![other_path.clone(), node.path.clone()],
                        chain: Vec::new(),
                    });
                }
                Some(_) => {}
                None => {
                    self.declared
                        .insert(declared.clone(), (node.soname.clone(), node.path.clone()));
                }
            }
        }

        self.order.push(node.soname.clone());
        self.nodes.insert(node.soname.clone(), node);
        Ok(())
    }
}

/// A soname waiting to be located.
#[derive(Debug, Clone)]
struct Pending {
    soname: String,
    requester: String,
    /// Requester's runtime search directories, searched before the policy.
    runpath: Vec<String>,
}

/// Computes the dependency closure against one image.
pub struct Resolver<'a> {
    image: &'a dyn ImageReader,
    policy: &'a SearchPolicy,
    target: ElfTarget,
    jobs: usize,
}

impl<'a> Resolver<'a> {
    pub fn new(image: &'a dyn ImageReader, policy: &'a SearchPolicy, target: ElfTarget) -> Self {
        Self {
            image,
            policy,
            target,
            jobs: 1,
        }
    }

    /// Number of worker threads used per frontier.
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    /// Resolve the full closure of `seeds`.
    ///
    /// Keeps going after a failure so every problem of the run is logged;
    /// the first failure in breadth-first order is returned.
    pub fn resolve(&self, seeds: &Seeds) -> Result<DependencyGraph> {
        let mut graph = DependencyGraph::new(&seeds.root);
        let mut visited: HashSet<String> = HashSet::new();
        let mut failures: Vec<Error> = Vec::new();
        let mut frontier: Vec<Pending> = Vec::new();

        self.enqueue(
            &mut graph,
            &mut visited,
            &mut frontier,
            &seeds.root,
            &seeds.needed,
            &seeds.runpath,
        );

        if let Some(interpreter) = &seeds.interpreter {
            match self.load_interpreter(interpreter) {
                Ok(node) => {
                    let name = node.soname.clone();
                    let needed = node.elf.needed.clone();
                    let runpath = node.runpath();
                    graph.add_requester(&name, &seeds.root);
                    graph.interpreter = Some(node);
                    self.enqueue(
                        &mut graph,
                        &mut visited,
                        &mut frontier,
                        &name,
                        &needed,
                        &runpath,
                    );
                }
                Err(e) => failures.push(e.required_by(vec![seeds.root.clone()])),
            }
        }

        while !frontier.is_empty() {
            let located = parallel_map(&frontier, self.jobs, |pending| self.locate(pending));

            let mut next = Vec::new();
            for (pending, result) in frontier.into_iter().zip(located) {
                let chain = graph.chain_to(&pending.requester);
                let node = match result {
                    Ok(node) => node,
                    Err(e) => {
                        failures.push(e.required_by(chain));
                        continue;
                    }
                };

                let needed = node.elf.needed.clone();
                let runpath = node.runpath();
                let soname = node.soname.clone();
                if let Err(e) = graph.insert(node) {
                    failures.push(e.required_by(chain));
                    continue;
                }
                self.enqueue(&mut graph, &mut visited, &mut next, &soname, &needed, &runpath);
            }
            frontier = next;
        }

        if failures.is_empty() {
            return Ok(graph);
        }
        for extra in failures.iter().skip(1) {
            eprintln!("  [ERROR] {}", extra);
        }
        Err(failures.remove(0))
    }

    fn enqueue(
        &self,
        graph: &mut DependencyGraph,
        visited: &mut HashSet<String>,
        queue: &mut Vec<Pending>,
        requester: &str,
        needed: &[String],
        runpath: &[String],
    ) {
        for soname in needed {
            graph.add_requester(soname, requester);
            if self.policy.is_excluded(soname) {
                graph.excluded.insert(soname.clone());
                continue;
            }
            if visited.insert(soname.clone()) {
                queue.push(Pending {
                    soname: soname.clone(),
                    requester: requester.to_string(),
                    runpath: runpath.to_vec(),
                });
            }
        }
    }

    /// Find and parse the object providing `pending.soname`.
    fn locate(&self, pending: &Pending) -> Result<LibraryNode> {
        if pending.soname.contains('/') {
            let path = self.image.canonicalize(&pending.soname).map_err(|e| {
                if e.is_not_found() {
                    unresolved(&pending.soname)
                } else {
                    e
                }
            })?;
            return self.load(&pending.soname, &path);
        }

        let runpath_tiers = pending.runpath.iter().map(|dir| vec![dir.clone()]);
        for tier in runpath_tiers.chain(self.policy.tiers.iter().cloned()) {
            if let Some(node) = self.search_tier(&pending.soname, &tier)? {
                return Ok(node);
            }
        }

        Err(unresolved(&pending.soname))
    }

    /// Search every directory of one tier. More than one distinct,
    /// architecture-compatible match is ambiguous.
    fn search_tier(&self, soname: &str, tier: &[String]) -> Result<Option<LibraryNode>> {
        let mut found: Vec<LibraryNode> = Vec::new();

        for dir in tier {
            let candidate = image::join(dir, soname);
            let path = match self.image.canonicalize(&candidate) {
                Ok(path) => path,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            if !self.image.is_file(&path) || found.iter().any(|n| n.path == path) {
                continue;
            }

            match self.load(soname, &path) {
                Ok(node) => found.push(node),
                Err(e) if e.is_skippable() => {
                    eprintln!("  [WARN] Skipping {}: {}", candidate, e);
                }
                Err(e) => return Err(e),
            }
        }

        if found.len() > 1 {
            return Err(Error::AmbiguousSoname {
                soname: soname.to_string(),
                candidates: found.into_iter().map(|n| n.path).collect(),
                chain: Vec::new(),
            });
        }
        Ok(found.pop())
    }

    fn load_interpreter(&self, path: &str) -> Result<LibraryNode> {
        let canonical = self.image.canonicalize(path).map_err(|e| {
            if e.is_not_found() {
                unresolved(path)
            } else {
                e
            }
        })?;
        self.load(path, &canonical)
    }

    fn load(&self, soname: &str, path: &str) -> Result<LibraryNode> {
        let bytes = self.image.read(path)?;
        let elf = elf::parse(path, &bytes, &self.target)?;
        Ok(LibraryNode {
            soname: soname.to_string(),
            path: path.to_string(),
            elf,
        })
    }
}

fn unresolved(soname: &str) -> Error {
    Error::UnresolvedLibrary {
        soname: soname.to_string(),
        chain: Vec::new(),
    }
}
