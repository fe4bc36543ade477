//! Read-only access to an Android filesystem image.
//!
//! Every path handed to an [`ImageReader`] is an *image* path: absolute,
//! rooted at the image's `/`. Symlinks are resolved against the image root,
//! never the host root, so `/system/lib64/libc.so -> /apex/...` lands inside
//! the image (or inside an APEX overlay) rather than on the build machine.

pub mod apex;
mod mount;

use anyhow::{bail, Context};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub use mount::{detect_offset, LoopMount, SDK_IMAGE_OFFSET};

/// Same limit as Linux `MAXSYMLINKS`.
const MAX_SYMLINK_HOPS: usize = 40;

/// Path-addressable, read-only view of an image's file tree.
pub trait ImageReader: Send + Sync {
    /// Resolve every symlink in `path` relative to the image root.
    fn canonicalize(&self, path: &str) -> Result<String>;

    /// Read a file, following symlinks.
    fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Target of `path` if it is itself a symlink.
    fn read_link(&self, path: &str) -> Result<Option<String>>;

    /// Sorted entry names of a directory, following symlinks.
    fn list_dir(&self, path: &str) -> Result<Vec<String>>;

    /// Host location backing an image path (after symlink resolution).
    fn host_path(&self, path: &str) -> Result<PathBuf>;

    fn is_file(&self, path: &str) -> bool {
        self.host_path(path).map(|p| p.is_file()).unwrap_or(false)
    }

    fn is_dir(&self, path: &str) -> bool {
        self.host_path(path).map(|p| p.is_dir()).unwrap_or(false)
    }
}

/// Split an image path into normal components.
fn components(path: &str) -> impl DoubleEndedIterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

fn render(components: &[String]) -> String {
    format!("/{}", components.join("/"))
}

/// Lexically join `name` onto image directory `dir`.
pub fn join(dir: &str, name: &str) -> String {
    if name.starts_with('/') {
        return name.to_string();
    }
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

/// Parent directory of an image path (`/` for top-level entries).
pub fn parent(path: &str) -> String {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) | None => "/".to_string(),
        Some((dir, _)) => dir.to_string(),
    }
}

/// File name component of an image path.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// An image exposed as a host directory (extracted tree or mount point),
/// optionally with extra host directories grafted in at image paths.
#[derive(Debug, Clone)]
pub struct DirImage {
    root: PathBuf,
    /// (image mount point components, host directory)
    overlays: Vec<(Vec<String>, PathBuf)>,
}

impl DirImage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let meta = fs::metadata(&root).map_err(|e| Error::io(&root, e))?;
        if !meta.is_dir() {
            return Err(Error::io(
                &root,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a directory"),
            ));
        }
        Ok(Self {
            root,
            overlays: Vec::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Graft `host_dir` into the image at `image_path`.
    pub fn add_overlay(&mut self, image_path: &str, host_dir: impl Into<PathBuf>) {
        let mount: Vec<String> = components(image_path).map(str::to_string).collect();
        self.overlays.retain(|(m, _)| *m != mount);
        self.overlays.push((mount, host_dir.into()));
    }

    pub fn overlays(&self) -> impl Iterator<Item = (String, &Path)> {
        self.overlays
            .iter()
            .map(|(mount, host)| (render(mount), host.as_path()))
    }

    /// Host path for already-resolved components; the longest overlay wins.
    fn map(&self, resolved: &[String]) -> PathBuf {
        let overlay = self
            .overlays
            .iter()
            .filter(|(mount, _)| resolved.starts_with(mount))
            .max_by_key(|(mount, _)| mount.len());

        let (base, rest) = match overlay {
            Some((mount, host)) => (host, &resolved[mount.len()..]),
            None => (&self.root, resolved),
        };
        let mut host = base.clone();
        for component in rest {
            host.push(component);
        }
        host
    }

    /// Directories that exist only because an overlay is mounted below them.
    fn is_overlay_ancestor(&self, resolved: &[String]) -> bool {
        self.overlays
            .iter()
            .any(|(mount, _)| mount.len() > resolved.len() && mount.starts_with(resolved))
    }

    fn resolve(&self, path: &str) -> Result<Vec<String>> {
        let mut pending: VecDeque<String> = components(path).map(str::to_string).collect();
        let mut resolved: Vec<String> = Vec::new();
        let mut hops = 0;

        while let Some(component) = pending.pop_front() {
            if component == "." {
                continue;
            }
            if component == ".." {
                // `..` at the image root stays at the root.
                resolved.pop();
                continue;
            }
            resolved.push(component);

            if self.is_overlay_ancestor(&resolved) {
                continue;
            }

            let host = self.map(&resolved);
            let meta = fs::symlink_metadata(&host).map_err(|e| Error::io(&host, e))?;
            if !meta.file_type().is_symlink() {
                continue;
            }

            hops += 1;
            if hops > MAX_SYMLINK_HOPS {
                return Err(Error::SymlinkLoop {
                    path: path.to_string(),
                });
            }

            let target = fs::read_link(&host).map_err(|e| Error::io(&host, e))?;
            let target = target.to_string_lossy();
            resolved.pop();
            if target.starts_with('/') {
                resolved.clear();
            }
            for part in components(&target).rev() {
                pending.push_front(part.to_string());
            }
        }

        Ok(resolved)
    }
}

impl ImageReader for DirImage {
    fn canonicalize(&self, path: &str) -> Result<String> {
        self.resolve(path).map(|c| render(&c))
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let host = self.host_path(path)?;
        fs::read(&host).map_err(|e| Error::io(&host, e))
    }

    fn read_link(&self, path: &str) -> Result<Option<String>> {
        let mut resolved = self.resolve(&parent(path))?;
        resolved.push(file_name(path).to_string());
        let host = self.map(&resolved);
        let meta = fs::symlink_metadata(&host).map_err(|e| Error::io(&host, e))?;
        if !meta.file_type().is_symlink() {
            return Ok(None);
        }
        let target = fs::read_link(&host).map_err(|e| Error::io(&host, e))?;
        Ok(Some(target.to_string_lossy().into_owned()))
    }

    fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let resolved = self.resolve(path)?;
        let mut names = Vec::new();

        let host = self.map(&resolved);
        if host.is_dir() {
            for entry in fs::read_dir(&host).map_err(|e| Error::io(&host, e))? {
                let entry = entry.map_err(|e| Error::io(&host, e))?;
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        for (mount, _) in &self.overlays {
            if mount.len() == resolved.len() + 1 && mount.starts_with(&resolved) {
                names.push(mount[resolved.len()].clone());
            }
        }

        names.sort();
        names.dedup();
        Ok(names)
    }

    fn host_path(&self, path: &str) -> Result<PathBuf> {
        self.resolve(path).map(|c| self.map(&c))
    }

    fn is_dir(&self, path: &str) -> bool {
        self.resolve(path)
            .map(|c| self.is_overlay_ancestor(&c) || self.map(&c).is_dir())
            .unwrap_or(false)
    }
}

/// An opened image for the duration of one packaging run.
///
/// Owns the loop mount when the image is a raw file; unmounts on drop.
pub struct ImageHandle {
    image: DirImage,
    source: PathBuf,
    mount: Option<LoopMount>,
}

impl ImageHandle {
    pub fn reader(&self) -> &DirImage {
        &self.image
    }

    pub fn reader_mut(&mut self) -> &mut DirImage {
        &mut self.image
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn is_mounted(&self) -> bool {
        self.mount.is_some()
    }
}

/// Open an image: an extracted directory is used as-is, a raw image file is
/// loop-mounted read-only under `work_dir`. Without an explicit `offset`
/// the filesystem is located with [`detect_offset`].
pub fn open(source: &Path, offset: Option<u64>, work_dir: &Path) -> anyhow::Result<ImageHandle> {
    if source.is_dir() {
        let image = DirImage::new(source)
            .with_context(|| format!("Failed to open image directory {}", source.display()))?;
        return Ok(ImageHandle {
            image,
            source: source.to_path_buf(),
            mount: None,
        });
    }

    if !source.is_file() {
        bail!("Image not found: {}", source.display());
    }

    let offset = match offset {
        Some(offset) => offset,
        None => detect_offset(source)?,
    };
    println!(
        "Mounting {} (read-only, offset {})...",
        source.display(),
        offset
    );
    let mount = LoopMount::mount(source, offset, work_dir)?;
    let image = DirImage::new(mount.path())
        .with_context(|| format!("Mount point {} is unusable", mount.path().display()))?;
    Ok(ImageHandle {
        image,
        source: source.to_path_buf(),
        mount: Some(mount),
    })
}
