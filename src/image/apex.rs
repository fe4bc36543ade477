//! APEX activation.
//!
//! Since Android 10, bionic (`libc.so`, `libm.so`, `libdl.so`) and the
//! dynamic linker live in the `com.android.runtime` APEX. On a device the
//! APEX is mounted at `/apex/<name>`; in a system image it is either a
//! flattened directory under `/system/apex/<name>/` or an `.apex` archive
//! whose `apex_payload.img` is an ext4 image. A compressed `.capex` wraps
//! the `.apex` as its `original_apex` member. Activation grafts the payload
//! into the image at `/apex/<name>` so `/system/lib64/libc.so` symlinks
//! resolve.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

use super::{DirImage, ImageReader};
use crate::cache;
use crate::common::{cleanup_work_dir, prepare_work_dir};
use crate::process::Cmd;

/// Name of the ext4 payload inside an `.apex` zip.
const PAYLOAD: &str = "apex_payload.img";
/// Name of the `.apex` zip inside a `.capex` zip.
const ORIGINAL_APEX: &str = "original_apex";

/// Archive form of an APEX shipped under `/system/apex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    /// `<name>.apex`
    Plain,
    /// `<name>.capex`, holding the `.apex` as `original_apex`
    Compressed,
}

impl ArchiveKind {
    fn extension(self) -> &'static str {
        match self {
            ArchiveKind::Plain => "apex",
            ArchiveKind::Compressed => "capex",
        }
    }
}

/// How an APEX ended up visible at `/apex/<name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
    /// Already present in the image.
    Present,
    /// `/system/apex/<name>/` overlaid as-is.
    Flattened,
    /// Payload extracted from an archive to the given host directory.
    Extracted(ArchiveKind, PathBuf),
    /// Not shipped by this image.
    Missing,
}

/// Make each named APEX visible at `/apex/<name>`.
pub fn activate(
    image: &mut DirImage,
    names: &[String],
    work_dir: &Path,
) -> Result<Vec<(String, Activation)>> {
    let mut activated = Vec::new();

    for name in names {
        let mount = format!("/apex/{}", name);
        let flattened = format!("/system/apex/{}", name);

        let activation = if image.is_dir(&mount) {
            Activation::Present
        } else if image.is_dir(&flattened) {
            let host = image.host_path(&flattened)?;
            image.add_overlay(&mount, host);
            Activation::Flattened
        } else if let Some((archive, kind)) = find_archive(image, name) {
            let host_archive = image.host_path(&archive)?;
            let dest = extract(&host_archive, kind, name, work_dir)
                .with_context(|| format!("Failed to extract APEX {}", archive))?;
            image.add_overlay(&mount, dest.clone());
            Activation::Extracted(kind, dest)
        } else {
            eprintln!("  [WARN] APEX {} not found in image", name);
            Activation::Missing
        };

        activated.push((name.clone(), activation));
    }

    Ok(activated)
}

/// The archive shipping `name`, a plain `.apex` first.
pub fn find_archive(image: &DirImage, name: &str) -> Option<(String, ArchiveKind)> {
    [ArchiveKind::Plain, ArchiveKind::Compressed]
        .into_iter()
        .map(|kind| (format!("/system/apex/{}.{}", name, kind.extension()), kind))
        .find(|(path, _)| image.is_file(path))
}

/// Extract an APEX archive's payload into `<work_dir>/apex/<name>`.
///
/// Reuses a previous extraction when the archive hash is unchanged.
fn extract(archive: &Path, kind: ArchiveKind, name: &str, work_dir: &Path) -> Result<PathBuf> {
    let apex_dir = work_dir.join("apex");
    let dest = apex_dir.join(name);
    let hash_file = apex_dir.join(format!("{}.hash", name));

    let hash = cache::hash_files(&[archive])
        .with_context(|| format!("Cannot read {}", archive.display()))?;
    if !cache::needs_rebuild(&hash, &hash_file, &dest) {
        println!("  APEX {} already extracted", name);
        return Ok(dest);
    }

    println!("  Extracting APEX {}...", name);
    let payload_dir = prepare_work_dir(&apex_dir, &format!("{}.payload", name))?;
    let dest = prepare_work_dir(&apex_dir, name)?;

    let result = match kind {
        ArchiveKind::Plain => Ok(archive.to_path_buf()),
        ArchiveKind::Compressed => decompress(archive, &payload_dir),
    }
    .and_then(|apex| extract_payload(&apex, &payload_dir, &dest));
    cleanup_work_dir(&payload_dir);
    if let Err(e) = result {
        cleanup_work_dir(&dest);
        return Err(e);
    }

    cache::write_cached_hash(&hash_file, &hash)?;
    Ok(dest)
}

/// Pull the `.apex` out of a `.capex` into `payload_dir`.
fn decompress(capex: &Path, payload_dir: &Path) -> Result<PathBuf> {
    Cmd::new("unzip")
        .args(["-o", "-q"])
        .arg_path(capex)
        .arg(ORIGINAL_APEX)
        .arg("-d")
        .arg_path(payload_dir)
        .error_msg("unzip failed. Install: sudo apt install unzip")
        .run()?;

    let apex = payload_dir.join(ORIGINAL_APEX);
    if !apex.is_file() {
        bail!("{} has no {}", capex.display(), ORIGINAL_APEX);
    }
    Ok(apex)
}

fn extract_payload(archive: &Path, payload_dir: &Path, dest: &Path) -> Result<()> {
    Cmd::new("unzip")
        .args(["-o", "-q"])
        .arg_path(archive)
        .arg(PAYLOAD)
        .arg("-d")
        .arg_path(payload_dir)
        .error_msg("unzip failed. Install: sudo apt install unzip")
        .run()?;

    let payload = payload_dir.join(PAYLOAD);
    if !payload.is_file() {
        bail!("{} has no {}", archive.display(), PAYLOAD);
    }

    let listing = Cmd::new("debugfs")
        .args(["-R", "ls -p /"])
        .arg_path(&payload)
        .error_msg("debugfs failed. Install: sudo apt install e2fsprogs")
        .run()?;

    for entry in parse_debugfs_listing(&listing.stdout) {
        let request = match entry.kind {
            EntryKind::Dir => format!("rdump /{} {}", entry.name, dest.display()),
            EntryKind::File => format!(
                "dump -p /{} {}",
                entry.name,
                dest.join(&entry.name).display()
            ),
            EntryKind::Other => {
                eprintln!("  [WARN] Skipping special APEX entry /{}", entry.name);
                continue;
            }
        };
        Cmd::new("debugfs")
            .args(["-R", &request])
            .arg_path(&payload)
            .error_msg(format!("debugfs could not extract /{}", entry.name))
            .run()?;
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Dir,
    File,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ListingEntry {
    name: String,
    kind: EntryKind,
}

/// Parse `debugfs -R "ls -p /"` output (`/inode/mode/uid/gid/name/size/`).
///
/// Skips `.`, `..` and `lost+found`.
fn parse_debugfs_listing(output: &str) -> Vec<ListingEntry> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.trim().split('/').collect();
            if fields.len() < 7 || !fields[0].is_empty() {
                return None;
            }
            let mode = u32::from_str_radix(fields[2], 8).ok()?;
            let name = fields[5];
            if name.is_empty() || matches!(name, "." | ".." | "lost+found") {
                return None;
            }
            let kind = match mode & 0o170000 {
                0o040000 => EntryKind::Dir,
                0o100000 => EntryKind::File,
                _ => EntryKind::Other,
            };
            Some(ListingEntry {
                name: name.to_string(),
                kind,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_parse_debugfs_listing() {
        let output = "debugfs 1.47.0 (5-Feb-2023)\n\
                      /2/040755/0/0/.//\n\
                      /2/040755/0/0/..//\n\
                      /11/040700/0/0/lost+found//\n\
                      /12/040755/0/2000/bin//\n\
                      /13/040755/0/0/lib64//\n\
                      /14/100644/0/0/apex_manifest.pb/52/\n\
                      /15/120777/0/0/etc/7/\n";
        let entries = parse_debugfs_listing(output);
        assert_eq!(
            entries,
            vec![
                ListingEntry { name: "bin".into(), kind: EntryKind::Dir },
                ListingEntry { name: "lib64".into(), kind: EntryKind::Dir },
                ListingEntry { name: "apex_manifest.pb".into(), kind: EntryKind::File },
                ListingEntry { name: "etc".into(), kind: EntryKind::Other },
            ]
        );
    }

    #[test]
    fn test_flattened_apex_is_overlaid() {
        let root = TempDir::new().unwrap();
        let bionic = root
            .path()
            .join("system/apex/com.android.runtime/lib64/bionic");
        fs::create_dir_all(&bionic).unwrap();
        fs::write(bionic.join("libc.so"), b"c").unwrap();

        let mut image = DirImage::new(root.path()).unwrap();
        let work = TempDir::new().unwrap();
        let names = vec!["com.android.runtime".to_string(), "com.android.art".to_string()];
        let activated = activate(&mut image, &names, work.path()).unwrap();

        assert_eq!(activated[0].1, Activation::Flattened);
        assert_eq!(activated[1].1, Activation::Missing);
        assert_eq!(
            image
                .read("/apex/com.android.runtime/lib64/bionic/libc.so")
                .unwrap(),
            b"c"
        );
    }

    #[test]
    fn test_archive_lookup_prefers_plain_apex() {
        let root = TempDir::new().unwrap();
        let apex_dir = root.path().join("system/apex");
        fs::create_dir_all(&apex_dir).unwrap();
        fs::write(apex_dir.join("com.android.art.capex"), b"zip").unwrap();
        fs::write(apex_dir.join("com.android.runtime.capex"), b"zip").unwrap();
        fs::write(apex_dir.join("com.android.runtime.apex"), b"zip").unwrap();

        let image = DirImage::new(root.path()).unwrap();
        assert_eq!(
            find_archive(&image, "com.android.art"),
            Some((
                "/system/apex/com.android.art.capex".to_string(),
                ArchiveKind::Compressed
            ))
        );
        assert_eq!(
            find_archive(&image, "com.android.runtime"),
            Some((
                "/system/apex/com.android.runtime.apex".to_string(),
                ArchiveKind::Plain
            ))
        );
        assert_eq!(find_archive(&image, "com.android.i18n"), None);
    }

    #[test]
    fn test_broken_capex_leaves_no_extraction() {
        let root = TempDir::new().unwrap();
        let apex_dir = root.path().join("system/apex");
        fs::create_dir_all(&apex_dir).unwrap();
        fs::write(apex_dir.join("com.android.art.capex"), b"not a zip").unwrap();

        let mut image = DirImage::new(root.path()).unwrap();
        let work = TempDir::new().unwrap();
        let err = activate(&mut image, &["com.android.art".to_string()], work.path())
            .unwrap_err();

        assert!(format!("{:#}", err).contains("com.android.art.capex"));
        assert!(!work.path().join("apex/com.android.art").exists());
        assert!(!work.path().join("apex/com.android.art.payload").exists());
        assert_eq!(image.overlays().count(), 0);
    }

    #[test]
    fn test_present_apex_left_alone() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("apex/com.android.runtime/bin")).unwrap();

        let mut image = DirImage::new(root.path()).unwrap();
        let work = TempDir::new().unwrap();
        let activated = activate(
            &mut image,
            &["com.android.runtime".to_string()],
            work.path(),
        )
        .unwrap();

        assert_eq!(activated[0].1, Activation::Present);
        assert_eq!(image.overlays().count(), 0);
    }
}
