//! Read-only loop mounts for raw image files.

use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::process::Cmd;

/// Where the filesystem starts in an SDK `system.img`: three 1 MiB
/// alignment units past the partition table.
pub const SDK_IMAGE_OFFSET: u64 = 512 * 2048 * 3;

/// Filesystems start their superblock 1 KiB in.
const SUPERBLOCK: u64 = 1024;
const EXT4_MAGIC: u16 = 0xef53;
/// Offset of `s_magic` inside the ext4 superblock.
const EXT4_MAGIC_AT: usize = 56;
const EROFS_MAGIC: u32 = 0xe0f5_e1e2;

/// Find the filesystem inside a raw image: either right at the start or at
/// [`SDK_IMAGE_OFFSET`]. Falls back to the SDK layout when neither carries
/// a known superblock.
pub fn detect_offset(image: &Path) -> Result<u64> {
    let mut file =
        File::open(image).with_context(|| format!("Failed to open {}", image.display()))?;

    for offset in [0, SDK_IMAGE_OFFSET] {
        if has_superblock(&mut file, offset)
            .with_context(|| format!("Failed to read {}", image.display()))?
        {
            return Ok(offset);
        }
    }

    eprintln!(
        "  [WARN] No ext4/erofs superblock found in {}, assuming offset {}",
        image.display(),
        SDK_IMAGE_OFFSET
    );
    Ok(SDK_IMAGE_OFFSET)
}

fn has_superblock(file: &mut File, offset: u64) -> std::io::Result<bool> {
    let mut block = [0u8; 64];
    file.seek(SeekFrom::Start(offset + SUPERBLOCK))?;
    match file.read_exact(&mut block) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(false),
        Err(e) => return Err(e),
    }

    let ext4 = u16::from_le_bytes([block[EXT4_MAGIC_AT], block[EXT4_MAGIC_AT + 1]]);
    let erofs = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
    Ok(ext4 == EXT4_MAGIC || erofs == EROFS_MAGIC)
}

/// A loop mount that is torn down when dropped.
pub struct LoopMount {
    mount_point: PathBuf,
}

impl LoopMount {
    /// Mount `image` read-only at a fresh directory under `work_dir`.
    ///
    /// `offset` is the byte offset of the filesystem inside the image file
    /// (SDK `system.img` files carry a partition table in front of it).
    pub fn mount(image: &Path, offset: u64, work_dir: &Path) -> Result<Self> {
        fs::create_dir_all(work_dir)
            .with_context(|| format!("Failed to create {}", work_dir.display()))?;

        // A leftover mount point may still have an image mounted on it, so it
        // is never cleared here.
        let mount_point = work_dir.join(format!("mount-{}", std::process::id()));
        if let Err(e) = fs::create_dir(&mount_point) {
            if e.kind() == ErrorKind::AlreadyExists {
                bail!(
                    "Mount point {} already exists (left by an earlier run?); unmount and remove it first",
                    mount_point.display()
                );
            }
            return Err(e)
                .with_context(|| format!("Failed to create mount point {}", mount_point.display()));
        }

        let options = if offset > 0 {
            format!("loop,ro,offset={}", offset)
        } else {
            "loop,ro".to_string()
        };

        let mounted = Cmd::new("sudo")
            .args(["mount", "-o", &options])
            .arg_path(image)
            .arg_path(&mount_point)
            .error_msg(format!(
                "Failed to mount {} at offset {} (use --offset to override)",
                image.display(),
                offset
            ))
            .run();

        if let Err(e) = mounted {
            let _ = fs::remove_dir(&mount_point);
            return Err(e);
        }

        Ok(Self { mount_point })
    }

    pub fn path(&self) -> &Path {
        &self.mount_point
    }
}

impl Drop for LoopMount {
    fn drop(&mut self) {
        let result = Cmd::new("sudo")
            .arg("umount")
            .arg_path(&self.mount_point)
            .allow_fail()
            .run();

        match result {
            Ok(r) if r.success() => {
                // Only ever remove the (now empty) mount point, never recurse.
                let _ = fs::remove_dir(&self.mount_point);
            }
            Ok(r) => eprintln!(
                "  [WARN] Failed to unmount {}: {}",
                self.mount_point.display(),
                r.stderr_trimmed()
            ),
            Err(e) => eprintln!(
                "  [WARN] Failed to unmount {}: {:#}",
                self.mount_point.display(),
                e
            ),
        }
    }
}
