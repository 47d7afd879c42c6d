//! Boot (FAT32) and root (ext4) partition image creation.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

use super::geometry::{FsKind, PartitionSpec, MIB};
use super::{helpers, mtools};
use crate::process::Cmd;

/// Create the FAT32 boot partition image and fill it from the boot tree.
///
/// The image size is fixed by the partition spec, not by the tree's contents.
pub fn create_boot_partition(image_path: &Path, spec: &PartitionSpec, boot_tree: &Path) -> Result<()> {
    if spec.kind != FsKind::Fat32 {
        bail!("partition {} is {}, expected fat32", spec.index, spec.kind.name());
    }

    allocate(image_path, spec.size_bytes)?;

    Cmd::new("mkfs.vfat")
        .args(["-F", "32", "-n", FsKind::Fat32.label()])
        .arg_path(image_path)
        .error_msg("mkfs.vfat failed")
        .run()?;

    let copied = mtools::mtools_copy_tree(image_path, boot_tree)?;
    tracing::info!(entries = copied, "boot partition populated");

    Ok(())
}

/// Create the ext4 root partition image with `mkfs.ext4 -d`.
///
/// Formatting and population happen in one step, without mounting. The
/// staging tree must fit: a root partition that is too small is an error,
/// never silently enlarged.
pub fn create_root_partition(rootfs: &Path, image_path: &Path, spec: &PartitionSpec) -> Result<()> {
    if spec.kind != FsKind::Ext4 {
        bail!("partition {} is {}, expected ext4", spec.index, spec.kind.name());
    }
    ensure_root_fits(rootfs, spec.size_bytes)?;

    allocate(image_path, spec.size_bytes)?;

    Cmd::new("mkfs.ext4")
        .args(["-q", "-F", "-L", FsKind::Ext4.label()])
        .args(["-d"])
        .arg_path(rootfs)
        .arg_path(image_path)
        .error_msg("mkfs.ext4 -d failed. Check that e2fsprogs supports -d flag.")
        .run()?;

    Ok(())
}

/// Fail early when the staging tree cannot fit into `size_bytes`.
///
/// Only rejects trees above the ext4 lower bound. Anything closer to the
/// limit is left to `mkfs.ext4 -d`, whose failure surfaces as a stage error.
pub fn ensure_root_fits(rootfs: &Path, size_bytes: u64) -> Result<()> {
    if size_bytes == 0 {
        bail!("root partition size is zero");
    }
    let needed = helpers::ext4_lower_bound_bytes(rootfs, size_bytes)
        .with_context(|| format!("estimating size of {}", rootfs.display()))?;
    if needed > size_bytes {
        bail!(
            "root staging tree needs at least {} MiB but the root partition is {} MiB; \
             increase the image size",
            needed.div_ceil(MIB),
            size_bytes / MIB
        );
    }
    Ok(())
}

/// Zero-filled file of exactly `size_bytes`, replacing any stale image.
fn allocate(image_path: &Path, size_bytes: u64) -> Result<()> {
    if image_path.exists() {
        fs::remove_file(image_path)
            .with_context(|| format!("removing stale {}", image_path.display()))?;
    }
    let file = fs::File::create(image_path)
        .with_context(|| format!("Failed to create {}", image_path.display()))?;
    file.set_len(size_bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::disk::geometry::DiskGeometry;
    use crate::preflight::command_exists;
    use tempfile::TempDir;

    fn sparse_file(path: &Path, len: u64) {
        fs::File::create(path).unwrap().set_len(len).unwrap();
    }

    #[test]
    fn test_root_that_does_not_fit_is_fatal() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("big"), vec![0u8; 2 * MIB as usize]).unwrap();

        let err = ensure_root_fits(temp.path(), MIB).unwrap_err();
        assert!(err.to_string().contains("increase the image size"));
        assert!(ensure_root_fits(temp.path(), 64 * MIB).is_ok());
    }

    #[test]
    fn test_fit_boundary_at_minimum_root_size() {
        // 64 MiB: 1 KiB blocks, 1 MiB of inode tables, 1 block for the root dir
        let size = 64 * MIB;
        let capacity = size - MIB - 1024;

        let temp = TempDir::new().unwrap();
        let file = temp.path().join("payload");

        sparse_file(&file, capacity);
        assert!(ensure_root_fits(temp.path(), size).is_ok());

        sparse_file(&file, capacity + 1);
        assert!(ensure_root_fits(temp.path(), size).is_err());
    }

    #[test]
    fn test_tree_in_4k_rounding_slack_is_not_rejected() {
        // 4000 files of 1 byte: 15.6 MiB at 4 KiB blocks, under 4 MiB at 1 KiB.
        let temp = TempDir::new().unwrap();
        for i in 0..4000 {
            fs::write(temp.path().join(format!("f{i}")), b"x").unwrap();
        }
        assert!(ensure_root_fits(temp.path(), 8 * MIB).is_ok());
    }

    #[test]
    fn test_wrong_kind_is_rejected() {
        let temp = TempDir::new().unwrap();
        let geometry = DiskGeometry::for_image_size(512).unwrap();
        let img = temp.path().join("x.img");
        assert!(create_boot_partition(&img, &geometry.root, temp.path()).is_err());
        assert!(create_root_partition(temp.path(), &img, &geometry.boot).is_err());
    }

    #[test]
    fn test_boot_partition_with_mtools() {
        if !command_exists("mkfs.vfat") || !command_exists("mcopy") || !command_exists("mdir") {
            eprintln!("skipping: dosfstools/mtools not installed");
            return;
        }
        let temp = TempDir::new().unwrap();
        let boot_tree = temp.path().join("boot");
        fs::create_dir_all(boot_tree.join("overlays")).unwrap();
        fs::write(boot_tree.join("cmdline.txt"), "console=tty1\n").unwrap();
        fs::write(boot_tree.join("overlays/vc4.dtbo"), b"dtb").unwrap();

        let geometry = DiskGeometry::for_image_size(512).unwrap();
        let img = temp.path().join("boot.img");
        create_boot_partition(&img, &geometry.boot, &boot_tree).unwrap();

        assert_eq!(fs::metadata(&img).unwrap().len(), geometry.boot.size_bytes);
        let listing = mtools::mtools_list(&img, "/").unwrap().join("\n");
        assert!(listing.contains("cmdline.txt"));
        assert!(listing.contains("overlays"));
    }

    #[test]
    fn test_root_partition_with_mkfs_ext4() {
        if !command_exists("mkfs.ext4") {
            eprintln!("skipping: e2fsprogs not installed");
            return;
        }
        let temp = TempDir::new().unwrap();
        let rootfs = temp.path().join("rootfs");
        fs::create_dir_all(rootfs.join("etc")).unwrap();
        fs::write(rootfs.join("etc/hostname"), "alpine-pi\n").unwrap();

        let geometry = DiskGeometry::for_image_size(512).unwrap();
        let img = temp.path().join("root.img");
        create_root_partition(&rootfs, &img, &geometry.root).unwrap();

        assert_eq!(fs::metadata(&img).unwrap().len(), geometry.root.size_bytes);
    }
}
