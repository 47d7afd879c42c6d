//! Raw SD card image builder.
//!
//! Turns the boot and root staging trees into a single raw disk image without
//! mounting anything:
//!
//! 1. [`build_partitions`] formats `boot.img` (FAT32, fixed size) and
//!    `root.img` (ext4 via `mkfs.ext4 -d`, sized from the geometry).
//! 2. [`assemble`] writes the MBR into a zero-filled file of the full image
//!    size and splices both partition images in at their offsets.

pub mod assembly;
pub mod geometry;
pub mod helpers;
pub mod mbr;
pub mod mtools;
pub mod partitions;

pub use assembly::{verify_placements, AssembledDisk, Placement};
pub use geometry::{DiskGeometry, FsKind, PartitionSpec};
pub use mbr::Mbr;

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// File names used inside the work directory.
pub const BOOT_IMAGE_NAME: &str = "boot.img";
pub const ROOT_IMAGE_NAME: &str = "root.img";
pub const RAW_IMAGE_NAME: &str = "alpine-rpi.img";

/// The two intermediate filesystem images.
#[derive(Debug, Clone)]
pub struct PartitionImages {
    pub boot: PathBuf,
    pub root: PathBuf,
}

impl PartitionImages {
    /// Where the images live inside a work directory.
    pub fn in_work_dir(work_dir: &Path) -> Self {
        Self {
            boot: work_dir.join(BOOT_IMAGE_NAME),
            root: work_dir.join(ROOT_IMAGE_NAME),
        }
    }
}

/// Build the FAT32 boot image and the ext4 root image.
pub fn build_partitions(
    geometry: &DiskGeometry,
    boot_tree: &Path,
    root_tree: &Path,
    work_dir: &Path,
) -> Result<PartitionImages> {
    helpers::check_host_tools()?;
    fs::create_dir_all(work_dir)
        .with_context(|| format!("creating work directory {}", work_dir.display()))?;

    let images = PartitionImages::in_work_dir(work_dir);

    tracing::info!(size_mib = geometry.boot.size_mib(), "creating boot partition image");
    partitions::create_boot_partition(&images.boot, &geometry.boot, boot_tree)
        .context("Failed to create boot partition image")?;

    tracing::info!(size_mib = geometry.root.size_mib(), "creating root partition image");
    partitions::create_root_partition(root_tree, &images.root, &geometry.root)
        .context("Failed to create root partition image")?;

    Ok(images)
}

/// Assemble the raw disk image from previously built partition images.
pub fn assemble(
    geometry: &DiskGeometry,
    images: &PartitionImages,
    work_dir: &Path,
    disk_signature: u32,
) -> Result<AssembledDisk> {
    let raw_path = work_dir.join(RAW_IMAGE_NAME);
    tracing::info!(
        total_mib = geometry.total_mib(),
        "assembling {}",
        raw_path.display()
    );
    assembly::assemble_disk(&raw_path, &images.boot, &images.root, geometry, disk_signature)
}
