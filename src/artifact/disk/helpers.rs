//! Host tool verification and size estimation helpers for disk image building.

use anyhow::{Context, Result};
use std::path::Path;
use walkdir::WalkDir;

use super::geometry::MIB;

/// Host tools required to build the two partition images.
pub const BASE_REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("mkfs.vfat", "dosfstools"),
    ("mcopy", "mtools"),
    ("mkfs.ext4", "e2fsprogs"),
];

/// Below this size mke2fs picks its "small" type with 1 KiB blocks.
const SMALL_FS_BYTES: u64 = 512 * MIB;

const SMALL_BLOCK_SIZE: u64 = 1024;
const DEFAULT_BLOCK_SIZE: u64 = 4096;

/// Fewest inode-table bytes mke2fs reserves per filesystem byte: one
/// 256-byte inode per 16 KiB, the sparsest of its default types.
const INODE_SIZE: u64 = 256;
const INODE_RATIO: u64 = 16 * 1024;

/// Verify all required host tools are available.
pub fn check_host_tools() -> Result<()> {
    crate::preflight::check_required_tools(BASE_REQUIRED_TOOLS)
}

/// Block size mke2fs chooses for a filesystem of `fs_bytes`.
pub fn ext4_block_size(fs_bytes: u64) -> u64 {
    if fs_bytes < SMALL_FS_BYTES {
        SMALL_BLOCK_SIZE
    } else {
        DEFAULT_BLOCK_SIZE
    }
}

/// Lower bound on the ext4 space a directory tree occupies in a filesystem
/// of `fs_bytes`.
///
/// Counts the data blocks of every file and directory plus the inode tables.
/// Journal, group descriptors and bitmaps are left out, so a tree over this
/// bound can never fit while one under it may still be refused by
/// `mkfs.ext4 -d`.
pub fn ext4_lower_bound_bytes(path: &Path, fs_bytes: u64) -> Result<u64> {
    let block = ext4_block_size(fs_bytes);
    let mut blocks = 0u64;

    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.with_context(|| format!("walking {}", path.display()))?;
        let file_type = entry.file_type();
        if file_type.is_file() {
            blocks += entry.metadata()?.len().div_ceil(block);
        } else if file_type.is_dir() {
            blocks += 1;
        }
    }

    let inode_tables = fs_bytes / INODE_RATIO * INODE_SIZE;
    Ok(blocks * block + inode_tables)
}
