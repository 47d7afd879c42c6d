//! Disk assembly: MBR creation and partition splicing.

use anyhow::{bail, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::geometry::DiskGeometry;
use super::mbr::Mbr;

/// Where one filesystem image gets copied inside the raw disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub index: u8,
    pub offset_bytes: u64,
    /// Bytes available at `offset_bytes` before the next partition.
    pub limit_bytes: u64,
    pub source: PathBuf,
}

/// Copy destinations for the boot and root images, taken from the geometry.
pub fn plan_placements(
    geometry: &DiskGeometry,
    boot_image: &Path,
    root_image: &Path,
) -> [Placement; 2] {
    [
        Placement {
            index: geometry.boot.index,
            offset_bytes: geometry.boot.start_bytes,
            limit_bytes: geometry.boot.size_bytes,
            source: boot_image.to_path_buf(),
        },
        Placement {
            index: geometry.root.index,
            offset_bytes: geometry.root.start_bytes,
            limit_bytes: geometry.root.size_bytes,
            source: root_image.to_path_buf(),
        },
    ]
}

/// Fail unless every copy destination matches the partition table exactly.
///
/// A mismatch here means the image would not boot: the firmware would look
/// for the FAT volume at the table's offset while the bytes sit elsewhere.
pub fn verify_placements(table: &Mbr, placements: &[Placement]) -> Result<()> {
    for placement in placements {
        let entry = table.partition(placement.index).with_context(|| {
            format!(
                "partition {} is missing from the partition table",
                placement.index
            )
        })?;

        if entry.start_bytes() != placement.offset_bytes {
            bail!(
                "partition {} offset mismatch: table declares byte {}, copy would write at byte {}",
                placement.index,
                entry.start_bytes(),
                placement.offset_bytes
            );
        }
        if entry.size_bytes() != placement.limit_bytes {
            bail!(
                "partition {} size mismatch: table declares {} bytes, copy allows {} bytes",
                placement.index,
                entry.size_bytes(),
                placement.limit_bytes
            );
        }
    }
    Ok(())
}

/// Result of a successful assembly.
#[derive(Debug, Clone)]
pub struct AssembledDisk {
    pub path: PathBuf,
    pub table: Mbr,
}

/// Assemble a raw MBR disk image from partition images.
///
/// Allocates a zero-filled file of exactly `geometry.total_bytes`, writes the
/// partition table, then splices the boot and root images at their offsets
/// without truncating. A partially written image is removed on failure.
pub fn assemble_disk(
    disk_path: &Path,
    boot_image: &Path,
    root_image: &Path,
    geometry: &DiskGeometry,
    disk_signature: u32,
) -> Result<AssembledDisk> {
    let result = assemble_disk_inner(disk_path, boot_image, root_image, geometry, disk_signature);
    if result.is_err() {
        let _ = fs::remove_file(disk_path);
    }
    result
}

fn assemble_disk_inner(
    disk_path: &Path,
    boot_image: &Path,
    root_image: &Path,
    geometry: &DiskGeometry,
    disk_signature: u32,
) -> Result<AssembledDisk> {
    geometry.validate().context("disk geometry is inconsistent")?;

    let placements = plan_placements(geometry, boot_image, root_image);
    for placement in &placements {
        let len = fs::metadata(&placement.source)
            .with_context(|| format!("Failed to stat {}", placement.source.display()))?
            .len();
        if len > placement.limit_bytes {
            bail!(
                "{} is {} bytes but partition {} only holds {} bytes",
                placement.source.display(),
                len,
                placement.index,
                placement.limit_bytes
            );
        }
    }

    // Zero-filled allocation (sparse where the filesystem allows it)
    {
        let file = File::create(disk_path)
            .with_context(|| format!("Failed to create {}", disk_path.display()))?;
        file.set_len(geometry.total_bytes)?;
    }

    let table = Mbr::for_geometry(geometry, disk_signature)?;
    {
        let mut disk = OpenOptions::new().write(true).open(disk_path)?;
        disk.seek(SeekFrom::Start(0))?;
        disk.write_all(&table.to_bytes())?;
        disk.sync_all()?;
    }
    tracing::info!(
        boot_start = geometry.boot.start_bytes,
        root_start = geometry.root.start_bytes,
        "partition table written"
    );

    // Compare against what is actually on disk, not the in-memory table.
    let on_disk = Mbr::read_from(disk_path)?;
    verify_placements(&on_disk, &placements)?;

    for placement in &placements {
        tracing::info!(
            partition = placement.index,
            offset = placement.offset_bytes,
            "writing {}",
            placement.source.display()
        );
        splice(disk_path, placement)?;
    }

    let final_len = fs::metadata(disk_path)?.len();
    if final_len != geometry.total_bytes {
        bail!(
            "assembled image is {} bytes, expected exactly {}",
            final_len,
            geometry.total_bytes
        );
    }

    Ok(AssembledDisk {
        path: disk_path.to_path_buf(),
        table: on_disk,
    })
}

/// Copy one image into the disk at its offset, like `dd conv=notrunc seek=N`.
fn splice(disk_path: &Path, placement: &Placement) -> Result<()> {
    let mut src = File::open(&placement.source)
        .with_context(|| format!("Failed to open {}", placement.source.display()))?;
    let mut disk = OpenOptions::new()
        .write(true)
        .truncate(false)
        .open(disk_path)
        .with_context(|| format!("Failed to open {}", disk_path.display()))?;

    disk.seek(SeekFrom::Start(placement.offset_bytes))?;
    let copied = io::copy(&mut (&mut src).take(placement.limit_bytes), &mut disk)
        .with_context(|| {
            format!(
                "Failed to copy {} into partition {}",
                placement.source.display(),
                placement.index
            )
        })?;
    disk.sync_all()?;

    let expected = src.metadata()?.len();
    if copied != expected {
        bail!(
            "short copy into partition {}: wrote {} of {} bytes",
            placement.index,
            copied,
            expected
        );
    }
    Ok(())
}
