//! Partition geometry for the two-partition SD card layout.
//!
//! Every byte offset the assembler uses, both in the partition table and as a
//! copy destination, comes from one [`DiskGeometry`] value. Nothing else in
//! the crate is allowed to spell out a partition offset.
//!
//! ```text
//! 0        4 MiB                       260 MiB                    total
//! | MBR .. | p1: FAT32 boot (256 MiB)  | p2: ext4 root (remaining) |
//! ```

use thiserror::Error;

/// One mebibyte. All partition arithmetic is done in whole MiB.
pub const MIB: u64 = 1024 * 1024;

/// Logical sector size used by the MBR.
pub const SECTOR_SIZE: u64 = 512;

/// Gap before the first partition. The Pi firmware and most SD card erase
/// blocks want partitions aligned to 4 MiB.
pub const ALIGNMENT_MIB: u64 = 4;

/// Fixed size of the FAT32 boot partition, independent of its contents.
pub const BOOT_PARTITION_MIB: u64 = 256;

/// Smallest root partition we are willing to produce.
pub const MIN_ROOT_PARTITION_MIB: u64 = 64;

/// Space consumed ahead of the root partition: alignment gap plus boot partition.
pub const ROOT_PARTITION_START_MIB: u64 = ALIGNMENT_MIB + BOOT_PARTITION_MIB;

/// Filesystem carried by a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Fat32,
    Ext4,
}

impl FsKind {
    /// MBR partition type byte.
    pub fn mbr_type(self) -> u8 {
        match self {
            // W95 FAT32 (LBA)
            FsKind::Fat32 => 0x0c,
            FsKind::Ext4 => 0x83,
        }
    }

    /// Volume label written at format time.
    pub fn label(self) -> &'static str {
        match self {
            FsKind::Fat32 => "BOOT",
            FsKind::Ext4 => "ROOT",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FsKind::Fat32 => "fat32",
            FsKind::Ext4 => "ext4",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GeometryError {
    #[error(
        "image size {total_mib} MiB leaves no room for a root partition \
         (boot {boot_mib} MiB + alignment {alignment_mib} MiB + minimum root {} MiB)",
        MIN_ROOT_PARTITION_MIB
    )]
    TooSmall {
        total_mib: u64,
        boot_mib: u64,
        alignment_mib: u64,
    },

    #[error("image size {total_mib} MiB exceeds what an MBR can address")]
    TooLarge { total_mib: u64 },

    #[error("partition {index} {what}")]
    Inconsistent { index: u8, what: String },
}

/// Location and type of one primary partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionSpec {
    /// 1-based partition number as the kernel names it (`mmcblk0p<index>`).
    pub index: u8,
    pub kind: FsKind,
    pub start_bytes: u64,
    pub size_bytes: u64,
    pub bootable: bool,
}

impl PartitionSpec {
    pub fn end_bytes(&self) -> u64 {
        self.start_bytes + self.size_bytes
    }

    pub fn start_lba(&self) -> u64 {
        self.start_bytes / SECTOR_SIZE
    }

    pub fn sector_count(&self) -> u64 {
        self.size_bytes / SECTOR_SIZE
    }

    pub fn size_mib(&self) -> u64 {
        self.size_bytes / MIB
    }

    fn overlaps(&self, other: &PartitionSpec) -> bool {
        self.start_bytes < other.end_bytes() && other.start_bytes < self.end_bytes()
    }
}

/// Root partition size in MiB for a given total, boot size and alignment gap.
///
/// Returns `None` when the subtraction would not leave at least
/// [`MIN_ROOT_PARTITION_MIB`].
pub fn root_partition_mib(total_mib: u64, boot_mib: u64, alignment_mib: u64) -> Option<u64> {
    total_mib
        .checked_sub(boot_mib)?
        .checked_sub(alignment_mib)
        .filter(|root| *root >= MIN_ROOT_PARTITION_MIB)
}

/// Full layout of the raw disk image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskGeometry {
    pub total_bytes: u64,
    pub boot: PartitionSpec,
    pub root: PartitionSpec,
}

impl DiskGeometry {
    /// Standard layout: 4 MiB gap, 256 MiB boot, root fills the rest.
    pub fn for_image_size(total_mib: u64) -> Result<Self, GeometryError> {
        Self::new(total_mib, BOOT_PARTITION_MIB, ALIGNMENT_MIB)
    }

    pub fn new(total_mib: u64, boot_mib: u64, alignment_mib: u64) -> Result<Self, GeometryError> {
        let root_mib = root_partition_mib(total_mib, boot_mib, alignment_mib).ok_or(
            GeometryError::TooSmall {
                total_mib,
                boot_mib,
                alignment_mib,
            },
        )?;

        if alignment_mib == 0 {
            return Err(GeometryError::Inconsistent {
                index: 1,
                what: "must not start at sector 0 (the MBR lives there)".to_string(),
            });
        }

        let total_bytes = total_mib
            .checked_mul(MIB)
            .ok_or(GeometryError::TooLarge { total_mib })?;
        if total_bytes / SECTOR_SIZE > u64::from(u32::MAX) {
            return Err(GeometryError::TooLarge { total_mib });
        }

        let boot = PartitionSpec {
            index: 1,
            kind: FsKind::Fat32,
            start_bytes: alignment_mib * MIB,
            size_bytes: boot_mib * MIB,
            bootable: true,
        };
        let root = PartitionSpec {
            index: 2,
            kind: FsKind::Ext4,
            start_bytes: boot.end_bytes(),
            size_bytes: root_mib * MIB,
            bootable: false,
        };

        let geometry = Self {
            total_bytes,
            boot,
            root,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    pub fn total_mib(&self) -> u64 {
        self.total_bytes / MIB
    }

    pub fn partitions(&self) -> [PartitionSpec; 2] {
        [self.boot, self.root]
    }

    /// Check every layout invariant. Runs on construction, and again by the
    /// assembler before it touches the image.
    pub fn validate(&self) -> Result<(), GeometryError> {
        for part in self.partitions() {
            if part.start_bytes % MIB != 0 || part.size_bytes % MIB != 0 {
                return Err(GeometryError::Inconsistent {
                    index: part.index,
                    what: "is not aligned to a MiB boundary".to_string(),
                });
            }
            if part.size_bytes == 0 {
                return Err(GeometryError::Inconsistent {
                    index: part.index,
                    what: "is empty".to_string(),
                });
            }
            if part.end_bytes() > self.total_bytes {
                return Err(GeometryError::Inconsistent {
                    index: part.index,
                    what: format!(
                        "ends at byte {} beyond the image size {}",
                        part.end_bytes(),
                        self.total_bytes
                    ),
                });
            }
        }

        if self.root.start_bytes != self.boot.end_bytes() {
            return Err(GeometryError::Inconsistent {
                index: self.root.index,
                what: format!(
                    "starts at byte {} but partition {} ends at byte {}",
                    self.root.start_bytes,
                    self.boot.index,
                    self.boot.end_bytes()
                ),
            });
        }
        if self.boot.overlaps(&self.root) {
            return Err(GeometryError::Inconsistent {
                index: self.root.index,
                what: "overlaps the boot partition".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_layout_512() {
        let g = DiskGeometry::for_image_size(512).unwrap();
        assert_eq!(g.total_bytes, 512 * MIB);
        assert_eq!(g.boot.start_bytes, 4 * MIB);
        assert_eq!(g.boot.size_mib(), 256);
        assert_eq!(g.root.start_bytes, 260 * MIB);
        assert_eq!(g.root.size_mib(), 252);
        assert_eq!(g.root.end_bytes(), g.total_bytes);
        assert!(g.boot.bootable);
        assert!(!g.root.bootable);
    }

    #[test]
    fn test_root_start_is_named_quantity() {
        let g = DiskGeometry::for_image_size(1024).unwrap();
        assert_eq!(g.root.start_bytes, ROOT_PARTITION_START_MIB * MIB);
        assert_eq!(ROOT_PARTITION_START_MIB, 260);
    }

    #[test]
    fn test_root_size_formula_over_range() {
        for total in (ROOT_PARTITION_START_MIB + MIN_ROOT_PARTITION_MIB)..2048 {
            for boot in [64, 128, 256] {
                let Some(expected) = total.checked_sub(boot + ALIGNMENT_MIB) else {
                    continue;
                };
                if expected < MIN_ROOT_PARTITION_MIB {
                    assert!(DiskGeometry::new(total, boot, ALIGNMENT_MIB).is_err());
                    continue;
                }
                let g = DiskGeometry::new(total, boot, ALIGNMENT_MIB).unwrap();
                assert_eq!(g.root.size_mib(), expected);
                assert!(g.root.size_bytes > 0);
                assert_eq!(g.root.end_bytes(), g.total_bytes);
            }
        }
    }

    #[test]
    fn test_too_small_is_rejected() {
        let err = DiskGeometry::for_image_size(300).unwrap_err();
        assert!(matches!(err, GeometryError::TooSmall { total_mib: 300, .. }));
        assert!(DiskGeometry::for_image_size(0).is_err());
        assert!(root_partition_mib(100, 256, 4).is_none());
    }

    #[test]
    fn test_mbr_limit() {
        assert!(matches!(
            DiskGeometry::for_image_size(4 * 1024 * 1024),
            Err(GeometryError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_validate_catches_gap() {
        let mut g = DiskGeometry::for_image_size(512).unwrap();
        g.root.start_bytes += MIB;
        g.root.size_bytes -= MIB;
        assert!(g.validate().is_err());
    }

    #[test]
    fn test_lba_values() {
        let g = DiskGeometry::for_image_size(512).unwrap();
        assert_eq!(g.boot.start_lba(), 8192);
        assert_eq!(g.boot.sector_count(), 524_288);
        assert_eq!(g.root.start_lba(), 532_480);
        assert_eq!(g.root.sector_count(), 516_096);
    }
}
