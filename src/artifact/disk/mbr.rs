//! Legacy MBR (msdos) partition table encoding.
//!
//! The Pi boot ROM only understands MBR, so the image carries a classic
//! 512-byte sector 0 with up to four primary entries. The table is encoded
//! here directly from [`DiskGeometry`] instead of shelling out to parted, and
//! decoded again so the assembler can compare what landed on disk against
//! the offsets it copies to.

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use super::geometry::{DiskGeometry, PartitionSpec, SECTOR_SIZE};

/// Size of the boot sector.
pub const MBR_SIZE: usize = 512;

const DISK_SIGNATURE_OFFSET: usize = 440;
const PARTITION_TABLE_OFFSET: usize = 446;
const ENTRY_SIZE: usize = 16;
const MAX_PRIMARY: usize = 4;
const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xaa];
const STATUS_ACTIVE: u8 = 0x80;

// Conventional translation geometry used by fdisk/parted for CHS fields.
const CHS_HEADS: u64 = 255;
const CHS_SECTORS: u64 = 63;
const CHS_MAX_CYLINDER: u64 = 1023;

/// One primary partition entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MbrEntry {
    pub bootable: bool,
    pub partition_type: u8,
    pub start_lba: u32,
    pub sector_count: u32,
}

impl MbrEntry {
    pub fn from_spec(spec: &PartitionSpec) -> Result<Self> {
        if spec.start_bytes % SECTOR_SIZE != 0 || spec.size_bytes % SECTOR_SIZE != 0 {
            bail!(
                "partition {} is not sector aligned (start {}, size {})",
                spec.index,
                spec.start_bytes,
                spec.size_bytes
            );
        }
        let start_lba = u32::try_from(spec.start_lba())
            .with_context(|| format!("partition {} start is beyond MBR range", spec.index))?;
        let sector_count = u32::try_from(spec.sector_count())
            .with_context(|| format!("partition {} size is beyond MBR range", spec.index))?;

        Ok(Self {
            bootable: spec.bootable,
            partition_type: spec.kind.mbr_type(),
            start_lba,
            sector_count,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.partition_type == 0 && self.sector_count == 0
    }

    pub fn start_bytes(&self) -> u64 {
        u64::from(self.start_lba) * SECTOR_SIZE
    }

    pub fn size_bytes(&self) -> u64 {
        u64::from(self.sector_count) * SECTOR_SIZE
    }

    fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut out = [0u8; ENTRY_SIZE];
        if self.is_empty() {
            return out;
        }

        let first = u64::from(self.start_lba);
        let last = first + u64::from(self.sector_count).saturating_sub(1);

        out[0] = if self.bootable { STATUS_ACTIVE } else { 0 };
        out[1..4].copy_from_slice(&lba_to_chs(first));
        out[4] = self.partition_type;
        out[5..8].copy_from_slice(&lba_to_chs(last));
        out[8..12].copy_from_slice(&self.start_lba.to_le_bytes());
        out[12..16].copy_from_slice(&self.sector_count.to_le_bytes());
        out
    }

    fn decode(raw: &[u8]) -> Result<Self> {
        let status = raw[0];
        if status != 0 && status != STATUS_ACTIVE {
            bail!("invalid partition status byte 0x{:02x}", status);
        }
        Ok(Self {
            bootable: status == STATUS_ACTIVE,
            partition_type: raw[4],
            start_lba: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            sector_count: u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]),
        })
    }
}

/// Encode an LBA as a packed CHS triple, saturating to 1023/254/63.
fn lba_to_chs(lba: u64) -> [u8; 3] {
    let cylinder = lba / (CHS_HEADS * CHS_SECTORS);
    if cylinder > CHS_MAX_CYLINDER {
        return [0xfe, 0xff, 0xff];
    }
    let rem = lba % (CHS_HEADS * CHS_SECTORS);
    let head = rem / CHS_SECTORS;
    let sector = rem % CHS_SECTORS + 1;

    [
        head as u8,
        (sector as u8 & 0x3f) | (((cylinder >> 8) as u8 & 0x03) << 6),
        (cylinder & 0xff) as u8,
    ]
}

/// A decoded or to-be-written master boot record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mbr {
    pub disk_signature: u32,
    pub entries: [MbrEntry; MAX_PRIMARY],
}

impl Mbr {
    /// Build the table for a geometry. Partition `n` lands in slot `n - 1`.
    pub fn for_geometry(geometry: &DiskGeometry, disk_signature: u32) -> Result<Self> {
        let mut entries = [MbrEntry::default(); MAX_PRIMARY];
        for spec in geometry.partitions() {
            let slot = usize::from(spec.index)
                .checked_sub(1)
                .filter(|slot| *slot < MAX_PRIMARY)
                .with_context(|| format!("partition index {} is not a primary slot", spec.index))?;
            entries[slot] = MbrEntry::from_spec(&spec)?;
        }
        Ok(Self {
            disk_signature,
            entries,
        })
    }

    /// Entry for a 1-based partition number, if populated.
    pub fn partition(&self, index: u8) -> Option<&MbrEntry> {
        let slot = usize::from(index).checked_sub(1)?;
        self.entries.get(slot).filter(|e| !e.is_empty())
    }

    pub fn to_bytes(&self) -> [u8; MBR_SIZE] {
        let mut sector = [0u8; MBR_SIZE];
        sector[DISK_SIGNATURE_OFFSET..DISK_SIGNATURE_OFFSET + 4]
            .copy_from_slice(&self.disk_signature.to_le_bytes());
        for (i, entry) in self.entries.iter().enumerate() {
            let offset = PARTITION_TABLE_OFFSET + i * ENTRY_SIZE;
            sector[offset..offset + ENTRY_SIZE].copy_from_slice(&entry.encode());
        }
        sector[MBR_SIZE - 2..].copy_from_slice(&BOOT_SIGNATURE);
        sector
    }

    pub fn from_bytes(sector: &[u8]) -> Result<Self> {
        if sector.len() < MBR_SIZE {
            bail!("boot sector is {} bytes, expected {}", sector.len(), MBR_SIZE);
        }
        if sector[MBR_SIZE - 2..MBR_SIZE] != BOOT_SIGNATURE {
            bail!("missing 0x55AA boot signature");
        }

        let mut entries = [MbrEntry::default(); MAX_PRIMARY];
        for (i, entry) in entries.iter_mut().enumerate() {
            let offset = PARTITION_TABLE_OFFSET + i * ENTRY_SIZE;
            *entry = MbrEntry::decode(&sector[offset..offset + ENTRY_SIZE])
                .with_context(|| format!("decoding partition entry {}", i + 1))?;
        }

        let sig = &sector[DISK_SIGNATURE_OFFSET..DISK_SIGNATURE_OFFSET + 4];
        Ok(Self {
            disk_signature: u32::from_le_bytes([sig[0], sig[1], sig[2], sig[3]]),
            entries,
        })
    }

    /// Read the partition table from the first sector of a raw image.
    pub fn read_from(image: &Path) -> Result<Self> {
        let mut file = File::open(image)
            .with_context(|| format!("Failed to open {}", image.display()))?;
        let mut sector = [0u8; MBR_SIZE];
        file.read_exact(&mut sector)
            .with_context(|| format!("Failed to read boot sector of {}", image.display()))?;
        Self::from_bytes(&sector).with_context(|| format!("parsing MBR of {}", image.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::disk::geometry::MIB;

    fn reference() -> Mbr {
        let geometry = DiskGeometry::for_image_size(512).unwrap();
        Mbr::for_geometry(&geometry, 0x1234_5678).unwrap()
    }

    #[test]
    fn test_layout_of_reference_table() {
        let bytes = reference().to_bytes();

        assert_eq!(&bytes[510..], &[0x55, 0xaa]);
        assert_eq!(&bytes[440..444], &0x1234_5678u32.to_le_bytes());
        // p1: active, FAT32 LBA, LBA 8192, 524288 sectors
        assert_eq!(bytes[446], 0x80);
        assert_eq!(bytes[450], 0x0c);
        assert_eq!(&bytes[454..458], &8192u32.to_le_bytes());
        assert_eq!(&bytes[458..462], &524_288u32.to_le_bytes());
        // p2: inactive, Linux, starts right after p1
        assert_eq!(bytes[462], 0x00);
        assert_eq!(bytes[466], 0x83);
        assert_eq!(&bytes[470..474], &532_480u32.to_le_bytes());
        // slots 3 and 4 stay empty
        assert!(bytes[478..510].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_decode_matches_geometry() {
        let geometry = DiskGeometry::for_image_size(512).unwrap();
        let decoded = Mbr::from_bytes(&reference().to_bytes()).unwrap();

        let p1 = decoded.partition(1).unwrap();
        let p2 = decoded.partition(2).unwrap();
        assert!(decoded.partition(3).is_none());
        assert_eq!(p1.start_bytes(), 4 * MIB);
        assert_eq!(p1.size_bytes(), geometry.boot.size_bytes);
        assert_eq!(p2.start_bytes(), 260 * MIB);
        assert_eq!(p2.start_bytes() + p2.size_bytes(), geometry.total_bytes);
        assert!(p1.bootable && !p2.bootable);
    }

    #[test]
    fn test_chs_encoding() {
        // LBA 8192 = C0 H130 S3 in 255/63 translation
        assert_eq!(lba_to_chs(8192), [130, 3, 0]);
        assert_eq!(lba_to_chs(0), [0, 1, 0]);
        assert_eq!(lba_to_chs(u64::from(u32::MAX)), [0xfe, 0xff, 0xff]);
    }

    #[test]
    fn test_rejects_missing_signature() {
        let mut bytes = reference().to_bytes();
        bytes[511] = 0;
        assert!(Mbr::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_rejects_bad_status_byte() {
        let mut bytes = reference().to_bytes();
        bytes[446] = 0x12;
        assert!(Mbr::from_bytes(&bytes).is_err());
    }
}
