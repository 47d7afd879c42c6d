//! Artifact builders for the SD card image.
//!
//! - [`disk`] - FAT32 and ext4 partition images, MBR, raw image assembly
//! - [`package`] - Compression, deterministic naming, checksum and manifest

pub mod disk;
pub mod package;
