//! Final image packaging: naming, compression, checksum and manifest.
//!
//! The compressed image is written under a hidden temporary name in the output
//! directory and renamed into place only once it is complete, so a failed or
//! interrupted build never leaves a truncated file under the final name.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use super::disk::DiskGeometry;

/// Product prefix of every image name.
pub const PRODUCT: &str = "alpine-rpi";

/// zstd level for `.img.zst` output.
const ZSTD_LEVEL: i32 = 10;

/// Lossless compression applied to the raw image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Gzip,
    Zstd,
}

impl Compression {
    pub fn extension(self) -> &'static str {
        match self {
            Compression::Gzip => "gz",
            Compression::Zstd => "zst",
        }
    }
}

/// Build timestamp in sortable `YYYYMMDD-HHMMSS` form (UTC).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTimestamp {
    formatted: String,
    unix: i64,
}

impl BuildTimestamp {
    /// Capture the current time. Call once per build.
    pub fn now() -> Result<Self> {
        Self::from_datetime(OffsetDateTime::now_utc())
    }

    pub fn from_datetime(at: OffsetDateTime) -> Result<Self> {
        let format = format_description!("[year][month][day]-[hour][minute][second]");
        let formatted = at
            .format(&format)
            .context("formatting build timestamp")?;
        Ok(Self {
            formatted,
            unix: at.unix_timestamp(),
        })
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let format = format_description!("[year][month][day]-[hour][minute][second]");
        let at = PrimitiveDateTime::parse(raw, &format)
            .with_context(|| format!("invalid build timestamp '{raw}', expected YYYYMMDD-HHMMSS"))?
            .assume_utc();
        Self::from_datetime(at)
    }

    pub fn as_str(&self) -> &str {
        &self.formatted
    }

    /// MBR disk signature for this build, derived from the timestamp.
    pub fn disk_signature(&self) -> u32 {
        self.unix as u32
    }
}

/// Deterministic output name: `<product>-<arch>-<branch>-<timestamp>.img.<ext>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageName {
    pub arch: String,
    pub branch: String,
    pub timestamp: BuildTimestamp,
    pub compression: Compression,
}

impl ImageName {
    pub fn file_name(&self) -> String {
        format!(
            "{}-{}-{}-{}.img.{}",
            PRODUCT,
            self.arch,
            self.branch,
            self.timestamp.as_str(),
            self.compression.extension()
        )
    }
}

/// Partition entry recorded in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestPartition {
    pub index: u8,
    pub filesystem: String,
    pub label: String,
    pub start_bytes: u64,
    pub size_bytes: u64,
    pub bootable: bool,
}

/// JSON sidecar describing a packaged image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageManifest {
    pub file_name: String,
    pub product: String,
    pub arch: String,
    pub branch: String,
    pub timestamp: String,
    pub compression: Compression,
    pub raw_size_bytes: u64,
    pub compressed_size_bytes: u64,
    pub sha256: String,
    pub partitions: Vec<ManifestPartition>,
}

/// A finished artifact in the output directory.
#[derive(Debug, Clone)]
pub struct PackagedImage {
    pub path: PathBuf,
    pub checksum_path: PathBuf,
    pub manifest_path: PathBuf,
    pub manifest: ImageManifest,
}

/// Compress `raw_image` into `output_dir` under `name`, then write the
/// `.sha256` and `.json` sidecars.
pub fn package_image(
    raw_image: &Path,
    output_dir: &Path,
    name: &ImageName,
    geometry: &DiskGeometry,
) -> Result<PackagedImage> {
    let raw_size_bytes = fs::metadata(raw_image)
        .with_context(|| format!("Failed to stat {}", raw_image.display()))?
        .len();
    if raw_size_bytes != geometry.total_bytes {
        bail!(
            "raw image {} is {} bytes, expected {}",
            raw_image.display(),
            raw_size_bytes,
            geometry.total_bytes
        );
    }

    fs::create_dir_all(output_dir)
        .with_context(|| format!("creating output directory {}", output_dir.display()))?;

    let file_name = name.file_name();
    let final_path = output_dir.join(&file_name);
    let tmp_path = output_dir.join(format!(".{}.partial", file_name));

    tracing::info!(compression = ?name.compression, "compressing to {}", file_name);
    if let Err(e) = compress(raw_image, &tmp_path, name.compression) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }

    let (sha256, compressed_size_bytes) = match sha256_file(&tmp_path) {
        Ok(v) => v,
        Err(e) => {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
    };
    atomic_rename(&tmp_path, &final_path)?;

    let checksum_path = sidecar(&final_path, "sha256");
    fs::write(&checksum_path, format!("{}  {}\n", sha256, file_name))
        .with_context(|| format!("writing {}", checksum_path.display()))?;

    let manifest = ImageManifest {
        file_name: file_name.clone(),
        product: PRODUCT.to_string(),
        arch: name.arch.clone(),
        branch: name.branch.clone(),
        timestamp: name.timestamp.as_str().to_string(),
        compression: name.compression,
        raw_size_bytes,
        compressed_size_bytes,
        sha256,
        partitions: geometry
            .partitions()
            .iter()
            .map(|p| ManifestPartition {
                index: p.index,
                filesystem: p.kind.name().to_string(),
                label: p.kind.label().to_string(),
                start_bytes: p.start_bytes,
                size_bytes: p.size_bytes,
                bootable: p.bootable,
            })
            .collect(),
    };
    let manifest_path = sidecar(&final_path, "json");
    fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(PackagedImage {
        path: final_path,
        checksum_path,
        manifest_path,
        manifest,
    })
}

fn sidecar(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

fn compress(src: &Path, dest: &Path, compression: Compression) -> Result<()> {
    let mut reader = BufReader::new(
        File::open(src).with_context(|| format!("Failed to open {}", src.display()))?,
    );
    let out = File::create(dest).with_context(|| format!("Failed to create {}", dest.display()))?;

    let file = match compression {
        Compression::Gzip => {
            // Header mtime stays 0 and carries no file name, so output is reproducible.
            let mut encoder =
                flate2::write::GzEncoder::new(BufWriter::new(out), flate2::Compression::default());
            io::copy(&mut reader, &mut encoder)?;
            encoder.finish()?.into_inner().map_err(|e| e.into_error())?
        }
        Compression::Zstd => {
            let mut encoder = zstd::stream::Encoder::new(BufWriter::new(out), ZSTD_LEVEL)?;
            io::copy(&mut reader, &mut encoder)?;
            encoder.finish()?.into_inner().map_err(|e| e.into_error())?
        }
    };
    file.sync_all()?;
    Ok(())
}

fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut reader = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 64];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    let digest = hasher.finalize();
    Ok((format!("{:x}", digest), total))
}

fn atomic_rename(src: &Path, dest: &Path) -> Result<()> {
    if dest.exists() {
        fs::remove_file(dest).with_context(|| format!("Failed to remove {}", dest.display()))?;
    }
    fs::rename(src, dest).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            src.display(),
            dest.display()
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::disk::geometry::MIB;
    use flate2::read::GzDecoder;
    use tempfile::TempDir;

    fn name(compression: Compression) -> ImageName {
        ImageName {
            arch: "armhf".into(),
            branch: "v3.23".into(),
            timestamp: BuildTimestamp::parse("20240101-120000").unwrap(),
            compression,
        }
    }

    #[test]
    fn test_reference_file_name() {
        assert_eq!(
            name(Compression::Gzip).file_name(),
            "alpine-rpi-armhf-v3.23-20240101-120000.img.gz"
        );
        assert_eq!(
            name(Compression::Zstd).file_name(),
            "alpine-rpi-armhf-v3.23-20240101-120000.img.zst"
        );
    }

    #[test]
    fn test_timestamp_format() {
        let at = time::macros::datetime!(2025-03-07 04:05:09 UTC);
        let ts = BuildTimestamp::from_datetime(at).unwrap();
        assert_eq!(ts.as_str(), "20250307-040509");
        assert_eq!(BuildTimestamp::parse("20250307-040509").unwrap(), ts);
        assert!(BuildTimestamp::parse("2025-03-07").is_err());
    }

    #[test]
    fn test_rejects_raw_image_of_wrong_size() {
        let temp = TempDir::new().unwrap();
        let raw = temp.path().join("alpine-rpi.img");
        fs::write(&raw, b"short").unwrap();
        let geometry = DiskGeometry::for_image_size(512).unwrap();

        let out = temp.path().join("out");
        assert!(package_image(&raw, &out, &name(Compression::Gzip), &geometry).is_err());
        assert!(!out.join(name(Compression::Gzip).file_name()).exists());
    }

    #[test]
    fn test_gzip_package_roundtrips_and_writes_sidecars() {
        let temp = TempDir::new().unwrap();
        let geometry = DiskGeometry::for_image_size(324).unwrap();
        let raw = temp.path().join("alpine-rpi.img");
        {
            let f = File::create(&raw).unwrap();
            f.set_len(geometry.total_bytes).unwrap();
        }
        let out = temp.path().join("out");

        let packaged = package_image(&raw, &out, &name(Compression::Gzip), &geometry).unwrap();

        let mut decoded = Vec::new();
        GzDecoder::new(File::open(&packaged.path).unwrap())
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded.len() as u64, 324 * MIB);

        let sum = fs::read_to_string(&packaged.checksum_path).unwrap();
        assert!(sum.ends_with("  alpine-rpi-armhf-v3.23-20240101-120000.img.gz\n"));
        assert_eq!(&sum[..64], packaged.manifest.sha256);

        let manifest: ImageManifest =
            serde_json::from_slice(&fs::read(&packaged.manifest_path).unwrap()).unwrap();
        assert_eq!(manifest.partitions.len(), 2);
        assert_eq!(manifest.partitions[1].start_bytes, 260 * MIB);

        // No temporary file left behind
        let leftovers: Vec<_> = fs::read_dir(&out)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
