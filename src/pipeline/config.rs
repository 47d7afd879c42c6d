//! Build configuration.
//!
//! Three layers, later ones winning: built-in defaults, an optional TOML file,
//! command-line overrides. The layers are merged as [`ConfigFile`] values and
//! resolved once into an immutable [`BuildConfig`]. The same TOML form is what
//! the host sends to the containerized pipeline on stdin.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::artifact::disk::DiskGeometry;
use crate::artifact::package::{BuildTimestamp, Compression, ImageName};
use crate::error::BuildError;

pub const DEFAULT_ARCH: &str = "armhf";
pub const DEFAULT_BRANCH: &str = "v3.23";
pub const DEFAULT_IMAGE_SIZE_MIB: u64 = 512;
pub const DEFAULT_ROOTFS: &str = "/tmp/alpine-build";
pub const DEFAULT_BOOTFS: &str = "/tmp/alpine-boot";
pub const DEFAULT_WORK_DIR: &str = "/tmp/alpine-work";
pub const DEFAULT_INPUT_DIR: &str = "/input";
pub const DEFAULT_OUTPUT_DIR: &str = "/output";
pub const DEFAULT_MIRROR: &str = "http://dl-cdn.alpinelinux.org/alpine";

/// Partial configuration as read from TOML or collected from CLI flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_size_mib: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rootfs: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bootfs: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<Compression>,
    /// Fixed `YYYYMMDD-HHMMSS` build time, for reproducible names.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("parsing config '{}'", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).context("serializing build config")
    }

    /// Layer `overrides` on top of `self`; fields set in `overrides` win.
    pub fn merge(self, overrides: ConfigFile) -> ConfigFile {
        ConfigFile {
            arch: overrides.arch.or(self.arch),
            branch: overrides.branch.or(self.branch),
            image_size_mib: overrides.image_size_mib.or(self.image_size_mib),
            rootfs: overrides.rootfs.or(self.rootfs),
            bootfs: overrides.bootfs.or(self.bootfs),
            work_dir: overrides.work_dir.or(self.work_dir),
            input_dir: overrides.input_dir.or(self.input_dir),
            output_dir: overrides.output_dir.or(self.output_dir),
            mirror: overrides.mirror.or(self.mirror),
            compression: overrides.compression.or(self.compression),
            timestamp: overrides.timestamp.or(self.timestamp),
        }
    }
}

/// Validated, immutable configuration shared by every stage.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    arch: String,
    branch: String,
    geometry: DiskGeometry,
    rootfs: PathBuf,
    bootfs: PathBuf,
    work_dir: PathBuf,
    input_dir: PathBuf,
    output_dir: PathBuf,
    mirror: String,
    compression: Compression,
    timestamp: Option<BuildTimestamp>,
}

impl BuildConfig {
    /// Defaults only.
    pub fn defaults() -> Result<Self, BuildError> {
        Self::resolve(ConfigFile::default())
    }

    /// Fill unset fields from the defaults and validate the result.
    pub fn resolve(file: ConfigFile) -> Result<Self, BuildError> {
        let arch = file.arch.unwrap_or_else(|| DEFAULT_ARCH.to_string());
        let branch = file.branch.unwrap_or_else(|| DEFAULT_BRANCH.to_string());
        validate_name_part("arch", &arch)?;
        validate_name_part("branch", &branch)?;

        let size = file.image_size_mib.unwrap_or(DEFAULT_IMAGE_SIZE_MIB);
        let geometry = DiskGeometry::for_image_size(size)
            .map_err(|e| BuildError::InvalidConfig(e.to_string()))?;

        let rootfs = file.rootfs.unwrap_or_else(|| PathBuf::from(DEFAULT_ROOTFS));
        let bootfs = file.bootfs.unwrap_or_else(|| PathBuf::from(DEFAULT_BOOTFS));
        let work_dir = file.work_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_WORK_DIR));
        let input_dir = file.input_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_INPUT_DIR));
        let output_dir = file
            .output_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));

        for (field, path) in [
            ("rootfs", &rootfs),
            ("bootfs", &bootfs),
            ("work_dir", &work_dir),
            ("input_dir", &input_dir),
            ("output_dir", &output_dir),
        ] {
            if !path.is_absolute() {
                return Err(BuildError::InvalidConfig(format!(
                    "{field} must be an absolute path, got '{}'",
                    path.display()
                )));
            }
        }
        let trees = [("rootfs", &rootfs), ("bootfs", &bootfs), ("work_dir", &work_dir)];
        for (i, (a_name, a)) in trees.iter().enumerate() {
            for (b_name, b) in &trees[i + 1..] {
                if a.starts_with(b) || b.starts_with(a) {
                    return Err(BuildError::InvalidConfig(format!(
                        "{a_name} '{}' and {b_name} '{}' must not contain each other",
                        a.display(),
                        b.display()
                    )));
                }
            }
        }

        let mirror = file
            .mirror
            .unwrap_or_else(|| DEFAULT_MIRROR.to_string())
            .trim_end_matches('/')
            .to_string();
        if !(mirror.starts_with("http://") || mirror.starts_with("https://")) {
            return Err(BuildError::InvalidConfig(format!(
                "mirror must be an http(s) URL, got '{mirror}'"
            )));
        }

        let timestamp = file
            .timestamp
            .as_deref()
            .map(BuildTimestamp::parse)
            .transpose()
            .map_err(|e| BuildError::InvalidConfig(format!("{e:#}")))?;

        Ok(Self {
            arch,
            branch,
            geometry,
            rootfs,
            bootfs,
            work_dir,
            input_dir,
            output_dir,
            mirror,
            compression: file.compression.unwrap_or_default(),
            timestamp,
        })
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn geometry(&self) -> &DiskGeometry {
        &self.geometry
    }

    pub fn image_size_mib(&self) -> u64 {
        self.geometry.total_mib()
    }

    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    pub fn bootfs(&self) -> &Path {
        &self.bootfs
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn mirror(&self) -> &str {
        &self.mirror
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn timestamp(&self) -> Option<&BuildTimestamp> {
        self.timestamp.as_ref()
    }

    /// Repository URLs for this branch: `main` then `community`.
    pub fn repositories(&self) -> [String; 2] {
        [
            format!("{}/{}/main", self.mirror, self.branch),
            format!("{}/{}/community", self.mirror, self.branch),
        ]
    }

    /// Output name for a build captured at `timestamp`.
    pub fn image_name(&self, timestamp: BuildTimestamp) -> ImageName {
        ImageName {
            arch: self.arch.clone(),
            branch: self.branch.clone(),
            timestamp,
            compression: self.compression,
        }
    }

    /// Fully populated file form, for handing to another process.
    pub fn to_file(&self) -> ConfigFile {
        ConfigFile {
            arch: Some(self.arch.clone()),
            branch: Some(self.branch.clone()),
            image_size_mib: Some(self.image_size_mib()),
            rootfs: Some(self.rootfs.clone()),
            bootfs: Some(self.bootfs.clone()),
            work_dir: Some(self.work_dir.clone()),
            input_dir: Some(self.input_dir.clone()),
            output_dir: Some(self.output_dir.clone()),
            mirror: Some(self.mirror.clone()),
            compression: Some(self.compression),
            timestamp: self.timestamp.as_ref().map(|t| t.as_str().to_string()),
        }
    }
}

/// Arch and branch end up in the output file name and in URLs.
fn validate_name_part(field: &str, value: &str) -> Result<(), BuildError> {
    let ok = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !ok {
        return Err(BuildError::InvalidConfig(format!(
            "{field} '{value}' may only contain letters, digits, '.', '_' and '-'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::disk::geometry::MIB;

    #[test]
    fn test_defaults() {
        let config = BuildConfig::defaults().unwrap();
        assert_eq!(config.arch(), "armhf");
        assert_eq!(config.branch(), "v3.23");
        assert_eq!(config.image_size_mib(), 512);
        assert_eq!(config.rootfs(), Path::new("/tmp/alpine-build"));
        assert_eq!(config.bootfs(), Path::new("/tmp/alpine-boot"));
        assert_eq!(config.geometry().root.size_bytes, 252 * MIB);
        assert_eq!(config.compression(), Compression::Gzip);
        assert_eq!(
            config.repositories()[1],
            "http://dl-cdn.alpinelinux.org/alpine/v3.23/community"
        );
    }

    #[test]
    fn test_toml_rejects_unknown_fields() {
        assert!(ConfigFile::from_toml_str("arhc = \"aarch64\"\n").is_err());
        let parsed = ConfigFile::from_toml_str("arch = \"aarch64\"\ncompression = \"zstd\"\n").unwrap();
        assert_eq!(parsed.arch.as_deref(), Some("aarch64"));
        assert_eq!(parsed.compression, Some(Compression::Zstd));
    }

    #[test]
    fn test_merge_prefers_overrides() {
        let file = ConfigFile {
            arch: Some("aarch64".into()),
            image_size_mib: Some(1024),
            ..Default::default()
        };
        let cli = ConfigFile {
            image_size_mib: Some(2048),
            ..Default::default()
        };
        let merged = file.merge(cli);
        assert_eq!(merged.arch.as_deref(), Some("aarch64"));
        assert_eq!(merged.image_size_mib, Some(2048));
    }

    #[test]
    fn test_too_small_image_is_invalid_config() {
        let err = BuildConfig::resolve(ConfigFile {
            image_size_mib: Some(300),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_INVALID_CONFIG);
    }

    #[test]
    fn test_rejects_unsafe_values() {
        for file in [
            ConfigFile {
                branch: Some("v3.23/../x".into()),
                ..Default::default()
            },
            ConfigFile {
                rootfs: Some("relative/root".into()),
                ..Default::default()
            },
            ConfigFile {
                bootfs: Some("/tmp/alpine-build/boot".into()),
                ..Default::default()
            },
            ConfigFile {
                mirror: Some("ftp://mirror".into()),
                ..Default::default()
            },
            ConfigFile {
                timestamp: Some("yesterday".into()),
                ..Default::default()
            },
        ] {
            assert!(BuildConfig::resolve(file).is_err());
        }
    }

    #[test]
    fn test_file_form_survives_toml() {
        let config = BuildConfig::resolve(ConfigFile {
            branch: Some("edge".into()),
            mirror: Some("https://mirror.example/alpine/".into()),
            timestamp: Some("20240101-120000".into()),
            ..Default::default()
        })
        .unwrap();
        let text = config.to_file().to_toml_string().unwrap();
        let again = BuildConfig::resolve(ConfigFile::from_toml_str(&text).unwrap()).unwrap();

        assert_eq!(again.mirror(), "https://mirror.example/alpine");
        assert_eq!(again.branch(), "edge");
        assert_eq!(again.timestamp().unwrap().as_str(), "20240101-120000");
        assert_eq!(again.geometry(), config.geometry());
    }
}
