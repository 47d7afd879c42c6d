//! Configuration injection into the root staging tree.
//!
//! Seven fixed targets. For each one an override file in the input directory
//! is copied verbatim if present; otherwise the built-in default is written and
//! a warning is logged. Every target ends up set, by exactly one of the two.

pub mod defaults;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::executor::files::{copy_file_mode, write_file_mode};

const MODE_FILE: u32 = 0o644;
const MODE_SCRIPT: u32 = 0o755;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigTarget {
    Interfaces,
    Hostname,
    Modules,
    Fstab,
    Cmdline,
    FirmwareConfig,
    InterfaceSetupScript,
}

impl ConfigTarget {
    pub const ALL: [ConfigTarget; 7] = [
        ConfigTarget::Interfaces,
        ConfigTarget::Hostname,
        ConfigTarget::Modules,
        ConfigTarget::Fstab,
        ConfigTarget::Cmdline,
        ConfigTarget::FirmwareConfig,
        ConfigTarget::InterfaceSetupScript,
    ];

    /// File name looked up in the input directory.
    pub fn input_name(self) -> &'static str {
        match self {
            ConfigTarget::Interfaces => "interfaces",
            ConfigTarget::Hostname => "hostname",
            ConfigTarget::Modules => "modules",
            ConfigTarget::Fstab => "fstab",
            ConfigTarget::Cmdline => "cmdline.txt",
            ConfigTarget::FirmwareConfig => "config.txt",
            ConfigTarget::InterfaceSetupScript => "setup-interfaces-iwd.sh",
        }
    }

    /// Absolute path inside the image.
    ///
    /// The two `/boot` targets are moved to the boot partition later, with
    /// the rest of the root tree's `boot/`.
    pub fn target_path(self) -> &'static str {
        match self {
            ConfigTarget::Interfaces => "/etc/network/interfaces",
            ConfigTarget::Hostname => "/etc/hostname",
            ConfigTarget::Modules => "/etc/modules",
            ConfigTarget::Fstab => "/etc/fstab",
            ConfigTarget::Cmdline => "/boot/cmdline.txt",
            ConfigTarget::FirmwareConfig => "/boot/config.txt",
            ConfigTarget::InterfaceSetupScript => "/usr/sbin/setup-interfaces-iwd.sh",
        }
    }

    pub fn mode(self) -> u32 {
        match self {
            ConfigTarget::InterfaceSetupScript => MODE_SCRIPT,
            _ => MODE_FILE,
        }
    }

    pub fn default_content(self) -> &'static str {
        match self {
            ConfigTarget::Interfaces => defaults::INTERFACES,
            ConfigTarget::Hostname => defaults::HOSTNAME,
            ConfigTarget::Modules => defaults::MODULES,
            ConfigTarget::Fstab => defaults::FSTAB,
            ConfigTarget::Cmdline => defaults::CMDLINE,
            ConfigTarget::FirmwareConfig => defaults::FIRMWARE_CONFIG,
            ConfigTarget::InterfaceSetupScript => defaults::INTERFACE_SETUP_SCRIPT,
        }
    }
}

/// Where a target's content came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Override(PathBuf),
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Injection {
    pub target: ConfigTarget,
    pub resolution: Resolution,
    /// Written file, inside the staging tree.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct InjectionReport {
    pub injections: Vec<Injection>,
}

impl InjectionReport {
    pub fn get(&self, target: ConfigTarget) -> Option<&Injection> {
        self.injections.iter().find(|i| i.target == target)
    }

    pub fn overrides(&self) -> usize {
        self.injections
            .iter()
            .filter(|i| matches!(i.resolution, Resolution::Override(_)))
            .count()
    }

    pub fn defaults(&self) -> usize {
        self.injections.len() - self.overrides()
    }
}

/// Set one target from its override or its default.
pub fn inject_target(root: &Path, input_dir: &Path, target: ConfigTarget) -> Result<Injection> {
    let candidate = input_dir.join(target.input_name());

    let (resolution, path) = if candidate.is_file() {
        let path = copy_file_mode(&candidate, root, target.target_path(), target.mode())
            .with_context(|| format!("installing override {}", candidate.display()))?;
        tracing::info!("{} <- {}", target.target_path(), candidate.display());
        (Resolution::Override(candidate), path)
    } else {
        let path = write_file_mode(root, target.target_path(), target.default_content(), target.mode())
            .with_context(|| format!("writing default {}", target.target_path()))?;
        tracing::warn!(
            "{} not found in {}, using built-in default for {}",
            target.input_name(),
            input_dir.display(),
            target.target_path()
        );
        (Resolution::Default, path)
    };

    Ok(Injection {
        target,
        resolution,
        path,
    })
}

/// Set every target.
pub fn inject_all(root: &Path, input_dir: &Path) -> Result<InjectionReport> {
    let injections = ConfigTarget::ALL
        .iter()
        .map(|target| inject_target(root, input_dir, *target))
        .collect::<Result<Vec<_>>>()?;
    Ok(InjectionReport { injections })
}
