//! Package installation through apk.
//!
//! The package manager is an external collaborator: the pipeline only decides
//! what to install and where. [`PackageManager`] is the seam, [`Apk`] the real
//! implementation.

use anyhow::{Context, Result};
use std::path::Path;

use crate::process::Cmd;

/// Tools the build environment itself needs.
pub const BUILD_TOOLS: &[&str] = &["apk-tools", "dosfstools", "mtools", "e2fsprogs"];

/// Packages installed into the image.
pub const IMAGE_PACKAGES: &[&str] = &[
    "alpine-base",
    "alpine-conf",
    "linux-rpi",
    "raspberrypi-bootloader",
    "linux-firmware-brcm",
    "linux-firmware-cypress",
    "openresolv",
    "dbus",
    "openrc",
    "e2fsprogs",
    "e2fsprogs-extra",
    "parted",
    "nano",
    "dropbear",
    "kbd",
    "kbd-bkeymaps",
    "iwd",
    "wpa_supplicant",
    "iw",
];

/// One install into a foreign root.
#[derive(Debug, Clone)]
pub struct InstallRequest<'a> {
    pub arch: &'a str,
    pub repositories: &'a [String],
    pub packages: &'a [&'a str],
}

pub trait PackageManager {
    /// Install packages into the running build environment.
    fn install_build_tools(&self, tools: &[&str]) -> Result<()>;

    /// Initialize a package database under `root` and install into it.
    fn install_into(&self, root: &Path, request: &InstallRequest<'_>) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct Apk {
    program: String,
}

impl Default for Apk {
    fn default() -> Self {
        Self {
            program: "apk".to_string(),
        }
    }
}

impl Apk {
    pub fn build_tools_command(&self, tools: &[&str]) -> Cmd {
        Cmd::new(&self.program)
            .args(["add", "--no-cache"])
            .args(tools)
            .error_msg("apk failed to install build tools")
    }

    pub fn install_command(&self, root: &Path, request: &InstallRequest<'_>) -> Cmd {
        let mut cmd = Cmd::new(&self.program)
            .arg("--root")
            .arg_path(root)
            .args(["--initdb", "--arch", request.arch, "--allow-untrusted"]);
        for repo in request.repositories {
            cmd = cmd.args(["--repository", repo.as_str()]);
        }
        cmd.arg("add")
            .args(request.packages)
            .error_msg(format!("apk failed to install packages into {}", root.display()))
    }
}

impl PackageManager for Apk {
    fn install_build_tools(&self, tools: &[&str]) -> Result<()> {
        self.build_tools_command(tools).run_interactive()?;
        Ok(())
    }

    fn install_into(&self, root: &Path, request: &InstallRequest<'_>) -> Result<()> {
        tracing::info!(
            arch = request.arch,
            packages = request.packages.len(),
            "installing into {}",
            root.display()
        );
        self.install_command(root, request)
            .run_interactive()
            .with_context(|| format!("installing {} packages", request.packages.len()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_command_arguments() {
        let repos = vec![
            "http://dl-cdn.alpinelinux.org/alpine/v3.23/main".to_string(),
            "http://dl-cdn.alpinelinux.org/alpine/v3.23/community".to_string(),
        ];
        let request = InstallRequest {
            arch: "armhf",
            repositories: &repos,
            packages: &["alpine-base", "dropbear"],
        };
        let cmd = Apk::default().install_command(Path::new("/tmp/alpine-build"), &request);

        assert_eq!(cmd.program(), "apk");
        assert_eq!(
            cmd.display_args(),
            vec![
                "--root",
                "/tmp/alpine-build",
                "--initdb",
                "--arch",
                "armhf",
                "--allow-untrusted",
                "--repository",
                "http://dl-cdn.alpinelinux.org/alpine/v3.23/main",
                "--repository",
                "http://dl-cdn.alpinelinux.org/alpine/v3.23/community",
                "add",
                "alpine-base",
                "dropbear",
            ]
        );
    }

    #[test]
    fn test_build_tools_command() {
        let cmd = Apk::default().build_tools_command(BUILD_TOOLS);
        let args = cmd.display_args();
        assert_eq!(&args[..2], ["add", "--no-cache"]);
        assert!(args.contains(&"mtools".to_string()));
    }

    #[test]
    fn test_image_packages_cover_runtime_services() {
        for pkg in ["linux-rpi", "raspberrypi-bootloader", "dropbear", "iwd", "parted", "e2fsprogs-extra"] {
            assert!(IMAGE_PACKAGES.contains(&pkg), "{pkg}");
        }
    }
}
