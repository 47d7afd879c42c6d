//! Staging provisioner: Alpine base system for the Raspberry Pi.
//!
//! Sets up the build environment, installs the package set into the root
//! staging tree and configures the stock runlevels. Package installation is
//! delegated to a [`PackageManager`].

pub mod apk;
pub mod keys;
pub mod system;

pub use apk::{Apk, InstallRequest, PackageManager, BUILD_TOOLS, IMAGE_PACKAGES};

use anyhow::{Context, Result};
use std::path::Path;

use crate::pipeline::config::BuildConfig;
use crate::pipeline::staging::StagingTrees;

/// Install build tools, create fresh staging trees and seed the apk keys.
pub fn setup_environment(
    pm: &dyn PackageManager,
    trees: &StagingTrees,
    host_keys: &Path,
) -> Result<()> {
    pm.install_build_tools(BUILD_TOOLS)
        .context("installing build tools")?;
    trees.reset()?;
    keys::copy_keys(host_keys, &trees.root)?;
    Ok(())
}

/// Install [`IMAGE_PACKAGES`] into the root tree.
pub fn install_packages(pm: &dyn PackageManager, config: &BuildConfig, root: &Path) -> Result<()> {
    let repositories = config.repositories();
    let request = InstallRequest {
        arch: config.arch(),
        repositories: &repositories,
        packages: IMAGE_PACKAGES,
    };
    pm.install_into(root, &request)
}

/// Runlevels and the dropbear directory.
pub fn configure_system(root: &Path) -> Result<()> {
    let enabled = system::configure_runlevels(root)?;
    system::prepare_dropbear(root)?;
    tracing::info!(services = enabled, "base runlevels configured");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingPm {
        tools: RefCell<Vec<String>>,
        installs: RefCell<Vec<(PathBuf, String, Vec<String>, usize)>>,
    }

    impl PackageManager for RecordingPm {
        fn install_build_tools(&self, tools: &[&str]) -> Result<()> {
            self.tools
                .borrow_mut()
                .extend(tools.iter().map(|t| t.to_string()));
            Ok(())
        }

        fn install_into(&self, root: &Path, request: &InstallRequest<'_>) -> Result<()> {
            self.installs.borrow_mut().push((
                root.to_path_buf(),
                request.arch.to_string(),
                request.repositories.to_vec(),
                request.packages.len(),
            ));
            Ok(())
        }
    }

    #[test]
    fn test_setup_environment_seeds_keys_into_fresh_tree() {
        let temp = TempDir::new().unwrap();
        let keys_dir = temp.path().join("keys");
        fs::create_dir_all(&keys_dir).unwrap();
        fs::write(
            keys_dir.join("a.rsa.pub"),
            "-----BEGIN PUBLIC KEY-----\nAA==\n-----END PUBLIC KEY-----\n",
        )
        .unwrap();
        let trees = StagingTrees::new(temp.path().join("root"), temp.path().join("boot"));
        fs::create_dir_all(&trees.root).unwrap();
        fs::write(trees.root.join("stale"), "x").unwrap();

        let pm = RecordingPm::default();
        setup_environment(&pm, &trees, &keys_dir).unwrap();

        assert_eq!(*pm.tools.borrow(), BUILD_TOOLS);
        assert!(!trees.root.join("stale").exists());
        assert!(trees.boot.is_dir());
        assert!(trees.root.join("etc/apk/keys/a.rsa.pub").is_file());
    }

    #[test]
    fn test_install_packages_uses_config() {
        let config = BuildConfig::defaults().unwrap();
        let pm = RecordingPm::default();

        install_packages(&pm, &config, config.rootfs()).unwrap();

        let installs = pm.installs.borrow();
        assert_eq!(installs.len(), 1);
        let (root, arch, repos, count) = &installs[0];
        assert_eq!(root, Path::new("/tmp/alpine-build"));
        assert_eq!(arch, "armhf");
        assert!(repos[0].ends_with("/v3.23/main"));
        assert_eq!(*count, IMAGE_PACKAGES.len());
    }

    #[test]
    fn test_configure_system() {
        let temp = TempDir::new().unwrap();
        configure_system(temp.path()).unwrap();
        assert!(temp.path().join("etc/dropbear").is_dir());
        assert!(temp.path().join("etc/runlevels/default/dropbear").is_symlink());
    }
}
