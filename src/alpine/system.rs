//! Base system configuration of the provisioned root: runlevels and the
//! dropbear key directory.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::executor::openrc::{enable_service, Runlevel};

/// Stock services per runlevel.
pub const RUNLEVELS: &[(Runlevel, &[&str])] = &[
    (
        Runlevel::Boot,
        &["bootmisc", "hostname", "syslog", "modules", "sysctl", "networking", "urandom"],
    ),
    (Runlevel::Sysinit, &["devfs", "dmesg", "mdev"]),
    (Runlevel::Default, &["dbus", "dropbear", "ntpd"]),
];

/// Enable the stock services.
pub fn configure_runlevels(root: &Path) -> Result<usize> {
    let mut enabled = 0;
    for (runlevel, services) in RUNLEVELS {
        for service in *services {
            enable_service(root, service, *runlevel)
                .with_context(|| format!("enabling {} in {}", service, runlevel.as_str()))?;
            enabled += 1;
        }
    }
    Ok(enabled)
}

/// Dropbear generates its host keys here on first start.
pub fn prepare_dropbear(root: &Path) -> Result<()> {
    let dir = root.join("etc/dropbear");
    fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::openrc::is_enabled;
    use tempfile::TempDir;

    /// Sorted service names linked into `runlevel` (test-local helper).
    fn enabled_services(staging: &std::path::Path, runlevel: Runlevel) -> Result<Vec<String>> {
        let dir = staging.join("etc/runlevels").join(runlevel.as_str());
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.path().is_symlink() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    #[test]
    fn test_configure_runlevels() {
        let temp = TempDir::new().unwrap();

        assert_eq!(configure_runlevels(temp.path()).unwrap(), 13);
        // Idempotent over an already-provisioned tree
        assert_eq!(configure_runlevels(temp.path()).unwrap(), 13);

        assert_eq!(
            enabled_services(temp.path(), Runlevel::Sysinit).unwrap(),
            vec!["devfs", "dmesg", "mdev"]
        );
        assert!(is_enabled(temp.path(), "networking", Runlevel::Boot));
        assert!(is_enabled(temp.path(), "ntpd", Runlevel::Default));
    }

    #[test]
    fn test_prepare_dropbear() {
        let temp = TempDir::new().unwrap();
        prepare_dropbear(temp.path()).unwrap();
        assert!(temp.path().join("etc/dropbear").is_dir());
    }
}
