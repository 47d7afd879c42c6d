//! OpenRC runlevel handling inside a staging root.
//!
//! A service is enabled in a runlevel by the symlink
//! `/etc/runlevels/<runlevel>/<service> -> /etc/init.d/<service>`. That link is
//! the whole of the state; `rc-update add/del` on the device creates and
//! removes the same link.

use anyhow::{bail, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// OpenRC runlevels the image uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Runlevel {
    Sysinit,
    Boot,
    Default,
}

impl Runlevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Runlevel::Sysinit => "sysinit",
            Runlevel::Boot => "boot",
            Runlevel::Default => "default",
        }
    }
}

fn check_service_name(service: &str) -> Result<()> {
    if service.is_empty() || service.contains('/') || service.starts_with('.') {
        bail!("invalid OpenRC service name '{}'", service);
    }
    Ok(())
}

/// Path of the enablement link for `service` in `runlevel`.
pub fn enablement_link(staging: &Path, service: &str, runlevel: Runlevel) -> PathBuf {
    staging
        .join("etc/runlevels")
        .join(runlevel.as_str())
        .join(service)
}

/// Enable an OpenRC service in a runlevel. Idempotent.
pub fn enable_service(staging: &Path, service: &str, runlevel: Runlevel) -> Result<()> {
    check_service_name(service)?;
    let link = enablement_link(staging, service, runlevel);
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)?;
    }

    let target = format!("/etc/init.d/{}", service);

    if !link.exists() && !link.is_symlink() {
        std::os::unix::fs::symlink(&target, &link)?;
    }

    Ok(())
}

/// Remove a service from a runlevel, as `rc-update del` does. Idempotent.
pub fn disable_service(staging: &Path, service: &str, runlevel: Runlevel) -> Result<()> {
    check_service_name(service)?;
    let link = enablement_link(staging, service, runlevel);
    if link.is_symlink() || link.exists() {
        fs::remove_file(&link)?;
    }
    Ok(())
}

pub fn is_enabled(staging: &Path, service: &str, runlevel: Runlevel) -> bool {
    enablement_link(staging, service, runlevel).is_symlink()
}
