//! The two staging trees: future root and boot partition contents.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

use crate::executor::files::move_entry;

/// Host directories mirroring the root and boot partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingTrees {
    pub root: PathBuf,
    pub boot: PathBuf,
}

impl StagingTrees {
    pub fn new(root: impl Into<PathBuf>, boot: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            boot: boot.into(),
        }
    }

    /// Start from empty trees.
    ///
    /// Removing leftovers from an earlier run is best effort; creating the
    /// fresh directories is not.
    pub fn reset(&self) -> Result<()> {
        for dir in [&self.root, &self.boot] {
            if dir.exists() {
                if let Err(e) = fs::remove_dir_all(dir) {
                    tracing::warn!("could not remove stale {}: {}", dir.display(), e);
                }
            }
            fs::create_dir_all(dir)
                .with_context(|| format!("creating staging directory {}", dir.display()))?;
        }
        Ok(())
    }

    /// Move everything under the root tree's `boot/` into the boot tree.
    ///
    /// The emptied `boot/` directory stays behind as the mount point for the
    /// boot partition. A root tree without `boot/` moves nothing.
    pub fn relocate_boot(&self) -> Result<usize> {
        let src = self.root_boot_dir();
        if !src.is_dir() {
            tracing::warn!("{} does not exist, nothing to relocate", src.display());
            return Ok(0);
        }
        fs::create_dir_all(&self.boot)
            .with_context(|| format!("creating {}", self.boot.display()))?;

        let mut entries: Vec<PathBuf> = fs::read_dir(&src)
            .with_context(|| format!("Failed to read {}", src.display()))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<_>>()?;
        entries.sort();

        for entry in &entries {
            let Some(name) = entry.file_name() else {
                continue;
            };
            move_entry(entry, &self.boot.join(name))
                .with_context(|| format!("moving {} into the boot tree", entry.display()))?;
        }
        Ok(entries.len())
    }

    pub fn root_boot_dir(&self) -> PathBuf {
        self.root.join("boot")
    }
}
