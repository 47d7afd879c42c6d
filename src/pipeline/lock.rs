//! Exclusive locks on the directories a build writes to.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use super::staging::StagingTrees;

const LOCK_FILE_NAME: &str = ".alpine-rpi-builder.lock";

/// Held for the lifetime of a build; released on drop.
///
/// Covers the work directory and both staging trees. The trees are wiped on
/// reset, so their lock files sit next to them (`<tree>.lock`).
#[derive(Debug)]
pub struct BuildLock {
    _files: Vec<File>,
    paths: Vec<PathBuf>,
}

impl BuildLock {
    /// Fail immediately if another build holds any of the locks.
    pub fn acquire(work_dir: &Path, trees: &StagingTrees) -> Result<Self> {
        fs::create_dir_all(work_dir)
            .with_context(|| format!("creating work directory {}", work_dir.display()))?;

        let mut lock_paths = vec![work_dir.join(LOCK_FILE_NAME)];
        for tree in [&trees.root, &trees.boot] {
            lock_paths.push(sibling_lock_path(tree)?);
        }

        let mut files = Vec::with_capacity(lock_paths.len());
        for path in &lock_paths {
            files.push(lock_exclusive(path)?);
        }

        Ok(Self {
            _files: files,
            paths: lock_paths,
        })
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

fn sibling_lock_path(tree: &Path) -> Result<PathBuf> {
    let name = tree
        .file_name()
        .with_context(|| format!("staging tree {} has no directory name", tree.display()))?;
    let parent = tree.parent().unwrap_or(Path::new("/"));
    fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;

    let mut lock_name = OsString::from(name);
    lock_name.push(".lock");
    Ok(parent.join(lock_name))
}

fn lock_exclusive(lock_path: &Path) -> Result<File> {
    // The lock file is never unlinked: removing a file another process
    // still holds would let a third process lock a fresh inode.
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path)
        .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;

    if lock_file.try_lock_exclusive().is_err() {
        drop(lock_file);
        return Err(anyhow::anyhow!(
            "build directory is in use by another build: {}",
            lock_path.display()
        ));
    }
    Ok(lock_file)
}
