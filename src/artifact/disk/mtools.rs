//! mtools file operations for FAT32 image manipulation.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::process::Cmd;

/// Copy the contents of `src_dir` into the root of a FAT image, recursively.
///
/// Equivalent to `mcopy -i image -s src_dir/* ::/`, with the entries sorted
/// so the directory order inside the FAT volume is stable across builds.
pub fn mtools_copy_tree(image: &Path, src_dir: &Path) -> Result<usize> {
    let mut entries: Vec<PathBuf> = fs::read_dir(src_dir)
        .with_context(|| format!("Failed to read {}", src_dir.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    entries.sort();

    if entries.is_empty() {
        bail!(
            "boot staging tree {} is empty; nothing to put on the boot partition",
            src_dir.display()
        );
    }

    let mut cmd = Cmd::new("mcopy").args(["-i"]).arg_path(image).args(["-s", "-Q"]);
    for entry in &entries {
        cmd = cmd.arg_path(entry);
    }
    cmd.arg("::/")
        .error_msg(format!(
            "mcopy failed: {} -> {}",
            src_dir.display(),
            image.display()
        ))
        .run()?;

    Ok(entries.len())
}

/// List a directory inside a FAT image (`mdir -b`), one path per line.
pub fn mtools_list(image: &Path, dir: &str) -> Result<Vec<String>> {
    let result = Cmd::new("mdir")
        .args(["-i"])
        .arg_path(image)
        .arg("-b")
        .arg(format!("::{}", dir))
        .error_msg(format!("mdir failed for ::{}", dir))
        .run()?;

    Ok(result
        .stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_tree_is_rejected() {
        let temp = TempDir::new().unwrap();
        let err = mtools_copy_tree(&temp.path().join("boot.img"), temp.path()).unwrap_err();
        assert!(err.to_string().contains("is empty"));
    }
}
