//! File placement into a staging tree: write, copy with mode, move.
//!
//! All paths given as `&str` are relative to the staging root, with or without
//! a leading `/`.

use anyhow::{bail, Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Resolve an absolute in-image path (`/etc/hostname`) below a staging root.
pub fn staged_path(staging: &Path, path: &str) -> PathBuf {
    staging.join(path.trim_start_matches('/'))
}

/// Write a file with specific permissions, replacing any existing file.
pub fn write_file_mode(staging: &Path, path: &str, content: &str, mode: u32) -> Result<PathBuf> {
    let full_path = staged_path(staging, path);
    if let Some(parent) = full_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&full_path, content)
        .with_context(|| format!("Failed to write {}", full_path.display()))?;
    fs::set_permissions(&full_path, fs::Permissions::from_mode(mode))?;
    Ok(full_path)
}

/// Copy `src` verbatim to `path` in the staging tree and set `mode`.
pub fn copy_file_mode(src: &Path, staging: &Path, path: &str, mode: u32) -> Result<PathBuf> {
    if !src.is_file() {
        bail!("file not found: {}", src.display());
    }
    let dst = staged_path(staging, path);
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    // A read-only destination (previous build, 0444 source) would make fs::copy fail.
    if dst.exists() {
        fs::remove_file(&dst)?;
    }
    fs::copy(src, &dst)
        .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
    fs::set_permissions(&dst, fs::Permissions::from_mode(mode))?;
    Ok(dst)
}

/// Recursively copy a directory tree, preserving symlinks.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            let target = fs::read_link(&src_path)?;
            std::os::unix::fs::symlink(target, &dst_path)?;
        } else if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }

    Ok(())
}

/// Move a file or directory, falling back to copy + delete across filesystems.
///
/// An existing destination is replaced.
pub fn move_entry(src: &Path, dst: &Path) -> Result<()> {
    remove_any(dst)?;
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }

    let meta = fs::symlink_metadata(src)
        .with_context(|| format!("Failed to stat {}", src.display()))?;
    if meta.file_type().is_symlink() {
        std::os::unix::fs::symlink(fs::read_link(src)?, dst)?;
    } else if meta.is_dir() {
        copy_dir_recursive(src, dst)?;
    } else {
        fs::copy(src, dst)?;
    }
    remove_any(src)
        .with_context(|| format!("Failed to remove {} after copying it", src.display()))
}

fn remove_any(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(_) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_file_mode_sets_permissions() {
        let temp = TempDir::new().unwrap();

        let path = write_file_mode(temp.path(), "/etc/hostname", "alpine-pi\n", 0o644).unwrap();

        assert_eq!(path, temp.path().join("etc/hostname"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "alpine-pi\n");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn test_copy_file_mode_replaces_read_only_target() {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join("staging");
        let src = temp.path().join("script.sh");
        fs::write(&src, "#!/bin/sh\necho new\n").unwrap();

        write_file_mode(&staging, "usr/sbin/script.sh", "old", 0o444).unwrap();
        let dst = copy_file_mode(&src, &staging, "/usr/sbin/script.sh", 0o755).unwrap();

        assert_eq!(fs::read_to_string(&dst).unwrap(), "#!/bin/sh\necho new\n");
        assert_eq!(fs::metadata(&dst).unwrap().permissions().mode() & 0o777, 0o755);
    }

    #[test]
    fn test_copy_file_mode_missing_source() {
        let temp = TempDir::new().unwrap();
        assert!(copy_file_mode(&temp.path().join("nope"), temp.path(), "x", 0o644).is_err());
    }

    #[test]
    fn test_move_entry_directory_replaces_destination() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src/overlays");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.dtbo"), "a").unwrap();
        std::os::unix::fs::symlink("a.dtbo", src.join("b.dtbo")).unwrap();

        let dst = temp.path().join("dst/overlays");
        fs::create_dir_all(&dst).unwrap();
        fs::write(dst.join("stale"), "x").unwrap();

        move_entry(&src, &dst).unwrap();

        assert!(!src.exists());
        assert!(!dst.join("stale").exists());
        assert_eq!(fs::read_to_string(dst.join("a.dtbo")).unwrap(), "a");
        assert!(dst.join("b.dtbo").is_symlink());
    }
}
