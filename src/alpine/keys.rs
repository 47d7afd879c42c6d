//! Alpine signing key setup.
//!
//! The build environment's keys in `/etc/apk/keys/` are copied into the
//! staging root so apk can verify packages installed there.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

/// Host directory holding the build environment's apk keys.
pub const HOST_KEYS_DIR: &str = "/etc/apk/keys";

/// Copy every key from `keys_src` into `<rootfs>/etc/apk/keys/`.
///
/// Fails when the source holds no keys or a key is not a PEM public key.
pub fn copy_keys(keys_src: &Path, rootfs_path: &Path) -> Result<usize> {
    let keys_dir = rootfs_path.join("etc/apk/keys");
    fs::create_dir_all(&keys_dir)
        .with_context(|| format!("Failed to create keys directory: {}", keys_dir.display()))?;

    let mut copied = 0;
    let entries = fs::read_dir(keys_src)
        .with_context(|| format!("Failed to read keys directory: {}", keys_src.display()))?;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let src = entry.path();
        let content = fs::read_to_string(&src)
            .with_context(|| format!("Failed to read key file: {}", src.display()))?;
        if !content.contains("BEGIN PUBLIC KEY") {
            bail!("Key file {} does not contain valid PEM format", src.display());
        }

        let dst = keys_dir.join(entry.file_name());
        fs::write(&dst, content)
            .with_context(|| format!("Failed to write key file: {}", dst.display()))?;
        copied += 1;
    }

    if copied == 0 {
        bail!("no apk signing keys found in {}", keys_src.display());
    }

    tracing::info!("Alpine signing keys installed ({} keys)", copied);
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TEST_KEY: &str = "-----BEGIN PUBLIC KEY-----\nMIIBIjANBg==\n-----END PUBLIC KEY-----\n";

    #[test]
    fn test_copy_keys() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let src = temp_dir.path().join("keys");
        fs::create_dir_all(&src)?;
        fs::write(src.join("alpine-devel@lists.alpinelinux.org-1.rsa.pub"), TEST_KEY)?;
        fs::write(src.join("alpine-devel@lists.alpinelinux.org-2.rsa.pub"), TEST_KEY)?;
        let rootfs = temp_dir.path().join("rootfs");

        assert_eq!(copy_keys(&src, &rootfs)?, 2);

        let copied = rootfs.join("etc/apk/keys/alpine-devel@lists.alpinelinux.org-1.rsa.pub");
        assert_eq!(fs::read_to_string(copied)?, TEST_KEY);
        Ok(())
    }

    #[test]
    fn test_copy_keys_empty_source() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let src = temp_dir.path().join("keys");
        fs::create_dir_all(&src)?;

        assert!(copy_keys(&src, &temp_dir.path().join("rootfs")).is_err());
        Ok(())
    }

    #[test]
    fn test_copy_keys_rejects_non_pem() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let src = temp_dir.path().join("keys");
        fs::create_dir_all(&src)?;
        fs::write(src.join("bogus.pub"), "not a key")?;

        assert!(copy_keys(&src, &temp_dir.path().join("rootfs")).is_err());
        Ok(())
    }
}
