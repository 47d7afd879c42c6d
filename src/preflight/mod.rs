//! Preflight checks for build validation.
//!
//! Validates that the host has the tools and the input files a build needs
//! before anything is started. A missing input is reported by name and the
//! build stops before any container runs.
//!
//! # Example
//!
//! ```rust
//! use alpine_rpi_builder::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("mkfs.ext4") {
//!     println!("e2fsprogs not installed");
//! }
//!
//! let tools = &[("mkfs.vfat", "dosfstools"), ("mcopy", "mtools")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

use crate::error::BuildError;

/// Input files that must exist before a build starts.
pub const REQUIRED_INPUTS: &[&str] = &["setup-interfaces-iwd.sh", "config.txt", "cmdline.txt"];

/// Input files picked up when present, otherwise built-in defaults apply.
pub const OPTIONAL_INPUTS: &[&str] = &["interfaces", "hostname", "modules", "fstab"];

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    crate::process::exists(cmd)
}

/// Check that specific tools are available.
///
/// Each tuple is (command, package). Fails with the full list of missing
/// tools and the packages that provide them.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push((*tool, *package));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Resolved paths of every input file found in `dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFiles {
    pub required: Vec<PathBuf>,
    pub optional: Vec<PathBuf>,
}

impl InputFiles {
    pub fn all(&self) -> impl Iterator<Item = &PathBuf> {
        self.required.iter().chain(self.optional.iter())
    }
}

/// Verify the required inputs exist in `dir` and collect the optional ones.
///
/// Stops at the first missing required file, in [`REQUIRED_INPUTS`] order.
pub fn check_inputs(dir: &Path) -> Result<InputFiles, BuildError> {
    let mut required = Vec::with_capacity(REQUIRED_INPUTS.len());
    for name in REQUIRED_INPUTS {
        let path = dir.join(name);
        if !path.is_file() {
            return Err(BuildError::MissingInput {
                name: (*name).to_string(),
                path,
            });
        }
        required.push(path);
    }

    let optional = OPTIONAL_INPUTS
        .iter()
        .map(|name| dir.join(name))
        .filter(|path| path.is_file())
        .collect();

    Ok(InputFiles { required, optional })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_command_exists() {
        assert!(command_exists("ls"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_failure() {
        let tools = &[("ls", "coreutils"), ("nonexistent_command_xyz", "fake-package")];
        let err = check_required_tools(tools).unwrap_err().to_string();
        assert!(err.contains("nonexistent_command_xyz (install: fake-package)"));
        assert!(!err.contains("coreutils"));
    }

    #[test]
    fn test_missing_input_is_named() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("setup-interfaces-iwd.sh"), "#!/bin/sh\n").unwrap();
        fs::write(temp.path().join("cmdline.txt"), "quiet\n").unwrap();

        let err = check_inputs(temp.path()).unwrap_err();
        match &err {
            BuildError::MissingInput { name, .. } => assert_eq!(name, "config.txt"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.exit_code(), crate::error::EXIT_MISSING_INPUT);
    }

    #[test]
    fn test_inputs_found_with_optional_overrides() {
        let temp = TempDir::new().unwrap();
        for name in REQUIRED_INPUTS {
            fs::write(temp.path().join(name), "x").unwrap();
        }
        fs::write(temp.path().join("hostname"), "pi-lab\n").unwrap();

        let inputs = check_inputs(temp.path()).unwrap();
        assert_eq!(inputs.required.len(), 3);
        assert_eq!(inputs.optional, vec![temp.path().join("hostname")]);
        assert_eq!(inputs.all().count(), 4);
    }

    #[test]
    fn test_directory_named_like_input_does_not_count() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("setup-interfaces-iwd.sh"), "x").unwrap();
        fs::create_dir(temp.path().join("config.txt")).unwrap();
        fs::write(temp.path().join("cmdline.txt"), "x").unwrap();
        assert!(check_inputs(temp.path()).is_err());
    }
}
