//! Containment runtime invocation.
//!
//! The pipeline body runs inside a throwaway Alpine container (`--rm`). The
//! host bind-mounts the input files read-only under `/input`, the output
//! directory read-write at `/output` and this binary itself, then sends the
//! resolved build configuration as TOML on the container's stdin.
//!
//! The pipeline writes its exit code to a status file in the output
//! directory. A container that exits without one never got as far as the
//! pipeline, which keeps a stage exiting 125-127 apart from the runtime's own
//! failures.

pub mod binary;

use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::BuildError;
use crate::process::{Cmd, CommandFailed};

pub const DEFAULT_RUNTIME: &str = "docker";
pub const DEFAULT_IMAGE: &str = "alpine:latest";
pub const CONTAINER_INPUT_DIR: &str = "/input";
pub const CONTAINER_OUTPUT_DIR: &str = "/output";
pub const CONTAINER_BINARY: &str = "/usr/local/bin/alpine-rpi-builder";

/// Exit code file the in-container pipeline leaves in the output directory.
pub const STATUS_FILE_NAME: &str = ".alpine-rpi-builder.status";

/// Codes `docker run` reserves for its own failures: 125 the runtime, 126
/// the command could not be invoked, 127 the command was not found.
const RUNTIME_FAILURE_CODES: std::ops::RangeInclusive<i32> = 125..=127;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl Mount {
    fn volume_arg(&self) -> String {
        let mut spec = format!("{}:{}", self.host.display(), self.container);
        if self.read_only {
            spec.push_str(":ro");
        }
        spec
    }
}

/// Builder for `<runtime> run -i --rm ...` commands.
#[derive(Debug, Clone, Default)]
pub struct ContainerBuilder {
    runtime: String,
    image: String,
    mounts: Vec<Mount>,
    envs: Vec<(String, String)>,
    command: Vec<String>,
    stdin: Option<Vec<u8>>,
    status_file: Option<PathBuf>,
}

impl ContainerBuilder {
    pub fn new(runtime: &str, image: &str) -> Self {
        Self {
            runtime: runtime.to_string(),
            image: image.to_string(),
            ..Default::default()
        }
    }

    pub fn mount_ro(mut self, host: &Path, container: &str) -> Self {
        self.mounts.push(Mount {
            host: host.to_path_buf(),
            container: container.to_string(),
            read_only: true,
        });
        self
    }

    pub fn mount_rw(mut self, host: &Path, container: &str) -> Self {
        self.mounts.push(Mount {
            host: host.to_path_buf(),
            container: container.to_string(),
            read_only: false,
        });
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.envs.push((key.to_string(), value.to_string()));
        self
    }

    pub fn command<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.command = args.into_iter().map(|a| a.as_ref().to_string()).collect();
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Host path of the status file the contained command writes.
    pub fn status_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.status_file = Some(path.into());
        self
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    pub fn build(&self) -> Cmd {
        let mut cmd = Cmd::new(&self.runtime).args(["run", "-i", "--rm"]);

        for mount in &self.mounts {
            cmd = cmd.arg("-v").arg(mount.volume_arg());
        }
        for (key, value) in &self.envs {
            cmd = cmd.arg("-e").arg(format!("{}={}", key, value));
        }

        cmd = cmd.arg(&self.image).args(&self.command);

        if let Some(input) = &self.stdin {
            cmd = cmd.stdin_bytes(input.clone());
        }
        cmd.error_msg("containerized build failed")
    }

    /// Run with output streamed to the terminal.
    ///
    /// A runtime that cannot start, or a container that exits before the
    /// contained command reports a status, maps to
    /// [`BuildError::ContainmentUnavailable`]. A reported non-zero status maps
    /// to [`BuildError::Containment`] carrying its code.
    pub fn run(&self) -> Result<(), BuildError> {
        if let Some(path) = &self.status_file {
            clear_status(path).map_err(|e| BuildError::ContainmentUnavailable {
                runtime: self.runtime.clone(),
                detail: format!("{e:#}"),
            })?;
        }

        let result = self.build().run_interactive();
        let reported = self.status_file.as_deref().and_then(take_status);

        match result {
            Ok(_) => Ok(()),
            Err(err) => match err.downcast_ref::<CommandFailed>() {
                Some(failed) => Err(classify_exit(
                    &self.runtime,
                    failed.code,
                    self.status_file.is_some(),
                    reported,
                )),
                None => Err(BuildError::ContainmentUnavailable {
                    runtime: self.runtime.clone(),
                    detail: format!("{err:#}"),
                }),
            },
        }
    }
}

/// Map a non-zero `<runtime> run` exit to a build error.
///
/// With a status file in play, only a reported status counts as the
/// pipeline's own result. Without one, the runtime's reserved codes are
/// taken as its own failures.
pub fn classify_exit(runtime: &str, code: i32, expects_status: bool, reported: Option<i32>) -> BuildError {
    let unavailable = |detail: String| BuildError::ContainmentUnavailable {
        runtime: runtime.to_string(),
        detail,
    };
    match reported {
        Some(status) if status != 0 => BuildError::Containment { code: status },
        Some(_) => unavailable(format!(
            "'{runtime} run' exited with {code} after the pipeline reported success"
        )),
        None if expects_status => unavailable(format!(
            "'{runtime} run' exited with {code} before the pipeline started{}",
            match code {
                126 | 127 => " (is the mounted binary statically linked?)",
                _ => "",
            }
        )),
        None if RUNTIME_FAILURE_CODES.contains(&code) => {
            unavailable(format!("'{runtime} run' exited with {code}"))
        }
        None => BuildError::Containment { code },
    }
}

/// Record `code` for the host. Written by the in-container pipeline.
pub fn write_status(path: &Path, code: i32) -> Result<()> {
    fs::write(path, format!("{code}\n"))
        .with_context(|| format!("writing status file {}", path.display()))
}

/// Read and remove a status file. Missing or unreadable means no report.
pub fn take_status(path: &Path) -> Option<i32> {
    let raw = fs::read_to_string(path).ok()?;
    if let Err(e) = fs::remove_file(path) {
        tracing::debug!("could not remove {}: {}", path.display(), e);
    }
    raw.trim().parse().ok()
}

fn clear_status(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing stale {}", path.display())),
    }
}

/// Fail with [`BuildError::ContainmentUnavailable`] unless the runtime is
/// installed and its daemon answers.
pub fn check_runtime(runtime: &str) -> Result<(), BuildError> {
    if which::which(runtime).is_err() {
        return Err(BuildError::ContainmentUnavailable {
            runtime: runtime.to_string(),
            detail: "not found in PATH".to_string(),
        });
    }
    Cmd::new(runtime)
        .args(["info", "--format", "{{.ServerVersion}}"])
        .run()
        .map_err(|e| BuildError::ContainmentUnavailable {
            runtime: runtime.to_string(),
            detail: format!("{e:#}"),
        })?;
    Ok(())
}

/// Everything the host needs to start the pipeline in a container.
#[derive(Debug, Clone)]
pub struct PipelineInvocation<'a> {
    pub runtime: &'a str,
    pub image: &'a str,
    /// Statically linked build of this program, mounted into the container.
    pub binary: &'a Path,
    pub inputs: &'a [PathBuf],
    pub output_dir: &'a Path,
    /// Resolved configuration as TOML, fed on stdin.
    pub config_toml: &'a str,
    /// Extra arguments for the in-container `pipeline` subcommand.
    pub pipeline_args: &'a [String],
}

impl PipelineInvocation<'_> {
    pub fn builder(&self) -> Result<ContainerBuilder> {
        let mut builder = ContainerBuilder::new(self.runtime, self.image)
            .mount_rw(self.output_dir, CONTAINER_OUTPUT_DIR);

        for input in self.inputs {
            let name = input
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("input path {} has no file name", input.display()))?
                .to_string_lossy();
            builder = builder.mount_ro(input, &format!("{}/{}", CONTAINER_INPUT_DIR, name));
        }

        builder = builder.mount_ro(self.binary, CONTAINER_BINARY);
        if let Ok(filter) = std::env::var("RUST_LOG") {
            builder = builder.env("RUST_LOG", &filter);
        }

        let mut command = vec![
            CONTAINER_BINARY.to_string(),
            "pipeline".to_string(),
            "--status-file".to_string(),
            format!("{}/{}", CONTAINER_OUTPUT_DIR, STATUS_FILE_NAME),
        ];
        command.extend(self.pipeline_args.iter().cloned());

        Ok(builder
            .command(command)
            .stdin(self.config_toml.as_bytes().to_vec())
            .status_file(self.output_dir.join(STATUS_FILE_NAME)))
    }
}
