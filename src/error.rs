//! Top-level build errors and the process exit codes they map to.

use std::path::PathBuf;
use thiserror::Error;

use crate::pipeline::StageError;

/// A required input file is missing (sysexits `EX_NOINPUT`).
pub const EXIT_MISSING_INPUT: i32 = 66;

/// The containment runtime is not installed or cannot start (sysexits `EX_UNAVAILABLE`).
pub const EXIT_CONTAINMENT_UNAVAILABLE: i32 = 69;

/// Configuration rejected before any work started (sysexits `EX_CONFIG`).
pub const EXIT_INVALID_CONFIG: i32 = 78;

/// Generic failure when no originating exit code is known.
pub const EXIT_FAILURE: i32 = 1;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("required input file '{name}' not found at {}", .path.display())]
    MissingInput { name: String, path: PathBuf },

    #[error("container runtime '{runtime}' not found or not runnable: {detail}")]
    ContainmentUnavailable { runtime: String, detail: String },

    #[error("cannot run {} inside the container: {detail}", .path.display())]
    PipelineBinary { path: PathBuf, detail: String },

    #[error("invalid build configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Stage(#[from] StageError),

    /// The containerized pipeline exited non-zero. The code is the failing
    /// stage's code, passed through the container boundary.
    #[error("containerized build failed with exit code {code}")]
    Containment { code: i32 },
}

impl BuildError {
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildError::MissingInput { .. } => EXIT_MISSING_INPUT,
            BuildError::ContainmentUnavailable { .. } | BuildError::PipelineBinary { .. } => {
                EXIT_CONTAINMENT_UNAVAILABLE
            }
            BuildError::InvalidConfig(_) => EXIT_INVALID_CONFIG,
            BuildError::Stage(stage) => stage.exit_code(),
            BuildError::Containment { code } => *code,
        }
    }
}

/// Map any error to the exit code the process should terminate with.
///
/// Typed [`BuildError`]s keep their code; anything else falls back to the
/// exit code of a failed external command in the chain, then to 1.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(build) = err.downcast_ref::<BuildError>() {
        return build.exit_code();
    }
    if let Some(stage) = err.downcast_ref::<StageError>() {
        return stage.exit_code();
    }
    crate::process::exit_code_of(err)
        .filter(|code| *code > 0)
        .unwrap_or(EXIT_FAILURE)
}
