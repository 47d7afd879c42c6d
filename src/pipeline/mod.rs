//! The build pipeline: strictly sequential stages over the staging trees.
//!
//! ```text
//! SetupEnvironment -> InstallPackages -> ConfigureSystem -> InjectConfig
//!   -> CreateServices -> StageBootTree -> BuildPartitions -> AssembleImage
//!   -> Package
//! ```
//!
//! Each stage finishes, with its effects on disk, before the next starts. The
//! first failure aborts the run with a [`StageError`] naming the stage and
//! carrying the failing command's exit code when there was one.

pub mod config;
pub mod lock;
pub mod staging;

use anyhow::Result;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

use crate::alpine::{self, keys::HOST_KEYS_DIR, PackageManager};
use crate::artifact::disk::{self, PartitionImages};
use crate::artifact::package::{self, BuildTimestamp, PackagedImage};
use crate::inject::{self, InjectionReport};
use crate::services::{self, ServiceSettings};
use config::BuildConfig;
use lock::BuildLock;
use staging::StagingTrees;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    SetupEnvironment,
    InstallPackages,
    ConfigureSystem,
    InjectConfig,
    CreateServices,
    StageBootTree,
    BuildPartitions,
    AssembleImage,
    Package,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::SetupEnvironment,
        Stage::InstallPackages,
        Stage::ConfigureSystem,
        Stage::InjectConfig,
        Stage::CreateServices,
        Stage::StageBootTree,
        Stage::BuildPartitions,
        Stage::AssembleImage,
        Stage::Package,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::SetupEnvironment => "setup-environment",
            Stage::InstallPackages => "install-packages",
            Stage::ConfigureSystem => "configure-system",
            Stage::InjectConfig => "inject-config",
            Stage::CreateServices => "create-services",
            Stage::StageBootTree => "stage-boot-tree",
            Stage::BuildPartitions => "build-partitions",
            Stage::AssembleImage => "assemble-image",
            Stage::Package => "package",
        }
    }

    /// 1-based position in the pipeline.
    pub fn number(self) -> usize {
        Stage::ALL
            .iter()
            .position(|s| *s == self)
            .map(|i| i + 1)
            .unwrap_or(0)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A stage failed.
#[derive(Debug, Error)]
#[error("stage {stage} failed")]
pub struct StageError {
    pub stage: Stage,
    code: Option<i32>,
    #[source]
    source: anyhow::Error,
}

impl StageError {
    pub fn new(stage: Stage, code: Option<i32>, source: anyhow::Error) -> Self {
        Self {
            stage,
            code,
            source,
        }
    }

    /// Wrap an error, picking up the exit code of a failed command in its chain.
    pub fn from_anyhow(stage: Stage, source: anyhow::Error) -> Self {
        let code = crate::process::exit_code_of(&source).filter(|c| *c > 0);
        Self::new(stage, code, source)
    }

    /// Exit code to terminate with: the failing command's, else 1.
    pub fn exit_code(&self) -> i32 {
        self.code.unwrap_or(crate::error::EXIT_FAILURE)
    }
}

fn run_stage<T>(stage: Stage, f: impl FnOnce() -> Result<T>) -> Result<T, StageError> {
    tracing::info!("--> {}. {}", stage.number(), stage.name());
    let start = Instant::now();
    match f() {
        Ok(value) => {
            tracing::debug!(elapsed_ms = start.elapsed().as_millis() as u64, "{} done", stage);
            Ok(value)
        }
        Err(err) => {
            let err = StageError::from_anyhow(stage, err);
            tracing::error!(code = err.exit_code(), "{}: {:#}", stage, err.source);
            Err(err)
        }
    }
}

/// What a finished build produced.
#[derive(Debug)]
pub struct BuildOutcome {
    pub injection: InjectionReport,
    pub image: PackagedImage,
}

/// Full provisioning and image build.
pub struct Pipeline<'a> {
    config: &'a BuildConfig,
    package_manager: &'a dyn PackageManager,
    host_keys: PathBuf,
    services: ServiceSettings,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a BuildConfig, package_manager: &'a dyn PackageManager) -> Self {
        let services = ServiceSettings {
            root_partition: config.geometry().root.index,
            ..ServiceSettings::default()
        };
        Self {
            config,
            package_manager,
            host_keys: PathBuf::from(HOST_KEYS_DIR),
            services,
        }
    }

    /// Directory the apk signing keys are copied from.
    pub fn host_keys(mut self, dir: impl Into<PathBuf>) -> Self {
        self.host_keys = dir.into();
        self
    }

    pub fn trees(&self) -> StagingTrees {
        StagingTrees::new(self.config.rootfs(), self.config.bootfs())
    }

    pub fn run(&self) -> Result<BuildOutcome, StageError> {
        let trees = self.trees();
        let _lock = BuildLock::acquire(self.config.work_dir(), &trees)
            .map_err(|e| StageError::from_anyhow(Stage::SetupEnvironment, e))?;
        let root = trees.root.as_path();

        run_stage(Stage::SetupEnvironment, || {
            alpine::setup_environment(self.package_manager, &trees, &self.host_keys)
        })?;
        run_stage(Stage::InstallPackages, || {
            alpine::install_packages(self.package_manager, self.config, root)
        })?;
        run_stage(Stage::ConfigureSystem, || alpine::configure_system(root))?;
        let injection = run_stage(Stage::InjectConfig, || {
            inject::inject_all(root, self.config.input_dir())
        })?;
        tracing::info!(
            overrides = injection.overrides(),
            defaults = injection.defaults(),
            "configuration injected"
        );
        run_stage(Stage::CreateServices, || {
            services::install_all(root, &self.services).map(|_| ())
        })?;

        let image = build_image_locked(self.config, &trees)?;
        Ok(BuildOutcome { injection, image })
    }
}

/// Image stages only: boot relocation, partitions, assembly, packaging.
///
/// Works on already-populated staging trees, under the same lock as a full
/// pipeline run.
pub fn build_image(config: &BuildConfig, trees: &StagingTrees) -> Result<PackagedImage, StageError> {
    let _lock = BuildLock::acquire(config.work_dir(), trees)
        .map_err(|e| StageError::from_anyhow(Stage::StageBootTree, e))?;
    build_image_locked(config, trees)
}

fn build_image_locked(config: &BuildConfig, trees: &StagingTrees) -> Result<PackagedImage, StageError> {
    let geometry = config.geometry();
    let work_dir = config.work_dir();

    run_stage(Stage::StageBootTree, || {
        let moved = trees.relocate_boot()?;
        tracing::info!(entries = moved, "boot files moved to {}", trees.boot.display());
        Ok(())
    })?;

    let images = run_stage(Stage::BuildPartitions, || {
        disk::build_partitions(geometry, &trees.boot, &trees.root, work_dir)
    })?;

    let (timestamp, assembled) = run_stage(Stage::AssembleImage, || {
        // Captured once: the disk signature and the output name share it.
        let timestamp = match config.timestamp() {
            Some(ts) => ts.clone(),
            None => BuildTimestamp::now()?,
        };
        let assembled = disk::assemble(geometry, &images, work_dir, timestamp.disk_signature())?;
        Ok((timestamp, assembled))
    })?;

    let packaged = run_stage(Stage::Package, || {
        package::package_image(
            &assembled.path,
            config.output_dir(),
            &config.image_name(timestamp),
            geometry,
        )
    })?;

    cleanup_intermediates(&images, &assembled.path);
    tracing::info!("Disk image build complete: {}", packaged.path.display());
    Ok(packaged)
}

/// Remove partition images and the raw image. Best effort.
fn cleanup_intermediates(images: &PartitionImages, raw: &Path) {
    for path in [images.boot.as_path(), images.root.as_path(), raw] {
        if let Err(e) = fs::remove_file(path) {
            tracing::debug!("could not remove {}: {}", path.display(), e);
        }
    }
}
