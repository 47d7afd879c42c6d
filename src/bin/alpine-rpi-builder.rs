//! alpine-rpi-builder - Alpine Linux SD card image builder for the Raspberry Pi.
//!
//! `build` runs on the host and starts `pipeline` inside a container; the
//! other subcommands work directly on the local machine.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use alpine_rpi_builder::alpine::Apk;
use alpine_rpi_builder::artifact::disk::geometry::MIB;
use alpine_rpi_builder::artifact::disk::{DiskGeometry, Mbr};
use alpine_rpi_builder::artifact::package::{BuildTimestamp, Compression};
use alpine_rpi_builder::container::{
    self, PipelineInvocation, CONTAINER_INPUT_DIR, CONTAINER_OUTPUT_DIR, DEFAULT_IMAGE,
    DEFAULT_RUNTIME,
};
use alpine_rpi_builder::error::exit_code_for;
use alpine_rpi_builder::logging::{self, LogFormat};
use alpine_rpi_builder::pipeline::config::ConfigFile;
use alpine_rpi_builder::pipeline::staging::StagingTrees;
use alpine_rpi_builder::pipeline::{self, Pipeline};
use alpine_rpi_builder::{preflight, BuildConfig};

#[derive(Parser)]
#[command(name = "alpine-rpi-builder")]
#[command(about = "Alpine Linux SD card image builder for the Raspberry Pi")]
#[command(
    after_help = "QUICK START:\n  alpine-rpi-builder plan     Show the layout and output name\n  alpine-rpi-builder build    Build in a container (needs setup-interfaces-iwd.sh, config.txt, cmdline.txt)\n  alpine-rpi-builder inspect IMG  Show the partition table of a raw image"
)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, global = true, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the image inside a container (host entry point)
    Build {
        #[command(flatten)]
        config: ConfigArgs,

        /// Directory holding setup-interfaces-iwd.sh, config.txt, cmdline.txt
        /// and optional interfaces, hostname, modules, fstab overrides
        #[arg(long, default_value = ".")]
        input_dir: PathBuf,

        /// Where the compressed image is written
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,

        /// Container runtime
        #[arg(long, default_value = DEFAULT_RUNTIME)]
        runtime: String,

        /// Container image the pipeline runs in
        #[arg(long, default_value = DEFAULT_IMAGE)]
        image: String,

        /// Statically linked alpine-rpi-builder to run inside the container
        /// (default: this executable)
        #[arg(long)]
        binary: Option<PathBuf>,
    },

    /// Run every stage in this environment, reading the TOML config from
    /// stdin (container entry point)
    Pipeline {
        /// Read the config from this file instead of stdin
        #[arg(long)]
        config: Option<PathBuf>,

        /// Write the exit code here before exiting (read back by `build`)
        #[arg(long)]
        status_file: Option<PathBuf>,
    },

    /// Build partitions, assemble and package from populated staging trees
    Assemble {
        #[command(flatten)]
        config: ConfigArgs,

        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
    },

    /// Print the partition table of a raw image
    Inspect {
        /// Uncompressed disk image
        image: PathBuf,
    },

    /// Print the partition layout and output name without building
    Plan {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

/// Config file plus per-field overrides.
#[derive(Args, Clone, Default)]
struct ConfigArgs {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Target architecture (default: armhf)
    #[arg(long)]
    arch: Option<String>,

    /// Alpine release branch (default: v3.23)
    #[arg(long)]
    branch: Option<String>,

    /// Total image size in MiB (default: 512)
    #[arg(long)]
    size_mib: Option<u64>,

    #[arg(long, value_enum)]
    compression: Option<Compression>,

    /// Package mirror base URL
    #[arg(long)]
    mirror: Option<String>,

    /// Fixed build time, YYYYMMDD-HHMMSS
    #[arg(long)]
    timestamp: Option<String>,

    /// Root staging tree
    #[arg(long)]
    rootfs: Option<PathBuf>,

    /// Boot staging tree
    #[arg(long)]
    bootfs: Option<PathBuf>,

    /// Scratch directory for partition images
    #[arg(long)]
    work_dir: Option<PathBuf>,
}

impl ConfigArgs {
    fn layered(&self) -> Result<ConfigFile> {
        let file = match &self.config {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };
        Ok(file.merge(ConfigFile {
            arch: self.arch.clone(),
            branch: self.branch.clone(),
            image_size_mib: self.size_mib,
            rootfs: self.rootfs.clone(),
            bootfs: self.bootfs.clone(),
            work_dir: self.work_dir.clone(),
            mirror: self.mirror.clone(),
            compression: self.compression,
            timestamp: self.timestamp.clone(),
            ..Default::default()
        }))
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = logging::init(cli.log_format, cli.verbose) {
        eprintln!("failed to initialize logging: {e:#}");
    }

    let code = match run(&cli) {
        Ok(()) => 0,
        Err(err) => {
            let code = exit_code_for(&err);
            tracing::error!(code, "{:#}", err);
            code
        }
    };

    if let Commands::Pipeline {
        status_file: Some(path),
        ..
    } = &cli.command
    {
        if let Err(e) = container::write_status(path, code) {
            tracing::warn!("{:#}", e);
        }
    }

    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Build {
            config,
            input_dir,
            output_dir,
            runtime,
            image,
            binary,
        } => cmd_build(cli, config, input_dir, output_dir, runtime, image, binary.as_deref()),
        Commands::Pipeline { config, .. } => cmd_pipeline(config.as_deref()),
        Commands::Assemble { config, output_dir } => cmd_assemble(config, output_dir),
        Commands::Inspect { image } => cmd_inspect(image),
        Commands::Plan { config } => cmd_plan(config),
    }
}

fn cmd_build(
    cli: &Cli,
    args: &ConfigArgs,
    input_dir: &Path,
    output_dir: &Path,
    runtime: &str,
    image: &str,
    binary: Option<&Path>,
) -> Result<()> {
    // The container sees its own fixed paths.
    let layered = args.layered()?.merge(ConfigFile {
        input_dir: Some(PathBuf::from(CONTAINER_INPUT_DIR)),
        output_dir: Some(PathBuf::from(CONTAINER_OUTPUT_DIR)),
        ..Default::default()
    });
    let config = BuildConfig::resolve(layered)?;

    let inputs = preflight::check_inputs(input_dir)?;
    container::check_runtime(runtime)?;

    let binary = match binary {
        Some(path) => path.to_path_buf(),
        None => std::env::current_exe().context("locating the running executable")?,
    };
    let binary = fs::canonicalize(&binary)
        .with_context(|| format!("resolving {}", binary.display()))?;
    container::binary::ensure_static(&binary)?;
    fs::create_dir_all(output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;
    let output_dir = fs::canonicalize(output_dir)?;
    let inputs = inputs
        .all()
        .map(|p| fs::canonicalize(p).with_context(|| format!("resolving {}", p.display())))
        .collect::<Result<Vec<_>>>()?;

    let config_toml = config.to_file().to_toml_string()?;
    let mut pipeline_args = vec!["--log-format".to_string(), cli.log_format.as_arg().to_string()];
    if cli.verbose {
        pipeline_args.push("--verbose".to_string());
    }

    tracing::info!(
        arch = config.arch(),
        branch = config.branch(),
        runtime,
        "starting containerized build"
    );
    PipelineInvocation {
        runtime,
        image,
        binary: &binary,
        inputs: &inputs,
        output_dir: &output_dir,
        config_toml: &config_toml,
        pipeline_args: &pipeline_args,
    }
    .builder()?
    .run()?;

    tracing::info!("output written to {}", output_dir.display());
    Ok(())
}

fn cmd_pipeline(config_path: Option<&Path>) -> Result<()> {
    let file = match config_path {
        Some(path) => ConfigFile::load(path)?,
        None => {
            let mut raw = String::new();
            io::stdin()
                .read_to_string(&mut raw)
                .context("reading build config from stdin")?;
            ConfigFile::from_toml_str(&raw).context("parsing build config from stdin")?
        }
    };
    let config = BuildConfig::resolve(file)?;

    let apk = Apk::default();
    let outcome = Pipeline::new(&config, &apk).run()?;

    println!(">>> Disk Image Build Complete. Output file: {}", outcome.image.manifest.file_name);
    Ok(())
}

fn cmd_assemble(args: &ConfigArgs, output_dir: &Path) -> Result<()> {
    let layered = args.layered()?.merge(ConfigFile {
        output_dir: Some(std::path::absolute(output_dir)?),
        ..Default::default()
    });
    let config = BuildConfig::resolve(layered)?;
    let trees = StagingTrees::new(config.rootfs(), config.bootfs());

    let packaged = pipeline::build_image(&config, &trees)?;
    println!("{}", packaged.path.display());
    println!("  sha256: {}", packaged.manifest.sha256);
    Ok(())
}

fn cmd_inspect(image: &Path) -> Result<()> {
    let table = Mbr::read_from(image)?;
    let len = fs::metadata(image)?.len();

    println!("{}: {} MiB, disk signature 0x{:08x}", image.display(), len / MIB, table.disk_signature);
    println!("  #  boot  type  start(LBA)    sectors   start(MiB)  size(MiB)");
    for (i, entry) in table.entries.iter().enumerate() {
        if entry.is_empty() {
            continue;
        }
        println!(
            "  {}  {:<4}  0x{:02x}  {:>10}  {:>9}  {:>11}  {:>9}",
            i + 1,
            if entry.bootable { "*" } else { "" },
            entry.partition_type,
            entry.start_lba,
            entry.sector_count,
            entry.start_bytes() / MIB,
            entry.size_bytes() / MIB
        );
    }

    let standard = DiskGeometry::for_image_size(len / MIB)
        .ok()
        .and_then(|g| Mbr::for_geometry(&g, table.disk_signature).ok())
        .is_some_and(|expected| expected.entries == table.entries);
    println!(
        "  layout: {}",
        if standard { "standard" } else { "non-standard" }
    );
    Ok(())
}

fn cmd_plan(args: &ConfigArgs) -> Result<()> {
    let config = BuildConfig::resolve(args.layered()?)?;
    let geometry = config.geometry();
    let timestamp = match config.timestamp() {
        Some(ts) => ts.clone(),
        None => BuildTimestamp::now()?,
    };

    println!("arch:    {}", config.arch());
    println!("branch:  {}", config.branch());
    println!("image:   {} MiB", geometry.total_mib());
    for part in geometry.partitions() {
        println!(
            "  p{} {:<5} {:<4} start {:>4} MiB  size {:>5} MiB{}",
            part.index,
            part.kind.name(),
            part.kind.label(),
            part.start_bytes / MIB,
            part.size_mib(),
            if part.bootable { "  (boot)" } else { "" }
        );
    }
    for repo in config.repositories() {
        println!("repo:    {}", repo);
    }
    println!("output:  {}", config.image_name(timestamp).file_name());
    Ok(())
}
