//! Builds bootable Alpine Linux SD card images for the Raspberry Pi.
//!
//! The build is a strictly sequential pipeline over two staging trees, the
//! future root and boot partitions:
//!
//! - **Provisioning** ([`alpine`]) - apk installs the base system into the root tree
//! - **Configuration** ([`inject`]) - network, hostname, modules, fstab and the
//!   firmware boot files, from override files or built-in defaults
//! - **First-boot services** ([`services`]) - self-deregistering OpenRC scripts
//! - **Image** ([`artifact`]) - FAT32 + ext4 partition images, MBR assembly at
//!   fixed offsets, compression and naming
//!
//! # Architecture
//!
//! ```text
//! host: alpine-rpi-builder build
//!     │  preflight (inputs, container runtime)
//!     │  docker run -i --rm  (inputs ro at /input, output rw at /output)
//!     ▼
//! container: alpine-rpi-builder pipeline  (BuildConfig as TOML on stdin)
//!     │
//!     ├── alpine::setup_environment / install_packages / configure_system
//!     ├── inject::inject_all
//!     ├── services::install_all
//!     └── pipeline::build_image
//!             ├── staging: relocate root boot/ into the boot tree
//!             ├── artifact::disk::build_partitions
//!             ├── artifact::disk::assemble
//!             └── artifact::package::package_image
//! ```

pub mod alpine;
pub mod artifact;
pub mod container;
pub mod error;
pub mod executor;
pub mod inject;
pub mod logging;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod services;

pub use error::BuildError;
pub use pipeline::config::BuildConfig;
pub use pipeline::{Pipeline, Stage, StageError};
