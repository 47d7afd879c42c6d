//! Staging tree operations shared by the provisioning, injection and service
//! stages.
//!
//! ```rust,ignore
//! use alpine_rpi_builder::executor::{files, openrc::{self, Runlevel}};
//!
//! let staging = Path::new("/tmp/alpine-build");
//! files::write_file_mode(staging, "/etc/hostname", "alpine-pi\n", 0o644)?;
//! openrc::enable_service(staging, "dropbear", Runlevel::Default)?;
//! ```

pub mod files;
pub mod openrc;
