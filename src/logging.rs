//! Logging initialization.
//!
//! Diagnostics go to stderr so the host terminal sees the in-container
//! pipeline's progress through the container's stderr stream.

use std::io;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Default filter when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    /// Compact human-readable lines.
    #[default]
    Compact,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    /// Command-line spelling, for forwarding to a child process.
    pub fn as_arg(self) -> &'static str {
        match self {
            LogFormat::Compact => "compact",
            LogFormat::Json => "json",
        }
    }
}

fn filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "debug" } else { DEFAULT_FILTER })
    })
}

/// Install the global subscriber. Later calls are ignored.
pub fn init(format: LogFormat, verbose: bool) -> anyhow::Result<()> {
    let layer = match format {
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(io::stderr)
            .with_filter(filter(verbose))
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(io::stderr)
            .with_filter(filter(verbose))
            .boxed(),
    };

    // Already initialized (tests, or a second call) is not an error.
    let _ = tracing_subscriber::registry().with(layer).try_init();
    Ok(())
}
