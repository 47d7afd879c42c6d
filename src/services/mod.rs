//! One-shot OpenRC services.
//!
//! A one-shot service is an ordinary `openrc-run` script enabled in a runlevel
//! whose `start()` removes its own enablement link once its job is done. On
//! disk the state is the init script plus that link:
//!
//! ```text
//! Disabled --install--> EnabledPending --success--> EnabledDone (script, no link)
//!                            ^    |
//!                            +----+ failure / offline: retry next boot
//! ```
//!
//! [`next_state`] and [`apply_outcome`] model what the rendered script does on
//! the device, so the transitions can be tested against a staging tree.

pub mod definitions;

use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::executor::files::{staged_path, write_file_mode};
use crate::executor::openrc::{self, Runlevel};

pub use definitions::{all_services, ServiceSettings};

/// Ordering constraint in the `depend()` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
    Need(String),
    After(String),
    Before(String),
}

impl Dependency {
    fn render(&self) -> String {
        match self {
            Dependency::Need(svc) => format!("need {svc}"),
            Dependency::After(svc) => format!("after {svc}"),
            Dependency::Before(svc) => format!("before {svc}"),
        }
    }
}

/// When the service removes its own enablement link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeregisterPolicy {
    /// Only after the action succeeded.
    OnSuccess,
    /// After every run, whatever the outcome.
    Unconditional,
    /// Runs on every boot.
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Disabled,
    EnabledPending,
    EnabledDone,
}

/// Result of one boot-time run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Failure,
    /// Network not up yet. Never fatal.
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneShotService {
    pub name: String,
    pub description: String,
    pub depends: Vec<Dependency>,
    pub runlevel: Runlevel,
    pub policy: DeregisterPolicy,
    /// Body of `start()`, already indented.
    pub start_body: String,
}

impl OneShotService {
    /// Shell command the script uses to deregister itself.
    pub fn deregister_command(&self) -> String {
        format!("rc-update del {} {}", self.name, self.runlevel.as_str())
    }

    pub fn init_script_path(&self) -> String {
        format!("/etc/init.d/{}", self.name)
    }

    /// Full `openrc-run` script text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("#!/sbin/openrc-run\n");
        let _ = writeln!(out, "description=\"{}\"", self.description);
        out.push('\n');
        out.push_str("depend() {\n");
        for dep in &self.depends {
            let _ = writeln!(out, "    {}", dep.render());
        }
        out.push_str("}\n\n");
        out.push_str("start() {\n");
        out.push_str(&self.start_body);
        if !self.start_body.ends_with('\n') {
            out.push('\n');
        }
        out.push_str("}\n");
        out
    }

    /// Write the init script (0755) and enable it in its runlevel.
    pub fn install(&self, root: &Path) -> Result<PathBuf> {
        let path = write_file_mode(root, &self.init_script_path(), &self.render(), 0o755)
            .with_context(|| format!("writing init script for {}", self.name))?;
        openrc::enable_service(root, &self.name, self.runlevel)
            .with_context(|| format!("enabling {} in {}", self.name, self.runlevel.as_str()))?;
        Ok(path)
    }

    /// Current state as recorded in `root`.
    ///
    /// An installed script without a runlevel link has run and deregistered.
    pub fn state(&self, root: &Path) -> ServiceState {
        if openrc::is_enabled(root, &self.name, self.runlevel) {
            ServiceState::EnabledPending
        } else if staged_path(root, &self.init_script_path()).is_file() {
            ServiceState::EnabledDone
        } else {
            ServiceState::Disabled
        }
    }
}

/// Transition taken after one run.
pub fn next_state(policy: DeregisterPolicy, state: ServiceState, outcome: RunOutcome) -> ServiceState {
    match state {
        ServiceState::EnabledPending => match (policy, outcome) {
            (DeregisterPolicy::Unconditional, _) => ServiceState::EnabledDone,
            (DeregisterPolicy::OnSuccess, RunOutcome::Success) => ServiceState::EnabledDone,
            (DeregisterPolicy::OnSuccess, _) | (DeregisterPolicy::Never, _) => {
                ServiceState::EnabledPending
            }
        },
        other => other,
    }
}

/// Apply a run's outcome to the enablement link in `root`, as the script's
/// `rc-update del` would.
pub fn apply_outcome(service: &OneShotService, root: &Path, outcome: RunOutcome) -> Result<ServiceState> {
    let next = next_state(service.policy, service.state(root), outcome);
    if next == ServiceState::EnabledDone {
        openrc::disable_service(root, &service.name, service.runlevel)?;
    }
    Ok(next)
}

/// Install every one-shot service into the root tree.
pub fn install_all(root: &Path, settings: &ServiceSettings) -> Result<Vec<OneShotService>> {
    let services = all_services(settings);
    for service in &services {
        let path = service.install(root)?;
        tracing::info!(policy = ?service.policy, "installed {}", path.display());
    }
    Ok(services)
}
