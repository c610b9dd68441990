//! Step executor - interprets [`Action`] variants against the host.
//!
//! One handler module per action kind. Handlers return `Err` for a failed
//! action and collect anything non-fatal (missing trust support, a unit that
//! came up inactive) as warnings on [`Applied`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use appliance_provision::executor::{self, Host};
//!
//! let host = Host { ctx: &ctx, runner: &runner, observer: &observer,
//!                   downloader: &downloader, cloner: &cloner };
//! let applied = executor::execute_step(&host, &step)?;
//! for warning in &applied.warnings {
//!     log::warn!("{}", warning);
//! }
//! ```

pub mod fetch;
pub mod files;
pub mod launcher;
pub mod packages;
pub mod reset;
pub mod service;
pub mod source;

use crate::context::ProvisioningContext;
use crate::error::Result;
use crate::observer::SystemObserver;
use crate::plan::{Action, Step};
use crate::process::CommandRunner;

use fetch::Downloader;
use source::RepoCloner;

/// The host seams a step may touch.
pub struct Host<'a> {
    pub ctx: &'a ProvisioningContext,
    pub runner: &'a dyn CommandRunner,
    pub observer: &'a dyn SystemObserver,
    pub downloader: &'a dyn Downloader,
    pub cloner: &'a dyn RepoCloner,
}

/// Outcome of an action that did not fail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Applied {
    pub warnings: Vec<String>,
    /// Set when the action found nothing to do.
    pub skipped: Option<String>,
}

impl Applied {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            warnings: Vec::new(),
            skipped: Some(reason.into()),
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// Execute one step's action.
///
/// The step's verification is not checked here, except where the action
/// itself uses it to decide whether to run (see `skip_when_verified`).
pub fn execute_step(host: &Host<'_>, step: &Step) -> Result<Applied> {
    match &step.action {
        Action::PackageInstall(group) => packages::install(host, group),
        Action::SourceBuild(spec) => source::build(host, spec, step.verify.as_ref()),
        Action::ArtifactFetch(artifact) => fetch::fetch(host, artifact),
        Action::StateReset(spec) => reset::reset(host, spec),
        Action::LauncherWrite(descriptor) => launcher::write(host, descriptor),
        Action::ServiceInstall(descriptor) => service::install(host, descriptor),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan;
    use crate::testing::Rig;

    #[test]
    fn test_execute_step_dispatches_by_kind() {
        let rig = Rig::new();
        rig.observer.add_package("git");
        let step = Step::new("tools", plan::packages(["git"]));

        let applied = execute_step(&rig.host(), &step).unwrap();

        assert!(applied.warnings.is_empty());
        assert!(rig.runner.ran("apt-get install"));
    }

    #[test]
    fn test_execute_step_reset_of_absent_path() {
        let rig = Rig::new();
        let target = rig.home().join(".config/sdrpp");
        let step = Step::new("wipe", plan::reset(&target));

        let applied = execute_step(&rig.host(), &step).unwrap();

        assert!(applied.skipped.is_some());
        assert!(rig.runner.calls().is_empty());
    }
}
