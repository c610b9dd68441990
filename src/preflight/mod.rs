//! Preflight checks for provisioning plans.
//!
//! Validates that the host has the tools a plan will shell out to before
//! the first step runs. A half-provisioned appliance is worse than one that
//! refused to start.
//!
//! # Example
//!
//! ```rust
//! use std::path::Path;
//! use appliance_provision::context::ProvisioningContext;
//! use appliance_provision::plan::{self, ProvisioningPlan, Step};
//! use appliance_provision::preflight::check_plan_with;
//!
//! let ctx = ProvisioningContext::for_home(Path::new("/home/pi"), "pi");
//! let plan = ProvisioningPlan::new(
//!     vec![Step::new("toolchain", plan::packages(["cmake"]))],
//!     &ctx,
//! )?;
//!
//! let report = check_plan_with(&plan, &ctx, &|tool| tool != "apt-get");
//! assert!(!report.is_ok());
//! assert_eq!(report.missing_required[0].package, "apt");
//! # Ok::<(), appliance_provision::ProvisionError>(())
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Result};

use crate::context::ProvisioningContext;
use crate::plan::{Action, BuildSystem, ProvisioningPlan, Verification};

/// Directories searched after PATH; admin tools live here and a desktop
/// user's PATH often lacks them.
const SBIN_DIRS: &[&str] = &["/usr/local/sbin", "/usr/sbin", "/sbin"];

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok() || SBIN_DIRS.iter().any(|dir| Path::new(dir).join(cmd).is_file())
}

/// One host tool a plan needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRequirement {
    pub tool: String,
    /// Package that provides the tool on Debian-family hosts.
    pub package: String,
    /// Missing optional tools degrade a step to a warning instead of failing it.
    pub optional: bool,
    /// First step that needs the tool.
    pub needed_by: String,
}

#[derive(Debug, Default)]
pub struct PreflightReport {
    pub missing_required: Vec<ToolRequirement>,
    pub missing_optional: Vec<ToolRequirement>,
}

impl PreflightReport {
    pub fn is_ok(&self) -> bool {
        self.missing_required.is_empty()
    }

    /// `Err` listing the required tools and their packages when any are missing.
    pub fn into_result(self) -> Result<()> {
        for req in &self.missing_optional {
            log::warn!(
                "Optional tool {} not found (install: {}); '{}' will warn instead",
                req.tool,
                req.package,
                req.needed_by
            );
        }
        if self.missing_required.is_empty() {
            return Ok(());
        }
        let msg = self
            .missing_required
            .iter()
            .map(|r| format!("  {} (install: {}, needed by '{}')", r.tool, r.package, r.needed_by))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }
}

/// Tools needed by `plan` under `ctx`, deduplicated, in first-use order.
pub fn requirements(plan: &ProvisioningPlan, ctx: &ProvisioningContext) -> Vec<ToolRequirement> {
    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    let mut out: Vec<ToolRequirement> = Vec::new();
    let mut need = |tool: &str, package: &str, optional: bool, step: &str| {
        match seen.get(tool) {
            // a later required use upgrades an earlier optional one
            Some(&idx) => {
                if !optional && out[idx].optional {
                    out[idx].optional = false;
                    out[idx].needed_by = step.to_string();
                }
            }
            None => {
                seen.insert(tool.to_string(), out.len());
                out.push(ToolRequirement {
                    tool: tool.to_string(),
                    package: package.to_string(),
                    optional,
                    needed_by: step.to_string(),
                });
            }
        }
    };

    for step in plan.steps() {
        let name = step.name.as_str();
        let privileged = match &step.action {
            Action::PackageInstall(_) => {
                need("apt-get", "apt", false, name);
                need("dpkg-query", "dpkg", false, name);
                true
            }
            Action::SourceBuild(spec) => {
                match &spec.build {
                    BuildSystem::CMake { .. } => {
                        need("cmake", "cmake", false, name);
                        need("make", "make", false, name);
                    }
                    BuildSystem::Make { .. } => need("make", "make", false, name),
                    BuildSystem::Autotools { .. } => {
                        need("sh", "dash", false, name);
                        need("make", "make", false, name);
                    }
                    BuildSystem::Custom { .. } => need("sh", "dash", false, name),
                }
                need("ldconfig", "libc-bin", true, name);
                need("chattr", "e2fsprogs", true, name);
                true
            }
            Action::StateReset(_) => {
                need("chattr", "e2fsprogs", true, name);
                false
            }
            Action::LauncherWrite(_) => {
                need("gio", "libglib2.0-bin", true, name);
                if let Some(program) = ctx.desktop_refresh.first() {
                    need(program.as_str(), program.as_str(), true, name);
                }
                false
            }
            Action::ServiceInstall(_) => {
                need("systemctl", "systemd", false, name);
                need("loginctl", "systemd", true, name);
                false
            }
            Action::ArtifactFetch(_) => false,
        };
        if privileged {
            if let Some(escalate) = ctx.escalation() {
                need(escalate, escalate, false, name);
            }
        }
        match &step.verify {
            Some(Verification::Package(_)) => need("dpkg-query", "dpkg", false, name),
            Some(Verification::PythonModule(_)) => need("python3", "python3", false, name),
            Some(Verification::Library(_)) => need("ldconfig", "libc-bin", false, name),
            Some(Verification::Service(_)) => need("systemctl", "systemd", false, name),
            Some(Verification::Command(_)) | Some(Verification::Path(_)) | None => {}
        }
    }
    out
}

/// Check the plan's tools with `exists`.
pub fn check_plan_with(
    plan: &ProvisioningPlan,
    ctx: &ProvisioningContext,
    exists: &dyn Fn(&str) -> bool,
) -> PreflightReport {
    let mut report = PreflightReport::default();
    for req in requirements(plan, ctx) {
        if exists(&req.tool) {
            continue;
        }
        if req.optional {
            report.missing_optional.push(req);
        } else {
            report.missing_required.push(req);
        }
    }
    report
}

/// Check the plan's tools against the host's search path.
pub fn check_plan(plan: &ProvisioningPlan, ctx: &ProvisioningContext) -> PreflightReport {
    check_plan_with(plan, ctx, &command_exists)
}
