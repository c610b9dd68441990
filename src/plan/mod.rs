//! Provisioning plan model.
//!
//! A plan describes WHAT the appliance needs, as an ordered list of steps.
//! The executor modules interpret each [`Action`]; the runner sequences them.
//!
//! # Example
//!
//! ```rust
//! use appliance_provision::plan::{self, Step, Verification};
//!
//! let steps = vec![
//!     Step::new("toolchain", plan::packages(["build-essential", "cmake"]))
//!         .verify(Verification::Command("cmake".into())),
//!     Step::new("wipe config", plan::reset("/home/pi/.config/sdrpp")),
//! ];
//! assert!(steps[0].is_critical());
//! ```

pub mod config;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::context::ProvisioningContext;
use crate::error::{ProvisionError, Result};
use crate::executor::fetch::ArchiveKind;
use crate::executor::reset;
use crate::executor::{launcher, service};

/// Independent post-condition checked after a step runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Binary resolvable on the search path.
    Command(String),
    /// Package manager reports the package installed.
    Package(String),
    /// Filesystem path exists.
    Path(PathBuf),
    /// `python3 -c "import <module>"` succeeds.
    PythonModule(String),
    /// Shared library soname known to the dynamic linker cache.
    Library(String),
    /// Per-user service unit is active.
    Service(String),
}

impl fmt::Display for Verification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verification::Command(name) => write!(f, "command '{}' on PATH", name),
            Verification::Package(name) => write!(f, "package '{}' installed", name),
            Verification::Path(path) => write!(f, "path '{}' exists", path.display()),
            Verification::PythonModule(name) => write!(f, "python module '{}' imports", name),
            Verification::Library(name) => write!(f, "library '{}' resolvable", name),
            Verification::Service(name) => write!(f, "user service '{}' active", name),
        }
    }
}

/// One logical group of system packages, installed in a single transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageGroup {
    pub packages: Vec<String>,
    /// Re-query each package after install; later steps depend on them.
    pub load_bearing: bool,
    /// Refresh the package index before installing.
    pub refresh_index: bool,
}

/// Build system driving the configure/compile/install sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildSystem {
    CMake { flags: Vec<String> },
    Make { flags: Vec<String> },
    Autotools { flags: Vec<String> },
    /// Shell command lines run with `sh -c` in the build root.
    Custom {
        configure: Vec<String>,
        compile: Vec<String>,
        install: Vec<String>,
    },
}

impl BuildSystem {
    pub fn name(&self) -> &'static str {
        match self {
            BuildSystem::CMake { .. } => "cmake",
            BuildSystem::Make { .. } => "make",
            BuildSystem::Autotools { .. } => "autotools",
            BuildSystem::Custom { .. } => "custom",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBuildSpec {
    pub repo: String,
    pub dest: PathBuf,
    pub branch: Option<String>,
    /// Build root relative to the clone, for repositories that nest their project.
    pub subdir: Option<PathBuf>,
    pub build: BuildSystem,
    pub purge_after_install: bool,
    /// Skip the whole build when the step's verification already passes.
    pub skip_when_verified: bool,
    /// Permit a working tree outside the home directory.
    pub allow_outside_home: bool,
}

impl SourceBuildSpec {
    pub fn build_root(&self) -> PathBuf {
        match &self.subdir {
            Some(sub) => self.dest.join(sub),
            None => self.dest.clone(),
        }
    }
}

/// Remote file with overwrite-always semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteArtifact {
    pub url: String,
    pub dest: PathBuf,
    pub executable: bool,
    pub load_bearing: bool,
    /// Unpack the downloaded archive into this directory.
    pub extract_to: Option<PathBuf>,
}

impl RemoteArtifact {
    /// Scripts and bundles are consumed by later steps; icons and wallpapers are not.
    pub fn is_load_bearing(&self) -> bool {
        self.load_bearing || self.executable || self.extract_to.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetSpec {
    pub path: PathBuf,
    /// Subdirectories recreated empty after the path is cleared.
    pub recreate: Vec<PathBuf>,
    pub allow_outside_home: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherDescriptor {
    pub name: String,
    pub exec: PathBuf,
    pub args: Vec<String>,
    pub icon: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub categories: Vec<String>,
    pub comment: Option<String>,
    pub terminal: bool,
    /// Also start the application at session login.
    pub autostart: bool,
    /// Also list the application in the desktop menu.
    pub menu: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Always,
    OnFailure,
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartPolicy::Always => write!(f, "always"),
            RestartPolicy::OnFailure => write!(f, "on-failure"),
        }
    }
}

/// Per-user service unit. Install scope is always the invoking user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub unit: String,
    pub description: String,
    pub exec: PathBuf,
    pub args: Vec<String>,
    pub restart: RestartPolicy,
    pub restart_sec: u32,
    pub working_dir: Option<PathBuf>,
    pub environment: BTreeMap<String, String>,
}

/// The provisioning action a step performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    PackageInstall(PackageGroup),
    SourceBuild(SourceBuildSpec),
    ArtifactFetch(RemoteArtifact),
    StateReset(ResetSpec),
    LauncherWrite(LauncherDescriptor),
    ServiceInstall(ServiceDescriptor),
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::PackageInstall(_) => "package-install",
            Action::SourceBuild(_) => "source-build",
            Action::ArtifactFetch(_) => "artifact-fetch",
            Action::StateReset(_) => "state-reset",
            Action::LauncherWrite(_) => "launcher-write",
            Action::ServiceInstall(_) => "service-install",
        }
    }

    /// Criticality when the plan does not say otherwise.
    pub fn default_critical(&self) -> bool {
        match self {
            Action::ArtifactFetch(artifact) => artifact.is_load_bearing(),
            _ => true,
        }
    }

    /// Actions whose failure is always fatal, whatever the plan says.
    fn forces_critical(&self) -> bool {
        matches!(self, Action::PackageInstall(group) if group.load_bearing)
    }

    /// Paths this action creates or overwrites.
    pub fn write_targets(&self, ctx: &ProvisioningContext) -> Vec<PathBuf> {
        match self {
            Action::SourceBuild(spec) => vec![spec.dest.clone()],
            Action::ArtifactFetch(artifact) => {
                let mut targets = vec![artifact.dest.clone()];
                targets.extend(artifact.extract_to.clone());
                targets
            }
            Action::LauncherWrite(descriptor) => launcher::launcher_targets(ctx, descriptor),
            Action::ServiceInstall(descriptor) => vec![service::unit_path(ctx, descriptor)],
            Action::PackageInstall(_) | Action::StateReset(_) => Vec::new(),
        }
    }

    /// One-line summary for logs and dry runs.
    pub fn describe(&self) -> String {
        match self {
            Action::PackageInstall(group) => format!("install {}", group.packages.join(" ")),
            Action::SourceBuild(spec) => format!(
                "clone {} into {} and build with {}",
                spec.repo,
                spec.dest.display(),
                spec.build.name()
            ),
            Action::ArtifactFetch(artifact) => {
                format!("fetch {} -> {}", artifact.url, artifact.dest.display())
            }
            Action::StateReset(spec) => format!("clear {}", spec.path.display()),
            Action::LauncherWrite(descriptor) => format!(
                "write launcher '{}' for {}",
                descriptor.name,
                descriptor.exec.display()
            ),
            Action::ServiceInstall(descriptor) => format!(
                "install user service '{}' running {}",
                descriptor.unit,
                descriptor.exec.display()
            ),
        }
    }
}

/// One provisioning action with a verifiable post-condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub name: String,
    pub action: Action,
    pub critical: bool,
    pub verify: Option<Verification>,
}

impl Step {
    pub fn new(name: impl Into<String>, action: Action) -> Self {
        let critical = action.default_critical();
        Self {
            name: name.into(),
            action,
            critical,
            verify: None,
        }
    }

    pub fn verify(mut self, verification: Verification) -> Self {
        self.verify = Some(verification);
        self
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn is_critical(&self) -> bool {
        self.critical || self.action.forces_critical()
    }
}

/// Ordered, immutable sequence of steps.
///
/// Order encodes dependencies: toolchains before source builds, source
/// builds before the launchers that reference their binaries.
#[derive(Debug, Clone)]
pub struct ProvisioningPlan {
    steps: Vec<Step>,
}

impl ProvisioningPlan {
    /// Validate and freeze a plan.
    pub fn new(steps: Vec<Step>, ctx: &ProvisioningContext) -> Result<Self> {
        validate_steps(&steps, ctx)?;
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

fn validate_steps(steps: &[Step], ctx: &ProvisioningContext) -> Result<()> {
    let mut names = HashSet::new();
    let mut launcher_files: HashMap<String, &str> = HashMap::new();
    for step in steps {
        if step.name.trim().is_empty() {
            return Err(ProvisionError::InvalidPlan(format!(
                "a {} step has an empty name",
                step.action.kind()
            )));
        }
        if !names.insert(step.name.as_str()) {
            return Err(ProvisionError::InvalidPlan(format!(
                "duplicate step name '{}'",
                step.name
            )));
        }
        validate_action(step, ctx)?;

        if let Action::LauncherWrite(descriptor) = &step.action {
            let file = launcher::launcher_file_name(&descriptor.name);
            if let Some(owner) = launcher_files.insert(file.clone(), step.name.as_str()) {
                return Err(ProvisionError::InvalidPlan(format!(
                    "launchers of steps '{}' and '{}' would both be written as {}",
                    owner, step.name, file
                )));
            }
        }
    }

    // A reset must run before anything in the same plan writes under its path
    // or around it, otherwise it would wipe what the plan just produced.
    for (reset_idx, step) in steps.iter().enumerate() {
        let Action::StateReset(spec) = &step.action else {
            continue;
        };
        for earlier in &steps[..reset_idx] {
            if let Some(target) = earlier
                .action
                .write_targets(ctx)
                .into_iter()
                .find(|t| t.starts_with(&spec.path) || spec.path.starts_with(t))
            {
                return Err(ProvisionError::InvalidPlan(format!(
                    "step '{}' resets {} after step '{}' already wrote {}",
                    step.name,
                    spec.path.display(),
                    earlier.name,
                    target.display()
                )));
            }
        }
    }

    Ok(())
}

fn validate_action(step: &Step, ctx: &ProvisioningContext) -> Result<()> {
    let invalid = |msg: String| -> Result<()> {
        Err(ProvisionError::InvalidPlan(format!(
            "step '{}': {}",
            step.name, msg
        )))
    };
    match &step.action {
        Action::PackageInstall(group) if group.packages.is_empty() => {
            invalid("package group is empty".into())
        }
        Action::SourceBuild(spec) if !spec.dest.is_absolute() => {
            invalid(format!("destination '{}' must be absolute", spec.dest.display()))
        }
        Action::SourceBuild(spec) if spec.repo.trim().is_empty() => {
            invalid("repository URL is empty".into())
        }
        // The working tree is removed forcibly before every clone.
        Action::SourceBuild(spec) => {
            match reset::check_removal_scope(ctx, &spec.dest, spec.allow_outside_home) {
                Ok(()) => Ok(()),
                Err(e) => invalid(format!("unsafe build destination: {}", e)),
            }
        }
        Action::ArtifactFetch(artifact) if !artifact.dest.is_absolute() => {
            invalid(format!("destination '{}' must be absolute", artifact.dest.display()))
        }
        Action::ArtifactFetch(artifact)
            if artifact.extract_to.is_some() && ArchiveKind::detect(&artifact.dest).is_none() =>
        {
            invalid(format!(
                "'{}' is not a .tar, .tar.gz or .tar.zst archive and cannot be extracted",
                artifact.dest.display()
            ))
        }
        Action::StateReset(spec) if !spec.path.is_absolute() => {
            invalid(format!("reset path '{}' must be absolute", spec.path.display()))
        }
        Action::LauncherWrite(descriptor) if descriptor.name.trim().is_empty() => {
            invalid("launcher name is empty".into())
        }
        Action::ServiceInstall(descriptor) if !valid_unit_name(&descriptor.unit) => {
            invalid(format!("invalid unit name '{}'", descriptor.unit))
        }
        _ => Ok(()),
    }
}

fn valid_unit_name(unit: &str) -> bool {
    let stem = unit.strip_suffix(".service").unwrap_or(unit);
    !stem.is_empty()
        && stem
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
}

// ─────────────────────────────────────────────────────────────────────────────
// Helper functions for readable plan definitions
// ─────────────────────────────────────────────────────────────────────────────

/// Install a load-bearing package group.
pub fn packages(names: impl IntoIterator<Item = impl Into<String>>) -> Action {
    Action::PackageInstall(PackageGroup {
        packages: names.into_iter().map(Into::into).collect(),
        load_bearing: true,
        refresh_index: false,
    })
}

/// Clone and build with CMake, purging the tree afterwards.
pub fn cmake_build(
    repo: impl Into<String>,
    dest: impl Into<PathBuf>,
    flags: impl IntoIterator<Item = impl Into<String>>,
) -> Action {
    Action::SourceBuild(SourceBuildSpec {
        repo: repo.into(),
        dest: dest.into(),
        branch: None,
        subdir: None,
        build: BuildSystem::CMake {
            flags: flags.into_iter().map(Into::into).collect(),
        },
        purge_after_install: true,
        skip_when_verified: false,
        allow_outside_home: false,
    })
}

/// Fetch a file that later steps depend on.
pub fn fetch(url: impl Into<String>, dest: impl Into<PathBuf>) -> Action {
    Action::ArtifactFetch(RemoteArtifact {
        url: url.into(),
        dest: dest.into(),
        executable: false,
        load_bearing: true,
        extract_to: None,
    })
}

/// Fetch a cosmetic file (icon, wallpaper); failure is a warning.
pub fn fetch_cosmetic(url: impl Into<String>, dest: impl Into<PathBuf>) -> Action {
    Action::ArtifactFetch(RemoteArtifact {
        url: url.into(),
        dest: dest.into(),
        executable: false,
        load_bearing: false,
        extract_to: None,
    })
}

/// Clear a prior-run state directory.
pub fn reset(path: impl AsRef<Path>) -> Action {
    Action::StateReset(ResetSpec {
        path: path.as_ref().to_path_buf(),
        recreate: Vec::new(),
        allow_outside_home: false,
    })
}

/// Desktop launcher with no arguments, icon or working directory.
pub fn launcher(name: impl Into<String>, exec: impl Into<PathBuf>) -> Action {
    Action::LauncherWrite(LauncherDescriptor {
        name: name.into(),
        exec: exec.into(),
        args: Vec::new(),
        icon: None,
        working_dir: None,
        categories: Vec::new(),
        comment: None,
        terminal: false,
        autostart: false,
        menu: false,
    })
}

/// User service that always restarts after a fixed backoff.
pub fn service(unit: impl Into<String>, exec: impl Into<PathBuf>) -> Action {
    let unit = unit.into();
    Action::ServiceInstall(ServiceDescriptor {
        description: unit.clone(),
        unit,
        exec: exec.into(),
        args: Vec::new(),
        restart: RestartPolicy::Always,
        restart_sec: 5,
        working_dir: None,
        environment: BTreeMap::new(),
    })
}
