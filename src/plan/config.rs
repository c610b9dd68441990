//! TOML plan files.
//!
//! ```toml
//! [settings]
//! fetch_timeout_secs = 120
//!
//! [[step]]
//! kind = "package-install"
//! name = "toolchain"
//! packages = ["build-essential", "cmake"]
//! verify = { command = "cmake" }
//! ```

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::{
    Action, BuildSystem, LauncherDescriptor, PackageGroup, ProvisioningPlan, RemoteArtifact,
    ResetSpec, RestartPolicy, ServiceDescriptor, SourceBuildSpec, Step, Verification,
};
use crate::context::ProvisioningContext;

/// `[settings]` table. Every key is optional; see [`ProvisioningContext`] for defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub fetch_timeout_secs: Option<u64>,
    pub clone_timeout_secs: Option<u64>,
    pub jobs: Option<usize>,
    pub escalate: Option<String>,
    pub default_icon: Option<String>,
    pub desktop_refresh: Option<Vec<String>>,
    pub state_dir: Option<String>,
}

/// A parsed plan file, not yet bound to a context.
#[derive(Debug, Clone)]
pub struct PlanDocument {
    origin: String,
    settings: Settings,
    steps: Vec<toml::Table>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PlanToml {
    #[serde(default)]
    settings: Settings,
    #[serde(default, rename = "step")]
    steps: Vec<toml::Table>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum VerifyToml {
    Command(String),
    Package(String),
    Path(String),
    PythonModule(String),
    Library(String),
    Service(String),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
enum ActionToml {
    PackageInstall(PackageInstallToml),
    SourceBuild(SourceBuildToml),
    ArtifactFetch(ArtifactFetchToml),
    StateReset(StateResetToml),
    LauncherWrite(LauncherWriteToml),
    ServiceInstall(ServiceInstallToml),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PackageInstallToml {
    packages: Vec<String>,
    #[serde(default = "default_true")]
    load_bearing: bool,
    #[serde(default)]
    refresh_index: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceBuildToml {
    repo: String,
    dest: String,
    branch: Option<String>,
    subdir: Option<String>,
    system: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    configure: Vec<String>,
    #[serde(default)]
    compile: Vec<String>,
    #[serde(default)]
    install: Vec<String>,
    #[serde(default = "default_true")]
    purge_after_install: bool,
    #[serde(default)]
    skip_when_verified: bool,
    #[serde(default)]
    allow_outside_home: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ArtifactFetchToml {
    url: String,
    dest: String,
    #[serde(default)]
    executable: bool,
    #[serde(default)]
    load_bearing: bool,
    extract_to: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StateResetToml {
    path: String,
    #[serde(default)]
    recreate: Vec<String>,
    #[serde(default)]
    allow_outside_home: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LauncherWriteToml {
    /// Display name; the step name when absent.
    title: Option<String>,
    exec: String,
    #[serde(default)]
    args: Vec<String>,
    icon: Option<String>,
    working_dir: Option<String>,
    #[serde(default)]
    categories: Vec<String>,
    comment: Option<String>,
    #[serde(default)]
    terminal: bool,
    #[serde(default)]
    autostart: bool,
    #[serde(default)]
    menu: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceInstallToml {
    unit: String,
    description: Option<String>,
    exec: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default = "default_restart")]
    restart: String,
    #[serde(default = "default_restart_sec")]
    restart_sec: u32,
    working_dir: Option<String>,
    #[serde(default)]
    environment: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_restart() -> String {
    "always".to_string()
}

fn default_restart_sec() -> u32 {
    5
}

impl PlanDocument {
    /// Parse plan text. `origin` names the source in error messages.
    pub fn parse(text: &str, origin: &str) -> Result<Self> {
        let parsed: PlanToml =
            toml::from_str(text).with_context(|| format!("parsing plan '{}'", origin))?;
        Ok(Self {
            origin: origin.to_string(),
            settings: parsed.settings,
            steps: parsed.steps,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading plan '{}'", path.display()))?;
        Self::parse(&text, &path.display().to_string())
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Bind the steps to a context, expanding `~/` paths, and validate the result.
    pub fn into_plan(self, ctx: &ProvisioningContext) -> Result<ProvisioningPlan> {
        let mut steps = Vec::with_capacity(self.steps.len());
        for (idx, table) in self.steps.into_iter().enumerate() {
            let step = parse_step(table, ctx)
                .with_context(|| format!("invalid step #{} in plan '{}'", idx + 1, self.origin))?;
            steps.push(step);
        }
        ProvisioningPlan::new(steps, ctx)
            .with_context(|| format!("validating plan '{}'", self.origin))
    }
}

fn parse_step(mut table: toml::Table, ctx: &ProvisioningContext) -> Result<Step> {
    let name = match table.remove("name") {
        Some(toml::Value::String(name)) => name,
        Some(_) => bail!("'name' must be a string"),
        None => bail!("missing 'name'"),
    };
    let critical = match table.remove("critical") {
        Some(toml::Value::Boolean(flag)) => Some(flag),
        Some(_) => bail!("step '{}': 'critical' must be a boolean", name),
        None => None,
    };
    let verify = table
        .remove("verify")
        .map(|value| value.try_into::<VerifyToml>())
        .transpose()
        .with_context(|| format!("step '{}': invalid 'verify' table", name))?;

    let action: ActionToml = toml::Value::Table(table)
        .try_into()
        .with_context(|| format!("step '{}'", name))?;
    let action = convert_action(action, &name, ctx).with_context(|| format!("step '{}'", name))?;

    let mut step = Step::new(name, action);
    if let Some(critical) = critical {
        step = step.critical(critical);
    }
    if let Some(verify) = verify {
        step = step.verify(convert_verify(verify, ctx));
    }
    Ok(step)
}

fn convert_verify(verify: VerifyToml, ctx: &ProvisioningContext) -> Verification {
    match verify {
        VerifyToml::Command(name) => Verification::Command(name),
        VerifyToml::Package(name) => Verification::Package(name),
        VerifyToml::Path(path) => Verification::Path(ctx.expand(&path)),
        VerifyToml::PythonModule(name) => Verification::PythonModule(name),
        VerifyToml::Library(name) => Verification::Library(name),
        VerifyToml::Service(name) => Verification::Service(name),
    }
}

fn convert_action(action: ActionToml, step_name: &str, ctx: &ProvisioningContext) -> Result<Action> {
    let expand_opt = |raw: Option<String>| raw.map(|r| ctx.expand(&r));
    let expand_args = |args: Vec<String>| -> Vec<String> { args.iter().map(|a| ctx.expand_arg(a)).collect() };

    let action = match action {
        ActionToml::PackageInstall(t) => Action::PackageInstall(PackageGroup {
            packages: t.packages,
            load_bearing: t.load_bearing,
            refresh_index: t.refresh_index,
        }),
        ActionToml::SourceBuild(t) => {
            let build = parse_build_system(&t)?;
            Action::SourceBuild(SourceBuildSpec {
                repo: t.repo,
                dest: ctx.expand(&t.dest),
                branch: t.branch,
                subdir: t.subdir.map(PathBuf::from),
                build,
                purge_after_install: t.purge_after_install,
                skip_when_verified: t.skip_when_verified,
                allow_outside_home: t.allow_outside_home,
            })
        }
        ActionToml::ArtifactFetch(t) => Action::ArtifactFetch(RemoteArtifact {
            url: t.url,
            dest: ctx.expand(&t.dest),
            executable: t.executable,
            load_bearing: t.load_bearing,
            extract_to: expand_opt(t.extract_to),
        }),
        ActionToml::StateReset(t) => Action::StateReset(ResetSpec {
            path: ctx.expand(&t.path),
            recreate: t.recreate.into_iter().map(PathBuf::from).collect(),
            allow_outside_home: t.allow_outside_home,
        }),
        ActionToml::LauncherWrite(t) => Action::LauncherWrite(LauncherDescriptor {
            name: t.title.unwrap_or_else(|| step_name.to_string()),
            exec: ctx.expand(&t.exec),
            args: expand_args(t.args),
            icon: expand_opt(t.icon),
            working_dir: expand_opt(t.working_dir),
            categories: t.categories,
            comment: t.comment,
            terminal: t.terminal,
            autostart: t.autostart,
            menu: t.menu,
        }),
        ActionToml::ServiceInstall(t) => {
            let restart = match t.restart.trim().to_ascii_lowercase().as_str() {
                "always" => RestartPolicy::Always,
                "on-failure" => RestartPolicy::OnFailure,
                other => bail!(
                    "unsupported restart policy '{}' (expected 'always' or 'on-failure')",
                    other
                ),
            };
            Action::ServiceInstall(ServiceDescriptor {
                description: t.description.unwrap_or_else(|| t.unit.clone()),
                unit: t.unit,
                exec: ctx.expand(&t.exec),
                args: expand_args(t.args),
                restart,
                restart_sec: t.restart_sec,
                working_dir: expand_opt(t.working_dir),
                environment: t.environment,
            })
        }
    };
    Ok(action)
}

fn parse_build_system(t: &SourceBuildToml) -> Result<BuildSystem> {
    let has_commands = !(t.configure.is_empty() && t.compile.is_empty() && t.install.is_empty());
    let system = t.system.trim().to_ascii_lowercase();
    if has_commands && system != "custom" {
        bail!("configure/compile/install command lists are only valid with system = \"custom\"");
    }
    match system.as_str() {
        "cmake" => Ok(BuildSystem::CMake {
            flags: t.flags.clone(),
        }),
        "make" => Ok(BuildSystem::Make {
            flags: t.flags.clone(),
        }),
        "autotools" => Ok(BuildSystem::Autotools {
            flags: t.flags.clone(),
        }),
        "custom" => {
            if !t.flags.is_empty() {
                bail!("'flags' is not used by system = \"custom\"; put them in the command lists");
            }
            if t.install.is_empty() {
                return Err(anyhow!("system = \"custom\" needs at least one 'install' command"));
            }
            Ok(BuildSystem::Custom {
                configure: t.configure.clone(),
                compile: t.compile.clone(),
                install: t.install.clone(),
            })
        }
        other => bail!(
            "unsupported build system '{}' (expected cmake, make, autotools or custom)",
            other
        ),
    }
}
