//! Provisioning context.
//!
//! Everything the executors would otherwise read from the ambient
//! environment (home directory, user identity, desktop directories) is
//! resolved once here and passed explicitly.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::plan::config::Settings;
use crate::process::{Cmd, CommandRunner};

pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_CLONE_TIMEOUT_SECS: u64 = 900;
pub const DEFAULT_ICON: &str = "applications-system";
pub const DEFAULT_ESCALATE: &str = "sudo";
const STATE_DIR_NAME: &str = "appliance-provision";

/// Paths and identities every component needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningContext {
    /// Login name of the invoking user.
    pub user: String,
    pub uid: u32,
    pub is_root: bool,
    pub home: PathBuf,
    /// Root of per-user configuration (`~/.config`).
    pub config_dir: PathBuf,
    /// Session desktop directory, where launchers become visible.
    pub desktop_dir: PathBuf,
    pub applications_dir: PathBuf,
    pub autostart_dir: PathBuf,
    /// Per-user service unit directory.
    pub user_unit_dir: PathBuf,
    pub runtime_dir: PathBuf,
    /// Run history, logs and the run lock.
    pub state_dir: PathBuf,
    escalate: Option<String>,
    /// Parallel jobs for compile phases.
    pub jobs: usize,
    pub fetch_timeout: Duration,
    pub clone_timeout: Duration,
    /// Icon name used when a launcher's icon file is missing.
    pub default_icon: String,
    /// Best-effort desktop refresh command (argv).
    pub desktop_refresh: Vec<String>,
}

impl ProvisioningContext {
    /// Context rooted at `home` with default settings.
    ///
    /// Does not touch the host; used as the base for [`resolve`](Self::resolve).
    pub fn for_home(home: &Path, user: &str) -> Self {
        let config_dir = home.join(".config");
        Self {
            user: user.to_string(),
            uid: 1000,
            is_root: false,
            home: home.to_path_buf(),
            desktop_dir: home.join("Desktop"),
            applications_dir: home.join(".local/share/applications"),
            autostart_dir: config_dir.join("autostart"),
            user_unit_dir: config_dir.join("systemd/user"),
            runtime_dir: PathBuf::from("/run/user/1000"),
            state_dir: home.join(".local/state").join(STATE_DIR_NAME),
            config_dir,
            escalate: Some(DEFAULT_ESCALATE.to_string()),
            jobs: 4,
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            clone_timeout: Duration::from_secs(DEFAULT_CLONE_TIMEOUT_SECS),
            default_icon: DEFAULT_ICON.to_string(),
            desktop_refresh: vec!["pcmanfm".to_string(), "--reconfigure".to_string()],
        }
    }

    /// Resolve the context for the invoking user on this host.
    pub fn resolve(settings: &Settings, runner: &dyn CommandRunner) -> Result<Self> {
        let home = dirs::home_dir().context("resolving home directory")?;
        let user = resolve_user(runner)?;
        let mut ctx = Self::for_home(&home, &user);

        // SAFETY: getuid/geteuid cannot fail and touch no memory.
        let (uid, euid) = unsafe { (libc::getuid(), libc::geteuid()) };
        ctx.uid = uid;
        ctx.is_root = euid == 0;
        ctx.runtime_dir = std::env::var_os("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("/run/user/{}", uid)));

        if let Some(config_dir) = dirs::config_dir() {
            ctx.autostart_dir = config_dir.join("autostart");
            ctx.user_unit_dir = config_dir.join("systemd/user");
            ctx.config_dir = config_dir;
        }
        if let Some(data_dir) = dirs::data_dir() {
            ctx.applications_dir = data_dir.join("applications");
        }
        if let Some(state_dir) = dirs::state_dir() {
            ctx.state_dir = state_dir.join(STATE_DIR_NAME);
        }
        ctx.desktop_dir = resolve_desktop_dir(runner, &home);
        ctx.jobs = available_jobs();

        Ok(ctx.with_settings(settings))
    }

    /// Apply plan-file settings over the resolved defaults.
    pub fn with_settings(mut self, settings: &Settings) -> Self {
        if let Some(secs) = settings.fetch_timeout_secs {
            self.fetch_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = settings.clone_timeout_secs {
            self.clone_timeout = Duration::from_secs(secs);
        }
        if let Some(jobs) = settings.jobs {
            self.jobs = jobs.max(1);
        }
        if let Some(escalate) = &settings.escalate {
            let escalate = escalate.trim();
            self.escalate = (!escalate.is_empty()).then(|| escalate.to_string());
        }
        if let Some(icon) = &settings.default_icon {
            self.default_icon = icon.clone();
        }
        if let Some(refresh) = &settings.desktop_refresh {
            self.desktop_refresh = refresh.clone();
        }
        if let Some(state_dir) = &settings.state_dir {
            self.state_dir = self.expand(state_dir);
        }
        self
    }

    /// Privilege escalation prefix, `None` when already root or disabled.
    pub fn escalation(&self) -> Option<&str> {
        if self.is_root {
            None
        } else {
            self.escalate.as_deref()
        }
    }

    /// Whether privileged commands can run at all.
    pub fn can_escalate(&self) -> bool {
        self.is_root || self.escalate.is_some()
    }

    /// Expand a leading `~` against the home directory.
    pub fn expand(&self, raw: &str) -> PathBuf {
        if raw == "~" {
            return self.home.clone();
        }
        match raw.strip_prefix("~/") {
            Some(rest) => self.home.join(rest),
            None => PathBuf::from(raw),
        }
    }

    /// Expand `~/` in a free-form argument, leaving other text untouched.
    pub fn expand_arg(&self, raw: &str) -> String {
        if raw == "~" || raw.starts_with("~/") {
            self.expand(raw).to_string_lossy().into_owned()
        } else {
            raw.to_string()
        }
    }
}

fn resolve_user(runner: &dyn CommandRunner) -> Result<String> {
    for var in ["USER", "LOGNAME"] {
        if let Ok(user) = std::env::var(var) {
            if !user.trim().is_empty() {
                return Ok(user.trim().to_string());
            }
        }
    }

    let output = Cmd::new("id")
        .arg("-un")
        .run(runner)
        .context("running 'id -un' to resolve the user name")?;
    let user = output.stdout.trim();
    if !output.success() || user.is_empty() {
        bail!("could not determine the invoking user name");
    }
    Ok(user.to_string())
}

/// Ask the session for its desktop directory, falling back to `~/Desktop`.
fn resolve_desktop_dir(runner: &dyn CommandRunner, home: &Path) -> PathBuf {
    if let Ok(output) = Cmd::new("xdg-user-dir").arg("DESKTOP").run(runner) {
        let reported = output.stdout.trim();
        // xdg-user-dir answers $HOME when the directory is unset
        if output.success() && !reported.is_empty() && Path::new(reported) != home {
            return PathBuf::from(reported);
        }
    }
    dirs::desktop_dir().unwrap_or_else(|| home.join("Desktop"))
}

fn available_jobs() -> usize {
    match std::thread::available_parallelism() {
        Ok(n) => n.get(),
        Err(e) => {
            log::warn!("could not detect CPU count ({}), using 4 jobs", e);
            4
        }
    }
}
