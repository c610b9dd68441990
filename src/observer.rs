//! Read-only queries against the real system.
//!
//! Idempotency and verification decisions are made by asking the host at the
//! moment they matter; nothing here caches an answer.

use std::path::{Path, PathBuf};

use crate::error::{ProvisionError, Result};
use crate::plan::Verification;
use crate::process::{Cmd, CommandRunner};

/// Observes installed packages, binaries, libraries and services.
pub trait SystemObserver {
    fn package_installed(&self, package: &str) -> bool;
    fn command_path(&self, command: &str) -> Option<PathBuf>;
    fn path_exists(&self, path: &Path) -> bool;
    fn python_module_importable(&self, module: &str) -> bool;
    fn library_resolvable(&self, soname: &str) -> bool;
    fn service_active(&self, unit: &str) -> bool;
}

/// Observer backed by dpkg, the linker cache and the user service manager.
pub struct HostObserver<'a> {
    runner: &'a dyn CommandRunner,
    runtime_dir: PathBuf,
}

impl<'a> HostObserver<'a> {
    pub fn new(runner: &'a dyn CommandRunner, runtime_dir: &Path) -> Self {
        Self {
            runner,
            runtime_dir: runtime_dir.to_path_buf(),
        }
    }

    fn succeeds(&self, cmd: Cmd) -> Option<String> {
        match cmd.run(self.runner) {
            Ok(output) if output.success() => Some(output.stdout),
            Ok(_) => None,
            Err(e) => {
                log::debug!("'{}' could not run: {}", cmd, e);
                None
            }
        }
    }
}

impl SystemObserver for HostObserver<'_> {
    fn package_installed(&self, package: &str) -> bool {
        let cmd = Cmd::new("dpkg-query").args(["-W", "-f=${Status}", package]);
        self.succeeds(cmd)
            .map(|status| status.trim() == "install ok installed")
            .unwrap_or(false)
    }

    fn command_path(&self, command: &str) -> Option<PathBuf> {
        which::which(command).ok()
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn python_module_importable(&self, module: &str) -> bool {
        let cmd = Cmd::new("python3").args(["-c", &format!("import {}", module)]);
        self.succeeds(cmd).is_some()
    }

    fn library_resolvable(&self, soname: &str) -> bool {
        let cmd = Cmd::new(ldconfig_program()).arg("-p");
        self.succeeds(cmd)
            .map(|cache| linker_cache_lists(&cache, soname))
            .unwrap_or(false)
    }

    fn service_active(&self, unit: &str) -> bool {
        let cmd = Cmd::new("systemctl")
            .args(["--user", "is-active", unit])
            .env("XDG_RUNTIME_DIR", self.runtime_dir.to_string_lossy());
        self.succeeds(cmd)
            .map(|state| state.trim() == "active")
            .unwrap_or(false)
    }
}

/// `ldconfig` lives in sbin, which is often missing from a desktop user's PATH.
pub(crate) fn ldconfig_program() -> String {
    which::which("ldconfig")
        .ok()
        .or_else(|| {
            ["/sbin/ldconfig", "/usr/sbin/ldconfig"]
                .iter()
                .map(PathBuf::from)
                .find(|p| p.exists())
        })
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ldconfig".to_string())
}

/// True when `ldconfig -p` output lists `soname` or a versioned form of it.
fn linker_cache_lists(cache: &str, soname: &str) -> bool {
    let versioned = format!("{}.", soname);
    cache
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|name| name == soname || name.starts_with(&versioned))
}

/// Check a verification against the observer.
pub fn confirm(observer: &dyn SystemObserver, verification: &Verification) -> Result<()> {
    let (resource, holds, reason) = match verification {
        Verification::Command(name) => (
            name.clone(),
            observer.command_path(name).is_some(),
            "not found on the search path",
        ),
        Verification::Package(name) => (
            name.clone(),
            observer.package_installed(name),
            "package database reports it not installed",
        ),
        Verification::Path(path) => (
            path.display().to_string(),
            observer.path_exists(path),
            "path does not exist",
        ),
        Verification::PythonModule(name) => (
            name.clone(),
            observer.python_module_importable(name),
            "python3 cannot import it",
        ),
        Verification::Library(name) => (
            name.clone(),
            observer.library_resolvable(name),
            "not present in the dynamic linker cache",
        ),
        Verification::Service(name) => (
            name.clone(),
            observer.service_active(name),
            "user service is not active",
        ),
    };

    if holds {
        log::debug!("verified: {}", verification);
        Ok(())
    } else {
        Err(ProvisionError::VerificationFailed {
            resource,
            reason: reason.to_string(),
        })
    }
}
