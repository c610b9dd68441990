//! PackageInstaller: one apt transaction per package group.

use std::io;

use super::{Applied, Host};
use crate::error::{ProvisionError, Result};
use crate::plan::PackageGroup;
use crate::process::{Cmd, CmdOutput};

const PACKAGE_DB: &str = "package database";

/// Install a package group, then re-query load-bearing packages.
pub fn install(host: &Host<'_>, group: &PackageGroup) -> Result<Applied> {
    for package in &group.packages {
        if !valid_package_name(package) {
            return Err(ProvisionError::PackageNotFound {
                package: package.clone(),
                reason: "not a valid package name".to_string(),
            });
        }
    }
    if !host.ctx.can_escalate() {
        return Err(ProvisionError::PermissionDenied {
            resource: PACKAGE_DB.to_string(),
            reason: "not running as root and no escalation command is configured".to_string(),
        });
    }

    if group.refresh_index {
        log::info!("Refreshing package index");
        let output = apt(&["update"]).run(host.runner).map_err(spawn_error)?;
        if !output.success() {
            return Err(classify_failure(&output, &["package index".to_string()]));
        }
    }

    log::info!("Installing {}", group.packages.join(" "));
    let output = apt(&["install", "-y"])
        .args(group.packages.iter().cloned())
        .run(host.runner)
        .map_err(spawn_error)?;
    if !output.success() {
        return Err(classify_failure(&output, &group.packages));
    }

    if group.load_bearing {
        for package in &group.packages {
            if !host.observer.package_installed(package) {
                return Err(ProvisionError::VerificationFailed {
                    resource: package.clone(),
                    reason: "package manager exited 0 but the package database reports it not installed"
                        .to_string(),
                });
            }
        }
        log::debug!("Confirmed {} package(s) installed", group.packages.len());
    }

    Ok(Applied::done())
}

fn apt(args: &[&str]) -> Cmd {
    Cmd::new("apt-get")
        .args(args.iter().copied())
        .env("DEBIAN_FRONTEND", "noninteractive")
        .privileged()
}

fn spawn_error(err: io::Error) -> ProvisionError {
    if err.kind() == io::ErrorKind::PermissionDenied {
        ProvisionError::PermissionDenied {
            resource: PACKAGE_DB.to_string(),
            reason: err.to_string(),
        }
    } else {
        ProvisionError::io("running apt-get", err)
    }
}

/// Debian package names: lowercase alphanumerics plus `+ - .`, at least two
/// characters, starting with an alphanumeric. An `:arch` qualifier is allowed.
pub fn valid_package_name(name: &str) -> bool {
    let (base, arch) = match name.split_once(':') {
        Some((base, arch)) => (base, Some(arch)),
        None => (name, None),
    };
    let base_ok = base.len() >= 2
        && base
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        && base
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '-' | '.'));
    let arch_ok = arch.map_or(true, |a| {
        !a.is_empty() && a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    base_ok && arch_ok
}

/// Map apt's diagnostics onto the error taxonomy.
fn classify_failure(output: &CmdOutput, packages: &[String]) -> ProvisionError {
    let text = format!("{}\n{}", output.stdout, output.stderr);
    let reason = format!("apt-get {}: {}", output.status_text(), output.tail(5));

    for line in text.lines() {
        if let Some(package) = missing_package(line) {
            return ProvisionError::PackageNotFound {
                package,
                reason: line.trim().trim_start_matches("E: ").to_string(),
            };
        }
    }

    let lowered = text.to_ascii_lowercase();
    if lowered.contains("could not get lock")
        || lowered.contains("unable to acquire the dpkg frontend lock")
        || lowered.contains("dpkg was interrupted")
    {
        ProvisionError::StateConflict {
            resource: PACKAGE_DB.to_string(),
            reason,
        }
    } else if lowered.contains("are you root") || lowered.contains("permission denied") {
        ProvisionError::PermissionDenied {
            resource: PACKAGE_DB.to_string(),
            reason,
        }
    } else {
        // Anything else is almost always a mirror or network failure.
        ProvisionError::FetchFailed {
            resource: packages.join(" "),
            reason,
        }
    }
}

fn missing_package(line: &str) -> Option<String> {
    let line = line.trim().trim_start_matches("E: ");
    if let Some(rest) = line.strip_prefix("Unable to locate package ") {
        return Some(rest.trim().to_string());
    }
    if line.starts_with("Package '") && line.contains("has no installation candidate") {
        return line.split('\'').nth(1).map(str::to_string);
    }
    None
}
