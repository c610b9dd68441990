//! ServiceManager: per-user systemd units.
//!
//! The contract ends once the unit is accepted and started; the unit's own
//! restart policy owns the process from then on.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use super::files::{self, fs_error};
use super::{Applied, Host};
use crate::context::ProvisioningContext;
use crate::error::{ProvisionError, Result};
use crate::plan::ServiceDescriptor;
use crate::process::Cmd;

const LINGER_DIR: &str = "/var/lib/systemd/linger";

pub fn unit_file_name(descriptor: &ServiceDescriptor) -> String {
    if descriptor.unit.ends_with(".service") {
        descriptor.unit.clone()
    } else {
        format!("{}.service", descriptor.unit)
    }
}

pub fn unit_path(ctx: &ProvisioningContext, descriptor: &ServiceDescriptor) -> PathBuf {
    ctx.user_unit_dir.join(unit_file_name(descriptor))
}

pub fn render_unit(descriptor: &ServiceDescriptor) -> String {
    let mut out = String::from("[Unit]\n");
    let _ = writeln!(out, "Description={}", descriptor.description.replace('\n', " "));
    out.push_str("\n[Service]\nType=simple\n");
    if let Some(dir) = &descriptor.working_dir {
        let _ = writeln!(out, "WorkingDirectory={}", quote_unit_arg(&dir.to_string_lossy()));
    }
    for (key, value) in &descriptor.environment {
        let _ = writeln!(out, "Environment={}", quote_unit_arg(&format!("{}={}", key, value)));
    }
    let exec = descriptor.exec.to_string_lossy();
    let command: Vec<String> = std::iter::once(exec.as_ref())
        .chain(descriptor.args.iter().map(String::as_str))
        .map(quote_unit_arg)
        .collect();
    let _ = writeln!(out, "ExecStart={}", command.join(" "));
    let _ = writeln!(out, "Restart={}", descriptor.restart);
    let _ = writeln!(out, "RestartSec={}", descriptor.restart_sec);
    out.push_str("\n[Install]\nWantedBy=default.target\n");
    out
}

/// Escape systemd specifiers and variable expansion, quoting when needed.
fn quote_unit_arg(arg: &str) -> String {
    let escaped = arg.replace('%', "%%").replace('$', "$$");
    if !escaped.is_empty() && !escaped.contains([' ', '\t', '"', '\'', '\\', ';']) {
        return escaped;
    }
    let mut quoted = String::with_capacity(escaped.len() + 2);
    quoted.push('"');
    for c in escaped.chars() {
        if matches!(c, '"' | '\\') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Write, reload, enable and (re)start the unit, then grant linger.
pub fn install(host: &Host<'_>, descriptor: &ServiceDescriptor) -> Result<Applied> {
    let mut applied = Applied::done();
    let path = unit_path(host.ctx, descriptor);
    let unit = unit_file_name(descriptor);

    files::write_file_mode(&path, &render_unit(descriptor), 0o644)
        .map_err(|e| fs_error(&path, "writing unit", e))?;
    log::info!("Wrote {}", path.display());

    systemctl(host, &unit, &["daemon-reload"])?;
    systemctl(host, &unit, &["enable", &unit])?;
    // restart, not start: a rerun must replace a process running the old definition
    systemctl(host, &unit, &["restart", &unit])?;

    if let Some(warning) = enable_linger(host) {
        applied.warn(warning);
    }
    if !host.observer.service_active(&unit) {
        applied.warn(format!(
            "{} was started but is not active; check 'journalctl --user -u {}'",
            unit, unit
        ));
    }
    Ok(applied)
}

fn systemctl(host: &Host<'_>, unit: &str, args: &[&str]) -> Result<()> {
    let cmd = Cmd::new("systemctl")
        .arg("--user")
        .args(args.iter().copied())
        .env("XDG_RUNTIME_DIR", host.ctx.runtime_dir.to_string_lossy());
    let output = cmd.run(host.runner).map_err(|e| ProvisionError::StateConflict {
        resource: format!("user service {}", unit),
        reason: format!("could not run '{}': {}", cmd, e),
    })?;
    if output.success() {
        return Ok(());
    }
    Err(ProvisionError::StateConflict {
        resource: format!("user service {}", unit),
        reason: format!("'{}' {}: {}", cmd, output.status_text(), output.tail(5)),
    })
}

/// Let the user's services run without an open session. Returns a warning
/// when boot-time persistence could not be granted.
fn enable_linger(host: &Host<'_>) -> Option<String> {
    let marker = Path::new(LINGER_DIR).join(&host.ctx.user);
    if host.observer.path_exists(&marker) {
        log::debug!("linger already enabled for {}", host.ctx.user);
        return None;
    }
    let cmd = Cmd::new("loginctl")
        .args(["enable-linger", host.ctx.user.as_str()])
        .privileged();
    match cmd.run(host.runner) {
        Ok(out) if out.success() => {
            log::info!("Enabled linger for {}", host.ctx.user);
            None
        }
        Ok(out) => Some(format!(
            "could not enable linger for {} ({}); user services will only start at login",
            host.ctx.user,
            out.status_text()
        )),
        Err(e) => Some(format!(
            "could not enable linger for {} ({}); user services will only start at login",
            host.ctx.user, e
        )),
    }
}
