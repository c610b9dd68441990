//! LauncherGenerator: freedesktop `.desktop` entries.
//!
//! The same descriptor always renders the same bytes, so a rerun restores a
//! deleted or edited launcher exactly.

use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};

use super::files::{self, fs_error};
use super::{Applied, Host};
use crate::context::ProvisioningContext;
use crate::error::Result;
use crate::plan::LauncherDescriptor;
use crate::process::Cmd;

/// Launchers on the desktop must be executable before file managers run them.
const LAUNCHER_MODE: u32 = 0o755;

/// File name shared by every copy of a launcher.
pub fn launcher_file_name(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "launcher.desktop".to_string()
    } else {
        format!("{}.desktop", slug)
    }
}

/// Every path the descriptor is written to, desktop copy first.
pub fn launcher_targets(ctx: &ProvisioningContext, descriptor: &LauncherDescriptor) -> Vec<PathBuf> {
    let file = launcher_file_name(&descriptor.name);
    let mut targets = vec![ctx.desktop_dir.join(&file)];
    if descriptor.menu {
        targets.push(ctx.applications_dir.join(&file));
    }
    if descriptor.autostart {
        targets.push(ctx.autostart_dir.join(&file));
    }
    targets
}

/// Render the desktop entry. `icon` is what ends up in `Icon=`.
pub fn render_desktop_entry(descriptor: &LauncherDescriptor, icon: &str) -> String {
    let mut out = String::from("[Desktop Entry]\nType=Application\nVersion=1.0\n");
    let _ = writeln!(out, "Name={}", single_line(&descriptor.name));
    if let Some(comment) = &descriptor.comment {
        let _ = writeln!(out, "Comment={}", single_line(comment));
    }
    let _ = writeln!(out, "Exec={}", exec_line(&descriptor.exec, &descriptor.args));
    let _ = writeln!(out, "Icon={}", single_line(icon));
    if let Some(dir) = &descriptor.working_dir {
        let _ = writeln!(out, "Path={}", single_line(&dir.to_string_lossy()));
    }
    let _ = writeln!(out, "Terminal={}", descriptor.terminal);
    if !descriptor.categories.is_empty() {
        let _ = writeln!(out, "Categories={};", descriptor.categories.join(";"));
    }
    out
}

fn single_line(value: &str) -> String {
    value.replace(['\n', '\r'], " ")
}

/// Quote the command line per the desktop entry `Exec` rules, then escape
/// backslashes for the string value.
fn exec_line(exec: &Path, args: &[String]) -> String {
    let exec = exec.to_string_lossy();
    std::iter::once(exec.as_ref())
        .chain(args.iter().map(String::as_str))
        .map(quote_exec_arg)
        .collect::<Vec<_>>()
        .join(" ")
        .replace('\\', "\\\\")
}

fn quote_exec_arg(arg: &str) -> String {
    const RESERVED: &[char] = &[
        ' ', '\t', '\n', '"', '\'', '\\', '>', '<', '~', '|', '&', ';', '$', '*', '?', '#', '(',
        ')', '`',
    ];
    let arg = arg.replace('%', "%%");
    if !arg.is_empty() && !arg.contains(RESERVED) {
        return arg;
    }
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if matches!(c, '"' | '`' | '$' | '\\') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Write every copy of the launcher and mark the desktop copy trusted.
pub fn write(host: &Host<'_>, descriptor: &LauncherDescriptor) -> Result<Applied> {
    let mut applied = Applied::done();

    let icon = match &descriptor.icon {
        Some(path) if host.observer.path_exists(path) => path.to_string_lossy().into_owned(),
        Some(path) => {
            applied.warn(format!(
                "icon {} is missing; launcher '{}' uses '{}'",
                path.display(),
                descriptor.name,
                host.ctx.default_icon
            ));
            host.ctx.default_icon.clone()
        }
        None => host.ctx.default_icon.clone(),
    };
    if descriptor.exec.is_absolute() && !host.observer.path_exists(&descriptor.exec) {
        applied.warn(format!(
            "launcher '{}' points at {}, which does not exist",
            descriptor.name,
            descriptor.exec.display()
        ));
    }

    let entry = render_desktop_entry(descriptor, &icon);
    let targets = launcher_targets(host.ctx, descriptor);
    for target in &targets {
        files::write_file_mode(target, &entry, LAUNCHER_MODE)
            .map_err(|e| fs_error(target, "writing launcher", e))?;
        log::info!("Wrote {}", target.display());
    }

    if let Some(warning) = mark_trusted(host, &targets[0]) {
        applied.warn(warning);
    }
    Ok(applied)
}

/// Mark a desktop file trusted so the file manager launches it without a prompt.
fn mark_trusted(host: &Host<'_>, path: &Path) -> Option<String> {
    let cmd = Cmd::new("gio")
        .arg("set")
        .arg_path(path)
        .args(["metadata::trusted", "true"]);
    match cmd.run(host.runner) {
        Ok(out) if out.success() => None,
        Ok(out) => Some(format!(
            "could not mark {} trusted ({}): {}",
            path.display(),
            out.status_text(),
            out.tail(2)
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Some(format!(
            "desktop has no trust marking (gio not installed); {} left untrusted",
            path.display()
        )),
        Err(e) => Some(format!("could not mark {} trusted: {}", path.display(), e)),
    }
}

/// Ask the desktop to pick up new launchers. Returns a warning on failure.
pub fn refresh_desktop(host: &Host<'_>) -> Option<String> {
    let (program, args) = host.ctx.desktop_refresh.split_first()?;
    let cmd = Cmd::new(program.as_str()).args(args.iter().cloned());
    match cmd.run(host.runner) {
        Ok(out) if out.success() => {
            log::debug!("desktop refreshed via '{}'", cmd);
            None
        }
        Ok(out) => Some(format!(
            "desktop refresh '{}' failed ({}); log out and back in to see new launchers",
            cmd,
            out.status_text()
        )),
        Err(e) => Some(format!(
            "desktop refresh '{}' unavailable ({}); log out and back in to see new launchers",
            cmd, e
        )),
    }
}
