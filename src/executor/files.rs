//! Filesystem helpers shared by the handlers.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use walkdir::WalkDir;

use crate::error::ProvisionError;

/// Map a filesystem error, keeping permission problems distinct.
pub fn fs_error(path: &Path, action: &str, err: io::Error) -> ProvisionError {
    if err.kind() == io::ErrorKind::PermissionDenied {
        ProvisionError::PermissionDenied {
            resource: path.display().to_string(),
            reason: format!("{}: {}", action, err),
        }
    } else {
        ProvisionError::io(format!("{} {}", action, path.display()), err)
    }
}

/// Create the parent directory of `path` if needed.
pub fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Write a file with specific permissions, replacing any previous content.
pub fn write_file_mode(path: &Path, content: &str, mode: u32) -> io::Result<()> {
    ensure_parent(path)?;
    fs::write(path, content)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

/// Add execute permission for everyone who can read the file.
pub fn make_executable(path: &Path) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    let mode = perms.mode();
    perms.set_mode(mode | ((mode & 0o444) >> 2) | 0o100);
    fs::set_permissions(path, perms)
}

/// Total size in bytes of the regular files under `root`.
///
/// Unreadable entries are skipped; this only feeds log messages.
pub fn tree_size(root: &Path) -> u64 {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

/// Human-readable byte count for log lines.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
