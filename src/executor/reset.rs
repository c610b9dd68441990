//! StateResetter: clear prior-run state under a narrowly scoped path.

use std::fs;
use std::io;
use std::path::{Component, Path};

use super::files::fs_error;
use super::{Applied, Host};
use crate::context::ProvisioningContext;
use crate::error::{ProvisionError, Result};
use crate::plan::ResetSpec;
use crate::process::Cmd;

/// Remove the reset path if present, then recreate the declared subdirectories.
pub fn reset(host: &Host<'_>, spec: &ResetSpec) -> Result<Applied> {
    check_scope(host.ctx, spec)?;
    for sub in &spec.recreate {
        if !is_plain_relative(sub) {
            return Err(ProvisionError::InvalidPlan(format!(
                "recreate entry '{}' must be a relative path inside {}",
                sub.display(),
                spec.path.display()
            )));
        }
    }

    let removed = remove_tree(host, &spec.path)?;
    if removed {
        log::info!("Cleared {}", spec.path.display());
    }

    for sub in &spec.recreate {
        let dir = spec.path.join(sub);
        fs::create_dir_all(&dir)
            .map_err(|e| fs_error(&dir, "recreating directory", e))?;
    }

    if !removed && spec.recreate.is_empty() {
        return Ok(Applied::skipped(format!(
            "{} already absent",
            spec.path.display()
        )));
    }
    Ok(Applied::done())
}

/// Refuse anything wider than a single piece of application state.
pub fn check_scope(ctx: &ProvisioningContext, spec: &ResetSpec) -> Result<()> {
    check_removal_scope(ctx, &spec.path, spec.allow_outside_home)
}

/// Scope guard for every path this crate removes recursively.
pub fn check_removal_scope(
    ctx: &ProvisioningContext,
    path: &Path,
    allow_outside_home: bool,
) -> Result<()> {
    let refuse = |reason: &str| {
        Err(ProvisionError::PermissionDenied {
            resource: path.display().to_string(),
            reason: reason.to_string(),
        })
    };

    if !path.is_absolute() || path.components().any(|c| c == Component::ParentDir) {
        return refuse("removal paths must be absolute and free of '..'");
    }
    if path.parent().is_none() {
        return refuse("refusing to clear the filesystem root");
    }
    if path == ctx.home || ctx.home.starts_with(path) {
        return refuse("refusing to clear the home directory or one of its ancestors");
    }
    if path == ctx.config_dir {
        return refuse("refusing to clear the whole configuration root; name the application directory");
    }
    if !path.starts_with(&ctx.home) && !allow_outside_home {
        return refuse("path is outside the home directory and the step does not allow that");
    }
    Ok(())
}

fn is_plain_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)))
}

/// Forcibly remove `path`, escalating when the unprivileged removal fails.
///
/// Returns whether anything was there. Immutable attributes are cleared
/// before the privileged removal.
pub fn remove_tree(host: &Host<'_>, path: &Path) -> Result<bool> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(fs_error(path, "inspecting", e)),
    };

    let attempt = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    let err = match attempt {
        Ok(()) => return Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(e) => e,
    };

    log::debug!("unprivileged removal of {} failed: {}", path.display(), err);
    if !host.ctx.can_escalate() {
        return Err(ProvisionError::PermissionDenied {
            resource: path.display().to_string(),
            reason: err.to_string(),
        });
    }

    log::warn!("Escalating to remove {}", path.display());
    // chattr fails harmlessly on filesystems without attributes
    let chattr = Cmd::new("chattr").args(["-R", "-i"]).arg_path(path).privileged();
    if let Err(e) = chattr.run(host.runner) {
        log::debug!("chattr unavailable: {}", e);
    }
    let rm = Cmd::new("rm").args(["-rf", "--"]).arg_path(path).privileged();
    let output = rm.run(host.runner).map_err(|e| ProvisionError::StateConflict {
        resource: path.display().to_string(),
        reason: format!("could not run privileged removal: {}", e),
    })?;

    if !output.success() || path.symlink_metadata().is_ok() {
        return Err(ProvisionError::StateConflict {
            resource: path.display().to_string(),
            reason: format!(
                "still present after privileged removal ({}): {}",
                output.status_text(),
                output.tail(3)
            ),
        });
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan;
    use crate::testing::Rig;
    use std::path::PathBuf;

    fn spec(path: &Path) -> ResetSpec {
        ResetSpec {
            path: path.to_path_buf(),
            recreate: Vec::new(),
            allow_outside_home: false,
        }
    }

    #[test]
    fn test_reset_removes_tree() {
        let rig = Rig::new();
        let target = rig.home().join(".config/sdrpp");
        fs::create_dir_all(target.join("modules")).unwrap();
        fs::write(target.join("config.json"), "{}").unwrap();

        let applied = reset(&rig.host(), &spec(&target)).unwrap();

        assert!(applied.skipped.is_none());
        assert!(!target.exists());
        assert!(rig.home().join(".config").exists());
    }

    #[test]
    fn test_reset_absent_path_is_success() {
        let rig = Rig::new();
        let target = rig.home().join("never-created");

        let applied = reset(&rig.host(), &spec(&target)).unwrap();

        assert!(applied.skipped.unwrap().contains("already absent"));
    }

    #[test]
    fn test_reset_recreates_structure() {
        let rig = Rig::new();
        let target = rig.home().join("dishaligner");
        fs::create_dir_all(target.join("icons")).unwrap();
        fs::write(target.join("icons/stale.png"), "x").unwrap();
        fs::write(target.join("old.py"), "x").unwrap();

        let mut s = spec(&target);
        s.recreate = vec![PathBuf::from("icons")];
        reset(&rig.host(), &s).unwrap();

        assert!(target.join("icons").is_dir());
        assert!(!target.join("icons/stale.png").exists());
        assert!(!target.join("old.py").exists());
    }

    #[test]
    fn test_reset_removes_plain_file() {
        let rig = Rig::new();
        let target = rig.home().join("stale.desktop");
        fs::write(&target, "x").unwrap();

        reset(&rig.host(), &spec(&target)).unwrap();
        assert!(!target.exists());
    }

    #[test]
    fn test_scope_guard() {
        let rig = Rig::new();
        let home = rig.home().to_path_buf();
        let refused = [
            PathBuf::from("/"),
            home.clone(),
            home.parent().unwrap().to_path_buf(),
            home.join(".config"),
            home.join("a/../.."),
            PathBuf::from("/opt/app"),
        ];
        for path in refused {
            let err = reset(&rig.host(), &spec(&path)).unwrap_err();
            assert!(
                matches!(err, ProvisionError::PermissionDenied { .. }),
                "{} should be refused",
                path.display()
            );
        }
        assert!(rig.runner.calls().is_empty());
    }

    #[test]
    fn test_outside_home_needs_opt_in() {
        let rig = Rig::new();
        let outside = rig.temp.path().join("opt/app");
        fs::create_dir_all(&outside).unwrap();

        assert!(reset(&rig.host(), &spec(&outside)).is_err());

        let mut s = spec(&outside);
        s.allow_outside_home = true;
        reset(&rig.host(), &s).unwrap();
        assert!(!outside.exists());
    }

    #[test]
    fn test_recreate_rejects_traversal() {
        let rig = Rig::new();
        let mut s = spec(&rig.home().join("app"));
        s.recreate = vec![PathBuf::from("../escape")];
        let err = reset(&rig.host(), &s).unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidPlan(_)));
    }

    #[test]
    fn test_execute_via_plan_helper() {
        let rig = Rig::new();
        let target = rig.home().join(".config/sdrpp");
        fs::create_dir_all(&target).unwrap();
        let plan::Action::StateReset(s) = plan::reset(&target) else {
            unreachable!()
        };
        reset(&rig.host(), &s).unwrap();
        assert!(!target.exists());
    }
}
