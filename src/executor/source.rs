//! SourceBuilder: clean clone, configure, parallel compile, system install.
//!
//! Every build starts from an empty destination. A tree left behind by a
//! crashed run is removed first, never reused.

use git2::build::RepoBuilder;
use git2::{FetchOptions, RemoteCallbacks};
use std::fs;
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use super::{files, reset, Applied, Host};
use crate::error::{ProvisionError, Result, BUILD_TAIL_LINES};
use crate::observer;
use crate::plan::{BuildSystem, SourceBuildSpec, Verification};
use crate::process::Cmd;

/// Fetches a repository into an empty destination.
pub trait RepoCloner {
    fn clone_repo(
        &self,
        url: &str,
        dest: &Path,
        branch: Option<&str>,
        timeout: Duration,
    ) -> Result<()>;
}

/// Clones with libgit2, shallow first.
///
/// The clone runs on a worker thread so a remote that stops answering
/// cannot hold the plan past the deadline. An abandoned worker only ever
/// writes inside the destination, which the next build removes.
#[derive(Debug, Default, Clone, Copy)]
pub struct GitCloner;

impl RepoCloner for GitCloner {
    fn clone_repo(
        &self,
        url: &str,
        dest: &Path,
        branch: Option<&str>,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let (tx, rx) = mpsc::channel();
        let (owned_url, owned_dest) = (url.to_string(), dest.to_path_buf());
        let owned_branch = branch.map(str::to_string);
        thread::Builder::new()
            .name("git-clone".into())
            .spawn(move || {
                let result = clone_until(&owned_url, &owned_dest, owned_branch.as_deref(), deadline, timeout);
                // The receiver is gone once the deadline has passed.
                let _ = tx.send(result);
            })
            .map_err(|e| ProvisionError::io(format!("starting clone of {}", url), e))?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("Clone of {} still running after {}s, abandoning it", url, timeout.as_secs());
                Err(ProvisionError::FetchFailed {
                    resource: url.to_string(),
                    reason: format!("timeout after {}s", timeout.as_secs()),
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(ProvisionError::FetchFailed {
                resource: url.to_string(),
                reason: "clone worker exited without a result".to_string(),
            }),
        }
    }
}

fn clone_until(
    url: &str,
    dest: &Path,
    branch: Option<&str>,
    deadline: Instant,
    timeout: Duration,
) -> Result<()> {
    let fetch_failed = |e: git2::Error| ProvisionError::FetchFailed {
        resource: url.to_string(),
        reason: if Instant::now() >= deadline {
            format!("timeout after {}s", timeout.as_secs())
        } else {
            e.message().to_string()
        },
    };

    match clone_with(url, dest, branch, deadline, Some(1)) {
        Ok(()) => Ok(()),
        Err(e) if Instant::now() >= deadline => Err(fetch_failed(e)),
        Err(e) => {
            // Some transports (local paths, dumb HTTP) refuse shallow fetches.
            log::debug!("shallow clone of {} failed ({}), retrying in full", url, e.message());
            if dest.exists() {
                fs::remove_dir_all(dest)
                    .map_err(|e| ProvisionError::io(format!("removing partial clone {}", dest.display()), e))?;
            }
            clone_with(url, dest, branch, deadline, None).map_err(fetch_failed)
        }
    }
}

fn clone_with(
    url: &str,
    dest: &Path,
    branch: Option<&str>,
    deadline: Instant,
    depth: Option<i32>,
) -> std::result::Result<(), git2::Error> {
    let mut callbacks = RemoteCallbacks::new();
    // Returning false aborts the transfer.
    callbacks.transfer_progress(move |_| Instant::now() < deadline);

    let mut fetch = FetchOptions::new();
    fetch.remote_callbacks(callbacks);
    if let Some(depth) = depth {
        fetch.depth(depth);
    }

    let mut builder = RepoBuilder::new();
    builder.fetch_options(fetch);
    if let Some(branch) = branch {
        builder.branch(branch);
    }
    builder.clone(url, dest).map(|_| ())
}

/// Build and install one source repository.
pub fn build(
    host: &Host<'_>,
    spec: &SourceBuildSpec,
    verify: Option<&Verification>,
) -> Result<Applied> {
    reset::check_removal_scope(host.ctx, &spec.dest, spec.allow_outside_home)?;
    if spec.skip_when_verified {
        if let Some(verification) = verify {
            if observer::confirm(host.observer, verification).is_ok() {
                return Ok(Applied::skipped(format!(
                    "{} already satisfied",
                    verification
                )));
            }
        }
    }
    if !host.ctx.can_escalate() {
        return Err(ProvisionError::PermissionDenied {
            resource: spec.repo.clone(),
            reason: "system-wide install needs root and no escalation command is configured"
                .to_string(),
        });
    }

    if reset::remove_tree(host, &spec.dest)? {
        log::info!("Removed previous tree at {}", spec.dest.display());
    }
    files::ensure_parent(&spec.dest)
        .map_err(|e| ProvisionError::io(format!("creating parent of {}", spec.dest.display()), e))?;

    log::info!("Cloning {}", spec.repo);
    host.cloner.clone_repo(
        &spec.repo,
        &spec.dest,
        spec.branch.as_deref(),
        host.ctx.clone_timeout,
    )?;

    let root = spec.build_root();
    if !root.is_dir() {
        return Err(ProvisionError::build_failed(
            &spec.repo,
            "configure",
            format!("build root {} does not exist in the clone", root.display()),
            None,
        ));
    }

    for (phase, cmd) in phases(&spec.build, &root, host.ctx.jobs) {
        run_phase(host, spec, phase, cmd)?;
    }

    let mut applied = Applied::done();
    let ldconfig = Cmd::new(observer::ldconfig_program()).privileged();
    match ldconfig.run(host.runner) {
        Ok(out) if out.success() => {}
        Ok(out) => applied.warn(format!("ldconfig {}: {}", out.status_text(), out.tail(3))),
        Err(e) => applied.warn(format!("could not refresh the linker cache: {}", e)),
    }

    if spec.purge_after_install {
        let size = files::tree_size(&spec.dest);
        match reset::remove_tree(host, &spec.dest) {
            Ok(_) => log::info!(
                "Purged {} ({} reclaimed)",
                spec.dest.display(),
                files::format_size(size)
            ),
            // The artifact is already installed; a leftover tree only costs space.
            Err(e) => applied.warn(format!("could not purge {}: {}", spec.dest.display(), e)),
        }
    }

    Ok(applied)
}

/// Phase name and command, in execution order.
fn phases(build: &BuildSystem, root: &Path, jobs: usize) -> Vec<(&'static str, Cmd)> {
    let jobs_arg = format!("-j{}", jobs.max(1));
    let make = |args: &[String]| Cmd::new("make").arg(jobs_arg.clone()).args(args.iter().cloned());

    let mut phases = Vec::new();
    match build {
        BuildSystem::CMake { flags } => {
            phases.push((
                "configure",
                Cmd::new("cmake")
                    .args(["-S", ".", "-B", "build"])
                    .args(flags.iter().cloned()),
            ));
            phases.push((
                "compile",
                Cmd::new("cmake").args(["--build", "build", "--parallel"]).arg(jobs.max(1).to_string()),
            ));
            phases.push(("install", Cmd::new("cmake").args(["--install", "build"]).privileged()));
        }
        BuildSystem::Make { flags } => {
            phases.push(("compile", make(flags.as_slice())));
            phases.push((
                "install",
                Cmd::new("make").args(flags.iter().cloned()).arg("install").privileged(),
            ));
        }
        BuildSystem::Autotools { flags } => {
            if !root.join("configure").exists() {
                let bootstrap = ["autogen.sh", "bootstrap"]
                    .into_iter()
                    .find(|script| root.join(script).exists())
                    .map(|script| Cmd::new("sh").arg(script))
                    .unwrap_or_else(|| Cmd::new("autoreconf").arg("-fi"));
                phases.push(("configure", bootstrap));
            }
            phases.push(("configure", Cmd::new("sh").arg("./configure").args(flags.iter().cloned())));
            phases.push(("compile", make(&[])));
            phases.push(("install", Cmd::new("make").arg("install").privileged()));
        }
        BuildSystem::Custom {
            configure,
            compile,
            install,
        } => {
            let shell = |line: &String| Cmd::new("sh").args(["-c", line.as_str()]);
            phases.extend(configure.iter().map(|l| ("configure", shell(l))));
            phases.extend(compile.iter().map(|l| ("compile", shell(l))));
            phases.extend(install.iter().map(|l| ("install", shell(l).privileged())));
        }
    }

    phases
        .into_iter()
        .map(|(phase, cmd)| (phase, cmd.current_dir(root)))
        .collect()
}

fn run_phase(host: &Host<'_>, spec: &SourceBuildSpec, phase: &str, cmd: Cmd) -> Result<()> {
    log::info!("  {}: {}", phase, cmd);
    let output = cmd.run(host.runner).map_err(|e| {
        ProvisionError::build_failed(&spec.repo, phase, format!("could not run '{}': {}", cmd.program(), e), None)
    })?;
    if output.success() {
        return Ok(());
    }

    log::error!(
        "{} failed for {}; last {} lines:\n{}",
        phase,
        spec.repo,
        BUILD_TAIL_LINES,
        output.tail(BUILD_TAIL_LINES)
    );
    Err(ProvisionError::build_failed(
        &spec.repo,
        phase,
        format!("'{}' exited with {}", cmd, output.status_text()),
        Some(&output),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Rig;
    use std::path::PathBuf;

    fn cmake_spec(rig: &Rig) -> SourceBuildSpec {
        SourceBuildSpec {
            repo: "https://github.com/rtlsdrblog/rtl-sdr-blog".into(),
            dest: rig.home().join("src/rtl-sdr-blog"),
            branch: None,
            subdir: None,
            build: BuildSystem::CMake {
                flags: vec!["-DINSTALL_UDEV_RULES=ON".into()],
            },
            purge_after_install: false,
            skip_when_verified: false,
            allow_outside_home: false,
        }
    }

    #[test]
    fn test_cmake_sequence() {
        let mut rig = Rig::new();
        rig.ctx.jobs = 4;
        let spec = cmake_spec(&rig);

        build(&rig.host(), &spec, None).unwrap();

        assert_eq!(
            rig.runner.lines(),
            vec![
                "cmake -S . -B build -DINSTALL_UDEV_RULES=ON".to_string(),
                "cmake --build build --parallel 4".to_string(),
                "cmake --install build".to_string(),
                observer::ldconfig_program(),
            ]
        );
        let calls = rig.runner.calls();
        assert!(calls.iter().all(|c| c.dir() == Some(spec.dest.as_path()) || c.dir().is_none()));
        assert!(!calls[0].is_privileged());
        assert!(calls[2].is_privileged());
        assert!(calls[3].is_privileged());
        assert!(spec.dest.join("CMakeLists.txt").exists());
    }

    #[test]
    fn test_clean_rebuild_over_crashed_tree() {
        let rig = Rig::new();
        let spec = cmake_spec(&rig);
        fs::create_dir_all(spec.dest.join("build/CMakeFiles")).unwrap();
        fs::write(spec.dest.join("build/half-built.o"), "garbage").unwrap();

        build(&rig.host(), &spec, None).unwrap();

        assert!(!spec.dest.join("build/half-built.o").exists());
        assert_eq!(rig.cloner.clones().len(), 1);
        assert!(rig.runner.ran("cmake --install build"));
    }

    #[test]
    fn test_clone_failure_is_fetch_failed() {
        let rig = Rig::new();
        let spec = cmake_spec(&rig);
        rig.cloner.fail(&spec.repo, "could not resolve host");

        let err = build(&rig.host(), &spec, None).unwrap_err();

        assert!(matches!(err, ProvisionError::FetchFailed { .. }));
        assert!(rig.runner.calls().is_empty());
    }

    #[test]
    fn test_compile_failure_carries_tail_and_stops() {
        let rig = Rig::new();
        let spec = cmake_spec(&rig);
        rig.runner.fail(
            "cmake --build",
            2,
            "rtl_tcp.c:42:10: fatal error: libusb.h: No such file or directory\n",
        );

        let err = build(&rig.host(), &spec, None).unwrap_err();

        match &err {
            ProvisionError::BuildFailed { phase, tail, .. } => {
                assert_eq!(phase, "compile");
                assert!(tail.contains("libusb.h"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!rig.runner.ran("cmake --install"));
    }

    #[test]
    fn test_missing_tool_is_build_failed() {
        let rig = Rig::new();
        let spec = cmake_spec(&rig);
        rig.runner.missing("cmake");

        let err = build(&rig.host(), &spec, None).unwrap_err();
        assert!(matches!(err, ProvisionError::BuildFailed { ref phase, .. } if phase == "configure"));
    }

    #[test]
    fn test_refuses_to_wipe_home() {
        let rig = Rig::new();
        let mut spec = cmake_spec(&rig);
        spec.dest = rig.home().to_path_buf();
        let precious = rig.home().join("Documents/thesis.txt");
        fs::create_dir_all(precious.parent().unwrap()).unwrap();
        fs::write(&precious, "chapter one").unwrap();

        let err = build(&rig.host(), &spec, None).unwrap_err();

        assert!(matches!(err, ProvisionError::PermissionDenied { .. }));
        assert!(precious.exists());
        assert!(rig.cloner.clones().is_empty());
        assert!(rig.runner.calls().is_empty());
    }

    #[test]
    fn test_purge_after_install() {
        let rig = Rig::new();
        let mut spec = cmake_spec(&rig);
        spec.purge_after_install = true;

        build(&rig.host(), &spec, None).unwrap();

        assert!(!spec.dest.exists());
    }

    #[test]
    fn test_ldconfig_failure_is_warning() {
        let rig = Rig::new();
        let spec = cmake_spec(&rig);
        rig.runner.fail(&observer::ldconfig_program(), 1, "ldconfig: cannot open cache");

        let applied = build(&rig.host(), &spec, None).unwrap();
        assert_eq!(applied.warnings.len(), 1);
    }

    #[test]
    fn test_always_rebuilds_by_default() {
        let rig = Rig::new();
        rig.observer.add_library("librtlsdr.so");
        let spec = cmake_spec(&rig);
        let verify = Verification::Library("librtlsdr.so".into());

        let applied = build(&rig.host(), &spec, Some(&verify)).unwrap();

        assert!(applied.skipped.is_none());
        assert_eq!(rig.cloner.clones().len(), 1);
    }

    #[test]
    fn test_skip_when_verified() {
        let rig = Rig::new();
        rig.observer.add_library("librtlsdr.so");
        let mut spec = cmake_spec(&rig);
        spec.skip_when_verified = true;
        let verify = Verification::Library("librtlsdr.so".into());

        let applied = build(&rig.host(), &spec, Some(&verify)).unwrap();

        assert!(applied.skipped.is_some());
        assert!(rig.cloner.clones().is_empty());
        assert!(rig.runner.calls().is_empty());
    }

    #[test]
    fn test_subdir_build_root() {
        let rig = Rig::new();
        let mut spec = cmake_spec(&rig);
        spec.subdir = Some(PathBuf::from("missing"));

        let err = build(&rig.host(), &spec, None).unwrap_err();
        assert!(err.to_string().contains("does not exist in the clone"));
    }

    #[test]
    fn test_make_and_custom_phases() {
        let root = Path::new("/src/x");
        let make = phases(&BuildSystem::Make { flags: vec!["PREFIX=/usr".into()] }, root, 3);
        let lines: Vec<String> = make.iter().map(|(_, c)| c.to_string()).collect();
        assert_eq!(lines, vec!["make -j3 PREFIX=/usr", "make PREFIX=/usr install"]);
        assert!(make[1].1.is_privileged());

        let custom = phases(
            &BuildSystem::Custom {
                configure: vec![],
                compile: vec!["./build.sh".into()],
                install: vec!["cp out/x /usr/local/bin/".into()],
            },
            root,
            3,
        );
        assert_eq!(custom.len(), 2);
        assert_eq!(custom[0].0, "compile");
        assert_eq!(custom[1].1.to_string(), "sh -c cp out/x /usr/local/bin/");
        assert!(custom[1].1.is_privileged());
        assert!(custom.iter().all(|(_, c)| c.dir() == Some(root)));
    }

    #[test]
    fn test_git_cloner_clones_local_repository() {
        let temp = tempfile::tempdir().unwrap();
        let origin = temp.path().join("origin");
        let repo = git2::Repository::init(&origin).unwrap();
        fs::write(origin.join("CMakeLists.txt"), "project(x)\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("CMakeLists.txt")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = git2::Signature::now("test", "test@example.org").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[]).unwrap();

        let dest = temp.path().join("clone");
        GitCloner
            .clone_repo(origin.to_str().unwrap(), &dest, None, Duration::from_secs(30))
            .unwrap();

        assert!(dest.join("CMakeLists.txt").exists());
    }

    #[test]
    fn test_git_cloner_bad_url_is_fetch_failed() {
        let temp = tempfile::tempdir().unwrap();
        let dest = temp.path().join("clone");
        let missing = temp.path().join("no-such-repo");

        let err = GitCloner
            .clone_repo(missing.to_str().unwrap(), &dest, None, Duration::from_secs(30))
            .unwrap_err();

        assert!(matches!(err, ProvisionError::FetchFailed { .. }));
    }

    #[test]
    fn test_git_cloner_times_out_on_silent_remote() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let mut held = Vec::new();
            for stream in listener.incoming() {
                held.push(stream);
            }
        });
        let temp = tempfile::tempdir().unwrap();
        let dest = temp.path().join("clone");

        let started = Instant::now();
        let err = GitCloner
            .clone_repo(&format!("http://{}/repo.git", addr), &dest, None, Duration::from_secs(2))
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(10));
        match err {
            ProvisionError::FetchFailed { reason, .. } => assert_eq!(reason, "timeout after 2s"),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
