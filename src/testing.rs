//! Scripted stand-ins for the host seams, shared by the unit tests.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::context::ProvisioningContext;
use crate::error::{ProvisionError, Result};
use crate::executor::fetch::Downloader;
use crate::executor::source::RepoCloner;
use crate::executor::Host;
use crate::observer::SystemObserver;
use crate::process::{Cmd, CmdOutput, CommandRunner};

type Responder = Box<dyn Fn(&Cmd) -> io::Result<CmdOutput>>;

/// Records every command and answers from a script keyed by command-line prefix.
///
/// Unscripted commands succeed with empty output.
#[derive(Default)]
pub struct FakeRunner {
    calls: RefCell<Vec<Cmd>>,
    script: RefCell<Vec<(String, Responder)>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands whose display form starts with `prefix`.
    pub fn respond(&self, prefix: &str, output: CmdOutput) {
        self.respond_with(prefix, move |_| Ok(output.clone()));
    }

    pub fn respond_with(&self, prefix: &str, f: impl Fn(&Cmd) -> io::Result<CmdOutput> + 'static) {
        self.script.borrow_mut().push((prefix.to_string(), Box::new(f)));
    }

    /// Make `prefix` fail with the given exit code and stderr.
    pub fn fail(&self, prefix: &str, code: i32, stderr: &str) {
        self.respond(
            prefix,
            CmdOutput {
                status: Some(code),
                stdout: String::new(),
                stderr: stderr.to_string(),
            },
        );
    }

    /// Make `program` unspawnable, as if it were not installed.
    pub fn missing(&self, program: &str) {
        let program = program.to_string();
        self.respond_with(&program.clone(), move |_| {
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}: not found", program),
            ))
        });
    }

    pub fn calls(&self) -> Vec<Cmd> {
        self.calls.borrow().clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|c| c.to_string()).collect()
    }

    pub fn ran(&self, prefix: &str) -> bool {
        self.count(prefix) > 0
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.lines().iter().filter(|l| l.starts_with(prefix)).count()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, cmd: &Cmd) -> io::Result<CmdOutput> {
        self.calls.borrow_mut().push(cmd.clone());
        let line = cmd.to_string();
        let script = self.script.borrow();
        // Latest matching entry wins so tests can override earlier answers.
        match script.iter().rev().find(|(prefix, _)| line.starts_with(prefix.as_str())) {
            Some((_, responder)) => responder(cmd),
            None => Ok(CmdOutput {
                status: Some(0),
                ..CmdOutput::default()
            }),
        }
    }
}

/// Observer with controlled answers. Paths also count when they exist on disk.
#[derive(Default)]
pub struct FakeObserver {
    packages: RefCell<HashSet<String>>,
    commands: RefCell<HashMap<String, PathBuf>>,
    paths: RefCell<HashSet<PathBuf>>,
    modules: RefCell<HashSet<String>>,
    libraries: RefCell<HashSet<String>>,
    services: RefCell<HashSet<String>>,
}

impl FakeObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_package(&self, name: &str) {
        self.packages.borrow_mut().insert(name.to_string());
    }

    pub fn remove_package(&self, name: &str) {
        self.packages.borrow_mut().remove(name);
    }

    pub fn add_command(&self, name: &str, path: &str) {
        self.commands
            .borrow_mut()
            .insert(name.to_string(), PathBuf::from(path));
    }

    pub fn add_path(&self, path: &Path) {
        self.paths.borrow_mut().insert(path.to_path_buf());
    }

    pub fn add_module(&self, name: &str) {
        self.modules.borrow_mut().insert(name.to_string());
    }

    pub fn add_library(&self, name: &str) {
        self.libraries.borrow_mut().insert(name.to_string());
    }

    pub fn add_service(&self, name: &str) {
        self.services.borrow_mut().insert(name.to_string());
    }
}

impl SystemObserver for FakeObserver {
    fn package_installed(&self, package: &str) -> bool {
        self.packages.borrow().contains(package)
    }

    fn command_path(&self, command: &str) -> Option<PathBuf> {
        self.commands.borrow().get(command).cloned()
    }

    fn path_exists(&self, path: &Path) -> bool {
        self.paths.borrow().contains(path) || path.exists()
    }

    fn python_module_importable(&self, module: &str) -> bool {
        self.modules.borrow().contains(module)
    }

    fn library_resolvable(&self, soname: &str) -> bool {
        self.libraries.borrow().contains(soname)
    }

    fn service_active(&self, unit: &str) -> bool {
        self.services.borrow().contains(unit)
    }
}

/// Serves fixed bodies by URL; unknown URLs fail like a 404.
#[derive(Default)]
pub struct FakeDownloader {
    bodies: RefCell<HashMap<String, Vec<u8>>>,
    requests: RefCell<Vec<String>>,
}

impl FakeDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: &str, body: impl Into<Vec<u8>>) {
        self.bodies.borrow_mut().insert(url.to_string(), body.into());
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.borrow().clone()
    }
}

impl Downloader for FakeDownloader {
    fn download(&self, url: &str, sink: &mut dyn Write, _timeout: Duration) -> Result<u64> {
        self.requests.borrow_mut().push(url.to_string());
        let bodies = self.bodies.borrow();
        let body = bodies.get(url).ok_or_else(|| ProvisionError::FetchFailed {
            resource: url.to_string(),
            reason: "HTTP status 404 Not Found".to_string(),
        })?;
        sink.write_all(body)
            .map_err(|e| ProvisionError::io(format!("writing download of {}", url), e))?;
        Ok(body.len() as u64)
    }
}

/// "Clones" by creating the destination with a marker file.
///
/// Refuses a non-empty destination, as a real clone does.
#[derive(Default)]
pub struct FakeCloner {
    failures: RefCell<HashMap<String, String>>,
    clones: RefCell<Vec<(String, PathBuf)>>,
}

impl FakeCloner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, url: &str, reason: &str) {
        self.failures
            .borrow_mut()
            .insert(url.to_string(), reason.to_string());
    }

    pub fn clones(&self) -> Vec<(String, PathBuf)> {
        self.clones.borrow().clone()
    }
}

impl RepoCloner for FakeCloner {
    fn clone_repo(
        &self,
        url: &str,
        dest: &Path,
        _branch: Option<&str>,
        _timeout: Duration,
    ) -> Result<()> {
        if let Some(reason) = self.failures.borrow().get(url) {
            return Err(ProvisionError::FetchFailed {
                resource: url.to_string(),
                reason: reason.clone(),
            });
        }
        let occupied = fs::read_dir(dest)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        if occupied {
            return Err(ProvisionError::StateConflict {
                resource: dest.display().to_string(),
                reason: "destination exists and is not an empty directory".to_string(),
            });
        }
        fs::create_dir_all(dest).map_err(|e| ProvisionError::io("creating clone", e))?;
        fs::write(dest.join("CMakeLists.txt"), format!("# {}\n", url))
            .map_err(|e| ProvisionError::io("writing clone marker", e))?;
        self.clones
            .borrow_mut()
            .push((url.to_string(), dest.to_path_buf()));
        Ok(())
    }
}

/// Owns one of each fake plus a context rooted in a temp home.
pub struct Rig {
    pub temp: tempfile::TempDir,
    pub ctx: ProvisioningContext,
    pub runner: FakeRunner,
    pub observer: FakeObserver,
    pub downloader: FakeDownloader,
    pub cloner: FakeCloner,
}

impl Rig {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let home = temp.path().join("home/pi");
        fs::create_dir_all(&home).unwrap();
        let ctx = ProvisioningContext::for_home(&home, "pi");
        Self {
            temp,
            ctx,
            runner: FakeRunner::new(),
            observer: FakeObserver::new(),
            downloader: FakeDownloader::new(),
            cloner: FakeCloner::new(),
        }
    }

    pub fn home(&self) -> &Path {
        &self.ctx.home
    }

    pub fn host(&self) -> Host<'_> {
        Host {
            ctx: &self.ctx,
            runner: &self.runner,
            observer: &self.observer,
            downloader: &self.downloader,
            cloner: &self.cloner,
        }
    }
}
