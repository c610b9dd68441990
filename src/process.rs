//! External command execution.
//!
//! All package-manager, build-tool, supervisor and desktop commands go
//! through the [`CommandRunner`] seam so the executors can be exercised
//! against a scripted runner instead of the real machine.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

/// Captured result of one external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Last `lines` lines of stdout followed by stderr.
    pub fn tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self
            .stdout
            .lines()
            .chain(self.stderr.lines())
            .filter(|l| !l.trim().is_empty())
            .collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }

    /// Human-readable exit status for error messages.
    pub fn status_text(&self) -> String {
        match self.status {
            Some(code) => format!("exit status {}", code),
            None => "termination by signal".to_string(),
        }
    }
}

/// Builder for an external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    privileged: bool,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            dir: None,
            env: Vec::new(),
            privileged: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.dir = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Run through the privilege escalation command when not already root.
    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn envs(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    /// Final argv, including the escalation prefix for privileged commands.
    ///
    /// Escalation commands such as sudo scrub the environment, so variables
    /// are re-applied through `env` after the prefix.
    pub fn argv(&self, escalate: Option<&str>) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 4);
        if let (true, Some(prefix)) = (self.privileged, escalate) {
            argv.push(prefix.to_string());
            if !self.env.is_empty() {
                argv.push("env".to_string());
                argv.extend(self.env.iter().map(|(k, v)| format!("{}={}", k, v)));
            }
        }
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    pub fn run(&self, runner: &dyn CommandRunner) -> io::Result<CmdOutput> {
        runner.run(self)
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Executes [`Cmd`] values.
///
/// A spawn failure (missing binary, exec permission) is an `Err`; a command
/// that ran and exited non-zero is an `Ok` with a failing [`CmdOutput`].
pub trait CommandRunner {
    fn run(&self, cmd: &Cmd) -> io::Result<CmdOutput>;
}

/// Runs commands on the host, capturing output while streaming it to the log.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    escalate: Option<String>,
}

impl SystemRunner {
    pub fn new(escalate: Option<&str>) -> Self {
        Self {
            escalate: escalate.map(str::to_string),
        }
    }

    pub fn unprivileged() -> Self {
        Self::default()
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, cmd: &Cmd) -> io::Result<CmdOutput> {
        let argv = cmd.argv(self.escalate.as_deref());
        log::debug!("exec: {}", argv.join(" "));

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cmd.dir() {
            command.current_dir(dir);
        }
        for (key, value) in cmd.envs() {
            command.env(key, value);
        }

        let mut child = command.spawn()?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Drain both pipes concurrently so a chatty stderr can't block stdout.
        let stdout_reader = stdout.map(|pipe| thread::spawn(move || collect_lines(pipe)));
        let stderr_text = stderr.map(collect_lines).unwrap_or_default();
        let stdout_text = match stdout_reader {
            Some(handle) => handle.join().unwrap_or_default(),
            None => String::new(),
        };

        let status = child.wait()?;
        Ok(CmdOutput {
            status: status.code(),
            stdout: stdout_text,
            stderr: stderr_text,
        })
    }
}

fn collect_lines<R: Read>(pipe: R) -> String {
    let mut collected = String::new();
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                log::trace!(target: "cmd", "{}", line.trim_end());
                collected.push_str(&line);
            }
        }
    }
    collected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argv_plain() {
        let cmd = Cmd::new("cmake").args(["--build", "build"]).arg("-j4");
        assert_eq!(cmd.argv(Some("sudo")), vec!["cmake", "--build", "build", "-j4"]);
    }

    #[test]
    fn test_argv_privileged_with_env() {
        let cmd = Cmd::new("apt-get")
            .args(["install", "-y", "git"])
            .env("DEBIAN_FRONTEND", "noninteractive")
            .privileged();
        assert_eq!(
            cmd.argv(Some("sudo")),
            vec![
                "sudo",
                "env",
                "DEBIAN_FRONTEND=noninteractive",
                "apt-get",
                "install",
                "-y",
                "git"
            ]
        );
        // Already root: no prefix
        assert_eq!(cmd.argv(None), vec!["apt-get", "install", "-y", "git"]);
    }

    #[test]
    fn test_tail_keeps_last_lines() {
        let output = CmdOutput {
            status: Some(1),
            stdout: "one\ntwo\nthree\n".into(),
            stderr: "four\n".into(),
        };
        assert_eq!(output.tail(2), "three\nfour");
        assert_eq!(output.tail(10), "one\ntwo\nthree\nfour");
        assert!(!output.success());
    }

    #[test]
    fn test_system_runner_captures_output() {
        let runner = SystemRunner::unprivileged();
        let out = Cmd::new("sh")
            .args(["-c", "echo out; echo err >&2; exit 3"])
            .run(&runner)
            .unwrap();
        assert_eq!(out.status, Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[test]
    fn test_system_runner_missing_binary_is_err() {
        let runner = SystemRunner::unprivileged();
        let result = Cmd::new("definitely_not_a_real_command_12345").run(&runner);
        assert!(result.is_err());
    }
}
