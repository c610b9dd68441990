//! Run logger for the `log` facade.
//!
//! Every line goes to stderr and, once a run has an id, to
//! `<state_dir>/logs/<run_id>.log`. Format: `[HH:MM:SS.mmm] LEVEL message`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use log::{Level, LevelFilter, Log, Metadata, Record};
use time::macros::format_description;
use time::OffsetDateTime;

pub const LOG_ENV: &str = "PROVISION_LOG";
/// Module path roots of the library and of the `provision` binary.
const OWN_TARGETS: [&str; 2] = ["appliance_provision", "provision"];

type Sink = Arc<Mutex<Option<File>>>;

pub struct RunLogger {
    level: LevelFilter,
    sink: Sink,
}

/// Lets the caller attach the per-run log file after the logger is installed.
#[derive(Clone)]
pub struct LogHandle {
    sink: Sink,
}

impl LogHandle {
    /// Append every following line to `path` as well.
    pub fn attach_file(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if let Ok(mut sink) = self.sink.lock() {
            *sink = Some(file);
        }
        Ok(())
    }

    pub fn detach(&self) {
        if let Ok(mut sink) = self.sink.lock() {
            if let Some(mut file) = sink.take() {
                let _ = file.flush();
            }
        }
    }
}

impl RunLogger {
    pub fn new(level: LevelFilter) -> (Self, LogHandle) {
        let sink: Sink = Arc::new(Mutex::new(None));
        let handle = LogHandle { sink: sink.clone() };
        (Self { level, sink }, handle)
    }

    /// Install as the global logger.
    pub fn install(level: LevelFilter) -> Result<LogHandle, log::SetLoggerError> {
        let (logger, handle) = Self::new(level);
        log::set_boxed_logger(Box::new(logger))?;
        log::set_max_level(level);
        Ok(handle)
    }
}

impl Log for RunLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        // dependencies only get through at warn unless tracing
        let limit = if is_own_target(metadata.target()) || self.level == LevelFilter::Trace {
            self.level
        } else {
            self.level.min(LevelFilter::Warn)
        };
        metadata.level() <= limit
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_line(&timestamp(), record.level(), &record.args().to_string());
        let _ = io::stderr().write_all(line.as_bytes());
        if let Ok(mut sink) = self.sink.lock() {
            if let Some(file) = sink.as_mut() {
                let _ = file.write_all(line.as_bytes());
            }
        }
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
        if let Ok(mut sink) = self.sink.lock() {
            if let Some(file) = sink.as_mut() {
                let _ = file.flush();
            }
        }
    }
}

fn is_own_target(target: &str) -> bool {
    OWN_TARGETS.iter().any(|own| {
        target
            .strip_prefix(own)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
    })
}

fn timestamp() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(format_description!(
        "[hour]:[minute]:[second].[subsecond digits:3]"
    ))
    .unwrap_or_default()
}

pub fn format_line(timestamp: &str, level: Level, message: &str) -> String {
    format!("[{}] {:<5} {}\n", timestamp, level, message)
}

/// Level from `PROVISION_LOG`, defaulting to info.
pub fn level_from_env() -> LevelFilter {
    std::env::var(LOG_ENV)
        .ok()
        .and_then(|raw| parse_level(&raw))
        .unwrap_or(LevelFilter::Info)
}

pub fn parse_level(raw: &str) -> Option<LevelFilter> {
    raw.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn emit(logger: &RunLogger, target: &str, level: Level, msg: &str) {
        logger.log(
            &Record::builder()
                .args(format_args!("{}", msg))
                .level(level)
                .target(target)
                .build(),
        );
    }

    #[test]
    fn test_format_line() {
        assert_eq!(
            format_line("12:00:01.250", Level::Warn, "icon missing"),
            "[12:00:01.250] WARN  icon missing\n"
        );
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Some(LevelFilter::Debug));
        assert_eq!(parse_level(" WARN "), Some(LevelFilter::Warn));
        assert_eq!(parse_level("chatty"), None);
    }

    #[test]
    fn test_file_sink_and_filtering() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("logs/run.log");
        let (logger, handle) = RunLogger::new(LevelFilter::Info);

        emit(&logger, "appliance_provision::runner", Level::Info, "before attach");
        handle.attach_file(&path).unwrap();
        emit(&logger, "appliance_provision::runner", Level::Info, "step started");
        emit(&logger, "appliance_provision::runner", Level::Debug, "too verbose");
        emit(&logger, "reqwest::connect", Level::Info, "dependency chatter");
        emit(&logger, "reqwest::connect", Level::Warn, "dependency warning");
        handle.detach();
        emit(&logger, "appliance_provision::runner", Level::Info, "after detach");

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("INFO  step started"));
        assert!(lines[1].ends_with("WARN  dependency warning"));
        assert!(lines[0].starts_with('['));
    }

    #[test]
    fn test_binary_lines_pass_at_info() {
        let (logger, _handle) = RunLogger::new(LevelFilter::Info);
        let at = |target: &str, level: Level| {
            logger.enabled(&Metadata::builder().target(target).level(level).build())
        };

        assert!(at("provision", Level::Info));
        assert!(at("appliance_provision::executor::source", Level::Info));
        assert!(!at("provision", Level::Debug));
        assert!(!at("provisioner_helper", Level::Info));
        assert!(!at("git2::remote", Level::Info));
    }
}
