//! StepRunner: executes a plan strictly in order.
//!
//! Forward-only. A failed critical step halts the plan; a failed
//! non-critical step is logged and the plan continues. Recovery is
//! "fix the cause and run the whole plan again".

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::ProvisionError;
use crate::executor::{self, launcher, Host};
use crate::observer;
use crate::plan::{Action, ProvisioningPlan, Step};

/// Outcome of one step.
#[derive(Debug)]
pub enum StepResult {
    Succeeded,
    SucceededWithWarning(String),
    Failed(ProvisionError),
}

impl StepResult {
    pub fn is_failure(&self) -> bool {
        matches!(self, StepResult::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            StepResult::Succeeded => "succeeded",
            StepResult::SucceededWithWarning(_) => "succeeded-with-warning",
            StepResult::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for StepResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepResult::Succeeded => write!(f, "succeeded"),
            StepResult::SucceededWithWarning(msg) => write!(f, "succeeded with warning: {}", msg),
            StepResult::Failed(err) => write!(f, "failed: {}", err),
        }
    }
}

#[derive(Debug)]
pub struct StepRecord {
    pub name: String,
    pub kind: &'static str,
    pub critical: bool,
    pub result: StepResult,
    /// Why the action had nothing to do, if it didn't.
    pub skipped: Option<String>,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub records: Vec<StepRecord>,
    pub total_steps: usize,
    pub elapsed: Duration,
    /// Step the run stopped before, when cancelled.
    pub cancelled_before: Option<String>,
    /// Warnings not tied to a single step.
    pub warnings: Vec<String>,
    pub dry_run: bool,
}

impl RunReport {
    /// The critical failure that halted the run.
    pub fn failure(&self) -> Option<&StepRecord> {
        self.records
            .iter()
            .find(|r| r.critical && r.result.is_failure())
    }

    pub fn succeeded(&self) -> bool {
        self.failure().is_none() && self.cancelled_before.is_none()
    }

    /// Error that ends the run, if any.
    pub fn error(&self) -> Option<&ProvisionError> {
        match self.failure().map(|r| &r.result) {
            Some(StepResult::Failed(err)) => Some(err),
            _ => None,
        }
    }

    pub fn not_run(&self) -> usize {
        self.total_steps.saturating_sub(self.records.len())
    }

    pub fn status(&self) -> &'static str {
        if self.cancelled_before.is_some() {
            "cancelled"
        } else if self.failure().is_some() {
            "failed"
        } else if self.dry_run {
            "dry-run"
        } else {
            "completed"
        }
    }
}

static SIGINT_SEEN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: libc::c_int) {
    SIGINT_SEEN.store(true, Ordering::SeqCst);
    // A second Ctrl-C kills the process outright.
    // SAFETY: signal() is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_DFL);
    }
}

/// Checked at every step boundary. Never interrupts a running step.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
    watch_sigint: bool,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel on SIGINT.
    pub fn install_sigint() -> io::Result<Self> {
        let handler = on_sigint as extern "C" fn(libc::c_int);
        // SAFETY: the handler only touches an atomic and resets the disposition.
        let previous = unsafe { libc::signal(libc::SIGINT, handler as libc::sighandler_t) };
        if previous == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            flag: Arc::new(AtomicBool::new(false)),
            watch_sigint: true,
        })
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || (self.watch_sigint && SIGINT_SEEN.load(Ordering::SeqCst))
    }
}

pub struct StepRunner<'a> {
    host: Host<'a>,
    cancel: CancelFlag,
    dry_run: bool,
}

impl<'a> StepRunner<'a> {
    pub fn new(host: Host<'a>, cancel: CancelFlag) -> Self {
        Self {
            host,
            cancel,
            dry_run: false,
        }
    }

    /// Log what would run without touching the host.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn run(&self, plan: &ProvisioningPlan) -> RunReport {
        let started = Instant::now();
        let total = plan.len();
        let mut report = RunReport {
            total_steps: total,
            dry_run: self.dry_run,
            ..RunReport::default()
        };
        let mut wrote_launcher = false;

        for (idx, step) in plan.steps().iter().enumerate() {
            if self.cancel.is_cancelled() {
                log::warn!("Cancelled before step '{}'", step.name);
                report.cancelled_before = Some(step.name.clone());
                break;
            }
            let prefix = format!("[step {}/{} {}]", idx + 1, total, step.name);

            if self.dry_run {
                self.describe(&prefix, step);
                continue;
            }

            log::info!("{} {}", prefix, step.action.describe());
            let record = self.run_step(&prefix, step);
            let halt = record.critical && record.result.is_failure();
            if matches!(step.action, Action::LauncherWrite(_)) && !record.result.is_failure() {
                wrote_launcher = true;
            }
            report.records.push(record);
            if halt {
                log::error!("{} critical step failed; halting", prefix);
                break;
            }
        }

        if wrote_launcher {
            if let Some(warning) = launcher::refresh_desktop(&self.host) {
                log::warn!("{}", warning);
                report.warnings.push(warning);
            }
        }

        report.elapsed = started.elapsed();
        log_summary(&report);
        report
    }

    fn run_step(&self, prefix: &str, step: &Step) -> StepRecord {
        let started = Instant::now();
        let critical = step.is_critical();

        let outcome = executor::execute_step(&self.host, step).and_then(|applied| {
            // Exit status alone never completes a step that has an independent check.
            if let Some(verification) = &step.verify {
                observer::confirm(self.host.observer, verification)?;
            }
            Ok(applied)
        });

        let (result, skipped) = match outcome {
            Ok(applied) => {
                if let Some(reason) = &applied.skipped {
                    log::info!("{} nothing to do: {}", prefix, reason);
                }
                for warning in &applied.warnings {
                    log::warn!("{} {}", prefix, warning);
                }
                let result = if applied.warnings.is_empty() {
                    StepResult::Succeeded
                } else {
                    StepResult::SucceededWithWarning(applied.warnings.join("; "))
                };
                (result, applied.skipped)
            }
            Err(err) => {
                if critical {
                    log::error!("{} {}", prefix, err);
                } else {
                    log::warn!("{} non-critical step failed, continuing: {}", prefix, err);
                }
                (StepResult::Failed(err), None)
            }
        };

        let elapsed = started.elapsed();
        log::debug!("{} {} in {}", prefix, result.label(), format_duration(elapsed));
        StepRecord {
            name: step.name.clone(),
            kind: step.action.kind(),
            critical,
            result,
            skipped,
            elapsed,
        }
    }

    fn describe(&self, prefix: &str, step: &Step) {
        let criticality = if step.is_critical() { "critical" } else { "optional" };
        log::info!("{} would {} ({})", prefix, step.action.describe(), criticality);
        for target in step.action.write_targets(self.host.ctx) {
            log::info!("{}   writes {}", prefix, target.display());
        }
        if let Some(verification) = &step.verify {
            log::info!("{}   verifies {}", prefix, verification);
        }
    }
}

fn log_summary(report: &RunReport) {
    let warned = report
        .records
        .iter()
        .filter(|r| matches!(r.result, StepResult::SucceededWithWarning(_)))
        .count();
    let optional_failed = report
        .records
        .iter()
        .filter(|r| !r.critical && r.result.is_failure())
        .count();

    if let Some(failed) = report.failure() {
        log::error!(
            "Provisioning failed at '{}' after {} ({} step(s) not run)",
            failed.name,
            format_duration(report.elapsed),
            report.not_run()
        );
    } else if let Some(step) = &report.cancelled_before {
        log::warn!(
            "Provisioning cancelled before '{}' after {}",
            step,
            format_duration(report.elapsed)
        );
    } else {
        log::info!(
            "Provisioning {} in {}: {} step(s), {} with warnings, {} optional failure(s)",
            if report.dry_run { "dry run finished" } else { "finished" },
            format_duration(report.elapsed),
            report.total_steps,
            warned,
            optional_failed
        );
    }
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {:02}m {:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}
