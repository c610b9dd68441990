//! Provisioning engine for a single-board SDR appliance.
//!
//! Turns an ordered plan of heterogeneous actions (package installs, source
//! builds, downloads, state resets, desktop launchers, user services) into
//! one forward-only run that is safe to repeat after a partial failure.
//!
//! - **Plan model** - Steps, actions and verifications, loaded from TOML
//! - **Executors** - One handler per action kind, behind command/observer seams
//! - **Runner** - Sequencing, criticality, verification gate, cancellation
//! - **Run bookkeeping** - Lock, run manifests, per-run log files
//! - **Preflight checks** - Host tool validation before a run
//!
//! # Architecture
//!
//! ```text
//! plan::config (TOML) ──> ProvisioningPlan
//!                              │
//!                          StepRunner ──── observer::confirm (verification gate)
//!                              │
//!     ┌──────────┬─────────────┼────────────┬────────────┬───────────┐
//! packages    source        fetch        reset      launcher    service
//!     │          │             │            │            │           │
//!     └──── CommandRunner ─── Downloader ── RepoCloner ──┴── SystemObserver
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use appliance_provision::context::ProvisioningContext;
//! use appliance_provision::executor::{fetch::HttpDownloader, source::GitCloner, Host};
//! use appliance_provision::observer::HostObserver;
//! use appliance_provision::process::SystemRunner;
//! use appliance_provision::runner::{CancelFlag, StepRunner};
//!
//! let doc = appliance_provision::appliance::document()?;
//! let probe = SystemRunner::unprivileged();
//! let ctx = ProvisioningContext::resolve(doc.settings(), &probe)?;
//! let plan = doc.into_plan(&ctx)?;
//!
//! let runner = SystemRunner::new(ctx.escalation());
//! let observer = HostObserver::new(&runner, &ctx.runtime_dir);
//! let downloader = HttpDownloader::new()?;
//! let host = Host { ctx: &ctx, runner: &runner, observer: &observer,
//!                   downloader: &downloader, cloner: &GitCloner };
//! let report = StepRunner::new(host, CancelFlag::install_sigint()?).run(&plan);
//! assert!(report.succeeded());
//! ```

pub mod appliance;
pub mod context;
pub mod error;
pub mod executor;
pub mod lock;
pub mod logging;
pub mod observer;
pub mod plan;
pub mod preflight;
pub mod process;
pub mod runner;
pub mod runs;

#[cfg(test)]
mod testing;

pub use context::ProvisioningContext;
pub use error::{ProvisionError, Result};
pub use plan::{Action, ProvisioningPlan, Step, Verification};
pub use runner::{RunReport, StepResult, StepRunner};
