use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use appliance_provision::appliance;
use appliance_provision::context::ProvisioningContext;
use appliance_provision::executor::fetch::HttpDownloader;
use appliance_provision::executor::source::GitCloner;
use appliance_provision::executor::Host;
use appliance_provision::lock::RunLock;
use appliance_provision::logging::{self, LogHandle, RunLogger};
use appliance_provision::observer::HostObserver;
use appliance_provision::plan::config::PlanDocument;
use appliance_provision::plan::ProvisioningPlan;
use appliance_provision::preflight;
use appliance_provision::process::SystemRunner;
use appliance_provision::runner::{format_duration, CancelFlag, StepRunner};
use appliance_provision::runs::{RunManifest, RunStore, DEFAULT_KEEP_RUNS};
use appliance_provision::ProvisionError;

fn usage() -> &'static str {
    "Usage:\n  provision run [PLAN] [--dry-run]\n  provision check [PLAN]\n  provision show [PLAN]\n  provision history\n\nWithout PLAN the built-in appliance plan is used.\nLog level: PROVISION_LOG=error|warn|info|debug|trace"
}

fn main() -> Result<()> {
    let log_handle = match RunLogger::install(logging::level_from_env()) {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("[provision] WARNING: logger unavailable: {}", e);
            None
        }
    };

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    match args.as_slice() {
        ["run", rest @ ..] => {
            let dry_run = rest.contains(&"--dry-run");
            let positional: Vec<&str> = rest.iter().copied().filter(|a| *a != "--dry-run").collect();
            match positional.as_slice() {
                [] => run(None, dry_run, log_handle.as_ref()),
                [plan] => run(Some(Path::new(plan)), dry_run, log_handle.as_ref()),
                _ => bail!(usage()),
            }
        }
        ["check"] => check(None),
        ["check", plan] => check(Some(Path::new(plan))),
        ["show"] => show(None),
        ["show", plan] => show(Some(Path::new(plan))),
        ["history"] => history(),
        ["help" | "--help" | "-h"] => {
            println!("{}", usage());
            Ok(())
        }
        _ => bail!(usage()),
    }
}

struct Loaded {
    origin: String,
    ctx: ProvisioningContext,
    plan: ProvisioningPlan,
}

fn load(plan_path: Option<&Path>) -> Result<Loaded> {
    let doc = match plan_path {
        Some(path) => PlanDocument::load(path)?,
        None => appliance::document()?,
    };
    let probe = SystemRunner::unprivileged();
    let ctx = ProvisioningContext::resolve(doc.settings(), &probe)
        .context("resolving provisioning context")?;
    let origin = doc.origin().to_string();
    let plan = doc.into_plan(&ctx)?;
    log::debug!(
        "user {} (uid {}), home {}, desktop {}",
        ctx.user,
        ctx.uid,
        ctx.home.display(),
        ctx.desktop_dir.display()
    );
    Ok(Loaded { origin, ctx, plan })
}

fn run(plan_path: Option<&Path>, dry_run: bool, log_handle: Option<&LogHandle>) -> Result<()> {
    let Loaded { origin, ctx, plan } = load(plan_path)?;
    log::info!("Plan '{}': {} step(s)", origin, plan.len());

    let report = preflight::check_plan(&plan, &ctx);
    if dry_run {
        for req in &report.missing_required {
            log::warn!("Missing required tool {} (install: {})", req.tool, req.package);
        }
    } else {
        report.into_result().context("preflight checks failed")?;
    }

    let runner = SystemRunner::new(ctx.escalation());
    let observer = HostObserver::new(&runner, &ctx.runtime_dir);
    let downloader = HttpDownloader::new().context("creating HTTP client")?;
    let cloner = GitCloner;
    let host = Host {
        ctx: &ctx,
        runner: &runner,
        observer: &observer,
        downloader: &downloader,
        cloner: &cloner,
    };

    if dry_run {
        let report = StepRunner::new(host, CancelFlag::new()).dry_run(true).run(&plan);
        println!("dry run: {} step(s) listed, nothing executed", report.total_steps);
        return Ok(());
    }

    let _lock = RunLock::acquire(&ctx.state_dir)?;
    let store = RunStore::new(&ctx.state_dir);
    let run_id = store.allocate()?;
    let log_path = log_file(&ctx, &run_id);
    if let Some(handle) = log_handle {
        if let Err(e) = handle.attach_file(&log_path) {
            log::warn!("Cannot write run log {}: {}", log_path.display(), e);
        }
    }
    log::info!("Run {} started", run_id);

    let mut manifest = RunManifest::started(&run_id, &origin, plan.len(), false)?;
    store.write(&manifest)?;

    let cancel = CancelFlag::install_sigint().unwrap_or_else(|e| {
        log::warn!("Ctrl-C handling unavailable: {}", e);
        CancelFlag::new()
    });
    let report = StepRunner::new(host, cancel).run(&plan);

    manifest.finish(&report)?;
    store.write(&manifest)?;
    prune_history(&ctx, &store);
    if let Some(handle) = log_handle {
        handle.detach();
    }

    println!(
        "run {}: {} in {} ({}/{} step(s) executed)",
        run_id,
        report.status(),
        format_duration(report.elapsed),
        report.records.len(),
        report.total_steps
    );
    println!("manifest: {}", store.manifest_path(&run_id).display());

    if let Some(step) = &report.cancelled_before {
        return Err(ProvisionError::Cancelled(step.clone()).into());
    }
    if let Some(failed) = report.failure() {
        let err = report
            .error()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        return Err(anyhow!("step '{}' failed: {}", failed.name, err));
    }
    Ok(())
}

fn log_file(ctx: &ProvisioningContext, run_id: &str) -> PathBuf {
    ctx.state_dir.join("logs").join(format!("{}.log", run_id))
}

/// History pruning never fails a run.
fn prune_history(ctx: &ProvisioningContext, store: &RunStore) {
    match store.prune(DEFAULT_KEEP_RUNS) {
        Ok(removed) => {
            for run_id in removed {
                let path = log_file(ctx, &run_id);
                if let Err(e) = fs::remove_file(&path) {
                    log::debug!("no log to remove at {}: {}", path.display(), e);
                }
            }
        }
        Err(e) => log::warn!("Pruning run history failed: {:#}", e),
    }
}

fn check(plan_path: Option<&Path>) -> Result<()> {
    let Loaded { origin, ctx, plan } = load(plan_path)?;
    println!("plan '{}' is valid: {} step(s)", origin, plan.len());

    let report = preflight::check_plan(&plan, &ctx);
    for req in &report.missing_optional {
        println!(
            "  optional: {} missing (install: {}, used by '{}')",
            req.tool, req.package, req.needed_by
        );
    }
    if !ctx.can_escalate() {
        println!("  note: not root and escalation disabled; privileged steps will fail");
    }
    report.into_result()?;
    println!("host tools: ok");
    Ok(())
}

fn show(plan_path: Option<&Path>) -> Result<()> {
    let Loaded { origin, ctx, plan } = load(plan_path)?;
    println!("{} ({} step(s))", origin, plan.len());
    for (idx, step) in plan.steps().iter().enumerate() {
        println!(
            "{:>3}. [{}] {}{}",
            idx + 1,
            step.action.kind(),
            step.name,
            if step.is_critical() { "" } else { " (optional)" }
        );
        println!("       {}", step.action.describe());
        for target in step.action.write_targets(&ctx) {
            println!("       writes {}", target.display());
        }
        if let Some(verification) = &step.verify {
            println!("       verifies {}", verification);
        }
    }
    Ok(())
}

fn history() -> Result<()> {
    let doc = appliance::document()?;
    let probe = SystemRunner::unprivileged();
    let ctx = ProvisioningContext::resolve(doc.settings(), &probe)
        .context("resolving provisioning context")?;
    let runs = RunStore::new(&ctx.state_dir).list()?;
    if runs.is_empty() {
        println!("no runs recorded under {}", ctx.state_dir.display());
        return Ok(());
    }
    for run in runs {
        let failed = run
            .steps
            .iter()
            .find(|s| s.critical && s.outcome == "failed")
            .map(|s| format!(" at '{}'", s.name))
            .unwrap_or_default();
        println!(
            "{}  {:<9}{}  {} -> {}  {}/{} step(s)  {}",
            run.run_id,
            run.status,
            failed,
            run.created_at_utc,
            run.finished_at_utc.as_deref().unwrap_or("-"),
            run.steps.len(),
            run.total_steps,
            run.plan
        );
    }
    Ok(())
}
