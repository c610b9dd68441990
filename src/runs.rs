//! Run history under `<state_dir>/runs/<run_id>/run-manifest.json`.
//!
//! Run ids are base62 timestamps, so lexical order is creation order.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::runner::{RunReport, StepResult};

const RUN_MANIFEST_FILENAME: &str = "run-manifest.json";
const RUN_ID_SALT_BITS: u32 = 32;
pub const DEFAULT_KEEP_RUNS: usize = 20;

static RUN_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEntry {
    pub name: String,
    pub kind: String,
    pub critical: bool,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub plan: String,
    pub status: String,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub total_steps: usize,
    #[serde(default)]
    pub steps: Vec<StepEntry>,
}

impl RunManifest {
    /// Manifest for a run that has just started.
    pub fn started(run_id: &str, plan: &str, total_steps: usize, dry_run: bool) -> Result<Self> {
        Ok(Self {
            run_id: run_id.to_string(),
            plan: plan.to_string(),
            status: "running".to_string(),
            created_at_utc: now_utc()?,
            finished_at_utc: None,
            dry_run,
            total_steps,
            steps: Vec::new(),
        })
    }

    /// Record the outcome of every executed step and close the run.
    pub fn finish(&mut self, report: &RunReport) -> Result<()> {
        self.status = report.status().to_string();
        self.finished_at_utc = Some(now_utc()?);
        self.steps = report
            .records
            .iter()
            .map(|record| {
                let (error_kind, message) = match &record.result {
                    StepResult::Succeeded => (None, None),
                    StepResult::SucceededWithWarning(msg) => (None, Some(msg.clone())),
                    StepResult::Failed(err) => {
                        (Some(err.kind().to_string()), Some(err.to_string()))
                    }
                };
                StepEntry {
                    name: record.name.clone(),
                    kind: record.kind.to_string(),
                    critical: record.critical,
                    outcome: record.result.label().to_string(),
                    error_kind,
                    message,
                    skipped: record.skipped.clone(),
                    elapsed_ms: record.elapsed.as_millis() as u64,
                }
            })
            .collect();
        Ok(())
    }

    fn sort_key(&self) -> &str {
        self.finished_at_utc
            .as_deref()
            .unwrap_or(&self.created_at_utc)
    }
}

fn now_utc() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("formatting run timestamp")
}

pub fn generate_run_id() -> Result<String> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before UNIX_EPOCH while generating run id")?
        .as_nanos();
    let pid_component = (std::process::id() as u128 & 0xFFFF) << 16;
    let seq_component = (RUN_ID_COUNTER.fetch_add(1, Ordering::Relaxed) as u128) & 0xFFFF;
    let entropy = (nanos << RUN_ID_SALT_BITS) | pid_component | seq_component;
    let id = base62_encode_u128(entropy);
    if id.len() > 22 {
        bail!("run id overflow while generating run identifier")
    }
    Ok(id)
}

fn base62_encode_u128(mut value: u128) -> String {
    const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut bytes = Vec::new();
    while value > 0 {
        bytes.push(ALPHABET[(value % 62) as usize] as char);
        value /= 62;
    }
    bytes.iter().rev().collect()
}

/// The `runs/` directory of a state dir.
#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            root: state_dir.join("runs"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id).join(RUN_MANIFEST_FILENAME)
    }

    /// Create a fresh run directory and return its id.
    pub fn allocate(&self) -> Result<String> {
        for _ in 0..32 {
            let run_id = generate_run_id()?;
            let run_dir = self.root.join(&run_id);
            if run_dir.exists() {
                continue;
            }
            fs::create_dir_all(&run_dir)
                .with_context(|| format!("creating run directory '{}'", run_dir.display()))?;
            return Ok(run_id);
        }
        bail!(
            "failed allocating unique run directory under '{}'",
            self.root.display()
        )
    }

    pub fn write(&self, manifest: &RunManifest) -> Result<()> {
        let path = self.manifest_path(&manifest.run_id);
        write_json_atomic(&path, manifest)
            .with_context(|| format!("writing run manifest '{}'", path.display()))
    }

    /// Every recorded run, newest first. Directories without a manifest are ignored.
    pub fn list(&self) -> Result<Vec<RunManifest>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("reading runs directory '{}'", self.root.display()))?
        {
            let entry = entry
                .with_context(|| format!("iterating runs directory '{}'", self.root.display()))?;
            let run_dir = entry.path();
            let Some(name) = run_dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') || !run_dir.is_dir() {
                continue;
            }
            let path = run_dir.join(RUN_MANIFEST_FILENAME);
            if !path.is_file() {
                continue;
            }
            let bytes = fs::read(&path)
                .with_context(|| format!("reading run manifest '{}'", path.display()))?;
            let manifest: RunManifest = serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing run manifest '{}'", path.display()))?;
            runs.push(manifest);
        }
        runs.sort_by(|a, b| {
            b.sort_key()
                .cmp(a.sort_key())
                .then_with(|| b.run_id.cmp(&a.run_id))
        });
        Ok(runs)
    }

    /// Remove all but the `keep` newest runs and return the removed ids.
    pub fn prune(&self, keep: usize) -> Result<Vec<String>> {
        let runs = self.list()?;
        let mut removed = Vec::new();
        for run in runs.into_iter().skip(keep) {
            let path = self.root.join(&run.run_id);
            fs::remove_dir_all(&path)
                .with_context(|| format!("removing expired run directory '{}'", path.display()))?;
            removed.push(run.run_id);
        }
        Ok(removed)
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let payload = serde_json::to_vec_pretty(value).context("serializing run manifest")?;
    fs::write(&tmp, payload).with_context(|| format!("writing temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "renaming temp file '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}
