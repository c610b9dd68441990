//! Error taxonomy for provisioning steps.
//!
//! Every variant names the resource it failed on so an operator can act on
//! the message without re-running at a higher verbosity.

use std::io;
use thiserror::Error;

use crate::process::CmdOutput;

/// Lines of build tool output attached to a `BuildFailed` error.
pub const BUILD_TAIL_LINES: usize = 40;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("fetch failed for {resource}: {reason}")]
    FetchFailed { resource: String, reason: String },

    #[error("package not found: {package} ({reason})")]
    PackageNotFound { package: String, reason: String },

    #[error("build failed for {repo} during {phase}: {reason}{tail}")]
    BuildFailed {
        repo: String,
        phase: String,
        reason: String,
        tail: String,
    },

    #[error("verification failed for {resource}: {reason}")]
    VerificationFailed { resource: String, reason: String },

    #[error("permission denied for {resource}: {reason}")]
    PermissionDenied { resource: String, reason: String },

    #[error("state conflict at {resource}: {reason}")]
    StateConflict { resource: String, reason: String },

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("run cancelled before step '{0}'")]
    Cancelled(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ProvisionError>;

impl ProvisionError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        ProvisionError::Io {
            context: context.into(),
            source,
        }
    }

    /// Build a `BuildFailed` carrying the tail of the tool's diagnostics.
    pub fn build_failed(
        repo: impl Into<String>,
        phase: impl Into<String>,
        reason: impl Into<String>,
        output: Option<&CmdOutput>,
    ) -> Self {
        let tail = output
            .map(|o| o.tail(BUILD_TAIL_LINES))
            .filter(|t| !t.is_empty())
            .map(|t| format!("\n--- last {} lines of build output ---\n{}", BUILD_TAIL_LINES, t))
            .unwrap_or_default();
        ProvisionError::BuildFailed {
            repo: repo.into(),
            phase: phase.into(),
            reason: reason.into(),
            tail,
        }
    }

    /// Short machine-readable name, used in run manifests.
    pub fn kind(&self) -> &'static str {
        match self {
            ProvisionError::FetchFailed { .. } => "FetchFailed",
            ProvisionError::PackageNotFound { .. } => "PackageNotFound",
            ProvisionError::BuildFailed { .. } => "BuildFailed",
            ProvisionError::VerificationFailed { .. } => "VerificationFailed",
            ProvisionError::PermissionDenied { .. } => "PermissionDenied",
            ProvisionError::StateConflict { .. } => "StateConflict",
            ProvisionError::InvalidPlan(_) => "InvalidPlan",
            ProvisionError::Cancelled(_) => "Cancelled",
            ProvisionError::Io { .. } => "Io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_failed_display() {
        let err = ProvisionError::FetchFailed {
            resource: "https://example.org/icon.png".into(),
            reason: "timeout".into(),
        };
        assert_eq!(
            err.to_string(),
            "fetch failed for https://example.org/icon.png: timeout"
        );
        assert_eq!(err.kind(), "FetchFailed");
    }

    #[test]
    fn test_build_failed_includes_tail() {
        let output = CmdOutput {
            status: Some(2),
            stdout: "[ 10%] Building foo.o\n".into(),
            stderr: "foo.c:1: fatal error: bar.h: No such file\n".into(),
        };
        let err = ProvisionError::build_failed("repo", "compile", "make exited 2", Some(&output));
        let text = err.to_string();
        assert!(text.contains("during compile"));
        assert!(text.contains("bar.h: No such file"));
    }

    #[test]
    fn test_build_failed_without_output_has_no_tail() {
        let err = ProvisionError::build_failed("repo", "configure", "cmake not found", None);
        assert_eq!(
            err.to_string(),
            "build failed for repo during configure: cmake not found"
        );
    }
}
