//! Error taxonomy for fixture setup and client calls
//!
//! Setup errors fall into four categories (dependency, provisioning, startup,
//! readiness) and abort fixture creation. Client errors are only surfaced after
//! the client's own retries are exhausted. Teardown never produces an error.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::template::RenderError;

/// Result type alias using [`FixtureError`]
pub type Result<T> = std::result::Result<T, FixtureError>;

/// Coarse classification of a [`FixtureError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Required executable or asset is missing; callers should skip, not fail
    Dependency,
    /// Port or workspace could not be allocated
    Provisioning,
    /// The child process could not run or exited before becoming ready
    Startup,
    /// The child ran but never answered within the bound
    ReadinessTimeout,
    /// A client call failed after all retries
    Client,
}

#[derive(Error, Debug)]
pub enum FixtureError {
    #[error("missing dependency: {what} not found at {}", .path.display())]
    MissingDependency { what: String, path: PathBuf },

    #[error("no free port found after {attempts} attempts (seed {seed})")]
    PortExhausted { seed: u16, attempts: u32 },

    #[error("workspace error at {}: {source}", .path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config render error: {0}")]
    Render(#[from] RenderError),

    #[error("duplicate routing rule for source prefix '{source_prefix}'")]
    DuplicateRoute { source_prefix: String },

    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited before becoming ready ({status}){}", format_tail(.stderr_tail))]
    ExitedEarly {
        program: String,
        status: String,
        stderr_tail: String,
    },

    #[error("{url} not ready after {}ms (last error: {last_error})", .waited.as_millis())]
    ReadinessTimeout {
        url: String,
        waited: Duration,
        last_error: String,
    },

    #[error("request to {url} failed after {attempts} attempts: {last_error}")]
    Client {
        url: String,
        attempts: u32,
        last_error: String,
    },

    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid fixture configuration: {0}")]
    Config(String),
}

fn format_tail(tail: &str) -> String {
    if tail.is_empty() {
        String::new()
    } else {
        format!("\n--- stderr ---\n{}", tail)
    }
}

impl FixtureError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            FixtureError::MissingDependency { .. } => ErrorCategory::Dependency,
            FixtureError::PortExhausted { .. }
            | FixtureError::Workspace { .. }
            | FixtureError::Render(_)
            | FixtureError::DuplicateRoute { .. }
            | FixtureError::Config(_) => ErrorCategory::Provisioning,
            FixtureError::Spawn { .. } | FixtureError::ExitedEarly { .. } => ErrorCategory::Startup,
            FixtureError::ReadinessTimeout { .. } => ErrorCategory::ReadinessTimeout,
            FixtureError::Client { .. } | FixtureError::Decode { .. } => ErrorCategory::Client,
        }
    }

    /// True when the error means "this environment cannot run the fixture"
    pub fn is_dependency(&self) -> bool {
        self.category() == ErrorCategory::Dependency
    }

    pub(crate) fn workspace(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FixtureError::Workspace {
            path: path.into(),
            source,
        }
    }
}
