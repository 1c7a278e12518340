//! Typed error hierarchy for fleetpatch.
//!
//! - `StageError` - a per-repository, per-stage failure; carried as data through
//!   the report aggregator and never raised to the dispatcher's caller
//! - `PlatformError` - failures talking to the remote hosting platform
//! - `ApplyError` - remote patch application failures, split by retry class
//! - `TaskParseError` - a task-list line that does not name a repository
//! - `ConfigError` - fatal startup conditions

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One named step of the per-repository pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Preflight,
    Fork,
    Workspace,
    Rewrite,
    Diff,
    Parse,
    Apply,
    Publish,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Preflight => "preflight",
            Stage::Fork => "fork",
            Stage::Workspace => "workspace",
            Stage::Rewrite => "rewrite",
            Stage::Diff => "diff",
            Stage::Parse => "parse",
            Stage::Apply => "apply",
            Stage::Publish => "publish",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-classification of a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    /// The stage could not complete.
    Failed,
    /// The diff stage produced no hunks.
    Empty,
    /// The remote commit API cannot express a hunk. Never retried.
    Unsupported,
    /// Network, permission, conflict or stale-base failures.
    Other,
    /// The task-list line itself is malformed.
    Malformed,
}

impl StageErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageErrorKind::Failed => "failed",
            StageErrorKind::Empty => "empty",
            StageErrorKind::Unsupported => "unsupported",
            StageErrorKind::Other => "other",
            StageErrorKind::Malformed => "malformed",
        }
    }
}

/// A failure isolated to one repository's pipeline.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("[{repo_key}] {stage} ({kind_name}): {cause}", kind_name = .kind.as_str())]
pub struct StageError {
    pub repo_key: String,
    pub stage: Stage,
    pub kind: StageErrorKind,
    pub cause: String,
}

impl StageError {
    pub fn new(
        repo_key: impl Into<String>,
        stage: Stage,
        kind: StageErrorKind,
        cause: impl std::fmt::Display,
    ) -> Self {
        Self {
            repo_key: repo_key.into(),
            stage,
            kind,
            cause: cause.to_string(),
        }
    }

    /// Shorthand for a plain `Failed` error at `stage`. Uses `{:#}` so anyhow
    /// context chains survive into the report.
    pub fn failed(repo_key: &str, stage: Stage, cause: &anyhow::Error) -> Self {
        Self::new(repo_key, stage, StageErrorKind::Failed, format!("{:#}", cause))
    }

    /// Report tag, e.g. `apply-unsupported`, `diff-empty`, `publish`.
    pub fn tag(&self) -> String {
        match self.kind {
            StageErrorKind::Failed => self.stage.to_string(),
            StageErrorKind::Empty => format!("{}-empty", self.stage),
            StageErrorKind::Unsupported => format!("{}-unsupported", self.stage),
            StageErrorKind::Other => format!("{}-other", self.stage),
            StageErrorKind::Malformed => format!("{}-malformed", self.stage),
        }
    }
}

/// Errors from the remote platform adapter.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("{method} {url} returned HTTP {status}: {message}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
        message: String,
    },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to decode response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("GraphQL error: {0}")]
    GraphQl(String),

    #[error("{0}")]
    Rejected(String),
}

impl PlatformError {
    /// Whether a later attempt of the same call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            PlatformError::Status { status, .. } => *status == 429 || *status >= 500,
            PlatformError::Transport { .. } => true,
            PlatformError::Decode { .. } | PlatformError::GraphQl(_) | PlatformError::Rejected(_) => false,
        }
    }
}

/// Failures applying a patch against the remote repository.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApplyError {
    /// The hunk expresses something the commit API cannot represent.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// The branch moved past the base revision the commit was built on.
    /// Reported as `Other`.
    #[error("stale base: {0}")]
    StaleBase(String),

    /// Network, permission or conflict failure.
    #[error("{0}")]
    Other(String),
}

impl ApplyError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, ApplyError::Unsupported(_))
    }

    /// Only `Other` failures may succeed on a second attempt against the
    /// same base revision.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApplyError::Other(_))
    }

    pub fn kind(&self) -> StageErrorKind {
        match self {
            ApplyError::Unsupported(_) => StageErrorKind::Unsupported,
            ApplyError::StaleBase(_) | ApplyError::Other(_) => StageErrorKind::Other,
        }
    }
}

impl From<PlatformError> for ApplyError {
    fn from(err: PlatformError) -> Self {
        ApplyError::Other(err.to_string())
    }
}

/// A task-list line that cannot be turned into a repository task.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskParseError {
    #[error("line {line}: expected owner/repo[/path...], got {raw:?}")]
    TooFewSegments { line: usize, raw: String },

    #[error("line {line}: empty {segment} in {raw:?}")]
    EmptySegment {
        line: usize,
        segment: &'static str,
        raw: String,
    },
}

/// Fatal startup conditions; the run is aborted before any task starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("access credential missing: set {var} in the environment or .env")]
    MissingCredential { var: String },

    #[error("failed to read task list at {path}: {source}")]
    TaskListUnreadable {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read config file {path}: {source}")]
    ConfigUnreadable {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    ConfigInvalid(#[from] toml::de::Error),

    #[error("invalid rewrite pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}
