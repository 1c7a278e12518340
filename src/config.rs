//! Layered configuration for fleetpatch.
//!
//! Settings come from `.fleetpatch/fleetpatch.toml`, then the environment
//! (including a `.env` file), then CLI flags. Every section is optional.
//!
//! # Configuration File Format
//!
//! ```toml
//! [github]
//! actor = "octo-bot"
//! token_env = "GITHUB_TOKEN"
//!
//! [run]
//! tasks_file = "repos.txt"
//! workspace_root = "workspaces"
//! max_parallel = 8
//!
//! [pacing]
//! settle_after_fork_ms = 2000
//! settle_after_commit_ms = 2000
//! min_mutation_interval_ms = 0
//!
//! [retry]
//! max_attempts = 1
//!
//! [commit]
//! author_name = "Octo Bot"
//! author_email = "octo@example.com"
//!
//! [pull_request]
//! draft = false
//!
//! [rewrite]
//! marker = "set-output"
//! extensions = ["yml", "yaml"]
//! scope = "workspace"
//! ```

use crate::errors::ConfigError;
use crate::rewrite::undefined_group_refs;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_DIR: &str = ".fleetpatch";
pub const CONFIG_FILE: &str = "fleetpatch.toml";

/// Known GitHub token prefixes.
/// See: https://github.blog/2021-04-05-behind-githubs-new-authentication-token-formats/
const GITHUB_TOKEN_PREFIXES: &[&str] = &["ghp_", "github_pat_", "gho_", "ghu_", "ghs_", "ghr_"];

/// Format-only check that a string looks like a GitHub token.
pub fn is_valid_github_token(token: &str) -> bool {
    !token.is_empty()
        && GITHUB_TOKEN_PREFIXES
            .iter()
            .any(|prefix| token.starts_with(prefix))
}

/// Remote platform endpoints and identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubSection {
    pub api_url: String,
    pub graphql_url: String,
    /// Fork owner login. Resolved from the token when absent.
    pub actor: Option<String>,
    /// Name of the environment variable holding the access token.
    pub token_env: String,
}

impl Default for GitHubSection {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            graphql_url: "https://api.github.com/graphql".to_string(),
            actor: None,
            token_env: "GITHUB_TOKEN".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSection {
    pub tasks_file: PathBuf,
    pub workspace_root: PathBuf,
    /// Concurrent pipelines cap; 0 means unbounded.
    pub max_parallel: usize,
    /// Directory tree created in every workspace before the target file is written.
    pub ci_dir: String,
    /// Scratch patch artifact written inside each workspace.
    pub patch_file: String,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            tasks_file: PathBuf::from("repos.txt"),
            workspace_root: PathBuf::from("workspaces"),
            max_parallel: 8,
            ci_dir: ".github/workflows".to_string(),
            patch_file: "changes.patch".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingSection {
    pub settle_after_fork_ms: u64,
    pub settle_after_commit_ms: u64,
    pub min_mutation_interval_ms: u64,
}

impl Default for PacingSection {
    fn default() -> Self {
        Self {
            settle_after_fork_ms: 2000,
            settle_after_commit_ms: 2000,
            min_mutation_interval_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 500,
            multiplier: 2.0,
        }
    }
}

const DEFAULT_TITLE: &str = "ci: Use GITHUB_OUTPUT envvar instead of set-output command";
const DEFAULT_BODY: &str = "`save-state` and `set-output` commands used in GitHub Actions are deprecated and \
[GitHub recommends using environment files](https://github.blog/changelog/2023-07-24-github-actions-update-on-save-state-and-set-output-commands/).\n\n\
This PR updates the usage of `::set-output` to `\"$GITHUB_OUTPUT\"`\n\n\
Instructions for envvar usage from GitHub docs:\n\n\
https://docs.github.com/en/actions/using-workflows/workflow-commands-for-github-actions#setting-an-output-parameter";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitSection {
    pub author_name: String,
    pub author_email: String,
    pub title: String,
    pub body: String,
}

impl Default for CommitSection {
    fn default() -> Self {
        Self {
            author_name: "fleetpatch".to_string(),
            author_email: "fleetpatch@users.noreply.github.com".to_string(),
            title: DEFAULT_TITLE.to_string(),
            body: DEFAULT_BODY.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PullRequestSection {
    /// Defaults to the commit title.
    pub title: Option<String>,
    /// Defaults to the commit body.
    pub body: Option<String>,
    pub draft: bool,
    pub maintainer_can_modify: bool,
}

impl Default for PullRequestSection {
    fn default() -> Self {
        Self {
            title: None,
            body: None,
            draft: false,
            maintainer_can_modify: true,
        }
    }
}

/// Which files the rewrite collaborator considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RewriteScope {
    /// Every file with a configured extension in the workspace.
    #[default]
    Workspace,
    /// Only the task's target file.
    Target,
}

impl std::fmt::Display for RewriteScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RewriteScope::Workspace => write!(f, "workspace"),
            RewriteScope::Target => write!(f, "target"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewriteSection {
    pub marker: String,
    pub pattern: String,
    pub replacement: String,
    pub extensions: Vec<String>,
    pub scope: RewriteScope,
}

impl Default for RewriteSection {
    fn default() -> Self {
        Self {
            marker: "set-output".to_string(),
            pattern: "::set-output name=([^:]*)::(.*)".to_string(),
            // `$$` is a literal `$` in regex replacements.
            replacement: "${1}=${2} >> \"$$GITHUB_OUTPUT\"".to_string(),
            extensions: vec!["yml".to_string(), "yaml".to_string()],
            scope: RewriteScope::Workspace,
        }
    }
}

/// The complete fleetpatch.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetToml {
    #[serde(default)]
    pub github: GitHubSection,
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub pacing: PacingSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub commit: CommitSection,
    #[serde(default)]
    pub pull_request: PullRequestSection,
    #[serde(default)]
    pub rewrite: RewriteSection,
}

impl FleetToml {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ConfigUnreadable {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load `<config_dir>/fleetpatch.toml`, or defaults when it does not exist.
    pub fn load_or_default(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize fleetpatch.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        match regex::Regex::new(&self.rewrite.pattern) {
            Err(e) => {
                warnings.push(format!("Invalid rewrite pattern '{}': {}", self.rewrite.pattern, e));
            }
            Ok(pattern) => {
                for group in undefined_group_refs(&pattern, &self.rewrite.replacement) {
                    warnings.push(format!(
                        "rewrite.replacement references undefined group '{}': it expands to nothing (write '$$' for a literal '$')",
                        group
                    ));
                }
            }
        }
        if self.rewrite.marker.is_empty() {
            warnings.push("rewrite.marker is empty: every workspace will be rewritten".to_string());
        }
        if self.rewrite.extensions.is_empty() {
            warnings.push("rewrite.extensions is empty: no file will ever be rewritten".to_string());
        }
        if self.retry.max_attempts == 0 {
            warnings.push("retry.max_attempts is 0: treated as 1 (no retry)".to_string());
        }
        if self.retry.multiplier < 1.0 {
            warnings.push(format!(
                "retry.multiplier {} is below 1.0: backoff will shrink between attempts",
                self.retry.multiplier
            ));
        }
        if self.commit.author_email.is_empty() || !self.commit.author_email.contains('@') {
            warnings.push(format!(
                "commit.author_email '{}' does not look like an email address",
                self.commit.author_email
            ));
        }
        if self.run.max_parallel == 0 {
            warnings.push("run.max_parallel is 0: pipelines are not capped".to_string());
        }

        warnings
    }
}

/// Runtime configuration: the parsed file plus environment and CLI overrides.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub project_dir: PathBuf,
    pub config_dir: PathBuf,
    pub toml: FleetToml,
    pub verbose: bool,
    pub dry_run: bool,
    cli_tasks_file: Option<PathBuf>,
    cli_max_parallel: Option<usize>,
}

impl FleetConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let config_dir = project_dir.join(CONFIG_DIR);
        let toml = FleetToml::load_or_default(&config_dir)?;

        Ok(Self {
            project_dir,
            config_dir,
            toml,
            verbose: false,
            dry_run: false,
            cli_tasks_file: None,
            cli_max_parallel: None,
        })
    }

    pub fn with_cli_args(
        project_dir: PathBuf,
        verbose: bool,
        tasks_file: Option<PathBuf>,
        max_parallel: Option<usize>,
        dry_run: bool,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        config.cli_tasks_file = tasks_file;
        config.cli_max_parallel = max_parallel;
        config.dry_run = dry_run;
        Ok(config)
    }

    /// Task list path (CLI → file → default), relative to the project dir.
    pub fn tasks_file(&self) -> PathBuf {
        let path = self
            .cli_tasks_file
            .clone()
            .unwrap_or_else(|| self.toml.run.tasks_file.clone());
        self.resolve(path)
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.resolve(self.toml.run.workspace_root.clone())
    }

    /// Concurrency cap (CLI → file); `None` means unbounded.
    pub fn max_parallel(&self) -> Option<usize> {
        match self.cli_max_parallel.unwrap_or(self.toml.run.max_parallel) {
            0 => None,
            n => Some(n),
        }
    }

    pub fn settle_after_fork(&self) -> Duration {
        Duration::from_millis(self.toml.pacing.settle_after_fork_ms)
    }

    pub fn settle_after_commit(&self) -> Duration {
        Duration::from_millis(self.toml.pacing.settle_after_commit_ms)
    }

    pub fn min_mutation_interval(&self) -> Duration {
        Duration::from_millis(self.toml.pacing.min_mutation_interval_ms)
    }

    pub fn pr_title(&self) -> &str {
        self.toml
            .pull_request
            .title
            .as_deref()
            .unwrap_or(&self.toml.commit.title)
    }

    pub fn pr_body(&self) -> &str {
        self.toml
            .pull_request
            .body
            .as_deref()
            .unwrap_or(&self.toml.commit.body)
    }

    /// Read the access token. An absent or empty value is fatal.
    pub fn token(&self) -> Result<String, ConfigError> {
        let var = &self.toml.github.token_env;
        match std::env::var(var) {
            Ok(token) if !token.trim().is_empty() => Ok(token.trim().to_string()),
            _ => Err(ConfigError::MissingCredential { var: var.clone() }),
        }
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }

    fn resolve(&self, path: PathBuf) -> PathBuf {
        if path.is_absolute() {
            path
        } else {
            self.project_dir.join(path)
        }
    }
}

/// Load `.env` from the project directory if present. A missing file is fine.
/// Directory of the rolling log files for `project_dir`.
pub fn log_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(CONFIG_DIR).join("logs")
}

pub fn load_dotenv(project_dir: &Path) {
    let path = project_dir.join(".env");
    if path.exists() {
        if let Err(e) = dotenvy::from_path(&path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to load .env");
        }
    }
}
