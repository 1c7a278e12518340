//! Per-repository migration pipeline.
//!
//! One [`Pipeline::run`] drives a single repository through
//! preflight, fork, workspace, rewrite, diff, parse, apply and publish, in
//! that order. Each stage checks externally observable state first (open
//! pull request, existing fork, existing `.git`) so a rerun resumes instead
//! of redoing work. Any stage failure ends the run with a [`StageError`]
//! carried in the returned [`Outcome`]; nothing is raised to the caller.

pub mod apply;
pub mod fork;
pub mod publish;

pub use apply::{CommitTemplate, FailureKind, HunkProgress, HunkState, RemotePatchApplier};
pub use fork::{ForkHandle, ensure_fork};
pub use publish::{Publication, PullRequestTemplate};

use crate::errors::{PlatformError, Stage, StageError, StageErrorKind};
use crate::pacing::{Pacer, RetryPolicy};
use crate::patch::{FileOp, PatchFile, parse_patch};
use crate::platform::{Platform, RemoteRepo};
use crate::rewrite::{RewriteOutcome, Rewriter};
use crate::task::{RepoKey, RepositoryTask};
use crate::workspace::{SnapshotError, WorkspaceHandle, WorkspaceManager};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Instrument;

/// How far a repository got. Not persisted: a rerun rediscovers it from
/// remote and on-disk state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryState {
    Unclaimed,
    Forked,
    WorkspaceReady,
    Mutated,
    Diffed,
    RemoteApplied,
    Published,
    Failed(Stage),
}

/// Summary of one file in a parsed patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSummary {
    pub path: String,
    pub op: String,
    pub hunks: usize,
    pub lines_added: usize,
    pub lines_removed: usize,
}

impl From<&PatchFile> for PatchSummary {
    fn from(file: &PatchFile) -> Self {
        let op = match &file.op {
            FileOp::Add => "add".to_string(),
            FileOp::Modify => "modify".to_string(),
            FileOp::Delete => "delete".to_string(),
            FileOp::Rename { from } => format!("rename from {}", from),
            FileOp::Copy { from } => format!("copy from {}", from),
            FileOp::TypeChange => "typechange".to_string(),
        };
        Self {
            path: file.path().to_string(),
            op,
            hunks: file.hunks.len(),
            lines_added: file.lines_added(),
            lines_removed: file.lines_removed(),
        }
    }
}

/// Final result of one repository's pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Published {
        pr_url: String,
        pr_number: u64,
        commit: String,
    },
    /// An open pull request by the actor already existed.
    AlreadyPublished { pr_url: String, pr_number: u64 },
    /// The rewrite found nothing to change.
    NothingToDo,
    /// Dry run: the patch that would have been applied.
    DryRun { files: Vec<PatchSummary> },
    Failed(StageError),
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Published { .. } => "published",
            Outcome::AlreadyPublished { .. } => "already-published",
            Outcome::NothingToDo => "rewrite-noop",
            Outcome::DryRun { .. } => "dry-run",
            Outcome::Failed(_) => "failed",
        }
    }
}

/// What one run of the pipeline did.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub outcome: Outcome,
    pub state: RepositoryState,
    pub fork_created: bool,
    pub workspace_initialized: bool,
}

/// Run `f` on the blocking pool. A panic inside becomes an error.
async fn blocking<T, E, F>(f: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<anyhow::Error> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(join) => Err(anyhow::anyhow!("blocking task failed: {}", join).into()),
    }
}

fn failed(key: &RepoKey, stage: Stage, cause: impl std::fmt::Display) -> StageError {
    StageError::new(key.as_str(), stage, StageErrorKind::Failed, cause)
}

/// Shared, immutable collaborators of every pipeline in a run.
pub struct Pipeline {
    platform: Arc<dyn Platform>,
    workspaces: WorkspaceManager,
    rewriter: Arc<dyn Rewriter>,
    pacer: Arc<Pacer>,
    retry: RetryPolicy,
    actor: String,
    commit: CommitTemplate,
    pull_request: PullRequestTemplate,
    dry_run: bool,
}

impl Pipeline {
    pub fn new(
        platform: Arc<dyn Platform>,
        workspaces: WorkspaceManager,
        rewriter: Arc<dyn Rewriter>,
        actor: impl Into<String>,
    ) -> Self {
        let commit = CommitTemplate::default();
        let pull_request = PullRequestTemplate {
            title: commit.title.clone(),
            body: commit.body.clone(),
            draft: false,
            maintainer_can_modify: true,
        };
        Self {
            platform,
            workspaces,
            rewriter,
            pacer: Arc::new(Pacer::immediate()),
            retry: RetryPolicy::default(),
            actor: actor.into(),
            commit,
            pull_request,
            dry_run: false,
        }
    }

    pub fn with_pacer(mut self, pacer: Arc<Pacer>) -> Self {
        self.pacer = pacer;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_commit(mut self, commit: CommitTemplate) -> Self {
        self.commit = commit;
        self
    }

    pub fn with_pull_request(mut self, pull_request: PullRequestTemplate) -> Self {
        self.pull_request = pull_request;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Drive `task` through every stage. Never fails: errors are part of the result.
    pub async fn run(&self, task: &RepositoryTask) -> PipelineResult {
        let span = tracing::info_span!("repo", repo = %task.key());
        let mut result = PipelineResult {
            outcome: Outcome::NothingToDo,
            state: RepositoryState::Unclaimed,
            fork_created: false,
            workspace_initialized: false,
        };
        result.outcome = match self.run_stages(task, &mut result).instrument(span).await {
            Ok(outcome) => outcome,
            Err(err) => {
                result.state = RepositoryState::Failed(err.stage);
                Outcome::Failed(err)
            }
        };
        result
    }

    async fn run_stages(
        &self,
        task: &RepositoryTask,
        progress: &mut PipelineResult,
    ) -> Result<Outcome, StageError> {
        let key = task.key();
        let platform = self.platform.as_ref();

        tracing::info!(stage = "preflight", "looking up upstream");
        let upstream = platform
            .get_repository(&task.owner, &task.name)
            .await
            .map_err(|e| failed(&key, Stage::Preflight, e))?
            .ok_or_else(|| failed(&key, Stage::Preflight, "upstream repository not found"))?;
        if let Some(pr) = publish::find_existing(platform, &upstream, &self.actor)
            .await
            .map_err(|e| failed(&key, Stage::Preflight, e))?
        {
            tracing::info!(stage = "preflight", pr = %pr.html_url, "pull request already open, skipping");
            progress.state = RepositoryState::Published;
            return Ok(Outcome::AlreadyPublished {
                pr_url: pr.html_url,
                pr_number: pr.number,
            });
        }

        let fork = ensure_fork(platform, &self.pacer, &self.actor, &upstream, self.dry_run)
            .await
            .map_err(|e| StageError::failed(key.as_str(), Stage::Fork, &e))?;
        progress.fork_created = fork.as_ref().is_some_and(|f| f.created);
        progress.state = RepositoryState::Forked;

        tracing::info!(stage = "workspace", "preparing workspace");
        let workspace = self
            .prepare_workspace(task, &upstream)
            .await
            .map_err(|e| StageError::failed(key.as_str(), Stage::Workspace, &e))?;
        progress.workspace_initialized = workspace.initialized;
        progress.state = RepositoryState::WorkspaceReady;

        tracing::info!(stage = "rewrite", "rewriting workspace");
        let rewriter = Arc::clone(&self.rewriter);
        let ws_path = workspace.path.clone();
        let target = task
            .has_target_file()
            .then(|| PathBuf::from(&task.relative_path));
        let rewritten = blocking(move || rewriter.rewrite(&ws_path, target.as_deref()))
            .await
            .map_err(|e| StageError::failed(key.as_str(), Stage::Rewrite, &e))?;
        match rewritten {
            RewriteOutcome::NothingToDo => {
                tracing::info!(stage = "rewrite", "marker not found, nothing to do");
                return Ok(Outcome::NothingToDo);
            }
            RewriteOutcome::Rewritten(paths) => {
                tracing::debug!(stage = "rewrite", files = paths.len(), "rewrote files");
            }
        }
        progress.state = RepositoryState::Mutated;

        tracing::info!(stage = "diff", "extracting patch");
        let workspaces = self.workspaces.clone();
        let handle = workspace.clone();
        let artifact = blocking(move || workspaces.snapshot_diff(&handle))
            .await
            .map_err(|e| match e {
                SnapshotError::Empty => {
                    StageError::new(key.as_str(), Stage::Diff, StageErrorKind::Empty, SnapshotError::Empty)
                }
                SnapshotError::Failed(err) => StageError::failed(key.as_str(), Stage::Diff, &err),
            })?;

        let workspaces = self.workspaces.clone();
        let files = blocking(move || {
            let bytes = workspaces.take_patch(&artifact)?;
            parse_patch(&bytes)
        })
        .await
        .map_err(|e| StageError::failed(key.as_str(), Stage::Parse, &e))?;
        if files.is_empty() {
            return Err(StageError::new(
                key.as_str(),
                Stage::Diff,
                StageErrorKind::Empty,
                "patch contains no files",
            ));
        }
        progress.state = RepositoryState::Diffed;

        if self.dry_run {
            tracing::info!(stage = "parse", files = files.len(), "dry run: stopping before apply");
            return Ok(Outcome::DryRun {
                files: files.iter().map(PatchSummary::from).collect(),
            });
        }
        let Some(fork) = fork else {
            return Err(failed(&key, Stage::Fork, "no fork available"));
        };

        let mut applier = RemotePatchApplier::new(platform, &self.pacer, &self.retry);
        let commit = applier
            .apply(&fork.repo.to_ref(), &fork.repo.default_branch, &files, &self.commit)
            .await
            .map_err(|e| StageError::new(key.as_str(), Stage::Apply, e.kind(), &e))?;
        if !commit.created {
            tracing::info!(stage = "apply", commit = %commit.sha, "fork already holds the migration commit");
        }
        progress.state = RepositoryState::RemoteApplied;

        let publication = publish::publish(platform, &self.pacer, &upstream, &fork.repo, &self.pull_request)
            .await
            .map_err(|e| failed(&key, Stage::Publish, e))?;
        progress.state = RepositoryState::Published;

        Ok(match publication {
            Publication::Created(pr) => Outcome::Published {
                pr_url: pr.html_url,
                pr_number: pr.number,
                commit: commit.sha,
            },
            Publication::Existing(pr) => Outcome::AlreadyPublished {
                pr_url: pr.html_url,
                pr_number: pr.number,
            },
        })
    }

    /// Ensure the workspace and commit the upstream copy of the target file
    /// as its baseline.
    async fn prepare_workspace(
        &self,
        task: &RepositoryTask,
        upstream: &RemoteRepo,
    ) -> anyhow::Result<WorkspaceHandle> {
        let workspaces = self.workspaces.clone();
        let owned = task.clone();
        let handle = blocking(move || workspaces.ensure_workspace(&owned)).await?;
        if handle.initialized {
            tracing::info!(stage = "workspace", path = %handle.path.display(), "initialized workspace");
        }
        if !task.has_target_file() {
            return Ok(handle);
        }

        let clock = self.pacer.clock();
        let contents = self
            .retry
            .run(clock.as_ref(), PlatformError::is_transient, || {
                self.platform.file_content(
                    &upstream.owner,
                    &upstream.name,
                    &upstream.default_branch,
                    &task.relative_path,
                )
            })
            .await
            .with_context(|| format!("Failed to fetch {} from {}", task.relative_path, upstream.full_name()))?
            .with_context(|| {
                format!(
                    "{} does not exist on {}@{}",
                    task.relative_path,
                    upstream.full_name(),
                    upstream.default_branch
                )
            })?;

        let workspaces = self.workspaces.clone();
        let baseline = handle.clone();
        let relative = task.relative_path.clone();
        if let Some(sha) = blocking(move || workspaces.materialize_baseline(&baseline, &relative, &contents)).await? {
            tracing::debug!(stage = "workspace", commit = %sha, "committed baseline");
        }
        Ok(handle)
    }
}
