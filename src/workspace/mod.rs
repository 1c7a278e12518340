//! Local workspaces: one git working copy per repository under the
//! workspace root, laid out as `<root>/<owner>/<name>`.
//!
//! All operations here are blocking; the pipeline runs them on the blocking
//! thread pool.

pub mod git;

use crate::platform::Identity;
use crate::task::RepositoryTask;
use anyhow::{Context, Result};
use git::GitWorkspace;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Commit message of the local baseline commit.
pub const BASELINE_MESSAGE: &str = "taken from source";

/// A ready workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceHandle {
    pub path: PathBuf,
    /// `false` when an existing workspace was reused.
    pub initialized: bool,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The working tree does not differ from the baseline.
    #[error("working tree has no changes against the baseline")]
    Empty,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Creates, baselines and snapshots workspaces.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    ci_dir: String,
    patch_file: String,
    identity: Identity,
}

impl WorkspaceManager {
    pub fn new(root: PathBuf, ci_dir: impl Into<String>, patch_file: impl Into<String>, identity: Identity) -> Self {
        Self {
            root,
            ci_dir: ci_dir.into(),
            patch_file: patch_file.into(),
            identity,
        }
    }

    pub fn path_for(&self, task: &RepositoryTask) -> PathBuf {
        self.root.join(&task.owner).join(&task.name)
    }

    pub fn patch_path(&self, workspace: &Path) -> PathBuf {
        workspace.join(&self.patch_file)
    }

    /// Initialize the workspace with an `origin` remote pointing at the
    /// upstream, or reuse it unchanged when `.git` already exists. Missing CI
    /// directories are created either way.
    pub fn ensure_workspace(&self, task: &RepositoryTask) -> Result<WorkspaceHandle> {
        let path = self.path_for(task);
        fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create workspace {}", path.display()))?;

        let initialized = if path.join(".git").exists() {
            GitWorkspace::open(&path)?;
            false
        } else {
            let remote = format!("git@github.com:{}/{}.git", task.owner, task.name);
            GitWorkspace::init(&path, &remote)?;
            true
        };

        let ci = path.join(&self.ci_dir);
        fs::create_dir_all(&ci)
            .with_context(|| format!("Failed to create {}", ci.display()))?;
        if let Some(parent) = Path::new(&task.relative_path).parent() {
            fs::create_dir_all(path.join(parent))
                .with_context(|| format!("Failed to create directories for {}", task.relative_path))?;
        }

        Ok(WorkspaceHandle { path, initialized })
    }

    /// Write the upstream content of the target file and commit it as the
    /// baseline. Returns the new commit id, or `None` when the workspace
    /// already held exactly this content.
    pub fn materialize_baseline(
        &self,
        workspace: &WorkspaceHandle,
        relative_path: &str,
        contents: &str,
    ) -> Result<Option<String>> {
        let file = workspace.path.join(relative_path);
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&file, contents)
            .with_context(|| format!("Failed to write {}", file.display()))?;

        let git = GitWorkspace::open(&workspace.path)?;
        git.commit_all(BASELINE_MESSAGE, &self.identity)
    }

    /// Diff the working tree against the baseline into the patch artifact,
    /// then restore the working tree. The workspace never keeps uncommitted
    /// changes past this call, whether or not it succeeds.
    pub fn snapshot_diff(&self, workspace: &WorkspaceHandle) -> Result<PathBuf, SnapshotError> {
        let git = GitWorkspace::open(&workspace.path)?;
        let diff = git.diff_against_head();
        let restored = git.restore_clean();
        let diff = diff?;
        restored?;

        if diff.iter().all(u8::is_ascii_whitespace) {
            return Err(SnapshotError::Empty);
        }
        let artifact = self.patch_path(&workspace.path);
        fs::write(&artifact, &diff)
            .with_context(|| format!("Failed to write patch artifact {}", artifact.display()))?;
        Ok(artifact)
    }

    /// Read the patch artifact and remove it from the workspace.
    pub fn take_patch(&self, artifact: &Path) -> Result<Vec<u8>> {
        let bytes = fs::read(artifact)
            .with_context(|| format!("Failed to read patch artifact {}", artifact.display()))?;
        fs::remove_file(artifact)
            .with_context(|| format!("Failed to remove patch artifact {}", artifact.display()))?;
        Ok(bytes)
    }
}
