//! Remote patch application.
//!
//! Every hunk of every file is replayed, in patch order, against the file's
//! content at the branch tip. The resulting file set becomes exactly one
//! remote commit anchored at that tip. Hunks move through
//! `Queued -> Applying -> Applied`, or end in `Failed`.

use crate::config::CommitSection;
use crate::errors::{ApplyError, PlatformError};
use crate::pacing::{Pacer, RetryPolicy, SettleKind};
use crate::patch::{FileMode, FileOp, PatchFile, already_applied, apply_hunks};
use crate::platform::{CommitDescriptor, FileAddition, FileChanges, Identity, Platform, RepoRef};
use chrono::Utc;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Unsupported,
    Transient,
}

impl From<&ApplyError> for FailureKind {
    fn from(err: &ApplyError) -> Self {
        if err.is_unsupported() {
            FailureKind::Unsupported
        } else {
            FailureKind::Transient
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "kind")]
pub enum HunkState {
    Queued,
    Applying,
    Applied,
    Failed(FailureKind),
}

/// Progress of one hunk. Files without hunks (pure deletions, empty new
/// files) are tracked as a single unit with `hunk: None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HunkProgress {
    pub path: String,
    pub hunk: Option<usize>,
    pub state: HunkState,
}

/// Fixed identity and message of migration commits.
#[derive(Debug, Clone)]
pub struct CommitTemplate {
    pub author: Identity,
    pub committer: Identity,
    pub title: String,
    pub body: String,
}

impl CommitTemplate {
    pub fn from_config(section: &CommitSection) -> Self {
        let identity = Identity {
            name: section.author_name.clone(),
            email: section.author_email.clone(),
        };
        Self {
            author: identity.clone(),
            committer: identity,
            title: section.title.clone(),
            body: section.body.clone(),
        }
    }

    fn descriptor(&self, base_revision: String) -> CommitDescriptor {
        let now = Utc::now();
        CommitDescriptor {
            author: self.author.clone(),
            committer: self.committer.clone(),
            author_date: now,
            committer_date: now,
            title: self.title.clone(),
            body: self.body.clone(),
            base_revision,
        }
    }
}

impl Default for CommitTemplate {
    fn default() -> Self {
        Self::from_config(&CommitSection::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedCommit {
    /// The new commit, or the base when the branch already held every change.
    pub sha: String,
    pub base: String,
    pub files: usize,
    pub created: bool,
}

/// Reject what the commit API cannot express.
fn check_supported(file: &PatchFile) -> Result<(), ApplyError> {
    let path = file.path();
    if file.binary {
        return Err(ApplyError::Unsupported(format!("binary diff for {}", path)));
    }
    match &file.op {
        FileOp::Copy { from } => {
            return Err(ApplyError::Unsupported(format!("copy {} -> {}", from, path)));
        }
        FileOp::TypeChange => {
            return Err(ApplyError::Unsupported(format!("type change of {}", path)));
        }
        _ => {}
    }
    if file.old_mode != FileMode::Absent
        && file.new_mode != FileMode::Absent
        && file.old_mode != file.new_mode
    {
        return Err(ApplyError::Unsupported(format!(
            "mode change {} -> {} on {}",
            file.old_mode.as_git_mode().unwrap_or("?"),
            file.new_mode.as_git_mode().unwrap_or("?"),
            path
        )));
    }
    if matches!(file.new_mode, FileMode::Symlink | FileMode::Submodule) {
        return Err(ApplyError::Unsupported(format!(
            "{} entry at {}",
            if file.new_mode == FileMode::Symlink { "symlink" } else { "submodule" },
            path
        )));
    }
    Ok(())
}

/// Replays parsed patch files onto a remote branch as a single commit.
pub struct RemotePatchApplier<'a> {
    platform: &'a dyn Platform,
    pacer: &'a Pacer,
    retry: &'a RetryPolicy,
    progress: Vec<HunkProgress>,
}

impl<'a> RemotePatchApplier<'a> {
    pub fn new(platform: &'a dyn Platform, pacer: &'a Pacer, retry: &'a RetryPolicy) -> Self {
        Self {
            platform,
            pacer,
            retry,
            progress: Vec::new(),
        }
    }

    pub fn progress(&self) -> &[HunkProgress] {
        &self.progress
    }

    fn queue(&mut self, files: &[PatchFile]) {
        self.progress = files
            .iter()
            .flat_map(|file| {
                let path = file.path().to_string();
                let units: Vec<Option<usize>> = if file.hunks.is_empty() {
                    vec![None]
                } else {
                    (0..file.hunks.len()).map(Some).collect()
                };
                units.into_iter().map(move |hunk| HunkProgress {
                    path: path.clone(),
                    hunk,
                    state: HunkState::Queued,
                })
            })
            .collect();
    }

    /// Indices into `progress` belonging to file number `file_idx`.
    fn units_of(&self, files: &[PatchFile], file_idx: usize) -> std::ops::Range<usize> {
        let start: usize = files[..file_idx].iter().map(|f| f.hunks.len().max(1)).sum();
        start..start + files[file_idx].hunks.len().max(1)
    }

    fn set(&mut self, range: std::ops::Range<usize>, state: HunkState) {
        for unit in &mut self.progress[range] {
            unit.state = state;
        }
    }

    async fn read_at_base(&self, target: &RepoRef, base: &str, path: &str) -> Result<String, ApplyError> {
        let content = self
            .retry
            .run(self.pacer.clock().as_ref(), PlatformError::is_transient, || {
                self.platform
                    .file_content(&target.owner, &target.name, base, path)
            })
            .await?;
        content.ok_or_else(|| ApplyError::Other(format!("{} does not exist at {}", path, base)))
    }

    /// Apply `files` in order to `branch` of `target` and create one commit.
    pub async fn apply(
        &mut self,
        target: &RepoRef,
        branch: &str,
        files: &[PatchFile],
        template: &CommitTemplate,
    ) -> Result<AppliedCommit, ApplyError> {
        self.queue(files);

        let clock = self.pacer.clock();
        let base = self
            .retry
            .run(clock.as_ref(), PlatformError::is_transient, || {
                self.platform.branch_tip(&target.owner, &target.name, branch)
            })
            .await?;
        tracing::info!(stage = "apply", base = %base, files = files.len(), "applying patch");

        let mut changes = FileChanges::default();
        let mut present = 0usize;
        for (idx, file) in files.iter().enumerate() {
            let units = self.units_of(files, idx);
            if let Err(err) = check_supported(file) {
                self.set(units.start..units.start + 1, HunkState::Failed(FailureKind::Unsupported));
                tracing::warn!(stage = "apply", path = file.path(), error = %err, "unsupported hunk");
                return Err(err);
            }

            let path = file.path().to_string();
            match &file.op {
                FileOp::Delete => {
                    self.set(units.clone(), HunkState::Applying);
                    changes.deletions.push(file.old_path.clone().unwrap_or(path));
                    self.set(units, HunkState::Applied);
                    continue;
                }
                FileOp::Rename { from } => changes.deletions.push(from.clone()),
                _ => {}
            }

            let original = match &file.op {
                FileOp::Add => Ok(String::new()),
                FileOp::Rename { from } => self.read_at_base(target, &base, from).await,
                _ => self.read_at_base(target, &base, &path).await,
            };
            let original = match original {
                Ok(text) => text,
                Err(err) => {
                    self.set(units.start..units.start + 1, HunkState::Failed(FailureKind::from(&err)));
                    return Err(err);
                }
            };

            let contents = if file.hunks.is_empty() {
                self.set(units.clone(), HunkState::Applying);
                self.set(units, HunkState::Applied);
                original
            } else {
                let result = apply_hunks(&original, &file.hunks);
                // A rerun after a commit landed but publishing failed.
                if result.is_err() && already_applied(&original, &file.hunks) {
                    tracing::info!(stage = "apply", path = %path, "branch already carries this change");
                    self.set(units, HunkState::Applied);
                    present += 1;
                    continue;
                }
                let failed_at = result.as_ref().err().map(|c| c.hunk);
                for (offset, unit) in units.clone().enumerate() {
                    self.progress[unit].state = HunkState::Applying;
                    if Some(offset) == failed_at {
                        self.progress[unit].state = HunkState::Failed(FailureKind::Transient);
                        break;
                    }
                    self.progress[unit].state = HunkState::Applied;
                }
                result.map_err(|conflict| ApplyError::Other(format!("{}: {}", path, conflict)))?
            };

            changes.additions.push(FileAddition {
                path,
                contents,
                mode: file.new_mode,
            });
        }

        if changes.is_empty() {
            if present > 0 {
                return Ok(AppliedCommit {
                    sha: base.clone(),
                    base,
                    files: 0,
                    created: false,
                });
            }
            return Err(ApplyError::Other("patch produced no file changes".to_string()));
        }

        let descriptor = template.descriptor(base.clone());
        let platform = self.platform;
        let pacer = self.pacer;
        let changes_ref = &changes;
        let descriptor_ref = &descriptor;
        let sha = self
            .retry
            .run(clock.as_ref(), ApplyError::is_retryable, || async move {
                pacer.before_mutation().await;
                platform
                    .create_commit(target, branch, changes_ref, descriptor_ref)
                    .await
            })
            .await?;
        tracing::info!(stage = "apply", commit = %sha, "created remote commit");
        self.pacer.settle(SettleKind::Commit).await;

        Ok(AppliedCommit {
            sha,
            base,
            files: changes.additions.len() + changes.deletions.len(),
            created: true,
        })
    }
}
