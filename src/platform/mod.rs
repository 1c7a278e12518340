//! Remote hosting platform abstraction.
//!
//! The pipeline only talks to the platform through [`Platform`]. The
//! production adapter is [`GitHubClient`]; [`FakePlatform`] is an in-memory
//! stand-in that records every call.

pub mod fake;
pub mod github;

pub use fake::{FakePlatform, PlatformCall};
pub use github::GitHubClient;

use crate::errors::{ApplyError, PlatformError};
use crate::patch::FileMode;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Repository metadata (subset of fields we care about).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRepo {
    pub owner: String,
    pub name: String,
    pub default_branch: String,
    /// Set when this repository is a fork: the upstream it was forked from.
    pub parent: Option<RepoRef>,
}

impl RemoteRepo {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    pub fn to_ref(&self) -> RepoRef {
        RepoRef {
            owner: self.owner.clone(),
            name: self.name.clone(),
            default_branch: self.default_branch.clone(),
        }
    }
}

/// Lightweight pointer to a repository and its default branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
    pub default_branch: String,
}

/// Name and email of a commit author or committer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

/// Fully determines the new remote commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitDescriptor {
    pub author: Identity,
    pub committer: Identity,
    pub author_date: DateTime<Utc>,
    pub committer_date: DateTime<Utc>,
    pub title: String,
    pub body: String,
    /// Must equal the branch tip at apply time or the commit is rejected.
    pub base_revision: String,
}

/// One file's final content in a remote commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAddition {
    pub path: String,
    pub contents: String,
    pub mode: FileMode,
}

/// The tree changes a remote commit carries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChanges {
    pub additions: Vec<FileAddition>,
    pub deletions: Vec<String>,
}

impl FileChanges {
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.deletions.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestDescriptor {
    pub title: String,
    pub body: String,
    /// Upstream default branch.
    pub base: String,
    /// `forkOwner:forkBranch`.
    pub head: String,
    pub head_repo: String,
    pub draft: bool,
    pub maintainer_can_modify: bool,
}

/// A pull request as returned by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub html_url: String,
    pub author: String,
    pub state: String,
}

/// Remote operations the pipeline consumes.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Login of the authenticated actor.
    async fn current_actor(&self) -> Result<String, PlatformError>;

    /// Look a repository up; `Ok(None)` when it does not exist.
    async fn get_repository(&self, owner: &str, name: &str)
    -> Result<Option<RemoteRepo>, PlatformError>;

    /// Fork `owner/name` into the actor's account, default branch only.
    async fn create_fork(&self, owner: &str, name: &str) -> Result<RemoteRepo, PlatformError>;

    /// Current tip revision of `branch`.
    async fn branch_tip(&self, owner: &str, name: &str, branch: &str)
    -> Result<String, PlatformError>;

    /// Text of `path` at `revision`; `Ok(None)` when the path does not exist.
    async fn file_content(
        &self,
        owner: &str,
        name: &str,
        revision: &str,
        path: &str,
    ) -> Result<Option<String>, PlatformError>;

    /// Create one commit on `branch` anchored at `descriptor.base_revision`.
    /// Returns the new commit's id.
    async fn create_commit(
        &self,
        repo: &RepoRef,
        branch: &str,
        changes: &FileChanges,
        descriptor: &CommitDescriptor,
    ) -> Result<String, ApplyError>;

    async fn create_pull_request(
        &self,
        owner: &str,
        name: &str,
        descriptor: &PullRequestDescriptor,
    ) -> Result<PullRequest, PlatformError>;

    /// Open pull requests on `owner/name` authored by `author`.
    async fn list_pull_requests(
        &self,
        owner: &str,
        name: &str,
        author: &str,
    ) -> Result<Vec<PullRequest>, PlatformError>;
}
