//! In-memory platform used by tests.
//!
//! Repositories are maps of branch tips and commit snapshots. Every call is
//! appended to an ordered log so tests can assert on exactly which remote
//! operations a run performed.

use super::{
    CommitDescriptor, FileChanges, Platform, PullRequest, PullRequestDescriptor, RemoteRepo,
    RepoRef,
};
use crate::errors::{ApplyError, PlatformError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

/// One recorded platform call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformCall {
    CurrentActor,
    GetRepository { repo: String },
    CreateFork { repo: String },
    BranchTip { repo: String, branch: String },
    FileContent { repo: String, revision: String, path: String },
    CreateCommit { repo: String, branch: String, base: String },
    CreatePullRequest { repo: String, head: String },
    ListPullRequests { repo: String, author: String },
}

impl PlatformCall {
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            PlatformCall::CreateFork { .. }
                | PlatformCall::CreateCommit { .. }
                | PlatformCall::CreatePullRequest { .. }
        )
    }
}

/// A commit stored by the fake.
#[derive(Debug, Clone)]
pub struct FakeCommit {
    pub sha: String,
    pub parent: Option<String>,
    pub title: String,
    pub author: String,
    pub files: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
struct FakeRepo {
    default_branch: String,
    parent: Option<RepoRef>,
    branches: HashMap<String, String>,
    commits: HashMap<String, FakeCommit>,
    pulls: Vec<PullRequest>,
}

impl FakeRepo {
    fn remote(&self, full_name: &str) -> RemoteRepo {
        let (owner, name) = full_name.split_once('/').unwrap_or((full_name, ""));
        RemoteRepo {
            owner: owner.to_string(),
            name: name.to_string(),
            default_branch: self.default_branch.clone(),
            parent: self.parent.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct FakeState {
    repos: HashMap<String, FakeRepo>,
    calls: Vec<PlatformCall>,
    next_sha: u64,
    next_pr: u64,
    fail_fork: HashSet<String>,
    fail_commit: HashMap<String, ApplyError>,
    transient_commit_failures: HashMap<String, u32>,
    fail_pull_request: HashSet<String>,
    fail_file_content: HashSet<String>,
}

impl FakeState {
    fn mint_sha(&mut self) -> String {
        self.next_sha += 1;
        format!("{:040x}", self.next_sha)
    }
}

/// In-memory [`Platform`] with an ordered call log and failure injection.
#[derive(Debug)]
pub struct FakePlatform {
    actor: String,
    state: Mutex<FakeState>,
}

fn key(owner: &str, name: &str) -> String {
    format!("{}/{}", owner, name)
}

impl FakePlatform {
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            state: Mutex::new(FakeState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        // A panic in one test task must not poison assertions in another.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed an upstream repository whose default branch holds `files`.
    pub fn add_repository(&self, owner: &str, name: &str, default_branch: &str, files: &[(&str, &str)]) {
        let mut state = self.state();
        let sha = state.mint_sha();
        let commit = FakeCommit {
            sha: sha.clone(),
            parent: None,
            title: "initial".to_string(),
            author: owner.to_string(),
            files: files
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect(),
        };
        let repo = FakeRepo {
            default_branch: default_branch.to_string(),
            parent: None,
            branches: HashMap::from([(default_branch.to_string(), sha.clone())]),
            commits: HashMap::from([(sha, commit)]),
            pulls: Vec::new(),
        };
        state.repos.insert(key(owner, name), repo);
    }

    /// Move the tip of `branch` without going through `create_commit`, as if
    /// someone else pushed.
    pub fn push_external_commit(&self, owner: &str, name: &str, branch: &str, path: &str, contents: &str) {
        let mut state = self.state();
        let sha = state.mint_sha();
        let Some(repo) = state.repos.get_mut(&key(owner, name)) else {
            return;
        };
        let parent = repo.branches.get(branch).cloned();
        let mut files = parent
            .as_ref()
            .and_then(|p| repo.commits.get(p))
            .map(|c| c.files.clone())
            .unwrap_or_default();
        files.insert(path.to_string(), contents.to_string());
        repo.commits.insert(
            sha.clone(),
            FakeCommit {
                sha: sha.clone(),
                parent,
                title: "external".to_string(),
                author: "someone-else".to_string(),
                files,
            },
        );
        repo.branches.insert(branch.to_string(), sha);
    }

    pub fn fail_fork(&self, owner: &str, name: &str) {
        self.state().fail_fork.insert(key(owner, name));
    }

    /// Make every commit to the fork of `name` fail with `err`.
    pub fn fail_commit(&self, fork_owner: &str, name: &str, err: ApplyError) {
        self.state().fail_commit.insert(key(fork_owner, name), err);
    }

    /// Fail the next `times` commits to `fork_owner/name` with a transient error.
    pub fn fail_commit_transiently(&self, fork_owner: &str, name: &str, times: u32) {
        self.state()
            .transient_commit_failures
            .insert(key(fork_owner, name), times);
    }

    pub fn fail_pull_request(&self, owner: &str, name: &str) {
        self.state().fail_pull_request.insert(key(owner, name));
    }

    pub fn fail_file_content(&self, owner: &str, name: &str) {
        self.state().fail_file_content.insert(key(owner, name));
    }

    /// Drop every injected failure.
    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.fail_fork.clear();
        state.fail_commit.clear();
        state.transient_commit_failures.clear();
        state.fail_pull_request.clear();
        state.fail_file_content.clear();
    }

    pub fn calls(&self) -> Vec<PlatformCall> {
        self.state().calls.clone()
    }

    pub fn count_calls(&self, pred: impl Fn(&PlatformCall) -> bool) -> usize {
        self.state().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn repository_exists(&self, owner: &str, name: &str) -> bool {
        self.state().repos.contains_key(&key(owner, name))
    }

    pub fn branch_head(&self, owner: &str, name: &str, branch: &str) -> Option<String> {
        self.state()
            .repos
            .get(&key(owner, name))
            .and_then(|r| r.branches.get(branch).cloned())
    }

    /// Content of `path` at the tip of `branch`.
    pub fn file_at(&self, owner: &str, name: &str, branch: &str, path: &str) -> Option<String> {
        let state = self.state();
        let repo = state.repos.get(&key(owner, name))?;
        let tip = repo.branches.get(branch)?;
        repo.commits.get(tip)?.files.get(path).cloned()
    }

    pub fn commit(&self, owner: &str, name: &str, sha: &str) -> Option<FakeCommit> {
        self.state()
            .repos
            .get(&key(owner, name))
            .and_then(|r| r.commits.get(sha).cloned())
    }

    pub fn pull_requests(&self, owner: &str, name: &str) -> Vec<PullRequest> {
        self.state()
            .repos
            .get(&key(owner, name))
            .map(|r| r.pulls.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Platform for FakePlatform {
    async fn current_actor(&self) -> Result<String, PlatformError> {
        self.state().calls.push(PlatformCall::CurrentActor);
        Ok(self.actor.clone())
    }

    async fn get_repository(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<Option<RemoteRepo>, PlatformError> {
        let full = key(owner, name);
        let mut state = self.state();
        state.calls.push(PlatformCall::GetRepository { repo: full.clone() });
        Ok(state.repos.get(&full).map(|r| r.remote(&full)))
    }

    async fn create_fork(&self, owner: &str, name: &str) -> Result<RemoteRepo, PlatformError> {
        let upstream = key(owner, name);
        let fork = key(&self.actor, name);
        let mut state = self.state();
        state.calls.push(PlatformCall::CreateFork { repo: upstream.clone() });

        if state.fail_fork.contains(&upstream) {
            return Err(PlatformError::Status {
                method: "POST",
                url: format!("/repos/{}/forks", upstream),
                status: 403,
                message: "fork creation forbidden".to_string(),
            });
        }
        if let Some(existing) = state.repos.get(&fork) {
            return Ok(existing.remote(&fork));
        }
        let Some(source) = state.repos.get(&upstream) else {
            return Err(PlatformError::Status {
                method: "POST",
                url: format!("/repos/{}/forks", upstream),
                status: 404,
                message: "Not Found".to_string(),
            });
        };

        // Default branch only.
        let default_branch = source.default_branch.clone();
        let mut copy = FakeRepo {
            default_branch: default_branch.clone(),
            parent: Some(source.remote(&upstream).to_ref()),
            branches: HashMap::new(),
            commits: source.commits.clone(),
            pulls: Vec::new(),
        };
        if let Some(tip) = source.branches.get(&default_branch) {
            copy.branches.insert(default_branch, tip.clone());
        }
        let remote = copy.remote(&fork);
        state.repos.insert(fork, copy);
        Ok(remote)
    }

    async fn branch_tip(&self, owner: &str, name: &str, branch: &str) -> Result<String, PlatformError> {
        let full = key(owner, name);
        let mut state = self.state();
        state.calls.push(PlatformCall::BranchTip {
            repo: full.clone(),
            branch: branch.to_string(),
        });
        state
            .repos
            .get(&full)
            .and_then(|r| r.branches.get(branch).cloned())
            .ok_or_else(|| PlatformError::GraphQl(format!("no branch {} on {}", branch, full)))
    }

    async fn file_content(
        &self,
        owner: &str,
        name: &str,
        revision: &str,
        path: &str,
    ) -> Result<Option<String>, PlatformError> {
        let full = key(owner, name);
        let mut state = self.state();
        state.calls.push(PlatformCall::FileContent {
            repo: full.clone(),
            revision: revision.to_string(),
            path: path.to_string(),
        });
        if state.fail_file_content.contains(&full) {
            return Err(PlatformError::Status {
                method: "POST",
                url: "/graphql".to_string(),
                status: 502,
                message: "Bad Gateway".to_string(),
            });
        }
        let Some(repo) = state.repos.get(&full) else {
            return Ok(None);
        };
        let sha = repo
            .branches
            .get(revision)
            .cloned()
            .unwrap_or_else(|| revision.to_string());
        Ok(repo
            .commits
            .get(&sha)
            .and_then(|c| c.files.get(path).cloned()))
    }

    async fn create_commit(
        &self,
        repo: &RepoRef,
        branch: &str,
        changes: &FileChanges,
        descriptor: &CommitDescriptor,
    ) -> Result<String, ApplyError> {
        let full = key(&repo.owner, &repo.name);
        let mut state = self.state();
        state.calls.push(PlatformCall::CreateCommit {
            repo: full.clone(),
            branch: branch.to_string(),
            base: descriptor.base_revision.clone(),
        });

        if let Some(err) = state.fail_commit.get(&full) {
            return Err(err.clone());
        }
        if let Some(remaining) = state.transient_commit_failures.get_mut(&full)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(ApplyError::Other("503 Service Unavailable".to_string()));
        }

        let sha = state.mint_sha();
        let Some(target) = state.repos.get_mut(&full) else {
            return Err(ApplyError::Other(format!("repository {} not found", full)));
        };
        let tip = target.branches.get(branch).cloned();
        if tip.as_deref() != Some(descriptor.base_revision.as_str()) {
            return Err(ApplyError::StaleBase(format!(
                "Update is not a fast forward: {} moved past {}",
                branch, descriptor.base_revision
            )));
        }

        let mut files = target
            .commits
            .get(&descriptor.base_revision)
            .map(|c| c.files.clone())
            .unwrap_or_default();
        for path in &changes.deletions {
            files.remove(path);
        }
        for addition in &changes.additions {
            files.insert(addition.path.clone(), addition.contents.clone());
        }
        target.commits.insert(
            sha.clone(),
            FakeCommit {
                sha: sha.clone(),
                parent: tip,
                title: descriptor.title.clone(),
                author: descriptor.author.name.clone(),
                files,
            },
        );
        target.branches.insert(branch.to_string(), sha.clone());
        Ok(sha)
    }

    async fn create_pull_request(
        &self,
        owner: &str,
        name: &str,
        descriptor: &PullRequestDescriptor,
    ) -> Result<PullRequest, PlatformError> {
        let full = key(owner, name);
        let mut state = self.state();
        state.calls.push(PlatformCall::CreatePullRequest {
            repo: full.clone(),
            head: descriptor.head.clone(),
        });
        if state.fail_pull_request.contains(&full) {
            return Err(PlatformError::Status {
                method: "POST",
                url: format!("/repos/{}/pulls", full),
                status: 422,
                message: "Validation Failed".to_string(),
            });
        }
        state.next_pr += 1;
        let number = state.next_pr;
        let author = self.actor.clone();
        let Some(repo) = state.repos.get_mut(&full) else {
            return Err(PlatformError::Status {
                method: "POST",
                url: format!("/repos/{}/pulls", full),
                status: 404,
                message: "Not Found".to_string(),
            });
        };
        let pr = PullRequest {
            number,
            html_url: format!("https://github.com/{}/pull/{}", full, number),
            author,
            state: "open".to_string(),
        };
        repo.pulls.push(pr.clone());
        Ok(pr)
    }

    async fn list_pull_requests(
        &self,
        owner: &str,
        name: &str,
        author: &str,
    ) -> Result<Vec<PullRequest>, PlatformError> {
        let full = key(owner, name);
        let mut state = self.state();
        state.calls.push(PlatformCall::ListPullRequests {
            repo: full.clone(),
            author: author.to_string(),
        });
        Ok(state
            .repos
            .get(&full)
            .map(|r| {
                r.pulls
                    .iter()
                    .filter(|p| p.author == author && p.state == "open")
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
