use super::{
    CommitDescriptor, FileChanges, Platform, PullRequest, PullRequestDescriptor, RemoteRepo,
    RepoRef,
};
use crate::errors::{ApplyError, PlatformError};
use anyhow::Context;
use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

const USER_AGENT: &str = "fleetpatch";
const PULLS_PER_PAGE: usize = 100;

#[derive(Debug, Deserialize)]
struct ApiUser {
    login: String,
}

/// A GitHub repository (subset of fields we care about).
#[derive(Debug, Deserialize)]
struct ApiRepo {
    name: String,
    owner: ApiUser,
    default_branch: String,
    parent: Option<Box<ApiRepo>>,
}

impl From<ApiRepo> for RemoteRepo {
    fn from(repo: ApiRepo) -> Self {
        RemoteRepo {
            parent: repo.parent.map(|p| RepoRef {
                owner: p.owner.login,
                name: p.name,
                default_branch: p.default_branch,
            }),
            owner: repo.owner.login,
            name: repo.name,
            default_branch: repo.default_branch,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiPull {
    number: u64,
    html_url: String,
    state: String,
    user: ApiUser,
}

impl From<ApiPull> for PullRequest {
    fn from(pr: ApiPull) -> Self {
        PullRequest {
            number: pr.number,
            html_url: pr.html_url,
            author: pr.user.login,
            state: pr.state,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiSha {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct ApiGitCommit {
    tree: ApiSha,
}

#[derive(Debug, Serialize)]
struct TreeEntry<'a> {
    path: &'a str,
    mode: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    /// `Some(None)` serializes as `"sha": null`, which deletes the path.
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<Option<&'a str>>,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct RepositoryData<T> {
    repository: Option<T>,
}

#[derive(Debug, Deserialize)]
struct RefNode {
    #[serde(rename = "ref")]
    git_ref: Option<RefTarget>,
}

#[derive(Debug, Deserialize)]
struct RefTarget {
    target: ApiOid,
}

#[derive(Debug, Deserialize)]
struct ApiOid {
    oid: String,
}

#[derive(Debug, Deserialize)]
struct ObjectNode {
    object: Option<BlobNode>,
}

#[derive(Debug, Deserialize)]
struct BlobNode {
    text: Option<String>,
    #[serde(default, rename = "isBinary")]
    is_binary: bool,
}

const BRANCH_TIP_QUERY: &str = "query($owner: String!, $name: String!, $qualifiedName: String!) {
  repository(owner: $owner, name: $name) {
    ref(qualifiedName: $qualifiedName) { target { oid } }
  }
}";

const FILE_CONTENT_QUERY: &str = "query($owner: String!, $name: String!, $expression: String!) {
  repository(owner: $owner, name: $name) {
    object(expression: $expression) { ... on Blob { text isBinary } }
  }
}";

/// Pull the `message` field out of a GitHub error body, falling back to the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

/// REST v3 + GraphQL v4 client for github.com (or a GitHub Enterprise host).
#[derive(Debug, Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_url: String,
    graphql_url: String,
    token: String,
    actor: Option<String>,
}

impl GitHubClient {
    pub fn new(api_url: &str, graphql_url: &str, token: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            graphql_url: graphql_url.to_string(),
            token: token.into(),
            actor: None,
        })
    }

    /// Use a fixed fork owner instead of resolving it from the token.
    pub fn with_actor(mut self, actor: Option<String>) -> Self {
        self.actor = actor;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: &'static str,
        url: String,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<T, PlatformError> {
        let mut req = self
            .http
            .request(Method::from_bytes(method.as_bytes()).unwrap_or(Method::GET), &url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await.map_err(|source| PlatformError::Transport {
            url: url.clone(),
            source,
        })?;
        let status = resp.status();
        let text = resp.text().await.map_err(|source| PlatformError::Transport {
            url: url.clone(),
            source,
        })?;

        if !status.is_success() {
            return Err(PlatformError::Status {
                method,
                url,
                status: status.as_u16(),
                message: error_message(&text),
            });
        }
        serde_json::from_str(&text).map_err(|e| PlatformError::Decode {
            url,
            message: e.to_string(),
        })
    }

    async fn graphql<T: DeserializeOwned>(&self, query: &str, variables: Value) -> Result<T, PlatformError> {
        let body = json!({ "query": query, "variables": variables });
        let resp: GraphQlResponse<T> = self
            .send("POST", self.graphql_url.clone(), &[], Some(&body))
            .await?;
        if !resp.errors.is_empty() {
            let messages: Vec<String> = resp.errors.into_iter().map(|e| e.message).collect();
            return Err(PlatformError::GraphQl(messages.join("; ")));
        }
        resp.data
            .ok_or_else(|| PlatformError::GraphQl("response carried no data".to_string()))
    }
}

#[async_trait]
impl Platform for GitHubClient {
    async fn current_actor(&self) -> Result<String, PlatformError> {
        if let Some(actor) = &self.actor {
            return Ok(actor.clone());
        }
        let user: ApiUser = self.send("GET", self.url("/user"), &[], None).await?;
        Ok(user.login)
    }

    async fn get_repository(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<Option<RemoteRepo>, PlatformError> {
        let url = self.url(&format!("/repos/{}/{}", owner, name));
        match self.send::<ApiRepo>("GET", url, &[], None).await {
            Ok(repo) => Ok(Some(repo.into())),
            Err(PlatformError::Status { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn create_fork(&self, owner: &str, name: &str) -> Result<RemoteRepo, PlatformError> {
        let url = self.url(&format!("/repos/{}/{}/forks", owner, name));
        let body = json!({ "default_branch_only": true });
        let repo: ApiRepo = self.send("POST", url, &[], Some(&body)).await?;
        Ok(repo.into())
    }

    async fn branch_tip(&self, owner: &str, name: &str, branch: &str) -> Result<String, PlatformError> {
        let data: RepositoryData<RefNode> = self
            .graphql(
                BRANCH_TIP_QUERY,
                json!({
                    "owner": owner,
                    "name": name,
                    "qualifiedName": format!("refs/heads/{}", branch),
                }),
            )
            .await?;
        data.repository
            .and_then(|r| r.git_ref)
            .map(|r| r.target.oid)
            .ok_or_else(|| PlatformError::GraphQl(format!("branch {} not found on {}/{}", branch, owner, name)))
    }

    async fn file_content(
        &self,
        owner: &str,
        name: &str,
        revision: &str,
        path: &str,
    ) -> Result<Option<String>, PlatformError> {
        let data: RepositoryData<ObjectNode> = self
            .graphql(
                FILE_CONTENT_QUERY,
                json!({
                    "owner": owner,
                    "name": name,
                    "expression": format!("{}:{}", revision, path),
                }),
            )
            .await?;
        let Some(blob) = data.repository.and_then(|r| r.object) else {
            return Ok(None);
        };
        if blob.is_binary {
            return Err(PlatformError::Rejected(format!("{} is a binary file", path)));
        }
        // Trees come back as an empty object, with no `text`.
        Ok(blob.text)
    }

    async fn create_commit(
        &self,
        repo: &RepoRef,
        branch: &str,
        changes: &FileChanges,
        descriptor: &CommitDescriptor,
    ) -> Result<String, ApplyError> {
        let base = descriptor.base_revision.as_str();
        let prefix = format!("/repos/{}/{}/git", repo.owner, repo.name);

        let base_commit: ApiGitCommit = self
            .send("GET", self.url(&format!("{}/commits/{}", prefix, base)), &[], None)
            .await?;

        let mut entries: Vec<TreeEntry<'_>> = changes
            .deletions
            .iter()
            .map(|path| TreeEntry {
                path,
                mode: "100644",
                kind: "blob",
                content: None,
                sha: Some(None),
            })
            .collect();
        for addition in &changes.additions {
            entries.push(TreeEntry {
                path: &addition.path,
                mode: addition.mode.as_git_mode().unwrap_or("100644"),
                kind: "blob",
                content: Some(&addition.contents),
                sha: None,
            });
        }
        let tree_body = json!({ "base_tree": base_commit.tree.sha, "tree": entries });
        let tree: ApiSha = self
            .send("POST", self.url(&format!("{}/trees", prefix)), &[], Some(&tree_body))
            .await?;

        let message = if descriptor.body.is_empty() {
            descriptor.title.clone()
        } else {
            format!("{}\n\n{}", descriptor.title, descriptor.body)
        };
        let commit_body = json!({
            "message": message,
            "tree": tree.sha,
            "parents": [base],
            "author": {
                "name": descriptor.author.name,
                "email": descriptor.author.email,
                "date": descriptor.author_date.to_rfc3339_opts(SecondsFormat::Secs, true),
            },
            "committer": {
                "name": descriptor.committer.name,
                "email": descriptor.committer.email,
                "date": descriptor.committer_date.to_rfc3339_opts(SecondsFormat::Secs, true),
            },
        });
        let commit: ApiSha = self
            .send("POST", self.url(&format!("{}/commits", prefix)), &[], Some(&commit_body))
            .await?;

        // Fast-forward only: the ref update is what enforces the base revision.
        let ref_body = json!({ "sha": commit.sha, "force": false });
        let _: Value = self
            .send(
                "PATCH",
                self.url(&format!("{}/refs/heads/{}", prefix, branch)),
                &[],
                Some(&ref_body),
            )
            .await
            .map_err(|e| match e {
                PlatformError::Status { status: 422, message, .. } => ApplyError::StaleBase(format!(
                    "{} moved past base {}: {}",
                    branch, base, message
                )),
                other => other.into(),
            })?;

        Ok(commit.sha)
    }

    async fn create_pull_request(
        &self,
        owner: &str,
        name: &str,
        descriptor: &PullRequestDescriptor,
    ) -> Result<PullRequest, PlatformError> {
        let url = self.url(&format!("/repos/{}/{}/pulls", owner, name));
        let body = json!({
            "title": descriptor.title,
            "body": descriptor.body,
            "head": descriptor.head,
            "head_repo": descriptor.head_repo,
            "base": descriptor.base,
            "draft": descriptor.draft,
            "maintainer_can_modify": descriptor.maintainer_can_modify,
        });
        let pr: ApiPull = self.send("POST", url, &[], Some(&body)).await?;
        Ok(pr.into())
    }

    async fn list_pull_requests(
        &self,
        owner: &str,
        name: &str,
        author: &str,
    ) -> Result<Vec<PullRequest>, PlatformError> {
        let url = self.url(&format!("/repos/{}/{}/pulls", owner, name));
        let per_page = PULLS_PER_PAGE.to_string();
        let mut found = Vec::new();
        // The API cannot filter by author, so walk every page of open PRs.
        for page in 1u32.. {
            let page = page.to_string();
            let pulls: Vec<ApiPull> = self
                .send(
                    "GET",
                    url.clone(),
                    &[("state", "open"), ("per_page", per_page.as_str()), ("page", page.as_str())],
                    None,
                )
                .await?;
            let last_page = pulls.len() < PULLS_PER_PAGE;
            found.extend(
                pulls
                    .into_iter()
                    .filter(|p| p.user.login.eq_ignore_ascii_case(author))
                    .map(PullRequest::from),
            );
            if last_page {
                break;
            }
        }
        Ok(found)
    }
}
