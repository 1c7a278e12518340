use crate::config::FleetConfig;
use crate::errors::PlatformError;
use crate::pacing::Pacer;
use crate::platform::{Platform, PullRequest, PullRequestDescriptor, RemoteRepo};

/// Title, body and flags of the pull requests a run opens.
#[derive(Debug, Clone)]
pub struct PullRequestTemplate {
    pub title: String,
    pub body: String,
    pub draft: bool,
    pub maintainer_can_modify: bool,
}

impl PullRequestTemplate {
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            title: config.pr_title().to_string(),
            body: config.pr_body().to_string(),
            draft: config.toml.pull_request.draft,
            maintainer_can_modify: config.toml.pull_request.maintainer_can_modify,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Publication {
    Created(PullRequest),
    /// A pull request by the same actor was already open.
    Existing(PullRequest),
}

/// First open pull request on `upstream` authored by `actor`.
pub async fn find_existing(
    platform: &dyn Platform,
    upstream: &RemoteRepo,
    actor: &str,
) -> Result<Option<PullRequest>, PlatformError> {
    let pulls = platform
        .list_pull_requests(&upstream.owner, &upstream.name, actor)
        .await?;
    Ok(pulls.into_iter().next())
}

/// Open a pull request from the fork's default branch into the upstream's,
/// unless the fork owner already has one open.
pub async fn publish(
    platform: &dyn Platform,
    pacer: &Pacer,
    upstream: &RemoteRepo,
    fork: &RemoteRepo,
    template: &PullRequestTemplate,
) -> Result<Publication, PlatformError> {
    if let Some(pr) = find_existing(platform, upstream, &fork.owner).await? {
        tracing::info!(stage = "publish", pr = %pr.html_url, "pull request already open");
        return Ok(Publication::Existing(pr));
    }

    let descriptor = PullRequestDescriptor {
        title: template.title.clone(),
        body: template.body.clone(),
        base: upstream.default_branch.clone(),
        head: format!("{}:{}", fork.owner, fork.default_branch),
        head_repo: fork.name.clone(),
        draft: template.draft,
        maintainer_can_modify: template.maintainer_can_modify,
    };

    pacer.before_mutation().await;
    let pr = platform
        .create_pull_request(&upstream.owner, &upstream.name, &descriptor)
        .await?;
    tracing::info!(stage = "publish", pr = %pr.html_url, number = pr.number, "opened pull request");
    Ok(Publication::Created(pr))
}
