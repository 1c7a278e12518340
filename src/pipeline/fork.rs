use crate::pacing::{Pacer, SettleKind};
use crate::platform::{Platform, RemoteRepo};
use anyhow::{Context, Result, bail};

/// The actor's writable copy of an upstream repository.
#[derive(Debug, Clone)]
pub struct ForkHandle {
    pub repo: RemoteRepo,
    /// Whether this run created it.
    pub created: bool,
}

/// Find the actor's fork of `upstream`, creating it (default branch only)
/// when absent. An existing fork is reused, never recreated.
///
/// In dry-run mode nothing is created and `Ok(None)` stands for "would fork".
pub async fn ensure_fork(
    platform: &dyn Platform,
    pacer: &Pacer,
    actor: &str,
    upstream: &RemoteRepo,
    dry_run: bool,
) -> Result<Option<ForkHandle>> {
    let existing = platform
        .get_repository(actor, &upstream.name)
        .await
        .with_context(|| format!("Failed to look up {}/{}", actor, upstream.name))?;

    if let Some(repo) = existing {
        match &repo.parent {
            Some(parent) if parent.owner.eq_ignore_ascii_case(&upstream.owner) && parent.name == upstream.name => {
                tracing::info!(stage = "fork", fork = %repo.full_name(), "reusing existing fork");
                return Ok(Some(ForkHandle { repo, created: false }));
            }
            Some(parent) => bail!(
                "{} already exists as a fork of {}/{}, not of {}",
                repo.full_name(),
                parent.owner,
                parent.name,
                upstream.full_name()
            ),
            None => bail!(
                "{} already exists and is not a fork of {}",
                repo.full_name(),
                upstream.full_name()
            ),
        }
    }

    if dry_run {
        tracing::info!(stage = "fork", upstream = %upstream.full_name(), "dry run: would create fork");
        return Ok(None);
    }

    pacer.before_mutation().await;
    let repo = platform
        .create_fork(&upstream.owner, &upstream.name)
        .await
        .with_context(|| format!("Failed to fork {}", upstream.full_name()))?;
    tracing::info!(stage = "fork", fork = %repo.full_name(), "created fork");
    pacer.settle(SettleKind::Fork).await;

    Ok(Some(ForkHandle { repo, created: true }))
}
