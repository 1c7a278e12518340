use anyhow::{Context, Result};
use git2::{DiffFormat, DiffOptions, IndexAddOption, Repository, ResetType, Signature};
use std::path::Path;

use crate::platform::Identity;

/// Local version-control operations on one workspace.
pub struct GitWorkspace {
    repo: Repository,
}

impl GitWorkspace {
    pub fn open(path: &Path) -> Result<Self> {
        let repo = Repository::open(path)
            .with_context(|| format!("Failed to open git repository at {}", path.display()))?;
        Ok(Self { repo })
    }

    /// `git init` plus `git remote add origin <remote_url>`.
    pub fn init(path: &Path, remote_url: &str) -> Result<Self> {
        let repo = Repository::init(path)
            .with_context(|| format!("Failed to init git repository at {}", path.display()))?;
        repo.remote("origin", remote_url)
            .with_context(|| format!("Failed to add remote origin {}", remote_url))?;
        Ok(Self { repo })
    }

    pub fn remote_url(&self, name: &str) -> Option<String> {
        self.repo
            .find_remote(name)
            .ok()
            .and_then(|r| r.url().map(str::to_string))
    }

    /// HEAD commit, or `None` on an unborn branch.
    fn head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    #[cfg(test)]
    pub fn head_sha(&self) -> Option<String> {
        self.head_commit().map(|c| c.id().to_string())
    }

    /// Stage the whole working tree and commit it, unless the resulting tree
    /// equals HEAD's. Returns the new commit id when one was created.
    pub fn commit_all(&self, message: &str, identity: &Identity) -> Result<Option<String>> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let parent = self.head_commit();
        if let Some(ref parent) = parent
            && parent.tree_id() == tree_id
        {
            return Ok(None);
        }
        let tree = self.repo.find_tree(tree_id)?;
        let sig = Signature::now(&identity.name, &identity.email)?;

        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let commit_id = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        Ok(Some(commit_id.to_string()))
    }

    /// Unified diff of the working tree (including untracked files) against HEAD.
    pub fn diff_against_head(&self) -> Result<Vec<u8>> {
        let head = self
            .head_commit()
            .context("Workspace has no baseline commit to diff against")?;
        let head_tree = head.tree()?;

        let mut opts = DiffOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .show_untracked_content(true);

        let diff = self
            .repo
            .diff_tree_to_workdir_with_index(Some(&head_tree), Some(&mut opts))?;

        let mut buf = Vec::new();
        diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
            if matches!(line.origin(), '+' | '-' | ' ') {
                buf.push(line.origin() as u8);
            }
            buf.extend_from_slice(line.content());
            true
        })?;
        Ok(buf)
    }

    /// Discard every local mutation: reset tracked files to HEAD and remove
    /// untracked ones.
    pub fn restore_clean(&self) -> Result<()> {
        let head = self
            .head_commit()
            .context("Workspace has no baseline commit to restore")?;
        self.repo
            .reset(head.as_object(), ResetType::Hard, None)
            .context("Failed to reset workspace")?;
        let mut checkout = git2::build::CheckoutBuilder::new();
        checkout.force().remove_untracked(true);
        self.repo
            .checkout_head(Some(&mut checkout))
            .context("Failed to remove untracked files")?;
        Ok(())
    }

    #[cfg(test)]
    pub fn is_clean(&self) -> Result<bool> {
        let mut opts = git2::StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        Ok(self.repo.statuses(Some(&mut opts))?.is_empty())
    }
}
