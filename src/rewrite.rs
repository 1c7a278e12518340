//! Text rewrite collaborator.
//!
//! The pipeline hands a workspace to a [`Rewriter`] and only cares whether
//! anything changed. [`RegexRewriter`] is the shipped implementation: a
//! marker scan followed by a line-oriented regex substitution.

use crate::config::{RewriteScope, RewriteSection};
use crate::errors::ConfigError;
use anyhow::{Context, Result};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Group references in `replacement` that `pattern` does not define, in
/// order of first use. The regex crate expands those to an empty string.
pub fn undefined_group_refs(pattern: &Regex, replacement: &str) -> Vec<String> {
    let mut missing: Vec<String> = Vec::new();
    let mut rest = replacement;
    while let Some(pos) = rest.find('$') {
        rest = &rest[pos + 1..];
        if let Some(after) = rest.strip_prefix('$') {
            rest = after;
            continue;
        }
        let (name, tail) = match rest.strip_prefix('{') {
            Some(braced) => match braced.find('}') {
                Some(end) => (&braced[..end], &braced[end + 1..]),
                None => break,
            },
            None => {
                let end = rest
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .unwrap_or(rest.len());
                (&rest[..end], &rest[end..])
            }
        };
        rest = tail;
        if name.is_empty() {
            continue;
        }
        let defined = match name.parse::<usize>() {
            Ok(index) => index < pattern.captures_len(),
            Err(_) => pattern.capture_names().flatten().any(|n| n == name),
        };
        if !defined && !missing.iter().any(|m| m == name) {
            missing.push(name.to_string());
        }
    }
    missing
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteOutcome {
    /// The marker is absent, or present without any substitutable occurrence.
    NothingToDo,
    /// Paths (relative to the workspace) rewritten in place.
    Rewritten(Vec<PathBuf>),
}

/// Performs the domain substitution on a workspace.
pub trait Rewriter: Send + Sync {
    /// `target` is the task's file, relative to `workspace`; `None` when the
    /// task named only the repository.
    fn rewrite(&self, workspace: &Path, target: Option<&Path>) -> Result<RewriteOutcome>;
}

/// Marker scan plus regex replacement over files with configured extensions.
#[derive(Debug, Clone)]
pub struct RegexRewriter {
    marker: String,
    pattern: Regex,
    replacement: String,
    extensions: Vec<String>,
    scope: RewriteScope,
}

impl RegexRewriter {
    pub fn new(
        marker: impl Into<String>,
        pattern: &str,
        replacement: impl Into<String>,
        extensions: Vec<String>,
        scope: RewriteScope,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            marker: marker.into(),
            pattern: Regex::new(pattern)?,
            replacement: replacement.into(),
            extensions: extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_string())
                .collect(),
            scope,
        })
    }

    pub fn from_config(section: &RewriteSection) -> Result<Self, ConfigError> {
        Self::new(
            section.marker.clone(),
            &section.pattern,
            section.replacement.clone(),
            section.extensions.clone(),
            section.scope,
        )
    }

    fn has_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|want| want == ext))
    }

    /// Files the scan and the substitution consider, relative to the workspace.
    fn candidates(&self, workspace: &Path, target: Option<&Path>) -> Vec<PathBuf> {
        match self.scope {
            RewriteScope::Target => target
                .filter(|t| workspace.join(t).is_file())
                .map(|t| vec![t.to_path_buf()])
                .unwrap_or_default(),
            RewriteScope::Workspace => WalkDir::new(workspace)
                .into_iter()
                .filter_entry(|e| e.file_name() != ".git")
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter_map(|e| e.path().strip_prefix(workspace).ok().map(Path::to_path_buf))
                .collect(),
        }
    }
}

impl Rewriter for RegexRewriter {
    fn rewrite(&self, workspace: &Path, target: Option<&Path>) -> Result<RewriteOutcome> {
        let candidates = self.candidates(workspace, target);

        // Unreadable or non-UTF-8 files cannot carry the marker.
        let contents: Vec<(PathBuf, String)> = candidates
            .into_iter()
            .filter_map(|rel| {
                let text = fs::read_to_string(workspace.join(&rel)).ok()?;
                Some((rel, text))
            })
            .collect();

        if !contents.iter().any(|(_, text)| text.contains(&self.marker)) {
            tracing::debug!(workspace = %workspace.display(), marker = %self.marker, "marker not found");
            return Ok(RewriteOutcome::NothingToDo);
        }

        let mut changed = Vec::new();
        for (rel, text) in contents {
            if !self.has_extension(&rel) {
                continue;
            }
            let rewritten = self.pattern.replace_all(&text, self.replacement.as_str());
            if rewritten != text {
                let path = workspace.join(&rel);
                fs::write(&path, rewritten.as_bytes())
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                changed.push(rel);
            }
        }

        if changed.is_empty() {
            Ok(RewriteOutcome::NothingToDo)
        } else {
            changed.sort();
            Ok(RewriteOutcome::Rewritten(changed))
        }
    }
}
