//! Typed patch model.
//!
//! A patch extracted from a workspace is a git-style unified diff. It is
//! parsed with `git2::Diff::from_buffer` into one [`PatchFile`] per changed
//! path, each holding its hunks in order. [`apply_hunks`] replays those hunks
//! against a file's text, which is how the remote applier reconstructs the
//! final content of every touched file.

use anyhow::{Context, Result};
use git2::{Delta, Diff, DiffLineType, Patch};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What happens to the file as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FileOp {
    Add,
    Modify,
    Delete,
    Rename { from: String },
    Copy { from: String },
    /// Blob turned into a symlink or submodule, or the reverse.
    TypeChange,
}

/// Git file mode, reduced to what the commit API distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileMode {
    Regular,
    Executable,
    Symlink,
    Submodule,
    /// The side of the diff where the file does not exist.
    Absent,
}

impl FileMode {
    fn from_git(mode: git2::FileMode) -> Self {
        match mode {
            git2::FileMode::Blob | git2::FileMode::BlobGroupWritable => FileMode::Regular,
            git2::FileMode::BlobExecutable => FileMode::Executable,
            git2::FileMode::Link => FileMode::Symlink,
            git2::FileMode::Commit => FileMode::Submodule,
            git2::FileMode::Tree | git2::FileMode::Unreadable => FileMode::Absent,
        }
    }

    /// Octal mode string as used in git trees.
    pub fn as_git_mode(&self) -> Option<&'static str> {
        match self {
            FileMode::Regular => Some("100644"),
            FileMode::Executable => Some("100755"),
            FileMode::Symlink => Some("120000"),
            FileMode::Submodule => Some("160000"),
            FileMode::Absent => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    Context,
    Added,
    Removed,
}

/// One line of a hunk. `content` keeps its trailing newline, except for a
/// last line that had none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HunkLine {
    pub kind: LineKind,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    pub old_start: u32,
    pub old_lines: u32,
    pub new_start: u32,
    pub new_lines: u32,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    /// The hunk that undoes this one.
    pub fn reversed(&self) -> Hunk {
        Hunk {
            old_start: self.new_start,
            old_lines: self.new_lines,
            new_start: self.old_start,
            new_lines: self.old_lines,
            lines: self
                .lines
                .iter()
                .map(|line| HunkLine {
                    kind: match line.kind {
                        LineKind::Added => LineKind::Removed,
                        LineKind::Removed => LineKind::Added,
                        LineKind::Context => LineKind::Context,
                    },
                    content: line.content.clone(),
                })
                .collect(),
        }
    }
}

/// Every change to one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchFile {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub op: FileOp,
    pub old_mode: FileMode,
    pub new_mode: FileMode,
    pub binary: bool,
    pub hunks: Vec<Hunk>,
}

impl PatchFile {
    /// The path this file ends up at (or was deleted from).
    pub fn path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or_default()
    }

    pub fn lines_added(&self) -> usize {
        self.count(LineKind::Added)
    }

    pub fn lines_removed(&self) -> usize {
        self.count(LineKind::Removed)
    }

    fn count(&self, kind: LineKind) -> usize {
        self.hunks
            .iter()
            .flat_map(|h| h.lines.iter())
            .filter(|l| l.kind == kind)
            .count()
    }
}

/// Parse a git-style unified diff into typed files.
pub fn parse_patch(bytes: &[u8]) -> Result<Vec<PatchFile>> {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Vec::new());
    }

    let diff = Diff::from_buffer(bytes).context("Failed to parse patch")?;
    let mut files = Vec::with_capacity(diff.deltas().len());

    for idx in 0..diff.deltas().len() {
        let Some(delta) = diff.get_delta(idx) else {
            continue;
        };
        let old_path = delta
            .old_file()
            .path()
            .map(|p| p.to_string_lossy().replace('\\', "/"));
        let new_path = delta
            .new_file()
            .path()
            .map(|p| p.to_string_lossy().replace('\\', "/"));

        let op = match delta.status() {
            Delta::Added | Delta::Untracked => FileOp::Add,
            Delta::Deleted => FileOp::Delete,
            Delta::Modified => FileOp::Modify,
            Delta::Renamed => FileOp::Rename {
                from: old_path.clone().unwrap_or_default(),
            },
            Delta::Copied => FileOp::Copy {
                from: old_path.clone().unwrap_or_default(),
            },
            Delta::Typechange => FileOp::TypeChange,
            other => anyhow::bail!(
                "Unexpected delta status {:?} for {}",
                other,
                new_path.as_deref().unwrap_or("<unknown>")
            ),
        };

        let mut old_mode = FileMode::from_git(delta.old_file().mode());
        let mut new_mode = FileMode::from_git(delta.new_file().mode());
        match op {
            FileOp::Add => old_mode = FileMode::Absent,
            FileOp::Delete => new_mode = FileMode::Absent,
            _ => {}
        }

        let mut hunks = Vec::new();
        let mut binary = delta.flags().is_binary();
        if let Some(patch) = Patch::from_diff(&diff, idx)
            .with_context(|| format!("Failed to read hunks of patch entry {}", idx))?
        {
            binary |= patch.delta().flags().is_binary();
            hunks = collect_hunks(&patch)?;
        }

        files.push(PatchFile {
            old_path,
            new_path,
            op,
            old_mode,
            new_mode,
            binary,
            hunks,
        });
    }

    Ok(files)
}

fn collect_hunks(patch: &Patch<'_>) -> Result<Vec<Hunk>> {
    let mut hunks = Vec::with_capacity(patch.num_hunks());
    for hunk_idx in 0..patch.num_hunks() {
        let (hunk, line_count) = patch.hunk(hunk_idx)?;
        let mut lines: Vec<HunkLine> = Vec::with_capacity(line_count);
        for line_idx in 0..line_count {
            let line = patch.line_in_hunk(hunk_idx, line_idx)?;
            let kind = match line.origin_value() {
                DiffLineType::Context => LineKind::Context,
                DiffLineType::Addition => LineKind::Added,
                DiffLineType::Deletion => LineKind::Removed,
                // "\ No newline at end of file" belongs to the line before it.
                DiffLineType::ContextEOFNL | DiffLineType::AddEOFNL | DiffLineType::DeleteEOFNL => {
                    if let Some(last) = lines.last_mut()
                        && last.content.ends_with('\n')
                    {
                        last.content.pop();
                    }
                    continue;
                }
                _ => continue,
            };
            let content = std::str::from_utf8(line.content())
                .context("Patch contains non UTF-8 text")?
                .to_string();
            lines.push(HunkLine { kind, content });
        }
        hunks.push(Hunk {
            old_start: hunk.old_start(),
            old_lines: hunk.old_lines(),
            new_start: hunk.new_start(),
            new_lines: hunk.new_lines(),
            lines,
        });
    }
    Ok(hunks)
}

/// A hunk that does not match the text it is applied to.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("hunk {hunk} does not apply at line {line}: expected {expected:?}, found {found:?}")]
pub struct HunkConflict {
    pub hunk: usize,
    pub line: usize,
    pub expected: String,
    pub found: String,
}

/// Replay `hunks` in order against `original`, returning the new text.
pub fn apply_hunks(original: &str, hunks: &[Hunk]) -> Result<String, HunkConflict> {
    let source: Vec<&str> = original.split_inclusive('\n').collect();
    let mut out = String::with_capacity(original.len());
    let mut cursor = 0usize;

    for (hunk_idx, hunk) in hunks.iter().enumerate() {
        // Pure insertions anchor after `old_start`; everything else starts at it.
        let start = if hunk.old_lines == 0 {
            hunk.old_start as usize
        } else {
            (hunk.old_start as usize).saturating_sub(1)
        };
        if start < cursor || start > source.len() {
            return Err(HunkConflict {
                hunk: hunk_idx,
                line: start + 1,
                expected: "hunk start within file".to_string(),
                found: format!("file has {} lines", source.len()),
            });
        }
        for line in &source[cursor..start] {
            out.push_str(line);
        }
        cursor = start;

        for line in &hunk.lines {
            match line.kind {
                LineKind::Context | LineKind::Removed => {
                    let found = source.get(cursor).copied().unwrap_or_default();
                    if found != line.content {
                        return Err(HunkConflict {
                            hunk: hunk_idx,
                            line: cursor + 1,
                            expected: line.content.clone(),
                            found: found.to_string(),
                        });
                    }
                    if line.kind == LineKind::Context {
                        out.push_str(found);
                    }
                    cursor += 1;
                }
                LineKind::Added => out.push_str(&line.content),
            }
        }
    }

    for line in &source[cursor..] {
        out.push_str(line);
    }
    Ok(out)
}

/// Whether `text` already holds the result of applying `hunks`, i.e. the
/// reversed hunks apply cleanly to it.
pub fn already_applied(text: &str, hunks: &[Hunk]) -> bool {
    if hunks.is_empty() {
        return false;
    }
    let reversed: Vec<Hunk> = hunks.iter().map(Hunk::reversed).collect();
    apply_hunks(text, &reversed).is_ok()
}
