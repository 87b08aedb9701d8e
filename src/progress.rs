use chrono::Local;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::fs_util;

const PATTERNS_HEADING: &str = "## Codebase Patterns";

/// The shared `progress.txt` log that carries learnings between iterations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Progress {
    pub(crate) path: PathBuf,
    pub(crate) content: String,
}

impl Progress {
    /// A missing file loads as an empty log.
    pub(crate) fn load(path: &Path) -> Result<Self, String> {
        let content = fs_util::read_optional(path)?.unwrap_or_default();
        Ok(Self {
            path: path.to_path_buf(),
            content,
        })
    }

    pub(crate) fn create(path: &Path) -> Result<Self, String> {
        let progress = Self {
            path: path.to_path_buf(),
            content: default_content(),
        };
        progress.save()?;
        Ok(progress)
    }

    pub(crate) fn exists(path: &Path) -> bool {
        path.is_file()
    }

    pub(crate) fn save(&self) -> Result<(), String> {
        fs_util::write(&self.path, &self.content)
    }

    pub(crate) fn append(&mut self, text: &str) {
        if !self.content.is_empty() && !self.content.ends_with('\n') {
            self.content.push('\n');
        }
        self.content.push_str(text);
    }

    pub(crate) fn append_entry(
        &mut self,
        story_id: &str,
        title: &str,
        files_changed: &[String],
        learnings: &[String],
    ) {
        let entry = format_entry(story_id, title, files_changed, learnings);
        self.append(&entry);
    }

    /// Body of the `## Codebase Patterns` section, trimmed; empty when absent.
    pub(crate) fn codebase_patterns(&self) -> &str {
        let Some(start) = self.content.find(PATTERNS_HEADING) else {
            return "";
        };
        let rest = &self.content[start + PATTERNS_HEADING.len()..];
        match rest.find("\n## ") {
            Some(end) => rest[..end].trim(),
            None => rest.trim(),
        }
    }

    pub(crate) fn tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.content.lines().collect();
        let start = all.len().saturating_sub(lines);
        let mut out = all[start..].join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        out
    }
}

fn format_entry(story_id: &str, title: &str, files_changed: &[String], learnings: &[String]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "\n## {} - {}",
        Local::now().format("%Y-%m-%d %H:%M"),
        story_id
    );
    let _ = writeln!(out, "**{}**\n", title);
    if !files_changed.is_empty() {
        out.push_str("Files changed:\n");
        for file in files_changed {
            let _ = writeln!(out, "- {}", file);
        }
        out.push('\n');
    }
    if !learnings.is_empty() {
        out.push_str("**Learnings:**\n");
        for learning in learnings {
            let _ = writeln!(out, "- {}", learning);
        }
    }
    out.push_str("\n---\n");
    out
}

pub(crate) fn default_content() -> String {
    format!(
        "# Ralph Progress Log\nStarted: {}\n\n{}\n<!-- Add reusable patterns discovered during implementation -->\n\n## Key Files\n<!-- Document important files for context -->\n\n---\n",
        Local::now().format("%Y-%m-%d"),
        PATTERNS_HEADING
    )
}
