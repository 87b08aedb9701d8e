use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::OnceLock;

use crate::fs_util;

pub(crate) const DEFAULT_BRANCH: &str = "ralph/feature";

/// The task list the agent works through, stored as `prd.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Prd {
    #[serde(default)]
    pub(crate) branch_name: String,
    #[serde(default)]
    pub(crate) user_stories: Vec<UserStory>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UserStory {
    #[serde(default)]
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub(crate) description: String,
    #[serde(default)]
    pub(crate) acceptance_criteria: Vec<String>,
    /// Lower values are worked on first.
    #[serde(default)]
    pub(crate) priority: i32,
    #[serde(default)]
    pub(crate) passes: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub(crate) notes: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub(crate) struct PrdStats {
    pub(crate) total: usize,
    pub(crate) completed: usize,
    pub(crate) pending: usize,
}

fn story_number(id: &str) -> Option<u32> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"^US-(\d+)$").ok())
        .as_ref()?;
    pattern.captures(id)?.get(1)?.as_str().parse().ok()
}

impl Prd {
    pub(crate) fn new(branch_name: impl Into<String>) -> Self {
        Self {
            branch_name: branch_name.into(),
            user_stories: Vec::new(),
        }
    }

    pub(crate) fn default_example() -> Self {
        Self {
            branch_name: DEFAULT_BRANCH.to_string(),
            user_stories: vec![UserStory {
                id: "US-001".to_string(),
                title: "Example user story".to_string(),
                description: "Describe what this story accomplishes".to_string(),
                acceptance_criteria: vec![
                    "First acceptance criterion".to_string(),
                    "Second acceptance criterion".to_string(),
                    "typecheck passes".to_string(),
                    "tests pass".to_string(),
                ],
                priority: 1,
                passes: false,
                notes: String::new(),
            }],
        }
    }

    pub(crate) fn load(path: &Path) -> Result<Self, String> {
        let content = fs_util::read_to_string(path)?;
        Self::from_json(&content)
            .map_err(|err| format!("Failed to parse PRD {}: {}", path.display(), err))
    }

    /// Parses PRD JSON; errors name the path of the offending field.
    pub(crate) fn from_json(content: &str) -> Result<Self, String> {
        let mut deserializer = serde_json::Deserializer::from_str(content);
        serde_path_to_error::deserialize(&mut deserializer).map_err(|err| {
            let path = err.path().to_string();
            if path == "." {
                err.inner().to_string()
            } else {
                format!("at {}: {}", path, err.inner())
            }
        })
    }

    pub(crate) fn save(&self, path: &Path) -> Result<(), String> {
        let mut json = self.to_json()?;
        json.push('\n');
        fs_util::write(path, &json)
    }

    pub(crate) fn to_json(&self) -> Result<String, String> {
        serde_json::to_string_pretty(self).map_err(|err| format!("Failed to encode PRD: {}", err))
    }

    /// Appends `story`, assigning the next `US-NNN` id when it has none.
    /// Returns the id the story was stored under.
    pub(crate) fn add_story(&mut self, mut story: UserStory) -> String {
        if story.id.trim().is_empty() {
            story.id = self.next_story_id();
        }
        let id = story.id.clone();
        self.user_stories.push(story);
        id
    }

    fn next_story_id(&self) -> String {
        let highest = self
            .user_stories
            .iter()
            .filter_map(|story| story_number(&story.id))
            .max()
            .unwrap_or(0);
        format!("US-{:03}", highest + 1)
    }

    pub(crate) fn story(&self, id: &str) -> Option<&UserStory> {
        self.user_stories
            .iter()
            .find(|story| story.id.eq_ignore_ascii_case(id))
    }

    pub(crate) fn story_mut(&mut self, id: &str) -> Option<&mut UserStory> {
        self.user_stories
            .iter_mut()
            .find(|story| story.id.eq_ignore_ascii_case(id))
    }

    pub(crate) fn update_story(&mut self, story: UserStory) -> Result<(), String> {
        let slot = self
            .story_mut(&story.id)
            .ok_or_else(|| format!("story {} not found", story.id))?;
        *slot = story;
        Ok(())
    }

    pub(crate) fn mark_done(&mut self, id: &str) -> Result<(), String> {
        self.set_passes(id, true)
    }

    pub(crate) fn mark_pending(&mut self, id: &str) -> Result<(), String> {
        self.set_passes(id, false)
    }

    fn set_passes(&mut self, id: &str, passes: bool) -> Result<(), String> {
        let story = self
            .story_mut(id)
            .ok_or_else(|| format!("story {} not found", id))?;
        story.passes = passes;
        Ok(())
    }

    /// Marks every story pending; returns how many changed.
    pub(crate) fn reset_all(&mut self) -> usize {
        let mut changed = 0;
        for story in &mut self.user_stories {
            if story.passes {
                story.passes = false;
                changed += 1;
            }
        }
        changed
    }

    pub(crate) fn delete_story(&mut self, id: &str) -> Result<UserStory, String> {
        let index = self
            .user_stories
            .iter()
            .position(|story| story.id.eq_ignore_ascii_case(id))
            .ok_or_else(|| format!("story {} not found", id))?;
        Ok(self.user_stories.remove(index))
    }

    pub(crate) fn pending_stories(&self) -> impl Iterator<Item = &UserStory> {
        self.user_stories.iter().filter(|story| !story.passes)
    }

    pub(crate) fn completed_stories(&self) -> impl Iterator<Item = &UserStory> {
        self.user_stories.iter().filter(|story| story.passes)
    }

    /// Lowest priority value among pending stories; the earliest in list
    /// order wins a tie.
    pub(crate) fn next_story(&self) -> Option<&UserStory> {
        self.pending_stories().min_by_key(|story| story.priority)
    }

    /// True only for a non-empty list where every story passes.
    pub(crate) fn is_complete(&self) -> bool {
        !self.user_stories.is_empty() && self.user_stories.iter().all(|story| story.passes)
    }

    pub(crate) fn stats(&self) -> PrdStats {
        let completed = self.completed_stories().count();
        PrdStats {
            total: self.user_stories.len(),
            completed,
            pending: self.user_stories.len() - completed,
        }
    }
}

impl UserStory {
    pub(crate) fn format_for_display(&self) -> String {
        let status = if self.passes { "[x]" } else { "[ ]" };
        let mut out = format!(
            "{} {}: {} (P{})\n",
            status, self.id, self.title, self.priority
        );
        if !self.description.is_empty() {
            let _ = writeln!(out, "    {}", self.description);
        }
        if !self.acceptance_criteria.is_empty() {
            out.push_str("    Acceptance Criteria:\n");
            for criterion in &self.acceptance_criteria {
                let _ = writeln!(out, "      - {}", criterion);
            }
        }
        if !self.notes.is_empty() {
            let _ = writeln!(out, "    Notes: {}", self.notes);
        }
        out
    }
}
