use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use std::path::Path;

use crate::error::RalphError;
use crate::fs_util;
use crate::prd::{Prd, UserStory};
use crate::progress::Progress;

pub(crate) const DEFAULT_PROMPT: &str = include_str!("../prompts/ralph.md");

const TEMPLATE_NAME: &str = "prompt";

/// Values available to the prompt template.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct TemplateData {
    /// Pretty-printed PRD JSON.
    pub(crate) prd: String,
    pub(crate) progress: String,
    pub(crate) branch_name: String,
    pub(crate) pending_count: usize,
    pub(crate) completed_count: usize,
    pub(crate) total_count: usize,
    pub(crate) next_story: Option<UserStory>,
}

pub(crate) fn build_template_data(prd: &Prd, progress: &Progress) -> Result<TemplateData, String> {
    let stats = prd.stats();
    Ok(TemplateData {
        prd: prd.to_json()?,
        progress: progress.content.clone(),
        branch_name: prd.branch_name.clone(),
        pending_count: stats.pending,
        completed_count: stats.completed,
        total_count: stats.total,
        next_story: prd.next_story().cloned(),
    })
}

/// Renders `template` against `data`. Unknown variables are errors rather
/// than empty strings.
pub(crate) fn render(template: &str, data: &TemplateData) -> Result<String, RalphError> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    env.add_template(TEMPLATE_NAME, template)
        .map_err(|err| RalphError::RenderFailure(err.to_string()))?;
    let compiled = env
        .get_template(TEMPLATE_NAME)
        .map_err(|err| RalphError::RenderFailure(err.to_string()))?;
    compiled
        .render(data)
        .map_err(|err| RalphError::RenderFailure(err.to_string()))
}

pub(crate) fn load(path: &Path) -> Result<String, String> {
    fs_util::read_to_string(path)
}

pub(crate) fn save(path: &Path, content: &str) -> Result<(), String> {
    fs_util::write(path, content)
}

pub(crate) fn create_default(path: &Path) -> Result<(), String> {
    save(path, DEFAULT_PROMPT)
}
