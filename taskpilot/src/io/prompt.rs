//! Prompt builder for task dispatch.
//!
//! The template marks each section as `required` or `droppable`; when the
//! rendered prompt exceeds the byte budget, droppable context documents are
//! removed first and the last remaining section is truncated as a last resort.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::plan::{ItemRef, Spec};

const TASK_TEMPLATE: &str = include_str!("prompts/task.md");

/// Phrase the assistant is asked to end a successful reply with.
pub const SUCCESS_PHRASE: &str = "Task completed successfully";
/// Phrase the assistant is asked to use when giving up.
pub const FAILURE_PHRASE: &str = "Task failed";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker regex must compile")
});

/// Task fields exposed to the template.
#[derive(Debug, Clone, Serialize)]
pub struct TaskContext {
    pub id: String,
    pub title: String,
    pub parent: Option<String>,
    pub optional: bool,
    pub description: Vec<String>,
    pub requirements: Vec<String>,
}

impl TaskContext {
    pub fn from_item(item: &ItemRef<'_>) -> Self {
        let parent = match item {
            ItemRef::Subtask { parent, .. } => Some(format!("{}. {}", parent.id, parent.title)),
            ItemRef::Task(_) => None,
        };
        Self {
            id: item.id().to_string(),
            title: item.title().to_string(),
            parent,
            optional: item.optional(),
            description: item.description().to_vec(),
            requirements: item.requirements().to_vec(),
        }
    }
}

/// All inputs needed to build one dispatch prompt.
#[derive(Debug, Clone)]
pub struct PromptInputs {
    pub spec: String,
    pub task: TaskContext,
    /// 1-based attempt number being dispatched.
    pub attempt: u32,
    pub previous_error: Option<String>,
    pub requirements: Option<String>,
    pub design: Option<String>,
}

/// Builds prompts within a byte budget, dropping less critical sections first.
#[derive(Debug)]
pub struct PromptBuilder {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("task", TASK_TEMPLATE)
            .context("load task prompt template")?;
        Ok(Self { env, budget_bytes })
    }

    pub fn build(&self, input: &PromptInputs) -> Result<String> {
        let template = self.env.get_template("task")?;
        let rendered = template
            .render(context! {
                spec => input.spec,
                task => input.task,
                attempt => input.attempt,
                previous_error => input.previous_error.as_deref().map(str::trim).filter(|s| !s.is_empty()),
                requirements => input.requirements.as_deref().map(str::trim).filter(|s| !s.is_empty()),
                design => input.design.as_deref().map(str::trim).filter(|s| !s.is_empty()),
                success_phrase => SUCCESS_PHRASE,
                failure_phrase => FAILURE_PHRASE,
            })
            .with_context(|| format!("render prompt for {}:{}", input.spec, input.task.id))?;

        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        Ok(render_sections(&sections))
    }
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let required = kind.as_str() == "required";
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |next| next.start());
        let content = rendered[whole.end()..end].trim().to_string();
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }

    sections
}

/// Drop order: design -> requirements -> failure.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in ["design", "requirements", "failure"] {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    if total_len(sections) <= budget {
        return;
    }
    let other_len: usize = sections
        .iter()
        .take(sections.len().saturating_sub(1))
        .map(|s| s.content.len())
        .sum();
    let allowed = budget.saturating_sub(other_len);
    if let Some(last) = sections.last_mut() {
        let before_len = last.content.len();
        if allowed > 12 {
            truncate_at_char(&mut last.content, allowed - 12);
            last.content.push_str("\n[truncated]");
        } else {
            truncate_at_char(&mut last.content, allowed);
        }
        debug!(
            section = last.key,
            before_len,
            after_len = last.content.len(),
            "truncated section for budget"
        );
    }
}

fn truncate_at_char(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Load a spec's context documents, returning `None` for missing files.
pub fn load_context_documents(spec: &Spec) -> Result<(Option<String>, Option<String>)> {
    Ok((
        read_optional(&spec.requirements_path)?,
        read_optional(&spec.design_path)?,
    ))
}

/// Read file contents if it exists, returning `None` for missing files.
pub fn read_optional(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read prompt input {}", path.display()))?;
    Ok(Some(contents))
}
