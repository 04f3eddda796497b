//! In-memory model of a discovered work plan: specs, tasks and subtasks.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::task_id::is_valid_id;

/// Checklist status of a task or subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Status encoded by a checkbox mark, if the mark is recognised.
    ///
    /// `-` is accepted as an alias for in-progress.
    pub const fn from_mark(mark: char) -> Option<Self> {
        match mark {
            ' ' => Some(Self::Pending),
            'x' | 'X' => Some(Self::Completed),
            '~' | '-' => Some(Self::InProgress),
            _ => None,
        }
    }

    /// Checkbox mark written when persisting this status.
    ///
    /// The file format only knows three marks; failed and skipped are recorded
    /// in the session record and keep an empty box on disk.
    pub const fn mark(self) -> char {
        match self {
            Self::Completed => 'x',
            Self::InProgress => '~',
            Self::Pending | Self::Failed | Self::Skipped => ' ',
        }
    }

    /// True once the item will not be dispatched again without an operator reset.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// True when a dependent item may treat this item as done.
    pub const fn satisfies_dependency(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// Forward-only transition rule used by the engine.
    ///
    /// Going back to `Pending` is never a forward transition; it happens only via
    /// an explicit operator reset or when a stopped attempt is rolled back.
    pub const fn can_advance_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Pending, _) => true,
            (Self::InProgress, Self::Pending) => false,
            (Self::InProgress, _) => true,
            (current, next) => current as u8 == next as u8,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Globally unique reference to a task: owning spec plus hierarchical id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub spec: String,
    pub id: String,
}

impl TaskKey {
    pub fn new(spec: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            spec: spec.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.spec, self.id)
    }
}

/// Parses `spec:id`, the form used on the command line and in exclusions.
impl FromStr for TaskKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((spec, id)) if !spec.is_empty() && is_valid_id(id) => Ok(Self::new(spec, id)),
            _ => Err(format!("expected <spec>:<task id>, got {s:?}")),
        }
    }
}

/// A subtask entry nested under a [`Task`]. Subtasks never nest further.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub title: String,
    pub description: Vec<String>,
    pub status: TaskStatus,
    pub optional: bool,
    pub requirements: Vec<String>,
    pub dependencies: Vec<String>,
    /// Zero-based line index in the source file.
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: Vec<String>,
    pub status: TaskStatus,
    pub optional: bool,
    pub requirements: Vec<String>,
    pub dependencies: Vec<String>,
    pub subtasks: Vec<Subtask>,
    pub spec_name: String,
    pub source: PathBuf,
    /// Zero-based line index in the source file.
    pub line: usize,
}

impl Task {
    /// Status implied by the subtasks, or `None` when the task has no subtasks
    /// or the subtasks have not settled yet.
    ///
    /// Optional subtasks may be completed or skipped; a required subtask that
    /// failed fails the parent.
    pub fn derived_status(&self) -> Option<TaskStatus> {
        if self.subtasks.is_empty() {
            return None;
        }
        if self
            .subtasks
            .iter()
            .any(|sub| !sub.optional && sub.status == TaskStatus::Failed)
        {
            return Some(TaskStatus::Failed);
        }
        let settled = self.subtasks.iter().all(|sub| {
            sub.status == TaskStatus::Completed || (sub.optional && sub.status.is_terminal())
        });
        settled.then_some(TaskStatus::Completed)
    }
}

/// Borrowed view over either a task or a subtask.
#[derive(Debug, Clone, Copy)]
pub enum ItemRef<'a> {
    Task(&'a Task),
    Subtask {
        parent: &'a Task,
        subtask: &'a Subtask,
    },
}

impl<'a> ItemRef<'a> {
    pub fn id(&self) -> &'a str {
        match self {
            Self::Task(task) => &task.id,
            Self::Subtask { subtask, .. } => &subtask.id,
        }
    }

    pub fn title(&self) -> &'a str {
        match self {
            Self::Task(task) => &task.title,
            Self::Subtask { subtask, .. } => &subtask.title,
        }
    }

    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Task(task) => task.status,
            Self::Subtask { subtask, .. } => subtask.status,
        }
    }

    pub fn optional(&self) -> bool {
        match self {
            Self::Task(task) => task.optional,
            Self::Subtask { subtask, .. } => subtask.optional,
        }
    }

    pub fn description(&self) -> &'a [String] {
        match self {
            Self::Task(task) => &task.description,
            Self::Subtask { subtask, .. } => &subtask.description,
        }
    }

    pub fn requirements(&self) -> &'a [String] {
        match self {
            Self::Task(task) => &task.requirements,
            Self::Subtask { subtask, .. } => &subtask.requirements,
        }
    }

    pub fn dependencies(&self) -> &'a [String] {
        match self {
            Self::Task(task) => &task.dependencies,
            Self::Subtask { subtask, .. } => &subtask.dependencies,
        }
    }

    pub fn line(&self) -> usize {
        match self {
            Self::Task(task) => task.line,
            Self::Subtask { subtask, .. } => subtask.line,
        }
    }

    /// The task owning this item (itself for a task).
    pub fn parent_task(&self) -> &'a Task {
        match self {
            Self::Task(task) => task,
            Self::Subtask { parent, .. } => parent,
        }
    }

    /// True when the engine dispatches this item directly.
    pub fn is_unit(&self) -> bool {
        match self {
            Self::Task(task) => task.subtasks.is_empty(),
            Self::Subtask { .. } => true,
        }
    }
}

/// A named collection of tasks plus the context documents used for prompts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spec {
    pub name: String,
    pub dir: PathBuf,
    pub tasks_path: PathBuf,
    pub requirements_path: PathBuf,
    pub design_path: PathBuf,
    pub tasks: Vec<Task>,
}

impl Spec {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>, tasks: Vec<Task>) -> Self {
        let dir = dir.into();
        Self {
            name: name.into(),
            tasks_path: dir.join("tasks.md"),
            requirements_path: dir.join("requirements.md"),
            design_path: dir.join("design.md"),
            dir,
            tasks,
        }
    }

    pub fn item(&self, id: &str) -> Option<ItemRef<'_>> {
        for task in &self.tasks {
            if task.id == id {
                return Some(ItemRef::Task(task));
            }
            if let Some(subtask) = task.subtasks.iter().find(|sub| sub.id == id) {
                return Some(ItemRef::Subtask {
                    parent: task,
                    subtask,
                });
            }
        }
        None
    }

    pub fn status_of(&self, id: &str) -> Option<TaskStatus> {
        self.item(id).map(|item| item.status())
    }

    /// Set the in-memory status of a task or subtask. Returns whether the id exists.
    pub fn set_status(&mut self, id: &str, status: TaskStatus) -> bool {
        for task in &mut self.tasks {
            if task.id == id {
                task.status = status;
                return true;
            }
            if let Some(subtask) = task.subtasks.iter_mut().find(|sub| sub.id == id) {
                subtask.status = status;
                return true;
            }
        }
        false
    }

    /// Every item in document order: each task followed by its subtasks.
    pub fn items(&self) -> impl Iterator<Item = ItemRef<'_>> {
        self.tasks.iter().flat_map(|task| {
            std::iter::once(ItemRef::Task(task)).chain(
                task.subtasks
                    .iter()
                    .map(move |subtask| ItemRef::Subtask {
                        parent: task,
                        subtask,
                    }),
            )
        })
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn parent_of(&self, id: &str) -> Option<&Task> {
        match self.item(id)? {
            ItemRef::Subtask { parent, .. } => Some(parent),
            ItemRef::Task(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{subtask, task};

    #[test]
    fn marks_map_to_statuses() {
        assert_eq!(TaskStatus::from_mark(' '), Some(TaskStatus::Pending));
        assert_eq!(TaskStatus::from_mark('X'), Some(TaskStatus::Completed));
        assert_eq!(TaskStatus::from_mark('-'), Some(TaskStatus::InProgress));
        assert_eq!(TaskStatus::from_mark('?'), None);
        assert_eq!(TaskStatus::Failed.mark(), ' ');
    }

    #[test]
    fn completed_never_advances_back_to_pending() {
        assert!(!TaskStatus::Completed.can_advance_to(TaskStatus::Pending));
        assert!(!TaskStatus::Completed.can_advance_to(TaskStatus::InProgress));
        assert!(!TaskStatus::InProgress.can_advance_to(TaskStatus::Pending));
        assert!(TaskStatus::Pending.can_advance_to(TaskStatus::InProgress));
        assert!(TaskStatus::InProgress.can_advance_to(TaskStatus::Completed));
        assert!(TaskStatus::Completed.can_advance_to(TaskStatus::Completed));
    }

    #[test]
    fn derived_status_requires_every_required_subtask() {
        let mut parent = task("1", vec![subtask("1.1"), subtask("1.2")]);
        parent.subtasks[1].optional = true;
        assert_eq!(parent.derived_status(), None);

        parent.subtasks[0].status = TaskStatus::Completed;
        assert_eq!(parent.derived_status(), None);

        parent.subtasks[1].status = TaskStatus::Skipped;
        assert_eq!(parent.derived_status(), Some(TaskStatus::Completed));

        parent.subtasks[0].status = TaskStatus::Failed;
        assert_eq!(parent.derived_status(), Some(TaskStatus::Failed));
    }

    #[test]
    fn task_keys_parse_from_spec_and_id() {
        assert_eq!("auth:2.1".parse::<TaskKey>(), Ok(TaskKey::new("auth", "2.1")));
        assert!("auth".parse::<TaskKey>().is_err());
        assert!(":2".parse::<TaskKey>().is_err());
        assert!("auth:two".parse::<TaskKey>().is_err());
    }
}
