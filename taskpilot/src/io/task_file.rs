//! Checklist file format: parsing `tasks.md` and rewriting a single status mark.
//!
//! ```text
//! - [ ] 1. Set up project
//!   - [x] 1.1 Create crate
//!     - Add the manifest
//!     - _Requirements: 1.1, 2.3_
//!   - [ ]* 1.2 Optional polish
//!     - _Depends on: 1.1_
//! - [~] 2. Wire the API
//! ```
//!
//! Status rewrites touch exactly one byte range (the mark between the
//! brackets) and locate the line by task id, never by line number alone.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use crate::core::task_id::{is_child_of, is_valid_id};
use crate::plan::{Subtask, Task, TaskStatus};

static CHECKBOX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<indent>[ \t]*)[-*] \[(?P<mark>[^\]]?)\](?P<optional>\*)?[ \t]+(?P<id>\d+(?:\.\d+)*)\.?[ \t]+(?P<title>.*?)[ \t]*$",
    )
    .expect("checkbox regex must compile")
});

static REQUIREMENTS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[ \t]*(?:[-*][ \t]+)?_Requirements:[ \t]*(?P<refs>.*?)_[ \t]*$")
        .expect("requirements regex must compile")
});

static DEPENDS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[ \t]*(?:[-*][ \t]+)?_(?:Depends on|Dependencies):[ \t]*(?P<refs>.*?)_[ \t]*$")
        .expect("dependencies regex must compile")
});

/// A line the parser refused, with its zero-based index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseWarning {
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedTasks {
    pub tasks: Vec<Task>,
    pub warnings: Vec<ParseWarning>,
}

/// Where the next annotation line attaches.
#[derive(Clone, Copy)]
enum Cursor {
    None,
    Task,
    Subtask,
}

/// Parse a checklist file. Malformed lines are skipped and reported; parsing
/// itself never fails.
pub fn parse_tasks(spec_name: &str, source: &Path, contents: &str) -> ParsedTasks {
    let mut parsed = ParsedTasks::default();
    let mut cursor = Cursor::None;

    for (index, raw) in contents.split('\n').enumerate() {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if line.trim().is_empty() {
            continue;
        }

        if let Some(caps) = CHECKBOX_RE.captures(line) {
            let indent = &caps["indent"];
            let id = caps["id"].to_string();
            let title = caps["title"].to_string();
            let optional = caps.name("optional").is_some();
            let mark = caps["mark"].chars().next().unwrap_or(' ');

            let Some(status) = TaskStatus::from_mark(mark) else {
                reject(&mut parsed, source, index, format!("unknown status mark {mark:?} on {id}"));
                cursor = Cursor::None;
                continue;
            };
            if !is_valid_id(&id) {
                reject(&mut parsed, source, index, format!("invalid task id {id}"));
                cursor = Cursor::None;
                continue;
            }
            if is_duplicate(&parsed.tasks, &id) {
                reject(&mut parsed, source, index, format!("duplicate task id {id}"));
                cursor = Cursor::None;
                continue;
            }

            let depth = id.split('.').count();
            match (indent.is_empty(), depth) {
                (true, 1) => {
                    parsed.tasks.push(Task {
                        id,
                        title,
                        description: Vec::new(),
                        status,
                        optional,
                        requirements: Vec::new(),
                        dependencies: Vec::new(),
                        subtasks: Vec::new(),
                        spec_name: spec_name.to_string(),
                        source: source.to_path_buf(),
                        line: index,
                    });
                    cursor = Cursor::Task;
                }
                (false, 2) => {
                    let Some(parent) = parsed.tasks.last_mut() else {
                        reject(&mut parsed, source, index, format!("subtask {id} before any task"));
                        cursor = Cursor::None;
                        continue;
                    };
                    if !is_child_of(&id, &parent.id) {
                        let message = format!("subtask {id} does not belong to task {}", parent.id);
                        reject(&mut parsed, source, index, message);
                        cursor = Cursor::None;
                        continue;
                    }
                    parent.subtasks.push(Subtask {
                        id,
                        title,
                        description: Vec::new(),
                        status,
                        optional,
                        requirements: Vec::new(),
                        dependencies: Vec::new(),
                        line: index,
                    });
                    cursor = Cursor::Subtask;
                }
                (true, _) => {
                    reject(&mut parsed, source, index, format!("compound id {id} at top level"));
                    cursor = Cursor::None;
                }
                (false, _) => {
                    reject(&mut parsed, source, index, format!("nested item {id} is too deep or not a subtask"));
                    cursor = Cursor::None;
                }
            }
            continue;
        }

        if let Some(caps) = REQUIREMENTS_RE.captures(line) {
            let refs = split_refs(&caps["refs"]);
            if let Some(target) = annotation_target(&mut parsed.tasks, cursor) {
                target.requirements.extend(refs);
            }
            continue;
        }

        if let Some(caps) = DEPENDS_RE.captures(line) {
            let refs: Vec<String> = split_refs(&caps["refs"])
                .into_iter()
                .map(|dep| dep.trim_start_matches(|c: char| !c.is_ascii_digit()).to_string())
                .filter(|dep| is_valid_id(dep))
                .collect();
            if let Some(target) = annotation_target(&mut parsed.tasks, cursor) {
                target.dependencies.extend(refs);
            }
            continue;
        }

        let indented = line.starts_with([' ', '\t']);
        if !indented {
            // Headings and prose close the current item.
            cursor = Cursor::None;
            continue;
        }
        let text = line.trim();
        let text = text
            .strip_prefix("- ")
            .or_else(|| text.strip_prefix("* "))
            .unwrap_or(text);
        if let Some(target) = annotation_target(&mut parsed.tasks, cursor) {
            target.description.push(text.to_string());
        }
    }

    parsed
}

/// Mutable view over the annotation fields shared by tasks and subtasks.
struct Annotations<'a> {
    description: &'a mut Vec<String>,
    requirements: &'a mut Vec<String>,
    dependencies: &'a mut Vec<String>,
}

fn annotation_target(tasks: &mut [Task], cursor: Cursor) -> Option<Annotations<'_>> {
    let task = tasks.last_mut()?;
    match cursor {
        Cursor::None => None,
        Cursor::Task => Some(Annotations {
            description: &mut task.description,
            requirements: &mut task.requirements,
            dependencies: &mut task.dependencies,
        }),
        Cursor::Subtask => {
            let sub = task.subtasks.last_mut()?;
            Some(Annotations {
                description: &mut sub.description,
                requirements: &mut sub.requirements,
                dependencies: &mut sub.dependencies,
            })
        }
    }
}

fn split_refs(refs: &str) -> Vec<String> {
    refs.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_duplicate(tasks: &[Task], id: &str) -> bool {
    tasks
        .iter()
        .any(|task| task.id == id || task.subtasks.iter().any(|sub| sub.id == id))
}

fn reject(parsed: &mut ParsedTasks, source: &Path, line: usize, message: String) {
    warn!(path = %source.display(), line = line + 1, %message, "skipping malformed task line");
    parsed.warnings.push(ParseWarning { line, message });
}

/// Byte offset of the status mark for item `id`, located by id.
pub fn find_mark(contents: &str, id: &str) -> Option<usize> {
    let mut offset = 0;
    for raw in contents.split('\n') {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if let Some(caps) = CHECKBOX_RE.captures(line)
            && &caps["id"] == id
            && let Some(mark) = caps.name("mark")
        {
            return Some(offset + mark.start());
        }
        offset += raw.len() + 1;
    }
    None
}

/// Rewrite the mark of item `id` to the mark for `status`.
///
/// Returns `None` when no checkbox line carries `id`. Every byte outside the
/// mark is preserved; an empty mark (`[]`) gains one byte.
pub fn rewrite_mark(contents: &str, id: &str, status: TaskStatus) -> Option<String> {
    let start = find_mark(contents, id)?;
    let end = contents[start..]
        .find(']')
        .map(|len| start + len)
        .unwrap_or(start);
    let existing = &contents[start..end];
    let current = existing.chars().next().and_then(TaskStatus::from_mark);
    // A mark that already encodes the status is left alone, including `X`/`-` aliases.
    if current.map(TaskStatus::mark) == Some(status.mark()) && !existing.is_empty() {
        return Some(contents.to_string());
    }

    let mut out = String::with_capacity(contents.len() + 1);
    out.push_str(&contents[..start]);
    out.push(status.mark());
    out.push_str(&contents[end..]);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "# Implementation Plan

- [ ] 1. Set up project
  - Create workspace layout
  - _Requirements: 1.1, 2.3_
  - [x] 1.1 Create crate
    - _Requirements: 1.2_
  - [ ]* 1.2 Optional polish
    - _Depends on: 1.1_

- [~] 2. Wire the API
  - _Dependencies: 1_
- [-] 3. Alias in progress
";

    fn parse(contents: &str) -> ParsedTasks {
        parse_tasks("demo", Path::new("/tmp/demo/tasks.md"), contents)
    }

    #[test]
    fn parses_tasks_subtasks_and_annotations() {
        let parsed = parse(SAMPLE);
        assert!(parsed.warnings.is_empty(), "{:?}", parsed.warnings);
        assert_eq!(parsed.tasks.len(), 3);

        let first = &parsed.tasks[0];
        assert_eq!(first.id, "1");
        assert_eq!(first.title, "Set up project");
        assert_eq!(first.status, TaskStatus::Pending);
        assert_eq!(first.description, vec!["Create workspace layout"]);
        assert_eq!(first.requirements, vec!["1.1", "2.3"]);
        assert_eq!(first.line, 2);
        assert_eq!(first.subtasks.len(), 2);

        let done = &first.subtasks[0];
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.requirements, vec!["1.2"]);

        let optional = &first.subtasks[1];
        assert!(optional.optional);
        assert_eq!(optional.dependencies, vec!["1.1"]);

        assert_eq!(parsed.tasks[1].status, TaskStatus::InProgress);
        assert_eq!(parsed.tasks[1].dependencies, vec!["1"]);
        assert_eq!(parsed.tasks[2].status, TaskStatus::InProgress);
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let contents = "- [ ] 1.1 Compound at top
  - [ ] 4.1 Orphan subtask
- [ ] 1. Real task
  - [ ] 2.1 Wrong parent
- [?] 2. Unknown mark
- [ ] 1. Duplicate
- [ ] 3. Fine
";
        let parsed = parse(contents);
        let ids: Vec<&str> = parsed.tasks.iter().map(|task| task.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(parsed.warnings.len(), 5);
        assert!(parsed.tasks[0].subtasks.is_empty());
    }

    #[test]
    fn dependency_refs_accept_task_prefix() {
        let parsed = parse("- [ ] 1. A\n- [ ] 2. B\n  - _Depends on: Task 1, bogus_\n");
        assert_eq!(parsed.tasks[1].dependencies, vec!["1"]);
    }

    #[test]
    fn rewrite_changes_only_the_mark_byte() {
        let updated = rewrite_mark(SAMPLE, "1.2", TaskStatus::Completed).expect("found");
        assert_eq!(updated.len(), SAMPLE.len());
        let diff: Vec<usize> = SAMPLE
            .bytes()
            .zip(updated.bytes())
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(idx, _)| idx)
            .collect();
        assert_eq!(diff.len(), 1);
        assert!(updated.contains("- [x]* 1.2 Optional polish"));
    }

    #[test]
    fn rewrite_with_matching_mark_is_identity() {
        let same = rewrite_mark(SAMPLE, "1.1", TaskStatus::Completed).expect("found");
        assert_eq!(same, SAMPLE);
        let alias = rewrite_mark(SAMPLE, "3", TaskStatus::InProgress).expect("found");
        assert_eq!(alias, SAMPLE);
    }

    #[test]
    fn rewrite_locates_line_by_id_not_number() {
        let shifted = format!("extra heading\n\n{SAMPLE}");
        let updated = rewrite_mark(&shifted, "2", TaskStatus::Completed).expect("found");
        assert!(updated.contains("- [x] 2. Wire the API"));
        assert!(rewrite_mark(SAMPLE, "9", TaskStatus::Completed).is_none());
    }

    #[test]
    fn crlf_files_keep_their_line_endings() {
        let contents = "- [ ] 1. First\r\n- [ ] 2. Second\r\n";
        let parsed = parse(contents);
        assert_eq!(parsed.tasks[1].title, "Second");
        let updated = rewrite_mark(contents, "2", TaskStatus::Completed).expect("found");
        assert_eq!(updated, "- [ ] 1. First\r\n- [x] 2. Second\r\n");
    }

    #[test]
    fn failed_status_persists_as_blank_box() {
        let contents = "- [~] 1. Attempted\n";
        let updated = rewrite_mark(contents, "1", TaskStatus::Failed).expect("found");
        assert_eq!(updated, "- [ ] 1. Attempted\n");
    }
}
