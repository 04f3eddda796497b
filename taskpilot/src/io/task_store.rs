//! Discovery and persistence of specs under `<workspace>/<specs_dir>/`.
//!
//! The store owns the in-memory plan. Status changes are made in memory with
//! [`TaskStore::update_status`] and written back with [`TaskStore::persist`],
//! which rewrites only the status mark of the item's line.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::task_file::{parse_tasks, rewrite_mark};
use crate::io::watcher::StoreEvent;
use crate::plan::{Spec, TaskKey, TaskStatus};

pub const TASKS_FILE: &str = "tasks.md";

#[derive(Debug)]
pub struct TaskStore {
    specs_root: PathBuf,
    specs: Vec<Spec>,
    /// Contents each tasks file had when last parsed or written by us.
    snapshots: HashMap<PathBuf, String>,
    /// Files the watcher reported as changed since they were last parsed.
    stale: HashSet<PathBuf>,
}

impl TaskStore {
    pub fn new(specs_root: impl Into<PathBuf>) -> Self {
        Self {
            specs_root: specs_root.into(),
            specs: Vec::new(),
            snapshots: HashMap::new(),
            stale: HashSet::new(),
        }
    }

    pub fn specs_root(&self) -> &Path {
        &self.specs_root
    }

    pub fn specs(&self) -> &[Spec] {
        &self.specs
    }

    pub fn spec(&self, name: &str) -> Option<&Spec> {
        self.specs.iter().find(|spec| spec.name == name)
    }

    pub fn status_of(&self, key: &TaskKey) -> Option<TaskStatus> {
        self.spec(&key.spec)?.status_of(&key.id)
    }

    /// Parse every `<specs_root>/<spec>/tasks.md`.
    ///
    /// A missing specs directory yields an empty plan. Unreadable spec files
    /// are logged and skipped. Failed and skipped statuses known in memory are
    /// carried over, since the file format cannot express them.
    #[instrument(skip_all, fields(root = %self.specs_root.display()))]
    pub fn discover(&mut self) -> Result<&[Spec]> {
        let mut discovered = Vec::new();
        self.snapshots.clear();
        self.stale.clear();

        if !self.specs_root.is_dir() {
            warn!("specs directory does not exist");
            self.specs = discovered;
            return Ok(&self.specs);
        }

        let mut dirs: Vec<PathBuf> = fs::read_dir(&self.specs_root)
            .with_context(|| format!("read specs dir {}", self.specs_root.display()))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.join(TASKS_FILE).is_file())
            .collect();
        dirs.sort();

        for dir in dirs {
            let Some(name) = dir.file_name().and_then(|name| name.to_str()).map(str::to_string)
            else {
                warn!(path = %dir.display(), "skipping spec directory with non-utf8 name");
                continue;
            };
            let tasks_path = dir.join(TASKS_FILE);
            let contents = match fs::read_to_string(&tasks_path) {
                Ok(contents) => contents,
                Err(err) => {
                    warn!(path = %tasks_path.display(), error = %err, "skipping unreadable spec");
                    continue;
                }
            };
            let mut spec = Spec::new(&name, &dir, parse_tasks(&name, &tasks_path, &contents).tasks);
            if let Some(previous) = self.spec(&name) {
                carry_session_statuses(previous, &mut spec);
            }
            debug!(spec = %name, tasks = spec.tasks.len(), "parsed spec");
            self.snapshots.insert(tasks_path, contents);
            discovered.push(spec);
        }

        info!(specs = discovered.len(), "discovered specs");
        self.specs = discovered;
        Ok(&self.specs)
    }

    /// Set the in-memory status of an item. Returns whether the item exists.
    pub fn update_status(&mut self, key: &TaskKey, status: TaskStatus) -> bool {
        self.specs
            .iter_mut()
            .find(|spec| spec.name == key.spec)
            .is_some_and(|spec| spec.set_status(&key.id, status))
    }

    /// Write the in-memory status of `key` to its tasks file.
    ///
    /// When the file changed on disk since it was parsed, it is re-parsed first
    /// and the line is located again by id. A status whose mark is already on
    /// disk leaves the file untouched.
    #[instrument(skip(self), fields(task = %key))]
    pub fn persist(&mut self, key: &TaskKey) -> Result<()> {
        let spec = self
            .spec(&key.spec)
            .ok_or_else(|| anyhow!("unknown spec {}", key.spec))?;
        let status = spec
            .status_of(&key.id)
            .ok_or_else(|| anyhow!("unknown task {key}"))?;
        let path = spec.tasks_path.clone();

        let on_disk = fs::read_to_string(&path)
            .with_context(|| format!("read tasks file {}", path.display()))?;
        let changed = self.stale.contains(&path)
            || self.snapshots.get(&path).is_none_or(|snapshot| *snapshot != on_disk);
        if changed {
            debug!(path = %path.display(), "tasks file changed externally; re-parsing before write");
            self.apply_contents(&key.spec, &path, &on_disk);
            // The external edit must not clobber the status being persisted.
            self.update_status(key, status);
        }

        let updated = rewrite_mark(&on_disk, &key.id, status)
            .ok_or_else(|| anyhow!("task {key} not found in {}", path.display()))?;
        if updated != on_disk {
            super::write_atomic(&path, &updated)?;
            debug!(path = %path.display(), mark = %status.mark(), "persisted status");
        }
        self.snapshots.insert(path.clone(), updated);
        self.stale.remove(&path);
        Ok(())
    }

    /// Operator reset: back to pending, persisted.
    pub fn reset(&mut self, key: &TaskKey) -> Result<()> {
        if !self.update_status(key, TaskStatus::Pending) {
            return Err(anyhow!("unknown task {key}"));
        }
        self.persist(key)
    }

    /// React to a watcher notification.
    pub fn handle_event(&mut self, event: &StoreEvent) -> Result<()> {
        match event {
            StoreEvent::Changed(path) => self.reload_file(path),
            StoreEvent::Removed(path) => {
                warn!(path = %path.display(), "tasks file removed; keeping last parsed plan");
                self.stale.insert(path.clone());
                Ok(())
            }
        }
    }

    /// Re-parse one tasks file if its contents differ from what we last saw.
    ///
    /// Files of specs not yet known trigger a full rediscovery.
    pub fn reload_file(&mut self, path: &Path) -> Result<()> {
        let Some(spec_name) = self
            .specs
            .iter()
            .find(|spec| spec.tasks_path == path)
            .map(|spec| spec.name.clone())
        else {
            if path.starts_with(&self.specs_root) && path.ends_with(TASKS_FILE) {
                info!(path = %path.display(), "new spec appeared; rediscovering");
                self.discover()?;
            }
            return Ok(());
        };

        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "tasks file unreadable; marking stale");
                self.stale.insert(path.to_path_buf());
                return Ok(());
            }
        };
        if self.snapshots.get(path) == Some(&contents) {
            // Our own write echoing back through the watcher.
            self.stale.remove(path);
            return Ok(());
        }
        info!(spec = %spec_name, "tasks file edited externally; re-parsing");
        self.apply_contents(&spec_name, path, &contents);
        Ok(())
    }

    fn apply_contents(&mut self, spec_name: &str, path: &Path, contents: &str) {
        let Some(index) = self.specs.iter().position(|spec| spec.name == spec_name) else {
            return;
        };
        let tasks = parse_tasks(spec_name, path, contents).tasks;
        let mut fresh = Spec::new(spec_name, self.specs[index].dir.clone(), tasks);
        carry_session_statuses(&self.specs[index], &mut fresh);
        self.specs[index] = fresh;
        self.snapshots.insert(path.to_path_buf(), contents.to_string());
        self.stale.remove(path);
    }
}

/// Keep failed/skipped statuses for items whose box is still empty on disk.
fn carry_session_statuses(previous: &Spec, fresh: &mut Spec) {
    let carried: Vec<(String, TaskStatus)> = previous
        .items()
        .filter(|item| matches!(item.status(), TaskStatus::Failed | TaskStatus::Skipped))
        .map(|item| (item.id().to_string(), item.status()))
        .collect();
    for (id, status) in carried {
        if fresh.status_of(&id) == Some(TaskStatus::Pending) {
            fresh.set_status(&id, status);
        }
    }
}
