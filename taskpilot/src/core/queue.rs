//! Deterministic selection of the next work unit across all specs.
//!
//! The execution queue is never stored: it is recomputed from the current plan
//! before every dispatch, so edits picked up by the watcher are always honoured.

use crate::core::dependency::{CycleError, DependencyGraph};
use crate::plan::{ItemRef, Spec, TaskKey, TaskStatus};

/// Operator-controlled knobs that shape the queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueuePolicy<'a> {
    /// Specs listed here run first, in this order; the rest follow alphabetically.
    pub spec_order: &'a [String],
    pub excluded_specs: &'a [String],
    /// `"spec:id"` or bare `"id"` (matches in every spec). Excluding a task
    /// excludes its subtasks.
    pub excluded_tasks: &'a [String],
    pub skip_optional: bool,
}

impl QueuePolicy<'_> {
    pub fn is_spec_excluded(&self, spec: &str) -> bool {
        self.excluded_specs.iter().any(|name| name == spec)
    }

    pub fn is_task_excluded(&self, spec: &str, id: &str) -> bool {
        let mut candidate = id;
        loop {
            let hit = self.excluded_tasks.iter().any(|entry| match entry.split_once(':') {
                Some((entry_spec, entry_id)) => entry_spec == spec && entry_id == candidate,
                None => entry == candidate,
            });
            if hit {
                return true;
            }
            match candidate.rsplit_once('.') {
                Some((parent, _)) => candidate = parent,
                None => return false,
            }
        }
    }
}

/// Specs in execution order with excluded specs removed.
pub fn ordered_specs<'s>(specs: &'s [Spec], policy: &QueuePolicy<'_>) -> Vec<&'s Spec> {
    let mut ordered: Vec<&Spec> = Vec::with_capacity(specs.len());
    for name in policy.spec_order {
        if let Some(spec) = specs.iter().find(|spec| &spec.name == name)
            && !ordered.iter().any(|seen| seen.name == spec.name)
        {
            ordered.push(spec);
        }
    }
    let mut rest: Vec<&Spec> = specs
        .iter()
        .filter(|spec| !policy.spec_order.contains(&spec.name))
        .collect();
    rest.sort_by(|a, b| a.name.cmp(&b.name));
    ordered.extend(rest);
    ordered.retain(|spec| !policy.is_spec_excluded(&spec.name));
    ordered
}

/// One entry of the execution queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub key: TaskKey,
    pub title: String,
    pub optional: bool,
    pub status: TaskStatus,
}

/// The full execution queue: every open, non-excluded unit in dispatch order.
pub fn execution_queue(
    specs: &[Spec],
    policy: &QueuePolicy<'_>,
) -> Result<Vec<QueueEntry>, (String, CycleError)> {
    let mut queue = Vec::new();
    for spec in ordered_specs(specs, policy) {
        let order = DependencyGraph::from_spec(spec)
            .compute_order()
            .map_err(|err| (spec.name.clone(), err))?;
        for id in order {
            let Some(item) = spec.item(&id) else {
                continue;
            };
            if !is_open_unit(&item) || policy.is_task_excluded(&spec.name, &id) {
                continue;
            }
            queue.push(QueueEntry {
                key: TaskKey::new(&spec.name, &id),
                title: item.title().to_string(),
                optional: item.optional(),
                status: item.status(),
            });
        }
    }
    Ok(queue)
}

/// What the engine should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Dispatch this unit.
    Dispatch(TaskKey),
    /// Optional unit skipped under `skip_optional`.
    Skip(TaskKey),
    /// The unit can never become eligible because these prerequisites will not
    /// complete.
    Blocked { key: TaskKey, unmet: Vec<String> },
}

/// First actionable unit, or `None` when the queue is exhausted.
pub fn select_next(
    specs: &[Spec],
    policy: &QueuePolicy<'_>,
) -> Result<Option<Selection>, (String, CycleError)> {
    for spec in ordered_specs(specs, policy) {
        let graph = DependencyGraph::from_spec(spec);
        let order = graph
            .compute_order()
            .map_err(|err| (spec.name.clone(), err))?;

        for id in order {
            let Some(item) = spec.item(&id) else {
                continue;
            };
            if !is_open_unit(&item) || policy.is_task_excluded(&spec.name, &id) {
                continue;
            }
            let key = TaskKey::new(&spec.name, &id);
            if item.optional() && policy.skip_optional {
                return Ok(Some(Selection::Skip(key)));
            }
            let unmet = unmet_prerequisites(spec, &graph, &id, policy);
            if !unmet.is_empty() {
                return Ok(Some(Selection::Blocked { key, unmet }));
            }
            return Ok(Some(Selection::Dispatch(key)));
        }
    }
    Ok(None)
}

/// Prerequisites of `id` that are not satisfied right now.
pub fn unmet_prerequisites(
    spec: &Spec,
    graph: &DependencyGraph,
    id: &str,
    policy: &QueuePolicy<'_>,
) -> Vec<String> {
    graph
        .prerequisites(id)
        .iter()
        .filter(|dep| !is_satisfied(spec, dep, policy))
        .cloned()
        .collect()
}

fn is_satisfied(spec: &Spec, id: &str, policy: &QueuePolicy<'_>) -> bool {
    if policy.is_task_excluded(&spec.name, id) {
        return true;
    }
    match spec.item(id) {
        Some(item) => {
            item.status().satisfies_dependency()
                || matches!(item, ItemRef::Task(task) if task.derived_status() == Some(TaskStatus::Completed))
        }
        None => false,
    }
}

fn is_open_unit(item: &ItemRef<'_>) -> bool {
    item.is_unit() && matches!(item.status(), TaskStatus::Pending | TaskStatus::InProgress)
}
