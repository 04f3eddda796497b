//! Dependency graph over the items of a spec: cycle detection and execution order.
//!
//! Edges point from an item to its prerequisites. Besides declared
//! dependencies the graph carries two implicit edge kinds:
//!
//! - containment: a task with subtasks depends on each of its subtasks;
//! - inheritance: a subtask depends on its parent's declared dependencies.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use thiserror::Error;

use crate::core::task_id::{IdKey, compare_ids};
use crate::plan::Spec;

/// Ordering refused because the graph is cyclic.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{}", describe_cycles(.cycles))]
pub struct CycleError {
    pub cycles: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    prerequisites: BTreeMap<IdKey, Vec<String>>,
}

impl DependencyGraph {
    /// Build the graph for one spec. Dependencies on unknown ids are dropped here;
    /// [`validate_plan`] reports them.
    pub fn from_spec(spec: &Spec) -> Self {
        let known: HashSet<&str> = spec.items().map(|item| item.id()).collect();
        let mut prerequisites = BTreeMap::new();

        for task in &spec.tasks {
            let mut deps: Vec<String> = task
                .dependencies
                .iter()
                .chain(task.subtasks.iter().map(|sub| &sub.id))
                .filter(|dep| known.contains(dep.as_str()))
                .cloned()
                .collect();
            sort_dedup(&mut deps);
            prerequisites.insert(IdKey(task.id.clone()), deps);

            for sub in &task.subtasks {
                let mut deps: Vec<String> = sub
                    .dependencies
                    .iter()
                    .chain(task.dependencies.iter())
                    .filter(|dep| known.contains(dep.as_str()))
                    .cloned()
                    .collect();
                sort_dedup(&mut deps);
                prerequisites.insert(IdKey(sub.id.clone()), deps);
            }
        }

        Self { prerequisites }
    }

    /// Build a graph directly from `(id, prerequisites)` pairs.
    pub fn from_edges<'a>(edges: impl IntoIterator<Item = (&'a str, Vec<&'a str>)>) -> Self {
        let mut prerequisites: BTreeMap<IdKey, Vec<String>> = BTreeMap::new();
        for (id, deps) in edges {
            let mut deps: Vec<String> = deps.into_iter().map(str::to_string).collect();
            sort_dedup(&mut deps);
            prerequisites.insert(IdKey(id.to_string()), deps);
        }
        let missing: Vec<String> = prerequisites
            .values()
            .flatten()
            .filter(|dep| !prerequisites.contains_key(&IdKey((*dep).clone())))
            .cloned()
            .collect();
        for dep in missing {
            prerequisites.entry(IdKey(dep)).or_default();
        }
        Self { prerequisites }
    }

    pub fn prerequisites(&self, id: &str) -> &[String] {
        self.prerequisites
            .get(&IdKey(id.to_string()))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.prerequisites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prerequisites.is_empty()
    }

    /// Every cycle reachable by a depth-first walk, each reported once.
    ///
    /// A cycle is returned closed (`["2", "5", "2"]`) and rotated so its smallest
    /// id comes first.
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        let mut walk = CycleWalk {
            graph: self,
            state: HashMap::new(),
            stack: Vec::new(),
            found: BTreeSet::new(),
            cycles: Vec::new(),
        };
        for id in self.prerequisites.keys() {
            if !walk.state.contains_key(id.0.as_str()) {
                walk.visit(&id.0);
            }
        }
        walk.cycles
    }

    /// Topological order (prerequisites first) with ties broken by ascending id.
    ///
    /// Fails closed: any cycle makes the order undefined.
    pub fn compute_order(&self) -> Result<Vec<String>, CycleError> {
        let mut remaining: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (id, deps) in &self.prerequisites {
            remaining.insert(id.0.as_str(), deps.len());
            for dep in deps {
                dependents.entry(dep.as_str()).or_default().push(id.0.as_str());
            }
        }

        let mut ready: BTreeSet<IdKey> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| IdKey((*id).to_string()))
            .collect();
        let mut order = Vec::with_capacity(self.prerequisites.len());

        while let Some(next) = ready.pop_first() {
            if let Some(children) = dependents.get(next.0.as_str()) {
                for child in children {
                    if let Some(count) = remaining.get_mut(child) {
                        *count -= 1;
                        if *count == 0 {
                            ready.insert(IdKey((*child).to_string()));
                        }
                    }
                }
            }
            order.push(next.0);
        }

        if order.len() < self.prerequisites.len() {
            return Err(CycleError {
                cycles: self.detect_cycles(),
            });
        }
        Ok(order)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    OnStack,
    Done,
}

struct CycleWalk<'g> {
    graph: &'g DependencyGraph,
    state: HashMap<&'g str, Visit>,
    stack: Vec<&'g str>,
    found: BTreeSet<Vec<String>>,
    cycles: Vec<Vec<String>>,
}

impl<'g> CycleWalk<'g> {
    fn visit(&mut self, id: &'g str) {
        self.state.insert(id, Visit::OnStack);
        self.stack.push(id);

        let graph = self.graph;
        let mut deps: Vec<&'g str> = graph.prerequisites(id).iter().map(String::as_str).collect();
        deps.sort_by(|a, b| compare_ids(a, b));

        for dep in deps {
            match self.state.get(dep).copied() {
                None => self.visit(dep),
                Some(Visit::OnStack) => self.record(dep),
                Some(Visit::Done) => {}
            }
        }

        self.stack.pop();
        self.state.insert(id, Visit::Done);
    }

    fn record(&mut self, back_to: &str) {
        let Some(start) = self.stack.iter().position(|id| *id == back_to) else {
            return;
        };
        let body: Vec<String> = self.stack[start..].iter().map(|id| (*id).to_string()).collect();
        let rotated = rotate_to_smallest(body);
        if self.found.insert(rotated.clone()) {
            let mut closed = rotated.clone();
            closed.push(rotated[0].clone());
            self.cycles.push(closed);
        }
    }
}

fn rotate_to_smallest(mut body: Vec<String>) -> Vec<String> {
    let pivot = body
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| compare_ids(a, b))
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    body.rotate_left(pivot);
    body
}

fn sort_dedup(ids: &mut Vec<String>) {
    ids.sort_by(|a, b| compare_ids(a, b));
    ids.dedup();
}

/// Render one closed cycle as `cycle: 2 → 5 → 2`.
pub fn describe_cycle(cycle: &[String]) -> String {
    format!("cycle: {}", cycle.join(" → "))
}

fn describe_cycles(cycles: &[Vec<String>]) -> String {
    if cycles.is_empty() {
        return "dependency graph is cyclic".to_string();
    }
    cycles
        .iter()
        .map(|cycle| describe_cycle(cycle))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Check plan-level invariants that make ordering impossible or meaningless:
/// unknown dependency ids and dependency cycles. Messages name the spec.
pub fn validate_plan(specs: &[Spec]) -> Vec<String> {
    let mut errors = Vec::new();
    for spec in specs {
        let known: HashSet<&str> = spec.items().map(|item| item.id()).collect();
        for item in spec.items() {
            for dep in item.dependencies() {
                if !known.contains(dep.as_str()) {
                    errors.push(format!(
                        "{}: task {} depends on unknown task {}",
                        spec.name,
                        item.id(),
                        dep
                    ));
                }
            }
        }
        for cycle in DependencyGraph::from_spec(spec).detect_cycles() {
            errors.push(format!("{}: {}", spec.name, describe_cycle(&cycle)));
        }
    }
    errors
}
