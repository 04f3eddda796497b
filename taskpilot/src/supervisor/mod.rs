//! Resource and performance supervision for long sessions.
//!
//! [`Supervisor::evaluate`] is pure: it takes a [`Snapshot`] and returns the
//! alerts that snapshot raises. Sampling and the periodic loop live in the
//! engine's monitor task.

pub mod cache;
pub mod registry;

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::io::config::EngineConfig;
use crate::io::probe::ResourceSample;
use crate::plan::TaskKey;

const MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds {
    pub max_memory_mb: u64,
    pub max_cpu_percent: f64,
    pub max_task_duration: Duration,
    pub leak_window: usize,
    pub leak_growth_mb: u64,
}

impl Thresholds {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_memory_mb: config.max_memory_mb,
            max_cpu_percent: config.max_cpu_percent,
            max_task_duration: Duration::from_millis(config.resources.max_task_duration_ms),
            leak_window: config.resources.leak_window,
            leak_growth_mb: config.resources.leak_growth_mb,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Memory,
    Cpu,
    TaskDuration,
    SuspectedLeak,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Memory => "memory",
            Self::Cpu => "cpu",
            Self::TaskDuration => "task_duration",
            Self::SuspectedLeak => "suspected_leak",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceAlert {
    pub kind: AlertKind,
    pub message: String,
    pub value: f64,
    pub limit: f64,
    /// Resource category blamed for a suspected leak.
    pub category: Option<String>,
    /// Set when the engine should purge caches immediately.
    pub cleanup_requested: bool,
}

/// One observation of the process.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub at: DateTime<Utc>,
    pub sample: ResourceSample,
    /// Task in flight and how long it has been running.
    pub active_task: Option<(TaskKey, Duration)>,
    /// Tracked resources per category.
    pub resource_counts: BTreeMap<String, usize>,
}

#[derive(Debug, Clone)]
struct WindowPoint {
    memory_bytes: u64,
    counts: BTreeMap<String, usize>,
    cleaned: bool,
}

/// Evaluates snapshots against thresholds. Alerts are edge-triggered: each
/// condition alerts once when it starts and re-arms after it clears.
#[derive(Debug)]
pub struct Supervisor {
    thresholds: Thresholds,
    window: VecDeque<WindowPoint>,
    cleanup_pending: bool,
    active_conditions: HashSet<AlertKind>,
    alerted_task: Option<TaskKey>,
}

impl Supervisor {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            window: VecDeque::new(),
            cleanup_pending: false,
            active_conditions: HashSet::new(),
            alerted_task: None,
        }
    }

    /// Record that a cleanup happened; the next snapshot starts a fresh leak window.
    pub fn note_cleanup(&mut self) {
        self.cleanup_pending = true;
    }

    pub fn evaluate(&mut self, snapshot: Snapshot) -> Vec<PerformanceAlert> {
        let mut alerts = Vec::new();

        let memory_mb = snapshot.sample.memory_mb();
        let limit_mb = self.thresholds.max_memory_mb as f64;
        if self.edge(AlertKind::Memory, memory_mb > limit_mb) {
            alerts.push(PerformanceAlert {
                kind: AlertKind::Memory,
                message: format!("memory {memory_mb:.0} MB exceeds {limit_mb:.0} MB"),
                value: memory_mb,
                limit: limit_mb,
                category: None,
                cleanup_requested: true,
            });
        }

        let cpu = snapshot.sample.cpu_percent;
        let cpu_limit = self.thresholds.max_cpu_percent;
        if self.edge(AlertKind::Cpu, cpu > cpu_limit) {
            alerts.push(PerformanceAlert {
                kind: AlertKind::Cpu,
                message: format!("cpu {cpu:.1}% exceeds {cpu_limit:.1}%"),
                value: cpu,
                limit: cpu_limit,
                category: None,
                cleanup_requested: false,
            });
        }

        if let Some(alert) = self.check_task_duration(snapshot.active_task.as_ref()) {
            alerts.push(alert);
        }

        if let Some(alert) = self.check_leak(&snapshot) {
            alerts.push(alert);
        }

        alerts
    }

    /// True when `active` just became true.
    fn edge(&mut self, kind: AlertKind, active: bool) -> bool {
        if active {
            self.active_conditions.insert(kind)
        } else {
            self.active_conditions.remove(&kind);
            false
        }
    }

    fn check_task_duration(&mut self, active: Option<&(TaskKey, Duration)>) -> Option<PerformanceAlert> {
        let (key, elapsed) = active?;
        let limit = self.thresholds.max_task_duration;
        if *elapsed <= limit || self.alerted_task.as_ref() == Some(key) {
            return None;
        }
        self.alerted_task = Some(key.clone());
        Some(PerformanceAlert {
            kind: AlertKind::TaskDuration,
            message: format!(
                "task {key} running for {}s, over {}s",
                elapsed.as_secs(),
                limit.as_secs()
            ),
            value: elapsed.as_secs_f64(),
            limit: limit.as_secs_f64(),
            category: None,
            cleanup_requested: false,
        })
    }

    /// Strictly growing memory across the whole window, by more than the
    /// configured amount, with no cleanup inside the window.
    fn check_leak(&mut self, snapshot: &Snapshot) -> Option<PerformanceAlert> {
        let cleaned = std::mem::take(&mut self.cleanup_pending);
        if cleaned {
            self.window.clear();
        }
        self.window.push_back(WindowPoint {
            memory_bytes: snapshot.sample.memory_bytes,
            counts: snapshot.resource_counts.clone(),
            cleaned,
        });
        while self.window.len() > self.thresholds.leak_window {
            self.window.pop_front();
        }
        if self.window.len() < self.thresholds.leak_window {
            return None;
        }
        // The first point may be the cleanup itself; growth after it still counts.
        if self.window.iter().skip(1).any(|point| point.cleaned) {
            return None;
        }
        let strictly_growing = self
            .window
            .iter()
            .zip(self.window.iter().skip(1))
            .all(|(a, b)| b.memory_bytes > a.memory_bytes);
        let first = self.window.front()?;
        let last = self.window.back()?;
        let growth = last.memory_bytes.saturating_sub(first.memory_bytes);
        if !strictly_growing || growth <= self.thresholds.leak_growth_mb * MB {
            return None;
        }

        let category = last
            .counts
            .iter()
            .map(|(category, count)| {
                let before = first.counts.get(category).copied().unwrap_or(0);
                (category, count.saturating_sub(before))
            })
            .filter(|(_, grew)| *grew > 0)
            .max_by_key(|(_, grew)| *grew)
            .map(|(category, _)| category.clone());
        let growth_mb = growth as f64 / MB as f64;
        let message = match &category {
            Some(category) => format!(
                "memory grew {growth_mb:.0} MB over {} snapshots; {category} resources grew most",
                self.window.len()
            ),
            None => format!(
                "memory grew {growth_mb:.0} MB over {} snapshots; no tracked category grew",
                self.window.len()
            ),
        };
        self.window.clear();
        Some(PerformanceAlert {
            kind: AlertKind::SuspectedLeak,
            message,
            value: growth_mb,
            limit: self.thresholds.leak_growth_mb as f64,
            category,
            cleanup_requested: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> Thresholds {
        Thresholds {
            max_memory_mb: 100,
            max_cpu_percent: 80.0,
            max_task_duration: Duration::from_secs(60),
            leak_window: 3,
            leak_growth_mb: 10,
        }
    }

    fn snapshot(memory_mb: u64, cpu: f64) -> Snapshot {
        Snapshot {
            at: Utc::now(),
            sample: ResourceSample {
                memory_bytes: memory_mb * MB,
                cpu_percent: cpu,
            },
            active_task: None,
            resource_counts: BTreeMap::new(),
        }
    }

    fn kinds(alerts: &[PerformanceAlert]) -> Vec<AlertKind> {
        alerts.iter().map(|alert| alert.kind).collect()
    }

    #[test]
    fn memory_alert_fires_once_and_requests_cleanup() {
        let mut supervisor = Supervisor::new(thresholds());
        let alerts = supervisor.evaluate(snapshot(150, 0.0));
        assert_eq!(kinds(&alerts), vec![AlertKind::Memory]);
        assert!(alerts[0].cleanup_requested);

        assert!(supervisor.evaluate(snapshot(140, 0.0)).is_empty());
        assert!(supervisor.evaluate(snapshot(50, 0.0)).is_empty());
        assert_eq!(kinds(&supervisor.evaluate(snapshot(150, 0.0))), vec![AlertKind::Memory]);
    }

    #[test]
    fn cpu_alert_is_edge_triggered() {
        let mut supervisor = Supervisor::new(thresholds());
        assert_eq!(kinds(&supervisor.evaluate(snapshot(10, 95.0))), vec![AlertKind::Cpu]);
        assert!(supervisor.evaluate(snapshot(10, 96.0)).is_empty());
    }

    #[test]
    fn long_task_alerts_once_per_task() {
        let mut supervisor = Supervisor::new(thresholds());
        let mut snap = snapshot(10, 0.0);
        snap.active_task = Some((TaskKey::new("demo", "1"), Duration::from_secs(61)));
        assert_eq!(kinds(&supervisor.evaluate(snap.clone())), vec![AlertKind::TaskDuration]);
        assert!(supervisor.evaluate(snap).is_empty());
    }

    #[test]
    fn steady_growth_is_a_suspected_leak_naming_the_category() {
        let mut supervisor = Supervisor::new(thresholds());
        let mut alerts = Vec::new();
        for (step, memory) in [10u64, 20, 35].into_iter().enumerate() {
            let mut snap = snapshot(memory, 0.0);
            snap.resource_counts.insert("watcher".to_string(), 1);
            snap.resource_counts.insert("timer".to_string(), 1 + step * 4);
            alerts = supervisor.evaluate(snap);
        }
        assert_eq!(kinds(&alerts), vec![AlertKind::SuspectedLeak]);
        assert_eq!(alerts[0].category.as_deref(), Some("timer"));
    }

    #[test]
    fn cleanup_inside_window_suppresses_leak() {
        let mut supervisor = Supervisor::new(thresholds());
        supervisor.evaluate(snapshot(10, 0.0));
        supervisor.evaluate(snapshot(20, 0.0));
        supervisor.note_cleanup();
        assert!(supervisor.evaluate(snapshot(35, 0.0)).is_empty());
        assert!(supervisor.evaluate(snapshot(40, 0.0)).is_empty());
    }

    #[test]
    fn plateau_is_not_a_leak() {
        let mut supervisor = Supervisor::new(thresholds());
        for memory in [10, 30, 30, 50] {
            assert!(supervisor.evaluate(snapshot(memory, 0.0)).is_empty());
        }
    }
}
