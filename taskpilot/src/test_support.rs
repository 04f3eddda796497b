//! Test-only builders for plans, scripted fakes and temporary workspaces.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::engine::events::EngineEvent;
use crate::engine::{AutomationEngine, EngineContext};
use crate::io::Layout;
use crate::io::assistant::{
    Assistant, AssistantError, DispatchRequest, RESPONSE_BUFFER, ResponseChannel,
};
use crate::io::config::EngineConfig;
use crate::io::probe::{ResourceProbe, ResourceSample};
use crate::plan::{Spec, Subtask, Task, TaskKey, TaskStatus};

/// Pending, required subtask with a deterministic title.
pub fn subtask(id: &str) -> Subtask {
    Subtask {
        id: id.to_string(),
        title: format!("{id} title"),
        description: Vec::new(),
        status: TaskStatus::Pending,
        optional: false,
        requirements: Vec::new(),
        dependencies: Vec::new(),
        line: 0,
    }
}

/// Pending, required task with deterministic fields.
pub fn task(id: &str, subtasks: Vec<Subtask>) -> Task {
    Task {
        id: id.to_string(),
        title: format!("{id} title"),
        description: Vec::new(),
        status: TaskStatus::Pending,
        optional: false,
        requirements: Vec::new(),
        dependencies: Vec::new(),
        subtasks,
        spec_name: "demo".to_string(),
        source: PathBuf::from("/tmp/demo/tasks.md"),
        line: 0,
    }
}

pub fn task_with_deps(id: &str, deps: &[&str]) -> Task {
    Task {
        dependencies: deps.iter().map(|dep| (*dep).to_string()).collect(),
        ..task(id, Vec::new())
    }
}

pub fn spec_with(name: &str, tasks: Vec<Task>) -> Spec {
    Spec::new(name, format!("/tmp/{name}"), tasks)
}

/// Write `<root>/.kiro/specs/<name>/tasks.md` and return its path.
pub fn write_spec(root: &Path, name: &str, contents: &str) -> PathBuf {
    let dir = root.join(".kiro/specs").join(name);
    fs::create_dir_all(&dir).expect("create spec dir");
    let path = dir.join("tasks.md");
    fs::write(&path, contents).expect("write tasks file");
    path
}

/// What the scripted assistant does for one dispatch.
#[derive(Debug, Clone)]
pub enum Script {
    /// Stream the chunks, then close.
    Reply(Vec<String>),
    /// Wait, then stream the chunks and close. Cancellation cuts the wait short.
    ReplyAfter(Duration, Vec<String>),
    /// `send` itself fails.
    Refuse(AssistantError),
    /// Stream the chunks, then report an error on the channel.
    Break(Vec<String>, AssistantError),
    /// Keep the channel open and silent until cancelled.
    Hang,
    /// Take this long to accept the prompt, then behave like `Hang`.
    SlowAccept(Duration),
}

impl Script {
    pub fn success() -> Self {
        Self::Reply(vec!["Task completed successfully".to_string()])
    }

    pub fn failure(text: &str) -> Self {
        Self::Reply(vec![text.to_string()])
    }
}

/// Assistant fake driven by per-task scripts. Tasks without a script left
/// succeed immediately.
#[derive(Debug, Default)]
pub struct ScriptedAssistant {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    requests: Mutex<Vec<DispatchRequest>>,
}

impl ScriptedAssistant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue scripts for dispatches of task `id`, consumed in order.
    pub fn script(self, id: &str, scripts: impl IntoIterator<Item = Script>) -> Self {
        self.scripts
            .lock()
            .expect("scripts lock")
            .entry(id.to_string())
            .or_default()
            .extend(scripts);
        self
    }

    pub fn requests(&self) -> Vec<DispatchRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    /// Task of every dispatch, in dispatch order.
    pub fn dispatched(&self) -> Vec<TaskKey> {
        self.requests().into_iter().map(|request| request.task).collect()
    }

    fn next_script(&self, id: &str) -> Script {
        self.scripts
            .lock()
            .expect("scripts lock")
            .get_mut(id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(Script::success)
    }
}

#[async_trait]
impl Assistant for ScriptedAssistant {
    async fn send(
        &self,
        request: DispatchRequest,
        cancel: CancellationToken,
    ) -> Result<ResponseChannel, AssistantError> {
        let script = self.next_script(&request.task.id);
        self.requests.lock().expect("requests lock").push(request);

        if let Script::SlowAccept(delay) = &script {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(*delay) => {}
            }
        }

        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        match script {
            Script::Refuse(error) => return Err(error),
            Script::Reply(chunks) => {
                for chunk in chunks {
                    let _ = tx.send(Ok(chunk)).await;
                }
            }
            Script::Break(chunks, error) => {
                for chunk in chunks {
                    let _ = tx.send(Ok(chunk)).await;
                }
                let _ = tx.send(Err(error)).await;
            }
            Script::ReplyAfter(delay, chunks) => {
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {
                            for chunk in chunks {
                                let _ = tx.send(Ok(chunk)).await;
                            }
                        }
                    }
                });
            }
            Script::Hang | Script::SlowAccept(_) => {
                tokio::spawn(async move {
                    cancel.cancelled().await;
                    drop(tx);
                });
            }
        }
        Ok(ResponseChannel::Stream(rx))
    }
}

/// Probe reporting the same sample every time.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub ResourceSample);

impl FixedProbe {
    pub fn megabytes(memory_mb: u64) -> Self {
        Self(ResourceSample {
            memory_bytes: memory_mb * 1024 * 1024,
            cpu_percent: 0.0,
        })
    }
}

impl ResourceProbe for FixedProbe {
    fn sample(&mut self) -> Result<ResourceSample> {
        Ok(self.0)
    }
}

/// Config with short delays suitable for tests.
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig {
        task_timeout_ms: 5_000,
        task_delay_ms: 0,
        watch_files: false,
        ..EngineConfig::default()
    };
    config.retry.base_delay_ms = 5;
    config.retry.max_delay_ms = 20;
    config.resources.snapshot_interval_ms = 20;
    config
}

/// A temporary workspace holding specs, config and session state.
#[derive(Debug)]
pub struct Workspace {
    temp: tempfile::TempDir,
}

impl Workspace {
    pub fn new() -> Result<Self> {
        Ok(Self {
            temp: tempfile::tempdir().context("create temp workspace")?,
        })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn layout(&self) -> Layout {
        Layout::new(self.root())
    }

    pub fn write_spec(&self, name: &str, contents: &str) -> PathBuf {
        write_spec(self.root(), name, contents)
    }

    pub fn read_tasks(&self, name: &str) -> String {
        fs::read_to_string(self.root().join(".kiro/specs").join(name).join("tasks.md"))
            .expect("read tasks file")
    }

    /// Engine over this workspace with a fixed 10 MB probe.
    pub fn engine(
        &self,
        config: EngineConfig,
        assistant: Arc<ScriptedAssistant>,
    ) -> Result<AutomationEngine> {
        let ctx = EngineContext::new(self.layout(), config, assistant)?
            .with_probe(Arc::new(|| Box::new(FixedProbe::megabytes(10))));
        AutomationEngine::new(ctx)
    }
}

/// Receive events until one matches `pred`, or give up after `timeout`.
pub async fn next_event(
    rx: &mut broadcast::Receiver<EngineEvent>,
    timeout: Duration,
    mut pred: impl FnMut(&EngineEvent) -> bool,
) -> Option<EngineEvent> {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    };
    tokio::time::timeout(timeout, wait).await.ok().flatten()
}

/// Drain events already buffered on `rx`.
pub fn drain_events(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => return events,
        }
    }
}
