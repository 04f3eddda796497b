//! The automation engine: lifecycle commands, the dispatch loop and the
//! resource monitor.
//!
//! Commands ([`AutomationEngine::start`], `pause`, `resume`, `stop`) are
//! synchronous and only flip state; the work happens on a spawned session
//! task. A command that is not allowed in the current state returns
//! [`EngineError::InvalidState`] and changes nothing.

pub mod context;
pub mod detector;
mod dispatch;
pub mod error;
pub mod events;
mod monitor;
pub mod session;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub use context::{EngineContext, ProbeFactory};
pub use error::EngineError;
pub use events::EngineEvent;

use crate::core::dependency::validate_plan;
use crate::core::state::{Command, EngineState, SessionOutcome, transition};
use crate::io::config::EngineConfig;
use crate::io::prompt::PromptBuilder;
use crate::io::session_store::{SessionRecord, load_session, recover_retries};
use crate::io::task_store::TaskStore;
use crate::io::watcher::{StoreEvent, watch_specs};
use crate::plan::{Spec, TaskKey, TaskStatus};
use crate::supervisor::cache::{BoundedCache, CacheLimits};
use crate::supervisor::registry::ResourceRegistry;
use events::EVENT_CAPACITY;
use session::SessionLog;

/// Store events buffered between the watcher and the dispatch loop.
const STORE_EVENT_BUFFER: usize = 64;

/// Requirements and design documents of one spec.
#[derive(Debug, Default)]
pub(crate) struct ContextDocs {
    pub requirements: Option<String>,
    pub design: Option<String>,
}

impl ContextDocs {
    fn bytes(&self) -> usize {
        self.requirements.as_ref().map_or(0, String::len) + self.design.as_ref().map_or(0, String::len)
    }
}

pub(crate) type DocCache = BoundedCache<Arc<ContextDocs>>;

#[derive(Debug, Clone)]
pub(crate) struct ActiveTask {
    pub key: TaskKey,
    pub since: Instant,
}

#[derive(Debug, Default)]
struct Control {
    session: Option<Arc<SessionLog>>,
    cancel: Option<CancellationToken>,
    running: bool,
}

/// State shared by the command surface, the dispatch loop and the monitor.
pub(crate) struct Shared {
    ctx: EngineContext,
    prompts: PromptBuilder,
    store: Mutex<TaskStore>,
    cache: Arc<Mutex<DocCache>>,
    registry: Arc<ResourceRegistry>,
    events: broadcast::Sender<EngineEvent>,
    state: watch::Sender<EngineState>,
    paused: watch::Sender<bool>,
    active: watch::Sender<Option<ActiveTask>>,
    outcome: watch::Sender<Option<SessionOutcome>>,
    control: Mutex<Control>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    fn lock_store(&self) -> MutexGuard<'_, TaskStore> {
        lock(&self.store)
    }

    fn lock_cache(&self) -> MutexGuard<'_, DocCache> {
        lock(&self.cache)
    }

    fn current_state(&self) -> EngineState {
        *self.state.borrow()
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Callers hold the control lock.
    fn set_state(&self, from: EngineState, to: EngineState) {
        self.state.send_replace(to);
        info!(%from, %to, "engine state changed");
        self.emit(EngineEvent::StateChanged {
            from,
            to,
            at: Utc::now(),
        });
    }

    /// Close the session, release its resources and settle the engine state.
    ///
    /// A stop that raced with the end of the queue wins: the outcome becomes
    /// `Stopped`.
    fn finish(&self, session: &SessionLog, outcome: SessionOutcome) -> SessionOutcome {
        let mut control = lock(&self.control);
        let current = self.current_state();
        let outcome = if current == EngineState::Stopped {
            SessionOutcome::Stopped
        } else {
            outcome
        };
        let final_state = match outcome {
            SessionOutcome::Stopped => EngineState::Stopped,
            SessionOutcome::Completed | SessionOutcome::Halted => EngineState::Idle,
        };

        self.active.send_replace(None);
        let closed = session.update(|record| {
            record.close(outcome, final_state);
            (record.completed.len(), record.failed.len(), record.skipped.len())
        });
        let (completed, failed, skipped) = closed.unwrap_or_else(|err| {
            warn!(error = %format!("{err:#}"), "failed to write closed session record");
            let record = session.snapshot();
            (record.completed.len(), record.failed.len(), record.skipped.len())
        });

        let report = self.registry.cleanup_session(session.id());
        if report.failed > 0 {
            warn!(failed = report.failed, "some session resources failed to release");
        }

        if current != final_state {
            self.set_state(current, final_state);
        }
        control.running = false;
        control.cancel = None;

        let session_id = session.id();
        info!(%session_id, %outcome, completed, failed, skipped, "session ended");
        let at = Utc::now();
        self.emit(match outcome {
            SessionOutcome::Stopped => EngineEvent::SessionStopped { session_id, at },
            SessionOutcome::Completed | SessionOutcome::Halted => EngineEvent::SessionCompleted {
                session_id,
                outcome,
                completed,
                failed,
                skipped,
                at,
            },
        });
        self.outcome.send_replace(Some(outcome));
        outcome
    }
}

/// Drives tasks from discovered specs through the assistant, one at a time.
#[derive(Clone)]
pub struct AutomationEngine {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for AutomationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutomationEngine")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl AutomationEngine {
    pub fn new(ctx: EngineContext) -> Result<Self> {
        let prompts = PromptBuilder::new(ctx.config.prompt_budget_bytes)?;
        let store = TaskStore::new(ctx.specs_root());
        let resources = &ctx.config.resources;
        let cache = BoundedCache::new(CacheLimits {
            max_entries: resources.cache_max_entries,
            max_bytes: resources.cache_max_bytes,
            ttl: Duration::from_millis(resources.cache_ttl_ms),
        });
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(EngineState::Idle);
        let (paused, _) = watch::channel(false);
        let (active, _) = watch::channel(None);
        let (outcome, _) = watch::channel(None);
        Ok(Self {
            shared: Arc::new(Shared {
                ctx,
                prompts,
                store: Mutex::new(store),
                cache: Arc::new(Mutex::new(cache)),
                registry: Arc::new(ResourceRegistry::new()),
                events,
                state,
                paused,
                active,
                outcome,
                control: Mutex::new(Control::default()),
            }),
        })
    }

    pub fn state(&self) -> EngineState {
        self.shared.current_state()
    }

    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        self.shared.config()
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.shared.registry
    }

    /// Re-read every spec from disk and return the plan.
    pub fn discover(&self) -> Result<Vec<Spec>> {
        let mut store = self.shared.lock_store();
        Ok(store.discover()?.to_vec())
    }

    /// The plan as last read or updated.
    pub fn plan(&self) -> Vec<Spec> {
        self.shared.lock_store().specs().to_vec()
    }

    pub fn status_of(&self, key: &TaskKey) -> Option<TaskStatus> {
        self.shared.lock_store().status_of(key)
    }

    /// Record of the current or most recent session.
    pub fn session(&self) -> Option<SessionRecord> {
        lock(&self.shared.control)
            .session
            .as_ref()
            .map(|session| session.snapshot())
    }

    /// Discover specs, validate the plan and begin a session.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<Uuid, EngineError> {
        let shared = &self.shared;
        let mut control = lock(&shared.control);
        let from = shared.current_state();
        let to = allowed(from, Command::Start)?;
        if control.running {
            return Err(EngineError::ShuttingDown);
        }
        let config = shared.config();
        if !config.enabled {
            return Err(EngineError::Disabled);
        }
        config.effective_concurrency();

        let problems = {
            let mut store = shared.lock_store();
            store.discover().context("discover specs")?;
            validate_plan(store.specs())
        };
        if !problems.is_empty() {
            for problem in &problems {
                error!(%problem, "invalid plan");
            }
            return Err(EngineError::InvalidPlan { problems });
        }

        let session_path = shared.ctx.layout.session_path();
        let previous = load_session(&session_path).unwrap_or_else(|err| {
            warn!(error = %format!("{err:#}"), "unreadable session record; starting without retry history");
            None
        });
        let mut record = SessionRecord::open(config.clone());
        record.retries = recover_retries(previous.as_ref());
        let session = Arc::new(SessionLog::create(session_path, record)?);
        let session_id = session.id();

        let store_events = self.watch_specs(session_id);
        self.register_cache(session_id);

        let cancel = CancellationToken::new();
        shared.paused.send_replace(false);
        shared.outcome.send_replace(None);
        shared.set_state(from, to);
        shared.emit(EngineEvent::SessionStarted {
            session_id,
            at: Utc::now(),
        });
        info!(%session_id, "session started");

        let runner = tokio::spawn(dispatch::run_session(
            Arc::clone(shared),
            Arc::clone(&session),
            cancel.clone(),
            store_events,
        ));
        let watchdog = Arc::clone(shared);
        let watched = Arc::clone(&session);
        tokio::spawn(async move {
            if let Err(err) = runner.await {
                error!(error = %err, "session task ended abnormally");
                watchdog.finish(&watched, SessionOutcome::Halted);
            }
        });

        control.session = Some(session);
        control.cancel = Some(cancel);
        control.running = true;
        Ok(session_id)
    }

    /// Let the in-flight attempt finish, then dispatch nothing until resumed.
    #[instrument(skip(self))]
    pub fn pause(&self) -> Result<(), EngineError> {
        self.toggle_pause(Command::Pause, true)
    }

    #[instrument(skip(self))]
    pub fn resume(&self) -> Result<(), EngineError> {
        self.toggle_pause(Command::Resume, false)
    }

    /// Cancel the in-flight attempt and end the session. The session task
    /// reverts the interrupted task to pending and closes the record.
    #[instrument(skip(self))]
    pub fn stop(&self) -> Result<(), EngineError> {
        let shared = &self.shared;
        let control = lock(&shared.control);
        let from = shared.current_state();
        let to = allowed(from, Command::Stop)?;
        shared.set_state(from, to);
        if let Some(cancel) = &control.cancel {
            cancel.cancel();
        }
        if let Some(session) = &control.session {
            record_command(session, to, "stop", "operator stopped the session");
        }
        info!("stop requested");
        Ok(())
    }

    /// Wait for the current session to end. `None` when no session was started.
    pub async fn wait(&self) -> Option<SessionOutcome> {
        if lock(&self.shared.control).session.is_none() {
            return None;
        }
        let mut rx = self.shared.outcome.subscribe();
        let outcome = rx.wait_for(Option::is_some).await.ok()?;
        *outcome
    }

    fn toggle_pause(&self, command: Command, paused: bool) -> Result<(), EngineError> {
        let shared = &self.shared;
        let control = lock(&shared.control);
        let from = shared.current_state();
        let to = allowed(from, command)?;
        shared.paused.send_replace(paused);
        shared.set_state(from, to);
        if let Some(session) = &control.session {
            let session_id = session.id();
            record_command(session, to, command.as_str(), "operator command");
            let at = Utc::now();
            shared.emit(if paused {
                EngineEvent::SessionPaused { session_id, at }
            } else {
                EngineEvent::SessionResumed { session_id, at }
            });
        }
        Ok(())
    }

    /// Start the spec watcher when configured. Watch failures only disable
    /// live reloads; tasks files are re-read before every write anyway.
    fn watch_specs(&self, session_id: Uuid) -> Option<mpsc::Receiver<StoreEvent>> {
        let config = self.shared.config();
        if !config.watch_files {
            return None;
        }
        let root = self.shared.ctx.specs_root();
        let (tx, rx) = mpsc::channel(STORE_EVENT_BUFFER);
        match watch_specs(&root, Duration::from_millis(config.watch_poll_ms), tx) {
            Ok(mut guard) => {
                self.shared.registry.register(
                    session_id,
                    "watcher",
                    Box::new(move || {
                        guard.stop();
                        Ok(())
                    }),
                );
                Some(rx)
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "spec watcher unavailable");
                None
            }
        }
    }

    /// Context documents cached during the session are dropped when it ends.
    fn register_cache(&self, session_id: Uuid) {
        let cache = Arc::clone(&self.shared.cache);
        let tag = session_id.to_string();
        self.shared.registry.register(
            session_id,
            "cache",
            Box::new(move || {
                lock(&cache).remove_tagged(&tag);
                Ok(())
            }),
        );
    }
}

fn allowed(state: EngineState, command: Command) -> Result<EngineState, EngineError> {
    transition(state, command).ok_or(EngineError::InvalidState { command, state })
}

fn record_command(session: &SessionLog, state: EngineState, action: &str, detail: &str) {
    let written = session.update(|record| {
        record.state = state;
        record.decide(None, action, detail);
    });
    if let Err(err) = written {
        warn!(error = %format!("{err:#}"), "failed to record operator command");
    }
}
