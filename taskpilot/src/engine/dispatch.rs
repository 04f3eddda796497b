//! The session loop: select, dispatch, detect, retry, persist.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::detector::{self, Detection, DetectorSettings};
use super::events::EngineEvent;
use super::monitor;
use super::session::SessionLog;
use super::{ActiveTask, ContextDocs, Shared};
use crate::core::queue::{Selection, select_next};
use crate::core::retry::{ErrorKind, GiveUpReason, RetryDecision};
use crate::core::state::SessionOutcome;
use crate::io::assistant::{AssistantError, DispatchRequest};
use crate::io::attempt_log::{AttemptMeta, AttemptResult, AttemptWriteRequest, write_attempt};
use crate::io::config::FailureMode;
use crate::io::prompt::{PromptInputs, TaskContext, load_context_documents};
use crate::io::watcher::StoreEvent;
use crate::plan::{Spec, TaskKey, TaskStatus};

/// How one unit of work ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitOutcome {
    Completed,
    Failed,
    Stopped,
}

/// Runs a session to its end and closes it.
pub(super) async fn run_session(
    shared: Arc<Shared>,
    session: Arc<SessionLog>,
    cancel: CancellationToken,
    store_events: Option<mpsc::Receiver<StoreEvent>>,
) -> SessionOutcome {
    let session_id = session.id();
    let monitor_cancel = cancel.child_token();
    let monitor = tokio::spawn(monitor::run(
        Arc::clone(&shared),
        session_id,
        monitor_cancel.clone(),
    ));

    let mut runner = Runner {
        shared,
        session,
        cancel,
        store_events,
        dispatched: false,
    };
    let outcome = match runner.run().await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(%session_id, error = %format!("{err:#}"), "session aborted");
            runner.record(None, "abort", format!("{err:#}"));
            SessionOutcome::Halted
        }
    };

    monitor_cancel.cancel();
    if let Err(err) = monitor.await {
        warn!(error = %err, "resource monitor ended abnormally");
    }
    runner.shared.finish(&runner.session, outcome)
}

struct Runner {
    shared: Arc<Shared>,
    session: Arc<SessionLog>,
    cancel: CancellationToken,
    store_events: Option<mpsc::Receiver<StoreEvent>>,
    /// Set once the first attempt went out; pacing applies between dispatches.
    dispatched: bool,
}

impl Runner {
    fn session_id(&self) -> Uuid {
        self.session.id()
    }

    fn halts_on_failure(&self) -> bool {
        self.shared.config().on_task_failure == FailureMode::Halt
    }

    async fn run(&mut self) -> Result<SessionOutcome> {
        loop {
            if !self.wait_unpaused().await {
                return Ok(SessionOutcome::Stopped);
            }
            self.apply_store_events();

            let selection = {
                let store = self.shared.lock_store();
                select_next(store.specs(), &self.shared.config().queue_policy())
            };
            let selection = match selection {
                Ok(Some(selection)) => selection,
                Ok(None) => {
                    info!("execution queue exhausted");
                    return Ok(SessionOutcome::Completed);
                }
                Err((spec, cycle)) => {
                    // Specs edited mid-session can introduce a cycle after validation.
                    error!(%spec, %cycle, "dependency cycle; halting");
                    self.record(None, "halt", format!("{spec}: {cycle}"));
                    return Ok(SessionOutcome::Halted);
                }
            };

            match selection {
                Selection::Skip(key) => self.skip(&key)?,
                Selection::Blocked { key, unmet } => {
                    self.fail_blocked(&key, &unmet)?;
                    if self.halts_on_failure() {
                        return Ok(SessionOutcome::Halted);
                    }
                }
                Selection::Dispatch(key) => {
                    if self.dispatched && !self.pace().await {
                        return Ok(SessionOutcome::Stopped);
                    }
                    if !self.wait_unpaused().await {
                        return Ok(SessionOutcome::Stopped);
                    }
                    self.dispatched = true;
                    match self.run_unit(&key).await? {
                        UnitOutcome::Completed => {}
                        UnitOutcome::Failed if self.halts_on_failure() => {
                            return Ok(SessionOutcome::Halted);
                        }
                        UnitOutcome::Failed => {}
                        UnitOutcome::Stopped => return Ok(SessionOutcome::Stopped),
                    }
                }
            }
        }
    }

    /// Block while paused. `false` when the session was cancelled instead.
    async fn wait_unpaused(&self) -> bool {
        let mut paused = self.shared.paused.subscribe();
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            if !*paused.borrow_and_update() {
                return true;
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                changed = paused.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Sleep for `delay` unless cancelled first.
    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn pace(&self) -> bool {
        let delay = self.shared.config().task_delay();
        delay.is_zero() || self.sleep(delay).await
    }

    fn apply_store_events(&mut self) {
        let Some(rx) = self.store_events.as_mut() else {
            return;
        };
        let mut store = self.shared.lock_store();
        while let Ok(event) = rx.try_recv() {
            if let Err(err) = store.handle_event(&event) {
                warn!(path = %event.path().display(), error = %format!("{err:#}"), "failed to apply spec change");
            }
        }
    }

    #[instrument(skip_all, fields(session = %self.session_id(), task = %key))]
    async fn run_unit(&mut self, key: &TaskKey) -> Result<UnitOutcome> {
        let policy = self.shared.config().retry_policy();
        let mut attempts_made = self.session.read(|record| {
            record
                .retries
                .get(&key.to_string())
                .map_or(0, |retry| retry.attempts)
        });
        if attempts_made >= policy.max_attempts() {
            // Recovered from a crashed session that had already spent the budget.
            let error = self.session.read(|record| {
                record
                    .retries
                    .get(&key.to_string())
                    .and_then(|retry| retry.last_error())
                    .map(|last| AssistantError::new(last.kind, last.message.clone()))
            });
            let error = error.unwrap_or_else(|| AssistantError::new(ErrorKind::Unknown, "attempt budget spent"));
            let title = self.title_of(key)?;
            self.fail(key, &title, &error, attempts_made, GiveUpReason::AttemptsExhausted)?;
            return Ok(UnitOutcome::Failed);
        }

        loop {
            let attempt = attempts_made + 1;
            let (prompt, title) = self.prepare(key, attempt)?;
            self.mark_in_progress(key, &title, attempt)?;

            let started_at = Utc::now();
            let started = Instant::now();
            let attempt_cancel = self.cancel.child_token();
            let detection = self.dispatch(key, attempt, &prompt, &attempt_cancel).await;
            // The adapter may still be working; tell it the verdict is in.
            attempt_cancel.cancel();
            self.shared.active.send_replace(None);
            self.log_attempt(key, attempt, &prompt, &detection, started_at, started.elapsed());
            attempts_made = attempt;

            match detection {
                Detection::Success { .. } => {
                    self.complete(key, &title, attempt)?;
                    return Ok(UnitOutcome::Completed);
                }
                Detection::Cancelled { success: true, .. } => {
                    info!(task = %key, "success arrived as the session stopped");
                    self.complete(key, &title, attempt)?;
                    return Ok(UnitOutcome::Stopped);
                }
                Detection::Cancelled { success: false, .. } => {
                    self.revert(key)?;
                    return Ok(UnitOutcome::Stopped);
                }
                Detection::Failure { error, .. } => {
                    self.session.update(|record| {
                        record.retry_record(key).record_error(error.kind, &error.message);
                    })?;
                    match policy.decide(error.kind, attempt) {
                        RetryDecision::Retry {
                            delay,
                            next_attempt,
                        } => {
                            warn!(
                                task = %key,
                                kind = %error.kind,
                                error = %error.message,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                "attempt failed; retrying"
                            );
                            self.record(
                                Some(key),
                                "retry",
                                format!("{error}; attempt {next_attempt} in {}ms", delay.as_millis()),
                            );
                            self.shared.emit(EngineEvent::TaskRetrying {
                                session_id: self.session_id(),
                                task: key.clone(),
                                title: title.clone(),
                                kind: error.kind,
                                next_attempt,
                                delay_ms: delay.as_millis() as u64,
                                at: Utc::now(),
                            });
                            if !self.sleep(delay).await || !self.wait_unpaused().await {
                                self.revert(key)?;
                                return Ok(UnitOutcome::Stopped);
                            }
                        }
                        RetryDecision::GiveUp { reason } => {
                            self.fail(key, &title, &error, attempt, reason)?;
                            return Ok(UnitOutcome::Failed);
                        }
                    }
                }
            }
        }
    }

    /// Send the prompt and wait for a verdict.
    async fn dispatch(
        &self,
        key: &TaskKey,
        attempt: u32,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Detection {
        let config = self.shared.config();
        let timeout = config.task_timeout();
        // One deadline covers both accepting the prompt and the verdict.
        let deadline = tokio::time::Instant::now() + timeout;
        let request = DispatchRequest {
            dispatch_id: Uuid::new_v4(),
            task: key.clone(),
            attempt,
            prompt: prompt.to_string(),
            timeout,
        };
        let dispatch_id = request.dispatch_id;
        let assistant = Arc::clone(&self.shared.ctx.assistant);

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Detection::Cancelled { success: false, text: String::new() };
            }
            sent = tokio::time::timeout_at(deadline, assistant.send(request, cancel.clone())) => sent,
        };
        let channel = match sent {
            Ok(Ok(channel)) => channel,
            Ok(Err(error)) => {
                return Detection::Failure {
                    error,
                    text: String::new(),
                };
            }
            Err(_) => {
                return Detection::Failure {
                    error: AssistantError::timeout("assistant did not accept the prompt in time"),
                    text: String::new(),
                };
            }
        };
        let settings = DetectorSettings {
            timeout: deadline.saturating_duration_since(tokio::time::Instant::now()),
            verify_completion: config.verify_completion,
        };
        detector::detect(
            channel,
            self.shared.ctx.classifier.as_ref(),
            settings,
            cancel,
            assistant.as_ref(),
            dispatch_id,
        )
        .await
    }

    /// Render the prompt for `attempt`. Returns the prompt and the task title.
    fn prepare(&self, key: &TaskKey, attempt: u32) -> Result<(String, String)> {
        let (task, title, docs) = {
            let store = self.shared.lock_store();
            let spec = store
                .spec(&key.spec)
                .ok_or_else(|| anyhow!("spec {} disappeared", key.spec))?;
            let item = spec
                .item(&key.id)
                .ok_or_else(|| anyhow!("task {key} disappeared"))?;
            (
                TaskContext::from_item(&item),
                item.title().to_string(),
                self.context_docs(spec)?,
            )
        };
        let previous_error = self.session.read(|record| {
            record
                .retries
                .get(&key.to_string())
                .and_then(|retry| retry.last_error())
                .map(|last| format!("{}: {}", last.kind, last.message))
        });
        let prompt = self.shared.prompts.build(&PromptInputs {
            spec: key.spec.clone(),
            task,
            attempt,
            previous_error,
            requirements: docs.requirements.clone(),
            design: docs.design.clone(),
        })?;
        Ok((prompt, title))
    }

    /// Requirements and design for `spec`, from the cache when possible.
    fn context_docs(&self, spec: &Spec) -> Result<Arc<ContextDocs>> {
        let mut cache = self.shared.lock_cache();
        if let Some(docs) = cache.get(&spec.name) {
            return Ok(docs);
        }
        let (requirements, design) = load_context_documents(spec)?;
        let docs = Arc::new(ContextDocs {
            requirements,
            design,
        });
        let tag = self.session_id().to_string();
        cache.insert(spec.name.clone(), Arc::clone(&docs), docs.bytes(), Some(&tag));
        Ok(docs)
    }

    fn title_of(&self, key: &TaskKey) -> Result<String> {
        self.shared
            .lock_store()
            .spec(&key.spec)
            .and_then(|spec| spec.item(&key.id))
            .map(|item| item.title().to_string())
            .ok_or_else(|| anyhow!("task {key} disappeared"))
    }

    /// Move `key` forward to `status`, persist it, then settle the parent if
    /// this was a subtask. Backward moves are refused and logged.
    fn set_status(&self, key: &TaskKey, status: TaskStatus) -> Result<()> {
        let current = self
            .shared
            .lock_store()
            .status_of(key)
            .ok_or_else(|| anyhow!("task {key} disappeared"))?;
        if !current.can_advance_to(status) {
            warn!(task = %key, %current, %status, "refusing backward status change");
            return Ok(());
        }
        self.write_status(key, status)
    }

    /// Persist `status` unchecked. Only rollbacks of an interrupted attempt
    /// come through here directly.
    fn write_status(&self, key: &TaskKey, status: TaskStatus) -> Result<()> {
        {
            let mut store = self.shared.lock_store();
            if !store.update_status(key, status) {
                return Err(anyhow!("task {key} disappeared"));
            }
            store.persist(key)?;
        }
        self.settle_parent(key)
    }

    /// A parent with subtasks takes the status its subtasks imply.
    fn settle_parent(&self, key: &TaskKey) -> Result<()> {
        let derived = {
            let mut store = self.shared.lock_store();
            let Some(parent) = store.spec(&key.spec).and_then(|spec| spec.parent_of(&key.id)) else {
                return Ok(());
            };
            let (parent_id, current) = (parent.id.clone(), parent.status);
            let Some(status) = parent.derived_status().filter(|status| *status != current) else {
                return Ok(());
            };
            let parent_key = TaskKey::new(&key.spec, parent_id);
            if !current.can_advance_to(status) {
                debug!(task = %parent_key, %current, derived = %status, "parent keeps its settled status");
                return Ok(());
            }
            store.update_status(&parent_key, status);
            store.persist(&parent_key)?;
            (parent_key, status)
        };
        let (parent_key, status) = derived;
        debug!(task = %parent_key, %status, "parent status derived from subtasks");
        self.record(Some(&parent_key), "derive", status.as_str());
        Ok(())
    }

    fn mark_in_progress(&self, key: &TaskKey, title: &str, attempt: u32) -> Result<()> {
        self.set_status(key, TaskStatus::InProgress)?;
        self.session.update(|record| {
            record.active_spec = Some(key.spec.clone());
            record.active_task = Some(key.clone());
            record.retry_record(key).attempts = attempt;
            record.decide(Some(key), "dispatch", format!("attempt {attempt}"));
        })?;
        self.shared.active.send_replace(Some(ActiveTask {
            key: key.clone(),
            since: Instant::now(),
        }));
        info!(task = %key, attempt, "dispatching");
        self.shared.emit(EngineEvent::TaskStarted {
            session_id: self.session_id(),
            task: key.clone(),
            title: title.to_string(),
            attempt,
            at: Utc::now(),
        });
        Ok(())
    }

    fn complete(&self, key: &TaskKey, title: &str, attempts: u32) -> Result<()> {
        self.set_status(key, TaskStatus::Completed)?;
        self.session.update(|record| {
            record.active_spec = None;
            record.active_task = None;
            record.completed.push(key.clone());
            record.decide(Some(key), "complete", format!("after {attempts} attempt(s)"));
        })?;
        info!(task = %key, attempts, "task completed");
        self.shared.emit(EngineEvent::TaskCompleted {
            session_id: self.session_id(),
            task: key.clone(),
            title: title.to_string(),
            attempts,
            at: Utc::now(),
        });
        Ok(())
    }

    fn fail(
        &self,
        key: &TaskKey,
        title: &str,
        error: &AssistantError,
        attempts: u32,
        reason: GiveUpReason,
    ) -> Result<()> {
        self.set_status(key, TaskStatus::Failed)?;
        let why = match reason {
            GiveUpReason::NotRetryable => "not retryable",
            GiveUpReason::AttemptsExhausted => "attempts exhausted",
        };
        self.session.update(|record| {
            record.active_spec = None;
            record.active_task = None;
            record.failed.push(key.clone());
            record.decide(Some(key), "fail", format!("{error} ({why})"));
        })?;
        error!(task = %key, kind = %error.kind, error = %error.message, attempts, why, "task failed");
        self.shared.emit(EngineEvent::TaskFailed {
            session_id: self.session_id(),
            task: key.clone(),
            title: title.to_string(),
            kind: error.kind,
            message: error.message.clone(),
            attempts,
            at: Utc::now(),
        });
        Ok(())
    }

    /// A unit whose prerequisites can no longer complete fails without dispatch.
    fn fail_blocked(&self, key: &TaskKey, unmet: &[String]) -> Result<()> {
        let error = AssistantError::new(
            ErrorKind::Configuration,
            format!("unmet dependencies: {}", unmet.join(", ")),
        );
        let title = self.title_of(key)?;
        self.session.update(|record| {
            record.retry_record(key).record_error(error.kind, &error.message);
        })?;
        self.fail(key, &title, &error, 0, GiveUpReason::NotRetryable)
    }

    fn skip(&self, key: &TaskKey) -> Result<()> {
        let title = self.title_of(key)?;
        self.set_status(key, TaskStatus::Skipped)?;
        self.session.update(|record| {
            record.skipped.push(key.clone());
            record.decide(Some(key), "skip", "optional task skipped");
        })?;
        info!(task = %key, "optional task skipped");
        self.shared.emit(EngineEvent::TaskSkipped {
            session_id: self.session_id(),
            task: key.clone(),
            title,
            reason: "optional".to_string(),
            at: Utc::now(),
        });
        Ok(())
    }

    /// Roll an interrupted task back to pending.
    fn revert(&self, key: &TaskKey) -> Result<()> {
        self.write_status(key, TaskStatus::Pending)?;
        self.session.update(|record| {
            record.active_spec = None;
            record.active_task = None;
            record.decide(Some(key), "revert", "interrupted by stop");
        })?;
        info!(task = %key, "interrupted task reverted to pending");
        Ok(())
    }

    fn log_attempt(
        &self,
        key: &TaskKey,
        attempt: u32,
        prompt: &str,
        detection: &Detection,
        started_at: DateTime<Utc>,
        elapsed: Duration,
    ) {
        let (result, error_kind, error) = match detection {
            Detection::Success { .. } | Detection::Cancelled { success: true, .. } => {
                (AttemptResult::Succeeded, None, None)
            }
            Detection::Failure { error, .. } => (
                AttemptResult::Failed,
                Some(error.kind),
                Some(error.message.clone()),
            ),
            Detection::Cancelled { success: false, .. } => (AttemptResult::Cancelled, None, None),
        };
        let meta = AttemptMeta {
            session_id: self.session_id().to_string(),
            task: key.clone(),
            attempt,
            result,
            error_kind,
            error,
            started_at,
            ended_at: Utc::now(),
            duration_ms: elapsed.as_millis() as u64,
        };
        let attempts_dir = self.shared.ctx.layout.attempts_dir();
        let written = write_attempt(&AttemptWriteRequest {
            attempts_dir: &attempts_dir,
            meta: &meta,
            prompt,
            response: detection.text(),
        });
        if let Err(err) = written {
            warn!(task = %key, attempt, error = %format!("{err:#}"), "failed to write attempt log");
        }
    }

    /// Append a decision; a failed write is logged, not fatal.
    fn record(&self, task: Option<&TaskKey>, action: &str, detail: impl Into<String>) {
        let detail = detail.into();
        if let Err(err) = self.session.update(|record| record.decide(task, action, detail)) {
            warn!(error = %format!("{err:#}"), action, "failed to record decision");
        }
    }
}
