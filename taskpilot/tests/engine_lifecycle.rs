use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use taskpilot::core::retry::ErrorKind;
use taskpilot::core::state::{EngineState, SessionOutcome};
use taskpilot::engine::{EngineError, EngineEvent};
use taskpilot::io::assistant::AssistantError;
use taskpilot::io::config::{EngineConfig, FailureMode};
use taskpilot::io::session_store::load_session;
use taskpilot::plan::{TaskKey, TaskStatus};
use taskpilot::supervisor::AlertKind;
use taskpilot::test_support::{
    Script, ScriptedAssistant, Workspace, drain_events, fast_config, next_event,
};

const WAIT: Duration = Duration::from_secs(5);

fn key(id: &str) -> TaskKey {
    TaskKey::new("demo", id)
}

fn ids(keys: &[TaskKey]) -> Vec<&str> {
    keys.iter().map(|key| key.id.as_str()).collect()
}

fn started(id: &'static str) -> impl FnMut(&EngineEvent) -> bool {
    move |event| matches!(event, EngineEvent::TaskStarted { task, .. } if task.id == id)
}

#[tokio::test]
async fn runs_plan_in_dependency_order_and_rewrites_only_marks() {
    let ws = Workspace::new().expect("workspace");
    let original = "# Implementation Plan\r\n\
\r\n\
- [ ] 1. Wire the API\r\n  - Depends on the store being ready\r\n  - _Depends on: 2_\r\n\
- [ ] 2. Build the store\r\n\
  - [ ] 2.1 Schema\r\n\
  - [ ] 2.2 Queries\r\n\
\r\n\
Trailing notes stay as they are.\r\n";
    ws.write_spec("demo", original);
    let assistant = Arc::new(ScriptedAssistant::new());
    let engine = ws.engine(fast_config(), Arc::clone(&assistant)).expect("engine");

    engine.start().expect("start");
    assert_eq!(engine.wait().await, Some(SessionOutcome::Completed));

    assert_eq!(ids(&assistant.dispatched()), vec!["2.1", "2.2", "1"]);
    let expected = original
        .replace("- [ ] 1.", "- [x] 1.")
        .replace("- [ ] 2.", "- [x] 2.")
        .replace("- [ ] 2.1", "- [x] 2.1")
        .replace("- [ ] 2.2", "- [x] 2.2");
    assert_eq!(ws.read_tasks("demo"), expected);
    assert_eq!(engine.state(), EngineState::Idle);

    let record = load_session(&ws.layout().session_path())
        .expect("load")
        .expect("session");
    assert_eq!(record.outcome, Some(SessionOutcome::Completed));
    assert_eq!(ids(&record.completed), vec!["2.1", "2.2", "1"]);
}

#[tokio::test]
async fn retries_transient_failures_until_the_budget_is_spent() {
    let ws = Workspace::new().expect("workspace");
    ws.write_spec("demo", "- [ ] 1. Flaky\n- [ ] 2. Next\n");
    let assistant = Arc::new(ScriptedAssistant::new().script(
        "1",
        [
            Script::failure("Task failed: compile error"),
            Script::Refuse(AssistantError::transport("connection refused")),
            Script::failure("Task failed: still broken"),
        ],
    ));
    let config = EngineConfig {
        max_retries: 2,
        ..fast_config()
    };
    let engine = ws.engine(config, Arc::clone(&assistant)).expect("engine");
    let mut events = engine.subscribe();

    engine.start().expect("start");
    assert_eq!(engine.wait().await, Some(SessionOutcome::Halted));

    assert_eq!(ids(&assistant.dispatched()), vec!["1", "1", "1"]);
    let events = drain_events(&mut events);
    let retrying: Vec<u32> = events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::TaskRetrying { next_attempt, .. } => Some(*next_attempt),
            _ => None,
        })
        .collect();
    assert_eq!(retrying, vec![2, 3]);
    assert!(events.iter().any(|event| matches!(
        event,
        EngineEvent::TaskFailed { task, attempts: 3, kind: ErrorKind::Protocol, .. } if task.id == "1"
    )));

    // Failed keeps an empty box on disk; the rest is untouched.
    assert_eq!(ws.read_tasks("demo"), "- [ ] 1. Flaky\n- [ ] 2. Next\n");
    assert_eq!(engine.status_of(&key("1")), Some(TaskStatus::Failed));

    let record = engine.session().expect("session");
    let retry = &record.retries["demo:1"];
    assert_eq!(retry.attempts, 3);
    let kinds: Vec<ErrorKind> = retry.errors.iter().map(|error| error.kind).collect();
    assert_eq!(
        kinds,
        vec![ErrorKind::Protocol, ErrorKind::Transport, ErrorKind::Protocol]
    );

    let attempts_dir = ws
        .layout()
        .attempts_dir()
        .join(record.session_id.to_string())
        .join("demo")
        .join("1");
    assert_eq!(fs::read_dir(&attempts_dir).expect("attempt dirs").count(), 3);

    let prompts: Vec<String> = assistant
        .requests()
        .into_iter()
        .map(|request| request.prompt)
        .collect();
    assert!(!prompts[0].contains("Previous Attempt"));
    assert!(prompts[2].contains("transport: connection refused"));
}

#[tokio::test]
async fn unmet_dependency_fails_without_dispatch_and_skip_mode_continues() {
    let ws = Workspace::new().expect("workspace");
    ws.write_spec(
        "demo",
        "- [ ] 1. A\n- [ ] 2. B\n  - _Depends on: 1_\n- [ ] 3. C\n",
    );
    let assistant = Arc::new(
        ScriptedAssistant::new().script("1", [Script::failure("Task failed: no disk")]),
    );
    let config = EngineConfig {
        max_retries: 0,
        on_task_failure: FailureMode::Skip,
        ..fast_config()
    };
    let engine = ws.engine(config, Arc::clone(&assistant)).expect("engine");
    let mut events = engine.subscribe();

    engine.start().expect("start");
    assert_eq!(engine.wait().await, Some(SessionOutcome::Completed));

    assert_eq!(ids(&assistant.dispatched()), vec!["1", "3"]);
    let events = drain_events(&mut events);
    assert!(events.iter().any(|event| matches!(
        event,
        EngineEvent::TaskFailed { task, attempts: 0, kind: ErrorKind::Configuration, .. }
            if task.id == "2"
    )));
    let record = engine.session().expect("session");
    assert_eq!(ids(&record.failed), vec!["1", "2"]);
    assert_eq!(record.retries["demo:2"].attempts, 0);
    assert_eq!(
        ws.read_tasks("demo"),
        "- [ ] 1. A\n- [ ] 2. B\n  - _Depends on: 1_\n- [x] 3. C\n"
    );
}

#[tokio::test]
async fn halt_mode_stops_after_the_first_terminal_failure() {
    let ws = Workspace::new().expect("workspace");
    ws.write_spec(
        "demo",
        "- [ ] 1. A\n- [ ] 2. B\n  - _Depends on: 1_\n- [ ] 3. C\n",
    );
    let assistant = Arc::new(
        ScriptedAssistant::new().script("1", [Script::failure("Task failed: no disk")]),
    );
    let config = EngineConfig {
        max_retries: 0,
        ..fast_config()
    };
    let engine = ws.engine(config, Arc::clone(&assistant)).expect("engine");

    engine.start().expect("start");
    assert_eq!(engine.wait().await, Some(SessionOutcome::Halted));
    assert_eq!(ids(&assistant.dispatched()), vec!["1"]);
    assert_eq!(engine.status_of(&key("3")), Some(TaskStatus::Pending));
    assert_eq!(engine.state(), EngineState::Idle);
}

#[tokio::test]
async fn failure_indicator_wins_over_success_in_the_same_response() {
    let ws = Workspace::new().expect("workspace");
    ws.write_spec("demo", "- [ ] 1. Only\n");
    let assistant = Arc::new(ScriptedAssistant::new().script(
        "1",
        [Script::Reply(vec![
            "Task completed successfully\n".to_string(),
            "Error: tests failed\n".to_string(),
        ])],
    ));
    let config = EngineConfig {
        max_retries: 0,
        ..fast_config()
    };
    let engine = ws.engine(config, assistant).expect("engine");
    let mut events = engine.subscribe();

    engine.start().expect("start");
    assert_eq!(engine.wait().await, Some(SessionOutcome::Halted));
    assert!(drain_events(&mut events).iter().any(|event| matches!(
        event,
        EngineEvent::TaskFailed { kind: ErrorKind::Protocol, .. }
    )));
    assert_eq!(ws.read_tasks("demo"), "- [ ] 1. Only\n");
}

#[tokio::test]
async fn configuration_errors_are_not_retried() {
    let ws = Workspace::new().expect("workspace");
    ws.write_spec("demo", "- [ ] 1. Only\n");
    let assistant = Arc::new(ScriptedAssistant::new().script(
        "1",
        [Script::Refuse(AssistantError::new(
            ErrorKind::Configuration,
            "missing credentials",
        ))],
    ));
    let config = EngineConfig {
        max_retries: 3,
        ..fast_config()
    };
    let engine = ws.engine(config, Arc::clone(&assistant)).expect("engine");
    let mut events = engine.subscribe();

    engine.start().expect("start");
    assert_eq!(engine.wait().await, Some(SessionOutcome::Halted));
    assert_eq!(ids(&assistant.dispatched()), vec!["1"]);
    let events = drain_events(&mut events);
    assert!(
        !events
            .iter()
            .any(|event| matches!(event, EngineEvent::TaskRetrying { .. }))
    );
    assert!(events.iter().any(|event| matches!(
        event,
        EngineEvent::TaskFailed { task, attempts: 1, kind: ErrorKind::Configuration, .. }
            if task.id == "1"
    )));
}

#[tokio::test]
async fn failed_subtask_leaves_a_completed_parent_alone() {
    let ws = Workspace::new().expect("workspace");
    let original = "- [x] 1. Parent\n  - [ ] 1.1 Sub\n";
    ws.write_spec("demo", original);
    let assistant = Arc::new(
        ScriptedAssistant::new().script("1.1", [Script::failure("Task failed: broken")]),
    );
    let config = EngineConfig {
        max_retries: 0,
        ..fast_config()
    };
    let engine = ws.engine(config, Arc::clone(&assistant)).expect("engine");

    engine.start().expect("start");
    assert_eq!(engine.wait().await, Some(SessionOutcome::Halted));
    assert_eq!(ids(&assistant.dispatched()), vec!["1.1"]);
    assert_eq!(engine.status_of(&key("1.1")), Some(TaskStatus::Failed));
    assert_eq!(engine.status_of(&key("1")), Some(TaskStatus::Completed));
    assert_eq!(ws.read_tasks("demo"), original);
}

#[tokio::test]
async fn slow_accept_and_silent_reply_share_one_deadline() {
    let ws = Workspace::new().expect("workspace");
    ws.write_spec("demo", "- [ ] 1. Only\n");
    let assistant = Arc::new(
        ScriptedAssistant::new().script("1", [Script::SlowAccept(Duration::from_millis(500))]),
    );
    let config = EngineConfig {
        task_timeout_ms: 600,
        max_retries: 0,
        ..fast_config()
    };
    let engine = ws.engine(config, assistant).expect("engine");
    let mut events = engine.subscribe();

    let begun = Instant::now();
    engine.start().expect("start");
    assert_eq!(engine.wait().await, Some(SessionOutcome::Halted));
    // Separate budgets would have allowed 500ms + 600ms.
    assert!(begun.elapsed() < Duration::from_millis(1_000));
    assert!(drain_events(&mut events).iter().any(|event| matches!(
        event,
        EngineEvent::TaskFailed { kind: ErrorKind::Timeout, .. }
    )));
}

#[tokio::test]
async fn pause_lets_the_attempt_finish_and_holds_further_dispatch() {
    let ws = Workspace::new().expect("workspace");
    ws.write_spec("demo", "- [ ] 1. First\n- [ ] 2. Second\n");
    let assistant = Arc::new(ScriptedAssistant::new().script(
        "1",
        [Script::ReplyAfter(
            Duration::from_millis(100),
            vec!["Task completed successfully".to_string()],
        )],
    ));
    let engine = ws.engine(fast_config(), Arc::clone(&assistant)).expect("engine");
    let mut events = engine.subscribe();

    engine.start().expect("start");
    next_event(&mut events, WAIT, started("1")).await.expect("task 1 started");
    engine.pause().expect("pause");
    assert_eq!(engine.state(), EngineState::Paused);

    next_event(&mut events, WAIT, |event| {
        matches!(event, EngineEvent::TaskCompleted { task, .. } if task.id == "1")
    })
    .await
    .expect("task 1 completed while paused");
    assert!(
        next_event(&mut events, Duration::from_millis(300), started("2"))
            .await
            .is_none()
    );
    assert_eq!(ids(&assistant.dispatched()), vec!["1"]);

    engine.resume().expect("resume");
    assert_eq!(engine.wait().await, Some(SessionOutcome::Completed));
    assert_eq!(ids(&assistant.dispatched()), vec!["1", "2"]);
}

#[tokio::test]
async fn stop_reverts_the_in_flight_task_and_leaves_the_rest() {
    let ws = Workspace::new().expect("workspace");
    let original = "- [ ] 1. One\n- [ ] 2. Two\n- [ ] 3. Three\n- [ ] 4. Four\n- [ ] 5. Five\n";
    ws.write_spec("demo", original);
    let assistant = Arc::new(ScriptedAssistant::new().script("2", [Script::Hang]));
    let engine = ws.engine(fast_config(), Arc::clone(&assistant)).expect("engine");
    let mut events = engine.subscribe();

    engine.start().expect("start");
    next_event(&mut events, WAIT, started("2")).await.expect("task 2 started");
    assert!(ws.read_tasks("demo").contains("- [~] 2. Two"));

    engine.stop().expect("stop");
    assert_eq!(engine.wait().await, Some(SessionOutcome::Stopped));
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(
        ws.read_tasks("demo"),
        original.replace("- [ ] 1. One", "- [x] 1. One")
    );
    assert_eq!(ids(&assistant.dispatched()), vec!["1", "2"]);
    assert!(
        next_event(&mut events, WAIT, |event| matches!(event, EngineEvent::SessionStopped { .. }))
            .await
            .is_some()
    );
    let record = engine.session().expect("session");
    assert_eq!(record.outcome, Some(SessionOutcome::Stopped));
    assert!(engine.registry().category_counts().is_empty());

    // A stopped engine can start a fresh session and finish the work.
    engine.start().expect("restart");
    assert_eq!(engine.wait().await, Some(SessionOutcome::Completed));
    assert_eq!(ws.read_tasks("demo"), original.replace("[ ]", "[x]"));
}

#[tokio::test]
async fn stop_cuts_a_retry_backoff_short() {
    let ws = Workspace::new().expect("workspace");
    ws.write_spec("demo", "- [ ] 1. Flaky\n- [ ] 2. Next\n");
    let assistant = Arc::new(
        ScriptedAssistant::new().script("1", [Script::failure("Task failed: compile error")]),
    );
    let mut config = fast_config();
    config.retry.base_delay_ms = 10_000;
    config.retry.max_delay_ms = 10_000;
    let engine = ws.engine(config, Arc::clone(&assistant)).expect("engine");
    let mut events = engine.subscribe();

    engine.start().expect("start");
    next_event(&mut events, WAIT, |event| {
        matches!(event, EngineEvent::TaskRetrying { task, .. } if task.id == "1")
    })
    .await
    .expect("task 1 retrying");
    engine.stop().expect("stop");

    let outcome = tokio::time::timeout(Duration::from_secs(2), engine.wait())
        .await
        .expect("stop ends the backoff");
    assert_eq!(outcome, Some(SessionOutcome::Stopped));
    assert_eq!(ids(&assistant.dispatched()), vec!["1"]);
    assert_eq!(engine.status_of(&key("1")), Some(TaskStatus::Pending));
    assert_eq!(ws.read_tasks("demo"), "- [ ] 1. Flaky\n- [ ] 2. Next\n");
}

#[tokio::test]
async fn stop_while_paused_ends_the_session() {
    let ws = Workspace::new().expect("workspace");
    ws.write_spec("demo", "- [ ] 1. First\n- [ ] 2. Second\n");
    let assistant = Arc::new(ScriptedAssistant::new().script(
        "1",
        [Script::ReplyAfter(
            Duration::from_millis(100),
            vec!["Task completed successfully".to_string()],
        )],
    ));
    let engine = ws.engine(fast_config(), Arc::clone(&assistant)).expect("engine");
    let mut events = engine.subscribe();

    engine.start().expect("start");
    next_event(&mut events, WAIT, started("1")).await.expect("task 1 started");
    engine.pause().expect("pause");
    next_event(&mut events, WAIT, |event| {
        matches!(event, EngineEvent::TaskCompleted { task, .. } if task.id == "1")
    })
    .await
    .expect("task 1 completed while paused");

    engine.stop().expect("stop");
    let outcome = tokio::time::timeout(Duration::from_secs(2), engine.wait())
        .await
        .expect("stop ends a paused session");
    assert_eq!(outcome, Some(SessionOutcome::Stopped));
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(ids(&assistant.dispatched()), vec!["1"]);
    assert_eq!(ws.read_tasks("demo"), "- [x] 1. First\n- [ ] 2. Second\n");
}

#[tokio::test]
async fn commands_outside_their_states_change_nothing() {
    let ws = Workspace::new().expect("workspace");
    ws.write_spec("demo", "- [ ] 1. Only\n");
    let engine = ws
        .engine(fast_config(), Arc::new(ScriptedAssistant::new()))
        .expect("engine");

    for result in [engine.pause(), engine.resume(), engine.stop()] {
        assert!(matches!(
            result,
            Err(EngineError::InvalidState {
                state: EngineState::Idle,
                ..
            })
        ));
    }
    assert_eq!(engine.state(), EngineState::Idle);
    assert!(engine.session().is_none());
    assert_eq!(engine.wait().await, None);
}

#[tokio::test]
async fn cyclic_plan_is_refused_before_any_dispatch() {
    let ws = Workspace::new().expect("workspace");
    let original = "- [ ] 1. A\n  - _Depends on: 2_\n- [ ] 2. B\n  - _Depends on: 1_\n";
    ws.write_spec("demo", original);
    let assistant = Arc::new(ScriptedAssistant::new());
    let engine = ws.engine(fast_config(), Arc::clone(&assistant)).expect("engine");

    let err = engine.start().expect_err("cycle");
    assert!(err.is_configuration());
    assert!(err.to_string().contains("demo"));
    assert_eq!(engine.state(), EngineState::Idle);
    assert!(assistant.dispatched().is_empty());
    assert_eq!(ws.read_tasks("demo"), original);
}

#[tokio::test]
async fn disabled_engine_refuses_to_start() {
    let ws = Workspace::new().expect("workspace");
    ws.write_spec("demo", "- [ ] 1. Only\n");
    let config = EngineConfig {
        enabled: false,
        ..fast_config()
    };
    let engine = ws
        .engine(config, Arc::new(ScriptedAssistant::new()))
        .expect("engine");
    assert!(matches!(engine.start(), Err(EngineError::Disabled)));
}

#[tokio::test]
async fn optional_subtasks_are_skipped_and_the_parent_completes() {
    let ws = Workspace::new().expect("workspace");
    ws.write_spec(
        "demo",
        "- [ ] 1. Parent\n  - [ ] 1.1 Required\n  - [ ]* 1.2 Nice to have\n",
    );
    let assistant = Arc::new(ScriptedAssistant::new());
    let config = EngineConfig {
        skip_optional_tasks: true,
        ..fast_config()
    };
    let engine = ws.engine(config, Arc::clone(&assistant)).expect("engine");
    let mut events = engine.subscribe();

    engine.start().expect("start");
    assert_eq!(engine.wait().await, Some(SessionOutcome::Completed));
    assert_eq!(ids(&assistant.dispatched()), vec!["1.1"]);
    assert!(drain_events(&mut events).iter().any(|event| matches!(
        event,
        EngineEvent::TaskSkipped { task, .. } if task.id == "1.2"
    )));
    assert_eq!(
        ws.read_tasks("demo"),
        "- [x] 1. Parent\n  - [x] 1.1 Required\n  - [ ]* 1.2 Nice to have\n"
    );
    assert_eq!(engine.status_of(&key("1.2")), Some(TaskStatus::Skipped));
}

#[tokio::test]
async fn excluded_tasks_are_never_dispatched() {
    let ws = Workspace::new().expect("workspace");
    ws.write_spec("demo", "- [ ] 1. Keep\n- [ ] 2. Leave alone\n- [ ] 3. Keep too\n");
    let assistant = Arc::new(ScriptedAssistant::new());
    let config = EngineConfig {
        excluded_tasks: vec!["demo:2".to_string()],
        ..fast_config()
    };
    let engine = ws.engine(config, Arc::clone(&assistant)).expect("engine");

    engine.start().expect("start");
    assert_eq!(engine.wait().await, Some(SessionOutcome::Completed));
    assert_eq!(ids(&assistant.dispatched()), vec!["1", "3"]);
    assert_eq!(
        ws.read_tasks("demo"),
        "- [x] 1. Keep\n- [ ] 2. Leave alone\n- [x] 3. Keep too\n"
    );
}

#[tokio::test]
async fn memory_over_threshold_raises_an_alert() {
    let ws = Workspace::new().expect("workspace");
    ws.write_spec("demo", "- [ ] 1. Slow\n");
    let assistant = Arc::new(ScriptedAssistant::new().script(
        "1",
        [Script::ReplyAfter(
            Duration::from_millis(300),
            vec!["Task completed successfully".to_string()],
        )],
    ));
    // The workspace probe always reports 10 MB.
    let config = EngineConfig {
        max_memory_mb: 5,
        ..fast_config()
    };
    let engine = ws.engine(config, assistant).expect("engine");
    let mut events = engine.subscribe();

    engine.start().expect("start");
    let alert = next_event(&mut events, WAIT, |event| {
        matches!(event, EngineEvent::PerformanceAlert { .. })
    })
    .await
    .expect("alert");
    let EngineEvent::PerformanceAlert { alert, .. } = alert else {
        unreachable!("filtered above");
    };
    assert_eq!(alert.kind, AlertKind::Memory);
    assert!(alert.cleanup_requested);
    assert_eq!(engine.wait().await, Some(SessionOutcome::Completed));
}
