//! Turns an assistant response into a verdict for one attempt.
//!
//! Text is accumulated until the response closes, the task timeout passes or
//! the session is cancelled, and only then classified as a whole. A reply that
//! carries both indicators therefore resolves the same way however it was
//! split into chunks, and a progress line mentioning an error does not cut a
//! still-working assistant short. Cancellation drains chunks already buffered
//! so a success that arrived just before `stop` is not lost.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::core::completion::{CompletionClassifier, Verdict};
use crate::io::assistant::{Assistant, AssistantError, ResponseChannel, ResponseChunk};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorSettings {
    pub timeout: Duration,
    /// When set, a response that ends without any indicator is a failure.
    pub verify_completion: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    Success { text: String },
    Failure { error: AssistantError, text: String },
    /// The session was cancelled before a verdict. `success` is set when the
    /// text drained after cancellation carries a success indicator.
    Cancelled { success: bool, text: String },
}

impl Detection {
    pub fn text(&self) -> &str {
        match self {
            Self::Success { text } | Self::Failure { text, .. } | Self::Cancelled { text, .. } => text,
        }
    }
}

/// Wait for the verdict on one dispatch.
pub async fn detect(
    channel: ResponseChannel,
    classifier: &dyn CompletionClassifier,
    settings: DetectorSettings,
    cancel: &CancellationToken,
    assistant: &dyn Assistant,
    dispatch_id: Uuid,
) -> Detection {
    match channel {
        ResponseChannel::Stream(rx) => detect_stream(rx, classifier, settings, cancel).await,
        ResponseChannel::Poll { interval } => {
            poll_for_completion(assistant, dispatch_id, interval, classifier, settings, cancel).await
        }
    }
}

pub async fn detect_stream(
    mut rx: mpsc::Receiver<ResponseChunk>,
    classifier: &dyn CompletionClassifier,
    settings: DetectorSettings,
    cancel: &CancellationToken,
) -> Detection {
    let mut text = String::new();
    let deadline = tokio::time::sleep(settings.timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                while let Ok(chunk) = rx.try_recv() {
                    if let Ok(chunk) = chunk {
                        text.push_str(&chunk);
                    }
                }
                return cancelled(classifier, text);
            }
            _ = &mut deadline => {
                return timed_out(classifier, settings.timeout, text);
            }
            chunk = rx.recv() => match chunk {
                Some(Ok(chunk)) => text.push_str(&chunk),
                Some(Err(error)) => return Detection::Failure { error, text },
                None => return closed(classifier, settings, text),
            }
        }
    }
}

/// Poll `assistant` every `interval` until it reports the response finished,
/// the timeout passes, or the session is cancelled.
pub async fn poll_for_completion(
    assistant: &dyn Assistant,
    dispatch_id: Uuid,
    interval: Duration,
    classifier: &dyn CompletionClassifier,
    settings: DetectorSettings,
    cancel: &CancellationToken,
) -> Detection {
    let mut text = String::new();
    let deadline = Instant::now() + settings.timeout;
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return cancelled(classifier, text),
            _ = tokio::time::sleep_until(deadline) => {
                return timed_out(classifier, settings.timeout, text);
            }
            _ = ticker.tick() => {
                let response = match assistant.poll(dispatch_id).await {
                    Ok(response) => response,
                    Err(error) => return Detection::Failure { error, text },
                };
                text = response.text;
                if response.finished {
                    return closed(classifier, settings, text);
                }
                debug!(%dispatch_id, bytes = text.len(), "no verdict yet");
            }
        }
    }
}

/// `Some` when the text carries a final verdict. The text is filled in by the caller.
fn settle(classifier: &dyn CompletionClassifier, text: &str) -> Option<Detection> {
    match classifier.classify(text) {
        Verdict::Success => Some(Detection::Success {
            text: String::new(),
        }),
        Verdict::Failure { indicator } => Some(Detection::Failure {
            error: AssistantError::protocol(format!("failure indicator: {indicator}")),
            text: String::new(),
        }),
        Verdict::Pending => None,
    }
}

fn with_text(detection: Detection, text: String) -> Detection {
    match detection {
        Detection::Success { .. } => Detection::Success { text },
        Detection::Failure { error, .. } => Detection::Failure { error, text },
        Detection::Cancelled { success, .. } => Detection::Cancelled { success, text },
    }
}

fn cancelled(classifier: &dyn CompletionClassifier, text: String) -> Detection {
    let success = classifier.classify(&text) == Verdict::Success;
    Detection::Cancelled { success, text }
}

/// The deadline passed with the response still open. A verdict already in the
/// text stands; otherwise the attempt timed out.
fn timed_out(classifier: &dyn CompletionClassifier, timeout: Duration, text: String) -> Detection {
    if let Some(detection) = settle(classifier, &text) {
        debug!(bytes = text.len(), "response still open at the deadline; using its verdict");
        return with_text(detection, text);
    }
    Detection::Failure {
        error: AssistantError::timeout(format!("no verdict within {}ms", timeout.as_millis())),
        text,
    }
}

/// The response ended; classify everything it said.
fn closed(classifier: &dyn CompletionClassifier, settings: DetectorSettings, text: String) -> Detection {
    if let Some(detection) = settle(classifier, &text) {
        return with_text(detection, text);
    }
    if settings.verify_completion {
        Detection::Failure {
            error: AssistantError::protocol("response ended without a completion indicator"),
            text,
        }
    } else {
        Detection::Success { text }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::core::completion::IndicatorClassifier;
    use crate::core::retry::ErrorKind;
    use crate::io::assistant::{DispatchRequest, PollResponse};

    fn classifier() -> IndicatorClassifier {
        IndicatorClassifier::with_defaults().expect("classifier")
    }

    fn settings(verify_completion: bool) -> DetectorSettings {
        DetectorSettings {
            timeout: Duration::from_secs(5),
            verify_completion,
        }
    }

    async fn run(chunks: &[ResponseChunk], verify: bool) -> Detection {
        let (tx, rx) = mpsc::channel(16);
        for chunk in chunks {
            tx.send(chunk.clone()).await.expect("send");
        }
        drop(tx);
        detect_stream(rx, &classifier(), settings(verify), &CancellationToken::new()).await
    }

    #[tokio::test]
    async fn success_across_chunks() {
        let detection = run(
            &[Ok("Task compl".to_string()), Ok("eted successfully".to_string())],
            true,
        )
        .await;
        assert_eq!(
            detection,
            Detection::Success {
                text: "Task completed successfully".to_string()
            }
        );
    }

    #[tokio::test]
    async fn failure_wins_within_one_chunk() {
        let detection = run(
            &[Ok("Task completed successfully. Error: tests failed".to_string())],
            true,
        )
        .await;
        let Detection::Failure { error, .. } = detection else {
            panic!("expected failure, got {detection:?}");
        };
        assert_eq!(error.kind, ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn failure_wins_across_line_chunks() {
        let detection = run(
            &[
                Ok("Task completed successfully\n".to_string()),
                Ok("Error: tests failed\n".to_string()),
            ],
            true,
        )
        .await;
        let Detection::Failure { error, text } = detection else {
            panic!("expected failure, got {detection:?}");
        };
        assert_eq!(error.kind, ErrorKind::Protocol);
        assert_eq!(text, "Task completed successfully\nError: tests failed\n");
    }

    #[tokio::test]
    async fn success_line_does_not_end_the_response_early() {
        let (tx, rx) = mpsc::channel(4);
        let reader = tokio::spawn(async move {
            detect_stream(rx, &classifier(), settings(true), &CancellationToken::new()).await
        });
        tx.send(Ok("Task completed successfully\n".to_string()))
            .await
            .expect("send");
        tokio::task::yield_now().await;
        assert!(!reader.is_finished());
        tx.send(Ok("Task failed: lint errors\n".to_string()))
            .await
            .expect("send");
        drop(tx);
        let detection = reader.await.expect("join");
        assert!(matches!(detection, Detection::Failure { .. }));
    }

    #[tokio::test]
    async fn transport_error_ends_the_attempt() {
        let detection = run(
            &[
                Ok("working".to_string()),
                Err(AssistantError::transport("pipe closed")),
            ],
            true,
        )
        .await;
        assert_eq!(
            detection,
            Detection::Failure {
                error: AssistantError::transport("pipe closed"),
                text: "working".to_string()
            }
        );
    }

    #[tokio::test]
    async fn close_without_indicator_depends_on_verification() {
        let chunks = [Ok("did some things".to_string())];
        assert!(matches!(
            run(&chunks, true).await,
            Detection::Failure { error, .. } if error.kind == ErrorKind::Protocol
        ));
        assert!(matches!(run(&chunks, false).await, Detection::Success { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out() {
        let (_tx, rx) = mpsc::channel::<ResponseChunk>(1);
        let settings = DetectorSettings {
            timeout: Duration::from_millis(50),
            verify_completion: true,
        };
        let detection = detect_stream(rx, &classifier(), settings, &CancellationToken::new()).await;
        assert!(matches!(
            detection,
            Detection::Failure { error, .. } if error.kind == ErrorKind::Timeout
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn verdict_in_an_open_response_stands_at_the_deadline() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok("Task completed successfully".to_string()))
            .await
            .expect("send");
        let settings = DetectorSettings {
            timeout: Duration::from_millis(50),
            verify_completion: true,
        };
        let detection = detect_stream(rx, &classifier(), settings, &CancellationToken::new()).await;
        assert!(matches!(detection, Detection::Success { .. }));
        drop(tx);
    }

    #[tokio::test]
    async fn cancellation_drains_buffered_success() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok("Task completed successfully".to_string()))
            .await
            .expect("send");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let detection = detect_stream(rx, &classifier(), settings(true), &cancel).await;
        assert_eq!(
            detection,
            Detection::Cancelled {
                success: true,
                text: "Task completed successfully".to_string()
            }
        );
    }

    #[tokio::test]
    async fn cancellation_without_verdict_is_not_success() {
        let (_tx, rx) = mpsc::channel::<ResponseChunk>(4);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let detection = detect_stream(rx, &classifier(), settings(true), &cancel).await;
        assert!(matches!(detection, Detection::Cancelled { success: false, .. }));
    }

    /// Answers polls from a fixed list, repeating the last entry.
    struct PollingAssistant {
        responses: Mutex<Vec<PollResponse>>,
    }

    #[async_trait]
    impl Assistant for PollingAssistant {
        async fn send(
            &self,
            _request: DispatchRequest,
            _cancel: CancellationToken,
        ) -> Result<ResponseChannel, AssistantError> {
            Ok(ResponseChannel::Poll {
                interval: Duration::from_millis(10),
            })
        }

        async fn poll(&self, _dispatch_id: Uuid) -> Result<PollResponse, AssistantError> {
            let mut responses = self.responses.lock().expect("lock");
            if responses.len() > 1 {
                Ok(responses.remove(0))
            } else {
                responses
                    .first()
                    .cloned()
                    .ok_or_else(|| AssistantError::transport("no responses"))
            }
        }
    }

    fn polling(responses: &[(&str, bool)]) -> PollingAssistant {
        PollingAssistant {
            responses: Mutex::new(
                responses
                    .iter()
                    .map(|(text, finished)| PollResponse {
                        text: (*text).to_string(),
                        finished: *finished,
                    })
                    .collect(),
            ),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn polling_reaches_success() {
        let assistant = polling(&[("", false), ("working", false), ("Task completed successfully", true)]);
        let detection = poll_for_completion(
            &assistant,
            Uuid::new_v4(),
            Duration::from_millis(10),
            &classifier(),
            settings(true),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(detection, Detection::Success { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn polling_classifies_the_whole_finished_response() {
        let assistant = polling(&[
            ("Task completed successfully", false),
            ("Task completed successfully\nError: migration failed", true),
        ]);
        let detection = poll_for_completion(
            &assistant,
            Uuid::new_v4(),
            Duration::from_millis(10),
            &classifier(),
            settings(true),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(
            detection,
            Detection::Failure { error, .. } if error.kind == ErrorKind::Protocol
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn polling_finished_without_indicator_fails_under_verification() {
        let assistant = polling(&[("partial", false), ("partial output", true)]);
        let detection = poll_for_completion(
            &assistant,
            Uuid::new_v4(),
            Duration::from_millis(10),
            &classifier(),
            settings(true),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(
            detection,
            Detection::Failure { error, .. } if error.kind == ErrorKind::Protocol
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn polling_times_out() {
        let assistant = polling(&[("still thinking", false)]);
        let detection = poll_for_completion(
            &assistant,
            Uuid::new_v4(),
            Duration::from_millis(10),
            &classifier(),
            DetectorSettings {
                timeout: Duration::from_millis(100),
                verify_completion: true,
            },
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(
            detection,
            Detection::Failure { error, .. } if error.kind == ErrorKind::Timeout
        ));
    }
}
