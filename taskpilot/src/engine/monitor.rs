//! Periodic resource snapshots for the running session.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::Shared;
use super::events::EngineEvent;
use crate::supervisor::{Snapshot, Supervisor, Thresholds};

pub(super) async fn run(shared: Arc<Shared>, session_id: Uuid, cancel: CancellationToken) {
    let config = shared.config();
    let mut probe = (shared.ctx.probe)();
    let mut supervisor = Supervisor::new(Thresholds::from_config(config));
    let mut ticker = tokio::time::interval(Duration::from_millis(
        config.resources.snapshot_interval_ms,
    ));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let sample = match probe.sample() {
            Ok(sample) => sample,
            Err(err) => {
                debug!(error = %format!("{err:#}"), "resource sample unavailable");
                continue;
            }
        };
        let active_task = shared
            .active
            .borrow()
            .as_ref()
            .map(|active| (active.key.clone(), active.since.elapsed()));
        let expired = shared.lock_cache().purge_expired();
        if expired > 0 {
            debug!(expired, "expired cached context documents");
        }

        let alerts = supervisor.evaluate(Snapshot {
            at: Utc::now(),
            sample,
            active_task,
            resource_counts: shared.registry.category_counts(),
        });
        for alert in alerts {
            warn!(kind = %alert.kind, message = %alert.message, "performance alert");
            if alert.cleanup_requested {
                let removed = shared.lock_cache().clear();
                supervisor.note_cleanup();
                info!(removed, "cleared context cache after memory alert");
            }
            shared.emit(EngineEvent::PerformanceAlert {
                session_id,
                alert,
                at: Utc::now(),
            });
        }
    }
    debug!(%session_id, "resource monitor stopped");
}
