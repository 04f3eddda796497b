//! Session-tagged resources and their release actions.

use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use tracing::{debug, warn};
use uuid::Uuid;

/// Release action run once when the owning session is cleaned up.
pub type Release = Box<dyn FnOnce() -> Result<()> + Send>;

struct Tracked {
    id: u64,
    category: String,
    release: Release,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub released: usize,
    pub failed: usize,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    sessions: HashMap<Uuid, Vec<Tracked>>,
}

/// Tracks resources per session so they can be released together.
#[derive(Default)]
pub struct ResourceRegistry {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("counts", &self.category_counts())
            .finish()
    }
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a resource for `session`. Returns its handle id.
    pub fn register(&self, session: Uuid, category: &str, release: Release) -> u64 {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.sessions.entry(session).or_default().push(Tracked {
            id,
            category: category.to_string(),
            release,
        });
        debug!(%session, category, id, "registered resource");
        id
    }

    /// Release everything tagged with `session`. Idempotent; a failing or
    /// panicking release is logged and counted, never propagated.
    pub fn cleanup_session(&self, session: Uuid) -> CleanupReport {
        let tracked = self.lock().sessions.remove(&session).unwrap_or_default();
        let mut report = CleanupReport::default();
        for resource in tracked {
            if run_release(resource) {
                report.released += 1;
            } else {
                report.failed += 1;
            }
        }
        if report.released + report.failed > 0 {
            debug!(%session, released = report.released, failed = report.failed, "session resources cleaned up");
        }
        report
    }

    /// Live resources per category across all sessions.
    pub fn category_counts(&self) -> BTreeMap<String, usize> {
        let inner = self.lock();
        let mut counts = BTreeMap::new();
        for tracked in inner.sessions.values().flatten() {
            *counts.entry(tracked.category.clone()).or_insert(0) += 1;
        }
        counts
    }
}

fn run_release(tracked: Tracked) -> bool {
    let Tracked {
        id,
        category,
        release,
    } = tracked;
    match catch_unwind(AssertUnwindSafe(release)) {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            warn!(id, category = %category, error = %err, "resource release failed");
            false
        }
        Err(_) => {
            warn!(id, category = %category, "resource release panicked");
            false
        }
    }
}
