//! The persisted record of the running session.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use uuid::Uuid;

use crate::io::session_store::{SessionRecord, write_session};

/// Shared handle to the session record; every update is written through.
#[derive(Debug)]
pub struct SessionLog {
    path: PathBuf,
    id: Uuid,
    record: Mutex<SessionRecord>,
}

impl SessionLog {
    /// Write the freshly opened record and take ownership of it.
    pub fn create(path: PathBuf, record: SessionRecord) -> Result<Self> {
        write_session(&path, &record)?;
        Ok(Self {
            path,
            id: record.session_id,
            record: Mutex::new(record),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, SessionRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` and persist the result before returning.
    pub fn update<R>(&self, f: impl FnOnce(&mut SessionRecord) -> R) -> Result<R> {
        let mut record = self.lock();
        let out = f(&mut record);
        write_session(&self.path, &record)?;
        Ok(out)
    }

    pub fn read<R>(&self, f: impl FnOnce(&SessionRecord) -> R) -> R {
        f(&self.lock())
    }

    pub fn snapshot(&self) -> SessionRecord {
        self.lock().clone()
    }
}
