//! Session records as JSON-lines files
//!
//! Each session is one `{session}.jsonl` file in the storage directory: a
//! `started` line, one `sample` line per heart-rate sample, and a final
//! `closed` line carrying the summary.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{PersistenceError, SessionRecord, SessionRef, SessionStore, StoredSample};
use crate::live::session::SessionSummary;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SessionLine {
    Started {
        participant: Uuid,
        started_at: DateTime<Utc>,
    },
    Sample(StoredSample),
    Closed {
        summary: SessionSummary,
    },
}

fn io_error(e: std::io::Error) -> PersistenceError {
    PersistenceError::IoError(e.to_string())
}

/// File-backed session store.
pub struct JsonlSessionStore {
    storage_path: PathBuf,
    /// Sessions closed through this store. Also serializes writes.
    closed: Mutex<HashSet<SessionRef>>,
}

impl JsonlSessionStore {
    pub fn new(storage_path: PathBuf) -> Self {
        Self {
            storage_path,
            closed: Mutex::new(HashSet::new()),
        }
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    fn session_path(&self, session: SessionRef) -> PathBuf {
        self.storage_path.join(format!("{}.jsonl", session))
    }

    async fn append_line(&self, session: SessionRef, line: &SessionLine) -> Result<(), PersistenceError> {
        let path = self.session_path(session);
        if !path.exists() {
            return Err(PersistenceError::NotFound(session));
        }
        let mut json = serde_json::to_string(line)
            .map_err(|e| PersistenceError::SerializationError(e.to_string()))?;
        json.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(io_error)?;
        file.write_all(json.as_bytes()).await.map_err(io_error)?;
        file.flush().await.map_err(io_error)
    }

    /// Read a session back from disk.
    pub async fn load_session(&self, session: SessionRef) -> Result<SessionRecord, PersistenceError> {
        let path = self.session_path(session);
        let data = tokio::fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PersistenceError::NotFound(session)
            } else {
                io_error(e)
            }
        })?;

        let mut record: Option<SessionRecord> = None;
        for line in data.lines().filter(|l| !l.trim().is_empty()) {
            let parsed: SessionLine = serde_json::from_str(line)
                .map_err(|e| PersistenceError::DeserializationError(e.to_string()))?;
            match (parsed, &mut record) {
                (SessionLine::Started { participant, started_at }, slot @ None) => {
                    *slot = Some(SessionRecord {
                        participant,
                        started_at,
                        samples: Vec::new(),
                        summary: None,
                    });
                }
                (SessionLine::Sample(sample), Some(record)) => record.samples.push(sample),
                (SessionLine::Closed { summary }, Some(record)) => record.summary = Some(summary),
                (other, _) => {
                    return Err(PersistenceError::DeserializationError(format!(
                        "unexpected record in {}: {:?}",
                        path.display(),
                        other
                    )));
                }
            }
        }
        record.ok_or_else(|| {
            PersistenceError::DeserializationError(format!("{} is empty", path.display()))
        })
    }
}

#[async_trait]
impl SessionStore for JsonlSessionStore {
    async fn create_session(
        &self,
        participant: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<SessionRef, PersistenceError> {
        let _guard = self.closed.lock().await;
        tokio::fs::create_dir_all(&self.storage_path)
            .await
            .map_err(io_error)?;

        let session = SessionRef::new();
        let mut json = serde_json::to_string(&SessionLine::Started {
            participant,
            started_at,
        })
        .map_err(|e| PersistenceError::SerializationError(e.to_string()))?;
        json.push('\n');
        tokio::fs::write(self.session_path(session), json)
            .await
            .map_err(io_error)?;
        Ok(session)
    }

    async fn append_sample(
        &self,
        session: SessionRef,
        sample: StoredSample,
    ) -> Result<(), PersistenceError> {
        let closed = self.closed.lock().await;
        if closed.contains(&session) {
            return Err(PersistenceError::AlreadyClosed(session));
        }
        self.append_line(session, &SessionLine::Sample(sample)).await
    }

    async fn close_session(
        &self,
        session: SessionRef,
        summary: &SessionSummary,
    ) -> Result<(), PersistenceError> {
        let mut closed = self.closed.lock().await;
        if closed.contains(&session) {
            return Err(PersistenceError::AlreadyClosed(session));
        }
        self.append_line(
            session,
            &SessionLine::Closed {
                summary: summary.clone(),
            },
        )
        .await?;
        closed.insert(session);
        Ok(())
    }
}
