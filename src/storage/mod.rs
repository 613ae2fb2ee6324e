//! Persistence for workout sessions and device pairings
//!
//! Session records are written through the [`SessionStore`] trait. The live
//! view treats every write as best-effort: a failed write is logged by the
//! caller and never rolls back in-memory state.

pub mod associations;
pub mod session_file;

pub use associations::DeviceAssociations;
pub use session_file::JsonlSessionStore;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::live::session::SessionSummary;
use crate::zones::Zone;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Session not found: {0}")]
    NotFound(SessionRef),

    #[error("Session already closed: {0}")]
    AlreadyClosed(SessionRef),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Handle to a persisted session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionRef(pub Uuid);

impl SessionRef {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionRef {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One heart-rate sample as stored with a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSample {
    pub at: DateTime<Utc>,
    pub heart_rate: u16,
    pub zone: Zone,
}

/// Backend for workout session records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(
        &self,
        participant: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<SessionRef, PersistenceError>;

    async fn append_sample(
        &self,
        session: SessionRef,
        sample: StoredSample,
    ) -> Result<(), PersistenceError>;

    async fn close_session(
        &self,
        session: SessionRef,
        summary: &SessionSummary,
    ) -> Result<(), PersistenceError>;
}

/// A session as held by [`InMemorySessionStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub participant: Uuid,
    pub started_at: DateTime<Utc>,
    pub samples: Vec<StoredSample>,
    pub summary: Option<SessionSummary>,
}

/// Session store kept in memory. Can be switched into a failing mode to
/// exercise persistence outages.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<SessionRef, SessionRecord>>,
    failing: AtomicBool,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn session(&self, session: SessionRef) -> Option<SessionRecord> {
        self.sessions.read().await.get(&session).cloned()
    }

    pub async fn records(&self) -> Vec<SessionRecord> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    fn check_available(&self) -> Result<(), PersistenceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_session(
        &self,
        participant: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<SessionRef, PersistenceError> {
        self.check_available()?;
        let session = SessionRef::new();
        self.sessions.write().await.insert(
            session,
            SessionRecord {
                participant,
                started_at,
                samples: Vec::new(),
                summary: None,
            },
        );
        Ok(session)
    }

    async fn append_sample(
        &self,
        session: SessionRef,
        sample: StoredSample,
    ) -> Result<(), PersistenceError> {
        self.check_available()?;
        let mut sessions = self.sessions.write().await;
        let record = sessions
            .get_mut(&session)
            .ok_or(PersistenceError::NotFound(session))?;
        if record.summary.is_some() {
            return Err(PersistenceError::AlreadyClosed(session));
        }
        record.samples.push(sample);
        Ok(())
    }

    async fn close_session(
        &self,
        session: SessionRef,
        summary: &SessionSummary,
    ) -> Result<(), PersistenceError> {
        self.check_available()?;
        let mut sessions = self.sessions.write().await;
        let record = sessions
            .get_mut(&session)
            .ok_or(PersistenceError::NotFound(session))?;
        if record.summary.is_some() {
            return Err(PersistenceError::AlreadyClosed(session));
        }
        record.summary = Some(summary.clone());
        Ok(())
    }
}
