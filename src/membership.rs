//! Membership lookup
//!
//! Resolves a participant id to a display name and the physiological inputs
//! used for zone and energy calculations. Lookups may be slow or fail; the
//! live view never waits on them.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::zones::max_heart_rate_for_age;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("Member not found: {0}")]
    NotFound(Uuid),

    #[error("Directory unavailable: {0}")]
    Unavailable(String),

    #[error("Lookup timed out")]
    Timeout,
}

/// What the directory knows about a member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberProfile {
    pub name: String,
    pub age: Option<u8>,
    /// Measured maximum heart rate; takes precedence over age.
    pub max_heart_rate: Option<u16>,
    pub weight_kg: Option<f64>,
}

impl MemberProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            age: None,
            max_heart_rate: None,
            weight_kg: None,
        }
    }

    pub fn with_age(mut self, age: u8) -> Self {
        self.age = Some(age);
        self
    }

    pub fn with_max_heart_rate(mut self, max_heart_rate: u16) -> Self {
        self.max_heart_rate = Some(max_heart_rate);
        self
    }

    pub fn with_weight(mut self, weight_kg: f64) -> Self {
        self.weight_kg = Some(weight_kg);
        self
    }

    /// Effective maximum heart rate: measured if known, else from age.
    pub fn resolved_max_heart_rate(&self, default_age: u8) -> u16 {
        match self.max_heart_rate {
            Some(max) if max > 0 => max,
            _ => max_heart_rate_for_age(self.age.unwrap_or(default_age)),
        }
    }
}

/// Source of member profiles.
#[async_trait]
pub trait MembershipResolver: Send + Sync {
    async fn resolve(&self, participant: Uuid) -> Result<MemberProfile, ResolutionError>;
}

/// Run a lookup with an upper bound on how long it may take.
pub async fn resolve_with_timeout(
    resolver: &dyn MembershipResolver,
    participant: Uuid,
    timeout: Duration,
) -> Result<MemberProfile, ResolutionError> {
    match tokio::time::timeout(timeout, resolver.resolve(participant)).await {
        Ok(result) => result,
        Err(_) => Err(ResolutionError::Timeout),
    }
}

/// Member directory held in memory. Used by tests and the demo binary.
pub struct InMemoryDirectory {
    members: RwLock<HashMap<Uuid, MemberProfile>>,
    latency: Duration,
    unavailable: RwLock<Option<String>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self {
            members: RwLock::new(HashMap::new()),
            latency: Duration::ZERO,
            unavailable: RwLock::new(None),
        }
    }

    /// Delay every lookup by `latency`, as a remote directory would.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub async fn insert(&self, participant: Uuid, profile: MemberProfile) {
        self.members.write().await.insert(participant, profile);
    }

    /// Make every lookup fail until cleared with `None`.
    pub async fn set_unavailable(&self, reason: Option<String>) {
        *self.unavailable.write().await = reason;
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MembershipResolver for InMemoryDirectory {
    async fn resolve(&self, participant: Uuid) -> Result<MemberProfile, ResolutionError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(reason) = self.unavailable.read().await.clone() {
            return Err(ResolutionError::Unavailable(reason));
        }
        self.members
            .read()
            .await
            .get(&participant)
            .cloned()
            .ok_or(ResolutionError::NotFound(participant))
    }
}
