//! Authoritative per-user score and version
//!
//! Each user owns one async mutex. Holding the guard is the per-user
//! exclusion of the commit path: submissions for different users never touch
//! the same lock, submissions for one user serialize. Acquisition is bounded
//! so a hot user answers `Busy` instead of queueing forever.

use crate::error::EngineError;
use dashmap::DashMap;
use shared::UserId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserScore {
    pub score: u64,
    /// Incremented on every applied mutation
    pub version: u64,
    /// Account creation time in ms, used for account age
    pub created_at: u64,
}

impl UserScore {
    fn new(created_at: u64) -> Self {
        Self {
            score: 0,
            version: 0,
            created_at,
        }
    }
}

pub type UserGuard = OwnedMutexGuard<UserScore>;

#[derive(Default)]
pub struct ScoreStore {
    users: DashMap<UserId, Arc<Mutex<UserScore>>>,
}

impl ScoreStore {
    pub fn new() -> Self {
        Self::default()
    }

    // The map shard lock is released before anyone awaits the user mutex
    fn slot(&self, user_id: &str, now: u64) -> Arc<Mutex<UserScore>> {
        if let Some(slot) = self.users.get(user_id) {
            return Arc::clone(slot.value());
        }
        let slot = self
            .users
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(UserScore::new(now))));
        Arc::clone(slot.value())
    }

    /// Acquires the user's lock, creating the user at `now` if unknown
    pub async fn lock(
        &self,
        user_id: &str,
        now: u64,
        wait: Duration,
    ) -> Result<UserGuard, EngineError> {
        let slot = self.slot(user_id, now);
        timeout(wait, slot.lock_owned())
            .await
            .map_err(|_| EngineError::Busy(user_id.to_string()))
    }

    /// Acquires the lock of an existing user only
    pub async fn lock_existing(&self, user_id: &str, wait: Duration) -> Result<UserGuard, EngineError> {
        let slot = self
            .users
            .get(user_id)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or_else(|| EngineError::UnknownUser(user_id.to_string()))?;
        timeout(wait, slot.lock_owned())
            .await
            .map_err(|_| EngineError::Busy(user_id.to_string()))
    }

    /// Records when an externally issued account was created. Returns false if
    /// the user is currently locked by a commit.
    pub fn register(&self, user_id: &str, created_at: u64) -> bool {
        let slot = self.slot(user_id, created_at);
        let registered = match slot.try_lock() {
            Ok(mut user) => {
                user.created_at = created_at;
                true
            }
            Err(_) => false,
        };
        registered
    }

    pub async fn get(&self, user_id: &str) -> Option<UserScore> {
        let slot = self.users.get(user_id).map(|slot| Arc::clone(slot.value()))?;
        let user = *slot.lock().await;
        Some(user)
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Sum of all scores; each user is read under its own lock
    pub async fn total_score(&self) -> u64 {
        let slots: Vec<_> = self
            .users
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut total = 0u64;
        for slot in slots {
            total = total.saturating_add(slot.lock().await.score);
        }
        total
    }
}
