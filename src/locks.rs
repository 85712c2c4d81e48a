//! Cooperative job locks with a time-to-live
//!
//! A holder keeps its lock alive with [`JobLocks::refresh_lock`]; if a
//! refresh finds the lock gone the callback is told and refreshing stops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("lock {resource} is held by another job")]
    Held { resource: String },

    #[error("lock {resource} is not held by token {token}")]
    NotHeld { resource: String, token: String },
}

/// Notified by the refresher of a held lock
pub trait LockCallback: Send + Sync {
    /// Keep refreshing while this returns true
    fn is_active(&self) -> bool;

    /// The lock expired or was taken away
    fn lock_released(&self);
}

#[async_trait]
pub trait JobLocks: Send + Sync {
    /// Take `resource` for `ttl`, retrying `retries` times `wait` apart; returns a token
    async fn get_lock(
        &self,
        resource: &str,
        ttl: Duration,
        wait: Duration,
        retries: u32,
    ) -> Result<String, LockError>;

    /// Start refreshing a held lock every `interval` until the callback goes inactive
    async fn refresh_lock(
        &self,
        token: &str,
        resource: &str,
        interval: Duration,
        callback: Arc<dyn LockCallback>,
    ) -> Result<(), LockError>;

    /// Release a held lock; false if the token no longer held it
    async fn release_lock(&self, token: &str, resource: &str) -> Result<bool, LockError>;
}

#[derive(Debug, Clone)]
struct HeldLock {
    token: String,
    ttl: Duration,
    expires: Instant,
}

impl HeldLock {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires
    }
}

/// Process-local lock table
#[derive(Debug, Clone, Default)]
pub struct InMemoryJobLocks {
    locks: Arc<Mutex<HashMap<String, HeldLock>>>,
}

impl InMemoryJobLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared instance
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Drop `resource` whoever holds it, as an expired TTL would
    pub fn revoke(&self, resource: &str) -> bool {
        self.locks.lock().remove(resource).is_some()
    }

    /// Whether a live lock exists on `resource`
    pub fn is_locked(&self, resource: &str) -> bool {
        let now = Instant::now();
        self.locks
            .lock()
            .get(resource)
            .is_some_and(|held| held.is_live(now))
    }

    fn try_acquire(&self, resource: &str, ttl: Duration) -> Option<String> {
        let now = Instant::now();
        let mut locks = self.locks.lock();
        if locks.get(resource).is_some_and(|held| held.is_live(now)) {
            return None;
        }
        let token = uuid::Uuid::new_v4().to_string();
        locks.insert(
            resource.to_string(),
            HeldLock {
                token: token.clone(),
                ttl,
                expires: now + ttl,
            },
        );
        Some(token)
    }

    /// Extend a lock held by `token`; false if it is gone
    fn extend(&self, token: &str, resource: &str) -> bool {
        let now = Instant::now();
        let mut locks = self.locks.lock();
        match locks.get_mut(resource) {
            Some(held) if held.token == token && held.is_live(now) => {
                held.expires = now + held.ttl;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl JobLocks for InMemoryJobLocks {
    async fn get_lock(
        &self,
        resource: &str,
        ttl: Duration,
        wait: Duration,
        retries: u32,
    ) -> Result<String, LockError> {
        for attempt in 0..=retries {
            if let Some(token) = self.try_acquire(resource, ttl) {
                debug!(resource, attempt, "Acquired job lock");
                return Ok(token);
            }
            if attempt < retries {
                tokio::time::sleep(wait).await;
            }
        }
        Err(LockError::Held {
            resource: resource.to_string(),
        })
    }

    async fn refresh_lock(
        &self,
        token: &str,
        resource: &str,
        interval: Duration,
        callback: Arc<dyn LockCallback>,
    ) -> Result<(), LockError> {
        if !self.extend(token, resource) {
            return Err(LockError::NotHeld {
                resource: resource.to_string(),
                token: token.to_string(),
            });
        }

        let locks = self.clone();
        let token = token.to_string();
        let resource = resource.to_string();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !callback.is_active() {
                    break;
                }
                if !locks.extend(&token, &resource) {
                    warn!(resource = %resource, "Job lock lost");
                    callback.lock_released();
                    break;
                }
            }
        });
        Ok(())
    }

    async fn release_lock(&self, token: &str, resource: &str) -> Result<bool, LockError> {
        let mut locks = self.locks.lock();
        match locks.get(resource) {
            Some(held) if held.token == token => {
                locks.remove(resource);
                debug!(resource, "Released job lock");
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Flag {
        released: AtomicBool,
    }

    impl LockCallback for Flag {
        fn is_active(&self) -> bool {
            true
        }

        fn lock_released(&self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_until_released() {
        let locks = InMemoryJobLocks::new();
        let ttl = Duration::from_secs(30);

        let token = locks
            .get_lock("job", ttl, Duration::ZERO, 0)
            .await
            .unwrap();
        assert!(locks.is_locked("job"));
        assert_eq!(
            locks.get_lock("job", ttl, Duration::from_millis(1), 2).await,
            Err(LockError::Held {
                resource: "job".into()
            })
        );

        assert!(!locks.release_lock("someone-else", "job").await.unwrap());
        assert!(locks.release_lock(&token, "job").await.unwrap());
        assert!(locks.get_lock("job", ttl, Duration::ZERO, 0).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken() {
        let locks = InMemoryJobLocks::new();
        locks
            .get_lock("job", Duration::from_millis(5), Duration::ZERO, 0)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!locks.is_locked("job"));
        assert!(locks
            .get_lock("job", Duration::from_secs(1), Duration::ZERO, 0)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_refresh_reports_loss() {
        let locks = InMemoryJobLocks::new();
        let token = locks
            .get_lock("job", Duration::from_secs(30), Duration::ZERO, 0)
            .await
            .unwrap();
        let flag = Arc::new(Flag::default());
        locks
            .refresh_lock(&token, "job", Duration::from_millis(5), flag.clone())
            .await
            .unwrap();

        assert!(locks.revoke("job"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(flag.released.load(Ordering::SeqCst));

        assert!(matches!(
            locks
                .refresh_lock(&token, "job", Duration::from_millis(5), flag)
                .await,
            Err(LockError::NotHeld { .. })
        ));
    }
}
