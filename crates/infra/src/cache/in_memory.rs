use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{CacheError, CacheKey, SetCache};

#[derive(Debug)]
struct Entry {
    members: BTreeSet<String>,
    expires_at: Instant,
}

/// In-memory set cache with TTL expiry.
///
/// Intended for tests/dev. Expiry follows the tokio clock, so paused-time
/// tests can step over TTLs.
#[derive(Debug, Default)]
pub struct InMemorySetCache {
    entries: Mutex<HashMap<String, Entry>>,
    unavailable: AtomicBool,
}

impl InMemorySetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail until switched off again.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Remaining TTL of a live key.
    pub fn ttl(&self, key: &CacheKey) -> Option<Duration> {
        let entries = self.entries.lock().ok()?;
        let entry = entries.get(&key.to_string())?;
        entry.expires_at.checked_duration_since(Instant::now())
    }

    fn check_available(&self) -> Result<(), CacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Backend("cache unavailable".to_string()));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Entry>>, CacheError> {
        self.entries
            .lock()
            .map_err(|_| CacheError::Backend("lock poisoned".to_string()))
    }
}

#[async_trait]
impl SetCache for InMemorySetCache {
    async fn members(&self, key: &CacheKey) -> Result<Vec<String>, CacheError> {
        self.check_available()?;
        let mut entries = self.lock()?;
        let key = key.to_string();

        match entries.get(&key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                Ok(entry.members.iter().cloned().collect())
            }
            Some(_) => {
                entries.remove(&key);
                Ok(Vec::new())
            }
            None => Ok(Vec::new()),
        }
    }

    async fn add_members(
        &self,
        key: &CacheKey,
        members: &[String],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.check_available()?;
        let mut entries = self.lock()?;
        let now = Instant::now();

        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            members: BTreeSet::new(),
            expires_at: now,
        });
        if entry.expires_at <= now {
            entry.members.clear();
        }
        entry.members.extend(members.iter().cloned());
        entry.expires_at = now + ttl;
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.check_available()?;
        self.lock()?.remove(&key.to_string());
        Ok(())
    }
}
