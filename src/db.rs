use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::rdb::SnapshotEntry;
use crate::utils::get_epoch_ms;

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// The keyspace. Every access goes through this type; expired entries are
/// treated as absent and evicted when observed.
#[derive(Debug, Default)]
pub struct Db {
    entries: RwLock<HashMap<Bytes, Entry>>,
}

impl Db {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, key: Bytes, value: Bytes, ttl: Option<Duration>) {
        let now = Instant::now();
        let expires_at = ttl.and_then(|ttl| now.checked_add(ttl));
        self.entries
            .write()
            .await
            .insert(key, Entry { value, expires_at });
    }

    pub async fn get(&self, key: &[u8]) -> Option<Bytes> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
                Some(_) => {}
            }
        }

        // Re-check under the write lock, a concurrent SET may have replaced it.
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    pub async fn delete(&self, key: &[u8]) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        match entries.remove(key) {
            Some(entry) => !entry.is_expired(now),
            None => false,
        }
    }

    /// Deletes all `keys` under one lock, returning how many were live.
    pub async fn delete_many(&self, keys: &[Bytes]) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        keys.iter()
            .filter_map(|key| entries.remove(key))
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Removes every expired entry, returning how many were dropped.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let db = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                let Some(db) = db.upgrade() else {
                    break;
                };
                let evicted = db.sweep().await;
                if evicted > 0 {
                    debug!(evicted, "expired keys swept");
                }
            }
        })
    }

    /// Point-in-time copy of the live keyspace with absolute unix-ms expiries.
    pub async fn snapshot(&self) -> Vec<SnapshotEntry> {
        let now = Instant::now();
        let epoch_ms = get_epoch_ms();
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, entry)| SnapshotEntry {
                key: key.clone(),
                value: entry.value.clone(),
                expires_at_ms: entry
                    .expires_at
                    .map(|at| {
                        let left = at.saturating_duration_since(now).as_millis();
                        epoch_ms.saturating_add(u64::try_from(left).unwrap_or(u64::MAX))
                    }),
            })
            .collect()
    }

    /// Replaces the whole keyspace, as a full resync requires.
    pub async fn load(&self, snapshot: Vec<SnapshotEntry>) {
        let now = Instant::now();
        let epoch_ms = get_epoch_ms();
        let mut entries = self.entries.write().await;
        entries.clear();
        for SnapshotEntry {
            key,
            value,
            expires_at_ms,
        } in snapshot
        {
            let expires_at = match expires_at_ms {
                Some(at) if at <= epoch_ms => continue,
                Some(at) => now.checked_add(Duration::from_millis(at - epoch_ms)),
                None => None,
            };
            entries.insert(key, Entry { value, expires_at });
        }
    }
}
