use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::Instant};

use super::AdmissionStore;
use crate::error::AppResult;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-process store for tests and single-process runs.
///
/// Expiry is measured on tokio's clock, so paused-time tests can move past a
/// TTL with `tokio::time::advance`. The mutex makes each method atomic the
/// same way a single Redis command is.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }
}

fn live<'a>(map: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let expired = map
        .get(key)
        .and_then(|e| e.expires_at)
        .is_some_and(|at| at <= Instant::now());
    if expired {
        map.remove(key);
    }
    map.get_mut(key)
}

fn as_int(entry: Option<&mut Entry>) -> i64 {
    entry.and_then(|e| e.value.parse().ok()).unwrap_or(0)
}

#[async_trait]
impl AdmissionStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool> {
        let mut map = self.entries.lock().await;
        if live(&mut map, key).is_some() {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry { value: value.to_string(), expires_at: Some(Instant::now() + ttl) },
        );
        Ok(true)
    }

    async fn incr_bounded(&self, key: &str, max: i64) -> AppResult<Option<i64>> {
        let mut map = self.entries.lock().await;
        let current = as_int(live(&mut map, key));
        if current >= max {
            return Ok(None);
        }
        let next = current + 1;
        let entry = map
            .entry(key.to_string())
            .or_insert(Entry { value: String::new(), expires_at: None });
        entry.value = next.to_string();
        Ok(Some(next))
    }

    async fn decr_floor(&self, key: &str) -> AppResult<i64> {
        let mut map = self.entries.lock().await;
        let Some(entry) = live(&mut map, key) else {
            return Ok(0);
        };
        let next = (entry.value.parse::<i64>().unwrap_or(0) - 1).max(0);
        entry.value = next.to_string();
        Ok(next)
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn get_count(&self, key: &str) -> AppResult<i64> {
        let mut map = self.entries.lock().await;
        Ok(as_int(live(&mut map, key)))
    }
}
