//! Contract over the shared expiring key-value store.
//!
//! Every method is a single atomic operation on the store. Admission code
//! never composes a read and a later write into one decision.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::AppResult;

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

#[async_trait]
pub trait AdmissionStore: Send + Sync {
    /// Sets `key` with the given expiry unless it already exists.
    /// Returns `true` when this call created the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool>;

    /// Increments the integer at `key` unless it is already `>= max`.
    /// Returns the new value, or `None` when the ceiling was hit.
    async fn incr_bounded(&self, key: &str, max: i64) -> AppResult<Option<i64>>;

    /// Decrements the integer at `key`, never going below zero.
    async fn decr_floor(&self, key: &str) -> AppResult<i64>;

    async fn delete(&self, key: &str) -> AppResult<()>;

    /// Current integer value; missing keys read as zero.
    async fn get_count(&self, key: &str) -> AppResult<i64>;
}

/* ── keyspace ── */

pub fn queue_length_key(room_id: &str) -> String { format!("queuelength-{room_id}") }

pub fn last_added_key(user_id: &str) -> String { format!("lastadded-{user_id}") }

pub fn last_voted_key(user_id: &str) -> String { format!("lastvoted-{user_id}") }

pub fn dedup_key(room_id: &str, url: &str) -> String { format!("{room_id}-{url}") }
