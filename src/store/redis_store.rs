use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, Script};
use std::time::Duration;
use tracing::error;

use super::AdmissionStore;
use crate::error::AppResult;

/// KEYS[1] counter, ARGV[1] ceiling. Returns the new value, or -1 when full.
const INCR_BOUNDED: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0') or 0
if current >= tonumber(ARGV[1]) then
    return -1
end
return redis.call('INCR', KEYS[1])
"#;

/// KEYS[1] counter. Returns the new value, floored at zero.
const DECR_FLOOR: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0') or 0
if current <= 0 then
    return 0
end
return redis.call('DECR', KEYS[1])
"#;

/// Redis-backed store. Cheap to clone; the connection manager reconnects on its own.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    incr_bounded: Script,
    decr_floor: Script,
}

impl RedisStore {
    pub async fn connect(client: Client) -> AppResult<Self> {
        let conn = ConnectionManager::new(client).await.map_err(|e| {
            // do not log the URL, it carries the password
            error!(error = %e, "failed to connect to redis");
            e
        })?;
        Ok(Self {
            conn,
            incr_bounded: Script::new(INCR_BOUNDED),
            decr_floor: Script::new(DECR_FLOOR),
        })
    }
}

#[async_trait]
impl AdmissionStore for RedisStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn incr_bounded(&self, key: &str, max: i64) -> AppResult<Option<i64>> {
        let mut conn = self.conn.clone();
        let next: i64 = self.incr_bounded.key(key).arg(max).invoke_async(&mut conn).await?;
        Ok((next >= 0).then_some(next))
    }

    async fn decr_floor(&self, key: &str) -> AppResult<i64> {
        let mut conn = self.conn.clone();
        let next: i64 = self.decr_floor.key(key).invoke_async(&mut conn).await?;
        Ok(next)
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn get_count(&self, key: &str) -> AppResult<i64> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        Ok(raw.and_then(|s| s.parse().ok()).unwrap_or(0))
    }
}
