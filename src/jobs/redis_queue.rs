use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use std::time::Duration;
use tracing::{info, warn};

use super::{Delivery, Envelope, JobQueue};
use crate::error::AppResult;

/// Reliable list queue: `BRPOPLPUSH` moves each job into this worker's
/// processing list, where it stays until acked.
///
/// Keys: `{name}` (pending), `{name}:processing:{worker}`, `{name}:dead`.
#[derive(Clone)]
pub struct RedisJobQueue {
    conn: ConnectionManager,
    /// Separate connection for the blocking pop, so it never stalls pushes.
    blocking: ConnectionManager,
    pending: String,
    processing: String,
    dead: String,
}

impl RedisJobQueue {
    pub async fn connect(client: Client, name: &str, worker_id: &str) -> AppResult<Self> {
        let conn = ConnectionManager::new(client.clone()).await?;
        let blocking = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            blocking,
            pending: name.to_string(),
            processing: format!("{name}:processing:{worker_id}"),
            dead: format!("{name}:dead"),
        })
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn push(&self, envelope: &Envelope) -> AppResult<()> {
        let raw = serde_json::to_string(envelope)?;
        let mut conn = self.conn.clone();
        let _: () = conn.lpush(&self.pending, raw).await?;
        Ok(())
    }

    async fn pull(&self, wait: Duration) -> AppResult<Option<Delivery>> {
        let mut conn = self.blocking.clone();
        let raw: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.pending)
            .arg(&self.processing)
            .arg(wait.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(raw.map(Delivery::from_raw))
    }

    async fn ack(&self, delivery: &Delivery) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.lrem(&self.processing, 1, &delivery.raw).await?;
        if removed == 0 {
            warn!(list = %self.processing, "acked job was not in the processing list");
        }
        Ok(())
    }

    async fn bury(&self, delivery: &Delivery) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .lpush(&self.dead, &delivery.raw)
            .ignore()
            .lrem(&self.processing, 1, &delivery.raw)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn recover(&self) -> AppResult<usize> {
        let mut conn = self.conn.clone();
        let mut moved = 0;
        loop {
            let raw: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(&self.processing)
                .arg(&self.pending)
                .query_async(&mut conn)
                .await?;
            if raw.is_none() {
                break;
            }
            moved += 1;
        }
        if moved > 0 {
            info!(moved, list = %self.processing, "re-queued unfinished jobs");
        }
        Ok(moved)
    }
}
