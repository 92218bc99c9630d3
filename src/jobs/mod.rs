//! Hand-off of admitted mutations to the durable, at-least-once job pipeline.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::{error::AppResult, protocol::Vote};

mod redis_queue;
pub mod worker;

pub use self::redis_queue::RedisJobQueue;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data", rename_all = "kebab-case")]
pub enum Job {
    #[serde(rename_all = "camelCase")]
    AddToQueue {
        creator_id: String,
        user_id: String,
        url: String,
        room_id: String,
    },
    #[serde(rename_all = "camelCase")]
    CastVote {
        creator_id: String,
        user_id: String,
        stream_id: String,
        vote: Vote,
        room_id: String,
    },
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::AddToQueue { .. } => "add-to-queue",
            Job::CastVote { .. }   => "cast-vote",
        }
    }

    pub fn room_id(&self) -> &str {
        match self {
            Job::AddToQueue { room_id, .. } | Job::CastVote { room_id, .. } => room_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub attempts: u32,
    /// Persistence already committed; only the notice is still owed.
    #[serde(default)]
    pub applied: bool,
    pub job: Job,
}

impl Envelope {
    pub fn new(job: Job) -> Self {
        Self { id: Uuid::new_v4(), attempts: 0, applied: false, job }
    }

    pub fn mark_applied(&self) -> Self {
        Self { applied: true, ..self.clone() }
    }

    pub fn next_attempt(&self) -> Self {
        Self { attempts: self.attempts + 1, ..self.clone() }
    }
}

/// A pulled job. `raw` is the exact bytes taken off the queue, needed to ack it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub raw: String,
    /// `None` when the payload could not be decoded.
    pub envelope: Option<Envelope>,
}

impl Delivery {
    pub fn from_raw(raw: String) -> Self {
        let envelope = serde_json::from_str(&raw).ok();
        Self { raw, envelope }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn push(&self, envelope: &Envelope) -> AppResult<()>;

    /// Waits up to `wait` for the next job.
    async fn pull(&self, wait: Duration) -> AppResult<Option<Delivery>>;

    /// The job is done (committed or given up on) and must not be redelivered.
    async fn ack(&self, delivery: &Delivery) -> AppResult<()>;

    /// Parks a terminally failed job for inspection, then acks it.
    async fn bury(&self, delivery: &Delivery) -> AppResult<()>;

    /// Puts back jobs this worker pulled but never acked (previous crash).
    async fn recover(&self) -> AppResult<usize> { Ok(0) }
}

/// Fire-and-forget from the caller's point of view: once this returns the
/// pipeline owns the job.
pub async fn dispatch(queue: &dyn JobQueue, job: Job) -> AppResult<Uuid> {
    let envelope = Envelope::new(job);
    queue.push(&envelope).await?;
    tracing::debug!(job_id = %envelope.id, name = envelope.job.name(), "job dispatched");
    Ok(envelope.id)
}

/* ── in-process queue ── */

#[derive(Clone)]
pub struct MemoryJobQueue {
    tx: mpsc::UnboundedSender<String>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    buried: Arc<Mutex<Vec<String>>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Arc::new(Mutex::new(rx)), buried: Arc::default() }
    }

    #[cfg(test)]
    pub async fn buried(&self) -> Vec<String> { self.buried.lock().await.clone() }

    /// Drains everything currently queued without waiting.
    #[cfg(test)]
    pub async fn drain(&self) -> Vec<Envelope> {
        let mut rx = self.rx.lock().await;
        let mut out = Vec::new();
        while let Ok(raw) = rx.try_recv() {
            if let Ok(env) = serde_json::from_str(&raw) {
                out.push(env);
            }
        }
        out
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self { Self::new() }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn push(&self, envelope: &Envelope) -> AppResult<()> {
        let raw = serde_json::to_string(envelope)?;
        self.tx.send(raw).ok();
        Ok(())
    }

    async fn pull(&self, wait: Duration) -> AppResult<Option<Delivery>> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(Some(raw)) => Ok(Some(Delivery::from_raw(raw))),
            _ => Ok(None),
        }
    }

    async fn ack(&self, _delivery: &Delivery) -> AppResult<()> { Ok(()) }

    async fn bury(&self, delivery: &Delivery) -> AppResult<()> {
        self.buried.lock().await.push(delivery.raw.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_payloads_use_wire_names() {
        let job = Job::AddToQueue {
            creator_id: "c".into(),
            user_id: "u".into(),
            url: "https://a".into(),
            room_id: "r".into(),
        };
        let v = serde_json::to_value(&job).unwrap();
        assert_eq!(v["name"], "add-to-queue");
        assert_eq!(v["data"]["creatorId"], "c");
        assert_eq!(v["data"]["roomId"], "r");

        let vote = Job::CastVote {
            creator_id: "c".into(),
            user_id: "u".into(),
            stream_id: "s".into(),
            vote: Vote::Upvote,
            room_id: "r".into(),
        };
        let v = serde_json::to_value(&vote).unwrap();
        assert_eq!(v["name"], "cast-vote");
        assert_eq!(v["data"]["streamId"], "s");
        assert_eq!(v["data"]["vote"], "upvote");
    }

    #[tokio::test]
    async fn dispatched_jobs_come_back_out() {
        let queue = MemoryJobQueue::new();
        let job = Job::CastVote {
            creator_id: "c".into(),
            user_id: "u".into(),
            stream_id: "s".into(),
            vote: Vote::Downvote,
            room_id: "r".into(),
        };
        let id = dispatch(&queue, job.clone()).await.unwrap();

        let delivery = queue.pull(Duration::from_millis(10)).await.unwrap().unwrap();
        let env = delivery.envelope.unwrap();
        assert_eq!(env.id, id);
        assert_eq!(env.attempts, 0);
        assert_eq!(env.job, job);
    }

    #[tokio::test(start_paused = true)]
    async fn pull_times_out_on_empty_queue() {
        let queue = MemoryJobQueue::new();
        assert!(queue.pull(Duration::from_secs(1)).await.unwrap().is_none());
    }

    #[test]
    fn undecodable_delivery_keeps_raw_bytes() {
        let d = Delivery::from_raw("garbage".into());
        assert!(d.envelope.is_none());
        assert_eq!(d.raw, "garbage");
    }
}
