//! Applies queued jobs to persistence, then announces them on the fanout.
//!
//! Each delivery moves through `Received → Applying → Publishing → Committed`
//! or ends in `Failed`. Retryable failures go back on the queue with a bumped
//! attempt count after a backoff; terminal ones are buried and never retried.
//! A job whose write landed but whose notice did not is re-queued marked
//! `applied`, and its retry only publishes.

use rand::Rng;
use std::{fmt, sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

use super::{Delivery, Envelope, Job, JobQueue};
use crate::{
    fanout::Fanout,
    persist::{ApplyError, Persistence},
    protocol::{Notice, Vote},
};

const POLL_WAIT: Duration = Duration::from_secs(5);
const BASE_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Retryable,
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Received,
    Applying,
    Publishing,
    Committed,
    Failed(Failure),
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Received                    => f.write_str("received"),
            JobState::Applying                    => f.write_str("applying"),
            JobState::Publishing                  => f.write_str("publishing"),
            JobState::Committed                   => f.write_str("committed"),
            JobState::Failed(Failure::Retryable)  => f.write_str("failed(retryable)"),
            JobState::Failed(Failure::Terminal)   => f.write_str("failed(terminal)"),
        }
    }
}

pub struct Worker {
    queue: Arc<dyn JobQueue>,
    db: Persistence,
    fanout: Fanout,
    max_attempts: u32,
    base_backoff: Duration,
}

impl Worker {
    pub fn new(queue: Arc<dyn JobQueue>, db: Persistence, fanout: Fanout, max_attempts: u32) -> Self {
        Self { queue, db, fanout, max_attempts: max_attempts.max(1), base_backoff: BASE_BACKOFF }
    }

    #[cfg(test)]
    pub fn with_backoff(mut self, base: Duration) -> Self {
        self.base_backoff = base;
        self
    }

    pub async fn run(self) {
        match self.queue.recover().await {
            Ok(n) if n > 0 => info!(requeued = n, "recovered unfinished jobs"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not recover unfinished jobs"),
        }
        info!("job worker started");
        loop {
            match self.queue.pull(POLL_WAIT).await {
                Ok(Some(delivery)) => {
                    self.handle(delivery).await;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "job queue unavailable, backing off");
                    tokio::time::sleep(self.base_backoff * 2).await;
                }
            }
        }
    }

    /// Drives one delivery to a final state and settles it with the queue.
    /// A retry is scheduled in the background, so this never waits out a backoff.
    pub async fn handle(&self, delivery: Delivery) -> JobState {
        let Some(env) = delivery.envelope.clone() else {
            error!(raw = %delivery.raw, "undecodable job, burying");
            self.settle_terminal(&delivery).await;
            return JobState::Failed(Failure::Terminal);
        };
        let mut state = JobState::Received;

        if !env.applied {
            self.step(&env, &mut state, JobState::Applying);
            if let Err(e) = self.apply(&env).await {
                let next = self.fail(&delivery, &env, e).await;
                self.step(&env, &mut state, next);
                return state;
            }
        }

        self.step(&env, &mut state, JobState::Publishing);
        let next = match self.fanout.publish(env.job.room_id(), notice_for(&env.job)).await {
            Ok(()) => {
                if let Err(e) = self.queue.ack(&delivery).await {
                    // a redelivery replays: streams are keyed by job id, votes end in a conflict
                    warn!(job_id = %env.id, error = %e, "ack failed after commit");
                }
                JobState::Committed
            }
            Err(e) => self.fail(&delivery, &env.mark_applied(), ApplyError::Publish(e)).await,
        };
        self.step(&env, &mut state, next);
        state
    }

    async fn apply(&self, env: &Envelope) -> Result<(), ApplyError> {
        match &env.job {
            Job::AddToQueue { user_id, url, room_id, .. } => {
                if self.db.add_stream(env.id, room_id, user_id, url).await? {
                    debug!(room_id = %room_id, stream_id = %env.id, "stream queued");
                } else {
                    debug!(room_id = %room_id, stream_id = %env.id, "stream already recorded");
                }
            }
            Job::CastVote { user_id, stream_id, vote, .. } => match vote {
                Vote::Upvote   => self.db.upvote(user_id, stream_id).await?,
                Vote::Downvote => self.db.remove_vote(user_id, stream_id).await?,
            },
        }
        Ok(())
    }

    /// `retry_as` is what goes back on the queue if the failure is retryable.
    async fn fail(&self, delivery: &Delivery, retry_as: &Envelope, e: ApplyError) -> JobState {
        if e.is_retryable() && retry_as.attempts + 1 < self.max_attempts {
            warn!(job_id = %retry_as.id, attempts = retry_as.attempts + 1, error = %e, "job failed, will retry");
            self.schedule_retry(delivery.clone(), retry_as);
            JobState::Failed(Failure::Retryable)
        } else {
            error!(
                job_id = %retry_as.id,
                name = retry_as.job.name(),
                attempts = retry_as.attempts + 1,
                applied = retry_as.applied,
                error = %e,
                "job failed permanently"
            );
            self.settle_terminal(delivery).await;
            JobState::Failed(Failure::Terminal)
        }
    }

    fn schedule_retry(&self, delivery: Delivery, env: &Envelope) {
        let delay = self.backoff(env.attempts);
        let next = env.next_attempt();
        let queue = self.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // push before ack: a crash in between yields a duplicate, never a loss
            match queue.push(&next).await {
                Ok(()) => {
                    if let Err(e) = queue.ack(&delivery).await {
                        warn!(job_id = %next.id, error = %e, "ack failed after re-queue");
                    }
                }
                Err(e) => warn!(job_id = %next.id, error = %e, "re-queue failed, job stays in flight"),
            }
        });
    }

    async fn settle_terminal(&self, delivery: &Delivery) {
        if let Err(e) = self.queue.bury(delivery).await {
            error!(error = %e, "could not bury failed job");
        }
    }

    fn backoff(&self, attempts: u32) -> Duration {
        let exp = self.base_backoff.saturating_mul(2u32.saturating_pow(attempts.min(16)));
        let capped = exp.min(MAX_BACKOFF);
        let jitter_ms = u64::try_from(capped.as_millis() / 4).unwrap_or(0);
        capped + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    fn step(&self, env: &Envelope, state: &mut JobState, next: JobState) {
        debug!(job_id = %env.id, name = env.job.name(), from = %state, to = %next, "job state");
        *state = next;
    }
}

fn notice_for(job: &Job) -> Notice {
    match job {
        Job::AddToQueue { .. } => Notice::NewStream,
        Job::CastVote { .. }   => Notice::NewVote,
    }
}
