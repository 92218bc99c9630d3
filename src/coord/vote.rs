use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    admission::{ActionKind, Decision},
    error::Reject,
    jobs::{self, Job},
    protocol::Vote,
    state::{Actor, AppCtx},
};

/// Admits a vote. The limit is per user across all streams. Creators skip
/// the limit and their votes are persisted like anyone else's.
pub async fn cast_vote(ctx: &AppCtx, actor: &Actor, stream_id: &str, vote: Vote) -> Result<Uuid, Reject> {
    if ctx.admission.check_and_mark_rate_limit(ActionKind::Vote, actor).await? == Decision::Denied {
        debug!(user_id = %actor.user_id, "vote rate limited");
        return Err(Reject::VoteRateLimited);
    }

    let job = Job::CastVote {
        creator_id: actor.creator_id.clone(),
        user_id: actor.user_id.clone(),
        stream_id: stream_id.to_string(),
        vote,
        room_id: actor.room_id.clone(),
    };
    match jobs::dispatch(ctx.jobs.as_ref(), job).await {
        Ok(id) => Ok(id),
        Err(e) => {
            if let Err(release) = ctx.admission.release_rate_limit(ActionKind::Vote, actor).await {
                warn!(user_id = %actor.user_id, error = %release, "rate-limit release failed");
            }
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::tests::{actor, ctx};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn one_vote_per_window_across_streams() {
        let (ctx, jobs) = ctx();
        let bob = actor("bob");

        cast_vote(&ctx, &bob, "s1", Vote::Upvote).await.unwrap();
        assert_eq!(cast_vote(&ctx, &bob, "s2", Vote::Upvote).await, Err(Reject::VoteRateLimited));

        tokio::time::advance(Duration::from_secs(20 * 60)).await;
        cast_vote(&ctx, &bob, "s2", Vote::Downvote).await.unwrap();

        let sent = jobs.drain().await;
        assert_eq!(sent.len(), 2);
        assert!(matches!(&sent[1].job, Job::CastVote { stream_id, vote: Vote::Downvote, .. } if stream_id == "s2"));
    }

    #[tokio::test]
    async fn creator_votes_are_unthrottled_and_dispatched() {
        let (ctx, jobs) = ctx();
        let boss = actor("boss");
        for stream in ["s1", "s2", "s3"] {
            cast_vote(&ctx, &boss, stream, Vote::Upvote).await.unwrap();
        }
        assert_eq!(jobs.drain().await.len(), 3);
    }

    #[tokio::test]
    async fn voting_does_not_consume_the_add_window() {
        let (ctx, _) = ctx();
        let bob = actor("bob");
        cast_vote(&ctx, &bob, "s1", Vote::Upvote).await.unwrap();
        assert!(crate::coord::queue::add_to_queue(&ctx, &bob, "https://a").await.is_ok());
    }
}
