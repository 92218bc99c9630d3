use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    admission::{ActionKind, Decision},
    error::Reject,
    jobs::{self, Job},
    state::{Actor, AppCtx},
    store,
};

/// Admits a url into the room's queue.
///
/// The bounded increment comes first and is the only place the counter is
/// read; every later rejection gives the slot back.
pub async fn add_to_queue(ctx: &AppCtx, actor: &Actor, url: &str) -> Result<Uuid, Reject> {
    let key = store::queue_length_key(&actor.room_id);
    let Some(len) = ctx.store.incr_bounded(&key, ctx.limits.max_queue_length).await? else {
        debug!(room_id = %actor.room_id, user_id = %actor.user_id, "queue full");
        return Err(Reject::QueueFull);
    };

    match admit(ctx, actor, url).await {
        Ok(job_id) => {
            debug!(room_id = %actor.room_id, user_id = %actor.user_id, len, %job_id, "queue addition admitted");
            Ok(job_id)
        }
        Err(reject) => {
            if let Err(e) = ctx.store.decr_floor(&key).await {
                warn!(room_id = %actor.room_id, error = %e, "queue slot rollback failed");
            }
            Err(reject)
        }
    }
}

async fn admit(ctx: &AppCtx, actor: &Actor, url: &str) -> Result<Uuid, Reject> {
    if ctx.admission.check_and_mark_rate_limit(ActionKind::Add, actor).await? == Decision::Denied {
        return Err(Reject::AddRateLimited);
    }

    let dedup = match ctx.admission.check_dedup(actor, url).await {
        Ok(d) => d,
        Err(e) => {
            release_marks(ctx, actor, None).await;
            return Err(e.into());
        }
    };
    if dedup == Decision::Denied {
        release_marks(ctx, actor, None).await;
        return Err(Reject::DuplicateEntry);
    }

    let job = Job::AddToQueue {
        creator_id: actor.creator_id.clone(),
        user_id: actor.user_id.clone(),
        url: url.to_string(),
        room_id: actor.room_id.clone(),
    };
    match jobs::dispatch(ctx.jobs.as_ref(), job).await {
        Ok(id) => Ok(id),
        Err(e) => {
            release_marks(ctx, actor, Some(url)).await;
            Err(e.into())
        }
    }
}

/// A rejected or failed addition must not cost the user their window.
async fn release_marks(ctx: &AppCtx, actor: &Actor, url: Option<&str>) {
    if let Err(e) = ctx.admission.release_rate_limit(ActionKind::Add, actor).await {
        warn!(user_id = %actor.user_id, error = %e, "rate-limit release failed");
    }
    if let Some(url) = url {
        if let Err(e) = ctx.admission.release_dedup(actor, url).await {
            warn!(room_id = %actor.room_id, error = %e, "dedup release failed");
        }
    }
}
