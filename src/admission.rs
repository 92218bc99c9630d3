//! Rate-limit and dedup decisions on top of the shared store.

use std::{sync::Arc, time::Duration};

use crate::{
    error::AppResult,
    state::Actor,
    store::{self, AdmissionStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Add,
    Vote,
}

impl ActionKind {
    fn marker_key(self, user_id: &str) -> String {
        match self {
            ActionKind::Add  => store::last_added_key(user_id),
            ActionKind::Vote => store::last_voted_key(user_id),
        }
    }
}

#[derive(Clone)]
pub struct AdmissionControl {
    store: Arc<dyn AdmissionStore>,
    window: Duration,
}

impl AdmissionControl {
    pub fn new(store: Arc<dyn AdmissionStore>, window: Duration) -> Self {
        Self { store, window }
    }

    /// One `SET NX PX` per call: the check and the mark cannot be split by a
    /// concurrent request. Creators are never marked.
    pub async fn check_and_mark_rate_limit(&self, kind: ActionKind, actor: &Actor) -> AppResult<Decision> {
        if actor.is_creator() {
            return Ok(Decision::Allowed);
        }
        let stamp = chrono::Utc::now().timestamp_millis().to_string();
        let fresh = self
            .store
            .set_if_absent(&kind.marker_key(&actor.user_id), &stamp, self.window)
            .await?;
        Ok(decision(fresh))
    }

    /// Undo a mark made earlier in the same, now rejected, decision.
    pub async fn release_rate_limit(&self, kind: ActionKind, actor: &Actor) -> AppResult<()> {
        if actor.is_creator() {
            return Ok(());
        }
        self.store.delete(&kind.marker_key(&actor.user_id)).await
    }

    pub async fn release_dedup(&self, actor: &Actor, url: &str) -> AppResult<()> {
        if actor.is_creator() {
            return Ok(());
        }
        self.store.delete(&store::dedup_key(&actor.room_id, url)).await
    }

    pub async fn check_dedup(&self, actor: &Actor, url: &str) -> AppResult<Decision> {
        if actor.is_creator() {
            return Ok(Decision::Allowed);
        }
        let fresh = self
            .store
            .set_if_absent(&store::dedup_key(&actor.room_id, url), "true", self.window)
            .await?;
        Ok(decision(fresh))
    }
}

fn decision(fresh: bool) -> Decision {
    if fresh { Decision::Allowed } else { Decision::Denied }
}
