//! Per-message action handling for one connection.

use tracing::debug;
use uuid::Uuid;

use crate::{
    error::Reject,
    protocol::{Inbound, Outbound},
    state::{Actor, AppCtx, ConnId, Outbox},
};

pub mod queue;
pub mod vote;

/// Runs one inbound message. Admission rejections are delivered here, to the
/// acting user's connections only. An `Err` is for the caller to report on
/// this connection (not joined, bad frame).
pub async fn handle(ctx: &AppCtx, conn: ConnId, outbox: &Outbox, msg: Inbound) -> Result<(), Reject> {
    match msg {
        Inbound::JoinRoom(j) => {
            ctx.registry
                .write()
                .await
                .join_room(&j.room_id, &j.creator_id, &j.user_id, conn, outbox.clone());
            debug!(conn, room_id = %j.room_id, user_id = %j.user_id, "joined room");
            outbox.send(Outbound::Joined { room_id: j.room_id }.to_text()).ok();
            Ok(())
        }
        Inbound::LeaveRoom => {
            if let Some(room_id) = ctx.registry.write().await.leave_room(conn) {
                debug!(conn, room_id = %room_id, "left room");
            }
            Ok(())
        }
        Inbound::AddToQueue(a) => {
            let actor = resolve(ctx, conn, &a.room_id, &a.user_id).await?;
            let outcome = queue::add_to_queue(ctx, &actor, &a.url).await;
            report(ctx, &actor, outcome).await;
            Ok(())
        }
        Inbound::CastVote(v) => {
            let actor = resolve(ctx, conn, &v.room_id, &v.user_id).await?;
            let outcome = vote::cast_vote(ctx, &actor, &v.stream_id, v.vote).await;
            report(ctx, &actor, outcome).await;
            Ok(())
        }
    }
}

async fn resolve(ctx: &AppCtx, conn: ConnId, room_id: &str, user_id: &str) -> Result<Actor, Reject> {
    ctx.registry
        .read()
        .await
        .resolve(conn, room_id, user_id)
        .ok_or(Reject::NotInRoom)
}

async fn report(ctx: &AppCtx, actor: &Actor, outcome: Result<Uuid, Reject>) {
    if let Err(reject) = outcome {
        debug!(user_id = %actor.user_id, room_id = %actor.room_id, %reject, "action rejected");
        ctx.notify_user(&actor.user_id, &Outbound::from(&reject).to_text()).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        config::Limits,
        fanout::Fanout,
        jobs::{Job, MemoryJobQueue},
        protocol::{AddToQueue, CastVote, JoinRoom, Vote},
        store::MemoryStore,
    };
    use std::sync::Arc;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    pub(crate) fn ctx() -> (AppCtx, MemoryJobQueue) {
        let jobs = MemoryJobQueue::new();
        let ctx = AppCtx::new(
            Arc::new(MemoryStore::new()),
            Arc::new(jobs.clone()),
            Fanout::local(),
            Limits::default(),
        );
        (ctx, jobs)
    }

    pub(crate) fn actor(user: &str) -> Actor {
        Actor { user_id: user.into(), room_id: "r1".into(), creator_id: "boss".into() }
    }

    struct Client {
        conn: ConnId,
        outbox: Outbox,
        inbox: UnboundedReceiver<String>,
        user: String,
    }

    impl Client {
        async fn join(ctx: &AppCtx, user: &str) -> Self {
            let (outbox, inbox) = mpsc::unbounded_channel();
            let mut c = Client { conn: ctx.next_conn_id(), outbox, inbox, user: user.into() };
            let msg = Inbound::JoinRoom(JoinRoom {
                room_id: "r1".into(),
                creator_id: "boss".into(),
                user_id: user.into(),
            });
            handle(ctx, c.conn, &c.outbox, msg).await.unwrap();
            assert_eq!(c.frames(), vec![r#"{"type":"joined","roomId":"r1"}"#.to_string()]);
            c
        }

        async fn add(&self, ctx: &AppCtx, url: &str) -> Result<(), Reject> {
            let msg = Inbound::AddToQueue(AddToQueue {
                room_id: "r1".into(),
                user_id: self.user.clone(),
                url: url.into(),
            });
            handle(ctx, self.conn, &self.outbox, msg).await
        }

        fn frames(&mut self) -> Vec<String> {
            let mut out = Vec::new();
            while let Ok(f) = self.inbox.try_recv() {
                out.push(f);
            }
            out
        }
    }

    #[tokio::test]
    async fn twenty_first_addition_gets_exactly_one_error() {
        let (ctx, jobs) = ctx();
        let mut clients = Vec::new();
        for i in 0..21 {
            clients.push(Client::join(&ctx, &format!("user{i}")).await);
        }
        for (i, c) in clients.iter_mut().take(20).enumerate() {
            c.add(&ctx, &format!("https://v/{i}")).await.unwrap();
            assert!(c.frames().is_empty());
        }

        let last = clients.last_mut().unwrap();
        last.add(&ctx, "https://v/late").await.unwrap();

        assert_eq!(last.frames(), vec![r#"{"type":"error","message":"Queue is full"}"#.to_string()]);
        assert_eq!(jobs.drain().await.len(), 20);
        for c in clients.iter_mut().take(20) {
            assert!(c.frames().is_empty(), "other members must not see the rejection");
        }
    }

    #[tokio::test]
    async fn rejection_reaches_every_connection_of_the_user() {
        let (ctx, _) = ctx();
        let mut phone = Client::join(&ctx, "bob").await;
        let mut laptop = Client::join(&ctx, "bob").await;

        phone.add(&ctx, "https://a").await.unwrap();
        laptop.add(&ctx, "https://b").await.unwrap();

        let expected = vec![r#"{"type":"error","message":"You can only add after 20 min"}"#.to_string()];
        assert_eq!(phone.frames(), expected);
        assert_eq!(laptop.frames(), expected);
    }

    #[tokio::test]
    async fn actions_before_join_are_refused() {
        let (ctx, jobs) = ctx();
        let (outbox, _inbox) = mpsc::unbounded_channel();
        let msg = Inbound::CastVote(CastVote {
            room_id: "r1".into(),
            user_id: "bob".into(),
            stream_id: "s".into(),
            vote: Vote::Upvote,
        });

        assert_eq!(handle(&ctx, 42, &outbox, msg).await, Err(Reject::NotInRoom));
        assert!(jobs.drain().await.is_empty());
    }

    #[tokio::test]
    async fn leaving_then_acting_is_refused() {
        let (ctx, _) = ctx();
        let c = Client::join(&ctx, "bob").await;
        handle(&ctx, c.conn, &c.outbox, Inbound::LeaveRoom).await.unwrap();

        assert_eq!(c.add(&ctx, "https://a").await, Err(Reject::NotInRoom));
        assert!(ctx.registry.read().await.rooms.get("r1").is_none());
    }

    #[tokio::test]
    async fn creator_vote_is_dispatched() {
        let (ctx, jobs) = ctx();
        let mut boss = Client::join(&ctx, "boss").await;
        for _ in 0..2 {
            let msg = Inbound::CastVote(CastVote {
                room_id: "r1".into(),
                user_id: "boss".into(),
                stream_id: "s".into(),
                vote: Vote::Upvote,
            });
            handle(&ctx, boss.conn, &boss.outbox, msg).await.unwrap();
        }
        assert!(boss.frames().is_empty());
        let sent = jobs.drain().await;
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|e| matches!(e.job, Job::CastVote { .. })));
    }
}
