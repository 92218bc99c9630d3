use axum::{extract::Path, routing::get, Extension, Json, Router};
use serde::Serialize;

use crate::{error::AppResult, state::AppCtx, store};

pub mod ws;

pub fn router() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/rooms/:room_id", get(room_status))
        .merge(ws::router())
}

async fn health(Extension(ctx): Extension<AppCtx>) -> String {
    let reg = ctx.registry.read().await;
    format!("ok rooms={} users={}", reg.rooms.room_count(), reg.sessions.user_count())
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
struct RoomStatus {
    room_id: String,
    queue_length: i64,
    /// Members and sockets connected to this process only.
    members: usize,
    connections: usize,
}

async fn room_status(
    Path(room_id): Path<String>,
    Extension(ctx): Extension<AppCtx>,
) -> AppResult<Json<RoomStatus>> {
    let queue_length = ctx.store.get_count(&store::queue_length_key(&room_id)).await?;
    let reg = ctx.registry.read().await;
    let members = reg.rooms.get(&room_id).map_or(0, |r| r.members.len());
    let connections = reg.rooms.connections_in(&room_id).count();
    drop(reg);
    Ok(Json(RoomStatus { room_id, queue_length, members, connections }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::{queue::add_to_queue, tests::{actor, ctx}};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn room_status_reports_counter_and_members() {
        let (ctx, _) = ctx();
        let (outbox, _rx) = mpsc::unbounded_channel();
        ctx.registry.write().await.join_room("r1", "boss", "bob", 1, outbox.clone());
        ctx.registry.write().await.join_room("r1", "boss", "bob", 2, outbox);
        add_to_queue(&ctx, &actor("bob"), "https://a").await.unwrap();

        let Json(status) = room_status(Path("r1".into()), Extension(ctx.clone())).await.unwrap();
        assert_eq!(status, RoomStatus { room_id: "r1".into(), queue_length: 1, members: 1, connections: 2 });

        let Json(empty) = room_status(Path("nowhere".into()), Extension(ctx)).await.unwrap();
        assert_eq!(empty.queue_length, 0);
        assert_eq!(empty.members, 0);
        assert_eq!(empty.connections, 0);
    }
}
