use axum::{
    extract::{ws::{Message, WebSocket, WebSocketUpgrade}, Extension},
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info};

use crate::{
    coord,
    protocol::{Inbound, Outbound},
    state::{AppCtx, ConnId, Outbox},
};

pub fn router() -> Router {
    Router::new().route("/ws", get(ws_handler))
}

async fn ws_handler(ws: WebSocketUpgrade, Extension(ctx): Extension<AppCtx>) -> impl IntoResponse {
    let conn = ctx.next_conn_id();
    ws.on_upgrade(move |s| user_ws(s, conn, ctx))
}

/* ---------------- per connection ---------------- */
async fn user_ws(sock: WebSocket, conn: ConnId, ctx: AppCtx) {
    info!(conn, "connection opened");
    let (mut sink, mut stream) = sock.split();
    let (outbox, mut rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    let mut watch = None;
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(raw) => {
                on_text(&ctx, conn, &outbox, &raw).await;
                let room = ctx.registry.read().await.rooms.room_of(conn).map(str::to_string);
                follow_room(&ctx, &outbox, &mut watch, room);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    /* leaving */
    follow_room(&ctx, &outbox, &mut watch, None);
    ctx.registry.write().await.disconnect(conn);
    drop(outbox);
    writer.abort();
    info!(conn, "connection closed");
}

async fn on_text(ctx: &AppCtx, conn: ConnId, outbox: &Outbox, raw: &str) {
    let result = match Inbound::parse(raw) {
        Ok(msg) => coord::handle(ctx, conn, outbox, msg).await,
        Err(reject) => Err(reject),
    };
    if let Err(reject) = result {
        debug!(conn, %reject, "message refused");
        outbox.send(Outbound::from(&reject).to_text()).ok();
    }
}

/// Fanout subscription for the room a connection is currently in.
struct RoomWatch {
    room_id: String,
    task: JoinHandle<()>,
}

/// Points the connection's notice feed at `room`, dropping the old one.
fn follow_room(ctx: &AppCtx, outbox: &Outbox, watch: &mut Option<RoomWatch>, room: Option<String>) {
    if watch.as_ref().map(|w| &w.room_id) == room.as_ref() {
        return;
    }
    if let Some(old) = watch.take() {
        old.task.abort();
    }
    let Some(room_id) = room else { return };

    let mut notices = Box::pin(ctx.fanout.subscribe(&room_id));
    let outbox = outbox.clone();
    let task = tokio::spawn(async move {
        while let Some(notice) = notices.next().await {
            if outbox.send(notice.to_text()).is_err() {
                break;
            }
        }
    });
    *watch = Some(RoomWatch { room_id, task });
}
