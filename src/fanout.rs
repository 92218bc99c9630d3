//! Room-keyed notifications shared between serving processes.
//!
//! With Redis every publish goes out on `room:{roomId}` and comes back through
//! this process's single pattern subscription, so local and remote changes
//! reach connections along the same path. Without Redis the local broadcast
//! channel is used directly. A notice is published at least once: the worker
//! keeps the job until `publish` succeeds. Ordering across processes is not
//! guaranteed; notices are plain "something changed" signals.

use futures_util::{stream, Stream, StreamExt};
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use tokio::sync::broadcast;
use tracing::{error, warn};

use crate::{error::AppResult, protocol::Notice};

const CHANNEL_PREFIX: &str = "room:";
const LOCAL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomNotice {
    pub room_id: String,
    pub notice: Notice,
}

#[derive(Clone)]
enum Transport {
    Local,
    Redis(ConnectionManager),
    #[cfg(test)]
    Down,
}

#[derive(Clone)]
pub struct Fanout {
    local: broadcast::Sender<RoomNotice>,
    transport: Transport,
}

impl Fanout {
    /// Process-local only.
    pub fn local() -> Self {
        let (local, _) = broadcast::channel(LOCAL_CAPACITY);
        Self { local, transport: Transport::Local }
    }

    /// Every publish fails, as with an unreachable Redis.
    #[cfg(test)]
    pub fn down() -> Self {
        Self { transport: Transport::Down, ..Self::local() }
    }

    /// Publishes through Redis and starts the process-wide listener.
    pub async fn connect(client: Client) -> AppResult<Self> {
        let publisher = ConnectionManager::new(client.clone()).await?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.psubscribe(format!("{CHANNEL_PREFIX}*")).await?;

        let (local, _) = broadcast::channel(LOCAL_CAPACITY);
        let tx = local.clone();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let channel = msg.get_channel_name().to_string();
                let Some(room_id) = channel.strip_prefix(CHANNEL_PREFIX) else { continue };
                let notice = msg
                    .get_payload::<String>()
                    .ok()
                    .and_then(|p| serde_json::from_str::<Notice>(&p).ok());
                match notice {
                    Some(notice) => {
                        tx.send(RoomNotice { room_id: room_id.to_string(), notice }).ok();
                    }
                    None => warn!(channel = %channel, "dropping unreadable fanout payload"),
                }
            }
            error!("fanout subscription closed; cross-process notices stopped");
        });

        Ok(Self { local, transport: Transport::Redis(publisher) })
    }

    pub async fn publish(&self, room_id: &str, notice: Notice) -> AppResult<()> {
        match &self.transport {
            Transport::Redis(conn) => {
                let mut conn = conn.clone();
                let channel = format!("{CHANNEL_PREFIX}{room_id}");
                let _: () = conn.publish(channel, notice.to_text()).await?;
            }
            Transport::Local => {
                // no receiver is not an error: nobody in that room right now
                self.local
                    .send(RoomNotice { room_id: room_id.to_string(), notice })
                    .ok();
            }
            #[cfg(test)]
            Transport::Down => {
                return Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "fanout down").into());
            }
        }
        Ok(())
    }

    /// Notices for one room, as they arrive at this process. The subscription
    /// exists as soon as this returns, before the stream is first polled.
    pub fn subscribe(&self, room_id: &str) -> impl Stream<Item = Notice> + Send + 'static {
        let room_id = room_id.to_string();
        stream::unfold(self.local.subscribe(), move |mut rx| {
            let room_id = room_id.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(n) if n.room_id == room_id => return Some((n.notice, rx)),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(room_id = %room_id, skipped, "fanout subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
    }
}
