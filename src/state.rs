use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc, RwLock};

use crate::{
    admission::AdmissionControl,
    config::Limits,
    fanout::Fanout,
    jobs::JobQueue,
    store::AdmissionStore,
};

pub type ConnId = u64;
pub type Outbox = mpsc::UnboundedSender<String>;

/* ------------ users / connections ------------ */
#[derive(Default)]
pub struct SessionRegistry {
    users: HashMap<String, Vec<ConnId>>,
    outboxes: HashMap<ConnId, (String, Outbox)>,
}

impl SessionRegistry {
    /// Idempotent: a connection already known for the user is not added twice.
    pub fn register_connection(&mut self, user_id: &str, conn: ConnId, outbox: Outbox) {
        if self.user_of(conn).is_some_and(|u| u != user_id) {
            self.remove_connection(conn);
        }
        let conns = self.users.entry(user_id.to_string()).or_default();
        if !conns.contains(&conn) {
            conns.push(conn);
        }
        self.outboxes.insert(conn, (user_id.to_string(), outbox));
    }

    /// Returns the owning user when the connection was known.
    pub fn remove_connection(&mut self, conn: ConnId) -> Option<String> {
        let (user_id, _) = self.outboxes.remove(&conn)?;
        if let Some(conns) = self.users.get_mut(&user_id) {
            conns.retain(|c| *c != conn);
            if conns.is_empty() {
                self.users.remove(&user_id);
            }
        }
        Some(user_id)
    }

    pub fn connections(&self, user_id: &str) -> &[ConnId] {
        self.users.get(user_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn user_of(&self, conn: ConnId) -> Option<&str> {
        self.outboxes.get(&conn).map(|(u, _)| u.as_str())
    }

    pub fn send(&self, conn: ConnId, frame: &str) {
        if let Some((_, tx)) = self.outboxes.get(&conn) {
            tx.send(frame.to_string()).ok();
        }
    }

    pub fn user_count(&self) -> usize { self.users.len() }
}

/* ------------ rooms ------------ */
#[derive(Debug, Clone)]
pub struct Room {
    pub id: String,
    pub creator_id: String,
    pub members: HashSet<String>,
}

#[derive(Default)]
pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
    conn_room: HashMap<ConnId, String>,
}

impl RoomRegistry {
    pub fn get(&self, room_id: &str) -> Option<&Room> { self.rooms.get(room_id) }

    pub fn room_of(&self, conn: ConnId) -> Option<&str> {
        self.conn_room.get(&conn).map(String::as_str)
    }

    pub fn connections_in<'a>(&'a self, room_id: &'a str) -> impl Iterator<Item = ConnId> + 'a {
        self.conn_room
            .iter()
            .filter(move |(_, r)| r.as_str() == room_id)
            .map(|(c, _)| *c)
    }

    pub fn room_count(&self) -> usize { self.rooms.len() }
}

/// Both registries are only ever touched together, under one lock.
#[derive(Default)]
pub struct Registry {
    pub sessions: SessionRegistry,
    pub rooms: RoomRegistry,
}

impl Registry {
    /// Creates the room (owned by `creator_id`) and the user session on first
    /// sight. Re-joining the same room is a no-op apart from registering the
    /// connection; joining another room, or as another user, leaves first.
    pub fn join_room(&mut self, room_id: &str, creator_id: &str, user_id: &str, conn: ConnId, outbox: Outbox) {
        let moving = self.rooms.room_of(conn).is_some_and(|r| r != room_id)
            || self.sessions.user_of(conn).is_some_and(|u| u != user_id);
        if moving {
            self.leave_room(conn);
        }
        self.sessions.register_connection(user_id, conn, outbox);

        let room = self.rooms.rooms.entry(room_id.to_string()).or_insert_with(|| {
            tracing::info!(room_id, creator_id, "room created");
            Room {
                id: room_id.to_string(),
                creator_id: creator_id.to_string(),
                members: HashSet::new(),
            }
        });
        room.members.insert(user_id.to_string());
        self.rooms.conn_room.insert(conn, room_id.to_string());
    }

    /// Detaches the connection from its room. The user stays a member while
    /// any other of its connections remains in that room; empty rooms go away.
    pub fn leave_room(&mut self, conn: ConnId) -> Option<String> {
        let room_id = self.rooms.conn_room.remove(&conn)?;
        let Some(user_id) = self.sessions.user_of(conn).map(str::to_string) else {
            return Some(room_id);
        };
        let still_present = self
            .sessions
            .connections(&user_id)
            .iter()
            .any(|c| *c != conn && self.rooms.room_of(*c) == Some(room_id.as_str()));

        if !still_present {
            if let Some(room) = self.rooms.rooms.get_mut(&room_id) {
                room.members.remove(&user_id);
                if room.members.is_empty() {
                    self.rooms.rooms.remove(&room_id);
                    tracing::info!(room_id = %room_id, "room removed, no members left");
                }
            }
        }
        Some(room_id)
    }

    pub fn disconnect(&mut self, conn: ConnId) {
        self.leave_room(conn);
        self.sessions.remove_connection(conn);
    }

    /// Room and creator flag for an action arriving on `conn` for `room_id`.
    pub fn resolve(&self, conn: ConnId, room_id: &str, user_id: &str) -> Option<Actor> {
        if self.rooms.room_of(conn) != Some(room_id) || self.sessions.user_of(conn) != Some(user_id) {
            return None;
        }
        let room = self.rooms.get(room_id)?;
        Some(Actor {
            user_id: user_id.to_string(),
            room_id: room.id.clone(),
            creator_id: room.creator_id.clone(),
        })
    }

    pub fn send_to_user(&self, user_id: &str, frame: &str) {
        for conn in self.sessions.connections(user_id) {
            self.sessions.send(*conn, frame);
        }
    }
}

/// Who is acting, in which room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    pub room_id: String,
    pub creator_id: String,
}

impl Actor {
    pub fn is_creator(&self) -> bool { self.user_id == self.creator_id }
}

/* ------------ per-process context ------------ */
#[derive(Clone)]
pub struct AppCtx {
    pub registry: Arc<RwLock<Registry>>,
    pub store: Arc<dyn AdmissionStore>,
    pub admission: AdmissionControl,
    pub jobs: Arc<dyn JobQueue>,
    pub fanout: Fanout,
    pub limits: Limits,
    next_conn: Arc<AtomicU64>,
}

impl AppCtx {
    pub fn new(store: Arc<dyn AdmissionStore>, jobs: Arc<dyn JobQueue>, fanout: Fanout, limits: Limits) -> Self {
        Self {
            registry: Arc::default(),
            admission: AdmissionControl::new(store.clone(), limits.action_window),
            store,
            jobs,
            fanout,
            limits,
            next_conn: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn next_conn_id(&self) -> ConnId {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn notify_user(&self, user_id: &str, frame: &str) {
        self.registry.read().await.send_to_user(user_id, frame);
    }
}
