use axum::{http::StatusCode, response::IntoResponse};

pub type AppResult<T> = Result<T, AppErr>;

/// Infrastructure failures: store, database, socket, config.
#[derive(thiserror::Error, Debug)]
pub enum AppErr {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("DB: {0}")]
    Db(#[from] sqlx::Error),

    #[error("Redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config: {0}")]
    Config(String),
}

impl IntoResponse for AppErr {
    fn into_response(self) -> axum::response::Response {
        tracing::error!(error = %self, "request failed");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
    }
}

/* ── admission outcomes, only ever shown to the acting user ── */
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Reject {
    #[error("You can only add after 20 min")]
    AddRateLimited,

    #[error("You can only vote after 20 min")]
    VoteRateLimited,

    #[error("Queue is full")]
    QueueFull,

    #[error("Already added")]
    DuplicateEntry,

    #[error("Join a room first")]
    NotInRoom,

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Malformed message")]
    Malformed,

    #[error("Internal error")]
    Internal,
}

impl From<AppErr> for Reject {
    fn from(e: AppErr) -> Self {
        tracing::warn!(error = %e, "admission aborted by infrastructure error");
        Reject::Internal
    }
}
