//! Durable records written by the job worker.

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::AppErr;

/// Why a job did not complete. The worker decides retry vs. give up from this.
#[derive(thiserror::Error, Debug)]
pub enum ApplyError {
    /// Integrity problem (duplicate upvote, missing upvote). Never retried.
    #[error("persistence conflict: {0}")]
    Conflict(String),

    /// Connectivity or pool trouble. Safe to retry.
    #[error("transient persistence failure: {0}")]
    Transient(#[source] sqlx::Error),

    /// Everything else the database reports. Retrying will not help.
    #[error("persistence failure: {0}")]
    Fatal(#[source] sqlx::Error),

    /// The write landed but its notice did not go out.
    #[error("notice not published: {0}")]
    Publish(#[source] AppErr),
}

impl ApplyError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApplyError::Transient(_) | ApplyError::Publish(_))
    }
}

impl From<sqlx::Error> for ApplyError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            if db.is_unique_violation() {
                return ApplyError::Conflict(db.message().to_string());
            }
        }
        if matches!(
            e,
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed
        ) {
            ApplyError::Transient(e)
        } else {
            ApplyError::Fatal(e)
        }
    }
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS streams (
        id       TEXT PRIMARY KEY,
        room_id  TEXT NOT NULL,
        user_id  TEXT NOT NULL,
        url      TEXT NOT NULL,
        added_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS upvotes (
        user_id   TEXT NOT NULL,
        stream_id TEXT NOT NULL,
        PRIMARY KEY (user_id, stream_id)
    )",
];

#[derive(Clone)]
pub struct Persistence {
    pool: SqlitePool,
}

impl Persistence {
    pub fn new(pool: SqlitePool) -> Self { Self { pool } }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Records a queued stream under the job's id. Returns `false` when that
    /// id was already recorded, so a redelivered job never adds a second row.
    pub async fn add_stream(&self, id: Uuid, room_id: &str, user_id: &str, url: &str) -> Result<bool, ApplyError> {
        let done = sqlx::query(
            "INSERT INTO streams (id, room_id, user_id, url, added_at) VALUES (?,?,?,?,?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(id.to_string())
        .bind(room_id)
        .bind(user_id)
        .bind(url)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    pub async fn upvote(&self, user_id: &str, stream_id: &str) -> Result<(), ApplyError> {
        sqlx::query("INSERT INTO upvotes (user_id, stream_id) VALUES (?,?)")
            .bind(user_id)
            .bind(stream_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove_vote(&self, user_id: &str, stream_id: &str) -> Result<(), ApplyError> {
        let done = sqlx::query("DELETE FROM upvotes WHERE user_id = ? AND stream_id = ?")
            .bind(user_id)
            .bind(stream_id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(ApplyError::Conflict(format!("no upvote by {user_id} on {stream_id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
impl Persistence {
    pub async fn close(&self) { self.pool.close().await }

    pub async fn vote_count(&self, user_id: &str, stream_id: &str) -> Result<i64, sqlx::Error> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM upvotes WHERE user_id = ? AND stream_id = ?")
            .bind(user_id)
            .bind(stream_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn streams_in(&self, room_id: &str) -> Result<Vec<(String, String)>, sqlx::Error> {
        sqlx::query_as("SELECT user_id, url FROM streams WHERE room_id = ? ORDER BY added_at")
            .bind(room_id)
            .fetch_all(&self.pool)
            .await
    }
}

#[cfg(test)]
pub(crate) async fn memory_persistence() -> Persistence {
    // one connection: every `sqlite::memory:` connection is its own database
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let p = Persistence::new(pool);
    p.migrate().await.unwrap();
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_upvote_is_a_conflict() {
        let db = memory_persistence().await;
        db.upvote("u", "s").await.unwrap();

        let err = db.upvote("u", "s").await.unwrap_err();
        assert!(matches!(err, ApplyError::Conflict(_)), "got {err:?}");
        assert!(!err.is_retryable());
        assert_eq!(db.vote_count("u", "s").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn removing_missing_vote_is_a_conflict() {
        let db = memory_persistence().await;
        let err = db.remove_vote("u", "s").await.unwrap_err();
        assert!(matches!(err, ApplyError::Conflict(_)));
    }

    #[tokio::test]
    async fn upvote_then_remove_leaves_nothing() {
        let db = memory_persistence().await;
        db.upvote("u", "s").await.unwrap();
        db.remove_vote("u", "s").await.unwrap();
        assert_eq!(db.vote_count("u", "s").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn streams_are_recorded_per_room() {
        let db = memory_persistence().await;
        assert!(db.add_stream(Uuid::new_v4(), "r1", "u1", "https://a").await.unwrap());
        assert!(db.add_stream(Uuid::new_v4(), "r2", "u2", "https://b").await.unwrap());

        let rows = db.streams_in("r1").await.unwrap();
        assert_eq!(rows, vec![("u1".to_string(), "https://a".to_string())]);
    }

    #[tokio::test]
    async fn same_stream_id_is_recorded_once() {
        let db = memory_persistence().await;
        let id = Uuid::new_v4();
        assert!(db.add_stream(id, "r1", "u1", "https://a").await.unwrap());
        assert!(!db.add_stream(id, "r1", "u1", "https://a").await.unwrap());
        assert_eq!(db.streams_in("r1").await.unwrap().len(), 1);
    }

    #[test]
    fn pool_trouble_is_retryable() {
        assert!(ApplyError::from(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!ApplyError::from(sqlx::Error::RowNotFound).is_retryable());
    }
}
