mod admission;
mod config;
mod coord;
mod error;
mod fanout;
mod jobs;
mod persist;
mod protocol;
mod routes;
mod state;
mod store;

use anyhow::Context;
use axum::{Extension, Router};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tracing_subscriber::EnvFilter;

use crate::{
    config::{Backend, Config},
    fanout::Fanout,
    jobs::{worker::Worker, JobQueue, MemoryJobQueue, RedisJobQueue},
    persist::Persistence,
    state::AppCtx,
    store::{AdmissionStore, MemoryStore, RedisStore},
};

const BODY_LIMIT: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = Config::from_env().context("reading configuration")?;
    tracing::info!(config = ?cfg, "starting");

    let pool = SqlitePool::connect(&cfg.database_url).await.context("opening database")?;
    let db = Persistence::new(pool);
    db.migrate().await.context("creating tables")?;

    let (store, jobs, fanout) = backends(&cfg).await?;

    let ctx = AppCtx::new(store, jobs.clone(), fanout.clone(), cfg.limits);

    tokio::spawn(Worker::new(jobs, db, fanout, cfg.job_max_attempts).run());

    let app = Router::new()
        .merge(routes::router())
        .layer(Extension(ctx))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT));

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("binding {}", cfg.bind_addr))?;
    tracing::info!(addr = %cfg.bind_addr, "listening");
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

type Backends = (Arc<dyn AdmissionStore>, Arc<dyn JobQueue>, Fanout);

async fn backends(cfg: &Config) -> anyhow::Result<Backends> {
    match cfg.backend {
        Backend::Redis => {
            let client = redis::Client::open(cfg.redis_url.as_str()).context("parsing redis url")?;
            let store: Arc<dyn AdmissionStore> =
                Arc::new(RedisStore::connect(client.clone()).await.context("connecting store")?);
            let jobs: Arc<dyn JobQueue> = Arc::new(
                RedisJobQueue::connect(client.clone(), &cfg.job_queue, &cfg.worker_id)
                    .await
                    .context("connecting job queue")?,
            );
            let fanout = Fanout::connect(client).await.context("subscribing to fanout")?;
            Ok((store, jobs, fanout))
        }
        Backend::Memory => {
            tracing::warn!("in-memory backend: state is not shared with other processes");
            let store: Arc<dyn AdmissionStore> = Arc::new(MemoryStore::new());
            let jobs: Arc<dyn JobQueue> = Arc::new(MemoryJobQueue::new());
            Ok((store, jobs, Fanout::local()))
        }
    }
}
