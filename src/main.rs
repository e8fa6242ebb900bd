mod api;
mod config;
mod error;
mod leaderboard;
mod maze;
mod metrics;
mod models;
mod queue;
mod ratelimit;
mod sandbox;
mod screen;
mod session;
mod store;
mod worker;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::net::TcpListener;

use crate::{
    config::{AppConfig, LeaderboardBackendKind},
    leaderboard::{
        Leaderboard, LeaderboardBackend, in_memory::InMemoryLeaderboard,
        redis_backend::RedisLeaderboard,
    },
    maze::MazeCatalog,
    metrics::MetricsRegistry,
    queue::Scheduler,
    sandbox::SandboxFactory,
    session::SessionRegistry,
    store::SubmissionStore,
    worker::{WorkerDeps, spawn_worker_pool},
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(AppConfig::from_env());
    init_tracing(&config);

    let store = Arc::new(SubmissionStore::new(config.persistence_path.clone()));
    let metrics = Arc::new(MetricsRegistry::new());
    let scheduler = Scheduler::new(config.queue_capacity, metrics.clone());
    let sandbox = SandboxFactory::from_config(&config).context("sandbox backend init failed")?;

    let mut mazes = MazeCatalog::builtin();
    if let Some(dir) = &config.mazes_dir {
        mazes
            .load_dir(dir)
            .with_context(|| format!("failed to load mazes from {}", dir.display()))?;
    }
    let mazes = Arc::new(mazes);

    let sessions = Arc::new(SessionRegistry::new());
    let backend: Arc<dyn LeaderboardBackend> = match &config.leaderboard_backend {
        LeaderboardBackendKind::InMemory => Arc::new(InMemoryLeaderboard::new()),
        LeaderboardBackendKind::Redis { url } => Arc::new(
            RedisLeaderboard::new(url.clone(), "labyrinth".to_string())
                .await
                .context("leaderboard redis init failed")?,
        ),
    };
    let leaderboard = Leaderboard::new(backend, metrics.clone());

    spawn_worker_pool(
        config.worker_count.max(1),
        scheduler.receiver(),
        WorkerDeps {
            store: store.clone(),
            metrics: metrics.clone(),
            sandbox,
            sessions: sessions.clone(),
            mazes: mazes.clone(),
            leaderboard: leaderboard.clone(),
            api_url: config.session_api_url.clone(),
        },
    );

    spawn_idle_sweeper(sessions.clone(), Duration::from_secs(config.session_idle_secs));

    let app = api::routes(
        config.clone(),
        store,
        scheduler,
        metrics,
        sessions,
        mazes,
        leaderboard,
    );

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .context("failed to bind listener")?;
    let local = listener
        .local_addr()
        .unwrap_or(SocketAddr::from(([0, 0, 0, 0], 0)));
    tracing::info!(bind = %local, workers = config.worker_count, "labyrinth backend ready");
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_idle_sweeper(sessions: Arc<SessionRegistry>, max_idle: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            sessions.sweep_idle(max_idle).await;
        }
    });
}

fn init_tracing(config: &AppConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .init();
}
