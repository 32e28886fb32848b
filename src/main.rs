mod ai_api;
mod api;
mod aria2;
mod config;
mod downloader;
mod error;
mod models;
mod ollama;
mod registry;
mod supervisor;
mod torrent_api;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use aria2::Aria2Client;
use axum::{
    routing::{get, post},
    Router,
};
use config::Config;
use downloader::YtDlpInvoker;
use ollama::OllamaClient;
use registry::JobRegistry;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub registry: JobRegistry,
    pub ollama: OllamaClient,
    pub aria2: Aria2Client,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "media_gateway_api=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;

    let invoker = YtDlpInvoker::new(
        config.docker_bin.clone(),
        config.ytdlp_container.clone(),
        config.download_dir.clone(),
    );
    let registry = JobRegistry::new(Arc::new(invoker));

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to build HTTP client")?;

    let state = AppState {
        ollama: OllamaClient::new(
            http.clone(),
            config.ollama_base_url.clone(),
            config.ollama_model.clone(),
            config.upstream_timeout,
        ),
        aria2: Aria2Client::new(
            http,
            config.aria2_rpc_url.clone(),
            config.aria2_rpc_secret.clone(),
            config.upstream_timeout,
        ),
        registry: registry.clone(),
        config: config.clone(),
    };

    registry::spawn_cleanup_worker(registry);

    let app = Router::new()
        .route("/healthz", get(api::healthz))
        .nest("/api/youtube", youtube_routes())
        .nest("/api/ai", ai_routes())
        .nest("/api/torrent", torrent_routes())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("media-gateway-api listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}

fn youtube_routes() -> Router<AppState> {
    Router::new()
        .route("/download", post(api::start_download))
        .route("/list", get(api::list_jobs))
        .route("/status/{job_id}", get(api::get_status))
        .route("/stop/{job_id}", post(api::stop_job))
        .route("/stop-all", post(api::stop_all_jobs))
}

fn ai_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(ai_api::health))
        .route("/chat", post(ai_api::chat))
        .route("/chat/stream", post(ai_api::chat_stream))
}

fn torrent_routes() -> Router<AppState> {
    Router::new()
        .route("/add", post(torrent_api::add_torrent))
        .route("/list", get(torrent_api::list_torrents))
        .route("/stats", get(torrent_api::stats))
        .route(
            "/{gid}",
            get(torrent_api::get_torrent).delete(torrent_api::remove_torrent),
        )
        .route("/{gid}/pause", post(torrent_api::pause_torrent))
        .route("/{gid}/resume", post(torrent_api::resume_torrent))
}
