use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde_json::json;
use tracing::{info, warn};

use crate::{
    api::{data, ApiError},
    aria2::validate_magnet,
    error::UpstreamError,
    models::{
        AddTorrentRequest, AddTorrentResponse, ForceQuery, TorrentActionResponse, TorrentListQuery,
    },
    AppState,
};

fn upstream(action: &str, err: UpstreamError) -> ApiError {
    warn!("aria2 {action} failed: {err}");
    ApiError::bad_gateway(err.to_string())
}

pub async fn add_torrent(
    State(state): State<AppState>,
    Json(payload): Json<AddTorrentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(magnet_link) = payload.magnet_link.filter(|m| !m.is_empty()) else {
        return Err(ApiError::bad_request("magnetLink is required"));
    };
    validate_magnet(&magnet_link)
        .map_err(|err| ApiError::bad_request(err.to_string()))?;

    let save_path = payload
        .save_path
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| state.config.download_dir.to_string_lossy().into_owned());

    let gid = state
        .aria2
        .add_magnet(&magnet_link, &save_path)
        .await
        .map_err(|err| upstream("addUri", err))?;
    info!(gid = %gid, save_path = %save_path, "Torrent added");

    Ok(data(AddTorrentResponse {
        gid,
        message: "Torrent added successfully".to_string(),
        magnet_link,
    }))
}

pub async fn list_torrents(
    State(state): State<AppState>,
    Query(query): Query<TorrentListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let aria2 = &state.aria2;
    let downloads = match query.status.as_deref() {
        Some("active") => aria2.tell_active().await,
        Some("waiting") => aria2.tell_waiting().await,
        Some("stopped") => aria2.tell_stopped().await,
        _ => {
            let (active, waiting, stopped) =
                tokio::try_join!(aria2.tell_active(), aria2.tell_waiting(), aria2.tell_stopped())
                    .map_err(|err| upstream("list", err))?;
            Ok(json!({
                "active": active,
                "waiting": waiting,
                "stopped": stopped,
            }))
        }
    }
    .map_err(|err| upstream("list", err))?;

    Ok(data(downloads))
}

pub async fn get_torrent(
    State(state): State<AppState>,
    Path(gid): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let download = state
        .aria2
        .tell_status(&gid)
        .await
        .map_err(|err| upstream("tellStatus", err))?
        .ok_or_else(|| ApiError::not_found("Download not found"))?;
    Ok(data(download))
}

pub async fn pause_torrent(
    State(state): State<AppState>,
    Path(gid): Path<String>,
    Query(force): Query<ForceQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let gid = state
        .aria2
        .pause(&gid, force.is_forced())
        .await
        .map_err(|err| upstream("pause", err))?;
    Ok(data(TorrentActionResponse {
        gid,
        message: "Download paused successfully".to_string(),
    }))
}

pub async fn resume_torrent(
    State(state): State<AppState>,
    Path(gid): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let gid = state
        .aria2
        .resume(&gid)
        .await
        .map_err(|err| upstream("unpause", err))?;
    Ok(data(TorrentActionResponse {
        gid,
        message: "Download resumed successfully".to_string(),
    }))
}

pub async fn remove_torrent(
    State(state): State<AppState>,
    Path(gid): Path<String>,
    Query(force): Query<ForceQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let gid = state
        .aria2
        .remove(&gid, force.is_forced())
        .await
        .map_err(|err| upstream("remove", err))?;
    info!(gid = %gid, "Torrent removed");
    Ok(data(TorrentActionResponse {
        gid,
        message: "Download removed successfully".to_string(),
    }))
}

pub async fn stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state
        .aria2
        .global_stat()
        .await
        .map_err(|err| upstream("getGlobalStat", err))?;
    Ok(data(stats))
}
