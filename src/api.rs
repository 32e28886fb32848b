use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use crate::{
    error::JobError,
    models::{
        JobStatus, MediaFormat, StartDownloadRequest, StartDownloadResponse, StopAllResponse,
        StopJobResponse,
    },
    AppState,
};

#[derive(Debug, Serialize)]
pub struct DataEnvelope<T> {
    pub data: T,
}

pub fn data<T: Serialize>(value: T) -> Json<DataEnvelope<T>> {
    Json(DataEnvelope { data: value })
}

/// Error rendered as `{"error": {"message", "statusCode"}}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        let status = match err {
            JobError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            JobError::NotFound | JobError::NotStoppable => StatusCode::NOT_FOUND,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "error": {
                    "message": self.message,
                    "statusCode": self.status.as_u16()
                }
            })),
        )
            .into_response()
    }
}

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true, "timestamp": Utc::now() }))
}

pub async fn start_download(
    State(state): State<AppState>,
    Json(payload): Json<StartDownloadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(url) = payload.url.filter(|u| !u.trim().is_empty()) else {
        return Err(ApiError::bad_request("url is required"));
    };
    let Some(format) = payload.format.as_deref().and_then(MediaFormat::parse) else {
        return Err(ApiError::bad_request("format must be audio or video"));
    };

    let job_id = state
        .registry
        .create(&url, format.extension())
        .await
        .map_err(ApiError::from)?;

    Ok(data(StartDownloadResponse {
        job_id,
        status: JobStatus::Queued,
        url,
        format,
    }))
}

pub async fn list_jobs(State(state): State<AppState>) -> impl IntoResponse {
    data(state.registry.list_all().await)
}

pub async fn get_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .registry
        .get(&job_id)
        .await
        .ok_or(JobError::NotFound)?;
    Ok(data(job))
}

pub async fn stop_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.registry.stop(&job_id).await {
        return Err(JobError::NotStoppable.into());
    }

    let status = state
        .registry
        .get(&job_id)
        .await
        .map(|job| job.status)
        .unwrap_or(JobStatus::Cancelled);

    Ok(data(StopJobResponse {
        job_id,
        status,
        message: "Download stopped successfully".to_string(),
    }))
}

pub async fn stop_all_jobs(State(state): State<AppState>) -> impl IntoResponse {
    let summary = state.registry.stop_all().await;
    data(StopAllResponse {
        message: format!("Stopped {} download(s)", summary.stopped),
        stopped: summary.stopped,
        jobs: summary.jobs,
    })
}

#[cfg(test)]
mod tests {
    use axum::{http::StatusCode, response::IntoResponse};

    use super::ApiError;
    use crate::error::JobError;

    #[test]
    fn job_errors_map_to_statuses() {
        let invalid = ApiError::from(JobError::InvalidInput("Invalid YouTube URL".to_string()));
        assert_eq!(invalid.status, StatusCode::BAD_REQUEST);
        assert_eq!(invalid.message, "Invalid YouTube URL");

        let stop = ApiError::from(JobError::NotStoppable);
        assert_eq!(stop.status, StatusCode::NOT_FOUND);
        assert_eq!(stop.message, "Job not found or cannot be stopped");

        assert_eq!(
            ApiError::bad_gateway("down").into_response().status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
