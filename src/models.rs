use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::supervisor::ProcessHandle;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    #[serde(alias = "mp3")]
    Audio,
    #[serde(alias = "mp4")]
    Video,
}

impl MediaFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "audio" | "mp3" => Some(Self::Audio),
            "video" | "mp4" => Some(Self::Video),
            _ => None,
        }
    }

    /// File extension yt-dlp produces for this format.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Audio => "mp3",
            Self::Video => "mp4",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Downloading,
    Completed,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Downloading)
    }
}

/// Serializable view of a job handed out to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    pub url: String,
    pub format: MediaFormat,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct JobRecord {
    pub job_id: String,
    pub url: String,
    pub format: MediaFormat,
    pub status: JobStatus,
    pub progress: Option<f64>,
    pub filename: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub process: Option<ProcessHandle>,
}

impl JobRecord {
    pub fn new(job_id: String, url: String, format: MediaFormat, created_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            url,
            format,
            status: JobStatus::Queued,
            progress: None,
            filename: None,
            error: None,
            created_at,
            completed_at: None,
            process: None,
        }
    }

    pub fn to_job(&self) -> Job {
        Job {
            job_id: self.job_id.clone(),
            url: self.url.clone(),
            format: self.format,
            status: self.status,
            progress: self.progress,
            filename: self.filename.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }

    /// Moves the job into a terminal state and releases its process handle.
    pub fn finish(&mut self, status: JobStatus, error: Option<String>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.error = error;
        self.completed_at = Some(Utc::now());
        self.process = None;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopAllSummary {
    pub stopped: usize,
    pub jobs: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartDownloadRequest {
    pub url: Option<String>,
    pub format: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartDownloadResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub url: String,
    pub format: MediaFormat,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopJobResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopAllResponse {
    pub stopped: usize,
    pub jobs: Vec<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub prompt: Option<String>,
    pub messages: Option<Vec<ChatMessage>>,
    pub temperature: Option<f64>,
}

impl ChatRequest {
    /// Explicit `messages` win over `prompt`; empty when neither is usable.
    pub fn into_messages(self) -> Vec<ChatMessage> {
        if let Some(messages) = self.messages.filter(|m| !m.is_empty()) {
            return messages;
        }
        match self.prompt.as_deref().map(str::trim) {
            Some(prompt) if !prompt.is_empty() => vec![ChatMessage {
                role: ChatRole::User,
                content: prompt.to_string(),
            }],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub model: String,
    pub reply: String,
    pub raw: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddTorrentRequest {
    pub magnet_link: Option<String>,
    pub save_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddTorrentResponse {
    pub gid: String,
    pub message: String,
    pub magnet_link: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TorrentActionResponse {
    pub gid: String,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TorrentListQuery {
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForceQuery {
    pub force: Option<String>,
}

impl ForceQuery {
    pub fn is_forced(&self) -> bool {
        self.force.as_deref() == Some("true")
    }
}
