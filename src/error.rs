use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("Job not found")]
    NotFound,
    #[error("Job not found or cannot be stopped")]
    NotStoppable,
}

/// Outcome of a download that did not produce a file. Recorded on the job,
/// never returned to a caller.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("{0}")]
    ProcessFailure(String),
    #[error("Could not determine downloaded filename")]
    FilenameUndetermined,
    #[error("Download was cancelled")]
    CancellationInduced,
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("request to {service} failed: {source}")]
    Transport {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{service} error {status}: {detail}")]
    Status {
        service: &'static str,
        status: u16,
        detail: String,
    },
    #[error("aria2 RPC error: {message} (code: {code})")]
    Rpc { code: i64, message: String },
    #[error("{0}")]
    Invalid(String),
}
