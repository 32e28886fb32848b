use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::{sync::RwLock, time};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    downloader::DownloadInvoker,
    error::{DownloadError, JobError},
    models::{Job, JobRecord, JobStatus, MediaFormat, StopAllSummary},
    supervisor::{self, ProcessHandle, ProcessSignal, SpawnedProcess},
};

/// Terminal jobs older than this are dropped by the sweep.
pub const JOB_RETENTION_HOURS: i64 = 24;
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Time a downloader gets to exit after SIGTERM before it is killed.
pub const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);

const CANCELLED_BEFORE_START: &str = "Download was cancelled before it started";

/// Process-wide table of download jobs.
///
/// Every read-modify-write goes through the single write lock, so the
/// supervising task and a concurrent `stop` never interleave on a record.
#[derive(Clone)]
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<String, JobRecord>>>,
    invoker: Arc<dyn DownloadInvoker>,
}

impl JobRegistry {
    pub fn new(invoker: Arc<dyn DownloadInvoker>) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            invoker,
        }
    }

    /// Registers a queued job and spawns its supervising task.
    pub async fn create(&self, url: &str, format: &str) -> Result<String, JobError> {
        let job_id = self.enqueue(url, format).await?;
        tokio::spawn(supervisor::supervise(self.clone(), job_id.clone()));
        Ok(job_id)
    }

    async fn enqueue(&self, url: &str, format: &str) -> Result<String, JobError> {
        let url = validate_url(url)?;
        let format = MediaFormat::parse(format)
            .ok_or_else(|| JobError::InvalidInput("Format must be audio or video".to_string()))?;

        let job_id = Uuid::new_v4().to_string();
        let record = JobRecord::new(job_id.clone(), url.to_string(), format, Utc::now());

        self.jobs.write().await.insert(job_id.clone(), record);
        info!(job_id = %job_id, url = %url, ?format, "Download job queued");
        Ok(job_id)
    }

    pub async fn get(&self, job_id: &str) -> Option<Job> {
        self.jobs.read().await.get(job_id).map(JobRecord::to_job)
    }

    /// Snapshot of every job, newest first.
    pub async fn list_all(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .map(JobRecord::to_job)
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub async fn stop(&self, job_id: &str) -> bool {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(job_id) else {
            return false;
        };

        match job.status {
            JobStatus::Queued => {
                job.finish(JobStatus::Cancelled, Some(CANCELLED_BEFORE_START.to_string()));
                info!(job_id = %job_id, "Cancelled queued download");
                true
            }
            JobStatus::Downloading => {
                if let Some(handle) = job.process.take() {
                    if !handle.send(ProcessSignal::Terminate) {
                        info!(job_id = %job_id, "Downloader already exited before SIGTERM");
                    }
                    schedule_forced_kill(job_id.to_string(), handle);
                }
                job.finish(
                    JobStatus::Cancelled,
                    Some(DownloadError::CancellationInduced.to_string()),
                );
                info!(job_id = %job_id, "Cancelled running download");
                true
            }
            JobStatus::Completed | JobStatus::Error | JobStatus::Cancelled => false,
        }
    }

    pub async fn stop_all(&self) -> StopAllSummary {
        let candidates: Vec<String> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.status.is_active())
            .map(|job| job.job_id.clone())
            .collect();

        let mut stopped = Vec::new();
        for job_id in candidates {
            if self.stop(&job_id).await {
                stopped.push(job_id);
            }
        }

        info!(stopped = stopped.len(), "Stop-all finished");
        StopAllSummary {
            stopped: stopped.len(),
            jobs: stopped,
        }
    }

    /// Drops terminal jobs that finished more than a retention window ago.
    pub async fn cleanup(&self) -> usize {
        self.cleanup_before(Utc::now() - ChronoDuration::hours(JOB_RETENTION_HOURS))
            .await
    }

    async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|job_id, job| {
            let expired = job.status.is_terminal()
                && job.completed_at.is_some_and(|done| done < cutoff);
            if expired {
                info!(job_id = %job_id, status = ?job.status, "Removing expired job");
            }
            !expired
        });
        before - jobs.len()
    }

    /// Starts the downloader for a still-queued job and attaches its handle
    /// in the same critical section as the `downloading` transition.
    pub(crate) async fn begin_download(
        &self,
        job_id: &str,
    ) -> Option<(SpawnedProcess, MediaFormat)> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(job_id)?;

        if job.status != JobStatus::Queued {
            info!(job_id = %job_id, status = ?job.status, "Skipping download: job no longer queued");
            return None;
        }

        let command = self.invoker.command(&job.url, job.format);
        match supervisor::spawn_process(command) {
            Ok((process, handle)) => {
                info!(job_id = %job_id, pid = ?handle.pid(), "Download started");
                job.status = JobStatus::Downloading;
                job.process = Some(handle);
                Some((process, job.format))
            }
            Err(err) => {
                error!(job_id = %job_id, "Failed to start downloader: {err}");
                job.finish(
                    JobStatus::Error,
                    Some(format!("Failed to start downloader: {err}")),
                );
                None
            }
        }
    }

    /// Writes the supervising task's result, but only over `downloading`.
    /// A job cancelled while the process was still running keeps its
    /// cancellation.
    pub(crate) async fn record_outcome(
        &self,
        job_id: &str,
        outcome: Result<String, DownloadError>,
    ) {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(job_id) else {
            return;
        };

        if job.status != JobStatus::Downloading {
            info!(job_id = %job_id, status = ?job.status, "Job already terminal, keeping state");
            return;
        }

        match outcome {
            Ok(filename) => {
                info!(job_id = %job_id, filename = %filename, "Download completed");
                job.progress = Some(100.0);
                job.filename = Some(filename);
                job.finish(JobStatus::Completed, None);
            }
            Err(err @ DownloadError::CancellationInduced) => {
                info!(job_id = %job_id, "Downloader terminated by signal");
                job.finish(JobStatus::Cancelled, Some(err.to_string()));
            }
            Err(err) => {
                warn!(job_id = %job_id, "Download failed: {err}");
                job.finish(JobStatus::Error, Some(err.to_string()));
            }
        }
    }
}

fn validate_url(url: &str) -> Result<&str, JobError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(JobError::InvalidInput("URL is required".to_string()));
    }
    if !url.contains("youtube.com") && !url.contains("youtu.be") {
        return Err(JobError::InvalidInput("Invalid YouTube URL".to_string()));
    }
    Ok(url)
}

fn schedule_forced_kill(job_id: String, handle: ProcessHandle) {
    tokio::spawn(async move {
        time::sleep(KILL_GRACE_PERIOD).await;
        if handle.send(ProcessSignal::Kill) {
            warn!(job_id = %job_id, "Downloader still running after grace period, killing");
        }
    });
}

pub fn spawn_cleanup_worker(registry: JobRegistry) {
    tokio::spawn(async move {
        let mut interval = time::interval(CLEANUP_INTERVAL);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            let removed = registry.cleanup().await;
            if removed > 0 {
                info!(removed, "Cleanup worker removed expired jobs");
            }
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use chrono::{Duration as ChronoDuration, Utc};
    use tokio::process::Command;

    use super::JobRegistry;
    use crate::{
        downloader::DownloadInvoker,
        error::JobError,
        models::{JobRecord, JobStatus, MediaFormat},
        supervisor::supervise,
    };

    const URL: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

    struct ScriptInvoker {
        script: String,
        calls: AtomicUsize,
    }

    impl ScriptInvoker {
        fn new(script: &str) -> Arc<Self> {
            Arc::new(Self {
                script: script.to_string(),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl DownloadInvoker for ScriptInvoker {
        fn command(&self, _url: &str, _format: MediaFormat) -> Command {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut command = Command::new("sh");
            command.arg("-c").arg(&self.script);
            command
        }
    }

    const LONG_RUNNING: &str = "trap 'exit 3' TERM; echo started; while true; do sleep 0.1; done";

    async fn wait_for_status(registry: &JobRegistry, job_id: &str, status: JobStatus) {
        for _ in 0..500 {
            if registry.get(job_id).await.map(|j| j.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never reached {status:?}");
    }

    async fn insert_record(registry: &JobRegistry, record: JobRecord) {
        registry
            .jobs
            .write()
            .await
            .insert(record.job_id.clone(), record);
    }

    fn finished_record(job_id: &str, status: JobStatus, hours_ago: i64) -> JobRecord {
        let done = Utc::now() - ChronoDuration::hours(hours_ago);
        let mut record = JobRecord::new(
            job_id.to_string(),
            URL.to_string(),
            MediaFormat::Audio,
            done - ChronoDuration::minutes(5),
        );
        record.status = status;
        record.completed_at = Some(done);
        record
    }

    #[tokio::test]
    async fn invalid_input_creates_nothing() {
        let registry = JobRegistry::new(ScriptInvoker::new("true"));

        assert_eq!(
            registry.create("https://vimeo.com/123", "audio").await,
            Err(JobError::InvalidInput("Invalid YouTube URL".to_string()))
        );
        assert_eq!(
            registry.create("   ", "audio").await,
            Err(JobError::InvalidInput("URL is required".to_string()))
        );
        assert!(matches!(
            registry.create(URL, "flac").await,
            Err(JobError::InvalidInput(_))
        ));
        assert!(registry.list_all().await.is_empty());
    }

    #[tokio::test]
    async fn new_job_is_queued_without_process() {
        let registry = JobRegistry::new(ScriptInvoker::new("true"));
        let job_id = registry.enqueue("https://youtu.be/abc", "mp3").await.expect("enqueue");

        let job = registry.get(&job_id).await.expect("job");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.format, MediaFormat::Audio);
        assert!(job.completed_at.is_none());
        assert!(registry.jobs.read().await[&job_id].process.is_none());
    }

    #[tokio::test]
    async fn stopping_queued_job_never_starts_process() {
        let invoker = ScriptInvoker::new("echo should-not-run");
        let registry = JobRegistry::new(invoker.clone());
        let job_id = registry.enqueue(URL, "video").await.expect("enqueue");

        assert!(registry.stop(&job_id).await);
        supervise(registry.clone(), job_id.clone()).await;

        let job = registry.get(&job_id).await.expect("job");
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(
            job.error.as_deref(),
            Some("Download was cancelled before it started")
        );
        assert!(job.completed_at.is_some());
        assert_eq!(invoker.calls(), 0);

        assert!(!registry.stop(&job_id).await);
        assert!(!registry.stop("missing").await);
    }

    #[tokio::test]
    async fn successful_download_records_filename() {
        let invoker = ScriptInvoker::new(
            "echo '[download] Destination: /data/movies/song.webm'; \
             echo '[ExtractAudio] Destination: /data/movies/song.mp3'",
        );
        let registry = JobRegistry::new(invoker.clone());
        let job_id = registry.enqueue(URL, "audio").await.expect("enqueue");

        supervise(registry.clone(), job_id.clone()).await;

        let job = registry.get(&job_id).await.expect("job");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.filename.as_deref(), Some("song.mp3"));
        assert_eq!(job.progress, Some(100.0));
        assert!(job.error.is_none());
        assert!(job.completed_at.is_some());
        assert!(registry.jobs.read().await[&job_id].process.is_none());
        assert_eq!(invoker.calls(), 1);
    }

    #[tokio::test]
    async fn failing_process_records_error() {
        let registry = JobRegistry::new(ScriptInvoker::new("echo 'ERROR: unavailable' >&2; exit 1"));
        let job_id = registry.enqueue(URL, "video").await.expect("enqueue");

        supervise(registry.clone(), job_id.clone()).await;

        let job = registry.get(&job_id).await.expect("job");
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("ERROR: unavailable"));
        assert!(job.completed_at.is_some());
        assert!(job.filename.is_none());
    }

    #[tokio::test]
    async fn missing_filename_is_an_error() {
        let registry = JobRegistry::new(ScriptInvoker::new("echo done"));
        let job_id = registry.enqueue(URL, "video").await.expect("enqueue");

        supervise(registry.clone(), job_id.clone()).await;

        let job = registry.get(&job_id).await.expect("job");
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(
            job.error.as_deref(),
            Some("Could not determine downloaded filename")
        );
    }

    #[tokio::test]
    async fn cancelled_download_never_becomes_error() {
        let registry = JobRegistry::new(ScriptInvoker::new(LONG_RUNNING));
        let job_id = registry.enqueue(URL, "video").await.expect("enqueue");
        let task = tokio::spawn(supervise(registry.clone(), job_id.clone()));

        wait_for_status(&registry, &job_id, JobStatus::Downloading).await;
        assert!(registry.jobs.read().await[&job_id].process.is_some());

        assert!(registry.stop(&job_id).await);
        let job = registry.get(&job_id).await.expect("job");
        assert_eq!(job.status, JobStatus::Cancelled);
        let cancelled_at = job.completed_at;
        assert!(cancelled_at.is_some());

        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("supervisor should finish")
            .expect("join");

        let job = registry.get(&job_id).await.expect("job");
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.error.as_deref(), Some("Download was cancelled"));
        assert_eq!(job.completed_at, cancelled_at);
        assert!(!registry.stop(&job_id).await);
    }

    #[tokio::test]
    async fn forced_kill_follows_ignored_terminate() {
        let registry = JobRegistry::new(ScriptInvoker::new(
            "trap '' TERM; while true; do sleep 0.1; done",
        ));
        let job_id = registry.enqueue(URL, "video").await.expect("enqueue");
        let task = tokio::spawn(supervise(registry.clone(), job_id.clone()));

        wait_for_status(&registry, &job_id, JobStatus::Downloading).await;
        let started = tokio::time::Instant::now();
        assert!(registry.stop(&job_id).await);
        let cancelled_at = registry.get(&job_id).await.expect("job").completed_at;

        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("forced kill should end the process")
            .expect("join");
        assert!(started.elapsed() >= Duration::from_secs(4));

        let job = registry.get(&job_id).await.expect("job");
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.error.as_deref(), Some("Download was cancelled"));
        assert_eq!(job.completed_at, cancelled_at);
    }

    struct MissingBinaryInvoker;

    impl DownloadInvoker for MissingBinaryInvoker {
        fn command(&self, _url: &str, _format: MediaFormat) -> Command {
            Command::new("/nonexistent/yt-dlp")
        }
    }

    #[tokio::test]
    async fn spawn_failure_marks_job_error() {
        let registry = JobRegistry::new(Arc::new(MissingBinaryInvoker));
        let job_id = registry.enqueue(URL, "audio").await.expect("enqueue");

        supervise(registry.clone(), job_id.clone()).await;

        let job = registry.get(&job_id).await.expect("job");
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.completed_at.is_some());
        assert!(job
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("Failed to start downloader")));
        assert!(registry.jobs.read().await[&job_id].process.is_none());
    }

    #[tokio::test]
    async fn external_termination_marks_job_cancelled() {
        let registry = JobRegistry::new(ScriptInvoker::new("kill -TERM $$"));
        let job_id = registry.enqueue(URL, "audio").await.expect("enqueue");

        supervise(registry.clone(), job_id.clone()).await;

        let job = registry.get(&job_id).await.expect("job");
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.error.as_deref(), Some("Download was cancelled"));
    }

    #[tokio::test]
    async fn stop_all_stops_only_active_jobs() {
        let registry = JobRegistry::new(ScriptInvoker::new(LONG_RUNNING));
        let queued = registry.enqueue(URL, "audio").await.expect("queued");
        let running = registry.enqueue(URL, "video").await.expect("running");
        let task = tokio::spawn(supervise(registry.clone(), running.clone()));
        wait_for_status(&registry, &running, JobStatus::Downloading).await;
        insert_record(&registry, finished_record("done", JobStatus::Completed, 1)).await;

        let summary = registry.stop_all().await;
        assert_eq!(summary.stopped, 2);
        assert!(summary.jobs.contains(&queued));
        assert!(summary.jobs.contains(&running));
        assert_eq!(
            registry.get("done").await.map(|j| j.status),
            Some(JobStatus::Completed)
        );

        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("supervisor should finish")
            .expect("join");
        assert_eq!(registry.stop_all().await.stopped, 0);
    }

    #[tokio::test]
    async fn cleanup_removes_only_aged_terminal_jobs() {
        let registry = JobRegistry::new(ScriptInvoker::new("true"));
        insert_record(&registry, finished_record("old", JobStatus::Completed, 25)).await;
        insert_record(&registry, finished_record("old-cancelled", JobStatus::Cancelled, 30)).await;
        insert_record(&registry, finished_record("recent", JobStatus::Completed, 1)).await;
        let mut stale_queued = JobRecord::new(
            "stale-queued".to_string(),
            URL.to_string(),
            MediaFormat::Video,
            Utc::now() - ChronoDuration::hours(48),
        );
        stale_queued.status = JobStatus::Queued;
        insert_record(&registry, stale_queued).await;

        assert_eq!(registry.cleanup().await, 2);
        assert!(registry.get("old").await.is_none());
        assert!(registry.get("old-cancelled").await.is_none());
        assert!(registry.get("recent").await.is_some());
        assert!(registry.get("stale-queued").await.is_some());
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let registry = JobRegistry::new(ScriptInvoker::new("true"));
        let now = Utc::now();
        for (job_id, minutes_ago) in [("t2", 20), ("t3", 10), ("t1", 30)] {
            let record = JobRecord::new(
                job_id.to_string(),
                URL.to_string(),
                MediaFormat::Audio,
                now - ChronoDuration::minutes(minutes_ago),
            );
            insert_record(&registry, record).await;
        }

        let ids: Vec<String> = registry
            .list_all()
            .await
            .into_iter()
            .map(|j| j.job_id)
            .collect();
        assert_eq!(ids, ["t3", "t2", "t1"]);
    }
}
