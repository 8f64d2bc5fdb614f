use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::client::DrawApi;
use crate::config::TaskConfig;
use crate::error::TaskFailure;
use crate::events::{TaskEventSink, TaskFinishedEvent, TaskProgressEvent};
use crate::history::{HistoryLedger, HistoryUpdate};
use crate::storage;
use crate::types::{DrawRequest, JobStatus, PollData, TaskOutcome};

/// Owns the lifecycle of one draw job: submit once, poll until terminal,
/// download the first result.
///
/// Cancellation is cooperative. [`stop()`](Self::stop) clears a shared
/// running flag that is checked at the top of every poll iteration, between
/// each slice of the poll wait, and right before every notification. A
/// stopped unit emits nothing further, though an HTTP call already in flight
/// is allowed to finish.
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use draw_tasks::{ChannelSink, DrawClient, DrawRequest, SqliteLedger, TaskConfig, TaskUnit};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let api = Arc::new(DrawClient::new("https://api.example.com", "sk-..."));
/// let ledger = Arc::new(SqliteLedger::open(None)?);
/// let (sink, mut events) = ChannelSink::new();
///
/// let unit = TaskUnit::new(
///     api,
///     ledger,
///     Arc::new(sink),
///     TaskConfig::default(),
///     DrawRequest::new("a red fox", "nano-banana-fast"),
/// );
/// let handle = unit.spawn();
/// while let Some(event) = events.recv().await {
///     println!("{:?}", event);
/// }
/// # Ok(())
/// # }
/// ```
pub struct TaskUnit<A: DrawApi> {
    id: Uuid,
    api: Arc<A>,
    ledger: Arc<dyn HistoryLedger>,
    sink: Arc<dyn TaskEventSink>,
    config: TaskConfig,
    request: DrawRequest,
    job_id: Option<String>,
    job: JobSlot,
    running: Arc<AtomicBool>,
}

impl<A: DrawApi> std::fmt::Debug for TaskUnit<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskUnit")
            .field("id", &self.id)
            .field("model", &self.request.model)
            .field("job_id", &self.job_id)
            .field("running", &self.is_running())
            .finish()
    }
}

impl<A: DrawApi> TaskUnit<A> {
    pub fn new(
        api: Arc<A>,
        ledger: Arc<dyn HistoryLedger>,
        sink: Arc<dyn TaskEventSink>,
        config: TaskConfig,
        request: DrawRequest,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            api,
            ledger,
            sink,
            config,
            request,
            job_id: None,
            job: JobSlot::default(),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Resume an already-submitted job: skip submission and poll `job_id`.
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        let job_id = job_id.into();
        self.job.set(Some(job_id.clone()));
        self.job_id = Some(job_id);
        self
    }

    /// Share a running flag with other units (the retry wrapper uses one
    /// flag across attempts).
    pub fn with_running_flag(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = running;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    pub fn request(&self) -> &DrawRequest {
        &self.request
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Run to completion and emit the finished notification.
    ///
    /// Returns `None` if the unit was stopped; nothing is emitted then.
    pub async fn run(mut self) -> Option<TaskOutcome> {
        let outcome = self.execute().await?;
        if self.finish(&outcome) {
            Some(outcome)
        } else {
            None
        }
    }

    /// Run to completion without emitting the finished notification.
    /// Progress is still emitted. Returns `None` if stopped.
    pub async fn execute(&mut self) -> Option<TaskOutcome> {
        if !self.is_running() {
            return None;
        }

        let job_id = match self.job_id.clone() {
            Some(id) => id,
            None => match self.submit().await? {
                Ok(id) => id,
                Err(failure) => return Some(Err(failure)),
            },
        };

        self.poll_until_done(&job_id).await
    }

    /// Spawn [`run()`](Self::run) onto the tokio runtime.
    pub fn spawn(self) -> UnitHandle
    where
        A: 'static,
    {
        spawn_run(self, |_| {})
    }

    /// A fresh attempt at the same request: same unit id, running flag and
    /// collaborators, no job id.
    pub fn next_attempt(&self) -> Self {
        self.job.set(None);
        Self {
            id: self.id,
            api: Arc::clone(&self.api),
            ledger: Arc::clone(&self.ledger),
            sink: Arc::clone(&self.sink),
            config: self.config.clone(),
            request: self.request.clone(),
            job_id: None,
            job: self.job.clone(),
            running: Arc::clone(&self.running),
        }
    }

    pub fn sink(&self) -> Arc<dyn TaskEventSink> {
        Arc::clone(&self.sink)
    }

    /// Emit the finished notification for `outcome` unless stopped.
    pub fn finish(&self, outcome: &TaskOutcome) -> bool {
        if !self.is_running() {
            return false;
        }
        self.sink.on_finished(TaskFinishedEvent::from_outcome(
            &self.id.to_string(),
            self.job_id.as_deref(),
            outcome,
        ));
        true
    }

    async fn submit(&mut self) -> Option<Result<String, TaskFailure>> {
        tracing::info!(unit = %self.id, model = %self.request.model, "submitting draw job");

        let envelope = match self.api.try_submit(&self.request).await {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(unit = %self.id, error = %e, "submission request failed");
                return self.guard(Err(TaskFailure::SubmissionException(e.to_string())));
            }
        };

        if !envelope.is_ok() {
            let msg = envelope.message_or("Submission failed");
            tracing::warn!(unit = %self.id, code = envelope.code, msg = %msg, "submission rejected");
            return self.guard(Err(TaskFailure::SubmissionFailed(msg)));
        }

        let Some(job_id) = envelope.job_id().map(str::to_string) else {
            return self.guard(Err(TaskFailure::SubmissionException(
                "Submission response is missing data.id".to_string(),
            )));
        };

        tracing::info!(unit = %self.id, job = %job_id, "draw job submitted");
        if let Err(e) = self.ledger.add_task(&job_id, &self.request) {
            tracing::warn!(job = %job_id, error = %e, "failed to record job in history");
        }
        self.job.set(Some(job_id.clone()));
        self.job_id = Some(job_id.clone());
        self.guard(Ok(job_id))
    }

    async fn poll_until_done(&self, job_id: &str) -> Option<TaskOutcome> {
        let mut consecutive_errors: u32 = 0;

        loop {
            if !self.is_running() {
                return None;
            }

            let envelope = match self.api.try_poll(job_id).await {
                Ok(envelope) => {
                    consecutive_errors = 0;
                    envelope
                }
                Err(e) => {
                    consecutive_errors += 1;
                    tracing::warn!(
                        job = %job_id,
                        attempt = consecutive_errors,
                        error = %e,
                        "poll request failed"
                    );
                    if consecutive_errors >= self.config.max_consecutive_errors {
                        return self.guard(self.fail(job_id, TaskFailure::NetworkError(e.to_string())));
                    }
                    if !self.wait().await {
                        return None;
                    }
                    continue;
                }
            };

            if !self.is_running() {
                return None;
            }

            if envelope.is_not_ready() {
                tracing::debug!(job = %job_id, "job not ready yet");
                if !self.wait().await {
                    return None;
                }
                continue;
            }

            if !envelope.is_ok() {
                let msg = envelope.message_or("Unknown error");
                return self.guard(self.fail(job_id, TaskFailure::ApiError(msg)));
            }

            let data = match envelope.poll_data() {
                Ok(data) => data,
                Err(e) => {
                    let failure =
                        TaskFailure::ProcessingError(format!("Malformed poll payload: {}", e));
                    return self.guard(self.fail(job_id, failure));
                }
            };

            match data.status {
                Some(JobStatus::Succeeded) => return self.collect_result(job_id, &data).await,
                Some(JobStatus::Failed) => return self.guard(self.job_failed(job_id, &data)),
                _ => self.emit_progress(job_id, &data),
            }

            if !self.wait().await {
                return None;
            }
        }
    }

    async fn collect_result(&self, job_id: &str, data: &PollData) -> Option<TaskOutcome> {
        let Some(first) = data.results().first() else {
            return self.guard(self.fail(job_id, TaskFailure::NoResults));
        };
        let Some(url) = first.url.clone().filter(|u| !u.is_empty()) else {
            let failure = TaskFailure::DownloadFailed("Result has no image URL".to_string());
            return self.guard(self.fail(job_id, failure));
        };

        tracing::info!(job = %job_id, url = %url, "downloading result");
        let download = self.api.download(&url, self.config.download_timeout).await;
        if !self.is_running() {
            return None;
        }

        let bytes = match download {
            Ok(bytes) => bytes,
            Err(e) => return Some(self.fail(job_id, TaskFailure::DownloadFailed(e.to_string()))),
        };

        match storage::save_result_image(&self.config.output_dir, &url, &bytes) {
            Ok(path) => {
                tracing::info!(job = %job_id, path = %path.display(), "result saved");
                if let Err(e) = self
                    .ledger
                    .update_task(job_id, &HistoryUpdate::succeeded(path.clone(), url))
                {
                    tracing::warn!(job = %job_id, error = %e, "failed to record result in history");
                }
                Some(Ok(path))
            }
            Err(e) => Some(self.fail(job_id, TaskFailure::DownloadFailed(format!("{:#}", e)))),
        }
    }

    fn job_failed(&self, job_id: &str, data: &PollData) -> TaskOutcome {
        let reason = data
            .failure_reason
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "Unknown".to_string());
        let detail = data.error.clone().filter(|e| !e.is_empty());

        tracing::info!(job = %job_id, reason = %reason, "draw job failed");
        if let Err(e) = self
            .ledger
            .update_task(job_id, &HistoryUpdate::failed(reason.clone(), detail.clone()))
        {
            tracing::warn!(job = %job_id, error = %e, "failed to record failure in history");
        }
        Err(TaskFailure::JobFailed { reason, detail })
    }

    /// Record a post-submission failure in the ledger.
    fn fail(&self, job_id: &str, failure: TaskFailure) -> TaskOutcome {
        tracing::warn!(job = %job_id, reason = failure.short_reason(), error = %failure, "task unit failed");
        if let Err(e) = self
            .ledger
            .update_task(job_id, &HistoryUpdate::failed(failure.to_string(), None))
        {
            tracing::warn!(job = %job_id, error = %e, "failed to record failure in history");
        }
        Err(failure)
    }

    fn emit_progress(&self, job_id: &str, data: &PollData) {
        if !self.is_running() {
            return;
        }
        self.sink.on_progress(TaskProgressEvent {
            unit_id: self.id.to_string(),
            job_id: job_id.to_string(),
            progress: data.percent(),
            status: data.status_text().to_string(),
        });
    }

    /// Drop `value` if the unit has been stopped meanwhile.
    fn guard<T>(&self, value: T) -> Option<T> {
        if self.is_running() {
            Some(value)
        } else {
            None
        }
    }

    /// Sleep one poll interval in cancellation-check slices. Returns `false`
    /// as soon as the unit is stopped.
    async fn wait(&self) -> bool {
        let slice = self.config.wait_slice();
        for _ in 0..self.config.cancel_checks.max(1) {
            if !self.is_running() {
                return false;
            }
            tokio::time::sleep(slice).await;
        }
        self.is_running()
    }
}

/// Something that can be launched as one unit of work: a plain
/// [`TaskUnit`] or a [`RetryingUnit`](crate::retry::RetryingUnit).
pub trait TaskRun: Send + 'static {
    fn unit_id(&self) -> Uuid;

    fn running_flag(&self) -> Arc<AtomicBool>;

    fn event_sink(&self) -> Arc<dyn TaskEventSink>;

    /// Where the unit publishes the job id it is currently polling.
    fn job_slot(&self) -> JobSlot;

    /// Run to completion, emitting the finished notification.
    fn drive(self) -> impl Future<Output = Option<TaskOutcome>> + Send + 'static;
}

impl<A: DrawApi + 'static> TaskRun for TaskUnit<A> {
    fn unit_id(&self) -> Uuid {
        self.id
    }

    fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    fn event_sink(&self) -> Arc<dyn TaskEventSink> {
        Arc::clone(&self.sink)
    }

    fn job_slot(&self) -> JobSlot {
        self.job.clone()
    }

    fn drive(self) -> impl Future<Output = Option<TaskOutcome>> + Send + 'static {
        self.run()
    }
}

/// Spawn `task` onto the tokio runtime, calling `on_done` with its unit id
/// once it has finished or stopped.
///
/// A panic inside the unit is reported as a `ProcessingError` outcome.
pub fn spawn_run<R, F>(task: R, on_done: F) -> UnitHandle
where
    R: TaskRun,
    F: FnOnce(Uuid) + Send + 'static,
{
    let id = task.unit_id();
    let running = task.running_flag();
    let sink = task.event_sink();
    let job = task.job_slot();
    let flag = Arc::clone(&running);

    let join = tokio::spawn(async move {
        let outcome = match tokio::spawn(task.drive()).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() && flag.load(Ordering::Relaxed) => {
                tracing::error!(unit = %id, "task unit panicked");
                let outcome: TaskOutcome = Err(TaskFailure::ProcessingError(
                    "Task unit panicked while processing the job".to_string(),
                ));
                sink.on_finished(TaskFinishedEvent::from_outcome(
                    &id.to_string(),
                    None,
                    &outcome,
                ));
                Some(outcome)
            }
            Err(_) => None,
        };
        on_done(id);
        outcome
    });

    UnitHandle {
        id,
        running,
        job,
        join,
    }
}

/// The job id a unit is polling, shared between the unit and its handle.
/// Empty until submission succeeds, and cleared between retry attempts.
#[derive(Debug, Clone, Default)]
pub struct JobSlot(Arc<Mutex<Option<String>>>);

impl JobSlot {
    pub fn get(&self) -> Option<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set(&self, job_id: Option<String>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = job_id;
    }
}

/// Handle to a spawned [`TaskUnit`].
#[derive(Debug)]
pub struct UnitHandle {
    id: Uuid,
    running: Arc<AtomicBool>,
    job: JobSlot,
    join: JoinHandle<Option<TaskOutcome>>,
}

impl UnitHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Job id the unit is polling, once known.
    pub fn job_id(&self) -> Option<String> {
        self.job.get()
    }

    /// Ask the unit to stop. It emits nothing further.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        !self.running.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait up to `timeout` for the unit's task to end. Returns whether it did.
    pub async fn wait_for(&mut self, timeout: Duration) -> bool {
        if self.join.is_finished() {
            return true;
        }
        tokio::time::timeout(timeout, &mut self.join).await.is_ok()
    }

    /// Wait for the unit's outcome. `None` if it was stopped.
    pub async fn join(self) -> Option<TaskOutcome> {
        self.join.await.unwrap_or(None)
    }
}
