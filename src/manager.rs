use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use uuid::Uuid;

use crate::client::{DrawApi, DrawClient};
use crate::config::{AppConfig, TaskConfig};
use crate::error::HistoryError;
use crate::events::TaskEventSink;
use crate::history::{HistoryLedger, SqliteLedger};
use crate::registry::TaskRegistry;
use crate::retry::{RetryPolicy, RetryingUnit};
use crate::types::DrawRequest;
use crate::unit::TaskUnit;

/// High-level entry point: builds units from requests and keeps at most one
/// running per caller handle.
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use draw_tasks::{AppConfig, ChannelSink, DrawRequest, TaskManager};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let app = AppConfig::load_or_create(Path::new("config.json"));
/// let (sink, mut events) = ChannelSink::new();
/// let manager: TaskManager<usize, _> = TaskManager::from_app_config(&app, sink)?;
///
/// manager.start(0, DrawRequest::new("a lighthouse at dusk", &app.last_model));
/// while let Some(event) = events.recv().await {
///     println!("{:?}", event);
/// }
/// # Ok(())
/// # }
/// ```
pub struct TaskManager<K, A: DrawApi> {
    api: Arc<A>,
    ledger: Arc<dyn HistoryLedger>,
    sink: Arc<dyn TaskEventSink>,
    config: TaskConfig,
    retry: RetryPolicy,
    registry: TaskRegistry<K>,
}

impl<K> TaskManager<K, DrawClient>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    /// Wire up the HTTP gateway, the SQLite history and the retry policy from
    /// the persistent config.
    pub fn from_app_config(
        app: &AppConfig,
        sink: impl TaskEventSink + 'static,
    ) -> Result<Self, HistoryError> {
        let ledger = SqliteLedger::open(Some(app.history_db.as_path()))?;
        let manager = Self::new(
            Arc::new(DrawClient::from_config(app)),
            Arc::new(ledger),
            Arc::new(sink),
            TaskConfig::from_app_config(app),
        )
        .with_retry_policy(RetryPolicy::from_app_config(app));
        Ok(manager)
    }
}

impl<K, A> TaskManager<K, A>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
    A: DrawApi + 'static,
{
    pub fn new(
        api: Arc<A>,
        ledger: Arc<dyn HistoryLedger>,
        sink: Arc<dyn TaskEventSink>,
        config: TaskConfig,
    ) -> Self {
        let registry = TaskRegistry::new(config.stop_wait);
        Self {
            api,
            ledger,
            sink,
            config,
            retry: RetryPolicy::disabled(),
            registry,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn registry(&self) -> &TaskRegistry<K> {
        &self.registry
    }

    /// A unit for `request` sharing this manager's gateway, history and sink.
    pub fn create_unit(&self, request: DrawRequest) -> TaskUnit<A> {
        TaskUnit::new(
            Arc::clone(&self.api),
            Arc::clone(&self.ledger),
            Arc::clone(&self.sink),
            self.config.clone(),
            request,
        )
    }

    /// Start `request` under `key`, replacing whatever ran there. Calling it
    /// again with the same request is how a caller re-runs a failed task.
    pub fn start(&self, key: K, request: DrawRequest) -> Uuid {
        let unit = self.create_unit(request);
        self.launch(key, unit)
    }

    /// Resume polling an already-submitted job under `key`.
    pub fn resume(&self, key: K, request: DrawRequest, job_id: impl Into<String>) -> Uuid {
        let unit = self.create_unit(request).with_job_id(job_id);
        self.launch(key, unit)
    }

    fn launch(&self, key: K, unit: TaskUnit<A>) -> Uuid {
        tracing::debug!(key = ?key, unit = %unit.id(), model = %unit.request().model, "launching task unit");
        if self.retry.is_enabled() {
            self.registry.launch(key, RetryingUnit::new(unit, self.retry))
        } else {
            self.registry.launch(key, unit)
        }
    }

    /// Stop the unit under `key`, if any.
    pub fn stop(&self, key: &K) -> bool {
        self.registry.stop(key)
    }

    /// Stop every running unit with a bounded wait. Used at shutdown.
    pub async fn stop_all(&self) -> usize {
        self.registry.stop_all().await
    }

    pub fn is_active(&self, key: &K) -> bool {
        self.registry.contains(key)
    }

    pub fn active_count(&self) -> usize {
        self.registry.len()
    }
}
