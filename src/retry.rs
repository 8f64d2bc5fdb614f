use std::future::Future;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use uuid::Uuid;

use crate::client::DrawApi;
use crate::config::AppConfig;
use crate::events::{TaskEventSink, TaskRetryEvent};
use crate::types::TaskOutcome;
use crate::unit::{JobSlot, TaskRun, TaskUnit};

/// How often a failed unit is re-run with the same request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,
    /// Pause before each retry.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// `max_retries` from the config when `auto_retry_on_failure` is on,
    /// otherwise disabled.
    pub fn from_app_config(app: &AppConfig) -> Self {
        if app.auto_retry_on_failure {
            Self {
                max_retries: app.max_retries,
                ..Self::default()
            }
        } else {
            Self::disabled()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_retries > 0
    }
}

/// Wraps a [`TaskUnit`] and re-runs it from submission on failure.
///
/// Every attempt shares the unit id and running flag, so stopping the
/// wrapper stops whichever attempt is live. Intermediate failures are
/// reported as retry events; only the final outcome produces a finished
/// event.
pub struct RetryingUnit<A: DrawApi> {
    unit: TaskUnit<A>,
    policy: RetryPolicy,
}

impl<A: DrawApi> RetryingUnit<A> {
    pub fn new(unit: TaskUnit<A>, policy: RetryPolicy) -> Self {
        Self { unit, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn id(&self) -> Uuid {
        self.unit.id()
    }

    pub fn stop(&self) {
        self.unit.stop();
    }

    /// Run attempts until one succeeds or the budget is spent. `None` if
    /// stopped; nothing is emitted then.
    pub async fn run(self) -> Option<TaskOutcome> {
        let RetryingUnit { mut unit, policy } = self;
        let mut retries = 0;

        loop {
            let outcome = unit.execute().await?;

            let reason = match &outcome {
                Err(failure) if retries < policy.max_retries && unit.is_running() => {
                    failure.short_reason().to_string()
                }
                _ => {
                    return unit.finish(&outcome).then_some(outcome);
                }
            };

            retries += 1;
            tracing::info!(
                unit = %unit.id(),
                attempt = retries,
                max = policy.max_retries,
                reason = %reason,
                "retrying failed task"
            );
            unit.sink().on_retry(TaskRetryEvent {
                unit_id: unit.id().to_string(),
                attempt: retries,
                max_retries: policy.max_retries,
                reason,
            });

            if !sleep_unless_stopped(policy.delay, &unit.running_flag()).await {
                return None;
            }
            unit = unit.next_attempt();
        }
    }
}

/// Sleep `total` in short slices. Returns `false` once `running` clears.
async fn sleep_unless_stopped(total: Duration, running: &AtomicBool) -> bool {
    const SLICE: Duration = Duration::from_millis(250);

    let mut left = total;
    while !left.is_zero() {
        if !running.load(Ordering::Relaxed) {
            return false;
        }
        let step = left.min(SLICE);
        tokio::time::sleep(step).await;
        left -= step;
    }
    running.load(Ordering::Relaxed)
}

impl<A: DrawApi + 'static> TaskRun for RetryingUnit<A> {
    fn unit_id(&self) -> Uuid {
        self.unit.id()
    }

    fn running_flag(&self) -> Arc<AtomicBool> {
        self.unit.running_flag()
    }

    fn event_sink(&self) -> Arc<dyn TaskEventSink> {
        self.unit.sink()
    }

    fn job_slot(&self) -> JobSlot {
        self.unit.job_slot()
    }

    fn drive(self) -> impl Future<Output = Option<TaskOutcome>> + Send + 'static {
        self.run()
    }
}
