use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

use crate::unit::{spawn_run, TaskRun, UnitHandle};

/// Maps caller-owned handles (a UI row, a job slot, ...) to the unit
/// currently working on their behalf. At most one live unit per handle, and
/// at most one live unit polling any given job id.
///
/// Cloning is cheap; clones share the same map.
pub struct TaskRegistry<K> {
    units: Arc<Mutex<HashMap<K, UnitHandle>>>,
    stop_wait: Duration,
}

impl<K> Clone for TaskRegistry<K> {
    fn clone(&self) -> Self {
        Self {
            units: Arc::clone(&self.units),
            stop_wait: self.stop_wait,
        }
    }
}

impl<K> Default for TaskRegistry<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

impl<K> TaskRegistry<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    /// `stop_wait` bounds how long [`stop_all()`](Self::stop_all) waits for
    /// each unit.
    pub fn new(stop_wait: Duration) -> Self {
        Self {
            units: Arc::new(Mutex::new(HashMap::new())),
            stop_wait,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, UnitHandle>> {
        self.units.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Associate an already-spawned unit with `key`. A unit previously
    /// registered under `key` is stopped and returned so the caller can wait
    /// on it.
    pub fn register(&self, key: K, handle: UnitHandle) -> Option<UnitHandle> {
        let mut units = self.lock();
        if let Some(job_id) = handle.job_id() {
            evict_job(&mut units, &key, &job_id);
        }
        let old = units.insert(key.clone(), handle)?;
        tracing::info!(key = ?key, unit = %old.id(), "replacing running unit");
        old.stop();
        Some(old)
    }

    /// Stop whatever runs under `key`, then spawn `task` in its place.
    ///
    /// The entry removes itself once the unit ends, unless another unit has
    /// been registered under `key` by then.
    pub fn launch<R: TaskRun>(&self, key: K, task: R) -> Uuid {
        let mut units = self.lock();
        if let Some(old) = units.remove(&key) {
            tracing::info!(key = ?key, unit = %old.id(), "replacing running unit");
            old.stop();
        }
        if let Some(job_id) = task.job_slot().get() {
            evict_job(&mut units, &key, &job_id);
        }

        let shared = Arc::clone(&self.units);
        let done_key = key.clone();
        let handle = spawn_run(task, move |id| {
            let mut units = shared.lock().unwrap_or_else(PoisonError::into_inner);
            if units.get(&done_key).map(UnitHandle::id) == Some(id) {
                units.remove(&done_key);
            }
        });

        let id = handle.id();
        units.insert(key, handle);
        id
    }

    /// Forget `key` without stopping its unit. No-op when absent.
    pub fn unregister(&self, key: &K) -> Option<UnitHandle> {
        self.lock().remove(key)
    }

    /// Stop and forget the unit under `key`. Returns whether one existed.
    pub fn stop(&self, key: &K) -> bool {
        match self.lock().remove(key) {
            Some(handle) => {
                handle.stop();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    pub fn unit_id(&self, key: &K) -> Option<Uuid> {
        self.lock().get(key).map(UnitHandle::id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Stop every unit, waiting at most `stop_wait` for each, and leave the
    /// registry empty. Returns how many units were stopped.
    pub async fn stop_all(&self) -> usize {
        let drained: Vec<(K, UnitHandle)> = self.lock().drain().collect();
        let count = drained.len();
        if count == 0 {
            return 0;
        }

        tracing::info!(count, "stopping all task units");
        for (_, handle) in &drained {
            handle.stop();
        }
        for (key, mut handle) in drained {
            if !handle.wait_for(self.stop_wait).await {
                tracing::warn!(key = ?key, unit = %handle.id(), "unit did not stop in time");
            }
        }
        count
    }
}

/// Stop and drop every entry other than `key` that is polling `job_id`.
fn evict_job<K: Eq + Debug>(units: &mut HashMap<K, UnitHandle>, key: &K, job_id: &str) {
    units.retain(|other, handle| {
        if other == key || handle.job_id().as_deref() != Some(job_id) {
            return true;
        }
        tracing::info!(key = ?other, unit = %handle.id(), job = %job_id, "job taken over by another handle");
        handle.stop();
        false
    });
}
