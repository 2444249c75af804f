use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use weave_core::error::{Result, WeaveError};
use weave_core::event::{EventBus, EventFilter, TaskEvent};
use weave_core::types::{TaskStatus, ValueMap};

/// Current state of a tracked task or step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub task_id: String,
    pub status: TaskStatus,
    pub stage: String,
    /// Fraction complete, in `[0, 1]`.
    pub progress: f64,
    #[serde(default)]
    pub input: ValueMap,
    #[serde(default)]
    pub output: ValueMap,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// One append-only history record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub state: TaskState,
    pub timestamp: DateTime<Utc>,
    pub changed_by: String,
    pub reason: String,
}

#[derive(Default)]
struct Records {
    states: BTreeMap<String, TaskState>,
    history: BTreeMap<String, Vec<HistoryEntry>>,
}

impl Records {
    fn push_history(&mut self, state: &TaskState, changed_by: &str, reason: &str) {
        self.history
            .entry(state.task_id.clone())
            .or_default()
            .push(HistoryEntry {
                state: state.clone(),
                timestamp: state.updated_at,
                changed_by: changed_by.to_string(),
                reason: reason.to_string(),
            });
    }
}

/// Tracks the state machine and history of every task and workflow step,
/// publishing a [`TaskEvent`] for each change.
///
/// The record lock is never held while publishing. A publish that times out
/// is logged and counted; the state change itself stands.
pub struct LifecycleTracker {
    records: RwLock<Records>,
    bus: Arc<EventBus>,
    publish_failures: AtomicU64,
}

impl LifecycleTracker {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            records: RwLock::new(Records::default()),
            bus,
            publish_failures: AtomicU64::new(0),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Number of events that could not be delivered to every subscriber.
    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }

    /// Start tracking a task in `pending` state.
    pub async fn create(&self, task_id: &str, input: ValueMap) -> Result<TaskState> {
        let state = {
            let mut records = self.records.write();
            if records.states.contains_key(task_id) {
                return Err(WeaveError::DuplicateTask(task_id.to_string()));
            }
            let state = TaskState {
                task_id: task_id.to_string(),
                status: TaskStatus::Pending,
                stage: "created".into(),
                progress: 0.0,
                input,
                output: ValueMap::new(),
                error: None,
                started_at: None,
                updated_at: Utc::now(),
                completed_at: None,
                metadata: BTreeMap::new(),
            };
            records.push_history(&state, "system", "task created");
            records.states.insert(task_id.to_string(), state.clone());
            state
        };
        debug!(task_id = %task_id, "Lifecycle record created");
        self.emit(TaskEvent::created(task_id)).await;
        Ok(state)
    }

    pub async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        reason: &str,
    ) -> Result<TaskState> {
        self.transition(task_id, status, "system", reason).await
    }

    /// Move a task to `status`, attributing the change to `changed_by`.
    ///
    /// A task in a terminal status cannot move again.
    pub async fn transition(
        &self,
        task_id: &str,
        status: TaskStatus,
        changed_by: &str,
        reason: &str,
    ) -> Result<TaskState> {
        let state = {
            let mut records = self.records.write();
            let state = records
                .states
                .get_mut(task_id)
                .ok_or_else(|| WeaveError::TaskNotFound(task_id.to_string()))?;
            if state.status.is_terminal() {
                return Err(WeaveError::invalid_state(
                    task_id,
                    state.status,
                    format!("move to {status}"),
                ));
            }

            let now = Utc::now();
            state.status = status;
            state.stage = status.as_str().to_string();
            state.updated_at = now;
            if status == TaskStatus::Running && state.started_at.is_none() {
                state.started_at = Some(now);
            }
            if status.is_terminal() {
                state.completed_at.get_or_insert(now);
                if state.started_at.is_some() {
                    state.progress = 1.0;
                }
            }
            let snapshot = state.clone();
            records.push_history(&snapshot, changed_by, reason);
            snapshot
        };

        debug!(task_id = %task_id, status = %status, reason, "Lifecycle transition");
        let mut event = TaskEvent::for_status(task_id, status)
            .with_data("reason", serde_json::json!(reason));
        if let Some(err) = &state.error {
            event = event.with_data("error", serde_json::json!(err));
        }
        self.emit(event).await;
        Ok(state)
    }

    /// Record progress within the current status.
    pub async fn update_progress(&self, task_id: &str, progress: f64, stage: &str) -> Result<()> {
        if !(0.0..=1.0).contains(&progress) {
            return Err(WeaveError::InvalidInput(format!(
                "progress {progress} is outside [0, 1]"
            )));
        }
        {
            let mut records = self.records.write();
            let state = records
                .states
                .get_mut(task_id)
                .ok_or_else(|| WeaveError::TaskNotFound(task_id.to_string()))?;
            if state.status.is_terminal() {
                return Err(WeaveError::invalid_state(
                    task_id,
                    state.status,
                    "update progress of",
                ));
            }
            state.progress = progress;
            state.stage = stage.to_string();
            state.updated_at = Utc::now();
            let snapshot = state.clone();
            records.push_history(&snapshot, "system", "progress update");
        }
        self.emit(TaskEvent::progress(task_id, progress, stage)).await;
        Ok(())
    }

    pub fn set_output(&self, task_id: &str, output: ValueMap) -> Result<()> {
        self.modify(task_id, |s| s.output = output)
    }

    pub fn set_error(&self, task_id: &str, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        self.modify(task_id, |s| s.error = Some(error))
    }

    pub fn set_metadata(&self, task_id: &str, key: &str, value: &str) -> Result<()> {
        self.modify(task_id, |s| {
            s.metadata.insert(key.to_string(), value.to_string());
        })
    }

    fn modify(&self, task_id: &str, f: impl FnOnce(&mut TaskState)) -> Result<()> {
        let mut records = self.records.write();
        let state = records
            .states
            .get_mut(task_id)
            .ok_or_else(|| WeaveError::TaskNotFound(task_id.to_string()))?;
        f(state);
        state.updated_at = Utc::now();
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Result<TaskState> {
        self.records
            .read()
            .states
            .get(task_id)
            .cloned()
            .ok_or_else(|| WeaveError::TaskNotFound(task_id.to_string()))
    }

    pub fn history(&self, task_id: &str) -> Result<Vec<HistoryEntry>> {
        self.records
            .read()
            .history
            .get(task_id)
            .cloned()
            .ok_or_else(|| WeaveError::TaskNotFound(task_id.to_string()))
    }

    pub fn list_by_status(&self, status: TaskStatus) -> Vec<TaskState> {
        self.records
            .read()
            .states
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect()
    }

    pub fn status_counts(&self) -> BTreeMap<TaskStatus, usize> {
        let mut counts = BTreeMap::new();
        for state in self.records.read().states.values() {
            *counts.entry(state.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.records.read().states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().states.is_empty()
    }

    /// Wait until `task_id` reaches a terminal status.
    pub async fn monitor(&self, task_id: &str, cancel: CancellationToken) -> Result<TaskState> {
        // Subscribe before reading so a transition in between is not missed.
        let mut sub = self.bus.subscribe(
            EventFilter::names(["task.completed", "task.failed", "task.cancelled"])
                .for_task(task_id),
        );

        let state = self.get(task_id)?;
        if state.status.is_terminal() {
            return Ok(state);
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(WeaveError::Cancelled),
                next = sub.recv() => match next {
                    Some(event) if event.is_terminal() => return self.get(task_id),
                    Some(_) => continue,
                    None => return Err(WeaveError::Cancelled),
                },
            }
        }
    }

    /// Drop terminal records that finished more than `older_than` ago.
    pub fn cleanup(&self, older_than: Duration) -> usize {
        let max_age =
            chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::weeks(52));
        let cutoff = Utc::now() - max_age;
        let mut records = self.records.write();
        let expired: Vec<String> = records
            .states
            .values()
            .filter(|s| s.status.is_terminal())
            .filter(|s| s.completed_at.is_some_and(|t| t < cutoff))
            .map(|s| s.task_id.clone())
            .collect();
        for id in &expired {
            records.states.remove(id);
            records.history.remove(id);
        }
        expired.len()
    }

    /// Periodically run [`cleanup`](Self::cleanup). Blocks until cancelled.
    pub async fn run_cleanup(&self, interval: Duration, retention: Duration, cancel: CancellationToken) {
        info!(interval_secs = interval.as_secs(), retention_secs = retention.as_secs(), "Lifecycle cleanup started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let removed = self.cleanup(retention);
                    if removed > 0 {
                        info!(removed, "Expired lifecycle records removed");
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Lifecycle cleanup shutting down");
                    break;
                }
            }
        }
    }

    async fn emit(&self, event: TaskEvent) {
        let name = event.name.clone();
        let task_id = event.task_id.clone();
        if let Err(e) = self.bus.publish(event).await {
            self.publish_failures.fetch_add(1, Ordering::Relaxed);
            warn!(event = %name, task_id = %task_id, error = %e, "Lifecycle event not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> LifecycleTracker {
        LifecycleTracker::new(Arc::new(EventBus::new(64)))
    }

    #[tokio::test]
    async fn test_create_run_complete() {
        let t = tracker();
        let mut sub = t.bus().subscribe(EventFilter::all());

        t.create("t1", ValueMap::new()).await.unwrap();
        let running = t.update_status("t1", TaskStatus::Running, "go").await.unwrap();
        let started = running.started_at;
        assert!(started.is_some());

        let done = t.update_status("t1", TaskStatus::Completed, "done").await.unwrap();
        assert_eq!(done.started_at, started);
        assert!(done.completed_at.is_some());
        assert_eq!(done.progress, 1.0);

        let history = t.history("t1").unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].state.status, TaskStatus::Pending);
        assert_eq!(history[2].reason, "done");

        let names: Vec<String> = std::iter::from_fn(|| sub.try_recv()).map(|e| e.name).collect();
        assert_eq!(names, vec!["task.created", "task.running", "task.completed"]);
    }

    #[tokio::test]
    async fn test_terminal_is_final() {
        let t = tracker();
        t.create("t1", ValueMap::new()).await.unwrap();
        t.update_status("t1", TaskStatus::Failed, "boom").await.unwrap();
        let completed_at = t.get("t1").unwrap().completed_at;

        let err = t
            .update_status("t1", TaskStatus::Running, "retry")
            .await
            .unwrap_err();
        assert!(matches!(err, WeaveError::InvalidState { .. }));
        let state = t.get("t1").unwrap();
        assert_eq!(state.status, TaskStatus::Failed);
        assert_eq!(state.completed_at, completed_at);
        // Never started, so progress is left alone.
        assert_eq!(state.progress, 0.0);
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown() {
        let t = tracker();
        t.create("t1", ValueMap::new()).await.unwrap();
        assert!(matches!(
            t.create("t1", ValueMap::new()).await,
            Err(WeaveError::DuplicateTask(_))
        ));
        assert!(matches!(
            t.update_status("nope", TaskStatus::Running, "").await,
            Err(WeaveError::TaskNotFound(_))
        ));
        assert!(t.history("nope").is_err());
    }

    #[tokio::test]
    async fn test_progress_validation() {
        let t = tracker();
        t.create("t1", ValueMap::new()).await.unwrap();
        t.update_progress("t1", 0.5, "halfway").await.unwrap();
        let state = t.get("t1").unwrap();
        assert_eq!(state.progress, 0.5);
        assert_eq!(state.stage, "halfway");

        assert!(matches!(
            t.update_progress("t1", 1.5, "over").await,
            Err(WeaveError::InvalidInput(_))
        ));
        assert_eq!(t.history("t1").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_output_error_and_listing() {
        let t = tracker();
        t.create("a", ValueMap::new()).await.unwrap();
        t.create("b", ValueMap::new()).await.unwrap();
        t.set_output("a", ValueMap::from([("n".to_string(), serde_json::json!(1))]))
            .unwrap();
        t.set_error("b", "bad").unwrap();
        t.update_status("b", TaskStatus::Failed, "bad").await.unwrap();

        assert_eq!(t.get("a").unwrap().output["n"], 1);
        assert_eq!(t.get("b").unwrap().error.as_deref(), Some("bad"));
        assert_eq!(t.list_by_status(TaskStatus::Pending).len(), 1);
        let counts = t.status_counts();
        assert_eq!(counts[&TaskStatus::Pending], 1);
        assert_eq!(counts[&TaskStatus::Failed], 1);
    }

    #[tokio::test]
    async fn test_monitor_waits_for_terminal() {
        let t = Arc::new(tracker());
        t.create("t1", ValueMap::new()).await.unwrap();

        let watcher = {
            let t = t.clone();
            tokio::spawn(async move { t.monitor("t1", CancellationToken::new()).await })
        };
        while t.bus().subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }

        t.update_status("t1", TaskStatus::Running, "go").await.unwrap();
        t.update_status("t1", TaskStatus::Completed, "done").await.unwrap();

        let state = watcher.await.unwrap().unwrap();
        assert_eq!(state.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_monitor_returns_immediately_when_done() {
        let t = tracker();
        t.create("t1", ValueMap::new()).await.unwrap();
        t.update_status("t1", TaskStatus::Cancelled, "stop").await.unwrap();
        let state = t.monitor("t1", CancellationToken::new()).await.unwrap();
        assert_eq!(state.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_monitor_cancellation() {
        let t = tracker();
        t.create("t1", ValueMap::new()).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            t.monitor("t1", cancel).await,
            Err(WeaveError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_cleanup_removes_old_terminal_records() {
        let t = tracker();
        t.create("done", ValueMap::new()).await.unwrap();
        t.create("live", ValueMap::new()).await.unwrap();
        t.update_status("done", TaskStatus::Completed, "ok").await.unwrap();

        assert_eq!(t.cleanup(Duration::from_secs(3600)), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(t.cleanup(Duration::ZERO), 1);
        assert!(t.get("done").is_err());
        assert!(t.history("done").is_err());
        assert!(t.get("live").is_ok());
    }

    #[tokio::test]
    async fn test_publish_timeout_does_not_block_transition() {
        let bus = Arc::new(EventBus::new(1).with_publish_timeout(Duration::from_millis(10)));
        let t = LifecycleTracker::new(bus);
        let _stalled = t.bus().subscribe(EventFilter::all());

        t.create("t1", ValueMap::new()).await.unwrap();
        t.update_status("t1", TaskStatus::Running, "go").await.unwrap();
        assert_eq!(t.get("t1").unwrap().status, TaskStatus::Running);
        assert_eq!(t.publish_failures(), 1);
    }
}
