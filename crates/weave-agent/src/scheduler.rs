use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use weave_core::config::SchedulerConfig;
use weave_core::error::{Result, WeaveError};
use weave_core::traits::AgentDirectory;
use weave_core::types::{AgentInfo, AgentStatus, Priority, TaskStatus, ValueMap};

use crate::lifecycle::LifecycleTracker;

/// A unit of work waiting for, or bound to, an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub requirements: ValueMap,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub status: TaskStatus,
    /// Target agent. Set before submit to pin the task to one agent.
    #[serde(default)]
    pub assigned_to: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<ValueMap>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Task {
    pub fn new(kind: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            kind: kind.into(),
            goal: goal.into(),
            requirements: ValueMap::new(),
            required_capabilities: Vec::new(),
            priority: Priority::Normal,
            status: TaskStatus::Pending,
            assigned_to: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: 0,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_target(mut self, agent: impl Into<String>) -> Self {
        self.assigned_to = Some(agent.into());
        self
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_requirement(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.requirements.insert(key.into(), value);
        self
    }
}

/// Heap entry: higher priority first, then lower sequence (FIFO).
struct Queued {
    priority: Priority,
    seq: u64,
    task: Task,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Outcome of one scheduling pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub assigned: Vec<String>,
    pub requeued: Vec<String>,
    pub failed: Vec<String>,
}

impl PassReport {
    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty() && self.requeued.is_empty() && self.failed.is_empty()
    }
}

#[derive(Default)]
struct Inner {
    queue: BinaryHeap<Queued>,
    running: BTreeMap<String, Task>,
    finished: BTreeMap<String, Task>,
}

impl Inner {
    fn contains(&self, id: &str) -> bool {
        self.running.contains_key(id)
            || self.finished.contains_key(id)
            || self.queue.iter().any(|q| q.task.id == id)
    }
}

/// Lifecycle change to apply once the scheduler lock is released.
struct Transition {
    task_id: String,
    status: TaskStatus,
    reason: String,
    error: Option<String>,
}

/// Priority scheduler that binds queued tasks to agents.
///
/// Each pass drains the queue under one lock. A task that cannot be placed
/// is retried on the next pass until `max_retries` failures, after which it
/// ends `Failed` with the last assignment error.
pub struct TaskScheduler {
    inner: Mutex<Inner>,
    seq: AtomicU64,
    directory: Arc<dyn AgentDirectory>,
    lifecycle: Option<Arc<LifecycleTracker>>,
    config: SchedulerConfig,
}

impl TaskScheduler {
    pub fn new(directory: Arc<dyn AgentDirectory>, config: SchedulerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            seq: AtomicU64::new(0),
            directory,
            lifecycle: None,
            config,
        }
    }

    /// Mirror every task transition into `lifecycle`.
    pub fn with_lifecycle(mut self, lifecycle: Arc<LifecycleTracker>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Queue a task. Returns its id.
    pub async fn submit(&self, mut task: Task) -> Result<String> {
        if task.id.is_empty() {
            task.id = uuid::Uuid::new_v4().to_string();
        }
        if task.max_retries == 0 {
            task.max_retries = self.config.default_max_retries;
        }
        task.status = TaskStatus::Pending;
        task.created_at = Utc::now();
        task.retry_count = 0;

        let id = task.id.clone();
        let input = task.requirements.clone();
        {
            let mut inner = self.inner.lock();
            if inner.contains(&id) {
                return Err(WeaveError::DuplicateTask(id));
            }
            self.enqueue(&mut inner, task);
        }
        debug!(task_id = %id, "Task submitted");

        if let Some(lifecycle) = &self.lifecycle {
            if let Err(e) = lifecycle.create(&id, input).await {
                warn!(task_id = %id, error = %e, "Task not tracked");
            }
        }
        Ok(id)
    }

    fn enqueue(&self, inner: &mut Inner, task: Task) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        inner.queue.push(Queued {
            priority: task.priority,
            seq,
            task,
        });
    }

    /// Run one assignment pass over every queued task.
    pub async fn schedule_pass(&self) -> PassReport {
        let mut report = PassReport::default();
        let mut transitions = Vec::new();
        {
            let mut inner = self.inner.lock();
            let mut retry = Vec::new();

            while let Some(Queued { mut task, .. }) = inner.queue.pop() {
                match self.pick_agent(&task) {
                    Ok(agent) => {
                        if let Err(e) = self.directory.update_status(&agent.name, AgentStatus::Busy) {
                            warn!(agent = %agent.name, error = %e, "Could not mark agent busy");
                        }
                        info!(task_id = %task.id, agent = %agent.name, "Task assigned");
                        task.status = TaskStatus::Assigned;
                        task.assigned_to = Some(agent.name.clone());
                        transitions.push(Transition {
                            task_id: task.id.clone(),
                            status: TaskStatus::Assigned,
                            reason: format!("assigned to {}", agent.name),
                            error: None,
                        });
                        report.assigned.push(task.id.clone());
                        inner.running.insert(task.id.clone(), task);
                    }
                    Err(e) => {
                        task.retry_count += 1;
                        if task.retry_count < task.max_retries {
                            debug!(task_id = %task.id, attempt = task.retry_count, error = %e, "Assignment failed, will retry");
                            report.requeued.push(task.id.clone());
                            retry.push(task);
                        } else {
                            let message =
                                format!("failed to assign after {} retries: {e}", task.retry_count);
                            warn!(task_id = %task.id, error = %message, "Task failed");
                            task.status = TaskStatus::Failed;
                            task.error = Some(message.clone());
                            task.completed_at = Some(Utc::now());
                            transitions.push(Transition {
                                task_id: task.id.clone(),
                                status: TaskStatus::Failed,
                                reason: "assignment failed".into(),
                                error: Some(message),
                            });
                            report.failed.push(task.id.clone());
                            inner.finished.insert(task.id.clone(), task);
                        }
                    }
                }
            }

            // Re-queued only after the drain so a pass sees each task once.
            for task in retry {
                self.enqueue(&mut inner, task);
            }
        }

        self.apply(transitions).await;
        report
    }

    fn pick_agent(&self, task: &Task) -> Result<AgentInfo> {
        if let Some(name) = &task.assigned_to {
            let agent = self.directory.get(name)?;
            if agent.status != AgentStatus::Active {
                return Err(WeaveError::AgentUnavailable {
                    agent: agent.name,
                    status: agent.status.to_string(),
                });
            }
            return Ok(agent);
        }
        if !task.required_capabilities.is_empty() {
            return self.directory.find_best_agent(&task.required_capabilities);
        }
        self.directory.idle_agent()
    }

    /// Move an assigned task to running.
    pub async fn start_task(&self, id: &str) -> Result<Task> {
        let task = {
            let mut inner = self.inner.lock();
            let task = inner
                .running
                .get_mut(id)
                .ok_or_else(|| WeaveError::TaskNotFound(id.to_string()))?;
            if task.status != TaskStatus::Assigned {
                return Err(WeaveError::invalid_state(id, task.status, "start"));
            }
            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
            task.clone()
        };
        self.apply(vec![Transition {
            task_id: id.to_string(),
            status: TaskStatus::Running,
            reason: "started".into(),
            error: None,
        }])
        .await;
        Ok(task)
    }

    /// Record the outcome of an assigned or running task and free its agent.
    pub async fn complete_task(
        &self,
        id: &str,
        outcome: std::result::Result<ValueMap, String>,
    ) -> Result<Task> {
        let task = {
            let mut inner = self.inner.lock();
            let mut task = inner
                .running
                .remove(id)
                .ok_or_else(|| WeaveError::TaskNotFound(id.to_string()))?;
            match outcome {
                Ok(result) => {
                    task.status = TaskStatus::Completed;
                    task.result = Some(result);
                }
                Err(error) => {
                    task.status = TaskStatus::Failed;
                    task.error = Some(error);
                }
            }
            task.completed_at = Some(Utc::now());
            inner.finished.insert(id.to_string(), task.clone());
            task
        };

        self.release(&task);
        info!(task_id = %id, status = %task.status, "Task finished");
        self.apply(vec![Transition {
            task_id: id.to_string(),
            status: task.status,
            reason: "finished".into(),
            error: task.error.clone(),
        }])
        .await;
        Ok(task)
    }

    /// Cancel a running task.
    pub async fn cancel(&self, id: &str) -> Result<Task> {
        let task = {
            let mut inner = self.inner.lock();
            let status = match inner.running.get(id) {
                Some(task) => task.status,
                None if inner.contains(id) => {
                    let status = inner
                        .finished
                        .get(id)
                        .map(|t| t.status)
                        .unwrap_or(TaskStatus::Pending);
                    return Err(WeaveError::invalid_state(id, status, "cancel"));
                }
                None => return Err(WeaveError::TaskNotFound(id.to_string())),
            };
            if status != TaskStatus::Running {
                return Err(WeaveError::invalid_state(id, status, "cancel"));
            }
            let Some(mut task) = inner.running.remove(id) else {
                return Err(WeaveError::TaskNotFound(id.to_string()));
            };
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(Utc::now());
            inner.finished.insert(id.to_string(), task.clone());
            task
        };

        self.release(&task);
        info!(task_id = %id, "Task cancelled");
        self.apply(vec![Transition {
            task_id: id.to_string(),
            status: TaskStatus::Cancelled,
            reason: "cancelled".into(),
            error: None,
        }])
        .await;
        Ok(task)
    }

    fn release(&self, task: &Task) {
        let Some(agent) = &task.assigned_to else { return };
        if let Err(e) = self.directory.update_status(agent, AgentStatus::Active) {
            warn!(agent = %agent, task_id = %task.id, error = %e, "Could not release agent");
        }
    }

    async fn apply(&self, transitions: Vec<Transition>) {
        let Some(lifecycle) = &self.lifecycle else { return };
        for t in transitions {
            if let Some(error) = &t.error {
                if let Err(e) = lifecycle.set_error(&t.task_id, error.clone()) {
                    warn!(task_id = %t.task_id, error = %e, "Lifecycle error not recorded");
                }
            }
            if let Err(e) = lifecycle
                .transition(&t.task_id, t.status, "scheduler", &t.reason)
                .await
            {
                warn!(task_id = %t.task_id, error = %e, "Lifecycle update rejected");
            }
        }
    }

    pub fn get(&self, id: &str) -> Result<Task> {
        let inner = self.inner.lock();
        inner
            .running
            .get(id)
            .or_else(|| inner.finished.get(id))
            .or_else(|| inner.queue.iter().map(|q| &q.task).find(|t| t.id == id))
            .cloned()
            .ok_or_else(|| WeaveError::TaskNotFound(id.to_string()))
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn running_tasks(&self) -> Vec<Task> {
        self.inner.lock().running.values().cloned().collect()
    }

    /// Run assignment passes on the configured tick until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(tick_ms = self.config.tick_interval_ms, "Scheduler started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.schedule_pass().await;
                    if !report.is_empty() {
                        debug!(
                            assigned = report.assigned.len(),
                            requeued = report.requeued.len(),
                            failed = report.failed.len(),
                            "Scheduling pass"
                        );
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Scheduler shutting down");
                    break;
                }
            }
        }
    }
}
