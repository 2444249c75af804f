use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::EventsConfig;
use crate::error::{Result, WeaveError};
use crate::types::{TaskStatus, ValueMap};

pub const TASK_CREATED: &str = "task.created";
pub const TASK_PROGRESS: &str = "task.progress";

/// A lifecycle notification, named `task.created`, `task.progress` or
/// `task.<status>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub name: String,
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: ValueMap,
}

impl TaskEvent {
    pub fn new(name: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            task_id: task_id.into(),
            timestamp: Utc::now(),
            data: ValueMap::new(),
        }
    }

    pub fn created(task_id: impl Into<String>) -> Self {
        Self::new(TASK_CREATED, task_id)
    }

    pub fn for_status(task_id: impl Into<String>, status: TaskStatus) -> Self {
        Self::new(format!("task.{status}"), task_id)
    }

    pub fn progress(task_id: impl Into<String>, progress: f64, stage: &str) -> Self {
        Self::new(TASK_PROGRESS, task_id)
            .with_data("progress", serde_json::json!(progress))
            .with_data("stage", serde_json::json!(stage))
    }

    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Status carried in the event name, for `task.<status>` events.
    pub fn status(&self) -> Option<TaskStatus> {
        let suffix = self.name.strip_prefix("task.")?;
        serde_json::from_value(serde_json::Value::String(suffix.to_string())).ok()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_some_and(TaskStatus::is_terminal)
    }
}

/// Selects which events a subscription receives.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    names: Option<BTreeSet<String>>,
    task_id: Option<String>,
}

impl EventFilter {
    /// Match every event.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match only the given event names.
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: Some(names.into_iter().map(Into::into).collect()),
            task_id: None,
        }
    }

    /// Restrict to events about one task.
    pub fn for_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn matches(&self, event: &TaskEvent) -> bool {
        if let Some(names) = &self.names {
            if !names.contains(&event.name) {
                return false;
            }
        }
        match &self.task_id {
            Some(id) => id == &event.task_id,
            None => true,
        }
    }
}

struct Slot {
    id: u64,
    filter: EventFilter,
    tx: mpsc::Sender<TaskEvent>,
}

type Slots = RwLock<Vec<Slot>>;

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    handler_failures: AtomicU64,
}

/// Snapshot of bus activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub handler_failures: u64,
    pub subscribers: usize,
}

/// Event bus with a bounded queue per subscriber.
///
/// `publish` waits at most `publish_timeout` for room in each matching
/// subscriber's queue. A full queue drops the event for that subscriber and
/// the publish reports [`WeaveError::PublishTimeout`].
pub struct EventBus {
    slots: Arc<Slots>,
    next_id: AtomicU64,
    capacity: usize,
    publish_timeout: Duration,
    counters: Arc<Counters>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            publish_timeout: Duration::from_secs(5),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn from_config(config: &EventsConfig) -> Self {
        Self::new(config.capacity).with_publish_timeout(config.publish_timeout())
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Open a subscription. Dropping the returned handle unsubscribes.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        self.slots.write().push(Slot { id, filter, tx });
        debug!(subscription = id, "Subscriber added");
        Subscription {
            id,
            rx,
            slots: Arc::downgrade(&self.slots),
        }
    }

    /// Run `handler` on a dedicated task for every matching event, in order.
    ///
    /// Handler errors are logged and counted; they never reach the publisher.
    /// Must be called inside a tokio runtime.
    pub fn subscribe_with<F, Fut>(&self, filter: EventFilter, mut handler: F) -> HandlerSubscription
    where
        F: FnMut(TaskEvent) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut sub = self.subscribe(filter);
        let id = sub.id();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let counters = self.counters.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = sub.recv() => {
                        let Some(event) = next else { break };
                        let name = event.name.clone();
                        if let Err(e) = handler(event).await {
                            counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                            warn!(subscription = id, event = %name, error = %e, "Event handler failed");
                        }
                    }
                }
            }
        });

        HandlerSubscription {
            id,
            cancel,
            task: Some(task),
        }
    }

    /// Deliver an event to every matching subscriber.
    ///
    /// Returns the number of subscribers that accepted it.
    pub async fn publish(&self, event: TaskEvent) -> Result<usize> {
        let targets: Vec<mpsc::Sender<TaskEvent>> = self
            .slots
            .read()
            .iter()
            .filter(|s| s.filter.matches(&event))
            .map(|s| s.tx.clone())
            .collect();

        self.counters.published.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0usize;
        let mut timed_out = false;
        for tx in targets {
            match tokio::time::timeout(self.publish_timeout, tx.send(event.clone())).await {
                Ok(Ok(())) => delivered += 1,
                // Receiver dropped between snapshot and send.
                Ok(Err(_)) => {}
                Err(_) => {
                    timed_out = true;
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(event = %event.name, task_id = %event.task_id, "Subscriber queue full, event dropped");
                }
            }
        }

        self.counters
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);

        if timed_out {
            return Err(WeaveError::PublishTimeout {
                event: event.name,
                timeout_ms: self.publish_timeout.as_millis() as u64,
            });
        }
        Ok(delivered)
    }

    pub fn subscriber_count(&self) -> usize {
        self.slots.read().len()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            handler_failures: self.counters.handler_failures.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Receiving end of a subscription. Unsubscribes on drop.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<TaskEvent>,
    slots: Weak<Slots>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<TaskEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TaskEvent> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(slots) = self.slots.upgrade() {
            slots.write().retain(|s| s.id != self.id);
            debug!(subscription = self.id, "Subscriber removed");
        }
    }
}

/// Handle for a handler registered with [`EventBus::subscribe_with`].
#[must_use = "dropping the handle stops the handler"]
pub struct HandlerSubscription {
    id: u64,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HandlerSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop the handler. Events already queued are discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop the handler and wait for its task to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for HandlerSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe(EventFilter::all());

        let n = bus.publish(TaskEvent::created("t1")).await.unwrap();
        assert_eq!(n, 1);

        let ev = sub.recv().await.unwrap();
        assert_eq!(ev.name, "task.created");
        assert_eq!(ev.task_id, "t1");
    }

    #[tokio::test]
    async fn test_filter_by_name_and_task() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe(EventFilter::names(["task.completed"]).for_task("t2"));

        bus.publish(TaskEvent::created("t2")).await.unwrap();
        bus.publish(TaskEvent::for_status("t1", TaskStatus::Completed))
            .await
            .unwrap();
        bus.publish(TaskEvent::for_status("t2", TaskStatus::Completed))
            .await
            .unwrap();

        let ev = sub.try_recv().unwrap();
        assert_eq!(ev.task_id, "t2");
        assert_eq!(ev.status(), Some(TaskStatus::Completed));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let bus = EventBus::new(8);
        let sub = bus.subscribe(EventFilter::all());
        let other = bus.subscribe(EventFilter::all());
        assert_eq!(bus.subscriber_count(), 2);

        drop(sub);
        assert_eq!(bus.subscriber_count(), 1);
        other.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);

        assert_eq!(bus.publish(TaskEvent::created("t")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_times_out() {
        let bus = EventBus::new(1).with_publish_timeout(Duration::from_millis(20));
        let _sub = bus.subscribe(EventFilter::all());

        bus.publish(TaskEvent::created("a")).await.unwrap();
        let err = bus.publish(TaskEvent::created("b")).await.unwrap_err();
        assert!(matches!(err, WeaveError::PublishTimeout { timeout_ms: 20, .. }));

        let stats = bus.stats();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn test_handler_runs_in_order_and_counts_failures() {
        let bus = EventBus::new(8);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));

        let seen2 = seen.clone();
        let calls2 = calls.clone();
        let handle = bus.subscribe_with(EventFilter::all(), move |ev: TaskEvent| {
            let seen = seen2.clone();
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                seen.lock().push(ev.task_id.clone());
                if ev.task_id == "bad" {
                    return Err(WeaveError::InvalidInput("bad event".into()));
                }
                Ok(())
            }
        });

        for id in ["a", "bad", "c"] {
            bus.publish(TaskEvent::created(id)).await.unwrap();
        }

        for _ in 0..100 {
            if calls.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(*seen.lock(), vec!["a", "bad", "c"]);
        assert_eq!(bus.stats().handler_failures, 1);

        handle.shutdown().await;
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_status_parsing() {
        let ev = TaskEvent::for_status("x", TaskStatus::Failed);
        assert_eq!(ev.name, "task.failed");
        assert!(ev.is_terminal());

        let ev = TaskEvent::progress("x", 0.5, "halfway");
        assert_eq!(ev.status(), None);
        assert!(!ev.is_terminal());
        assert_eq!(ev.data["stage"], "halfway");
    }
}
