use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::debug;

use weave_core::error::{Result, WeaveError};
use weave_workflow::{WorkflowExecution, WorkflowStatus};

/// In-memory execution records, keyed by execution id.
#[derive(Default)]
pub struct ExecutionStore {
    executions: RwLock<BTreeMap<String, WorkflowExecution>>,
}

impl ExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record.
    pub fn save(&self, execution: &WorkflowExecution) {
        debug!(execution_id = %execution.id, status = %execution.status, "Execution saved");
        self.executions
            .write()
            .insert(execution.id.clone(), execution.clone());
    }

    pub fn get(&self, id: &str) -> Result<WorkflowExecution> {
        self.executions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| WeaveError::ExecutionNotFound(id.to_string()))
    }

    /// All records, most recently started first.
    pub fn list(&self) -> Vec<WorkflowExecution> {
        let mut all: Vec<_> = self.executions.read().values().cloned().collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all
    }

    pub fn list_by_status(&self, status: WorkflowStatus) -> Vec<WorkflowExecution> {
        self.list()
            .into_iter()
            .filter(|e| e.status == status)
            .collect()
    }

    pub fn list_by_workflow(&self, workflow_id: &str) -> Vec<WorkflowExecution> {
        self.list()
            .into_iter()
            .filter(|e| e.workflow_id == workflow_id)
            .collect()
    }

    /// Remove finished records completed more than `older_than` ago.
    pub fn cleanup(&self, older_than: Duration) -> usize {
        let max_age =
            chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::weeks(52));
        let cutoff = Utc::now() - max_age;
        let mut executions = self.executions.write();
        let before = executions.len();
        executions.retain(|_, e| {
            !(e.is_terminal() && e.completed_at.is_some_and(|t| t < cutoff))
        });
        before - executions.len()
    }

    pub fn len(&self) -> usize {
        self.executions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weave_core::types::ValueMap;
    use weave_workflow::Workflow;

    fn running(name: &str) -> WorkflowExecution {
        let mut wf = Workflow::new(name);
        wf.id = format!("wf-{name}");
        let mut exec = WorkflowExecution::new(&wf, ValueMap::new());
        exec.start();
        exec
    }

    #[test]
    fn test_save_get_and_replace() {
        let store = ExecutionStore::new();
        let mut exec = running("etl");
        store.save(&exec);
        assert_eq!(store.get(&exec.id).unwrap().status, WorkflowStatus::Running);

        exec.mark_completed();
        store.save(&exec);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&exec.id).unwrap().status, WorkflowStatus::Completed);
        assert!(matches!(
            store.get("missing"),
            Err(WeaveError::ExecutionNotFound(_))
        ));
    }

    #[test]
    fn test_filters() {
        let store = ExecutionStore::new();
        let a = running("a");
        let mut b = running("b");
        b.mark_failed("boom");
        store.save(&a);
        store.save(&b);

        assert_eq!(store.list().len(), 2);
        assert_eq!(store.list_by_status(WorkflowStatus::Failed).len(), 1);
        assert_eq!(store.list_by_workflow(&a.workflow_id).len(), 1);
    }

    #[test]
    fn test_cleanup_keeps_live_runs() {
        let store = ExecutionStore::new();
        let live = running("live");
        let mut done = running("done");
        done.mark_completed();
        store.save(&live);
        store.save(&done);

        assert_eq!(store.cleanup(Duration::from_secs(60)), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.cleanup(Duration::ZERO), 1);
        assert!(store.get(&live.id).is_ok());
    }
}
