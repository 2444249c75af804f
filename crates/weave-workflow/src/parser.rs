//! Loading, normalizing and writing workflow definitions.
//!
//! JSON is the primary format; TOML is accepted for hand-written files.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::Utc;
use tracing::debug;

use weave_core::error::{Result, WeaveError};

use crate::dag::Dag;
use crate::definition::{Step, StepKind, Workflow};

/// Parse a JSON definition and normalize it.
pub fn from_json(text: &str) -> Result<Workflow> {
    let workflow: Workflow =
        serde_json::from_str(text).map_err(|e| WeaveError::Parse(e.to_string()))?;
    normalize(workflow)
}

/// Parse a TOML definition and normalize it.
pub fn from_toml(text: &str) -> Result<Workflow> {
    let workflow: Workflow = toml::from_str(text).map_err(|e| WeaveError::Parse(e.to_string()))?;
    normalize(workflow)
}

/// Load a definition, choosing the format from the file extension.
pub fn from_file(path: &Path) -> Result<Workflow> {
    let text = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => from_toml(&text),
        Some("json") | None => from_json(&text),
        Some(other) => Err(WeaveError::Parse(format!(
            "unsupported workflow file extension: .{other}"
        ))),
    }
}

pub fn to_json(workflow: &Workflow) -> Result<String> {
    Ok(serde_json::to_string_pretty(workflow)?)
}

pub fn to_toml(workflow: &Workflow) -> Result<String> {
    toml::to_string_pretty(workflow).map_err(|e| WeaveError::Parse(e.to_string()))
}

/// Fill defaults and check the structure that serde cannot express.
///
/// Assigns an id when missing, defaults step names to their ids and stamps
/// `created_at`/`updated_at`. Dependency wiring is checked by [`validate`].
pub fn normalize(mut workflow: Workflow) -> Result<Workflow> {
    if workflow.name.trim().is_empty() {
        return Err(WeaveError::InvalidDefinition(
            "workflow name must not be empty".into(),
        ));
    }
    if workflow.id.is_empty() {
        workflow.id = uuid::Uuid::new_v4().to_string();
    }
    if workflow.version.is_empty() {
        workflow.version = "1.0".into();
    }
    let now = Utc::now();
    workflow.created_at.get_or_insert(now);
    workflow.updated_at = Some(now);

    let mut names = BTreeSet::new();
    for var in &workflow.variables {
        if !names.insert(var.name.as_str()) {
            return Err(WeaveError::InvalidDefinition(format!(
                "variable {} declared twice",
                var.name
            )));
        }
    }

    normalize_scope(&mut workflow.steps, None)?;
    debug!(workflow = %workflow.name, steps = workflow.steps.len(), "Workflow normalized");
    Ok(workflow)
}

fn normalize_scope(steps: &mut [Step], parent: Option<&str>) -> Result<()> {
    let mut seen = BTreeSet::new();
    for step in steps.iter_mut() {
        if step.id.trim().is_empty() {
            return Err(WeaveError::InvalidDefinition(match parent {
                Some(p) => format!("a child of step {p} has an empty id"),
                None => "step id must not be empty".into(),
            }));
        }
        if step.id.contains('/') {
            return Err(WeaveError::InvalidDefinition(format!(
                "step id {} must not contain '/'",
                step.id
            )));
        }
        if !seen.insert(step.id.clone()) {
            return Err(WeaveError::DuplicateStep(step.id.clone()));
        }
        if step.name.is_empty() {
            step.name = step.id.clone();
        }
        if step.kind == StepKind::Condition && step.conditions.is_empty() {
            return Err(WeaveError::InvalidDefinition(format!(
                "condition step {} declares no conditions",
                step.id
            )));
        }
        if !step.kind.is_container() && !step.steps.is_empty() {
            return Err(WeaveError::InvalidDefinition(format!(
                "{} step {} cannot contain child steps",
                step.kind, step.id
            )));
        }
        if let Some(retry) = &step.retry {
            if !(retry.backoff.is_finite() && retry.backoff > 0.0) {
                return Err(WeaveError::InvalidDefinition(format!(
                    "step {} has a non-positive retry backoff",
                    step.id
                )));
            }
        }
        let id = step.id.clone();
        normalize_scope(&mut step.steps, Some(&id))?;
    }

    for step in steps.iter() {
        for target in step.branch_targets() {
            if !seen.contains(target) {
                return Err(WeaveError::InvalidDefinition(format!(
                    "condition step {} branches to unknown step {target}",
                    step.id
                )));
            }
        }
    }
    Ok(())
}

/// Check that every scope of the workflow forms a valid dependency graph.
pub fn validate(workflow: &Workflow) -> Result<()> {
    validate_scope(&workflow.steps)
}

fn validate_scope(steps: &[Step]) -> Result<()> {
    Dag::build(steps)?;
    for step in steps {
        if !step.steps.is_empty() {
            validate_scope(&step.steps)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::Operator;
    use std::time::Duration;

    const PIPELINE: &str = r#"{
        "name": "report",
        "description": "fetch, analyse, publish",
        "agents": [{"name": "analyst", "type": "worker", "capabilities": ["stats"]}],
        "variables": [{"name": "source", "required": true}],
        "config": {"parallel_execution": true, "timeout": "5m"},
        "steps": [
            {"id": "fetch", "tool": "http", "outputs": {"body": "raw"}},
            {"id": "analyse", "agent": "analyst", "depends_on": ["fetch"],
             "retry": {"max_retries": 2, "delay": "1s"}, "timeout": "30s"},
            {"id": "route", "type": "condition", "depends_on": ["analyse"],
             "conditions": [{"variable": "score", "operator": "gt", "value": 0.5,
                             "then": "publish", "else": "archive"}]},
            {"id": "publish", "depends_on": ["route"]},
            {"id": "archive", "depends_on": ["route"]}
        ]
    }"#;

    #[test]
    fn test_parse_pipeline() {
        let wf = from_json(PIPELINE).unwrap();
        assert_eq!(wf.version, "1.0");
        assert!(!wf.id.is_empty());
        assert_eq!(wf.steps.len(), 5);
        assert_eq!(wf.config.timeout, Some(Duration::from_secs(300)));
        assert!(wf.config.parallel_execution);
        assert!(wf.config.max_retries.is_none());

        let analyse = wf.step("analyse").unwrap();
        assert_eq!(analyse.name, "analyse");
        assert_eq!(analyse.timeout, Some(Duration::from_secs(30)));
        assert_eq!(analyse.retry.as_ref().unwrap().backoff, 2.0);

        let route = wf.step("route").unwrap();
        assert_eq!(route.kind, StepKind::Condition);
        assert_eq!(route.conditions[0].operator, Operator::Gt);
        validate(&wf).unwrap();
    }

    #[test]
    fn test_round_trip_preserves_wiring() {
        let wf = from_json(PIPELINE).unwrap();
        let again = from_json(&to_json(&wf).unwrap()).unwrap();
        assert_eq!(again.id, wf.id);
        for (a, b) in wf.steps.iter().zip(&again.steps) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.depends_on, b.depends_on);
            assert_eq!(a.agent, b.agent);
            assert_eq!(a.tool, b.tool);
            assert_eq!(a.timeout, b.timeout);
        }
    }

    #[test]
    fn test_toml_definition() {
        let text = r#"
name = "nightly"

[config]
continue_on_error = true
max_retries = 1

[[steps]]
id = "a"
tool = "csv"

[[steps]]
id = "b"
depends_on = ["a"]
timeout = "1m30s"
"#;
        let wf = from_toml(text).unwrap();
        assert!(wf.config.continue_on_error);
        assert_eq!(wf.config.max_retries, Some(1));
        assert_eq!(wf.steps[1].timeout, Some(Duration::from_secs(90)));

        let back = from_toml(&to_toml(&wf).unwrap()).unwrap();
        assert_eq!(back.steps[1].depends_on, vec!["a".to_string()]);
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let err = from_json(r#"{"name": "x", "steps": [{"id": "a"}, {"id": "a"}]}"#).unwrap_err();
        assert!(matches!(err, WeaveError::DuplicateStep(id) if id == "a"));
    }

    #[test]
    fn test_unknown_branch_rejected() {
        let err = from_json(
            r#"{"name": "x", "steps": [{"id": "c", "type": "condition",
                "conditions": [{"variable": "v", "operator": "eq", "value": 1, "then": "nope"}]}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, WeaveError::InvalidDefinition(_)));
    }

    #[test]
    fn test_children_on_task_rejected() {
        let err = from_json(
            r#"{"name": "x", "steps": [{"id": "a", "steps": [{"id": "b"}]}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("cannot contain child steps"));
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let err = from_json("{not json").unwrap_err();
        assert!(matches!(err, WeaveError::Parse(_)));
    }

    #[test]
    fn test_oversized_timeout_is_parse_error() {
        let err = from_json(r#"{"name": "x", "config": {"timeout": 1e30}}"#).unwrap_err();
        assert!(matches!(err, WeaveError::Parse(_)));
        let err = from_json(r#"{"name": "x", "steps": [{"id": "a", "timeout": "99999999999h"}]}"#)
            .unwrap_err();
        assert!(matches!(err, WeaveError::Parse(_)));
    }

    #[test]
    fn test_validate_rejects_unknown_dependency() {
        let wf = from_json(r#"{"name": "x", "steps": [{"id": "a", "depends_on": ["ghost"]}]}"#)
            .unwrap();
        let err = validate(&wf).unwrap_err();
        assert!(matches!(err, WeaveError::UnknownDependency { .. }));
    }

    #[test]
    fn test_validate_checks_child_scopes() {
        let wf = from_json(
            r#"{"name": "x", "steps": [{"id": "group", "type": "parallel",
                "steps": [{"id": "a", "depends_on": ["b"]}, {"id": "b", "depends_on": ["a"]}]}]}"#,
        )
        .unwrap();
        let err = validate(&wf).unwrap_err();
        assert!(matches!(err, WeaveError::Cycle { .. }));
    }
}
