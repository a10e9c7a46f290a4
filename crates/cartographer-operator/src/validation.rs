//! Workspace validation
//!
//! Pure checks run by the validating admission webhook on create and update.

use crate::crd::WorkspaceSpec;
use std::collections::HashSet;
use std::fmt;

/// A single rejected field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    /// JSON path of the field, e.g. `spec.workflows.agentPools[1].name`
    pub path: String,
    /// The rejected value
    pub value: String,
    pub message: String,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: Invalid value: \"{}\": {}", self.path, self.value, self.message)
    }
}

/// Validate a proposed spec; `old` is the stored spec on update.
///
/// Agent pool names must be unique. Storage sizes are not checked here: the
/// storage cluster is only ever created, so later edits are never applied.
pub fn validate(new: &WorkspaceSpec, _old: Option<&WorkspaceSpec>) -> Vec<FieldViolation> {
    unique_agent_pool_names(new)
}

fn unique_agent_pool_names(spec: &WorkspaceSpec) -> Vec<FieldViolation> {
    let mut seen = HashSet::new();
    spec.workflows
        .agents
        .iter()
        .enumerate()
        .filter(|(_, pool)| !seen.insert(pool.name.as_str()))
        .map(|(index, pool)| FieldViolation {
            path: format!("spec.workflows.agentPools[{index}].name"),
            value: pool.name.clone(),
            message: "name must be unique".to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::WorkflowAgentPoolSpec;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn with_agents(names: &[&str]) -> WorkspaceSpec {
        let mut spec = WorkspaceSpec::default();
        spec.workflows.agents = names
            .iter()
            .map(|name| WorkflowAgentPoolSpec {
                name: name.to_string(),
                ..Default::default()
            })
            .collect();
        spec
    }

    #[test]
    fn test_unique_names_pass() {
        assert!(validate(&with_agents(&["a", "b", "c"]), None).is_empty());
        assert!(validate(&WorkspaceSpec::default(), None).is_empty());
    }

    #[test]
    fn test_duplicate_reported_at_second_occurrence() {
        let violations = validate(&with_agents(&["a", "a"]), None);
        assert_eq!(
            violations,
            vec![FieldViolation {
                path: "spec.workflows.agentPools[1].name".into(),
                value: "a".into(),
                message: "name must be unique".into(),
            }]
        );
    }

    #[test]
    fn test_each_repeat_is_reported() {
        let violations = validate(&with_agents(&["a", "b", "a", "b", "a"]), None);
        let paths: Vec<_> = violations.iter().map(|v| v.path.as_str()).collect();
        assert_eq!(
            paths,
            [
                "spec.workflows.agentPools[2].name",
                "spec.workflows.agentPools[3].name",
                "spec.workflows.agentPools[4].name",
            ]
        );
    }

    #[test]
    fn test_duplicates_checked_on_update() {
        let old = with_agents(&["a"]);
        assert_eq!(validate(&with_agents(&["a", "a"]), Some(&old)).len(), 1);
    }

    #[test]
    fn test_storage_change_is_not_a_violation() {
        let mut old = with_agents(&["a"]);
        old.storage.database_storage = Some(Quantity("10Gi".into()));
        let mut new = old.clone();
        new.storage.database_storage = Some(Quantity("20Gi".into()));
        new.storage.database_backup_storage = Some(Quantity("50Gi".into()));

        assert!(validate(&new, Some(&old)).is_empty());
    }

    #[test]
    fn test_unset_old_storage_may_be_filled() {
        let old = WorkspaceSpec::default();
        let mut new = WorkspaceSpec::default();
        new.storage.database_storage = Some(Quantity("10Gi".into()));
        assert!(validate(&new, Some(&old)).is_empty());
    }

    #[test]
    fn test_violation_display() {
        let v = FieldViolation {
            path: "spec.workflows.agentPools[1].name".into(),
            value: "a".into(),
            message: "name must be unique".into(),
        };
        assert_eq!(
            v.to_string(),
            "spec.workflows.agentPools[1].name: Invalid value: \"a\": name must be unique"
        );
    }
}
