//! Admission decisions for Workspace objects
//!
//! Mutation applies defaults and answers with a JSON patch so the defaults
//! are persisted. Validation rejects specs that break cross-field rules.

use crate::crd::Workspace;
use crate::defaults::Defaulter;
use crate::validation::{validate, FieldViolation};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, Operation};
use kube::ResourceExt;
use tracing::{debug, info, warn};

/// JSON patch turning the submitted workspace into its defaulted form
pub fn defaulting_patch(workspace: &Workspace, defaulter: &Defaulter) -> Result<json_patch::Patch, serde_json::Error> {
    let original = serde_json::to_value(workspace)?;
    let mut defaulted = workspace.clone();
    defaulted.spec = defaulter.apply(&workspace.spec);
    Ok(json_patch::diff(&original, &serde_json::to_value(&defaulted)?))
}

pub fn mutate(req: &AdmissionRequest<Workspace>, defaulter: &Defaulter) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);
    let Some(workspace) = req.object.as_ref() else {
        return response;
    };

    let patch = match defaulting_patch(workspace, defaulter) {
        Ok(patch) => patch,
        Err(e) => {
            warn!(workspace = %workspace.name_any(), error = %e, "failed to compute defaults");
            return response.deny(format!("failed to apply defaults: {e}"));
        }
    };
    if patch.0.is_empty() {
        return response;
    }

    debug!(workspace = %workspace.name_any(), operations = patch.0.len(), "defaulting workspace");
    match AdmissionResponse::from(req).with_patch(patch) {
        Ok(response) => response,
        Err(e) => AdmissionResponse::from(req).deny(format!("failed to encode patch: {e}")),
    }
}

pub fn validate_request(req: &AdmissionRequest<Workspace>) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);
    if !matches!(req.operation, Operation::Create | Operation::Update) {
        return response;
    }
    let Some(workspace) = req.object.as_ref() else {
        return response;
    };

    let old = match req.operation {
        Operation::Update => req.old_object.as_ref().map(|old| &old.spec),
        _ => None,
    };
    let violations = validate(&workspace.spec, old);
    if violations.is_empty() {
        return response;
    }

    let message = invalid_message(&workspace.name_any(), &violations);
    info!(workspace = %workspace.name_any(), violations = violations.len(), "rejected workspace");
    response.deny(message)
}

/// Kubernetes-style invalid object message
pub fn invalid_message(name: &str, violations: &[FieldViolation]) -> String {
    let details: Vec<String> = violations.iter().map(ToString::to_string).collect();
    format!(
        "Workspace.mlops.aigency.com \"{name}\" is invalid: {}",
        details.join(", ")
    )
}
