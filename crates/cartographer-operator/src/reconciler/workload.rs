//! Pod, Deployment, StatefulSet and Service builders shared by the
//! tracking and workflow subsystems, plus the deployment drift comparator.

use super::Scope;
use crate::error::StepError;
use crate::store::ObjectStore;
use cartographer_common::quantity::requirements_equal;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec,
    ResourceRequirements, SecretKeySelector, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, info};

type Labels = BTreeMap<String, String>;

pub fn container(name: &str, image: &str, resources: &ResourceRequirements) -> Container {
    Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        resources: Some(resources.clone()),
        ..Default::default()
    }
}

pub fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Connection settings read from a database credentials secret
pub fn database_env(secret: &str) -> Vec<EnvVar> {
    [
        ("DB_HOST", "host"),
        ("DB_PORT", "port"),
        ("DB_USER", "user"),
        ("DB_PASS", "password"),
        ("DB_NAME", "dbname"),
    ]
    .into_iter()
    .map(|(name, key)| secret_env(name, secret, key))
    .collect()
}

pub fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        ..Default::default()
    }
}

pub fn pod_template(labels: Labels, containers: Vec<Container>) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers,
            ..Default::default()
        }),
    }
}

pub fn deployment(metadata: ObjectMeta, labels: Labels, replicas: Option<i32>, container: Container) -> Deployment {
    Deployment {
        metadata,
        spec: Some(DeploymentSpec {
            replicas,
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: pod_template(labels, vec![container]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn stateful_set(metadata: ObjectMeta, labels: Labels, replicas: Option<i32>, container: Container) -> StatefulSet {
    StatefulSet {
        metadata,
        spec: Some(StatefulSetSpec {
            replicas,
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: pod_template(labels, vec![container]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn cluster_ip_service(metadata: ObjectMeta, selector: Labels, port_name: &str, port: i32) -> Service {
    Service {
        metadata,
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some(port_name.to_string()),
                protocol: Some("TCP".to_string()),
                port,
                target_port: Some(IntOrString::Int(port)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn first_container<'a>(template: &'a PodTemplateSpec, owner: &str) -> Result<&'a Container, StepError> {
    template
        .spec
        .as_ref()
        .and_then(|spec| spec.containers.first())
        .ok_or_else(|| StepError::invariant(format!("{owner} has no containers")))
}

pub fn first_container_mut<'a>(
    template: &'a mut PodTemplateSpec,
    owner: &str,
) -> Result<&'a mut Container, StepError> {
    template
        .spec
        .as_mut()
        .and_then(|spec| spec.containers.first_mut())
        .ok_or_else(|| StepError::invariant(format!("{owner} has no containers")))
}

/// Fields of a single-container deployment that track the workspace spec
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeploymentDrift {
    pub replicas: bool,
    pub image: bool,
    pub resources: bool,
}

impl DeploymentDrift {
    pub fn compare(existing: &Deployment, desired: &Deployment) -> Result<Self, StepError> {
        let name = existing.name_any();
        let (current, wanted) = match (&existing.spec, &desired.spec) {
            (Some(current), Some(wanted)) => (current, wanted),
            _ => return Err(StepError::invariant(format!("deployment {name} has no spec"))),
        };
        let current_container = first_container(&current.template, &name)?;
        let wanted_container = first_container(&wanted.template, &name)?;

        Ok(Self {
            replicas: current.replicas != wanted.replicas,
            image: current_container.image != wanted_container.image,
            resources: !requirements_equal(
                current_container.resources.as_ref(),
                wanted_container.resources.as_ref(),
            ),
        })
    }

    pub fn changed(&self) -> bool {
        self.replicas || self.image || self.resources
    }

    pub fn fields(&self) -> Vec<&'static str> {
        [
            (self.replicas, "replicas"),
            (self.image, "image"),
            (self.resources, "resources"),
        ]
        .into_iter()
        .filter_map(|(changed, field)| changed.then_some(field))
        .collect()
    }

    /// Copy only the drifted fields from `desired` onto `existing`.
    pub fn apply(&self, existing: &mut Deployment, desired: &Deployment) -> Result<(), StepError> {
        let name = existing.name_any();
        let (current, wanted) = match (existing.spec.as_mut(), desired.spec.as_ref()) {
            (Some(current), Some(wanted)) => (current, wanted),
            _ => return Err(StepError::invariant(format!("deployment {name} has no spec"))),
        };
        if self.replicas {
            current.replicas = wanted.replicas;
        }
        let wanted_container = first_container(&wanted.template, &name)?;
        let current_container = first_container_mut(&mut current.template, &name)?;
        if self.image {
            current_container.image = wanted_container.image.clone();
        }
        if self.resources {
            current_container.resources = wanted_container.resources.clone();
        }
        Ok(())
    }
}

/// Create the deployment when missing, otherwise write back only drifted fields.
pub async fn ensure_deployment<S: ObjectStore>(
    store: &S,
    scope: &Scope,
    desired: Deployment,
) -> Result<(), StepError> {
    let name = desired.name_any();

    let Some(mut existing) = store.get::<Deployment>(&scope.namespace, &name).await? else {
        store.create(&scope.namespace, &desired).await?;
        info!(deployment = %name, "created deployment");
        return Ok(());
    };

    let drift = DeploymentDrift::compare(&existing, &desired)?;
    if !drift.changed() {
        debug!(deployment = %name, "deployment up to date");
        return Ok(());
    }

    drift.apply(&mut existing, &desired)?;
    store.update(&scope.namespace, &existing).await?;
    info!(deployment = %name, changed = ?drift.fields(), "updated deployment");
    Ok(())
}

/// Create the service when missing; an existing service is left alone.
pub async fn ensure_service<S: ObjectStore>(
    store: &S,
    scope: &Scope,
    desired: Service,
) -> Result<(), StepError> {
    let name = desired.name_any();
    if store.get::<Service>(&scope.namespace, &name).await?.is_some() {
        return Ok(());
    }
    store.create(&scope.namespace, &desired).await?;
    info!(service = %name, "created service");
    Ok(())
}
