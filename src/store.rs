// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Writes to the shared VMI record and Kubernetes events.
//!
//! Both controllers persist their changes by replacing the whole VMI under
//! optimistic concurrency: the write carries the `resourceVersion` that was read,
//! and a concurrent change by the other node surfaces as
//! [`StoreError::Conflict`]. Conflicts are never retried in place; the
//! reconciliation fails and the next one starts from the fresh object.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::PostParams;
use kube::{Api, Client, Resource, ResourceExt};
use tracing::{debug, warn};

use crate::constants::EVENT_REPORTING_CONTROLLER;
use crate::crd::VirtualMachineInstance;
use crate::migration_errors::StoreError;
use crate::write_retry::{classify, Disposition, WriteRetry};

/// Severity of a recorded event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
        }
    }
}

/// Write access to VMIs.
#[async_trait]
pub trait VmiStore: Send + Sync {
    /// Persist labels and status of `vmi`, returning the stored object.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the stored object changed since it was read.
    async fn update(
        &self,
        vmi: &VirtualMachineInstance,
    ) -> Result<VirtualMachineInstance, StoreError>;
}

/// Events attached to a VMI.
///
/// Recording is best effort and never fails a reconciliation.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(
        &self,
        vmi: &VirtualMachineInstance,
        event_type: EventType,
        reason: &str,
        message: &str,
    );
}

/// [`VmiStore`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeVmiStore {
    client: Client,
    retry: WriteRetry,
}

impl KubeVmiStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            retry: WriteRetry::default(),
        }
    }
}

fn map_kube_error(key: &str, err: kube::Error) -> StoreError {
    if classify(&err) == Disposition::Conflict {
        return StoreError::Conflict {
            key: key.to_string(),
        };
    }
    match err {
        kube::Error::Api(api_err) if api_err.code == 404 => StoreError::NotFound {
            key: key.to_string(),
        },
        other => StoreError::Api {
            key: key.to_string(),
            reason: other.to_string(),
        },
    }
}

#[async_trait]
impl VmiStore for KubeVmiStore {
    async fn update(
        &self,
        vmi: &VirtualMachineInstance,
    ) -> Result<VirtualMachineInstance, StoreError> {
        let key = vmi.key();
        let namespace = vmi.namespace().unwrap_or_default();
        let name = vmi.name_any();
        let api: Api<VirtualMachineInstance> = Api::namespaced(self.client.clone(), &namespace);
        let pp = PostParams::default();

        // Labels live on the main resource, migration state on the status subresource
        let stored = self
            .retry
            .run(&format!("replace vmi {key}"), || api.replace(&name, &pp, vmi))
            .await
        .map_err(|e| map_kube_error(&key, e))?;

        let mut with_status = vmi.clone();
        with_status.metadata.resource_version = stored.metadata.resource_version.clone();
        let _body = serde_json::to_vec(&with_status).map_err(|e| StoreError::Api {
            key: key.clone(),
            reason: format!("failed to serialize status: {e}"),
        })?;

        let updated = self
            .retry
            .run(&format!("replace vmi status {key}"), || {
                api.replace_status(&name, &pp, &with_status)
            })
            .await
        .map_err(|e| map_kube_error(&key, e))?;

        debug!(vmi = %key, resource_version = ?updated.metadata.resource_version, "VMI updated");
        Ok(updated)
    }
}

/// [`EventRecorder`] writing core/v1 events.
#[derive(Clone)]
pub struct KubeEventRecorder {
    client: Client,
    host: String,
}

impl KubeEventRecorder {
    #[must_use]
    pub fn new(client: Client, host: impl Into<String>) -> Self {
        Self {
            client,
            host: host.into(),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(
        &self,
        vmi: &VirtualMachineInstance,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) {
        let namespace = vmi.namespace().unwrap_or_default();
        let name = vmi.name_any();
        let event_api: Api<Event> = Api::namespaced(self.client.clone(), &namespace);

        let now = Time(k8s_openapi::jiff::Timestamp::now());
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{name}-")),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: Some(VirtualMachineInstance::api_version(&()).to_string()),
                kind: Some(VirtualMachineInstance::kind(&()).to_string()),
                name: Some(name.clone()),
                namespace: Some(namespace),
                uid: vmi.meta().uid.clone(),
                resource_version: vmi.meta().resource_version.clone(),
                ..Default::default()
            },
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            type_: Some(event_type.as_str().to_string()),
            reporting_component: Some(EVENT_REPORTING_CONTROLLER.to_string()),
            reporting_instance: Some(self.host.clone()),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            count: Some(1),
            ..Default::default()
        };

        if let Err(e) = event_api.create(&PostParams::default(), &event).await {
            warn!(vmi = %vmi.key(), reason, error = %e, "Failed to record event");
        }
    }
}
