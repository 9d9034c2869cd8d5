// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Custom Resource Definition for the `VirtualMachineInstance` resource.
//!
//! Only the parts of the VMI that node-local migration handling reads or writes are
//! modelled here. The embedded [`MigrationState`] is the sole coordination channel
//! between the source node and the target node of a live migration: neither side
//! talks to the other directly, both read and write this record under optimistic
//! concurrency.
//!
//! # Field Ownership
//!
//! | Field                                      | Written by |
//! |--------------------------------------------|------------|
//! | `startTimestamp`, `failed`, `abortStatus`, `mode`, `failureReason` | source |
//! | `targetNodeAddress`, `targetDirectMigrationNodePorts`  | target |
//! | `targetNodeDomainDetected`, `targetNodeDomainReadyTimestamp` | target |
//! | `targetCPUSet`, `targetNodeTopology`       | target |
//! | `completed` (success), `endTimestamp` (success) | target |
//! | `completed` + `failed` (timeout / unknown host) | source |
//!
//! # Example
//!
//! ```yaml
//! status:
//!   nodeName: node-a
//!   migrationState:
//!     migrationUID: "123"
//!     sourceNode: node-a
//!     targetNode: node-b
//!     targetNodeAddress: 10.0.0.7
//!     targetDirectMigrationNodePorts:
//!       "0": 41337
//!       "49152": 41339
//! ```

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::labels::MIGRATION_TARGET_NODE_NAME_LABEL;

/// CPU topology of a virtual machine.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CpuTopology {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sockets: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,
}

impl CpuTopology {
    /// Number of vCPUs described by this topology (unset dimensions count as one).
    #[must_use]
    pub fn vcpus(&self) -> u64 {
        u64::from(self.sockets.unwrap_or(1))
            * u64::from(self.cores.unwrap_or(1))
            * u64::from(self.threads.unwrap_or(1))
    }
}

/// Requested CPU layout of the guest.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CpuSpec {
    #[serde(flatten)]
    pub topology: CpuTopology,

    /// Pin every vCPU to a dedicated host CPU.
    #[serde(default)]
    pub dedicated_cpu_placement: bool,
}

/// Guest memory settings.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemorySpec {
    /// Memory visible to the guest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest: Option<Quantity>,
}

/// Compute resources of the launcher pod.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, Quantity>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, Quantity>,
}

/// A guest network interface.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    pub name: String,

    /// Name of the network binding plugin serving this interface, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Devices {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DomainSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemorySpec>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub devices: Devices,
}

/// Reference to a persistent volume claim.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaimInfo {
    pub claim_name: String,
}

/// A volume attached to the guest.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<PersistentVolumeClaimInfo>,
    /// Image of a container disk backing this volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_disk_image: Option<String>,
}

/// `VirtualMachineInstance` is a running virtual machine managed by a node agent.
///
/// Spec fields are read-only to the migration controllers; they only mutate
/// `status` and a handful of labels.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachineInstance",
    shortname = "vmi",
    namespaced,
    doc = "VirtualMachineInstance is a running virtual machine. Node agents report its placement and migration progress through the status subresource."
)]
#[kube(status = "VirtualMachineInstanceStatus")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Node","type":"string","jsonPath":".status.nodeName"}"#)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceSpec {
    #[serde(default)]
    pub domain: DomainSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}

/// Lifecycle phase of a VMI.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Default, PartialEq, Eq, JsonSchema)]
pub enum VmiPhase {
    #[default]
    Pending,
    Scheduling,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    #[serde(other)]
    Unknown,
}

/// Transport the hypervisor should use for the next migration.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub enum MigrationTransport {
    /// Traffic goes through node-local proxy sockets.
    Unix,
    /// Legacy direct TCP transport.
    Tcp,
}

/// How the storage of a VMI is moved during migration.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub enum MigrationMethod {
    BlockMigration,
    LiveMigration,
}

/// A VMI condition, following Kubernetes conventions.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition, e.g. `HotVCPUChange`.
    pub r#type: String,

    /// Status of the condition: True, False, or Unknown.
    pub status: String,

    /// Brief CamelCase reason for the condition's last transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message indicating details about the transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time the condition transitioned from one status to another.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Memory as seen by the running guest.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_at_boot: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_current: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_requested: Option<Quantity>,
}

/// A volume whose backing claim is replaced as part of the migration.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MigratedVolume {
    pub volume_name: String,
    #[serde(
        default,
        rename = "sourcePVCInfo",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_pvc_info: Option<PersistentVolumeClaimInfo>,
    #[serde(
        default,
        rename = "destinationPVCInfo",
        skip_serializing_if = "Option::is_none"
    )]
    pub destination_pvc_info: Option<PersistentVolumeClaimInfo>,
}

/// Observed state of a volume.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStatus {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_info: Option<PersistentVolumeClaimInfo>,
}

/// Outcome of an abort request, as reported by the hypervisor.
///
/// Any value not listed here deserializes to [`MigrationAbortStatus::Unrecognized`]
/// and is treated as "not yet acted upon".
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub enum MigrationAbortStatus {
    /// The abort is in progress.
    Aborting,
    Succeeded,
    Failed,
    #[serde(other)]
    Unrecognized,
}

/// Migration mode reported by the hypervisor.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub enum MigrationMode {
    PreCopy,
    PostCopy,
    Paused,
}

/// Cluster-wide (or per-migration) migration tuning.
///
/// Every field is optional; unset fields fall back to the defaults documented on
/// [`crate::driver::MigrationOptions::resolve`].
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MigrationConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_per_migration: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_timeout: Option<i64>,
    #[serde(
        default,
        rename = "completionTimeoutPerGiB",
        skip_serializing_if = "Option::is_none"
    )]
    pub completion_timeout_per_gib: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsafe_migration_override: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_auto_converge: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_post_copy: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_workload_disruption: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_migration_threads: Option<u32>,
}

/// Shared migration record embedded in the VMI status.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MigrationState {
    /// Identifier of this migration attempt.
    ///
    /// Hypervisor migration metadata carrying any other UID must be ignored.
    #[serde(default, rename = "migrationUID")]
    pub migration_uid: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_node: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_pod: Option<String>,

    /// Pod holding hotplugged volumes on the target, if any.
    #[serde(
        default,
        rename = "targetAttachmentPodUID",
        skip_serializing_if = "Option::is_none"
    )]
    pub target_attachment_pod_uid: Option<String>,

    /// Address the target's tunnel listeners are reachable at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_address: Option<String>,

    /// Listener port per logical channel (`"0"` is the hypervisor control channel).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub target_direct_migration_node_ports: BTreeMap<String, i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub completed: bool,

    #[serde(default)]
    pub failed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    #[serde(default)]
    pub abort_requested: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_status: Option<MigrationAbortStatus>,

    /// The target observed a domain for this VMI.
    #[serde(default)]
    pub target_node_domain_detected: bool,

    /// First time the target observed the migrated domain running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_domain_ready_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<MigrationMode>,

    /// Per-migration tuning, overriding the cluster-wide configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_configuration: Option<MigrationConfiguration>,

    /// Dedicated host CPUs of the target launcher.
    #[serde(
        default,
        rename = "targetCPUSet",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub target_cpu_set: Vec<u32>,

    /// JSON encoded NUMA topology of the target node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_topology: Option<String>,
}

impl MigrationState {
    /// The migration reached a verdict and its end was recorded.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.end_timestamp.is_some() && (self.completed || self.failed)
    }

    /// Started and not yet ended.
    #[must_use]
    pub fn is_migrating(&self) -> bool {
        self.start_timestamp.is_some() && self.end_timestamp.is_none()
    }

    /// Both timestamps are present but no verdict was written yet.
    #[must_use]
    pub fn needs_finalization(&self) -> bool {
        self.start_timestamp.is_some()
            && self.end_timestamp.is_some()
            && !self.completed
            && !self.failed
    }

    /// The target published an address and at least one listener port.
    #[must_use]
    pub fn has_target_ports(&self) -> bool {
        self.target_node_address
            .as_deref()
            .is_some_and(|address| !address.is_empty())
            && !self.target_direct_migration_node_ports.is_empty()
    }

    /// The target reported the migrated domain as both present and active.
    #[must_use]
    pub fn target_domain_ready(&self) -> bool {
        self.target_node_domain_detected && self.target_node_domain_ready_timestamp.is_some()
    }

    /// An abort was already issued and need not be repeated.
    #[must_use]
    pub fn abort_in_flight(&self) -> bool {
        matches!(
            self.abort_status,
            Some(MigrationAbortStatus::Aborting | MigrationAbortStatus::Succeeded)
        )
    }
}

/// `VirtualMachineInstance` status
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<VmiPhase>,

    /// Node currently owning the VMI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_state: Option<MigrationState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_method: Option<MigrationMethod>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_transport: Option<MigrationTransport>,

    /// Node the VMI is being evacuated from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evacuation_node_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launcher_container_image_version: Option<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(
        default,
        rename = "currentCPUTopology",
        skip_serializing_if = "Option::is_none"
    )]
    pub current_cpu_topology: Option<CpuTopology>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub migrated_volumes: Vec<MigratedVolume>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_status: Vec<VolumeStatus>,
}

impl VirtualMachineInstance {
    /// Work-queue key of this VMI: `namespace/name`.
    #[must_use]
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }

    /// Object UID, or an empty string for objects not yet persisted.
    #[must_use]
    pub fn uid_str(&self) -> &str {
        self.metadata.uid.as_deref().unwrap_or_default()
    }

    /// `Succeeded` and `Failed` VMIs never change again.
    #[must_use]
    pub fn is_final(&self) -> bool {
        matches!(
            self.status.as_ref().and_then(|s| s.phase),
            Some(VmiPhase::Succeeded | VmiPhase::Failed)
        )
    }

    #[must_use]
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    #[must_use]
    pub fn migration_state(&self) -> Option<&MigrationState> {
        self.status.as_ref()?.migration_state.as_ref()
    }

    /// Mutable access to the migration state, if one exists.
    pub fn migration_state_mut(&mut self) -> Option<&mut MigrationState> {
        self.status.as_mut()?.migration_state.as_mut()
    }

    /// Mutable status, created on first use.
    pub fn status_mut(&mut self) -> &mut VirtualMachineInstanceStatus {
        self.status.get_or_insert_with(Default::default)
    }

    #[must_use]
    pub fn node_name(&self) -> Option<&str> {
        self.status.as_ref()?.node_name.as_deref()
    }

    /// Node named by the migration-target label.
    #[must_use]
    pub fn migration_target_label(&self) -> Option<&str> {
        self.labels()
            .get(MIGRATION_TARGET_NODE_NAME_LABEL)
            .map(String::as_str)
            .filter(|node| !node.is_empty())
    }

    #[must_use]
    pub fn is_cpu_dedicated(&self) -> bool {
        self.spec
            .domain
            .cpu
            .as_ref()
            .is_some_and(|cpu| cpu.dedicated_cpu_placement)
    }

    /// Requested vCPU count.
    #[must_use]
    pub fn vcpus(&self) -> u64 {
        self.spec
            .domain
            .cpu
            .as_ref()
            .map_or(1, |cpu| cpu.topology.vcpus())
    }

    #[must_use]
    pub fn cpu_limit(&self) -> Option<&Quantity> {
        self.spec.domain.resources.limits.get("cpu")
    }

    #[must_use]
    pub fn is_block_migration(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.migration_method == Some(MigrationMethod::BlockMigration))
    }

    #[must_use]
    pub fn has_condition(&self, condition_type: &str) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.conditions.iter().any(|c| c.r#type == condition_type))
    }

    pub fn remove_condition(&mut self, condition_type: &str) {
        if let Some(status) = self.status.as_mut() {
            status.conditions.retain(|c| c.r#type != condition_type);
        }
    }

    /// Replace (or add) the condition with the same type.
    pub fn set_condition(&mut self, condition: Condition) {
        let status = self.status_mut();
        match status
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            Some(existing) => *existing = condition,
            None => status.conditions.push(condition),
        }
    }
}
