// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Boundary to the hypervisor driver running inside each VM launcher.
//!
//! The controllers never talk to the hypervisor directly. They resolve a
//! [`LauncherClient`] for a VMI through [`LauncherClients`] and issue commands on
//! it; the local domain state comes back asynchronously through the
//! [`crate::domain::DomainCache`].

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::constants::{
    DEFAULT_BANDWIDTH_PER_MIGRATION, DEFAULT_COMPLETION_TIMEOUT_PER_GIB_SECS,
    DEFAULT_PROGRESS_TIMEOUT_SECS, PARALLEL_MIGRATION_THREADS,
};
use crate::crd::{MigrationConfiguration, VirtualMachineInstance};
use crate::migration_errors::{LauncherError, MigrationError};
use crate::units::quantity_is_zero;

/// Options passed to the hypervisor when a migration is started.
#[derive(Clone, Debug, PartialEq)]
pub struct MigrationOptions {
    /// Bandwidth cap, `0` means unlimited.
    pub bandwidth: Quantity,
    pub progress_timeout: i64,
    pub completion_timeout_per_gib: i64,
    pub unsafe_migration: bool,
    pub allow_auto_converge: bool,
    pub allow_post_copy: bool,
    pub allow_workload_disruption: bool,
    /// Extra transfer threads, `None` when multi-threaded transfer is off.
    pub parallel_migration_threads: Option<u32>,
}

impl MigrationOptions {
    /// Resolve the options for a VMI.
    ///
    /// The migration's own configuration wins over the cluster-wide one. Missing
    /// fields fall back to: bandwidth `0Mi`, progress timeout 150s, completion
    /// timeout 150s per GiB, every toggle off. A missing `allowWorkloadDisruption`
    /// follows `allowPostCopy`, which is how older controllers expressed it.
    ///
    /// Parallel transfer threads are only used when the VMI has no CPU limit and
    /// post-copy is not allowed.
    ///
    /// # Errors
    ///
    /// Returns an error if the CPU limit of the VMI cannot be parsed.
    pub fn resolve(
        vmi: &VirtualMachineInstance,
        cluster: &MigrationConfiguration,
    ) -> Result<Self, MigrationError> {
        let config = vmi
            .migration_state()
            .and_then(|state| state.migration_configuration.as_ref())
            .unwrap_or(cluster);

        let allow_post_copy = config.allow_post_copy.unwrap_or(false);
        let allow_workload_disruption = config.allow_workload_disruption.unwrap_or(allow_post_copy);

        let has_cpu_limit = match vmi.cpu_limit() {
            Some(limit) => !quantity_is_zero(limit)?,
            None => false,
        };
        let parallel_migration_threads = (!has_cpu_limit && !allow_post_copy).then(|| {
            config
                .parallel_migration_threads
                .unwrap_or(PARALLEL_MIGRATION_THREADS)
        });

        Ok(Self {
            bandwidth: config
                .bandwidth_per_migration
                .clone()
                .unwrap_or_else(|| Quantity(DEFAULT_BANDWIDTH_PER_MIGRATION.to_string())),
            progress_timeout: config
                .progress_timeout
                .unwrap_or(DEFAULT_PROGRESS_TIMEOUT_SECS),
            completion_timeout_per_gib: config
                .completion_timeout_per_gib
                .unwrap_or(DEFAULT_COMPLETION_TIMEOUT_PER_GIB_SECS),
            unsafe_migration: config.unsafe_migration_override.unwrap_or(false),
            allow_auto_converge: config.allow_auto_converge.unwrap_or(false),
            allow_post_copy,
            allow_workload_disruption,
            parallel_migration_threads,
        })
    }
}

/// Node-side facts the driver needs to rebuild a domain on the target.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VirtualMachineOptions {
    /// Memory the launcher reserves on top of the guest memory, in bytes.
    pub memory_overhead_bytes: u64,
    /// Network binding plugin per interface name.
    pub interface_bindings: BTreeMap<String, String>,
    /// Dedicated host CPUs of the target launcher.
    pub cpu_set: Vec<u32>,
}

/// Command channel into one VM launcher.
#[async_trait]
pub trait LauncherClient: Send + Sync {
    /// Start migrating the domain to the endpoints prepared by the source tunnel.
    async fn migrate(
        &self,
        vmi: &VirtualMachineInstance,
        options: &MigrationOptions,
    ) -> Result<(), LauncherError>;

    /// Abort the running migration.
    ///
    /// Returns [`LauncherError::NotMigrating`] when nothing is migrating.
    async fn cancel_migration(&self, vmi: &VirtualMachineInstance) -> Result<(), LauncherError>;

    /// Prepare the receiving launcher for an incoming domain.
    async fn sync_migration_target(
        &self,
        vmi: &VirtualMachineInstance,
        options: &VirtualMachineOptions,
    ) -> Result<(), LauncherError>;

    /// Rebind devices and metadata of the migrated domain.
    async fn finalize_migration(
        &self,
        vmi: &VirtualMachineInstance,
        options: &VirtualMachineOptions,
    ) -> Result<(), LauncherError>;

    /// Tell a half prepared target launcher to shut down.
    async fn signal_target_pod_cleanup(
        &self,
        vmi: &VirtualMachineInstance,
    ) -> Result<(), LauncherError>;

    /// Apply the vCPU topology of the VMI spec.
    async fn sync_cpus(&self, vmi: &VirtualMachineInstance) -> Result<(), LauncherError>;

    /// Apply the guest memory of the VMI spec.
    async fn sync_memory(
        &self,
        vmi: &VirtualMachineInstance,
        options: &VirtualMachineOptions,
    ) -> Result<(), LauncherError>;
}

/// Result of looking up the launcher of a VMI.
#[derive(Clone)]
pub enum LauncherStatus {
    /// The launcher has not opened its command socket yet.
    NotInitialized,
    /// The launcher stopped answering.
    Unresponsive,
    Ready(Arc<dyn LauncherClient>),
}

impl std::fmt::Debug for LauncherStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "NotInitialized"),
            Self::Unresponsive => write!(f, "Unresponsive"),
            Self::Ready(_) => write!(f, "Ready"),
        }
    }
}

/// Lookup of launcher command clients.
#[async_trait]
pub trait LauncherClients: Send + Sync {
    async fn client_for(&self, vmi: &VirtualMachineInstance) -> LauncherStatus;
}

/// [`LauncherClients`] for a handler without a hypervisor backend attached.
///
/// Every launcher reports as not initialised, so controllers keep requeueing
/// until an embedding agent provides real clients.
#[derive(Clone, Copy, Debug, Default)]
pub struct DetachedLaunchers;

#[async_trait]
impl LauncherClients for DetachedLaunchers {
    async fn client_for(&self, vmi: &VirtualMachineInstance) -> LauncherStatus {
        debug!(vmi = %vmi.key(), "No hypervisor backend attached");
        LauncherStatus::NotInitialized
    }
}
