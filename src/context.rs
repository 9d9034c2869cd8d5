// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Shared context for the source and target controllers.
//!
//! Both controllers receive an `Arc<Context>` that contains:
//! - Node identity and the address advertised to migration sources
//! - The cluster-wide migration configuration
//! - The node's [`TunnelManager`]
//! - Every external collaborator, grouped in [`Collaborators`]
//! - The failure retry engine consulted by the error policies

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{expand_launcher_run_dir, HandlerConfig};
use crate::crd::MigrationConfiguration;
use crate::domain::DomainCache;
use crate::driver::LauncherClients;
use crate::fail_retry::FailRetryManager;
use crate::node::{
    DeviceOwnership, IsolationDetector, MemoryOverheadCalculator, NetworkConfigurator,
    VolumeMounter,
};
use crate::store::{EventRecorder, VmiStore};
use crate::tunnel::TunnelManager;

/// Shared context passed to both controllers.
#[derive(Clone)]
pub struct Context {
    /// Name of the node this handler runs on
    pub host: String,

    /// Address published to migration sources for the target listeners
    pub migration_address: String,

    /// Migration tuning used when a migration carries none of its own
    pub cluster_migration_config: MigrationConfiguration,

    /// Launcher run directory pattern, see [`HandlerConfig::launcher_run_dir_pattern`]
    pub launcher_run_dir_pattern: String,

    pub tunnels: Arc<TunnelManager>,

    pub collaborators: Collaborators,

    /// Backoff for VMIs that keep failing
    pub fail_retry: Arc<FailRetryManager>,
}

/// External systems the controllers drive.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn VmiStore>,
    pub recorder: Arc<dyn EventRecorder>,
    pub launchers: Arc<dyn LauncherClients>,
    pub domains: Arc<dyn DomainCache>,
    pub isolation: Arc<dyn IsolationDetector>,
    pub volumes: Arc<dyn VolumeMounter>,
    pub network: Arc<dyn NetworkConfigurator>,
    pub devices: Arc<dyn DeviceOwnership>,
    pub memory_overhead: Arc<dyn MemoryOverheadCalculator>,
}

impl Context {
    /// Context for the node described by `config`.
    #[must_use]
    pub fn new(
        config: &HandlerConfig,
        tunnels: Arc<TunnelManager>,
        collaborators: Collaborators,
        fail_retry: Arc<FailRetryManager>,
    ) -> Self {
        Self {
            host: config.node_name.clone(),
            migration_address: config.migration_address().to_string(),
            cluster_migration_config: config.cluster_migration_configuration(),
            launcher_run_dir_pattern: config.launcher_run_dir_pattern.clone(),
            tunnels,
            collaborators,
            fail_retry,
        }
    }

    /// Run directory of the launcher with the given pid.
    #[must_use]
    pub fn launcher_run_dir(&self, pid: u32) -> PathBuf {
        expand_launcher_run_dir(&self.launcher_run_dir_pattern, pid)
    }
}
