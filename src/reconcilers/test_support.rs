// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! In-memory collaborators shared by the reconciler unit tests.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use crate::context::{Collaborators, Context};
use crate::crd::{
    MigrationState, VirtualMachineInstance, VirtualMachineInstanceSpec,
    VirtualMachineInstanceStatus, VmiPhase,
};
use crate::domain::{Domain, DomainStatus, MigrationMetadata, SharedDomainCache};
use crate::driver::{
    LauncherClient, LauncherClients, LauncherStatus, MigrationOptions, VirtualMachineOptions,
};
use crate::fail_retry::FailRetryManager;
use crate::labels::{MIGRATION_TARGET_NODE_NAME_LABEL, NODE_NAME_LABEL};
use crate::migration_errors::{LauncherError, StoreError};
use crate::node::{
    DeviceOwnership, IsolationDetector, MemoryOverheadCalculator, NetworkConfigurator,
    VolumeMounter,
};
use crate::store::{EventRecorder, EventType, VmiStore};
use crate::tunnel::{TunnelConfig, TunnelManager};

pub const NAMESPACE: &str = "default";
pub const NAME: &str = "testvmi";
pub const VMI_UID: &str = "1234";
pub const MIGRATION_UID: &str = "mig-1";
pub const LAUNCHER_PID: u32 = 42;

#[derive(Default)]
pub struct FakeStore {
    pub writes: Mutex<Vec<VirtualMachineInstance>>,
    pub fail_with: Mutex<Option<StoreError>>,
}

impl FakeStore {
    pub fn last_write(&self) -> Option<VirtualMachineInstance> {
        self.writes.lock().unwrap().last().cloned()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }
}

#[async_trait]
impl VmiStore for FakeStore {
    async fn update(
        &self,
        vmi: &VirtualMachineInstance,
    ) -> Result<VirtualMachineInstance, StoreError> {
        if let Some(err) = self.fail_with.lock().unwrap().clone() {
            return Err(err);
        }
        self.writes.lock().unwrap().push(vmi.clone());
        Ok(vmi.clone())
    }
}

#[derive(Default)]
pub struct FakeRecorder {
    pub events: Mutex<Vec<(EventType, String, String)>>,
}

impl FakeRecorder {
    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, reason, _)| reason.clone())
            .collect()
    }

    pub fn has(&self, event_type: EventType, reason: &str, message: &str) -> bool {
        self.events
            .lock()
            .unwrap()
            .iter()
            .any(|(t, r, m)| *t == event_type && r == reason && m == message)
    }
}

#[async_trait]
impl EventRecorder for FakeRecorder {
    async fn record(
        &self,
        _vmi: &VirtualMachineInstance,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) {
        self.events
            .lock()
            .unwrap()
            .push((event_type, reason.to_string(), message.to_string()));
    }
}

/// Launcher that records every command and fails the ones told to.
#[derive(Default)]
pub struct FakeLauncher {
    pub calls: Mutex<Vec<String>>,
    pub failures: Mutex<BTreeMap<&'static str, LauncherError>>,
    pub last_options: Mutex<Option<VirtualMachineOptions>>,
}

impl FakeLauncher {
    pub fn fail(&self, call: &'static str, err: LauncherError) {
        self.failures.lock().unwrap().insert(call, err);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn call(&self, name: &'static str) -> Result<(), LauncherError> {
        self.calls.lock().unwrap().push(name.to_string());
        match self.failures.lock().unwrap().get(name) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl LauncherClient for FakeLauncher {
    async fn migrate(
        &self,
        _vmi: &VirtualMachineInstance,
        _options: &MigrationOptions,
    ) -> Result<(), LauncherError> {
        self.call("migrate")
    }

    async fn cancel_migration(&self, _vmi: &VirtualMachineInstance) -> Result<(), LauncherError> {
        self.call("cancel_migration")
    }

    async fn sync_migration_target(
        &self,
        _vmi: &VirtualMachineInstance,
        options: &VirtualMachineOptions,
    ) -> Result<(), LauncherError> {
        *self.last_options.lock().unwrap() = Some(options.clone());
        self.call("sync_migration_target")
    }

    async fn finalize_migration(
        &self,
        _vmi: &VirtualMachineInstance,
        options: &VirtualMachineOptions,
    ) -> Result<(), LauncherError> {
        *self.last_options.lock().unwrap() = Some(options.clone());
        self.call("finalize_migration")
    }

    async fn signal_target_pod_cleanup(
        &self,
        _vmi: &VirtualMachineInstance,
    ) -> Result<(), LauncherError> {
        self.call("signal_target_pod_cleanup")
    }

    async fn sync_cpus(&self, _vmi: &VirtualMachineInstance) -> Result<(), LauncherError> {
        self.call("sync_cpus")
    }

    async fn sync_memory(
        &self,
        _vmi: &VirtualMachineInstance,
        _options: &VirtualMachineOptions,
    ) -> Result<(), LauncherError> {
        self.call("sync_memory")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LauncherState {
    NotInitialized,
    Unresponsive,
    Ready,
}

pub struct FakeLaunchers {
    pub state: Mutex<LauncherState>,
    pub launcher: Arc<FakeLauncher>,
}

#[async_trait]
impl LauncherClients for FakeLaunchers {
    async fn client_for(&self, _vmi: &VirtualMachineInstance) -> LauncherStatus {
        match *self.state.lock().unwrap() {
            LauncherState::NotInitialized => LauncherStatus::NotInitialized,
            LauncherState::Unresponsive => LauncherStatus::Unresponsive,
            LauncherState::Ready => LauncherStatus::Ready(self.launcher.clone()),
        }
    }
}

/// Node facilities that record what they were asked to do.
pub struct FakeNode {
    pub calls: Mutex<Vec<String>>,
    pub disks_ready: Mutex<bool>,
    pub cpu_set: String,
    pub topology: Option<String>,
}

impl Default for FakeNode {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            disks_ready: Mutex::new(true),
            cpu_set: "2-3".to_string(),
            topology: Some(r#"{"cells":[{"id":0}]}"#.to_string()),
        }
    }
}

impl FakeNode {
    fn call(&self, name: impl Into<String>) {
        self.calls.lock().unwrap().push(name.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl IsolationDetector for FakeNode {
    async fn launcher_pid(&self, _vmi: &VirtualMachineInstance) -> Result<u32> {
        Ok(LAUNCHER_PID)
    }

    async fn cpu_set(&self, _vmi: &VirtualMachineInstance) -> Result<String> {
        Ok(self.cpu_set.clone())
    }

    async fn node_topology(&self) -> Result<Option<String>> {
        Ok(self.topology.clone())
    }
}

#[async_trait]
impl VolumeMounter for FakeNode {
    async fn container_disks_ready(&self, _vmi: &VirtualMachineInstance) -> Result<bool> {
        Ok(*self.disks_ready.lock().unwrap())
    }

    async fn mount(&self, _vmi: &VirtualMachineInstance) -> Result<()> {
        self.call("mount");
        Ok(())
    }

    async fn mount_hotplug(
        &self,
        _vmi: &VirtualMachineInstance,
        attachment_pod_uid: &str,
    ) -> Result<()> {
        self.call(format!("mount_hotplug:{attachment_pod_uid}"));
        Ok(())
    }

    async fn unmount_all(&self, _vmi: &VirtualMachineInstance) -> Result<()> {
        self.call("unmount_all");
        Ok(())
    }
}

#[async_trait]
impl NetworkConfigurator for FakeNode {
    async fn setup_migration_target(&self, _vmi: &VirtualMachineInstance) -> Result<()> {
        self.call("setup_network");
        Ok(())
    }

    async fn teardown(&self, _vmi: &VirtualMachineInstance) -> Result<()> {
        self.call("teardown_network");
        Ok(())
    }
}

#[async_trait]
impl DeviceOwnership for FakeNode {
    async fn setup(&self, _vmi: &VirtualMachineInstance) -> Result<()> {
        self.call("setup_devices");
        Ok(())
    }
}

pub struct FixedOverhead(pub u64);

impl MemoryOverheadCalculator for FixedOverhead {
    fn overhead_bytes(&self, _vmi: &VirtualMachineInstance) -> Result<u64> {
        Ok(self.0)
    }
}

/// A context for `host` wired to in-memory collaborators.
pub struct Harness {
    pub ctx: Arc<Context>,
    pub store: Arc<FakeStore>,
    pub recorder: Arc<FakeRecorder>,
    pub launchers: Arc<FakeLaunchers>,
    pub launcher: Arc<FakeLauncher>,
    pub domains: Arc<SharedDomainCache>,
    pub node: Arc<FakeNode>,
    pub run_root: TempDir,
}

impl Harness {
    pub fn new(host: &str) -> Self {
        let run_root = tempfile::tempdir().unwrap();
        let store = Arc::new(FakeStore::default());
        let recorder = Arc::new(FakeRecorder::default());
        let launcher = Arc::new(FakeLauncher::default());
        let launchers = Arc::new(FakeLaunchers {
            state: Mutex::new(LauncherState::Ready),
            launcher: launcher.clone(),
        });
        let domains = Arc::new(SharedDomainCache::new());
        let node = Arc::new(FakeNode::default());

        let collaborators = Collaborators {
            store: store.clone(),
            recorder: recorder.clone(),
            launchers: launchers.clone(),
            domains: domains.clone(),
            isolation: node.clone(),
            volumes: node.clone(),
            network: node.clone(),
            devices: node.clone(),
            memory_overhead: Arc::new(FixedOverhead(0)),
        };

        let ctx = Context {
            host: host.to_string(),
            migration_address: "127.0.0.1".to_string(),
            cluster_migration_config: Default::default(),
            launcher_run_dir_pattern: format!("{}/{{pid}}", run_root.path().display()),
            tunnels: Arc::new(TunnelManager::new(TunnelConfig::plain("127.0.0.1"))),
            collaborators,
            fail_retry: Arc::new(FailRetryManager::new(
                "test",
                Duration::from_secs(10),
                Duration::from_secs(180),
                Duration::from_secs(30),
            )),
        };

        Self {
            ctx: Arc::new(ctx),
            store,
            recorder,
            launchers,
            launcher,
            domains,
            node,
            run_root,
        }
    }

    pub fn set_launcher(&self, state: LauncherState) {
        *self.launchers.state.lock().unwrap() = state;
    }

    /// Work directory of the fake launcher.
    pub fn work_dir(&self) -> PathBuf {
        self.ctx.launcher_run_dir(LAUNCHER_PID).join("kubevirt")
    }
}

/// A running VMI owned by `node_name` with the given migration state.
pub fn vmi(node_name: &str, state: Option<MigrationState>) -> VirtualMachineInstance {
    let mut vmi = VirtualMachineInstance::new(NAME, VirtualMachineInstanceSpec::default());
    vmi.metadata.namespace = Some(NAMESPACE.to_string());
    vmi.metadata.uid = Some(VMI_UID.to_string());
    vmi.metadata.resource_version = Some("1".to_string());
    vmi.metadata.labels = Some(BTreeMap::from([(
        NODE_NAME_LABEL.to_string(),
        node_name.to_string(),
    )]));
    vmi.status = Some(VirtualMachineInstanceStatus {
        phase: Some(VmiPhase::Running),
        node_name: Some(node_name.to_string()),
        migration_state: state,
        ..Default::default()
    });
    vmi
}

/// A VMI owned by `source` and labelled for migration to `target`.
pub fn migrating_vmi(source: &str, target: &str, state: MigrationState) -> VirtualMachineInstance {
    let mut vmi = vmi(source, Some(state));
    vmi.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(MIGRATION_TARGET_NODE_NAME_LABEL.to_string(), target.to_string());
    vmi
}

/// A fresh migration from `source` to `target`.
pub fn migration_state(source: &str, target: &str) -> MigrationState {
    MigrationState {
        migration_uid: MIGRATION_UID.to_string(),
        source_node: Some(source.to_string()),
        target_node: Some(target.to_string()),
        ..Default::default()
    }
}

pub fn domain(status: DomainStatus, migration: Option<MigrationMetadata>) -> Domain {
    Domain {
        namespace: NAMESPACE.to_string(),
        name: NAME.to_string(),
        uid: VMI_UID.to_string(),
        status,
        migration,
        ..Default::default()
    }
}

pub fn migration_metadata() -> MigrationMetadata {
    MigrationMetadata {
        uid: MIGRATION_UID.to_string(),
        ..Default::default()
    }
}
