// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

// Common test utilities for integration tests

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use handoff::context::{Collaborators, Context};
use handoff::crd::{
    MigrationState, VirtualMachineInstance, VirtualMachineInstanceSpec,
    VirtualMachineInstanceStatus, VmiPhase,
};
use handoff::domain::SharedDomainCache;
use handoff::driver::{
    LauncherClient, LauncherClients, LauncherStatus, MigrationOptions, VirtualMachineOptions,
};
use handoff::fail_retry::FailRetryManager;
use handoff::labels::{MIGRATION_TARGET_NODE_NAME_LABEL, NODE_NAME_LABEL};
use handoff::migration_errors::{LauncherError, StoreError};
use handoff::node::{IsolationDetector, StaticMemoryOverhead, UnmanagedNode};
use handoff::store::{EventRecorder, EventType, VmiStore};
use handoff::tunnel::{source_socket_path, TunnelConfig, TunnelManager};
use kube::{
    api::{Api, DeleteParams, PostParams},
    client::Client,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

pub const NAMESPACE: &str = "default";
pub const NAME: &str = "testvmi";
pub const VMI_UID: &str = "5f0c7d2e-1a2b";
pub const MIGRATION_UID: &str = "migration-1";

// ========== Cluster helpers ==========

/// Get a Kubernetes client or skip the test if not in a cluster
pub async fn get_kube_client_or_skip() -> Option<Client> {
    match Client::try_default().await {
        Ok(client) => Some(client),
        Err(e) => {
            eprintln!("Skipping integration test: not running in Kubernetes cluster: {e}");
            None
        }
    }
}

/// Create a test namespace
pub async fn create_test_namespace(
    client: &Client,
    name: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let namespaces: Api<k8s_openapi::api::core::v1::Namespace> = Api::all(client.clone());

    let ns = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": {
            "name": name,
            "labels": {
                "test": "integration",
                "managed-by": "handoff-test"
            }
        }
    }))?;

    match namespaces.create(&PostParams::default(), &ns).await {
        Ok(_) => {
            println!("Created test namespace: {name}");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            println!("Test namespace already exists: {name}");
            Ok(())
        }
        Err(e) => Err(Box::new(e)),
    }
}

/// Cleanup test namespace
pub async fn cleanup_test_namespace(
    client: &Client,
    name: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let namespaces: Api<k8s_openapi::api::core::v1::Namespace> = Api::all(client.clone());

    match namespaces.delete(name, &DeleteParams::default()).await {
        Ok(_) => {
            println!("Deleted test namespace: {name}");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(Box::new(e)),
    }
}

// ========== In-memory cluster ==========

/// The cluster's copy of one VMI, shared by every node under test.
#[derive(Default)]
pub struct SharedVmiStore {
    current: Mutex<Option<VirtualMachineInstance>>,
    writes: Mutex<usize>,
}

impl SharedVmiStore {
    pub fn new(vmi: VirtualMachineInstance) -> Self {
        Self {
            current: Mutex::new(Some(vmi)),
            writes: Mutex::new(0),
        }
    }

    pub fn current(&self) -> VirtualMachineInstance {
        self.current
            .lock()
            .unwrap()
            .clone()
            .expect("store holds a VMI")
    }

    pub fn write_count(&self) -> usize {
        *self.writes.lock().unwrap()
    }
}

#[async_trait]
impl VmiStore for SharedVmiStore {
    async fn update(
        &self,
        vmi: &VirtualMachineInstance,
    ) -> Result<VirtualMachineInstance, StoreError> {
        let mut current = self.current.lock().unwrap();
        let stored_version = current
            .as_ref()
            .and_then(|v| v.metadata.resource_version.clone());
        if stored_version != vmi.metadata.resource_version {
            return Err(StoreError::Conflict { key: vmi.key() });
        }

        let mut updated = vmi.clone();
        let next = stored_version
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or_default()
            + 1;
        updated.metadata.resource_version = Some(next.to_string());
        *current = Some(updated.clone());
        *self.writes.lock().unwrap() += 1;
        Ok(updated)
    }
}

/// Events recorded by one node.
#[derive(Default)]
pub struct RecordedEvents {
    events: Mutex<Vec<(EventType, String, String)>>,
}

impl RecordedEvents {
    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, reason, _)| reason.clone())
            .collect()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, message)| message.clone())
            .collect()
    }
}

#[async_trait]
impl EventRecorder for RecordedEvents {
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

// ========== Hypervisor stand-ins ==========

/// Accept connections on `path`, greet each with `tag` and echo what follows.
pub fn spawn_tagged_echo(path: &Path, tag: &'static [u8]) {
    std::fs::create_dir_all(path.parent().expect("socket path has a parent")).unwrap();
    let listener = UnixListener::bind(path).unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                if stream.write_all(tag).await.is_err() {
                    return;
                }
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
}

/// Send `payload` through a migration socket and return everything the far end sent back.
pub async fn exchange(socket: &Path, payload: &[u8], reply_len: usize) -> std::io::Result<Vec<u8>> {
    let mut stream = UnixStream::connect(socket).await?;
    stream.write_all(payload).await?;
    let mut reply = vec![0u8; reply_len];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut reply))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "no reply"))??;
    Ok(reply)
}

/// Launcher whose `migrate` pushes bytes through the source tunnels the way a
/// hypervisor would, and keeps what came back per channel.
pub struct RelayingLauncher {
    work_dir: PathBuf,
    pub replies: Mutex<BTreeMap<String, Vec<u8>>>,
    pub calls: Mutex<Vec<String>>,
}

impl RelayingLauncher {
    pub fn new(work_dir: PathBuf) -> Self {
        Self {
            work_dir,
            replies: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn call(&self, name: &str) {
        self.calls.lock().unwrap().push(name.to_string());
    }
}

/// Greeting the receiving side sends on every channel, the same length for all.
pub const CHANNEL_TAG_LEN: usize = 8;
pub const CONTROL_TAG: &[u8; CHANNEL_TAG_LEN] = b"control:";
pub const MEMORY_TAG: &[u8; CHANNEL_TAG_LEN] = b"memory::";

#[async_trait]
impl LauncherClient for RelayingLauncher {
    async fn migrate(
        &self,
        vmi: &VirtualMachineInstance,
        _options: &MigrationOptions,
    ) -> Result<(), LauncherError> {
        self.call("migrate");
        let channels: Vec<String> = vmi
            .migration_state()
            .map(|s| s.target_direct_migration_node_ports.keys().cloned().collect())
            .unwrap_or_default();

        for channel in channels {
            let socket = source_socket_path(&self.work_dir, vmi.uid_str(), &channel);
            let payload = format!("channel-{channel}");
            let reply = exchange(&socket, payload.as_bytes(), CHANNEL_TAG_LEN + payload.len())
                .await
                .map_err(|e| LauncherError::Call {
                    operation: "migrate".to_string(),
                    reason: e.to_string(),
                })?;
            self.replies.lock().unwrap().insert(channel, reply);
        }
        Ok(())
    }

    async fn cancel_migration(&self, _vmi: &VirtualMachineInstance) -> Result<(), LauncherError> {
        self.call("cancel_migration");
        Ok(())
    }

    async fn sync_migration_target(
        &self,
        _vmi: &VirtualMachineInstance,
        _options: &VirtualMachineOptions,
    ) -> Result<(), LauncherError> {
        self.call("sync_migration_target");
        Ok(())
    }

    async fn finalize_migration(
        &self,
        _vmi: &VirtualMachineInstance,
        _options: &VirtualMachineOptions,
    ) -> Result<(), LauncherError> {
        self.call("finalize_migration");
        Ok(())
    }

    async fn signal_target_pod_cleanup(
        &self,
        _vmi: &VirtualMachineInstance,
    ) -> Result<(), LauncherError> {
        self.call("signal_target_pod_cleanup");
        Ok(())
    }

    async fn sync_cpus(&self, _vmi: &VirtualMachineInstance) -> Result<(), LauncherError> {
        self.call("sync_cpus");
        Ok(())
    }

    async fn sync_memory(
        &self,
        _vmi: &VirtualMachineInstance,
        _options: &VirtualMachineOptions,
    ) -> Result<(), LauncherError> {
        self.call("sync_memory");
        Ok(())
    }
}

pub struct ReadyLauncher(pub Arc<RelayingLauncher>);

#[async_trait]
impl LauncherClients for ReadyLauncher {
    async fn client_for(&self, _vmi: &VirtualMachineInstance) -> LauncherStatus {
        LauncherStatus::Ready(self.0.clone())
    }
}

/// Launcher isolation with a fixed pid; everything else is left to [`UnmanagedNode`].
pub struct FixedPid(pub u32);

#[async_trait]
impl IsolationDetector for FixedPid {
    async fn launcher_pid(&self, _vmi: &VirtualMachineInstance) -> Result<u32> {
        Ok(self.0)
    }

    async fn cpu_set(&self, _vmi: &VirtualMachineInstance) -> Result<String> {
        Ok(String::new())
    }

    async fn node_topology(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

// ========== Nodes ==========

/// One node running the handler against the shared store.
pub struct TestNode {
    pub ctx: Arc<Context>,
    pub domains: Arc<SharedDomainCache>,
    pub events: Arc<RecordedEvents>,
    pub launcher: Arc<RelayingLauncher>,
    pub pid: u32,
    pub run_root: TempDir,
}

impl TestNode {
    pub fn new(host: &str, pid: u32, store: Arc<SharedVmiStore>) -> Self {
        let run_root = tempfile::tempdir().unwrap();
        let pattern = format!("{}/{{pid}}", run_root.path().display());
        let work_dir = handoff::config::expand_launcher_run_dir(&pattern, pid).join("kubevirt");

        let domains = Arc::new(SharedDomainCache::new());
        let events = Arc::new(RecordedEvents::default());
        let launcher = Arc::new(RelayingLauncher::new(work_dir));

        let collaborators = Collaborators {
            store,
            recorder: events.clone(),
            launchers: Arc::new(ReadyLauncher(launcher.clone())),
            domains: domains.clone(),
            isolation: Arc::new(FixedPid(pid)),
            volumes: Arc::new(UnmanagedNode),
            network: Arc::new(UnmanagedNode),
            devices: Arc::new(UnmanagedNode),
            memory_overhead: Arc::new(StaticMemoryOverhead::default()),
        };

        let ctx = Context {
            host: host.to_string(),
            migration_address: "127.0.0.1".to_string(),
            cluster_migration_config: Default::default(),
            launcher_run_dir_pattern: pattern,
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
            domains,
            events,
            launcher,
            pid,
            run_root,
        }
    }

    /// Run directory of this node's launcher.
    pub fn run_dir(&self) -> PathBuf {
        self.ctx.launcher_run_dir(self.pid)
    }

    /// Launcher work directory holding the migration sockets.
    pub fn work_dir(&self) -> PathBuf {
        self.run_dir().join("kubevirt")
    }
}

// ========== Fixtures ==========

/// A running VMI on `source`, labelled for migration to `target`.
pub fn migrating_vmi(source: &str, target: &str) -> VirtualMachineInstance {
    let mut vmi = VirtualMachineInstance::new(NAME, VirtualMachineInstanceSpec::default());
    vmi.metadata.namespace = Some(NAMESPACE.to_string());
    vmi.metadata.uid = Some(VMI_UID.to_string());
    vmi.metadata.resource_version = Some("1".to_string());
    vmi.metadata.labels = Some(BTreeMap::from([
        (NODE_NAME_LABEL.to_string(), source.to_string()),
        (MIGRATION_TARGET_NODE_NAME_LABEL.to_string(), target.to_string()),
    ]));
    vmi.status = Some(VirtualMachineInstanceStatus {
        phase: Some(VmiPhase::Running),
        node_name: Some(source.to_string()),
        migration_state: Some(MigrationState {
            migration_uid: MIGRATION_UID.to_string(),
            source_node: Some(source.to_string()),
            target_node: Some(target.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    });
    vmi
}
