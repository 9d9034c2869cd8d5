// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Node-local resource preparation used by the target controller.
//!
//! Each trait is a seam to a subsystem the handler delegates to: process
//! isolation lookups, volume mounts, pod network plumbing and device node
//! ownership. Failures are ordinary reconciliation errors.

use anyhow::Result;
use async_trait::async_trait;
use kube::ResourceExt;

use crate::crd::VirtualMachineInstance;
use crate::labels::MEMORY_HOTPLUG_OVERHEAD_RATIO_LABEL;
use crate::units::quantity_to_bytes;

/// Locates a launcher process and its resources.
#[async_trait]
pub trait IsolationDetector: Send + Sync {
    /// Pid of the launcher running the VMI.
    async fn launcher_pid(&self, vmi: &VirtualMachineInstance) -> Result<u32>;

    /// Raw cpuset line of the launcher's cgroup, e.g. `"0-3,7"`.
    async fn cpu_set(&self, vmi: &VirtualMachineInstance) -> Result<String>;

    /// JSON encoded NUMA topology of this node, if known.
    async fn node_topology(&self) -> Result<Option<String>>;
}

/// Disk and filesystem mounts of a launcher.
#[async_trait]
pub trait VolumeMounter: Send + Sync {
    /// Whether all container disks of the VMI are available on this node.
    async fn container_disks_ready(&self, vmi: &VirtualMachineInstance) -> Result<bool>;

    async fn mount(&self, vmi: &VirtualMachineInstance) -> Result<()>;

    /// Mount volumes hotplugged through the attachment pod.
    async fn mount_hotplug(&self, vmi: &VirtualMachineInstance, attachment_pod_uid: &str)
        -> Result<()>;

    async fn unmount_all(&self, vmi: &VirtualMachineInstance) -> Result<()>;
}

/// Pod network setup for the VMI interfaces.
#[async_trait]
pub trait NetworkConfigurator: Send + Sync {
    async fn setup_migration_target(&self, vmi: &VirtualMachineInstance) -> Result<()>;

    async fn teardown(&self, vmi: &VirtualMachineInstance) -> Result<()>;
}

/// Ownership of device nodes handed to the launcher.
#[async_trait]
pub trait DeviceOwnership: Send + Sync {
    async fn setup(&self, vmi: &VirtualMachineInstance) -> Result<()>;
}

/// Memory a launcher needs on top of the guest memory.
pub trait MemoryOverheadCalculator: Send + Sync {
    /// Overhead in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if a memory quantity of the VMI cannot be parsed.
    fn overhead_bytes(&self, vmi: &VirtualMachineInstance) -> Result<u64>;
}

/// Node collaborators that report success without touching the node.
///
/// Used when the handler runs next to an agent that prepares launchers itself.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnmanagedNode;

#[async_trait]
impl IsolationDetector for UnmanagedNode {
    async fn launcher_pid(&self, vmi: &VirtualMachineInstance) -> Result<u32> {
        anyhow::bail!("no isolation backend to locate the launcher of {}", vmi.key())
    }

    async fn cpu_set(&self, _vmi: &VirtualMachineInstance) -> Result<String> {
        Ok(String::new())
    }

    async fn node_topology(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

#[async_trait]
impl VolumeMounter for UnmanagedNode {
    async fn container_disks_ready(&self, _vmi: &VirtualMachineInstance) -> Result<bool> {
        Ok(true)
    }

    async fn mount(&self, _vmi: &VirtualMachineInstance) -> Result<()> {
        Ok(())
    }

    async fn mount_hotplug(
        &self,
        _vmi: &VirtualMachineInstance,
        _attachment_pod_uid: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn unmount_all(&self, _vmi: &VirtualMachineInstance) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl NetworkConfigurator for UnmanagedNode {
    async fn setup_migration_target(&self, _vmi: &VirtualMachineInstance) -> Result<()> {
        Ok(())
    }

    async fn teardown(&self, _vmi: &VirtualMachineInstance) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl DeviceOwnership for UnmanagedNode {
    async fn setup(&self, _vmi: &VirtualMachineInstance) -> Result<()> {
        Ok(())
    }
}

/// Fixed launcher overhead plus a ratio of the guest memory.
#[derive(Clone, Copy, Debug)]
pub struct StaticMemoryOverhead {
    /// Bytes reserved for every launcher.
    pub base_bytes: u64,
    /// Default share of guest memory added as overhead.
    pub guest_ratio: f64,
}

impl Default for StaticMemoryOverhead {
    fn default() -> Self {
        Self {
            base_bytes: 220 * 1024 * 1024,
            guest_ratio: 0.01,
        }
    }
}

impl MemoryOverheadCalculator for StaticMemoryOverhead {
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn overhead_bytes(&self, vmi: &VirtualMachineInstance) -> Result<u64> {
        let guest = match vmi.spec.domain.memory.as_ref().and_then(|m| m.guest.as_ref()) {
            Some(quantity) => quantity_to_bytes(quantity)?,
            None => 0,
        };

        // The VMI may carry its own ratio for memory hotplug
        let ratio = match vmi.labels().get(MEMORY_HOTPLUG_OVERHEAD_RATIO_LABEL) {
            Some(value) => value.parse::<f64>().map_err(|e| {
                anyhow::anyhow!("invalid memory overhead ratio '{value}' on {}: {e}", vmi.key())
            })?,
            None => self.guest_ratio,
        };

        Ok(self.base_bytes + (guest as f64 * ratio).ceil() as u64)
    }
}
