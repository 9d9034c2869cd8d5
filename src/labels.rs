// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Label constants read and written on `VirtualMachineInstance` objects.
//!
//! Labels are the only metadata the migration controllers touch; everything else
//! they write lives under `status`.

// ============================================================================
// Node Ownership Labels
// ============================================================================

/// Label naming the node that currently owns (runs) the virtual machine
pub const NODE_NAME_LABEL: &str = "kubevirt.io/nodeName";

/// Label naming the node selected as migration target
///
/// Set by the cluster-level migration controller, removed by the target once the
/// migration is finalized or torn down.
pub const MIGRATION_TARGET_NODE_NAME_LABEL: &str = "kubevirt.io/migrationTargetNodeName";

/// Label marking a VMI whose launcher runs an outdated image
pub const OUTDATED_LAUNCHER_IMAGE_LABEL: &str = "kubevirt.io/outdatedLauncherImage";

// ============================================================================
// Hotplug Labels
// ============================================================================

/// Label carrying the CPU limit of the target launcher pod (integer vCPUs)
pub const POD_CPU_LIMITS_LABEL: &str = "kubevirt.io/vmPodCPULimits";

/// Label carrying the memory request of the target launcher pod (quantity)
pub const POD_MEMORY_REQUESTS_LABEL: &str = "kubevirt.io/vmPodMemoryRequests";

/// Label carrying the memory overhead ratio used when the pod was sized
pub const MEMORY_HOTPLUG_OVERHEAD_RATIO_LABEL: &str = "kubevirt.io/memoryHotplugOverheadRatio";
