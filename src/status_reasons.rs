// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Event reasons, condition types and messages used by the migration controllers.
//!
//! Reasons are programmatic identifiers in CamelCase that end up on recorded
//! events and VMI conditions, so they must stay stable across releases.
//!
//! # Example Events
//!
//! ```text
//! Normal   PreparingTarget  Migration Target is listening at 10.0.0.7, on ports: 0,49152
//! Normal   Migrating        VirtualMachineInstance is migrating.
//! Normal   Migrated         The VirtualMachineInstance migrated to node node-b.
//! Warning  Migrated         VirtualMachineInstance migration uid 42 failed. reason:...
//! ```

// ============================================================================
// Event Reasons
// ============================================================================

/// The source started (or is aborting) a migration.
pub const REASON_MIGRATING: &str = "Migrating";

/// A migration reached a verdict: ownership moved, failed, or timed out.
pub const REASON_MIGRATED: &str = "Migrated";

/// The target prepared local resources or published its listeners.
pub const REASON_PREPARING_TARGET: &str = "PreparingTarget";

/// A reconciliation pass returned an error.
pub const REASON_SYNC_FAILED: &str = "SyncFailed";

/// A post-migration CPU hotplug could not be applied.
pub const REASON_CPU_HOTPLUG_FAILED: &str = "CPUHotplugFailed";

/// A post-migration memory hotplug could not be applied.
///
/// Also used as the reason of the `HotMemoryChange` condition once it turns `False`.
pub const REASON_MEMORY_HOTPLUG_FAILED: &str = "MemoryHotplugFailed";

// ============================================================================
// Condition Types
// ============================================================================

/// Condition present while a vCPU change requested during migration is pending
pub const CONDITION_VCPU_CHANGE: &str = "HotVCPUChange";

/// Condition present while a memory change requested during migration is pending
pub const CONDITION_MEMORY_CHANGE: &str = "HotMemoryChange";

/// Condition present while a volume migration is pending
pub const CONDITION_VOLUMES_CHANGE: &str = "VolumesChange";

// ============================================================================
// Event Messages
// ============================================================================

/// Emitted when the source asks the hypervisor to start migrating
pub const MSG_MIGRATING: &str = "VirtualMachineInstance is migrating.";

/// Emitted when the source asks the hypervisor to cancel a migration
pub const MSG_ABORTING_MIGRATION: &str = "VirtualMachineInstance is aborting migration.";

/// Emitted when the target finished preparing local resources
pub const MSG_TARGET_PREPARED: &str = "VirtualMachineInstance Migration Target Prepared.";

/// Emitted when the source has no target node to hand ownership to
pub const MSG_MIGRATED_TO_UNKNOWN_HOST: &str =
    "The VirtualMachineInstance migrated to unknown host.";

/// Emitted when the target never reported the migrated domain in time
pub const MSG_TARGET_DOMAIN_NOT_DETECTED: &str = "The VirtualMachineInstance's domain was never observed on the target after the migration completed within the timeout period.";

/// Message attached to the `HotMemoryChange` condition after a failed memory hotplug
pub const MSG_MEMORY_HOTPLUG_UNSUPPORTED: &str =
    "memory hotplug failed, the VM configuration is not supported";

/// Message of a failed migration reported by the hypervisor
#[must_use]
pub fn migration_failed_message(migration_uid: &str, reason: &str) -> String {
    format!("VirtualMachineInstance migration uid {migration_uid} failed. reason:{reason}")
}

/// Message emitted when ownership moved to the target node
#[must_use]
pub fn migrated_to_node_message(node: &str) -> String {
    format!("The VirtualMachineInstance migrated to node {node}.")
}

/// Message emitted when the target published its listener address
///
/// Channels are listed in sorted order so the message is stable across reconciliations.
#[must_use]
pub fn target_listening_message<'a>(
    address: &str,
    channels: impl IntoIterator<Item = &'a String>,
) -> String {
    let ports: Vec<&str> = channels.into_iter().map(String::as_str).collect();
    format!(
        "Migration Target is listening at {address}, on ports: {}",
        ports.join(",")
    )
}

