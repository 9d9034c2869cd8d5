// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! vCPU and memory changes applied to a domain after it migrated.
//!
//! Hotplug requests that arrive while a VM is running are carried out by
//! migrating the VM into a launcher pod sized for the new spec. Once the domain
//! runs on the target, the target applies the new topology and memory size and
//! clears the request markers, whatever the outcome: a failed hotplug is
//! reported, not retried.

use anyhow::Result;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::crd::{Condition, VirtualMachineInstance};
use crate::driver::{LauncherClient, VirtualMachineOptions};
use crate::labels::{
    MEMORY_HOTPLUG_OVERHEAD_RATIO_LABEL, POD_CPU_LIMITS_LABEL, POD_MEMORY_REQUESTS_LABEL,
};
use crate::migration_errors::MigrationError;
use crate::node::MemoryOverheadCalculator;
use crate::status_reasons::{
    CONDITION_MEMORY_CHANGE, CONDITION_VCPU_CHANGE, MSG_MEMORY_HOTPLUG_UNSUPPORTED,
    REASON_MEMORY_HOTPLUG_FAILED,
};
use crate::units::quantity_to_bytes;

/// Apply a pending vCPU change.
///
/// The pod CPU limit label and the `HotVCPUChange` condition are removed in
/// every case.
///
/// # Errors
///
/// Returns an error if a dedicated-CPU VMI lacks a valid CPU limit, asks for more
/// vCPUs than the limit allows, or the launcher refuses the new topology.
pub async fn hotplug_cpu(vmi: &mut VirtualMachineInstance, client: &dyn LauncherClient) -> Result<()> {
    let result = apply_cpu_change(vmi, client).await;

    vmi.labels_mut().remove(POD_CPU_LIMITS_LABEL);
    vmi.remove_condition(CONDITION_VCPU_CHANGE);

    result
}

async fn apply_cpu_change(vmi: &mut VirtualMachineInstance, client: &dyn LauncherClient) -> Result<()> {
    if !vmi.has_condition(CONDITION_VCPU_CHANGE) {
        return Ok(());
    }

    if vmi.is_cpu_dedicated() {
        let limit = vmi
            .labels()
            .get(POD_CPU_LIMITS_LABEL)
            .filter(|value| !value.is_empty())
            .ok_or(MigrationError::MissingCpuLimit)?;
        let limit: u64 = limit
            .parse()
            .map_err(|e: std::num::ParseIntError| MigrationError::InvalidCpuLimit(e.to_string()))?;
        let requested = vmi.vcpus();
        if requested > limit {
            return Err(MigrationError::VcpusExceedLimit { requested, limit }.into());
        }
    }

    client.sync_cpus(vmi).await?;

    let topology = vmi
        .spec
        .domain
        .cpu
        .as_ref()
        .map(|cpu| cpu.topology.clone())
        .unwrap_or_default();
    info!(vmi = %vmi.key(), vcpus = topology.vcpus(), "Applied vCPU change");
    vmi.status_mut().current_cpu_topology = Some(topology);
    Ok(())
}

/// Apply a pending guest memory change.
///
/// The pod memory request label and the overhead ratio label are removed in
/// every case. The `HotMemoryChange` condition is removed unless the launcher
/// rejected the change, in which case it is turned `False`.
///
/// # Errors
///
/// Returns an error if the pod memory request is missing or too small for the
/// requested guest memory, or the launcher refuses the change.
pub async fn hotplug_memory(
    vmi: &mut VirtualMachineInstance,
    client: &dyn LauncherClient,
    overhead: &dyn MemoryOverheadCalculator,
    options: &VirtualMachineOptions,
) -> Result<()> {
    let result = apply_memory_change(vmi, client, overhead, options).await;

    let labels = vmi.labels_mut();
    labels.remove(POD_MEMORY_REQUESTS_LABEL);
    labels.remove(MEMORY_HOTPLUG_OVERHEAD_RATIO_LABEL);

    result
}

async fn apply_memory_change(
    vmi: &mut VirtualMachineInstance,
    client: &dyn LauncherClient,
    overhead: &dyn MemoryOverheadCalculator,
    options: &VirtualMachineOptions,
) -> Result<()> {
    if !vmi.has_condition(CONDITION_MEMORY_CHANGE) {
        return Ok(());
    }

    let pod_request = vmi
        .labels()
        .get(POD_MEMORY_REQUESTS_LABEL)
        .cloned()
        .unwrap_or_default();
    let pod_request_bytes = match quantity_to_bytes(&Quantity(pod_request.clone())) {
        Ok(bytes) => bytes,
        Err(e) => {
            vmi.remove_condition(CONDITION_MEMORY_CHANGE);
            return Err(MigrationError::InvalidMemoryRequest(format!("'{pod_request}': {e}")).into());
        }
    };

    let guest = vmi
        .spec
        .domain
        .memory
        .as_ref()
        .and_then(|memory| memory.guest.clone());
    // Memory requested for the guest, falling back to the guest size itself
    let requested = match vmi.spec.domain.resources.requests.get("memory").or(guest.as_ref()) {
        Some(quantity) => quantity_to_bytes(quantity)?,
        None => 0,
    };
    let required = overhead.overhead_bytes(vmi)?.saturating_add(requested);

    if pod_request_bytes < required {
        vmi.remove_condition(CONDITION_MEMORY_CHANGE);
        return Err(MigrationError::GuestMemoryExceedsRequest {
            guest: required.to_string(),
            request: pod_request,
        }
        .into());
    }

    if let Err(e) = client.sync_memory(vmi, options).await {
        vmi.set_condition(Condition {
            r#type: CONDITION_MEMORY_CHANGE.to_string(),
            status: "False".to_string(),
            reason: Some(REASON_MEMORY_HOTPLUG_FAILED.to_string()),
            message: Some(MSG_MEMORY_HOTPLUG_UNSUPPORTED.to_string()),
            last_transition_time: Some(Utc::now()),
        });
        return Err(e.into());
    }

    vmi.remove_condition(CONDITION_MEMORY_CHANGE);
    debug!(vmi = %vmi.key(), guest = ?guest, "Applied guest memory change");
    vmi.status_mut()
        .memory
        .get_or_insert_with(Default::default)
        .guest_requested = guest;
    Ok(())
}
