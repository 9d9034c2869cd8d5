// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Target side of a live migration.
//!
//! The target controller handles a VMI whose migration-target label names this
//! node. It moves through these stages, one sync at a time:
//!
//! 1. **Prepare**: configure networking, mount volumes, prepare the receiving
//!    launcher and open one TCP listener per migration channel
//! 2. **Publish**: write the listener address and ports into the migration state
//!    so the source can connect
//! 3. **Detect**: record that the migrated domain showed up and became active
//! 4. **Acknowledge**: once the hypervisor reported the end of the migration and
//!    the domain runs here, take ownership of the VMI
//! 5. **Finalize**: apply pending hotplug changes, finalize the domain and mark
//!    the migration completed
//! 6. **Clean up**: close the listeners, and after a failure tear down what was
//!    prepared on this node

use anyhow::{Context as _, Result};
use chrono::Utc;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::constants::{
    BLOCK_MIGRATION_PORT, CONTROL_CHANNEL, DIRECT_MIGRATION_PORT, DISKS_NOT_READY_REQUEUE_SECS,
    FAILED_TARGET_REQUEUE_SECS, HYPERVISOR_CONTROL_SOCKET, LAUNCHER_NOT_READY_REQUEUE_SECS,
    LAUNCHER_WORK_DIR, POSTCOPY_CLEANUP_DEFER_SECS,
};
use crate::context::Context;
use crate::crd::{MigrationMode, MigrationTransport, VirtualMachineInstance, VolumeStatus};
use crate::domain::Domain;
use crate::driver::{LauncherClient, LauncherStatus, VirtualMachineOptions};
use crate::labels::{MIGRATION_TARGET_NODE_NAME_LABEL, NODE_NAME_LABEL, OUTDATED_LAUNCHER_IMAGE_LABEL};
use crate::metrics;
use crate::migration_errors::{LauncherError, MigrationError};
use crate::reconcilers::hotplug::{hotplug_cpu, hotplug_memory};
use crate::reconcilers::{status_changed, SyncOutcome};
use crate::status_reasons::{
    migrated_to_node_message, target_listening_message, CONDITION_VOLUMES_CHANGE,
    MSG_TARGET_PREPARED, REASON_CPU_HOTPLUG_FAILED, REASON_MEMORY_HOTPLUG_FAILED, REASON_MIGRATED,
    REASON_PREPARING_TARGET, REASON_SYNC_FAILED,
};
use crate::store::EventType;
use crate::tunnel::source_socket_path;
use crate::units::parse_cpu_set;

const ROLE: &str = "target";

/// Reconcile the target side of a VMI's migration.
///
/// # Errors
///
/// Returns an error if preparing, finalizing or cleaning up the target failed,
/// the listeners could not be published, or the VMI could not be written back.
pub async fn sync_target(ctx: Arc<Context>, vmi: VirtualMachineInstance) -> Result<SyncOutcome> {
    let key = vmi.key();
    let uid = vmi.uid_str().to_string();

    if vmi.is_final() || vmi.is_being_deleted() {
        debug!(vmi = %key, "VMI is final or terminating, closing target listeners");
        ctx.tunnels.stop_target_listener(&uid);
        return Ok(SyncOutcome::done());
    }

    let domain = ctx.collaborators.domains.get(&key);
    if let Some(domain) = &domain {
        if domain.uid != uid {
            debug!(vmi = %key, domain_uid = %domain.uid, "Ignoring domain of an older VMI incarnation");
            return Ok(SyncOutcome::done());
        }
    }

    let Some(state) = vmi.migration_state() else {
        return Ok(SyncOutcome::done());
    };

    if state.is_done() {
        return finish_migration(&ctx, &vmi, domain.as_ref()).await;
    }

    if domain.as_ref().is_some_and(|d| !d.is_alive()) {
        debug!(vmi = %key, "Domain is not alive on the target");
        return Ok(SyncOutcome::done());
    }

    if vmi.migration_target_label() != Some(ctx.host.as_str()) {
        return Ok(SyncOutcome::done());
    }

    debug!(vmi = %key, migration = %state.migration_uid, "Processing migration target");

    let mut updated = vmi.clone();
    let processed = process_target(&ctx, &mut updated).await;
    if let Err(e) = &processed {
        error!(vmi = %key, error = %format!("{e:#}"), "Failed to process migration target");
        ctx.collaborators
            .recorder
            .record(&vmi, EventType::Warning, REASON_SYNC_FAILED, &format!("{e:#}"))
            .await;
    }

    let status_updated = update_target_status(&ctx, &mut updated, domain.as_ref()).await;
    if let Err(e) = &status_updated {
        error!(vmi = %key, error = %format!("{e:#}"), "Failed to update migration target status");
    }

    if status_changed(&vmi.status, &updated.status) || vmi.labels() != updated.labels() {
        ctx.collaborators
            .store
            .update(&updated)
            .await
            .with_context(|| format!("failed to update migration target status of {key}"))?;
    }

    let outcome = processed?;
    // A preparation waiting to be retried has no listener to publish yet
    if outcome.requeue_after.is_none() {
        status_updated?;
    }
    Ok(outcome)
}

/// Close the listeners of a decided migration and, after a failure, undo the
/// preparation done on this node.
async fn finish_migration(
    ctx: &Context,
    vmi: &VirtualMachineInstance,
    domain: Option<&Domain>,
) -> Result<SyncOutcome> {
    let host = ctx.host.as_str();
    let labelled_here = vmi.migration_target_label() == Some(host);
    if !labelled_here && vmi.node_name() != Some(host) {
        return Ok(SyncOutcome::done());
    }

    ctx.tunnels.stop_target_listener(vmi.uid_str());
    if !labelled_here {
        return Ok(SyncOutcome::done());
    }

    let Some(state) = vmi.migration_state() else {
        return Ok(SyncOutcome::done());
    };

    if state.failed {
        // The post-copy domain here may hold the only current copy of guest memory
        if state.mode == Some(MigrationMode::PostCopy) && domain.is_some_and(Domain::is_alive) {
            info!(vmi = %vmi.key(), "Deferring cleanup of a failed post-copy migration");
            return Ok(SyncOutcome::requeue_secs(
                POSTCOPY_CLEANUP_DEFER_SECS,
                "postcopy_cleanup_deferred",
            ));
        }
        clean_up_failed_target(ctx, vmi).await?;
        metrics::record_migration(ROLE, "failed");
    }

    let mut updated = vmi.clone();
    updated.labels_mut().remove(MIGRATION_TARGET_NODE_NAME_LABEL);
    if vmi.labels() != updated.labels() {
        ctx.collaborators
            .store
            .update(&updated)
            .await
            .with_context(|| format!("failed to remove migration target label of {}", vmi.key()))?;
    }
    Ok(SyncOutcome::done())
}

async fn clean_up_failed_target(ctx: &Context, vmi: &VirtualMachineInstance) -> Result<()> {
    let collaborators = &ctx.collaborators;
    info!(vmi = %vmi.key(), "Cleaning up the target of a failed migration");

    match collaborators.launchers.client_for(vmi).await {
        LauncherStatus::Ready(client) => client
            .signal_target_pod_cleanup(vmi)
            .await
            .context("failed to signal target pod cleanup")?,
        status => debug!(vmi = %vmi.key(), launcher = ?status, "No launcher to signal for cleanup"),
    }

    collaborators
        .volumes
        .unmount_all(vmi)
        .await
        .context("failed to unmount target volumes")?;
    collaborators
        .network
        .teardown(vmi)
        .await
        .context("failed to tear down target networking")?;
    collaborators.domains.remove(&vmi.key());
    Ok(())
}

async fn process_target(ctx: &Context, vmi: &mut VirtualMachineInstance) -> Result<SyncOutcome> {
    let client = match ctx.collaborators.launchers.client_for(vmi).await {
        LauncherStatus::NotInitialized => {
            debug!(vmi = %vmi.key(), "Target launcher not initialized yet");
            return Ok(SyncOutcome::requeue_secs(
                LAUNCHER_NOT_READY_REQUEUE_SECS,
                "launcher_not_initialized",
            ));
        }
        LauncherStatus::Unresponsive => return Err(LauncherError::Unresponsive.into()),
        LauncherStatus::Ready(client) => client,
    };

    let Some(state) = vmi.migration_state().cloned() else {
        return Ok(SyncOutcome::done());
    };

    if state.needs_finalization() {
        // Ownership must move here before the migration may be marked completed
        if vmi.node_name() == Some(ctx.host.as_str()) {
            finalize_migration(ctx, vmi, client.as_ref()).await?;
        } else {
            debug!(vmi = %vmi.key(), "Waiting to take ownership before finalizing");
        }
        return Ok(SyncOutcome::done());
    }

    if state.failed {
        client
            .signal_target_pod_cleanup(vmi)
            .await
            .context("failed to signal target pod cleanup")?;
        info!(vmi = %vmi.key(), "Signaled target pod cleanup after failed migration");
        return Ok(SyncOutcome::requeue_secs(
            FAILED_TARGET_REQUEUE_SECS,
            "failed_target_cleanup",
        ));
    }

    if state.is_migrating() {
        return Ok(SyncOutcome::done());
    }

    prepare_target(ctx, vmi, client.as_ref()).await
}

/// Node-side facts the launcher needs to rebuild the domain here.
fn virtual_machine_options(ctx: &Context, vmi: &VirtualMachineInstance) -> Result<VirtualMachineOptions> {
    let interface_bindings = vmi
        .spec
        .domain
        .devices
        .interfaces
        .iter()
        .filter_map(|iface| {
            iface
                .binding
                .as_ref()
                .map(|binding| (iface.name.clone(), binding.clone()))
        })
        .collect();

    Ok(VirtualMachineOptions {
        memory_overhead_bytes: ctx.collaborators.memory_overhead.overhead_bytes(vmi)?,
        interface_bindings,
        cpu_set: vmi
            .migration_state()
            .map(|s| s.target_cpu_set.clone())
            .unwrap_or_default(),
    })
}

/// Volume status as it will look once migrated volumes point at their destination claims.
fn with_migrated_volume_status(vmi: &VirtualMachineInstance) -> VirtualMachineInstance {
    let mut prepared = vmi.clone();
    let status = prepared.status_mut();
    let migrated = std::mem::take(&mut status.migrated_volumes);
    for volume in &migrated {
        let Some(destination) = volume.destination_pvc_info.clone() else {
            continue;
        };
        match status
            .volume_status
            .iter_mut()
            .find(|s| s.name == volume.volume_name)
        {
            Some(existing) => existing.persistent_volume_claim_info = Some(destination),
            None => status.volume_status.push(VolumeStatus {
                name: volume.volume_name.clone(),
                persistent_volume_claim_info: Some(destination),
            }),
        }
    }
    status.migrated_volumes = migrated;
    prepared
}

/// Unix socket each migration channel is relayed to on this node.
fn target_sockets(ctx: &Context, vmi: &VirtualMachineInstance, pid: u32) -> BTreeMap<String, PathBuf> {
    let run_dir = ctx.launcher_run_dir(pid);
    let work_dir = run_dir.join(LAUNCHER_WORK_DIR);

    let mut ports = vec![DIRECT_MIGRATION_PORT];
    if vmi.is_block_migration() {
        ports.push(BLOCK_MIGRATION_PORT);
    }

    let mut sockets = BTreeMap::from([(
        CONTROL_CHANNEL.to_string(),
        run_dir.join(HYPERVISOR_CONTROL_SOCKET),
    )]);
    for port in ports {
        let channel = port.to_string();
        let socket = source_socket_path(&work_dir, vmi.uid_str(), &channel);
        sockets.insert(channel, socket);
    }
    sockets
}

async fn prepare_target(
    ctx: &Context,
    vmi: &VirtualMachineInstance,
    client: &dyn LauncherClient,
) -> Result<SyncOutcome> {
    let collaborators = &ctx.collaborators;

    collaborators
        .network
        .setup_migration_target(vmi)
        .await
        .context("failed to configure VMI network for migration target")?;

    let prepared = with_migrated_volume_status(vmi);

    if !collaborators.volumes.container_disks_ready(&prepared).await? {
        info!(vmi = %vmi.key(), "Container disks not ready yet");
        return Ok(SyncOutcome::requeue_secs(
            DISKS_NOT_READY_REQUEUE_SECS,
            "waiting_for_container_disks",
        ));
    }

    collaborators
        .volumes
        .mount(&prepared)
        .await
        .context("failed to mount target volumes")?;

    let attachment_pod = prepared
        .migration_state()
        .and_then(|s| s.target_attachment_pod_uid.clone())
        .filter(|uid| !uid.is_empty());
    if let Some(attachment_pod) = attachment_pod {
        collaborators
            .volumes
            .mount_hotplug(&prepared, &attachment_pod)
            .await
            .context("failed to mount hotplug volumes")?;
    }

    collaborators
        .devices
        .setup(&prepared)
        .await
        .context("failed to set up device ownership")?;

    let options = virtual_machine_options(ctx, &prepared)?;
    client
        .sync_migration_target(&prepared, &options)
        .await
        .context("syncing migration target failed")?;
    collaborators
        .recorder
        .record(vmi, EventType::Normal, REASON_PREPARING_TARGET, MSG_TARGET_PREPARED)
        .await;

    let pid = collaborators
        .isolation
        .launcher_pid(&prepared)
        .await
        .context("failed to detect launcher isolation")?;
    ctx.tunnels
        .start_target_listener(vmi.uid_str(), &target_sockets(ctx, &prepared, pid))
        .context("failed to handle post sync migration proxy")?;

    info!(vmi = %vmi.key(), "Migration target prepared");
    Ok(SyncOutcome::done())
}

async fn finalize_migration(
    ctx: &Context,
    vmi: &mut VirtualMachineInstance,
    client: &dyn LauncherClient,
) -> Result<()> {
    let collaborators = &ctx.collaborators;
    let options = virtual_machine_options(ctx, vmi)?;

    if let Err(e) = hotplug_cpu(vmi, client).await {
        warn!(vmi = %vmi.key(), error = %format!("{e:#}"), "vCPU hotplug failed");
        collaborators
            .recorder
            .record(
                vmi,
                EventType::Warning,
                REASON_CPU_HOTPLUG_FAILED,
                &format!("failed to change vCPUs: {e:#}"),
            )
            .await;
    }

    if let Err(e) = hotplug_memory(vmi, client, collaborators.memory_overhead.as_ref(), &options).await
    {
        warn!(vmi = %vmi.key(), error = %format!("{e:#}"), "Memory hotplug failed");
        collaborators
            .recorder
            .record(
                vmi,
                EventType::Warning,
                REASON_MEMORY_HOTPLUG_FAILED,
                &format!("failed to update guest memory: {e:#}"),
            )
            .await;
    }

    vmi.status_mut().migrated_volumes.clear();
    vmi.remove_condition(CONDITION_VOLUMES_CHANGE);

    client
        .finalize_migration(vmi, &options)
        .await
        .context("failed to finalize migration")?;

    if let Some(state) = vmi.migration_state_mut() {
        state.completed = true;
    }
    vmi.labels_mut().remove(MIGRATION_TARGET_NODE_NAME_LABEL);
    info!(vmi = %vmi.key(), "Migration finalized");
    Ok(())
}

/// Take ownership of the VMI on this node.
async fn acknowledge_ownership(ctx: &Context, vmi: &mut VirtualMachineInstance) {
    let host = ctx.host.clone();
    let labels = vmi.labels_mut();
    labels.insert(NODE_NAME_LABEL.to_string(), host.clone());
    labels.remove(OUTDATED_LAUNCHER_IMAGE_LABEL);

    let status = vmi.status_mut();
    status.launcher_container_image_version = None;
    status.node_name = Some(host.clone());
    status.evacuation_node_name = None;
    status.migration_transport = Some(MigrationTransport::Unix);

    info!(vmi = %vmi.key(), node = %host, "Took ownership of the migrated VMI");
    metrics::record_migration(ROLE, "succeeded");
    ctx.collaborators
        .recorder
        .record(vmi, EventType::Normal, REASON_MIGRATED, &migrated_to_node_message(&host))
        .await;
}

async fn update_target_status(
    ctx: &Context,
    vmi: &mut VirtualMachineInstance,
    domain: Option<&Domain>,
) -> Result<()> {
    let now = Utc::now();
    let host = ctx.host.clone();
    let key = vmi.key();

    let ended = {
        let Some(state) = vmi.migration_state_mut() else {
            return Ok(());
        };
        if state.failed {
            return Ok(());
        }

        if domain.is_some() && !state.target_node_domain_detected {
            info!(vmi = %key, "The target node received the migrated domain");
            state.target_node_domain_detected = true;
        }
        if domain.is_some_and(Domain::is_active_on_target)
            && state.target_node_domain_ready_timestamp.is_none()
        {
            info!(vmi = %key, "The migrated domain is active on the target");
            state.target_node_domain_ready_timestamp = Some(now);
        }

        let end = domain
            .and_then(|d| d.migration_for(&state.migration_uid))
            .and_then(|m| m.end_timestamp);
        if end.is_some() {
            state.end_timestamp = end;
        }
        end.is_some() && state.target_domain_ready()
    };

    if ended && vmi.node_name() != Some(host.as_str()) {
        acknowledge_ownership(ctx, vmi).await;
    }

    if vmi.migration_state().is_some_and(|s| s.is_migrating()) {
        return Ok(());
    }

    let ports = ctx.tunnels.get_target_listener_ports(vmi.uid_str());
    if ports.is_empty() {
        return Err(MigrationError::TargetListenerNotUp.into());
    }

    let address = ctx.migration_address.clone();
    let published = vmi.migration_state().is_some_and(|s| {
        s.target_node_address.as_deref() == Some(address.as_str())
            && s.target_direct_migration_node_ports == ports
    });
    if !published {
        ctx.collaborators
            .recorder
            .record(
                vmi,
                EventType::Normal,
                REASON_PREPARING_TARGET,
                &target_listening_message(&address, ports.keys()),
            )
            .await;
        if let Some(state) = vmi.migration_state_mut() {
            state.target_node_address = Some(address);
            state.target_direct_migration_node_ports = ports;
        }
    }

    if vmi.is_cpu_dedicated() {
        let isolation = &ctx.collaborators.isolation;
        let cpu_set = isolation
            .cpu_set(vmi)
            .await
            .context("failed to read the target launcher cpuset")?;
        let cpus = parse_cpu_set(&cpu_set)?;
        let topology = isolation
            .node_topology()
            .await
            .context("failed to read the node topology")?;
        if let Some(state) = vmi.migration_state_mut() {
            state.target_cpu_set = cpus;
            state.target_node_topology = topology;
        }
    }

    Ok(())
}
