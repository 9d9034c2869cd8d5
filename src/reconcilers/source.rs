// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Source side of a live migration.
//!
//! The source controller handles a VMI while this node still owns it and the
//! migration state names this node as source. One sync:
//!
//! 1. Skips VMIs that are final, being deleted, or whose local domain belongs to
//!    an older incarnation of the VMI
//! 2. Stops the source tunnels once the migration reached a verdict
//! 3. Aborts the migration on request, or waits for the target's listener ports
//!    and then opens the source tunnels and starts the hypervisor migration
//! 4. Mirrors the hypervisor's progress into the migration state and fails the
//!    migration if the target never reported the migrated domain

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::constants::{
    LAUNCHER_NOT_READY_REQUEUE_SECS, LAUNCHER_WORK_DIR, MIN_DETECTION_REQUEUE_SECS,
    TARGET_DOMAIN_DETECTION_TIMEOUT_SECS, TARGET_PORTS_REQUEUE_SECS,
};
use crate::context::Context;
use crate::crd::{MigrationAbortStatus, MigrationState, VirtualMachineInstance, VmiPhase};
use crate::domain::Domain;
use crate::driver::{LauncherClient, LauncherStatus, MigrationOptions};
use crate::metrics;
use crate::migration_errors::LauncherError;
use crate::reconcilers::{status_changed, SyncOutcome};
use crate::status_reasons::{
    migration_failed_message, MSG_ABORTING_MIGRATION, MSG_MIGRATED_TO_UNKNOWN_HOST, MSG_MIGRATING,
    MSG_TARGET_DOMAIN_NOT_DETECTED, REASON_MIGRATED, REASON_MIGRATING, REASON_SYNC_FAILED,
};
use crate::store::EventType;

const ROLE: &str = "source";

/// How long the source still waits for the target to report the migrated domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetDetection {
    /// The hypervisor has not reported the end of the migration yet.
    NotEnded,
    /// The target reported the domain as detected and running.
    Ready,
    /// Still inside the detection window.
    Waiting(Duration),
    /// The window elapsed without the target reporting the domain.
    Expired,
}

/// Where `state` stands in the target detection window at `now`.
#[must_use]
pub fn target_detection(state: &MigrationState, now: DateTime<Utc>) -> TargetDetection {
    let Some(end) = state.end_timestamp else {
        return TargetDetection::NotEnded;
    };
    if state.target_domain_ready() {
        return TargetDetection::Ready;
    }

    let elapsed = now.signed_duration_since(end).num_seconds();
    if elapsed > TARGET_DOMAIN_DETECTION_TIMEOUT_SECS {
        return TargetDetection::Expired;
    }
    let left = u64::try_from(TARGET_DOMAIN_DETECTION_TIMEOUT_SECS - elapsed).unwrap_or(0);
    TargetDetection::Waiting(Duration::from_secs(left.max(MIN_DETECTION_REQUEUE_SECS)))
}

/// Reconcile the source side of a VMI's migration.
///
/// Status changes are written back even when the migration step failed, so the
/// target sees progress reported by the hypervisor as early as possible.
///
/// # Errors
///
/// Returns an error if the migration could not be started or aborted, or the
/// VMI could not be written back (including optimistic concurrency conflicts).
pub async fn sync_source(ctx: Arc<Context>, vmi: VirtualMachineInstance) -> Result<SyncOutcome> {
    let key = vmi.key();
    let uid = vmi.uid_str().to_string();

    if vmi.is_final() || vmi.is_being_deleted() {
        debug!(vmi = %key, "VMI is final or terminating, nothing to migrate");
        ctx.tunnels.stop_source_listener(&uid);
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
        ctx.tunnels.stop_source_listener(&uid);
        return Ok(SyncOutcome::done());
    }

    if !is_migration_source(&ctx, &vmi, state) {
        return Ok(SyncOutcome::done());
    }

    debug!(vmi = %key, migration = %state.migration_uid, "Processing migration source");

    let mut updated = vmi.clone();
    let processed = process_source(&ctx, &updated, domain.as_ref()).await;
    if let Err(e) = &processed {
        error!(vmi = %key, error = %format!("{e:#}"), "Failed to process migration source");
        ctx.collaborators
            .recorder
            .record(&vmi, EventType::Warning, REASON_SYNC_FAILED, &format!("{e:#}"))
            .await;
    }

    let status_outcome = update_source_status(&ctx, &mut updated, domain.as_ref()).await;

    if status_changed(&vmi.status, &updated.status) {
        ctx.collaborators
            .store
            .update(&updated)
            .await
            .with_context(|| format!("failed to update migration source status of {key}"))?;
    }

    Ok(processed?.merge(status_outcome))
}

/// This node owns the VMI and is named as the migration source.
fn is_migration_source(ctx: &Context, vmi: &VirtualMachineInstance, state: &MigrationState) -> bool {
    state.source_node.as_deref() == Some(ctx.host.as_str())
        && vmi.node_name() == Some(ctx.host.as_str())
}

async fn process_source(
    ctx: &Context,
    vmi: &VirtualMachineInstance,
    domain: Option<&Domain>,
) -> Result<SyncOutcome> {
    let Some(domain) = domain.filter(|d| d.is_alive()) else {
        debug!(vmi = %vmi.key(), "Domain is not alive, nothing to migrate");
        return Ok(SyncOutcome::done());
    };

    let client = match ctx.collaborators.launchers.client_for(vmi).await {
        LauncherStatus::NotInitialized => {
            debug!(vmi = %vmi.key(), "Launcher not initialized yet");
            return Ok(SyncOutcome::requeue_secs(
                LAUNCHER_NOT_READY_REQUEUE_SECS,
                "launcher_not_initialized",
            ));
        }
        LauncherStatus::Unresponsive => return Err(LauncherError::Unresponsive.into()),
        LauncherStatus::Ready(client) => client,
    };

    let Some(state) = vmi.migration_state() else {
        return Ok(SyncOutcome::done());
    };

    if state.abort_requested {
        return abort_migration(ctx, vmi, state, client.as_ref()).await;
    }

    if domain.is_migration_in_progress(&state.migration_uid) {
        debug!(vmi = %vmi.key(), "Migration already in progress");
        return Ok(SyncOutcome::done());
    }

    if !state.has_target_ports() {
        debug!(vmi = %vmi.key(), "Waiting for the target to publish its listener ports");
        return Ok(SyncOutcome::requeue_secs(
            TARGET_PORTS_REQUEUE_SECS,
            "waiting_for_target_ports",
        ));
    }

    let pid = ctx
        .collaborators
        .isolation
        .launcher_pid(vmi)
        .await
        .context("failed to detect launcher isolation")?;
    let work_dir = ctx.launcher_run_dir(pid).join(LAUNCHER_WORK_DIR);
    let target_address = state.target_node_address.as_deref().unwrap_or_default();

    ctx.tunnels
        .start_source_listener(
            vmi.uid_str(),
            target_address,
            &state.target_direct_migration_node_ports,
            &work_dir,
        )
        .context("failed to handle migration proxy")?;

    let options = MigrationOptions::resolve(vmi, &ctx.cluster_migration_config)?;
    info!(vmi = %vmi.key(), options = ?options, "Migration options matched");

    client.migrate(vmi, &options).await?;
    metrics::record_migration(ROLE, "started");
    ctx.collaborators
        .recorder
        .record(vmi, EventType::Normal, REASON_MIGRATING, MSG_MIGRATING)
        .await;
    Ok(SyncOutcome::done())
}

async fn abort_migration(
    ctx: &Context,
    vmi: &VirtualMachineInstance,
    state: &MigrationState,
    client: &dyn LauncherClient,
) -> Result<SyncOutcome> {
    if state.abort_in_flight() {
        return Ok(SyncOutcome::done());
    }

    match client.cancel_migration(vmi).await {
        Ok(()) => {}
        Err(LauncherError::NotMigrating) => {
            info!(vmi = %vmi.key(), "Skipping migration cancellation, the VMI is not migrating");
            return Ok(SyncOutcome::done());
        }
        Err(e) => return Err(e.into()),
    }

    info!(vmi = %vmi.key(), "Signaled migration to be aborted");
    metrics::record_migration(ROLE, "aborted");
    ctx.collaborators
        .recorder
        .record(vmi, EventType::Normal, REASON_MIGRATING, MSG_ABORTING_MIGRATION)
        .await;
    Ok(SyncOutcome::done())
}

/// Copy the hypervisor's progress for this migration attempt into the state.
///
/// Returns the failure reason when the hypervisor newly reported a failure.
fn mirror_migration_progress(
    vmi: &mut VirtualMachineInstance,
    domain: Option<&Domain>,
) -> Option<String> {
    let state = vmi.migration_state_mut()?;
    let metadata = domain?.migration_for(&state.migration_uid)?;

    let newly_failed = metadata.failed && !state.failed;
    state.start_timestamp = metadata.start_timestamp;
    state.failed = metadata.failed;
    if metadata.failed {
        state.end_timestamp = metadata.end_timestamp;
        state.failure_reason.clone_from(&metadata.failure_reason);
    }
    state.abort_status = metadata.abort_status;
    if metadata.abort_status == Some(MigrationAbortStatus::Succeeded) {
        state.end_timestamp = metadata.end_timestamp;
    }
    state.mode = metadata.mode;

    newly_failed.then(|| metadata.failure_reason.clone().unwrap_or_default())
}

fn mark_failed(vmi: &mut VirtualMachineInstance, now: DateTime<Utc>) {
    let status = vmi.status_mut();
    status.phase = Some(VmiPhase::Failed);
    if let Some(state) = status.migration_state.as_mut() {
        state.completed = true;
        state.failed = true;
        state.end_timestamp.get_or_insert(now);
    }
}

async fn update_source_status(
    ctx: &Context,
    vmi: &mut VirtualMachineInstance,
    domain: Option<&Domain>,
) -> SyncOutcome {
    if let Some(reason) = mirror_migration_progress(vmi, domain) {
        let migration_uid = vmi
            .migration_state()
            .map(|s| s.migration_uid.clone())
            .unwrap_or_default();
        warn!(vmi = %vmi.key(), migration = %migration_uid, reason = %reason, "Migration failed");
        metrics::record_migration(ROLE, "failed");
        ctx.collaborators
            .recorder
            .record(
                vmi,
                EventType::Warning,
                REASON_MIGRATED,
                &migration_failed_message(&migration_uid, &reason),
            )
            .await;
    }

    let Some(state) = vmi.migration_state() else {
        return SyncOutcome::done();
    };

    // Without a target host ownership cannot move anywhere, even after a failed attempt
    let now = Utc::now();
    if state.target_node.as_deref().unwrap_or_default().is_empty() {
        mark_failed(vmi, now);
        error!(vmi = %vmi.key(), "The VMI migrated to an unknown host");
        metrics::record_migration(ROLE, "failed");
        ctx.collaborators
            .recorder
            .record(vmi, EventType::Warning, REASON_MIGRATED, MSG_MIGRATED_TO_UNKNOWN_HOST)
            .await;
        return SyncOutcome::done();
    }

    // A failed attempt leaves the VM running here, no target domain will show up
    if state.failed {
        return SyncOutcome::done();
    }

    match target_detection(state, now) {
        TargetDetection::NotEnded | TargetDetection::Ready => SyncOutcome::done(),
        TargetDetection::Waiting(left) => {
            debug!(vmi = %vmi.key(), left = ?left, "Waiting for the target to report the migrated domain");
            SyncOutcome::requeue(left, "waiting_for_target_domain")
        }
        TargetDetection::Expired => {
            mark_failed(vmi, now);
            error!(vmi = %vmi.key(), "The migrated domain was never observed on the target");
            metrics::record_migration(ROLE, "failed");
            ctx.collaborators
                .recorder
                .record(vmi, EventType::Warning, REASON_MIGRATED, MSG_TARGET_DOMAIN_NOT_DETECTED)
                .await;
            SyncOutcome::done()
        }
    }
}
