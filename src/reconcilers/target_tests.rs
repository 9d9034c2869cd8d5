// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for the migration target controller.

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};
    use kube::ResourceExt;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use crate::crd::{
        Condition, CpuSpec, CpuTopology, Interface, MigratedVolume, MigrationMethod, MigrationMode,
        MigrationState, MigrationTransport, PersistentVolumeClaimInfo, VirtualMachineInstance,
    };
    use crate::domain::{DomainCache, DomainReason, DomainStatus};
    use crate::labels::{
        MIGRATION_TARGET_NODE_NAME_LABEL, NODE_NAME_LABEL, OUTDATED_LAUNCHER_IMAGE_LABEL,
    };
    use crate::reconcilers::sync_target;
    use crate::reconcilers::test_support::{
        domain, migrating_vmi, migration_metadata, migration_state, Harness, LauncherState,
        VMI_UID,
    };
    use crate::reconcilers::SyncOutcome;
    use crate::status_reasons::{
        migrated_to_node_message, target_listening_message, CONDITION_VOLUMES_CHANGE,
        MSG_TARGET_PREPARED, REASON_MIGRATED, REASON_PREPARING_TARGET,
    };
    use crate::store::EventType;

    const SOURCE: &str = "node-a";
    const HOST: &str = "node-b";

    fn target_vmi(state: MigrationState) -> VirtualMachineInstance {
        migrating_vmi(SOURCE, HOST, state)
    }

    /// Listeners as a previous sync would have left them.
    fn start_listeners(harness: &Harness) -> BTreeMap<String, i32> {
        let sockets = BTreeMap::from([(
            "0".to_string(),
            harness.run_root.path().join("virtqemud-sock"),
        )]);
        harness
            .ctx
            .tunnels
            .start_target_listener(VMI_UID, &sockets)
            .unwrap();
        harness.ctx.tunnels.get_target_listener_ports(VMI_UID)
    }

    fn ended_state() -> MigrationState {
        let mut state = migration_state(SOURCE, HOST);
        state.start_timestamp = Some(Utc::now() - ChronoDuration::seconds(30));
        state.end_timestamp = Some(Utc::now());
        state
    }

    // ========== preparation ==========

    #[tokio::test]
    async fn test_prepares_target_and_publishes_ports() {
        let harness = Harness::new(HOST);
        let mut vmi = target_vmi(migration_state(SOURCE, HOST));
        vmi.spec.domain.devices.interfaces = vec![
            Interface {
                name: "default".to_string(),
                binding: None,
            },
            Interface {
                name: "secondary".to_string(),
                binding: Some("passt".to_string()),
            },
        ];

        let outcome = sync_target(harness.ctx.clone(), vmi).await.unwrap();

        assert_eq!(outcome, SyncOutcome::done());
        assert_eq!(
            harness.node.calls(),
            vec!["setup_network", "mount", "setup_devices"]
        );
        assert_eq!(
            harness.launcher.calls(),
            vec!["sync_migration_target".to_string()]
        );
        let options = harness.launcher.last_options.lock().unwrap().clone().unwrap();
        assert_eq!(
            options.interface_bindings,
            BTreeMap::from([("secondary".to_string(), "passt".to_string())])
        );

        let ports = harness.ctx.tunnels.get_target_listener_ports(VMI_UID);
        assert_eq!(
            ports.keys().cloned().collect::<Vec<_>>(),
            vec!["0".to_string(), "49152".to_string()]
        );

        let written = harness.store.last_write().unwrap();
        let state = written.migration_state().unwrap();
        assert_eq!(state.target_node_address.as_deref(), Some("127.0.0.1"));
        assert_eq!(state.target_direct_migration_node_ports, ports);

        assert!(harness
            .recorder
            .has(EventType::Normal, REASON_PREPARING_TARGET, MSG_TARGET_PREPARED));
        assert!(harness.recorder.has(
            EventType::Normal,
            REASON_PREPARING_TARGET,
            &target_listening_message("127.0.0.1", ports.keys())
        ));
    }

    #[tokio::test]
    async fn test_block_migration_adds_block_channel() {
        let harness = Harness::new(HOST);
        let mut vmi = target_vmi(migration_state(SOURCE, HOST));
        vmi.status.as_mut().unwrap().migration_method = Some(MigrationMethod::BlockMigration);

        sync_target(harness.ctx.clone(), vmi).await.unwrap();

        let channels: Vec<String> = harness
            .ctx
            .tunnels
            .get_target_listener_ports(VMI_UID)
            .into_keys()
            .collect();
        assert_eq!(channels, vec!["0", "49152", "49153"]);
    }

    #[tokio::test]
    async fn test_hotplug_volumes_are_mounted() {
        let harness = Harness::new(HOST);
        let mut state = migration_state(SOURCE, HOST);
        state.target_attachment_pod_uid = Some("attachment-pod".to_string());

        sync_target(harness.ctx.clone(), target_vmi(state)).await.unwrap();

        assert!(harness
            .node
            .calls()
            .contains(&"mount_hotplug:attachment-pod".to_string()));
    }

    #[tokio::test]
    async fn test_container_disks_not_ready_requeues() {
        let harness = Harness::new(HOST);
        *harness.node.disks_ready.lock().unwrap() = false;

        let outcome = sync_target(harness.ctx.clone(), target_vmi(migration_state(SOURCE, HOST)))
            .await
            .unwrap();

        assert_eq!(outcome.requeue_after, Some(Duration::from_secs(1)));
        assert!(harness.launcher.calls().is_empty());
        assert_eq!(harness.ctx.tunnels.open_listener_count(), 0);
    }

    #[tokio::test]
    async fn test_launcher_not_initialized_requeues() {
        let harness = Harness::new(HOST);
        harness.set_launcher(LauncherState::NotInitialized);

        let outcome = sync_target(harness.ctx.clone(), target_vmi(migration_state(SOURCE, HOST)))
            .await
            .unwrap();

        assert_eq!(outcome.requeue_after, Some(Duration::from_secs(1)));
        assert!(harness.node.calls().is_empty());
    }

    #[tokio::test]
    async fn test_vmi_labelled_for_other_node_is_ignored() {
        let harness = Harness::new("node-c");

        sync_target(harness.ctx.clone(), target_vmi(migration_state(SOURCE, HOST)))
            .await
            .unwrap();

        assert!(harness.node.calls().is_empty());
        assert_eq!(harness.store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_dedicated_cpus_are_published() {
        let harness = Harness::new(HOST);
        let mut vmi = target_vmi(migration_state(SOURCE, HOST));
        vmi.spec.domain.cpu = Some(CpuSpec {
            topology: CpuTopology {
                cores: Some(2),
                ..Default::default()
            },
            dedicated_cpu_placement: true,
        });

        sync_target(harness.ctx.clone(), vmi).await.unwrap();

        let written = harness.store.last_write().unwrap();
        let state = written.migration_state().unwrap();
        assert_eq!(state.target_cpu_set, vec![2, 3]);
        assert_eq!(
            state.target_node_topology.as_deref(),
            Some(r#"{"cells":[{"id":0}]}"#)
        );
    }

    #[tokio::test]
    async fn test_migrated_volumes_are_substituted_for_preparation() {
        let harness = Harness::new(HOST);
        let mut vmi = target_vmi(migration_state(SOURCE, HOST));
        vmi.status.as_mut().unwrap().migrated_volumes = vec![MigratedVolume {
            volume_name: "disk0".to_string(),
            source_pvc_info: Some(PersistentVolumeClaimInfo {
                claim_name: "old-claim".to_string(),
            }),
            destination_pvc_info: Some(PersistentVolumeClaimInfo {
                claim_name: "new-claim".to_string(),
            }),
        }];

        sync_target(harness.ctx.clone(), vmi).await.unwrap();

        // The published status keeps the real volume status
        let written = harness.store.last_write().unwrap();
        assert!(written.status.as_ref().unwrap().volume_status.is_empty());
        assert_eq!(written.status.as_ref().unwrap().migrated_volumes.len(), 1);
    }

    // ========== detection and ownership ==========

    #[tokio::test]
    async fn test_ready_timestamp_is_set_once() {
        let harness = Harness::new(HOST);
        harness.domains.upsert(domain(DomainStatus::Running, None));
        let mut state = migration_state(SOURCE, HOST);
        state.start_timestamp = Some(Utc::now());

        sync_target(harness.ctx.clone(), target_vmi(state)).await.unwrap();

        let first = harness.store.last_write().unwrap();
        let ready = first
            .migration_state()
            .unwrap()
            .target_node_domain_ready_timestamp;
        assert!(first.migration_state().unwrap().target_node_domain_detected);
        assert!(ready.is_some());

        // Same snapshot again: nothing moves, nothing is written
        sync_target(harness.ctx.clone(), first).await.unwrap();
        assert_eq!(harness.store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_paused_for_migration_is_detected_but_not_ready() {
        let harness = Harness::new(HOST);
        let mut paused = domain(DomainStatus::Paused, None);
        paused.reason = DomainReason::PausedMigration;
        harness.domains.upsert(paused);
        let mut state = migration_state(SOURCE, HOST);
        state.start_timestamp = Some(Utc::now());

        sync_target(harness.ctx.clone(), target_vmi(state)).await.unwrap();

        let written = harness.store.last_write().unwrap();
        let state = written.migration_state().unwrap();
        assert!(state.target_node_domain_detected);
        assert!(state.target_node_domain_ready_timestamp.is_none());
    }

    #[tokio::test]
    async fn test_takes_ownership_after_domain_is_ready() {
        let harness = Harness::new(HOST);
        let ports = start_listeners(&harness);
        let end = Utc::now();
        let mut metadata = migration_metadata();
        metadata.start_timestamp = Some(end - ChronoDuration::seconds(30));
        metadata.end_timestamp = Some(end);
        harness
            .domains
            .upsert(domain(DomainStatus::Running, Some(metadata)));

        let mut state = migration_state(SOURCE, HOST);
        state.start_timestamp = Some(end - ChronoDuration::seconds(30));
        let mut vmi = target_vmi(state);
        vmi.labels_mut()
            .insert(OUTDATED_LAUNCHER_IMAGE_LABEL.to_string(), String::new());
        vmi.status.as_mut().unwrap().launcher_container_image_version = Some("v1".to_string());

        sync_target(harness.ctx.clone(), vmi).await.unwrap();

        let written = harness.store.last_write().unwrap();
        let status = written.status.as_ref().unwrap();
        assert_eq!(status.node_name.as_deref(), Some(HOST));
        assert_eq!(status.migration_transport, Some(MigrationTransport::Unix));
        assert!(status.launcher_container_image_version.is_none());
        assert_eq!(written.labels().get(NODE_NAME_LABEL).map(String::as_str), Some(HOST));
        assert!(!written.labels().contains_key(OUTDATED_LAUNCHER_IMAGE_LABEL));

        let state = written.migration_state().unwrap();
        assert_eq!(state.end_timestamp, Some(end));
        assert!(state.target_domain_ready());
        assert_eq!(state.target_direct_migration_node_ports, ports);
        // Completion is left to the next sync
        assert!(!state.completed);

        assert!(harness.recorder.has(
            EventType::Normal,
            REASON_MIGRATED,
            &migrated_to_node_message(HOST)
        ));
    }

    #[tokio::test]
    async fn test_no_ownership_before_domain_is_active() {
        let harness = Harness::new(HOST);
        start_listeners(&harness);
        let mut metadata = migration_metadata();
        metadata.start_timestamp = Some(Utc::now());
        metadata.end_timestamp = Some(Utc::now());
        let mut paused = domain(DomainStatus::Paused, Some(metadata));
        paused.reason = DomainReason::PausedMigration;
        harness.domains.upsert(paused);

        let mut state = migration_state(SOURCE, HOST);
        state.start_timestamp = Some(Utc::now());

        sync_target(harness.ctx.clone(), target_vmi(state)).await.unwrap();

        let written = harness.store.last_write().unwrap();
        assert_eq!(written.node_name(), Some(SOURCE));
        assert!(!harness.recorder.reasons().contains(&REASON_MIGRATED.to_string()));
    }

    // ========== finalization ==========

    #[tokio::test]
    async fn test_finalizes_after_ownership_moved() {
        let harness = Harness::new(HOST);
        start_listeners(&harness);
        harness.domains.upsert(domain(DomainStatus::Running, None));

        let mut state = ended_state();
        state.target_node_domain_detected = true;
        state.target_node_domain_ready_timestamp = Some(Utc::now());
        let mut vmi = target_vmi(state);
        let status = vmi.status.as_mut().unwrap();
        status.node_name = Some(HOST.to_string());
        status.migrated_volumes = vec![MigratedVolume {
            volume_name: "disk0".to_string(),
            ..Default::default()
        }];
        vmi.set_condition(Condition {
            r#type: CONDITION_VOLUMES_CHANGE.to_string(),
            status: "True".to_string(),
            ..Default::default()
        });

        sync_target(harness.ctx.clone(), vmi).await.unwrap();

        assert_eq!(
            harness.launcher.calls(),
            vec!["finalize_migration".to_string()]
        );
        let written = harness.store.last_write().unwrap();
        assert!(written.migration_state().unwrap().completed);
        assert!(written.migration_state().unwrap().is_done());
        assert!(!written.labels().contains_key(MIGRATION_TARGET_NODE_NAME_LABEL));
        assert!(written.status.as_ref().unwrap().migrated_volumes.is_empty());
        assert!(!written.has_condition(CONDITION_VOLUMES_CHANGE));
    }

    #[tokio::test]
    async fn test_finalization_waits_for_ownership() {
        let harness = Harness::new(HOST);
        start_listeners(&harness);
        harness.domains.upsert(domain(DomainStatus::Running, None));

        let mut state = ended_state();
        state.target_node_domain_detected = true;
        state.target_node_domain_ready_timestamp = Some(Utc::now());

        sync_target(harness.ctx.clone(), target_vmi(state)).await.unwrap();

        assert!(harness.launcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_hotplug_failure_does_not_block_finalization() {
        let harness = Harness::new(HOST);
        start_listeners(&harness);
        harness.domains.upsert(domain(DomainStatus::Running, None));

        let mut state = ended_state();
        state.target_node_domain_detected = true;
        state.target_node_domain_ready_timestamp = Some(Utc::now());
        let mut vmi = target_vmi(state);
        vmi.status.as_mut().unwrap().node_name = Some(HOST.to_string());
        vmi.spec.domain.cpu = Some(CpuSpec {
            topology: CpuTopology::default(),
            dedicated_cpu_placement: true,
        });
        vmi.set_condition(Condition {
            r#type: crate::status_reasons::CONDITION_VCPU_CHANGE.to_string(),
            status: "True".to_string(),
            ..Default::default()
        });

        sync_target(harness.ctx.clone(), vmi).await.unwrap();

        assert!(harness.recorder.has(
            EventType::Warning,
            crate::status_reasons::REASON_CPU_HOTPLUG_FAILED,
            "failed to change vCPUs: cannot read CPU limit from VMI label"
        ));
        assert_eq!(
            harness.launcher.calls(),
            vec!["finalize_migration".to_string()]
        );
        assert!(harness.store.last_write().unwrap().migration_state().unwrap().completed);
    }

    // ========== failure and cleanup ==========

    #[tokio::test]
    async fn test_failed_migration_signals_cleanup() {
        let harness = Harness::new(HOST);
        let mut state = migration_state(SOURCE, HOST);
        state.start_timestamp = Some(Utc::now());
        state.failed = true;

        let outcome = sync_target(harness.ctx.clone(), target_vmi(state)).await.unwrap();

        assert_eq!(outcome.requeue_after, Some(Duration::from_secs(1)));
        assert_eq!(
            harness.launcher.calls(),
            vec!["signal_target_pod_cleanup".to_string()]
        );
        assert_eq!(harness.store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_done_failed_migration_cleans_up_target() {
        let harness = Harness::new(HOST);
        start_listeners(&harness);
        harness.domains.upsert(domain(DomainStatus::Shutoff, None));
        let mut state = ended_state();
        state.failed = true;

        sync_target(harness.ctx.clone(), target_vmi(state)).await.unwrap();

        assert_eq!(harness.ctx.tunnels.open_listener_count(), 0);
        assert_eq!(
            harness.launcher.calls(),
            vec!["signal_target_pod_cleanup".to_string()]
        );
        assert_eq!(harness.node.calls(), vec!["unmount_all", "teardown_network"]);
        assert!(harness.domains.list().is_empty());
        let written = harness.store.last_write().unwrap();
        assert!(!written.labels().contains_key(MIGRATION_TARGET_NODE_NAME_LABEL));
    }

    #[tokio::test]
    async fn test_failed_post_copy_cleanup_is_deferred() {
        let harness = Harness::new(HOST);
        start_listeners(&harness);
        harness.domains.upsert(domain(DomainStatus::Running, None));
        let mut state = ended_state();
        state.failed = true;
        state.mode = Some(MigrationMode::PostCopy);

        let outcome = sync_target(harness.ctx.clone(), target_vmi(state)).await.unwrap();

        assert_eq!(outcome.requeue_after, Some(Duration::from_secs(5)));
        assert!(harness.node.calls().is_empty());
        assert_eq!(harness.store.write_count(), 0);
        assert_eq!(harness.domains.list().len(), 1);
    }

    #[tokio::test]
    async fn test_done_successful_migration_closes_listeners() {
        let harness = Harness::new(HOST);
        start_listeners(&harness);
        harness.domains.upsert(domain(DomainStatus::Running, None));
        let mut state = ended_state();
        state.completed = true;
        let mut vmi = target_vmi(state);
        vmi.labels_mut().remove(MIGRATION_TARGET_NODE_NAME_LABEL);
        vmi.status.as_mut().unwrap().node_name = Some(HOST.to_string());

        sync_target(harness.ctx.clone(), vmi).await.unwrap();

        assert_eq!(harness.ctx.tunnels.open_listener_count(), 0);
        assert!(harness.node.calls().is_empty());
        assert_eq!(harness.store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_done_migration_elsewhere_is_ignored() {
        let harness = Harness::new("node-c");
        let mut state = ended_state();
        state.completed = true;

        sync_target(harness.ctx.clone(), target_vmi(state)).await.unwrap();

        assert!(harness.launcher.calls().is_empty());
        assert_eq!(harness.store.write_count(), 0);
    }
}
