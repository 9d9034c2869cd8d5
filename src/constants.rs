// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Global constants for the handoff migration agent.
//!
//! This module contains all numeric and string constants used throughout the codebase.
//! Constants are organized by category for easy maintenance.

// ============================================================================
// API Constants
// ============================================================================

/// API group of the `VirtualMachineInstance` resource
pub const API_GROUP: &str = "kubevirt.io";

/// API version of the `VirtualMachineInstance` resource
pub const API_VERSION: &str = "v1";

/// Fully qualified API version (group/version)
pub const API_GROUP_VERSION: &str = "kubevirt.io/v1";

/// Kind name for `VirtualMachineInstance` resource
pub const KIND_VIRTUAL_MACHINE_INSTANCE: &str = "VirtualMachineInstance";

/// Name reported as the `reportingController` of recorded events
pub const EVENT_REPORTING_CONTROLLER: &str = "kubevirt.io/virt-handler";

// ============================================================================
// Migration Channel Constants
// ============================================================================

/// Channel key of the hypervisor control connection in a ports map
pub const CONTROL_CHANNEL: &str = "0";

/// Port the hypervisor uses for the direct memory transfer channel
pub const DIRECT_MIGRATION_PORT: u16 = 49152;

/// Port the hypervisor uses for the block (disk) transfer channel
pub const BLOCK_MIGRATION_PORT: u16 = 49153;

/// Number of parallel transfer threads requested when nothing forbids them
pub const PARALLEL_MIGRATION_THREADS: u32 = 8;

/// Directory (relative to a launcher working directory) holding source-side proxy sockets
pub const MIGRATION_PROXY_DIR: &str = "migrationproxy";

/// Hypervisor control socket path, relative to a launcher run directory
pub const HYPERVISOR_CONTROL_SOCKET: &str = "libvirt/virtqemud-sock";

/// Launcher working directory, relative to a launcher run directory
pub const LAUNCHER_WORK_DIR: &str = "kubevirt";

/// Time a tunnel connection has to finish its TLS handshake and reach the local socket
pub const TUNNEL_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// Migration Timing Constants
// ============================================================================

/// Time the target is given to observe a migrated domain after the migration ended
pub const TARGET_DOMAIN_DETECTION_TIMEOUT_SECS: i64 = 60;

/// Lower bound on the requeue delay while waiting for target domain detection
pub const MIN_DETECTION_REQUEUE_SECS: u64 = 5;

/// Requeue delay while the launcher command channel is not initialised
pub const LAUNCHER_NOT_READY_REQUEUE_SECS: u64 = 1;

/// Requeue delay while the target has not published its listener ports
pub const TARGET_PORTS_REQUEUE_SECS: u64 = 1;

/// Requeue delay while container disks are not ready on the target
pub const DISKS_NOT_READY_REQUEUE_SECS: u64 = 1;

/// Requeue delay after signalling a failed target pod to clean up
pub const FAILED_TARGET_REQUEUE_SECS: u64 = 1;

/// Requeue delay while a failed post-copy migration keeps the local domain alive
pub const POSTCOPY_CLEANUP_DEFER_SECS: u64 = 5;

// ============================================================================
// Migration Configuration Defaults
// ============================================================================

/// Default bandwidth cap per migration (`0Mi` means unlimited)
pub const DEFAULT_BANDWIDTH_PER_MIGRATION: &str = "0Mi";

/// Default progress timeout in seconds
pub const DEFAULT_PROGRESS_TIMEOUT_SECS: i64 = 150;

/// Default completion timeout per GiB of guest memory in seconds
pub const DEFAULT_COMPLETION_TIMEOUT_PER_GIB_SECS: i64 = 150;

// ============================================================================
// Retry Engine Defaults
// ============================================================================

/// Name of the retry engine throttling repeated reconciliation failures
pub const FAIL_RETRY_ENGINE_NAME: &str = "io-error-retry";

/// First backoff interval once a failure repeats
pub const FAIL_RETRY_INITIAL_WAIT_SECS: u64 = 10;

/// Upper bound of the backoff interval, also the sweep period
pub const FAIL_RETRY_MAX_WAIT_SECS: u64 = 180;

/// Window in which a new failure is attributed to the previous one
pub const FAIL_RETRY_MAX_FAIL_RESPONSE_SECS: u64 = 30;

// ============================================================================
// Controller Constants
// ============================================================================

/// Worker threads of the daemon runtime
pub const TOKIO_WORKER_THREADS: usize = 4;

/// Period at which graceful shutdown re-checks open tunnel listeners
pub const SHUTDOWN_POLL_INTERVAL_SECS: u64 = 10;

/// Default graceful shutdown timeout
pub const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 300;

// ============================================================================
// Metrics Server Constants
// ============================================================================

/// Default metrics server port
pub const METRICS_SERVER_PORT: u16 = 8443;

/// Default metrics server bind address
pub const METRICS_SERVER_BIND_ADDRESS: &str = "0.0.0.0";

/// Metrics endpoint path
pub const METRICS_SERVER_PATH: &str = "/metrics";

/// Default address tunnel listeners bind to on the target
pub const DEFAULT_TUNNEL_LISTEN_ADDRESS: &str = "0.0.0.0";
