// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Command line and environment configuration of the migration handler daemon.
//!
//! Every option can be given as a flag or through the environment variable named
//! next to it, so the daemon can be configured from a `DaemonSet` manifest without
//! a wrapper script.

use clap::Parser;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    DEFAULT_GRACEFUL_SHUTDOWN_SECS, DEFAULT_TUNNEL_LISTEN_ADDRESS, FAIL_RETRY_INITIAL_WAIT_SECS,
    FAIL_RETRY_MAX_FAIL_RESPONSE_SECS, FAIL_RETRY_MAX_WAIT_SECS, METRICS_SERVER_BIND_ADDRESS,
    METRICS_SERVER_PORT, TOKIO_WORKER_THREADS,
};
use crate::crd::MigrationConfiguration;

/// Placeholder replaced by the launcher pid in [`HandlerConfig::launcher_run_dir_pattern`].
pub const PID_PLACEHOLDER: &str = "{pid}";

/// Default TLS server name expected in the peer certificate.
pub const DEFAULT_TLS_SERVER_NAME: &str = "migration.kubevirt.io";

/// Substitute `pid` into a launcher run directory pattern.
#[must_use]
pub fn expand_launcher_run_dir(pattern: &str, pid: u32) -> PathBuf {
    PathBuf::from(pattern.replace(PID_PLACEHOLDER, &pid.to_string()))
}

/// Node-local live migration handler.
#[derive(Parser, Debug, Clone)]
#[command(name = "virt-handoff", version, about)]
pub struct HandlerConfig {
    /// Name of the node this handler runs on
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// IP address of the handler pod
    #[arg(long, env = "POD_IP")]
    pub pod_ip: String,

    /// Address advertised to migration sources instead of the pod IP
    #[arg(long, env = "MIGRATION_IP")]
    pub migration_ip: Option<String>,

    /// Local address the target tunnel listeners bind to
    #[arg(long, env = "MIGRATION_LISTEN_ADDRESS", default_value = DEFAULT_TUNNEL_LISTEN_ADDRESS)]
    pub tunnel_listen_address: String,

    /// Path of a launcher's run directory as seen from this handler
    #[arg(long, env = "LAUNCHER_RUN_DIR_PATTERN", default_value = "/proc/{pid}/root/var/run")]
    pub launcher_run_dir_pattern: String,

    /// PEM certificate presented on migration tunnels
    #[arg(long, env = "MIGRATION_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key of the tunnel certificate
    #[arg(long, env = "MIGRATION_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// PEM bundle of the CA both tunnel ends are signed by
    #[arg(long, env = "MIGRATION_TLS_CA")]
    pub tls_ca: Option<PathBuf>,

    /// Relay migration traffic over plain TCP
    #[arg(long, env = "DISABLE_MIGRATION_TLS", default_value_t = false)]
    pub disable_migration_tls: bool,

    /// Server name checked against the peer certificate
    #[arg(long, env = "MIGRATION_TLS_SERVER_NAME", default_value = DEFAULT_TLS_SERVER_NAME)]
    pub tls_server_name: String,

    /// Seconds to wait for open tunnels to drain on shutdown
    #[arg(long, env = "GRACEFUL_SHUTDOWN_SECONDS", default_value_t = DEFAULT_GRACEFUL_SHUTDOWN_SECS)]
    pub graceful_shutdown_secs: u64,

    /// Tokio worker threads
    #[arg(long, env = "WORKER_THREADS", default_value_t = TOKIO_WORKER_THREADS)]
    pub worker_threads: usize,

    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = METRICS_SERVER_BIND_ADDRESS)]
    pub metrics_bind_address: String,

    #[arg(long, env = "METRICS_PORT", default_value_t = METRICS_SERVER_PORT)]
    pub metrics_port: u16,

    /// First backoff interval of the failure retry engine, in seconds
    #[arg(long, env = "FAIL_RETRY_INITIAL_WAIT", default_value_t = FAIL_RETRY_INITIAL_WAIT_SECS)]
    pub fail_retry_initial_wait_secs: u64,

    /// Backoff ceiling of the failure retry engine, in seconds
    #[arg(long, env = "FAIL_RETRY_MAX_WAIT", default_value_t = FAIL_RETRY_MAX_WAIT_SECS)]
    pub fail_retry_max_wait_secs: u64,

    /// Window in which a new failure counts as a repeat, in seconds
    #[arg(long, env = "FAIL_RETRY_MAX_FAIL_RESPONSE", default_value_t = FAIL_RETRY_MAX_FAIL_RESPONSE_SECS)]
    pub fail_retry_max_fail_response_secs: u64,

    /// Bandwidth cap per migration, e.g. `64Mi` (`0` is unlimited)
    #[arg(long, env = "MIGRATION_BANDWIDTH")]
    pub migration_bandwidth: Option<String>,

    /// Seconds without progress before a migration is aborted
    #[arg(long, env = "MIGRATION_PROGRESS_TIMEOUT")]
    pub migration_progress_timeout: Option<i64>,

    /// Seconds allowed per GiB of guest memory
    #[arg(long, env = "MIGRATION_COMPLETION_TIMEOUT_PER_GIB")]
    pub migration_completion_timeout_per_gib: Option<i64>,

    #[arg(long, env = "MIGRATION_UNSAFE_OVERRIDE")]
    pub unsafe_migration_override: Option<bool>,

    #[arg(long, env = "MIGRATION_ALLOW_AUTO_CONVERGE")]
    pub allow_auto_converge: Option<bool>,

    #[arg(long, env = "MIGRATION_ALLOW_POST_COPY")]
    pub allow_post_copy: Option<bool>,

    /// Defaults to the post-copy setting when unset
    #[arg(long, env = "MIGRATION_ALLOW_WORKLOAD_DISRUPTION")]
    pub allow_workload_disruption: Option<bool>,

    #[arg(long, env = "MIGRATION_PARALLEL_THREADS")]
    pub parallel_migration_threads: Option<u32>,
}

impl HandlerConfig {
    /// Address the target advertises for its tunnel listeners.
    #[must_use]
    pub fn migration_address(&self) -> &str {
        self.migration_ip
            .as_deref()
            .filter(|ip| !ip.is_empty())
            .unwrap_or(&self.pod_ip)
    }

    /// Cluster-wide migration tuning assembled from the migration flags.
    #[must_use]
    pub fn cluster_migration_configuration(&self) -> MigrationConfiguration {
        MigrationConfiguration {
            bandwidth_per_migration: self.migration_bandwidth.clone().map(Quantity),
            progress_timeout: self.migration_progress_timeout,
            completion_timeout_per_gib: self.migration_completion_timeout_per_gib,
            unsafe_migration_override: self.unsafe_migration_override,
            allow_auto_converge: self.allow_auto_converge,
            allow_post_copy: self.allow_post_copy,
            allow_workload_disruption: self.allow_workload_disruption,
            parallel_migration_threads: self.parallel_migration_threads,
        }
    }

    /// Run directory of the launcher with the given pid.
    #[must_use]
    pub fn launcher_run_dir(&self, pid: u32) -> PathBuf {
        expand_launcher_run_dir(&self.launcher_run_dir_pattern, pid)
    }

    /// Whether certificate paths are required.
    #[must_use]
    pub fn tls_enabled(&self) -> bool {
        !self.disable_migration_tls
    }

    #[must_use]
    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_secs)
    }

    /// Socket address of the metrics endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured bind address is not an IP address.
    pub fn metrics_address(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.metrics_bind_address, self.metrics_port)
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid metrics bind address: {e}"))
    }

    /// Retry engine parameters: `(initial_wait, max_wait, max_fail_response_time)`.
    #[must_use]
    pub fn fail_retry_parameters(&self) -> (Duration, Duration, Duration) {
        (
            Duration::from_secs(self.fail_retry_initial_wait_secs),
            Duration::from_secs(self.fail_retry_max_wait_secs),
            Duration::from_secs(self.fail_retry_max_fail_response_secs),
        )
    }
}
