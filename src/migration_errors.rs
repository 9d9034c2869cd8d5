// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Error types for live migration handling.
//!
//! This module provides specialized error types for:
//! - Tunnel lifecycle (listener binding, TLS material, shutdown fencing)
//! - Calls into the launcher's command channel
//! - Writes to the shared VMI record
//! - Migration preconditions checked on the target (hotplug, listener state)
//!
//! Transient waits (target ports not yet published, disks not ready) are not
//! errors; the controllers express them as requeue delays instead.

use thiserror::Error;

/// Errors from the migration tunnel manager.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// A new tunnel was requested after graceful shutdown began
    ///
    /// Tunnels that were already open keep working until they are stopped.
    #[error("unable to process new migration connections during virt-handler shutdown")]
    ShuttingDown,

    /// A listener could not be bound
    #[error("failed to bind migration listener on {endpoint}: {source}")]
    Bind {
        /// Socket path or `address:port` that failed to bind
        endpoint: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Certificates or keys for mutual TLS could not be loaded
    #[error("invalid migration TLS configuration: {0}")]
    Tls(String),

    /// Any other I/O failure while setting up a tunnel
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors returned by the launcher command channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LauncherError {
    /// A cancel was requested but the hypervisor has no migration running
    #[error("vmi is not currently migrating")]
    NotMigrating,

    /// The command server stopped answering
    #[error("Can not update a VirtualMachineInstance with unresponsive command server.")]
    Unresponsive,

    /// The launcher reported a failure for an operation
    #[error("{operation} failed: {reason}")]
    Call {
        /// Operation name, e.g. `migrate`
        operation: String,
        /// Reason reported by the launcher
        reason: String,
    },
}

/// Errors from writing the VMI back to the cluster store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The stored object changed since it was read (optimistic concurrency)
    #[error("VirtualMachineInstance {key} was modified concurrently")]
    Conflict {
        /// `namespace/name` of the VMI
        key: String,
    },

    /// The VMI no longer exists
    #[error("VirtualMachineInstance {key} not found")]
    NotFound {
        /// `namespace/name` of the VMI
        key: String,
    },

    /// Any other API failure
    #[error("failed to update VirtualMachineInstance {key}: {reason}")]
    Api {
        /// `namespace/name` of the VMI
        key: String,
        /// Error reported by the API server or client
        reason: String,
    },
}

/// Errors raised by the migration state machines themselves.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MigrationError {
    /// The target has no live listener to advertise
    #[error("target migration listener is not up for this vmi")]
    TargetListenerNotUp,

    /// The dedicated CPU limit label is missing or empty
    #[error("cannot read CPU limit from VMI label")]
    MissingCpuLimit,

    /// The dedicated CPU limit label is not an integer
    #[error("cannot parse CPU limit from VMI label: {0}")]
    InvalidCpuLimit(String),

    /// More vCPUs were requested than the target pod may use
    #[error("number of requested VCPUS ({requested}) exceeds the limit ({limit})")]
    VcpusExceedLimit {
        /// Requested vCPUs
        requested: u64,
        /// CPU limit of the target pod
        limit: u64,
    },

    /// The pod memory request label could not be parsed
    #[error("cannot parse Memory requests from VMI label: {0}")]
    InvalidMemoryRequest(String),

    /// The guest needs more memory than the target pod requested
    #[error("amount of requested guest memory ({guest}) exceeds the launcher memory request ({request})")]
    GuestMemoryExceedsRequest {
        /// Requested guest memory quantity
        guest: String,
        /// Launcher pod memory request quantity
        request: String,
    },

    /// A resource quantity could not be parsed
    #[error("invalid quantity '{value}': {reason}")]
    InvalidQuantity {
        /// The offending value
        value: String,
        /// Why it was rejected
        reason: String,
    },

    /// A cpuset line could not be parsed
    #[error("failed to parse target VMI cpuset '{value}': {reason}")]
    InvalidCpuSet {
        /// The offending cpuset line
        value: String,
        /// Why it was rejected
        reason: String,
    },
}
