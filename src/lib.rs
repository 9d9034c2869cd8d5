// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

#![allow(unexpected_cfgs)]

//! # Handoff - node-local live migration for Kubernetes virtual machines
//!
//! Handoff runs on every node of a KubeVirt-style cluster and carries out the
//! node-side half of a live migration. The cluster controller picks a source and
//! a target node and writes a `MigrationState` into the `VirtualMachineInstance`
//! status; from there on the two nodes cooperate only through that state.
//!
//! ## Overview
//!
//! - The **target** prepares a receiving launcher, opens one TCP listener per
//!   migration channel and publishes their ports.
//! - The **source** opens local unix sockets relaying to those ports and asks its
//!   hypervisor to migrate through them.
//! - Once the migrated domain runs on the target, the target takes ownership of
//!   the VMI and finalizes the migration; both sides close their tunnels.
//!
//! ## Modules
//!
//! - [`crd`] - `VirtualMachineInstance` and `MigrationState` types
//! - [`reconcilers`] - Source and target controllers
//! - [`tunnel`] - Migration tunnels (unix socket to TCP and back, optionally TLS)
//! - [`context`] - Shared context and collaborator traits wiring
//! - [`domain`] - Hypervisor domain snapshots and the node-local domain cache
//! - [`driver`] - Launcher command channel and migration options
//! - [`fail_retry`] - Backoff for keys that keep failing
//! - [`store`] - Cluster writes with optimistic concurrency, and events
//! - [`write_retry`] - Bounded retries for transient store errors
//!
//! ## Example
//!
//! ```rust,no_run
//! use handoff::crd::MigrationState;
//!
//! let state = MigrationState {
//!     migration_uid: "5f0c7d2e".to_string(),
//!     source_node: Some("node-a".to_string()),
//!     target_node: Some("node-b".to_string()),
//!     ..Default::default()
//! };
//!
//! assert!(!state.has_target_ports());
//! assert!(!state.is_done());
//! ```

pub mod config;
pub mod constants;
pub mod context;
pub mod crd;
pub mod domain;
pub mod driver;
pub mod fail_retry;
pub mod labels;
pub mod metrics;
pub mod migration_errors;
pub mod node;
pub mod reconcilers;
pub mod status_reasons;
pub mod store;
pub mod tunnel;
pub mod units;
pub mod write_retry;
