// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Local hypervisor domain snapshots and the node-local domain cache.
//!
//! A [`Domain`] is the hypervisor driver's view of a running VM process on this
//! node. The migration controllers only ever read it; the driver publishes new
//! snapshots into a [`DomainCache`] and the controllers are woken through
//! [`SharedDomainCache::subscribe`].

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::crd::{MigrationAbortStatus, MigrationMode};

/// Capacity of the change notification channel.
const DOMAIN_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Hypervisor state of a domain.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum DomainStatus {
    #[default]
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    PMSuspended,
}

/// Why a domain is in its current [`DomainStatus`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum DomainReason {
    /// Shut off because the domain moved to another node.
    Migrated,
    /// Paused on request of the user.
    PausedUser,
    /// Paused by the hypervisor while migrating.
    PausedMigration,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Migration metadata the hypervisor attaches to a domain.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationMetadata {
    /// Migration attempt this metadata belongs to.
    pub uid: String,
    #[serde(default)]
    pub start_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub abort_status: Option<MigrationAbortStatus>,
    #[serde(default)]
    pub mode: Option<MigrationMode>,
}

/// Snapshot of a hypervisor domain.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Domain {
    pub namespace: String,
    pub name: String,
    /// UID of the VMI this domain was started for.
    pub uid: String,
    #[serde(default)]
    pub status: DomainStatus,
    #[serde(default)]
    pub reason: DomainReason,
    #[serde(default)]
    pub migration: Option<MigrationMetadata>,
}

impl Domain {
    /// Cache key of this domain: `namespace/name`, the same key as its VMI.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// The VM process exists and has not stopped.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !matches!(
            self.status,
            DomainStatus::Shutoff | DomainStatus::Crashed | DomainStatus::NoState
        )
    }

    /// Active on the receiving node: running, or paused by the user.
    #[must_use]
    pub fn is_active_on_target(&self) -> bool {
        match self.status {
            DomainStatus::Running => true,
            DomainStatus::Paused => self.reason == DomainReason::PausedUser,
            _ => false,
        }
    }

    /// Shut off because it moved to another node.
    #[must_use]
    pub fn has_migrated(&self) -> bool {
        self.status == DomainStatus::Shutoff && self.reason == DomainReason::Migrated
    }

    /// Migration metadata, but only when it belongs to the given migration attempt.
    #[must_use]
    pub fn migration_for(&self, migration_uid: &str) -> Option<&MigrationMetadata> {
        self.migration
            .as_ref()
            .filter(|metadata| metadata.uid == migration_uid)
    }

    /// The given migration attempt was already started by the hypervisor.
    #[must_use]
    pub fn is_migration_in_progress(&self, migration_uid: &str) -> bool {
        self.migration_for(migration_uid)
            .is_some_and(|metadata| metadata.start_timestamp.is_some())
    }
}

/// Read access to the domains known on this node.
pub trait DomainCache: Send + Sync {
    /// Domain stored under `namespace/name`, if any.
    fn get(&self, key: &str) -> Option<Domain>;

    fn list(&self) -> Vec<Domain>;

    /// Drop this node's record of a domain after local cleanup.
    fn remove(&self, key: &str);
}

/// In-memory [`DomainCache`] fed by the hypervisor driver's notifications.
///
/// Every change publishes the affected key so controllers can re-run the
/// reconciliation of the matching VMI.
pub struct SharedDomainCache {
    domains: RwLock<HashMap<String, Domain>>,
    changes: broadcast::Sender<String>,
}

impl Default for SharedDomainCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedDomainCache {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(DOMAIN_EVENT_CHANNEL_CAPACITY);
        Self {
            domains: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Insert or replace a domain snapshot.
    pub fn upsert(&self, domain: Domain) {
        let key = domain.key();
        debug!(domain = %key, status = ?domain.status, reason = ?domain.reason, "Domain snapshot updated");
        self.domains
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key.clone(), domain);
        // No subscribers is not an error
        let _ = self.changes.send(key);
    }

    /// Receiver of changed domain keys.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }

    /// One item per domain change, for triggering controller resyncs.
    ///
    /// Changes missed by a slow consumer collapse into a single item; the stream
    /// ends when the cache is dropped.
    pub fn change_triggers(&self) -> impl Stream<Item = ()> + Send + Sync + 'static {
        futures::stream::unfold(self.subscribe(), |mut changes| async move {
            match changes.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => Some(((), changes)),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        })
    }
}

impl DomainCache for SharedDomainCache {
    fn get(&self, key: &str) -> Option<Domain> {
        self.domains
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn list(&self) -> Vec<Domain> {
        self.domains
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn remove(&self, key: &str) {
        let removed = self
            .domains
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key);
        if removed.is_some() {
            debug!(domain = %key, "Domain record removed");
            let _ = self.changes.send(key.to_string());
        }
    }
}
