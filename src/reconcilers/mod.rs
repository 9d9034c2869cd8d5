// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Reconciliation of live migrations on this node.
//!
//! Every node runs two controllers over the same `VirtualMachineInstance` objects:
//!
//! - [`sync_source`] drives the node the VM is leaving. It opens the source
//!   tunnels, starts (or aborts) the hypervisor migration and mirrors the
//!   hypervisor's progress into the shared [`crate::crd::MigrationState`].
//! - [`sync_target`] drives the node the VM is moving to. It prepares the
//!   receiving launcher, publishes its listener ports, takes over ownership once
//!   the migrated domain is running and finally cleans up.
//!
//! Neither side talks to the other: both only read and write the migration
//! state of the VMI. A sync never blocks on the peer; it returns a
//! [`SyncOutcome`] asking to be requeued instead.
//!
//! # Example
//!
//! ```rust,no_run
//! use handoff::context::Context;
//! use handoff::crd::VirtualMachineInstance;
//! use handoff::reconcilers::sync_target;
//! use std::sync::Arc;
//!
//! async fn reconcile(ctx: Arc<Context>, vmi: VirtualMachineInstance) -> anyhow::Result<()> {
//!     let outcome = sync_target(ctx, vmi).await?;
//!     if let Some(after) = outcome.requeue_after {
//!         println!("requeue in {after:?}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod hotplug;
pub mod source;
pub mod target;

#[cfg(test)]
mod target_tests;
#[cfg(test)]
pub(crate) mod test_support;

pub use source::sync_source;
pub use target::sync_target;

use kube::runtime::controller::Action;
use std::time::Duration;

use crate::context::Context;
use crate::crd::VirtualMachineInstance;

/// What the work queue should do with a key after a sync returned without error.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Run the sync again after this delay, `None` to wait for the next change.
    pub requeue_after: Option<Duration>,
    /// Short label of why the key was requeued, used for metrics.
    pub reason: Option<&'static str>,
}

impl SyncOutcome {
    /// Nothing left to do until the VMI or its domain changes.
    #[must_use]
    pub fn done() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn requeue(after: Duration, reason: &'static str) -> Self {
        Self {
            requeue_after: Some(after),
            reason: Some(reason),
        }
    }

    #[must_use]
    pub fn requeue_secs(secs: u64, reason: &'static str) -> Self {
        Self::requeue(Duration::from_secs(secs), reason)
    }

    /// Controller action for this outcome: requeue, or wait for the next watch event.
    #[must_use]
    pub fn action(self) -> Action {
        match self.requeue_after {
            Some(after) => Action::requeue(after),
            None => Action::await_change(),
        }
    }

    /// Combine two outcomes, keeping the earlier requeue.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        match (self.requeue_after, other.requeue_after) {
            (Some(a), Some(b)) if b < a => other,
            (None, Some(_)) => other,
            _ => self,
        }
    }
}

/// Check if a status value has actually changed compared to the current status.
///
/// The controllers write the whole VMI back only when this returns `true`, which
/// keeps a sync from waking itself up through its own no-op write.
///
/// # Example
///
/// ```rust,ignore
/// use handoff::reconcilers::status_changed;
///
/// if status_changed(&vmi.status, &updated.status) {
///     store.update(&updated).await?;
/// }
/// ```
#[must_use]
pub fn status_changed<T: PartialEq>(current_value: &Option<T>, new_value: &Option<T>) -> bool {
    current_value != new_value
}

/// Key under which `controller` tracks the failures of `vmi`.
///
/// Both controllers sync every VMI, so one controller's successful syncs must
/// not end the backoff of the other.
#[must_use]
pub fn retry_key(controller: &str, vmi: &VirtualMachineInstance) -> String {
    format!("{controller}/{}", vmi.key())
}

/// Remaining backoff of a VMI whose syncs keep failing on `controller`.
///
/// Checked before every sync: a held-back VMI is requeued instead of synced.
#[must_use]
pub fn held_back(ctx: &Context, controller: &str, vmi: &VirtualMachineInstance) -> Option<Duration> {
    ctx.fail_retry.hold_back(&retry_key(controller, vmi))
}

/// Delay before a VMI whose sync failed on `controller` is attempted again.
///
/// A repeated failure is backed off by the failure retry engine. The first
/// failure of an episode is retried soon enough for a repeat to count as one.
#[must_use]
pub fn error_requeue_delay(ctx: &Context, controller: &str, vmi: &VirtualMachineInstance) -> Duration {
    ctx.fail_retry
        .record_failure(&retry_key(controller, vmi))
        .unwrap_or_else(|| ctx.fail_retry.first_retry_delay())
}
