//! Lease store contract and the long-running lease tasks built on it.
//!
//! - [`SubnetManager`]: the lease store client (acquire, renew, watch)
//! - [`watch_leases`]: turns store watch answers into event batches
//! - [`lease_renewer`]: keeps this node's own lease alive
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-8: System Component Inventory - Track peer subnets
//! - CP-10: System Recovery - Full resync after watch disruption

mod static_file;

pub use static_file::StaticFileManager;

use crate::error::Result;
use crate::lease::{Event, Lease, LeaseAttrs, LeaseWatchResult, LeaseWatcher};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Delay before re-watching after a watch error.
pub const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// How long before expiration the own lease is renewed.
pub const RENEW_MARGIN: Duration = Duration::from_secs(3600);

/// Delay before retrying a failed renewal.
const RENEW_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Client of the lease store.
#[async_trait]
pub trait SubnetManager: Send + Sync {
    /// Name of the store implementation, for logging.
    fn name(&self) -> &str;

    /// Obtains a lease for this node, publishing `attrs` with it.
    async fn acquire_lease(&self, attrs: &LeaseAttrs) -> Result<Lease>;

    /// Extends `lease`, updating its expiration in place.
    async fn renew_lease(&self, lease: &mut Lease) -> Result<()>;

    /// Waits for lease changes after `cursor`.
    ///
    /// With no cursor, or a cursor the store no longer has history for, the
    /// answer is a full snapshot.
    async fn watch_leases(&self, cursor: Option<u64>) -> Result<LeaseWatchResult>;
}

/// Watches the lease store and forwards event batches to `sender`.
///
/// Runs until `cancel` fires or the receiver is dropped. After a watch error
/// the cursor is discarded so the next answer is a snapshot, which
/// [`LeaseWatcher::reset`] turns into a full-resync batch.
pub async fn watch_leases(
    manager: Arc<dyn SubnetManager>,
    own_lease: Option<Lease>,
    sender: mpsc::Sender<Vec<Event>>,
    cancel: CancellationToken,
) {
    let mut watcher = LeaseWatcher::new(own_lease);
    let mut cursor = None;

    loop {
        let answer = tokio::select! {
            _ = cancel.cancelled() => return,
            answer = manager.watch_leases(cursor) => answer,
        };

        let answer = match answer {
            Ok(answer) => answer,
            Err(e) => {
                error!(error = %e, store = manager.name(), "Watch subnets failed");
                cursor = None;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(WATCH_RETRY_DELAY) => continue,
                }
            }
        };

        cursor = Some(answer.cursor());
        let batch = match answer {
            LeaseWatchResult::Events { events, .. } => watcher.update(events),
            LeaseWatchResult::Snapshot { leases, .. } => {
                debug!(count = leases.len(), "Resyncing from lease snapshot");
                watcher.reset(leases)
            }
        };

        if batch.is_empty() {
            continue;
        }

        for event in &batch {
            debug!(kind = %event.kind, subnet = %event.lease.subnet, "Lease event");
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = sender.send(batch) => {
                if sent.is_err() {
                    debug!("Lease event receiver dropped, stopping watch");
                    return;
                }
            }
        }
    }
}

/// Time to wait before renewing a lease that expires in `remaining`.
///
/// Leases granted for less than [`RENEW_MARGIN`] are renewed at half their
/// remaining lifetime, never sooner than the renewal retry delay.
fn renew_delay(remaining: Duration) -> Duration {
    if remaining > RENEW_MARGIN {
        remaining - RENEW_MARGIN
    } else {
        (remaining / 2).max(RENEW_RETRY_DELAY)
    }
}

/// Renews `lease` ahead of its expiration until cancelled.
pub async fn lease_renewer(
    manager: Arc<dyn SubnetManager>,
    mut lease: Lease,
    cancel: CancellationToken,
) {
    loop {
        let Some(expiration) = lease.expiration else {
            debug!(subnet = %lease.subnet, "Lease does not expire, renewal not needed");
            return;
        };

        let remaining = (expiration - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let wait = renew_delay(remaining);

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        match manager.renew_lease(&mut lease).await {
            Ok(()) => {
                info!(subnet = %lease.subnet, expiration = ?lease.expiration, "Lease renewed");
            }
            Err(e) => {
                error!(error = %e, subnet = %lease.subnet, "Error renewing lease");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(RENEW_RETRY_DELAY) => {}
                }
            }
        }
    }
}
