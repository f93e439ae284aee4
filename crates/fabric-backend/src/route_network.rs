//! Route reconciliation engine for backends that program plain kernel routes
//!
//! [`RouteNetwork`] consumes lease event batches and keeps one kernel route
//! per live peer subnet, then periodically audits the kernel table and
//! reinstalls any owned route that went missing.
//!
//! A single consuming loop owns the route list and performs every route
//! mutation, so event handling and audits never interleave.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-3: Configuration Change Control - Apply lease changes to forwarding state
//! - CP-10: System Recovery - Periodic audit restores lost routes
//! - SI-7: Software, Firmware, and Information Integrity - Detect route drift
//! - AU-12: Audit Record Generation - Log every route mutation

use crate::error::Result;
use crate::lease::{Event, EventType, Lease};
use crate::route::{Route, RouteList, RouteTable};
use crate::subnet::{self, SubnetManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// Default interval between route audits.
/// NIST: CP-10 - Recovery timing
pub const DEFAULT_ROUTE_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Depth of the lease event batch channel.
pub const EVENT_CHANNEL_DEPTH: usize = 16;

/// Maps a lease to the single route expected for it.
pub type GetRouteFn = Box<dyn Fn(&Lease) -> Result<Route> + Send + Sync>;

/// Reconciles lease events into kernel routes for one backend kind.
pub struct RouteNetwork {
    backend_type: String,
    get_route: GetRouteFn,
    table: Arc<dyn RouteTable>,
    routes: RouteList,
    check_interval: Duration,
}

impl RouteNetwork {
    /// Creates an engine with an empty route list.
    pub fn new<F>(backend_type: impl Into<String>, table: Arc<dyn RouteTable>, get_route: F) -> Self
    where
        F: Fn(&Lease) -> Result<Route> + Send + Sync + 'static,
    {
        Self {
            backend_type: backend_type.into(),
            get_route: Box::new(get_route),
            table,
            routes: RouteList::new(),
            check_interval: DEFAULT_ROUTE_CHECK_INTERVAL,
        }
    }

    /// Overrides the audit interval.
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn backend_type(&self) -> &str {
        &self.backend_type
    }

    /// Routes this engine believes it has installed.
    pub fn routes(&self) -> &RouteList {
        &self.routes
    }

    /// Watches leases and reconciles routes until `cancel` fires.
    ///
    /// Returns after the lease watch and the audit ticker have both exited.
    /// Routes are left installed on exit.
    #[instrument(skip_all, fields(backend = %self.backend_type))]
    pub async fn run(
        &mut self,
        manager: Arc<dyn SubnetManager>,
        own_lease: Option<Lease>,
        cancel: CancellationToken,
    ) {
        let tasks = TaskTracker::new();
        let (event_tx, mut event_rx) = mpsc::channel::<Vec<Event>>(EVENT_CHANNEL_DEPTH);
        let (tick_tx, mut tick_rx) = mpsc::channel::<()>(1);

        info!("Watching for new subnet leases");
        tasks.spawn(subnet::watch_leases(
            manager,
            own_lease,
            event_tx,
            cancel.clone(),
        ));
        tasks.spawn(audit_ticker(self.check_interval, tick_tx, cancel.clone()));
        tasks.close();

        let mut events_open = true;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                batch = event_rx.recv(), if events_open => match batch {
                    Some(batch) => self.handle_subnet_events(&batch),
                    None => {
                        warn!("Lease event channel closed");
                        events_open = false;
                    }
                },
                Some(()) = tick_rx.recv() => {
                    self.check_subnet_exist_in_routes();
                }
            }
        }

        tasks.wait().await;
        info!(routes = self.routes.len(), "Route reconciliation stopped");
    }

    /// Applies one batch of lease events in delivery order.
    ///
    /// Events for other backend kinds are ignored. A failed route operation
    /// drops that event only; the audit retries what was recorded. The kernel
    /// table is listed once per batch and the listing is kept in step with
    /// the mutations made while applying it.
    #[instrument(skip_all, fields(backend = %self.backend_type, count = batch.len()))]
    pub fn handle_subnet_events(&mut self, batch: &[Event]) {
        let mut installed = match self.table.list_routes() {
            Ok(routes) => routes,
            Err(e) => {
                warn!(error = %e, "Failed to list routes, assuming none exist");
                Vec::new()
            }
        };

        for event in batch {
            let lease = &event.lease;
            if !lease.attrs.is_backend(&self.backend_type) {
                warn!(
                    subnet = %lease.subnet,
                    backend_type = %lease.attrs.backend_type,
                    "Ignoring subnet of another backend type"
                );
                continue;
            }

            match event.kind {
                EventType::Added => self.handle_added(lease, &mut installed),
                EventType::Removed => self.handle_removed(lease, &mut installed),
            }
        }
    }

    fn handle_added(&mut self, lease: &Lease, installed: &mut Vec<Route>) {
        info!(subnet = %lease.subnet, public_ip = %lease.attrs.public_ip, "Subnet added");

        let expected = match (self.get_route)(lease) {
            Ok(route) => route,
            Err(e) => {
                error!(error = %e, subnet = %lease.subnet, "Cannot derive route for subnet");
                return;
            }
        };

        if installed.iter().any(|r| r.matches(&expected)) {
            debug!(route = %expected, "Route already installed");
            self.routes.upsert(expected);
            return;
        }

        while let Some(pos) = installed.iter().position(|r| r.same_destination(&expected)) {
            let stale = &installed[pos];
            warn!(
                subnet = %expected.destination,
                old_gateway = %stale.gateway,
                new_gateway = %expected.gateway,
                "Replacing existing route to subnet"
            );
            if let Err(e) = self.table.delete_route(stale) {
                error!(error = %e, route = %stale, "Error deleting route");
                return;
            }
            installed.remove(pos);
        }

        if let Err(e) = self.table.add_route(&expected) {
            error!(error = %e, route = %expected, "Error adding route");
            return;
        }

        info!(route = %expected, "Route installed");
        installed.push(expected.clone());
        self.routes.upsert(expected);
    }

    fn handle_removed(&mut self, lease: &Lease, installed: &mut Vec<Route>) {
        info!(subnet = %lease.subnet, public_ip = %lease.attrs.public_ip, "Subnet removed");

        let expected = match (self.get_route)(lease) {
            Ok(route) => route,
            Err(e) => {
                error!(error = %e, subnet = %lease.subnet, "Cannot derive route for subnet");
                self.routes.remove(&lease.subnet.network());
                return;
            }
        };

        if let Some(pos) = installed.iter().position(|r| r.matches(&expected)) {
            match self.table.delete_route(&installed[pos]) {
                Ok(()) => {
                    info!(route = %installed[pos], "Route deleted");
                    installed.remove(pos);
                }
                Err(e) => error!(error = %e, route = %installed[pos], "Error deleting route"),
            }
        }

        self.routes.remove(&expected.destination);
    }

    /// Reinstalls owned routes missing from the kernel table.
    ///
    /// Returns how many routes were reinstalled. Failures are left for the
    /// next audit.
    #[instrument(skip_all, fields(backend = %self.backend_type))]
    pub fn check_subnet_exist_in_routes(&self) -> usize {
        let current = match self.table.list_routes() {
            Ok(routes) => routes,
            Err(e) => {
                error!(error = %e, "Error fetching route list, will retry next cycle");
                return 0;
            }
        };

        let mut recovered = 0;
        for owned in self.routes.iter() {
            if current.iter().any(|r| r.matches(owned)) {
                continue;
            }
            match self.table.add_route(owned) {
                Ok(()) => {
                    info!(route = %owned, "Route recovered");
                    recovered += 1;
                }
                Err(e) => warn!(error = %e, route = %owned, "Error recovering route"),
            }
        }
        recovered
    }
}

/// Sends a tick every `period` until cancelled.
///
/// Ticks do not queue: if the consumer has not taken the previous tick yet,
/// the new one is dropped.
async fn audit_ticker(period: Duration, ticks: mpsc::Sender<()>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                if let Err(TrySendError::Closed(())) = ticks.try_send(()) {
                    return;
                }
            }
        }
    }
}
