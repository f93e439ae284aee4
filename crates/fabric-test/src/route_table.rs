//! In-memory route table that records every mutation
//!
//! Behaves like the kernel main table for the operations the engine uses:
//! adding an existing route fails, deleting a missing route fails. Tests can
//! inject failures and mutate the table "externally" without recording.

use fabric_backend::{BackendError, Result, Route, RouteTable};
use fabric_types::IpPrefix;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A recorded route table call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOp {
    Add(Route),
    Delete(Route),
}

#[derive(Debug, Default)]
struct Faults {
    add: HashSet<IpPrefix>,
    delete: HashSet<IpPrefix>,
    list: bool,
}

/// Recording route table double.
#[derive(Debug, Default)]
pub struct FakeRouteTable {
    routes: Mutex<Vec<Route>>,
    ops: Mutex<Vec<RouteOp>>,
    faults: Mutex<Faults>,
    lists: AtomicUsize,
}

impl FakeRouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table already holding `routes` (not recorded as ops).
    pub fn with_routes(routes: impl IntoIterator<Item = Route>) -> Self {
        let table = Self::default();
        table.routes.lock().extend(routes);
        table
    }

    /// Current table contents.
    pub fn routes(&self) -> Vec<Route> {
        self.routes.lock().clone()
    }

    /// Routes to `destination` currently in the table.
    pub fn routes_for(&self, destination: &IpPrefix) -> Vec<Route> {
        let wanted = destination.network();
        self.routes
            .lock()
            .iter()
            .filter(|r| r.destination.network() == wanted)
            .cloned()
            .collect()
    }

    /// Mutation calls made so far, in order.
    pub fn ops(&self) -> Vec<RouteOp> {
        self.ops.lock().clone()
    }

    /// Returns and clears the recorded mutation calls.
    pub fn take_ops(&self) -> Vec<RouteOp> {
        std::mem::take(&mut *self.ops.lock())
    }

    /// Number of `list_routes` calls, failed ones included.
    pub fn list_count(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.ops
            .lock()
            .iter()
            .filter(|op| matches!(op, RouteOp::Delete(_)))
            .count()
    }

    /// Makes `add_route` fail for `destination`.
    pub fn fail_add_for(&self, destination: IpPrefix) {
        self.faults.lock().add.insert(destination.network());
    }

    /// Makes `delete_route` fail for `destination`.
    pub fn fail_delete_for(&self, destination: IpPrefix) {
        self.faults.lock().delete.insert(destination.network());
    }

    /// Makes `list_routes` fail.
    pub fn fail_list(&self, fail: bool) {
        self.faults.lock().list = fail;
    }

    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    /// Removes routes to `destination` as another process would.
    pub fn external_delete(&self, destination: &IpPrefix) -> Vec<Route> {
        let wanted = destination.network();
        let mut routes = self.routes.lock();
        let (removed, kept): (Vec<Route>, Vec<Route>) = routes
            .drain(..)
            .partition(|r| r.destination.network() == wanted);
        *routes = kept;
        removed
    }

    /// Inserts a route as another process would.
    pub fn external_add(&self, route: Route) {
        self.routes.lock().push(route);
    }
}

impl RouteTable for FakeRouteTable {
    fn add_route(&self, route: &Route) -> Result<()> {
        self.ops.lock().push(RouteOp::Add(route.clone()));

        if self
            .faults
            .lock()
            .add
            .contains(&route.destination.network())
        {
            return Err(BackendError::netlink("add_route", "injected failure"));
        }

        let mut routes = self.routes.lock();
        if routes.iter().any(|r| r.matches(route)) {
            return Err(BackendError::netlink("add_route", "File exists (os error 17)"));
        }
        routes.push(route.clone());
        Ok(())
    }

    fn delete_route(&self, route: &Route) -> Result<()> {
        self.ops.lock().push(RouteOp::Delete(route.clone()));

        if self
            .faults
            .lock()
            .delete
            .contains(&route.destination.network())
        {
            return Err(BackendError::netlink("delete_route", "injected failure"));
        }

        let mut routes = self.routes.lock();
        match routes.iter().position(|r| r.matches(route)) {
            Some(pos) => {
                routes.remove(pos);
                Ok(())
            }
            None => Err(BackendError::netlink(
                "delete_route",
                "No such process (os error 3)",
            )),
        }
    }

    fn list_routes(&self) -> Result<Vec<Route>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        if self.faults.lock().list {
            return Err(BackendError::netlink("list_routes", "injected failure"));
        }
        Ok(self.routes.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::route;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_kernel_like_semantics() {
        let table = FakeRouteTable::new();
        let r = route("10.5.1.0/24", "192.168.0.1");

        table.add_route(&r).unwrap();
        assert!(table.add_route(&r).is_err());
        table.delete_route(&r).unwrap();
        assert!(table.delete_route(&r).is_err());

        assert_eq!(
            table.ops(),
            vec![
                RouteOp::Add(r.clone()),
                RouteOp::Add(r.clone()),
                RouteOp::Delete(r.clone()),
                RouteOp::Delete(r),
            ]
        );
    }

    #[test]
    fn test_external_changes_are_not_recorded() {
        let table = FakeRouteTable::new();
        table.external_add(route("10.5.1.0/24", "192.168.0.1"));
        table.external_add(route("10.5.2.0/24", "192.168.0.2"));

        let removed = table.external_delete(&"10.5.1.0/24".parse().unwrap());
        assert_eq!(removed, vec![route("10.5.1.0/24", "192.168.0.1")]);
        assert_eq!(table.routes(), vec![route("10.5.2.0/24", "192.168.0.2")]);
        assert!(table.ops().is_empty());
    }

    #[test]
    fn test_fault_injection() {
        let table = FakeRouteTable::new();
        table.fail_add_for("10.5.1.0/24".parse().unwrap());
        table.fail_list(true);

        assert!(table.add_route(&route("10.5.1.0/24", "192.168.0.1")).is_err());
        assert!(table.add_route(&route("10.5.2.0/24", "192.168.0.2")).is_ok());
        assert!(table.list_routes().is_err());

        table.clear_faults();
        assert_eq!(table.list_routes().unwrap().len(), 1);
    }
}
