//! Route model, the owned route list and the route table seam.
//!
//! Route identity for reconciliation is destination plus gateway. Link index
//! and metric are derived values (the kernel may report a different metric
//! than the one requested) and are ignored by [`Route::matches`].

use crate::error::Result;
use fabric_types::{IpAddress, IpPrefix};
use std::fmt;

/// A kernel route to a peer subnet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    /// Egress interface index.
    pub link_index: u32,
    /// Destination subnet.
    pub destination: IpPrefix,
    /// Next hop.
    pub gateway: IpAddress,
    /// Route priority; 0 lets the kernel pick.
    pub metric: u32,
}

impl Route {
    pub fn new(destination: IpPrefix, gateway: IpAddress, link_index: u32) -> Self {
        Self {
            link_index,
            destination,
            gateway,
            metric: 0,
        }
    }

    /// Returns true if both routes send the same destination to the same gateway.
    pub fn matches(&self, other: &Route) -> bool {
        self.same_destination(other) && self.gateway == other.gateway
    }

    /// Returns true if both routes have the same destination subnet.
    pub fn same_destination(&self, other: &Route) -> bool {
        self.destination.network() == other.destination.network()
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} via {} dev #{}",
            self.destination, self.gateway, self.link_index
        )
    }
}

/// Kernel route table primitives.
///
/// Implementations are thin wrappers over the OS; every call either fully
/// succeeds or fails.
pub trait RouteTable: Send + Sync {
    /// Installs a single route.
    fn add_route(&self, route: &Route) -> Result<()>;

    /// Removes a single route.
    fn delete_route(&self, route: &Route) -> Result<()>;

    /// Lists the routes of the table this implementation manages.
    fn list_routes(&self) -> Result<Vec<Route>>;
}

/// Ordered list of routes a backend believes it has installed.
///
/// Holds at most one route per destination: [`RouteList::upsert`] replaces
/// rather than appends.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteList {
    routes: Vec<Route>,
}

impl RouteList {
    /// Creates a new empty list.
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Returns the number of routes in the list.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns true if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Inserts `route`, replacing any entry with the same destination.
    ///
    /// Returns the replaced entry.
    pub fn upsert(&mut self, route: Route) -> Option<Route> {
        match self.routes.iter_mut().find(|r| r.same_destination(&route)) {
            Some(existing) => Some(std::mem::replace(existing, route)),
            None => {
                self.routes.push(route);
                None
            }
        }
    }

    /// Removes the entry for `destination`, if any.
    pub fn remove(&mut self, destination: &IpPrefix) -> Option<Route> {
        let wanted = destination.network();
        let pos = self
            .routes
            .iter()
            .position(|r| r.destination.network() == wanted)?;
        Some(self.routes.remove(pos))
    }

    /// Returns an iterator over the routes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    /// Returns the routes as a slice.
    pub fn as_slice(&self) -> &[Route] {
        &self.routes
    }
}
