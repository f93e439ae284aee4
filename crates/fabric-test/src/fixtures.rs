//! Test fixtures for leases, routes and engines

use fabric_backend::{Lease, LeaseAttrs, Route, RouteNetwork, RouteTable, HOST_GW};
use std::sync::Arc;

/// Link index used by fixture routes.
pub const LINK_INDEX: u32 = 2;

/// A host-gw lease for `subnet` held by the node at `public_ip`.
pub fn lease(subnet: &str, public_ip: &str) -> Lease {
    lease_of_type(subnet, public_ip, HOST_GW)
}

/// A lease produced by backend kind `kind`.
pub fn lease_of_type(subnet: &str, public_ip: &str, kind: &str) -> Lease {
    Lease::new(
        subnet.parse().expect("valid subnet"),
        LeaseAttrs::new(public_ip.parse().expect("valid address"), kind),
    )
}

/// The route host-gw derives for `subnet` via `gateway`.
pub fn route(subnet: &str, gateway: &str) -> Route {
    Route::new(
        subnet.parse().expect("valid subnet"),
        gateway.parse().expect("valid address"),
        LINK_INDEX,
    )
}

/// A host-gw engine over `table`: each peer subnet via its public IP.
pub fn host_gw_network(table: Arc<dyn RouteTable>) -> RouteNetwork {
    RouteNetwork::new(HOST_GW, table, |lease: &Lease| {
        Ok(Route::new(
            lease.subnet.network(),
            lease.attrs.public_ip,
            LINK_INDEX,
        ))
    })
}
