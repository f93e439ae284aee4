//! Verification helpers for route table state

use crate::FakeRouteTable;
use fabric_backend::RouteNetwork;
use fabric_types::{IpAddress, IpPrefix};
use thiserror::Error;

/// Verification error types
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Expected one route to {destination}, found {actual}")]
    RouteCountMismatch { destination: IpPrefix, actual: usize },

    #[error("Route to {destination} goes via {actual}, expected {expected}")]
    GatewayMismatch {
        destination: IpPrefix,
        expected: IpAddress,
        actual: IpAddress,
    },

    #[error("Owned route {route} is missing from the table")]
    OwnedRouteMissing { route: String },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Verifies the table holds exactly one route to `destination`, via `gateway`.
pub fn verify_single_route(
    table: &FakeRouteTable,
    destination: &str,
    gateway: &str,
) -> VerifyResult<()> {
    let destination: IpPrefix = destination.parse().expect("valid subnet");
    let expected: IpAddress = gateway.parse().expect("valid address");

    let routes = table.routes_for(&destination);
    if routes.len() != 1 {
        return Err(VerificationError::RouteCountMismatch {
            destination,
            actual: routes.len(),
        });
    }
    if routes[0].gateway != expected {
        return Err(VerificationError::GatewayMismatch {
            destination,
            expected,
            actual: routes[0].gateway,
        });
    }
    Ok(())
}

/// Verifies the table holds no route to `destination`.
pub fn verify_no_route(table: &FakeRouteTable, destination: &str) -> VerifyResult<()> {
    let destination: IpPrefix = destination.parse().expect("valid subnet");
    let actual = table.routes_for(&destination).len();
    if actual != 0 {
        return Err(VerificationError::RouteCountMismatch {
            destination,
            actual,
        });
    }
    Ok(())
}

/// Verifies every route the engine owns is present in the table.
pub fn verify_owned_routes_installed(
    network: &RouteNetwork,
    table: &FakeRouteTable,
) -> VerifyResult<()> {
    let installed = table.routes();
    for owned in network.routes().iter() {
        if !installed.iter().any(|r| r.matches(owned)) {
            return Err(VerificationError::OwnedRouteMissing {
                route: owned.to_string(),
            });
        }
    }
    Ok(())
}
