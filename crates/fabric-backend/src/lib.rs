//! Backend runtime for the fabric agent
//!
//! Each cluster node leases a subnet of the cluster network and learns the
//! subnets leased by its peers. A backend programs the local data plane so
//! traffic to every peer subnet reaches that peer.
//!
//! - [`BackendManager`]: registry of backend kinds and supervisor of their
//!   single running instance
//! - [`RouteNetwork`]: turns lease events into kernel routes and repairs
//!   drift with a periodic audit
//! - [`HostGwBackend`]: route-table backend with peers as next hops
//! - [`SubnetManager`]: lease store seam, with [`StaticFileManager`] as a
//!   file-backed store
//! - [`NetlinkRouteTable`]: rtnetlink implementation of [`RouteTable`]
//!
//! # NIST 800-53 Rev 5 Control Mappings
//!
//! | Control | Description | Implementation |
//! |---------|-------------|----------------|
//! | AC-3 | Access Enforcement | Route changes require CAP_NET_ADMIN |
//! | AU-12 | Audit Record Generation | Every route mutation logged |
//! | CM-6 | Configuration Settings | Validated network config |
//! | CM-7 | Least Functionality | Only registered backend kinds run |
//! | CP-10 | System Recovery | Route audit and watch resync |
//! | SI-11 | Error Handling | Structured error types |

pub mod backend;
pub mod config;
pub mod error;
pub mod lease;
pub mod netlink;
pub mod route;
pub mod route_network;
pub mod subnet;

pub use backend::{
    Backend, BackendContext, BackendCtor, BackendManager, ExternalInterface, HOST_GW,
    HostGwBackend, SubnetDef,
};
pub use config::{BackendConfig, Config};
pub use error::{BackendError, Result};
pub use lease::{Event, EventType, Lease, LeaseAttrs, LeaseWatchResult, LeaseWatcher};
pub use netlink::NetlinkRouteTable;
pub use route::{Route, RouteList, RouteTable};
pub use route_network::RouteNetwork;
pub use subnet::{StaticFileManager, SubnetManager};
