//! host-gw backend: peers are reached through plain kernel routes
//!
//! Every peer subnet gets a route whose gateway is the peer's public IP, out
//! of the external interface. This requires all nodes to share a layer 2
//! segment and rules out NAT between them.

use super::{Backend, BackendContext, BackendCtor, ExternalInterface, SubnetDef};
use crate::error::{BackendError, Result};
use crate::lease::{Lease, LeaseAttrs};
use crate::route::{Route, RouteTable};
use crate::route_network::RouteNetwork;
use crate::subnet::{self, SubnetManager};
use async_trait::async_trait;
use fabric_types::IpAddress;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument};

/// Kind name of this backend.
pub const HOST_GW: &str = "host-gw";

#[derive(Debug, Clone)]
struct NetworkState {
    lease: Lease,
    link_index: u32,
}

/// Route-table backend without encapsulation.
pub struct HostGwBackend {
    subnet_manager: Arc<dyn SubnetManager>,
    route_table: Arc<dyn RouteTable>,
    check_interval: Duration,
    /// Published by `init`; `run` parks until it is set.
    state: watch::Sender<Option<NetworkState>>,
    stop: CancellationToken,
}

impl HostGwBackend {
    pub fn new(ctx: &BackendContext) -> Self {
        Self {
            subnet_manager: Arc::clone(&ctx.subnet_manager),
            route_table: Arc::clone(&ctx.route_table),
            check_interval: ctx.config.route_check_interval(),
            state: watch::Sender::new(None),
            stop: CancellationToken::new(),
        }
    }

    /// Constructor suitable for [`super::BackendManager::register`].
    pub fn constructor() -> BackendCtor {
        Arc::new(|ctx: &BackendContext| -> Result<Arc<dyn Backend>> {
            Ok(Arc::new(HostGwBackend::new(ctx)))
        })
    }

    async fn wait_initialized(&self, cancel: &CancellationToken) -> Option<NetworkState> {
        let mut rx = self.state.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if current.is_some() {
                return current;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        error!("host-gw: state publisher dropped before init");
                        return None;
                    }
                }
                _ = cancel.cancelled() => return None,
                _ = self.stop.cancelled() => return None,
            }
        }
    }

    /// This host's lease, once `init` has succeeded.
    pub fn lease(&self) -> Option<Lease> {
        self.state.borrow().as_ref().map(|s| s.lease.clone())
    }
}

/// Route to a peer: its subnet via its public IP, out of `link_index`.
fn peer_route(lease: &Lease, link_index: u32) -> Result<Route> {
    let gateway = lease.attrs.public_ip;
    if lease.subnet.is_ipv4() != gateway.is_ipv4() {
        return Err(BackendError::InvalidRoute {
            destination: lease.subnet,
            reason: format!("gateway {} is of a different address family", gateway),
        });
    }
    Ok(Route::new(lease.subnet.network(), gateway, link_index))
}

#[async_trait]
impl Backend for HostGwBackend {
    fn name(&self) -> &str {
        HOST_GW
    }

    #[instrument(skip(self, ext_iface), fields(iface = %ext_iface.name))]
    async fn init(
        &self,
        ext_iface: &ExternalInterface,
        ext_ip: IpAddress,
        ip_masq: bool,
    ) -> Result<SubnetDef> {
        if ext_iface.iface_addr != ext_ip {
            return Err(BackendError::Unsupported(format!(
                "{} is not compatible with NAT: interface address {} differs from public IP {}",
                HOST_GW, ext_iface.iface_addr, ext_ip
            )));
        }
        if ip_masq {
            debug!("IP masquerade rules are installed by the daemon");
        }

        let attrs = LeaseAttrs::new(ext_ip, HOST_GW);
        let lease = self.subnet_manager.acquire_lease(&attrs).await?;

        let subnet = SubnetDef {
            net: lease.subnet,
            mtu: ext_iface.mtu,
        };
        self.state.send_replace(Some(NetworkState {
            lease,
            link_index: ext_iface.index,
        }));

        info!(subnet = %subnet.net, mtu = subnet.mtu, "host-gw initialized");
        Ok(subnet)
    }

    async fn run(&self, cancel: CancellationToken) {
        let Some(state) = self.wait_initialized(&cancel).await else {
            debug!("host-gw: stopped before init completed");
            return;
        };

        let token = cancel.child_token();
        let tasks = TaskTracker::new();

        let stop = self.stop.clone();
        let relay = token.clone();
        tasks.spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => relay.cancel(),
                _ = relay.cancelled() => {}
            }
        });
        tasks.spawn(subnet::lease_renewer(
            Arc::clone(&self.subnet_manager),
            state.lease.clone(),
            token.clone(),
        ));
        tasks.close();

        let link_index = state.link_index;
        let mut network = RouteNetwork::new(HOST_GW, Arc::clone(&self.route_table), move |lease: &Lease| {
            peer_route(lease, link_index)
        })
        .with_check_interval(self.check_interval);

        network
            .run(Arc::clone(&self.subnet_manager), Some(state.lease), token.clone())
            .await;

        token.cancel();
        tasks.wait().await;
        info!("host-gw: stopped");
    }

    fn stop(&self) {
        self.stop.cancel();
    }
}
