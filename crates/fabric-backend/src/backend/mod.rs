//! Backend contract shared by every data-plane strategy
//!
//! A backend programs the local data plane so traffic to peer subnets reaches
//! the peers. [`BackendManager`] keeps at most one running instance per kind.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-7: Least Functionality - Only registered backend kinds can run
//! - SC-7: Boundary Protection - Backends own forwarding state

mod hostgw;
mod manager;

pub use hostgw::{HOST_GW, HostGwBackend};
pub use manager::BackendManager;

use crate::config::BackendConfig;
use crate::error::Result;
use crate::route::RouteTable;
use crate::subnet::SubnetManager;
use async_trait::async_trait;
use fabric_types::{IpAddress, IpPrefix};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Subnet and MTU assigned to this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubnetDef {
    pub net: IpPrefix,
    #[serde(rename = "MTU")]
    pub mtu: u32,
}

/// The interface peers reach this host through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalInterface {
    pub name: String,
    pub index: u32,
    pub mtu: u32,
    /// Address configured on the interface.
    pub iface_addr: IpAddress,
}

/// A pluggable data-plane strategy.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Registered kind name.
    fn name(&self) -> &str;

    /// One-time setup: obtains this host's lease and returns its subnet.
    ///
    /// `ext_ip` is the address peers use to reach this host; it differs from
    /// the interface address when the host sits behind NAT.
    async fn init(
        &self,
        ext_iface: &ExternalInterface,
        ext_ip: IpAddress,
        ip_masq: bool,
    ) -> Result<SubnetDef>;

    /// Runs until `cancel` fires or [`Backend::stop`] is called.
    ///
    /// Failures are logged, never returned.
    async fn run(&self, cancel: CancellationToken);

    /// Requests shutdown independently of the token passed to `run`.
    fn stop(&self);
}

/// Shared collaborators handed to backend constructors.
#[derive(Clone)]
pub struct BackendContext {
    pub subnet_manager: Arc<dyn SubnetManager>,
    pub route_table: Arc<dyn RouteTable>,
    pub config: BackendConfig,
}

impl BackendContext {
    pub fn new(subnet_manager: Arc<dyn SubnetManager>, route_table: Arc<dyn RouteTable>) -> Self {
        Self {
            subnet_manager,
            route_table,
            config: BackendConfig::default(),
        }
    }

    pub fn with_config(mut self, config: BackendConfig) -> Self {
        self.config = config;
        self
    }
}

impl std::fmt::Debug for BackendContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendContext")
            .field("subnet_manager", &self.subnet_manager.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Builds a backend instance.
pub type BackendCtor = Arc<dyn Fn(&BackendContext) -> Result<Arc<dyn Backend>> + Send + Sync>;
