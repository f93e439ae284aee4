//! Lease store backed by a JSON file of pre-assigned leases.
//!
//! The file holds an array of leases:
//!
//! ```json
//! [
//!   {"Subnet": "10.5.1.0/24", "Attrs": {"PublicIP": "192.168.0.1", "BackendType": "host-gw"}},
//!   {"Subnet": "10.5.2.0/24", "Attrs": {"PublicIP": "192.168.0.2", "BackendType": "host-gw"}}
//! ]
//! ```
//!
//! A node acquires the lease whose public IP matches its own. Watches poll
//! the file and answer with a new snapshot whenever its contents change.
//! When a cluster network is set, leases outside it are skipped.

use super::SubnetManager;
use crate::error::{BackendError, Result};
use crate::lease::{Lease, LeaseAttrs, LeaseWatchResult};
use async_trait::async_trait;
use fabric_types::IpPrefix;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Default interval between file polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct FileState {
    generation: u64,
    leases: Vec<Lease>,
}

/// File-backed [`SubnetManager`].
#[derive(Debug)]
pub struct StaticFileManager {
    path: PathBuf,
    poll_interval: Duration,
    network: Option<IpPrefix>,
    state: Mutex<FileState>,
}

impl StaticFileManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            network: None,
            state: Mutex::new(FileState::default()),
        }
    }

    /// Overrides the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Restricts the store to leases inside `network`.
    pub fn with_network(mut self, network: Option<IpPrefix>) -> Self {
        self.network = network;
        self
    }

    async fn load(&self) -> Result<Vec<Lease>> {
        let data = tokio::fs::read_to_string(&self.path).await?;
        let mut leases: Vec<Lease> = serde_json::from_str(&data)?;
        if let Some(network) = self.network {
            leases.retain(|lease| {
                let inside = network.covers(&lease.subnet);
                if !inside {
                    warn!(
                        subnet = %lease.subnet,
                        network = %network,
                        path = %self.path.display(),
                        "Ignoring lease outside the cluster network"
                    );
                }
                inside
            });
        }
        Ok(leases)
    }

    /// Records `leases` as the current contents, returning a snapshot answer.
    fn publish(&self, leases: Vec<Lease>) -> LeaseWatchResult {
        let mut state = self.state.lock();
        state.generation += 1;
        state.leases = leases.clone();
        LeaseWatchResult::Snapshot {
            leases,
            cursor: state.generation,
        }
    }
}

#[async_trait]
impl SubnetManager for StaticFileManager {
    fn name(&self) -> &str {
        "static-file"
    }

    #[instrument(skip(self))]
    async fn acquire_lease(&self, attrs: &LeaseAttrs) -> Result<Lease> {
        let leases = self.load().await?;
        let found = leases
            .into_iter()
            .find(|l| l.attrs.public_ip == attrs.public_ip)
            .ok_or_else(|| {
                BackendError::lease(format!(
                    "no lease for {} in {}",
                    attrs.public_ip,
                    self.path.display()
                ))
            })?;

        info!(subnet = %found.subnet, "Subnet lease acquired");
        Ok(Lease::new(found.subnet, attrs.clone()))
    }

    async fn renew_lease(&self, lease: &mut Lease) -> Result<()> {
        debug!(subnet = %lease.subnet, "Static leases do not expire");
        Ok(())
    }

    async fn watch_leases(&self, cursor: Option<u64>) -> Result<LeaseWatchResult> {
        let Some(cursor) = cursor else {
            let leases = self.load().await?;
            return Ok(self.publish(leases));
        };

        loop {
            {
                let state = self.state.lock();
                if state.generation != cursor {
                    return Ok(LeaseWatchResult::Snapshot {
                        leases: state.leases.clone(),
                        cursor: state.generation,
                    });
                }
            }

            tokio::time::sleep(self.poll_interval).await;

            let leases = self.load().await?;
            let changed = self.state.lock().leases != leases;
            if changed {
                debug!(path = %self.path.display(), "Lease file changed");
                return Ok(self.publish(leases));
            }
        }
    }
}
