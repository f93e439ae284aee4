//! Integration test infrastructure for the fabric agent backends
//!
//! Provides:
//! - A recording, fault-injecting route table ([`FakeRouteTable`])
//! - A scripted lease store ([`MemorySubnetManager`])
//! - Lease and route fixtures
//! - Route table verification helpers

pub mod fixtures;
mod route_table;
mod subnet;
mod verification;

pub use fixtures::*;
pub use route_table::{FakeRouteTable, RouteOp};
pub use subnet::MemorySubnetManager;
pub use verification::*;

use std::time::Duration;

/// Polls `condition` until it holds, failing after `timeout`.
///
/// Works with a paused tokio clock: each poll sleeps, letting the runtime
/// advance time when idle.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}
