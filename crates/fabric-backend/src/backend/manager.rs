//! Backend registry and run supervisor
//!
//! [`BackendManager`] maps kind names to constructors and keeps at most one
//! running instance per kind. The first [`BackendManager::get_backend`] call
//! for a kind constructs the backend and launches its `run`; later calls share
//! that instance until `run` returns.
//!
//! A caller racing with a backend whose `run` has just returned may still be
//! handed that exiting instance: the entry is removed only once the run task
//! observes the return.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-7: Least Functionality - Unknown kinds are rejected
//! - SC-24: Fail in Known State - Exited backends free their slot

use super::{Backend, BackendContext, BackendCtor};
use crate::error::{BackendError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument};

type ActiveMap = HashMap<String, Arc<dyn Backend>>;

/// Registry of backend constructors and supervisor of running backends.
pub struct BackendManager {
    ctx: BackendContext,
    cancel: CancellationToken,
    ctors: Mutex<HashMap<String, BackendCtor>>,
    active: Arc<Mutex<ActiveMap>>,
    tasks: TaskTracker,
}

impl BackendManager {
    /// Creates a manager whose backends run until `cancel` fires.
    pub fn new(ctx: BackendContext, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            cancel,
            ctors: Mutex::new(HashMap::new()),
            active: Arc::new(Mutex::new(HashMap::new())),
            tasks: TaskTracker::new(),
        }
    }

    /// Registers `ctor` under `name`, replacing any earlier registration.
    pub fn register(&self, name: &str, ctor: BackendCtor) {
        let name = name.to_lowercase();
        debug!(backend = %name, "Registering backend type");
        self.ctors.lock().insert(name, ctor);
    }

    /// Returns the running backend of `kind`, constructing and launching it
    /// if none is active.
    ///
    /// Does not wait for `run`. Unknown kinds and constructor failures leave
    /// the active set untouched.
    #[instrument(skip(self))]
    pub fn get_backend(&self, kind: &str) -> Result<Arc<dyn Backend>> {
        let kind = kind.to_lowercase();

        let mut active = self.active.lock();
        if let Some(backend) = active.get(&kind) {
            return Ok(Arc::clone(backend));
        }

        let ctor = self
            .ctors
            .lock()
            .get(&kind)
            .cloned()
            .ok_or_else(|| BackendError::UnknownBackend(kind.clone()))?;

        let backend = ctor(&self.ctx)?;
        active.insert(kind.clone(), Arc::clone(&backend));
        drop(active);

        info!(backend = %kind, "Starting backend");
        self.launch(kind, Arc::clone(&backend));
        Ok(backend)
    }

    fn launch(&self, kind: String, backend: Arc<dyn Backend>) {
        let active = Arc::clone(&self.active);
        let cancel = self.cancel.clone();

        self.tasks.spawn(async move {
            // Run in its own task so a panic still reaches the cleanup below.
            let runner = tokio::spawn({
                let backend = Arc::clone(&backend);
                async move { backend.run(cancel).await }
            });
            if let Err(e) = runner.await {
                error!(backend = %kind, error = %e, "Backend run task failed");
            }

            let mut active = active.lock();
            if active
                .get(&kind)
                .is_some_and(|current| Arc::ptr_eq(current, &backend))
            {
                active.remove(&kind);
            }
            info!(backend = %kind, "Backend exited");
        });
    }

    /// Returns true if a backend of `kind` is currently active.
    pub fn is_active(&self, kind: &str) -> bool {
        self.active.lock().contains_key(&kind.to_lowercase())
    }

    /// Kinds with an active backend.
    pub fn active_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.active.lock().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Waits until every backend launched so far has returned from `run`.
    pub async fn wait(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ExternalInterface, SubnetDef};
    use crate::lease::{Lease, LeaseAttrs, LeaseWatchResult};
    use crate::route::{Route, RouteTable};
    use crate::subnet::SubnetManager;
    use async_trait::async_trait;
    use fabric_types::IpAddress;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct NullStore;

    #[async_trait]
    impl SubnetManager for NullStore {
        fn name(&self) -> &str {
            "null"
        }

        async fn acquire_lease(&self, attrs: &LeaseAttrs) -> Result<Lease> {
            Ok(Lease::new("10.5.1.0/24".parse().unwrap(), attrs.clone()))
        }

        async fn renew_lease(&self, _lease: &mut Lease) -> Result<()> {
            Ok(())
        }

        async fn watch_leases(&self, _cursor: Option<u64>) -> Result<LeaseWatchResult> {
            std::future::pending().await
        }
    }

    struct NullTable;

    impl RouteTable for NullTable {
        fn add_route(&self, _route: &Route) -> Result<()> {
            Ok(())
        }

        fn delete_route(&self, _route: &Route) -> Result<()> {
            Ok(())
        }

        fn list_routes(&self) -> Result<Vec<Route>> {
            Ok(Vec::new())
        }
    }

    struct TestBackend {
        stopped: CancellationToken,
        panic_on_run: bool,
    }

    #[async_trait]
    impl Backend for TestBackend {
        fn name(&self) -> &str {
            "test"
        }

        async fn init(
            &self,
            ext_iface: &ExternalInterface,
            _ext_ip: IpAddress,
            _ip_masq: bool,
        ) -> Result<SubnetDef> {
            Ok(SubnetDef {
                net: "10.5.1.0/24".parse().unwrap(),
                mtu: ext_iface.mtu,
            })
        }

        async fn run(&self, cancel: CancellationToken) {
            if self.panic_on_run {
                panic!("backend blew up");
            }
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = self.stopped.cancelled() => {}
            }
        }

        fn stop(&self) {
            self.stopped.cancel();
        }
    }

    fn manager(cancel: &CancellationToken) -> BackendManager {
        BackendManager::new(
            BackendContext::new(Arc::new(NullStore), Arc::new(NullTable)),
            cancel.clone(),
        )
    }

    fn counting_ctor(count: &Arc<AtomicUsize>, panic_on_run: bool) -> BackendCtor {
        let count = Arc::clone(count);
        Arc::new(move |_ctx: &BackendContext| -> Result<Arc<dyn Backend>> {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(TestBackend {
                stopped: CancellationToken::new(),
                panic_on_run,
            }) as Arc<dyn Backend>)
        })
    }

    async fn wait_inactive(manager: &BackendManager, kind: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.is_active(kind) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_constructs_once() {
        let cancel = CancellationToken::new();
        let manager = Arc::new(manager(&cancel));
        let count = Arc::new(AtomicUsize::new(0));
        manager.register("test", counting_ctor(&count, false));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.get_backend("test").unwrap() })
            })
            .collect();

        let mut backends = Vec::new();
        for handle in handles {
            backends.push(handle.await.unwrap());
        }

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(backends.iter().all(|b| Arc::ptr_eq(b, &backends[0])));

        cancel.cancel();
        manager.wait().await;
        assert!(manager.active_kinds().is_empty());
    }

    #[tokio::test]
    async fn test_kind_is_case_insensitive() {
        let cancel = CancellationToken::new();
        let manager = manager(&cancel);
        let count = Arc::new(AtomicUsize::new(0));
        manager.register("Test", counting_ctor(&count, false));

        let first = manager.get_backend("TEST").unwrap();
        let second = manager.get_backend("test").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.active_kinds(), vec!["test".to_string()]);

        cancel.cancel();
        manager.wait().await;
    }

    #[tokio::test]
    async fn test_restart_after_run_returns() {
        let cancel = CancellationToken::new();
        let manager = manager(&cancel);
        let count = Arc::new(AtomicUsize::new(0));
        manager.register("test", counting_ctor(&count, false));

        let first = manager.get_backend("test").unwrap();
        first.stop();
        wait_inactive(&manager, "test").await;

        let second = manager.get_backend("test").unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(!Arc::ptr_eq(&first, &second));

        cancel.cancel();
        manager.wait().await;
    }

    #[tokio::test]
    async fn test_unknown_kind() {
        let cancel = CancellationToken::new();
        let manager = manager(&cancel);
        let count = Arc::new(AtomicUsize::new(0));
        manager.register("test", counting_ctor(&count, false));

        let err = manager.get_backend("no-such-kind").err().unwrap();
        assert_eq!(err.to_string(), "unknown backend type: no-such-kind");
        assert!(manager.active_kinds().is_empty());

        assert!(manager.get_backend("test").is_ok());
        assert_eq!(manager.active_kinds(), vec!["test".to_string()]);

        cancel.cancel();
        manager.wait().await;
    }

    #[tokio::test]
    async fn test_constructor_failure_not_registered() {
        let cancel = CancellationToken::new();
        let manager = manager(&cancel);
        manager.register(
            "broken",
            Arc::new(|_ctx: &BackendContext| -> Result<Arc<dyn Backend>> {
                Err(BackendError::config("missing settings"))
            }),
        );

        assert!(matches!(
            manager.get_backend("broken"),
            Err(BackendError::Config(_))
        ));
        assert!(!manager.is_active("broken"));
    }

    #[tokio::test]
    async fn test_panicking_run_is_cleaned_up() {
        let cancel = CancellationToken::new();
        let manager = manager(&cancel);
        let count = Arc::new(AtomicUsize::new(0));
        manager.register("test", counting_ctor(&count, true));

        manager.get_backend("test").unwrap();
        tokio::time::timeout(Duration::from_secs(5), manager.wait())
            .await
            .unwrap();
        assert!(!manager.is_active("test"));
    }
}
