//! Scripted lease store
//!
//! Watch answers are queued by the test and handed out one per
//! `watch_leases` call; a call with nothing queued waits for the next push.

use async_trait::async_trait;
use chrono::Utc;
use fabric_backend::{
    BackendError, Event, Lease, LeaseAttrs, LeaseWatchResult, Result, SubnetManager,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc;

type Answer = std::result::Result<LeaseWatchResult, String>;

/// In-memory [`SubnetManager`] driven by the test.
pub struct MemorySubnetManager {
    leases: Mutex<Vec<Lease>>,
    lease_ttl: Option<chrono::Duration>,
    answers_tx: mpsc::UnboundedSender<Answer>,
    answers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Answer>>,
    cursor: AtomicU64,
    watch_calls: Mutex<Vec<Option<u64>>>,
    renewals: AtomicUsize,
}

impl MemorySubnetManager {
    /// Creates a store whose leases never expire.
    pub fn new() -> Self {
        let (answers_tx, answers_rx) = mpsc::unbounded_channel();
        Self {
            leases: Mutex::new(Vec::new()),
            lease_ttl: None,
            answers_tx,
            answers_rx: tokio::sync::Mutex::new(answers_rx),
            cursor: AtomicU64::new(0),
            watch_calls: Mutex::new(Vec::new()),
            renewals: AtomicUsize::new(0),
        }
    }

    /// Gives acquired and renewed leases an expiration `ttl` from now.
    pub fn with_lease_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.lease_ttl = Some(ttl);
        self
    }

    /// Makes `lease` available to `acquire_lease` by its public IP.
    pub fn with_lease(self, lease: Lease) -> Self {
        self.leases.lock().push(lease);
        self
    }

    fn next_cursor(&self) -> u64 {
        self.cursor.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Queues a full snapshot answer.
    pub fn push_snapshot(&self, leases: Vec<Lease>) {
        let cursor = self.next_cursor();
        let _ = self
            .answers_tx
            .send(Ok(LeaseWatchResult::Snapshot { leases, cursor }));
    }

    /// Queues an incremental answer.
    pub fn push_events(&self, events: Vec<Event>) {
        let cursor = self.next_cursor();
        let _ = self
            .answers_tx
            .send(Ok(LeaseWatchResult::Events { events, cursor }));
    }

    /// Queues a watch failure.
    pub fn push_error(&self, message: &str) {
        let _ = self.answers_tx.send(Err(message.to_string()));
    }

    /// Cursors passed to `watch_leases`, in call order.
    pub fn watch_calls(&self) -> Vec<Option<u64>> {
        self.watch_calls.lock().clone()
    }

    pub fn renewals(&self) -> usize {
        self.renewals.load(Ordering::SeqCst)
    }

    fn expiration(&self) -> Option<chrono::DateTime<Utc>> {
        self.lease_ttl.map(|ttl| Utc::now() + ttl)
    }
}

impl Default for MemorySubnetManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubnetManager for MemorySubnetManager {
    fn name(&self) -> &str {
        "memory"
    }

    async fn acquire_lease(&self, attrs: &LeaseAttrs) -> Result<Lease> {
        let found = self
            .leases
            .lock()
            .iter()
            .find(|l| l.attrs.public_ip == attrs.public_ip)
            .cloned();
        let Some(found) = found else {
            return Err(BackendError::lease(format!(
                "no lease reserved for {}",
                attrs.public_ip
            )));
        };

        let mut lease = Lease::new(found.subnet, attrs.clone());
        lease.expiration = self.expiration();
        Ok(lease)
    }

    async fn renew_lease(&self, lease: &mut Lease) -> Result<()> {
        self.renewals.fetch_add(1, Ordering::SeqCst);
        lease.expiration = self.expiration();
        Ok(())
    }

    async fn watch_leases(&self, cursor: Option<u64>) -> Result<LeaseWatchResult> {
        self.watch_calls.lock().push(cursor);

        let mut answers = self.answers_rx.lock().await;
        match answers.recv().await {
            Some(Ok(answer)) => Ok(answer),
            Some(Err(message)) => Err(BackendError::lease(message)),
            None => Err(BackendError::lease("answer queue closed")),
        }
    }
}
