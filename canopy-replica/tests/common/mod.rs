//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use canopy_core::{Reference, TreeDriver, TreeError, TreeReplica};
use canopy_replica::store::StoreResult;
use canopy_replica::{
    ChangeEvent, ChangeStream, Collection, DriverSettings, ReplicationDriver, ResumeMarker,
    RocksCollection, StorageFormat, StoreConfig, StoreError,
};
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::watch;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A fresh collection in its own temp directory. Keep the `TempDir` alive.
pub fn open_store() -> (TempDir, RocksCollection) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksCollection::open(StoreConfig::for_testing(dir.path())).unwrap();
    (dir, store)
}

pub fn fragmented(name: &str) -> DriverSettings {
    DriverSettings {
        graft_points: vec!["/catalog".into()],
        preferred_format: StorageFormat::Fragmented,
        ..DriverSettings::for_testing(name)
    }
}

pub fn replica_driver(
    settings: DriverSettings,
    collection: Arc<dyn Collection>,
    initial: Value,
) -> ReplicationDriver<TreeReplica> {
    ReplicationDriver::new(settings, collection, Arc::new(TreeReplica::new(initial))).unwrap()
}

pub fn reference(text: &str) -> Reference {
    Reference::parse(text).unwrap()
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

// ─── Fault injection ─────────────────────────────────────────────────────────

/// Wraps a collection; while broken, every call and every open stream fails.
#[derive(Clone)]
pub struct FaultyCollection {
    inner: RocksCollection,
    broken: Arc<watch::Sender<bool>>,
}

impl FaultyCollection {
    pub fn new(inner: RocksCollection) -> Self {
        let (broken, _) = watch::channel(false);
        Self {
            inner,
            broken: Arc::new(broken),
        }
    }

    pub fn break_connection(&self) {
        self.broken.send_replace(true);
    }

    pub fn heal(&self) {
        self.broken.send_replace(false);
    }

    fn check(&self) -> StoreResult<()> {
        if *self.broken.borrow() {
            Err(StoreError::Unavailable("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

impl Collection for FaultyCollection {
    fn get(&self, id: &str) -> StoreResult<Option<Value>> {
        self.check()?;
        self.inner.get(id)
    }

    fn all(&self) -> StoreResult<Vec<Value>> {
        self.check()?;
        self.inner.all()
    }

    fn transact(
        &self,
        body: &mut canopy_replica::store::TransactionBody<'_>,
    ) -> StoreResult<Option<ResumeMarker>> {
        self.check()?;
        self.inner.transact(body)
    }

    fn watch(&self, resume_after: Option<ResumeMarker>) -> StoreResult<Box<dyn ChangeStream>> {
        self.check()?;
        Ok(Box::new(FaultyStream {
            inner: self.inner.watch(resume_after)?,
            broken: self.broken.subscribe(),
        }))
    }
}

struct FaultyStream {
    inner: Box<dyn ChangeStream>,
    broken: watch::Receiver<bool>,
}

impl FaultyStream {
    fn check(&mut self) -> StoreResult<()> {
        if *self.broken.borrow_and_update() {
            Err(StoreError::Unavailable("stream interrupted".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChangeStream for FaultyStream {
    async fn next(&mut self) -> StoreResult<ChangeEvent> {
        loop {
            self.check()?;
            tokio::select! {
                event = self.inner.next() => return event,
                changed = self.broken.changed() => {
                    if changed.is_err() {
                        return self.inner.next().await;
                    }
                }
            }
        }
    }

    fn try_next(&mut self) -> StoreResult<Option<ChangeEvent>> {
        self.check()?;
        self.inner.try_next()
    }

    fn resume_marker(&self) -> Option<ResumeMarker> {
        self.inner.resume_marker()
    }
}

/// Wraps a collection; every commit blocks its thread for `delay` first.
#[derive(Clone)]
pub struct SlowCollection {
    inner: RocksCollection,
    delay: Duration,
}

impl SlowCollection {
    pub fn new(inner: RocksCollection, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

impl Collection for SlowCollection {
    fn get(&self, id: &str) -> StoreResult<Option<Value>> {
        self.inner.get(id)
    }

    fn all(&self) -> StoreResult<Vec<Value>> {
        self.inner.all()
    }

    fn transact(
        &self,
        body: &mut canopy_replica::store::TransactionBody<'_>,
    ) -> StoreResult<Option<ResumeMarker>> {
        std::thread::sleep(self.delay);
        self.inner.transact(body)
    }

    fn watch(&self, resume_after: Option<ResumeMarker>) -> StoreResult<Box<dyn ChangeStream>> {
        self.inner.watch(resume_after)
    }
}

/// A replica whose next `failures` mutations are refused.
pub struct FailingReplica {
    pub replica: TreeReplica,
    failures: AtomicUsize,
}

impl FailingReplica {
    pub fn new(initial: Value) -> Self {
        Self {
            replica: TreeReplica::new(initial),
            failures: AtomicUsize::new(0),
        }
    }

    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), TreeError> {
        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            Err(TreeError::Rejected("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TreeDriver for FailingReplica {
    type Error = TreeError;

    async fn initial_root(&self) -> Result<Value, TreeError> {
        self.replica.initial_root().await
    }

    async fn submit_replacement(&self, target: &Reference, new_value: Value) -> Result<(), TreeError> {
        self.check()?;
        self.replica.submit_replacement(target, new_value).await
    }

    async fn submit_conditional_replacement(
        &self,
        target: &Reference,
        new_value: Value,
        precondition: &Reference,
        required_value: &str,
    ) -> Result<(), TreeError> {
        self.check()?;
        self.replica
            .submit_conditional_replacement(target, new_value, precondition, required_value)
            .await
    }

    async fn submit_initialization(&self, target: &Reference, new_value: Value) -> Result<(), TreeError> {
        self.check()?;
        self.replica.submit_initialization(target, new_value).await
    }

    async fn submit_deletion(&self, target: &Reference) -> Result<(), TreeError> {
        self.check()?;
        self.replica.submit_deletion(target).await
    }

    async fn submit_conditional_deletion(
        &self,
        target: &Reference,
        precondition: &Reference,
        required_value: &str,
    ) -> Result<(), TreeError> {
        self.check()?;
        self.replica
            .submit_conditional_deletion(target, precondition, required_value)
            .await
    }

    async fn flush(&self) -> Result<(), TreeError> {
        self.replica.flush().await
    }
}
