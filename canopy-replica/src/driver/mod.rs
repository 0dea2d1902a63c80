//! Replicating driver: keeps a downstream tree in step with a collection.
//!
//! ```text
//!   submit_* ──► transact (write + revision+1) ──► collection
//!                                                      │ commit stream
//!   downstream ◄── translate ◄── ChangeFeedReceiver ◄──┘
//!        │
//!        └─► flush lock advances to the event's revision
//! ```
//!
//! The driver starts `Disconnected`, becomes `Connected` once the collection
//! has been loaded (or seeded) and the change feed opened, and falls back to
//! `Disconnected` whenever event application fails. Recovery reloads the
//! whole tree and pushes it downstream before dispatch resumes.
//!
//! - [`format`]: document layout, write planning, event translation

pub mod format;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use canopy_core::{Reference, TreeDriver};
use serde_json::Value;
use uuid::Uuid;

use crate::error::DriverError;
use crate::flush_lock::RevisionFlushLock;
use crate::receiver::{ChangeFeedReceiver, ChangeListener};
use crate::settings::{DriverSettings, FlushMode, StorageFormat};
use crate::store::{ChangeEvent, Collection, StoreError, Transaction};
use crate::surgeon::DocumentSurgeon;

pub use format::{StateAndRevision, Update, Write, REVISION_ONE, ROOT_ID};

/// Outcome of loading replication state from the collection.
#[derive(Debug, Clone, PartialEq)]
pub enum Replication {
    Loaded(StateAndRevision),
    /// The collection holds no root document yet.
    Uninitialized,
}

/// Where the driver stands with respect to the collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Initializing,
    Connected(StorageFormat),
}

/// A [`TreeDriver`] backed by shared storage.
#[async_trait]
pub trait ReplicaDriver: TreeDriver {
    /// Rewrite the collection in the preferred layout, keeping its state.
    async fn refurbish(&self) -> Result<(), Self::Error>;

    async fn close(&self);
}

struct Shared<D: TreeDriver + 'static> {
    settings: DriverSettings,
    collection: Arc<dyn Collection>,
    downstream: Arc<D>,
    surgeon: DocumentSurgeon,
    receiver: ChangeFeedReceiver,
    flush_lock: RevisionFlushLock,
    connection: RwLock<ConnectionState>,
    /// Serializes initialization and recovery.
    init_lock: tokio::sync::Mutex<()>,
    /// Events at or below this revision are already in the loaded state.
    revision_to_skip: AtomicU64,
    closed: AtomicBool,
}

/// Replicates a tree between a [`Collection`] and a downstream driver.
pub struct ReplicationDriver<D: TreeDriver + 'static> {
    shared: Arc<Shared<D>>,
}

impl<D: TreeDriver + 'static> ReplicationDriver<D> {
    pub fn new(
        settings: DriverSettings,
        collection: Arc<dyn Collection>,
        downstream: Arc<D>,
    ) -> Result<Self, DriverError> {
        let surgeon = DocumentSurgeon::new(settings.graft_references()?);
        let receiver = ChangeFeedReceiver::new(settings.name.clone(), Arc::clone(&collection));
        let flush_lock = RevisionFlushLock::new(settings.name.clone());
        Ok(Self {
            shared: Arc::new(Shared {
                settings,
                collection,
                downstream,
                surgeon,
                receiver,
                flush_lock,
                connection: RwLock::new(ConnectionState::Disconnected),
                init_lock: tokio::sync::Mutex::new(()),
                revision_to_skip: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.settings.name
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.shared.settings
    }

    pub fn downstream(&self) -> &Arc<D> {
        &self.shared.downstream
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.connection()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Highest revision whose effects have reached the downstream.
    pub fn applied_revision(&self) -> u64 {
        self.shared.flush_lock.applied_revision()
    }

    /// Load replication state and open the change feed without starting
    /// dispatch. Leaves the driver `Connected` on success.
    pub async fn initialize_replication(&self) -> Result<Replication, DriverError> {
        let _guard = self.shared.init_lock.lock().await;
        self.shared.initialize_replication().await
    }

    /// Run the recovery sequence now: reload, push the full tree downstream,
    /// restart dispatch.
    pub async fn reconnect(&self) -> Result<(), DriverError> {
        log::debug!("+ [{}] reconnect", self.name());
        self.shared.reconnect().await
    }
}

impl<D: TreeDriver + 'static> Shared<D> {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn connection(&self) -> ConnectionState {
        *self.connection.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_connection(&self, state: ConnectionState) {
        let mut current = self.connection.write().unwrap_or_else(PoisonError::into_inner);
        if *current != state {
            log::info!("[{}] {:?} -> {:?}", self.settings.name, *current, state);
            *current = state;
        }
    }

    fn require_connected(&self) -> Result<(), DriverError> {
        if self.is_closed() {
            return Err(DriverError::Closed);
        }
        match self.connection() {
            ConnectionState::Connected(_) => Ok(()),
            _ => Err(DriverError::Disconnected),
        }
    }

    /// Run `body` in one store transaction. Driver errors abandon it.
    fn transact<T>(
        &self,
        mut body: impl FnMut(&mut Transaction<'_>) -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        let mut outcome = None;
        let mut failure = None;
        let committed = self.collection.transact(&mut |txn| match body(txn) {
            Ok(value) => {
                outcome = Some(value);
                Ok(())
            }
            Err(DriverError::Store(e)) => Err(e),
            Err(e) => {
                failure = Some(e);
                Err(StoreError::Aborted)
            }
        });
        if let Some(e) = failure {
            return Err(e);
        }
        committed?;
        outcome.ok_or(DriverError::Store(StoreError::Aborted))
    }

    /// [`Self::transact`] on the blocking pool, off the async workers.
    async fn commit<T: Send + 'static>(
        self: &Arc<Self>,
        mut body: impl FnMut(&Self, &mut Transaction<'_>) -> Result<T, DriverError> + Send + 'static,
    ) -> Result<T, DriverError> {
        let shared = Arc::clone(self);
        tokio::task::spawn_blocking(move || shared.transact(|txn| body(&*shared, txn)))
            .await
            .map_err(|e| DriverError::CommitAbandoned(e.to_string()))?
    }

    fn listener(self: &Arc<Self>) -> Arc<dyn ChangeListener> {
        Arc::new(EventListener {
            shared: Arc::downgrade(self),
        })
    }

    /// Caller holds `init_lock`.
    async fn initialize_replication(self: &Arc<Self>) -> Result<Replication, DriverError> {
        if self.is_closed() {
            return Err(DriverError::Closed);
        }
        self.set_connection(ConnectionState::Initializing);
        match self.load_replication().await {
            Ok(Replication::Uninitialized) => {
                self.set_connection(ConnectionState::Disconnected);
                Ok(Replication::Uninitialized)
            }
            Ok(loaded) => Ok(loaded),
            Err(e) => {
                log::warn!("[{}] failed to initialize replication: {e}", self.name());
                self.set_connection(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn load_replication(self: &Arc<Self>) -> Result<Replication, DriverError> {
        if !self.receiver.initialize(self.listener()).await? {
            log::debug!("[{}] change feed opened with a pending event", self.name());
        }
        let documents = self.collection.all()?;
        if !documents.iter().any(|d| crate::store::document_id(d) == Some(ROOT_ID)) {
            return Ok(Replication::Uninitialized);
        }
        let (layout, loaded) = format::load(documents)?;
        self.loaded(layout, loaded.revision);
        Ok(Replication::Loaded(loaded))
    }

    fn loaded(&self, format: StorageFormat, revision: u64) {
        self.revision_to_skip.store(revision, Ordering::SeqCst);
        self.flush_lock.finished_revision(Some(revision));
        self.set_connection(ConnectionState::Connected(format));
    }

    /// Write the downstream's initial root as revision one. If another
    /// initializer got there first, load what it wrote instead.
    async fn seed(self: &Arc<Self>) -> Result<Value, DriverError> {
        log::info!("[{}] initializing collection", self.name());
        let state = self
            .downstream
            .initial_root()
            .await
            .map_err(DriverError::downstream)?;
        let preferred = self.settings.preferred_format;
        let seeded = state.clone();
        let inserted = self
            .commit(move |shared, txn| {
                format::initialize_collection(txn, &shared.surgeon, preferred, seeded.clone(), REVISION_ONE)
            })
            .await?;
        if inserted {
            self.loaded(preferred, REVISION_ONE);
            return Ok(state);
        }

        log::info!("[{}] collection was initialized concurrently; loading it", self.name());
        let (layout, loaded) = format::load(self.collection.all()?)?;
        self.loaded(layout, loaded.revision);
        self.downstream
            .submit_replacement(&Reference::root(), loaded.state.clone())
            .await
            .map_err(DriverError::downstream)?;
        Ok(loaded.state)
    }

    async fn initial_root(self: &Arc<Self>) -> Result<Value, DriverError> {
        let _guard = self.init_lock.lock().await;
        let root = match self.initialize_replication().await {
            Ok(Replication::Loaded(loaded)) => {
                // Dispatch has not started, so this cannot race with events
                let pushed = self
                    .downstream
                    .submit_replacement(&Reference::root(), loaded.state.clone())
                    .await;
                if let Err(e) = pushed {
                    self.set_connection(ConnectionState::Disconnected);
                    return Err(DriverError::downstream(e));
                }
                Some(loaded.state)
            }
            Ok(Replication::Uninitialized) => match self.seed().await {
                Ok(state) => Some(state),
                Err(e) => {
                    log::warn!("[{}] unable to initialize collection: {e}", self.name());
                    self.set_connection(ConnectionState::Disconnected);
                    None
                }
            },
            Err(DriverError::Closed) => return Err(DriverError::Closed),
            Err(_) => None,
        };

        match root {
            Some(state) => {
                if let Err(e) = self.receiver.start().await {
                    log::warn!("[{}] unable to start change feed: {e}", self.name());
                    self.set_connection(ConnectionState::Disconnected);
                }
                Ok(state)
            }
            None => {
                log::warn!("[{}] store unreachable; starting disconnected", self.name());
                self.downstream
                    .initial_root()
                    .await
                    .map_err(DriverError::downstream)
            }
        }
    }

    async fn reconnect(self: &Arc<Self>) -> Result<(), DriverError> {
        let _guard = self.init_lock.lock().await;
        // Resubscribe from a fresh position
        self.receiver.forget_marker();
        let loaded = match self.initialize_replication().await? {
            Replication::Loaded(loaded) => loaded,
            Replication::Uninitialized => {
                log::warn!("[{}] collection is uninitialized; driver is disconnected", self.name());
                return Err(DriverError::UninitializedStore);
            }
        };
        let pushed = self
            .downstream
            .submit_replacement(&Reference::root(), loaded.state)
            .await
            .map_err(DriverError::downstream);
        if let Err(e) = pushed {
            self.set_connection(ConnectionState::Disconnected);
            return Err(e);
        }
        if self.is_closed() {
            return Err(DriverError::Closed);
        }
        if let Err(e) = self.receiver.start().await {
            self.set_connection(ConnectionState::Disconnected);
            return Err(e);
        }
        Ok(())
    }

    async fn recover_from(self: Arc<Self>, error: DriverError) {
        if self.is_closed() {
            return;
        }
        log::error!("[{}] recovering from unexpected error; reinitializing: {error}", self.name());
        match self.reconnect().await {
            Ok(()) => log::info!("[{}] recovery complete", self.name()),
            Err(e) => log::warn!("[{}] recovery failed; driver is disconnected: {e}", self.name()),
        }
    }

    async fn apply_event(&self, event: ChangeEvent) -> Result<(), DriverError> {
        if let Some(delay) = self.settings.testing.event_delay() {
            tokio::time::sleep(delay).await;
        }
        let translated = format::translate(&event)?;
        if let Some(revision) = translated.revision {
            let skip = self.revision_to_skip.load(Ordering::SeqCst);
            if revision <= skip {
                log::trace!("[{}] skipping event {} at revision {revision} <= {skip}", self.name(), event.marker);
                return Ok(());
            }
        }
        if translated.layout_changed {
            return Err(DriverError::LayoutChanged(event.marker));
        }

        self.flush_lock.started_revision(translated.revision);
        for update in translated.updates {
            let applied = match update {
                Update::Replace(target, value) => {
                    log::trace!("[{}] downstream replace {target}", self.name());
                    self.downstream.submit_replacement(&target, value).await
                }
                Update::Delete(target) => {
                    log::trace!("[{}] downstream delete {target}", self.name());
                    self.downstream.submit_deletion(&target).await
                }
            };
            applied.map_err(DriverError::downstream)?;
        }
        self.flush_lock.finished_revision(translated.revision);
        Ok(())
    }

    async fn write(
        self: &Arc<Self>,
        target: &Reference,
        write: Write,
        precondition: Option<(&Reference, &str)>,
    ) -> Result<(), DriverError> {
        self.require_connected()?;
        let target = target.require_concrete()?.clone();
        let precondition = match precondition {
            Some((reference, value)) => Some((reference.require_concrete()?.clone(), value.to_string())),
            None => None,
        };
        if let Some(delay) = self.settings.testing.update_delay() {
            tokio::time::sleep(delay).await;
        }

        let written = target.clone();
        let changed = self
            .commit(move |shared, txn| {
                let layout = format::Layout::detect(txn, &shared.surgeon)?;
                if let Some((path, required)) = &precondition {
                    if !layout.precondition_holds(txn, path, required)? {
                        return Ok(false);
                    }
                }
                let changed = layout.apply(txn, &written, write.clone())?;
                if changed {
                    format::bump_revision(txn, Vec::new())?;
                }
                Ok(changed)
            })
            .await?;
        if !changed {
            log::debug!("[{}] write to {target} had no effect", self.name());
        }
        Ok(())
    }

    async fn flush(self: &Arc<Self>) -> Result<(), DriverError> {
        self.require_connected()?;
        let revision = match self.settings.flush_mode {
            FlushMode::RevisionFieldOnly => {
                let root = self
                    .collection
                    .get(ROOT_ID)?
                    .ok_or(DriverError::UninitializedStore)?;
                format::revision_of(&root)?
            }
            FlushMode::Echo => {
                let token = Uuid::new_v4().to_string();
                self.commit(move |_, txn| format::echo(txn, &token)).await?
            }
        };
        self.flush_lock
            .await_revision(revision, self.settings.flush_timeout())
            .await?;
        self.downstream.flush().await.map_err(DriverError::downstream)
    }

    async fn refurbish(self: &Arc<Self>) -> Result<(), DriverError> {
        self.require_connected()?;
        let preferred = self.settings.preferred_format;
        let revision = self
            .commit(move |shared, txn| {
                let (_, loaded) = format::load(txn.all()?)?;
                txn.delete_all()?;
                let revision = loaded.revision + 1;
                format::initialize_collection(txn, &shared.surgeon, preferred, loaded.state, revision)?;
                Ok(revision)
            })
            .await?;
        log::info!("[{}] refurbished collection as {} at revision {revision}", self.name(), preferred.as_str());
        Ok(())
    }
}

struct EventListener<D: TreeDriver + 'static> {
    shared: Weak<Shared<D>>,
}

#[async_trait]
impl<D: TreeDriver + 'static> ChangeListener for EventListener<D> {
    async fn on_event(&self, event: ChangeEvent) -> Result<(), DriverError> {
        let shared = self.shared.upgrade().ok_or(DriverError::Closed)?;
        shared.apply_event(event).await
    }

    async fn on_error(&self, error: DriverError) {
        if let Some(shared) = self.shared.upgrade() {
            shared.set_connection(ConnectionState::Disconnected);
            // Recovery restarts the receiver, so it cannot run on the
            // receiver's own task
            tokio::spawn(shared.recover_from(error));
        }
    }
}

#[async_trait]
impl<D: TreeDriver + 'static> TreeDriver for ReplicationDriver<D> {
    type Error = DriverError;

    async fn initial_root(&self) -> Result<Value, DriverError> {
        log::debug!("+ [{}] initial_root", self.name());
        self.shared.initial_root().await
    }

    async fn submit_replacement(&self, target: &Reference, new_value: Value) -> Result<(), DriverError> {
        log::debug!("+ [{}] submit_replacement({target})", self.name());
        self.shared.write(target, Write::Replace(new_value), None).await
    }

    async fn submit_conditional_replacement(
        &self,
        target: &Reference,
        new_value: Value,
        precondition: &Reference,
        required_value: &str,
    ) -> Result<(), DriverError> {
        log::debug!(
            "+ [{}] submit_conditional_replacement({target}, {precondition} = {required_value})",
            self.name()
        );
        self.shared
            .write(target, Write::Replace(new_value), Some((precondition, required_value)))
            .await
    }

    async fn submit_initialization(&self, target: &Reference, new_value: Value) -> Result<(), DriverError> {
        log::debug!("+ [{}] submit_initialization({target})", self.name());
        self.shared.write(target, Write::Initialize(new_value), None).await
    }

    async fn submit_deletion(&self, target: &Reference) -> Result<(), DriverError> {
        log::debug!("+ [{}] submit_deletion({target})", self.name());
        self.shared.write(target, Write::Delete, None).await
    }

    async fn submit_conditional_deletion(
        &self,
        target: &Reference,
        precondition: &Reference,
        required_value: &str,
    ) -> Result<(), DriverError> {
        log::debug!(
            "+ [{}] submit_conditional_deletion({target}, {precondition} = {required_value})",
            self.name()
        );
        self.shared
            .write(target, Write::Delete, Some((precondition, required_value)))
            .await
    }

    async fn flush(&self) -> Result<(), DriverError> {
        log::debug!("+ [{}] flush", self.name());
        self.shared.flush().await
    }
}

#[async_trait]
impl<D: TreeDriver + 'static> ReplicaDriver for ReplicationDriver<D> {
    async fn refurbish(&self) -> Result<(), DriverError> {
        log::debug!("+ [{}] refurbish", self.name());
        self.shared.refurbish().await
    }

    async fn close(&self) {
        log::debug!("+ [{}] close", self.name());
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.receiver.close().await;
        self.shared.set_connection(ConnectionState::Disconnected);
    }
}
