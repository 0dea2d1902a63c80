//! # canopy-replica: Replicates a state tree through a document store
//!
//! Keeps any number of local tree replicas in step by writing every update
//! to a shared collection and applying the collection's commit stream back
//! onto each replica.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   submit_*    ┌───────────────────┐  transact   ┌────────────┐
//! │ ModeFacade  │ ────────────► │ ReplicationDriver │ ──────────► │ Collection │
//! │ (swappable) │               │                   │             │ (RocksDB)  │
//! └─────────────┘               └─────────┬─────────┘             └─────┬──────┘
//!                                         │ DocumentSurgeon             │ commits
//!                                         ▼                             ▼
//!                               ┌───────────────────┐   events  ┌──────────────────┐
//!                               │ downstream replica│ ◄──────── │ChangeFeedReceiver│
//!                               └───────────────────┘           └──────────────────┘
//!                                         │
//!                                         ▼
//!                               RevisionFlushLock (flush waiters)
//! ```
//!
//! ## Modules
//!
//! - [`surgeon`]: scatter a tree into fragments, gather it back
//! - [`receiver`]: background consumer of the commit stream
//! - [`flush_lock`]: applied-revision high-water mark with waiters
//! - [`driver`]: the replicating driver, its layout and event translation
//! - [`modal`]: facade switching between disconnected and connected drivers
//! - [`store`]: collection contract and the RocksDB-backed collection
//! - [`settings`]: driver configuration

pub mod driver;
pub mod error;
pub mod flush_lock;
pub mod modal;
pub mod receiver;
pub mod settings;
pub mod store;
pub mod surgeon;

// Re-exports for convenience
pub use driver::{ConnectionState, ReplicaDriver, Replication, ReplicationDriver, StateAndRevision};
pub use error::DriverError;
pub use flush_lock::RevisionFlushLock;
pub use modal::{DriverMode, ModeFacade, ReconnectionHandle, SharedDriver};
pub use receiver::{ChangeFeedReceiver, ChangeListener};
pub use settings::{DriverSettings, FlushMode, StorageFormat, TestingSettings};
pub use store::{
    Change, ChangeEvent, ChangeStream, Collection, ResumeMarker, RocksCollection, StoreConfig,
    StoreError, Transaction,
};
pub use surgeon::{DocumentSurgeon, Fragment, GraftPoint, SurgeonError};
