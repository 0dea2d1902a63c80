//! Document store contract used by the replication driver.
//!
//! A [`Collection`] holds JSON documents keyed by their `_id` field. Writes go
//! through [`Collection::transact`]: all changes made by one transaction
//! become visible together and are announced as one [`ChangeEvent`] on every
//! open [`ChangeStream`].
//!
//! ```text
//!   transact(body) ──► commit ──► changes log [seq] ──► ChangeStream::next()
//!                                                        (one event per commit)
//! ```
//!
//! - [`rocks`]: RocksDB-backed collection with a durable change log

pub mod rocks;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use rocks::{RocksCollection, StoreConfig};

/// Field holding a document's key.
pub const ID_FIELD: &str = "_id";

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("document has no string _id")]
    MissingId,
    #[error("resume marker {0} is not in the change log")]
    UnknownMarker(ResumeMarker),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store closed")]
    Closed,
    #[error("transaction aborted")]
    Aborted,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Position in the commit stream. Resuming after a marker yields strictly
/// later events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeMarker(pub u64);

impl fmt::Display for ResumeMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One document-level change within a committed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Change {
    Insert {
        document: Value,
    },
    Replace {
        document: Value,
    },
    /// Field-level update; `document` is the post-image.
    Update {
        id: String,
        updated: Vec<(Vec<String>, Value)>,
        removed: Vec<Vec<String>>,
        document: Value,
    },
    Delete {
        id: String,
    },
}

impl Change {
    /// ID of the document this change touches.
    pub fn document_id(&self) -> Option<&str> {
        match self {
            Change::Insert { document } | Change::Replace { document } => document_id(document),
            Change::Update { id, .. } | Change::Delete { id } => Some(id),
        }
    }
}

/// Everything one transaction committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub marker: ResumeMarker,
    pub changes: Vec<Change>,
}

pub fn document_id(document: &Value) -> Option<&str> {
    document.get(ID_FIELD).and_then(Value::as_str)
}

/// Committed documents as seen from inside a transaction.
pub trait DocumentSource {
    fn load(&self, id: &str) -> StoreResult<Option<Value>>;
    fn load_all(&self) -> StoreResult<Vec<Value>>;
}

/// Pending writes of one transaction, layered over committed state.
pub struct Transaction<'a> {
    source: &'a dyn DocumentSource,
    overlay: BTreeMap<String, Option<Value>>,
    changes: Vec<Change>,
}

impl<'a> Transaction<'a> {
    pub fn new(source: &'a dyn DocumentSource) -> Self {
        Self {
            source,
            overlay: BTreeMap::new(),
            changes: Vec::new(),
        }
    }

    pub fn get(&self, id: &str) -> StoreResult<Option<Value>> {
        match self.overlay.get(id) {
            Some(pending) => Ok(pending.clone()),
            None => self.source.load(id),
        }
    }

    /// Every document, ordered by ID.
    pub fn all(&self) -> StoreResult<Vec<Value>> {
        let mut merged: BTreeMap<String, Value> = BTreeMap::new();
        for document in self.source.load_all()? {
            let id = document_id(&document).ok_or(StoreError::MissingId)?.to_string();
            merged.insert(id, document);
        }
        for (id, pending) in &self.overlay {
            match pending {
                Some(document) => merged.insert(id.clone(), document.clone()),
                None => merged.remove(id),
            };
        }
        Ok(merged.into_values().collect())
    }

    /// Insert `document` unless its ID is taken. Returns whether it was
    /// inserted.
    pub fn insert(&mut self, document: Value) -> StoreResult<bool> {
        let id = document_id(&document).ok_or(StoreError::MissingId)?.to_string();
        if self.get(&id)?.is_some() {
            return Ok(false);
        }
        self.overlay.insert(id, Some(document.clone()));
        self.changes.push(Change::Insert { document });
        Ok(true)
    }

    /// Insert or overwrite `document`.
    pub fn replace(&mut self, document: Value) -> StoreResult<()> {
        let id = document_id(&document).ok_or(StoreError::MissingId)?.to_string();
        let change = if self.get(&id)?.is_some() {
            Change::Replace {
                document: document.clone(),
            }
        } else {
            Change::Insert {
                document: document.clone(),
            }
        };
        self.overlay.insert(id, Some(document));
        self.changes.push(change);
        Ok(())
    }

    /// Set and remove fields of an existing document. Missing intermediate
    /// fields of a `set` path are created. Returns false if the document
    /// does not exist.
    pub fn update(
        &mut self,
        id: &str,
        set: Vec<(Vec<String>, Value)>,
        unset: Vec<Vec<String>>,
    ) -> StoreResult<bool> {
        let Some(mut document) = self.get(id)? else {
            return Ok(false);
        };
        for (field, value) in &set {
            set_field(&mut document, field, value.clone());
        }
        for field in &unset {
            unset_field(&mut document, field);
        }
        self.overlay.insert(id.to_string(), Some(document.clone()));
        self.changes.push(Change::Update {
            id: id.to_string(),
            updated: set,
            removed: unset,
            document,
        });
        Ok(true)
    }

    /// Returns whether the document existed.
    pub fn delete(&mut self, id: &str) -> StoreResult<bool> {
        if self.get(id)?.is_none() {
            return Ok(false);
        }
        self.overlay.insert(id.to_string(), None);
        self.changes.push(Change::Delete { id: id.to_string() });
        Ok(true)
    }

    /// Delete every document. Returns how many there were.
    pub fn delete_all(&mut self) -> StoreResult<usize> {
        let ids: Vec<String> = self
            .all()?
            .iter()
            .filter_map(|d| document_id(d).map(str::to_string))
            .collect();
        for id in &ids {
            self.delete(id)?;
        }
        Ok(ids.len())
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Final document writes and the ordered change list.
    pub fn into_parts(self) -> (BTreeMap<String, Option<Value>>, Vec<Change>) {
        (self.overlay, self.changes)
    }
}

fn set_field(document: &mut Value, field: &[String], value: Value) {
    let Some((key, parents)) = field.split_last() else {
        *document = value;
        return;
    };
    let mut current = document;
    for segment in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        current = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        map.insert(key.clone(), value);
    }
}

fn unset_field(document: &mut Value, field: &[String]) {
    let Some((key, parents)) = field.split_last() else {
        return;
    };
    if let Some(container) = canopy_core::node::container_mut(document, parents) {
        container.remove(key);
    }
}

/// The body of a transaction. Returning an error abandons every write.
pub type TransactionBody<'b> = dyn FnMut(&mut Transaction<'_>) -> StoreResult<()> + 'b;

/// A keyed set of JSON documents with atomic transactions and a commit
/// stream.
pub trait Collection: Send + Sync {
    fn get(&self, id: &str) -> StoreResult<Option<Value>>;

    fn all(&self) -> StoreResult<Vec<Value>>;

    /// Run `body` and commit its writes atomically. Returns the marker of
    /// the resulting event, or `None` if the transaction wrote nothing.
    fn transact(&self, body: &mut TransactionBody<'_>) -> StoreResult<Option<ResumeMarker>>;

    /// Open a stream of commits after `resume_after`, or after the latest
    /// commit if `None`.
    fn watch(&self, resume_after: Option<ResumeMarker>) -> StoreResult<Box<dyn ChangeStream>>;
}

/// Ordered commits of one collection.
#[async_trait]
pub trait ChangeStream: Send {
    /// Wait for the next commit.
    async fn next(&mut self) -> StoreResult<ChangeEvent>;

    /// The next commit if one is already available.
    fn try_next(&mut self) -> StoreResult<Option<ChangeEvent>>;

    /// Marker of the last event returned, or of the position the stream
    /// was opened at.
    fn resume_marker(&self) -> Option<ResumeMarker>;
}
