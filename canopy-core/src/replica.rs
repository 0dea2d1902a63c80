//! In-memory replica of the state tree.
//!
//! `TreeReplica` is the end of a driver chain: it owns the local copy of the
//! tree and applies updates to it directly.

use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::driver::TreeDriver;
use crate::node;
use crate::path::{Path, PathError};
use crate::reference::Reference;

/// Errors from applying updates to a local tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error(transparent)]
    InvalidPath(#[from] PathError),
    #[error("the root node cannot be deleted")]
    RootDeletion,
    #[error("tree lock poisoned")]
    Poisoned,
    #[error("{0}")]
    Rejected(String),
}

/// The local copy of a replicated tree.
pub struct TreeReplica {
    initial: Value,
    state: RwLock<Value>,
}

impl TreeReplica {
    /// Create a replica whose state starts at `initial`.
    pub fn new(initial: Value) -> Self {
        Self {
            state: RwLock::new(initial.clone()),
            initial,
        }
    }

    /// Clone of the whole current tree.
    pub fn snapshot(&self) -> Result<Value, TreeError> {
        Ok(self.state.read().map_err(|_| TreeError::Poisoned)?.clone())
    }

    /// Clone of the node at `path`, if present.
    pub fn read(&self, path: &Path) -> Result<Option<Value>, TreeError> {
        let state = self.state.read().map_err(|_| TreeError::Poisoned)?;
        Ok(node::lookup(&state, path.segments()).cloned())
    }

    fn precondition_holds(&self, precondition: &Reference, required_value: &str) -> Result<bool, TreeError> {
        let path = precondition.require_concrete()?;
        let state = self.state.read().map_err(|_| TreeError::Poisoned)?;
        Ok(matches!(node::lookup(&state, path.segments()), Some(Value::String(s)) if s == required_value))
    }

    fn put(&self, target: &Reference, new_value: Value, only_if_absent: bool) -> Result<(), TreeError> {
        let path = target.require_concrete()?;
        let mut state = self.state.write().map_err(|_| TreeError::Poisoned)?;
        let Some((key, parent)) = path.segments().split_last() else {
            *state = new_value;
            return Ok(());
        };
        match node::container_mut(&mut state, parent) {
            Some(container) => {
                if !(only_if_absent && container.contains_key(key)) {
                    container.insert(key.clone(), new_value);
                }
            }
            None => log::debug!("Ignoring update to {target}: parent does not exist"),
        }
        Ok(())
    }

    fn remove(&self, target: &Reference) -> Result<(), TreeError> {
        let path = target.require_concrete()?;
        let (key, parent) = path.segments().split_last().ok_or(TreeError::RootDeletion)?;
        let mut state = self.state.write().map_err(|_| TreeError::Poisoned)?;
        if let Some(container) = node::container_mut(&mut state, parent) {
            container.remove(key);
        }
        Ok(())
    }
}

#[async_trait]
impl TreeDriver for TreeReplica {
    type Error = TreeError;

    async fn initial_root(&self) -> Result<Value, TreeError> {
        Ok(self.initial.clone())
    }

    async fn submit_replacement(&self, target: &Reference, new_value: Value) -> Result<(), TreeError> {
        self.put(target, new_value, false)
    }

    async fn submit_conditional_replacement(
        &self,
        target: &Reference,
        new_value: Value,
        precondition: &Reference,
        required_value: &str,
    ) -> Result<(), TreeError> {
        if self.precondition_holds(precondition, required_value)? {
            self.put(target, new_value, false)
        } else {
            Ok(())
        }
    }

    async fn submit_initialization(&self, target: &Reference, new_value: Value) -> Result<(), TreeError> {
        self.put(target, new_value, true)
    }

    async fn submit_deletion(&self, target: &Reference) -> Result<(), TreeError> {
        self.remove(target)
    }

    async fn submit_conditional_deletion(
        &self,
        target: &Reference,
        precondition: &Reference,
        required_value: &str,
    ) -> Result<(), TreeError> {
        if self.precondition_holds(precondition, required_value)? {
            self.remove(target)
        } else {
            Ok(())
        }
    }

    async fn flush(&self) -> Result<(), TreeError> {
        Ok(())
    }
}
