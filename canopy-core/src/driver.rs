//! The driver contract every tree replica speaks.
//!
//! A driver receives updates addressed by [`Reference`]s. Drivers compose as
//! decorators: a replicating driver forwards the updates it observes to a
//! downstream driver that owns the local copy of the tree.

use async_trait::async_trait;
use serde_json::Value;

use crate::reference::Reference;

#[async_trait]
pub trait TreeDriver: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// The state the tree should start from.
    async fn initial_root(&self) -> Result<Value, Self::Error>;

    /// Put `new_value` at `target`. No effect if the parent does not exist.
    async fn submit_replacement(&self, target: &Reference, new_value: Value) -> Result<(), Self::Error>;

    /// Like [`submit_replacement`](Self::submit_replacement), but only if
    /// the identifier at `precondition` equals `required_value`.
    async fn submit_conditional_replacement(
        &self,
        target: &Reference,
        new_value: Value,
        precondition: &Reference,
        required_value: &str,
    ) -> Result<(), Self::Error>;

    /// Put `new_value` at `target` only if nothing is there yet.
    async fn submit_initialization(&self, target: &Reference, new_value: Value) -> Result<(), Self::Error>;

    /// Remove the node at `target` if it exists.
    async fn submit_deletion(&self, target: &Reference) -> Result<(), Self::Error>;

    async fn submit_conditional_deletion(
        &self,
        target: &Reference,
        precondition: &Reference,
        required_value: &str,
    ) -> Result<(), Self::Error>;

    /// Returns once every update submitted before the call is visible.
    async fn flush(&self) -> Result<(), Self::Error>;
}
