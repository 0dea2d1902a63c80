//! A driver that only remembers what it was asked to do.

use std::marker::PhantomData;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::driver::TreeDriver;
use crate::reference::Reference;

/// One recorded driver call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub name: String,
    pub arguments: Vec<Value>,
}

impl RecordedCall {
    pub fn of(name: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

/// Records every call; answers `initial_root` with a fixed tree.
///
/// The error type is a parameter so the recorder can stand in for any
/// driver. It never produces an error.
pub struct RecordingDriver<E = crate::replica::TreeError> {
    initial_root: Value,
    calls: Mutex<Vec<RecordedCall>>,
    _error: PhantomData<fn() -> E>,
}

impl<E> RecordingDriver<E> {
    pub fn new(initial_root: Value) -> Self {
        Self {
            initial_root,
            calls: Mutex::new(Vec::new()),
            _error: PhantomData,
        }
    }

    /// Append a call to the log. Public so wrapping drivers can record
    /// their own operations alongside the contract's.
    pub fn record(&self, name: &str, arguments: Vec<Value>) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall::of(name, arguments));
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }
}

fn reference_arg(reference: &Reference) -> Value {
    Value::String(reference.to_string())
}

#[async_trait]
impl<E> TreeDriver for RecordingDriver<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    type Error = E;

    async fn initial_root(&self) -> Result<Value, E> {
        Ok(self.initial_root.clone())
    }

    async fn submit_replacement(&self, target: &Reference, new_value: Value) -> Result<(), E> {
        self.record("submit_replacement", vec![reference_arg(target), new_value]);
        Ok(())
    }

    async fn submit_conditional_replacement(
        &self,
        target: &Reference,
        new_value: Value,
        precondition: &Reference,
        required_value: &str,
    ) -> Result<(), E> {
        self.record(
            "submit_conditional_replacement",
            vec![
                reference_arg(target),
                new_value,
                reference_arg(precondition),
                Value::String(required_value.to_string()),
            ],
        );
        Ok(())
    }

    async fn submit_initialization(&self, target: &Reference, new_value: Value) -> Result<(), E> {
        self.record("submit_initialization", vec![reference_arg(target), new_value]);
        Ok(())
    }

    async fn submit_deletion(&self, target: &Reference) -> Result<(), E> {
        self.record("submit_deletion", vec![reference_arg(target)]);
        Ok(())
    }

    async fn submit_conditional_deletion(
        &self,
        target: &Reference,
        precondition: &Reference,
        required_value: &str,
    ) -> Result<(), E> {
        self.record(
            "submit_conditional_deletion",
            vec![
                reference_arg(target),
                reference_arg(precondition),
                Value::String(required_value.to_string()),
            ],
        );
        Ok(())
    }

    async fn flush(&self) -> Result<(), E> {
        self.record("flush", Vec::new());
        Ok(())
    }
}
