//! Mode facade: one driver handle whose implementation can be swapped.
//!
//! ```text
//!                ┌──────────────── ModeFacade ────────────────┐
//!   caller ───►  │ current: Arc<DriverMode>                    │
//!                │   Disconnected(downstream)  → fail fast     │
//!                │   Reconnecting(outcome)     → wait, forward │
//!                │   Connected(driver)         → forward       │
//!                └─────────────────────────────────────────────┘
//! ```
//!
//! Every call reads the current mode once and delegates to it, so a swap
//! never affects an operation that is already running. The mode lives in an
//! [`ArcSwap`]: readers never wait on a transition.

use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use canopy_core::{Reference, TreeDriver};
use serde_json::Value;
use tokio::sync::watch;

use crate::driver::ReplicaDriver;
use crate::error::DriverError;

/// A live driver as the facade holds it.
pub type SharedDriver = Arc<dyn ReplicaDriver<Error = DriverError>>;

type Outcome = Option<Result<SharedDriver, String>>;

/// What the facade currently forwards to.
pub enum DriverMode<D: TreeDriver + 'static> {
    /// No store connection. Only `initial_root` succeeds, answered by the
    /// downstream.
    Disconnected(Arc<D>),
    /// A reconnection is in progress; calls wait for its outcome.
    Reconnecting(watch::Receiver<Outcome>),
    Connected(SharedDriver),
}

impl<D: TreeDriver + 'static> DriverMode<D> {
    pub fn name(&self) -> &'static str {
        match self {
            DriverMode::Disconnected(_) => "disconnected",
            DriverMode::Reconnecting(_) => "reconnecting",
            DriverMode::Connected(_) => "connected",
        }
    }
}

impl<D: TreeDriver + 'static> std::fmt::Debug for DriverMode<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DriverMode::{}", self.name())
    }
}

type Current<D> = Arc<ArcSwap<DriverMode<D>>>;

/// Swap `current` to `to` if it still is `from`.
fn compare_and_set<D: TreeDriver + 'static>(
    current: &ArcSwap<DriverMode<D>>,
    from: &Arc<DriverMode<D>>,
    to: Arc<DriverMode<D>>,
) -> bool {
    let next = to.name();
    let previous = current.compare_and_swap(from, to);
    if Arc::ptr_eq(&previous, from) {
        log::debug!("mode change: {} -> {next}", from.name());
        true
    } else {
        false
    }
}

/// Resolves a `Reconnecting` mode. Dropping it unresolved fails every
/// waiting call with [`DriverError::Reconnection`].
pub struct ReconnectionHandle<D: TreeDriver + 'static> {
    current: Current<D>,
    mode: Arc<DriverMode<D>>,
    downstream: Arc<D>,
    outcome: watch::Sender<Outcome>,
}

impl<D: TreeDriver + 'static> ReconnectionHandle<D> {
    /// Switch to `Connected(driver)` and release waiting calls to it.
    pub fn complete(self, driver: SharedDriver) -> bool {
        let swapped = compare_and_set(
            &self.current,
            &self.mode,
            Arc::new(DriverMode::Connected(Arc::clone(&driver))),
        );
        self.outcome.send_replace(Some(Ok(driver)));
        swapped
    }

    /// Switch back to `Disconnected` and fail waiting calls.
    pub fn fail(self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        log::warn!("reconnection failed: {reason}");
        let swapped = compare_and_set(
            &self.current,
            &self.mode,
            Arc::new(DriverMode::Disconnected(Arc::clone(&self.downstream))),
        );
        self.outcome.send_replace(Some(Err(reason)));
        swapped
    }
}

/// A [`ReplicaDriver`] that forwards to whichever implementation is current.
pub struct ModeFacade<D: TreeDriver + 'static> {
    name: String,
    downstream: Arc<D>,
    current: Current<D>,
}

impl<D: TreeDriver + 'static> ModeFacade<D> {
    /// Start in `Disconnected` mode.
    pub fn disconnected(name: impl Into<String>, downstream: Arc<D>) -> Self {
        let mode = Arc::new(DriverMode::Disconnected(Arc::clone(&downstream)));
        Self {
            name: name.into(),
            downstream,
            current: Arc::new(ArcSwap::new(mode)),
        }
    }

    /// Start in `Connected` mode, forwarding to `driver`.
    pub fn connected(name: impl Into<String>, downstream: Arc<D>, driver: SharedDriver) -> Self {
        Self {
            name: name.into(),
            downstream,
            current: Arc::new(ArcSwap::from_pointee(DriverMode::Connected(driver))),
        }
    }

    pub fn current_implementation(&self) -> Arc<DriverMode<D>> {
        self.current.load_full()
    }

    /// Install `to` if the current implementation is still `from`.
    ///
    /// Of several callers racing from the same `from`, exactly one wins.
    pub fn change_implementation(&self, from: &Arc<DriverMode<D>>, to: Arc<DriverMode<D>>) -> bool {
        compare_and_set(&self.current, from, to)
    }

    /// Enter `Reconnecting` from `from`. Returns `None` if another caller
    /// changed the mode first.
    pub fn begin_reconnection(&self, from: &Arc<DriverMode<D>>) -> Option<ReconnectionHandle<D>> {
        let (outcome, waiting) = watch::channel(None);
        let mode = Arc::new(DriverMode::Reconnecting(waiting));
        if !self.change_implementation(from, Arc::clone(&mode)) {
            return None;
        }
        log::info!("[{}] reconnecting", self.name);
        Some(ReconnectionHandle {
            current: Arc::clone(&self.current),
            mode,
            downstream: Arc::clone(&self.downstream),
            outcome,
        })
    }

    /// Switch to `Disconnected`, whatever the current mode.
    pub fn disconnect(&self) {
        let mode = Arc::new(DriverMode::Disconnected(Arc::clone(&self.downstream)));
        let previous = self.current.swap(mode);
        log::debug!("[{}] mode change: {} -> disconnected", self.name, previous.name());
    }

    /// The driver to forward a mutation to.
    async fn live(&self, operation: &str) -> Result<SharedDriver, DriverError> {
        let mode = self.current_implementation();
        log::debug!("+ [{}] {operation} ({})", self.name, mode.name());
        match &*mode {
            DriverMode::Disconnected(_) => Err(DriverError::Disconnected),
            DriverMode::Reconnecting(outcome) => await_outcome(outcome.clone()).await,
            DriverMode::Connected(driver) => Ok(Arc::clone(driver)),
        }
    }
}

async fn await_outcome(mut outcome: watch::Receiver<Outcome>) -> Result<SharedDriver, DriverError> {
    loop {
        let resolved = outcome.borrow_and_update().clone();
        if let Some(result) = resolved {
            return result.map_err(DriverError::Reconnection);
        }
        if outcome.changed().await.is_err() {
            let resolved = outcome.borrow().clone();
            return match resolved {
                Some(result) => result.map_err(DriverError::Reconnection),
                None => Err(DriverError::Reconnection("reconnection abandoned".to_string())),
            };
        }
    }
}

#[async_trait]
impl<D: TreeDriver + 'static> TreeDriver for ModeFacade<D> {
    type Error = DriverError;

    async fn initial_root(&self) -> Result<Value, DriverError> {
        let mode = self.current_implementation();
        log::debug!("+ [{}] initial_root ({})", self.name, mode.name());
        match &*mode {
            DriverMode::Disconnected(downstream) => {
                downstream.initial_root().await.map_err(DriverError::downstream)
            }
            DriverMode::Reconnecting(outcome) => {
                await_outcome(outcome.clone()).await?.initial_root().await
            }
            DriverMode::Connected(driver) => driver.initial_root().await,
        }
    }

    async fn submit_replacement(&self, target: &Reference, new_value: Value) -> Result<(), DriverError> {
        self.live("submit_replacement")
            .await?
            .submit_replacement(target, new_value)
            .await
    }

    async fn submit_conditional_replacement(
        &self,
        target: &Reference,
        new_value: Value,
        precondition: &Reference,
        required_value: &str,
    ) -> Result<(), DriverError> {
        self.live("submit_conditional_replacement")
            .await?
            .submit_conditional_replacement(target, new_value, precondition, required_value)
            .await
    }

    async fn submit_initialization(&self, target: &Reference, new_value: Value) -> Result<(), DriverError> {
        self.live("submit_initialization")
            .await?
            .submit_initialization(target, new_value)
            .await
    }

    async fn submit_deletion(&self, target: &Reference) -> Result<(), DriverError> {
        self.live("submit_deletion").await?.submit_deletion(target).await
    }

    async fn submit_conditional_deletion(
        &self,
        target: &Reference,
        precondition: &Reference,
        required_value: &str,
    ) -> Result<(), DriverError> {
        self.live("submit_conditional_deletion")
            .await?
            .submit_conditional_deletion(target, precondition, required_value)
            .await
    }

    async fn flush(&self) -> Result<(), DriverError> {
        self.live("flush").await?.flush().await
    }
}

#[async_trait]
impl<D: TreeDriver + 'static> ReplicaDriver for ModeFacade<D> {
    async fn refurbish(&self) -> Result<(), DriverError> {
        self.live("refurbish").await?.refurbish().await
    }

    async fn close(&self) {
        let mode = self.current_implementation();
        log::debug!("+ [{}] close ({})", self.name, mode.name());
        if let DriverMode::Connected(driver) = &*mode {
            driver.close().await;
        }
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::RecordingDriver;
    use serde_json::json;

    type Recorder = RecordingDriver<DriverError>;

    struct RecordingReplica(Recorder);

    #[async_trait]
    impl TreeDriver for RecordingReplica {
        type Error = DriverError;

        async fn initial_root(&self) -> Result<Value, DriverError> {
            self.0.initial_root().await
        }

        async fn submit_replacement(&self, target: &Reference, new_value: Value) -> Result<(), DriverError> {
            self.0.submit_replacement(target, new_value).await
        }

        async fn submit_conditional_replacement(
            &self,
            target: &Reference,
            new_value: Value,
            precondition: &Reference,
            required_value: &str,
        ) -> Result<(), DriverError> {
            self.0
                .submit_conditional_replacement(target, new_value, precondition, required_value)
                .await
        }

        async fn submit_initialization(&self, target: &Reference, new_value: Value) -> Result<(), DriverError> {
            self.0.submit_initialization(target, new_value).await
        }

        async fn submit_deletion(&self, target: &Reference) -> Result<(), DriverError> {
            self.0.submit_deletion(target).await
        }

        async fn submit_conditional_deletion(
            &self,
            target: &Reference,
            precondition: &Reference,
            required_value: &str,
        ) -> Result<(), DriverError> {
            self.0
                .submit_conditional_deletion(target, precondition, required_value)
                .await
        }

        async fn flush(&self) -> Result<(), DriverError> {
            self.0.flush().await
        }
    }

    #[async_trait]
    impl ReplicaDriver for RecordingReplica {
        async fn refurbish(&self) -> Result<(), DriverError> {
            self.0.record("refurbish", Vec::new());
            Ok(())
        }

        async fn close(&self) {
            self.0.record("close", Vec::new());
        }
    }

    fn call_names(replica: &RecordingReplica) -> Vec<String> {
        replica.0.calls().into_iter().map(|c| c.name).collect()
    }

    #[tokio::test]
    async fn test_disconnected_fails_fast() {
        let facade = ModeFacade::disconnected("test", Arc::new(Recorder::new(json!({"a": 1}))));
        let target = Reference::parse("/a").unwrap();

        assert_eq!(facade.initial_root().await.unwrap(), json!({"a": 1}));
        assert!(matches!(
            facade.submit_replacement(&target, json!(2)).await,
            Err(DriverError::Disconnected)
        ));
        assert!(matches!(facade.flush().await, Err(DriverError::Disconnected)));
        assert!(matches!(facade.refurbish().await, Err(DriverError::Disconnected)));
    }

    #[tokio::test]
    async fn test_connected_forwards() {
        let replica = Arc::new(RecordingReplica(Recorder::new(json!({}))));
        let facade = ModeFacade::connected(
            "test",
            Arc::new(Recorder::new(json!({}))),
            replica.clone() as SharedDriver,
        );
        let target = Reference::parse("/a").unwrap();

        facade.submit_replacement(&target, json!(1)).await.unwrap();
        facade.submit_deletion(&target).await.unwrap();
        facade.refurbish().await.unwrap();
        facade.close().await;

        assert_eq!(
            call_names(&replica),
            ["submit_replacement", "submit_deletion", "refurbish", "close"]
        );
        assert_eq!(facade.current_implementation().name(), "disconnected");
    }

    #[tokio::test]
    async fn test_change_implementation_requires_expected() {
        let facade = ModeFacade::disconnected("test", Arc::new(Recorder::new(json!({}))));
        let stale = Arc::new(DriverMode::Disconnected(Arc::new(Recorder::new(json!({})))));
        let replica: SharedDriver = Arc::new(RecordingReplica(Recorder::new(json!({}))));

        assert!(!facade.change_implementation(&stale, Arc::new(DriverMode::Connected(replica.clone()))));
        let current = facade.current_implementation();
        assert!(facade.change_implementation(&current, Arc::new(DriverMode::Connected(replica))));
        assert_eq!(facade.current_implementation().name(), "connected");
    }

    #[tokio::test]
    async fn test_reconnecting_waits_for_outcome() {
        let facade = Arc::new(ModeFacade::disconnected("test", Arc::new(Recorder::new(json!({})))));
        let handle = facade
            .begin_reconnection(&facade.current_implementation())
            .unwrap();
        assert_eq!(facade.current_implementation().name(), "reconnecting");

        let waiting = {
            let facade = Arc::clone(&facade);
            tokio::spawn(async move { facade.flush().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        let replica = Arc::new(RecordingReplica(Recorder::new(json!({}))));
        assert!(handle.complete(replica.clone() as SharedDriver));

        waiting.await.unwrap().unwrap();
        assert_eq!(call_names(&replica), ["flush"]);
        assert_eq!(facade.current_implementation().name(), "connected");
    }

    #[tokio::test]
    async fn test_reconnection_failure_and_abandonment() {
        let facade = ModeFacade::disconnected("test", Arc::new(Recorder::new(json!({}))));

        let handle = facade.begin_reconnection(&facade.current_implementation()).unwrap();
        let mode = facade.current_implementation();
        assert!(handle.fail("store unreachable"));
        let DriverMode::Reconnecting(outcome) = &*mode else {
            panic!("expected reconnecting, got {mode:?}");
        };
        assert!(matches!(
            await_outcome(outcome.clone()).await,
            Err(DriverError::Reconnection(reason)) if reason == "store unreachable"
        ));
        assert_eq!(facade.current_implementation().name(), "disconnected");

        let handle = facade.begin_reconnection(&facade.current_implementation()).unwrap();
        drop(handle);
        assert!(matches!(facade.flush().await, Err(DriverError::Reconnection(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_see_whole_modes_during_swaps() {
        let facade = Arc::new(ModeFacade::disconnected("test", Arc::new(Recorder::new(json!({})))));
        let replica: SharedDriver = Arc::new(RecordingReplica(Recorder::new(json!({}))));
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let facade = Arc::clone(&facade);
                let stop = Arc::clone(&stop);
                tokio::task::spawn_blocking(move || {
                    while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                        let mode = facade.current_implementation();
                        assert!(matches!(mode.name(), "disconnected" | "connected"));
                    }
                })
            })
            .collect();

        for _ in 0..1000 {
            let current = facade.current_implementation();
            let next = match &*current {
                DriverMode::Connected(_) => Arc::new(DriverMode::Disconnected(Arc::clone(&facade.downstream))),
                _ => Arc::new(DriverMode::Connected(Arc::clone(&replica))),
            };
            // Sole writer: every swap from the value just read succeeds
            assert!(facade.change_implementation(&current, next));
        }
        stop.store(true, std::sync::atomic::Ordering::Relaxed);

        for reader in readers {
            reader.await.unwrap();
        }
        assert_eq!(facade.current_implementation().name(), "disconnected");
    }

    #[tokio::test]
    async fn test_second_reconnection_loses() {
        let facade = ModeFacade::disconnected("test", Arc::new(Recorder::new(json!({}))));
        let from = facade.current_implementation();

        let first = facade.begin_reconnection(&from);
        let second = facade.begin_reconnection(&from);
        assert!(first.is_some());
        assert!(second.is_none());
    }
}
