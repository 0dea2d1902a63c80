//! Background consumer of a collection's commit stream.
//!
//! ```text
//!   initialize(listener) ─► watch(after last marker | tail) ─► [initial event]
//!   start() ─► spawn ─┐
//!                     ▼
//!            ┌─ select! ───────────────────────────┐
//!            │  stop signal    → return            │
//!            │  stream.next()  → listener.on_event │
//!            └──────── error → listener.on_error ──┘ (once, then return)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::DriverError;
use crate::store::{ChangeEvent, ChangeStream, Collection, ResumeMarker};

/// Longest `stop` waits for the loop before aborting it.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Receives commits in order.
#[async_trait]
pub trait ChangeListener: Send + Sync {
    async fn on_event(&self, event: ChangeEvent) -> Result<(), DriverError>;

    /// Called at most once per loop, after which the loop has ended.
    async fn on_error(&self, error: DriverError);
}

struct Worker {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct ReceiverState {
    listener: Option<Arc<dyn ChangeListener>>,
    stream: Option<Box<dyn ChangeStream>>,
    initial_event: Option<ChangeEvent>,
    worker: Option<Worker>,
}

/// Owns the single task that pulls commits and hands them to a listener.
pub struct ChangeFeedReceiver {
    name: String,
    collection: Arc<dyn Collection>,
    state: tokio::sync::Mutex<ReceiverState>,
    last_marker: Arc<Mutex<Option<ResumeMarker>>>,
    closed: AtomicBool,
}

impl ChangeFeedReceiver {
    pub fn new(name: impl Into<String>, collection: Arc<dyn Collection>) -> Self {
        Self {
            name: name.into(),
            collection,
            state: tokio::sync::Mutex::new(ReceiverState::default()),
            last_marker: Arc::new(Mutex::new(None)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn last_marker(&self) -> Option<ResumeMarker> {
        *self.last_marker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the resume position so the next `initialize` opens at the tail.
    pub fn forget_marker(&self) {
        *self.last_marker.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn is_running(&self) -> bool {
        let state = self.state.lock().await;
        state.worker.as_ref().is_some_and(|w| !w.handle.is_finished())
    }

    /// Stop any running loop and open a fresh subscription for `listener`.
    ///
    /// Resumes after the last recorded marker if there is one. Otherwise
    /// opens at the tail and captures one pending event, if any, to be
    /// dispatched first by `start`. Returns whether a resume marker is held.
    pub async fn initialize(&self, listener: Arc<dyn ChangeListener>) -> Result<bool, DriverError> {
        if self.is_closed() {
            return Err(DriverError::Closed);
        }
        let mut state = self.state.lock().await;
        self.stop_worker(&mut state).await;
        state.stream = None;
        state.initial_event = None;
        state.listener = Some(listener);

        let resume_after = self.last_marker();
        let mut stream = self
            .collection
            .watch(resume_after)
            .map_err(|e| DriverError::ReceiverInitialization(e.to_string()))?;

        if resume_after.is_some() {
            log::debug!("[{}] resuming change feed after {:?}", self.name, resume_after);
        } else {
            match stream.try_next() {
                Ok(Some(event)) => {
                    log::debug!("[{}] captured initial event {}", self.name, event.marker);
                    state.initial_event = Some(event);
                }
                Ok(None) => {
                    *self.last_marker.lock().unwrap_or_else(PoisonError::into_inner) = stream.resume_marker();
                }
                Err(e) => return Err(DriverError::ReceiverInitialization(e.to_string())),
            }
        }
        state.stream = Some(stream);
        Ok(self.last_marker().is_some())
    }

    /// Launch the dispatch loop. No effect if it is already running.
    pub async fn start(&self) -> Result<(), DriverError> {
        if self.is_closed() {
            return Err(DriverError::Closed);
        }
        let mut state = self.state.lock().await;
        if state.worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            return Ok(());
        }
        let (Some(stream), Some(listener)) = (state.stream.take(), state.listener.clone()) else {
            return Err(DriverError::ReceiverInitialization(
                "receiver was not initialized".to_string(),
            ));
        };
        let initial_event = state.initial_event.take();
        let (stop, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(run_loop(
            self.name.clone(),
            stream,
            initial_event,
            listener,
            Arc::clone(&self.last_marker),
            stop_rx,
        ));
        state.worker = Some(Worker { stop, handle });
        log::debug!("[{}] change feed started", self.name);
        Ok(())
    }

    /// Signal the loop to stop and wait for it. Idempotent.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        self.stop_worker(&mut state).await;
    }

    /// Stop for good; `start` is refused afterwards.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        self.stop_worker(&mut state).await;
        state.stream = None;
        state.listener = None;
    }

    async fn stop_worker(&self, state: &mut ReceiverState) {
        let Some(Worker { stop, mut handle }) = state.worker.take() else {
            return;
        };
        // Already-finished loops have dropped their receiver
        let _ = stop.send(());
        match tokio::time::timeout(STOP_TIMEOUT, &mut handle).await {
            Ok(_) => log::debug!("[{}] change feed stopped", self.name),
            Err(_) => {
                log::warn!("[{}] change feed did not stop within {STOP_TIMEOUT:?}; aborting", self.name);
                handle.abort();
            }
        }
    }
}

async fn run_loop(
    name: String,
    mut stream: Box<dyn ChangeStream>,
    initial_event: Option<ChangeEvent>,
    listener: Arc<dyn ChangeListener>,
    last_marker: Arc<Mutex<Option<ResumeMarker>>>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut pending = initial_event;
    loop {
        let event = match pending.take() {
            Some(event) => event,
            None => {
                let next = tokio::select! {
                    biased;
                    _ = &mut stop => {
                        log::trace!("[{name}] change feed received stop signal");
                        return;
                    }
                    next = stream.next() => next,
                };
                match next {
                    Ok(event) => event,
                    Err(e) => {
                        log::warn!("[{name}] change stream failed: {e}");
                        listener.on_error(DriverError::Store(e)).await;
                        return;
                    }
                }
            }
        };

        let marker = event.marker;
        log::trace!("[{name}] dispatching event {marker}");
        if let Err(e) = listener.on_event(event).await {
            log::warn!("[{name}] listener failed on event {marker}: {e}");
            listener.on_error(e).await;
            return;
        }
        *last_marker.lock().unwrap_or_else(PoisonError::into_inner) = Some(marker);
    }
}
