//! History builder: feeds an event stream to a [`StateProvider`].
//!
//! # Architecture
//!
//! ```text
//! caller → chunk events → bounded channel → event handler thread
//!                                             → provider.handle_event(ss, event)
//! ```
//!
//! The caller's thread groups events into chunks and pushes them on a
//! bounded `sync_channel`, so a slow provider applies back-pressure instead
//! of buffering the whole stream. The provider stays in the builder's slot
//! and the handler thread locks it for the duration of the build, so it can
//! always be taken back. When the stream ends (or the build is cancelled or
//! aborted) the history is closed exactly once and the provider is disposed.
//! A panic inside the provider aborts the build like a fatal error.

use crate::error::{Result, StateError};
use crate::system::StateSystem;
use crate::Timestamp;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Default number of chunks the event channel holds.
pub const DEFAULT_QUEUE_SIZE: usize = 127;

/// Default number of events per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 127;

/// An input event carrying its timestamp.
pub trait TimedEvent {
    /// Time of the event.
    fn timestamp(&self) -> Timestamp;
}

/// Turns input events into state changes.
pub trait StateProvider: Send + 'static {
    /// Event type consumed by this provider.
    type Event: TimedEvent + Send + 'static;

    /// Human-readable name, used in logs and thread names.
    fn name(&self) -> &str;

    /// Applies one event to the state system.
    ///
    /// Expected conditions (`AttributeNotFound`, `TimeRange`,
    /// `StateValueType`) are logged and skipped by the builder. Any other
    /// error, or a panic, aborts the build.
    fn handle_event(&mut self, ss: &StateSystem, event: &Self::Event) -> Result<()>;

    /// Releases provider resources. Called once when the build ends.
    fn dispose(&mut self) {}
}

/// Configuration for the event pipeline.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Maximum number of chunks waiting in the channel.
    pub queue_size: usize,
    /// Number of events per chunk.
    pub chunk_size: usize,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_QUEUE_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl BuilderConfig {
    /// Sets the channel capacity (in chunks).
    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    /// Sets the number of events per chunk (at least one).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

/// What the event handler thread reports back.
struct HandlerOutcome {
    last_timestamp: Option<Timestamp>,
    fatal: Option<StateError>,
}

struct BuilderShared<P: StateProvider> {
    ss: Arc<StateSystem>,
    provider: Mutex<Option<P>>,
    config: BuilderConfig,
    cancelled: AtomicBool,
    closed: AtomicBool,
    latest_safe_time: AtomicI64,
}

/// Binds one provider to one state system and builds its history.
pub struct HistoryBuilder<P: StateProvider> {
    shared: Arc<BuilderShared<P>>,
    started: AtomicBool,
    worker: Mutex<Option<JoinHandle<Result<bool>>>>,
}

impl<P: StateProvider> HistoryBuilder<P> {
    /// Creates a builder feeding `provider` into `ss`.
    pub fn new(provider: P, ss: Arc<StateSystem>, config: BuilderConfig) -> Self {
        let start = ss.start_time();
        Self {
            shared: Arc::new(BuilderShared {
                ss,
                provider: Mutex::new(Some(provider)),
                config,
                cancelled: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                latest_safe_time: AtomicI64::new(start),
            }),
            started: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    /// The state system being built.
    pub fn state_system(&self) -> &Arc<StateSystem> {
        &self.shared.ss
    }

    /// Latest time up to which every event has been handled.
    pub fn latest_safe_time(&self) -> Timestamp {
        self.shared.latest_safe_time.load(Ordering::Acquire)
    }

    /// Returns true once [`HistoryBuilder::cancel`] was called or a fatal
    /// error aborted the build.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Requests cancellation. The pump stops at the next event and the
    /// history is closed with its files removed.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
    }

    /// Builds the history from `events` on the calling thread, returning
    /// when it is closed.
    ///
    /// Returns `Ok(true)` if every event was consumed, `Ok(false)` if the
    /// build was cancelled.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that aborted the build, or
    /// `StateError::BuildFinished` if this builder already ran.
    pub fn build_manually<I>(&self, events: I) -> Result<bool>
    where
        I: IntoIterator<Item = P::Event>,
    {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(StateError::BuildFinished);
        }
        self.shared.clone().build(events)
    }

    /// Starts building from `events` on a background thread.
    ///
    /// Only the first call starts a build; later calls are ignored. Use
    /// [`HistoryBuilder::wait`] or [`StateSystem::wait_until_built`] to
    /// wait for completion.
    pub fn handle_range_extended<I>(&self, events: I) -> Result<()>
    where
        I: IntoIterator<Item = P::Event> + Send + 'static,
    {
        if self.started.swap(true, Ordering::AcqRel) {
            debug!("History build already started, ignoring new range");
            return Ok(());
        }

        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(format!("{} history builder", shared.provider_name()))
            .spawn(move || shared.build(events))?;
        *self.worker.lock().unwrap_or_else(|err| err.into_inner()) = Some(handle);
        Ok(())
    }

    /// Waits for a build started by [`HistoryBuilder::handle_range_extended`].
    ///
    /// Returns the build result, or whether the state system finished
    /// without cancellation if no background build was started.
    pub fn wait(&self) -> Result<bool> {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take();
        match handle {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                error!("History builder thread panicked");
                Ok(false)
            }),
            None => Ok(self.shared.ss.wait_until_built()),
        }
    }
}

impl<P: StateProvider> Drop for HistoryBuilder<P> {
    fn drop(&mut self) {
        let handle = self
            .worker
            .get_mut()
            .unwrap_or_else(|err| err.into_inner())
            .take();
        if let Some(handle) = handle {
            if !handle.is_finished() {
                // Unfinished background build is abandoned
                self.cancel();
            }
            match handle.join() {
                Ok(Err(e)) => warn!("History build ended with error: {}", e),
                Err(_) => error!("History builder thread panicked"),
                Ok(Ok(_)) => {}
            }
        }
    }
}

impl<P: StateProvider> BuilderShared<P> {
    fn provider_name(&self) -> String {
        self.provider
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .as_ref()
            .map(|p| p.name().to_string())
            .unwrap_or_default()
    }

    fn build<I>(self: Arc<Self>, events: I) -> Result<bool>
    where
        I: IntoIterator<Item = P::Event>,
    {
        let name = self
            .provider
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .as_ref()
            .map(|p| p.name().to_string())
            .ok_or(StateError::BuildFinished)?;
        info!("Building history {} with provider {}", self.ss.ssid(), name);

        let (tx, rx) = mpsc::sync_channel::<Vec<P::Event>>(self.config.queue_size);
        let shared = self.clone();
        let handler = thread::Builder::new()
            .name(format!("{} event handler", name))
            .spawn(move || shared.handle_events(rx));
        let handler = match handler {
            Ok(handler) => handler,
            Err(e) => {
                error!("Failed to start event handler of {}: {}", name, e);
                self.cancelled.store(true, Ordering::Release);
                self.close(None)?;
                return Err(e.into());
            }
        };

        let chunk_size = self.config.chunk_size.max(1);
        let mut chunk = Vec::with_capacity(chunk_size);
        for event in events {
            if self.cancelled.load(Ordering::Acquire) {
                break;
            }
            chunk.push(event);
            if chunk.len() >= chunk_size {
                let full = std::mem::replace(&mut chunk, Vec::with_capacity(chunk_size));
                if tx.send(full).is_err() {
                    // Handler stopped on a fatal error
                    break;
                }
            }
        }
        if !chunk.is_empty()
            && !self.cancelled.load(Ordering::Acquire)
            && tx.send(chunk).is_err()
        {
            debug!("Event handler of {} stopped before the last chunk", name);
        }
        drop(tx);

        let outcome = match handler.join() {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("Event handler of {} panicked", name);
                self.cancelled.store(true, Ordering::Release);
                self.close(None)?;
                return Ok(false);
            }
        };

        let HandlerOutcome {
            last_timestamp,
            fatal,
        } = outcome;
        let close_result = self.close(last_timestamp);
        if let Some(e) = fatal {
            return Err(e);
        }
        close_result?;

        let completed = !self.cancelled.load(Ordering::Acquire);
        debug!(
            "History build of {} {}",
            self.ss.ssid(),
            if completed { "completed" } else { "cancelled" }
        );
        Ok(completed)
    }

    fn handle_events(&self, rx: Receiver<Vec<P::Event>>) -> HandlerOutcome {
        let mut last_timestamp = None;
        let mut fatal = None;

        let mut slot = self.provider.lock().unwrap_or_else(|err| err.into_inner());
        let Some(provider) = slot.as_mut() else {
            return HandlerOutcome {
                last_timestamp,
                fatal: Some(StateError::BuildFinished),
            };
        };

        'chunks: for chunk in rx {
            for event in chunk {
                if self.cancelled.load(Ordering::Acquire) {
                    break 'chunks;
                }
                let ts = event.timestamp();
                let handled =
                    panic::catch_unwind(AssertUnwindSafe(|| provider.handle_event(&self.ss, &event)))
                        .unwrap_or_else(|payload| {
                            Err(StateError::ProviderPanicked(panic_message(payload.as_ref())))
                        });
                match handled {
                    Ok(()) => {}
                    Err(e @ StateError::StateValueType(_)) => {
                        warn!("{}: event at {} skipped: {}", provider.name(), ts, e);
                    }
                    Err(e) if !e.is_fatal() => {
                        debug!("{}: event at {} skipped: {}", provider.name(), ts, e);
                    }
                    Err(e) => {
                        error!("{}: build aborted at {}: {}", provider.name(), ts, e);
                        self.cancelled.store(true, Ordering::Release);
                        fatal = Some(e);
                        break 'chunks;
                    }
                }
                last_timestamp = Some(last_timestamp.map_or(ts, |last: Timestamp| last.max(ts)));
                self.latest_safe_time
                    .fetch_max(ts.saturating_sub(1), Ordering::AcqRel);
            }
        }

        HandlerOutcome {
            last_timestamp,
            fatal,
        }
    }

    /// Closes the history once and disposes the provider. On cancellation
    /// the history files are removed.
    fn close(&self, last_timestamp: Option<Timestamp>) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let end = last_timestamp.unwrap_or_else(|| self.ss.start_time());

        let result = if self.cancelled.load(Ordering::Acquire) {
            self.ss.mark_cancelled();
            let closed = self.ss.close_history(end);
            let removed = self.ss.remove_files();
            if let Err(e) = &removed {
                error!("Failed to remove files of {}: {}", self.ss.ssid(), e);
            }
            closed.and(removed)
        } else {
            self.ss.close_history(end)
        };

        let provider = self
            .provider
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take();
        if let Some(mut provider) = provider {
            provider.dispose();
        }
        result
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
