//! Event buffering and flushing
//!
//! A flush turns the whole event buffer into one `events=` request on the
//! request queue. The flush holds the identity read lock for its duration
//! so the request carries the device ID that was current when it was built.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::Result;
use crate::event::Event;
use crate::identity::DeviceIdentity;
use crate::queue::QueueStore;
use crate::request::RequestBuilder;

/// Moves buffered events onto the request queue
pub struct EventFlusher {
    queue: Arc<QueueStore>,
    identity: Arc<DeviceIdentity>,
    builder: RequestBuilder,
    threshold: usize,
}

impl EventFlusher {
    pub fn new(
        queue: Arc<QueueStore>,
        identity: Arc<DeviceIdentity>,
        builder: RequestBuilder,
        threshold: usize,
    ) -> Self {
        Self {
            queue,
            identity,
            builder,
            threshold: threshold.max(1),
        }
    }

    /// Buffer `event`. Returns true once the buffer reached the threshold.
    pub fn record_event(&self, event: Event) -> Result<bool> {
        let buffered = self.queue.append_event(event)?;
        Ok(buffered >= self.threshold)
    }

    /// Append one request holding every buffered event and clear the buffer.
    ///
    /// Returns the appended request, or `None` when the buffer was empty.
    pub fn flush(&self) -> Result<Option<String>> {
        let flushed = self.identity.with_value(|device_id| {
            self.queue.take_events_and_append(|events| {
                let json = serde_json::to_string(events)?;
                Ok(Some(self.builder.events(device_id, &json)))
            })
        })?;

        if flushed.is_some() {
            tracing::debug!("Flushed buffered events to the request queue");
        }
        Ok(flushed)
    }

    /// Buffer size that triggers a flush
    pub fn threshold(&self) -> usize {
        self.threshold
    }
}

/// Periodic background flush
pub struct FlushTimer {
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FlushTimer {
    /// Flush every `interval` on the current tokio runtime, calling
    /// `on_flush` after each flush that queued a request
    pub fn spawn(
        flusher: Arc<EventFlusher>,
        interval: Duration,
        on_flush: impl Fn() + Send + 'static,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match flusher.flush() {
                            Ok(Some(_)) => on_flush(),
                            Ok(None) => {}
                            Err(e) => tracing::warn!(error = %e, "Timed flush failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            tracing::debug!("Flush timer stopped");
        });

        Self {
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Stop the timer and wait for it to exit. Safe to call more than once.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Flush timer task ended abnormally");
            }
        }
    }
}
