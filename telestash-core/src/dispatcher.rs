//! Sequential delivery of queued requests
//!
//! The dispatcher sends the head of the request queue, and only the head.
//! A delivered or rejected head is removed and the next one is sent; a
//! retryable failure ends the cycle with the head still in place.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::health::HealthCounter;
use crate::identity::{DeviceIdentity, TEMPORARY_DEVICE_ID};
use crate::queue::QueueStore;
use crate::request::{append_checksum, has_field_value, DEVICE_ID_FIELD};
use crate::transport::{DeliveryError, Transport};

/// First retry delay
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Retry delay cap
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Exponential retry delay, reset by any successful delivery
#[derive(Debug)]
struct Backoff {
    next: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            next: INITIAL_BACKOFF,
        }
    }

    /// Delay before the next attempt; doubles the one after
    fn on_failure(&mut self) -> Duration {
        let delay = self.next;
        self.next = std::cmp::min(self.next * 2, MAX_BACKOFF);
        delay
    }

    fn reset(&mut self) {
        self.next = INITIAL_BACKOFF;
    }
}

/// Why a drain cycle stopped before emptying the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blocked {
    /// The head request carries the temporary device ID
    TemporaryId,
    /// The head request failed and should be retried after `retry_after`
    Retry {
        status: Option<u16>,
        retry_after: Duration,
    },
    /// A stop was requested
    Stopped,
}

/// Outcome of one drain cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Requests the server accepted
    pub delivered: usize,
    /// Requests the server rejected permanently
    pub dropped: usize,
    /// Requests still queued after the cycle
    pub remaining: usize,
    /// Set when the cycle ended with requests left
    pub blocked: Option<Blocked>,
}

/// Drains the request queue through a [`Transport`]
pub struct RequestDispatcher {
    queue: Arc<QueueStore>,
    identity: Arc<DeviceIdentity>,
    transport: Arc<dyn Transport>,
    health: Arc<HealthCounter>,
    static_headers: BTreeMap<String, String>,
    header_overrides: RwLock<BTreeMap<String, String>>,
    salt: Option<String>,
    backoff: Mutex<Backoff>,
    // Serializes drain cycles so at most one request is in flight
    in_flight: tokio::sync::Mutex<()>,
}

impl RequestDispatcher {
    pub fn new(
        queue: Arc<QueueStore>,
        identity: Arc<DeviceIdentity>,
        transport: Arc<dyn Transport>,
        health: Arc<HealthCounter>,
    ) -> Self {
        Self {
            queue,
            identity,
            transport,
            health,
            static_headers: BTreeMap::new(),
            header_overrides: RwLock::new(BTreeMap::new()),
            salt: None,
            backoff: Mutex::new(Backoff::new()),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    /// Headers sent with every request
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.static_headers = headers;
        self
    }

    /// Sign every sent request with `checksum256`
    pub fn with_salt(mut self, salt: Option<String>) -> Self {
        self.salt = salt.filter(|s| !s.is_empty());
        self
    }

    /// Set a header that overrides any static header of the same name
    pub fn set_header_override(&self, name: impl Into<String>, value: impl Into<String>) {
        self.header_overrides
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), value.into());
    }

    /// Remove a runtime header override
    pub fn remove_header_override(&self, name: &str) {
        self.header_overrides
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }

    /// Static headers merged with overrides; overrides win
    pub fn headers(&self) -> BTreeMap<String, String> {
        let mut headers = self.static_headers.clone();
        let overrides = self
            .header_overrides
            .read()
            .unwrap_or_else(|e| e.into_inner());
        headers.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        headers
    }

    fn next_retry_delay(&self) -> Duration {
        self.backoff
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .on_failure()
    }

    fn reset_backoff(&self) {
        self.backoff
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reset();
    }

    /// Drain until the queue is empty or the head cannot be sent
    pub async fn drain_once(&self) -> DrainReport {
        self.drain_until(|| false).await
    }

    /// Like [`drain_once`](Self::drain_once), checking `should_stop` before
    /// each request
    pub async fn drain_until(&self, should_stop: impl Fn() -> bool) -> DrainReport {
        let _cycle = self.in_flight.lock().await;
        let mut report = DrainReport::default();

        loop {
            if should_stop() {
                report.blocked = Some(Blocked::Stopped);
                break;
            }
            let Some(head) = self.queue.front() else {
                break;
            };

            if has_field_value(&head, DEVICE_ID_FIELD, TEMPORARY_DEVICE_ID) {
                if self.identity.temporary_id_mode_enabled() {
                    tracing::debug!("Head request carries the temporary device ID, waiting");
                    report.blocked = Some(Blocked::TemporaryId);
                    break;
                }
                // Identity resolved but the rewrite never landed
                match self.identity.resolve_stale_temporary_requests() {
                    Ok(rewritten) => {
                        tracing::info!(rewritten, "Resolved stale temporary-ID requests");
                        continue;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to resolve temporary-ID requests");
                        report.blocked = Some(Blocked::TemporaryId);
                        break;
                    }
                }
            }

            let body = match &self.salt {
                Some(salt) => append_checksum(&head, salt),
                None => head.clone(),
            };
            let headers = self.headers();

            match self.transport.send(&body, &headers).await {
                Ok(()) => {
                    self.reset_backoff();
                    self.remove_head(&head);
                    report.delivered += 1;
                }
                Err(e @ DeliveryError::Fatal { .. }) => {
                    tracing::warn!(
                        status = ?e.status(),
                        error = %e,
                        "Server rejected request, dropping it"
                    );
                    self.health.log_failed_request(e.status(), e.message());
                    self.remove_head(&head);
                    report.dropped += 1;
                }
                Err(e) => {
                    let retry_after = self.next_retry_delay();
                    tracing::warn!(
                        status = ?e.status(),
                        error = %e,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "Delivery failed, keeping request at the head"
                    );
                    self.health.log_failed_request(e.status(), e.message());
                    report.blocked = Some(Blocked::Retry {
                        status: e.status(),
                        retry_after,
                    });
                    break;
                }
            }
        }

        if report.dropped > 0 || matches!(report.blocked, Some(Blocked::Retry { .. })) {
            if let Err(e) = self.health.save() {
                tracing::warn!(error = %e, "Failed to persist health counters");
            }
        }

        report.remaining = self.queue.request_count();
        if report.delivered > 0 || report.dropped > 0 {
            tracing::debug!(
                delivered = report.delivered,
                dropped = report.dropped,
                remaining = report.remaining,
                "Drain cycle finished"
            );
        }
        report
    }

    fn remove_head(&self, head: &str) {
        match self.queue.remove_request_at_front(head) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("Head request already gone, likely evicted during delivery")
            }
            Err(e) => tracing::error!(error = %e, "Failed to persist queue after delivery"),
        }
    }
}

/// Background drain loop
///
/// Runs a drain cycle, then waits for a wake-up, the idle interval, or the
/// retry delay. Created with [`DispatcherHandle::spawn`].
pub struct DispatcherHandle {
    wake: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DispatcherHandle {
    /// Start the loop on the current tokio runtime
    pub fn spawn(dispatcher: Arc<RequestDispatcher>, idle_interval: Duration) -> Self {
        let wake = Arc::new(Notify::new());
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let task_wake = wake.clone();
        let task = tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let report = dispatcher.drain_until(|| *shutdown_rx.borrow()).await;
                let (wait, wakeable) = match report.blocked {
                    Some(Blocked::Stopped) => break,
                    Some(Blocked::Retry { retry_after, .. }) => (retry_after, false),
                    _ => (idle_interval, true),
                };

                tokio::select! {
                    _ = task_wake.notified(), if wakeable => {}
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
            tracing::debug!("Dispatcher loop stopped");
        });

        Self {
            wake,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Ask for a drain cycle now
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Stop the loop and wait for it to exit. Safe to call more than once.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Dispatcher task ended abnormally");
            }
        }
    }
}
