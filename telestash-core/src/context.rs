//! Caller-owned telemetry context
//!
//! [`Telemetry`] wires the store, queue, identity, flusher and dispatcher
//! together. Application-facing calls never fail on storage problems: those
//! are logged and counted in the health counters. Only invalid input is
//! reported back.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::Config;
use crate::crash::CrashReport;
use crate::db::{Database, KeyValueStore};
use crate::dispatcher::{DispatcherHandle, DrainReport, RequestDispatcher};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::flusher::{EventFlusher, FlushTimer};
use crate::health::HealthCounter;
use crate::identity::{AdvertisingIdProvider, DeviceIdType, DeviceIdentity, IdentityChange};
use crate::queue::QueueStore;
use crate::request::RequestBuilder;
use crate::session::SessionTracker;
use crate::transport::{HttpTransport, Transport};

struct Workers {
    dispatcher: Arc<DispatcherHandle>,
    timer: FlushTimer,
}

/// A running telemetry buffer
pub struct Telemetry {
    config: Config,
    queue: Arc<QueueStore>,
    identity: Arc<DeviceIdentity>,
    health: Arc<HealthCounter>,
    builder: RequestBuilder,
    flusher: Arc<EventFlusher>,
    dispatcher: Arc<RequestDispatcher>,
    sessions: SessionTracker,
    workers: Mutex<Option<Workers>>,
}

impl Telemetry {
    /// Open the on-disk store and HTTP transport described by `config`
    pub fn open(config: Config) -> Result<Self> {
        config.server.validate()?;

        let db = Database::open(&Config::store_path())?;
        db.migrate()?;
        let transport = HttpTransport::new(&config.server)?;

        Self::with_store(config, Arc::new(db), Arc::new(transport))
    }

    /// Build on a caller-supplied store and transport
    pub fn with_store(
        config: Config,
        kv: Arc<dyn KeyValueStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        Self::with_advertising(config, kv, transport, None)
    }

    /// Like [`with_store`](Self::with_store) with an advertising ID source
    pub fn with_advertising(
        config: Config,
        kv: Arc<dyn KeyValueStore>,
        transport: Arc<dyn Transport>,
        advertising: Option<Arc<dyn AdvertisingIdProvider>>,
    ) -> Result<Self> {
        let app_key = match config.server.app_key.as_deref() {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => {
                return Err(Error::Config(
                    "server.app_key is required and cannot be empty".to_string(),
                ))
            }
        };
        let builder = RequestBuilder::new(app_key);

        let health = Arc::new(HealthCounter::open(kv.clone())?);
        let queue = Arc::new(
            QueueStore::open(kv.clone(), &config.queue)?.with_health(health.clone()),
        );
        let identity = Arc::new(DeviceIdentity::from_config(
            kv,
            queue.clone(),
            &config.identity,
            advertising,
        )?);

        let flusher = Arc::new(EventFlusher::new(
            queue.clone(),
            identity.clone(),
            builder.clone(),
            config.queue.event_queue_threshold,
        ));
        let dispatcher = Arc::new(
            RequestDispatcher::new(queue.clone(), identity.clone(), transport, health.clone())
                .with_headers(config.server.headers.clone())
                .with_salt(config.server.salt.clone()),
        );

        tracing::info!(
            device_id_type = %identity.id_type(),
            queued_requests = queue.request_count(),
            buffered_events = queue.event_count(),
            "Telemetry opened"
        );

        Ok(Self {
            config,
            queue,
            identity,
            health,
            builder,
            flusher,
            dispatcher,
            sessions: SessionTracker::new(),
            workers: Mutex::new(None),
        })
    }

    fn workers(&self) -> MutexGuard<'_, Option<Workers>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wake_dispatcher(&self) {
        if let Some(workers) = self.workers().as_ref() {
            workers.dispatcher.wake();
        }
    }

    fn log_storage_error(&self, context: &str, error: &Error) {
        tracing::error!(error = %error, "{}", context);
        self.health.log_error();
    }

    fn queue_request(&self, context: &str, request: &str) -> bool {
        match self.queue.append_request(request) {
            Ok(true) => {
                self.wake_dispatcher();
                true
            }
            Ok(false) => false,
            Err(e) => {
                self.log_storage_error(context, &e);
                false
            }
        }
    }

    // ========== Events ==========

    /// Buffer an event, flushing once the buffer reaches the threshold
    pub fn record_event(&self, event: Event) {
        match self.flusher.record_event(event) {
            Ok(true) => {
                self.flush();
            }
            Ok(false) => {}
            Err(e) => self.log_storage_error("Failed to buffer event", &e),
        }
    }

    /// Move buffered events onto the request queue now.
    ///
    /// Returns the queued request, if any.
    pub fn flush(&self) -> Option<String> {
        match self.flusher.flush() {
            Ok(Some(request)) => {
                self.wake_dispatcher();
                Some(request)
            }
            Ok(None) => None,
            Err(e) => {
                self.log_storage_error("Failed to flush events", &e);
                None
            }
        }
    }

    // ========== Identity ==========

    /// The current device ID
    pub fn device_id(&self) -> String {
        self.identity.value()
    }

    /// The current device ID type
    pub fn device_id_type(&self) -> DeviceIdType {
        self.identity.id_type()
    }

    pub fn temporary_id_mode_enabled(&self) -> bool {
        self.identity.temporary_id_mode_enabled()
    }

    fn finish_identity_change(&self, result: Result<IdentityChange>) -> Result<IdentityChange> {
        match result {
            Ok(change) => {
                if change != IdentityChange::Unchanged {
                    self.wake_dispatcher();
                }
                Ok(change)
            }
            Err(e @ Error::InvalidIdentity(_)) => Err(e),
            Err(e) => {
                self.log_storage_error("Failed to change device ID", &e);
                Ok(IdentityChange::Unchanged)
            }
        }
    }

    /// Change the device ID and merge the old ID's data into it.
    ///
    /// Buffered events are flushed under the old ID first.
    pub fn change_device_id_with_merge(&self, new: &str) -> Result<IdentityChange> {
        if new.is_empty() {
            return Err(Error::InvalidIdentity(
                "new device ID cannot be empty".to_string(),
            ));
        }
        self.flush();
        self.finish_identity_change(self.identity.change_with_merge(new, &self.builder))
    }

    /// Change the device ID without merging.
    ///
    /// Buffered events are flushed under the old ID first.
    pub fn change_device_id_without_merge(
        &self,
        id_type: DeviceIdType,
        value: Option<&str>,
    ) -> Result<IdentityChange> {
        if id_type == DeviceIdType::DeveloperSupplied && value.map_or(true, str::is_empty) {
            return Err(Error::InvalidIdentity(
                "a developer supplied device ID needs a value".to_string(),
            ));
        }
        self.flush();
        self.finish_identity_change(self.identity.change_without_merge(id_type, value))
    }

    /// Switch to the temporary device ID until the real one is known
    pub fn enter_temporary_id_mode(&self) -> IdentityChange {
        self.flush();
        self.finish_identity_change(self.identity.enter_temporary_mode())
            .unwrap_or(IdentityChange::Unchanged)
    }

    // ========== Sessions ==========

    fn session_metrics(&self) -> String {
        let mut metrics = serde_json::Map::new();
        metrics.insert("_os".to_string(), std::env::consts::OS.into());
        if let Some(version) = &self.config.server.app_version {
            metrics.insert("_app_version".to_string(), version.as_str().into());
        }
        serde_json::Value::Object(metrics).to_string()
    }

    /// Start a session and queue its start request.
    ///
    /// Returns false if a session was already running or the request was
    /// not queued.
    pub fn begin_session(&self) -> bool {
        if !self.sessions.begin() {
            tracing::warn!("Session already running");
            self.health.log_warning();
            return false;
        }
        let metrics = self.session_metrics();
        let request = self
            .identity
            .with_value(|device_id| self.builder.begin_session(device_id, &metrics));
        self.queue_request("Failed to queue session start", &request)
    }

    /// Report session time since the last report.
    ///
    /// Nothing is queued for a duration under one second. Returns the
    /// reported seconds, or `None` without a running session.
    pub fn update_session(&self) -> Option<u64> {
        let secs = self.sessions.update()?;
        if secs > 0 {
            let request = self
                .identity
                .with_value(|device_id| self.builder.update_session(device_id, secs));
            self.queue_request("Failed to queue session update", &request);
        }
        Some(secs)
    }

    /// End the running session.
    ///
    /// Buffered events are flushed first so they precede the end request.
    pub fn end_session(&self) -> Option<u64> {
        if !self.sessions.is_active() {
            return None;
        }
        self.flush();
        let secs = self.sessions.end()?;
        let request = self
            .identity
            .with_value(|device_id| self.builder.end_session(device_id, secs));
        self.queue_request("Failed to queue session end", &request);
        Some(secs)
    }

    pub fn session_active(&self) -> bool {
        self.sessions.is_active()
    }

    // ========== Crashes ==========

    /// Queue a crash report as its own request.
    ///
    /// Only an invalid report is an error.
    pub fn record_crash(&self, report: &CrashReport) -> Result<()> {
        let json = report.to_json()?;
        let request = self
            .identity
            .with_value(|device_id| self.builder.crash_report(device_id, &json));
        self.queue_request("Failed to queue crash report", &request);
        Ok(())
    }

    // ========== Health ==========

    /// Queue a health check request if any counter is set.
    ///
    /// The counters are reset in the same step that reads them. If the
    /// request cannot be queued they are merged back, so nothing logged in
    /// between is lost.
    pub fn queue_health_check(&self) -> Option<String> {
        let snapshot = self.health.take_snapshot();
        if snapshot.is_clean() {
            return None;
        }

        let request = self.identity.with_value(|device_id| {
            self.builder
                .health_check(device_id, &snapshot.request_json())
        });
        match self.queue.append_request(&request) {
            Ok(true) => {}
            Ok(false) => {
                self.health.restore(snapshot);
                return None;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to queue health check");
                self.health.restore(snapshot);
                return None;
            }
        }
        if let Err(e) = self.health.save() {
            tracing::warn!(error = %e, "Failed to persist reset health counters");
        }
        self.wake_dispatcher();
        Some(request)
    }

    // ========== Delivery ==========

    /// Run one drain cycle in the caller's task
    pub async fn drain(&self) -> DrainReport {
        self.dispatcher.drain_once().await
    }

    /// Set a header that overrides a configured one of the same name
    pub fn set_header_override(&self, name: impl Into<String>, value: impl Into<String>) {
        self.dispatcher.set_header_override(name, value);
    }

    /// Start the flush timer and the background dispatcher.
    ///
    /// Must be called from within a tokio runtime. Starting twice is a no-op.
    pub fn start(&self) -> Result<()> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(Error::Config(
                "background workers need a running tokio runtime".to_string(),
            ));
        }

        let mut workers = self.workers();
        if workers.is_some() {
            return Ok(());
        }

        let dispatcher = Arc::new(DispatcherHandle::spawn(
            self.dispatcher.clone(),
            Duration::from_secs(self.config.server.idle_interval_secs.max(1)),
        ));
        let on_flush = dispatcher.clone();
        let timer = FlushTimer::spawn(
            self.flusher.clone(),
            Duration::from_secs(self.config.queue.flush_interval_secs),
            move || on_flush.wake(),
        );

        *workers = Some(Workers { dispatcher, timer });
        tracing::info!("Background workers started");
        Ok(())
    }

    /// Stop background workers, flushing buffered events first.
    ///
    /// Safe to call more than once and without a prior `start`.
    pub async fn stop(&self) {
        let workers = self.workers().take();
        let Some(workers) = workers else {
            return;
        };

        workers.timer.stop().await;
        self.flush();
        workers.dispatcher.stop().await;
        if let Err(e) = self.health.save() {
            tracing::warn!(error = %e, "Failed to persist health counters");
        }
        tracing::info!("Background workers stopped");
    }

    // ========== Accessors ==========

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn queue(&self) -> &Arc<QueueStore> {
        &self.queue
    }

    pub fn identity(&self) -> &Arc<DeviceIdentity> {
        &self.identity
    }

    pub fn health(&self) -> &Arc<HealthCounter> {
        &self.health
    }

    pub fn request_builder(&self) -> &RequestBuilder {
        &self.builder
    }

    /// Toggle tracking; disabling purges buffered events
    pub fn set_tracking_enabled(&self, enabled: bool) {
        if let Err(e) = self.queue.set_tracking_enabled(enabled) {
            self.log_storage_error("Failed to update tracking state", &e);
        }
    }
}
