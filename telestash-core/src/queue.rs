//! Persistent request and event queues
//!
//! The in-memory copy is authoritative. Every mutation rewrites the affected
//! blob in the key-value store before the write guard is released, so a
//! reader never observes a state that was not also handed to the store.
//!
//! Requests persist under [`REQUESTS_KEY`] as newline-delimited entries with
//! `\n` and `\\` escaped. Events persist under [`EVENTS_KEY`] as one JSON
//! object per line.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::QueueConfig;
use crate::db::KeyValueStore;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::health::HealthCounter;

/// Store key for the request queue
pub const REQUESTS_KEY: &str = "CONNECTIONS";

/// Store key for the event buffer
pub const EVENTS_KEY: &str = "EVENTS";

/// Most overflow entries the gradual cleaner removes per append
pub const GRADUAL_CLEANUP_LIMIT: usize = 100;

/// Hard cap on buffered events
pub const MAX_BUFFERED_EVENTS: usize = 1000;

/// How many head entries an append evicts once the queue is over its bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupPolicy {
    /// Remove `min(100, overflow) + 1` entries
    Gradual,
    /// Remove `overflow + 1` entries
    Full,
}

impl CleanupPolicy {
    fn from_flag(gradual: bool) -> Self {
        if gradual {
            CleanupPolicy::Gradual
        } else {
            CleanupPolicy::Full
        }
    }

    /// Entries to drop from the head before appending to a queue of `count`
    pub fn eviction_count(self, count: usize, max: usize) -> usize {
        if count <= max {
            return 0;
        }
        let overflow = count - max;
        let evict = match self {
            CleanupPolicy::Gradual => overflow.min(GRADUAL_CLEANUP_LIMIT) + 1,
            CleanupPolicy::Full => overflow + 1,
        };
        evict.min(count)
    }
}

struct QueueState {
    requests: VecDeque<String>,
    events: Vec<Event>,
    max_requests: usize,
    policy: CleanupPolicy,
    tracking_enabled: bool,
}

impl QueueState {
    /// Evict per policy, then append. Returns the number evicted.
    fn push_request(&mut self, data: String) -> usize {
        let evict = self
            .policy
            .eviction_count(self.requests.len(), self.max_requests);
        if evict > 0 {
            self.requests.drain(..evict);
            tracing::warn!(
                evicted = evict,
                remaining = self.requests.len(),
                max = self.max_requests,
                policy = ?self.policy,
                "Request queue over its bound, dropped oldest requests"
            );
        }
        self.requests.push_back(data);
        evict
    }
}

/// Ordered, bounded, crash-safe request queue plus the pending-event buffer
pub struct QueueStore {
    kv: Arc<dyn KeyValueStore>,
    state: RwLock<QueueState>,
    health: Option<Arc<HealthCounter>>,
}

impl QueueStore {
    /// Load both queues from `kv`
    pub fn open(kv: Arc<dyn KeyValueStore>, config: &QueueConfig) -> Result<Self> {
        config.validate()?;

        let requests = match kv.get(REQUESTS_KEY)? {
            Some(blob) => decode_requests(&blob),
            None => VecDeque::new(),
        };
        let events = match kv.get(EVENTS_KEY)? {
            Some(blob) => decode_events(&blob),
            None => Vec::new(),
        };

        tracing::debug!(
            requests = requests.len(),
            events = events.len(),
            "Loaded persisted queues"
        );

        Ok(Self {
            kv,
            state: RwLock::new(QueueState {
                requests,
                events,
                max_requests: config.max_request_queue_size,
                policy: CleanupPolicy::from_flag(config.gradual_cleanup_enabled),
                tracking_enabled: config.tracking_enabled,
            }),
            health: None,
        })
    }

    /// Count every refused or evicted entry as a health warning
    pub fn with_health(mut self, health: Arc<HealthCounter>) -> Self {
        self.health = Some(health);
        self
    }

    fn count_warnings(&self, count: u64) {
        if let Some(health) = &self.health {
            health.log_warnings(count);
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, QueueState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, QueueState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn persist_requests(&self, state: &QueueState) -> Result<()> {
        self.kv
            .set(REQUESTS_KEY, &encode_requests(&state.requests))
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to persist request queue");
                e
            })
    }

    fn persist_events(&self, state: &QueueState) -> Result<()> {
        self.kv
            .set(EVENTS_KEY, &encode_events(&state.events)?)
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to persist event buffer");
                e
            })
    }

    // ========== Requests ==========

    /// Append a serialized request, evicting from the head first if needed.
    ///
    /// Returns false when nothing was appended (empty data or tracking off).
    pub fn append_request(&self, data: &str) -> Result<bool> {
        if data.is_empty() {
            tracing::warn!("Ignoring empty request");
            self.count_warnings(1);
            return Ok(false);
        }

        let mut state = self.write();
        if !state.tracking_enabled {
            tracing::warn!("Tracking disabled, request not queued");
            self.count_warnings(1);
            return Ok(false);
        }
        if state.push_request(data.to_string()) > 0 {
            self.count_warnings(1);
        }
        self.persist_requests(&state)?;
        Ok(true)
    }

    /// Snapshot of every queued request, oldest first
    pub fn requests(&self) -> Vec<String> {
        self.read().requests.iter().cloned().collect()
    }

    /// The oldest queued request
    pub fn front(&self) -> Option<String> {
        self.read().requests.front().cloned()
    }

    /// Number of queued requests
    pub fn request_count(&self) -> usize {
        self.read().requests.len()
    }

    /// Whether any queued request satisfies `pred`
    pub fn any_request(&self, mut pred: impl FnMut(&str) -> bool) -> bool {
        self.read().requests.iter().any(|r| pred(r))
    }

    /// Remove the head entry if it is still `expected`.
    ///
    /// Returns false when the head changed under the caller (e.g. it was
    /// evicted while a delivery was in flight).
    pub fn remove_request_at_front(&self, expected: &str) -> Result<bool> {
        let mut state = self.write();
        if state.requests.front().map(String::as_str) != Some(expected) {
            return Ok(false);
        }
        state.requests.pop_front();
        self.persist_requests(&state)?;
        Ok(true)
    }

    /// Apply `f` to every queued request in place.
    ///
    /// `f` returns the replacement or `None` to leave the entry alone.
    /// Returns how many entries changed; positions never move.
    pub fn rewrite_requests(&self, mut f: impl FnMut(&str) -> Option<String>) -> Result<usize> {
        let mut state = self.write();
        let mut changed = 0;
        for entry in state.requests.iter_mut() {
            if let Some(replacement) = f(entry) {
                if replacement != *entry {
                    *entry = replacement;
                    changed += 1;
                }
            }
        }
        if changed > 0 {
            self.persist_requests(&state)?;
        }
        Ok(changed)
    }

    // ========== Events ==========

    /// Buffer an event. Returns the buffer size afterwards.
    pub fn append_event(&self, event: Event) -> Result<usize> {
        let mut state = self.write();
        if !state.tracking_enabled {
            tracing::warn!(key = %event.key, "Tracking disabled, event not buffered");
            self.count_warnings(1);
            return Ok(state.events.len());
        }
        if state.events.len() >= MAX_BUFFERED_EVENTS {
            tracing::warn!(
                key = %event.key,
                buffered = state.events.len(),
                "Event buffer full, dropping event"
            );
            self.count_warnings(1);
            return Ok(state.events.len());
        }
        self.count_warnings(u64::from(event.dropped_values));
        state.events.push(event);
        self.persist_events(&state)?;
        Ok(state.events.len())
    }

    /// Snapshot of buffered events, oldest first
    pub fn events(&self) -> Vec<Event> {
        self.read().events.clone()
    }

    /// Number of buffered events
    pub fn event_count(&self) -> usize {
        self.read().events.len()
    }

    /// Drop every buffered event
    pub fn clear_events(&self) -> Result<()> {
        let mut state = self.write();
        state.events.clear();
        self.persist_events(&state)
    }

    /// Turn the buffered events into one queued request.
    ///
    /// `build` sees the buffer and returns the request to append. Building,
    /// appending and clearing happen under one write guard and persist in
    /// one store write. An empty buffer appends nothing and skips `build`.
    pub fn take_events_and_append(
        &self,
        build: impl FnOnce(&[Event]) -> Result<Option<String>>,
    ) -> Result<Option<String>> {
        let mut state = self.write();
        if state.events.is_empty() {
            return Ok(None);
        }

        let Some(request) = build(&state.events)? else {
            return Ok(None);
        };
        if request.is_empty() {
            tracing::warn!("Flush produced an empty request, keeping events buffered");
            self.count_warnings(1);
            return Ok(None);
        }

        if state.push_request(request.clone()) > 0 {
            self.count_warnings(1);
        }
        state.events.clear();

        let requests_blob = encode_requests(&state.requests);
        self.kv
            .set_many(&[(REQUESTS_KEY, requests_blob.as_str()), (EVENTS_KEY, "")])
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to persist flush");
                e
            })?;
        Ok(Some(request))
    }

    // ========== Whole store ==========

    /// Empty both the request queue and the event buffer
    pub fn clear(&self) -> Result<()> {
        let mut state = self.write();
        state.requests.clear();
        state.events.clear();
        self.kv.set_many(&[(REQUESTS_KEY, ""), (EVENTS_KEY, "")])
    }

    /// Current request bound
    pub fn max_request_queue_size(&self) -> usize {
        self.read().max_requests
    }

    /// Change the request bound; takes effect on the next append
    pub fn set_max_request_queue_size(&self, max: usize) -> Result<()> {
        if max == 0 {
            return Err(Error::Config(
                "max_request_queue_size must be at least 1".to_string(),
            ));
        }
        self.write().max_requests = max;
        Ok(())
    }

    /// Active cleanup policy
    pub fn cleanup_policy(&self) -> CleanupPolicy {
        self.read().policy
    }

    /// Switch between the gradual and full cleaner
    pub fn set_gradual_cleanup_enabled(&self, enabled: bool) {
        self.write().policy = CleanupPolicy::from_flag(enabled);
    }

    /// Whether appends are accepted
    pub fn tracking_enabled(&self) -> bool {
        self.read().tracking_enabled
    }

    /// Toggle tracking. Disabling purges buffered events; queued requests
    /// were already consented and stay.
    pub fn set_tracking_enabled(&self, enabled: bool) -> Result<()> {
        let mut state = self.write();
        state.tracking_enabled = enabled;
        if !enabled && !state.events.is_empty() {
            tracing::info!(dropped = state.events.len(), "Tracking disabled, purging events");
            state.events.clear();
            self.persist_events(&state)?;
        }
        Ok(())
    }
}

// ========== Blob encoding ==========

fn escape_entry(entry: &str, out: &mut String) {
    for c in entry.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
}

fn unescape_entry(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn encode_requests(requests: &VecDeque<String>) -> String {
    let mut out = String::new();
    for (i, entry) in requests.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        escape_entry(entry, &mut out);
    }
    out
}

fn decode_requests(blob: &str) -> VecDeque<String> {
    if blob.is_empty() {
        return VecDeque::new();
    }
    blob.split('\n').map(unescape_entry).collect()
}

fn encode_events(events: &[Event]) -> Result<String> {
    let mut lines = Vec::with_capacity(events.len());
    for event in events {
        lines.push(serde_json::to_string(event)?);
    }
    Ok(lines.join("\n"))
}

fn decode_events(blob: &str) -> Vec<Event> {
    blob.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<Event>(line) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unreadable buffered event");
                None
            }
        })
        .collect()
}
