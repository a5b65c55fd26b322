//! Health counters reported back to the server
//!
//! Tracks how many warnings and errors the library logged and the last
//! failed delivery. Counters persist under [`HEALTH_KEY`] and ship in a
//! request's `hc` parameter.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::db::KeyValueStore;
use crate::error::Result;

/// Store key for persisted counters
pub const HEALTH_KEY: &str = "HEALTH_CHECK";

/// Longest stored failure message, in characters
pub const MAX_ERROR_MESSAGE_CHARS: usize = 1000;

/// Persisted counter state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    #[serde(rename = "LWar", default)]
    pub warnings: u64,
    #[serde(rename = "LErr", default)]
    pub errors: u64,
    /// HTTP status of the last failed delivery, -1 when none
    #[serde(rename = "RStatC", default = "no_status")]
    pub status_code: i32,
    #[serde(rename = "REMsg", default)]
    pub error_message: String,
}

fn no_status() -> i32 {
    -1
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        Self {
            warnings: 0,
            errors: 0,
            status_code: no_status(),
            error_message: String::new(),
        }
    }
}

impl HealthSnapshot {
    /// Nothing worth reporting
    pub fn is_clean(&self) -> bool {
        *self == HealthSnapshot::default()
    }

    /// JSON for the `hc` request parameter
    pub fn request_json(&self) -> String {
        serde_json::json!({
            "el": self.errors,
            "wl": self.warnings,
            "sc": self.status_code,
            "em": self.error_message,
        })
        .to_string()
    }
}

/// Thread-safe, persisted health counters
pub struct HealthCounter {
    kv: Arc<dyn KeyValueStore>,
    state: Mutex<HealthSnapshot>,
}

impl HealthCounter {
    /// Load counters from `kv`; unreadable state starts fresh
    pub fn open(kv: Arc<dyn KeyValueStore>) -> Result<Self> {
        let state = match kv.get(HEALTH_KEY)? {
            Some(blob) if !blob.is_empty() => serde_json::from_str(&blob).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Discarding unreadable health counters");
                HealthSnapshot::default()
            }),
            _ => HealthSnapshot::default(),
        };
        Ok(Self {
            kv,
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HealthSnapshot> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn log_warning(&self) {
        self.log_warnings(1);
    }

    pub fn log_warnings(&self, count: u64) {
        if count > 0 {
            self.lock().warnings += count;
        }
    }

    pub fn log_error(&self) {
        self.lock().errors += 1;
    }

    /// Remember the last failed delivery
    pub fn log_failed_request(&self, status_code: Option<u16>, message: &str) {
        let mut state = self.lock();
        state.status_code = status_code.map(i32::from).unwrap_or(-1);
        state.error_message = truncate_chars(message, MAX_ERROR_MESSAGE_CHARS);
    }

    /// Current counters
    pub fn snapshot(&self) -> HealthSnapshot {
        self.lock().clone()
    }

    /// Write counters to the store
    pub fn save(&self) -> Result<()> {
        let blob = serde_json::to_string(&*self.lock())?;
        self.kv.set(HEALTH_KEY, &blob)
    }

    /// Return the current counters and reset them in one step.
    ///
    /// Increments that race with the caller land in the fresh counters and
    /// are reported next time. Call [`save`](Self::save) once the snapshot
    /// has been handed off, or [`restore`](Self::restore) if it could not be.
    pub fn take_snapshot(&self) -> HealthSnapshot {
        std::mem::take(&mut *self.lock())
    }

    /// Fold a snapshot from [`take_snapshot`](Self::take_snapshot) back in
    pub fn restore(&self, taken: HealthSnapshot) {
        let mut state = self.lock();
        state.warnings += taken.warnings;
        state.errors += taken.errors;
        if state.status_code == no_status() && state.error_message.is_empty() {
            state.status_code = taken.status_code;
            state.error_message = taken.error_message;
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
