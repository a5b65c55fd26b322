//! Session timing
//!
//! Session requests report whole seconds. The fractional part of each
//! interval is carried into the next report so long sessions do not drift.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Tracks the one running session
#[derive(Debug, Default)]
pub struct SessionTracker {
    last_report: Mutex<Option<Instant>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Instant>> {
        self.last_report.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_some()
    }

    /// Start a session. Returns false if one is already running.
    pub fn begin(&self) -> bool {
        self.begin_at(Instant::now())
    }

    /// Whole seconds since the last report, or `None` without a session
    pub fn update(&self) -> Option<u64> {
        self.update_at(Instant::now())
    }

    /// Finish the session, returning its unreported whole seconds
    pub fn end(&self) -> Option<u64> {
        self.end_at(Instant::now())
    }

    fn begin_at(&self, now: Instant) -> bool {
        let mut last = self.lock();
        if last.is_some() {
            return false;
        }
        *last = Some(now);
        true
    }

    fn update_at(&self, now: Instant) -> Option<u64> {
        let mut last = self.lock();
        let since = (*last)?;
        let secs = now.saturating_duration_since(since).as_secs();
        *last = Some(since + Duration::from_secs(secs));
        Some(secs)
    }

    fn end_at(&self, now: Instant) -> Option<u64> {
        let since = self.lock().take()?;
        Some(now.saturating_duration_since(since).as_secs())
    }
}
