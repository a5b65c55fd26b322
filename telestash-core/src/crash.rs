//! Crash reports
//!
//! A crash report is queued as its own request with the report as JSON in
//! the `crash` parameter. It never goes through the event buffer.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::event::SegmentValue;

/// An error to report, fatal or not
#[derive(Debug, Clone, PartialEq)]
pub struct CrashReport {
    error: String,
    nonfatal: bool,
    breadcrumbs: Vec<String>,
    custom: BTreeMap<String, SegmentValue>,
}

impl CrashReport {
    /// A fatal crash described by `error`, usually a stack trace
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            nonfatal: false,
            breadcrumbs: Vec::new(),
            custom: BTreeMap::new(),
        }
    }

    /// An error the application recovered from
    pub fn nonfatal(error: impl Into<String>) -> Self {
        Self {
            nonfatal: true,
            ..Self::new(error)
        }
    }

    /// Add a log line leading up to the crash
    pub fn breadcrumb(mut self, line: impl Into<String>) -> Self {
        self.breadcrumbs.push(line.into());
        self
    }

    /// Attach a custom key/value
    pub fn custom(mut self, key: impl Into<String>, value: impl Into<SegmentValue>) -> Self {
        self.custom.insert(key.into(), value.into());
        self
    }

    pub fn is_fatal(&self) -> bool {
        !self.nonfatal
    }

    /// JSON for the `crash` request parameter
    pub fn to_json(&self) -> Result<String> {
        if self.error.trim().is_empty() {
            return Err(Error::InvalidEvent(
                "crash report needs an error description".to_string(),
            ));
        }

        let mut report = Map::new();
        report.insert("_error".to_string(), json!(self.error));
        report.insert("_nonfatal".to_string(), json!(self.nonfatal.to_string()));
        report.insert("_os".to_string(), json!(std::env::consts::OS));
        if !self.breadcrumbs.is_empty() {
            let mut logs = self.breadcrumbs.join("\n");
            logs.push('\n');
            report.insert("_logs".to_string(), json!(logs));
        }
        if !self.custom.is_empty() {
            report.insert("_custom".to_string(), serde_json::to_value(&self.custom)?);
        }
        Ok(Value::Object(report).to_string())
    }
}
