//! Buffered analytics events
//!
//! Events live in the pending-event buffer until a flush serializes the whole
//! buffer into one request.

use std::collections::BTreeMap;

use chrono::{Datelike, Local, TimeZone, Timelike};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A point in time as reported to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Moment {
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: i64,
    /// Local hour, 0..=23
    pub hour: u8,
    /// Local day of week, 0 = Sunday
    pub dow: u8,
    /// Local offset from UTC in minutes
    pub tz_offset_minutes: i32,
}

impl Moment {
    /// The current local time
    pub fn now() -> Self {
        Self::from_datetime(Local::now())
    }

    /// Interpret `timestamp_ms` in the local timezone
    pub fn from_millis(timestamp_ms: i64) -> Option<Self> {
        Local
            .timestamp_millis_opt(timestamp_ms)
            .single()
            .map(Self::from_datetime)
    }

    fn from_datetime(dt: chrono::DateTime<Local>) -> Self {
        Self {
            timestamp_ms: dt.timestamp_millis(),
            hour: dt.hour() as u8,
            dow: dt.weekday().num_days_from_sunday() as u8,
            tz_offset_minutes: dt.offset().local_minus_utc() / 60,
        }
    }
}

/// A typed segmentation value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SegmentValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
}

impl From<&str> for SegmentValue {
    fn from(v: &str) -> Self {
        SegmentValue::String(v.to_string())
    }
}

impl From<String> for SegmentValue {
    fn from(v: String) -> Self {
        SegmentValue::String(v)
    }
}

impl From<i64> for SegmentValue {
    fn from(v: i64) -> Self {
        SegmentValue::Int(v)
    }
}

impl From<i32> for SegmentValue {
    fn from(v: i32) -> Self {
        SegmentValue::Int(v as i64)
    }
}

impl From<f64> for SegmentValue {
    fn from(v: f64) -> Self {
        SegmentValue::Double(v)
    }
}

impl From<bool> for SegmentValue {
    fn from(v: bool) -> Self {
        SegmentValue::Bool(v)
    }
}

impl SegmentValue {
    /// Parse a CLI-style literal: `true`/`false`, integer, float, else string
    pub fn parse_literal(raw: &str) -> Self {
        if let Ok(b) = raw.parse::<bool>() {
            return SegmentValue::Bool(b);
        }
        if let Ok(i) = raw.parse::<i64>() {
            return SegmentValue::Int(i);
        }
        match raw.parse::<f64>() {
            Ok(d) if d.is_finite() => SegmentValue::Double(d),
            _ => SegmentValue::String(raw.to_string()),
        }
    }
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

/// A recorded event waiting in the buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event name
    pub key: String,

    /// Named segmentation values
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub segmentation: BTreeMap<String, SegmentValue>,

    /// Occurrence count, at least 1
    pub count: u32,

    /// Summed numeric value
    #[serde(default)]
    pub sum: f64,

    /// Duration in seconds
    #[serde(default, skip_serializing_if = "is_zero")]
    pub dur: f64,

    /// Milliseconds since the Unix epoch
    pub timestamp: i64,

    /// Local hour
    pub hour: u8,

    /// Local day of week, 0 = Sunday
    pub dow: u8,

    /// Unique event ID
    pub id: String,

    /// Non-finite values the builder dropped
    #[serde(skip)]
    pub(crate) dropped_values: u32,
}

impl Event {
    /// Start building an event named `key`
    pub fn builder(key: impl Into<String>) -> EventBuilder {
        EventBuilder {
            key: key.into(),
            segmentation: BTreeMap::new(),
            count: 1,
            sum: 0.0,
            dur: 0.0,
            at: None,
            id: None,
        }
    }
}

/// Builder validating events before they reach the buffer
#[derive(Debug, Clone)]
pub struct EventBuilder {
    key: String,
    segmentation: BTreeMap<String, SegmentValue>,
    count: u32,
    sum: f64,
    dur: f64,
    at: Option<Moment>,
    id: Option<String>,
}

impl EventBuilder {
    /// Add one segmentation value
    pub fn segment(mut self, key: impl Into<String>, value: impl Into<SegmentValue>) -> Self {
        self.segmentation.insert(key.into(), value.into());
        self
    }

    /// Set the occurrence count
    pub fn count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    /// Set the summed value
    pub fn sum(mut self, sum: f64) -> Self {
        self.sum = sum;
        self
    }

    /// Set the duration in seconds
    pub fn duration(mut self, dur: f64) -> Self {
        self.dur = dur;
        self
    }

    /// Record at a specific time instead of now
    pub fn at(mut self, at: Moment) -> Self {
        self.at = Some(at);
        self
    }

    /// Use a caller-supplied event ID
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<Event> {
        if self.key.is_empty() {
            return Err(Error::InvalidEvent("event key cannot be empty".to_string()));
        }
        if self.count < 1 {
            return Err(Error::InvalidEvent(
                "count must be greater than or equal to 1".to_string(),
            ));
        }
        if !(self.dur >= 0.0) || !self.dur.is_finite() {
            return Err(Error::InvalidEvent(
                "duration must be a finite value >= 0".to_string(),
            ));
        }
        let at = self.at.unwrap_or_else(Moment::now);
        if at.timestamp_ms < 0 {
            return Err(Error::InvalidEvent(
                "timestamp must be greater than or equal to zero".to_string(),
            ));
        }
        if at.hour > 23 {
            return Err(Error::InvalidEvent("hour must be in range [0, 23]".to_string()));
        }
        if at.dow > 6 {
            return Err(Error::InvalidEvent("dow must be in range [0, 6]".to_string()));
        }

        // JSON has no NaN or infinity
        let mut dropped_values = 0;
        let sum = if self.sum.is_finite() {
            self.sum
        } else {
            tracing::warn!(key = %self.key, "Dropping non-finite event sum");
            dropped_values += 1;
            0.0
        };
        let mut segmentation = self.segmentation;
        segmentation.retain(|name, value| match value {
            SegmentValue::Double(d) if !d.is_finite() => {
                tracing::warn!(segment = %name, "Dropping non-finite segmentation value");
                dropped_values += 1;
                false
            }
            _ => true,
        });

        Ok(Event {
            key: self.key,
            segmentation,
            count: self.count,
            sum,
            dur: self.dur,
            timestamp: at.timestamp_ms,
            hour: at.hour,
            dow: at.dow,
            id: self.id.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()),
            dropped_values,
        })
    }
}
