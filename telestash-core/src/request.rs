//! Request strings on the wire
//!
//! Every queued request is a URL-query-style `key=value&key2=value2` string.
//! This module builds the common parameter prefix and provides field-level
//! lookups and rewrites. Parsing is deliberately lenient: a segment without
//! `=` or with an undecodable value is carried through untouched.

use sha2::{Digest, Sha256};

use crate::event::Moment;

/// Reserved field carrying the device identifier
pub const DEVICE_ID_FIELD: &str = "device_id";

/// Field added when tamper protection is enabled
pub const CHECKSUM_FIELD: &str = "checksum256";

/// SDK name reported with every request
pub const SDK_NAME: &str = "telestash-rust";

/// SDK version reported with every request
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Ordered `key=value` pairs with percent-encoded values
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    /// Create an empty parameter list
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pair, percent-encoding the value
    pub fn push(mut self, key: &str, value: impl AsRef<str>) -> Self {
        self.pairs
            .push((key.to_string(), urlencoding::encode(value.as_ref()).into_owned()));
        self
    }

    /// Append a pair whose value is already encoded
    pub fn push_encoded(mut self, key: &str, encoded: impl Into<String>) -> Self {
        self.pairs.push((key.to_string(), encoded.into()));
        self
    }

    /// Render as `key=value&...`
    pub fn build(&self) -> String {
        let mut out = String::with_capacity(self.pairs.len() * 16);
        for (i, (key, value)) in self.pairs.iter().enumerate() {
            if i > 0 {
                out.push('&');
            }
            out.push_str(key);
            out.push('=');
            out.push_str(value);
        }
        out
    }
}

/// Builds the parameter prefix shared by every request
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    app_key: String,
}

impl RequestBuilder {
    /// Create a builder for the given application key
    pub fn new(app_key: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
        }
    }

    /// The application key sent with every request
    pub fn app_key(&self) -> &str {
        &self.app_key
    }

    /// Common parameters stamped with the current time
    pub fn base(&self, device_id: &str) -> QueryParams {
        self.base_at(device_id, Moment::now())
    }

    /// Common parameters stamped with `at`
    pub fn base_at(&self, device_id: &str, at: Moment) -> QueryParams {
        QueryParams::new()
            .push("app_key", &self.app_key)
            .push("timestamp", at.timestamp_ms.to_string())
            .push("hour", at.hour.to_string())
            .push("dow", at.dow.to_string())
            .push("tz", at.tz_offset_minutes.to_string())
            .push("sdk_version", SDK_VERSION)
            .push("sdk_name", SDK_NAME)
            .push(DEVICE_ID_FIELD, device_id)
    }

    /// Request carrying a JSON array of events
    pub fn events(&self, device_id: &str, events_json: &str) -> String {
        self.base(device_id).push("events", events_json).build()
    }

    /// Request asking the server to merge `old` into `new`
    pub fn merge_device_id(&self, old: &str, new: &str) -> String {
        self.base(new).push("old_device_id", old).build()
    }

    /// Request carrying health counters as JSON
    pub fn health_check(&self, device_id: &str, health_json: &str) -> String {
        self.base(device_id).push("hc", health_json).build()
    }

    /// Session start with device metrics as JSON
    pub fn begin_session(&self, device_id: &str, metrics_json: &str) -> String {
        self.base(device_id)
            .push("begin_session", "1")
            .push("metrics", metrics_json)
            .build()
    }

    /// Seconds of session time since the last report
    pub fn update_session(&self, device_id: &str, duration_secs: u64) -> String {
        self.base(device_id)
            .push("session_duration", duration_secs.to_string())
            .build()
    }

    /// Session end; a zero duration is left off
    pub fn end_session(&self, device_id: &str, duration_secs: u64) -> String {
        let params = self.base(device_id).push("end_session", "1");
        if duration_secs > 0 {
            params
                .push("session_duration", duration_secs.to_string())
                .build()
        } else {
            params.build()
        }
    }

    /// Request carrying one crash report as JSON
    pub fn crash_report(&self, device_id: &str, crash_json: &str) -> String {
        self.base(device_id).push("crash", crash_json).build()
    }
}

/// Split `segment` into key and raw value at the first `=`
fn split_pair(segment: &str) -> Option<(&str, &str)> {
    segment.split_once('=')
}

/// Decoded value matches `expected`; undecodable values compare raw
fn value_matches(raw: &str, expected: &str) -> bool {
    match urlencoding::decode(raw) {
        Ok(decoded) => decoded == expected,
        Err(_) => raw == expected,
    }
}

/// Decoded value of the first `field` in `request`
pub fn field_value(request: &str, field: &str) -> Option<String> {
    request.split('&').find_map(|segment| {
        let (key, raw) = split_pair(segment)?;
        if key != field {
            return None;
        }
        Some(
            urlencoding::decode(raw)
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| raw.to_string()),
        )
    })
}

/// Whether `request` has a `field` whose decoded value equals `value`
pub fn has_field_value(request: &str, field: &str, value: &str) -> bool {
    request.split('&').any(|segment| match split_pair(segment) {
        Some((key, raw)) => key == field && value_matches(raw, value),
        None => false,
    })
}

/// Replace the value of every `field` equal to `old` with `new`.
///
/// Returns `None` when nothing matched. Every other byte of the request is
/// kept as-is, including malformed segments.
pub fn replace_field_value(request: &str, field: &str, old: &str, new: &str) -> Option<String> {
    let mut matched = false;
    let encoded_new = urlencoding::encode(new);

    let segments: Vec<String> = request
        .split('&')
        .map(|segment| match split_pair(segment) {
            Some((key, raw)) if key == field && value_matches(raw, old) => {
                matched = true;
                format!("{}={}", key, encoded_new)
            }
            _ => segment.to_string(),
        })
        .collect();

    matched.then(|| segments.join("&"))
}

/// Append `checksum256=<hex sha256(request + salt)>`
pub fn append_checksum(request: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.as_bytes());
    hasher.update(salt.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}&{}={}", request, CHECKSUM_FIELD, digest)
}
