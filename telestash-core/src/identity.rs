//! Device identity and identity changes
//!
//! The identity is the `device_id` every request carries. Changing it may
//! have to rewrite requests that were queued under the old value, in
//! particular every request queued while the temporary sentinel was active.
//!
//! Lock order: the identity lock is always taken before the queue lock.

use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::IdentityConfig;
use crate::db::KeyValueStore;
use crate::error::{Error, Result};
use crate::queue::QueueStore;
use crate::request::{has_field_value, replace_field_value, RequestBuilder, DEVICE_ID_FIELD};

/// Reserved device ID used until the real identity is known
pub const TEMPORARY_DEVICE_ID: &str = "CLYTemporaryDeviceID";

/// Store key for the device ID value
pub const VALUE_KEY: &str = "device_id.value";

/// Store key for the device ID type
pub const TYPE_KEY: &str = "device_id.type";

/// Where the current device ID came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceIdType {
    SdkGenerated,
    DeveloperSupplied,
    Temporary,
    AdvertisingId,
}

impl DeviceIdType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceIdType::SdkGenerated => "sdk_generated",
            DeviceIdType::DeveloperSupplied => "developer_supplied",
            DeviceIdType::Temporary => "temporary",
            DeviceIdType::AdvertisingId => "advertising_id",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sdk_generated" => Some(DeviceIdType::SdkGenerated),
            "developer_supplied" => Some(DeviceIdType::DeveloperSupplied),
            "temporary" => Some(DeviceIdType::Temporary),
            "advertising_id" => Some(DeviceIdType::AdvertisingId),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceIdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of a platform advertising identifier
pub trait AdvertisingIdProvider: Send + Sync {
    /// The advertising ID, or `None` when the platform has none
    fn advertising_id(&self) -> Option<String>;
}

/// Outcome of an identity operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityChange {
    /// Nothing to do
    Unchanged,
    /// Switched IDs without touching the queue
    Switched,
    /// Switched to the temporary sentinel
    EnteredTemporary,
    /// Left temporary mode; `rewritten` queued requests now carry the new ID
    ExitedTemporary { rewritten: usize },
    /// Queued a merge request and switched IDs
    Merged,
}

/// Null-safe identifier comparison.
///
/// Only an unspecified or developer supplied hint compares text. Any other
/// hint names an ID the caller cannot know in advance, so it matches.
pub fn identifier_equals(
    candidate: Option<&str>,
    candidate_type: Option<DeviceIdType>,
    current: Option<&str>,
) -> bool {
    match candidate_type {
        None | Some(DeviceIdType::DeveloperSupplied) => candidate == current,
        Some(_) => true,
    }
}

#[derive(Debug, Clone)]
struct IdentityState {
    value: String,
    id_type: DeviceIdType,
}

impl IdentityState {
    fn temporary() -> Self {
        Self {
            value: TEMPORARY_DEVICE_ID.to_string(),
            id_type: DeviceIdType::Temporary,
        }
    }

    fn is_temporary(&self) -> bool {
        self.value == TEMPORARY_DEVICE_ID
    }
}

fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// The current device identity, persisted alongside the queue
pub struct DeviceIdentity {
    kv: Arc<dyn KeyValueStore>,
    queue: Arc<QueueStore>,
    advertising: Option<Arc<dyn AdvertisingIdProvider>>,
    state: RwLock<IdentityState>,
}

impl DeviceIdentity {
    /// Build an identity of a generated kind.
    ///
    /// A previously persisted identity wins. `DeveloperSupplied` always
    /// fails here; use [`DeviceIdentity::developer_supplied`].
    pub fn with_type(
        kv: Arc<dyn KeyValueStore>,
        queue: Arc<QueueStore>,
        id_type: DeviceIdType,
        advertising: Option<Arc<dyn AdvertisingIdProvider>>,
    ) -> Result<Self> {
        if id_type == DeviceIdType::DeveloperSupplied {
            return Err(Error::InvalidIdentity(
                "a developer supplied device ID needs a value".to_string(),
            ));
        }

        let stored = load_stored(kv.as_ref())?;
        let identity = Self {
            kv,
            queue,
            advertising,
            state: RwLock::new(IdentityState::temporary()),
        };

        let state = match stored {
            Some(state) => {
                tracing::debug!(device_id_type = %state.id_type, "Using persisted device ID");
                state
            }
            None => identity.generate(id_type),
        };
        identity.persist(&state)?;
        *identity.write() = state;
        Ok(identity)
    }

    /// Build an identity from a developer supplied value.
    ///
    /// A persisted non-temporary identity wins. A persisted temporary
    /// identity is resolved to `value`, rewriting queued requests.
    pub fn developer_supplied(
        kv: Arc<dyn KeyValueStore>,
        queue: Arc<QueueStore>,
        value: &str,
        advertising: Option<Arc<dyn AdvertisingIdProvider>>,
    ) -> Result<Self> {
        if value.is_empty() {
            return Err(Error::InvalidIdentity(
                "developer supplied device ID cannot be empty".to_string(),
            ));
        }

        let stored = load_stored(kv.as_ref())?;
        let identity = Self {
            kv,
            queue,
            advertising,
            state: RwLock::new(IdentityState::temporary()),
        };

        match stored {
            Some(state) if !state.is_temporary() => {
                tracing::debug!(
                    device_id_type = %state.id_type,
                    "Persisted device ID takes precedence over the supplied one"
                );
                *identity.write() = state;
            }
            Some(_) => {
                identity.exit_temporary_mode(DeviceIdType::DeveloperSupplied, value)?;
            }
            None => {
                let state = IdentityState {
                    value: value.to_string(),
                    id_type: DeviceIdType::DeveloperSupplied,
                };
                identity.persist(&state)?;
                *identity.write() = state;
            }
        }
        Ok(identity)
    }

    /// Build the identity described by configuration
    pub fn from_config(
        kv: Arc<dyn KeyValueStore>,
        queue: Arc<QueueStore>,
        config: &IdentityConfig,
        advertising: Option<Arc<dyn AdvertisingIdProvider>>,
    ) -> Result<Self> {
        match config.device_id.as_deref() {
            Some(value) => Self::developer_supplied(kv, queue, value, advertising),
            None if config.temporary_id_mode => {
                Self::with_type(kv, queue, DeviceIdType::Temporary, advertising)
            }
            None => Self::with_type(kv, queue, DeviceIdType::SdkGenerated, advertising),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, IdentityState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, IdentityState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, state: &IdentityState) -> Result<()> {
        self.kv
            .set_many(&[
                (VALUE_KEY, state.value.as_str()),
                (TYPE_KEY, state.id_type.as_str()),
            ])
    }

    fn generate(&self, id_type: DeviceIdType) -> IdentityState {
        match id_type {
            DeviceIdType::Temporary => IdentityState::temporary(),
            DeviceIdType::AdvertisingId => {
                match self.advertising.as_ref().and_then(|p| p.advertising_id()) {
                    Some(value) if !value.is_empty() => IdentityState {
                        value,
                        id_type: DeviceIdType::AdvertisingId,
                    },
                    _ => {
                        tracing::warn!("Advertising ID unavailable, generating a device ID");
                        IdentityState {
                            value: generate_id(),
                            id_type: DeviceIdType::SdkGenerated,
                        }
                    }
                }
            }
            DeviceIdType::SdkGenerated | DeviceIdType::DeveloperSupplied => IdentityState {
                value: generate_id(),
                id_type: DeviceIdType::SdkGenerated,
            },
        }
    }

    // ========== Queries ==========

    /// The current device ID
    pub fn value(&self) -> String {
        self.read().value.clone()
    }

    /// Run `f` with the current device ID while holding the identity lock,
    /// so no identity change can interleave with `f`
    pub fn with_value<R>(&self, f: impl FnOnce(&str) -> R) -> R {
        let state = self.read();
        f(&state.value)
    }

    /// The current ID type; the sentinel always reports `Temporary`
    pub fn id_type(&self) -> DeviceIdType {
        let state = self.read();
        if state.is_temporary() {
            DeviceIdType::Temporary
        } else {
            state.id_type
        }
    }

    /// Whether the temporary sentinel is active
    pub fn temporary_id_mode_enabled(&self) -> bool {
        self.read().is_temporary()
    }

    /// [`identifier_equals`] against the current ID
    pub fn matches(&self, candidate: Option<&str>, candidate_type: Option<DeviceIdType>) -> bool {
        let state = self.read();
        identifier_equals(candidate, candidate_type, Some(&state.value))
    }

    /// Whether any queued request still carries the temporary sentinel
    pub fn queue_contains_temporary_id_requests(&self) -> bool {
        self.queue
            .any_request(|r| has_field_value(r, DEVICE_ID_FIELD, TEMPORARY_DEVICE_ID))
    }

    // ========== Changes ==========

    /// Replace `device_id=<old>` with `new` in every queued request
    pub fn rewrite_queued_requests(&self, old: &str, new: &str) -> Result<usize> {
        let rewritten = self
            .queue
            .rewrite_requests(|r| replace_field_value(r, DEVICE_ID_FIELD, old, new))?;
        if rewritten > 0 {
            tracing::info!(rewritten, "Rewrote device ID on queued requests");
        }
        Ok(rewritten)
    }

    /// Switch to the temporary sentinel
    pub fn enter_temporary_mode(&self) -> Result<IdentityChange> {
        let mut state = self.write();
        if state.is_temporary() {
            return Ok(IdentityChange::Unchanged);
        }
        let next = IdentityState::temporary();
        self.persist(&next)?;
        *state = next;
        tracing::info!("Entered temporary device ID mode");
        Ok(IdentityChange::EnteredTemporary)
    }

    /// Switch to `value` and rewrite every queued temporary-ID request to it
    pub fn exit_temporary_mode(&self, id_type: DeviceIdType, value: &str) -> Result<IdentityChange> {
        if value.is_empty() || value == TEMPORARY_DEVICE_ID {
            return Err(Error::InvalidIdentity(
                "leaving temporary mode needs a real device ID".to_string(),
            ));
        }
        let mut state = self.write();
        self.exit_temporary_locked(&mut state, id_type, value)
    }

    fn exit_temporary_locked(
        &self,
        state: &mut IdentityState,
        id_type: DeviceIdType,
        value: &str,
    ) -> Result<IdentityChange> {
        let next = IdentityState {
            value: value.to_string(),
            id_type,
        };
        // Identity first: a crash before the rewrite leaves stale requests
        // that resolve_stale_temporary_requests fixes later
        self.persist(&next)?;
        *state = next;
        let rewritten = self.rewrite_queued_requests(TEMPORARY_DEVICE_ID, value)?;
        tracing::info!(device_id_type = %id_type, rewritten, "Left temporary device ID mode");
        Ok(IdentityChange::ExitedTemporary { rewritten })
    }

    /// Rewrite queued temporary-ID requests when the identity is already
    /// resolved. Returns how many were rewritten.
    pub fn resolve_stale_temporary_requests(&self) -> Result<usize> {
        let state = self.write();
        if state.is_temporary() {
            return Ok(0);
        }
        self.rewrite_queued_requests(TEMPORARY_DEVICE_ID, &state.value)
    }

    /// Change the ID and ask the server to merge the old ID's data into it
    pub fn change_with_merge(&self, new: &str, builder: &RequestBuilder) -> Result<IdentityChange> {
        if new.is_empty() {
            return Err(Error::InvalidIdentity(
                "new device ID cannot be empty".to_string(),
            ));
        }

        let mut state = self.write();
        if state.is_temporary() || self.queue_contains_temporary_id_requests() {
            if new == TEMPORARY_DEVICE_ID {
                return Ok(IdentityChange::Unchanged);
            }
            return self.exit_temporary_locked(&mut state, DeviceIdType::DeveloperSupplied, new);
        }

        if new == TEMPORARY_DEVICE_ID {
            drop(state);
            return self.enter_temporary_mode();
        }
        if new == state.value {
            return Ok(IdentityChange::Unchanged);
        }

        let merge = builder.merge_device_id(&state.value, new);
        self.queue.append_request(&merge)?;

        let next = IdentityState {
            value: new.to_string(),
            id_type: DeviceIdType::DeveloperSupplied,
        };
        self.persist(&next)?;
        tracing::info!("Changed device ID with merge");
        *state = next;
        Ok(IdentityChange::Merged)
    }

    /// Change the ID without merging; the server treats it as a new device
    pub fn change_without_merge(
        &self,
        id_type: DeviceIdType,
        value: Option<&str>,
    ) -> Result<IdentityChange> {
        let supplied = match (id_type, value) {
            (DeviceIdType::DeveloperSupplied, Some(v)) if !v.is_empty() => Some(v),
            (DeviceIdType::DeveloperSupplied, _) => {
                return Err(Error::InvalidIdentity(
                    "a developer supplied device ID needs a value".to_string(),
                ))
            }
            _ => None,
        };

        if id_type == DeviceIdType::Temporary || supplied == Some(TEMPORARY_DEVICE_ID) {
            return self.enter_temporary_mode();
        }

        let mut state = self.write();
        let next = match supplied {
            Some(v) => IdentityState {
                value: v.to_string(),
                id_type: DeviceIdType::DeveloperSupplied,
            },
            None => self.generate(id_type),
        };

        if state.is_temporary() || self.queue_contains_temporary_id_requests() {
            return self.exit_temporary_locked(&mut state, next.id_type, &next.value);
        }
        if next.value == state.value && next.id_type == state.id_type {
            return Ok(IdentityChange::Unchanged);
        }

        self.persist(&next)?;
        tracing::info!(device_id_type = %next.id_type, "Changed device ID without merge");
        *state = next;
        Ok(IdentityChange::Switched)
    }
}

fn load_stored(kv: &dyn KeyValueStore) -> Result<Option<IdentityState>> {
    let Some(value) = kv.get(VALUE_KEY)?.filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    let id_type = kv
        .get(TYPE_KEY)?
        .as_deref()
        .and_then(DeviceIdType::parse)
        .unwrap_or(if value == TEMPORARY_DEVICE_ID {
            DeviceIdType::Temporary
        } else {
            DeviceIdType::SdkGenerated
        });
    Ok(Some(IdentityState { value, id_type }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::db::Database;

    struct FixedAdvertising(Option<&'static str>);

    impl AdvertisingIdProvider for FixedAdvertising {
        fn advertising_id(&self) -> Option<String> {
            self.0.map(str::to_string)
        }
    }

    fn parts() -> (Arc<Database>, Arc<QueueStore>) {
        let db = Arc::new(Database::open_in_memory_migrated().unwrap());
        let queue = Arc::new(QueueStore::open(db.clone(), &QueueConfig::default()).unwrap());
        (db, queue)
    }

    #[test]
    fn test_developer_supplied_through_with_type_fails() {
        let (db, queue) = parts();
        let result = DeviceIdentity::with_type(db, queue, DeviceIdType::DeveloperSupplied, None);
        assert!(matches!(result, Err(Error::InvalidIdentity(_))));
    }

    #[test]
    fn test_empty_developer_supplied_fails() {
        let (db, queue) = parts();
        assert!(DeviceIdentity::developer_supplied(db, queue, "", None).is_err());
    }

    #[test]
    fn test_generated_id_persists() {
        let (db, queue) = parts();
        let first =
            DeviceIdentity::with_type(db.clone(), queue.clone(), DeviceIdType::SdkGenerated, None)
                .unwrap();
        assert_eq!(first.id_type(), DeviceIdType::SdkGenerated);
        assert!(!first.value().is_empty());

        let second =
            DeviceIdentity::with_type(db, queue, DeviceIdType::SdkGenerated, None).unwrap();
        assert_eq!(first.value(), second.value());
    }

    #[test]
    fn test_advertising_id_falls_back_to_generated() {
        let (db, queue) = parts();
        let provider: Arc<dyn AdvertisingIdProvider> = Arc::new(FixedAdvertising(None));
        let identity =
            DeviceIdentity::with_type(db, queue, DeviceIdType::AdvertisingId, Some(provider))
                .unwrap();
        assert_eq!(identity.id_type(), DeviceIdType::SdkGenerated);

        let (db, queue) = parts();
        let provider: Arc<dyn AdvertisingIdProvider> = Arc::new(FixedAdvertising(Some("ad-1")));
        let identity =
            DeviceIdentity::with_type(db, queue, DeviceIdType::AdvertisingId, Some(provider))
                .unwrap();
        assert_eq!(identity.value(), "ad-1");
        assert_eq!(identity.id_type(), DeviceIdType::AdvertisingId);
    }

    #[test]
    fn test_temporary_mode_reports_temporary() {
        let (db, queue) = parts();
        let identity =
            DeviceIdentity::with_type(db, queue, DeviceIdType::Temporary, None).unwrap();
        assert!(identity.temporary_id_mode_enabled());
        assert_eq!(identity.value(), TEMPORARY_DEVICE_ID);
        assert_eq!(identity.id_type(), DeviceIdType::Temporary);
    }

    #[test]
    fn test_identifier_equals() {
        assert!(identifier_equals(None, None, None));
        assert!(identifier_equals(Some("a"), None, Some("a")));
        assert!(!identifier_equals(Some("a"), None, Some("b")));
        assert!(!identifier_equals(None, Some(DeviceIdType::DeveloperSupplied), Some("b")));
        assert!(identifier_equals(Some("x"), Some(DeviceIdType::SdkGenerated), Some("b")));
        assert!(identifier_equals(None, Some(DeviceIdType::AdvertisingId), None));
    }

    #[test]
    fn test_change_with_merge_queues_merge_request() {
        let (db, queue) = parts();
        let identity =
            DeviceIdentity::developer_supplied(db, queue.clone(), "old", None).unwrap();
        let builder = RequestBuilder::new("app");

        let change = identity.change_with_merge("new", &builder).unwrap();
        assert_eq!(change, IdentityChange::Merged);
        assert_eq!(identity.value(), "new");

        let requests = queue.requests();
        assert_eq!(requests.len(), 1);
        assert!(has_field_value(&requests[0], "old_device_id", "old"));
        assert!(has_field_value(&requests[0], DEVICE_ID_FIELD, "new"));

        // Same ID again is a no-op
        assert_eq!(
            identity.change_with_merge("new", &builder).unwrap(),
            IdentityChange::Unchanged
        );
        assert_eq!(queue.request_count(), 1);
    }

    #[test]
    fn test_change_with_merge_exits_temporary_mode() {
        let (db, queue) = parts();
        let identity =
            DeviceIdentity::with_type(db, queue.clone(), DeviceIdType::Temporary, None).unwrap();
        queue
            .append_request(&format!("a=1&device_id={}", TEMPORARY_DEVICE_ID))
            .unwrap();

        let change = identity
            .change_with_merge("real", &RequestBuilder::new("app"))
            .unwrap();
        assert_eq!(change, IdentityChange::ExitedTemporary { rewritten: 1 });
        assert_eq!(queue.requests(), vec!["a=1&device_id=real".to_string()]);
        assert_eq!(identity.id_type(), DeviceIdType::DeveloperSupplied);
    }

    #[test]
    fn test_change_without_merge_requires_value_for_developer_supplied() {
        let (db, queue) = parts();
        let identity =
            DeviceIdentity::with_type(db, queue, DeviceIdType::SdkGenerated, None).unwrap();
        assert!(identity
            .change_without_merge(DeviceIdType::DeveloperSupplied, None)
            .is_err());
        assert!(identity
            .change_without_merge(DeviceIdType::DeveloperSupplied, Some(""))
            .is_err());
    }

    #[test]
    fn test_change_without_merge_switches_without_queueing() {
        let (db, queue) = parts();
        let identity =
            DeviceIdentity::with_type(db, queue.clone(), DeviceIdType::SdkGenerated, None)
                .unwrap();

        let change = identity
            .change_without_merge(DeviceIdType::DeveloperSupplied, Some("dev-2"))
            .unwrap();
        assert_eq!(change, IdentityChange::Switched);
        assert_eq!(identity.value(), "dev-2");
        assert_eq!(queue.request_count(), 0);

        assert_eq!(
            identity
                .change_without_merge(DeviceIdType::Temporary, None)
                .unwrap(),
            IdentityChange::EnteredTemporary
        );
        assert_eq!(
            identity
                .change_without_merge(DeviceIdType::Temporary, None)
                .unwrap(),
            IdentityChange::Unchanged
        );
    }

    #[test]
    fn test_developer_supplied_resolves_persisted_temporary() {
        let (db, queue) = parts();
        {
            let _temp = DeviceIdentity::with_type(
                db.clone(),
                queue.clone(),
                DeviceIdType::Temporary,
                None,
            )
            .unwrap();
            queue
                .append_request(&format!("device_id={}", TEMPORARY_DEVICE_ID))
                .unwrap();
        }

        let identity =
            DeviceIdentity::developer_supplied(db.clone(), queue.clone(), "dev", None).unwrap();
        assert_eq!(identity.value(), "dev");
        assert_eq!(queue.requests(), vec!["device_id=dev".to_string()]);
        assert_eq!(db.get(VALUE_KEY).unwrap().as_deref(), Some("dev"));
    }

    #[test]
    fn test_resolve_stale_temporary_requests() {
        let (db, queue) = parts();
        let identity =
            DeviceIdentity::developer_supplied(db, queue.clone(), "dev", None).unwrap();
        queue
            .append_request(&format!("device_id={}", TEMPORARY_DEVICE_ID))
            .unwrap();

        assert!(identity.queue_contains_temporary_id_requests());
        assert_eq!(identity.resolve_stale_temporary_requests().unwrap(), 1);
        assert!(!identity.queue_contains_temporary_id_requests());
    }
}
