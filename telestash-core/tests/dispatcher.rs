//! Integration tests for request delivery
//!
//! A scripted transport stands in for the server: each send pops the next
//! scripted outcome (success when the script runs out) and records what was
//! sent.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use telestash_core::config::{IdentityConfig, QueueConfig};
use telestash_core::db::Database;
use telestash_core::dispatcher::{DispatcherHandle, INITIAL_BACKOFF};
use telestash_core::health::HealthCounter;
use telestash_core::request::{append_checksum, field_value};
use telestash_core::{
    Blocked, DeliveryError, DeviceIdType, DeviceIdentity, QueueStore, RequestDispatcher,
    Transport, TEMPORARY_DEVICE_ID,
};

type Outcome = std::result::Result<(), DeliveryError>;

#[derive(Default)]
struct ScriptedTransport {
    script: Mutex<VecDeque<Outcome>>,
    sent: Mutex<Vec<(String, BTreeMap<String, String>)>>,
}

impl ScriptedTransport {
    fn with_script(outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        Self {
            script: Mutex::new(outcomes.into_iter().collect()),
            sent: Mutex::new(Vec::new()),
        }
    }

    fn bodies(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(body, _)| body.clone())
            .collect()
    }

    fn last_headers(&self) -> Option<BTreeMap<String, String>> {
        self.sent.lock().unwrap().last().map(|(_, h)| h.clone())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &str, headers: &BTreeMap<String, String>) -> Outcome {
        self.sent
            .lock()
            .unwrap()
            .push((request.to_string(), headers.clone()));
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

fn retryable(status: u16) -> Outcome {
    Err(DeliveryError::Retryable {
        status: Some(status),
        message: "server busy".to_string(),
    })
}

fn fatal(status: u16) -> Outcome {
    Err(DeliveryError::Fatal {
        status: Some(status),
        message: "bad request".to_string(),
    })
}

struct Fixture {
    queue: Arc<QueueStore>,
    identity: Arc<DeviceIdentity>,
    health: Arc<HealthCounter>,
    transport: Arc<ScriptedTransport>,
}

impl Fixture {
    fn new(identity_config: IdentityConfig, transport: ScriptedTransport) -> Self {
        let db = Arc::new(Database::open_in_memory_migrated().unwrap());
        let queue = Arc::new(QueueStore::open(db.clone(), &QueueConfig::default()).unwrap());
        let identity = Arc::new(
            DeviceIdentity::from_config(db.clone(), queue.clone(), &identity_config, None)
                .unwrap(),
        );
        let health = Arc::new(HealthCounter::open(db).unwrap());
        Self {
            queue,
            identity,
            health,
            transport: Arc::new(transport),
        }
    }

    fn developer(transport: ScriptedTransport) -> Self {
        Self::new(
            IdentityConfig {
                device_id: Some("dev-1".to_string()),
                temporary_id_mode: false,
            },
            transport,
        )
    }

    fn dispatcher(&self) -> RequestDispatcher {
        RequestDispatcher::new(
            self.queue.clone(),
            self.identity.clone(),
            self.transport.clone(),
            self.health.clone(),
        )
    }

    fn enqueue(&self, requests: &[&str]) {
        for request in requests {
            self.queue.append_request(request).unwrap();
        }
    }
}

#[tokio::test]
async fn delivers_in_order_until_empty() {
    let fixture = Fixture::developer(ScriptedTransport::default());
    fixture.enqueue(&["a=1", "b=2", "c=3"]);

    let report = fixture.dispatcher().drain_once().await;

    assert_eq!(report.delivered, 3);
    assert_eq!(report.remaining, 0);
    assert_eq!(report.blocked, None);
    assert_eq!(fixture.transport.bodies(), vec!["a=1", "b=2", "c=3"]);
}

#[tokio::test]
async fn retryable_failure_keeps_head_and_blocks() {
    let fixture = Fixture::developer(ScriptedTransport::with_script([retryable(503)]));
    fixture.enqueue(&["a=1", "b=2"]);

    let report = fixture.dispatcher().drain_once().await;

    assert_eq!(report.delivered, 0);
    assert_eq!(report.remaining, 2);
    assert_eq!(
        report.blocked,
        Some(Blocked::Retry {
            status: Some(503),
            retry_after: INITIAL_BACKOFF,
        })
    );
    // Head-of-line: nothing behind the failed head was attempted
    assert_eq!(fixture.transport.bodies(), vec!["a=1"]);
    assert_eq!(fixture.queue.front().as_deref(), Some("a=1"));

    let health = fixture.health.snapshot();
    assert_eq!(health.status_code, 503);
    assert_eq!(health.error_message, "server busy");
}

#[tokio::test]
async fn retry_delay_grows_and_resets_after_success() {
    let fixture = Fixture::developer(ScriptedTransport::with_script([
        retryable(500),
        retryable(500),
    ]));
    fixture.enqueue(&["a=1"]);
    let dispatcher = fixture.dispatcher();

    let first = dispatcher.drain_once().await;
    let second = dispatcher.drain_once().await;
    let retry_after = |report: &telestash_core::DrainReport| match report.blocked {
        Some(Blocked::Retry { retry_after, .. }) => retry_after,
        ref other => panic!("expected a retry, got {other:?}"),
    };
    assert_eq!(retry_after(&first), INITIAL_BACKOFF);
    assert_eq!(retry_after(&second), INITIAL_BACKOFF * 2);

    // Script exhausted: the third attempt succeeds
    let third = dispatcher.drain_once().await;
    assert_eq!(third.delivered, 1);

    fixture.enqueue(&["b=2"]);
    fixture
        .transport
        .script
        .lock()
        .unwrap()
        .push_back(retryable(500));
    let fourth = dispatcher.drain_once().await;
    assert_eq!(retry_after(&fourth), INITIAL_BACKOFF);
}

#[tokio::test]
async fn fatal_failure_drops_head_and_continues() {
    let fixture = Fixture::developer(ScriptedTransport::with_script([fatal(400)]));
    fixture.enqueue(&["bad=1", "good=2"]);

    let report = fixture.dispatcher().drain_once().await;

    assert_eq!(report.dropped, 1);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.remaining, 0);
    assert_eq!(fixture.transport.bodies(), vec!["bad=1", "good=2"]);
    assert_eq!(fixture.health.snapshot().status_code, 400);
}

#[tokio::test]
async fn temporary_head_blocks_without_sending() {
    let fixture = Fixture::new(
        IdentityConfig {
            device_id: None,
            temporary_id_mode: true,
        },
        ScriptedTransport::default(),
    );
    let temp = format!("a=1&device_id={TEMPORARY_DEVICE_ID}");
    fixture.enqueue(&[&temp, "b=2&device_id=other"]);

    let report = fixture.dispatcher().drain_once().await;

    assert_eq!(report.blocked, Some(Blocked::TemporaryId));
    assert_eq!(report.remaining, 2);
    assert!(fixture.transport.bodies().is_empty());
}

#[tokio::test]
async fn resolving_identity_unblocks_rewritten_requests() {
    let fixture = Fixture::new(
        IdentityConfig {
            device_id: None,
            temporary_id_mode: true,
        },
        ScriptedTransport::default(),
    );
    let temp = format!("a=1&device_id={TEMPORARY_DEVICE_ID}");
    fixture.enqueue(&[&temp]);
    let dispatcher = fixture.dispatcher();
    assert_eq!(
        dispatcher.drain_once().await.blocked,
        Some(Blocked::TemporaryId)
    );

    fixture
        .identity
        .exit_temporary_mode(DeviceIdType::DeveloperSupplied, "real")
        .unwrap();
    let report = dispatcher.drain_once().await;

    assert_eq!(report.delivered, 1);
    assert_eq!(fixture.transport.bodies(), vec!["a=1&device_id=real"]);
}

#[tokio::test]
async fn stale_temporary_requests_are_healed_before_sending() {
    let fixture = Fixture::developer(ScriptedTransport::default());
    // Left behind by a crash between the identity write and the rewrite
    let stale = format!("a=1&device_id={TEMPORARY_DEVICE_ID}");
    fixture.enqueue(&[&stale, "b=2"]);

    let report = fixture.dispatcher().drain_once().await;

    assert_eq!(report.delivered, 2);
    assert_eq!(
        fixture.transport.bodies(),
        vec!["a=1&device_id=dev-1".to_string(), "b=2".to_string()]
    );
}

#[tokio::test]
async fn checksum_is_added_to_sent_body_only() {
    let fixture = Fixture::developer(ScriptedTransport::with_script([retryable(500)]));
    fixture.enqueue(&["a=1"]);
    let dispatcher = fixture.dispatcher().with_salt(Some("pepper".to_string()));

    dispatcher.drain_once().await;

    let sent = fixture.transport.bodies();
    assert_eq!(sent, vec![append_checksum("a=1", "pepper")]);
    assert!(field_value(&sent[0], "checksum256").is_some());
    assert_eq!(fixture.queue.front().as_deref(), Some("a=1"));
}

#[tokio::test]
async fn header_overrides_win_over_static_headers() {
    let fixture = Fixture::developer(ScriptedTransport::default());
    fixture.enqueue(&["a=1", "b=2"]);
    let static_headers = BTreeMap::from([
        ("X-App".to_string(), "static".to_string()),
        ("X-Keep".to_string(), "kept".to_string()),
    ]);
    let dispatcher = fixture.dispatcher().with_headers(static_headers);
    dispatcher.set_header_override("X-App", "override");

    dispatcher.drain_once().await;

    let headers = fixture.transport.last_headers().unwrap();
    assert_eq!(headers.get("X-App").map(String::as_str), Some("override"));
    assert_eq!(headers.get("X-Keep").map(String::as_str), Some("kept"));

    dispatcher.remove_header_override("X-App");
    assert_eq!(
        dispatcher.headers().get("X-App").map(String::as_str),
        Some("static")
    );
}

#[tokio::test]
async fn stop_request_ends_cycle_before_next_send() {
    let fixture = Fixture::developer(ScriptedTransport::default());
    fixture.enqueue(&["a=1", "b=2"]);

    let report = fixture.dispatcher().drain_until(|| true).await;

    assert_eq!(report.blocked, Some(Blocked::Stopped));
    assert_eq!(report.remaining, 2);
    assert!(fixture.transport.bodies().is_empty());
}

#[tokio::test]
async fn background_loop_drains_and_stops_twice() {
    let fixture = Fixture::developer(ScriptedTransport::default());
    fixture.enqueue(&["a=1"]);
    let handle = DispatcherHandle::spawn(Arc::new(fixture.dispatcher()), Duration::from_secs(60));

    // First cycle runs immediately on spawn
    for _ in 0..50 {
        if fixture.queue.request_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(fixture.queue.request_count(), 0);

    fixture.enqueue(&["b=2"]);
    handle.wake();
    for _ in 0..50 {
        if fixture.queue.request_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(fixture.transport.bodies(), vec!["a=1", "b=2"]);

    handle.stop().await;
    handle.stop().await;
}
