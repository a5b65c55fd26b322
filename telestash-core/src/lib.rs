//! # telestash-core
//!
//! Core library for telestash - an offline-first telemetry buffer.
//!
//! This library provides:
//! - A durable, bounded request queue and event buffer over SQLite
//! - Device identity with temporary-ID mode and queued-request rewriting
//! - Event flushing and sequential delivery with retry and backoff
//! - Session timing and crash reports queued alongside events
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Architecture
//!
//! Data flows through three stages:
//! - **Buffer:** events accumulate in the pending-event buffer
//! - **Queue:** a flush turns the buffer into one serialized request
//! - **Delivery:** the dispatcher sends the queue head until it is empty or
//!   the head cannot be sent yet
//!
//! ## Example
//!
//! ```rust,no_run
//! use telestash_core::{Config, Event, Telemetry};
//!
//! # async fn run() -> telestash_core::Result<()> {
//! let config = Config::load()?;
//! let telemetry = Telemetry::open(config)?;
//!
//! telemetry.record_event(Event::builder("app_start").build()?);
//! telemetry.flush();
//! let report = telemetry.drain().await;
//! println!("delivered {}", report.delivered);
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use context::Telemetry;
pub use crash::CrashReport;
pub use db::{Database, KeyValueStore};
pub use dispatcher::{Blocked, DrainReport, RequestDispatcher};
pub use error::{Error, Result};
pub use event::{Event, Moment, SegmentValue};
pub use identity::{DeviceIdType, DeviceIdentity, IdentityChange, TEMPORARY_DEVICE_ID};
pub use queue::QueueStore;
pub use transport::{DeliveryError, HttpTransport, Transport};

// Public modules
pub mod config;
pub mod context;
pub mod crash;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod flusher;
pub mod health;
pub mod identity;
pub mod logging;
pub mod queue;
pub mod request;
pub mod session;
pub mod transport;
