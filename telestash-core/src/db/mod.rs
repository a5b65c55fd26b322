//! Durable storage layer for telestash
//!
//! This module provides the key-value persistence primitive the queues and
//! identity are built on:
//! - SQLite-backed store with schema migrations
//! - `KeyValueStore` trait so callers can supply their own backend

pub mod kv;
pub mod schema;

pub use kv::{Database, KeyValueStore};
