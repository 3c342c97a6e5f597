//! # ledgerchat-store
//!
//! Local durable storage for the ledgerchat client, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for the key-value
//! surface, the resolved-content cache and the local fallback index.

pub mod content_cache;
pub mod database;
pub mod kv;
pub mod migrations;
pub mod models;
pub mod session_state;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
