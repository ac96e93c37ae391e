#![forbid(unsafe_code)]

//! SQLite-backed annotation catalog and occurrence graph index.

mod config;
mod locks;
mod store;

pub use config::{
    ENV_BUSY_TIMEOUT_MS, ENV_GROUPING, ENV_LOCK_WAIT_MS, ENV_STORAGE_DIR, GroupingKey, IndexConfig,
};
pub use locks::{TagsetLockGuard, TagsetLocks};
pub use store::*;
