//! zmigrate: ZFS snapshot replication and migration daemon.
//!
//! A bounded worker pool drains a FIFO queue of migration tasks. Each task
//! pipes `zfs send` into a local `zfs receive` or a remote daemon's data
//! socket, tracks progress, and retains one sync-point marker per
//! dataset/destination pair for incremental chains. Remote transfers are
//! authorized by single-use (or resumable) transfer tokens.

pub mod api;
pub mod config;
pub mod error;
pub mod migrate;
pub mod store;
pub mod syncpoint;
pub mod task;
pub mod token;
pub mod transport;
pub mod zfs;

pub use config::Config;
pub use error::{Result, ZmigrateError};
