//! Shared pieces of the `botlink-daemon` and `botlink` binaries.

pub mod config;
pub mod forward;
pub mod snapshot;

pub use config::{ConfigError, DaemonConfig};
pub use snapshot::FileSource;
