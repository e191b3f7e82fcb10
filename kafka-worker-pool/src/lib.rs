//! Concurrent partitioned Kafka consumption.
//!
//! Records are fetched by a single feeder, dispatched to a fixed pool of
//! workers and committed only once every lower offset of the same partition
//! has been processed.
//!
//! ## Error logging (anyhow)
//!
//! Message handlers return `anyhow::Result`. Log their errors so the cause
//! chain stays visible:
//!
//! - **Inline format:** `{e:#}` for the full chain on one line.
//! - **Structured field:** `error = ?e` for the chain with `Caused by:` sections.
//!
//! Build handler errors with `.context()` / `.with_context()` so the source
//! error is kept.

pub mod config;
pub mod error;
pub mod kafka;

pub use config::Config;
pub use error::{ConfigError, ConsumerError, ProduceError};
