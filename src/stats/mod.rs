//! Statistics and metrics for stream sessions

pub mod metrics;

pub use metrics::{SessionStats, StatsSnapshot};
