//! Ingestion-time deduplication of time series samples.
//!
//! A [`Deduplicator`] accepts batches of series, collapses samples sharing a series identity
//! (metric name plus labels, minus a configured set of dropped label names) into a single sample
//! per flush window, and hands the survivors to a caller supplied push function once per window.

mod common;
mod config;
mod error;
mod stream_aggregation;

pub use common::{current_time_millis, Label, Sample, TimeSeries, Timestamp};
pub use config::{DedupConfig, DEFAULT_ALIAS, DEFAULT_DEDUP_INTERVAL};
pub use error::{DedupError, DedupResult};
pub use stream_aggregation::{
    fingerprint, normalize_labels, series_identity, Deduplicator, DeduplicatorState, PushFunc,
    TieBreak,
};
