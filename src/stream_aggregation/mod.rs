mod dedup;
mod deduplicator;
mod labels;
mod series_key;
mod sink;
mod tie_break;

#[cfg(test)]
mod dedup_tests;

use std::sync::Arc;

use crate::common::types::{Sample, TimeSeries};

pub(crate) use dedup::DedupAggr;
pub use deduplicator::{Deduplicator, DeduplicatorState};
pub use labels::normalize_labels;
pub use series_key::{fingerprint, series_identity};
pub use tie_break::TieBreak;

/// Receives the surviving series of every non-empty flush.
///
/// Called from the flush loop thread, never while a shard lock is held. Errors inside the
/// callback are its own business: the deduplicator neither observes nor retries them.
pub type PushFunc = Arc<dyn Fn(Vec<TimeSeries>) + Send + Sync>;

/// A sample on its way into the state table, tagged with its series identity.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PushSample<'a> {
    pub key: &'a [u8],
    pub fingerprint: u64,
    pub sample: Sample,
}
