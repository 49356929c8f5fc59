use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;
use tracing::error;

use crate::common::types::TimeSeries;
use crate::error::DedupResult;
use crate::stream_aggregation::dedup::{DedupAggrSample, DedupGeneration};
use crate::stream_aggregation::series_key::unmarshal_series_key;
use crate::stream_aggregation::PushFunc;

/// Turns a detached generation back into the batch shape `push_func` expects.
pub(crate) struct DedupSink {
    push_func: PushFunc,
    keep_metric_names: bool,
    alias: String,
    suffix: String,
}

impl DedupSink {
    pub fn new(push_func: PushFunc, keep_metric_names: bool, alias: &str) -> Self {
        Self {
            push_func,
            keep_metric_names,
            alias: alias.to_string(),
            suffix: format!(":{alias}_dedup"),
        }
    }

    /// Rebuilds one single-sample series per surviving entry, sorted by metric name then labels.
    ///
    /// Entries whose key cannot be decoded are logged and skipped; the second value is their count.
    pub fn series_from_generation(&self, generation: DedupGeneration) -> (Vec<TimeSeries>, usize) {
        let corrupt = AtomicUsize::new(0);
        let mut tss: Vec<TimeSeries> = generation
            .into_par_samples()
            .filter_map(|entry| match self.to_series(entry) {
                Ok(ts) => Some(ts),
                Err(err) => {
                    error!(alias = %self.alias, %err, "BUG: cannot decode deduplicated series key");
                    corrupt.fetch_add(1, Ordering::Relaxed);
                    None
                }
            })
            .collect();
        tss.par_sort_unstable_by(|a, b| {
            a.metric_name
                .cmp(&b.metric_name)
                .then_with(|| a.labels.cmp(&b.labels))
        });
        (tss, corrupt.into_inner())
    }

    fn to_series(&self, entry: DedupAggrSample) -> DedupResult<TimeSeries> {
        let (mut metric_name, labels) = unmarshal_series_key(&entry.key)?;
        if !self.keep_metric_names {
            metric_name.push_str(&self.suffix);
        }
        Ok(TimeSeries {
            metric_name,
            labels,
            samples: vec![entry.sample],
        })
    }

    /// Invokes `push_func` once with the whole batch. Empty batches are not pushed.
    ///
    /// A panic inside the callback is caught and logged so the flush loop survives it; false is
    /// returned in that case.
    pub fn push(&self, tss: Vec<TimeSeries>) -> bool {
        if tss.is_empty() {
            return true;
        }
        let push_func = &self.push_func;
        match catch_unwind(AssertUnwindSafe(|| push_func(tss))) {
            Ok(()) => true,
            Err(_) => {
                error!(alias = %self.alias, "push callback panicked; flushed series are lost");
                false
            }
        }
    }
}
