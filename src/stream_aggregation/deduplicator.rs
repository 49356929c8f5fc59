use std::fmt::Display;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use tracing::{debug, error, info, warn};

use crate::common::current_time_millis;
use crate::common::types::{Label, Sample, TimeSeries, Timestamp};
use crate::config::DedupConfig;
use crate::error::{DedupError, DedupResult};
use crate::stream_aggregation::dedup::{DedupAggr, PerShardSamples, DEDUP_AGGR_SHARDS_COUNT};
use crate::stream_aggregation::labels::{
    drop_series_labels, sort_and_remove_duplicates, sort_labels, validate_series,
};
use crate::stream_aggregation::series_key::{fingerprint, marshal_series_key};
use crate::stream_aggregation::sink::DedupSink;
use crate::stream_aggregation::{PushFunc, PushSample};

/// Lifecycle of a `Deduplicator`. There is no way back from `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeduplicatorState {
    Created = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl DeduplicatorState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => DeduplicatorState::Created,
            1 => DeduplicatorState::Running,
            2 => DeduplicatorState::Stopping,
            _ => DeduplicatorState::Stopped,
        }
    }
}

impl Display for DeduplicatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeduplicatorState::Created => write!(f, "created"),
            DeduplicatorState::Running => write!(f, "running"),
            DeduplicatorState::Stopping => write!(f, "stopping"),
            DeduplicatorState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Control messages sent to the flush loop
enum FlushMessage {
    Flush(mpsc::SyncSender<usize>),
    Stop,
}

struct FlushLoop {
    sender: mpsc::Sender<FlushMessage>,
    handle: JoinHandle<()>,
}

struct DedupMetrics {
    pushed_samples: Counter,
    rejected_samples: Counter,
    corrupt_series_keys: Counter,
    flushed_series: Counter,
    flush_duration: Histogram,
    flush_timeouts: Counter,
    items_count: Gauge,
}

impl DedupMetrics {
    fn new(alias: &str) -> Self {
        Self {
            pushed_samples: counter!("dedup_pushed_samples_total", "name" => alias.to_string()),
            rejected_samples: counter!("dedup_rejected_samples_total", "name" => alias.to_string()),
            corrupt_series_keys: counter!("dedup_corrupt_series_keys_total", "name" => alias.to_string()),
            flushed_series: counter!("dedup_flushed_series_total", "name" => alias.to_string()),
            flush_duration: histogram!("dedup_flush_duration_seconds", "name" => alias.to_string()),
            flush_timeouts: counter!("dedup_flush_timeouts_total", "name" => alias.to_string()),
            items_count: gauge!("dedup_items_count", "name" => alias.to_string()),
        }
    }
}

/// Reusable scratch space for `Deduplicator::push`.
#[derive(Default)]
struct DeduplicatorPushCtx {
    buf: Vec<u8>,
    pending: Vec<PendingSample>,
    per_shard: PerShardSamples,
}

impl DeduplicatorPushCtx {
    /// Clears the context. Capacity beyond the pooling limits is released, so one huge batch
    /// does not pin its buffers for the life of the pool.
    fn reset(&mut self) {
        self.buf.clear();
        self.buf.shrink_to(MAX_POOLED_BUF_BYTES);
        self.pending.clear();
        self.pending.shrink_to(MAX_POOLED_PENDING_SAMPLES);
        self.per_shard
            .shrink(MAX_POOLED_PENDING_SAMPLES / DEDUP_AGGR_SHARDS_COUNT);
    }
}

/// A sample whose key lives in `DeduplicatorPushCtx::buf[key_start..key_end]`.
struct PendingSample {
    fingerprint: u64,
    key_start: usize,
    key_end: usize,
    sample: Sample,
}

const MAX_POOLED_PUSH_CTX: usize = 64;
const MAX_POOLED_BUF_BYTES: usize = 64 * 1024;
const MAX_POOLED_PENDING_SAMPLES: usize = 4 * 1024;

struct DeduplicatorInner {
    da: DedupAggr,
    sink: DedupSink,
    drop_labels: Vec<String>,
    dedup_interval: Duration,
    alias: String,
    state: AtomicU8,
    last_flush_timestamp: AtomicI64,
    push_ctx_pool: Mutex<Vec<DeduplicatorPushCtx>>,
    metrics: DedupMetrics,
}

/// Collapses duplicate samples into one per series identity and flush window.
///
/// Samples go in through `push`. Every `dedup_interval` a background thread detaches the
/// accumulated generation and hands one sample per identity to `push_func`. Within a window the
/// surviving sample is chosen by the configured `TieBreak`; by default the sample processed last
/// wins, whatever its timestamp.
pub struct Deduplicator {
    inner: Arc<DeduplicatorInner>,
    flush_loop: Mutex<Option<FlushLoop>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Like `lock`, but gives up instead of waiting for another holder.
fn try_lock<T>(m: &Mutex<T>) -> Option<MutexGuard<'_, T>> {
    match m.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(err)) => Some(err.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

impl Deduplicator {
    /// Creates a deduplicator and starts its flush loop.
    ///
    /// Series which only differ by the labels in `drop_labels` are treated as duplicates.
    /// `alias` names the instance in logs and metrics.
    pub fn new<S: Into<String>>(
        push_func: PushFunc,
        keep_metric_names: bool,
        dedup_interval: Duration,
        drop_labels: Vec<String>,
        alias: S,
    ) -> DedupResult<Self> {
        let config = DedupConfig::new(dedup_interval)
            .with_keep_metric_names(keep_metric_names)
            .with_drop_labels(drop_labels)
            .with_alias(alias);
        Self::with_config(push_func, config)
    }

    pub fn with_config(push_func: PushFunc, config: DedupConfig) -> DedupResult<Self> {
        config.validate()?;

        let DedupConfig {
            dedup_interval,
            drop_labels,
            keep_metric_names,
            tie_break,
            alias,
        } = config;

        let inner = Arc::new(DeduplicatorInner {
            da: DedupAggr::new(tie_break),
            sink: DedupSink::new(push_func, keep_metric_names, &alias),
            drop_labels: sort_and_remove_duplicates(&drop_labels),
            dedup_interval,
            metrics: DedupMetrics::new(&alias),
            alias,
            state: AtomicU8::new(DeduplicatorState::Created as u8),
            last_flush_timestamp: AtomicI64::new(0),
            push_ctx_pool: Mutex::new(Vec::new()),
        });

        let (sender, receiver) = mpsc::channel();
        let loop_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name(format!("dedup-flush-{}", inner.alias))
            .spawn(move || loop_inner.run_flush_loop(receiver))
            .map_err(|e| DedupError::FlushLoopStart(e.to_string()))?;

        inner.set_state(DeduplicatorState::Running);

        Ok(Self {
            inner,
            flush_loop: Mutex::new(Some(FlushLoop { sender, handle })),
        })
    }

    pub fn alias(&self) -> &str {
        &self.inner.alias
    }

    pub fn dedup_interval(&self) -> Duration {
        self.inner.dedup_interval
    }

    /// The configured drop labels, sorted and deduplicated.
    pub fn drop_labels(&self) -> &[String] {
        &self.inner.drop_labels
    }

    pub fn state(&self) -> DeduplicatorState {
        self.inner.state()
    }

    /// Number of distinct series in the open window.
    pub fn items_count(&self) -> u64 {
        self.inner.da.items_count()
    }

    /// Approximate memory held by the open window.
    pub fn size_bytes(&self) -> u64 {
        self.inner.da.size_bytes()
    }

    /// Time of the most recent flush which emitted anything.
    pub fn last_flush_timestamp(&self) -> Option<Timestamp> {
        match self.inner.last_flush_timestamp.load(Ordering::Relaxed) {
            0 => None,
            ts => Some(ts),
        }
    }

    /// Adds the samples of `tss` to the open window.
    ///
    /// Samples are applied in input order. A series with an empty metric name or duplicate label
    /// names is skipped and logged; the rest of the batch is still processed. Must not be called
    /// after `stop`.
    pub fn push(&self, tss: &[TimeSeries]) {
        let inner = &self.inner;
        let state = inner.state();
        if !matches!(state, DeduplicatorState::Running | DeduplicatorState::Stopping) {
            warn!(
                alias = %inner.alias,
                %state,
                series = tss.len(),
                "push called on a deduplicator which isn't running; dropping samples"
            );
            return;
        }

        let mut ctx = inner.get_push_ctx();
        let mut labels: Vec<&Label> = Vec::new();
        let mut rejected = 0usize;

        for ts in tss {
            if ts.samples.is_empty() {
                continue;
            }
            labels.clear();
            drop_series_labels(&mut labels, &ts.labels, &inner.drop_labels);
            sort_labels(&mut labels);
            if let Err(err) = validate_series(&ts.metric_name, &labels) {
                rejected += ts.samples.len();
                warn!(alias = %inner.alias, %err, "skipping malformed series");
                continue;
            }

            let key_start = ctx.buf.len();
            marshal_series_key(&mut ctx.buf, &ts.metric_name, &labels);
            let key_end = ctx.buf.len();
            let fp = fingerprint(&ctx.buf[key_start..key_end]);
            for sample in &ts.samples {
                ctx.pending.push(PendingSample {
                    fingerprint: fp,
                    key_start,
                    key_end,
                    sample: *sample,
                });
            }
        }

        let samples: Vec<PushSample<'_>> = ctx
            .pending
            .iter()
            .map(|p| PushSample {
                key: &ctx.buf[p.key_start..p.key_end],
                fingerprint: p.fingerprint,
                sample: p.sample,
            })
            .collect();
        inner.da.push_samples_with(&samples, &mut ctx.per_shard);

        inner.metrics.pushed_samples.increment(samples.len() as u64);
        if rejected > 0 {
            inner.metrics.rejected_samples.increment(rejected as u64);
        }

        drop(samples);
        inner.put_push_ctx(ctx);
    }

    /// Flushes the open window right away and returns the number of series handed to the sink.
    ///
    /// The request is served by the flush loop, so it never overlaps a scheduled flush: whichever
    /// runs second sees an empty window and emits nothing. Must not be called from `push_func`.
    pub fn flush(&self) -> DedupResult<usize> {
        let sender = {
            let flush_loop = lock(&self.flush_loop);
            match flush_loop.as_ref() {
                Some(fl) => fl.sender.clone(),
                None => return Err(DedupError::Stopped),
            }
        };
        let (done_tx, done_rx) = mpsc::sync_channel(1);
        sender
            .send(FlushMessage::Flush(done_tx))
            .map_err(|_| DedupError::Stopped)?;
        done_rx.recv().map_err(|_| DedupError::Stopped)
    }

    /// Stops the flush loop after a final flush of everything pushed so far. Blocks until the
    /// loop has exited. Calling it again is a no-op.
    pub fn stop(&self) {
        let Some(flush_loop) = lock(&self.flush_loop).take() else {
            return;
        };
        let inner = &self.inner;
        inner.set_state(DeduplicatorState::Stopping);

        // the loop only exits on Stop or disconnect, both of which end in a final flush
        let _ = flush_loop.sender.send(FlushMessage::Stop);
        if flush_loop.handle.join().is_err() {
            error!(alias = %inner.alias, "deduplicator flush loop panicked");
        }
        inner.set_state(DeduplicatorState::Stopped);
    }
}

impl Drop for Deduplicator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl DeduplicatorInner {
    fn state(&self) -> DeduplicatorState {
        DeduplicatorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: DeduplicatorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    // a contended pool is skipped rather than waited on; producers only share the shard locks
    fn get_push_ctx(&self) -> DeduplicatorPushCtx {
        try_lock(&self.push_ctx_pool)
            .and_then(|mut pool| pool.pop())
            .unwrap_or_default()
    }

    fn put_push_ctx(&self, mut ctx: DeduplicatorPushCtx) {
        ctx.reset();
        if let Some(mut pool) = try_lock(&self.push_ctx_pool) {
            if pool.len() < MAX_POOLED_PUSH_CTX {
                pool.push(ctx);
            }
        }
    }

    fn run_flush_loop(&self, receiver: mpsc::Receiver<FlushMessage>) {
        info!(
            alias = %self.alias,
            interval = ?self.dedup_interval,
            "deduplicator flush loop started"
        );
        let interval = self.dedup_interval;
        // None when the interval is too long to schedule; flushes then only happen on request
        let mut next_flush = Instant::now().checked_add(interval);
        loop {
            let message = match next_flush {
                Some(deadline) => {
                    receiver.recv_timeout(deadline.saturating_duration_since(Instant::now()))
                }
                None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match message {
                Ok(FlushMessage::Flush(done)) => {
                    let n = self.flush();
                    // the requester may have given up waiting
                    let _ = done.send(n);
                }
                Ok(FlushMessage::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    self.flush();
                    let now = Instant::now();
                    // missed ticks are skipped rather than flushed back to back
                    next_flush = next_flush
                        .and_then(|deadline| deadline.checked_add(interval))
                        .filter(|deadline| *deadline > now)
                        .or_else(|| now.checked_add(interval));
                }
            }
        }
        let n = self.flush();
        info!(alias = %self.alias, series = n, "deduplicator flush loop stopped");
    }

    /// Detaches the open generation and pushes it to the sink. Returns the number of series
    /// pushed.
    fn flush(&self) -> usize {
        let start = Instant::now();
        let generation = self.da.detach();
        self.metrics.items_count.set(generation.items_count() as f64);
        if generation.is_empty() {
            return 0;
        }
        let (tss, corrupt) = self.sink.series_from_generation(generation);
        let n = tss.len();
        if corrupt > 0 {
            self.metrics.corrupt_series_keys.increment(corrupt as u64);
        }
        if self.sink.push(tss) {
            self.metrics.flushed_series.increment(n as u64);
        }
        self.last_flush_timestamp
            .store(current_time_millis(), Ordering::Relaxed);

        let elapsed = start.elapsed();
        self.metrics.flush_duration.record(elapsed.as_secs_f64());
        if elapsed > self.dedup_interval {
            self.metrics.flush_timeouts.increment(1);
            warn!(
                alias = %self.alias,
                duration = ?elapsed,
                interval = ?self.dedup_interval,
                "deduplication flush took longer than the dedup interval; consider increasing it"
            );
        }
        debug!(alias = %self.alias, series = n, duration = ?elapsed, "flushed deduplicated series");
        n
    }
}
