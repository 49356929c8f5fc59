use std::collections::HashMap;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use ahash::RandomState;
use rayon::prelude::*;

use crate::common::types::Sample;
use crate::stream_aggregation::{PushSample, TieBreak};

pub(crate) const DEDUP_AGGR_SHARDS_COUNT: usize = 128;

type ShardMap = HashMap<u64, DedupAggrBucket, RandomState>;

/// Sharded fingerprint -> sample table holding the open generation.
///
/// Each shard has its own lock; a sample's shard is picked by the low bits of its fingerprint,
/// so writers touching different shards never contend.
pub(crate) struct DedupAggr {
    shards: Box<[DedupAggrShard]>,
    tie_break: TieBreak,
}

#[derive(Default)]
struct DedupAggrShard {
    state: Mutex<ShardMap>,
    size_bytes: AtomicU64,
    items_count: AtomicU64,
}

pub(crate) struct DedupAggrSample {
    pub key: Box<[u8]>,
    pub sample: Sample,
}

impl DedupAggrSample {
    fn size_bytes(&self) -> u64 {
        (self.key.len() + size_of::<Self>() + size_of::<u64>()) as u64
    }
}

/// All series stored under one fingerprint. Anything beyond `head` is a hash collision
/// between distinct identities; those are kept apart, never merged.
pub(crate) struct DedupAggrBucket {
    head: DedupAggrSample,
    collisions: Vec<DedupAggrSample>,
}

impl DedupAggrBucket {
    fn find_mut(&mut self, key: &[u8]) -> Option<&mut DedupAggrSample> {
        if *self.head.key == *key {
            return Some(&mut self.head);
        }
        self.collisions.iter_mut().find(|s| *s.key == *key)
    }

    fn len(&self) -> usize {
        1 + self.collisions.len()
    }
}

impl IntoIterator for DedupAggrBucket {
    type Item = DedupAggrSample;
    type IntoIter = std::iter::Chain<std::iter::Once<DedupAggrSample>, std::vec::IntoIter<DedupAggrSample>>;

    fn into_iter(self) -> Self::IntoIter {
        std::iter::once(self.head).chain(self.collisions)
    }
}

/// A generation detached from the table. It is owned by the flusher and no longer reachable
/// from `push_samples`.
pub(crate) struct DedupGeneration {
    shards: Vec<ShardMap>,
}

impl DedupGeneration {
    pub fn items_count(&self) -> usize {
        self.shards
            .iter()
            .map(|m| m.values().map(DedupAggrBucket::len).sum::<usize>())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|m| m.is_empty())
    }

    /// Drains every shard in parallel.
    pub fn into_par_samples(self) -> impl ParallelIterator<Item = DedupAggrSample> {
        self.shards
            .into_par_iter()
            .flat_map_iter(|m| m.into_values().flat_map(DedupAggrBucket::into_iter))
    }

    #[cfg(test)]
    pub fn into_samples(self) -> impl Iterator<Item = DedupAggrSample> {
        self.shards
            .into_iter()
            .flat_map(|m| m.into_values().flat_map(DedupAggrBucket::into_iter))
    }
}

/// Positions of a batch's samples grouped by shard. Reused across pushes.
#[derive(Default)]
pub(crate) struct PerShardSamples {
    shards: Vec<Vec<usize>>,
}

impl PerShardSamples {
    fn reset(&mut self, shards_count: usize) {
        self.shards.resize_with(shards_count, Vec::new);
        for indexes in &mut self.shards {
            indexes.clear();
        }
    }

    /// Clears every shard and releases capacity above `max_per_shard`.
    pub(crate) fn shrink(&mut self, max_per_shard: usize) {
        for indexes in &mut self.shards {
            indexes.clear();
            indexes.shrink_to(max_per_shard);
        }
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.shards.iter().map(Vec::capacity).sum()
    }
}

#[inline]
fn lock_shard(m: &Mutex<ShardMap>) -> MutexGuard<'_, ShardMap> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DedupAggr {
    pub fn new(tie_break: TieBreak) -> Self {
        Self::with_shards(tie_break, DEDUP_AGGR_SHARDS_COUNT)
    }

    pub(crate) fn with_shards(tie_break: TieBreak, shards_count: usize) -> Self {
        let shards = (0..shards_count.max(1))
            .map(|_| DedupAggrShard::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { shards, tie_break }
    }

    /// Approximate memory held by the open generation.
    pub fn size_bytes(&self) -> u64 {
        let mut n = size_of::<DedupAggr>() as u64;
        for shard in self.shards.iter() {
            n += shard.size_bytes.load(Ordering::Relaxed);
        }
        n
    }

    /// Number of distinct series in the open generation.
    pub fn items_count(&self) -> u64 {
        self.shards
            .iter()
            .map(|shard| shard.items_count.load(Ordering::Relaxed))
            .sum()
    }

    #[inline]
    fn shard_index(&self, fingerprint: u64) -> usize {
        (fingerprint % self.shards.len() as u64) as usize
    }

    #[cfg(test)]
    pub(crate) fn push_samples(&self, samples: &[PushSample<'_>]) {
        self.push_samples_with(samples, &mut PerShardSamples::default());
    }

    /// Upserts `samples` into the open generation, using `per_shard` as scratch space.
    ///
    /// Samples are grouped per shard first, so every shard lock is taken at most once per call.
    /// A given key always lands in the same shard, hence samples for one series are applied in
    /// the order they appear in `samples`.
    pub(crate) fn push_samples_with(
        &self,
        samples: &[PushSample<'_>],
        per_shard: &mut PerShardSamples,
    ) {
        if samples.is_empty() {
            return;
        }
        if self.shards.len() == 1 {
            self.shards[0].push_samples(samples.iter(), self.tie_break);
            return;
        }
        per_shard.reset(self.shards.len());
        for (i, ps) in samples.iter().enumerate() {
            per_shard.shards[self.shard_index(ps.fingerprint)].push(i);
        }
        for (shard, indexes) in self.shards.iter().zip(per_shard.shards.iter()) {
            if !indexes.is_empty() {
                shard.push_samples(indexes.iter().map(|&i| &samples[i]), self.tie_break);
            }
        }
    }

    /// Detaches the open generation, leaving an empty one in its place.
    ///
    /// Shards are swapped one at a time under their own lock. A push racing with detach lands
    /// either in the detached generation or in the new one, never in both.
    pub(crate) fn detach(&self) -> DedupGeneration {
        let shards = self
            .shards
            .iter()
            .map(|shard| {
                let mut state = lock_shard(&shard.state);
                let m = std::mem::take(&mut *state);
                shard.size_bytes.store(0, Ordering::Relaxed);
                shard.items_count.store(0, Ordering::Relaxed);
                m
            })
            .collect();
        DedupGeneration { shards }
    }
}

impl DedupAggrShard {
    fn push_samples<'a, 'b: 'a, I>(&self, samples: I, tie_break: TieBreak)
    where
        I: Iterator<Item = &'a PushSample<'b>>,
    {
        let mut state = lock_shard(&self.state);
        let mut added_items = 0u64;
        let mut added_bytes = 0u64;
        for ps in samples {
            match state.get_mut(&ps.fingerprint) {
                Some(bucket) => {
                    if let Some(stored) = bucket.find_mut(ps.key) {
                        if tie_break.should_replace(&stored.sample, &ps.sample) {
                            stored.sample = ps.sample;
                        }
                        continue;
                    }
                    let entry = DedupAggrSample {
                        key: ps.key.into(),
                        sample: ps.sample,
                    };
                    added_bytes += entry.size_bytes();
                    added_items += 1;
                    bucket.collisions.push(entry);
                }
                None => {
                    let entry = DedupAggrSample {
                        key: ps.key.into(),
                        sample: ps.sample,
                    };
                    added_bytes += entry.size_bytes();
                    added_items += 1;
                    state.insert(
                        ps.fingerprint,
                        DedupAggrBucket {
                            head: entry,
                            collisions: Vec::new(),
                        },
                    );
                }
            }
        }
        // counters are reset by detach under the same lock
        self.items_count.fetch_add(added_items, Ordering::Relaxed);
        self.size_bytes.fetch_add(added_bytes, Ordering::Relaxed);
    }
}
