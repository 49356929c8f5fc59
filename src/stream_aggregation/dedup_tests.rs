use std::collections::HashMap;
use std::mem::size_of;
use std::sync::Arc;
use std::thread;

use rand::Rng;

use crate::common::types::Sample;
use crate::stream_aggregation::dedup::{DedupAggr, PerShardSamples};
use crate::stream_aggregation::series_key::fingerprint;
use crate::stream_aggregation::{PushSample, TieBreak};

fn make_keys(count: usize) -> Vec<(Vec<u8>, u64)> {
    (0..count)
        .map(|j| {
            let key = format!("key_{j}").into_bytes();
            let fp = fingerprint(&key);
            (key, fp)
        })
        .collect()
}

fn push_samples<'a>(keys: &'a [(Vec<u8>, u64)], value: impl Fn(usize) -> f64) -> Vec<PushSample<'a>> {
    keys.iter()
        .enumerate()
        .map(|(j, (key, fp))| PushSample {
            key,
            fingerprint: *fp,
            sample: Sample::new(0, value(j)),
        })
        .collect()
}

fn detach_to_map(da: &DedupAggr) -> HashMap<Vec<u8>, Sample> {
    da.detach()
        .into_samples()
        .map(|s| (s.key.into_vec(), s.sample))
        .collect()
}

#[test]
fn test_dedup_aggr_serial() {
    const SERIES_COUNT: usize = 10_000;
    let da = DedupAggr::new(TieBreak::Last);
    let keys = make_keys(SERIES_COUNT);

    let mut expected_samples_map = HashMap::new();
    for i in 0..2 {
        let samples = push_samples(&keys, |j| (i + j) as f64);
        for ps in samples.iter() {
            expected_samples_map.insert(ps.key.to_vec(), ps.sample);
        }
        da.push_samples(&samples);
    }

    if da.size_bytes() > 1_000_000 {
        panic!("too big dedupAggr state before flush: {} bytes; it shouldn't exceed 1_000_000 bytes", da.size_bytes());
    }
    assert_eq!(da.items_count(), SERIES_COUNT as u64, "unexpected itemsCount");

    let flushed_samples_map = detach_to_map(&da);
    assert_eq!(flushed_samples_map, expected_samples_map);

    assert_eq!(da.size_bytes(), size_of::<DedupAggr>() as u64, "state must be empty after flush");
    assert_eq!(da.items_count(), 0, "unexpected non-zero itemsCount after flush");
}

#[test]
fn test_dedup_aggr_concurrent() {
    const CONCURRENCY: usize = 5;
    const SERIES_COUNT: usize = 10_000;
    let da = Arc::new(DedupAggr::new(TieBreak::Last));
    let keys = Arc::new(make_keys(SERIES_COUNT));

    let mut handles = Vec::new();
    for _ in 0..CONCURRENCY {
        let da = da.clone();
        let keys = keys.clone();
        let handle = thread::spawn(move || {
            for i in 0..10 {
                let samples = push_samples(&keys, |j| (i + j) as f64);
                da.push_samples(&samples);
            }
        });
        handles.push(handle);
    }

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(da.items_count(), SERIES_COUNT as u64);
    let flushed = detach_to_map(&da);
    assert_eq!(flushed.len(), SERIES_COUNT);
    for (j, (key, _)) in keys.iter().enumerate() {
        // any producer's last write may win, but it must be one of the values written
        let value = flushed[key].value;
        let i = value - j as f64;
        assert!((0.0..10.0).contains(&i), "unexpected value {value} for {j}");
    }
}

#[test]
fn test_last_write_wins_regardless_of_timestamp() {
    let da = DedupAggr::new(TieBreak::Last);
    let keys = make_keys(1);
    let (key, fp) = &keys[0];
    let samples = [
        PushSample { key, fingerprint: *fp, sample: Sample::new(300, 1.0) },
        PushSample { key, fingerprint: *fp, sample: Sample::new(100, 2.0) },
        PushSample { key, fingerprint: *fp, sample: Sample::new(200, 3.0) },
    ];
    da.push_samples(&samples);
    let flushed = detach_to_map(&da);
    assert_eq!(flushed[key], Sample::new(200, 3.0));
}

#[test]
fn test_newest_tie_break() {
    let da = DedupAggr::new(TieBreak::Newest);
    let keys = make_keys(1);
    let (key, fp) = &keys[0];
    let samples = [
        PushSample { key, fingerprint: *fp, sample: Sample::new(300, 1.0) },
        PushSample { key, fingerprint: *fp, sample: Sample::new(100, 2.0) },
        PushSample { key, fingerprint: *fp, sample: Sample::new(300, 0.5) },
    ];
    da.push_samples(&samples);
    let flushed = detach_to_map(&da);
    assert_eq!(flushed[key], Sample::new(300, 1.0));
}

#[test]
fn test_fingerprint_collisions_are_kept_apart() {
    let da = DedupAggr::new(TieBreak::Last);
    let a = b"series_a".to_vec();
    let b = b"series_b".to_vec();
    // force both identities onto one fingerprint
    let fp = 42;
    let samples = [
        PushSample { key: &a, fingerprint: fp, sample: Sample::new(1, 1.0) },
        PushSample { key: &b, fingerprint: fp, sample: Sample::new(1, 2.0) },
        PushSample { key: &a, fingerprint: fp, sample: Sample::new(2, 3.0) },
        PushSample { key: &b, fingerprint: fp, sample: Sample::new(2, 4.0) },
    ];
    da.push_samples(&samples);
    assert_eq!(da.items_count(), 2);

    let flushed = detach_to_map(&da);
    assert_eq!(flushed.len(), 2);
    assert_eq!(flushed[&a], Sample::new(2, 3.0));
    assert_eq!(flushed[&b], Sample::new(2, 4.0));
}

#[test]
fn test_detach_isolates_windows() {
    let da = DedupAggr::with_shards(TieBreak::Last, 4);
    let keys = make_keys(100);

    da.push_samples(&push_samples(&keys, |_| 1.0));
    let first = da.detach();
    da.push_samples(&push_samples(&keys[..10], |_| 2.0));

    assert_eq!(first.items_count(), 100);
    assert!(first.into_samples().all(|s| s.sample.value == 1.0));

    let second = detach_to_map(&da);
    assert_eq!(second.len(), 10);
    assert!(second.values().all(|s| s.value == 2.0));
    assert!(da.detach().is_empty());
}

#[test]
fn test_random_pushes_match_last_write_model() {
    let mut rng = rand::thread_rng();
    let da = DedupAggr::with_shards(TieBreak::Last, 8);
    let keys = make_keys(50);

    let mut model: HashMap<Vec<u8>, Sample> = HashMap::new();
    for _ in 0..20 {
        let batch: Vec<PushSample> = (0..200)
            .map(|_| {
                let (key, fp) = &keys[rng.gen_range(0..keys.len())];
                let sample = Sample::new(rng.gen_range(0..1_000), rng.gen::<f64>());
                PushSample { key, fingerprint: *fp, sample }
            })
            .collect();
        for ps in batch.iter() {
            model.insert(ps.key.to_vec(), ps.sample);
        }
        da.push_samples(&batch);
    }

    assert_eq!(da.items_count(), model.len() as u64);
    assert_eq!(detach_to_map(&da), model);
}

#[test]
fn test_per_shard_scratch_is_reusable() {
    let da = DedupAggr::with_shards(TieBreak::Last, 16);
    let keys = make_keys(1_000);
    let mut per_shard = PerShardSamples::default();

    da.push_samples_with(&push_samples(&keys, |_| 1.0), &mut per_shard);
    da.push_samples_with(&push_samples(&keys[..100], |_| 2.0), &mut per_shard);
    per_shard.shrink(4);
    assert!(per_shard.capacity() <= 16 * 4);
    da.push_samples_with(&push_samples(&keys[..10], |_| 3.0), &mut per_shard);

    let flushed = detach_to_map(&da);
    assert_eq!(flushed.len(), keys.len());
    for (j, (key, _)) in keys.iter().enumerate() {
        let expected = match j {
            0..=9 => 3.0,
            10..=99 => 2.0,
            _ => 1.0,
        };
        assert_eq!(flushed[key].value, expected);
    }
}
