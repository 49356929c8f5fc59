use integer_encoding::VarInt;
use xxhash_rust::xxh3::xxh3_64;

use crate::common::types::Label;
use crate::error::{DedupError, DedupResult};

/// Appends the canonical identity of a series to `dst`.
///
/// The metric name comes first, followed by name/value pairs. Each string is preceded by its
/// length in varint encoding, so distinct identities never share an encoding. `labels` must be
/// sorted by name.
pub(crate) fn marshal_series_key(dst: &mut Vec<u8>, metric_name: &str, labels: &[&Label]) {
    marshal_string(dst, metric_name);
    for label in labels {
        marshal_string(dst, &label.name);
        marshal_string(dst, &label.value);
    }
}

#[inline]
fn marshal_string(dst: &mut Vec<u8>, s: &str) {
    let mut buf = [0u8; 10];
    let n = (s.len() as u64).encode_var(&mut buf);
    dst.extend_from_slice(&buf[..n]);
    dst.extend_from_slice(s.as_bytes());
}

/// Decodes a key produced by `marshal_series_key` into the metric name and its labels.
pub(crate) fn unmarshal_series_key(src: &[u8]) -> DedupResult<(String, Vec<Label>)> {
    let (metric_name, mut tail) = unmarshal_string(src)?;
    let mut labels = Vec::new();
    while !tail.is_empty() {
        let (name, rest) = unmarshal_string(tail)?;
        let (value, rest) = unmarshal_string(rest)?;
        labels.push(Label::new(name, value));
        tail = rest;
    }
    Ok((metric_name.to_string(), labels))
}

fn unmarshal_string(src: &[u8]) -> DedupResult<(&str, &[u8])> {
    let (len, n) = u64::decode_var(src).ok_or_else(|| {
        DedupError::CorruptSeriesKey("cannot unmarshal string length from uvarint".to_string())
    })?;
    let tail = &src[n..];
    let len = len as usize;
    if tail.len() < len {
        return Err(DedupError::CorruptSeriesKey(format!(
            "string length {len} exceeds remaining {} bytes",
            tail.len()
        )));
    }
    let s = std::str::from_utf8(&tail[..len])
        .map_err(|e| DedupError::CorruptSeriesKey(e.to_string()))?;
    Ok((s, &tail[len..]))
}

/// Fixed width hash of a canonical series key. Stable for the life of the process.
#[inline]
pub fn fingerprint(key: &[u8]) -> u64 {
    xxh3_64(key)
}

/// Returns the canonical key and fingerprint for a series whose labels are already normalized.
pub fn series_identity(metric_name: &str, labels: &[Label]) -> (Vec<u8>, u64) {
    let mut refs: Vec<&Label> = labels.iter().collect();
    super::labels::sort_labels(&mut refs);
    let mut key = Vec::new();
    marshal_series_key(&mut key, metric_name, &refs);
    let fp = fingerprint(&key);
    (key, fp)
}
