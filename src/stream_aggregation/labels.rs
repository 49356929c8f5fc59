use crate::common::types::Label;
use crate::error::{DedupError, DedupResult};

/// Returns `list` sorted and without duplicates, the form `drop_series_labels` expects.
pub(crate) fn sort_and_remove_duplicates(list: &[String]) -> Vec<String> {
    let mut sorted = list.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted
}

/// Appends to `dst` every label in `src` whose name isn't in `drop_labels`.
///
/// `drop_labels` must be sorted (see `sort_and_remove_duplicates`). Labels are borrowed from
/// `src` so the hot path doesn't copy names or values.
pub(crate) fn drop_series_labels<'a>(dst: &mut Vec<&'a Label>, src: &'a [Label], drop_labels: &[String]) {
    if drop_labels.is_empty() {
        dst.extend(src.iter());
        return;
    }
    for label in src {
        if drop_labels.binary_search(&label.name).is_err() {
            dst.push(label);
        }
    }
}

#[inline]
pub(crate) fn sort_labels(labels: &mut [&Label]) {
    labels.sort_unstable_by(|a, b| a.name.cmp(&b.name));
}

/// Checks the series identity is well-formed. `labels` must already be sorted by name.
pub(crate) fn validate_series(metric_name: &str, labels: &[&Label]) -> DedupResult<()> {
    if metric_name.is_empty() {
        return Err(DedupError::InvalidSeries("empty metric name".to_string()));
    }
    if let Some(pair) = labels.windows(2).find(|pair| pair[0].name == pair[1].name) {
        return Err(DedupError::InvalidSeries(format!(
            "duplicate label name {:?} in series {metric_name}",
            pair[0].name
        )));
    }
    Ok(())
}

/// Returns the labels of a series as they take part in its identity: without the names in
/// `drop_labels` and sorted by name.
pub fn normalize_labels(labels: &[Label], drop_labels: &[String]) -> Vec<Label> {
    let drop_labels = sort_and_remove_duplicates(drop_labels);
    let mut refs = Vec::with_capacity(labels.len());
    drop_series_labels(&mut refs, labels, &drop_labels);
    sort_labels(&mut refs);
    refs.into_iter().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Vec<Label> {
        pairs.iter().map(|(n, v)| Label::new(*n, *v)).collect()
    }

    #[test]
    fn test_normalize_drops_and_sorts() {
        let src = labels(&[("pod", "p1"), ("instance", "x"), ("job", "aaa"), ("node", "n1")]);
        let drop = vec!["node".to_string(), "instance".to_string()];
        let got = normalize_labels(&src, &drop);
        assert_eq!(got, labels(&[("job", "aaa"), ("pod", "p1")]));
    }

    #[test]
    fn test_normalize_empty_drop_list() {
        let src = labels(&[("b", "2"), ("a", "1")]);
        let got = normalize_labels(&src, &[]);
        assert_eq!(got, labels(&[("a", "1"), ("b", "2")]));
    }

    #[test]
    fn test_unknown_drop_labels_are_noop() {
        let src = labels(&[("a", "1")]);
        let got = normalize_labels(&src, &["missing".to_string()]);
        assert_eq!(got, src);
    }

    #[test]
    fn test_validate_series() {
        let src = labels(&[("a", "1"), ("a", "2"), ("b", "3")]);
        let mut refs: Vec<&Label> = src.iter().collect();
        sort_labels(&mut refs);
        assert!(matches!(
            validate_series("foo", &refs),
            Err(DedupError::InvalidSeries(_))
        ));
        assert!(matches!(
            validate_series("", &refs[2..]),
            Err(DedupError::InvalidSeries(_))
        ));
        assert_eq!(validate_series("foo", &refs[1..]), Ok(()));
    }

    #[test]
    fn test_sort_and_remove_duplicates() {
        let list = vec!["b".to_string(), "a".to_string(), "b".to_string()];
        assert_eq!(sort_and_remove_duplicates(&list), vec!["a", "b"]);
    }
}
