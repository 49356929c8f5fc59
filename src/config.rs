use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DedupError, DedupResult};
use crate::stream_aggregation::TieBreak;

pub const DEFAULT_DEDUP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_ALIAS: &str = "global";

const ENV_DEDUP_INTERVAL_MS: &str = "DEDUP_INTERVAL_MS";
const ENV_DROP_LABELS: &str = "DEDUP_DROP_LABELS";
const ENV_KEEP_METRIC_NAMES: &str = "DEDUP_KEEP_METRIC_NAMES";
const ENV_TIE_BREAK: &str = "DEDUP_TIE_BREAK";
const ENV_ALIAS: &str = "DEDUP_ALIAS";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Length of a flush window. Must be positive.
    pub dedup_interval: Duration,

    /// Label names removed from every series before its identity is computed. Series which only
    /// differ by these labels collapse into one.
    pub drop_labels: Vec<String>,

    /// Whether flushed series keep their metric name verbatim. When false the output is tagged as
    /// an aggregation output: `<metric>:<alias>_dedup`.
    pub keep_metric_names: bool,

    /// Which duplicate survives within a window.
    pub tie_break: TieBreak,

    /// Names this instance in logs and metrics. Not part of series identity.
    pub alias: String,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            dedup_interval: DEFAULT_DEDUP_INTERVAL,
            drop_labels: Vec::new(),
            keep_metric_names: true,
            tie_break: TieBreak::default(),
            alias: DEFAULT_ALIAS.to_string(),
        }
    }
}

impl DedupConfig {
    pub fn new(dedup_interval: Duration) -> Self {
        Self {
            dedup_interval,
            ..Default::default()
        }
    }

    pub fn with_drop_labels<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.drop_labels = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_keep_metric_names(mut self, keep_metric_names: bool) -> Self {
        self.keep_metric_names = keep_metric_names;
        self
    }

    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    pub fn with_alias<S: Into<String>>(mut self, alias: S) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn validate(&self) -> DedupResult<()> {
        if self.dedup_interval.is_zero() {
            return Err(DedupError::InvalidConfiguration(
                "dedup_interval must be positive".to_string(),
            ));
        }
        if let Some(name) = self.drop_labels.iter().find(|name| name.is_empty()) {
            return Err(DedupError::InvalidConfiguration(format!(
                "empty label name in drop_labels: {name:?}"
            )));
        }
        // the alias also names the flush thread
        if self.alias.contains('\0') {
            return Err(DedupError::InvalidConfiguration(format!(
                "alias may not contain NUL bytes: {:?}",
                self.alias
            )));
        }
        Ok(())
    }

    /// Default config overridden by `DEDUP_*` environment variables.
    pub fn from_env() -> DedupResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> DedupResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(v) = lookup(ENV_DEDUP_INTERVAL_MS) {
            let ms = v.trim().parse::<i64>().map_err(|e| {
                DedupError::InvalidConfiguration(format!("{ENV_DEDUP_INTERVAL_MS}={v}: {e}"))
            })?;
            if ms <= 0 {
                return Err(DedupError::InvalidConfiguration(format!(
                    "{ENV_DEDUP_INTERVAL_MS} must be positive; got {ms}"
                )));
            }
            config.dedup_interval = Duration::from_millis(ms as u64);
        }
        if let Some(v) = lookup(ENV_DROP_LABELS) {
            config.drop_labels = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup(ENV_KEEP_METRIC_NAMES) {
            config.keep_metric_names = v.trim().parse::<bool>().map_err(|e| {
                DedupError::InvalidConfiguration(format!("{ENV_KEEP_METRIC_NAMES}={v}: {e}"))
            })?;
        }
        if let Some(v) = lookup(ENV_TIE_BREAK) {
            config.tie_break = v.parse()?;
        }
        if let Some(v) = lookup(ENV_ALIAS) {
            config.alias = v;
        }
        config.validate()?;
        Ok(config)
    }
}
