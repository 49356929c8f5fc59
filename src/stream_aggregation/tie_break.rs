use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::common::types::Sample;
use crate::error::DedupError;

/// Decides which of two samples for the same series survives within a window.
#[derive(Debug, Default, PartialEq, Eq, Deserialize, Serialize, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum TieBreak {
    /// the sample processed last replaces the stored one, regardless of timestamps
    #[default]
    Last,
    /// the sample with the higher timestamp wins. On equal timestamps the larger value wins
    Newest,
}

impl TieBreak {
    /// Returns true if `new_sample` should replace `old_sample`.
    #[inline]
    pub fn should_replace(self, old_sample: &Sample, new_sample: &Sample) -> bool {
        match self {
            TieBreak::Last => true,
            TieBreak::Newest => {
                new_sample.timestamp > old_sample.timestamp
                    || (new_sample.timestamp == old_sample.timestamp
                        && new_sample.value > old_sample.value)
            }
        }
    }
}

impl Display for TieBreak {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TieBreak::Last => write!(f, "last"),
            TieBreak::Newest => write!(f, "newest"),
        }
    }
}

impl FromStr for TieBreak {
    type Err = DedupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "last" => Ok(TieBreak::Last),
            "newest" => Ok(TieBreak::Newest),
            _ => Err(DedupError::InvalidConfiguration(format!(
                "invalid tie break policy: {s}"
            ))),
        }
    }
}
