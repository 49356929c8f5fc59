use thiserror::Error;

#[derive(Debug, Error, Eq, PartialEq)]
/// Enum for various errors in the deduplicator.
pub enum DedupError {
    #[error("Invalid configuration. {0}")]
    InvalidConfiguration(String),

    #[error("Invalid series. {0}")]
    InvalidSeries(String),

    #[error("Corrupt series key. {0}")]
    CorruptSeriesKey(String),

    #[error("Cannot start flush loop. {0}")]
    FlushLoopStart(String),

    #[error("Deduplicator is stopped")]
    Stopped,
}

pub type DedupResult<T> = Result<T, DedupError>;
