use crate::common::types::Timestamp;

/// Returns the time duration since UNIX_EPOCH in milliseconds.
pub fn current_time_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}
