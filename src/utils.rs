//! Small shared helpers.

/// Milliseconds since the Unix epoch.
#[inline]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
