use chrono::{DateTime, Utc};

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Seconds since the unix epoch with millisecond precision, as used by
/// exemplar and `_created` samples.
pub fn unix_seconds(dt: &DateTime<Utc>) -> f64 {
    dt.timestamp_millis() as f64 / 1000.0
}
