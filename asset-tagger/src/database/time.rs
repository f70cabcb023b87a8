//! Timestamp helpers for the database layer.
//!
//! Timestamps are stored as `INTEGER` Unix epoch milliseconds (UTC).

use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;

/// Current time as Unix epoch milliseconds (UTC).
#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Epoch milliseconds `d` from now.
#[inline]
pub fn ms_after(d: Duration) -> i64 {
    now_ms().saturating_add(duration_ms(d))
}

/// Epoch milliseconds `d` ago.
#[inline]
pub fn ms_before(d: Duration) -> i64 {
    now_ms().saturating_sub(duration_ms(d))
}

#[inline]
pub fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Convert Unix epoch milliseconds to `DateTime<Utc>`.
///
/// Values outside chrono's supported range clamp to the nearest representable timestamp.
#[inline]
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    match Utc.timestamp_millis_opt(ms) {
        chrono::LocalResult::Single(dt) => dt,
        chrono::LocalResult::Ambiguous(dt, _) => dt,
        chrono::LocalResult::None => {
            if ms.is_negative() {
                DateTime::<Utc>::MIN_UTC
            } else {
                DateTime::<Utc>::MAX_UTC
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets() {
        let before = ms_before(Duration::from_secs(60));
        let after = ms_after(Duration::from_secs(60));
        assert!(after - before >= 120_000);
        assert_eq!(duration_ms(Duration::from_millis(1500)), 1500);
    }

    #[test]
    fn test_ms_to_datetime_clamps() {
        assert_eq!(ms_to_datetime(0).timestamp_millis(), 0);
        assert_eq!(ms_to_datetime(i64::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
