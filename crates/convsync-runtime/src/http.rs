use std::time::Duration;

use convsync_core::{SyncError, SyncErrorCategory};

/// Error for a non-success HTTP status, carrying any `Retry-After` hint.
pub(crate) fn status_error(
    category: SyncErrorCategory,
    code: &str,
    message: String,
    retry_after: Option<&str>,
) -> SyncError {
    let error = SyncError::new(category, code, message);
    match parse_retry_after(retry_after) {
        Some(delay) => error.with_retry_after(delay),
        None => error,
    }
}

/// Delta-seconds form only; HTTP dates are ignored.
fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value?.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_seconds_become_a_hint() {
        let err = status_error(
            SyncErrorCategory::RateLimited,
            "fetch_error",
            "row fetch failed with HTTP 429".into(),
            Some(" 3 "),
        );
        assert_eq!(err.retry_after_ms, Some(3_000));
        assert!(err.is_recoverable());
    }

    #[test]
    fn unusable_retry_after_is_dropped() {
        assert_eq!(parse_retry_after(Some("Wed, 21 Oct 2015 07:28:00 GMT")), None);
        assert_eq!(parse_retry_after(Some("-1")), None);
        assert_eq!(parse_retry_after(None), None);
    }
}
