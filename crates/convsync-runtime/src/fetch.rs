use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use convsync_core::{SyncError, Timestamp, normalize_row};
use serde_json::Value;

/// Pull access to a conversation's stored rows.
#[async_trait]
pub trait MessageFetcher: Send + Sync {
    /// Rows created strictly after `watermark`, oldest first.
    ///
    /// `None` means "from the beginning"; implementations bound the page size.
    async fn fetch_since(
        &self,
        conversation_id: &str,
        watermark: Option<Timestamp>,
    ) -> Result<Vec<Value>, SyncError>;

    /// The newest `limit` rows, newest first.
    async fn fetch_latest(
        &self,
        conversation_id: &str,
        limit: u16,
    ) -> Result<Vec<Value>, SyncError>;
}

#[derive(Debug, Default)]
struct FetcherState {
    rows: Vec<(String, Value)>,
    failures_remaining: usize,
    delay: Option<Duration>,
    fetch_count: usize,
    in_flight: usize,
    max_in_flight: usize,
}

/// Process-local row table for tests and offline runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFetcher {
    state: Arc<Mutex<FetcherState>>,
}

impl InMemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_row(&self, conversation_id: &str, row: Value) {
        self.lock().rows.push((conversation_id.to_owned(), row));
    }

    /// Make the next `count` fetches fail.
    pub fn fail_next(&self, count: usize) {
        self.lock().failures_remaining = count;
    }

    /// Hold every fetch open for `delay` before answering.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.lock().delay = delay;
    }

    /// Number of `fetch_since` calls started so far.
    pub fn fetch_count(&self) -> usize {
        self.lock().fetch_count
    }

    /// Highest number of concurrently outstanding fetches observed.
    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    fn lock(&self) -> MutexGuard<'_, FetcherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self) -> Option<Duration> {
        let mut state = self.lock();
        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);
        state.delay
    }

    fn finish(&self) -> Result<(), SyncError> {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(SyncError::fetch("injected fetch failure"));
        }
        Ok(())
    }

    fn rows_for(&self, conversation_id: &str) -> Vec<(Option<Timestamp>, Value)> {
        self.lock()
            .rows
            .iter()
            .filter(|(conversation, _)| conversation == conversation_id)
            .map(|(_, row)| {
                let created_at = normalize_row(row).ok().and_then(|row| row.created_at);
                (created_at, row.clone())
            })
            .collect()
    }
}

/// Decrements the in-flight counter when a fetch future is dropped mid-way.
struct InFlightGuard<'a> {
    fetcher: &'a InMemoryFetcher,
    armed: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.fetcher.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
    }
}

impl InMemoryFetcher {
    async fn simulate_round_trip(&self) -> Result<(), SyncError> {
        let delay = self.begin();
        let mut guard = InFlightGuard {
            fetcher: self,
            armed: true,
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        guard.armed = false;
        self.finish()
    }
}

#[async_trait]
impl MessageFetcher for InMemoryFetcher {
    async fn fetch_since(
        &self,
        conversation_id: &str,
        watermark: Option<Timestamp>,
    ) -> Result<Vec<Value>, SyncError> {
        self.lock().fetch_count += 1;
        self.simulate_round_trip().await?;

        let mut rows: Vec<(Option<Timestamp>, Value)> = self
            .rows_for(conversation_id)
            .into_iter()
            .filter(|(created_at, _)| match (watermark, created_at) {
                (None, _) => true,
                (Some(watermark), Some(created_at)) => *created_at > watermark,
                (Some(_), None) => false,
            })
            .collect();
        rows.sort_by_key(|(created_at, _)| *created_at);
        Ok(rows.into_iter().map(|(_, row)| row).collect())
    }

    async fn fetch_latest(
        &self,
        conversation_id: &str,
        limit: u16,
    ) -> Result<Vec<Value>, SyncError> {
        self.simulate_round_trip().await?;

        let mut rows = self.rows_for(conversation_id);
        rows.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(rows
            .into_iter()
            .take(usize::from(limit))
            .map(|(_, row)| row)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use serde_json::json;

    use super::*;

    fn ts(millis: i64) -> Timestamp {
        DateTime::from_timestamp_millis(millis).expect("valid timestamp")
    }

    fn seeded() -> InMemoryFetcher {
        let fetcher = InMemoryFetcher::new();
        fetcher.insert_row("conv", json!({ "id": "b", "created_at": 20 }));
        fetcher.insert_row("conv", json!({ "id": "a", "created_at": 10 }));
        fetcher.insert_row("conv", json!({ "id": "c", "created_at": 30 }));
        fetcher.insert_row("other", json!({ "id": "x", "created_at": 40 }));
        fetcher
    }

    fn ids(rows: &[Value]) -> Vec<&str> {
        rows.iter().filter_map(|row| row["id"].as_str()).collect()
    }

    #[tokio::test]
    async fn fetch_since_is_strictly_after_watermark_and_ascending() {
        let fetcher = seeded();
        let rows = fetcher
            .fetch_since("conv", Some(ts(10)))
            .await
            .expect("fetch");
        assert_eq!(ids(&rows), ["b", "c"]);

        let all = fetcher.fetch_since("conv", None).await.expect("fetch");
        assert_eq!(ids(&all), ["a", "b", "c"]);
        assert_eq!(fetcher.fetch_count(), 2);
    }

    #[tokio::test]
    async fn fetch_latest_returns_newest_first() {
        let rows = seeded().fetch_latest("conv", 2).await.expect("fetch");
        assert_eq!(ids(&rows), ["c", "b"]);
    }

    #[tokio::test]
    async fn injected_failure_applies_once() {
        let fetcher = seeded();
        fetcher.fail_next(1);
        let err = fetcher
            .fetch_since("conv", None)
            .await
            .expect_err("first fetch fails");
        assert_eq!(err.code, "fetch_error");
        assert!(fetcher.fetch_since("conv", None).await.is_ok());
    }
}
