use std::{sync::Arc, time::Duration};

use convsync_core::{IngestEvent, IngestSource, RawChange, SyncError, Timestamp};
use tokio::{
    sync::{Notify, mpsc, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::fetch::MessageFetcher;

/// Timer-driven fetch of rows newer than the session watermark.
///
/// Covers whatever the change stream misses. Ticks that fire while a fetch is
/// still outstanding are skipped, so fetches never overlap.
#[derive(Clone)]
pub struct PollingFallback {
    fetcher: Arc<dyn MessageFetcher>,
    interval: Duration,
}

impl PollingFallback {
    pub fn new(fetcher: Arc<dyn MessageFetcher>, interval: Duration) -> Self {
        Self { fetcher, interval }
    }

    /// Start polling `conversation_id`. Must be called from within a tokio runtime.
    pub fn start(
        &self,
        conversation_id: impl Into<String>,
        watermark: watch::Receiver<Option<Timestamp>>,
        ingest: mpsc::Sender<IngestEvent>,
        stop: CancellationToken,
    ) -> PollingHandle {
        let wake = Arc::new(Notify::new());
        let worker = PollWorker {
            fetcher: Arc::clone(&self.fetcher),
            conversation_id: conversation_id.into(),
            interval: self.interval,
            watermark,
            ingest,
            stop: stop.clone(),
            wake: Arc::clone(&wake),
        };

        PollingHandle {
            stop,
            wake,
            task: Some(tokio::spawn(worker.run())),
        }
    }
}

/// Cloneable request for an out-of-schedule poll.
///
/// Requests made while a fetch is outstanding coalesce into one follow-up fetch.
#[derive(Debug, Clone)]
pub struct PollTrigger {
    stop: CancellationToken,
    wake: Arc<Notify>,
}

impl PollTrigger {
    pub fn poll_now(&self) {
        if !self.stop.is_cancelled() {
            self.wake.notify_one();
        }
    }
}

/// Owner handle for a running poll loop. Dropping it stops polling.
#[derive(Debug)]
pub struct PollingHandle {
    stop: CancellationToken,
    wake: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl PollingHandle {
    /// Run one fetch as soon as the loop is idle, without waiting for the timer.
    pub fn poll_now(&self) {
        self.trigger().poll_now();
    }

    pub fn trigger(&self) -> PollTrigger {
        PollTrigger {
            stop: self.stop.clone(),
            wake: Arc::clone(&self.wake),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Cancel the timer. Results of an in-flight fetch are discarded.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub async fn shutdown(&mut self) {
        self.stop();
        if let Some(task) = self.task.take()
            && let Err(err) = task.await
        {
            error!(error = %err, "polling task panicked");
        }
    }
}

impl Drop for PollingHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

struct PollWorker {
    fetcher: Arc<dyn MessageFetcher>,
    conversation_id: String,
    interval: Duration,
    watermark: watch::Receiver<Option<Timestamp>>,
    ingest: mpsc::Sender<IngestEvent>,
    stop: CancellationToken,
    wake: Arc<Notify>,
}

impl PollWorker {
    async fn run(self) {
        debug!(
            conversation_id = %self.conversation_id,
            interval_ms = self.interval.as_millis() as u64,
            "polling task started"
        );
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }

            if !self.poll_once().await {
                break;
            }
            // Drop ticks that elapsed while the fetch was outstanding.
            ticker.reset();
        }

        debug!(conversation_id = %self.conversation_id, "polling task exiting");
    }

    /// One fetch-and-forward pass. `false` once the loop should exit.
    async fn poll_once(&self) -> bool {
        let watermark = *self.watermark.borrow();
        trace!(conversation_id = %self.conversation_id, ?watermark, "polling for new rows");

        let fetched = tokio::select! {
            biased;
            _ = self.stop.cancelled() => return false,
            fetched = self.fetcher.fetch_since(&self.conversation_id, watermark) => fetched,
        };

        match fetched {
            Ok(rows) => {
                if !rows.is_empty() {
                    debug!(
                        conversation_id = %self.conversation_id,
                        rows = rows.len(),
                        "poll returned rows"
                    );
                }
                for row in rows {
                    let event = IngestEvent::Change {
                        source: IngestSource::Poll,
                        raw: RawChange::insert(row),
                    };
                    if !self.forward(event).await {
                        return false;
                    }
                }
                true
            }
            Err(err) => self.report(err).await,
        }
    }

    async fn report(&self, err: SyncError) -> bool {
        warn!(
            conversation_id = %self.conversation_id,
            code = %err.code,
            error = %err.message,
            "poll failed; retrying on next tick"
        );
        self.forward(IngestEvent::PollFailed(err)).await
    }

    /// Queue `event` unless stopped first, including while the queue is full.
    async fn forward(&self, event: IngestEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => false,
            sent = self.ingest.send(event) => sent.is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use serde_json::json;
    use tokio::time::timeout;

    use super::*;
    use crate::fetch::InMemoryFetcher;

    const WAIT: Duration = Duration::from_secs(2);

    fn ts(millis: i64) -> Timestamp {
        DateTime::from_timestamp_millis(millis).expect("valid timestamp")
    }

    fn start(
        fetcher: &InMemoryFetcher,
        interval: Duration,
        watermark: Option<Timestamp>,
    ) -> (
        PollingHandle,
        mpsc::Receiver<IngestEvent>,
        watch::Sender<Option<Timestamp>>,
    ) {
        let (tx, rx) = mpsc::channel(16);
        let (watermark_tx, watermark_rx) = watch::channel(watermark);
        let poller = PollingFallback::new(Arc::new(fetcher.clone()), interval);
        let handle = poller.start("conv", watermark_rx, tx, CancellationToken::new());
        (handle, rx, watermark_tx)
    }

    async fn next_event(rx: &mut mpsc::Receiver<IngestEvent>) -> IngestEvent {
        timeout(WAIT, rx.recv())
            .await
            .expect("ingest event timeout")
            .expect("ingest channel open")
    }

    fn polled_id(event: &IngestEvent) -> Option<&str> {
        match event {
            IngestEvent::Change {
                source: IngestSource::Poll,
                raw,
            } => raw.new.as_ref()?.get("id")?.as_str(),
            _ => None,
        }
    }

    #[tokio::test]
    async fn forwards_rows_newer_than_watermark_on_tick() {
        let fetcher = InMemoryFetcher::new();
        fetcher.insert_row("conv", json!({ "id": "old", "created_at": 10 }));
        fetcher.insert_row("conv", json!({ "id": "new", "created_at": 20 }));

        let (_handle, mut rx, _watermark) =
            start(&fetcher, Duration::from_millis(20), Some(ts(10)));

        let event = next_event(&mut rx).await;
        assert_eq!(polled_id(&event), Some("new"));
    }

    #[tokio::test]
    async fn poll_now_fetches_without_waiting_for_timer() {
        let fetcher = InMemoryFetcher::new();
        fetcher.insert_row("conv", json!({ "id": "1", "created_at": 10 }));

        let (handle, mut rx, _watermark) = start(&fetcher, Duration::from_secs(60), None);
        handle.poll_now();

        let event = next_event(&mut rx).await;
        assert_eq!(polled_id(&event), Some("1"));
    }

    #[tokio::test]
    async fn reads_the_latest_watermark_each_tick() {
        let fetcher = InMemoryFetcher::new();
        fetcher.insert_row("conv", json!({ "id": "1", "created_at": 10 }));

        let (handle, mut rx, watermark) = start(&fetcher, Duration::from_secs(60), None);
        handle.poll_now();
        assert_eq!(polled_id(&next_event(&mut rx).await), Some("1"));

        watermark.send_replace(Some(ts(10)));
        fetcher.insert_row("conv", json!({ "id": "2", "created_at": 20 }));
        handle.poll_now();
        assert_eq!(polled_id(&next_event(&mut rx).await), Some("2"));
    }

    #[tokio::test]
    async fn failures_are_reported_and_polling_continues() {
        let fetcher = InMemoryFetcher::new();
        fetcher.fail_next(1);
        fetcher.insert_row("conv", json!({ "id": "1", "created_at": 10 }));

        let (_handle, mut rx, _watermark) = start(&fetcher, Duration::from_millis(20), None);

        match next_event(&mut rx).await {
            IngestEvent::PollFailed(err) => assert_eq!(err.code, "fetch_error"),
            other => panic!("unexpected ingest event: {other:?}"),
        }
        assert_eq!(polled_id(&next_event(&mut rx).await), Some("1"));
    }

    #[tokio::test]
    async fn slow_fetches_never_overlap() {
        let fetcher = InMemoryFetcher::new();
        fetcher.set_delay(Some(Duration::from_millis(60)));

        let (mut handle, _rx, _watermark) = start(&fetcher, Duration::from_millis(10), None);
        tokio::time::sleep(Duration::from_millis(250)).await;
        handle.shutdown().await;

        assert!(fetcher.fetch_count() >= 2);
        assert_eq!(fetcher.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn stop_discards_in_flight_results() {
        let fetcher = InMemoryFetcher::new();
        fetcher.set_delay(Some(Duration::from_millis(100)));
        fetcher.insert_row("conv", json!({ "id": "1", "created_at": 10 }));

        let (mut handle, mut rx, _watermark) = start(&fetcher, Duration::from_secs(60), None);
        handle.poll_now();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.shutdown().await;

        assert!(handle.is_stopped());
        assert!(rx.try_recv().is_err());
        assert_eq!(fetcher.fetch_count(), 1);
    }

    #[tokio::test]
    async fn stop_unblocks_a_send_waiting_on_a_full_queue() {
        let fetcher = InMemoryFetcher::new();
        for n in 1..=3 {
            fetcher.insert_row("conv", json!({ "id": n.to_string(), "created_at": n * 10 }));
        }

        let (tx, mut rx) = mpsc::channel(1);
        let (_watermark_tx, watermark_rx) = watch::channel(None);
        let poller = PollingFallback::new(Arc::new(fetcher.clone()), Duration::from_secs(60));
        let mut handle = poller.start("conv", watermark_rx, tx, CancellationToken::new());
        handle.poll_now();

        // First row fills the queue; the second send is now parked.
        timeout(WAIT, async {
            while fetcher.fetch_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("poll should start");
        tokio::time::sleep(Duration::from_millis(50)).await;

        timeout(WAIT, handle.shutdown())
            .await
            .expect("stop should not wait for queue space");

        assert_eq!(polled_id(&next_event(&mut rx).await), Some("1"));
        assert!(
            rx.try_recv().is_err(),
            "rows parked behind a full queue must be dropped on stop"
        );
    }
}
