mod config;
mod demo;
mod logging;

use std::{future, process::ExitCode, sync::Arc, time::Duration};

use config::SmokeConfig;
use convsync_core::{MemberDirectory, Message, RetryPolicy, SessionEvent, StreamState, SyncError};
use convsync_runtime::{
    ChangeFeed, InMemoryChangeFeed, InMemoryFetcher, MessageFetcher, RealtimeChangeFeed,
    RestMessageFetcher, SessionTransports, SyncSession, WebhookSender,
};
use demo::DemoTraffic;
use serde_json::Map;
use tokio::{sync::broadcast::error::RecvError, time::Instant};
use tracing::{error, info, warn};

const DEMO_STEP: Duration = Duration::from_secs(2);
const PRINTED_MESSAGES: usize = 10;

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let upstream = match Upstream::from_config(&config) {
        Ok(upstream) => upstream,
        Err(err) => {
            error!(code = %err.code, error = %err.message, "cannot build transports");
            return ExitCode::FAILURE;
        }
    };

    run(config, upstream).await;
    ExitCode::SUCCESS
}

/// Transports for one run, plus scripted traffic when no data store is configured.
struct Upstream {
    feed: Arc<dyn ChangeFeed>,
    fetcher: Arc<dyn MessageFetcher>,
    demo: Option<DemoTraffic>,
}

impl Upstream {
    fn from_config(config: &SmokeConfig) -> Result<Self, SyncError> {
        let Some(url) = &config.rest_url else {
            info!("no CONVSYNC_REST_URL set; running with in-memory demo traffic");
            let feed = InMemoryChangeFeed::new();
            let fetcher = InMemoryFetcher::new();
            demo::seed(&fetcher, &config.conversation_id);
            let demo = DemoTraffic::new(&config.conversation_id, feed.clone(), fetcher.clone());
            return Ok(Self {
                feed: Arc::new(feed),
                fetcher: Arc::new(fetcher),
                demo: Some(demo),
            });
        };

        info!(%url, table = %config.table, "polling REST endpoint");
        let mut fetcher = RestMessageFetcher::new(url.clone()).with_table(&config.table);
        if let Some(api_key) = &config.api_key {
            fetcher = fetcher.with_api_key(api_key);
        }

        let feed: Arc<dyn ChangeFeed> = if config.realtime {
            let mut feed = RealtimeChangeFeed::new(url.clone())?.with_table(&config.table);
            if let Some(api_key) = &config.api_key {
                feed = feed.with_api_key(api_key);
            }
            info!(table = %config.table, "subscribing to realtime changes");
            Arc::new(feed)
        } else {
            warn!("CONVSYNC_REALTIME is off; push is disabled and only polling delivers rows");
            Arc::new(InMemoryChangeFeed::new())
        };

        Ok(Self {
            feed,
            fetcher: Arc::new(fetcher),
            demo: None,
        })
    }
}

async fn run(config: SmokeConfig, upstream: Upstream) {
    let Upstream {
        feed,
        fetcher,
        mut demo,
    } = upstream;

    let mut directory = MemberDirectory::from_members(&demo::members());
    if let Some(sender) = &config.sender {
        directory = directory.with_local_name(sender.clone());
    }
    info!(members = directory.len(), "sender directory loaded");

    let mut transports = SessionTransports::new(feed, fetcher, Arc::new(directory));
    if let Some(url) = &config.webhook_url {
        transports = transports.with_webhook(WebhookSender::new(url.clone()));
    }
    if let Some(sender) = &config.sender {
        transports = transports.with_local_sender(sender.clone());
    }

    let mut session =
        SyncSession::open(config.session.clone(), &config.conversation_id, transports);
    let mut events = session.subscribe();

    if let Some(message_id) = session.send_message("hello from convsync-smoke", None, Map::new()) {
        info!(%message_id, "outbound message dispatched");
    }

    let retry = RetryPolicy::default();
    let mut restart_attempt: u32 = 0;
    let mut restart_at: Option<Instant> = None;
    let mut demo_ticker = tokio::time::interval(DEMO_STEP);
    let deadline = tokio::time::sleep(config.run_for);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(SessionEvent::StreamFailed { error }) => {
                    if error.is_recoverable() {
                        let delay = retry.delay_after_error(restart_attempt, &error);
                        restart_attempt = restart_attempt.saturating_add(1);
                        info!(
                            code = %error.code,
                            delay_ms = delay.as_millis() as u64,
                            "scheduling stream restart"
                        );
                        restart_at = Some(Instant::now() + delay);
                    } else {
                        error!(
                            code = %error.code,
                            error = %error.message,
                            "change stream failure is not recoverable; polling only"
                        );
                        restart_at = None;
                    }
                }
                Ok(SessionEvent::StreamStateChanged { state }) => {
                    info!(?state, "change stream state");
                    if state == StreamState::Subscribed {
                        restart_attempt = 0;
                    }
                }
                Ok(SessionEvent::MessagesChanged { count }) => {
                    print_view(count, &session.messages());
                }
                Ok(other) => warn!(event = ?other, "session reported a failure"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "session events lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = sleep_until(restart_at) => {
                restart_at = None;
                if let Err(err) = session.restart_stream() {
                    warn!(error = %err, "stream restart rejected");
                }
            }
            _ = demo_ticker.tick(), if demo.is_some() => {
                if let Some(demo) = demo.as_mut() {
                    demo.step();
                }
            }
        }
    }

    session.close().await;
    info!(conversation_id = %config.conversation_id, "smoke run finished");
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => future::pending().await,
    }
}

fn print_view(count: usize, messages: &[Message]) {
    println!("--- {count} message(s), newest first ---");
    for message in messages.iter().take(PRINTED_MESSAGES) {
        let reply = message
            .reply_to_message
            .as_ref()
            .map(|target| format!(" (re: {})", target.body()))
            .unwrap_or_default();
        println!(
            "{} [{}] {}{}",
            message.ordering_key().format("%H:%M:%S%.3f"),
            message.sender_display_name,
            message.body(),
            reply
        );
    }
}
