use async_trait::async_trait;
use chrono::SecondsFormat;
use convsync_core::{SyncError, SyncErrorCategory, Timestamp, classify_http_status};
use reqwest::header::RETRY_AFTER;
use serde_json::Value;
use tracing::{debug, instrument};
use url::Url;

use crate::{fetch::MessageFetcher, http::status_error};

pub const DEFAULT_TABLE: &str = "messages";
pub const DEFAULT_PAGE_LIMIT: u16 = 500;

/// [`MessageFetcher`] over a PostgREST-style HTTP endpoint.
#[derive(Debug, Clone)]
pub struct RestMessageFetcher {
    http: reqwest::Client,
    base_url: Url,
    table: String,
    api_key: Option<String>,
    page_limit: u16,
}

impl RestMessageFetcher {
    /// `base_url` is the project root; a path prefix is kept as a directory.
    pub fn new(base_url: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: as_directory(base_url),
            table: DEFAULT_TABLE.to_owned(),
            api_key: None,
            page_limit: DEFAULT_PAGE_LIMIT,
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_page_limit(mut self, page_limit: u16) -> Self {
        self.page_limit = page_limit.max(1);
        self
    }

    fn table_url(&self) -> Result<Url, SyncError> {
        self.base_url
            .join("rest/v1/")
            .and_then(|url| url.join(&self.table))
            .map_err(|err| {
                SyncError::new(
                    SyncErrorCategory::Config,
                    "invalid_config",
                    format!("cannot build table url: {err}"),
                )
            })
    }

    fn since_url(
        &self,
        conversation_id: &str,
        watermark: Option<Timestamp>,
    ) -> Result<Url, SyncError> {
        let mut url = self.table_url()?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("select", "*")
                .append_pair("conversation_id", &format!("eq.{conversation_id}"));
            if let Some(watermark) = watermark {
                query.append_pair(
                    "created_at",
                    &format!(
                        "gt.{}",
                        watermark.to_rfc3339_opts(SecondsFormat::Micros, true)
                    ),
                );
            }
            query
                .append_pair("order", "created_at.asc")
                .append_pair("limit", &self.page_limit.to_string());
        }
        Ok(url)
    }

    fn latest_url(&self, conversation_id: &str, limit: u16) -> Result<Url, SyncError> {
        let mut url = self.table_url()?;
        url.query_pairs_mut()
            .append_pair("select", "*")
            .append_pair("conversation_id", &format!("eq.{conversation_id}"))
            .append_pair("order", "created_at.desc")
            .append_pair("limit", &limit.to_string());
        Ok(url)
    }

    async fn get_rows(&self, url: Url) -> Result<Vec<Value>, SyncError> {
        let mut request = self.http.get(url).header("Accept", "application/json");
        if let Some(api_key) = &self.api_key {
            request = request
                .header("apikey", api_key)
                .header("Authorization", format!("Bearer {api_key}"));
        }

        let response = request
            .send()
            .await
            .map_err(|err| SyncError::fetch(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok());
            return Err(status_error(
                classify_http_status(status.as_u16()),
                "fetch_error",
                format!("row fetch failed with HTTP {}", status.as_u16()),
                retry_after,
            ));
        }

        let rows: Vec<Value> = response.json().await.map_err(|err| {
            SyncError::new(
                SyncErrorCategory::Serialization,
                "fetch_error",
                format!("row fetch returned an unreadable body: {err}"),
            )
        })?;
        debug!(rows = rows.len(), "rows fetched");
        Ok(rows)
    }
}

/// `Url::join` replaces the last segment unless the path ends in `/`.
pub(crate) fn as_directory(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

#[async_trait]
impl MessageFetcher for RestMessageFetcher {
    #[instrument(skip(self), fields(table = %self.table))]
    async fn fetch_since(
        &self,
        conversation_id: &str,
        watermark: Option<Timestamp>,
    ) -> Result<Vec<Value>, SyncError> {
        let url = self.since_url(conversation_id, watermark)?;
        self.get_rows(url).await
    }

    #[instrument(skip(self), fields(table = %self.table))]
    async fn fetch_latest(
        &self,
        conversation_id: &str,
        limit: u16,
    ) -> Result<Vec<Value>, SyncError> {
        let url = self.latest_url(conversation_id, limit)?;
        self.get_rows(url).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn fetcher(base: &str) -> RestMessageFetcher {
        RestMessageFetcher::new(Url::parse(base).expect("valid base url"))
    }

    fn query(url: &Url) -> Vec<(String, String)> {
        url.query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect()
    }

    #[test]
    fn since_url_filters_by_conversation_and_watermark() {
        let watermark = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let url = fetcher("https://db.example.com/")
            .with_page_limit(50)
            .since_url("conv-1", Some(watermark))
            .expect("url");

        assert_eq!(url.path(), "/rest/v1/messages");
        assert_eq!(
            query(&url),
            [
                ("select".into(), "*".into()),
                ("conversation_id".into(), "eq.conv-1".into()),
                ("created_at".into(), "gt.2024-05-01T10:00:00.000000Z".into()),
                ("order".into(), "created_at.asc".into()),
                ("limit".into(), "50".into()),
            ]
        );
    }

    #[test]
    fn since_url_without_watermark_reads_from_start() {
        let url = fetcher("https://db.example.com")
            .since_url("conv-1", None)
            .expect("url");
        assert!(query(&url).iter().all(|(key, _)| key != "created_at"));
    }

    #[test]
    fn latest_url_orders_newest_first() {
        let url = fetcher("https://db.example.com/")
            .with_table("chat_messages")
            .latest_url("conv-1", 100)
            .expect("url");

        assert_eq!(url.path(), "/rest/v1/chat_messages");
        let pairs = query(&url);
        assert!(pairs.contains(&("order".into(), "created_at.desc".into())));
        assert!(pairs.contains(&("limit".into(), "100".into())));
    }

    #[test]
    fn base_url_path_prefix_is_kept() {
        let url = fetcher("https://proxy.example.com/tenant/")
            .since_url("c", None)
            .expect("url");
        assert_eq!(url.path(), "/tenant/rest/v1/messages");
    }

    #[test]
    fn base_url_without_trailing_slash_keeps_last_segment() {
        let url = fetcher("https://proxy.example.com/tenant")
            .latest_url("c", 10)
            .expect("url");
        assert_eq!(url.path(), "/tenant/rest/v1/messages");

        let nested = fetcher("https://proxy.example.com/a/b")
            .since_url("c", None)
            .expect("url");
        assert_eq!(nested.path(), "/a/b/rest/v1/messages");
    }
}
