//! HTTP client for Shibboleth DiscoFeed documents.
//!
//! The same JSON format serves both the federation metadata feed and the
//! per-application lists of accepted IdPs.

use crate::cache::filter::EntityListFetcher;
use crate::error::DiscoError;
use crate::services::metadata::IdpRecord;
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 100;
const PREFERRED_LANGUAGE: &str = "en";

#[derive(Deserialize, Debug)]
struct FeedEntry {
    #[serde(rename = "entityID")]
    entity_id: String,
    #[serde(rename = "DisplayNames", default)]
    display_names: Vec<DisplayName>,
}

#[derive(Deserialize, Debug)]
struct DisplayName {
    value: String,
    #[serde(default)]
    lang: Option<String>,
}

impl FeedEntry {
    fn display_name(&self) -> Option<String> {
        self.display_names
            .iter()
            .find(|n| n.lang.as_deref() == Some(PREFERRED_LANGUAGE))
            .or_else(|| self.display_names.first())
            .map(|n| n.value.clone())
    }
}

#[derive(Clone)]
pub struct DiscoFeedApi {
    client: Client,
}

impl DiscoFeedApi {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    /// GET `url` with exponential backoff on transport and server errors.
    async fn get_with_retry(&self, url: &str) -> Result<String, DiscoError> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            let start = Instant::now();
            debug!(url, attempt = attempt + 1, "Fetching discovery feed");

            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let elapsed_ms = start.elapsed().as_millis() as u64;

                    if status.is_success() {
                        let body = resp.text().await?;
                        debug!(url, status = %status, elapsed_ms, bytes = body.len(), "Feed received");
                        return Ok(body);
                    } else if status.is_server_error() {
                        debug!(url, status = %status, elapsed_ms, "Server error, will retry");
                        last_error = Some(DiscoError::Upstream(format!("HTTP {}", status)));
                    } else {
                        debug!(url, status = %status, elapsed_ms, "Client error, not retrying");
                        return Err(DiscoError::Upstream(format!("HTTP {}", status)));
                    }
                }
                Err(e) => {
                    debug!(url, error = %e, "Request failed");
                    last_error = Some(DiscoError::from(e));
                }
            }

            if attempt < MAX_RETRIES - 1 {
                let backoff = INITIAL_BACKOFF_MS * 2u64.pow(attempt);
                warn!(url, attempt = attempt + 1, max_retries = MAX_RETRIES, backoff_ms = backoff, "Feed request failed, retrying");
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
        }

        Err(last_error.unwrap_or_else(|| DiscoError::Upstream("Request failed after retries".into())))
    }

    #[instrument(skip(self))]
    pub async fn fetch_feed(&self, url: &str) -> Result<Vec<IdpRecord>, DiscoError> {
        let body = self.get_with_retry(url).await?;
        parse_feed(&body)
    }
}

fn parse_feed(body: &str) -> Result<Vec<IdpRecord>, DiscoError> {
    let entries: Vec<FeedEntry> = serde_json::from_str(body)?;
    Ok(entries
        .into_iter()
        .map(|e| {
            let display_name = e.display_name();
            IdpRecord::new(e.entity_id, display_name)
        })
        .collect())
}

impl EntityListFetcher for DiscoFeedApi {
    async fn fetch_entity_list(&self, url: &str) -> Result<Vec<String>, DiscoError> {
        let records = self.fetch_feed(url).await?;
        Ok(records.into_iter().map(|r| r.entity_id).collect())
    }
}
