use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;

use crate::clients::{VideoSearch, parse_error_message};
use crate::config::ServiceConfig;

/// YouTube Data API v3 `search.list`.
#[derive(Clone)]
pub struct YoutubeClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl YoutubeClient {
    pub fn new(client: reqwest::Client, config: &ServiceConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            api_key: config.api_key.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: SearchItemId,
}

#[derive(Debug, Deserialize)]
struct SearchItemId {
    #[serde(rename = "videoId")]
    video_id: Option<String>,
}

#[async_trait]
impl VideoSearch for YoutubeClient {
    async fn search_videos(
        &self,
        query: &str,
        max_results: usize,
    ) -> anyhow::Result<Vec<String>> {
        if max_results == 0 {
            return Ok(Vec::new());
        }

        let endpoint = format!("{}/search", self.base_url);
        let max_results = max_results.to_string();
        let response = self
            .client
            .get(&endpoint)
            .query(&[
                ("part", "snippet"),
                ("q", query),
                ("type", "video"),
                ("maxResults", max_results.as_str()),
                ("relevanceLanguage", "en"),
                ("key", self.api_key.as_str()),
            ])
            .send()
            .await
            .with_context(|| format!("GET {endpoint}"))?;

        let status = response.status();
        let raw = response.text().await.context("read YouTube response body")?;
        if !status.is_success() {
            let message = parse_error_message(&raw).unwrap_or_else(|| raw.clone());
            anyhow::bail!("YouTube API error ({status}): {message}");
        }

        parse_video_ids(&raw)
    }
}

fn parse_video_ids(raw: &str) -> anyhow::Result<Vec<String>> {
    let parsed: SearchResponse = serde_json::from_str(raw).context("parse YouTube response")?;
    Ok(parsed
        .items
        .into_iter()
        .filter_map(|item| item.id.video_id)
        .filter(|id| !id.trim().is_empty())
        .collect())
}
