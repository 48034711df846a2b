use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;

use crate::clients::{ImageSearch, parse_error_message};
use crate::config::ServiceConfig;

/// Cover used whenever the image search cannot produce one.
pub const FALLBACK_IMAGE_URL: &str = "https://images.pexels.com/photos/1181671/pexels-photo-1181671.jpeg?auto=compress&cs=tinysrgb&w=1260&h=750&dpr=2";

#[derive(Clone)]
pub struct PexelsClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl PexelsClient {
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
    photos: Vec<Photo>,
}

#[derive(Debug, Deserialize)]
struct Photo {
    src: PhotoSources,
}

#[derive(Debug, Deserialize)]
struct PhotoSources {
    landscape: Option<String>,
}

#[async_trait]
impl ImageSearch for PexelsClient {
    async fn landscape_image(&self, query: &str) -> anyhow::Result<String> {
        let endpoint = format!("{}/search", self.base_url);
        let response = self
            .client
            .get(&endpoint)
            .header(reqwest::header::AUTHORIZATION, &self.api_key)
            .query(&[
                ("query", query),
                ("per_page", "1"),
                ("orientation", "landscape"),
            ])
            .send()
            .await
            .with_context(|| format!("GET {endpoint}"))?;

        let status = response.status();
        let raw = response.text().await.context("read Pexels response body")?;
        if !status.is_success() {
            let message = parse_error_message(&raw).unwrap_or_else(|| raw.clone());
            anyhow::bail!("Pexels API error ({status}): {message}");
        }

        parse_landscape_url(&raw)
    }
}

fn parse_landscape_url(raw: &str) -> anyhow::Result<String> {
    let parsed: SearchResponse = serde_json::from_str(raw).context("parse Pexels response")?;
    parsed
        .photos
        .into_iter()
        .next()
        .and_then(|photo| photo.src.landscape)
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("Pexels response has no landscape photo"))
}
