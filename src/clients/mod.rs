//! Adapters to the external services the pipeline orchestrates.
//!
//! Each trait is one call with typed input and output. Handles are built once
//! at startup and shared through [`Collaborators`].

pub mod openai;
pub mod pexels;
pub mod youtube;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;

use crate::app::model::ChapterOutline;
use crate::config::AppConfig;

#[async_trait]
pub trait OutlineGenerator: Send + Sync {
    async fn outline(
        &self,
        course_title: &str,
        course_description: &str,
        chapter_count: usize,
    ) -> anyhow::Result<Vec<ChapterOutline>>;
}

#[derive(Debug, Clone, Copy)]
pub struct ContentRequest<'a> {
    pub chapter_title: &'a str,
    pub course_title: &'a str,
    pub course_description: &'a str,
}

#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Returns the chapter body as Markdown, unvalidated.
    async fn chapter_content(&self, request: &ContentRequest<'_>) -> anyhow::Result<String>;
}

#[async_trait]
pub trait VideoSearch: Send + Sync {
    /// Video identifiers, best match first. An empty list is a valid answer.
    async fn search_videos(&self, query: &str, max_results: usize)
    -> anyhow::Result<Vec<String>>;
}

#[async_trait]
pub trait ImageSearch: Send + Sync {
    async fn landscape_image(&self, query: &str) -> anyhow::Result<String>;
}

#[derive(Clone)]
pub struct Collaborators {
    pub outline: Arc<dyn OutlineGenerator>,
    pub content: Arc<dyn ContentGenerator>,
    pub videos: Arc<dyn VideoSearch>,
    pub images: Arc<dyn ImageSearch>,
}

impl Collaborators {
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let client = http_client(config.http_timeout)?;
        let llm = Arc::new(openai::OpenAiClient::new(
            client.clone(),
            &config.llm,
            config.prompts.clone(),
        ));
        tracing::info!(
            base_url = %config.llm.base_url,
            model = %config.llm.model,
            timeout_secs = config.http_timeout.as_secs(),
            "configured collaborator clients"
        );
        Ok(Self {
            outline: llm.clone(),
            content: llm,
            videos: Arc::new(youtube::YoutubeClient::new(client.clone(), &config.youtube)),
            images: Arc::new(pexels::PexelsClient::new(client, &config.pexels)),
        })
    }
}

pub fn http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("coursegen/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("build http client")
}

/// Pulls `error.message` out of a JSON error body, which is the shape used by
/// the OpenAI-compatible, YouTube and Pexels APIs alike.
pub(crate) fn parse_error_message(raw_json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw_json).ok()?;
    let error = value.get("error")?;
    match error {
        serde_json::Value::String(message) => Some(message.clone()),
        _ => Some(error.get("message")?.as_str()?.to_owned()),
    }
}
