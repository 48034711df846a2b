use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use reqwest::StatusCode;

use crate::app::model::GenerateCourse;
use crate::app::pipeline::CoursePipeline;
use crate::app::queue::InProcessQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    InProcess,
    Worker,
}

impl ExecutionMode {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "inprocess" => Ok(Self::InProcess),
            "worker" => Ok(Self::Worker),
            other => anyhow::bail!("unsupported execution mode: {other}"),
        }
    }
}

/// Hands a `course.generate` event to whatever executes the pipeline.
/// Returns once the event is accepted, not once the course is generated.
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    async fn dispatch(&self, event: &GenerateCourse) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct InProcessEventDispatcher {
    queue: InProcessQueue,
    pipeline: Arc<CoursePipeline>,
}

impl InProcessEventDispatcher {
    pub fn new(queue: InProcessQueue, pipeline: Arc<CoursePipeline>) -> Self {
        Self { queue, pipeline }
    }
}

#[async_trait]
impl EventDispatcher for InProcessEventDispatcher {
    async fn dispatch(&self, event: &GenerateCourse) -> anyhow::Result<()> {
        let pipeline = Arc::clone(&self.pipeline);
        let event = event.clone();
        let run_id = event.run_id();
        self.queue.spawn_named(&run_id, async move {
            // Failures are already journaled and compensated by the pipeline.
            if let Err(err) = pipeline.handle(&event).await {
                tracing::warn!(course_id = %event.course_id, error = %format!("{err:#}"), "run ended with error");
            }
        });
        Ok(())
    }
}

/// Forwards events to a separate worker process over HTTP.
#[derive(Clone)]
pub struct WorkerEventDispatcher {
    client: reqwest::Client,
    base_url: String,
    auth_token: String,
}

impl WorkerEventDispatcher {
    pub fn new(client: reqwest::Client, base_url: &str, auth_token: &str) -> anyhow::Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_owned();
        if base_url.is_empty() {
            anyhow::bail!("worker url is empty");
        }
        let auth_token = auth_token.trim().to_owned();
        if auth_token.is_empty() {
            anyhow::bail!("worker auth token is empty");
        }
        Ok(Self {
            client,
            base_url,
            auth_token,
        })
    }
}

#[async_trait]
impl EventDispatcher for WorkerEventDispatcher {
    async fn dispatch(&self, event: &GenerateCourse) -> anyhow::Result<()> {
        let url = format!("{}/internal/runs/{}", self.base_url, event.course_id);
        let envelope = event.clone().into_event()?;
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.auth_token)
            .json(&envelope)
            .send()
            .await
            .context("send worker dispatch request")?;
        if resp.status().is_success() || resp.status() == StatusCode::ACCEPTED {
            return Ok(());
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("worker dispatch failed ({status}): {body}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_inprocess_variants() {
        assert_eq!(
            ExecutionMode::parse("inprocess").unwrap(),
            ExecutionMode::InProcess
        );
        assert_eq!(
            ExecutionMode::parse("INPROCESS").unwrap(),
            ExecutionMode::InProcess
        );
        assert_eq!(ExecutionMode::parse("").unwrap(), ExecutionMode::InProcess);
    }

    #[test]
    fn parse_worker() {
        assert_eq!(
            ExecutionMode::parse(" Worker ").unwrap(),
            ExecutionMode::Worker
        );
    }

    #[test]
    fn parse_invalid() {
        let err = ExecutionMode::parse("queue").unwrap_err().to_string();
        assert!(err.contains("unsupported execution mode"));
    }

    #[test]
    fn worker_requires_url_and_token() {
        let client = reqwest::Client::new();
        assert!(WorkerEventDispatcher::new(client.clone(), "", "t").is_err());
        assert!(WorkerEventDispatcher::new(client.clone(), "http://w", "  ").is_err());
        assert!(WorkerEventDispatcher::new(client, "http://w/", "t").is_ok());
    }
}
