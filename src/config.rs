use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context as _;

use crate::app::dispatcher::ExecutionMode;
use crate::app::pipeline::PipelineOptions;
use crate::app::steps::RetryPolicy;
use crate::prompts::PromptTemplates;

pub const DEFAULT_LLM_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_LLM_MODEL: &str = "llama-3.3-70b-versatile";
pub const DEFAULT_YOUTUBE_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";
pub const DEFAULT_PEXELS_BASE_URL: &str = "https://api.pexels.com/v1";

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub base_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub mode: ExecutionMode,
    pub worker_url: Option<String>,
    pub worker_auth_token: Option<String>,
}

/// Process configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub youtube: ServiceConfig,
    pub pexels: ServiceConfig,
    pub http_timeout: Duration,
    pub retry: RetryPolicy,
    pub chapter_concurrency: usize,
    pub prompts: PromptTemplates,
    pub dispatch: DispatchConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let env = Env(&lookup);

        let llm = LlmConfig {
            base_url: env.base_url("COURSEGEN_LLM_BASE_URL", DEFAULT_LLM_BASE_URL)?,
            api_key: env.required("GROQ_API_KEY")?,
            model: env.or("COURSEGEN_LLM_MODEL", DEFAULT_LLM_MODEL),
            temperature: env.parse_or("COURSEGEN_LLM_TEMPERATURE", 0.7)?,
        };
        let youtube = ServiceConfig {
            base_url: env.base_url("COURSEGEN_YOUTUBE_BASE_URL", DEFAULT_YOUTUBE_BASE_URL)?,
            api_key: env.required("GOOGLE_API_KEY")?,
        };
        let pexels = ServiceConfig {
            base_url: env.base_url("COURSEGEN_PEXELS_BASE_URL", DEFAULT_PEXELS_BASE_URL)?,
            api_key: env.required("PEXELS_API_KEY")?,
        };

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: env.parse_or("COURSEGEN_STEP_MAX_ATTEMPTS", defaults.max_attempts)?,
            step_timeout: Duration::from_secs(
                env.parse_or("COURSEGEN_STEP_TIMEOUT_SECS", defaults.step_timeout.as_secs())?,
            ),
            initial_backoff: Duration::from_millis(env.parse_or(
                "COURSEGEN_STEP_BACKOFF_MS",
                defaults.initial_backoff.as_millis() as u64,
            )?),
            max_backoff: defaults.max_backoff,
        };
        if retry.max_attempts == 0 {
            anyhow::bail!("COURSEGEN_STEP_MAX_ATTEMPTS must be > 0");
        }

        let http_timeout = Duration::from_secs(env.parse_or("COURSEGEN_HTTP_TIMEOUT_SECS", 60)?);
        if http_timeout >= retry.step_timeout {
            anyhow::bail!(
                "COURSEGEN_HTTP_TIMEOUT_SECS ({}s) must be shorter than COURSEGEN_STEP_TIMEOUT_SECS ({}s)",
                http_timeout.as_secs(),
                retry.step_timeout.as_secs()
            );
        }

        let prompts_path = env.optional("COURSEGEN_PROMPTS_FILE").map(PathBuf::from);
        let prompts = PromptTemplates::load(prompts_path.as_deref()).context("load prompts")?;

        let mode_raw = env.or("COURSEGEN_EXECUTION_MODE", "inprocess");
        let mode = ExecutionMode::parse(&mode_raw).with_context(|| {
            format!("invalid COURSEGEN_EXECUTION_MODE={mode_raw:?}. expected one of: inprocess, worker")
        })?;
        let dispatch = DispatchConfig {
            mode,
            worker_url: env
                .optional("COURSEGEN_WORKER_URL")
                .map(|url| url.trim_end_matches('/').to_owned()),
            worker_auth_token: env.optional("COURSEGEN_WORKER_AUTH_TOKEN"),
        };
        if mode == ExecutionMode::Worker {
            if dispatch.worker_url.is_none() {
                anyhow::bail!("COURSEGEN_WORKER_URL is required for worker execution mode");
            }
            if dispatch.worker_auth_token.is_none() {
                anyhow::bail!("COURSEGEN_WORKER_AUTH_TOKEN is required for worker execution mode");
            }
        }

        Ok(Self {
            llm,
            youtube,
            pexels,
            http_timeout,
            retry,
            chapter_concurrency: env.parse_or("COURSEGEN_CHAPTER_CONCURRENCY", 8usize)?.max(1),
            prompts,
            dispatch,
        })
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            retry: self.retry,
            chapter_concurrency: self.chapter_concurrency,
            image_timeout: self.http_timeout,
        }
    }
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty())
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_owned())
    }

    fn required(&self, key: &str) -> anyhow::Result<String> {
        self.optional(key)
            .ok_or_else(|| anyhow::anyhow!("{key} is not set"))
    }

    fn parse_or<T>(&self, key: &str, default: T) -> anyhow::Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|err| anyhow::anyhow!("invalid {key}={raw:?}: {err}")),
        }
    }

    fn base_url(&self, key: &str, default: &str) -> anyhow::Result<String> {
        let raw = self.or(key, default);
        let url = url::Url::parse(&raw).with_context(|| format!("invalid {key}={raw:?}"))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            anyhow::bail!("{key} must be http/https: {raw}");
        }
        Ok(raw.trim_end_matches('/').to_owned())
    }
}
