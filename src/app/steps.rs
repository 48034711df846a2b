use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::app::journal::{StepJournal, StepStatus};
use crate::error::CourseGenError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per step invocation, including the first one.
    pub max_attempts: u32,
    /// Upper bound for a single attempt.
    pub step_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            step_timeout: Duration::from_secs(120),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failed_attempt`-th failure (1-based): doubles each time,
    /// capped at `max_backoff`.
    pub fn backoff_for(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// Executes named steps of one run against the journal: completed steps are
/// replayed from their recorded output, everything else is attempted with
/// retries and recorded.
#[derive(Clone)]
pub struct StepRunner {
    journal: Arc<dyn StepJournal>,
    run_id: Arc<str>,
    policy: RetryPolicy,
}

impl StepRunner {
    pub fn new(journal: Arc<dyn StepJournal>, run_id: &str, policy: RetryPolicy) -> Self {
        Self {
            journal,
            run_id: Arc::from(run_id),
            policy,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub async fn run<T, F, Fut>(&self, step: &str, mut op: F) -> anyhow::Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let run_id = self.run_id();

        if let Some(record) = self
            .journal
            .step(run_id, step)
            .await
            .with_context(|| format!("read journal for step `{step}`"))?
            && record.status == StepStatus::Completed
        {
            let output = record.output.ok_or_else(|| {
                anyhow::anyhow!("step `{step}` is recorded as completed without output")
            })?;
            tracing::debug!(run_id, step, "replaying recorded step output");
            return serde_json::from_value(output)
                .with_context(|| format!("decode recorded output of step `{step}`"));
        }

        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let outcome = match tokio::time::timeout(self.policy.step_timeout, op()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(anyhow::anyhow!(
                    "attempt timed out after {}ms",
                    self.policy.step_timeout.as_millis()
                )),
            };

            match outcome {
                Ok(value) => {
                    let output =
                        serde_json::to_value(&value).context("serialize step output")?;
                    let recorded = self
                        .journal
                        .record_step_output(run_id, step, attempt, &output)
                        .await
                        .with_context(|| format!("record output of step `{step}`"))?;
                    if recorded != output {
                        tracing::warn!(
                            run_id,
                            step,
                            attempt,
                            "step was recorded by another execution; using its output"
                        );
                        return serde_json::from_value(recorded)
                            .with_context(|| format!("decode recorded output of step `{step}`"));
                    }
                    tracing::info!(run_id, step, attempt, "step completed");
                    return Ok(value);
                }
                Err(err) => {
                    last_error = format!("{err:#}");
                    let exhausted = attempt == max_attempts;
                    self.journal
                        .record_step_failure(run_id, step, attempt, &last_error, exhausted)
                        .await
                        .with_context(|| format!("record failure of step `{step}`"))?;
                    if exhausted {
                        tracing::error!(
                            run_id,
                            step,
                            attempts = attempt,
                            error = %last_error,
                            "step exhausted its retries"
                        );
                        break;
                    }

                    let delay = self.policy.backoff_for(attempt);
                    tracing::warn!(
                        run_id,
                        step,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %last_error,
                        "step attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(CourseGenError::StepExhausted {
            step: step.to_owned(),
            attempts: max_attempts,
            last_error,
        }
        .into())
    }
}
