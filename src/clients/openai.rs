use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;

use crate::app::model::ChapterOutline;
use crate::clients::{ContentGenerator, ContentRequest, OutlineGenerator, parse_error_message};
use crate::config::LlmConfig;
use crate::prompts::{PromptTemplates, render};

pub fn responses_endpoint(base_url: &str) -> String {
    let base_url = base_url.trim_end_matches('/');
    format!("{base_url}/responses")
}

/// Client for an OpenAI-compatible Responses API. Serves both the outline
/// (JSON schema output) and the chapter content (plain text output).
#[derive(Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    prompts: PromptTemplates,
}

impl OpenAiClient {
    pub fn new(client: reqwest::Client, config: &LlmConfig, prompts: PromptTemplates) -> Self {
        Self {
            client,
            endpoint: responses_endpoint(&config.base_url),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            prompts,
        }
    }

    async fn responses_text(
        &self,
        instructions: &str,
        input: &str,
        format: serde_json::Value,
    ) -> anyhow::Result<String> {
        let mut body = serde_json::json!({
            "model": self.model,
            "instructions": instructions,
            "input": input,
            "text": { "format": format },
            "store": false,
        });

        // NOTE: Some GPT-5 models reject sampling params like `temperature`.
        if !self.model.starts_with("gpt-5")
            && let Some(obj) = body.as_object_mut()
        {
            obj.insert("temperature".to_owned(), serde_json::json!(self.temperature));
        }

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {}", self.endpoint))?;

        let status = response.status();
        let raw = response.text().await.context("read LLM response body")?;
        if !status.is_success() {
            let message = parse_error_message(&raw).unwrap_or_else(|| raw.clone());
            anyhow::bail!("LLM API error ({status}): {message}");
        }

        let value: serde_json::Value = serde_json::from_str(&raw).context("parse LLM response")?;
        extract_output_text(&value).context("extract output text")
    }
}

#[async_trait]
impl OutlineGenerator for OpenAiClient {
    async fn outline(
        &self,
        course_title: &str,
        course_description: &str,
        chapter_count: usize,
    ) -> anyhow::Result<Vec<ChapterOutline>> {
        let count = chapter_count.to_string();
        let vars = [
            ("course_title", course_title),
            ("course_description", course_description),
            ("chapter_count", count.as_str()),
        ];
        let instructions = render(&self.prompts.outline_instructions, &vars);
        let input = render(&self.prompts.outline_input, &vars);

        let raw = self
            .responses_text(&instructions, &input, outline_format(chapter_count))
            .await
            .context("request chapter outline")?;
        parse_outline(&raw)
    }
}

#[async_trait]
impl ContentGenerator for OpenAiClient {
    async fn chapter_content(&self, request: &ContentRequest<'_>) -> anyhow::Result<String> {
        let vars = [
            ("chapter_title", request.chapter_title),
            ("course_title", request.course_title),
            ("course_description", request.course_description),
        ];
        let instructions = render(&self.prompts.chapter_instructions, &vars);
        let input = render(&self.prompts.chapter_input, &vars);

        self.responses_text(&instructions, &input, serde_json::json!({ "type": "text" }))
            .await
            .with_context(|| format!("generate content for {:?}", request.chapter_title))
    }
}

fn outline_format(chapter_count: usize) -> serde_json::Value {
    serde_json::json!({
        "type": "json_schema",
        "name": "chapter_outline",
        "strict": true,
        "schema": {
            "type": "object",
            "properties": {
                "chapters": {
                    "type": "array",
                    "description": format!("Exactly {chapter_count} chapter titles for the course"),
                    "minItems": chapter_count,
                    "maxItems": chapter_count,
                    "items": {
                        "type": "object",
                        "properties": { "title": { "type": "string" } },
                        "required": ["title"],
                        "additionalProperties": false,
                    },
                },
            },
            "required": ["chapters"],
            "additionalProperties": false,
        },
    })
}

#[derive(Debug, Deserialize)]
struct OutlineResponse {
    chapters: Vec<ChapterOutline>,
}

/// Parses the structured outline. The count is checked by the pipeline, not here.
pub fn parse_outline(raw: &str) -> anyhow::Result<Vec<ChapterOutline>> {
    let json = extract_json_object(raw).context("extract json object from outline output")?;
    let parsed: OutlineResponse = serde_json::from_str(json).context("parse outline json")?;
    Ok(parsed
        .chapters
        .into_iter()
        .map(|c| ChapterOutline {
            title: c.title.trim().to_owned(),
        })
        .collect())
}

fn extract_json_object(text: &str) -> anyhow::Result<&str> {
    let start = text
        .find('{')
        .ok_or_else(|| anyhow::anyhow!("no '{{' found in output"))?;
    let end = text
        .rfind('}')
        .ok_or_else(|| anyhow::anyhow!("no '}}' found in output"))?;
    if end < start {
        anyhow::bail!("malformed json object boundaries");
    }
    Ok(&text[start..=end])
}

fn extract_output_text(value: &serde_json::Value) -> anyhow::Result<String> {
    let output = value
        .get("output")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow::anyhow!("missing `output` array in response"))?;

    let mut text = String::new();
    for item in output {
        if item.get("type").and_then(|v| v.as_str()) != Some("message") {
            continue;
        }
        let Some(content) = item.get("content").and_then(|v| v.as_array()) else {
            continue;
        };
        for part in content {
            if part.get("type").and_then(|v| v.as_str()) != Some("output_text") {
                continue;
            }
            if let Some(part_text) = part.get("text").and_then(|v| v.as_str()) {
                text.push_str(part_text);
            }
        }
    }

    if text.trim().is_empty() {
        anyhow::bail!("LLM output text is empty");
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_strips_trailing_slash() {
        assert_eq!(
            responses_endpoint("https://api.groq.com/openai/v1/"),
            "https://api.groq.com/openai/v1/responses"
        );
    }

    #[test]
    fn output_text_skips_reasoning_items() {
        let value = serde_json::json!({
            "output": [
                { "type": "reasoning", "summary": [] },
                {
                    "type": "message",
                    "content": [
                        { "type": "output_text", "text": "# Ownership\n" },
                        { "type": "refusal", "refusal": "no" },
                        { "type": "output_text", "text": "Moves and borrows." }
                    ]
                }
            ]
        });
        assert_eq!(
            extract_output_text(&value).unwrap(),
            "# Ownership\nMoves and borrows."
        );
    }

    #[test]
    fn empty_output_is_an_error() {
        let value = serde_json::json!({ "output": [] });
        assert!(extract_output_text(&value).is_err());
    }

    #[test]
    fn outline_tolerates_fences_and_trims_titles() {
        let raw = "```json\n{\"chapters\":[{\"title\":\"  Basics \"},{\"title\":\"Traits\"}]}\n```";
        let outline = parse_outline(raw).unwrap();
        assert_eq!(
            outline,
            vec![
                ChapterOutline {
                    title: "Basics".to_owned()
                },
                ChapterOutline {
                    title: "Traits".to_owned()
                },
            ]
        );
    }

    #[test]
    fn outline_schema_pins_the_count() {
        let format = outline_format(8);
        assert_eq!(format["schema"]["properties"]["chapters"]["minItems"], 8);
        assert_eq!(format["schema"]["properties"]["chapters"]["maxItems"], 8);
    }

    #[test]
    fn error_message_is_read_from_error_object() {
        assert_eq!(
            parse_error_message(r#"{"error":{"message":"rate limited"}}"#).as_deref(),
            Some("rate limited")
        );
        assert_eq!(parse_error_message("plain text"), None);
    }
}
