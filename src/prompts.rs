//! Prompt templates sent to the text-generation service.
//!
//! Templates use `{{name}}` placeholders and can be replaced wholesale from a
//! YAML file, so wording changes never touch orchestration code.

use std::path::Path;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PromptTemplates {
    pub outline_instructions: String,
    pub outline_input: String,
    pub chapter_instructions: String,
    pub chapter_input: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            outline_instructions: "You are an expert course curriculum designer. \
Generate exactly {{chapter_count}} chapter titles for a course. Return structured JSON."
                .to_owned(),
            outline_input: "Create exactly {{chapter_count}} chapter titles for a course titled \
\"{{course_title}}\". Course description: \"{{course_description}}\". \
The chapters should follow a logical learning progression from beginner to advanced concepts."
                .to_owned(),
            chapter_instructions: "You are an expert educator. Write educational content in \
Markdown format. Be thorough but concise, around 300 words."
                .to_owned(),
            chapter_input: "Write ~300 words of Markdown educational content for the chapter \
titled \"{{chapter_title}}\" which is part of a course called \"{{course_title}}\". \
Course description: \"{{course_description}}\". \
Include headings, key concepts, and practical examples."
                .to_owned(),
        }
    }
}

impl PromptTemplates {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read prompts file: {}", path.display()))?;
        let templates: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("parse prompts file: {}", path.display()))?;
        tracing::info!(path = %path.display(), "loaded prompt templates");
        Ok(templates)
    }
}

/// Substitutes `{{key}}` for each `(key, value)` pair. Unknown placeholders are
/// left as they are.
/// Values are inserted verbatim and never scanned for placeholders.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let value = after.find("}}").and_then(|end| {
            let key = &after[..end];
            vars.iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| (*value, end))
        });
        match value {
            Some((value, end)) => {
                out.push_str(value);
                rest = &after[end + 2..];
            }
            None => {
                out.push_str("{{");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
