use std::fmt;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Every generated course has exactly this many chapters.
pub const CHAPTER_COUNT: usize = 8;
pub const VIDEOS_PER_CHAPTER: usize = 2;
pub const GENERATE_COURSE_EVENT: &str = "course.generate";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CourseStatus {
    Pending,
    Completed,
    Failed,
}

impl CourseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => anyhow::bail!("unknown course status: {other:?}"),
        }
    }
}

impl fmt::Display for CourseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: String,
    pub status: CourseStatus,
    pub image_url: Option<String>,
    pub active_chapter_id: Option<String>,
    pub active_chapter_order: Option<u32>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub id: String,
    pub course_id: String,
    pub title: String,
    pub content: String,
    pub video_urls: Vec<String>,
    pub order: u32,
}

/// One entry of the outline step. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChapterOutline {
    pub title: String,
}

/// Output of a single chapter step, before persistence assigns an id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedChapter {
    pub title: String,
    pub content: String,
    pub video_urls: Vec<String>,
    pub order: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CourseSummary {
    pub course_id: String,
    pub total_chapters: usize,
}

/// Payload of a `course.generate` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GenerateCourse {
    pub course_id: String,
    pub title: String,
    pub description: String,
    pub user_id: String,
}

impl GenerateCourse {
    /// A course is generated by exactly one run, so redelivered events land on
    /// the same journal entries.
    pub fn run_id(&self) -> String {
        format!("{GENERATE_COURSE_EVENT}:{}", self.course_id)
    }

    pub fn into_event(self) -> anyhow::Result<InboundEvent> {
        Ok(InboundEvent {
            name: GENERATE_COURSE_EVENT.to_owned(),
            data: serde_json::to_value(self).context("serialize event data")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub name: String,
    pub data: serde_json::Value,
}

impl InboundEvent {
    pub fn into_generate_course(self) -> anyhow::Result<GenerateCourse> {
        if self.name != GENERATE_COURSE_EVENT {
            anyhow::bail!("unsupported event: {}", self.name);
        }
        let data: GenerateCourse =
            serde_json::from_value(self.data).context("parse course.generate data")?;
        if data.course_id.trim().is_empty() {
            anyhow::bail!("course.generate event has an empty courseId");
        }
        Ok(data)
    }
}
