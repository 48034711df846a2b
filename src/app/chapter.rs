use std::sync::Arc;

use anyhow::Context as _;

use crate::app::model::{GeneratedChapter, VIDEOS_PER_CHAPTER};
use crate::clients::{ContentGenerator, ContentRequest, VideoSearch};

#[derive(Debug, Clone)]
pub struct ChapterTask {
    pub order: u32,
    pub chapter_title: String,
    pub course_title: String,
    pub course_description: String,
}

/// Produces one chapter: Markdown body and related videos, requested
/// concurrently. Errors from either call propagate unchanged in kind.
pub struct ChapterTaskRunner {
    content: Arc<dyn ContentGenerator>,
    videos: Arc<dyn VideoSearch>,
}

impl ChapterTaskRunner {
    pub fn new(content: Arc<dyn ContentGenerator>, videos: Arc<dyn VideoSearch>) -> Self {
        Self { content, videos }
    }

    pub async fn run(&self, task: &ChapterTask) -> anyhow::Result<GeneratedChapter> {
        let request = ContentRequest {
            chapter_title: &task.chapter_title,
            course_title: &task.course_title,
            course_description: &task.course_description,
        };

        let (content, mut video_urls) = tokio::try_join!(
            async {
                self.content
                    .chapter_content(&request)
                    .await
                    .with_context(|| format!("content for chapter {}", task.order))
            },
            async {
                self.videos
                    .search_videos(&task.chapter_title, VIDEOS_PER_CHAPTER)
                    .await
                    .with_context(|| format!("videos for chapter {}", task.order))
            },
        )?;
        video_urls.truncate(VIDEOS_PER_CHAPTER);

        tracing::debug!(
            chapter = task.order,
            content_chars = content.len(),
            videos = video_urls.len(),
            "chapter generated"
        );
        Ok(GeneratedChapter {
            title: task.chapter_title.clone(),
            content,
            video_urls,
            order: task.order,
        })
    }
}
