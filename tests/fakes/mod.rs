#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use coursegen::app::admission::{self, GenerateCourseRequest};
use coursegen::app::course_store::{CourseStore, SqliteCourseStore};
use coursegen::app::journal::{SqliteStepJournal, StepJournal};
use coursegen::app::model::{ChapterOutline, GenerateCourse};
use coursegen::app::pipeline::{CoursePipeline, PipelineOptions};
use coursegen::app::steps::RetryPolicy;
use coursegen::clients::{
    Collaborators, ContentGenerator, ContentRequest, ImageSearch, OutlineGenerator, VideoSearch,
};
use coursegen::db::Database;

pub const COVER_URL: &str = "https://images.test/cover-landscape.jpg";

/// Outline and content generator with call counters and scripted failures.
#[derive(Default)]
pub struct FakeLlm {
    pub outline_len: usize,
    /// Outline attempts that fail before one succeeds.
    pub outline_failures: AtomicU32,
    /// Content for this chapter title fails on every attempt.
    pub failing_chapter: Option<String>,
    /// Content attempts that fail, per chapter title, before one succeeds.
    pub chapter_failures: HashMap<String, AtomicU32>,
    pub content_delays: HashMap<String, Duration>,

    pub outline_calls: AtomicU32,
    pub content_calls: AtomicU32,
    pub in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
}

impl FakeLlm {
    pub fn new() -> Self {
        Self {
            outline_len: 8,
            ..Self::default()
        }
    }
}

pub fn chapter_title(index: usize) -> String {
    format!("Chapter {index}")
}

#[async_trait]
impl OutlineGenerator for FakeLlm {
    async fn outline(
        &self,
        _course_title: &str,
        _course_description: &str,
        _chapter_count: usize,
    ) -> anyhow::Result<Vec<ChapterOutline>> {
        self.outline_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.outline_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.outline_failures.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("outline service unavailable");
        }
        Ok((0..self.outline_len)
            .map(|i| ChapterOutline {
                title: chapter_title(i),
            })
            .collect())
    }
}

#[async_trait]
impl ContentGenerator for FakeLlm {
    async fn chapter_content(&self, request: &ContentRequest<'_>) -> anyhow::Result<String> {
        self.content_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self
            .content_delays
            .get(request.chapter_title)
            .copied()
            .unwrap_or(Duration::from_millis(5));
        tokio::time::sleep(delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing_chapter.as_deref() == Some(request.chapter_title) {
            anyhow::bail!("text generation failed for {}", request.chapter_title);
        }
        if let Some(remaining) = self.chapter_failures.get(request.chapter_title)
            && remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            anyhow::bail!("text generation timed out for {}", request.chapter_title);
        }
        Ok(format!(
            "# {}\n\nPart of {}.\n",
            request.chapter_title, request.course_title
        ))
    }
}

#[derive(Default)]
pub struct FakeVideos {
    /// Return no results at all.
    pub empty: bool,
    pub calls: AtomicU32,
}

#[async_trait]
impl VideoSearch for FakeVideos {
    async fn search_videos(
        &self,
        query: &str,
        _max_results: usize,
    ) -> anyhow::Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.empty {
            return Ok(Vec::new());
        }
        // More than requested, the caller keeps the first two.
        let slug = query.replace(' ', "-").to_lowercase();
        Ok(vec![
            format!("{slug}-a"),
            format!("{slug}-b"),
            format!("{slug}-c"),
        ])
    }
}

#[derive(Default)]
pub struct FakeImages {
    pub fail: bool,
    /// Never answer.
    pub hang: bool,
    pub calls: AtomicU32,
}

#[async_trait]
impl ImageSearch for FakeImages {
    async fn landscape_image(&self, _query: &str) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.fail {
            anyhow::bail!("Pexels API error (503 Service Unavailable): try later");
        }
        Ok(COVER_URL.to_owned())
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        step_timeout: Duration::from_secs(5),
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}

pub fn fast_options() -> PipelineOptions {
    PipelineOptions {
        retry: fast_retry(),
        chapter_concurrency: 8,
        image_timeout: Duration::from_millis(100),
    }
}

pub struct Harness {
    pub db: Database,
    pub courses: Arc<SqliteCourseStore>,
    pub journal: Arc<SqliteStepJournal>,
    pub llm: Arc<FakeLlm>,
    pub videos: Arc<FakeVideos>,
    pub images: Arc<FakeImages>,
    pub pipeline: Arc<CoursePipeline>,
}

impl Harness {
    pub fn new(llm: FakeLlm, videos: FakeVideos, images: FakeImages) -> anyhow::Result<Self> {
        Self::with_options(llm, videos, images, fast_options())
    }

    pub fn with_options(
        llm: FakeLlm,
        videos: FakeVideos,
        images: FakeImages,
        options: PipelineOptions,
    ) -> anyhow::Result<Self> {
        let db = Database::open_in_memory()?;
        let courses = Arc::new(SqliteCourseStore::new(db.clone()));
        let journal = Arc::new(SqliteStepJournal::new(db.clone()));
        let llm = Arc::new(llm);
        let videos = Arc::new(videos);
        let images = Arc::new(images);

        let collaborators = Collaborators {
            outline: Arc::clone(&llm) as Arc<dyn OutlineGenerator>,
            content: Arc::clone(&llm) as Arc<dyn ContentGenerator>,
            videos: Arc::clone(&videos) as Arc<dyn VideoSearch>,
            images: Arc::clone(&images) as Arc<dyn ImageSearch>,
        };
        let pipeline = Arc::new(CoursePipeline::new(
            collaborators,
            Arc::clone(&courses) as Arc<dyn CourseStore>,
            Arc::clone(&journal) as Arc<dyn StepJournal>,
            options,
        ));

        Ok(Self {
            db,
            courses,
            journal,
            llm,
            videos,
            images,
            pipeline,
        })
    }

    pub fn default_fakes() -> anyhow::Result<Self> {
        Self::new(FakeLlm::new(), FakeVideos::default(), FakeImages::default())
    }

    /// Admits the example course and returns its event.
    pub async fn admit(&self) -> anyhow::Result<GenerateCourse> {
        let (_course, event) = admission::create_pending(
            self.courses.as_ref(),
            "user-1",
            GenerateCourseRequest {
                title: "Intro to Rust".to_owned(),
                description: "A beginner course on Rust ownership and concurrency.".to_owned(),
            },
        )
        .await?;
        Ok(event)
    }
}
