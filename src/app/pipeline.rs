use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::app::chapter::{ChapterTask, ChapterTaskRunner};
use crate::app::course_store::CourseStore;
use crate::app::journal::{RunPhase, RunStatus, StepJournal};
use crate::app::model::{
    CHAPTER_COUNT, Chapter, ChapterOutline, CourseStatus, CourseSummary, GenerateCourse,
    GeneratedChapter,
};
use crate::app::steps::{RetryPolicy, StepRunner};
use crate::clients::Collaborators;
use crate::clients::pexels::FALLBACK_IMAGE_URL;
use crate::error::CourseGenError;

pub const OUTLINE_STEP: &str = "outline-chapters";
pub const COVER_STEP: &str = "fetch-course-image";
pub const SAVE_STEP: &str = "save-to-database";
pub const MARK_FAILED_STEP: &str = "mark-course-failed";

pub fn chapter_step(index: usize) -> String {
    format!("generate-chapter-{index}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    pub retry: RetryPolicy,
    /// Upper bound on chapter steps in flight at once.
    pub chapter_concurrency: usize,
    /// Budget for one image search. Must stay below the step timeout so a hung
    /// search degrades to the fallback cover.
    pub image_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            chapter_concurrency: CHAPTER_COUNT,
            image_timeout: Duration::from_secs(60),
        }
    }
}

impl PipelineOptions {
    fn cover_timeout(&self) -> Duration {
        if self.image_timeout < self.retry.step_timeout {
            self.image_timeout
        } else {
            self.retry.step_timeout / 2
        }
    }
}

/// Drives one `course.generate` run from the journal to a terminal state.
pub struct CoursePipeline {
    collaborators: Collaborators,
    chapters: Arc<ChapterTaskRunner>,
    courses: Arc<dyn CourseStore>,
    journal: Arc<dyn StepJournal>,
    options: PipelineOptions,
    /// One claim per run id; a second delivery waits, then replays.
    claims: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CoursePipeline {
    pub fn new(
        collaborators: Collaborators,
        courses: Arc<dyn CourseStore>,
        journal: Arc<dyn StepJournal>,
        options: PipelineOptions,
    ) -> Self {
        let chapters = Arc::new(ChapterTaskRunner::new(
            Arc::clone(&collaborators.content),
            Arc::clone(&collaborators.videos),
        ));
        Self {
            collaborators,
            chapters,
            courses,
            journal,
            options,
            claims: Mutex::new(HashMap::new()),
        }
    }

    /// Handles one delivery of the event. Safe to call again for the same
    /// course: recorded steps are replayed and finished runs are not re-run.
    pub async fn handle(&self, event: &GenerateCourse) -> anyhow::Result<CourseSummary> {
        let run_id = event.run_id();
        let claim = {
            let mut claims = self.claims.lock().await;
            Arc::clone(claims.entry(run_id.clone()).or_default())
        };
        let guard = Arc::clone(&claim).lock_owned().await;

        let result = self.handle_claimed(event).await;

        drop(guard);
        let mut claims = self.claims.lock().await;
        // The map and `claim` hold the only references when nobody is waiting.
        if Arc::strong_count(&claim) <= 2 {
            claims.remove(&run_id);
        }
        result
    }

    async fn handle_claimed(&self, delivered: &GenerateCourse) -> anyhow::Result<CourseSummary> {
        let run = self.journal.begin_run(delivered).await.context("begin run")?;
        let run_id = run.run_id.as_str();
        let event = &run.event;
        if event != delivered {
            tracing::warn!(
                run_id,
                course_id = %event.course_id,
                "redelivered event differs from the journaled one; using the journaled payload"
            );
        }

        match run.status {
            RunStatus::Completed => {
                tracing::info!(run_id, course_id = %event.course_id, "run already completed; replaying result");
                return self.recorded_summary(run_id).await;
            }
            RunStatus::Failed => {
                return Err(CourseGenError::RunPreviouslyFailed {
                    run_id: run.run_id.clone(),
                    message: run.error.clone().unwrap_or_default(),
                }
                .into());
            }
            RunStatus::Running => {}
        }

        tracing::info!(run_id, course_id = %event.course_id, phase = run.phase.as_str(), "running pipeline");
        let steps = StepRunner::new(Arc::clone(&self.journal), run_id, self.options.retry);

        match self.execute(&steps, event).await {
            Ok(summary) => {
                self.journal
                    .finish_run(run_id, RunStatus::Completed, None)
                    .await
                    .context("record completed run")?;
                tracing::info!(
                    run_id,
                    course_id = %summary.course_id,
                    chapters = summary.total_chapters,
                    "course generated"
                );
                Ok(summary)
            }
            Err(err) => {
                let message = format!("{err:#}");
                tracing::error!(run_id, course_id = %event.course_id, error = %message, "pipeline failed");
                self.compensate(&steps, &event.course_id).await;
                if let Err(journal_err) = self
                    .journal
                    .finish_run(run_id, RunStatus::Failed, Some(&message))
                    .await
                {
                    tracing::warn!(run_id, error = %format!("{journal_err:#}"), "failed to record failed run");
                }
                Err(err)
            }
        }
    }

    /// Events of runs that never reached a terminal state, for resumption.
    pub async fn unfinished_events(&self) -> anyhow::Result<Vec<GenerateCourse>> {
        let runs = self
            .journal
            .unfinished_runs()
            .await
            .context("list unfinished runs")?;
        Ok(runs.into_iter().map(|run| run.event).collect())
    }

    async fn execute(
        &self,
        steps: &StepRunner,
        event: &GenerateCourse,
    ) -> anyhow::Result<CourseSummary> {
        let course = self
            .courses
            .get(&event.course_id)
            .await
            .context("load course")?
            .ok_or_else(|| CourseGenError::CourseNotFound(event.course_id.clone()))?;
        if course.status == CourseStatus::Failed {
            return Err(CourseGenError::CourseNotPending {
                course_id: course.id,
                status: course.status,
            }
            .into());
        }

        self.enter(steps, RunPhase::Outlining).await?;
        let outline: Vec<ChapterOutline> = steps
            .run(OUTLINE_STEP, || self.outline(event))
            .await
            .context("outline chapters")?;

        self.enter(steps, RunPhase::FanningOut).await?;
        let chapters = self.fan_out(steps, event, &outline).await?;

        self.enter(steps, RunPhase::FetchingCover).await?;
        let image_url: String = steps
            .run(COVER_STEP, || self.cover_image(&event.title))
            .await
            .context("fetch course image")?;

        self.enter(steps, RunPhase::Persisting).await?;
        steps
            .run(SAVE_STEP, || {
                self.persist(&event.course_id, &image_url, &chapters)
            })
            .await
            .context("save course")
    }

    async fn enter(&self, steps: &StepRunner, phase: RunPhase) -> anyhow::Result<()> {
        tracing::debug!(run_id = steps.run_id(), phase = phase.as_str(), "entering phase");
        self.journal
            .set_phase(steps.run_id(), phase)
            .await
            .with_context(|| format!("record phase {}", phase.as_str()))
    }

    async fn outline(&self, event: &GenerateCourse) -> anyhow::Result<Vec<ChapterOutline>> {
        let outline = self
            .collaborators
            .outline
            .outline(&event.title, &event.description, CHAPTER_COUNT)
            .await?;
        validate_outline(outline)
    }

    async fn fan_out(
        &self,
        steps: &StepRunner,
        event: &GenerateCourse,
        outline: &[ChapterOutline],
    ) -> anyhow::Result<Vec<GeneratedChapter>> {
        let total = outline.len();
        let concurrency = self.options.chapter_concurrency.clamp(1, total.max(1));

        let mut join_set = JoinSet::new();
        let mut next_idx = 0usize;
        let mut results: Vec<Option<GeneratedChapter>> = vec![None; total];
        let mut done = 0usize;

        while next_idx < total || !join_set.is_empty() {
            while next_idx < total && join_set.len() < concurrency {
                let index = next_idx;
                let task = ChapterTask {
                    order: index as u32,
                    chapter_title: outline[index].title.clone(),
                    course_title: event.title.clone(),
                    course_description: event.description.clone(),
                };
                let steps = steps.clone();
                let runner = Arc::clone(&self.chapters);

                join_set.spawn(async move {
                    let step = chapter_step(index);
                    let outcome = steps.run(&step, || runner.run(&task)).await;
                    (index, outcome)
                });
                next_idx += 1;
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            let (index, outcome) = joined.context("join chapter task")?;
            match outcome {
                Ok(chapter) => {
                    done += 1;
                    tracing::info!(
                        run_id = steps.run_id(),
                        chapter = index,
                        done,
                        total,
                        "chapter ready"
                    );
                    results[index] = Some(chapter);
                }
                Err(err) => {
                    join_set.abort_all();
                    return Err(err.context(format!("generate chapter {index}")));
                }
            }
        }

        results
            .into_iter()
            .enumerate()
            .map(|(idx, chapter)| {
                chapter.ok_or_else(|| anyhow::anyhow!("missing result for chapter {idx}"))
            })
            .collect()
    }

    async fn cover_image(&self, course_title: &str) -> anyhow::Result<String> {
        let budget = self.options.cover_timeout();
        let search = self.collaborators.images.landscape_image(course_title);
        let err = match tokio::time::timeout(budget, search).await {
            Ok(Ok(url)) => return Ok(url),
            Ok(Err(err)) => err,
            Err(_) => anyhow::anyhow!("image search timed out after {}ms", budget.as_millis()),
        };
        tracing::warn!(
            error = %format!("{err:#}"),
            fallback = FALLBACK_IMAGE_URL,
            "image search failed; using fallback cover"
        );
        Ok(FALLBACK_IMAGE_URL.to_owned())
    }

    async fn persist(
        &self,
        course_id: &str,
        image_url: &str,
        generated: &[GeneratedChapter],
    ) -> anyhow::Result<CourseSummary> {
        let chapters = assign_chapter_ids(course_id, generated);
        self.courses
            .complete_with_chapters(course_id, image_url, &chapters)
            .await
    }

    /// Best effort: a failure here is logged, the original error still wins.
    async fn compensate(&self, steps: &StepRunner, course_id: &str) {
        match steps
            .run(MARK_FAILED_STEP, || self.courses.mark_failed(course_id))
            .await
        {
            Ok(true) => tracing::info!(course_id, "course marked failed"),
            Ok(false) => tracing::warn!(course_id, "course was not pending; status left unchanged"),
            Err(err) => {
                tracing::error!(course_id, error = %format!("{err:#}"), "failed to mark course failed")
            }
        }
    }

    async fn recorded_summary(&self, run_id: &str) -> anyhow::Result<CourseSummary> {
        let output = self
            .journal
            .step(run_id, SAVE_STEP)
            .await
            .context("read save step")?
            .and_then(|step| step.output)
            .ok_or_else(|| anyhow::anyhow!("completed run {run_id} has no recorded result"))?;
        serde_json::from_value(output).context("decode recorded course summary")
    }
}

pub fn validate_outline(outline: Vec<ChapterOutline>) -> anyhow::Result<Vec<ChapterOutline>> {
    if outline.len() != CHAPTER_COUNT {
        return Err(CourseGenError::MalformedOutline {
            expected: CHAPTER_COUNT,
            actual: outline.len(),
        }
        .into());
    }
    if let Some(idx) = outline.iter().position(|c| c.title.trim().is_empty()) {
        anyhow::bail!("outline chapter {idx} has an empty title");
    }
    Ok(outline)
}

/// Orders chapters by outline position and gives each a fresh id.
pub fn assign_chapter_ids(course_id: &str, generated: &[GeneratedChapter]) -> Vec<Chapter> {
    let mut sorted: Vec<&GeneratedChapter> = generated.iter().collect();
    sorted.sort_by_key(|c| c.order);
    sorted
        .into_iter()
        .map(|c| Chapter {
            id: uuid::Uuid::new_v4().to_string(),
            course_id: course_id.to_owned(),
            title: c.title.clone(),
            content: c.content.clone(),
            video_urls: c.video_urls.clone(),
            order: c.order,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outline(n: usize) -> Vec<ChapterOutline> {
        (0..n)
            .map(|i| ChapterOutline {
                title: format!("Chapter {i}"),
            })
            .collect()
    }

    #[test]
    fn outline_must_have_exactly_eight_titles() {
        assert!(validate_outline(outline(CHAPTER_COUNT)).is_ok());

        let err = validate_outline(outline(5)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CourseGenError>(),
            Some(CourseGenError::MalformedOutline {
                expected: 8,
                actual: 5
            })
        ));
        assert!(validate_outline(outline(9)).is_err());
    }

    #[test]
    fn outline_rejects_blank_titles() {
        let mut titles = outline(CHAPTER_COUNT);
        titles[4].title = "  ".to_owned();
        let err = validate_outline(titles).unwrap_err().to_string();
        assert!(err.contains("chapter 4"));
    }

    #[test]
    fn chapter_ids_follow_outline_order() {
        let generated: Vec<GeneratedChapter> = [3u32, 0, 2, 1]
            .into_iter()
            .map(|order| GeneratedChapter {
                title: format!("t{order}"),
                content: String::new(),
                video_urls: Vec::new(),
                order,
            })
            .collect();

        let chapters = assign_chapter_ids("c1", &generated);
        let orders: Vec<u32> = chapters.iter().map(|c| c.order).collect();
        assert_eq!(orders, vec![0, 1, 2, 3]);
        assert_eq!(chapters[0].title, "t0");
        assert!(chapters.iter().all(|c| c.course_id == "c1"));

        let mut ids: Vec<&str> = chapters.iter().map(|c| c.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn cover_timeout_stays_below_the_step_timeout() {
        let mut options = PipelineOptions::default();
        assert_eq!(options.cover_timeout(), Duration::from_secs(60));

        options.image_timeout = options.retry.step_timeout;
        assert_eq!(options.cover_timeout(), options.retry.step_timeout / 2);
    }

    #[test]
    fn chapter_step_names_are_stable() {
        assert_eq!(chapter_step(0), "generate-chapter-0");
        assert_eq!(chapter_step(7), "generate-chapter-7");
    }
}
