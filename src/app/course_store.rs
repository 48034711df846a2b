use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension as _, Row, params};

use crate::app::model::{CHAPTER_COUNT, Chapter, Course, CourseStatus, CourseSummary};
use crate::db::Database;
use crate::error::CourseGenError;

/// Sole writer of course and chapter rows.
#[async_trait]
pub trait CourseStore: Send + Sync {
    async fn create_pending(
        &self,
        course_id: &str,
        user_id: &str,
        title: &str,
        description: &str,
    ) -> anyhow::Result<Course>;
    async fn get(&self, course_id: &str) -> anyhow::Result<Option<Course>>;
    async fn get_for_user(&self, course_id: &str, user_id: &str)
    -> anyhow::Result<Option<Course>>;
    async fn list_for_user(&self, user_id: &str) -> anyhow::Result<Vec<Course>>;
    async fn chapters(&self, course_id: &str) -> anyhow::Result<Vec<Chapter>>;

    /// Moves a pending course to `failed`. Returns `false` when the course was
    /// not pending, which leaves completed courses untouched.
    async fn mark_failed(&self, course_id: &str) -> anyhow::Result<bool>;

    /// Completes a pending course and inserts all of its chapters in one
    /// transaction. Calling it again for an already completed course returns
    /// the stored summary without writing.
    async fn complete_with_chapters(
        &self,
        course_id: &str,
        image_url: &str,
        chapters: &[Chapter],
    ) -> anyhow::Result<CourseSummary>;

    /// Viewer progress. Only succeeds for the owner and for a chapter of this
    /// course at `order`.
    async fn set_active_chapter(
        &self,
        course_id: &str,
        user_id: &str,
        chapter_id: &str,
        order: u32,
    ) -> anyhow::Result<bool>;
}

#[derive(Clone)]
pub struct SqliteCourseStore {
    db: Database,
}

impl SqliteCourseStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

const COURSE_COLUMNS: &str = "id, user_id, title, description, status, image_url, \
     active_chapter_id, active_chapter_order, created_at, updated_at";

#[async_trait]
impl CourseStore for SqliteCourseStore {
    async fn create_pending(
        &self,
        course_id: &str,
        user_id: &str,
        title: &str,
        description: &str,
    ) -> anyhow::Result<Course> {
        let now = Utc::now();
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO courses (id, user_id, title, description, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5)",
            params![course_id, user_id, title, description, now.to_rfc3339()],
        )
        .with_context(|| format!("insert course {course_id}"))?;

        Ok(Course {
            id: course_id.to_owned(),
            user_id: user_id.to_owned(),
            title: title.to_owned(),
            description: description.to_owned(),
            status: CourseStatus::Pending,
            image_url: None,
            active_chapter_id: None,
            active_chapter_order: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get(&self, course_id: &str) -> anyhow::Result<Option<Course>> {
        let conn = self.db.lock().await;
        let raw = conn
            .query_row(
                &format!("SELECT {COURSE_COLUMNS} FROM courses WHERE id = ?1"),
                params![course_id],
                RawCourse::from_row,
            )
            .optional()
            .with_context(|| format!("read course {course_id}"))?;
        raw.map(RawCourse::into_course).transpose()
    }

    async fn get_for_user(
        &self,
        course_id: &str,
        user_id: &str,
    ) -> anyhow::Result<Option<Course>> {
        let conn = self.db.lock().await;
        let raw = conn
            .query_row(
                &format!("SELECT {COURSE_COLUMNS} FROM courses WHERE id = ?1 AND user_id = ?2"),
                params![course_id, user_id],
                RawCourse::from_row,
            )
            .optional()
            .with_context(|| format!("read course {course_id}"))?;
        raw.map(RawCourse::into_course).transpose()
    }

    async fn list_for_user(&self, user_id: &str) -> anyhow::Result<Vec<Course>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COURSE_COLUMNS} FROM courses WHERE user_id = ?1 ORDER BY created_at DESC, id"
        ))?;
        let rows = stmt.query_map(params![user_id], RawCourse::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("read course row")?.into_course()?);
        }
        Ok(out)
    }

    async fn chapters(&self, course_id: &str) -> anyhow::Result<Vec<Chapter>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, course_id, title, content, video_urls, chapter_order
             FROM chapters WHERE course_id = ?1 ORDER BY chapter_order",
        )?;
        let rows = stmt.query_map(params![course_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, u32>(5)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, course_id, title, content, video_urls, order) =
                row.context("read chapter row")?;
            let video_urls: Vec<String> = serde_json::from_str(&video_urls)
                .with_context(|| format!("parse video_urls of chapter {id}"))?;
            out.push(Chapter {
                id,
                course_id,
                title,
                content,
                video_urls,
                order,
            });
        }
        Ok(out)
    }

    async fn mark_failed(&self, course_id: &str) -> anyhow::Result<bool> {
        let conn = self.db.lock().await;
        let updated = conn
            .execute(
                "UPDATE courses SET status = 'failed', updated_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![course_id, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("mark course {course_id} failed"))?;
        Ok(updated > 0)
    }

    async fn complete_with_chapters(
        &self,
        course_id: &str,
        image_url: &str,
        chapters: &[Chapter],
    ) -> anyhow::Result<CourseSummary> {
        let first_chapter_id = validate_chapter_set(course_id, chapters)?;

        let mut conn = self.db.lock().await;
        let tx = conn.transaction().context("begin transaction")?;

        let updated = tx
            .execute(
                "UPDATE courses
                 SET image_url = ?2, active_chapter_id = ?3, active_chapter_order = 0,
                     status = 'completed', updated_at = ?4
                 WHERE id = ?1 AND status = 'pending'",
                params![course_id, image_url, first_chapter_id, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("update course {course_id}"))?;

        if updated == 0 {
            let status: Option<String> = tx
                .query_row(
                    "SELECT status FROM courses WHERE id = ?1",
                    params![course_id],
                    |row| row.get(0),
                )
                .optional()
                .with_context(|| format!("read course {course_id}"))?;
            let Some(status) = status else {
                return Err(CourseGenError::CourseNotFound(course_id.to_owned()).into());
            };
            let status = CourseStatus::parse(&status)?;
            if status != CourseStatus::Completed {
                return Err(CourseGenError::CourseNotPending {
                    course_id: course_id.to_owned(),
                    status,
                }
                .into());
            }
            let total: u32 = tx.query_row(
                "SELECT COUNT(*) FROM chapters WHERE course_id = ?1",
                params![course_id],
                |row| row.get(0),
            )?;
            tracing::info!(course_id, total, "course already completed; nothing written");
            return Ok(CourseSummary {
                course_id: course_id.to_owned(),
                total_chapters: total as usize,
            });
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO chapters (id, course_id, title, content, video_urls, chapter_order)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for chapter in chapters {
                let video_urls =
                    serde_json::to_string(&chapter.video_urls).context("serialize video_urls")?;
                stmt.execute(params![
                    chapter.id,
                    course_id,
                    chapter.title,
                    chapter.content,
                    video_urls,
                    chapter.order,
                ])
                .with_context(|| format!("insert chapter {}", chapter.order))?;
            }
        }

        tx.commit().context("commit course completion")?;
        Ok(CourseSummary {
            course_id: course_id.to_owned(),
            total_chapters: chapters.len(),
        })
    }

    async fn set_active_chapter(
        &self,
        course_id: &str,
        user_id: &str,
        chapter_id: &str,
        order: u32,
    ) -> anyhow::Result<bool> {
        let conn = self.db.lock().await;
        let updated = conn
            .execute(
                "UPDATE courses SET active_chapter_id = ?3, active_chapter_order = ?4, updated_at = ?5
                 WHERE id = ?1 AND user_id = ?2
                   AND EXISTS (
                     SELECT 1 FROM chapters
                     WHERE id = ?3 AND course_id = ?1 AND chapter_order = ?4
                   )",
                params![course_id, user_id, chapter_id, order, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("update active chapter of course {course_id}"))?;
        Ok(updated > 0)
    }
}

/// Returns the id of the entry chapter when `chapters` is a complete set for
/// `course_id`: exactly [`CHAPTER_COUNT`] rows with orders `0..CHAPTER_COUNT`.
fn validate_chapter_set<'a>(course_id: &str, chapters: &'a [Chapter]) -> anyhow::Result<&'a str> {
    let invalid = |message: String| anyhow::Error::from(CourseGenError::InvalidChapterSet(message));

    if chapters.len() != CHAPTER_COUNT {
        return Err(invalid(format!(
            "expected {CHAPTER_COUNT} chapters, got {}",
            chapters.len()
        )));
    }
    if let Some(other) = chapters.iter().find(|c| c.course_id != course_id) {
        return Err(invalid(format!(
            "chapter {} belongs to course {}",
            other.order, other.course_id
        )));
    }

    let mut seen = [false; CHAPTER_COUNT];
    for chapter in chapters {
        let slot = seen
            .get_mut(chapter.order as usize)
            .ok_or_else(|| invalid(format!("chapter order {} out of range", chapter.order)))?;
        if *slot {
            return Err(invalid(format!("duplicate chapter order {}", chapter.order)));
        }
        *slot = true;
    }

    chapters
        .iter()
        .find(|c| c.order == 0)
        .map(|c| c.id.as_str())
        .ok_or_else(|| invalid("missing chapter with order 0".to_owned()))
}

struct RawCourse {
    id: String,
    user_id: String,
    title: String,
    description: String,
    status: String,
    image_url: Option<String>,
    active_chapter_id: Option<String>,
    active_chapter_order: Option<u32>,
    created_at: String,
    updated_at: String,
}

impl RawCourse {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            status: row.get(4)?,
            image_url: row.get(5)?,
            active_chapter_id: row.get(6)?,
            active_chapter_order: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_course(self) -> anyhow::Result<Course> {
        Ok(Course {
            status: CourseStatus::parse(&self.status)?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            id: self.id,
            user_id: self.user_id,
            title: self.title,
            description: self.description,
            image_url: self.image_url,
            active_chapter_id: self.active_chapter_id,
            active_chapter_order: self.active_chapter_order,
        })
    }
}

pub(crate) fn parse_timestamp(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("parse timestamp {raw:?}"))?
        .with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chapters_for(course_id: &str) -> Vec<Chapter> {
        (0..CHAPTER_COUNT as u32)
            .map(|order| Chapter {
                id: format!("{course_id}-ch{order}"),
                course_id: course_id.to_owned(),
                title: format!("Chapter {order}"),
                content: format!("# Chapter {order}\n"),
                video_urls: vec![format!("vid{order}")],
                order,
            })
            .collect()
    }

    async fn store_with_course(course_id: &str) -> anyhow::Result<SqliteCourseStore> {
        let store = SqliteCourseStore::new(Database::open_in_memory()?);
        store
            .create_pending(course_id, "user-1", "Intro to Rust", "Ownership and more.")
            .await?;
        Ok(store)
    }

    #[tokio::test]
    async fn complete_with_chapters_sets_entry_chapter() -> anyhow::Result<()> {
        let store = store_with_course("c1").await?;

        let summary = store
            .complete_with_chapters("c1", "https://img/1.jpg", &chapters_for("c1"))
            .await?;
        assert_eq!(summary.total_chapters, CHAPTER_COUNT);

        let course = store.get("c1").await?.unwrap();
        assert_eq!(course.status, CourseStatus::Completed);
        assert_eq!(course.image_url.as_deref(), Some("https://img/1.jpg"));
        assert_eq!(course.active_chapter_id.as_deref(), Some("c1-ch0"));
        assert_eq!(course.active_chapter_order, Some(0));

        let chapters = store.chapters("c1").await?;
        let orders: Vec<u32> = chapters.iter().map(|c| c.order).collect();
        assert_eq!(orders, (0..CHAPTER_COUNT as u32).collect::<Vec<_>>());
        assert_eq!(chapters[3].video_urls, vec!["vid3".to_owned()]);
        Ok(())
    }

    #[tokio::test]
    async fn completing_twice_does_not_duplicate_chapters() -> anyhow::Result<()> {
        let store = store_with_course("c1").await?;
        store
            .complete_with_chapters("c1", "https://img/1.jpg", &chapters_for("c1"))
            .await?;

        let mut fresh_ids = chapters_for("c1");
        for chapter in &mut fresh_ids {
            chapter.id.push_str("-retry");
        }
        let summary = store
            .complete_with_chapters("c1", "https://img/2.jpg", &fresh_ids)
            .await?;
        assert_eq!(summary.total_chapters, CHAPTER_COUNT);
        assert_eq!(store.chapters("c1").await?.len(), CHAPTER_COUNT);
        assert_eq!(
            store.get("c1").await?.unwrap().image_url.as_deref(),
            Some("https://img/1.jpg")
        );
        Ok(())
    }

    #[tokio::test]
    async fn failed_insert_rolls_back_course_update() -> anyhow::Result<()> {
        let store = store_with_course("c1").await?;
        store.create_pending("c2", "user-1", "Other", "Other course.").await?;
        store
            .complete_with_chapters("c2", "https://img/2.jpg", &chapters_for("c2"))
            .await?;

        // Chapter 5 reuses an id that already exists for c2.
        let mut colliding = chapters_for("c1");
        colliding[5].id = "c2-ch5".to_owned();
        let err = store
            .complete_with_chapters("c1", "https://img/1.jpg", &colliding)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("insert chapter 5"));

        let course = store.get("c1").await?.unwrap();
        assert_eq!(course.status, CourseStatus::Pending);
        assert_eq!(course.active_chapter_id, None);
        assert!(store.chapters("c1").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn rejects_incomplete_chapter_sets() -> anyhow::Result<()> {
        let store = store_with_course("c1").await?;

        let mut short = chapters_for("c1");
        short.pop();
        let err = store
            .complete_with_chapters("c1", "u", &short)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CourseGenError>(),
            Some(CourseGenError::InvalidChapterSet(_))
        ));

        let mut duplicate = chapters_for("c1");
        duplicate[7].order = 6;
        assert!(
            store
                .complete_with_chapters("c1", "u", &duplicate)
                .await
                .is_err()
        );

        assert_eq!(store.get("c1").await?.unwrap().status, CourseStatus::Pending);
        Ok(())
    }

    #[tokio::test]
    async fn mark_failed_never_overrides_completed() -> anyhow::Result<()> {
        let store = store_with_course("c1").await?;
        store
            .complete_with_chapters("c1", "https://img/1.jpg", &chapters_for("c1"))
            .await?;

        assert!(!store.mark_failed("c1").await?);
        assert_eq!(store.get("c1").await?.unwrap().status, CourseStatus::Completed);

        store.create_pending("c2", "user-1", "Other", "Other course.").await?;
        assert!(store.mark_failed("c2").await?);
        assert!(!store.mark_failed("c2").await?);
        assert_eq!(store.get("c2").await?.unwrap().status, CourseStatus::Failed);

        let err = store
            .complete_with_chapters("c2", "u", &chapters_for("c2"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CourseGenError>(),
            Some(CourseGenError::CourseNotPending { .. })
        ));
        assert!(store.chapters("c2").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn active_chapter_updates_are_owner_scoped() -> anyhow::Result<()> {
        let store = store_with_course("c1").await?;
        store
            .complete_with_chapters("c1", "https://img/1.jpg", &chapters_for("c1"))
            .await?;

        assert!(!store.set_active_chapter("c1", "intruder", "c1-ch2", 2).await?);
        assert!(!store.set_active_chapter("c1", "user-1", "c1-ch2", 3).await?);
        assert!(store.set_active_chapter("c1", "user-1", "c1-ch2", 2).await?);

        let course = store.get_for_user("c1", "user-1").await?.unwrap();
        assert_eq!(course.active_chapter_id.as_deref(), Some("c1-ch2"));
        assert_eq!(course.active_chapter_order, Some(2));
        assert!(store.get_for_user("c1", "intruder").await?.is_none());
        Ok(())
    }
}
