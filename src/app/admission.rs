use serde::Deserialize;

use crate::app::course_store::CourseStore;
use crate::app::model::{Course, GenerateCourse};
use crate::error::CourseGenError;

const TITLE_LEN: (usize, usize) = (3, 200);
const DESCRIPTION_LEN: (usize, usize) = (10, 1000);

/// Body of a course creation request.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateCourseRequest {
    pub title: String,
    pub description: String,
}

impl GenerateCourseRequest {
    /// Trims both fields and checks their lengths. Every violation is reported
    /// in one message.
    pub fn validate(self) -> anyhow::Result<Self> {
        let title = self.title.trim().to_owned();
        let description = self.description.trim().to_owned();

        let mut problems = Vec::new();
        check_length(&mut problems, "Title", &title, TITLE_LEN);
        check_length(&mut problems, "Description", &description, DESCRIPTION_LEN);
        if !problems.is_empty() {
            return Err(CourseGenError::InvalidRequest(problems.join(", ")).into());
        }

        Ok(Self { title, description })
    }
}

fn check_length(
    problems: &mut Vec<String>,
    field: &str,
    value: &str,
    (min, max): (usize, usize),
) {
    let len = value.chars().count();
    if len < min {
        problems.push(format!("{field} must be at least {min} characters"));
    } else if len > max {
        problems.push(format!("{field} must be at most {max} characters"));
    }
}

/// Validates the request, stores a pending course and returns the event that
/// starts its generation. The caller dispatches the event.
pub async fn create_pending(
    courses: &dyn CourseStore,
    user_id: &str,
    request: GenerateCourseRequest,
) -> anyhow::Result<(Course, GenerateCourse)> {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        return Err(CourseGenError::InvalidRequest("user id is required".to_owned()).into());
    }
    let request = request.validate()?;

    let course_id = uuid::Uuid::new_v4().to_string();
    let course = courses
        .create_pending(&course_id, user_id, &request.title, &request.description)
        .await?;
    tracing::info!(course_id = %course.id, user_id, "course admitted");

    let event = GenerateCourse {
        course_id: course.id.clone(),
        title: course.title.clone(),
        description: course.description.clone(),
        user_id: course.user_id.clone(),
    };
    Ok((course, event))
}
