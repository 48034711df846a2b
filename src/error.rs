use crate::app::model::CourseStatus;

/// Failures that callers branch on. They travel inside `anyhow::Error` and are
/// recovered with `downcast_ref`.
#[derive(Debug, thiserror::Error)]
pub enum CourseGenError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("outline returned {actual} chapter titles, expected {expected}")]
    MalformedOutline { expected: usize, actual: usize },

    #[error("step `{step}` failed after {attempts} attempt(s): {last_error}")]
    StepExhausted {
        step: String,
        attempts: u32,
        last_error: String,
    },

    #[error("course not found: {0}")]
    CourseNotFound(String),

    #[error("course {course_id} is {status}, expected pending")]
    CourseNotPending {
        course_id: String,
        status: CourseStatus,
    },

    #[error("invalid chapter set: {0}")]
    InvalidChapterSet(String),

    #[error("run {run_id} previously failed: {message}")]
    RunPreviouslyFailed { run_id: String, message: String },
}
