//! HTTP surface of `coursegen-app`.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::app::admission::{self, GenerateCourseRequest};
use crate::app::course_store::CourseStore;
use crate::app::dispatcher::EventDispatcher;
use crate::app::model::{Chapter, Course, InboundEvent};
use crate::error::CourseGenError;

pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub courses: Arc<dyn CourseStore>,
    /// Where admitted events go: this process or a remote worker.
    pub dispatcher: Arc<dyn EventDispatcher>,
    /// Runs events in this process. Target of `/internal/runs`.
    pub executor: Arc<dyn EventDispatcher>,
    /// Bearer token for `/internal/runs`. The route is disabled without one.
    pub internal_token: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok\n" }))
        .route("/api/events", post(receive_event))
        .route("/api/courses", post(create_course).get(list_courses))
        .route("/api/courses/:course_id", get(get_course))
        .route(
            "/api/courses/:course_id/active-chapter",
            put(set_active_chapter),
        )
        .route("/internal/runs/:course_id", post(run_internal))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

type ApiError = (StatusCode, String);

fn api_error(err: anyhow::Error) -> ApiError {
    let status = match err.downcast_ref::<CourseGenError>() {
        Some(CourseGenError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
        Some(CourseGenError::CourseNotFound(_)) => StatusCode::NOT_FOUND,
        Some(CourseGenError::CourseNotPending { .. }) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %format!("{err:#}"), "request failed");
    }
    (status, format!("{err:#}"))
}

fn user_id(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                format!("{USER_ID_HEADER} header is required"),
            )
        })
}

async fn receive_event(
    State(state): State<AppState>,
    Json(event): Json<InboundEvent>,
) -> Result<StatusCode, ApiError> {
    let event = event
        .into_generate_course()
        .map_err(|err| (StatusCode::BAD_REQUEST, format!("{err:#}")))?;
    state.dispatcher.dispatch(&event).await.map_err(|err| {
        (
            StatusCode::BAD_GATEWAY,
            format!("dispatch failed: {err:#}"),
        )
    })?;
    Ok(StatusCode::ACCEPTED)
}

async fn create_course(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<GenerateCourseRequest>,
) -> Result<(StatusCode, Json<Course>), ApiError> {
    let user_id = user_id(&headers)?;
    let (course, event) = admission::create_pending(state.courses.as_ref(), &user_id, request)
        .await
        .map_err(api_error)?;

    if let Err(err) = state.dispatcher.dispatch(&event).await {
        tracing::error!(course_id = %course.id, error = %format!("{err:#}"), "dispatch failed");
        if let Err(mark_err) = state.courses.mark_failed(&course.id).await {
            tracing::warn!(course_id = %course.id, error = %format!("{mark_err:#}"), "failed to mark undispatched course failed");
        }
        return Err((
            StatusCode::BAD_GATEWAY,
            format!("dispatch failed: {err:#}"),
        ));
    }

    Ok((StatusCode::ACCEPTED, Json(course)))
}

async fn list_courses(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Course>>, ApiError> {
    let user_id = user_id(&headers)?;
    let courses = state
        .courses
        .list_for_user(&user_id)
        .await
        .map_err(api_error)?;
    Ok(Json(courses))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CourseDetail {
    #[serde(flatten)]
    course: Course,
    chapters: Vec<Chapter>,
}

async fn get_course(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(course_id): Path<String>,
) -> Result<Response, ApiError> {
    let user_id = user_id(&headers)?;
    let Some(course) = state
        .courses
        .get_for_user(&course_id, &user_id)
        .await
        .map_err(api_error)?
    else {
        return Err((StatusCode::NOT_FOUND, format!("course not found: {course_id}")));
    };
    let chapters = state.courses.chapters(&course.id).await.map_err(api_error)?;
    Ok(Json(CourseDetail { course, chapters }).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveChapterRequest {
    chapter_id: String,
    order: u32,
}

async fn set_active_chapter(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(course_id): Path<String>,
    Json(body): Json<ActiveChapterRequest>,
) -> Result<StatusCode, ApiError> {
    let user_id = user_id(&headers)?;
    let updated = state
        .courses
        .set_active_chapter(&course_id, &user_id, &body.chapter_id, body.order)
        .await
        .map_err(api_error)?;
    if !updated {
        return Err((
            StatusCode::NOT_FOUND,
            "course or chapter not found".to_owned(),
        ));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn run_internal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(course_id): Path<String>,
    Json(event): Json<InboundEvent>,
) -> Result<StatusCode, ApiError> {
    let Some(expected) = state.internal_token.as_deref() else {
        return Err((StatusCode::NOT_FOUND, "not found".to_owned()));
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    if presented != Some(expected) {
        return Err((StatusCode::UNAUTHORIZED, "invalid bearer token".to_owned()));
    }
    let event = event
        .into_generate_course()
        .map_err(|err| (StatusCode::BAD_REQUEST, format!("{err:#}")))?;
    if event.course_id != course_id {
        return Err((
            StatusCode::BAD_REQUEST,
            format!(
                "course id mismatch: path {course_id}, body {}",
                event.course_id
            ),
        ));
    }

    state.executor.dispatch(&event).await.map_err(api_error)?;
    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_map_to_client_statuses() {
        let (status, _) = api_error(CourseGenError::InvalidRequest("bad".to_owned()).into());
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = api_error(CourseGenError::CourseNotFound("c1".to_owned()).into());
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = api_error(anyhow::anyhow!("disk full"));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn user_id_header_is_required() {
        let mut headers = HeaderMap::new();
        assert_eq!(user_id(&headers).unwrap_err().0, StatusCode::UNAUTHORIZED);
        headers.insert(USER_ID_HEADER, " u1 ".parse().unwrap());
        assert_eq!(user_id(&headers).unwrap(), "u1");
    }
}
