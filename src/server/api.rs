//! HTTP surface over the coordinator. Every body is JSON, wrapped in
//! `{"data": ...}` on success and `{"error": {...}}` on failure.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tracing::debug;

use super::coordinator::Coordinator;
use super::types::{
    CancelReceipt, CostReceipt, CostReport, Envelope, ErrorBody, ErrorEnvelope, HealthReport,
    JobResult, JobStatus, QueueSnapshot, SubmitReceipt,
};
use crate::error::RunlaneError;
use crate::state_machine::JobSpec;

type ApiResult<T> = Result<Json<Envelope<T>>, RunlaneError>;

fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(Envelope { data }))
}

impl RunlaneError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RunlaneError::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RunlaneError::JobNotFound(_) => StatusCode::NOT_FOUND,
            RunlaneError::NotReady { .. }
            | RunlaneError::AlreadyTerminal { .. }
            | RunlaneError::InvalidTransition { .. } => StatusCode::CONFLICT,
            RunlaneError::UnknownFramework(_) | RunlaneError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RunlaneError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            error: ErrorBody {
                code: self.code().to_string(),
                message: self.to_string(),
            },
        };
        (self.status_code(), Json(body)).into_response()
    }
}

pub fn router(coordinator: Coordinator) -> Router {
    let routes = Router::new()
        .route("/jobs", post(submit_job))
        .route("/jobs/{id}", get(job_status).delete(cancel_job))
        .route("/jobs/{id}/result", get(job_result))
        .route("/jobs/{id}/cost", post(report_cost))
        .route("/health", get(health))
        .route("/queue", get(queue));

    Router::new()
        .nest("/api/v1", routes)
        .fallback(fallback)
        .with_state(coordinator)
}

async fn fallback() -> Response {
    let body = ErrorEnvelope {
        error: ErrorBody {
            code: "not_found".to_string(),
            message: "no such route".to_string(),
        },
    };
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

fn rejected(rejection: JsonRejection) -> RunlaneError {
    RunlaneError::InvalidRequest(rejection.body_text())
}

async fn submit_job(
    State(coordinator): State<Coordinator>,
    payload: Result<Json<JobSpec>, JsonRejection>,
) -> ApiResult<SubmitReceipt> {
    let Json(spec) = payload.map_err(rejected)?;
    debug!(target = %spec.target, framework = %spec.framework, "submit request");
    ok(coordinator.submit(spec)?)
}

async fn job_status(
    State(coordinator): State<Coordinator>,
    Path(id): Path<String>,
) -> ApiResult<JobStatus> {
    ok(coordinator.status(&id)?)
}

async fn job_result(
    State(coordinator): State<Coordinator>,
    Path(id): Path<String>,
) -> ApiResult<JobResult> {
    ok(coordinator.result(&id)?)
}

async fn cancel_job(
    State(coordinator): State<Coordinator>,
    Path(id): Path<String>,
) -> ApiResult<CancelReceipt> {
    debug!(job_id = %id, "cancel request");
    ok(coordinator.cancel(&id)?)
}

async fn report_cost(
    State(coordinator): State<Coordinator>,
    Path(id): Path<String>,
    payload: Result<Json<CostReport>, JsonRejection>,
) -> ApiResult<CostReceipt> {
    let Json(report) = payload.map_err(rejected)?;
    ok(coordinator.report_cost(&id, report.amount)?)
}

async fn health(State(coordinator): State<Coordinator>) -> Json<Envelope<HealthReport>> {
    Json(Envelope {
        data: coordinator.health(),
    })
}

async fn queue(State(coordinator): State<Coordinator>) -> Json<Envelope<QueueSnapshot>> {
    Json(Envelope {
        data: coordinator.queue(),
    })
}
