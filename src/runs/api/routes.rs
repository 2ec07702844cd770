use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::runs::domain::{AgentRun, Decision, RunStatus};
use crate::runs::error::OrchestratorError;
use crate::runs::persistence::{EntryId, LogEntry};
use crate::runs::runtime::{RunController, StartRun};
use crate::runs::security::claims::BearerCredential;

const DEFAULT_PAGE: usize = 100;
const MAX_PAGE: usize = 1000;

pub fn build_router() -> Router<RunController> {
    Router::new()
        .route("/runs", post(start_run))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/resume", post(resume_run))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/runs/{id}/events", get(list_events))
}

async fn start_run(
    State(controller): State<RunController>,
    bearer: Option<Extension<BearerCredential>>,
    Json(mut request): Json<StartRun>,
) -> Result<impl IntoResponse, OrchestratorError> {
    // The caller's own token wins over a credential in the body.
    if let Some(Extension(BearerCredential(token))) = bearer {
        request.credential = Some(token);
    }
    let accepted = controller.start(request).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

#[derive(Debug, Deserialize)]
struct ResumeRequest {
    #[serde(default)]
    decisions: Vec<Decision>,
}

async fn resume_run(
    State(controller): State<RunController>,
    Path(run_id): Path<String>,
    Json(req): Json<ResumeRequest>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let accepted = controller.resume(&run_id, req.decisions).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn cancel_run(
    State(controller): State<RunController>,
    Path(run_id): Path<String>,
) -> Result<StatusCode, OrchestratorError> {
    controller.cancel(&run_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_run(
    State(controller): State<RunController>,
    Path(run_id): Path<String>,
) -> Result<Json<AgentRun>, OrchestratorError> {
    controller
        .status(&run_id)
        .await?
        .map(Json)
        .ok_or(OrchestratorError::NotFound(run_id))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    after: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventEntry {
    pub id: String,
    pub data: String,
}

impl From<LogEntry> for EventEntry {
    fn from(entry: LogEntry) -> Self {
        Self {
            id: entry.id.to_string(),
            data: entry.data().unwrap_or_default().to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventsPage {
    pub entries: Vec<EventEntry>,
    pub status: RunStatus,
}

async fn list_events(
    State(controller): State<RunController>,
    Path(run_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventsPage>, OrchestratorError> {
    let after = query
        .after
        .as_deref()
        .filter(|raw| !raw.is_empty())
        .map(str::parse::<EntryId>)
        .transpose()
        .map_err(|err| OrchestratorError::InvalidRequest(format!("after: {err}")))?;
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);

    let run = controller
        .status(&run_id)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(run_id.clone()))?;
    let entries = controller.events(&run_id, after, limit).await?;

    Ok(Json(EventsPage {
        entries: entries.into_iter().map(EventEntry::from).collect(),
        status: run.status,
    }))
}
