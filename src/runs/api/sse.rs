//! Live tail of a run's log as Server-Sent Events.
//!
//! Any number of clients may follow a run, including from other processes:
//! everything comes from the stores, never from the pipeline itself.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    Router,
    extract::{Path, State},
    http::HeaderMap,
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
    routing::get,
};
use futures::Stream;

use crate::runs::domain::RunStatus;
use crate::runs::domain::events::is_cancelled_line;
use crate::runs::error::OrchestratorError;
use crate::runs::persistence::EntryId;
use crate::runs::runtime::RunController;

const PAGE: usize = 256;
const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Polls spent waiting for a live pipeline's `cancelled` line after the
/// status already reads `cancelled`.
const CANCEL_GRACE_POLLS: u32 = 4;

pub fn build_router() -> Router<RunController> {
    Router::new().route("/runs/{id}/stream", get(stream_run))
}

async fn stream_run(
    State(controller): State<RunController>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, OrchestratorError> {
    if controller.status(&run_id).await?.is_none() {
        return Err(OrchestratorError::NotFound(run_id));
    }
    // Reconnecting clients continue after the last entry they saw.
    let after = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<EntryId>().ok());

    Ok(Sse::new(tail(controller, run_id, after))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

/// Whether a tail can stop once the log is drained.
fn settled(status: RunStatus) -> bool {
    status.is_terminal() || status == RunStatus::AwaitingApproval
}

fn tail(
    controller: RunController,
    run_id: String,
    mut after: Option<EntryId>,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    async_stream::stream! {
        let mut saw_cancelled = false;
        let mut grace = CANCEL_GRACE_POLLS;
        loop {
            // Status is read before the log. A pipeline writes all its lines
            // before publishing its outcome, and an idle cancel appends its
            // line first. Only a live cancel publishes `cancelled` ahead of
            // the pipeline's line, which the grace polls below cover.
            let status = match controller.status(&run_id).await {
                Ok(run) => run.map(|r| r.status),
                Err(err) => {
                    tracing::warn!(run_id = %run_id, error = %err, "Run tail aborted");
                    yield Ok(Event::default().event("error").data(err.to_string()));
                    break;
                }
            };
            let entries = match controller.events(&run_id, after, PAGE).await {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::warn!(run_id = %run_id, error = %err, "Run tail aborted");
                    yield Ok(Event::default().event("error").data(err.to_string()));
                    break;
                }
            };

            let drained = entries.len() < PAGE;
            for entry in entries {
                after = Some(entry.id);
                let data = entry.data().unwrap_or_default();
                saw_cancelled |= is_cancelled_line(data);
                yield Ok(Event::default()
                    .id(entry.id.to_string())
                    .event("message")
                    .data(data));
            }

            if drained {
                match status {
                    // Expired or removed mid-tail.
                    None => {
                        yield Ok(Event::default().event("done").data("expired"));
                        break;
                    }
                    Some(RunStatus::Cancelled) if !saw_cancelled && grace > 0 => {
                        grace -= 1;
                        tokio::time::sleep(POLL_INTERVAL).await;
                    }
                    Some(status) if settled(status) => {
                        yield Ok(Event::default().event("done").data(status.as_str()));
                        break;
                    }
                    Some(_) => tokio::time::sleep(POLL_INTERVAL).await,
                }
            }
        }
    }
}
