//! Run Controller: owner of the run state machine.
//!
//! The controller is the only writer of a run's `status`. It launches one
//! ingest pipeline per start/resume as a spawned task, waits for the
//! pipeline's outcome inside that task, and publishes the resulting status.
//! `cancel` publishes `cancelled` itself, immediately, and signals the
//! pipeline to tear down on its own.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{Instrument, info, instrument, warn};
use uuid::Uuid;

use super::pipeline::{IngestPipeline, PipelineOutcome};
use super::registry::{CancellationRegistry, ResumeContextRegistry, RunLease};
use crate::runs::domain::events::{cancelled_line, error_line};
use crate::runs::domain::run::{fields, format_timestamp};
use crate::runs::domain::{AgentRun, Decision, RunContext, RunStatus};
use crate::runs::error::OrchestratorError;
use crate::runs::persistence::{DATA_FIELD, EntryId, LogEntry, LogStore, MetadataStore, RunKeys};
use crate::runs::upstream::AgentService;

/// Parameters of a new run.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRun {
    pub workspace_id: String,
    pub persona: String,
    pub prompt: String,
    #[serde(default)]
    pub history: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub force_reset: bool,
    #[serde(default)]
    pub turn_id: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl std::fmt::Debug for StartRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartRun")
            .field("workspace_id", &self.workspace_id)
            .field("persona", &self.persona)
            .field("force_reset", &self.force_reset)
            .field("turn_id", &self.turn_id)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

/// Reply to `start` and `resume`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunAccepted {
    pub run_id: String,
    pub status: RunStatus,
}

#[derive(Debug)]
enum Launch {
    Start,
    Resume(Vec<Decision>),
}

#[derive(Debug, Clone)]
pub struct RunController {
    agent: Arc<dyn AgentService>,
    log: Arc<dyn LogStore>,
    meta: Arc<dyn MetadataStore>,
    keys: RunKeys,
    ttl: Duration,
    cancellations: Arc<CancellationRegistry>,
    contexts: Arc<ResumeContextRegistry>,
}

impl RunController {
    pub fn new(
        agent: Arc<dyn AgentService>,
        log: Arc<dyn LogStore>,
        meta: Arc<dyn MetadataStore>,
        keys: RunKeys,
        ttl: Duration,
    ) -> Self {
        Self {
            agent,
            log,
            meta,
            keys,
            ttl,
            cancellations: Arc::new(CancellationRegistry::new()),
            contexts: Arc::new(ResumeContextRegistry::new()),
        }
    }

    /// Mint a run, publish it as `queued` and launch its pipeline without
    /// waiting for it.
    #[instrument(
        skip(self, request),
        fields(
            persona = %request.persona,
            workspace_id = %request.workspace_id,
            run_id = tracing::field::Empty
        )
    )]
    pub async fn start(&self, request: StartRun) -> Result<RunAccepted, OrchestratorError> {
        if request.workspace_id.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest("workspaceId is required".into()));
        }
        if request.persona.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest("persona is required".into()));
        }

        let run_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("run_id", run_id.as_str());

        // A fresh id should have nothing stored, but never inherit leftovers.
        self.log.clear(&self.keys.stream(&run_id)).await?;
        self.meta.clear(&self.keys.meta(&run_id)).await?;

        self.write_meta(
            &run_id,
            &[
                (fields::STATUS, RunStatus::Queued.as_str().to_string()),
                (fields::WORKSPACE_ID, request.workspace_id.clone()),
                (fields::PERSONA, request.persona.clone()),
                (fields::CREATED_AT, format_timestamp(Utc::now())),
                (fields::TURN_ID, request.turn_id.clone().unwrap_or_default()),
                (fields::STARTED_AT, String::new()),
                (fields::COMPLETED_AT, String::new()),
                (fields::ERROR, String::new()),
                (fields::PENDING_INTERRUPT, String::new()),
            ],
        )
        .await?;

        let ctx = RunContext {
            workspace_id: request.workspace_id,
            persona: request.persona,
            prompt: request.prompt,
            history: request.history,
            force_reset: request.force_reset,
            credential: request.credential,
        };
        self.contexts.insert(&run_id, ctx.clone());
        let lease = self.cancellations.register(&run_id);
        self.spawn(run_id.clone(), lease, ctx, Launch::Start);

        info!(name: "run.started", run_id = %run_id, "Run queued");
        Ok(RunAccepted {
            run_id,
            status: RunStatus::Queued,
        })
    }

    /// Continue a paused run with the caller's decisions, in order.
    #[instrument(skip(self, decisions), fields(decisions = decisions.len()))]
    pub async fn resume(
        &self,
        run_id: &str,
        decisions: Vec<Decision>,
    ) -> Result<RunAccepted, OrchestratorError> {
        let ctx = self
            .contexts
            .get(run_id)
            .ok_or_else(|| OrchestratorError::RunContextMissing(run_id.to_string()))?;

        // Claiming the lease first keeps a second resume (or a still-live
        // invocation) from racing this one.
        let Some(lease) = self.cancellations.register_if_idle(run_id) else {
            let status = self.current_status(run_id).await.unwrap_or(RunStatus::Running);
            return Err(OrchestratorError::NotResumable {
                run_id: run_id.to_string(),
                status,
            });
        };

        let queued = async {
            match self.status(run_id).await? {
                Some(run) if run.status == RunStatus::AwaitingApproval => {}
                Some(run) if !run.status.is_terminal() => {
                    return Err(OrchestratorError::NotResumable {
                        run_id: run_id.to_string(),
                        status: run.status,
                    });
                }
                // Settled (possibly by another process) or expired.
                _ => {
                    self.contexts.remove(run_id);
                    return Err(OrchestratorError::RunContextMissing(run_id.to_string()));
                }
            }
            self.write_meta(
                run_id,
                &[
                    (fields::STATUS, RunStatus::Queued.as_str().to_string()),
                    (fields::PENDING_INTERRUPT, String::new()),
                ],
            )
            .await
        };
        if let Err(err) = queued.await {
            self.cancellations.release(run_id, lease.epoch);
            return Err(err);
        }

        self.spawn(run_id.to_string(), lease, ctx, Launch::Resume(decisions));

        info!(name: "run.resumed", "Run re-queued with decisions");
        Ok(RunAccepted {
            run_id: run_id.to_string(),
            status: RunStatus::Queued,
        })
    }

    /// Request cancellation. Idempotent; a run that already reached a
    /// terminal status is left as it is.
    #[instrument(skip(self))]
    pub async fn cancel(&self, run_id: &str) -> Result<(), OrchestratorError> {
        if let Some(lease) = self.cancellations.get(run_id) {
            let _status = lease.status_lock.lock().await;
            if self.cancellations.is_current(run_id, lease.epoch) {
                if lease.token.is_cancelled() {
                    return Ok(());
                }
                lease.token.cancel();
                self.contexts.remove(run_id);
                self.publish_cancelled(run_id).await?;
                info!(name: "run.cancel_requested", "Cancellation signalled to live pipeline");
                return Ok(());
            }
        }

        // No live pipeline: the run is paused, finished, unknown, or was
        // started by a process that no longer holds it.
        self.contexts.remove(run_id);
        let Some(run) = self.status(run_id).await? else {
            return Ok(());
        };
        if run.status.is_terminal() {
            return Ok(());
        }
        // The line goes first so a tail that sees `cancelled` finds it.
        self.append_line(run_id, &cancelled_line()).await;
        self.publish_cancelled(run_id).await?;
        info!(name: "run.cancel_requested", previous = %run.status, "Idle run cancelled");
        Ok(())
    }

    /// Current status snapshot, `None` when missing or expired.
    pub async fn status(&self, run_id: &str) -> Result<Option<AgentRun>, OrchestratorError> {
        let map = self.meta.get_all_fields(&self.keys.meta(run_id)).await?;
        Ok(AgentRun::from_fields(run_id, &map))
    }

    /// Replay a run's log after `after`, oldest first.
    pub async fn events(
        &self,
        run_id: &str,
        after: Option<EntryId>,
        limit: usize,
    ) -> Result<Vec<LogEntry>, OrchestratorError> {
        Ok(self
            .log
            .read(&self.keys.stream(run_id), after, limit)
            .await?)
    }

    /// Whether this process can still resume `run_id`.
    pub fn has_context(&self, run_id: &str) -> bool {
        self.contexts.contains(run_id)
    }

    /// Whether a pipeline of `run_id` is registered as live.
    pub fn has_live_pipeline(&self, run_id: &str) -> bool {
        self.cancellations.get(run_id).is_some()
    }

    fn spawn(&self, run_id: String, lease: RunLease, ctx: RunContext, launch: Launch) {
        let controller = self.clone();
        let span = tracing::info_span!("run", run_id = %run_id, persona = %ctx.persona);
        tokio::spawn(
            async move { controller.drive(run_id, lease, ctx, launch).await }.instrument(span),
        );
    }

    async fn drive(self, run_id: String, lease: RunLease, ctx: RunContext, launch: Launch) {
        let first_start = matches!(launch, Launch::Start);
        self.mark_running(&run_id, &lease, first_start).await;

        let pipeline = IngestPipeline::new(
            Arc::clone(&self.log),
            self.keys.stream(&run_id),
            self.ttl,
            lease.token.clone(),
        );
        let agent = Arc::clone(&self.agent);
        let token = lease.token.clone();

        // The pipeline runs in its own task so a panic inside it still ends
        // in a published status.
        let task = tokio::spawn(
            async move {
                match launch {
                    Launch::Start => pipeline.run(agent.open_stream(&ctx, &token)).await,
                    Launch::Resume(decisions) => {
                        pipeline
                            .run(agent.open_resume_stream(&ctx, &decisions, &token))
                            .await
                    }
                }
            }
            .in_current_span(),
        );

        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(err) if lease.token.is_cancelled() => {
                warn!(error = %err, "Run pipeline aborted after cancellation");
                PipelineOutcome::Cancelled
            }
            Err(err) => {
                let error = format!("Run pipeline aborted: {err}");
                tracing::error!(error = %error, "Run pipeline aborted");
                self.append_line(&run_id, &error_line(&error)).await;
                PipelineOutcome::Failed { error }
            }
        };

        self.finalize(&run_id, &lease, outcome).await;
    }

    async fn mark_running(&self, run_id: &str, lease: &RunLease, first_start: bool) {
        let _status = lease.status_lock.lock().await;
        if lease.token.is_cancelled() || !self.may_publish(run_id, RunStatus::Running).await {
            return;
        }
        let mut update = vec![(fields::STATUS, RunStatus::Running.as_str().to_string())];
        if first_start {
            update.push((fields::STARTED_AT, format_timestamp(Utc::now())));
        }
        match self.write_meta(run_id, &update).await {
            Ok(()) => info!(name: "run.running", "Run consuming agent stream"),
            Err(err) => warn!(error = %err, "Failed to publish running status"),
        }
    }

    async fn finalize(&self, run_id: &str, lease: &RunLease, outcome: PipelineOutcome) {
        let _status = lease.status_lock.lock().await;

        if lease.token.is_cancelled() {
            // cancel() already published `cancelled` and dropped the context.
            self.cancellations.release(run_id, lease.epoch);
            info!(name: "run.finished", status = %RunStatus::Cancelled, "Run finished");
            return;
        }

        let now = format_timestamp(Utc::now());
        let (status, update) = match outcome {
            PipelineOutcome::Completed => (
                RunStatus::Completed,
                vec![
                    (fields::STATUS, RunStatus::Completed.as_str().to_string()),
                    (fields::COMPLETED_AT, now),
                    (fields::PENDING_INTERRUPT, String::new()),
                ],
            ),
            PipelineOutcome::Failed { error } => (
                RunStatus::Failed,
                vec![
                    (fields::STATUS, RunStatus::Failed.as_str().to_string()),
                    (fields::COMPLETED_AT, now),
                    (fields::ERROR, error),
                    (fields::PENDING_INTERRUPT, String::new()),
                ],
            ),
            PipelineOutcome::AwaitingApproval { interrupt } => (
                RunStatus::AwaitingApproval,
                vec![
                    (fields::STATUS, RunStatus::AwaitingApproval.as_str().to_string()),
                    (fields::PENDING_INTERRUPT, interrupt),
                ],
            ),
            PipelineOutcome::Cancelled => (
                RunStatus::Cancelled,
                vec![
                    (fields::STATUS, RunStatus::Cancelled.as_str().to_string()),
                    (fields::COMPLETED_AT, now),
                    (fields::PENDING_INTERRUPT, String::new()),
                ],
            ),
        };

        if !self.may_publish(run_id, status).await {
            // Another process settled the run first; its status stands.
            self.contexts.remove(run_id);
            self.cancellations.release(run_id, lease.epoch);
            warn!(outcome = %status, "Run outcome discarded");
            return;
        }

        if status.is_terminal() {
            self.contexts.remove(run_id);
        }
        if let Err(err) = self.write_meta(run_id, &update).await {
            tracing::error!(error = %err, status = %status, "Failed to publish run status");
        }
        self.cancellations.release(run_id, lease.epoch);

        info!(name: "run.finished", status = %status, "Run finished");
    }

    async fn current_status(&self, run_id: &str) -> Option<RunStatus> {
        match self.status(run_id).await {
            Ok(run) => run.map(|run| run.status),
            Err(err) => {
                warn!(error = %err, "Could not read run status");
                None
            }
        }
    }

    /// Whether the stored status may move to `next`. A status that cannot be
    /// read does not block the write.
    async fn may_publish(&self, run_id: &str, next: RunStatus) -> bool {
        match self.current_status(run_id).await {
            Some(current) => current.can_transition_to(next),
            None => true,
        }
    }

    async fn publish_cancelled(&self, run_id: &str) -> Result<(), OrchestratorError> {
        self.write_meta(
            run_id,
            &[
                (fields::STATUS, RunStatus::Cancelled.as_str().to_string()),
                (fields::COMPLETED_AT, format_timestamp(Utc::now())),
                (fields::PENDING_INTERRUPT, String::new()),
            ],
        )
        .await
    }

    async fn write_meta(
        &self,
        run_id: &str,
        update: &[(&str, String)],
    ) -> Result<(), OrchestratorError> {
        let key = self.keys.meta(run_id);
        self.meta.set_fields(&key, update).await?;
        self.meta.set_expiry(&key, self.ttl).await?;
        Ok(())
    }

    async fn append_line(&self, run_id: &str, line: &str) {
        let key = self.keys.stream(run_id);
        let appended = async {
            self.log.append(&key, &[(DATA_FIELD, line)]).await?;
            self.log.set_expiry(&key, self.ttl).await
        };
        if let Err(err) = appended.await {
            tracing::error!(error = %err, "Failed to append run log line");
        }
    }
}
