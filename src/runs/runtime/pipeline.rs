//! Stream ingest: upstream bytes in, ordered log entries and an outcome out.
//!
//! Lines are appended to the run's log strictly in arrival order, one at a
//! time, and inspected for the two structurally significant event shapes. The
//! pipeline never writes run status; it reports a [`PipelineOutcome`] and the
//! controller publishes it.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::framer::LineFramer;
use crate::runs::domain::events::{cancelled_line, error_line};
use crate::runs::domain::{LineKind, classify_line};
use crate::runs::persistence::{DATA_FIELD, LogStore, StoreError};
use crate::runs::upstream::{AgentServiceError, ByteStream};

/// How one pipeline invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    AwaitingApproval { interrupt: String },
    Failed { error: String },
    Cancelled,
}

/// Classification state accumulated over one invocation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Markers {
    /// Last interrupt line seen; later interrupts overwrite earlier ones.
    pub interrupt: Option<String>,
    /// First contract-error message seen; sticky.
    pub contract_error: Option<String>,
}

impl Markers {
    pub fn observe(&mut self, kind: LineKind) {
        match kind {
            LineKind::Interrupt(line) => self.interrupt = Some(line),
            LineKind::ContractError(message) => {
                self.contract_error.get_or_insert(message);
            }
            LineKind::Opaque => {}
        }
    }

    /// Outcome at clean end-of-stream. Cancellation beats a contract error,
    /// which beats an interrupt.
    pub fn outcome(self, cancelled: bool) -> PipelineOutcome {
        if cancelled {
            PipelineOutcome::Cancelled
        } else if let Some(error) = self.contract_error {
            PipelineOutcome::Failed { error }
        } else if let Some(interrupt) = self.interrupt {
            PipelineOutcome::AwaitingApproval { interrupt }
        } else {
            PipelineOutcome::Completed
        }
    }
}

/// Ingests one upstream stream into one run's log.
#[derive(Debug)]
pub struct IngestPipeline {
    log: Arc<dyn LogStore>,
    stream_key: String,
    ttl: Duration,
    cancel: CancellationToken,
}

impl IngestPipeline {
    pub fn new(
        log: Arc<dyn LogStore>,
        stream_key: String,
        ttl: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            log,
            stream_key,
            ttl,
            cancel,
        }
    }

    /// Drive `open` to an upstream stream and ingest it until it ends, fails,
    /// or the run is cancelled.
    pub async fn run<F>(self, open: F) -> PipelineOutcome
    where
        F: Future<Output = Result<ByteStream, AgentServiceError>>,
    {
        let opened = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return self.cancelled().await,
            opened = open => opened,
        };
        let stream = match opened {
            Ok(stream) => stream,
            Err(AgentServiceError::Cancelled) => return self.cancelled().await,
            Err(err) => {
                tracing::warn!(stream = %self.stream_key, error = %err, "Agent stream could not be opened");
                return self.upstream_failed(&err.to_string()).await;
            }
        };
        self.ingest(stream).await
    }

    async fn ingest(self, mut stream: ByteStream) -> PipelineOutcome {
        let mut framer = LineFramer::new();
        let mut markers = Markers::default();

        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                next = stream.next() => Some(next),
            };
            let Some(next) = next else {
                // Dropping the stream closes the upstream connection.
                drop(stream);
                return self.cancelled().await;
            };

            match next {
                Some(Ok(chunk)) => {
                    framer.push(&chunk);
                    while let Some(line) = framer.next_line() {
                        if let Err(err) = self.ingest_line(&line, &mut markers).await {
                            return self.store_failed(&err).await;
                        }
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!(stream = %self.stream_key, error = %err, "Agent stream interrupted");
                    return self.upstream_failed(&err.to_string()).await;
                }
                None => break,
            }
        }

        if let Some(line) = framer.finish() {
            if let Err(err) = self.ingest_line(&line, &mut markers).await {
                return self.store_failed(&err).await;
            }
        }

        let outcome = markers.outcome(self.cancel.is_cancelled());
        if outcome == PipelineOutcome::Cancelled {
            self.append_terminal(&cancelled_line()).await;
        }
        outcome
    }

    async fn ingest_line(&self, line: &str, markers: &mut Markers) -> Result<(), StoreError> {
        self.append(line).await?;
        markers.observe(classify_line(line));
        Ok(())
    }

    async fn append(&self, line: &str) -> Result<(), StoreError> {
        self.log.append(&self.stream_key, &[(DATA_FIELD, line)]).await?;
        self.log.set_expiry(&self.stream_key, self.ttl).await
    }

    /// Best-effort append of a synthetic terminal line.
    async fn append_terminal(&self, line: &str) {
        if let Err(err) = self.append(line).await {
            tracing::error!(stream = %self.stream_key, error = %err, "Failed to append terminal log line");
        }
    }

    async fn cancelled(&self) -> PipelineOutcome {
        self.append_terminal(&cancelled_line()).await;
        PipelineOutcome::Cancelled
    }

    async fn upstream_failed(&self, message: &str) -> PipelineOutcome {
        if self.cancel.is_cancelled() {
            return self.cancelled().await;
        }
        self.append_terminal(&error_line(message)).await;
        PipelineOutcome::Failed {
            error: message.to_string(),
        }
    }

    async fn store_failed(&self, err: &StoreError) -> PipelineOutcome {
        tracing::error!(stream = %self.stream_key, error = %err, "Run log append failed");
        self.upstream_failed(&format!("Failed to record run output: {err}"))
            .await
    }
}
