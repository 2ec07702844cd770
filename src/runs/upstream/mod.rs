//! Client contract for the Agent Execution Service.
//!
//! The service runs the agent task and answers with a byte stream of NDJSON
//! events. Opening a stream is bound to the run's cancellation token so a
//! cancel that arrives while the connection is still being set up aborts it.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::runs::domain::{Decision, RunContext};

pub mod http;

pub use http::HttpAgentService;

/// Chunked upstream response body.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, AgentServiceError>> + Send>>;

/// Failures talking to the Agent Execution Service.
#[derive(Debug, thiserror::Error)]
pub enum AgentServiceError {
    /// No agent is configured under the requested persona.
    #[error("Agent '{0}' not found")]
    AgentNotFound(String),

    /// The service could not be reached.
    #[error("Agent service unavailable: {0}")]
    Unavailable(String),

    /// The service answered the initial request with an error status.
    #[error("Agent service returned {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The connection failed after the stream was established.
    #[error("Agent stream interrupted: {0}")]
    Stream(String),

    /// The request was abandoned because the run was cancelled.
    #[error("Agent request cancelled")]
    Cancelled,

    #[error("Invalid agent service configuration: {0}")]
    Config(String),
}

#[async_trait]
pub trait AgentService: Send + Sync + std::fmt::Debug {
    /// Start the task described by `ctx`.
    async fn open_stream(
        &self,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<ByteStream, AgentServiceError>;

    /// Continue an interrupted task. `decisions` are forwarded in order.
    async fn open_resume_stream(
        &self,
        ctx: &RunContext,
        decisions: &[Decision],
        cancel: &CancellationToken,
    ) -> Result<ByteStream, AgentServiceError>;
}
