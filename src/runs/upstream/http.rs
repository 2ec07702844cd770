//! HTTP driver for the Agent Execution Service.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{AgentService, AgentServiceError, ByteStream};
use crate::config::AgentServiceConfig;
use crate::runs::domain::{Decision, RunContext};

/// Talks to the agent service over `POST .../chat/stream` and
/// `POST .../chat/resume`.
#[derive(Clone)]
pub struct HttpAgentService {
    http: reqwest::Client,
    base_url: Url,
}

impl std::fmt::Debug for HttpAgentService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAgentService")
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

impl HttpAgentService {
    pub fn new(config: &AgentServiceConfig) -> Result<Self, AgentServiceError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| AgentServiceError::Config(format!("{}: {e}", config.base_url)))?;

        let mut builder =
            reqwest::Client::builder().connect_timeout(Duration::from_secs(config.connect_timeout_secs));
        if let Some(secs) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let http = builder
            .build()
            .map_err(|e| AgentServiceError::Config(e.to_string()))?;

        Ok(Self { http, base_url })
    }

    /// `{base}/agents/{persona}/workspace/{workspace}/chat/{action}`, with
    /// each segment percent-encoded.
    fn endpoint(&self, ctx: &RunContext, action: &str) -> Result<Url, AgentServiceError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| AgentServiceError::Config(format!("{} cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .extend([
                "agents",
                ctx.persona.as_str(),
                "workspace",
                ctx.workspace_id.as_str(),
                "chat",
                action,
            ]);
        Ok(url)
    }

    async fn post_stream(
        &self,
        url: Url,
        body: serde_json::Value,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<ByteStream, AgentServiceError> {
        let mut rb = self.http.post(url).json(&body);
        if let Some(credential) = &ctx.credential {
            rb = rb.bearer_auth(credential);
        }

        let resp = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(AgentServiceError::Cancelled),
            resp = rb.send() => resp.map_err(|e| AgentServiceError::Unavailable(e.to_string()))?,
        };

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(AgentServiceError::AgentNotFound(ctx.persona.clone()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AgentServiceError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| AgentServiceError::Stream(e.to_string())));
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl AgentService for HttpAgentService {
    async fn open_stream(
        &self,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<ByteStream, AgentServiceError> {
        let url = self.endpoint(ctx, "stream")?;
        let body = serde_json::json!({
            "message": ctx.prompt,
            "history": ctx.history,
            "forceReset": ctx.force_reset,
        });
        self.post_stream(url, body, ctx, cancel).await
    }

    async fn open_resume_stream(
        &self,
        ctx: &RunContext,
        decisions: &[Decision],
        cancel: &CancellationToken,
    ) -> Result<ByteStream, AgentServiceError> {
        let url = self.endpoint(ctx, "resume")?;
        let body = serde_json::json!({ "decisions": decisions });
        self.post_stream(url, body, ctx, cancel).await
    }
}
