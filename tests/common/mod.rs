#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_run_orchestrator::runs::domain::{AgentRun, Decision, RunContext, RunStatus};
use agent_run_orchestrator::runs::persistence::providers::memory::MemoryRunStore;
use agent_run_orchestrator::runs::persistence::{LogStore, MetadataStore, RunKeys};
use agent_run_orchestrator::runs::runtime::{RunController, StartRun};
use agent_run_orchestrator::runs::upstream::{AgentService, AgentServiceError, ByteStream};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

/// What the fake agent service does for one call.
#[derive(Debug, Clone)]
pub enum Script {
    /// Emit each line (newline-terminated) as its own chunk, then close.
    Lines(Vec<&'static str>),
    /// Emit the lines, then keep the stream open until the run is cancelled.
    LinesThenHang(Vec<&'static str>),
    /// Emit the lines, then fail the connection.
    LinesThenError(Vec<&'static str>, &'static str),
    /// Refuse the connection.
    Refuse,
    /// Never finish connecting; only cancellation ends the call.
    HangOnConnect,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub resume: bool,
    pub ctx: RunContext,
    pub decisions: Vec<Decision>,
}

/// In-process stand-in for the Agent Execution Service.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    scripts: Mutex<VecDeque<Script>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedAgent {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    async fn play(
        &self,
        call: Call,
        cancel: &CancellationToken,
    ) -> Result<ByteStream, AgentServiceError> {
        self.calls.lock().unwrap().push(call);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Lines(Vec::new()));

        match script {
            Script::Refuse => Err(AgentServiceError::Unavailable("connection refused".into())),
            Script::HangOnConnect => {
                cancel.cancelled().await;
                Err(AgentServiceError::Cancelled)
            }
            Script::Lines(lines) => Ok(Box::pin(futures::stream::iter(chunks(&lines)))),
            Script::LinesThenHang(lines) => Ok(Box::pin(
                futures::stream::iter(chunks(&lines)).chain(futures::stream::pending()),
            )),
            Script::LinesThenError(lines, message) => {
                let mut items = chunks(&lines);
                items.push(Err(AgentServiceError::Stream(message.to_string())));
                Ok(Box::pin(futures::stream::iter(items)))
            }
        }
    }
}

fn chunks(lines: &[&'static str]) -> Vec<Result<Bytes, AgentServiceError>> {
    lines
        .iter()
        .map(|line| Ok(Bytes::from(format!("{line}\n"))))
        .collect()
}

#[async_trait]
impl AgentService for ScriptedAgent {
    async fn open_stream(
        &self,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<ByteStream, AgentServiceError> {
        let call = Call {
            resume: false,
            ctx: ctx.clone(),
            decisions: Vec::new(),
        };
        self.play(call, cancel).await
    }

    async fn open_resume_stream(
        &self,
        ctx: &RunContext,
        decisions: &[Decision],
        cancel: &CancellationToken,
    ) -> Result<ByteStream, AgentServiceError> {
        let call = Call {
            resume: true,
            ctx: ctx.clone(),
            decisions: decisions.to_vec(),
        };
        self.play(call, cancel).await
    }
}

pub struct Harness {
    pub controller: RunController,
    pub agent: Arc<ScriptedAgent>,
    pub store: Arc<MemoryRunStore>,
}

pub fn harness(scripts: impl IntoIterator<Item = Script>) -> Harness {
    let agent = ScriptedAgent::new(scripts);
    let store = Arc::new(MemoryRunStore::new());
    let controller = controller_on(&agent, &store);
    Harness {
        controller,
        agent,
        store,
    }
}

/// A controller sharing `store`, as a second process would.
pub fn controller_on(agent: &Arc<ScriptedAgent>, store: &Arc<MemoryRunStore>) -> RunController {
    RunController::new(
        Arc::clone(agent) as Arc<dyn AgentService>,
        Arc::clone(store) as Arc<dyn LogStore>,
        Arc::clone(store) as Arc<dyn MetadataStore>,
        RunKeys::default(),
        Duration::from_secs(3600),
    )
}

pub fn start_request(prompt: &str) -> StartRun {
    StartRun {
        workspace_id: "ws-1".into(),
        persona: "research".into(),
        prompt: prompt.into(),
        credential: Some("user-token".into()),
        ..StartRun::default()
    }
}

/// Poll until the run reaches `wanted`, returning every status observed.
pub async fn wait_for(
    controller: &RunController,
    run_id: &str,
    wanted: RunStatus,
) -> (AgentRun, Vec<RunStatus>) {
    let mut seen = Vec::new();
    for _ in 0..400 {
        if let Some(run) = controller.status(run_id).await.unwrap() {
            if seen.last() != Some(&run.status) {
                seen.push(run.status);
            }
            if run.status == wanted {
                return (run, seen);
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("run {run_id} never reached {wanted}; observed {seen:?}");
}

/// Wait until the controller has released the run's pipeline.
pub async fn wait_idle(controller: &RunController, run_id: &str) {
    for _ in 0..400 {
        if !controller.has_live_pipeline(run_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("pipeline of {run_id} never finished");
}

pub async fn log_lines(controller: &RunController, run_id: &str) -> Vec<String> {
    controller
        .events(run_id, None, 10_000)
        .await
        .unwrap()
        .iter()
        .map(|entry| entry.data().unwrap_or_default().to_string())
        .collect()
}

pub fn line_type(line: &str) -> String {
    let value: serde_json::Value = serde_json::from_str(line).unwrap();
    value["type"].as_str().unwrap_or_default().to_string()
}
