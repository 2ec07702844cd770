use serde::{Deserialize, Serialize};

/// Original task parameters of a run, kept so `resume` can continue it.
#[derive(Clone, Default)]
pub struct RunContext {
    pub workspace_id: String,
    pub persona: String,
    pub prompt: String,
    pub history: Option<Vec<serde_json::Value>>,
    pub force_reset: bool,
    /// Caller-scoped credential forwarded to the agent service.
    pub credential: Option<String>,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("workspace_id", &self.workspace_id)
            .field("persona", &self.persona)
            .field("prompt_len", &self.prompt.len())
            .field("history_len", &self.history.as_ref().map(Vec::len))
            .field("force_reset", &self.force_reset)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A human decision answering one pending interrupt request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    #[serde(rename = "type")]
    pub kind: DecisionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_action: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DecisionKind {
    Approve,
    Edit,
    Reject,
}

impl Decision {
    pub fn approve() -> Self {
        Self {
            kind: DecisionKind::Approve,
            edited_action: None,
            message: None,
        }
    }
}
