//! Structural classification of upstream NDJSON lines.
//!
//! The orchestrator treats agent events as opaque except for two reserved
//! shapes, selected by the `type` discriminator.

/// Discriminator value of an interrupt event.
pub const INTERRUPT_TYPE: &str = "interrupt";
/// Discriminator value of a contract-error event.
pub const CONTRACT_ERROR_TYPE: &str = "contract_error";
/// Discriminator value of the synthetic cancellation line.
pub const CANCELLED_TYPE: &str = "cancelled";
/// Message used when a contract-error event carries no readable message.
pub const DEFAULT_CONTRACT_ERROR: &str = "Agent output failed contract validation";

/// What the ingest pipeline needs to know about a single line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    /// The agent is pausing for a human decision. Carries the raw line.
    Interrupt(String),
    /// The agent reported its own output as invalid.
    ContractError(String),
    /// Anything else, relayed untouched.
    Opaque,
}

/// Classify one trimmed line. Lines that are not JSON objects are opaque.
pub fn classify_line(line: &str) -> LineKind {
    let Ok(serde_json::Value::Object(event)) = serde_json::from_str::<serde_json::Value>(line)
    else {
        return LineKind::Opaque;
    };
    match event.get("type").and_then(serde_json::Value::as_str) {
        Some(INTERRUPT_TYPE) => LineKind::Interrupt(line.to_string()),
        Some(CONTRACT_ERROR_TYPE) => {
            let message = event
                .get("message")
                .and_then(serde_json::Value::as_str)
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .unwrap_or(DEFAULT_CONTRACT_ERROR);
            LineKind::ContractError(message.to_string())
        }
        _ => LineKind::Opaque,
    }
}

/// Synthetic `error` line appended when the upstream fails.
pub fn error_line(message: &str) -> String {
    serde_json::json!({ "type": "error", "message": message }).to_string()
}

/// Synthetic terminal line appended when a run ends by cancellation.
pub fn cancelled_line() -> String {
    serde_json::json!({ "type": CANCELLED_TYPE, "message": "Run cancelled" }).to_string()
}

/// Whether `line` is the synthetic cancellation line.
pub fn is_cancelled_line(line: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|event| event.get("type")?.as_str().map(|t| t == CANCELLED_TYPE))
        .unwrap_or(false)
}
