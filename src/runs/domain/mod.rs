pub mod context;
pub mod events;
pub mod run;

pub use context::{Decision, DecisionKind, RunContext};
pub use events::{LineKind, classify_line};
pub use run::{AgentRun, RunStatus};
