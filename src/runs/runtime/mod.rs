pub mod controller;
pub mod framer;
pub mod pipeline;
pub mod registry;

pub use controller::{RunAccepted, RunController, StartRun};
pub use pipeline::{IngestPipeline, PipelineOutcome};
