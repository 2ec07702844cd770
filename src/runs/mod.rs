//! Agent runs: durable, replayable execution of one agent turn.
//!
//! - [`domain`]: run status, resume context and line classification
//! - [`persistence`]: log and metadata store traits with their providers
//! - [`upstream`]: client for the Agent Execution Service
//! - [`runtime`]: stream ingest, registries and the run controller
//! - [`api`]: HTTP routes and SSE replay

pub mod api;
pub mod domain;
pub mod error;
pub mod persistence;
pub mod runtime;
pub mod security;
pub mod telemetry;
pub mod upstream;
