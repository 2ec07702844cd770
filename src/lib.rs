//! Agent Run Orchestrator
//!
//! Runs agent turns as background, durable, replayable executions. A run is
//! started over HTTP, its output stream from the Agent Execution Service is
//! recorded line by line into an ordered log, and its lifecycle
//! (`queued` → `running` → `completed`/`failed`/`cancelled`, or paused at
//! `awaiting_approval`) is published as metadata that any process can read.
//!
//! # Modules
//!
//! - [`config`]: layered configuration (defaults, YAML, env, CLI)
//! - [`runs`]: run domain, stores, upstream client, runtime and HTTP API
//! - [`server`]: state wiring, router and middleware stack

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::unused_async)]

pub mod config;
pub mod runs;
pub mod server;

use crate::config::AppConfig;
use crate::runs::runtime::RunController;
use crate::runs::security::rate_limit::TokenBucket;
use std::sync::Arc;

/// Application state shared across all handlers and middleware.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Owner of every run launched by this process.
    pub controller: RunController,
    /// Admission limit, consulted only when enabled in config
    pub rate_limiter: Arc<TokenBucket>,
    /// Global Configuration
    pub config: Arc<AppConfig>,
}
